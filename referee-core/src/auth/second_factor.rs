use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::{sleep, timeout_at, Instant};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::{SecondFactorHints, SecondFactorSection};

#[derive(Debug, Error)]
pub enum SecondFactorError {
    #[error("mailbox request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid mailbox url: {0}")]
    Url(#[from] url::ParseError),
    #[error("invalid code pattern: {0}")]
    Pattern(#[from] regex::Error),
    #[error("second factor misconfigured: {0}")]
    Configuration(String),
}

pub type SecondFactorResult<T> = Result<T, SecondFactorError>;

/// Source of one-time codes. Returns `None` once `deadline` passes without a code.
///
/// `since` is when the login attempt began; codes issued before it belong to
/// an earlier attempt.
#[async_trait]
pub trait SecondFactorProvider: Send + Sync {
    async fn get_code(&self, platform_id: &str, since: DateTime<Utc>, deadline: Instant) -> Option<String>;
}

#[derive(Debug, Clone, Deserialize)]
pub struct MailMessage {
    pub id: String,
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub body: String,
    pub received_at: DateTime<Utc>,
}

#[async_trait]
pub trait Mailbox: Send + Sync {
    async fn fetch_since(&self, since: DateTime<Utc>) -> SecondFactorResult<Vec<MailMessage>>;
}

/// JSON inbox endpoint: `GET <url>?since=<rfc3339>` returning `[MailMessage]`.
#[derive(Debug, Clone)]
pub struct HttpMailbox {
    client: reqwest::Client,
    url: Url,
    token: Option<String>,
}

impl HttpMailbox {
    pub fn new(url: &str, token: Option<String>, request_timeout: Duration) -> SecondFactorResult<Self> {
        let client = reqwest::Client::builder().timeout(request_timeout).build()?;
        Ok(Self {
            client,
            url: Url::parse(url)?,
            token,
        })
    }
}

#[async_trait]
impl Mailbox for HttpMailbox {
    async fn fetch_since(&self, since: DateTime<Utc>) -> SecondFactorResult<Vec<MailMessage>> {
        let mut url = self.url.clone();
        url.query_pairs_mut()
            .append_pair("since", &since.to_rfc3339());
        let mut request = self.client.get(url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let messages = request
            .send()
            .await?
            .error_for_status()?
            .json::<Vec<MailMessage>>()
            .await?;
        Ok(messages)
    }
}

/// Polls a mailbox for the code a portal mailed after credential submission.
pub struct MailboxSecondFactor {
    mailbox: Arc<dyn Mailbox>,
    poll_interval: Duration,
    pattern: Regex,
    hints: HashMap<String, SecondFactorHints>,
    consumed: Mutex<HashSet<String>>,
}

impl MailboxSecondFactor {
    pub fn new(
        mailbox: Arc<dyn Mailbox>,
        poll_interval: Duration,
        code_pattern: &str,
    ) -> SecondFactorResult<Self> {
        Ok(Self {
            mailbox,
            poll_interval,
            pattern: Regex::new(code_pattern)?,
            hints: HashMap::new(),
            consumed: Mutex::new(HashSet::new()),
        })
    }

    pub fn from_config(
        section: &SecondFactorSection,
        hints: HashMap<String, SecondFactorHints>,
    ) -> SecondFactorResult<Self> {
        let url = section.mailbox_url.as_deref().ok_or_else(|| {
            SecondFactorError::Configuration("second_factor.mailbox_url is not set".into())
        })?;
        let token = section
            .mailbox_token_env
            .as_deref()
            .and_then(|variable| std::env::var(variable).ok());
        let mailbox = HttpMailbox::new(url, token, Duration::from_secs(15))?;
        Ok(Self::new(
            Arc::new(mailbox),
            Duration::from_secs(section.poll_interval_seconds.max(1)),
            &section.code_pattern,
        )?
        .with_hints(hints))
    }

    pub fn with_hints(mut self, hints: HashMap<String, SecondFactorHints>) -> Self {
        self.hints = hints;
        self
    }

    fn consumed(&self) -> MutexGuard<'_, HashSet<String>> {
        match self.consumed.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn matches_hints(hints: Option<&SecondFactorHints>, message: &MailMessage) -> bool {
        let Some(hints) = hints else {
            return true;
        };
        let sender_ok = hints
            .sender
            .as_deref()
            .map(|sender| message.from.to_lowercase().contains(&sender.to_lowercase()))
            .unwrap_or(true);
        let subject_ok = hints
            .subject_contains
            .as_deref()
            .map(|needle| message.subject.to_lowercase().contains(&needle.to_lowercase()))
            .unwrap_or(true);
        sender_ok && subject_ok
    }

    fn extract_code(&self, message: &MailMessage) -> Option<String> {
        [&message.body, &message.subject].into_iter().find_map(|text| {
            self.pattern.captures(text).map(|captures| {
                captures
                    .get(1)
                    .or_else(|| captures.get(0))
                    .map(|m| m.as_str().to_string())
                    .unwrap_or_default()
            })
        })
        .filter(|code| !code.is_empty())
    }

    /// Newest unconsumed matching code received at or after `since`,
    /// marking its message as used.
    pub fn pick_code(
        &self,
        platform_id: &str,
        since: DateTime<Utc>,
        mut messages: Vec<MailMessage>,
    ) -> Option<String> {
        messages.retain(|message| message.received_at >= since);
        messages.sort_by(|a, b| b.received_at.cmp(&a.received_at));
        let hints = self.hints.get(platform_id);
        let mut consumed = self.consumed();
        for message in messages {
            if consumed.contains(&message.id) || !Self::matches_hints(hints, &message) {
                continue;
            }
            if let Some(code) = self.extract_code(&message) {
                consumed.insert(message.id);
                return Some(code);
            }
        }
        None
    }
}

#[async_trait]
impl SecondFactorProvider for MailboxSecondFactor {
    async fn get_code(&self, platform_id: &str, since: DateTime<Utc>, deadline: Instant) -> Option<String> {
        loop {
            match timeout_at(deadline, self.mailbox.fetch_since(since)).await {
                Ok(Ok(messages)) => {
                    if let Some(code) = self.pick_code(platform_id, since, messages) {
                        info!(platform = platform_id, "verification code received by mail");
                        return Some(code);
                    }
                }
                Ok(Err(err)) => {
                    warn!(platform = platform_id, error = %err, "mailbox poll failed");
                }
                Err(_) => return None,
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            sleep(self.poll_interval.min(deadline - now)).await;
        }
    }
}

/// Codes typed in by an operator, e.g. from stdin.
#[derive(Debug, Default)]
pub struct ManualSecondFactor {
    codes: Mutex<HashMap<String, VecDeque<String>>>,
    arrived: Notify,
}

impl ManualSecondFactor {
    pub fn new() -> Self {
        Self::default()
    }

    fn codes(&self) -> MutexGuard<'_, HashMap<String, VecDeque<String>>> {
        match self.codes.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn submit(&self, platform_id: &str, code: &str) {
        self.codes()
            .entry(platform_id.to_string())
            .or_default()
            .push_back(code.trim().to_string());
        debug!(platform = platform_id, "manual verification code queued");
        self.arrived.notify_waiters();
    }

    fn take(&self, platform_id: &str) -> Option<String> {
        self.codes()
            .get_mut(platform_id)
            .and_then(|queue| queue.pop_front())
    }
}

#[async_trait]
impl SecondFactorProvider for ManualSecondFactor {
    async fn get_code(&self, platform_id: &str, _since: DateTime<Utc>, deadline: Instant) -> Option<String> {
        loop {
            let arrived = self.arrived.notified();
            if let Some(code) = self.take(platform_id) {
                return Some(code);
            }
            if timeout_at(deadline, arrived).await.is_err() {
                return self.take(platform_id);
            }
        }
    }
}

/// Gives the primary provider half of the deadline, then hands over.
pub struct FallbackSecondFactor {
    primary: Arc<dyn SecondFactorProvider>,
    fallback: Arc<dyn SecondFactorProvider>,
}

impl FallbackSecondFactor {
    pub fn new(primary: Arc<dyn SecondFactorProvider>, fallback: Arc<dyn SecondFactorProvider>) -> Self {
        Self { primary, fallback }
    }
}

#[async_trait]
impl SecondFactorProvider for FallbackSecondFactor {
    async fn get_code(&self, platform_id: &str, since: DateTime<Utc>, deadline: Instant) -> Option<String> {
        let now = Instant::now();
        let midpoint = now + deadline.saturating_duration_since(now) / 2;
        if let Some(code) = self.primary.get_code(platform_id, since, midpoint).await {
            return Some(code);
        }
        info!(platform = platform_id, "falling back to secondary code provider");
        self.fallback.get_code(platform_id, since, deadline).await
    }
}
