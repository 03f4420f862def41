//! Engine seams. The pool and the auth state machine only speak these traits,
//! so they run unchanged against Chromium or a scripted test engine.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::error::{BrowserError, BrowserResult};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Locator {
    Css(String),
    Text(String),
}

impl Locator {
    pub fn css(selector: impl Into<String>) -> Self {
        Locator::Css(selector.into())
    }

    pub fn text(text: impl Into<String>) -> Self {
        Locator::Text(text.into())
    }

    /// `text=Sign in` becomes a text locator, anything else is CSS.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().strip_prefix("text=") {
            Some(text) => Locator::Text(text.trim().to_string()),
            None => Locator::Css(raw.trim().to_string()),
        }
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Locator::Css(selector) => f.write_str(selector),
            Locator::Text(text) => write!(f, "text={text}"),
        }
    }
}

/// Captured cookies and storage of one isolated context.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextState {
    pub cookies: Vec<serde_json::Value>,
    pub local_storage: BTreeMap<String, BTreeMap<String, String>>,
}

impl ContextState {
    pub fn to_blob(&self) -> BrowserResult<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|err| BrowserError::State(format!("failed to encode context state: {err}")))
    }

    pub fn from_blob(blob: &[u8]) -> BrowserResult<Self> {
        serde_json::from_slice(blob)
            .map_err(|err| BrowserError::State(format!("failed to decode context state: {err}")))
    }

    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty() && self.local_storage.is_empty()
    }
}

#[async_trait]
pub trait BrowserEngine: Send + Sync {
    async fn launch(&self) -> BrowserResult<Box<dyn BrowserProcess>>;
}

#[async_trait]
pub trait BrowserProcess: Send + Sync {
    fn id(&self) -> &str;
    fn is_alive(&self) -> bool;
    async fn new_context(&self) -> BrowserResult<Box<dyn BrowserSession>>;
    async fn shutdown(&self) -> BrowserResult<()>;
}

/// One isolated browsing context and its active page.
#[async_trait]
pub trait BrowserSession: Send {
    fn context_id(&self) -> &str;
    async fn navigate(&mut self, url: &str) -> BrowserResult<()>;
    async fn fill(&mut self, locator: &Locator, value: &str) -> BrowserResult<()>;
    async fn click(&mut self, locator: &Locator) -> BrowserResult<()>;
    async fn press_enter(&mut self, locator: &Locator) -> BrowserResult<()>;
    async fn is_present(&mut self, locator: &Locator) -> BrowserResult<bool>;
    async fn text_contains(&mut self, needle: &str) -> BrowserResult<bool>;
    async fn current_url(&mut self) -> BrowserResult<String>;
    async fn evaluate_json(&mut self, script: &str) -> BrowserResult<serde_json::Value>;
    async fn export_state(&mut self) -> BrowserResult<ContextState>;
    async fn import_state(&mut self, state: &ContextState) -> BrowserResult<()>;
    async fn clear_state(&mut self) -> BrowserResult<()>;
    /// Cheap liveness check used when a lease is handed out.
    async fn probe(&mut self) -> BrowserResult<()>;
    /// Waits for a window opened by this page and returns it as its own session.
    async fn wait_for_popup(&mut self, timeout: Duration) -> BrowserResult<Box<dyn BrowserSession>>;
    async fn focus(&mut self) -> BrowserResult<()>;
    async fn close(self: Box<Self>) -> BrowserResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_text_locators() {
        assert_eq!(Locator::parse("text= Sign in "), Locator::text("Sign in"));
        assert_eq!(Locator::parse("#USERID"), Locator::css("#USERID"));
        assert_eq!(Locator::text("Log in").to_string(), "text=Log in");
    }

    #[test]
    fn state_blob_round_trips_exactly() {
        let mut state = ContextState::default();
        state.cookies.push(serde_json::json!({
            "name": "JSESSIONID",
            "value": "abc",
            "domain": ".mc.manuscriptcentral.com",
            "path": "/",
            "secure": true,
        }));
        state
            .local_storage
            .entry("https://mc.manuscriptcentral.com".into())
            .or_default()
            .insert("role".into(), "referee".into());
        let blob = state.to_blob().unwrap();
        let decoded = ContextState::from_blob(&blob).unwrap();
        assert_eq!(decoded, state);
        assert_eq!(decoded.to_blob().unwrap(), blob);
    }
}
