use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{ConfigError, Result};
use crate::platform::PlatformKind;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RefereeConfig {
    pub chromium: ChromiumSection,
    pub pool: PoolSection,
    pub workers: WorkersSection,
    pub auth: AuthSection,
    pub session: SessionSection,
    pub retry: RetryConfig,
    pub second_factor: SecondFactorSection,
    pub observability: ObservabilitySection,
    #[serde(default)]
    pub platforms: Vec<PlatformSection>,
}

impl RefereeConfig {
    /// Resolves a configured path relative to the directory holding the config file.
    pub fn resolve_path<P: AsRef<Path>>(&self, base_dir: &Path, candidate: P) -> PathBuf {
        let path = candidate.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            base_dir.join(path)
        }
    }

    pub fn platform(&self, id: &str) -> Option<&PlatformSection> {
        self.platforms.iter().find(|platform| platform.id == id)
    }

    pub fn validate(&self) -> Result<()> {
        if self.pool.processes == 0 {
            return Err(ConfigError::Invalid("pool.processes must be at least 1".into()));
        }
        if self.pool.contexts_per_process == 0 {
            return Err(ConfigError::Invalid(
                "pool.contexts_per_process must be at least 1".into(),
            ));
        }
        if self.pool.acquire_timeout_seconds == 0 {
            return Err(ConfigError::Invalid(
                "pool.acquire_timeout_seconds must be positive".into(),
            ));
        }
        if self.workers.count == 0 || self.workers.queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "workers.count and workers.queue_capacity must be at least 1".into(),
            ));
        }
        if self.auth.step_timeout_seconds == 0 {
            return Err(ConfigError::Invalid(
                "auth.step_timeout_seconds must be positive".into(),
            ));
        }
        regex::Regex::new(&self.second_factor.code_pattern).map_err(|err| {
            ConfigError::Invalid(format!("second_factor.code_pattern is not a regex: {err}"))
        })?;
        let mut seen = HashSet::new();
        for platform in &self.platforms {
            if !seen.insert(platform.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate platform id {}",
                    platform.id
                )));
            }
            platform.validate()?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChromiumSection {
    pub executable_path: String,
    pub headless: bool,
    pub sandbox: bool,
    pub disable_gpu: bool,
    pub profile_dir: String,
    pub request_timeout_seconds: Option<u64>,
    pub user_agent: Option<String>,
    pub lang: Option<String>,
    #[serde(default)]
    pub extra_args: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PoolSection {
    pub processes: usize,
    pub contexts_per_process: usize,
    pub acquire_timeout_seconds: u64,
    pub probe_timeout_seconds: u64,
    pub close_timeout_seconds: u64,
    pub poison_window_seconds: u64,
}

impl PoolSection {
    pub fn capacity(&self) -> usize {
        self.processes * self.contexts_per_process
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_seconds)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_seconds.max(1))
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_secs(self.close_timeout_seconds.max(1))
    }

    pub fn poison_window(&self) -> Duration {
        Duration::from_secs(self.poison_window_seconds)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkersSection {
    pub count: usize,
    pub queue_capacity: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthSection {
    pub step_timeout_seconds: u64,
    pub poll_interval_ms: u64,
    pub second_factor_deadline_seconds: u64,
    pub popup_timeout_seconds: u64,
}

impl AuthSection {
    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_seconds)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(10))
    }

    pub fn second_factor_deadline(&self) -> Duration {
        Duration::from_secs(self.second_factor_deadline_seconds)
    }

    pub fn popup_timeout(&self) -> Duration {
        Duration::from_secs(self.popup_timeout_seconds.max(1))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionSection {
    pub ttl_seconds: u64,
    pub database: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    pub navigation: RetrySection,
    pub resource_acquisition: RetrySection,
    pub authentication: RetrySection,
    pub extraction: RetrySection,
    /// Fixed RNG seed for jitter; unset means entropy-seeded.
    pub seed: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetrySection {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_ratio: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecondFactorMode {
    Mailbox,
    Manual,
    MailboxWithManualFallback,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SecondFactorSection {
    pub mode: SecondFactorMode,
    pub mailbox_url: Option<String>,
    pub mailbox_token_env: Option<String>,
    pub poll_interval_seconds: u64,
    pub code_pattern: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilitySection {
    pub failure_log: String,
    pub metrics_db: String,
    pub results_db: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlatformSection {
    pub id: String,
    pub kind: PlatformKind,
    pub login_url: String,
    pub home_url: String,
    pub session_ttl_seconds: Option<u64>,
    pub selectors: PlatformSelectors,
    #[serde(default)]
    pub second_factor: Option<SecondFactorHints>,
    pub extraction: ExtractionSection,
}

impl PlatformSection {
    fn validate(&self) -> Result<()> {
        for (field, value) in [("login_url", &self.login_url), ("home_url", &self.home_url)] {
            url::Url::parse(value).map_err(|err| {
                ConfigError::Invalid(format!("platform {} has invalid {field}: {err}", self.id))
            })?;
        }
        let selectors = &self.selectors;
        let require = |field: &str, value: &Option<String>| -> Result<()> {
            if value.as_deref().map(str::trim).unwrap_or_default().is_empty() {
                Err(ConfigError::Invalid(format!(
                    "platform {} ({}) requires selectors.{field}",
                    self.id, self.kind
                )))
            } else {
                Ok(())
            }
        };
        match self.kind {
            PlatformKind::Credentials => {
                require("secret", &selectors.secret)?;
            }
            PlatformKind::OauthRedirect => {
                require("oauth_trigger", &selectors.oauth_trigger)?;
                require("oauth_authorize", &selectors.oauth_authorize)?;
                require("secret", &selectors.secret)?;
            }
            PlatformKind::EmailCode => {
                require("second_factor_prompt", &selectors.second_factor_prompt)?;
            }
        }
        if selectors.second_factor_prompt.is_some() {
            require("second_factor_input", &selectors.second_factor_input)?;
        }
        Ok(())
    }

    pub fn session_ttl(&self, default_seconds: u64) -> chrono::Duration {
        let seconds = self.session_ttl_seconds.unwrap_or(default_seconds);
        chrono::Duration::seconds(seconds.min(i64::MAX as u64) as i64)
    }
}

/// Locators are CSS selectors unless prefixed with `text=`.
#[derive(Debug, Clone, Deserialize)]
pub struct PlatformSelectors {
    pub identity: String,
    pub secret: Option<String>,
    pub submit: String,
    pub authenticated: String,
    pub rejected: Option<String>,
    pub second_factor_prompt: Option<String>,
    pub second_factor_input: Option<String>,
    pub second_factor_submit: Option<String>,
    pub oauth_trigger: Option<String>,
    pub oauth_authorize: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SecondFactorHints {
    pub sender: Option<String>,
    pub subject_contains: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExtractionSection {
    pub url: String,
    pub script: String,
    #[serde(default = "default_extraction_timeout")]
    pub timeout_seconds: u64,
}

impl ExtractionSection {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

fn default_extraction_timeout() -> u64 {
    60
}

pub fn load_referee_config<P: AsRef<Path>>(path: P) -> Result<RefereeConfig> {
    let config: RefereeConfig = load_toml(path)?;
    config.validate()?;
    Ok(config)
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture_path() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("../configs/referee.toml")
    }

    #[test]
    fn load_fixture_config() {
        let config = load_referee_config(fixture_path()).expect("fixture should parse");
        assert_eq!(config.pool.capacity(), 4);
        assert_eq!(config.retry.authentication.max_attempts, 2);
        assert!(config.platforms.len() >= 3);
        let oauth = config.platform("sicon").expect("sicon platform");
        assert_eq!(oauth.kind, PlatformKind::OauthRedirect);
        assert_eq!(
            oauth.session_ttl(config.session.ttl_seconds),
            chrono::Duration::seconds(900)
        );
    }

    #[test]
    fn rejects_duplicate_platforms() {
        let mut config = load_referee_config(fixture_path()).unwrap();
        let first = config.platforms[0].clone();
        config.platforms.push(first);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate platform id"));
    }

    #[test]
    fn rejects_oauth_platform_without_trigger() {
        let mut config = load_referee_config(fixture_path()).unwrap();
        let platform = config
            .platforms
            .iter_mut()
            .find(|platform| platform.kind == PlatformKind::OauthRedirect)
            .unwrap();
        platform.selectors.oauth_trigger = None;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("oauth_trigger"));
    }

    #[test]
    fn rejects_empty_pool() {
        let mut config = load_referee_config(fixture_path()).unwrap();
        config.pool.processes = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}
