use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::platform::{PlatformKind, PlatformRegistry};

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("no credentials configured for platform {platform} (expected {variable})")]
    Missing { platform: String, variable: String },
    #[error("unknown platform: {0}")]
    UnknownPlatform(String),
}

pub type CredentialResult<T> = Result<T, CredentialError>;

/// String that never shows up in `Debug` or `Display` output.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***")
    }
}

#[derive(Debug, Clone)]
pub struct Credentials {
    pub identity: String,
    pub secret: Secret,
    pub kind: PlatformKind,
}

impl Credentials {
    /// Short stable digest of the identity, safe to log.
    pub fn identity_fingerprint(&self) -> String {
        let digest = Sha256::digest(self.identity.as_bytes());
        hex::encode(&digest[..6])
    }
}

#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn get_credentials(&self, platform_id: &str) -> CredentialResult<Credentials>;
}

/// Reads `REFEREE_<PLATFORM>_IDENTITY` and `REFEREE_<PLATFORM>_SECRET`.
#[derive(Debug, Clone, Default)]
pub struct EnvCredentialSource {
    kinds: HashMap<String, PlatformKind>,
}

impl EnvCredentialSource {
    pub fn from_registry(registry: &PlatformRegistry) -> Self {
        Self {
            kinds: registry
                .iter()
                .map(|platform| (platform.spec.id.clone(), platform.spec.kind))
                .collect(),
        }
    }

    pub fn variable_names(platform_id: &str) -> (String, String) {
        let stem: String = platform_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        (
            format!("REFEREE_{stem}_IDENTITY"),
            format!("REFEREE_{stem}_SECRET"),
        )
    }
}

#[async_trait]
impl CredentialSource for EnvCredentialSource {
    async fn get_credentials(&self, platform_id: &str) -> CredentialResult<Credentials> {
        let kind = *self
            .kinds
            .get(platform_id)
            .ok_or_else(|| CredentialError::UnknownPlatform(platform_id.to_string()))?;
        let (identity_var, secret_var) = Self::variable_names(platform_id);
        let read = |variable: &str| {
            std::env::var(variable)
                .ok()
                .filter(|value| !value.trim().is_empty())
                .ok_or_else(|| CredentialError::Missing {
                    platform: platform_id.to_string(),
                    variable: variable.to_string(),
                })
        };
        let identity = read(&identity_var)?;
        // Email-code portals only ask for the identity.
        let secret = match kind {
            PlatformKind::EmailCode => std::env::var(&secret_var).unwrap_or_default(),
            _ => read(&secret_var)?,
        };
        Ok(Credentials {
            identity,
            secret: Secret::new(secret),
            kind,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct StaticCredentialSource {
    entries: HashMap<String, Credentials>,
}

impl StaticCredentialSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(
        mut self,
        platform_id: impl Into<String>,
        kind: PlatformKind,
        identity: impl Into<String>,
        secret: impl Into<String>,
    ) -> Self {
        self.entries.insert(
            platform_id.into(),
            Credentials {
                identity: identity.into(),
                secret: Secret::new(secret),
                kind,
            },
        );
        self
    }
}

#[async_trait]
impl CredentialSource for StaticCredentialSource {
    async fn get_credentials(&self, platform_id: &str) -> CredentialResult<Credentials> {
        self.entries
            .get(platform_id)
            .cloned()
            .ok_or_else(|| CredentialError::Missing {
                platform: platform_id.to_string(),
                variable: "static entry".to_string(),
            })
    }
}
