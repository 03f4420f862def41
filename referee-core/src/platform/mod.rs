mod extractor;
mod registry;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::browser::Locator;
use crate::config::{ExtractionSection, PlatformSection, PlatformSelectors, SecondFactorHints};

pub use extractor::{
    Extractor, ExtractorError, ExtractorResult, RawRecord, RecordKind, ScriptExtractor,
};
pub use registry::{PlatformRegistry, RegisteredPlatform};

/// Login ritual families. Every portal is one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlatformKind {
    /// Identity and secret on one form, second factor only if prompted.
    Credentials,
    /// Login happens in a secondary window opened by the portal.
    OauthRedirect,
    /// Identity only; a code mailed to the account finishes the login.
    EmailCode,
}

impl PlatformKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlatformKind::Credentials => "credentials",
            PlatformKind::OauthRedirect => "oauth_redirect",
            PlatformKind::EmailCode => "email_code",
        }
    }
}

impl fmt::Display for PlatformKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct PlatformSpec {
    pub id: String,
    pub kind: PlatformKind,
    pub login_url: String,
    pub home_url: String,
    pub session_ttl: chrono::Duration,
    pub selectors: PlatformSelectors,
    pub second_factor: SecondFactorHints,
    pub extraction: ExtractionSection,
}

impl PlatformSpec {
    pub fn from_section(section: &PlatformSection, default_ttl_seconds: u64) -> Self {
        Self {
            id: section.id.clone(),
            kind: section.kind,
            login_url: section.login_url.clone(),
            home_url: section.home_url.clone(),
            session_ttl: section.session_ttl(default_ttl_seconds),
            selectors: section.selectors.clone(),
            second_factor: section.second_factor.clone().unwrap_or_default(),
            extraction: section.extraction.clone(),
        }
    }

    /// Present only once the portal considers the context logged in.
    pub fn authenticated_locator(&self) -> Locator {
        Locator::parse(&self.selectors.authenticated)
    }
}
