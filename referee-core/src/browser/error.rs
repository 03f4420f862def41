use thiserror::Error;

pub type BrowserResult<T> = Result<T, BrowserError>;

#[derive(Debug, Error)]
pub enum BrowserError {
    #[error("chromium launch failed: {0}")]
    Launch(String),
    #[error("cdp error: {0}")]
    Cdp(#[from] chromiumoxide::error::CdpError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("timeout waiting for {0}")]
    Timeout(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("profile error: {0}")]
    Profile(String),
    #[error("navigation failed: {0}")]
    Navigation(String),
    #[error("element not found: {0}")]
    ElementNotFound(String),
    #[error("script evaluation failed: {0}")]
    Script(String),
    #[error("secondary window error: {0}")]
    Popup(String),
    #[error("context state error: {0}")]
    State(String),
    #[error("browser process unavailable: {0}")]
    ProcessGone(String),
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl BrowserError {
    /// True when the engine itself can no longer be trusted, as opposed to the page.
    pub fn is_engine_failure(&self) -> bool {
        match self {
            BrowserError::Launch(_) | BrowserError::ProcessGone(_) => true,
            BrowserError::Cdp(err) => {
                let text = err.to_string().to_lowercase();
                text.contains("channel closed")
                    || text.contains("connection closed")
                    || text.contains("no response")
                    || text.contains("websocket")
                    || text.contains("send failed")
            }
            _ => false,
        }
    }
}

impl From<tokio::task::JoinError> for BrowserError {
    fn from(err: tokio::task::JoinError) -> Self {
        BrowserError::Unexpected(err.to_string())
    }
}
