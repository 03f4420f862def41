use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::failure::{ErrorKind, ExtractionError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthState {
    NotAuthenticated,
    CredentialsSubmitted,
    AwaitingSecondFactor,
    Authenticated,
    Failed,
}

impl AuthState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthState::NotAuthenticated => "not_authenticated",
            AuthState::CredentialsSubmitted => "credentials_submitted",
            AuthState::AwaitingSecondFactor => "awaiting_second_factor",
            AuthState::Authenticated => "authenticated",
            AuthState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, AuthState::Authenticated | AuthState::Failed)
    }

    fn can_enter(&self, next: AuthState) -> bool {
        use AuthState::*;
        match (self, next) {
            (from, _) if from.is_terminal() => false,
            (_, Failed) => true,
            (NotAuthenticated, CredentialsSubmitted) => true,
            (CredentialsSubmitted, AwaitingSecondFactor | Authenticated) => true,
            (AwaitingSecondFactor, Authenticated) => true,
            _ => false,
        }
    }
}

impl fmt::Display for AuthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("illegal auth transition {from} -> {to}")]
pub struct IllegalTransition {
    pub from: AuthState,
    pub to: AuthState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StepOutcome {
    Completed,
    Failed { kind: ErrorKind },
}

#[derive(Debug, Clone, Serialize)]
pub struct StepRecord {
    pub name: String,
    pub state_before: AuthState,
    pub outcome: StepOutcome,
    pub elapsed_ms: u64,
}

/// One run of the login state machine. Discarded once terminal.
#[derive(Debug, Clone, Serialize)]
pub struct AuthAttempt {
    platform_id: String,
    state: AuthState,
    step_history: Vec<StepRecord>,
    started_at: DateTime<Utc>,
    last_error: Option<ExtractionError>,
}

impl AuthAttempt {
    pub fn new(platform_id: impl Into<String>) -> Self {
        Self {
            platform_id: platform_id.into(),
            state: AuthState::NotAuthenticated,
            step_history: Vec::new(),
            started_at: Utc::now(),
            last_error: None,
        }
    }

    pub fn platform_id(&self) -> &str {
        &self.platform_id
    }

    pub fn state(&self) -> AuthState {
        self.state
    }

    pub fn step_history(&self) -> &[StepRecord] {
        &self.step_history
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn last_error(&self) -> Option<&ExtractionError> {
        self.last_error.as_ref()
    }

    pub fn transition(&mut self, next: AuthState) -> Result<(), IllegalTransition> {
        if !self.state.can_enter(next) {
            return Err(IllegalTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    /// Moves to `Failed`. Returns the error back so callers can propagate it.
    pub fn fail(&mut self, error: ExtractionError) -> ExtractionError {
        if !self.state.is_terminal() {
            self.state = AuthState::Failed;
            self.last_error = Some(error.clone());
        }
        error
    }

    pub fn record_step(&mut self, name: &str, state_before: AuthState, outcome: StepOutcome, elapsed_ms: u64) {
        self.step_history.push(StepRecord {
            name: name.to_string(),
            state_before,
            outcome,
            elapsed_ms,
        });
    }

    pub fn steps_attempted(&self) -> impl Iterator<Item = &str> {
        self.step_history.iter().map(|record| record.name.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn follows_the_forward_path() {
        let mut attempt = AuthAttempt::new("mf");
        attempt.transition(AuthState::CredentialsSubmitted).unwrap();
        attempt.transition(AuthState::AwaitingSecondFactor).unwrap();
        attempt.transition(AuthState::Authenticated).unwrap();
        assert!(attempt.state().is_terminal());
    }

    #[test]
    fn terminal_states_are_final() {
        let mut attempt = AuthAttempt::new("mf");
        attempt.fail(ExtractionError::new(ErrorKind::Timeout, "slow").at_step("submit"));
        assert_eq!(attempt.state(), AuthState::Failed);
        let err = attempt.transition(AuthState::CredentialsSubmitted).unwrap_err();
        assert_eq!(err.from, AuthState::Failed);

        attempt.fail(ExtractionError::new(ErrorKind::CredentialRejected, "later"));
        assert_eq!(attempt.last_error().unwrap().kind, ErrorKind::Timeout);
    }

    #[test]
    fn cannot_skip_credentials() {
        let mut attempt = AuthAttempt::new("sicon");
        assert!(attempt.transition(AuthState::Authenticated).is_err());
        assert!(attempt.transition(AuthState::AwaitingSecondFactor).is_err());
        assert_eq!(attempt.state(), AuthState::NotAuthenticated);
    }
}
