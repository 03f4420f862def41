use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::time::{sleep, timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::browser::{BrowserResult, BrowserSession, ErrorCategorizer, Locator};
use crate::config::AuthSection;
use crate::credentials::Credentials;
use crate::failure::{ErrorKind, ExtractionError};
use crate::session::SessionRoute;

use super::script::{
    AuthStep, LoginScript, SecondFactorScript, SecondaryWindowScript, StepAction, StepValue,
    SuccessPredicate,
};
use super::second_factor::SecondFactorProvider;
use super::state::{AuthAttempt, AuthState, StepOutcome};

#[derive(Debug, Clone)]
pub struct AuthSettings {
    pub step_timeout: Duration,
    pub poll_interval: Duration,
    pub second_factor_deadline: Duration,
    pub popup_timeout: Duration,
}

impl From<&AuthSection> for AuthSettings {
    fn from(section: &AuthSection) -> Self {
        Self {
            step_timeout: section.step_timeout(),
            poll_interval: section.poll_interval(),
            second_factor_deadline: section.second_factor_deadline(),
            popup_timeout: section.popup_timeout(),
        }
    }
}

#[derive(Debug)]
pub struct AuthOutcome {
    pub attempt: AuthAttempt,
    pub result: Result<SessionRoute, ExtractionError>,
    /// The engine itself misbehaved, so the context should not be reused.
    pub engine_failure: bool,
}

enum Landing {
    Authenticated,
    SecondFactorPrompt,
}

/// Drives one login attempt against a leased context. A failed attempt is
/// never resumed; callers start a new one from `NotAuthenticated`.
pub struct AuthStateMachine<'a> {
    script: &'a LoginScript,
    settings: &'a AuthSettings,
    second_factor: &'a dyn SecondFactorProvider,
    cancel: &'a CancellationToken,
    engine_failure: AtomicBool,
}

impl<'a> AuthStateMachine<'a> {
    pub fn new(
        script: &'a LoginScript,
        settings: &'a AuthSettings,
        second_factor: &'a dyn SecondFactorProvider,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            script,
            settings,
            second_factor,
            cancel,
            engine_failure: AtomicBool::new(false),
        }
    }

    pub async fn run(&self, session: &mut dyn BrowserSession, credentials: &Credentials) -> AuthOutcome {
        self.engine_failure.store(false, Ordering::SeqCst);
        let mut attempt = AuthAttempt::new(self.script.platform_id.clone());
        let result = match self.drive(session, credentials, &mut attempt).await {
            Ok(route) => {
                info!(
                    platform = %self.script.platform_id,
                    identity = %credentials.identity_fingerprint(),
                    route = %route,
                    steps = attempt.step_history().len(),
                    "authenticated"
                );
                Ok(route)
            }
            Err(error) => {
                warn!(
                    platform = %self.script.platform_id,
                    kind = %error.kind,
                    step = error.step_at_failure.as_deref().unwrap_or("-"),
                    state = %attempt.state(),
                    "authentication attempt failed"
                );
                Err(attempt.fail(error))
            }
        };
        AuthOutcome {
            attempt,
            result,
            engine_failure: self.engine_failure.load(Ordering::SeqCst),
        }
    }

    async fn drive(
        &self,
        session: &mut dyn BrowserSession,
        credentials: &Credentials,
        attempt: &mut AuthAttempt,
    ) -> Result<SessionRoute, ExtractionError> {
        let mut route = SessionRoute::Credentials;
        self.run_steps(session, &self.script.steps, credentials, attempt, "")
            .await?;
        if let Some(secondary) = &self.script.secondary {
            self.secondary_window(session, secondary, credentials, attempt)
                .await?;
            route = SessionRoute::SecondaryWindow;
        }
        enter(attempt, AuthState::CredentialsSubmitted, "submit_credentials")?;

        let prompt = self.script.second_factor.as_ref();
        match self
            .await_landing(session, attempt, "confirm_login", prompt.map(|sf| &sf.prompt))
            .await?
        {
            Landing::Authenticated => {}
            Landing::SecondFactorPrompt => {
                enter(attempt, AuthState::AwaitingSecondFactor, "confirm_login")?;
                if let Some(script) = prompt {
                    self.second_factor(session, script, attempt).await?;
                }
                self.await_landing(session, attempt, "confirm_second_factor", None)
                    .await?;
                if route == SessionRoute::Credentials {
                    route = SessionRoute::SecondFactor;
                }
            }
        }
        enter(attempt, AuthState::Authenticated, "confirm_login")?;
        Ok(route)
    }

    async fn run_steps(
        &self,
        session: &mut dyn BrowserSession,
        steps: &[AuthStep],
        credentials: &Credentials,
        attempt: &mut AuthAttempt,
        prefix: &str,
    ) -> Result<(), ExtractionError> {
        for step in steps {
            let name = format!("{prefix}{}", step.name);
            let state_before = attempt.state();
            let started = Instant::now();
            let result = self.execute(session, step, &name, credentials).await;
            record(attempt, &name, state_before, started, &result);
            result?;
        }
        Ok(())
    }

    async fn execute(
        &self,
        session: &mut dyn BrowserSession,
        step: &AuthStep,
        name: &str,
        credentials: &Credentials,
    ) -> Result<(), ExtractionError> {
        let deadline = Instant::now() + self.settings.step_timeout;
        debug!(platform = %self.script.platform_id, step = name, "auth step");
        match &step.action {
            StepAction::Navigate { url } => {
                self.bounded(name, deadline, session.navigate(url)).await?;
            }
            StepAction::Fill { target, value } => {
                self.wait_for(session, name, deadline, &SuccessPredicate::Present(target.clone()))
                    .await?;
                let text = match value {
                    StepValue::Identity => credentials.identity.as_str(),
                    StepValue::Secret => credentials.secret.expose(),
                };
                self.bounded(name, deadline, session.fill(target, text)).await?;
            }
            StepAction::Click { target } => {
                self.wait_for(session, name, deadline, &SuccessPredicate::Present(target.clone()))
                    .await?;
                self.bounded(name, deadline, session.click(target)).await?;
            }
        }
        self.wait_for(session, name, deadline, &step.expect).await
    }

    /// Opens the portal's secondary window, drives its steps, and always
    /// closes it and refocuses the primary page before returning.
    async fn secondary_window(
        &self,
        session: &mut dyn BrowserSession,
        script: &SecondaryWindowScript,
        credentials: &Credentials,
        attempt: &mut AuthAttempt,
    ) -> Result<(), ExtractionError> {
        let name = "open_secondary_window";
        let state_before = attempt.state();
        let started = Instant::now();
        let opened = async {
            let deadline = Instant::now() + self.settings.step_timeout;
            self.wait_for(session, name, deadline, &SuccessPredicate::Present(script.trigger.clone()))
                .await?;
            self.bounded(name, deadline, session.click(&script.trigger))
                .await?;
            let popup_deadline = Instant::now() + self.settings.popup_timeout;
            self.bounded(
                name,
                popup_deadline,
                session.wait_for_popup(self.settings.popup_timeout),
            )
            .await
        }
        .await;
        record(attempt, name, state_before, started, &opened);
        let mut popup = match opened {
            Ok(popup) => popup,
            Err(error) => {
                self.restore_primary(session, Instant::now() + self.settings.step_timeout)
                    .await;
                return Err(error);
            }
        };

        let outcome = self
            .run_steps(popup.as_mut(), &script.steps, credentials, attempt, "secondary/")
            .await;

        // Closing the window and refocusing share one step budget.
        let cleanup_deadline = Instant::now() + self.settings.step_timeout;
        match timeout_at(cleanup_deadline, popup.close()).await {
            Ok(Ok(())) => {}
            // Providers usually close the window themselves after authorizing.
            Ok(Err(err)) => debug!(error = %err, "secondary window already closed"),
            Err(_) => {
                warn!(platform = %self.script.platform_id, "closing secondary window timed out");
                self.engine_failure.store(true, Ordering::SeqCst);
            }
        }
        self.restore_primary(session, cleanup_deadline).await;
        match &outcome {
            Ok(()) => debug!(platform = %self.script.platform_id, "secondary window authorized"),
            Err(error) => debug!(platform = %self.script.platform_id, kind = %error.kind, "secondary window failed"),
        }
        outcome
    }

    async fn restore_primary(&self, session: &mut dyn BrowserSession, deadline: Instant) {
        match timeout_at(deadline, session.focus()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                warn!(error = %err, "failed to refocus primary page");
                if err.is_engine_failure() {
                    self.engine_failure.store(true, Ordering::SeqCst);
                }
            }
            Err(_) => {
                warn!("refocusing primary page timed out");
                self.engine_failure.store(true, Ordering::SeqCst);
            }
        }
    }

    async fn second_factor(
        &self,
        session: &mut dyn BrowserSession,
        script: &SecondFactorScript,
        attempt: &mut AuthAttempt,
    ) -> Result<(), ExtractionError> {
        let name = "await_second_factor";
        let state_before = attempt.state();
        let started = Instant::now();
        let deadline = started + self.settings.second_factor_deadline;
        let platform_id = self.script.platform_id.as_str();
        let since = attempt.started_at();
        let code = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ExtractionError::cancelled(name)),
            code = timeout_at(deadline, self.second_factor.get_code(platform_id, since, deadline)) => {
                match code.ok().flatten() {
                    Some(code) => Ok(code),
                    None => Err(ExtractionError::new(
                        ErrorKind::SecondFactorTimeout,
                        format!(
                            "no verification code within {}s",
                            self.settings.second_factor_deadline.as_secs()
                        ),
                    )
                    .at_step(name)),
                }
            }
        };
        record(attempt, name, state_before, started, &code);
        let code = code?;

        let name = "submit_second_factor";
        let started = Instant::now();
        let result = async {
            let deadline = Instant::now() + self.settings.step_timeout;
            self.wait_for(session, name, deadline, &SuccessPredicate::Present(script.input.clone()))
                .await?;
            self.bounded(name, deadline, session.fill(&script.input, &code))
                .await?;
            match &script.submit {
                Some(submit) => self.bounded(name, deadline, session.click(submit)).await,
                None => {
                    self.bounded(name, deadline, session.press_enter(&script.input))
                        .await
                }
            }
        }
        .await;
        record(attempt, name, AuthState::AwaitingSecondFactor, started, &result);
        result
    }

    /// Polls until the portal shows where the submission landed.
    async fn await_landing(
        &self,
        session: &mut dyn BrowserSession,
        attempt: &mut AuthAttempt,
        name: &str,
        second_factor_prompt: Option<&Locator>,
    ) -> Result<Landing, ExtractionError> {
        let state_before = attempt.state();
        let started = Instant::now();
        let deadline = started + self.settings.step_timeout;
        let result = async {
            loop {
                if let Some(rejected) = &self.script.rejected {
                    if self.bounded(name, deadline, session.is_present(rejected)).await? {
                        return Err(ExtractionError::new(
                            ErrorKind::CredentialRejected,
                            "portal rejected the submitted credentials",
                        )
                        .at_step(name));
                    }
                }
                if let Some(prompt) = second_factor_prompt {
                    if self.bounded(name, deadline, session.is_present(prompt)).await? {
                        return Ok(Landing::SecondFactorPrompt);
                    }
                }
                if self
                    .bounded(name, deadline, session.is_present(&self.script.authenticated))
                    .await?
                {
                    return Ok(Landing::Authenticated);
                }
                self.pause(name, deadline).await?;
            }
        }
        .await;
        record(attempt, name, state_before, started, &result);
        result
    }

    async fn wait_for(
        &self,
        session: &mut dyn BrowserSession,
        name: &str,
        deadline: Instant,
        predicate: &SuccessPredicate,
    ) -> Result<(), ExtractionError> {
        loop {
            let met = match predicate {
                SuccessPredicate::Always => return Ok(()),
                SuccessPredicate::Present(locator) => {
                    self.bounded(name, deadline, session.is_present(locator))
                        .await?
                }
                SuccessPredicate::TextContains(text) => {
                    self.bounded(name, deadline, session.text_contains(text))
                        .await?
                }
            };
            if met {
                return Ok(());
            }
            self.pause(name, deadline).await?;
        }
    }

    async fn pause(&self, name: &str, deadline: Instant) -> Result<(), ExtractionError> {
        let now = Instant::now();
        if now >= deadline {
            return Err(self.step_timeout(name));
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ExtractionError::cancelled(name)),
            _ = sleep(self.settings.poll_interval.min(deadline - now)) => Ok(()),
        }
    }

    async fn bounded<T, F>(&self, name: &str, deadline: Instant, operation: F) -> Result<T, ExtractionError>
    where
        F: Future<Output = BrowserResult<T>>,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ExtractionError::cancelled(name)),
            result = timeout_at(deadline, operation) => match result {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(err)) => {
                    if err.is_engine_failure() {
                        self.engine_failure.store(true, Ordering::SeqCst);
                    }
                    Err(ErrorCategorizer::to_extraction_error(&err, name))
                }
                Err(_) => Err(self.step_timeout(name)),
            }
        }
    }

    fn step_timeout(&self, name: &str) -> ExtractionError {
        ExtractionError::new(
            ErrorKind::Timeout,
            format!(
                "step did not complete within {}s",
                self.settings.step_timeout.as_secs()
            ),
        )
        .at_step(name)
    }
}

fn enter(attempt: &mut AuthAttempt, next: AuthState, step: &str) -> Result<(), ExtractionError> {
    attempt.transition(next).map_err(|err| {
        ExtractionError::new(ErrorKind::UnexpectedPageState, err.to_string()).at_step(step)
    })
}

fn record<T>(
    attempt: &mut AuthAttempt,
    name: &str,
    state_before: AuthState,
    started: Instant,
    result: &Result<T, ExtractionError>,
) {
    let outcome = match result {
        Ok(_) => StepOutcome::Completed,
        Err(error) => StepOutcome::Failed { kind: error.kind },
    };
    attempt.record_step(name, state_before, outcome, started.elapsed().as_millis() as u64);
}
