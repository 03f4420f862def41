use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::browser::{telemetry_failure, AutomationTelemetry, RemediationAction};
use crate::config::{RetryConfig, RetrySection};
use crate::failure::{ErrorKind, ExtractionError, OperationKind};

/// Backoff envelope for one operation kind.
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    jitter_ratio: f64,
}

impl Backoff {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration, jitter_ratio: f64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: max_delay.max(base_delay),
            // Jitter stays below one doubling so delays keep increasing.
            jitter_ratio: jitter_ratio.clamp(0.0, 0.95),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    fn step(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32);
        let factor = 1u64 << exponent;
        let millis = (self.base_delay.as_millis() as u64).saturating_mul(factor);
        Duration::from_millis(millis).min(self.max_delay)
    }
}

impl From<&RetrySection> for Backoff {
    fn from(section: &RetrySection) -> Self {
        Backoff::new(
            section.max_attempts,
            Duration::from_millis(section.base_delay_ms),
            Duration::from_millis(section.max_delay_ms),
            section.jitter_ratio,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RetryDecision {
    RetryAfter(Duration),
    GiveUp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JitterSource {
    Entropy,
    Seeded(u64),
}

/// Stateless decision table: error kind and attempt count in, retry or give up out.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    navigation: Backoff,
    resource_acquisition: Backoff,
    authentication: Backoff,
    extraction: Backoff,
    jitter: JitterSource,
}

impl RetryPolicy {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            navigation: Backoff::from(&config.navigation),
            resource_acquisition: Backoff::from(&config.resource_acquisition),
            authentication: Backoff::from(&config.authentication),
            extraction: Backoff::from(&config.extraction),
            jitter: config
                .seed
                .map(JitterSource::Seeded)
                .unwrap_or(JitterSource::Entropy),
        }
    }

    pub fn uniform(backoff: Backoff) -> Self {
        Self {
            navigation: backoff.clone(),
            resource_acquisition: backoff.clone(),
            authentication: backoff.clone(),
            extraction: backoff,
            jitter: JitterSource::Entropy,
        }
    }

    pub fn with_operation(mut self, operation: OperationKind, backoff: Backoff) -> Self {
        match operation {
            OperationKind::Navigation => self.navigation = backoff,
            OperationKind::ResourceAcquisition => self.resource_acquisition = backoff,
            OperationKind::Authentication => self.authentication = backoff,
            OperationKind::Extraction => self.extraction = backoff,
        }
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.jitter = JitterSource::Seeded(seed);
        self
    }

    pub fn backoff(&self, operation: OperationKind) -> &Backoff {
        match operation {
            OperationKind::Navigation => &self.navigation,
            OperationKind::ResourceAcquisition => &self.resource_acquisition,
            OperationKind::Authentication => &self.authentication,
            OperationKind::Extraction => &self.extraction,
        }
    }

    /// `attempt` is the 1-based number of the attempt that just failed.
    pub fn next_action(&self, operation: OperationKind, kind: ErrorKind, attempt: u32) -> RetryDecision {
        let backoff = self.backoff(operation);
        let ceiling = match kind {
            ErrorKind::CredentialRejected
            | ErrorKind::UnexpectedPageState
            | ErrorKind::Cancelled
            // The pool already waited its own acquire timeout.
            | ErrorKind::ResourceExhausted => return RetryDecision::GiveUp,
            ErrorKind::SecondFactorTimeout => backoff.max_attempts.min(2),
            ErrorKind::TransientNetwork | ErrorKind::Timeout => backoff.max_attempts,
        };
        if attempt >= ceiling {
            return RetryDecision::GiveUp;
        }
        RetryDecision::RetryAfter(self.delay_for(operation, attempt))
    }

    pub fn delay_for(&self, operation: OperationKind, attempt: u32) -> Duration {
        let backoff = self.backoff(operation);
        let step = backoff.step(attempt);
        if backoff.jitter_ratio <= 0.0 || step.is_zero() {
            return step;
        }
        let spread = step.as_secs_f64() * backoff.jitter_ratio;
        let jitter = match self.jitter {
            JitterSource::Entropy => rand::thread_rng().gen_range(0.0..spread),
            JitterSource::Seeded(seed) => {
                let salt = (operation as u64) << 32 | u64::from(attempt);
                ChaCha8Rng::seed_from_u64(seed ^ salt).gen_range(0.0..spread)
            }
        };
        (step + Duration::from_secs_f64(jitter)).min(backoff.max_delay)
    }
}

/// Bookkeeping for one operation that has failed at least once.
#[derive(Debug, Clone, Serialize)]
pub struct RetryContext {
    pub operation: OperationKind,
    pub attempt_number: u32,
    pub first_error_at: DateTime<Utc>,
    pub last_error_kind: ErrorKind,
}

impl RetryContext {
    pub fn first_failure(operation: OperationKind, kind: ErrorKind) -> Self {
        Self {
            operation,
            attempt_number: 1,
            first_error_at: Utc::now(),
            last_error_kind: kind,
        }
    }

    pub fn record(&mut self, kind: ErrorKind) {
        self.attempt_number = self.attempt_number.saturating_add(1);
        self.last_error_kind = kind;
    }
}

#[derive(Debug, Clone)]
pub struct RetryOutcome<T> {
    pub result: T,
    pub attempts: u32,
}

#[derive(Debug, Clone)]
pub struct RetryFailure {
    pub error: ExtractionError,
    pub attempts: u32,
}

/// Drives an async operation under a [`RetryPolicy`], recording each failure.
pub struct RetryRunner<'a> {
    pub policy: &'a RetryPolicy,
    pub telemetry: Option<&'a AutomationTelemetry>,
    pub cancel: &'a CancellationToken,
    pub job_id: &'a str,
    pub platform: &'a str,
}

impl<'a> RetryRunner<'a> {
    pub fn begin(&self, operation: OperationKind) -> RetryLoop<'_, 'a> {
        RetryLoop {
            runner: self,
            operation,
            attempt: 1,
            context: None,
        }
    }

    pub async fn run<F, Fut, T>(
        &self,
        operation: OperationKind,
        mut attempt_fn: F,
    ) -> Result<RetryOutcome<T>, RetryFailure>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, ExtractionError>>,
    {
        let mut retry = self.begin(operation);
        loop {
            retry.check_cancelled()?;
            match attempt_fn(retry.attempt()).await {
                Ok(result) => return Ok(retry.succeeded(result)),
                Err(error) => retry.failed(error).await?,
            }
        }
    }
}

/// Attempt loop owned by the caller, for attempts that need `&mut` access to
/// state a closure could not lend out.
pub struct RetryLoop<'r, 'a> {
    runner: &'r RetryRunner<'a>,
    operation: OperationKind,
    attempt: u32,
    context: Option<RetryContext>,
}

impl RetryLoop<'_, '_> {
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn context(&self) -> Option<&RetryContext> {
        self.context.as_ref()
    }

    pub fn check_cancelled(&self) -> Result<(), RetryFailure> {
        if self.runner.cancel.is_cancelled() {
            return Err(RetryFailure {
                error: ExtractionError::cancelled(self.operation.as_str()),
                attempts: self.attempt - 1,
            });
        }
        Ok(())
    }

    pub fn succeeded<T>(&self, result: T) -> RetryOutcome<T> {
        RetryOutcome {
            result,
            attempts: self.attempt,
        }
    }

    /// Records a failed attempt. Returns `Ok` once the backoff delay has
    /// elapsed and another attempt is due.
    pub async fn failed(&mut self, error: ExtractionError) -> Result<(), RetryFailure> {
        let runner = self.runner;
        let operation = self.operation;
        let attempt = self.attempt;
        match self.context.as_mut() {
            Some(ctx) => ctx.record(error.kind),
            None => self.context = Some(RetryContext::first_failure(operation, error.kind)),
        }
        let decision = runner.policy.next_action(operation, error.kind, attempt);
        let action = match decision {
            RetryDecision::RetryAfter(delay) => RemediationAction::RetryScheduled {
                delay_ms: delay.as_millis() as u64,
            },
            RetryDecision::GiveUp => RemediationAction::GiveUp,
        };
        if let Some(telemetry) = runner.telemetry {
            if let Err(err) = telemetry_failure(
                telemetry,
                runner.job_id,
                runner.platform,
                operation,
                &error,
                attempt,
                action,
            ) {
                warn!(error = %err, "failed to record failure telemetry");
            }
        }
        match decision {
            RetryDecision::GiveUp => {
                debug!(
                    job_id = runner.job_id,
                    platform = runner.platform,
                    operation = %operation,
                    kind = %error.kind,
                    attempts = attempt,
                    "giving up"
                );
                Err(RetryFailure {
                    error: ExtractionError {
                        retryable: false,
                        ..error
                    },
                    attempts: attempt,
                })
            }
            RetryDecision::RetryAfter(delay) => {
                warn!(
                    job_id = runner.job_id,
                    platform = runner.platform,
                    operation = %operation,
                    kind = %error.kind,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "retry scheduled"
                );
                tokio::select! {
                    _ = runner.cancel.cancelled() => {
                        return Err(RetryFailure {
                            error: ExtractionError::cancelled(operation.as_str()),
                            attempts: attempt,
                        });
                    }
                    _ = sleep(delay) => {}
                }
                self.attempt += 1;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn policy() -> RetryPolicy {
        RetryPolicy::uniform(Backoff::new(
            6,
            Duration::from_millis(100),
            Duration::from_millis(2_000),
            0.5,
        ))
        .with_seed(7)
    }

    #[test]
    fn credential_rejection_gives_up_immediately() {
        let policy = policy();
        for attempt in 1..=5 {
            assert_eq!(
                policy.next_action(OperationKind::Authentication, ErrorKind::CredentialRejected, attempt),
                RetryDecision::GiveUp
            );
        }
    }

    #[test]
    fn transient_delays_strictly_increase_until_cap() {
        let policy = RetryPolicy::uniform(Backoff::new(
            12,
            Duration::from_millis(100),
            Duration::from_millis(3_000),
            0.9,
        ));
        let mut previous = Duration::ZERO;
        let mut capped = false;
        for attempt in 1..12 {
            let RetryDecision::RetryAfter(delay) =
                policy.next_action(OperationKind::Navigation, ErrorKind::TransientNetwork, attempt)
            else {
                panic!("transient errors should be retried below the ceiling");
            };
            assert!(delay <= Duration::from_millis(3_000));
            if delay == Duration::from_millis(3_000) {
                capped = true;
            } else {
                assert!(!capped, "delay dropped after reaching the cap");
                assert!(delay > previous, "attempt {attempt}: {delay:?} <= {previous:?}");
            }
            previous = delay;
        }
        assert!(capped);
    }

    #[test]
    fn gives_up_at_ceiling() {
        let policy = policy();
        assert!(matches!(
            policy.next_action(OperationKind::Extraction, ErrorKind::Timeout, 5),
            RetryDecision::RetryAfter(_)
        ));
        assert_eq!(
            policy.next_action(OperationKind::Extraction, ErrorKind::Timeout, 6),
            RetryDecision::GiveUp
        );
    }

    #[test]
    fn second_factor_timeout_retries_once() {
        let policy = policy();
        assert!(matches!(
            policy.next_action(OperationKind::Authentication, ErrorKind::SecondFactorTimeout, 1),
            RetryDecision::RetryAfter(_)
        ));
        assert_eq!(
            policy.next_action(OperationKind::Authentication, ErrorKind::SecondFactorTimeout, 2),
            RetryDecision::GiveUp
        );
    }

    #[test]
    fn exhaustion_and_page_state_are_not_retried() {
        let policy = policy();
        for kind in [
            ErrorKind::ResourceExhausted,
            ErrorKind::UnexpectedPageState,
            ErrorKind::Cancelled,
        ] {
            assert_eq!(
                policy.next_action(OperationKind::ResourceAcquisition, kind, 1),
                RetryDecision::GiveUp
            );
        }
    }

    #[test]
    fn seeded_jitter_is_deterministic() {
        let a = policy().delay_for(OperationKind::Navigation, 3);
        let b = policy().delay_for(OperationKind::Navigation, 3);
        assert_eq!(a, b);
        assert!(a >= Duration::from_millis(400) && a < Duration::from_millis(600));
    }

    #[test]
    fn per_operation_ceilings_are_independent() {
        let policy = policy().with_operation(
            OperationKind::Authentication,
            Backoff::new(1, Duration::from_millis(10), Duration::from_millis(10), 0.0),
        );
        assert_eq!(
            policy.next_action(OperationKind::Authentication, ErrorKind::Timeout, 1),
            RetryDecision::GiveUp
        );
        assert!(matches!(
            policy.next_action(OperationKind::Navigation, ErrorKind::Timeout, 1),
            RetryDecision::RetryAfter(_)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn runner_retries_until_success() {
        let policy = policy();
        let cancel = CancellationToken::new();
        let runner = RetryRunner {
            policy: &policy,
            telemetry: None,
            cancel: &cancel,
            job_id: "job",
            platform: "mf",
        };
        let calls = Arc::new(AtomicU32::new(0));
        let outcome = runner
            .run(OperationKind::Navigation, |_| {
                let calls = Arc::clone(&calls);
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(ExtractionError::new(ErrorKind::TransientNetwork, "reset"))
                    } else {
                        Ok("done")
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.result, "done");
    }

    #[tokio::test(start_paused = true)]
    async fn runner_surfaces_fatal_error_without_retry() {
        let policy = policy();
        let cancel = CancellationToken::new();
        let runner = RetryRunner {
            policy: &policy,
            telemetry: None,
            cancel: &cancel,
            job_id: "job",
            platform: "mf",
        };
        let failure = runner
            .run(OperationKind::Authentication, |_| async {
                Err::<(), _>(ExtractionError::new(ErrorKind::CredentialRejected, "denied"))
            })
            .await
            .unwrap_err();
        assert_eq!(failure.attempts, 1);
        assert_eq!(failure.error.kind, ErrorKind::CredentialRejected);
        assert!(!failure.error.retryable);
    }

    #[tokio::test(start_paused = true)]
    async fn runner_stops_when_cancelled_during_backoff() {
        let policy = RetryPolicy::uniform(Backoff::new(
            5,
            Duration::from_secs(60),
            Duration::from_secs(60),
            0.0,
        ));
        let cancel = CancellationToken::new();
        let runner = RetryRunner {
            policy: &policy,
            telemetry: None,
            cancel: &cancel,
            job_id: "job",
            platform: "mf",
        };
        let trigger = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });
        let failure = runner
            .run(OperationKind::Extraction, |_| async {
                Err::<(), _>(ExtractionError::new(ErrorKind::Timeout, "slow"))
            })
            .await
            .unwrap_err();
        assert_eq!(failure.error.kind, ErrorKind::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_loop_lends_mutable_state_between_attempts() {
        let policy = policy();
        let cancel = CancellationToken::new();
        let runner = RetryRunner {
            policy: &policy,
            telemetry: None,
            cancel: &cancel,
            job_id: "job",
            platform: "mor",
        };
        let mut pages_visited = Vec::new();
        let mut retry = runner.begin(OperationKind::Extraction);
        let failure = loop {
            pages_visited.push(retry.attempt());
            let error = ExtractionError::new(ErrorKind::Timeout, "listing page slow");
            if let Err(failure) = retry.failed(error).await {
                break failure;
            }
        };
        assert_eq!(pages_visited, vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(failure.attempts, 6);
        assert_eq!(retry.context().unwrap().attempt_number, 6);
    }
}
