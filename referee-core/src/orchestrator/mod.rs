mod job;

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::auth::{AuthSettings, AuthStateMachine, LoginScript, SecondFactorProvider};
use crate::browser::{
    AutomationTelemetry, BrowserLease, BrowserPool, BrowserResult, BrowserSession, ContextState,
    ErrorCategorizer, PoolHealth, RunContext,
};
use crate::config::RefereeConfig;
use crate::credentials::CredentialSource;
use crate::failure::{ErrorKind, ExtractionError, OperationKind};
use crate::platform::{ExtractorError, PlatformRegistry, PlatformSpec, RawRecord, RegisteredPlatform};
use crate::retry::{RetryFailure, RetryPolicy, RetryRunner};
use crate::session::{AuthSession, SessionStore};
use crate::sink::ResultSink;

pub use job::{ExtractionJob, ExtractionResult, JobId, JobOutcome, JobStatus};

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("job queue is full ({capacity} pending)")]
    QueueFull { capacity: usize },
    #[error("unknown platform: {0}")]
    UnknownPlatform(String),
    #[error("unknown job: {0}")]
    UnknownJob(JobId),
    #[error("orchestrator is shut down")]
    ShutDown,
}

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

/// Collaborators wired in at startup.
pub struct OrchestratorDeps {
    pub pool: BrowserPool,
    pub sessions: Arc<SessionStore>,
    pub platforms: Arc<PlatformRegistry>,
    pub second_factor: Arc<dyn SecondFactorProvider>,
    pub credentials: Arc<dyn CredentialSource>,
    pub sink: Arc<dyn ResultSink>,
    pub retry: RetryPolicy,
    pub telemetry: Option<Arc<AutomationTelemetry>>,
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub workers: usize,
    pub queue_capacity: usize,
    pub auth: AuthSettings,
}

impl From<&RefereeConfig> for OrchestratorSettings {
    fn from(config: &RefereeConfig) -> Self {
        Self {
            workers: config.workers.count,
            queue_capacity: config.workers.queue_capacity,
            auth: AuthSettings::from(&config.auth),
        }
    }
}

struct JobEntry {
    job: ExtractionJob,
    cancel: CancellationToken,
    status: watch::Sender<JobStatus>,
}

struct Inner {
    deps: OrchestratorDeps,
    settings: OrchestratorSettings,
    scripts: HashMap<String, LoginScript>,
    jobs: RwLock<HashMap<JobId, JobEntry>>,
    shutdown: CancellationToken,
}

/// Runs extraction jobs on a fixed set of workers. The pool and the session
/// store are the only state shared between jobs.
pub struct ExtractionOrchestrator {
    inner: Arc<Inner>,
    sender: Mutex<Option<mpsc::Sender<JobId>>>,
    receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<JobId>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl ExtractionOrchestrator {
    pub fn new(deps: OrchestratorDeps, settings: OrchestratorSettings) -> Self {
        let scripts = deps
            .platforms
            .iter()
            .map(|platform| {
                (
                    platform.spec.id.clone(),
                    LoginScript::for_platform(&platform.spec),
                )
            })
            .collect();
        let (sender, receiver) = mpsc::channel(settings.queue_capacity.max(1));
        Self {
            inner: Arc::new(Inner {
                deps,
                settings,
                scripts,
                jobs: RwLock::new(HashMap::new()),
                shutdown: CancellationToken::new(),
            }),
            sender: Mutex::new(Some(sender)),
            receiver: Arc::new(tokio::sync::Mutex::new(receiver)),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Spawns the workers. Calling it again is a no-op.
    pub fn start(&self) {
        let mut workers = lock(&self.workers);
        if !workers.is_empty() || self.inner.shutdown.is_cancelled() {
            return;
        }
        let count = self.inner.settings.workers.max(1);
        for index in 0..count {
            let inner = Arc::clone(&self.inner);
            let receiver = Arc::clone(&self.receiver);
            workers.push(tokio::spawn(async move {
                worker_loop(index, inner, receiver).await;
            }));
        }
        info!(workers = count, "extraction workers started");
    }

    pub fn submit_job(&self, platform_id: &str) -> OrchestratorResult<JobId> {
        if !self.inner.deps.platforms.contains(platform_id) {
            return Err(OrchestratorError::UnknownPlatform(platform_id.to_string()));
        }
        let sender = lock(&self.sender)
            .clone()
            .ok_or(OrchestratorError::ShutDown)?;
        let job = ExtractionJob::new(platform_id);
        let job_id = job.id.clone();
        let (status, _) = watch::channel(JobStatus::Queued);
        self.inner.write_jobs().insert(
            job_id.clone(),
            JobEntry {
                job,
                cancel: self.inner.shutdown.child_token(),
                status,
            },
        );
        match sender.try_send(job_id.clone()) {
            Ok(()) => {
                info!(job_id = %job_id, platform = platform_id, "job queued");
                Ok(job_id)
            }
            Err(err) => {
                self.inner.write_jobs().remove(&job_id);
                match err {
                    mpsc::error::TrySendError::Full(_) => {
                        warn!(platform = platform_id, "job queue full");
                        Err(OrchestratorError::QueueFull {
                            capacity: self.inner.settings.queue_capacity,
                        })
                    }
                    mpsc::error::TrySendError::Closed(_) => Err(OrchestratorError::ShutDown),
                }
            }
        }
    }

    pub fn get_job_status(&self, job_id: &JobId) -> Option<ExtractionJob> {
        self.inner
            .read_jobs()
            .get(job_id)
            .map(|entry| entry.job.clone())
    }

    /// Signals cancellation. False for unknown or already finished jobs.
    pub fn cancel_job(&self, job_id: &JobId) -> bool {
        let queued = {
            let jobs = self.inner.read_jobs();
            let Some(entry) = jobs.get(job_id) else {
                return false;
            };
            if entry.job.is_terminal() {
                return false;
            }
            entry.cancel.cancel();
            entry.job.status == JobStatus::Queued
        };
        info!(job_id = %job_id, queued, "job cancellation requested");
        if queued {
            // Workers skip finished jobs when they dequeue them.
            self.inner
                .finish(job_id, Err(ExtractionError::cancelled(JobStatus::Queued.as_str())));
        }
        true
    }

    pub fn pool_health(&self) -> PoolHealth {
        self.inner.deps.pool.health()
    }

    pub fn jobs(&self) -> Vec<ExtractionJob> {
        let mut jobs: Vec<ExtractionJob> = self
            .inner
            .read_jobs()
            .values()
            .map(|entry| entry.job.clone())
            .collect();
        jobs.sort_by(|a, b| a.requested_at.cmp(&b.requested_at));
        jobs
    }

    /// Resolves once the job reaches `Succeeded` or `Failed`.
    pub async fn wait_for_job(&self, job_id: &JobId) -> OrchestratorResult<ExtractionJob> {
        let mut status = self
            .inner
            .read_jobs()
            .get(job_id)
            .map(|entry| entry.status.subscribe())
            .ok_or_else(|| OrchestratorError::UnknownJob(job_id.clone()))?;
        // The sender lives in the job table, so it is never dropped first.
        let _ = status.wait_for(|status| status.is_terminal()).await;
        self.get_job_status(job_id)
            .ok_or_else(|| OrchestratorError::UnknownJob(job_id.clone()))
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.inner.deps.sessions
    }

    /// Stops intake, cancels running jobs, joins the workers and stops the pool.
    pub async fn shutdown(&self) {
        lock(&self.sender).take();
        self.inner.shutdown.cancel();
        let workers: Vec<JoinHandle<()>> = lock(&self.workers).drain(..).collect();
        for worker in workers {
            if let Err(err) = worker.await {
                warn!(error = %err, "worker ended abnormally");
            }
        }
        let pending: Vec<JobId> = self
            .inner
            .read_jobs()
            .iter()
            .filter(|(_, entry)| !entry.job.is_terminal())
            .map(|(id, _)| id.clone())
            .collect();
        for job_id in pending {
            self.inner
                .finish(&job_id, Err(ExtractionError::cancelled("shutdown")));
        }
        self.inner.deps.pool.shutdown().await;
        info!("orchestrator shut down");
    }
}

async fn worker_loop(
    index: usize,
    inner: Arc<Inner>,
    receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<JobId>>>,
) {
    debug!(worker = index, "worker ready");
    loop {
        let next = {
            let mut receiver = receiver.lock().await;
            tokio::select! {
                biased;
                _ = inner.shutdown.cancelled() => None,
                job_id = receiver.recv() => job_id,
            }
        };
        let Some(job_id) = next else {
            break;
        };
        let Some(cancel) = inner.begin(&job_id) else {
            continue;
        };
        let task = {
            let inner = Arc::clone(&inner);
            let job_id = job_id.clone();
            tokio::spawn(async move { inner.run_job(job_id, cancel).await })
        };
        if let Err(err) = task.await {
            let error = if err.is_panic() {
                error!(worker = index, job_id = %job_id, "job task panicked");
                ExtractionError::new(ErrorKind::UnexpectedPageState, "job task panicked")
            } else {
                ExtractionError::cancelled("worker")
            };
            let step = inner
                .read_jobs()
                .get(&job_id)
                .map(|entry| entry.job.status.as_str())
                .unwrap_or("worker");
            inner.finish(&job_id, Err(error.at_step(step)));
        }
    }
    debug!(worker = index, "worker stopped");
}

struct JobContext<'a> {
    job_id: &'a JobId,
    platform: &'a PlatformSpec,
    cancel: &'a CancellationToken,
    runner: RetryRunner<'a>,
}

impl Inner {
    fn read_jobs(&self) -> RwLockReadGuard<'_, HashMap<JobId, JobEntry>> {
        match self.jobs.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write_jobs(&self) -> RwLockWriteGuard<'_, HashMap<JobId, JobEntry>> {
        match self.jobs.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Returns the job's cancellation token unless it already finished.
    fn begin(&self, job_id: &JobId) -> Option<CancellationToken> {
        let jobs = self.read_jobs();
        let entry = jobs.get(job_id)?;
        if entry.job.is_terminal() {
            debug!(job_id = %job_id, "skipping finished job");
            return None;
        }
        Some(entry.cancel.clone())
    }

    fn update<F: FnOnce(&mut ExtractionJob)>(&self, job_id: &JobId, apply: F) {
        let mut jobs = self.write_jobs();
        if let Some(entry) = jobs.get_mut(job_id) {
            apply(&mut entry.job);
            entry.status.send_replace(entry.job.status);
        }
    }

    fn advance(&self, job_id: &JobId, status: JobStatus) {
        self.update(job_id, |job| {
            if job.advance(status) {
                debug!(job_id = %job.id, status = %status, "job advanced");
            }
        });
    }

    fn record_attempts(&self, job_id: &JobId, operation: OperationKind, attempts: u32) {
        self.update(job_id, |job| {
            *job.attempts.entry(operation).or_insert(0) += attempts;
        });
    }

    fn finish(&self, job_id: &JobId, outcome: Result<ExtractionResult, ExtractionError>) {
        let mut finished = None;
        self.update(job_id, |job| {
            if job.finish(outcome) {
                finished = Some(job.clone());
            }
        });
        let Some(job) = finished else {
            return;
        };
        let duration_ms = match (job.started_at, job.finished_at) {
            (Some(started), Some(finished)) => (finished - started).num_milliseconds(),
            _ => 0,
        };
        match job.error() {
            None => info!(
                job_id = %job.id,
                platform = %job.platform_id,
                records = job.result().map(|result| result.record_count).unwrap_or_default(),
                duration_ms,
                cached_session = job.used_cached_session,
                "job succeeded"
            ),
            Some(error) => warn!(
                job_id = %job.id,
                platform = %job.platform_id,
                kind = %error.kind,
                step = error.step_at_failure.as_deref().unwrap_or("-"),
                "job failed: {}",
                error.message
            ),
        }
        if let Some(telemetry) = &self.deps.telemetry {
            let run = RunContext {
                timestamp: Utc::now(),
                job_id: job.id.to_string(),
                platform: job.platform_id.clone(),
                success: job.error().is_none(),
                kind: job.error().map(|error| error.kind),
                record_count: job.result().map(|result| result.record_count).unwrap_or_default(),
                duration_ms,
                used_cached_session: job.used_cached_session,
            };
            if let Err(err) = telemetry.record_run(&run) {
                warn!(error = %err, "failed to record job telemetry");
            }
        }
    }

    async fn run_job(&self, job_id: JobId, cancel: CancellationToken) {
        let platform = self
            .read_jobs()
            .get(&job_id)
            .and_then(|entry| self.deps.platforms.get(&entry.job.platform_id).cloned());
        let Some(platform) = platform else {
            self.finish(
                &job_id,
                Err(ExtractionError::new(ErrorKind::UnexpectedPageState, "platform no longer registered")
                    .at_step("dispatch")),
            );
            return;
        };
        self.update(&job_id, |job| {
            job.started_at = Some(Utc::now());
        });
        let started = Instant::now();
        let outcome = self.execute(&job_id, &platform, &cancel).await;
        let outcome = outcome.map(|records| ExtractionResult {
            record_count: records.len(),
            records,
            duration_ms: started.elapsed().as_millis() as u64,
        });
        self.finish(&job_id, outcome);
    }

    async fn execute(
        &self,
        job_id: &JobId,
        platform: &RegisteredPlatform,
        cancel: &CancellationToken,
    ) -> Result<Vec<RawRecord>, ExtractionError> {
        let spec = platform.spec.as_ref();
        let ctx = JobContext {
            job_id,
            platform: spec,
            cancel,
            runner: RetryRunner {
                policy: &self.deps.retry,
                telemetry: self.deps.telemetry.as_deref(),
                cancel,
                job_id: job_id.as_str(),
                platform: &spec.id,
            },
        };

        let mut lease = self.acquire(&ctx).await?;
        self.advance(job_id, JobStatus::AuthPending);
        debug!(job_id = %job_id, lease = %lease.id(), process = %lease.process_id(), "lease acquired");

        let mut poisoned = false;
        let outcome = self
            .with_lease(&ctx, platform, &mut lease, &mut poisoned)
            .await;
        // A failed replacement leaves the old lease already released.
        if !lease.is_released() {
            if let Err(err) = self.deps.pool.release(&mut lease, poisoned).await {
                error!(job_id = %job_id, error = %err, "lease release rejected");
            }
        }
        let records = outcome?;

        if let Err(err) = self.deps.sink.save(job_id.as_str(), &spec.id, &records).await {
            return Err(ExtractionError::new(ErrorKind::TransientNetwork, err.to_string())
                .at_step("save_records"));
        }
        Ok(records)
    }

    async fn acquire(&self, ctx: &JobContext<'_>) -> Result<BrowserLease, ExtractionError> {
        let pool = &self.deps.pool;
        let owner = ctx.job_id.as_str();
        let cancel = ctx.cancel;
        let acquired = ctx
            .runner
            .run(OperationKind::ResourceAcquisition, |_| async move {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(ExtractionError::cancelled("acquire_lease")),
                    result = pool.acquire(owner) => result.map_err(|err| {
                        ExtractionError::new(err.kind(), err.to_string()).at_step("acquire_lease")
                    }),
                }
            })
            .await;
        match acquired {
            Ok(outcome) => {
                self.record_attempts(ctx.job_id, OperationKind::ResourceAcquisition, outcome.attempts);
                Ok(outcome.result)
            }
            Err(failure) => Err(self.give_up(ctx, OperationKind::ResourceAcquisition, failure)),
        }
    }

    /// Hands a lease whose engine failed back as poisoned and takes a fresh one.
    async fn replace_lease(
        &self,
        ctx: &JobContext<'_>,
        lease: &mut BrowserLease,
        poisoned: &mut bool,
    ) -> Result<(), ExtractionError> {
        warn!(
            job_id = %ctx.job_id,
            lease = %lease.id(),
            process = %lease.process_id(),
            "engine failure; moving job to a fresh lease"
        );
        if let Err(err) = self.deps.pool.release(lease, true).await {
            error!(job_id = %ctx.job_id, error = %err, "lease release rejected");
        }
        *poisoned = false;
        *lease = self.acquire(ctx).await?;
        debug!(job_id = %ctx.job_id, lease = %lease.id(), process = %lease.process_id(), "replacement lease acquired");
        Ok(())
    }

    fn give_up(&self, ctx: &JobContext<'_>, operation: OperationKind, failure: RetryFailure) -> ExtractionError {
        self.record_attempts(ctx.job_id, operation, failure.attempts);
        failure.error
    }

    async fn with_lease(
        &self,
        ctx: &JobContext<'_>,
        platform: &RegisteredPlatform,
        lease: &mut BrowserLease,
        poisoned: &mut bool,
    ) -> Result<Vec<RawRecord>, ExtractionError> {
        let session = lease_session(lease)?;

        let mut authenticated = false;
        if let Some(cached) = self.deps.sessions.get(&ctx.platform.id) {
            match self.replay(ctx, session, &cached).await {
                Ok(()) => {
                    authenticated = true;
                    self.update(ctx.job_id, |job| job.used_cached_session = true);
                    info!(job_id = %ctx.job_id, platform = %ctx.platform.id, "cached session accepted");
                }
                Err(error) if error.kind == ErrorKind::Cancelled => return Err(error),
                Err(error) => {
                    info!(
                        job_id = %ctx.job_id,
                        platform = %ctx.platform.id,
                        reason = %error,
                        "cached session rejected; logging in again"
                    );
                    if let Err(err) = self.deps.sessions.invalidate(&ctx.platform.id) {
                        warn!(error = %err, "failed to invalidate cached session");
                    }
                    let step_timeout = self.settings.auth.step_timeout;
                    if let Err(err) =
                        guarded(ctx.cancel, step_timeout, "reset_context", session.clear_state()).await
                    {
                        if err.kind == ErrorKind::Cancelled {
                            return Err(err);
                        }
                        warn!(job_id = %ctx.job_id, error = %err, "failed to reset context after replay");
                    }
                }
            }
        }

        if !authenticated {
            self.authenticate(ctx, lease, poisoned).await?;
        }

        self.advance(ctx.job_id, JobStatus::Extracting);
        self.extract(ctx, platform, lease, poisoned).await
    }

    async fn replay(
        &self,
        ctx: &JobContext<'_>,
        session: &mut dyn BrowserSession,
        cached: &AuthSession,
    ) -> Result<(), ExtractionError> {
        let step_timeout = self.settings.auth.step_timeout;
        let state = ContextState::from_blob(cached.state())
            .map_err(|err| ErrorCategorizer::to_extraction_error(&err, "replay_session"))?;
        guarded(ctx.cancel, step_timeout, "replay_session", session.import_state(&state)).await?;
        self.navigate(ctx, session, &ctx.platform.home_url, "verify_session")
            .await?;
        let locator = ctx.platform.authenticated_locator();
        if guarded(ctx.cancel, step_timeout, "verify_session", session.is_present(&locator)).await? {
            Ok(())
        } else {
            Err(ExtractionError::new(ErrorKind::UnexpectedPageState, "home page is not authenticated")
                .at_step("verify_session"))
        }
    }

    /// Navigation under its own retry ceiling, so a flaky page load does not
    /// count against the session being replayed.
    async fn navigate(
        &self,
        ctx: &JobContext<'_>,
        session: &mut dyn BrowserSession,
        url: &str,
        step: &str,
    ) -> Result<(), ExtractionError> {
        let step_timeout = self.settings.auth.step_timeout;
        let mut retry = ctx.runner.begin(OperationKind::Navigation);
        loop {
            if let Err(failure) = retry.check_cancelled() {
                return Err(self.give_up(ctx, OperationKind::Navigation, failure));
            }
            match guarded(ctx.cancel, step_timeout, step, session.navigate(url)).await {
                Ok(()) => {
                    self.record_attempts(ctx.job_id, OperationKind::Navigation, retry.attempt());
                    return Ok(());
                }
                Err(error) if error.kind == ErrorKind::Cancelled => return Err(error),
                Err(error) => {
                    if let Err(failure) = retry.failed(error).await {
                        return Err(self.give_up(ctx, OperationKind::Navigation, failure));
                    }
                }
            }
        }
    }

    async fn authenticate(
        &self,
        ctx: &JobContext<'_>,
        lease: &mut BrowserLease,
        poisoned: &mut bool,
    ) -> Result<(), ExtractionError> {
        let spec = ctx.platform;
        let script = self.scripts.get(&spec.id).ok_or_else(|| {
            ExtractionError::new(ErrorKind::UnexpectedPageState, "no login script for platform")
                .at_step("load_script")
        })?;
        let credentials = self
            .deps
            .credentials
            .get_credentials(&spec.id)
            .await
            .map_err(|err| {
                ExtractionError::new(ErrorKind::CredentialRejected, err.to_string())
                    .at_step("load_credentials")
            })?;
        let machine = AuthStateMachine::new(
            script,
            &self.settings.auth,
            self.deps.second_factor.as_ref(),
            ctx.cancel,
        );

        let mut retry = ctx.runner.begin(OperationKind::Authentication);
        let route = loop {
            if let Err(failure) = retry.check_cancelled() {
                return Err(self.give_up(ctx, OperationKind::Authentication, failure));
            }
            if *poisoned {
                self.replace_lease(ctx, lease, poisoned).await?;
            } else if retry.attempt() > 1 {
                // A new attempt starts from a blank context.
                let session = lease_session(lease)?;
                if let Err(err) = guarded(
                    ctx.cancel,
                    self.settings.auth.step_timeout,
                    "reset_context",
                    session.clear_state(),
                )
                .await
                {
                    warn!(job_id = %ctx.job_id, error = %err, "failed to reset context before retry");
                }
            }
            let outcome = machine.run(lease_session(lease)?, &credentials).await;
            if outcome.engine_failure {
                *poisoned = true;
            }
            match outcome.result {
                Ok(route) => break route,
                Err(error) => {
                    if let Err(failure) = retry.failed(error).await {
                        return Err(self.give_up(ctx, OperationKind::Authentication, failure));
                    }
                }
            }
        };
        self.record_attempts(ctx.job_id, OperationKind::Authentication, retry.attempt());

        let session = lease_session(lease)?;
        let state = guarded(
            ctx.cancel,
            self.settings.auth.step_timeout,
            "capture_session",
            session.export_state(),
        )
        .await?;
        match state.to_blob() {
            Ok(blob) => {
                let issued = AuthSession::issue(spec.id.clone(), blob, Utc::now(), spec.session_ttl, route);
                if let Err(err) = self.deps.sessions.put(issued) {
                    warn!(platform = %spec.id, error = %err, "failed to persist session");
                }
            }
            Err(err) => warn!(platform = %spec.id, error = %err, "failed to encode session state"),
        }
        Ok(())
    }

    async fn extract(
        &self,
        ctx: &JobContext<'_>,
        platform: &RegisteredPlatform,
        lease: &mut BrowserLease,
        poisoned: &mut bool,
    ) -> Result<Vec<RawRecord>, ExtractionError> {
        let spec = ctx.platform;
        let limit = spec.extraction.timeout();
        let mut retry = ctx.runner.begin(OperationKind::Extraction);
        loop {
            if let Err(failure) = retry.check_cancelled() {
                return Err(self.give_up(ctx, OperationKind::Extraction, failure));
            }
            if *poisoned {
                // The fresh context has no login, so it has to authenticate first.
                self.replace_lease(ctx, lease, poisoned).await?;
                self.authenticate(ctx, lease, poisoned).await?;
            }
            let session = lease_session(lease)?;
            let result = tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => Err(ExtractionError::cancelled("extract")),
                result = timeout(limit, platform.extractor.extract(session, spec)) => match result {
                    Ok(Ok(records)) => Ok(records),
                    Ok(Err(err)) => {
                        if err.is_engine_failure() {
                            *poisoned = true;
                        }
                        Err(err.to_extraction_error("extract"))
                    }
                    Err(_) => Err(ExtractorError::Timeout(limit.as_secs()).to_extraction_error("extract")),
                },
            };
            match result {
                Ok(records) => {
                    self.record_attempts(ctx.job_id, OperationKind::Extraction, retry.attempt());
                    return Ok(records);
                }
                Err(error) => {
                    if let Err(failure) = retry.failed(error).await {
                        return Err(self.give_up(ctx, OperationKind::Extraction, failure));
                    }
                }
            }
        }
    }
}

fn lease_session(lease: &mut BrowserLease) -> Result<&mut (dyn BrowserSession + 'static), ExtractionError> {
    lease.session().map_err(|err| {
        ExtractionError::new(ErrorKind::UnexpectedPageState, err.to_string()).at_step("lease")
    })
}

/// Runs one engine call under a timeout and the job's cancellation signal.
async fn guarded<T, F>(
    cancel: &CancellationToken,
    limit: Duration,
    step: &str,
    operation: F,
) -> Result<T, ExtractionError>
where
    F: Future<Output = BrowserResult<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ExtractionError::cancelled(step)),
        result = timeout(limit, operation) => match result {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(ErrorCategorizer::to_extraction_error(&err, step)),
            Err(_) => Err(ExtractionError::new(
                ErrorKind::Timeout,
                format!("step did not complete within {}s", limit.as_secs()),
            )
            .at_step(step)),
        }
    }
}
