use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::time::{sleep, timeout, timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::PoolSection;
use crate::failure::{ErrorKind, OperationKind};
use crate::retry::RetryPolicy;

use super::engine::{BrowserEngine, BrowserProcess, BrowserSession};
use super::error::BrowserError;
use super::error_handler::{map_category, AutomationTelemetry, PoolEventKind};
use super::metrics::PoolMetrics;

pub type PoolResult<T> = Result<T, PoolError>;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("no browser lease available within {waited_ms}ms")]
    Exhausted { waited_ms: u64 },
    #[error("browser pool is shut down")]
    Closed,
    #[error("lease {0} was already released")]
    AlreadyReleased(String),
    #[error("liveness probe failed on process {process}: {source}")]
    ProbeFailed {
        process: String,
        #[source]
        source: BrowserError,
    },
    #[error("failed to launch browser process: {0}")]
    Launch(#[source] BrowserError),
}

impl PoolError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PoolError::Exhausted { .. } => ErrorKind::ResourceExhausted,
            PoolError::Closed => ErrorKind::Cancelled,
            PoolError::AlreadyReleased(_) => ErrorKind::UnexpectedPageState,
            PoolError::ProbeFailed { source, .. } => match map_category(source) {
                ErrorKind::Timeout => ErrorKind::Timeout,
                _ => ErrorKind::TransientNetwork,
            },
            PoolError::Launch(_) => ErrorKind::TransientNetwork,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolHealth {
    pub capacity: usize,
    pub in_use: usize,
    pub processes: usize,
    pub processes_alive: usize,
    pub poisoned_recent_count: usize,
    pub metrics: PoolMetrics,
}

enum SlotState {
    Ready(Arc<dyn BrowserProcess>),
    Respawning,
    Stopped,
}

struct Slot {
    generation: u64,
    state: SlotState,
    active: usize,
}

struct Reservation {
    slot: usize,
    generation: u64,
    process: Arc<dyn BrowserProcess>,
}

/// Holds a reserved slot while its context is opened. Dropping the claim
/// before it settles hands the slot back, so a cancelled acquire cannot leak it.
struct SlotClaim {
    inner: Arc<PoolInner>,
    reservation: Reservation,
    settled: bool,
}

impl SlotClaim {
    fn new(inner: &Arc<PoolInner>, reservation: Reservation) -> Self {
        Self {
            inner: Arc::clone(inner),
            reservation,
            settled: false,
        }
    }

    fn process(&self) -> &Arc<dyn BrowserProcess> {
        &self.reservation.process
    }

    /// The slot now belongs to a lease.
    fn keep(mut self) -> Reservation {
        self.settled = true;
        Reservation {
            slot: self.reservation.slot,
            generation: self.reservation.generation,
            process: Arc::clone(&self.reservation.process),
        }
    }

    fn give_back(mut self, poisoned: bool) {
        self.settled = true;
        self.inner
            .finish_slot_use(self.reservation.slot, self.reservation.generation, poisoned);
        self.inner.slot_ready.notify_waiters();
    }
}

impl Drop for SlotClaim {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        debug!(
            process = %self.reservation.process.id(),
            slot = self.reservation.slot,
            "acquire abandoned while opening context; slot returned"
        );
        self.inner
            .finish_slot_use(self.reservation.slot, self.reservation.generation, false);
        self.inner.slot_ready.notify_waiters();
    }
}

struct PoolInner {
    engine: Arc<dyn BrowserEngine>,
    config: PoolSection,
    permits: Arc<Semaphore>,
    slots: Mutex<Vec<Slot>>,
    slot_ready: Notify,
    metrics: Mutex<PoolMetrics>,
    poison_events: Mutex<VecDeque<Instant>>,
    retry: RetryPolicy,
    telemetry: Option<Arc<AutomationTelemetry>>,
    shutdown: CancellationToken,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Fixed set of browser processes handing out isolated contexts as leases.
#[derive(Clone)]
pub struct BrowserPool {
    inner: Arc<PoolInner>,
}

impl fmt::Debug for BrowserPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrowserPool")
            .field("capacity", &self.capacity())
            .field("available", &self.inner.permits.available_permits())
            .finish()
    }
}

impl BrowserPool {
    /// Launches every process up front; fails if any of them cannot start.
    pub async fn launch(
        engine: Arc<dyn BrowserEngine>,
        config: PoolSection,
        retry: RetryPolicy,
        telemetry: Option<Arc<AutomationTelemetry>>,
    ) -> PoolResult<Self> {
        let launches = join_all((0..config.processes).map(|_| engine.launch())).await;
        let mut processes: Vec<Arc<dyn BrowserProcess>> = Vec::with_capacity(launches.len());
        let mut failure = None;
        for launched in launches {
            match launched {
                Ok(process) => processes.push(Arc::from(process)),
                Err(err) => failure = failure.or(Some(err)),
            }
        }
        if let Some(err) = failure {
            for process in processes {
                if let Err(shutdown_err) = process.shutdown().await {
                    warn!(process = %process.id(), error = %shutdown_err, "failed to stop process after launch failure");
                }
            }
            return Err(PoolError::Launch(err));
        }

        let slots = processes
            .into_iter()
            .map(|process| Slot {
                generation: 0,
                state: SlotState::Ready(process),
                active: 0,
            })
            .collect();
        info!(
            processes = config.processes,
            contexts_per_process = config.contexts_per_process,
            "browser pool ready"
        );
        Ok(Self {
            inner: Arc::new(PoolInner {
                engine,
                permits: Arc::new(Semaphore::new(config.capacity())),
                config,
                slots: Mutex::new(slots),
                slot_ready: Notify::new(),
                metrics: Mutex::new(PoolMetrics::default()),
                poison_events: Mutex::new(VecDeque::new()),
                retry,
                telemetry,
                shutdown: CancellationToken::new(),
            }),
        })
    }

    pub fn capacity(&self) -> usize {
        self.inner.config.capacity()
    }

    pub fn config(&self) -> &PoolSection {
        &self.inner.config
    }

    pub async fn acquire(&self, owner_job: &str) -> PoolResult<BrowserLease> {
        self.acquire_with_timeout(owner_job, self.inner.config.acquire_timeout())
            .await
    }

    /// Waits at most `wait` for a free context, then probes it before handing it out.
    pub async fn acquire_with_timeout(
        &self,
        owner_job: &str,
        wait: Duration,
    ) -> PoolResult<BrowserLease> {
        let inner = &self.inner;
        if inner.shutdown.is_cancelled() {
            return Err(PoolError::Closed);
        }
        let started = Instant::now();
        let deadline = started + wait;
        let permit = match timeout_at(deadline, Arc::clone(&inner.permits).acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(PoolError::Closed),
            Err(_) => return Err(inner.exhausted(started)),
        };

        let claim = loop {
            let notified = inner.slot_ready.notified();
            if let Some(reservation) = inner.reserve_slot() {
                break SlotClaim::new(inner, reservation);
            }
            if inner.shutdown.is_cancelled() {
                return Err(PoolError::Closed);
            }
            if timeout_at(deadline, notified).await.is_err() {
                return Err(inner.exhausted(started));
            }
        };

        let probe_timeout = inner.config.probe_timeout();
        let opened = match timeout(probe_timeout, claim.process().new_context()).await {
            Ok(result) => result,
            Err(_) => Err(BrowserError::Timeout(format!(
                "new context on process {}",
                claim.process().id()
            ))),
        };
        let probed = match opened {
            Ok(mut session) => match timeout(probe_timeout, session.probe()).await {
                Ok(Ok(())) => Ok(session),
                Ok(Err(err)) => Err((err, Some(session))),
                Err(_) => Err((BrowserError::Timeout("liveness probe".into()), Some(session))),
            },
            Err(err) => Err((err, None)),
        };

        match probed {
            Ok(session) => {
                let reservation = claim.keep();
                lock(&inner.metrics).record_grant();
                let lease = BrowserLease {
                    id: Uuid::new_v4().to_string(),
                    owner_job: owner_job.to_string(),
                    acquired_at: Utc::now(),
                    process_id: reservation.process.id().to_string(),
                    slot: reservation.slot,
                    generation: reservation.generation,
                    session: Some(session),
                    permit: Some(permit),
                    pool: Arc::downgrade(&self.inner),
                    released: false,
                };
                debug!(
                    lease = %lease.id,
                    job_id = owner_job,
                    process = %lease.process_id,
                    "lease granted"
                );
                Ok(lease)
            }
            Err((err, session)) => {
                let process_id = claim.process().id().to_string();
                warn!(
                    process = %process_id,
                    error = %err,
                    "liveness probe failed; poisoning process"
                );
                lock(&inner.metrics).record_probe_failure();
                inner.record_event(PoolEventKind::ProbeFailed, &process_id, &err.to_string());
                if let Some(session) = session {
                    close_detached(session);
                }
                claim.give_back(true);
                drop(permit);
                Err(PoolError::ProbeFailed {
                    process: process_id,
                    source: err,
                })
            }
        }
    }

    /// Returns a lease. A poisoned lease's process is destroyed and respawned.
    pub async fn release(&self, lease: &mut BrowserLease, poisoned: bool) -> PoolResult<()> {
        if lease.released {
            error!(lease = %lease.id, job_id = %lease.owner_job, "double release of browser lease");
            return Err(PoolError::AlreadyReleased(lease.id.clone()));
        }
        lease.released = true;
        let inner = &self.inner;
        let mut poisoned = poisoned;
        if let Some(session) = lease.session.take() {
            match timeout(inner.config.close_timeout(), session.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    warn!(lease = %lease.id, error = %err, "context close failed; poisoning process");
                    poisoned = true;
                }
                Err(_) => {
                    warn!(lease = %lease.id, "context close timed out; poisoning process");
                    poisoned = true;
                }
            }
        }
        inner.finish_slot_use(lease.slot, lease.generation, poisoned);
        lock(&inner.metrics).record_release(poisoned);
        drop(lease.permit.take());
        inner.slot_ready.notify_waiters();
        debug!(
            lease = %lease.id,
            job_id = %lease.owner_job,
            process = %lease.process_id,
            poisoned,
            "lease released"
        );
        Ok(())
    }

    pub fn health(&self) -> PoolHealth {
        let inner = &self.inner;
        let (processes, processes_alive) = {
            let slots = lock(&inner.slots);
            let alive = slots
                .iter()
                .filter(|slot| matches!(&slot.state, SlotState::Ready(process) if process.is_alive()))
                .count();
            (slots.len(), alive)
        };
        let capacity = self.capacity();
        PoolHealth {
            capacity,
            in_use: capacity.saturating_sub(inner.permits.available_permits()),
            processes,
            processes_alive,
            poisoned_recent_count: inner.recent_poison_count(),
            metrics: lock(&inner.metrics).clone(),
        }
    }

    /// Ids of the processes currently serving leases.
    pub fn process_ids(&self) -> Vec<String> {
        lock(&self.inner.slots)
            .iter()
            .filter_map(|slot| match &slot.state {
                SlotState::Ready(process) => Some(process.id().to_string()),
                _ => None,
            })
            .collect()
    }

    pub async fn shutdown(&self) {
        let inner = &self.inner;
        inner.shutdown.cancel();
        inner.permits.close();
        let processes: Vec<Arc<dyn BrowserProcess>> = {
            let mut slots = lock(&inner.slots);
            slots
                .iter_mut()
                .filter_map(|slot| {
                    match std::mem::replace(&mut slot.state, SlotState::Stopped) {
                        SlotState::Ready(process) => Some(process),
                        _ => None,
                    }
                })
                .collect()
        };
        inner.slot_ready.notify_waiters();
        for process in processes {
            match timeout(inner.config.close_timeout(), process.shutdown()).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(process = %process.id(), error = %err, "process shutdown failed"),
                Err(_) => warn!(process = %process.id(), "process shutdown timed out"),
            }
        }
        info!("browser pool shut down");
    }
}

impl PoolInner {
    fn exhausted(&self, started: Instant) -> PoolError {
        let waited_ms = started.elapsed().as_millis() as u64;
        lock(&self.metrics).record_acquire_timeout();
        self.record_event(PoolEventKind::AcquireTimeout, "-", &format!("waited {waited_ms}ms"));
        warn!(waited_ms, "browser pool saturated");
        PoolError::Exhausted { waited_ms }
    }

    /// Picks the least loaded ready process; dead processes are poisoned on the way.
    fn reserve_slot(self: &Arc<Self>) -> Option<Reservation> {
        let mut slots = lock(&self.slots);
        let mut dead = Vec::new();
        for (index, slot) in slots.iter().enumerate() {
            if let SlotState::Ready(process) = &slot.state {
                if !process.is_alive() {
                    dead.push(index);
                }
            }
        }
        for index in dead {
            self.poison_locked(&mut slots, index);
        }
        let limit = self.config.contexts_per_process;
        let (index, slot) = slots
            .iter_mut()
            .enumerate()
            .filter(|(_, slot)| matches!(slot.state, SlotState::Ready(_)) && slot.active < limit)
            .min_by_key(|(_, slot)| slot.active)?;
        let SlotState::Ready(process) = &slot.state else {
            return None;
        };
        slot.active += 1;
        Some(Reservation {
            slot: index,
            generation: slot.generation,
            process: Arc::clone(process),
        })
    }

    fn finish_slot_use(self: &Arc<Self>, index: usize, generation: u64, poisoned: bool) {
        let mut slots = lock(&self.slots);
        let Some(slot) = slots.get_mut(index) else {
            return;
        };
        // Leases of an older generation point at a process that is already gone.
        if slot.generation != generation {
            return;
        }
        slot.active = slot.active.saturating_sub(1);
        if poisoned {
            self.poison_locked(&mut slots, index);
        }
    }

    fn poison_locked(self: &Arc<Self>, slots: &mut [Slot], index: usize) {
        let slot = &mut slots[index];
        let old = match std::mem::replace(&mut slot.state, SlotState::Respawning) {
            SlotState::Ready(process) => process,
            other => {
                slot.state = other;
                return;
            }
        };
        slot.generation += 1;
        slot.active = 0;
        let generation = slot.generation;
        lock(&self.poison_events).push_back(Instant::now());
        warn!(process = %old.id(), slot = index, "browser process poisoned");
        self.record_event(PoolEventKind::Poisoned, old.id(), "process removed from circulation");
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            inner.respawn(index, generation, old).await;
        });
    }

    async fn respawn(self: Arc<Self>, index: usize, generation: u64, old: Arc<dyn BrowserProcess>) {
        let close_timeout = self.config.close_timeout();
        tokio::spawn(async move {
            match timeout(close_timeout, old.shutdown()).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => debug!(process = %old.id(), error = %err, "poisoned process shutdown failed"),
                Err(_) => debug!(process = %old.id(), "poisoned process shutdown timed out"),
            }
        });

        let mut attempt = 1u32;
        loop {
            if self.shutdown.is_cancelled() {
                return;
            }
            match self.engine.launch().await {
                Ok(process) => {
                    let process: Arc<dyn BrowserProcess> = Arc::from(process);
                    let installed = {
                        let mut slots = lock(&self.slots);
                        match slots.get_mut(index) {
                            Some(slot)
                                if slot.generation == generation
                                    && matches!(slot.state, SlotState::Respawning) =>
                            {
                                slot.state = SlotState::Ready(Arc::clone(&process));
                                true
                            }
                            _ => false,
                        }
                    };
                    if !installed {
                        if let Err(err) = process.shutdown().await {
                            debug!(process = %process.id(), error = %err, "stale respawned process shutdown failed");
                        }
                        return;
                    }
                    lock(&self.metrics).record_respawn(true);
                    self.record_event(PoolEventKind::Respawned, process.id(), "");
                    info!(process = %process.id(), slot = index, attempt, "browser process respawned");
                    self.slot_ready.notify_waiters();
                    return;
                }
                Err(err) => {
                    lock(&self.metrics).record_respawn(false);
                    self.record_event(PoolEventKind::RespawnFailed, "-", &err.to_string());
                    let delay = self
                        .retry
                        .delay_for(OperationKind::ResourceAcquisition, attempt);
                    warn!(slot = index, attempt, error = %err, delay_ms = delay.as_millis() as u64, "respawn failed");
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return,
                        _ = sleep(delay) => {}
                    }
                    attempt = attempt.saturating_add(1);
                }
            }
        }
    }

    fn recent_poison_count(&self) -> usize {
        let window = self.config.poison_window();
        let mut events = lock(&self.poison_events);
        let now = Instant::now();
        while let Some(front) = events.front() {
            if now.duration_since(*front) > window {
                events.pop_front();
            } else {
                break;
            }
        }
        events.len()
    }

    fn record_event(&self, event: PoolEventKind, process_id: &str, detail: &str) {
        if let Some(telemetry) = &self.telemetry {
            if let Err(err) = telemetry.record_pool_event(event, process_id, detail) {
                warn!(error = %err, "failed to record pool telemetry");
            }
        }
    }
}

/// Exclusive handle on one isolated browsing context.
pub struct BrowserLease {
    id: String,
    owner_job: String,
    acquired_at: DateTime<Utc>,
    process_id: String,
    slot: usize,
    generation: u64,
    session: Option<Box<dyn BrowserSession>>,
    permit: Option<OwnedSemaphorePermit>,
    pool: Weak<PoolInner>,
    released: bool,
}

impl fmt::Debug for BrowserLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrowserLease")
            .field("id", &self.id)
            .field("owner_job", &self.owner_job)
            .field("process_id", &self.process_id)
            .field("acquired_at", &self.acquired_at)
            .field("released", &self.released)
            .finish()
    }
}

impl BrowserLease {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn owner_job(&self) -> &str {
        &self.owner_job
    }

    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }

    pub fn process_id(&self) -> &str {
        &self.process_id
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    pub fn session(&mut self) -> PoolResult<&mut (dyn BrowserSession + 'static)> {
        self.session
            .as_deref_mut()
            .ok_or_else(|| PoolError::AlreadyReleased(self.id.clone()))
    }
}

impl Drop for BrowserLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        warn!(lease = %self.id, job_id = %self.owner_job, "BrowserLease dropped without release");
        if let Some(inner) = self.pool.upgrade() {
            inner.finish_slot_use(self.slot, self.generation, false);
            lock(&inner.metrics).record_leak();
            inner.record_event(PoolEventKind::Leaked, &self.process_id, &self.id);
            drop(self.permit.take());
            inner.slot_ready.notify_waiters();
        }
        if let Some(session) = self.session.take() {
            close_detached(session);
        }
    }
}

/// Closes a context on a background task when a runtime is available.
fn close_detached(session: Box<dyn BrowserSession>) {
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
        return;
    };
    handle.spawn(async move {
        if let Err(err) = session.close().await {
            debug!(error = %err, "detached context close failed");
        }
    });
}
