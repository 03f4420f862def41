mod automation;
mod engine;
mod error;
mod error_handler;
mod metrics;
mod pool;
mod profile;

pub use automation::{ChromiumEngine, ChromiumProcess, ChromiumSession};
pub use engine::{BrowserEngine, BrowserProcess, BrowserSession, ContextState, Locator};
pub use error::{BrowserError, BrowserResult};
pub use error_handler::{
    map_category, telemetry_failure, AutomationTelemetry, ErrorCategorizer, FailureContext,
    PoolEventKind, RemediationAction, RunContext, TelemetryError,
};
pub use metrics::PoolMetrics;
pub use pool::{BrowserLease, BrowserPool, PoolError, PoolHealth, PoolResult};
pub use profile::{ProcessProfile, ProfileManager};
