pub mod auth;
pub mod browser;
pub mod config;
pub mod credentials;
pub mod error;
pub mod failure;
pub mod orchestrator;
pub mod platform;
pub mod retry;
pub mod session;
pub mod sink;
pub mod sqlite;

pub use auth::{
    AuthAttempt, AuthOutcome, AuthSettings, AuthState, AuthStateMachine, FallbackSecondFactor,
    HttpMailbox, LoginScript, MailboxSecondFactor, ManualSecondFactor, SecondFactorProvider,
};
pub use browser::{
    BrowserEngine, BrowserLease, BrowserPool, BrowserProcess, BrowserSession, ChromiumEngine,
    ContextState, Locator, PoolError, PoolHealth,
};
pub use config::{load_referee_config, RefereeConfig};
pub use credentials::{
    CredentialError, CredentialSource, Credentials, EnvCredentialSource, Secret,
    StaticCredentialSource,
};
pub use error::{ConfigError, Result};
pub use failure::{ErrorKind, ExtractionError, OperationKind};
pub use orchestrator::{
    ExtractionJob, ExtractionOrchestrator, ExtractionResult, JobId, JobOutcome, JobStatus,
    OrchestratorDeps, OrchestratorError, OrchestratorResult, OrchestratorSettings,
};
pub use platform::{
    Extractor, ExtractorError, PlatformKind, PlatformRegistry, PlatformSpec, RawRecord,
    RecordKind, ScriptExtractor,
};
pub use retry::{Backoff, RetryDecision, RetryPolicy, RetryRunner};
pub use session::{
    AuthSession, SessionBackend, SessionEntry, SessionRoute, SessionStore, SqliteSessionBackend,
};
pub use sink::{MemoryResultSink, ResultSink, SqliteResultSink};
