use std::collections::HashMap;
use std::fmt;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use referee_core::auth::{
    FallbackSecondFactor, MailboxSecondFactor, ManualSecondFactor, SecondFactorError,
    SecondFactorProvider,
};
use referee_core::browser::{
    AutomationTelemetry, BrowserError, BrowserPool, ChromiumEngine, PoolError, PoolHealth,
    TelemetryError,
};
use referee_core::config::{SecondFactorMode, SecondFactorHints};
use referee_core::session::{
    SessionBackend, SessionEntry, SessionStore, SessionStoreError, SqliteSessionBackend,
};
use referee_core::sink::{SinkError, SqliteResultSink};
use referee_core::{
    load_referee_config, EnvCredentialSource, ExtractionJob, ExtractionOrchestrator, JobOutcome,
    OrchestratorDeps, OrchestratorError, OrchestratorSettings, PlatformRegistry, RefereeConfig,
    RetryPolicy,
};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] referee_core::ConfigError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("browser error: {0}")]
    Browser(#[from] BrowserError),
    #[error("browser pool error: {0}")]
    Pool(#[from] PoolError),
    #[error("session store error: {0}")]
    SessionStore(#[from] SessionStoreError),
    #[error("results store error: {0}")]
    Sink(#[from] SinkError),
    #[error("telemetry error: {0}")]
    Telemetry(#[from] TelemetryError),
    #[error("second factor error: {0}")]
    SecondFactor(#[from] SecondFactorError),
    #[error("orchestrator error: {0}")]
    Orchestrator(#[from] OrchestratorError),
    #[error("unknown platform: {0}")]
    UnknownPlatform(String),
    #[error("required resource missing: {0}")]
    MissingResource(String),
    #[error("{failed} of {total} jobs failed")]
    JobsFailed { failed: usize, total: usize },
    #[error("one or more configuration checks failed")]
    ChecksFailed,
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Referee extraction control interface", long_about = None)]
pub struct Cli {
    /// Path to referee.toml
    #[arg(long, default_value = "configs/referee.toml")]
    pub config: PathBuf,
    /// Overrides session.database from the config
    #[arg(long)]
    pub sessions_db: Option<PathBuf>,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    pub log_level: String,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Runs one extraction job per platform and waits for all of them
    Extract(ExtractArgs),
    /// Inspects the persisted session cache
    #[command(subcommand)]
    Session(SessionCommands),
    /// Lists configured platforms
    Platforms,
    /// Configuration helpers
    #[command(subcommand)]
    Config(ConfigCommands),
    /// Prints shell completions
    Completions(CompletionsArgs),
}

#[derive(Args, Debug)]
pub struct ExtractArgs {
    /// Platform ids to extract from
    #[arg(required = true, num_args = 1..)]
    pub platforms: Vec<String>,
    /// Read `<platform> <code>` lines from stdin as verification codes.
    /// Always on when `second_factor.mode` is `manual` or a manual fallback.
    #[arg(long, default_value_t = false)]
    pub manual_codes: bool,
}

#[derive(Subcommand, Debug)]
pub enum SessionCommands {
    /// Lists stored sessions, expired ones included
    List,
    /// Drops the stored session of one platform
    Invalidate(SessionInvalidateArgs),
    /// Deletes expired sessions
    Purge,
}

#[derive(Args, Debug)]
pub struct SessionInvalidateArgs {
    pub platform: String,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Loads and validates the configuration
    Check,
}

#[derive(Args, Debug)]
pub struct CompletionsArgs {
    #[arg(value_enum)]
    pub shell: Shell,
}

pub fn run(cli: Cli) -> Result<()> {
    if let Commands::Completions(args) = &cli.command {
        write_completions(args.shell, &mut io::stdout())?;
        return Ok(());
    }

    let context = AppContext::new(&cli)?;
    match &cli.command {
        Commands::Extract(args) => {
            let report = context.extract(args)?;
            render(&report, cli.format)?;
            let failed = report.failed();
            if failed > 0 {
                return Err(AppError::JobsFailed {
                    failed,
                    total: report.jobs.len(),
                });
            }
        }
        Commands::Session(SessionCommands::List) => {
            let sessions = context.session_list()?;
            render(&sessions, cli.format)?;
        }
        Commands::Session(SessionCommands::Invalidate(args)) => {
            let result = context.session_invalidate(&args.platform)?;
            render(&result, cli.format)?;
        }
        Commands::Session(SessionCommands::Purge) => {
            let result = context.session_purge()?;
            render(&result, cli.format)?;
        }
        Commands::Platforms => {
            let platforms = context.platform_list();
            render(&platforms, cli.format)?;
        }
        Commands::Config(ConfigCommands::Check) => {
            let report = context.config_check();
            render(&report, cli.format)?;
            if report
                .iter()
                .any(|entry| matches!(entry.status, CheckStatus::Error))
            {
                return Err(AppError::ChecksFailed);
            }
        }
        Commands::Completions(_) => {}
    }

    Ok(())
}

pub fn write_completions(shell: Shell, out: &mut dyn Write) -> Result<()> {
    let mut command = Cli::command();
    clap_complete::generate(shell, &mut command, "refereectl", out);
    Ok(())
}

fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display());
            Ok(())
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{}", json);
            Ok(())
        }
    }
}

trait DisplayFallback {
    fn display(&self) -> String;
}

/// Splits a `<platform> <code>` line typed by an operator.
pub fn parse_code_line(line: &str) -> Option<(&str, &str)> {
    let mut parts = line.split_whitespace();
    let platform = parts.next()?;
    let code = parts.next()?;
    if parts.next().is_some() {
        return None;
    }
    Some((platform, code))
}

#[derive(Debug)]
struct AppContext {
    config: RefereeConfig,
    config_path: PathBuf,
    sessions_db: Option<PathBuf>,
}

impl AppContext {
    fn new(cli: &Cli) -> Result<Self> {
        let config_path = cli.config.clone();
        let config = load_referee_config(&config_path)?;
        let sessions_db = cli
            .sessions_db
            .clone()
            .or_else(|| config.session.database.as_ref().map(PathBuf::from));
        Ok(Self {
            config,
            config_path,
            sessions_db,
        })
    }

    fn session_backend(&self) -> Result<SqliteSessionBackend> {
        let path = self.sessions_db.as_ref().ok_or_else(|| {
            AppError::MissingResource("session.database is not configured".into())
        })?;
        Ok(SqliteSessionBackend::new(path)?)
    }

    fn session_list(&self) -> Result<SessionList> {
        let backend = self.session_backend()?;
        let now = Utc::now();
        let mut rows: Vec<SessionEntry> = backend
            .load_all()?
            .into_iter()
            .map(|session| SessionEntry {
                platform_id: session.platform_id().to_string(),
                issued_at: session.issued_at(),
                expires_at: session.expires_at(),
                route: session.route(),
                state_bytes: session.state().len(),
                valid: session.is_valid_at(now),
            })
            .collect();
        rows.sort_by(|a, b| a.platform_id.cmp(&b.platform_id));
        Ok(SessionList { rows })
    }

    fn session_invalidate(&self, platform: &str) -> Result<SessionChange> {
        let backend = self.session_backend()?;
        let removed = usize::from(backend.delete(platform)?);
        Ok(SessionChange {
            action: "invalidate",
            removed,
        })
    }

    fn session_purge(&self) -> Result<SessionChange> {
        let backend = self.session_backend()?;
        let removed = backend.purge_expired(Utc::now())?;
        Ok(SessionChange {
            action: "purge",
            removed,
        })
    }

    fn platform_list(&self) -> PlatformList {
        let rows = self
            .config
            .platforms
            .iter()
            .map(|platform| PlatformEntry {
                id: platform.id.clone(),
                kind: platform.kind.to_string(),
                login_url: platform.login_url.clone(),
                session_ttl_seconds: platform
                    .session_ttl_seconds
                    .unwrap_or(self.config.session.ttl_seconds),
                extraction_timeout_seconds: platform.extraction.timeout_seconds,
            })
            .collect();
        PlatformList { rows }
    }

    fn config_check(&self) -> Vec<CheckEntry> {
        let mut entries = vec![CheckEntry::ok(
            "config",
            format!(
                "{} ({} platforms, {} contexts, {} workers)",
                self.config_path.display(),
                self.config.platforms.len(),
                self.config.pool.capacity(),
                self.config.workers.count
            ),
        )];

        entries.push(self.check_path(
            "chromium",
            Path::new(&self.config.chromium.executable_path),
        ));

        let section = &self.config.second_factor;
        let needs_mailbox = !matches!(section.mode, SecondFactorMode::Manual);
        entries.push(match (&section.mailbox_url, needs_mailbox) {
            (Some(url), true) => CheckEntry::ok("mailbox", url.clone()),
            (None, true) => CheckEntry::error("mailbox", "second_factor.mailbox_url is not set"),
            (_, false) => CheckEntry::ok("mailbox", "manual codes only"),
        });
        if let (Some(variable), true) = (&section.mailbox_token_env, needs_mailbox) {
            entries.push(self.check_env("mailbox token", variable));
        }

        match &self.sessions_db {
            Some(path) => entries.push(CheckEntry::ok("sessions", path.display().to_string())),
            None => entries.push(CheckEntry::warn(
                "sessions",
                "no session database; sessions are kept in memory only",
            )),
        }

        for platform in &self.config.platforms {
            let (identity, secret) = EnvCredentialSource::variable_names(&platform.id);
            entries.push(self.check_env(&format!("{} identity", platform.id), &identity));
            if platform.kind != referee_core::PlatformKind::EmailCode {
                entries.push(self.check_env(&format!("{} secret", platform.id), &secret));
            }
        }
        entries
    }

    fn check_path(&self, name: &str, path: &Path) -> CheckEntry {
        if path.exists() {
            CheckEntry::ok(name, path.display().to_string())
        } else {
            CheckEntry::warn(name, format!("{} not found", path.display()))
        }
    }

    fn check_env(&self, name: &str, variable: &str) -> CheckEntry {
        match std::env::var(variable) {
            Ok(value) if !value.trim().is_empty() => CheckEntry::ok(name, format!("{variable} set")),
            _ => CheckEntry::warn(name, format!("{variable} not set")),
        }
    }

    fn extract(&self, args: &ExtractArgs) -> Result<ExtractReport> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?;
        runtime.block_on(self.extract_async(args))
    }

    async fn extract_async(&self, args: &ExtractArgs) -> Result<ExtractReport> {
        let platforms = Arc::new(PlatformRegistry::from_config(&self.config));
        if let Some(unknown) = args.platforms.iter().find(|id| !platforms.contains(id)) {
            return Err(AppError::UnknownPlatform(unknown.clone()));
        }

        let observability = &self.config.observability;
        let telemetry = Arc::new(AutomationTelemetry::new(
            &observability.failure_log,
            &observability.metrics_db,
        )?);
        let sink = Arc::new(SqliteResultSink::new(&observability.results_db)?);

        let sessions = match &self.sessions_db {
            Some(_) => {
                let store = SessionStore::with_backend(Arc::new(self.session_backend()?));
                store.load_from_backend()?;
                store
            }
            None => SessionStore::new(),
        };

        let manual = reads_stdin_codes(self.config.second_factor.mode, args.manual_codes)
            .then(|| Arc::new(ManualSecondFactor::new()));
        if let Some(manual) = &manual {
            info!("reading `<platform> <code>` lines from stdin");
            spawn_code_reader(Arc::clone(manual));
        }
        let second_factor = self.second_factor_provider(&platforms, manual)?;

        let retry = RetryPolicy::new(&self.config.retry);
        let engine = Arc::new(ChromiumEngine::new(self.config.chromium.clone())?);
        let pool = BrowserPool::launch(
            engine,
            self.config.pool.clone(),
            retry.clone(),
            Some(Arc::clone(&telemetry)),
        )
        .await?;

        let deps = OrchestratorDeps {
            pool,
            sessions: Arc::new(sessions),
            platforms: Arc::clone(&platforms),
            second_factor,
            credentials: Arc::new(EnvCredentialSource::from_registry(&platforms)),
            sink,
            retry,
            telemetry: Some(telemetry),
        };
        let orchestrator = Arc::new(ExtractionOrchestrator::new(
            deps,
            OrchestratorSettings::from(&self.config),
        ));
        orchestrator.start();

        let mut ids = Vec::with_capacity(args.platforms.len());
        for platform in &args.platforms {
            match orchestrator.submit_job(platform) {
                Ok(id) => ids.push(id),
                Err(err) => {
                    orchestrator.shutdown().await;
                    return Err(err.into());
                }
            }
        }
        info!(jobs = ids.len(), "extraction jobs submitted");

        let interrupt = {
            let orchestrator = Arc::clone(&orchestrator);
            let ids = ids.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupted, cancelling jobs");
                    for id in &ids {
                        orchestrator.cancel_job(id);
                    }
                }
            })
        };

        let mut jobs = Vec::with_capacity(ids.len());
        for id in &ids {
            jobs.push(orchestrator.wait_for_job(id).await?);
        }
        interrupt.abort();

        let pool = orchestrator.pool_health();
        orchestrator.shutdown().await;
        Ok(ExtractReport { jobs, pool })
    }

    fn second_factor_provider(
        &self,
        platforms: &PlatformRegistry,
        manual: Option<Arc<ManualSecondFactor>>,
    ) -> Result<Arc<dyn SecondFactorProvider>> {
        let section = &self.config.second_factor;
        let hints: HashMap<String, SecondFactorHints> = platforms
            .iter()
            .map(|platform| (platform.spec.id.clone(), platform.spec.second_factor.clone()))
            .collect();
        let provider: Arc<dyn SecondFactorProvider> = match (section.mode, manual) {
            (SecondFactorMode::Manual, Some(manual)) => manual,
            (SecondFactorMode::Manual, None) => Arc::new(ManualSecondFactor::new()),
            (_, Some(manual)) => Arc::new(FallbackSecondFactor::new(
                Arc::new(MailboxSecondFactor::from_config(section, hints)?),
                manual,
            )),
            (_, None) => Arc::new(MailboxSecondFactor::from_config(section, hints)?),
        };
        Ok(provider)
    }
}

fn reads_stdin_codes(mode: SecondFactorMode, manual_codes: bool) -> bool {
    manual_codes || mode != SecondFactorMode::Mailbox
}

/// Feeds operator-typed codes into `manual` until stdin closes.
fn spawn_code_reader(manual: Arc<ManualSecondFactor>) {
    std::thread::spawn(move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else {
                break;
            };
            match parse_code_line(&line) {
                Some((platform, code)) => manual.submit(platform, code),
                None if line.trim().is_empty() => {}
                None => warn!(line = %line.trim(), "expected `<platform> <code>`"),
            }
        }
    });
}

#[derive(Debug, Serialize)]
pub struct ExtractReport {
    pub jobs: Vec<ExtractionJob>,
    pub pool: PoolHealth,
}

impl ExtractReport {
    fn failed(&self) -> usize {
        self.jobs
            .iter()
            .filter(|job| matches!(job.outcome, Some(JobOutcome::Failed(_))))
            .count()
    }
}

impl DisplayFallback for ExtractReport {
    fn display(&self) -> String {
        let mut lines = Vec::new();
        for job in &self.jobs {
            let detail = match &job.outcome {
                Some(JobOutcome::Succeeded(result)) => format!(
                    "{} records in {} ms{}",
                    result.record_count,
                    result.duration_ms,
                    if job.used_cached_session {
                        " (cached session)"
                    } else {
                        ""
                    }
                ),
                Some(JobOutcome::Failed(error)) => error.to_string(),
                None => "no outcome".to_string(),
            };
            lines.push(format!(
                "{platform:<12} {status:<10} {id}  {detail}",
                platform = job.platform_id,
                status = job.status,
                id = job.id,
            ));
        }
        lines.push(format!(
            "pool: {in_use}/{capacity} in use, {alive}/{processes} processes alive, {poisoned} poisoned recently",
            in_use = self.pool.in_use,
            capacity = self.pool.capacity,
            alive = self.pool.processes_alive,
            processes = self.pool.processes,
            poisoned = self.pool.poisoned_recent_count,
        ));
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct SessionList {
    pub rows: Vec<SessionEntry>,
}

impl DisplayFallback for SessionList {
    fn display(&self) -> String {
        if self.rows.is_empty() {
            return "No stored sessions".to_string();
        }
        self.rows
            .iter()
            .map(|row| {
                format!(
                    "{platform:<12} {route:<16} expires {expires} {valid}",
                    platform = row.platform_id,
                    route = row.route.as_str(),
                    expires = row.expires_at.to_rfc3339_opts(SecondsFormat::Secs, true),
                    valid = if row.valid { "" } else { "(expired)" },
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct SessionChange {
    pub action: &'static str,
    pub removed: usize,
}

impl DisplayFallback for SessionChange {
    fn display(&self) -> String {
        format!("{}: {} session(s) removed", self.action, self.removed)
    }
}

#[derive(Debug, Serialize)]
pub struct PlatformList {
    pub rows: Vec<PlatformEntry>,
}

#[derive(Debug, Serialize)]
pub struct PlatformEntry {
    pub id: String,
    pub kind: String,
    pub login_url: String,
    pub session_ttl_seconds: u64,
    pub extraction_timeout_seconds: u64,
}

impl DisplayFallback for PlatformList {
    fn display(&self) -> String {
        if self.rows.is_empty() {
            return "No platforms configured".to_string();
        }
        self.rows
            .iter()
            .map(|row| {
                format!(
                    "{id:<12} {kind:<16} ttl={ttl}s {url}",
                    id = row.id,
                    kind = row.kind,
                    ttl = row.session_ttl_seconds,
                    url = row.login_url,
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct CheckEntry {
    pub name: String,
    pub status: CheckStatus,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Ok,
    Warn,
    Error,
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CheckStatus::Ok => "OK",
            CheckStatus::Warn => "WARN",
            CheckStatus::Error => "ERROR",
        };
        write!(f, "{label}")
    }
}

impl CheckEntry {
    fn ok(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Ok,
            detail: detail.into(),
        }
    }

    fn warn(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Warn,
            detail: detail.into(),
        }
    }

    fn error(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Error,
            detail: detail.into(),
        }
    }
}

impl DisplayFallback for Vec<CheckEntry> {
    fn display(&self) -> String {
        self.iter()
            .map(|entry| format!("[{}] {}: {}", entry.status, entry.name, entry.detail))
            .collect::<Vec<_>>()
            .join("\n")
    }
}
