//! Scripted portal engine shared by the integration tests.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::time::{sleep, sleep_until, Instant};

use referee_core::auth::{AuthSettings, SecondFactorProvider};
use referee_core::browser::{
    BrowserEngine, BrowserError, BrowserPool, BrowserProcess, BrowserResult, BrowserSession,
    ContextState, Locator,
};
use referee_core::config::{ExtractionSection, PlatformSelectors, PoolSection, SecondFactorHints};
use referee_core::credentials::StaticCredentialSource;
use referee_core::orchestrator::{ExtractionOrchestrator, OrchestratorDeps, OrchestratorSettings};
use referee_core::platform::{PlatformKind, PlatformRegistry, PlatformSpec, ScriptExtractor};
use referee_core::retry::{Backoff, RetryPolicy};
use referee_core::session::SessionStore;
use referee_core::sink::MemoryResultSink;

pub const IDENTITY: &str = "editor@example.org";
pub const SECRET: &str = "correct horse battery staple";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// How a fake portal behaves for the lifetime of a test.
#[derive(Debug, Clone)]
pub struct Portal {
    pub spec: PlatformSpec,
    pub reject_credentials: bool,
    pub second_factor_code: Option<String>,
    pub records: Value,
    pub extraction_delay: Duration,
}

impl Portal {
    pub fn new(spec: PlatformSpec) -> Self {
        let second_factor_code = match spec.kind {
            PlatformKind::EmailCode => Some("482913".to_string()),
            _ => None,
        };
        Self {
            spec,
            reject_credentials: false,
            second_factor_code,
            records: default_records(),
            extraction_delay: Duration::ZERO,
        }
    }

    pub fn with_second_factor(mut self, code: &str) -> Self {
        self.second_factor_code = Some(code.to_string());
        self
    }

    pub fn rejecting(mut self) -> Self {
        self.reject_credentials = true;
        self
    }

    pub fn with_records(mut self, records: Value) -> Self {
        self.records = records;
        self
    }

    pub fn with_extraction_delay(mut self, delay: Duration) -> Self {
        self.extraction_delay = delay;
        self
    }
}

pub fn default_records() -> Value {
    json!([
        {
            "kind": "manuscript",
            "external_id": "MAFI-2024-0117",
            "fields": { "title": "Robust hedging under model uncertainty", "status": "Awaiting Reviewer Scores" }
        },
        {
            "kind": "referee",
            "external_id": "MAFI-2024-0117/R1",
            "fields": { "name": "A. Referee", "status": "Agreed" }
        }
    ])
}

struct PortalState {
    portal: Portal,
    tokens: HashSet<String>,
    logins: u32,
    extraction_failures: u32,
}

/// Everything the fake engine has done, plus knobs for failure injection.
#[derive(Default)]
pub struct World {
    portals: Mutex<HashMap<String, PortalState>>,
    log: Mutex<Vec<String>>,
    launches: AtomicU32,
    failing_launches: AtomicU32,
    failing_probes: AtomicU32,
    hang_close: AtomicBool,
    hang_window_cleanup: AtomicBool,
    context_delay: Mutex<Duration>,
    kill_on_login: AtomicU32,
    failing_navigations: AtomicU32,
    live_contexts: AtomicUsize,
    peak_contexts: AtomicUsize,
    dead: Mutex<HashSet<String>>,
    shut_down: Mutex<Vec<String>>,
    next_token: AtomicU32,
}

impl World {
    pub fn new(portals: Vec<Portal>) -> Arc<Self> {
        let world = Self::default();
        {
            let mut map = lock(&world.portals);
            for portal in portals {
                map.insert(
                    portal.spec.id.clone(),
                    PortalState {
                        portal,
                        tokens: HashSet::new(),
                        logins: 0,
                        extraction_failures: 0,
                    },
                );
            }
        }
        Arc::new(world)
    }

    fn record(&self, entry: String) {
        lock(&self.log).push(entry);
    }

    pub fn log(&self) -> Vec<String> {
        lock(&self.log).clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        lock(&self.log)
            .iter()
            .filter(|entry| entry.starts_with(prefix))
            .count()
    }

    pub fn logins(&self, platform_id: &str) -> u32 {
        lock(&self.portals)
            .get(platform_id)
            .map(|state| state.logins)
            .unwrap_or_default()
    }

    /// Server-side logout: every issued session token stops working.
    pub fn revoke_sessions(&self, platform_id: &str) {
        if let Some(state) = lock(&self.portals).get_mut(platform_id) {
            state.tokens.clear();
        }
    }

    pub fn fail_extractions(&self, platform_id: &str, count: u32) {
        if let Some(state) = lock(&self.portals).get_mut(platform_id) {
            state.extraction_failures = count;
        }
    }

    pub fn fail_launches(&self, count: u32) {
        self.failing_launches.store(count, Ordering::SeqCst);
    }

    pub fn fail_probes(&self, count: u32) {
        self.failing_probes.store(count, Ordering::SeqCst);
    }

    pub fn hang_close(&self, hang: bool) {
        self.hang_close.store(hang, Ordering::SeqCst);
    }

    /// Secondary windows never close and the primary page never takes focus.
    pub fn hang_window_cleanup(&self, hang: bool) {
        self.hang_window_cleanup.store(hang, Ordering::SeqCst);
    }

    pub fn fail_navigations(&self, count: u32) {
        self.failing_navigations.store(count, Ordering::SeqCst);
    }

    pub fn delay_contexts(&self, delay: Duration) {
        *lock(&self.context_delay) = delay;
    }

    /// The next `count` credential submissions crash the process serving them.
    pub fn kill_on_login(&self, count: u32) {
        self.kill_on_login.store(count, Ordering::SeqCst);
    }

    pub fn kill(&self, process_id: &str) {
        lock(&self.dead).insert(process_id.to_string());
    }

    pub fn launches(&self) -> u32 {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn live_contexts(&self) -> usize {
        self.live_contexts.load(Ordering::SeqCst)
    }

    pub fn peak_contexts(&self) -> usize {
        self.peak_contexts.load(Ordering::SeqCst)
    }

    pub fn shut_down(&self) -> Vec<String> {
        lock(&self.shut_down).clone()
    }

    fn take_one(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |value| value.checked_sub(1))
            .is_ok()
    }

    fn portal_for(&self, url: &str) -> Option<(String, Page)> {
        let portals = lock(&self.portals);
        portals.values().find_map(|state| {
            let spec = &state.portal.spec;
            if url == spec.login_url {
                Some((spec.id.clone(), Page::Login))
            } else if url == spec.extraction.url {
                Some((spec.id.clone(), Page::Listing))
            } else if url == spec.home_url {
                Some((spec.id.clone(), Page::Home))
            } else {
                None
            }
        })
    }

    fn portal(&self, id: &str) -> Option<Portal> {
        lock(&self.portals).get(id).map(|state| state.portal.clone())
    }

    fn token_valid(&self, id: &str, token: &str) -> bool {
        lock(&self.portals)
            .get(id)
            .map(|state| state.tokens.contains(token))
            .unwrap_or(false)
    }

    fn issue_token(&self, id: &str) -> String {
        let token = format!("tok-{}", self.next_token.fetch_add(1, Ordering::SeqCst));
        if let Some(state) = lock(&self.portals).get_mut(id) {
            state.tokens.insert(token.clone());
        }
        token
    }

    fn count_login(&self, id: &str) {
        if let Some(state) = lock(&self.portals).get_mut(id) {
            state.logins += 1;
        }
    }

    fn take_extraction_failure(&self, id: &str) -> bool {
        match lock(&self.portals).get_mut(id) {
            Some(state) if state.extraction_failures > 0 => {
                state.extraction_failures -= 1;
                true
            }
            _ => false,
        }
    }
}

pub struct FakeEngine {
    world: Arc<World>,
}

impl FakeEngine {
    pub fn new(world: Arc<World>) -> Arc<Self> {
        Arc::new(Self { world })
    }
}

#[async_trait]
impl BrowserEngine for FakeEngine {
    async fn launch(&self) -> BrowserResult<Box<dyn BrowserProcess>> {
        if World::take_one(&self.world.failing_launches) {
            return Err(BrowserError::Launch("chromium exited during startup".into()));
        }
        let number = self.world.launches.fetch_add(1, Ordering::SeqCst) + 1;
        let id = format!("proc-{number}");
        self.world.record(format!("launch {id}"));
        Ok(Box::new(FakeProcess {
            id,
            world: Arc::clone(&self.world),
            contexts: AtomicU32::new(0),
        }))
    }
}

pub struct FakeProcess {
    id: String,
    world: Arc<World>,
    contexts: AtomicU32,
}

#[async_trait]
impl BrowserProcess for FakeProcess {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_alive(&self) -> bool {
        !lock(&self.world.dead).contains(&self.id)
    }

    async fn new_context(&self) -> BrowserResult<Box<dyn BrowserSession>> {
        let delay = *lock(&self.world.context_delay);
        if !delay.is_zero() {
            sleep(delay).await;
        }
        if !self.is_alive() {
            return Err(BrowserError::ProcessGone(self.id.clone()));
        }
        let number = self.contexts.fetch_add(1, Ordering::SeqCst) + 1;
        let live = self.world.live_contexts.fetch_add(1, Ordering::SeqCst) + 1;
        self.world.peak_contexts.fetch_max(live, Ordering::SeqCst);
        Ok(Box::new(FakeSession {
            id: format!("{}/ctx-{number}", self.id),
            world: Arc::clone(&self.world),
            context: Arc::new(Mutex::new(ContextData::default())),
            page: Page::Blank,
            portal: None,
            url: "about:blank".into(),
            popup: false,
            fields: HashMap::new(),
        }))
    }

    async fn shutdown(&self) -> BrowserResult<()> {
        lock(&self.world.shut_down).push(self.id.clone());
        self.world.record(format!("shutdown {}", self.id));
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Page {
    Blank,
    Login,
    Rejected,
    SecondFactor,
    Authorize,
    Home,
    Listing,
    Closed,
}

#[derive(Default)]
struct ContextData {
    cookies: Vec<Value>,
    popup_pending: bool,
    authorized_in_popup: bool,
}

/// One context and page on a scripted portal.
pub struct FakeSession {
    id: String,
    world: Arc<World>,
    context: Arc<Mutex<ContextData>>,
    page: Page,
    portal: Option<String>,
    url: String,
    popup: bool,
    fields: HashMap<Locator, String>,
}

fn is(raw: &str, locator: &Locator) -> bool {
    Locator::parse(raw) == *locator
}

fn is_opt(raw: &Option<String>, locator: &Locator) -> bool {
    raw.as_deref().map(|raw| is(raw, locator)).unwrap_or(false)
}

impl FakeSession {
    fn portal(&self) -> Option<Portal> {
        self.portal.as_deref().and_then(|id| self.world.portal(id))
    }

    fn authenticated(&self, portal_id: &str) -> bool {
        lock(&self.context).cookies.iter().any(|cookie| {
            cookie["portal"] == portal_id
                && cookie["token"]
                    .as_str()
                    .map(|token| self.world.token_valid(portal_id, token))
                    .unwrap_or(false)
        })
    }

    fn grant(&mut self, portal_id: &str) {
        let token = self.world.issue_token(portal_id);
        lock(&self.context)
            .cookies
            .push(json!({ "name": "session", "portal": portal_id, "token": token }));
    }

    fn sync(&mut self) {
        if self.popup {
            return;
        }
        let mut context = lock(&self.context);
        if context.authorized_in_popup {
            context.authorized_in_popup = false;
            self.page = Page::Home;
        }
    }

    fn visible(&self, portal: &Portal, locator: &Locator) -> bool {
        let selectors = &portal.spec.selectors;
        let login_form = is(&selectors.identity, locator)
            || is_opt(&selectors.secret, locator)
            || is(&selectors.submit, locator);
        match self.page {
            Page::Login | Page::Rejected => {
                let form = if portal.spec.kind == PlatformKind::OauthRedirect && !self.popup {
                    is_opt(&selectors.oauth_trigger, locator)
                } else {
                    login_form
                };
                form || (self.page == Page::Rejected && is_opt(&selectors.rejected, locator))
            }
            Page::SecondFactor => {
                is_opt(&selectors.second_factor_prompt, locator)
                    || is_opt(&selectors.second_factor_input, locator)
                    || is_opt(&selectors.second_factor_submit, locator)
            }
            Page::Authorize => is_opt(&selectors.oauth_authorize, locator),
            Page::Home | Page::Listing => is(&selectors.authenticated, locator),
            Page::Blank | Page::Closed => false,
        }
    }

    fn submit_credentials(&mut self, portal: &Portal) {
        self.world.count_login(&portal.spec.id);
        if World::take_one(&self.world.kill_on_login) {
            self.world.record(format!("crash {}", self.process_id()));
            self.world.kill(self.process_id());
            return;
        }
        let identity_ok = self
            .fields
            .get(&Locator::parse(&portal.spec.selectors.identity))
            .map(|value| value == IDENTITY)
            .unwrap_or(false);
        if portal.reject_credentials || !identity_ok {
            self.page = Page::Rejected;
            return;
        }
        if self.popup {
            self.page = Page::Authorize;
        } else if portal.second_factor_code.is_some() {
            self.page = Page::SecondFactor;
        } else {
            self.grant(&portal.spec.id);
            self.page = Page::Home;
        }
    }

    fn verify_code(&mut self, portal: &Portal) {
        let input = portal
            .spec
            .selectors
            .second_factor_input
            .as_deref()
            .map(Locator::parse);
        let typed = input.and_then(|input| self.fields.get(&input).cloned());
        if typed.is_some() && typed == portal.second_factor_code {
            self.grant(&portal.spec.id);
            self.page = Page::Home;
        } else {
            self.world.record(format!("{} wrong_code", portal.spec.id));
        }
    }

    fn process_id(&self) -> &str {
        self.id.split('/').next().unwrap_or(&self.id)
    }

    fn ensure_open(&self) -> BrowserResult<()> {
        if lock(&self.world.dead).contains(self.process_id()) {
            return Err(BrowserError::ProcessGone(self.process_id().to_string()));
        }
        if self.page == Page::Closed {
            return Err(BrowserError::Popup("window is closed".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl BrowserSession for FakeSession {
    fn context_id(&self) -> &str {
        &self.id
    }

    async fn navigate(&mut self, url: &str) -> BrowserResult<()> {
        self.ensure_open()?;
        if World::take_one(&self.world.failing_navigations) {
            self.world.record(format!("navigate_failed {url}"));
            return Err(BrowserError::Navigation(format!(
                "{url}: net::ERR_CONNECTION_RESET"
            )));
        }
        self.world.record(format!("navigate {url}"));
        let Some((portal_id, page)) = self.world.portal_for(url) else {
            return Err(BrowserError::Navigation(format!(
                "{url}: net::ERR_NAME_NOT_RESOLVED"
            )));
        };
        self.page = match page {
            Page::Login => Page::Login,
            _ if self.authenticated(&portal_id) => page,
            _ => Page::Login,
        };
        self.portal = Some(portal_id);
        self.url = url.to_string();
        self.fields.clear();
        Ok(())
    }

    async fn fill(&mut self, locator: &Locator, value: &str) -> BrowserResult<()> {
        self.ensure_open()?;
        let Some(portal) = self.portal() else {
            return Err(BrowserError::ElementNotFound(locator.to_string()));
        };
        if !self.visible(&portal, locator) {
            return Err(BrowserError::ElementNotFound(locator.to_string()));
        }
        self.world.record(format!("fill {locator}"));
        self.fields.insert(locator.clone(), value.to_string());
        Ok(())
    }

    async fn click(&mut self, locator: &Locator) -> BrowserResult<()> {
        self.ensure_open()?;
        self.sync();
        let Some(portal) = self.portal() else {
            return Err(BrowserError::ElementNotFound(locator.to_string()));
        };
        if !self.visible(&portal, locator) {
            return Err(BrowserError::ElementNotFound(locator.to_string()));
        }
        self.world.record(format!("click {locator}"));
        let selectors = portal.spec.selectors.clone();
        match self.page {
            Page::Login | Page::Rejected
                if !self.popup && is_opt(&selectors.oauth_trigger, locator) =>
            {
                lock(&self.context).popup_pending = true;
            }
            Page::Login | Page::Rejected if is(&selectors.submit, locator) => {
                self.submit_credentials(&portal);
            }
            Page::Authorize if is_opt(&selectors.oauth_authorize, locator) => {
                self.grant(&portal.spec.id);
                lock(&self.context).authorized_in_popup = true;
                // The provider closes its own window once authorized.
                self.page = Page::Closed;
            }
            Page::SecondFactor if is_opt(&selectors.second_factor_submit, locator) => {
                self.verify_code(&portal);
            }
            _ => {}
        }
        Ok(())
    }

    async fn press_enter(&mut self, locator: &Locator) -> BrowserResult<()> {
        self.ensure_open()?;
        self.world.record(format!("enter {locator}"));
        if let Some(portal) = self.portal() {
            if self.page == Page::SecondFactor {
                self.verify_code(&portal);
            }
        }
        Ok(())
    }

    async fn is_present(&mut self, locator: &Locator) -> BrowserResult<bool> {
        self.ensure_open()?;
        self.sync();
        Ok(match self.portal() {
            Some(portal) => self.visible(&portal, locator),
            None => false,
        })
    }

    async fn text_contains(&mut self, needle: &str) -> BrowserResult<bool> {
        self.ensure_open()?;
        Ok(matches!(self.page, Page::Home | Page::Listing) && needle == "Log out")
    }

    async fn current_url(&mut self) -> BrowserResult<String> {
        Ok(self.url.clone())
    }

    async fn evaluate_json(&mut self, _script: &str) -> BrowserResult<Value> {
        self.ensure_open()?;
        self.world.record(format!("evaluate {}", self.url));
        let Some(portal) = self.portal() else {
            return Ok(json!({ "error": "blank page" }));
        };
        if !portal.extraction_delay.is_zero() {
            sleep(portal.extraction_delay).await;
        }
        if self.page != Page::Listing || !self.authenticated(&portal.spec.id) {
            return Ok(json!({ "error": "login required" }));
        }
        if self.world.take_extraction_failure(&portal.spec.id) {
            return Err(BrowserError::Navigation(format!(
                "{}: net::ERR_CONNECTION_RESET",
                self.url
            )));
        }
        Ok(portal.records.clone())
    }

    async fn export_state(&mut self) -> BrowserResult<ContextState> {
        Ok(ContextState {
            cookies: lock(&self.context).cookies.clone(),
            local_storage: Default::default(),
        })
    }

    async fn import_state(&mut self, state: &ContextState) -> BrowserResult<()> {
        self.world.record(format!("import_state {}", self.id));
        lock(&self.context).cookies = state.cookies.clone();
        Ok(())
    }

    async fn clear_state(&mut self) -> BrowserResult<()> {
        self.world.record(format!("clear_state {}", self.id));
        *lock(&self.context) = ContextData::default();
        self.page = Page::Blank;
        self.portal = None;
        self.fields.clear();
        Ok(())
    }

    async fn probe(&mut self) -> BrowserResult<()> {
        if World::take_one(&self.world.failing_probes) {
            return Err(BrowserError::ProcessGone(format!("{} stopped answering", self.id)));
        }
        Ok(())
    }

    async fn wait_for_popup(&mut self, timeout: Duration) -> BrowserResult<Box<dyn BrowserSession>> {
        let pending = std::mem::take(&mut lock(&self.context).popup_pending);
        if !pending {
            sleep(timeout).await;
            return Err(BrowserError::Popup(format!(
                "no window opened within {}s",
                timeout.as_secs()
            )));
        }
        self.world.record("popup_opened".to_string());
        Ok(Box::new(FakeSession {
            id: format!("{}/popup", self.id),
            world: Arc::clone(&self.world),
            context: Arc::clone(&self.context),
            page: Page::Login,
            portal: self.portal.clone(),
            url: self.url.clone(),
            popup: true,
            fields: HashMap::new(),
        }))
    }

    async fn focus(&mut self) -> BrowserResult<()> {
        if self.world.hang_window_cleanup.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.world.record("focus_primary".to_string());
        Ok(())
    }

    async fn close(self: Box<Self>) -> BrowserResult<()> {
        if self.popup {
            if self.world.hang_window_cleanup.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            self.world.record("popup_closed".to_string());
            return match self.page {
                Page::Closed => Err(BrowserError::Popup("window already closed".into())),
                _ => Ok(()),
            };
        }
        if self.world.hang_close.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.world.live_contexts.fetch_sub(1, Ordering::SeqCst);
        self.world.record(format!("close_context {}", self.id));
        Ok(())
    }
}

/// Second factor provider whose code shows up after a fixed delay.
pub struct ScriptedCodes {
    delay: Option<Duration>,
    code: String,
    calls: AtomicU32,
}

impl ScriptedCodes {
    pub fn after(delay: Duration, code: &str) -> Arc<Self> {
        Arc::new(Self {
            delay: Some(delay),
            code: code.to_string(),
            calls: AtomicU32::new(0),
        })
    }

    pub fn never() -> Arc<Self> {
        Arc::new(Self {
            delay: None,
            code: String::new(),
            calls: AtomicU32::new(0),
        })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SecondFactorProvider for ScriptedCodes {
    async fn get_code(
        &self,
        _platform_id: &str,
        _since: DateTime<Utc>,
        deadline: Instant,
    ) -> Option<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.delay {
            Some(delay) if Instant::now() + delay <= deadline => {
                sleep(delay).await;
                Some(self.code.clone())
            }
            _ => {
                sleep_until(deadline).await;
                None
            }
        }
    }
}

fn urls(id: &str) -> (String, String, String) {
    (
        format!("https://{id}.example.org/login"),
        format!("https://{id}.example.org/home"),
        format!("https://{id}.example.org/editor/tasks"),
    )
}

fn platform(id: &str, kind: PlatformKind, selectors: PlatformSelectors) -> PlatformSpec {
    let (login_url, home_url, listing_url) = urls(id);
    PlatformSpec {
        id: id.to_string(),
        kind,
        login_url,
        home_url,
        session_ttl: chrono::Duration::minutes(30),
        selectors,
        second_factor: SecondFactorHints::default(),
        extraction: ExtractionSection {
            url: listing_url,
            script: "window.__refereeRecords()".into(),
            timeout_seconds: 20,
        },
    }
}

/// Identity and secret on one form, with an optional token page.
pub fn credentials_platform(id: &str) -> PlatformSpec {
    platform(
        id,
        PlatformKind::Credentials,
        PlatformSelectors {
            identity: "#USERID".into(),
            secret: Some("#PASSWORD".into()),
            submit: "#logInButton".into(),
            authenticated: "#logout".into(),
            rejected: Some(".login-error".into()),
            second_factor_prompt: Some("#TOKEN_VALUE".into()),
            second_factor_input: Some("#TOKEN_VALUE".into()),
            second_factor_submit: Some("#VERIFY_BTN".into()),
            oauth_trigger: None,
            oauth_authorize: None,
        },
    )
}

pub fn oauth_platform(id: &str) -> PlatformSpec {
    platform(
        id,
        PlatformKind::OauthRedirect,
        PlatformSelectors {
            identity: "#username".into(),
            secret: Some("#password".into()),
            submit: "#signin".into(),
            authenticated: "#logout".into(),
            rejected: None,
            second_factor_prompt: None,
            second_factor_input: None,
            second_factor_submit: None,
            oauth_trigger: Some("text=Sign in with ORCID".into()),
            oauth_authorize: Some("#authorize".into()),
        },
    )
}

pub fn email_code_platform(id: &str) -> PlatformSpec {
    platform(
        id,
        PlatformKind::EmailCode,
        PlatformSelectors {
            identity: "#email".into(),
            secret: None,
            submit: "#sendCode".into(),
            authenticated: "text=Editor Main Menu".into(),
            rejected: None,
            second_factor_prompt: Some("#code".into()),
            second_factor_input: Some("#code".into()),
            second_factor_submit: None,
            oauth_trigger: None,
            oauth_authorize: None,
        },
    )
}

pub fn pool_section(processes: usize, contexts_per_process: usize) -> PoolSection {
    PoolSection {
        processes,
        contexts_per_process,
        acquire_timeout_seconds: 5,
        probe_timeout_seconds: 2,
        close_timeout_seconds: 2,
        poison_window_seconds: 60,
    }
}

pub fn retry_policy() -> RetryPolicy {
    RetryPolicy::uniform(Backoff::new(
        3,
        Duration::from_millis(200),
        Duration::from_secs(2),
        0.0,
    ))
    .with_operation(
        referee_core::failure::OperationKind::Authentication,
        Backoff::new(2, Duration::from_millis(500), Duration::from_secs(2), 0.0),
    )
}

pub fn auth_settings() -> AuthSettings {
    AuthSettings {
        step_timeout: Duration::from_secs(5),
        poll_interval: Duration::from_millis(100),
        second_factor_deadline: Duration::from_secs(30),
        popup_timeout: Duration::from_secs(5),
    }
}

pub async fn launch_pool(world: &Arc<World>, section: PoolSection) -> BrowserPool {
    BrowserPool::launch(FakeEngine::new(Arc::clone(world)), section, retry_policy(), None)
        .await
        .expect("pool should launch")
}

pub struct Harness {
    pub world: Arc<World>,
    pub pool: BrowserPool,
    pub orchestrator: ExtractionOrchestrator,
    pub sessions: Arc<SessionStore>,
    pub sink: Arc<MemoryResultSink>,
}

pub struct HarnessBuilder {
    portals: Vec<Portal>,
    pool: PoolSection,
    workers: usize,
    queue_capacity: usize,
    second_factor: Arc<dyn SecondFactorProvider>,
}

impl HarnessBuilder {
    pub fn new(portals: Vec<Portal>) -> Self {
        Self {
            portals,
            pool: pool_section(1, 2),
            workers: 2,
            queue_capacity: 8,
            second_factor: ScriptedCodes::never(),
        }
    }

    pub fn pool(mut self, section: PoolSection) -> Self {
        self.pool = section;
        self
    }

    pub fn workers(mut self, workers: usize, queue_capacity: usize) -> Self {
        self.workers = workers;
        self.queue_capacity = queue_capacity;
        self
    }

    pub fn second_factor(mut self, provider: Arc<dyn SecondFactorProvider>) -> Self {
        self.second_factor = provider;
        self
    }

    pub async fn build(self) -> Harness {
        let world = World::new(self.portals.clone());
        let pool = launch_pool(&world, self.pool).await;
        let mut registry = PlatformRegistry::new();
        let mut credentials = StaticCredentialSource::new();
        for portal in &self.portals {
            credentials = credentials.with(portal.spec.id.clone(), portal.spec.kind, IDENTITY, SECRET);
            registry.insert(portal.spec.clone(), Arc::new(ScriptExtractor::new()));
        }
        let sessions = Arc::new(SessionStore::new());
        let sink = Arc::new(MemoryResultSink::new());
        let orchestrator = ExtractionOrchestrator::new(
            OrchestratorDeps {
                pool: pool.clone(),
                sessions: Arc::clone(&sessions),
                platforms: Arc::new(registry),
                second_factor: self.second_factor,
                credentials: Arc::new(credentials),
                sink: Arc::clone(&sink) as Arc<dyn referee_core::sink::ResultSink>,
                retry: retry_policy(),
                telemetry: None,
            },
            OrchestratorSettings {
                workers: self.workers,
                queue_capacity: self.queue_capacity,
                auth: auth_settings(),
            },
        );
        Harness {
            world,
            pool,
            orchestrator,
            sessions,
            sink,
        }
    }
}
