use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig as ChromiumConfig};
use chromiumoxide::cdp::browser_protocol::browser::BrowserContextId;
use chromiumoxide::cdp::browser_protocol::network::{CookieParam, SetUserAgentOverrideParams};
use chromiumoxide::cdp::browser_protocol::page::{
    AddScriptToEvaluateOnNewDocumentParams, NavigateParams,
};
use chromiumoxide::cdp::browser_protocol::storage::ClearCookiesParams;
use chromiumoxide::cdp::browser_protocol::target::{
    CreateBrowserContextParams, CreateTargetParams, DisposeBrowserContextParams,
    GetTargetInfoParams, TargetId,
};
use chromiumoxide::page::Page;
use futures::StreamExt;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ChromiumSection;

use super::engine::{BrowserEngine, BrowserProcess, BrowserSession, ContextState, Locator};
use super::error::{BrowserError, BrowserResult};
use super::profile::{ProcessProfile, ProfileManager};

const LOCATOR_ATTRIBUTE: &str = "data-referee-locator";
const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";

/// Launches one Chromium process per pool slot.
#[derive(Debug, Clone)]
pub struct ChromiumEngine {
    config: Arc<ChromiumSection>,
    profiles: ProfileManager,
}

impl ChromiumEngine {
    pub fn new(config: ChromiumSection) -> BrowserResult<Self> {
        // Stale profiles only survive a crash; a day is plenty.
        let profiles =
            ProfileManager::new(&config.profile_dir, Duration::from_secs(24 * 60 * 60))?;
        Ok(Self {
            config: Arc::new(config),
            profiles,
        })
    }

    pub fn config(&self) -> &ChromiumSection {
        &self.config
    }

    fn user_agent(&self) -> String {
        self.config
            .user_agent
            .clone()
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string())
    }

    fn build_chromium_config(&self, profile: &ProcessProfile) -> BrowserResult<ChromiumConfig> {
        let mut builder = ChromiumConfig::builder()
            .chrome_executable(&self.config.executable_path)
            .user_data_dir(profile.path());

        if !self.config.headless {
            builder = builder.with_head();
        }
        if !self.config.sandbox {
            builder = builder.no_sandbox();
        }
        if let Some(timeout) = self.config.request_timeout_seconds {
            builder = builder.request_timeout(Duration::from_secs(timeout));
        }

        let mut args = vec![format!("--user-agent={}", self.user_agent())];
        if self.config.disable_gpu {
            args.push("--disable-gpu".into());
        }
        if let Some(lang) = &self.config.lang {
            args.push(format!("--lang={lang}"));
        }
        args.push("--no-first-run".into());
        args.push("--disable-features=AutomationControlled".into());
        args.push("--disable-background-timer-throttling".into());
        args.push("--password-store=basic".into());
        args.extend(self.config.extra_args.iter().cloned());

        builder = builder.args(args);
        builder.build().map_err(BrowserError::Configuration)
    }
}

#[async_trait]
impl BrowserEngine for ChromiumEngine {
    async fn launch(&self) -> BrowserResult<Box<dyn BrowserProcess>> {
        if let Err(err) = self.profiles.cleanup_expired() {
            warn!(error = %err, "failed to clean up expired profiles");
        }
        let profile = self.profiles.allocate()?;
        let chromium_config = self.build_chromium_config(&profile)?;
        info!(
            profile = %profile.id(),
            headless = self.config.headless,
            "Launching Chromium process"
        );

        let (browser, mut handler) = Browser::launch(chromium_config)
            .await
            .map_err(|err| BrowserError::Launch(err.to_string()))?;

        let alive = Arc::new(AtomicBool::new(true));
        let alive_flag = Arc::clone(&alive);
        let profile_id = profile.id().to_string();
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(err) = event {
                    debug!(error = %err, "Chromium handler reported error");
                }
            }
            alive_flag.store(false, Ordering::SeqCst);
            debug!(profile = %profile_id, "Chromium handler finished");
        });

        profile.touch().await?;

        Ok(Box::new(ChromiumProcess {
            id: profile.id().to_string(),
            browser: Arc::new(AsyncMutex::new(browser)),
            profile,
            handler_task: std::sync::Mutex::new(Some(handler_task)),
            alive,
            user_agent: self.user_agent(),
            lang: self.config.lang.clone(),
        }))
    }
}

pub struct ChromiumProcess {
    id: String,
    browser: Arc<AsyncMutex<Browser>>,
    profile: ProcessProfile,
    handler_task: std::sync::Mutex<Option<JoinHandle<()>>>,
    alive: Arc<AtomicBool>,
    user_agent: String,
    lang: Option<String>,
}

impl std::fmt::Debug for ChromiumProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChromiumProcess")
            .field("id", &self.id)
            .field("profile", &self.profile.path())
            .field("alive", &self.alive.load(Ordering::SeqCst))
            .finish()
    }
}

impl ChromiumProcess {
    async fn configure_page(&self, page: &Page) -> BrowserResult<()> {
        page.enable_stealth_mode_with_agent(&self.user_agent).await?;

        let mut params_builder =
            SetUserAgentOverrideParams::builder().user_agent(self.user_agent.clone());
        if let Some(lang) = &self.lang {
            params_builder = params_builder.accept_language(lang.clone());
        }
        let params = params_builder
            .build()
            .map_err(BrowserError::Configuration)?;
        page.set_user_agent(params).await?;
        Ok(())
    }
}

#[async_trait]
impl BrowserProcess for ChromiumProcess {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn new_context(&self) -> BrowserResult<Box<dyn BrowserSession>> {
        if !self.is_alive() {
            return Err(BrowserError::ProcessGone(format!(
                "process {} handler stopped",
                self.id
            )));
        }
        let (page, context_id) = {
            let browser = self.browser.lock().await;
            let created = browser
                .execute(CreateBrowserContextParams::default())
                .await?;
            let context_id = created.result.browser_context_id.clone();
            let params = CreateTargetParams::builder()
                .url("about:blank")
                .browser_context_id(context_id.clone())
                .build()
                .map_err(BrowserError::Configuration)?;
            let page = browser.new_page(params).await?;
            (page, context_id)
        };
        self.configure_page(&page).await?;
        Ok(Box::new(ChromiumSession {
            label: context_id.inner().clone(),
            context_id,
            page,
            browser: Arc::clone(&self.browser),
            owns_context: true,
            seen_popups: HashSet::new(),
        }))
    }

    async fn shutdown(&self) -> BrowserResult<()> {
        info!(process = %self.id, "Shutting down Chromium process");
        {
            let mut browser = self.browser.lock().await;
            if let Err(err) = browser.close().await {
                warn!(error = %err, "Failed to close browser gracefully");
            }
            if let Err(err) = browser.wait().await {
                debug!(error = %err, "Browser wait after close failed");
            }
        }
        let handle = match self.handler_task.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                warn!(error = %err, "Browser handler join error");
            }
        }
        self.alive.store(false, Ordering::SeqCst);
        self.profile.remove().await
    }
}

impl Drop for ChromiumProcess {
    fn drop(&mut self) {
        let unfinished = match self.handler_task.get_mut() {
            Ok(handle) => handle.as_ref().map(|h| !h.is_finished()).unwrap_or(false),
            Err(_) => false,
        };
        if unfinished {
            warn!(process = %self.id, "ChromiumProcess dropped without explicit shutdown");
        }
    }
}

pub struct ChromiumSession {
    label: String,
    context_id: BrowserContextId,
    page: Page,
    browser: Arc<AsyncMutex<Browser>>,
    owns_context: bool,
    seen_popups: HashSet<TargetId>,
}

impl ChromiumSession {
    async fn eval<T: serde::de::DeserializeOwned>(&self, script: &str) -> BrowserResult<T> {
        self.page
            .evaluate(script)
            .await
            .map_err(|err| BrowserError::Script(err.to_string()))?
            .into_value()
            .map_err(|err| BrowserError::Script(format!("failed to decode result: {err}")))
    }

    /// Resolves a locator to a CSS selector, tagging text matches first.
    async fn resolve(&self, locator: &Locator) -> BrowserResult<Option<String>> {
        match locator {
            Locator::Css(selector) => {
                let script = format!(
                    "document.querySelector({}) !== null",
                    serde_json::to_string(selector).unwrap_or_default()
                );
                let present: bool = self.eval(&script).await?;
                Ok(present.then(|| selector.clone()))
            }
            Locator::Text(text) => {
                let token = Uuid::new_v4().simple().to_string();
                let script = text_locator_script(text, &token);
                let found: bool = self.eval(&script).await?;
                Ok(found.then(|| format!("[{LOCATOR_ATTRIBUTE}='{token}']")))
            }
        }
    }

    async fn require(&self, locator: &Locator) -> BrowserResult<String> {
        self.resolve(locator)
            .await?
            .ok_or_else(|| BrowserError::ElementNotFound(locator.to_string()))
    }

    async fn current_origin(&self) -> Option<String> {
        let current = self.page.url().await.ok().flatten()?;
        let parsed = url::Url::parse(&current).ok()?;
        match parsed.origin() {
            origin @ url::Origin::Tuple(..) => Some(origin.ascii_serialization()),
            url::Origin::Opaque(_) => None,
        }
    }
}

#[async_trait]
impl BrowserSession for ChromiumSession {
    fn context_id(&self) -> &str {
        &self.label
    }

    async fn navigate(&mut self, url: &str) -> BrowserResult<()> {
        let params = NavigateParams::builder()
            .url(url)
            .build()
            .map_err(BrowserError::Configuration)?;
        self.page
            .goto(params)
            .await
            .map_err(|err| BrowserError::Navigation(format!("{url}: {err}")))?;
        self.page.wait_for_navigation().await?;
        Ok(())
    }

    async fn fill(&mut self, locator: &Locator, value: &str) -> BrowserResult<()> {
        let selector = self.require(locator).await?;
        let clear = format!(
            "(() => {{ const el = document.querySelector({}); if (el) {{ el.value = ''; }} return true; }})()",
            serde_json::to_string(&selector).unwrap_or_default()
        );
        let _: bool = self.eval(&clear).await?;
        let element = self.page.find_element(selector.as_str()).await?;
        element.click().await?;
        element.type_str(value).await?;
        Ok(())
    }

    async fn click(&mut self, locator: &Locator) -> BrowserResult<()> {
        let selector = self.require(locator).await?;
        let element = self.page.find_element(selector.as_str()).await?;
        element.click().await?;
        Ok(())
    }

    async fn press_enter(&mut self, locator: &Locator) -> BrowserResult<()> {
        let selector = self.require(locator).await?;
        let element = self.page.find_element(selector.as_str()).await?;
        element.press_key("Enter").await?;
        Ok(())
    }

    async fn is_present(&mut self, locator: &Locator) -> BrowserResult<bool> {
        Ok(self.resolve(locator).await?.is_some())
    }

    async fn text_contains(&mut self, needle: &str) -> BrowserResult<bool> {
        let script = format!(
            "(() => !!document.body && document.body.innerText.includes({}))()",
            serde_json::to_string(needle).unwrap_or_default()
        );
        self.eval(&script).await
    }

    async fn current_url(&mut self) -> BrowserResult<String> {
        Ok(self.page.url().await?.unwrap_or_default())
    }

    async fn evaluate_json(&mut self, script: &str) -> BrowserResult<serde_json::Value> {
        self.eval(script).await
    }

    async fn export_state(&mut self) -> BrowserResult<ContextState> {
        let cookies = self
            .page
            .get_cookies()
            .await?
            .into_iter()
            .map(|cookie| {
                serde_json::to_value(cookie)
                    .map_err(|err| BrowserError::State(format!("failed to encode cookie: {err}")))
            })
            .collect::<BrowserResult<Vec<_>>>()?;
        let mut local_storage = BTreeMap::new();
        if let Some(origin) = self.current_origin().await {
            let entries: BTreeMap<String, String> = self
                .eval("(() => { try { return Object.assign({}, window.localStorage); } catch (_) { return {}; } })()")
                .await?;
            if !entries.is_empty() {
                local_storage.insert(origin, entries);
            }
        }
        Ok(ContextState {
            cookies,
            local_storage,
        })
    }

    async fn import_state(&mut self, state: &ContextState) -> BrowserResult<()> {
        let mut params = Vec::with_capacity(state.cookies.len());
        for cookie in &state.cookies {
            params.push(cookie_param(cookie)?);
        }
        if !params.is_empty() {
            self.page.set_cookies(params).await?;
        }
        for (origin, entries) in &state.local_storage {
            let script = format!(
                "(() => {{ if (location.origin !== {origin}) return; const entries = {entries}; for (const [k, v] of Object.entries(entries)) {{ try {{ localStorage.setItem(k, v); }} catch (_) {{}} }} }})();",
                origin = serde_json::to_string(origin).unwrap_or_default(),
                entries = serde_json::to_string(entries).unwrap_or_default(),
            );
            self.page
                .evaluate_on_new_document(
                    AddScriptToEvaluateOnNewDocumentParams::builder()
                        .source(script)
                        .build()
                        .map_err(BrowserError::Configuration)?,
                )
                .await?;
        }
        Ok(())
    }

    async fn clear_state(&mut self) -> BrowserResult<()> {
        {
            let browser = self.browser.lock().await;
            browser
                .execute(ClearCookiesParams {
                    browser_context_id: Some(self.context_id.clone()),
                })
                .await?;
        }
        let _: bool = self
            .eval("(() => { try { localStorage.clear(); sessionStorage.clear(); } catch (_) {} return true; })()")
            .await?;
        self.navigate("about:blank").await
    }

    async fn probe(&mut self) -> BrowserResult<()> {
        let value: i64 = self.eval("1 + 1").await?;
        if value == 2 {
            Ok(())
        } else {
            Err(BrowserError::Unexpected(format!("probe returned {value}")))
        }
    }

    async fn wait_for_popup(&mut self, timeout: Duration) -> BrowserResult<Box<dyn BrowserSession>> {
        let own_target = self.page.target_id().clone();
        let deadline = Instant::now() + timeout;
        loop {
            let pages = {
                let browser = self.browser.lock().await;
                browser.pages().await?
            };
            for page in pages {
                let target = page.target_id().clone();
                if target == own_target || self.seen_popups.contains(&target) {
                    continue;
                }
                let info = page.execute(GetTargetInfoParams::default()).await?;
                if info.result.target_info.opener_id.as_ref() == Some(&own_target) {
                    self.seen_popups.insert(target);
                    return Ok(Box::new(ChromiumSession {
                        label: format!("{}:popup", self.label),
                        context_id: self.context_id.clone(),
                        page,
                        browser: Arc::clone(&self.browser),
                        owns_context: false,
                        seen_popups: HashSet::new(),
                    }));
                }
            }
            if Instant::now() >= deadline {
                return Err(BrowserError::Popup(format!(
                    "no secondary window opened within {}s",
                    timeout.as_secs()
                )));
            }
            sleep(Duration::from_millis(200)).await;
        }
    }

    async fn focus(&mut self) -> BrowserResult<()> {
        self.page.bring_to_front().await?;
        Ok(())
    }

    async fn close(self: Box<Self>) -> BrowserResult<()> {
        let ChromiumSession {
            context_id,
            page,
            browser,
            owns_context,
            ..
        } = *self;
        page.close().await?;
        if owns_context {
            let browser = browser.lock().await;
            browser
                .execute(DisposeBrowserContextParams::new(context_id))
                .await?;
        }
        Ok(())
    }
}

fn cookie_param(cookie: &serde_json::Value) -> BrowserResult<CookieParam> {
    let mut value = cookie.clone();
    let object = value
        .as_object_mut()
        .ok_or_else(|| BrowserError::State("cookie entry is not an object".into()))?;
    let session = object
        .get("session")
        .and_then(serde_json::Value::as_bool)
        .unwrap_or(false);
    let expired = object
        .get("expires")
        .and_then(serde_json::Value::as_f64)
        .map(|expires| expires <= 0.0)
        .unwrap_or(true);
    if session || expired {
        object.remove("expires");
    }
    for read_only in ["size", "session", "partitionKey", "partitionKeyOpaque"] {
        object.remove(read_only);
    }
    serde_json::from_value(value)
        .map_err(|err| BrowserError::State(format!("failed to restore cookie: {err}")))
}

fn text_locator_script(text: &str, token: &str) -> String {
    format!(
        "(() => {{
    const needle = {needle};
    const nodes = Array.from(document.querySelectorAll('button, a, input[type=submit], input[type=button], label, span, div, li, td, [role=button]'));
    const textOf = (node) => (node.innerText || node.value || node.textContent || '').trim();
    let match = nodes.find(node => textOf(node) === needle);
    if (!match) {{
        const containing = nodes.filter(node => textOf(node).includes(needle));
        match = containing.length ? containing[containing.length - 1] : null;
    }}
    if (!match) return false;
    match.setAttribute('{attribute}', {token});
    return true;
}})()",
        needle = serde_json::to_string(text).unwrap_or_default(),
        attribute = LOCATOR_ATTRIBUTE,
        token = serde_json::to_string(token).unwrap_or_default(),
    )
}
