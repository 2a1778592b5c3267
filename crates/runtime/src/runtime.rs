//! In-process harness running all three contexts on one [`LocalBus`].
//!
//! Each tab gets an in-memory document, a content script with a mounted
//! frame controller and a frame view. Navigation, tab close and silent
//! context teardown are simulated the way a browser would perform them.
//! Reinjection re-creates the content script against the tab's current
//! document.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use resilink_background::{ArtifactFetcher, BackgroundService, HttpFetcher};
use resilink_config::AppConfig;
use resilink_content::{ContentScript, DomError, DomOps, FrameController, MemoryDom, SharedDom, Watchdog};
use resilink_core::bus::{EventBus, FramePort, Injector, LocalBus, Script};
use resilink_core::context::{ContextRef, TabId};
use resilink_core::error::{DeliveryError, TransportError};
use resilink_core::message::FrameMessage;
use resilink_core::yield_state::{YieldState, reasons};
use resilink_frame::FrameView;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A live content script in the harness.
pub type ContentHandle = Arc<ContentScript<MemoryDom>>;

struct Page {
    url: String,
    dom: SharedDom<MemoryDom>,
    content: Option<ContentHandle>,
    view: Arc<FrameView>,
    view_listener: JoinHandle<()>,
    injectable: bool,
    /// Times the viewer library was loaded into the current document.
    viewer_loads: usize,
}

/// Delivers frame-scoped messages to the tab's view.
#[derive(Default)]
struct FrameRouter {
    views: RwLock<HashMap<TabId, Arc<FrameView>>>,
}

impl FrameRouter {
    fn insert(&self, tab: TabId, view: Arc<FrameView>) {
        self.views
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(tab, view);
    }

    fn remove(&self, tab: TabId) {
        self.views
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&tab);
    }
}

impl FramePort for FrameRouter {
    fn post(&self, tab: TabId, message: FrameMessage) {
        let view = self
            .views
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&tab)
            .cloned();
        match view {
            Some(view) => view.receive(message),
            None => debug!(tab_id = %tab, "No frame to deliver to"),
        }
    }
}

/// Tab state shared between the runtime and its injector.
struct Tabs {
    bus: Arc<LocalBus>,
    router: Arc<FrameRouter>,
    pages: Mutex<HashMap<TabId, Page>>,
}

impl Tabs {
    /// Build a content script for `tab`, mount its frame into `dom` and
    /// start listening.
    async fn start_content(
        &self,
        tab: TabId,
        url: &str,
        dom: SharedDom<MemoryDom>,
    ) -> Result<ContentHandle, DomError> {
        let script = Arc::new(ContentScript::new(tab, url, self.bus.clone()));
        let controller = Arc::new(FrameController::new(
            tab,
            dom.clone(),
            self.bus.clone(),
            self.router.clone(),
        ));

        let (container, frame) = {
            let mut d = dom.lock().await;
            (d.create_element("resilink-sidebar"), d.create_element("iframe"))
        };
        controller.mount(container, frame).await?;
        script.attach_controller(controller).await;

        self.bus.register(script.context(), script.clone()).await;
        Ok(script)
    }
}

struct TabInjector {
    tabs: Arc<Tabs>,
}

#[async_trait]
impl Injector for TabInjector {
    async fn inject(&self, target: ContextRef, script: Script) -> Result<(), TransportError> {
        let failed = |reason: &str| TransportError::InjectionFailed {
            context: target,
            reason: reason.to_string(),
        };

        let ContextRef::ContentScript(tab) = target else {
            return Err(failed("scripts can only be injected into tab pages"));
        };

        let (url, dom) = {
            let mut pages = self.tabs.pages.lock().await;
            match pages.get_mut(&tab) {
                Some(page) if page.injectable => {
                    if script == Script::Viewer {
                        page.viewer_loads += 1;
                        debug!(tab_id = %tab, "Viewer loaded into page");
                        return Ok(());
                    }
                    (page.url.clone(), page.dom.clone())
                }
                Some(_) => return Err(failed("injection blocked on this page")),
                None => return Err(failed("no such tab")),
            }
        };

        let script = self
            .tabs
            .start_content(tab, &url, dom)
            .await
            .map_err(|e| failed(&e.to_string()))?;

        if let Some(page) = self.tabs.pages.lock().await.get_mut(&tab) {
            page.content = Some(script);
        }
        info!(tab_id = %tab, "Content script reinjected");
        Ok(())
    }
}

pub struct Runtime {
    config: AppConfig,
    bus: Arc<LocalBus>,
    tabs: Arc<Tabs>,
    background: Arc<BackgroundService>,
    background_listener: JoinHandle<()>,
}

impl Runtime {
    /// Start with the HTTP fetcher.
    pub async fn start(config: AppConfig) -> Self {
        Self::with_fetcher(config, Arc::new(HttpFetcher::new())).await
    }

    pub async fn with_fetcher(config: AppConfig, fetcher: Arc<dyn ArtifactFetcher>) -> Self {
        let bus = Arc::new(LocalBus::default());
        let tabs = Arc::new(Tabs {
            bus: bus.clone(),
            router: Arc::new(FrameRouter::default()),
            pages: Mutex::new(HashMap::new()),
        });

        let injector = Arc::new(TabInjector { tabs: tabs.clone() });
        let background = Arc::new(BackgroundService::new(
            &config,
            bus.clone(),
            injector,
            fetcher,
        ));
        bus.register(ContextRef::Background, background.clone())
            .await;
        let background_listener = background.spawn_event_listener();

        info!("Runtime started");
        Self {
            config,
            bus,
            tabs,
            background,
            background_listener,
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn bus(&self) -> &Arc<LocalBus> {
        &self.bus
    }

    pub fn background(&self) -> &Arc<BackgroundService> {
        &self.background
    }

    /// Open a tab on `url`: fresh document, frame view, content script,
    /// then the ready notification.
    pub async fn open_tab(&self, tab: TabId, url: &str) -> Result<ContentHandle, DomError> {
        let dom = MemoryDom::new().shared();
        let (view, view_listener) = self.new_view(tab);

        let previous = self.tabs.pages.lock().await.insert(
            tab,
            Page {
                url: url.to_string(),
                dom: dom.clone(),
                content: None,
                view,
                view_listener,
                injectable: true,
                viewer_loads: 0,
            },
        );
        if let Some(previous) = previous {
            previous.view_listener.abort();
        }

        self.load(tab, url, dom).await
    }

    /// The tab navigates to `url`. The old document and its content script
    /// are gone; the new one announces itself, which lets the background
    /// reapply a yield the tab was in.
    pub async fn navigate(&self, tab: TabId, url: &str) -> Result<ContentHandle, DomError> {
        if !self.tabs.pages.lock().await.contains_key(&tab) {
            return self.open_tab(tab, url).await;
        }

        self.bus.unregister(ContextRef::ContentScript(tab)).await;
        self.background.on_tab_loading(tab).await;

        let dom = MemoryDom::new().shared();
        let (view, view_listener) = self.new_view(tab);
        if let Some(page) = self.tabs.pages.lock().await.get_mut(&tab) {
            page.url = url.to_string();
            page.dom = dom.clone();
            page.content = None;
            page.viewer_loads = 0;
            page.view = view;
            page.view_listener.abort();
            page.view_listener = view_listener;
        }

        debug!(tab_id = %tab, url, "Tab navigated");
        self.load(tab, url, dom).await
    }

    /// Close the tab and everything tied to it.
    pub async fn close_tab(&self, tab: TabId) -> bool {
        self.bus.unregister(ContextRef::ContentScript(tab)).await;
        self.tabs.router.remove(tab);
        let page = self.tabs.pages.lock().await.remove(&tab);
        if let Some(page) = &page {
            page.view_listener.abort();
        }
        self.background.on_tab_removed(tab).await;
        page.is_some()
    }

    /// Silently tear the tab's content script down, leaving the document in
    /// place. Nobody is notified.
    pub async fn drop_context(&self, tab: TabId) -> bool {
        let removed = self.bus.unregister(ContextRef::ContentScript(tab)).await;
        if let Some(page) = self.tabs.pages.lock().await.get_mut(&tab) {
            page.content = None;
        }
        removed
    }

    /// Make reinjection into the tab fail (or work again).
    pub async fn block_injection(&self, tab: TabId, blocked: bool) {
        if let Some(page) = self.tabs.pages.lock().await.get_mut(&tab) {
            page.injectable = !blocked;
        }
    }

    /// The keyboard command path.
    pub async fn toggle_command(&self, tab: TabId) -> Result<YieldState, DeliveryError> {
        self.background
            .coordinator()
            .toggle_yield(tab, reasons::COMMAND)
            .await
    }

    pub async fn apply_yield(
        &self,
        tab: TabId,
        enable: bool,
        reason: &str,
    ) -> Result<YieldState, DeliveryError> {
        self.background
            .coordinator()
            .apply_yield_default(tab, enable, reason)
            .await
    }

    /// Feed an observed network request to passive capture.
    pub async fn observe_request(&self, tab_id: i64, url: &str) -> bool {
        self.background.observe_request(tab_id, url).await
    }

    /// The tab's UI frame reloads: a fresh view replaces the old one and
    /// the controller tells it the current state.
    pub async fn reload_frame(&self, tab: TabId) -> Option<Arc<FrameView>> {
        let (view, view_listener) = self.new_view(tab);
        let content = {
            let mut pages = self.tabs.pages.lock().await;
            let Some(page) = pages.get_mut(&tab) else {
                view_listener.abort();
                self.tabs.router.remove(tab);
                return None;
            };
            page.view = view.clone();
            page.view_listener.abort();
            page.view_listener = view_listener;
            page.content.clone()
        };

        match content {
            Some(content) => match content.controller().await {
                Some(controller) => {
                    controller.frame_ready().await;
                }
                None => debug!(tab_id = %tab, "Frame reloaded before its controller"),
            },
            None => debug!(tab_id = %tab, "Frame reloaded without a content script"),
        }
        Some(view)
    }

    /// Run one watchdog pass over the tab's frame.
    pub async fn check_frame(&self, tab: TabId) -> bool {
        let Some(content) = self.content(tab).await else {
            return false;
        };
        let Some(controller) = content.controller().await else {
            return false;
        };
        Watchdog::new(controller).check().await
    }

    pub async fn content(&self, tab: TabId) -> Option<ContentHandle> {
        self.tabs
            .pages
            .lock()
            .await
            .get(&tab)
            .and_then(|p| p.content.clone())
    }

    pub async fn view(&self, tab: TabId) -> Option<Arc<FrameView>> {
        self.tabs.pages.lock().await.get(&tab).map(|p| p.view.clone())
    }

    /// How often the viewer was loaded into the tab's current document.
    pub async fn viewer_loads(&self, tab: TabId) -> Option<usize> {
        self.tabs.pages.lock().await.get(&tab).map(|p| p.viewer_loads)
    }

    pub async fn dom(&self, tab: TabId) -> Option<SharedDom<MemoryDom>> {
        self.tabs.pages.lock().await.get(&tab).map(|p| p.dom.clone())
    }

    fn new_view(&self, tab: TabId) -> (Arc<FrameView>, JoinHandle<()>) {
        let bus: Arc<dyn EventBus> = self.bus.clone();
        let view = Arc::new(FrameView::new(tab, bus));
        let listener = view.spawn_listener();
        self.tabs.router.insert(tab, view.clone());
        (view, listener)
    }

    async fn load(
        &self,
        tab: TabId,
        url: &str,
        dom: SharedDom<MemoryDom>,
    ) -> Result<ContentHandle, DomError> {
        let content = self.tabs.start_content(tab, url, dom).await?;
        if let Some(page) = self.tabs.pages.lock().await.get_mut(&tab) {
            page.content = Some(content.clone());
        }

        if let Err(e) = content.announce().await {
            warn!(tab_id = %tab, error = %e, "Content ready notification failed");
        }
        Ok(content)
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.background_listener.abort();
        if let Ok(pages) = self.tabs.pages.try_lock() {
            for page in pages.values() {
                page.view_listener.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use resilink_core::yield_state::YieldMode;

    #[tokio::test(start_paused = true)]
    async fn open_tab_mounts_frame_and_registers() {
        let rt = Runtime::start(AppConfig::default()).await;
        let content = rt.open_tab(TabId(1), "https://example.com").await.unwrap();

        assert!(rt.bus().is_registered(content.context()).await);
        let state = content.controller().await.unwrap().state().await;
        assert!(state.ready);
        assert!(state.frame_present);
        assert_eq!(state.state, YieldMode::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn reinjection_recreates_dropped_content() {
        let rt = Runtime::start(AppConfig::default()).await;
        rt.open_tab(TabId(1), "https://example.com").await.unwrap();
        assert!(rt.drop_context(TabId(1)).await);
        assert!(rt.content(TabId(1)).await.is_none());

        let state = rt.apply_yield(TabId(1), true, "TEST").await.unwrap();
        assert!(state.is_yielding());
        assert!(rt.content(TabId(1)).await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn blocked_injection_leaves_tab_unreachable() {
        let rt = Runtime::start(AppConfig::default()).await;
        rt.open_tab(TabId(1), "https://example.com").await.unwrap();
        rt.drop_context(TabId(1)).await;
        rt.block_injection(TabId(1), true).await;

        let err = rt
            .background()
            .coordinator()
            .apply_yield(TabId(1), true, "TEST", 1)
            .await
            .unwrap_err();
        assert!(matches!(err, DeliveryError::Unreachable { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn close_tab_forgets_everything() {
        let rt = Runtime::start(AppConfig::default()).await;
        rt.open_tab(TabId(1), "https://example.com").await.unwrap();
        rt.toggle_command(TabId(1)).await.unwrap();
        assert!(rt.background().coordinator().shadow(TabId(1)).await.is_some());

        assert!(rt.close_tab(TabId(1)).await);
        assert!(rt.background().coordinator().shadow(TabId(1)).await.is_none());
        assert!(rt.view(TabId(1)).await.is_none());
        assert!(!rt.close_tab(TabId(1)).await);
    }
}
