//! The background context's message handler.
//!
//! Process-wide owner of the artifact cache, the resource URL cache, the
//! yield shadow and the set of tabs the viewer was loaded into. Other
//! contexts reach these only through the bus; every cache operation runs to
//! completion under its lock.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use resilink_cache::{ArtifactCache, EphemeralUrlCache};
use resilink_config::AppConfig;
use resilink_core::bus::{EventBus, Injector, MessageHandler, Script};
use resilink_core::context::{ContextRef, TabId};
use resilink_core::error::{DeliveryError, ErrorKind, FetchError};
use resilink_core::event::BusEvent;
use resilink_core::message::{Envelope, Reply, Request};
use resilink_core::yield_state::YieldState;
use resilink_supervisor::ConnectionSupervisor;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use reqwest::Url;
use tracing::{debug, info, warn};

use crate::capture::{CaptureRules, resource_params};
use crate::coordinator::YieldCoordinator;
use crate::fetch::ArtifactFetcher;

pub struct BackgroundService {
    coordinator: Arc<YieldCoordinator>,
    artifacts: Mutex<ArtifactCache>,
    urls: Mutex<EphemeralUrlCache>,
    capture: CaptureRules,
    fetcher: Arc<dyn ArtifactFetcher>,
    injector: Arc<dyn Injector>,
    viewer_tabs: Mutex<HashSet<TabId>>,
    bus: Arc<dyn EventBus>,
}

impl BackgroundService {
    pub fn new(
        config: &AppConfig,
        bus: Arc<dyn EventBus>,
        injector: Arc<dyn Injector>,
        fetcher: Arc<dyn ArtifactFetcher>,
    ) -> Self {
        let supervisor = Arc::new(ConnectionSupervisor::new(
            ContextRef::Background,
            bus.clone(),
            injector.clone(),
            &config.supervisor,
        ));

        Self {
            coordinator: Arc::new(YieldCoordinator::new(supervisor, &config.yield_guard)),
            artifacts: Mutex::new(ArtifactCache::new(&config.artifact_cache)),
            urls: Mutex::new(EphemeralUrlCache::new(&config.url_cache)),
            capture: CaptureRules::new(config.capture.clone()),
            fetcher,
            injector,
            viewer_tabs: Mutex::new(HashSet::new()),
            bus,
        }
    }

    pub fn coordinator(&self) -> &Arc<YieldCoordinator> {
        &self.coordinator
    }

    /// A tab's content script (re)initialized. If the tab was yielding,
    /// reapply in the background so the ready notification is acknowledged
    /// without waiting on the retries.
    pub async fn on_content_ready(
        &self,
        tab: TabId,
    ) -> Option<JoinHandle<Option<Result<YieldState, DeliveryError>>>> {
        if !self
            .coordinator
            .shadow(tab)
            .await
            .is_some_and(|s| s.is_yielding())
        {
            return None;
        }

        debug!(tab_id = %tab, "Content ready on a yielding tab, scheduling reapply");
        let coordinator = self.coordinator.clone();
        Some(tokio::spawn(async move {
            coordinator.reapply_after_navigation(tab).await
        }))
    }

    /// The tab was closed.
    pub async fn on_tab_removed(&self, tab: TabId) {
        let had_shadow = self.coordinator.forget_tab(tab).await;
        let dropped = self.urls.lock().await.invalidate_tab(tab);
        self.viewer_tabs.lock().await.remove(&tab);
        debug!(tab_id = %tab, had_shadow, dropped_urls = dropped, "Tab removed");
    }

    /// The tab started loading a new document. Shadow state survives so
    /// the next ready notification can reapply it; the new document needs
    /// the viewer loaded again.
    pub async fn on_tab_loading(&self, tab: TabId) {
        self.viewer_tabs.lock().await.remove(&tab);
        let dropped = self.urls.lock().await.invalidate_tab(tab);
        debug!(tab_id = %tab, dropped_urls = dropped, "Tab loading");
    }

    /// Passive network observation. Returns whether the request was captured.
    pub async fn observe_request(&self, tab_id: i64, url: &str) -> bool {
        match self.capture.observe(tab_id, url) {
            Some(captured) => {
                self.urls
                    .lock()
                    .await
                    .record(captured.tab, &captured.resource_id, captured.url);
                true
            }
            None => false,
        }
    }

    /// Number of artifacts currently resident.
    pub async fn cached_artifacts(&self) -> usize {
        self.artifacts.lock().await.len()
    }

    /// Keep the shadow in step with yield broadcasts from content scripts.
    pub fn spawn_event_listener(&self) -> JoinHandle<()> {
        let mut rx = self.bus.subscribe();
        let coordinator = self.coordinator.clone();

        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if let BusEvent::YieldStateChanged { tab_id, state, .. } = event.as_ref() {
                            coordinator.sync_shadow(*tab_id, state).await;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Event listener lagged, shadow may be stale");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    async fn store_artifact(&self, url: &str) -> Reply {
        let bytes = match self.fetcher.fetch(url).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(url, error = %e, "Artifact fetch failed");
                return e.into();
            }
        };

        let artifact = self.artifacts.lock().await.put(bytes, url);
        info!(
            id = %artifact.id,
            total_size = artifact.total_size,
            total_chunks = artifact.total_chunks,
            "Artifact cached"
        );
        Reply::ArtifactStored { artifact }
    }

    /// Load the viewer into `tab` once per document.
    pub async fn ensure_viewer(&self, tab: TabId) -> Reply {
        let mut loaded = self.viewer_tabs.lock().await;
        if loaded.contains(&tab) {
            return Reply::ViewerReady {
                already_injected: true,
            };
        }

        match self
            .injector
            .inject(ContextRef::ContentScript(tab), Script::Viewer)
            .await
        {
            Ok(()) => {
                loaded.insert(tab);
                info!(tab_id = %tab, "Viewer loaded");
                Reply::ViewerReady {
                    already_injected: false,
                }
            }
            Err(e) => {
                warn!(tab_id = %tab, error = %e, "Viewer injection failed");
                Reply::failure(ErrorKind::Transport, e.to_string())
            }
        }
    }

    /// Fetch a captured resource URL as text. Only URLs the capture rules
    /// cover are fetched.
    async fn fetch_resource_text(&self, url: &str) -> Reply {
        let parsed = match Url::parse(url) {
            Ok(parsed) => parsed,
            Err(_) => return FetchError::InvalidUrl(url.to_string()).into(),
        };
        if !self.capture.allows(&parsed) {
            debug!(url, "Resource fetch outside the capture rules refused");
            return FetchError::NotAllowed(url.to_string()).into();
        }

        match self.fetcher.fetch_text(parsed.as_str()).await {
            Ok(text) => Reply::ResourceText { text },
            Err(e) => {
                warn!(url, error = %e, "Resource fetch failed");
                e.into()
            }
        }
    }

    async fn lookup_resource_url(&self, tab: TabId, resource_id: &str) -> Reply {
        let url = self
            .urls
            .lock()
            .await
            .lookup(tab, resource_id)
            .map(str::to_string);
        let (lang, caps) = url.as_deref().map(resource_params).unwrap_or_default();
        Reply::ResourceUrl { url, lang, caps }
    }
}

#[async_trait]
impl MessageHandler for BackgroundService {
    async fn handle(&self, envelope: Envelope) -> Reply {
        let Envelope { sender, request } = envelope;
        let kind = request.kind();

        match request {
            Request::Ping { timestamp } => Reply::Pong {
                timestamp,
                response_time: Utc::now().timestamp_millis(),
            },

            Request::ContentReady { url } => {
                let Some(tab) = sender.tab() else {
                    return missing_tab(kind);
                };
                debug!(tab_id = %tab, url = %url, "Content script ready");
                // The reapply runs detached; its outcome is logged by the coordinator.
                let _ = self.on_content_ready(tab).await;
                Reply::Ack
            }

            Request::GetYieldForTab { tab_id } => {
                let Some(tab) = tab_id.or(sender.tab()) else {
                    return missing_tab(kind);
                };
                let answer = self.coordinator.query_yield(tab).await;
                Reply::TabYieldState {
                    tab_id: tab,
                    state: answer.state,
                    live: answer.live,
                }
            }

            Request::SetYieldForTab {
                tab_id,
                enable,
                reason,
            } => {
                let Some(tab) = tab_id.or(sender.tab()) else {
                    return missing_tab(kind);
                };
                match self.coordinator.set_yield(tab, enable, &reason).await {
                    Ok(state) => Reply::TabYieldState {
                        tab_id: tab,
                        state,
                        live: true,
                    },
                    Err(e) => {
                        warn!(tab_id = %tab, enable, error = %e, "Set yield for tab failed");
                        e.into()
                    }
                }
            }

            Request::StoreArtifact { url } => self.store_artifact(&url).await,

            Request::GetChunk { id, index } => {
                match self.artifacts.lock().await.get_chunk(&id, index) {
                    Ok(data) => Reply::Chunk { index, data },
                    Err(e) => {
                        debug!(id = %id, index, error = %e, "Chunk read rejected");
                        e.into()
                    }
                }
            }

            Request::ReleaseArtifact { id } => {
                let released = self.artifacts.lock().await.release(&id);
                debug!(id = %id, released, "Artifact release");
                Reply::Ack
            }

            Request::RecordResourceUrl {
                tab_id,
                resource_id,
                url,
            } => {
                self.urls.lock().await.record(tab_id, &resource_id, url);
                Reply::Ack
            }

            Request::LookupResourceUrl { resource_id } => {
                let Some(tab) = sender.tab() else {
                    return missing_tab(kind);
                };
                self.lookup_resource_url(tab, &resource_id).await
            }

            Request::FetchResourceText { url } => self.fetch_resource_text(&url).await,

            Request::EnsureViewer => {
                let Some(tab) = sender.tab() else {
                    return missing_tab(kind);
                };
                self.ensure_viewer(tab).await
            }

            Request::SetYield { .. } | Request::ToggleYield { .. } | Request::GetYieldState => {
                Reply::failure(
                    ErrorKind::Rejected,
                    format!("{kind} is not handled by the background"),
                )
            }
        }
    }
}

fn missing_tab(kind: &str) -> Reply {
    Reply::failure(ErrorKind::Rejected, format!("{kind} requires a tab"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use resilink_core::bus::LocalBus;
    use resilink_core::error::{FetchError, TransportError};
    use resilink_core::yield_state::YieldMode;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    struct NoInjector;

    #[async_trait]
    impl Injector for NoInjector {
        async fn inject(&self, target: ContextRef, _script: Script) -> Result<(), TransportError> {
            Err(TransportError::InjectionFailed {
                context: target,
                reason: "test".into(),
            })
        }
    }

    /// Accepts every injection and records it.
    #[derive(Default)]
    struct RecordingInjector {
        injected: StdMutex<Vec<(ContextRef, Script)>>,
    }

    #[async_trait]
    impl Injector for RecordingInjector {
        async fn inject(&self, target: ContextRef, script: Script) -> Result<(), TransportError> {
            self.injected.lock().unwrap().push((target, script));
            Ok(())
        }
    }

    /// Serves canned bodies keyed by URL.
    struct StaticFetcher {
        bodies: HashMap<String, Vec<u8>>,
        calls: StdMutex<usize>,
    }

    fn not_found() -> FetchError {
        FetchError::Http {
            status: 404,
            preview: "no such resource".into(),
        }
    }

    #[async_trait]
    impl ArtifactFetcher for StaticFetcher {
        async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
            *self.calls.lock().unwrap() += 1;
            self.bodies.get(url).cloned().ok_or_else(not_found)
        }

        async fn fetch_text(&self, url: &str) -> Result<String, FetchError> {
            *self.calls.lock().unwrap() += 1;
            self.bodies
                .get(url)
                .map(|body| String::from_utf8_lossy(body).into_owned())
                .ok_or_else(not_found)
        }
    }

    const TIMEDTEXT: &str = "https://www.youtube.com/api/timedtext?v=vid123&sig=abc";

    fn small_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.artifact_cache.chunk_size = 4;
        config
    }

    fn service(config: &AppConfig) -> (Arc<LocalBus>, BackgroundService) {
        service_with(config, Arc::new(NoInjector))
    }

    fn service_with(
        config: &AppConfig,
        injector: Arc<dyn Injector>,
    ) -> (Arc<LocalBus>, BackgroundService) {
        let bus = Arc::new(LocalBus::new(16));
        let mut bodies = HashMap::new();
        bodies.insert("https://x/doc.pdf".to_string(), b"0123456789".to_vec());
        bodies.insert(TIMEDTEXT.to_string(), b"<transcript/>".to_vec());
        let fetcher = Arc::new(StaticFetcher {
            bodies,
            calls: StdMutex::new(0),
        });
        let svc = BackgroundService::new(config, bus.clone(), injector, fetcher);
        (bus, svc)
    }

    fn from_tab(tab: u32, request: Request) -> Envelope {
        Envelope {
            sender: ContextRef::ContentScript(TabId(tab)),
            request,
        }
    }

    #[tokio::test]
    async fn stores_and_serves_chunks() {
        let (_bus, svc) = service(&small_config());

        let reply = svc
            .handle(from_tab(1, Request::StoreArtifact {
                url: "https://x/doc.pdf".into(),
            }))
            .await;
        let Reply::ArtifactStored { artifact } = reply else {
            panic!("expected stored artifact, got {reply:?}");
        };
        assert_eq!(artifact.total_size, 10);
        assert_eq!(artifact.total_chunks, 3);
        assert_eq!(artifact.chunk_size, 4);

        let mut assembled = Vec::new();
        for index in 0..artifact.total_chunks {
            match svc
                .handle(from_tab(1, Request::GetChunk {
                    id: artifact.id.clone(),
                    index,
                }))
                .await
            {
                Reply::Chunk { data, .. } => assembled.extend(data),
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(assembled, b"0123456789");

        let out_of_range = svc
            .handle(from_tab(1, Request::GetChunk {
                id: artifact.id.clone(),
                index: 3,
            }))
            .await;
        assert!(matches!(
            out_of_range,
            Reply::Failure {
                kind: ErrorKind::InvalidRange,
                ..
            }
        ));

        assert_eq!(
            svc.handle(from_tab(1, Request::ReleaseArtifact {
                id: artifact.id.clone()
            }))
            .await,
            Reply::Ack
        );
        let gone = svc
            .handle(from_tab(1, Request::GetChunk {
                id: artifact.id,
                index: 0,
            }))
            .await;
        assert!(matches!(
            gone,
            Reply::Failure {
                kind: ErrorKind::NotFound,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn fetch_failure_is_reported() {
        let (_bus, svc) = service(&small_config());
        let reply = svc
            .handle(from_tab(1, Request::StoreArtifact {
                url: "https://x/missing.pdf".into(),
            }))
            .await;
        assert!(matches!(
            reply,
            Reply::FetchFailure {
                kind: ErrorKind::Rejected,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn fetches_allowed_resource_text() {
        let (_bus, svc) = service(&AppConfig::default());
        let reply = svc
            .handle(from_tab(1, Request::FetchResourceText {
                url: TIMEDTEXT.into(),
            }))
            .await;
        assert_eq!(
            reply,
            Reply::ResourceText {
                text: "<transcript/>".into()
            }
        );

        let missing = svc
            .handle(from_tab(1, Request::FetchResourceText {
                url: "https://www.youtube.com/api/timedtext?v=gone".into(),
            }))
            .await;
        assert_eq!(
            missing,
            Reply::FetchFailure {
                kind: ErrorKind::Rejected,
                error: "HTTP 404".into(),
                preview: "no such resource".into(),
            }
        );
    }

    #[tokio::test]
    async fn refuses_resource_text_outside_capture_rules() {
        let (_bus, svc) = service(&AppConfig::default());

        for url in ["https://x/doc.pdf", "https://www.youtube.com/watch?v=vid123"] {
            let reply = svc
                .handle(from_tab(1, Request::FetchResourceText { url: url.into() }))
                .await;
            let Reply::Failure { kind, error } = reply else {
                panic!("expected refusal for {url}, got {reply:?}");
            };
            assert_eq!(kind, ErrorKind::Rejected);
            assert!(error.contains("not allowed"));
        }

        let invalid = svc
            .handle(from_tab(1, Request::FetchResourceText {
                url: "not a url".into(),
            }))
            .await;
        assert!(matches!(invalid, Reply::Failure { ref error, .. } if error.contains("Invalid URL")));
    }

    #[tokio::test]
    async fn viewer_is_loaded_once_per_document() {
        let injector = Arc::new(RecordingInjector::default());
        let (_bus, svc) = service_with(&AppConfig::default(), injector.clone());

        let ensure = || svc.handle(from_tab(2, Request::EnsureViewer));
        assert_eq!(
            ensure().await,
            Reply::ViewerReady {
                already_injected: false
            }
        );
        assert_eq!(
            ensure().await,
            Reply::ViewerReady {
                already_injected: true
            }
        );
        assert_eq!(
            *injector.injected.lock().unwrap(),
            vec![(ContextRef::ContentScript(TabId(2)), Script::Viewer)]
        );

        svc.on_tab_loading(TabId(2)).await;
        assert_eq!(
            ensure().await,
            Reply::ViewerReady {
                already_injected: false
            }
        );

        svc.on_tab_removed(TabId(2)).await;
        assert_eq!(
            ensure().await,
            Reply::ViewerReady {
                already_injected: false
            }
        );
        assert_eq!(injector.injected.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn failed_viewer_injection_is_retried_next_time() {
        let (_bus, svc) = service(&AppConfig::default());
        for _ in 0..2 {
            let reply = svc.handle(from_tab(2, Request::EnsureViewer)).await;
            assert!(matches!(
                reply,
                Reply::Failure {
                    kind: ErrorKind::Transport,
                    ..
                }
            ));
        }

        let no_tab = svc
            .handle(Envelope {
                sender: ContextRef::Background,
                request: Request::EnsureViewer,
            })
            .await;
        assert!(no_tab.is_failure());
    }

    #[tokio::test]
    async fn resource_urls_are_scoped_to_sender_tab() {
        let (_bus, svc) = service(&AppConfig::default());

        assert!(
            svc.observe_request(
                1,
                "https://www.youtube.com/api/timedtext?v=vid123&lang=en&caps=asr&sig=abc"
            )
            .await
        );
        assert!(!svc.observe_request(-1, "https://www.youtube.com/api/timedtext?v=vid123").await);

        let reply = svc
            .handle(from_tab(1, Request::LookupResourceUrl {
                resource_id: "vid123".into(),
            }))
            .await;
        let Reply::ResourceUrl { url, lang, caps } = reply else {
            panic!("expected resource url, got {reply:?}");
        };
        assert!(url.unwrap().contains("sig=abc"));
        assert_eq!(lang.as_deref(), Some("en"));
        assert_eq!(caps.as_deref(), Some("asr"));

        let other_tab = svc
            .handle(from_tab(2, Request::LookupResourceUrl {
                resource_id: "vid123".into(),
            }))
            .await;
        assert_eq!(
            other_tab,
            Reply::ResourceUrl {
                url: None,
                lang: None,
                caps: None
            }
        );
    }

    #[tokio::test]
    async fn record_message_and_tab_hooks() {
        let (_bus, svc) = service(&AppConfig::default());
        svc.handle(from_tab(1, Request::RecordResourceUrl {
            tab_id: TabId(1),
            resource_id: "vid".into(),
            url: "https://x/api?sig=def".into(),
        }))
        .await;
        svc.coordinator()
            .sync_shadow(TabId(1), &YieldState::from_mode(YieldMode::Yielding))
            .await;

        svc.on_tab_loading(TabId(1)).await;
        let reply = svc
            .handle(from_tab(1, Request::LookupResourceUrl {
                resource_id: "vid".into(),
            }))
            .await;
        assert!(matches!(reply, Reply::ResourceUrl { url: None, .. }));
        assert!(svc.coordinator().shadow(TabId(1)).await.is_some());

        svc.on_tab_removed(TabId(1)).await;
        assert!(svc.coordinator().shadow(TabId(1)).await.is_none());
    }

    #[tokio::test]
    async fn background_sender_needs_explicit_tab() {
        let (_bus, svc) = service(&AppConfig::default());
        let reply = svc
            .handle(Envelope {
                sender: ContextRef::Background,
                request: Request::LookupResourceUrl {
                    resource_id: "vid".into(),
                },
            })
            .await;
        assert!(reply.is_failure());
    }

    #[tokio::test(start_paused = true)]
    async fn tab_query_falls_back_to_shadow() {
        let (_bus, svc) = service(&AppConfig::default());
        svc.coordinator()
            .sync_shadow(TabId(4), &YieldState::from_mode(YieldMode::Yielding))
            .await;

        let reply = svc
            .handle(Envelope {
                sender: ContextRef::UiFrame(TabId(4)),
                request: Request::GetYieldForTab { tab_id: None },
            })
            .await;
        let Reply::TabYieldState {
            tab_id,
            state,
            live,
        } = reply
        else {
            panic!("expected tab yield state, got {reply:?}");
        };
        assert_eq!(tab_id, TabId(4));
        assert!(state.is_yielding());
        assert!(!live);
    }

    #[tokio::test(start_paused = true)]
    async fn tab_set_reports_unreachable() {
        let (_bus, svc) = service(&AppConfig::default());
        let reply = svc
            .handle(Envelope {
                sender: ContextRef::UiFrame(TabId(4)),
                request: Request::SetYieldForTab {
                    tab_id: None,
                    enable: true,
                    reason: "PREFERENCES".into(),
                },
            })
            .await;
        assert!(matches!(
            reply,
            Reply::Failure {
                kind: ErrorKind::Unreachable,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn content_ready_without_yield_schedules_nothing() {
        let (_bus, svc) = service(&AppConfig::default());
        assert!(svc.on_content_ready(TabId(1)).await.is_none());
        assert_eq!(
            svc.handle(from_tab(1, Request::ContentReady {
                url: "https://example.com".into()
            }))
            .await,
            Reply::Ack
        );
    }

    #[tokio::test]
    async fn broadcasts_update_the_shadow() {
        let (bus, svc) = service(&AppConfig::default());
        let listener = svc.spawn_event_listener();

        bus.broadcast(BusEvent::yield_state_changed(
            TabId(3),
            YieldState::from_mode(YieldMode::Yielding),
            "TEST",
        ));

        for _ in 0..50 {
            if svc.coordinator().shadow(TabId(3)).await.is_some() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(svc.coordinator().shadow(TabId(3)).await.unwrap().is_yielding());
        listener.abort();
    }

    #[tokio::test]
    async fn answers_probes() {
        let (_bus, svc) = service(&AppConfig::default());
        let reply = svc
            .handle(from_tab(1, Request::Ping { timestamp: 42 }))
            .await;
        assert!(matches!(reply, Reply::Pong { timestamp: 42, .. }));
    }
}
