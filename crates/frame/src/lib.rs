//! The embedded UI frame's view of its tab's yield state.
//!
//! The frame owns no state of its own. It renders the newest snapshot it
//! was given, whether that came from a broadcast, a direct frame-scoped
//! message or a reply. Snapshots carry the time they were taken and an
//! older one arriving late is dropped, so delivery order does not matter.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};

use resilink_core::bus::EventBus;
use resilink_core::context::{ContextRef, TabId};
use resilink_core::error::{ErrorKind, TransportError};
use resilink_core::event::BusEvent;
use resilink_core::message::{FrameMessage, Reply, Request};
use resilink_core::yield_state::{YieldState, reasons};
use tokio::sync::broadcast;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FrameError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("{kind}: {message}")]
    Failed { kind: ErrorKind, message: String },

    #[error("Unexpected reply: {0}")]
    Malformed(String),
}

#[derive(Debug, Default)]
struct ViewState {
    state: YieldState,
    /// When the rendered snapshot was taken.
    taken_at: Option<DateTime<Utc>>,
    notice_visible: bool,
    stream: Option<AbortHandle>,
}

pub struct FrameView {
    tab: TabId,
    bus: Arc<dyn EventBus>,
    view: Mutex<ViewState>,
}

impl FrameView {
    pub fn new(tab: TabId, bus: Arc<dyn EventBus>) -> Self {
        Self {
            tab,
            bus,
            view: Mutex::new(ViewState::default()),
        }
    }

    pub fn tab(&self) -> TabId {
        self.tab
    }

    fn context(&self) -> ContextRef {
        ContextRef::UiFrame(self.tab)
    }

    fn lock(&self) -> MutexGuard<'_, ViewState> {
        self.view.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Render `state` taken at `taken_at`, unless a newer snapshot is
    /// already shown. Entering YIELDING aborts the in-flight stream.
    /// Returns whether the snapshot was rendered.
    pub fn apply(&self, state: YieldState, taken_at: DateTime<Utc>) -> bool {
        let mut view = self.lock();
        if view.taken_at.is_some_and(|shown| taken_at < shown) {
            debug!(tab_id = %self.tab, state = %state.state, "Dropped stale snapshot");
            return false;
        }
        let yielding = state.is_yielding();

        if yielding && !view.state.is_yielding() {
            if let Some(stream) = view.stream.take() {
                stream.abort();
                info!(tab_id = %self.tab, "Aborted in-flight stream on yield");
            }
        }

        view.notice_visible = yielding;
        view.state = state;
        view.taken_at = Some(taken_at);
        true
    }

    /// A frame-scoped message from the content script.
    pub fn receive(&self, message: FrameMessage) {
        match message {
            FrameMessage::YieldStateChanged {
                state,
                reason,
                timestamp,
            } => {
                debug!(tab_id = %self.tab, reason = %reason, state = %state.state, "Frame notified");
                self.apply(state, timestamp);
            }
        }
    }

    pub fn state(&self) -> YieldState {
        self.lock().state.clone()
    }

    pub fn notice_visible(&self) -> bool {
        self.lock().notice_visible
    }

    /// New sends are blocked while yielding.
    pub fn can_send(&self) -> bool {
        !self.lock().state.is_yielding()
    }

    pub fn has_stream(&self) -> bool {
        self.lock().stream.is_some()
    }

    /// Start a streaming response. Returns `None` without running it when
    /// sending is blocked.
    pub fn start_stream<F>(&self, stream: F) -> Option<JoinHandle<F::Output>>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let mut view = self.lock();
        if view.state.is_yielding() {
            debug!(tab_id = %self.tab, "Send blocked while yielding");
            return None;
        }

        let handle = tokio::spawn(stream);
        if let Some(previous) = view.stream.replace(handle.abort_handle()) {
            previous.abort();
        }
        Some(handle)
    }

    /// Clear the stream slot once the response finished.
    pub fn finish_stream(&self) {
        self.lock().stream = None;
    }

    /// Ask the background for the tab's state. Falls back to ACTIVE on
    /// error so the UI never gets stuck behind the notice.
    pub async fn refresh(&self) -> YieldState {
        let request = Request::GetYieldForTab { tab_id: None };
        let state = match self.ask(request).await {
            Ok(state) => state,
            Err(e) => {
                warn!(tab_id = %self.tab, error = %e, "Yield state refresh failed");
                YieldState::unavailable()
            }
        };
        self.apply(state.clone(), Utc::now());
        state
    }

    /// Change the tab's mode through the background. Enabling shows the
    /// notice optimistically; on failure the real state is re-queried and
    /// the error returned so the user is not told a toggle succeeded.
    pub async fn set_yield(&self, enable: bool) -> Result<YieldState, FrameError> {
        if enable {
            self.lock().notice_visible = true;
        }

        let request = Request::SetYieldForTab {
            tab_id: None,
            enable,
            reason: reasons::PREFERENCES.to_string(),
        };
        match self.ask(request).await {
            Ok(state) => {
                self.apply(state.clone(), Utc::now());
                Ok(state)
            }
            Err(e) => {
                warn!(tab_id = %self.tab, enable, error = %e, "Yield toggle failed");
                self.refresh().await;
                Err(e)
            }
        }
    }

    /// Follow yield broadcasts for this tab until the bus closes.
    pub fn spawn_listener(self: &Arc<Self>) -> JoinHandle<()> {
        let mut rx = self.bus.subscribe();
        let view = Arc::clone(self);

        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if let BusEvent::YieldStateChanged {
                            tab_id,
                            state,
                            timestamp,
                            ..
                        } = event.as_ref()
                        {
                            if *tab_id == view.tab {
                                view.apply(state.clone(), *timestamp);
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(tab_id = %view.tab, skipped, "Frame listener lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    async fn ask(&self, request: Request) -> Result<YieldState, FrameError> {
        let reply = self
            .bus
            .request(self.context(), ContextRef::Background, request)
            .await?;
        match reply {
            Reply::TabYieldState { state, .. } => Ok(state),
            Reply::Failure { kind, error } => Err(FrameError::Failed {
                kind,
                message: error,
            }),
            other => Err(FrameError::Malformed(format!("{other:?}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use resilink_core::bus::{LocalBus, MessageHandler};
    use resilink_core::message::Envelope;
    use resilink_core::yield_state::YieldMode;
    use std::time::Duration;

    /// Background stub holding one tab's mode, optionally refusing changes.
    struct StubBackground {
        mode: Mutex<YieldMode>,
        refuse_set: bool,
    }

    #[async_trait]
    impl MessageHandler for StubBackground {
        async fn handle(&self, envelope: Envelope) -> Reply {
            let tab_id = envelope.sender.tab().unwrap_or(TabId(0));
            match envelope.request {
                Request::GetYieldForTab { .. } => Reply::TabYieldState {
                    tab_id,
                    state: YieldState::from_mode(*self.mode.lock().unwrap()),
                    live: true,
                },
                Request::SetYieldForTab { .. } if self.refuse_set => {
                    Reply::failure(ErrorKind::Unreachable, "content:1 unreachable")
                }
                Request::SetYieldForTab { enable, .. } => {
                    let mode = if enable {
                        YieldMode::Yielding
                    } else {
                        YieldMode::Active
                    };
                    *self.mode.lock().unwrap() = mode;
                    Reply::TabYieldState {
                        tab_id,
                        state: YieldState::from_mode(mode),
                        live: true,
                    }
                }
                _ => Reply::Ack,
            }
        }
    }

    async fn view_with(mode: YieldMode, refuse_set: bool) -> (Arc<LocalBus>, FrameView) {
        let bus = Arc::new(LocalBus::new(8));
        bus.register(
            ContextRef::Background,
            Arc::new(StubBackground {
                mode: Mutex::new(mode),
                refuse_set,
            }),
        )
        .await;
        let view = FrameView::new(TabId(1), bus.clone());
        (bus, view)
    }

    fn yielding() -> YieldState {
        YieldState::from_mode(YieldMode::Yielding)
    }

    #[tokio::test]
    async fn last_write_wins() {
        let (_bus, view) = view_with(YieldMode::Active, false).await;
        view.apply(yielding(), Utc::now());
        view.receive(FrameMessage::YieldStateChanged {
            state: YieldState::from_mode(YieldMode::Active),
            reason: "TEST".into(),
            timestamp: Utc::now(),
        });
        assert_eq!(view.state().state, YieldMode::Active);
        assert!(!view.notice_visible());
        assert!(view.can_send());
    }

    #[tokio::test(start_paused = true)]
    async fn entering_yield_aborts_stream_and_blocks_sends() {
        let (_bus, view) = view_with(YieldMode::Active, false).await;
        let handle = view
            .start_stream(tokio::time::sleep(Duration::from_secs(60)))
            .unwrap();
        assert!(view.has_stream());

        assert!(view.apply(yielding(), Utc::now()));
        assert!(!view.has_stream());
        assert!(handle.await.unwrap_err().is_cancelled());

        assert!(!view.can_send());
        assert!(view.start_stream(async {}).is_none());
    }

    #[tokio::test]
    async fn refresh_applies_background_state() {
        let (_bus, view) = view_with(YieldMode::Yielding, false).await;
        let state = view.refresh().await;
        assert!(state.is_yielding());
        assert!(view.notice_visible());
    }

    #[tokio::test]
    async fn refresh_renders_active_without_background() {
        let view = FrameView::new(TabId(1), Arc::new(LocalBus::new(8)));
        view.apply(yielding(), Utc::now());
        let state = view.refresh().await;
        assert_eq!(state.state, YieldMode::Active);
        assert!(view.can_send());
    }

    #[tokio::test]
    async fn set_yield_applies_reply() {
        let (_bus, view) = view_with(YieldMode::Active, false).await;
        let state = view.set_yield(true).await.unwrap();
        assert!(state.is_yielding());
        assert!(view.notice_visible());
        assert!(!view.can_send());
    }

    #[tokio::test]
    async fn failed_toggle_reverts_to_real_state() {
        let (_bus, view) = view_with(YieldMode::Active, true).await;
        let err = view.set_yield(true).await.unwrap_err();
        assert!(matches!(
            err,
            FrameError::Failed {
                kind: ErrorKind::Unreachable,
                ..
            }
        ));
        assert!(!view.notice_visible());
        assert_eq!(view.state().state, YieldMode::Active);
    }

    #[tokio::test]
    async fn late_older_snapshot_is_ignored() {
        let (_bus, view) = view_with(YieldMode::Active, false).await;
        let suspended_at = Utc::now();
        let resumed_at = suspended_at + chrono::TimeDelta::milliseconds(1);

        view.receive(FrameMessage::YieldStateChanged {
            state: YieldState::from_mode(YieldMode::Active),
            reason: "COMMAND".into(),
            timestamp: resumed_at,
        });
        let handle = view
            .start_stream(std::future::pending::<()>())
            .unwrap();

        assert!(!view.apply(yielding(), suspended_at));
        assert_eq!(view.state().state, YieldMode::Active);
        assert!(view.can_send());
        assert!(view.has_stream());
        assert!(!handle.is_finished());
        handle.abort();
    }

    #[tokio::test]
    async fn stale_broadcast_after_direct_resume_keeps_stream() {
        let (bus, view) = view_with(YieldMode::Active, false).await;
        let view = Arc::new(view);
        let suspended = BusEvent::yield_state_changed(TabId(1), yielding(), "COMMAND");
        let BusEvent::YieldStateChanged { timestamp, .. } = &suspended else {
            unreachable!()
        };
        let resumed_at = *timestamp + chrono::TimeDelta::milliseconds(1);

        // The direct resume lands before the listener drains the broadcast.
        view.receive(FrameMessage::YieldStateChanged {
            state: YieldState::from_mode(YieldMode::Active),
            reason: "COMMAND".into(),
            timestamp: resumed_at,
        });
        let handle = view
            .start_stream(std::future::pending::<()>())
            .unwrap();

        let listener = view.spawn_listener();
        bus.broadcast(suspended);
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }

        assert_eq!(view.state().state, YieldMode::Active);
        assert!(view.has_stream());
        assert!(!handle.is_finished());
        handle.abort();
        listener.abort();
    }

    #[tokio::test]
    async fn listener_follows_own_tab_only() {
        let (bus, view) = view_with(YieldMode::Active, false).await;
        let view = Arc::new(view);
        let listener = view.spawn_listener();

        bus.broadcast(BusEvent::yield_state_changed(
            TabId(2),
            YieldState::from_mode(YieldMode::Yielding),
            "TEST",
        ));
        bus.broadcast(BusEvent::yield_state_changed(
            TabId(1),
            YieldState::from_mode(YieldMode::Yielding),
            "TEST",
        ));

        for _ in 0..50 {
            if view.notice_visible() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(view.state().is_yielding());
        listener.abort();
    }
}
