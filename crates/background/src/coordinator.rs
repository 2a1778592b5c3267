//! Yield coordinator: background-side orchestration of a tab's yield
//! state.
//!
//! Applies and queries state on the tab's content script through the
//! supervisor and keeps a per-tab shadow of the last state it observed, so
//! the UI can render something even while the content script is
//! unreachable. The shadow is never treated as ground truth when a live
//! answer is available.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use resilink_config::YieldGuardConfig;
use resilink_core::context::{ContextRef, TabId};
use resilink_core::error::DeliveryError;
use resilink_core::message::{Reply, Request};
use resilink_core::yield_state::{YieldMode, YieldState, reasons};
use resilink_supervisor::ConnectionSupervisor;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// A tab's yield state as served by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TabYield {
    pub state: YieldState,
    /// False when served from the shadow copy.
    pub live: bool,
}

pub struct YieldCoordinator {
    supervisor: Arc<ConnectionSupervisor>,
    shadow: RwLock<HashMap<TabId, YieldState>>,
    default_attempts: u32,
    retry_delay: Duration,
}

impl YieldCoordinator {
    pub fn new(supervisor: Arc<ConnectionSupervisor>, config: &YieldGuardConfig) -> Self {
        Self {
            supervisor,
            shadow: RwLock::new(HashMap::new()),
            default_attempts: config.max_attempts,
            retry_delay: config.retry_delay(),
        }
    }

    /// Apply a yield transition, retrying up to `max_attempts` times with a
    /// fixed delay between attempts. A freshly navigated page may not have
    /// finished initializing its content script yet.
    ///
    /// Succeeds on the first well-formed state; otherwise returns the last
    /// error. Exhaustion is terminal for this call.
    pub async fn apply_yield(
        &self,
        tab: TabId,
        enable: bool,
        reason: &str,
        max_attempts: u32,
    ) -> Result<YieldState, DeliveryError> {
        let target = ContextRef::ContentScript(tab);
        let mut last_error = DeliveryError::Exhausted { attempts: 0 };

        for attempt in 1..=max_attempts {
            if attempt > 1 {
                tokio::time::sleep(self.retry_delay).await;
            }

            let request = Request::SetYield {
                enable,
                reason: reason.to_string(),
            };
            match self.deliver(target, request).await {
                Ok(state) => {
                    self.sync_shadow(tab, &state).await;
                    debug!(tab_id = %tab, attempt, state = %state.state, reason, "Yield state applied");
                    return Ok(state);
                }
                Err(e) => {
                    warn!(
                        tab_id = %tab,
                        attempt,
                        max_attempts,
                        error = %e,
                        "Applying yield state failed"
                    );
                    last_error = e;
                }
            }
        }

        Err(last_error)
    }

    /// [`apply_yield`](Self::apply_yield) with the configured attempt budget.
    pub async fn apply_yield_default(
        &self,
        tab: TabId,
        enable: bool,
        reason: &str,
    ) -> Result<YieldState, DeliveryError> {
        self.apply_yield(tab, enable, reason, self.default_attempts)
            .await
    }

    /// Single-delivery set, used when a UI is waiting on the answer.
    pub async fn set_yield(
        &self,
        tab: TabId,
        enable: bool,
        reason: &str,
    ) -> Result<YieldState, DeliveryError> {
        let request = Request::SetYield {
            enable,
            reason: reason.to_string(),
        };
        let state = self.deliver(ContextRef::ContentScript(tab), request).await?;
        self.sync_shadow(tab, &state).await;
        Ok(state)
    }

    /// Flip the tab's mode (keyboard command path).
    pub async fn toggle_yield(&self, tab: TabId, reason: &str) -> Result<YieldState, DeliveryError> {
        let request = Request::ToggleYield {
            reason: reason.to_string(),
        };
        let state = self.deliver(ContextRef::ContentScript(tab), request).await?;
        self.sync_shadow(tab, &state).await;
        info!(tab_id = %tab, state = %state.state, "Yield toggled by command");
        Ok(state)
    }

    /// One live query; on any failure fall back to the shadow copy.
    pub async fn query_yield(&self, tab: TabId) -> TabYield {
        match self
            .deliver(ContextRef::ContentScript(tab), Request::GetYieldState)
            .await
        {
            Ok(state) => {
                self.sync_shadow(tab, &state).await;
                TabYield { state, live: true }
            }
            Err(e) => {
                debug!(tab_id = %tab, error = %e, "Live yield query failed, serving shadow state");
                let state = self
                    .shadow(tab)
                    .await
                    .unwrap_or_else(|| YieldState::from_mode(YieldMode::Active));
                TabYield { state, live: false }
            }
        }
    }

    /// Re-impose YIELDING on a freshly loaded document if the shadow says
    /// the tab was yielding. Documents do not inherit yield state across
    /// navigation. Returns `None` when nothing needed reapplying.
    pub async fn reapply_after_navigation(
        &self,
        tab: TabId,
    ) -> Option<Result<YieldState, DeliveryError>> {
        if self.shadow_mode(tab).await != Some(YieldMode::Yielding) {
            return None;
        }

        let result = self
            .apply_yield_default(tab, true, reasons::REAPPLY_AFTER_NAVIGATION)
            .await;
        match &result {
            Ok(state) => info!(tab_id = %tab, state = %state.state, "Reapplied yield after navigation"),
            Err(e) => warn!(tab_id = %tab, error = %e, "Reapply after navigation failed"),
        }
        Some(result)
    }

    /// Record a state observed from the tab (reply or broadcast).
    pub async fn sync_shadow(&self, tab: TabId, state: &YieldState) {
        self.shadow.write().await.insert(tab, state.clone());
    }

    pub async fn shadow(&self, tab: TabId) -> Option<YieldState> {
        self.shadow.read().await.get(&tab).cloned()
    }

    pub async fn shadow_mode(&self, tab: TabId) -> Option<YieldMode> {
        self.shadow.read().await.get(&tab).map(|s| s.state)
    }

    /// Drop the shadow when the tab closes.
    pub async fn forget_tab(&self, tab: TabId) -> bool {
        self.shadow.write().await.remove(&tab).is_some()
    }

    async fn deliver(&self, target: ContextRef, request: Request) -> Result<YieldState, DeliveryError> {
        let reply = self.supervisor.send_with_recovery(target, request).await?;
        interpret(reply)
    }
}

/// Accept only a well-formed state reply.
fn interpret(reply: Reply) -> Result<YieldState, DeliveryError> {
    match reply {
        Reply::YieldState { state } => Ok(state),
        Reply::Failure { error, .. } => Err(DeliveryError::Rejected(error)),
        other => Err(DeliveryError::Malformed(format!("expected yield state, got {other:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use resilink_config::SupervisorConfig;
    use resilink_core::bus::{Injector, LocalBus, MessageHandler, Script};
    use resilink_core::error::{ErrorKind, TransportError};
    use resilink_core::message::Envelope;
    use std::sync::Mutex;
    use tokio::time::Instant;

    /// Minimal content script: holds a mode, answers probes and yield requests.
    struct FakeContent {
        mode: Mutex<YieldMode>,
        set_calls: Mutex<usize>,
        reject: bool,
    }

    impl FakeContent {
        fn new(mode: YieldMode) -> Self {
            Self {
                mode: Mutex::new(mode),
                set_calls: Mutex::new(0),
                reject: false,
            }
        }

        fn rejecting() -> Self {
            Self {
                reject: true,
                ..Self::new(YieldMode::Active)
            }
        }

        fn state(&self) -> YieldState {
            YieldState::from_mode(*self.mode.lock().unwrap())
        }
    }

    #[async_trait]
    impl MessageHandler for FakeContent {
        async fn handle(&self, envelope: Envelope) -> Reply {
            match envelope.request {
                Request::Ping { timestamp } => Reply::Pong {
                    timestamp,
                    response_time: timestamp,
                },
                _ if self.reject => Reply::failure(ErrorKind::Rejected, "frame controller unavailable"),
                Request::SetYield { enable, .. } => {
                    *self.set_calls.lock().unwrap() += 1;
                    *self.mode.lock().unwrap() = if enable {
                        YieldMode::Yielding
                    } else {
                        YieldMode::Active
                    };
                    Reply::YieldState { state: self.state() }
                }
                Request::ToggleYield { .. } => {
                    let mut mode = self.mode.lock().unwrap();
                    *mode = match *mode {
                        YieldMode::Active => YieldMode::Yielding,
                        YieldMode::Yielding => YieldMode::Active,
                    };
                    Reply::YieldState {
                        state: YieldState::from_mode(*mode),
                    }
                }
                Request::GetYieldState => Reply::YieldState { state: self.state() },
                _ => Reply::Ack,
            }
        }
    }

    /// Counts reinjection attempts, optionally reviving a context.
    struct CountingInjector {
        bus: Arc<LocalBus>,
        revive_with: Mutex<Option<Arc<FakeContent>>>,
        calls: Mutex<usize>,
    }

    impl CountingInjector {
        fn new(bus: Arc<LocalBus>) -> Self {
            Self {
                bus,
                revive_with: Mutex::new(None),
                calls: Mutex::new(0),
            }
        }

        fn calls(&self) -> usize {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl Injector for CountingInjector {
        async fn inject(&self, target: ContextRef, _script: Script) -> Result<(), TransportError> {
            *self.calls.lock().unwrap() += 1;
            let revive = self.revive_with.lock().unwrap().clone();
            if let Some(handler) = revive {
                self.bus.register(target, handler).await;
            }
            Ok(())
        }
    }

    fn coordinator(bus: Arc<LocalBus>, injector: Arc<CountingInjector>) -> YieldCoordinator {
        let supervisor = Arc::new(ConnectionSupervisor::new(
            ContextRef::Background,
            bus,
            injector,
            &SupervisorConfig::default(),
        ));
        YieldCoordinator::new(supervisor, &YieldGuardConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_tab_exhausts_attempts_with_recovery_each_time() {
        let bus = Arc::new(LocalBus::new(16));
        let injector = Arc::new(CountingInjector::new(bus.clone()));
        let coord = coordinator(bus, injector.clone());

        let started = Instant::now();
        let result = coord.apply_yield(TabId(7), true, "TEST", 3).await;

        let err = result.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unreachable);
        assert_eq!(injector.calls(), 3);
        // 3 settle delays + 2 inter-attempt delays
        assert_eq!(started.elapsed(), Duration::from_millis(3 * 500 + 2 * 150));
        assert_eq!(coord.shadow(TabId(7)).await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn apply_succeeds_once_content_comes_up() {
        let bus = Arc::new(LocalBus::new(16));
        let injector = Arc::new(CountingInjector::new(bus.clone()));
        let coord = coordinator(bus.clone(), injector.clone());
        let content = Arc::new(FakeContent::new(YieldMode::Active));
        *injector.revive_with.lock().unwrap() = Some(content.clone());

        let state = coord.apply_yield(TabId(3), true, "TEST", 5).await.unwrap();
        assert!(state.is_yielding());
        assert_eq!(injector.calls(), 1);
        assert_eq!(*content.set_calls.lock().unwrap(), 1);
        assert_eq!(coord.shadow_mode(TabId(3)).await, Some(YieldMode::Yielding));
    }

    #[tokio::test(start_paused = true)]
    async fn rejection_is_reported_after_budget() {
        let bus = Arc::new(LocalBus::new(16));
        bus.register(
            ContextRef::ContentScript(TabId(1)),
            Arc::new(FakeContent::rejecting()),
        )
        .await;
        let coord = coordinator(bus.clone(), Arc::new(CountingInjector::new(bus)));

        let err = coord.apply_yield(TabId(1), true, "TEST", 2).await.unwrap_err();
        assert!(matches!(err, DeliveryError::Rejected(ref m) if m.contains("unavailable")));
    }

    #[tokio::test(start_paused = true)]
    async fn zero_attempts_is_exhausted() {
        let bus = Arc::new(LocalBus::new(16));
        let injector = Arc::new(CountingInjector::new(bus.clone()));
        let coord = coordinator(bus, injector.clone());

        let err = coord.apply_yield(TabId(1), true, "TEST", 0).await.unwrap_err();
        assert_eq!(err, DeliveryError::Exhausted { attempts: 0 });
        assert_eq!(injector.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn query_prefers_live_state_over_shadow() {
        let bus = Arc::new(LocalBus::new(16));
        let coord = coordinator(bus.clone(), Arc::new(CountingInjector::new(bus.clone())));
        coord
            .sync_shadow(TabId(2), &YieldState::from_mode(YieldMode::Yielding))
            .await;
        bus.register(
            ContextRef::ContentScript(TabId(2)),
            Arc::new(FakeContent::new(YieldMode::Active)),
        )
        .await;

        let answer = coord.query_yield(TabId(2)).await;
        assert!(answer.live);
        assert_eq!(answer.state.state, YieldMode::Active);
        assert_eq!(coord.shadow_mode(TabId(2)).await, Some(YieldMode::Active));
    }

    #[tokio::test(start_paused = true)]
    async fn query_falls_back_to_shadow_when_unreachable() {
        let bus = Arc::new(LocalBus::new(16));
        let coord = coordinator(bus.clone(), Arc::new(CountingInjector::new(bus)));

        let unknown = coord.query_yield(TabId(4)).await;
        assert!(!unknown.live);
        assert_eq!(unknown.state.state, YieldMode::Active);

        coord
            .sync_shadow(TabId(4), &YieldState::from_mode(YieldMode::Yielding))
            .await;
        let shadowed = coord.query_yield(TabId(4)).await;
        assert!(!shadowed.live);
        assert!(shadowed.state.is_yielding());
    }

    #[tokio::test(start_paused = true)]
    async fn reapply_only_when_shadow_is_yielding() {
        let bus = Arc::new(LocalBus::new(16));
        let content = Arc::new(FakeContent::new(YieldMode::Active));
        bus.register(ContextRef::ContentScript(TabId(5)), content.clone())
            .await;
        let coord = coordinator(bus.clone(), Arc::new(CountingInjector::new(bus)));

        assert!(coord.reapply_after_navigation(TabId(5)).await.is_none());
        assert_eq!(*content.set_calls.lock().unwrap(), 0);

        coord
            .sync_shadow(TabId(5), &YieldState::from_mode(YieldMode::Yielding))
            .await;
        let result = coord.reapply_after_navigation(TabId(5)).await.unwrap();
        assert!(result.unwrap().is_yielding());
        assert_eq!(*content.set_calls.lock().unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn toggle_flips_and_syncs_shadow() {
        let bus = Arc::new(LocalBus::new(16));
        bus.register(
            ContextRef::ContentScript(TabId(6)),
            Arc::new(FakeContent::new(YieldMode::Active)),
        )
        .await;
        let coord = coordinator(bus.clone(), Arc::new(CountingInjector::new(bus)));

        let state = coord.toggle_yield(TabId(6), reasons::COMMAND).await.unwrap();
        assert!(state.is_yielding());
        assert_eq!(coord.shadow_mode(TabId(6)).await, Some(YieldMode::Yielding));
    }

    #[tokio::test(start_paused = true)]
    async fn forget_tab_drops_shadow() {
        let bus = Arc::new(LocalBus::new(16));
        let coord = coordinator(bus.clone(), Arc::new(CountingInjector::new(bus)));
        coord
            .sync_shadow(TabId(8), &YieldState::from_mode(YieldMode::Yielding))
            .await;
        assert!(coord.forget_tab(TabId(8)).await);
        assert!(!coord.forget_tab(TabId(8)).await);
        assert_eq!(coord.shadow(TabId(8)).await, None);
    }
}
