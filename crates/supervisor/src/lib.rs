//! Connection supervisor: is a remote context listening, and if not, bring
//! it back once before giving up.
//!
//! The host can tear a context down (navigation, crash, unload) without
//! telling anyone. Probing before every important send avoids delivering
//! into a void and separates "no one is listening" from "the listener died
//! mid-request". Recovery is attempted exactly once per call; retry policy
//! belongs to the caller.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use resilink_config::SupervisorConfig;
use resilink_core::bus::{EventBus, Injector, Script};
use resilink_core::context::ContextRef;
use resilink_core::error::DeliveryError;
use resilink_core::message::{Reply, Request};
use tracing::{debug, info, warn};

/// Probes, recovers and delivers on behalf of one sending context.
pub struct ConnectionSupervisor {
    origin: ContextRef,
    bus: Arc<dyn EventBus>,
    injector: Arc<dyn Injector>,
    probe_timeout: Duration,
    settle_delay: Duration,
    request_timeout: Duration,
}

impl ConnectionSupervisor {
    pub fn new(
        origin: ContextRef,
        bus: Arc<dyn EventBus>,
        injector: Arc<dyn Injector>,
        config: &SupervisorConfig,
    ) -> Self {
        Self {
            origin,
            bus,
            injector,
            probe_timeout: config.probe_timeout(),
            settle_delay: config.settle_delay(),
            request_timeout: config.request_timeout(),
        }
    }

    /// Send a liveness probe and wait for the matching acknowledgment.
    ///
    /// Fails closed: a timeout, transport error, or any reply other than a
    /// pong echoing our timestamp counts as unreachable.
    pub async fn is_reachable(&self, target: ContextRef) -> bool {
        let timestamp = Utc::now().timestamp_millis();
        let probe = self
            .bus
            .request(self.origin, target, Request::Ping { timestamp });

        match tokio::time::timeout(self.probe_timeout, probe).await {
            Ok(Ok(Reply::Pong { timestamp: echoed, .. })) if echoed == timestamp => true,
            Ok(Ok(other)) => {
                debug!(context = %target, reply = ?other, "Probe got mismatched reply");
                false
            }
            Ok(Err(e)) => {
                debug!(context = %target, error = %e, "Probe failed");
                false
            }
            Err(_) => {
                debug!(
                    context = %target,
                    timeout_ms = self.probe_timeout.as_millis() as u64,
                    "Probe timed out"
                );
                false
            }
        }
    }

    /// Probe; if unreachable, reinject once, wait the settle delay and probe
    /// again. Returns the final reachability.
    pub async fn ensure_reachable(&self, target: ContextRef) -> bool {
        if self.is_reachable(target).await {
            return true;
        }

        info!(context = %target, "Context not connected, reinjecting controller");
        if let Err(e) = self.injector.inject(target, Script::Content).await {
            warn!(context = %target, error = %e, "Reinjection failed");
            return false;
        }

        tokio::time::sleep(self.settle_delay).await;

        let reachable = self.is_reachable(target).await;
        if !reachable {
            warn!(context = %target, "Context still unreachable after reinjection");
        }
        reachable
    }

    /// Probe, recover if needed, then deliver `request` exactly once.
    ///
    /// Never panics or escapes with an untyped failure: every outcome is a
    /// reply or a [`DeliveryError`].
    pub async fn send_with_recovery(
        &self,
        target: ContextRef,
        request: Request,
    ) -> Result<Reply, DeliveryError> {
        if !self.ensure_reachable(target).await {
            return Err(DeliveryError::Unreachable { context: target });
        }

        let kind = request.kind();
        match tokio::time::timeout(
            self.request_timeout,
            self.bus.request(self.origin, target, request),
        )
        .await
        {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(e)) => {
                warn!(context = %target, request = kind, error = %e, "Delivery failed");
                Err(e.into())
            }
            Err(_) => {
                warn!(context = %target, request = kind, "Delivery timed out");
                Err(DeliveryError::Timeout {
                    context: target,
                    after_ms: self.request_timeout.as_millis() as u64,
                })
            }
        }
    }

    pub fn origin(&self) -> ContextRef {
        self.origin
    }
}
