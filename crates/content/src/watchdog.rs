//! Watches for the page undoing our frame attachment.
//!
//! The watchdog only detects. Repair is delegated to
//! [`FrameController::heal`] so the yield mode is respected.

use std::sync::Arc;
use std::time::Duration;

use resilink_core::yield_state::reasons;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::dom::DomOps;
use crate::frame::FrameController;

pub struct Watchdog<D: DomOps> {
    controller: Arc<FrameController<D>>,
}

impl<D: DomOps> Watchdog<D> {
    pub fn new(controller: Arc<FrameController<D>>) -> Self {
        Self { controller }
    }

    /// One observation pass. Returns whether a repair was made.
    pub async fn check(&self) -> bool {
        if self.controller.is_consistent().await {
            return false;
        }

        debug!(tab_id = %self.controller.tab(), "Unexpected frame mutation detected");
        match self.controller.heal(reasons::CONTAINER_RESTORED).await {
            Ok(repaired) => repaired,
            Err(e) => {
                warn!(tab_id = %self.controller.tab(), error = %e, "Frame repair failed");
                false
            }
        }
    }

    /// Run [`check`](Self::check) every `period` until aborted.
    pub fn spawn(self, period: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                self.check().await;
            }
        })
    }
}
