//! The per-document content script.
//!
//! Answers liveness probes and yield requests from the background. A new
//! instance is created for every page load; it never inherits state from
//! the previous document.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use resilink_core::bus::{EventBus, MessageHandler};
use resilink_core::context::{ContextRef, TabId};
use resilink_core::error::{ErrorKind, TransportError};
use resilink_core::message::{Envelope, Reply, Request};
use tokio::sync::RwLock;
use tracing::debug;

use crate::dom::DomOps;
use crate::frame::FrameController;
use crate::reader::{ArtifactReader, ReadError};

pub struct ContentScript<D: DomOps> {
    tab: TabId,
    url: String,
    bus: Arc<dyn EventBus>,
    controller: RwLock<Option<Arc<FrameController<D>>>>,
    reader: ArtifactReader,
}

impl<D: DomOps> ContentScript<D> {
    pub fn new(tab: TabId, url: impl Into<String>, bus: Arc<dyn EventBus>) -> Self {
        let reader = ArtifactReader::new(ContextRef::ContentScript(tab), bus.clone());
        Self {
            tab,
            url: url.into(),
            bus,
            controller: RwLock::new(None),
            reader,
        }
    }

    pub fn context(&self) -> ContextRef {
        ContextRef::ContentScript(self.tab)
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn attach_controller(&self, controller: Arc<FrameController<D>>) {
        *self.controller.write().await = Some(controller);
    }

    pub async fn controller(&self) -> Option<Arc<FrameController<D>>> {
        self.controller.read().await.clone()
    }

    /// Tell the background this document is ready. Must be sent once the
    /// script is listening, since the background may answer by reapplying
    /// yield state.
    pub async fn announce(&self) -> Result<Reply, TransportError> {
        debug!(tab_id = %self.tab, url = %self.url, "Announcing content ready");
        self.bus
            .request(
                self.context(),
                ContextRef::Background,
                Request::ContentReady {
                    url: self.url.clone(),
                },
            )
            .await
    }

    /// Fetch an artifact through the background's chunked cache.
    pub async fn read_artifact(&self, url: &str) -> Result<Arc<Vec<u8>>, ReadError> {
        self.reader.read(url).await
    }
}

#[async_trait]
impl<D: DomOps> MessageHandler for ContentScript<D> {
    async fn handle(&self, envelope: Envelope) -> Reply {
        let kind = envelope.request.kind();
        if let Request::Ping { timestamp } = envelope.request {
            return Reply::Pong {
                timestamp,
                response_time: Utc::now().timestamp_millis(),
            };
        }

        let Some(controller) = self.controller().await else {
            debug!(tab_id = %self.tab, request = kind, "Request before frame controller exists");
            return Reply::failure(ErrorKind::Rejected, "frame controller unavailable");
        };

        let state = match envelope.request {
            Request::SetYield { enable, reason } => controller.set(enable, &reason).await,
            Request::ToggleYield { reason } => controller.toggle(&reason).await,
            Request::GetYieldState => controller.state().await,
            _ => {
                return Reply::failure(
                    ErrorKind::Rejected,
                    format!("{kind} is not handled by content scripts"),
                );
            }
        };
        Reply::YieldState { state }
    }
}
