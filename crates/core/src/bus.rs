//! The cross-context event bus.
//!
//! One request/response method and one broadcast method; nothing rides on
//! an ambient global dispatcher. [`LocalBus`] routes requests to handlers
//! registered per [`ContextRef`] and fans broadcasts out over
//! `tokio::sync::broadcast`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{RwLock, broadcast};
use tracing::debug;

use crate::context::{ContextRef, TabId};
use crate::error::TransportError;
use crate::event::BusEvent;
use crate::message::{Envelope, FrameMessage, Reply, Request};

/// The receiving side of a context.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, envelope: Envelope) -> Reply;
}

/// Typed message passing between contexts.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Deliver `request` to `target` and wait for its reply.
    async fn request(
        &self,
        sender: ContextRef,
        target: ContextRef,
        request: Request,
    ) -> Result<Reply, TransportError>;

    /// Fire-and-forget notification to every subscriber.
    fn broadcast(&self, event: BusEvent);

    /// Subscribe to broadcasts.
    fn subscribe(&self) -> broadcast::Receiver<Arc<BusEvent>>;
}

/// What an [`Injector`] loads into a tab.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Script {
    /// The content script, re-creating a torn-down context
    Content,
    /// The document viewer library, loaded on demand
    Viewer,
}

impl std::fmt::Display for Script {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Script::Content => f.write_str("content"),
            Script::Viewer => f.write_str("viewer"),
        }
    }
}

/// Loads code into a tab's page.
#[async_trait]
pub trait Injector: Send + Sync {
    async fn inject(&self, target: ContextRef, script: Script) -> Result<(), TransportError>;
}

/// Frame-scoped delivery into a tab's embedded UI frame.
pub trait FramePort: Send + Sync {
    fn post(&self, tab: TabId, message: FrameMessage);
}

/// In-process bus used by the runtime harness and in tests.
pub struct LocalBus {
    handlers: RwLock<HashMap<ContextRef, Arc<dyn MessageHandler>>>,
    sender: broadcast::Sender<Arc<BusEvent>>,
}

impl LocalBus {
    /// Create a new bus with the given broadcast capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            handlers: RwLock::new(HashMap::new()),
            sender,
        }
    }

    /// Start routing requests for `context` to `handler`, replacing any
    /// previous handler.
    pub async fn register(&self, context: ContextRef, handler: Arc<dyn MessageHandler>) {
        self.handlers.write().await.insert(context, handler);
        debug!(context = %context, "Context registered on bus");
        self.broadcast(BusEvent::ContextAttached { context });
    }

    /// Tear a context down silently. Senders are not told; their next
    /// request fails with [`TransportError::NoReceiver`].
    pub async fn unregister(&self, context: ContextRef) -> bool {
        let removed = self.handlers.write().await.remove(&context).is_some();
        if removed {
            debug!(context = %context, "Context removed from bus");
            self.broadcast(BusEvent::ContextDetached { context });
        }
        removed
    }

    pub async fn is_registered(&self, context: ContextRef) -> bool {
        self.handlers.read().await.contains_key(&context)
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl EventBus for LocalBus {
    async fn request(
        &self,
        sender: ContextRef,
        target: ContextRef,
        request: Request,
    ) -> Result<Reply, TransportError> {
        let handler = self
            .handlers
            .read()
            .await
            .get(&target)
            .cloned()
            .ok_or(TransportError::NoReceiver(target))?;

        Ok(handler.handle(Envelope { sender, request }).await)
    }

    fn broadcast(&self, event: BusEvent) {
        // No subscribers is fine
        let _ = self.sender.send(Arc::new(event));
    }

    fn subscribe(&self) -> broadcast::Receiver<Arc<BusEvent>> {
        self.sender.subscribe()
    }
}
