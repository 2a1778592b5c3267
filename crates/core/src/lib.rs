//! # resilink core
//!
//! Domain types, traits, and error definitions for the cross-context
//! resilience layer. Three independently-lifecycled contexts (background,
//! content script, UI frame) talk to each other only through the types
//! defined here.
//!
//! ## Design Philosophy
//!
//! Every seam to the host environment is a trait here:
//! - [`EventBus`]: request/response plus fire-and-forget broadcast
//! - [`MessageHandler`]: the receiving side of a context
//! - [`Injector`]: loading a [`Script`] into a tab, e.g. re-creating a
//!   torn-down context
//! - [`FramePort`]: frame-scoped delivery into the embedded UI frame
//!
//! Implementations live in their respective crates; [`LocalBus`] is the
//! in-process bus used by the runtime harness and tests.

pub mod bus;
pub mod context;
pub mod error;
pub mod event;
pub mod message;
pub mod yield_state;

// Re-export key types at crate root for ergonomics
pub use bus::{EventBus, FramePort, Injector, LocalBus, MessageHandler, Script};
pub use context::{ContextRef, TabId};
pub use error::{CacheError, DeliveryError, Error, ErrorKind, FetchError, Result, TransportError};
pub use event::BusEvent;
pub use message::{ArtifactDescriptor, Envelope, FrameMessage, Reply, Request};
pub use yield_state::{YieldMode, YieldState, reasons};
