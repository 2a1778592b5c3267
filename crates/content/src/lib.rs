//! Content-script side of the resilience layer.
//!
//! The content script owns the authoritative yield state of its tab and the
//! live attachment of the embedded UI frame. The state machine itself is
//! pure ([`YieldMachine`]); all document mutation goes through
//! [`FrameController`], the single component allowed to (re)attach the
//! frame.

pub mod agent;
pub mod dom;
pub mod frame;
pub mod machine;
pub mod reader;
pub mod watchdog;

pub use agent::ContentScript;
pub use dom::{DomError, DomOps, MemoryDom, NodeId, SharedDom};
pub use frame::FrameController;
pub use machine::{Transition, YieldMachine};
pub use reader::{ArtifactReader, ReadError};
pub use watchdog::Watchdog;
