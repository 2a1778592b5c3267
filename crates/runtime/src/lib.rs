//! Resilink keeps a background worker, per-page content scripts and an
//! embedded UI frame consistent across navigation, teardown and
//! unreliable delivery.
//!
//! [`Runtime`] wires all three contexts onto an in-process
//! [`LocalBus`](resilink_core::LocalBus); hosts with a real messaging layer
//! implement [`EventBus`](resilink_core::EventBus) and
//! [`Injector`](resilink_core::Injector) instead.

pub mod logging;
pub mod runtime;

pub use runtime::{ContentHandle, Runtime};
