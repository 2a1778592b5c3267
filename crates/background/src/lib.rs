//! Background-context services.
//!
//! The background is a singleton per install. It owns both caches and the
//! shadow yield state, and drives content scripts through the
//! [`ConnectionSupervisor`](resilink_supervisor::ConnectionSupervisor).

pub mod capture;
pub mod coordinator;
pub mod fetch;
pub mod service;

pub use capture::{CaptureRules, Captured};
pub use coordinator::{TabYield, YieldCoordinator};
pub use fetch::{ArtifactFetcher, HttpFetcher};
pub use service::BackgroundService;
