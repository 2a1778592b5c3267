//! Bounded in-memory caches owned by the background context.
//!
//! Both caches are plain synchronous structures: every operation runs to
//! completion without suspending, and the owner wraps them in a lock so
//! each operation is atomic relative to the others.

pub mod artifact;
pub mod ephemeral;

pub use artifact::{ArtifactCache, ArtifactEntry};
pub use ephemeral::EphemeralUrlCache;
