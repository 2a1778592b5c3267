//! The two-valued yield mode and the state snapshot exchanged between
//! contexts.
//!
//! Only the content script holds an authoritative [`YieldState`]; every
//! other copy is a snapshot or a shadow.

use serde::{Deserialize, Serialize};

/// Whether the embedded UI frame is attached (ACTIVE) or removed from the
/// document to make room for an external debugging tool (YIELDING).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum YieldMode {
    #[default]
    Active,
    Yielding,
}

impl std::fmt::Display for YieldMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            YieldMode::Active => f.write_str("ACTIVE"),
            YieldMode::Yielding => f.write_str("YIELDING"),
        }
    }
}

/// Snapshot of a tab's yield state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct YieldState {
    pub state: YieldMode,

    /// The frame controller has finished constructing the frame.
    pub ready: bool,

    /// The frame is currently attached to the document.
    pub frame_present: bool,

    pub sidebar_visible: bool,

    /// Reason given for the last transition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl YieldState {
    /// State reported when no frame controller exists in the context.
    pub fn unavailable() -> Self {
        Self::default()
    }

    /// A best-effort state built from nothing but a remembered mode.
    pub fn from_mode(mode: YieldMode) -> Self {
        Self {
            state: mode,
            ..Self::default()
        }
    }

    pub fn is_yielding(&self) -> bool {
        self.state == YieldMode::Yielding
    }
}

/// Well-known transition reasons.
pub mod reasons {
    pub const REAPPLY_AFTER_NAVIGATION: &str = "REAPPLY_AFTER_NAVIGATION";
    pub const INIT_WHILE_YIELDING: &str = "INIT_WHILE_YIELDING";
    pub const CONTAINER_RESTORED: &str = "CONTAINER_RESTORED";
    pub const PLACEHOLDER_RESUME_BUTTON: &str = "PLACEHOLDER_RESUME_BUTTON";
    pub const IFRAME_READY: &str = "IFRAME_READY";
    pub const PREFERENCES: &str = "PREFERENCES";
    pub const COMMAND: &str = "COMMAND";
    pub const EXTERNAL: &str = "EXTERNAL";
}
