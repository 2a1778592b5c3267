//! Broadcast events: fire-and-forget notifications between contexts.
//!
//! Receivers treat state updates as last-write-wins snapshots, never as a
//! diff stream, so a broadcast arriving before or after a direct reply
//! yields the same result.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::context::{ContextRef, TabId};
use crate::yield_state::YieldState;

/// All broadcast events in the system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BusEvent {
    /// A content script changed its authoritative yield state
    YieldStateChanged {
        tab_id: TabId,
        state: YieldState,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// A context started listening on the bus
    ContextAttached { context: ContextRef },

    /// A context stopped listening (navigation, crash, unload)
    ContextDetached { context: ContextRef },
}

impl BusEvent {
    pub fn yield_state_changed(tab_id: TabId, state: YieldState, reason: &str) -> Self {
        BusEvent::YieldStateChanged {
            tab_id,
            state,
            reason: reason.to_string(),
            timestamp: Utc::now(),
        }
    }

    /// The tab an event concerns, if any.
    pub fn tab(&self) -> Option<TabId> {
        match self {
            BusEvent::YieldStateChanged { tab_id, .. } => Some(*tab_id),
            BusEvent::ContextAttached { context } | BusEvent::ContextDetached { context } => {
                context.tab()
            }
        }
    }
}
