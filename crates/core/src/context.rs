//! Execution contexts and how they are addressed.
//!
//! The background context is a singleton; content scripts and UI frames
//! exist once per tab and come and go with page loads.

use serde::{Deserialize, Serialize};

/// Browser tab identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TabId(pub u32);

impl TabId {
    /// Convert a raw host tab id. Negative ids mark requests that do not
    /// belong to a page (extension pages, the background itself).
    pub fn from_raw(raw: i64) -> Option<Self> {
        u32::try_from(raw).ok().map(TabId)
    }
}

impl std::fmt::Display for TabId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Address of one execution context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "tabId", rename_all = "snake_case")]
pub enum ContextRef {
    Background,
    ContentScript(TabId),
    UiFrame(TabId),
}

impl ContextRef {
    /// The tab this context lives in, if any.
    pub fn tab(&self) -> Option<TabId> {
        match self {
            ContextRef::Background => None,
            ContextRef::ContentScript(tab) | ContextRef::UiFrame(tab) => Some(*tab),
        }
    }
}

impl std::fmt::Display for ContextRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContextRef::Background => write!(f, "background"),
            ContextRef::ContentScript(tab) => write!(f, "content:{tab}"),
            ContextRef::UiFrame(tab) => write!(f, "frame:{tab}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_raw_tab_is_rejected() {
        assert_eq!(TabId::from_raw(-1), None);
        assert_eq!(TabId::from_raw(42), Some(TabId(42)));
    }

    #[test]
    fn context_tab_lookup() {
        assert_eq!(ContextRef::Background.tab(), None);
        assert_eq!(ContextRef::UiFrame(TabId(3)).tab(), Some(TabId(3)));
    }

    #[test]
    fn context_serialization() {
        let json = serde_json::to_string(&ContextRef::ContentScript(TabId(5))).unwrap();
        assert!(json.contains("content_script"));
        assert!(json.contains('5'));
    }
}
