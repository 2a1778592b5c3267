//! The message taxonomy exchanged over the [`EventBus`](crate::EventBus).
//!
//! Requests are answered by exactly one [`Reply`]. Fire-and-forget
//! broadcasts are [`BusEvent`](crate::BusEvent)s; frame-scoped deliveries
//! are [`FrameMessage`]s.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::context::{ContextRef, TabId};
use crate::error::{CacheError, DeliveryError, ErrorKind, FetchError};
use crate::yield_state::YieldState;

/// A request addressed to one context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE", rename_all_fields = "camelCase")]
pub enum Request {
    /// Liveness probe (background → content)
    Ping { timestamp: i64 },

    /// Apply a yield transition (background → content)
    SetYield { enable: bool, reason: String },

    /// Flip the yield mode (background → content)
    ToggleYield { reason: String },

    /// Query the authoritative state (background → content)
    GetYieldState,

    /// A content script finished initializing (content → background)
    ContentReady { url: String },

    /// Read a tab's yield state through the coordinator (frame → background).
    /// `None` targets the sender's tab.
    GetYieldForTab {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tab_id: Option<TabId>,
    },

    /// Change a tab's yield state through the coordinator (frame → background)
    SetYieldForTab {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tab_id: Option<TabId>,
        enable: bool,
        reason: String,
    },

    /// Fetch a large resource and cache it for chunked reads
    StoreArtifact { url: String },

    /// Read one chunk of a cached artifact
    GetChunk { id: String, index: u64 },

    /// Drop a cached artifact early
    ReleaseArtifact { id: String },

    /// Remember a passively observed resource URL
    RecordResourceUrl {
        tab_id: TabId,
        resource_id: String,
        url: String,
    },

    /// Look up a remembered resource URL for the sender's tab
    LookupResourceUrl { resource_id: String },

    /// Fetch a captured resource URL as text, without credentials. Only
    /// URLs matching a capture rule are allowed.
    FetchResourceText { url: String },

    /// Load the document viewer into the sender's tab unless already loaded
    EnsureViewer,
}

impl Request {
    /// Short name used in log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Request::Ping { .. } => "ping",
            Request::SetYield { .. } => "set_yield",
            Request::ToggleYield { .. } => "toggle_yield",
            Request::GetYieldState => "get_yield_state",
            Request::ContentReady { .. } => "content_ready",
            Request::GetYieldForTab { .. } => "get_yield_for_tab",
            Request::SetYieldForTab { .. } => "set_yield_for_tab",
            Request::StoreArtifact { .. } => "store_artifact",
            Request::GetChunk { .. } => "get_chunk",
            Request::ReleaseArtifact { .. } => "release_artifact",
            Request::RecordResourceUrl { .. } => "record_resource_url",
            Request::LookupResourceUrl { .. } => "lookup_resource_url",
            Request::FetchResourceText { .. } => "fetch_resource_text",
            Request::EnsureViewer => "ensure_viewer",
        }
    }
}

/// Metadata returned when an artifact has been cached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactDescriptor {
    pub id: String,
    pub total_size: u64,
    pub total_chunks: u64,
    pub chunk_size: u64,
}

/// The answer to a [`Request`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE", rename_all_fields = "camelCase")]
pub enum Reply {
    Pong { timestamp: i64, response_time: i64 },

    YieldState { state: YieldState },

    /// Coordinator answer; `live` is false when served from the shadow copy
    TabYieldState {
        tab_id: TabId,
        state: YieldState,
        live: bool,
    },

    Ack,

    ArtifactStored { artifact: ArtifactDescriptor },

    Chunk { index: u64, data: Vec<u8> },

    ResourceUrl {
        url: Option<String>,
        lang: Option<String>,
        caps: Option<String>,
    },

    ResourceText { text: String },

    ViewerReady { already_injected: bool },

    Failure { kind: ErrorKind, error: String },

    /// A fetch answered with a non-success status
    FetchFailure {
        kind: ErrorKind,
        error: String,
        preview: String,
    },
}

impl Reply {
    pub fn failure(kind: ErrorKind, error: impl Into<String>) -> Self {
        Reply::Failure {
            kind,
            error: error.into(),
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Reply::Failure { .. } | Reply::FetchFailure { .. })
    }
}

impl From<DeliveryError> for Reply {
    fn from(err: DeliveryError) -> Self {
        Reply::failure(err.kind(), err.to_string())
    }
}

impl From<CacheError> for Reply {
    fn from(err: CacheError) -> Self {
        Reply::failure(err.kind(), err.to_string())
    }
}

impl From<FetchError> for Reply {
    fn from(err: FetchError) -> Self {
        let kind = err.kind();
        match err {
            FetchError::Http { status, preview } => Reply::FetchFailure {
                kind,
                error: format!("HTTP {status}"),
                preview,
            },
            other => Reply::failure(kind, other.to_string()),
        }
    }
}

/// A request together with the context it came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub sender: ContextRef,
    pub request: Request,
}

/// Messages delivered straight into a tab's UI frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE", rename_all_fields = "camelCase")]
pub enum FrameMessage {
    YieldStateChanged {
        state: YieldState,
        reason: String,
        timestamp: DateTime<Utc>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_wire_format() {
        let req = Request::GetChunk {
            id: "abc".into(),
            index: 2,
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"type\":\"GET_CHUNK\""));
        assert_eq!(req.kind(), "get_chunk");

        let parsed: Request = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, req);
    }

    #[test]
    fn fields_are_camel_case() {
        let req = Request::RecordResourceUrl {
            tab_id: TabId(1),
            resource_id: "vid123".into(),
            url: "https://x/api?sig=abc".into(),
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("resourceId"));
        assert!(json.contains("tabId"));
    }

    #[test]
    fn failure_reply_from_cache_error() {
        let reply: Reply = CacheError::NotFound("nope".into()).into();
        match reply {
            Reply::Failure { kind, error } => {
                assert_eq!(kind, ErrorKind::NotFound);
                assert!(error.contains("nope"));
            }
            other => panic!("Expected failure, got {other:?}"),
        }
    }

    #[test]
    fn http_fetch_error_keeps_body_preview() {
        let reply: Reply = FetchError::Http {
            status: 429,
            preview: "slow down".into(),
        }
        .into();
        assert!(reply.is_failure());
        let json = serde_json::to_value(&reply).unwrap();
        assert_eq!(json["type"], "FETCH_FAILURE");
        assert_eq!(json["error"], "HTTP 429");
        assert_eq!(json["preview"], "slow down");

        let plain: Reply = FetchError::NotAllowed("https://evil.test/".into()).into();
        assert!(matches!(plain, Reply::Failure { kind: ErrorKind::Rejected, .. }));
    }

    #[test]
    fn get_yield_for_tab_defaults_to_sender() {
        let parsed: Request = serde_json::from_str(r#"{"type":"GET_YIELD_FOR_TAB"}"#).unwrap();
        assert_eq!(parsed, Request::GetYieldForTab { tab_id: None });
    }
}
