//! Chunked artifact reads from the content side.
//!
//! The transport has a payload ceiling, so an artifact is cached by the
//! background and pulled back one fixed-size chunk at a time.

use std::collections::HashMap;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use resilink_core::bus::EventBus;
use resilink_core::context::ContextRef;
use resilink_core::error::{ErrorKind, TransportError};
use resilink_core::message::{ArtifactDescriptor, Reply, Request};
use tokio::sync::Mutex;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ReadError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("{kind}: {message}")]
    Rejected { kind: ErrorKind, message: String },

    #[error("Unexpected reply: {0}")]
    Malformed(String),

    #[error("Chunk {index} has {actual} bytes, expected {expected}")]
    ChunkLength {
        index: u64,
        expected: u64,
        actual: u64,
    },

    #[error("Read {actual} of {expected} bytes")]
    Incomplete { expected: u64, actual: u64 },
}

type ReadFuture = Shared<BoxFuture<'static, Result<Arc<Vec<u8>>, ReadError>>>;

/// Reads artifacts through the background cache. Concurrent reads of the
/// same URL share one in-flight transfer.
pub struct ArtifactReader {
    origin: ContextRef,
    bus: Arc<dyn EventBus>,
    in_flight: Mutex<HashMap<String, ReadFuture>>,
}

impl ArtifactReader {
    pub fn new(origin: ContextRef, bus: Arc<dyn EventBus>) -> Self {
        Self {
            origin,
            bus,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub async fn read(&self, url: &str) -> Result<Arc<Vec<u8>>, ReadError> {
        let read = {
            let mut in_flight = self.in_flight.lock().await;
            in_flight
                .entry(url.to_string())
                .or_insert_with(|| {
                    read_artifact(self.origin, self.bus.clone(), url.to_string())
                        .boxed()
                        .shared()
                })
                .clone()
        };

        // A `Shared` polled to completion no longer compares equal, so
        // await a clone and keep `read` for the identity check.
        let result = read.clone().await;
        self.forget(url, &read).await;
        result
    }

    /// Drop the map entry for `url` only if it is still the transfer this
    /// caller awaited. A later read may already have replaced it.
    async fn forget(&self, url: &str, read: &ReadFuture) {
        let mut in_flight = self.in_flight.lock().await;
        if in_flight.get(url).is_some_and(|current| current.ptr_eq(read)) {
            in_flight.remove(url);
        }
    }

    pub async fn in_flight(&self) -> usize {
        self.in_flight.lock().await.len()
    }
}

async fn read_artifact(
    origin: ContextRef,
    bus: Arc<dyn EventBus>,
    url: String,
) -> Result<Arc<Vec<u8>>, ReadError> {
    let reply = bus
        .request(origin, ContextRef::Background, Request::StoreArtifact { url: url.clone() })
        .await?;
    let artifact = match reply {
        Reply::ArtifactStored { artifact } => artifact,
        other => return Err(unexpected(other)),
    };

    let result = read_chunks(origin, bus.as_ref(), &artifact).await;

    // Release whether or not the read succeeded
    let release = Request::ReleaseArtifact {
        id: artifact.id.clone(),
    };
    if let Err(e) = bus.request(origin, ContextRef::Background, release).await {
        warn!(id = %artifact.id, error = %e, "Artifact release failed");
    }

    match &result {
        Ok(bytes) => debug!(url = %url, bytes = bytes.len(), "Artifact read"),
        Err(e) => warn!(url = %url, error = %e, "Artifact read failed"),
    }
    result.map(Arc::new)
}

async fn read_chunks(
    origin: ContextRef,
    bus: &dyn EventBus,
    artifact: &ArtifactDescriptor,
) -> Result<Vec<u8>, ReadError> {
    let total = artifact.total_size;
    let mut buffer = Vec::with_capacity(usize::try_from(total).unwrap_or(0));

    for index in 0..artifact.total_chunks {
        let request = Request::GetChunk {
            id: artifact.id.clone(),
            index,
        };
        let data = match bus.request(origin, ContextRef::Background, request).await? {
            Reply::Chunk { index: got, data } if got == index => data,
            other => return Err(unexpected(other)),
        };

        let start = index.saturating_mul(artifact.chunk_size);
        let expected = artifact.chunk_size.min(total.saturating_sub(start));
        let actual = data.len() as u64;
        if actual != expected {
            return Err(ReadError::ChunkLength {
                index,
                expected,
                actual,
            });
        }
        buffer.extend_from_slice(&data);
    }

    let actual = buffer.len() as u64;
    if actual != total {
        return Err(ReadError::Incomplete {
            expected: total,
            actual,
        });
    }
    Ok(buffer)
}

fn unexpected(reply: Reply) -> ReadError {
    match reply {
        Reply::Failure { kind, error } | Reply::FetchFailure { kind, error, .. } => {
            ReadError::Rejected {
                kind,
                message: error,
            }
        }
        other => ReadError::Malformed(format!("{other:?}")),
    }
}
