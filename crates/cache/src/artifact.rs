//! Chunked artifact cache. Large binary payloads paged out in fixed-size
//! pieces because the messaging transport has a payload ceiling.
//!
//! Entries are addressed by a fresh opaque id per `put` (not
//! content-addressed). Capacity is enforced after every insert by evicting
//! the least-recently *accessed* entry while either the entry count exceeds
//! its cap, or more than one entry remains and the aggregate size exceeds
//! the byte cap. A single oversized entry is never evicted on size alone.

use std::collections::HashMap;

use resilink_config::ArtifactCacheConfig;
use resilink_core::error::CacheError;
use resilink_core::message::ArtifactDescriptor;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

/// A cached blob plus its bookkeeping.
#[derive(Debug, Clone)]
pub struct ArtifactEntry {
    pub id: String,
    bytes: Vec<u8>,
    pub chunk_size: u64,
    pub created_at: Instant,
    pub last_accessed_at: Instant,
    pub source_url: String,
    /// Monotonic access counter; orders recency even when clock readings tie
    access_seq: u64,
}

impl ArtifactEntry {
    pub fn total_size(&self) -> u64 {
        self.bytes.len() as u64
    }

    pub fn total_chunks(&self) -> u64 {
        self.total_size().div_ceil(self.chunk_size)
    }

    pub fn descriptor(&self) -> ArtifactDescriptor {
        ArtifactDescriptor {
            id: self.id.clone(),
            total_size: self.total_size(),
            total_chunks: self.total_chunks(),
            chunk_size: self.chunk_size,
        }
    }
}

/// Bounded LRU cache of binary artifacts.
pub struct ArtifactCache {
    entries: HashMap<String, ArtifactEntry>,
    chunk_size: u64,
    max_entries: usize,
    max_total_bytes: u64,
    total_bytes: u64,
    next_seq: u64,
}

impl ArtifactCache {
    pub fn new(config: &ArtifactCacheConfig) -> Self {
        Self::with_limits(config.chunk_size, config.max_entries, config.max_total_bytes)
    }

    /// `chunk_size` must be non-zero; config validation guarantees it.
    pub fn with_limits(chunk_size: u64, max_entries: usize, max_total_bytes: u64) -> Self {
        Self {
            entries: HashMap::new(),
            chunk_size: chunk_size.max(1),
            max_entries,
            max_total_bytes,
            total_bytes: 0,
            next_seq: 0,
        }
    }

    /// Store a blob under a fresh id, then enforce capacity.
    pub fn put(&mut self, bytes: Vec<u8>, source_url: impl Into<String>) -> ArtifactDescriptor {
        let now = Instant::now();
        let id = Uuid::new_v4().to_string();
        let entry = ArtifactEntry {
            id: id.clone(),
            bytes,
            chunk_size: self.chunk_size,
            created_at: now,
            last_accessed_at: now,
            source_url: source_url.into(),
            access_seq: self.bump_seq(),
        };
        let descriptor = entry.descriptor();

        self.total_bytes += entry.total_size();
        self.entries.insert(id, entry);
        debug!(
            artifact_id = %descriptor.id,
            total_size = descriptor.total_size,
            total_chunks = descriptor.total_chunks,
            "Artifact cached"
        );

        self.evict_if_needed();
        descriptor
    }

    /// Slice chunk `index` out of artifact `id`, refreshing its recency.
    pub fn get_chunk(&mut self, id: &str, index: u64) -> Result<Vec<u8>, CacheError> {
        let seq = self.bump_seq();
        let entry = self
            .entries
            .get_mut(id)
            .ok_or_else(|| CacheError::NotFound(id.to_string()))?;
        entry.access_seq = seq;
        entry.last_accessed_at = Instant::now();

        let total = entry.total_size();
        let invalid = || CacheError::InvalidRange {
            id: id.to_string(),
            index,
        };
        let start = index.checked_mul(entry.chunk_size).ok_or_else(invalid)?;
        if start >= total {
            return Err(invalid());
        }
        let end = start.saturating_add(entry.chunk_size).min(total);
        if end <= start {
            return Err(invalid());
        }

        Ok(entry.bytes[start as usize..end as usize].to_vec())
    }

    /// Drop an entry immediately, regardless of recency.
    pub fn release(&mut self, id: &str) -> bool {
        match self.entries.remove(id) {
            Some(entry) => {
                self.total_bytes -= entry.total_size();
                debug!(artifact_id = %id, "Artifact released");
                true
            }
            None => false,
        }
    }

    pub fn descriptor(&self, id: &str) -> Option<ArtifactDescriptor> {
        self.entries.get(id).map(ArtifactEntry::descriptor)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Aggregate size of all resident blobs.
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    fn bump_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    fn over_capacity(&self) -> bool {
        self.entries.len() > self.max_entries
            || (self.entries.len() > 1 && self.total_bytes > self.max_total_bytes)
    }

    fn evict_if_needed(&mut self) {
        while self.over_capacity() {
            let Some(oldest) = self
                .entries
                .values()
                .min_by_key(|e| e.access_seq)
                .map(|e| e.id.clone())
            else {
                break;
            };
            if let Some(entry) = self.entries.remove(&oldest) {
                self.total_bytes -= entry.total_size();
                debug!(
                    artifact_id = %oldest,
                    size = entry.total_size(),
                    resident = self.total_bytes,
                    "Evicted least-recently-used artifact"
                );
            }
        }
    }
}

impl Default for ArtifactCache {
    fn default() -> Self {
        Self::new(&ArtifactCacheConfig::default())
    }
}
