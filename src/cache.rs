//! Resource cache consulted before a transfer.
//!
//! Keys are source locators. A hit lets a member skip the network entirely;
//! successful transfers fill the cache so the same resource shown elsewhere
//! doesn't need to be fetched twice.

use bytes::Bytes;
use moka::future::Cache as MokaCache;

/// Byte cache keyed by source
#[async_trait::async_trait]
pub trait ResourceCache: Send + Sync {
    /// Look up the bytes stored for `source`
    async fn get(&self, source: &str) -> Option<Bytes>;

    /// Store the bytes fetched for `source`
    async fn put(&self, source: &str, bytes: Bytes);
}

/// Cache that never stores anything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCache;

#[async_trait::async_trait]
impl ResourceCache for NoCache {
    async fn get(&self, _source: &str) -> Option<Bytes> {
        None
    }

    async fn put(&self, _source: &str, _bytes: Bytes) {}
}

/// In-memory cache bounded by the total size of the bodies it holds
///
/// Eviction is handled by moka; the bound may be exceeded briefly until its
/// pending maintenance runs.
pub struct MemoryCache {
    cache: MokaCache<String, Bytes>,
    max_size_bytes: u64,
}

impl MemoryCache {
    /// Create a cache holding at most `max_size_bytes` of bodies
    pub fn new(max_size_bytes: u64) -> Self {
        let cache = MokaCache::builder()
            // Weight each entry by its body size; moka weights are u32
            .weigher(|_source: &String, body: &Bytes| -> u32 {
                body.len().min(u32::MAX as usize) as u32
            })
            .max_capacity(max_size_bytes)
            .build();
        Self {
            cache,
            max_size_bytes,
        }
    }

    /// Configured byte budget
    pub fn max_size_bytes(&self) -> u64 {
        self.max_size_bytes
    }

    /// Bytes currently held, as of the last maintenance run
    pub fn size_bytes(&self) -> u64 {
        self.cache.weighted_size()
    }

    /// Number of cached entries, as of the last maintenance run
    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }

    /// Apply pending evictions now
    pub async fn run_pending_tasks(&self) {
        self.cache.run_pending_tasks().await;
    }
}

impl std::fmt::Debug for MemoryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryCache")
            .field("max_size_bytes", &self.max_size_bytes)
            .field("size_bytes", &self.size_bytes())
            .field("entry_count", &self.entry_count())
            .finish()
    }
}

#[async_trait::async_trait]
impl ResourceCache for MemoryCache {
    async fn get(&self, source: &str) -> Option<Bytes> {
        self.cache.get(source).await
    }

    async fn put(&self, source: &str, bytes: Bytes) {
        if self.max_size_bytes == 0 {
            return;
        }
        self.cache.insert(source.to_string(), bytes).await;
    }
}
