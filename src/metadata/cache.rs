//! Process-wide metadata cache.
//!
//! Entries are keyed by logical endpoint and live until explicitly cleared.
//! The asynchronous path is single-flight: concurrent callers for a missing
//! key share one in-flight fetch, and a cache-wide async mutex serializes
//! fetch bodies. Failed fetches are never cached; every caller that was
//! waiting on the failed attempt receives the same error and the next call
//! starts a new attempt.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use dashmap::{mapref::entry::Entry as MapEntry, DashMap};
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::metadata::document::{MetadataDocument, ModelLoader};
use crate::protocol::ProtocolVersion;
use crate::query::metadata::{NavigationResolver, ResolverRegistry};
use crate::types::{Error, Result};

type InFlight = Shared<BoxFuture<'static, Result<Arc<MetadataCacheEntry>>>>;

/// Fetch currently running for a key.
struct Attempt {
    id: u64,
    cancel: CancellationToken,
    shared: InFlight,
}

/// Protocol version and navigation facts bound to a cached document.
#[derive(Clone)]
pub struct BoundMetadata {
    /// Detected protocol version.
    pub version: ProtocolVersion,
    /// Memoizing resolver over the document's model.
    pub resolver: Arc<dyn NavigationResolver>,
}

impl std::fmt::Debug for BoundMetadata {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundMetadata")
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

/// Cached metadata for one endpoint.
#[derive(Debug)]
pub struct MetadataCacheEntry {
    key: String,
    document: MetadataDocument,
    bound: tokio::sync::OnceCell<Arc<BoundMetadata>>,
}

impl MetadataCacheEntry {
    fn new(key: String, document: MetadataDocument) -> Self {
        Self {
            key,
            document,
            bound: tokio::sync::OnceCell::new(),
        }
    }

    /// Endpoint key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Document as fetched.
    pub fn document(&self) -> &MetadataDocument {
        &self.document
    }

    /// Version tokens observed when the document was fetched.
    pub fn version_tokens(&self) -> &[String] {
        &self.document.version_tokens
    }

    /// Bound metadata, if already resolved.
    pub fn bound(&self) -> Option<Arc<BoundMetadata>> {
        self.bound.get().cloned()
    }
}

#[derive(Default)]
struct CacheInner {
    entries: DashMap<String, Arc<MetadataCacheEntry>>,
    inflight: Mutex<HashMap<String, Attempt>>,
    next_attempt: AtomicU64,
    gate: tokio::sync::Mutex<()>,
    resolvers: ResolverRegistry,
}

/// Metadata cache keyed by logical endpoint.
#[derive(Clone, Default)]
pub struct MetadataCache {
    inner: Arc<CacheInner>,
}

impl std::fmt::Debug for MetadataCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataCache")
            .field("entries", &self.inner.entries.len())
            .finish_non_exhaustive()
    }
}

static GLOBAL: OnceLock<MetadataCache> = OnceLock::new();

impl MetadataCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache shared by every session in the process.
    pub fn global() -> &'static MetadataCache {
        GLOBAL.get_or_init(MetadataCache::new)
    }

    /// Returns the entry for `key`, if cached.
    pub fn get(&self, key: &str) -> Option<Arc<MetadataCacheEntry>> {
        self.inner
            .entries
            .get(key)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// True when `key` is cached.
    pub fn contains(&self, key: &str) -> bool {
        self.inner.entries.contains_key(key)
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    /// True when nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    /// Returns the entry for `key`, calling `factory` to create it when
    /// missing. The factory runs at most once per key; an error is returned
    /// to the caller and nothing is cached.
    pub fn get_or_add<F>(&self, key: &str, factory: F) -> Result<Arc<MetadataCacheEntry>>
    where
        F: FnOnce() -> Result<MetadataDocument>,
    {
        if let Some(hit) = self.get(key) {
            debug!(key, "metadata cache hit");
            return Ok(hit);
        }
        match self.inner.entries.entry(key.to_owned()) {
            MapEntry::Occupied(occupied) => Ok(Arc::clone(occupied.get())),
            MapEntry::Vacant(vacant) => {
                let document = factory()?;
                debug!(key, "metadata cached from synchronous factory");
                let entry = Arc::new(MetadataCacheEntry::new(key.to_owned(), document));
                vacant.insert(Arc::clone(&entry));
                Ok(entry)
            }
        }
    }

    /// Asynchronous [`MetadataCache::get_or_add`] with single-flight fetches.
    ///
    /// The fetch runs as its own task, so it finishes and releases the fetch
    /// gate even when every caller stops waiting. The factory receives a
    /// token owned by the cache; [`MetadataCache::clear`] cancels it. Must be
    /// called within a tokio runtime.
    pub async fn get_or_add_async<F, Fut>(
        &self,
        key: &str,
        factory: F,
    ) -> Result<Arc<MetadataCacheEntry>>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<MetadataDocument>> + Send + 'static,
    {
        if let Some(hit) = self.get(key) {
            debug!(key, "metadata cache hit");
            return Ok(hit);
        }
        let shared = {
            let mut inflight = self.inner.inflight.lock();
            if let Some(hit) = self.get(key) {
                return Ok(hit);
            }
            match inflight.get(key) {
                Some(attempt) => {
                    debug!(key, "joining in-flight metadata fetch");
                    attempt.shared.clone()
                }
                None => {
                    let id = self.inner.next_attempt.fetch_add(1, Ordering::Relaxed);
                    let cancel = CancellationToken::new();
                    let task = tokio::spawn(Self::fetch(
                        Arc::clone(&self.inner),
                        key.to_owned(),
                        id,
                        cancel.clone(),
                        factory,
                    ));
                    let shared = async move {
                        task.await.unwrap_or_else(|err| {
                            Err(Error::Transport(format!("metadata fetch task failed: {err}")))
                        })
                    }
                    .boxed()
                    .shared();
                    inflight.insert(
                        key.to_owned(),
                        Attempt {
                            id,
                            cancel,
                            shared: shared.clone(),
                        },
                    );
                    shared
                }
            }
        };
        shared.await
    }

    async fn fetch<F, Fut>(
        inner: Arc<CacheInner>,
        key: String,
        id: u64,
        cancel: CancellationToken,
        factory: F,
    ) -> Result<Arc<MetadataCacheEntry>>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<MetadataDocument>> + Send + 'static,
    {
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(key = %key, "metadata fetch cancelled");
                Err(Error::Cancelled)
            }
            result = Self::fetch_gated(&inner, &key, cancel.clone(), factory) => result,
        };
        let mut inflight = inner.inflight.lock();
        let current = inflight.get(&key).is_some_and(|attempt| attempt.id == id);
        if current {
            inflight.remove(&key);
            match &result {
                Ok(entry) => {
                    inner.entries.insert(key.clone(), Arc::clone(entry));
                }
                Err(err) => debug!(key = %key, error = %err, "metadata fetch failed"),
            }
        } else {
            debug!(key = %key, "metadata fetch outlived its cache entry");
        }
        result
    }

    async fn fetch_gated<F, Fut>(
        inner: &CacheInner,
        key: &str,
        cancel: CancellationToken,
        factory: F,
    ) -> Result<Arc<MetadataCacheEntry>>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<MetadataDocument>>,
    {
        let _gate = inner.gate.lock().await;
        let existing = inner.entries.get(key).map(|entry| Arc::clone(entry.value()));
        if let Some(entry) = existing {
            return Ok(entry);
        }
        debug!(key, "fetching metadata");
        let document = factory(cancel).await?;
        Ok(Arc::new(MetadataCacheEntry::new(key.to_owned(), document)))
    }

    /// Binds the entry's document to a protocol version and a memoizing
    /// resolver. Binding happens once per entry; a failed binding is retried
    /// by the next caller.
    pub async fn bind(
        &self,
        entry: &MetadataCacheEntry,
        loader: &dyn ModelLoader,
    ) -> Result<Arc<BoundMetadata>> {
        entry
            .bound
            .get_or_try_init(|| async {
                let version = entry.document.detect_version()?;
                let base = loader.load(&entry.document)?;
                let cached = self.inner.resolvers.resolver_for(&entry.key, || base);
                debug!(key = %entry.key, version = %version, "bound metadata");
                Ok(Arc::new(BoundMetadata {
                    version,
                    resolver: cached as Arc<dyn NavigationResolver>,
                }))
            })
            .await
            .cloned()
    }

    /// Evicts one entry and cancels its in-flight fetch, if any.
    pub fn clear(&self, key: &str) {
        if let Some(attempt) = self.inner.inflight.lock().remove(key) {
            attempt.cancel.cancel();
            debug!(key, "in-flight metadata fetch cancelled");
        }
        self.inner.entries.remove(key);
        self.inner.resolvers.remove(key);
        debug!(key, "metadata cache entry cleared");
    }

    /// Evicts every entry and drops all memoized resolvers.
    pub fn clear_all(&self) {
        for (_, attempt) in self.inner.inflight.lock().drain() {
            attempt.cancel.cancel();
        }
        self.inner.entries.clear();
        self.inner.resolvers.clear();
        debug!("metadata cache cleared");
    }

    /// Number of endpoints with a memoized resolver.
    pub fn resolver_count(&self) -> usize {
        self.inner.resolvers.len()
    }
}
