#![forbid(unsafe_code)]

//! Session facade.
//!
//! A session binds [`Settings`] to one metadata cache entry, constructs the
//! protocol adapter for it on first use and sends compiled requests through
//! the configured transport. Adapter and connection live in resettable
//! one-shot slots: concurrent callers share one initialization, a failed
//! initialization leaves the slot empty, and clearing swaps in a fresh slot.

mod settings;

pub use settings::{Settings, SettingsFile};

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::metadata::{MetadataCache, MetadataCacheEntry, MetadataDocument};
use crate::protocol::{create_adapter, CompiledRequest, Dialect, HttpMethod, ProtocolAdapter};
use crate::query::command::CommandState;
use crate::transport::{Connection, Request, Response};
use crate::types::{Error, Result};

type AdapterSlot = Arc<OnceCell<Arc<dyn ProtocolAdapter>>>;
type ConnectionSlot = Arc<OnceLock<Connection>>;

/// Adapter resolution state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// No adapter yet, nothing in progress.
    Unresolved,
    /// A caller is resolving metadata and the adapter.
    Resolving,
    /// Adapter is ready.
    Resolved,
}

/// Decrements the resolving counter when initialization ends either way.
struct ResolvingGuard<'a>(&'a AtomicUsize);

impl<'a> ResolvingGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for ResolvingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Client session over one OData service.
#[derive(Debug)]
pub struct Session {
    settings: Settings,
    cache: MetadataCache,
    adapter: RwLock<AdapterSlot>,
    connection: RwLock<ConnectionSlot>,
    resolving: AtomicUsize,
    closed: AtomicBool,
}

impl Session {
    /// Session backed by the process-wide metadata cache.
    pub fn new(settings: Settings) -> Result<Self> {
        Self::with_cache(settings, MetadataCache::global().clone())
    }

    /// Session backed by `cache`.
    pub fn with_cache(settings: Settings, cache: MetadataCache) -> Result<Self> {
        settings.validate()?;
        let session = Self {
            settings,
            cache,
            adapter: RwLock::new(AdapterSlot::default()),
            connection: RwLock::new(ConnectionSlot::default()),
            resolving: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        };
        session.register_static_document()?;
        Ok(session)
    }

    /// Settings the session was created with.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Metadata cache the session resolves through.
    pub fn cache(&self) -> &MetadataCache {
        &self.cache
    }

    /// Current adapter resolution state.
    pub fn state(&self) -> SessionState {
        if self.adapter.read().initialized() {
            SessionState::Resolved
        } else if self.resolving.load(Ordering::SeqCst) > 0 {
            SessionState::Resolving
        } else {
            SessionState::Unresolved
        }
    }

    fn register_static_document(&self) -> Result<Option<Arc<MetadataCacheEntry>>> {
        let Some(document) = &self.settings.metadata_document else {
            return Ok(None);
        };
        self.cache
            .get_or_add(self.settings.metadata_key(), || {
                Ok(MetadataDocument::new(document.clone()))
            })
            .map(Some)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Invalid("session is closed".into()));
        }
        Ok(())
    }

    /// Connection to the service, created on first use.
    pub fn connection(&self) -> Result<Connection> {
        self.ensure_open()?;
        let transport = self
            .settings
            .transport
            .clone()
            .ok_or_else(|| Error::Config("no transport configured".into()))?;
        if self.settings.renew_connection {
            return Ok(Connection::new(transport, self.settings.request_timeout));
        }
        let slot = Arc::clone(&*self.connection.read());
        Ok(slot
            .get_or_init(|| {
                debug!(base = %self.settings.base_uri, "opening connection");
                Connection::new(transport, self.settings.request_timeout)
            })
            .clone())
    }

    /// Fetches `<base>/$metadata` without touching the cache.
    pub async fn fetch_metadata(&self, cancel: &CancellationToken) -> Result<MetadataDocument> {
        let connection = self.connection()?;
        fetch_document(connection, self.metadata_uri(), cancel.clone()).await
    }

    fn metadata_uri(&self) -> String {
        format!("{}/$metadata", self.settings.metadata_key())
    }

    /// The shared fetch runs under the cache's token rather than a caller's:
    /// a caller that gives up stops waiting, and clearing the entry aborts
    /// the request.
    async fn metadata_entry(&self) -> Result<Arc<MetadataCacheEntry>> {
        if let Some(entry) = self.register_static_document()? {
            return Ok(entry);
        }
        let connection = self.connection()?;
        let uri = self.metadata_uri();
        self.cache
            .get_or_add_async(self.settings.metadata_key(), move |cancel| {
                fetch_document(connection, uri, cancel)
            })
            .await
    }

    async fn build_adapter(&self) -> Result<Arc<dyn ProtocolAdapter>> {
        let _resolving = ResolvingGuard::enter(&self.resolving);
        let entry = self.metadata_entry().await?;
        let bound = self
            .cache
            .bind(&entry, self.settings.model_loader.as_ref())
            .await?;
        create_adapter(
            self.settings.adapter_factory.as_deref(),
            bound.version,
            Arc::clone(&bound.resolver),
            &self.settings.adapter_options(),
        )
    }

    /// Resolves metadata and the protocol adapter, reusing both once
    /// resolved. Concurrent callers share one resolution; a failure is
    /// returned to each of them and the next call starts over.
    pub async fn resolve_adapter(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Arc<dyn ProtocolAdapter>> {
        self.ensure_open()?;
        let slot = Arc::clone(&*self.adapter.read());
        if let Some(adapter) = slot.get() {
            return Ok(Arc::clone(adapter));
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            adapter = slot.get_or_try_init(|| self.build_adapter()) => adapter.cloned(),
        }
    }

    /// Evicts this session's metadata and drops its adapter.
    pub fn clear_metadata_cache(&self) {
        self.cache.clear(self.settings.metadata_key());
        *self.adapter.write() = AdapterSlot::default();
        info!(key = %self.settings.metadata_key(), "session metadata cleared");
    }

    /// Compiles `command` with the session's adapter.
    pub async fn compile(
        &self,
        command: &CommandState,
        cancel: &CancellationToken,
    ) -> Result<CompiledRequest> {
        self.resolve_adapter(cancel).await?.compile(command)
    }

    /// Compiles `command` and sends it.
    pub async fn execute(
        &self,
        command: &CommandState,
        cancel: &CancellationToken,
    ) -> Result<Response> {
        let adapter = self.resolve_adapter(cancel).await?;
        let compiled = adapter.compile(command)?;
        let mut request = Request::new(
            compiled.method,
            format!("{}/{}", self.settings.metadata_key(), compiled.relative_uri()),
        )
        .header("Accept", "application/json");
        request = match adapter.dialect() {
            Dialect::Legacy => request.header("DataServiceVersion", adapter.version().as_str()),
            Dialect::Modern => request.header("OData-Version", adapter.version().as_str()),
        };
        if let Some(payload) = &compiled.payload {
            let body = serde_json::to_value(payload)
                .map_err(|err| Error::Invalid(format!("payload is not serializable: {err}")))?;
            request = request.header("Content-Type", "application/json").body(body);
        }
        if compiled.method != HttpMethod::Get {
            debug!(method = %compiled.method, path = %compiled.path, "executing modification");
        }
        self.connection()?.send(request, cancel).await
    }

    /// Releases the connection; later calls fail.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            *self.connection.write() = ConnectionSlot::default();
            *self.adapter.write() = AdapterSlot::default();
            debug!(base = %self.settings.base_uri, "session closed");
        }
    }

    /// True after [`Session::close`].
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

async fn fetch_document(
    connection: Connection,
    uri: String,
    cancel: CancellationToken,
) -> Result<MetadataDocument> {
    let request = Request::new(HttpMethod::Get, uri).header("Accept", "application/xml");
    let response = connection.send(request, &cancel).await?;
    Ok(MetadataDocument::with_headers(
        response.body.clone(),
        response.header_pairs(),
    ))
}
