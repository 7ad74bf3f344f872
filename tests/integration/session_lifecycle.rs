//! Session resolution, invalidation, execution, timeout and cancellation.

#![allow(missing_docs)]

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use odata_query::metadata::MetadataCache;
use odata_query::protocol::{
    AdapterFactory, AdapterOptions, DefaultAdapterFactory, HttpMethod, ProtocolAdapter,
    ProtocolVersion,
};
use odata_query::query::{command::Entry, CommandBuilder, Expr, NavigationResolver, Value};
use odata_query::session::{Session, SessionState, Settings};
use odata_query::transport::{Request, Response, Transport};
use odata_query::types::{Error, Result};

const BASE: &str = "http://svc/Northwind.svc/";

#[derive(Debug)]
struct FakeService {
    version_header: &'static str,
    model_version: &'static str,
    delay: Duration,
    fail_first: AtomicUsize,
    metadata_requests: AtomicUsize,
    sent: Mutex<Vec<Request>>,
}

impl FakeService {
    fn new() -> Self {
        Self {
            version_header: "4.0",
            model_version: "4.0",
            delay: Duration::ZERO,
            fail_first: AtomicUsize::new(0),
            metadata_requests: AtomicUsize::new(0),
            sent: Mutex::new(Vec::new()),
        }
    }

    fn metadata_requests(&self) -> usize {
        self.metadata_requests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for FakeService {
    async fn send(&self, request: Request) -> Result<Response> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if request.uri.ends_with("/$metadata") {
            self.metadata_requests.fetch_add(1, Ordering::SeqCst);
            let failing = self
                .fail_first
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Ok(Response {
                    status: 503,
                    ..Response::default()
                });
            }
            return Ok(Response::ok(common::northwind_json(self.model_version))
                .with_header("OData-Version", self.version_header));
        }
        self.sent.lock().push(request);
        Ok(Response::ok("{}"))
    }
}

#[derive(Debug, Default)]
struct CountingFactory {
    created: AtomicUsize,
}

impl AdapterFactory for CountingFactory {
    fn create(
        &self,
        version: ProtocolVersion,
        resolver: Arc<dyn NavigationResolver>,
        options: &AdapterOptions,
    ) -> Option<Arc<dyn ProtocolAdapter>> {
        self.created.fetch_add(1, Ordering::SeqCst);
        DefaultAdapterFactory.create(version, resolver, options)
    }
}

fn session(service: &Arc<FakeService>, factory: &Arc<CountingFactory>) -> Session {
    let settings = Settings::new(BASE)
        .with_transport(Arc::clone(service) as Arc<dyn Transport>)
        .with_adapter_factory(Arc::clone(factory) as Arc<dyn AdapterFactory>);
    Session::with_cache(settings, MetadataCache::new()).unwrap()
}

#[tokio::test]
async fn resolve_clear_resolve_builds_a_new_adapter() {
    let service = Arc::new(FakeService::new());
    let factory = Arc::new(CountingFactory::default());
    let session = session(&service, &factory);
    let cancel = CancellationToken::new();

    assert_eq!(session.state(), SessionState::Unresolved);
    let first = session.resolve_adapter(&cancel).await.unwrap();
    assert_eq!(session.state(), SessionState::Resolved);
    assert_eq!(first.version(), ProtocolVersion::V4);

    let again = session.resolve_adapter(&cancel).await.unwrap();
    assert!(Arc::ptr_eq(&first, &again));
    assert_eq!(factory.created.load(Ordering::SeqCst), 1);
    assert_eq!(service.metadata_requests(), 1);

    session.clear_metadata_cache();
    assert_eq!(session.state(), SessionState::Unresolved);
    assert!(!session.cache().contains("http://svc/Northwind.svc"));

    let fresh = session.resolve_adapter(&cancel).await.unwrap();
    assert!(!Arc::ptr_eq(&first, &fresh));
    assert_eq!(factory.created.load(Ordering::SeqCst), 2);
    assert_eq!(service.metadata_requests(), 2);
}

#[tokio::test]
async fn concurrent_resolution_fetches_and_constructs_once() {
    let service = Arc::new(FakeService {
        delay: Duration::from_millis(20),
        ..FakeService::new()
    });
    let factory = Arc::new(CountingFactory::default());
    let session = session(&service, &factory);
    let cancel = CancellationToken::new();

    let adapters: Vec<_> = join_all((0..8).map(|_| session.resolve_adapter(&cancel)))
        .await
        .into_iter()
        .collect::<Result<_>>()
        .unwrap();
    assert!(adapters.iter().all(|a| Arc::ptr_eq(a, &adapters[0])));
    assert_eq!(service.metadata_requests(), 1);
    assert_eq!(factory.created.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn failed_resolution_is_retried() {
    let service = Arc::new(FakeService {
        fail_first: AtomicUsize::new(1),
        ..FakeService::new()
    });
    let factory = Arc::new(CountingFactory::default());
    let session = session(&service, &factory);
    let cancel = CancellationToken::new();

    let err = session.resolve_adapter(&cancel).await.unwrap_err();
    assert_eq!(err.code(), "Transport");
    assert_eq!(session.state(), SessionState::Unresolved);

    session.resolve_adapter(&cancel).await.unwrap();
    assert_eq!(service.metadata_requests(), 2);
    assert_eq!(factory.created.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn legacy_service_gets_legacy_adapter() {
    let service = Arc::new(FakeService {
        version_header: "3.0;NetFx",
        model_version: "3.0",
        ..FakeService::new()
    });
    let factory = Arc::new(CountingFactory::default());
    let session = session(&service, &factory);
    let command = CommandBuilder::new()
        .collection("Products")
        .function("MostExpensive", [("count", 3)])
        .build()
        .unwrap();
    let request = session
        .compile(&command, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(request.relative_uri(), "Products/MostExpensive?count=3");
}

#[tokio::test]
async fn unsupported_service_version_is_reported() {
    let service = Arc::new(FakeService {
        version_header: "5.0",
        model_version: "6.0",
        ..FakeService::new()
    });
    let factory = Arc::new(CountingFactory::default());
    let session = session(&service, &factory);
    let err = session
        .resolve_adapter(&CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "OData protocols 5.0,6.0 are not supported");
    assert_eq!(factory.created.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn execute_sends_compiled_requests() {
    let service = Arc::new(FakeService::new());
    let factory = Arc::new(CountingFactory::default());
    let session = session(&service, &factory);
    let cancel = CancellationToken::new();

    let query = CommandBuilder::new()
        .collection("Products")
        .filter(Expr::reference("Price").gt(10))
        .top(5)
        .build()
        .unwrap();
    session.execute(&query, &cancel).await.unwrap();

    let mut entry = Entry::new();
    entry.insert("ProductName".into(), Value::from("Chai"));
    let insert = CommandBuilder::new()
        .collection("Products")
        .insert(entry)
        .build()
        .unwrap();
    session.execute(&insert, &cancel).await.unwrap();

    let sent = service.sent.lock();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].method, HttpMethod::Get);
    assert_eq!(
        sent[0].uri,
        "http://svc/Northwind.svc/Products?$filter=Price gt 10&$top=5"
    );
    assert!(sent[0]
        .headers
        .iter()
        .any(|(name, value)| name == "OData-Version" && value == "4.0"));
    assert_eq!(sent[1].method, HttpMethod::Post);
    assert_eq!(
        sent[1].body,
        Some(serde_json::json!({"ProductName": {"t": "String", "v": "Chai"}}))
    );
}

#[tokio::test]
async fn timeout_and_cancellation_are_distinct() {
    let slow = Arc::new(FakeService {
        delay: Duration::from_secs(30),
        ..FakeService::new()
    });
    let factory = Arc::new(CountingFactory::default());

    let settings = Settings::new(BASE)
        .with_transport(Arc::clone(&slow) as Arc<dyn Transport>)
        .with_request_timeout(Some(Duration::from_millis(20)));
    let timed = Session::with_cache(settings, MetadataCache::new()).unwrap();
    let err = timed
        .resolve_adapter(&CancellationToken::new())
        .await
        .unwrap_err();
    assert!(err.is_timeout());
    assert_eq!(err.code(), "Timeout");
    assert!(!timed.cache().contains("http://svc/Northwind.svc"));

    let patient = session(&slow, &factory);
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });
    let err = patient.resolve_adapter(&cancel).await.unwrap_err();
    assert_eq!(err, Error::Cancelled);
    assert!(!err.is_timeout());
    assert_eq!(patient.state(), SessionState::Unresolved);
}

#[tokio::test]
async fn global_cache_is_shared_between_sessions() {
    let service = Arc::new(FakeService::new());
    let settings = Settings::new("http://global-cache-test/svc")
        .with_transport(Arc::clone(&service) as Arc<dyn Transport>);
    let first = Session::new(settings.clone()).unwrap();
    let second = Session::new(settings).unwrap();
    let cancel = CancellationToken::new();

    first.resolve_adapter(&cancel).await.unwrap();
    second.resolve_adapter(&cancel).await.unwrap();
    assert_eq!(service.metadata_requests(), 1);
    assert!(MetadataCache::global().contains("http://global-cache-test/svc"));

    first.close();
    assert!(first.is_closed());
    assert!(!second.is_closed());
    MetadataCache::global().clear("http://global-cache-test/svc");
}
