use fhirbatch::{
    Coordinator, CoordinatorBuilder, HttpRequest, HttpResponse, ServiceTransport, Transport,
    TransportError,
};
use http::Method;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;
use tokio::time::Instant;

pub const BASE: &str = "https://fhir.test/r4";

static TRACING: Once = Once::new();

/// Route coordinator logs to the test writer; `RUST_LOG=fhirbatch=debug` shows dispatch cycles.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Answers one request; the second argument is the 0-based exchange number.
pub type Handler = Arc<dyn Fn(&HttpRequest, usize) -> HttpResponse + Send + Sync>;

/// What the mock server has seen.
#[derive(Debug, Default)]
pub struct Stats {
    exchanges: AtomicUsize,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    log: Mutex<Vec<(Instant, HttpRequest)>>,
}

/// Decrements the in-flight count even when the exchange future is dropped mid-flight.
struct InFlight(Arc<Stats>);

impl InFlight {
    fn enter(stats: &Arc<Stats>) -> Self {
        let now = stats.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        stats.peak.fetch_max(now, Ordering::SeqCst);
        InFlight(Arc::clone(stats))
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// In-process FHIR server exposed to the coordinator as a `tower::Service`.
#[derive(Clone)]
pub struct MockServer {
    handler: Handler,
    latency: Duration,
    stats: Arc<Stats>,
}

impl MockServer {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&HttpRequest, usize) -> HttpResponse + Send + Sync + 'static,
    {
        Self { handler: Arc::new(handler), latency: Duration::from_millis(10), stats: Arc::default() }
    }

    /// Answers every GET with a resource whose `id` is the last path segment, and every batch
    /// with one such resource per entry.
    pub fn echo() -> Self {
        Self::new(|request, _| echo_response(request))
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn transport(&self) -> impl Transport {
        let server = self.clone();
        ServiceTransport::new(tower::service_fn(move |request: HttpRequest| {
            let server = server.clone();
            async move {
                let n = server.stats.exchanges.fetch_add(1, Ordering::SeqCst);
                server.stats.log.lock().unwrap().push((Instant::now(), request.clone()));
                let _guard = InFlight::enter(&server.stats);
                tokio::time::sleep(server.latency).await;
                Ok::<_, TransportError>((server.handler)(&request, n))
            }
        }))
    }

    pub fn coordinator(&self) -> CoordinatorBuilder {
        init_tracing();
        Coordinator::builder(self.transport()).service_base_url(BASE)
    }

    pub fn exchanges(&self) -> usize {
        self.stats.exchanges.load(Ordering::SeqCst)
    }

    pub fn peak_in_flight(&self) -> usize {
        self.stats.peak.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.stats.log.lock().unwrap().iter().map(|(_, r)| r.clone()).collect()
    }

    /// Instants at which exchanges arrived, in order.
    pub fn arrivals(&self) -> Vec<Instant> {
        self.stats.log.lock().unwrap().iter().map(|(at, _)| *at).collect()
    }
}

/// Last path segment of `url`, query stripped.
pub fn resource_id(url: &str) -> String {
    let path = url.split('?').next().unwrap_or_default();
    path.rsplit('/').next().unwrap_or_default().to_string()
}

/// Relative URLs of the entries of a batch request body.
pub fn batch_entry_urls(request: &HttpRequest) -> Vec<String> {
    let body: Value = serde_json::from_str(request.body.as_deref().unwrap_or("{}")).unwrap();
    body["entry"]
        .as_array()
        .map(|entries| {
            entries.iter().filter_map(|e| e["request"]["url"].as_str()).map(str::to_string).collect()
        })
        .unwrap_or_default()
}

pub fn is_batch(request: &HttpRequest) -> bool {
    request.method == Method::POST && request.body.as_deref().is_some_and(|b| b.contains("\"batch\""))
}

/// Batch response with a 200 entry per resource.
pub fn batch_response(resources: Vec<Value>) -> HttpResponse {
    let entry: Vec<Value> = resources
        .into_iter()
        .map(|resource| json!({"resource": resource, "response": {"status": "200 OK"}}))
        .collect();
    HttpResponse::json(200, &json!({"resourceType": "Bundle", "type": "batch-response", "entry": entry}))
}

pub fn echo_response(request: &HttpRequest) -> HttpResponse {
    if is_batch(request) {
        let resources = batch_entry_urls(request)
            .iter()
            .map(|url| json!({"resourceType": "Patient", "id": resource_id(url)}))
            .collect();
        batch_response(resources)
    } else {
        HttpResponse::json(200, &json!({"resourceType": "Patient", "id": resource_id(&request.url)}))
    }
}

/// Value of query parameter `name` in `url`.
pub fn query_param(url: &str, name: &str) -> Option<String> {
    let query = url.split_once('?')?.1;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
}

/// `Patient/<i>` for every `i` in `ids`; bind these before issuing borrowed `get`s.
pub fn patient_urls(ids: std::ops::Range<usize>) -> Vec<String> {
    ids.map(|i| format!("Patient/{i}")).collect()
}
