//! Request coordinator: batching, concurrency cap, adaptive pacing, retries and cancellation.
//!
//! Callers issue independent GETs with [`Coordinator::get`]. Requests wait in a pending queue
//! for a short debounce window so that near-simultaneous calls can be combined into one FHIR
//! `batch` exchange. A dispatch cycle then takes up to `max_requests_per_batch` requests off
//! the queue, as long as fewer than `max_active_requests` exchanges are in flight and the
//! pacing policy allows another send.
//!
//! Every request is in exactly one place at a time: the pending queue, an in-flight exchange,
//! or settled (its reply channel consumed). Throttled exchanges go back to the front of the
//! queue and the whole coordinator holds off until the server's `Retry-After` has elapsed.
//!
//! ```rust,no_run
//! use fhirbatch::{Coordinator, CoordinatorConfig, RequestOptions};
//! # use fhirbatch::transport::{HttpRequest, HttpResponse, Transport};
//! # use fhirbatch::error::TransportError;
//! # struct Http;
//! # #[async_trait::async_trait]
//! # impl Transport for Http {
//! #     async fn exchange(&self, _r: HttpRequest) -> Result<HttpResponse, TransportError> {
//! #         Ok(HttpResponse::new(200, "{}"))
//! #     }
//! # }
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let coordinator = Coordinator::builder(Http)
//!     .config(CoordinatorConfig::new("https://lforms-fhir.nlm.nih.gov/baseR4"))
//!     .build()?;
//! let (a, b) = futures::join!(
//!     coordinator.get("Patient/1", RequestOptions::default()),
//!     coordinator.get("Patient/2", RequestOptions::default()),
//! );
//! println!("{:?} {:?}", a?.data, b?.data);
//! # Ok(())
//! # }
//! ```

use crate::adaptive::DynamicConfig;
use crate::cache::{CacheOptions, CachedResponse, MemoryCache, ResponseCache};
use crate::capabilities::InitSlot;
use crate::clock::{Clock, MonotonicClock};
use crate::config::{BuildError, CoordinatorConfig, PacingConfig, Settings};
use crate::endpoint::{full_url, has_param, relative_url, rewrite_long_url, update_url_with_param};
use crate::error::{FhirError, TransportError, HTTP_ABORT, UNKNOWN_ERROR};
use crate::pacing::{retry_after, PacingPolicy};
use crate::reply::{batch_body, decode_body, demultiplex, settle, Reply, Response};
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::telemetry::{CoordinatorEvent, EventBus, DEFAULT_EVENT_CAPACITY};
use crate::transport::{HttpRequest, HttpResponse, Transport, FHIR_JSON, FORM_URLENCODED};
use futures::future::join_all;
use http::header::{AUTHORIZATION, CONTENT_TYPE};
use http::{HeaderMap, HeaderValue, Method};
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;

/// Status the server uses to signal throttling.
const TOO_MANY_REQUESTS: u16 = 429;

/// How often a throttled request may be sent again.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RetryBudget {
    /// At most this many attempts in total, the first one included.
    Attempts(usize),
    /// Keep retrying until nothing has succeeded for the give-up timeout.
    ///
    /// The window runs from the last success, or from construction before any. A coordinator
    /// that sat idle for longer than the timeout fails on the first throttle with one attempt.
    #[default]
    UntilDeadline,
}

impl RetryBudget {
    fn allows_another(&self, attempts_made: usize) -> bool {
        match self {
            RetryBudget::Attempts(limit) => attempts_made < *limit,
            RetryBudget::UntilDeadline => true,
        }
    }
}

/// Options recognised by every get-family call.
#[derive(Debug, Clone)]
pub struct RequestOptions {
    /// May be merged into a batch exchange with other requests.
    pub combinable: bool,
    pub retry: RetryBudget,
    /// Cancelling the token settles the request with [`FhirError::Aborted`].
    pub cancel: Option<CancellationToken>,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self { combinable: true, retry: RetryBudget::UntilDeadline, cancel: None }
    }
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Always send this request in an exchange of its own.
    pub fn not_combinable(mut self) -> Self {
        self.combinable = false;
        self
    }

    /// Limit the total number of attempts.
    pub fn with_attempts(mut self, attempts: usize) -> Self {
        self.retry = RetryBudget::Attempts(attempts);
        self
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

type ReplySender = oneshot::Sender<Result<Response, FhirError>>;

struct PendingRequest {
    id: u64,
    url: String,
    method: Method,
    body: Option<String>,
    content_type: &'static str,
    combinable: bool,
    retry: RetryBudget,
    attempts: usize,
    cancel: Option<CancellationToken>,
    reply: ReplySender,
}

impl PendingRequest {
    /// Cancelled by its token, or its caller stopped waiting.
    fn is_abandoned(&self) -> bool {
        self.reply.is_closed() || self.cancel.as_ref().is_some_and(CancellationToken::is_cancelled)
    }

    fn is_combinable(&self) -> bool {
        self.combinable && self.method == Method::GET
    }

    /// Resolves once the request is abandoned.
    async fn abandoned(&mut self) {
        let PendingRequest { cancel, reply, .. } = self;
        match cancel {
            Some(token) => {
                tokio::select! {
                    _ = token.cancelled() => {}
                    _ = reply.closed() => {}
                }
            }
            None => reply.closed().await,
        }
    }

    fn finish(self, result: Result<Response, FhirError>) {
        // The caller may have stopped waiting.
        let _ = self.reply.send(result);
    }
}

/// Settle every request with `Aborted`.
fn abort_all(members: Vec<PendingRequest>) {
    for member in members {
        member.finish(Err(FhirError::Aborted));
    }
}

/// Report `error` to the first request still waiting; the rest are aborted so one fault
/// produces one error.
fn fail_first(members: Vec<PendingRequest>, error: FhirError) {
    let mut error = Some(error);
    for member in members {
        let result = if member.is_abandoned() {
            FhirError::Aborted
        } else {
            error.take().unwrap_or(FhirError::Aborted)
        };
        member.finish(Err(result));
    }
}

async fn all_abandoned(members: &mut [PendingRequest]) {
    join_all(members.iter_mut().map(|member| member.abandoned())).await;
}

/// Add `api_key` (when configured) and `_format=json` unless present.
fn decorate_url(url: &str, api_key: &str) -> String {
    let mut url = url.to_string();
    if !api_key.is_empty() && !has_param(&url, "api_key") {
        url = update_url_with_param(&url, "api_key", api_key);
    }
    if !has_param(&url, "_format") {
        url = update_url_with_param(&url, "_format", "json");
    }
    url
}

fn cached_result(hit: CachedResponse) -> Result<Response, FhirError> {
    if hit.is_success() {
        Ok(Response { status: hit.status, data: hit.data })
    } else {
        Err(FhirError::server(hit.status, hit.data.as_str().unwrap_or(UNKNOWN_ERROR)))
    }
}

struct State {
    pending: VecDeque<PendingRequest>,
    active: HashMap<u64, CancellationToken>,
    pacing: PacingPolicy,
    next_id: u64,
    debounce: Option<AbortHandle>,
    pacing_timer: Option<AbortHandle>,
}

impl State {
    fn new(pacing: PacingPolicy) -> Self {
        Self {
            pending: VecDeque::new(),
            active: HashMap::new(),
            pacing,
            next_id: 0,
            debounce: None,
            pacing_timer: None,
        }
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Requests for the next exchange, in queue order.
    ///
    /// Abandoned requests are settled and skipped. A POST or non-combinable request ends the
    /// scan: it is sent alone if it comes first, otherwise it stays queued.
    fn take_next(&mut self, max: usize) -> Vec<PendingRequest> {
        let mut taken = Vec::new();
        while taken.len() < max.max(1) {
            let Some(request) = self.pending.pop_front() else { break };
            if request.is_abandoned() {
                request.finish(Err(FhirError::Aborted));
                continue;
            }
            if !request.is_combinable() {
                if taken.is_empty() {
                    taken.push(request);
                } else {
                    self.pending.push_front(request);
                }
                break;
            }
            taken.push(request);
        }
        taken
    }
}

struct Exchange {
    id: u64,
    abort: CancellationToken,
    batch: bool,
    members: Vec<PendingRequest>,
}

enum Outcome {
    /// Aborted by `clear_pending_requests`.
    Cleared,
    /// Every member was cancelled by its caller.
    Abandoned,
    Done(Result<HttpResponse, TransportError>),
}

struct Inner {
    config: CoordinatorConfig,
    settings: DynamicConfig<Settings>,
    state: Mutex<State>,
    transport: Arc<dyn Transport>,
    cache: Arc<dyn ResponseCache>,
    sleeper: Arc<dyn Sleeper>,
    clock: Arc<dyn Clock>,
    events: EventBus,
    init: Mutex<InitSlot>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn enqueue(self: &Arc<Self>, mut request: PendingRequest) -> u64 {
        let max_per_batch = self.settings.get().max_requests_per_batch;
        let mut state = self.lock();
        let id = state.next_id();
        request.id = id;
        state.pending.push_back(request);
        if state.pending.len() >= max_per_batch {
            drop(state);
            self.dispatch();
        } else {
            let timer = self.schedule(self.config.batch_timeout);
            if let Some(previous) = state.debounce.replace(timer) {
                previous.abort();
            }
        }
        id
    }

    fn withdraw(&self, id: u64) {
        self.lock().pending.retain(|request| request.id != id);
    }

    /// Run a dispatch cycle after `delay`.
    fn schedule(self: &Arc<Self>, delay: Duration) -> AbortHandle {
        let weak: Weak<Inner> = Arc::downgrade(self);
        let sleep = self.sleeper.sleep(delay);
        tokio::spawn(async move {
            sleep.await;
            if let Some(inner) = weak.upgrade() {
                inner.dispatch();
            }
        })
        .abort_handle()
    }

    /// Send exchanges until the queue is empty, the concurrency cap is reached, or pacing
    /// requires a wait (in which case a timer re-runs the cycle).
    fn dispatch(self: &Arc<Self>) {
        loop {
            let settings = self.settings.get();
            let exchange = {
                let mut state = self.lock();
                if state.pending.is_empty() || state.active.len() >= settings.max_active_requests {
                    return;
                }
                let now = self.clock.now_millis();
                let wait = state.pacing.delay_before_next(now);
                if !wait.is_zero() {
                    let timer = self.schedule(wait);
                    if let Some(previous) = state.pacing_timer.replace(timer) {
                        previous.abort();
                    }
                    return;
                }
                let members = state.take_next(settings.max_requests_per_batch);
                if members.is_empty() {
                    return;
                }
                state.pacing.record_request(now);
                let id = state.next_id();
                let abort = CancellationToken::new();
                state.active.insert(id, abort.clone());
                let batch = members.len() > 1
                    || members.iter().any(|m| m.url.len() > self.config.max_url_length);
                Exchange { id, abort, batch, members }
            };
            let request = self.build_request(&exchange, &settings);
            tokio::spawn(Arc::clone(self).run_exchange(exchange, request));
        }
    }

    fn build_request(&self, exchange: &Exchange, settings: &Settings) -> HttpRequest {
        let mut request = match exchange.members.as_slice() {
            [member] if !exchange.batch => {
                let mut request = HttpRequest {
                    method: member.method.clone(),
                    url: member.url.clone(),
                    headers: HeaderMap::new(),
                    body: member.body.clone(),
                };
                if member.method != Method::GET {
                    request.headers.insert(CONTENT_TYPE, HeaderValue::from_static(member.content_type));
                }
                request
            }
            members => {
                let urls: Vec<String> = members
                    .iter()
                    .map(|m| relative_url(&settings.service_base_url, &m.url))
                    .collect();
                let mut request =
                    HttpRequest::post(settings.service_base_url.clone(), batch_body(&urls));
                request.headers.insert(CONTENT_TYPE, HeaderValue::from_static(FHIR_JSON));
                request
            }
        };
        request.url = decorate_url(&request.url, &settings.api_key);
        if let Some(authorization) = &settings.authorization {
            request.headers.insert(AUTHORIZATION, authorization.clone());
        }
        request
    }

    async fn run_exchange(self: Arc<Self>, mut exchange: Exchange, request: HttpRequest) {
        let kind = if exchange.batch { "batch" } else { "single" };
        tracing::debug!(
            exchange = exchange.id,
            kind,
            size = exchange.members.len(),
            method = %request.method,
            url = %request.url,
            "sending exchange"
        );
        let started = self.clock.now_millis();
        let give_up = self.config.give_up_timeout;
        let transport = Arc::clone(&self.transport);
        let abort = exchange.abort.clone();
        let outcome = tokio::select! {
            _ = abort.cancelled() => Outcome::Cleared,
            _ = all_abandoned(&mut exchange.members) => Outcome::Abandoned,
            result = tokio::time::timeout(give_up, transport.exchange(request)) => {
                Outcome::Done(result.unwrap_or(Err(TransportError::Timeout(give_up))))
            }
        };
        let elapsed = self.clock.elapsed_since(started);
        let tracked = self.lock().active.remove(&exchange.id).is_some();
        match outcome {
            Outcome::Done(result) if tracked => {
                tracing::debug!(exchange = exchange.id, kind, ?elapsed, "exchange returned");
                self.complete(exchange, result, elapsed);
            }
            Outcome::Abandoned => {
                tracing::debug!(exchange = exchange.id, kind, "exchange abandoned by its callers");
                abort_all(exchange.members);
            }
            _ => abort_all(exchange.members),
        }
        self.dispatch();
    }

    fn complete(&self, exchange: Exchange, result: Result<HttpResponse, TransportError>, elapsed: Duration) {
        let response = match result {
            Ok(response) => response,
            Err(TransportError::Timeout(after)) => {
                let error = FhirError::Transport(format!("no response within {:?}", after));
                return fail_first(exchange.members, error);
            }
            Err(error) => {
                let preflight = self.lock().pacing.is_preflight_abort(elapsed);
                if !preflight {
                    let error = match error {
                        TransportError::Aborted => FhirError::Aborted,
                        other => FhirError::Transport(other.to_string()),
                    };
                    return fail_first(exchange.members, error);
                }
                let wait = self.lock().pacing.default_retry_after();
                return self.retry_or_fail(exchange, wait, |attempts| match error {
                    TransportError::Aborted => FhirError::RateLimited { status: HTTP_ABORT, attempts },
                    other => FhirError::Transport(other.to_string()),
                });
            }
        };

        let raised = {
            let mut state = self.lock();
            let raised = state.pacing.observe(&response.headers);
            raised.then(|| state.pacing.min_delay())
        };
        if let Some(min_delay) = raised {
            self.events.emit(CoordinatorEvent::PacingChanged { min_delay });
        }

        let status = response.status;
        if response.is_success() {
            let now = self.clock.now_millis();
            self.lock().pacing.record_success(now);
            self.deliver(exchange, response);
        } else if status == TOO_MANY_REQUESTS {
            let fallback = self.lock().pacing.default_retry_after();
            let wait = retry_after(&response.headers, self.clock.wall_time(), fallback);
            self.retry_or_fail(exchange, wait, |attempts| FhirError::RateLimited { status, attempts });
        } else {
            let body = decode_body(&response.body).unwrap_or_else(|_| json!({}));
            let error = settle(Reply::Single { status, body })
                .err()
                .unwrap_or_else(|| FhirError::server(status, UNKNOWN_ERROR));
            fail_first(exchange.members, error);
        }
    }

    fn deliver(&self, exchange: Exchange, response: HttpResponse) {
        let status = response.status;
        if !exchange.batch {
            let result =
                decode_body(&response.body).and_then(|body| settle(Reply::Single { status, body }));
            if let Some(member) = exchange.members.into_iter().next() {
                member.finish(result);
            }
            return;
        }
        match demultiplex(&response.body, exchange.members.len()) {
            Ok(replies) => {
                for (member, reply) in exchange.members.into_iter().zip(replies) {
                    let result = if member.is_abandoned() {
                        Err(FhirError::Aborted)
                    } else {
                        reply.and_then(settle)
                    };
                    member.finish(result);
                }
            }
            Err(error) => fail_first(exchange.members, error),
        }
    }

    /// Requeue a throttled exchange, or settle it once the budget or deadline is spent.
    ///
    /// A batch retries as a unit until the give-up deadline; its members' own budgets apply
    /// only to exchanges they make alone.
    fn retry_or_fail<F>(&self, exchange: Exchange, wait: Duration, exhausted: F)
    where
        F: FnOnce(usize) -> FhirError,
    {
        let Exchange { batch, mut members, .. } = exchange;
        for member in &mut members {
            member.attempts += 1;
        }
        let attempts = members.iter().map(|m| m.attempts).max().unwrap_or(1);
        let url = members.first().map(|m| m.url.clone()).unwrap_or_default();
        let within_budget = batch || members.iter().all(|m| m.retry.allows_another(m.attempts));
        let now = self.clock.now_millis();

        let mut state = self.lock();
        if !within_budget || !state.pacing.can_retry(now) {
            drop(state);
            let error = exhausted(attempts);
            tracing::warn!(%url, attempts, %error, "giving up on throttled request");
            self.events.emit(CoordinatorEvent::GaveUp { url, status: error.status() });
            return fail_first(members, error);
        }
        let throttle = state.pacing.record_failure(now, wait);
        for member in members.into_iter().rev() {
            state.pending.push_front(member);
        }
        drop(state);

        tracing::info!(%url, attempts, retry_after = ?wait, "request throttled, requeued");
        if throttle.ratcheted {
            let previous = self.settings.update(|s| Settings { max_active_requests: 1, ..s.clone() });
            tracing::warn!(
                min_delay = ?throttle.min_delay,
                from = previous.max_active_requests,
                "server throttling, concurrency reduced to 1"
            );
            self.events.emit(CoordinatorEvent::PacingChanged { min_delay: throttle.min_delay });
            self.events.emit(CoordinatorEvent::ConcurrencyReduced { max_active_requests: 1 });
        }
        self.events.emit(CoordinatorEvent::Retrying { url, attempt: attempts, retry_after: wait });
    }

    fn clear_pending(&self) {
        let (pending, active) = {
            let mut state = self.lock();
            if let Some(timer) = state.debounce.take() {
                timer.abort();
            }
            if let Some(timer) = state.pacing_timer.take() {
                timer.abort();
            }
            let pending: Vec<PendingRequest> = state.pending.drain(..).collect();
            let active: Vec<CancellationToken> = state.active.drain().map(|(_, token)| token).collect();
            (pending, active)
        };
        let (pending_count, active_count) = (pending.len(), active.len());
        tracing::info!(pending = pending_count, active = active_count, "clearing requests");
        abort_all(pending);
        for token in active {
            token.cancel();
        }
        self.events.emit(CoordinatorEvent::Cleared { pending: pending_count, active: active_count });
    }
}

/// Handle to a request coordinator. Clones share the same queue, pacing state and cache.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let settings = self.inner.settings.get();
        f.debug_struct("Coordinator")
            .field("service_base_url", &settings.service_base_url)
            .field("max_requests_per_batch", &settings.max_requests_per_batch)
            .field("max_active_requests", &settings.max_active_requests)
            .field("transport", &"<transport>")
            .field("cache", &self.inner.cache)
            .finish()
    }
}

impl Coordinator {
    /// Start building a coordinator around `transport`.
    pub fn builder<T>(transport: T) -> CoordinatorBuilder
    where
        T: Transport,
    {
        CoordinatorBuilder::new(Arc::new(transport))
    }

    /// Coordinator with the given configuration and default cache, timers and clock.
    pub fn new<T>(config: CoordinatorConfig, transport: T) -> Result<Self, BuildError>
    where
        T: Transport,
    {
        Self::builder(transport).config(config).build()
    }

    /// GET `url` (relative to the service base, or absolute).
    ///
    /// URLs longer than `max_url_length` are sent as `POST <path>/_search` with a form body,
    /// except `$lastn` operations, which go out wrapped in a batch.
    pub async fn get(&self, url: &str, options: RequestOptions) -> Result<Response, FhirError> {
        let base = self.service_base_url();
        let full = full_url(&base, url);
        match rewrite_long_url(&full, self.inner.config.max_url_length) {
            Some(search) => {
                self.submit(search.url, Method::POST, Some(search.body), FORM_URLENCODED, options).await
            }
            None => self.submit(full, Method::GET, None, FHIR_JSON, options).await,
        }
    }

    /// POST a FHIR JSON `body` to `url`. Never combined with other requests.
    pub async fn post(
        &self,
        url: &str,
        body: impl Into<String>,
        options: RequestOptions,
    ) -> Result<Response, FhirError> {
        let full = full_url(&self.service_base_url(), url);
        self.submit(full, Method::POST, Some(body.into()), FHIR_JSON, options).await
    }

    async fn submit(
        &self,
        url: String,
        method: Method,
        body: Option<String>,
        content_type: &'static str,
        options: RequestOptions,
    ) -> Result<Response, FhirError> {
        let RequestOptions { combinable, retry, cancel } = options;
        if cancel.as_ref().is_some_and(CancellationToken::is_cancelled) {
            return Err(FhirError::Aborted);
        }
        let (reply, rx) = oneshot::channel();
        let id = self.inner.enqueue(PendingRequest {
            id: 0,
            url,
            method,
            body,
            content_type,
            combinable,
            retry,
            attempts: 0,
            cancel: cancel.clone(),
            reply,
        });
        let received = match cancel {
            Some(token) => tokio::select! {
                biased;
                _ = token.cancelled() => {
                    self.inner.withdraw(id);
                    return Err(FhirError::Aborted);
                }
                received = rx => received,
            },
            None => rx.await,
        };
        received.unwrap_or(Err(FhirError::Aborted))
    }

    /// [`get`](Self::get) behind the response cache.
    ///
    /// Fresh success entries are returned without an exchange. Error entries are returned
    /// (as errors) and stored only when `cache.cache_errors` is set, and only for server
    /// errors.
    pub async fn get_with_cache(
        &self,
        url: &str,
        options: RequestOptions,
        cache: &CacheOptions,
    ) -> Result<Response, FhirError> {
        let full = full_url(&self.service_base_url(), url);
        if let Some(hit) = self.inner.cache.get(&full, cache).await {
            tracing::trace!(url = %full, status = hit.status, "cache hit");
            return cached_result(hit);
        }
        let result = self.get(&full, options).await;
        match &result {
            Ok(response) => {
                let entry = CachedResponse { status: response.status, data: response.data.clone() };
                self.inner.cache.put(&full, entry, cache).await;
            }
            Err(FhirError::Server { status, diagnostics }) if cache.cache_errors => {
                let entry = CachedResponse { status: *status, data: Value::String(diagnostics.clone()) };
                self.inner.cache.put(&full, entry, cache).await;
            }
            Err(_) => {}
        }
        result
    }

    /// Abort every queued and in-flight request. The coordinator stays usable.
    pub fn clear_pending_requests(&self) {
        self.inner.clear_pending();
    }

    pub fn service_base_url(&self) -> String {
        self.inner.settings.get().service_base_url.clone()
    }

    /// Snapshot of the runtime settings.
    pub fn settings(&self) -> Arc<Settings> {
        self.inner.settings.get()
    }

    pub fn max_requests_per_batch(&self) -> usize {
        self.inner.settings.get().max_requests_per_batch
    }

    /// Largest number of requests combined into one exchange (1 turns combining off).
    pub fn set_max_requests_per_batch(&self, max: usize) -> Result<(), BuildError> {
        if max == 0 {
            return Err(BuildError::InvalidMaxPerBatch(max));
        }
        let previous = self.inner.settings.update(|s| Settings { max_requests_per_batch: max, ..s.clone() });
        tracing::debug!(from = previous.max_requests_per_batch, to = max, "batch size changed");
        Ok(())
    }

    pub fn max_active_requests(&self) -> usize {
        self.inner.settings.get().max_active_requests
    }

    /// Largest number of exchanges in flight at once.
    pub fn set_max_active_requests(&self, max: usize) -> Result<(), BuildError> {
        if max == 0 {
            return Err(BuildError::InvalidMaxActive(max));
        }
        let previous = self.inner.settings.update(|s| Settings { max_active_requests: max, ..s.clone() });
        tracing::debug!(from = previous.max_active_requests, to = max, "concurrency cap changed");
        if tokio::runtime::Handle::try_current().is_ok() {
            self.inner.dispatch();
        }
        Ok(())
    }

    pub fn api_key(&self) -> String {
        self.inner.settings.get().api_key.clone()
    }

    /// Key appended as `api_key=` to every exchange; empty to stop sending one.
    pub fn set_api_key(&self, key: &str) {
        let key = key.trim().to_string();
        self.inner.settings.update(|s| Settings { api_key: key.clone(), ..s.clone() });
    }

    pub fn set_authorization_header(&self, value: Option<HeaderValue>) {
        self.inner.settings.update(|s| Settings { authorization: value.clone(), ..s.clone() });
    }

    /// Inter-request delay currently in force.
    pub fn pacing_delay(&self) -> Duration {
        self.inner.lock().pacing.min_delay()
    }

    pub fn pending_requests(&self) -> usize {
        self.inner.lock().pending.len()
    }

    pub fn active_requests(&self) -> usize {
        self.inner.lock().active.len()
    }

    /// Page size large enough to keep every batch slot busy.
    pub fn default_page_size(&self) -> usize {
        let settings = self.inner.settings.get();
        settings.max_requests_per_batch * settings.max_active_requests * 2
    }

    /// Receive [`CoordinatorEvent`]s, e.g. when throttling drops the concurrency cap.
    pub fn subscribe(&self) -> broadcast::Receiver<CoordinatorEvent> {
        self.inner.events.subscribe()
    }

    /// Whether a fresh success response for `url` is cached.
    pub async fn is_cached(&self, url: &str, partition: Option<&str>) -> bool {
        let full = full_url(&self.service_base_url(), url);
        self.inner.cache.has_fresh_entry(&full, partition).await
    }

    pub async fn clear_cache_partition(&self, partition: &str) {
        self.inner.cache.clear_partition(partition).await;
    }

    pub async fn clear_cache(&self) {
        self.inner.cache.clear_all().await;
    }

    /// Abort everything, switch to `base_url` (if given) and forget learned pacing.
    pub(crate) fn reset_context(&self, base_url: Option<String>) {
        self.inner.clear_pending();
        if let Some(base) = base_url {
            self.inner.settings.update(|s| Settings { service_base_url: base.clone(), ..s.clone() });
        }
        let now = self.inner.clock.now_millis();
        self.inner.lock().pacing.reset(now);
    }

    pub(crate) fn init_slot(&self) -> MutexGuard<'_, InitSlot> {
        self.inner.init.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Builder for [`Coordinator`].
pub struct CoordinatorBuilder {
    config: CoordinatorConfig,
    transport: Arc<dyn Transport>,
    cache: Arc<dyn ResponseCache>,
    sleeper: Arc<dyn Sleeper>,
    clock: Option<Arc<dyn Clock>>,
    event_capacity: usize,
}

impl CoordinatorBuilder {
    fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            config: CoordinatorConfig::default(),
            transport,
            cache: Arc::new(MemoryCache::new()),
            sleeper: Arc::new(TokioSleeper),
            clock: None,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: CoordinatorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn service_base_url(mut self, url: impl Into<String>) -> Self {
        self.config.service_base_url = url.into();
        self
    }

    pub fn max_requests_per_batch(mut self, max: usize) -> Self {
        self.config.max_requests_per_batch = max;
        self
    }

    pub fn max_active_requests(mut self, max: usize) -> Self {
        self.config.max_active_requests = max;
        self
    }

    pub fn batch_timeout(mut self, timeout: Duration) -> Self {
        self.config.batch_timeout = timeout;
        self
    }

    pub fn give_up_timeout(mut self, timeout: Duration) -> Self {
        self.config.give_up_timeout = timeout;
        self
    }

    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.config.api_key = key.into();
        self
    }

    pub fn pacing(mut self, pacing: PacingConfig) -> Self {
        self.config.pacing = pacing;
        self
    }

    pub fn with_cache<C>(mut self, cache: C) -> Self
    where
        C: ResponseCache + 'static,
    {
        self.cache = Arc::new(cache);
        self
    }

    /// Share one cache between several coordinators.
    pub fn with_shared_cache(mut self, cache: Arc<dyn ResponseCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_sleeper<S>(mut self, sleeper: S) -> Self
    where
        S: Sleeper + 'static,
    {
        self.sleeper = Arc::new(sleeper);
        self
    }

    pub fn with_clock<C>(mut self, clock: C) -> Self
    where
        C: Clock + 'static,
    {
        self.clock = Some(Arc::new(clock));
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Validate the configuration and build the coordinator.
    pub fn build(self) -> Result<Coordinator, BuildError> {
        let config = self.config.validate()?;
        let clock: Arc<dyn Clock> = match self.clock {
            Some(clock) => clock,
            None => Arc::new(MonotonicClock::default()),
        };
        let pacing = PacingPolicy::new(config.pacing.clone(), config.give_up_timeout, clock.now_millis());
        tracing::debug!(
            base = %config.service_base_url,
            max_per_batch = config.max_requests_per_batch,
            max_active = config.max_active_requests,
            "coordinator built"
        );
        Ok(Coordinator {
            inner: Arc::new(Inner {
                settings: DynamicConfig::new(config.settings()),
                config,
                state: Mutex::new(State::new(pacing)),
                transport: self.transport,
                cache: self.cache,
                sleeper: self.sleeper,
                clock,
                events: EventBus::new(self.event_capacity),
                init: Mutex::new(InitSlot::default()),
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sleeper::TrackingSleeper;
    use async_trait::async_trait;

    type Script = Arc<Mutex<VecDeque<Result<HttpResponse, TransportError>>>>;

    /// Replies from a script, then `{}` with status 200.
    #[derive(Clone, Default)]
    struct Scripted {
        sent: Arc<Mutex<Vec<HttpRequest>>>,
        script: Script,
    }

    impl Scripted {
        fn replying(replies: Vec<Result<HttpResponse, TransportError>>) -> Self {
            Self { sent: Arc::default(), script: Arc::new(Mutex::new(replies.into())) }
        }

        fn sent(&self) -> Vec<HttpRequest> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Transport for Scripted {
        async fn exchange(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
            self.sent.lock().unwrap().push(request);
            let next = self.script.lock().unwrap().pop_front();
            next.unwrap_or_else(|| Ok(HttpResponse::json(200, &json!({}))))
        }
    }

    /// Never answers.
    struct Silent;

    #[async_trait]
    impl Transport for Silent {
        async fn exchange(&self, _request: HttpRequest) -> Result<HttpResponse, TransportError> {
            futures::future::pending().await
        }
    }

    fn coordinator(transport: impl Transport) -> Coordinator {
        Coordinator::builder(transport).service_base_url("https://fhir.test/r4").build().unwrap()
    }

    #[test]
    fn decorate_url_adds_format_and_key_once() {
        assert_eq!(decorate_url("https://x/Patient", ""), "https://x/Patient?_format=json");
        assert_eq!(
            decorate_url("https://x/Patient?name=a", "k"),
            "https://x/Patient?name=a&api_key=k&_format=json"
        );
        assert_eq!(decorate_url("https://x/P?_format=xml", ""), "https://x/P?_format=xml");
    }

    #[test]
    fn retry_budget_counts_total_attempts() {
        assert!(RetryBudget::Attempts(2).allows_another(1));
        assert!(!RetryBudget::Attempts(2).allows_another(2));
        assert!(RetryBudget::UntilDeadline.allows_another(1_000));
    }

    #[test]
    fn take_next_stops_at_non_combinable_requests() {
        let mut state = State::new(PacingPolicy::new(PacingConfig::default(), Duration::from_secs(90), 0));
        let mut receivers = Vec::new();
        for (i, combinable) in [true, true, false, true].into_iter().enumerate() {
            let (reply, rx) = oneshot::channel();
            receivers.push(rx);
            state.pending.push_back(PendingRequest {
                id: i as u64,
                url: format!("https://x/Patient/{}", i),
                method: Method::GET,
                body: None,
                content_type: FHIR_JSON,
                combinable,
                retry: RetryBudget::UntilDeadline,
                attempts: 0,
                cancel: None,
                reply,
            });
        }
        let first: Vec<u64> = state.take_next(10).iter().map(|r| r.id).collect();
        assert_eq!(first, vec![0, 1]);
        let second: Vec<u64> = state.take_next(10).iter().map(|r| r.id).collect();
        assert_eq!(second, vec![2]);
        drop(receivers.remove(3));
        assert!(state.take_next(10).is_empty(), "abandoned request is skipped");
    }

    #[tokio::test(start_paused = true)]
    async fn lone_request_is_sent_plain_with_format_param() {
        let transport = Scripted::replying(vec![Ok(HttpResponse::json(200, &json!({"id": "1"})))]);
        let c = coordinator(transport.clone());
        let response = c.get("Patient/1", RequestOptions::default()).await.unwrap();
        assert_eq!(response.data["id"], "1");
        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].method, Method::GET);
        assert_eq!(sent[0].url, "https://fhir.test/r4/Patient/1?_format=json");
    }

    #[tokio::test(start_paused = true)]
    async fn long_urls_are_posted_as_searches() {
        let transport = Scripted::default();
        let c = coordinator(transport.clone());
        let url = format!("Observation?code={}", "x".repeat(2000));
        c.get(&url, RequestOptions::default()).await.unwrap();
        let sent = transport.sent();
        assert_eq!(sent[0].method, Method::POST);
        assert!(sent[0].url.starts_with("https://fhir.test/r4/Observation/_search?"));
        assert_eq!(sent[0].headers.get(CONTENT_TYPE).unwrap(), FORM_URLENCODED);
        assert!(sent[0].body.as_deref().unwrap().starts_with("code=xxx"));
    }

    #[tokio::test(start_paused = true)]
    async fn long_lastn_urls_are_wrapped_in_a_batch() {
        let body = json!({"entry": [{"resource": {"total": 0}, "response": {"status": "200 OK"}}]});
        let transport = Scripted::replying(vec![Ok(HttpResponse::json(200, &body))]);
        let c = coordinator(transport.clone());
        let url = format!("Observation/$lastn?code={}", "x".repeat(2000));
        let response = c.get(&url, RequestOptions::default()).await.unwrap();
        assert_eq!(response.data["total"], 0);
        let sent = transport.sent();
        assert_eq!(sent[0].url, "https://fhir.test/r4?_format=json");
        assert!(sent[0].body.as_deref().unwrap().contains("Observation/$lastn?code="));
    }

    #[tokio::test(start_paused = true)]
    async fn server_errors_carry_diagnostics() {
        let outcome = json!({"resourceType": "OperationOutcome", "issue": [{"diagnostics": "bad param"}]});
        let transport = Scripted::replying(vec![Ok(HttpResponse::json(400, &outcome))]);
        let c = coordinator(transport);
        let err = c.get("Patient?foo=1", RequestOptions::default()).await.unwrap_err();
        assert_eq!(err, FhirError::server(400, "bad param"));
    }

    #[tokio::test(start_paused = true)]
    async fn attempts_budget_turns_throttling_terminal() {
        let throttled = || Ok(HttpResponse::new(429, ""));
        let transport = Scripted::replying(vec![throttled(), throttled(), throttled()]);
        let c = coordinator(transport.clone());
        let mut events = c.subscribe();
        let err = c.get("Patient", RequestOptions::default().with_attempts(2)).await.unwrap_err();
        assert_eq!(err, FhirError::RateLimited { status: 429, attempts: 2 });
        assert_eq!(transport.sent().len(), 2);
        assert_eq!(c.max_active_requests(), 1);
        assert_eq!(c.pacing_delay(), Duration::from_millis(100));
        let mut saw_reduction = false;
        while let Ok(event) = events.try_recv() {
            saw_reduction |= matches!(event, CoordinatorEvent::ConcurrencyReduced { .. });
        }
        assert!(saw_reduction);
    }

    #[tokio::test(start_paused = true)]
    async fn quick_aborts_are_retried_as_throttling() {
        let transport = Scripted::replying(vec![
            Err(TransportError::Aborted),
            Ok(HttpResponse::json(200, &json!({"ok": true}))),
        ]);
        let c = coordinator(transport.clone());
        let response = c.get("Patient", RequestOptions::default()).await.unwrap();
        assert_eq!(response.data["ok"], true);
        assert_eq!(transport.sent().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn timeouts_are_not_retried() {
        let c = Coordinator::builder(Silent)
            .service_base_url("https://fhir.test/r4")
            .give_up_timeout(Duration::from_secs(30))
            .build()
            .unwrap();
        let err = c.get("Patient", RequestOptions::default()).await.unwrap_err();
        assert!(matches!(err, FhirError::Transport(_)));
        assert_eq!(c.active_requests(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelling_an_active_request_frees_its_slot() {
        let c = coordinator(Silent);
        let token = CancellationToken::new();
        let pending = tokio::spawn({
            let c = c.clone();
            let token = token.clone();
            async move { c.get("Patient", RequestOptions::default().with_cancel(token)).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(c.active_requests(), 1);
        token.cancel();
        assert_eq!(pending.await.unwrap(), Err(FhirError::Aborted));
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(c.active_requests(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn pre_cancelled_requests_never_reach_the_transport() {
        let transport = Scripted::default();
        let c = coordinator(transport.clone());
        let token = CancellationToken::new();
        token.cancel();
        let err = c.get("Patient", RequestOptions::default().with_cancel(token)).await.unwrap_err();
        assert!(err.is_aborted());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(transport.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn authorization_and_api_key_are_sent() {
        let transport = Scripted::default();
        let c = coordinator(transport.clone());
        c.set_api_key(" secret ");
        c.set_authorization_header(Some(HeaderValue::from_static("Bearer t")));
        c.get("Patient", RequestOptions::default()).await.unwrap();
        let sent = transport.sent();
        assert_eq!(sent[0].url, "https://fhir.test/r4/Patient?api_key=secret&_format=json");
        assert_eq!(sent[0].headers.get(AUTHORIZATION).unwrap(), "Bearer t");
        assert_eq!(c.api_key(), "secret");
    }

    #[tokio::test(start_paused = true)]
    async fn debounce_uses_the_configured_window() {
        let sleeper = TrackingSleeper::new();
        let c = Coordinator::builder(Scripted::default())
            .service_base_url("https://fhir.test/r4")
            .batch_timeout(Duration::from_millis(35))
            .with_sleeper(sleeper.clone())
            .build()
            .unwrap();
        c.get("Patient", RequestOptions::default()).await.unwrap();
        assert_eq!(sleeper.calls(), vec![Duration::from_millis(35)]);
    }

    #[test]
    fn setters_validate_limits() {
        let c = coordinator(Scripted::default());
        assert_eq!(c.set_max_requests_per_batch(0), Err(BuildError::InvalidMaxPerBatch(0)));
        assert_eq!(c.set_max_active_requests(0), Err(BuildError::InvalidMaxActive(0)));
        c.set_max_requests_per_batch(1).unwrap();
        assert_eq!(c.max_requests_per_batch(), 1);
        assert_eq!(c.default_page_size(), 12);
    }
}
