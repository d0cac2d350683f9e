//! Transport adapter: performs one HTTP exchange.
//!
//! The coordinator never touches sockets. It hands a fully prepared [`HttpRequest`] to a
//! [`Transport`] and reacts to the [`HttpResponse`] or [`TransportError`]. Aborting an
//! exchange is done the Rust way: the coordinator drops the future returned by
//! [`Transport::exchange`], so implementations must release their connection on drop.
//!
//! Any `tower::Service<HttpRequest>` can serve as a transport through [`ServiceTransport`].

use crate::error::TransportError;
use async_trait::async_trait;
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use tower::{Service, ServiceExt};

/// Content type of FHIR JSON payloads.
pub const FHIR_JSON: &str = "application/fhir+json";
/// Content type of `_search` bodies.
pub const FORM_URLENCODED: &str = "application/x-www-form-urlencoded";

/// Request handed to the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Option<String>,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self { method: Method::GET, url: url.into(), headers: HeaderMap::new(), body: None }
    }

    pub fn post(url: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            method: Method::POST,
            url: url.into(),
            headers: HeaderMap::new(),
            body: Some(body.into()),
        }
    }
}

/// Response returned by the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: String,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self { status, headers: HeaderMap::new(), body: body.into() }
    }

    /// Response with a JSON body.
    pub fn json(status: u16, body: &serde_json::Value) -> Self {
        Self::new(status, body.to_string())
    }

    /// Add a header; invalid names or values are ignored.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(name), Ok(value)) =
            (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value))
        {
            self.headers.insert(name, value);
        }
        self
    }

    pub fn is_success(&self) -> bool {
        is_success(self.status)
    }
}

/// Whether `status` falls in the 2xx range.
pub fn is_success(status: u16) -> bool {
    (200..300).contains(&status)
}

/// Performs one HTTP exchange.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn exchange(&self, request: HttpRequest) -> Result<HttpResponse, TransportError>;
}

/// Adapts a `tower::Service` into a [`Transport`].
#[derive(Debug, Clone)]
pub struct ServiceTransport<S> {
    inner: S,
}

impl<S> ServiceTransport<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<S> Transport for ServiceTransport<S>
where
    S: Service<HttpRequest, Response = HttpResponse, Error = TransportError>
        + Clone
        + Send
        + Sync
        + 'static,
    S::Future: Send,
{
    async fn exchange(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        self.inner.clone().oneshot(request).await
    }
}
