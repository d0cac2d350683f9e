//! Filter-map pagination over a FHIR search.
//!
//! [`Coordinator::scan`] walks a searchset page by page, asks a callback about every
//! resource, and stops as soon as enough resources were accepted. Callbacks for one page run
//! concurrently, so when they issue their own requests those requests are batched by the
//! coordinator like any others.
//!
//! ```rust,no_run
//! # use fhirbatch::{Coordinator, Verdict};
//! # async fn run(coordinator: Coordinator) -> Result<(), fhirbatch::FhirError> {
//! let scan = coordinator.scan(
//!     "Observation?code=8480-6",
//!     20,
//!     |observation| async move {
//!         let high = observation["valueQuantity"]["value"].as_f64().unwrap_or(0.0) > 140.0;
//!         Ok(Verdict::from(high))
//!     },
//!     None,
//! );
//! let cancel = scan.canceller();
//! // `cancel.cancel()` from elsewhere stops the scan with `FhirError::Aborted`.
//! let result = scan.await?;
//! println!("{} of {:?}", result.items.len(), result.total);
//! # drop(cancel);
//! # Ok(())
//! # }
//! ```

use crate::cache::CacheOptions;
use crate::coordinator::{Coordinator, RequestOptions};
use crate::endpoint::{next_page_url, update_url_with_param};
use crate::error::FhirError;
use futures::future::{try_join_all, BoxFuture};
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio_util::sync::CancellationToken;

/// What to do with one scanned resource.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Keep,
    Drop,
    /// Accept this value in place of the resource.
    Replace(Value),
}

impl From<bool> for Verdict {
    fn from(keep: bool) -> Self {
        if keep {
            Verdict::Keep
        } else {
            Verdict::Drop
        }
    }
}

/// Accepted items in scan order, plus the collection size when known.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanResult {
    pub items: Vec<Value>,
    /// First `total` reported by the server; without one, the number of resources scanned
    /// if the collection was exhausted.
    pub total: Option<u64>,
}

/// Stops a running [`Scan`].
#[derive(Debug, Clone, Default)]
pub struct ScanCanceller {
    token: CancellationToken,
}

impl ScanCanceller {
    /// Abort the scan. Pending callbacks and page requests settle with `Aborted`.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// A running filter-map scan; resolves to its [`ScanResult`].
#[must_use = "a scan does nothing unless awaited"]
pub struct Scan {
    canceller: ScanCanceller,
    result: BoxFuture<'static, Result<ScanResult, FhirError>>,
}

impl Scan {
    pub fn canceller(&self) -> ScanCanceller {
        self.canceller.clone()
    }

    pub fn cancel(&self) {
        self.canceller.cancel();
    }
}

impl std::fmt::Debug for Scan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scan").field("cancelled", &self.canceller.is_cancelled()).finish()
    }
}

impl Future for Scan {
    type Output = Result<ScanResult, FhirError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.result.as_mut().poll(cx)
    }
}

impl Coordinator {
    /// Scan `url` until `target` resources are accepted by `filter_map` or the pages run out.
    ///
    /// Pages are fetched through the cache with `_count` set to `page_size`, or to
    /// [`default_page_size`](Coordinator::default_page_size) when `None`. Accepted items keep
    /// their scan order; items beyond `target` are dropped.
    pub fn scan<F, Fut>(&self, url: &str, target: usize, filter_map: F, page_size: Option<usize>) -> Scan
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Verdict, FhirError>> + Send + 'static,
    {
        let canceller = ScanCanceller::default();
        let page_size = page_size.unwrap_or_else(|| self.default_page_size()).max(1);
        let first = update_url_with_param(url, "_count", &page_size.to_string());
        let result = run_scan(self.clone(), first, target, Arc::new(filter_map), canceller.token.clone());
        Scan { canceller, result: Box::pin(result) }
    }
}

async fn run_scan<F, Fut>(
    coordinator: Coordinator,
    first_url: String,
    target: usize,
    filter_map: Arc<F>,
    token: CancellationToken,
) -> Result<ScanResult, FhirError>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Verdict, FhirError>> + Send + 'static,
{
    let cache = CacheOptions::default();
    let mut items: Vec<Value> = Vec::new();
    let mut total: Option<u64> = None;
    let mut scanned: u64 = 0;
    let mut next = Some(first_url);

    while let Some(url) = next.take() {
        if token.is_cancelled() {
            return Err(FhirError::Aborted);
        }
        let options = RequestOptions::default().with_cancel(token.clone());
        let page = coordinator.get_with_cache(&url, options, &cache).await?.data;
        if total.is_none() {
            total = page.get("total").and_then(Value::as_u64);
        }
        let resources: Vec<Value> = page
            .get("entry")
            .and_then(Value::as_array)
            .map(|entries| {
                entries.iter().map(|e| e.get("resource").cloned().unwrap_or(Value::Null)).collect()
            })
            .unwrap_or_default();
        scanned += resources.len() as u64;
        tracing::debug!(%url, resources = resources.len(), accepted = items.len(), "scanning page");

        let verdicts = try_join_all(resources.iter().cloned().map(|resource| {
            let token = token.clone();
            let verdict = filter_map(resource);
            async move {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => Err(FhirError::Aborted),
                    verdict = verdict => verdict,
                }
            }
        }))
        .await?;

        for (resource, verdict) in resources.into_iter().zip(verdicts) {
            match verdict {
                Verdict::Keep => items.push(resource),
                Verdict::Replace(value) => items.push(value),
                Verdict::Drop => {}
            }
        }
        if items.len() >= target {
            break;
        }
        next = next_page_url(&page);
        if next.is_none() && total.is_none() {
            total = Some(scanned);
        }
    }

    items.truncate(target);
    Ok(ScanResult { items, total })
}
