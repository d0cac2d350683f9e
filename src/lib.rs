#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]
//! # fhirbatch
//!
//! Adaptive request coordination for FHIR REST clients.
//!
//! ## Features
//!
//! - **Batching**: independent GETs issued within a short window travel as one FHIR `batch`
//!   bundle, and each caller gets its own entry back
//! - **Concurrency cap** on exchanges in flight
//! - **Adaptive pacing** learned from `x-ratelimit-limit`, `429` and `Retry-After`
//! - **Retries** bounded by an attempt budget or a give-up deadline
//! - **Cancellation** through `tokio_util::sync::CancellationToken`
//! - **Filter-map scans** over paged searches, converging on a target count
//! - **Response cache** with partitions and expiry
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use fhirbatch::{Coordinator, CoordinatorConfig, RequestOptions, Verdict};
//! # use fhirbatch::transport::{HttpRequest, HttpResponse, Transport};
//! # use fhirbatch::error::TransportError;
//! # struct Http;
//! # #[async_trait::async_trait]
//! # impl Transport for Http {
//! #     async fn exchange(&self, _r: HttpRequest) -> Result<HttpResponse, TransportError> {
//! #         Ok(HttpResponse::new(200, "{}"))
//! #     }
//! # }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let coordinator = Coordinator::new(CoordinatorConfig::new("https://hapi.fhir.org/baseR4"), Http)?;
//!     let capabilities = coordinator.initialize(None, None).await?;
//!     println!("talking to a {} server", capabilities.version);
//!
//!     let patient = coordinator.get("Patient/example", RequestOptions::default()).await?;
//!     println!("{}", patient.data);
//!
//!     let adults = coordinator
//!         .scan("Patient", 10, |p| async move { Ok(Verdict::from(p["birthDate"].is_string())) }, None)
//!         .await?;
//!     println!("{} patients", adults.items.len());
//!     Ok(())
//! }
//! ```

pub mod adaptive;
pub mod cache;
pub mod capabilities;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod endpoint;
pub mod error;
pub mod pacing;
pub mod reply;
pub mod scan;
pub mod sleeper;
pub mod telemetry;
pub mod transport;

// Re-exports
pub use adaptive::DynamicConfig;
pub use cache::{CacheOptions, CachedResponse, MemoryCache, ResponseCache};
pub use capabilities::{Capabilities, FhirVersion};
pub use clock::{Clock, MonotonicClock};
pub use config::{BuildError, CoordinatorConfig, PacingConfig, Settings};
pub use coordinator::{Coordinator, CoordinatorBuilder, RequestOptions, RetryBudget};
pub use endpoint::{next_page_url, update_url_with_param};
pub use error::{FhirError, TransportError, HTTP_ABORT};
pub use pacing::PacingPolicy;
pub use reply::Response;
pub use scan::{Scan, ScanCanceller, ScanResult, Verdict};
pub use sleeper::{Sleeper, TokioSleeper, TrackingSleeper};
pub use telemetry::{CoordinatorEvent, EventBus};
pub use transport::{HttpRequest, HttpResponse, ServiceTransport, Transport};
pub use tokio_util::sync::CancellationToken;
