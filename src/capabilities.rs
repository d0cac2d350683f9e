//! Service initialization and capability probing.
//!
//! [`Coordinator::initialize`] binds the coordinator to a service base URL and an optional
//! initialization context (for example "pre-login" vs "post-login"), then queries the server
//! once per context. Changing either value aborts everything in flight, forgets learned
//! pacing and queries again.
//!
//! Discovery responses are cached for a day in the partition `init-[<context>-]<base>` so a
//! reload does not hit the server again. The metadata lookup ignores the context.

use crate::cache::CacheOptions;
use crate::config::normalize_base_url;
use crate::coordinator::{Coordinator, RequestOptions};
use crate::error::FhirError;
use crate::reply::empty_batch_body;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;

/// Lifetime of cached discovery responses.
pub const INIT_CACHE_EXPIRATION: Duration = Duration::from_secs(24 * 60 * 60);

/// Attempts allowed per discovery request. A wrong base URL should fail fast.
const DISCOVERY_ATTEMPTS: usize = 2;

/// FHIR releases this client understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FhirVersion {
    R4,
    R5,
}

impl FhirVersion {
    /// Release for a `CapabilityStatement.fhirVersion` value such as `"4.0.1"`.
    pub fn from_version_number(version: &str) -> Option<Self> {
        let version = version.trim();
        if version.starts_with("4.0") {
            Some(FhirVersion::R4)
        } else if ["4.3", "4.4", "4.5", "4.6", "5.0"].iter().any(|p| version.starts_with(p)) {
            Some(FhirVersion::R5)
        } else {
            None
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            FhirVersion::R4 => "R4",
            FhirVersion::R5 => "R5",
        }
    }
}

impl std::fmt::Display for FhirVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// What discovery found out about the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capabilities {
    pub version: FhirVersion,
    /// The raw `fhirVersion` reported by the server.
    pub fhir_version: String,
    /// The server accepts `batch` bundles.
    pub batch: bool,
    /// At least one `ResearchStudy` exists.
    pub has_research_study: bool,
}

type InitCell = Arc<OnceCell<Result<Capabilities, FhirError>>>;

/// Memoized initialization for the current context.
#[derive(Debug, Default)]
pub(crate) struct InitSlot {
    context: String,
    cell: Option<InitCell>,
}

/// Cache partition for discovery responses.
pub fn init_cache_partition(context: &str, base_url: &str) -> String {
    if context.is_empty() {
        format!("init-{}", base_url)
    } else {
        format!("init-{}-{}", context, base_url)
    }
}

fn discovery_cache(partition: String) -> CacheOptions {
    CacheOptions::default()
        .in_partition(partition)
        .expiring_after(INIT_CACHE_EXPIRATION)
        .with_errors()
}

fn discovery_options() -> RequestOptions {
    RequestOptions::default().not_combinable().with_attempts(DISCOVERY_ATTEMPTS)
}

impl Coordinator {
    /// Initialize, or reinitialize after a base URL or context change.
    ///
    /// `None` keeps the current value. Concurrent and repeated calls for the same context share
    /// one discovery run; a failed run is forgotten so the next call runs it again.
    pub async fn initialize(
        &self,
        base_url: Option<&str>,
        context: Option<&str>,
    ) -> Result<Capabilities, FhirError> {
        let base = base_url
            .map(normalize_base_url)
            .transpose()
            .map_err(|e| FhirError::Unavailable(e.to_string()))?;
        let (cell, context) = {
            let mut slot = self.init_slot();
            let base_changed = base.as_ref().is_some_and(|b| *b != self.service_base_url());
            let context_changed = context.is_some_and(|c| c != slot.context);
            if base_changed || context_changed {
                tracing::info!(base = ?base, context = ?context, "service context changed");
                self.reset_context(base.filter(|_| base_changed));
                if let Some(context) = context {
                    slot.context = context.to_string();
                }
                slot.cell = None;
            }
            let cell = slot.cell.get_or_insert_with(InitCell::default).clone();
            (cell, slot.context.clone())
        };

        let result = cell.get_or_init(|| self.discover(context)).await.clone();
        if result.is_err() {
            let mut slot = self.init_slot();
            if slot.cell.as_ref().is_some_and(|current| Arc::ptr_eq(current, &cell)) {
                slot.cell = None;
            }
        }
        result
    }

    /// Result of the last successful initialization for the current context.
    pub fn capabilities(&self) -> Option<Capabilities> {
        let slot = self.init_slot();
        slot.cell.as_ref()?.get()?.as_ref().ok().cloned()
    }

    async fn discover(&self, context: String) -> Result<Capabilities, FhirError> {
        let base = self.service_base_url();
        let partition = init_cache_partition(&context, &base);
        let shared = discovery_cache(init_cache_partition("", &base));
        let scoped = discovery_cache(partition.clone());

        let (metadata, research, batch) = tokio::join!(
            self.get_with_cache("metadata?_elements=fhirVersion", discovery_options(), &shared),
            self.get_with_cache("ResearchStudy?_elements=id&_count=1", discovery_options(), &scoped),
            self.post(&base, empty_batch_body(), discovery_options()),
        );

        if self.service_base_url() != base {
            return Err(FhirError::Aborted);
        }
        let metadata = match metadata {
            Ok(metadata) => metadata,
            Err(error) => {
                tracing::warn!(%base, %error, "metadata lookup failed");
                self.clear_cache_partition(&partition).await;
                self.clear_pending_requests();
                return Err(FhirError::Unavailable(format!(
                    "could not retrieve the FHIR server's metadata from {}: {}",
                    base, error
                )));
            }
        };
        let fhir_version = metadata
            .data
            .get("fhirVersion")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let version = FhirVersion::from_version_number(&fhir_version)
            .ok_or_else(|| FhirError::UnsupportedVersion(fhir_version.clone()))?;
        let has_research_study = research
            .map(|r| r.data.get("entry").and_then(Value::as_array).is_some_and(|e| !e.is_empty()))
            .unwrap_or(false);

        let capabilities =
            Capabilities { version, fhir_version, batch: batch.is_ok(), has_research_study };
        tracing::info!(%base, ?capabilities, "service initialized");
        Ok(capabilities)
    }
}
