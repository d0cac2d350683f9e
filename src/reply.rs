//! Batch envelopes and reply settlement.
//!
//! A batch exchange is a FHIR `Bundle` of type `batch` whose entries are GET requests. Its
//! response carries one entry per request, in request order. Single and batched replies are
//! both turned into caller results by [`settle`].

use crate::error::{FhirError, UNKNOWN_ERROR};
use crate::transport::is_success;
use serde::Deserialize;
use serde_json::{json, Value};

/// Successful result delivered to callers.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub status: u16,
    pub data: Value,
}

/// A reply to one logical request, before settlement.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// The request was sent on its own.
    Single { status: u16, body: Value },
    /// The request was entry `index` of a batch exchange.
    BatchItem { index: usize, status: u16, resource: Option<Value>, outcome: Option<Value> },
}

/// Turn a reply into the caller's result.
pub fn settle(reply: Reply) -> Result<Response, FhirError> {
    match reply {
        Reply::Single { status, body } if is_success(status) => Ok(Response { status, data: body }),
        Reply::Single { status, body } => Err(FhirError::server(status, error_diagnostic(Some(&body)))),
        Reply::BatchItem { status, resource, .. } if is_success(status) => {
            Ok(Response { status, data: resource.unwrap_or_else(|| json!({})) })
        }
        Reply::BatchItem { status, outcome, .. } => {
            Err(FhirError::server(status, error_diagnostic(outcome.as_ref())))
        }
    }
}

/// Text of an `OperationOutcome`: the newline-joined `issue[].diagnostics`.
pub fn error_diagnostic(outcome: Option<&Value>) -> String {
    match outcome.and_then(|o| o.get("issue")).and_then(Value::as_array) {
        Some(issues) if !issues.is_empty() => issues
            .iter()
            .map(|issue| issue.get("diagnostics").and_then(Value::as_str).unwrap_or_default())
            .collect::<Vec<_>>()
            .join("\n"),
        _ => UNKNOWN_ERROR.to_string(),
    }
}

/// Body of a batch exchange carrying GET requests for `relative_urls`.
pub fn batch_body<S: AsRef<str>>(relative_urls: &[S]) -> String {
    let entry: Vec<Value> = relative_urls
        .iter()
        .map(|url| json!({ "request": { "method": "GET", "url": url.as_ref() } }))
        .collect();
    json!({ "resourceType": "Bundle", "type": "batch", "entry": entry }).to_string()
}

/// Body of an empty batch, used to check batch support.
pub fn empty_batch_body() -> String {
    json!({ "resourceType": "Bundle", "type": "batch" }).to_string()
}

#[derive(Debug, Deserialize)]
struct BatchResponse {
    #[serde(default)]
    entry: Vec<BatchResponseEntry>,
}

#[derive(Debug, Deserialize)]
struct BatchResponseEntry {
    #[serde(default)]
    resource: Option<Value>,
    #[serde(default)]
    response: Option<EntryResponse>,
}

#[derive(Debug, Deserialize)]
struct EntryResponse {
    status: String,
    #[serde(default)]
    outcome: Option<Value>,
}

/// Split a batch response body into `count` per-request replies, in request order.
///
/// Fails as a whole only if the body is not a bundle. Entries the server left out settle as
/// decode errors for their request alone.
pub fn demultiplex(body: &str, count: usize) -> Result<Vec<Result<Reply, FhirError>>, FhirError> {
    let bundle: BatchResponse =
        serde_json::from_str(body).map_err(|e| FhirError::Decode(e.to_string()))?;
    let mut entries = bundle.entry.into_iter();
    Ok((0..count)
        .map(|index| {
            let entry = entries
                .next()
                .ok_or_else(|| FhirError::Decode(format!("batch response lacks entry {}", index)))?;
            let response = entry
                .response
                .ok_or_else(|| FhirError::Decode(format!("batch entry {} has no response", index)))?;
            let status = parse_entry_status(&response.status).ok_or_else(|| {
                FhirError::Decode(format!("batch entry {} has status '{}'", index, response.status))
            })?;
            Ok(Reply::BatchItem { index, status, resource: entry.resource, outcome: response.outcome })
        })
        .collect())
}

/// Leading integer of a batch entry status such as `"200 OK"`.
fn parse_entry_status(status: &str) -> Option<u16> {
    let digits: String = status.trim().chars().take_while(char::is_ascii_digit).collect();
    digits.parse().ok()
}

/// Decode a response body as JSON. An empty body decodes to `{}`.
pub fn decode_body(body: &str) -> Result<Value, FhirError> {
    if body.trim().is_empty() {
        return Ok(json!({}));
    }
    serde_json::from_str(body).map_err(|e| FhirError::Decode(e.to_string()))
}
