//! Endpoint URL handling for FHIR REST services: resolution against the service base, query
//! parameter updates, the long-search rewrite and paging links.

use serde_json::Value;

/// Operation that has no `_search` form and must stay a GET (wrapped in a batch when long).
const LASTN_OPERATION: &str = "/$lastn";

/// Resolve `url` against the service base unless it is already absolute.
pub fn full_url(base: &str, url: &str) -> String {
    if url.starts_with("http://") || url.starts_with("https://") {
        url.to_string()
    } else {
        format!("{}/{}", base, url)
    }
}

/// Strip the service base (and the following slash) from `url`, as batch entries require.
pub fn relative_url(base: &str, url: &str) -> String {
    match url.strip_prefix(base) {
        Some(rest) if !base.is_empty() => rest.strip_prefix('/').unwrap_or(rest).to_string(),
        _ => url.to_string(),
    }
}

/// Add or replace the query parameter `name`. URLs with more than one `?` are returned
/// unchanged.
pub fn update_url_with_param(url: &str, name: &str, value: &str) -> String {
    let mut parts = url.splitn(3, '?');
    let path = parts.next().unwrap_or_default();
    let query = parts.next().unwrap_or_default();
    if parts.next().is_some() {
        return url.to_string();
    }
    let encoded: String = url::form_urlencoded::byte_serialize(value.as_bytes()).collect();
    let params: Vec<&str> = query
        .split('&')
        .filter(|item| !item.is_empty() && item.split('=').next() != Some(name))
        .collect();
    let mut out = String::with_capacity(url.len() + name.len() + encoded.len() + 2);
    out.push_str(path);
    out.push('?');
    for param in params {
        out.push_str(param);
        out.push('&');
    }
    out.push_str(name);
    out.push('=');
    out.push_str(&encoded);
    out
}

/// Whether the query string already contains `name=`.
pub fn has_param(url: &str, name: &str) -> bool {
    url.split_once('?')
        .map(|(_, query)| query.split('&').any(|item| item.split('=').next() == Some(name)))
        .unwrap_or(false)
}

/// A search URL rewritten to `POST <path>/_search` with a form-encoded body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRewrite {
    pub url: String,
    pub body: String,
}

/// Rewrite `url` into a POST search when it exceeds `max_len` and the operation allows it.
pub fn rewrite_long_url(url: &str, max_len: usize) -> Option<SearchRewrite> {
    if url.len() <= max_len || url.contains(LASTN_OPERATION) {
        return None;
    }
    let (path, query) = url.split_once('?').unwrap_or((url, ""));
    Some(SearchRewrite { url: format!("{}/_search", path), body: query.to_string() })
}

/// Next-page link of a searchset bundle (`link[relation = "next"].url`).
pub fn next_page_url(bundle: &Value) -> Option<String> {
    bundle
        .get("link")?
        .as_array()?
        .iter()
        .find(|link| link.get("relation").and_then(Value::as_str) == Some("next"))?
        .get("url")?
        .as_str()
        .filter(|url| !url.is_empty())
        .map(str::to_string)
}
