//! Control-parameter resolution.
//!
//! Any request parameter `<name>` may be supplied as the query key
//! `<PREFIX_SHORT>-<name>` (matched case-insensitively) or the header
//! `x-<PREFIX_LONG>-<name>`. Multi-valued parameters accept repetition or a
//! single comma-separated value.

use axum::http::HeaderMap;

/// Configured control-parameter prefixes.
#[derive(Debug, Clone)]
pub struct ControlPrefixes {
    pub short: String,
    pub long: String,
}

impl Default for ControlPrefixes {
    fn default() -> Self {
        Self {
            short: "fly".to_string(),
            long: "firefly".to_string(),
        }
    }
}

/// Decode a raw query string into ordered key/value pairs.
pub fn query_pairs(query: Option<&str>) -> Vec<(String, String)> {
    query
        .and_then(|q| serde_urlencoded::from_str::<Vec<(String, String)>>(q).ok())
        .unwrap_or_default()
}

/// All values for a query key, matched case-insensitively.
pub fn query_values_no_case<'a>(pairs: &'a [(String, String)], name: &str) -> Vec<&'a str> {
    pairs
        .iter()
        .filter(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
        .collect()
}

/// First value for a query key, matched case-insensitively.
pub fn query_value_no_case<'a>(pairs: &'a [(String, String)], name: &str) -> Option<&'a str> {
    query_values_no_case(pairs, name).first().copied()
}

/// Resolve a single-valued control parameter from query or headers.
pub fn control_param(
    name: &str,
    pairs: &[(String, String)],
    headers: &HeaderMap,
    prefixes: &ControlPrefixes,
) -> Option<String> {
    let query_key = format!("{}-{}", prefixes.short, name);
    if let Some(value) = query_value_no_case(pairs, &query_key) {
        if !value.is_empty() {
            return Some(value.to_string());
        }
    }
    let header_key = format!("x-{}-{}", prefixes.long, name);
    headers
        .get(header_key.as_str())
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Resolve a multi-valued control parameter: repeated query params or
/// headers, or one comma-separated value.
pub fn control_param_multi(
    name: &str,
    pairs: &[(String, String)],
    headers: &HeaderMap,
    prefixes: &ControlPrefixes,
) -> Vec<String> {
    let query_key = format!("{}-{}", prefixes.short, name);
    let mut values: Vec<String> = query_values_no_case(pairs, &query_key)
        .into_iter()
        .map(str::to_string)
        .collect();

    if values.is_empty() {
        let header_key = format!("x-{}-{}", prefixes.long, name);
        values = headers
            .get_all(header_key.as_str())
            .iter()
            .filter_map(|v| v.to_str().ok())
            .map(str::to_string)
            .collect();
    }

    if values.len() == 1 {
        values = values[0].split(',').map(str::to_string).collect();
    }
    values
}
