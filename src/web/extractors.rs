//! Request parameter extraction
//!
//! Token and region resolution shared by the handlers. Both accept a
//! query parameter and a set of headers; the first usable value wins.

use axum::http::HeaderMap;

use crate::playlist::normalize_region;

/// Headers consulted for the client region, in priority order
pub const REGION_HEADERS: [&str; 4] = [
    "X-Amps-Region",
    "X-Region",
    "CF-IPCountry",
    "X-Appengine-Country",
];

const TOKEN_HEADER: &str = "X-Amps-Token";

/// Bearer token from `Authorization`, `X-Amps-Token` or `?token=`
pub fn extract_token(headers: &HeaderMap, query: &[(String, String)]) -> Option<String> {
    if let Some(value) = headers.get("authorization").and_then(|v| v.to_str().ok()) {
        if let Some(token) = value.strip_prefix("Bearer ") {
            if !token.is_empty() {
                return Some(token.to_string());
            }
        }
    }
    if let Some(value) = headers.get(TOKEN_HEADER).and_then(|v| v.to_str().ok()) {
        if !value.is_empty() {
            return Some(value.to_string());
        }
    }
    query
        .iter()
        .find(|(k, _)| k == "token")
        .map(|(_, v)| v.clone())
}

/// Best-effort client region from `?region=` or the region headers
pub fn extract_region(headers: &HeaderMap, query: &[(String, String)]) -> Option<String> {
    if let Some((_, value)) = query.iter().find(|(k, _)| k == "region") {
        if let Some(region) = normalize_region(value) {
            return Some(region);
        }
    }
    for header in REGION_HEADERS {
        if let Some(value) = headers.get(header).and_then(|v| v.to_str().ok()) {
            if let Some(region) = normalize_region(value) {
                return Some(region);
            }
        }
    }
    None
}

/// Absolute base URL reconstructed from the Host header
pub fn base_url(headers: &HeaderMap) -> String {
    let host = headers
        .get("host")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost");
    format!("http://{host}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn query(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn bearer_header_wins_over_query() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer abc"));
        let token = extract_token(&headers, &query(&[("token", "zzz")]));
        assert_eq!(token.as_deref(), Some("abc"));
    }

    #[test]
    fn custom_header_and_query_both_work() {
        let mut headers = HeaderMap::new();
        headers.insert("x-amps-token", HeaderValue::from_static("hdr"));
        assert_eq!(extract_token(&headers, &[]).as_deref(), Some("hdr"));
        assert_eq!(
            extract_token(&HeaderMap::new(), &query(&[("token", "qry")])).as_deref(),
            Some("qry")
        );
        assert!(extract_token(&HeaderMap::new(), &[]).is_none());
    }

    #[test]
    fn region_resolution_order_and_normalisation() {
        let mut headers = HeaderMap::new();
        headers.insert("cf-ipcountry", HeaderValue::from_static("de"));
        assert_eq!(
            extract_region(&headers, &query(&[("region", "us")])).as_deref(),
            Some("US")
        );
        assert_eq!(extract_region(&headers, &[]).as_deref(), Some("DE"));
        // Malformed codes are ignored
        assert!(extract_region(&HeaderMap::new(), &query(&[("region", "usa")])).is_none());
    }
}
