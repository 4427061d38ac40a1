//! URL normalizer (C3): turns `(Host header, request target)` into a stable
//! cache key. Pure, deterministic, no I/O.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;

/// Extensions that make the query string irrelevant for cache keying.
const STATIC_ASSET_EXTENSIONS: &[&str] = &[
    "js", "css", "png", "jpg", "jpeg", "gif", "svg", "webp", "ico", "woff", "woff2", "ttf", "eot",
];

static TRACKING_PARAM_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"([&?])(utm_source|session_id|ref)=[^&]*").expect("tracking param regex compiles")
});

fn strip_port(host: &str) -> &str {
    // IPv6 literals carry their own colons; only strip a trailing ":port".
    if host.starts_with('[') {
        return host;
    }
    match host.rsplit_once(':') {
        Some((h, "80")) => h,
        _ => host,
    }
}

fn split_target(target: &str) -> (&str, &str) {
    match target.split_once('?') {
        Some((path, query)) => (path, query),
        None => (target, ""),
    }
}

fn extension_of(path: &str) -> Option<&str> {
    let last_segment = path.rsplit('/').next().unwrap_or(path);
    last_segment.rsplit_once('.').map(|(_, ext)| ext)
}

fn sort_and_dedupe_query(query: &str) -> String {
    if query.is_empty() {
        return String::new();
    }
    let mut params: BTreeMap<&str, &str> = BTreeMap::new();
    for pair in query.split('&') {
        if pair.is_empty() {
            continue;
        }
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        // First value wins; later duplicates are ignored.
        params.entry(key).or_insert(value);
    }
    params
        .into_iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&")
}

/// Canonicalizes `(host, request_target)` into a `http://host/path[?query]`
/// cache key. HTTPS is never cached, so the scheme is always `http`.
pub fn normalize(host: &str, request_target: &str) -> String {
    let host = strip_port(host).to_lowercase();
    let (raw_path, raw_query) = split_target(request_target);

    if let Some(ext) = extension_of(raw_path) {
        if STATIC_ASSET_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()) {
            return format!("http://{host}{raw_path}");
        }
    }

    let combined = if raw_query.is_empty() {
        raw_path.to_string()
    } else {
        format!("{raw_path}?{raw_query}")
    };
    let stripped = TRACKING_PARAM_RE.replace_all(&combined, "$1");
    let (path_part, query_part) = split_target(&stripped);
    let sorted_query = sort_and_dedupe_query(query_part);

    if sorted_query.is_empty() {
        format!("http://{host}{path_part}")
    } else {
        format!("http://{host}{path_part}?{sorted_query}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lowercases_and_strips_default_port() {
        assert_eq!(normalize("Example.com:80", "/a"), "http://example.com/a");
    }

    #[test]
    fn keeps_non_default_port() {
        assert_eq!(
            normalize("example.com:8443", "/a"),
            "http://example.com:8443/a"
        );
    }

    #[test]
    fn query_order_does_not_affect_key() {
        let a = normalize("X.com", "/p?b=2&a=1");
        let b = normalize("x.com", "/p?a=1&b=2");
        assert_eq!(a, b);
        assert_eq!(a, "http://x.com/p?a=1&b=2");
    }

    #[test]
    fn static_asset_query_is_dropped() {
        let a = normalize("cdn.example.com", "/app.js?v=123");
        let b = normalize("cdn.example.com", "/app.js?v=456");
        assert_eq!(a, b);
        assert_eq!(a, "http://cdn.example.com/app.js");
    }

    #[test]
    fn strips_tracking_params() {
        let key = normalize("example.com", "/a?utm_source=foo&b=2");
        assert_eq!(key, "http://example.com/a?b=2");
    }

    #[test]
    fn duplicate_param_keeps_first_value() {
        let key = normalize("example.com", "/a?x=1&x=2");
        assert_eq!(key, "http://example.com/a?x=1");
    }

    #[test]
    fn deterministic_and_idempotent() {
        let first = normalize("example.com", "/p?b=2&a=1");
        let reparsed = normalize("example.com", &first.replacen("http://example.com", "", 1));
        assert_eq!(first, reparsed);
    }
}
