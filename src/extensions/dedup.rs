use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use sha2::{Digest, Sha256};
use tracing::debug;
use url::Url;

use crate::crawler::{Engine, Extension, Flow};
use crate::http::Request;

/// Normalize a URL so trivially different spellings compare equal
///
/// Hosts are lower-cased and default ports dropped by the parser already;
/// on top of that the fragment is removed and query parameters are sorted.
pub fn normalize_url(url: &Url) -> String {
    let mut normalized = url.clone();
    normalized.set_fragment(None);

    if normalized.query().is_some() {
        let mut params: Vec<(String, String)> = normalized
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        params.sort();

        if params.is_empty() {
            normalized.set_query(None);
        } else {
            normalized.query_pairs_mut().clear().extend_pairs(params);
        }
    }

    normalized.to_string()
}

/// Hex SHA-256 over method, normalized URL and body
pub fn fingerprint(request: &Request) -> String {
    let mut hasher = Sha256::new();
    hasher.update(request.method().as_str().as_bytes());
    hasher.update(b" ");
    match request.url() {
        Some(url) => hasher.update(normalize_url(url).as_bytes()),
        None => hasher.update(request.to_string().as_bytes()),
    }
    hasher.update(b"\n");
    hasher.update(request.body());
    hex::encode(hasher.finalize())
}

/// Drops tasks whose request was already seen in this run. Retries pass.
#[derive(Clone, Default)]
pub struct Deduplicate {
    seen: Arc<Mutex<HashSet<String>>>,
}

impl Deduplicate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the request, false if it was seen before
    pub fn check(&self, request: &Request) -> bool {
        if request.meta().retry_times > 0 {
            return true;
        }
        let fp = fingerprint(request);
        let mut seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());
        if seen.insert(fp) {
            true
        } else {
            debug!("Skipping already seen request: {}", request);
            false
        }
    }

    pub fn seen_count(&self) -> usize {
        self.seen.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl Extension for Deduplicate {
    fn install(self, engine: &mut Engine) {
        engine.on_add(move |_, task| {
            if self.check(&task.request) {
                Flow::Continue(task)
            } else {
                Flow::Stop
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn normalize(url: &str) -> String {
        normalize_url(&Url::parse(url).unwrap())
    }

    #[test]
    fn test_normalize_url() {
        assert_eq!(normalize("https://EXAMPLE.com/path"), "https://example.com/path");
        assert_eq!(normalize("https://example.com:443/path"), "https://example.com/path");
        assert_eq!(
            normalize("https://example.com/search?b=2&a=1"),
            "https://example.com/search?a=1&b=2"
        );
        assert_eq!(normalize("https://example.com/page#section"), "https://example.com/page");
    }

    #[test]
    fn test_fingerprint_ignores_param_order() {
        let a = Request::get("http://example.com/s?x=1&y=2");
        let b = Request::get("http://example.com/s?y=2&x=1#top");
        let c = Request::post("http://example.com/s?x=1&y=2", "body");

        assert_eq!(fingerprint(&a), fingerprint(&b));
        assert_ne!(fingerprint(&a), fingerprint(&c));
        assert_eq!(fingerprint(&a).len(), 64);
    }

    #[test]
    fn test_deduplicate_skips_repeats_but_not_retries() {
        let dedup = Deduplicate::new();
        let req = Request::get("http://example.com/");

        assert!(dedup.check(&req));
        assert!(!dedup.check(&req));

        let mut retry = req.clone();
        retry.meta_mut().retry_times = 1;
        assert!(dedup.check(&retry));
        assert_eq!(dedup.seen_count(), 1);
    }
}
