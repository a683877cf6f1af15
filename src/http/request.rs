use std::collections::BTreeMap;
use std::fmt;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE, USER_AGENT};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::{ParseError, Url};

use crate::error::RequestError;

/// Typed per-request metadata
///
/// The well-known keys are plain fields. Anything else a hook wants to carry
/// from a request to its response goes into the string-keyed value map.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Meta {
    /// How many times this request has been re-submitted after a failure
    #[serde(default)]
    pub retry_times: u32,

    /// The proxy was chosen by a rotation hook rather than the caller
    #[serde(default)]
    pub random_proxy: bool,

    /// The User-Agent was chosen by a rotation hook rather than the caller
    #[serde(default)]
    pub random_user_agent: bool,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    values: BTreeMap<String, Value>,
}

impl Meta {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Read a value back into a concrete type
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.values
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.values.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }
}

/// Where a request points
#[derive(Debug, Clone, PartialEq)]
pub enum Target {
    Absolute(Url),
    /// A reference still waiting to be resolved against a parent response
    Relative(String),
}

/// An HTTP request plus the crawl bookkeeping that travels with it
#[derive(Debug, Clone)]
pub struct Request {
    method: Method,
    target: Target,
    headers: HeaderMap,
    body: Vec<u8>,
    depth: Option<u32>,
    proxy: Option<String>,
    meta: Meta,
    error: Option<RequestError>,
}

impl Request {
    pub fn new(method: Method, url: &str) -> Self {
        let (target, error) = match Url::parse(url) {
            Ok(parsed) => (Target::Absolute(parsed), None),
            Err(ParseError::RelativeUrlWithoutBase) => (Target::Relative(url.to_string()), None),
            Err(e) => (
                Target::Relative(url.to_string()),
                Some(RequestError::InvalidUrl {
                    url: url.to_string(),
                    reason: e.to_string(),
                }),
            ),
        };

        Self {
            method,
            target,
            headers: HeaderMap::new(),
            body: Vec::new(),
            depth: None,
            proxy: None,
            meta: Meta::default(),
            error,
        }
    }

    pub fn get(url: &str) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post(url: &str, body: impl Into<Vec<u8>>) -> Self {
        let mut req = Self::new(Method::POST, url);
        req.body = body.into();
        req
    }

    /// POST an `application/x-www-form-urlencoded` body
    pub fn post_form<K, V>(url: &str, fields: &[(K, V)]) -> Self
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut serializer = url::form_urlencoded::Serializer::new(String::new());
        for (k, v) in fields {
            serializer.append_pair(k.as_ref(), v.as_ref());
        }
        Self::post(url, serializer.finish())
            .header(CONTENT_TYPE.as_str(), "application/x-www-form-urlencoded")
    }

    pub fn post_json<T: Serialize>(url: &str, body: &T) -> Self {
        match serde_json::to_vec(body) {
            Ok(bytes) => Self::post(url, bytes).header(CONTENT_TYPE.as_str(), "application/json"),
            Err(e) => {
                let mut req = Self::new(Method::POST, url);
                req.error.get_or_insert(RequestError::Body(e.to_string()));
                req
            }
        }
    }

    /// Add a header; an invalid name or value marks the request as malformed
    pub fn header(mut self, name: &str, value: &str) -> Self {
        if self.error.is_none() {
            if let Err(e) = self.set_header(name, value) {
                self.error = Some(e);
            }
        }
        self
    }

    pub fn user_agent(self, agent: &str) -> Self {
        self.header(USER_AGENT.as_str(), agent)
    }

    pub fn proxy(mut self, proxy: &str) -> Self {
        if self.error.is_none() {
            self.proxy = Some(proxy.to_string());
        }
        self
    }

    /// Append a query parameter
    pub fn param(mut self, key: &str, value: &str) -> Self {
        if self.error.is_some() {
            return self;
        }
        match &mut self.target {
            Target::Absolute(url) => {
                url.query_pairs_mut().append_pair(key, value);
            }
            Target::Relative(raw) => {
                let pair = url::form_urlencoded::Serializer::new(String::new())
                    .append_pair(key, value)
                    .finish();
                raw.push(if raw.contains('?') { '&' } else { '?' });
                raw.push_str(&pair);
            }
        }
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        if self.error.is_none() {
            self.body = body.into();
        }
        self
    }

    pub fn with_meta(mut self, meta: Meta) -> Self {
        if self.error.is_none() {
            self.meta = meta;
        }
        self
    }

    pub fn depth(mut self, depth: u32) -> Self {
        if self.error.is_none() {
            self.depth = Some(depth);
        }
        self
    }

    pub fn set_header(&mut self, name: &str, value: &str) -> Result<(), RequestError> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| RequestError::InvalidHeader(name.to_string()))?;
        let value = HeaderValue::from_str(value)
            .map_err(|_| RequestError::InvalidHeader(name.to_string()))?;
        self.headers.insert(name, value);
        Ok(())
    }

    pub fn set_proxy(&mut self, proxy: Option<String>) {
        self.proxy = proxy;
    }

    pub fn set_depth(&mut self, depth: Option<u32>) {
        self.depth = depth;
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    /// The absolute URL, once known
    pub fn url(&self) -> Option<&Url> {
        match &self.target {
            Target::Absolute(url) => Some(url),
            Target::Relative(_) => None,
        }
    }

    /// Lower-cased hostname of an absolute URL
    pub fn host(&self) -> Option<String> {
        self.url()
            .and_then(|u| u.host_str())
            .map(|h| h.to_ascii_lowercase())
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn get_depth(&self) -> Option<u32> {
        self.depth
    }

    pub fn get_proxy(&self) -> Option<&str> {
        self.proxy.as_deref()
    }

    pub fn meta(&self) -> &Meta {
        &self.meta
    }

    pub fn meta_mut(&mut self) -> &mut Meta {
        &mut self.meta
    }

    pub fn error(&self) -> Option<&RequestError> {
        self.error.as_ref()
    }

    /// Resolve a relative target against `base`
    ///
    /// Absolute targets are left alone. Resolution failures are recorded as
    /// the request's construction error.
    pub fn resolve(&mut self, base: Option<&Url>) {
        let Target::Relative(raw) = &self.target else {
            return;
        };
        let Some(base) = base else {
            return;
        };
        match base.join(raw) {
            Ok(url) => self.target = Target::Absolute(url),
            Err(e) => {
                self.error.get_or_insert(RequestError::InvalidUrl {
                    url: raw.clone(),
                    reason: e.to_string(),
                });
            }
        }
    }

    /// The URL to dispatch to, or the construction error that prevents it
    pub fn check(&self) -> Result<&Url, RequestError> {
        if let Some(err) = &self.error {
            return Err(err.clone());
        }
        match &self.target {
            Target::Absolute(url) => Ok(url),
            Target::Relative(raw) => Err(RequestError::Unresolved(raw.clone())),
        }
    }

    /// `METHOD url` for log lines
    pub fn describe(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.target {
            Target::Absolute(url) => write!(f, "{} {}", self.method, url),
            Target::Relative(raw) => write!(f, "{} {}", self.method, raw),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_targets() {
        let mut req = Request::get("/next?page=2");
        assert!(req.url().is_none());
        assert_eq!(
            req.check(),
            Err(RequestError::Unresolved("/next?page=2".to_string()))
        );

        let base = Url::parse("https://example.com/list/index.html").unwrap();
        req.resolve(Some(&base));
        assert_eq!(req.url().unwrap().as_str(), "https://example.com/next?page=2");
        assert!(req.check().is_ok());
    }

    #[test]
    fn test_malformed_url_is_a_construction_error() {
        let req = Request::get("http://[::1");
        assert!(matches!(req.error(), Some(RequestError::InvalidUrl { .. })));

        // Builders do not clear or override the error
        let req = req.header("x-test", "1").depth(4);
        assert!(req.headers().is_empty());
        assert_eq!(req.get_depth(), None);
    }

    #[test]
    fn test_invalid_header_marks_request() {
        let req = Request::get("http://example.com").header("bad header", "v");
        assert_eq!(
            req.error(),
            Some(&RequestError::InvalidHeader("bad header".to_string()))
        );
    }

    #[test]
    fn test_form_and_params() {
        let req = Request::post_form("http://example.com/login", &[("user", "a b"), ("pw", "x&y")])
            .param("next", "/home");

        assert_eq!(*req.method(), Method::POST);
        assert_eq!(req.body(), b"user=a+b&pw=x%26y");
        assert_eq!(
            req.headers().get(CONTENT_TYPE).unwrap(),
            "application/x-www-form-urlencoded"
        );
        assert_eq!(req.url().unwrap().query(), Some("next=%2Fhome"));

        let rel = Request::get("search?q=1").param("p", "2");
        assert_eq!(rel.target(), &Target::Relative("search?q=1&p=2".to_string()));
    }

    #[test]
    fn test_meta_values() {
        let mut meta = Meta::default();
        meta.insert("page", 3);
        meta.retry_times = 2;

        let req = Request::get("http://example.com").with_meta(meta);
        assert_eq!(req.meta().get_as::<u32>("page"), Some(3));
        assert_eq!(req.meta().retry_times, 2);
        assert!(!req.meta().contains("missing"));
    }

    #[test]
    fn test_host_is_lowercase() {
        let req = Request::get("http://WWW.Example.COM:8080/x");
        assert_eq!(req.host().as_deref(), Some("www.example.com"));
    }
}
