use std::sync::OnceLock;

use reqwest::header::{HeaderMap, CONTENT_TYPE};
use reqwest::StatusCode;
use scraper::Html;
use serde_json::Value;
use url::Url;

use super::Meta;

/// A downloaded response
///
/// The body is kept as raw bytes. Text and JSON views are decoded on first
/// use and cached for the rest of the task.
#[derive(Debug, Clone)]
pub struct Response {
    status: StatusCode,
    headers: HeaderMap,
    url: Url,
    body: Vec<u8>,
    meta: Meta,
    text: OnceLock<String>,
    json: OnceLock<Option<Value>>,
}

impl Response {
    pub fn new(status: StatusCode, headers: HeaderMap, url: Url, body: Vec<u8>, meta: Meta) -> Self {
        Self {
            status,
            headers,
            url,
            body,
            meta,
            text: OnceLock::new(),
            json: OnceLock::new(),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Final URL after redirects
    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn meta(&self) -> &Meta {
        &self.meta
    }

    pub fn content_type(&self) -> Option<String> {
        self.headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_ascii_lowercase())
    }

    pub fn is_html(&self) -> bool {
        self.content_type()
            .map_or(false, |ct| ct.contains("text/html") || ct.contains("xhtml"))
    }

    pub fn is_json(&self) -> bool {
        self.content_type().map_or(false, |ct| ct.contains("/json") || ct.contains("+json"))
    }

    /// Body as text. Invalid UTF-8 sequences are replaced.
    pub fn text(&self) -> &str {
        self.text
            .get_or_init(|| String::from_utf8_lossy(&self.body).into_owned())
    }

    /// Body parsed as JSON, `None` when it is not valid JSON
    pub fn json(&self) -> Option<&Value> {
        self.json
            .get_or_init(|| serde_json::from_slice(&self.body).ok())
            .as_ref()
    }

    /// Look up a value inside the JSON body with an RFC 6901 pointer
    pub fn json_pointer(&self, pointer: &str) -> Option<&Value> {
        self.json().and_then(|v| v.pointer(pointer))
    }

    /// Parse the body as an HTML document
    pub fn html(&self) -> Html {
        Html::parse_document(self.text())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;
    use scraper::Selector;

    fn response(content_type: &str, body: &[u8]) -> Response {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_str(content_type).unwrap());
        Response::new(
            StatusCode::OK,
            headers,
            Url::parse("http://example.com/").unwrap(),
            body.to_vec(),
            Meta::default(),
        )
    }

    #[test]
    fn test_json_view() {
        let resp = response("application/json; charset=utf-8", br#"{"data":{"items":[1,2,3]}}"#);
        assert!(resp.is_json());
        assert!(!resp.is_html());
        assert_eq!(resp.json_pointer("/data/items/1"), Some(&Value::from(2)));
        assert_eq!(resp.json_pointer("/data/missing"), None);
    }

    #[test]
    fn test_invalid_json_is_none() {
        let resp = response("application/json", b"{not json");
        assert!(resp.json().is_none());
        assert_eq!(resp.text(), "{not json");
    }

    #[test]
    fn test_html_view() {
        let resp = response(
            "text/html",
            b"<html><head><title>Hello</title></head><body><a href=\"/a\">A</a></body></html>",
        );
        assert!(resp.is_html());

        let doc = resp.html();
        let title = Selector::parse("title").unwrap();
        let text: String = doc.select(&title).flat_map(|e| e.text()).collect();
        assert_eq!(text, "Hello");
    }

    #[test]
    fn test_lossy_text() {
        let resp = response("text/plain", &[b'o', b'k', 0xff]);
        assert_eq!(resp.text(), "ok\u{fffd}");
    }
}
