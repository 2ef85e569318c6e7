//! Request/response values handed to middleware and handlers.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use http::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use http::{HeaderMap, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// Parsed request payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Body {
    /// No payload was read (methods without a body).
    #[default]
    None,
    /// `application/json` payload; an empty JSON body is `{}`.
    Json(Value),
    /// Any other content type, passed through untouched.
    Raw(Vec<u8>),
}

impl Body {
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Body::Json(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Body::Raw(b) => Some(b),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    /// Raw request target as received (`/users/42?verbose=1`).
    pub url: String,
    pub pathname: String,
    /// Query string; on duplicate keys the last value wins.
    pub query: HashMap<String, String>,
    pub headers: HeaderMap,
    pub body: Body,
    /// Route parameters, filled once a route matched.
    pub params: HashMap<String, String>,
    /// Cancelled when the request deadline expires. The handler future is
    /// dropped at that point, so this only reaches work it spawned.
    pub cancel: CancellationToken,
}

impl Request {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        let url = url.into();
        let (pathname, query) = split_target(&url);
        Self {
            method,
            url,
            pathname,
            query,
            headers: HeaderMap::new(),
            body: Body::None,
            params: HashMap::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query.get(name).map(String::as_str)
    }

    /// Deserialize the JSON body into `T`.
    pub fn json<T: DeserializeOwned>(&self) -> anyhow::Result<T> {
        match &self.body {
            Body::Json(v) => Ok(serde_json::from_value(v.clone())?),
            _ => anyhow::bail!("request has no JSON body"),
        }
    }
}

/// Split a request target into pathname and decoded query map.
pub fn split_target(target: &str) -> (String, HashMap<String, String>) {
    let (path, query) = match target.split_once('?') {
        Some((p, q)) => (p, q),
        None => (target, ""),
    };
    // fragments never reach a server, but be lenient
    let query = query.split('#').next().unwrap_or("");

    let mut map = HashMap::new();
    for (k, v) in url::form_urlencoded::parse(query.as_bytes()) {
        map.insert(k.into_owned(), v.into_owned());
    }
    let path = if path.is_empty() { "/" } else { path };
    (path.to_string(), map)
}

/// Response under construction. Setters are chainable on `&mut`.
#[derive(Debug, Clone)]
pub struct Response {
    status: StatusCode,
    headers: HeaderMap,
    body: Vec<u8>,
}

impl Default for Response {
    fn default() -> Self {
        Self::new()
    }
}

impl Response {
    pub fn new() -> Self {
        Self {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: Vec::new(),
        }
    }

    /// `{"error": message}` with the given status.
    pub fn error(status: StatusCode, message: &str) -> Self {
        let mut res = Self::new();
        res.status(status)
            .json(&serde_json::json!({ "error": message }));
        res
    }

    pub fn status(&mut self, status: StatusCode) -> &mut Self {
        self.status = status;
        self
    }

    /// Invalid header names or values are dropped with a warning.
    pub fn header(&mut self, name: &str, value: &str) -> &mut Self {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(n), Ok(v)) => {
                self.headers.insert(n, v);
            }
            _ => tracing::warn!(header = name, "dropping invalid response header"),
        }
        self
    }

    pub fn json<T: Serialize + ?Sized>(&mut self, data: &T) -> &mut Self {
        match serde_json::to_vec(data) {
            Ok(bytes) => {
                self.headers
                    .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
                self.body = bytes;
            }
            Err(e) => {
                tracing::error!(error = %e, "response serialization failed");
                self.status = StatusCode::INTERNAL_SERVER_ERROR;
                self.headers
                    .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
                self.body = br#"{"error":"Internal Server Error"}"#.to_vec();
            }
        }
        self
    }

    pub fn send(&mut self, text: impl Into<String>) -> &mut Self {
        self.headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        self.body = text.into().into_bytes();
        self
    }

    /// Consume a builder chain into an owned value.
    pub fn take(&mut self) -> Self {
        std::mem::take(self)
    }

    pub fn status_code(&self) -> StatusCode {
        self.status
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

    /// Replace status and body with `other`'s; headers from `other` override
    /// same-named ones already set (CORS, request id) and keep the rest.
    pub fn merge(&mut self, other: Response) {
        self.status = other.status;
        self.body = other.body;
        let mut last: Option<HeaderName> = None;
        for (name, value) in other.headers {
            match name {
                Some(n) => {
                    self.headers.insert(n.clone(), value);
                    last = Some(n);
                }
                None => {
                    if let Some(n) = &last {
                        self.headers.append(n, value);
                    }
                }
            }
        }
    }
}

/// Everything a middleware may read or augment for one request.
#[derive(Debug)]
pub struct RequestContext {
    pub request: Request,
    pub response: Response,
    pub request_id: Option<String>,
    /// Same token as `request.cancel`.
    pub cancel: CancellationToken,
    pub started_at: Instant,
    /// Matched route pattern, set by dispatch.
    pub route: Option<String>,
}

impl RequestContext {
    pub fn new(mut request: Request, cancel: CancellationToken) -> Self {
        request.cancel = cancel.clone();
        Self {
            request,
            response: Response::new(),
            request_id: None,
            cancel,
            started_at: Instant::now(),
            route: None,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_split_and_last_value_wins() {
        let (path, q) = split_target("/search?q=rust&page=1&q=tokio");
        assert_eq!(path, "/search");
        assert_eq!(q.get("q").map(String::as_str), Some("tokio"));
        assert_eq!(q.get("page").map(String::as_str), Some("1"));
    }

    #[test]
    fn query_values_are_decoded() {
        let (_, q) = split_target("/x?name=J%C3%BCrgen+B&flag");
        assert_eq!(q["name"], "Jürgen B");
        assert_eq!(q["flag"], "");
    }

    #[test]
    fn bare_target_without_query() {
        let req = Request::new(Method::GET, "/health");
        assert_eq!(req.pathname, "/health");
        assert!(req.query.is_empty());
        assert_eq!(req.body, Body::None);
    }

    #[test]
    fn fluent_response_builders() {
        let mut res = Response::new();
        res.status(StatusCode::CREATED)
            .header("x-trace", "abc")
            .json(&serde_json::json!({"id": 1}));
        assert_eq!(res.status_code(), StatusCode::CREATED);
        assert_eq!(res.headers()["content-type"], "application/json");
        assert_eq!(res.headers()["x-trace"], "abc");
        assert_eq!(res.body(), br#"{"id":1}"#);

        res.send("plain");
        assert_eq!(res.headers()["content-type"], "text/plain; charset=utf-8");
        assert_eq!(res.body(), b"plain");
    }

    #[test]
    fn invalid_header_is_dropped() {
        let mut res = Response::new();
        res.header("bad header", "v").header("ok", "line\nbreak");
        assert!(res.headers().is_empty());
    }

    #[test]
    fn merge_keeps_preset_headers() {
        let mut base = Response::new();
        base.header("access-control-allow-origin", "*")
            .header("x-request-id", "r1");

        let mut handler = Response::new();
        handler
            .status(StatusCode::ACCEPTED)
            .header("x-request-id", "r2")
            .send("ok");

        base.merge(handler);
        assert_eq!(base.status_code(), StatusCode::ACCEPTED);
        assert_eq!(base.headers()["access-control-allow-origin"], "*");
        assert_eq!(base.headers()["x-request-id"], "r2");
        assert_eq!(base.body(), b"ok");
    }

    #[test]
    fn json_body_helper() {
        #[derive(serde::Deserialize)]
        struct In {
            a: u32,
        }
        let mut req = Request::new(Method::POST, "/x");
        assert!(req.json::<In>().is_err());
        req.body = Body::Json(serde_json::json!({"a": 5}));
        assert_eq!(req.json::<In>().unwrap().a, 5);
    }
}
