//! Method + path-pattern routing.
//!
//! Patterns are `/`-separated literal segments and `:name` placeholders. A
//! placeholder matches exactly one non-empty segment. Resolution tries an
//! exact literal key first; otherwise the most specific matching pattern
//! wins (compared left to right, a literal segment beats a placeholder) and
//! registration order breaks the remaining ties.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use http::Method;
use thiserror::Error;

use crate::openapi::{self, OpenApi, OpenApiInfo, Operation, Parameter, ResponseSpec};
use crate::request::{Request, Response};

#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn call(&self, req: Request) -> anyhow::Result<Response>;
}

#[async_trait]
impl<F, Fut> Handler for F
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Response>> + Send + 'static,
{
    async fn call(&self, req: Request) -> anyhow::Result<Response> {
        (self)(req).await
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouterError {
    #[error("route '{0}' is already registered")]
    DuplicateRoute(String),
    #[error("invalid route pattern '{pattern}': {reason}")]
    InvalidPattern {
        pattern: String,
        reason: &'static str,
    },
}

/// Documentation and tagging attached to a route.
#[derive(Debug, Clone, Default)]
pub struct RouteOptions {
    pub description: Option<String>,
    pub tags: Vec<String>,
    /// Names of middleware this route expects (informational).
    pub middleware: Vec<String>,
}

impl RouteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn middleware(mut self, name: impl Into<String>) -> Self {
        self.middleware.push(name.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
}

pub struct Route {
    method: Method,
    pattern: String,
    segments: Vec<Segment>,
    options: RouteOptions,
    handler: Arc<dyn Handler>,
}

impl Route {
    pub fn method(&self) -> &Method {
        &self.method
    }
    pub fn pattern(&self) -> &str {
        &self.pattern
    }
    pub fn options(&self) -> &RouteOptions {
        &self.options
    }
    pub fn handler(&self) -> Arc<dyn Handler> {
        self.handler.clone()
    }
    pub fn key(&self) -> String {
        route_key(&self.method, &self.pattern)
    }

    fn param_names(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Param(n) => Some(n.as_str()),
            Segment::Literal(_) => None,
        })
    }

    fn match_segments(&self, path: &[&str]) -> Option<HashMap<String, String>> {
        if self.segments.len() != path.len() {
            return None;
        }
        let mut params = HashMap::new();
        for (seg, part) in self.segments.iter().zip(path) {
            match seg {
                Segment::Literal(lit) if lit == part => {}
                Segment::Literal(_) => return None,
                Segment::Param(name) => {
                    let value = urlencoding::decode(part)
                        .map(|v| v.into_owned())
                        .unwrap_or_else(|_| (*part).to_string());
                    params.insert(name.clone(), value);
                }
            }
        }
        Some(params)
    }

    // literal = 1, placeholder = 0, compared lexicographically
    fn specificity(&self) -> Vec<u8> {
        self.segments
            .iter()
            .map(|s| matches!(s, Segment::Literal(_)) as u8)
            .collect()
    }
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route")
            .field("method", &self.method)
            .field("pattern", &self.pattern)
            .field("options", &self.options)
            .finish()
    }
}

#[derive(Debug)]
pub struct RouteMatch<'r> {
    pub route: &'r Route,
    pub params: HashMap<String, String>,
}

fn route_key(method: &Method, pattern: &str) -> String {
    format!("{}:{}", method.as_str().to_ascii_uppercase(), pattern)
}

/// Leading slash added, trailing slash removed (except for `/`).
pub fn normalize_path(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

fn split_segments(path: &str) -> Vec<&str> {
    if path == "/" {
        Vec::new()
    } else {
        path[1..].split('/').collect()
    }
}

fn parse_pattern(pattern: &str) -> Result<Vec<Segment>, RouterError> {
    let invalid = |reason| RouterError::InvalidPattern {
        pattern: pattern.to_string(),
        reason,
    };

    let mut seen = Vec::new();
    let mut out = Vec::new();
    for seg in split_segments(pattern) {
        if seg.is_empty() {
            return Err(invalid("empty segment"));
        }
        match seg.strip_prefix(':') {
            Some(name) => {
                if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                    return Err(invalid("parameter names must be [A-Za-z0-9_]+"));
                }
                if seen.contains(&name) {
                    return Err(invalid("duplicate parameter name"));
                }
                seen.push(name);
                out.push(Segment::Param(name.to_string()));
            }
            None => out.push(Segment::Literal(seg.to_string())),
        }
    }
    Ok(out)
}

#[derive(Default)]
pub struct Router {
    routes: Vec<Route>,
    // METHOD:pattern -> index, every route
    keys: HashMap<String, usize>,
    // METHOD:path -> index, routes without placeholders
    literal: HashMap<String, usize>,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field(
                "routes",
                &self.routes.iter().map(Route::key).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<H: Handler>(
        &mut self,
        method: Method,
        pattern: &str,
        handler: H,
        options: RouteOptions,
    ) -> Result<(), RouterError> {
        self.register_arc(method, pattern, Arc::new(handler), options)
    }

    pub fn register_arc(
        &mut self,
        method: Method,
        pattern: &str,
        handler: Arc<dyn Handler>,
        options: RouteOptions,
    ) -> Result<(), RouterError> {
        if !pattern.starts_with('/') {
            return Err(RouterError::InvalidPattern {
                pattern: pattern.to_string(),
                reason: "must start with '/'",
            });
        }
        let pattern = normalize_path(pattern);
        let segments = parse_pattern(&pattern)?;
        let key = route_key(&method, &pattern);
        if self.keys.contains_key(&key) {
            return Err(RouterError::DuplicateRoute(key));
        }

        let idx = self.routes.len();
        if segments.iter().all(|s| matches!(s, Segment::Literal(_))) {
            self.literal.insert(key.clone(), idx);
        }
        self.keys.insert(key.clone(), idx);
        tracing::debug!(route = %key, "route registered");
        self.routes.push(Route {
            method,
            pattern,
            segments,
            options,
            handler,
        });
        Ok(())
    }

    pub fn get<H: Handler>(&mut self, pattern: &str, handler: H) -> Result<(), RouterError> {
        self.register(Method::GET, pattern, handler, RouteOptions::default())
    }

    pub fn post<H: Handler>(&mut self, pattern: &str, handler: H) -> Result<(), RouterError> {
        self.register(Method::POST, pattern, handler, RouteOptions::default())
    }

    pub fn put<H: Handler>(&mut self, pattern: &str, handler: H) -> Result<(), RouterError> {
        self.register(Method::PUT, pattern, handler, RouteOptions::default())
    }

    pub fn patch<H: Handler>(&mut self, pattern: &str, handler: H) -> Result<(), RouterError> {
        self.register(Method::PATCH, pattern, handler, RouteOptions::default())
    }

    pub fn delete<H: Handler>(&mut self, pattern: &str, handler: H) -> Result<(), RouterError> {
        self.register(Method::DELETE, pattern, handler, RouteOptions::default())
    }

    /// Register under a common prefix; storage stays in this router.
    pub fn group(&mut self, prefix: &str) -> RouteGroup<'_> {
        RouteGroup {
            router: self,
            prefix: normalize_path(prefix),
        }
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// `HEAD` falls back to the `GET` route when none is registered for it.
    pub fn resolve(&self, method: &Method, path: &str) -> Option<RouteMatch<'_>> {
        self.resolve_exact_method(method, path).or_else(|| {
            (*method == Method::HEAD)
                .then(|| self.resolve_exact_method(&Method::GET, path))
                .flatten()
        })
    }

    fn resolve_exact_method(&self, method: &Method, path: &str) -> Option<RouteMatch<'_>> {
        let path = normalize_path(path);

        if let Some(&i) = self.literal.get(&route_key(method, &path)) {
            return Some(RouteMatch {
                route: &self.routes[i],
                params: HashMap::new(),
            });
        }

        let parts = split_segments(&path);
        if parts.iter().any(|p| p.is_empty()) {
            return None;
        }

        let mut best: Option<(Vec<u8>, RouteMatch<'_>)> = None;
        for route in self.routes.iter().filter(|r| r.method == *method) {
            let Some(params) = route.match_segments(&parts) else {
                continue;
            };
            let spec = route.specificity();
            // strictly greater keeps the earlier registration on ties
            if best.as_ref().map_or(true, |(b, _)| spec > *b) {
                best = Some((spec, RouteMatch { route, params }));
            }
        }
        best.map(|(_, m)| m)
    }

    /// OpenAPI 3 description of every registered route.
    pub fn generate_spec(&self, title: &str, version: &str) -> OpenApi {
        let mut paths: BTreeMap<String, BTreeMap<String, Operation>> = BTreeMap::new();
        for route in &self.routes {
            let parameters = route
                .param_names()
                .map(|name| Parameter {
                    name: name.to_string(),
                    location: "path",
                    required: true,
                    schema: serde_json::json!({ "type": "string" }),
                })
                .collect();
            let op = Operation {
                operation_id: route.key(),
                summary: route.options.description.clone(),
                tags: route.options.tags.clone(),
                parameters,
                responses: BTreeMap::from([(
                    "200".to_string(),
                    ResponseSpec {
                        description: "OK".to_string(),
                    },
                )]),
            };
            paths
                .entry(openapi::openapi_path(&route.pattern))
                .or_default()
                .insert(route.method.as_str().to_ascii_lowercase(), op);
        }

        tracing::debug!(operations = self.routes.len(), "route description generated");
        OpenApi {
            openapi: "3.0.3",
            info: OpenApiInfo {
                title: title.to_string(),
                version: version.to_string(),
                description: None,
            },
            paths,
        }
    }
}

/// Prefixing view over a [`Router`].
pub struct RouteGroup<'r> {
    router: &'r mut Router,
    prefix: String,
}

impl RouteGroup<'_> {
    fn full(&self, pattern: &str) -> String {
        let tail = normalize_path(pattern);
        match (self.prefix.as_str(), tail.as_str()) {
            ("/", t) => t.to_string(),
            (p, "/") => p.to_string(),
            (p, t) => format!("{p}{t}"),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn register<H: Handler>(
        &mut self,
        method: Method,
        pattern: &str,
        handler: H,
        options: RouteOptions,
    ) -> Result<(), RouterError> {
        let full = self.full(pattern);
        self.router.register(method, &full, handler, options)
    }

    pub fn get<H: Handler>(&mut self, pattern: &str, handler: H) -> Result<(), RouterError> {
        self.register(Method::GET, pattern, handler, RouteOptions::default())
    }

    pub fn post<H: Handler>(&mut self, pattern: &str, handler: H) -> Result<(), RouterError> {
        self.register(Method::POST, pattern, handler, RouteOptions::default())
    }

    pub fn put<H: Handler>(&mut self, pattern: &str, handler: H) -> Result<(), RouterError> {
        self.register(Method::PUT, pattern, handler, RouteOptions::default())
    }

    pub fn patch<H: Handler>(&mut self, pattern: &str, handler: H) -> Result<(), RouterError> {
        self.register(Method::PATCH, pattern, handler, RouteOptions::default())
    }

    pub fn delete<H: Handler>(&mut self, pattern: &str, handler: H) -> Result<(), RouterError> {
        self.register(Method::DELETE, pattern, handler, RouteOptions::default())
    }

    pub fn group(&mut self, prefix: &str) -> RouteGroup<'_> {
        let prefix = self.full(prefix);
        RouteGroup {
            router: &mut *self.router,
            prefix,
        }
    }
}
