//! Priority-ordered middleware chain.
//!
//! Middleware run in descending priority (ties keep registration order). Each
//! one receives the request context and a [`Next`] continuation; not calling
//! `next.run(ctx)` short-circuits every lower-priority middleware and the
//! terminal endpoint.

use std::cmp::Reverse;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::Instrument;

use crate::request::RequestContext;

#[async_trait]
pub trait Middleware: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Higher runs earlier.
    fn priority(&self) -> i32 {
        0
    }

    async fn execute(&self, ctx: &mut RequestContext, next: Next<'_>) -> anyhow::Result<()>;
}

/// Terminal step invoked once every middleware called `next`.
#[async_trait]
pub trait Endpoint: Send + Sync {
    async fn call(&self, ctx: &mut RequestContext) -> anyhow::Result<()>;
}

/// Continuation over the rest of the chain.
pub struct Next<'a> {
    chain: &'a [Arc<dyn Middleware>],
    endpoint: Option<&'a dyn Endpoint>,
}

impl Next<'_> {
    pub async fn run(self, ctx: &mut RequestContext) -> anyhow::Result<()> {
        match self.chain.split_first() {
            Some((head, rest)) => {
                let next = Next {
                    chain: rest,
                    endpoint: self.endpoint,
                };
                head.execute(ctx, next).await
            }
            None => match self.endpoint {
                Some(endpoint) => endpoint.call(ctx).await,
                None => Ok(()),
            },
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MiddlewareError {
    #[error("middleware '{0}' is already registered")]
    DuplicateName(String),
    #[error("middleware '{0}' is not registered")]
    NotFound(String),
}

#[derive(Default)]
pub struct MiddlewareManager {
    chain: Vec<Arc<dyn Middleware>>,
}

impl std::fmt::Debug for MiddlewareManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

impl MiddlewareManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, middleware: Arc<dyn Middleware>) -> Result<(), MiddlewareError> {
        if self.contains(middleware.name()) {
            return Err(MiddlewareError::DuplicateName(middleware.name().to_string()));
        }
        tracing::debug!(
            middleware = middleware.name(),
            priority = middleware.priority(),
            "middleware registered"
        );
        self.chain.push(middleware);
        // stable: equal priorities keep insertion order
        self.chain.sort_by_key(|m| Reverse(m.priority()));
        Ok(())
    }

    pub fn unregister(&mut self, name: &str) -> Result<Arc<dyn Middleware>, MiddlewareError> {
        let pos = self
            .chain
            .iter()
            .position(|m| m.name() == name)
            .ok_or_else(|| MiddlewareError::NotFound(name.to_string()))?;
        Ok(self.chain.remove(pos))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.chain.iter().any(|m| m.name() == name)
    }

    /// Names in execution order.
    pub fn names(&self) -> Vec<&str> {
        self.chain.iter().map(|m| m.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.chain.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chain.is_empty()
    }

    /// Run the chain with `endpoint` as its last link. An error from any
    /// middleware aborts the chain and is returned to the caller.
    pub async fn execute(
        &self,
        ctx: &mut RequestContext,
        endpoint: &dyn Endpoint,
    ) -> anyhow::Result<()> {
        Next {
            chain: &self.chain,
            endpoint: Some(endpoint),
        }
        .run(ctx)
        .await
    }

    /// Run the chain alone; exhausting it simply returns.
    pub async fn execute_chain(&self, ctx: &mut RequestContext) -> anyhow::Result<()> {
        Next {
            chain: &self.chain,
            endpoint: None,
        }
        .run(ctx)
        .await
    }
}

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Propagates a sane incoming `x-request-id` or generates one, and echoes it
/// on the response.
#[derive(Debug, Default)]
pub struct RequestIdMiddleware;

impl RequestIdMiddleware {
    pub const NAME: &'static str = "request_id";

    fn accept(id: &str) -> bool {
        !id.is_empty()
            && id.len() <= 128
            && id
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b':'))
    }
}

#[async_trait]
impl Middleware for RequestIdMiddleware {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn priority(&self) -> i32 {
        1000
    }

    async fn execute(&self, ctx: &mut RequestContext, next: Next<'_>) -> anyhow::Result<()> {
        let id = ctx
            .request
            .header(REQUEST_ID_HEADER)
            .filter(|id| Self::accept(id))
            .map(str::to_owned)
            .unwrap_or_else(|| nanoid::nanoid!());
        ctx.response.header(REQUEST_ID_HEADER, &id);
        ctx.request_id = Some(id);
        next.run(ctx).await
    }
}

/// Access log: one span per request plus a completion record with status and latency.
#[derive(Debug, Default)]
pub struct TracingMiddleware;

impl TracingMiddleware {
    pub const NAME: &'static str = "tracing";
}

#[async_trait]
impl Middleware for TracingMiddleware {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn priority(&self) -> i32 {
        900
    }

    async fn execute(&self, ctx: &mut RequestContext, next: Next<'_>) -> anyhow::Result<()> {
        let span = tracing::info_span!(
            "http_request",
            method = %ctx.request.method,
            path = %ctx.request.pathname,
            request_id = ctx.request_id.as_deref().unwrap_or("n/a"),
        );
        let result = next.run(ctx).instrument(span.clone()).await;

        let latency_ms = ctx.elapsed().as_millis() as u64;
        span.in_scope(|| match &result {
            Ok(()) => tracing::info!(
                status = ctx.response.status_code().as_u16(),
                route = ctx.route.as_deref().unwrap_or("-"),
                latency_ms,
                "request completed"
            ),
            Err(e) => tracing::warn!(error = %e, latency_ms, "request failed"),
        });
        result
    }
}
