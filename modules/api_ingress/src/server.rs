//! Connection acceptor and request dispatch.
//!
//! One request per connection: parse, run CORS + middleware + routing under
//! the request deadline, write the response with `Connection: close`.

use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use http::{Method, StatusCode};
use modkit::{LifecycleBus, LifecycleEvent};
use tokio::io::{AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::config::ApiIngressConfig;
use crate::cors::Cors;
use crate::middleware::{Endpoint, MiddlewareManager};
use crate::parser::{self, ParseLimits};
use crate::request::{Request, RequestContext, Response};
use crate::router::Router;

/// How long in-flight connections may finish after `stop()`.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub request_timeout: Option<Duration>,
    pub limits: ParseLimits,
    pub cors: Cors,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self::from(&ApiIngressConfig::default())
    }
}

impl From<&ApiIngressConfig> for ServerOptions {
    fn from(cfg: &ApiIngressConfig) -> Self {
        Self {
            request_timeout: cfg.request_timeout(),
            limits: ParseLimits {
                max_header_bytes: cfg.max_header_bytes,
                max_body_bytes: cfg.max_body_bytes,
            },
            cors: Cors::new(&cfg.cors),
        }
    }
}

struct Shared {
    router: Router,
    middleware: MiddlewareManager,
    opts: ServerOptions,
}

struct Running {
    addr: SocketAddr,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct HttpServer {
    shared: Arc<Shared>,
    running: tokio::sync::Mutex<Option<Running>>,
    addr: parking_lot::Mutex<Option<SocketAddr>>,
    events: Option<LifecycleBus>,
}

impl std::fmt::Debug for HttpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpServer")
            .field("router", &self.shared.router)
            .field("middleware", &self.shared.middleware)
            .field("addr", &*self.addr.lock())
            .finish()
    }
}

impl HttpServer {
    pub fn new(router: Router, middleware: MiddlewareManager, opts: ServerOptions) -> Self {
        Self {
            shared: Arc::new(Shared {
                router,
                middleware,
                opts,
            }),
            running: tokio::sync::Mutex::new(None),
            addr: parking_lot::Mutex::new(None),
            events: None,
        }
    }

    pub fn with_events(mut self, events: LifecycleBus) -> Self {
        self.events = Some(events);
        self
    }

    fn publish(&self, ev: LifecycleEvent) {
        if let Some(bus) = &self.events {
            bus.publish(ev);
        }
    }

    /// Bind and start accepting. A second call while running only warns and
    /// returns the address already bound.
    pub async fn start(&self, addr: SocketAddr) -> anyhow::Result<SocketAddr> {
        let mut running = self.running.lock().await;
        if let Some(r) = running.as_ref() {
            tracing::warn!(addr = %r.addr, "HTTP server already running; start() ignored");
            return Ok(r.addr);
        }

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| anyhow::anyhow!("failed to bind {addr}: {e}"))?;
        let bound = listener.local_addr()?;
        let cancel = CancellationToken::new();
        let task = tokio::spawn(accept_loop(listener, self.shared.clone(), cancel.clone()));

        *running = Some(Running {
            addr: bound,
            cancel,
            task,
        });
        *self.addr.lock() = Some(bound);
        tracing::info!(addr = %bound, routes = self.shared.router.len(), "HTTP server listening");
        self.publish(LifecycleEvent::ServerStarted { addr: bound });
        Ok(bound)
    }

    /// Stop accepting and wait for in-flight connections (bounded).
    /// A call while not running only warns.
    pub async fn stop(&self) {
        let Some(r) = self.running.lock().await.take() else {
            tracing::warn!("HTTP server not running; stop() ignored");
            return;
        };
        r.cancel.cancel();
        if let Err(e) = r.task.await {
            tracing::warn!(error = %e, "HTTP accept loop ended abnormally");
        }
        *self.addr.lock() = None;
        tracing::info!(addr = %r.addr, "HTTP server stopped");
        self.publish(LifecycleEvent::ServerStopped);
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.addr.lock()
    }

    pub fn is_running(&self) -> bool {
        self.addr.lock().is_some()
    }

    pub fn router(&self) -> &Router {
        &self.shared.router
    }

    /// Run one parsed request through CORS, middleware and routing.
    pub async fn handle(&self, req: Request) -> Response {
        self.shared.handle(req).await
    }
}

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>, cancel: CancellationToken) {
    let mut conns = JoinSet::new();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let shared = shared.clone();
                    conns.spawn(async move {
                        if let Err(e) = serve_connection(stream, peer, &shared).await {
                            tracing::debug!(peer = %peer, error = %e, "connection ended with I/O error");
                        }
                    });
                }
                Err(e) => {
                    // fd exhaustion and friends; back off instead of spinning
                    tracing::warn!(error = %e, "accept failed");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            },
            Some(joined) = conns.join_next(), if !conns.is_empty() => {
                if let Err(e) = joined {
                    if e.is_panic() {
                        tracing::error!(error = %e, "connection task panicked");
                    }
                }
            }
        }
    }
    drop(listener);

    let in_flight = conns.len();
    if in_flight > 0 {
        tracing::debug!(in_flight, "draining connections");
        let drain = async { while conns.join_next().await.is_some() {} };
        if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
            tracing::warn!("connections still open after drain timeout; aborting");
            conns.abort_all();
        }
    }
}

async fn serve_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    shared: &Shared,
) -> std::io::Result<()> {
    let (rd, mut wr) = stream.split();
    let mut reader = BufReader::new(rd);

    let read = parser::read_request(&mut reader, &shared.opts.limits);
    let parsed = match shared.opts.request_timeout {
        Some(limit) => match tokio::time::timeout(limit, read).await {
            Ok(parsed) => parsed,
            Err(_) => {
                tracing::warn!(peer = %peer, timeout_ms = limit.as_millis() as u64, "request not received in time");
                let res = shared.failure(Response::new(), StatusCode::REQUEST_TIMEOUT);
                write_response(&mut wr, &res, false).await?;
                return wr.shutdown().await;
            }
        },
        None => read.await,
    };

    let (res, head_only) = match parsed {
        Ok(req) => {
            let head_only = req.method == Method::HEAD;
            let res = match AssertUnwindSafe(shared.handle(req)).catch_unwind().await {
                Ok(res) => res,
                Err(_) => {
                    tracing::error!(peer = %peer, "handler panicked");
                    shared.failure(Response::new(), StatusCode::INTERNAL_SERVER_ERROR)
                }
            };
            (res, head_only)
        }
        Err(e) => match e.status() {
            None => {
                tracing::trace!(peer = %peer, error = %e, "connection closed without a request");
                return Ok(());
            }
            Some(status) => {
                tracing::warn!(peer = %peer, error = %e, status = status.as_u16(), "rejecting request");
                (shared.failure(Response::new(), status), false)
            }
        },
    };

    write_response(&mut wr, &res, head_only).await?;
    wr.shutdown().await
}

impl Shared {
    /// `{"error": "<reason phrase>"}` on top of `base`, CORS included.
    fn failure(&self, mut base: Response, status: StatusCode) -> Response {
        self.opts.cors.apply(&mut base);
        base.status(status).json(&serde_json::json!({
            "error": status.canonical_reason().unwrap_or("Error")
        }));
        base
    }

    async fn handle(&self, req: Request) -> Response {
        let cancel = CancellationToken::new();
        let mut ctx = RequestContext::new(req, cancel.clone());
        self.opts.cors.apply(&mut ctx.response);

        if ctx.request.method == Method::OPTIONS {
            ctx.response.status(StatusCode::OK);
            return ctx.response;
        }

        let endpoint = Dispatch {
            router: &self.router,
        };
        let run = self.middleware.execute(&mut ctx, &endpoint);
        let outcome = match self.opts.request_timeout {
            Some(limit) => tokio::time::timeout(limit, run).await.ok(),
            None => Some(run.await),
        };

        match outcome {
            Some(Ok(())) => ctx.response,
            Some(Err(e)) => {
                tracing::error!(
                    method = %ctx.request.method,
                    path = %ctx.request.pathname,
                    request_id = ctx.request_id.as_deref().unwrap_or("n/a"),
                    error = format!("{e:#}"),
                    "request failed"
                );
                self.failure(ctx.response, StatusCode::INTERNAL_SERVER_ERROR)
            }
            None => {
                cancel.cancel();
                tracing::warn!(
                    method = %ctx.request.method,
                    path = %ctx.request.pathname,
                    timeout = ?self.opts.request_timeout,
                    "request deadline exceeded"
                );
                self.failure(ctx.response, StatusCode::REQUEST_TIMEOUT)
            }
        }
    }
}

/// Last link of the middleware chain: route lookup and handler call.
struct Dispatch<'r> {
    router: &'r Router,
}

#[async_trait]
impl Endpoint for Dispatch<'_> {
    async fn call(&self, ctx: &mut RequestContext) -> anyhow::Result<()> {
        let Some(found) = self.router.resolve(&ctx.request.method, &ctx.request.pathname) else {
            ctx.response.merge(Response::error(StatusCode::NOT_FOUND, "Not Found"));
            return Ok(());
        };
        ctx.route = Some(found.route.pattern().to_string());
        ctx.request.params = found.params;
        let res = found.route.handler().call(ctx.request.clone()).await?;
        ctx.response.merge(res);
        Ok(())
    }
}

/// Serialize status line, headers and body. Framing headers are always ours.
pub fn encode_response(res: &Response, head_only: bool) -> Vec<u8> {
    let status = res.status_code();
    let bodyless = status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED;

    let mut out = Vec::with_capacity(256 + res.body().len());
    out.extend_from_slice(
        format!(
            "HTTP/1.1 {} {}\r\n",
            status.as_u16(),
            status.canonical_reason().unwrap_or("")
        )
        .as_bytes(),
    );
    for (name, value) in res.headers() {
        if matches!(
            name.as_str(),
            "content-length" | "connection" | "transfer-encoding"
        ) {
            continue;
        }
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    if !bodyless {
        out.extend_from_slice(format!("content-length: {}\r\n", res.body().len()).as_bytes());
    }
    out.extend_from_slice(b"connection: close\r\n\r\n");
    if !head_only && !bodyless {
        out.extend_from_slice(res.body());
    }
    out
}

async fn write_response<W>(w: &mut W, res: &Response, head_only: bool) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    w.write_all(&encode_response(res, head_only)).await?;
    w.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::{Middleware, Next};
    use crate::request::Body;
    use serde_json::json;

    async fn health(_req: Request) -> anyhow::Result<Response> {
        let mut res = Response::new();
        res.json(&json!({"status": "healthy"}));
        Ok(res)
    }

    fn server(router: Router, mw: MiddlewareManager, opts: ServerOptions) -> HttpServer {
        HttpServer::new(router, mw, opts)
    }

    fn body_json(res: &Response) -> serde_json::Value {
        serde_json::from_slice(res.body()).unwrap()
    }

    #[tokio::test]
    async fn routed_request_gets_cors_and_handler_body() {
        let mut r = Router::new();
        r.get("/health", health).unwrap();
        let s = server(r, MiddlewareManager::new(), ServerOptions::default());

        let res = s.handle(Request::new(Method::GET, "/health")).await;
        assert_eq!(res.status_code(), StatusCode::OK);
        assert_eq!(body_json(&res), json!({"status": "healthy"}));
        assert_eq!(res.headers()["access-control-allow-origin"], "*");
    }

    #[tokio::test]
    async fn unknown_route_is_404_json() {
        let s = server(Router::new(), MiddlewareManager::new(), ServerOptions::default());
        let res = s.handle(Request::new(Method::GET, "/nope")).await;
        assert_eq!(res.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(&res), json!({"error": "Not Found"}));
    }

    #[tokio::test]
    async fn handler_error_is_500_without_details() {
        let mut r = Router::new();
        r.get("/boom", |_req: Request| async {
            Err::<Response, _>(anyhow::anyhow!("db password is hunter2"))
        })
        .unwrap();
        let s = server(r, MiddlewareManager::new(), ServerOptions::default());

        let res = s.handle(Request::new(Method::GET, "/boom")).await;
        assert_eq!(res.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body_json(&res), json!({"error": "Internal Server Error"}));
    }

    #[tokio::test]
    async fn slow_handler_hits_deadline() {
        let mut r = Router::new();
        r.get("/slow", |_req: Request| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, anyhow::Error>(Response::new())
        })
        .unwrap();
        let opts = ServerOptions {
            request_timeout: Some(Duration::from_millis(20)),
            ..Default::default()
        };
        let s = server(r, MiddlewareManager::new(), opts);

        let res = s.handle(Request::new(Method::GET, "/slow")).await;
        assert_eq!(res.status_code(), StatusCode::REQUEST_TIMEOUT);
        assert_eq!(body_json(&res), json!({"error": "Request Timeout"}));
    }

    #[tokio::test]
    async fn deadline_cancels_work_spawned_by_handler() {
        let done = Arc::new(tokio::sync::Notify::new());
        let seen = done.clone();
        let mut r = Router::new();
        r.get("/slow", move |req: Request| {
            let seen = seen.clone();
            async move {
                assert!(!req.cancel.is_cancelled());
                tokio::spawn(async move {
                    req.cancel.cancelled().await;
                    seen.notify_one();
                });
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, anyhow::Error>(Response::new())
            }
        })
        .unwrap();
        let opts = ServerOptions {
            request_timeout: Some(Duration::from_millis(20)),
            ..Default::default()
        };
        let s = server(r, MiddlewareManager::new(), opts);

        let res = s.handle(Request::new(Method::GET, "/slow")).await;
        assert_eq!(res.status_code(), StatusCode::REQUEST_TIMEOUT);
        tokio::time::timeout(Duration::from_secs(1), done.notified())
            .await
            .expect("spawned work was not cancelled");
    }

    struct Deny;

    #[async_trait]
    impl Middleware for Deny {
        fn name(&self) -> &str {
            "deny"
        }
        async fn execute(&self, ctx: &mut RequestContext, _next: Next<'_>) -> anyhow::Result<()> {
            ctx.response.status(StatusCode::FORBIDDEN).send("no");
            Ok(())
        }
    }

    #[tokio::test]
    async fn options_bypasses_middleware_and_routing() {
        let mut mw = MiddlewareManager::new();
        mw.register(Arc::new(Deny)).unwrap();
        let s = server(Router::new(), mw, ServerOptions::default());

        let res = s.handle(Request::new(Method::OPTIONS, "/anything")).await;
        assert_eq!(res.status_code(), StatusCode::OK);
        assert!(res.body().is_empty());
        assert!(res.headers().contains_key("access-control-allow-methods"));

        let res = s.handle(Request::new(Method::GET, "/anything")).await;
        assert_eq!(res.status_code(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn params_reach_the_handler() {
        let mut r = Router::new();
        r.post("/users/:id", |req: Request| async move {
            let mut res = Response::new();
            res.json(&json!({
                "id": req.param("id"),
                "body": req.body.as_json(),
            }));
            Ok::<_, anyhow::Error>(res)
        })
        .unwrap();
        let s = server(r, MiddlewareManager::new(), ServerOptions::default());

        let mut req = Request::new(Method::POST, "/users/42");
        req.body = Body::Json(json!({"a": 1}));
        let res = s.handle(req).await;
        assert_eq!(body_json(&res), json!({"id": "42", "body": {"a": 1}}));
    }

    #[test]
    fn encoding_sets_framing_headers() {
        let mut res = Response::new();
        res.header("content-length", "999").send("hi");
        let wire = String::from_utf8(encode_response(&res, false)).unwrap();
        assert!(wire.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(wire.contains("content-length: 2\r\n"));
        assert!(!wire.contains("999"));
        assert!(wire.contains("connection: close\r\n"));
        assert!(wire.ends_with("\r\n\r\nhi"));

        let head = String::from_utf8(encode_response(&res, true)).unwrap();
        assert!(head.contains("content-length: 2\r\n"));
        assert!(head.ends_with("\r\n\r\n"));

        let mut empty = Response::new();
        empty.status(StatusCode::NO_CONTENT);
        let wire = String::from_utf8(encode_response(&empty, false)).unwrap();
        assert!(!wire.contains("content-length"));
    }

    #[tokio::test]
    async fn start_stop_are_idempotent() {
        let s = server(Router::new(), MiddlewareManager::new(), ServerOptions::default());
        let bus = LifecycleBus::default();
        let mut rx = bus.subscribe();
        let s = s.with_events(bus);

        s.stop().await; // not running: warning only
        let addr = s.start("127.0.0.1:0".parse().unwrap()).await.unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(s.local_addr(), Some(addr));
        assert_eq!(s.start("127.0.0.1:0".parse().unwrap()).await.unwrap(), addr);

        s.stop().await;
        s.stop().await;
        assert!(!s.is_running());
        assert_eq!(rx.recv().await.unwrap(), LifecycleEvent::ServerStarted { addr });
        assert_eq!(rx.recv().await.unwrap(), LifecycleEvent::ServerStopped);
        assert!(rx.try_recv().is_err());
    }
}
