//! HTTP ingress: wire parsing, routing, middleware and the server that ties
//! them together, hosted as a regular module so it starts after everything
//! it depends on and stops before them.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context as _;
use async_trait::async_trait;
use parking_lot::Mutex;

pub mod config;
pub mod cors;
pub mod middleware;
pub mod openapi;
pub mod parser;
pub mod request;
pub mod router;
pub mod server;

pub use config::{ApiIngressConfig, CorsConfig, IngressConfigError};
pub use cors::Cors;
pub use middleware::{
    Endpoint, Middleware, MiddlewareError, MiddlewareManager, Next, RequestIdMiddleware,
    TracingMiddleware, REQUEST_ID_HEADER,
};
pub use request::{Body, Request, RequestContext, Response};
pub use router::{Handler, RouteGroup, RouteOptions, Router, RouterError};
pub use server::{HttpServer, ServerOptions};

/// Name under which the ingress registers and reads its config section.
pub const MODULE_NAME: &str = "api_ingress";

/// Path the generated route description is served on when `enable_docs` is set.
pub const OPENAPI_PATH: &str = "/openapi.json";

pub struct ApiIngress {
    router: Mutex<Option<Router>>,
    middleware: Mutex<Option<MiddlewareManager>>,
    server: Mutex<Option<Arc<HttpServer>>>,
    config: Option<ApiIngressConfig>,
    default_bind: String,
    title: String,
    version: String,
}

impl ApiIngress {
    pub fn new(router: Router) -> Self {
        Self {
            router: Mutex::new(Some(router)),
            middleware: Mutex::new(None),
            server: Mutex::new(None),
            config: None,
            default_bind: "127.0.0.1:8087".to_string(),
            title: "Guildhall API".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// Extra middleware; the built-in request-id and tracing steps are
    /// added at init unless a middleware with the same name is present.
    pub fn with_middleware(self, middleware: MiddlewareManager) -> Self {
        *self.middleware.lock() = Some(middleware);
        self
    }

    /// Used when the config section leaves `bind_addr` empty.
    pub fn with_default_bind_addr(mut self, addr: impl Into<String>) -> Self {
        self.default_bind = addr.into();
        self
    }

    /// Skip the config section and use `config` as is.
    pub fn with_config(mut self, config: ApiIngressConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn with_docs_info(mut self, title: impl Into<String>, version: impl Into<String>) -> Self {
        self.title = title.into();
        self.version = version.into();
        self
    }

    /// Bound address once `init` has started the server.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.server.lock().as_ref().and_then(|s| s.local_addr())
    }

    fn load_config(&self, ctx: &modkit::ModuleCtx) -> anyhow::Result<ApiIngressConfig> {
        let cfg = match &self.config {
            Some(cfg) => cfg.clone(),
            None => ctx
                .module_config_optional::<ApiIngressConfig>()?
                .unwrap_or_default(),
        };
        cfg.validate()?;
        Ok(cfg)
    }

    fn mount_docs(&self, router: &mut Router) -> anyhow::Result<()> {
        let doc = serde_json::to_value(router.generate_spec(&self.title, &self.version))
            .context("failed to serialize route description")?;
        let doc = Arc::new(doc);
        router.register(
            http::Method::GET,
            OPENAPI_PATH,
            move |_req: Request| {
                let doc = doc.clone();
                async move {
                    let mut res = Response::new();
                    res.json(&*doc);
                    Ok::<_, anyhow::Error>(res)
                }
            },
            RouteOptions::new().describe("Route description").tag("docs"),
        )?;
        Ok(())
    }
}

fn with_builtins(mut mw: MiddlewareManager) -> anyhow::Result<MiddlewareManager> {
    if !mw.contains(RequestIdMiddleware::NAME) {
        mw.register(Arc::new(RequestIdMiddleware))?;
    }
    if !mw.contains(TracingMiddleware::NAME) {
        mw.register(Arc::new(TracingMiddleware))?;
    }
    Ok(mw)
}

#[async_trait]
impl modkit::Module for ApiIngress {
    async fn init(&self, ctx: &modkit::ModuleCtx) -> anyhow::Result<()> {
        let cfg = self.load_config(ctx)?;

        let bind = if cfg.bind_addr.trim().is_empty() {
            self.default_bind.clone()
        } else {
            cfg.bind_addr.clone()
        };
        let addr = tokio::net::lookup_host(&bind)
            .await
            .with_context(|| format!("cannot resolve bind address '{bind}'"))?
            .next()
            .ok_or_else(|| IngressConfigError::BindAddr {
                addr: bind.clone(),
                reason: "no addresses".to_string(),
            })?;

        let mut router = self
            .router
            .lock()
            .take()
            .context("api_ingress router already consumed")?;
        if cfg.enable_docs {
            self.mount_docs(&mut router)?;
        }
        let middleware = with_builtins(self.middleware.lock().take().unwrap_or_default())?;

        tracing::debug!(
            module = MODULE_NAME,
            routes = router.len(),
            middleware = ?middleware.names(),
            "starting HTTP ingress"
        );
        let server = Arc::new(
            HttpServer::new(router, middleware, ServerOptions::from(&cfg))
                .with_events(ctx.events().clone()),
        );
        server.start(addr).await?;
        *self.server.lock() = Some(server);
        Ok(())
    }

    async fn shutdown(&self, _ctx: &modkit::ModuleCtx) -> anyhow::Result<()> {
        let server = self.server.lock().clone();
        match server {
            Some(server) => server.stop().await,
            None => tracing::debug!(module = MODULE_NAME, "no server to stop"),
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use modkit::{ModuleCtxBuilder, ModuleDecl, ModuleManager};
    use tokio_util::sync::CancellationToken;

    fn ctx() -> modkit::ModuleCtx {
        ModuleCtxBuilder::new(CancellationToken::new()).build()
    }

    #[tokio::test]
    async fn init_serves_and_shutdown_stops() {
        let mut router = Router::new();
        router
            .get("/health", |_req: Request| async {
                let mut res = Response::new();
                res.json(&serde_json::json!({"status": "healthy"}));
                Ok::<_, anyhow::Error>(res)
            })
            .unwrap();
        let ingress = Arc::new(ApiIngress::new(router).with_default_bind_addr("127.0.0.1:0"));

        let mut mm = ModuleManager::new();
        mm.register(ModuleDecl::new(MODULE_NAME), ingress.clone()).unwrap();
        mm.initialize(&ctx()).await.unwrap();

        let addr = ingress.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
        let found = mm.get_as::<ApiIngress>(MODULE_NAME).unwrap();
        assert_eq!(found.local_addr(), Some(addr));

        mm.shutdown(&ctx()).await.unwrap();
        assert!(ingress.local_addr().is_none());
    }

    #[tokio::test]
    async fn invalid_cors_config_fails_init() {
        let cfg = ApiIngressConfig {
            bind_addr: "127.0.0.1:0".into(),
            cors: CorsConfig {
                allow_credentials: true,
                ..Default::default()
            },
            ..Default::default()
        };
        let ingress = ApiIngress::new(Router::new()).with_config(cfg);
        let err = modkit::Module::init(&ingress, &ctx()).await.unwrap_err();
        assert!(err.downcast_ref::<IngressConfigError>().is_some(), "{err:#}");
        assert!(ingress.local_addr().is_none());
    }

    #[test]
    fn builtins_added_once() {
        let mut mw = MiddlewareManager::new();
        mw.register(Arc::new(RequestIdMiddleware)).unwrap();
        let mw = with_builtins(mw).unwrap();
        assert_eq!(mw.names(), vec!["request_id", "tracing"]);
    }

    #[test]
    fn docs_route_is_mounted() {
        let ingress = ApiIngress::new(Router::new()).with_docs_info("Docs", "9.9.9");
        let mut router = Router::new();
        router.get("/users/:id", |_req: Request| async { Ok::<_, anyhow::Error>(Response::new()) }).unwrap();
        ingress.mount_docs(&mut router).unwrap();
        assert!(router.resolve(&http::Method::GET, OPENAPI_PATH).is_some());
    }
}
