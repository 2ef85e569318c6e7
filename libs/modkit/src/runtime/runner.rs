//! Composition root for a modkit process.
//!
//! One `ModuleCtx` is built per run and reused for every phase:
//! modules init (dependency order) -> services init (concurrent) -> wait ->
//! services shutdown -> modules shutdown (reverse order).
//! Shutdown can be driven by OS signals, an external `CancellationToken`,
//! or an arbitrary future.

use anyhow::Context;
use std::{future::Future, pin::Pin, sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;

use crate::context::{ConfigProvider, ModuleCtx, ModuleCtxBuilder};
use crate::contracts::{Module, Service};
use crate::events::LifecycleBus;
use crate::registry::{ModuleDecl, ModuleManager, RegistryError};
use crate::runtime::shutdown;
use crate::services::{ServiceError, ServiceManager};

pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// How the application decides when to stop.
pub enum ShutdownOptions {
    /// Listen for OS signals (Ctrl+C / SIGTERM).
    Signals,
    /// An external `CancellationToken` controls the lifecycle.
    Token(CancellationToken),
    /// An arbitrary future; when it completes, we initiate shutdown.
    Future(Pin<Box<dyn Future<Output = ()> + Send>>),
}

pub struct Application {
    modules: ModuleManager,
    services: ServiceManager,
    events: LifecycleBus,
    config: Option<Arc<dyn ConfigProvider>>,
    shutdown_timeout: Duration,
}

impl Default for Application {
    fn default() -> Self {
        Self::new()
    }
}

impl Application {
    pub fn new() -> Self {
        let events = LifecycleBus::default();
        Self {
            modules: ModuleManager::new(),
            services: ServiceManager::new().with_events(events.clone()),
            events,
            config: None,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }

    pub fn with_config_provider(mut self, provider: Arc<dyn ConfigProvider>) -> Self {
        self.config = Some(provider);
        self
    }

    /// Upper bound for the whole stop phase (services + modules).
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn events(&self) -> &LifecycleBus {
        &self.events
    }

    pub fn modules(&self) -> &ModuleManager {
        &self.modules
    }

    pub fn services(&self) -> &ServiceManager {
        &self.services
    }

    pub fn register_module(
        &mut self,
        decl: ModuleDecl,
        module: Arc<dyn Module>,
    ) -> Result<(), RegistryError> {
        self.modules.register(decl, module)
    }

    pub fn register_service(&mut self, service: Arc<dyn Service>) -> Result<(), ServiceError> {
        self.services.register(service)
    }

    fn base_ctx(&self, cancel: CancellationToken) -> ModuleCtx {
        let mut builder = ModuleCtxBuilder::new(cancel).with_events(self.events.clone());
        if let Some(p) = &self.config {
            builder = builder.with_config_provider(p.clone());
        }
        builder.build()
    }

    /// Full cycle. Returns once everything that was started has been stopped,
    /// or with the first startup error.
    pub async fn run(&self, opts: ShutdownOptions) -> anyhow::Result<()> {
        let cancel = match &opts {
            ShutdownOptions::Token(t) => t.clone(),
            _ => CancellationToken::new(),
        };

        match opts {
            ShutdownOptions::Signals => {
                let c = cancel.clone();
                tokio::spawn(async move {
                    if let Err(e) = shutdown::wait_for_shutdown().await {
                        tracing::warn!(
                            error = %e,
                            "shutdown: primary waiter failed; falling back to ctrl_c()"
                        );
                        let _ = tokio::signal::ctrl_c().await;
                    }
                    c.cancel();
                });
            }
            ShutdownOptions::Future(waiter) => {
                let c = cancel.clone();
                tokio::spawn(async move {
                    waiter.await;
                    tracing::info!("shutdown: external future completed");
                    c.cancel();
                });
            }
            ShutdownOptions::Token(_) => {
                tracing::debug!("shutdown: external token will control lifecycle");
            }
        }

        let ctx = self.base_ctx(cancel.clone());

        tracing::info!(modules = self.modules.len(), "Phase: init (modules)");
        self.modules
            .initialize(&ctx)
            .await
            .context("module initialization failed")?;

        tracing::info!(services = self.services.len(), "Phase: init (services)");
        if let Err(e) = self.services.initialize().await {
            // modules are fully up at this point; give them their shutdown
            if let Err(stop_err) = self.modules.shutdown(&ctx).await {
                tracing::warn!(error = %stop_err, "module shutdown after service failure was incomplete");
            }
            return Err(anyhow::Error::new(e).context("service initialization failed"));
        }

        tracing::info!("Application started");
        cancel.cancelled().await;

        tracing::info!(timeout = ?self.shutdown_timeout, "Phase: stop");
        let stop = async {
            self.services.shutdown().await;
            self.modules.shutdown(&ctx).await
        };
        match tokio::time::timeout(self.shutdown_timeout, stop).await {
            Ok(Ok(())) => {
                tracing::info!("Application stopped");
                Ok(())
            }
            Ok(Err(e)) => Err(anyhow::Error::new(e).context("shutdown failed")),
            Err(_) => anyhow::bail!("shutdown did not finish within {:?}", self.shutdown_timeout),
        }
    }
}
