use async_trait::async_trait;

use crate::context::ModuleCtx;

/// A unit of ordered startup. Identity, version and dependencies are declared
/// at registration time (see [`crate::registry::ModuleDecl`]).
#[async_trait]
pub trait Module: Send + Sync + 'static {
    /// Runs after every declared dependency finished its own `init`.
    async fn init(&self, ctx: &ModuleCtx) -> anyhow::Result<()>;

    /// Runs in reverse initialization order. Failures are logged by the manager.
    async fn shutdown(&self, _ctx: &ModuleCtx) -> anyhow::Result<()> {
        Ok(())
    }

    /// Disabled modules are neither initialized nor shut down.
    fn is_enabled(&self) -> bool {
        true
    }

    fn as_any(&self) -> &dyn std::any::Any;
}

/// An independent unit started concurrently with its peers.
#[async_trait]
pub trait Service: Send + Sync + 'static {
    fn name(&self) -> &str;

    async fn initialize(&self) -> anyhow::Result<()>;

    async fn shutdown(&self) -> anyhow::Result<()>;

    fn is_ready(&self) -> bool;
}
