//! # ModKit
//!
//! Lifecycle kernel for modular services: dependency-ordered modules,
//! concurrently started services, lifecycle events and the process runner.
//!
//! ## Example
//!
//! ```rust,ignore
//! use modkit::{Application, ModuleDecl, ShutdownOptions};
//!
//! let mut app = Application::new();
//! app.register_module(ModuleDecl::new("db"), Arc::new(Db::default()))?;
//! app.register_module(ModuleDecl::new("api").depends_on(["db"]), Arc::new(Api::default()))?;
//! app.run(ShutdownOptions::Signals).await?;
//! ```

pub use anyhow::Result;
pub use async_trait::async_trait;

pub mod context;
pub mod contracts;
pub mod events;
pub mod registry;
pub mod runtime;
pub mod services;

pub use context::{ConfigProvider, ModuleCtx, ModuleCtxBuilder};
pub use contracts::{Module, Service};
pub use events::{EventBus, LifecycleBus, LifecycleEvent};
pub use registry::{ManagerState, ModuleDecl, ModuleManager, RegistryError};
pub use runtime::{Application, ShutdownOptions};
pub use services::{ServiceError, ServiceManager};
