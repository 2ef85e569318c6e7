use serde::de::DeserializeOwned;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::events::{LifecycleBus, LifecycleEvent};

/// Provider of module-specific configuration (raw JSON sections only).
pub trait ConfigProvider: Send + Sync {
    /// Returns raw JSON section for the module, if any.
    fn get_module_config(&self, module_name: &str) -> Option<&serde_json::Value>;
}

/// Context handed to every module hook. Cheap to clone.
#[derive(Clone)]
pub struct ModuleCtx {
    pub(crate) config_provider: Option<Arc<dyn ConfigProvider>>,
    pub(crate) events: LifecycleBus,
    pub(crate) cancellation_token: CancellationToken,
    pub(crate) module_name: Option<Arc<str>>,
}

pub struct ModuleCtxBuilder {
    inner: ModuleCtx,
}

impl ModuleCtxBuilder {
    pub fn new(token: CancellationToken) -> Self {
        Self {
            inner: ModuleCtx {
                config_provider: None,
                events: LifecycleBus::default(),
                cancellation_token: token,
                module_name: None,
            },
        }
    }
    pub fn with_config_provider(mut self, p: Arc<dyn ConfigProvider>) -> Self {
        self.inner.config_provider = Some(p);
        self
    }
    pub fn with_events(mut self, events: LifecycleBus) -> Self {
        self.inner.events = events;
        self
    }
    pub fn build(self) -> ModuleCtx {
        self.inner
    }
}

impl ModuleCtx {
    /// Scope context to a specific module name (used by the registry).
    pub(crate) fn for_module(mut self, name: &str) -> Self {
        self.module_name = Some(Arc::<str>::from(name));
        self
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation_token
    }

    pub fn current_module(&self) -> Option<&str> {
        self.module_name.as_deref()
    }

    pub fn events(&self) -> &LifecycleBus {
        &self.events
    }

    pub fn publish(&self, event: LifecycleEvent) {
        self.events.publish(event);
    }

    /// Best-effort: deserialize the module's config into `T`, fallback to `T::default()`
    /// if section is missing or invalid.
    pub fn module_config<T: DeserializeOwned + Default>(&self) -> T {
        match (&self.module_name, &self.config_provider) {
            (Some(name), Some(p)) => p
                .get_module_config(name)
                .and_then(|v| match serde_json::from_value::<T>(v.clone()) {
                    Ok(cfg) => Some(cfg),
                    Err(e) => {
                        tracing::warn!(module = %name, error = %e, "invalid module config; using defaults");
                        None
                    }
                })
                .unwrap_or_default(),
            _ => T::default(),
        }
    }

    /// Strict: deserialize the module's config into `T`, returning a pathful error on failure.
    pub fn module_config_required<T: DeserializeOwned>(&self) -> anyhow::Result<T> {
        let name = self
            .module_name
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("context is not scoped to a module"))?;

        let prov = self
            .config_provider
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("no ConfigProvider"))?;

        let val = prov
            .get_module_config(name)
            .ok_or_else(|| anyhow::anyhow!("missing module config: {name}"))?;

        serde_json::from_value(val.clone()).map_err(|e| anyhow::anyhow!("invalid {name} config: {e}"))
    }

    /// `Ok(None)` when the module has no (or a null) section; a present but
    /// malformed section is an error.
    pub fn module_config_optional<T: DeserializeOwned>(&self) -> anyhow::Result<Option<T>> {
        let (Some(name), Some(prov)) = (self.module_name.as_deref(), &self.config_provider) else {
            return Ok(None);
        };
        prov.get_module_config(name)
            .filter(|v| !v.is_null())
            .map(|v| serde_json::from_value(v.clone()))
            .transpose()
            .map_err(|e| anyhow::anyhow!("invalid {name} config: {e}"))
    }
}

impl std::fmt::Debug for ModuleCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleCtx")
            .field("module", &self.module_name)
            .field("has_config", &self.config_provider.is_some())
            .field("cancelled", &self.cancellation_token.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::collections::HashMap;

    struct MapProvider(HashMap<String, serde_json::Value>);

    impl ConfigProvider for MapProvider {
        fn get_module_config(&self, module_name: &str) -> Option<&serde_json::Value> {
            self.0.get(module_name)
        }
    }

    #[derive(Debug, Default, Deserialize, PartialEq)]
    struct Cfg {
        #[serde(default)]
        limit: u32,
    }

    fn ctx_with(entries: &[(&str, serde_json::Value)]) -> ModuleCtx {
        let map = entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        ModuleCtxBuilder::new(CancellationToken::new())
            .with_config_provider(Arc::new(MapProvider(map)))
            .build()
    }

    #[test]
    fn module_config_reads_scoped_section() {
        let ctx = ctx_with(&[("db", serde_json::json!({"limit": 7}))]).for_module("db");
        assert_eq!(ctx.current_module(), Some("db"));
        assert_eq!(ctx.module_config::<Cfg>(), Cfg { limit: 7 });
    }

    #[test]
    fn module_config_falls_back_to_default() {
        let ctx = ctx_with(&[("db", serde_json::json!({"limit": "nope"}))]).for_module("db");
        assert_eq!(ctx.module_config::<Cfg>(), Cfg::default());

        let unscoped = ctx_with(&[]);
        assert_eq!(unscoped.module_config::<Cfg>(), Cfg::default());
    }

    #[test]
    fn module_config_required_reports_missing_section() {
        let ctx = ctx_with(&[]).for_module("auth");
        let err = ctx.module_config_required::<Cfg>().unwrap_err();
        assert!(err.to_string().contains("missing module config: auth"));

        let unscoped = ctx_with(&[]);
        assert!(unscoped.module_config_required::<Cfg>().is_err());
    }

    #[test]
    fn module_config_optional_distinguishes_missing_from_invalid() {
        let ctx = ctx_with(&[("db", serde_json::json!({"limit": 3}))]);
        assert_eq!(
            ctx.clone().for_module("db").module_config_optional::<Cfg>().unwrap(),
            Some(Cfg { limit: 3 })
        );
        assert_eq!(ctx.for_module("cache").module_config_optional::<Cfg>().unwrap(), None);

        let bad = ctx_with(&[("db", serde_json::json!({"limit": -1}))]).for_module("db");
        assert!(bad.module_config_optional::<Cfg>().is_err());
    }
}
