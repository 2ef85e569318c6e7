//! Concurrent lifecycle for independent services.

use futures::future::join_all;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;

use crate::contracts::Service;
use crate::events::{LifecycleBus, LifecycleEvent};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("service '{0}' is already registered")]
    DuplicateName(String),
    #[error("service '{0}' is not registered")]
    NotFound(String),
    #[error("initialization failed for service '{service}'")]
    Init {
        service: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Services have no ordering between each other: all initializers run
/// concurrently and are jointly awaited.
#[derive(Default)]
pub struct ServiceManager {
    services: Vec<Arc<dyn Service>>,
    initialized: AtomicBool,
    events: Option<LifecycleBus>,
}

impl ServiceManager {
    pub fn new() -> Self {
        Self::default()
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

    pub fn register(&mut self, service: Arc<dyn Service>) -> Result<(), ServiceError> {
        let name = service.name().to_string();
        if self.services.iter().any(|s| s.name() == name) {
            return Err(ServiceError::DuplicateName(name));
        }
        tracing::debug!(service = %name, "service registered");
        self.services.push(service);
        Ok(())
    }

    pub fn unregister(&mut self, name: &str) -> Result<Arc<dyn Service>, ServiceError> {
        let pos = self
            .services
            .iter()
            .position(|s| s.name() == name)
            .ok_or_else(|| ServiceError::NotFound(name.to_string()))?;
        Ok(self.services.remove(pos))
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Service>> {
        self.services.iter().find(|s| s.name() == name).cloned()
    }

    pub fn get_all(&self) -> &[Arc<dyn Service>] {
        &self.services
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Every service is attempted; the first failure in registration order is returned.
    pub async fn initialize(&self) -> Result<(), ServiceError> {
        if self.initialized.load(Ordering::Acquire) {
            tracing::warn!("initialize() ignored: services already initialized");
            return Ok(());
        }

        let results = join_all(self.services.iter().map(|s| s.initialize())).await;

        let mut first_err = None;
        for (svc, res) in self.services.iter().zip(results) {
            match res {
                Ok(()) => {
                    tracing::info!(service = svc.name(), "service initialized");
                    self.publish(LifecycleEvent::ServiceInitialized {
                        service: svc.name().to_string(),
                    });
                }
                Err(source) => {
                    tracing::error!(service = svc.name(), error = %source, "service initialization failed");
                    self.publish(LifecycleEvent::ServiceFailed {
                        service: svc.name().to_string(),
                        error: format!("{source:#}"),
                    });
                    if first_err.is_none() {
                        first_err = Some(ServiceError::Init {
                            service: svc.name().to_string(),
                            source,
                        });
                    }
                }
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => {
                self.initialized.store(true, Ordering::Release);
                Ok(())
            }
        }
    }

    /// Best-effort: failures are logged, never returned.
    pub async fn shutdown(&self) {
        if !self.initialized.swap(false, Ordering::AcqRel) {
            tracing::warn!("shutdown() ignored: services not initialized");
            return;
        }

        let results = join_all(self.services.iter().map(|s| s.shutdown())).await;
        for (svc, res) in self.services.iter().zip(results) {
            match res {
                Ok(()) => {
                    tracing::info!(service = svc.name(), "service stopped");
                    self.publish(LifecycleEvent::ServiceStopped {
                        service: svc.name().to_string(),
                    });
                }
                Err(e) => tracing::warn!(service = svc.name(), error = %e, "Failed to stop service"),
            }
        }
    }

    pub fn is_ready(&self) -> bool {
        self.initialized.load(Ordering::Acquire) && self.services.iter().all(|s| s.is_ready())
    }
}

impl std::fmt::Debug for ServiceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceManager")
            .field(
                "services",
                &self.services.iter().map(|s| s.name()).collect::<Vec<_>>(),
            )
            .field("initialized", &self.initialized.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::time::Duration;

    struct Svc {
        name: &'static str,
        delay_ms: u64,
        fail_init: bool,
        fail_stop: bool,
        ready: AtomicBool,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Svc {
        fn new(name: &'static str, delay_ms: u64, log: &Arc<Mutex<Vec<String>>>) -> Self {
            Self {
                name,
                delay_ms,
                fail_init: false,
                fail_stop: false,
                ready: AtomicBool::new(false),
                log: log.clone(),
            }
        }
        fn failing(mut self) -> Self {
            self.fail_init = true;
            self
        }
        fn failing_stop(mut self) -> Self {
            self.fail_stop = true;
            self
        }
    }

    #[async_trait::async_trait]
    impl Service for Svc {
        fn name(&self) -> &str {
            self.name
        }
        async fn initialize(&self) -> anyhow::Result<()> {
            tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            self.log.lock().push(format!("{}.init", self.name));
            if self.fail_init {
                anyhow::bail!("{} refused to start", self.name);
            }
            self.ready.store(true, Ordering::SeqCst);
            Ok(())
        }
        async fn shutdown(&self) -> anyhow::Result<()> {
            self.log.lock().push(format!("{}.stop", self.name));
            self.ready.store(false, Ordering::SeqCst);
            if self.fail_stop {
                anyhow::bail!("{} refused to stop", self.name);
            }
            Ok(())
        }
        fn is_ready(&self) -> bool {
            self.ready.load(Ordering::SeqCst)
        }
    }

    fn log() -> Arc<Mutex<Vec<String>>> {
        Arc::new(Mutex::new(Vec::new()))
    }

    #[tokio::test]
    async fn initializers_run_concurrently() {
        let l = log();
        let mut m = ServiceManager::new();
        m.register(Arc::new(Svc::new("slow", 50, &l))).unwrap();
        m.register(Arc::new(Svc::new("fast", 0, &l))).unwrap();

        m.initialize().await.unwrap();
        // the fast one finishes first although it was registered second
        assert_eq!(*l.lock(), vec!["fast.init", "slow.init"]);
        assert!(m.is_ready());
    }

    #[tokio::test]
    async fn failure_surfaces_but_all_are_attempted() {
        let l = log();
        let mut m = ServiceManager::new();
        m.register(Arc::new(Svc::new("a", 0, &l).failing())).unwrap();
        m.register(Arc::new(Svc::new("b", 10, &l))).unwrap();

        let err = m.initialize().await.unwrap_err();
        assert!(matches!(err, ServiceError::Init { ref service, .. } if service == "a"));
        assert_eq!(l.lock().len(), 2);
        assert!(!m.is_ready());
    }

    #[tokio::test]
    async fn shutdown_is_best_effort() {
        let l = log();
        let mut m = ServiceManager::new();
        m.register(Arc::new(Svc::new("bad", 0, &l).failing_stop())).unwrap();
        m.register(Arc::new(Svc::new("good", 0, &l))).unwrap();
        m.initialize().await.unwrap();

        m.shutdown().await;
        let calls = l.lock().clone();
        assert!(calls.contains(&"bad.stop".to_string()));
        assert!(calls.contains(&"good.stop".to_string()));
        assert!(!m.is_ready());

        // second shutdown is a no-op
        m.shutdown().await;
        assert_eq!(l.lock().len(), calls.len());
    }

    #[tokio::test]
    async fn identity_rules() {
        let l = log();
        let mut m = ServiceManager::new();
        m.register(Arc::new(Svc::new("a", 0, &l))).unwrap();
        assert!(matches!(
            m.register(Arc::new(Svc::new("a", 0, &l))),
            Err(ServiceError::DuplicateName(_))
        ));
        assert!(m.get("a").is_some());
        assert_eq!(m.get_all().len(), 1);
        assert!(matches!(m.unregister("zzz"), Err(ServiceError::NotFound(_))));
        m.unregister("a").unwrap();
        assert!(m.is_empty());
    }

    #[tokio::test]
    async fn not_ready_before_initialize() {
        let m = ServiceManager::new();
        assert!(!m.is_ready());
    }

    #[tokio::test]
    async fn events_follow_outcomes() {
        let l = log();
        let bus = LifecycleBus::default();
        let mut rx = bus.subscribe();
        let mut m = ServiceManager::new().with_events(bus);
        m.register(Arc::new(Svc::new("a", 0, &l))).unwrap();
        m.initialize().await.unwrap();
        m.shutdown().await;

        assert_eq!(
            rx.recv().await.unwrap(),
            LifecycleEvent::ServiceInitialized { service: "a".into() }
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            LifecycleEvent::ServiceStopped { service: "a".into() }
        );
    }
}
