//! Lifecycle signalling.
//!
//! A small typed bus built on `tokio::sync::broadcast`: publishers never wait
//! for subscribers, and slow subscribers lose the oldest events instead of
//! stalling startup or shutdown.

use futures::{Stream, StreamExt};
use std::net::SocketAddr;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

/// Default ring size for lifecycle buses.
pub const DEFAULT_CAPACITY: usize = 256;

/// Typed publish/subscribe channel.
#[derive(Clone)]
pub struct EventBus<T> {
    tx: broadcast::Sender<T>,
}

impl<T: Clone + Send + 'static> EventBus<T> {
    /// Create a bus with bounded buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Deliver `event` to every current subscriber.
    /// Returns how many subscribers were reached; 0 when nobody listens.
    pub fn publish(&self, event: T) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    /// Receive every event published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<T> {
        self.tx.subscribe()
    }

    /// Same as [`subscribe`](Self::subscribe), as a stream; lag errors are filtered out.
    pub fn subscribe_stream(&self) -> impl Stream<Item = T> {
        BroadcastStream::new(self.tx.subscribe()).filter_map(|res| async move { res.ok() })
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl<T: Clone + Send + 'static> Default for EventBus<T> {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl<T> std::fmt::Debug for EventBus<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.tx.receiver_count())
            .finish()
    }
}

/// Transitions published by the module/service managers and the HTTP host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    ModuleInitializing { module: String },
    ModuleInitialized { module: String },
    ModuleFailed { module: String, error: String },
    ModuleSkipped { module: String },
    ModuleStopped { module: String },
    ModuleStopFailed { module: String, error: String },
    ModulesReady,
    ModulesStopped,
    ServiceInitialized { service: String },
    ServiceFailed { service: String, error: String },
    ServiceStopped { service: String },
    ServerStarted { addr: SocketAddr },
    ServerStopped,
}

pub type LifecycleBus = EventBus<LifecycleEvent>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn publish_without_subscribers_is_harmless() {
        let bus: EventBus<u32> = EventBus::new(4);
        assert_eq!(bus.publish(1), 0);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn every_subscriber_gets_each_event() {
        let bus = LifecycleBus::default();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        let reached = bus.publish(LifecycleEvent::ModulesReady);
        assert_eq!(reached, 2);

        assert_eq!(a.recv().await.unwrap(), LifecycleEvent::ModulesReady);
        assert_eq!(b.recv().await.unwrap(), LifecycleEvent::ModulesReady);
    }

    #[tokio::test]
    async fn late_subscriber_misses_earlier_events() {
        let bus: EventBus<u32> = EventBus::new(8);
        let _keep = bus.subscribe();
        bus.publish(1);
        let mut late = bus.subscribe();
        bus.publish(2);
        assert_eq!(late.recv().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn stream_skips_lagged_events() {
        let bus: EventBus<u32> = EventBus::new(2);
        let mut stream = Box::pin(bus.subscribe_stream());

        for i in 0..5 {
            bus.publish(i);
        }

        // The two newest survive the bounded ring; the lag error is swallowed.
        let first = tokio::time::timeout(Duration::from_millis(100), stream.next())
            .await
            .unwrap();
        assert_eq!(first, Some(3));
        let second = tokio::time::timeout(Duration::from_millis(100), stream.next())
            .await
            .unwrap();
        assert_eq!(second, Some(4));
    }
}
