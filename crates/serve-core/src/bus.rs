//! Error bus
//!
//! Multi-subscriber fan-out of [`ErrorRecord`]s. Publishing is synchronous;
//! a subscriber that returns an error or panics is logged and skipped
//! without affecting the other subscribers or the publisher.

use crate::ErrorRecord;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use tokio::sync::mpsc;
use tracing::{error, warn};

/// Receiver of published error records
pub trait ErrorSubscriber: Send + Sync {
    fn on_error(&self, record: &ErrorRecord) -> anyhow::Result<()>;
}

impl<F> ErrorSubscriber for F
where
    F: Fn(&ErrorRecord) -> anyhow::Result<()> + Send + Sync,
{
    fn on_error(&self, record: &ErrorRecord) -> anyhow::Result<()> {
        self(record)
    }
}

type SubscriberList = RwLock<Vec<(u64, Arc<dyn ErrorSubscriber>)>>;

#[derive(Default)]
struct BusInner {
    subscribers: SubscriberList,
    next_id: AtomicU64,
}

/// Publish/subscribe channel for classified failures
#[derive(Clone, Default)]
pub struct ErrorBus {
    inner: Arc<BusInner>,
}

/// Handle returned by [`ErrorBus::subscribe`]
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    bus: Weak<BusInner>,
}

impl Subscription {
    /// Remove the subscriber. Returns false if it was already gone.
    pub fn unsubscribe(self) -> bool {
        let Some(bus) = self.bus.upgrade() else {
            return false;
        };
        let mut subscribers = bus.subscribers.write().unwrap_or_else(|e| e.into_inner());
        let before = subscribers.len();
        subscribers.retain(|(id, _)| *id != self.id);
        subscribers.len() != before
    }
}

impl ErrorBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, subscriber: impl ErrorSubscriber + 'static) -> Subscription {
        self.subscribe_arc(Arc::new(subscriber))
    }

    pub fn subscribe_arc(&self, subscriber: Arc<dyn ErrorSubscriber>) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, subscriber));

        Subscription {
            id,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Deliver `record` to every subscriber; returns how many accepted it
    pub fn publish(&self, record: &ErrorRecord) -> usize {
        // Snapshot so subscribers may (un)subscribe while being called
        let subscribers: Vec<_> = self
            .inner
            .subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(id, subscriber)| (*id, Arc::clone(subscriber)))
            .collect();

        let mut delivered = 0;
        for (id, subscriber) in subscribers {
            match catch_unwind(AssertUnwindSafe(|| subscriber.on_error(record))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => warn!(subscriber = id, "Error subscriber failed: {}", e),
                Err(_) => warn!(subscriber = id, "Error subscriber panicked"),
            }
        }
        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner
            .subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

impl std::fmt::Debug for ErrorBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

/// Logs every record: `warn` when retryable, `error` otherwise
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingSubscriber;

impl ErrorSubscriber for LoggingSubscriber {
    fn on_error(&self, record: &ErrorRecord) -> anyhow::Result<()> {
        let source = record.source.as_deref().unwrap_or("-");
        if record.retryable {
            warn!(kind = %record.kind, source, "{}", record.message);
        } else {
            error!(kind = %record.kind, source, "{}", record.message);
        }
        Ok(())
    }
}

/// Forwards records to a notification consumer (e.g. a UI event loop)
#[derive(Debug, Clone)]
pub struct ChannelSubscriber {
    sender: mpsc::UnboundedSender<ErrorRecord>,
}

impl ChannelSubscriber {
    pub fn new(sender: mpsc::UnboundedSender<ErrorRecord>) -> Self {
        Self { sender }
    }

    /// Create a subscriber together with its receiving end
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ErrorRecord>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl ErrorSubscriber for ChannelSubscriber {
    fn on_error(&self, record: &ErrorRecord) -> anyhow::Result<()> {
        self.sender
            .send(record.clone())
            .map_err(|_| anyhow::anyhow!("notification receiver dropped"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ErrorClassifier, ErrorKind};
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_publish_reaches_all_subscribers() {
        let bus = ErrorBus::new();
        let count = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let count = Arc::clone(&count);
            bus.subscribe(move |_: &ErrorRecord| -> anyhow::Result<()> {
                count.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }

        let delivered = bus.publish(&ErrorClassifier::record("connection refused"));
        assert_eq!(delivered, 3);
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_failing_subscriber_is_isolated() {
        let bus = ErrorBus::new();
        let seen = Arc::new(AtomicUsize::new(0));

        bus.subscribe(|_: &ErrorRecord| -> anyhow::Result<()> { anyhow::bail!("broken") });
        bus.subscribe(|_: &ErrorRecord| -> anyhow::Result<()> { panic!("subscriber bug") });
        {
            let seen = Arc::clone(&seen);
            bus.subscribe(move |record: &ErrorRecord| -> anyhow::Result<()> {
                assert_eq!(record.kind, ErrorKind::Timeout);
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }

        let delivered = bus.publish(&ErrorClassifier::record("request timed out"));
        assert_eq!(delivered, 1);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsubscribe() {
        let bus = ErrorBus::new();
        let subscription = bus.subscribe(LoggingSubscriber);
        assert_eq!(bus.subscriber_count(), 1);

        assert!(subscription.unsubscribe());
        assert_eq!(bus.subscriber_count(), 0);
        assert_eq!(bus.publish(&ErrorClassifier::record("x")), 0);
    }

    #[tokio::test]
    async fn test_channel_subscriber_forwards_records() {
        let bus = ErrorBus::new();
        let (subscriber, mut receiver) = ChannelSubscriber::channel();
        bus.subscribe(subscriber);

        bus.publish(&ErrorClassifier::record("Permission denied").with_source("local"));

        let record = receiver.recv().await.unwrap();
        assert_eq!(record.kind, ErrorKind::PermissionDenied);
        assert!(!record.retryable);
    }
}
