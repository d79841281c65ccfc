//! Message broker abstraction and the in-process implementation.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::BrokerError;

/// Receiving side of a broker subscription: raw serialized messages in
/// publish order.
pub type Subscription = mpsc::Receiver<String>;

/// A publish/subscribe transport with at-least-once delivery.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Push a message to `channel`. Returns once the broker has accepted it.
    async fn publish(&self, channel: &str, message: String) -> Result<(), BrokerError>;

    /// Open a new subscription to `channel`.
    async fn subscribe(&self, channel: &str) -> Result<Subscription, BrokerError>;
}

#[derive(Default)]
struct Channels {
    closed: bool,
    subscribers: HashMap<String, Vec<mpsc::Sender<String>>>,
}

/// Broker living inside the process.
///
/// Every subscription owns a bounded queue of `capacity` messages. A publish
/// waits for room in each subscriber's queue, so a slow subscriber slows
/// publishers down instead of missing messages.
pub struct InMemoryBroker {
    capacity: usize,
    channels: Mutex<Channels>,
}

impl InMemoryBroker {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            channels: Mutex::new(Channels::default()),
        }
    }

    /// Stop accepting messages. Open subscriptions end once drained, and
    /// later publishes and subscribes fail.
    pub fn close(&self) {
        let mut channels = self.channels.lock().expect("broker lock poisoned");
        channels.closed = true;
        channels.subscribers.clear();
        tracing::info!("In-memory broker closed");
    }

    fn senders(&self, channel: &str) -> Result<Vec<mpsc::Sender<String>>, BrokerError> {
        let channels = self.channels.lock().expect("broker lock poisoned");
        if channels.closed {
            return Err(BrokerError::Publish {
                channel: channel.to_string(),
                reason: "broker is closed".to_string(),
            });
        }
        Ok(channels
            .subscribers
            .get(channel)
            .cloned()
            .unwrap_or_default())
    }

    fn prune(&self, channel: &str) {
        let mut channels = self.channels.lock().expect("broker lock poisoned");
        if let Some(senders) = channels.subscribers.get_mut(channel) {
            senders.retain(|tx| !tx.is_closed());
        }
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new(crate::config::EngineConfig::default().broker_capacity)
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn publish(&self, channel: &str, message: String) -> Result<(), BrokerError> {
        let senders = self.senders(channel)?;
        // A publish with no subscribers is still accepted, like a pub/sub
        // server answering PUBLISH with zero recipients.
        if senders.is_empty() {
            tracing::debug!("No subscribers on channel {}", channel);
            return Ok(());
        }

        let mut dropped = false;
        for tx in &senders {
            if tx.send(message.clone()).await.is_err() {
                dropped = true;
            }
        }
        if dropped {
            tracing::debug!("Removing closed subscriptions on channel {}", channel);
            self.prune(channel);
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, BrokerError> {
        let mut channels = self.channels.lock().expect("broker lock poisoned");
        if channels.closed {
            return Err(BrokerError::Subscribe {
                channel: channel.to_string(),
                reason: "broker is closed".to_string(),
            });
        }

        let (tx, rx) = mpsc::channel(self.capacity);
        channels
            .subscribers
            .entry(channel.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_test::{assert_err, assert_ok};

    #[tokio::test]
    async fn test_publish_without_subscribers_is_acknowledged() {
        let broker = InMemoryBroker::new(8);
        assert_ok!(broker.publish("events", "hello".to_string()).await);
    }

    #[tokio::test]
    async fn test_subscribers_receive_in_publish_order() {
        let broker = InMemoryBroker::new(8);
        let mut rx = broker.subscribe("events").await.unwrap();

        for i in 0..3 {
            broker.publish("events", format!("m{}", i)).await.unwrap();
        }

        assert_eq!(rx.recv().await.as_deref(), Some("m0"));
        assert_eq!(rx.recv().await.as_deref(), Some("m1"));
        assert_eq!(rx.recv().await.as_deref(), Some("m2"));
    }

    #[tokio::test]
    async fn test_channels_are_isolated() {
        let broker = InMemoryBroker::new(8);
        let mut a = broker.subscribe("a").await.unwrap();

        broker.publish("b", "for b".to_string()).await.unwrap();
        broker.publish("a", "for a".to_string()).await.unwrap();

        assert_eq!(a.recv().await.as_deref(), Some("for a"));
    }

    #[tokio::test]
    async fn test_slow_subscriber_receives_every_message() {
        let broker = Arc::new(InMemoryBroker::new(2));
        let mut rx = broker.subscribe("events").await.unwrap();

        let publisher = {
            let broker = broker.clone();
            tokio::spawn(async move {
                for i in 0..10 {
                    broker.publish("events", format!("m{}", i)).await.unwrap();
                }
            })
        };

        // Nothing is read yet, so the publisher must be waiting for room.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!publisher.is_finished());

        let mut got = Vec::new();
        while got.len() < 10 {
            got.push(rx.recv().await.unwrap());
        }
        publisher.await.unwrap();

        let expected: Vec<String> = (0..10).map(|i| format!("m{}", i)).collect();
        assert_eq!(got, expected);
    }

    #[tokio::test]
    async fn test_dropped_subscription_does_not_block_publishers() {
        let broker = InMemoryBroker::new(1);
        let gone = broker.subscribe("events").await.unwrap();
        let mut live = broker.subscribe("events").await.unwrap();
        drop(gone);

        broker.publish("events", "one".to_string()).await.unwrap();
        assert_eq!(live.recv().await.as_deref(), Some("one"));
        broker.publish("events", "two".to_string()).await.unwrap();
        assert_eq!(live.recv().await.as_deref(), Some("two"));
    }

    #[tokio::test]
    async fn test_closed_broker_rejects_publish_and_subscribe() {
        let broker = InMemoryBroker::new(4);
        let mut rx = broker.subscribe("events").await.unwrap();
        broker.publish("events", "last".to_string()).await.unwrap();

        broker.close();

        assert_eq!(rx.recv().await.as_deref(), Some("last"));
        assert_eq!(rx.recv().await, None);
        assert!(matches!(
            broker.publish("events", "late".to_string()).await,
            Err(BrokerError::Publish { .. })
        ));
        assert_err!(broker.subscribe("events").await);
        assert!(matches!(
            broker.subscribe("events").await,
            Err(BrokerError::Subscribe { .. })
        ));
    }
}
