// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Messaging port: publish bytes to a topic, consume them through a group.
//!
//! [`MessageBus`] is what the rest of the crate talks to. The production
//! implementation is [`RedisStreamBroker`](crate::broker::RedisStreamBroker);
//! [`MemoryBus`] delivers in-process and records everything it sees.
//!
//! Delivery is at-least-once: a [`Processor`] that returns `Err` leaves the
//! message pending for the reclaim sweep, so processors must be idempotent.
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example(bus: std::sync::Arc<dyn mutation_relay::MessageBus>) -> mutation_relay::Result<()> {
//! use mutation_relay::messaging::{self, processor_fn, Delivery};
//!
//! let subscription = bus
//!     .subscribe("orders", "billing", processor_fn(|delivery: Delivery| async move {
//!         tracing::info!(id = %delivery.id, bytes = delivery.payload.len(), "order received");
//!         Ok(())
//!     }))
//!     .await?;
//!
//! messaging::publish(bus.as_ref(), "orders", &serde_json::json!({"id": 1})).await?;
//! subscription.unsubscribe().await;
//! # Ok(())
//! # }
//! ```

use crate::error::{RelayError, Result};
use serde::Serialize;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

pub use memory::{MemoryBus, Published};

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// One message handed to a [`Processor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub topic: String,
    pub group: String,
    /// Broker-assigned id (`<ms>-<seq>` for streams).
    pub id: String,
    pub payload: Vec<u8>,
}

/// Handles messages for one subscription.
pub trait Processor: Send + Sync + 'static {
    /// `Ok` acknowledges the message. `Err` leaves it pending.
    fn process<'a>(&'a self, delivery: &'a Delivery) -> BoxFuture<'a, ()>;
}

/// Publish/subscribe over durable topics.
pub trait MessageBus: Send + Sync + 'static {
    /// Append raw bytes to `topic`, returning the assigned entry id.
    ///
    /// No local buffering and no retry: a broker failure is returned as-is.
    fn publish_raw<'a>(&'a self, topic: &'a str, payload: Vec<u8>) -> BoxFuture<'a, String>;

    /// Join `group` on `topic` and start delivering to `processor`.
    ///
    /// Returns once the group exists. Delivery happens on a background task
    /// that runs until the returned [`Subscription`] is cancelled or dropped.
    fn subscribe<'a>(
        &'a self,
        topic: &'a str,
        group: &'a str,
        processor: Arc<dyn Processor>,
    ) -> BoxFuture<'a, Subscription>;
}

/// Serialize `value` as JSON and publish it.
pub async fn publish<T>(bus: &dyn MessageBus, topic: &str, value: &T) -> Result<String>
where
    T: Serialize + ?Sized,
{
    let payload = serde_json::to_vec(value)?;
    bus.publish_raw(topic, payload).await
}

// ═══════════════════════════════════════════════════════════════════════════════
// Closure processors
// ═══════════════════════════════════════════════════════════════════════════════

/// [`Processor`] backed by an async closure.
pub struct FnProcessor<F> {
    f: F,
}

impl<F, Fut> Processor for FnProcessor<F>
where
    F: Fn(Delivery) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    fn process<'a>(&'a self, delivery: &'a Delivery) -> BoxFuture<'a, ()> {
        Box::pin((self.f)(delivery.clone()))
    }
}

/// Wrap an async closure as a shared processor.
pub fn processor_fn<F, Fut>(f: F) -> Arc<dyn Processor>
where
    F: Fn(Delivery) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(FnProcessor { f })
}

// ═══════════════════════════════════════════════════════════════════════════════
// Subscription handle
// ═══════════════════════════════════════════════════════════════════════════════

/// Handle to a running subscription.
///
/// Dropping the handle cancels the read loop. Use [`unsubscribe`](Self::unsubscribe)
/// to cancel and wait for the loop to finish its current message.
#[derive(Debug)]
pub struct Subscription {
    topic: String,
    group: String,
    consumer: String,
    shutdown_tx: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

impl Subscription {
    pub fn new(
        topic: impl Into<String>,
        group: impl Into<String>,
        consumer: impl Into<String>,
        shutdown_tx: watch::Sender<bool>,
        handle: JoinHandle<()>,
    ) -> Self {
        Self {
            topic: topic.into(),
            group: group.into(),
            consumer: consumer.into(),
            shutdown_tx,
            handle: Some(handle),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    /// Signal the loop to stop without waiting.
    pub fn cancel(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }

    /// Stop the loop and wait for it to exit.
    pub async fn unsubscribe(mut self) {
        self.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                debug!(topic = %self.topic, group = %self.group, error = %e, "Subscription task ended abnormally");
            }
        }
    }

    /// Like [`unsubscribe`](Self::unsubscribe), but gives up after `timeout`.
    pub async fn unsubscribe_timeout(mut self, timeout: std::time::Duration) -> Result<()> {
        self.cancel();
        if let Some(handle) = self.handle.take() {
            if tokio::time::timeout(timeout, handle).await.is_err() {
                return Err(RelayError::Internal(format!(
                    "subscription {}/{} did not stop within {:?}",
                    self.topic, self.group, timeout
                )));
            }
        }
        Ok(())
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// In-process bus
// ═══════════════════════════════════════════════════════════════════════════════

mod memory {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::Mutex;
    use tokio::sync::mpsc;
    use tracing::warn;

    /// A published message as the in-process bus recorded it.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Published {
        pub topic: String,
        pub id: String,
        pub payload: Vec<u8>,
    }

    type FailureLog = Arc<Mutex<HashMap<String, Vec<String>>>>;

    /// In-process [`MessageBus`].
    ///
    /// Every subscription on a topic receives every message (groups are not
    /// load-balanced). Processor failures are recorded instead of retried.
    #[derive(Default)]
    pub struct MemoryBus {
        log: Mutex<Vec<Published>>,
        subscribers: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<Delivery>>>>,
        failures: FailureLog,
        seq: AtomicU64,
        fail_publishes: AtomicBool,
    }

    impl MemoryBus {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        /// Make every subsequent publish fail with a broker error.
        pub fn fail_publishes(&self, fail: bool) {
            self.fail_publishes.store(fail, Ordering::SeqCst);
        }

        /// Everything published so far, in order.
        pub fn published(&self) -> Vec<Published> {
            lock(&self.log).clone()
        }

        pub fn published_to(&self, topic: &str) -> Vec<Published> {
            lock(&self.log)
                .iter()
                .filter(|p| p.topic == topic)
                .cloned()
                .collect()
        }

        /// Ids of messages whose processor returned an error, per group.
        pub fn failures(&self, group: &str) -> Vec<String> {
            lock(&self.failures).get(group).cloned().unwrap_or_default()
        }
    }

    fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
        m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    impl MessageBus for MemoryBus {
        fn publish_raw<'a>(&'a self, topic: &'a str, payload: Vec<u8>) -> BoxFuture<'a, String> {
            Box::pin(async move {
                if self.fail_publishes.load(Ordering::SeqCst) {
                    return Err(RelayError::broker_msg("XADD", "injected publish failure"));
                }

                // Id assignment and append happen under one lock so ids are
                // strictly increasing in log order.
                let mut log = lock(&self.log);
                let seq = self.seq.fetch_add(1, Ordering::SeqCst);
                let ms = chrono::Utc::now().timestamp_millis().max(0);
                let id = format!("{}-{}", ms, seq);
                log.push(Published {
                    topic: topic.to_string(),
                    id: id.clone(),
                    payload: payload.clone(),
                });

                if let Some(subs) = lock(&self.subscribers).get_mut(topic) {
                    subs.retain(|tx| {
                        tx.send(Delivery {
                            topic: topic.to_string(),
                            group: String::new(),
                            id: id.clone(),
                            payload: payload.clone(),
                        })
                        .is_ok()
                    });
                }
                Ok(id)
            })
        }

        fn subscribe<'a>(
            &'a self,
            topic: &'a str,
            group: &'a str,
            processor: Arc<dyn Processor>,
        ) -> BoxFuture<'a, Subscription> {
            Box::pin(async move {
                let (tx, mut rx) = mpsc::unbounded_channel::<Delivery>();
                lock(&self.subscribers)
                    .entry(topic.to_string())
                    .or_default()
                    .push(tx);

                let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
                let group_name = group.to_string();
                let failures = Arc::clone(&self.failures);

                let handle = tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            biased;
                            _ = shutdown_rx.changed() => break,
                            msg = rx.recv() => {
                                let Some(mut delivery) = msg else { break };
                                delivery.group = group_name.clone();
                                if let Err(e) = processor.process(&delivery).await {
                                    warn!(id = %delivery.id, group = %group_name, error = %e, "In-process delivery failed");
                                    lock(&failures)
                                        .entry(group_name.clone())
                                        .or_default()
                                        .push(delivery.id);
                                }
                            }
                        }
                    }
                });

                Ok(Subscription::new(topic, group, "memory", shutdown_tx, handle))
            })
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use std::sync::atomic::AtomicUsize;
        use std::time::Duration;

        #[tokio::test]
        async fn test_publish_then_subscribe_delivers_once() {
            let bus = MemoryBus::new();
            let seen = Arc::new(AtomicUsize::new(0));
            let seen2 = Arc::clone(&seen);

            let sub = bus
                .subscribe("t", "g", processor_fn(move |d: Delivery| {
                    let seen = Arc::clone(&seen2);
                    async move {
                        assert_eq!(d.payload, b"hello".to_vec());
                        assert_eq!(d.group, "g");
                        seen.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                }))
                .await
                .unwrap();

            bus.publish_raw("t", b"hello".to_vec()).await.unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;

            assert_eq!(seen.load(Ordering::SeqCst), 1);
            sub.unsubscribe().await;
        }

        #[tokio::test]
        async fn test_publish_json_helper() {
            let bus = MemoryBus::new();
            publish(&*bus, "t", &serde_json::json!({"a": 1})).await.unwrap();

            let published = bus.published_to("t");
            assert_eq!(published.len(), 1);
            assert_eq!(published[0].payload, br#"{"a":1}"#.to_vec());
        }

        #[tokio::test]
        async fn test_injected_publish_failure() {
            let bus = MemoryBus::new();
            bus.fail_publishes(true);
            let err = bus.publish_raw("t", vec![]).await.unwrap_err();
            assert!(err.is_retryable());
            assert!(bus.published().is_empty());
        }

        #[tokio::test]
        async fn test_processor_failure_recorded() {
            let bus = MemoryBus::new();
            let sub = bus
                .subscribe("t", "g", processor_fn(|_d: Delivery| async move {
                    Err(RelayError::Internal("boom".into()))
                }))
                .await
                .unwrap();

            let id = bus.publish_raw("t", b"x".to_vec()).await.unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;

            assert_eq!(bus.failures("g"), vec![id]);
            sub.unsubscribe().await;
        }

        #[tokio::test]
        async fn test_unsubscribe_stops_delivery() {
            let bus = MemoryBus::new();
            let seen = Arc::new(AtomicUsize::new(0));
            let seen2 = Arc::clone(&seen);
            let sub = bus
                .subscribe("t", "g", processor_fn(move |_d: Delivery| {
                    let seen = Arc::clone(&seen2);
                    async move {
                        seen.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                }))
                .await
                .unwrap();

            sub.unsubscribe().await;
            bus.publish_raw("t", b"late".to_vec()).await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;

            assert_eq!(seen.load(Ordering::SeqCst), 0);
        }
    }
}
