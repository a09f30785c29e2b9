// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-process fan-out channel bridged to the broker.
//!
//! ```text
//!  push ──► sender (bounded) ──► broadcast loop ──┬──► subscriber "a"
//!                                                  ├──► subscriber "b" ──► handler task
//!                                                  └──► mirror ──► MessageBus
//! ```
//!
//! [`Channel::push`] waits when the sender queue is full, and the broadcast
//! loop waits on a full subscriber, so a slow subscriber slows the channel
//! rather than growing memory. Subscriber registration takes a lock; the
//! broadcast loop only re-reads the list when its version changes.
//!
//! [`Channel::close`] closes the sender; once the loop drains it, every
//! subscriber channel is closed.
//!
//! The inbound half, [`ChannelAdaptor`], is a [`Processor`] that decodes
//! broker payloads and pushes them. Payloads that do not decode go to the
//! abandoned sink; the adaptor never fails a consumer loop over them.

use crate::deadletter::{DeadLetter, DeadLetterReason, DeadLetterSink};
use crate::error::{RelayError, Result};
use crate::messaging::{self, BoxFuture, Delivery, MessageBus, Processor};
use crate::metrics;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};

type SubscriberList<T> = Vec<(String, mpsc::Sender<T>)>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct Subscribers<T> {
    list: Mutex<SubscriberList<T>>,
    version: AtomicU64,
    closed: AtomicBool,
}

impl<T> Subscribers<T> {
    fn snapshot(&self) -> (u64, SubscriberList<T>) {
        let list = lock(&self.list);
        (self.version.load(Ordering::Acquire), list.clone())
    }

    fn remove(&self, name: &str) {
        let mut list = lock(&self.list);
        list.retain(|(n, _)| n != name);
        self.version.fetch_add(1, Ordering::AcqRel);
    }

    fn close_all(&self) {
        // Flag and clear under the list lock so a racing subscribe either
        // lands before the clear or sees the flag.
        let mut list = lock(&self.list);
        self.closed.store(true, Ordering::Release);
        list.clear();
        self.version.fetch_add(1, Ordering::AcqRel);
    }
}

/// Typed, buffered, multi-subscriber channel.
pub struct Channel<T> {
    name: String,
    capacity: usize,
    tx: Mutex<Option<mpsc::Sender<T>>>,
    rx: Mutex<Option<mpsc::Receiver<T>>>,
    subscribers: Arc<Subscribers<T>>,
}

impl<T> std::fmt::Debug for Channel<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("subscribers", &lock(&self.subscribers.list).len())
            .finish()
    }
}

impl<T: Clone + Send + Sync + 'static> Channel<T> {
    /// Create a channel. Nothing is delivered until [`start`](Self::start).
    pub fn new(name: impl Into<String>, capacity: usize) -> Arc<Self> {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        Arc::new(Self {
            name: name.into(),
            capacity,
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(Some(rx)),
            subscribers: Arc::new(Subscribers {
                list: Mutex::new(Vec::new()),
                version: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.subscribers.list).len()
    }

    /// Enqueue a value. Waits while the sender queue is full.
    pub async fn push(&self, value: T) -> Result<()> {
        let tx = lock(&self.tx).clone().ok_or(RelayError::Shutdown)?;
        tx.send(value).await.map_err(|_| RelayError::Shutdown)
    }

    /// Spawn the broadcast loop. Fails if already started.
    pub fn start(&self) -> Result<JoinHandle<()>> {
        let mut rx = lock(&self.rx).take().ok_or_else(|| RelayError::InvalidState {
            expected: "unstarted channel".into(),
            actual: "started".into(),
        })?;
        let subscribers = Arc::clone(&self.subscribers);
        let name = self.name.clone();
        let span = info_span!("channel", channel = %name);

        Ok(tokio::spawn(
            async move {
                info!("Channel broadcast loop started");
                let (mut version, mut targets) = subscribers.snapshot();

                while let Some(value) = rx.recv().await {
                    if subscribers.version.load(Ordering::Acquire) != version {
                        (version, targets) = subscribers.snapshot();
                    }
                    metrics::record_channel_broadcast(&name, targets.len());

                    for (sub_name, sub_tx) in &targets {
                        if sub_tx.send(value.clone()).await.is_err() {
                            debug!(subscriber = %sub_name, "Subscriber went away");
                            metrics::record_channel_dropped(&name, sub_name);
                            subscribers.remove(sub_name);
                        }
                    }
                }

                subscribers.close_all();
                info!("Channel closed, subscribers released");
            }
            .instrument(span),
        ))
    }

    /// Register a subscriber and get its receiving end.
    ///
    /// A subscriber registered under an existing name replaces it. After the
    /// channel has closed the returned receiver is already closed.
    pub fn subscribe(&self, name: impl Into<String>) -> mpsc::Receiver<T> {
        let name = name.into();
        let (tx, rx) = mpsc::channel(self.capacity);

        let mut list = lock(&self.subscribers.list);
        if self.subscribers.closed.load(Ordering::Acquire) {
            // Dropping `tx` closes `rx` right away.
            return rx;
        }
        list.retain(|(n, _)| *n != name);
        list.push((name.clone(), tx));
        self.subscribers.version.fetch_add(1, Ordering::AcqRel);
        debug!(channel = %self.name, subscriber = %name, "Subscriber registered");
        rx
    }

    /// Register a subscriber drained by `handler` on its own task.
    ///
    /// Handler errors are logged; the task ends when the channel closes.
    pub fn subscribe_with<F, Fut>(&self, name: impl Into<String>, handler: F) -> JoinHandle<()>
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let name = name.into();
        let mut rx = self.subscribe(name.clone());
        let span = info_span!("channel_handler", channel = %self.name, subscriber = %name);

        tokio::spawn(
            async move {
                while let Some(value) = rx.recv().await {
                    if let Err(e) = handler(value).await {
                        warn!(error = %e, "Channel handler failed");
                    }
                }
                debug!("Channel handler finished");
            }
            .instrument(span),
        )
    }

    /// Close the sender side. Queued values are still delivered.
    pub fn close(&self) {
        if lock(&self.tx).take().is_some() {
            info!(channel = %self.name, "Channel closing");
        }
        // Never started: nobody else will release the subscribers.
        if lock(&self.rx).take().is_some() {
            self.subscribers.close_all();
        }
    }
}

impl<T: Clone + Serialize + Send + Sync + 'static> Channel<T> {
    /// Forward every value to `topic` on the broker.
    pub fn mirror_to(&self, bus: Arc<dyn MessageBus>, topic: impl Into<String>) -> JoinHandle<()> {
        let topic = topic.into();
        let name = format!("mirror:{}", topic);
        self.subscribe_with(name, move |value: T| {
            let bus = Arc::clone(&bus);
            let topic = topic.clone();
            async move { messaging::publish(&*bus, &topic, &value).await.map(|_| ()) }
        })
    }
}

impl<T: Clone + DeserializeOwned + Send + Sync + 'static> Channel<T> {
    /// Inbound processor that decodes payloads and pushes them here.
    pub fn adaptor(self: &Arc<Self>, abandoned: Arc<dyn DeadLetterSink>) -> Arc<ChannelAdaptor<T>> {
        Arc::new(ChannelAdaptor {
            channel: Arc::clone(self),
            abandoned,
        })
    }
}

/// Broker → channel bridge.
pub struct ChannelAdaptor<T> {
    channel: Arc<Channel<T>>,
    abandoned: Arc<dyn DeadLetterSink>,
}

impl<T: Clone + DeserializeOwned + Send + Sync + 'static> ChannelAdaptor<T> {
    /// Decode and push one payload.
    ///
    /// Undecodable payloads are recorded as abandoned and reported as
    /// handled. A closed channel is an error, leaving the message pending.
    pub async fn handle(&self, topic: &str, consumer: &str, id: &str, payload: &[u8]) -> Result<()> {
        match serde_json::from_slice::<T>(payload) {
            Ok(value) => self.channel.push(value).await,
            Err(e) => {
                warn!(channel = %self.channel.name, topic = %topic, stream_id = %id, error = %e, "Undecodable channel payload");
                let letter = DeadLetter::new(DeadLetterReason::ChannelDecode, topic, "", id, payload.to_vec())
                    .with_consumer(consumer)
                    .with_error(&e);
                if let Err(write_err) = self.abandoned.write(letter).await {
                    warn!(error = %write_err, "Failed to record abandoned channel payload");
                }
                Ok(())
            }
        }
    }
}

impl<T: Clone + DeserializeOwned + Send + Sync + 'static> Processor for ChannelAdaptor<T> {
    fn process<'a>(&'a self, delivery: &'a Delivery) -> BoxFuture<'a, ()> {
        Box::pin(self.handle(&delivery.topic, &delivery.group, &delivery.id, &delivery.payload))
    }
}
