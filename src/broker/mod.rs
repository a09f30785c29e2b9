// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Redis Streams broker.
//!
//! Implements [`MessageBus`] over Redis Streams with consumer groups:
//!
//! | Operation | Redis |
//! |-----------|-------|
//! | publish | `XADD topic MAXLEN ~ cap * payload <bytes>` |
//! | join group | `XGROUP CREATE topic group $ MKSTREAM` |
//! | read | `XREADGROUP GROUP group consumer BLOCK ms COUNT n STREAMS topic >` |
//! | acknowledge | `XACK topic group id` |
//! | reclaim | `XPENDING` pages + `XRANGE id id` |
//! | dead-letter | `XADD {topic}.{group}.deadletter ...` |
//!
//! # Connections
//!
//! Publishing, acknowledging and reclaim share one multiplexed
//! [`ConnectionManager`]. Each subscription opens its own, because a blocking
//! `XREADGROUP` holds up every other command queued on the same connection.
//!
//! # Consumer Identity
//!
//! The consumer name is fixed per broker (host name by default). A process
//! restarted on the same host reads as the same consumer, so its pending
//! entries stay its own.

mod consumer;
mod reclaim;
pub mod stream_id;

pub use reclaim::{SweepOutcome, SweepStats};

use crate::config::{BrokerConfig, ReclaimConfig};
use crate::deadletter::{dead_letter_topic, DeadLetter, DeadLetterSink};
use crate::error::{RelayError, Result};
use crate::messaging::{BoxFuture, MessageBus, Processor, Subscription};
use crate::metrics;
use crate::resilience::RetryConfig;
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use redis::streams::{StreamMaxlen, StreamPendingReply};
use redis::{AsyncCommands, Client};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, error, info, info_span, warn, Instrument};

type GroupKey = (String, String);

/// Pending-entry list at a glance.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingSummary {
    pub count: u64,
    pub lowest_id: Option<String>,
    pub highest_id: Option<String>,
}

fn group_key(topic: &str, group: &str) -> GroupKey {
    (topic.to_string(), group.to_string())
}

/// Redis Streams implementation of [`MessageBus`].
///
/// Cheap to clone; clones share connections and registered processors.
#[derive(Clone)]
pub struct RedisStreamBroker {
    inner: Arc<BrokerInner>,
}

struct BrokerInner {
    client: Client,
    conn: ConnectionManager,
    consumer: String,
    config: BrokerConfig,
    reclaim: ReclaimConfig,
    retry: RetryConfig,
    /// Processor per `(topic, group)`, used to redeliver during reclaim.
    handlers: DashMap<GroupKey, Arc<dyn Processor>>,
    /// `(topic, group)` pairs with a reclaim sweep in flight.
    sweeps: DashMap<GroupKey, ()>,
    active_subscriptions: AtomicUsize,
    /// Failed `XREADGROUP` calls across all subscriptions.
    read_errors: AtomicU64,
}

impl std::fmt::Debug for RedisStreamBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStreamBroker")
            .field("redis_url", &self.inner.config.redis_url)
            .field("consumer", &self.inner.consumer)
            .field("active_subscriptions", &self.active_subscriptions())
            .finish()
    }
}

/// Open a connection manager, retrying per `retry`.
async fn connect_manager(client: &Client, url: &str, retry: &RetryConfig) -> Result<ConnectionManager> {
    let mut attempt = 0;

    loop {
        attempt += 1;

        // Wrap connection attempt in a timeout to avoid hanging on unreachable hosts
        let conn_result = timeout(retry.connection_timeout, client.get_connection_manager()).await;

        let err_msg = match conn_result {
            Ok(Ok(conn)) => {
                metrics::record_broker_connection(true);
                if attempt > 1 {
                    info!(url = %url, attempt, "Connected to Redis after retry");
                } else {
                    debug!(url = %url, "Connected to Redis");
                }
                return Ok(conn);
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("Connection timed out after {:?}", retry.connection_timeout),
        };

        metrics::record_broker_connection(false);
        if attempt >= retry.max_attempts {
            error!(url = %url, attempt, error = %err_msg, "Failed to connect to Redis");
            return Err(RelayError::broker_msg("connect", err_msg));
        }

        let delay = retry.delay_for_attempt(attempt);
        warn!(url = %url, attempt, error = %err_msg, delay_ms = delay.as_millis() as u64, "Redis connection failed, retrying");
        tokio::time::sleep(delay).await;
    }
}

impl RedisStreamBroker {
    /// Connect to Redis.
    ///
    /// Retries with exponential backoff according to `retry`.
    pub async fn connect(
        config: BrokerConfig,
        reclaim: ReclaimConfig,
        consumer: impl Into<String>,
        retry: RetryConfig,
    ) -> Result<Self> {
        let consumer = consumer.into();
        info!(url = %config.redis_url, consumer = %consumer, "Connecting to Redis broker");

        let client = Client::open(config.redis_url.as_str())
            .map_err(|e| RelayError::Config(format!("Invalid Redis URL: {}", e)))?;
        let conn = connect_manager(&client, &config.redis_url, &retry).await?;

        Ok(Self {
            inner: Arc::new(BrokerInner {
                client,
                conn,
                consumer,
                config,
                reclaim,
                retry,
                handlers: DashMap::new(),
                sweeps: DashMap::new(),
                active_subscriptions: AtomicUsize::new(0),
                read_errors: AtomicU64::new(0),
            }),
        })
    }

    /// Consumer name used in every group this broker joins.
    pub fn consumer_name(&self) -> &str {
        &self.inner.consumer
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.inner.config
    }

    pub fn active_subscriptions(&self) -> usize {
        self.inner.active_subscriptions.load(Ordering::Acquire)
    }

    /// Failed stream reads since the broker connected.
    pub fn read_errors(&self) -> u64 {
        self.inner.read_errors.load(Ordering::Acquire)
    }

    fn record_read_error(&self) {
        self.inner.read_errors.fetch_add(1, Ordering::AcqRel);
    }

    fn conn(&self) -> ConnectionManager {
        self.inner.conn.clone()
    }

    /// Check the connection with PING.
    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.conn();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| RelayError::broker("PING", e))?;
        Ok(())
    }

    /// Create `group` on `topic` (and the stream itself) if missing.
    ///
    /// New groups start at the stream's end. An existing group is left alone.
    pub async fn ensure_group(&self, topic: &str, group: &str) -> Result<()> {
        self.create_group(topic, group, "$").await
    }

    /// Recreate a group that vanished under a running subscription.
    ///
    /// Starts at `0`, so entries appended while the group was missing are
    /// still delivered. Entries the old group had already acknowledged are
    /// delivered again; replay is idempotent by identity.
    pub async fn recreate_group(&self, topic: &str, group: &str) -> Result<()> {
        self.create_group(topic, group, "0").await
    }

    async fn create_group(&self, topic: &str, group: &str, start: &str) -> Result<()> {
        let mut conn = self.conn();
        let result: redis::RedisResult<()> = conn.xgroup_create_mkstream(topic, group, start).await;
        match result {
            Ok(()) => {
                info!(topic = %topic, group = %group, start = %start, "Created consumer group");
                Ok(())
            }
            Err(e) if is_busy_group(&e) => {
                debug!(topic = %topic, group = %group, "Consumer group already exists");
                Ok(())
            }
            Err(e) => Err(RelayError::broker("XGROUP CREATE", e)),
        }
    }

    /// Append one entry with a single `payload` field.
    pub async fn publish_bytes(&self, topic: &str, payload: &[u8]) -> Result<String> {
        let max_len = self.inner.config.max_len_for(topic);
        let mut conn = self.conn();
        let result: redis::RedisResult<String> = conn
            .xadd_maxlen(topic, StreamMaxlen::Approx(max_len), "*", &[("payload", payload)])
            .await;

        metrics::record_publish(topic, result.is_ok());
        let id = result.map_err(|e| RelayError::broker("XADD", e))?;
        debug!(topic = %topic, id = %id, bytes = payload.len(), "Published entry");
        Ok(id)
    }

    /// Acknowledge entries, removing them from the group's pending list.
    pub async fn ack(&self, topic: &str, group: &str, ids: &[String]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn();
        let result: redis::RedisResult<u64> = conn.xack(topic, group, ids).await;
        metrics::record_ack(topic, group, result.is_ok());
        result.map_err(|e| RelayError::broker("XACK", e))
    }

    /// Number of entries in a stream.
    pub async fn stream_len(&self, topic: &str) -> Result<u64> {
        let mut conn = self.conn();
        conn.xlen(topic).await.map_err(|e| RelayError::broker("XLEN", e))
    }

    /// Summary of a group's pending list: count and id range.
    pub async fn pending_summary(&self, topic: &str, group: &str) -> Result<PendingSummary> {
        let mut conn = self.conn();
        let reply: StreamPendingReply = conn
            .xpending(topic, group)
            .await
            .map_err(|e| RelayError::broker("XPENDING", e))?;

        let summary = match reply {
            StreamPendingReply::Empty => PendingSummary::default(),
            StreamPendingReply::Data(data) => PendingSummary {
                count: data.count as u64,
                lowest_id: Some(data.start_id),
                highest_id: Some(data.end_id),
            },
        };
        metrics::set_pending_entries(topic, group, summary.count);
        Ok(summary)
    }

    /// Append a dead letter to `{topic}.{group}.deadletter`.
    pub async fn write_dead_letter(&self, letter: &DeadLetter) -> Result<String> {
        let stream = dead_letter_topic(&letter.topic, &letter.group);
        let max_len = self.inner.config.max_len_for(&stream);
        let fields = letter.stream_fields();
        let mut conn = self.conn();

        let id: String = conn
            .xadd_maxlen(&stream, StreamMaxlen::Approx(max_len), "*", fields.as_slice())
            .await
            .map_err(|e| RelayError::broker("XADD deadletter", e))?;

        metrics::record_dead_letter(&letter.topic, letter.reason.as_str());
        warn!(
            stream = %stream,
            origin_id = %letter.origin_id,
            reason = %letter.reason,
            key = letter.key.as_deref().unwrap_or(""),
            "Dead-lettered entry"
        );
        Ok(id)
    }

    /// Processor registered for `(topic, group)` by a live subscription.
    pub fn handler(&self, topic: &str, group: &str) -> Option<Arc<dyn Processor>> {
        self.inner
            .handlers
            .get(&group_key(topic, group))
            .map(|h| Arc::clone(h.value()))
    }

    /// Groups this broker has subscribed, as `(topic, group)` pairs.
    pub fn subscribed_groups(&self) -> Vec<(String, String)> {
        let mut groups: Vec<_> = self.inner.handlers.iter().map(|e| e.key().clone()).collect();
        groups.sort();
        groups
    }

    fn unregister_handler(&self, topic: &str, group: &str, processor: &Arc<dyn Processor>) {
        self.inner
            .handlers
            .remove_if(&group_key(topic, group), |_, current| Arc::ptr_eq(current, processor));
    }

    async fn start_subscription(
        &self,
        topic: &str,
        group: &str,
        processor: Arc<dyn Processor>,
    ) -> Result<Subscription> {
        self.ensure_group(topic, group).await?;

        // Dedicated connection: XREADGROUP BLOCK would stall the shared one.
        let read_conn = connect_manager(&self.inner.client, &self.inner.config.redis_url, &self.inner.retry).await?;

        self.inner
            .handlers
            .insert(group_key(topic, group), Arc::clone(&processor));
        let active = self.inner.active_subscriptions.fetch_add(1, Ordering::AcqRel) + 1;
        metrics::set_active_subscriptions(active);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let span = info_span!("consumer", topic = %topic, group = %group, consumer = %self.inner.consumer);
        let task = consumer::ConsumerLoop {
            broker: self.clone(),
            conn: read_conn,
            topic: topic.to_string(),
            group: group.to_string(),
            processor,
            shutdown_rx,
        };
        let handle = tokio::spawn(task.run().instrument(span));

        info!(topic = %topic, group = %group, consumer = %self.inner.consumer, "Subscribed");
        Ok(Subscription::new(topic, group, self.inner.consumer.clone(), shutdown_tx, handle))
    }
}

fn is_busy_group(e: &redis::RedisError) -> bool {
    e.code() == Some("BUSYGROUP") || e.to_string().contains("BUSYGROUP")
}

fn is_no_group(e: &redis::RedisError) -> bool {
    e.code() == Some("NOGROUP") || e.to_string().contains("NOGROUP")
}

impl MessageBus for RedisStreamBroker {
    fn publish_raw<'a>(&'a self, topic: &'a str, payload: Vec<u8>) -> BoxFuture<'a, String> {
        Box::pin(async move { self.publish_bytes(topic, &payload).await })
    }

    fn subscribe<'a>(
        &'a self,
        topic: &'a str,
        group: &'a str,
        processor: Arc<dyn Processor>,
    ) -> BoxFuture<'a, Subscription> {
        Box::pin(self.start_subscription(topic, group, processor))
    }
}

impl DeadLetterSink for RedisStreamBroker {
    fn name(&self) -> &'static str {
        "stream"
    }

    fn write<'a>(&'a self, letter: DeadLetter) -> BoxFuture<'a, ()> {
        Box::pin(async move { self.write_dead_letter(&letter).await.map(|_| ()) })
    }
}
