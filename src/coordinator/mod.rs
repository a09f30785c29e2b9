// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Relay engine coordinator.
//!
//! The main orchestrator that ties together:
//! - The Redis Streams broker via [`crate::broker::RedisStreamBroker`]
//! - Mutation capture on the local store via [`crate::capture::MutationCapture`]
//! - Mutation replay from the sync topic via [`crate::replay::MutationReplayer`]
//! - Periodic reclaim sweeps and backfill via a [`Scheduler`]
//!
//! # Delivery guarantees
//!
//! Capture publishes once, inline, with no retry. A write whose publish fails
//! is logged and its envelope is recorded in the abandoned file with reason
//! `publish_failed`; nothing replays that file automatically. Pair capture with
//! scheduled backfill (`backfill.scheduled = true`, window wider than the
//! interval) to converge replicas after broker outages.

mod schedule;
mod types;

pub use schedule::{job_fn, IntervalScheduler, JobFn, Scheduler};
pub use types::{EngineState, HealthCheck, SubscriptionHealth};

use crate::abandoned::AbandonedSink;
use crate::backfill::BackfillPublisher;
use crate::broker::{RedisStreamBroker, SweepOutcome};
use crate::capture::MutationCapture;
use crate::channel::Channel;
use crate::config::RelayConfig;
use crate::deadletter::{DeadLetterSink, FallbackDeadLetter};
use crate::error::{RelayError, Result};
use crate::messaging::{MessageBus, Processor, Subscription};
use crate::metrics;
use crate::registry::TypeRegistry;
use crate::replay::{MutationReplayer, ShardResolver};
use crate::resilience::{RateLimiter, RetryConfig};
use crate::store::SqlStore;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// How long shutdown waits for each subscription and job to drain.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// The mutation relay engine.
///
/// Owns the broker connection and wires the local store, the type registry
/// and the sync topic together. One engine per process.
pub struct RelayEngine {
    config: RelayConfig,
    registry: Arc<TypeRegistry>,
    store: Arc<SqlStore>,

    state_tx: watch::Sender<EngineState>,
    state_rx: watch::Receiver<EngineState>,

    consumer: String,
    retry: RetryConfig,
    scheduler: Arc<dyn Scheduler>,
    shard: Option<Arc<dyn ShardResolver>>,

    /// Set once `start()` has connected.
    broker: Option<RedisStreamBroker>,
    abandoned: Option<Arc<AbandonedSink>>,
    subscriptions: Vec<Subscription>,
}

impl RelayEngine {
    /// Create an engine around an open store.
    ///
    /// The engine starts in `Created` state. Call [`start()`](Self::start)
    /// to connect and begin relaying.
    pub fn new(config: RelayConfig, registry: Arc<TypeRegistry>, store: Arc<SqlStore>) -> Self {
        let (state_tx, state_rx) = watch::channel(EngineState::Created);
        let consumer = config.resolve_consumer_name();

        Self {
            config,
            registry,
            store,
            state_tx,
            state_rx,
            consumer,
            retry: RetryConfig::startup(),
            scheduler: IntervalScheduler::new(),
            shard: None,
            broker: None,
            abandoned: None,
            subscriptions: Vec::new(),
        }
    }

    /// Open the store described by `config.store`, then [`new`](Self::new).
    pub async fn open(config: RelayConfig, registry: Arc<TypeRegistry>) -> Result<Self> {
        let store = SqlStore::open(&config.store).await?;
        Ok(Self::new(config, registry, Arc::new(store)))
    }

    /// Replace the in-process scheduler.
    pub fn with_scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = scheduler;
        self
    }

    /// Route replayed rows through `resolver`.
    pub fn with_shard_resolver(mut self, resolver: Arc<dyn ShardResolver>) -> Self {
        self.shard = Some(resolver);
        self
    }

    /// Retry policy for the broker connection (default: [`RetryConfig::startup`]).
    pub fn with_retry_config(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<TypeRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<SqlStore> {
        &self.store
    }

    pub fn consumer_name(&self) -> &str {
        &self.consumer
    }

    /// Get current engine state.
    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state(), EngineState::Running)
    }

    /// The connected broker, once started.
    pub fn broker(&self) -> Option<&RedisStreamBroker> {
        self.broker.as_ref()
    }

    /// The broker as a [`MessageBus`], once started.
    pub fn bus(&self) -> Option<Arc<dyn MessageBus>> {
        self.broker.clone().map(|b| Arc::new(b) as Arc<dyn MessageBus>)
    }

    /// Health snapshot. Performs no network I/O.
    pub fn health_check(&self) -> HealthCheck {
        let state = self.state();
        let subscriptions: Vec<SubscriptionHealth> = self
            .subscriptions
            .iter()
            .map(|s| SubscriptionHealth {
                topic: s.topic().to_string(),
                group: s.group().to_string(),
                finished: s.is_finished(),
            })
            .collect();
        let ready = state == EngineState::Running && subscriptions.iter().all(|s| !s.finished);

        HealthCheck {
            state,
            ready,
            consumer: self.consumer.clone(),
            subscriptions,
            scheduled_jobs: self.scheduler.jobs(),
            registered_keys: self.registry.len(),
        }
    }

    /// Start the relay engine.
    ///
    /// 1. Starts the abandoned-file writer
    /// 2. Connects to Redis (retrying per the retry policy)
    /// 3. Installs the capture hook on the store
    /// 4. Subscribes the replayer to the sync topic (if enabled)
    /// 5. Schedules reclaim sweeps and backfill (if enabled)
    pub async fn start(&mut self) -> Result<()> {
        if self.state() != EngineState::Created {
            return Err(RelayError::InvalidState {
                expected: "Created".to_string(),
                actual: self.state().to_string(),
            });
        }

        info!(
            consumer = %self.consumer,
            topic = %self.config.sync_topic,
            group = %self.config.replay_group,
            keys = self.registry.len(),
            "Starting relay engine"
        );
        self.set_state(EngineState::Connecting);

        let abandoned = Arc::new(AbandonedSink::spawn(&self.config.abandoned));
        self.abandoned = Some(Arc::clone(&abandoned));

        let broker = match RedisStreamBroker::connect(
            self.config.broker.clone(),
            self.config.reclaim.clone(),
            self.consumer.clone(),
            self.retry.clone(),
        )
        .await
        {
            Ok(broker) => broker,
            Err(e) => {
                error!(error = %e, "Failed to connect to broker");
                self.set_state(EngineState::Failed);
                return Err(e);
            }
        };
        self.broker = Some(broker.clone());
        let bus: Arc<dyn MessageBus> = Arc::new(broker.clone());

        let capture = MutationCapture::new(
            Arc::clone(&self.registry),
            Arc::clone(&bus),
            Arc::clone(&abandoned) as Arc<dyn DeadLetterSink>,
            self.config.sync_topic.clone(),
        );
        self.store.add_hook(Arc::new(capture));
        info!(topic = %self.config.sync_topic, "Capture hook installed");

        if self.config.replay.enabled {
            let dead_letters: Arc<dyn DeadLetterSink> = Arc::new(FallbackDeadLetter::new(
                Arc::new(broker.clone()),
                Arc::clone(&abandoned) as Arc<dyn DeadLetterSink>,
            ));
            let mut replayer = MutationReplayer::new(Arc::clone(&self.registry), Arc::clone(&self.store), dead_letters)
                .with_consumer(self.consumer.clone());
            if let Some(resolver) = &self.shard {
                replayer = replayer.with_shard_resolver(Arc::clone(resolver));
            }

            let topic = self.config.sync_topic.clone();
            let group = self.config.replay_group.clone();
            match bus.subscribe(&topic, &group, Arc::new(replayer)).await {
                Ok(subscription) => self.subscriptions.push(subscription),
                Err(e) => {
                    error!(error = %e, "Failed to subscribe replayer");
                    self.set_state(EngineState::Failed);
                    return Err(e);
                }
            }
        }

        if let Err(e) = self.schedule_jobs(&broker, &bus) {
            self.set_state(EngineState::Failed);
            return Err(e);
        }

        self.set_state(EngineState::Running);
        info!(
            subscriptions = self.subscriptions.len(),
            jobs = self.scheduler.jobs().len(),
            "Relay engine running"
        );
        Ok(())
    }

    fn schedule_jobs(&self, broker: &RedisStreamBroker, bus: &Arc<dyn MessageBus>) -> Result<()> {
        if self.config.reclaim.enabled {
            let broker = broker.clone();
            self.scheduler.schedule(
                "reclaim",
                self.config.reclaim.interval_duration(),
                job_fn(move || {
                    let broker = broker.clone();
                    async move { reclaim_all(&broker).await }
                }),
            )?;
        }

        if self.config.backfill.scheduled {
            let publisher = Arc::new(self.build_backfill(Arc::clone(bus)));
            let keys = if self.config.backfill.keys.is_empty() {
                self.registry.keys()
            } else {
                self.config.backfill.keys.clone()
            };
            let window = self.config.backfill.window_duration();
            if window <= self.config.backfill.interval_duration() {
                warn!(
                    window = %self.config.backfill.window,
                    interval = %self.config.backfill.interval,
                    "Backfill window does not exceed its interval; rows written between runs may be missed"
                );
            }

            self.scheduler.schedule(
                "backfill",
                self.config.backfill.interval_duration(),
                job_fn(move || {
                    let publisher = Arc::clone(&publisher);
                    let keys = keys.clone();
                    async move {
                        for key in &keys {
                            publisher.run_recent(key, window).await?;
                        }
                        Ok(())
                    }
                }),
            )?;
        }
        Ok(())
    }

    fn build_backfill(&self, bus: Arc<dyn MessageBus>) -> BackfillPublisher {
        let mut publisher = BackfillPublisher::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.store),
            bus,
            self.config.sync_topic.clone(),
        )
        .with_page_size(self.config.backfill.page_size);

        if let Some(cfg) = self.config.backfill.rate_limit_config() {
            info!(
                rate_per_sec = cfg.refill_rate,
                burst = cfg.burst_size,
                "Rate limiting enabled for backfill"
            );
            publisher = publisher.with_rate_limiter(Arc::new(RateLimiter::new(cfg)));
        }
        publisher
    }

    /// A backfill publisher on the engine's broker and store.
    pub fn backfill_publisher(&self) -> Result<BackfillPublisher> {
        let bus = self.bus().ok_or_else(|| self.not_running())?;
        Ok(self.build_backfill(bus))
    }

    /// Subscribe an extra processor through the engine's broker.
    ///
    /// The subscription is reclaimed by the scheduled sweep and stopped on
    /// shutdown.
    pub async fn subscribe(&mut self, topic: &str, group: &str, processor: Arc<dyn Processor>) -> Result<()> {
        if !self.is_running() {
            return Err(self.not_running());
        }
        let broker = self.broker.clone().ok_or_else(|| self.not_running())?;
        let subscription = broker.subscribe(topic, group, processor).await?;
        self.subscriptions.push(subscription);
        Ok(())
    }

    /// Create a channel sized from `config.channel` and mirror it onto
    /// `topic` through the engine's broker.
    pub async fn channel<T>(&mut self, name: &str, topic: &str, group: &str) -> Result<Arc<Channel<T>>>
    where
        T: Clone + serde::Serialize + serde::de::DeserializeOwned + Send + Sync + 'static,
    {
        let abandoned = self.abandoned.clone().ok_or_else(|| self.not_running())?;
        let channel = Channel::new(name, self.config.channel.capacity);
        channel.start()?;
        self.subscribe(topic, group, channel.adaptor(abandoned as Arc<dyn DeadLetterSink>)).await?;
        Ok(channel)
    }

    /// Run a reclaim sweep over every subscribed group now.
    pub async fn reclaim_now(&self) -> Result<()> {
        let broker = self.broker.as_ref().ok_or_else(|| self.not_running())?;
        reclaim_all(broker).await
    }

    /// Gracefully shut down.
    ///
    /// Stops scheduled jobs, drains subscriptions (each finishes its current
    /// batch), flushes the abandoned file and checkpoints the store.
    pub async fn shutdown(&mut self) {
        let state = self.state();
        if matches!(state, EngineState::Stopped | EngineState::ShuttingDown) {
            return;
        }
        info!(from = %state, "Shutting down relay engine");
        self.set_state(EngineState::ShuttingDown);

        if let Err(e) = self.scheduler.shutdown(DRAIN_TIMEOUT).await {
            warn!(error = %e, "Scheduler shutdown failed");
        }

        // Drain concurrently so one slow processor does not stack timeouts.
        let subscriptions = std::mem::take(&mut self.subscriptions);
        let count = subscriptions.len();
        let drained = join_all(subscriptions.into_iter().map(|subscription| async move {
            let topic = subscription.topic().to_string();
            let group = subscription.group().to_string();
            subscription
                .unsubscribe_timeout(DRAIN_TIMEOUT)
                .await
                .map_err(|e| (topic, group, e))
        }))
        .await;
        for (topic, group, e) in drained.into_iter().filter_map(|r| r.err()) {
            warn!(topic = %topic, group = %group, error = %e, "Subscription did not drain in time");
        }
        info!(count, "Subscriptions stopped");

        if let Some(abandoned) = self.abandoned.take() {
            abandoned.close().await;
        }

        if let Err(e) = self.store.checkpoint().await {
            warn!(error = %e, "Store checkpoint failed during shutdown");
        }

        self.set_state(EngineState::Stopped);
        info!("Relay engine stopped");
    }

    fn set_state(&self, state: EngineState) {
        let _ = self.state_tx.send(state);
        metrics::set_engine_state(&state.to_string());
    }

    fn not_running(&self) -> RelayError {
        RelayError::InvalidState {
            expected: "Running".to_string(),
            actual: self.state().to_string(),
        }
    }
}

/// One sweep per subscribed group; failures are logged and the rest continue.
async fn reclaim_all(broker: &RedisStreamBroker) -> Result<()> {
    let mut failed = 0usize;
    for (topic, group) in broker.subscribed_groups() {
        match broker.reclaim(&topic, &group).await {
            Ok(SweepOutcome::Completed(_)) | Ok(SweepOutcome::AlreadyRunning) => {}
            Err(e) => {
                warn!(topic = %topic, group = %group, error = %e, "Reclaim sweep failed");
                failed += 1;
            }
        }
    }
    if failed > 0 {
        return Err(RelayError::Internal(format!("{} reclaim sweep(s) failed", failed)));
    }
    Ok(())
}
