// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Consumer-group read loop.
//!
//! One task per subscription:
//! 1. `XREADGROUP ... >` blocks for new entries
//! 2. Each entry's `payload` goes to the processor
//! 3. `Ok` → `XACK`; `Err` → logged, left pending for reclaim
//!
//! # Read Errors
//!
//! The loop never gives up on a read error. It waits on a bounded
//! exponential backoff (reset by the first successful read) so a broken
//! broker does not spin the CPU. A `NOGROUP` error recreates the group from
//! the start of the stream so nothing appended while it was gone is skipped.
//!
//! # Graceful Shutdown
//!
//! Cancellation interrupts a blocked read immediately. A batch that was
//! already read is processed and acknowledged before the task exits.

use super::stream_id::{fields_to_pairs, get_bytes_field};
use super::{is_no_group, RedisStreamBroker};
use crate::deadletter::{DeadLetter, DeadLetterReason};
use crate::messaging::{Delivery, Processor};
use crate::metrics;
use crate::resilience::{Backoff, RetryConfig};
use redis::aio::ConnectionManager;
use redis::streams::{StreamId, StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, trace, warn};

pub(super) struct ConsumerLoop {
    pub(super) broker: RedisStreamBroker,
    pub(super) conn: ConnectionManager,
    pub(super) topic: String,
    pub(super) group: String,
    pub(super) processor: Arc<dyn Processor>,
    pub(super) shutdown_rx: watch::Receiver<bool>,
}

impl ConsumerLoop {
    pub(super) async fn run(mut self) {
        info!("Starting consumer loop");

        let block_ms = self.broker.config().block_timeout_duration().as_millis() as usize;
        let opts = StreamReadOptions::default()
            .group(&self.group, self.broker.consumer_name())
            .block(block_ms)
            .count(self.broker.config().batch_size);
        let mut backoff = Backoff::new(RetryConfig::read_loop());

        loop {
            if *self.shutdown_rx.borrow() {
                break;
            }

            let read_start = Instant::now();
            let keys = [&self.topic];
            let result: redis::RedisResult<StreamReadReply> = tokio::select! {
                biased;
                _ = self.shutdown_rx.changed() => {
                    info!("Shutdown signal received during read");
                    break;
                }
                result = self.conn.xread_options(&keys, &[">"], &opts) => result,
            };

            match result {
                Ok(reply) => {
                    if backoff.attempts() > 0 {
                        info!(attempts = backoff.attempts(), "Stream read recovered");
                        backoff.reset();
                        metrics::set_read_backoff(&self.topic, &self.group, Duration::ZERO);
                    }

                    let entries: Vec<StreamId> = reply.keys.into_iter().flat_map(|k| k.ids).collect();
                    metrics::record_stream_read(&self.topic, &self.group, entries.len(), read_start.elapsed());
                    if entries.is_empty() {
                        continue;
                    }
                    trace!(count = entries.len(), "Read batch");

                    // Finish the batch even if shutdown arrives mid-way.
                    for entry in entries {
                        self.handle_entry(entry).await;
                    }
                }
                Err(e) => {
                    metrics::record_stream_read_error(&self.topic, &self.group);
                    self.broker.record_read_error();

                    if is_no_group(&e) {
                        warn!(error = %e, "Consumer group missing, recreating");
                        if let Err(create_err) = self.broker.recreate_group(&self.topic, &self.group).await {
                            error!(error = %create_err, "Failed to recreate consumer group");
                        }
                    }

                    let delay = backoff.next_delay();
                    metrics::set_read_backoff(&self.topic, &self.group, delay);
                    warn!(
                        error = %e,
                        attempt = backoff.attempts(),
                        delay_ms = delay.as_millis() as u64,
                        "Stream read failed, backing off"
                    );

                    tokio::select! {
                        biased;
                        _ = self.shutdown_rx.changed() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        self.broker
            .unregister_handler(&self.topic, &self.group, &self.processor);
        let remaining = self
            .broker
            .inner
            .active_subscriptions
            .fetch_sub(1, Ordering::AcqRel)
            .saturating_sub(1);
        metrics::set_active_subscriptions(remaining);
        info!("Consumer loop stopped");
    }

    async fn handle_entry(&self, entry: StreamId) {
        let payload = match get_bytes_field(&entry.map, "payload") {
            Ok(payload) => payload,
            Err(e) => {
                // Nothing to hand the processor: dead-letter it and ack so it is not redelivered.
                let letter = DeadLetter::new(
                    DeadLetterReason::MissingPayload,
                    self.topic.clone(),
                    self.group.clone(),
                    entry.id.clone(),
                    Vec::new(),
                )
                .with_consumer(self.broker.consumer_name())
                .with_fields(fields_to_pairs(&entry.map))
                .with_error(&e);
                if let Err(dl_err) = self.broker.write_dead_letter(&letter).await {
                    error!(id = %entry.id, error = %dl_err, "Failed to dead-letter entry without payload");
                    metrics::record_dead_letter_write_failure("stream");
                }
                if let Err(ack_err) = self.broker.ack(&self.topic, &self.group, &[entry.id.clone()]).await {
                    warn!(id = %entry.id, error = %ack_err, "Failed to acknowledge entry");
                }
                return;
            }
        };

        let delivery = Delivery {
            topic: self.topic.clone(),
            group: self.group.clone(),
            id: entry.id,
            payload,
        };

        let started = Instant::now();
        let result = self.processor.process(&delivery).await;
        metrics::record_processed(&self.topic, &self.group, result.is_ok(), started.elapsed());

        match result {
            Ok(()) => {
                if let Err(e) = self.broker.ack(&self.topic, &self.group, &[delivery.id.clone()]).await {
                    // Still pending; reclaim will redeliver.
                    warn!(id = %delivery.id, error = %e, "Failed to acknowledge entry");
                } else {
                    debug!(id = %delivery.id, "Processed and acknowledged");
                }
            }
            Err(e) => {
                warn!(id = %delivery.id, error = %e, retryable = e.is_retryable(), "Processing failed, leaving entry pending");
            }
        }
    }
}
