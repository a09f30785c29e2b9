// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Reclaim sweep: drain a group's pending-entry list.
//!
//! Entries land in the pending list when a processor fails, when an ack is
//! lost, or when a consumer dies mid-batch. The sweep walks the whole list in
//! ascending id order, one `XPENDING` page at a time:
//!
//! | Entry state | Action |
//! |-------------|--------|
//! | Gone from the stream (trimmed) | ack |
//! | Older than `max_pending` | dead-letter `expired`, ack |
//! | Redelivery succeeds | ack |
//! | Redelivery fails | dead-letter `reprocess_failed`, ack |
//! | No processor registered here | left pending |
//!
//! The ack after a dead-letter happens even if the dead-letter write failed:
//! a broken dead-letter stream must not pin the pending list forever.
//!
//! Only one sweep per `(topic, group)` runs at a time in this process; a
//! second call while one is in flight returns [`SweepOutcome::AlreadyRunning`].

use super::stream_id::{entry_age_ms, fields_to_pairs, get_bytes_field, next_stream_id, now_ms};
use super::{group_key, GroupKey, RedisStreamBroker};
use crate::deadletter::{DeadLetter, DeadLetterReason};
use crate::error::{RelayError, Result};
use crate::messaging::{Delivery, Processor};
use crate::metrics;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use redis::streams::{StreamPendingCountReply, StreamPendingId, StreamRangeReply};
use redis::AsyncCommands;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Counters from one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepStats {
    /// Pending entries examined.
    pub scanned: usize,
    /// Redelivered and acknowledged.
    pub redelivered: usize,
    /// Dead-lettered for age.
    pub expired: usize,
    /// Dead-lettered after a failed redelivery.
    pub failed: usize,
    /// Acknowledged because the stream no longer holds them.
    pub missing: usize,
    /// Left pending: no processor registered in this process.
    pub unhandled: usize,
    /// Dead-letter writes that failed (the entry was acknowledged anyway).
    pub dead_letter_errors: usize,
}

/// Result of a reclaim request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SweepOutcome {
    Completed(SweepStats),
    /// Another sweep of the same group is in progress.
    AlreadyRunning,
}

impl SweepOutcome {
    pub fn stats(&self) -> Option<&SweepStats> {
        match self {
            SweepOutcome::Completed(stats) => Some(stats),
            SweepOutcome::AlreadyRunning => None,
        }
    }
}

/// Marks a sweep as in flight until dropped.
struct SweepGuard<'a> {
    sweeps: &'a DashMap<GroupKey, ()>,
    key: GroupKey,
}

impl<'a> SweepGuard<'a> {
    fn acquire(sweeps: &'a DashMap<GroupKey, ()>, key: GroupKey) -> Option<Self> {
        match sweeps.entry(key.clone()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                slot.insert(());
                Some(Self { sweeps, key })
            }
        }
    }
}

impl Drop for SweepGuard<'_> {
    fn drop(&mut self) {
        self.sweeps.remove(&self.key);
    }
}

impl RedisStreamBroker {
    /// Sweep `(topic, group)` using the configured maximum pending age.
    pub async fn reclaim(&self, topic: &str, group: &str) -> Result<SweepOutcome> {
        let max_pending = self.inner.reclaim.max_pending_duration();
        self.reclaim_with(topic, group, max_pending).await
    }

    /// Sweep `(topic, group)`, dead-lettering entries older than `max_pending`.
    ///
    /// Broker errors while listing the pending entries abort the sweep and
    /// are returned; per-entry failures are counted in the stats.
    pub async fn reclaim_with(&self, topic: &str, group: &str, max_pending: Duration) -> Result<SweepOutcome> {
        let Some(_guard) = SweepGuard::acquire(&self.inner.sweeps, group_key(topic, group)) else {
            debug!(topic = %topic, group = %group, "Reclaim sweep already running");
            metrics::record_reclaim_skipped("already_running");
            return Ok(SweepOutcome::AlreadyRunning);
        };

        let span = info_span!("reclaim", topic = %topic, group = %group);
        async move {
            let started = Instant::now();
            let stats = self.sweep(topic, group, max_pending).await?;

            metrics::record_reclaim_sweep(
                topic,
                group,
                stats.scanned,
                stats.redelivered,
                stats.expired,
                stats.failed,
                stats.missing,
                started.elapsed(),
            );
            if stats.scanned > 0 {
                info!(
                    scanned = stats.scanned,
                    redelivered = stats.redelivered,
                    expired = stats.expired,
                    failed = stats.failed,
                    missing = stats.missing,
                    unhandled = stats.unhandled,
                    duration_ms = started.elapsed().as_millis() as u64,
                    "Reclaim sweep complete"
                );
            } else {
                debug!("Reclaim sweep found nothing pending");
            }
            Ok(SweepOutcome::Completed(stats))
        }
        .instrument(span)
        .await
    }

    async fn sweep(&self, topic: &str, group: &str, max_pending: Duration) -> Result<SweepStats> {
        let mut conn = self.conn();
        let mut stats = SweepStats::default();
        let page_size = self.inner.reclaim.page_size.max(1);
        let max_pending_ms = max_pending.as_millis() as u64;
        let handler = self.handler(topic, group);
        let now = now_ms();

        let mut start = "-".to_string();
        loop {
            let page: StreamPendingCountReply = conn
                .xpending_count(topic, group, &start, "+", page_size)
                .await
                .map_err(|e| RelayError::broker("XPENDING", e))?;

            let Some(last) = page.ids.last().map(|p| p.id.clone()) else {
                break;
            };
            let full_page = page.ids.len() >= page_size;

            for pending in &page.ids {
                stats.scanned += 1;
                self.reclaim_entry(&mut conn, topic, group, pending, now, max_pending_ms, handler.as_ref(), &mut stats)
                    .await?;
            }

            if !full_page {
                break;
            }
            match next_stream_id(&last) {
                Some(next) => start = next,
                None => break,
            }
        }

        Ok(stats)
    }

    #[allow(clippy::too_many_arguments)]
    async fn reclaim_entry(
        &self,
        conn: &mut ConnectionManager,
        topic: &str,
        group: &str,
        pending: &StreamPendingId,
        now: u64,
        max_pending_ms: u64,
        handler: Option<&Arc<dyn Processor>>,
        stats: &mut SweepStats,
    ) -> Result<()> {
        let id = pending.id.as_str();
        let range: StreamRangeReply = conn
            .xrange(topic, id, id)
            .await
            .map_err(|e| RelayError::broker("XRANGE", e))?;

        let Some(entry) = range.ids.into_iter().next() else {
            debug!(id = %id, "Pending entry no longer in stream, acknowledging");
            self.ack_logged(topic, group, id).await;
            stats.missing += 1;
            return Ok(());
        };

        let payload = get_bytes_field(&entry.map, "payload");
        let letter = |reason: DeadLetterReason| {
            DeadLetter::new(
                reason,
                topic,
                group,
                id,
                payload.as_ref().cloned().unwrap_or_default(),
            )
            .with_consumer(pending.consumer.clone())
            .with_fields(fields_to_pairs(&entry.map))
        };

        let age_ms = entry_age_ms(id, now).unwrap_or(0);
        if age_ms > max_pending_ms {
            warn!(
                id = %id,
                age_ms,
                times_delivered = pending.times_delivered,
                "Pending entry expired"
            );
            let dead = letter(DeadLetterReason::Expired)
                .with_error(format!("pending for {}ms, delivered {} times", age_ms, pending.times_delivered));
            self.dead_letter_and_ack(dead, stats).await;
            stats.expired += 1;
            return Ok(());
        }

        let Some(handler) = handler else {
            stats.unhandled += 1;
            return Ok(());
        };

        let payload = match &payload {
            Ok(payload) => payload.clone(),
            Err(e) => {
                let dead = letter(DeadLetterReason::MissingPayload).with_error(e);
                self.dead_letter_and_ack(dead, stats).await;
                stats.failed += 1;
                return Ok(());
            }
        };

        let delivery = Delivery {
            topic: topic.to_string(),
            group: group.to_string(),
            id: id.to_string(),
            payload,
        };
        let started = Instant::now();
        let result = handler.process(&delivery).await;
        metrics::record_processed(topic, group, result.is_ok(), started.elapsed());

        match result {
            Ok(()) => {
                self.ack_logged(topic, group, id).await;
                stats.redelivered += 1;
            }
            Err(e) => {
                warn!(id = %id, error = %e, "Redelivery failed");
                let dead = letter(DeadLetterReason::ReprocessFailed).with_error(&e);
                self.dead_letter_and_ack(dead, stats).await;
                stats.failed += 1;
            }
        }
        Ok(())
    }

    /// Dead-letter, then acknowledge whatever happened to the dead-letter write.
    async fn dead_letter_and_ack(&self, letter: DeadLetter, stats: &mut SweepStats) {
        if let Err(e) = self.write_dead_letter(&letter).await {
            error!(id = %letter.origin_id, error = %e, "Dead-letter write failed, acknowledging anyway");
            metrics::record_dead_letter_write_failure("stream");
            stats.dead_letter_errors += 1;
        }
        self.ack_logged(&letter.topic, &letter.group, &letter.origin_id).await;
    }

    async fn ack_logged(&self, topic: &str, group: &str, id: &str) {
        if let Err(e) = self.ack(topic, group, &[id.to_string()]).await {
            warn!(id = %id, error = %e, "Failed to acknowledge pending entry");
        }
    }
}
