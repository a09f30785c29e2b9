// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Backfill: re-announce stored rows for a time window.
//!
//! The capture hook drops mutations when the broker is unavailable. Backfill
//! repairs that by publishing every row touched in `[since, to)`:
//!
//! 1. live rows by `(updated_at, id)` as `Save`
//! 2. soft-deleted rows by `(deleted_at, id)` as `Delete`
//!
//! Rows are read in pages (default 1000) with a keyset cursor, and a page
//! shorter than the page size ends the pass. Replaying is upsert/delete by
//! identity, so publishing a row twice is harmless.

use crate::config::DEFAULT_BACKFILL_PAGE_SIZE;
use crate::envelope::{Action, MutationEnvelope};
use crate::error::{RelayError, Result};
use crate::messaging::MessageBus;
use crate::metrics;
use crate::registry::TypeRegistry;
use crate::resilience::RateLimiter;
use crate::store::{PageCursor, SqlStore, StoredRow};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, info_span, Instrument};

/// Counters from one backfill run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackfillStats {
    /// Non-empty pages read, both passes.
    pub pages: usize,
    pub saved: usize,
    pub deleted: usize,
}

impl BackfillStats {
    pub fn published(&self) -> usize {
        self.saved + self.deleted
    }
}

/// Publishes stored rows to the sync topic.
pub struct BackfillPublisher {
    registry: Arc<TypeRegistry>,
    store: Arc<SqlStore>,
    bus: Arc<dyn MessageBus>,
    topic: String,
    page_size: usize,
    limiter: Option<Arc<RateLimiter>>,
}

impl BackfillPublisher {
    pub fn new(
        registry: Arc<TypeRegistry>,
        store: Arc<SqlStore>,
        bus: Arc<dyn MessageBus>,
        topic: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            store,
            bus,
            topic: topic.into(),
            page_size: DEFAULT_BACKFILL_PAGE_SIZE,
            limiter: None,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Throttle publishes through `limiter`.
    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Publish every row of `key` touched in `[since, to)`.
    ///
    /// Stops at the first store or broker error; rows already published stay
    /// published, so rerunning the same window is safe.
    pub async fn run(&self, key: &str, since: DateTime<Utc>, to: DateTime<Utc>) -> Result<BackfillStats> {
        let descriptor = self
            .registry
            .lookup(key)
            .ok_or_else(|| RelayError::UnknownKey(key.to_string()))?;
        let table = descriptor.table_name();

        let span = info_span!("backfill", key = %key, table = %table);
        async move {
            let started = Instant::now();
            let mut stats = BackfillStats::default();

            self.pass(key, table, Action::Save, since, to, &mut stats).await?;
            self.pass(key, table, Action::Delete, since, to, &mut stats).await?;

            metrics::record_backfill_run(key, started.elapsed());
            info!(
                pages = stats.pages,
                saved = stats.saved,
                deleted = stats.deleted,
                since = %since,
                to = %to,
                duration_ms = started.elapsed().as_millis() as u64,
                "Backfill complete"
            );
            Ok(stats)
        }
        .instrument(span)
        .await
    }

    /// Backfill the window ending now.
    pub async fn run_recent(&self, key: &str, window: std::time::Duration) -> Result<BackfillStats> {
        let to = Utc::now();
        let since = chrono::Duration::from_std(window)
            .ok()
            .and_then(|w| to.checked_sub_signed(w))
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
        self.run(key, since, to).await
    }

    async fn pass(
        &self,
        key: &str,
        table: &str,
        action: Action,
        since: DateTime<Utc>,
        to: DateTime<Utc>,
        stats: &mut BackfillStats,
    ) -> Result<()> {
        let mut after: Option<PageCursor> = None;

        loop {
            let page = match action {
                Action::Save => self.store.page_updated(table, since, to, after, self.page_size).await?,
                Action::Delete => self.store.page_deleted(table, since, to, after, self.page_size).await?,
            };
            if page.is_empty() {
                break;
            }

            for row in &page {
                self.publish_row(key, action, row).await?;
            }

            stats.pages += 1;
            match action {
                Action::Save => stats.saved += page.len(),
                Action::Delete => stats.deleted += page.len(),
            }
            metrics::record_backfill_page(key, action.as_str(), page.len());
            debug!(action = %action, rows = page.len(), "Backfill page published");

            if page.len() < self.page_size {
                break;
            }
            after = page.last().map(|row| cursor_of(row, action));
        }
        Ok(())
    }

    async fn publish_row(&self, key: &str, action: Action, row: &StoredRow) -> Result<()> {
        if let Some(limiter) = &self.limiter {
            limiter.acquire().await;
        }
        let envelope = MutationEnvelope::new(key, action, row.payload.clone().into_bytes());
        self.bus.publish_raw(&self.topic, envelope.encode()?).await?;
        Ok(())
    }
}

fn cursor_of(row: &StoredRow, action: Action) -> PageCursor {
    match action {
        Action::Save => (row.updated_at, row.id),
        Action::Delete => (row.deleted_at.unwrap_or(row.updated_at), row.id),
    }
}
