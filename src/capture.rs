// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Mutation capture: store writes → broker messages.
//!
//! [`MutationCapture`] is a [`StoreHook`]. After every successful create,
//! update or delete of a registered entity it publishes a
//! [`MutationEnvelope`] to the sync topic.
//!
//! # Delivery Is Best-Effort
//!
//! The hook publishes after the row is written. If the broker is down the
//! write still stands; the envelope goes to the abandoned sink with reason
//! `publish_failed` and is not retried, so this path alone loses messages.
//! Deployments must also run the
//! [`BackfillPublisher`](crate::backfill::BackfillPublisher) on a schedule
//! (see `BackfillConfig::scheduled`) to re-announce recent rows.

use crate::deadletter::{DeadLetter, DeadLetterReason, DeadLetterSink};
use crate::envelope::{Action, MutationEnvelope};
use crate::error::Result;
use crate::messaging::{BoxFuture, MessageBus};
use crate::metrics;
use crate::registry::{ErasedEntity, TypeRegistry};
use crate::store::{HookContext, StoreHook};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// What the hook did with one write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureOutcome {
    /// Failed write, suppressed hooks or no rows touched.
    Skipped,
    /// Entity type has no registry key.
    Unregistered,
    /// Identity was zero; a marker went to the abandoned sink.
    ZeroIdentity,
    /// Published with this broker id.
    Published(String),
    /// Broker refused the publish; a marker went to the abandoned sink.
    PublishFailed,
}

impl CaptureOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            CaptureOutcome::Skipped => "skipped",
            CaptureOutcome::Unregistered => "unregistered",
            CaptureOutcome::ZeroIdentity => "zero_identity",
            CaptureOutcome::Published(_) => "published",
            CaptureOutcome::PublishFailed => "publish_failed",
        }
    }
}

/// Publishes store mutations to the sync topic.
pub struct MutationCapture {
    registry: Arc<TypeRegistry>,
    bus: Arc<dyn MessageBus>,
    abandoned: Arc<dyn DeadLetterSink>,
    topic: String,
}

impl MutationCapture {
    pub fn new(
        registry: Arc<TypeRegistry>,
        bus: Arc<dyn MessageBus>,
        abandoned: Arc<dyn DeadLetterSink>,
        topic: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            bus,
            abandoned,
            topic: topic.into(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Handle one write.
    ///
    /// Only a marshal failure is returned as an error.
    pub async fn capture(
        &self,
        ctx: &HookContext,
        entity: &dyn ErasedEntity,
        action: Action,
    ) -> Result<CaptureOutcome> {
        if ctx.error.is_some() || ctx.hooks_suppressed || ctx.rows_affected == 0 {
            return Ok(CaptureOutcome::Skipped);
        }

        let Some(key) = self.registry.key_for(entity) else {
            warn!(table = %ctx.table, op = ctx.kind.as_str(), "Captured entity type is not registered, skipping");
            metrics::record_capture(ctx.table.as_str(), CaptureOutcome::Unregistered.as_str());
            return Ok(CaptureOutcome::Unregistered);
        };

        let payload = entity.to_json().map_err(|e| {
            error!(key = %key, error = %e, "Failed to marshal captured entity");
            metrics::record_capture(&key, "marshal_failed");
            e
        })?;

        let outcome = if entity.identity() == Some(0) {
            warn!(key = %key, op = ctx.kind.as_str(), "Captured entity has zero identity, recording marker");
            let marker = DeadLetter::new(DeadLetterReason::ZeroIdentity, self.topic.clone(), "", "", payload)
                .with_key(key.clone())
                .with_action(action)
                .with_error(format!("{} on {} with zero identity", ctx.kind.as_str(), ctx.table));
            if let Err(e) = self.abandoned.write(marker).await {
                error!(key = %key, error = %e, "Failed to record zero-identity marker");
            }
            CaptureOutcome::ZeroIdentity
        } else {
            let envelope = MutationEnvelope::new(key.clone(), action, payload);
            let bytes = envelope.encode()?;
            match self.bus.publish_raw(&self.topic, bytes.clone()).await {
                Ok(id) => {
                    debug!(key = %key, action = %action, stream_id = %id, "Published mutation");
                    CaptureOutcome::Published(id)
                }
                Err(e) => {
                    // The write is committed; backfill repairs the gap.
                    error!(key = %key, action = %action, error = %e, "Failed to publish mutation");
                    let marker = DeadLetter::new(DeadLetterReason::PublishFailed, self.topic.clone(), "", "", bytes)
                        .with_key(key.clone())
                        .with_action(action)
                        .with_error(&e);
                    if let Err(e) = self.abandoned.write(marker).await {
                        error!(key = %key, error = %e, "Failed to record publish-failure marker");
                    }
                    CaptureOutcome::PublishFailed
                }
            }
        };

        metrics::record_capture(&key, outcome.as_str());
        Ok(outcome)
    }
}

impl StoreHook for MutationCapture {
    fn after_create<'a>(&'a self, ctx: &'a HookContext, entity: &'a dyn ErasedEntity) -> BoxFuture<'a, ()> {
        Box::pin(async move { self.capture(ctx, entity, Action::Save).await.map(|_| ()) })
    }

    fn after_update<'a>(&'a self, ctx: &'a HookContext, entity: &'a dyn ErasedEntity) -> BoxFuture<'a, ()> {
        Box::pin(async move { self.capture(ctx, entity, Action::Save).await.map(|_| ()) })
    }

    fn after_delete<'a>(&'a self, ctx: &'a HookContext, entity: &'a dyn ErasedEntity) -> BoxFuture<'a, ()> {
        Box::pin(async move { self.capture(ctx, entity, Action::Delete).await.map(|_| ()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deadletter::MemoryDeadLetter;
    use crate::messaging::MemoryBus;
    use crate::registry::Entity;
    use crate::store::{MutationKind, SqlStore, WriteOptions};
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct Order {
        #[serde(rename = "ID")]
        id: u64,
        total: i64,
    }

    impl Entity for Order {
        fn table_name() -> &'static str {
            "orders"
        }
        fn registry_key() -> String {
            "shop.Order".to_string()
        }
        fn identity(&self) -> Option<u64> {
            Some(self.id)
        }
        fn set_identity(&mut self, id: u64) {
            self.id = id;
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Untracked {
        id: u64,
    }

    impl Entity for Untracked {
        fn table_name() -> &'static str {
            "untracked"
        }
        fn identity(&self) -> Option<u64> {
            Some(self.id)
        }
        fn set_identity(&mut self, id: u64) {
            self.id = id;
        }
    }

    fn ctx(kind: MutationKind, rows: u64) -> HookContext {
        HookContext {
            kind,
            table: "orders".into(),
            rows_affected: rows,
            error: None,
            hooks_suppressed: false,
        }
    }

    fn setup() -> (MutationCapture, Arc<MemoryBus>, Arc<MemoryDeadLetter>) {
        let registry = Arc::new(TypeRegistry::builder().register::<Order>().build());
        let bus = MemoryBus::new();
        let abandoned = MemoryDeadLetter::new();
        let capture = MutationCapture::new(registry, bus.clone(), abandoned.clone(), "entity.sync");
        (capture, bus, abandoned)
    }

    #[tokio::test]
    async fn test_publishes_envelope() {
        let (capture, bus, _) = setup();
        let order = Order { id: 4, total: 99 };

        let outcome = capture.capture(&ctx(MutationKind::Update, 1), &order, Action::Save).await.unwrap();
        assert!(matches!(outcome, CaptureOutcome::Published(_)));

        let published = bus.published_to("entity.sync");
        assert_eq!(published.len(), 1);
        let envelope = MutationEnvelope::decode(&published[0].payload).unwrap();
        assert_eq!(envelope.key, "shop.Order");
        assert_eq!(envelope.action, Action::Save);
        let decoded: Order = serde_json::from_slice(&envelope.payload).unwrap();
        assert_eq!(decoded, order);
    }

    #[tokio::test]
    async fn test_skips_noop_writes() {
        let (capture, bus, _) = setup();
        let order = Order { id: 4, total: 1 };

        let mut failed = ctx(MutationKind::Update, 1);
        failed.error = Some("disk full".into());
        let mut suppressed = ctx(MutationKind::Update, 1);
        suppressed.hooks_suppressed = true;

        for c in [ctx(MutationKind::Update, 0), failed, suppressed] {
            let outcome = capture.capture(&c, &order, Action::Save).await.unwrap();
            assert_eq!(outcome, CaptureOutcome::Skipped);
        }
        assert!(bus.published().is_empty());
    }

    #[tokio::test]
    async fn test_unregistered_type_is_ignored() {
        let (capture, bus, abandoned) = setup();
        let outcome = capture
            .capture(&ctx(MutationKind::Create, 1), &Untracked { id: 1 }, Action::Save)
            .await
            .unwrap();

        assert_eq!(outcome, CaptureOutcome::Unregistered);
        assert!(bus.published().is_empty());
        assert!(abandoned.letters().is_empty());
    }

    #[tokio::test]
    async fn test_zero_identity_goes_to_abandoned() {
        let (capture, bus, abandoned) = setup();
        let outcome = capture
            .capture(&ctx(MutationKind::Delete, 1), &Order { id: 0, total: 5 }, Action::Delete)
            .await
            .unwrap();

        assert_eq!(outcome, CaptureOutcome::ZeroIdentity);
        assert!(bus.published().is_empty());
        let letters = abandoned.letters();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].reason, DeadLetterReason::ZeroIdentity);
        assert_eq!(letters[0].key.as_deref(), Some("shop.Order"));
        assert_eq!(letters[0].action, Some(Action::Delete));
    }

    #[tokio::test]
    async fn test_publish_failure_does_not_fail_write() {
        let (capture, bus, abandoned) = setup();
        bus.fail_publishes(true);

        let store = SqlStore::in_memory().await.unwrap();
        store.add_hook(Arc::new(capture));

        let mut order = Order { id: 0, total: 10 };
        store.create(&mut order, &WriteOptions::default()).await.unwrap();
        assert!(store.get::<Order>(order.id).await.unwrap().is_some());
        assert!(bus.published().is_empty());
        assert_eq!(abandoned.count(DeadLetterReason::PublishFailed), 1);
    }

    #[tokio::test]
    async fn test_publish_failure_records_envelope_marker() {
        let (capture, bus, abandoned) = setup();
        bus.fail_publishes(true);

        let outcome = capture
            .capture(&ctx(MutationKind::Delete, 1), &Order { id: 9, total: 3 }, Action::Delete)
            .await
            .unwrap();
        assert_eq!(outcome, CaptureOutcome::PublishFailed);

        let letters = abandoned.letters();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].reason, DeadLetterReason::PublishFailed);
        assert_eq!(letters[0].topic, "entity.sync");
        assert_eq!(letters[0].key.as_deref(), Some("shop.Order"));
        assert_eq!(letters[0].action, Some(Action::Delete));
        assert!(letters[0].error.is_some());

        let envelope = MutationEnvelope::decode(&letters[0].payload).unwrap();
        assert_eq!(envelope.action, Action::Delete);
        let decoded: Order = serde_json::from_slice(&envelope.payload).unwrap();
        assert_eq!(decoded.id, 9);
    }

    #[tokio::test]
    async fn test_store_writes_are_captured() {
        let (capture, bus, _) = setup();
        let store = SqlStore::in_memory().await.unwrap();
        store.add_hook(Arc::new(capture));

        let mut order = Order { id: 0, total: 10 };
        store.create(&mut order, &WriteOptions::default()).await.unwrap();
        order.total = 20;
        store.update(&mut order, &WriteOptions::default()).await.unwrap();
        store.delete(&mut order, &WriteOptions::default()).await.unwrap();
        // Replay-style writes are invisible.
        store.save(&mut order, &WriteOptions::replay()).await.unwrap();

        let actions: Vec<Action> = bus
            .published_to("entity.sync")
            .iter()
            .map(|p| MutationEnvelope::decode(&p.payload).unwrap().action)
            .collect();
        assert_eq!(actions, vec![Action::Save, Action::Save, Action::Delete]);
    }
}
