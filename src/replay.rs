// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Mutation replay: broker messages → store writes.
//!
//! [`MutationReplayer`] is the [`Processor`] subscribed to the sync topic on
//! the receiving side. Per message:
//!
//! | Step | Failure | Result |
//! |------|---------|--------|
//! | decode envelope | `decode_envelope` dead letter | ack |
//! | look up key | `unknown_key` dead letter | ack |
//! | decode payload | `decode_payload` dead letter | ack |
//! | resolve shard | `sharding` dead letter | ack |
//! | save / delete | `apply` dead letter | **stays pending** |
//!
//! Structural failures will fail the same way every time, so they are acked
//! to keep the queue moving. Store failures may be transient and go back
//! through the reclaim sweep.
//!
//! Writes use [`WriteOptions::replay`]: hooks suppressed (no re-publish
//! loop) and no wrapping transaction.

use crate::deadletter::{DeadLetter, DeadLetterReason, DeadLetterSink};
use crate::envelope::{Action, MutationEnvelope};
use crate::error::{RelayError, Result};
use crate::messaging::{BoxFuture, Delivery, Processor};
use crate::metrics;
use crate::registry::{ErasedEntity, TypeRegistry};
use crate::store::{SqlStore, WriteOptions};
use std::sync::Arc;
use tracing::{debug, error, info_span, warn, Instrument};

/// Picks the table a replayed row goes to.
pub trait ShardResolver: Send + Sync + 'static {
    fn resolve<'a>(&'a self, store: &'a SqlStore, key: &'a str, entity: &'a dyn ErasedEntity) -> BoxFuture<'a, String>;
}

/// What replay did with one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayOutcome {
    Applied { action: Action, rows: u64 },
    /// Delete of an entity with zero identity; nothing done.
    ZeroIdentityDelete,
    DeadLettered(DeadLetterReason),
}

/// Applies replicated mutations to the local store.
pub struct MutationReplayer {
    registry: Arc<TypeRegistry>,
    store: Arc<SqlStore>,
    dead_letters: Arc<dyn DeadLetterSink>,
    shard: Option<Arc<dyn ShardResolver>>,
    consumer: String,
}

impl MutationReplayer {
    pub fn new(registry: Arc<TypeRegistry>, store: Arc<SqlStore>, dead_letters: Arc<dyn DeadLetterSink>) -> Self {
        Self {
            registry,
            store,
            dead_letters,
            shard: None,
            consumer: String::new(),
        }
    }

    pub fn with_shard_resolver(mut self, resolver: Arc<dyn ShardResolver>) -> Self {
        self.shard = Some(resolver);
        self
    }

    /// Consumer name recorded on dead letters.
    pub fn with_consumer(mut self, consumer: impl Into<String>) -> Self {
        self.consumer = consumer.into();
        self
    }

    /// Replay one delivery.
    ///
    /// `Err` only for store failures, so the broker keeps the entry pending.
    pub async fn replay(&self, delivery: &Delivery) -> Result<ReplayOutcome> {
        let envelope = match MutationEnvelope::decode(&delivery.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                return Ok(self
                    .dead_letter(DeadLetter::from_delivery(DeadLetterReason::DecodeEnvelope, delivery).with_error(&e))
                    .await);
            }
        };
        let key = envelope.key.as_str();
        let action = envelope.action;
        let letter = |reason: DeadLetterReason| {
            DeadLetter::from_delivery(reason, delivery)
                .with_key(key)
                .with_action(action)
                .with_payload(envelope.payload.clone())
                .with_fields(vec![("envelope".to_string(), delivery.payload.clone())])
        };

        let Some(descriptor) = self.registry.lookup(key) else {
            return Ok(self
                .dead_letter(letter(DeadLetterReason::UnknownKey).with_error(RelayError::UnknownKey(key.to_string())))
                .await);
        };

        let mut entity = match descriptor.decode(&envelope.payload) {
            Ok(entity) => entity,
            Err(e) => return Ok(self.dead_letter(letter(DeadLetterReason::DecodePayload).with_error(&e)).await),
        };

        let mut opts = WriteOptions::replay();
        if let Some(resolver) = &self.shard {
            match resolver.resolve(&self.store, key, entity.as_ref()).await {
                Ok(table) => opts.table = Some(table),
                Err(e) => {
                    let e = RelayError::sharding(key, e.to_string());
                    return Ok(self.dead_letter(letter(DeadLetterReason::Sharding).with_error(&e)).await);
                }
            }
        }

        let result = match action {
            Action::Save => self.store.save(entity.as_mut(), &opts).await,
            Action::Delete => {
                if entity.identity() == Some(0) {
                    warn!(key = %key, stream_id = %delivery.id, "Delete with zero identity, ignoring");
                    metrics::record_replay(key, "zero_identity");
                    return Ok(ReplayOutcome::ZeroIdentityDelete);
                }
                self.store.delete(entity.as_mut(), &opts).await
            }
        };

        match result {
            Ok(rows) => {
                debug!(key = %key, action = %action, rows, stream_id = %delivery.id, "Replayed mutation");
                metrics::record_replay(key, "applied");
                Ok(ReplayOutcome::Applied { action, rows })
            }
            Err(e) => {
                error!(key = %key, action = %action, stream_id = %delivery.id, error = %e, "Failed to apply mutation");
                self.dead_letter(letter(DeadLetterReason::Apply).with_error(&e)).await;
                Err(RelayError::apply(key, e.to_string()))
            }
        }
    }

    async fn dead_letter(&self, letter: DeadLetter) -> ReplayOutcome {
        let reason = letter.reason;
        let key = letter.key.clone().unwrap_or_default();
        warn!(
            reason = %reason,
            key = %key,
            stream_id = %letter.origin_id,
            error = letter.error.as_deref().unwrap_or(""),
            "Dead-lettering mutation"
        );
        metrics::record_replay(if key.is_empty() { "unknown" } else { &key }, reason.as_str());

        let letter = letter.with_consumer(self.consumer.clone());
        if let Err(e) = self.dead_letters.write(letter).await {
            error!(reason = %reason, error = %e, "Dead-letter write failed");
            metrics::record_dead_letter_write_failure(self.dead_letters.name());
        }
        ReplayOutcome::DeadLettered(reason)
    }
}

impl Processor for MutationReplayer {
    fn process<'a>(&'a self, delivery: &'a Delivery) -> BoxFuture<'a, ()> {
        let span = info_span!("replay", topic = %delivery.topic, stream_id = %delivery.id);
        Box::pin(async move { self.replay(delivery).await.map(|_| ()) }.instrument(span))
    }
}
