// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Dead letters: messages the relay gave up on.
//!
//! A [`DeadLetter`] records what was received, where it came from and why it
//! was set aside. Where it ends up depends on the [`DeadLetterSink`]: the
//! broker appends it to `{topic}.{group}.deadletter`, the
//! [`AbandonedSink`](crate::abandoned::AbandonedSink) appends it to a local
//! JSON-lines file.

use crate::envelope::Action;
use crate::error::Result;
use crate::messaging::BoxFuture;
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::warn;

/// Name of the dead-letter stream for a topic and group.
pub fn dead_letter_topic(topic: &str, group: &str) -> String {
    format!("{}.{}.deadletter", topic, group)
}

/// Why a message was dead-lettered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeadLetterReason {
    /// Envelope JSON did not parse.
    DecodeEnvelope,
    /// Envelope named a key nobody registered.
    UnknownKey,
    /// Payload did not decode into the registered type.
    DecodePayload,
    /// Shard resolver could not place the row.
    Sharding,
    /// Store rejected the mutation.
    Apply,
    /// Pending for longer than the reclaim limit.
    Expired,
    /// Redelivery during reclaim failed again.
    ReprocessFailed,
    /// Stream entry had no `payload` field.
    MissingPayload,
    /// Entity had a zero identity when captured.
    ZeroIdentity,
    /// Channel payload did not decode into the channel's type.
    ChannelDecode,
    /// Captured mutation could not be published.
    PublishFailed,
}

impl DeadLetterReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DecodeEnvelope => "decode_envelope",
            Self::UnknownKey => "unknown_key",
            Self::DecodePayload => "decode_payload",
            Self::Sharding => "sharding",
            Self::Apply => "apply",
            Self::Expired => "expired",
            Self::ReprocessFailed => "reprocess_failed",
            Self::MissingPayload => "missing_payload",
            Self::ZeroIdentity => "zero_identity",
            Self::ChannelDecode => "channel_decode",
            Self::PublishFailed => "publish_failed",
        }
    }
}

impl fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A message set aside for operator attention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub reason: DeadLetterReason,
    pub topic: String,
    pub group: String,
    pub consumer: String,
    /// Broker id of the original message, empty if it never reached the broker.
    pub origin_id: String,
    pub key: Option<String>,
    pub action: Option<Action>,
    pub payload: Vec<u8>,
    /// Other fields carried by the original stream entry.
    pub fields: Vec<(String, Vec<u8>)>,
    pub error: Option<String>,
}

impl DeadLetter {
    pub fn new(
        reason: DeadLetterReason,
        topic: impl Into<String>,
        group: impl Into<String>,
        origin_id: impl Into<String>,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            reason,
            topic: topic.into(),
            group: group.into(),
            consumer: String::new(),
            origin_id: origin_id.into(),
            key: None,
            action: None,
            payload,
            fields: Vec::new(),
            error: None,
        }
    }

    /// Dead letter for a delivery that failed processing.
    pub fn from_delivery(reason: DeadLetterReason, delivery: &crate::messaging::Delivery) -> Self {
        Self::new(
            reason,
            delivery.topic.clone(),
            delivery.group.clone(),
            delivery.id.clone(),
            delivery.payload.clone(),
        )
    }

    pub fn with_consumer(mut self, consumer: impl Into<String>) -> Self {
        self.consumer = consumer.into();
        self
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_action(mut self, action: Action) -> Self {
        self.action = Some(action);
        self
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_fields(mut self, fields: Vec<(String, Vec<u8>)>) -> Self {
        self.fields = fields;
        self
    }

    pub fn with_error(mut self, error: impl fmt::Display) -> Self {
        self.error = Some(error.to_string());
        self
    }

    /// Fields for the dead-letter stream entry.
    ///
    /// The original fields come first, then `payload`, `reason`, `origin_id`
    /// and whichever of `key`, `action` and `error` are known.
    pub fn stream_fields(&self) -> Vec<(String, Vec<u8>)> {
        let mut out: Vec<(String, Vec<u8>)> = self
            .fields
            .iter()
            .filter(|(name, _)| !matches!(name.as_str(), "payload" | "reason" | "origin_id" | "error"))
            .cloned()
            .collect();
        out.push(("payload".into(), self.payload.clone()));
        out.push(("reason".into(), self.reason.as_str().as_bytes().to_vec()));
        out.push(("origin_id".into(), self.origin_id.as_bytes().to_vec()));
        if !self.consumer.is_empty() {
            out.push(("consumer".into(), self.consumer.as_bytes().to_vec()));
        }
        if let Some(key) = &self.key {
            out.push(("key".into(), key.as_bytes().to_vec()));
        }
        if let Some(action) = &self.action {
            out.push(("action".into(), action.as_str().as_bytes().to_vec()));
        }
        if let Some(error) = &self.error {
            out.push(("error".into(), error.as_bytes().to_vec()));
        }
        out
    }
}

/// Somewhere to put dead letters.
pub trait DeadLetterSink: Send + Sync + 'static {
    /// Short name for logs and metrics.
    fn name(&self) -> &'static str;

    fn write<'a>(&'a self, letter: DeadLetter) -> BoxFuture<'a, ()>;
}

/// Write to `primary`, falling back to `fallback` if that fails.
pub struct FallbackDeadLetter {
    primary: Arc<dyn DeadLetterSink>,
    fallback: Arc<dyn DeadLetterSink>,
}

impl FallbackDeadLetter {
    pub fn new(primary: Arc<dyn DeadLetterSink>, fallback: Arc<dyn DeadLetterSink>) -> Self {
        Self { primary, fallback }
    }
}

impl DeadLetterSink for FallbackDeadLetter {
    fn name(&self) -> &'static str {
        "fallback"
    }

    fn write<'a>(&'a self, letter: DeadLetter) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            match self.primary.write(letter.clone()).await {
                Ok(()) => Ok(()),
                Err(e) => {
                    warn!(
                        sink = self.primary.name(),
                        fallback = self.fallback.name(),
                        origin_id = %letter.origin_id,
                        error = %e,
                        "Dead-letter write failed, using fallback"
                    );
                    crate::metrics::record_dead_letter_write_failure(self.primary.name());
                    self.fallback.write(letter).await
                }
            }
        })
    }
}

/// Keeps dead letters in memory. Handy in tests and as a last resort.
#[derive(Default)]
pub struct MemoryDeadLetter {
    letters: Mutex<Vec<DeadLetter>>,
}

impl MemoryDeadLetter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn letters(&self) -> Vec<DeadLetter> {
        self.letters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn count(&self, reason: DeadLetterReason) -> usize {
        self.letters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .filter(|l| l.reason == reason)
            .count()
    }
}

impl DeadLetterSink for MemoryDeadLetter {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn write<'a>(&'a self, letter: DeadLetter) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            crate::metrics::record_dead_letter(&letter.topic, letter.reason.as_str());
            self.letters
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .push(letter);
            Ok(())
        })
    }
}
