// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # Mutation Relay
//!
//! Replicates entity mutations between services over Redis Streams.
//!
//! ## Architecture
//!
//! Writes to the local SQLite store are captured by a store hook and
//! published to a sync topic. Every service replays that topic into its own
//! store through a consumer group:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                              mutation-relay                              │
//! │                                                                          │
//! │  ┌──────────┐  hook   ┌─────────────────┐  XADD   ┌──────────────────┐   │
//! │  │ SqlStore │───────► │ MutationCapture │───────► │ RedisStreamBroker│   │
//! │  └──────────┘         └─────────────────┘         │ (sync topic)     │   │
//! │       ▲                                           └──────────────────┘   │
//! │       │ upsert / soft delete                          │ XREADGROUP       │
//! │  ┌─────────────────┐                                  ▼                  │
//! │  │ MutationReplayer│◄──────────────────────── consumer loop + reclaim    │
//! │  └─────────────────┘                                  │                  │
//! │       │ undecodable / unknown / expired               ▼                  │
//! │       └──────────────► {topic}.{group}.deadletter ─► abandoned file      │
//! │                                                                          │
//! │  BackfillPublisher: re-publishes store windows (pairs with capture)      │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,no_run
//! use mutation_relay::{RelayConfig, RelayEngine, TypeRegistry};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> mutation_relay::Result<()> {
//!     let config = RelayConfig::default();
//!     let registry = Arc::new(TypeRegistry::builder().build());
//!
//!     let mut engine = RelayEngine::open(config, registry).await?;
//!     engine.start().await?;
//!
//!     // Engine runs until shutdown signal
//!     engine.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod abandoned;
pub mod backfill;
pub mod broker;
pub mod capture;
pub mod channel;
pub mod config;
pub mod coordinator;
pub mod deadletter;
pub mod envelope;
pub mod error;
pub mod messaging;
pub mod metrics;
pub mod registry;
pub mod replay;
pub mod resilience;
pub mod store;

// Re-exports for convenience
pub use abandoned::AbandonedSink;
pub use backfill::{BackfillPublisher, BackfillStats};
pub use broker::RedisStreamBroker;
pub use capture::MutationCapture;
pub use channel::Channel;
pub use config::{BackfillConfig, BrokerConfig, ReclaimConfig, RelayConfig, StoreConfig};
pub use coordinator::{EngineState, HealthCheck, IntervalScheduler, RelayEngine, Scheduler};
pub use deadletter::{DeadLetter, DeadLetterReason, DeadLetterSink};
pub use envelope::{Action, MutationEnvelope};
pub use error::{RelayError, Result};
pub use messaging::{Delivery, MessageBus, Processor, Subscription};
pub use registry::{Entity, ErasedEntity, TypeRegistry};
pub use replay::{MutationReplayer, ShardResolver};
pub use store::{SqlStore, WriteOptions};
