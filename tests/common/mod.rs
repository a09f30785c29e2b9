// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Shared test utilities for integration and chaos tests.
//!
//! This module provides:
//! - Redis testcontainer setup
//! - A replicable `Order` entity and a registry holding it
//! - Broker and engine constructors wired for fast tests

#![allow(dead_code)]

pub mod containers;

pub use containers::*;

use mutation_relay::config::{BrokerConfig, ReclaimConfig, RelayConfig};
use mutation_relay::resilience::RetryConfig;
use mutation_relay::{Entity, RedisStreamBroker, TypeRegistry};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub mod model {
    use super::*;

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    pub struct Order {
        pub id: u64,
        pub customer: String,
        pub total_cents: i64,
    }

    impl Order {
        pub fn new(id: u64, customer: &str, total_cents: i64) -> Self {
            Self {
                id,
                customer: customer.to_string(),
                total_cents,
            }
        }
    }

    impl Entity for Order {
        fn table_name() -> &'static str {
            "orders"
        }

        fn registry_key() -> String {
            "model.Order".to_string()
        }

        fn identity(&self) -> Option<u64> {
            Some(self.id)
        }

        fn set_identity(&mut self, id: u64) {
            self.id = id;
        }
    }
}

pub use model::Order;

/// Registry containing [`Order`].
pub fn registry() -> Arc<TypeRegistry> {
    let mut builder = TypeRegistry::builder();
    builder.register::<Order>();
    Arc::new(builder.build())
}

/// Broker with a short block timeout so shutdown in tests is quick.
pub async fn connect_broker(url: &str, consumer: &str) -> RedisStreamBroker {
    let mut config = BrokerConfig::for_testing(url);
    config.block_timeout = "200ms".to_string();
    let reclaim = ReclaimConfig {
        page_size: 10,
        ..Default::default()
    };
    RedisStreamBroker::connect(config, reclaim, consumer, RetryConfig::testing())
        .await
        .expect("broker should connect")
}

/// Engine config pointed at a container, writing abandoned records to `abandoned`.
pub fn relay_config(url: &str, abandoned: &std::path::Path) -> RelayConfig {
    let mut config = RelayConfig::for_testing(url, &abandoned.to_string_lossy());
    config.broker.block_timeout = "200ms".to_string();
    config
}

/// Poll `check` every 20ms until it returns true or `timeout` elapses.
pub async fn wait_until<F, Fut>(timeout: std::time::Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    false
}

/// Route `tracing` output to the test harness. Filter with `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
