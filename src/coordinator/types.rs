// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Engine state types.
//!
//! # State Transitions
//!
//! ```text
//!                  start()
//! Created ───────────────────→ Connecting ──(broker unreachable)──→ Failed
//!    │                              │
//!    │ shutdown()                   │ (subscribed, jobs scheduled)
//!    ↓                              ↓
//! Stopped ←── ShuttingDown ←──── Running
//!                          shutdown()
//! ```
//!
//! - **Created**: after `RelayEngine::new()`. Nothing connected.
//! - **Connecting**: `start()` is connecting to Redis and subscribing.
//! - **Running**: replay subscription live, reclaim (and backfill) scheduled.
//! - **ShuttingDown**: subscriptions and jobs draining.
//! - **Stopped**: clean shutdown complete.
//! - **Failed**: `start()` failed. The engine cannot be restarted.

/// State of the relay engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Created,
    Connecting,
    Running,
    ShuttingDown,
    Stopped,
    Failed,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineState::Created => write!(f, "Created"),
            EngineState::Connecting => write!(f, "Connecting"),
            EngineState::Running => write!(f, "Running"),
            EngineState::ShuttingDown => write!(f, "ShuttingDown"),
            EngineState::Stopped => write!(f, "Stopped"),
            EngineState::Failed => write!(f, "Failed"),
        }
    }
}

/// One subscription as seen by [`HealthCheck`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionHealth {
    pub topic: String,
    pub group: String,
    /// The read loop has exited (cancelled or panicked).
    pub finished: bool,
}

/// Health snapshot for monitoring endpoints.
///
/// Built from in-process state only; taking one performs no network I/O.
#[derive(Debug, Clone)]
pub struct HealthCheck {
    pub state: EngineState,
    /// Running with every subscription loop alive.
    pub ready: bool,
    pub consumer: String,
    pub subscriptions: Vec<SubscriptionHealth>,
    pub scheduled_jobs: Vec<String>,
    pub registered_keys: usize,
}

impl HealthCheck {
    pub fn subscriptions_alive(&self) -> usize {
        self.subscriptions.iter().filter(|s| !s.finished).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_state_display() {
        assert_eq!(EngineState::Created.to_string(), "Created");
        assert_eq!(EngineState::Connecting.to_string(), "Connecting");
        assert_eq!(EngineState::Running.to_string(), "Running");
        assert_eq!(EngineState::ShuttingDown.to_string(), "ShuttingDown");
        assert_eq!(EngineState::Stopped.to_string(), "Stopped");
        assert_eq!(EngineState::Failed.to_string(), "Failed");
    }

    #[test]
    fn test_subscriptions_alive() {
        let health = HealthCheck {
            state: EngineState::Running,
            ready: false,
            consumer: "host-a".into(),
            subscriptions: vec![
                SubscriptionHealth { topic: "t".into(), group: "a".into(), finished: false },
                SubscriptionHealth { topic: "t".into(), group: "b".into(), finished: true },
            ],
            scheduled_jobs: vec![],
            registered_keys: 0,
        };
        assert_eq!(health.subscriptions_alive(), 1);
    }
}
