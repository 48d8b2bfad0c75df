// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! Tunables for a [crate::Node]. Everything has a default; an embedding
//! server typically deserializes a [NodeConfig] from its own config file and
//! overrides a handful of fields.

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub coordinator: CoordinatorConfig,
    pub executor: ExecutorConfig,
    pub submit: SubmitConfig,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Positive responses each phase needs. `None` means a majority of the
    /// members joined when the phase is sent.
    pub quorum: Option<usize>,
    /// How long a phase waits for responses before its handler's timeout
    /// policy runs.
    pub response_timeout_ms: u64,
    /// Term stamped on every [crate::LogId] this coordinator assigns. Handed
    /// out by whatever elected it.
    pub term: u64,
    /// How many final, non-retryable responses to remember for answering
    /// resubmissions of an already completed operation.
    pub completed_cache_size: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        CoordinatorConfig {
            quorum: None,
            response_timeout_ms: 5_000,
            term: 0,
            completed_cache_size: 1024,
        }
    }
}

impl CoordinatorConfig {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn with_quorum(mut self, quorum: usize) -> Self {
        self.quorum = Some(quorum);
        self
    }

    pub fn with_response_timeout_ms(mut self, ms: u64) -> Self {
        self.response_timeout_ms = ms;
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Bound on waiting for any single record or index-key lock.
    pub lock_timeout_ms: u64,
    /// A transaction prepared but neither committed nor rolled back within
    /// this window is rolled back locally and its locks freed.
    pub pending_tx_timeout_ms: u64,
    /// How long a gap in received log ids may persist before the executor
    /// asks the coordinator to resend what it's missing.
    pub reorder_window_ms: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        ExecutorConfig {
            lock_timeout_ms: 2_000,
            pending_tx_timeout_ms: 30_000,
            reorder_window_ms: 500,
        }
    }
}

impl ExecutorConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn pending_tx_timeout(&self) -> Duration {
        Duration::from_millis(self.pending_tx_timeout_ms)
    }

    pub fn reorder_window(&self) -> Duration {
        Duration::from_millis(self.reorder_window_ms)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubmitConfig {
    /// How long one attempt waits for its response.
    pub submit_timeout_ms: u64,
    /// Resends of the same operation after the first attempt.
    pub max_retries: usize,
    pub retry_backoff_ms: u64,
}

impl Default for SubmitConfig {
    fn default() -> Self {
        SubmitConfig {
            submit_timeout_ms: 10_000,
            max_retries: 3,
            retry_backoff_ms: 100,
        }
    }
}

impl SubmitConfig {
    pub fn submit_timeout(&self) -> Duration {
        Duration::from_millis(self.submit_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

#[test]
fn test_partial_config_fills_defaults() {
    let json = r#"{"coordinator": {"quorum": 2}, "submit": {"max_retries": 7}}"#;
    let cfg: NodeConfig = serde_json::from_str(json).unwrap();
    assert_eq!(cfg.coordinator.quorum, Some(2));
    assert_eq!(cfg.coordinator.response_timeout(), Duration::from_secs(5));
    assert_eq!(cfg.submit.max_retries, 7);
    assert_eq!(cfg.executor, ExecutorConfig::default());
}
