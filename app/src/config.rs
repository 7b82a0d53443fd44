use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// How an actor consumes its inbound envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Mode {
    /// Envelopes are indexed into a queue and drained by consumer tasks
    #[default]
    ReadWrite,
    /// Envelopes are processed inline by the caller
    ReadOnly,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SyncConfig {
    /// Decided messages per history request, also the cap the history handler applies
    pub page_size: u64,
    /// Requests per page before the sync gives up
    pub max_attempts: usize,
    /// Window for collecting last decided responses, milliseconds
    pub last_decided_wait: u64,
    /// Deadline of one history request, milliseconds
    pub request_timeout: u64,
}

impl SyncConfig {
    pub fn last_decided_wait(&self) -> Duration {
        Duration::from_millis(self.last_decided_wait)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        DEV.sync.clone()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct QueueConfig {
    /// Upper bound on consumer tasks per actor
    pub consumers: usize,
    /// Envelopes popped per index on each drain
    pub batch_size: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        DEV.queue.clone()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NodeConfig {
    pub mode: Mode,
    pub sync: SyncConfig,
    pub queue: QueueConfig,
}

pub static DEV: Lazy<NodeConfig> = Lazy::new(|| NodeConfig {
    mode: Mode::ReadWrite,
    sync: SyncConfig {
        page_size: 10,
        max_attempts: 3,
        last_decided_wait: 2_000,
        request_timeout: 5_000,
    },
    queue: QueueConfig {
        consumers: 6,
        batch_size: 10,
    },
});

impl Default for NodeConfig {
    fn default() -> Self {
        DEV.clone()
    }
}

pub fn config_value_parser(s: &str) -> eyre::Result<NodeConfig, eyre::Error> {
    Ok(match s {
        "dev" => DEV.clone(),
        _ => {
            let raw = std::fs::read_to_string(PathBuf::from(s))?;
            serde_json::from_str(&raw)?
        }
    })
}
