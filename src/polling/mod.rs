// Polling - one cooperative loop per source, plus the background tasks that keep it healthy
// fetch -> discovery engine -> pick next interval -> sleep (checking for stop) -> repeat

pub mod heartbeat; // restarts sources that fell over
pub mod poller;    // the per-source loop
pub mod schedule;  // backoff, interval and boundary math

pub use heartbeat::Heartbeat;
pub use poller::Poller;
pub use schedule::{backoff_delay, near_poll_boundary, next_interval};

use crate::error::SourceError;
use crate::model::{Play, Snapshot, SourceIdentity};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PollerState {
    #[default]
    Idle,
    Polling,
    /// last fetch failed, backing off before the next attempt
    Retrying,
}

impl std::fmt::Display for PollerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            PollerState::Idle => "idle",
            PollerState::Polling => "polling",
            PollerState::Retrying => "retrying",
        };
        write!(f, "{}", label)
    }
}

/// Anything that can hand over a batch of now-playing snapshots on demand.
///
/// Adapters own protocol and auth; a failed re-auth should surface as [`SourceError::Auth`]
/// so the source stays idle instead of being restarted in a loop.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    fn identity(&self) -> SourceIdentity;

    async fn fetch(&self) -> Result<Vec<Snapshot>, SourceError>;

    /// Recently-played history, if the source keeps one. Checked once per polling run.
    async fn fetch_backlog(&self) -> Result<Vec<Play>, SourceError> {
        Ok(Vec::new())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PollingOptions {
    pub interval: Duration,
    /// ceiling for the idle slow-down
    pub max_interval: Duration,
    pub max_poll_retries: u32,
    pub retry_multiplier: f64,
    pub retry_base: Duration,
    /// ceiling for a single retry delay
    pub max_backoff: Duration,
    /// discoveries ending this close to the poll get held back a little
    pub boundary_window: Duration,
    pub boundary_delay: Duration,
    /// granularity of stop checks while sleeping
    pub stop_check: Duration,
    /// how long stop_polling waits for the loop to acknowledge
    pub stop_wait: Duration,
}

impl Default for PollingOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            max_interval: Duration::from_secs(30),
            max_poll_retries: 5,
            retry_multiplier: 1.5,
            retry_base: Duration::from_secs(5),
            max_backoff: Duration::from_secs(300),
            boundary_window: Duration::from_secs(5),
            boundary_delay: Duration::from_secs(3),
            stop_check: Duration::from_secs(2),
            stop_wait: Duration::from_secs(10),
        }
    }
}
