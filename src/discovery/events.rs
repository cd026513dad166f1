// Typed notifications out of the engine and pollers
// UI/status and scrobble dispatch subscribe here instead of poking at state

use crate::model::{Play, SourceIdentity};
use crate::player::PlayerSnapshot;
use crate::polling::PollerState;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

pub const DEFAULT_EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SourceEvent {
    /// New genuine plays, oldest first, ready for scrobble dispatch
    Discovered { source: SourceIdentity, plays: Vec<Play> },
    /// Externally visible tracker state changed
    PlayerUpdated { source: String, player: PlayerSnapshot },
    /// Tracker pruned (or replaced after an identity transfer)
    PlayerRemoved { source: String, platform: String },
    PollerStateChanged { source: String, state: PollerState },
    PollRetry {
        source: String,
        attempt: u32,
        delay_ms: u64,
        error: String,
    },
}

/// Broadcast bus - cheap to clone, every clone publishes to the same subscribers.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SourceEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SourceEvent> {
        self.tx.subscribe()
    }

    /// Returns how many subscribers got it. Nobody listening is fine.
    pub fn emit(&self, event: SourceEvent) -> usize {
        match self.tx.send(event) {
            Ok(count) => count,
            Err(_) => {
                trace!("event dropped, no subscribers");
                0
            }
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}
