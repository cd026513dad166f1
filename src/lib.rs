// tunetrail Library - turns noisy now-playing snapshots into real, deduplicated plays
// Each concern lives in its own module so source adapters can plug in from outside

pub mod config;    // settings and preferences
pub mod discovery; // threshold + dedup, emits discovered plays
pub mod error;     // typed errors for trackers, sources, config
pub mod matching;  // same track? same listen? long enough?
pub mod model;     // snapshots, plays, platform ids
pub mod player;    // per-platform listen session tracking
pub mod polling;   // per-source poll loop, heartbeat, sweeps
pub mod sources;   // bundled snapshot sources

// Export the stuff other modules actually use
pub use config::Config;
pub use discovery::{DiscoveryEngine, DiscoveryOptions, EventBus, SourceEvent};
pub use error::{ConfigError, SourceError, TrackerError};
pub use model::{PlatformId, Play, ReportedStatus, Snapshot, SourceIdentity};
pub use player::{PlayerState, TrackerStrategy};
pub use polling::{Heartbeat, Poller, PollerState, PollingOptions, SnapshotSource};
