// Listen session tracking - one PlayerState per device/user pair
// Rebuilds "what was actually listened to" from noisy now-playing snapshots

pub mod clock; // realtime position extrapolation
pub mod state; // the per-platform state machine

pub use clock::RealtimeClock;
pub use state::{PlayerSnapshot, PlayerState, PlayerUpdate};

use serde::{Deserialize, Serialize};

/// Below this a reported position is considered unchanged
pub const POSITION_EPSILON: f64 = 0.5;
/// Assumed poll latency when a timestamp-only tracker first sees a track already playing
pub const FIRST_SEEN_OFFSET: f64 = 1.0;

/// Repeat detection knobs. Numeric and percent checks are OR'd so short and long tracks
/// both trigger sensibly.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RepeatThresholds {
    pub start_seconds: f64,
    pub start_percent: f64,
    pub listened_seconds: f64,
    pub listened_percent: f64,
    pub end_seconds: f64,
    pub end_percent: f64,
}

impl Default for RepeatThresholds {
    fn default() -> Self {
        Self {
            start_seconds: 12.0,
            start_percent: 15.0,
            listened_seconds: 120.0,
            listened_percent: 50.0,
            end_seconds: 12.0,
            end_percent: 15.0,
        }
    }
}

impl RepeatThresholds {
    pub fn near_start(&self, position: f64, duration: Option<f64>) -> bool {
        position <= self.start_seconds
            || duration.is_some_and(|d| d > 0.0 && position / d * 100.0 <= self.start_percent)
    }

    pub fn near_end(&self, position: f64, duration: Option<f64>) -> bool {
        match duration {
            Some(d) if d > 0.0 => {
                let remaining = (d - position).max(0.0);
                remaining <= self.end_seconds || remaining / d * 100.0 <= self.end_percent
            }
            _ => false,
        }
    }

    pub fn substantial(&self, listened: f64, duration: Option<f64>) -> bool {
        listened >= self.listened_seconds
            || duration.is_some_and(|d| d > 0.0 && listened / d * 100.0 >= self.listened_percent)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PositionalOptions {
    /// seconds reported position may diverge from wall-clock before we stop trusting it
    pub allowed_drift: f64,
    /// end positions this close to the track length are bumped to the full length
    pub end_grace: f64,
    #[serde(default)]
    pub repeat: RepeatThresholds,
}

impl Default for PositionalOptions {
    fn default() -> Self {
        Self {
            allowed_drift: 3.0,
            end_grace: 3.0,
            repeat: RepeatThresholds::default(),
        }
    }
}

impl PositionalOptions {
    /// For players whose reported position is known to lag and jitter a lot
    pub fn high_drift() -> Self {
        Self {
            allowed_drift: 17.0,
            end_grace: 6.0,
            repeat: RepeatThresholds::default(),
        }
    }
}

/// How a tracker turns observations into listened time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub enum TrackerStrategy {
    /// no positions, wall-clock time between "playing" confirmations counts
    #[default]
    Timestamp,
    /// position deltas count, with drift/seek/repeat detection
    Positional(PositionalOptions),
}

impl TrackerStrategy {
    pub fn is_positional(&self) -> bool {
        matches!(self, TrackerStrategy::Positional(_))
    }
}

/// Which data a source's scrobbles are decided from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ScrobbleAuthority {
    /// recently-played history is the truth, now-playing is cosmetic
    History,
    /// player state is the truth
    #[default]
    Player,
}

/// Seconds without updates before a tracker is stale/orphaned. Dead is twice orphaned.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StateIntervals {
    pub stale: f64,
    pub orphaned: f64,
}

impl StateIntervals {
    pub fn from_multipliers(polling_interval: f64, stale: f64, orphaned: f64) -> Self {
        Self {
            stale: polling_interval * stale,
            orphaned: polling_interval * orphaned,
        }
    }

    pub fn for_authority(polling_interval: f64, authority: ScrobbleAuthority) -> Self {
        let (stale, orphaned) = authority.default_multipliers();
        Self::from_multipliers(polling_interval, stale, orphaned)
    }

    pub fn dead(&self) -> f64 {
        self.orphaned * 2.0
    }
}

impl ScrobbleAuthority {
    /// (stale, orphaned) multiples of the polling interval
    pub fn default_multipliers(self) -> (f64, f64) {
        match self {
            ScrobbleAuthority::History => (1.0, 5.0),
            ScrobbleAuthority::Player => (3.0, 5.0),
        }
    }
}

impl Default for StateIntervals {
    fn default() -> Self {
        Self::for_authority(10.0, ScrobbleAuthority::Player)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repeat_checks_short_and_long_tracks() {
        let repeat = RepeatThresholds::default();
        // 60s track: 8s in is near start by percent and seconds
        assert!(repeat.near_start(8.0, Some(60.0)));
        // 20 minute track: 100s in is still under 15%
        assert!(repeat.near_start(100.0, Some(1200.0)));
        assert!(!repeat.near_start(30.0, Some(100.0)));

        assert!(repeat.near_end(190.0, Some(200.0)));
        assert!(!repeat.near_end(190.0, None));

        assert!(repeat.substantial(40.0, Some(70.0)));
        assert!(repeat.substantial(130.0, None));
        assert!(!repeat.substantial(130.0 - 20.0, Some(600.0)));
    }

    #[test]
    fn test_intervals_by_authority() {
        let history = StateIntervals::for_authority(10.0, ScrobbleAuthority::History);
        assert_eq!(history.stale, 10.0);
        assert_eq!(history.orphaned, 50.0);

        let player = StateIntervals::for_authority(10.0, ScrobbleAuthority::Player);
        assert_eq!(player.stale, 30.0);
        assert_eq!(player.dead(), 100.0);
    }
}
