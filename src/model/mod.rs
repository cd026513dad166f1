// Shared data model - what sources hand us and what we hand to scrobblers
// Everything here is plain data, the behaviour lives in player/ and discovery/

pub mod listen; // progress points and listen ranges
pub mod play;   // track identity + materialized play data

pub use listen::{seconds_between, ListenProgress, ListenRange};
pub use play::{Play, PlayData, PlayMeta, MAX_PLAY_SECONDS};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub const NO_DEVICE: &str = "NO_DEVICE";
pub const NO_USER: &str = "SINGLE_USER";

/// Identity of one listening endpoint: a device/user pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PlatformId {
    #[serde(default = "default_device")]
    pub device_id: String,
    #[serde(default = "default_user")]
    pub user_id: String,
}

fn default_device() -> String {
    NO_DEVICE.to_string()
}

fn default_user() -> String {
    NO_USER.to_string()
}

impl PlatformId {
    pub fn new(device_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            user_id: user_id.into(),
        }
    }

    /// The "single user, no device" sentinel for sources that can't tell listeners apart
    pub fn generic() -> Self {
        Self::new(NO_DEVICE, NO_USER)
    }

    pub fn is_generic(&self) -> bool {
        self.device_id == NO_DEVICE && self.user_id == NO_USER
    }

    /// Map key used for trackers, history partitions and removal notifications
    pub fn key(&self) -> String {
        format!("{}-{}", self.device_id, self.user_id)
    }
}

impl Default for PlatformId {
    fn default() -> Self {
        Self::generic()
    }
}

impl fmt::Display for PlatformId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.device_id, self.user_id)
    }
}

/// Status as the source claims it. Not trusted blindly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ReportedStatus {
    Playing,
    Paused,
    Stopped,
    #[default]
    Unknown,
}

impl ReportedStatus {
    /// Anything that doesn't explicitly say playback is halted
    pub fn is_progressing(self) -> bool {
        matches!(self, ReportedStatus::Playing | ReportedStatus::Unknown)
    }
}

/// Status derived from position/timestamp evidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CalculatedStatus {
    #[default]
    Unknown,
    Playing,
    Paused,
    Stopped,
    Stale,
    Orphaned,
}

impl fmt::Display for CalculatedStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CalculatedStatus::Unknown => "unknown",
            CalculatedStatus::Playing => "playing",
            CalculatedStatus::Paused => "paused",
            CalculatedStatus::Stopped => "stopped",
            CalculatedStatus::Stale => "stale",
            CalculatedStatus::Orphaned => "orphaned",
        };
        f.write_str(label)
    }
}

/// One poll/push observation of a platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Snapshot {
    #[serde(default)]
    pub platform: PlatformId,
    #[serde(default)]
    pub status: Option<ReportedStatus>,
    #[serde(default)]
    pub play: Option<Play>,
    /// seconds into the track
    #[serde(default)]
    pub position: Option<f64>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

impl Snapshot {
    pub fn new(platform: PlatformId) -> Self {
        Self {
            platform,
            ..Default::default()
        }
    }

    pub fn with_play(mut self, play: Play) -> Self {
        self.play = Some(play);
        self
    }

    pub fn with_status(mut self, status: ReportedStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_position(mut self, position: f64) -> Self {
        self.position = Some(position);
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

/// Which source produced a play - attached to discoveries for routing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceIdentity {
    pub name: String,
    pub kind: String,
}

impl SourceIdentity {
    pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
        }
    }
}

impl fmt::Display for SourceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generic_platform_key() {
        let platform = PlatformId::generic();
        assert!(platform.is_generic());
        assert_eq!(platform.key(), "NO_DEVICE-SINGLE_USER");

        let real = PlatformId::new("kitchen", "alice");
        assert!(!real.is_generic());
        assert_eq!(real.to_string(), "kitchen-alice");
    }

    #[test]
    fn test_snapshot_defaults_from_json() {
        let snapshot: Snapshot = serde_json::from_str(r#"{"status": "paused", "position": 12.5}"#).unwrap();
        assert!(snapshot.platform.is_generic());
        assert_eq!(snapshot.status, Some(ReportedStatus::Paused));
        assert_eq!(snapshot.position, Some(12.5));
        assert!(snapshot.play.is_none());
    }
}
