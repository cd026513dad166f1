// Listen progress points and the ranges built from them

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Wall-clock seconds from `from` to `to` (negative if `to` is earlier)
pub fn seconds_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_milliseconds() as f64 / 1000.0
}

/// One confirmed observation: when, and optionally where in the track.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ListenProgress {
    pub timestamp: DateTime<Utc>,
    pub position: Option<f64>,
}

impl ListenProgress {
    pub fn new(timestamp: DateTime<Utc>, position: Option<f64>) -> Self {
        Self { timestamp, position }
    }

    pub fn elapsed_since(&self, earlier: &ListenProgress) -> f64 {
        seconds_between(earlier.timestamp, self.timestamp)
    }

    pub fn position_delta(&self, earlier: &ListenProgress) -> Option<f64> {
        match (earlier.position, self.position) {
            (Some(from), Some(to)) => Some(to - from),
            _ => None,
        }
    }
}

/// A continuous stretch of listening to one play occurrence.
///
/// Position-aware ranges measure duration by position delta, timestamp-only ranges
/// by wall-clock time between the two confirmations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListenRange {
    pub start: ListenProgress,
    pub end: ListenProgress,
}

impl ListenRange {
    pub fn starting_at(point: ListenProgress) -> Self {
        Self {
            start: point,
            end: point,
        }
    }

    pub fn duration(&self) -> f64 {
        let delta = self
            .end
            .position_delta(&self.start)
            .unwrap_or_else(|| self.end.elapsed_since(&self.start));
        delta.max(0.0)
    }

    pub fn extend_to(&mut self, point: ListenProgress) {
        self.end = point;
    }

    pub fn last_position(&self) -> Option<f64> {
        self.end.position.or(self.start.position)
    }

    /// Whether `at` falls within the wall-clock span of this range (inclusive)
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start.timestamp <= at && at <= self.end.timestamp
    }
}
