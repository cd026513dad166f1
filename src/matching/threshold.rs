// Scrobble threshold - has this been listened to long enough to count?

use serde::{Deserialize, Serialize};
use std::fmt;

pub const DEFAULT_DURATION_THRESHOLD: f64 = 240.0;
pub const DEFAULT_PERCENT_THRESHOLD: f64 = 50.0;

/// Either test passing is enough. Both disabled means nothing ever passes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScrobbleThresholds {
    /// seconds listened
    pub duration: Option<f64>,
    /// percent of track length listened
    pub percent: Option<f64>,
}

impl Default for ScrobbleThresholds {
    fn default() -> Self {
        Self {
            duration: Some(DEFAULT_DURATION_THRESHOLD),
            percent: Some(DEFAULT_PERCENT_THRESHOLD),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThresholdCheck {
    pub threshold: f64,
    pub value: f64,
    pub passes: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThresholdResult {
    pub passes: bool,
    pub duration: Option<ThresholdCheck>,
    /// None when not configured or the track length is unknown
    pub percent: Option<ThresholdCheck>,
}

impl fmt::Display for ThresholdResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let duration = match self.duration {
            Some(c) => format!("{:.0}s/{:.0}s", c.value, c.threshold),
            None => "duration n/a".to_string(),
        };
        let percent = match self.percent {
            Some(c) => format!("{:.0}%/{:.0}%", c.value, c.threshold),
            None => "percent n/a".to_string(),
        };
        let verdict = if self.passes { "passed" } else { "failed" };
        write!(f, "{} ({}, {})", verdict, duration, percent)
    }
}

pub fn passes_threshold(tracked_seconds: f64, track_duration: Option<f64>, thresholds: &ScrobbleThresholds) -> ThresholdResult {
    let duration = thresholds.duration.map(|threshold| ThresholdCheck {
        threshold,
        value: tracked_seconds,
        passes: tracked_seconds >= threshold,
    });

    let percent = match (thresholds.percent, track_duration) {
        (Some(threshold), Some(length)) if length > 0.0 => {
            let value = tracked_seconds / length * 100.0;
            Some(ThresholdCheck {
                threshold,
                value,
                passes: value >= threshold,
            })
        }
        _ => None,
    };

    let passes = percent.map(|c| c.passes).unwrap_or(false) || duration.map(|c| c.passes).unwrap_or(false);

    ThresholdResult {
        passes,
        duration,
        percent,
    }
}
