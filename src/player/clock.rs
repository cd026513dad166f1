use crate::model::seconds_between;
use chrono::{DateTime, Utc};

/// Extrapolates where playback should be right now from the last confirmed position.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RealtimeClock {
    anchor_position: f64,
    anchor_at: DateTime<Utc>,
    running: bool,
}

impl RealtimeClock {
    pub fn new(position: f64, at: DateTime<Utc>, running: bool) -> Self {
        Self {
            anchor_position: position,
            anchor_at: at,
            running,
        }
    }

    pub fn position_at(&self, now: DateTime<Utc>) -> f64 {
        if self.running {
            self.anchor_position + seconds_between(self.anchor_at, now).max(0.0)
        } else {
            self.anchor_position
        }
    }

    pub fn sync(&mut self, position: f64, at: DateTime<Utc>) {
        self.anchor_position = position;
        self.anchor_at = at;
        self.running = true;
    }

    pub fn pause(&mut self, at: DateTime<Utc>) {
        self.anchor_position = self.position_at(at);
        self.anchor_at = at;
        self.running = false;
    }

    pub fn is_running(&self) -> bool {
        self.running
    }
}
