use super::{ListenRange, PlatformId};
use crate::error::TrackerError;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Longest track or listen we believe in
pub const MAX_PLAY_SECONDS: f64 = 86_400.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PlayData {
    pub track: String,
    #[serde(default)]
    pub album: Option<String>,
    #[serde(default)]
    pub artists: Vec<String>,
    #[serde(default)]
    pub album_artists: Vec<String>,
    /// track length in seconds, when the source knows it
    #[serde(default)]
    pub duration: Option<f64>,
    /// when the play is judged to have started - set on materialization
    #[serde(default)]
    pub play_date: Option<DateTime<Utc>>,
    /// seconds actually listened
    #[serde(default)]
    pub listened_for: Option<f64>,
    #[serde(default)]
    pub listen_ranges: Vec<ListenRange>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PlayMeta {
    #[serde(default)]
    pub source: String,
    /// source-native unique id for the track
    #[serde(default)]
    pub track_id: Option<String>,
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    /// unique per materialized occurrence, so repeats are distinguishable downstream
    #[serde(default)]
    pub occurrence: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Play {
    pub data: PlayData,
    #[serde(default)]
    pub meta: PlayMeta,
}

impl Play {
    pub fn new(track: impl Into<String>, artists: Vec<String>) -> Self {
        Self {
            data: PlayData {
                track: track.into(),
                artists,
                ..Default::default()
            },
            meta: PlayMeta::default(),
        }
    }

    pub fn with_album(mut self, album: impl Into<String>) -> Self {
        self.data.album = Some(album.into());
        self
    }

    pub fn with_duration(mut self, seconds: f64) -> Self {
        self.data.duration = Some(seconds);
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.meta.source = source.into();
        self
    }

    pub fn with_track_id(mut self, id: impl Into<String>) -> Self {
        self.meta.track_id = Some(id.into());
        self
    }

    pub fn with_play_date(mut self, date: DateTime<Utc>) -> Self {
        self.data.play_date = Some(date);
        self
    }

    pub fn with_listened_for(mut self, seconds: f64) -> Self {
        self.data.listened_for = Some(seconds);
        self
    }

    pub fn platform_id(&self) -> PlatformId {
        PlatformId::new(
            self.meta.device_id.clone().unwrap_or_else(|| super::NO_DEVICE.to_string()),
            self.meta.user_id.clone().unwrap_or_else(|| super::NO_USER.to_string()),
        )
    }

    pub fn set_platform(&mut self, platform: &PlatformId) {
        self.meta.device_id = Some(platform.device_id.clone());
        self.meta.user_id = Some(platform.user_id.clone());
    }

    /// Seconds this play occupies on the timeline: listened time, else track length
    pub fn occupied_seconds(&self) -> Option<f64> {
        self.data.listened_for.or(self.data.duration)
    }

    /// When this play is judged to have ended. `None` when the span runs off the calendar.
    pub fn play_end(&self) -> Option<DateTime<Utc>> {
        let start = self.data.play_date?;
        let span = Duration::try_milliseconds((self.occupied_seconds()? * 1000.0) as i64)?;
        start.checked_add_signed(span)
    }

    /// Rejects plays no real listener could have produced
    pub fn check(&self, platform: &str) -> Result<(), TrackerError> {
        if self.data.track.trim().is_empty() {
            return Err(TrackerError::MissingTrack {
                platform: platform.to_string(),
            });
        }
        if let Some(duration) = self.data.duration {
            if !duration.is_finite() || duration <= 0.0 || duration > MAX_PLAY_SECONDS {
                return Err(TrackerError::InvalidDuration {
                    platform: platform.to_string(),
                    duration,
                });
            }
        }
        if let Some(listened_for) = self.data.listened_for {
            if !listened_for.is_finite() || listened_for < 0.0 || listened_for > MAX_PLAY_SECONDS {
                return Err(TrackerError::InvalidListenedFor {
                    platform: platform.to_string(),
                    listened_for,
                });
            }
        }
        Ok(())
    }

    /// Short human label for logs: "Artist - Track @ date"
    pub fn describe(&self) -> String {
        let artists = if self.data.artists.is_empty() {
            "(no artist)".to_string()
        } else {
            self.data.artists.join(" / ")
        };
        match self.data.play_date {
            Some(date) => format!("{} - {} @ {}", artists, self.data.track, date.to_rfc3339()),
            None => format!("{} - {}", artists, self.data.track),
        }
    }
}
