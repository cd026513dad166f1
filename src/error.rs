// Error types for the discovery pipeline
// Library code returns these, the binary wraps everything in anyhow

use thiserror::Error;

/// A snapshot one tracker could not make sense of. Isolated to that tracker for the cycle.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum TrackerError {
    #[error("snapshot for {platform} has an invalid position: {position}")]
    InvalidPosition { platform: String, position: f64 },

    #[error("snapshot for {platform} carries a play with no track title")]
    MissingTrack { platform: String },

    #[error("snapshot for {platform} has an invalid duration: {duration}")]
    InvalidDuration { platform: String, duration: f64 },

    #[error("play for {platform} has an invalid listened time: {listened_for}")]
    InvalidListenedFor { platform: String, listened_for: f64 },
}

/// Failures surfaced by a snapshot source while fetching.
#[derive(Debug, Error)]
pub enum SourceError {
    /// Upstream hiccup, worth retrying with backoff
    #[error("transient fetch failure: {0}")]
    Transient(String),

    /// Needs re-authentication before polling can resume
    #[error("authentication required: {0}")]
    Auth(String),

    #[error("giving up after {attempts} failed poll attempts: {last}")]
    Exhausted { attempts: u32, last: String },

    #[error("source i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("could not parse source payload: {0}")]
    Parse(#[from] serde_json::Error),
}

impl SourceError {
    pub fn is_auth(&self) -> bool {
        matches!(self, SourceError::Auth(_))
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    NotPositive { field: &'static str },

    #[error("retry multiplier must be a finite number of at least 1.0, got {0}")]
    RetryMultiplier(f64),

    #[error("percent threshold must be within 0-100, got {0}")]
    PercentOutOfRange(f64),

    #[error("stop check granularity must be 2 seconds or less, got {0}")]
    StopCheckTooCoarse(u64),
}
