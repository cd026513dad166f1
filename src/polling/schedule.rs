use super::PollingOptions;
use crate::model::Play;
use chrono::{DateTime, Utc};
use std::time::Duration;

const MIN_INTERVAL: Duration = Duration::from_secs(1);

/// Delay before retry `attempt` (1-based): base * multiplier^attempt, capped at `max_backoff`
pub fn backoff_delay(options: &PollingOptions, attempt: u32) -> Duration {
    let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
    let factor = options.retry_multiplier.max(1.0).powi(exponent);
    Duration::try_from_secs_f64(options.retry_base.as_secs_f64() * factor)
        .unwrap_or(options.max_backoff)
        .min(options.max_backoff)
}

/// Sleep before the next poll.
///
/// While something is playing we wake up just before the shortest track ends so the transition
/// gets sampled. With nothing playing we back off by one base interval per idle cycle.
pub fn next_interval(options: &PollingOptions, min_remaining: Option<f64>, idle_cycles: u32) -> Duration {
    let base = options.interval;
    if idle_cycles == 0 {
        return match min_remaining {
            Some(remaining) if remaining < base.as_secs_f64() => {
                Duration::from_secs_f64(remaining).max(MIN_INTERVAL)
            }
            _ => base,
        };
    }

    let ceiling = options.max_interval.max(base);
    base.saturating_mul(idle_cycles.saturating_add(1)).min(ceiling)
}

/// Did any of these plays end within `window` of the poll?
pub fn near_poll_boundary(plays: &[Play], polled_at: DateTime<Utc>, window: Duration) -> bool {
    let window = window.as_secs_f64();
    plays.iter().filter_map(Play::play_end).any(|end| {
        let gap = (polled_at - end).num_milliseconds().abs() as f64 / 1000.0;
        gap <= window
    })
}
