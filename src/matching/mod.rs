// Matching - is this the same track, and is it the same listening event?
// Pure functions only, the discovery engine decides what to do with the answers

pub mod threshold; // scrobble threshold evaluation

pub use threshold::{passes_threshold, ScrobbleThresholds, ThresholdCheck, ThresholdResult};

use crate::model::{seconds_between, Play};
use serde::{Deserialize, Serialize};

pub const DEFAULT_TEMPORAL_THRESHOLD: f64 = 10.0;
/// Sources that only report minute-level timestamps need a wider window
pub const COARSE_TEMPORAL_THRESHOLD: f64 = 60.0;
pub const DEFAULT_FUZZY_WINDOW: f64 = 10.0;

fn normalize(value: &str) -> String {
    value.trim().to_lowercase()
}

fn same_text(a: &str, b: &str) -> bool {
    normalize(a) == normalize(b)
}

fn same_optional_text(a: Option<&str>, b: Option<&str>) -> bool {
    normalize(a.unwrap_or_default()) == normalize(b.unwrap_or_default())
}

fn same_artists(a: &[String], b: &[String]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut left: Vec<String> = a.iter().map(|s| normalize(s)).collect();
    let mut right: Vec<String> = b.iter().map(|s| normalize(s)).collect();
    left.sort();
    right.sort();
    left == right
}

/// Do two plays describe the same track?
///
/// A source-native id wins when both plays come from the same source and both carry one,
/// otherwise title, album and the full artist set must all agree.
pub fn data_matches(a: &Play, b: &Play) -> bool {
    if !a.meta.source.is_empty() && a.meta.source == b.meta.source {
        if let (Some(left), Some(right)) = (&a.meta.track_id, &b.meta.track_id) {
            return left == right;
        }
    }

    same_text(&a.data.track, &b.data.track)
        && same_optional_text(a.data.album.as_deref(), b.data.album.as_deref())
        && same_artists(&a.data.artists, &b.data.artists)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TemporalOptions {
    /// max seconds between play starts to count as the same event
    pub threshold: f64,
    /// also accept differences that look like the track (or listened) length
    pub fuzzy: bool,
    pub fuzzy_window: f64,
}

impl Default for TemporalOptions {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_TEMPORAL_THRESHOLD,
            fuzzy: false,
            fuzzy_window: DEFAULT_FUZZY_WINDOW,
        }
    }
}

impl TemporalOptions {
    pub fn coarse() -> Self {
        Self {
            threshold: COARSE_TEMPORAL_THRESHOLD,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Closeness {
    /// start times within the threshold
    StartWithinThreshold,
    /// candidate started inside one of the existing play's listen ranges
    WithinListenRange,
    /// difference looks like the track length (source stamps at track end)
    FuzzyDuration,
    /// difference looks like the listened time
    FuzzyListened,
    NotClose,
    /// one of the plays has no play date
    Undecidable,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TemporalMatch {
    pub close: bool,
    pub detail: Closeness,
    /// absolute seconds between the two play starts
    pub difference: Option<f64>,
}

impl TemporalMatch {
    fn close(detail: Closeness, difference: f64) -> Self {
        Self {
            close: true,
            detail,
            difference: Some(difference),
        }
    }
}

pub fn temporally_close(existing: &Play, candidate: &Play, opts: &TemporalOptions) -> TemporalMatch {
    let (Some(existing_start), Some(candidate_start)) = (existing.data.play_date, candidate.data.play_date) else {
        return TemporalMatch {
            close: false,
            detail: Closeness::Undecidable,
            difference: None,
        };
    };

    let difference = seconds_between(existing_start, candidate_start).abs();
    if difference <= opts.threshold {
        return TemporalMatch::close(Closeness::StartWithinThreshold, difference);
    }

    if existing
        .data
        .listen_ranges
        .iter()
        .any(|range| range.contains(candidate_start))
    {
        return TemporalMatch::close(Closeness::WithinListenRange, difference);
    }

    if opts.fuzzy {
        let duration = existing.data.duration.or(candidate.data.duration);
        if let Some(duration) = duration {
            if (difference - duration).abs() <= opts.fuzzy_window {
                return TemporalMatch::close(Closeness::FuzzyDuration, difference);
            }
        }
        let listened = existing.data.listened_for.or(candidate.data.listened_for);
        if let Some(listened) = listened {
            if (difference - listened).abs() <= opts.fuzzy_window {
                return TemporalMatch::close(Closeness::FuzzyListened, difference);
            }
        }
    }

    TemporalMatch {
        close: false,
        detail: Closeness::NotClose,
        difference: Some(difference),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ListenProgress, ListenRange};
    use chrono::{DateTime, Duration, TimeZone, Utc};

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap() + Duration::seconds(secs)
    }

    fn song() -> Play {
        Play::new("Heavy Is the Crown", vec!["Linkin Park".into()]).with_album("From Zero")
    }

    #[test]
    fn test_native_id_wins_over_title() {
        let a = song().with_source("spotify").with_track_id("abc123");
        let mut b = song().with_source("spotify").with_track_id("abc123");
        b.data.track = "Heavy Is The Crown (Remastered)".into();
        assert!(data_matches(&a, &b));

        let c = song().with_source("spotify").with_track_id("zzz999");
        assert!(!data_matches(&a, &c));
    }

    #[test]
    fn test_different_sources_fall_back_to_metadata() {
        let a = song().with_source("spotify").with_track_id("abc123");
        let b = song().with_source("jellyfin").with_track_id("other");
        assert!(data_matches(&a, &b));
    }

    #[test]
    fn test_artist_set_must_match_fully() {
        let a = Play::new("Song", vec!["A".into(), "B".into()]);
        let b = Play::new("Song", vec!["b".into(), "a".into()]);
        let c = Play::new("Song", vec!["A".into()]);
        let d = Play::new("Song", vec!["A".into(), "A".into()]);
        assert!(data_matches(&a, &b));
        assert!(!data_matches(&a, &c));
        assert!(!data_matches(&a, &d));
    }

    #[test]
    fn test_album_mismatch() {
        let a = song();
        let b = song().with_album("Hybrid Theory");
        assert!(!data_matches(&a, &b));
    }

    #[test]
    fn test_close_within_threshold() {
        let a = song().with_play_date(t(0));
        let b = song().with_play_date(t(8));
        let result = temporally_close(&a, &b, &TemporalOptions::default());
        assert!(result.close);
        assert_eq!(result.detail, Closeness::StartWithinThreshold);
        assert_eq!(result.difference, Some(8.0));

        let far = song().with_play_date(t(45));
        assert!(!temporally_close(&a, &far, &TemporalOptions::default()).close);
        assert!(temporally_close(&a, &far, &TemporalOptions::coarse()).close);
    }

    #[test]
    fn test_close_when_inside_listen_range() {
        let mut a = song().with_play_date(t(0));
        let mut range = ListenRange::starting_at(ListenProgress::new(t(0), None));
        range.extend_to(ListenProgress::new(t(120), None));
        a.data.listen_ranges.push(range);

        let b = song().with_play_date(t(90));
        let result = temporally_close(&a, &b, &TemporalOptions::default());
        assert_eq!(result.detail, Closeness::WithinListenRange);
    }

    #[test]
    fn test_fuzzy_track_end_timestamps() {
        let a = song().with_play_date(t(0)).with_duration(200.0);
        let b = song().with_play_date(t(205));
        assert!(!temporally_close(&a, &b, &TemporalOptions::default()).close);

        let fuzzy = TemporalOptions {
            fuzzy: true,
            ..TemporalOptions::default()
        };
        assert_eq!(temporally_close(&a, &b, &fuzzy).detail, Closeness::FuzzyDuration);

        let listened = song().with_play_date(t(0)).with_listened_for(95.0);
        let c = song().with_play_date(t(100));
        assert_eq!(temporally_close(&listened, &c, &fuzzy).detail, Closeness::FuzzyListened);
    }

    #[test]
    fn test_missing_date_is_undecidable() {
        let a = song();
        let b = song().with_play_date(t(0));
        let result = temporally_close(&a, &b, &TemporalOptions::default());
        assert!(!result.close);
        assert_eq!(result.detail, Closeness::Undecidable);
    }
}
