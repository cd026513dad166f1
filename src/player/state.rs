use super::{
    PositionalOptions, RealtimeClock, StateIntervals, TrackerStrategy, FIRST_SEEN_OFFSET, POSITION_EPSILON,
};
use crate::error::TrackerError;
use crate::matching::data_matches;
use crate::model::{
    seconds_between, CalculatedStatus, ListenProgress, ListenRange, PlatformId, Play, ReportedStatus, Snapshot,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;
use xxhash_rust::xxh64::xxh64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseReason {
    Paused,
    Stopped,
    Seek,
    Stale,
    PlayChanged,
    Repeat,
}

/// Result of feeding one snapshot into a tracker.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlayerUpdate {
    /// current occurrence, possibly still being listened to
    pub candidate: Option<Play>,
    /// previous occurrence, finalized by this update
    pub finished: Option<Play>,
}

/// Externally visible view of a tracker, for UI/status output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerSnapshot {
    pub platform: String,
    pub track: Option<String>,
    pub artists: Vec<String>,
    pub album: Option<String>,
    pub duration: Option<f64>,
    pub reported_status: ReportedStatus,
    pub calculated_status: CalculatedStatus,
    pub position: Option<f64>,
    /// whole seconds, so the hash doesn't churn on rounding noise
    pub listened_for: f64,
    pub play_first_seen_at: Option<DateTime<Utc>>,
    pub play_last_updated_at: DateTime<Utc>,
}

impl PlayerSnapshot {
    pub fn state_hash(&self) -> u64 {
        serde_json::to_vec(self).map(|bytes| xxh64(&bytes, 0)).unwrap_or_default()
    }
}

fn halted_status(reported: ReportedStatus) -> CalculatedStatus {
    if reported == ReportedStatus::Stopped {
        CalculatedStatus::Stopped
    } else {
        CalculatedStatus::Paused
    }
}

/// Listen session tracker for one platform.
///
/// Consumes snapshots, keeps the listen ranges for the current play occurrence and
/// hands back a materialized play (with play date and listened duration) on every update.
#[derive(Debug, Clone)]
pub struct PlayerState {
    platform: PlatformId,
    strategy: TrackerStrategy,
    intervals: StateIntervals,
    current_play: Option<Play>,
    current_range: Option<ListenRange>,
    listen_ranges: Vec<ListenRange>,
    reported_status: ReportedStatus,
    calculated_status: CalculatedStatus,
    play_first_seen_at: Option<DateTime<Utc>>,
    first_seen_playing: bool,
    play_last_updated_at: DateTime<Utc>,
    state_last_updated_at: DateTime<Utc>,
    last_reported_position: Option<f64>,
    clock: Option<RealtimeClock>,
}

impl PlayerState {
    pub fn new(platform: PlatformId, strategy: TrackerStrategy, intervals: StateIntervals, now: DateTime<Utc>) -> Self {
        Self {
            platform,
            strategy,
            intervals,
            current_play: None,
            current_range: None,
            listen_ranges: Vec::new(),
            reported_status: ReportedStatus::Unknown,
            calculated_status: CalculatedStatus::Unknown,
            play_first_seen_at: None,
            first_seen_playing: false,
            play_last_updated_at: now,
            state_last_updated_at: now,
            last_reported_position: None,
            clock: None,
        }
    }

    pub fn platform(&self) -> &PlatformId {
        &self.platform
    }

    pub fn strategy(&self) -> TrackerStrategy {
        self.strategy
    }

    pub fn current_play(&self) -> Option<&Play> {
        self.current_play.as_ref()
    }

    /// Finalized ranges of the current occurrence (the open one is not included)
    pub fn listen_ranges(&self) -> &[ListenRange] {
        &self.listen_ranges
    }

    pub fn current_range(&self) -> Option<&ListenRange> {
        self.current_range.as_ref()
    }

    pub fn reported_status(&self) -> ReportedStatus {
        self.reported_status
    }

    pub fn calculated_status(&self) -> CalculatedStatus {
        self.calculated_status
    }

    pub fn play_first_seen_at(&self) -> Option<DateTime<Utc>> {
        self.play_first_seen_at
    }

    pub fn play_last_updated_at(&self) -> DateTime<Utc> {
        self.play_last_updated_at
    }

    pub fn state_last_updated_at(&self) -> DateTime<Utc> {
        self.state_last_updated_at
    }

    pub fn update(&mut self, snapshot: &Snapshot) -> Result<PlayerUpdate, TrackerError> {
        self.validate(snapshot)?;

        let now = snapshot.timestamp.unwrap_or_else(Utc::now);
        let reported = snapshot.status.unwrap_or_default();
        let previous_position = self.last_reported_position;
        // timestamp-only trackers ignore positions even when a source sends them
        let position = if self.strategy.is_positional() {
            snapshot.position
        } else {
            None
        };

        self.state_last_updated_at = now;
        self.reported_status = reported;

        let update = match &snapshot.play {
            None => self.status_only(reported, now),
            Some(play) => self.play_update(play, reported, now, position, previous_position),
        };

        if snapshot.position.is_some() {
            self.last_reported_position = snapshot.position;
        }
        Ok(update)
    }

    /// Checks a snapshot without touching state
    pub fn validate(&self, snapshot: &Snapshot) -> Result<(), TrackerError> {
        if let Some(position) = snapshot.position {
            if !position.is_finite() || position < 0.0 {
                return Err(TrackerError::InvalidPosition {
                    platform: self.platform.key(),
                    position,
                });
            }
        }
        match &snapshot.play {
            Some(play) => play.check(&self.platform.key()),
            None => Ok(()),
        }
    }

    fn status_only(&mut self, reported: ReportedStatus, now: DateTime<Utc>) -> PlayerUpdate {
        match reported {
            ReportedStatus::Stopped if self.current_play.is_some() => {
                let finished = self.finish_play(now, CloseReason::Stopped);
                if let Some(play) = &finished {
                    debug!("{}: stopped, finished {}", self.platform, play.describe());
                }
                self.calculated_status = CalculatedStatus::Stopped;
                PlayerUpdate {
                    candidate: None,
                    finished,
                }
            }
            ReportedStatus::Paused | ReportedStatus::Stopped => {
                self.close_range(now, CloseReason::Paused);
                if let Some(clock) = self.clock.as_mut() {
                    clock.pause(now);
                }
                self.calculated_status = halted_status(reported);
                PlayerUpdate {
                    candidate: self.materialized_play(),
                    finished: None,
                }
            }
            _ => PlayerUpdate {
                candidate: self.materialized_play(),
                finished: None,
            },
        }
    }

    fn play_update(
        &mut self,
        play: &Play,
        reported: ReportedStatus,
        now: DateTime<Utc>,
        position: Option<f64>,
        previous_position: Option<f64>,
    ) -> PlayerUpdate {
        let same_play = self.current_play.as_ref().map(|current| data_matches(current, play));

        match same_play {
            None => {
                self.start_play(play.clone(), reported, now, position);
                PlayerUpdate {
                    candidate: self.materialized_play(),
                    finished: None,
                }
            }
            Some(false) => {
                let finished = self.finish_play(now, CloseReason::PlayChanged);
                if let Some(done) = &finished {
                    debug!("{}: play changed, finished {}", self.platform, done.describe());
                }
                self.start_play(play.clone(), reported, now, position);
                PlayerUpdate {
                    candidate: self.materialized_play(),
                    finished,
                }
            }
            Some(true) => {
                self.play_last_updated_at = now;
                self.refresh_play(play);

                if !reported.is_progressing() {
                    self.halt(reported, now, position);
                } else if position.is_some_and(|p| self.is_repeat(p)) {
                    let finished = self.finish_play(now, CloseReason::Repeat);
                    if let Some(done) = &finished {
                        info!("{}: repeat detected, finished {}", self.platform, done.describe());
                    }
                    self.start_play(play.clone(), reported, now, position);
                    return PlayerUpdate {
                        candidate: self.materialized_play(),
                        finished,
                    };
                } else {
                    self.continue_session(now, position, previous_position);
                }

                PlayerUpdate {
                    candidate: self.materialized_play(),
                    finished: None,
                }
            }
        }
    }

    fn start_play(&mut self, mut play: Play, reported: ReportedStatus, now: DateTime<Utc>, position: Option<f64>) {
        play.set_platform(&self.platform);
        play.meta.occurrence = Some(Uuid::new_v4());
        // derived fields are ours to compute
        play.data.play_date = None;
        play.data.listened_for = None;
        play.data.listen_ranges.clear();

        debug!("{}: new play {}", self.platform, play.describe());

        self.current_play = Some(play);
        self.listen_ranges.clear();
        self.current_range = None;
        self.play_first_seen_at = Some(now);
        self.play_last_updated_at = now;
        self.first_seen_playing = reported == ReportedStatus::Playing;
        self.clock = position.map(|p| RealtimeClock::new(p, now, reported.is_progressing()));

        if reported.is_progressing() {
            self.open_range(now, position);
            self.calculated_status = CalculatedStatus::Playing;
        } else {
            self.calculated_status = halted_status(reported);
        }
    }

    /// Newer snapshots sometimes fill in what earlier ones lacked
    fn refresh_play(&mut self, play: &Play) {
        if let Some(current) = self.current_play.as_mut() {
            if current.data.duration.is_none() {
                current.data.duration = play.data.duration;
            }
            if current.meta.track_id.is_none() {
                current.meta.track_id = play.meta.track_id.clone();
            }
        }
    }

    fn halt(&mut self, reported: ReportedStatus, now: DateTime<Utc>, position: Option<f64>) {
        if let (TrackerStrategy::Positional(opts), Some(p)) = (self.strategy, position) {
            // a paused snapshot still confirms how far playback got
            if let Some(range) = self.current_range.as_mut() {
                if let Some(last) = range.end.position {
                    let delta = p - last;
                    let elapsed = seconds_between(range.end.timestamp, now).max(0.0);
                    if delta >= 0.0 && delta <= elapsed + opts.allowed_drift {
                        range.extend_to(ListenProgress::new(now, Some(p)));
                    }
                }
            }
            self.clock = Some(RealtimeClock::new(p, now, false));
        } else if let Some(clock) = self.clock.as_mut() {
            clock.pause(now);
        }

        let reason = if reported == ReportedStatus::Stopped {
            CloseReason::Stopped
        } else {
            CloseReason::Paused
        };
        self.close_range(now, reason);

        let status = halted_status(reported);
        if self.calculated_status != status {
            debug!("{}: {} -> {}", self.platform, self.calculated_status, status);
        }
        self.calculated_status = status;
    }

    fn continue_session(&mut self, now: DateTime<Utc>, position: Option<f64>, previous_position: Option<f64>) {
        match (self.strategy, position) {
            (TrackerStrategy::Positional(opts), Some(p)) => self.continue_positional(opts, now, p, previous_position),
            _ => self.continue_timestamp(now),
        }
    }

    fn continue_timestamp(&mut self, now: DateTime<Utc>) {
        let point = ListenProgress::new(now, None);
        let extending = self.calculated_status == CalculatedStatus::Playing && self.current_range.is_some();

        if extending {
            if let Some(range) = self.current_range.as_mut() {
                range.extend_to(point);
            }
        } else {
            self.close_range(now, CloseReason::Paused);
            debug!("{}: listening (re)started", self.platform);
            self.current_range = Some(ListenRange::starting_at(point));
        }
        self.calculated_status = CalculatedStatus::Playing;
    }

    fn continue_positional(&mut self, opts: PositionalOptions, now: DateTime<Utc>, p: f64, previous_position: Option<f64>) {
        let moved = previous_position.map_or(true, |prev| (p - prev).abs() >= POSITION_EPSILON);

        let Some(last) = self.current_range.as_ref().map(|range| range.end) else {
            // nothing open: paused, stale, or position only just showed up
            if moved {
                debug!("{}: position moving at {:.1}s, resuming", self.platform, p);
                self.resume_at(now, p);
            } else if !matches!(self.calculated_status, CalculatedStatus::Paused | CalculatedStatus::Stopped) {
                self.calculated_status = CalculatedStatus::Paused;
            }
            return;
        };

        let Some(last_position) = last.position else {
            self.close_range(now, CloseReason::Seek);
            self.resume_at(now, p);
            return;
        };

        let delta = p - last_position;
        if delta.abs() < POSITION_EPSILON {
            // an unmoving position beats a stale "playing" flag
            if !matches!(self.calculated_status, CalculatedStatus::Paused | CalculatedStatus::Stopped) {
                debug!("{}: position stuck at {:.1}s, treating as paused", self.platform, p);
                self.close_range(now, CloseReason::Paused);
                self.clock = Some(RealtimeClock::new(p, now, false));
                self.calculated_status = CalculatedStatus::Paused;
            }
            return;
        }

        let elapsed = seconds_between(last.timestamp, now).max(0.0);
        if delta < 0.0 || delta > elapsed + opts.allowed_drift {
            debug!(
                "{}: seek from {:.1}s to {:.1}s over {:.1}s of wall time",
                self.platform, last_position, p, elapsed
            );
            self.close_range(now, CloseReason::Seek);
            self.resume_at(now, p);
            return;
        }

        if let Some(range) = self.current_range.as_mut() {
            range.extend_to(ListenProgress::new(now, Some(p)));
        }
        self.calculated_status = CalculatedStatus::Playing;

        let lag = self.clock.map_or(0.0, |clock| clock.position_at(now) - p);
        let keeping_pace = (delta - elapsed).abs() <= opts.allowed_drift;
        if lag > opts.allowed_drift && !keeping_pace {
            debug!("{}: reported {:.1}s lags realtime by {:.1}s, extrapolating", self.platform, p, lag);
            return;
        }
        if lag > opts.allowed_drift {
            debug!("{}: reported position keeping pace again at {:.1}s, re-syncing", self.platform, p);
        }
        match self.clock.as_mut() {
            Some(clock) => clock.sync(p, now),
            None => self.clock = Some(RealtimeClock::new(p, now, true)),
        }
    }

    fn resume_at(&mut self, now: DateTime<Utc>, p: f64) {
        self.open_range(now, Some(p));
        self.calculated_status = CalculatedStatus::Playing;
        self.clock = Some(RealtimeClock::new(p, now, true));
    }

    fn open_range(&mut self, now: DateTime<Utc>, position: Option<f64>) {
        self.current_range = Some(ListenRange::starting_at(ListenProgress::new(now, position)));
    }

    fn is_repeat(&self, position: f64) -> bool {
        let TrackerStrategy::Positional(opts) = self.strategy else {
            return false;
        };
        let Some(last_position) = self
            .current_range
            .as_ref()
            .or(self.listen_ranges.last())
            .and_then(ListenRange::last_position)
        else {
            return false;
        };
        if position >= last_position {
            return false;
        }

        let duration = self.duration();
        let listened = self.get_listen_duration().max(last_position);
        opts.repeat.near_start(position, duration)
            && (opts.repeat.substantial(listened, duration) || opts.repeat.near_end(last_position, duration))
    }

    fn close_range(&mut self, now: DateTime<Utc>, reason: CloseReason) {
        let Some(mut range) = self.current_range.take() else {
            return;
        };

        if let TrackerStrategy::Positional(opts) = self.strategy {
            let duration = self.duration();

            if reason == CloseReason::Stale {
                if let (Some(clock), Some(reported)) = (self.clock, range.end.position) {
                    let realtime = duration.map_or(clock.position_at(now), |d| clock.position_at(now).min(d));
                    if clock.is_running() && realtime > reported {
                        if realtime - reported <= opts.allowed_drift {
                            range.extend_to(ListenProgress::new(now, Some(realtime)));
                        } else {
                            debug!(
                                "{}: realtime {:.1}s ran far past last reported {:.1}s, keeping reported",
                                self.platform, realtime, reported
                            );
                        }
                    }
                }
            }

            if let (Some(d), Some(end)) = (duration, range.end.position) {
                if end < d && d - end <= opts.end_grace {
                    debug!("{}: closed {:.1}s before the end, counting to the end", self.platform, d - end);
                    range.end.position = Some(d);
                }
            }
        }

        self.listen_ranges.push(range);
    }

    fn finish_play(&mut self, now: DateTime<Utc>, reason: CloseReason) -> Option<Play> {
        self.current_play.as_ref()?;
        self.close_range(now, reason);
        let finished = self.materialized_play();

        self.current_play = None;
        self.listen_ranges.clear();
        self.current_range = None;
        self.play_first_seen_at = None;
        self.first_seen_playing = false;
        self.clock = None;
        self.last_reported_position = None;

        finished
    }

    fn duration(&self) -> Option<f64> {
        self.current_play.as_ref().and_then(|play| play.data.duration)
    }

    /// The current occurrence with play date, listened time and ranges filled in
    pub fn materialized_play(&self) -> Option<Play> {
        let mut play = self.current_play.clone()?;
        play.data.play_date = self.play_first_seen_at.map(|seen| {
            if !self.strategy.is_positional() && self.first_seen_playing {
                seen - Duration::milliseconds((FIRST_SEEN_OFFSET * 1000.0) as i64)
            } else {
                seen
            }
        });
        play.data.listen_ranges = self
            .listen_ranges
            .iter()
            .chain(self.current_range.iter())
            .cloned()
            .collect();
        play.data.listened_for = Some(self.get_listen_duration());
        Some(play)
    }

    /// Seconds listened: finalized ranges plus the open one
    pub fn get_listen_duration(&self) -> f64 {
        self.listen_ranges
            .iter()
            .chain(self.current_range.iter())
            .map(ListenRange::duration)
            .sum()
    }

    pub fn get_position(&self) -> Option<f64> {
        self.position_at(Utc::now())
    }

    /// Realtime estimate while playing for position-aware trackers, last reported otherwise
    pub fn position_at(&self, now: DateTime<Utc>) -> Option<f64> {
        match (self.strategy, self.clock) {
            (TrackerStrategy::Positional(_), Some(clock)) if self.calculated_status == CalculatedStatus::Playing => {
                let position = clock.position_at(now);
                Some(self.duration().map_or(position, |d| position.min(d)))
            }
            _ => self.last_reported_position,
        }
    }

    /// Seconds left in the current track, when both length and position are known
    pub fn remaining_at(&self, now: DateTime<Utc>) -> Option<f64> {
        let duration = self.duration()?;
        let position = self.position_at(now)?;
        Some((duration - position).max(0.0))
    }

    pub fn is_playing(&self) -> bool {
        self.calculated_status == CalculatedStatus::Playing
    }

    pub fn is_update_stale(&self, now: DateTime<Utc>) -> bool {
        let reference = if self.current_play.is_some() {
            self.play_last_updated_at
        } else {
            self.state_last_updated_at
        };
        seconds_between(reference, now) > self.intervals.stale
    }

    /// Going stale closes the open range so silent players stop accruing time
    pub fn check_stale(&mut self, now: DateTime<Utc>) -> bool {
        let stale = self.is_update_stale(now);
        if stale && !matches!(self.calculated_status, CalculatedStatus::Stale | CalculatedStatus::Orphaned) {
            debug!("{}: no play update for over {:.0}s, marking stale", self.platform, self.intervals.stale);
            self.close_range(now, CloseReason::Stale);
            self.clock = self
                .listen_ranges
                .last()
                .and_then(|range| range.end.position)
                .map(|p| RealtimeClock::new(p, now, false));
            self.calculated_status = CalculatedStatus::Stale;
        }
        stale
    }

    pub fn is_orphaned(&self, now: DateTime<Utc>) -> bool {
        seconds_between(self.state_last_updated_at, now) > self.intervals.orphaned
    }

    pub fn check_orphaned(&mut self, now: DateTime<Utc>) -> bool {
        let orphaned = self.is_orphaned(now);
        if orphaned && self.calculated_status != CalculatedStatus::Orphaned {
            debug!("{}: no update of any kind for over {:.0}s, orphaned", self.platform, self.intervals.orphaned);
            self.calculated_status = CalculatedStatus::Orphaned;
        }
        orphaned
    }

    pub fn is_dead(&self, now: DateTime<Utc>) -> bool {
        seconds_between(self.state_last_updated_at, now) > self.intervals.dead()
    }

    /// Hand in-flight session state to the tracker that now addresses this listener
    pub fn transfer_to_new_player(&self, other: &mut PlayerState) {
        other.current_play = self.current_play.clone().map(|mut play| {
            play.set_platform(&other.platform);
            play
        });
        other.current_range = self.current_range.clone();
        other.listen_ranges = self.listen_ranges.clone();
        other.reported_status = self.reported_status;
        other.calculated_status = self.calculated_status;
        other.play_first_seen_at = self.play_first_seen_at;
        other.first_seen_playing = self.first_seen_playing;
        other.play_last_updated_at = self.play_last_updated_at;
        other.state_last_updated_at = self.state_last_updated_at;
        other.last_reported_position = self.last_reported_position;
        other.clock = self.clock;
    }

    pub fn snapshot(&self) -> PlayerSnapshot {
        let play = self.current_play.as_ref();
        PlayerSnapshot {
            platform: self.platform.key(),
            track: play.map(|p| p.data.track.clone()),
            artists: play.map(|p| p.data.artists.clone()).unwrap_or_default(),
            album: play.and_then(|p| p.data.album.clone()),
            duration: self.duration(),
            reported_status: self.reported_status,
            calculated_status: self.calculated_status,
            position: self.last_reported_position,
            listened_for: self.get_listen_duration().round(),
            play_first_seen_at: self.play_first_seen_at,
            play_last_updated_at: self.play_last_updated_at,
        }
    }
}
