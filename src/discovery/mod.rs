// Discovery - routes snapshots to per-platform trackers and decides which plays are real
// Threshold check, then dedup against a rolling per-platform history, then emit

pub mod events;  // typed event bus
pub mod history; // bounded discovery history

pub use events::{EventBus, SourceEvent};
pub use history::{DiscoveryHistory, DEFAULT_HISTORY_CAPACITY};

use crate::error::TrackerError;
use crate::matching::{data_matches, passes_threshold, temporally_close, ScrobbleThresholds, TemporalOptions};
use crate::model::{PlatformId, Play, Snapshot, SourceIdentity};
use crate::player::{PlayerSnapshot, PlayerState, StateIntervals, TrackerStrategy};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info, warn, Span};

#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    pub strategy: TrackerStrategy,
    pub intervals: StateIntervals,
    pub thresholds: ScrobbleThresholds,
    pub temporal: TemporalOptions,
    pub history_capacity: usize,
    /// dedup against every platform's history, not just the play's own
    pub dedup_all_platforms: bool,
    /// source can't tell listeners apart - keep exactly one tracker
    pub single_platform: bool,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            strategy: TrackerStrategy::default(),
            intervals: StateIntervals::default(),
            thresholds: ScrobbleThresholds::default(),
            temporal: TemporalOptions::default(),
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            dedup_all_platforms: false,
            single_platform: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Readiness {
    /// play changed, so the previous one is over
    Finished,
    /// tracker went quiet, the candidate is as settled as it will get
    Stale,
}

/// What a background sweep did
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SweepReport {
    pub removed: Vec<String>,
    pub updated: Vec<String>,
}

pub struct DiscoveryEngine {
    identity: SourceIdentity,
    options: DiscoveryOptions,
    players: BTreeMap<String, PlayerState>,
    history: HashMap<String, DiscoveryHistory>,
    state_hashes: HashMap<String, u64>,
    discovered: u64,
    events: EventBus,
    span: Span,
}

impl DiscoveryEngine {
    pub fn new(identity: SourceIdentity, options: DiscoveryOptions, events: EventBus, span: Span) -> Self {
        Self {
            identity,
            options,
            players: BTreeMap::new(),
            history: HashMap::new(),
            state_hashes: HashMap::new(),
            discovered: 0,
            events,
            span,
        }
    }

    pub fn identity(&self) -> &SourceIdentity {
        &self.identity
    }

    pub fn options(&self) -> &DiscoveryOptions {
        &self.options
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn discovered_count(&self) -> u64 {
        self.discovered
    }

    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    pub fn player(&self, platform: &PlatformId) -> Option<&PlayerState> {
        self.players.get(&platform.key())
    }

    pub fn players(&self) -> impl Iterator<Item = &PlayerState> {
        self.players.values()
    }

    pub fn player_snapshots(&self) -> Vec<PlayerSnapshot> {
        self.players.values().map(PlayerState::snapshot).collect()
    }

    /// Oldest first
    pub fn recently_discovered(&self, platform: &PlatformId) -> Vec<Play> {
        self.history
            .get(&platform.key())
            .map(|history| history.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn process_recent_plays(&mut self, snapshots: Vec<Snapshot>) -> Vec<Play> {
        self.process_recent_plays_at(snapshots, Utc::now())
    }

    /// Feed one cycle's snapshots and return newly discovered plays, oldest first.
    ///
    /// Nothing is published here - the caller hands the result to
    /// [`DiscoveryEngine::publish_discoveries`] once it is ready to dispatch.
    pub fn process_recent_plays_at(&mut self, snapshots: Vec<Snapshot>, now: DateTime<Utc>) -> Vec<Play> {
        let span = self.span.clone();
        let _entered = span.enter();

        let mut grouped: BTreeMap<String, Vec<Snapshot>> = BTreeMap::new();
        for snapshot in snapshots {
            let key = self.ensure_player(&snapshot.platform, now);
            grouped.entry(key).or_default().push(snapshot);
        }
        // a generic tracker identified mid-batch hands its snapshots over too
        let generic_key = PlatformId::generic().key();
        if !self.players.contains_key(&generic_key) {
            if let Some(orphans) = grouped.remove(&generic_key) {
                let target = self.resolve_key(&PlatformId::generic());
                grouped.entry(target).or_default().extend(orphans);
            }
        }

        let mut discovered = Vec::new();
        let keys: Vec<String> = self.players.keys().cloned().collect();

        for key in keys {
            let batch = grouped.remove(&key).unwrap_or_default();
            let ready = match self.feed_player(&key, batch, now) {
                Ok(ready) => ready,
                Err(e) => {
                    warn!("{}: {} - skipping this player for the cycle", key, e);
                    continue;
                }
            };

            for (candidate, readiness) in ready {
                if let Some(play) = self.try_discover(&key, candidate, readiness) {
                    discovered.push(play);
                }
            }
            self.publish_player_state(&key);
        }

        discovered.sort_by_key(|play| play.data.play_date);
        discovered
    }

    fn resolve_key(&self, platform: &PlatformId) -> String {
        if self.options.single_platform && platform.is_generic() {
            // most recently heard tracker stands in for "whoever is listening"
            if let Some((existing, _)) = self.players.iter().max_by_key(|(_, player)| player.state_last_updated_at()) {
                return existing.clone();
            }
        }
        platform.key()
    }

    fn ensure_player(&mut self, platform: &PlatformId, now: DateTime<Utc>) -> String {
        let key = self.resolve_key(platform);
        if self.players.contains_key(&key) {
            return key;
        }

        let mut player = PlayerState::new(platform.clone(), self.options.strategy, self.options.intervals, now);

        let generic_key = PlatformId::generic().key();
        let identified = self.options.single_platform && key != generic_key;
        if let Some(old) = identified.then(|| self.players.remove(&generic_key)).flatten() {
            info!("{} is now identified as {}, moving its session over", generic_key, key);
            old.transfer_to_new_player(&mut player);
            if let Some(older) = self.history.remove(&generic_key) {
                let capacity = self.options.history_capacity;
                self.history
                    .entry(key.clone())
                    .or_insert_with(|| DiscoveryHistory::new(capacity))
                    .absorb(older);
            }
            self.state_hashes.remove(&generic_key);
            self.events.emit(SourceEvent::PlayerRemoved {
                source: self.identity.name.clone(),
                platform: generic_key,
            });
        }

        debug!("tracking new player {}", key);
        self.players.insert(key.clone(), player);
        key
    }

    /// Feeds a platform's batch in timestamp order. The whole batch is checked first so a bad
    /// snapshot never leaves the tracker half-updated.
    fn feed_player(
        &mut self,
        key: &str,
        mut batch: Vec<Snapshot>,
        now: DateTime<Utc>,
    ) -> Result<Vec<(Play, Readiness)>, TrackerError> {
        // native ids only count within one source, so plays carry it before any comparison
        for play in batch.iter_mut().filter_map(|snapshot| snapshot.play.as_mut()) {
            if play.meta.source.is_empty() {
                play.meta.source = self.identity.name.clone();
            }
        }

        let Some(player) = self.players.get_mut(key) else {
            return Ok(Vec::new());
        };

        for snapshot in &batch {
            player.validate(snapshot)?;
        }
        batch.sort_by_key(|snapshot| snapshot.timestamp.unwrap_or(now));

        let mut ready = Vec::new();
        for snapshot in &batch {
            let update = player.update(snapshot)?;
            if let Some(finished) = update.finished {
                ready.push((finished, Readiness::Finished));
            }
        }

        if player.is_update_stale(now) {
            if let Some(candidate) = player.materialized_play() {
                ready.push((candidate, Readiness::Stale));
            }
        }
        Ok(ready)
    }

    fn try_discover(&mut self, key: &str, mut candidate: Play, readiness: Readiness) -> Option<Play> {
        let listened = candidate.data.listened_for.unwrap_or(0.0);
        let result = passes_threshold(listened, candidate.data.duration, &self.options.thresholds);
        if !result.passes {
            match readiness {
                Readiness::Finished => info!("{}: {} not scrobble-worthy, {}", key, candidate.describe(), result),
                Readiness::Stale => debug!("{}: stale {} not scrobble-worthy yet, {}", key, candidate.describe(), result),
            }
            return None;
        }

        if candidate.meta.source.is_empty() {
            candidate.meta.source = self.identity.name.clone();
        }

        if let Some(existing) = self.find_duplicate(key, &candidate) {
            debug!("{}: {} already discovered as {}", key, candidate.describe(), existing.describe());
            return None;
        }

        Some(self.record_discovery(key, candidate))
    }

    fn record_discovery(&mut self, key: &str, play: Play) -> Play {
        let capacity = self.options.history_capacity;
        self.history
            .entry(key.to_string())
            .or_insert_with(|| DiscoveryHistory::new(capacity))
            .push(play.clone());
        self.discovered += 1;
        info!("{}: discovered {}", key, play.describe());
        play
    }

    fn find_duplicate(&self, key: &str, candidate: &Play) -> Option<&Play> {
        let is_duplicate = |existing: &&Play| data_matches(existing, candidate) && self.same_occurrence(existing, candidate);
        if self.options.dedup_all_platforms {
            self.history.values().flat_map(|history| history.iter()).find(is_duplicate)
        } else {
            self.history.get(key).into_iter().flat_map(|history| history.iter()).find(is_duplicate)
        }
    }

    /// Same track, but is it the same listening event? Close start times, or a candidate
    /// starting while the existing play was still occupying the timeline.
    fn same_occurrence(&self, existing: &Play, candidate: &Play) -> bool {
        if temporally_close(existing, candidate, &self.options.temporal).close {
            return true;
        }
        match (existing.data.play_date, existing.play_end(), candidate.data.play_date) {
            (Some(start), Some(end), Some(candidate_start)) => candidate_start >= start && candidate_start < end,
            _ => false,
        }
    }

    /// Historical plays from a source's own recently-played feed, already dated.
    /// Dedups against what live tracking found and returns the new ones oldest first.
    pub fn process_backlog(&mut self, mut plays: Vec<Play>) -> Vec<Play> {
        let span = self.span.clone();
        let _entered = span.enter();

        plays.sort_by_key(|play| play.data.play_date);
        let mut accepted = Vec::new();

        for mut play in plays {
            if play.data.play_date.is_none() {
                warn!("backlog play {} has no play date, skipping", play.describe());
                continue;
            }
            if let Err(e) = play.check(&play.platform_id().key()) {
                warn!("backlog play {} rejected: {}", play.describe(), e);
                continue;
            }
            if let Some(listened) = play.data.listened_for {
                let result = passes_threshold(listened, play.data.duration, &self.options.thresholds);
                if !result.passes {
                    debug!("backlog play {} not scrobble-worthy, {}", play.describe(), result);
                    continue;
                }
            }
            if play.meta.source.is_empty() {
                play.meta.source = self.identity.name.clone();
            }

            let key = self.resolve_key(&play.platform_id());
            if let Some(existing) = self.find_duplicate(&key, &play) {
                debug!("backlog play {} already discovered as {}", play.describe(), existing.describe());
                continue;
            }
            accepted.push(self.record_discovery(&key, play));
        }

        if !accepted.is_empty() {
            info!("{} plays discovered from backlog", accepted.len());
        }
        accepted
    }

    pub fn publish_discoveries(&self, plays: &[Play]) {
        if plays.is_empty() {
            return;
        }
        self.events.emit(SourceEvent::Discovered {
            source: self.identity.clone(),
            plays: plays.to_vec(),
        });
    }

    fn publish_player_state(&mut self, key: &str) {
        let Some(player) = self.players.get(key) else {
            return;
        };
        let snapshot = player.snapshot();
        let hash = snapshot.state_hash();
        if self.state_hashes.get(key) != Some(&hash) {
            self.state_hashes.insert(key.to_string(), hash);
            self.events.emit(SourceEvent::PlayerUpdated {
                source: self.identity.name.clone(),
                player: snapshot,
            });
        }
    }

    pub fn sweep_players(&mut self) -> SweepReport {
        self.sweep_players_at(Utc::now())
    }

    /// Health check every tracker: prune the dead, refresh the visible state of the stale
    pub fn sweep_players_at(&mut self, now: DateTime<Utc>) -> SweepReport {
        let span = self.span.clone();
        let _entered = span.enter();

        let mut report = SweepReport::default();
        let mut stale_keys = Vec::new();

        for (key, player) in self.players.iter_mut() {
            let stale = player.check_stale(now);
            let orphaned = player.check_orphaned(now);
            if stale && orphaned && player.is_dead(now) {
                report.removed.push(key.clone());
            } else if stale {
                stale_keys.push(key.clone());
            }
        }

        for key in &report.removed {
            self.players.remove(key);
            self.state_hashes.remove(key);
            info!("removed dead player {}", key);
            self.events.emit(SourceEvent::PlayerRemoved {
                source: self.identity.name.clone(),
                platform: key.clone(),
            });
        }

        for key in stale_keys {
            let before = self.state_hashes.get(&key).copied();
            self.publish_player_state(&key);
            if self.state_hashes.get(&key).copied() != before {
                report.updated.push(key);
            }
        }

        report
    }

    pub fn any_playing(&self) -> bool {
        self.players.values().any(PlayerState::is_playing)
    }

    /// Shortest time left among playing trackers that know their track length
    pub fn min_remaining_at(&self, now: DateTime<Utc>) -> Option<f64> {
        self.players
            .values()
            .filter(|player| player.is_playing())
            .filter_map(|player| player.remaining_at(now))
            .reduce(f64::min)
    }
}
