use crate::model::Play;
use std::collections::VecDeque;

pub const DEFAULT_HISTORY_CAPACITY: usize = 30;

/// Fixed-capacity window of plays already discovered for one platform.
/// Oldest entries fall out when full - age never matters, only count.
#[derive(Debug, Clone)]
pub struct DiscoveryHistory {
    entries: VecDeque<Play>,
    capacity: usize,
}

impl DiscoveryHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Returns whatever got pushed out the back
    pub fn push(&mut self, play: Play) -> Option<Play> {
        let evicted = if self.entries.len() == self.capacity {
            self.entries.pop_front()
        } else {
            None
        };
        self.entries.push_back(play);
        evicted
    }

    pub fn iter(&self) -> impl Iterator<Item = &Play> {
        self.entries.iter()
    }

    /// Takes over another history. Entries end up in play date order and only the newest that fit stay.
    pub fn absorb(&mut self, other: DiscoveryHistory) {
        let mut merged: Vec<Play> = other.entries.into_iter().chain(self.entries.drain(..)).collect();
        merged.sort_by_key(|play| play.data.play_date);
        let skip = merged.len().saturating_sub(self.capacity);
        self.entries = merged.into_iter().skip(skip).collect();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for DiscoveryHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    #[test]
    fn test_evicts_oldest_at_capacity() {
        let mut history = DiscoveryHistory::new(2);
        assert!(history.push(Play::new("one", vec![])).is_none());
        assert!(history.push(Play::new("two", vec![])).is_none());
        let evicted = history.push(Play::new("three", vec![])).unwrap();
        assert_eq!(evicted.data.track, "one");
        assert_eq!(history.len(), 2);
        let tracks: Vec<_> = history.iter().map(|p| p.data.track.as_str()).collect();
        assert_eq!(tracks, vec!["two", "three"]);
    }

    #[test]
    fn test_absorb_keeps_newest() {
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let dated = |name: &str, minutes: i64| Play::new(name, vec![]).with_play_date(start + Duration::minutes(minutes));

        let mut generic = DiscoveryHistory::new(3);
        generic.push(dated("two", 2));
        generic.push(dated("four", 4));

        let mut phone = DiscoveryHistory::new(3);
        phone.push(dated("one", 1));
        phone.push(dated("three", 3));

        phone.absorb(generic);
        let tracks: Vec<_> = phone.iter().map(|p| p.data.track.as_str()).collect();
        assert_eq!(tracks, vec!["two", "three", "four"]);
    }

    #[test]
    fn test_zero_capacity_still_holds_one() {
        let history = DiscoveryHistory::new(0);
        assert_eq!(history.capacity(), 1);
        assert!(history.is_empty());
    }
}
