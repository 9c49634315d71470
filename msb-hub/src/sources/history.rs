//! Source-of-truth reset heuristic for scraped history lists
//!
//! Some upstreams expose listen history as an unordered, occasionally
//! reshuffled list rather than an append-only feed. Diffing consecutive
//! fetches tells reshuffles apart from genuine new listens: a coherent
//! fetch is the previous list with zero or more entries prepended. While
//! the list is unstable nothing is emitted, trading a possibly missed play
//! for the flood of spurious duplicates a reshuffle would otherwise cause.

use msb_common::compare::normalize;
use msb_common::play::Play;
use tracing::{debug, warn};

/// Tracks consecutive history fetches for one source.
pub struct HistorySync {
    prev: Vec<Play>,
    ok_streak: u32,
    /// Consecutive consistent ticks required before prepends are emitted
    stable_after: u32,
}

/// Identity for list diffing: normalized track plus normalized artist set.
/// Timestamps are deliberately excluded, scraped lists rarely carry
/// reliable ones.
fn same_entry(a: &Play, b: &Play) -> bool {
    if normalize(&a.data.track) != normalize(&b.data.track) {
        return false;
    }
    let mut artists_a: Vec<String> = a.data.artists.iter().map(|s| normalize(s)).collect();
    let mut artists_b: Vec<String> = b.data.artists.iter().map(|s| normalize(s)).collect();
    artists_a.sort();
    artists_b.sort();
    artists_a == artists_b
}

impl HistorySync {
    pub fn new(stable_after: u32) -> Self {
        Self {
            prev: Vec::new(),
            ok_streak: 0,
            stable_after: stable_after.max(1),
        }
    }

    /// Whether the list has been consistent long enough to emit.
    pub fn is_stable(&self) -> bool {
        self.ok_streak >= self.stable_after
    }

    /// Observe one fetch of the history list, newest entry first.
    ///
    /// Returns the newly prepended plays that may be emitted as discovered,
    /// which is empty until the list has been consistent for
    /// `stable_after` consecutive ticks.
    pub fn observe(&mut self, source: &str, latest: &[Play]) -> Vec<Play> {
        // First sighting seeds the baseline; nothing is new yet.
        if self.prev.is_empty() {
            self.prev = latest.to_vec();
            self.ok_streak = 1;
            return Vec::new();
        }

        let consistent = self.diff_is_coherent(latest);
        let prepended = if consistent {
            latest
                .iter()
                .take_while(|entry| !same_entry(entry, &self.prev[0]))
                .cloned()
                .collect()
        } else {
            Vec::new()
        };

        self.prev = latest.to_vec();

        if !consistent {
            warn!(
                source,
                "history list reordered inconsistently, suppressing this tick"
            );
            self.ok_streak = 0;
            return Vec::new();
        }

        self.ok_streak = self.ok_streak.saturating_add(1);
        if !self.is_stable() {
            debug!(
                source,
                ok_streak = self.ok_streak,
                needed = self.stable_after,
                "history list consistent but not yet stable"
            );
            return Vec::new();
        }

        prepended
    }

    /// A fetch is coherent when the previous list reappears, in order, as a
    /// contiguous run after zero or more prepended entries.
    fn diff_is_coherent(&self, latest: &[Play]) -> bool {
        let anchor = &self.prev[0];
        let Some(offset) = latest.iter().position(|e| same_entry(e, anchor)) else {
            // The whole previous list vanished: a wholesale replacement,
            // not a prepend.
            return false;
        };

        let overlap = self.prev.len().min(latest.len() - offset);
        let tail_matches = self.prev[..overlap]
            .iter()
            .zip(&latest[offset..offset + overlap])
            .all(|(p, l)| same_entry(p, l));
        if !tail_matches {
            return false;
        }

        // Anything "prepended" that was already in the previous list is an
        // entry that moved, which makes this a reorder, not a prepend.
        latest[..offset]
            .iter()
            .all(|e| !self.prev.iter().any(|p| same_entry(p, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use msb_common::play::{PlayData, PlayMeta};
    use chrono::{TimeZone, Utc};

    fn play(track: &str) -> Play {
        Play {
            data: PlayData {
                track: track.to_string(),
                artists: vec!["Artist".to_string()],
                album_artists: Vec::new(),
                album: None,
                duration: None,
                play_date: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
                listened_for: None,
            },
            meta: PlayMeta::default(),
        }
    }

    fn list(tracks: &[&str]) -> Vec<Play> {
        tracks.iter().map(|t| play(t)).collect()
    }

    #[test]
    fn first_fetch_seeds_silently() {
        let mut sync = HistorySync::new(2);
        let emitted = sync.observe("ytm", &list(&["c", "b", "a"]));
        assert!(emitted.is_empty());
    }

    #[test]
    fn coherent_prepends_emit_once_stable() {
        let mut sync = HistorySync::new(2);
        sync.observe("ytm", &list(&["b", "a"]));

        // Second consistent tick reaches stability; its prepend is emitted
        let emitted = sync.observe("ytm", &list(&["c", "b", "a"]));
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].data.track, "c");

        let emitted = sync.observe("ytm", &list(&["e", "d", "c", "b", "a"]));
        assert_eq!(emitted.len(), 2);
        assert_eq!(emitted[0].data.track, "e");
        assert_eq!(emitted[1].data.track, "d");
    }

    #[test]
    fn unchanged_list_emits_nothing() {
        let mut sync = HistorySync::new(2);
        sync.observe("ytm", &list(&["b", "a"]));
        assert!(sync.observe("ytm", &list(&["b", "a"])).is_empty());
        assert!(sync.observe("ytm", &list(&["b", "a"])).is_empty());
    }

    /// tick1=ok, tick2=reordered, tick3=ok, tick4=ok: the tick2 prepend is
    /// suppressed, the tick4 prepend is emitted.
    #[test]
    fn reorder_suppresses_until_stability_returns() {
        let mut sync = HistorySync::new(2);

        // Seed + tick1 (consistent)
        sync.observe("ytm", &list(&["b", "a"]));
        sync.observe("ytm", &list(&["c", "b", "a"]));
        assert!(sync.is_stable());

        // tick2: new entry, but the remainder was reshuffled
        let emitted = sync.observe("ytm", &list(&["d", "a", "c", "b"]));
        assert!(emitted.is_empty());
        assert!(!sync.is_stable());

        // tick3: consistent again, but only one tick of stability
        let emitted = sync.observe("ytm", &list(&["d", "a", "c", "b"]));
        assert!(emitted.is_empty());
        assert!(!sync.is_stable());

        // tick4: second consistent tick, prepends flow again
        let emitted = sync.observe("ytm", &list(&["e", "d", "a", "c", "b"]));
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].data.track, "e");
    }

    #[test]
    fn truncated_tail_is_still_coherent() {
        let mut sync = HistorySync::new(1);
        sync.observe("ytm", &list(&["c", "b", "a"]));

        // "a" fell off the end of the window, "d" was prepended
        let emitted = sync.observe("ytm", &list(&["d", "c", "b"]));
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].data.track, "d");
    }

    #[test]
    fn wholesale_replacement_is_inconsistent() {
        let mut sync = HistorySync::new(1);
        sync.observe("ytm", &list(&["c", "b", "a"]));

        assert!(sync.observe("ytm", &list(&["z", "y", "x"])).is_empty());
        assert!(!sync.is_stable());
    }
}
