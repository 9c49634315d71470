//! Fuzzy play comparator
//!
//! Scores two plays in `[0, 1]` from three weighted subscores (artist,
//! title, time). Both dedup paths use the same scoring: a source checking a
//! candidate against its discovery ring, and a client checking a queued play
//! against the upstream's recent scrobbles.

mod normalize;

pub use normalize::{normalize, normalize_title};

use chrono::{DateTime, Utc};

use crate::play::Play;

pub const ARTIST_WEIGHT: f64 = 0.3;
pub const TITLE_WEIGHT: f64 = 0.4;
pub const TIME_WEIGHT: f64 = 0.3;

/// Combined score at or above this is a duplicate match.
pub const DUP_SCORE_THRESHOLD: f64 = 0.8;

/// Temporal tolerances, in seconds.
///
/// These are tunable: nothing observable pins the exact values, so they are
/// carried as options with documented defaults rather than hardcoded.
#[derive(Debug, Clone, Copy)]
pub struct CompareOptions {
    /// Two timestamps within this window count as the same instant.
    /// Default 10 s.
    pub close_seconds: i64,
    /// Window for the fuzzy bucket. Default 300 s: one side often stamps a
    /// listen at track start and the other at track end, so the skew to
    /// absorb is bounded by track length, not by clock error.
    pub fuzzy_seconds: i64,
}

impl Default for CompareOptions {
    fn default() -> Self {
        Self {
            close_seconds: 10,
            fuzzy_seconds: 300,
        }
    }
}

/// Discretized temporal accuracy between two play dates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeAccuracy {
    Exact,
    Close,
    Fuzzy,
    Far,
}

impl TimeAccuracy {
    /// Classify the gap between two play dates.
    ///
    /// When either play carries a duration, the fuzzy window stretches to
    /// cover it: a start-stamped and an end-stamped report of the same
    /// listen differ by exactly the track length.
    pub fn of(
        a: &DateTime<Utc>,
        b: &DateTime<Utc>,
        duration: Option<f64>,
        opts: &CompareOptions,
    ) -> Self {
        let diff = (*a - *b).num_seconds().abs();
        let fuzzy_window = match duration {
            Some(d) => opts.fuzzy_seconds.max(d.ceil() as i64 + opts.close_seconds),
            None => opts.fuzzy_seconds,
        };
        if diff == 0 {
            TimeAccuracy::Exact
        } else if diff <= opts.close_seconds {
            TimeAccuracy::Close
        } else if diff <= fuzzy_window {
            TimeAccuracy::Fuzzy
        } else {
            TimeAccuracy::Far
        }
    }

    /// Subscore contribution of this bucket.
    pub fn score(&self) -> f64 {
        match self {
            TimeAccuracy::Exact | TimeAccuracy::Close => 1.0,
            TimeAccuracy::Fuzzy => 0.6,
            TimeAccuracy::Far => 0.0,
        }
    }

    /// Close enough to treat as the same instant.
    pub fn is_close(&self) -> bool {
        matches!(self, TimeAccuracy::Exact | TimeAccuracy::Close)
    }
}

/// Artist-set similarity plus the count of whole (post-normalization
/// equality) matches.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ArtistScore {
    pub score: f64,
    pub whole_matches: usize,
}

/// Similarity of two artist sets in `[0, 1]`.
///
/// Each artist string is normalized, then pairs are matched greedily by
/// descending similarity (each artist used at most once) and the summed
/// pair scores are divided by the larger set size. Artist lists are short,
/// so the greedy assignment is the maximum-weight matching in practice.
pub fn artist_similarity(a: &[String], b: &[String]) -> ArtistScore {
    let a: Vec<String> = a.iter().map(|s| normalize(s)).collect();
    let b: Vec<String> = b.iter().map(|s| normalize(s)).collect();
    if a.is_empty() || b.is_empty() {
        return ArtistScore {
            score: 0.0,
            whole_matches: 0,
        };
    }

    let mut pairs: Vec<(f64, usize, usize)> = Vec::with_capacity(a.len() * b.len());
    for (i, x) in a.iter().enumerate() {
        for (j, y) in b.iter().enumerate() {
            pairs.push((strsim::jaro_winkler(x, y), i, j));
        }
    }
    pairs.sort_by(|l, r| r.0.partial_cmp(&l.0).unwrap_or(std::cmp::Ordering::Equal));

    let mut used_a = vec![false; a.len()];
    let mut used_b = vec![false; b.len()];
    let mut total = 0.0;
    let mut whole_matches = 0;
    for (sim, i, j) in pairs {
        if used_a[i] || used_b[j] {
            continue;
        }
        used_a[i] = true;
        used_b[j] = true;
        total += sim;
        if a[i] == b[j] {
            whole_matches += 1;
        }
    }

    ArtistScore {
        score: total / a.len().max(b.len()) as f64,
        whole_matches,
    }
}

/// Title similarity in `[0, 1]` after normalization and trailing-noise
/// stripping.
pub fn title_similarity(a: &str, b: &str) -> f64 {
    strsim::normalized_levenshtein(&normalize_title(a), &normalize_title(b))
}

/// Full comparison breakdown, kept for observability (the client tracks its
/// closest existing-scrobble match with this).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlayComparison {
    pub title: f64,
    pub artist: f64,
    pub time: f64,
    pub whole_artist_matches: usize,
    /// Multi-artist bonus was applied to `score`
    pub bonus_applied: bool,
    /// Weighted combined score in `[0, 1]`
    pub score: f64,
}

impl PlayComparison {
    pub fn is_duplicate(&self) -> bool {
        self.score >= DUP_SCORE_THRESHOLD
    }
}

/// Compare two plays.
///
/// Symmetric up to the multi-artist bonus, which may raise one direction
/// when the artist-count condition differs between the sides.
pub fn compare_plays(a: &Play, b: &Play, opts: &CompareOptions) -> PlayComparison {
    let title = title_similarity(&a.data.track, &b.data.track);
    let artists = artist_similarity(&a.data.artists, &b.data.artists);
    let duration = a.data.duration.or(b.data.duration);
    let time = TimeAccuracy::of(&a.data.play_date, &b.data.play_date, duration, opts).score();

    let mut score = ARTIST_WEIGHT * artists.score + TITLE_WEIGHT * title + TIME_WEIGHT * time;
    let mut bonus_applied = false;

    // One side often reports only the primary artist while the other
    // reports all credited artists. When everything else lines up, lift the
    // artist subscore instead of letting the missing credits sink the match.
    let multi_artist = a.data.artists.len() > 1 || b.data.artists.len() > 1;
    if score < 1.0
        && time > 0.0
        && title > 0.98
        && artists.score > 0.1
        && artists.whole_matches > 0
        && multi_artist
    {
        let bonus = (artists.score * 0.5)
            .max((1.0 - artists.score) * 0.75)
            .max(0.1);
        let artist_component = (ARTIST_WEIGHT + 0.05) * (artists.score + bonus);
        score = (artist_component + TITLE_WEIGHT * title + TIME_WEIGHT * time).min(1.0);
        bonus_applied = true;
    }

    PlayComparison {
        title,
        artist: artists.score,
        time,
        whole_artist_matches: artists.whole_matches,
        bonus_applied,
        score,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::play::{PlayData, PlayMeta};
    use chrono::TimeZone;

    fn play(track: &str, artists: &[&str], offset_s: i64, duration: Option<f64>) -> Play {
        let base = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        Play {
            data: PlayData {
                track: track.to_string(),
                artists: artists.iter().map(|s| s.to_string()).collect(),
                album_artists: Vec::new(),
                album: None,
                duration,
                play_date: base + chrono::Duration::seconds(offset_s),
                listened_for: None,
            },
            meta: PlayMeta::default(),
        }
    }

    #[test]
    fn normalize_strips_trailing_noise() {
        assert_eq!(normalize_title("My Song (Album Version)"), "my song");
        assert_eq!(normalize_title("My Song (Live) [2011]"), "my song");
        assert_eq!(normalize_title("  Weird   Spacing "), "weird spacing");
        // A title that is nothing but a parenthetical keeps its content
        assert_eq!(normalize_title("(Untitled)"), "(untitled)");
    }

    #[test]
    fn time_accuracy_buckets() {
        let opts = CompareOptions::default();
        let base = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();

        let close = base + chrono::Duration::seconds(8);
        let fuzzy = base + chrono::Duration::seconds(45);
        let far = base + chrono::Duration::seconds(2000);

        assert_eq!(TimeAccuracy::of(&base, &base, None, &opts), TimeAccuracy::Exact);
        assert_eq!(TimeAccuracy::of(&base, &close, None, &opts), TimeAccuracy::Close);
        assert_eq!(TimeAccuracy::of(&base, &fuzzy, None, &opts), TimeAccuracy::Fuzzy);
        assert_eq!(TimeAccuracy::of(&base, &far, None, &opts), TimeAccuracy::Far);

        // A known duration stretches the fuzzy window to cover start-vs-end
        // stamping of a long track.
        let end_stamped = base + chrono::Duration::seconds(1800);
        assert_eq!(
            TimeAccuracy::of(&base, &end_stamped, Some(1800.0), &opts),
            TimeAccuracy::Fuzzy
        );

        assert_eq!(TimeAccuracy::Exact.score(), 1.0);
        assert_eq!(TimeAccuracy::Close.score(), 1.0);
        assert_eq!(TimeAccuracy::Fuzzy.score(), 0.6);
        assert_eq!(TimeAccuracy::Far.score(), 0.0);
    }

    #[test]
    fn identical_plays_score_one() {
        let a = play("Sonora", &["The Bongo Hop"], 0, None);
        let cmp = compare_plays(&a, &a.clone(), &CompareOptions::default());
        assert!(cmp.score > 0.99, "score was {}", cmp.score);
        assert!(cmp.is_duplicate());
    }

    #[test]
    fn unrelated_plays_do_not_match() {
        let a = play("Sonora", &["The Bongo Hop"], 0, None);
        let b = play("Paranoid Android", &["Radiohead"], 4000, None);
        let cmp = compare_plays(&a, &b, &CompareOptions::default());
        assert!(!cmp.is_duplicate(), "score was {}", cmp.score);
    }

    #[test]
    fn artist_similarity_counts_whole_matches() {
        let a = vec!["The Bongo Hop".to_string()];
        let b = vec!["Nidia Gongora".to_string(), "The Bongo Hop".to_string()];
        let s = artist_similarity(&a, &b);
        assert_eq!(s.whole_matches, 1);
        assert!(s.score > 0.4 && s.score < 0.7, "score was {}", s.score);

        let empty: Vec<String> = Vec::new();
        assert_eq!(artist_similarity(&a, &empty).score, 0.0);
    }

    /// Primary-artist-only vs all-artists reports of the same listen match
    /// through the multi-artist bonus.
    #[test]
    fn multi_artist_bonus_bridges_partial_credits() {
        let candidate = play("Sonora", &["The Bongo Hop"], 0, None);
        let ringed = play(
            "Sonora",
            &["Nidia Gongora", "The Bongo Hop"],
            300,
            Some(330.0),
        );

        let cmp = compare_plays(&candidate, &ringed, &CompareOptions::default());
        assert!(cmp.bonus_applied);
        assert!(
            cmp.is_duplicate(),
            "expected duplicate, breakdown: {:?}",
            cmp
        );
    }

    #[test]
    fn bonus_requires_temporal_plausibility() {
        let candidate = play("Sonora", &["The Bongo Hop"], 0, None);
        let ringed = play("Sonora", &["Nidia Gongora", "The Bongo Hop"], 4000, None);

        let cmp = compare_plays(&candidate, &ringed, &CompareOptions::default());
        assert!(!cmp.bonus_applied);
        assert!(!cmp.is_duplicate());
    }

    #[test]
    fn score_is_symmetric_without_bonus() {
        let a = play("Sonora (Radio Edit)", &["The Bongo Hop"], 0, None);
        let b = play("Sonora", &["The Bongo Hop"], 30, None);

        let ab = compare_plays(&a, &b, &CompareOptions::default());
        let ba = compare_plays(&b, &a, &CompareOptions::default());
        assert!((ab.score - ba.score).abs() < 1e-9);
    }
}
