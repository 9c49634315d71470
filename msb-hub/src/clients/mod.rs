//! Client core: queue, existing-scrobble detection, dead-letter retry
//!
//! A client owns its scrobble queue and the snapshots it dedups against:
//! the upstream's recent scrobbles (refreshed lazily) and the ring of its
//! own successful scrobbles. The worker loop drains the queue in listen
//! order, paces calls to the upstream, and moves non-fatal failures to the
//! dead-letter queue for the heartbeat to replay.

pub mod listenbrainz;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use msb_common::backoff::Backoff;
use msb_common::compare::{compare_plays, normalize, CompareOptions, PlayComparison, TimeAccuracy};
use msb_common::config::ComponentOptions;
use msb_common::error::{Error, Result, UpstreamError};
use msb_common::events::{ComponentKind, ComponentStatus, EventBus, MsbEvent};
use msb_common::play::{DeadLetterScrobble, Play, QueuedScrobble, ScrobbledPlay};
use msb_common::time::SharedClock;
use msb_common::transform::{PlayTransform, Stage};

use crate::lifecycle::StatusCell;

/// Outbound contract every client adapter exposes to the core.
#[async_trait]
pub trait ScrobbleClient: Send + Sync {
    fn name(&self) -> &str;

    /// Report one play upstream; the response normalized back into a Play.
    async fn scrobble(&self, play: &Play) -> std::result::Result<Play, UpstreamError>;

    /// The upstream's recently scrobbled plays, for the dedup snapshot.
    async fn recent_scrobbles(&self) -> std::result::Result<Vec<Play>, UpstreamError>;
}

/// Resolved client tunables.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub check_existing_scrobbles: bool,
    /// Minimum spacing between scrobble calls
    pub scrobble_delay: Duration,
    /// Worker sleep between queue drains
    pub scrobble_sleep: Duration,
    /// Spacing between dead-letter replay attempts
    pub dead_letter_sleep: Duration,
    pub dead_letter_retries: u32,
    pub max_poll_retries: u32,
    pub scrobbled_capacity: usize,
    pub compare: CompareOptions,
    pub exclude_sources: Vec<String>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            check_existing_scrobbles: true,
            scrobble_delay: Duration::from_millis(1000),
            scrobble_sleep: Duration::from_secs(10),
            dead_letter_sleep: Duration::from_secs(1),
            dead_letter_retries: 1,
            max_poll_retries: 5,
            scrobbled_capacity: 40,
            compare: CompareOptions::default(),
            exclude_sources: Vec::new(),
        }
    }
}

impl ClientOptions {
    pub fn from_config(opts: &ComponentOptions) -> Self {
        let defaults = Self::default();
        Self {
            check_existing_scrobbles: opts
                .check_existing_scrobbles
                .unwrap_or(defaults.check_existing_scrobbles),
            scrobble_delay: opts
                .scrobble_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.scrobble_delay),
            scrobble_sleep: opts
                .scrobble_sleep_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.scrobble_sleep),
            dead_letter_sleep: defaults.dead_letter_sleep,
            dead_letter_retries: opts
                .dead_letter_retries
                .unwrap_or(defaults.dead_letter_retries),
            max_poll_retries: opts.max_poll_retries.unwrap_or(defaults.max_poll_retries),
            scrobbled_capacity: defaults.scrobbled_capacity,
            compare: defaults.compare,
            exclude_sources: opts.exclude_sources.clone().unwrap_or_default(),
        }
    }
}

/// How a single scrobble attempt ended.
enum AttemptOutcome {
    Scrobbled,
    /// Dropped without an upstream call (stale, duplicate, or transformed
    /// into nothing)
    Skipped(&'static str),
    Failed(UpstreamError),
}

/// Per-client state: queue, snapshots, dead letters.
pub struct ClientCore {
    name: String,
    transform: PlayTransform,
    pub opts: ClientOptions,

    /// FIFO kept sorted by play date ascending
    queued: VecDeque<QueuedScrobble>,
    /// Upstream snapshot, sorted by play date ascending
    recent_scrobbles: Vec<Play>,
    /// Ring of this client's own successful scrobbles
    scrobbled: VecDeque<ScrobbledPlay>,
    dead_letter: Vec<DeadLetterScrobble>,

    last_scrobble_check: Option<DateTime<Utc>>,
    last_attempt: Option<Instant>,
    /// Best existing-scrobble comparison seen, for observability
    closest_match: Option<(Play, PlayComparison)>,

    pub authed: bool,
    pub scrobbling: bool,
    pub status: StatusCell,
    bus: EventBus,
    clock: SharedClock,
}

impl ClientCore {
    pub fn new(
        name: impl Into<String>,
        transform: PlayTransform,
        opts: ClientOptions,
        bus: EventBus,
        clock: SharedClock,
    ) -> Self {
        let name = name.into();
        let status = StatusCell::new(&name, ComponentKind::Client, bus.clone(), clock.clone());
        Self {
            name,
            transform,
            opts,
            queued: VecDeque::new(),
            recent_scrobbles: Vec::new(),
            scrobbled: VecDeque::new(),
            dead_letter: Vec::new(),
            last_scrobble_check: None,
            last_attempt: None,
            closest_match: None,
            authed: false,
            scrobbling: false,
            status,
            bus,
            clock,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn queue_len(&self) -> usize {
        self.queued.len()
    }

    pub fn queued(&self) -> impl Iterator<Item = &QueuedScrobble> {
        self.queued.iter()
    }

    pub fn scrobbled(&self) -> impl Iterator<Item = &ScrobbledPlay> {
        self.scrobbled.iter()
    }

    pub fn dead_letters(&self) -> &[DeadLetterScrobble] {
        &self.dead_letter
    }

    pub fn closest_match(&self) -> Option<&(Play, PlayComparison)> {
        self.closest_match.as_ref()
    }

    /// Accept a play fanned out from a source.
    ///
    /// Applies the exclusion list and the client-side `preCompare`
    /// transform, then inserts in listen order. Returns the queued id, or
    /// `None` when the play was refused or dropped.
    pub fn accept(&mut self, source: &str, play: &Play) -> Option<Uuid> {
        if self.opts.exclude_sources.iter().any(|s| s == source) {
            debug!(client = %self.name, source, "source excluded, refusing play");
            return None;
        }
        let play = self.transform.apply(Stage::PreCompare, play, &self.name)?;

        let queued = QueuedScrobble::new(source, play);
        let id = queued.id;
        self.bus.emit_lossy(MsbEvent::ScrobbleQueued {
            name: self.name.clone(),
            source: queued.source.clone(),
            id,
            play: queued.play.clone(),
            timestamp: self.clock.now(),
        });

        self.queued.push_back(queued);
        // Keep the queue monotone in play date so scrobbles go out in
        // listen order.
        self.queued
            .make_contiguous()
            .sort_by_key(|q| q.play.data.play_date);
        Some(id)
    }

    /// Oldest play date in the upstream snapshot.
    fn oldest_scrobble_time(&self) -> Option<DateTime<Utc>> {
        self.recent_scrobbles.first().map(|p| p.data.play_date)
    }

    /// A play older than the oldest known upstream scrobble is outside the
    /// window we can dedup against; refusing it keeps a restart from
    /// re-sending ancient plays.
    pub fn time_frame_valid(&self, play: &Play) -> bool {
        match self.oldest_scrobble_time() {
            Some(oldest) => play.data.play_date > oldest,
            None => true,
        }
    }

    /// Combined existing-scrobble check: own scrobble ring first (exact
    /// match + temporal closeness), then the fuzzy comparator against the
    /// upstream snapshot. The closest match is tracked either way.
    pub fn already_scrobbled(&mut self, play: &Play) -> bool {
        if !self.opts.check_existing_scrobbles {
            return false;
        }

        let candidate = self
            .transform
            .apply(Stage::CompareCandidate, play, &self.name)
            .unwrap_or_else(|| play.clone());

        for own in &self.scrobbled {
            if plays_match_exact(&candidate, &own.play)
                && TimeAccuracy::of(
                    &candidate.data.play_date,
                    &own.play.data.play_date,
                    candidate.data.duration.or(own.play.data.duration),
                    &self.opts.compare,
                )
                .is_close()
            {
                debug!(client = %self.name, play = %play.describe(), "already scrobbled by us");
                return true;
            }
        }

        if self.recent_scrobbles.is_empty() {
            return false;
        }

        let mut duplicate = false;
        for existing in &self.recent_scrobbles {
            let existing_view = self
                .transform
                .apply(Stage::CompareExisting, existing, &self.name)
                .unwrap_or_else(|| existing.clone());
            let cmp = compare_plays(&candidate, &existing_view, &self.opts.compare);

            let closer = match &self.closest_match {
                None => true,
                Some((prev_play, prev_cmp)) => {
                    cmp.score > prev_cmp.score
                        || (cmp.score == prev_cmp.score
                            && existing.data.play_date > prev_play.data.play_date)
                }
            };
            if closer {
                self.closest_match = Some((existing.clone(), cmp));
            }

            if cmp.is_duplicate() {
                debug!(
                    client = %self.name,
                    play = %play.describe(),
                    existing = %existing.describe(),
                    score = cmp.score,
                    "existing upstream scrobble matches"
                );
                duplicate = true;
            }
        }
        duplicate
    }

    /// Pull the upstream's recent scrobbles into the local snapshot.
    pub async fn refresh_recent_scrobbles(
        &mut self,
        adapter: &dyn ScrobbleClient,
    ) -> std::result::Result<(), UpstreamError> {
        let mut recent = adapter.recent_scrobbles().await?;
        recent.sort_by_key(|p| p.data.play_date);
        debug!(client = %self.name, count = recent.len(), "refreshed recent scrobbles");
        self.recent_scrobbles = recent;
        self.last_scrobble_check = Some(self.clock.now());
        Ok(())
    }

    fn record_scrobbled(&mut self, play: Play, scrobble: Play) {
        info!(client = %self.name, play = %play.describe(), "scrobbled");
        if self.scrobbled.len() >= self.opts.scrobbled_capacity {
            self.scrobbled.pop_front();
        }
        self.scrobbled.push_back(ScrobbledPlay {
            play: play.clone(),
            scrobble,
        });
        self.bus.emit_lossy(MsbEvent::Scrobbled {
            name: self.name.clone(),
            play,
            timestamp: self.clock.now(),
        });
    }

    fn add_dead_letter(&mut self, queued: QueuedScrobble, error: &UpstreamError) {
        warn!(
            client = %self.name,
            play = %queued.play.describe(),
            error = %error,
            "scrobble failed, dead-lettering"
        );
        self.bus.emit_lossy(MsbEvent::DeadLetter {
            name: self.name.clone(),
            id: queued.id,
            retries: 0,
            error: error.to_string(),
            timestamp: self.clock.now(),
        });
        self.dead_letter
            .push(DeadLetterScrobble::new(queued, error.to_string()));
    }

    /// Wait out the pacing window since the previous scrobble attempt.
    async fn pace(&mut self) {
        if let Some(last) = self.last_attempt {
            let elapsed = last.elapsed();
            if elapsed < self.opts.scrobble_delay {
                tokio::time::sleep(self.opts.scrobble_delay - elapsed).await;
            }
        }
        self.last_attempt = Some(Instant::now());
    }

    /// One attempt for one queued scrobble: timeframe check, dedup check,
    /// `postCompare` transform, adapter call. Shared by the main loop and
    /// dead-letter replay.
    async fn attempt(
        &mut self,
        adapter: &dyn ScrobbleClient,
        queued: &QueuedScrobble,
    ) -> AttemptOutcome {
        if !self.time_frame_valid(&queued.play) {
            warn!(
                client = %self.name,
                play = %queued.play.describe(),
                "older than any upstream scrobble we know of, dropping"
            );
            return AttemptOutcome::Skipped("before upstream window");
        }
        if self.already_scrobbled(&queued.play) {
            return AttemptOutcome::Skipped("already scrobbled");
        }

        // A postCompare rule emptying a field sends the play with that
        // field missing; only a play left without artists is dropped.
        let Some(outgoing) = self
            .transform
            .apply(Stage::PostCompare, &queued.play, &self.name)
        else {
            return AttemptOutcome::Skipped("transform removed all artists");
        };

        self.pace().await;
        match adapter.scrobble(&outgoing).await {
            Ok(scrobble) => {
                self.record_scrobbled(queued.play.clone(), scrobble);
                AttemptOutcome::Scrobbled
            }
            Err(e) => AttemptOutcome::Failed(e),
        }
    }

    /// Drain the queue once.
    ///
    /// Returns with `Err` on a show-stopper, leaving the failed scrobble
    /// back at the front of the queue for the supervised retry.
    pub async fn process_queue(&mut self, adapter: &dyn ScrobbleClient) -> Result<()> {
        while let Some(queued) = self.queued.pop_front() {
            self.bus.emit_lossy(MsbEvent::ScrobbleDequeued {
                name: self.name.clone(),
                id: queued.id,
                timestamp: self.clock.now(),
            });

            // Refresh lazily: only when the snapshot predates something in
            // the queue and could therefore miss a relevant upstream entry.
            let newest_queued = self
                .queued
                .back()
                .map(|q| q.play.data.play_date)
                .unwrap_or(queued.play.data.play_date)
                .max(queued.play.data.play_date);
            let stale = match self.last_scrobble_check {
                None => true,
                Some(checked) => checked < newest_queued,
            };
            if stale && self.opts.check_existing_scrobbles {
                if let Err(e) = self.refresh_recent_scrobbles(adapter).await {
                    warn!(
                        client = %self.name,
                        error = %e,
                        "could not refresh recent scrobbles, deduping against stale snapshot"
                    );
                }
            }

            match self.attempt(adapter, &queued).await {
                AttemptOutcome::Scrobbled => {}
                AttemptOutcome::Skipped(reason) => {
                    debug!(client = %self.name, play = %queued.play.describe(), reason, "skipped");
                }
                // Auth revocation also surfaces to the supervised worker;
                // the play stays at the front for the re-authed retry.
                AttemptOutcome::Failed(e) if e.show_stopper || e.is_auth_revoked() => {
                    self.queued.push_front(queued);
                    return Err(Error::Upstream(e));
                }
                AttemptOutcome::Failed(e) => {
                    self.add_dead_letter(queued, &e);
                }
            }
        }
        Ok(())
    }

    /// Replay dead letters with remaining retry budget, oldest play first.
    ///
    /// Returns how many entries were cleared (scrobbled, or skipped as
    /// duplicates).
    pub async fn process_dead_letters(&mut self, adapter: &dyn ScrobbleClient) -> usize {
        self.dead_letter
            .sort_by_key(|d| d.queued.play.data.play_date);

        let due: Vec<Uuid> = self
            .dead_letter
            .iter()
            .filter(|d| d.retries < self.opts.dead_letter_retries)
            .map(|d| d.queued.id)
            .collect();

        let mut cleared = 0;
        for (i, id) in due.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(self.opts.dead_letter_sleep).await;
            }
            if self.retry_dead_letter(adapter, *id).await {
                cleared += 1;
            }
        }
        cleared
    }

    /// Replay a single dead letter now (also used by the management API).
    /// Returns true when the entry was cleared.
    pub async fn retry_dead_letter(&mut self, adapter: &dyn ScrobbleClient, id: Uuid) -> bool {
        let Some(idx) = self.dead_letter.iter().position(|d| d.queued.id == id) else {
            return false;
        };
        let queued = self.dead_letter[idx].queued.clone();

        match self.attempt(adapter, &queued).await {
            AttemptOutcome::Scrobbled | AttemptOutcome::Skipped(_) => {
                self.dead_letter.retain(|d| d.queued.id != id);
                true
            }
            AttemptOutcome::Failed(e) => {
                let now = self.clock.now();
                if let Some(entry) = self.dead_letter.iter_mut().find(|d| d.queued.id == id) {
                    entry.retries += 1;
                    entry.error = e.to_string();
                    entry.last_retry = Some(now);
                    debug!(
                        client = %self.name,
                        play = %entry.queued.play.describe(),
                        retries = entry.retries,
                        "dead letter retry failed"
                    );
                }
                false
            }
        }
    }

    /// Remove a dead letter without retrying it.
    pub fn remove_dead_letter(&mut self, id: Uuid) -> bool {
        let before = self.dead_letter.len();
        self.dead_letter.retain(|d| d.queued.id != id);
        self.dead_letter.len() < before
    }
}

/// Exact-identity match on normalized track, artist set and album.
fn plays_match_exact(a: &Play, b: &Play) -> bool {
    if normalize(&a.data.track) != normalize(&b.data.track) {
        return false;
    }
    let mut artists_a: Vec<String> = a.data.artists.iter().map(|s| normalize(s)).collect();
    let mut artists_b: Vec<String> = b.data.artists.iter().map(|s| normalize(s)).collect();
    artists_a.sort();
    artists_b.sort();
    if artists_a != artists_b {
        return false;
    }
    match (&a.data.album, &b.data.album) {
        (Some(x), Some(y)) => normalize(x) == normalize(y),
        (None, None) => true,
        _ => false,
    }
}

/// Supervised worker loop for one client.
///
/// Drains the queue while `scrobbling` is set, replays dead letters on a
/// heartbeat, and backs off after show-stoppers up to the retry budget.
/// Auth revocation stops the worker and flags the client for re-auth.
pub async fn run_worker(
    core: Arc<Mutex<ClientCore>>,
    adapter: Arc<dyn ScrobbleClient>,
    cancel: CancellationToken,
) {
    let (name, opts) = {
        let mut core = core.lock().await;
        core.scrobbling = true;
        core.status.set(ComponentStatus::Running);
        (core.name.clone(), core.opts.clone())
    };

    let mut backoff = Backoff::new(opts.scrobble_sleep, 2.0, Duration::from_secs(600));
    let mut last_heartbeat = Instant::now();
    let mut errored = false;

    loop {
        if cancel.is_cancelled() {
            break;
        }

        let drained = {
            let mut core = core.lock().await;
            if !core.scrobbling {
                break;
            }
            core.process_queue(adapter.as_ref()).await
        };

        match drained {
            Ok(()) => backoff.reset(),
            Err(Error::Upstream(e)) if e.is_auth_revoked() => {
                warn!(client = %name, error = %e, "authentication revoked, stopping worker");
                let mut core = core.lock().await;
                core.authed = false;
                core.status.set(ComponentStatus::Errored);
                errored = true;
                break;
            }
            Err(e) => {
                if backoff.attempt() >= opts.max_poll_retries {
                    warn!(client = %name, error = %e, "scrobble retries exhausted, stopping worker");
                    errored = true;
                    break;
                }
                let delay = backoff.next_delay();
                warn!(
                    client = %name,
                    error = %e,
                    attempt = backoff.attempt(),
                    delay_s = delay.as_secs(),
                    "worker error, backing off"
                );
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => continue,
                }
            }
        }

        if last_heartbeat.elapsed() >= opts.scrobble_sleep {
            let mut core = core.lock().await;
            let cleared = core.process_dead_letters(adapter.as_ref()).await;
            if cleared > 0 {
                info!(client = %name, cleared, "dead letters recovered");
            }
            last_heartbeat = Instant::now();
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(opts.scrobble_sleep) => {}
        }
    }

    let mut core = core.lock().await;
    core.scrobbling = false;
    if !errored {
        core.status.set(ComponentStatus::Stopped);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use msb_common::play::{PlayData, PlayMeta};
    use msb_common::time::system_clock;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn play(track: &str, artists: &[&str], offset_s: i64) -> Play {
        let base = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        Play {
            data: PlayData {
                track: track.to_string(),
                artists: artists.iter().map(|s| s.to_string()).collect(),
                album_artists: Vec::new(),
                album: None,
                duration: None,
                play_date: base + chrono::Duration::seconds(offset_s),
                listened_for: None,
            },
            meta: PlayMeta::default(),
        }
    }

    /// Adapter with scripted failures.
    struct FakeAdapter {
        fail_first: AtomicUsize,
        show_stopper: bool,
        recent: Vec<Play>,
        calls: AtomicUsize,
    }

    impl FakeAdapter {
        fn ok() -> Self {
            Self {
                fail_first: AtomicUsize::new(0),
                show_stopper: false,
                recent: Vec::new(),
                calls: AtomicUsize::new(0),
            }
        }

        fn failing(times: usize, show_stopper: bool) -> Self {
            Self {
                fail_first: AtomicUsize::new(times),
                show_stopper,
                recent: Vec::new(),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ScrobbleClient for FakeAdapter {
        fn name(&self) -> &str {
            "fake"
        }

        async fn scrobble(&self, play: &Play) -> std::result::Result<Play, UpstreamError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let remaining = self.fail_first.load(Ordering::SeqCst);
            if remaining > 0 {
                self.fail_first.store(remaining - 1, Ordering::SeqCst);
                return Err(if self.show_stopper {
                    UpstreamError::show_stopper("rejected")
                } else {
                    UpstreamError::retryable("rate limited").with_status(429)
                });
            }
            Ok(play.clone())
        }

        async fn recent_scrobbles(&self) -> std::result::Result<Vec<Play>, UpstreamError> {
            Ok(self.recent.clone())
        }
    }

    fn core() -> ClientCore {
        let opts = ClientOptions {
            scrobble_delay: Duration::from_millis(0),
            dead_letter_sleep: Duration::from_millis(0),
            ..Default::default()
        };
        ClientCore::new(
            "test-client",
            PlayTransform::default(),
            opts,
            EventBus::new(64),
            system_clock(),
        )
    }

    #[test]
    fn queue_stays_sorted_by_play_date() {
        let mut c = core();
        c.accept("src", &play("Third", &["A"], 300));
        c.accept("src", &play("First", &["B"], 0));
        c.accept("src", &play("Second", &["C"], 100));

        let dates: Vec<_> = c.queued().map(|q| q.play.data.play_date).collect();
        let mut sorted = dates.clone();
        sorted.sort();
        assert_eq!(dates, sorted);
        assert_eq!(c.queued().next().unwrap().play.data.track, "First");
    }

    #[test]
    fn excluded_source_is_refused() {
        let mut c = core();
        c.opts.exclude_sources = vec!["noisy".to_string()];

        assert!(c.accept("noisy", &play("Song", &["A"], 0)).is_none());
        assert!(c.accept("quiet", &play("Song", &["A"], 0)).is_some());
        assert_eq!(c.queue_len(), 1);
    }

    #[test]
    fn empty_snapshot_means_no_existing_scrobble() {
        let mut c = core();
        assert!(!c.already_scrobbled(&play("Song", &["A"], 0)));
        assert!(c.closest_match().is_none());
    }

    #[test]
    fn timeframe_rejects_plays_before_window() {
        let mut c = core();
        c.recent_scrobbles = vec![play("Old", &["A"], 100), play("New", &["A"], 500)];

        assert!(!c.time_frame_valid(&play("Ancient", &["A"], 50)));
        assert!(c.time_frame_valid(&play("Fresh", &["A"], 400)));
    }

    #[test]
    fn own_ring_matches_exactly() {
        let mut c = core();
        c.scrobbled.push_back(ScrobbledPlay {
            play: play("Song", &["A"], 0),
            scrobble: play("Song", &["A"], 0),
        });

        // Same play, 5 seconds of timestamp skew
        assert!(c.already_scrobbled(&play("Song", &["A"], 5)));
        // Different track
        assert!(!c.already_scrobbled(&play("Other", &["A"], 5)));
    }

    #[test]
    fn upstream_snapshot_matches_fuzzily() {
        let mut c = core();
        c.recent_scrobbles = vec![play("Sonora", &["Nidia Gongora", "The Bongo Hop"], 0)];
        c.last_scrobble_check = Some(Utc.with_ymd_and_hms(2024, 5, 2, 0, 0, 0).unwrap());

        assert!(c.already_scrobbled(&play("Sonora", &["The Bongo Hop"], 30)));
        let (_, cmp) = c.closest_match().unwrap();
        assert!(cmp.score >= 0.8);
    }

    #[test]
    fn check_existing_disabled_short_circuits() {
        let mut c = core();
        c.opts.check_existing_scrobbles = false;
        c.recent_scrobbles = vec![play("Song", &["A"], 0)];

        assert!(!c.already_scrobbled(&play("Song", &["A"], 0)));
    }

    #[tokio::test]
    async fn successful_drain_lands_in_scrobbled_ring() {
        let mut c = core();
        let adapter = FakeAdapter::ok();
        c.accept("src", &play("One", &["A"], 0));
        c.accept("src", &play("Two", &["B"], 60));

        c.process_queue(&adapter).await.unwrap();
        assert_eq!(c.queue_len(), 0);
        assert_eq!(c.scrobbled().count(), 2);
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn duplicate_in_queue_is_not_rescrobbled() {
        let mut c = core();
        let adapter = FakeAdapter::ok();
        c.accept("src", &play("Song", &["A"], 0));
        // Identical listen arriving again from another source copy
        c.queued.push_back(QueuedScrobble::new("src", play("Song", &["A"], 2)));

        c.process_queue(&adapter).await.unwrap();
        // Second attempt matched the own-scrobbles ring
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 1);
        assert_eq!(c.scrobbled().count(), 1);
    }

    #[tokio::test]
    async fn retryable_failure_dead_letters_and_recovers() {
        let mut c = core();
        let adapter = FakeAdapter::failing(1, false);
        c.accept("src", &play("Song", &["A"], 0));

        c.process_queue(&adapter).await.unwrap();
        assert_eq!(c.dead_letters().len(), 1);
        assert_eq!(c.dead_letters()[0].retries, 0);
        assert_eq!(c.scrobbled().count(), 0);

        // Next heartbeat replays it successfully
        let cleared = c.process_dead_letters(&adapter).await;
        assert_eq!(cleared, 1);
        assert!(c.dead_letters().is_empty());
        assert_eq!(c.scrobbled().count(), 1);
    }

    #[tokio::test]
    async fn show_stopper_requeues_at_front_and_raises() {
        let mut c = core();
        let adapter = FakeAdapter::failing(1, true);
        c.accept("src", &play("Song", &["A"], 0));

        let err = c.process_queue(&adapter).await.unwrap_err();
        assert!(matches!(err, Error::Upstream(e) if e.show_stopper));
        assert_eq!(c.queue_len(), 1);
        assert!(c.dead_letters().is_empty());

        // Supervised retry succeeds
        c.process_queue(&adapter).await.unwrap();
        assert_eq!(c.scrobbled().count(), 1);
    }

    #[tokio::test]
    async fn auth_revocation_surfaces_instead_of_dead_lettering() {
        struct RevokedAdapter;

        #[async_trait]
        impl ScrobbleClient for RevokedAdapter {
            fn name(&self) -> &str {
                "revoked"
            }

            async fn scrobble(&self, _play: &Play) -> std::result::Result<Play, UpstreamError> {
                Err(UpstreamError::retryable("token revoked").with_status(401))
            }

            async fn recent_scrobbles(&self) -> std::result::Result<Vec<Play>, UpstreamError> {
                Ok(Vec::new())
            }
        }

        let mut c = core();
        c.accept("src", &play("Song", &["A"], 0));

        let err = c.process_queue(&RevokedAdapter).await.unwrap_err();
        assert!(matches!(err, Error::Upstream(e) if e.is_auth_revoked()));
        assert_eq!(c.queue_len(), 1);
        assert!(c.dead_letters().is_empty());
    }

    #[tokio::test]
    async fn dead_letter_stops_retrying_at_budget() {
        let mut c = core();
        c.opts.dead_letter_retries = 2;
        let adapter = FakeAdapter::failing(100, false);
        c.accept("src", &play("Song", &["A"], 0));

        c.process_queue(&adapter).await.unwrap();
        c.process_dead_letters(&adapter).await;
        c.process_dead_letters(&adapter).await;
        // Budget exhausted: entry stays visible, no further attempts
        c.process_dead_letters(&adapter).await;

        assert_eq!(c.dead_letters().len(), 1);
        assert_eq!(c.dead_letters()[0].retries, 2);
        assert!(c.dead_letters()[0].last_retry.is_some());
        // 1 original + 2 replays
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn manual_remove_clears_dead_letter() {
        let mut c = core();
        let adapter = FakeAdapter::failing(10, false);
        c.accept("src", &play("Song", &["A"], 0));
        c.process_queue(&adapter).await.unwrap();

        let id = c.dead_letters()[0].queued.id;
        assert!(c.remove_dead_letter(id));
        assert!(c.dead_letters().is_empty());
        assert!(!c.remove_dead_letter(id));
    }

    #[tokio::test]
    async fn scrobbled_ring_is_bounded() {
        let mut c = core();
        c.opts.scrobbled_capacity = 40;
        let adapter = FakeAdapter::ok();

        for i in 0..50 {
            c.accept("src", &play(&format!("Track {}", i), &["A"], i * 4000));
            c.process_queue(&adapter).await.unwrap();
        }
        assert_eq!(c.scrobbled().count(), 40);
    }
}
