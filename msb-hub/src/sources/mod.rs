//! Source core: discovery dedup, the poll loop, and ingress acceptance
//!
//! A source owns a ring buffer of the plays it has discovered. Every
//! candidate play, whether fetched by the poll loop or pushed through a
//! webhook, runs the source-side `preCompare` transform and then the fuzzy
//! comparator against the ring; only genuinely new plays enter the ring and
//! fire `NewPlay` on the bus.

pub mod history;
pub mod ingress;
pub mod players;

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use msb_common::backoff::Backoff;
use msb_common::compare::{compare_plays, CompareOptions};
use msb_common::config::ComponentOptions;
use msb_common::error::Result;
use msb_common::events::{ComponentKind, ComponentStatus, EventBus, MsbEvent};
use msb_common::play::Play;
use msb_common::time::SharedClock;
use msb_common::transform::{PlayTransform, Stage};

use crate::lifecycle::StatusCell;

/// What a source type is able to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceCapabilities {
    pub requires_auth: bool,
    pub can_poll: bool,
    pub can_backlog: bool,
}

/// Known source types and their capability records.
pub static SOURCE_REGISTRY: &[(&str, SourceCapabilities)] = &[
    (
        "webscrobbler",
        SourceCapabilities {
            requires_auth: false,
            can_poll: false,
            can_backlog: false,
        },
    ),
    (
        "jellyfin",
        SourceCapabilities {
            requires_auth: false,
            can_poll: false,
            can_backlog: false,
        },
    ),
    (
        "plex",
        SourceCapabilities {
            requires_auth: false,
            can_poll: false,
            can_backlog: false,
        },
    ),
    (
        "tautulli",
        SourceCapabilities {
            requires_auth: false,
            can_poll: false,
            can_backlog: false,
        },
    ),
    (
        "listenbrainz",
        SourceCapabilities {
            requires_auth: true,
            can_poll: true,
            can_backlog: true,
        },
    ),
];

/// Capability lookup for a configured `type` string.
pub fn capabilities_for(kind: &str) -> Option<SourceCapabilities> {
    SOURCE_REGISTRY
        .iter()
        .find(|(name, _)| *name == kind)
        .map(|(_, caps)| *caps)
}

/// Resolved source tunables.
#[derive(Debug, Clone)]
pub struct SourceOptions {
    pub ring_capacity: usize,
    pub poll_interval: Duration,
    pub max_poll_retries: u32,
    pub history_stable_ticks: u32,
    pub compare: CompareOptions,
}

impl Default for SourceOptions {
    fn default() -> Self {
        Self {
            ring_capacity: 150,
            poll_interval: Duration::from_secs(30),
            max_poll_retries: 5,
            history_stable_ticks: 2,
            compare: CompareOptions::default(),
        }
    }
}

impl SourceOptions {
    pub fn from_config(opts: &ComponentOptions) -> Self {
        let defaults = Self::default();
        Self {
            ring_capacity: opts.ring_capacity.unwrap_or(defaults.ring_capacity).clamp(50, 200),
            poll_interval: opts
                .poll_interval_s
                .map(Duration::from_secs)
                .unwrap_or(defaults.poll_interval),
            max_poll_retries: opts.max_poll_retries.unwrap_or(defaults.max_poll_retries),
            history_stable_ticks: opts
                .history_stable_ticks
                .unwrap_or(defaults.history_stable_ticks),
            compare: defaults.compare,
        }
    }
}

/// Fetch-style adapter driven by the poll loop.
#[async_trait]
pub trait PollAdapter: Send {
    /// Most recent plays. Ordered feeds return them newest last; history
    /// lists (see [`PollAdapter::history_list`]) newest first.
    async fn fetch(&mut self) -> Result<Vec<Play>>;

    /// Historical plays used to seed the ring at startup.
    async fn backlog(&mut self) -> Result<Vec<Play>> {
        Ok(Vec::new())
    }

    /// Whether `fetch` scrapes an unordered, possibly reshuffled history
    /// list (newest entry first). Such adapters are gated through the
    /// source-of-truth reset heuristic: nothing is emitted until the list
    /// diff has been consistent for the configured number of ticks.
    fn history_list(&self) -> bool {
        false
    }
}

/// Per-source state: the discovery ring and its counters.
pub struct SourceCore {
    name: String,
    transform: PlayTransform,
    ring: VecDeque<Play>,
    opts: SourceOptions,
    tracks_discovered: u64,
    polling: bool,
    bus: EventBus,
    clock: SharedClock,
    pub status: StatusCell,
}

impl SourceCore {
    pub fn new(
        name: impl Into<String>,
        transform: PlayTransform,
        opts: SourceOptions,
        bus: EventBus,
        clock: SharedClock,
    ) -> Self {
        let name = name.into();
        let status = StatusCell::new(&name, ComponentKind::Source, bus.clone(), clock.clone());
        Self {
            name,
            transform,
            ring: VecDeque::with_capacity(opts.ring_capacity),
            opts,
            tracks_discovered: 0,
            polling: false,
            bus,
            clock,
            status,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of plays this source has discovered since startup.
    pub fn discovered(&self) -> u64 {
        self.tracks_discovered
    }

    /// Snapshot of the discovery ring, oldest first.
    pub fn recent(&self) -> Vec<Play> {
        self.ring.iter().cloned().collect()
    }

    /// Run a candidate play through `preCompare` and discovery dedup.
    ///
    /// Returns the transformed play when it was new (and a `NewPlay` fired),
    /// `None` when it was a duplicate or the transform dropped it.
    pub fn discover(&mut self, candidate: Play) -> Option<Play> {
        let candidate = self.accept(candidate)?;

        self.push_ring(candidate.clone());
        self.tracks_discovered += 1;
        info!(
            source = %self.name,
            play = %candidate.describe(),
            discovered = self.tracks_discovered,
            "discovered play"
        );
        self.bus.emit_lossy(MsbEvent::NewPlay {
            name: self.name.clone(),
            play: candidate.clone(),
            timestamp: self.clock.now(),
        });
        Some(candidate)
    }

    /// Seed the ring with historical plays without firing `NewPlay`.
    pub fn seed_backlog(&mut self, plays: Vec<Play>) -> usize {
        let mut seeded = 0;
        for play in plays {
            if let Some(play) = self.accept(play) {
                self.push_ring(play);
                seeded += 1;
            }
        }
        if seeded > 0 {
            info!(source = %self.name, seeded, "seeded ring from backlog");
        }
        seeded
    }

    /// `preCompare` + dedup, shared by discovery and backlog seeding.
    fn accept(&mut self, candidate: Play) -> Option<Play> {
        let candidate = self
            .transform
            .apply(Stage::PreCompare, &candidate, &self.name)?;
        if candidate.data.artists.is_empty() {
            warn!(
                source = %self.name,
                play = %candidate.describe(),
                "dropping play with no artists"
            );
            return None;
        }

        for ringed in &self.ring {
            let cmp = compare_plays(&candidate, ringed, &self.opts.compare);
            if cmp.is_duplicate() {
                debug!(
                    source = %self.name,
                    play = %candidate.describe(),
                    score = cmp.score,
                    "duplicate of ringed play, not new"
                );
                return None;
            }
        }
        Some(candidate)
    }

    fn push_ring(&mut self, play: Play) {
        if self.ring.len() >= self.opts.ring_capacity {
            self.ring.pop_front();
        }
        self.ring.push_back(play);
    }

    /// Mark the poll loop as started. Re-entrancy is rejected.
    fn begin_polling(&mut self) -> bool {
        if self.polling {
            return false;
        }
        if !matches!(
            self.status.get(),
            ComponentStatus::Initialized | ComponentStatus::Idle
        ) {
            return false;
        }
        self.polling = true;
        self.status.set(ComponentStatus::Polling);
        true
    }

    fn end_polling(&mut self, errored: bool) {
        self.polling = false;
        self.status.set(if errored {
            ComponentStatus::Errored
        } else {
            ComponentStatus::Idle
        });
    }
}

/// Drive a poll-capable adapter until cancelled.
///
/// Sleeps the source's interval between fetches; consecutive failures back
/// off exponentially and a success resets the schedule. The loop exits when
/// the retry budget is exhausted or the token fires.
pub async fn run_poll_loop<A: PollAdapter>(
    core: Arc<Mutex<SourceCore>>,
    mut adapter: A,
    cancel: CancellationToken,
) {
    let (name, opts) = {
        let mut core = core.lock().await;
        if !core.begin_polling() {
            warn!(source = %core.name, "poll loop refused: already polling or not initialized");
            return;
        }
        (core.name.clone(), core.opts.clone())
    };

    let mut backoff = Backoff::new(opts.poll_interval, 2.0, Duration::from_secs(600));
    let mut history_sync = adapter
        .history_list()
        .then(|| history::HistorySync::new(opts.history_stable_ticks));
    let mut errored = false;

    loop {
        match adapter.fetch().await {
            Ok(plays) => {
                backoff.reset();
                let mut core = core.lock().await;
                match history_sync.as_mut() {
                    Some(sync) => {
                        // Prepends come back newest first; discover oldest
                        // first so NewPlay stays non-decreasing in play
                        // date.
                        let mut fresh = sync.observe(&name, &plays);
                        fresh.reverse();
                        for play in fresh {
                            core.discover(play);
                        }
                    }
                    None => {
                        for play in plays {
                            core.discover(play);
                        }
                    }
                }
            }
            Err(e) if e.is_transient() => {
                if backoff.attempt() >= opts.max_poll_retries {
                    warn!(source = %name, error = %e, "poll retries exhausted, stopping");
                    errored = true;
                    break;
                }
                let delay = backoff.next_delay();
                warn!(
                    source = %name,
                    error = %e,
                    attempt = backoff.attempt(),
                    delay_s = delay.as_secs(),
                    "poll failed, backing off"
                );
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => continue,
                }
            }
            Err(e) => {
                warn!(source = %name, error = %e, "poll failed fatally, stopping");
                errored = true;
                break;
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(opts.poll_interval) => {}
        }
    }

    core.lock().await.end_polling(errored);
}
