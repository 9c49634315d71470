//! Player sessions for push/real-time sources
//!
//! Webhook sources (Jellyfin, Plex, cast receivers) report progress, not
//! finished listens. A Player tracks one `(device, user)` session and emits
//! a discovered play exactly once per listen, when progress crosses the
//! scrobble threshold. Players that stop reporting are evicted after a TTL.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tracing::debug;

use msb_common::play::Play;
use msb_common::time::SharedClock;

/// Listen counts as scrobbleable past half the track...
const SCROBBLE_PERCENT: f64 = 0.5;
/// ...or past this many seconds of listening, whichever comes first.
const SCROBBLE_SECONDS: f64 = 240.0;

/// Stale players are evicted after this many seconds without an update.
pub const PLAYER_TTL_SECONDS: i64 = 300;

/// One `(device, user)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PlayerKey {
    pub device_id: String,
    pub user: String,
}

impl PlayerKey {
    pub fn from_play(play: &Play) -> Self {
        Self {
            device_id: play.meta.device_id.clone().unwrap_or_default(),
            user: play.meta.user.clone().unwrap_or_default(),
        }
    }
}

/// Reported playback state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerStatus {
    Playing,
    Paused,
    Stopped,
}

/// One tracked playback session.
#[derive(Debug, Clone)]
struct Player {
    play: Play,
    progress_ms: u64,
    status: PlayerStatus,
    last_seen: DateTime<Utc>,
    /// The current listen already produced a discovered play
    reported: bool,
}

impl Player {
    fn threshold_crossed(&self) -> bool {
        let listened_s = self.progress_ms as f64 / 1000.0;
        match self.play.data.duration {
            Some(d) if d > 0.0 => listened_s >= d * SCROBBLE_PERCENT || listened_s >= SCROBBLE_SECONDS,
            _ => listened_s >= SCROBBLE_SECONDS,
        }
    }
}

/// Player sessions for one source, keyed by `(device, user)`.
pub struct PlayerRegistry {
    players: HashMap<PlayerKey, Player>,
    clock: SharedClock,
}

impl PlayerRegistry {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            players: HashMap::new(),
            clock,
        }
    }

    pub fn len(&self) -> usize {
        self.players.len()
    }

    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }

    /// Feed one progress report into the session.
    ///
    /// Returns a play to discover when this report crossed the scrobble
    /// threshold for the first time in the current listen. A new track on
    /// the same player starts a fresh listen.
    pub fn update(
        &mut self,
        key: PlayerKey,
        play: Play,
        progress_ms: u64,
        status: PlayerStatus,
    ) -> Option<Play> {
        let now = self.clock.now();

        let player = self
            .players
            .entry(key.clone())
            .and_modify(|p| {
                let same_track = match (&p.play.meta.track_id, &play.meta.track_id) {
                    (Some(a), Some(b)) => a == b,
                    _ => p.play.data.track == play.data.track
                        && p.play.data.artists == play.data.artists,
                };
                if !same_track {
                    debug!(
                        device = %key.device_id,
                        user = %key.user,
                        from = %p.play.describe(),
                        to = %play.describe(),
                        "player switched tracks"
                    );
                    p.play = play.clone();
                    p.reported = false;
                }
                p.progress_ms = progress_ms;
                p.status = status;
                p.last_seen = now;
            })
            .or_insert_with(|| Player {
                play: play.clone(),
                progress_ms,
                status,
                last_seen: now,
                reported: false,
            });

        if status == PlayerStatus::Stopped {
            return None;
        }

        if !player.reported && player.threshold_crossed() {
            player.reported = true;
            let mut discovered = player.play.clone();
            discovered.data.play_date = now;
            discovered.data.listened_for = Some(progress_ms as f64 / 1000.0);
            discovered.meta.new_from_source = true;
            return Some(discovered);
        }
        None
    }

    /// Drop sessions that have not reported within the TTL.
    pub fn evict_stale(&mut self) -> usize {
        let now = self.clock.now();
        let before = self.players.len();
        self.players.retain(|key, p| {
            let fresh = (now - p.last_seen).num_seconds() < PLAYER_TTL_SECONDS;
            if !fresh {
                debug!(device = %key.device_id, user = %key.user, "evicting stale player");
            }
            fresh
        });
        before - self.players.len()
    }
}
