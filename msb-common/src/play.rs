//! The canonical listen record and its queue-side wrappers
//!
//! A [`Play`] is created by a source adapter, survives in the source ring
//! until evicted, and is copied (never shared) into each client queue.
//! Once enqueued toward a client it is treated as immutable: client-side
//! transforms produce new values.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What was listened to, and when.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayData {
    /// Track title
    pub track: String,

    /// Ordered artists; the first is the primary artist
    #[serde(default)]
    pub artists: Vec<String>,

    /// Album artists, only retained when not identical to `artists`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub album_artists: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub album: Option<String>,

    /// Track duration in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,

    /// The instant the listen was complete or observed
    pub play_date: DateTime<Utc>,

    /// Seconds actually listened; at most `duration`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listened_for: Option<f64>,
}

/// Where a play came from.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayMeta {
    /// Symbolic name of the originating adapter
    #[serde(default)]
    pub source: String,

    /// Platform-specific opaque track id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    /// Web URL for the track, when the platform exposes one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// True when the source observed this play in real time rather than
    /// finding it in a backlog
    #[serde(default)]
    pub new_from_source: bool,
}

/// A single listen event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Play {
    pub data: PlayData,
    #[serde(default)]
    pub meta: PlayMeta,
}

impl Play {
    /// The primary artist, when the play has any artist at all.
    pub fn primary_artist(&self) -> Option<&str> {
        self.data.artists.first().map(|s| s.as_str())
    }

    /// Remove empty-string fields (treated as unset) and album artists that
    /// merely repeat the artist list. Run after transforms.
    pub fn prune_empty(&mut self) {
        if let Some(album) = &self.data.album {
            if album.is_empty() {
                self.data.album = None;
            }
        }
        self.data.artists.retain(|a| !a.is_empty());
        self.data.album_artists.retain(|a| !a.is_empty());
        if self.data.album_artists == self.data.artists {
            self.data.album_artists.clear();
        }
        if let Some(track_id) = &self.meta.track_id {
            if track_id.is_empty() {
                self.meta.track_id = None;
            }
        }
    }

    /// Compact one-line rendering for logs: `artist - track (album)`.
    pub fn describe(&self) -> String {
        let artist = self.primary_artist().unwrap_or("?");
        match &self.data.album {
            Some(album) => format!("{} - {} ({})", artist, self.data.track, album),
            None => format!("{} - {}", artist, self.data.track),
        }
    }
}

/// A play owned by exactly one client worker, from enqueue to either a
/// successful scrobble or a transfer to the dead-letter queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedScrobble {
    pub id: Uuid,
    /// Name of the source that discovered the play
    pub source: String,
    pub play: Play,
}

impl QueuedScrobble {
    pub fn new(source: impl Into<String>, play: Play) -> Self {
        Self {
            id: Uuid::new_v4(),
            source: source.into(),
            play,
        }
    }
}

/// A queued scrobble that failed non-fatally, pending retry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterScrobble {
    #[serde(flatten)]
    pub queued: QueuedScrobble,
    pub retries: u32,
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_retry: Option<DateTime<Utc>>,
}

impl DeadLetterScrobble {
    pub fn new(queued: QueuedScrobble, error: impl Into<String>) -> Self {
        Self {
            queued,
            retries: 0,
            error: error.into(),
            last_retry: None,
        }
    }
}

/// A play this client scrobbled, paired with what the upstream returned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrobbledPlay {
    pub play: Play,
    pub scrobble: Play,
}
