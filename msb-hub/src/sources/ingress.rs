//! Webhook payload lowering
//!
//! Each push-style platform posts its own payload shape; these types
//! capture the fields the pipeline needs and lower them to either a
//! finished listen or a player progress report. A payload an adapter cannot
//! convert is a data-malformed error: the caller logs it, drops that event
//! only, and keeps serving.

use serde::Deserialize;

use msb_common::error::{Error, Result};
use msb_common::play::{Play, PlayData, PlayMeta};
use msb_common::time::SharedClock;

use super::players::{PlayerKey, PlayerStatus};

/// What a lowered webhook payload means to the source core.
#[derive(Debug, Clone)]
pub enum Ingress {
    /// A finished listen; discover it directly
    Completed(Play),
    /// A progress report; feed the player session
    Progress {
        key: PlayerKey,
        play: Play,
        progress_ms: u64,
        status: PlayerStatus,
    },
    /// The event carries nothing scrobbleable
    Ignored,
}

/// Webhook slug routing: a source configured without a slug only matches
/// slug-less requests; a named slug requires exact equality.
pub fn slug_matches(configured: Option<&str>, requested: Option<&str>) -> bool {
    match (configured, requested) {
        (None, None) => true,
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

// ========================================
// WebScrobbler
// ========================================

/// WebScrobbler browser extension payload.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebScrobblerPayload {
    pub event_name: String,
    pub data: WebScrobblerData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebScrobblerData {
    pub song: WebScrobblerSong,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebScrobblerSong {
    pub parsed: WebScrobblerFields,
    #[serde(default)]
    pub processed: Option<WebScrobblerFields>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebScrobblerFields {
    #[serde(default)]
    pub track: Option<String>,
    #[serde(default)]
    pub artist: Option<String>,
    #[serde(default)]
    pub album: Option<String>,
    #[serde(default)]
    pub album_artist: Option<String>,
    #[serde(default)]
    pub duration: Option<f64>,
}

impl WebScrobblerPayload {
    /// The extension does its own threshold tracking, so only its
    /// `scrobble` events become plays; now-playing chatter is ignored.
    pub fn lower(self, source: &str, clock: &SharedClock) -> Result<Ingress> {
        if self.event_name != "scrobble" {
            return Ok(Ingress::Ignored);
        }

        // Processed fields (the extension's cleanup) win over parsed ones.
        let parsed = self.data.song.parsed;
        let fields = match self.data.song.processed {
            Some(processed) => WebScrobblerFields {
                track: processed.track.or(parsed.track),
                artist: processed.artist.or(parsed.artist),
                album: processed.album.or(parsed.album),
                album_artist: processed.album_artist.or(parsed.album_artist),
                duration: processed.duration.or(parsed.duration),
            },
            None => parsed,
        };

        let track = fields
            .track
            .filter(|t| !t.is_empty())
            .ok_or_else(|| Error::InvalidInput("webscrobbler payload without track".into()))?;
        let artist = fields
            .artist
            .filter(|a| !a.is_empty())
            .ok_or_else(|| Error::InvalidInput("webscrobbler payload without artist".into()))?;

        let mut play = Play {
            data: PlayData {
                track,
                artists: vec![artist],
                album_artists: fields.album_artist.into_iter().collect(),
                album: fields.album.filter(|a| !a.is_empty()),
                duration: fields.duration,
                play_date: clock.now(),
                listened_for: None,
            },
            meta: PlayMeta {
                source: source.to_string(),
                new_from_source: true,
                ..Default::default()
            },
        };
        play.prune_empty();
        Ok(Ingress::Completed(play))
    }
}

// ========================================
// Jellyfin
// ========================================

/// Jellyfin webhook plugin payload ("Send All Properties" enabled).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct JellyfinPayload {
    pub notification_type: String,
    #[serde(default)]
    pub item_type: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub artists: Option<Vec<String>>,
    #[serde(default)]
    pub album_artist: Option<String>,
    #[serde(default)]
    pub album: Option<String>,
    /// Item length, 100 ns ticks
    #[serde(default)]
    pub run_time_ticks: Option<u64>,
    /// Playback position, 100 ns ticks
    #[serde(default)]
    pub playback_position_ticks: Option<u64>,
    #[serde(default)]
    pub is_paused: Option<bool>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub notification_username: Option<String>,
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub item_id: Option<String>,
}

impl JellyfinPayload {
    pub fn lower(self, source: &str, clock: &SharedClock) -> Result<Ingress> {
        match self.notification_type.as_str() {
            "PlaybackStart" | "PlaybackProgress" | "PlaybackStop" => {}
            _ => return Ok(Ingress::Ignored),
        }
        if self.item_type.as_deref() != Some("Audio") {
            return Ok(Ingress::Ignored);
        }

        let track = self
            .name
            .clone()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| Error::InvalidInput("jellyfin payload without item name".into()))?;
        let artists: Vec<String> = self
            .artists
            .clone()
            .unwrap_or_default()
            .into_iter()
            .filter(|a| !a.is_empty())
            .collect();
        let artists = if artists.is_empty() {
            self.album_artist
                .clone()
                .filter(|a| !a.is_empty())
                .map(|a| vec![a])
                .ok_or_else(|| Error::InvalidInput("jellyfin payload without artists".into()))?
        } else {
            artists
        };

        let status = if self.notification_type == "PlaybackStop" {
            PlayerStatus::Stopped
        } else if self.is_paused == Some(true) {
            PlayerStatus::Paused
        } else {
            PlayerStatus::Playing
        };

        let mut play = Play {
            data: PlayData {
                track,
                artists,
                album_artists: Vec::new(),
                album: self.album.filter(|a| !a.is_empty()),
                duration: self.run_time_ticks.map(|t| t as f64 / 10_000_000.0),
                play_date: clock.now(),
                listened_for: None,
            },
            meta: PlayMeta {
                source: source.to_string(),
                track_id: self.item_id,
                device_id: self.device_id.clone(),
                user: self.notification_username.clone().or(self.user_id.clone()),
                new_from_source: true,
                ..Default::default()
            },
        };
        play.prune_empty();

        Ok(Ingress::Progress {
            key: PlayerKey::from_play(&play),
            progress_ms: self.playback_position_ticks.unwrap_or(0) / 10_000,
            play,
            status,
        })
    }
}

// ========================================
// Plex
// ========================================

/// Plex webhook payload (the JSON part of the multipart form).
#[derive(Debug, Clone, Deserialize)]
pub struct PlexPayload {
    pub event: String,
    #[serde(rename = "Account", default)]
    pub account: Option<PlexAccount>,
    #[serde(rename = "Player", default)]
    pub player: Option<PlexPlayer>,
    #[serde(rename = "Metadata", default)]
    pub metadata: Option<PlexMetadata>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlexAccount {
    #[serde(default)]
    pub title: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlexPlayer {
    #[serde(default)]
    pub uuid: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlexMetadata {
    #[serde(rename = "type", default)]
    pub media_type: Option<String>,
    /// Track title
    #[serde(default)]
    pub title: Option<String>,
    /// Artist
    #[serde(default)]
    pub grandparent_title: Option<String>,
    /// Album
    #[serde(default)]
    pub parent_title: Option<String>,
    /// Milliseconds
    #[serde(default)]
    pub duration: Option<u64>,
}

impl PlexPayload {
    /// Plex fires `media.scrobble` itself once a track passes its internal
    /// threshold, so that event is a completed listen; the rest carry no
    /// position and are ignored.
    pub fn lower(self, source: &str, clock: &SharedClock) -> Result<Ingress> {
        if self.event != "media.scrobble" {
            return Ok(Ingress::Ignored);
        }
        let metadata = self
            .metadata
            .ok_or_else(|| Error::InvalidInput("plex scrobble without Metadata".into()))?;
        if metadata.media_type.as_deref() != Some("track") {
            return Ok(Ingress::Ignored);
        }

        let track = metadata
            .title
            .filter(|t| !t.is_empty())
            .ok_or_else(|| Error::InvalidInput("plex scrobble without track title".into()))?;
        let artist = metadata
            .grandparent_title
            .filter(|a| !a.is_empty())
            .ok_or_else(|| Error::InvalidInput("plex scrobble without artist".into()))?;

        let mut play = Play {
            data: PlayData {
                track,
                artists: vec![artist],
                album_artists: Vec::new(),
                album: metadata.parent_title.filter(|a| !a.is_empty()),
                duration: metadata.duration.map(|ms| ms as f64 / 1000.0),
                play_date: clock.now(),
                listened_for: None,
            },
            meta: PlayMeta {
                source: source.to_string(),
                device_id: self.player.and_then(|p| p.uuid),
                user: self.account.and_then(|a| a.title),
                new_from_source: true,
                ..Default::default()
            },
        };
        play.prune_empty();
        Ok(Ingress::Completed(play))
    }
}

// ========================================
// Tautulli
// ========================================

/// Tautulli notification agent payload (flat JSON).
#[derive(Debug, Clone, Deserialize)]
pub struct TautulliPayload {
    pub action: String,
    #[serde(default)]
    pub track_name: Option<String>,
    #[serde(default)]
    pub artist_name: Option<String>,
    #[serde(default)]
    pub album_name: Option<String>,
    #[serde(default)]
    pub media_type: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    /// Seconds
    #[serde(default)]
    pub duration: Option<f64>,
}

impl TautulliPayload {
    pub fn lower(self, source: &str, clock: &SharedClock) -> Result<Ingress> {
        if self.action != "watched" {
            return Ok(Ingress::Ignored);
        }
        if let Some(media_type) = &self.media_type {
            if media_type != "track" {
                return Ok(Ingress::Ignored);
            }
        }

        let track = self
            .track_name
            .filter(|t| !t.is_empty())
            .ok_or_else(|| Error::InvalidInput("tautulli payload without track_name".into()))?;
        let artist = self
            .artist_name
            .filter(|a| !a.is_empty())
            .ok_or_else(|| Error::InvalidInput("tautulli payload without artist_name".into()))?;

        let mut play = Play {
            data: PlayData {
                track,
                artists: vec![artist],
                album_artists: Vec::new(),
                album: self.album_name.filter(|a| !a.is_empty()),
                duration: self.duration,
                play_date: clock.now(),
                listened_for: None,
            },
            meta: PlayMeta {
                source: source.to_string(),
                user: self.username,
                new_from_source: true,
                ..Default::default()
            },
        };
        play.prune_empty();
        Ok(Ingress::Completed(play))
    }
}
