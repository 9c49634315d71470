//! ListenBrainz client adapter
//!
//! Speaks the submit-listens protocol: one listen per scrobble call, the
//! user's recent listens for the dedup snapshot, and token validation for
//! the auth stage.

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;

use msb_common::error::{Error, Result, UpstreamError};
use msb_common::events::ComponentKind;
use msb_common::play::{Play, PlayData, PlayMeta};

use crate::lifecycle::{Component, StageOutcome};

const DEFAULT_API_URL: &str = "https://api.listenbrainz.org";
const USER_AGENT: &str = concat!("msb/", env!("CARGO_PKG_VERSION"));
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Minimum spacing between API calls
const RATE_LIMIT_MS: u64 = 250;
/// How many recent listens to pull into the dedup snapshot
const RECENT_LISTEN_COUNT: u32 = 100;

/// Adapter connection settings, from the config entry's `data` object.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenBrainzData {
    pub token: String,
    #[serde(default)]
    pub url: Option<String>,
    /// Username for the listens endpoint; discovered from the token when
    /// omitted
    #[serde(default)]
    pub username: Option<String>,
}

/// Rate limiter enforcing a minimum interval between requests.
struct RateLimiter {
    last_request: Mutex<Option<Instant>>,
    min_interval: Duration,
}

impl RateLimiter {
    fn new(min_interval_ms: u64) -> Self {
        Self {
            last_request: Mutex::new(None),
            min_interval: Duration::from_millis(min_interval_ms),
        }
    }

    async fn wait(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(last_time) = *last {
            let elapsed = last_time.elapsed();
            if elapsed < self.min_interval {
                tokio::time::sleep(self.min_interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}

// ========================================
// Wire types
// ========================================

#[derive(Debug, Serialize)]
struct SubmitListens<'a> {
    listen_type: &'static str,
    payload: Vec<ListenPayload<'a>>,
}

#[derive(Debug, Serialize)]
struct ListenPayload<'a> {
    listened_at: i64,
    track_metadata: TrackMetadataOut<'a>,
}

#[derive(Debug, Serialize)]
struct TrackMetadataOut<'a> {
    artist_name: &'a str,
    track_name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    release_name: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    additional_info: Option<AdditionalInfo>,
}

#[derive(Debug, Serialize)]
struct AdditionalInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    duration_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ListensResponse {
    payload: ListensPayload,
}

#[derive(Debug, Deserialize)]
struct ListensPayload {
    #[serde(default)]
    listens: Vec<Listen>,
}

#[derive(Debug, Deserialize)]
struct Listen {
    listened_at: i64,
    track_metadata: TrackMetadataIn,
}

#[derive(Debug, Deserialize)]
struct TrackMetadataIn {
    artist_name: String,
    track_name: String,
    #[serde(default)]
    release_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ValidateTokenResponse {
    valid: bool,
    #[serde(default)]
    user_name: Option<String>,
}

// ========================================
// Adapter
// ========================================

/// ListenBrainz API adapter for one configured client.
pub struct ListenBrainzAdapter {
    name: String,
    http: reqwest::Client,
    api_url: String,
    token: String,
    /// Interior-mutable: the auth stage fills this in from the token when
    /// the config leaves it out.
    username: std::sync::RwLock<Option<String>>,
    limiter: RateLimiter,
}

impl ListenBrainzAdapter {
    pub fn from_config(name: impl Into<String>, data: &serde_json::Value) -> Result<Self> {
        let data: ListenBrainzData = serde_json::from_value(data.clone())
            .map_err(|e| Error::Config(format!("listenbrainz data: {}", e)))?;

        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::Internal(format!("http client: {}", e)))?;

        Ok(Self {
            name: name.into(),
            http,
            api_url: data
                .url
                .unwrap_or_else(|| DEFAULT_API_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            token: data.token,
            username: std::sync::RwLock::new(data.username),
            limiter: RateLimiter::new(RATE_LIMIT_MS),
        })
    }

    fn auth_header(&self) -> String {
        format!("Token {}", self.token)
    }

    /// Map an HTTP status to the upstream error taxonomy.
    fn error_for_status(status: reqwest::StatusCode, body: String) -> UpstreamError {
        let code = status.as_u16();
        let message = format!("listenbrainz returned {}: {}", code, body);
        match code {
            // Payload the service will always refuse
            400 => UpstreamError::show_stopper(message).with_status(code),
            // Credential problems surface through the status field
            401 | 403 => UpstreamError::retryable(message).with_status(code),
            // Rate limits and server trouble are retryable
            _ => UpstreamError::retryable(message).with_status(code),
        }
    }

    fn network_error(e: reqwest::Error) -> UpstreamError {
        // Timeouts are bounded per call and treated as non-show-stoppers
        UpstreamError::retryable(format!("listenbrainz request failed: {}", e))
    }

    async fn validate_token(&self) -> Result<ValidateTokenResponse> {
        self.limiter.wait().await;
        let response = self
            .http
            .get(format!("{}/1/validate-token", self.api_url))
            .header("Authorization", self.auth_header())
            .send()
            .await
            .map_err(|e| Error::Network(format!("validate-token: {}", e)))?;

        if !response.status().is_success() {
            return Err(Error::Auth(format!(
                "token validation returned {}",
                response.status()
            )));
        }
        response
            .json::<ValidateTokenResponse>()
            .await
            .map_err(|e| Error::Network(format!("validate-token body: {}", e)))
    }
}

fn listen_to_play(listen: Listen, source: &str) -> Play {
    let mut play = Play {
        data: PlayData {
            track: listen.track_metadata.track_name,
            artists: vec![listen.track_metadata.artist_name],
            album_artists: Vec::new(),
            album: listen.track_metadata.release_name,
            duration: None,
            play_date: Utc
                .timestamp_opt(listen.listened_at, 0)
                .single()
                .unwrap_or_else(Utc::now),
            listened_for: None,
        },
        meta: PlayMeta {
            source: source.to_string(),
            ..Default::default()
        },
    };
    play.prune_empty();
    play
}

#[async_trait]
impl super::ScrobbleClient for ListenBrainzAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn scrobble(&self, play: &Play) -> std::result::Result<Play, UpstreamError> {
        let artist_name = play
            .primary_artist()
            .ok_or_else(|| UpstreamError::show_stopper("play without artists"))?;

        let body = SubmitListens {
            listen_type: "single",
            payload: vec![ListenPayload {
                listened_at: play.data.play_date.timestamp(),
                track_metadata: TrackMetadataOut {
                    artist_name,
                    track_name: &play.data.track,
                    release_name: play.data.album.as_deref(),
                    additional_info: play.data.duration.map(|d| AdditionalInfo {
                        duration_ms: Some((d * 1000.0) as u64),
                    }),
                },
            }],
        };

        self.limiter.wait().await;
        let response = self
            .http
            .post(format!("{}/1/submit-listens", self.api_url))
            .header("Authorization", self.auth_header())
            .json(&body)
            .send()
            .await
            .map_err(Self::network_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Self::error_for_status(status, body));
        }

        debug!(client = %self.name, play = %play.describe(), "listen submitted");
        // The submit endpoint echoes nothing useful; the accepted listen is
        // the scrobble record.
        let mut scrobble = play.clone();
        scrobble.meta.source = self.name.clone();
        Ok(scrobble)
    }

    async fn recent_scrobbles(&self) -> std::result::Result<Vec<Play>, UpstreamError> {
        let username = self.username.read().unwrap().clone();
        let Some(username) = username else {
            // No username resolved yet; an empty snapshot disables upstream
            // dedup but is not an error.
            return Ok(Vec::new());
        };

        self.limiter.wait().await;
        let response = self
            .http
            .get(format!("{}/1/user/{}/listens", self.api_url, username))
            .query(&[("count", RECENT_LISTEN_COUNT)])
            .header("Authorization", self.auth_header())
            .send()
            .await
            .map_err(Self::network_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Self::error_for_status(status, body));
        }

        let listens = response
            .json::<ListensResponse>()
            .await
            .map_err(Self::network_error)?
            .payload
            .listens;

        Ok(listens
            .into_iter()
            .map(|l| listen_to_play(l, &self.name))
            .collect())
    }
}

#[async_trait]
impl Component for ListenBrainzAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ComponentKind {
        ComponentKind::Client
    }

    fn requires_auth(&self) -> bool {
        true
    }

    async fn build_init_data(&self) -> Result<StageOutcome> {
        if self.token.is_empty() {
            return Err(Error::Config("listenbrainz token is required".into()));
        }
        if !self.api_url.starts_with("http") {
            return Err(Error::Config(format!(
                "listenbrainz url {:?} is not an http(s) URL",
                self.api_url
            )));
        }
        Ok(StageOutcome::Info(format!("api {}", self.api_url)))
    }

    async fn check_connection(&self) -> Result<StageOutcome> {
        self.limiter.wait().await;
        self.http
            .get(format!("{}/1/validate-token", self.api_url))
            .header("Authorization", self.auth_header())
            .send()
            .await
            .map_err(|e| Error::Network(format!("listenbrainz unreachable: {}", e)))?;
        Ok(StageOutcome::Ok)
    }

    async fn authenticate(&self) -> Result<StageOutcome> {
        let validation = self.validate_token().await?;
        if !validation.valid {
            return Err(Error::Auth("listenbrainz token rejected".into()));
        }
        {
            let mut username = self.username.write().unwrap();
            if username.is_none() {
                *username = validation.user_name.clone();
            }
        }
        Ok(match validation.user_name {
            Some(user) => StageOutcome::Info(format!("token valid for {}", user)),
            None => StageOutcome::Ok,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_parses_with_defaults() {
        let data = serde_json::json!({"token": "abc"});
        let adapter = ListenBrainzAdapter::from_config("lb", &data).unwrap();
        assert_eq!(adapter.api_url, DEFAULT_API_URL);
        assert!(adapter.username.read().unwrap().is_none());

        let data = serde_json::json!({
            "token": "abc",
            "url": "https://lb.example.org/",
            "username": "sam"
        });
        let adapter = ListenBrainzAdapter::from_config("lb", &data).unwrap();
        assert_eq!(adapter.api_url, "https://lb.example.org");
        assert_eq!(adapter.username.read().unwrap().as_deref(), Some("sam"));
    }

    #[test]
    fn missing_token_is_a_config_error() {
        let data = serde_json::json!({"url": "https://lb.example.org"});
        assert!(ListenBrainzAdapter::from_config("lb", &data).is_err());
    }

    #[test]
    fn status_mapping_follows_the_taxonomy() {
        let e = ListenBrainzAdapter::error_for_status(
            reqwest::StatusCode::BAD_REQUEST,
            String::new(),
        );
        assert!(e.show_stopper);

        let e = ListenBrainzAdapter::error_for_status(
            reqwest::StatusCode::TOO_MANY_REQUESTS,
            String::new(),
        );
        assert!(!e.show_stopper);
        assert!(!e.is_auth_revoked());

        let e = ListenBrainzAdapter::error_for_status(
            reqwest::StatusCode::UNAUTHORIZED,
            String::new(),
        );
        assert!(e.is_auth_revoked());

        let e = ListenBrainzAdapter::error_for_status(
            reqwest::StatusCode::BAD_GATEWAY,
            String::new(),
        );
        assert!(!e.show_stopper);
    }

    #[test]
    fn listens_response_lowers_to_plays() {
        let raw = r#"{
            "payload": {
                "listens": [
                    {
                        "listened_at": 1714565000,
                        "track_metadata": {
                            "artist_name": "Artist",
                            "track_name": "Song",
                            "release_name": "LP"
                        }
                    }
                ]
            }
        }"#;
        let parsed: ListensResponse = serde_json::from_str(raw).unwrap();
        let play = listen_to_play(parsed.payload.listens.into_iter().next().unwrap(), "lb");

        assert_eq!(play.data.track, "Song");
        assert_eq!(play.data.artists, vec!["Artist".to_string()]);
        assert_eq!(play.data.album.as_deref(), Some("LP"));
        assert_eq!(play.data.play_date.timestamp(), 1714565000);
    }

    #[test]
    fn submit_body_shape() {
        let body = SubmitListens {
            listen_type: "single",
            payload: vec![ListenPayload {
                listened_at: 1714565000,
                track_metadata: TrackMetadataOut {
                    artist_name: "Artist",
                    track_name: "Song",
                    release_name: None,
                    additional_info: Some(AdditionalInfo {
                        duration_ms: Some(215000),
                    }),
                },
            }],
        };

        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["listen_type"], "single");
        assert_eq!(json["payload"][0]["listened_at"], 1714565000);
        assert_eq!(json["payload"][0]["track_metadata"]["track_name"], "Song");
        assert!(json["payload"][0]["track_metadata"]
            .get("release_name")
            .is_none());
        assert_eq!(
            json["payload"][0]["track_metadata"]["additional_info"]["duration_ms"],
            215000
        );
    }
}
