//! Configuration loading and config-dir resolution
//!
//! One JSON file (`config.json`) describes sources, clients and their
//! defaults. The transform DSL inside `playTransform` is the public
//! contract; see [`crate::transform::dsl`].

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::transform::dsl::PlayTransformConfig;

pub const DEFAULT_PORT: u16 = 9078;

/// Top-level service configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AppConfig {
    /// HTTP listen port; the `PORT` environment variable wins over this.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Options applied to every source that does not override them
    pub source_defaults: ComponentOptions,

    /// Options applied to every client that does not override them
    pub client_defaults: ComponentOptions,

    pub sources: Vec<SourceEntry>,
    pub clients: Vec<ClientEntry>,
}

/// One configured source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceEntry {
    pub name: String,

    /// Adapter type ("webscrobbler", "jellyfin", "plex", "tautulli", ...)
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(default = "default_true")]
    pub enable: bool,

    /// Webhook slug; a source without one only matches slug-less requests
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slug: Option<String>,

    /// Adapter-specific connection data
    #[serde(default)]
    pub data: serde_json::Value,

    #[serde(default)]
    pub options: ComponentOptions,
}

/// One configured client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientEntry {
    pub name: String,

    /// Adapter type ("listenbrainz", ...)
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(default = "default_true")]
    pub enable: bool,

    /// Adapter-specific connection data
    #[serde(default)]
    pub data: serde_json::Value,

    #[serde(default)]
    pub options: ComponentOptions,
}

fn default_true() -> bool {
    true
}

/// Per-component tunables. Every field is optional so that defaults and
/// entries can be merged field-wise; resolution to concrete values happens
/// where the component is built.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ComponentOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub play_transform: Option<PlayTransformConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub check_existing_scrobbles: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_poll_retries: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub scrobble_delay_ms: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub scrobble_sleep_ms: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub dead_letter_retries: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub poll_interval_s: Option<u64>,

    /// Capacity of a source's discovered-plays ring
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ring_capacity: Option<usize>,

    /// Consecutive consistent history diffs required before a
    /// source-of-truth source emits newly prepended plays
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history_stable_ticks: Option<u32>,

    /// Sources this client refuses plays from
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exclude_sources: Option<Vec<String>>,
}

impl ComponentOptions {
    /// Entry options layered over defaults; the entry wins field-wise.
    pub fn merged_over(&self, defaults: &Self) -> Self {
        Self {
            play_transform: self
                .play_transform
                .clone()
                .or_else(|| defaults.play_transform.clone()),
            check_existing_scrobbles: self
                .check_existing_scrobbles
                .or(defaults.check_existing_scrobbles),
            max_poll_retries: self.max_poll_retries.or(defaults.max_poll_retries),
            scrobble_delay_ms: self.scrobble_delay_ms.or(defaults.scrobble_delay_ms),
            scrobble_sleep_ms: self.scrobble_sleep_ms.or(defaults.scrobble_sleep_ms),
            dead_letter_retries: self.dead_letter_retries.or(defaults.dead_letter_retries),
            poll_interval_s: self.poll_interval_s.or(defaults.poll_interval_s),
            ring_capacity: self.ring_capacity.or(defaults.ring_capacity),
            history_stable_ticks: self.history_stable_ticks.or(defaults.history_stable_ticks),
            exclude_sources: self
                .exclude_sources
                .clone()
                .or_else(|| defaults.exclude_sources.clone()),
        }
    }
}

/// Config dir resolution priority order:
/// 1. Command-line argument (highest priority)
/// 2. `CONFIG_DIR` environment variable
/// 3. `/config` when running inside a container (`IS_DOCKER`)
/// 4. OS-dependent default (fallback)
pub fn resolve_config_dir(cli_arg: Option<&Path>) -> PathBuf {
    if let Some(dir) = cli_arg {
        return dir.to_path_buf();
    }
    if let Ok(dir) = std::env::var("CONFIG_DIR") {
        if !dir.is_empty() {
            return PathBuf::from(dir);
        }
    }
    let in_docker = std::env::var("IS_DOCKER")
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false);
    if in_docker {
        return PathBuf::from("/config");
    }
    default_config_dir()
}

/// OS-dependent default config dir
fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .map(|d| d.join("msb"))
        .unwrap_or_else(|| PathBuf::from("./config"))
}

/// Load `config.json` from the config dir.
///
/// A missing file is not fatal: the service starts with an empty component
/// list and everything is visible (and fixable) from the dashboard.
pub fn load(config_dir: &Path) -> Result<AppConfig> {
    let path = config_dir.join("config.json");
    if !path.exists() {
        tracing::warn!(path = %path.display(), "no config file found, starting with defaults");
        return Ok(AppConfig::default());
    }
    let raw = std::fs::read_to_string(&path)?;
    let config: AppConfig = serde_json::from_str(&raw)
        .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
    Ok(config)
}

/// Effective listen port: CLI flag > `PORT` env > config file > default.
pub fn resolve_port(cli_arg: Option<u16>, config: &AppConfig) -> u16 {
    if let Some(port) = cli_arg {
        return port;
    }
    if let Ok(port) = std::env::var("PORT") {
        if let Ok(port) = port.parse() {
            return port;
        }
    }
    config.port.unwrap_or(DEFAULT_PORT)
}
