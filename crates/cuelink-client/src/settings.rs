//! Client settings with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`ClientSettings::default()`]
//! 2. If `~/.cuelink/settings.json` exists, deep-merge user values over defaults
//! 3. Apply `CUELINK_*` environment overrides (highest priority)

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use cuelink_monitor::{BufferConfig, SamplingStrategy};
use cuelink_session::SessionConfig;
use cuelink_transport::{ReconnectPolicy, TransportConfig};

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("failed to read settings file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse settings JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid settings value: {0}")]
    InvalidValue(String),
}

pub type Result<T> = std::result::Result<T, SettingsError>;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReconnectSettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Jitter as a fraction of the backoff delay.
    pub jitter: f64,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            jitter: 0.2,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionSettings {
    pub auto_renew: bool,
    pub renew_window_ratio: f64,
    pub min_renew_window_ms: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            auto_renew: true,
            renew_window_ratio: 0.2,
            min_renew_window_ms: 300_000,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MetadataSettings {
    pub buffer_size: usize,
    pub throttle_ms: u64,
    pub sampling_strategy: SamplingStrategy,
}

impl Default for MetadataSettings {
    fn default() -> Self {
        Self {
            buffer_size: 100,
            throttle_ms: 1_000,
            sampling_strategy: SamplingStrategy::Latest,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientSettings {
    pub api_base_url: String,
    pub ws_base_url: String,
    pub heartbeat_interval_ms: u64,
    pub reconnect: ReconnectSettings,
    pub session: SessionSettings,
    pub metadata: MetadataSettings,
    /// SQLite file for the session cache. Defaults to `~/.cuelink/session.db`.
    pub store_path: Option<String>,
    pub log_level: String,
    pub log_json: bool,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:8001".into(),
            ws_base_url: "ws://localhost:8001".into(),
            heartbeat_interval_ms: 5_000,
            reconnect: ReconnectSettings::default(),
            session: SessionSettings::default(),
            metadata: MetadataSettings::default(),
            store_path: None,
            log_level: "info".into(),
            log_json: false,
        }
    }
}

impl ClientSettings {
    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            policy: ReconnectPolicy {
                max_attempts: self.reconnect.max_attempts,
                base_delay: Duration::from_millis(self.reconnect.base_delay_ms),
                max_delay: Duration::from_millis(self.reconnect.max_delay_ms),
                jitter_ratio: self.reconnect.jitter.clamp(0.0, 1.0),
            },
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms.max(1)),
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            auto_renew: self.session.auto_renew,
            renew_window_ratio: self.session.renew_window_ratio.clamp(0.0, 1.0),
            min_renew_window: Duration::from_millis(self.session.min_renew_window_ms),
        }
    }

    pub fn buffer_config(&self) -> BufferConfig {
        BufferConfig {
            max_size: self.metadata.buffer_size.max(1),
            throttle: Duration::from_millis(self.metadata.throttle_ms),
            strategy: self.metadata.sampling_strategy,
        }
    }

    pub fn store_path(&self) -> PathBuf {
        match &self.store_path {
            Some(path) => PathBuf::from(path),
            None => cuelink_dir().join("session.db"),
        }
    }
}

fn cuelink_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".cuelink")
}

/// `~/.cuelink/settings.json`.
pub fn settings_path() -> PathBuf {
    cuelink_dir().join("settings.json")
}

pub fn load_settings() -> Result<ClientSettings> {
    load_settings_from_path(&settings_path())
}

/// Missing file → defaults; unreadable JSON → error.
pub fn load_settings_from_path(path: &Path) -> Result<ClientSettings> {
    load_settings_with(path, |name| std::env::var(name).ok())
}

/// Like [`load_settings_from_path`] with overrides read through `lookup`.
pub fn load_settings_with(
    path: &Path,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<ClientSettings> {
    let defaults = serde_json::to_value(ClientSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        if !user.is_object() {
            return Err(SettingsError::InvalidValue(
                "settings file must contain a JSON object".into(),
            ));
        }
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: ClientSettings = serde_json::from_value(merged)?;
    apply_overrides_with(&mut settings, lookup);
    Ok(settings)
}

/// Objects merge per key; arrays and primitives are replaced; nulls in
/// `source` are skipped.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply overrides from `lookup`. Out-of-range or unparsable values are
/// ignored with a warning.
pub fn apply_overrides_with(
    settings: &mut ClientSettings,
    lookup: impl Fn(&str) -> Option<String>,
) {
    let env = Env { lookup: &lookup };

    if let Some(v) = env.string("CUELINK_API_BASE_URL") {
        settings.api_base_url = v;
    }
    if let Some(v) = env.string("CUELINK_WS_BASE_URL") {
        settings.ws_base_url = v;
    }
    if let Some(v) = env.string("CUELINK_STORE_PATH") {
        settings.store_path = Some(v);
    }
    if let Some(v) = env.string("CUELINK_LOG_LEVEL") {
        settings.log_level = v;
    }
    if let Some(v) = env.bool("CUELINK_LOG_JSON") {
        settings.log_json = v;
    }
    if let Some(v) = env.u64("CUELINK_HEARTBEAT_INTERVAL_MS", 100, 600_000) {
        settings.heartbeat_interval_ms = v;
    }

    if let Some(v) = env.u64("CUELINK_RECONNECT_MAX_ATTEMPTS", 0, 1_000) {
        settings.reconnect.max_attempts = v as u32;
    }
    if let Some(v) = env.u64("CUELINK_RECONNECT_BASE_DELAY_MS", 10, 600_000) {
        settings.reconnect.base_delay_ms = v;
    }
    if let Some(v) = env.u64("CUELINK_RECONNECT_MAX_DELAY_MS", 10, 3_600_000) {
        settings.reconnect.max_delay_ms = v;
    }

    if let Some(v) = env.bool("CUELINK_SESSION_AUTO_RENEW") {
        settings.session.auto_renew = v;
    }
    if let Some(v) = env.u64("CUELINK_SESSION_MIN_RENEW_WINDOW_MS", 0, 86_400_000) {
        settings.session.min_renew_window_ms = v;
    }

    if let Some(v) = env.u64("CUELINK_METADATA_BUFFER_SIZE", 1, 100_000) {
        settings.metadata.buffer_size = v as usize;
    }
    if let Some(v) = env.u64("CUELINK_METADATA_THROTTLE_MS", 10, 60_000) {
        settings.metadata.throttle_ms = v;
    }
}

// ── Pure parsing functions ──────────────────────────────────────────────────

/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

struct Env<'a> {
    lookup: &'a dyn Fn(&str) -> Option<String>,
}

impl Env<'_> {
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn bool(&self, name: &str) -> Option<bool> {
        let val = (self.lookup)(name)?;
        let result = parse_bool(&val);
        if result.is_none() {
            warn!(key = name, value = %val, "invalid boolean env var, ignoring");
        }
        result
    }

    fn u64(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        let val = (self.lookup)(name)?;
        let result = parse_u64_range(&val, min, max);
        if result.is_none() {
            warn!(key = name, value = %val, "invalid integer env var, ignoring");
        }
        result
    }
}
