// SPDX-FileCopyrightText: © 2025 Framecast Contributors
//
// SPDX-License-Identifier: MPL-2.0

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::Level;

use framecast_store::StoreConfig;

/// Log level for filtering messages.
#[derive(Deserialize, Serialize, Debug, Clone, Default, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Debug => Self::DEBUG,
            LogLevel::Info => Self::INFO,
            LogLevel::Warn => Self::WARN,
            LogLevel::Error => Self::ERROR,
        }
    }
}

/// Log file format options.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, Default, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Plain text format (faster, lower CPU overhead)
    #[default]
    Text,
    /// JSON format (structured, better for log aggregation but slower)
    Json,
}

/// Logging configuration for console and file output.
#[derive(Deserialize, Serialize, Debug, Clone, JsonSchema)]
pub struct LogConfig {
    #[serde(default)]
    pub console_enable: bool,
    #[serde(default)]
    pub file_enable: bool,
    #[serde(default)]
    pub console_level: LogLevel,
    #[serde(default)]
    pub file_level: LogLevel,
    #[serde(default)]
    pub file_path: String,
    /// Format for file logging: "text" (default, faster) or "json" (structured)
    #[serde(default)]
    pub file_format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            console_enable: true,
            file_enable: true,
            console_level: LogLevel::default(),
            file_level: LogLevel::Info,
            file_path: "./fcast.log".to_string(),
            file_format: LogFormat::default(),
        }
    }
}

const fn default_true() -> bool {
    true
}

/// Telemetry and observability configuration (OpenTelemetry).
#[derive(Deserialize, Serialize, Debug, Clone, JsonSchema)]
pub struct TelemetryConfig {
    #[serde(default = "default_true")]
    pub enable: bool,
    /// Enable OpenTelemetry tracing (spans) export.
    ///
    /// Metrics export is controlled separately via `otlp_endpoint`.
    #[serde(default)]
    pub tracing_enable: bool,
    pub otlp_endpoint: Option<String>,
    /// OTLP endpoint for trace export (e.g., `http://localhost:4318/v1/traces`).
    pub otlp_traces_endpoint: Option<String>,
    #[serde(default)]
    pub otlp_headers: HashMap<String, String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enable: true,
            tracing_enable: false,
            otlp_endpoint: None,
            otlp_traces_endpoint: None,
            otlp_headers: HashMap::new(),
        }
    }
}

fn default_cors_allowed_origins() -> Vec<String> {
    vec![
        "http://localhost".to_string(),
        "https://localhost".to_string(),
        "http://localhost:*".to_string(),
        "https://localhost:*".to_string(),
        "http://127.0.0.1".to_string(),
        "https://127.0.0.1".to_string(),
        "http://127.0.0.1:*".to_string(),
        "https://127.0.0.1:*".to_string(),
    ]
}

/// CORS configuration for cross-origin requests.
#[derive(Deserialize, Serialize, Debug, Clone, JsonSchema)]
pub struct CorsConfig {
    /// Allowed origins for CORS requests.
    /// Supports wildcards: "http://localhost:*" matches any port on localhost.
    /// Set to `["*"]` to allow all origins (not recommended for production).
    #[serde(default = "default_cors_allowed_origins")]
    pub allowed_origins: Vec<String>,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self { allowed_origins: default_cors_allowed_origins() }
    }
}

/// HTTP server configuration including TLS and CORS settings.
#[derive(Deserialize, Serialize, Debug, Clone, JsonSchema)]
pub struct ServerConfig {
    pub address: String,
    pub tls: bool,
    pub cert_path: String,
    pub key_path: String,
    /// CORS configuration for cross-origin requests
    #[serde(default)]
    pub cors: CorsConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:4650".to_string(),
            tls: false,
            cert_path: String::new(),
            key_path: String::new(),
            cors: CorsConfig::default(),
        }
    }
}

const fn default_max_connections() -> u32 {
    10
}

const fn default_acquire_timeout_secs() -> u64 {
    5
}

/// Postgres connection settings.
#[derive(Deserialize, Serialize, Debug, Clone, JsonSchema)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgres://localhost/framecast".to_string(),
            max_connections: default_max_connections(),
            acquire_timeout_secs: default_acquire_timeout_secs(),
        }
    }
}

impl DatabaseConfig {
    pub const fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }
}

const fn default_chunk_frames() -> i64 {
    256
}

const fn default_cache_cap_bytes() -> u64 {
    512 << 20
}

const fn default_max_frame_bytes() -> usize {
    4 << 20
}

const fn default_pressure_guard_factor() -> u64 {
    2
}

const fn default_load_chunk_timeout_ms() -> u64 {
    500
}

fn default_bucket_sizes() -> Vec<usize> {
    framecast_core::DEFAULT_BUCKET_SIZES.to_vec()
}

/// Chunk cache sizing.
#[derive(Deserialize, Serialize, Debug, Clone, JsonSchema)]
pub struct CacheConfig {
    /// Frames per cached chunk.
    #[serde(default = "default_chunk_frames")]
    pub chunk_frames: i64,
    /// Byte budget over chunk buffer capacities.
    #[serde(default = "default_cache_cap_bytes")]
    pub cache_cap_bytes: u64,
    /// Frames larger than this are dropped at load time.
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
    /// Multiplier over the budget at which loads refuse outright.
    #[serde(default = "default_pressure_guard_factor")]
    pub pressure_guard_factor: u64,
    /// Per-chunk database deadline in milliseconds.
    #[serde(default = "default_load_chunk_timeout_ms")]
    pub load_chunk_timeout_ms: u64,
    /// Buffer pool bucket sizes, ascending.
    #[serde(default = "default_bucket_sizes")]
    pub bucket_sizes: Vec<usize>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            chunk_frames: default_chunk_frames(),
            cache_cap_bytes: default_cache_cap_bytes(),
            max_frame_bytes: default_max_frame_bytes(),
            pressure_guard_factor: default_pressure_guard_factor(),
            load_chunk_timeout_ms: default_load_chunk_timeout_ms(),
            bucket_sizes: default_bucket_sizes(),
        }
    }
}

impl CacheConfig {
    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            chunk_frames: self.chunk_frames,
            cache_cap_bytes: self.cache_cap_bytes,
            max_frame_bytes: self.max_frame_bytes,
            pressure_guard_factor: self.pressure_guard_factor,
            load_chunk_timeout: Duration::from_millis(self.load_chunk_timeout_ms),
            bucket_sizes: self.bucket_sizes.clone(),
        }
    }
}

const fn default_playback_interval_ms() -> u64 {
    40
}

const fn default_empty_chunk_guard() -> u32 {
    3
}

const fn default_ws_write_deadline_ms() -> u64 {
    2_000
}

const fn default_ws_read_deadline_ms() -> u64 {
    60_000
}

/// Replay pacing and WebSocket deadlines.
#[derive(Deserialize, Serialize, Debug, Clone, JsonSchema)]
pub struct PlaybackConfig {
    /// Slot interval in milliseconds (40 ms = 25 fps).
    #[serde(default = "default_playback_interval_ms")]
    pub interval_ms: u64,
    /// Consecutive empty chunks after which a session treats the tail as
    /// exhausted.
    #[serde(default = "default_empty_chunk_guard")]
    pub empty_chunk_guard: u32,
    /// Per-message write bound in milliseconds.
    #[serde(default = "default_ws_write_deadline_ms")]
    pub ws_write_deadline_ms: u64,
    /// Read deadline in milliseconds, extended on every pong.
    #[serde(default = "default_ws_read_deadline_ms")]
    pub ws_read_deadline_ms: u64,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_playback_interval_ms(),
            empty_chunk_guard: default_empty_chunk_guard(),
            ws_write_deadline_ms: default_ws_write_deadline_ms(),
            ws_read_deadline_ms: default_ws_read_deadline_ms(),
        }
    }
}

impl PlaybackConfig {
    pub const fn session_config(&self) -> framecast_replay::PlaybackConfig {
        framecast_replay::PlaybackConfig {
            interval: Duration::from_millis(self.interval_ms),
            empty_chunk_guard: self.empty_chunk_guard,
            write_deadline: Duration::from_millis(self.ws_write_deadline_ms),
        }
    }

    pub const fn read_deadline(&self) -> Duration {
        Duration::from_millis(self.ws_read_deadline_ms)
    }
}

/// Root configuration for the Framecast server.
#[derive(Deserialize, Serialize, Default, Debug, Clone, JsonSchema)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub playback: PlaybackConfig,

    #[serde(default)]
    pub log: LogConfig,

    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

#[derive(Debug)]
pub struct ConfigLoadResult {
    pub config: Config,
    pub file_missing: Option<String>,
}

/// Loads the application configuration from defaults, a TOML file, and
/// `FC_`-prefixed environment variables.
///
/// # Errors
///
/// Returns an error if the configuration file or environment contain invalid
/// values for the declared types.
pub fn load(config_path: &str) -> Result<ConfigLoadResult, Box<figment::Error>> {
    let mut figment =
        Figment::new().merge(figment::providers::Serialized::defaults(Config::default()));

    let mut file_missing = None;

    // Try to load the config file, but don't fail if it doesn't exist
    if std::path::Path::new(config_path).exists() {
        figment = figment.merge(Toml::file(config_path));
    } else {
        file_missing = Some(config_path.to_string());
    }

    let config: Config =
        figment.merge(Env::prefixed("FC_").split("__")).extract().map_err(Box::new)?;

    Ok(ConfigLoadResult { config, file_missing })
}

/// Generates the default configuration as a pretty-printed TOML string.
///
/// # Errors
///
/// Returns an error if the default configuration cannot be serialized.
pub fn generate_default() -> Result<String, toml::ser::Error> {
    let default_config = Config::default();
    toml::to_string_pretty(&default_config)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_production_sizing() {
        let config = Config::default();
        assert_eq!(config.cache.chunk_frames, 256);
        assert_eq!(config.cache.cache_cap_bytes, 512 << 20);
        assert_eq!(config.cache.max_frame_bytes, 4 << 20);
        assert_eq!(config.cache.pressure_guard_factor, 2);
        assert_eq!(config.cache.load_chunk_timeout_ms, 500);
        assert_eq!(config.playback.interval_ms, 40);
        assert_eq!(config.playback.empty_chunk_guard, 3);
        assert_eq!(config.playback.ws_write_deadline_ms, 2_000);
        assert_eq!(config.playback.ws_read_deadline_ms, 60_000);
        assert_eq!(config.cache.bucket_sizes.first(), Some(&(32 << 10)));
        assert_eq!(config.cache.bucket_sizes.last(), Some(&(4 << 20)));
    }

    #[test]
    fn store_config_conversion() {
        let cache = CacheConfig { load_chunk_timeout_ms: 250, ..CacheConfig::default() };
        let store = cache.store_config();
        assert_eq!(store.load_chunk_timeout, Duration::from_millis(250));
        assert_eq!(store.chunk_frames, 256);
    }

    #[test]
    fn env_variables_override_file_values() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "fcast.toml",
                r#"
                [cache]
                chunk_frames = 64
                "#,
            )?;
            jail.set_env("FC_CACHE__CHUNK_FRAMES", "128");
            jail.set_env("FC_PLAYBACK__INTERVAL_MS", "20");

            let result = load("fcast.toml").map_err(|e| *e)?;
            assert_eq!(result.config.cache.chunk_frames, 128);
            assert_eq!(result.config.playback.interval_ms, 20);
            assert!(result.file_missing.is_none());
            Ok(())
        });
    }

    #[test]
    fn default_config_serializes_to_toml() {
        let toml_string = generate_default().unwrap();
        assert!(toml_string.contains("chunk_frames"));
        assert!(toml_string.contains("interval_ms"));
    }
}
