//! GeoPresence Configuration
//!
//! This module defines the configuration structures with proper defaults
//! using derive macros and serde attributes.

use crate::error::GeoPresenceError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

// ============================================================================
// Constants
// ============================================================================

/// Default relay endpoint
pub const DEFAULT_ENDPOINT: &str = "ws://127.0.0.1:8080";
/// Default room
pub const DEFAULT_ROOM: &str = "default-room";
/// Peers not refreshed within this window are evicted (milliseconds)
pub const DEFAULT_STALE_MS: u64 = 30_000;
/// Period of the eviction sweep (milliseconds)
pub const DEFAULT_SWEEP_INTERVAL_MS: u64 = 5_000;
/// Peers at or below this distance are "close" (meters)
pub const DEFAULT_PROXIMITY_M: f64 = 5_000.0;
/// Oldest acceptable cached position (milliseconds)
pub const DEFAULT_MAX_AGE_MS: u64 = 5_000;
/// Maximum wait for a position sample (milliseconds)
pub const DEFAULT_SAMPLE_TIMEOUT_MS: u64 = 10_000;
/// Default gpsd host
pub const DEFAULT_GPSD_HOST: &str = "127.0.0.1";
/// Default gpsd port
pub const DEFAULT_GPSD_PORT: u16 = 2947;
/// Emission period of the fixed source (milliseconds)
pub const DEFAULT_FIXED_INTERVAL_MS: u64 = 1_000;
/// Default relay bind host
pub const DEFAULT_RELAY_HOST: &str = "127.0.0.1";
/// Default relay bind port
pub const DEFAULT_RELAY_PORT: u16 = 8080;

// ============================================================================
// Helper functions for paths
// ============================================================================

fn home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
}

fn default_geopresence_dir() -> PathBuf {
    home_dir().join(".geopresence")
}

// ============================================================================
// Main Config
// ============================================================================

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Relay connection
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Peer bookkeeping
    #[serde(default)]
    pub presence: PresenceConfig,
    /// Position sampling options
    #[serde(default)]
    pub sampling: SamplingConfig,
    /// Position source selection
    #[serde(default)]
    pub source: SourceConfig,
    /// Development relay
    #[serde(default)]
    pub relay: RelayConfig,
}

// ============================================================================
// Connection Config
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// WebSocket endpoint (ws:// or wss://)
    #[serde(default = "ConnectionConfig::default_endpoint")]
    pub endpoint: String,
    /// Room to join
    #[serde(default = "ConnectionConfig::default_room")]
    pub room: String,
}

impl ConnectionConfig {
    fn default_endpoint() -> String {
        DEFAULT_ENDPOINT.to_string()
    }
    fn default_room() -> String {
        DEFAULT_ROOM.to_string()
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            room: DEFAULT_ROOM.to_string(),
        }
    }
}

// ============================================================================
// Presence Config
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceConfig {
    /// Staleness window (milliseconds)
    #[serde(default = "PresenceConfig::default_stale_ms")]
    pub stale_ms: u64,
    /// Sweep period (milliseconds)
    #[serde(default = "PresenceConfig::default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    /// Proximity threshold (meters)
    #[serde(default = "PresenceConfig::default_proximity_m")]
    pub proximity_m: f64,
}

impl PresenceConfig {
    fn default_stale_ms() -> u64 {
        DEFAULT_STALE_MS
    }
    fn default_sweep_interval_ms() -> u64 {
        DEFAULT_SWEEP_INTERVAL_MS
    }
    fn default_proximity_m() -> f64 {
        DEFAULT_PROXIMITY_M
    }
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            stale_ms: DEFAULT_STALE_MS,
            sweep_interval_ms: DEFAULT_SWEEP_INTERVAL_MS,
            proximity_m: DEFAULT_PROXIMITY_M,
        }
    }
}

// ============================================================================
// Sampling Config
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingConfig {
    /// Ask the source for its most accurate fix
    #[serde(default = "SamplingConfig::default_high_accuracy")]
    pub high_accuracy: bool,
    /// Discard samples older than this (milliseconds)
    #[serde(default = "SamplingConfig::default_max_age_ms")]
    pub max_age_ms: u64,
    /// Report a timeout when no sample arrives within this (milliseconds)
    #[serde(default = "SamplingConfig::default_timeout_ms")]
    pub timeout_ms: u64,
}

impl SamplingConfig {
    fn default_high_accuracy() -> bool {
        true
    }
    fn default_max_age_ms() -> u64 {
        DEFAULT_MAX_AGE_MS
    }
    fn default_timeout_ms() -> u64 {
        DEFAULT_SAMPLE_TIMEOUT_MS
    }
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            high_accuracy: true,
            max_age_ms: DEFAULT_MAX_AGE_MS,
            timeout_ms: DEFAULT_SAMPLE_TIMEOUT_MS,
        }
    }
}

// ============================================================================
// Source Config
// ============================================================================

/// Which position source to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// gpsd daemon over TCP
    #[default]
    Gpsd,
    /// A fixed coordinate, re-emitted periodically
    Fixed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    #[serde(default)]
    pub kind: SourceKind,
    #[serde(default = "SourceConfig::default_gpsd_host")]
    pub gpsd_host: String,
    #[serde(default = "SourceConfig::default_gpsd_port")]
    pub gpsd_port: u16,
    #[serde(default)]
    pub fixed_lat: Option<f64>,
    #[serde(default)]
    pub fixed_lon: Option<f64>,
    #[serde(default = "SourceConfig::default_fixed_interval_ms")]
    pub fixed_interval_ms: u64,
}

impl SourceConfig {
    fn default_gpsd_host() -> String {
        DEFAULT_GPSD_HOST.to_string()
    }
    fn default_gpsd_port() -> u16 {
        DEFAULT_GPSD_PORT
    }
    fn default_fixed_interval_ms() -> u64 {
        DEFAULT_FIXED_INTERVAL_MS
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            kind: SourceKind::default(),
            gpsd_host: DEFAULT_GPSD_HOST.to_string(),
            gpsd_port: DEFAULT_GPSD_PORT,
            fixed_lat: None,
            fixed_lon: None,
            fixed_interval_ms: DEFAULT_FIXED_INTERVAL_MS,
        }
    }
}

// ============================================================================
// Relay Config
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default = "RelayConfig::default_host")]
    pub host: String,
    #[serde(default = "RelayConfig::default_port")]
    pub port: u16,
}

impl RelayConfig {
    fn default_host() -> String {
        DEFAULT_RELAY_HOST.to_string()
    }
    fn default_port() -> u16 {
        DEFAULT_RELAY_PORT
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_RELAY_HOST.to_string(),
            port: DEFAULT_RELAY_PORT,
        }
    }
}

// ============================================================================
// Config Loading and Validation
// ============================================================================

/// Configuration loader
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from an explicit path or the default locations.
    ///
    /// Falls back to built-in defaults when no path is given and no default
    /// file exists.
    pub fn load(path: Option<&str>) -> Result<Config, GeoPresenceError> {
        let config_path = match path {
            Some(p) => {
                let p = PathBuf::from(p);
                if !p.exists() {
                    return Err(GeoPresenceError::config_not_found(p.display().to_string()));
                }
                p
            }
            None => match Self::resolve_default_path() {
                Some(p) => p,
                None => {
                    tracing::debug!("No config file found, using defaults");
                    return Ok(Config::default());
                }
            },
        };

        let content = std::fs::read_to_string(&config_path).map_err(|e| {
            GeoPresenceError::config_parse_error(format!("Failed to read: {}", e))
        })?;
        let config: Config = serde_yml::from_str(&content).map_err(|e| {
            GeoPresenceError::config_parse_error(format!("Failed to parse: {}", e))
        })?;
        tracing::debug!("Loaded config from {}", config_path.display());
        Ok(config)
    }

    fn resolve_default_path() -> Option<PathBuf> {
        let default_paths = [
            default_geopresence_dir().join("config.yaml"),
            dirs::config_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("geopresence.yaml"),
            PathBuf::from("./geopresence.yaml"),
        ];

        default_paths.into_iter().find(|p| p.exists())
    }
}

/// Configuration validator
pub struct ConfigValidator;

impl ConfigValidator {
    pub fn validate(config: &Config) -> Result<(), GeoPresenceError> {
        if config.connection.room.trim().is_empty() {
            return Err(GeoPresenceError::config_invalid(
                "connection.room",
                "Room cannot be empty",
            ));
        }

        let endpoint = config.connection.endpoint.as_str();
        if !(endpoint.starts_with("ws://") || endpoint.starts_with("wss://")) {
            return Err(GeoPresenceError::config_invalid(
                "connection.endpoint",
                format!("Endpoint must start with ws:// or wss://, got '{}'", endpoint),
            ));
        }

        if config.presence.stale_ms == 0 {
            return Err(GeoPresenceError::config_invalid(
                "presence.stale_ms",
                "Must be greater than zero",
            ));
        }
        if config.presence.sweep_interval_ms == 0 {
            return Err(GeoPresenceError::config_invalid(
                "presence.sweep_interval_ms",
                "Must be greater than zero",
            ));
        }
        let proximity = config.presence.proximity_m;
        if proximity.is_nan() || proximity <= 0.0 {
            return Err(GeoPresenceError::config_invalid(
                "presence.proximity_m",
                "Must be a positive distance",
            ));
        }
        if config.sampling.timeout_ms == 0 {
            return Err(GeoPresenceError::config_invalid(
                "sampling.timeout_ms",
                "Must be greater than zero",
            ));
        }

        if config.source.kind == SourceKind::Fixed
            && (config.source.fixed_lat.is_none() || config.source.fixed_lon.is_none())
        {
            return Err(GeoPresenceError::config_invalid(
                "source",
                "Fixed source requires fixed_lat and fixed_lon",
            ));
        }

        Ok(())
    }
}

impl Config {
    pub fn load(path: &Option<String>) -> Result<Self, GeoPresenceError> {
        ConfigLoader::load(path.as_deref())
    }

    pub fn save(&self, path: &Path) -> Result<(), GeoPresenceError> {
        let content = serde_yml::to_string(self).map_err(|e| {
            GeoPresenceError::config_parse_error(format!("Serialization failed: {}", e))
        })?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Default location written by `geopresence init`
    pub fn default_path() -> PathBuf {
        default_geopresence_dir().join("config.yaml")
    }

    /// Generate a sample configuration
    pub fn sample() -> Self {
        Config {
            connection: ConnectionConfig {
                endpoint: "wss://relay.example.com".to_string(),
                room: "team-alpha".to_string(),
            },
            presence: PresenceConfig::default(),
            sampling: SamplingConfig::default(),
            source: SourceConfig {
                kind: SourceKind::Fixed,
                fixed_lat: Some(52.5200),
                fixed_lon: Some(13.4050),
                ..SourceConfig::default()
            },
            relay: RelayConfig::default(),
        }
    }
}
