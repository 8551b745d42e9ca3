//! Konfiguration
//!
//! Lädt die Laufzeit-Konfiguration aus einer JSON-Datei und
//! Umgebungsvariablen. Alle Felder haben Defaults, eine fehlende
//! Datei ist kein Fehler.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Pfad zu einer expliziten Konfigurationsdatei
pub const CONFIG_PATH_ENV: &str = "DIALTONE_CONFIG";
/// Überschreibt `store_url`
pub const STORE_URL_ENV: &str = "DIALTONE_STORE_URL";
/// Überschreibt `ring_timeout` (Sekunden)
pub const RING_TIMEOUT_ENV: &str = "DIALTONE_RING_TIMEOUT";

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid value for {name}: {value}")]
    InvalidEnv { name: &'static str, value: String },
}

// ============================================================================
// ICE SERVER CONFIGURATION
// ============================================================================

/// Ein STUN/TURN Server mit optionalen Credentials
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

/// Standard STUN Server (Google, kostenlos)
pub fn default_ice_servers() -> Vec<IceServerConfig> {
    vec![IceServerConfig {
        urls: vec![
            "stun:stun.l.google.com:19302".to_string(),
            "stun:stun1.l.google.com:19302".to_string(),
            "stun:stun2.l.google.com:19302".to_string(),
        ],
        username: None,
        credential: None,
    }]
}

// ============================================================================
// CONFIG
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// WebSocket URL des Store-Relays
    pub store_url: String,
    /// Länder-Prefix für gewählte Nummern
    pub country_prefix: String,
    /// Anzahl Ziffern einer lokalen Nummer
    pub number_length: usize,
    /// Klingelfenster in Sekunden
    pub ring_timeout: u64,
    /// Unbeantwortete Offers älter als das (Sekunden) gelten als verwaist
    pub offer_ttl: u64,
    /// Heartbeat-Intervall zum Store-Relay in Sekunden
    pub heartbeat_interval: u64,
    pub ice_servers: Vec<IceServerConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store_url: "wss://dialtone-store.example.net/ws".to_string(),
            country_prefix: "+91".to_string(),
            number_length: 10,
            ring_timeout: 30,
            offer_ttl: 60,
            heartbeat_interval: 25,
            ice_servers: default_ice_servers(),
        }
    }
}

impl Config {
    /// Lädt die Konfiguration (Datei + Umgebungsvariablen)
    pub fn load() -> Result<Self, ConfigError> {
        let path = match std::env::var(CONFIG_PATH_ENV) {
            Ok(p) => Some(PathBuf::from(p)),
            Err(_) => Self::default_path(),
        };

        let mut config = match path {
            Some(ref p) if p.exists() => {
                tracing::info!("Loading config from {:?}", p);
                Self::from_file(p)?
            }
            _ => {
                tracing::debug!("No config file found, using defaults");
                Self::default()
            }
        };

        config.apply_env()?;
        Ok(config)
    }

    /// Liest eine JSON-Konfigurationsdatei
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// `config.json` im plattformüblichen Konfigurationsverzeichnis
    fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "dialtone", "dialtone")
            .map(|dirs| dirs.config_dir().join("config.json"))
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(url) = std::env::var(STORE_URL_ENV) {
            self.store_url = url;
        }
        if let Ok(value) = std::env::var(RING_TIMEOUT_ENV) {
            self.ring_timeout = value.parse().map_err(|_| ConfigError::InvalidEnv {
                name: RING_TIMEOUT_ENV,
                value,
            })?;
        }
        Ok(())
    }

    pub fn ring_window(&self) -> Duration {
        Duration::from_secs(self.ring_timeout)
    }

    pub fn offer_max_age(&self) -> Duration {
        Duration::from_secs(self.offer_ttl)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval)
    }
}

// ============================================================================
// TESTS
// ============================================================================
