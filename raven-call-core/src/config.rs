//! Service configuration
//!
//! All durations are stored as millisecond integers so the JSON form stays
//! readable. Missing fields take their defaults.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The file could not be read
    #[error("Failed to read config {path}: {source}")]
    Io {
        /// File path
        path: String,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid JSON for this schema
    #[error("Invalid config: {0}")]
    Parse(#[from] serde_json::Error),

    /// A value is out of range
    #[error("Invalid config value for {field}: {reason}")]
    Invalid {
        /// Offending field
        field: &'static str,
        /// Why it is rejected
        reason: String,
    },
}

/// Call session timing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    /// Unanswered outgoing calls end after this long
    pub answer_timeout_ms: u64,
    /// Delay between hang-up and the media registry sweep
    pub media_sweep_delay_ms: u64,
    /// How long to wait for the backend to assign a session id
    pub session_request_timeout_ms: u64,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            answer_timeout_ms: 30_000,
            media_sweep_delay_ms: 500,
            session_request_timeout_ms: 5_000,
        }
    }
}

impl CallConfig {
    /// Answer timeout
    pub fn answer_timeout(&self) -> Duration {
        Duration::from_millis(self.answer_timeout_ms)
    }

    /// Media sweep delay
    pub fn media_sweep_delay(&self) -> Duration {
        Duration::from_millis(self.media_sweep_delay_ms)
    }

    /// Session id request timeout
    pub fn session_request_timeout(&self) -> Duration {
        Duration::from_millis(self.session_request_timeout_ms)
    }
}

/// Ringtone and ringback playback
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CueConfig {
    /// Asset played for incoming calls
    pub ringtone_asset: String,
    /// Asset played while an outgoing call rings
    pub ringback_asset: String,
    /// Playback volume, 0.0 to 1.0
    pub volume: f32,
    /// Play attempts for the ringtone
    pub ringtone_attempts: u32,
    /// Backoff unit for ringtone retries; attempt `n` waits `n * backoff`
    pub ringtone_backoff_ms: u64,
    /// Play attempts for the ringback
    pub ringback_attempts: u32,
    /// Backoff unit for ringback retries
    pub ringback_backoff_ms: u64,
    /// Extra stop passes after an aggressive stop
    pub stop_passes_ms: Vec<u64>,
}

impl Default for CueConfig {
    fn default() -> Self {
        Self {
            ringtone_asset: "/assets/raven/stringee/phone-ring.wav".to_string(),
            ringback_asset: "/assets/raven/stringee/ringtone.mp3".to_string(),
            volume: 0.7,
            ringtone_attempts: 3,
            ringtone_backoff_ms: 500,
            ringback_attempts: 2,
            ringback_backoff_ms: 500,
            stop_passes_ms: vec![10, 100, 500],
        }
    }
}

/// Network quality sampling
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkMonitorConfig {
    /// Time between samples
    pub sample_interval_ms: u64,
    /// Base URL the probe paths are resolved against
    pub probe_base_url: String,
    /// Probe paths, tried in order
    pub probe_endpoints: Vec<String>,
    /// Per-request probe timeout
    pub probe_timeout_ms: u64,
}

impl Default for NetworkMonitorConfig {
    fn default() -> Self {
        Self {
            sample_interval_ms: 3_000,
            probe_base_url: "http://localhost:8000".to_string(),
            probe_endpoints: vec!["/api/method/ping".to_string(), "/ping".to_string()],
            probe_timeout_ms: 2_000,
        }
    }
}

impl NetworkMonitorConfig {
    /// Sample interval
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    /// Probe timeout
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

/// Complete configuration of a call service
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Call session timing
    pub call: CallConfig,
    /// Audio cues
    pub cues: CueConfig,
    /// Network monitor
    pub network: NetworkMonitorConfig,
}

impl ServiceConfig {
    /// Parse from JSON
    ///
    /// # Errors
    ///
    /// Returns error if the JSON is malformed or a value is out of range
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a JSON file
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or parsed
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&json)
    }

    /// Check value ranges
    ///
    /// # Errors
    ///
    /// Returns error naming the first invalid field
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.call.answer_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "call.answer_timeout_ms",
                reason: "must be greater than zero".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.cues.volume) {
            return Err(ConfigError::Invalid {
                field: "cues.volume",
                reason: format!("{} is outside 0.0..=1.0", self.cues.volume),
            });
        }
        if self.cues.ringtone_attempts == 0 || self.cues.ringback_attempts == 0 {
            return Err(ConfigError::Invalid {
                field: "cues.*_attempts",
                reason: "at least one play attempt is required".to_string(),
            });
        }
        if self.network.sample_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "network.sample_interval_ms",
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults() {
        let config = ServiceConfig::default();
        assert_eq!(config.call.answer_timeout(), Duration::from_secs(30));
        assert_eq!(config.call.media_sweep_delay(), Duration::from_millis(500));
        assert_eq!(config.cues.stop_passes_ms, vec![10, 100, 500]);
        assert_eq!(config.cues.ringtone_attempts, 3);
        assert_eq!(config.network.sample_interval(), Duration::from_secs(3));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config =
            ServiceConfig::from_json(r#"{"call": {"answer_timeout_ms": 45000}}"#).unwrap();
        assert_eq!(config.call.answer_timeout_ms, 45_000);
        assert_eq!(config.call.media_sweep_delay_ms, 500);
        assert_eq!(config.cues, CueConfig::default());
    }

    #[test]
    fn test_invalid_volume_rejected() {
        let err = ServiceConfig::from_json(r#"{"cues": {"volume": 1.5}}"#).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "cues.volume",
                ..
            }
        ));
    }

    #[test]
    fn test_roundtrip_through_json() {
        let config = ServiceConfig::default();
        let json = serde_json::to_string_pretty(&config).unwrap();
        assert_eq!(ServiceConfig::from_json(&json).unwrap(), config);
    }
}
