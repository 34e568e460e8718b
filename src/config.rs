// Serial defaults, homing timings and the optional JSON config file
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

// Serial port used when neither the config file nor the CLI names one
pub const DEFAULT_PORT: &str = "/dev/ttyUSB0";

// Controllers ship at 38400; 9600 is the other common setting
pub const DEFAULT_BAUDRATE: u32 = 38_400;

// Applies to every read and every write individually
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

// Every command and response ends with a carriage return
pub const TERMINATOR: char = '\r';

// Homing: limit switch polling and back-off
pub const POLL_INTERVAL: Duration = Duration::from_millis(250);
pub const SETTLE_DELAY: Duration = Duration::from_millis(100);
pub const BACKOFF_VELOCITY: i64 = 1000;
pub const BACKOFF_STEPS: i64 = 5000;

// The limit switch is wired to input 2 on both axes
pub const HOME_INPUT: u8 = 2;

// Rated phase current of the stage motors (amps)
pub const MOTOR_MAX_CURRENT: f64 = 0.62;

/// Error loading a [`StageConfig`] file
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Could not read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Could not parse config file: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Settings read from a JSON config file. Missing fields take the defaults above.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageConfig {
    pub port: String,
    pub baud_rate: u32,
    pub timeout_ms: u64,
    pub motor_max_current: f64,
    pub low_current_range: bool,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT.to_string(),
            baud_rate: DEFAULT_BAUDRATE,
            timeout_ms: DEFAULT_TIMEOUT.as_millis() as u64,
            motor_max_current: MOTOR_MAX_CURRENT,
            low_current_range: true,
        }
    }
}

impl StageConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config = StageConfig::from_json_str(r#"{ "port": "com4" }"#).unwrap();
        assert_eq!(config.port, "com4");
        assert_eq!(config.baud_rate, DEFAULT_BAUDRATE);
        assert_eq!(config.timeout(), DEFAULT_TIMEOUT);
        assert!(config.low_current_range);
    }

    #[test]
    fn test_full_config() {
        let config = StageConfig::from_json_str(
            r#"{
                "port": "/dev/ttyS1",
                "baud_rate": 9600,
                "timeout_ms": 250,
                "motor_max_current": 1.2,
                "low_current_range": false
            }"#,
        )
        .unwrap();
        assert_eq!(config.baud_rate, 9600);
        assert_eq!(config.timeout(), Duration::from_millis(250));
        assert_eq!(config.motor_max_current, 1.2);
        assert!(!config.low_current_range);
    }

    #[test]
    fn test_malformed_config() {
        let err = StageConfig::from_json_str("{ port = 3 }").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_missing_file() {
        let err = StageConfig::load("/nonexistent/stage.json").unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
