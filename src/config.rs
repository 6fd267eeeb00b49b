//! Runtime settings for the serial line, protocol timeouts and retry policy.
//!
//! Settings are read with the `config` crate from a TOML file, with
//! `FRELON__*` environment variables layered on top. Every field has a
//! default, so an empty file (or no file) gives a working configuration.
//!
//! # Example
//!
//! ```rust,ignore
//! let settings = Settings::load("frelon.toml")?;
//! let line = SerialLine::new(transport, RegisterCatalog::default(), &settings);
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{FrelonError, Result};
use crate::error_recovery::RetryPolicy;

/// Top-level settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Serial port parameters for the real transport.
    pub serial: SerialSettings,
    /// Protocol and camera wait timeouts.
    pub timeouts: TimeoutSettings,
    /// Busy/fail write-retry policy.
    pub retry: RetryPolicy,
    /// Initial state of the register cache.
    pub cache_enabled: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            serial: SerialSettings::default(),
            timeouts: TimeoutSettings::default(),
            retry: RetryPolicy::default(),
            cache_enabled: true,
        }
    }
}

/// Serial port parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialSettings {
    /// Port name (e.g., "/dev/ttyS0", "COM3")
    pub port: String,
    /// Communication speed
    pub baud_rate: u32,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            port: "/dev/ttyS0".to_string(),
            baud_rate: 9600,
        }
    }
}

/// Timeouts used by the protocol engine and the camera facade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutSettings {
    /// Default timeout for a single-line reply.
    #[serde(with = "humantime_serde")]
    pub normal: Duration,
    /// Per-line timeout while accumulating a multi-line reply.
    #[serde(with = "humantime_serde")]
    pub single_line: Duration,
    /// Overall bound of a multi-line reply.
    #[serde(with = "humantime_serde")]
    pub multi_line: Duration,
    /// Reset replies wait `reset_factor` times the normal timeout.
    pub reset_factor: u32,
    /// Wait after a frame-grabber link reset.
    #[serde(with = "humantime_serde")]
    pub reset_link_wait: Duration,
    /// Wait for the CCD status byte to reach the frame grabber.
    #[serde(with = "humantime_serde")]
    pub update_ccd_status: Duration,
    /// Maximum wait for the camera to become idle.
    #[serde(with = "humantime_serde")]
    pub max_idle_wait: Duration,
    /// Default timeout of a sequencer timing measurement.
    #[serde(with = "humantime_serde")]
    pub measure: Duration,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            normal: Duration::from_secs(2),
            single_line: Duration::from_millis(500),
            multi_line: Duration::from_secs(3),
            reset_factor: 5,
            reset_link_wait: Duration::from_secs(5),
            update_ccd_status: Duration::from_millis(100),
            max_idle_wait: Duration::from_millis(2500),
            measure: Duration::from_secs(5),
        }
    }
}

impl TimeoutSettings {
    /// Reply timeout for a reset command.
    pub fn reset(&self) -> Duration {
        self.normal * self.reset_factor
    }
}

impl Settings {
    /// Load settings from a TOML file, overridden by `FRELON__*` variables.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let s = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(config::Environment::with_prefix("FRELON").separator("__"))
            .build()?;

        let settings: Settings = s.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Parse settings from an in-memory TOML document.
    pub fn from_toml_str(toml: &str) -> Result<Self> {
        let s = config::Config::builder()
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()?;

        let settings: Settings = s.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reject values that would make the protocol engine unusable.
    pub fn validate(&self) -> Result<()> {
        if self.serial.baud_rate == 0 {
            return Err(FrelonError::Configuration(
                "serial.baud_rate must be positive".into(),
            ));
        }
        let t = &self.timeouts;
        if t.normal.is_zero() || t.single_line.is_zero() || t.multi_line.is_zero() {
            return Err(FrelonError::Configuration(
                "protocol timeouts must be non-zero".into(),
            ));
        }
        if t.single_line > t.multi_line {
            return Err(FrelonError::Configuration(format!(
                "timeouts.single_line ({:?}) exceeds timeouts.multi_line ({:?})",
                t.single_line, t.multi_line
            )));
        }
        if t.reset_factor == 0 {
            return Err(FrelonError::Configuration(
                "timeouts.reset_factor must be at least 1".into(),
            ));
        }
        if self.retry.fail_retries == 0 {
            return Err(FrelonError::Configuration(
                "retry.fail_retries must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.timeouts.reset(), Duration::from_secs(10));
        assert_eq!(settings.retry.busy_budget, Duration::from_millis(200));
        assert!(settings.cache_enabled);
    }

    #[test]
    fn test_from_toml_str() {
        let settings = Settings::from_toml_str(
            r#"
            cache_enabled = false

            [serial]
            port = "/dev/ttyUSB1"

            [timeouts]
            normal = "1s"
            multi_line = "250ms"
            single_line = "50ms"

            [retry]
            busy_budget = "400ms"
            "#,
        )
        .unwrap();

        assert!(!settings.cache_enabled);
        assert_eq!(settings.serial.port, "/dev/ttyUSB1");
        assert_eq!(settings.serial.baud_rate, 9600);
        assert_eq!(settings.timeouts.normal, Duration::from_secs(1));
        assert_eq!(settings.timeouts.multi_line, Duration::from_millis(250));
        assert_eq!(settings.retry.busy_budget, Duration::from_millis(400));
        assert_eq!(settings.retry.fail_retries, 1);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[serial]\nbaud_rate = 115200").unwrap();

        let settings = Settings::load(file.path()).unwrap();
        assert_eq!(settings.serial.baud_rate, 115200);
        assert_eq!(settings.timeouts, TimeoutSettings::default());
    }

    #[test]
    fn test_validation_rejects_inverted_timeouts() {
        let err = Settings::from_toml_str(
            r#"
            [timeouts]
            single_line = "5s"
            multi_line = "1s"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, FrelonError::Configuration(_)));
    }
}
