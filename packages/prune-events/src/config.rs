//! Configuration for the coalescer.
//!
//! The configuration file supports JSONC format (JSON with comments).
//! Both single-line (`//`) and multi-line (`/* */`) comments are allowed.
//!
//! ```jsonc
//! {
//!     // Frames per second of the built-in frame ticker.
//!     "refreshRate": 120
//! }
//! ```

use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::constants::timing::{DEFAULT_REFRESH_RATE, MAX_REFRESH_RATE, MIN_REFRESH_RATE};
use crate::error::ConfigError;

/// Coalescer configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default, rename_all = "camelCase")]
pub struct CoalescerConfig {
    /// Refresh rate of the built-in frame ticker, in Hz.
    /// Clamped to 30–360 Hz when deriving the frame interval.
    /// Default: 60
    pub refresh_rate: f64,
}

impl Default for CoalescerConfig {
    fn default() -> Self { Self { refresh_rate: DEFAULT_REFRESH_RATE } }
}

impl CoalescerConfig {
    /// Parses a JSONC document.
    ///
    /// # Errors
    ///
    /// Returns an error if the document is not valid JSON once comments are
    /// stripped, or if it fails validation.
    pub fn from_jsonc_str(text: &str) -> Result<Self, ConfigError> {
        Self::from_reader(text.as_bytes())
    }

    /// Loads a JSONC configuration file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if it fails
    /// validation.
    pub fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        let file = File::open(path)?;
        let config = Self::from_reader(file)?;
        tracing::debug!(path = %path.display(), "loaded coalescer configuration");
        Ok(config)
    }

    fn from_reader(reader: impl Read) -> Result<Self, ConfigError> {
        let reader = json_comments::StripComments::new(reader);
        let config: Self = serde_json::from_reader(reader)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks that the configuration is usable.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidRefreshRate`] if the refresh rate is not
    /// a finite value greater than zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.refresh_rate.is_finite() || self.refresh_rate <= 0.0 {
            return Err(ConfigError::InvalidRefreshRate(self.refresh_rate));
        }
        Ok(())
    }

    /// Refresh rate actually used, clamped to the supported range.
    ///
    /// Falls back to the default when the configured value is unusable.
    #[must_use]
    pub fn effective_refresh_rate(&self) -> f64 {
        if self.validate().is_err() {
            return DEFAULT_REFRESH_RATE;
        }
        self.refresh_rate.clamp(MIN_REFRESH_RATE, MAX_REFRESH_RATE)
    }

    /// Time between two frames at the effective refresh rate.
    #[must_use]
    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.effective_refresh_rate())
    }

    /// JSON schema describing the configuration file.
    #[must_use]
    pub fn json_schema() -> serde_json::Value {
        serde_json::to_value(schemars::schema_for!(Self)).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_default_config() {
        let config = CoalescerConfig::default();
        assert!((config.refresh_rate - DEFAULT_REFRESH_RATE).abs() < f64::EPSILON);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_jsonc_with_comments() {
        let text = r#"
            {
                // High refresh display
                "refreshRate": 144 /* Hz */
            }
        "#;
        let config = CoalescerConfig::from_jsonc_str(text).unwrap();
        assert!((config.refresh_rate - 144.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_parse_empty_object_uses_defaults() {
        let config = CoalescerConfig::from_jsonc_str("{}").unwrap();
        assert_eq!(config, CoalescerConfig::default());
    }

    #[test]
    fn test_parse_rejects_invalid_json() {
        let result = CoalescerConfig::from_jsonc_str("{ refreshRate: }");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_parse_rejects_non_positive_refresh_rate() {
        let result = CoalescerConfig::from_jsonc_str(r#"{ "refreshRate": 0 }"#);
        assert!(matches!(result, Err(ConfigError::InvalidRefreshRate(_))));

        let result = CoalescerConfig::from_jsonc_str(r#"{ "refreshRate": -30 }"#);
        assert!(matches!(result, Err(ConfigError::InvalidRefreshRate(_))));
    }

    #[test]
    fn test_effective_refresh_rate_is_clamped() {
        let slow = CoalescerConfig { refresh_rate: 10.0 };
        let fast = CoalescerConfig { refresh_rate: 1000.0 };
        let broken = CoalescerConfig { refresh_rate: f64::NAN };

        assert!((slow.effective_refresh_rate() - MIN_REFRESH_RATE).abs() < f64::EPSILON);
        assert!((fast.effective_refresh_rate() - MAX_REFRESH_RATE).abs() < f64::EPSILON);
        assert!((broken.effective_refresh_rate() - DEFAULT_REFRESH_RATE).abs() < f64::EPSILON);
    }

    #[test]
    fn test_frame_interval_at_60hz() {
        let interval = CoalescerConfig::default().frame_interval();
        // 60 Hz ≈ 16.67ms
        assert!(interval.as_millis() >= 16 && interval.as_millis() <= 17);
    }

    #[test]
    fn test_load_from_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "{{\n  // comment\n  \"refreshRate\": 90\n}}").unwrap();

        let config = CoalescerConfig::load_from_path(file.path()).unwrap();
        assert!((config.refresh_rate - 90.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_load_from_missing_path() {
        let result = CoalescerConfig::load_from_path(Path::new("/nonexistent/prune-events.jsonc"));
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }

    #[test]
    fn test_json_schema_mentions_refresh_rate() {
        let schema = CoalescerConfig::json_schema();
        let properties = schema.get("properties").unwrap();
        assert!(properties.get("refreshRate").is_some());
    }
}
