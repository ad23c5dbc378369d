//! Configuration loading — TOML file with environment variable overrides.
//!
//! Looks for `rulehub.toml` in the working directory. Every field has a
//! sensible default so the file is optional. Environment variables take
//! precedence over file values.

use serde::Deserialize;

/// Top-level configuration.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Engine settings.
    pub engine: EngineSection,
    /// Logging settings.
    pub logging: LoggingConfig,
}

/// Engine settings.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    /// Namespace used to qualify bare ids (`rules.0`).
    pub namespace: String,
    /// Geographic latitude for astro schedules.
    pub latitude: Option<f64>,
    /// Geographic longitude for astro schedules.
    pub longitude: Option<f64>,
    /// Whether the store pushes every state unconditionally.
    pub cache_all: bool,
}

/// Logging configuration.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive (`RUST_LOG` syntax).
    pub filter: String,
}

impl Config {
    /// Load configuration from `rulehub.toml` (if present) then apply
    /// environment-variable overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML file exists but is malformed, or
    /// the result fails validation.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::from_file("rulehub.toml")?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(content) => toml::from_str(&content).map_err(ConfigError::Parse),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(err) => Err(ConfigError::Io(err)),
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("RULEHUB_NAMESPACE") {
            self.engine.namespace = val;
        }
        if let Ok(val) = std::env::var("RULEHUB_LATITUDE") {
            if let Ok(latitude) = val.parse() {
                self.engine.latitude = Some(latitude);
            }
        }
        if let Ok(val) = std::env::var("RULEHUB_LONGITUDE") {
            if let Ok(longitude) = val.parse() {
                self.engine.longitude = Some(longitude);
            }
        }
        if let Ok(val) = std::env::var("RULEHUB_LOG") {
            self.logging.filter = val;
        }
        if let Ok(val) = std::env::var("RUST_LOG") {
            self.logging.filter = val;
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.engine.namespace.is_empty() {
            return Err(ConfigError::Validation(
                "namespace must not be empty".to_string(),
            ));
        }
        match (self.engine.latitude, self.engine.longitude) {
            (Some(latitude), _) if !(-90.0..=90.0).contains(&latitude) => Err(
                ConfigError::Validation(format!("latitude {latitude} out of range")),
            ),
            (_, Some(longitude)) if !(-180.0..=180.0).contains(&longitude) => Err(
                ConfigError::Validation(format!("longitude {longitude} out of range")),
            ),
            (Some(_), None) | (None, Some(_)) => Err(ConfigError::Validation(
                "latitude and longitude must be configured together".to_string(),
            )),
            _ => Ok(()),
        }
    }

    /// Engine-level settings derived from this configuration.
    #[must_use]
    pub fn engine_config(&self) -> rulehub_engine::EngineConfig {
        rulehub_engine::EngineConfig {
            namespace: self.engine.namespace.clone(),
            latitude: self.engine.latitude,
            longitude: self.engine.longitude,
            cache_all: self.engine.cache_all,
        }
    }
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            namespace: "rules.0".to_string(),
            latitude: None,
            longitude: None,
            cache_all: true,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "rulehubd=info,rulehub=info".to_string(),
        }
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// TOML parse failure.
    #[error("failed to parse config file")]
    Parse(#[from] toml::de::Error),
    /// File I/O failure.
    #[error("failed to read config file")]
    Io(#[from] std::io::Error),
    /// Semantic validation failure.
    #[error("invalid configuration: {0}")]
    Validation(String),
}
