use crate::bus::BusKind;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to find config directory")]
    NoConfigDir,

    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub bus: BusConfig,

    #[serde(default)]
    pub call: CallConfig,

    #[serde(default)]
    pub reactor: ReactorConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Where the shared buses listen.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct BusConfig {
    #[serde(default = "default_system_socket")]
    pub system_socket: PathBuf,

    #[serde(default = "default_session_socket")]
    pub session_socket: PathBuf,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            system_socket: default_system_socket(),
            session_socket: default_session_socket(),
        }
    }
}

fn default_system_socket() -> PathBuf {
    PathBuf::from("/run/busloop/system.sock")
}

fn default_session_socket() -> PathBuf {
    dirs::runtime_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("busloop")
        .join("session.sock")
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct CallConfig {
    /// Reply timeout used when a call does not set its own
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: default_timeout_ms(),
        }
    }
}

fn default_timeout_ms() -> u64 {
    25_000
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ReactorConfig {
    /// Stop a running loop on Ctrl+C
    #[serde(default = "default_true")]
    pub handle_sigint: bool,

    /// Readiness events collected per poll
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            handle_sigint: true,
            event_capacity: default_event_capacity(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_event_capacity() -> usize {
    64
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

impl Config {
    /// Get the config directory path
    pub fn config_dir() -> Result<PathBuf, ConfigError> {
        ProjectDirs::from("org", "busloop", "busloop")
            .map(|dirs| dirs.config_dir().to_path_buf())
            .ok_or(ConfigError::NoConfigDir)
    }

    /// Get the data directory path (for crash reports)
    pub fn data_dir() -> Result<PathBuf, ConfigError> {
        ProjectDirs::from("org", "busloop", "busloop")
            .map(|dirs| dirs.data_dir().to_path_buf())
            .ok_or(ConfigError::NoConfigDir)
    }

    /// Get the config file path
    pub fn config_path() -> Result<PathBuf, ConfigError> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load config from file, or create default if not exists
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load config from an explicit path, creating it with defaults if absent
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            let contents = fs::read_to_string(path)?;
            let config: Config = toml::from_str(&contents)?;
            config.validate()?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.call.default_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "call.default_timeout_ms must be positive".into(),
            ));
        }

        if self.reactor.event_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "reactor.event_capacity must be positive".into(),
            ));
        }

        for (name, path) in [
            ("bus.system_socket", &self.bus.system_socket),
            ("bus.session_socket", &self.bus.session_socket),
        ] {
            if !path.is_absolute() {
                return Err(ConfigError::ValidationError(format!(
                    "{} must be an absolute path, got '{}'",
                    name,
                    path.display()
                )));
            }
        }

        if !LOG_LEVELS.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "logging.level must be one of {}, got '{}'",
                LOG_LEVELS.join(", "),
                self.logging.level
            )));
        }

        Ok(())
    }

    /// Save config to file
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        // Create config directory if needed
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;

        info!("Config saved to: {}", path.display());
        Ok(())
    }

    /// Reply timeout for calls that do not set one.
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.call.default_timeout_ms)
    }

    /// Socket of the shared bus of `kind`.
    pub fn socket_path(&self, kind: BusKind) -> &Path {
        match kind {
            BusKind::System => &self.bus.system_socket,
            BusKind::Session => &self.bus.session_socket,
        }
    }
}

/// Show current configuration
pub fn show(path: Option<&Path>) -> anyhow::Result<()> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => Config::config_path()?,
    };
    let config = Config::load_from(&path)?;

    println!("Config file: {}\n", path.display());
    println!("{}", toml::to_string_pretty(&config)?);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    // ===================
    // Default Value Tests
    // ===================

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(
            config.bus.system_socket,
            PathBuf::from("/run/busloop/system.sock")
        );
        assert!(config.bus.session_socket.ends_with("busloop/session.sock"));
        assert_eq!(config.call.default_timeout_ms, 25_000);
        assert!(config.reactor.handle_sigint);
        assert_eq!(config.reactor.event_capacity, 64);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_default_timeout() {
        assert_eq!(Config::default().default_timeout(), Duration::from_secs(25));
    }

    #[test]
    fn test_socket_path_by_kind() {
        let config = Config::default();
        assert_eq!(
            config.socket_path(BusKind::System),
            Path::new("/run/busloop/system.sock")
        );
        assert_eq!(
            config.socket_path(BusKind::Session),
            config.bus.session_socket.as_path()
        );
    }

    // ===================
    // Parsing Tests
    // ===================

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [call]
            default_timeout_ms = 500
            "#,
        )
        .unwrap();
        assert_eq!(config.call.default_timeout_ms, 500);
        assert_eq!(config.reactor.event_capacity, 64);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_empty_config_parses() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_config_roundtrip() {
        let mut config = Config::default();
        config.reactor.handle_sigint = false;
        config.bus.system_socket = PathBuf::from("/tmp/system.sock");
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);
    }

    // ===================
    // Validation Tests
    // ===================

    #[test]
    fn test_rejects_zero_timeout() {
        let mut config = Config::default();
        config.call.default_timeout_ms = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("default_timeout_ms"));
    }

    #[test]
    fn test_rejects_zero_event_capacity() {
        let mut config = Config::default();
        config.reactor.event_capacity = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    fn test_rejects_relative_socket() {
        let mut config = Config::default();
        config.bus.session_socket = PathBuf::from("session.sock");
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("bus.session_socket"));
    }

    #[test]
    fn test_rejects_unknown_log_level() {
        let mut config = Config::default();
        config.logging.level = "loud".into();
        assert!(config.validate().is_err());

        config.logging.level = "DEBUG".into();
        assert!(config.validate().is_ok());
    }

    // ===================
    // File Tests
    // ===================

    #[test]
    fn test_load_from_missing_creates_default() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config, Config::default());
        assert!(path.exists());
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = Config::default();
        config.call.default_timeout_ms = 1234;
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.call.default_timeout_ms, 1234);
    }

    #[test]
    fn test_load_rejects_invalid_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[reactor]\nevent_capacity = 0\n").unwrap();

        assert!(matches!(
            Config::load_from(&path),
            Err(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    fn test_load_rejects_malformed_toml() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[call\n").unwrap();

        assert!(matches!(
            Config::load_from(&path),
            Err(ConfigError::ParseError(_))
        ));
    }
}
