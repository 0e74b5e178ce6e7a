use crate::defaults;
use crate::error::{RelayError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub window: WindowConfig,
    pub engine: EngineConfig,
}

/// WebSocket listener configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Outbound messages buffered per connection
    pub outbound_buffer: usize,
}

/// Windowing and backlog configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WindowConfig {
    pub duration_ms: u32,
    pub max_queued_windows: usize,
    pub max_payload_samples: usize,
    /// Highest sample rate a client may declare
    pub max_sample_rate: u32,
    /// Highest channel count a client may declare
    pub max_channels: u16,
}

/// Separation engine configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Model used when `configure` does not name one
    pub default_model: String,
    /// Blocking inference workers shared by all connections
    pub workers: usize,
    /// Emit bass/drums/other as scaled copies of instrumental
    pub synthesize_stems: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: defaults::HOST.to_string(),
            port: defaults::PORT,
            outbound_buffer: defaults::OUTBOUND_BUFFER,
        }
    }
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            duration_ms: defaults::WINDOW_MS,
            max_queued_windows: defaults::MAX_QUEUED_WINDOWS,
            max_payload_samples: defaults::MAX_PAYLOAD_SAMPLES,
            max_sample_rate: defaults::MAX_SAMPLE_RATE,
            max_channels: defaults::MAX_CHANNELS,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_model: defaults::DEFAULT_MODEL.to_string(),
            workers: defaults::WORKERS,
            synthesize_stems: true,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Returns `RelayError::Config` if the file contains invalid TOML.
    /// Missing fields will use default values.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from a file or return defaults if file doesn't exist
    ///
    /// Only returns defaults if the file is missing.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        match Self::load(path) {
            Err(RelayError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            other => other,
        }
    }

    /// Apply environment variable overrides
    ///
    /// Supported environment variables:
    /// - STEMRELAY_HOST → server.host
    /// - STEMRELAY_PORT → server.port
    /// - STEMRELAY_MODEL → engine.default_model
    /// - STEMRELAY_WINDOW_MS → window.duration_ms
    ///
    /// Unparseable numeric values are ignored with a warning.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(host) = std::env::var("STEMRELAY_HOST")
            && !host.is_empty()
        {
            self.server.host = host;
        }

        if let Ok(port) = std::env::var("STEMRELAY_PORT")
            && !port.is_empty()
        {
            match port.parse() {
                Ok(port) => self.server.port = port,
                Err(_) => log::warn!("Ignoring STEMRELAY_PORT={port}: not a port number"),
            }
        }

        if let Ok(model) = std::env::var("STEMRELAY_MODEL")
            && !model.is_empty()
        {
            self.engine.default_model = model;
        }

        if let Ok(window) = std::env::var("STEMRELAY_WINDOW_MS")
            && !window.is_empty()
        {
            match window.parse() {
                Ok(ms) => self.window.duration_ms = ms,
                Err(_) => log::warn!("Ignoring STEMRELAY_WINDOW_MS={window}: not a number"),
            }
        }

        self
    }

    /// Reject values the server cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.server.host.trim().is_empty() {
            return Err(invalid("server.host", "must not be empty"));
        }
        if self.server.outbound_buffer == 0 {
            return Err(invalid("server.outbound_buffer", "must be at least 1"));
        }
        if self.window.duration_ms == 0 {
            return Err(invalid("window.duration_ms", "must be positive"));
        }
        if self.window.duration_ms > defaults::MAX_WINDOW_MS {
            return Err(invalid(
                "window.duration_ms",
                &format!("must be at most {}", defaults::MAX_WINDOW_MS),
            ));
        }
        if self.window.max_queued_windows == 0 {
            return Err(invalid("window.max_queued_windows", "must be at least 1"));
        }
        if self.window.max_payload_samples == 0 {
            return Err(invalid("window.max_payload_samples", "must be at least 1"));
        }
        if self.window.max_sample_rate == 0 {
            return Err(invalid("window.max_sample_rate", "must be positive"));
        }
        if self.window.max_channels == 0 {
            return Err(invalid("window.max_channels", "must be at least 1"));
        }
        if self.engine.workers == 0 {
            return Err(invalid("engine.workers", "must be at least 1"));
        }
        if self.engine.default_model.trim().is_empty() {
            return Err(invalid("engine.default_model", "must not be empty"));
        }
        Ok(())
    }

    /// Serialize the effective configuration as TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| RelayError::ConfigParse {
            message: e.to_string(),
        })
    }

    /// Get the default configuration file path
    ///
    /// Returns ~/.config/stemrelay/config.toml on Linux
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("stemrelay")
            .join("config.toml")
    }
}

fn invalid(key: &str, message: &str) -> RelayError {
    RelayError::ConfigInvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Mutex;
    use tempfile::NamedTempFile;

    // Mutex to serialize tests that modify environment variables
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    // SAFETY: These helpers are only used in tests with ENV_LOCK held,
    // ensuring no concurrent access to environment variables.
    fn set_env(key: &str, value: &str) {
        unsafe { std::env::set_var(key, value) }
    }

    fn remove_env(key: &str) {
        unsafe { std::env::remove_var(key) }
    }

    fn clear_stemrelay_env() {
        remove_env("STEMRELAY_HOST");
        remove_env("STEMRELAY_PORT");
        remove_env("STEMRELAY_MODEL");
        remove_env("STEMRELAY_WINDOW_MS");
    }

    #[test]
    fn test_default_config_has_correct_values() {
        let config = Config::default();

        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8765);
        assert_eq!(config.server.outbound_buffer, 256);

        assert_eq!(config.window.duration_ms, 100);
        assert_eq!(config.window.max_queued_windows, 32);
        assert_eq!(config.window.max_payload_samples, 1 << 20);

        assert_eq!(config.engine.default_model, "center-extract");
        assert_eq!(config.engine.workers, 2);
        assert!(config.engine.synthesize_stems);

        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_toml_file() {
        let toml_content = r#"
            [server]
            host = "0.0.0.0"
            port = 9000
            outbound_buffer = 64

            [window]
            duration_ms = 250
            max_queued_windows = 8
            max_payload_samples = 4096

            [engine]
            default_model = "band-split"
            workers = 4
            synthesize_stems = false
        "#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(toml_content.as_bytes()).unwrap();

        let config = Config::load(temp_file.path()).unwrap();

        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.outbound_buffer, 64);
        assert_eq!(config.window.duration_ms, 250);
        assert_eq!(config.window.max_queued_windows, 8);
        assert_eq!(config.window.max_payload_samples, 4096);
        assert_eq!(config.engine.default_model, "band-split");
        assert_eq!(config.engine.workers, 4);
        assert!(!config.engine.synthesize_stems);
    }

    #[test]
    fn test_load_partial_config_uses_defaults() {
        let toml_content = r#"
            [window]
            duration_ms = 500
        "#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(toml_content.as_bytes()).unwrap();

        let config = Config::load(temp_file.path()).unwrap();

        assert_eq!(config.window.duration_ms, 500);
        assert_eq!(config.window.max_queued_windows, 32);
        assert_eq!(config.server, ServerConfig::default());
        assert_eq!(config.engine, EngineConfig::default());
    }

    #[test]
    fn test_invalid_toml_returns_error() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(b"[server\nhost = \"broken").unwrap();

        assert!(matches!(
            Config::load(temp_file.path()),
            Err(RelayError::Config(_))
        ));
        assert!(Config::load_or_default(temp_file.path()).is_err());
    }

    #[test]
    fn test_load_or_default_returns_default_for_missing_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let missing = dir.path().join("missing.toml");
        let config = Config::load_or_default(&missing).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_env_override_host_and_model() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_stemrelay_env();

        set_env("STEMRELAY_HOST", "0.0.0.0");
        set_env("STEMRELAY_MODEL", "band-split");
        let config = Config::default().with_env_overrides();

        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.engine.default_model, "band-split");
        assert_eq!(config.server.port, 8765);

        clear_stemrelay_env();
    }

    #[test]
    fn test_env_override_numeric_values() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_stemrelay_env();

        set_env("STEMRELAY_PORT", "9100");
        set_env("STEMRELAY_WINDOW_MS", "40");
        let config = Config::default().with_env_overrides();

        assert_eq!(config.server.port, 9100);
        assert_eq!(config.window.duration_ms, 40);

        clear_stemrelay_env();
    }

    #[test]
    fn test_env_override_garbage_port_is_ignored() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_stemrelay_env();

        set_env("STEMRELAY_PORT", "not-a-port");
        let config = Config::default().with_env_overrides();
        assert_eq!(config.server.port, 8765);

        clear_stemrelay_env();
    }

    #[test]
    fn test_env_override_empty_string_ignored() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_stemrelay_env();

        set_env("STEMRELAY_MODEL", "");
        let config = Config::default().with_env_overrides();
        assert_eq!(config.engine.default_model, "center-extract");

        clear_stemrelay_env();
    }

    #[test]
    fn test_validate_rejects_zero_window() {
        let mut config = Config::default();
        config.window.duration_ms = 0;
        match config.validate() {
            Err(RelayError::ConfigInvalidValue { key, .. }) => {
                assert_eq!(key, "window.duration_ms");
            }
            other => panic!("Expected ConfigInvalidValue, got {:?}", other),
        }
    }

    #[test]
    fn test_validate_rejects_oversized_window() {
        let mut config = Config::default();
        config.window.duration_ms = defaults::MAX_WINDOW_MS + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_format_limits() {
        let mut config = Config::default();
        config.window.max_channels = 0;
        match config.validate() {
            Err(RelayError::ConfigInvalidValue { key, .. }) => {
                assert_eq!(key, "window.max_channels");
            }
            other => panic!("Expected ConfigInvalidValue, got {:?}", other),
        }
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        let mut config = Config::default();
        config.engine.workers = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_to_toml_round_trips_through_load() {
        let mut config = Config::default();
        config.server.port = 9999;
        config.engine.synthesize_stems = false;

        let text = config.to_toml().unwrap();
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(text.as_bytes()).unwrap();

        assert_eq!(Config::load(temp_file.path()).unwrap(), config);
    }

    #[test]
    fn test_default_path_ends_with_config_toml() {
        let path = Config::default_path();
        let path_str = path.to_string_lossy();
        assert!(path_str.contains("stemrelay"));
        assert!(path_str.ends_with("config.toml"));
    }
}
