//! Configuration loader

use std::path::Path;

use courier_utils::{config_file, CourierError, Result};

use super::{AppConfig, SessionConfig};

/// Configuration loader
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from default location
    pub fn load() -> Result<AppConfig> {
        let path = config_file();
        if path.exists() {
            Self::load_from_path(&path)
        } else {
            Ok(AppConfig::default())
        }
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<AppConfig> {
        if !path.exists() {
            return Err(CourierError::ConfigNotFound(path.to_path_buf()));
        }

        let content = std::fs::read_to_string(path).map_err(|e| CourierError::FileRead {
            path: path.to_path_buf(),
            source: e,
        })?;

        Self::parse(&content, path)
    }

    /// Parse configuration from string
    pub fn parse(content: &str, path: &Path) -> Result<AppConfig> {
        toml::from_str(content).map_err(|e| CourierError::ConfigInvalid {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Validate configuration
    pub fn validate(config: &AppConfig) -> Result<()> {
        if config.server.listen_addr.trim().is_empty() {
            return Err(CourierError::config("server.listen_addr must not be empty"));
        }

        let capacity = config.session.send_queue_capacity;
        if !(SessionConfig::MIN_QUEUE_CAPACITY..=SessionConfig::MAX_QUEUE_CAPACITY)
            .contains(&capacity)
        {
            return Err(CourierError::config(format!(
                "send_queue_capacity must be between {} and {}",
                SessionConfig::MIN_QUEUE_CAPACITY,
                SessionConfig::MAX_QUEUE_CAPACITY
            )));
        }

        if config.session.close_flush_timeout_ms > SessionConfig::MAX_FLUSH_TIMEOUT_MS {
            return Err(CourierError::config(format!(
                "close_flush_timeout_ms must be at most {}",
                SessionConfig::MAX_FLUSH_TIMEOUT_MS
            )));
        }

        if config.stats.enabled && config.stats.listen_addr.trim().is_empty() {
            return Err(CourierError::config("stats.listen_addr must not be empty"));
        }

        Ok(())
    }

    /// Load and validate
    pub fn load_and_validate() -> Result<AppConfig> {
        let config = Self::load()?;
        Self::validate(&config)?;
        Ok(config)
    }

    /// Load from an explicit path and validate
    pub fn load_path_and_validate(path: &Path) -> Result<AppConfig> {
        let config = Self::load_from_path(path)?;
        Self::validate(&config)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_load_missing_file() {
        let config = ConfigLoader::load();
        assert!(config.is_ok());
    }

    #[test]
    fn test_load_from_path() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");

        std::fs::write(
            &path,
            r#"
            [server]
            listen_addr = "127.0.0.1:7600"

            [session]
            close_flush_timeout_ms = 50
            "#,
        )
        .unwrap();

        let config = ConfigLoader::load_from_path(&path).unwrap();
        assert_eq!(config.server.listen_addr, "127.0.0.1:7600");
        assert_eq!(config.session.close_flush_timeout_ms, 50);
        assert_eq!(config.session.send_queue_capacity, 256);
    }

    #[test]
    fn test_load_explicit_missing_path() {
        let dir = tempdir().unwrap();
        let result = ConfigLoader::load_from_path(&dir.path().join("absent.toml"));
        assert!(matches!(result, Err(CourierError::ConfigNotFound(_))));
    }

    #[test]
    fn test_validate_defaults() {
        assert!(ConfigLoader::validate(&AppConfig::default()).is_ok());
    }

    #[test]
    fn test_validate_invalid_capacity() {
        let mut config = AppConfig::default();
        config.session.send_queue_capacity = 0;
        assert!(ConfigLoader::validate(&config).is_err());

        config.session.send_queue_capacity = SessionConfig::MAX_QUEUE_CAPACITY + 1;
        assert!(ConfigLoader::validate(&config).is_err());
    }

    #[test]
    fn test_validate_flush_timeout() {
        let mut config = AppConfig::default();
        config.session.close_flush_timeout_ms = SessionConfig::MAX_FLUSH_TIMEOUT_MS + 1;
        assert!(ConfigLoader::validate(&config).is_err());
    }

    #[test]
    fn test_validate_empty_addresses() {
        let mut config = AppConfig::default();
        config.server.listen_addr = "  ".into();
        assert!(ConfigLoader::validate(&config).is_err());

        let mut config = AppConfig::default();
        config.stats.listen_addr = String::new();
        assert!(ConfigLoader::validate(&config).is_err());

        // Unused when the endpoint is disabled
        config.stats.enabled = false;
        assert!(ConfigLoader::validate(&config).is_ok());
    }

    #[test]
    fn test_parse_invalid_toml() {
        let result = ConfigLoader::parse("invalid { toml", Path::new("test.toml"));
        assert!(matches!(result, Err(CourierError::ConfigInvalid { .. })));
    }

    #[test]
    fn test_load_path_and_validate_rejects_bad_values() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[session]\nsend_queue_capacity = 0\n").unwrap();

        assert!(ConfigLoader::load_path_and_validate(&path).is_err());
    }
}
