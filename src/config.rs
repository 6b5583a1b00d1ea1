use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    // Paths
    pub data_dir: PathBuf,
    pub cache_dir: PathBuf,

    // Audio
    pub default_volume: f32,
    pub max_queue_size: usize,
    pub max_playlist_size: usize,

    // Descargas
    pub download_retries: u32,
    pub retry_backoff_secs: u64,

    // Control de reproducción
    pub skip_threshold: usize,

    // Features
    pub enable_autoplaylist: bool,
    pub autoplaylist_file: PathBuf,
    pub karaoke_default: bool,
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            // Paths
            data_dir: std::env::var("DATA_DIR")
                .unwrap_or_else(|_| "data".to_string())
                .into(),
            cache_dir: std::env::var("CACHE_DIR")
                .unwrap_or_else(|_| "audio_cache".to_string())
                .into(),

            // Audio
            default_volume: std::env::var("DEFAULT_VOLUME")
                .unwrap_or_else(|_| "0.5".to_string())
                .parse()?,
            max_queue_size: std::env::var("MAX_QUEUE_SIZE")
                .unwrap_or_else(|_| "1000".to_string())
                .parse()?,
            max_playlist_size: std::env::var("MAX_PLAYLIST_SIZE")
                .unwrap_or_else(|_| "100".to_string())
                .parse()?,

            // Descargas: reintentos solo para transferencias truncadas
            download_retries: std::env::var("DOWNLOAD_RETRIES")
                .unwrap_or_else(|_| "2".to_string())
                .parse()?,
            retry_backoff_secs: std::env::var("RETRY_BACKOFF_SECS")
                .unwrap_or_else(|_| "1".to_string())
                .parse()?,

            // Control de reproducción
            skip_threshold: std::env::var("SKIP_THRESHOLD")
                .unwrap_or_else(|_| "3".to_string())
                .parse()?,

            // Features
            enable_autoplaylist: std::env::var("ENABLE_AUTOPLAYLIST")
                .unwrap_or_else(|_| "false".to_string())
                .parse()?,
            autoplaylist_file: std::env::var("AUTOPLAYLIST_FILE")
                .unwrap_or_else(|_| "data/autoplaylist.txt".to_string())
                .into(),
            karaoke_default: std::env::var("KARAOKE_DEFAULT")
                .unwrap_or_else(|_| "false".to_string())
                .parse()?,
        };

        // Create directories if they don't exist
        std::fs::create_dir_all(&config.data_dir)?;
        std::fs::create_dir_all(&config.cache_dir)?;

        // Validate configuration before returning
        config.validate()?;

        Ok(config)
    }

    /// Validates configuration values for correctness.
    ///
    /// Performs sanity checks on configuration values to catch
    /// common mistakes before any session is created.
    ///
    /// # Validation Rules
    ///
    /// - Volume must be between 0.0 and 1.0
    /// - Queue and playlist caps must be greater than 0
    /// - The skip threshold must be at least 1
    pub fn validate(&self) -> Result<()> {
        if self.default_volume < 0.0 || self.default_volume > 1.0 {
            anyhow::bail!(
                "Default volume must be between 0.0 and 1.0, got: {}",
                self.default_volume
            );
        }

        if self.max_queue_size == 0 {
            anyhow::bail!("Max queue size must be greater than 0");
        }

        if self.max_playlist_size == 0 {
            anyhow::bail!("Max playlist size must be greater than 0");
        }

        if self.skip_threshold == 0 {
            anyhow::bail!("Skip threshold must be at least 1");
        }

        Ok(())
    }

    /// Pausa fija entre reintentos de descarga
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_secs(self.retry_backoff_secs)
    }

    /// Returns a summary of the current configuration for logging.
    pub fn summary(&self) -> String {
        format!(
            "Config Summary:\n  \
            Paths: data={} cache={}\n  \
            Audio: {}% vol, {} queue, {} playlist cap\n  \
            Downloads: {} retries, {}s backoff\n  \
            Skip: {} votes\n  \
            Features: autoplaylist={}, karaoke={}",
            self.data_dir.display(),
            self.cache_dir.display(),
            (self.default_volume * 100.0) as u32,
            self.max_queue_size,
            self.max_playlist_size,
            self.download_retries,
            self.retry_backoff_secs,
            self.skip_threshold,
            self.enable_autoplaylist,
            self.karaoke_default
        )
    }
}

/// Default configuration values.
///
/// Used as fallbacks when environment variables are not provided.
impl Default for Config {
    fn default() -> Self {
        Self {
            // Path defaults
            data_dir: "data".into(),
            cache_dir: "audio_cache".into(),

            // Audio defaults
            default_volume: 0.5,
            max_queue_size: 1000,
            max_playlist_size: 100,

            // Download defaults: 2 reintentos (3 intentos en total)
            download_retries: 2,
            retry_backoff_secs: 1,

            // Skip defaults
            skip_threshold: 3,

            // Feature defaults
            enable_autoplaylist: false,
            autoplaylist_file: "data/autoplaylist.txt".into(),
            karaoke_default: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_volume() {
        let config = Config {
            default_volume: 1.5,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_threshold() {
        let config = Config {
            skip_threshold: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }
}
