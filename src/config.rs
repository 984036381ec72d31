use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::storage::cache::CacheLevel;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    // Paths
    pub data_dir: PathBuf,
    pub node_dir: PathBuf,

    // Caché local
    pub cache_age_days: u32,
    pub cache_level: CacheLevel,
    pub storage_workers: u32,

    // Nodo de audio
    pub use_external_node: bool,
    pub node_host: String,
    pub node_rest_port: u16,
    pub node_ws_port: u16,
    pub node_password: String,
    pub node_connect_timeout: u64, // En segundos
    pub node_release: String,
    pub node_download_url: String,
    pub node_start_retries: u32,
    pub node_download_retries: u32,
    pub bot_user_id: u64,

    // Runtime del nodo
    pub java_path: String,
    pub java_xms: String,
    pub java_xmx: Option<String>,

    // Reproducción
    pub max_consecutive_errors: u32,
    pub error_window_secs: u64,
    pub max_queue_size: usize,
    pub default_volume: u16,
    pub status_updates: bool,

    // Valores por defecto de cada sala
    pub auto_play: bool,
    pub autoplay_fallback: String,
    pub notify: bool,
    pub disconnect_on_queue_end: bool,
    pub emptydc_enabled: bool,
    pub emptydc_timer: u64,    // En segundos
    pub emptypause_enabled: bool,
    pub emptypause_timer: u64, // En segundos
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();
        let defaults = Self::default();

        let config = Self {
            // Paths
            data_dir: env_or("DATA_DIR", "/app/data").into(),
            node_dir: env_or("NODE_DIR", "/app/data/node").into(),

            // Caché
            cache_age_days: env_or("CACHE_AGE_DAYS", "365").parse()?,
            cache_level: CacheLevel::from_bits(env_or("CACHE_LEVEL", "7").parse()?),
            storage_workers: match std::env::var("STORAGE_WORKERS") {
                Ok(val) if !val.trim().is_empty() => val.parse()?,
                _ => defaults.storage_workers,
            },

            // Nodo
            use_external_node: env_or("USE_EXTERNAL_NODE", "false").parse()?,
            node_host: env_or("NODE_HOST", "localhost"),
            node_rest_port: env_or("NODE_REST_PORT", "2333").parse()?,
            node_ws_port: env_or("NODE_WS_PORT", "2333").parse()?,
            node_password: env_or("NODE_PASSWORD", "youshallnotpass"),
            node_connect_timeout: env_or("NODE_CONNECT_TIMEOUT", "50").parse()?,
            node_release: env_or("NODE_RELEASE", &defaults.node_release),
            node_download_url: env_or("NODE_DOWNLOAD_URL", &defaults.node_download_url),
            node_start_retries: env_or("NODE_START_RETRIES", "5").parse()?,
            node_download_retries: env_or("NODE_DOWNLOAD_RETRIES", "5").parse()?,
            bot_user_id: env_or("BOT_USER_ID", "0").parse()?,

            // Runtime
            java_path: env_or("JAVA_PATH", "java"),
            java_xms: env_or("JAVA_XMS", "64M"),
            java_xmx: std::env::var("JAVA_XMX")
                .ok()
                .filter(|s| !s.trim().is_empty()),

            // Reproducción
            max_consecutive_errors: env_or("MAX_CONSECUTIVE_ERRORS", "5").parse()?,
            error_window_secs: env_or("ERROR_WINDOW_SECS", "10").parse()?,
            max_queue_size: env_or("MAX_QUEUE_SIZE", "1000").parse()?,
            default_volume: env_or("DEFAULT_VOLUME", "100").parse()?,
            status_updates: env_or("STATUS_UPDATES", "false").parse()?,

            // Salas
            auto_play: env_or("AUTOPLAY", "false").parse()?,
            autoplay_fallback: env_or("AUTOPLAY_FALLBACK", &defaults.autoplay_fallback),
            notify: env_or("NOTIFY", "false").parse()?,
            disconnect_on_queue_end: env_or("DISCONNECT_ON_QUEUE_END", "false").parse()?,
            emptydc_enabled: env_or("EMPTYDC_ENABLED", "false").parse()?,
            emptydc_timer: env_or("EMPTYDC_TIMER", "0").parse()?,
            emptypause_enabled: env_or("EMPTYPAUSE_ENABLED", "false").parse()?,
            emptypause_timer: env_or("EMPTYPAUSE_TIMER", "0").parse()?,
        };

        // Create directories if they don't exist
        std::fs::create_dir_all(&config.data_dir)?;
        std::fs::create_dir_all(&config.node_dir)?;

        config.validate()?;

        Ok(config)
    }

    /// Validates configuration values for correctness.
    ///
    /// # Validation Rules
    ///
    /// - Ports must be non-zero
    /// - At least one storage worker
    /// - Error threshold must be at least 1
    /// - Volume between 0 and 1000 (node limit)
    /// - The external node mode needs a host to connect to
    pub fn validate(&self) -> Result<()> {
        if self.node_rest_port == 0 || self.node_ws_port == 0 {
            anyhow::bail!("Node ports must be greater than 0");
        }

        if self.storage_workers == 0 {
            anyhow::bail!("Storage workers must be greater than 0");
        }

        if self.max_consecutive_errors == 0 {
            anyhow::bail!("Max consecutive errors must be at least 1");
        }

        if self.default_volume > 1000 {
            anyhow::bail!("Default volume cannot exceed 1000, got: {}", self.default_volume);
        }

        if self.max_queue_size == 0 {
            anyhow::bail!("Max queue size must be greater than 0");
        }

        if self.use_external_node && self.node_host.trim().is_empty() {
            anyhow::bail!("External node mode requires NODE_HOST");
        }

        if self.node_connect_timeout == 0 {
            anyhow::bail!("Node connect timeout must be greater than 0");
        }

        Ok(())
    }

    pub fn cache_max_age(&self) -> Duration {
        Duration::from_secs(u64::from(self.cache_age_days) * 24 * 60 * 60)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.node_connect_timeout)
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("Audio.db")
    }

    /// Returns a summary of the current configuration for logging.
    ///
    /// Excludes the node password.
    pub fn summary(&self) -> String {
        format!(
            "Config Summary:\n  \
            Node: {} {}:{} (rest) / {} (ws), release {}\n  \
            Cache: {} max age, level {:?}, {} workers\n  \
            Errors: {} consecutive within {}\n  \
            Rooms: autoplay={}, notify={}, emptydc={} ({}s), emptypause={} ({}s)",
            if self.use_external_node { "external" } else { "managed" },
            self.node_host,
            self.node_rest_port,
            self.node_ws_port,
            self.node_release,
            humantime::format_duration(self.cache_max_age()),
            self.cache_level,
            self.storage_workers,
            self.max_consecutive_errors,
            humantime::format_duration(Duration::from_secs(self.error_window_secs)),
            self.auto_play,
            self.notify,
            self.emptydc_enabled,
            self.emptydc_timer,
            self.emptypause_enabled,
            self.emptypause_timer,
        )
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Default configuration values.
///
/// Used as fallbacks when environment variables are not provided.
impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: "/app/data".into(),
            node_dir: "/app/data/node".into(),

            cache_age_days: 365,
            cache_level: CacheLevel::all(),
            storage_workers: (num_cpus::get() as u32).clamp(1, 4),

            use_external_node: false,
            node_host: "localhost".to_string(),
            node_rest_port: 2333,
            node_ws_port: 2333,
            node_password: "youshallnotpass".to_string(),
            node_connect_timeout: 50,
            node_release: "4.0.8".to_string(),
            node_download_url:
                "https://github.com/lavalink-devs/Lavalink/releases/download/{release}/Lavalink.jar"
                    .to_string(),
            node_start_retries: 5,
            node_download_retries: 5,
            bot_user_id: 0,

            java_path: "java".to_string(),
            java_xms: "64M".to_string(),
            java_xmx: None,

            max_consecutive_errors: 5,
            error_window_secs: 10,
            max_queue_size: 1000,
            default_volume: 100,
            status_updates: false,

            auto_play: false,
            autoplay_fallback:
                "https://www.youtube.com/playlist?list=PL4fGSI1pDJn6puJdseH2Rt9sMvt9E2M4i"
                    .to_string(),
            notify: false,
            disconnect_on_queue_end: false,
            emptydc_enabled: false,
            emptydc_timer: 0,
            emptypause_enabled: false,
            emptypause_timer: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.cache_max_age(), Duration::from_secs(365 * 86_400));
    }

    #[test]
    fn rejects_zero_error_threshold() {
        let config = Config {
            max_consecutive_errors: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn summary_hides_password() {
        let config = Config {
            node_password: "super-secret".to_string(),
            ..Config::default()
        };
        assert!(!config.summary().contains("super-secret"));
    }
}
