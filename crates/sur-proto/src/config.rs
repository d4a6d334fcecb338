use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::platform;

/// Environment variable that overrides `server.base_url`.
pub const API_URL_ENV: &str = "SUR_API_URL";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub paths: PathsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Upper bound for upload, status and stem requests.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_health_interval_secs")]
    pub health_interval_secs: u64,
    /// Upper bound for a single health probe.
    #[serde(default = "default_health_timeout_ms")]
    pub health_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    #[serde(default = "default_max_size_bytes")]
    pub max_size_bytes: u64,
    #[serde(default = "default_supported_extensions")]
    pub supported_extensions: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub interval_ms: u64,
}

/// User-configurable paths for exported stems.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Directory exported stems are written to, one sub-folder per job.
    /// Defaults to `~/sur-stems`.
    #[serde(default = "default_downloads_dir")]
    pub downloads_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            request_timeout_ms: default_request_timeout_ms(),
            health_interval_secs: default_health_interval_secs(),
            health_timeout_ms: default_health_timeout_ms(),
        }
    }
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs.max(1))
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_millis(self.health_timeout_ms)
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_size_bytes: default_max_size_bytes(),
            supported_extensions: default_supported_extensions(),
        }
    }
}

impl UploadConfig {
    /// Extensions lower-cased with a leading dot, empty entries dropped.
    pub fn normalized_extensions(&self) -> Vec<String> {
        self.supported_extensions
            .iter()
            .map(|ext| ext.trim().to_lowercase())
            .filter(|ext| !ext.is_empty() && ext != ".")
            .map(|ext| {
                if ext.starts_with('.') {
                    ext
                } else {
                    format!(".{}", ext)
                }
            })
            .collect()
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_poll_interval_ms(),
        }
    }
}

impl PollingConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            downloads_dir: default_downloads_dir(),
        }
    }
}

fn default_base_url() -> String {
    "http://localhost:5001".to_string()
}

fn default_request_timeout_ms() -> u64 {
    300_000
}

fn default_health_interval_secs() -> u64 {
    5
}

fn default_health_timeout_ms() -> u64 {
    4_000
}

fn default_max_size_bytes() -> u64 {
    30 * 1024 * 1024
}

fn default_supported_extensions() -> Vec<String> {
    [".mp3", ".wav", ".flac", ".m4a", ".ogg"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_poll_interval_ms() -> u64 {
    2_000
}

fn default_downloads_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("sur-stems")
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            let config = Self::default();
            config.save()?;
            return Ok(config);
        }

        let content = std::fs::read_to_string(&config_path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(content)?;
        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let config_path = Self::config_path();
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        platform::config_dir().join("config.toml")
    }

    /// Apply `SUR_API_URL` and then an explicit override (the `--server` flag),
    /// the latter winning.
    pub fn with_overrides(mut self, server: Option<&str>) -> Self {
        if let Ok(url) = std::env::var(API_URL_ENV) {
            if !url.trim().is_empty() {
                self.server.base_url = url;
            }
        }
        if let Some(url) = server {
            self.server.base_url = url.to_string();
        }
        self.server.base_url = self.server.base_url.trim().trim_end_matches('/').to_string();
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            upload: UploadConfig::default(),
            polling: PollingConfig::default(),
            paths: PathsConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.base_url, "http://localhost:5001");
        assert_eq!(config.server.request_timeout(), Duration::from_secs(300));
        assert_eq!(config.server.health_interval(), Duration::from_secs(5));
        assert_eq!(config.upload.max_size_bytes, 31_457_280);
        assert_eq!(config.polling.interval(), Duration::from_secs(2));
        assert!(config.paths.downloads_dir.ends_with("sur-stems"));
    }

    #[test]
    fn partial_file_falls_back_to_defaults() {
        let config = Config::from_toml_str(
            r#"
            [server]
            base_url = "http://separator.lan:8000"

            [polling]
            interval_ms = 500
            "#,
        )
        .unwrap();
        assert_eq!(config.server.base_url, "http://separator.lan:8000");
        assert_eq!(config.server.request_timeout_ms, 300_000);
        assert_eq!(config.polling.interval_ms, 500);
        assert_eq!(config.upload.supported_extensions.len(), 5);
    }

    #[test]
    fn extensions_are_normalized() {
        let upload = UploadConfig {
            max_size_bytes: 1,
            supported_extensions: vec!["MP3".into(), ".Wav".into(), " ".into(), "flac ".into()],
        };
        assert_eq!(upload.normalized_extensions(), vec![".mp3", ".wav", ".flac"]);
    }

    #[test]
    fn explicit_server_override_wins_and_is_trimmed() {
        let config = Config::default().with_overrides(Some("http://10.0.0.2:5001/"));
        assert_eq!(config.server.base_url, "http://10.0.0.2:5001");
    }

    #[test]
    fn round_trips_through_toml() {
        let config = Config::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let back = Config::from_toml_str(&text).unwrap();
        assert_eq!(back.server.base_url, config.server.base_url);
        assert_eq!(back.upload.supported_extensions, config.upload.supported_extensions);
    }
}
