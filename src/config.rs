use anyhow::{Context, Result};
use serde::Deserialize;
use std::time::Duration;

pub const ACCESS_TOKEN_ENV: &str = "ARCHYX_ACCESS_TOKEN";

#[derive(Debug, Clone, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    persistence: PersistenceConfig,
    backend: BackendConfig,
    #[serde(default)]
    realtime: RealtimeConfig,
    #[serde(default)]
    app: AppConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct PersistenceConfig {
    #[serde(default)]
    url: String,
    #[serde(default)]
    anon_key: String,
    access_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct BackendConfig {
    url: String,
    #[serde(default = "default_streaming")]
    streaming: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct RealtimeConfig {
    #[serde(default = "default_poll_interval_ms")]
    poll_interval_ms: u64,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct AppConfig {
    #[serde(default = "default_environment")]
    environment: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            environment: default_environment(),
        }
    }
}

fn default_streaming() -> bool {
    true
}

fn default_poll_interval_ms() -> u64 {
    2000
}

fn default_environment() -> String {
    "development".to_string()
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Empty means run offline against in-memory tables.
    pub persistence_url: String,
    pub anon_key: String,
    pub access_token: Option<String>,
    pub backend_url: String,
    pub streaming: bool,
    pub poll_interval: Duration,
    pub environment: String,
}

impl Config {
    pub fn parse(content: &str) -> Result<Self> {
        let config_file: ConfigFile =
            toml::from_str(content).context("Failed to parse config file")?;

        Ok(Self {
            persistence_url: config_file.persistence.url,
            anon_key: config_file.persistence.anon_key,
            access_token: config_file
                .persistence
                .access_token
                .filter(|t| !t.is_empty()),
            backend_url: config_file.backend.url,
            streaming: config_file.backend.streaming,
            poll_interval: Duration::from_millis(config_file.realtime.poll_interval_ms.max(100)),
            environment: config_file.app.environment,
        })
    }

    pub fn from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path))?;

        let mut config = Self::parse(&content)?;
        if let Ok(token) = std::env::var(ACCESS_TOKEN_ENV)
            && !token.is_empty()
        {
            config.access_token = Some(token);
        }
        Ok(config)
    }

    pub fn load() -> Result<Self> {
        let path = std::env::args()
            .nth(1)
            .unwrap_or_else(|| "config.toml".to_string());
        Self::from_file(&path)
    }

    pub fn is_offline(&self) -> bool {
        self.persistence_url.trim().is_empty()
    }

    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }

    /// Production only emits errors; elsewhere `RUST_LOG` wins, then `info`.
    pub fn log_filter(&self, rust_log: Option<String>) -> String {
        if self.is_production() {
            return "error".to_string();
        }
        rust_log
            .filter(|f| !f.trim().is_empty())
            .unwrap_or_else(|| "info".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
[persistence]
url = "https://xyz.supabase.co"
anon_key = "anon"
access_token = "jwt"

[backend]
url = "http://localhost:8000"
streaming = false

[realtime]
poll_interval_ms = 500

[app]
environment = "production"
"#;

    #[test]
    fn parses_all_sections() {
        let config = Config::parse(FULL).unwrap();
        assert_eq!(config.persistence_url, "https://xyz.supabase.co");
        assert_eq!(config.anon_key, "anon");
        assert_eq!(config.access_token.as_deref(), Some("jwt"));
        assert_eq!(config.backend_url, "http://localhost:8000");
        assert!(!config.streaming);
        assert_eq!(config.poll_interval, Duration::from_millis(500));
        assert!(config.is_production());
        assert!(!config.is_offline());
    }

    #[test]
    fn optional_sections_fall_back_to_defaults() {
        let config = Config::parse("[backend]\nurl = \"http://localhost:8000\"\n").unwrap();
        assert!(config.is_offline());
        assert!(config.streaming);
        assert_eq!(config.access_token, None);
        assert_eq!(config.poll_interval, Duration::from_secs(2));
        assert_eq!(config.environment, "development");
    }

    #[test]
    fn missing_backend_is_an_error() {
        assert!(Config::parse("[app]\nenvironment = \"development\"\n").is_err());
    }

    #[test]
    fn log_filter_follows_environment() {
        let production = Config::parse(FULL).unwrap();
        assert_eq!(production.log_filter(Some("debug".into())), "error");

        let development = Config::parse("[backend]\nurl = \"x\"\n").unwrap();
        assert_eq!(development.log_filter(Some("debug".into())), "debug");
        assert_eq!(development.log_filter(None), "info");
    }
}
