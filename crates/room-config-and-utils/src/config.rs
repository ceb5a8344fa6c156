//! Client configuration.

use crate::{CoreError, CoreResult, Paths};
use serde::{Deserialize, Serialize};
use std::path::Path;
use url::Url;

/// Default backend URL (can be baked in at compile time via SUPABASE_URL).
pub const DEFAULT_SUPABASE_URL: &str = match option_env!("SUPABASE_URL") {
    Some(url) => url,
    None => "https://murmur-dev.supabase.co",
};

/// Default publishable key (can be baked in at compile time via SUPABASE_PUBLISHABLE_KEY).
pub const DEFAULT_SUPABASE_PUBLISHABLE_KEY: &str = match option_env!("SUPABASE_PUBLISHABLE_KEY") {
    Some(key) => key,
    None => "murmur-dev-publishable-key",
};

/// Edge function that mints media-session tokens.
pub const DEFAULT_MEDIA_TOKEN_FUNCTION: &str = "livekit-token";

/// Realtime heartbeat interval. The server drops sockets silent for 60s.
pub const DEFAULT_REALTIME_HEARTBEAT_SECS: u64 = 25;

/// Default log level.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Backend project URL.
    #[serde(default = "default_supabase_url")]
    pub supabase_url: String,
    /// Publishable API key (public, safe to expose).
    #[serde(default = "default_supabase_publishable_key")]
    pub supabase_publishable_key: String,
    /// Name of the function that issues media-session tokens.
    #[serde(default = "default_media_token_function")]
    pub media_token_function: String,
    /// Realtime socket heartbeat interval in seconds.
    #[serde(default = "default_realtime_heartbeat_secs")]
    pub realtime_heartbeat_secs: u64,
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_supabase_url() -> String {
    DEFAULT_SUPABASE_URL.to_string()
}

fn default_supabase_publishable_key() -> String {
    DEFAULT_SUPABASE_PUBLISHABLE_KEY.to_string()
}

fn default_media_token_function() -> String {
    DEFAULT_MEDIA_TOKEN_FUNCTION.to_string()
}

fn default_realtime_heartbeat_secs() -> u64 {
    DEFAULT_REALTIME_HEARTBEAT_SECS
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            supabase_url: default_supabase_url(),
            supabase_publishable_key: default_supabase_publishable_key(),
            media_token_function: default_media_token_function(),
            realtime_heartbeat_secs: DEFAULT_REALTIME_HEARTBEAT_SECS,
        }
    }
}

impl Config {
    /// Defaults, then environment overrides.
    pub fn new() -> Self {
        let mut config = Self::default();
        config.load_from_env();
        config
    }

    /// Load `config.json` from the base dir (defaults when missing), then
    /// apply environment overrides.
    pub fn load(paths: &Paths) -> CoreResult<Self> {
        let config_path = paths.config_file();

        let mut config = if config_path.exists() {
            Self::load_from_file(&config_path)?
        } else {
            Self::default()
        };

        config.load_from_env();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file.
    pub fn load_from_file(path: &Path) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to the base dir.
    pub fn save(&self, paths: &Paths) -> CoreResult<()> {
        paths.ensure_dirs()?;
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(paths.config_file(), content)?;
        Ok(())
    }

    fn load_from_env(&mut self) {
        if let Some(level) = env_var("MURMUR_LOG_LEVEL") {
            self.log_level = level;
        }
        if let Some(url) = env_var("MURMUR_SUPABASE_URL") {
            self.supabase_url = url;
        }
        if let Some(key) = env_var("MURMUR_SUPABASE_KEY") {
            self.supabase_publishable_key = key;
        }
        if let Some(function) = env_var("MURMUR_MEDIA_TOKEN_FUNCTION") {
            self.media_token_function = function;
        }
    }

    fn validate(&self) -> CoreResult<()> {
        self.supabase_url()?;
        if self.supabase_publishable_key.trim().is_empty() {
            return Err(CoreError::Config(
                "supabase_publishable_key must not be empty".to_string(),
            ));
        }
        if self.realtime_heartbeat_secs == 0 {
            return Err(CoreError::Config(
                "realtime_heartbeat_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// The backend URL, parsed.
    pub fn supabase_url(&self) -> CoreResult<Url> {
        Url::parse(&self.supabase_url).map_err(CoreError::from)
    }

    /// Websocket endpoint for realtime channels (`wss://<host>/realtime/v1/websocket`).
    pub fn realtime_url(&self) -> CoreResult<Url> {
        let mut url = self.supabase_url()?;
        let scheme = match url.scheme() {
            "https" => "wss",
            "http" => "ws",
            other => {
                return Err(CoreError::Config(format!(
                    "unsupported supabase_url scheme: {other}"
                )))
            }
        };
        url.set_scheme(scheme)
            .map_err(|_| CoreError::Config(format!("cannot switch scheme to {scheme}")))?;
        url.set_path("/realtime/v1/websocket");
        url.query_pairs_mut()
            .clear()
            .append_pair("apikey", &self.supabase_publishable_key)
            .append_pair("vsn", "1.0.0");
        Ok(url)
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|raw| raw.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.log_level, DEFAULT_LOG_LEVEL);
        assert_eq!(config.supabase_url, DEFAULT_SUPABASE_URL);
        assert_eq!(config.media_token_function, DEFAULT_MEDIA_TOKEN_FUNCTION);
        assert_eq!(config.realtime_heartbeat_secs, DEFAULT_REALTIME_HEARTBEAT_SECS);
    }

    #[test]
    fn test_config_load_from_file_fills_missing_fields() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("config.json");

        std::fs::write(&config_path, r#"{ "log_level": "debug" }"#).unwrap();

        let config = Config::load_from_file(&config_path).unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.supabase_url, DEFAULT_SUPABASE_URL);
        assert_eq!(config.media_token_function, DEFAULT_MEDIA_TOKEN_FUNCTION);
    }

    #[test]
    fn test_config_save_and_load() {
        let dir = tempdir().unwrap();
        let paths = Paths::with_base_dir(dir.path().to_path_buf());

        let mut config = Config::default();
        config.media_token_function = "media-token".to_string();
        config.realtime_heartbeat_secs = 10;
        config.save(&paths).unwrap();

        let loaded = Config::load(&paths).unwrap();
        assert_eq!(loaded.media_token_function, "media-token");
        assert_eq!(loaded.realtime_heartbeat_secs, 10);
    }

    #[test]
    fn test_config_load_nonexistent_uses_defaults() {
        let dir = tempdir().unwrap();
        let paths = Paths::with_base_dir(dir.path().to_path_buf());

        let config = Config::load(&paths).unwrap();
        assert_eq!(config.supabase_publishable_key, DEFAULT_SUPABASE_PUBLISHABLE_KEY);
    }

    #[test]
    fn test_config_rejects_zero_heartbeat() {
        let dir = tempdir().unwrap();
        let paths = Paths::with_base_dir(dir.path().to_path_buf());
        std::fs::write(paths.config_file(), r#"{ "realtime_heartbeat_secs": 0 }"#).unwrap();

        assert!(matches!(Config::load(&paths), Err(CoreError::Config(_))));
    }

    #[test]
    fn test_config_invalid_url() {
        let mut config = Config::default();
        config.supabase_url = "not a valid url".to_string();
        assert!(config.supabase_url().is_err());
    }

    #[test]
    fn test_realtime_url_switches_scheme_and_path() {
        let mut config = Config::default();
        config.supabase_url = "https://abc.supabase.co".to_string();
        config.supabase_publishable_key = "pk".to_string();

        let url = config.realtime_url().unwrap();
        assert_eq!(url.scheme(), "wss");
        assert_eq!(url.path(), "/realtime/v1/websocket");
        assert_eq!(url.query(), Some("apikey=pk&vsn=1.0.0"));
    }

    #[test]
    fn test_realtime_url_plain_http() {
        let mut config = Config::default();
        config.supabase_url = "http://localhost:54321".to_string();

        let url = config.realtime_url().unwrap();
        assert_eq!(url.scheme(), "ws");
        assert_eq!(url.port(), Some(54321));
    }
}
