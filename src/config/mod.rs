pub mod validation;

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::widget::WidgetParsePolicy;

use self::validation::validate_config;

/// Error type for configuration loading and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Config validation error: {0}")]
    Validation(String),
}

/// Chat backend connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    pub base_url: String,
    #[serde(default = "default_chat_path")]
    pub chat_path: String,
    /// Literal bearer token. Takes precedence over `token_env`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Environment variable the bearer token is read from on every request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_env: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<String>,
    #[serde(default)]
    pub use_env_proxy: bool,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,
    #[serde(default = "default_pool_idle_timeout_secs")]
    pub pool_idle_timeout_secs: u64,
}

fn default_chat_path() -> String {
    "/chat/completions".to_string()
}
fn default_connect_timeout_secs() -> u64 {
    5
}
fn default_pool_max_idle_per_host() -> usize {
    4
}
fn default_pool_idle_timeout_secs() -> u64 {
    15
}

impl BackendConfig {
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            chat_path: default_chat_path(),
            token: None,
            token_env: None,
            proxy: None,
            use_env_proxy: false,
            connect_timeout_secs: default_connect_timeout_secs(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout_secs(),
        }
    }

    /// Full URL of the streaming chat endpoint.
    #[must_use]
    pub fn chat_url(&self) -> String {
        let base = self.base_url.trim_end_matches('/');
        format!("{base}{}", self.chat_path)
    }
}

/// Streaming session settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionConfig {
    /// Fail a stream that delivers no bytes for this long. `None` waits forever
    /// and is written as an explicit `null`.
    pub idle_timeout_secs: Option<u64>,
    pub widget_parse: WidgetParsePolicy,
}

fn default_idle_timeout_secs() -> u64 {
    120
}

impl SessionConfig {
    #[must_use]
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Deserialize)]
struct SessionConfigWire {
    #[serde(default = "default_idle_timeout_setting")]
    idle_timeout_secs: IdleTimeoutSetting,
    #[serde(default)]
    widget_parse: WidgetParsePolicy,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum IdleTimeoutSetting {
    Fixed(u64),
    Disabled(()),
}

fn default_idle_timeout_setting() -> IdleTimeoutSetting {
    IdleTimeoutSetting::Fixed(default_idle_timeout_secs())
}

impl<'de> Deserialize<'de> for SessionConfig {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let wire = SessionConfigWire::deserialize(deserializer)?;
        Ok(Self {
            // missing => default, explicit null => disabled
            idle_timeout_secs: match wire.idle_timeout_secs {
                IdleTimeoutSetting::Fixed(secs) => Some(secs),
                IdleTimeoutSetting::Disabled(()) => None,
            },
            widget_parse: wire.widget_parse,
        })
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: Some(default_idle_timeout_secs()),
            widget_parse: WidgetParsePolicy::default(),
        }
    }
}

/// Coalescing dispatcher timing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Quiet period after the last user message before a turn is sent.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    /// Delay before re-checking input that arrived while a turn was streaming.
    #[serde(default = "default_followup_ms")]
    pub followup_ms: u64,
}

fn default_debounce_ms() -> u64 {
    1_000
}
fn default_followup_ms() -> u64 {
    100
}

impl DispatchConfig {
    #[must_use]
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    #[must_use]
    pub fn followup(&self) -> Duration {
        Duration::from_millis(self.followup_ms)
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            followup_ms: default_followup_ms(),
        }
    }
}

/// Output shape of the stderr log stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Feature flags and settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeaturesConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_format: LogFormat,
}

fn default_log_level() -> String {
    "INFO".to_string()
}

impl Default for FeaturesConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::Text,
        }
    }
}

/// Top-level client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub backend: BackendConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub features: FeaturesConfig,
}

/// Parse and validate configuration from YAML text.
///
/// # Errors
///
/// Returns [`ConfigError::Yaml`] when parsing fails, or
/// [`ConfigError::Validation`] when semantic validation fails.
pub fn parse_config(contents: &str) -> Result<ClientConfig, ConfigError> {
    let config: ClientConfig = serde_yaml::from_str(contents)?;
    validate_config(&config)?;
    Ok(config)
}

/// Load configuration from a YAML file and validate it.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] when reading the file fails, [`ConfigError::Yaml`]
/// when parsing fails, or [`ConfigError::Validation`] when semantic validation fails.
pub fn load_config(path: &str) -> Result<ClientConfig, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    parse_config(&contents)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_example_config() {
        let config = load_config("config.example.yaml");
        assert!(
            config.is_ok(),
            "Failed to load example config: {:?}",
            config.err()
        );
        let config = config.unwrap();
        assert_eq!(config.backend.chat_path, "/chat/completions");
        assert_eq!(config.backend.token_env.as_deref(), Some("INBOXCHAT_TOKEN"));
        assert_eq!(config.session.idle_timeout_secs, Some(120));
        assert_eq!(config.dispatch.debounce_ms, 1_000);
        assert_eq!(config.features.log_level, "INFO");
        assert_eq!(config.features.log_format, LogFormat::Text);
    }

    #[test]
    fn test_minimal_config_defaults() {
        let config = parse_config(
            "backend:\n  base_url: http://127.0.0.1:9000/api\n  token: t\n",
        )
        .unwrap();
        assert_eq!(config.session, SessionConfig::default());
        assert_eq!(config.dispatch, DispatchConfig::default());
        assert_eq!(config.backend.chat_url(), "http://127.0.0.1:9000/api/chat/completions");
        assert_eq!(config.session.widget_parse, WidgetParsePolicy::EveryDelta);
    }

    #[test]
    fn test_json_log_format() {
        let config = parse_config(
            "backend:\n  base_url: http://x\n  token: t\nfeatures:\n  log_format: json\n",
        )
        .unwrap();
        assert_eq!(config.features.log_format, LogFormat::Json);
        assert_eq!(config.features.log_level, "INFO");
    }

    #[test]
    fn test_idle_timeout_null_disables() {
        let config = parse_config(
            "backend:\n  base_url: http://x\n  token: t\nsession:\n  idle_timeout_secs: null\n  widget_parse: on_done\n",
        )
        .unwrap();
        assert_eq!(config.session.idle_timeout(), None);
        assert_eq!(config.session.widget_parse, WidgetParsePolicy::OnDone);
    }

    #[test]
    fn test_disabled_idle_timeout_survives_yaml_round_trip() {
        let session = SessionConfig {
            idle_timeout_secs: None,
            widget_parse: WidgetParsePolicy::OnDone,
        };
        let yaml = serde_yaml::to_string(&session).unwrap();
        assert!(yaml.contains("idle_timeout_secs: null"), "{yaml}");
        let back: SessionConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back, session);

        let yaml = serde_yaml::to_string(&SessionConfig::default()).unwrap();
        let back: SessionConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back, SessionConfig::default());
    }

    #[test]
    fn test_chat_url_joins_trailing_slash() {
        let mut backend = BackendConfig::new("https://api.example.com/v1/");
        backend.chat_path = "/assistant/chat".to_string();
        assert_eq!(backend.chat_url(), "https://api.example.com/v1/assistant/chat");
    }
}
