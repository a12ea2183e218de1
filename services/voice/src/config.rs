use elevenlabs_realtime::{DEFAULT_API_URL, DEFAULT_WS_URL, RealtimeConfig};
use kappatron_core::{AudioConstraints, MAX_RECONNECT_ATTEMPTS, SessionSettings};
use secrecy::SecretString;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub agent_id: String,
    pub api_key: Option<SecretString>,
    pub ws_url: String,
    pub api_url: String,
    pub max_reconnect_attempts: u32,
    pub sample_rate: u32,
    pub log_level: Level,
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Reads `primary`, falling back to the name the web build used when the
/// primary is unset or blank.
fn var_with_fallback(primary: &str, fallback: &str) -> Option<String> {
    non_empty_var(primary).or_else(|| non_empty_var(fallback))
}

fn parse_var<T: std::str::FromStr>(name: &str, default: T) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| ConfigError::InvalidValue(name.to_string(), raw)),
        Err(_) => Ok(default),
    }
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let agent_id = var_with_fallback("ELEVENLABS_AGENT_ID", "VITE_ELEVENLABS_AGENT_ID")
            .ok_or_else(|| ConfigError::MissingVar("ELEVENLABS_AGENT_ID".to_string()))?;

        let api_key = var_with_fallback("ELEVENLABS_API_KEY", "VITE_ELEVENLABS_API_KEY")
            .map(SecretString::from);

        let ws_url =
            std::env::var("ELEVENLABS_WS_URL").unwrap_or_else(|_| DEFAULT_WS_URL.to_string());
        let api_url =
            std::env::var("ELEVENLABS_API_URL").unwrap_or_else(|_| DEFAULT_API_URL.to_string());

        let max_reconnect_attempts = parse_var("MAX_RECONNECT_ATTEMPTS", MAX_RECONNECT_ATTEMPTS)?;

        let sample_rate = parse_var("AUDIO_SAMPLE_RATE", 16_000u32)?;
        if !(8_000..=48_000).contains(&sample_rate) {
            return Err(ConfigError::InvalidValue(
                "AUDIO_SAMPLE_RATE".to_string(),
                format!("{sample_rate} is outside 8000..=48000"),
            ));
        }

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        Ok(Self {
            agent_id,
            api_key,
            ws_url,
            api_url,
            max_reconnect_attempts,
            sample_rate,
            log_level,
        })
    }

    /// Session parameters derived from this configuration.
    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings::new(self.agent_id.clone())
            .with_constraints(AudioConstraints {
                sample_rate: self.sample_rate,
                ..AudioConstraints::default()
            })
            .with_max_reconnect_attempts(self.max_reconnect_attempts)
    }

    /// Connection parameters for the agent service.
    pub fn realtime_config(&self) -> RealtimeConfig {
        RealtimeConfig {
            ws_url: self.ws_url.clone(),
            api_url: self.api_url.clone(),
            api_key: self.api_key.clone(),
        }
    }
}
