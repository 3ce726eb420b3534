//! Process configuration.
//!
//! Operational tuning (bind address, flush/resample parameters, timeouts) is
//! layered from a TOML file on disk via [`Config::load`]/[`Config::save`],
//! the same pattern this codebase's predecessor used for its own settings
//! file. Secrets never live in that file: they are read directly from the
//! environment by [`Secrets::from_env`] and validated eagerly at startup.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::ConfigError;

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub audio: AudioConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub tenancy: TenancyConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            audio: AudioConfig::default(),
            timeouts: TimeoutConfig::default(),
            tenancy: TenancyConfig::default(),
        }
    }
}

/// Bridge server listener settings (§4.7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_host")]
    pub bind_host: String,
    #[serde(default = "default_bind_port")]
    pub bind_port: u16,
    #[serde(default = "default_ws_path")]
    pub ws_base_path: String,
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
    #[serde(default = "default_pong_deadline_secs")]
    pub pong_deadline_secs: u64,
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,
    #[serde(default = "default_max_queue")]
    pub max_queue: usize,
    #[serde(default = "default_close_deadline_secs")]
    pub close_deadline_secs: u64,
}

fn default_bind_host() -> String {
    "0.0.0.0".to_string()
}
fn default_bind_port() -> u16 {
    8080
}
fn default_ws_path() -> String {
    "/media".to_string()
}
fn default_ping_interval_secs() -> u64 {
    30
}
fn default_pong_deadline_secs() -> u64 {
    15
}
fn default_max_message_bytes() -> usize {
    1024 * 1024
}
fn default_max_queue() -> usize {
    64
}
fn default_close_deadline_secs() -> u64 {
    10
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_host: default_bind_host(),
            bind_port: default_bind_port(),
            ws_base_path: default_ws_path(),
            ping_interval_secs: default_ping_interval_secs(),
            pong_deadline_secs: default_pong_deadline_secs(),
            max_message_bytes: default_max_message_bytes(),
            max_queue: default_max_queue(),
            close_deadline_secs: default_close_deadline_secs(),
        }
    }
}

/// Audio pipeline tuning (§4.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    #[serde(default = "default_telephony_rate")]
    pub telephony_rate_hz: u32,
    #[serde(default = "default_llm_input_rate")]
    pub llm_input_rate_hz: u32,
    #[serde(default = "default_llm_output_rate")]
    pub llm_output_rate_hz: u32,
    #[serde(default = "default_flush_size_bytes")]
    pub flush_size_bytes: usize,
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    #[serde(default = "default_min_chunk_size")]
    pub min_chunk_size: usize,
}

fn default_telephony_rate() -> u32 {
    8000
}
fn default_llm_input_rate() -> u32 {
    16000
}
fn default_llm_output_rate() -> u32 {
    24000
}
fn default_flush_size_bytes() -> usize {
    3840
}
fn default_flush_interval_ms() -> u64 {
    100
}
fn default_min_chunk_size() -> usize {
    3840
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            telephony_rate_hz: default_telephony_rate(),
            llm_input_rate_hz: default_llm_input_rate(),
            llm_output_rate_hz: default_llm_output_rate(),
            flush_size_bytes: default_flush_size_bytes(),
            flush_interval_ms: default_flush_interval_ms(),
            min_chunk_size: default_min_chunk_size(),
        }
    }
}

/// Timeouts across the session lifecycle (§4.1, §4.7, §5, C12).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_start_frame_deadline_secs")]
    pub start_frame_deadline_secs: u64,
    #[serde(default = "default_llm_connect_backoff_secs")]
    pub llm_connect_backoff_secs: Vec<u64>,
    #[serde(default = "default_keepalive_failures_before_degraded")]
    pub keepalive_failures_before_degraded: u32,
    #[serde(default = "default_outbound_drain_cap_secs")]
    pub outbound_drain_cap_secs: u64,
    #[serde(default = "default_inactivity_threshold_secs")]
    pub inactivity_threshold_secs: u64,
    #[serde(default = "default_max_call_duration_secs")]
    pub max_call_duration_secs: u64,
    #[serde(default = "default_inactivity_check_interval_secs")]
    pub inactivity_check_interval_secs: u64,
    #[serde(default = "default_duration_check_interval_secs")]
    pub duration_check_interval_secs: u64,
}

fn default_start_frame_deadline_secs() -> u64 {
    10
}
fn default_llm_connect_backoff_secs() -> Vec<u64> {
    vec![1, 2, 4]
}
fn default_keepalive_failures_before_degraded() -> u32 {
    3
}
fn default_outbound_drain_cap_secs() -> u64 {
    30
}
fn default_inactivity_threshold_secs() -> u64 {
    120
}
fn default_max_call_duration_secs() -> u64 {
    600
}
fn default_inactivity_check_interval_secs() -> u64 {
    10
}
fn default_duration_check_interval_secs() -> u64 {
    30
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            start_frame_deadline_secs: default_start_frame_deadline_secs(),
            llm_connect_backoff_secs: default_llm_connect_backoff_secs(),
            keepalive_failures_before_degraded: default_keepalive_failures_before_degraded(),
            outbound_drain_cap_secs: default_outbound_drain_cap_secs(),
            inactivity_threshold_secs: default_inactivity_threshold_secs(),
            max_call_duration_secs: default_max_call_duration_secs(),
            inactivity_check_interval_secs: default_inactivity_check_interval_secs(),
            duration_check_interval_secs: default_duration_check_interval_secs(),
        }
    }
}

/// Tenant-resolution defaults (§4.7, §4.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenancyConfig {
    #[serde(default = "default_tenant_id")]
    pub default_tenant_id: String,
    #[serde(default = "default_country_code")]
    pub default_country_code: String,
    #[serde(default = "default_owner_phone")]
    pub default_owner_phone: String,
}

fn default_tenant_id() -> String {
    "default".to_string()
}
fn default_country_code() -> String {
    "91".to_string()
}
fn default_owner_phone() -> String {
    String::new()
}

impl Default for TenancyConfig {
    fn default() -> Self {
        Self {
            default_tenant_id: default_tenant_id(),
            default_country_code: default_country_code(),
            default_owner_phone: default_owner_phone(),
        }
    }
}

impl Config {
    /// Load configuration from file, creating a default one if absent.
    pub fn load() -> Result<Self> {
        let path = config_path()?;
        if path.exists() {
            let contents = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
                path: path.display().to_string(),
                source,
            })?;
            let config: Config = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save()?;
            Ok(config)
        }
    }

    /// Save configuration to file.
    pub fn save(&self) -> Result<()> {
        let path = config_path()?;
        let parent = path.parent().context("config path has no parent")?;
        std::fs::create_dir_all(parent).context("failed to create config directory")?;
        let contents = toml::to_string_pretty(self).context("failed to serialize config")?;
        std::fs::write(&path, contents).context("failed to write config file")?;
        Ok(())
    }
}

/// Get the configuration file path.
pub fn config_path() -> Result<PathBuf> {
    let base = directories::ProjectDirs::from("com", "call-bridge", "call-bridge")
        .context("failed to resolve project directories")?;
    Ok(base.config_dir().join("config.toml"))
}

/// Secrets read from the environment only, never persisted to disk (§6).
#[derive(Debug, Clone)]
pub struct Secrets {
    pub llm_api_key: String,
    pub messaging_auth_key: String,
    pub messaging_sender_number: String,
    pub persistence_url: String,
    pub persistence_key: String,
    pub telephony_account_sid: String,
    pub telephony_auth_token: String,
}

impl Secrets {
    /// Read all mandatory secrets from the environment.
    ///
    /// Fails on the first missing variable (§7's Configuration error kind);
    /// `main` exits the process with code 1 specifically when the LLM API
    /// key is absent, per §6.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            llm_api_key: require_env("LLM_API_KEY")?,
            messaging_auth_key: require_env("MSG91_AUTH_KEY")?,
            messaging_sender_number: require_env("MSG91_INTEGRATED_NUMBER")?,
            persistence_url: require_env("SUPABASE_URL")?,
            persistence_key: require_env("SUPABASE_API_KEY")?,
            telephony_account_sid: require_env("TELEPHONY_ACCOUNT_SID")?,
            telephony_auth_token: require_env("TELEPHONY_AUTH_TOKEN")?,
        })
    }
}

fn require_env(name: &'static str) -> Result<String, ConfigError> {
    std::env::var(name).map_err(|_| ConfigError::MissingEnv(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_roundtrips_through_toml() {
        let config = Config::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.audio.flush_size_bytes, config.audio.flush_size_bytes);
        assert_eq!(parsed.server.bind_port, config.server.bind_port);
    }

    #[test]
    fn flush_size_default_matches_spec() {
        let config = AudioConfig::default();
        assert_eq!(config.flush_size_bytes, 3840);
        assert_eq!(config.flush_size_bytes % 320, 0);
        assert_eq!(config.min_chunk_size, 3840);
    }

    #[test]
    fn missing_env_var_is_reported_by_name() {
        let err = require_env("LLM_API_KEY_TEST_PROBE_DOES_NOT_EXIST").unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnv("LLM_API_KEY_TEST_PROBE_DOES_NOT_EXIST")));
    }

    #[test]
    fn written_config_file_parses_back_to_the_same_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = Config::default();
        config.tenancy.default_tenant_id = "acme-clinic".to_string();
        std::fs::write(&path, toml::to_string_pretty(&config).unwrap()).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let parsed: Config = toml::from_str(&contents).unwrap();
        assert_eq!(parsed.tenancy.default_tenant_id, "acme-clinic");
    }

    #[test]
    fn malformed_config_file_reports_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "not valid toml {{{").unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let result: Result<Config, _> = toml::from_str(&contents);
        assert!(result.is_err());
    }
}
