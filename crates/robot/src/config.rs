//! Robot agent configuration (spec §4.5 startup sequence step 1), grounded
//! on `robot_config.py`'s `RobotConfig` dataclass and its `_validate`.

use std::collections::HashSet;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use rpa_orchestrator_core::job::RobotId;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} environment variable is required")]
    MissingEnv(&'static str),

    #[error("invalid value for {var}: {value}")]
    InvalidValue { var: &'static str, value: String },

    #[error("{0}")]
    Invalid(String),
}

#[derive(Debug, Clone)]
pub struct RobotAgentConfig {
    pub robot_id: RobotId,
    pub robot_name: String,
    pub environment: String,
    pub tags: HashSet<String>,
    pub capabilities: Vec<String>,
    pub max_concurrent_jobs: u32,
    pub api_key: Option<String>,
    pub ca_cert_path: Option<PathBuf>,
    pub client_cert_path: Option<PathBuf>,
    pub client_key_path: Option<PathBuf>,

    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    pub presence_interval: Duration,
    pub subscribe_timeout: Duration,
    pub graceful_shutdown: Duration,
    pub job_timeout: Duration,
}

impl RobotAgentConfig {
    pub fn new(robot_name: impl Into<String>) -> Self {
        RobotAgentConfig {
            robot_id: Uuid::new_v4(),
            robot_name: robot_name.into(),
            environment: "production".to_string(),
            tags: HashSet::new(),
            capabilities: Vec::new(),
            max_concurrent_jobs: 1,
            api_key: None,
            ca_cert_path: None,
            client_cert_path: None,
            client_key_path: None,
            poll_interval: Duration::from_secs(2),
            heartbeat_interval: Duration::from_secs(10),
            presence_interval: Duration::from_secs(5),
            subscribe_timeout: Duration::from_secs(5),
            graceful_shutdown: Duration::from_secs(60),
            job_timeout: Duration::from_secs(3600),
        }
    }

    /// Loads configuration from `CASARE_*` environment variables, matching
    /// `RobotConfig.from_env()` one-to-one.
    pub fn from_env() -> Result<Self, ConfigError> {
        let robot_name = env::var("CASARE_ROBOT_NAME").map_err(|_| ConfigError::MissingEnv("CASARE_ROBOT_NAME"))?;

        let mut config = RobotAgentConfig::new(robot_name);

        if let Ok(id) = env::var("CASARE_ROBOT_ID") {
            config.robot_id = Uuid::parse_str(&id)
                .map_err(|_| ConfigError::InvalidValue { var: "CASARE_ROBOT_ID", value: id })?;
        }
        if let Ok(env_name) = env::var("CASARE_ENVIRONMENT") {
            config.environment = env_name;
        }
        config.api_key = env::var("CASARE_API_KEY").ok();
        config.tags = parse_csv_env("CASARE_TAGS").into_iter().collect();
        config.capabilities = parse_csv_env("CASARE_CAPABILITIES");

        if let Ok(raw) = env::var("CASARE_MAX_CONCURRENT_JOBS") {
            config.max_concurrent_jobs = raw
                .parse()
                .map_err(|_| ConfigError::InvalidValue { var: "CASARE_MAX_CONCURRENT_JOBS", value: raw })?;
        }
        if let Ok(raw) = env::var("CASARE_HEARTBEAT_INTERVAL") {
            config.heartbeat_interval = parse_secs_env("CASARE_HEARTBEAT_INTERVAL", &raw)?;
        }
        if let Ok(raw) = env::var("CASARE_POLL_INTERVAL") {
            config.poll_interval = parse_secs_env("CASARE_POLL_INTERVAL", &raw)?;
        }
        if let Ok(raw) = env::var("CASARE_PRESENCE_INTERVAL") {
            config.presence_interval = parse_secs_env("CASARE_PRESENCE_INTERVAL", &raw)?;
        }
        if let Ok(raw) = env::var("CASARE_SUBSCRIBE_TIMEOUT") {
            config.subscribe_timeout = parse_secs_env("CASARE_SUBSCRIBE_TIMEOUT", &raw)?;
        }
        if let Ok(raw) = env::var("CASARE_GRACEFUL_SHUTDOWN_SECONDS") {
            config.graceful_shutdown = parse_secs_env("CASARE_GRACEFUL_SHUTDOWN_SECONDS", &raw)?;
        }
        if let Ok(raw) = env::var("CASARE_JOB_TIMEOUT") {
            config.job_timeout = parse_secs_env("CASARE_JOB_TIMEOUT", &raw)?;
        }

        config.ca_cert_path = env::var("CASARE_CA_CERT_PATH").ok().map(PathBuf::from);
        config.client_cert_path = env::var("CASARE_CLIENT_CERT_PATH").ok().map(PathBuf::from);
        config.client_key_path = env::var("CASARE_CLIENT_KEY_PATH").ok().map(PathBuf::from);

        config.validate()?;
        Ok(config)
    }

    /// Mirrors `RobotConfig._validate`: non-empty name, sane intervals, the
    /// `crpa_` API key prefix/length rule, and the mTLS "all three or none"
    /// rule.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.robot_name.trim().is_empty() {
            return Err(ConfigError::Invalid("robot_name is required and cannot be empty".to_string()));
        }
        if self.max_concurrent_jobs == 0 {
            return Err(ConfigError::Invalid("max_concurrent_jobs must be >= 1".to_string()));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(ConfigError::Invalid("heartbeat_interval must be >= 1s".to_string()));
        }

        if let Some(key) = &self.api_key {
            if !key.starts_with("crpa_") {
                return Err(ConfigError::Invalid("api_key must start with 'crpa_' prefix".to_string()));
            }
            if key.len() < 40 {
                return Err(ConfigError::Invalid("api_key appears to be truncated (too short)".to_string()));
            }
        }

        let mtls_set = [&self.ca_cert_path, &self.client_cert_path, &self.client_key_path]
            .iter()
            .filter(|p| p.is_some())
            .count();
        if mtls_set > 0 && mtls_set < 3 {
            return Err(ConfigError::Invalid(
                "mTLS requires all three: ca_cert_path, client_cert_path, client_key_path".to_string(),
            ));
        }

        Ok(())
    }

    pub fn uses_mtls(&self) -> bool {
        self.ca_cert_path.is_some() && self.client_cert_path.is_some() && self.client_key_path.is_some()
    }

    pub fn uses_api_key(&self) -> bool {
        self.api_key.is_some()
    }
}

fn parse_csv_env(var: &str) -> Vec<String> {
    env::var(var)
        .ok()
        .map(|raw| raw.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect())
        .unwrap_or_default()
}

fn parse_secs_env(var: &'static str, raw: &str) -> Result<Duration, ConfigError> {
    raw.parse::<u64>()
        .map(Duration::from_secs)
        .map_err(|_| ConfigError::InvalidValue { var, value: raw.to_string() })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_name() {
        let config = RobotAgentConfig::new("   ");
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_short_api_key() {
        let mut config = RobotAgentConfig::new("r1");
        config.api_key = Some("crpa_short".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_api_key_without_prefix() {
        let mut config = RobotAgentConfig::new("r1");
        config.api_key = Some("x".repeat(45));
        assert!(config.validate().is_err());
    }

    #[test]
    fn accepts_well_formed_api_key() {
        let mut config = RobotAgentConfig::new("r1");
        config.api_key = Some(format!("crpa_{}", "a".repeat(40)));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_partial_mtls_config() {
        let mut config = RobotAgentConfig::new("r1");
        config.ca_cert_path = Some(PathBuf::from("/tmp/ca.pem"));
        assert!(config.validate().is_err());
    }

    #[test]
    fn accepts_full_mtls_config() {
        let mut config = RobotAgentConfig::new("r1");
        config.ca_cert_path = Some(PathBuf::from("/tmp/ca.pem"));
        config.client_cert_path = Some(PathBuf::from("/tmp/client.pem"));
        config.client_key_path = Some(PathBuf::from("/tmp/client.key"));
        assert!(config.validate().is_ok());
        assert!(config.uses_mtls());
    }

    #[test]
    fn rejects_zero_max_concurrent_jobs() {
        let mut config = RobotAgentConfig::new("r1");
        config.max_concurrent_jobs = 0;
        assert!(config.validate().is_err());
    }
}
