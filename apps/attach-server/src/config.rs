use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::workload::WorkloadSpec;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
    #[error("invalid value for {key}: {value}")]
    Env { key: &'static str, value: String },
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CredentialConfig {
    pub token: String,
    pub principal: String,
    #[serde(default)]
    pub scopes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SessionConfig {
    pub id: String,
    #[serde(default = "default_true")]
    pub attach_enabled: bool,
    #[serde(default)]
    pub workload: WorkloadSpec,
}

fn default_true() -> bool {
    true
}

/// attach-server configuration: defaults, then an optional TOML file, then
/// `ATTACH_*` environment overrides.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub listen: SocketAddr,
    pub driver_lease_ms: u64,
    pub token_ttl_secs: u64,
    pub cleanup_grace_ms: u64,
    pub ping_period_secs: u64,
    pub pong_wait_secs: u64,
    /// Largest inbound websocket message, in bytes.
    pub read_limit: usize,
    /// Empty allows every `Origin`.
    pub allowed_origins: Vec<String>,
    pub cookie_secure: bool,
    pub bootstrap_token: Option<String>,
    pub credentials: Vec<CredentialConfig>,
    pub sessions: Vec<SessionConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 7070)),
            driver_lease_ms: attach_proto::DEFAULT_DRIVER_LEASE.as_millis() as u64,
            token_ttl_secs: 120,
            cleanup_grace_ms: 5_000,
            ping_period_secs: 30,
            pong_wait_secs: 60,
            read_limit: 64 * 1024,
            allowed_origins: Vec::new(),
            cookie_secure: false,
            bootstrap_token: None,
            credentials: Vec::new(),
            sessions: Vec::new(),
        }
    }
}

impl Config {
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("ATTACH_LISTEN") {
            self.listen = parse_env("ATTACH_LISTEN", value)?;
        }
        if let Some(value) = lookup("ATTACH_DRIVER_LEASE_MS") {
            self.driver_lease_ms = parse_env("ATTACH_DRIVER_LEASE_MS", value)?;
        }
        if let Some(value) = lookup("ATTACH_TOKEN_TTL_SECS") {
            self.token_ttl_secs = parse_env("ATTACH_TOKEN_TTL_SECS", value)?;
        }
        if let Some(value) = lookup("ATTACH_ALLOWED_ORIGINS") {
            self.allowed_origins = value
                .split(',')
                .map(str::trim)
                .filter(|origin| !origin.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(value) = lookup("ATTACH_COOKIE_SECURE") {
            self.cookie_secure = value == "1" || value.eq_ignore_ascii_case("true");
        }
        if let Some(value) = lookup("ATTACH_BOOTSTRAP_TOKEN") {
            let value = value.trim().to_string();
            self.bootstrap_token = (!value.is_empty()).then_some(value);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.driver_lease_ms == 0 {
            return Err(ConfigError::Invalid("driver_lease_ms must be positive".into()));
        }
        if self.token_ttl_secs == 0 {
            return Err(ConfigError::Invalid("token_ttl_secs must be positive".into()));
        }
        if self.ping_period_secs == 0 || self.pong_wait_secs <= self.ping_period_secs {
            return Err(ConfigError::Invalid(
                "pong_wait_secs must exceed a non-zero ping_period_secs".into(),
            ));
        }
        if self.read_limit == 0 {
            return Err(ConfigError::Invalid("read_limit must be positive".into()));
        }
        let mut seen = std::collections::HashSet::new();
        for session in &self.sessions {
            if session.id.trim().is_empty() {
                return Err(ConfigError::Invalid("session id must not be empty".into()));
            }
            if !seen.insert(session.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate session id {}",
                    session.id
                )));
            }
        }
        Ok(())
    }

    pub fn driver_lease(&self) -> Duration {
        Duration::from_millis(self.driver_lease_ms)
    }

    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_secs)
    }

    pub fn cleanup_grace(&self) -> Duration {
        Duration::from_millis(self.cleanup_grace_ms)
    }

    pub fn ping_period(&self) -> Duration {
        Duration::from_secs(self.ping_period_secs)
    }

    pub fn pong_wait(&self) -> Duration {
        Duration::from_secs(self.pong_wait_secs)
    }
}

fn parse_env<T: std::str::FromStr>(key: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::Env { key, value })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test_timeout::timeout]
    fn parses_file_with_sessions_and_credentials() {
        let config: Config = toml::from_str(
            r#"
            listen = "0.0.0.0:9000"
            driver_lease_ms = 15000

            [[credentials]]
            token = "t1"
            principal = "alice"
            scopes = ["session:read", "control:write"]

            [[sessions]]
            id = "demo"
            workload = { kind = "loopback", banner = "hi" }

            [[sessions]]
            id = "shell"
            attach_enabled = false
            "#,
        )
        .unwrap();
        assert_eq!(config.listen.port(), 9000);
        assert_eq!(config.driver_lease(), Duration::from_secs(15));
        assert_eq!(config.token_ttl_secs, 120);
        assert_eq!(config.credentials[0].scopes.len(), 2);
        assert!(config.sessions[0].attach_enabled);
        assert_eq!(
            config.sessions[0].workload,
            WorkloadSpec::Loopback {
                banner: Some("hi".into())
            }
        );
        assert!(!config.sessions[1].attach_enabled);
        assert_eq!(config.sessions[1].workload, WorkloadSpec::default());
        config.validate().unwrap();
    }

    #[test_timeout::timeout]
    fn env_overrides_file_values() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("ATTACH_LISTEN", "127.0.0.1:1234"),
            ("ATTACH_DRIVER_LEASE_MS", "500"),
            ("ATTACH_ALLOWED_ORIGINS", "https://a.example, https://b.example,"),
            ("ATTACH_COOKIE_SECURE", "true"),
            ("ATTACH_BOOTSTRAP_TOKEN", " boot "),
        ]);
        let mut config = Config::default();
        config
            .apply_env(|key| env.get(key).map(|value| value.to_string()))
            .unwrap();
        assert_eq!(config.listen.port(), 1234);
        assert_eq!(config.driver_lease_ms, 500);
        assert_eq!(config.allowed_origins.len(), 2);
        assert!(config.cookie_secure);
        assert_eq!(config.bootstrap_token.as_deref(), Some("boot"));
    }

    #[test_timeout::timeout]
    fn rejects_bad_values() {
        let mut config = Config::default();
        let err = config
            .apply_env(|key| (key == "ATTACH_TOKEN_TTL_SECS").then(|| "soon".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Env { key: "ATTACH_TOKEN_TTL_SECS", .. }));

        let config = Config {
            pong_wait_secs: 10,
            ..Config::default()
        };
        assert!(config.validate().is_err());

        let duplicate = SessionConfig {
            id: "a".into(),
            attach_enabled: true,
            workload: WorkloadSpec::default(),
        };
        let config = Config {
            sessions: vec![duplicate.clone(), duplicate],
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }
}
