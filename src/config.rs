//! Daemon configuration.
//!
//! An optional JSON document in `CODE_SANDBOX_CONFIG` provides the base;
//! individual environment variables override it. Parsing goes through a
//! lookup function so tests never touch the process environment.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::session::SessionConfig;

/// Environment variable holding the base JSON configuration.
pub const CONFIG_ENV: &str = "CODE_SANDBOX_CONFIG";

/// Top-level configuration for the daemon.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Container runtime address: unix socket path, `unix://`, `tcp://` or
    /// `http://`. Unset means the runtime's local defaults.
    #[serde(default)]
    pub docker_host: Option<String>,

    /// Overrides every language's wall-clock timeout.
    #[serde(default)]
    pub execution_timeout_ms: Option<u64>,

    #[serde(default = "default_true")]
    pub enable_local_fallback: bool,

    /// Delegate execution to a companion service at this URL.
    #[serde(default)]
    pub execution_service_url: Option<String>,

    #[serde(default = "default_service_timeout_ms")]
    pub execution_service_timeout_ms: u64,

    /// Base directory for per-execution workspaces.
    #[serde(default = "default_workspace_root")]
    pub workspace_root: PathBuf,

    #[serde(default)]
    pub session: SessionSettings,

    /// Bearer token required on mutating HTTP routes, when set.
    #[serde(default)]
    pub api_token: Option<String>,

    /// JSON file of lesson test cases.
    #[serde(default)]
    pub lessons_file: Option<PathBuf>,

    /// Host interpreter for the Python fallback.
    #[serde(default = "default_python_bin")]
    pub python_bin: String,

    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
}

/// Session reaping configuration (as read from JSON).
#[derive(Debug, Clone, Deserialize)]
pub struct SessionSettings {
    /// Idle timeout in seconds before a session is reaped.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_seconds: u64,

    /// Maximum session lifetime in seconds, regardless of activity.
    #[serde(default = "default_max_lifetime")]
    pub max_lifetime_seconds: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            idle_timeout_seconds: default_idle_timeout(),
            max_lifetime_seconds: default_max_lifetime(),
        }
    }
}

const fn default_true() -> bool {
    true
}

const fn default_service_timeout_ms() -> u64 {
    30_000
}

const fn default_idle_timeout() -> u64 {
    300
}

const fn default_max_lifetime() -> u64 {
    3600
}

fn default_workspace_root() -> PathBuf {
    std::env::temp_dir().join("code-sandbox")
}

fn default_python_bin() -> String {
    "python3".into()
}

fn default_listen_addr() -> String {
    "127.0.0.1:5000".into()
}

fn parse_number(name: &str, value: &str) -> Result<u64> {
    value
        .trim()
        .parse()
        .with_context(|| format!("{name} must be a non-negative integer, got '{value}'"))
}

fn parse_flag(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => anyhow::bail!("{name} must be true or false, got '{value}'"),
    }
}

impl Config {
    /// Parse a JSON configuration document.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to parse configuration JSON")
    }

    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration from `lookup`. Empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let mut config = match get(CONFIG_ENV) {
            Some(json) => Self::from_json(&json).with_context(|| format!("Invalid {CONFIG_ENV}"))?,
            None => Self::from_json("{}")?,
        };

        if let Some(v) = get("DOCKER_HOST") {
            config.docker_host = Some(v);
        }
        if let Some(v) = get("EXECUTION_TIMEOUT_MS") {
            config.execution_timeout_ms = Some(parse_number("EXECUTION_TIMEOUT_MS", &v)?);
        }
        if let Some(v) = get("ENABLE_LOCAL_FALLBACK") {
            config.enable_local_fallback = parse_flag("ENABLE_LOCAL_FALLBACK", &v)?;
        }
        if let Some(v) = get("EXECUTION_SERVICE_URL") {
            config.execution_service_url = Some(v);
        }
        if let Some(v) = get("EXECUTION_SERVICE_TIMEOUT_MS") {
            config.execution_service_timeout_ms = parse_number("EXECUTION_SERVICE_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = get("WORKSPACE_ROOT") {
            config.workspace_root = PathBuf::from(v);
        }
        if let Some(v) = get("SESSION_IDLE_TIMEOUT") {
            config.session.idle_timeout_seconds = parse_number("SESSION_IDLE_TIMEOUT", &v)?;
        }
        if let Some(v) = get("SESSION_MAX_LIFETIME") {
            config.session.max_lifetime_seconds = parse_number("SESSION_MAX_LIFETIME", &v)?;
        }
        if let Some(v) = get("API_TOKEN") {
            config.api_token = Some(v);
        }
        if let Some(v) = get("LESSONS_FILE") {
            config.lessons_file = Some(PathBuf::from(v));
        }
        if let Some(v) = get("PYTHON_BIN") {
            config.python_bin = v;
        }
        if let Some(v) = get("LISTEN_ADDR") {
            config.listen_addr = v;
        }

        Ok(config)
    }

    pub fn execution_timeout(&self) -> Option<Duration> {
        self.execution_timeout_ms.map(Duration::from_millis)
    }

    pub const fn service_timeout(&self) -> Duration {
        Duration::from_millis(self.execution_service_timeout_ms)
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            idle_timeout: Duration::from_secs(self.session.idle_timeout_seconds),
            max_lifetime: Duration::from_secs(self.session.max_lifetime_seconds),
            ..SessionConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn load(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults() {
        let config = load(&[]).unwrap();
        assert!(config.docker_host.is_none());
        assert!(config.execution_timeout().is_none());
        assert!(config.enable_local_fallback);
        assert!(config.execution_service_url.is_none());
        assert_eq!(config.service_timeout(), Duration::from_secs(30));
        assert_eq!(config.python_bin, "python3");
        assert_eq!(config.listen_addr, "127.0.0.1:5000");
        assert_eq!(config.session_config().idle_timeout, Duration::from_secs(300));
    }

    #[test]
    fn env_overrides() {
        let config = load(&[
            ("DOCKER_HOST", "tcp://10.0.0.5:2375"),
            ("EXECUTION_TIMEOUT_MS", "5000"),
            ("ENABLE_LOCAL_FALLBACK", "false"),
            ("EXECUTION_SERVICE_URL", "http://exec:4000"),
            ("EXECUTION_SERVICE_TIMEOUT_MS", "1500"),
            ("WORKSPACE_ROOT", "/var/tmp/ws"),
            ("SESSION_IDLE_TIMEOUT", "30"),
            ("SESSION_MAX_LIFETIME", "600"),
            ("API_TOKEN", "abc"),
            ("LISTEN_ADDR", "0.0.0.0:8080"),
        ])
        .unwrap();

        assert_eq!(config.docker_host.as_deref(), Some("tcp://10.0.0.5:2375"));
        assert_eq!(config.execution_timeout(), Some(Duration::from_secs(5)));
        assert!(!config.enable_local_fallback);
        assert_eq!(config.execution_service_url.as_deref(), Some("http://exec:4000"));
        assert_eq!(config.service_timeout(), Duration::from_millis(1500));
        assert_eq!(config.workspace_root, PathBuf::from("/var/tmp/ws"));
        let session = config.session_config();
        assert_eq!(session.idle_timeout, Duration::from_secs(30));
        assert_eq!(session.max_lifetime, Duration::from_secs(600));
        assert_eq!(config.api_token.as_deref(), Some("abc"));
        assert_eq!(config.listen_addr, "0.0.0.0:8080");
    }

    #[test]
    fn json_base_with_env_override() {
        let config = load(&[
            (
                CONFIG_ENV,
                r#"{"python_bin": "/usr/bin/python3.11", "session": {"idle_timeout_seconds": 10}, "execution_timeout_ms": 2000}"#,
            ),
            ("EXECUTION_TIMEOUT_MS", "9000"),
        ])
        .unwrap();
        assert_eq!(config.python_bin, "/usr/bin/python3.11");
        assert_eq!(config.session.idle_timeout_seconds, 10);
        assert_eq!(config.session.max_lifetime_seconds, 3600);
        assert_eq!(config.execution_timeout_ms, Some(9000));
    }

    #[test]
    fn empty_values_are_unset() {
        let config = load(&[("API_TOKEN", ""), ("DOCKER_HOST", "  ")]).unwrap();
        assert!(config.api_token.is_none());
        assert!(config.docker_host.is_none());
    }

    #[test]
    fn invalid_values_are_errors() {
        assert!(load(&[("EXECUTION_TIMEOUT_MS", "soon")]).is_err());
        assert!(load(&[("ENABLE_LOCAL_FALLBACK", "maybe")]).is_err());
        assert!(load(&[(CONFIG_ENV, "{not json")]).is_err());
    }
}
