//! service configuration: an optional TOML file, then environment overrides

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::logging::LogFormat;

#[derive(Debug)]
pub enum ConfigError {
    Io(PathBuf, std::io::Error),
    Parse(PathBuf, toml::de::Error),
    InvalidValue { key: String, value: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(path, e) => write!(f, "cannot read {}: {}", path.display(), e),
            ConfigError::Parse(path, e) => write!(f, "invalid config {}: {}", path.display(), e),
            ConfigError::InvalidValue { key, value } => {
                write!(f, "invalid value {:?} for {}", value, key)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io(_, e) => Some(e),
            ConfigError::Parse(_, e) => Some(e),
            ConfigError::InvalidValue { .. } => None,
        }
    }
}

type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub dns_host: String,
    pub dns_port: u16,
    pub udp_threads: usize,
    pub tcp_threads: usize,
    /// JSON snapshot shared by the server and the CLI; `None` keeps state in memory
    pub data_file: Option<PathBuf>,
    /// Challenge lifetime in seconds
    pub challenge_token_expiry: i64,
    /// `host:port` of the nameserver used for live TXT lookups
    pub upstream_dns: String,
    pub dns_lookup_timeout_ms: u64,
    pub native_live_lookup: bool,
    pub webhook_url: Option<String>,
    pub webhook_timeout_ms: u64,
    /// Seconds between scheduled attempts, 0 disables the scheduler
    pub verification_poll_interval: u64,
    pub log_level: String,
    pub log_format: LogFormat,
    pub sentry_dsn: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            dns_host: "0.0.0.0".to_string(),
            dns_port: 53235,
            udp_threads: 4,
            tcp_threads: 4,
            data_file: Some(PathBuf::from("pdsdns.json")),
            challenge_token_expiry: 86400,
            upstream_dns: "8.8.8.8:53".to_string(),
            dns_lookup_timeout_ms: 3000,
            native_live_lookup: true,
            webhook_url: None,
            webhook_timeout_ms: 5000,
            verification_poll_interval: 0,
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
            sentry_dsn: None,
        }
    }
}

fn parse_value<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

/// Empty strings unset optional values
fn optional(value: String) -> Option<String> {
    if value.trim().is_empty() {
        None
    } else {
        Some(value)
    }
}

impl Config {
    /// Read `path` when given, then apply the process environment
    pub fn load(path: Option<&Path>) -> Result<Config> {
        let mut config = match path {
            Some(path) => Config::from_file(path)?,
            None => Config::default(),
        };

        config.apply_env(|key| std::env::var(key).ok())?;

        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Config> {
        let data = fs::read_to_string(path).map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        toml::from_str(&data).map_err(|e| ConfigError::Parse(path.to_path_buf(), e))
    }

    /// Override fields from `lookup`, which maps variable names to values
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("DNS_HOST") {
            self.dns_host = v;
        }
        if let Some(v) = lookup("DNS_PORT") {
            self.dns_port = parse_value("DNS_PORT", &v)?;
        }
        if let Some(v) = lookup("DNS_UDP_THREADS") {
            self.udp_threads = parse_value("DNS_UDP_THREADS", &v)?;
        }
        if let Some(v) = lookup("DNS_TCP_THREADS") {
            self.tcp_threads = parse_value("DNS_TCP_THREADS", &v)?;
        }
        if let Some(v) = lookup("PDSDNS_DATA_FILE") {
            self.data_file = optional(v).map(PathBuf::from);
        }
        if let Some(v) = lookup("CHALLENGE_TOKEN_EXPIRY") {
            self.challenge_token_expiry = parse_value("CHALLENGE_TOKEN_EXPIRY", &v)?;
        }
        if let Some(v) = lookup("UPSTREAM_DNS") {
            self.upstream_dns = v;
        }
        if let Some(v) = lookup("DNS_LOOKUP_TIMEOUT_MS") {
            self.dns_lookup_timeout_ms = parse_value("DNS_LOOKUP_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = lookup("NATIVE_LIVE_LOOKUP") {
            self.native_live_lookup = parse_bool("NATIVE_LIVE_LOOKUP", &v)?;
        }
        if let Some(v) = lookup("WEBHOOK_URL") {
            self.webhook_url = optional(v);
        }
        if let Some(v) = lookup("WEBHOOK_TIMEOUT_MS") {
            self.webhook_timeout_ms = parse_value("WEBHOOK_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = lookup("VERIFICATION_POLL_INTERVAL") {
            self.verification_poll_interval = parse_value("VERIFICATION_POLL_INTERVAL", &v)?;
        }
        if let Some(v) = lookup("LOG_LEVEL") {
            self.log_level = v;
        }
        if let Some(v) = lookup("LOG_FORMAT") {
            self.log_format = parse_value("LOG_FORMAT", &v)?;
        }
        if let Some(v) = lookup("SENTRY_DSN") {
            self.sentry_dsn = optional(v);
        }

        self.validate()
    }

    fn validate(&self) -> Result<()> {
        if self.challenge_token_expiry <= 0 {
            return Err(ConfigError::InvalidValue {
                key: "challenge_token_expiry".to_string(),
                value: self.challenge_token_expiry.to_string(),
            });
        }

        self.upstream()?;

        Ok(())
    }

    /// Split `upstream_dns` into host and port, defaulting the port to 53
    pub fn upstream(&self) -> Result<(String, u16)> {
        let invalid = || ConfigError::InvalidValue {
            key: "upstream_dns".to_string(),
            value: self.upstream_dns.clone(),
        };

        let value = self.upstream_dns.trim();
        if value.is_empty() {
            return Err(invalid());
        }

        // [v6]:port or [v6]
        if let Some(rest) = value.strip_prefix('[') {
            let (host, tail) = rest.split_once(']').ok_or_else(invalid)?;
            let port = match tail.strip_prefix(':') {
                Some(port) => port.parse().map_err(|_| invalid())?,
                None if tail.is_empty() => 53,
                None => return Err(invalid()),
            };
            return Ok((host.to_string(), port));
        }

        match value.rsplit_once(':') {
            Some((host, port)) if !host.contains(':') => {
                let port = port.parse().map_err(|_| invalid())?;
                Ok((host.to_string(), port))
            }
            _ => Ok((value.to_string(), 53)),
        }
    }

    pub fn lookup_timeout(&self) -> Duration {
        Duration::from_millis(self.dns_lookup_timeout_ms)
    }

    pub fn webhook_timeout(&self) -> Duration {
        Duration::from_millis(self.webhook_timeout_ms)
    }

    /// `None` when background polling is disabled
    pub fn poll_interval(&self) -> Option<Duration> {
        match self.verification_poll_interval {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(53235, config.dns_port);
        assert_eq!(86400, config.challenge_token_expiry);
        assert_eq!(("8.8.8.8".to_string(), 53), config.upstream().unwrap());
        assert_eq!(None, config.poll_interval());

        let mut v6 = Config::default();
        v6.upstream_dns = "[2001:4860:4860::8888]:5353".to_string();
        assert_eq!(("2001:4860:4860::8888".to_string(), 5353), v6.upstream().unwrap());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config
            .apply_env(env(&[
                ("DNS_PORT", "5300"),
                ("CHALLENGE_TOKEN_EXPIRY", "60"),
                ("UPSTREAM_DNS", "1.1.1.1:5353"),
                ("NATIVE_LIVE_LOOKUP", "false"),
                ("WEBHOOK_URL", "http://localhost:9000/hook"),
                ("PDSDNS_DATA_FILE", ""),
                ("VERIFICATION_POLL_INTERVAL", "30"),
                ("LOG_FORMAT", "json"),
            ]))
            .unwrap();

        assert_eq!(5300, config.dns_port);
        assert_eq!(60, config.challenge_token_expiry);
        assert_eq!(("1.1.1.1".to_string(), 5353), config.upstream().unwrap());
        assert!(!config.native_live_lookup);
        assert_eq!(Some("http://localhost:9000/hook".to_string()), config.webhook_url);
        assert_eq!(None, config.data_file);
        assert_eq!(Some(Duration::from_secs(30)), config.poll_interval());
        assert_eq!(LogFormat::Json, config.log_format);
    }

    #[test]
    fn test_invalid_env_value() {
        let mut config = Config::default();
        let err = config.apply_env(env(&[("DNS_PORT", "not-a-port")])).unwrap_err();

        match err {
            ConfigError::InvalidValue { key, .. } => assert_eq!("DNS_PORT", key),
            other => panic!("unexpected error {}", other),
        }

        assert!(Config::default()
            .apply_env(env(&[("CHALLENGE_TOKEN_EXPIRY", "0")]))
            .is_err());
    }

    #[test]
    fn test_file_then_env() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pdsdns.toml");
        fs::write(
            &path,
            "dns_port = 6000\nupstream_dns = \"9.9.9.9\"\nlog_format = \"pretty\"\n",
        )
        .unwrap();

        let mut config = Config::from_file(&path).unwrap();
        assert_eq!(6000, config.dns_port);
        assert_eq!(("9.9.9.9".to_string(), 53), config.upstream().unwrap());
        assert_eq!(LogFormat::Pretty, config.log_format);
        assert_eq!(4, config.udp_threads);

        config.apply_env(env(&[("DNS_PORT", "6001")])).unwrap();
        assert_eq!(6001, config.dns_port);
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            Config::from_file(Path::new("/nonexistent/pdsdns.toml")),
            Err(ConfigError::Io(_, _))
        ));
    }
}
