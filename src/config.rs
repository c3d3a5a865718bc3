use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::engine::TransitionPolicy;
use crate::tenant::TenantOptions;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var}: cannot parse {value:?}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
    #[error("both HOTELIER_TLS_CERT and HOTELIER_TLS_KEY must be set, or neither")]
    PartialTls,
    #[error("HOTELIER_USERS entry {0:?} is not of the form name:password")]
    BadUserEntry(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsPaths {
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// Server settings, read from `HOTELIER_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    /// Shared password for any user without an entry in `users`.
    pub password: String,
    /// Staff accounts with their own password.
    pub users: HashMap<String, String>,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub sweep_interval: Duration,
    pub allow_reopen: bool,
    pub metrics_port: Option<u16>,
    pub tls: Option<TlsPaths>,
}

fn parse<T>(var: &'static str, raw: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match raw {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            var,
            reason: e.to_string(),
            value,
        }),
    }
}

fn parse_bool(var: &'static str, raw: Option<String>) -> Result<bool, ConfigError> {
    match raw.as_deref().map(|v| v.trim().to_ascii_lowercase()) {
        None => Ok(false),
        Some(v) => match v.as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" | "" => Ok(false),
            _ => Err(ConfigError::Invalid {
                var,
                value: v,
                reason: "expected true or false".into(),
            }),
        },
    }
}

fn parse_users(raw: Option<String>) -> Result<HashMap<String, String>, ConfigError> {
    let mut users = HashMap::new();
    let Some(raw) = raw else { return Ok(users) };
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        match entry.split_once(':') {
            Some((name, pw)) if !name.trim().is_empty() && !pw.is_empty() => {
                users.insert(name.trim().to_string(), pw.to_string());
            }
            _ => return Err(ConfigError::BadUserEntry(entry.to_string())),
        }
    }
    Ok(users)
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; `from_env` passes the process environment.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let sweep_secs: u64 = parse(
            "HOTELIER_SWEEP_INTERVAL_SECS",
            get("HOTELIER_SWEEP_INTERVAL_SECS"),
            60,
        )?;
        if sweep_secs == 0 {
            return Err(ConfigError::Invalid {
                var: "HOTELIER_SWEEP_INTERVAL_SECS",
                value: "0".into(),
                reason: "must be at least 1".into(),
            });
        }
        let max_connections = parse("HOTELIER_MAX_CONNECTIONS", get("HOTELIER_MAX_CONNECTIONS"), 256)?;
        if max_connections == 0 {
            return Err(ConfigError::Invalid {
                var: "HOTELIER_MAX_CONNECTIONS",
                value: "0".into(),
                reason: "must be at least 1".into(),
            });
        }
        let metrics_port = match get("HOTELIER_METRICS_PORT") {
            None => None,
            Some(raw) => Some(parse("HOTELIER_METRICS_PORT", Some(raw), 0u16)?),
        };
        let tls = match (get("HOTELIER_TLS_CERT"), get("HOTELIER_TLS_KEY")) {
            (None, None) => None,
            (Some(cert), Some(key)) => Some(TlsPaths {
                cert: cert.into(),
                key: key.into(),
            }),
            _ => return Err(ConfigError::PartialTls),
        };

        Ok(Self {
            port: parse("HOTELIER_PORT", get("HOTELIER_PORT"), 5433)?,
            bind: get("HOTELIER_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            data_dir: get("HOTELIER_DATA_DIR").unwrap_or_else(|| "./data".into()).into(),
            password: get("HOTELIER_PASSWORD").unwrap_or_else(|| "hotelier".into()),
            users: parse_users(get("HOTELIER_USERS"))?,
            max_connections,
            compact_threshold: parse(
                "HOTELIER_COMPACT_THRESHOLD",
                get("HOTELIER_COMPACT_THRESHOLD"),
                1000,
            )?,
            sweep_interval: Duration::from_secs(sweep_secs),
            allow_reopen: parse_bool("HOTELIER_ALLOW_REOPEN", get("HOTELIER_ALLOW_REOPEN"))?,
            metrics_port,
            tls,
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn tenant_options(&self) -> TenantOptions {
        TenantOptions {
            compact_threshold: self.compact_threshold,
            sweep_interval: self.sweep_interval,
            policy: TransitionPolicy {
                allow_reopen: self.allow_reopen,
            },
        }
    }
}
