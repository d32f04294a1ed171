use std::path::PathBuf;

use chrono_tz::Tz;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var}: cannot parse {value:?}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
    #[error("both RESERVD_TLS_CERT and RESERVD_TLS_KEY must be set, or neither")]
    PartialTls,
}

/// Server settings, read once at startup from `RESERVD_*` variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub user: String,
    pub password: String,
    pub max_connections: usize,
    /// Appends since the last compaction that trigger the next one.
    pub compact_threshold: u64,
    /// Reference zone for the "today" view.
    pub timezone: Tz,
    pub tls: Option<TlsPaths>,
    pub metrics_port: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsPaths {
    pub cert: PathBuf,
    pub key: PathBuf,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as `from_env` with variables taken from `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let tls = match (lookup("RESERVD_TLS_CERT"), lookup("RESERVD_TLS_KEY")) {
            (None, None) => None,
            (Some(cert), Some(key)) => Some(TlsPaths {
                cert: cert.into(),
                key: key.into(),
            }),
            _ => return Err(ConfigError::PartialTls),
        };

        Ok(Self {
            bind: lookup("RESERVD_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            port: parsed(&lookup, "RESERVD_PORT")?.unwrap_or(5433),
            data_dir: lookup("RESERVD_DATA_DIR")
                .unwrap_or_else(|| "./data".into())
                .into(),
            user: lookup("RESERVD_USER").unwrap_or_else(|| "reservd".into()),
            password: lookup("RESERVD_PASSWORD").unwrap_or_else(|| "reservd".into()),
            max_connections: parsed(&lookup, "RESERVD_MAX_CONNECTIONS")?.unwrap_or(256),
            compact_threshold: parsed(&lookup, "RESERVD_COMPACT_THRESHOLD")?.unwrap_or(1000),
            timezone: parsed(&lookup, "RESERVD_TIMEZONE")?.unwrap_or(Tz::UTC),
            tls,
            metrics_port: parsed(&lookup, "RESERVD_METRICS_PORT")?,
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn parsed<T>(lookup: &impl Fn(&str) -> Option<String>, var: &'static str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let Some(value) = lookup(var) else {
        return Ok(None);
    };
    let result = value.trim().parse::<T>();
    match result {
        Ok(v) => Ok(Some(v)),
        Err(e) => Err(ConfigError::Invalid {
            var,
            reason: e.to_string(),
            value,
        }),
    }
}
