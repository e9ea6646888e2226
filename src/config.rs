//! Server configuration, read once from the environment at startup.

use std::path::PathBuf;
use std::str::FromStr;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var} must be {expected}, got {value:?}")]
    Malformed {
        var: &'static str,
        expected: &'static str,
        value: String,
    },
    #[error("both FLEETBOOK_TLS_CERT and FLEETBOOK_TLS_KEY must be set, or neither")]
    PartialTls,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    /// WAL appends after which the compactor rewrites the log.
    pub compact_threshold: u64,
    /// Prometheus exporter port; no exporter when unset.
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
}

impl Config {
    /// # Environment Variables
    /// - `FLEETBOOK_PORT` (default 5433)
    /// - `FLEETBOOK_BIND` (default 0.0.0.0)
    /// - `FLEETBOOK_DATA_DIR` (default ./data)
    /// - `FLEETBOOK_PASSWORD` (default fleetbook)
    /// - `FLEETBOOK_MAX_CONNECTIONS` (default 256)
    /// - `FLEETBOOK_COMPACT_THRESHOLD` (default 1000)
    /// - `FLEETBOOK_METRICS_PORT` (optional)
    /// - `FLEETBOOK_TLS_CERT`, `FLEETBOOK_TLS_KEY` (optional, both or neither)
    ///
    /// # Errors
    /// A set but unparseable numeric variable, a zero connection limit, or a
    /// lone TLS path.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from any variable source; `from_env` passes the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let tls_cert = lookup("FLEETBOOK_TLS_CERT");
        let tls_key = lookup("FLEETBOOK_TLS_KEY");
        if tls_cert.is_some() != tls_key.is_some() {
            return Err(ConfigError::PartialTls);
        }

        let max_connections: usize =
            parse_var(&lookup, "FLEETBOOK_MAX_CONNECTIONS", "a positive integer")?.unwrap_or(256);
        if max_connections == 0 {
            return Err(ConfigError::Malformed {
                var: "FLEETBOOK_MAX_CONNECTIONS",
                expected: "a positive integer",
                value: "0".into(),
            });
        }

        Ok(Self {
            port: parse_var(&lookup, "FLEETBOOK_PORT", "a port number")?.unwrap_or(5433),
            bind: lookup("FLEETBOOK_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            data_dir: lookup("FLEETBOOK_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data")),
            password: lookup("FLEETBOOK_PASSWORD").unwrap_or_else(|| "fleetbook".into()),
            max_connections,
            compact_threshold: parse_var(&lookup, "FLEETBOOK_COMPACT_THRESHOLD", "an integer")?
                .unwrap_or(1000),
            metrics_port: parse_var(&lookup, "FLEETBOOK_METRICS_PORT", "a port number")?,
            tls_cert,
            tls_key,
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("fleet.wal")
    }
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    expected: &'static str,
) -> Result<Option<T>, ConfigError> {
    let Some(value) = lookup(var) else {
        return Ok(None);
    };
    value
        .trim()
        .parse()
        .map(Some)
        .map_err(|_| ConfigError::Malformed {
            var,
            expected,
            value,
        })
}
