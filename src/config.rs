use std::fs::File;
use std::io::{self, BufReader};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use pgwire::tokio::tokio_rustls::rustls::ServerConfig;
use pgwire::tokio::TlsAcceptor;

use crate::engine::{EngineOptions, RetryPolicy};
use crate::limits::*;
use crate::model::Ms;

/// Server settings, read from `TIMESLOT_*` environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    pub lease_ttl_ms: Ms,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub reaper_interval_ms: u64,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key → value source. Unparseable numbers fall back to
    /// their defaults.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let tls_cert = get("TIMESLOT_TLS_CERT").map(PathBuf::from);
        let tls_key = get("TIMESLOT_TLS_KEY").map(PathBuf::from);
        if tls_cert.is_some() != tls_key.is_some() {
            return Err(ConfigError::TlsPairIncomplete);
        }

        let max_attempts: u32 = parsed(&get, "TIMESLOT_MAX_ATTEMPTS").unwrap_or(MAX_ATTEMPTS);
        let lease_ttl_ms: Ms = parsed(&get, "TIMESLOT_LEASE_TTL_MS").unwrap_or(LEASE_TTL_MS);
        if max_attempts == 0 {
            return Err(ConfigError::Invalid("TIMESLOT_MAX_ATTEMPTS must be at least 1"));
        }
        if lease_ttl_ms <= 0 {
            return Err(ConfigError::Invalid("TIMESLOT_LEASE_TTL_MS must be positive"));
        }

        Ok(Self {
            bind: get("TIMESLOT_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            port: parsed(&get, "TIMESLOT_PORT").unwrap_or(5433),
            data_dir: get("TIMESLOT_DATA_DIR").map_or_else(|| PathBuf::from("./data"), PathBuf::from),
            password: get("TIMESLOT_PASSWORD").unwrap_or_else(|| "timeslot".into()),
            max_connections: parsed(&get, "TIMESLOT_MAX_CONNECTIONS").unwrap_or(256),
            compact_threshold: parsed(&get, "TIMESLOT_COMPACT_THRESHOLD").unwrap_or(1000),
            metrics_port: parsed(&get, "TIMESLOT_METRICS_PORT"),
            tls_cert,
            tls_key,
            lease_ttl_ms,
            max_attempts,
            backoff_base_ms: parsed(&get, "TIMESLOT_BACKOFF_BASE_MS").unwrap_or(BACKOFF_BASE_MS),
            reaper_interval_ms: parsed(&get, "TIMESLOT_REAPER_INTERVAL_MS").unwrap_or(REAPER_INTERVAL_MS),
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn metrics_addr(&self) -> Option<SocketAddr> {
        self.metrics_port.map(|port| ([0, 0, 0, 0], port).into())
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("timeslot.wal")
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_millis(self.reaper_interval_ms.max(1))
    }

    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            lease_ttl_ms: self.lease_ttl_ms,
            retry: RetryPolicy {
                max_attempts: self.max_attempts,
                backoff_base: Duration::from_millis(self.backoff_base_ms),
                jitter: true,
            },
        }
    }

    /// TLS acceptor for the configured cert/key pair, if any.
    pub fn tls_acceptor(&self) -> Result<Option<TlsAcceptor>, ConfigError> {
        let (Some(cert_path), Some(key_path)) = (&self.tls_cert, &self.tls_key) else {
            return Ok(None);
        };

        let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(File::open(cert_path)?))
            .collect::<Result<_, _>>()?;

        let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(key_path)?))?
            .ok_or(ConfigError::Invalid("no private key found in key file"))?;

        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| ConfigError::Tls(io::Error::new(io::ErrorKind::InvalidInput, e)))?;

        config.alpn_protocols = vec![b"postgresql".to_vec()];

        Ok(Some(TlsAcceptor::from(Arc::new(config))))
    }
}

fn parsed<T: FromStr>(get: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    get(key).and_then(|s| s.trim().parse().ok())
}

#[derive(Debug)]
pub enum ConfigError {
    TlsPairIncomplete,
    Invalid(&'static str),
    Tls(io::Error),
}

impl From<io::Error> for ConfigError {
    fn from(e: io::Error) -> Self {
        ConfigError::Tls(e)
    }
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::TlsPairIncomplete => write!(
                f,
                "both TIMESLOT_TLS_CERT and TIMESLOT_TLS_KEY must be set, or neither"
            ),
            ConfigError::Invalid(msg) => write!(f, "invalid configuration: {msg}"),
            ConfigError::Tls(e) => write!(f, "TLS setup failed: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Tls(e) => Some(e),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| env.get(key).cloned())
    }

    #[test]
    fn defaults() {
        let c = config(&[]).unwrap();
        assert_eq!(c.listen_addr(), "0.0.0.0:5433");
        assert_eq!(c.wal_path(), PathBuf::from("./data").join("timeslot.wal"));
        assert_eq!(c.password, "timeslot");
        assert_eq!(c.max_connections, 256);
        assert_eq!(c.compact_threshold, 1000);
        assert_eq!(c.metrics_addr(), None);
        assert_eq!(c.lease_ttl_ms, 500);
        assert_eq!(c.engine_options().retry.max_attempts, 5);
        assert_eq!(
            c.engine_options().retry.backoff_base,
            Duration::from_millis(50)
        );
        assert_eq!(c.reaper_interval(), Duration::from_secs(5));
        assert!(c.tls_acceptor().unwrap().is_none());
    }

    #[test]
    fn overrides_and_bad_numbers() {
        let c = config(&[
            ("TIMESLOT_PORT", "6000"),
            ("TIMESLOT_LEASE_TTL_MS", "250"),
            ("TIMESLOT_MAX_ATTEMPTS", "lots"),
            ("TIMESLOT_METRICS_PORT", "9100"),
        ])
        .unwrap();
        assert_eq!(c.port, 6000);
        assert_eq!(c.lease_ttl_ms, 250);
        assert_eq!(c.max_attempts, MAX_ATTEMPTS);
        assert_eq!(c.metrics_addr(), Some(([0, 0, 0, 0], 9100).into()));
    }

    #[test]
    fn tls_needs_both_halves() {
        assert!(matches!(
            config(&[("TIMESLOT_TLS_CERT", "cert.pem")]),
            Err(ConfigError::TlsPairIncomplete)
        ));
    }

    #[test]
    fn missing_tls_files_surface_io_error() {
        let c = config(&[
            ("TIMESLOT_TLS_CERT", "/nonexistent/cert.pem"),
            ("TIMESLOT_TLS_KEY", "/nonexistent/key.pem"),
        ])
        .unwrap();
        assert!(matches!(c.tls_acceptor(), Err(ConfigError::Tls(_))));
    }

    #[test]
    fn zero_attempts_rejected() {
        assert!(matches!(
            config(&[("TIMESLOT_MAX_ATTEMPTS", "0")]),
            Err(ConfigError::Invalid(_))
        ));
    }
}
