use std::path::PathBuf;
use thiserror::Error;

/// Startup configuration problems. All of these are fatal.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("rate_limit_per_minute must be greater than zero")]
    InvalidRateLimit,

    #[error("max_clients must be greater than zero")]
    InvalidMaxClients,

    #[error("idle_timeout_secs must be greater than zero")]
    InvalidIdleTimeout,

    #[error("failed to read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Reasons a bearer credential yields no subject.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum TokenError {
    #[error("malformed token: {0}")]
    Malformed(&'static str),

    #[error("unsupported signing algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("signature mismatch")]
    BadSignature,

    #[error("token expired at {0}")]
    Expired(u64),

    #[error("token has no subject")]
    MissingSubject,
}
