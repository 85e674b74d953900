use crate::error::ConfigError;
use serde::Deserialize;
use std::fmt;
use std::num::NonZeroU32;
use std::path::Path;
use std::time::Duration;

/// Admission settings, loaded once at process start.
#[derive(Deserialize, Clone)]
pub struct GateConfig {
    /// Bucket capacity, and tokens regained per minute.
    #[serde(default = "default_rate_limit")]
    pub rate_limit_per_minute: u32,
    /// Buckets untouched for this long are forgotten.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Ceiling on tracked client keys.
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,
    /// Honor `X-Forwarded-For`. Only safe behind a proxy that overwrites it.
    #[serde(default = "default_trust_forwarded")]
    pub trust_forwarded_header: bool,
    /// HS256 secret for bearer credentials. Without it the bearer step is skipped.
    #[serde(default)]
    pub jwt_secret: Option<String>,
}

impl GateConfig {
    /// Read and validate a TOML config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Like [`GateConfig::load`], falling back to defaults when no path is given.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.rate_limit()?;
        if self.max_clients == 0 {
            return Err(ConfigError::InvalidMaxClients);
        }
        if self.idle_timeout_secs == 0 {
            return Err(ConfigError::InvalidIdleTimeout);
        }
        Ok(())
    }

    pub fn rate_limit(&self) -> Result<NonZeroU32, ConfigError> {
        NonZeroU32::new(self.rate_limit_per_minute).ok_or(ConfigError::InvalidRateLimit)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            rate_limit_per_minute: default_rate_limit(),
            idle_timeout_secs: default_idle_timeout_secs(),
            max_clients: default_max_clients(),
            trust_forwarded_header: default_trust_forwarded(),
            jwt_secret: None,
        }
    }
}

impl fmt::Debug for GateConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GateConfig")
            .field("rate_limit_per_minute", &self.rate_limit_per_minute)
            .field("idle_timeout_secs", &self.idle_timeout_secs)
            .field("max_clients", &self.max_clients)
            .field("trust_forwarded_header", &self.trust_forwarded_header)
            .field("jwt_secret", &self.jwt_secret.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

fn default_rate_limit() -> u32 {
    60
}

fn default_idle_timeout_secs() -> u64 {
    300
}

fn default_max_clients() -> usize {
    10_000
}

fn default_trust_forwarded() -> bool {
    true
}
