//! Daemon configuration.
//!
//! Values come from built-in defaults, then the environment
//! (`PBX_HOST`, `PBX_MAX_EXTENSIONS`), then command-line flags, each layer
//! overriding the previous one. The port has no default and must be given.

use std::env;

use thiserror::Error;

use crate::registry::DEFAULT_MAX_EXTENSIONS;

/// Default listening host (all interfaces)
pub const DEFAULT_HOST: &str = "0.0.0.0";

/// Environment variable overriding the listening host
pub const HOST_ENV: &str = "PBX_HOST";

/// Environment variable overriding the number of extension slots
pub const MAX_EXTENSIONS_ENV: &str = "PBX_MAX_EXTENSIONS";

/// Configuration for one PBX server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PbxConfig {
    /// Host or address to bind
    pub host: String,

    /// TCP port to bind (0 picks an ephemeral port)
    pub port: u16,

    /// Number of extension slots in the exchange
    pub max_extensions: usize,
}

impl PbxConfig {
    /// Creates a configuration with defaults for everything but the port.
    pub fn new(port: u16) -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port,
            max_extensions: DEFAULT_MAX_EXTENSIONS,
        }
    }

    /// Creates a configuration and applies the process environment.
    pub fn from_env(port: u16) -> Result<Self, ConfigError> {
        Self::new(port).apply_env(|key| env::var(key).ok())
    }

    /// Applies overrides from `lookup`, which maps variable names to values.
    pub fn apply_env<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup(HOST_ENV).filter(|h| !h.trim().is_empty()) {
            self.host = host.trim().to_string();
        }

        if let Some(raw) = lookup(MAX_EXTENSIONS_ENV) {
            self.max_extensions = parse_max_extensions(MAX_EXTENSIONS_ENV, &raw)?;
        }

        Ok(self)
    }

    /// Overrides the host.
    #[must_use]
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Overrides the number of extension slots.
    #[must_use]
    pub fn with_max_extensions(mut self, max_extensions: usize) -> Self {
        self.max_extensions = max_extensions;
        self
    }

    /// Returns `host:port`, bracketing IPv6 literals.
    pub fn listen_addr(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// Parses a slot count, rejecting zero. `source` names the setting in errors.
pub fn parse_max_extensions(source: &str, raw: &str) -> Result<usize, ConfigError> {
    match raw.trim().parse::<usize>() {
        Ok(0) => Err(ConfigError::InvalidValue {
            source_name: source.to_string(),
            value: raw.to_string(),
            reason: "must be at least 1".to_string(),
        }),
        Ok(n) => Ok(n),
        Err(e) => Err(ConfigError::InvalidValue {
            source_name: source.to_string(),
            value: raw.to_string(),
            reason: e.to_string(),
        }),
    }
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value '{value}' for {source_name}: {reason}")]
    InvalidValue {
        source_name: String,
        value: String,
        reason: String,
    },
}
