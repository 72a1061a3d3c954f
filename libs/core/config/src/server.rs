use crate::{env_or_default, env_parse, ConfigError, FromEnv};
use std::net::Ipv4Addr;

const DEFAULT_HEALTH_PORT: u16 = 8082;

/// Listener for the health/metrics/admin HTTP server
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HealthServerConfig {
    pub host: String,
    pub port: u16,
}

impl HealthServerConfig {
    /// Get the server address as "host:port"
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl FromEnv for HealthServerConfig {
    /// - HEALTH_HOST: defaults to 0.0.0.0
    /// - HEALTH_PORT: defaults to 8082
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            host: env_or_default("HEALTH_HOST", &Ipv4Addr::UNSPECIFIED.to_string()),
            port: env_parse("HEALTH_PORT", DEFAULT_HEALTH_PORT)?,
        })
    }
}

impl Default for HealthServerConfig {
    fn default() -> Self {
        Self {
            host: Ipv4Addr::UNSPECIFIED.to_string(),
            port: DEFAULT_HEALTH_PORT,
        }
    }
}
