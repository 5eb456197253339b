//! Process-level defaults that are not part of the YAML file.
//!
//! Each value can be overridden with a `GATEBRIDGE_*` environment variable.

use std::time::Duration;
use tracing::warn;

/// Timeouts and ports used by the binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeDefaults {
    /// Maximum time for graceful shutdown.
    pub shutdown_timeout: Duration,

    /// Time to wait for in-flight work during shutdown.
    /// Must be less than `shutdown_timeout`.
    pub drain_timeout: Duration,

    /// Port for the Slack interaction endpoint.
    pub interactions_port: u16,

    /// Port for `/health`, `/ready` and `/metrics`.
    pub admin_port: u16,

    /// Interval between store reachability probes.
    pub health_check_interval: Duration,
}

impl Default for BridgeDefaults {
    fn default() -> Self {
        Self {
            shutdown_timeout: Duration::from_secs(30),
            drain_timeout: Duration::from_secs(25),
            interactions_port: 3000,
            admin_port: 7469,
            health_check_interval: Duration::from_secs(10),
        }
    }
}

impl BridgeDefaults {
    /// Create defaults from environment variables.
    ///
    /// # Environment Variables
    /// - `GATEBRIDGE_SHUTDOWN_TIMEOUT_SECS`
    /// - `GATEBRIDGE_DRAIN_TIMEOUT_SECS`
    /// - `GATEBRIDGE_INTERACTIONS_PORT`
    /// - `GATEBRIDGE_ADMIN_PORT`
    /// - `GATEBRIDGE_HEALTH_CHECK_INTERVAL_SECS`
    pub fn from_env() -> Self {
        let default = Self::default();

        Self {
            shutdown_timeout: Duration::from_secs(parse_env_warn(
                "GATEBRIDGE_SHUTDOWN_TIMEOUT_SECS",
                default.shutdown_timeout.as_secs(),
            )),
            drain_timeout: Duration::from_secs(parse_env_warn(
                "GATEBRIDGE_DRAIN_TIMEOUT_SECS",
                default.drain_timeout.as_secs(),
            )),
            interactions_port: parse_env_warn(
                "GATEBRIDGE_INTERACTIONS_PORT",
                default.interactions_port,
            ),
            admin_port: parse_env_warn("GATEBRIDGE_ADMIN_PORT", default.admin_port),
            health_check_interval: Duration::from_secs(parse_env_warn(
                "GATEBRIDGE_HEALTH_CHECK_INTERVAL_SECS",
                default.health_check_interval.as_secs(),
            )),
        }
    }

    /// Validate the defaults satisfy invariants.
    ///
    /// # Invariants
    /// 1. `drain_timeout` < `shutdown_timeout`
    /// 2. the two ports differ
    pub fn validate(&self) -> Result<(), String> {
        if self.drain_timeout >= self.shutdown_timeout {
            return Err(format!(
                "drain_timeout ({:?}) must be less than shutdown_timeout ({:?})",
                self.drain_timeout, self.shutdown_timeout
            ));
        }

        if self.interactions_port == self.admin_port {
            return Err(format!(
                "interactions_port and admin_port must differ (both {})",
                self.admin_port
            ));
        }

        Ok(())
    }
}

/// Parse an environment variable with a warning on invalid values.
fn parse_env_warn<T: std::str::FromStr + std::fmt::Display>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(val) => match val.parse::<T>() {
            Ok(parsed) => parsed,
            Err(_) => {
                warn!(
                    env_var = name,
                    value = %val,
                    default = %default,
                    "Invalid value for environment variable, using default"
                );
                default
            }
        },
        Err(_) => default,
    }
}
