//! Bridge configuration.
//!
//! This module provides:
//! - YAML configuration parsing
//! - Environment variable substitution
//! - Validation errors and warnings
//! - Process-level defaults from `GATEBRIDGE_*` variables
//!
//! # Example
//!
//! ```ignore
//! use gatebridge_core::config::{find_config_file, load_and_validate};
//!
//! let path = find_config_file(None)?;
//! let (config, result) = load_and_validate(&path)?;
//! for warning in &result.warnings {
//!     tracing::warn!(%warning, "Configuration warning");
//! }
//! ```

mod defaults;
mod duration_format;
mod error;
mod loader;
mod schema;

pub use defaults::BridgeDefaults;
pub use duration_format::{parse_duration, redis_millis};
pub use error::{ConfigError, ValidationResult, ValidationWarning};
pub use loader::{
    default_config_paths, find_config_file, load_and_validate, load_config, substitute_env_vars,
    validate,
};
pub use schema::{
    Config, ConsumerSettings, DedupSettings, RedisSettings, SlackSettings, StreamSettings,
};
