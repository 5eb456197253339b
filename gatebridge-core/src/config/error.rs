//! Configuration error types.

use std::path::PathBuf;
use thiserror::Error;

/// Configuration loading and validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    // ─────────────────────────────────────────────────────────────────────────
    // Routing and RBAC
    // ─────────────────────────────────────────────────────────────────────────
    /// A route has an empty channel id.
    #[error("route '{route}' has an empty channel_id")]
    EmptyChannel { route: String },

    /// A route has an empty required role.
    #[error("route '{route}' has an empty required_role")]
    EmptyRole { route: String },

    /// An RBAC entry has an empty identity or role.
    #[error("rbac entry '{identity}' is invalid: {reason}")]
    InvalidRbacEntry { identity: String, reason: String },

    // ─────────────────────────────────────────────────────────────────────────
    // Values
    // ─────────────────────────────────────────────────────────────────────────
    /// A URL field does not parse.
    #[error("invalid URL '{url}' for '{field}': {message}")]
    InvalidUrl {
        field: String,
        url: String,
        message: String,
    },

    /// A numeric field is outside its allowed range.
    #[error("invalid value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },

    /// A required string field is empty.
    #[error("'{field}' must not be empty")]
    EmptyField { field: String },

    /// Required environment variable not set.
    #[error("environment variable '{var}' not set (required for field '{field}')")]
    MissingEnvVar { var: String, field: String },

    /// Schema version not supported.
    #[error("unsupported schema version {version}, expected 1")]
    UnsupportedSchemaVersion { version: u32 },

    // ─────────────────────────────────────────────────────────────────────────
    // I/O and parsing
    // ─────────────────────────────────────────────────────────────────────────
    /// YAML parsing error.
    #[error("YAML parse error: {0}")]
    ParseError(#[from] serde_saphyr::Error),

    /// I/O error reading config file.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Config file not found at any search location.
    #[error("configuration file not found (searched: {searched:?})")]
    ConfigFileNotFound { searched: Vec<PathBuf> },

    /// Empty configuration file.
    #[error("configuration file is empty")]
    EmptyConfigFile,
}

/// Validation warnings (non-fatal).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationWarning {
    /// No routes configured; every gate request will be dropped as unroutable.
    EmptyRoutingTable,

    /// An override names a gate type that has no default route.
    OverrideWithoutDefault {
        environment: String,
        gate_type: String,
    },

    /// A route requires a role that no identity holds.
    RoleUnassigned { role: String },

    /// No signing secret; interaction requests are not verified.
    UnsignedInteractions,
}

impl std::fmt::Display for ValidationWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyRoutingTable => {
                write!(f, "routing table is empty; all gate requests are unroutable")
            }
            Self::OverrideWithoutDefault {
                environment,
                gate_type,
            } => write!(
                f,
                "override '{environment}/{gate_type}' has no default route for other environments"
            ),
            Self::RoleUnassigned { role } => {
                write!(f, "role '{role}' is required by a route but held by no identity")
            }
            Self::UnsignedInteractions => write!(
                f,
                "slack.signing_secret is not set; interaction requests will not be verified"
            ),
        }
    }
}

/// Result of configuration validation.
#[derive(Debug)]
pub struct ValidationResult {
    /// Non-fatal warnings encountered during validation.
    pub warnings: Vec<ValidationWarning>,
}

impl ValidationResult {
    /// Create a new validation result with no warnings.
    pub fn ok() -> Self {
        Self {
            warnings: Vec::new(),
        }
    }

    /// Create a new validation result with warnings.
    pub fn with_warnings(warnings: Vec<ValidationWarning>) -> Self {
        Self { warnings }
    }

    /// Check if validation passed with no warnings.
    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }
}
