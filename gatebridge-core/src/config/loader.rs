//! Configuration loading and validation.
//!
//! Loading flow: locate file → read → substitute `${VAR}` → parse YAML →
//! validate. Validation stops at the first error and collects warnings.

use regex::Regex;
use reqwest::Url;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use super::error::{ConfigError, ValidationResult, ValidationWarning};
use super::schema::Config;
use crate::routing::ChannelConfig;

/// Configuration file search paths (in priority order).
pub fn default_config_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    if let Ok(path) = std::env::var("GATEBRIDGE_CONFIG") {
        paths.push(PathBuf::from(path));
    }
    paths.push(PathBuf::from("/etc/gatebridge/config.yaml"));
    paths.push(PathBuf::from("./config.yaml"));

    paths
}

/// Find the first existing config file.
///
/// An explicit path (CLI flag) is used as-is and never falls back.
pub fn find_config_file(explicit_path: Option<&Path>) -> Result<PathBuf, ConfigError> {
    if let Some(path) = explicit_path {
        if path.exists() {
            return Ok(path.to_path_buf());
        }
        return Err(ConfigError::ConfigFileNotFound {
            searched: vec![path.to_path_buf()],
        });
    }

    let paths = default_config_paths();
    for path in &paths {
        if path.exists() {
            return Ok(path.clone());
        }
    }

    Err(ConfigError::ConfigFileNotFound { searched: paths })
}

/// Load configuration from a file path without validating it.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let contents = std::fs::read_to_string(path)?;

    if contents.trim().is_empty() {
        return Err(ConfigError::EmptyConfigFile);
    }

    let contents = substitute_env_vars(&contents)?;
    let config: Config = serde_saphyr::from_str(&contents)?;

    Ok(config)
}

/// Load and validate configuration.
pub fn load_and_validate(path: &Path) -> Result<(Config, ValidationResult), ConfigError> {
    let config = load_config(path)?;
    let result = validate(&config)?;
    Ok((config, result))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Environment Variable Substitution
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

// SAFETY: .expect() on LazyLock with a compile-time literal regex pattern.
// The pattern is known-valid and tested by test_env_var_pattern_compiles().
static ENV_VAR_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}")
        .expect("BUG: ENV_VAR_PATTERN regex is invalid")
});

/// Substitute environment variables in a string.
///
/// # Syntax
/// - `${VAR}` - Required, fail if not set
/// - `${VAR:-default}` - Optional with default
pub fn substitute_env_vars(content: &str) -> Result<String, ConfigError> {
    let mut missing = None;

    let result = ENV_VAR_PATTERN.replace_all(content, |cap: &regex::Captures<'_>| {
        let var_name = &cap[1];
        match std::env::var(var_name) {
            Ok(value) => value,
            Err(_) => match cap.get(2) {
                Some(default) => default.as_str().to_string(),
                None => {
                    missing.get_or_insert_with(|| var_name.to_string());
                    String::new()
                }
            },
        }
    });

    if let Some(var) = missing {
        return Err(ConfigError::MissingEnvVar {
            var,
            field: "configuration".to_string(),
        });
    }

    Ok(result.into_owned())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Validate a configuration.
pub fn validate(config: &Config) -> Result<ValidationResult, ConfigError> {
    let mut warnings = Vec::new();

    if config.schema != 1 {
        return Err(ConfigError::UnsupportedSchemaVersion {
            version: config.schema,
        });
    }

    validate_url("redis.url", &config.redis.url)?;
    validate_url("evidence_base_url", &config.evidence_base_url)?;

    for (field, value) in [
        ("streams.events", &config.streams.events),
        ("streams.group", &config.streams.group),
        ("streams.instance", &config.streams.instance),
    ] {
        if value.trim().is_empty() {
            return Err(ConfigError::EmptyField {
                field: field.to_string(),
            });
        }
    }
    if config.streams.consumers == 0 {
        return Err(ConfigError::InvalidValue {
            field: "streams.consumers".to_string(),
            reason: "must be at least 1".to_string(),
        });
    }
    if config.consumer.batch_size == 0 {
        return Err(ConfigError::InvalidValue {
            field: "consumer.batch_size".to_string(),
            reason: "must be at least 1".to_string(),
        });
    }
    if config.consumer.claim_lease.is_zero() {
        return Err(ConfigError::InvalidValue {
            field: "consumer.claim_lease".to_string(),
            reason: "must be greater than zero".to_string(),
        });
    }
    if config.dedup.ttl.is_zero() {
        return Err(ConfigError::InvalidValue {
            field: "dedup.ttl".to_string(),
            reason: "must be greater than zero".to_string(),
        });
    }

    if let Some(slack) = &config.slack {
        if slack.bot_token.trim().is_empty() {
            return Err(ConfigError::EmptyField {
                field: "slack.bot_token".to_string(),
            });
        }
        if let Some(base) = &slack.api_base_url {
            validate_url("slack.api_base_url", base)?;
        }
        if slack.rate_limit_per_sec == 0 {
            return Err(ConfigError::InvalidValue {
                field: "slack.rate_limit_per_sec".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if slack.signing_secret().is_none() {
            warnings.push(ValidationWarning::UnsignedInteractions);
        }
    }

    // Routes
    for (gate_type, route) in &config.routing.defaults {
        validate_route(&format!("defaults.{gate_type}"), route)?;
    }
    for (environment, routes) in &config.routing.overrides {
        for (gate_type, route) in routes {
            validate_route(&format!("overrides.{environment}.{gate_type}"), route)?;
            if !config.routing.defaults.contains_key(gate_type) {
                warnings.push(ValidationWarning::OverrideWithoutDefault {
                    environment: environment.clone(),
                    gate_type: gate_type.clone(),
                });
            }
        }
    }
    if config.routing.is_empty() {
        warnings.push(ValidationWarning::EmptyRoutingTable);
    }

    // RBAC
    for (identity, roles) in &config.rbac {
        if identity.trim().is_empty() {
            return Err(ConfigError::InvalidRbacEntry {
                identity: identity.clone(),
                reason: "identity must not be empty".to_string(),
            });
        }
        if roles.iter().any(|role| role.trim().is_empty()) {
            return Err(ConfigError::InvalidRbacEntry {
                identity: identity.clone(),
                reason: "roles must not be empty".to_string(),
            });
        }
    }

    let held: BTreeSet<&str> = config
        .rbac
        .values()
        .flat_map(|roles| roles.iter().map(String::as_str))
        .collect();
    let required: BTreeSet<&str> = config
        .routing
        .all_routes()
        .map(|route| route.required_role.as_str())
        .collect();
    for role in required.difference(&held) {
        warnings.push(ValidationWarning::RoleUnassigned {
            role: (*role).to_string(),
        });
    }

    Ok(ValidationResult::with_warnings(warnings))
}

fn validate_route(name: &str, route: &ChannelConfig) -> Result<(), ConfigError> {
    if route.channel_id.trim().is_empty() {
        return Err(ConfigError::EmptyChannel {
            route: name.to_string(),
        });
    }
    if route.required_role.trim().is_empty() {
        return Err(ConfigError::EmptyRole {
            route: name.to_string(),
        });
    }
    Ok(())
}

fn validate_url(field: &str, url: &str) -> Result<(), ConfigError> {
    Url::parse(url)
        .map(|_| ())
        .map_err(|e| ConfigError::InvalidUrl {
            field: field.to_string(),
            url: url.to_string(),
            message: e.to_string(),
        })
}
