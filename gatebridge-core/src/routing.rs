//! Channel routing policy.
//!
//! Maps a gate type (optionally scoped by environment) to the chat channel
//! that should receive its notification and the role a reviewer must hold.
//!
//! Lookup order:
//! 1. `overrides[environment][gate_type]` when an environment is supplied
//! 2. `defaults[gate_type]`
//! 3. no route
//!
//! Lookup is case-sensitive and never fails; a missing route is a normal
//! outcome that the caller logs.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

// ============================================================================
// Channel Config
// ============================================================================

/// Where a gate's notification goes and who may decide it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Destination in the chat surface (e.g. a Slack channel id)
    pub channel_id: String,
    /// Role an actor must hold to approve or reject
    pub required_role: String,
    /// Users or groups to mention in the notification
    #[serde(default)]
    pub mention_targets: BTreeSet<String>,
}

impl ChannelConfig {
    /// Creates a route without mentions.
    #[must_use]
    pub fn new(channel_id: impl Into<String>, required_role: impl Into<String>) -> Self {
        Self {
            channel_id: channel_id.into(),
            required_role: required_role.into(),
            mention_targets: BTreeSet::new(),
        }
    }

    /// Adds a mention target.
    #[must_use]
    pub fn with_mention(mut self, target: impl Into<String>) -> Self {
        self.mention_targets.insert(target.into());
        self
    }
}

// ============================================================================
// Routing Table
// ============================================================================

/// Static routing configuration.
///
/// # Example
/// ```yaml
/// defaults:
///   hitl_4_code:
///     channel_id: C-CODE
///     required_role: reviewer
/// overrides:
///   production:
///     hitl_6_release:
///       channel_id: C-RELEASE-PROD
///       required_role: release_manager
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingTable {
    /// gate_type → route
    #[serde(default)]
    pub defaults: HashMap<String, ChannelConfig>,
    /// environment → gate_type → route
    #[serde(default)]
    pub overrides: HashMap<String, HashMap<String, ChannelConfig>>,
}

impl RoutingTable {
    /// Returns true if no route of any kind is configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.defaults.is_empty() && self.overrides.values().all(HashMap::is_empty)
    }

    /// Iterates over every configured route (defaults and overrides).
    pub fn all_routes(&self) -> impl Iterator<Item = &ChannelConfig> {
        self.defaults
            .values()
            .chain(self.overrides.values().flat_map(HashMap::values))
    }
}

/// Which part of the table produced a route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteSource<'a> {
    /// Environment-specific override
    Override {
        /// The environment that matched
        environment: &'a str,
    },
    /// Default mapping for the gate type
    Default,
}

impl std::fmt::Display for RouteSource<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Override { environment } => write!(f, "override:{environment}"),
            Self::Default => write!(f, "default"),
        }
    }
}

// ============================================================================
// Routing Policy
// ============================================================================

/// Pure lookup over a [`RoutingTable`].
#[derive(Debug, Clone, Default)]
pub struct RoutingPolicy {
    table: RoutingTable,
}

impl RoutingPolicy {
    /// Creates a policy over the given table.
    #[must_use]
    pub fn new(table: RoutingTable) -> Self {
        Self { table }
    }

    /// Returns the underlying table.
    #[must_use]
    pub fn table(&self) -> &RoutingTable {
        &self.table
    }

    /// Resolves the route for a gate type.
    #[must_use]
    pub fn resolve(&self, gate_type: &str, environment: Option<&str>) -> Option<&ChannelConfig> {
        environment
            .and_then(|env| self.table.overrides.get(env))
            .and_then(|routes| routes.get(gate_type))
            .or_else(|| self.table.defaults.get(gate_type))
    }

    /// Resolves the route and reports whether an override or the default
    /// mapping matched.
    #[must_use]
    pub fn resolve_with_source<'a, 'e>(
        &'a self,
        gate_type: &str,
        environment: Option<&'e str>,
    ) -> Option<(&'a ChannelConfig, RouteSource<'e>)> {
        if let Some(env) = environment
            && let Some(config) = self
                .table
                .overrides
                .get(env)
                .and_then(|routes| routes.get(gate_type))
        {
            return Some((config, RouteSource::Override { environment: env }));
        }

        self.table
            .defaults
            .get(gate_type)
            .map(|config| (config, RouteSource::Default))
    }
}
