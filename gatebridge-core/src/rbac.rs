//! Role-based authorization over a static identity → roles map.
//!
//! Identities come from the chat surface and are trusted as-is. An identity
//! that is not in the map holds no roles.

use std::collections::{BTreeSet, HashMap};
use tracing::debug;

use crate::gate::GateError;
use crate::routing::ChannelConfig;

/// identity → roles, as loaded from configuration.
pub type RbacMap = HashMap<String, BTreeSet<String>>;

/// Pure role lookups. Holds no state beyond the map it was built from.
#[derive(Debug, Clone, Default)]
pub struct RbacValidator {
    roles: RbacMap,
}

impl RbacValidator {
    /// Creates a validator over the given map.
    #[must_use]
    pub fn new(roles: RbacMap) -> Self {
        Self { roles }
    }

    /// Returns the roles held by an identity (empty for unknown identities).
    pub fn roles_of<'a>(&'a self, identity: &str) -> impl Iterator<Item = &'a str> + 'a {
        self.roles
            .get(identity)
            .into_iter()
            .flat_map(|roles| roles.iter().map(String::as_str))
    }

    /// Returns true if `identity` holds `role`.
    #[must_use]
    pub fn has_role(&self, identity: &str, role: &str) -> bool {
        self.roles
            .get(identity)
            .is_some_and(|roles| roles.contains(role))
    }

    /// Returns true if `identity` may decide a gate routed to `channel`.
    #[must_use]
    pub fn authorize(&self, identity: &str, gate_type: &str, channel: &ChannelConfig) -> bool {
        let allowed = self.has_role(identity, &channel.required_role);
        debug!(
            actor = %identity,
            gate_type = %gate_type,
            required_role = %channel.required_role,
            allowed,
            "RBAC check"
        );
        allowed
    }

    /// Like [`authorize`](Self::authorize) but returns the tagged error.
    ///
    /// # Errors
    ///
    /// Returns `GateError::RbacDenied` naming the missing role.
    pub fn require(
        &self,
        identity: &str,
        gate_type: &str,
        channel: &ChannelConfig,
    ) -> Result<(), GateError> {
        if self.authorize(identity, gate_type, channel) {
            Ok(())
        } else {
            Err(GateError::RbacDenied {
                actor: identity.to_string(),
                role: channel.required_role.clone(),
            })
        }
    }
}
