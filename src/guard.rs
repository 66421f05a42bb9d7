//! Access policies for routes and actions.
//!
//! A policy is checked against a published `AuthState`, so UI adapters can
//! gate a page or a button without touching tokens.

use crate::client::engine::AuthState;
use serde::{Deserialize, Serialize};

/// Why a policy rejected the current state.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AccessDenied {
    #[error("Authentication required")]
    Unauthenticated,

    #[error("Missing required role (one of: {})", .0.join(", "))]
    InsufficientRole(Vec<String>),

    #[error("Missing required permission (one of: {})", .0.join(", "))]
    InsufficientPermission(Vec<String>),
}

/// Requirements a state must meet.
///
/// Role and permission lists are "any-of": holding one entry is enough.
/// Listing roles or permissions implies `require_auth`.
///
/// # Example
///
/// ```
/// # use dxauth::guard::AccessPolicy;
/// let policy = AccessPolicy::authenticated().with_roles(["admin", "editor"]);
/// assert!(policy.require_auth);
/// assert_eq!(policy.required_roles.len(), 2);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessPolicy {
    pub require_auth: bool,
    pub required_roles: Vec<String>,
    pub required_permissions: Vec<String>,
}

impl AccessPolicy {
    /// A policy that admits everyone.
    pub fn public() -> Self {
        Self::default()
    }

    /// A policy that admits any authenticated user.
    pub fn authenticated() -> Self {
        Self {
            require_auth: true,
            ..Self::default()
        }
    }

    pub fn with_roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.require_auth = true;
        self.required_roles = roles.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_permissions<I, S>(mut self, permissions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.require_auth = true;
        self.required_permissions = permissions.into_iter().map(Into::into).collect();
        self
    }

    /// Checks `state` against the policy.
    pub fn check(&self, state: &AuthState) -> Result<(), AccessDenied> {
        let needs_user = self.require_auth
            || !self.required_roles.is_empty()
            || !self.required_permissions.is_empty();
        if !needs_user {
            return Ok(());
        }

        let Some(user) = state.user.as_ref().filter(|_| state.is_authenticated) else {
            return Err(AccessDenied::Unauthenticated);
        };

        if !self.required_roles.is_empty() && !user.has_any_role(&self.required_roles) {
            tracing::trace!("User {} lacks required role", user.id);
            return Err(AccessDenied::InsufficientRole(self.required_roles.clone()));
        }

        if !self.required_permissions.is_empty()
            && !user.has_any_permission(&self.required_permissions)
        {
            tracing::trace!("User {} lacks required permission", user.id);
            return Err(AccessDenied::InsufficientPermission(
                self.required_permissions.clone(),
            ));
        }

        Ok(())
    }
}
