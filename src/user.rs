//! User profile derived from validated token claims.
//!
//! A `User` is a bag of claims with named accessors for the fields the engine
//! and UI layers care about (`id`, `roles`, `permissions`, `email`, ...).
//! Unrecognized claims are kept verbatim so newer identity-provider features
//! stay readable without a crate upgrade.

use crate::client::jwt::Claims;
use crate::error::ValidationError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;

/// Represents an authenticated user.
///
/// Re-derived on every login, refresh and cold start; discarded on logout.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct User {
    /// Unique user identifier (the `sub` claim).
    pub id: String,

    /// Roles granted to the user.
    #[serde(default)]
    pub roles: BTreeSet<String>,

    /// Fine-grained permissions granted to the user.
    #[serde(default)]
    pub permissions: BTreeSet<String>,

    /// Every other claim, untouched.
    #[serde(flatten)]
    pub claims: Map<String, Value>,
}

impl User {
    /// Creates a new User with the given ID and no roles or claims.
    ///
    /// # Example
    ///
    /// ```
    /// # use dxauth::User;
    /// let user = User::new("user-123");
    /// assert_eq!(user.id, "user-123");
    /// assert!(user.roles.is_empty());
    /// ```
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    /// Adds roles, builder style.
    pub fn with_roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.roles.extend(roles.into_iter().map(Into::into));
        self
    }

    /// Adds permissions, builder style.
    pub fn with_permissions<I, S>(mut self, permissions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.permissions
            .extend(permissions.into_iter().map(Into::into));
        self
    }

    /// Adds an arbitrary claim, builder style.
    pub fn with_claim(mut self, key: impl Into<String>, value: Value) -> Self {
        self.claims.insert(key.into(), value);
        self
    }

    /// Builds a user from a token payload.
    ///
    /// Payloads that nest the profile under a `user` object are unwrapped.
    /// The id is taken from `sub`, falling back to `id`; a payload with
    /// neither is rejected.
    pub fn from_claims(claims: &Claims) -> Result<Self, ValidationError> {
        let source = match claims.get("user") {
            Some(Value::Object(nested)) => nested.clone(),
            _ => claims.as_map().clone(),
        };
        Self::from_map(source)
    }

    fn from_map(mut map: Map<String, Value>) -> Result<Self, ValidationError> {
        let id = ["sub", "id"]
            .iter()
            .find_map(|key| match map.get(*key) {
                Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
                Some(Value::Number(n)) => Some(n.to_string()),
                _ => None,
            })
            .ok_or_else(|| {
                ValidationError::MalformedToken("token carries no subject".to_string())
            })?;

        let roles = take_string_set(&mut map, "roles");
        let permissions = take_string_set(&mut map, "permissions");
        map.remove("id");

        tracing::trace!(
            "Derived user from claims: id={}, roles={}, permissions={}",
            id,
            roles.len(),
            permissions.len()
        );

        Ok(Self {
            id,
            roles,
            permissions,
            claims: map,
        })
    }

    /// Returns a claim by name.
    pub fn claim(&self, key: &str) -> Option<&Value> {
        self.claims.get(key)
    }

    fn str_claim(&self, key: &str) -> Option<&str> {
        self.claims.get(key).and_then(Value::as_str)
    }

    /// Returns the email address, if present.
    pub fn email(&self) -> Option<&str> {
        self.str_claim("email")
    }

    /// Returns the display name claim, if present.
    pub fn name(&self) -> Option<&str> {
        self.str_claim("name")
    }

    /// Returns the profile picture URL, if present.
    pub fn picture(&self) -> Option<&str> {
        self.str_claim("picture")
    }

    /// Returns a display name for the user.
    ///
    /// Prefers the user's name if available, falls back to email,
    /// and finally to the user ID.
    ///
    /// # Example
    ///
    /// ```
    /// # use dxauth::User;
    /// let user = User::new("user-123").with_claim("email", "jane@example.com".into());
    /// assert_eq!(user.display_name(), "jane@example.com");
    /// ```
    pub fn display_name(&self) -> &str {
        self.name().or(self.email()).unwrap_or(&self.id)
    }

    /// Returns the user's initials for avatar display.
    ///
    /// If the user has a name, returns the first letter of the first two words.
    /// Otherwise, returns the first two characters of the email or ID.
    pub fn initials(&self) -> String {
        if let Some(name) = self.name() {
            let parts: Vec<&str> = name.split_whitespace().collect();
            match parts.len() {
                0 => "??".to_string(),
                1 => parts[0].chars().take(2).collect::<String>().to_uppercase(),
                _ => {
                    let first = parts[0].chars().next().unwrap_or('?');
                    let second = parts[1].chars().next().unwrap_or('?');
                    format!("{}{}", first, second).to_uppercase()
                }
            }
        } else if let Some(email) = self.email() {
            email.chars().take(2).collect::<String>().to_uppercase()
        } else {
            self.id.chars().take(2).collect::<String>().to_uppercase()
        }
    }

    /// Returns true if the user holds `role`.
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.contains(role)
    }

    /// Returns true if the user holds at least one of `roles`.
    ///
    /// # Example
    ///
    /// ```
    /// # use dxauth::User;
    /// let user = User::new("u1").with_roles(["admin", "editor"]);
    /// assert!(user.has_any_role(["viewer", "editor"]));
    /// assert!(!user.has_any_role(["owner"]));
    /// ```
    pub fn has_any_role<I, S>(&self, roles: I) -> bool
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        roles.into_iter().any(|r| self.has_role(r.as_ref()))
    }

    /// Returns true if the user holds `permission`.
    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions.contains(permission)
    }

    /// Returns true if the user holds at least one of `permissions`.
    pub fn has_any_permission<I, S>(&self, permissions: I) -> bool
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        permissions
            .into_iter()
            .any(|p| self.has_permission(p.as_ref()))
    }
}

/// Removes `key` from the map and reads it as a set of strings.
///
/// Accepts a JSON array or a space-separated string.
fn take_string_set(map: &mut Map<String, Value>, key: &str) -> BTreeSet<String> {
    match map.remove(key) {
        Some(Value::Array(items)) => items
            .into_iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(s),
                _ => None,
            })
            .collect(),
        Some(Value::String(s)) => s.split_whitespace().map(str::to_string).collect(),
        _ => BTreeSet::new(),
    }
}
