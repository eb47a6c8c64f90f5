//! # Access Control
//!
//! Privileged ledger operations take an explicit [`Credential`] and check it
//! against an access-control list at the call boundary. Nothing is trusted
//! ambiently: a caller that cannot present a credential holding the right
//! [`Role`] is refused before any state is read.

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from role checks and grant management.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AccessError {
    /// The credential does not carry the role the operation needs.
    #[error("'{principal}' lacks role {role}")]
    MissingRole {
        /// Who asked.
        principal: String,
        /// What they would have needed.
        role: Role,
    },

    /// Removing this grant would leave the ledger without an admin.
    #[error("cannot revoke the last admin")]
    LastAdmin,
}

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Roles recognised by the escrow ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    /// Manages grants.
    Admin,
    /// May execute and refund intents.
    Executor,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Admin => write!(f, "Admin"),
            Role::Executor => write!(f, "Executor"),
        }
    }
}

/// The identity a caller presents with a privileged request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Credential {
    principal: String,
}

impl Credential {
    pub fn new(principal: impl Into<String>) -> Self {
        Self {
            principal: principal.into(),
        }
    }

    pub fn principal(&self) -> &str {
        &self.principal
    }
}

/// Role grants, keyed by principal.
#[derive(Debug, Default)]
pub struct AccessControl {
    grants: RwLock<HashMap<String, HashSet<Role>>>,
}

impl AccessControl {
    /// Creates a list whose only grant is `Admin` for `admin`.
    pub fn new(admin: &Credential) -> Self {
        let acl = Self::default();
        acl.grants
            .write()
            .entry(admin.principal.clone())
            .or_default()
            .insert(Role::Admin);
        acl
    }

    /// Fails unless `credential` holds `role`.
    pub fn require(&self, credential: &Credential, role: Role) -> Result<(), AccessError> {
        if self.has_role(credential.principal(), role) {
            Ok(())
        } else {
            Err(AccessError::MissingRole {
                principal: credential.principal.clone(),
                role,
            })
        }
    }

    pub fn has_role(&self, principal: &str, role: Role) -> bool {
        self.grants
            .read()
            .get(principal)
            .is_some_and(|roles| roles.contains(&role))
    }

    /// Grants `role` to `principal`. Only admins may grant.
    pub fn grant(&self, by: &Credential, principal: &str, role: Role) -> Result<(), AccessError> {
        self.require(by, Role::Admin)?;
        self.grants
            .write()
            .entry(principal.to_string())
            .or_default()
            .insert(role);
        tracing::info!(by = by.principal(), principal, %role, "role granted");
        Ok(())
    }

    /// Revokes `role` from `principal`. Only admins may revoke, and the last
    /// admin cannot be removed.
    pub fn revoke(&self, by: &Credential, principal: &str, role: Role) -> Result<(), AccessError> {
        self.require(by, Role::Admin)?;
        let mut grants = self.grants.write();
        if role == Role::Admin {
            let admins = grants
                .values()
                .filter(|roles| roles.contains(&Role::Admin))
                .count();
            let target_is_admin = grants
                .get(principal)
                .is_some_and(|roles| roles.contains(&Role::Admin));
            if target_is_admin && admins == 1 {
                return Err(AccessError::LastAdmin);
            }
        }
        if let Some(roles) = grants.get_mut(principal) {
            roles.remove(&role);
        }
        tracing::info!(by = by.principal(), principal, %role, "role revoked");
        Ok(())
    }
}
