// ABOUTME: Authenticated caller identity handed to the router and admin surface

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::record::TenantId;

/// Role required for mutating admin operations.
pub const ADMIN_ROLE: &str = "admin";

/// Caller identity, already authenticated upstream and trusted as-is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    /// `None` for callers outside any tenant; they only see global servers
    pub tenant_id: Option<TenantId>,
    pub principal: String,
    #[serde(default)]
    pub roles: BTreeSet<String>,
}

impl Principal {
    pub fn new(principal: impl Into<String>) -> Self {
        Self {
            tenant_id: None,
            principal: principal.into(),
            roles: BTreeSet::new(),
        }
    }

    pub fn with_tenant(mut self, tenant: impl Into<String>) -> Self {
        self.tenant_id = Some(TenantId::new(tenant));
        self
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.roles.insert(role.into());
        self
    }

    /// The gateway itself, used for config-driven and CLI operations.
    pub fn system() -> Self {
        Self::new("system").with_role(ADMIN_ROLE)
    }

    pub fn tenant(&self) -> Option<&TenantId> {
        self.tenant_id.as_ref()
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.contains(role)
    }

    pub fn is_admin(&self) -> bool {
        self.has_role(ADMIN_ROLE)
    }
}
