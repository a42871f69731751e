use serde::{Deserialize, Serialize};

/// The reserved role name; only admins may modify the admin role.
pub const ADMIN_ROLE: &str = "admin";

/// A named permission set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Role {
    pub role_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role_description: Option<String>,
    #[serde(default)]
    pub manage_apis: bool,
    #[serde(default)]
    pub manage_endpoints: bool,
    #[serde(default)]
    pub manage_users: bool,
    #[serde(default)]
    pub manage_roles: bool,
    #[serde(default)]
    pub manage_groups: bool,
    #[serde(default)]
    pub manage_subscriptions: bool,
    #[serde(default)]
    pub manage_credits: bool,
    #[serde(default)]
    pub manage_security: bool,
    #[serde(default)]
    pub manage_gateway: bool,
    #[serde(default)]
    pub manage_routings: bool,
    #[serde(default)]
    pub view_logs: bool,
    #[serde(default)]
    pub export_logs: bool,
    #[serde(default)]
    pub manage_auth: bool,
}

impl Role {
    /// The fully-privileged reserved admin role.
    #[must_use]
    pub fn admin() -> Self {
        Self {
            role_name: ADMIN_ROLE.to_owned(),
            role_description: Some("Reserved administrator role".to_owned()),
            manage_apis: true,
            manage_endpoints: true,
            manage_users: true,
            manage_roles: true,
            manage_groups: true,
            manage_subscriptions: true,
            manage_credits: true,
            manage_security: true,
            manage_gateway: true,
            manage_routings: true,
            view_logs: true,
            export_logs: true,
            manage_auth: true,
        }
    }

    #[must_use]
    pub fn is_reserved(&self) -> bool {
        self.role_name == ADMIN_ROLE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admin_has_every_permission() {
        let r = Role::admin();
        assert!(r.is_reserved());
        assert!(r.manage_gateway && r.manage_auth && r.export_logs);
    }

    #[test]
    fn default_role_has_no_permissions() {
        let r = Role::default();
        assert!(!r.manage_apis && !r.manage_gateway && !r.view_logs);
    }
}
