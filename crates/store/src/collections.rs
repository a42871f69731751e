//! Collection names and their unique indexes.

pub const APIS: &str = "apis";
pub const ENDPOINTS: &str = "endpoints";
pub const USERS: &str = "users";
pub const ROLES: &str = "roles";
pub const GROUPS: &str = "groups";
pub const SUBSCRIPTIONS: &str = "subscriptions";
pub const ROUTINGS: &str = "routings";
pub const CREDIT_DEFS: &str = "credit_defs";
pub const USER_CREDITS: &str = "user_credits";
pub const VAULT: &str = "vault";
pub const ENDPOINT_VALIDATIONS: &str = "endpoint_validations";
pub const SETTINGS: &str = "settings";

/// Every persistent collection, in snapshot order.
pub const ALL: &[&str] = &[
    APIS,
    ENDPOINTS,
    USERS,
    ROLES,
    GROUPS,
    SUBSCRIPTIONS,
    ROUTINGS,
    CREDIT_DEFS,
    USER_CREDITS,
    VAULT,
    ENDPOINT_VALIDATIONS,
    SETTINGS,
];

/// `(collection, composite unique key)` pairs created at startup.
pub const UNIQUE_INDEXES: &[(&str, &[&str])] = &[
    (APIS, &["api_name", "api_version"]),
    (ENDPOINTS, &["api_name", "api_version", "endpoint_method", "endpoint_uri"]),
    (USERS, &["username"]),
    (USERS, &["email"]),
    (ROLES, &["role_name"]),
    (GROUPS, &["group_name"]),
    (SUBSCRIPTIONS, &["username"]),
    (ROUTINGS, &["client_key"]),
    (CREDIT_DEFS, &["api_credit_group"]),
    (USER_CREDITS, &["username"]),
    (VAULT, &["username", "key_name"]),
    (ENDPOINT_VALIDATIONS, &["endpoint_id"]),
];
