//! The combined authorization decision.
//!
//! Evaluated strictly in order: inactive API, public bypass, claims,
//! IP policy, geographic policy, role, then group/subscription. Admin
//! (`manage_gateway`) bypasses role and subscription checks only — IP and
//! geo rules still apply.

use std::net::IpAddr;

use doorman_core::{Api, AuthClaims, Group, IpMode, Role, Subscription, User};

use crate::error::GatewayError;
use crate::geo::cidr_contains;

/// Everything the resolver looks at, pre-fetched by the pipeline.
#[derive(Debug)]
pub struct AuthzInput<'a> {
    pub api: &'a Api,
    pub claims: Option<&'a AuthClaims>,
    pub user: Option<&'a User>,
    pub role: Option<&'a Role>,
    /// The caller's effective groups (always includes `ALL`).
    pub user_groups: &'a [String],
    /// Definitions of those groups, for `api_access` grants.
    pub group_defs: &'a [Group],
    pub subscription: Option<&'a Subscription>,
    pub client_ip: IpAddr,
    /// Country resolved from the client IP, when the resolver knows it.
    pub country: Option<&'a str>,
}

/// Whether `ip` matches a list entry (exact address or CIDR block).
fn ip_entry_matches(entry: &str, ip: IpAddr) -> bool {
    if let Some((net, len)) = entry.split_once('/') {
        if let (Ok(network), Ok(prefix_len)) = (net.parse::<IpAddr>(), len.parse::<u8>()) {
            return cidr_contains(network, prefix_len, ip);
        }
        return false;
    }
    entry.parse::<IpAddr>().is_ok_and(|listed| listed == ip)
}

fn check_ip_policy(api: &Api, ip: IpAddr) -> Result<(), GatewayError> {
    match api.api_ip_mode.unwrap_or_default() {
        IpMode::AllowAll => Ok(()),
        IpMode::AllowListOnly => {
            if api.api_ip_allow.iter().any(|entry| ip_entry_matches(entry, ip)) {
                Ok(())
            } else {
                Err(GatewayError::IpDenied)
            }
        }
        IpMode::DenyList => {
            if api.api_ip_deny.iter().any(|entry| ip_entry_matches(entry, ip)) {
                Err(GatewayError::IpDenied)
            } else {
                Ok(())
            }
        }
    }
}

/// The ordered decision list of the authorization resolver.
pub fn authorize(input: &AuthzInput<'_>) -> Result<(), GatewayError> {
    let api = input.api;

    // 1. Inactive APIs deny everything, including public callers.
    if !api.active {
        return Err(GatewayError::ApiNotFound);
    }

    // 2. Public APIs bypass authentication and subscription entirely.
    if api.api_public {
        return Ok(());
    }

    // 3. Authentication required from here on.
    let Some(claims) = input.claims else {
        return Err(GatewayError::TokenMissing);
    };
    let Some(user) = input.user else {
        return Err(GatewayError::TokenInvalid);
    };
    if !user.active {
        return Err(GatewayError::UserInactive);
    }

    // 4. IP policy.
    check_ip_policy(api, input.client_ip)?;

    // 5. Geographic policy.
    if let Some(country) = input.country
        && api
            .api_country_deny
            .iter()
            .any(|denied| denied.eq_ignore_ascii_case(country))
    {
        return Err(GatewayError::GeoDenied);
    }

    let is_admin = input.role.is_some_and(|role| role.manage_gateway);

    // 6. Role check. An empty allowed-roles set leaves roles unrestricted.
    if !is_admin
        && !api.api_allowed_roles.is_empty()
        && !api.api_allowed_roles.contains(&claims.role)
    {
        return Err(GatewayError::RoleDenied);
    }

    // 7. Group / subscription check.
    if is_admin {
        return Ok(());
    }
    let group_allowed = input
        .user_groups
        .iter()
        .any(|group| api.api_allowed_groups.contains(group));
    let name_version = api.name_version();
    let group_grant = input
        .group_defs
        .iter()
        .any(|group| group.grants(&name_version));
    let subscribed = input
        .subscription
        .is_some_and(|sub| sub.is_subscribed(&name_version));

    if group_allowed || group_grant || subscribed {
        Ok(())
    } else {
        Err(GatewayError::SubscriptionRequired)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, BTreeSet};

    use doorman_core::{ApiType, TokenType};

    use super::*;

    fn api() -> Api {
        Api {
            api_name: "echo".into(),
            api_version: "v1".into(),
            api_id: "api-1".into(),
            api_type: ApiType::Rest,
            active: true,
            api_servers: vec!["http://up/".into()],
            api_allowed_retry_count: 0,
            api_allowed_roles: BTreeSet::from(["client".to_owned()]),
            api_allowed_groups: BTreeSet::from(["ALL".to_owned()]),
            api_public: false,
            api_credits_enabled: false,
            api_credit_group: None,
            api_ip_allow: vec![],
            api_ip_deny: vec![],
            api_ip_mode: None,
            api_country_deny: vec![],
            api_cors_allow_origins: vec![],
            api_wsdl_url: None,
            api_grpc_package: None,
            api_openapi_url: None,
            api_transforms: None,
            dynamic_attributes: BTreeMap::new(),
            created_at: None,
        }
    }

    fn claims() -> AuthClaims {
        AuthClaims {
            sub: "alice".into(),
            role: "client".into(),
            jti: "j1".into(),
            exp: u64::MAX,
            token_type: TokenType::Access,
        }
    }

    fn user() -> User {
        User {
            username: "alice".into(),
            email: "alice@example.com".into(),
            password_hash: String::new(),
            role: "client".into(),
            groups: vec!["ALL".into(), "public".into()],
            active: true,
            ui_access: false,
            tier: None,
            rate_limit_enabled: false,
            rate_limit_duration: None,
            rate_limit_duration_type: None,
            throttle_enabled: false,
            throttle_duration: None,
            throttle_duration_type: None,
            throttle_wait_duration: None,
            throttle_wait_duration_type: None,
            throttle_queue_limit: None,
            created_at: None,
        }
    }

    fn ip() -> IpAddr {
        "198.51.100.7".parse().unwrap()
    }

    struct Fixture {
        api: Api,
        claims: AuthClaims,
        user: User,
        role: Option<Role>,
        groups: Vec<String>,
        group_defs: Vec<Group>,
        subscription: Option<Subscription>,
        country: Option<String>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                api: api(),
                claims: claims(),
                user: user(),
                role: None,
                groups: vec!["ALL".into(), "public".into()],
                group_defs: vec![],
                subscription: None,
                country: None,
            }
        }

        fn authorize(&self) -> Result<(), GatewayError> {
            authorize(&AuthzInput {
                api: &self.api,
                claims: Some(&self.claims),
                user: Some(&self.user),
                role: self.role.as_ref(),
                user_groups: &self.groups,
                group_defs: &self.group_defs,
                subscription: self.subscription.as_ref(),
                client_ip: ip(),
                country: self.country.as_deref(),
            })
        }
    }

    #[test]
    fn inactive_api_denies_even_public() {
        let mut f = Fixture::new();
        f.api.active = false;
        f.api.api_public = true;
        assert!(matches!(f.authorize(), Err(GatewayError::ApiNotFound)));
    }

    #[test]
    fn public_api_allows_anonymous() {
        let mut api = api();
        api.api_public = true;
        let result = authorize(&AuthzInput {
            api: &api,
            claims: None,
            user: None,
            role: None,
            user_groups: &[],
            group_defs: &[],
            subscription: None,
            client_ip: ip(),
            country: None,
        });
        assert!(result.is_ok());
    }

    #[test]
    fn missing_claims_deny_private_api() {
        let api = api();
        let result = authorize(&AuthzInput {
            api: &api,
            claims: None,
            user: None,
            role: None,
            user_groups: &[],
            group_defs: &[],
            subscription: None,
            client_ip: ip(),
            country: None,
        });
        assert!(matches!(result, Err(GatewayError::TokenMissing)));
    }

    #[test]
    fn inactive_user_denied() {
        let mut f = Fixture::new();
        f.user.active = false;
        assert!(matches!(f.authorize(), Err(GatewayError::UserInactive)));
    }

    #[test]
    fn all_group_in_allowed_set_admits() {
        let f = Fixture::new();
        assert!(f.authorize().is_ok());
    }

    #[test]
    fn restricted_groups_without_subscription_deny_sub005() {
        let mut f = Fixture::new();
        f.api.api_allowed_groups = BTreeSet::from(["private".to_owned()]);
        let err = f.authorize().unwrap_err();
        assert!(matches!(err, GatewayError::SubscriptionRequired));
        assert_eq!(err.error_code(), "SUB005");
    }

    #[test]
    fn subscription_admits_restricted_api() {
        let mut f = Fixture::new();
        f.api.api_allowed_groups = BTreeSet::from(["private".to_owned()]);
        f.subscription = Some(Subscription {
            username: "alice".into(),
            apis: vec!["echo/v1".into()],
        });
        assert!(f.authorize().is_ok());
    }

    #[test]
    fn group_api_access_grant_admits() {
        let mut f = Fixture::new();
        f.api.api_allowed_groups = BTreeSet::from(["private".to_owned()]);
        f.group_defs = vec![Group {
            group_name: "public".into(),
            group_description: None,
            api_access: vec!["echo/v1".into()],
        }];
        assert!(f.authorize().is_ok());
    }

    #[test]
    fn wrong_role_denied() {
        let mut f = Fixture::new();
        f.claims.role = "viewer".into();
        assert!(matches!(f.authorize(), Err(GatewayError::RoleDenied)));
    }

    #[test]
    fn empty_allowed_roles_is_unrestricted() {
        let mut f = Fixture::new();
        f.api.api_allowed_roles.clear();
        f.claims.role = "anything".into();
        assert!(f.authorize().is_ok());
    }

    #[test]
    fn manage_gateway_bypasses_role_and_subscription() {
        let mut f = Fixture::new();
        f.api.api_allowed_roles = BTreeSet::from(["other".to_owned()]);
        f.api.api_allowed_groups = BTreeSet::from(["private".to_owned()]);
        let mut role = Role::default();
        role.role_name = "ops".into();
        role.manage_gateway = true;
        f.role = Some(role);
        assert!(f.authorize().is_ok());
    }

    #[test]
    fn manage_gateway_does_not_bypass_ip_policy() {
        let mut f = Fixture::new();
        let mut role = Role::default();
        role.manage_gateway = true;
        f.role = Some(role);
        f.api.api_ip_mode = Some(IpMode::AllowListOnly);
        f.api.api_ip_allow = vec!["10.0.0.0/8".into()];
        assert!(matches!(f.authorize(), Err(GatewayError::IpDenied)));
    }

    #[test]
    fn allow_list_cidr_matches() {
        let mut f = Fixture::new();
        f.api.api_ip_mode = Some(IpMode::AllowListOnly);
        f.api.api_ip_allow = vec!["198.51.100.0/24".into()];
        assert!(f.authorize().is_ok());
    }

    #[test]
    fn deny_list_exact_ip() {
        let mut f = Fixture::new();
        f.api.api_ip_mode = Some(IpMode::DenyList);
        f.api.api_ip_deny = vec!["198.51.100.7".into()];
        assert!(matches!(f.authorize(), Err(GatewayError::IpDenied)));
    }

    #[test]
    fn country_blocklist_denies() {
        let mut f = Fixture::new();
        f.api.api_country_deny = vec!["nz".into()];
        f.country = Some("NZ".into());
        assert!(matches!(f.authorize(), Err(GatewayError::GeoDenied)));
        f.country = Some("AU".into());
        assert!(f.authorize().is_ok());
    }
}
