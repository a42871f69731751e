//! Cache-aside resolution of configuration entities.
//!
//! Every reader follows the same shape: try the prefix cache, fall back to
//! the config store, populate the cache on the way out. Admin writes
//! invalidate; these readers refill.

use doorman_cache::{CacheManager, CachePrefix};
use doorman_core::{
    Api, Endpoint, Group, Role, Routing, Subscription, Tier, User, ValidationSchema,
};
use doorman_store::{collections, ConfigStore, ConfigStoreExt, Filter};

use crate::error::GatewayError;

/// Resolve an API by `(name, version)`: `api_cache` first, then the store,
/// populating both the primary and the id index key on a miss.
pub async fn resolve_api(
    cache: &CacheManager,
    store: &dyn ConfigStore,
    name: &str,
    version: &str,
) -> Result<Api, GatewayError> {
    let cache_key = format!("{name}/{version}");
    if let Some(api) = cache.get::<Api>(CachePrefix::Api, &cache_key).await? {
        return Ok(api);
    }

    let api: Api = store
        .get_one(
            collections::APIS,
            &Filter::new().eq("api_name", name).eq("api_version", version),
        )
        .await
        .map_err(|e| {
            if e.is_not_found() {
                GatewayError::ApiNotFound
            } else {
                e.into()
            }
        })?;

    cache.set(CachePrefix::Api, &cache_key, &api).await?;
    cache
        .set(CachePrefix::ApiId, &api.api_path(), &api.api_id)
        .await?;
    Ok(api)
}

/// Resolve an endpoint by its composite `(method, path)` key.
pub async fn resolve_endpoint(
    cache: &CacheManager,
    store: &dyn ConfigStore,
    api: &Api,
    method: &str,
    uri: &str,
) -> Result<Endpoint, GatewayError> {
    let uri = Endpoint::normalize_uri(uri);
    let composite = format!(
        "{}:/{}/{}{}",
        method, api.api_name, api.api_version, uri
    );
    if let Some(endpoint) = cache
        .get::<Endpoint>(CachePrefix::Endpoint, &composite)
        .await?
    {
        return Ok(endpoint);
    }

    let endpoint: Endpoint = store
        .get_one(
            collections::ENDPOINTS,
            &Filter::new()
                .eq("api_name", api.api_name.as_str())
                .eq("api_version", api.api_version.as_str())
                .eq("endpoint_method", method)
                .eq("endpoint_uri", uri.as_str()),
        )
        .await
        .map_err(|e| {
            if e.is_not_found() {
                GatewayError::EndpointNotFound
            } else {
                e.into()
            }
        })?;

    cache.set(CachePrefix::Endpoint, &composite, &endpoint).await?;
    Ok(endpoint)
}

/// Resolve a user by username.
pub async fn resolve_user(
    cache: &CacheManager,
    store: &dyn ConfigStore,
    username: &str,
) -> Result<Option<User>, GatewayError> {
    if let Some(user) = cache.get::<User>(CachePrefix::User, username).await? {
        return Ok(Some(user));
    }
    match store
        .get_one::<User>(collections::USERS, &Filter::new().eq("username", username))
        .await
    {
        Ok(user) => {
            cache.set(CachePrefix::User, username, &user).await?;
            Ok(Some(user))
        }
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Resolve a role definition by name.
pub async fn resolve_role(
    cache: &CacheManager,
    store: &dyn ConfigStore,
    role_name: &str,
) -> Result<Option<Role>, GatewayError> {
    if let Some(role) = cache.get::<Role>(CachePrefix::Role, role_name).await? {
        return Ok(Some(role));
    }
    match store
        .get_one::<Role>(collections::ROLES, &Filter::new().eq("role_name", role_name))
        .await
    {
        Ok(role) => {
            cache.set(CachePrefix::Role, role_name, &role).await?;
            Ok(Some(role))
        }
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Resolve the definitions of the caller's groups. Unknown group names are
/// skipped — a dangling membership must not break authorization.
pub async fn resolve_groups(
    cache: &CacheManager,
    store: &dyn ConfigStore,
    usernames_groups: &[String],
) -> Result<Vec<Group>, GatewayError> {
    let mut defs = Vec::with_capacity(usernames_groups.len());
    for group_name in usernames_groups {
        if let Some(group) = cache.get::<Group>(CachePrefix::Group, group_name).await? {
            defs.push(group);
            continue;
        }
        match store
            .get_one::<Group>(
                collections::GROUPS,
                &Filter::new().eq("group_name", group_name.as_str()),
            )
            .await
        {
            Ok(group) => {
                cache.set(CachePrefix::Group, group_name, &group).await?;
                defs.push(group);
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(defs)
}

/// Resolve a user's subscription list.
pub async fn resolve_subscription(
    cache: &CacheManager,
    store: &dyn ConfigStore,
    username: &str,
) -> Result<Option<Subscription>, GatewayError> {
    if let Some(sub) = cache
        .get::<Subscription>(CachePrefix::UserSubscription, username)
        .await?
    {
        return Ok(Some(sub));
    }
    match store
        .get_one::<Subscription>(
            collections::SUBSCRIPTIONS,
            &Filter::new().eq("username", username),
        )
        .await
    {
        Ok(sub) => {
            cache
                .set(CachePrefix::UserSubscription, username, &sub)
                .await?;
            Ok(Some(sub))
        }
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Resolve a routing override by the caller's `client_key` header.
pub async fn resolve_routing(
    cache: &CacheManager,
    store: &dyn ConfigStore,
    client_key: &str,
) -> Result<Option<Routing>, GatewayError> {
    if let Some(routing) = cache
        .get::<Routing>(CachePrefix::ClientRouting, client_key)
        .await?
    {
        return Ok(Some(routing));
    }
    match store
        .get_one::<Routing>(
            collections::ROUTINGS,
            &Filter::new().eq("client_key", client_key),
        )
        .await
    {
        Ok(routing) => {
            cache
                .set(CachePrefix::ClientRouting, client_key, &routing)
                .await?;
            Ok(Some(routing))
        }
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Resolve the validation schema referenced by an endpoint.
pub async fn resolve_validation_schema(
    cache: &CacheManager,
    store: &dyn ConfigStore,
    endpoint_id: &str,
) -> Result<Option<ValidationSchema>, GatewayError> {
    if let Some(schema) = cache
        .get::<ValidationSchema>(CachePrefix::EndpointValidation, endpoint_id)
        .await?
    {
        return Ok(Some(schema));
    }
    match store
        .get_one::<ValidationSchema>(
            collections::ENDPOINT_VALIDATIONS,
            &Filter::new().eq("endpoint_id", endpoint_id),
        )
        .await
    {
        Ok(schema) => {
            cache
                .set(CachePrefix::EndpointValidation, endpoint_id, &schema)
                .await?;
            Ok(Some(schema))
        }
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Resolve a tier definition from the settings collection.
pub async fn resolve_tier(
    store: &dyn ConfigStore,
    tier_name: &str,
) -> Result<Option<Tier>, GatewayError> {
    match store
        .get_one::<Tier>(
            collections::SETTINGS,
            &Filter::new().eq("tier_name", tier_name),
        )
        .await
    {
        Ok(tier) => Ok(Some(tier)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e.into()),
    }
}
