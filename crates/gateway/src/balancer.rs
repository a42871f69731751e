//! Upstream server selection.
//!
//! Round-robin across the API's server list, with the cursor kept in the
//! shared store under `endpoint_load_balancer[api_id]` so rotation is
//! coherent across workers. A routing override for the caller's
//! `client_key` can replace the server list and inject extra headers.

use std::collections::BTreeMap;

use doorman_cache::CacheManager;
use doorman_core::{Api, Routing};

use crate::error::GatewayError;

/// The chosen upstream plus any routing-injected headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSelection {
    pub server: String,
    pub extra_headers: BTreeMap<String, String>,
}

/// Pick the next upstream server. Every call advances the per-API cursor,
/// so retries naturally move to the next server in rotation.
pub async fn select_server(
    cache: &CacheManager,
    api: &Api,
    routing: Option<&Routing>,
) -> Result<ServerSelection, GatewayError> {
    let override_servers = routing.and_then(|r| r.routing_servers.as_ref());
    let servers = override_servers.unwrap_or(&api.api_servers);
    if servers.is_empty() {
        return Err(GatewayError::NoServers);
    }

    let cursor = cache.next_balancer_index(&api.api_id).await?;
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let index = ((cursor - 1).rem_euclid(servers.len() as i64)) as usize;

    let extra_headers = routing
        .map(|r| {
            r.routing_headers
                .iter()
                .map(|(k, v)| (k.to_lowercase(), v.clone()))
                .collect()
        })
        .unwrap_or_default();

    Ok(ServerSelection {
        server: servers[index].trim_end_matches('/').to_owned(),
        extra_headers,
    })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::Arc;

    use doorman_core::ApiType;
    use doorman_state_memory::MemorySharedStore;

    use super::*;

    fn api(servers: &[&str]) -> Api {
        Api {
            api_name: "echo".into(),
            api_version: "v1".into(),
            api_id: "api-1".into(),
            api_type: ApiType::Rest,
            active: true,
            api_servers: servers.iter().map(|s| (*s).to_owned()).collect(),
            api_allowed_retry_count: 0,
            api_allowed_roles: BTreeSet::new(),
            api_allowed_groups: BTreeSet::new(),
            api_public: true,
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
            dynamic_attributes: std::collections::BTreeMap::new(),
            created_at: None,
        }
    }

    fn cache() -> CacheManager {
        CacheManager::new(Arc::new(MemorySharedStore::new()))
    }

    #[tokio::test]
    async fn round_robin_cycles_in_order() {
        let cache = cache();
        let api = api(&["http://a/", "http://b/", "http://c/"]);

        let mut picks = Vec::new();
        for _ in 0..6 {
            picks.push(select_server(&cache, &api, None).await.unwrap().server);
        }
        assert_eq!(
            picks,
            vec!["http://a", "http://b", "http://c", "http://a", "http://b", "http://c"]
        );
    }

    #[tokio::test]
    async fn cursor_is_per_api() {
        let cache = cache();
        let api_a = api(&["http://a1/", "http://a2/"]);
        let mut api_b = api(&["http://b1/", "http://b2/"]);
        api_b.api_id = "api-2".into();

        let first_a = select_server(&cache, &api_a, None).await.unwrap().server;
        let first_b = select_server(&cache, &api_b, None).await.unwrap().server;
        assert_eq!(first_a, "http://a1");
        assert_eq!(first_b, "http://b1");
    }

    #[tokio::test]
    async fn routing_override_replaces_servers_and_injects_headers() {
        let cache = cache();
        let api = api(&["http://default/"]);
        let routing = Routing {
            client_key: "ck-1".into(),
            routing_description: None,
            routing_servers: Some(vec!["http://special/".into()]),
            routing_headers: BTreeMap::from([("X-Lane".to_owned(), "fast".to_owned())]),
        };

        let selection = select_server(&cache, &api, Some(&routing)).await.unwrap();
        assert_eq!(selection.server, "http://special");
        assert_eq!(selection.extra_headers.get("x-lane").map(String::as_str), Some("fast"));
    }

    #[tokio::test]
    async fn empty_server_list_is_no_servers() {
        let cache = cache();
        let api = api(&[]);
        assert!(matches!(
            select_server(&cache, &api, None).await,
            Err(GatewayError::NoServers)
        ));
    }
}
