//! Application of declarative header/body/query transforms.
//!
//! API-level transforms run first, endpoint-level second, so an endpoint
//! can refine what the API sets globally. Body operations run in the order
//! remove, rename, add, wrap; a rename whose source is absent is a no-op,
//! which makes re-applying a rename idempotent.

use std::collections::BTreeMap;

use serde_json::Value;

use doorman_core::{BodyTransforms, HeaderTransforms, QueryTransforms, TransformConfig};

use crate::jsonpath;

/// Apply header rewrites in place. Header names compare case-insensitively;
/// the map is expected to hold lowercased names.
pub fn apply_headers(headers: &mut BTreeMap<String, String>, t: &HeaderTransforms) {
    for name in &t.remove {
        headers.remove(&name.to_lowercase());
    }
    for (old, new) in &t.rename {
        if let Some(value) = headers.remove(&old.to_lowercase()) {
            headers.insert(new.to_lowercase(), value);
        }
    }
    for (name, value) in &t.add {
        headers.insert(name.to_lowercase(), value.clone());
    }
}

/// Apply body rewrites in place.
pub fn apply_body(body: &mut Value, t: &BodyTransforms) {
    for path in &t.remove {
        jsonpath::delete_path(body, path);
    }
    for (old, new) in &t.rename {
        if let Some(value) = jsonpath::get_path(body, old).cloned() {
            jsonpath::delete_path(body, old);
            jsonpath::set_path(body, new, value);
        }
    }
    for (path, value) in &t.add {
        jsonpath::set_path(body, path, value.clone());
    }
    if let Some(wrap_path) = &t.wrap {
        let inner = body.take();
        let mut wrapped = Value::Object(serde_json::Map::new());
        jsonpath::set_path(&mut wrapped, wrap_path, inner);
        *body = wrapped;
    }
}

/// Apply query-parameter rewrites in place. Order within the list is
/// preserved for untouched parameters.
pub fn apply_query(query: &mut Vec<(String, String)>, t: &QueryTransforms) {
    query.retain(|(name, _)| !t.remove.contains(name));
    for (name, _) in query.iter_mut() {
        if let Some(new) = t.rename.get(name) {
            *name = new.clone();
        }
    }
    for (name, value) in &t.add {
        match query.iter_mut().find(|(n, _)| n == name) {
            Some((_, existing)) => existing.clone_from(value),
            None => query.push((name.clone(), value.clone())),
        }
    }
}

/// Remap an upstream status code per the response `status_map`.
#[must_use]
pub fn remap_status(status: u16, status_map: &BTreeMap<String, u16>) -> u16 {
    status_map
        .get(&status.to_string())
        .copied()
        .unwrap_or(status)
}

/// Request-side application across the API and endpoint layers.
pub fn apply_request_layers(
    layers: &[Option<&TransformConfig>],
    headers: &mut BTreeMap<String, String>,
    body: Option<&mut Value>,
    query: &mut Vec<(String, String)>,
) {
    let mut body = body;
    for config in layers.iter().flatten() {
        let Some(req) = &config.request else {
            continue;
        };
        if let Some(h) = &req.headers {
            apply_headers(headers, h);
        }
        if let (Some(b), Some(body_value)) = (&req.body, body.as_deref_mut()) {
            apply_body(body_value, b);
        }
        if let Some(q) = &req.query {
            apply_query(query, q);
        }
    }
}

/// Response-side application across the API and endpoint layers. Returns
/// the possibly-remapped status.
pub fn apply_response_layers(
    layers: &[Option<&TransformConfig>],
    status: u16,
    headers: &mut BTreeMap<String, String>,
    body: Option<&mut Value>,
) -> u16 {
    let mut status = status;
    let mut body = body;
    for config in layers.iter().flatten() {
        let Some(resp) = &config.response else {
            continue;
        };
        if let Some(h) = &resp.headers {
            apply_headers(headers, h);
        }
        if let (Some(b), Some(body_value)) = (&resp.body, body.as_deref_mut()) {
            apply_body(body_value, b);
        }
        status = remap_status(status, &resp.status_map);
    }
    status
}

#[cfg(test)]
mod tests {
    use super::*;
    use doorman_core::{RequestTransforms, ResponseTransforms};
    use serde_json::json;

    #[test]
    fn header_remove_rename_add() {
        let mut headers = BTreeMap::from([
            ("x-old".to_owned(), "1".to_owned()),
            ("x-drop".to_owned(), "2".to_owned()),
        ]);
        let t = HeaderTransforms {
            add: BTreeMap::from([("x-added".to_owned(), "3".to_owned())]),
            remove: vec!["X-Drop".to_owned()],
            rename: BTreeMap::from([("X-Old".to_owned(), "X-New".to_owned())]),
        };
        apply_headers(&mut headers, &t);
        assert_eq!(headers.get("x-new").map(String::as_str), Some("1"));
        assert_eq!(headers.get("x-added").map(String::as_str), Some("3"));
        assert!(!headers.contains_key("x-drop"));
        assert!(!headers.contains_key("x-old"));
    }

    #[test]
    fn body_rename_is_idempotent_when_source_absent() {
        let mut body = json!({"a": 1});
        let t = BodyTransforms {
            rename: BTreeMap::from([("$.a".to_owned(), "$.b".to_owned())]),
            ..BodyTransforms::default()
        };
        apply_body(&mut body, &t);
        assert_eq!(body, json!({"b": 1}));
        // Second application: source is gone, value must survive untouched.
        apply_body(&mut body, &t);
        assert_eq!(body, json!({"b": 1}));
    }

    #[test]
    fn body_wrap_nests_whole_payload() {
        let mut body = json!({"x": 1});
        let t = BodyTransforms {
            wrap: Some("$.payload.data".to_owned()),
            ..BodyTransforms::default()
        };
        apply_body(&mut body, &t);
        assert_eq!(body, json!({"payload": {"data": {"x": 1}}}));
    }

    #[test]
    fn query_rewrites() {
        let mut query = vec![
            ("keep".to_owned(), "1".to_owned()),
            ("drop".to_owned(), "2".to_owned()),
            ("old".to_owned(), "3".to_owned()),
        ];
        let t = QueryTransforms {
            add: BTreeMap::from([("extra".to_owned(), "4".to_owned())]),
            remove: vec!["drop".to_owned()],
            rename: BTreeMap::from([("old".to_owned(), "new".to_owned())]),
        };
        apply_query(&mut query, &t);
        assert_eq!(
            query,
            vec![
                ("keep".to_owned(), "1".to_owned()),
                ("new".to_owned(), "3".to_owned()),
                ("extra".to_owned(), "4".to_owned()),
            ]
        );
    }

    #[test]
    fn status_remap_falls_through() {
        let map = BTreeMap::from([("503".to_owned(), 502u16)]);
        assert_eq!(remap_status(503, &map), 502);
        assert_eq!(remap_status(200, &map), 200);
    }

    #[test]
    fn endpoint_layer_runs_after_api_layer() {
        let api = TransformConfig {
            request: Some(RequestTransforms {
                headers: Some(HeaderTransforms {
                    add: BTreeMap::from([("x-layer".to_owned(), "api".to_owned())]),
                    ..HeaderTransforms::default()
                }),
                ..RequestTransforms::default()
            }),
            response: None,
        };
        let endpoint = TransformConfig {
            request: Some(RequestTransforms {
                headers: Some(HeaderTransforms {
                    add: BTreeMap::from([("x-layer".to_owned(), "endpoint".to_owned())]),
                    ..HeaderTransforms::default()
                }),
                ..RequestTransforms::default()
            }),
            response: None,
        };

        let mut headers = BTreeMap::new();
        let mut query = Vec::new();
        apply_request_layers(
            &[Some(&api), Some(&endpoint)],
            &mut headers,
            None,
            &mut query,
        );
        assert_eq!(headers.get("x-layer").map(String::as_str), Some("endpoint"));
    }

    #[test]
    fn response_layers_remap_status() {
        let cfg = TransformConfig {
            request: None,
            response: Some(ResponseTransforms {
                status_map: BTreeMap::from([("500".to_owned(), 502u16)]),
                ..ResponseTransforms::default()
            }),
        };
        let mut headers = BTreeMap::new();
        let status = apply_response_layers(&[Some(&cfg)], 500, &mut headers, None);
        assert_eq!(status, 502);
    }
}
