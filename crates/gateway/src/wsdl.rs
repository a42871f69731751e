//! WSDL fetch, parse, and endpoint auto-import.
//!
//! The parser walks binding operations and their `soapAction` attributes;
//! auto-import derives one POST endpoint per operation. Parsed documents
//! are cached under `wsdl_cache` keyed by URL.

use serde::{Deserialize, Serialize};

use quick_xml::Reader;
use quick_xml::events::Event;

use doorman_cache::CachePrefix;
use doorman_core::{Api, Endpoint};

use crate::context::GatewayContext;
use crate::error::GatewayError;
use crate::upstream::map_reqwest_error;

/// One operation found in a WSDL binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WsdlOperation {
    pub name: String,
    pub soap_action: Option<String>,
}

/// The parts of a WSDL the gateway cares about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct WsdlDocument {
    pub service_name: Option<String>,
    pub operations: Vec<WsdlOperation>,
}

/// Parse a WSDL document. Namespace prefixes are ignored; elements are
/// matched on local name, which covers both `wsdl:` and unprefixed forms.
pub fn parse_wsdl(xml: &str) -> Result<WsdlDocument, GatewayError> {
    let mut reader = Reader::from_str(xml);
    let mut doc = WsdlDocument::default();
    let mut in_binding = false;
    let mut current_operation: Option<WsdlOperation> = None;

    loop {
        let event = reader
            .read_event()
            .map_err(|e| GatewayError::MalformedBody(format!("WSDL parse failed: {e}")))?;
        match event {
            Event::Start(ref start) | Event::Empty(ref start) => {
                let local = start.local_name().as_ref().to_vec();
                let empty = matches!(event, Event::Empty(_));
                match local.as_slice() {
                    b"binding" if !empty => in_binding = true,
                    b"service" => {
                        if let Some(name) = attr(start, b"name") {
                            doc.service_name = Some(name);
                        }
                    }
                    b"operation" if in_binding => {
                        let operation = WsdlOperation {
                            name: attr(start, b"name").unwrap_or_default(),
                            soap_action: None,
                        };
                        if empty {
                            if !operation.name.is_empty() {
                                doc.operations.push(operation);
                            }
                        } else {
                            current_operation = Some(operation);
                        }
                    }
                    _ => {}
                }
                // The soap binding sub-element is also named "operation";
                // distinguish it by the soapAction attribute.
                if local.as_slice() == b"operation"
                    && let Some(op) = current_operation.as_mut()
                    && let Some(action) = attr(start, b"soapAction")
                {
                    op.soap_action = Some(action);
                }
            }
            Event::End(ref end) => {
                let local = end.local_name().as_ref().to_vec();
                match local.as_slice() {
                    b"binding" => in_binding = false,
                    b"operation" => {
                        if let Some(op) = current_operation.take()
                            && !op.name.is_empty()
                        {
                            doc.operations.push(op);
                        }
                    }
                    _ => {}
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if doc.operations.is_empty() {
        return Err(GatewayError::MalformedBody(
            "WSDL contains no binding operations".to_owned(),
        ));
    }
    Ok(doc)
}

fn attr(start: &quick_xml::events::BytesStart<'_>, name: &[u8]) -> Option<String> {
    start
        .attributes()
        .flatten()
        .find(|a| a.key.local_name().as_ref() == name)
        .and_then(|a| a.unescape_value().ok().map(|v| v.into_owned()))
}

/// Fetch, parse, and cache the WSDL for an API.
pub async fn fetch_wsdl(ctx: &GatewayContext, url: &str) -> Result<WsdlDocument, GatewayError> {
    if let Some(cached) = ctx.cache.get::<WsdlDocument>(CachePrefix::Wsdl, url).await? {
        return Ok(cached);
    }

    let response = ctx
        .http
        .get(url)
        .timeout(ctx.config().request_timeout)
        .send()
        .await
        .map_err(|e| map_reqwest_error(&e))?;
    let xml = response
        .text()
        .await
        .map_err(|e| GatewayError::UpstreamConnect(format!("WSDL read failed: {e}")))?;

    let doc = parse_wsdl(&xml)?;
    ctx.cache.set(CachePrefix::Wsdl, url, &doc).await?;
    Ok(doc)
}

/// Derive one POST endpoint per WSDL operation.
#[must_use]
pub fn auto_import_endpoints(api: &Api, doc: &WsdlDocument) -> Vec<Endpoint> {
    doc.operations
        .iter()
        .map(|op| Endpoint {
            endpoint_id: uuid::Uuid::new_v4().to_string(),
            api_name: api.api_name.clone(),
            api_version: api.api_version.clone(),
            endpoint_method: "POST".to_owned(),
            endpoint_uri: format!("/{}", op.name),
            endpoint_description: Some(format!("Imported from WSDL operation {}", op.name)),
            endpoint_soap_action: op.soap_action.clone(),
            endpoint_soap_security: None,
            validation_schema_id: None,
            endpoint_transforms: None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<?xml version="1.0"?>
<wsdl:definitions xmlns:wsdl="http://schemas.xmlsoap.org/wsdl/"
                  xmlns:soap="http://schemas.xmlsoap.org/wsdl/soap/"
                  name="Quotes">
  <wsdl:portType name="QuotePort">
    <wsdl:operation name="GetQuote"/>
    <wsdl:operation name="ListSymbols"/>
  </wsdl:portType>
  <wsdl:binding name="QuoteBinding" type="tns:QuotePort">
    <soap:binding transport="http://schemas.xmlsoap.org/soap/http"/>
    <wsdl:operation name="GetQuote">
      <soap:operation soapAction="urn:quotes#GetQuote"/>
    </wsdl:operation>
    <wsdl:operation name="ListSymbols">
      <soap:operation soapAction="urn:quotes#ListSymbols"/>
    </wsdl:operation>
  </wsdl:binding>
  <wsdl:service name="QuoteService"/>
</wsdl:definitions>"#;

    #[test]
    fn parses_binding_operations_with_actions() {
        let doc = parse_wsdl(SAMPLE).unwrap();
        assert_eq!(doc.service_name.as_deref(), Some("QuoteService"));
        assert_eq!(doc.operations.len(), 2);
        assert_eq!(doc.operations[0].name, "GetQuote");
        assert_eq!(
            doc.operations[0].soap_action.as_deref(),
            Some("urn:quotes#GetQuote")
        );
        assert_eq!(doc.operations[1].name, "ListSymbols");
    }

    #[test]
    fn port_type_operations_are_not_duplicated() {
        // Only binding operations count; the two portType declarations
        // above must not create four entries.
        let doc = parse_wsdl(SAMPLE).unwrap();
        assert_eq!(doc.operations.len(), 2);
    }

    #[test]
    fn wsdl_without_operations_is_rejected() {
        let xml = r#"<definitions><service name="Empty"/></definitions>"#;
        assert!(parse_wsdl(xml).is_err());
    }

    #[test]
    fn auto_import_builds_post_endpoints() {
        use std::collections::{BTreeMap, BTreeSet};
        let api = Api {
            api_name: "quotes".into(),
            api_version: "v1".into(),
            api_id: "api-q".into(),
            api_type: doorman_core::ApiType::Soap,
            active: true,
            api_servers: vec!["http://soap/".into()],
            api_allowed_retry_count: 0,
            api_allowed_roles: BTreeSet::new(),
            api_allowed_groups: BTreeSet::new(),
            api_public: false,
            api_credits_enabled: false,
            api_credit_group: None,
            api_ip_allow: vec![],
            api_ip_deny: vec![],
            api_ip_mode: None,
            api_country_deny: vec![],
            api_cors_allow_origins: vec![],
            api_wsdl_url: Some("http://soap/?wsdl".into()),
            api_grpc_package: None,
            api_openapi_url: None,
            api_transforms: None,
            dynamic_attributes: BTreeMap::new(),
            created_at: None,
        };
        let doc = parse_wsdl(SAMPLE).unwrap();
        let endpoints = auto_import_endpoints(&api, &doc);
        assert_eq!(endpoints.len(), 2);
        assert_eq!(endpoints[0].endpoint_method, "POST");
        assert_eq!(endpoints[0].endpoint_uri, "/GetQuote");
        assert_eq!(
            endpoints[0].endpoint_soap_action.as_deref(),
            Some("urn:quotes#GetQuote")
        );
    }
}
