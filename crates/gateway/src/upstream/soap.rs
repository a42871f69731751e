//! SOAP passthrough with WS-Security.
//!
//! Content type follows the detected envelope version (1.1 `text/xml`
//! with a `SOAPAction` header, 1.2 `application/soap+xml`). When the
//! endpoint carries credentials, a `wsse:Security` header with
//! `Timestamp` and `UsernameToken` is injected into the envelope before
//! dispatch. All XML parsing goes through `quick-xml`, which neither
//! loads DTDs nor resolves external entities.

use std::io::Cursor;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use bytes::Bytes;
use chrono::{SecondsFormat, Utc};
use quick_xml::Reader;
use quick_xml::Writer;
use quick_xml::events::{BytesText, Event};
use sha1::Sha1;
use sha2::{Digest, Sha256};

use doorman_core::{Endpoint, SoapPasswordType, SoapSecurity};

use crate::balancer::ServerSelection;
use crate::context::GatewayContext;
use crate::error::GatewayError;

use super::{UpstreamRequest, UpstreamResponse, convert_response, is_hop_by_hop, map_reqwest_error};

const SOAP12_NS: &str = "http://www.w3.org/2003/05/soap-envelope";
const WSSE_NS: &str =
    "http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-secext-1.0.xsd";
const WSU_NS: &str =
    "http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-utility-1.0.xsd";
const PASSWORD_TEXT: &str =
    "http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-username-token-profile-1.0#PasswordText";
const PASSWORD_DIGEST: &str =
    "http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-username-token-profile-1.0#PasswordDigest";
const PASSWORD_DIGEST_SHA256: &str = "urn:doorman:wss:password-digest-sha256";

/// Detected envelope version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SoapVersion {
    V11,
    V12,
}

impl SoapVersion {
    #[must_use]
    pub fn content_type(self) -> &'static str {
        match self {
            Self::V11 => "text/xml; charset=utf-8",
            Self::V12 => "application/soap+xml; charset=utf-8",
        }
    }
}

/// Sniff the envelope namespace. Anything that is not recognizably 1.2 is
/// treated as 1.1.
#[must_use]
pub fn detect_version(envelope: &[u8]) -> SoapVersion {
    let head_len = envelope.len().min(2_048);
    let head = String::from_utf8_lossy(&envelope[..head_len]);
    if head.contains(SOAP12_NS) {
        SoapVersion::V12
    } else {
        SoapVersion::V11
    }
}

/// Build the `wsse:Security` fragment for the endpoint credentials.
///
/// `password` is the decrypted plaintext; digests are computed as
/// `Base64(HASH(nonce + created + password))`.
fn security_header(security: &SoapSecurity, password: &str) -> String {
    let created = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
    let expires = (Utc::now() + chrono::Duration::minutes(5))
        .to_rfc3339_opts(SecondsFormat::Secs, true);
    let nonce_bytes = *uuid::Uuid::new_v4().as_bytes();
    let nonce_b64 = B64.encode(nonce_bytes);

    let (password_value, password_type) = match security.password_type {
        SoapPasswordType::Text => (xml_escape(password), PASSWORD_TEXT),
        SoapPasswordType::Digest => {
            let mut hasher = Sha1::new();
            hasher.update(nonce_bytes);
            hasher.update(created.as_bytes());
            hasher.update(password.as_bytes());
            (B64.encode(hasher.finalize()), PASSWORD_DIGEST)
        }
        SoapPasswordType::DigestSha256 => {
            let mut hasher = Sha256::new();
            hasher.update(nonce_bytes);
            hasher.update(created.as_bytes());
            hasher.update(password.as_bytes());
            (B64.encode(hasher.finalize()), PASSWORD_DIGEST_SHA256)
        }
    };

    let nonce_element = if security.include_nonce {
        format!("<wsse:Nonce>{nonce_b64}</wsse:Nonce>")
    } else {
        String::new()
    };

    format!(
        concat!(
            r#"<wsse:Security xmlns:wsse="{wsse}" xmlns:wsu="{wsu}">"#,
            r#"<wsu:Timestamp><wsu:Created>{created}</wsu:Created>"#,
            r#"<wsu:Expires>{expires}</wsu:Expires></wsu:Timestamp>"#,
            r#"<wsse:UsernameToken>"#,
            r#"<wsse:Username>{username}</wsse:Username>"#,
            r#"<wsse:Password Type="{ptype}">{password}</wsse:Password>"#,
            "{nonce}",
            r#"<wsu:Created>{created}</wsu:Created>"#,
            r#"</wsse:UsernameToken></wsse:Security>"#
        ),
        wsse = WSSE_NS,
        wsu = WSU_NS,
        created = created,
        expires = expires,
        username = xml_escape(&security.username),
        ptype = password_type,
        password = password_value,
        nonce = nonce_element,
    )
}

fn xml_escape(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Inject a security fragment into the envelope header, creating the
/// header element when the envelope has none.
pub fn inject_security(
    envelope: &[u8],
    security: &SoapSecurity,
    password: &str,
) -> Result<Vec<u8>, GatewayError> {
    let fragment = security_header(security, password);
    let xml = std::str::from_utf8(envelope)
        .map_err(|e| GatewayError::MalformedBody(format!("envelope is not UTF-8: {e}")))?;

    let mut reader = Reader::from_str(xml);
    let mut writer = Writer::new(Cursor::new(Vec::new()));
    let mut depth: usize = 0;
    let mut injected = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(start)) => {
                depth += 1;
                let local = start.local_name().as_ref().to_vec();
                let prefix = start
                    .name()
                    .prefix()
                    .map(|p| String::from_utf8_lossy(p.as_ref()).into_owned());

                // A header at envelope depth: append the fragment inside it.
                if depth == 2 && local == b"Header" && !injected {
                    writer
                        .write_event(Event::Start(start.to_owned()))
                        .map_err(map_write_err)?;
                    writer
                        .write_event(Event::Text(BytesText::from_escaped(fragment.as_str())))
                        .map_err(map_write_err)?;
                    injected = true;
                    continue;
                }
                // Reached the body with no header seen: synthesize one.
                if depth == 2 && local == b"Body" && !injected {
                    let header_name = match &prefix {
                        Some(prefix) => format!("{prefix}:Header"),
                        None => "Header".to_owned(),
                    };
                    let header = format!("<{header_name}>{fragment}</{header_name}>");
                    writer
                        .write_event(Event::Text(BytesText::from_escaped(header.as_str())))
                        .map_err(map_write_err)?;
                    injected = true;
                }
                writer
                    .write_event(Event::Start(start.to_owned()))
                    .map_err(map_write_err)?;
            }
            Ok(Event::End(end)) => {
                depth = depth.saturating_sub(1);
                writer
                    .write_event(Event::End(end.to_owned()))
                    .map_err(map_write_err)?;
            }
            // An empty <Header/> is expanded so the fragment has a home.
            Ok(Event::Empty(start))
                if depth == 1 && start.local_name().as_ref() == b"Header" && !injected =>
            {
                let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
                writer
                    .write_event(Event::Start(start.to_owned()))
                    .map_err(map_write_err)?;
                writer
                    .write_event(Event::Text(BytesText::from_escaped(fragment.as_str())))
                    .map_err(map_write_err)?;
                writer
                    .write_event(Event::End(quick_xml::events::BytesEnd::new(name)))
                    .map_err(map_write_err)?;
                injected = true;
            }
            Ok(Event::Eof) => break,
            Ok(event) => {
                writer.write_event(event).map_err(map_write_err)?;
            }
            Err(e) => {
                return Err(GatewayError::MalformedBody(format!("envelope parse failed: {e}")));
            }
        }
    }

    if !injected {
        return Err(GatewayError::MalformedBody(
            "envelope has no Body element".to_owned(),
        ));
    }
    Ok(writer.into_inner().into_inner())
}

/// Convert the first child of the SOAP body into a JSON map for the
/// validation engine. Elements become objects keyed by local name; leaf
/// text becomes strings; repeated siblings collapse into arrays.
pub fn body_to_json(envelope: &[u8]) -> Result<serde_json::Value, GatewayError> {
    let xml = std::str::from_utf8(envelope)
        .map_err(|e| GatewayError::MalformedBody(format!("envelope is not UTF-8: {e}")))?;
    let mut reader = Reader::from_str(xml);

    // Walk to the first element inside Body.
    let mut in_body = false;
    loop {
        match reader.read_event() {
            Ok(Event::Start(start)) => {
                let local = start.local_name().as_ref().to_vec();
                if in_body {
                    let name = String::from_utf8_lossy(&local).into_owned();
                    let value = read_element(&mut reader)?;
                    let mut map = serde_json::Map::new();
                    map.insert(name, value);
                    return Ok(serde_json::Value::Object(map));
                }
                if local == b"Body" {
                    in_body = true;
                }
            }
            Ok(Event::End(_) | Event::Eof) if in_body => {
                return Err(GatewayError::MalformedBody("SOAP body is empty".to_owned()));
            }
            Ok(Event::Eof) => {
                return Err(GatewayError::MalformedBody(
                    "envelope has no Body element".to_owned(),
                ));
            }
            Ok(_) => {}
            Err(e) => {
                return Err(GatewayError::MalformedBody(format!("envelope parse failed: {e}")));
            }
        }
    }
}

/// Read the contents of the element whose `Start` was just consumed.
fn read_element(reader: &mut Reader<&[u8]>) -> Result<serde_json::Value, GatewayError> {
    let mut children = serde_json::Map::new();
    let mut text = String::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(start)) => {
                let name = String::from_utf8_lossy(start.local_name().as_ref()).into_owned();
                let value = read_element(reader)?;
                match children.get_mut(&name) {
                    Some(serde_json::Value::Array(items)) => items.push(value),
                    Some(existing) => {
                        let first = existing.take();
                        *existing = serde_json::Value::Array(vec![first, value]);
                    }
                    None => {
                        children.insert(name, value);
                    }
                }
            }
            Ok(Event::Text(t)) => {
                let decoded = t
                    .unescape()
                    .map_err(|e| GatewayError::MalformedBody(format!("bad text node: {e}")))?;
                text.push_str(decoded.trim());
            }
            Ok(Event::Empty(start)) => {
                let name = String::from_utf8_lossy(start.local_name().as_ref()).into_owned();
                children.insert(name, serde_json::Value::Null);
            }
            Ok(Event::End(_)) => break,
            Ok(Event::Eof) => {
                return Err(GatewayError::MalformedBody("unterminated element".to_owned()));
            }
            Ok(_) => {}
            Err(e) => {
                return Err(GatewayError::MalformedBody(format!("envelope parse failed: {e}")));
            }
        }
    }

    if children.is_empty() {
        Ok(serde_json::Value::String(text))
    } else {
        Ok(serde_json::Value::Object(children))
    }
}

fn map_write_err<E: std::fmt::Display>(e: E) -> GatewayError {
    GatewayError::Internal(format!("envelope rewrite failed: {e}"))
}

pub(super) async fn dispatch(
    ctx: &GatewayContext,
    endpoint: &Endpoint,
    selection: &ServerSelection,
    request: &UpstreamRequest,
) -> Result<UpstreamResponse, GatewayError> {
    let version = detect_version(&request.body);

    let body: Bytes = match &endpoint.endpoint_soap_security {
        Some(security) => {
            let password = ctx
                .cipher
                .decrypt_str(&security.password)
                .map_err(|e| GatewayError::Internal(format!("soap credential decrypt: {e}")))?;
            Bytes::from(inject_security(&request.body, security, &password)?)
        }
        None => request.body.clone(),
    };

    let url = format!("{}{}", selection.server, request.path);
    let mut builder = ctx
        .http
        .post(url)
        .timeout(ctx.config().request_timeout)
        .header("content-type", version.content_type());

    if version == SoapVersion::V11 {
        let action = endpoint.endpoint_soap_action.as_deref().unwrap_or("");
        builder = builder.header("SOAPAction", format!("\"{action}\""));
    }
    for (name, value) in &request.headers {
        if !is_hop_by_hop(name) && name != "content-type" {
            builder = builder.header(name, value);
        }
    }
    for (name, value) in &selection.extra_headers {
        builder = builder.header(name, value);
    }
    if !request.query.is_empty() {
        builder = builder.query(&request.query);
    }

    let response = builder
        .body(body)
        .send()
        .await
        .map_err(|e| map_reqwest_error(&e))?;
    convert_response(response).await
}

#[cfg(test)]
mod tests {
    use super::*;

    const ENVELOPE_11: &str = concat!(
        r#"<soapenv:Envelope xmlns:soapenv="http://schemas.xmlsoap.org/soap/envelope/">"#,
        r#"<soapenv:Body><GetQuote><symbol>ACME</symbol></GetQuote></soapenv:Body>"#,
        r#"</soapenv:Envelope>"#
    );

    const ENVELOPE_12: &str = concat!(
        r#"<env:Envelope xmlns:env="http://www.w3.org/2003/05/soap-envelope">"#,
        r#"<env:Header/>"#,
        r#"<env:Body><Ping/></env:Body>"#,
        r#"</env:Envelope>"#
    );

    fn security(password_type: SoapPasswordType) -> SoapSecurity {
        SoapSecurity {
            username: "svc-user".into(),
            password: "enc".into(),
            password_type,
            include_nonce: true,
        }
    }

    #[test]
    fn version_detection() {
        assert_eq!(detect_version(ENVELOPE_11.as_bytes()), SoapVersion::V11);
        assert_eq!(detect_version(ENVELOPE_12.as_bytes()), SoapVersion::V12);
        assert_eq!(SoapVersion::V11.content_type(), "text/xml; charset=utf-8");
        assert_eq!(
            SoapVersion::V12.content_type(),
            "application/soap+xml; charset=utf-8"
        );
    }

    #[test]
    fn injects_header_when_missing() {
        let out = inject_security(
            ENVELOPE_11.as_bytes(),
            &security(SoapPasswordType::Text),
            "pw",
        )
        .unwrap();
        let xml = String::from_utf8(out).unwrap();
        assert!(xml.contains("<soapenv:Header>"));
        assert!(xml.contains("<wsse:Security"));
        assert!(xml.contains("<wsse:Username>svc-user</wsse:Username>"));
        assert!(xml.contains("PasswordText"));
        assert!(xml.contains("pw</wsse:Password>"));
        // Body untouched.
        assert!(xml.contains("<symbol>ACME</symbol>"));
    }

    #[test]
    fn appends_into_existing_header() {
        let envelope = concat!(
            r#"<soapenv:Envelope xmlns:soapenv="http://schemas.xmlsoap.org/soap/envelope/">"#,
            r#"<soapenv:Header><Existing/></soapenv:Header>"#,
            r#"<soapenv:Body><Op/></soapenv:Body>"#,
            r#"</soapenv:Envelope>"#
        );
        let out = inject_security(
            envelope.as_bytes(),
            &security(SoapPasswordType::DigestSha256),
            "pw",
        )
        .unwrap();
        let xml = String::from_utf8(out).unwrap();
        assert_eq!(xml.matches("<soapenv:Header>").count(), 1);
        assert!(xml.contains("<wsse:Security"));
        assert!(xml.contains("<Existing/>"));
        assert!(xml.contains("password-digest-sha256"));
        // Digest mode never carries the plaintext password.
        assert!(!xml.contains(">pw<"));
    }

    #[test]
    fn empty_header_element_is_expanded() {
        let out = inject_security(
            ENVELOPE_12.as_bytes(),
            &security(SoapPasswordType::Text),
            "pw",
        )
        .unwrap();
        let xml = String::from_utf8(out).unwrap();
        assert_eq!(xml.matches("wsse:Security").count(), 2, "open and close tag");
        assert_eq!(xml.matches("<env:Header>").count(), 1);
        assert!(!xml.contains("<env:Header/>"));
    }

    #[test]
    fn legacy_sha1_digest_is_base64() {
        let out = inject_security(
            ENVELOPE_11.as_bytes(),
            &security(SoapPasswordType::Digest),
            "pw",
        )
        .unwrap();
        let xml = String::from_utf8(out).unwrap();
        assert!(xml.contains("#PasswordDigest\""));
        assert!(!xml.contains(">pw<"));
    }

    #[test]
    fn nonce_can_be_disabled() {
        let mut sec = security(SoapPasswordType::Text);
        sec.include_nonce = false;
        let out = inject_security(ENVELOPE_11.as_bytes(), &sec, "pw").unwrap();
        let xml = String::from_utf8(out).unwrap();
        assert!(!xml.contains("<wsse:Nonce>"));
    }

    #[test]
    fn bodyless_document_is_rejected() {
        let err = inject_security(
            b"<Envelope><NotBody/></Envelope>",
            &security(SoapPasswordType::Text),
            "pw",
        )
        .unwrap_err();
        assert!(matches!(err, GatewayError::MalformedBody(_)));
    }

    #[test]
    fn body_to_json_first_child() {
        let value = body_to_json(ENVELOPE_11.as_bytes()).unwrap();
        assert_eq!(
            value,
            serde_json::json!({"GetQuote": {"symbol": "ACME"}})
        );
    }

    #[test]
    fn body_to_json_repeated_siblings_become_arrays() {
        let envelope = concat!(
            r#"<e:Envelope xmlns:e="http://schemas.xmlsoap.org/soap/envelope/">"#,
            r#"<e:Body><Order><item>a</item><item>b</item></Order></e:Body>"#,
            r#"</e:Envelope>"#
        );
        let value = body_to_json(envelope.as_bytes()).unwrap();
        assert_eq!(
            value,
            serde_json::json!({"Order": {"item": ["a", "b"]}})
        );
    }

    #[test]
    fn body_to_json_empty_body_is_malformed() {
        let envelope = concat!(
            r#"<e:Envelope xmlns:e="http://schemas.xmlsoap.org/soap/envelope/">"#,
            r#"<e:Body></e:Body></e:Envelope>"#
        );
        assert!(body_to_json(envelope.as_bytes()).is_err());
    }

    #[test]
    fn xml_escaping_in_credentials() {
        let mut sec = security(SoapPasswordType::Text);
        sec.username = "a<b&c".into();
        let out = inject_security(ENVELOPE_11.as_bytes(), &sec, "p<w").unwrap();
        let xml = String::from_utf8(out).unwrap();
        assert!(xml.contains("a&lt;b&amp;c"));
        assert!(xml.contains("p&lt;w"));
    }
}
