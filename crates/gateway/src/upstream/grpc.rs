//! gRPC dispatch against descriptor-set artifacts.
//!
//! The inbound body is `{method: "Service.Method", message: {...}}`. The
//! message is encoded against the API's compiled descriptor set and sent
//! as a unary call through a passthrough byte codec; the reply is decoded
//! back into JSON. When `DOORMAN_ENABLE_GRPC_REFLECTION` is set and no
//! artifact exists, descriptors are fetched from the server's reflection
//! service and cached.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use http::uri::PathAndQuery;
use prost::Message;
use prost::encoding::{WireType, decode_key, decode_varint, encode_key, encode_varint};
use prost_types::{FileDescriptorProto, FileDescriptorSet};
use tonic::Status;
use tonic::client::Grpc;
use tonic::codec::{Codec, DecodeBuf, Decoder, EncodeBuf, Encoder};
use tonic::transport::{Channel, Endpoint as TonicEndpoint};
use tracing::debug;

use doorman_core::Api;

use crate::balancer::ServerSelection;
use crate::context::GatewayContext;
use crate::error::GatewayError;
use crate::proto;

use super::{UpstreamRequest, UpstreamResponse};

const REFLECTION_PATH: &str = "/grpc.reflection.v1alpha.ServerReflection/ServerReflectionInfo";

/// Passthrough codec: the gateway encodes/decodes messages itself, so the
/// transport moves raw frames.
#[derive(Debug, Clone, Default)]
pub struct RawCodec;

#[derive(Debug)]
pub struct RawEncoder;

#[derive(Debug)]
pub struct RawDecoder;

impl Codec for RawCodec {
    type Encode = Bytes;
    type Decode = Bytes;
    type Encoder = RawEncoder;
    type Decoder = RawDecoder;

    fn encoder(&mut self) -> Self::Encoder {
        RawEncoder
    }

    fn decoder(&mut self) -> Self::Decoder {
        RawDecoder
    }
}

impl Encoder for RawEncoder {
    type Item = Bytes;
    type Error = Status;

    fn encode(&mut self, item: Bytes, dst: &mut EncodeBuf<'_>) -> Result<(), Status> {
        dst.put(item);
        Ok(())
    }
}

impl Decoder for RawDecoder {
    type Item = Bytes;
    type Error = Status;

    fn decode(&mut self, src: &mut DecodeBuf<'_>) -> Result<Option<Bytes>, Status> {
        let remaining = src.remaining();
        Ok(Some(src.copy_to_bytes(remaining)))
    }
}

/// gRPC status -> HTTP status.
#[must_use]
pub fn map_status(code: tonic::Code) -> u16 {
    match code {
        tonic::Code::Ok => 200,
        tonic::Code::InvalidArgument => 400,
        tonic::Code::Unauthenticated => 401,
        tonic::Code::PermissionDenied => 403,
        tonic::Code::NotFound => 404,
        tonic::Code::ResourceExhausted => 429,
        tonic::Code::Unavailable => 503,
        tonic::Code::DeadlineExceeded => 504,
        _ => 500,
    }
}

/// `grpc://` and `grpcs://` server URLs to HTTP forms tonic understands.
fn channel_url(server: &str) -> Result<String, GatewayError> {
    if let Some(rest) = server.strip_prefix("grpc://") {
        Ok(format!("http://{rest}"))
    } else if let Some(rest) = server.strip_prefix("grpcs://") {
        Ok(format!("https://{rest}"))
    } else {
        Err(GatewayError::Internal(format!(
            "gRPC server has unexpected scheme: {server}"
        )))
    }
}

async fn connect(ctx: &GatewayContext, server: &str) -> Result<Channel, GatewayError> {
    let endpoint = TonicEndpoint::from_shared(channel_url(server)?)
        .map_err(|e| GatewayError::UpstreamConnect(format!("bad endpoint: {e}")))?
        .timeout(ctx.config().request_timeout)
        .connect_timeout(ctx.config().request_timeout);
    endpoint
        .connect()
        .await
        .map_err(|e| GatewayError::UpstreamConnect(e.to_string()))
}

pub(super) async fn dispatch(
    ctx: &GatewayContext,
    api: &Api,
    selection: &ServerSelection,
    request: &UpstreamRequest,
) -> Result<UpstreamResponse, GatewayError> {
    let body: serde_json::Value = serde_json::from_slice(&request.body)
        .map_err(|e| GatewayError::MalformedBody(format!("invalid JSON body: {e}")))?;
    let method_ref = body
        .get("method")
        .and_then(|v| v.as_str())
        .ok_or_else(|| GatewayError::MalformedBody("missing \"method\" field".into()))?
        .to_owned();
    let message = body
        .get("message")
        .cloned()
        .unwrap_or_else(|| serde_json::json!({}));

    let channel = connect(ctx, &selection.server).await?;

    let set = match ctx.protos.load(&api.api_name, &api.api_version) {
        Ok(set) => set,
        Err(missing) => {
            if !ctx.config().grpc_reflection_enabled {
                return Err(missing);
            }
            // Reflection fallback: resolve the service symbol remotely.
            let service = method_ref.split('.').next().unwrap_or_default();
            let symbol = match api.api_grpc_package.as_deref() {
                Some(package) if !package.is_empty() => format!("{package}.{service}"),
                _ => service.to_owned(),
            };
            let fetched = fetch_via_reflection(channel.clone(), &symbol).await?;
            ctx.protos
                .register(&api.api_name, &api.api_version, fetched);
            ctx.protos.load(&api.api_name, &api.api_version)?
        }
    };

    let resolved = proto::resolve_method(&set, api.api_grpc_package.as_deref(), &method_ref)?;
    let encoded = proto::encode_message(&set, &resolved.input_type, &message)?;
    debug!(path = %resolved.path, bytes = encoded.len(), "dispatching gRPC unary call");

    let mut grpc = Grpc::new(channel);
    grpc.ready()
        .await
        .map_err(|e| GatewayError::UpstreamConnect(e.to_string()))?;

    let path = resolved
        .path
        .parse::<PathAndQuery>()
        .map_err(|e| GatewayError::Internal(format!("bad method path: {e}")))?;

    match grpc
        .unary(tonic::Request::new(encoded), path, RawCodec)
        .await
    {
        Ok(response) => {
            let reply = proto::decode_message(&set, &resolved.output_type, &response.into_inner())?;
            let json = serde_json::to_vec(&reply)
                .map_err(|e| GatewayError::Internal(format!("reply encode failed: {e}")))?;
            let mut headers = std::collections::BTreeMap::new();
            headers.insert("content-type".to_owned(), "application/json".to_owned());
            headers.insert("grpc-status".to_owned(), "0".to_owned());
            Ok(UpstreamResponse {
                status: 200,
                headers,
                body: Bytes::from(json),
            })
        }
        Err(status) => {
            let http_status = map_status(status.code());
            let body = serde_json::json!({
                "error": status.message(),
                "grpc_status": status.code() as i32,
            });
            let mut headers = std::collections::BTreeMap::new();
            headers.insert("content-type".to_owned(), "application/json".to_owned());
            headers.insert(
                "grpc-status".to_owned(),
                (status.code() as i32).to_string(),
            );
            Ok(UpstreamResponse {
                status: http_status,
                headers,
                body: Bytes::from(serde_json::to_vec(&body).unwrap_or_default()),
            })
        }
    }
}

/// Fetch the descriptor set for `symbol` from the server reflection
/// service (v1alpha). The request/response messages are tiny, so they are
/// encoded by hand with the same wire primitives the dynamic codec uses.
async fn fetch_via_reflection(
    channel: Channel,
    symbol: &str,
) -> Result<FileDescriptorSet, GatewayError> {
    // ServerReflectionRequest { file_containing_symbol = 4 }
    let mut request = BytesMut::new();
    encode_key(4, WireType::LengthDelimited, &mut request);
    encode_varint(symbol.len() as u64, &mut request);
    request.put_slice(symbol.as_bytes());

    let mut grpc = Grpc::new(channel);
    grpc.ready()
        .await
        .map_err(|e| GatewayError::UpstreamConnect(e.to_string()))?;
    let path = PathAndQuery::from_static(REFLECTION_PATH);
    let outbound = futures::stream::once(async move { request.freeze() });

    let response = grpc
        .streaming(tonic::Request::new(outbound), path, RawCodec)
        .await
        .map_err(|status| {
            GatewayError::ProtoDecode(format!("reflection call failed: {}", status.message()))
        })?;

    let mut inbound = response.into_inner();
    let message = inbound
        .message()
        .await
        .map_err(|status| {
            GatewayError::ProtoDecode(format!("reflection stream failed: {}", status.message()))
        })?
        .ok_or_else(|| GatewayError::ProtoDecode("reflection returned no response".into()))?;

    parse_reflection_response(&message)
}

/// Extract `FileDescriptorResponse.file_descriptor_proto` blobs out of a
/// `ServerReflectionResponse` (field 4 of the response oneof).
fn parse_reflection_response(bytes: &[u8]) -> Result<FileDescriptorSet, GatewayError> {
    let mut buf = bytes;
    let mut set = FileDescriptorSet::default();

    while buf.has_remaining() {
        let (tag, wire_type) = decode_key(&mut buf)
            .map_err(|e| GatewayError::ProtoDecode(format!("reflection response: {e}")))?;
        match (tag, wire_type) {
            (4, WireType::LengthDelimited) => {
                let len = decode_varint(&mut buf)
                    .map_err(|e| GatewayError::ProtoDecode(format!("reflection length: {e}")))?;
                let len = usize::try_from(len)
                    .map_err(|_| GatewayError::ProtoDecode("reflection length overflow".into()))?;
                if buf.remaining() < len {
                    return Err(GatewayError::ProtoDecode("truncated reflection response".into()));
                }
                let mut inner = &buf[..len];
                buf.advance(len);

                // FileDescriptorResponse { repeated bytes file_descriptor_proto = 1 }
                while inner.has_remaining() {
                    let (inner_tag, inner_wire) = decode_key(&mut inner).map_err(|e| {
                        GatewayError::ProtoDecode(format!("descriptor response: {e}"))
                    })?;
                    if inner_tag == 1 && inner_wire == WireType::LengthDelimited {
                        let fd_len = decode_varint(&mut inner).map_err(|e| {
                            GatewayError::ProtoDecode(format!("descriptor length: {e}"))
                        })?;
                        let fd_len = usize::try_from(fd_len).map_err(|_| {
                            GatewayError::ProtoDecode("descriptor length overflow".into())
                        })?;
                        if inner.remaining() < fd_len {
                            return Err(GatewayError::ProtoDecode(
                                "truncated descriptor blob".into(),
                            ));
                        }
                        let fd = FileDescriptorProto::decode(&inner[..fd_len]).map_err(|e| {
                            GatewayError::ProtoDecode(format!("descriptor decode failed: {e}"))
                        })?;
                        inner.advance(fd_len);
                        set.file.push(fd);
                    } else {
                        skip_unknown(inner_wire, &mut inner)?;
                    }
                }
            }
            (7, WireType::LengthDelimited) => {
                // ErrorResponse — surface it rather than guessing.
                return Err(GatewayError::ProtoDecode(
                    "reflection server returned an error response".into(),
                ));
            }
            (_, wire) => skip_unknown(wire, &mut buf)?,
        }
    }

    if set.file.is_empty() {
        return Err(GatewayError::ProtoDecode(
            "reflection response contained no descriptors".into(),
        ));
    }
    Ok(set)
}

fn skip_unknown(wire_type: WireType, buf: &mut &[u8]) -> Result<(), GatewayError> {
    match wire_type {
        WireType::Varint => {
            decode_varint(buf)
                .map_err(|e| GatewayError::ProtoDecode(format!("skip varint: {e}")))?;
        }
        WireType::SixtyFourBit => {
            if buf.remaining() < 8 {
                return Err(GatewayError::ProtoDecode("truncated field".into()));
            }
            buf.advance(8);
        }
        WireType::ThirtyTwoBit => {
            if buf.remaining() < 4 {
                return Err(GatewayError::ProtoDecode("truncated field".into()));
            }
            buf.advance(4);
        }
        WireType::LengthDelimited => {
            let len = decode_varint(buf)
                .map_err(|e| GatewayError::ProtoDecode(format!("skip length: {e}")))?;
            let len = usize::try_from(len)
                .map_err(|_| GatewayError::ProtoDecode("length overflow".into()))?;
            if buf.remaining() < len {
                return Err(GatewayError::ProtoDecode("truncated field".into()));
            }
            buf.advance(len);
        }
        WireType::StartGroup | WireType::EndGroup => {
            return Err(GatewayError::ProtoDecode("unexpected group".into()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_matches_table() {
        assert_eq!(map_status(tonic::Code::Ok), 200);
        assert_eq!(map_status(tonic::Code::InvalidArgument), 400);
        assert_eq!(map_status(tonic::Code::Unauthenticated), 401);
        assert_eq!(map_status(tonic::Code::PermissionDenied), 403);
        assert_eq!(map_status(tonic::Code::NotFound), 404);
        assert_eq!(map_status(tonic::Code::ResourceExhausted), 429);
        assert_eq!(map_status(tonic::Code::Unavailable), 503);
        assert_eq!(map_status(tonic::Code::DeadlineExceeded), 504);
        assert_eq!(map_status(tonic::Code::Internal), 500);
        assert_eq!(map_status(tonic::Code::Unknown), 500);
    }

    #[test]
    fn channel_url_schemes() {
        assert_eq!(channel_url("grpc://host:50051").unwrap(), "http://host:50051");
        assert_eq!(channel_url("grpcs://host:443").unwrap(), "https://host:443");
        assert!(channel_url("http://host").is_err());
    }

    #[test]
    fn reflection_response_parses_descriptors() {
        // Build a ServerReflectionResponse containing one
        // FileDescriptorProto for an empty file named "x.proto".
        let fd = FileDescriptorProto {
            name: Some("x.proto".to_owned()),
            ..FileDescriptorProto::default()
        };
        let fd_bytes = fd.encode_to_vec();

        let mut descriptor_response = BytesMut::new();
        encode_key(1, WireType::LengthDelimited, &mut descriptor_response);
        encode_varint(fd_bytes.len() as u64, &mut descriptor_response);
        descriptor_response.put_slice(&fd_bytes);

        let mut response = BytesMut::new();
        encode_key(4, WireType::LengthDelimited, &mut response);
        encode_varint(descriptor_response.len() as u64, &mut response);
        response.put_slice(&descriptor_response);

        let set = parse_reflection_response(&response).unwrap();
        assert_eq!(set.file.len(), 1);
        assert_eq!(set.file[0].name.as_deref(), Some("x.proto"));
    }

    #[test]
    fn reflection_error_response_is_surfaced() {
        let mut response = BytesMut::new();
        encode_key(7, WireType::LengthDelimited, &mut response);
        encode_varint(0, &mut response);
        assert!(parse_reflection_response(&response).is_err());
    }

    #[test]
    fn empty_reflection_response_is_an_error() {
        assert!(parse_reflection_response(&[]).is_err());
    }
}
