//! HTTP/1.1 upgrade handshake
//!
//! Builds and validates the upgrade exchange for both roles, integrates
//! extension negotiation and commits the connection to the WebSocket
//! protocol. After a successful handshake the HTTP layer is out of the
//! picture; leftover bytes are handed to the frame decoder.

use base64::Engine;
use bytes::{BufMut, Bytes, BytesMut};
use rand::RngCore;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::error::{Error, Result};
use crate::extension::{accept_client, negotiate_server, DeflateOptions, NegotiatedDeflate};
use crate::WS_GUID;

/// Maximum HTTP head size accepted in either direction
const MAX_HEADER_SIZE: usize = 8192;

/// Headers owned by the upgrade machinery; user-supplied headers never
/// overwrite these.
const RESERVED_HEADERS: &[&str] = &[
    "host",
    "upgrade",
    "connection",
    "sec-websocket-key",
    "sec-websocket-version",
    "sec-websocket-extensions",
    "sec-websocket-protocol",
];

/// A parsed WebSocket upgrade request (server side)
#[derive(Debug)]
pub struct UpgradeRequest<'a> {
    /// Request target
    pub path: &'a str,
    /// Host header
    pub host: Option<&'a str>,
    /// Sec-WebSocket-Key header
    pub key: &'a str,
    /// Sec-WebSocket-Protocol header
    pub protocol: Option<&'a str>,
    /// Every Sec-WebSocket-Extensions header value, in order
    pub extensions: Vec<&'a str>,
    /// Origin header
    pub origin: Option<&'a str>,
}

/// Parse a WebSocket upgrade request.
///
/// Returns the parsed request and the number of bytes consumed, or
/// `Ok(None)` when the head is still incomplete.
pub fn parse_request(buf: &[u8]) -> Result<Option<(UpgradeRequest<'_>, usize)>> {
    if buf.len() > MAX_HEADER_SIZE {
        return Err(Error::Handshake("request head too large"));
    }

    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut req = httparse::Request::new(&mut headers);

    let len = match req.parse(buf) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(_) => return Err(Error::Handshake("malformed HTTP request")),
    };

    // Only GET may initiate an upgrade
    if req.method != Some("GET") {
        return Err(Error::MethodNotAllowed);
    }

    let mut key = None;
    let mut version = None;
    let mut host = None;
    let mut protocol = None;
    let mut extensions = Vec::new();
    let mut origin = None;
    let mut upgrade = false;
    let mut connection_upgrade = false;

    for header in req.headers.iter() {
        let name = header.name.to_ascii_lowercase();
        let value = std::str::from_utf8(header.value)
            .map_err(|_| Error::Handshake("invalid header value"))?;

        match name.as_str() {
            "sec-websocket-key" => key = Some(value),
            "sec-websocket-version" => version = Some(value),
            "sec-websocket-protocol" => protocol = Some(value),
            "sec-websocket-extensions" => extensions.push(value),
            "host" => host = Some(value),
            "origin" => origin = Some(value),
            "upgrade" => {
                if value.to_ascii_lowercase().contains("websocket") {
                    upgrade = true;
                }
            }
            "connection" => {
                if value.to_ascii_lowercase().contains("upgrade") {
                    connection_upgrade = true;
                }
            }
            _ => {}
        }
    }

    if !upgrade {
        return Err(Error::Handshake("missing Upgrade: websocket"));
    }
    if !connection_upgrade {
        return Err(Error::Handshake("missing Connection: Upgrade"));
    }
    let key = key.ok_or(Error::Handshake("missing Sec-WebSocket-Key"))?;
    let version = version.ok_or(Error::Handshake("missing Sec-WebSocket-Version"))?;
    if version != "13" {
        return Err(Error::Handshake("unsupported WebSocket version"));
    }

    Ok(Some((
        UpgradeRequest {
            path: req.path.unwrap_or("/"),
            host,
            key,
            protocol,
            extensions,
            origin,
        },
        len,
    )))
}

/// Compute `Sec-WebSocket-Accept`: Base64(SHA-1(key + GUID)).
#[inline]
pub fn generate_accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

/// Generate a random `Sec-WebSocket-Key` (16 random bytes, Base64).
pub fn generate_key() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

/// Build the client upgrade request head.
///
/// Each entry in `extension_offers` becomes its own
/// `Sec-WebSocket-Extensions` header. User headers are appended without
/// overwriting the upgrade set.
pub fn build_request(
    host: &str,
    path: &str,
    key: &str,
    protocol: Option<&str>,
    extension_offers: &[String],
    user_headers: &[(String, String)],
) -> Bytes {
    let mut buf = BytesMut::with_capacity(512);

    buf.put_slice(b"GET ");
    buf.put_slice(path.as_bytes());
    buf.put_slice(b" HTTP/1.1\r\n");
    buf.put_slice(b"Host: ");
    buf.put_slice(host.as_bytes());
    buf.put_slice(b"\r\n");
    buf.put_slice(b"Upgrade: websocket\r\n");
    buf.put_slice(b"Connection: Upgrade\r\n");
    buf.put_slice(b"Sec-WebSocket-Key: ");
    buf.put_slice(key.as_bytes());
    buf.put_slice(b"\r\n");
    buf.put_slice(b"Sec-WebSocket-Version: 13\r\n");

    if let Some(proto) = protocol {
        buf.put_slice(b"Sec-WebSocket-Protocol: ");
        buf.put_slice(proto.as_bytes());
        buf.put_slice(b"\r\n");
    }

    for offer in extension_offers {
        buf.put_slice(b"Sec-WebSocket-Extensions: ");
        buf.put_slice(offer.as_bytes());
        buf.put_slice(b"\r\n");
    }

    for (name, value) in user_headers {
        if RESERVED_HEADERS.contains(&name.to_ascii_lowercase().as_str()) {
            continue;
        }
        buf.put_slice(name.as_bytes());
        buf.put_slice(b": ");
        buf.put_slice(value.as_bytes());
        buf.put_slice(b"\r\n");
    }

    buf.put_slice(b"\r\n");
    buf.freeze()
}

/// Build the 101 Switching Protocols response head.
pub fn build_response(
    accept_key: &str,
    protocol: Option<&str>,
    extension_headers: &[String],
    extra_headers: &[(String, String)],
) -> Bytes {
    let mut buf = BytesMut::with_capacity(256);

    buf.put_slice(b"HTTP/1.1 101 Switching Protocols\r\n");
    buf.put_slice(b"Upgrade: websocket\r\n");
    buf.put_slice(b"Connection: Upgrade\r\n");
    buf.put_slice(b"Sec-WebSocket-Accept: ");
    buf.put_slice(accept_key.as_bytes());
    buf.put_slice(b"\r\n");

    if let Some(proto) = protocol {
        buf.put_slice(b"Sec-WebSocket-Protocol: ");
        buf.put_slice(proto.as_bytes());
        buf.put_slice(b"\r\n");
    }

    for value in extension_headers {
        buf.put_slice(b"Sec-WebSocket-Extensions: ");
        buf.put_slice(value.as_bytes());
        buf.put_slice(b"\r\n");
    }

    for (name, value) in extra_headers {
        if RESERVED_HEADERS.contains(&name.to_ascii_lowercase().as_str()) {
            continue;
        }
        buf.put_slice(name.as_bytes());
        buf.put_slice(b": ");
        buf.put_slice(value.as_bytes());
        buf.put_slice(b"\r\n");
    }

    buf.put_slice(b"\r\n");
    buf.freeze()
}

/// Build a rejection response for a failed upgrade.
pub fn build_reject(status: u16) -> Bytes {
    let line: &[u8] = match status {
        405 => b"HTTP/1.1 405 Method Not Allowed\r\nAllow: GET\r\n",
        500 => b"HTTP/1.1 500 Internal Server Error\r\n",
        _ => b"HTTP/1.1 400 Bad Request\r\n",
    };
    let mut buf = BytesMut::with_capacity(line.len() + 32);
    buf.put_slice(line);
    buf.put_slice(b"Connection: close\r\nContent-Length: 0\r\n\r\n");
    buf.freeze()
}

/// A parsed upgrade response (client side)
#[derive(Debug)]
pub struct UpgradeResponse<'a> {
    /// HTTP status code
    pub status: u16,
    /// Sec-WebSocket-Accept header
    pub accept: Option<&'a str>,
    /// Sec-WebSocket-Protocol header
    pub protocol: Option<&'a str>,
    /// Every Sec-WebSocket-Extensions header value, in order
    pub extensions: Vec<&'a str>,
}

/// Parse a WebSocket upgrade response. Does not judge the status code;
/// the caller decides what a non-101 means.
pub fn parse_response(buf: &[u8]) -> Result<Option<(UpgradeResponse<'_>, usize)>> {
    if buf.len() > MAX_HEADER_SIZE {
        return Err(Error::Handshake("response head too large"));
    }

    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut res = httparse::Response::new(&mut headers);

    let len = match res.parse(buf) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(_) => return Err(Error::Handshake("malformed HTTP response")),
    };

    let mut accept = None;
    let mut protocol = None;
    let mut extensions = Vec::new();

    for header in res.headers.iter() {
        let name = header.name.to_ascii_lowercase();
        let value = std::str::from_utf8(header.value)
            .map_err(|_| Error::Handshake("invalid header value"))?;

        match name.as_str() {
            "sec-websocket-accept" => accept = Some(value),
            "sec-websocket-protocol" => protocol = Some(value),
            "sec-websocket-extensions" => extensions.push(value),
            _ => {}
        }
    }

    Ok(Some((
        UpgradeResponse {
            status: res.code.unwrap_or(0),
            accept,
            protocol,
            extensions,
        },
        len,
    )))
}

/// Validate the server's accept key against the key we sent.
pub fn validate_accept_key(sent_key: &str, received_accept: &str) -> bool {
    generate_accept_key(sent_key) == received_accept
}

/// Result of a committed handshake
#[derive(Debug)]
pub struct HandshakeOutcome {
    /// Request target
    pub path: String,
    /// Echoed subprotocol, if any
    pub protocol: Option<String>,
    /// Accepted permessage-deflate parameters, if the extension is active
    pub deflate: Option<NegotiatedDeflate>,
    /// Bytes received after the HTTP head
    pub leftover: Option<Bytes>,
}

/// Acceptance decision returned by the server's upgrade predicate.
pub enum AcceptAction {
    /// Accept the upgrade; the headers are added to the 101 response
    Accept(Vec<(String, String)>),
    /// Reject the upgrade with 400
    Reject,
}

/// Drive the client side of the upgrade exchange.
pub async fn client_handshake<S>(
    stream: &mut S,
    host: &str,
    path: &str,
    protocol: Option<&str>,
    user_headers: &[(String, String)],
    deflate: Option<&DeflateOptions>,
) -> Result<HandshakeOutcome>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let key = generate_key();
    let offers: Vec<String> = deflate.iter().map(|opt| opt.offer_header()).collect();
    let request = build_request(host, path, &key, protocol, &offers, user_headers);

    stream.write_all(&request).await?;
    stream.flush().await?;

    let mut buf = BytesMut::with_capacity(4096);
    loop {
        if buf.len() > MAX_HEADER_SIZE {
            return Err(Error::Handshake("response head too large"));
        }
        let n = stream.read_buf(&mut buf).await?;
        if n == 0 {
            return Err(Error::ConnectionClosed);
        }

        let (status, accept_ok, protocol_echo, extensions_joined, consumed) =
            match parse_response(&buf)? {
                Some((res, consumed)) => (
                    res.status,
                    res.accept.map(|a| validate_accept_key(&key, a)),
                    res.protocol.map(String::from),
                    if res.extensions.is_empty() {
                        None
                    } else {
                        Some(res.extensions.join(", "))
                    },
                    consumed,
                ),
                None => continue,
            };

        if status != 101 {
            debug!(status, "upgrade refused");
            return Err(Error::NotUpgraded);
        }
        match accept_ok {
            Some(true) => {}
            Some(false) => return Err(Error::Handshake("invalid Sec-WebSocket-Accept")),
            None => return Err(Error::Handshake("missing Sec-WebSocket-Accept")),
        }

        let negotiated = match deflate {
            Some(requested) => accept_client(requested, extensions_joined.as_deref())?,
            None => None,
        };

        let leftover = if consumed < buf.len() {
            Some(buf.split_off(consumed).freeze())
        } else {
            None
        };

        debug!(path, deflate = negotiated.is_some(), "client upgrade committed");
        return Ok(HandshakeOutcome {
            path: path.to_string(),
            protocol: protocol_echo,
            deflate: negotiated,
            leftover,
        });
    }
}

/// Drive the server side of the upgrade exchange.
///
/// `accept` is consulted once the request parses; it may veto the upgrade
/// and supply supplementary response headers. Rejections are answered with
/// the documented status codes before the error is returned.
pub async fn server_handshake<S, F>(
    stream: &mut S,
    deflate: Option<&DeflateOptions>,
    mut accept: F,
) -> Result<HandshakeOutcome>
where
    S: AsyncRead + AsyncWrite + Unpin,
    F: FnMut(&UpgradeRequest<'_>) -> AcceptAction,
{
    let mut buf = BytesMut::with_capacity(4096);

    loop {
        if buf.len() > MAX_HEADER_SIZE {
            let _ = stream.write_all(&build_reject(400)).await;
            return Err(Error::Handshake("request head too large"));
        }
        let n = stream.read_buf(&mut buf).await?;
        if n == 0 {
            return Err(Error::ConnectionClosed);
        }

        let parsed = match parse_request(&buf) {
            Ok(parsed) => parsed,
            Err(Error::MethodNotAllowed) => {
                let _ = stream.write_all(&build_reject(405)).await;
                let _ = stream.flush().await;
                return Err(Error::MethodNotAllowed);
            }
            Err(e) => {
                let _ = stream.write_all(&build_reject(400)).await;
                let _ = stream.flush().await;
                return Err(e);
            }
        };

        let (req, consumed) = match parsed {
            Some(x) => x,
            None => continue,
        };

        let extra_headers = match accept(&req) {
            AcceptAction::Accept(headers) => headers,
            AcceptAction::Reject => {
                let _ = stream.write_all(&build_reject(400)).await;
                let _ = stream.flush().await;
                return Err(Error::Handshake("upgrade rejected"));
            }
        };

        let negotiated = match deflate {
            Some(local) => match negotiate_server(local, &req.extensions) {
                Ok(negotiated) => negotiated,
                Err(e) => {
                    let _ = stream.write_all(&build_reject(400)).await;
                    let _ = stream.flush().await;
                    return Err(e);
                }
            },
            None => None,
        };

        let accept_key = generate_accept_key(req.key);
        let path = req.path.to_string();
        let protocol = req.protocol.map(String::from);
        let extension_headers: Vec<String> =
            negotiated.iter().map(|n| n.response_header()).collect();

        let response = build_response(
            &accept_key,
            protocol.as_deref(),
            &extension_headers,
            &extra_headers,
        );
        stream.write_all(&response).await?;
        stream.flush().await?;

        let leftover = if consumed < buf.len() {
            Some(buf.split_off(consumed).freeze())
        } else {
            None
        };

        debug!(path = %path, deflate = negotiated.is_some(), "server upgrade committed");
        return Ok(HandshakeOutcome {
            path,
            protocol,
            deflate: negotiated,
            leftover,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_accept_key() {
        // Test vector from RFC 6455
        let key = "dGhlIHNhbXBsZSBub25jZQ==";
        assert_eq!(generate_accept_key(key), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn test_generated_keys_decode_to_16_bytes() {
        let key = generate_key();
        let raw = base64::engine::general_purpose::STANDARD
            .decode(&key)
            .unwrap();
        assert_eq!(raw.len(), 16);
        assert_ne!(generate_key(), key);
    }

    #[test]
    fn test_parse_request() {
        let request = b"GET /chat HTTP/1.1\r\n\
            Host: server.example.com\r\n\
            Upgrade: websocket\r\n\
            Connection: Upgrade\r\n\
            Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
            Sec-WebSocket-Version: 13\r\n\
            Sec-WebSocket-Extensions: permessage-deflate\r\n\
            Sec-WebSocket-Extensions: permessage-deflate; client_max_window_bits=10\r\n\
            \r\n";

        let (req, len) = parse_request(request).unwrap().unwrap();
        assert_eq!(req.path, "/chat");
        assert_eq!(req.key, "dGhlIHNhbXBsZSBub25jZQ==");
        assert_eq!(req.extensions.len(), 2);
        assert_eq!(len, request.len());
    }

    #[test]
    fn test_parse_request_partial() {
        let request = b"GET /chat HTTP/1.1\r\nHost: server.example.com\r\n";
        assert!(parse_request(request).unwrap().is_none());
    }

    #[test]
    fn test_non_get_rejected() {
        let request = b"POST /chat HTTP/1.1\r\n\
            Host: server.example.com\r\n\
            Upgrade: websocket\r\n\
            Connection: Upgrade\r\n\
            Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
            Sec-WebSocket-Version: 13\r\n\
            \r\n";
        assert!(matches!(
            parse_request(request),
            Err(Error::MethodNotAllowed)
        ));
    }

    #[test]
    fn test_wrong_version_rejected() {
        let request = b"GET / HTTP/1.1\r\n\
            Host: h\r\n\
            Upgrade: websocket\r\n\
            Connection: Upgrade\r\n\
            Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
            Sec-WebSocket-Version: 8\r\n\
            \r\n";
        assert!(parse_request(request).is_err());
    }

    #[test]
    fn test_build_request_merges_user_headers() {
        let request = build_request(
            "example.com",
            "/ws",
            "a2V5a2V5a2V5a2V5a2V5a2==",
            None,
            &["permessage-deflate".to_string()],
            &[
                ("Authorization".to_string(), "Bearer token".to_string()),
                // Must not override the upgrade machinery
                ("Upgrade".to_string(), "h2c".to_string()),
            ],
        );

        let text = std::str::from_utf8(&request).unwrap();
        assert!(text.starts_with("GET /ws HTTP/1.1\r\n"));
        assert!(text.contains("Sec-WebSocket-Extensions: permessage-deflate\r\n"));
        assert!(text.contains("Authorization: Bearer token\r\n"));
        assert_eq!(text.matches("Upgrade:").count(), 1);
        assert!(text.contains("Upgrade: websocket\r\n"));
    }

    #[test]
    fn test_build_response() {
        let response = build_response(
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=",
            Some("chat"),
            &["permessage-deflate".to_string()],
            &[("X-Request-Id".to_string(), "42".to_string())],
        );

        let text = std::str::from_utf8(&response).unwrap();
        assert!(text.contains("101 Switching Protocols"));
        assert!(text.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
        assert!(text.contains("Sec-WebSocket-Protocol: chat\r\n"));
        assert!(text.contains("Sec-WebSocket-Extensions: permessage-deflate\r\n"));
        assert!(text.contains("X-Request-Id: 42\r\n"));
    }

    #[test]
    fn test_build_reject() {
        assert!(std::str::from_utf8(&build_reject(405))
            .unwrap()
            .contains("405 Method Not Allowed"));
        assert!(std::str::from_utf8(&build_reject(400))
            .unwrap()
            .contains("400 Bad Request"));
        assert!(std::str::from_utf8(&build_reject(500))
            .unwrap()
            .contains("500 Internal Server Error"));
    }

    #[test]
    fn test_parse_response_keeps_status() {
        let response = b"HTTP/1.1 403 Forbidden\r\n\r\n";
        let (res, _) = parse_response(response).unwrap().unwrap();
        assert_eq!(res.status, 403);
    }

    #[test]
    fn test_validate_accept_key() {
        let key = "dGhlIHNhbXBsZSBub25jZQ==";
        assert!(validate_accept_key(key, "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));
        assert!(!validate_accept_key(key, "bogus"));
    }

    #[tokio::test]
    async fn test_handshake_end_to_end() {
        let (mut client_io, mut server_io) = tokio::io::duplex(4096);

        let options = DeflateOptions::default();
        let server_options = options.clone();
        let server = tokio::spawn(async move {
            server_handshake(&mut server_io, Some(&server_options), |req| {
                assert_eq!(req.path, "/live");
                AcceptAction::Accept(vec![])
            })
            .await
        });

        let outcome = client_handshake(
            &mut client_io,
            "example.com",
            "/live",
            None,
            &[],
            Some(&options),
        )
        .await
        .unwrap();

        assert!(outcome.deflate.is_some());
        let server_outcome = server.await.unwrap().unwrap();
        assert_eq!(server_outcome.path, "/live");
        assert!(server_outcome.deflate.is_some());
    }

    #[tokio::test]
    async fn test_handshake_rejected_upgrade() {
        let (mut client_io, mut server_io) = tokio::io::duplex(4096);

        let server = tokio::spawn(async move {
            server_handshake(&mut server_io, None, |_| AcceptAction::Reject).await
        });

        let err = client_handshake(&mut client_io, "example.com", "/", None, &[], None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotUpgraded));
        assert!(server.await.unwrap().is_err());
    }
}
