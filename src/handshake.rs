// Copyright (c) 2026 wspp developers
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

//! Websocket server [handshake]: opening request parsing and validation
//! and handshake response encoding.
//!
//! [handshake]: https://tools.ietf.org/html/rfc6455#section-4

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::{Buf, BytesMut};
use http::StatusCode;
use sha1::{Digest, Sha1};
use smallvec::SmallVec;
use std::{fmt, str};

// Defined in RFC6455 and used to derive the `Sec-WebSocket-Accept` header
// value in the server handshake response.
const KEY: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

// How many HTTP headers do we support during parsing?
const MAX_NUM_HEADERS: usize = 32;

/// The value of the `Server` header in every response we produce.
pub const SERVER_AGENT: &str = concat!("wspp/", env!("CARGO_PKG_VERSION"));

/// Compute the `Sec-WebSocket-Accept` value for a client-supplied key.
pub fn accept_key(key: &str) -> String {
    let mut digest = Sha1::new();
    digest.update(key.as_bytes());
    digest.update(KEY);
    BASE64.encode(digest.finalize())
}

// Request ////////////////////////////////////////////////////////////////////////////////////////

/// The client's opening HTTP request.
///
/// Parsing records the request as received and performs no websocket
/// validation; an application may answer it with a plain HTTP response
/// instead of upgrading. See [`validate`] for the upgrade checks.
#[derive(Debug)]
pub struct Request {
    method: String,
    resource: String,
    http_version: u8,
    /// Headers in order of first appearance. Values of repeated names
    /// are combined with `", "`.
    headers: Vec<(String, String)>,
    body: BytesMut
}

impl Request {
    /// The HTTP request method.
    pub fn method(&self) -> &str {
        &self.method
    }

    /// The request target, e.g. `/chat`.
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// The minor HTTP version, i.e. 1 for HTTP/1.1.
    pub fn http_version(&self) -> u8 {
        self.http_version
    }

    /// Look up a header value by case-insensitive name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// All headers in order of first appearance.
    pub fn headers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// The declared `Content-Length`, if present and well-formed.
    pub fn content_length(&self) -> Option<usize> {
        self.header("Content-Length").and_then(|v| v.trim().parse().ok())
    }

    /// The request body (empty unless `Content-Length` was present).
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub(crate) fn set_body(&mut self, body: BytesMut) {
        self.body = body
    }
}

/// Decode a client handshake request.
///
/// Returns `Ok(None)` until the terminating CRLFCRLF has arrived. On
/// success the parsed header section is consumed from `buf`; any body
/// bytes that were read along with it remain.
pub fn decode(buf: &mut BytesMut) -> Result<Option<Request>, Rejection> {
    let mut header_buf = [httparse::EMPTY_HEADER; MAX_NUM_HEADERS];
    let mut request = httparse::Request::new(&mut header_buf);

    let offset = match request.parse(buf.as_ref()) {
        Ok(httparse::Status::Complete(off)) => off,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(e) => return Err(Rejection::new(400, format!("malformed handshake request: {}", e)))
    };

    let method = request.method.unwrap_or("").to_string();
    let resource = request.path.unwrap_or("").to_string();
    let http_version = request.version.unwrap_or(0);

    let mut headers: Vec<(String, String)> = Vec::with_capacity(request.headers.len());
    for h in request.headers.iter() {
        let value = str::from_utf8(h.value)
            .map_err(|_| Rejection::new(400, format!("header {} is not valid utf-8", h.name)))?;
        if let Some((_, existing)) = headers
            .iter_mut()
            .find(|(n, _)| n.eq_ignore_ascii_case(h.name))
        {
            existing.push_str(", ");
            existing.push_str(value)
        } else {
            headers.push((h.name.to_string(), value.to_string()))
        }
    }

    buf.advance(offset);

    Ok(Some(Request { method, resource, http_version, headers, body: BytesMut::new() }))
}

// Validation /////////////////////////////////////////////////////////////////////////////////////

/// Parameters extracted by a successful upgrade validation.
#[derive(Debug)]
pub struct Upgrade {
    /// The websocket protocol version (7, 8 or 13).
    pub version: u8,
    /// The nonce from `Sec-WebSocket-Key`.
    pub key: String,
    /// The client origin, if sent.
    pub origin: Option<String>,
    /// Subprotocols proposed via `Sec-WebSocket-Protocol`.
    pub protocols: SmallVec<[String; 4]>,
    /// Extensions proposed via `Sec-WebSocket-Extensions`.
    pub extensions: SmallVec<[String; 4]>
}

/// Check the intrinsic upgrade requirements of [RFC6455, section 4.2.1]
/// against a parsed request.
///
/// [RFC6455, section 4.2.1]: https://tools.ietf.org/html/rfc6455#section-4.2.1
pub fn validate(request: &Request) -> Result<Upgrade, Rejection> {
    if request.method() != "GET" {
        return Err(Rejection::new(400, format!("handshake has invalid method: {}", request.method())))
    }

    if request.http_version() != 1 {
        return Err(Rejection::new(400, "handshake has invalid HTTP version"))
    }

    if request.header("Host").map_or(true, str::is_empty) {
        return Err(Rejection::new(400, "required Host header is missing"))
    }

    match request.header("Upgrade") {
        None => return Err(Rejection::new(400, "required Upgrade header is missing")),
        Some(u) if !u.eq_ignore_ascii_case("websocket") => {
            return Err(Rejection::new(400, format!("Upgrade header was {} instead of \"websocket\"", u)))
        }
        Some(_) => {}
    }

    match request.header("Connection") {
        None => return Err(Rejection::new(400, "required Connection header is missing")),
        Some(c) if !contains_token(c, "upgrade") => {
            return Err(Rejection::new(
                400,
                format!("Connection header \"{}\" does not contain required token \"upgrade\"", c)
            ))
        }
        Some(_) => {}
    }

    let key = match request.header("Sec-WebSocket-Key") {
        Some(k) if !k.is_empty() => k.to_string(),
        _ => return Err(Rejection::new(400, "required Sec-WebSocket-Key header is missing"))
    };

    let version = match request.header("Sec-WebSocket-Version") {
        None => return Err(Rejection::new(400, "required Sec-WebSocket-Version header is missing")),
        Some(v) => match v.trim().parse::<u8>() {
            Ok(n @ (7 | 8 | 13)) => n,
            _ => {
                return Err(Rejection::new(
                    400,
                    format!("this server doesn't support websocket protocol version {}", v)
                ))
            }
        }
    };

    // Up to draft 8 the origin came in `Sec-WebSocket-Origin`; the final
    // protocol renamed it. Either way it is optional.
    let origin_header = if version < 13 { "Sec-WebSocket-Origin" } else { "Origin" };
    let origin = request.header(origin_header).filter(|o| !o.is_empty()).map(String::from);

    let protocols = list_header(request, "Sec-WebSocket-Protocol");
    let extensions = list_header(request, "Sec-WebSocket-Extensions");

    Ok(Upgrade { version, key, origin, protocols, extensions })
}

/// Does a comma-separated header value contain the given token
/// (ASCII case-insensitive)?
fn contains_token(value: &str, token: &str) -> bool {
    value.split(',').any(|t| t.trim().eq_ignore_ascii_case(token))
}

/// Collect a comma-separated header value into trimmed tokens.
fn list_header(request: &Request, name: &str) -> SmallVec<[String; 4]> {
    request
        .header(name)
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

// Rejection //////////////////////////////////////////////////////////////////////////////////////

/// A failed handshake: the HTTP status and message to answer with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    status: u16,
    message: String
}

impl Rejection {
    /// Create a new rejection with the given HTTP status code.
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Rejection { status, message: message.into() }
    }

    /// The HTTP status code to respond with.
    pub fn status(&self) -> u16 {
        self.status
    }

    /// A prose description of the failure, for the logs.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "handshake rejected ({}): {}", self.status, self.message)
    }
}

impl std::error::Error for Rejection {}

// Response encoding //////////////////////////////////////////////////////////////////////////////

/// Successful handshake response parameters.
#[derive(Debug)]
pub struct Accept<'a> {
    /// The client's `Sec-WebSocket-Key` nonce.
    pub key: &'a str,
    /// The subprotocol the server selected, if any.
    pub protocol: Option<&'a str>,
    /// The extensions the server selected, in selection order.
    pub extensions: &'a [String],
    /// Application-supplied response headers, in insertion order.
    pub headers: &'a [(String, String)]
}

/// Encode the `101 Switching Protocols` handshake response.
///
/// The required headers come first in a fixed order so that the response
/// is deterministic; application headers follow.
pub fn encode_accept(accept: &Accept<'_>, buf: &mut BytesMut) {
    buf.extend_from_slice(b"HTTP/1.1 101 Switching Protocols");
    buf.extend_from_slice(b"\r\nSec-WebSocket-Accept: ");
    buf.extend_from_slice(accept_key(accept.key).as_bytes());
    buf.extend_from_slice(b"\r\nUpgrade: websocket\r\nConnection: Upgrade");
    buf.extend_from_slice(b"\r\nServer: ");
    buf.extend_from_slice(SERVER_AGENT.as_bytes());
    if let Some(p) = accept.protocol {
        buf.extend_from_slice(b"\r\nSec-WebSocket-Protocol: ");
        buf.extend_from_slice(p.as_bytes())
    }
    if let Some((last, prefix)) = accept.extensions.split_last() {
        buf.extend_from_slice(b"\r\nSec-WebSocket-Extensions: ");
        for e in prefix {
            buf.extend_from_slice(e.as_bytes());
            buf.extend_from_slice(b", ")
        }
        buf.extend_from_slice(last.as_bytes())
    }
    for (name, value) in accept.headers {
        buf.extend_from_slice(b"\r\n");
        buf.extend_from_slice(name.as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(value.as_bytes())
    }
    buf.extend_from_slice(b"\r\n\r\n")
}

/// Encode a plain HTTP response head with the given status code.
///
/// Used for handshake rejections and for the HTTP response mode; any
/// body is appended by the caller.
pub fn encode_http(code: u16, headers: &[(String, String)], buf: &mut BytesMut) {
    let status = StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    buf.extend_from_slice(b"HTTP/1.1 ");
    buf.extend_from_slice(status.as_str().as_bytes());
    buf.extend_from_slice(b" ");
    buf.extend_from_slice(status.canonical_reason().unwrap_or("N/A").as_bytes());
    buf.extend_from_slice(b"\r\nServer: ");
    buf.extend_from_slice(SERVER_AGENT.as_bytes());
    for (name, value) in headers {
        buf.extend_from_slice(b"\r\n");
        buf.extend_from_slice(name.as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(value.as_bytes())
    }
    buf.extend_from_slice(b"\r\n\r\n")
}

// Tests //////////////////////////////////////////////////////////////////////////////////////////
