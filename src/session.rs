// Copyright (c) 2026 wspp developers
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

//! The per-connection session: the handshake phase, the framed message
//! transport and the closing handshake, with application callbacks.
//!
//! A session is split into the [`Session`] value holding all protocol
//! state, which the application sees inside [`Handler`] callbacks, and
//! the [`ServerSession`] driver owning the socket, which multiplexes
//! reads, writes and the handshake deadline on its task.

use crate::base::{self, Codec, Frame, Mode, OpCode, MAX_HEADER_SIZE};
use crate::data::Data;
use crate::handshake::{self, Accept, Rejection, Request, Upgrade};
use crate::logging::{
    Logging, ALOG_CONNECT, ALOG_DISCONNECT, ALOG_FRAME, ALOG_HANDSHAKE, ALOG_MESSAGE,
    ALOG_MISC_CONTROL, LOG_ERROR, LOG_WARN
};
use crate::utf8;
use bytes::BytesMut;
use smallvec::SmallVec;
use static_assertions::const_assert;
use std::{collections::VecDeque, io, str, sync::Arc, time::Duration};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tokio_util::codec::{Decoder, Encoder};

/// Allocation block size.
const BLOCK_SIZE: usize = 8 * 1024;
/// Upper bound on the size of the handshake header section.
const MAX_HANDSHAKE_SIZE: usize = 16 * 1024;
/// Deadline for the handshake phase, from the start of the header read
/// to the response write.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
/// Default accumulated maximum size of a complete message.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

const_assert!(MAX_HEADER_SIZE < BLOCK_SIZE);

// States /////////////////////////////////////////////////////////////////////////////////////////

/// Connection lifecycle states.
///
/// Transitions are monotone: Connecting → Open → Closing → Closed,
/// and Closed is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// The opening handshake has not completed yet.
    Connecting,
    /// Messages flow in both directions.
    Open,
    /// A close frame has been sent or received.
    Closing,
    /// The connection is finished.
    Closed
}

/// Why the session entered the closing state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Closing {
    /// We are echoing a close frame the peer sent.
    Echo,
    /// We initiated the close because of a protocol or policy fault.
    Fault,
    /// The application asked to close.
    Local
}

// Close codes ////////////////////////////////////////////////////////////////////////////////////

/// Close status codes used by the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCode {
    /// 1000, normal closure.
    Normal,
    /// 1002, protocol error.
    ProtocolError,
    /// 1003, unacceptable data.
    CannotAccept,
    /// 1007, invalid UTF-8 in a text message.
    InvalidUtf8,
    /// 1008, policy violation.
    PolicyViolation,
    /// 1009, message too big.
    MessageTooBig,
    /// 1011, unexpected condition.
    UnexpectedFailure
}

impl From<CloseCode> for u16 {
    fn from(code: CloseCode) -> u16 {
        match code {
            CloseCode::Normal => 1000,
            CloseCode::ProtocolError => 1002,
            CloseCode::CannotAccept => 1003,
            CloseCode::InvalidUtf8 => 1007,
            CloseCode::PolicyViolation => 1008,
            CloseCode::MessageTooBig => 1009,
            CloseCode::UnexpectedFailure => 1011
        }
    }
}

/// Close codes acceptable in a peer's close frame. Anything else is
/// answered with a protocol error code.
fn is_valid_close_code(code: u16) -> bool {
    matches!(code, 1000 ..= 1003 | 1007 ..= 1011 | 1015 | 3000 ..= 4999)
}

// Handler ////////////////////////////////////////////////////////////////////////////////////////

/// The application callback surface.
///
/// One handler instance may serve every session of a server, so the
/// methods take `&self`; per-application state needs interior
/// mutability. All callbacks run on the session's task, in wire order:
/// `on_open` precedes any `on_message`, `on_close` follows all of them
/// and nothing is delivered afterwards.
pub trait Handler: Send + Sync {
    /// A new connection has delivered its HTTP request.
    ///
    /// The default proceeds with the websocket upgrade once this
    /// returns. Implementations may instead claim the connection for a
    /// plain HTTP exchange with [`Session::start_http`].
    fn on_client_connect(&self, _session: &mut Session) {}

    /// Upgrade validation hook, called after the intrinsic header checks.
    ///
    /// May add response headers, select a subprotocol or extensions, or
    /// reject the handshake by returning a [`Rejection`].
    fn validate(&self, _session: &mut Session) -> Result<(), Rejection> {
        Ok(())
    }

    /// The connection is open; messages may be sent from here on.
    fn on_open(&self, _session: &mut Session) {}

    /// A complete (possibly reassembled) data message arrived.
    fn on_message(&self, _session: &mut Session, _data: Data) {}

    /// The connection is closing; no further callbacks will follow.
    fn on_close(&self, _session: &mut Session, _code: u16, _reason: &str) {}

    /// A pong frame arrived.
    fn on_pong(&self, _session: &mut Session, _payload: &[u8]) {}

    /// The transport failed; the session is gone without a close
    /// handshake. The default writes to the error log.
    fn on_fail(&self, session: &mut Session, error: &Error) {
        session.log(&format!("session failed: {}", error), LOG_ERROR)
    }
}

// Session ////////////////////////////////////////////////////////////////////////////////////////

/// All per-connection protocol state.
///
/// This is the value handed to [`Handler`] callbacks. Everything here is
/// synchronous; writes are queued and flushed by the driver after the
/// current event completes, in FIFO order with at most one transport
/// write in flight. Nothing queued after a close frame is sent.
#[derive(Debug)]
pub struct Session {
    state: State,
    mode: Mode,
    codec: Codec,
    request: Option<Request>,
    upgrade: Option<Upgrade>,
    subprotocol: Option<String>,
    extensions: SmallVec<[String; 4]>,
    server_headers: Vec<(String, String)>,
    // Inbound message assembly.
    message: BytesMut,
    message_opcode: Option<OpCode>,
    validator: utf8::Validator,
    // Outbound write queue.
    outbox: VecDeque<BytesMut>,
    close_queued: bool,
    closing: Option<Closing>,
    close_report: Option<(u16, String)>,
    close_delivered: bool,
    // Plain HTTP response mode.
    http_started: bool,
    http_done: bool,
    // Shared configuration.
    max_message_size: usize,
    logging: Arc<Logging>,
    handler: Option<Arc<dyn Handler>>
}

impl std::fmt::Debug for dyn Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str("Handler")
    }
}

impl Session {
    fn new(handler: Option<Arc<dyn Handler>>, max_message_size: usize, logging: Arc<Logging>) -> Self {
        let mut codec = Codec::new(Mode::Server);
        codec.set_max_data_size(max_message_size as u64);
        Session {
            state: State::Connecting,
            mode: Mode::Server,
            codec,
            request: None,
            upgrade: None,
            subprotocol: None,
            extensions: SmallVec::new(),
            server_headers: Vec::new(),
            message: BytesMut::new(),
            message_opcode: None,
            validator: utf8::Validator::new(),
            outbox: VecDeque::new(),
            close_queued: false,
            closing: None,
            close_report: None,
            close_delivered: false,
            http_started: false,
            http_done: false,
            max_message_size,
            logging,
            handler
        }
    }

    /// The current lifecycle state.
    pub fn state(&self) -> State {
        self.state
    }

    /// The session's end of the connection. Always [`Mode::Server`].
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// The client's opening request (available from `on_client_connect` on).
    pub fn request(&self) -> Option<&Request> {
        self.request.as_ref()
    }

    /// The resource the client requested.
    pub fn resource(&self) -> Option<&str> {
        self.request.as_ref().map(|r| r.resource())
    }

    /// The negotiated websocket protocol version (7, 8 or 13).
    pub fn version(&self) -> Option<u8> {
        self.upgrade.as_ref().map(|u| u.version)
    }

    /// The client origin, if it sent one.
    pub fn origin(&self) -> Option<&str> {
        self.upgrade.as_ref().and_then(|u| u.origin.as_deref())
    }

    /// Subprotocols the client proposed.
    pub fn offered_protocols(&self) -> &[String] {
        self.upgrade.as_ref().map(|u| u.protocols.as_slice()).unwrap_or(&[])
    }

    /// Extensions the client proposed.
    pub fn offered_extensions(&self) -> &[String] {
        self.upgrade.as_ref().map(|u| u.extensions.as_slice()).unwrap_or(&[])
    }

    /// The subprotocol selected for this connection, if any.
    pub fn subprotocol(&self) -> Option<&str> {
        self.subprotocol.as_deref()
    }

    /// The extensions selected for this connection, in selection order.
    pub fn extensions(&self) -> &[String] {
        &self.extensions
    }

    /// Add a header to the outgoing handshake (or HTTP) response.
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.server_headers.push((name.into(), value.into()))
    }

    /// Select the subprotocol for this connection.
    ///
    /// The name must be one the client proposed, or empty to select none.
    pub fn select_subprotocol(&mut self, name: &str) -> Result<(), Rejection> {
        if name.is_empty() {
            self.subprotocol = None;
            return Ok(())
        }
        if !self.offered_protocols().iter().any(|p| p == name) {
            return Err(Rejection::new(
                400,
                format!("subprotocol {} was not proposed by the client", name)
            ))
        }
        self.subprotocol = Some(name.to_string());
        Ok(())
    }

    /// Select an extension from the list the client offered.
    ///
    /// Extensions are recorded in the order they are selected here.
    pub fn select_extension(&mut self, name: &str) -> Result<(), Rejection> {
        if name.is_empty() {
            return Ok(())
        }
        if !self.offered_extensions().iter().any(|e| e == name) {
            return Err(Rejection::new(
                400,
                format!("extension {} was not proposed by the client", name)
            ))
        }
        self.extensions.push(name.to_string());
        Ok(())
    }

    /// Queue a text message.
    pub fn send_text(&mut self, data: impl AsRef<str>) -> Result<(), Error> {
        let mut frame = Frame::new(OpCode::Text);
        frame.set_payload(BytesMut::from(data.as_ref()));
        self.send_frame(frame)
    }

    /// Queue a binary message.
    pub fn send_binary(&mut self, data: impl AsRef<[u8]>) -> Result<(), Error> {
        let mut frame = Frame::new(OpCode::Binary);
        frame.set_payload(BytesMut::from(data.as_ref()));
        self.send_frame(frame)
    }

    /// Queue a ping with up to 125 bytes of payload.
    pub fn send_ping(&mut self, payload: &[u8]) -> Result<(), Error> {
        let mut frame = Frame::new(OpCode::Ping);
        frame.set_payload(BytesMut::from(payload));
        self.send_frame(frame)
    }

    /// Queue an unsolicited pong with up to 125 bytes of payload.
    pub fn send_pong(&mut self, payload: &[u8]) -> Result<(), Error> {
        let mut frame = Frame::new(OpCode::Pong);
        frame.set_payload(BytesMut::from(payload));
        self.send_frame(frame)
    }

    /// Start the closing handshake with the given code and reason.
    pub fn close(&mut self, code: u16, reason: &str) -> Result<(), Error> {
        if self.state != State::Open || self.http_started {
            return Err(Error::Closed)
        }
        self.queue_close(code, reason);
        self.closing = Some(Closing::Local);
        self.close_report = Some((code, reason.to_string()));
        self.state = State::Closing;
        Ok(())
    }

    /// Respond with a plain HTTP response instead of upgrading.
    ///
    /// Only meaningful from within `on_client_connect`. With `done` the
    /// connection is shut down once the response is flushed; otherwise
    /// it stays open for further [`Session::http_write`] calls and reads
    /// are issued only to detect EOF.
    pub fn start_http(&mut self, code: u16, body: &[u8], done: bool) {
        if self.state != State::Connecting || self.http_started {
            return
        }
        let mut buf = BytesMut::new();
        handshake::encode_http(code, &self.server_headers, &mut buf);
        buf.extend_from_slice(body);
        self.outbox.push_back(buf);
        self.http_started = true;
        self.http_done = done;
        if !done {
            self.state = State::Open
        }
    }

    /// Queue another chunk of the HTTP response body.
    pub fn http_write(&mut self, body: &[u8], done: bool) {
        if !self.http_started || self.http_done {
            return
        }
        self.outbox.push_back(BytesMut::from(body));
        self.http_done = done
    }

    /// Write a message to the server's error log.
    pub fn log(&self, msg: &str, level: u16) {
        self.logging.log(msg, level)
    }

    /// Write a message to the server's access log.
    pub fn access_log(&self, msg: &str, category: u16) {
        self.logging.access_log(msg, category)
    }

    fn send_frame(&mut self, frame: Frame) -> Result<(), Error> {
        if self.state != State::Open || self.http_started || self.close_queued {
            return Err(Error::Closed)
        }
        self.encode_into_outbox(frame)
    }

    fn encode_into_outbox(&mut self, frame: Frame) -> Result<(), Error> {
        let mut buf = BytesMut::new();
        self.codec.encode(frame, &mut buf)?;
        self.outbox.push_back(buf);
        Ok(())
    }

    /// Queue a close frame. The reason is truncated so that code and
    /// reason fit a control frame payload. Nothing queues after it.
    fn queue_close(&mut self, code: u16, reason: &str) {
        if self.close_queued {
            return
        }
        let mut cut = reason.len().min(123);
        while !reason.is_char_boundary(cut) {
            cut -= 1
        }
        let mut payload = BytesMut::with_capacity(2 + cut);
        payload.extend_from_slice(&code.to_be_bytes());
        payload.extend_from_slice(&reason.as_bytes()[.. cut]);
        let mut frame = Frame::new(OpCode::Close);
        frame.set_payload(payload);
        if self.encode_into_outbox(frame).is_ok() {
            self.close_queued = true
        }
    }

    /// Reset the inbound message assembly between messages.
    fn reset_message(&mut self) {
        self.message_opcode = None;
        self.validator.reset()
    }
}

// Driver /////////////////////////////////////////////////////////////////////////////////////////

/// What the handshake phase resulted in.
enum Established {
    /// The upgrade succeeded; run the frame loop.
    WebSocket,
    /// The application serves a plain HTTP response; watch for EOF.
    Http,
    /// The connection is finished (rejection or one-shot HTTP response).
    Done
}

/// A server session bound to a transport.
///
/// Owns the socket and drives the [`Session`] through its lifecycle on
/// the calling task. Dropped (and thereby released) when `run` returns,
/// which happens only once the session is closed.
#[derive(Debug)]
pub struct ServerSession<T> {
    socket: T,
    buffer: BytesMut,
    session: Session
}

impl<T: AsyncRead + AsyncWrite + Unpin> ServerSession<T> {
    /// Create a session with default configuration.
    ///
    /// Sessions minted by a [`Server`](crate::Server) share its
    /// configuration instead.
    pub fn new(socket: T, handler: Option<Arc<dyn Handler>>) -> Self {
        ServerSession::with_config(socket, handler, DEFAULT_MAX_MESSAGE_SIZE, Arc::new(Logging::new()))
    }

    pub(crate) fn with_config(
        socket: T,
        handler: Option<Arc<dyn Handler>>,
        max_message_size: usize,
        logging: Arc<Logging>
    ) -> Self {
        ServerSession {
            socket,
            buffer: BytesMut::new(),
            session: Session::new(handler, max_message_size, logging)
        }
    }

    /// Read access to the protocol state.
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Drive the session to completion.
    ///
    /// Consumes the session; it is released when this returns, which is
    /// always after the closed state has been reached.
    pub async fn run(mut self) -> Result<(), Error> {
        self.session.access_log("client connect", ALOG_CONNECT);
        let established = match timeout(HANDSHAKE_TIMEOUT, self.establish()).await {
            Err(_) => {
                self.session.log("handshake timed out", LOG_ERROR);
                self.session.state = State::Closed;
                let _ = self.socket.shutdown().await;
                return Err(Error::HandshakeTimeout)
            }
            Ok(Err(e)) => {
                self.session.state = State::Closed;
                self.fail_transport(&e);
                let _ = self.socket.shutdown().await;
                return Err(e)
            }
            Ok(Ok(established)) => established
        };
        let result = match established {
            Established::WebSocket => self.websocket_loop().await,
            Established::Http => self.http_eof_loop().await,
            Established::Done => Ok(())
        };
        self.session.access_log("client disconnect", ALOG_DISCONNECT);
        result
    }

    /// The handshake phase: read and answer the client's HTTP request.
    async fn establish(&mut self) -> Result<Established, Error> {
        let mut request = loop {
            match handshake::decode(&mut self.buffer) {
                Ok(Some(request)) => break request,
                Ok(None) => {
                    if self.buffer.len() > MAX_HANDSHAKE_SIZE {
                        let rejection = Rejection::new(431, "handshake header section too large");
                        return self.reject(rejection).await
                    }
                    self.buffer.reserve(BLOCK_SIZE);
                    if self.socket.read_buf(&mut self.buffer).await? == 0 {
                        return Err(Error::Closed)
                    }
                }
                Err(rejection) => return self.reject(rejection).await
            }
        };
        if self.session.logging.test_alog_level(ALOG_HANDSHAKE) {
            let line = format!("{} {} HTTP/1.{}", request.method(), request.resource(), request.http_version());
            self.session.access_log(&line, ALOG_HANDSHAKE)
        }

        // Read the request body if one was declared. The header read may
        // already have buffered part (or all) of it.
        if let Some(length) = request.content_length() {
            if length > self.session.max_message_size {
                let rejection = Rejection::new(413, "request body exceeds the maximum message size");
                return self.reject(rejection).await
            }
            while self.buffer.len() < length {
                self.buffer.reserve(std::cmp::max(BLOCK_SIZE, length - self.buffer.len()));
                if self.socket.read_buf(&mut self.buffer).await? == 0 {
                    return Err(Error::Closed)
                }
            }
            request.set_body(self.buffer.split_to(length));
        }

        self.session.request = Some(request);

        // The application sees the request first: it may claim the
        // connection for a plain HTTP exchange instead of upgrading.
        if let Some(h) = self.session.handler.clone() {
            h.on_client_connect(&mut self.session)
        }
        if self.session.http_started {
            self.flush().await?;
            if self.session.http_done {
                self.session.state = State::Closed;
                let _ = self.socket.shutdown().await;
                return Ok(Established::Done)
            }
            return Ok(Established::Http)
        }

        self.start_websocket().await
    }

    /// Validate the upgrade request and answer it.
    async fn start_websocket(&mut self) -> Result<Established, Error> {
        let Some(request) = self.session.request.as_ref() else {
            return Err(Error::Closed)
        };
        let upgrade = match handshake::validate(request) {
            Ok(upgrade) => upgrade,
            Err(rejection) => return self.reject(rejection).await
        };
        let key = upgrade.key.clone();
        self.session.upgrade = Some(upgrade);

        if let Some(h) = self.session.handler.clone() {
            if let Err(rejection) = h.validate(&mut self.session) {
                return self.reject(rejection).await
            }
        }

        let mut buf = BytesMut::new();
        let accept = Accept {
            key: &key,
            protocol: self.session.subprotocol.as_deref(),
            extensions: &self.session.extensions,
            headers: &self.session.server_headers
        };
        handshake::encode_accept(&accept, &mut buf);
        self.socket.write_all(&buf).await?;
        self.socket.flush().await?;

        self.session.state = State::Open;
        if self.session.logging.test_alog_level(ALOG_HANDSHAKE) {
            let line = format!(
                "connection upgraded (version {})",
                self.session.version().unwrap_or_default()
            );
            self.session.access_log(&line, ALOG_HANDSHAKE)
        }
        Ok(Established::WebSocket)
    }

    /// Answer a failed handshake with an HTTP error response.
    async fn reject(&mut self, rejection: Rejection) -> Result<Established, Error> {
        self.session.access_log(rejection.message(), ALOG_HANDSHAKE);
        self.session.log(&rejection.to_string(), LOG_ERROR);
        let mut buf = BytesMut::new();
        handshake::encode_http(rejection.status(), &self.session.server_headers, &mut buf);
        self.socket.write_all(&buf).await?;
        self.socket.flush().await?;
        let _ = self.socket.shutdown().await;
        self.session.state = State::Closed;
        Ok(Established::Done)
    }

    /// The post-upgrade frame loop. The handshake deadline no longer
    /// applies; `on_open` is the first thing that runs here.
    async fn websocket_loop(&mut self) -> Result<(), Error> {
        if let Some(h) = self.session.handler.clone() {
            h.on_open(&mut self.session)
        }
        loop {
            if let Err(e) = self.flush().await {
                self.session.state = State::Closed;
                self.fail_transport(&e);
                return Err(e)
            }
            if self.session.state == State::Closed {
                break
            }
            match self.read_frame().await {
                Ok(Some(frame)) => self.handle_frame(frame),
                Ok(None) => {
                    if self.session.state == State::Closing {
                        // EOF completes the closing handshake.
                        self.session.state = State::Closed;
                        self.deliver_close_pending()
                    } else {
                        self.session.log("connection dropped without close handshake", LOG_WARN);
                        self.session.state = State::Closed;
                        self.fail_transport(&Error::Closed)
                    }
                }
                Err(Error::Codec(base::Error::Io(e))) => {
                    self.session.state = State::Closed;
                    let error = Error::Io(e);
                    self.fail_transport(&error);
                    return Err(error)
                }
                Err(Error::Codec(e)) => self.codec_fault(e),
                Err(e) => {
                    self.session.state = State::Closed;
                    self.fail_transport(&e);
                    return Err(e)
                }
            }
        }
        let _ = self.socket.shutdown().await;
        Ok(())
    }

    /// Watch for EOF while the application's HTTP response stands.
    async fn http_eof_loop(&mut self) -> Result<(), Error> {
        loop {
            self.buffer.clear();
            self.buffer.reserve(BLOCK_SIZE);
            let n = self.socket.read_buf(&mut self.buffer).await?;
            if n == 0 {
                break
            }
            // The peer is not supposed to send anything else.
            self.session.log("unexpected data while serving an http response", LOG_WARN);
            break
        }
        self.session.state = State::Closed;
        let _ = self.socket.shutdown().await;
        Ok(())
    }

    /// Decode the next frame, reading more input as needed.
    /// `Ok(None)` means the peer closed its end of the transport.
    async fn read_frame(&mut self) -> Result<Option<Frame>, Error> {
        loop {
            match self.session.codec.decode(&mut self.buffer) {
                Ok(Some(frame)) => return Ok(Some(frame)),
                Ok(None) => {
                    self.buffer.reserve(BLOCK_SIZE);
                    if self.socket.read_buf(&mut self.buffer).await? == 0 {
                        return Ok(None)
                    }
                }
                Err(e) => return Err(Error::Codec(e))
            }
        }
    }

    fn handle_frame(&mut self, frame: Frame) {
        match self.session.state {
            State::Closing => {
                // Only the close echo matters now; data and other control
                // frames are dropped.
                if frame.opcode() == OpCode::Close {
                    self.session.state = State::Closed;
                    self.deliver_close_pending()
                }
            }
            State::Open => match frame.opcode() {
                OpCode::Ping => {
                    self.session.access_log("ping", ALOG_MISC_CONTROL);
                    let mut pong = Frame::new(OpCode::Pong);
                    pong.set_payload(frame.into_payload());
                    let _ = self.session.encode_into_outbox(pong);
                }
                OpCode::Pong => {
                    self.session.access_log("pong", ALOG_MISC_CONTROL);
                    if let Some(h) = self.session.handler.clone() {
                        h.on_pong(&mut self.session, frame.payload())
                    }
                }
                OpCode::Close => self.handle_close(frame),
                OpCode::Text | OpCode::Binary | OpCode::Continue => self.handle_data(frame)
            },
            // Frames never reach the session in other states.
            State::Connecting | State::Closed => {}
        }
    }

    fn handle_close(&mut self, frame: Frame) {
        self.session.access_log("close frame received", ALOG_MISC_CONTROL);
        let payload = frame.into_payload();

        if payload.len() == 1 {
            return self.fault(CloseCode::ProtocolError, "close frame with 1-byte payload")
        }

        let (code, reason) = if payload.len() < 2 {
            (None, String::new())
        } else {
            let code = u16::from_be_bytes([payload[0], payload[1]]);
            match str::from_utf8(&payload[2 ..]) {
                Ok(reason) => (Some(code), reason.to_string()),
                Err(_) => return self.fault(CloseCode::InvalidUtf8, "invalid utf-8 in close reason")
            }
        };

        // Echo the close. An acceptable code is returned as is, anything
        // else is answered with 1002; the reason is not echoed.
        match code {
            None => self.session.queue_close(u16::from(CloseCode::Normal), ""),
            Some(c) if is_valid_close_code(c) => self.session.queue_close(c, ""),
            Some(_) => self.session.queue_close(u16::from(CloseCode::ProtocolError), "")
        }
        self.session.closing = Some(Closing::Echo);
        self.session.state = State::Closing;
        self.deliver_close(code.unwrap_or(1000), &reason)
    }

    fn handle_data(&mut self, frame: Frame) {
        if self.session.logging.test_alog_level(ALOG_FRAME) {
            let line = format!(
                "frame: {} fin={} len={}",
                frame.opcode(),
                frame.is_fin(),
                frame.payload_len()
            );
            self.session.access_log(&line, ALOG_FRAME)
        }

        let fin = frame.is_fin();
        match (frame.opcode(), self.session.message_opcode) {
            (OpCode::Continue, None) => {
                return self.fault(CloseCode::ProtocolError, "continuation frame outside a fragmented message")
            }
            (OpCode::Continue, Some(_)) => {}
            (_, Some(_)) => {
                return self.fault(CloseCode::ProtocolError, "new data frame while a fragmented message is in progress")
            }
            (opcode, None) => {
                self.session.message_opcode = Some(opcode);
                self.session.validator.reset()
            }
        }

        let payload = frame.into_payload();
        if self.session.message.len() + payload.len() > self.session.max_message_size {
            return self.fault(CloseCode::MessageTooBig, "accumulated message length exceeds maximum")
        }
        let is_text = self.session.message_opcode == Some(OpCode::Text);
        if is_text && self.session.validator.update(&payload).is_err() {
            return self.fault(CloseCode::InvalidUtf8, "invalid utf-8 in text message")
        }
        self.session.message.unsplit(payload);

        if fin {
            if is_text && self.session.validator.status() != utf8::Status::Accept {
                return self.fault(CloseCode::InvalidUtf8, "truncated utf-8 sequence in text message")
            }
            let payload = self.session.message.split();
            let data = if is_text { Data::Text(payload) } else { Data::Binary(payload) };
            if self.session.logging.test_alog_level(ALOG_MESSAGE) {
                let kind = if data.is_text() { "text" } else { "binary" };
                let line = format!("message: {} len={}", kind, data.as_ref().len());
                self.session.access_log(&line, ALOG_MESSAGE)
            }
            self.session.reset_message();
            if let Some(h) = self.session.handler.clone() {
                h.on_message(&mut self.session, data)
            }
        }
    }

    /// Map a codec error onto the close code it is answered with.
    fn codec_fault(&mut self, error: base::Error) {
        match error {
            base::Error::PayloadTooLarge { .. } => {
                self.fault(CloseCode::MessageTooBig, "frame payload exceeds maximum")
            }
            e => self.fault(CloseCode::ProtocolError, &e.to_string())
        }
    }

    /// A protocol or policy fault: close the connection with `code`.
    fn fault(&mut self, code: CloseCode, msg: &str) {
        self.session.log(msg, LOG_ERROR);
        let num = u16::from(code);
        match self.session.state {
            State::Open | State::Closing => {
                self.session.queue_close(num, msg);
                self.session.closing = Some(Closing::Fault);
                self.session.state = State::Closing
            }
            _ => self.session.state = State::Closed
        }
        self.deliver_close(num, msg)
    }

    /// Report a transport failure to the application or the logs.
    fn fail_transport(&mut self, error: &Error) {
        if let Some(h) = self.session.handler.clone() {
            h.on_fail(&mut self.session, error)
        } else {
            self.session.log(&format!("session failed: {}", error), LOG_ERROR)
        }
    }

    /// Fire `on_close` exactly once.
    fn deliver_close(&mut self, code: u16, reason: &str) {
        if self.session.close_delivered {
            return
        }
        self.session.close_delivered = true;
        if let Some(h) = self.session.handler.clone() {
            h.on_close(&mut self.session, code, reason)
        }
    }

    /// Fire `on_close` for a locally initiated close that just completed.
    fn deliver_close_pending(&mut self) {
        match self.session.close_report.take() {
            Some((code, reason)) => self.deliver_close(code, &reason),
            None => self.deliver_close(u16::from(CloseCode::Normal), "")
        }
    }

    /// Drain the write queue in FIFO order. The transport sees at most
    /// one write at a time; a flushed close frame completes the close
    /// initiated by an echo or a fault.
    async fn flush(&mut self) -> Result<(), Error> {
        while let Some(chunk) = self.session.outbox.pop_front() {
            self.socket.write_all(&chunk).await?;
        }
        self.socket.flush().await?;
        if self.session.close_queued
            && matches!(self.session.closing, Some(Closing::Echo) | Some(Closing::Fault))
        {
            self.session.state = State::Closed
        }
        Ok(())
    }
}

// Session error type /////////////////////////////////////////////////////////////////////////////

/// Errors which may occur while a session runs.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An I/O error was encountered.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// The frame codec errored.
    #[error("codec error: {0}")]
    Codec(#[from] base::Error),

    /// The opening handshake did not complete within the deadline.
    #[error("handshake timed out")]
    HandshakeTimeout,

    /// The connection is closed (or closing) and cannot carry more data.
    #[error("connection closed")]
    Closed
}
