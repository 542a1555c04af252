use crate::base::{Codec, Frame, Mode, OpCode};
use crate::data::Data;
use crate::handshake::{Rejection, SERVER_AGENT};
use crate::session::{Error, Handler, ServerSession, Session};
use crate::server::Server;
use assert_matches::assert_matches;
use bytes::BytesMut;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio_util::codec::{Decoder, Encoder};

const UPGRADE_REQUEST: &str = "GET /chat HTTP/1.1\r\n\
    Host: server.example.com\r\n\
    Upgrade: websocket\r\n\
    Connection: Upgrade\r\n\
    Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
    Origin: http://example.com\r\n\
    Sec-WebSocket-Protocol: chat, superchat\r\n\
    Sec-WebSocket-Version: 13\r\n\r\n";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Event {
    Open,
    Text(String),
    Binary(Vec<u8>),
    Pong(Vec<u8>),
    Close(u16, String),
    Fail
}

type Events = Arc<Mutex<Vec<Event>>>;

fn record(events: &Events, event: Event) {
    events.lock().unwrap().push(event)
}

/// Records every callback, answering nothing.
struct Recorder {
    events: Events
}

impl Recorder {
    fn new() -> (Arc<Recorder>, Events) {
        let events = Events::default();
        (Arc::new(Recorder { events: events.clone() }), events)
    }
}

impl Handler for Recorder {
    fn on_open(&self, _: &mut Session) {
        record(&self.events, Event::Open)
    }

    fn on_message(&self, _: &mut Session, data: Data) {
        let is_text = data.is_text();
        let bytes = data.into_bytes();
        let event = if is_text {
            Event::Text(String::from_utf8(bytes.to_vec()).unwrap())
        } else {
            Event::Binary(bytes.to_vec())
        };
        record(&self.events, event)
    }

    fn on_close(&self, _: &mut Session, code: u16, reason: &str) {
        record(&self.events, Event::Close(code, reason.to_string()))
    }

    fn on_pong(&self, _: &mut Session, payload: &[u8]) {
        record(&self.events, Event::Pong(payload.to_vec()))
    }

    fn on_fail(&self, _: &mut Session, _: &Error) {
        record(&self.events, Event::Fail)
    }
}

/// The client end of a connection, for driving sessions from tests.
struct Client {
    stream: DuplexStream,
    codec: Codec,
    buffer: BytesMut
}

impl Client {
    fn new(stream: DuplexStream) -> Self {
        Client { stream, codec: Codec::new(Mode::Client), buffer: BytesMut::new() }
    }

    async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.unwrap()
    }

    /// Send the standard upgrade request and return the response head.
    async fn upgrade(&mut self) -> String {
        self.send_raw(UPGRADE_REQUEST.as_bytes()).await;
        self.read_response().await
    }

    /// Read an HTTP response head, terminated by CRLFCRLF.
    async fn read_response(&mut self) -> String {
        loop {
            if let Some(end) = self
                .buffer
                .windows(4)
                .position(|w| w == b"\r\n\r\n")
            {
                let head = self.buffer.split_to(end + 4);
                return String::from_utf8(head.to_vec()).unwrap()
            }
            self.buffer.reserve(4096);
            let n = self.stream.read_buf(&mut self.buffer).await.unwrap();
            assert!(n > 0, "eof before end of response")
        }
    }

    /// Send a frame, masked with a fixed key as clients must.
    async fn send_frame(&mut self, fin: bool, opcode: OpCode, payload: &[u8]) {
        let mut frame = Frame::new(opcode);
        frame.set_fin(fin);
        frame.set_mask(0x37fa_213d);
        frame.set_payload(BytesMut::from(payload));
        let mut buf = BytesMut::new();
        Codec::new(Mode::Client).encode(frame, &mut buf).unwrap();
        self.send_raw(&buf).await
    }

    /// Decode the next frame from the server, `None` on EOF.
    async fn read_frame(&mut self) -> Option<Frame> {
        loop {
            if let Some(frame) = self.codec.decode(&mut self.buffer).unwrap() {
                return Some(frame)
            }
            self.buffer.reserve(4096);
            if self.stream.read_buf(&mut self.buffer).await.unwrap() == 0 {
                return None
            }
        }
    }

    async fn read_to_end(&mut self) -> Vec<u8> {
        let mut bytes = self.buffer.split().to_vec();
        self.stream.read_to_end(&mut bytes).await.unwrap();
        bytes
    }
}

fn close_code(frame: &Frame) -> u16 {
    let p = frame.payload();
    u16::from_be_bytes([p[0], p[1]])
}

/// Route the error and access logs to the test output.
fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn session_pair(handler: Option<Arc<dyn Handler>>) -> (Client, ServerSession<DuplexStream>) {
    init_logger();
    let (client, server) = tokio::io::duplex(256 * 1024);
    (Client::new(client), ServerSession::new(server, handler))
}

// Handshake //////////////////////////////////////////////////////////////////////////////////////

#[tokio::test]
async fn accepts_valid_handshake() {
    let (recorder, events) = Recorder::new();
    let (mut client, session) = session_pair(Some(recorder));
    let task = tokio::spawn(session.run());

    let response = client.upgrade().await;
    assert!(response.starts_with("HTTP/1.1 101 Switching Protocols\r\n"), "{}", response);
    assert!(response.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
    assert!(response.contains("Upgrade: websocket\r\n"));
    assert!(response.contains("Connection: Upgrade\r\n"));
    assert!(response.contains(&format!("Server: {}\r\n", SERVER_AGENT)));

    drop(client);
    task.await.unwrap().unwrap();
    assert_eq!(events.lock().unwrap().first(), Some(&Event::Open));
}

#[tokio::test]
async fn rejects_missing_upgrade_header() {
    let (mut client, session) = session_pair(None);
    let task = tokio::spawn(session.run());

    let request = UPGRADE_REQUEST.replace("Upgrade: websocket\r\n", "");
    client.send_raw(request.as_bytes()).await;
    let response = client.read_response().await;
    assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{}", response);

    task.await.unwrap().unwrap()
}

#[tokio::test]
async fn rejects_unsupported_version() {
    let (mut client, session) = session_pair(None);
    let task = tokio::spawn(session.run());

    let request = UPGRADE_REQUEST.replace("Sec-WebSocket-Version: 13", "Sec-WebSocket-Version: 6");
    client.send_raw(request.as_bytes()).await;
    let response = client.read_response().await;
    assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{}", response);

    task.await.unwrap().unwrap()
}

#[tokio::test]
async fn accepts_draft_version_with_draft_origin() {
    let (mut client, session) = session_pair(None);
    let task = tokio::spawn(session.run());

    let request = UPGRADE_REQUEST
        .replace("Sec-WebSocket-Version: 13", "Sec-WebSocket-Version: 8")
        .replace("Origin:", "Sec-WebSocket-Origin:");
    client.send_raw(request.as_bytes()).await;
    let response = client.read_response().await;
    assert!(response.starts_with("HTTP/1.1 101 Switching Protocols\r\n"), "{}", response);

    drop(client);
    task.await.unwrap().unwrap()
}

struct SelectChat;

impl Handler for SelectChat {
    fn validate(&self, session: &mut Session) -> Result<(), Rejection> {
        session.set_header("X-Powered-By", "tests");
        session.select_subprotocol("chat")
    }
}

#[tokio::test]
async fn selects_offered_subprotocol() {
    let (mut client, session) = session_pair(Some(Arc::new(SelectChat)));
    let task = tokio::spawn(session.run());

    let response = client.upgrade().await;
    assert!(response.contains("Sec-WebSocket-Protocol: chat\r\n"), "{}", response);
    assert!(response.contains("X-Powered-By: tests\r\n"));

    drop(client);
    task.await.unwrap().unwrap()
}

struct RejectAll;

impl Handler for RejectAll {
    fn validate(&self, _: &mut Session) -> Result<(), Rejection> {
        Err(Rejection::new(403, "not on the list"))
    }
}

#[tokio::test]
async fn application_can_reject_the_handshake() {
    let (mut client, session) = session_pair(Some(Arc::new(RejectAll)));
    let task = tokio::spawn(session.run());

    client.send_raw(UPGRADE_REQUEST.as_bytes()).await;
    let response = client.read_response().await;
    assert!(response.starts_with("HTTP/1.1 403 Forbidden\r\n"), "{}", response);

    task.await.unwrap().unwrap()
}

#[tokio::test(start_paused = true)]
async fn handshake_times_out() {
    init_logger();
    let (client, server) = tokio::io::duplex(1024);
    let session = ServerSession::new(server, None);
    let result = session.run().await;
    assert_matches!(result, Err(Error::HandshakeTimeout));
    drop(client)
}

#[tokio::test]
async fn eof_during_handshake_fails_the_session() {
    let (mut client, session) = session_pair(None);
    client.send_raw(b"GET / HTTP/1.1\r\n").await;
    drop(client);
    assert_matches!(session.run().await, Err(Error::Closed))
}

// Messages ///////////////////////////////////////////////////////////////////////////////////////

#[tokio::test]
async fn reassembles_fragmented_text() {
    let (recorder, events) = Recorder::new();
    let (mut client, session) = session_pair(Some(recorder));
    let task = tokio::spawn(session.run());
    client.upgrade().await;

    client.send_frame(false, OpCode::Text, b"Hel").await;
    client.send_frame(false, OpCode::Continue, b"lo, ").await;
    client.send_frame(true, OpCode::Continue, b"world").await;
    client.send_frame(true, OpCode::Close, &1000_u16.to_be_bytes()).await;
    assert_eq!(client.read_frame().await.unwrap().opcode(), OpCode::Close);

    task.await.unwrap().unwrap();
    let events = events.lock().unwrap();
    assert_eq!(
        events.as_slice(),
        [Event::Open, Event::Text("Hello, world".into()), Event::Close(1000, String::new())]
    )
}

#[tokio::test]
async fn answers_ping_between_fragments_first() {
    let (recorder, events) = Recorder::new();
    let (mut client, session) = session_pair(Some(recorder));
    let task = tokio::spawn(session.run());
    client.upgrade().await;

    client.send_frame(false, OpCode::Text, b"Hel").await;
    client.send_frame(true, OpCode::Ping, b"ka").await;
    client.send_frame(true, OpCode::Continue, b"lo").await;

    // The pong answer precedes anything else the server writes.
    let pong = client.read_frame().await.unwrap();
    assert_eq!(pong.opcode(), OpCode::Pong);
    assert_eq!(pong.payload(), b"ka");

    drop(client);
    task.await.unwrap().unwrap();
    let events = events.lock().unwrap();
    assert!(events.contains(&Event::Text("Hello".into())), "{:?}", events)
}

#[tokio::test]
async fn delivers_binary_messages() {
    let (recorder, events) = Recorder::new();
    let (mut client, session) = session_pair(Some(recorder));
    let task = tokio::spawn(session.run());
    client.upgrade().await;

    client.send_frame(true, OpCode::Binary, &[0_u8, 159, 146, 150]).await;
    drop(client);
    task.await.unwrap().unwrap();
    assert!(events.lock().unwrap().contains(&Event::Binary(vec![0, 159, 146, 150])))
}

#[tokio::test]
async fn utf8_sequence_may_split_across_fragments() {
    let (recorder, events) = Recorder::new();
    let (mut client, session) = session_pair(Some(recorder));
    let task = tokio::spawn(session.run());
    client.upgrade().await;

    let kappa = "κ".as_bytes();
    client.send_frame(false, OpCode::Text, &kappa[.. 1]).await;
    client.send_frame(true, OpCode::Continue, &kappa[1 ..]).await;
    drop(client);
    task.await.unwrap().unwrap();
    assert!(events.lock().unwrap().contains(&Event::Text("κ".into())))
}

// Faults /////////////////////////////////////////////////////////////////////////////////////////

#[tokio::test]
async fn closes_1007_on_invalid_utf8() {
    let (recorder, events) = Recorder::new();
    let (mut client, session) = session_pair(Some(recorder));
    let task = tokio::spawn(session.run());
    client.upgrade().await;

    client.send_frame(true, OpCode::Text, &[0xFF, 0xFE]).await;
    let close = client.read_frame().await.unwrap();
    assert_eq!(close.opcode(), OpCode::Close);
    assert_eq!(close_code(&close), 1007);

    drop(client);
    task.await.unwrap().unwrap();
    let events = events.lock().unwrap();
    assert!(!events.iter().any(|e| matches!(e, Event::Text(_))));
    assert_matches!(events.iter().find(|e| matches!(e, Event::Close(..))), Some(Event::Close(1007, _)))
}

#[tokio::test]
async fn closes_1007_on_truncated_utf8() {
    let (recorder, _events) = Recorder::new();
    let (mut client, session) = session_pair(Some(recorder));
    let task = tokio::spawn(session.run());
    client.upgrade().await;

    client.send_frame(true, OpCode::Text, &[0xce]).await;
    let close = client.read_frame().await.unwrap();
    assert_eq!(close_code(&close), 1007);

    drop(client);
    task.await.unwrap().unwrap()
}

#[tokio::test]
async fn closes_1009_on_oversize_message() {
    init_logger();
    let (recorder, events) = Recorder::new();
    let server = Server::new(Some(recorder));
    server.set_max_message_size(1024);
    let (client, transport) = tokio::io::duplex(256 * 1024);
    let mut client = Client::new(client);
    let task = tokio::spawn(server.session(transport).run());
    client.upgrade().await;

    client.send_frame(true, OpCode::Binary, &[7_u8; 2000]).await;
    let close = client.read_frame().await.unwrap();
    assert_eq!(close.opcode(), OpCode::Close);
    assert_eq!(close_code(&close), 1009);

    drop(client);
    task.await.unwrap().unwrap();
    let events = events.lock().unwrap();
    assert!(!events.iter().any(|e| matches!(e, Event::Binary(_))));
    assert_matches!(events.iter().find(|e| matches!(e, Event::Close(..))), Some(Event::Close(1009, _)))
}

#[tokio::test]
async fn closes_1009_on_oversize_fragmented_message() {
    init_logger();
    let (recorder, _events) = Recorder::new();
    let server = Server::new(Some(recorder));
    server.set_max_message_size(1024);
    let (client, transport) = tokio::io::duplex(256 * 1024);
    let mut client = Client::new(client);
    let task = tokio::spawn(server.session(transport).run());
    client.upgrade().await;

    client.send_frame(false, OpCode::Binary, &[7_u8; 800]).await;
    client.send_frame(true, OpCode::Continue, &[7_u8; 800]).await;
    let close = client.read_frame().await.unwrap();
    assert_eq!(close_code(&close), 1009);

    drop(client);
    task.await.unwrap().unwrap()
}

#[tokio::test]
async fn closes_1002_on_unmasked_frame() {
    let (mut client, session) = session_pair(None);
    let task = tokio::spawn(session.run());
    client.upgrade().await;

    client.send_raw(&[0x81, 0x05, b'H', b'e', b'l', b'l', b'o']).await;
    let close = client.read_frame().await.unwrap();
    assert_eq!(close_code(&close), 1002);

    drop(client);
    task.await.unwrap().unwrap()
}

#[tokio::test]
async fn closes_1002_on_stray_continuation() {
    let (mut client, session) = session_pair(None);
    let task = tokio::spawn(session.run());
    client.upgrade().await;

    client.send_frame(true, OpCode::Continue, b"stray").await;
    let close = client.read_frame().await.unwrap();
    assert_eq!(close_code(&close), 1002);

    drop(client);
    task.await.unwrap().unwrap()
}

#[tokio::test]
async fn closes_1002_on_new_data_frame_during_fragments() {
    let (mut client, session) = session_pair(None);
    let task = tokio::spawn(session.run());
    client.upgrade().await;

    client.send_frame(false, OpCode::Text, b"Hel").await;
    client.send_frame(true, OpCode::Text, b"again").await;
    let close = client.read_frame().await.unwrap();
    assert_eq!(close_code(&close), 1002);

    drop(client);
    task.await.unwrap().unwrap()
}

// Closing ////////////////////////////////////////////////////////////////////////////////////////

#[tokio::test]
async fn echoes_peer_close_and_reports_it() {
    let (recorder, events) = Recorder::new();
    let (mut client, session) = session_pair(Some(recorder));
    let task = tokio::spawn(session.run());
    client.upgrade().await;

    let mut payload = 1000_u16.to_be_bytes().to_vec();
    payload.extend_from_slice(b"bye");
    client.send_frame(true, OpCode::Close, &payload).await;

    let echo = client.read_frame().await.unwrap();
    assert_eq!(echo.opcode(), OpCode::Close);
    assert_eq!(close_code(&echo), 1000);

    task.await.unwrap().unwrap();
    let events = events.lock().unwrap();
    assert_eq!(events.last(), Some(&Event::Close(1000, "bye".into())))
}

#[tokio::test]
async fn answers_invalid_close_code_with_1002() {
    let (mut client, session) = session_pair(None);
    let task = tokio::spawn(session.run());
    client.upgrade().await;

    client.send_frame(true, OpCode::Close, &2999_u16.to_be_bytes()).await;
    let echo = client.read_frame().await.unwrap();
    assert_eq!(close_code(&echo), 1002);

    task.await.unwrap().unwrap()
}

struct CloseAfterMessage {
    events: Events
}

impl Handler for CloseAfterMessage {
    fn on_message(&self, session: &mut Session, data: Data) {
        record(&self.events, Event::Text(String::from_utf8(data.as_ref().to_vec()).unwrap()));
        session.close(1000, "enough").unwrap()
    }

    fn on_close(&self, _: &mut Session, code: u16, reason: &str) {
        record(&self.events, Event::Close(code, reason.to_string()))
    }
}

#[tokio::test]
async fn local_close_completes_on_peer_echo() {
    let events = Events::default();
    let handler = Arc::new(CloseAfterMessage { events: events.clone() });
    let (mut client, session) = session_pair(Some(handler));
    let task = tokio::spawn(session.run());
    client.upgrade().await;

    client.send_frame(true, OpCode::Text, b"stop").await;
    let close = client.read_frame().await.unwrap();
    assert_eq!(close.opcode(), OpCode::Close);
    assert_eq!(close_code(&close), 1000);
    client.send_frame(true, OpCode::Close, &1000_u16.to_be_bytes()).await;

    task.await.unwrap().unwrap();
    let events = events.lock().unwrap();
    assert_eq!(
        events.as_slice(),
        [Event::Text("stop".into()), Event::Close(1000, "enough".into())]
    )
}

struct SendOnOpen;

impl Handler for SendOnOpen {
    fn on_open(&self, session: &mut Session) {
        session.send_text("one").unwrap();
        session.send_binary(b"two".as_slice()).unwrap();
        session.send_text("three").unwrap()
    }
}

#[tokio::test]
async fn queued_messages_arrive_in_order() {
    let (mut client, session) = session_pair(Some(Arc::new(SendOnOpen)));
    let task = tokio::spawn(session.run());
    client.upgrade().await;

    let first = client.read_frame().await.unwrap();
    assert_eq!((first.opcode(), first.payload()), (OpCode::Text, b"one".as_slice()));
    let second = client.read_frame().await.unwrap();
    assert_eq!((second.opcode(), second.payload()), (OpCode::Binary, b"two".as_slice()));
    let third = client.read_frame().await.unwrap();
    assert_eq!((third.opcode(), third.payload()), (OpCode::Text, b"three".as_slice()));

    drop(client);
    task.await.unwrap().unwrap()
}

#[tokio::test]
async fn transport_loss_reports_on_fail_not_on_close() {
    let (recorder, events) = Recorder::new();
    let (mut client, session) = session_pair(Some(recorder));
    let task = tokio::spawn(session.run());
    client.upgrade().await;

    drop(client);
    task.await.unwrap().unwrap();
    let events = events.lock().unwrap();
    assert_eq!(events.as_slice(), [Event::Open, Event::Fail])
}

// HTTP response mode /////////////////////////////////////////////////////////////////////////////

struct HttpHello;

impl Handler for HttpHello {
    fn on_client_connect(&self, session: &mut Session) {
        let body = session.request().map(|r| r.body().to_vec()).unwrap_or_default();
        session.set_header("Content-Length", body.len().to_string());
        session.start_http(200, &body, true)
    }
}

struct HttpChunks;

impl Handler for HttpChunks {
    fn on_client_connect(&self, session: &mut Session) {
        session.start_http(200, b"part1 ", false);
        session.http_write(b"part2", true)
    }
}

#[tokio::test]
async fn http_mode_streams_body_chunks() {
    let (mut client, session) = session_pair(Some(Arc::new(HttpChunks)));
    let task = tokio::spawn(session.run());

    client.send_raw(b"GET /status HTTP/1.1\r\nHost: h\r\n\r\n").await;
    let bytes = client.read_to_end().await;
    let response = String::from_utf8(bytes).unwrap();
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{}", response);
    assert!(response.ends_with("\r\n\r\npart1 part2"), "{}", response);

    task.await.unwrap().unwrap()
}

struct HttpOpenEnded;

impl Handler for HttpOpenEnded {
    fn on_client_connect(&self, session: &mut Session) {
        session.start_http(200, b"ok", false)
    }
}

#[tokio::test]
async fn http_mode_watches_for_eof() {
    let (mut client, session) = session_pair(Some(Arc::new(HttpOpenEnded)));
    let task = tokio::spawn(session.run());

    client.send_raw(b"GET /status HTTP/1.1\r\nHost: h\r\n\r\n").await;
    let response = client.read_response().await;
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{}", response);

    // The connection stays open until the client goes away.
    drop(client);
    task.await.unwrap().unwrap()
}

#[tokio::test]
async fn http_mode_echoes_the_request_body() {
    let (mut client, session) = session_pair(Some(Arc::new(HttpHello)));
    let task = tokio::spawn(session.run());

    client
        .send_raw(b"GET /status HTTP/1.1\r\nHost: h\r\nContent-Length: 5\r\n\r\nhello")
        .await;
    let bytes = client.read_to_end().await;
    let response = String::from_utf8(bytes).unwrap();
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{}", response);
    assert!(response.contains("Content-Length: 5\r\n"));
    assert!(response.ends_with("\r\n\r\nhello"), "{}", response);

    task.await.unwrap().unwrap()
}
