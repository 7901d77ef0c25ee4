//! Transport layer abstraction.
//!
//! The engine talks to the network through two traits: one for the single
//! control connection and one for data-channel requests. Production
//! implementations live in [`crate::http`]; the mocks here let tests play
//! the server side without sockets.

use crate::error::{EngineError, EngineResult};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Request to open the control channel.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlRequest {
    /// Full WebSocket URL.
    pub url: String,
    /// Headers for the upgrade request.
    pub headers: Vec<(String, String)>,
}

/// An open control connection.
///
/// Dropping `outbound` closes the socket. `inbound` yields text frames and
/// returns `None` once the socket has closed for any reason.
#[derive(Debug)]
pub struct ControlConnection {
    /// Frames to send to the server.
    pub outbound: mpsc::UnboundedSender<String>,
    /// Frames received from the server.
    pub inbound: mpsc::UnboundedReceiver<String>,
}

/// Opens control connections.
#[async_trait]
pub trait ControlTransport: Send + Sync + 'static {
    /// Performs the WebSocket handshake.
    ///
    /// A rejected handshake is reported as [`EngineError::Http`].
    async fn open(&self, request: ControlRequest) -> EngineResult<ControlConnection>;
}

/// Request to open one data channel.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamRequest {
    /// Server base URL.
    pub base_url: String,
    /// Endpoint path.
    pub path: String,
    /// Query-string parameters, in order.
    pub query: Vec<(String, String)>,
    /// Request headers, including `Accept`.
    pub headers: Vec<(String, String)>,
}

impl StreamRequest {
    /// Returns a query parameter value.
    pub fn query_param(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Returns a header value, matching the name case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Response to a data-channel request.
pub struct StreamResponse {
    /// Status code.
    pub status: u16,
    /// Value of the `Content-Length` header, if any.
    pub content_length: Option<u64>,
    /// Response body chunks.
    pub body: BoxStream<'static, EngineResult<Bytes>>,
}

impl std::fmt::Debug for StreamResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamResponse")
            .field("status", &self.status)
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

impl StreamResponse {
    /// Returns true for 2xx statuses.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Collects the whole body, up to `limit` bytes.
    pub async fn collect_body(self, limit: usize) -> EngineResult<Vec<u8>> {
        let mut body = self.body;
        let mut out = Vec::new();
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            let room = limit.saturating_sub(out.len());
            out.extend_from_slice(&chunk[..chunk.len().min(room)]);
            if out.len() >= limit {
                break;
            }
        }
        Ok(out)
    }
}

/// Opens data-channel requests.
#[async_trait]
pub trait StreamTransport: Send + Sync + 'static {
    /// Sends the request and returns once headers are available.
    async fn open(&self, request: StreamRequest) -> EngineResult<StreamResponse>;
}

// ── Mock control transport ─────────────────────────────────────────────────

/// The server side of a mock control connection.
#[derive(Debug)]
pub struct MockControlPeer {
    /// The request that opened this connection.
    pub request: ControlRequest,
    /// Frames sent by the engine.
    pub sent: mpsc::UnboundedReceiver<String>,
    /// Push frames to the engine. Drop to close the connection.
    pub inbound: mpsc::UnboundedSender<String>,
}

impl MockControlPeer {
    /// Sends a raw frame to the engine.
    pub fn push(&self, frame: impl Into<String>) -> bool {
        self.inbound.send(frame.into()).is_ok()
    }

    /// Sends a registration frame carrying `client`.
    pub fn register(&self, client: &str) -> bool {
        self.push(format!(
            r#"{{"type":"register","msg":{{"client":"{client}"}}}}"#
        ))
    }

    /// Drains every frame the engine has sent so far.
    pub fn drain_sent(&mut self) -> Vec<String> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.sent.try_recv() {
            frames.push(frame);
        }
        frames
    }
}

/// A mock control transport for testing.
///
/// Every successful `open` hands a [`MockControlPeer`] to the test through
/// [`MockControlTransport::next_peer`].
#[derive(Debug)]
pub struct MockControlTransport {
    failures: Mutex<VecDeque<EngineError>>,
    requests: Mutex<Vec<ControlRequest>>,
    peers_tx: mpsc::UnboundedSender<MockControlPeer>,
    peers_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<MockControlPeer>>,
}

impl MockControlTransport {
    /// Creates a new mock transport.
    pub fn new() -> Self {
        let (peers_tx, peers_rx) = mpsc::unbounded_channel();
        Self {
            failures: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            peers_tx,
            peers_rx: tokio::sync::Mutex::new(peers_rx),
        }
    }

    /// Makes the next `open` fail with `error`.
    pub fn fail_next(&self, error: EngineError) {
        self.failures.lock().push_back(error);
    }

    /// Number of `open` calls so far, including failed ones.
    pub fn open_count(&self) -> usize {
        self.requests.lock().len()
    }

    /// Every request seen so far.
    pub fn requests(&self) -> Vec<ControlRequest> {
        self.requests.lock().clone()
    }

    /// Waits for the next successfully opened connection.
    pub async fn next_peer(&self) -> Option<MockControlPeer> {
        self.peers_rx.lock().await.recv().await
    }
}

impl Default for MockControlTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ControlTransport for MockControlTransport {
    async fn open(&self, request: ControlRequest) -> EngineResult<ControlConnection> {
        self.requests.lock().push(request.clone());
        if let Some(error) = self.failures.lock().pop_front() {
            return Err(error);
        }

        let (outbound, sent) = mpsc::unbounded_channel();
        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        let peer = MockControlPeer {
            request,
            sent,
            inbound: inbound_tx,
        };
        self.peers_tx
            .send(peer)
            .map_err(|_| EngineError::transport_fatal("mock peer receiver dropped"))?;
        Ok(ControlConnection { outbound, inbound })
    }
}

// ── Mock stream transport ──────────────────────────────────────────────────

/// A scripted response for [`MockStreamTransport`].
#[derive(Debug, Clone)]
pub enum MockResponse {
    /// A non-success status with a body.
    Status {
        /// Status code.
        status: u16,
        /// Body text.
        body: String,
    },
    /// A complete response carrying `Content-Length`.
    Complete(String),
    /// A transport failure before headers.
    Fail(String),
}

type BodySender = mpsc::UnboundedSender<EngineResult<Bytes>>;

#[derive(Default)]
struct MockStreamState {
    requests: Vec<StreamRequest>,
    opened_at: Vec<(String, Instant)>,
    scripted: HashMap<String, VecDeque<MockResponse>>,
    live: HashMap<String, BodySender>,
}

/// A mock data-channel transport for testing.
///
/// Requests are keyed by path. A scripted response is used when one is
/// queued for the path; otherwise the request becomes a live stream whose
/// body the test feeds with [`MockStreamTransport::send_line`].
#[derive(Default)]
pub struct MockStreamTransport {
    state: Mutex<MockStreamState>,
}

impl MockStreamTransport {
    /// Creates a new mock transport.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a scripted response for `path`.
    pub fn script(&self, path: &str, response: MockResponse) {
        self.state
            .lock()
            .scripted
            .entry(path.to_string())
            .or_default()
            .push_back(response);
    }

    /// Every request seen so far.
    pub fn requests(&self) -> Vec<StreamRequest> {
        self.state.lock().requests.clone()
    }

    /// Number of requests made for `path`.
    pub fn open_count(&self, path: &str) -> usize {
        self.state
            .lock()
            .requests
            .iter()
            .filter(|r| r.path == path)
            .count()
    }

    /// When each request for `path` was made, in order.
    pub fn open_times(&self, path: &str) -> Vec<Instant> {
        self.state
            .lock()
            .opened_at
            .iter()
            .filter(|(p, _)| p == path)
            .map(|(_, at)| *at)
            .collect()
    }

    /// Returns true if a live stream for `path` is still being read.
    pub fn is_live(&self, path: &str) -> bool {
        self.state
            .lock()
            .live
            .get(path)
            .is_some_and(|tx| !tx.is_closed())
    }

    /// Sends a chunk on the live stream for `path`.
    pub fn send_chunk(&self, path: &str, chunk: impl Into<Bytes>) -> bool {
        self.state
            .lock()
            .live
            .get(path)
            .is_some_and(|tx| tx.send(Ok(chunk.into())).is_ok())
    }

    /// Sends one newline-terminated line on the live stream for `path`.
    pub fn send_line(&self, path: &str, line: &str) -> bool {
        self.send_chunk(path, format!("{line}\n"))
    }

    /// Fails the live stream for `path` mid-flight.
    pub fn fail_stream(&self, path: &str, message: &str) -> bool {
        let tx = self.state.lock().live.remove(path);
        tx.is_some_and(|tx| {
            tx.send(Err(EngineError::transport_retryable(message)))
                .is_ok()
        })
    }

    /// Ends the live stream for `path` cleanly.
    pub fn end_stream(&self, path: &str) -> bool {
        self.state.lock().live.remove(path).is_some()
    }
}

fn body_from_channel(
    rx: mpsc::UnboundedReceiver<EngineResult<Bytes>>,
) -> BoxStream<'static, EngineResult<Bytes>> {
    stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    })
    .boxed()
}

#[async_trait]
impl StreamTransport for MockStreamTransport {
    async fn open(&self, request: StreamRequest) -> EngineResult<StreamResponse> {
        let mut state = self.state.lock();
        let path = request.path.clone();
        state.opened_at.push((path.clone(), Instant::now()));
        state.requests.push(request);

        let scripted = state.scripted.get_mut(&path).and_then(VecDeque::pop_front);
        match scripted {
            Some(MockResponse::Fail(message)) => Err(EngineError::transport_retryable(message)),
            Some(MockResponse::Status { status, body }) => Ok(StreamResponse {
                status,
                content_length: Some(body.len() as u64),
                body: stream::iter([Ok(Bytes::from(body))]).boxed(),
            }),
            Some(MockResponse::Complete(body)) => Ok(StreamResponse {
                status: 200,
                content_length: Some(body.len() as u64),
                body: stream::iter([Ok(Bytes::from(body))]).boxed(),
            }),
            None => {
                let (tx, rx) = mpsc::unbounded_channel();
                state.live.insert(path, tx);
                Ok(StreamResponse {
                    status: 200,
                    content_length: None,
                    body: body_from_channel(rx),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(path: &str) -> StreamRequest {
        StreamRequest {
            base_url: "https://eda.local".into(),
            path: path.into(),
            query: vec![("stream".into(), "alarms".into())],
            headers: vec![("Accept".into(), "text/event-stream".into())],
        }
    }

    #[test]
    fn request_accessors() {
        let req = request("/alarms");
        assert_eq!(req.query_param("stream"), Some("alarms"));
        assert_eq!(req.header("accept"), Some("text/event-stream"));
        assert_eq!(req.query_param("missing"), None);
    }

    #[tokio::test]
    async fn mock_stream_scripted_then_live() {
        let transport = MockStreamTransport::new();
        transport.script("/alarms", MockResponse::Status {
            status: 401,
            body: "expired".into(),
        });

        let first = transport.open(request("/alarms")).await.unwrap();
        assert_eq!(first.status, 401);
        assert_eq!(first.collect_body(1024).await.unwrap(), b"expired");

        let second = transport.open(request("/alarms")).await.unwrap();
        assert!(second.is_success());
        assert!(transport.send_line("/alarms", r#"{"a":1}"#));
        let mut body = second.body;
        assert_eq!(body.next().await.unwrap().unwrap(), Bytes::from("{\"a\":1}\n"));
        assert_eq!(transport.open_count("/alarms"), 2);
    }

    #[tokio::test]
    async fn mock_control_hands_out_peers() {
        let transport = MockControlTransport::new();
        transport.fail_next(EngineError::transport_retryable("refused"));
        let req = ControlRequest {
            url: "wss://eda.local/events".into(),
            headers: Vec::new(),
        };
        assert!(transport.open(req.clone()).await.is_err());

        let mut conn = transport.open(req).await.unwrap();
        let mut peer = transport.next_peer().await.unwrap();
        conn.outbound.send("hello".into()).unwrap();
        assert_eq!(peer.drain_sent(), vec!["hello"]);
        assert!(peer.register("ec-1"));
        assert!(conn.inbound.recv().await.unwrap().contains("ec-1"));
        assert_eq!(transport.open_count(), 2);
    }

    #[tokio::test]
    async fn collect_body_respects_limit() {
        let response = StreamResponse {
            status: 500,
            content_length: None,
            body: stream::iter([Ok(Bytes::from("abcdef")), Ok(Bytes::from("ghij"))]).boxed(),
        };
        assert_eq!(response.collect_body(8).await.unwrap(), b"abcdefgh");
    }
}
