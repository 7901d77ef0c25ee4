//! Data channels: one long-lived HTTP request per open stream key.
//!
//! A channel task owns its request loop. It decodes frames and forwards
//! them to the engine tagged with its key and a per-open identifier. The
//! engine drops frames from identifiers it no longer tracks, so a cancelled
//! channel cannot leak events after an unsubscribe.

use crate::config::RetryConfig;
use crate::credentials::CredentialProvider;
use crate::engine::Signal;
use crate::error::{EngineError, EngineResult};
use crate::registry::{ChannelKey, ChannelSpec};
use crate::transport::{StreamRequest, StreamTransport};
use futures_util::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use streamsync_protocol::{parse_body, parse_frame, LineDecoder};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Upper bound on how much of an error body is kept.
const ERROR_BODY_LIMIT: usize = 4096;

/// How a channel task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChannelOutcome {
    /// The server ended the response cleanly.
    Completed,
    /// Cancelled by the engine.
    Cancelled,
    /// Retries exhausted or a non-retryable failure.
    GaveUp,
}

/// Shared inputs for opening channels within one control epoch.
#[derive(Clone)]
pub(crate) struct ChannelContext {
    pub epoch: u64,
    pub event_client: String,
    pub credentials: Arc<dyn CredentialProvider>,
    pub transport: Arc<dyn StreamTransport>,
    pub retry: RetryConfig,
    pub default_accept: String,
    pub signals: mpsc::UnboundedSender<Signal>,
}

#[derive(Debug)]
struct ChannelHandle {
    id: u64,
    epoch: u64,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ChannelHandle {
    fn cancel(self) -> JoinHandle<()> {
        self.cancel.cancel();
        self.task
    }
}

/// The set of open data channels, at most one per key.
#[derive(Debug, Default)]
pub(crate) struct DataChannels {
    open: HashMap<ChannelKey, ChannelHandle>,
    next_id: u64,
}

impl DataChannels {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a channel for `spec` unless one is already open for its key
    /// in the same epoch. Returns true if a channel was started.
    pub fn open(&mut self, spec: ChannelSpec, ctx: &ChannelContext) -> bool {
        if let Some(existing) = self.open.get(&spec.key) {
            if existing.epoch == ctx.epoch {
                return false;
            }
        }
        if let Some(stale) = self.open.remove(&spec.key) {
            stale.cancel();
        }

        self.next_id += 1;
        let id = self.next_id;
        let key = spec.key.clone();
        let cancel = CancellationToken::new();
        debug!(channel = %key, id, path = %spec.path, "opening data channel");

        let task = DataChannelTask {
            id,
            spec,
            ctx: ctx.clone(),
            cancel: cancel.clone(),
        };
        let signals = ctx.signals.clone();
        let ended_key = key.clone();
        let handle = tokio::spawn(async move {
            let outcome = task.run().await;
            let _ = signals.send(Signal::ChannelEnded {
                key: ended_key,
                id,
                outcome,
            });
        });

        self.open.insert(
            key,
            ChannelHandle {
                id,
                epoch: ctx.epoch,
                cancel,
                task: handle,
            },
        );
        true
    }

    /// Returns true if `id` is the live channel for `key`.
    pub fn is_current(&self, key: &ChannelKey, id: u64) -> bool {
        self.open.get(key).is_some_and(|handle| handle.id == id)
    }

    /// Forgets a channel whose task has ended. Returns false if `id` was
    /// already replaced or cancelled.
    pub fn finished(&mut self, key: &ChannelKey, id: u64) -> bool {
        if self.is_current(key, id) {
            self.open.remove(key);
            return true;
        }
        false
    }

    /// Cancels every channel of `stream`, across namespaces.
    pub fn cancel_stream(&mut self, stream: &str) -> usize {
        let keys: Vec<ChannelKey> = self
            .open
            .keys()
            .filter(|key| key.stream == stream)
            .cloned()
            .collect();
        for key in &keys {
            if let Some(handle) = self.open.remove(key) {
                handle.cancel();
            }
        }
        keys.len()
    }

    /// Cancels every channel and hands back their tasks.
    pub fn cancel_all(&mut self) -> Vec<JoinHandle<()>> {
        self.open.drain().map(|(_, handle)| handle.cancel()).collect()
    }

    /// Keys of every open channel, sorted.
    pub fn keys(&self) -> Vec<ChannelKey> {
        let mut keys: Vec<ChannelKey> = self.open.keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[derive(Debug, Default)]
struct AttemptState {
    refreshed: bool,
    delivered: bool,
}

struct DataChannelTask {
    id: u64,
    spec: ChannelSpec,
    ctx: ChannelContext,
    cancel: CancellationToken,
}

impl DataChannelTask {
    async fn run(self) -> ChannelOutcome {
        let mut state = AttemptState::default();
        let mut failures: u32 = 0;

        loop {
            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return ChannelOutcome::Cancelled,
                result = self.attempt(&mut state) => result,
            };

            let error = match result {
                Ok(()) => {
                    debug!(channel = %self.spec.key, id = self.id, "data channel completed");
                    return ChannelOutcome::Completed;
                }
                Err(error) => error,
            };

            if std::mem::take(&mut state.delivered) {
                failures = 0;
            }

            let expired = error
                .http_status()
                .is_some_and(|(status, body)| self.ctx.credentials.is_auth_expired(status, body));
            if expired && !state.refreshed {
                state.refreshed = true;
                info!(channel = %self.spec.key, "credentials expired, refreshing");
                if let Err(e) = self.ctx.credentials.refresh().await {
                    warn!(channel = %self.spec.key, error = %e, "credential refresh failed");
                }
                continue;
            }

            failures += 1;
            if !error.is_retryable() {
                warn!(channel = %self.spec.key, error = %error, "data channel failed");
                return ChannelOutcome::GaveUp;
            }
            if failures >= self.ctx.retry.max_attempts {
                warn!(
                    channel = %self.spec.key,
                    attempts = failures,
                    error = %error,
                    "data channel retries exhausted"
                );
                return ChannelOutcome::GaveUp;
            }

            let delay = self.ctx.retry.delay_for_attempt(failures);
            debug!(
                channel = %self.spec.key,
                attempt = failures,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "retrying data channel"
            );
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return ChannelOutcome::Cancelled,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn attempt(&self, state: &mut AttemptState) -> EngineResult<()> {
        self.ctx
            .credentials
            .wait_for_ready()
            .await?;
        let response = self.ctx.transport.open(self.request()).await?;

        if !response.is_success() {
            let status = response.status;
            let body = response
                .collect_body(ERROR_BODY_LIMIT)
                .await
                .unwrap_or_default();
            return Err(EngineError::Http {
                status,
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }
        state.refreshed = false;

        if let Some(length) = response.content_length {
            let limit = usize::try_from(length).unwrap_or(usize::MAX);
            let body = response.collect_body(limit).await?;
            match parse_body(&body) {
                Ok(message) => {
                    self.emit(message);
                    state.delivered = true;
                }
                Err(e) => warn!(channel = %self.spec.key, error = %e, "dropping malformed response"),
            }
            return Ok(());
        }

        let mut body = response.body;
        let mut decoder = LineDecoder::new();
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            for line in decoder.push(&chunk) {
                if self.deliver(&line) {
                    state.delivered = true;
                }
            }
        }
        if let Some(line) = decoder.finish() {
            if self.deliver(&line) {
                state.delivered = true;
            }
        }
        Ok(())
    }

    fn request(&self) -> StreamRequest {
        let mut query = vec![
            ("eventclient".to_string(), self.ctx.event_client.clone()),
            ("stream".to_string(), self.spec.key.stream.clone()),
        ];
        query.extend(self.spec.query.iter().cloned());

        let accept = self
            .spec
            .accept
            .clone()
            .unwrap_or_else(|| self.ctx.default_accept.clone());
        let mut headers = self.ctx.credentials.headers();
        headers.push(("Accept".to_string(), accept));

        StreamRequest {
            base_url: self.ctx.credentials.base_url(),
            path: self.spec.path.clone(),
            query,
            headers,
        }
    }

    fn deliver(&self, line: &str) -> bool {
        match parse_frame(line) {
            Ok(Some(message)) => {
                self.emit(message);
                true
            }
            Ok(None) => false,
            Err(e) => {
                warn!(channel = %self.spec.key, error = %e, "dropping malformed frame");
                false
            }
        }
    }

    fn emit(&self, message: serde_json::Value) {
        let _ = self.ctx.signals.send(Signal::Frame {
            key: self.spec.key.clone(),
            id: self.id,
            message,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::StaticCredentials;
    use crate::transport::{MockResponse, MockStreamTransport};
    use std::time::Duration;

    struct Harness {
        ctx: ChannelContext,
        signals: mpsc::UnboundedReceiver<Signal>,
        transport: Arc<MockStreamTransport>,
        credentials: Arc<StaticCredentials>,
    }

    fn harness(retry: RetryConfig) -> Harness {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(MockStreamTransport::new());
        let credentials = Arc::new(StaticCredentials::new("https://eda.local", "t0"));
        let ctx = ChannelContext {
            epoch: 1,
            event_client: "ec-1".into(),
            credentials: credentials.clone(),
            transport: transport.clone(),
            retry,
            default_accept: "text/event-stream".into(),
            signals: tx,
        };
        Harness {
            ctx,
            signals: rx,
            transport,
            credentials,
        }
    }

    fn spec(stream: &str, path: &str) -> ChannelSpec {
        ChannelSpec {
            key: ChannelKey::cluster(stream),
            path: path.into(),
            query: Vec::new(),
            accept: None,
        }
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..2000 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn request_carries_identity_stream_and_accept() {
        let mut h = harness(RetryConfig::no_retry());
        let mut channels = DataChannels::new();
        let mut spec = spec("summary", "/summary");
        spec.query.push(("size".into(), "10".into()));
        spec.accept = Some("application/json".into());
        channels.open(spec, &h.ctx);

        wait_until(|| h.transport.open_count("/summary") == 1).await;
        let request = &h.transport.requests()[0];
        let names: Vec<&str> = request.query.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(names, vec!["eventclient", "stream", "size"]);
        assert_eq!(request.query_param("eventclient"), Some("ec-1"));
        assert_eq!(request.header("accept"), Some("application/json"));
        assert_eq!(request.header("authorization"), Some("Bearer t0"));
        channels.cancel_all();
        let _ = h.signals.try_recv();
    }

    #[tokio::test]
    async fn open_is_idempotent_per_key() {
        let h = harness(RetryConfig::no_retry());
        let mut channels = DataChannels::new();
        assert!(channels.open(spec("alarms", "/alarms"), &h.ctx));
        assert!(!channels.open(spec("alarms", "/alarms"), &h.ctx));
        assert_eq!(channels.keys().len(), 1);
    }

    #[tokio::test]
    async fn live_frames_are_forwarded_in_order() {
        let mut h = harness(RetryConfig::no_retry());
        let mut channels = DataChannels::new();
        channels.open(spec("alarms", "/alarms"), &h.ctx);
        wait_until(|| h.transport.is_live("/alarms")).await;

        h.transport.send_line("/alarms", r#"data: {"seq":1}"#);
        h.transport.send_line("/alarms", "not json");
        h.transport.send_chunk("/alarms", r#"data: {"se"#);
        h.transport.send_line("/alarms", r#"q":2}"#);

        let mut seen = Vec::new();
        while seen.len() < 2 {
            if let Some(Signal::Frame { message, .. }) = h.signals.recv().await {
                seen.push(message["seq"].as_u64().unwrap());
            }
        }
        assert_eq!(seen, vec![1, 2]);
    }

    #[tokio::test]
    async fn complete_response_ends_channel() {
        let mut h = harness(RetryConfig::no_retry());
        h.transport
            .script("/summary", MockResponse::Complete(r#"{"total":42}"#.into()));
        let mut channels = DataChannels::new();
        channels.open(spec("summary", "/summary"), &h.ctx);

        match h.signals.recv().await {
            Some(Signal::Frame { message, .. }) => assert_eq!(message["total"], 42),
            other => panic!("unexpected: {other:?}"),
        }
        match h.signals.recv().await {
            Some(Signal::ChannelEnded { key, id, outcome }) => {
                assert_eq!(outcome, ChannelOutcome::Completed);
                assert!(channels.finished(&key, id));
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert!(channels.keys().is_empty());
    }

    #[tokio::test]
    async fn expired_token_refreshes_once_then_retries() {
        let mut h = harness(RetryConfig::no_retry());
        h.transport.script(
            "/alarms",
            MockResponse::Status {
                status: 401,
                body: "token expired".into(),
            },
        );
        let mut channels = DataChannels::new();
        channels.open(spec("alarms", "/alarms"), &h.ctx);

        wait_until(|| h.transport.is_live("/alarms")).await;
        assert_eq!(h.credentials.refresh_count(), 1);
        assert_eq!(h.transport.open_count("/alarms"), 2);
        assert!(h.signals.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let retry = RetryConfig::new(3).with_initial_delay(Duration::from_millis(10));
        let mut h = harness(retry);
        for _ in 0..3 {
            h.transport.script("/alarms", MockResponse::Fail("refused".into()));
        }
        let mut channels = DataChannels::new();
        channels.open(spec("alarms", "/alarms"), &h.ctx);

        match h.signals.recv().await {
            Some(Signal::ChannelEnded { outcome, .. }) => assert_eq!(outcome, ChannelOutcome::GaveUp),
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(h.transport.open_count("/alarms"), 3);
    }

    fn gaps(times: &[tokio::time::Instant]) -> Vec<Duration> {
        times.windows(2).map(|pair| pair[1] - pair[0]).collect()
    }

    fn assert_close(actual: Duration, expected: Duration) {
        assert!(
            actual >= expected && actual < expected + Duration::from_millis(10),
            "waited {actual:?}, expected {expected:?}"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn retry_sleeps_double_from_one_second() {
        let h = harness(RetryConfig::default());
        for _ in 0..3 {
            h.transport.script("/alarms", MockResponse::Fail("refused".into()));
        }
        let mut channels = DataChannels::new();
        channels.open(spec("alarms", "/alarms"), &h.ctx);

        wait_until(|| h.transport.is_live("/alarms")).await;
        let waits = gaps(&h.transport.open_times("/alarms"));
        assert_eq!(waits.len(), 3);
        assert_close(waits[0], Duration::from_secs(1));
        assert_close(waits[1], Duration::from_secs(2));
        assert_close(waits[2], Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn mid_stream_failure_retries_and_resets_attempts() {
        let mut h = harness(RetryConfig::new(2));
        let mut channels = DataChannels::new();
        channels.open(spec("alarms", "/alarms"), &h.ctx);

        // Two attempts would exhaust the budget, but each delivered a frame.
        for seq in 1..=2u64 {
            wait_until(|| h.transport.is_live("/alarms")).await;
            h.transport.send_line("/alarms", &format!(r#"{{"seq":{seq}}}"#));
            match h.signals.recv().await {
                Some(Signal::Frame { message, .. }) => assert_eq!(message["seq"], seq),
                other => panic!("unexpected: {other:?}"),
            }
            let failed_at = tokio::time::Instant::now();
            assert!(h.transport.fail_stream("/alarms", "connection reset"));

            wait_until(|| h.transport.is_live("/alarms")).await;
            let reopened = *h.transport.open_times("/alarms").last().unwrap();
            assert_close(reopened - failed_at, Duration::from_secs(1));
        }

        // A second failure in a row without data exhausts it.
        assert!(h.transport.fail_stream("/alarms", "connection reset"));
        match h.signals.recv().await {
            Some(Signal::ChannelEnded { outcome, .. }) => assert_eq!(outcome, ChannelOutcome::GaveUp),
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(h.transport.open_count("/alarms"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn second_auth_failure_backs_off_without_refreshing() {
        let h = harness(RetryConfig::default());
        for _ in 0..2 {
            h.transport.script(
                "/alarms",
                MockResponse::Status {
                    status: 401,
                    body: "token expired".into(),
                },
            );
        }
        let mut channels = DataChannels::new();
        channels.open(spec("alarms", "/alarms"), &h.ctx);

        wait_until(|| h.transport.is_live("/alarms")).await;
        assert_eq!(h.credentials.refresh_count(), 1);
        let waits = gaps(&h.transport.open_times("/alarms"));
        assert_eq!(waits.len(), 2);
        assert_eq!(waits[0], Duration::ZERO);
        assert_close(waits[1], Duration::from_secs(1));
    }

    #[tokio::test]
    async fn clean_end_of_stream_completes() {
        let mut h = harness(RetryConfig::default());
        let mut channels = DataChannels::new();
        channels.open(spec("alarms", "/alarms"), &h.ctx);
        wait_until(|| h.transport.is_live("/alarms")).await;

        h.transport.send_line("/alarms", r#"{"seq":1}"#);
        assert!(h.transport.end_stream("/alarms"));

        assert!(matches!(h.signals.recv().await, Some(Signal::Frame { .. })));
        match h.signals.recv().await {
            Some(Signal::ChannelEnded { outcome, .. }) => {
                assert_eq!(outcome, ChannelOutcome::Completed)
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(h.transport.open_count("/alarms"), 1);
    }

    #[tokio::test]
    async fn not_found_is_not_retried() {
        let mut h = harness(RetryConfig::default());
        h.transport.script(
            "/alarms",
            MockResponse::Status {
                status: 404,
                body: "no such stream".into(),
            },
        );
        let mut channels = DataChannels::new();
        channels.open(spec("alarms", "/alarms"), &h.ctx);

        match h.signals.recv().await {
            Some(Signal::ChannelEnded { outcome, .. }) => assert_eq!(outcome, ChannelOutcome::GaveUp),
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(h.credentials.refresh_count(), 0);
    }

    #[tokio::test]
    async fn cancelled_channel_is_no_longer_current() {
        let mut h = harness(RetryConfig::no_retry());
        let mut channels = DataChannels::new();
        channels.open(spec("alarms", "/alarms"), &h.ctx);
        channels.open(
            ChannelSpec {
                key: ChannelKey::scoped("nodes", "a"),
                path: "/nodes/a".into(),
                query: Vec::new(),
                accept: None,
            },
            &h.ctx,
        );
        assert_eq!(channels.cancel_stream("alarms"), 1);
        assert_eq!(channels.keys(), vec![ChannelKey::scoped("nodes", "a")]);

        match h.signals.recv().await {
            Some(Signal::ChannelEnded { key, id, outcome }) => {
                assert_eq!(key, ChannelKey::cluster("alarms"));
                assert_eq!(outcome, ChannelOutcome::Cancelled);
                assert!(!channels.finished(&key, id));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }
}
