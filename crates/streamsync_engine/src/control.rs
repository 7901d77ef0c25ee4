//! Control channel: the single WebSocket carrying registration and
//! flow-control traffic.
//!
//! ```text
//! Disconnected → Connecting → Open → Registered
//!       ↑                                  │
//!       └──────────── Closing ←────────────┘
//! ```
//!
//! Every connection attempt gets a fresh epoch. Signals from a task whose
//! epoch is no longer current are ignored, which is how an event-client
//! identity from a previous connection is kept from leaking into the next.

use crate::credentials::CredentialProvider;
use crate::engine::Signal;
use crate::error::{EngineError, EngineResult};
use crate::transport::{ControlConnection, ControlRequest, ControlTransport};
use std::sync::Arc;
use streamsync_protocol::ClientMessage;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lifecycle of the control channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlState {
    /// No connection and no attempt in flight.
    Disconnected,
    /// Handshake in flight.
    Connecting,
    /// Socket open, no event-client identity yet.
    Open,
    /// Event-client identity received; data channels may open.
    Registered,
    /// Shutting down on request.
    Closing,
}

impl ControlState {
    /// Returns true while a connection exists or is being established.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ControlState::Connecting | ControlState::Open | ControlState::Registered
        )
    }

    /// Returns true if messages can be sent.
    pub fn is_open(&self) -> bool {
        matches!(self, ControlState::Open | ControlState::Registered)
    }
}

/// Engine-side state of the control channel.
#[derive(Debug)]
pub(crate) struct ControlChannel {
    state: ControlState,
    epoch: u64,
    outbound: Option<mpsc::UnboundedSender<String>>,
    event_client_id: Option<String>,
    cancel: Option<CancellationToken>,
    task: Option<JoinHandle<()>>,
}

impl ControlChannel {
    pub fn new() -> Self {
        Self {
            state: ControlState::Disconnected,
            epoch: 0,
            outbound: None,
            event_client_id: None,
            cancel: None,
            task: None,
        }
    }

    pub fn state(&self) -> ControlState {
        self.state
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn event_client_id(&self) -> Option<&str> {
        self.event_client_id.as_deref()
    }

    /// Starts a new epoch. Returns `None` if a connection is already active.
    pub fn begin_connect(&mut self) -> Option<(u64, CancellationToken)> {
        if self.state.is_active() {
            return None;
        }
        self.epoch += 1;
        self.state = ControlState::Connecting;
        let cancel = CancellationToken::new();
        self.cancel = Some(cancel.clone());
        Some((self.epoch, cancel))
    }

    pub fn attach_task(&mut self, task: JoinHandle<()>) {
        self.task = Some(task);
    }

    /// Handles the socket opening. Returns false for a stale epoch.
    pub fn on_open(&mut self, epoch: u64, outbound: mpsc::UnboundedSender<String>) -> bool {
        if epoch != self.epoch || self.state != ControlState::Connecting {
            return false;
        }
        self.outbound = Some(outbound);
        self.state = ControlState::Open;
        true
    }

    /// Handles a registration frame. Only the first one per epoch counts.
    pub fn on_register(&mut self, epoch: u64, client: String) -> bool {
        if epoch != self.epoch || self.state != ControlState::Open {
            return false;
        }
        self.event_client_id = Some(client);
        self.state = ControlState::Registered;
        true
    }

    /// Returns true if `epoch` is the live connection.
    pub fn is_current(&self, epoch: u64) -> bool {
        epoch == self.epoch && self.state.is_active()
    }

    /// Sends a message if the socket is open.
    pub fn send(&self, message: &ClientMessage) -> bool {
        if !self.state.is_open() {
            return false;
        }
        let Some(outbound) = &self.outbound else {
            return false;
        };
        match message.encode() {
            Ok(text) => outbound.send(text).is_ok(),
            Err(e) => {
                warn!(error = %e, "failed to encode control message");
                false
            }
        }
    }

    /// Drops the connection after a failure.
    pub fn reset(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        self.task = None;
        self.outbound = None;
        self.event_client_id = None;
        self.state = ControlState::Disconnected;
    }

    /// Closes the connection on request and waits for its task to stop.
    pub async fn shutdown(&mut self) {
        if self.state == ControlState::Disconnected {
            return;
        }
        self.state = ControlState::Closing;
        self.outbound = None;
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                debug!(error = %e, "control task ended abnormally");
            }
        }
        self.event_client_id = None;
        self.state = ControlState::Disconnected;
    }
}

/// Converts an HTTP base URL into the control-channel WebSocket URL.
pub fn control_url(base_url: &str, path: &str) -> EngineResult<String> {
    let base = base_url.trim_end_matches('/');
    let ws_base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else if base.starts_with("wss://") || base.starts_with("ws://") {
        base.to_string()
    } else {
        return Err(EngineError::Config(format!(
            "unsupported base url scheme: {base_url}"
        )));
    };
    Ok(format!("{ws_base}{path}"))
}

/// Background task owning one control connection attempt.
pub(crate) struct ControlTask {
    pub epoch: u64,
    pub path: String,
    pub credentials: Arc<dyn CredentialProvider>,
    pub transport: Arc<dyn ControlTransport>,
    pub signals: mpsc::UnboundedSender<Signal>,
    pub cancel: CancellationToken,
}

impl ControlTask {
    pub async fn run(self) {
        let epoch = self.epoch;
        let signals = self.signals.clone();
        let cancel = self.cancel.clone();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(epoch, "control task cancelled");
            }
            reason = self.session() => {
                let _ = signals.send(Signal::ControlClosed { epoch, reason });
            }
        }
    }

    /// Runs the connection until it ends; returns why it ended.
    async fn session(self) -> String {
        if let Err(e) = self.credentials.wait_for_ready().await {
            return format!("credentials unavailable: {e}");
        }
        let url = match control_url(&self.credentials.base_url(), &self.path) {
            Ok(url) => url,
            Err(e) => return e.to_string(),
        };
        let request = ControlRequest {
            url,
            headers: self.credentials.headers(),
        };

        let ControlConnection {
            outbound,
            mut inbound,
        } = match self.transport.open(request).await {
            Ok(connection) => connection,
            Err(e) => return self.handshake_failed(e).await,
        };

        info!(epoch = self.epoch, "control channel open");
        if self
            .signals
            .send(Signal::ControlOpened {
                epoch: self.epoch,
                outbound,
            })
            .is_err()
        {
            return "engine stopped".into();
        }

        while let Some(text) = inbound.recv().await {
            let frame = Signal::ControlFrame {
                epoch: self.epoch,
                text,
            };
            if self.signals.send(frame).is_err() {
                return "engine stopped".into();
            }
        }
        "control socket closed".into()
    }

    async fn handshake_failed(&self, error: EngineError) -> String {
        let expired = error
            .http_status()
            .is_some_and(|(status, body)| self.credentials.is_auth_expired(status, body));
        if expired {
            info!(epoch = self.epoch, "control handshake rejected, refreshing credentials");
            if let Err(e) = self.credentials.refresh().await {
                warn!(error = %e, "credential refresh failed");
            }
            return format!("authentication expired: {error}");
        }
        format!("connect failed: {error}")
    }
}
