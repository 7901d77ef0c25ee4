//! The streaming engine: a handle plus a single task that owns all state.
//!
//! Consumers talk to [`StreamingEngine`], which forwards commands over a
//! channel. The engine task is the only writer of the registry, the control
//! channel state and the set of open data channels. Background tasks
//! (control socket, data channels, timers) report back through [`Signal`]s
//! on a second channel, so every state change happens on one serialized path.

use crate::config::EngineConfig;
use crate::control::{ControlChannel, ControlState, ControlTask};
use crate::credentials::CredentialProvider;
use crate::data_channel::{ChannelContext, ChannelOutcome, DataChannels};
use crate::error::{EngineError, EngineResult};
use crate::feed::{EventFeed, EventReceiver, StreamEvent};
use crate::flow::{AckDecision, AckScheduler};
use crate::http::{HttpStreamTransport, WebSocketControlTransport, WebSocketOptions};
use crate::registry::{ChannelKey, ChannelSpec, QueryChange, StreamRegistry};
use crate::supervisor::ReconnectSupervisor;
use crate::transport::{ControlTransport, StreamTransport};
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use streamsync_protocol::{ClientMessage, LogicalStream, ServerMessage, StreamParams};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

/// Consecutive commands handled before a waiting signal gets a turn.
const COMMAND_BURST: usize = 32;

/// Reports from background tasks to the engine task.
#[derive(Debug)]
pub(crate) enum Signal {
    ControlOpened {
        epoch: u64,
        outbound: mpsc::UnboundedSender<String>,
    },
    ControlFrame {
        epoch: u64,
        text: String,
    },
    ControlClosed {
        epoch: u64,
        reason: String,
    },
    Frame {
        key: ChannelKey,
        id: u64,
        message: Value,
    },
    ChannelEnded {
        key: ChannelKey,
        id: u64,
        outcome: ChannelOutcome,
    },
    AckDue {
        stream: String,
        ticket: u64,
    },
    ReconnectDue {
        generation: u64,
    },
}

enum Command {
    Connect,
    Disconnect {
        clear: bool,
        done: oneshot::Sender<()>,
    },
    Reconnect {
        clear: bool,
        done: oneshot::Sender<()>,
    },
    Subscribe {
        name: String,
        reply: oneshot::Sender<EngineResult<()>>,
    },
    SubscribeWith {
        name: String,
        params: StreamParams,
        reply: oneshot::Sender<EngineResult<()>>,
    },
    SubscribeQuery {
        name: String,
        query_text: String,
        namespace_filter: Option<String>,
        reply: oneshot::Sender<EngineResult<()>>,
    },
    Unsubscribe {
        name: String,
        reply: oneshot::Sender<bool>,
    },
    SetNamespaces {
        names: Vec<String>,
    },
    SetCatalog {
        entries: Vec<LogicalStream>,
    },
    Status {
        reply: oneshot::Sender<EngineStatus>,
    },
    Dispose {
        done: oneshot::Sender<()>,
    },
}

/// A point-in-time view of the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineStatus {
    /// Control channel state.
    pub state: ControlState,
    /// Event-client identity of the current connection.
    pub event_client_id: Option<String>,
    /// Open data channels, sorted.
    pub channels: Vec<ChannelKey>,
    /// Desired stream names, sorted.
    pub desired: Vec<String>,
    /// Current namespace snapshot, sorted.
    pub namespaces: Vec<String>,
    /// Reconnects scheduled since the last successful open.
    pub reconnect_attempts: u64,
}

impl EngineStatus {
    /// Open channels rendered as `stream` or `stream@namespace`.
    pub fn channel_names(&self) -> Vec<String> {
        self.channels.iter().map(ToString::to_string).collect()
    }
}

/// Builds a [`StreamingEngine`].
pub struct EngineBuilder {
    config: EngineConfig,
    credentials: Option<Arc<dyn CredentialProvider>>,
    control_transport: Option<Arc<dyn ControlTransport>>,
    stream_transport: Option<Arc<dyn StreamTransport>>,
    accept_invalid_certs: bool,
}

impl EngineBuilder {
    /// Creates a builder with default configuration.
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
            credentials: None,
            control_transport: None,
            stream_transport: None,
            accept_invalid_certs: false,
        }
    }

    /// Sets the configuration.
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Attaches the credential provider. Required.
    pub fn credentials(mut self, credentials: Arc<dyn CredentialProvider>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Overrides the control-channel transport.
    pub fn control_transport(mut self, transport: Arc<dyn ControlTransport>) -> Self {
        self.control_transport = Some(transport);
        self
    }

    /// Overrides the data-channel transport.
    pub fn stream_transport(mut self, transport: Arc<dyn StreamTransport>) -> Self {
        self.stream_transport = Some(transport);
        self
    }

    /// Disables TLS verification on the default transports.
    pub fn accept_invalid_certs(mut self, accept: bool) -> Self {
        self.accept_invalid_certs = accept;
        self
    }

    /// Starts the engine task. Must be called within a tokio runtime.
    ///
    /// The engine is idle until [`StreamingEngine::connect`].
    pub fn build(self) -> EngineResult<StreamingEngine> {
        let credentials = self
            .credentials
            .ok_or_else(|| EngineError::Config("no credential provider attached".into()))?;
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(EngineError::Config(
                "the engine must be built inside a tokio runtime".into(),
            ));
        }

        let control_transport: Arc<dyn ControlTransport> = match self.control_transport {
            Some(transport) => transport,
            None => Arc::new(WebSocketControlTransport::new(WebSocketOptions {
                accept_invalid_certs: self.accept_invalid_certs,
                ..WebSocketOptions::default()
            })?),
        };
        let stream_transport: Arc<dyn StreamTransport> = match self.stream_transport {
            Some(transport) => transport,
            None => Arc::new(HttpStreamTransport::new(self.accept_invalid_certs)?),
        };

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        let feed = EventFeed::new();

        let task = EngineTask::new(
            self.config,
            credentials,
            control_transport,
            stream_transport,
            feed.clone(),
            signals_tx,
        );
        tokio::spawn(task.run(commands_rx, signals_rx));

        Ok(StreamingEngine {
            commands: commands_tx,
            feed,
        })
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to a running streaming engine.
///
/// Cloning shares the engine. When the last handle is dropped the engine
/// disposes itself; a [`StreamingEngine::follow_namespaces`] forwarder does
/// not count as a handle.
#[derive(Debug, Clone)]
pub struct StreamingEngine {
    commands: mpsc::UnboundedSender<Command>,
    feed: EventFeed,
}

impl StreamingEngine {
    /// Returns a builder.
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// Registers a consumer of `(stream, message)` events.
    pub fn events(&self) -> EventReceiver {
        self.feed.register()
    }

    /// Opens the control channel. A no-op if already connecting or connected.
    pub fn connect(&self) -> EngineResult<()> {
        self.send(Command::Connect)
    }

    /// Closes every connection without scheduling a reconnect.
    ///
    /// With `clear`, the desired-stream set is dropped too.
    pub async fn disconnect(&self, clear: bool) -> EngineResult<()> {
        let (done, rx) = oneshot::channel();
        self.send(Command::Disconnect { clear, done })?;
        rx.await.map_err(|_| EngineError::Disposed)
    }

    /// Disconnects, then connects again.
    pub async fn reconnect(&self, clear: bool) -> EngineResult<()> {
        let (done, rx) = oneshot::channel();
        self.send(Command::Reconnect { clear, done })?;
        rx.await.map_err(|_| EngineError::Disposed)
    }

    /// Marks a catalog stream desired.
    pub async fn subscribe(&self, name: &str) -> EngineResult<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Subscribe {
            name: name.to_string(),
            reply,
        })?;
        rx.await.map_err(|_| EngineError::Disposed)?
    }

    /// Marks a stream desired with explicit parameters.
    ///
    /// This is the only way to open a reserved stream such as `summary` or
    /// `file`. Changing the parameters of an open stream reopens its channels.
    pub async fn subscribe_with(&self, name: &str, params: StreamParams) -> EngineResult<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::SubscribeWith {
            name: name.to_string(),
            params,
            reply,
        })?;
        rx.await.map_err(|_| EngineError::Disposed)?
    }

    /// Defines an ad-hoc query stream, or replaces its query.
    pub async fn subscribe_query(
        &self,
        name: &str,
        query_text: &str,
        namespace_filter: Option<&str>,
    ) -> EngineResult<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::SubscribeQuery {
            name: name.to_string(),
            query_text: query_text.to_string(),
            namespace_filter: namespace_filter.map(str::to_string),
            reply,
        })?;
        rx.await.map_err(|_| EngineError::Disposed)?
    }

    /// Marks a stream not desired and cancels its channels.
    ///
    /// Returns true if the stream was desired.
    pub async fn unsubscribe(&self, name: &str) -> EngineResult<bool> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Unsubscribe {
            name: name.to_string(),
            reply,
        })?;
        rx.await.map_err(|_| EngineError::Disposed)
    }

    /// Replaces the namespace snapshot.
    pub fn set_namespaces<I, S>(&self, names: I) -> EngineResult<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.send(Command::SetNamespaces {
            names: names.into_iter().map(Into::into).collect(),
        })
    }

    /// Forwards every change of `namespaces` to [`StreamingEngine::set_namespaces`].
    ///
    /// The current value is applied immediately. Forwarding stops when the
    /// sender is dropped or the engine is gone. The forwarder holds only a
    /// weak reference, so it never keeps the engine alive.
    pub fn follow_namespaces(&self, mut namespaces: watch::Receiver<BTreeSet<String>>) {
        let commands = self.commands.downgrade();
        tokio::spawn(async move {
            loop {
                let names: Vec<String> = namespaces.borrow_and_update().iter().cloned().collect();
                let Some(commands) = commands.upgrade() else {
                    break;
                };
                if commands.send(Command::SetNamespaces { names }).is_err() {
                    break;
                }
                drop(commands);
                if namespaces.changed().await.is_err() {
                    break;
                }
            }
            trace!("namespace forwarder stopped");
        });
    }

    /// Replaces the endpoint catalog.
    pub fn set_endpoint_catalog(&self, entries: Vec<LogicalStream>) -> EngineResult<()> {
        self.send(Command::SetCatalog { entries })
    }

    /// Returns a snapshot of the engine state.
    pub async fn status(&self) -> EngineResult<EngineStatus> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Status { reply })?;
        rx.await.map_err(|_| EngineError::Disposed)
    }

    /// Terminal teardown. Waits until every channel has settled.
    pub async fn dispose(&self) -> EngineResult<()> {
        let (done, rx) = oneshot::channel();
        self.send(Command::Dispose { done })?;
        rx.await.map_err(|_| EngineError::Disposed)
    }

    fn send(&self, command: Command) -> EngineResult<()> {
        self.commands
            .send(command)
            .map_err(|_| EngineError::Disposed)
    }
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Command::Connect => "Connect",
            Command::Disconnect { .. } => "Disconnect",
            Command::Reconnect { .. } => "Reconnect",
            Command::Subscribe { .. } => "Subscribe",
            Command::SubscribeWith { .. } => "SubscribeWith",
            Command::SubscribeQuery { .. } => "SubscribeQuery",
            Command::Unsubscribe { .. } => "Unsubscribe",
            Command::SetNamespaces { .. } => "SetNamespaces",
            Command::SetCatalog { .. } => "SetCatalog",
            Command::Status { .. } => "Status",
            Command::Dispose { .. } => "Dispose",
        };
        f.write_str(name)
    }
}

struct EngineTask {
    config: EngineConfig,
    credentials: Arc<dyn CredentialProvider>,
    control_transport: Arc<dyn ControlTransport>,
    stream_transport: Arc<dyn StreamTransport>,
    registry: StreamRegistry,
    control: ControlChannel,
    supervisor: ReconnectSupervisor,
    scheduler: AckScheduler,
    channels: DataChannels,
    feed: EventFeed,
    signals: mpsc::UnboundedSender<Signal>,
}

impl EngineTask {
    fn new(
        config: EngineConfig,
        credentials: Arc<dyn CredentialProvider>,
        control_transport: Arc<dyn ControlTransport>,
        stream_transport: Arc<dyn StreamTransport>,
        feed: EventFeed,
        signals: mpsc::UnboundedSender<Signal>,
    ) -> Self {
        Self {
            registry: StreamRegistry::new(&config),
            control: ControlChannel::new(),
            supervisor: ReconnectSupervisor::new(config.reconnect_delay),
            scheduler: AckScheduler::new(config.min_ack_interval),
            channels: DataChannels::new(),
            feed,
            config,
            credentials,
            control_transport,
            stream_transport,
            signals,
        }
    }

    /// Commands are preferred over signals, but after `COMMAND_BURST`
    /// consecutive commands one waiting signal is handled first.
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut signals: mpsc::UnboundedReceiver<Signal>,
    ) {
        let mut burst = 0usize;
        loop {
            if burst >= COMMAND_BURST {
                burst = 0;
                if let Ok(signal) = signals.try_recv() {
                    self.handle_signal(signal);
                    continue;
                }
            }
            tokio::select! {
                biased;
                command = commands.recv() => match command {
                    Some(Command::Dispose { done }) => {
                        self.dispose().await;
                        let _ = done.send(());
                        break;
                    }
                    Some(command) => {
                        burst += 1;
                        self.handle_command(command).await;
                    }
                    None => {
                        debug!("all engine handles dropped");
                        self.dispose().await;
                        break;
                    }
                },
                Some(signal) = signals.recv() => {
                    burst = 0;
                    self.handle_signal(signal);
                }
            }
        }
    }

    async fn handle_command(&mut self, command: Command) {
        trace!(?command, "engine command");
        match command {
            Command::Connect => {
                self.supervisor.arm();
                self.start_connect();
            }
            Command::Disconnect { clear, done } => {
                self.disconnect(clear).await;
                let _ = done.send(());
            }
            Command::Reconnect { clear, done } => {
                self.disconnect(clear).await;
                self.supervisor.arm();
                self.start_connect();
                let _ = done.send(());
            }
            Command::Subscribe { name, reply } => {
                let result = self.registry.subscribe(&name);
                if result.is_ok() {
                    self.activate(&name);
                }
                let _ = reply.send(result);
            }
            Command::SubscribeWith {
                name,
                params,
                reply,
            } => {
                let result = self.registry.subscribe_with(&name, params).map(|changed| {
                    if changed {
                        self.channels.cancel_stream(&name);
                    }
                    self.activate(&name);
                });
                let _ = reply.send(result);
            }
            Command::SubscribeQuery {
                name,
                query_text,
                namespace_filter,
                reply,
            } => {
                let result = self
                    .registry
                    .subscribe_query(&name, &query_text, namespace_filter.as_deref())
                    .map(|change| {
                        if change == QueryChange::Replaced {
                            info!(stream = %name, "query replaced, reopening");
                            self.channels.cancel_stream(&name);
                        }
                        self.activate(&name);
                    });
                let _ = reply.send(result);
            }
            Command::Unsubscribe { name, reply } => {
                let _ = reply.send(self.unsubscribe(&name));
            }
            Command::SetNamespaces { names } => {
                let specs = self.registry.set_namespaces(names);
                debug!(
                    namespaces = ?self.registry.namespaces(),
                    new_channels = specs.len(),
                    "namespaces updated"
                );
                self.open_channels(specs);
            }
            Command::SetCatalog { entries } => {
                debug!(entries = entries.len(), "endpoint catalog replaced");
                self.registry.set_catalog(entries);
            }
            Command::Status { reply } => {
                let _ = reply.send(self.status());
            }
            Command::Dispose { .. } => {}
        }
    }

    fn handle_signal(&mut self, signal: Signal) {
        match signal {
            Signal::ControlOpened { epoch, outbound } => self.on_control_open(epoch, outbound),
            Signal::ControlFrame { epoch, text } => self.on_control_frame(epoch, &text),
            Signal::ControlClosed { epoch, reason } => self.on_control_closed(epoch, &reason),
            Signal::Frame { key, id, message } => self.on_frame(key, id, message),
            Signal::ChannelEnded { key, id, outcome } => {
                if self.channels.finished(&key, id) {
                    debug!(channel = %key, ?outcome, "data channel ended");
                }
            }
            Signal::AckDue { stream, ticket } => {
                let desired = self.registry.is_desired(&stream);
                if self.scheduler.fire(&stream, ticket, Instant::now(), desired)
                    && !self.control.send(&ClientMessage::next(&stream))
                {
                    debug!(stream = %stream, "deferred ack skipped, control channel not open");
                }
            }
            Signal::ReconnectDue { generation } => {
                if self.supervisor.take_due(generation) {
                    info!(generation, "reconnecting control channel");
                    self.start_connect();
                }
            }
        }
    }

    fn start_connect(&mut self) {
        let Some((epoch, cancel)) = self.control.begin_connect() else {
            debug!(state = ?self.control.state(), "connect ignored, already active");
            return;
        };
        debug!(epoch, "connecting control channel");
        let task = ControlTask {
            epoch,
            path: self.config.control_path.clone(),
            credentials: self.credentials.clone(),
            transport: self.control_transport.clone(),
            signals: self.signals.clone(),
            cancel,
        };
        self.control.attach_task(tokio::spawn(task.run()));
    }

    fn on_control_open(&mut self, epoch: u64, outbound: mpsc::UnboundedSender<String>) {
        if !self.control.on_open(epoch, outbound) {
            debug!(epoch, "ignoring open from stale control connection");
            return;
        }
        self.supervisor.on_connected();
        self.registry.auto_activate();
        for name in self.registry.desired_names() {
            self.acknowledge(&name);
        }
    }

    fn on_control_frame(&mut self, epoch: u64, text: &str) {
        if !self.control.is_current(epoch) {
            return;
        }
        match ServerMessage::decode(text) {
            Ok(ServerMessage::Register { client }) => self.on_register(epoch, client),
            Ok(ServerMessage::Other { kind, .. }) => {
                debug!(kind = kind.as_deref().unwrap_or("-"), "control frame");
            }
            Err(e) => warn!(error = %e, "dropping malformed control frame"),
        }
    }

    fn on_register(&mut self, epoch: u64, client: String) {
        if !self.control.on_register(epoch, client) {
            debug!(epoch, "ignoring repeated registration");
            return;
        }
        info!(
            epoch,
            client = self.control.event_client_id().unwrap_or_default(),
            "registered"
        );
        for name in self.registry.auto_activate() {
            self.acknowledge(&name);
        }
        let specs = self.registry.all_channel_specs();
        self.open_channels(specs);
    }

    fn on_control_closed(&mut self, epoch: u64, reason: &str) {
        if !self.control.is_current(epoch) {
            return;
        }
        warn!(epoch, reason, "control channel closed");
        drop(self.channels.cancel_all());
        self.control.reset();
        match self.supervisor.on_failure(&self.signals) {
            Some(delay) => info!(
                delay_ms = delay.as_millis() as u64,
                attempt = self.supervisor.attempts(),
                "reconnect scheduled"
            ),
            None => debug!("no reconnect scheduled"),
        }
    }

    fn on_frame(&mut self, key: ChannelKey, id: u64, message: Value) {
        if !self.channels.is_current(&key, id) {
            trace!(channel = %key, id, "dropping frame from closed channel");
            return;
        }
        let stream = key.stream;
        self.feed.publish(StreamEvent {
            stream: stream.clone(),
            namespace: key.namespace,
            message,
        });
        self.acknowledge(&stream);
    }

    /// Sends or schedules a `next` for `stream`, respecting the ack interval.
    fn acknowledge(&mut self, stream: &str) {
        if !self.control.state().is_open() {
            return;
        }
        match self.scheduler.on_frame(stream, Instant::now()) {
            AckDecision::SendNow => {
                self.control.send(&ClientMessage::next(stream));
            }
            AckDecision::Schedule { delay, ticket } => {
                let signals = self.signals.clone();
                let stream = stream.to_string();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = signals.send(Signal::AckDue { stream, ticket });
                });
            }
            AckDecision::Coalesced => {}
        }
    }

    /// Requests data for a newly desired stream and opens its channels.
    fn activate(&mut self, name: &str) {
        self.acknowledge(name);
        let specs = self.registry.channel_specs_for(name);
        self.open_channels(specs);
    }

    fn open_channels(&mut self, specs: Vec<ChannelSpec>) {
        let Some(ctx) = self.channel_context() else {
            return;
        };
        for spec in specs {
            self.channels.open(spec, &ctx);
        }
    }

    fn channel_context(&self) -> Option<ChannelContext> {
        if self.control.state() != ControlState::Registered {
            return None;
        }
        let event_client = self.control.event_client_id()?.to_string();
        Some(ChannelContext {
            epoch: self.control.epoch(),
            event_client,
            credentials: self.credentials.clone(),
            transport: self.stream_transport.clone(),
            retry: self.config.retry.clone(),
            default_accept: self.config.default_accept.clone(),
            signals: self.signals.clone(),
        })
    }

    fn unsubscribe(&mut self, name: &str) -> bool {
        let existed = self.registry.unsubscribe(name);
        let cancelled = self.channels.cancel_stream(name);
        self.scheduler.forget(name);
        if existed && self.control.send(&ClientMessage::close(name)) {
            debug!(stream = %name, cancelled, "sent close");
        }
        existed
    }

    async fn disconnect(&mut self, clear: bool) {
        info!(clear, "disconnecting");
        self.supervisor.disarm();
        drop(self.channels.cancel_all());
        self.control.shutdown().await;
        if clear {
            self.registry.clear();
            self.scheduler.clear();
        }
    }

    async fn dispose(&mut self) {
        info!("disposing engine");
        self.supervisor.dispose();
        let tasks = self.channels.cancel_all();
        self.control.shutdown().await;
        self.feed.close();

        let aborts: Vec<_> = tasks.iter().map(|task| task.abort_handle()).collect();
        let settle = futures_util::future::join_all(tasks);
        if tokio::time::timeout(self.config.shutdown_timeout, settle)
            .await
            .is_err()
        {
            warn!(
                remaining = aborts.len(),
                "data channels did not settle in time, aborting"
            );
            for abort in aborts {
                abort.abort();
            }
        }
    }

    fn status(&self) -> EngineStatus {
        EngineStatus {
            state: self.control.state(),
            event_client_id: self.control.event_client_id().map(str::to_string),
            channels: self.channels.keys(),
            desired: self.registry.desired_names(),
            namespaces: self.registry.namespaces().iter().cloned().collect(),
            reconnect_attempts: self.supervisor.attempts(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::StaticCredentials;
    use crate::transport::{MockControlTransport, MockStreamTransport};

    fn task(signals: mpsc::UnboundedSender<Signal>) -> EngineTask {
        EngineTask::new(
            EngineConfig::default(),
            Arc::new(StaticCredentials::new("https://edge.local", "token")),
            Arc::new(MockControlTransport::new()),
            Arc::new(MockStreamTransport::new()),
            EventFeed::new(),
            signals,
        )
    }

    #[tokio::test]
    async fn waiting_signal_is_not_starved_by_a_command_flood() {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        let mut task = task(signals_tx.clone());

        let (epoch, _cancel) = task.control.begin_connect().expect("idle control channel");
        let (outbound, _wire) = mpsc::unbounded_channel();
        signals_tx
            .send(Signal::ControlOpened { epoch, outbound })
            .unwrap();

        let mut replies = Vec::new();
        for _ in 0..COMMAND_BURST * 3 {
            let (reply, rx) = oneshot::channel();
            commands_tx.send(Command::Status { reply }).unwrap();
            replies.push(rx);
        }
        let (done, disposed) = oneshot::channel();
        commands_tx.send(Command::Dispose { done }).unwrap();

        task.run(commands_rx, signals_rx).await;
        disposed.await.unwrap();

        let mut states = Vec::new();
        for rx in replies {
            states.push(rx.await.unwrap().state);
        }
        // Commands go first, but the open is handled after one burst.
        assert!(states[..COMMAND_BURST]
            .iter()
            .all(|state| *state == ControlState::Connecting));
        assert!(states[COMMAND_BURST..]
            .iter()
            .all(|state| *state == ControlState::Open));
    }
}
