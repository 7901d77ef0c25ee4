//! # Streamsync Engine
//!
//! Client-side streaming synchronization engine.
//!
//! This crate provides:
//! - A control channel (WebSocket) carrying registration and flow control
//! - Data channels (HTTP event streams), one per logical stream and namespace
//! - Per-stream acknowledgement debouncing
//! - Reconnect supervision after control-channel failures
//! - Credential refresh on expired tokens
//! - Mock transports for testing without sockets
//!
//! ## Architecture
//!
//! The engine is split into a cheap, cloneable handle and a single task that
//! owns all mutable state:
//! 1. The handle turns consumer calls into commands
//! 2. Background tasks report connection events back as signals
//! 3. The engine task applies both, one at a time, to the stream registry
//!    and the set of open channels
//!
//! ## Key Invariants
//!
//! - At most one data channel exists per stream key
//! - Registration precedes every data channel of a connection epoch
//! - Frames of one stream reach consumers in arrival order
//! - Frames from a cancelled channel never reach consumers
//! - Two `next` sends for one stream are at least the ack interval apart
//! - Reserved streams are only opened with their required parameters

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod control;
mod credentials;
mod data_channel;
mod engine;
mod error;
mod feed;
mod flow;
mod http;
mod registry;
mod supervisor;
mod transport;

pub use config::{EngineConfig, RetryConfig, ENV_ACK_INTERVAL_MS, ENV_RECONNECT_DELAY_MS};
pub use control::{control_url, ControlState};
pub use credentials::{CredentialProvider, StaticCredentials};
pub use engine::{EngineBuilder, EngineStatus, StreamingEngine};
pub use error::{EngineError, EngineResult};
pub use feed::{EventFeed, EventReceiver, StreamEvent};
pub use flow::{AckDecision, AckScheduler};
pub use http::{request_url, HttpStreamTransport, WebSocketControlTransport, WebSocketOptions};
pub use registry::{ChannelKey, ChannelSpec, QueryChange, StreamRegistry};
pub use transport::{
    ControlConnection, ControlRequest, ControlTransport, MockControlPeer, MockControlTransport,
    MockResponse, MockStreamTransport, StreamRequest, StreamResponse, StreamTransport,
};

pub use streamsync_protocol::{ClientMessage, LogicalStream, StreamParams, StreamRequirements};
