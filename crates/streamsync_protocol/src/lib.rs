//! # Streamsync Protocol
//!
//! Wire types shared by the streamsync engine.
//!
//! This crate provides:
//! - Control-channel messages (`next`, `close`, `register`)
//! - Logical stream catalog entries
//! - The reserved-stream requirement table
//! - Newline-delimited frame decoding for data channels
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod catalog;
mod error;
mod frame;
mod messages;
mod requirements;

pub use catalog::{LogicalStream, NAMESPACE_PLACEHOLDER};
pub use error::{ProtocolError, ProtocolResult};
pub use frame::{parse_body, parse_frame, LineDecoder};
pub use messages::{ClientMessage, ServerMessage};
pub use requirements::{StreamParams, StreamRequirement, StreamRequirements};
