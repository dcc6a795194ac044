//! Wire protocol for peerlink connections.
//!
//! Connections are plain byte streams (RFCOMM sockets or equivalent). This
//! crate frames messages on them and runs the identity handshake that gates
//! a connection before it is handed to the application.

pub mod error;
pub mod handshake;
pub mod wire;

pub use error::ProtocolError;
pub use handshake::{handshake_initiator, handshake_responder};
pub use wire::{read_frame, write_frame, MAX_FRAME_SIZE};
