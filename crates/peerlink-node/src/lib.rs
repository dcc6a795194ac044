//! Node orchestration for peerlink.
//!
//! Loads configuration and identity, runs the connection state machine and
//! ties it to discovery in the [`Node`] facade.

pub mod config;
pub mod connection;
pub mod error;
pub mod node;
pub mod setup;
pub mod state;

pub use config::{Config, ConnectionSettings};
pub use connection::{Connection, ConnectionEvent, ConnectionManager};
pub use error::{ConnectionError, NodeError};
pub use node::{Node, NodeEvent, NodeStatus};
pub use state::ConnectionState;
