//! Shared types for peerlink.
//!
//! This crate contains the types shared across the peerlink workspace:
//! Bluetooth hardware addresses, the transport-independent peer record,
//! the identity record exchanged during the connection handshake, and the
//! listener table used by every state machine to publish events.

pub mod address;
pub mod identity;
pub mod listener;
pub mod peer;

pub use address::{AddressParseError, BluetoothAddress};
pub use identity::{IdentityError, PeerIdentity};
pub use listener::{Listener, ListenerError, ListenerRegistry};
pub use peer::PeerProperties;
