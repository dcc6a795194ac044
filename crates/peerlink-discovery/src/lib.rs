//! Peer discovery for peerlink.
//!
//! - [`PeerModel`]: the deduplicated, merged and expiring set of known peers.
//! - [`DiscoveryManager`]: the BLE / Wi-Fi Direct discovery state machine.
//! - [`AddressResolver`]: the Bluetooth address resolution protocol, letting
//!   a device whose own address is hidden learn it from a neighbour.
//! - [`advertisement`] and [`request_id`]: the BLE payload formats.

pub mod advertisement;
pub mod error;
pub mod manager;
pub mod peer_model;
pub mod request_id;
pub mod resolution;
pub mod settings;
pub mod state;
pub mod timer;
pub mod wifi;

pub use advertisement::{DecodedAdvertisement, PeerAdvertisement};
pub use error::DiscoveryError;
pub use manager::{DiscoveryEvent, DiscoveryManager, LocalPeer};
pub use peer_model::{AddOutcome, PeerModel, PeerModelEvent};
pub use resolution::{AddressResolver, ProviderState, RequesterState, ResolutionEvent};
pub use settings::{AdvertisementDataType, DiscoveryMode, DiscoverySettings};
pub use state::{DiscoveryState, Transport};
pub use timer::Timer;
