//! The node facade: one peer model, one discovery state machine and one
//! connection state machine, driven together.

use std::sync::{Arc, Weak};

use peerlink_discovery::{
    DiscoveryEvent, DiscoveryManager, DiscoveryMode, DiscoveryState, LocalPeer, PeerModel,
};
use peerlink_radio::{Radio, Radios};
use peerlink_types::{BluetoothAddress, Listener, PeerIdentity, PeerProperties};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::Config;
use crate::connection::{ConnectionEvent, ConnectionManager};
use crate::error::{ConnectionError, NodeError};
use crate::state::ConnectionState;

/// Snapshot of the node, published on every change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NodeStatus {
    pub discovery: DiscoveryState,
    pub connection: ConnectionState,
    pub peers: usize,
    pub local_address: Option<BluetoothAddress>,
}

#[derive(Debug)]
pub enum NodeEvent {
    Discovery(DiscoveryEvent),
    Connection(ConnectionEvent),
}

struct StatusPublisher {
    tx: watch::Sender<NodeStatus>,
    peer_model: Arc<PeerModel>,
    discovery: Weak<DiscoveryManager>,
    connections: Weak<ConnectionManager>,
}

impl StatusPublisher {
    fn refresh(&self) {
        let (Some(discovery), Some(connections)) =
            (self.discovery.upgrade(), self.connections.upgrade())
        else {
            return;
        };
        let status = NodeStatus {
            discovery: discovery.state(),
            connection: connections.state(),
            peers: self.peer_model.len(),
            local_address: discovery.local_bluetooth_address(),
        };
        self.tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }
}

pub struct Node {
    config: Config,
    peer_model: Arc<PeerModel>,
    discovery: Arc<DiscoveryManager>,
    connections: Arc<ConnectionManager>,
    status: Arc<StatusPublisher>,
    discovery_listener: Listener<DiscoveryEvent>,
    pump: JoinHandle<()>,
}

impl Node {
    /// Build a stopped node on `radios`. Must be called within a Tokio
    /// runtime.
    pub fn new(
        config: Config,
        peer_id: impl Into<String>,
        radios: Radios,
    ) -> Result<(Self, mpsc::UnboundedReceiver<NodeEvent>), NodeError> {
        let peer_id = peer_id.into();
        let peer_model = PeerModel::new(config.discovery.peer_expiration());
        let local = LocalPeer {
            id: peer_id.clone(),
            name: config.identity.name.clone(),
            extra_information: config.identity.extra_information,
        };
        let discovery = DiscoveryManager::new(
            radios.clone(),
            config.discovery.clone(),
            local,
            Arc::clone(&peer_model),
        )?;
        let identity = PeerIdentity::new(
            peer_id,
            config.identity.name.clone(),
            discovery
                .local_bluetooth_address()
                .unwrap_or(BluetoothAddress::UNKNOWN),
        );
        let (connections, mut connection_rx) =
            ConnectionManager::new(radios, config.connection.clone(), identity);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (status_tx, _) = watch::channel(NodeStatus::default());
        let status = Arc::new(StatusPublisher {
            tx: status_tx,
            peer_model: Arc::clone(&peer_model),
            discovery: Arc::downgrade(&discovery),
            connections: Arc::downgrade(&connections),
        });

        let discovery_listener: Listener<DiscoveryEvent> = {
            let status = Arc::clone(&status);
            let connections = Arc::downgrade(&connections);
            let events_tx = events_tx.clone();
            Arc::new(move |event: &DiscoveryEvent| {
                if let DiscoveryEvent::BluetoothAddressResolved(address) = event {
                    if let Some(connections) = connections.upgrade() {
                        connections.set_local_bluetooth_address(*address);
                    }
                }
                status.refresh();
                let _ = events_tx.send(NodeEvent::Discovery(event.clone()));
            })
        };
        discovery.add_listener(&discovery_listener)?;

        let pump = {
            let status = Arc::clone(&status);
            tokio::spawn(async move {
                while let Some(event) = connection_rx.recv().await {
                    status.refresh();
                    if events_tx.send(NodeEvent::Connection(event)).is_err() {
                        break;
                    }
                }
            })
        };

        status.refresh();
        Ok((
            Self {
                config,
                peer_model,
                discovery,
                connections,
                status,
                discovery_listener,
                pump,
            },
            events_rx,
        ))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn peer_model(&self) -> &Arc<PeerModel> {
        &self.peer_model
    }

    pub fn discovery(&self) -> &Arc<DiscoveryManager> {
        &self.discovery
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    pub fn peers(&self) -> Vec<PeerProperties> {
        self.peer_model.peers()
    }

    /// Subscribe to status snapshots.
    pub fn status(&self) -> watch::Receiver<NodeStatus> {
        self.status.tx.subscribe()
    }

    /// Start discovery in the configured mode and, if configured, the
    /// listener.
    pub fn start(&self) -> Result<NodeStatus, NodeError> {
        self.start_with_mode(self.config.discovery.mode)
    }

    pub fn start_with_mode(&self, mode: DiscoveryMode) -> Result<NodeStatus, NodeError> {
        info!(?mode, listen = self.config.node.listen, "starting node");
        let result = self.discovery.start(mode);
        if self.config.node.listen {
            self.connections.start_listening()?;
        }
        result?;
        self.status.refresh();
        Ok(*self.status.tx.borrow())
    }

    pub fn stop(&self) {
        info!("stopping node");
        self.discovery.stop();
        self.connections.stop_listening();
        self.status.refresh();
    }

    pub fn connect(&self, peer: &PeerProperties) -> Result<(), ConnectionError> {
        self.connections.connect(peer)
    }

    /// Connect to a known peer by id.
    pub fn connect_to(&self, peer_id: &str) -> Result<(), ConnectionError> {
        let peer = self
            .peer_model
            .find_by_id(peer_id)
            .ok_or_else(|| ConnectionError::InvalidPeer(format!("unknown peer {peer_id}")))?;
        self.connections.connect(&peer)
    }

    pub fn cancel_connection_attempt(&self, peer: &PeerProperties) -> Result<bool, ConnectionError> {
        self.connections.cancel_connection_attempt(peer)
    }

    /// Forward a platform radio event to both state machines.
    pub fn on_radio_state_changed(&self, radio: Radio, enabled: bool) {
        self.discovery.on_radio_state_changed(radio, enabled);
        self.connections.on_radio_state_changed(radio, enabled);
        self.status.refresh();
    }

    /// Stop everything. Connection events stop being delivered immediately.
    pub fn shutdown(&self) {
        info!("shutting down node");
        self.connections.shutdown();
        self.discovery.stop();
        self.status.refresh();
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.discovery.remove_listener(&self.discovery_listener);
        self.pump.abort();
    }
}
