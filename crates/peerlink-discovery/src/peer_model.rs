//! The authoritative set of currently known peers.
//!
//! Entries are keyed by peer id. Sightings merge monotonically into the
//! stored record, and entries not seen for longer than the expiration window
//! are removed by a periodic check that runs only while the model is
//! non-empty.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use peerlink_types::{BluetoothAddress, Listener, ListenerError, ListenerRegistry, PeerProperties};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::timer::Timer;

/// Result of [`PeerModel::add_or_update`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Added,
    Updated,
    Unchanged,
}

/// Notifications fired after the corresponding mutation is committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerModelEvent {
    Added(PeerProperties),
    Updated(PeerProperties),
    Expired(PeerProperties),
}

struct Entry {
    peer: PeerProperties,
    last_seen: Instant,
}

struct Inner {
    entries: HashMap<String, Entry>,
    expiry_timer: Timer,
}

pub struct PeerModel {
    inner: Mutex<Inner>,
    expiration: Duration,
    listeners: ListenerRegistry<PeerModelEvent>,
    me: Weak<PeerModel>,
}

impl PeerModel {
    /// Create a model; a zero `expiration` disables expiry.
    pub fn new(expiration: Duration) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                expiry_timer: Timer::new(),
            }),
            expiration,
            listeners: ListenerRegistry::new(),
            me: me.clone(),
        })
    }

    pub fn expiration(&self) -> Duration {
        self.expiration
    }

    pub fn add_listener(&self, listener: &Listener<PeerModelEvent>) -> Result<(), ListenerError> {
        self.listeners.add(listener)
    }

    pub fn remove_listener(&self, listener: &Listener<PeerModelEvent>) -> bool {
        self.listeners.remove(listener)
    }

    /// Record a sighting of `peer`.
    ///
    /// A sighting that knows strictly less than the stored record is
    /// `Unchanged` and does not count as "seen". Any other sighting refreshes
    /// the last-seen time; it is `Updated` only when it fills a gap.
    pub fn add_or_update(&self, peer: PeerProperties) -> AddOutcome {
        let now = Instant::now();
        let (outcome, event) = {
            let mut inner = self.inner.lock();
            let (outcome, event) = match inner.entries.get_mut(&peer.id) {
                None => {
                    let event = PeerModelEvent::Added(peer.clone());
                    inner.entries.insert(
                        peer.id.clone(),
                        Entry {
                            peer,
                            last_seen: now,
                        },
                    );
                    (AddOutcome::Added, Some(event))
                }
                Some(entry) if peer.is_strict_subset_of(&entry.peer) => {
                    (AddOutcome::Unchanged, None)
                }
                Some(entry) => {
                    entry.last_seen = now;
                    if peer.has_more_information(&entry.peer) && entry.peer.merge_from(&peer) {
                        (
                            AddOutcome::Updated,
                            Some(PeerModelEvent::Updated(entry.peer.clone())),
                        )
                    } else {
                        (AddOutcome::Unchanged, None)
                    }
                }
            };
            self.ensure_expiry_armed(&mut inner);
            (outcome, event)
        };

        trace!(?outcome, "peer sighting");
        if let Some(event) = event {
            self.listeners.notify(&event);
        }
        outcome
    }

    /// Remove a peer explicitly. Removing an unknown id is a no-op.
    pub fn remove(&self, peer_id: &str) -> Option<PeerProperties> {
        let mut inner = self.inner.lock();
        let removed = inner.entries.remove(peer_id).map(|entry| entry.peer);
        if inner.entries.is_empty() {
            inner.expiry_timer.cancel();
        }
        removed
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.expiry_timer.cancel();
    }

    pub fn find_by_id(&self, peer_id: &str) -> Option<PeerProperties> {
        self.inner
            .lock()
            .entries
            .get(peer_id)
            .map(|entry| entry.peer.clone())
    }

    pub fn find_by_bluetooth_address(&self, address: BluetoothAddress) -> Option<PeerProperties> {
        if address.is_unknown() {
            return None;
        }
        self.inner
            .lock()
            .entries
            .values()
            .find(|entry| entry.peer.bluetooth_address == address)
            .map(|entry| entry.peer.clone())
    }

    pub fn find_by_wifi_device_address(&self, address: &str) -> Option<PeerProperties> {
        self.inner
            .lock()
            .entries
            .values()
            .find(|entry| entry.peer.wifi_device_address.as_deref() == Some(address))
            .map(|entry| entry.peer.clone())
    }

    pub fn peers(&self) -> Vec<PeerProperties> {
        self.inner
            .lock()
            .entries
            .values()
            .map(|entry| entry.peer.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    pub fn is_expiry_check_armed(&self) -> bool {
        self.inner.lock().expiry_timer.is_armed()
    }

    /// Remove and return every peer unseen for longer than the expiration
    /// window. All removals are committed before any listener is notified.
    pub fn check_expired(&self) -> Vec<PeerProperties> {
        if self.expiration.is_zero() {
            return Vec::new();
        }
        let now = Instant::now();
        let expired = {
            let mut inner = self.inner.lock();
            let stale: Vec<String> = inner
                .entries
                .iter()
                .filter(|(_, entry)| now.duration_since(entry.last_seen) > self.expiration)
                .map(|(id, _)| id.clone())
                .collect();
            let expired: Vec<PeerProperties> = stale
                .iter()
                .filter_map(|id| inner.entries.remove(id))
                .map(|entry| entry.peer)
                .collect();
            if inner.entries.is_empty() {
                inner.expiry_timer.cancel();
            } else {
                self.ensure_expiry_armed(&mut inner);
            }
            expired
        };

        for peer in &expired {
            debug!(peer = %peer.id, "peer expired");
            self.listeners.notify(&PeerModelEvent::Expired(peer.clone()));
        }
        expired
    }

    fn ensure_expiry_armed(&self, inner: &mut Inner) {
        if self.expiration.is_zero() || inner.entries.is_empty() || inner.expiry_timer.is_armed()
        {
            return;
        }
        let me = self.me.clone();
        inner.expiry_timer.arm(self.expiration / 2, move |generation| {
            if let Some(model) = me.upgrade() {
                model.on_expiry_timer(generation);
            }
        });
    }

    fn on_expiry_timer(&self, generation: u64) {
        if !self.inner.lock().expiry_timer.fire(generation) {
            return;
        }
        self.check_expired();
    }
}
