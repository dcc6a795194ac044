//! The connection state machine.
//!
//! [`ConnectionManager`] owns the incoming-connection listener and the pool
//! of outgoing attempts. Socket I/O (listen, accept, connect and the
//! identity handshake) runs on worker tasks which report back through a
//! channel; every state change happens under the manager's lock.
//!
//! Events are delivered on the channel returned by
//! [`ConnectionManager::new`], after the transition that caused them has
//! been committed. Once [`ConnectionManager::shutdown`] has been called no
//! further events are delivered.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use peerlink_discovery::Timer;
use peerlink_protocol::{handshake_initiator, handshake_responder};
use peerlink_radio::{BluetoothSockets, BoxedStream, Radio, Radios};
use peerlink_types::{BluetoothAddress, PeerIdentity, PeerProperties};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::ConnectionSettings;
use crate::error::ConnectionError;
use crate::state::ConnectionState;

/// An open connection, handshaken if the handshake is required.
pub struct Connection {
    pub stream: BoxedStream,
    /// Accepted by our listener rather than dialled by us.
    pub incoming: bool,
    pub peer: PeerProperties,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("incoming", &self.incoming)
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub enum ConnectionEvent {
    StateChanged(ConnectionState),
    /// An outgoing attempt started. `attempt` counts from 1.
    Connecting { peer: PeerProperties, attempt: u32 },
    Connected(Connection),
    /// One outgoing attempt failed. Followed by the next `Connecting` or by
    /// `ConnectionFailed`.
    AttemptFailed {
        peer: PeerProperties,
        attempt: u32,
        reason: String,
    },
    /// One outgoing attempt hit the connection timeout. Followed by the next
    /// `Connecting` or by `ConnectionFailed`.
    ConnectionTimeout { peer: PeerProperties, attempt: u32 },
    /// Every attempt for `peer` has failed.
    ConnectionFailed { peer: PeerProperties, reason: String },
    /// An accepted socket failed its handshake and was closed.
    IncomingFailed {
        address: BluetoothAddress,
        reason: String,
    },
    ListenerStarted,
    ListenerFailed { reason: String, will_restart: bool },
    /// A listener stop requested earlier has completed.
    ListenerStopped,
}

enum WorkerMessage {
    Outgoing {
        peer_id: String,
        serial: u64,
        result: Result<Connection, ConnectionError>,
    },
    ListenerUp {
        generation: u64,
    },
    /// The listener task ended; `error` is `None` when it was asked to stop.
    ListenerDown {
        generation: u64,
        error: Option<String>,
    },
    Accepted {
        generation: u64,
        stream: BoxedStream,
        address: BluetoothAddress,
    },
    Incoming {
        serial: u64,
        address: BluetoothAddress,
        result: Result<Connection, ConnectionError>,
    },
}

struct Attempt {
    peer: PeerProperties,
    number: u32,
    serial: u64,
    started_at: Instant,
    task: JoinHandle<()>,
    timer: Timer,
}

impl Attempt {
    fn abort(&mut self) {
        self.timer.cancel();
        self.task.abort();
    }
}

struct ListenerHandle {
    generation: u64,
    stop: oneshot::Sender<()>,
}

#[derive(Default)]
struct Inner {
    state: ConnectionState,
    /// Listening was requested and not yet stopped or given up.
    listening: bool,
    listener: Option<ListenerHandle>,
    listener_generation: u64,
    /// Generation of a listener whose stop has not been confirmed yet.
    stopping: Option<u64>,
    listener_failures: u32,
    listener_restart: Timer,
    attempts: HashMap<String, Attempt>,
    handshakes: HashMap<u64, JoinHandle<()>>,
    next_serial: u64,
}

impl Inner {
    fn serial(&mut self) -> u64 {
        self.next_serial += 1;
        self.next_serial
    }
}

pub struct ConnectionManager {
    radios: Radios,
    settings: ConnectionSettings,
    local: Mutex<PeerIdentity>,
    inner: Mutex<Inner>,
    shutting_down: AtomicBool,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    worker_tx: mpsc::UnboundedSender<WorkerMessage>,
    pump: JoinHandle<()>,
    me: Weak<ConnectionManager>,
}

impl ConnectionManager {
    /// Create a stopped manager presenting `local` in handshakes. Must be
    /// called within a Tokio runtime.
    pub fn new(
        radios: Radios,
        settings: ConnectionSettings,
        local: PeerIdentity,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (worker_tx, mut worker_rx) = mpsc::unbounded_channel();
        let manager = Arc::new_cyclic(|me: &Weak<Self>| {
            let pump = {
                let me = me.clone();
                tokio::spawn(async move {
                    while let Some(message) = worker_rx.recv().await {
                        let Some(manager) = me.upgrade() else { break };
                        manager.on_worker_message(message);
                    }
                })
            };
            Self {
                radios,
                settings,
                local: Mutex::new(local),
                inner: Mutex::new(Inner::default()),
                shutting_down: AtomicBool::new(false),
                events,
                worker_tx,
                pump,
                me: me.clone(),
            }
        });
        (manager, events_rx)
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    pub fn local_identity(&self) -> PeerIdentity {
        self.local.lock().clone()
    }

    /// Announce `address` in handshakes from now on.
    pub fn set_local_bluetooth_address(&self, address: BluetoothAddress) {
        self.local.lock().bluetooth_address = address.to_string();
    }

    pub fn is_connecting(&self, peer: &PeerProperties) -> bool {
        self.inner.lock().attempts.contains_key(&peer.id)
    }

    pub fn pending_attempts(&self) -> usize {
        self.inner.lock().attempts.len()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Start accepting incoming connections.
    ///
    /// With Bluetooth off the manager waits for it; see
    /// [`on_radio_state_changed`](Self::on_radio_state_changed). Fails while
    /// the previous listener is still being torn down.
    pub fn start_listening(&self) -> Result<ConnectionState, ConnectionError> {
        let mut events = Vec::new();
        let result = {
            let mut inner = self.inner.lock();
            if self.is_shutting_down() {
                return Err(ConnectionError::ShuttingDown);
            }
            if inner.stopping.is_some() {
                return Err(ConnectionError::ListenerStopping);
            }
            if !inner.listening {
                info!("starting listener");
                inner.listening = true;
                inner.listener_failures = 0;
                self.reconcile_listener(&mut inner, &mut events);
            }
            Ok(inner.state)
        };
        self.dispatch(events);
        result
    }

    /// Stop accepting incoming connections. Completion is reported with
    /// [`ConnectionEvent::ListenerStopped`]; once the listener task confirms,
    /// or right away when no task is running (e.g. a restart is pending).
    pub fn stop_listening(&self) {
        let mut events = Vec::new();
        {
            let mut inner = self.inner.lock();
            if !inner.listening && inner.listener.is_none() {
                return;
            }
            info!("stopping listener");
            inner.listening = false;
            inner.listener_restart.cancel();
            Self::close_listener(&mut inner);
            if inner.stopping.is_none() {
                events.push(ConnectionEvent::ListenerStopped);
            }
            Self::set_state(&mut inner, ConnectionState::NotStarted, &mut events);
        }
        self.dispatch(events);
    }

    /// Connect to `peer` over Bluetooth, retrying up to the configured
    /// number of attempts.
    pub fn connect(&self, peer: &PeerProperties) -> Result<(), ConnectionError> {
        if peer.id.is_empty() {
            return Err(ConnectionError::InvalidPeer("peer has an empty id".to_string()));
        }
        if !peer.bluetooth_address.is_usable() {
            return Err(ConnectionError::InvalidPeer(format!(
                "{} has no known Bluetooth address",
                peer.id
            )));
        }
        if self.is_shutting_down() {
            return Err(ConnectionError::ShuttingDown);
        }
        if !self.radios.is_enabled(Radio::Bluetooth) {
            return Err(ConnectionError::RadioDisabled);
        }
        let mut events = Vec::new();
        {
            let mut inner = self.inner.lock();
            if inner.attempts.contains_key(&peer.id) {
                return Err(ConnectionError::AlreadyConnecting(peer.id.clone()));
            }
            self.begin_attempt(&mut inner, peer.clone(), 1, &mut events);
        }
        self.dispatch(events);
        Ok(())
    }

    /// Abandon the in-flight attempt for `peer`. Returns whether there was
    /// one.
    pub fn cancel_connection_attempt(&self, peer: &PeerProperties) -> Result<bool, ConnectionError> {
        if peer.id.is_empty() {
            return Err(ConnectionError::InvalidPeer("peer has an empty id".to_string()));
        }
        let mut inner = self.inner.lock();
        match inner.attempts.remove(&peer.id) {
            Some(mut attempt) => {
                attempt.abort();
                info!(peer = %peer.id, attempt = attempt.number, "connection attempt cancelled");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// React to a radio being switched on or off.
    ///
    /// Disabling Bluetooth fails every outstanding attempt and closes the
    /// listener; enabling it reopens the listener if listening was
    /// requested.
    pub fn on_radio_state_changed(&self, radio: Radio, enabled: bool) {
        if radio != Radio::Bluetooth {
            return;
        }
        let mut events = Vec::new();
        {
            let mut inner = self.inner.lock();
            info!(%radio, enabled, "radio state changed");
            if enabled {
                inner.listener_failures = 0;
            } else {
                for (_, mut attempt) in inner.attempts.drain() {
                    attempt.abort();
                    events.push(ConnectionEvent::ConnectionFailed {
                        peer: attempt.peer,
                        reason: "Bluetooth was disabled".to_string(),
                    });
                }
            }
            if inner.listening {
                self.reconcile_listener(&mut inner, &mut events);
            }
        }
        self.dispatch(events);
    }

    /// Close everything and suppress all further events.
    pub fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("shutting down connections");
        let mut inner = self.inner.lock();
        inner.listening = false;
        inner.listener_restart.cancel();
        Self::close_listener(&mut inner);
        for (_, mut attempt) in inner.attempts.drain() {
            attempt.abort();
        }
        for (_, task) in inner.handshakes.drain() {
            task.abort();
        }
        inner.state = ConnectionState::NotStarted;
    }

    // -- Listener ---------------------------------------------------------

    fn reconcile_listener(&self, inner: &mut Inner, events: &mut Vec<ConnectionEvent>) {
        if !self.radios.is_enabled(Radio::Bluetooth) {
            inner.listener_restart.cancel();
            Self::close_listener(inner);
            Self::set_state(inner, ConnectionState::WaitingForRadiosEnabled, events);
            return;
        }
        if inner.listener.is_none() && !inner.listener_restart.is_armed() {
            self.open_listener(inner);
        }
        Self::set_state(inner, ConnectionState::Running, events);
    }

    fn open_listener(&self, inner: &mut Inner) {
        inner.listener_generation += 1;
        let generation = inner.listener_generation;
        let (stop, stop_rx) = oneshot::channel();
        tokio::spawn(run_listener(
            Arc::clone(&self.radios.sockets),
            self.settings.clone(),
            generation,
            stop_rx,
            self.worker_tx.clone(),
        ));
        debug!(generation, "listener task spawned");
        inner.listener = Some(ListenerHandle { generation, stop });
    }

    /// Ask the listener task to close. Its confirmation clears `stopping`.
    fn close_listener(inner: &mut Inner) {
        if let Some(handle) = inner.listener.take() {
            if handle.stop.send(()).is_ok() {
                inner.stopping = Some(handle.generation);
            }
        }
    }

    fn on_listener_down(
        &self,
        inner: &mut Inner,
        generation: u64,
        error: Option<String>,
        events: &mut Vec<ConnectionEvent>,
    ) {
        if inner.stopping == Some(generation) {
            debug!(generation, "listener stopped");
            inner.stopping = None;
            events.push(ConnectionEvent::ListenerStopped);
            return;
        }
        if inner.listener.as_ref().map(|l| l.generation) != Some(generation) {
            return;
        }
        inner.listener = None;
        let reason = error.unwrap_or_else(|| "listener closed".to_string());
        inner.listener_failures += 1;
        let failures = inner.listener_failures;
        let limit = self.settings.max_consecutive_listener_failures;

        if failures > limit {
            warn!(failures, %reason, "listener keeps failing, giving up");
            inner.listening = false;
            events.push(ConnectionEvent::ListenerFailed {
                reason,
                will_restart: false,
            });
            Self::set_state(inner, ConnectionState::NotStarted, events);
            return;
        }

        warn!(failures, %reason, "listener failed, restarting");
        events.push(ConnectionEvent::ListenerFailed {
            reason,
            will_restart: true,
        });
        let me = self.me.clone();
        inner
            .listener_restart
            .arm(self.settings.listener_restart_delay(), move |generation| {
                if let Some(manager) = me.upgrade() {
                    manager.on_listener_restart(generation);
                }
            });
    }

    fn on_listener_restart(&self, generation: u64) {
        let mut events = Vec::new();
        {
            let mut inner = self.inner.lock();
            if !inner.listener_restart.fire(generation) || !inner.listening {
                return;
            }
            debug!("restarting listener");
            self.reconcile_listener(&mut inner, &mut events);
        }
        self.dispatch(events);
    }

    fn on_accepted(
        &self,
        inner: &mut Inner,
        stream: BoxedStream,
        address: BluetoothAddress,
    ) -> Option<ConnectionEvent> {
        if !self.settings.handshake_required {
            info!(%address, "incoming connection");
            return Some(ConnectionEvent::Connected(Connection {
                stream,
                incoming: true,
                peer: PeerProperties::from_bluetooth_address(address),
            }));
        }
        let serial = inner.serial();
        let local = self.local_identity();
        let deadline = self.settings.handshake_timeout();
        let tx = self.worker_tx.clone();
        debug!(%address, "incoming connection, awaiting handshake");
        let task = tokio::spawn(async move {
            let result = accept_incoming(stream, address, &local, deadline).await;
            let _ = tx.send(WorkerMessage::Incoming {
                serial,
                address,
                result,
            });
        });
        inner.handshakes.insert(serial, task);
        None
    }

    // -- Outgoing ---------------------------------------------------------

    fn begin_attempt(
        &self,
        inner: &mut Inner,
        peer: PeerProperties,
        number: u32,
        events: &mut Vec<ConnectionEvent>,
    ) {
        let serial = inner.serial();
        let task = {
            let sockets = Arc::clone(&self.radios.sockets);
            let settings = self.settings.clone();
            let local = self.local_identity();
            let target = peer.clone();
            let tx = self.worker_tx.clone();
            tokio::spawn(async move {
                let peer_id = target.id.clone();
                let result = connect_outgoing(sockets.as_ref(), &settings, &local, target).await;
                let _ = tx.send(WorkerMessage::Outgoing {
                    peer_id,
                    serial,
                    result,
                });
            })
        };

        let mut timer = Timer::new();
        let timeout = self.settings.connection_timeout();
        if !timeout.is_zero() {
            let me = self.me.clone();
            let peer_id = peer.id.clone();
            timer.arm(timeout, move |generation| {
                if let Some(manager) = me.upgrade() {
                    manager.on_attempt_timeout(&peer_id, serial, generation);
                }
            });
        }

        debug!(peer = %peer.id, address = %peer.bluetooth_address, attempt = number, "connecting");
        events.push(ConnectionEvent::Connecting {
            peer: peer.clone(),
            attempt: number,
        });
        inner.attempts.insert(
            peer.id.clone(),
            Attempt {
                peer,
                number,
                serial,
                started_at: Instant::now(),
                task,
                timer,
            },
        );
    }

    /// Start the next attempt, or report the final failure.
    fn retry_or_fail(
        &self,
        inner: &mut Inner,
        attempt: Attempt,
        reason: String,
        events: &mut Vec<ConnectionEvent>,
    ) {
        let max = self.settings.max_attempts();
        if attempt.number < max && self.radios.is_enabled(Radio::Bluetooth) {
            self.begin_attempt(inner, attempt.peer, attempt.number + 1, events);
        } else {
            warn!(peer = %attempt.peer.id, attempts = attempt.number, %reason, "connection failed");
            events.push(ConnectionEvent::ConnectionFailed {
                peer: attempt.peer,
                reason,
            });
        }
    }

    fn on_attempt_timeout(&self, peer_id: &str, serial: u64, generation: u64) {
        let mut events = Vec::new();
        {
            let mut inner = self.inner.lock();
            let Some(attempt) = inner.attempts.get_mut(peer_id) else {
                return;
            };
            if attempt.serial != serial || !attempt.timer.fire(generation) {
                return;
            }
            let Some(attempt) = inner.attempts.remove(peer_id) else {
                return;
            };
            attempt.task.abort();
            warn!(peer = %peer_id, attempt = attempt.number, "connection attempt timed out");
            events.push(ConnectionEvent::ConnectionTimeout {
                peer: attempt.peer.clone(),
                attempt: attempt.number,
            });
            self.retry_or_fail(&mut inner, attempt, "connection timed out".to_string(), &mut events);
        }
        self.dispatch(events);
    }

    fn on_outgoing(
        &self,
        inner: &mut Inner,
        peer_id: &str,
        serial: u64,
        result: Result<Connection, ConnectionError>,
        events: &mut Vec<ConnectionEvent>,
    ) {
        if inner.attempts.get(peer_id).map(|a| a.serial) != Some(serial) {
            debug!(peer = %peer_id, "dropping result of abandoned attempt");
            return;
        }
        let Some(mut attempt) = inner.attempts.remove(peer_id) else {
            return;
        };
        attempt.timer.cancel();
        match result {
            Ok(connection) => {
                info!(
                    peer = %peer_id,
                    attempt = attempt.number,
                    elapsed_ms = attempt.started_at.elapsed().as_millis(),
                    "connected"
                );
                events.push(ConnectionEvent::Connected(connection));
            }
            Err(e) => {
                debug!(peer = %peer_id, attempt = attempt.number, error = %e, "connection attempt failed");
                let reason = e.to_string();
                events.push(ConnectionEvent::AttemptFailed {
                    peer: attempt.peer.clone(),
                    attempt: attempt.number,
                    reason: reason.clone(),
                });
                self.retry_or_fail(inner, attempt, reason, events);
            }
        }
    }

    // -- Plumbing ---------------------------------------------------------

    fn on_worker_message(&self, message: WorkerMessage) {
        let mut events = Vec::new();
        {
            let mut inner = self.inner.lock();
            match message {
                WorkerMessage::Outgoing {
                    peer_id,
                    serial,
                    result,
                } => self.on_outgoing(&mut inner, &peer_id, serial, result, &mut events),
                WorkerMessage::ListenerUp { generation } => {
                    if inner.listener.as_ref().map(|l| l.generation) == Some(generation) {
                        info!("listening for connections");
                        inner.listener_failures = 0;
                        events.push(ConnectionEvent::ListenerStarted);
                    }
                }
                WorkerMessage::ListenerDown { generation, error } => {
                    self.on_listener_down(&mut inner, generation, error, &mut events);
                }
                WorkerMessage::Accepted {
                    generation,
                    stream,
                    address,
                } => {
                    let current = inner.listener.as_ref().map(|l| l.generation) == Some(generation);
                    if current && !self.is_shutting_down() {
                        events.extend(self.on_accepted(&mut inner, stream, address));
                    }
                }
                WorkerMessage::Incoming {
                    serial,
                    address,
                    result,
                } => {
                    if inner.handshakes.remove(&serial).is_some() {
                        match result {
                            Ok(connection) => {
                                info!(peer = %connection.peer.id, %address, "incoming connection");
                                events.push(ConnectionEvent::Connected(connection));
                            }
                            Err(e) => {
                                warn!(%address, error = %e, "incoming handshake failed");
                                events.push(ConnectionEvent::IncomingFailed {
                                    address,
                                    reason: e.to_string(),
                                });
                            }
                        }
                    }
                }
            }
        }
        self.dispatch(events);
    }

    fn set_state(inner: &mut Inner, state: ConnectionState, events: &mut Vec<ConnectionEvent>) {
        if inner.state != state {
            info!(from = ?inner.state, to = ?state, "connection state changed");
            inner.state = state;
            events.push(ConnectionEvent::StateChanged(state));
        }
    }

    fn dispatch(&self, events: Vec<ConnectionEvent>) {
        if self.is_shutting_down() {
            return;
        }
        for event in events {
            let _ = self.events.send(event);
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.pump.abort();
        let inner = self.inner.get_mut();
        Self::close_listener(inner);
        for (_, mut attempt) in inner.attempts.drain() {
            attempt.abort();
        }
        for (_, task) in inner.handshakes.drain() {
            task.abort();
        }
    }
}

async fn connect_outgoing(
    sockets: &dyn BluetoothSockets,
    settings: &ConnectionSettings,
    local: &PeerIdentity,
    mut peer: PeerProperties,
) -> Result<Connection, ConnectionError> {
    let mut stream = sockets
        .connect(
            peer.bluetooth_address,
            settings.service_uuid,
            settings.insecure_rfcomm_port,
        )
        .await?;
    if settings.handshake_required {
        let remote = handshake_initiator(&mut stream, local, settings.handshake_timeout()).await?;
        peer.merge_from(&remote.to_peer_properties());
    }
    Ok(Connection {
        stream,
        incoming: false,
        peer,
    })
}

async fn accept_incoming(
    mut stream: BoxedStream,
    address: BluetoothAddress,
    local: &PeerIdentity,
    deadline: Duration,
) -> Result<Connection, ConnectionError> {
    let mut remote = handshake_responder(&mut stream, local, deadline).await?;
    if !remote.bluetooth_address().is_usable() && address.is_usable() {
        remote.bluetooth_address = address.to_string();
    }
    let peer = remote.to_peer_properties();
    Ok(Connection {
        stream,
        incoming: true,
        peer,
    })
}

async fn run_listener(
    sockets: Arc<dyn BluetoothSockets>,
    settings: ConnectionSettings,
    generation: u64,
    mut stop: oneshot::Receiver<()>,
    tx: mpsc::UnboundedSender<WorkerMessage>,
) {
    let opened = tokio::select! {
        result = sockets.listen(
            settings.service_uuid,
            &settings.service_name,
            settings.insecure_rfcomm_port,
        ) => result,
        _ = &mut stop => {
            let _ = tx.send(WorkerMessage::ListenerDown { generation, error: None });
            return;
        }
    };
    let mut listener = match opened {
        Ok(listener) => listener,
        Err(e) => {
            let _ = tx.send(WorkerMessage::ListenerDown {
                generation,
                error: Some(e.to_string()),
            });
            return;
        }
    };
    let _ = tx.send(WorkerMessage::ListenerUp { generation });

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, address)) => {
                    let _ = tx.send(WorkerMessage::Accepted { generation, stream, address });
                }
                Err(e) => {
                    listener.close().await;
                    let _ = tx.send(WorkerMessage::ListenerDown {
                        generation,
                        error: Some(e.to_string()),
                    });
                    return;
                }
            },
            _ = &mut stop => {
                listener.close().await;
                let _ = tx.send(WorkerMessage::ListenerDown { generation, error: None });
                return;
            }
        }
    }
}
