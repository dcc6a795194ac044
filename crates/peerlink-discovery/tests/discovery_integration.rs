//! Integration tests running discovery managers over the in-memory radio.

use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::Duration;

use peerlink_discovery::{
    DiscoveryError, DiscoveryEvent, DiscoveryManager, DiscoveryMode, DiscoverySettings,
    DiscoveryState, LocalPeer, PeerModel, Transport,
};
use peerlink_radio::mock::{MockAir, MockCounters, MockRadio};
use peerlink_radio::Radio;
use peerlink_types::{BluetoothAddress, Listener, ListenerError};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("peerlink_discovery=debug"))
        .with_test_writer()
        .try_init();
}

fn addr(n: u8) -> BluetoothAddress {
    BluetoothAddress::new([0x40, 0, 0, 0, 0, n])
}

struct TestNode {
    radio: Arc<MockRadio>,
    manager: Arc<DiscoveryManager>,
    events: mpsc::UnboundedReceiver<DiscoveryEvent>,
    _listener: Listener<DiscoveryEvent>,
}

fn node(air: &MockAir, n: u8, settings: DiscoverySettings) -> TestNode {
    node_with(air.device(addr(n)), n, settings)
}

fn node_with(radio: Arc<MockRadio>, n: u8, settings: DiscoverySettings) -> TestNode {
    let model = PeerModel::new(settings.peer_expiration());
    let manager = DiscoveryManager::new(
        radio.radios(),
        settings,
        LocalPeer::new(format!("peer-{n}"), format!("device {n}")),
        model,
    )
    .unwrap();

    let (tx, events) = mpsc::unbounded_channel();
    let listener: Listener<DiscoveryEvent> = Arc::new(move |event: &DiscoveryEvent| {
        let _ = tx.send(event.clone());
    });
    manager.add_listener(&listener).unwrap();
    TestNode {
        radio,
        manager,
        events,
        _listener: listener,
    }
}

/// Wait for the first event matching `predicate`, skipping others.
async fn wait_for(
    events: &mut mpsc::UnboundedReceiver<DiscoveryEvent>,
    predicate: impl Fn(&DiscoveryEvent) -> bool,
) -> DiscoveryEvent {
    tokio::time::timeout(Duration::from_secs(120), async {
        loop {
            let event = events.recv().await.expect("event channel closed");
            if predicate(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for discovery event")
}

fn count(counter: &AtomicUsize) -> usize {
    MockCounters::get(counter)
}

#[tokio::test]
async fn start_twice_starts_transports_once() {
    init_tracing();
    let air = MockAir::new();
    let a = node(&air, 1, DiscoverySettings::default());

    assert_eq!(a.manager.start(DiscoveryMode::Ble).unwrap(), DiscoveryState::RunningBle);
    assert!(matches!(
        a.manager.start(DiscoveryMode::Ble),
        Err(DiscoveryError::AlreadyRunning)
    ));
    assert_eq!(count(&a.radio.counters.advertise_starts), 1);
    assert_eq!(count(&a.radio.counters.scan_starts), 1);
    assert!(a.radio.is_advertising());
    assert!(a.radio.is_scanning());
}

#[tokio::test]
async fn waits_for_radios_then_starts() {
    init_tracing();
    let air = MockAir::new();
    let mut a = node(&air, 1, DiscoverySettings::default());
    a.radio.configure(|k| k.bluetooth_enabled = false);

    assert_eq!(
        a.manager.start(DiscoveryMode::Ble).unwrap(),
        DiscoveryState::WaitingForRadiosEnabled
    );
    assert!(!a.radio.is_scanning());

    a.radio.configure(|k| k.bluetooth_enabled = true);
    a.manager.on_radio_state_changed(Radio::Bluetooth, true);
    assert_eq!(a.manager.state(), DiscoveryState::RunningBle);

    wait_for(&mut a.events, |e| {
        *e == DiscoveryEvent::StateChanged(DiscoveryState::RunningBle)
    })
    .await;
}

#[tokio::test]
async fn radio_toggle_downgrades_and_upgrades() {
    init_tracing();
    let air = MockAir::new();
    let a = node(&air, 1, DiscoverySettings::default());

    assert_eq!(
        a.manager.start(DiscoveryMode::BleAndWifi).unwrap(),
        DiscoveryState::RunningBleAndWifi
    );

    a.radio.configure(|k| k.wifi_enabled = false);
    a.manager.on_radio_state_changed(Radio::Wifi, false);
    assert_eq!(a.manager.state(), DiscoveryState::RunningBle);
    assert!(!a.radio.is_wifi_discovering());
    assert!(a.radio.is_scanning());

    a.radio.configure(|k| k.bluetooth_enabled = false);
    a.manager.on_radio_state_changed(Radio::Bluetooth, false);
    assert_eq!(a.manager.state(), DiscoveryState::WaitingForRadiosEnabled);
    assert!(!a.radio.is_scanning());

    a.radio.configure(|k| {
        k.bluetooth_enabled = true;
        k.wifi_enabled = true;
    });
    a.manager.on_radio_state_changed(Radio::Wifi, true);
    assert_eq!(a.manager.state(), DiscoveryState::RunningBleAndWifi);
}

#[tokio::test]
async fn stop_tears_everything_down() {
    init_tracing();
    let air = MockAir::new();
    let a = node(&air, 1, DiscoverySettings::default());

    a.manager.start(DiscoveryMode::BleAndWifi).unwrap();
    a.manager.stop();
    assert_eq!(a.manager.state(), DiscoveryState::NotStarted);
    assert!(!a.radio.is_advertising());
    assert!(!a.radio.is_scanning());
    assert!(!a.radio.is_wifi_discovering());
    assert!(a.radio.wifi_service().is_none());

    // Stopping again is harmless and the mode can be started afresh.
    a.manager.stop();
    assert_eq!(a.manager.start(DiscoveryMode::Ble).unwrap(), DiscoveryState::RunningBle);
}

#[tokio::test]
async fn changing_mode_reconciles_transports() {
    init_tracing();
    let air = MockAir::new();
    let a = node(&air, 1, DiscoverySettings::default());

    a.manager.start(DiscoveryMode::Ble).unwrap();
    assert_eq!(a.manager.start(DiscoveryMode::Wifi).unwrap(), DiscoveryState::RunningWifi);
    assert!(!a.radio.is_scanning());
    assert!(a.radio.is_wifi_discovering());
}

#[tokio::test]
async fn ble_peers_discover_each_other() {
    init_tracing();
    let air = MockAir::new();
    let mut a = node(&air, 1, DiscoverySettings::default());
    let mut b = node(&air, 2, DiscoverySettings::default());

    a.manager.start(DiscoveryMode::Ble).unwrap();
    b.manager.start(DiscoveryMode::Ble).unwrap();

    let seen_by_a = wait_for(&mut a.events, |e| matches!(e, DiscoveryEvent::PeerDiscovered(_))).await;
    let seen_by_b = wait_for(&mut b.events, |e| matches!(e, DiscoveryEvent::PeerDiscovered(_))).await;
    let DiscoveryEvent::PeerDiscovered(peer) = seen_by_a else { unreachable!() };
    assert_eq!(peer.bluetooth_address, addr(2));
    let DiscoveryEvent::PeerDiscovered(peer) = seen_by_b else { unreachable!() };
    assert_eq!(peer.bluetooth_address, addr(1));
    assert_eq!(a.manager.peer_model().len(), 1);
}

#[tokio::test]
async fn hidden_address_is_resolved_by_neighbour() {
    init_tracing();
    let air = MockAir::new();
    let hidden = air.device(addr(1));
    hidden.configure(|k| k.hide_local_address = true);
    let mut a = node_with(hidden, 1, DiscoverySettings::default());
    let mut b = node(&air, 2, DiscoverySettings::default());

    b.manager.start(DiscoveryMode::Ble).unwrap();
    a.manager.start(DiscoveryMode::Ble).unwrap();
    assert!(a.manager.local_bluetooth_address().is_none());
    assert!(a.manager.pending_request_id().is_some());

    wait_for(&mut b.events, |e| {
        matches!(e, DiscoveryEvent::ProvideAddressRequested { .. })
    })
    .await;
    let resolved = wait_for(&mut a.events, |e| {
        matches!(e, DiscoveryEvent::BluetoothAddressResolved(_))
    })
    .await;
    assert_eq!(resolved, DiscoveryEvent::BluetoothAddressResolved(addr(1)));
    assert_eq!(a.manager.local_bluetooth_address(), Some(addr(1)));
    assert!(a.manager.pending_request_id().is_none());
    assert!(!a.radio.is_gatt_server_running());

    // B resumes scanning and sees A under its real address.
    wait_for(&mut b.events, |e| {
        matches!(e, DiscoveryEvent::PeerDiscovered(p) if p.bluetooth_address == addr(1))
    })
    .await;
    assert!(b.radio.is_scanning());
    assert!(!b.radio.is_discovering_devices());
}

#[tokio::test(start_paused = true)]
async fn unanswered_request_fails_and_is_renewed() {
    init_tracing();
    let air = MockAir::new();
    let hidden = air.device(addr(1));
    hidden.configure(|k| k.hide_local_address = true);
    let settings = DiscoverySettings {
        provide_address_timeout_ms: 2_000,
        ..DiscoverySettings::default()
    };
    let mut a = node_with(hidden, 1, settings);
    a.manager.start(DiscoveryMode::Ble).unwrap();
    let first = a.manager.pending_request_id().unwrap();

    // Pretend a provider answered, but never write the address.
    a.manager.resolver().start_receiving(&first);
    let failed = wait_for(&mut a.events, |e| {
        matches!(e, DiscoveryEvent::BluetoothAddressResolutionFailed { .. })
    })
    .await;
    assert_eq!(
        failed,
        DiscoveryEvent::BluetoothAddressResolutionFailed { request_id: first.clone() }
    );
    let second = a.manager.pending_request_id().unwrap();
    assert_ne!(first, second);
    assert!(a.radio.is_advertising());
}

#[tokio::test]
async fn wifi_peers_are_discovered_and_lost() {
    init_tracing();
    let air = MockAir::new();
    let mut a = node(&air, 1, DiscoverySettings::default());
    let hidden = air.device(addr(2));
    hidden.configure(|k| k.hide_local_address = true);
    let b = node_with(hidden, 2, DiscoverySettings::default());

    a.manager.start(DiscoveryMode::Wifi).unwrap();
    b.manager.start(DiscoveryMode::Wifi).unwrap();

    let found = wait_for(&mut a.events, |e| matches!(e, DiscoveryEvent::PeerDiscovered(_))).await;
    let DiscoveryEvent::PeerDiscovered(peer) = found else { unreachable!() };
    assert_eq!(peer.id, "peer-2");
    assert_eq!(peer.name.as_deref(), Some("device 2"));
    assert_eq!(peer.wifi_device_address, Some(b.radio.wifi_address()));

    b.manager.stop();
    let lost = wait_for(&mut a.events, |e| matches!(e, DiscoveryEvent::PeerLost(_))).await;
    assert_eq!(lost, DiscoveryEvent::PeerLost(peer));
    assert!(a.manager.peer_model().is_empty());
}

#[tokio::test(start_paused = true)]
async fn failed_start_is_retried_after_delay() {
    init_tracing();
    let air = MockAir::new();
    let mut a = node(&air, 1, DiscoverySettings::default());
    a.radio.configure(|k| k.fail_scan_starts = 1);

    assert!(matches!(
        a.manager.start(DiscoveryMode::Ble),
        Err(DiscoveryError::StartFailed(_))
    ));
    assert_eq!(a.manager.state(), DiscoveryState::NotStarted);

    wait_for(&mut a.events, |e| {
        *e == DiscoveryEvent::StateChanged(DiscoveryState::RunningBle)
    })
    .await;
    assert_eq!(count(&a.radio.counters.scan_starts), 2);
}

#[tokio::test(start_paused = true)]
async fn persistent_failure_gives_up() {
    init_tracing();
    let air = MockAir::new();
    let mut a = node(&air, 1, DiscoverySettings::default());
    a.radio.configure(|k| k.fail_wifi_starts = 100);

    assert!(a.manager.start(DiscoveryMode::Wifi).is_err());
    let failed = wait_for(&mut a.events, |e| {
        matches!(e, DiscoveryEvent::TransportFailed { .. })
    })
    .await;
    assert!(matches!(
        failed,
        DiscoveryEvent::TransportFailed { transport: Transport::Wifi, .. }
    ));
    assert_eq!(count(&a.radio.counters.wifi_discovery_starts), 3);

    // No further retries once given up.
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(count(&a.radio.counters.wifi_discovery_starts), 3);
}

#[tokio::test]
async fn duplicate_listener_is_rejected() {
    let air = MockAir::new();
    let a = node(&air, 1, DiscoverySettings::default());
    let listener: Listener<DiscoveryEvent> = Arc::new(|_| {});
    a.manager.add_listener(&listener).unwrap();
    assert!(matches!(
        a.manager.add_listener(&listener),
        Err(DiscoveryError::Listener(ListenerError::AlreadyRegistered))
    ));
}

#[tokio::test]
async fn stale_provide_stop_does_not_resume_scan() {
    init_tracing();
    let air = MockAir::new();
    let a = node(&air, 1, DiscoverySettings::default());
    a.manager.start(DiscoveryMode::Ble).unwrap();

    assert!(a.manager.start_providing("00000000000a"));
    a.manager.resolver().stop_providing();
    assert!(a.manager.start_providing("00000000000b"));

    // The first session's stop is still queued; let it drain.
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    assert!(a.manager.resolver().is_providing());
    assert!(a.radio.is_discovering_devices());
    assert!(!a.radio.is_scanning());

    a.manager.resolver().stop_providing();
    tokio::time::timeout(Duration::from_secs(120), async {
        while !a.radio.is_scanning() {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("scan never resumed");
    assert!(!a.radio.is_discovering_devices());
}

#[tokio::test]
async fn both_transports_yield_one_peer() {
    init_tracing();
    let air = MockAir::new();
    let mut a = node(&air, 1, DiscoverySettings::default());
    let b = node(&air, 2, DiscoverySettings::default());

    a.manager.start(DiscoveryMode::BleAndWifi).unwrap();
    b.manager.start(DiscoveryMode::BleAndWifi).unwrap();

    let merged = wait_for(&mut a.events, |e| match e {
        DiscoveryEvent::PeerDiscovered(p) | DiscoveryEvent::PeerUpdated(p) => {
            p.wifi_device_address.is_some() && p.extra_information.is_some()
        }
        _ => false,
    })
    .await;
    let (DiscoveryEvent::PeerDiscovered(peer) | DiscoveryEvent::PeerUpdated(peer)) = merged else {
        unreachable!()
    };
    assert_eq!(peer.id, addr(2).to_string());
    assert_eq!(peer.name.as_deref(), Some("device 2"));
    assert_eq!(peer.wifi_device_address, Some(b.radio.wifi_address()));

    let ids: Vec<String> = a.manager.peer_model().peers().into_iter().map(|p| p.id).collect();
    assert_eq!(ids, vec![addr(2).to_string()]);
}
