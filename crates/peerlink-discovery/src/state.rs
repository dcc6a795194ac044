use std::fmt;

use peerlink_radio::Radio;

/// Lifecycle of the discovery state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DiscoveryState {
    #[default]
    NotStarted,
    WaitingForRadiosEnabled,
    RunningBle,
    RunningWifi,
    RunningBleAndWifi,
}

impl DiscoveryState {
    /// The running state for a set of active transports.
    pub fn running(ble: bool, wifi: bool) -> Option<Self> {
        match (ble, wifi) {
            (true, true) => Some(Self::RunningBleAndWifi),
            (true, false) => Some(Self::RunningBle),
            (false, true) => Some(Self::RunningWifi),
            (false, false) => None,
        }
    }

    pub fn is_running(self) -> bool {
        matches!(
            self,
            Self::RunningBle | Self::RunningWifi | Self::RunningBleAndWifi
        )
    }
}

impl fmt::Display for DiscoveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotStarted => write!(f, "not started"),
            Self::WaitingForRadiosEnabled => write!(f, "waiting for radios"),
            Self::RunningBle => write!(f, "running (BLE)"),
            Self::RunningWifi => write!(f, "running (Wi-Fi)"),
            Self::RunningBleAndWifi => write!(f, "running (BLE + Wi-Fi)"),
        }
    }
}

/// A discovery transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Ble,
    Wifi,
}

impl Transport {
    pub fn radio(self) -> Radio {
        match self {
            Self::Ble => Radio::Bluetooth,
            Self::Wifi => Radio::Wifi,
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ble => write!(f, "BLE"),
            Self::Wifi => write!(f, "Wi-Fi Direct"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn running_subsets() {
        assert_eq!(DiscoveryState::running(true, true), Some(DiscoveryState::RunningBleAndWifi));
        assert_eq!(DiscoveryState::running(false, true), Some(DiscoveryState::RunningWifi));
        assert_eq!(DiscoveryState::running(false, false), None);
        assert!(!DiscoveryState::WaitingForRadiosEnabled.is_running());
    }
}
