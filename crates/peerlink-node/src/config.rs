//! Node configuration loaded from TOML.

use std::time::Duration;

use peerlink_discovery::DiscoverySettings;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub identity: IdentityConfig,
    #[serde(default)]
    pub discovery: DiscoverySettings,
    #[serde(default)]
    pub connection: ConnectionSettings,
}

/// Runtime settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Start the incoming-connection listener together with discovery.
    #[serde(default = "default_true")]
    pub listen: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            listen: true,
        }
    }
}

/// How this node presents itself to peers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default)]
    pub extra_information: u8,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            extra_information: 0,
        }
    }
}

/// Connection state machine settings, the `[connection]` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionSettings {
    /// Deadline for one outgoing attempt, handshake included.
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,
    /// Attempts per `connect` call before the failure is final; 0 acts as 1.
    #[serde(default = "default_max_connection_attempts")]
    pub max_connection_attempts: u32,
    #[serde(default = "default_true")]
    pub handshake_required: bool,
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    /// Listen and connect on a fixed RFCOMM channel instead of the service
    /// record.
    #[serde(default)]
    pub insecure_rfcomm_port: Option<u8>,
    #[serde(default = "default_service_uuid")]
    pub service_uuid: Uuid,
    #[serde(default = "default_service_name")]
    pub service_name: String,
    #[serde(default = "default_max_consecutive_listener_failures")]
    pub max_consecutive_listener_failures: u32,
    #[serde(default = "default_listener_restart_delay_ms")]
    pub listener_restart_delay_ms: u64,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            connection_timeout_ms: default_connection_timeout_ms(),
            max_connection_attempts: default_max_connection_attempts(),
            handshake_required: true,
            handshake_timeout_ms: default_handshake_timeout_ms(),
            insecure_rfcomm_port: None,
            service_uuid: default_service_uuid(),
            service_name: default_service_name(),
            max_consecutive_listener_failures: default_max_consecutive_listener_failures(),
            listener_restart_delay_ms: default_listener_restart_delay_ms(),
        }
    }
}

impl ConnectionSettings {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn listener_restart_delay(&self) -> Duration {
        Duration::from_millis(self.listener_restart_delay_ms)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_connection_attempts.max(1)
    }
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "peerlink".to_string())
}

fn default_connection_timeout_ms() -> u64 {
    15_000
}

fn default_max_connection_attempts() -> u32 {
    3
}

fn default_handshake_timeout_ms() -> u64 {
    5_000
}

fn default_service_uuid() -> Uuid {
    Uuid::from_u128(0x9b0e_51c4_6d2a_4f7b_8e13_c5a0_27d4_f6e9)
}

fn default_service_name() -> String {
    "peerlink".to_string()
}

fn default_max_consecutive_listener_failures() -> u32 {
    5
}

fn default_listener_restart_delay_ms() -> u64 {
    1_000
}
