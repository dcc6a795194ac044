//! peerlink CLI: configuration, identity and advertisement tooling, plus an
//! in-memory simulation of two nodes.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use peerlink_discovery::advertisement;
use peerlink_discovery::request_id::{derive_request_uuid, parse_request_id};
use peerlink_discovery::{AdvertisementDataType, DiscoveryEvent, DiscoverySettings};
use peerlink_node::{setup, Config, ConnectionEvent, Node, NodeEvent};
use peerlink_radio::mock::MockAir;
use peerlink_radio::AdvertisementData;
use peerlink_types::{BluetoothAddress, PeerIdentity};
use uuid::Uuid;

#[derive(Parser)]
#[command(
    name = "peerlink",
    about = "Discover and connect to nearby peers over BLE, Bluetooth and Wi-Fi Direct",
    version,
    propagate_version = true
)]
struct Cli {
    /// Path to configuration file.
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the effective configuration as TOML.
    Config {
        /// Print the built-in defaults instead.
        #[arg(long)]
        default: bool,
    },

    /// Print this device's identity record, creating the peer id if needed.
    Identity {
        /// Directory holding the persistent peer id.
        #[arg(long)]
        config_dir: Option<PathBuf>,
    },

    /// Derive the BLE UUID that carries an address-resolution request.
    RequestUuid {
        service_uuid: Uuid,
        request_id: String,
    },

    /// Recover the request id from a request UUID.
    ParseRequestId { uuid: Uuid },

    /// Decode a peer advertisement payload given as hex.
    DecodeAdvert {
        hex: String,
        /// Treat the payload as manufacturer data with this id.
        #[arg(long, value_parser = parse_u16)]
        manufacturer_id: Option<u16>,
        /// Service UUID the payload belongs to.
        #[arg(long)]
        service_uuid: Option<Uuid>,
    },

    /// Run two nodes over a simulated radio until they connect.
    Simulate {
        /// Give up after this many seconds.
        #[arg(long, default_value_t = 30)]
        timeout_secs: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = setup::load_config(cli.config.as_deref())?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.node.log_level)),
        )
        .init();

    match cli.command {
        Commands::Config { default } => {
            let shown = if default { Config::default() } else { config };
            print!("{}", toml::to_string_pretty(&shown)?);
        }
        Commands::Identity { config_dir } => {
            let dir = config_dir.unwrap_or_else(setup::config_dir);
            let peer_id = setup::load_or_create_peer_id(&dir)?;
            let identity =
                PeerIdentity::new(peer_id, config.identity.name, BluetoothAddress::UNKNOWN);
            println!("{}", identity.encode()?);
        }
        Commands::RequestUuid {
            service_uuid,
            request_id,
        } => {
            println!("{}", derive_request_uuid(service_uuid, &request_id)?);
        }
        Commands::ParseRequestId { uuid } => {
            println!("{}", parse_request_id(uuid));
        }
        Commands::DecodeAdvert {
            hex,
            manufacturer_id,
            service_uuid,
        } => decode_advert(&hex, manufacturer_id, service_uuid, config.discovery)?,
        Commands::Simulate { timeout_secs } => {
            simulate(&config, Duration::from_secs(timeout_secs)).await?;
        }
    }

    Ok(())
}

fn parse_u16(text: &str) -> Result<u16, String> {
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => text.parse(),
    };
    parsed.map_err(|e| format!("{text:?} is not a 16-bit id: {e}"))
}

fn decode_advert(
    payload: &str,
    manufacturer_id: Option<u16>,
    service_uuid: Option<Uuid>,
    mut settings: DiscoverySettings,
) -> anyhow::Result<()> {
    let bytes = hex::decode(payload.trim()).context("payload is not valid hex")?;
    if let Some(uuid) = service_uuid {
        settings.service_uuid = uuid;
    }

    let mut data = AdvertisementData::default();
    match manufacturer_id {
        Some(id) => {
            settings.advertisement_data_type = AdvertisementDataType::ManufacturerData;
            settings.manufacturer_id = id;
            data.manufacturer_data.insert(id, bytes);
        }
        None => {
            settings.advertisement_data_type = AdvertisementDataType::ServiceData;
            data.service_uuids.push(settings.service_uuid);
            data.service_data.insert(settings.service_uuid, bytes);
        }
    }

    let Some(decoded) = advertisement::decode(&data, &settings)? else {
        bail!("advertisement does not belong to service {}", settings.service_uuid);
    };
    println!("uuid:                {}", decoded.uuid);
    if decoded.is_request(settings.service_uuid) {
        println!("request id:          {}", parse_request_id(decoded.uuid));
    }
    if let Some(peer) = decoded.payload {
        println!("extra information:   {}", peer.extra_information);
        if peer.bluetooth_address.is_unknown() {
            println!("bluetooth address:   unknown");
        } else {
            println!("bluetooth address:   {}", peer.bluetooth_address);
        }
    }
    Ok(())
}

fn describe(event: &NodeEvent) -> String {
    match event {
        NodeEvent::Discovery(DiscoveryEvent::PeerDiscovered(peer)) => {
            format!("discovered {} ({})", peer.display_name(), peer.bluetooth_address)
        }
        NodeEvent::Connection(ConnectionEvent::Connected(connection)) => format!(
            "connected to {} ({}, {})",
            connection.peer.display_name(),
            connection.peer.bluetooth_address,
            if connection.incoming { "incoming" } else { "outgoing" }
        ),
        other => format!("{other:?}"),
    }
}

/// Two nodes on one simulated medium; `alpha` cannot see its own Bluetooth
/// address and has to learn it from `bravo`.
async fn simulate(config: &Config, timeout: Duration) -> anyhow::Result<()> {
    let air = MockAir::new();
    let radio_a = air.device(BluetoothAddress::new([0x5a, 0x00, 0x00, 0x00, 0x00, 0x01]));
    radio_a.configure(|k| k.hide_local_address = true);
    let radio_b = air.device(BluetoothAddress::new([0x5a, 0x00, 0x00, 0x00, 0x00, 0x02]));

    let named = |name: &str| {
        let mut config = config.clone();
        config.identity.name = name.to_string();
        config.node.listen = true;
        config
    };
    let (alpha, mut events_a) = Node::new(named("alpha"), "alpha", radio_a.radios())?;
    let (bravo, mut events_b) = Node::new(named("bravo"), "bravo", radio_b.radios())?;

    tracing::info!(timeout_secs = timeout.as_secs(), "starting simulation");
    bravo.start()?;
    alpha.start()?;

    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);
    let mut dialled = false;
    let mut connected = 0;
    while connected < 2 {
        tokio::select! {
            Some(event) = events_a.recv() => {
                println!("alpha: {}", describe(&event));
                match &event {
                    NodeEvent::Discovery(
                        DiscoveryEvent::PeerDiscovered(peer) | DiscoveryEvent::PeerUpdated(peer),
                    ) if !dialled && peer.bluetooth_address.is_usable() => {
                        alpha.connect(peer)?;
                        dialled = true;
                    }
                    NodeEvent::Connection(ConnectionEvent::Connected(_)) => connected += 1,
                    _ => {}
                }
            }
            Some(event) = events_b.recv() => {
                println!("bravo: {}", describe(&event));
                if matches!(event, NodeEvent::Connection(ConnectionEvent::Connected(_))) {
                    connected += 1;
                }
            }
            () = &mut deadline => bail!("simulation timed out after {}s", timeout.as_secs()),
        }
    }

    alpha.shutdown();
    bravo.shutdown();
    println!("simulation complete");
    Ok(())
}
