//! now-mqtt node - ESP-NOW transport and MQTT bridge
//!
//! This binary runs on the emulated UDP radio:
//! - `transport` mode broadcasts lines read from stdin
//! - `bridge` mode publishes every frame heard on the channel to MQTT
//! - `both` runs the two side by side on a reconciled channel
//!
//! Stdin lines of the form `sensor <name> <value>`, `binary <name> on|off`
//! and `text <name> <value>` are sent as sensor readings; anything else is
//! sent as a raw data frame.

use anyhow::Context;
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use now_mqtt::{
    BridgeHandle, Destination, NowMqttBridge, NowMqttConfig, NowMqttTransport, RadioChannel,
    RumqttPublisher, SendHooks, SensorReading, TransportHandle, UdpRadio,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Send frames only
    Transport,
    /// Forward received frames to MQTT only
    Bridge,
    /// Transport and bridge in one process
    Both,
}

#[derive(Parser)]
#[command(name = "now-mqtt-node")]
#[command(about = "ESP-NOW transport and MQTT bridge node")]
struct Args {
    /// JSON configuration file
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Services to run
    #[arg(long, value_enum, default_value_t = Mode::Both)]
    mode: Mode,

    /// Fallback WiFi channel for transport and bridge
    #[arg(long)]
    channel: Option<u8>,

    /// Channel of an active station connection (overrides --channel)
    #[arg(long)]
    station_channel: Option<u8>,

    /// MQTT broker host
    #[arg(long)]
    mqtt_host: Option<String>,

    /// MQTT broker port
    #[arg(long)]
    mqtt_port: Option<u16>,

    /// Radio address of this node (random when absent)
    #[arg(long)]
    address: Option<String>,

    /// Node name used in sensor readings
    #[arg(long, short, default_value = "now-mqtt-node")]
    name: String,

    /// Enable verbose logging
    #[arg(long, short)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    let default_level = if args.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = load_config(&args)?;
    info!("Starting now-mqtt node: {} ({:?} mode)", args.name, args.mode);

    let channel_source = config.station_channel;
    let reconciled = if args.mode == Mode::Both {
        Some(RadioChannel::reconcile(&config, &channel_source)?)
    } else {
        None
    };

    let mut services: Vec<JoinHandle<now_mqtt::Result<()>>> = Vec::new();
    let mut transport_handle: Option<TransportHandle> = None;
    let mut bridge_handle: Option<BridgeHandle> = None;

    if args.mode != Mode::Bridge {
        let radio = UdpRadio::from_config(&config.radio)?;
        let (mut transport, handle) =
            NowMqttTransport::new(radio, &config, logging_hooks(), Box::new(channel_source));
        if let Some(channel) = reconciled {
            transport = transport.with_channel(channel);
        }
        services.push(tokio::spawn(transport.run()));
        tokio::spawn(forward_stdin(handle.clone(), args.name.clone()));
        transport_handle = Some(handle);
    }

    if args.mode != Mode::Transport {
        let mut radio_config = config.radio.clone();
        if args.mode == Mode::Both {
            // the bridge must not share the transport's address or it drops its frames
            radio_config.address = None;
        }
        let radio = UdpRadio::from_config(&radio_config)?;
        let publisher = RumqttPublisher::connect(&config.mqtt);
        let (mut bridge, handle) =
            NowMqttBridge::new(radio, publisher, &config, Box::new(channel_source));
        if let Some(channel) = reconciled {
            bridge = bridge.with_channel(channel);
        }
        services.push(tokio::spawn(bridge.run()));
        bridge_handle = Some(handle);
    }

    let mut running = futures::future::select_all(services);
    let (outcome, remaining) = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, shutting down");
            (Ok(()), None)
        }
        (result, _, rest) = &mut running => {
            let outcome = match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => {
                    error!(code = e.error_code(), "Service failed: {}", e);
                    Err(anyhow::Error::new(e))
                }
                Err(e) => Err(anyhow::Error::new(e).context("service task panicked")),
            };
            (outcome, Some(rest))
        }
    };
    let remaining = match remaining {
        Some(rest) => rest,
        None => running.into_inner(),
    };

    if let Some(handle) = &transport_handle {
        if let Ok(stats) = handle.stats().await {
            info!(
                submitted = stats.pipeline.submitted,
                succeeded = stats.pipeline.succeeded,
                failed = stats.pipeline.failed,
                "Transport summary"
            );
        }
        let _ = handle.shutdown().await;
    }
    if let Some(handle) = &bridge_handle {
        if let Ok(stats) = handle.stats().await {
            info!(
                frames = stats.translator.frames_received,
                published = stats.published,
                peers = stats.peers,
                "Bridge summary"
            );
        }
        let _ = handle.shutdown().await;
    }
    futures::future::join_all(remaining).await;

    info!("Node stopped");
    outcome
}

fn load_config(args: &Args) -> anyhow::Result<NowMqttConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?
        }
        None => NowMqttConfig::default(),
    };

    if let Some(channel) = args.channel {
        config.transport.wifi_channel = channel;
        config.bridge.wifi_channel = channel;
    }
    if args.station_channel.is_some() {
        config.station_channel = args.station_channel;
    }
    if let Some(host) = &args.mqtt_host {
        config.mqtt.host = host.clone();
    }
    if let Some(port) = args.mqtt_port {
        config.mqtt.port = port;
    }
    if let Some(address) = &args.address {
        config.radio.address = Some(address.parse()?);
    }

    config.validate()?;
    Ok(config)
}

fn logging_hooks() -> SendHooks {
    SendHooks::new()
        .on_sent(|latency| debug!(latency_ms = (latency * 1000.0) as u64, "Send resolved"))
        .on_send_success(|| info!("Frame delivered"))
        .on_send_failure(|| warn!("Frame not delivered"))
}

async fn forward_stdin(handle: TransportHandle, node: String) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let result = match parse_reading(&node, line) {
                    Some(reading) => handle.submit_reading(&reading),
                    None => handle.submit(Destination::Broadcast, line.as_bytes().to_vec()),
                };
                match result {
                    Ok(id) => debug!(%id, "Queued"),
                    Err(e) => warn!(code = e.error_code(), "Send rejected: {}", e),
                }
            }
            Ok(None) => {
                info!("stdin closed");
                break;
            }
            Err(e) => {
                warn!("Reading stdin: {}", e);
                break;
            }
        }
    }
}

fn parse_reading(node: &str, line: &str) -> Option<SensorReading> {
    let (kind, rest) = line.split_once(' ')?;
    let (name, value) = rest.trim().rsplit_once(' ')?;
    match kind {
        "sensor" => value
            .parse::<f32>()
            .ok()
            .map(|v| SensorReading::sensor(node, name, v, 2)),
        "binary" => match value.to_ascii_lowercase().as_str() {
            "on" | "true" | "1" => Some(SensorReading::binary_sensor(node, name, true)),
            "off" | "false" | "0" => Some(SensorReading::binary_sensor(node, name, false)),
            _ => None,
        },
        "text" => Some(SensorReading::text_sensor(node, name, value)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sensor_line() {
        let reading = parse_reading("Desk", "sensor Room Temperature 21.5").unwrap();
        assert_eq!(reading.node, "desk");
        assert_eq!(reading.object_id, "room_temperature");
        assert_eq!(reading.state, "21.50");
    }

    #[test]
    fn test_parse_binary_line() {
        let reading = parse_reading("desk", "binary door ON").unwrap();
        assert_eq!(reading.state, "ON");
        assert!(parse_reading("desk", "binary door maybe").is_none());
    }

    #[test]
    fn test_plain_lines_are_data() {
        assert!(parse_reading("desk", "hello world").is_none());
        assert!(parse_reading("desk", "sensor temp warm").is_none());
        assert!(parse_reading("desk", "single").is_none());
    }
}
