//! usb-pmapper monitor
//!
//! Starts the port-mapper runtime with hooks that print what it sees: the
//! topology present at startup, then hotplug arrivals and departures until
//! Ctrl-C.

mod config;
mod hooks;

use anyhow::{Context, Result};
use clap::Parser;
use common::{EventBridge, create_event_bridge, setup_logging};
use config::MonitorConfig;
use hooks::{MonitorEvent, MonitorHooks};
use pmapper::{DeviceInfo, PortMapper, PortMapperHooks, scan_topology};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "usbpm-monitor")]
#[command(author, version, about = "Watch the USB topology through the port mapper")]
#[command(long_about = "
Runs the USB port mapper without a guest attached and prints every device it
would offer to a virtual host controller.

EXAMPLES:
    # Print the current topology and exit
    usbpm-monitor --list

    # Same, as JSON
    usbpm-monitor --list --json

    # Follow hotplug events with debug logging
    usbpm-monitor --log-level debug

CONFIGURATION:
    1. Path specified with --config
    2. ~/.config/usb-pmapper/monitor.toml
    3. /etc/usb-pmapper/monitor.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<std::path::PathBuf>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// Print the devices present at startup and exit
    #[arg(long)]
    list: bool,

    /// Print devices and events as JSON
    #[arg(long)]
    json: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let path = MonitorConfig::default_path();
        MonitorConfig::default()
            .save(&path)
            .context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = match args.config {
        Some(ref path) => {
            MonitorConfig::load(Some(path.clone())).context("Failed to load configuration")?
        }
        None => MonitorConfig::load_or_default(),
    };

    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.monitor.log_level);
    setup_logging(log_level).context("Failed to setup logging")?;

    info!("usb-pmapper monitor v{}", env!("CARGO_PKG_VERSION"));

    let (sink, bridge) = create_event_bridge(config.monitor.event_capacity);
    let hooks: Arc<dyn PortMapperHooks> = Arc::new(MonitorHooks::new(sink));
    let mapper = Arc::new(PortMapper::new(hooks, config.runtime.clone()));

    // Initial scan and native setup block; keep them off the async workers
    let init = Arc::clone(&mapper);
    tokio::task::spawn_blocking(move || init.sys_init())
        .await
        .context("Port mapper init task failed")?
        .context("Failed to start port mapper")?;

    let result = if args.list {
        list_devices(&mapper.devices(), args.json)
    } else {
        run_monitor(&bridge, args.json).await
    };

    info!("Shutting down port mapper...");
    if let Err(e) = tokio::task::spawn_blocking(move || mapper.sys_deinit()).await {
        error!("Port mapper shutdown panicked: {:?}", e);
    }

    result
}

/// Print the attachable devices in the order a guest would see them
fn list_devices(devices: &[DeviceInfo], json: bool) -> Result<()> {
    let mut ordered = Vec::new();
    scan_topology(devices, |info| ordered.push(info.clone()));

    if json {
        let out = serde_json::to_string_pretty(&ordered).context("Failed to encode device list")?;
        println!("{}", out);
        return Ok(());
    }

    if ordered.is_empty() {
        println!("No USB devices found.");
        return Ok(());
    }

    println!("Found {} USB device(s):\n", ordered.len());
    for info in &ordered {
        println!("  {}", format_device(info));
    }
    Ok(())
}

/// Print events until Ctrl-C
async fn run_monitor(bridge: &EventBridge<MonitorEvent>, json: bool) -> Result<()> {
    let ctrl_c = signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            event = bridge.recv() => match event {
                Ok(event) => print_event(&event, json)?,
                Err(e) => {
                    warn!("Event stream closed: {}", e);
                    return Ok(());
                }
            },
            signal = &mut ctrl_c => {
                signal.context("Failed to listen for Ctrl-C")?;
                info!("Received Ctrl-C");
                return Ok(());
            }
        }
    }
}

fn print_event(event: &MonitorEvent, json: bool) -> Result<()> {
    if json {
        let line = serde_json::to_string(event).context("Failed to encode event")?;
        println!("{}", line);
        return Ok(());
    }

    match event {
        MonitorEvent::Connected(info) => println!("+ {}", format_device(info)),
        MonitorEvent::Disconnected(info) => println!("- {}", format_device(info)),
        MonitorEvent::Completed { device, status } => println!("  {} transfer {}", device, status),
    }
    Ok(())
}

fn format_device(info: &DeviceInfo) -> String {
    let mut line = format!(
        "[{}] {:04x}:{:04x} {:?} {:?} USB {:x}.{:02x}",
        info.path,
        info.vendor_id,
        info.product_id,
        info.device_type,
        info.speed,
        info.bcd_usb >> 8,
        info.bcd_usb & 0xff
    );
    if let Some(ports) = info.max_child {
        line.push_str(&format!(" ({} ports)", ports));
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use pmapper::test_utils::{create_mock_device_info, create_mock_hub_info};

    #[test]
    fn test_format_device() {
        let info = create_mock_device_info(1, &[2, 3], 0x0781, 0x5581);
        assert_eq!(
            format_device(&info),
            "[1-2.3] 0781:5581 ExternalHubSubdevice High USB 2.00"
        );

        let hub = create_mock_hub_info(1, &[2], 4);
        assert!(format_device(&hub).ends_with("USB 2.10 (4 ports)"));
    }

    #[test]
    fn test_args_parse() {
        let args = Args::parse_from(["usbpm-monitor", "--list", "--json", "-l", "debug"]);
        assert!(args.list);
        assert!(args.json);
        assert_eq!(args.log_level.as_deref(), Some("debug"));
        assert!(args.config.is_none());
    }
}
