//! duskswitch daemon - main entry point
//!
//! Loads the configuration, works out today's activation time, brings the
//! devices in line with it, and then follows keyboard activity until SIGTERM
//! or SIGINT.

use duskswitch_common::tracing;
use duskswitchd::config::{ConfigManager, DEFAULT_CONFIG_PATH};
use duskswitchd::daemon::Daemon;
use duskswitchd::device::DeviceHandle;
use duskswitchd::discovery::Discovery;
use duskswitchd::fleet::{self, DeviceFleet};
use duskswitchd::gate::{self, Clock, SystemClock};
use duskswitchd::input::{KeyboardMonitor, INPUT_DIR};
use duskswitchd::tuya_client::TuyaClient;
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config_path = match parse_args(env::args().skip(1))? {
        Some(path) => path,
        None => return Ok(()),
    };

    let runtime = tokio::runtime::Runtime::new()?;
    let result = runtime.block_on(run(config_path));

    // keyboard readers sit in a blocking read until their next event
    runtime.shutdown_timeout(Duration::from_millis(500));
    result
}

async fn run(config_path: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let mut config_manager = ConfigManager::new(&config_path);
    if let Err(e) = config_manager.load_config().await {
        eprintln!("duskswitchd: {}", e);
        return Err(e.into());
    }
    let config = config_manager.config().clone();

    tracing_subscriber::fmt()
        .with_max_level(config.log_level()?)
        .with_target(false)
        .init();

    info!("Starting duskswitch daemon v{}", env!("CARGO_PKG_VERSION"));

    if !nix::unistd::getuid().is_root() {
        warn!("Not running as root, keyboards under {} may be unreadable", INPUT_DIR);
    }

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let gate = match gate::resolve(&config, clock.as_ref()).await {
        Ok(gate) => gate,
        Err(e) => {
            error!("Failed to determine activation time: {}", e);
            return Err(e.into());
        }
    };

    let discovery = Arc::new(Discovery::from_settings(&config.network));
    let mut handles = Vec::with_capacity(config.devices.len());
    for descriptor in &config.devices {
        let client = TuyaClient::new(descriptor, Arc::clone(&discovery))?;
        handles.push(DeviceHandle::new(
            descriptor.clone(),
            Box::new(client),
            config.device_timeout(),
        ));
    }
    let (outcome_sender, outcome_receiver) = mpsc::unbounded_channel();
    let supervisor = fleet::spawn_supervisor(outcome_receiver);
    let fleet = DeviceFleet::new(handles, outcome_sender);
    info!("Managing {} devices", fleet.len());

    let mut monitor = KeyboardMonitor::new(INPUT_DIR);
    match monitor.discover() {
        Ok(0) => warn!("No keyboards found, only the activation schedule will run"),
        Ok(count) => info!("Monitoring {} keyboards", count),
        Err(e) => error!("Keyboard discovery failed: {}", e),
    }
    let keys = monitor
        .take_receiver()
        .ok_or("keyboard event receiver already taken")?;
    monitor.start();

    let mut daemon = Daemon::new(&config, gate, clock, fleet);
    daemon.attach_monitor(monitor);
    daemon.sync_initial_state();

    let (shutdown_sender, shutdown_receiver) = watch::channel(false);
    let mut terminate = signal(SignalKind::terminate())?;
    let mut interrupt = signal(SignalKind::interrupt())?;
    tokio::spawn(async move {
        tokio::select! {
            _ = terminate.recv() => {
                info!("Received SIGTERM, shutting down gracefully");
            }
            _ = interrupt.recv() => {
                info!("Received SIGINT, shutting down gracefully");
            }
        }
        let _ = shutdown_sender.send(true);
    });

    daemon.run(keys, shutdown_receiver).await;

    // the daemon held the last fleet, so the supervisor drains and exits
    drop(daemon);
    if tokio::time::timeout(Duration::from_secs(1), supervisor).await.is_err() {
        debug!("Device operations still in flight at exit");
    }

    info!("All cleaned up!");
    Ok(())
}

/// Returns the config path, or `None` when only help or version was asked for
fn parse_args<I>(mut args: I) -> Result<Option<PathBuf>, Box<dyn std::error::Error>>
where
    I: Iterator<Item = String>,
{
    let mut config_path = PathBuf::from(DEFAULT_CONFIG_PATH);

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-c" | "--config" => {
                let path = args.next().ok_or("--config needs a path")?;
                config_path = PathBuf::from(path);
            }
            "-h" | "--help" => {
                println!("Usage: duskswitchd [--config PATH]");
                println!();
                println!("  -c, --config PATH   configuration file (default {})", DEFAULT_CONFIG_PATH);
                println!("  -V, --version       print the version");
                return Ok(None);
            }
            "-V" | "--version" => {
                println!("duskswitchd {}", env!("CARGO_PKG_VERSION"));
                return Ok(None);
            }
            other => return Err(format!("unknown argument {}", other).into()),
        }
    }

    Ok(Some(config_path))
}
