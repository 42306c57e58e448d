//! open-icue daemon: drive CORSAIR and SCUF devices in software mode.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use open_icue_core::config::DaemonConfig;
use open_icue_core::device::{self, DiscoveredDevice};
use open_icue_core::driver::DriverContext;
use open_icue_core::input::{InputSink, NullSink, VirtualInput};
use open_icue_core::profile::JsonProfileStore;
use open_icue_core::registry::{self, HotplugDiff, Registry};
use open_icue_core::CORSAIR_VID;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG: &str = "/etc/open-icue/config.json";
const VIRTUAL_PRODUCT: &str = "open-icue";

#[derive(Parser)]
#[command(
    name = "open-icue",
    version,
    about = "Open-source driver daemon for CORSAIR and SCUF peripherals"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List connected supported devices.
    ListDevices,
    /// Take over every supported device until interrupted.
    Run {
        /// Daemon configuration file (JSON).
        #[arg(long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,
        /// Log at debug level unless RUST_LOG says otherwise.
        #[arg(long)]
        verbose: bool,
    },
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .init();
}

fn hid_api() -> Result<hidapi::HidApi> {
    hidapi::HidApi::new().map_err(|e| anyhow::anyhow!("hidapi init: {e}"))
}

fn list_devices() -> Result<()> {
    let api = hid_api()?;
    let devices = device::discover(&api);
    if devices.is_empty() {
        println!("No supported devices found.");
        println!("Ensure the device is connected and its hidraw nodes are accessible.");
        return Ok(());
    }
    for dev in &devices {
        let interfaces: Vec<String> = dev.interfaces().map(|i| i.to_string()).collect();
        println!(
            "{} [{}] (VID: 0x{:04X}, PID: 0x{:04X}, serial: {}, interfaces: {})",
            dev.product.name,
            dev.product.family(),
            dev.product.vid,
            dev.product.pid,
            dev.serial,
            interfaces.join(",")
        );
    }
    Ok(())
}

fn input_sink(config: &DaemonConfig) -> Result<Arc<dyn InputSink>> {
    if !config.enable_uinput {
        info!("Virtual input disabled, remapped keys are dropped");
        return Ok(Arc::new(NullSink));
    }
    let sink = VirtualInput::create(&config.uinput_path, VIRTUAL_PRODUCT, CORSAIR_VID)
        .with_context(|| format!("creating virtual input on {}", config.uinput_path.display()))?;
    Ok(Arc::new(sink))
}

/// Tracks what the daemon has already handled across bus scans.
struct Hotplug {
    api: hidapi::HidApi,
    ctx: DriverContext,
    /// Devices whose start failed; retried only after they are replugged.
    failed: BTreeSet<String>,
}

impl Hotplug {
    /// Rescan the bus, start new devices and drop unplugged ones.
    fn scan(&mut self, registry: &Registry) {
        if let Err(e) = self.api.refresh_devices() {
            debug!(error = %e, "HID rescan failed");
            return;
        }
        let found = device::discover(&self.api);
        let present: BTreeSet<String> = found.iter().map(|f| f.serial.clone()).collect();
        let mut known: BTreeSet<String> = registry.serials().into_iter().collect();
        known.extend(self.failed.iter().cloned());

        let diff = HotplugDiff::between(&known, &present);
        for serial in &diff.removed {
            self.failed.remove(serial);
            if registry.remove(serial).is_some() {
                info!(serial = %serial, "Device unplugged");
            }
        }
        for found in found.into_iter().filter(|f| diff.added.contains(&f.serial)) {
            info!(product = found.product.name, serial = %found.serial, "Device plugged in");
            if !self.start(registry, &found) {
                self.failed.insert(found.serial);
            }
        }
    }

    fn start(&self, registry: &Registry, found: &DiscoveredDevice) -> bool {
        let ports = match registry::open_ports(&self.api, found) {
            Ok(ports) => ports,
            Err(e) => {
                warn!(product = found.product.name, serial = %found.serial, error = %e, "Device not opened");
                return false;
            }
        };
        let device = registry::build_device(found.product, &found.serial, ports, self.ctx.clone());
        if let Err(e) = registry.start(device) {
            debug!(serial = %found.serial, error = %e, "Device left in hardware mode");
            return false;
        }
        true
    }
}

fn run(config_path: PathBuf) -> Result<()> {
    let config = DaemonConfig::load(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    config.validate()?;
    let scan_interval = config.hotplug_scan();

    let ctx = DriverContext {
        sink: input_sink(&config)?,
        profiles: Arc::new(JsonProfileStore::new(config.profile_dir.clone())),
        config: Arc::new(config),
    };

    let registry = Registry::new();
    let mut hotplug = Hotplug {
        api: hid_api()?,
        ctx,
        failed: BTreeSet::new(),
    };
    hotplug.scan(&registry);
    if registry.is_empty() {
        info!("No supported device started yet, waiting for hot-plug");
    }
    info!(devices = registry.len(), "Daemon running, press Ctrl-C to stop");

    let (tx, rx) = crossbeam::channel::bounded::<()>(1);
    ctrlc::set_handler(move || {
        let _ = tx.try_send(());
    })
    .context("installing signal handler")?;

    let ticks = crossbeam::channel::tick(scan_interval);
    loop {
        crossbeam::select! {
            recv(rx) -> signal => {
                signal.context("signal channel closed")?;
                break;
            }
            recv(ticks) -> _ => hotplug.scan(&registry),
        }
    }

    info!("Shutting down, restoring hardware mode");
    registry.stop_all();
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::ListDevices => {
            init_logging(false);
            list_devices()
        }
        Commands::Run { config, verbose } => {
            init_logging(verbose);
            run(config)
        }
    }
}
