//! Shared device driver machinery.
//!
//! Every driver owns a [`DeviceCore`]: the transport and address, the
//! lifecycle flags, the tickers and background threads, and the colour
//! writer. Behaviour that differs per family sits behind [`DeviceFamily`];
//! the registry holds drivers as the tagged [`Device`] variant.

use crate::comm::{self, ErrorClass, STATE_MACHINE_RETRIES};
use crate::config::DaemonConfig;
use crate::controller::Controller;
use crate::dongle::Dongle;
use crate::endpoint::{self, Address, ColorEndpointMode, ColorWriter};
use crate::error::{Error, Result};
use crate::hub::LinkHub;
use crate::input::InputSink;
use crate::keyboard::Keyboard;
use crate::lighting::ActiveRgb;
use crate::mouse::Mouse;
use crate::profile::ProfileStore;
use crate::protocol::{self, cmd, FirmwareVersion};
use crate::state::{DeviceState, ExitFlag, Lifecycle};
use crate::ticker::Ticker;
use crate::transport::{Transport, TransferOptions};
use parking_lot::{Mutex, RwLock};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Collaborators every driver needs.
#[derive(Clone)]
pub struct DriverContext {
    pub sink: Arc<dyn InputSink>,
    pub config: Arc<DaemonConfig>,
    pub profiles: Arc<dyn ProfileStore>,
}

impl std::fmt::Debug for DriverContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverContext")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// How a core reaches its device.
#[derive(Debug, Clone)]
pub struct Link {
    pub transport: Transport,
    pub addr: Address,
    /// Child of a dongle: the handle is borrowed and `connected` gates I/O.
    pub wireless: bool,
}

impl Link {
    pub fn new(transport: Transport, addr: Address, wireless: bool) -> Self {
        Self {
            transport,
            addr,
            wireless,
        }
    }

    pub fn wired(transport: Transport) -> Self {
        Self {
            transport,
            addr: Address::wired(),
            wireless: false,
        }
    }

    pub fn wireless(transport: Transport, sub_endpoint: u8) -> Self {
        Self {
            transport,
            addr: Address::sub_endpoint(sub_endpoint),
            wireless: true,
        }
    }
}

/// State and I/O common to all drivers.
pub struct DeviceCore {
    product: String,
    link: Link,
    lifecycle: Lifecycle,
    serial: RwLock<String>,
    firmware: RwLock<Option<FirmwareVersion>>,
    color: ColorWriter,
    tickers: Mutex<Vec<Ticker>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    rgb: Mutex<Option<ActiveRgb>>,
    software_mode_attempts: u32,
    software_mode_delay: Duration,
}

impl std::fmt::Debug for DeviceCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceCore")
            .field("product", &self.product)
            .field("serial", &*self.serial.read())
            .field("state", &self.lifecycle.state())
            .field("wireless", &self.link.wireless)
            .finish()
    }
}

impl DeviceCore {
    pub fn new(
        product: &str,
        serial: &str,
        link: Link,
        color_mode: ColorEndpointMode,
        config: &DaemonConfig,
    ) -> Self {
        let lifecycle = Lifecycle::new(format!("{product} {serial}"));
        // Wireless children stay offline until the dongle connects them.
        lifecycle.set_connected(!link.wireless);
        Self {
            product: product.to_string(),
            lifecycle,
            serial: RwLock::new(serial.to_string()),
            firmware: RwLock::new(None),
            color: ColorWriter::new(color_mode),
            tickers: Mutex::new(Vec::new()),
            threads: Mutex::new(Vec::new()),
            rgb: Mutex::new(None),
            software_mode_attempts: config.software_mode_retries.max(1),
            software_mode_delay: config.software_mode_retry_delay(),
            link,
        }
    }

    pub fn product(&self) -> &str {
        &self.product
    }

    pub fn serial(&self) -> String {
        self.serial.read().clone()
    }

    pub fn set_serial(&self, serial: &str) {
        *self.serial.write() = serial.to_string();
    }

    pub fn firmware(&self) -> Option<FirmwareVersion> {
        *self.firmware.read()
    }

    pub fn transport(&self) -> &Transport {
        &self.link.transport
    }

    pub fn addr(&self) -> Address {
        self.link.addr
    }

    pub fn is_wireless(&self) -> bool {
        self.link.wireless
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    pub fn exit_flag(&self) -> ExitFlag {
        self.lifecycle.exit_flag()
    }

    pub fn is_connected(&self) -> bool {
        self.lifecycle.is_connected()
    }

    /// Refuse state-machine I/O on a disconnected wireless child.
    pub fn ensure_reachable(&self) -> Result<()> {
        if self.link.wireless && !self.lifecycle.is_connected() {
            return Err(Error::Disconnected(format!("{} is not connected", self.product)));
        }
        Ok(())
    }

    fn after_failure(&self, err: &Error) {
        if self.link.wireless
            && matches!(
                ErrorClass::classify(err),
                ErrorClass::Transient | ErrorClass::Disconnected
            )
        {
            warn!(device = %self.product, error = %err, "Wireless transfer failed twice, marking disconnected");
            self.set_connected(false);
        }
    }

    /// Send a command and return its reply, retrying once.
    pub fn command(&self, opcode: &[u8], payload: &[u8]) -> Result<Vec<u8>> {
        self.ensure_reachable()?;
        let result = comm::with_retry(STATE_MACHINE_RETRIES, || {
            endpoint::query(
                &self.link.transport,
                self.link.addr,
                opcode,
                payload,
                TransferOptions::bounded(),
            )
        });
        if let Err(e) = &result {
            self.after_failure(e);
        }
        result
    }

    /// Send a command whose reply is not needed, retrying once.
    pub fn fire(&self, opcode: &[u8], payload: &[u8]) -> Result<()> {
        self.ensure_reachable()?;
        let result = comm::with_retry(STATE_MACHINE_RETRIES, || {
            endpoint::fire(&self.link.transport, self.link.addr, opcode, payload)
        });
        if let Err(e) = &result {
            self.after_failure(e);
        }
        result
    }

    /// Read a logical endpoint.
    pub fn read_endpoint(&self, kind: u8, data_type: [u8; 2]) -> Result<Vec<u8>> {
        self.ensure_reachable()?;
        endpoint::read_endpoint(&self.link.transport, self.link.addr, kind, data_type)
    }

    /// Stream a payload to an already-open endpoint.
    pub fn write_stream(&self, first_opcode: &[u8], data_type: [u8; 2], payload: &[u8]) -> Result<usize> {
        self.ensure_reachable()?;
        endpoint::write_stream(&self.link.transport, self.link.addr, first_opcode, data_type, payload)
    }

    /// Open `kind`, stream `payload` with `first_opcode`, then close.
    pub fn write_endpoint(
        &self,
        kind: u8,
        first_opcode: &[u8],
        data_type: [u8; 2],
        payload: &[u8],
    ) -> Result<usize> {
        self.ensure_reachable()?;
        let t = &self.link.transport;
        t.exclusive(|| -> Result<usize> {
            endpoint::open_endpoint(t, self.link.addr, kind)?;
            let frames = endpoint::write_stream(t, self.link.addr, first_opcode, data_type, payload)?;
            endpoint::close_endpoint(t, self.link.addr)?;
            Ok(frames)
        })
    }

    /// Push a colour frame. Disconnected wireless children drop frames silently.
    pub fn write_color(&self, data_type: [u8; 2], payload: &[u8]) -> Result<()> {
        if self.link.wireless && !self.lifecycle.is_connected() {
            trace!(device = %self.product, "Dropping colour frame while disconnected");
            return Ok(());
        }
        if self.lifecycle.is_exiting() {
            return Ok(());
        }
        self.color
            .write(&self.link.transport, self.link.addr, data_type, payload)
            .map(|_| ())
    }

    /// Enter software mode, retrying on the configured schedule.
    pub fn enter_software_mode(&self) -> Result<()> {
        self.lifecycle.advance(DeviceState::Opening);
        let mut last = None;
        for attempt in 1..=self.software_mode_attempts {
            if self.lifecycle.is_exiting() {
                return Err(Error::Disconnected(format!("{} is stopping", self.product)));
            }
            match self.command(cmd::SOFTWARE_MODE, &[]) {
                Ok(_) => {
                    self.lifecycle.advance(DeviceState::SoftwareMode);
                    debug!(device = %self.product, attempt, "Software mode acknowledged");
                    return Ok(());
                }
                Err(e) => {
                    debug!(device = %self.product, attempt, error = %e, "Software mode not acknowledged");
                    last = Some(e);
                    if attempt < self.software_mode_attempts {
                        thread::sleep(self.software_mode_delay);
                    }
                }
            }
        }
        Err(last.unwrap_or_else(|| Error::Timeout("software mode".into())))
    }

    pub fn enter_hardware_mode(&self) -> Result<()> {
        self.command(cmd::HARDWARE_MODE, &[])?;
        self.lifecycle.advance(DeviceState::HardwareMode);
        Ok(())
    }

    pub fn read_firmware(&self) -> Result<FirmwareVersion> {
        let reply = self.command(cmd::FIRMWARE, &[])?;
        let fw = protocol::decode_firmware(&reply)?;
        *self.firmware.write() = Some(fw);
        debug!(device = %self.product, firmware = %fw, "Firmware read");
        Ok(fw)
    }

    /// Battery level in percent. Storing it is left to the family hook.
    pub fn query_battery(&self) -> Result<u8> {
        let reply = self.command(cmd::BATTERY, &[])?;
        protocol::decode_battery(&reply)
    }

    /// No-op keep-alive. Skipped once the device is exiting.
    pub fn heartbeat(&self) -> Result<()> {
        if self.lifecycle.is_exiting() {
            return Ok(());
        }
        self.command(cmd::HEARTBEAT, &[]).map(|_| ())
    }

    pub fn spawn_ticker<F>(&self, role: &str, interval: Duration, task: F) -> Result<()>
    where
        F: FnMut() -> bool + Send + 'static,
    {
        let ticker = Ticker::spawn(
            &format!("{}-{role}", self.product),
            interval,
            self.exit_flag(),
            task,
        )?;
        self.tickers.lock().push(ticker);
        Ok(())
    }

    /// Run a one-off job on its own thread, tracked so `stop` can join it.
    pub fn spawn_worker<F>(&self, role: &str, job: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let name = format!("{}-{role}", self.product);
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(job)
            .map_err(|e| Error::Fatal(format!("spawn worker {name}: {e}")))?;
        let mut threads = self.threads.lock();
        threads.retain(|h| !h.is_finished());
        threads.push(handle);
        Ok(())
    }

    /// Run `handler` on every report read from `listener` until exit.
    pub fn spawn_listener<F>(
        &self,
        role: &str,
        listener: Transport,
        timeout: Duration,
        mut handler: F,
    ) -> Result<()>
    where
        F: FnMut(&[u8]) + Send + 'static,
    {
        let exit = self.exit_flag();
        let name = format!("{}-{role}", self.product);
        let thread_name = name.clone();
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                debug!(listener = %thread_name, "Listener started");
                while !exit.is_set() {
                    match listener.read_input(timeout) {
                        Ok(Some(data)) => {
                            trace!(listener = %thread_name, report_hex = format_args!("{:02X?}", &data[..data.len().min(16)]), "Input report");
                            handler(&data);
                        }
                        Ok(None) => {}
                        Err(e) => {
                            if ErrorClass::classify(&e) == ErrorClass::Disconnected {
                                warn!(listener = %thread_name, error = %e, "Listener handle gone");
                                break;
                            }
                            warn!(listener = %thread_name, error = %e, "Listener read failed");
                            thread::sleep(timeout);
                        }
                    }
                }
                listener.close();
                debug!(listener = %thread_name, "Listener exiting");
            })
            .map_err(|e| Error::Fatal(format!("spawn listener {name}: {e}")))?;
        self.threads.lock().push(handle);
        Ok(())
    }

    /// Replace the RGB worker; the previous one is cancelled first.
    pub fn set_rgb(&self, rgb: Option<ActiveRgb>) {
        let previous = std::mem::replace(&mut *self.rgb.lock(), rgb);
        if let Some(previous) = previous {
            previous.stop();
        }
    }

    pub fn stop_rgb(&self) {
        self.set_rgb(None);
    }

    pub fn set_connected(&self, connected: bool) {
        self.lifecycle.set_connected(connected);
        if !connected {
            self.stop_rgb();
            self.color.reset();
        }
    }

    /// Stop tickers and the RGB worker without touching the exit flag.
    pub fn stop_background(&self) {
        self.stop_rgb();
        let tickers = std::mem::take(&mut *self.tickers.lock());
        for ticker in &tickers {
            ticker.stop();
        }
    }

    /// Shut the device down. A dirty stop skips hardware mode and the handle close.
    pub fn stop(&self, clean: bool) {
        if self.lifecycle.is_exiting() {
            return;
        }
        self.lifecycle.request_exit();
        self.lifecycle.advance(DeviceState::Stopping);
        self.stop_background();

        let threads = std::mem::take(&mut *self.threads.lock());
        for handle in threads {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }

        if clean {
            let reachable = !self.link.wireless || self.lifecycle.is_connected();
            if reachable {
                if let Err(e) = self.enter_hardware_mode() {
                    warn!(device = %self.product, error = %e, "Hardware mode restore failed");
                }
            }
            if !self.link.wireless {
                self.link.transport.close();
            }
        }
        self.lifecycle.advance(DeviceState::Closed);
        info!(device = %self.product, serial = %self.serial(), clean, "Device stopped");
    }
}

/// Family-specific behaviour.
pub trait DeviceFamily: Send + Sync {
    fn core(&self) -> &DeviceCore;

    /// Run the state machine up to READY.
    fn init(&self) -> Result<()>;

    fn stop(&self) {
        self.core().stop(true);
    }

    fn stop_dirty(&self) {
        self.core().stop(false);
    }

    fn serial(&self) -> String {
        self.core().serial()
    }

    fn product(&self) -> &str {
        self.core().product()
    }

    fn keep_alive(&self) -> Result<()> {
        self.core().heartbeat()
    }

    /// Sleep timer in minutes, for families that have one.
    fn sleep_mode(&self) -> Option<u32> {
        None
    }

    /// Input report forwarded by a dongle.
    fn trigger_key_assignment(&self, _data: &[u8]) {}

    fn modify_battery_level(&self, level: u8) {
        self.core().lifecycle().set_battery_level(level);
    }

    fn battery_level(&self) -> u8 {
        self.core().lifecycle().battery_level()
    }

    fn set_connected(&self, connected: bool) {
        self.core().set_connected(connected);
    }

    /// Wireless connect: mark connected and run the state machine again.
    fn connect(&self) -> Result<()> {
        self.set_connected(true);
        self.init()
    }
}

/// Common start of every `init`: clear leftovers from a previous session
/// and enter software mode.
pub(crate) fn begin_init(core: &DeviceCore) -> Result<()> {
    core.stop_background();
    core.color.reset();
    core.enter_software_mode()
}

/// Wrap a method on a weakly held driver as a ticker task.
pub(crate) fn weak_task<T, F>(weak: Weak<T>, f: F) -> impl FnMut() -> bool + Send + 'static
where
    T: Send + Sync + 'static,
    F: Fn(&T) + Send + 'static,
{
    move || match weak.upgrade() {
        Some(target) => {
            f(&target);
            true
        }
        None => false,
    }
}

/// Side-band report types (wired, forwarded by a dongle) and their subtypes.
pub(crate) mod side_band {
    pub const WIRED: u8 = 0x01;
    pub const WIRELESS: u8 = 0x05;
    pub const KNOB: u8 = 0x05;
    pub const BATTERY: u8 = 0x0f;
    pub const CONNECTION: u8 = 0x36;

    pub fn is_side_band(data: &[u8]) -> bool {
        matches!(data.get(1), Some(&WIRED) | Some(&WIRELESS))
    }

    /// Battery percentage from a battery side-band report (`data[4..6]`, LE
    /// tenths of a percent).
    pub fn battery(data: &[u8]) -> Option<u8> {
        if !is_side_band(data) || data.get(2) != Some(&BATTERY) {
            return None;
        }
        let raw = data.get(4..6)?;
        let decipercent = u16::from_le_bytes([raw[0], raw[1]]);
        Some((decipercent / 10).min(100) as u8)
    }
}

/// A driver of any family.
#[derive(Clone)]
pub enum Device {
    LinkHub(Arc<LinkHub>),
    Keyboard(Arc<Keyboard>),
    Mouse(Arc<Mouse>),
    Controller(Arc<Controller>),
    Dongle(Arc<Dongle>),
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("kind", &self.kind())
            .field("core", self.family().core())
            .finish()
    }
}

impl Device {
    pub fn family(&self) -> &dyn DeviceFamily {
        match self {
            Self::LinkHub(d) => d.as_ref(),
            Self::Keyboard(d) => d.as_ref(),
            Self::Mouse(d) => d.as_ref(),
            Self::Controller(d) => d.as_ref(),
            Self::Dongle(d) => d.as_ref(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::LinkHub(_) => "link-hub",
            Self::Keyboard(_) => "keyboard",
            Self::Mouse(_) => "mouse",
            Self::Controller(_) => "controller",
            Self::Dongle(_) => "dongle",
        }
    }

    pub fn serial(&self) -> String {
        self.family().serial()
    }

    pub fn state(&self) -> DeviceState {
        self.family().core().lifecycle().state()
    }
}
