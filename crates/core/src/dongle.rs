//! SLIPSTREAM wireless dongle.
//!
//! The dongle reads its paired list at init and builds one child driver per
//! entry. Children share the dongle's transport and put their sub-endpoint in
//! the command byte. The dongle alone decides when a child is connected: it
//! probes each child at init, reacts to connection reports from its listener,
//! and marks a child disconnected when its heartbeat fails.

use crate::controller::Controller;
use crate::device::{self, ProductKind};
use crate::driver::{self, side_band, Device, DeviceCore, DeviceFamily, DriverContext, Link};
use crate::endpoint::{self, Address, ColorEndpointMode};
use crate::error::{Error, Result};
use crate::keyboard::Keyboard;
use crate::mouse::Mouse;
use crate::protocol::{cmd, data_types, endpoints};
use crate::state::DeviceState;
use crate::transport::{Transport, TransferOptions};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

pub const PRODUCT_NAME: &str = "SLIPSTREAM WIRELESS USB Receiver";
const ENTRY_HEADER: usize = 6;
const CONNECTION_EVENT: u8 = 0x36;
const CODE_CONNECTED: u8 = 0x02;
const CODE_DISCONNECTED: u8 = 0x00;
/// Report types forwarded verbatim to every child.
const FORWARDED: [u8; 2] = [0x02, 0x05];
const SETTLE_POLL: Duration = Duration::from_millis(50);

/// One entry of the dongle's paired list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PairedDevice {
    pub sub_endpoint: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    pub serial: String,
}

/// Parse `{count, [sub, vid_lo, vid_hi, pid_lo, pid_hi, serial_len, serial...]}`.
pub fn parse_paired_list(payload: &[u8]) -> Result<Vec<PairedDevice>> {
    let count = *payload
        .first()
        .ok_or_else(|| Error::protocol("paired list", "empty payload"))? as usize;
    let mut cursor = 1;
    let mut out = Vec::with_capacity(count);
    for index in 0..count {
        let h = payload.get(cursor..cursor + ENTRY_HEADER).ok_or_else(|| {
            Error::protocol("paired list", format!("entry {index} truncated at byte {cursor}"))
        })?;
        let serial_len = h[5] as usize;
        cursor += ENTRY_HEADER;
        let serial = payload.get(cursor..cursor + serial_len).ok_or_else(|| {
            Error::protocol("paired list", format!("entry {index} serial truncated"))
        })?;
        cursor += serial_len;
        out.push(PairedDevice {
            sub_endpoint: h[0],
            vendor_id: u16::from_le_bytes([h[1], h[2]]),
            product_id: u16::from_le_bytes([h[3], h[4]]),
            serial: String::from_utf8_lossy(serial).trim_end_matches('\0').to_string(),
        });
    }
    Ok(out)
}

/// Build the driver for a paired entry, or `None` for unsupported products.
fn build_child(paired: &PairedDevice, transport: &Transport, ctx: &DriverContext) -> Option<Device> {
    let product = device::product_for(paired.vendor_id, paired.product_id)?;
    let link = Link::wireless(transport.clone(), paired.sub_endpoint);
    let ctx = ctx.clone();
    let serial = paired.serial.as_str();
    match product.kind {
        ProductKind::Keyboard(model) => {
            Some(Device::Keyboard(Keyboard::new(model, link, serial, None, ctx)))
        }
        ProductKind::Mouse(model) => Some(Device::Mouse(Mouse::new(model, link, serial, None, ctx))),
        ProductKind::Controller => Some(Device::Controller(Controller::new(link, serial, None, ctx))),
        ProductKind::LinkHub | ProductKind::Dongle => None,
    }
}

#[derive(Debug, Clone)]
struct Child {
    paired: PairedDevice,
    device: Device,
}

/// Dongle driver.
pub struct Dongle {
    me: Weak<Self>,
    core: DeviceCore,
    ctx: DriverContext,
    children: RwLock<Vec<Child>>,
    /// Exactly one paired entry; fixed when the paired list is read.
    single_device: AtomicBool,
    listener: Mutex<Option<Transport>>,
}

impl std::fmt::Debug for Dongle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dongle")
            .field("core", &self.core)
            .field("children", &self.children.read().len())
            .finish()
    }
}

impl Dongle {
    pub fn new(transport: Transport, serial: &str, listener: Option<Transport>, ctx: DriverContext) -> Arc<Self> {
        let core = DeviceCore::new(
            PRODUCT_NAME,
            serial,
            Link::wired(transport),
            ColorEndpointMode::Session,
            &ctx.config,
        );
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            core,
            ctx,
            children: RwLock::new(Vec::new()),
            single_device: AtomicBool::new(false),
            listener: Mutex::new(listener),
        })
    }

    pub fn children(&self) -> Vec<Device> {
        self.children.read().iter().map(|c| c.device.clone()).collect()
    }

    pub fn paired(&self) -> Vec<PairedDevice> {
        self.children.read().iter().map(|c| c.paired.clone()).collect()
    }

    pub fn is_single_device(&self) -> bool {
        self.single_device.load(Ordering::SeqCst)
    }

    fn enumerate(&self) -> Result<()> {
        if !self.children.read().is_empty() {
            return Ok(());
        }
        let payload = self
            .core
            .read_endpoint(endpoints::DEVICES, data_types::DEVICES)?;
        self.adopt(parse_paired_list(&payload)?);
        Ok(())
    }

    fn adopt(&self, entries: Vec<PairedDevice>) {
        self.single_device.store(entries.len() == 1, Ordering::SeqCst);
        let children: Vec<Child> = entries
            .into_iter()
            .filter_map(|paired| {
                match build_child(&paired, self.core.transport(), &self.ctx) {
                    Some(device) => {
                        info!(
                            sub_endpoint = format_args!("0x{:02X}", paired.sub_endpoint),
                            pid = format_args!("0x{:04X}", paired.product_id),
                            serial = %paired.serial,
                            kind = device.kind(),
                            "Paired device"
                        );
                        Some(Child { paired, device })
                    }
                    None => {
                        warn!(
                            pid = format_args!("0x{:04X}", paired.product_id),
                            serial = %paired.serial,
                            "Unsupported paired device"
                        );
                        None
                    }
                }
            })
            .collect();
        *self.children.write() = children;
    }

    /// Heartbeat on a child's sub-endpoint, bypassing its connection flag.
    fn probe(&self, child: &Child) -> bool {
        endpoint::query(
            self.core.transport(),
            Address::sub_endpoint(child.paired.sub_endpoint),
            cmd::HEARTBEAT,
            &[],
            TransferOptions::bounded(),
        )
        .is_ok()
    }

    fn connect_child(&self, child: &Child) {
        let family = child.device.family();
        if let Err(e) = family.connect() {
            warn!(serial = %child.paired.serial, error = %e, "Paired device failed to start");
            family.set_connected(false);
            return;
        }
        if self.is_single_device() {
            if let Some(minutes) = family.sleep_mode() {
                let ms = minutes.saturating_mul(60_000);
                if let Err(e) = self.core.fire(cmd::SET_SLEEP_TIMER, &ms.to_le_bytes()) {
                    warn!(error = %e, "Dongle sleep timer not applied");
                }
            }
        }
    }

    /// Connect every disconnected child that answers a heartbeat.
    fn connect_reachable(&self) {
        let children = self.children.read().clone();
        for child in &children {
            if self.core.lifecycle().is_exiting() {
                return;
            }
            if child.device.family().core().is_connected() {
                continue;
            }
            if self.probe(child) {
                self.connect_child(child);
            } else {
                debug!(serial = %child.paired.serial, "Paired device not answering");
            }
        }
    }

    fn disconnect_all(&self) {
        for child in self.children.read().iter() {
            child.device.family().set_connected(false);
        }
        info!("Paired devices disconnected");
    }

    /// Route one report from the dongle's listener.
    pub fn handle_report(&self, data: &[u8]) {
        if data.first() == Some(&side_band::WIRED) && data.get(1) == Some(&CONNECTION_EVENT) {
            match data.get(3).copied() {
                Some(CODE_CONNECTED) => {
                    let settle = self.ctx.config.connect_settle();
                    let exit = self.core.exit_flag();
                    let dongle = self.me.clone();
                    let spawned = self.core.spawn_worker("connect", move || {
                        let until = Instant::now() + settle;
                        while Instant::now() < until && !exit.is_set() {
                            thread::sleep(SETTLE_POLL.min(settle));
                        }
                        if let Some(dongle) = dongle.upgrade() {
                            dongle.connect_reachable();
                        }
                    });
                    if let Err(e) = spawned {
                        warn!(error = %e, "Connect worker not started");
                    }
                }
                Some(CODE_DISCONNECTED) => self.disconnect_all(),
                other => trace!(code = ?other, "Unknown connection code"),
            }
            return;
        }

        if data.get(1).is_some_and(|b| FORWARDED.contains(b)) {
            for child in self.children.read().iter() {
                child.device.family().trigger_key_assignment(data);
            }
        }
    }

    /// Dongle heartbeat, then a heartbeat and battery poll per connected child.
    fn keep_alive_all(&self) {
        if let Err(e) = self.core.heartbeat() {
            warn!(error = %e, "Dongle heartbeat failed");
        }
        let children = self.children.read().clone();
        for child in &children {
            let family = child.device.family();
            if !family.core().is_connected() {
                continue;
            }
            if let Err(e) = family.keep_alive() {
                debug!(serial = %child.paired.serial, error = %e, "Paired device lost");
                family.set_connected(false);
                continue;
            }
            match family.core().query_battery() {
                Ok(level) => family.modify_battery_level(level),
                Err(e) => debug!(serial = %child.paired.serial, error = %e, "Battery not reported"),
            }
        }
    }

    fn start_background(&self) -> Result<()> {
        self.core.spawn_ticker(
            "keepalive",
            self.ctx.config.dongle_keep_alive(),
            driver::weak_task(self.me.clone(), Dongle::keep_alive_all),
        )?;
        if let Some(listener) = self.listener.lock().take() {
            let dongle = self.me.clone();
            self.core.spawn_listener(
                "listener",
                listener,
                self.ctx.config.listener_timeout(),
                move |data| {
                    if let Some(d) = dongle.upgrade() {
                        d.handle_report(data);
                    }
                },
            )?;
        }
        Ok(())
    }
}

impl DeviceFamily for Dongle {
    fn core(&self) -> &DeviceCore {
        &self.core
    }

    fn init(&self) -> Result<()> {
        driver::begin_init(&self.core)?;
        self.core.read_firmware()?;
        self.core.lifecycle().advance(DeviceState::Identified);
        self.enumerate()?;
        self.start_background()?;
        self.core.lifecycle().advance(DeviceState::Ready);
        info!(
            serial = %self.core.serial(),
            paired = self.children.read().len(),
            "Dongle ready"
        );

        let dongle = self.me.clone();
        self.core.spawn_worker("probe", move || {
            if let Some(d) = dongle.upgrade() {
                d.connect_reachable();
            }
        })
    }

    fn stop(&self) {
        for child in self.children() {
            child.family().stop();
        }
        self.core.stop(true);
    }

    fn stop_dirty(&self) {
        for child in self.children() {
            child.family().stop_dirty();
        }
        self.core.stop(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DaemonConfig;
    use crate::input::mock::{Emitted, RecordingSink};
    use crate::input::{keys, KeyMotion};
    use crate::keymap::{ActionKind, KeyAssignment};
    use crate::profile::MemoryProfileStore;
    use crate::transport::mock::{self, MockHandle};
    use crate::CORSAIR_VID;

    fn entry(sub: u8, pid: u16, serial: &str) -> Vec<u8> {
        let mut out = vec![sub];
        out.extend_from_slice(&CORSAIR_VID.to_le_bytes());
        out.extend_from_slice(&pid.to_le_bytes());
        out.push(serial.len() as u8);
        out.extend_from_slice(serial.as_bytes());
        out
    }

    fn paired_list(entries: &[Vec<u8>]) -> Vec<u8> {
        let mut out = vec![entries.len() as u8];
        entries.iter().for_each(|e| out.extend_from_slice(e));
        out
    }

    fn dongle() -> (Arc<Dongle>, MockHandle, RecordingSink) {
        let (transport, handle) = mock::transport();
        let sink = RecordingSink::new();
        let config = DaemonConfig {
            software_mode_retries: 1,
            ..DaemonConfig::default()
        };
        let ctx = DriverContext {
            sink: Arc::new(sink.clone()),
            config: Arc::new(config),
            profiles: Arc::new(MemoryProfileStore::new()),
        };
        (Dongle::new(transport, "DONGLE1", None, ctx), handle, sink)
    }

    #[test]
    fn paired_list_yields_sub_endpoints_and_ids() {
        let payload = paired_list(&[entry(0x09, 0x2b10, "KB-A"), entry(0x0a, 0x1b9e, "MS-B")]);
        let paired = parse_paired_list(&payload).unwrap();
        assert_eq!(
            paired[1],
            PairedDevice {
                sub_endpoint: 0x0a,
                vendor_id: CORSAIR_VID,
                product_id: 0x1b9e,
                serial: "MS-B".into(),
            }
        );
        assert!(parse_paired_list(&payload[..8]).is_err());
    }

    #[test]
    fn unsupported_children_are_skipped_and_single_flag_follows_list() {
        let (d, _, _) = dongle();
        let list = |e: &[Vec<u8>]| parse_paired_list(&paired_list(e)).unwrap();
        d.adopt(list(&[entry(0x09, 0x2b10, "KB-A"), entry(0x0a, 0x0001, "X")]));
        assert_eq!(d.children().len(), 1);
        assert!(!d.is_single_device());

        d.adopt(list(&[entry(0x09, 0x1b9e, "MS-B")]));
        assert!(d.is_single_device());
        assert_eq!(d.children()[0].kind(), "mouse");
    }

    #[test]
    fn children_start_disconnected_and_silent() {
        let (d, handle, _) = dongle();
        d.adopt(parse_paired_list(&paired_list(&[entry(0x09, 0x2b10, "KB-A")])).unwrap());
        let children = d.children();
        let child = &children[0];
        assert!(!child.family().core().is_connected());
        assert!(child.family().keep_alive().is_err());
        assert!(handle.writes().is_empty());
    }

    #[test]
    fn forwarded_button_reports_reach_the_child_mapping() {
        let (d, _, sink) = dongle();
        d.adopt(parse_paired_list(&paired_list(&[entry(0x09, 0x2b10, "KB-A")])).unwrap());
        let children = d.children();
        let Device::Keyboard(kb) = &children[0] else {
            panic!("expected a keyboard");
        };
        kb.engine().keymap().update(|map| {
            map.insert(
                1 << 2,
                KeyAssignment::mapped("g3", 2, ActionKind::Keyboard, keys::KEY_A),
            );
        });

        d.handle_report(&[0x09, 0x02, 0x00, 0x00, 1 << 2, 0, 0, 0]);
        assert_eq!(sink.events(), vec![Emitted::Key(keys::KEY_A, KeyMotion::OneShot)]);

        d.handle_report(&[0x09, 0x03, 0x00, 0x00, 0, 0, 0, 0]);
        assert_eq!(sink.events().len(), 1);
    }

    #[test]
    fn disconnect_report_marks_every_child() {
        let (d, _, _) = dongle();
        d.adopt(
            parse_paired_list(&paired_list(&[entry(0x09, 0x2b10, "KB-A"), entry(0x0a, 0x1b9e, "MS-B")]))
                .unwrap(),
        );
        for child in d.children() {
            child.family().core().set_connected(true);
        }
        d.handle_report(&[0x01, 0x36, 0x00, 0x00]);
        assert!(d.children().iter().all(|c| !c.family().core().is_connected()));
    }

    #[test]
    fn failed_child_heartbeat_disconnects_only_that_child() {
        let (d, handle, _) = dongle();
        d.adopt(parse_paired_list(&paired_list(&[entry(0x09, 0x2b10, "KB-A")])).unwrap());
        let child = d.children()[0].clone();
        child.family().core().set_connected(true);

        handle.fail_writes(true);
        d.keep_alive_all();
        assert!(!child.family().core().is_connected());
    }
}
