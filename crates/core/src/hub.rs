//! iCUE LINK hub driver.
//!
//! The hub enumerates its chained cooling devices once, after software mode
//! is acknowledged. Channel ids are the 1-based positions in the device
//! list; empty positions are skipped but still consume an id, so the map
//! never gains or loses entries afterwards. Speed and temperature refreshes
//! only mutate the value fields.

use crate::driver::{self, DeviceCore, DeviceFamily, DriverContext, Link};
use crate::endpoint::ColorEndpointMode;
use crate::error::{Error, Result};
use crate::lighting::{self, ActiveRgb, FixedFrame, Rgb};
use crate::profile::{self, DeviceProfile};
use crate::protocol::{self, cmd, data_types, endpoints};
use crate::safety;
use crate::state::DeviceState;
use crate::transport::Transport;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use tracing::{debug, info, trace, warn};

pub const PRODUCT_NAME: &str = "iCUE LINK System Hub";

/// Bytes before the id string in a device-list entry.
const ENTRY_HEADER: usize = 8;

/// Speed write value modes.
const SPEED_MODE_PERCENT: u8 = 0x00;

/// Static description of a LINK device type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkDeviceKind {
    pub type_id: u8,
    pub model: u8,
    pub name: &'static str,
    pub led_count: usize,
    pub pump: bool,
    /// Accepts speed writes.
    pub cooling: bool,
}

const fn kind(
    type_id: u8,
    model: u8,
    name: &'static str,
    led_count: usize,
    pump: bool,
    cooling: bool,
) -> LinkDeviceKind {
    LinkDeviceKind {
        type_id,
        model,
        name,
        led_count,
        pump,
        cooling,
    }
}

/// Known LINK devices, keyed by `(type, model)`.
pub const DEVICE_TABLE: &[LinkDeviceKind] = &[
    kind(0x01, 0x00, "QX Fan", 34, false, true),
    kind(0x02, 0x00, "LX Fan", 18, false, true),
    kind(0x03, 0x00, "RX RGB Fan", 8, false, true),
    kind(0x0f, 0x00, "RX Fan", 0, false, true),
    kind(0x07, 0x00, "H100i AIO", 20, true, true),
    kind(0x07, 0x01, "H115i AIO", 20, true, true),
    kind(0x07, 0x02, "H150i AIO", 20, true, true),
    kind(0x07, 0x03, "H170i AIO", 20, true, true),
    kind(0x09, 0x00, "XC7 CPU Block", 24, false, false),
    kind(0x0c, 0x00, "XD5 Pump Reservoir", 22, true, true),
    kind(0x0a, 0x00, "XG3 GPU Block", 18, false, false),
    kind(0x05, 0x02, "LS350 Light Strip", 21, false, false),
    kind(0x05, 0x01, "LS430 Light Strip", 27, false, false),
    kind(0x0b, 0x00, "LINK Adapter", 0, false, false),
];

pub fn lookup_kind(type_id: u8, model: u8) -> Option<&'static LinkDeviceKind> {
    DEVICE_TABLE
        .iter()
        .find(|k| k.type_id == type_id && k.model == model)
}

/// One device chained to the hub.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LinkDevice {
    pub channel: u8,
    pub type_id: u8,
    pub model: u8,
    pub id: String,
    pub name: String,
    pub led_count: usize,
    pub contains_pump: bool,
    pub cooling: bool,
    pub rpm: i16,
    pub temperature: f32,
    /// Speed percent applied at boot.
    pub default_value: u8,
}

/// Parse `{count, [type, model, _ x5, id_len, id...] x count}`.
///
/// Entry `i` (1-based) becomes channel `i`. Empty entries (`id_len == 0`)
/// occupy only their 8-byte header and produce no device.
pub fn parse_device_list(payload: &[u8]) -> Result<BTreeMap<u8, LinkDevice>> {
    let count = *payload
        .first()
        .ok_or_else(|| Error::protocol("device list", "empty payload"))? as usize;
    let mut cursor = 1;
    let mut devices = BTreeMap::new();

    for index in 1..=count {
        let header = payload.get(cursor..cursor + ENTRY_HEADER).ok_or_else(|| {
            Error::protocol("device list", format!("entry {index} truncated at byte {cursor}"))
        })?;
        let (type_id, model, id_len) = (header[0], header[1], header[7] as usize);
        cursor += ENTRY_HEADER;
        if id_len == 0 {
            continue;
        }
        let id = payload.get(cursor..cursor + id_len).ok_or_else(|| {
            Error::protocol("device list", format!("entry {index} id truncated"))
        })?;
        cursor += id_len;

        let channel = u8::try_from(index)
            .map_err(|_| Error::protocol("device list", "too many channels"))?;
        let known = lookup_kind(type_id, model);
        if known.is_none() {
            debug!(channel, type_id, model, "Unknown LINK device");
        }
        devices.insert(
            channel,
            LinkDevice {
                channel,
                type_id,
                model,
                id: String::from_utf8_lossy(id).trim_end_matches('\0').to_string(),
                name: known.map_or_else(|| "Unknown LINK Device".to_string(), |k| k.name.to_string()),
                led_count: known.map_or(0, |k| k.led_count),
                contains_pump: known.is_some_and(|k| k.pump),
                cooling: known.is_some_and(|k| k.cooling),
                rpm: 0,
                temperature: 0.0,
                default_value: 0,
            },
        );
    }
    Ok(devices)
}

/// Speed write payload: `{count, [channel, mode, lo, hi] x count}`.
pub fn speed_payload(speeds: &BTreeMap<u8, u8>) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + speeds.len() * 4);
    out.push(speeds.len() as u8);
    for (&channel, &percent) in speeds {
        out.extend_from_slice(&[channel, SPEED_MODE_PERCENT, percent, 0x00]);
    }
    out
}

/// Flat RGB stream over all channels, in ascending channel order.
pub fn color_stream(devices: &BTreeMap<u8, LinkDevice>, colors: &BTreeMap<u8, Rgb>) -> Vec<u8> {
    devices
        .iter()
        .flat_map(|(channel, d)| {
            lighting::solid(colors.get(channel).copied().unwrap_or(Rgb::BLACK), d.led_count)
        })
        .collect()
}

/// Detects the `0 -> 1 -> 0` device-mode sequence a hub goes through after waking.
#[derive(Debug, Default)]
pub struct WakeMonitor {
    initialising: bool,
}

impl WakeMonitor {
    /// Feed one device-mode sample; `true` on the closing 0 edge.
    pub fn observe(&mut self, mode: u8) -> bool {
        match mode {
            1 => {
                self.initialising = true;
                false
            }
            0 if self.initialising => {
                self.initialising = false;
                true
            }
            _ => false,
        }
    }
}

#[derive(Debug, Default)]
struct HubSettings {
    profile: DeviceProfile,
    colors: BTreeMap<u8, Rgb>,
    speeds: BTreeMap<u8, u8>,
}

/// LINK hub driver.
pub struct LinkHub {
    me: Weak<Self>,
    core: DeviceCore,
    ctx: DriverContext,
    devices: RwLock<BTreeMap<u8, LinkDevice>>,
    settings: Mutex<HubSettings>,
    wake: Mutex<WakeMonitor>,
}

impl std::fmt::Debug for LinkHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkHub")
            .field("core", &self.core)
            .field("channels", &self.devices.read().len())
            .finish()
    }
}

impl LinkHub {
    pub fn new(transport: Transport, serial: &str, ctx: DriverContext) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            core: DeviceCore::new(
                PRODUCT_NAME,
                serial,
                Link::wired(transport),
                ColorEndpointMode::Session,
                &ctx.config,
            ),
            ctx,
            devices: RwLock::new(BTreeMap::new()),
            settings: Mutex::new(HubSettings::default()),
            wake: Mutex::new(WakeMonitor::default()),
        })
    }

    /// Snapshot of the chained devices.
    pub fn devices(&self) -> BTreeMap<u8, LinkDevice> {
        self.devices.read().clone()
    }

    fn enumerate(&self) -> Result<()> {
        if !self.devices.read().is_empty() {
            return Ok(());
        }
        let payload = self
            .core
            .read_endpoint(endpoints::DEVICES, data_types::DEVICES)?;
        let devices = parse_device_list(&payload)?;
        for d in devices.values() {
            info!(
                channel = d.channel,
                name = %d.name,
                leds = d.led_count,
                pump = d.contains_pump,
                "LINK device"
            );
        }
        *self.devices.write() = devices;
        Ok(())
    }

    /// Read fan/pump speeds; entries with a non-zero status keep their old value.
    pub fn refresh_speeds(&self) -> Result<()> {
        let payload = self
            .core
            .read_endpoint(endpoints::SPEEDS, data_types::SPEEDS)?;
        let values = protocol::decode_channel_values(&payload)?;
        let mut devices = self.devices.write();
        for (index, rpm) in values {
            if let Some(d) = channel_of(index).and_then(|ch| devices.get_mut(&ch)) {
                d.rpm = rpm;
            }
        }
        trace!(serial = %self.core.serial(), "Speeds refreshed");
        Ok(())
    }

    /// Read temperatures; entries with a non-zero status keep their old value.
    pub fn refresh_temperatures(&self) -> Result<()> {
        let payload = self
            .core
            .read_endpoint(endpoints::TEMPERATURES, data_types::TEMPERATURES)?;
        let values = protocol::decode_channel_values(&payload)?;
        let mut devices = self.devices.write();
        for (index, raw) in values {
            if let Some(d) = channel_of(index).and_then(|ch| devices.get_mut(&ch)) {
                d.temperature = protocol::decidegrees_to_celsius(raw);
            }
        }
        Ok(())
    }

    fn write_speeds(&self, speeds: &BTreeMap<u8, u8>) -> Result<()> {
        if speeds.is_empty() {
            return Ok(());
        }
        self.core.write_endpoint(
            endpoints::SET_SPEED,
            cmd::WRITE,
            data_types::SET_SPEED,
            &speed_payload(speeds),
        )?;
        Ok(())
    }

    /// Boot speeds: profile override, then daemon custom speed, then the fan
    /// default. Pumps never go below the pump floor.
    fn apply_default_speeds(&self) -> Result<()> {
        let config = &self.ctx.config;
        let mut settings = self.settings.lock();
        let mut speeds = BTreeMap::new();
        {
            let mut devices = self.devices.write();
            for (&channel, d) in devices.iter_mut().filter(|(_, d)| d.cooling) {
                let requested = settings
                    .profile
                    .channel_speeds
                    .get(&channel)
                    .or_else(|| config.custom_speeds.get(&channel))
                    .copied()
                    .unwrap_or(config.fan_default_percent);
                let percent = match safety::validate_fan_percent(
                    requested,
                    d.contains_pump,
                    config.pump_min_percent,
                ) {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(channel, error = %e, "Ignoring stored speed");
                        safety::validate_fan_percent(
                            config.fan_default_percent,
                            d.contains_pump,
                            config.pump_min_percent,
                        )?
                    }
                };
                d.default_value = percent;
                speeds.insert(channel, percent);
            }
        }
        self.write_speeds(&speeds)?;
        settings.speeds = speeds;
        Ok(())
    }

    /// Set one channel's speed. Returns the percent actually applied.
    pub fn set_channel_speed(&self, channel: u8, percent: u8) -> Result<u8> {
        let device = self
            .devices
            .read()
            .get(&channel)
            .cloned()
            .ok_or_else(|| Error::DeviceNotFound(format!("LINK channel {channel}")))?;
        if !device.cooling {
            return Err(Error::DeviceNotFound(format!(
                "LINK channel {channel} has no fan or pump"
            )));
        }
        let applied = safety::validate_fan_percent(
            percent,
            device.contains_pump,
            self.ctx.config.pump_min_percent,
        )?;
        let mut settings = self.settings.lock();
        self.write_speeds(&BTreeMap::from([(channel, applied)]))?;
        settings.speeds.insert(channel, applied);
        debug!(channel, percent = applied, "Channel speed set");
        Ok(applied)
    }

    /// Last applied speed per channel.
    pub fn speeds(&self) -> BTreeMap<u8, u8> {
        self.settings.lock().speeds.clone()
    }

    /// Colour one channel, or every channel when `channel == 0`.
    ///
    /// The whole stream is regenerated in channel order; the firmware maps
    /// it onto LEDs positionally.
    pub fn set_device_color(&self, channel: u8, color: Rgb) -> Result<()> {
        let devices = self.devices.read().clone();
        let (stream, brightness) = {
            let mut settings = self.settings.lock();
            if channel == 0 {
                for &ch in devices.keys() {
                    settings.colors.insert(ch, color);
                }
            } else if devices.contains_key(&channel) {
                settings.colors.insert(channel, color);
            } else {
                return Err(Error::DeviceNotFound(format!("LINK channel {channel}")));
            }
            (
                color_stream(&devices, &settings.colors),
                lighting::brightness_factor(settings.profile.brightness as i32),
            )
        };
        self.start_rgb(stream, brightness)
    }

    fn start_rgb(&self, stream: Vec<u8>, brightness: f64) -> Result<()> {
        let led_count = stream.len() / 3;
        if led_count == 0 {
            self.core.stop_rgb();
            return Ok(());
        }
        let hub = self.me.clone();
        let rgb = ActiveRgb::start(
            &format!("{}-{}", PRODUCT_NAME, self.core.serial()),
            self.ctx.config.rgb_refresh(),
            led_count,
            brightness,
            Box::new(FixedFrame(stream)),
            move |frame| match hub.upgrade() {
                Some(hub) => hub.core.write_color(data_types::COLOR, frame),
                None => Ok(()),
            },
        )?;
        self.core.set_rgb(Some(rgb));
        Ok(())
    }

    fn apply_profile_colors(&self) -> Result<()> {
        let devices = self.devices.read().clone();
        let (stream, brightness) = {
            let mut settings = self.settings.lock();
            let base = settings.profile.color;
            let zones = settings.profile.zone_colors.clone();
            settings.colors = devices
                .keys()
                .map(|&ch| (ch, zones.get(&ch).copied().unwrap_or(base)))
                .collect();
            (
                color_stream(&devices, &settings.colors),
                lighting::brightness_factor(settings.profile.brightness as i32),
            )
        };
        self.start_rgb(stream, brightness)
    }

    fn poll_device_mode(&self) {
        let mode = match self.core.command(cmd::DEVICE_MODE, &[]) {
            Ok(reply) => reply.get(protocol::REPLY_DATA_OFFSET).copied().unwrap_or(0),
            Err(e) => {
                debug!(error = %e, "Device mode read failed");
                return;
            }
        };
        if !self.wake.lock().observe(mode) {
            return;
        }
        info!(serial = %self.core.serial(), "Hub re-initialised after wake, re-arming");
        let hub = self.me.clone();
        let spawned = self.core.spawn_worker("rearm", move || {
            if let Some(hub) = hub.upgrade() {
                if let Err(e) = hub.init() {
                    warn!(error = %e, "Hub re-arm failed");
                }
            }
        });
        if let Err(e) = spawned {
            warn!(error = %e, "Could not start hub re-arm");
        }
    }

    fn start_tickers(&self) -> Result<()> {
        let config = &self.ctx.config;
        self.core.spawn_ticker(
            "keepalive",
            config.keep_alive(),
            driver::weak_task(self.me.clone(), |hub: &LinkHub| {
                if let Err(e) = hub.keep_alive() {
                    warn!(error = %e, "Hub heartbeat failed");
                }
            }),
        )?;
        self.core.spawn_ticker(
            "speeds",
            config.speed_refresh(),
            driver::weak_task(self.me.clone(), |hub: &LinkHub| {
                if let Err(e) = hub.refresh_speeds() {
                    debug!(error = %e, "Speed refresh failed");
                }
            }),
        )?;
        self.core.spawn_ticker(
            "temperatures",
            config.temperature_refresh(),
            driver::weak_task(self.me.clone(), |hub: &LinkHub| {
                if let Err(e) = hub.refresh_temperatures() {
                    debug!(error = %e, "Temperature refresh failed");
                }
                hub.poll_device_mode();
            }),
        )?;
        Ok(())
    }
}

fn channel_of(index: usize) -> Option<u8> {
    u8::try_from(index + 1).ok()
}

impl DeviceFamily for LinkHub {
    fn core(&self) -> &DeviceCore {
        &self.core
    }

    fn init(&self) -> Result<()> {
        driver::begin_init(&self.core)?;
        self.core.read_firmware()?;
        self.enumerate()?;
        self.core.lifecycle().advance(DeviceState::Identified);

        let profile = profile::profile_or_default(self.ctx.profiles.as_ref(), &self.core.serial());
        self.settings.lock().profile = profile;
        if let Err(e) = self.apply_default_speeds() {
            warn!(error = %e, "Default speeds not applied");
        }
        if let Err(e) = self.apply_profile_colors() {
            warn!(error = %e, "Initial colours not applied");
        }
        self.start_tickers()?;

        self.core.lifecycle().advance(DeviceState::Ready);
        info!(
            serial = %self.core.serial(),
            channels = self.devices.read().len(),
            "LINK hub ready"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DaemonConfig;
    use crate::input::NullSink;
    use crate::profile::MemoryProfileStore;
    use crate::transport::mock::{self, MockHandle};

    fn entry(type_id: u8, model: u8, id: &str) -> Vec<u8> {
        let mut out = vec![type_id, model, 0, 0, 0, 0, 0, id.len() as u8];
        out.extend_from_slice(id.as_bytes());
        out
    }

    fn device_list(entries: &[Vec<u8>]) -> Vec<u8> {
        let mut out = vec![entries.len() as u8];
        for e in entries {
            out.extend_from_slice(e);
        }
        out
    }

    /// Reply for the first read of an endpoint carrying `payload`.
    fn read_reply(tag: [u8; 2], payload: &[u8]) -> Vec<u8> {
        let mut out = vec![0x08, 0x00, 0x00];
        out.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        out.extend_from_slice(&tag);
        out.extend_from_slice(payload);
        out
    }

    fn hub_with(
        config: DaemonConfig,
        store: MemoryProfileStore,
    ) -> (Arc<LinkHub>, MockHandle) {
        let (transport, handle) = mock::transport();
        let ctx = DriverContext {
            sink: Arc::new(NullSink),
            config: Arc::new(config),
            profiles: Arc::new(store),
        };
        (LinkHub::new(transport, "HUB1", ctx), handle)
    }

    #[test]
    fn empty_entries_keep_their_channel_id() {
        let payload = device_list(&[
            entry(0x01, 0x00, "AAAA"),
            entry(0x01, 0x00, "BBBB"),
            entry(0x00, 0x00, ""),
            entry(0x07, 0x02, "PUMP"),
        ]);
        let devices = parse_device_list(&payload).unwrap();
        assert_eq!(devices.keys().copied().collect::<Vec<_>>(), vec![1, 2, 4]);
        assert!(!devices.contains_key(&3));
        let pump = &devices[&4];
        assert_eq!(pump.id, "PUMP");
        assert_eq!(pump.name, "H150i AIO");
        assert!(pump.contains_pump);
    }

    #[test]
    fn unknown_devices_are_kept_without_leds() {
        let devices = parse_device_list(&device_list(&[entry(0x7f, 0x7f, "X")])).unwrap();
        assert_eq!(devices[&1].led_count, 0);
        assert!(!devices[&1].cooling);
    }

    #[test]
    fn truncated_list_is_a_protocol_error() {
        let mut payload = device_list(&[entry(0x01, 0x00, "AAAA")]);
        payload.truncate(6);
        assert!(matches!(
            parse_device_list(&payload),
            Err(Error::Protocol { .. })
        ));
    }

    #[test]
    fn speed_payload_layout() {
        let speeds = BTreeMap::from([(1, 40), (4, 60)]);
        assert_eq!(
            speed_payload(&speeds),
            vec![2, 1, 0x00, 40, 0x00, 4, 0x00, 60, 0x00]
        );
    }

    #[test]
    fn color_stream_follows_channel_order() {
        let devices = parse_device_list(&device_list(&[
            entry(0x03, 0x00, "A"),
            entry(0x00, 0x00, ""),
            entry(0x03, 0x00, "B"),
        ]))
        .unwrap();
        let colors = BTreeMap::from([(3, Rgb::new(0, 0, 9)), (1, Rgb::new(1, 0, 0))]);
        let stream = color_stream(&devices, &colors);
        assert_eq!(stream.len(), 16 * 3);
        assert_eq!(&stream[..3], &[1, 0, 0]);
        assert_eq!(&stream[24..27], &[0, 0, 9]);
    }

    #[test]
    fn wake_monitor_fires_on_second_zero() {
        let mut wake = WakeMonitor::default();
        assert!(!wake.observe(0));
        assert!(!wake.observe(1));
        assert!(!wake.observe(1));
        assert!(wake.observe(0));
        assert!(!wake.observe(0));
    }

    fn seed(hub: &LinkHub, payload: &[u8]) {
        *hub.devices.write() = parse_device_list(payload).unwrap();
    }

    #[test]
    fn default_speeds_respect_pump_floor_and_overrides() {
        let config = DaemonConfig {
            fan_default_percent: 30,
            pump_min_percent: 50,
            custom_speeds: BTreeMap::from([(2, 80)]),
            ..DaemonConfig::default()
        };
        let (hub, handle) = hub_with(config, MemoryProfileStore::new());
        seed(
            &hub,
            &device_list(&[
                entry(0x01, 0x00, "F1"),
                entry(0x01, 0x00, "F2"),
                entry(0x07, 0x00, "P"),
                entry(0x05, 0x02, "S"),
            ]),
        );
        hub.apply_default_speeds().unwrap();
        assert_eq!(hub.speeds(), BTreeMap::from([(1, 30), (2, 80), (3, 50)]));

        let writes = handle.writes_to(cmd::WRITE);
        assert_eq!(writes.len(), 1);
        // {len, marker, count, ...}
        assert_eq!(&writes[0][4..9], &[13, 0, 0x07, 0x00, 3]);
    }

    #[test]
    fn channel_speed_validates_before_writing() {
        let (hub, handle) = hub_with(DaemonConfig::default(), MemoryProfileStore::new());
        seed(
            &hub,
            &device_list(&[entry(0x01, 0x00, "F1"), entry(0x07, 0x00, "P")]),
        );
        assert!(hub.set_channel_speed(1, 101).is_err());
        assert!(hub.set_channel_speed(9, 50).is_err());
        assert!(handle.writes().is_empty());

        assert_eq!(hub.set_channel_speed(2, 20).unwrap(), 50);
        assert_eq!(hub.set_channel_speed(1, 20).unwrap(), 20);
    }

    #[test]
    fn refresh_keeps_stale_values_for_bad_status() {
        let (hub, handle) = hub_with(DaemonConfig::default(), MemoryProfileStore::new());
        seed(
            &hub,
            &device_list(&[
                entry(0x01, 0x00, "A"),
                entry(0x01, 0x00, "B"),
                entry(0x01, 0x00, "C"),
            ]),
        );
        hub.devices.write().get_mut(&3).unwrap().rpm = 999;

        let speeds = [3, 0x00, 0xDC, 0x05, 0x00, 0x20, 0x03, 0x01, 0x00, 0x00];
        handle.set_responder(move |frame| {
            (&frame[2..4] == cmd::READ).then(|| read_reply(data_types::SPEEDS, &speeds))
        });
        hub.refresh_speeds().unwrap();

        let devices = hub.devices();
        assert_eq!(devices[&1].rpm, 1500);
        assert_eq!(devices[&2].rpm, 800);
        assert_eq!(devices[&3].rpm, 999);
    }

    #[test]
    fn concurrent_speed_and_temperature_reads_stay_on_their_endpoint() {
        use std::thread;

        let (hub, handle) = hub_with(DaemonConfig::default(), MemoryProfileStore::new());
        seed(&hub, &device_list(&[entry(0x01, 0x00, "A")]));

        // The device answers a read from whichever endpoint is open.
        let mut open: Option<u8> = None;
        handle.set_responder(move |frame| {
            if &frame[2..4] == cmd::OPEN_ENDPOINT {
                open = Some(frame[4]);
                None
            } else if &frame[2..5] == cmd::CLOSE_ENDPOINT {
                open = None;
                None
            } else if &frame[2..4] == cmd::READ {
                match open {
                    Some(endpoints::SPEEDS) => {
                        Some(read_reply(data_types::SPEEDS, &[1, 0x00, 0xDC, 0x05]))
                    }
                    Some(endpoints::TEMPERATURES) => {
                        Some(read_reply(data_types::TEMPERATURES, &[1, 0x00, 0xFA, 0x00]))
                    }
                    _ => None,
                }
            } else {
                None
            }
        });

        let speeds = {
            let hub = Arc::clone(&hub);
            thread::spawn(move || (0..40).filter(|_| hub.refresh_speeds().is_err()).count())
        };
        let temperatures = {
            let hub = Arc::clone(&hub);
            thread::spawn(move || (0..40).filter(|_| hub.refresh_temperatures().is_err()).count())
        };
        assert_eq!(speeds.join().expect("thread panicked"), 0);
        assert_eq!(temperatures.join().expect("thread panicked"), 0);

        let devices = hub.devices();
        assert_eq!(devices[&1].rpm, 1500);
        assert_eq!(devices[&1].temperature, 25.0);
    }

    #[test]
    fn set_device_color_streams_every_channel() {
        let (hub, handle) = hub_with(DaemonConfig::default(), MemoryProfileStore::new());
        seed(
            &hub,
            &device_list(&[entry(0x03, 0x00, "A"), entry(0x03, 0x00, "B")]),
        );
        hub.set_device_color(2, Rgb::new(0, 255, 0)).unwrap();
        hub.core.stop_rgb();

        let first = &handle.writes_to(cmd::WRITE_COLOR)[0];
        // {len=48, marker, channel 1 black..., channel 2 green...}
        assert_eq!(&first[4..8], &[48, 0, 0x12, 0x00]);
        assert_eq!(&first[8..11], &[0, 0, 0]);
        assert_eq!(&first[32..35], &[0, 255, 0]);
        assert!(hub.set_device_color(7, Rgb::BLACK).is_err());
    }
}
