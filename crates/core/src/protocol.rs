//! CORSAIR vendor protocol encoding and decoding.
//!
//! Every request is a single HID output report:
//! - byte 0: report ID (always 0x00)
//! - byte 1: command byte (0x08 wired, 0x02 controller, or a dongle sub-endpoint)
//! - bytes 2..: endpoint/opcode bytes, then payload, zero padded
//!
//! Replies are plain input reports. Simple queries carry their data from byte 3;
//! endpoint reads carry `[echo, status, _, len_lo, len_hi, tag0, tag1, data...]`.

use crate::error::{Error, Result};

/// Report ID prepended to every write.
pub const REPORT_ID: u8 = 0x00;

/// Offset of query data in a reply.
pub const REPLY_DATA_OFFSET: usize = 3;
/// Offset of the data-type tag in an endpoint read reply.
pub const REPLY_TAG_OFFSET: usize = 5;
/// Offset of the payload in the first endpoint read reply.
pub const REPLY_PAYLOAD_OFFSET: usize = 7;

/// Command byte used by wired mice, keyboards, hubs and the dongle itself.
pub const COMMAND_WIRED: u8 = 0x08;
/// Command byte used by the SCUF controller.
pub const COMMAND_CONTROLLER: u8 = 0x02;

/// Fixed report geometry for a device family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportLayout {
    /// Bytes written per request, including the report ID.
    pub write_len: usize,
    /// Bytes read per reply.
    pub read_len: usize,
    /// Largest chunk of a streamed payload that fits in one request.
    pub max_chunk: usize,
}

impl ReportLayout {
    /// Keyboards, mice, the controller and the dongle.
    pub const STANDARD: Self = Self {
        write_len: 65,
        read_len: 64,
        max_chunk: 61,
    };

    /// iCUE LINK hub.
    pub const LINK_HUB: Self = Self {
        write_len: 513,
        read_len: 512,
        max_chunk: 508,
    };
}

/// Device-agnostic opcodes.
pub mod cmd {
    pub const OPEN_ENDPOINT: &[u8] = &[0x0d, 0x01];
    pub const CLOSE_ENDPOINT: &[u8] = &[0x05, 0x01, 0x01];
    pub const READ: &[u8] = &[0x08, 0x01];
    pub const WRITE: &[u8] = &[0x06, 0x01];
    pub const WRITE_COLOR: &[u8] = &[0x06, 0x00];
    pub const WRITE_NEXT: &[u8] = &[0x07, 0x01];
    pub const FLUSH: &[u8] = &[0x15, 0x01];
    pub const SOFTWARE_MODE: &[u8] = &[0x01, 0x03, 0x00, 0x02];
    pub const HARDWARE_MODE: &[u8] = &[0x01, 0x03, 0x00, 0x01];
    pub const FIRMWARE: &[u8] = &[0x02, 0x13];
    pub const BATTERY: &[u8] = &[0x02, 0x0f];
    pub const HEARTBEAT: &[u8] = &[0x12];
    pub const DEVICE_MODE: &[u8] = &[0x02, 0x03, 0x00];
    pub const SET_DPI_X: &[u8] = &[0x01, 0x21, 0x00];
    pub const SET_DPI_Y: &[u8] = &[0x01, 0x22, 0x00];
    pub const SET_POLLING_RATE: &[u8] = &[0x01, 0x01, 0x00];
    pub const SET_SLEEP_TIMER: &[u8] = &[0x01, 0x0e, 0x00];
    pub const SET_BRIGHTNESS: &[u8] = &[0x01, 0x02, 0x00];
    pub const SET_VIBRATION: &[u8] = &[0x01, 0x6b, 0x00];
}

/// Logical endpoint kinds passed to `OPEN_ENDPOINT`.
pub mod endpoints {
    pub const DEVICES: u8 = 0x36;
    pub const SPEEDS: u8 = 0x17;
    pub const TEMPERATURES: u8 = 0x21;
    pub const SET_SPEED: u8 = 0x18;
    pub const COLOR: u8 = 0x22;
    pub const KEY_ASSIGNMENT: u8 = 0x1e;
}

/// Data-type markers written in stream headers and matched in read replies.
pub mod data_types {
    pub const DEVICES: [u8; 2] = [0x21, 0x00];
    pub const SPEEDS: [u8; 2] = [0x25, 0x00];
    pub const TEMPERATURES: [u8; 2] = [0x10, 0x00];
    pub const SET_SPEED: [u8; 2] = [0x07, 0x00];
    pub const COLOR: [u8; 2] = [0x12, 0x00];
    pub const KEY_ASSIGNMENT: [u8; 2] = [0x0d, 0x00];
}

/// Build a zero-padded write buffer for the given layout.
pub fn encode_frame(
    layout: ReportLayout,
    command: u8,
    endpoint: &[u8],
    payload: &[u8],
) -> Result<Vec<u8>> {
    let used = 2 + endpoint.len() + payload.len();
    if used > layout.write_len {
        return Err(Error::protocol(
            "encode_frame",
            format!("{used} bytes exceed {}-byte report", layout.write_len),
        ));
    }

    let mut buf = vec![0u8; layout.write_len];
    buf[0] = REPORT_ID;
    buf[1] = command;
    buf[2..2 + endpoint.len()].copy_from_slice(endpoint);
    buf[2 + endpoint.len()..used].copy_from_slice(payload);
    Ok(buf)
}

/// Prefix a payload with `{u16 LE length, data-type marker}`.
///
/// The length field counts the payload only; payloads longer than
/// `u16::MAX` are rejected.
pub fn stream_envelope(data_type: [u8; 2], payload: &[u8]) -> Result<Vec<u8>> {
    let len = u16::try_from(payload.len()).map_err(|_| Error::OutOfRange {
        field: "stream length",
        value: payload.len() as i64,
        min: 0,
        max: u16::MAX.into(),
    })?;
    let mut out = Vec::with_capacity(payload.len() + 4);
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&data_type);
    out.extend_from_slice(payload);
    Ok(out)
}

/// Split a stream into per-request chunks of at most `max_chunk` bytes.
pub fn chunk_stream(stream: &[u8], max_chunk: usize) -> Vec<&[u8]> {
    if stream.is_empty() {
        return vec![stream];
    }
    stream.chunks(max_chunk.max(1)).collect()
}

/// Firmware version triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
pub struct FirmwareVersion {
    pub major: u8,
    pub minor: u8,
    pub patch: u16,
}

impl std::fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Decode a firmware query reply: `[_, _, _, major, minor, patch_lo, patch_hi]`.
pub fn decode_firmware(reply: &[u8]) -> Result<FirmwareVersion> {
    let data = reply
        .get(REPLY_DATA_OFFSET..REPLY_DATA_OFFSET + 4)
        .ok_or_else(|| Error::protocol("firmware", format!("reply too short: {}", reply.len())))?;
    Ok(FirmwareVersion {
        major: data[0],
        minor: data[1],
        patch: u16::from_le_bytes([data[2], data[3]]),
    })
}

/// Decode a battery query reply. The device reports decipercent at bytes 3..5.
pub fn decode_battery(reply: &[u8]) -> Result<u8> {
    let data = reply
        .get(REPLY_DATA_OFFSET..REPLY_DATA_OFFSET + 2)
        .ok_or_else(|| Error::protocol("battery", format!("reply too short: {}", reply.len())))?;
    let decipercent = u16::from_le_bytes([data[0], data[1]]);
    Ok((decipercent / 10).min(100) as u8)
}

/// Header of the first reply to an endpoint read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadHeader {
    pub status: u8,
    pub length: usize,
    pub data_type: [u8; 2],
}

/// Decode the `{status, length, tag}` header of an endpoint read reply.
pub fn decode_read_header(reply: &[u8]) -> Result<ReadHeader> {
    if reply.len() < REPLY_PAYLOAD_OFFSET {
        return Err(Error::protocol(
            "read header",
            format!("reply too short: {}", reply.len()),
        ));
    }
    Ok(ReadHeader {
        status: reply[1],
        length: u16::from_le_bytes([reply[3], reply[4]]) as usize,
        data_type: [reply[REPLY_TAG_OFFSET], reply[REPLY_TAG_OFFSET + 1]],
    })
}

/// Whether a reply carries the given data-type tag at bytes 5..7.
pub fn reply_matches(reply: &[u8], tag: [u8; 2]) -> bool {
    reply.get(REPLY_TAG_OFFSET..REPLY_TAG_OFFSET + 2) == Some(&tag[..])
}

/// Decode a `{count, [status, lo, hi] x count}` value table.
///
/// Returns `(entry index, value)` for every entry whose status is zero.
pub fn decode_channel_values(payload: &[u8]) -> Result<Vec<(usize, i16)>> {
    let count = *payload
        .first()
        .ok_or_else(|| Error::protocol("channel values", "empty payload"))? as usize;
    let needed = 1 + count * 3;
    if payload.len() < needed {
        return Err(Error::protocol(
            "channel values",
            format!("{count} entries need {needed} bytes, got {}", payload.len()),
        ));
    }

    Ok(payload[1..needed]
        .chunks_exact(3)
        .enumerate()
        .filter(|(_, entry)| entry[0] == 0)
        .map(|(i, entry)| (i, i16::from_le_bytes([entry[1], entry[2]])))
        .collect())
}

/// Convert a raw temperature value (decidegrees) to degrees Celsius.
pub fn decidegrees_to_celsius(raw: i16) -> f32 {
    raw as f32 / 10.0
}
