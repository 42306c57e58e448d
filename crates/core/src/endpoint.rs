//! Logical endpoint protocol: open/read/close and chunked streaming writes.
//!
//! Reads follow close -> open(kind) -> read [-> read...] -> close. The first
//! read reply announces the total data length; the device returns the rest in
//! continuation replies that the reader concatenates.
//!
//! Writes wrap the payload in `{u16 len, data-type}` and split it into
//! `max_chunk` pieces: the first piece goes out with the family's first
//! opcode (`write` or `write-color`), the rest with `write-next`.

use crate::error::{Error, Result};
use crate::protocol::{self, cmd, REPLY_DATA_OFFSET, REPLY_PAYLOAD_OFFSET};
use crate::transport::{Transport, TransferOptions};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, trace};

/// How a device is addressed on a transport.
///
/// Wired devices use command byte 0x08. Children of a dongle put their
/// sub-endpoint in the command byte. The controller uses command 0x02 and
/// carries its sub-endpoint in byte 2, ahead of the opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Address {
    pub command: u8,
    pub prefix: Option<u8>,
}

impl Address {
    pub const fn wired() -> Self {
        Self {
            command: protocol::COMMAND_WIRED,
            prefix: None,
        }
    }

    pub const fn sub_endpoint(sub: u8) -> Self {
        Self {
            command: sub,
            prefix: None,
        }
    }

    pub const fn controller(sub: u8) -> Self {
        Self {
            command: protocol::COMMAND_CONTROLLER,
            prefix: Some(sub),
        }
    }

    fn endpoint(&self, opcode: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(opcode.len() + 1);
        out.extend(self.prefix);
        out.extend_from_slice(opcode);
        out
    }
}

/// Send one opcode with payload and return the reply.
pub fn query(
    transport: &Transport,
    addr: Address,
    opcode: &[u8],
    payload: &[u8],
    opts: TransferOptions,
) -> Result<Vec<u8>> {
    transport.transfer(addr.command, &addr.endpoint(opcode), payload, opts)
}

/// Send a write whose reply carries nothing of interest.
///
/// A missing reply is not an error; write failures still are.
pub fn fire(transport: &Transport, addr: Address, opcode: &[u8], payload: &[u8]) -> Result<()> {
    match query(transport, addr, opcode, payload, TransferOptions::bounded()) {
        Ok(_) => Ok(()),
        Err(Error::Timeout(msg)) => {
            trace!(%msg, "write not acknowledged");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

pub fn open_endpoint(transport: &Transport, addr: Address, kind: u8) -> Result<()> {
    fire(transport, addr, cmd::OPEN_ENDPOINT, &[kind])
}

pub fn close_endpoint(transport: &Transport, addr: Address) -> Result<()> {
    fire(transport, addr, cmd::CLOSE_ENDPOINT, &[])
}

/// Read the full contents of a logical endpoint.
///
/// Returns the payload that follows the data-type tag. A failed or empty
/// continuation is reported as a disconnection rather than a short read.
pub fn read_endpoint(
    transport: &Transport,
    addr: Address,
    kind: u8,
    data_type: [u8; 2],
) -> Result<Vec<u8>> {
    let data = transport.exclusive(|| {
        close_endpoint(transport, addr)?;
        open_endpoint(transport, addr, kind)?;

        let result = read_open_endpoint(transport, addr, data_type);

        // The endpoint is closed even when the read failed.
        let closed = close_endpoint(transport, addr);
        let data = result?;
        closed?;
        Ok::<_, Error>(data)
    })?;

    debug!(
        kind = format_args!("0x{kind:02X}"),
        bytes = data.len(),
        "Endpoint read complete"
    );
    Ok(data)
}

fn read_open_endpoint(transport: &Transport, addr: Address, data_type: [u8; 2]) -> Result<Vec<u8>> {
    let first = query(
        transport,
        addr,
        cmd::READ,
        &[],
        TransferOptions::matching(data_type),
    )?;
    let header = protocol::decode_read_header(&first)?;
    if header.status != 0 {
        return Err(Error::protocol(
            "endpoint read",
            format!("device status 0x{:02X}", header.status),
        ));
    }
    if header.length > u16::MAX as usize {
        return Err(Error::protocol("endpoint read", "implausible length"));
    }

    let mut data = Vec::with_capacity(header.length);
    let first_chunk = &first[REPLY_PAYLOAD_OFFSET..];
    data.extend_from_slice(&first_chunk[..first_chunk.len().min(header.length)]);

    while data.len() < header.length {
        let next = query(transport, addr, cmd::READ, &[], TransferOptions::bounded())
            .map_err(|e| Error::Disconnected(format!("continuation read failed: {e}")))?;
        let chunk = next.get(REPLY_DATA_OFFSET..).unwrap_or_default();
        if chunk.is_empty() {
            return Err(Error::Disconnected(format!(
                "continuation read empty after {} of {} bytes",
                data.len(),
                header.length
            )));
        }
        let remaining = header.length - data.len();
        data.extend_from_slice(&chunk[..chunk.len().min(remaining)]);
    }

    Ok(data)
}

/// Stream `payload` as `{u16 len, data_type, payload}` in chunks.
///
/// Returns the number of frames written.
pub fn write_stream(
    transport: &Transport,
    addr: Address,
    first_opcode: &[u8],
    data_type: [u8; 2],
    payload: &[u8],
) -> Result<usize> {
    let stream = protocol::stream_envelope(data_type, payload)?;
    let chunks = protocol::chunk_stream(&stream, transport.layout().max_chunk);

    transport.exclusive(|| {
        for (i, chunk) in chunks.iter().enumerate() {
            let opcode = if i == 0 { first_opcode } else { cmd::WRITE_NEXT };
            fire(transport, addr, opcode, chunk)?;
        }
        Ok::<_, Error>(())
    })?;

    trace!(
        frames = chunks.len(),
        bytes = stream.len(),
        "Stream write complete"
    );
    Ok(chunks.len())
}

/// Open/close policy for the colour endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorEndpointMode {
    /// Every frame is wrapped in open -> stream -> close -> flush.
    Bracketed,
    /// Opened on the first frame and held for the session.
    Session,
}

/// Colour frame writer for one device.
#[derive(Debug)]
pub struct ColorWriter {
    mode: ColorEndpointMode,
    opened: AtomicBool,
}

impl ColorWriter {
    pub fn new(mode: ColorEndpointMode) -> Self {
        Self {
            mode,
            opened: AtomicBool::new(false),
        }
    }

    pub fn mode(&self) -> ColorEndpointMode {
        self.mode
    }

    /// Forget the session endpoint (after a mode switch or reconnect).
    pub fn reset(&self) {
        self.opened.store(false, Ordering::SeqCst);
    }

    /// Write one colour frame. Returns the number of data frames streamed.
    pub fn write(
        &self,
        transport: &Transport,
        addr: Address,
        data_type: [u8; 2],
        payload: &[u8],
    ) -> Result<usize> {
        transport.exclusive(|| -> Result<usize> {
            match self.mode {
                ColorEndpointMode::Session => {
                    if !self.opened.load(Ordering::SeqCst) {
                        open_endpoint(transport, addr, protocol::endpoints::COLOR)?;
                        self.opened.store(true, Ordering::SeqCst);
                    }
                    write_stream(transport, addr, cmd::WRITE_COLOR, data_type, payload)
                }
                ColorEndpointMode::Bracketed => {
                    open_endpoint(transport, addr, protocol::endpoints::COLOR)?;
                    let frames = write_stream(transport, addr, cmd::WRITE_COLOR, data_type, payload)?;
                    close_endpoint(transport, addr)?;
                    fire(transport, addr, cmd::FLUSH, &[])?;
                    Ok(frames)
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{data_types, endpoints};
    use crate::transport::mock;

    fn read_reply(len: u16, tag: [u8; 2], data: &[u8]) -> Vec<u8> {
        let mut r = vec![0x08, 0x00, 0x00];
        r.extend_from_slice(&len.to_le_bytes());
        r.extend_from_slice(&tag);
        r.extend_from_slice(data);
        r
    }

    #[test]
    fn address_prefixes_controller_sub_endpoint() {
        let (transport, handle) = mock::transport();
        query(
            &transport,
            Address::controller(0x09),
            cmd::FIRMWARE,
            &[],
            TransferOptions::default(),
        )
        .unwrap();
        assert_eq!(&handle.writes()[0][..5], &[0x00, 0x02, 0x09, 0x02, 0x13]);
    }

    #[test]
    fn read_endpoint_brackets_with_close_open_close() {
        let (transport, handle) = mock::transport();
        handle.set_responder(|frame| {
            (frame[2..4] == cmd::READ[..]).then(|| read_reply(3, data_types::SPEEDS, &[1, 2, 3]))
        });

        let data = read_endpoint(&transport, Address::wired(), endpoints::SPEEDS, data_types::SPEEDS)
            .unwrap();
        assert_eq!(data, vec![1, 2, 3]);

        let writes = handle.writes();
        assert_eq!(writes.len(), 4);
        assert_eq!(&writes[0][2..5], cmd::CLOSE_ENDPOINT);
        assert_eq!(&writes[1][2..5], &[0x0d, 0x01, endpoints::SPEEDS]);
        assert_eq!(&writes[2][2..4], cmd::READ);
        assert_eq!(&writes[3][2..5], cmd::CLOSE_ENDPOINT);
    }

    #[test]
    fn read_endpoint_concatenates_continuations() {
        let (transport, handle) = mock::transport();
        let payload: Vec<u8> = (0..150u16).map(|i| i as u8).collect();
        let first = read_reply(150, data_types::DEVICES, &payload[..57]);
        let mut second = vec![0x08, 0x00, 0x00];
        second.extend_from_slice(&payload[57..118]);
        let mut third = vec![0x08, 0x00, 0x00];
        third.extend_from_slice(&payload[118..]);

        let mut reads = vec![third, second, first];
        handle.set_responder(move |frame| {
            if frame[2..4] == cmd::READ[..] {
                reads.pop()
            } else {
                None
            }
        });

        let data =
            read_endpoint(&transport, Address::wired(), endpoints::DEVICES, data_types::DEVICES)
                .unwrap();
        assert_eq!(data, payload);
    }

    #[test]
    fn read_endpoint_rejects_error_status() {
        let (transport, handle) = mock::transport();
        handle.set_responder(|frame| {
            (frame[2..4] == cmd::READ[..]).then(|| {
                let mut r = read_reply(1, data_types::SPEEDS, &[0]);
                r[1] = 0x03;
                r
            })
        });
        let err = read_endpoint(&transport, Address::wired(), endpoints::SPEEDS, data_types::SPEEDS)
            .unwrap_err();
        assert!(matches!(err, Error::Protocol { .. }));
        // Endpoint still closed after the failure.
        assert_eq!(&handle.writes().last().unwrap()[2..5], cmd::CLOSE_ENDPOINT);
    }

    #[test]
    fn write_stream_tags_first_and_next_chunks() {
        let (transport, handle) = mock::transport();
        let payload = vec![0x55; 100];
        let frames =
            write_stream(&transport, Address::wired(), cmd::WRITE, data_types::KEY_ASSIGNMENT, &payload)
                .unwrap();
        assert_eq!(frames, 2);

        let writes = handle.writes();
        assert_eq!(&writes[0][2..4], cmd::WRITE);
        assert_eq!(&writes[0][4..8], &[100, 0, 0x0d, 0x00]);
        assert_eq!(&writes[1][2..4], cmd::WRITE_NEXT);
    }

    #[test]
    fn session_color_writer_opens_once() {
        let (transport, handle) = mock::transport();
        let writer = ColorWriter::new(ColorEndpointMode::Session);
        writer
            .write(&transport, Address::wired(), data_types::COLOR, &[1, 2, 3])
            .unwrap();
        writer
            .write(&transport, Address::wired(), data_types::COLOR, &[4, 5, 6])
            .unwrap();
        assert_eq!(handle.writes_to(cmd::OPEN_ENDPOINT).len(), 1);
        assert_eq!(handle.writes_to(cmd::WRITE_COLOR).len(), 2);

        writer.reset();
        writer
            .write(&transport, Address::wired(), data_types::COLOR, &[7, 8, 9])
            .unwrap();
        assert_eq!(handle.writes_to(cmd::OPEN_ENDPOINT).len(), 2);
    }

    #[test]
    fn bracketed_color_writer_closes_and_flushes() {
        let (transport, handle) = mock::transport();
        let writer = ColorWriter::new(ColorEndpointMode::Bracketed);
        writer
            .write(&transport, Address::wired(), data_types::COLOR, &[1, 2, 3])
            .unwrap();
        let writes = handle.writes();
        assert_eq!(writes.len(), 4);
        assert_eq!(&writes[0][2..4], cmd::OPEN_ENDPOINT);
        assert_eq!(&writes[1][2..4], cmd::WRITE_COLOR);
        assert_eq!(&writes[2][2..5], cmd::CLOSE_ENDPOINT);
        assert_eq!(&writes[3][2..4], cmd::FLUSH);
    }
}
