//! HID transport: owns one HID handle and serializes request/response pairs.
//!
//! Real hidapi devices and the test mock share the [`HidIo`] interface. A
//! [`Transport`] wraps one handle behind a mutex that is held across the
//! write and its read, so two threads can never interleave replies. Multi-frame
//! exchanges (endpoint open/read/close, chunked writes) additionally run under
//! [`Transport::exclusive`], a reentrant sequence lock that every transfer
//! also takes. Clones share the handle; this is how a dongle lends its handle
//! to its children.

use crate::error::{Error, Result};
use crate::protocol::{self, ReportLayout};
use parking_lot::{Mutex, ReentrantMutex};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Deadline for a response-matching read loop.
pub const RESPONSE_DEADLINE: Duration = Duration::from_millis(500);
/// Bounded read timeout used by listeners and short queries.
pub const READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Raw HID read/write.
pub trait HidIo: Send {
    /// Write one output report.
    fn write(&mut self, data: &[u8]) -> Result<usize>;

    /// Read one input report. `timeout_ms < 0` blocks. Returns 0 on timeout.
    fn read_timeout(&mut self, buf: &mut [u8], timeout_ms: i32) -> Result<usize>;
}

impl HidIo for hidapi::HidDevice {
    fn write(&mut self, data: &[u8]) -> Result<usize> {
        hidapi::HidDevice::write(self, data).map_err(|e| Error::Transfer(format!("write: {e}")))
    }

    fn read_timeout(&mut self, buf: &mut [u8], timeout_ms: i32) -> Result<usize> {
        hidapi::HidDevice::read_timeout(self, buf, timeout_ms)
            .map_err(|e| Error::Transfer(format!("read: {e}")))
    }
}

/// Per-transfer options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferOptions {
    /// Bounded read instead of a blocking one.
    pub timeout: Option<Duration>,
    /// Keep reading until bytes 5..7 of the reply carry this tag.
    pub response_match: Option<[u8; 2]>,
    /// Skip the read entirely (fire-and-forget writes).
    pub read_reply: bool,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            response_match: None,
            read_reply: true,
        }
    }
}

impl TransferOptions {
    pub fn bounded() -> Self {
        Self {
            timeout: Some(READ_TIMEOUT),
            ..Self::default()
        }
    }

    pub fn matching(tag: [u8; 2]) -> Self {
        Self {
            timeout: Some(READ_TIMEOUT),
            response_match: Some(tag),
            read_reply: true,
        }
    }

    pub fn no_reply() -> Self {
        Self {
            read_reply: false,
            ..Self::default()
        }
    }
}

struct Inner {
    // Lock order: sequence, then io.
    sequence: ReentrantMutex<()>,
    io: Mutex<Option<Box<dyn HidIo>>>,
    layout: ReportLayout,
    name: String,
}

/// Shared, serialized access to one HID handle.
#[derive(Clone)]
pub struct Transport {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("name", &self.inner.name)
            .field("layout", &self.inner.layout)
            .finish()
    }
}

impl Transport {
    pub fn new(io: Box<dyn HidIo>, layout: ReportLayout, name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                sequence: ReentrantMutex::new(()),
                io: Mutex::new(Some(io)),
                layout,
                name: name.into(),
            }),
        }
    }

    pub fn layout(&self) -> ReportLayout {
        self.inner.layout
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn is_open(&self) -> bool {
        self.inner.io.lock().is_some()
    }

    /// Drop the underlying handle. Later transfers fail with `Error::Transfer`.
    pub fn close(&self) {
        if self.inner.io.lock().take().is_some() {
            debug!(transport = %self.inner.name, "HID handle closed");
        }
    }

    /// Run `f` with the handle reserved for the calling thread.
    ///
    /// Transfers from other threads (and other clones of this transport)
    /// wait until `f` returns. Nested calls on the same thread are allowed.
    pub fn exclusive<T>(&self, f: impl FnOnce() -> T) -> T {
        let _sequence = self.inner.sequence.lock();
        f()
    }

    /// Send one framed request and read its reply under the transport mutex.
    pub fn transfer(
        &self,
        command: u8,
        endpoint: &[u8],
        payload: &[u8],
        opts: TransferOptions,
    ) -> Result<Vec<u8>> {
        let layout = self.inner.layout;
        let frame = protocol::encode_frame(layout, command, endpoint, payload)?;

        let _sequence = self.inner.sequence.lock();
        let mut guard = self.inner.io.lock();
        let io = guard
            .as_mut()
            .ok_or_else(|| Error::Transfer(format!("{}: handle closed", self.inner.name)))?;

        trace!(
            transport = %self.inner.name,
            command = format_args!("0x{command:02X}"),
            report_hex = format_args!("{:02X?}", &frame[..(2 + endpoint.len() + payload.len()).min(24)]),
            "HID TX"
        );
        io.write(&frame)?;

        if !opts.read_reply {
            return Ok(Vec::new());
        }

        let mut buf = vec![0u8; layout.read_len];
        let reply = match opts.response_match {
            Some(tag) => read_matching(io.as_mut(), &mut buf, tag, opts.timeout)?,
            None => {
                let timeout_ms = opts.timeout.map_or(-1, |t| t.as_millis() as i32);
                let n = io.read_timeout(&mut buf, timeout_ms)?;
                if n == 0 {
                    return Err(Error::Timeout(format!(
                        "{}: no reply within {timeout_ms} ms",
                        self.inner.name
                    )));
                }
                buf[..n].to_vec()
            }
        };

        trace!(
            transport = %self.inner.name,
            reply_hex = format_args!("{:02X?}", &reply[..reply.len().min(16)]),
            "HID RX"
        );
        Ok(reply)
    }

    /// Read one unsolicited input report (listener interfaces).
    pub fn read_input(&self, timeout: Duration) -> Result<Option<Vec<u8>>> {
        let mut guard = self.inner.io.lock();
        let io = guard
            .as_mut()
            .ok_or_else(|| Error::Transfer(format!("{}: handle closed", self.inner.name)))?;
        let mut buf = vec![0u8; self.inner.layout.read_len];
        let n = io.read_timeout(&mut buf, timeout.as_millis() as i32)?;
        Ok((n > 0).then(|| buf[..n].to_vec()))
    }

    /// Write a pre-built report verbatim (analog interface writes).
    pub fn write_raw(&self, data: &[u8]) -> Result<()> {
        let _sequence = self.inner.sequence.lock();
        let mut guard = self.inner.io.lock();
        let io = guard
            .as_mut()
            .ok_or_else(|| Error::Transfer(format!("{}: handle closed", self.inner.name)))?;
        trace!(transport = %self.inner.name, report_hex = format_args!("{:02X?}", data), "HID raw TX");
        io.write(data)?;
        Ok(())
    }
}

/// Read until the reply carries `tag`, or the deadline passes.
///
/// The loop continues while the deadline has not elapsed and the tag does
/// not match; stale replies from earlier requests are discarded.
fn read_matching(
    io: &mut dyn HidIo,
    buf: &mut [u8],
    tag: [u8; 2],
    timeout: Option<Duration>,
) -> Result<Vec<u8>> {
    let deadline = Instant::now() + RESPONSE_DEADLINE;
    let step = timeout.unwrap_or(READ_TIMEOUT);

    loop {
        let now = Instant::now();
        if now >= deadline {
            return Err(Error::protocol(
                "response match",
                format!("tag {tag:02X?} not seen within {RESPONSE_DEADLINE:?}"),
            ));
        }
        let wait = step.min(deadline - now).as_millis().max(1) as i32;
        let n = io.read_timeout(buf, wait)?;
        if n > 0 && protocol::reply_matches(&buf[..n], tag) {
            return Ok(buf[..n].to_vec());
        }
        if n > 0 {
            trace!(
                expected = format_args!("{tag:02X?}"),
                reply_hex = format_args!("{:02X?}", &buf[..n.min(8)]),
                "Discarding unmatched reply"
            );
        }
    }
}


#[cfg(test)]
mod tests {
    use super::mock::{IoEvent, MockHid};
    use super::*;
    use crate::protocol::cmd;

    #[test]
    fn transfer_writes_framed_request_and_returns_reply() {
        let (transport, handle) = mock::transport();
        handle.push_reply(vec![0x00, 0x02, 0x00, 0x01, 0x02, 0x03, 0x00]);

        let reply = transport
            .transfer(0x08, cmd::FIRMWARE, &[], TransferOptions::default())
            .unwrap();
        assert_eq!(&reply[3..6], &[0x01, 0x02, 0x03]);

        let writes = handle.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(&writes[0][..4], &[0x00, 0x08, 0x02, 0x13]);
        assert_eq!(writes[0].len(), 65);
    }

    #[test]
    fn no_reply_skips_the_read() {
        let (transport, handle) = mock::transport();
        let reply = transport
            .transfer(0x08, cmd::WRITE_NEXT, &[1, 2], TransferOptions::no_reply())
            .unwrap();
        assert!(reply.is_empty());
        assert_eq!(handle.events().len(), 1);
    }

    #[test]
    fn write_failure_surfaces_as_transfer_error() {
        let (transport, handle) = mock::transport();
        handle.fail_writes(true);
        let err = transport
            .transfer(0x08, cmd::HEARTBEAT, &[], TransferOptions::default())
            .unwrap_err();
        assert!(matches!(err, Error::Transfer(_)));
    }

    #[test]
    fn bounded_read_times_out_when_nothing_arrives() {
        let (hid, _handle) = MockHid::input_only();
        let transport = Transport::new(Box::new(hid), ReportLayout::STANDARD, "quiet");
        let err = transport
            .transfer(0x08, cmd::HEARTBEAT, &[], TransferOptions::bounded())
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }

    #[test]
    fn response_match_discards_stale_replies() {
        let (transport, handle) = mock::transport();
        handle.push_reply(vec![0x08, 0x00, 0x00, 0x02, 0x00, 0x10, 0x00, 0xAA]);
        handle.push_reply(vec![0x08, 0x00, 0x00, 0x02, 0x00, 0x25, 0x00, 0xBB]);

        let reply = transport
            .transfer(0x08, cmd::READ, &[], TransferOptions::matching([0x25, 0x00]))
            .unwrap();
        assert_eq!(reply[7], 0xBB);
    }

    #[test]
    fn response_match_gives_up_after_deadline() {
        let (hid, handle) = MockHid::input_only();
        let transport = Transport::new(Box::new(hid), ReportLayout::STANDARD, "slow");
        handle.push_reply(vec![0x08, 0x00, 0x00, 0x02, 0x00, 0x10, 0x00]);

        let started = Instant::now();
        let err = transport
            .transfer(0x08, cmd::READ, &[], TransferOptions::matching([0x25, 0x00]))
            .unwrap_err();
        assert!(matches!(err, Error::Protocol { .. }));
        assert!(started.elapsed() >= RESPONSE_DEADLINE);
    }

    #[test]
    fn closed_transport_refuses_transfers() {
        let (transport, _handle) = mock::transport();
        transport.close();
        assert!(!transport.is_open());
        assert!(transport
            .transfer(0x08, cmd::HEARTBEAT, &[], TransferOptions::default())
            .is_err());
    }

    #[test]
    fn read_input_returns_queued_report_then_none() {
        let (hid, handle) = MockHid::input_only();
        let transport = Transport::new(Box::new(hid), ReportLayout::STANDARD, "listener");
        handle.push_reply(vec![0x01, 0x02, 0x00, 0x04]);

        let report = transport.read_input(READ_TIMEOUT).unwrap().unwrap();
        assert_eq!(&report[..4], &[0x01, 0x02, 0x00, 0x04]);
        assert!(transport.read_input(READ_TIMEOUT).unwrap().is_none());
    }

    #[test]
    fn concurrent_transfers_never_interleave() {
        use std::thread;

        let (transport, handle) = mock::transport();
        let mut threads = Vec::new();
        for t in 0..4u8 {
            let transport = transport.clone();
            threads.push(thread::spawn(move || {
                for _ in 0..25 {
                    transport
                        .transfer(0x08 + t, cmd::HEARTBEAT, &[], TransferOptions::default())
                        .unwrap();
                }
            }));
        }
        for t in threads {
            t.join().expect("thread panicked");
        }

        let events = handle.events();
        assert_eq!(events.len(), 200);
        for pair in events.chunks(2) {
            assert!(matches!(pair[0], IoEvent::Write(_)));
            assert!(matches!(pair[1], IoEvent::Read(_)));
        }
    }

    #[test]
    fn exclusive_sequence_keeps_other_threads_out() {
        use std::thread;

        let (transport, handle) = mock::transport();
        let (started_tx, started_rx) = crossbeam::channel::bounded::<()>(1);
        let owner = {
            let transport = transport.clone();
            thread::spawn(move || {
                transport.exclusive(|| {
                    started_tx.send(()).unwrap();
                    for _ in 0..3 {
                        transport
                            .transfer(0x09, cmd::HEARTBEAT, &[], TransferOptions::default())
                            .unwrap();
                        thread::sleep(Duration::from_millis(20));
                    }
                    // Reentrant: a nested sequence on the same thread proceeds.
                    transport.exclusive(|| {
                        transport
                            .transfer(0x09, cmd::HEARTBEAT, &[], TransferOptions::default())
                            .unwrap();
                    });
                });
            })
        };
        started_rx.recv().unwrap();
        transport
            .transfer(0x0a, cmd::HEARTBEAT, &[], TransferOptions::default())
            .unwrap();
        owner.join().expect("thread panicked");

        let commands: Vec<u8> = handle.writes().iter().map(|w| w[1]).collect();
        assert_eq!(commands, vec![0x09, 0x09, 0x09, 0x09, 0x0a]);
    }
}
