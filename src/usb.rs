//! USB device transport (C5).
//!
//! Bulk-writes the TX command buffer and polls the device's receive
//! queue until the expected number of RX bytes has arrived or an
//! overall deadline elapses. Grounded on the teacher's
//! `Programmer::write` (`software/src/programmer.rs`), which already
//! does "write a chunk, then read back its expected reply" over
//! `rusb`'s bulk endpoints — generalized here to decouple the write
//! size from the read size (MPSSE flushes write far more than they
//! read back per flush) and to add the poll-with-deadline loop spec.md
//! §4.5 calls for.

use std::time::{Duration, Instant};

use crate::error::CoreError;

/// Overall deadline for a single flush's RX wait (spec.md §4.5: "an
/// overall deadline (~500ms) bounds the wait").
pub const READ_DEADLINE: Duration = Duration::from_millis(500);

/// Busy-spin iterations tried before yielding with a short sleep, to
/// keep latency low on small transactions.
const BUSY_SPIN_ITERS: u32 = 1000;
const YIELD_SLEEP: Duration = Duration::from_micros(10);

/// The device-facing half of C5: write a buffer, read some bytes back.
/// Abstracted behind a trait so the scan orchestrator and its tests can
/// run against an in-memory fake instead of real hardware.
pub trait UsbTransport {
    /// Write `data` to the device's bulk OUT endpoint in one contiguous
    /// write. A short write is an error — the transport does not retry
    /// partial writes.
    fn bulk_write(&mut self, data: &[u8]) -> Result<(), CoreError>;

    /// Read up to `max` bytes currently queued from the device's bulk IN
    /// endpoint without blocking past `timeout`. Returns the bytes
    /// actually read (may be zero).
    fn bulk_read(&mut self, max: usize, timeout: Duration) -> Result<Vec<u8>, CoreError>;
}

/// Poll `transport` until `need` bytes have been read or
/// [`READ_DEADLINE`] elapses.
pub fn read_exact(transport: &mut dyn UsbTransport, need: usize) -> Result<Vec<u8>, CoreError> {
    let mut out = Vec::with_capacity(need);
    if need == 0 {
        return Ok(out);
    }

    let start = Instant::now();
    let mut spins = 0u32;

    while out.len() < need {
        if start.elapsed() > READ_DEADLINE {
            return Err(CoreError::DeviceReadTimeout {
                expected: need,
                got: out.len(),
            });
        }

        let chunk = transport.bulk_read(need - out.len(), Duration::from_millis(50))?;
        if chunk.is_empty() {
            spins += 1;
            if spins > BUSY_SPIN_ITERS {
                std::thread::sleep(YIELD_SLEEP);
            }
            continue;
        }
        spins = 0;
        out.extend_from_slice(&chunk);
    }

    Ok(out)
}

/// A real FTDI MPSSE device reached over `rusb`.
pub struct RusbDevice<'a> {
    pub(crate) handle: rusb::DeviceHandle<rusb::Context>,
    pub(crate) tx_ep: u8,
    pub(crate) rx_ep: u8,
    pub(crate) write_timeout: Duration,
    _marker: std::marker::PhantomData<&'a ()>,
}

impl<'a> RusbDevice<'a> {
    pub fn new(handle: rusb::DeviceHandle<rusb::Context>, tx_ep: u8, rx_ep: u8) -> Self {
        Self {
            handle,
            tx_ep,
            rx_ep,
            write_timeout: Duration::from_secs(5),
            _marker: std::marker::PhantomData,
        }
    }

    pub fn handle(&self) -> &rusb::DeviceHandle<rusb::Context> {
        &self.handle
    }
}

impl<'a> UsbTransport for RusbDevice<'a> {
    fn bulk_write(&mut self, data: &[u8]) -> Result<(), CoreError> {
        let written = self
            .handle
            .write_bulk(self.tx_ep, data, self.write_timeout)?;
        if written != data.len() {
            return Err(CoreError::DeviceWriteFailed(format!(
                "short write: wrote {} of {} bytes",
                written,
                data.len()
            )));
        }
        Ok(())
    }

    fn bulk_read(&mut self, max: usize, timeout: Duration) -> Result<Vec<u8>, CoreError> {
        let mut buf = vec![0u8; max.max(64)];
        match self.handle.read_bulk(self.rx_ep, &mut buf, timeout) {
            Ok(n) => {
                buf.truncate(n);
                Ok(buf)
            }
            Err(rusb::Error::Timeout) => Ok(Vec::new()),
            Err(e) => Err(CoreError::from(e)),
        }
    }
}
