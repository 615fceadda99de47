//! TX/RX command buffer with ordered RX observers (C4).
//!
//! Accumulates encoded MPSSE command bytes, tracks how many RX bytes
//! the device owes us for them, and remembers — in FIFO order — how to
//! scatter those future bytes into the caller's TDO buffer once they
//! arrive. Observers are a closed sum type rather than the source's
//! intrusive linked list of function-pointer callbacks (see
//! DESIGN.md); this statically rules out anything but the four scatter
//! shapes MPSSE readback actually produces, and keeps per-scan storage
//! a single `Vec` that's cleared (not reallocated) at each flush.

use crate::bitbuf::{scatter_bit_left_justified, scatter_bit_right_justified, scatter_bytes};
use crate::error::CoreError;
use crate::usb::{read_exact, UsbTransport};

/// One chunk (64KiB) is the unit flush granularity is sized around.
pub const CHUNK: usize = 65536;
/// TX capacity: 3x a chunk, since every TDI payload byte is preceded by
/// a 3-byte opcode header in the worst case (bit-granularity commands).
pub const TX_CAP: usize = 3 * CHUNK;
/// RX capacity: one chunk's worth of reply bytes.
pub const RX_CAP: usize = CHUNK;
/// Flush once a cursor crosses this fraction of its capacity.
const HIGH_WATER: f64 = 0.94;

/// Where and how to deposit a future slice of device RX bytes.
#[derive(Debug, Clone, Copy)]
pub enum Observer {
    /// `0x3B` bit-readback: 1 source byte, `bits` captured bits
    /// right-justified in its high bits, landing at destination bit
    /// offset `dst_bit`.
    BitRightJustified { dst_bit: usize, bits: usize },
    /// `0x6B` TMS-gated exit-bit readback: 1 source byte, 1 captured
    /// bit left-justified in bit 7, landing at destination bit offset
    /// `dst_bit`.
    BitLeftJustified { dst_bit: usize },
    /// `0x39` byte-readback: `n` source bytes, direct image, landing at
    /// destination byte offset `dst_byte`.
    ByteBulk { dst_byte: usize, n: usize },
}

impl Observer {
    fn source_len(&self) -> usize {
        match self {
            Observer::BitRightJustified { .. } => 1,
            Observer::BitLeftJustified { .. } => 1,
            Observer::ByteBulk { n, .. } => *n,
        }
    }

    fn deposit(&self, dst: &mut [u8], src: &[u8]) {
        match *self {
            Observer::BitRightJustified { dst_bit, bits } => {
                scatter_bit_right_justified(dst, dst_bit, src[0], bits)
            }
            Observer::BitLeftJustified { dst_bit } => {
                scatter_bit_left_justified(dst, dst_bit, src[0], 1)
            }
            Observer::ByteBulk { dst_byte, n } => scatter_bytes(dst, dst_byte, src, n),
        }
    }
}

/// Append-only command buffer paired with its RX-expectation cursor and
/// ordered observer list. One instance lives per session and is reused
/// across XVC commands; its observer storage is scoped to a single
/// scan and reset at the end of every flush.
pub struct TxRxBuffer {
    tx: Vec<u8>,
    rx_len: usize,
    observers: Vec<Observer>,
}

impl TxRxBuffer {
    pub fn new() -> Self {
        Self {
            tx: Vec::with_capacity(TX_CAP),
            rx_len: 0,
            observers: Vec::with_capacity(256),
        }
    }

    pub fn tx_len(&self) -> usize {
        self.tx.len()
    }

    pub fn rx_len(&self) -> usize {
        self.rx_len
    }

    /// Flush now if appending `tx_need`/`rx_need` more would cross
    /// capacity or the high-water mark.
    pub fn reserve(
        &mut self,
        tx_need: usize,
        rx_need: usize,
        transport: &mut dyn UsbTransport,
        dst: &mut [u8],
    ) -> Result<(), CoreError> {
        let tx_would_be = self.tx.len() + tx_need;
        let rx_would_be = self.rx_len + rx_need;
        let tx_hw = (TX_CAP as f64 * HIGH_WATER) as usize;
        let rx_hw = (RX_CAP as f64 * HIGH_WATER) as usize;

        if tx_would_be > TX_CAP || rx_would_be > RX_CAP || tx_would_be >= tx_hw || rx_would_be >= rx_hw
        {
            self.flush(transport, dst)?;
        }
        Ok(())
    }

    /// Append TX bytes produced by an MPSSE encoder call, note how many
    /// RX bytes the device owes for them, and enqueue the observer (if
    /// any) that will scatter those bytes once they arrive.
    pub fn append(&mut self, tx_bytes: &[u8], rx_need: usize, observer: Option<Observer>) {
        self.tx.extend_from_slice(tx_bytes);
        self.rx_len += rx_need;
        if let Some(obs) = observer {
            debug_assert_eq!(obs.source_len(), rx_need);
            self.observers.push(obs);
        } else {
            debug_assert_eq!(rx_need, 0);
        }
    }

    /// Write all TX bytes to the device, read exactly `rx_len` bytes
    /// back, scatter them through the observers in order, then reset
    /// both cursors.
    pub fn flush(&mut self, transport: &mut dyn UsbTransport, dst: &mut [u8]) -> Result<(), CoreError> {
        if self.tx.is_empty() && self.rx_len == 0 {
            return Ok(());
        }

        if !self.tx.is_empty() {
            transport.bulk_write(&self.tx)?;
        }

        let staging = read_exact(transport, self.rx_len)?;

        let mut consumed = 0usize;
        for obs in self.observers.drain(..) {
            let len = obs.source_len();
            obs.deposit(dst, &staging[consumed..consumed + len]);
            consumed += len;
        }
        if consumed != staging.len() {
            return Err(CoreError::BufferOverflow {
                tx_len: self.tx.len(),
                rx_len: self.rx_len,
            });
        }

        self.tx.clear();
        self.rx_len = 0;
        Ok(())
    }
}

impl Default for TxRxBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usb::fake::FakeTransport;

    #[test]
    fn observer_coverage_matches_rx_bytes() {
        let mut buf = TxRxBuffer::new();
        let mut transport = FakeTransport::default();
        transport.push_reply(&[0xAB, 0xCD, 0xEF]);

        buf.append(&[0x3B, 0x01, 0x55], 1, Some(Observer::BitRightJustified { dst_bit: 0, bits: 2 }));
        buf.append(&[0x39, 0x01, 0x00, 0x11, 0x22], 2, Some(Observer::ByteBulk { dst_byte: 1, n: 2 }));

        let mut dst = [0u8; 4];
        buf.flush(&mut transport, &mut dst).unwrap();

        assert_eq!(dst[1], 0xCD);
        assert_eq!(dst[2], 0xEF);
        assert_eq!(buf.rx_len(), 0);
        assert_eq!(buf.tx_len(), 0);
    }

    #[test]
    fn reserve_flushes_when_near_capacity() {
        let mut buf = TxRxBuffer::new();
        let mut transport = FakeTransport::default();
        let mut dst = vec![0u8; RX_CAP];

        // Push rx_len right up near the high-water mark.
        let near_cap = RX_CAP - 10;
        buf.reserve(0, near_cap, &mut transport, &mut dst).unwrap();
        buf.append(
            &[0x39, 0x00, 0x00],
            near_cap,
            Some(Observer::ByteBulk { dst_byte: 0, n: near_cap }),
        );
        assert_eq!(buf.rx_len(), near_cap);

        // Any further reservation should trigger a flush first.
        transport.push_reply(&vec![0u8; near_cap]);
        buf.reserve(3, 1, &mut transport, &mut dst).unwrap();
        assert_eq!(buf.rx_len(), 0);
    }

    #[test]
    fn tms_only_command_needs_no_observer() {
        let mut buf = TxRxBuffer::new();
        buf.append(&[0x4B, 0x02, 0x05], 0, None);
        assert_eq!(buf.rx_len(), 0);
        assert!(buf.observers.is_empty());
    }
}
