//! The scan orchestrator (C6) — the central algorithm.
//!
//! Walks one ⟨TMS, TDI⟩ bit vector, tracks the TAP state (C2) bit by
//! bit, segments the vector into maximal shift-runs and TMS-only runs,
//! and drives the MPSSE encoder (C3) into the TX/RX buffer (C4), which
//! flushes through the USB transport (C5) whenever it nears capacity.

use crate::bitbuf::get_bit;
use crate::error::CoreError;
use crate::mpsse::{encode_tdi_bits, encode_tdi_bytes, encode_tms_exit_bit, encode_tms_no_read};
use crate::tap::{next_state, TapState};
use crate::txbuf::{Observer, TxRxBuffer, CHUNK};
use crate::usb::UsbTransport;

/// Per-session scan engine state that must survive across XVC
/// commands: the latched last-driven TDI value (seeds the TDI-hold
/// field of subsequent TMS-only commands) and the device's largest
/// single byte-shift chunk.
pub struct ScanEngine {
    last_tdi: bool,
    chunk_buffer_bytes: usize,
}

impl ScanEngine {
    pub fn new() -> Self {
        Self {
            last_tdi: false,
            chunk_buffer_bytes: CHUNK,
        }
    }

    pub fn with_chunk_buffer_bytes(chunk_buffer_bytes: usize) -> Self {
        Self {
            last_tdi: false,
            chunk_buffer_bytes,
        }
    }

    /// Run one XVC `shift:` vector through the TAP, emitting MPSSE
    /// commands and filling `tdo[0..bit_count)`. Returns the TAP state
    /// reached after the last bit.
    pub fn scan(
        &mut self,
        tms: &[u8],
        tdi: &[u8],
        tdo: &mut [u8],
        bit_count: usize,
        mut state: TapState,
        buf: &mut TxRxBuffer,
        transport: &mut dyn UsbTransport,
    ) -> Result<TapState, CoreError> {
        let mut first_pending = 0usize;

        for i in 0..bit_count {
            let tms_i = get_bit(tms, i) == 1;
            let next = next_state(state, tms_i);
            let is_shift = state.is_shifting();
            let next_shift = next.is_shifting();

            let is_last_bit = i == bit_count - 1;
            let entering_shift = !is_shift && next_shift;
            let leaving_shift = is_shift && !next_shift;
            let is_event = is_last_bit || entering_shift || leaving_shift;

            if is_event {
                let next_pending = i + 1;
                if is_shift {
                    self.emit_tdi_shift_run(
                        tdi,
                        tdo,
                        first_pending,
                        next_pending,
                        tms_i,
                        buf,
                        transport,
                    )?;
                } else {
                    self.emit_tms_only_run(tms, first_pending, next_pending, buf, transport, tdo)?;
                }
                first_pending = next_pending;
            }

            state = next;
        }

        buf.flush(transport, tdo)?;
        Ok(state)
    }

    /// Emit a maximal TMS-only run `[a, b)`, chunked into groups of at
    /// most 6 TMS transitions per `0x4B` command (the 7th bit position
    /// of the command's data byte is reserved for the TDI-hold value).
    fn emit_tms_only_run(
        &mut self,
        tms: &[u8],
        a: usize,
        b: usize,
        buf: &mut TxRxBuffer,
        transport: &mut dyn UsbTransport,
        dst: &mut [u8],
    ) -> Result<(), CoreError> {
        let mut j = a;
        while j < b {
            let k = (b - j).min(6);
            let bits: Vec<bool> = (0..k).map(|t| get_bit(tms, j + t) == 1).collect();

            let mut tx = Vec::with_capacity(3);
            encode_tms_no_read(&mut tx, &bits, self.last_tdi);

            buf.reserve(tx.len(), 0, transport, dst)?;
            buf.append(&tx, 0, None);

            j += k;
        }
        Ok(())
    }

    /// Emit a maximal shift-run `[a, b)` where `b-1` is the exit bit,
    /// decomposed into leading unaligned bits, whole middle bytes, a
    /// trailing unaligned remainder, and the TMS-gated exit bit.
    fn emit_tdi_shift_run(
        &mut self,
        tdi: &[u8],
        tdo: &mut [u8],
        a: usize,
        b: usize,
        last_tms_high: bool,
        buf: &mut TxRxBuffer,
        transport: &mut dyn UsbTransport,
    ) -> Result<(), CoreError> {
        let exit_bit = b - 1;

        let a_prime = next_byte_boundary(a).min(exit_bit);
        let m = exit_bit - (exit_bit % 8);

        // Leading unaligned bits [a, a_prime).
        if a_prime > a {
            self.emit_bit_shift(tdi, tdo, a, a_prime, buf, transport)?;
        }

        // Middle whole bytes [a_prime, m), split at the device's chunk size.
        if m > a_prime {
            let mut byte_start = a_prime / 8;
            let byte_end = m / 8;
            while byte_start < byte_end {
                let n = (byte_end - byte_start).min(self.chunk_buffer_bytes).min(65536);
                let data = &tdi[byte_start..byte_start + n];

                let mut tx = Vec::with_capacity(3 + n);
                let rx_need = encode_tdi_bytes(&mut tx, data);

                buf.reserve(tx.len(), rx_need, transport, tdo)?;
                buf.append(&tx, rx_need, Some(Observer::ByteBulk { dst_byte: byte_start, n }));

                byte_start += n;
            }
        }

        // Trailing unaligned bits [m, exit_bit). Only meaningful when the
        // leading segment didn't already reach all the way to the exit
        // bit (a_prime <= m) — a short run entirely inside one byte is
        // captured wholly by the leading segment instead.
        if a_prime <= m && exit_bit > m {
            self.emit_bit_shift(tdi, tdo, m, exit_bit, buf, transport)?;
        }

        // Exit bit: TMS-gated, carries the final TDI bit and moves TAP
        // out of the shift state.
        let tdi_bit = get_bit(tdi, exit_bit) == 1;
        let mut tx = Vec::with_capacity(3);
        let rx_need = encode_tms_exit_bit(&mut tx, tdi_bit, last_tms_high);
        buf.reserve(tx.len(), rx_need, transport, tdo)?;
        buf.append(&tx, rx_need, Some(Observer::BitLeftJustified { dst_bit: exit_bit }));

        self.last_tdi = tdi_bit;

        Ok(())
    }

    /// Emit one `0x3B` bit-granularity shift covering `[a, b)` (up to 7
    /// bits), right-justified on readback.
    fn emit_bit_shift(
        &mut self,
        tdi: &[u8],
        tdo: &mut [u8],
        a: usize,
        b: usize,
        buf: &mut TxRxBuffer,
        transport: &mut dyn UsbTransport,
    ) -> Result<(), CoreError> {
        let n = b - a;
        debug_assert!(n >= 1 && n <= 7);

        let mut data_byte = 0u8;
        for t in 0..n {
            if get_bit(tdi, a + t) == 1 {
                data_byte |= 1 << t;
            }
        }

        let mut tx = Vec::with_capacity(3);
        let rx_need = encode_tdi_bits(&mut tx, data_byte, n);

        buf.reserve(tx.len(), rx_need, transport, tdo)?;
        buf.append(&tx, rx_need, Some(Observer::BitRightJustified { dst_bit: a, bits: n }));

        Ok(())
    }
}

impl Default for ScanEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn next_byte_boundary(i: usize) -> usize {
    (i + 7) / 8 * 8
}
