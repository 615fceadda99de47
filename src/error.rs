//! Crate-wide error types.
//!
//! Follows the shape of the original `ffp` crate: a `Fail`-deriving enum
//! per class of failure, plus a `Result` alias over `failure::Error` so
//! callers can freely `.context(...)` onto lower-level errors.

use failure_derive::Fail;

/// Errors raised by the scan engine, transport and framing loop.
///
/// Maps onto the taxonomy in the design doc: a scan either completes or
/// the whole session is torn down, there is no partial recovery.
#[derive(Fail, Debug)]
pub enum CoreError {
    #[fail(display = "USB error: {}", _0)]
    Usb(#[cause] rusb::Error),

    #[fail(display = "No FTDI device found")]
    NoDeviceFound,

    #[fail(display = "Multiple FTDI devices found; specify --serial")]
    MultipleDevicesFound,

    #[fail(display = "device write failed: {}", _0)]
    DeviceWriteFailed(String),

    #[fail(display = "timed out waiting for {} bytes from device (got {})", expected, got)]
    DeviceReadTimeout { expected: usize, got: usize },

    #[fail(display = "malformed XVC request: {}", _0)]
    MalformedRequest(String),

    #[fail(
        display = "internal invariant breach: TX/RX buffer overflowed (tx_len={}, rx_len={})",
        tx_len, rx_len
    )]
    BufferOverflow { tx_len: usize, rx_len: usize },

    #[fail(display = "invalid configuration: {}", _0)]
    ConfigError(String),
}

impl From<rusb::Error> for CoreError {
    fn from(error: rusb::Error) -> Self {
        CoreError::Usb(error)
    }
}

/// Crate-wide result alias, mirroring `ffp::Result`.
pub type Result<T> = std::result::Result<T, failure::Error>;
