//! FTDI device discovery and MPSSE open/init sequence (C8).
//!
//! Grounded on the teacher's `Programmer::find`/`from_handle`
//! (`software/src/programmer.rs`) for the rusb device-enumeration and
//! `.context(...)` idiom, and on `original_source/src/mpsse_adapter.c`'s
//! `mpsse_adapter_open` for the concrete open/reset/purge/MPSSE-enable
//! ordering and GPIO init values.

use std::time::Duration;

use failure::ResultExt;
use rusb::UsbContext;

use crate::error::CoreError;
use crate::mpsse::{
    encode_disable_div5, encode_loopback_end, encode_set_divisor, encode_set_gpio_low,
};
use crate::usb::{RusbDevice, UsbTransport};

/// Default FTDI vendor/product ID, matching an FT2232H-class adapter
/// (the Digilent HS2 this crate's wire protocol was modeled on uses
/// the same pair; see SPEC_FULL.md §3).
pub const DEFAULT_VENDOR_ID: u16 = 0x0403;
pub const DEFAULT_PRODUCT_ID: u16 = 0x6010;

/// JTAG GPIO low-byte init value/direction: TMS held high, TCK/TDI/TMS
/// driven as outputs, TDO as input.
const JTAG_GPIO_LOW_INIT: u8 = 0x08;
const JTAG_GPIO_LOW_DIR: u8 = 0x0B;

/// Time to let the chip settle after switching into MPSSE bit mode.
const MPSSE_SETTLE: Duration = Duration::from_millis(50);

/// FTDI bitmode values understood by `SET_BIT_MODE` (bRequest 0x0B).
const BITMODE_RESET: u8 = 0x00;
const BITMODE_MPSSE: u8 = 0x02;

/// bRequests understood by FTDI's vendor control interface.
const SIO_RESET: u8 = 0x00;
const SIO_SET_BIT_MODE: u8 = 0x0B;
const SIO_SET_LATENCY_TIMER: u8 = 0x09;

const REQUEST_TYPE_VENDOR_OUT: u8 = 0x40;

/// Find and open an FTDI MPSSE device, matching vendor/product and
/// (optionally) serial number.
pub fn open_device(
    vendor_id: u16,
    product_id: u16,
    serial: Option<&str>,
) -> crate::error::Result<RusbDevice<'static>> {
    let context = rusb::Context::new().context("error creating libusb context")?;
    let devices = context.devices().context("error listing USB devices")?;

    let mut candidate: Option<rusb::Device<rusb::Context>> = None;
    for device in devices.iter() {
        let descriptor = match device.device_descriptor() {
            Ok(d) => d,
            Err(_) => continue,
        };
        if descriptor.vendor_id() != vendor_id || descriptor.product_id() != product_id {
            continue;
        }
        if let Some(want_serial) = serial {
            let handle = match device.open() {
                Ok(h) => h,
                Err(_) => continue,
            };
            let timeout = Duration::from_millis(200);
            let language = match handle.read_languages(timeout) {
                Ok(langs) if !langs.is_empty() => langs[0],
                _ => continue,
            };
            let got = handle
                .read_serial_number_string(language, &descriptor, timeout)
                .unwrap_or_default();
            if got != want_serial {
                continue;
            }
        }
        if candidate.is_some() {
            Err(CoreError::MultipleDevicesFound)?
        }
        candidate = Some(device);
    }

    let device = candidate.ok_or(CoreError::NoDeviceFound)?;
    let mut handle = device.open().context("error opening FTDI device")?;

    let config = device
        .active_config_descriptor()
        .context("error reading config descriptor")?;
    let interface = config
        .interfaces()
        .next()
        .ok_or_else(|| CoreError::ConfigError("device exposes no USB interface".into()))?;
    let interface_number = interface.number();
    if handle.kernel_driver_active(interface_number).unwrap_or(false) {
        handle
            .detach_kernel_driver(interface_number)
            .context("error detaching kernel driver")?;
    }
    handle
        .claim_interface(interface_number)
        .context("error claiming USB interface")?;

    let (tx_ep, rx_ep) = bulk_endpoints(&interface).ok_or_else(|| {
        CoreError::ConfigError("device exposes no bulk IN/OUT endpoint pair".into())
    })?;

    ftdi_reset(&mut handle, interface_number).context("error resetting FTDI device")?;
    ftdi_set_bit_mode(&mut handle, interface_number, 0x00, BITMODE_RESET)
        .context("error resetting bit mode")?;
    ftdi_set_bit_mode(&mut handle, interface_number, 0x00, BITMODE_MPSSE)
        .context("error enabling MPSSE bit mode")?;
    ftdi_set_latency_timer(&mut handle, interface_number, 16)
        .context("error setting latency timer")?;

    std::thread::sleep(MPSSE_SETTLE);
    drain_residual(&mut handle, tx_ep, rx_ep);

    let mut device = RusbDevice::new(handle, tx_ep, rx_ep);
    program_initial_state(&mut device, 30_000_000)?;
    Ok(device)
}

fn bulk_endpoints(interface: &rusb::Interface) -> Option<(u8, u8)> {
    let descriptor = interface.descriptors().next()?;
    let mut tx_ep = None;
    let mut rx_ep = None;
    for endpoint in descriptor.endpoint_descriptors() {
        if endpoint.transfer_type() != rusb::TransferType::Bulk {
            continue;
        }
        match endpoint.direction() {
            rusb::Direction::Out => tx_ep = Some(endpoint.address()),
            rusb::Direction::In => rx_ep = Some(endpoint.address()),
        }
    }
    Some((tx_ep?, rx_ep?))
}

fn ftdi_reset(
    handle: &mut rusb::DeviceHandle<rusb::Context>,
    interface: u8,
) -> Result<(), rusb::Error> {
    handle
        .write_control(
            REQUEST_TYPE_VENDOR_OUT,
            SIO_RESET,
            0,
            interface as u16,
            &[],
            Duration::from_secs(5),
        )
        .map(|_| ())
}

fn ftdi_set_bit_mode(
    handle: &mut rusb::DeviceHandle<rusb::Context>,
    interface: u8,
    mask: u8,
    mode: u8,
) -> Result<(), rusb::Error> {
    let value = (mode as u16) << 8 | mask as u16;
    handle
        .write_control(
            REQUEST_TYPE_VENDOR_OUT,
            SIO_SET_BIT_MODE,
            value,
            interface as u16,
            &[],
            Duration::from_secs(5),
        )
        .map(|_| ())
}

fn ftdi_set_latency_timer(
    handle: &mut rusb::DeviceHandle<rusb::Context>,
    interface: u8,
    latency_ms: u8,
) -> Result<(), rusb::Error> {
    handle
        .write_control(
            REQUEST_TYPE_VENDOR_OUT,
            SIO_SET_LATENCY_TIMER,
            latency_ms as u16,
            interface as u16,
            &[],
            Duration::from_secs(5),
        )
        .map(|_| ())
}

/// Drain any bytes left over in the device's RX queue from a previous
/// session, so the new session's first `flush()` doesn't get handed
/// stale reply bytes. Mirrors `FT_Purge` + the original's drain loop in
/// `mpsse_adapter_open`.
fn drain_residual(handle: &mut rusb::DeviceHandle<rusb::Context>, _tx_ep: u8, rx_ep: u8) {
    let mut scratch = [0u8; 4096];
    loop {
        match handle.read_bulk(rx_ep, &mut scratch, Duration::from_millis(20)) {
            Ok(0) => break,
            Ok(_) => continue,
            Err(_) => break,
        }
    }
}

/// Initial MPSSE program: disable loopback, program the TCK divisor
/// for `frequency_hz`, disable the ÷5 prescaler, and set the JTAG GPIO
/// directions. Issued once right after MPSSE mode is entered.
pub fn program_initial_state(
    device: &mut RusbDevice<'static>,
    frequency_hz: u32,
) -> crate::error::Result<()> {
    let mut tx = Vec::with_capacity(16);
    encode_loopback_end(&mut tx);
    encode_disable_div5(&mut tx);
    encode_set_divisor(&mut tx, crate::mpsse::divisor_for_frequency(60_000_000, frequency_hz));
    encode_set_gpio_low(&mut tx, JTAG_GPIO_LOW_INIT, JTAG_GPIO_LOW_DIR);
    device.bulk_write(&tx).map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gpio_init_values_match_device_manager_reference() {
        // original_source/include/mpsse_adapter.h: JTAG_GPIO_LOW_INIT =
        // 0x08 (TMS high), JTAG_GPIO_LOW_DIR = 0x0B (TCK/TDI/TMS out,
        // TDO in).
        assert_eq!(JTAG_GPIO_LOW_INIT, 0x08);
        assert_eq!(JTAG_GPIO_LOW_DIR, 0x0B);
    }
}
