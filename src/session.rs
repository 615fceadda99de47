//! Session supervisor (C10) **(expansion)**.
//!
//! A single-threaded TCP accept loop grounded on the teacher's direct,
//! unwrapped control flow in `main.rs`: bind once, then in a loop
//! accept a connection, gate it past the whitelist, re-initialise the
//! FTDI device (C8), and run one XVC session (C7) to completion,
//! logging its summary before looping back to `accept`.

use std::net::{Ipv4Addr, SocketAddr, TcpListener};

use log::{error, info, warn};

use crate::config::Config;
use crate::error::CoreError;
use crate::ftdi_init;
use crate::whitelist::{Whitelist, WhitelistMode, WhitelistResult};
use crate::xvc::{Session, SessionEnd};

/// Build the whitelist described by a resolved [`Config`].
pub fn build_whitelist(config: &Config) -> Result<Whitelist, CoreError> {
    let mode = config.whitelist_mode;
    let mut whitelist = Whitelist::new(mode);
    if mode == WhitelistMode::Off {
        return Ok(whitelist);
    }
    for cidr in &config.whitelist_allow {
        whitelist.add(cidr, false).map_err(CoreError::ConfigError)?;
    }
    for cidr in &config.whitelist_block {
        whitelist.add(cidr, true).map_err(CoreError::ConfigError)?;
    }
    Ok(whitelist)
}

/// Run the accept loop forever: one session at a time, each against a
/// freshly re-initialised device (spec.md §7: "Between sessions the
/// FTDI device is re-opened and re-initialised to guarantee a known
/// MPSSE state.").
pub fn run(config: &Config) -> Result<(), CoreError> {
    let whitelist = build_whitelist(config)?;
    let listener = TcpListener::bind(("0.0.0.0", config.port))
        .map_err(|e| CoreError::ConfigError(format!("binding port {}: {e}", config.port)))?;
    info!("listening on port {}", config.port);

    loop {
        let (mut stream, peer) = match listener.accept() {
            Ok(pair) => pair,
            Err(e) => {
                warn!("accept failed: {e}");
                continue;
            }
        };

        if let Some(result) = check_whitelist(&whitelist, peer) {
            match result {
                WhitelistResult::Blocked => {
                    warn!("rejecting connection from {peer}: blocked by whitelist");
                    drop(stream);
                    continue;
                }
                WhitelistResult::Logged => {
                    warn!("permissive whitelist: allowing unmatched peer {peer}");
                }
                WhitelistResult::Allowed => {}
            }
        }

        info!("session starting with {peer}");
        let mut device = match ftdi_init::open_device(
            ftdi_init::DEFAULT_VENDOR_ID,
            ftdi_init::DEFAULT_PRODUCT_ID,
            config.serial.as_deref(),
        ) {
            Ok(d) => d,
            Err(e) => {
                error!("failed to open FTDI device for session with {peer}: {e}");
                continue;
            }
        };

        let mut session = Session::new(config.max_vector_size);
        let end = session.run(&mut stream, &mut device);
        let summary = session.summary();

        match end {
            SessionEnd::ClientDisconnect => info!(
                "session with {peer} closed: {} commands, {} rx bytes, {} tx bytes",
                summary.commands, summary.rx_bytes, summary.tx_bytes
            ),
            SessionEnd::Error(e) => error!(
                "session with {peer} aborted ({e}): {} commands, {} rx bytes, {} tx bytes",
                summary.commands, summary.rx_bytes, summary.tx_bytes
            ),
        }
    }
}

/// `None` when the whitelist is off (no check performed); `Some(_)`
/// otherwise, including non-IPv4 peers, which are always allowed
/// (spec.md Non-goals: "No IPv6 whitelist").
fn check_whitelist(whitelist: &Whitelist, peer: SocketAddr) -> Option<WhitelistResult> {
    match peer {
        SocketAddr::V4(v4) => Some(whitelist.check(*v4.ip())),
        SocketAddr::V6(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whitelist_off_short_circuits_check() {
        let whitelist = Whitelist::new(WhitelistMode::Off);
        let peer: SocketAddr = "10.0.0.1:1234".parse().unwrap();
        assert_eq!(check_whitelist(&whitelist, peer), Some(WhitelistResult::Allowed));
    }

    #[test]
    fn ipv6_peers_bypass_whitelist() {
        let mut whitelist = Whitelist::new(WhitelistMode::Strict);
        whitelist.add("::/0", true).ok();
        let peer: SocketAddr = "[::1]:1234".parse().unwrap();
        assert_eq!(check_whitelist(&whitelist, peer), None);
    }

    #[test]
    fn build_whitelist_rejects_bad_cidr() {
        let mut config = base_config();
        config.whitelist_mode = WhitelistMode::Strict;
        config.whitelist_allow = vec!["not-an-ip".to_string()];
        assert!(build_whitelist(&config).is_err());
    }

    fn base_config() -> Config {
        Config {
            serial: None,
            port: 2542,
            frequency_hz: 30_000_000,
            max_vector_size: 4096,
            whitelist_allow: vec![],
            whitelist_block: vec![],
            whitelist_mode: WhitelistMode::Off,
            verbose: false,
        }
    }
}
