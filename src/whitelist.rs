//! IPv4 CIDR allow/deny list for the session supervisor (C10 helper).
//!
//! **(expansion)** Grounded on `original_source/src/whitelist.c` and
//! `include/whitelist.h`: block entries win over allow entries, and a
//! client IP that matches neither list is handled per `mode` (off,
//! permissive-and-logged, or strict). IPv6 is out of scope (spec.md §1
//! Non-goals: "No IPv6 whitelist").

use std::net::Ipv4Addr;

/// Outcome of checking a client address against the whitelist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WhitelistResult {
    Allowed,
    Blocked,
    /// Allowed in permissive mode despite not matching any allow entry;
    /// the caller should log this at WARN.
    Logged,
}

/// How unmatched addresses are treated once the allow/block lists have
/// both been checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WhitelistMode {
    /// No filtering; every address is `Allowed`.
    #[default]
    Off,
    /// Unmatched addresses are allowed but reported as `Logged`.
    Permissive,
    /// Unmatched addresses are `Blocked`.
    Strict,
}

impl std::str::FromStr for WhitelistMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "off" => Ok(WhitelistMode::Off),
            "permissive" => Ok(WhitelistMode::Permissive),
            "strict" => Ok(WhitelistMode::Strict),
            other => Err(format!("unknown whitelist mode: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    network: u32,
    prefix_len: u8,
    is_block: bool,
}

impl Entry {
    fn matches(&self, ip: u32) -> bool {
        if self.prefix_len == 0 {
            return true;
        }
        let mask = 0xFFFF_FFFFu32 << (32 - self.prefix_len as u32);
        (ip & mask) == (self.network & mask)
    }
}

/// An IPv4 CIDR allow/block list.
#[derive(Debug, Clone, Default)]
pub struct Whitelist {
    mode: WhitelistMode,
    entries: Vec<Entry>,
}

impl Whitelist {
    pub fn new(mode: WhitelistMode) -> Self {
        Self { mode, entries: Vec::new() }
    }

    /// Add a CIDR entry (e.g. `"192.168.1.0/24"` or a bare address,
    /// which is treated as a `/32`).
    pub fn add(&mut self, cidr: &str, is_block: bool) -> Result<(), String> {
        let (network, prefix_len) = parse_cidr(cidr)?;
        self.entries.push(Entry { network, prefix_len, is_block });
        Ok(())
    }

    pub fn check(&self, ip: Ipv4Addr) -> WhitelistResult {
        if self.mode == WhitelistMode::Off {
            return WhitelistResult::Allowed;
        }
        let ip_bits = u32::from(ip);

        if self.entries.iter().any(|e| e.is_block && e.matches(ip_bits)) {
            return WhitelistResult::Blocked;
        }
        if self.entries.iter().any(|e| !e.is_block && e.matches(ip_bits)) {
            return WhitelistResult::Allowed;
        }
        match self.mode {
            WhitelistMode::Off => WhitelistResult::Allowed,
            WhitelistMode::Strict => WhitelistResult::Blocked,
            WhitelistMode::Permissive => WhitelistResult::Logged,
        }
    }
}

fn parse_cidr(cidr: &str) -> Result<(u32, u8), String> {
    let (addr_part, prefix_part) = match cidr.split_once('/') {
        Some((a, p)) => (a, Some(p)),
        None => (cidr, None),
    };
    let addr: Ipv4Addr = addr_part.parse().map_err(|_| format!("invalid IPv4 address: {addr_part}"))?;
    let prefix_len = match prefix_part {
        Some(p) => p.parse::<u8>().map_err(|_| format!("invalid CIDR prefix: {p}"))?,
        None => 32,
    };
    if prefix_len > 32 {
        return Err(format!("CIDR prefix out of range: {prefix_len}"));
    }
    Ok((u32::from(addr), prefix_len))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn off_mode_allows_everything() {
        let wl = Whitelist::new(WhitelistMode::Off);
        assert_eq!(wl.check(Ipv4Addr::new(10, 0, 0, 1)), WhitelistResult::Allowed);
    }

    #[test]
    fn block_wins_over_allow() {
        let mut wl = Whitelist::new(WhitelistMode::Strict);
        wl.add("10.0.0.0/8", false).unwrap();
        wl.add("10.0.0.5/32", true).unwrap();
        assert_eq!(wl.check(Ipv4Addr::new(10, 0, 0, 5)), WhitelistResult::Blocked);
        assert_eq!(wl.check(Ipv4Addr::new(10, 0, 0, 6)), WhitelistResult::Allowed);
    }

    #[test]
    fn strict_mode_blocks_unmatched() {
        let mut wl = Whitelist::new(WhitelistMode::Strict);
        wl.add("192.168.1.0/24", false).unwrap();
        assert_eq!(wl.check(Ipv4Addr::new(8, 8, 8, 8)), WhitelistResult::Blocked);
    }

    #[test]
    fn permissive_mode_logs_unmatched() {
        let mut wl = Whitelist::new(WhitelistMode::Permissive);
        wl.add("192.168.1.0/24", false).unwrap();
        assert_eq!(wl.check(Ipv4Addr::new(8, 8, 8, 8)), WhitelistResult::Logged);
        assert_eq!(wl.check(Ipv4Addr::new(192, 168, 1, 5)), WhitelistResult::Allowed);
    }

    #[test]
    fn rejects_out_of_range_prefix() {
        let mut wl = Whitelist::new(WhitelistMode::Strict);
        assert!(wl.add("10.0.0.0/33", false).is_err());
    }
}
