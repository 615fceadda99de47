//! CLI and config-file parsing (C9).
//!
//! Grounded on the teacher's flat `env::args()`-driven `main.rs`,
//! generalized to `clap::Parser` derive the way `probe-rs-tools`'s CLI
//! binaries in the example pack use it, layered over an optional TOML
//! file (`serde` + `toml`) reduced from
//! `original_source/include/config.h`'s per-instance field set to this
//! crate's single-session scope.

use std::path::PathBuf;

use clap::Parser;
use serde::Deserialize;

use crate::error::CoreError;
use crate::whitelist::WhitelistMode;

/// Hard ceiling on `max_vector_size`, taken from
/// `original_source/include/xvc_protocol.h`'s `XVC_MAX_VECTOR_SIZE_LIMIT`.
pub const MAX_VECTOR_SIZE_LIMIT: usize = 262_144;
/// Default advertised `max_vector_size` when unconfigured.
pub const DEFAULT_MAX_VECTOR_SIZE: usize = 4096;
/// Default TCK frequency: the MPSSE max for a dual-channel FT2232H.
pub const DEFAULT_FREQUENCY_HZ: u32 = 30_000_000;

#[derive(Parser, Debug)]
#[command(name = "xvc-ftdi-bridge", about = "XVC-to-FTDI-MPSSE JTAG bridge")]
pub struct Cli {
    /// FTDI device serial number (any device if omitted).
    #[arg(long)]
    pub serial: Option<String>,

    /// TCP port to listen on.
    #[arg(long, default_value_t = 2542)]
    pub port: u16,

    /// Initial TCK frequency in Hz.
    #[arg(long)]
    pub frequency: Option<u32>,

    /// Maximum XVC vector size advertised via `getinfo:`, in bytes.
    #[arg(long)]
    pub max_vector_size: Option<usize>,

    /// Optional TOML config file; CLI flags override its values.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Repeatable IPv4 CIDR allow entry (e.g. `10.0.0.0/8`).
    #[arg(long = "whitelist")]
    pub whitelist_allow: Vec<String>,

    /// Repeatable IPv4 CIDR block entry.
    #[arg(long = "blocklist")]
    pub whitelist_block: Vec<String>,

    /// Whitelist enforcement mode.
    #[arg(long, default_value = "off")]
    pub whitelist_mode: String,

    #[arg(short, long)]
    pub verbose: bool,
}

#[derive(Deserialize, Default, Debug)]
struct FileConfig {
    serial: Option<String>,
    port: Option<u16>,
    frequency: Option<u32>,
    max_vector_size: Option<usize>,
    whitelist: Option<Vec<String>>,
    blocklist: Option<Vec<String>>,
    whitelist_mode: Option<String>,
}

/// Fully resolved, validated configuration for one run of the bridge.
#[derive(Debug, Clone)]
pub struct Config {
    pub serial: Option<String>,
    pub port: u16,
    pub frequency_hz: u32,
    pub max_vector_size: usize,
    pub whitelist_allow: Vec<String>,
    pub whitelist_block: Vec<String>,
    pub whitelist_mode: WhitelistMode,
    pub verbose: bool,
}

impl Config {
    /// Merge CLI flags over an optional TOML file, then validate.
    pub fn load(cli: Cli) -> Result<Self, CoreError> {
        let file = match &cli.config {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|e| {
                    CoreError::ConfigError(format!("reading {}: {e}", path.display()))
                })?;
                toml::from_str::<FileConfig>(&text)
                    .map_err(|e| CoreError::ConfigError(format!("parsing {}: {e}", path.display())))?
            }
            None => FileConfig::default(),
        };

        let whitelist_mode_str = if cli.whitelist_mode != "off" {
            cli.whitelist_mode.clone()
        } else {
            file.whitelist_mode.clone().unwrap_or_else(|| "off".to_string())
        };
        let whitelist_mode = whitelist_mode_str
            .parse::<WhitelistMode>()
            .map_err(CoreError::ConfigError)?;

        let mut whitelist_allow = file.whitelist.unwrap_or_default();
        whitelist_allow.extend(cli.whitelist_allow);
        let mut whitelist_block = file.blocklist.unwrap_or_default();
        whitelist_block.extend(cli.whitelist_block);

        let config = Config {
            serial: cli.serial.or(file.serial),
            port: if cli.port != 2542 { cli.port } else { file.port.unwrap_or(cli.port) },
            frequency_hz: cli.frequency.or(file.frequency).unwrap_or(DEFAULT_FREQUENCY_HZ),
            max_vector_size: cli
                .max_vector_size
                .or(file.max_vector_size)
                .unwrap_or(DEFAULT_MAX_VECTOR_SIZE),
            whitelist_allow,
            whitelist_block,
            whitelist_mode,
            verbose: cli.verbose,
        };
        config.validate()?;
        Ok(config)
    }

    /// Enforce range invariants before any device I/O (spec.md §7:
    /// "ConfigError: only at session init; rejected before any device
    /// I/O").
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.max_vector_size == 0 || self.max_vector_size > MAX_VECTOR_SIZE_LIMIT {
            return Err(CoreError::ConfigError(format!(
                "max_vector_size must be in (0, {MAX_VECTOR_SIZE_LIMIT}], got {}",
                self.max_vector_size
            )));
        }
        if self.frequency_hz == 0 {
            return Err(CoreError::ConfigError("frequency must be > 0".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_cli() -> Cli {
        Cli {
            serial: None,
            port: 2542,
            frequency: None,
            max_vector_size: None,
            config: None,
            whitelist_allow: vec![],
            whitelist_block: vec![],
            whitelist_mode: "off".to_string(),
            verbose: false,
        }
    }

    #[test]
    fn defaults_are_valid() {
        let config = Config::load(base_cli()).unwrap();
        assert_eq!(config.max_vector_size, DEFAULT_MAX_VECTOR_SIZE);
        assert_eq!(config.frequency_hz, DEFAULT_FREQUENCY_HZ);
        assert_eq!(config.whitelist_mode, WhitelistMode::Off);
    }

    #[test]
    fn rejects_oversized_vector() {
        let mut cli = base_cli();
        cli.max_vector_size = Some(MAX_VECTOR_SIZE_LIMIT + 1);
        assert!(Config::load(cli).is_err());
    }

    #[test]
    fn rejects_zero_frequency() {
        let mut cli = base_cli();
        cli.frequency = Some(0);
        assert!(Config::load(cli).is_err());
    }

    #[test]
    fn cli_whitelist_mode_overrides_default() {
        let mut cli = base_cli();
        cli.whitelist_mode = "strict".to_string();
        let config = Config::load(cli).unwrap();
        assert_eq!(config.whitelist_mode, WhitelistMode::Strict);
    }
}
