//! Command line arguments.
//!
//! Every flag is optional and overrides the matching settings field.

use std::path::PathBuf;

use avpvm_core::{GIB, VmParameters};
use clap::Parser;

/// avpvm - Run Apple Virtualization research VMs
#[derive(Debug, Parser)]
#[command(name = "avpvm")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Settings file (default: ~/.config/avpvm/config.toml)
    #[arg(long, short)]
    pub config: Option<PathBuf>,

    /// Boot ROM replacing the built-in AVPBooter
    #[arg(long)]
    pub rom: Option<PathBuf>,

    /// Auxiliary storage (created if missing)
    #[arg(long)]
    pub aux: Option<PathBuf>,

    /// Primary disk image
    #[arg(long)]
    pub storage: Option<PathBuf>,

    /// Number of virtual CPUs
    #[arg(long)]
    pub cpus: Option<u32>,

    /// Memory size in GiB
    #[arg(long = "memory-gib")]
    pub memory_gib: Option<u64>,

    /// Hardware platform version (1 or 2)
    #[arg(long)]
    pub platform_version: Option<u32>,

    /// Board ID, decimal or 0x-prefixed hex
    #[arg(long, value_parser = parse_u32)]
    pub board_id: Option<u32>,

    /// Chip ID (ECID), decimal or 0x-prefixed hex. Reuse it to boot the
    /// same persisted state again.
    #[arg(long, value_parser = parse_u64)]
    pub chip_id: Option<u64>,

    /// Always boot into DFU mode
    #[arg(long)]
    pub force_dfu: bool,

    /// Boot into macOS recovery
    #[arg(long)]
    pub recovery: bool,

    /// Halt in iBoot stage 1
    #[arg(long)]
    pub stop_in_iboot_stage1: bool,

    /// Halt in iBoot stage 2
    #[arg(long)]
    pub stop_in_iboot_stage2: bool,

    /// Disable the production fuse (CPFM 01)
    #[arg(long)]
    pub no_production: bool,

    /// Expose a GDB debug stub on this port
    #[arg(long)]
    pub gdb_port: Option<u16>,

    /// Write serial output to this file instead of stdout
    #[arg(long)]
    pub serial_log: Option<PathBuf>,

    /// Enable debug output
    #[arg(long)]
    pub debug: bool,
}

impl Cli {
    /// Applies the command line overrides to `params`.
    pub fn apply(&self, params: &mut VmParameters) {
        if let Some(rom) = &self.rom {
            params.rom_path = Some(rom.clone());
        }
        if let Some(aux) = &self.aux {
            params.aux_path = Some(aux.clone());
        }
        if let Some(storage) = &self.storage {
            params.storage_path = Some(storage.clone());
        }
        if let Some(cpus) = self.cpus {
            params.cpu_count = cpus;
        }
        if let Some(gib) = self.memory_gib {
            params.memory_size = gib.saturating_mul(GIB);
        }
        if let Some(version) = self.platform_version {
            params.platform_version = version;
        }
        if self.board_id.is_some() {
            params.board_id = self.board_id;
        }
        if self.chip_id.is_some() {
            params.chip_id = self.chip_id;
        }
        if let Some(port) = self.gdb_port {
            params.debug = true;
            params.debug_port = Some(port);
        }
        if let Some(log) = &self.serial_log {
            params.serial_log = Some(log.clone());
        }

        params.force_dfu |= self.force_dfu;
        params.start.boot_recovery |= self.recovery;
        params.start.stop_in_iboot_stage1 |= self.stop_in_iboot_stage1;
        params.start.stop_in_iboot_stage2 |= self.stop_in_iboot_stage2;
        if self.no_production {
            params.production_mode = false;
        }
    }
}

fn parse_u64(s: &str) -> Result<u64, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid number '{s}': {e}"))
}

fn parse_u32(s: &str) -> Result<u32, String> {
    let value = parse_u64(s)?;
    u32::try_from(value).map_err(|_| format!("'{s}' does not fit in 32 bits"))
}
