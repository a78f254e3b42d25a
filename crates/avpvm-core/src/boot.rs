//! Boot assembly.
//!
//! Translates a [`ConfigurationRecord`] into the boot-time options handed to
//! the runtime together with the configuration: ROM override, debug stub,
//! serial console and start options. A [`BootDescriptor`] is built fresh for
//! every start attempt and dropped once submitted.

use std::path::{Path, PathBuf};

use crate::config::ConfigurationRecord;

// ============================================================================
// Boot Descriptor
// ============================================================================

/// Boot-time options submitted alongside the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootDescriptor {
    /// Boot ROM replacing the runtime's built-in one.
    pub rom: Option<PathBuf>,
    /// GDB remote debugging stub.
    pub debug_stub: Option<DebugStubConfig>,
    /// Serial console capturing early boot output.
    pub serial: SerialPortConfig,
}

impl BootDescriptor {
    /// Assembles the boot descriptor for `record`.
    ///
    /// The debug stub depends only on the record's debug settings; the
    /// production fuse setting has no say in it.
    #[must_use]
    pub fn assemble(record: &ConfigurationRecord) -> Self {
        let rom = record.rom_path().map(Path::to_path_buf);
        let debug_stub = record.debug_port().map(|port| DebugStubConfig { port });
        let serial = SerialPortConfig::pl011(match record.serial_log() {
            Some(path) => SerialAttachment::File(path.to_path_buf()),
            None => SerialAttachment::Stdio,
        });

        tracing::debug!(
            rom = ?rom,
            debug_port = ?debug_stub.map(|d| d.port),
            serial = ?serial.attachment,
            "assembled boot descriptor"
        );

        Self {
            rom,
            debug_stub,
            serial,
        }
    }
}

/// GDB debug stub settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebugStubConfig {
    /// TCP port the stub listens on.
    pub port: u16,
}

/// UART model of the serial port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UartKind {
    /// ARM PL011, the debug UART iBoot writes to.
    Pl011,
}

/// Where serial output goes and where input comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SerialAttachment {
    /// The caller's standard input and output.
    Stdio,
    /// Output appended to a log file, no input.
    File(PathBuf),
}

/// Serial port settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialPortConfig {
    /// UART model.
    pub kind: UartKind,
    /// Attachment.
    pub attachment: SerialAttachment,
}

impl SerialPortConfig {
    /// A PL011 port with the given attachment.
    #[must_use]
    pub const fn pl011(attachment: SerialAttachment) -> Self {
        Self {
            kind: UartKind::Pl011,
            attachment,
        }
    }
}

// ============================================================================
// Start Options
// ============================================================================

/// Boot mode the runtime is asked to enter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootMode {
    /// Regular boot from persisted state.
    Normal,
    /// macOS recovery.
    Recovery,
    /// Device firmware update mode.
    Dfu,
}

/// Per-start runtime options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartOptions {
    /// Boot mode.
    pub boot_mode: BootMode,
    /// Halt once iBoot stage 1 is reached.
    pub stop_in_iboot_stage1: bool,
    /// Halt once iBoot stage 2 is reached.
    pub stop_in_iboot_stage2: bool,
    /// Runtime acts on guest panics.
    pub panic_action: bool,
    /// Runtime acts on guest restarts.
    pub restart_action: bool,
}

impl StartOptions {
    /// Derives the start options for `record`.
    ///
    /// An instance without persisted state has nothing to boot from and
    /// always lands in DFU, so DFU is requested explicitly in that case.
    #[must_use]
    pub fn for_record(record: &ConfigurationRecord) -> Self {
        let flags = record.start_flags();
        let boot_mode = if record.force_dfu() || !record.has_persistent_state() {
            BootMode::Dfu
        } else if flags.boot_recovery {
            BootMode::Recovery
        } else {
            BootMode::Normal
        };

        Self {
            boot_mode,
            stop_in_iboot_stage1: flags.stop_in_iboot_stage1,
            stop_in_iboot_stage2: flags.stop_in_iboot_stage2,
            panic_action: flags.panic_action,
            restart_action: flags.restart_action,
        }
    }

    /// Whether DFU mode is requested.
    #[must_use]
    pub fn force_dfu(&self) -> bool {
        self.boot_mode == BootMode::Dfu
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{StartFlags, VmParameters};

    fn record(params: VmParameters) -> ConfigurationRecord {
        ConfigurationRecord::new(params).unwrap()
    }

    #[test]
    fn test_debug_stub_independent_of_production_mode() {
        for production_mode in [true, false] {
            let boot = BootDescriptor::assemble(&record(VmParameters {
                debug: true,
                debug_port: Some(1234),
                production_mode,
                ..Default::default()
            }));
            assert_eq!(boot.debug_stub, Some(DebugStubConfig { port: 1234 }));
        }
    }

    #[test]
    fn test_no_debug_stub_without_debug() {
        let boot = BootDescriptor::assemble(&record(VmParameters::default()));
        assert!(boot.debug_stub.is_none());
    }

    #[test]
    fn test_serial_always_attached() {
        let boot = BootDescriptor::assemble(&record(VmParameters::default()));
        assert_eq!(boot.serial, SerialPortConfig::pl011(SerialAttachment::Stdio));

        let boot = BootDescriptor::assemble(&record(VmParameters {
            serial_log: Some(PathBuf::from("/tmp/iboot.log")),
            ..Default::default()
        }));
        assert_eq!(boot.serial.kind, UartKind::Pl011);
        assert_eq!(
            boot.serial.attachment,
            SerialAttachment::File(PathBuf::from("/tmp/iboot.log"))
        );
    }

    #[test]
    fn test_rom_override() {
        let boot = BootDescriptor::assemble(&record(VmParameters::default()));
        assert!(boot.rom.is_none());

        let boot = BootDescriptor::assemble(&record(VmParameters {
            rom_path: Some(PathBuf::from("/fw/AVPBooter.bin")),
            ..Default::default()
        }));
        assert_eq!(boot.rom, Some(PathBuf::from("/fw/AVPBooter.bin")));
    }

    #[test]
    fn test_no_storage_implies_dfu() {
        let options = StartOptions::for_record(&record(VmParameters::default()));
        assert_eq!(options.boot_mode, BootMode::Dfu);
        assert!(options.force_dfu());
    }

    #[test]
    fn test_boot_modes_with_storage() {
        let with_storage = VmParameters {
            aux_path: Some(PathBuf::from("/vm/aux.img")),
            ..Default::default()
        };

        let options = StartOptions::for_record(&record(with_storage.clone()));
        assert_eq!(options.boot_mode, BootMode::Normal);

        let options = StartOptions::for_record(&record(VmParameters {
            start: StartFlags {
                boot_recovery: true,
                stop_in_iboot_stage1: true,
                ..Default::default()
            },
            ..with_storage.clone()
        }));
        assert_eq!(options.boot_mode, BootMode::Recovery);
        assert!(options.stop_in_iboot_stage1);
        assert!(!options.stop_in_iboot_stage2);

        let options = StartOptions::for_record(&record(VmParameters {
            force_dfu: true,
            start: StartFlags {
                boot_recovery: true,
                ..Default::default()
            },
            ..with_storage
        }));
        assert_eq!(options.boot_mode, BootMode::Dfu);
    }
}
