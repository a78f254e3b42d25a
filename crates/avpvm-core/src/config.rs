//! Virtual machine parameters and the validated configuration record.
//!
//! [`VmParameters`] is the raw, serde-friendly parameter bag a caller fills in
//! (from a settings file, the command line, or code). The only way to obtain a
//! [`ConfigurationRecord`] is [`ConfigurationRecord::new`], which checks every
//! field and derives the hardware identity. A record never changes after it
//! has been built.
//!
//! ## Example
//!
//! ```toml
//! rom_path = "/path/to/AVPBooter.vresearch1.bin"
//! aux_path = "/path/to/aux.img"
//! platform_version = 2
//! cpu_count = 4
//! memory_size = 4294967296
//! debug = true
//! debug_port = 1234
//!
//! [minimum_os]
//! major = 12
//! minor = 0
//! subminor = 0
//! ```

use std::fmt;
use std::net::{Ipv4Addr, TcpListener};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, VmError};
use crate::identity::{HardwareIdentity, PlatformVersion};

/// One gibibyte.
pub const GIB: u64 = 1024 * 1024 * 1024;

/// Smallest memory size the early boot stage accepts.
pub const MIN_MEMORY_SIZE: u64 = 2 * GIB;

/// The only hardware-model data representation version currently understood.
pub const DATA_REPRESENTATION_VERSION: u32 = 1;

// ============================================================================
// Parameters
// ============================================================================

/// Minimum guest OS version the runtime enforces for the hardware model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct OsVersion {
    /// Major version.
    pub major: u32,
    /// Minor version.
    pub minor: u32,
    /// Subminor (patch) version.
    pub subminor: u32,
}

impl OsVersion {
    /// Creates a version triple.
    #[must_use]
    pub const fn new(major: u32, minor: u32, subminor: u32) -> Self {
        Self {
            major,
            minor,
            subminor,
        }
    }
}

impl Default for OsVersion {
    fn default() -> Self {
        Self::new(12, 0, 0)
    }
}

impl fmt::Display for OsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.subminor)
    }
}

/// Raw, unvalidated virtual machine parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmParameters {
    /// Boot ROM image overriding the runtime's built-in ROM.
    pub rom_path: Option<PathBuf>,
    /// Auxiliary storage holding non-filesystem persisted state (NVRAM).
    pub aux_path: Option<PathBuf>,
    /// Primary storage (disk image).
    pub storage_path: Option<PathBuf>,

    /// Hardware model data representation version.
    pub data_representation_version: u32,
    /// Platform version, 1 or 2.
    pub platform_version: u32,
    /// Minimum supported guest OS.
    pub minimum_os: OsVersion,

    /// Caller-supplied board ID. Derived from the platform version when unset.
    pub board_id: Option<u32>,
    /// Caller-supplied chip ID (ECID). Randomly generated when unset.
    pub chip_id: Option<u64>,

    /// Number of virtual CPUs.
    pub cpu_count: u32,
    /// Memory size in bytes.
    pub memory_size: u64,

    /// Always boot into DFU mode.
    pub force_dfu: bool,
    /// Keep the production fuse enabled (the runtime default).
    pub production_mode: bool,
    /// Expose a GDB remote debugging stub.
    pub debug: bool,
    /// TCP port for the debug stub. Required when `debug` is set.
    pub debug_port: Option<u16>,

    /// File receiving PL011 serial output. Standard I/O when unset.
    pub serial_log: Option<PathBuf>,
    /// Extra runtime start flags.
    pub start: StartFlags,
}

impl Default for VmParameters {
    fn default() -> Self {
        Self {
            rom_path: None,
            aux_path: None,
            storage_path: None,
            data_representation_version: DATA_REPRESENTATION_VERSION,
            platform_version: 2,
            minimum_os: OsVersion::default(),
            board_id: None,
            chip_id: None,
            cpu_count: 2,
            memory_size: 4 * GIB,
            force_dfu: false,
            production_mode: true,
            debug: false,
            debug_port: None,
            serial_log: None,
            start: StartFlags::default(),
        }
    }
}

/// Runtime start flags beyond DFU forcing.
///
/// Most of these require the private virtualization entitlement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StartFlags {
    /// Halt once iBoot stage 1 is reached.
    pub stop_in_iboot_stage1: bool,
    /// Halt once iBoot stage 2 is reached.
    pub stop_in_iboot_stage2: bool,
    /// Boot into macOS recovery.
    pub boot_recovery: bool,
    /// Ask the runtime to act on guest panics.
    pub panic_action: bool,
    /// Ask the runtime to act on guest restarts.
    pub restart_action: bool,
}

// ============================================================================
// Configuration Record
// ============================================================================

/// A fully validated, immutable virtual machine configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigurationRecord {
    rom_path: Option<PathBuf>,
    aux_path: Option<PathBuf>,
    storage_path: Option<PathBuf>,
    platform_version: PlatformVersion,
    minimum_os: OsVersion,
    identity: HardwareIdentity,
    cpu_count: u32,
    memory_size: u64,
    force_dfu: bool,
    production_mode: bool,
    debug_port: Option<u16>,
    serial_log: Option<PathBuf>,
    start: StartFlags,
}

impl ConfigurationRecord {
    /// Validates `params` and derives the hardware identity.
    ///
    /// Fails on the first violated invariant with
    /// [`VmError::InvalidConfiguration`] naming the field. Identity derivation
    /// only runs once every field check has passed.
    pub fn new(params: VmParameters) -> Result<Self> {
        let platform_version = validate(&params)?;
        let identity = HardwareIdentity::derive(
            platform_version.as_u32(),
            params.board_id,
            params.chip_id,
        )?;

        let debug_port = if params.debug { params.debug_port } else { None };

        Ok(Self {
            rom_path: params.rom_path,
            aux_path: params.aux_path,
            storage_path: params.storage_path,
            platform_version,
            minimum_os: params.minimum_os,
            identity,
            cpu_count: params.cpu_count,
            memory_size: params.memory_size,
            force_dfu: params.force_dfu,
            production_mode: params.production_mode,
            debug_port,
            serial_log: params.serial_log,
            start: params.start,
        })
    }

    /// Boot ROM override.
    pub fn rom_path(&self) -> Option<&Path> {
        self.rom_path.as_deref()
    }

    /// Auxiliary storage path.
    pub fn aux_path(&self) -> Option<&Path> {
        self.aux_path.as_deref()
    }

    /// Primary storage path.
    pub fn storage_path(&self) -> Option<&Path> {
        self.storage_path.as_deref()
    }

    /// Path that identifies this machine's persisted state, if any.
    ///
    /// The auxiliary storage carries the machine identity, so it wins over
    /// the primary storage.
    pub fn persistent_state_path(&self) -> Option<&Path> {
        self.aux_path().or_else(|| self.storage_path())
    }

    /// Whether the instance can persist boot state between runs.
    pub fn has_persistent_state(&self) -> bool {
        self.persistent_state_path().is_some()
    }

    /// Platform version.
    pub fn platform_version(&self) -> PlatformVersion {
        self.platform_version
    }

    /// Minimum supported guest OS.
    pub fn minimum_os(&self) -> OsVersion {
        self.minimum_os
    }

    /// Derived hardware identity.
    pub fn identity(&self) -> &HardwareIdentity {
        &self.identity
    }

    /// Virtual CPU count.
    pub fn cpu_count(&self) -> u32 {
        self.cpu_count
    }

    /// Memory size in bytes.
    pub fn memory_size(&self) -> u64 {
        self.memory_size
    }

    /// Whether DFU mode was explicitly requested.
    pub fn force_dfu(&self) -> bool {
        self.force_dfu
    }

    /// Whether the production fuse stays enabled.
    pub fn production_mode(&self) -> bool {
        self.production_mode
    }

    /// Debug stub port, present only when debugging is enabled.
    pub fn debug_port(&self) -> Option<u16> {
        self.debug_port
    }

    /// Serial log destination.
    pub fn serial_log(&self) -> Option<&Path> {
        self.serial_log.as_deref()
    }

    /// Extra runtime start flags.
    pub fn start_flags(&self) -> StartFlags {
        self.start
    }
}

// ============================================================================
// Validation
// ============================================================================

/// Checks every field invariant. Returns the parsed platform version.
fn validate(params: &VmParameters) -> Result<PlatformVersion> {
    if params.data_representation_version != DATA_REPRESENTATION_VERSION {
        return Err(VmError::invalid(
            "data_representation_version",
            format!(
                "unsupported version {}, expected {DATA_REPRESENTATION_VERSION}",
                params.data_representation_version
            ),
        ));
    }

    let platform_version = PlatformVersion::try_from(params.platform_version).map_err(|_| {
        VmError::invalid(
            "platform_version",
            format!("{} is not one of 1, 2", params.platform_version),
        )
    })?;

    if params.minimum_os.major == 0 {
        return Err(VmError::invalid(
            "minimum_os",
            format!("{} has no major version", params.minimum_os),
        ));
    }

    if params.cpu_count == 0 {
        return Err(VmError::invalid("cpu_count", "at least one CPU is required"));
    }

    if params.memory_size < MIN_MEMORY_SIZE {
        return Err(VmError::invalid(
            "memory_size",
            format!(
                "{} bytes is below the {} byte minimum",
                params.memory_size, MIN_MEMORY_SIZE
            ),
        ));
    }

    if params.debug {
        match params.debug_port {
            None => {
                return Err(VmError::invalid(
                    "debug_port",
                    "required when debug is enabled",
                ));
            }
            Some(0) => {
                return Err(VmError::invalid("debug_port", "port 0 is not a valid port"));
            }
            Some(_) => {}
        }
    }

    Ok(platform_version)
}

/// Checks that `port` can be bound on the loopback interface.
///
/// The probe socket is released before returning, so the runtime can take
/// the port over.
pub fn ensure_port_available(port: u16) -> Result<()> {
    TcpListener::bind((Ipv4Addr::LOCALHOST, port))
        .map(drop)
        .map_err(|e| VmError::invalid("debug_port", format!("port {port} is unavailable: {e}")))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use figment::providers::Format;

    #[test]
    fn test_defaults_are_valid() {
        let record = ConfigurationRecord::new(VmParameters::default()).unwrap();
        assert_eq!(record.platform_version(), PlatformVersion::V2);
        assert_eq!(record.cpu_count(), 2);
        assert_eq!(record.memory_size(), 4 * GIB);
        assert!(record.production_mode());
        assert!(record.debug_port().is_none());
        assert!(!record.has_persistent_state());
    }

    #[test]
    fn test_memory_below_minimum_rejected() {
        let params = VmParameters {
            memory_size: MIN_MEMORY_SIZE - 1,
            ..Default::default()
        };
        let err = ConfigurationRecord::new(params).unwrap_err();
        assert_eq!(err.field(), Some("memory_size"));
    }

    #[test]
    fn test_memory_at_minimum_accepted() {
        let params = VmParameters {
            memory_size: MIN_MEMORY_SIZE,
            ..Default::default()
        };
        assert!(ConfigurationRecord::new(params).is_ok());
    }

    #[test]
    fn test_platform_version_out_of_range_rejected() {
        for version in [0, 3, 42] {
            let params = VmParameters {
                platform_version: version,
                ..Default::default()
            };
            let err = ConfigurationRecord::new(params).unwrap_err();
            assert_eq!(err.field(), Some("platform_version"));
        }
    }

    #[test]
    fn test_zero_cpus_rejected() {
        let params = VmParameters {
            cpu_count: 0,
            ..Default::default()
        };
        let err = ConfigurationRecord::new(params).unwrap_err();
        assert_eq!(err.field(), Some("cpu_count"));
    }

    #[test]
    fn test_data_representation_version_must_be_one() {
        let params = VmParameters {
            data_representation_version: 2,
            ..Default::default()
        };
        let err = ConfigurationRecord::new(params).unwrap_err();
        assert_eq!(err.field(), Some("data_representation_version"));
    }

    #[test]
    fn test_minimum_os_requires_major() {
        let params = VmParameters {
            minimum_os: OsVersion::new(0, 1, 0),
            ..Default::default()
        };
        let err = ConfigurationRecord::new(params).unwrap_err();
        assert_eq!(err.field(), Some("minimum_os"));
    }

    #[test]
    fn test_debug_requires_port() {
        let params = VmParameters {
            debug: true,
            ..Default::default()
        };
        let err = ConfigurationRecord::new(params).unwrap_err();
        assert_eq!(err.field(), Some("debug_port"));

        let params = VmParameters {
            debug: true,
            debug_port: Some(0),
            ..Default::default()
        };
        let err = ConfigurationRecord::new(params).unwrap_err();
        assert_eq!(err.field(), Some("debug_port"));
    }

    #[test]
    fn test_debug_port_ignored_without_debug() {
        let params = VmParameters {
            debug: false,
            debug_port: Some(1234),
            ..Default::default()
        };
        let record = ConfigurationRecord::new(params).unwrap();
        assert_eq!(record.debug_port(), None);
    }

    #[test]
    fn test_first_violation_wins() {
        // Platform version is checked before memory size.
        let params = VmParameters {
            platform_version: 7,
            memory_size: 1,
            ..Default::default()
        };
        let err = ConfigurationRecord::new(params).unwrap_err();
        assert_eq!(err.field(), Some("platform_version"));
    }

    #[test]
    fn test_persistent_state_prefers_aux() {
        let params = VmParameters {
            aux_path: Some(PathBuf::from("/vm/aux.img")),
            storage_path: Some(PathBuf::from("/vm/disk.img")),
            ..Default::default()
        };
        let record = ConfigurationRecord::new(params).unwrap();
        assert_eq!(
            record.persistent_state_path(),
            Some(Path::new("/vm/aux.img"))
        );

        let params = VmParameters {
            storage_path: Some(PathBuf::from("/vm/disk.img")),
            ..Default::default()
        };
        let record = ConfigurationRecord::new(params).unwrap();
        assert_eq!(
            record.persistent_state_path(),
            Some(Path::new("/vm/disk.img"))
        );
    }

    #[test]
    fn test_port_check_detects_busy_port() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = listener.local_addr().unwrap().port();

        let err = ensure_port_available(port).unwrap_err();
        assert_eq!(err.field(), Some("debug_port"));

        drop(listener);
        assert!(ensure_port_available(port).is_ok());
    }

    #[test]
    fn test_parameters_deserialize_with_defaults() {
        let params: VmParameters = figment::Figment::new()
            .merge(figment::providers::Serialized::defaults(VmParameters::default()))
            .merge(figment::providers::Toml::string(
                "platform_version = 1\ncpu_count = 8\n[minimum_os]\nmajor = 13\n",
            ))
            .extract()
            .unwrap();
        assert_eq!(params.platform_version, 1);
        assert_eq!(params.cpu_count, 8);
        assert_eq!(params.minimum_os, OsVersion::new(13, 0, 0));
        assert_eq!(params.memory_size, 4 * GIB);
    }
}
