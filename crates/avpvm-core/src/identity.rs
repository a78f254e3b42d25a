//! Hardware identity: board ID, chip ID and the chip ID registry.
//!
//! The runtime only accepts a Mac platform configuration whose board ID
//! matches the platform version of its hardware model, and it treats the chip
//! ID (ECID) as the stable identity of a machine's persisted state.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use rand::RngCore;

use crate::error::{Result, VmError};

/// Board ID of platform version 1 hardware.
pub const BOARD_ID_PLATFORM_V1: u32 = 0xF8;

/// Board ID of platform version 2 hardware.
pub const BOARD_ID_PLATFORM_V2: u32 = 0x20;

// ============================================================================
// Platform Version
// ============================================================================

/// Hardware platform version of the virtual Mac.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlatformVersion {
    /// Platform version 1.
    V1,
    /// Platform version 2.
    V2,
}

impl PlatformVersion {
    /// Numeric value as understood by the runtime.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        match self {
            Self::V1 => 1,
            Self::V2 => 2,
        }
    }

    /// Board ID the runtime expects for this platform version.
    #[must_use]
    pub const fn default_board_id(self) -> u32 {
        match self {
            Self::V1 => BOARD_ID_PLATFORM_V1,
            Self::V2 => BOARD_ID_PLATFORM_V2,
        }
    }
}

impl TryFrom<u32> for PlatformVersion {
    type Error = VmError;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            1 => Ok(Self::V1),
            2 => Ok(Self::V2),
            other => Err(VmError::UnsupportedPlatformVersion(other)),
        }
    }
}

impl fmt::Display for PlatformVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u32())
    }
}

// ============================================================================
// Hardware Identity
// ============================================================================

/// Board ID and chip ID of one virtual machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HardwareIdentity {
    board_id: u32,
    chip_id: u64,
    custom_board_id: bool,
    generated_chip_id: bool,
}

impl HardwareIdentity {
    /// Derives the identity for `platform_version`.
    ///
    /// Without a caller-supplied board ID the platform's well-known board ID
    /// is used. Without a caller-supplied chip ID a fresh random one is drawn;
    /// callers that re-attach to persisted state must store and re-supply it.
    ///
    /// Returns [`VmError::UnsupportedPlatformVersion`] for anything other than
    /// 1 or 2. Validation rejects those earlier, so hitting this is a bug.
    pub fn derive(platform_version: u32, board_id: Option<u32>, chip_id: Option<u64>) -> Result<Self> {
        let platform = PlatformVersion::try_from(platform_version)?;

        let (board_id, custom_board_id) = match board_id {
            Some(id) => (id, true),
            None => (platform.default_board_id(), false),
        };
        let (chip_id, generated_chip_id) = match chip_id {
            Some(id) => (id, false),
            None => (generate_chip_id(), true),
        };

        tracing::debug!(
            platform = %platform,
            board_id = format_args!("{board_id:#x}"),
            chip_id = format_args!("{chip_id:#018x}"),
            custom_board_id,
            generated_chip_id,
            "derived hardware identity"
        );

        Ok(Self {
            board_id,
            chip_id,
            custom_board_id,
            generated_chip_id,
        })
    }

    /// Board ID (BDID).
    #[must_use]
    pub const fn board_id(&self) -> u32 {
        self.board_id
    }

    /// Chip ID (ECID).
    #[must_use]
    pub const fn chip_id(&self) -> u64 {
        self.chip_id
    }

    /// Whether the board ID was supplied by the caller.
    #[must_use]
    pub const fn is_custom_board_id(&self) -> bool {
        self.custom_board_id
    }

    /// Whether the chip ID was generated rather than supplied.
    #[must_use]
    pub const fn is_generated_chip_id(&self) -> bool {
        self.generated_chip_id
    }
}

/// Draws a non-zero chip ID from the OS-seeded thread CSPRNG.
#[must_use]
pub fn generate_chip_id() -> u64 {
    let mut rng = rand::rng();
    loop {
        let id = rng.next_u64();
        if id != 0 {
            return id;
        }
    }
}

// ============================================================================
// Identity Registry
// ============================================================================

/// Identifies one lease holder, typically a lifecycle controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LeaseOwner(u64);

impl LeaseOwner {
    /// Allocates an owner distinct from every other in this process.
    #[must_use]
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Leases chip IDs to the persisted state they identify.
///
/// While a lease is held, its chip ID is used with exactly one
/// persisted-state path and that path with exactly one chip ID, by exactly
/// one owner. Leases end when the owner releases them; afterwards the same
/// pair can be re-attached, or the path taken over with another chip ID.
#[derive(Debug, Default)]
pub struct IdentityRegistry {
    leases: Mutex<Leases>,
}

#[derive(Debug)]
struct Lease {
    path: PathBuf,
    owner: LeaseOwner,
}

#[derive(Debug, Default)]
struct Leases {
    by_chip: HashMap<u64, Lease>,
    by_path: HashMap<PathBuf, u64>,
}

static GLOBAL_REGISTRY: OnceLock<Arc<IdentityRegistry>> = OnceLock::new();

impl IdentityRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide registry shared by controllers that do not bring their own.
    pub fn global() -> Arc<Self> {
        Arc::clone(GLOBAL_REGISTRY.get_or_init(|| Arc::new(Self::new())))
    }

    fn lock(&self) -> MutexGuard<'_, Leases> {
        self.leases.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Checks that `owner` could lease `chip_id` for `state_path`.
    pub fn check(&self, owner: LeaseOwner, chip_id: u64, state_path: &Path) -> Result<()> {
        self.lock().check(owner, chip_id, state_path)
    }

    /// Leases `chip_id` with `state_path` to `owner`.
    ///
    /// Any other lease `owner` holds is released once the new one is granted;
    /// on failure its existing leases are kept.
    pub fn bind(&self, owner: LeaseOwner, chip_id: u64, state_path: &Path) -> Result<()> {
        let mut leases = self.lock();
        leases.check(owner, chip_id, state_path)?;

        if leases
            .by_chip
            .get(&chip_id)
            .is_some_and(|lease| lease.owner == owner && lease.path == state_path)
        {
            return Ok(());
        }

        leases.release(owner);
        tracing::debug!(
            chip_id = format_args!("{chip_id:#018x}"),
            path = %state_path.display(),
            "leased chip ID"
        );
        leases.by_chip.insert(
            chip_id,
            Lease {
                path: state_path.to_path_buf(),
                owner,
            },
        );
        leases.by_path.insert(state_path.to_path_buf(), chip_id);
        Ok(())
    }

    /// Releases every lease held by `owner`.
    pub fn release(&self, owner: LeaseOwner) {
        self.lock().release(owner);
    }

    /// Returns the chip ID currently leased with `state_path`.
    pub fn chip_id_for(&self, state_path: &Path) -> Option<u64> {
        self.lock().by_path.get(state_path).copied()
    }

    /// Number of live leases.
    pub fn len(&self) -> usize {
        self.lock().by_chip.len()
    }

    /// Returns true if no lease is held.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Leases {
    /// Leases already held by `owner` never conflict; they are replaced.
    fn check(&self, owner: LeaseOwner, chip_id: u64, state_path: &Path) -> Result<()> {
        if let Some(lease) = self.by_chip.get(&chip_id)
            && lease.owner != owner
        {
            let reason = if lease.path == state_path {
                format!(
                    "{chip_id:#018x} is in use by another instance of {}",
                    state_path.display()
                )
            } else {
                format!(
                    "{chip_id:#018x} already identifies persisted state at {}",
                    lease.path.display()
                )
            };
            return Err(VmError::invalid("chip_id", reason));
        }

        if let Some(&bound) = self.by_path.get(state_path)
            && bound != chip_id
            && self.by_chip.get(&bound).is_some_and(|lease| lease.owner != owner)
        {
            return Err(VmError::invalid(
                "chip_id",
                format!(
                    "{} is in use with chip ID {bound:#018x}, not {chip_id:#018x}",
                    state_path.display()
                ),
            ));
        }

        Ok(())
    }

    fn release(&mut self, owner: LeaseOwner) {
        let released: Vec<u64> = self
            .by_chip
            .iter()
            .filter(|(_, lease)| lease.owner == owner)
            .map(|(&chip_id, _)| chip_id)
            .collect();

        for chip_id in released {
            if let Some(lease) = self.by_chip.remove(&chip_id) {
                self.by_path.remove(&lease.path);
                tracing::debug!(
                    chip_id = format_args!("{chip_id:#018x}"),
                    path = %lease.path.display(),
                    "released chip ID"
                );
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_board_id_is_deterministic_per_platform() {
        let a = HardwareIdentity::derive(1, None, Some(1)).unwrap();
        let b = HardwareIdentity::derive(1, None, Some(2)).unwrap();
        assert_eq!(a.board_id(), BOARD_ID_PLATFORM_V1);
        assert_eq!(a.board_id(), b.board_id());
        assert!(!a.is_custom_board_id());

        let c = HardwareIdentity::derive(2, None, Some(1)).unwrap();
        assert_eq!(c.board_id(), BOARD_ID_PLATFORM_V2);
        assert_ne!(a.board_id(), c.board_id());
    }

    #[test]
    fn test_custom_board_id_kept() {
        let identity = HardwareIdentity::derive(2, Some(0x24), None).unwrap();
        assert_eq!(identity.board_id(), 0x24);
        assert!(identity.is_custom_board_id());
    }

    #[test]
    fn test_supplied_chip_id_kept() {
        let identity = HardwareIdentity::derive(1, None, Some(0x1122_3344_5566_7788)).unwrap();
        assert_eq!(identity.chip_id(), 0x1122_3344_5566_7788);
        assert!(!identity.is_generated_chip_id());
    }

    #[test]
    fn test_generated_chip_ids_differ() {
        let a = HardwareIdentity::derive(2, None, None).unwrap();
        let b = HardwareIdentity::derive(2, None, None).unwrap();
        assert!(a.is_generated_chip_id());
        assert_ne!(a.chip_id(), 0);
        assert_ne!(a.chip_id(), b.chip_id());
    }

    #[test]
    fn test_unsupported_platform_version() {
        let err = HardwareIdentity::derive(3, None, None).unwrap_err();
        assert!(matches!(err, VmError::UnsupportedPlatformVersion(3)));
    }

    #[test]
    fn test_registry_same_owner_rebinds() {
        let registry = IdentityRegistry::new();
        let owner = LeaseOwner::next();
        let path = Path::new("/vm/aux.img");
        registry.bind(owner, 7, path).unwrap();
        registry.bind(owner, 7, path).unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.chip_id_for(path), Some(7));
    }

    #[test]
    fn test_registry_rejects_chip_reuse_across_paths() {
        let registry = IdentityRegistry::new();
        registry.bind(LeaseOwner::next(), 7, Path::new("/vm/a.img")).unwrap();
        let err = registry
            .bind(LeaseOwner::next(), 7, Path::new("/vm/b.img"))
            .unwrap_err();
        assert_eq!(err.field(), Some("chip_id"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_registry_rejects_second_live_owner() {
        let registry = IdentityRegistry::new();
        let path = Path::new("/vm/a.img");
        let (a, b) = (LeaseOwner::next(), LeaseOwner::next());

        registry.bind(a, 7, path).unwrap();
        assert!(registry.check(b, 7, path).is_err());
        assert!(registry.bind(b, 7, path).is_err());

        registry.release(a);
        registry.bind(b, 7, path).unwrap();
        assert_eq!(registry.chip_id_for(path), Some(7));
    }

    #[test]
    fn test_registry_rejects_new_chip_for_leased_path() {
        let registry = IdentityRegistry::new();
        let path = Path::new("/vm/a.img");
        let owner = LeaseOwner::next();
        registry.bind(owner, 7, path).unwrap();

        let other = LeaseOwner::next();
        assert!(registry.bind(other, 8, path).is_err());
        assert!(registry.check(other, 8, Path::new("/vm/b.img")).is_ok());

        registry.release(owner);
        registry.bind(other, 8, path).unwrap();
        assert_eq!(registry.chip_id_for(path), Some(8));
    }

    #[test]
    fn test_rebind_moves_lease() {
        let registry = IdentityRegistry::new();
        let owner = LeaseOwner::next();
        registry.bind(owner, 7, Path::new("/vm/a.img")).unwrap();
        registry.bind(owner, 8, Path::new("/vm/b.img")).unwrap();

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.chip_id_for(Path::new("/vm/a.img")), None);
        assert_eq!(registry.chip_id_for(Path::new("/vm/b.img")), Some(8));
    }

    #[test]
    fn test_failed_rebind_keeps_lease() {
        let registry = IdentityRegistry::new();
        let (a, b) = (LeaseOwner::next(), LeaseOwner::next());
        registry.bind(a, 7, Path::new("/vm/a.img")).unwrap();
        registry.bind(b, 8, Path::new("/vm/b.img")).unwrap();

        assert!(registry.bind(a, 8, Path::new("/vm/b.img")).is_err());
        assert_eq!(registry.chip_id_for(Path::new("/vm/a.img")), Some(7));
    }
}
