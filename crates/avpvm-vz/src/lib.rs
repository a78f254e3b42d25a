//! Virtualization.framework runtime for avpvm.
//!
//! This crate implements [`avpvm_core::VmRuntime`] on top of Apple's
//! Virtualization.framework, including the private parts of its API needed to
//! run a research Mac platform: custom boot ROM, GDB debug stub, PL011 serial
//! port, production fuse control and the private start options.
//!
//! # Example
//!
//! ```rust,no_run
//! use avpvm_core::{LifecycleController, VmParameters};
//! # #[cfg(target_os = "macos")]
//! use avpvm_vz::VzRuntime;
//!
//! # #[cfg(target_os = "macos")]
//! # async fn run() -> avpvm_core::Result<()> {
//! let controller = LifecycleController::new(VzRuntime::new());
//! controller.configure(VmParameters {
//!     rom_path: Some("/path/to/AVPBooter.vresearch1.bin".into()),
//!     ..Default::default()
//! })?;
//! controller.start().await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Platform Support
//!
//! macOS 12 (Monterey) or later on Apple silicon. On other targets this crate
//! is empty.
//!
//! # Entitlements
//!
//! The process needs `com.apple.security.virtualization`. Debug stub, start
//! options and production mode control also need
//! `com.apple.private.virtualization`.

#![cfg(target_os = "macos")]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
// FFI bindings require extensive pointer casts - these are intentional and safe.
#![allow(clippy::ptr_as_ptr)]
#![allow(clippy::ptr_cast_constness)]
#![allow(clippy::ref_as_ptr)]
#![allow(clippy::borrow_as_ptr)]
#![allow(clippy::unnecessary_cast)]
// Documentation lints - acceptable for FFI code.
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_possible_wrap)]

pub mod error;
pub mod ffi;

pub mod configuration;
pub(crate) mod delegate;
pub mod device;
pub mod runtime;
pub mod vm;

// Re-exports for convenience
pub use error::{VzError, VzResult};

pub use configuration::{MacOsBootLoader, MacPlatform, VirtualMachineConfiguration};
pub use device::{DebugStubConfiguration, SerialPortConfiguration, StorageDeviceConfiguration};
pub use runtime::VzRuntime;
pub use vm::VirtualMachine;

/// Check if virtualization is supported on this system.
///
/// Returns `true` if the Virtualization.framework is available and the
/// hardware supports virtualization.
#[must_use]
pub fn is_supported() -> bool {
    ffi::is_supported()
}
