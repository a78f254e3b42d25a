//! Lifecycle core for Apple Virtual Platform research virtual machines.
//!
//! This crate validates virtual machine parameters, derives the hardware
//! identity (board ID and chip ID), assembles the boot-time options and drives
//! one machine through its lifecycle against an opaque hypervisor runtime.
//!
//! The runtime itself lives behind the [`VmRuntime`] trait; the macOS
//! Virtualization.framework adapter is provided by `avpvm-vz`.
//!
//! # Example
//!
//! ```rust,no_run
//! use avpvm_core::{LifecycleController, VmParameters, VmRuntime};
//!
//! async fn run(runtime: impl VmRuntime + 'static) -> avpvm_core::Result<()> {
//!     let controller = LifecycleController::new(runtime);
//!     controller.configure(VmParameters {
//!         rom_path: Some("/path/to/AVPBooter.vresearch1.bin".into()),
//!         cpu_count: 4,
//!         ..Default::default()
//!     })?;
//!
//!     let mut events = controller.subscribe();
//!     controller.start().await?;
//!     let _ = events.recv().await;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::doc_markdown)]

pub mod boot;
pub mod config;
pub mod controller;
pub mod error;
pub mod event;
pub mod identity;
pub mod runtime;
pub mod settings;

// Re-exports for convenience
pub use boot::{
    BootDescriptor, BootMode, DebugStubConfig, SerialAttachment, SerialPortConfig, StartOptions,
    UartKind,
};
pub use config::{
    ConfigurationRecord, GIB, MIN_MEMORY_SIZE, OsVersion, StartFlags, VmParameters,
    ensure_port_available,
};
pub use controller::{LifecycleController, VmState};
pub use error::{Result, RuntimeError, VmError};
pub use event::{EventSink, StopReason, VmEvent};
pub use identity::{HardwareIdentity, IdentityRegistry, LeaseOwner, PlatformVersion};
pub use runtime::{RuntimeDelegate, RuntimeHandle, RuntimeSubmission, VmRuntime};
pub use settings::{LoggingConfig, Settings};
