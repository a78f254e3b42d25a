//! Virtual machine configuration types.

mod boot_loader;
mod platform;
mod vm_config;

pub use boot_loader::MacOsBootLoader;
pub use platform::MacPlatform;
pub use vm_config::VirtualMachineConfiguration;
