//! Device configuration types.

mod debug_stub;
mod serial;
mod storage;

pub use debug_stub::DebugStubConfiguration;
pub use serial::SerialPortConfiguration;
pub use storage::StorageDeviceConfiguration;
