//! Virtual machine configuration.

use crate::delegate::DelegateObject;
use crate::device::{DebugStubConfiguration, SerialPortConfiguration, StorageDeviceConfiguration};
use crate::error::{VzError, VzResult};
use crate::ffi::{DispatchQueue, extract_nserror, nsarray, release, require_class, responds_to};
use crate::vm::VirtualMachine;
use crate::{msg_send, msg_send_bool, msg_send_u64, msg_send_void, msg_send_void_u64};
use objc2::runtime::AnyObject;
use std::ptr;

use super::{MacOsBootLoader, MacPlatform};

/// Label of the queue every virtual machine runs on.
const QUEUE_LABEL: &str = "com.avpvm.vz.vm";

// ============================================================================
// VM Configuration
// ============================================================================

/// Configuration for creating a virtual machine.
///
/// Use the builder methods to configure the VM, then call `build()` to
/// create the `VirtualMachine` instance.
pub struct VirtualMachineConfiguration {
    inner: *mut AnyObject,
    storage_devices: Vec<*mut AnyObject>,
    serial_ports: Vec<*mut AnyObject>,
}

unsafe impl Send for VirtualMachineConfiguration {}

impl VirtualMachineConfiguration {
    /// Creates a new VM configuration with default settings.
    pub fn new() -> VzResult<Self> {
        unsafe {
            let cls = require_class("VZVirtualMachineConfiguration")?;
            let alloc = msg_send!(cls, alloc);
            let obj = msg_send!(alloc, init);

            if obj.is_null() {
                return Err(VzError::Creation("VZVirtualMachineConfiguration"));
            }

            Ok(Self {
                inner: obj,
                storage_devices: Vec::new(),
                serial_ports: Vec::new(),
            })
        }
    }

    /// Sets the number of CPUs for the VM.
    pub fn set_cpu_count(&mut self, count: u32) -> &mut Self {
        unsafe {
            msg_send_void_u64!(self.inner, setCPUCount: u64::from(count));
        }
        self
    }

    /// Gets the configured CPU count.
    pub fn cpu_count(&self) -> u64 {
        unsafe { msg_send_u64!(self.inner, CPUCount) }
    }

    /// Sets the memory size in bytes.
    pub fn set_memory_size(&mut self, bytes: u64) -> &mut Self {
        unsafe {
            msg_send_void_u64!(self.inner, setMemorySize: bytes);
        }
        self
    }

    /// Gets the configured memory size in bytes.
    pub fn memory_size(&self) -> u64 {
        unsafe { msg_send_u64!(self.inner, memorySize) }
    }

    /// Sets the boot loader for the VM.
    pub fn set_boot_loader(&mut self, boot_loader: &MacOsBootLoader) -> &mut Self {
        unsafe {
            msg_send_void!(self.inner, setBootLoader: boot_loader.as_ptr());
        }
        self
    }

    /// Sets the platform configuration.
    pub fn set_platform(&mut self, platform: &MacPlatform) -> &mut Self {
        unsafe {
            msg_send_void!(self.inner, setPlatform: platform.as_ptr());
        }
        self
    }

    /// Adds a storage device to the VM.
    pub fn add_storage_device(&mut self, device: StorageDeviceConfiguration) -> &mut Self {
        self.storage_devices.push(device.into_ptr());
        self
    }

    /// Adds a serial port to the VM.
    pub fn add_serial_port(&mut self, port: SerialPortConfiguration) -> &mut Self {
        self.serial_ports.push(port.into_ptr());
        self
    }

    /// Attaches a GDB debug stub through the private `_setDebugStub:`.
    pub fn set_debug_stub(&mut self, stub: &DebugStubConfiguration) -> VzResult<()> {
        if !responds_to(self.inner, objc2::sel!(_setDebugStub:)) {
            return Err(VzError::SelectorUnavailable("_setDebugStub:"));
        }
        unsafe {
            msg_send_void!(self.inner, _setDebugStub: stub.as_ptr());
        }
        tracing::info!(port = stub.port(), "GDB debug stub attached");
        Ok(())
    }

    /// Validates the configuration.
    ///
    /// This is called automatically by `build()`, but can be called
    /// manually to check for configuration errors early.
    pub fn validate(&self) -> VzResult<()> {
        unsafe {
            let mut error: *mut AnyObject = ptr::null_mut();
            let valid = msg_send_bool!(self.inner, validateWithError: &mut error);
            if valid.as_bool() {
                Ok(())
            } else {
                Err(extract_nserror(error))
            }
        }
    }

    /// Builds the virtual machine from this configuration.
    ///
    /// The machine gets its own serial queue and keeps `delegate` alive for
    /// as long as it exists.
    pub fn build(mut self, delegate: DelegateObject) -> VzResult<VirtualMachine> {
        self.apply_devices();
        self.validate()?;

        let queue = DispatchQueue::new(QUEUE_LABEL);

        let vm_ptr = unsafe {
            let cls = require_class("VZVirtualMachine")?;
            let alloc = msg_send!(cls, alloc);
            let obj = msg_send!(alloc, initWithConfiguration: self.inner, queue: queue.as_ptr());

            if obj.is_null() {
                return Err(VzError::Creation("VZVirtualMachine"));
            }
            msg_send_void!(obj, setDelegate: delegate.as_ptr());
            obj
        };

        Ok(VirtualMachine::from_raw(vm_ptr, queue, delegate))
    }

    /// Applies all device configurations to the VZ configuration.
    fn apply_devices(&mut self) {
        unsafe {
            if !self.storage_devices.is_empty() {
                let array = nsarray(&self.storage_devices);
                msg_send_void!(self.inner, setStorageDevices: array);
            }

            if !self.serial_ports.is_empty() {
                let array = nsarray(&self.serial_ports);
                msg_send_void!(self.inner, setSerialPorts: array);
            }
        }
    }
}

impl Drop for VirtualMachineConfiguration {
    fn drop(&mut self) {
        for device in self.storage_devices.drain(..).chain(self.serial_ports.drain(..)) {
            release(device);
        }
        if !self.inner.is_null() {
            release(self.inner);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_and_memory() {
        if !crate::is_supported() {
            println!("Virtualization not supported, skipping");
            return;
        }
        let mut config = VirtualMachineConfiguration::new().unwrap();
        config.set_cpu_count(2).set_memory_size(4 * 1024 * 1024 * 1024);
        assert_eq!(config.cpu_count(), 2);
        assert_eq!(config.memory_size(), 4 * 1024 * 1024 * 1024);
    }

    #[test]
    fn test_empty_configuration_fails_validation() {
        if !crate::is_supported() {
            println!("Virtualization not supported, skipping");
            return;
        }
        let config = VirtualMachineConfiguration::new().unwrap();
        assert!(config.validate().is_err());
    }
}
