//! [`VmRuntime`] implementation backed by Virtualization.framework.

use avpvm_core::{
    BootDescriptor, ConfigurationRecord, RuntimeDelegate, RuntimeError, RuntimeHandle,
    RuntimeSubmission, VmRuntime,
};
use std::sync::Arc;

use crate::configuration::{MacOsBootLoader, MacPlatform, VirtualMachineConfiguration};
use crate::delegate::DelegateObject;
use crate::device::{DebugStubConfiguration, SerialPortConfiguration, StorageDeviceConfiguration};
use crate::error::{VzError, VzResult};
use crate::vm::VirtualMachine;

/// Runs each submission as a `VZVirtualMachine` on its own dispatch queue.
#[derive(Debug, Default, Clone, Copy)]
pub struct VzRuntime;

impl VzRuntime {
    /// Creates the runtime.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl VmRuntime for VzRuntime {
    fn submit(
        &self,
        submission: RuntimeSubmission,
        delegate: RuntimeDelegate,
    ) -> Result<Box<dyn RuntimeHandle>, RuntimeError> {
        let session = delegate.session();
        let vm = build_machine(&submission, delegate.clone()).map_err(|e| {
            tracing::error!(session, error = %e, "failed to build virtual machine");
            RuntimeError::from(e)
        })?;
        let vm = Arc::new(vm);

        vm.start(submission.start_options, {
            let delegate = delegate.clone();
            move |result| delegate.complete_start(result.map_err(RuntimeError::from))
        });

        Ok(Box::new(VzHandle { vm, delegate }))
    }
}

/// Handle on a machine built by [`VzRuntime`].
struct VzHandle {
    vm: Arc<VirtualMachine>,
    delegate: RuntimeDelegate,
}

impl RuntimeHandle for VzHandle {
    fn request_stop(&self) {
        let delegate = self.delegate.clone();
        // A forced stop does not go through guestDidStopVirtualMachine:.
        self.vm.stop(move |result| match result {
            Ok(()) => delegate.guest_did_stop(),
            Err(e) => delegate.did_stop_with_error(e.into()),
        });
    }
}

// ============================================================================
// Assembly
// ============================================================================

fn build_machine(submission: &RuntimeSubmission, delegate: RuntimeDelegate) -> VzResult<VirtualMachine> {
    let record = &submission.record;

    let mut platform = MacPlatform::new(record)?;
    apply_production_mode(&mut platform, submission.production_mode)?;

    let boot_loader = boot_loader(&submission.boot)?;

    let mut config = VirtualMachineConfiguration::new()?;
    config
        .set_cpu_count(record.cpu_count())
        .set_memory_size(record.memory_size())
        .set_platform(&platform)
        .set_boot_loader(&boot_loader);

    attach_devices(&mut config, record, &submission.boot)?;

    config.build(DelegateObject::new(delegate)?)
}

/// Applies the production fuse after the platform has been constructed.
fn apply_production_mode(platform: &mut MacPlatform, enabled: bool) -> VzResult<()> {
    match platform.set_production_mode(enabled) {
        // Production mode is the runtime default, nothing to override.
        Err(VzError::SelectorUnavailable(sel)) if enabled => {
            tracing::debug!(selector = sel, "production mode left at runtime default");
            Ok(())
        }
        other => other,
    }
}

fn boot_loader(boot: &BootDescriptor) -> VzResult<MacOsBootLoader> {
    let mut loader = MacOsBootLoader::new()?;
    if let Some(rom) = &boot.rom {
        loader.set_rom(rom)?;
    }
    Ok(loader)
}

fn attach_devices(
    config: &mut VirtualMachineConfiguration,
    record: &ConfigurationRecord,
    boot: &BootDescriptor,
) -> VzResult<()> {
    if let Some(storage) = record.storage_path() {
        config.add_storage_device(StorageDeviceConfiguration::disk_image(storage)?);
    }

    config.add_serial_port(SerialPortConfiguration::new(&boot.serial)?);

    if let Some(debug) = boot.debug_stub {
        let stub = DebugStubConfiguration::new(debug.port)?;
        config.set_debug_stub(&stub)?;
    }
    Ok(())
}
