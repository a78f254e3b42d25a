//! Virtual machine runtime.

use avpvm_core::{BootMode, StartOptions};
use objc2::runtime::{AnyObject, Bool};
use std::ffi::c_void;
use std::sync::Arc;

use crate::delegate::DelegateObject;
use crate::error::{VzError, VzResult};
use crate::ffi::{_Block_release, DispatchQueue, create_completion_block, release, require_class, responds_to};
use crate::{msg_send, msg_send_bool, msg_send_i64};

// ============================================================================
// VM State
// ============================================================================

/// The execution state reported by the framework.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i64)]
pub enum VirtualMachineState {
    /// The VM is stopped.
    Stopped = 0,
    /// The VM is running.
    Running = 1,
    /// The VM is paused.
    Paused = 2,
    /// The VM is in an error state.
    Error = 3,
    /// The VM is starting.
    Starting = 4,
    /// The VM is pausing.
    Pausing = 5,
    /// The VM is resuming.
    Resuming = 6,
    /// The VM is stopping.
    Stopping = 7,
}

impl From<i64> for VirtualMachineState {
    fn from(value: i64) -> Self {
        match value {
            0 => Self::Stopped,
            1 => Self::Running,
            2 => Self::Paused,
            4 => Self::Starting,
            5 => Self::Pausing,
            6 => Self::Resuming,
            7 => Self::Stopping,
            _ => Self::Error,
        }
    }
}

// ============================================================================
// Virtual Machine
// ============================================================================

/// A virtual machine created from a `VirtualMachineConfiguration`.
///
/// Every framework call is issued on the machine's own queue. Start and stop
/// return immediately and report through their handlers, which also run on
/// that queue.
pub struct VirtualMachine {
    inner: *mut AnyObject,
    queue: DispatchQueue,
    // The framework only holds its delegate weakly.
    _delegate: DelegateObject,
}

// Safety: the object is only messaged from its dispatch queue.
unsafe impl Send for VirtualMachine {}
unsafe impl Sync for VirtualMachine {}

impl VirtualMachine {
    pub(crate) fn from_raw(ptr: *mut AnyObject, queue: DispatchQueue, delegate: DelegateObject) -> Self {
        Self {
            inner: ptr,
            queue,
            _delegate: delegate,
        }
    }

    /// Starts the machine with `options`.
    ///
    /// Uses the private `_startWithOptions:completionHandler:` when available
    /// and falls back to `startWithCompletionHandler:` otherwise, in which
    /// case the options are ignored.
    pub fn start<F>(self: &Arc<Self>, options: StartOptions, handler: F)
    where
        F: FnOnce(VzResult<()>) + Send + 'static,
    {
        let vm = Arc::clone(self);
        self.queue.async_exec(move || {
            let block = create_completion_block({
                let vm = Arc::clone(&vm);
                move |result| {
                    tracing::debug!(state = ?vm.state(), ok = result.is_ok(), "start completed");
                    handler(result);
                }
            });

            unsafe {
                let start_options = build_start_options(options);
                let send: unsafe extern "C" fn(*mut AnyObject, objc2::runtime::Sel, *mut AnyObject, *const c_void) =
                    std::mem::transmute(crate::ffi::runtime::objc_msgSend as *const c_void);
                let plain: unsafe extern "C" fn(*mut AnyObject, objc2::runtime::Sel, *const c_void) =
                    std::mem::transmute(crate::ffi::runtime::objc_msgSend as *const c_void);

                let with_options = objc2::sel!(_startWithOptions:completionHandler:);
                if !start_options.is_null() && responds_to(vm.inner, with_options) {
                    tracing::debug!(?options, "starting with options");
                    send(vm.inner, with_options, start_options, block);
                } else {
                    tracing::warn!("private start options unavailable, starting with defaults");
                    plain(vm.inner, objc2::sel!(startWithCompletionHandler:), block);
                }
                release(start_options);
                _Block_release(block);
            }
        });
    }

    /// Stops the machine without giving the guest a chance to shut down.
    ///
    /// `handler` runs once the framework has stopped the machine, or with an
    /// error if it could not. A machine that cannot be stopped in its current
    /// state fails the handler with [`VzError::InvalidState`].
    pub fn stop<F>(self: &Arc<Self>, handler: F)
    where
        F: FnOnce(VzResult<()>) + Send + 'static,
    {
        let vm = Arc::clone(self);
        self.queue.async_exec(move || unsafe {
            let can_stop = msg_send_bool!(vm.inner, canStop).as_bool();
            if let Err(err) = check_can_stop(can_stop, vm.state()) {
                tracing::warn!(%err, "virtual machine cannot be stopped");
                handler(Err(err));
                return;
            }

            let block = create_completion_block(handler);
            let func: unsafe extern "C" fn(*mut AnyObject, objc2::runtime::Sel, *const c_void) =
                std::mem::transmute(crate::ffi::runtime::objc_msgSend as *const c_void);
            func(vm.inner, objc2::sel!(stopWithCompletionHandler:), block);
            _Block_release(block);
        });
    }

    /// Returns the current state of the VM.
    ///
    /// Only meaningful on the machine's queue.
    fn state(&self) -> VirtualMachineState {
        unsafe { VirtualMachineState::from(msg_send_i64!(self.inner, state)) }
    }
}

/// Fails unless the framework reports the machine as stoppable.
fn check_can_stop(can_stop: bool, state: VirtualMachineState) -> VzResult<()> {
    if can_stop {
        Ok(())
    } else {
        Err(VzError::InvalidState(format!("cannot stop while {state:?}")))
    }
}

impl Drop for VirtualMachine {
    fn drop(&mut self) {
        if !self.inner.is_null() {
            release(self.inner);
        }
    }
}

/// Builds a retained `_VZVirtualMachineStartOptions`, or null if the class is
/// missing.
fn build_start_options(options: StartOptions) -> *mut AnyObject {
    let Ok(cls) = require_class("_VZVirtualMachineStartOptions") else {
        return std::ptr::null_mut();
    };

    unsafe {
        let obj = msg_send!(cls, new);
        if obj.is_null() {
            return obj;
        }

        let set = |sel: objc2::runtime::Sel, value: bool| {
            if responds_to(obj, sel) {
                let func: unsafe extern "C" fn(*mut AnyObject, objc2::runtime::Sel, Bool) =
                    std::mem::transmute(crate::ffi::runtime::objc_msgSend as *const c_void);
                func(obj, sel, Bool::new(value));
            } else {
                tracing::debug!(selector = %sel.name().to_string_lossy(), "start option unavailable");
            }
        };

        set(objc2::sel!(setForceDFU:), options.boot_mode == BootMode::Dfu);
        set(objc2::sel!(setBootMacOSRecovery:), options.boot_mode == BootMode::Recovery);
        set(objc2::sel!(setStopInIBootStage1:), options.stop_in_iboot_stage1);
        set(objc2::sel!(setStopInIBootStage2:), options.stop_in_iboot_stage2);
        set(objc2::sel!(setPanicAction:), options.panic_action);
        set(objc2::sel!(setRestartAction:), options.restart_action);

        obj
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_from_raw() {
        assert_eq!(VirtualMachineState::from(1), VirtualMachineState::Running);
        assert_eq!(VirtualMachineState::from(7), VirtualMachineState::Stopping);
        assert_eq!(VirtualMachineState::from(42), VirtualMachineState::Error);
    }

    #[test]
    fn test_stop_refused_reports_state() {
        assert!(check_can_stop(true, VirtualMachineState::Running).is_ok());

        let err = check_can_stop(false, VirtualMachineState::Stopped).unwrap_err();
        assert!(matches!(err, VzError::InvalidState(_)));
        assert!(err.to_string().contains("Stopped"));

        let runtime: avpvm_core::RuntimeError = err.into();
        assert_eq!(runtime.code, -1);
    }

    #[test]
    fn test_start_options_object() {
        if !crate::is_supported() {
            println!("Virtualization not supported, skipping");
            return;
        }
        let options = StartOptions {
            boot_mode: BootMode::Dfu,
            stop_in_iboot_stage1: false,
            stop_in_iboot_stage2: false,
            panic_action: true,
            restart_action: false,
        };
        let obj = build_start_options(options);
        if obj.is_null() {
            println!("_VZVirtualMachineStartOptions unavailable, skipping");
            return;
        }
        unsafe {
            assert!(msg_send_bool!(obj, forceDFU).as_bool());
            assert!(!msg_send_bool!(obj, bootMacOSRecovery).as_bool());
        }
        release(obj);
    }
}
