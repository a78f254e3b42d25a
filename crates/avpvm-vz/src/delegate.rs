//! `VZVirtualMachineDelegate` implementation.
//!
//! The framework reports guest-initiated stops and runtime errors through the
//! virtual machine's delegate. The delegate class is created dynamically; each
//! instance carries a handle into a registry of [`RuntimeDelegate`]s.

use avpvm_core::{RuntimeDelegate, RuntimeError};
use objc2::ffi::{objc_allocateClassPair, objc_getClass, objc_registerClassPair};
use objc2::runtime::{AnyClass, AnyObject, Bool, Sel};
use std::collections::HashMap;
use std::ffi::{c_char, c_void};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock, PoisonError};

use crate::error::{VzError, VzResult};
use crate::ffi::{extract_nserror, release};

// ============================================================================
// FFI Declarations
// ============================================================================

unsafe extern "C" {
    fn class_addMethod(
        cls: *const AnyClass,
        sel: Sel,
        imp: *const c_void,
        types: *const c_char,
    ) -> Bool;
    fn class_addIvar(
        cls: *const AnyClass,
        name: *const c_char,
        size: usize,
        alignment: u8,
        types: *const c_char,
    ) -> Bool;
    fn object_getInstanceVariable(
        obj: *mut AnyObject,
        name: *const c_char,
        outValue: *mut *mut c_void,
    ) -> *mut c_void;
    fn object_setInstanceVariable(
        obj: *mut AnyObject,
        name: *const c_char,
        value: *mut c_void,
    ) -> *mut c_void;
}

// ============================================================================
// Delegate Registry
// ============================================================================

/// Handle stored in each delegate instance.
pub type DelegateHandle = u64;

static DELEGATE_REGISTRY: OnceLock<Mutex<HashMap<DelegateHandle, RuntimeDelegate>>> =
    OnceLock::new();

static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

fn registry() -> std::sync::MutexGuard<'static, HashMap<DelegateHandle, RuntimeDelegate>> {
    DELEGATE_REGISTRY
        .get_or_init(|| Mutex::new(HashMap::new()))
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
}

/// Registers a runtime delegate and returns its handle.
pub fn register(delegate: RuntimeDelegate) -> DelegateHandle {
    let handle = NEXT_HANDLE.fetch_add(1, Ordering::Relaxed);
    registry().insert(handle, delegate);
    handle
}

/// Unregisters a runtime delegate.
pub fn unregister(handle: DelegateHandle) {
    registry().remove(&handle);
}

fn lookup(handle: DelegateHandle) -> Option<RuntimeDelegate> {
    let delegate = registry().get(&handle).cloned();
    if delegate.is_none() {
        tracing::warn!("Delegate handle {} not found in registry", handle);
    }
    delegate
}

// ============================================================================
// VZVirtualMachineDelegate Class
// ============================================================================

/// Wrapper for class pointer that implements Send + Sync.
struct ClassPtr(*const AnyClass);

// Safety: The class is registered once and never modified.
unsafe impl Send for ClassPtr {}
unsafe impl Sync for ClassPtr {}

static DELEGATE_CLASS: OnceLock<Option<ClassPtr>> = OnceLock::new();

const CLASS_NAME: &std::ffi::CStr = c"AvpvmVirtualMachineDelegate";

/// Name of the ivar storing the handle.
const HANDLE_IVAR: &std::ffi::CStr = c"_avpvmHandle";

fn delegate_class() -> VzResult<*const AnyClass> {
    DELEGATE_CLASS
        .get_or_init(|| unsafe { create_delegate_class() }.map(ClassPtr))
        .as_ref()
        .map(|c| c.0)
        .ok_or(VzError::Creation("AvpvmVirtualMachineDelegate class"))
}

unsafe fn create_delegate_class() -> Option<*const AnyClass> {
    unsafe {
        let superclass = objc_getClass(c"NSObject".as_ptr()) as *const AnyClass;
        let new_class = objc_allocateClassPair(superclass, CLASS_NAME.as_ptr(), 0);

        if new_class.is_null() {
            // Class might already exist (from another copy of this crate)
            let existing = objc_getClass(CLASS_NAME.as_ptr()) as *const AnyClass;
            if existing.is_null() {
                tracing::error!("Failed to create delegate class");
                return None;
            }
            tracing::debug!("Delegate class already exists, reusing");
            return Some(existing);
        }

        // Q = unsigned long long
        let added = class_addIvar(
            new_class,
            HANDLE_IVAR.as_ptr(),
            std::mem::size_of::<DelegateHandle>(),
            std::mem::align_of::<DelegateHandle>() as u8,
            c"Q".as_ptr(),
        );
        if !added.as_bool() {
            tracing::error!("Failed to add handle ivar to delegate class");
            return None;
        }

        // - (void)guestDidStopVirtualMachine:(VZVirtualMachine *)vm
        let added = class_addMethod(
            new_class,
            objc2::sel!(guestDidStopVirtualMachine:),
            guest_did_stop as *const c_void,
            c"v@:@".as_ptr(),
        );
        if !added.as_bool() {
            tracing::error!("Failed to add guestDidStopVirtualMachine:");
            return None;
        }

        // - (void)virtualMachine:(VZVirtualMachine *)vm didStopWithError:(NSError *)error
        let added = class_addMethod(
            new_class,
            objc2::sel!(virtualMachine:didStopWithError:),
            did_stop_with_error as *const c_void,
            c"v@:@@".as_ptr(),
        );
        if !added.as_bool() {
            tracing::error!("Failed to add virtualMachine:didStopWithError:");
            return None;
        }

        objc_registerClassPair(new_class);
        tracing::debug!("Created delegate class: AvpvmVirtualMachineDelegate");

        Some(new_class as *const AnyClass)
    }
}

unsafe fn handle_of(this: *mut AnyObject) -> DelegateHandle {
    let mut value: *mut c_void = std::ptr::null_mut();
    unsafe {
        object_getInstanceVariable(this, HANDLE_IVAR.as_ptr(), &mut value);
    }
    value as DelegateHandle
}

unsafe extern "C" fn guest_did_stop(this: *mut AnyObject, _cmd: Sel, _vm: *mut AnyObject) {
    let handle = unsafe { handle_of(this) };
    tracing::debug!(handle, "guestDidStopVirtualMachine");
    if let Some(delegate) = lookup(handle) {
        delegate.guest_did_stop();
    }
}

unsafe extern "C" fn did_stop_with_error(
    this: *mut AnyObject,
    _cmd: Sel,
    _vm: *mut AnyObject,
    error: *mut AnyObject,
) {
    let handle = unsafe { handle_of(this) };
    let error = RuntimeError::from(extract_nserror(error));
    tracing::debug!(handle, %error, "virtualMachine:didStopWithError:");
    if let Some(delegate) = lookup(handle) {
        delegate.did_stop_with_error(error);
    }
}

// ============================================================================
// Delegate Instance
// ============================================================================

/// An Objective-C delegate object bound to one registered [`RuntimeDelegate`].
///
/// The framework holds its delegate weakly, so this must outlive the virtual
/// machine it is attached to.
pub struct DelegateObject {
    inner: *mut AnyObject,
    handle: DelegateHandle,
}

unsafe impl Send for DelegateObject {}
unsafe impl Sync for DelegateObject {}

impl DelegateObject {
    /// Registers `delegate` and creates the Objective-C object forwarding to it.
    pub fn new(delegate: RuntimeDelegate) -> VzResult<Self> {
        let cls = delegate_class()?;
        unsafe {
            let alloc_fn: unsafe extern "C" fn(*const AnyClass, Sel) -> *mut AnyObject =
                std::mem::transmute(crate::ffi::runtime::objc_msgSend as *const c_void);
            let instance = alloc_fn(cls, objc2::sel!(alloc));

            let init_fn: unsafe extern "C" fn(*mut AnyObject, Sel) -> *mut AnyObject =
                std::mem::transmute(crate::ffi::runtime::objc_msgSend as *const c_void);
            let instance = init_fn(instance, objc2::sel!(init));

            if instance.is_null() {
                return Err(VzError::Creation("virtual machine delegate"));
            }

            let handle = register(delegate);
            object_setInstanceVariable(instance, HANDLE_IVAR.as_ptr(), handle as *mut c_void);
            tracing::debug!("Created delegate instance {:?} with handle {}", instance, handle);

            Ok(Self {
                inner: instance,
                handle,
            })
        }
    }

    /// Returns the underlying Objective-C object pointer.
    pub fn as_ptr(&self) -> *mut AnyObject {
        self.inner
    }
}

impl Drop for DelegateObject {
    fn drop(&mut self) {
        unregister(self.handle);
        release(self.inner);
    }
}
