//! Low-level FFI bindings to Virtualization.framework.
//!
//! This module provides the raw Objective-C bindings used by the higher-level
//! configuration and runtime types. Most users should not need it directly.

pub mod block;
pub mod dispatch;
pub mod foundation;
pub mod runtime;

pub use block::*;
pub use dispatch::*;
pub use foundation::*;
pub use runtime::*;

use crate::error::VzError;
use objc2::runtime::{AnyObject, Sel};
use std::sync::Once;

// ============================================================================
// Framework Loading
// ============================================================================

static FRAMEWORK_INIT: Once = Once::new();

/// Ensures Virtualization.framework is loaded.
fn ensure_framework_loaded() {
    FRAMEWORK_INIT.call_once(|| unsafe {
        let path = c"/System/Library/Frameworks/Virtualization.framework/Virtualization";
        let handle = libc::dlopen(path.as_ptr(), libc::RTLD_NOW | libc::RTLD_GLOBAL);
        if handle.is_null() {
            let err = libc::dlerror();
            if !err.is_null() {
                let err_str = std::ffi::CStr::from_ptr(err).to_string_lossy();
                tracing::error!("Failed to load Virtualization.framework: {}", err_str);
            }
        } else {
            tracing::debug!("Virtualization.framework loaded successfully");
        }
    });
}

// ============================================================================
// System Queries
// ============================================================================

/// Checks if virtualization is supported on this system.
pub fn is_supported() -> bool {
    ensure_framework_loaded();
    unsafe {
        let Some(cls) = get_class("VZVirtualMachine") else {
            return false;
        };
        msg_send_bool!(cls, isSupported).as_bool()
    }
}

/// Returns whether `obj` implements the instance method `sel`.
///
/// Private selectors come and go between macOS releases, so every private
/// setter is probed before it is sent.
pub fn responds_to(obj: *mut AnyObject, sel: Sel) -> bool {
    if obj.is_null() {
        return false;
    }
    unsafe { (*obj).class().responds_to(sel) }
}

// ============================================================================
// Error Handling
// ============================================================================

/// Extracts error information from an NSError object.
pub fn extract_nserror(error: *mut AnyObject) -> VzError {
    if error.is_null() {
        return VzError::Internal {
            code: -1,
            message: "Unknown error".to_string(),
        };
    }
    unsafe {
        let desc = msg_send!(error, localizedDescription);
        let code: i64 = msg_send_i64!(error, code);
        VzError::Internal {
            code,
            message: nsstring_to_string(desc),
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
    fn test_is_supported() {
        let supported = is_supported();
        println!("Virtualization supported: {supported}");
    }

    #[test]
    fn test_null_error_is_unknown() {
        match extract_nserror(std::ptr::null_mut()) {
            VzError::Internal { code, message } => {
                assert_eq!(code, -1);
                assert_eq!(message, "Unknown error");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_responds_to_null() {
        assert!(!responds_to(std::ptr::null_mut(), objc2::sel!(description)));
    }
}
