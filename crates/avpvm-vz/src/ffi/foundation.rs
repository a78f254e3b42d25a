//! Foundation framework helpers (NSString, NSURL, NSArray, etc.)

use objc2::runtime::AnyObject;
use std::ffi::c_void;
use std::path::{Path, PathBuf};
use std::ptr;

use super::runtime::get_class;
use crate::msg_send;

// ============================================================================
// NSString
// ============================================================================

/// Creates an NSString from a Rust string. Null if Foundation is unavailable.
pub fn nsstring(s: &str) -> *mut AnyObject {
    let Some(cls) = get_class("NSString") else {
        return ptr::null_mut();
    };
    unsafe {
        let alloc = msg_send!(cls, alloc);

        let sel = objc2::sel!(initWithBytes:length:encoding:);
        let func: unsafe extern "C" fn(*mut AnyObject, objc2::runtime::Sel, *const u8, usize, u64) -> *mut AnyObject =
            std::mem::transmute(super::runtime::objc_msgSend as *const c_void);
        func(alloc, sel, s.as_ptr(), s.len(), 4) // 4 = NSUTF8StringEncoding
    }
}

/// Gets NSString contents as a Rust String.
pub fn nsstring_to_string(obj: *mut AnyObject) -> String {
    if obj.is_null() {
        return String::new();
    }
    unsafe {
        let sel_utf8 = objc2::sel!(UTF8String);
        let func: unsafe extern "C" fn(*const AnyObject, objc2::runtime::Sel) -> *const i8 =
            std::mem::transmute(super::runtime::objc_msgSend as *const c_void);
        let cstr = func(obj as *const AnyObject, sel_utf8);
        if cstr.is_null() {
            String::new()
        } else {
            std::ffi::CStr::from_ptr(cstr)
                .to_string_lossy()
                .into_owned()
        }
    }
}

// ============================================================================
// NSURL
// ============================================================================

/// Creates a retained file NSURL for `path`.
///
/// Relative paths are resolved against the current directory.
pub fn nsurl_file_path(path: &Path) -> *mut AnyObject {
    let abs_path = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };

    let Some(cls) = get_class("NSURL") else {
        return ptr::null_mut();
    };
    unsafe {
        let path_str = nsstring(&abs_path.to_string_lossy());
        let url: *mut AnyObject = msg_send!(cls, fileURLWithPath: path_str);
        release(path_str);
        // Retain to prevent autorelease
        retain(url)
    }
}

/// Returns the filesystem path of a file NSURL.
pub fn nsurl_to_path(url: *mut AnyObject) -> Option<PathBuf> {
    if url.is_null() {
        return None;
    }
    let path = unsafe { nsstring_to_string(msg_send!(url, path)) };
    (!path.is_empty()).then(|| PathBuf::from(path))
}

// ============================================================================
// NSArray
// ============================================================================

/// Creates an NSArray from raw pointers.
pub fn nsarray(objects: &[*mut AnyObject]) -> *mut AnyObject {
    let Some(cls) = get_class("NSArray") else {
        return ptr::null_mut();
    };
    unsafe {
        let sel = objc2::sel!(arrayWithObjects:count:);
        let func: unsafe extern "C" fn(
            *const objc2::runtime::AnyClass,
            objc2::runtime::Sel,
            *const *mut AnyObject,
            usize,
        ) -> *mut AnyObject = std::mem::transmute(super::runtime::objc_msgSend as *const c_void);
        func(cls, sel, objects.as_ptr(), objects.len())
    }
}

// ============================================================================
// NSFileHandle
// ============================================================================

/// Creates a file handle for a file descriptor.
///
/// Uses `initWithFileDescriptor:closeOnDealloc:NO` to prevent NSFileHandle
/// from closing the fd when deallocated.
pub fn file_handle_for_fd(fd: i32) -> *mut AnyObject {
    let Some(cls) = get_class("NSFileHandle") else {
        return ptr::null_mut();
    };
    unsafe {
        let obj = msg_send!(cls, alloc);

        let sel = objc2::sel!(initWithFileDescriptor:closeOnDealloc:);
        let func: unsafe extern "C" fn(*mut AnyObject, objc2::runtime::Sel, i32, bool) -> *mut AnyObject =
            std::mem::transmute(super::runtime::objc_msgSend as *const c_void);
        func(obj, sel, fd, false)
    }
}

// ============================================================================
// Memory Management
// ============================================================================

/// Retains an Objective-C object.
pub fn retain(obj: *mut AnyObject) -> *mut AnyObject {
    if obj.is_null() {
        return obj;
    }
    unsafe { msg_send!(obj, retain) }
}

/// Releases an Objective-C object.
pub fn release(obj: *mut AnyObject) {
    if !obj.is_null() {
        unsafe {
            let _: *mut AnyObject = msg_send!(obj, release);
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
    fn test_nsstring_roundtrip() {
        let original = "AVPBooter.vresearch1.bin";
        let ns = nsstring(original);
        assert!(!ns.is_null());
        assert_eq!(nsstring_to_string(ns), original);
        release(ns);
    }

    #[test]
    fn test_nsurl_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("aux.img");
        let url = nsurl_file_path(&path);
        assert!(!url.is_null());

        let back = nsurl_to_path(url).unwrap();
        assert_eq!(back.file_name(), path.file_name());
        release(url);
    }

    #[test]
    fn test_null_url_has_no_path() {
        assert!(nsurl_to_path(ptr::null_mut()).is_none());
    }
}
