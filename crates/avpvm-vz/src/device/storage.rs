//! Storage device configuration.

use objc2::runtime::{AnyObject, Bool, Sel};
use std::ffi::c_void;
use std::path::Path;
use std::ptr;

use crate::error::{VzError, VzResult};
use crate::ffi::{extract_nserror, nsurl_file_path, release, require_class};
use crate::msg_send;

/// Configuration for a VirtIO block storage device.
pub struct StorageDeviceConfiguration {
    inner: *mut AnyObject,
}

unsafe impl Send for StorageDeviceConfiguration {}

impl StorageDeviceConfiguration {
    /// Creates a read-write storage device from a disk image file.
    pub fn disk_image(path: impl AsRef<Path>) -> VzResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(VzError::NotFound(path.display().to_string()));
        }

        let attachment = create_disk_attachment(path)?;
        let result = Self::with_attachment(attachment);
        release(attachment);
        result
    }

    fn with_attachment(attachment: *mut AnyObject) -> VzResult<Self> {
        unsafe {
            let cls = require_class("VZVirtioBlockDeviceConfiguration")?;
            let alloc = msg_send!(cls, alloc);
            let obj = msg_send!(alloc, initWithAttachment: attachment);

            if obj.is_null() {
                return Err(VzError::Creation("VZVirtioBlockDeviceConfiguration"));
            }

            Ok(Self { inner: obj })
        }
    }

    /// Consumes the configuration and returns the raw pointer.
    pub fn into_ptr(self) -> *mut AnyObject {
        let ptr = self.inner;
        std::mem::forget(self);
        ptr
    }
}

impl Drop for StorageDeviceConfiguration {
    fn drop(&mut self) {
        if !self.inner.is_null() {
            release(self.inner);
        }
    }
}

fn create_disk_attachment(path: &Path) -> VzResult<*mut AnyObject> {
    unsafe {
        let cls = require_class("VZDiskImageStorageDeviceAttachment")?;

        let url = nsurl_file_path(path);
        let mut error: *mut AnyObject = ptr::null_mut();

        let alloc = msg_send!(cls, alloc);
        let func: unsafe extern "C" fn(
            *mut AnyObject,
            Sel,
            *mut AnyObject,
            Bool,
            *mut *mut AnyObject,
        ) -> *mut AnyObject =
            std::mem::transmute(crate::ffi::runtime::objc_msgSend as *const c_void);

        let obj = func(alloc, objc2::sel!(initWithURL:readOnly:error:), url, Bool::NO, &mut error);
        release(url);

        if obj.is_null() {
            return Err(extract_nserror(error));
        }

        Ok(obj)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_image_rejected() {
        let err = StorageDeviceConfiguration::disk_image("/nonexistent/disk.img")
            .err()
            .unwrap();
        assert!(matches!(err, VzError::NotFound(_)));
    }
}
