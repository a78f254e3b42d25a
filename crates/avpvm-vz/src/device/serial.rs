//! Serial port configuration.
//!
//! iBoot writes to the PL011 debug UART, which the framework only exposes
//! through the private `_VZPL011SerialPortConfiguration`.

use avpvm_core::{SerialAttachment, SerialPortConfig, UartKind};
use objc2::runtime::{AnyObject, Bool, Sel};
use std::ffi::c_void;
use std::path::Path;
use std::ptr;

use crate::error::{VzError, VzResult};
use crate::ffi::{extract_nserror, file_handle_for_fd, nsurl_file_path, release, require_class};
use crate::{msg_send, msg_send_void};

/// Configuration for a serial port.
pub struct SerialPortConfiguration {
    inner: *mut AnyObject,
}

unsafe impl Send for SerialPortConfiguration {}

impl SerialPortConfiguration {
    /// Creates the serial port described by `config`.
    pub fn new(config: &SerialPortConfig) -> VzResult<Self> {
        let class_name = match config.kind {
            UartKind::Pl011 => "_VZPL011SerialPortConfiguration",
        };

        let attachment = match &config.attachment {
            SerialAttachment::Stdio => stdio_attachment()?,
            SerialAttachment::File(path) => file_attachment(path)?,
        };

        unsafe {
            let cls = match require_class(class_name) {
                Ok(cls) => cls,
                Err(e) => {
                    release(attachment);
                    return Err(e);
                }
            };
            let port = msg_send!(cls, new);
            if port.is_null() {
                release(attachment);
                return Err(VzError::Creation("serial port configuration"));
            }

            msg_send_void!(port, setAttachment: attachment);
            release(attachment);

            tracing::debug!(kind = ?config.kind, attachment = ?config.attachment, "created serial port");
            Ok(Self { inner: port })
        }
    }

    /// Consumes the configuration and returns the raw pointer.
    pub fn into_ptr(self) -> *mut AnyObject {
        let ptr = self.inner;
        std::mem::forget(self);
        ptr
    }
}

impl Drop for SerialPortConfiguration {
    fn drop(&mut self) {
        if !self.inner.is_null() {
            release(self.inner);
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Attachment reading from stdin and writing to stdout.
fn stdio_attachment() -> VzResult<*mut AnyObject> {
    let read_handle = file_handle_for_fd(libc::STDIN_FILENO);
    let write_handle = file_handle_for_fd(libc::STDOUT_FILENO);
    if read_handle.is_null() || write_handle.is_null() {
        release(read_handle);
        release(write_handle);
        return Err(VzError::Creation("stdio file handles"));
    }

    unsafe {
        let cls = require_class("VZFileHandleSerialPortAttachment");
        let attachment = cls.map(|cls| {
            let obj = msg_send!(cls, alloc);
            msg_send!(obj, initWithFileHandleForReading: read_handle, fileHandleForWriting: write_handle)
        });
        release(read_handle);
        release(write_handle);

        match attachment? {
            a if a.is_null() => Err(VzError::Creation("serial port attachment")),
            a => Ok(a),
        }
    }
}

/// Attachment appending guest output to a file.
fn file_attachment(path: &Path) -> VzResult<*mut AnyObject> {
    unsafe {
        let cls = require_class("VZFileSerialPortAttachment")?;
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
        let obj = func(alloc, objc2::sel!(initWithURL:append:error:), url, Bool::YES, &mut error);
        release(url);

        if obj.is_null() {
            return Err(extract_nserror(error));
        }
        Ok(obj)
    }
}
