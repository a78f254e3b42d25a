//! GDB debug stub configuration.

use objc2::runtime::AnyObject;

use crate::error::{VzError, VzResult};
use crate::ffi::{release, require_class};
use crate::{msg_send, msg_send_i64, msg_send_void_i64};

/// A `_VZGDBDebugStubConfiguration` listening on a TCP port.
pub struct DebugStubConfiguration {
    inner: *mut AnyObject,
}

unsafe impl Send for DebugStubConfiguration {}

impl DebugStubConfiguration {
    /// Creates a debug stub listening on `port`.
    pub fn new(port: u16) -> VzResult<Self> {
        unsafe {
            let cls = require_class("_VZGDBDebugStubConfiguration")?;
            let obj = msg_send!(cls, new);
            if obj.is_null() {
                return Err(VzError::Creation("_VZGDBDebugStubConfiguration"));
            }
            msg_send_void_i64!(obj, setPort: i64::from(port));
            Ok(Self { inner: obj })
        }
    }

    /// Port the stub listens on.
    pub fn port(&self) -> i64 {
        unsafe { msg_send_i64!(self.inner, port) }
    }

    /// Returns the underlying Objective-C object pointer.
    pub fn as_ptr(&self) -> *mut AnyObject {
        self.inner
    }
}

impl Drop for DebugStubConfiguration {
    fn drop(&mut self) {
        if !self.inner.is_null() {
            release(self.inner);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_round_trip() {
        if !crate::is_supported() {
            println!("Virtualization not supported, skipping");
            return;
        }
        match DebugStubConfiguration::new(1234) {
            Ok(stub) => assert_eq!(stub.port(), 1234),
            Err(VzError::ClassNotFound(name)) => println!("{name} unavailable, skipping"),
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
}
