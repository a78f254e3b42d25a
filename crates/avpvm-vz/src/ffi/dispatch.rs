//! Grand Central Dispatch (GCD) queue handling.
//!
//! VZVirtualMachine requires all operations to be performed on the queue it
//! was created with, and it delivers delegate callbacks on that queue too.

use objc2::runtime::AnyObject;
use std::ffi::{CString, c_void};

// ============================================================================
// Dispatch FFI
// ============================================================================

unsafe extern "C" {
    fn dispatch_queue_create(label: *const i8, attr: *const c_void) -> *mut AnyObject;
    fn dispatch_async_f(
        queue: *mut AnyObject,
        context: *mut c_void,
        work: unsafe extern "C" fn(*mut c_void),
    );
    fn dispatch_release(object: *mut AnyObject);
}

// ============================================================================
// Dispatch Queue
// ============================================================================

/// A serial GCD dispatch queue.
pub struct DispatchQueue {
    inner: *mut AnyObject,
}

unsafe impl Send for DispatchQueue {}
unsafe impl Sync for DispatchQueue {}

impl DispatchQueue {
    /// Creates a new serial dispatch queue with the given label.
    pub fn new(label: &str) -> Self {
        let label_cstr = CString::new(label).unwrap_or_default();
        let queue = unsafe {
            dispatch_queue_create(
                label_cstr.as_ptr(),
                std::ptr::null(), // DISPATCH_QUEUE_SERIAL
            )
        };
        Self { inner: queue }
    }

    /// Returns the raw queue pointer.
    pub fn as_ptr(&self) -> *mut AnyObject {
        self.inner
    }

    /// Executes a closure asynchronously on this queue.
    ///
    /// Returns immediately. Safe to call from the queue itself.
    pub fn async_exec<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.inner.is_null() {
            // No queue, execute directly
            f();
            return;
        }

        // Box the closure and leak it - it will be freed by the trampoline
        let context = Box::into_raw(Box::new(f));

        unsafe extern "C" fn trampoline<F>(context: *mut c_void)
        where
            F: FnOnce() + Send + 'static,
        {
            unsafe {
                let f = Box::from_raw(context as *mut F);
                f();
            }
        }

        unsafe {
            dispatch_async_f(self.inner, context as *mut c_void, trampoline::<F>);
        }
    }
}

impl Drop for DispatchQueue {
    fn drop(&mut self) {
        if !self.inner.is_null() {
            unsafe {
                dispatch_release(self.inner);
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_dispatch_queue_async() {
        let queue = DispatchQueue::new("avpvm.test.async");
        let (tx, rx) = mpsc::channel();

        queue.async_exec(move || {
            tx.send(42).unwrap();
        });

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 42);
    }

    #[test]
    fn test_async_exec_preserves_order() {
        let queue = DispatchQueue::new("avpvm.test.order");
        let (tx, rx) = mpsc::channel();

        for i in 0..16 {
            let tx = tx.clone();
            queue.async_exec(move || tx.send(i).unwrap());
        }

        let seen: Vec<i32> = (0..16)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        assert_eq!(seen, (0..16).collect::<Vec<_>>());
    }
}
