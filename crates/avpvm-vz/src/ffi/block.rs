//! Objective-C Block handling for completion handlers.
//!
//! Virtualization.framework reports the outcome of start and stop through
//! `void (^)(NSError *)` completion handlers. This module builds such blocks
//! around a Rust closure.
//!
//! # Block ABI
//!
//! A block with captured variables has the following layout:
//!
//! ```text
//! struct Block {
//!     isa: *const c_void,            // _NSConcreteStackBlock or _NSConcreteMallocBlock
//!     flags: i32,                    // Block flags
//!     reserved: i32,                 // Reserved
//!     invoke: fn(*const Block, ...), // Invoke function
//!     descriptor: *const Descriptor, // Block descriptor
//!     // Captured variables follow...
//! }
//! ```

use objc2::runtime::AnyObject;
use std::ffi::c_void;
use std::ptr;

use crate::error::VzResult;

// ============================================================================
// Block Flags
// ============================================================================

/// Block has copy/dispose helpers.
const BLOCK_HAS_COPY_DISPOSE: i32 = 1 << 25;

// ============================================================================
// Block ABI Structures
// ============================================================================

/// Block descriptor structure with copy/dispose helpers.
#[repr(C)]
pub struct BlockDescriptorWithHelpers {
    /// Reserved field.
    pub reserved: u64,
    /// Size of the block.
    pub size: u64,
    /// Copy helper function.
    pub copy_helper: unsafe extern "C" fn(*mut c_void, *const c_void),
    /// Dispose helper function.
    pub dispose_helper: unsafe extern "C" fn(*mut c_void),
}

/// Handler run when a completion block fires.
pub type CompletionHandler = Box<dyn FnOnce(VzResult<()>) + Send + 'static>;

/// Completion block `void (^)(NSError *)` capturing a boxed Rust handler.
#[repr(C)]
pub struct CompletionContextBlock {
    /// ISA pointer.
    pub isa: *const c_void,
    /// Block flags.
    pub flags: i32,
    /// Reserved.
    pub reserved: i32,
    /// Invoke function pointer.
    pub invoke: unsafe extern "C" fn(*mut CompletionContextBlock, *mut AnyObject),
    /// Block descriptor.
    pub descriptor: *const BlockDescriptorWithHelpers,
    /// Captured context: raw pointer to `Box<CompletionHandler>`.
    pub handler_ptr: *mut c_void,
}

/// Descriptor for [`CompletionContextBlock`].
static COMPLETION_CONTEXT_BLOCK_DESCRIPTOR: BlockDescriptorWithHelpers =
    BlockDescriptorWithHelpers {
        reserved: 0,
        size: std::mem::size_of::<CompletionContextBlock>() as u64,
        copy_helper: completion_block_copy,
        dispose_helper: completion_block_dispose,
    };

/// Copy helper.
///
/// Only runs for the stack-to-heap copy; ownership of the handler moves with
/// the raw pointer.
unsafe extern "C" fn completion_block_copy(_dst: *mut c_void, _src: *const c_void) {}

/// Dispose helper. Drops the handler if the block was never invoked.
unsafe extern "C" fn completion_block_dispose(block: *mut c_void) {
    unsafe {
        let block = block as *mut CompletionContextBlock;
        let handler_ptr = (*block).handler_ptr;
        if !handler_ptr.is_null() {
            (*block).handler_ptr = ptr::null_mut();
            drop(Box::from_raw(handler_ptr as *mut CompletionHandler));
        }
    }
}

/// Invoke function. Runs the handler once with the translated error.
unsafe extern "C" fn completion_block_invoke(
    block: *mut CompletionContextBlock,
    error: *mut AnyObject,
) {
    unsafe {
        let handler_ptr = (*block).handler_ptr;
        if handler_ptr.is_null() {
            tracing::warn!("completion block invoked more than once");
            return;
        }
        // Clear the pointer so dispose won't double-free
        (*block).handler_ptr = ptr::null_mut();
        let handler = Box::from_raw(handler_ptr as *mut CompletionHandler);

        let result = if error.is_null() {
            Ok(())
        } else {
            Err(super::extract_nserror(error))
        };
        handler(result);
    }
}

/// Creates a heap completion block that runs `handler` with the outcome.
///
/// The caller owns one reference and must balance it with `_Block_release`
/// once the block has been handed to the framework.
pub fn create_completion_block<F>(handler: F) -> *const c_void
where
    F: FnOnce(VzResult<()>) + Send + 'static,
{
    let boxed: Box<CompletionHandler> = Box::new(Box::new(handler));
    let handler_ptr = Box::into_raw(boxed) as *mut c_void;

    unsafe {
        let stack_block = CompletionContextBlock {
            isa: _NSConcreteStackBlock,
            flags: BLOCK_HAS_COPY_DISPOSE,
            reserved: 0,
            invoke: completion_block_invoke,
            descriptor: &COMPLETION_CONTEXT_BLOCK_DESCRIPTOR,
            handler_ptr,
        };

        _Block_copy(&stack_block as *const CompletionContextBlock as *const c_void)
    }
}

// ============================================================================
// Block Runtime FFI
// ============================================================================

unsafe extern "C" {
    /// Global block ISA for stack blocks.
    pub static _NSConcreteStackBlock: *const c_void;

    /// Copy a block to the heap.
    pub fn _Block_copy(block: *const c_void) -> *const c_void;

    /// Release a block.
    pub fn _Block_release(block: *const c_void);
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_invoke_runs_handler_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let block = create_completion_block({
            let calls = Arc::clone(&calls);
            move |result| {
                assert!(result.is_ok());
                calls.fetch_add(1, Ordering::SeqCst);
            }
        });
        assert!(!block.is_null());

        unsafe {
            let heap = block as *mut CompletionContextBlock;
            ((*heap).invoke)(heap, ptr::null_mut());
            ((*heap).invoke)(heap, ptr::null_mut());
            _Block_release(block);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_release_without_invoke_drops_handler() {
        let marker = Arc::new(());
        let block = create_completion_block({
            let marker = Arc::clone(&marker);
            move |_| drop(marker)
        });
        assert_eq!(Arc::strong_count(&marker), 2);

        unsafe { _Block_release(block) };
        assert_eq!(Arc::strong_count(&marker), 1);
    }
}
