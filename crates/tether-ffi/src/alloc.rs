//! Per-call storage: the pre-sized call stack and the transient bump
//! allocator.
//!
//! Each loaded library owns one [`CallStack`] and one [`TempAlloc`]. A call
//! borrows both for its whole duration; the stack is handed out through a
//! fail-fast lease so a second in-flight call on the same library errors
//! instead of corrupting the frame under construction.

use std::cell::{Cell, RefCell, UnsafeCell};
use std::os::raw::c_char;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{FfiError, Result};

/// Working area for one native call: frame regions at the top, the callee's
/// own stack growing into the rest.
pub const CALL_STACK_SIZE: usize = 1 << 20;

/// Headroom kept free below the prepared frame for the native callee's own
/// stack frames.
pub const CALLEE_STACK_RESERVE: usize = 64 * 1024;

/// A 1 MiB byte buffer, 16-byte aligned at both ends, leased to one call at
/// a time.
pub struct CallStack {
    // u128 cells guarantee 16-byte alignment of both ends.
    buf: UnsafeCell<Box<[u128]>>,
    in_use: AtomicBool,
}

impl CallStack {
    pub fn new() -> Self {
        CallStack {
            buf: UnsafeCell::new(vec![0u128; CALL_STACK_SIZE / 16].into_boxed_slice()),
            in_use: AtomicBool::new(false),
        }
    }

    /// Acquire exclusive use of the buffer for one call.
    ///
    /// Fails fast when a call on the same library is already in flight.
    pub fn lease(&self) -> Result<StackLease<'_>> {
        if self
            .in_use
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return Err(FfiError::mismatch(
                "a call on this library is already in flight",
            ));
        }
        Ok(StackLease { stack: self })
    }
}

impl Default for CallStack {
    fn default() -> Self {
        Self::new()
    }
}

/// Exclusive access to a [`CallStack`], released on drop.
pub struct StackLease<'a> {
    stack: &'a CallStack,
}

impl StackLease<'_> {
    pub fn base(&self) -> *mut u8 {
        // The lease is the unique accessor while it lives.
        unsafe { (*self.stack.buf.get()).as_mut_ptr() as *mut u8 }
    }

    pub fn top(&self) -> *mut u8 {
        unsafe { self.base().add(self.len()) }
    }

    pub fn len(&self) -> usize {
        CALL_STACK_SIZE
    }
}

impl Drop for StackLease<'_> {
    fn drop(&mut self) {
        self.stack.in_use.store(false, Ordering::Release);
    }
}

const TMP_CHUNK_SIZE: usize = 16 * 1024;

/// Chunked bump allocator for transient per-call bytes (argument strings,
/// mostly). Everything is released in bulk when the call returns.
pub struct TempAlloc {
    chunks: RefCell<Vec<Box<[u8]>>>,
    /// Bump cursor inside the last chunk.
    used: Cell<usize>,
}

impl TempAlloc {
    pub fn new() -> Self {
        TempAlloc {
            chunks: RefCell::new(vec![vec![0u8; TMP_CHUNK_SIZE].into_boxed_slice()]),
            used: Cell::new(0),
        }
    }

    /// Allocate `len` bytes valid until the next [`release_all`](Self::release_all).
    pub fn alloc_bytes(&self, len: usize) -> *mut u8 {
        let mut chunks = self.chunks.borrow_mut();
        if len > TMP_CHUNK_SIZE {
            // Oversized request gets a dedicated chunk, inserted below the
            // bump chunk so the cursor keeps working.
            let mut chunk = vec![0u8; len].into_boxed_slice();
            let ptr = chunk.as_mut_ptr();
            let last = chunks.len() - 1;
            chunks.insert(last, chunk);
            return ptr;
        }
        if self.used.get() + len > TMP_CHUNK_SIZE {
            chunks.push(vec![0u8; TMP_CHUNK_SIZE].into_boxed_slice());
            self.used.set(0);
        }
        let chunk = chunks.last_mut().unwrap_or_else(|| unreachable!());
        let ptr = unsafe { chunk.as_mut_ptr().add(self.used.get()) };
        self.used.set(self.used.get() + len);
        ptr
    }

    /// Copy `s` into the arena as a nul-terminated C string.
    pub fn push_cstr(&self, s: &str) -> *const c_char {
        let bytes = s.as_bytes();
        let dest = self.alloc_bytes(bytes.len() + 1);
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), dest, bytes.len());
            *dest.add(bytes.len()) = 0;
        }
        dest as *const c_char
    }

    /// Drop everything allocated since the last release, keeping one chunk.
    pub fn release_all(&self) {
        let mut chunks = self.chunks.borrow_mut();
        chunks.truncate(1);
        self.used.set(0);
    }
}

impl Default for TempAlloc {
    fn default() -> Self {
        Self::new()
    }
}

/// Releases a [`TempAlloc`] in bulk when dropped, on every exit path of a
/// call (including argument-packing errors).
pub struct TempAllocGuard<'a>(pub &'a TempAlloc);

impl Drop for TempAllocGuard<'_> {
    fn drop(&mut self) {
        self.0.release_all();
    }
}
