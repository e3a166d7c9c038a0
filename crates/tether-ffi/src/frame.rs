//! Call-frame construction on the leased call stack.
//!
//! For one invocation the top of the 1 MiB call stack is carved, top-down,
//! into four contiguous 16-byte-aligned regions:
//!
//! ```text
//! top ->  [ return buffer ]   only when the return goes by hidden pointer
//!         [ scratch area  ]   per-call copies of by-pointer aggregates
//!         [ overflow args ]   arguments that did not fit in registers
//! sp  ->  [ register file ]   loaded into GPRs/vector regs by the trampoline
//!         [ ...free...    ]   becomes the native callee's own stack
//! base
//! ```
//!
//! The trampoline receives `sp`; everything below stays free so the callee
//! can run on it. On Win64 there is no separate register file: the first
//! four argument slots double as the shadow space the stub loads registers
//! from, so `sp` points directly at the argument area.

use crate::alloc::{StackLease, CALLEE_STACK_RESERVE};
use crate::error::{FfiError, Result};
use crate::util::align_up;

/// Region sizes computed once per function by the ABI analyser.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameLayout {
    /// Size of the register-file image (0 on Win64).
    pub regfile_size: usize,
    /// Exact overflow stack-argument bytes.
    pub args_size: usize,
    /// Storage for by-pointer aggregate copies.
    pub scratch_size: usize,
    /// Hidden-return buffer size (0 when the return fits in registers).
    pub ret_size: usize,
}

impl FrameLayout {
    /// Total bytes carved off the top of the call stack.
    pub fn frame_bytes(&self) -> usize {
        align_up(self.ret_size, 16)
            + align_up(self.scratch_size, 16)
            + align_up(self.args_size, 16)
            + self.regfile_size
    }

    /// Whether the frame (plus callee headroom) fits in `stack_len` bytes.
    pub fn fits(&self, stack_len: usize) -> bool {
        self.frame_bytes() + CALLEE_STACK_RESERVE <= stack_len
    }
}

/// A prepared frame, owning the stack lease for the duration of the call.
pub struct CallFrame<'a> {
    #[allow(dead_code)]
    lease: StackLease<'a>,
    /// Value handed to the trampoline.
    sp: *mut u8,
    regfile: *mut u8,
    regfile_slots: usize,
    args_base: *mut u8,
    args_cursor: usize,
    args_size: usize,
    scratch_base: *mut u8,
    scratch_cursor: usize,
    scratch_size: usize,
    ret_ptr: *mut u8,
    top: *mut u8,
}

impl<'a> CallFrame<'a> {
    /// Carve `layout`'s regions off the top of the leased stack.
    pub fn carve(lease: StackLease<'a>, layout: &FrameLayout) -> Result<CallFrame<'a>> {
        if !layout.fits(lease.len()) {
            return Err(FfiError::unsupported(format!(
                "frame of {} bytes exceeds the call stack",
                layout.frame_bytes()
            )));
        }
        debug_assert_eq!(layout.regfile_size % 16, 0);

        let top = lease.top();
        unsafe {
            let ret_ptr = top.sub(align_up(layout.ret_size, 16));
            let scratch_base = ret_ptr.sub(align_up(layout.scratch_size, 16));
            let args_base = scratch_base.sub(align_up(layout.args_size, 16));
            let regfile = args_base.sub(layout.regfile_size);
            let sp = regfile;

            debug_assert_eq!(sp as usize % 16, 0);
            debug_assert_eq!(args_base as usize % 16, 0);

            // Every byte the trampoline may read starts deterministic in
            // debug builds; release builds rely on the packer writing all
            // bytes that will actually be consumed.
            #[cfg(debug_assertions)]
            std::ptr::write_bytes(sp, 0, top as usize - sp as usize);

            Ok(CallFrame {
                lease,
                sp,
                regfile,
                regfile_slots: layout.regfile_size / 8,
                args_base,
                args_cursor: 0,
                args_size: layout.args_size,
                scratch_base,
                scratch_cursor: 0,
                scratch_size: layout.scratch_size,
                ret_ptr: if layout.ret_size > 0 { ret_ptr } else { std::ptr::null_mut() },
                top,
            })
        }
    }

    /// The pointer handed to the trampoline.
    pub fn sp(&self) -> *mut u8 {
        self.sp
    }

    /// Hidden-return buffer, or null when the return fits in registers.
    pub fn ret_ptr(&self) -> *mut u8 {
        self.ret_ptr
    }

    /// Store 64-bit `bits` into register-file slot `index`.
    pub fn set_reg(&mut self, index: usize, bits: u64) {
        debug_assert!(index < self.regfile_slots, "register index {index} out of budget");
        unsafe {
            self.regfile.cast::<u64>().add(index).write(bits);
        }
    }

    /// Raw pointer to register-file slot `index`, for serialising an
    /// aggregate straight into consecutive register slots.
    pub fn reg_ptr(&mut self, index: usize) -> *mut u8 {
        debug_assert!(index < self.regfile_slots, "register index {index} out of budget");
        unsafe { self.regfile.add(index * 8) }
    }

    /// Reserve an overflow stack slot: aligns the cursor to
    /// `max(8, align)`, advances by `size` rounded up to 8, and returns the
    /// slot start.
    pub fn reserve_stack(&mut self, size: usize, align: usize) -> Result<*mut u8> {
        let start = align_up(self.args_cursor, align.max(8));
        let end = start + align_up(size, 8);
        if end > self.args_size {
            return Err(FfiError::unsupported(
                "overflow argument area exhausted".to_string(),
            ));
        }
        self.args_cursor = end;
        Ok(unsafe { self.args_base.add(start) })
    }

    /// Argument slot `index` in the Win64 slot array (the overflow area and
    /// the shadow space are one array of 8-byte slots there).
    pub fn arg_slot(&mut self, index: usize) -> *mut u8 {
        debug_assert!((index + 1) * 8 <= self.args_size, "slot {index} out of range");
        unsafe { self.args_base.add(index * 8) }
    }

    /// Carve a 16-byte-aligned block out of the scratch area.
    pub fn alloc_scratch(&mut self, size: usize) -> Result<*mut u8> {
        let start = self.scratch_cursor;
        let end = start + align_up(size, 16);
        if end > align_up(self.scratch_size, 16) {
            return Err(FfiError::unsupported("scratch area exhausted".to_string()));
        }
        self.scratch_cursor = end;
        Ok(unsafe { self.scratch_base.add(start) })
    }

    /// Hex dump of the prepared regions, for `trace!`-level debugging.
    pub fn dump(&self, func_name: &str) {
        if !log::log_enabled!(log::Level::Trace) {
            return;
        }
        let len = self.top as usize - self.sp as usize;
        let bytes = unsafe { std::slice::from_raw_parts(self.sp, len) };
        let mut out = String::new();
        for (i, chunk) in bytes.chunks(16).enumerate() {
            out.push_str(&format!("\n  {:06x}:", i * 16));
            for b in chunk {
                out.push_str(&format!(" {b:02x}"));
            }
        }
        log::trace!("frame for '{func_name}' ({len} bytes):{out}");
    }
}
