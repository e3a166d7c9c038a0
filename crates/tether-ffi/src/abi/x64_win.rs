//! Microsoft x64 backend.
//!
//! Four positional argument slots (RCX, RDX, R8, R9 / XMM0..XMM3), each
//! 8 bytes; a type is *regular* iff its size is 1, 2, 4 or 8, and only
//! regular values travel in a slot directly. Irregular aggregates are
//! copied into the caller-owned scratch area and passed by pointer, and an
//! irregular return is written through a hidden pointer passed as a leading
//! argument.
//!
//! There is no separate register file: the first four slots of the argument
//! area double as the shadow space, and the trampoline loads both the
//! integer and (in the X variant) vector registers from them.

use tether_value::Value;

use crate::alloc::{TempAlloc, CALL_STACK_SIZE};
use crate::error::{FfiError, Result};
use crate::frame::{CallFrame, FrameLayout};
use crate::marshal::{
    c_string, expect_bool, expect_record_kind, external_addr, float32, float64, int_bits,
    push_record, write_scalar, ValueCtx,
};
use crate::types::{PrimitiveKind, TypeId, TypeRegistry};
use crate::util::align_up;

use super::{AbiPlan, ParameterInfo};

pub struct WinX64;

/// Slots whose registers the trampoline materialises (the shadow space).
const REG_SLOTS: usize = 4;

fn is_regular(size: usize) -> bool {
    matches!(size, 1 | 2 | 4 | 8)
}

impl WinX64 {
    pub fn analyse(types: &TypeRegistry, ret_ty: TypeId, params: &[TypeId]) -> Result<AbiPlan> {
        let ret_info = types.get(ret_ty);
        let mut ret = ParameterInfo::new(ret_ty);
        ret.regular = is_regular(ret_info.size);
        let ret_in_memory = ret_info.primitive != PrimitiveKind::Void && !ret.regular;
        match ret_info.primitive {
            PrimitiveKind::Void => {}
            PrimitiveKind::Float32 | PrimitiveKind::Float64 => ret.vec_count = 1,
            _ if ret.regular => ret.gpr_count = 1,
            _ => {}
        }

        let mut scratch = 0usize;
        let mut use_vec = false;
        let mut infos = Vec::with_capacity(params.len());
        for (i, &p) in params.iter().enumerate() {
            let info = types.get(p);
            if info.primitive == PrimitiveKind::Void {
                return Err(FfiError::mismatch(format!(
                    "type void cannot be used for argument {i}"
                )));
            }
            if info.size == 0 {
                return Err(FfiError::unsupported(format!(
                    "zero-sized type '{}' for argument {i}",
                    info.name
                )));
            }
            let mut pi = ParameterInfo::new(p);
            pi.regular = is_regular(info.size);
            if info.primitive == PrimitiveKind::Record && !pi.regular {
                scratch += align_up(info.size, 16);
            }
            use_vec |= info.primitive.is_float();
            infos.push(pi);
        }

        let slots = params.len() + usize::from(ret_in_memory);
        let frame = FrameLayout {
            regfile_size: 0,
            args_size: 8 * slots.max(REG_SLOTS),
            scratch_size: scratch,
            ret_size: if ret_in_memory { ret_info.size } else { 0 },
        };
        if !frame.fits(CALL_STACK_SIZE) {
            return Err(FfiError::unsupported(
                "signature needs more stack than one call frame provides",
            ));
        }
        Ok(AbiPlan {
            ret,
            ret_kind: ret_info.primitive,
            params: infos,
            ret_in_memory,
            use_vec,
            frame,
        })
    }

    pub fn build_frame(
        types: &TypeRegistry,
        plan: &AbiPlan,
        args: &[Value],
        alloc: &TempAlloc,
        frame: &mut CallFrame<'_>,
    ) -> Result<()> {
        let mut slot = 0usize;
        if plan.ret_in_memory {
            let ret_ptr = frame.ret_ptr() as u64;
            unsafe { write_scalar(frame.arg_slot(slot), ret_ptr, 8) };
            slot += 1;
        }

        for (i, (pi, value)) in plan.params.iter().zip(args).enumerate() {
            let ctx = ValueCtx::Arg(i);
            let info = types.get(pi.ty);
            let dest = frame.arg_slot(slot);
            slot += 1;
            match info.primitive {
                PrimitiveKind::Void => {
                    return Err(FfiError::mismatch(format!(
                        "type void cannot be used for {ctx}"
                    )))
                }
                PrimitiveKind::Bool => unsafe {
                    write_scalar(dest, expect_bool(value, ctx)? as u64, 8);
                },
                k if k.is_integer() => unsafe {
                    write_scalar(dest, int_bits(value, ctx)?, 8);
                },
                PrimitiveKind::Float32 => unsafe {
                    write_scalar(dest, float32(value, ctx)?.to_bits() as u64, 8);
                },
                PrimitiveKind::Float64 => unsafe {
                    write_scalar(dest, float64(value, ctx)?.to_bits(), 8);
                },
                PrimitiveKind::String => unsafe {
                    write_scalar(dest, c_string(value, alloc, ctx)? as u64, 8);
                },
                PrimitiveKind::Pointer => {
                    let pointee = info.pointee.unwrap_or(pi.ty);
                    let addr = external_addr(value, pointee, types, ctx)?;
                    unsafe { write_scalar(dest, addr, 8) };
                }
                PrimitiveKind::Record => {
                    expect_record_kind(value, ctx)?;
                    if pi.regular {
                        unsafe {
                            write_scalar(dest, 0, 8);
                            push_record(value, pi.ty, types, alloc, dest)?;
                        }
                    } else {
                        let copy = frame.alloc_scratch(info.size)?;
                        unsafe {
                            push_record(value, pi.ty, types, alloc, copy)?;
                            write_scalar(dest, copy as u64, 8);
                        }
                    }
                }
                _ => unreachable!("integer kinds handled above"),
            }
        }
        Ok(())
    }
}

#[cfg(all(target_arch = "x86_64", target_os = "windows"))]
mod trampoline {
    use std::os::raw::c_void;

    // The stub parks RSP at the base of the argument area, so after the
    // CALL pushes the return address the callee sees its shadow space at
    // [rsp+8] and the fifth argument at [rsp+40], exactly as the ABI lays
    // it out. Slots 0..4 feed RCX, RDX, R8, R9 (and XMM0..XMM3 in the X
    // variant, since a floating argument occupies both files).
    macro_rules! forward_stub {
        ($name:ident, $ret:ty) => {
            #[unsafe(naked)]
            pub unsafe extern "C" fn $name(_func: *const c_void, _sp: *mut u8) -> $ret {
                core::arch::naked_asm!(
                    "push rbp",
                    "mov rbp, rsp",
                    "mov r11, rcx",
                    "mov rsp, rdx",
                    "mov rcx, qword ptr [rsp]",
                    "mov rdx, qword ptr [rsp + 8]",
                    "mov r8, qword ptr [rsp + 16]",
                    "mov r9, qword ptr [rsp + 24]",
                    "call r11",
                    "mov rsp, rbp",
                    "pop rbp",
                    "ret",
                )
            }
        };
        (vec $name:ident, $ret:ty) => {
            #[unsafe(naked)]
            pub unsafe extern "C" fn $name(_func: *const c_void, _sp: *mut u8) -> $ret {
                core::arch::naked_asm!(
                    "push rbp",
                    "mov rbp, rsp",
                    "mov r11, rcx",
                    "mov rsp, rdx",
                    "mov rcx, qword ptr [rsp]",
                    "mov rdx, qword ptr [rsp + 8]",
                    "mov r8, qword ptr [rsp + 16]",
                    "mov r9, qword ptr [rsp + 24]",
                    "movsd xmm0, qword ptr [rsp]",
                    "movsd xmm1, qword ptr [rsp + 8]",
                    "movsd xmm2, qword ptr [rsp + 16]",
                    "movsd xmm3, qword ptr [rsp + 24]",
                    "call r11",
                    "mov rsp, rbp",
                    "pop rbp",
                    "ret",
                )
            }
        };
    }

    forward_stub!(forward_call_g, u64);
    forward_stub!(forward_call_f, f32);
    forward_stub!(forward_call_d, f64);
    forward_stub!(vec forward_call_xg, u64);
    forward_stub!(vec forward_call_xf, f32);
    forward_stub!(vec forward_call_xd, f64);
}

#[cfg(all(target_arch = "x86_64", target_os = "windows"))]
impl super::AbiBackend for WinX64 {
    fn analyse(types: &TypeRegistry, ret: TypeId, params: &[TypeId]) -> Result<AbiPlan> {
        WinX64::analyse(types, ret, params)
    }

    fn build_frame(
        types: &TypeRegistry,
        plan: &AbiPlan,
        args: &[Value],
        alloc: &TempAlloc,
        frame: &mut CallFrame<'_>,
    ) -> Result<()> {
        WinX64::build_frame(types, plan, args, alloc, frame)
    }

    unsafe fn call(
        func: *const std::os::raw::c_void,
        plan: &AbiPlan,
        frame: &CallFrame<'_>,
    ) -> super::ReturnBundle {
        use trampoline::*;

        let sp = frame.sp();
        let x = plan.use_vec;
        let mut bundle = super::ReturnBundle::default();
        match plan.ret_kind {
            PrimitiveKind::Float32 => {
                let f = if x { forward_call_xf(func, sp) } else { forward_call_f(func, sp) };
                bundle.vec[0] = f.to_bits() as u64;
            }
            PrimitiveKind::Float64 => {
                let d = if x { forward_call_xd(func, sp) } else { forward_call_d(func, sp) };
                bundle.vec[0] = d.to_bits();
            }
            _ => {
                bundle.gpr[0] = if x { forward_call_xg(func, sp) } else { forward_call_g(func, sp) };
            }
        }
        bundle
    }
}
