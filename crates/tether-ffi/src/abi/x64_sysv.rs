//! System V AMD64 backend (Linux, macOS and the other non-Windows x86-64
//! targets).
//!
//! Register budgets: 6 integer registers (RDI, RSI, RDX, RCX, R8, R9) and
//! 8 vector registers (XMM0..XMM7). Aggregates up to 16 bytes are split
//! into one or two eightbytes, each independently classified INTEGER or
//! SSE from its leaf fields; larger aggregates go to the stack. Returns up
//! to 16 bytes come back in `RAX:RDX` / `XMM0:XMM1` following the same
//! classification, larger ones through a hidden pointer passed in the
//! first integer register.
//!
//! The register-file image the trampoline consumes is 6 GPR slots followed
//! by 8 XMM slots, sitting directly below the overflow arguments.

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

pub struct SysVX64;

const GPR_BUDGET: usize = 6;
const VEC_BUDGET: usize = 8;
/// First XMM slot in the register-file image.
const VEC_BASE_SLOT: usize = GPR_BUDGET;
/// 6 GPR slots + 8 XMM slots.
pub const REGFILE_SIZE: usize = (GPR_BUDGET + VEC_BUDGET) * 8;

/// Classification of one eightbyte of an aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Eightbyte {
    Integer,
    Sse,
}

/// Classify both eightbytes of an aggregate of at most 16 bytes: an
/// eightbyte is SSE iff every leaf field inside it is floating-point.
///
/// Natural member alignment guarantees no leaf straddles the boundary.
fn classify_eightbytes(types: &TypeRegistry, ty: TypeId) -> [Eightbyte; 2] {
    let mut has_int = [false; 2];
    types.for_each_leaf(ty, &mut |offset, info| {
        let idx = offset / 8;
        if idx < 2 && !info.primitive.is_float() {
            has_int[idx] = true;
        }
    });
    [
        if has_int[0] { Eightbyte::Integer } else { Eightbyte::Sse },
        if has_int[1] { Eightbyte::Integer } else { Eightbyte::Sse },
    ]
}

fn classify_pair(classes: [Eightbyte; 2]) -> (u8, u8, bool) {
    match classes {
        [Eightbyte::Integer, Eightbyte::Integer] => (2, 0, false),
        [Eightbyte::Sse, Eightbyte::Sse] => (0, 2, false),
        [Eightbyte::Integer, Eightbyte::Sse] => (1, 1, true),
        [Eightbyte::Sse, Eightbyte::Integer] => (1, 1, false),
    }
}

fn classify_return(types: &TypeRegistry, ret_ty: TypeId) -> (ParameterInfo, bool) {
    let info = types.get(ret_ty);
    let mut ret = ParameterInfo::new(ret_ty);
    match info.primitive {
        PrimitiveKind::Void => {}
        PrimitiveKind::Float32 | PrimitiveKind::Float64 => ret.vec_count = 1,
        PrimitiveKind::Record => {
            if info.size <= 8 {
                if types.all_float(ret_ty) {
                    ret.vec_count = 1;
                } else {
                    ret.gpr_count = 1;
                }
            } else if info.size <= 16 {
                let (g, v, first) = classify_pair(classify_eightbytes(types, ret_ty));
                ret.gpr_count = g;
                ret.vec_count = v;
                ret.gpr_first = first;
            } else {
                return (ret, true);
            }
        }
        _ => ret.gpr_count = 1,
    }
    (ret, false)
}

impl SysVX64 {
    pub fn analyse(types: &TypeRegistry, ret_ty: TypeId, params: &[TypeId]) -> Result<AbiPlan> {
        let (ret, ret_in_memory) = classify_return(types, ret_ty);
        let mut gpr_avail = GPR_BUDGET - usize::from(ret_in_memory);
        let mut vec_avail = VEC_BUDGET;
        let mut stack = 0usize;
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
            match info.primitive {
                PrimitiveKind::Float32 | PrimitiveKind::Float64 => {
                    if vec_avail > 0 {
                        pi.vec_count = 1;
                        vec_avail -= 1;
                    }
                }
                PrimitiveKind::Record => {
                    if info.size <= 8 {
                        if types.all_float(p) {
                            if vec_avail > 0 {
                                pi.vec_count = 1;
                                vec_avail -= 1;
                            }
                        } else if gpr_avail > 0 {
                            pi.gpr_count = 1;
                            gpr_avail -= 1;
                        }
                    } else if info.size <= 16 {
                        let (g, v, first) = classify_pair(classify_eightbytes(types, p));
                        // Consumption is atomic: either the whole aggregate
                        // fits in the remaining registers or it spills.
                        if usize::from(g) <= gpr_avail && usize::from(v) <= vec_avail {
                            pi.gpr_count = g;
                            pi.vec_count = v;
                            pi.gpr_first = first;
                            gpr_avail -= usize::from(g);
                            vec_avail -= usize::from(v);
                        }
                    }
                    // > 16 bytes: always the stack on System V.
                }
                _ => {
                    if gpr_avail > 0 {
                        pi.gpr_count = 1;
                        gpr_avail -= 1;
                    }
                }
            }
            if !pi.in_registers() {
                stack = align_up(stack, info.align.max(8)) + align_up(info.size, 8);
            }
            infos.push(pi);
        }

        let use_vec = infos.iter().any(|p| p.vec_count > 0);
        let frame = FrameLayout {
            regfile_size: REGFILE_SIZE,
            args_size: stack,
            scratch_size: 0,
            ret_size: if ret_in_memory { types.get(ret_ty).size } else { 0 },
        };
        if !frame.fits(CALL_STACK_SIZE) {
            return Err(FfiError::unsupported(
                "signature needs more stack than one call frame provides",
            ));
        }
        Ok(AbiPlan {
            ret,
            ret_kind: types.get(ret_ty).primitive,
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
        let mut gpr = 0usize;
        let mut vec = 0usize;
        if plan.ret_in_memory {
            frame.set_reg(gpr, frame.ret_ptr() as u64);
            gpr += 1;
        }

        for (i, (pi, value)) in plan.params.iter().zip(args).enumerate() {
            let ctx = ValueCtx::Arg(i);
            let info = types.get(pi.ty);
            match info.primitive {
                PrimitiveKind::Void => {
                    return Err(FfiError::mismatch(format!(
                        "type void cannot be used for {ctx}"
                    )))
                }
                PrimitiveKind::Bool => {
                    let bits = expect_bool(value, ctx)? as u64;
                    put_int(frame, pi, &mut gpr, bits, info)?;
                }
                k if k.is_integer() => {
                    let bits = int_bits(value, ctx)?;
                    put_int(frame, pi, &mut gpr, bits, info)?;
                }
                PrimitiveKind::Float32 => {
                    let bits = float32(value, ctx)?.to_bits() as u64;
                    put_float(frame, pi, &mut vec, bits)?;
                }
                PrimitiveKind::Float64 => {
                    let bits = float64(value, ctx)?.to_bits();
                    put_float(frame, pi, &mut vec, bits)?;
                }
                PrimitiveKind::String => {
                    let bits = c_string(value, alloc, ctx)? as u64;
                    put_int(frame, pi, &mut gpr, bits, info)?;
                }
                PrimitiveKind::Pointer => {
                    let pointee = info.pointee.unwrap_or(pi.ty);
                    let bits = external_addr(value, pointee, types, ctx)?;
                    put_int(frame, pi, &mut gpr, bits, info)?;
                }
                PrimitiveKind::Record => {
                    expect_record_kind(value, ctx)?;
                    if !pi.in_registers() {
                        let dest = frame.reserve_stack(info.size, info.align)?;
                        unsafe { push_record(value, pi.ty, types, alloc, dest)? };
                    } else if info.size <= 8 {
                        let slot = if pi.vec_count == 1 {
                            vec += 1;
                            VEC_BASE_SLOT + vec - 1
                        } else {
                            gpr += 1;
                            gpr - 1
                        };
                        let dest = frame.reg_ptr(slot);
                        unsafe { push_record(value, pi.ty, types, alloc, dest)? };
                    } else {
                        // Split a 16-byte aggregate across its two
                        // classified eightbytes.
                        let mut tmp = [0u8; 16];
                        unsafe { push_record(value, pi.ty, types, alloc, tmp.as_mut_ptr())? };
                        for (k, class) in classify_eightbytes(types, pi.ty).iter().enumerate() {
                            let mut bytes = [0u8; 8];
                            bytes.copy_from_slice(&tmp[k * 8..k * 8 + 8]);
                            let bits = u64::from_le_bytes(bytes);
                            match class {
                                Eightbyte::Integer => {
                                    frame.set_reg(gpr, bits);
                                    gpr += 1;
                                }
                                Eightbyte::Sse => {
                                    frame.set_reg(VEC_BASE_SLOT + vec, bits);
                                    vec += 1;
                                }
                            }
                        }
                    }
                }
                _ => unreachable!("integer kinds handled above"),
            }
        }

        debug_assert!(gpr <= GPR_BUDGET && vec <= VEC_BUDGET);
        Ok(())
    }
}

fn put_int(
    frame: &mut CallFrame<'_>,
    pi: &ParameterInfo,
    gpr: &mut usize,
    bits: u64,
    info: &crate::types::TypeInfo,
) -> Result<()> {
    if pi.gpr_count == 1 {
        frame.set_reg(*gpr, bits);
        *gpr += 1;
    } else {
        let dest = frame.reserve_stack(info.size, info.align)?;
        unsafe { write_scalar(dest, bits, 8) };
    }
    Ok(())
}

fn put_float(
    frame: &mut CallFrame<'_>,
    pi: &ParameterInfo,
    vec: &mut usize,
    bits: u64,
) -> Result<()> {
    if pi.vec_count == 1 {
        frame.set_reg(VEC_BASE_SLOT + *vec, bits);
        *vec += 1;
    } else {
        let dest = frame.reserve_stack(8, 8)?;
        unsafe { write_scalar(dest, bits, 8) };
    }
    Ok(())
}

#[cfg(all(target_arch = "x86_64", not(target_os = "windows")))]
mod trampoline {
    use std::os::raw::c_void;

    #[repr(C)]
    pub struct RetRaxRdx {
        pub rax: u64,
        pub rdx: u64,
    }
    #[repr(C)]
    pub struct RetXmm0Rax {
        pub xmm0: f64,
        pub rax: u64,
    }
    #[repr(C)]
    pub struct RetRaxXmm0 {
        pub rax: u64,
        pub xmm0: f64,
    }
    #[repr(C)]
    pub struct RetXmm0Xmm1 {
        pub xmm0: f64,
        pub xmm1: f64,
    }

    // Each stub switches onto the prepared frame, pops the register file
    // into the argument registers and falls through into the target with
    // the overflow arguments exactly where the callee expects its stack
    // arguments. The declared Rust return type matches the register pair
    // the callee leaves its result in, so returning is a plain pass-through.
    macro_rules! forward_stub {
        ($name:ident, $ret:ty) => {
            #[unsafe(naked)]
            pub unsafe extern "C" fn $name(_func: *const c_void, _sp: *mut u8) -> $ret {
                core::arch::naked_asm!(
                    "push rbp",
                    "mov rbp, rsp",
                    "mov r11, rdi",
                    "mov rsp, rsi",
                    "mov rdi, qword ptr [rsp]",
                    "mov rsi, qword ptr [rsp + 8]",
                    "mov rdx, qword ptr [rsp + 16]",
                    "mov rcx, qword ptr [rsp + 24]",
                    "mov r8, qword ptr [rsp + 32]",
                    "mov r9, qword ptr [rsp + 40]",
                    "add rsp, 112",
                    "xor eax, eax",
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
                    "mov r11, rdi",
                    "mov rsp, rsi",
                    "mov rdi, qword ptr [rsp]",
                    "mov rsi, qword ptr [rsp + 8]",
                    "mov rdx, qword ptr [rsp + 16]",
                    "mov rcx, qword ptr [rsp + 24]",
                    "mov r8, qword ptr [rsp + 32]",
                    "mov r9, qword ptr [rsp + 40]",
                    "movsd xmm0, qword ptr [rsp + 48]",
                    "movsd xmm1, qword ptr [rsp + 56]",
                    "movsd xmm2, qword ptr [rsp + 64]",
                    "movsd xmm3, qword ptr [rsp + 72]",
                    "movsd xmm4, qword ptr [rsp + 80]",
                    "movsd xmm5, qword ptr [rsp + 88]",
                    "movsd xmm6, qword ptr [rsp + 96]",
                    "movsd xmm7, qword ptr [rsp + 104]",
                    "add rsp, 112",
                    "mov al, 8",
                    "call r11",
                    "mov rsp, rbp",
                    "pop rbp",
                    "ret",
                )
            }
        };
    }

    forward_stub!(forward_call_ii, RetRaxRdx);
    forward_stub!(forward_call_id, RetRaxXmm0);
    forward_stub!(forward_call_di, RetXmm0Rax);
    forward_stub!(forward_call_dd, RetXmm0Xmm1);
    forward_stub!(forward_call_f, f32);
    forward_stub!(vec forward_call_xii, RetRaxRdx);
    forward_stub!(vec forward_call_xid, RetRaxXmm0);
    forward_stub!(vec forward_call_xdi, RetXmm0Rax);
    forward_stub!(vec forward_call_xdd, RetXmm0Xmm1);
    forward_stub!(vec forward_call_xf, f32);
}

#[cfg(all(target_arch = "x86_64", not(target_os = "windows")))]
impl super::AbiBackend for SysVX64 {
    fn analyse(types: &TypeRegistry, ret: TypeId, params: &[TypeId]) -> Result<AbiPlan> {
        SysVX64::analyse(types, ret, params)
    }

    fn build_frame(
        types: &TypeRegistry,
        plan: &AbiPlan,
        args: &[Value],
        alloc: &TempAlloc,
        frame: &mut CallFrame<'_>,
    ) -> Result<()> {
        SysVX64::build_frame(types, plan, args, alloc, frame)
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
                let r = if x { forward_call_xdi(func, sp) } else { forward_call_di(func, sp) };
                bundle.vec[0] = r.xmm0.to_bits();
                bundle.gpr[0] = r.rax;
            }
            PrimitiveKind::Record if !plan.ret_in_memory => {
                match (plan.ret.gpr_count, plan.ret.vec_count, plan.ret.gpr_first) {
                    (0, 1, _) | (0, 2, _) => {
                        let r = if x { forward_call_xdd(func, sp) } else { forward_call_dd(func, sp) };
                        bundle.vec[0] = r.xmm0.to_bits();
                        bundle.vec[1] = r.xmm1.to_bits();
                    }
                    (1, 1, true) => {
                        let r = if x { forward_call_xid(func, sp) } else { forward_call_id(func, sp) };
                        bundle.gpr[0] = r.rax;
                        bundle.vec[0] = r.xmm0.to_bits();
                    }
                    (1, 1, false) => {
                        let r = if x { forward_call_xdi(func, sp) } else { forward_call_di(func, sp) };
                        bundle.vec[0] = r.xmm0.to_bits();
                        bundle.gpr[0] = r.rax;
                    }
                    _ => {
                        let r = if x { forward_call_xii(func, sp) } else { forward_call_ii(func, sp) };
                        bundle.gpr = [r.rax, r.rdx];
                    }
                }
            }
            _ => {
                let r = if x { forward_call_xii(func, sp) } else { forward_call_ii(func, sp) };
                bundle.gpr = [r.rax, r.rdx];
            }
        }
        bundle
    }
}
