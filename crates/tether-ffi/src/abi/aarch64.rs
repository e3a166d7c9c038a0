//! AArch64 AAPCS backend.
//!
//! Register budgets: X0..X7 and V0..V7. Homogeneous floating aggregates of
//! up to four identical float members travel in consecutive vector
//! registers, one member per register; other aggregates up to 16 bytes take
//! `ceil(size/8)` consecutive GPRs; larger aggregates are copied into the
//! scratch area and passed by pointer. An oversized return is written
//! through the address the caller leaves in X8.
//!
//! The register-file image is 8 GPR slots, the X8 slot, one slot of
//! padding, then 8 vector slots (144 bytes, 16-aligned).

use tether_value::Value;

use crate::alloc::{TempAlloc, CALL_STACK_SIZE};
use crate::error::{FfiError, Result};
use crate::frame::{CallFrame, FrameLayout};
use crate::marshal::{
    c_string, expect_bool, expect_record_kind, external_addr, float32, float64, int_bits,
    pop_member, push_member, push_record, write_scalar, ValueCtx,
};
use crate::types::{PrimitiveKind, TypeId, TypeInfo, TypeRegistry};
use crate::util::align_up;

use super::{AbiPlan, ParameterInfo};

pub struct Aarch64;

const GPR_BUDGET: usize = 8;
const VEC_BUDGET: usize = 8;
/// Slot of X8, the indirect-result register.
const X8_SLOT: usize = 8;
/// First vector slot (after X0..X8 and one padding slot).
const VEC_BASE_SLOT: usize = 10;
/// 8 GPRs + X8 + padding + 8 vector slots.
pub const REGFILE_SIZE: usize = (VEC_BASE_SLOT + VEC_BUDGET) * 8;

/// A record is an HFA iff it has 1..=4 members of one identical floating
/// primitive. Returns the member count.
pub(crate) fn hfa_members(types: &TypeRegistry, ty: TypeId) -> Option<u8> {
    let info = types.get(ty);
    if info.primitive != PrimitiveKind::Record {
        return None;
    }
    if info.members.is_empty() || info.members.len() > 4 {
        return None;
    }
    let first = types.get(info.members[0].ty).primitive;
    if !first.is_float() {
        return None;
    }
    for member in &info.members[1..] {
        if types.get(member.ty).primitive != first {
            return None;
        }
    }
    Some(info.members.len() as u8)
}

fn classify_return(types: &TypeRegistry, ret_ty: TypeId) -> (ParameterInfo, bool) {
    let info = types.get(ret_ty);
    let mut ret = ParameterInfo::new(ret_ty);
    match info.primitive {
        PrimitiveKind::Void => {}
        PrimitiveKind::Float32 | PrimitiveKind::Float64 => ret.vec_count = 1,
        PrimitiveKind::Record => {
            if let Some(n) = hfa_members(types, ret_ty) {
                ret.hfa = true;
                ret.vec_count = n;
            } else if info.size <= 16 {
                ret.gpr_count = info.size.div_ceil(8) as u8;
            } else {
                return (ret, true);
            }
        }
        _ => ret.gpr_count = 1,
    }
    (ret, false)
}

impl Aarch64 {
    pub fn analyse(types: &TypeRegistry, ret_ty: TypeId, params: &[TypeId]) -> Result<AbiPlan> {
        let (ret, ret_in_memory) = classify_return(types, ret_ty);
        // X8 is not a parameter register, so the budgets stay untouched by
        // an indirect return.
        let mut gpr_avail = GPR_BUDGET;
        let mut vec_avail = VEC_BUDGET;
        let mut stack = 0usize;
        let mut scratch = 0usize;
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
                    } else {
                        stack = align_up(stack, 8) + 8;
                    }
                }
                PrimitiveKind::Record => {
                    if let Some(n) = hfa_members(types, p) {
                        pi.hfa = true;
                        if usize::from(n) <= vec_avail {
                            pi.vec_count = n;
                            vec_avail -= usize::from(n);
                        } else {
                            stack = align_up(stack, info.align.max(8)) + align_up(info.size, 8);
                        }
                    } else if info.size <= 16 {
                        let need = info.size.div_ceil(8);
                        if need <= gpr_avail {
                            pi.gpr_count = need as u8;
                            gpr_avail -= need;
                        } else {
                            stack = align_up(stack, info.align.max(8)) + align_up(info.size, 8);
                        }
                    } else {
                        // By pointer to a scratch copy; the pointer itself
                        // takes a GPR when one is left, a stack slot
                        // otherwise.
                        scratch += align_up(info.size, 16);
                        if gpr_avail > 0 {
                            pi.gpr_count = 1;
                            gpr_avail -= 1;
                        } else {
                            stack = align_up(stack, 8) + 8;
                        }
                    }
                }
                _ => {
                    if gpr_avail > 0 {
                        pi.gpr_count = 1;
                        gpr_avail -= 1;
                    } else {
                        stack = align_up(stack, 8) + 8;
                    }
                }
            }
            infos.push(pi);
        }

        let use_vec = infos.iter().any(|p| p.vec_count > 0);
        let frame = FrameLayout {
            regfile_size: REGFILE_SIZE,
            args_size: stack,
            scratch_size: scratch,
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
            frame.set_reg(X8_SLOT, frame.ret_ptr() as u64);
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
                    if pi.hfa {
                        if pi.vec_count > 0 {
                            let dest = frame.reg_ptr(VEC_BASE_SLOT + vec);
                            unsafe { push_hfa(value, pi.ty, types, alloc, dest)? };
                            vec += usize::from(pi.vec_count);
                        } else {
                            // Spilled HFA: packed layout on the stack.
                            let dest = frame.reserve_stack(info.size, info.align)?;
                            unsafe { push_record(value, pi.ty, types, alloc, dest)? };
                        }
                    } else if info.size <= 16 {
                        if pi.gpr_count > 0 {
                            let dest = frame.reg_ptr(gpr);
                            unsafe { push_record(value, pi.ty, types, alloc, dest)? };
                            gpr += usize::from(pi.gpr_count);
                        } else {
                            let dest = frame.reserve_stack(info.size, info.align)?;
                            unsafe { push_record(value, pi.ty, types, alloc, dest)? };
                        }
                    } else {
                        let copy = frame.alloc_scratch(info.size)?;
                        unsafe { push_record(value, pi.ty, types, alloc, copy)? };
                        put_int(frame, pi, &mut gpr, copy as u64, info)?;
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
    _info: &TypeInfo,
) -> Result<()> {
    if pi.gpr_count >= 1 {
        frame.set_reg(*gpr, bits);
        *gpr += 1;
    } else {
        let dest = frame.reserve_stack(8, 8)?;
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

/// Serialise an HFA with one member per 8-byte vector slot.
///
/// # Safety
/// `dest` must be valid for `member_count * 8` bytes.
pub(crate) unsafe fn push_hfa(
    value: &Value,
    ty: TypeId,
    types: &TypeRegistry,
    alloc: &TempAlloc,
    dest: *mut u8,
) -> Result<()> {
    let info = types.get(ty);
    debug_assert!(hfa_members(types, ty).is_some());
    let record = match value.as_record() {
        Some(r) => r,
        None => {
            return Err(FfiError::mismatch(format!(
                "unexpected {} value, expected object for '{}'",
                value.kind_name(),
                info.name
            )))
        }
    };
    for (i, member) in info.members.iter().enumerate() {
        let field = record.get(&member.name).ok_or_else(|| {
            FfiError::mismatch(format!(
                "missing field '{}' for record '{}'",
                member.name, info.name
            ))
        })?;
        push_member(
            field,
            member.ty,
            types,
            alloc,
            dest.add(i * 8),
            ValueCtx::Field(&member.name),
        )?;
    }
    Ok(())
}

/// Rebuild an HFA value from the returned vector registers, one member per
/// register.
pub fn pop_hfa(vec: &[u64; 4], ty: TypeId, types: &TypeRegistry) -> Value {
    let info = types.get(ty);
    let mut record = tether_value::RecordValue::new();
    for (i, member) in info.members.iter().enumerate() {
        let bits = vec[i].to_le_bytes();
        let value = unsafe { pop_member(bits.as_ptr(), member.ty, types) };
        record.set(member.name.clone(), value);
    }
    Value::Record(record)
}

#[cfg(target_arch = "aarch64")]
mod trampoline {
    use std::os::raw::c_void;

    #[repr(C)]
    pub struct RetX0X1 {
        pub x0: u64,
        pub x1: u64,
    }
    /// Four doubles form an HFA themselves, so this comes back in D0..D3.
    #[repr(C)]
    pub struct RetHfa {
        pub d0: f64,
        pub d1: f64,
        pub d2: f64,
        pub d3: f64,
    }

    macro_rules! forward_stub {
        ($name:ident, $ret:ty) => {
            #[unsafe(naked)]
            pub unsafe extern "C" fn $name(_func: *const c_void, _sp: *mut u8) -> $ret {
                core::arch::naked_asm!(
                    "stp x29, x30, [sp, #-16]!",
                    "mov x29, sp",
                    "mov x9, x0",
                    "mov sp, x1",
                    "ldp x0, x1, [sp]",
                    "ldp x2, x3, [sp, #16]",
                    "ldp x4, x5, [sp, #32]",
                    "ldp x6, x7, [sp, #48]",
                    "ldr x8, [sp, #64]",
                    "add sp, sp, #144",
                    "blr x9",
                    "mov sp, x29",
                    "ldp x29, x30, [sp], #16",
                    "ret",
                )
            }
        };
        (vec $name:ident, $ret:ty) => {
            #[unsafe(naked)]
            pub unsafe extern "C" fn $name(_func: *const c_void, _sp: *mut u8) -> $ret {
                core::arch::naked_asm!(
                    "stp x29, x30, [sp, #-16]!",
                    "mov x29, sp",
                    "mov x9, x0",
                    "mov sp, x1",
                    "ldp x0, x1, [sp]",
                    "ldp x2, x3, [sp, #16]",
                    "ldp x4, x5, [sp, #32]",
                    "ldp x6, x7, [sp, #48]",
                    "ldr x8, [sp, #64]",
                    "ldp d0, d1, [sp, #80]",
                    "ldp d2, d3, [sp, #96]",
                    "ldp d4, d5, [sp, #112]",
                    "ldp d6, d7, [sp, #128]",
                    "add sp, sp, #144",
                    "blr x9",
                    "mov sp, x29",
                    "ldp x29, x30, [sp], #16",
                    "ret",
                )
            }
        };
    }

    forward_stub!(forward_call_gg, RetX0X1);
    forward_stub!(forward_call_f, f32);
    forward_stub!(forward_call_dddd, RetHfa);
    forward_stub!(vec forward_call_xgg, RetX0X1);
    forward_stub!(vec forward_call_xf, f32);
    forward_stub!(vec forward_call_xdddd, RetHfa);
}

#[cfg(target_arch = "aarch64")]
impl super::AbiBackend for Aarch64 {
    fn analyse(types: &TypeRegistry, ret: TypeId, params: &[TypeId]) -> Result<AbiPlan> {
        Aarch64::analyse(types, ret, params)
    }

    fn build_frame(
        types: &TypeRegistry,
        plan: &AbiPlan,
        args: &[Value],
        alloc: &TempAlloc,
        frame: &mut CallFrame<'_>,
    ) -> Result<()> {
        Aarch64::build_frame(types, plan, args, alloc, frame)
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
                let r = if x { forward_call_xdddd(func, sp) } else { forward_call_dddd(func, sp) };
                bundle.vec[0] = r.d0.to_bits();
            }
            PrimitiveKind::Record if plan.ret.hfa => {
                let r = if x { forward_call_xdddd(func, sp) } else { forward_call_dddd(func, sp) };
                bundle.vec = [r.d0.to_bits(), r.d1.to_bits(), r.d2.to_bits(), r.d3.to_bits()];
            }
            _ => {
                let r = if x { forward_call_xgg(func, sp) } else { forward_call_gg(func, sp) };
                bundle.gpr = [r.x0, r.x1];
            }
        }
        bundle
    }
}
