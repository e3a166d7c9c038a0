//! Per-platform ABI engines.
//!
//! Each backend implements the same three-step capability: classify a
//! signature once ([`AbiBackend::analyse`]), pack one invocation's arguments
//! into a prepared [`CallFrame`] ([`AbiBackend::build_frame`]), and jump
//! through a hand-written trampoline ([`AbiBackend::call`]).
//!
//! Classification and packing are plain byte manipulation and compile on
//! every host, which keeps all three ABIs testable anywhere; only the
//! trampolines and the [`AbiBackend`] impl itself are target-gated. The
//! host's backend is exported as [`HostAbi`].

use std::os::raw::c_void;

use tether_value::{ExternalPtr, Value};

use crate::alloc::TempAlloc;
use crate::error::Result;
use crate::frame::{CallFrame, FrameLayout};
use crate::marshal::pop_record;
use crate::types::{PrimitiveKind, TypeId, TypeRegistry};

pub mod aarch64;
pub mod x64_sysv;
pub mod x64_win;

#[cfg(all(target_arch = "x86_64", not(target_os = "windows")))]
pub type HostAbi = x64_sysv::SysVX64;
#[cfg(all(target_arch = "x86_64", target_os = "windows"))]
pub type HostAbi = x64_win::WinX64;
#[cfg(target_arch = "aarch64")]
pub type HostAbi = aarch64::Aarch64;

/// ABI classification of one parameter (or of the return value), computed
/// once per function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParameterInfo {
    pub ty: TypeId,
    /// Integer registers consumed (0 when passed on the stack).
    pub gpr_count: u8,
    /// Vector registers consumed.
    pub vec_count: u8,
    /// For a mixed 16-byte aggregate split across one GPR and one vector
    /// register: whether the GPR half comes first.
    pub gpr_first: bool,
    /// Homogeneous floating aggregate (AArch64 only).
    pub hfa: bool,
    /// Size is 1, 2, 4 or 8 (Win64 only).
    pub regular: bool,
}

impl ParameterInfo {
    pub fn new(ty: TypeId) -> Self {
        ParameterInfo {
            ty,
            gpr_count: 0,
            vec_count: 0,
            gpr_first: false,
            hfa: false,
            regular: false,
        }
    }

    /// Whether the parameter landed in registers at all.
    pub fn in_registers(&self) -> bool {
        self.gpr_count > 0 || self.vec_count > 0
    }
}

/// Everything the analyser derives from a signature: per-parameter register
/// assignments and exact frame-region sizes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbiPlan {
    pub ret: ParameterInfo,
    /// Primitive kind of the return type, for trampoline selection.
    pub ret_kind: PrimitiveKind,
    pub params: Vec<ParameterInfo>,
    /// Return goes through a caller-provided hidden pointer.
    pub ret_in_memory: bool,
    /// At least one vector register is consumed, so the trampoline variant
    /// that materialises the vector file must be used.
    pub use_vec: bool,
    pub frame: FrameLayout,
}

impl AbiPlan {
    /// Upper bound of overflow stack bytes (spec: `args_size`).
    pub fn args_size(&self) -> usize {
        self.frame.args_size
    }

    /// Storage for by-pointer aggregate copies (spec: `scratch_size`).
    pub fn scratch_size(&self) -> usize {
        self.frame.scratch_size
    }
}

/// The registers a native call may return values in, collected by the
/// trampoline. Backends fill only the parts their stub produces.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReturnBundle {
    /// `RAX:RDX` / `X0:X1`.
    pub gpr: [u64; 2],
    /// Raw bits of `XMM0:XMM1` / `V0..V3`.
    pub vec: [u64; 4],
}

/// One platform ABI: analyse once, pack per call, then jump blind.
pub trait AbiBackend {
    fn analyse(types: &TypeRegistry, ret: TypeId, params: &[TypeId]) -> Result<AbiPlan>;

    fn build_frame(
        types: &TypeRegistry,
        plan: &AbiPlan,
        args: &[Value],
        alloc: &TempAlloc,
        frame: &mut CallFrame<'_>,
    ) -> Result<()>;

    /// Invoke `func` through the trampoline matching the plan's return kind.
    ///
    /// # Safety
    /// `frame` must have been fully packed for `plan`, and `func` must be a
    /// C function matching the analysed signature.
    unsafe fn call(func: *const c_void, plan: &AbiPlan, frame: &CallFrame<'_>) -> ReturnBundle;
}

/// Analyse a signature with the host platform's backend.
pub fn analyse_host(types: &TypeRegistry, ret: TypeId, params: &[TypeId]) -> Result<AbiPlan> {
    #[cfg(all(target_arch = "x86_64", not(target_os = "windows")))]
    return x64_sysv::SysVX64::analyse(types, ret, params);
    #[cfg(all(target_arch = "x86_64", target_os = "windows"))]
    return x64_win::WinX64::analyse(types, ret, params);
    #[cfg(target_arch = "aarch64")]
    return aarch64::Aarch64::analyse(types, ret, params);
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    {
        let _ = (types, ret, params);
        Err(crate::error::FfiError::unsupported(
            "no ABI backend for this architecture",
        ))
    }
}

/// Reassemble an in-register aggregate return into contiguous bytes, in the
/// order the classification dictates (e.g. SysV `DI` = XMM0 then RAX).
fn return_register_bytes(ret: &ParameterInfo, bundle: &ReturnBundle) -> [u8; 16] {
    let mut buf = [0u8; 16];
    let (mut gi, mut vi, mut out) = (0usize, 0usize, 0usize);
    let order: &[bool] = match (ret.gpr_count, ret.vec_count) {
        (2, 0) => &[true, true],
        (0, 2) => &[false, false],
        (1, 1) if ret.gpr_first => &[true, false],
        (1, 1) => &[false, true],
        (1, 0) => &[true],
        (0, 1) => &[false],
        _ => &[],
    };
    for &is_gpr in order {
        let bits = if is_gpr {
            gi += 1;
            bundle.gpr[gi - 1]
        } else {
            vi += 1;
            bundle.vec[vi - 1]
        };
        buf[out..out + 8].copy_from_slice(&bits.to_le_bytes());
        out += 8;
    }
    buf
}

/// Map the return registers (or the hidden-return buffer) back to a managed
/// value using the return type descriptor.
///
/// # Safety
/// `ret_ptr` must point at the hidden-return buffer when the plan routed the
/// return through memory; string/pointer register contents must be what the
/// native callee actually produced.
pub unsafe fn dispatch_return(
    types: &TypeRegistry,
    ret: &ParameterInfo,
    ret_in_memory: bool,
    bundle: &ReturnBundle,
    ret_ptr: *const u8,
) -> Value {
    let info = types.get(ret.ty);
    let gpr0 = bundle.gpr[0];
    match info.primitive {
        PrimitiveKind::Void => Value::Null,
        PrimitiveKind::Bool => Value::Bool(gpr0 & 1 != 0),
        PrimitiveKind::Int8 => Value::Num(gpr0 as i8 as f64),
        PrimitiveKind::UInt8 => Value::Num(gpr0 as u8 as f64),
        PrimitiveKind::Int16 => Value::Num(gpr0 as i16 as f64),
        PrimitiveKind::UInt16 => Value::Num(gpr0 as u16 as f64),
        PrimitiveKind::Int32 => Value::Num(gpr0 as i32 as f64),
        PrimitiveKind::UInt32 => Value::Num(gpr0 as u32 as f64),
        PrimitiveKind::Int64 => Value::BigInt(gpr0 as i64 as i128),
        PrimitiveKind::UInt64 => Value::BigInt(gpr0 as i128),
        PrimitiveKind::Float32 => Value::Num(f32::from_bits(bundle.vec[0] as u32) as f64),
        PrimitiveKind::Float64 => Value::Num(f64::from_bits(bundle.vec[0])),
        PrimitiveKind::String => {
            if gpr0 == 0 {
                Value::Null
            } else {
                let cstr = std::ffi::CStr::from_ptr(gpr0 as *const std::os::raw::c_char);
                Value::Str(String::from_utf8_lossy(cstr.to_bytes()).into_owned())
            }
        }
        PrimitiveKind::Pointer => {
            let pointee = info.pointee.unwrap_or(ret.ty);
            Value::External(ExternalPtr::new(gpr0, pointee))
        }
        PrimitiveKind::Record => {
            if ret_in_memory {
                pop_record(ret_ptr, ret.ty, types)
            } else if ret.hfa {
                aarch64::pop_hfa(&bundle.vec, ret.ty, types)
            } else {
                let buf = return_register_bytes(ret, bundle);
                pop_record(buf.as_ptr(), ret.ty, types)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RecordMember;

    #[test]
    fn uint64_return_is_exact() {
        let reg = TypeRegistry::with_builtins();
        let ret = ParameterInfo {
            gpr_count: 1,
            ..ParameterInfo::new(reg.lookup("uint64").unwrap())
        };
        let bundle = ReturnBundle {
            gpr: [u64::MAX, 0],
            ..Default::default()
        };
        let v = unsafe { dispatch_return(&reg, &ret, false, &bundle, std::ptr::null()) };
        assert_eq!(v, Value::BigInt(u64::MAX as i128));
    }

    #[test]
    fn int32_return_sign_extends() {
        let reg = TypeRegistry::with_builtins();
        let ret = ParameterInfo {
            gpr_count: 1,
            ..ParameterInfo::new(reg.lookup("int32").unwrap())
        };
        // Upper half full of garbage, as a real callee may leave it.
        let bundle = ReturnBundle {
            gpr: [0xdead_beef_ffff_fffe, 0],
            ..Default::default()
        };
        let v = unsafe { dispatch_return(&reg, &ret, false, &bundle, std::ptr::null()) };
        assert_eq!(v, Value::Num(-2.0));
    }

    #[test]
    fn bool_return_reads_low_bit() {
        let reg = TypeRegistry::with_builtins();
        let ret = ParameterInfo {
            gpr_count: 1,
            ..ParameterInfo::new(reg.lookup("bool").unwrap())
        };
        let bundle = ReturnBundle { gpr: [0x100, 0], ..Default::default() };
        let v = unsafe { dispatch_return(&reg, &ret, false, &bundle, std::ptr::null()) };
        assert_eq!(v, Value::Bool(false));
    }

    #[test]
    fn mixed_register_return_reassembles_in_class_order() {
        let mut reg = TypeRegistry::with_builtins();
        // { int64; double } -> INTEGER then SSE eightbytes.
        let id = reg.declare_record("RetMix").unwrap();
        reg.complete_record(
            id,
            vec![
                RecordMember { name: "n".into(), ty: reg.lookup("int64").unwrap() },
                RecordMember { name: "x".into(), ty: reg.lookup("double").unwrap() },
            ],
        )
        .unwrap();

        let ret = ParameterInfo {
            gpr_count: 1,
            vec_count: 1,
            gpr_first: true,
            ..ParameterInfo::new(id)
        };
        let bundle = ReturnBundle {
            gpr: [41, 0],
            vec: [2.5f64.to_bits(), 0, 0, 0],
        };
        let v = unsafe { dispatch_return(&reg, &ret, false, &bundle, std::ptr::null()) };
        let rec = v.as_record().unwrap();
        assert_eq!(rec.get("n"), Some(&Value::BigInt(41)));
        assert_eq!(rec.get("x"), Some(&Value::Num(2.5)));
    }
}
