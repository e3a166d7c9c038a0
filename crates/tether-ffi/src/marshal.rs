//! Serialising managed values into raw C memory and back.
//!
//! `push_record`/`pop_record` walk a record type's members in declaration
//! order, aligning to each member before reading or writing it. The scalar
//! helpers here are also used by the frame builders for top-level arguments,
//! so conversion rules live in exactly one place:
//!
//! - booleans become one byte, 0 or 1
//! - integer kinds accept numbers or bigints, truncated to 64 bits, and the
//!   low `size` bytes are stored little-endian
//! - floats accept numbers or bigints and store IEEE 754 bytes
//! - strings are copied into the per-call arena as nul-terminated UTF-8
//! - pointers require an external handle whose tag matches the pointee type

use std::fmt;
use std::os::raw::c_char;

use tether_value::{ExternalPtr, Value};

use crate::alloc::TempAlloc;
use crate::error::{FfiError, Result};
use crate::types::{PrimitiveKind, TypeId, TypeRegistry};
use crate::util::{align_up_const, align_up_ptr};

/// Where a value came from, for error messages.
#[derive(Clone, Copy)]
pub enum ValueCtx<'a> {
    Arg(usize),
    Field(&'a str),
}

impl fmt::Display for ValueCtx<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueCtx::Arg(i) => write!(f, "argument {i}"),
            ValueCtx::Field(name) => write!(f, "field '{name}'"),
        }
    }
}

fn wrong_kind(value: &Value, expected: &str, ctx: ValueCtx<'_>) -> FfiError {
    FfiError::mismatch(format!(
        "unexpected {} value for {}, expected {}",
        value.kind_name(),
        ctx,
        expected
    ))
}

pub(crate) fn expect_bool(value: &Value, ctx: ValueCtx<'_>) -> Result<bool> {
    value.as_bool().ok_or_else(|| wrong_kind(value, "boolean", ctx))
}

/// Check that an argument is a record value before serialising it.
pub(crate) fn expect_record_kind(value: &Value, ctx: ValueCtx<'_>) -> Result<()> {
    value
        .as_record()
        .map(|_| ())
        .ok_or_else(|| wrong_kind(value, "object", ctx))
}

pub(crate) fn int_bits(value: &Value, ctx: ValueCtx<'_>) -> Result<u64> {
    value.as_int_bits().ok_or_else(|| wrong_kind(value, "number", ctx))
}

pub(crate) fn float64(value: &Value, ctx: ValueCtx<'_>) -> Result<f64> {
    value.as_f64().ok_or_else(|| wrong_kind(value, "number", ctx))
}

pub(crate) fn float32(value: &Value, ctx: ValueCtx<'_>) -> Result<f32> {
    value.as_f32().ok_or_else(|| wrong_kind(value, "number", ctx))
}

pub(crate) fn c_string(
    value: &Value,
    alloc: &TempAlloc,
    ctx: ValueCtx<'_>,
) -> Result<*const c_char> {
    let s = value.as_str().ok_or_else(|| wrong_kind(value, "string", ctx))?;
    Ok(alloc.push_cstr(s))
}

/// Check an external handle against the expected pointee type and return its
/// raw address.
pub(crate) fn external_addr(
    value: &Value,
    expected_pointee: TypeId,
    types: &TypeRegistry,
    ctx: ValueCtx<'_>,
) -> Result<u64> {
    let ext: ExternalPtr = value
        .as_external()
        .ok_or_else(|| wrong_kind(value, "external", ctx))?;
    if ext.tag != expected_pointee {
        return Err(FfiError::mismatch(format!(
            "pointer tag mismatch for {}: got '{}', expected '{}'",
            ctx,
            types.get(ext.tag).name,
            types.get(expected_pointee).name
        )));
    }
    Ok(ext.addr)
}

/// Store the low `size` bytes of `bits`, little-endian.
///
/// # Safety
/// `dest` must be valid for `size` bytes.
pub(crate) unsafe fn write_scalar(dest: *mut u8, bits: u64, size: usize) {
    let bytes = bits.to_le_bytes();
    std::ptr::copy_nonoverlapping(bytes.as_ptr(), dest, size);
}

/// Serialise a record value into `dest` according to its type layout.
///
/// # Safety
/// `dest` must be valid for `types.get(ty).size` bytes and aligned to the
/// record's alignment.
pub unsafe fn push_record(
    value: &Value,
    ty: TypeId,
    types: &TypeRegistry,
    alloc: &TempAlloc,
    dest: *mut u8,
) -> Result<()> {
    let info = types.get(ty);
    let record = value
        .as_record()
        .ok_or_else(|| wrong_kind(value, "object", ValueCtx::Field(&info.name)))?;

    let mut ptr = dest;
    for member in &info.members {
        let mt = types.get(member.ty);
        let field = record.get(&member.name).ok_or_else(|| {
            FfiError::mismatch(format!(
                "missing field '{}' for record '{}'",
                member.name, info.name
            ))
        })?;
        ptr = align_up_ptr(ptr, mt.align);
        push_member(field, member.ty, types, alloc, ptr, ValueCtx::Field(&member.name))?;
        ptr = ptr.add(mt.size);
    }
    Ok(())
}

/// Serialise one value of type `ty` at `dest` (already aligned).
///
/// # Safety
/// `dest` must be valid for `types.get(ty).size` bytes and aligned for `ty`.
pub(crate) unsafe fn push_member(
    value: &Value,
    ty: TypeId,
    types: &TypeRegistry,
    alloc: &TempAlloc,
    dest: *mut u8,
    ctx: ValueCtx<'_>,
) -> Result<()> {
    let info = types.get(ty);
    match info.primitive {
        PrimitiveKind::Void => Err(FfiError::mismatch(format!(
            "type void cannot be used for {ctx}"
        ))),
        PrimitiveKind::Bool => {
            *dest = expect_bool(value, ctx)? as u8;
            Ok(())
        }
        k if k.is_integer() => {
            write_scalar(dest, int_bits(value, ctx)?, info.size);
            Ok(())
        }
        PrimitiveKind::Float32 => {
            write_scalar(dest, float32(value, ctx)?.to_bits() as u64, 4);
            Ok(())
        }
        PrimitiveKind::Float64 => {
            write_scalar(dest, float64(value, ctx)?.to_bits(), 8);
            Ok(())
        }
        PrimitiveKind::String => {
            let str_ptr = c_string(value, alloc, ctx)?;
            write_scalar(dest, str_ptr as u64, 8);
            Ok(())
        }
        PrimitiveKind::Pointer => {
            let pointee = info.pointee.unwrap_or(ty);
            let addr = external_addr(value, pointee, types, ctx)?;
            write_scalar(dest, addr, 8);
            Ok(())
        }
        PrimitiveKind::Record => push_record(value, ty, types, alloc, dest),
        _ => unreachable!("integer kinds handled above"),
    }
}

/// Deserialise a record of type `ty` from raw memory.
///
/// Integers up to 32 bits become numbers; 64-bit integers become exact
/// bigints. Pointers come back as tagged external handles.
///
/// # Safety
/// `ptr` must be valid for `types.get(ty).size` bytes of initialised memory
/// laid out as the record type describes.
pub unsafe fn pop_record(ptr: *const u8, ty: TypeId, types: &TypeRegistry) -> Value {
    let info = types.get(ty);
    let mut record = tether_value::RecordValue::new();
    let mut cursor = ptr;
    for member in &info.members {
        let mt = types.get(member.ty);
        cursor = align_up_const(cursor, mt.align);
        record.set(member.name.clone(), pop_member(cursor, member.ty, types));
        cursor = cursor.add(mt.size);
    }
    Value::Record(record)
}

/// Deserialise one value of type `ty` from `ptr` (already aligned).
///
/// # Safety
/// `ptr` must be valid for `types.get(ty).size` bytes of initialised memory.
pub(crate) unsafe fn pop_member(ptr: *const u8, ty: TypeId, types: &TypeRegistry) -> Value {
    let info = types.get(ty);
    match info.primitive {
        PrimitiveKind::Void => Value::Null,
        PrimitiveKind::Bool => Value::Bool(*ptr != 0),
        PrimitiveKind::Int8 => Value::Num(ptr.cast::<i8>().read_unaligned() as f64),
        PrimitiveKind::UInt8 => Value::Num(*ptr as f64),
        PrimitiveKind::Int16 => Value::Num(ptr.cast::<i16>().read_unaligned() as f64),
        PrimitiveKind::UInt16 => Value::Num(ptr.cast::<u16>().read_unaligned() as f64),
        PrimitiveKind::Int32 => Value::Num(ptr.cast::<i32>().read_unaligned() as f64),
        PrimitiveKind::UInt32 => Value::Num(ptr.cast::<u32>().read_unaligned() as f64),
        PrimitiveKind::Int64 => Value::BigInt(ptr.cast::<i64>().read_unaligned() as i128),
        PrimitiveKind::UInt64 => Value::BigInt(ptr.cast::<u64>().read_unaligned() as i128),
        PrimitiveKind::Float32 => Value::Num(ptr.cast::<f32>().read_unaligned() as f64),
        PrimitiveKind::Float64 => Value::Num(ptr.cast::<f64>().read_unaligned()),
        PrimitiveKind::String => {
            let addr = ptr.cast::<u64>().read_unaligned();
            if addr == 0 {
                Value::Null
            } else {
                let cstr = std::ffi::CStr::from_ptr(addr as *const c_char);
                Value::Str(String::from_utf8_lossy(cstr.to_bytes()).into_owned())
            }
        }
        PrimitiveKind::Pointer => {
            let addr = ptr.cast::<u64>().read_unaligned();
            let pointee = info.pointee.unwrap_or(ty);
            Value::External(ExternalPtr::new(addr, pointee))
        }
        PrimitiveKind::Record => pop_record(ptr, ty, types),
    }
}
