//! Byte-exact packing tests for all three backends.
//!
//! Frames are packed into a poisoned call stack and inspected raw: register
//! slots, overflow bytes and scratch copies must land exactly where the
//! trampoline (and the callee behind it) will read them, and nothing
//! outside the prepared regions may be written.

use std::ffi::CStr;

use tether_ffi::abi::aarch64::Aarch64;
use tether_ffi::abi::x64_sysv::SysVX64;
use tether_ffi::abi::x64_win::WinX64;
use tether_ffi::{
    AbiPlan, CallFrame, CallStack, ExternalPtr, RecordMember, TempAlloc, TypeId, TypeRegistry,
    Value,
};
use tether_value::record;

fn registry() -> TypeRegistry {
    TypeRegistry::with_builtins()
}

fn define(reg: &mut TypeRegistry, name: &str, members: &[(&str, &str)]) -> TypeId {
    let id = reg.declare_record(name).unwrap();
    let members = members
        .iter()
        .map(|(fname, tname)| RecordMember {
            name: fname.to_string(),
            ty: reg.lookup(tname).unwrap(),
        })
        .collect();
    reg.complete_record(id, members).unwrap();
    id
}

const POISON: u8 = 0xAA;

/// Poison the whole stack, carve, pack. Returns the prepared frame.
fn pack<'a, F>(
    stack: &'a CallStack,
    reg: &TypeRegistry,
    plan: &AbiPlan,
    args: &[Value],
    alloc: &TempAlloc,
    build: F,
) -> CallFrame<'a>
where
    F: FnOnce(&TypeRegistry, &AbiPlan, &[Value], &TempAlloc, &mut CallFrame<'_>) -> tether_ffi::Result<()>,
{
    let lease = stack.lease().unwrap();
    unsafe { std::ptr::write_bytes(lease.base(), POISON, lease.len()) };
    let mut frame = CallFrame::carve(lease, &plan.frame).unwrap();
    build(reg, plan, args, alloc, &mut frame).unwrap();
    frame
}

unsafe fn slot(frame: &CallFrame<'_>, index: usize) -> u64 {
    frame.sp().cast::<u64>().add(index).read()
}

/// The packer must not have written a single byte below the frame.
unsafe fn assert_below_untouched(frame: &CallFrame<'_>) {
    let below = std::slice::from_raw_parts(frame.sp().sub(256), 256);
    assert!(below.iter().all(|&b| b == POISON));
}

mod sysv {
    use super::*;

    // Register file: GPR slots 0..6, XMM slots 6..14, overflow from 14.
    const XMM0: usize = 6;
    const OVERFLOW: usize = 14;

    #[test]
    fn scalars_land_in_their_registers() {
        let mut reg = registry();
        let int32 = reg.lookup("int32").unwrap();
        let p_int = reg.pointer_to(int32);
        let void = reg.lookup("void").unwrap();
        let params = vec![int32, reg.lookup("double").unwrap(), reg.lookup("string").unwrap(),
                          reg.lookup("bool").unwrap(), p_int];
        let plan = SysVX64::analyse(&reg, void, &params).unwrap();

        let stack = CallStack::new();
        let alloc = TempAlloc::new();
        let args = [
            Value::Num(42.0),
            Value::Num(2.5),
            Value::Str("hi".into()),
            Value::Bool(true),
            Value::External(ExternalPtr::new(0xdead_beef_0, int32)),
        ];
        let frame = pack(&stack, &reg, &plan, &args, &alloc, SysVX64::build_frame);

        unsafe {
            assert_eq!(slot(&frame, 0), 42);
            assert_eq!(slot(&frame, XMM0), 2.5f64.to_bits());
            let s = CStr::from_ptr(slot(&frame, 1) as *const _);
            assert_eq!(s.to_str().unwrap(), "hi");
            assert_eq!(slot(&frame, 2), 1);
            assert_eq!(slot(&frame, 3), 0xdead_beef_0);
            assert_below_untouched(&frame);
        }
    }

    #[test]
    fn seventh_integer_spills_to_overflow() {
        let reg = registry();
        let i64t = reg.lookup("int64").unwrap();
        let void = reg.lookup("void").unwrap();
        let params = vec![i64t; 7];
        let plan = SysVX64::analyse(&reg, void, &params).unwrap();
        assert_eq!(plan.args_size(), 8);

        let stack = CallStack::new();
        let alloc = TempAlloc::new();
        let args: Vec<Value> = (1..=7).map(|n| Value::BigInt(n)).collect();
        let frame = pack(&stack, &reg, &plan, &args, &alloc, SysVX64::build_frame);

        unsafe {
            for g in 0..6 {
                assert_eq!(slot(&frame, g), g as u64 + 1);
            }
            assert_eq!(slot(&frame, OVERFLOW), 7);
            assert_below_untouched(&frame);
        }
    }

    #[test]
    fn int_pair_packs_into_one_gpr() {
        let mut reg = registry();
        let pair = define(&mut reg, "PkPair", &[("a", "int32"), ("b", "int32")]);
        let int32 = reg.lookup("int32").unwrap();
        let plan = SysVX64::analyse(&reg, int32, &[pair]).unwrap();

        let stack = CallStack::new();
        let alloc = TempAlloc::new();
        let args = [record! { "a" => 7.0, "b" => 35.0 }];
        let frame = pack(&stack, &reg, &plan, &args, &alloc, SysVX64::build_frame);

        unsafe {
            assert_eq!(slot(&frame, 0), (35u64 << 32) | 7);
            assert_below_untouched(&frame);
        }
    }

    #[test]
    fn mixed_sixteen_byte_splits_across_files() {
        let mut reg = registry();
        let mix = define(&mut reg, "PkMix", &[("n", "int64"), ("x", "double")]);
        let void = reg.lookup("void").unwrap();
        let plan = SysVX64::analyse(&reg, void, &[mix]).unwrap();

        let stack = CallStack::new();
        let alloc = TempAlloc::new();
        let args = [record! { "n" => 41.0, "x" => 2.5 }];
        let frame = pack(&stack, &reg, &plan, &args, &alloc, SysVX64::build_frame);

        unsafe {
            assert_eq!(slot(&frame, 0), 41);
            assert_eq!(slot(&frame, XMM0), 2.5f64.to_bits());
        }
    }

    #[test]
    fn large_struct_serialised_to_overflow_with_hidden_return() {
        let mut reg = registry();
        let big = define(
            &mut reg,
            "PkBig",
            &[("x", "double"), ("y", "double"), ("z", "double"), ("w", "double"), ("tag", "int64")],
        );
        let plan = SysVX64::analyse(&reg, big, &[big]).unwrap();
        assert!(plan.ret_in_memory);

        let stack = CallStack::new();
        let alloc = TempAlloc::new();
        let args = [record! {
            "x" => 1.0, "y" => 2.0, "z" => 3.0, "w" => 4.0, "tag" => 5_i64,
        }];
        let frame = pack(&stack, &reg, &plan, &args, &alloc, SysVX64::build_frame);

        unsafe {
            // Hidden return pointer in the first integer register.
            assert_eq!(slot(&frame, 0), frame.ret_ptr() as u64);
            // The 40 payload bytes sit in the overflow area.
            let overflow = frame.sp().add(OVERFLOW * 8);
            for (i, expect) in [1.0f64, 2.0, 3.0, 4.0].iter().enumerate() {
                assert_eq!(overflow.add(i * 8).cast::<f64>().read(), *expect);
            }
            assert_eq!(overflow.add(32).cast::<i64>().read(), 5);
            assert_below_untouched(&frame);
        }
    }

    #[test]
    fn marshalling_error_aborts_before_call_and_releases_lease() {
        let mut reg = registry();
        let int32 = reg.lookup("int32").unwrap();
        let double = reg.lookup("double").unwrap();
        let p_int = reg.pointer_to(int32);
        let void = reg.lookup("void").unwrap();
        let plan = SysVX64::analyse(&reg, void, &[p_int]).unwrap();

        let stack = CallStack::new();
        let alloc = TempAlloc::new();
        {
            let lease = stack.lease().unwrap();
            let mut frame = CallFrame::carve(lease, &plan.frame).unwrap();
            let wrong_tag = [Value::External(ExternalPtr::new(0x10, double))];
            let err =
                SysVX64::build_frame(&reg, &plan, &wrong_tag, &alloc, &mut frame).unwrap_err();
            assert!(err.to_string().contains("argument 0"));
        }
        // Frame dropped: the stack is leasable again.
        assert!(stack.lease().is_ok());
    }
}

mod win64 {
    use super::*;

    #[test]
    fn slot_layout_with_hidden_return_and_scratch_copy() {
        let mut reg = registry();
        let wide = define(&mut reg, "PkW16", &[("a", "int64"), ("b", "int64")]);
        let params = vec![
            reg.lookup("int32").unwrap(),
            reg.lookup("double").unwrap(),
            wide,
            reg.lookup("string").unwrap(),
        ];
        let plan = WinX64::analyse(&reg, wide, &params).unwrap();
        assert!(plan.ret_in_memory);
        assert_eq!(plan.args_size(), 40);

        let stack = CallStack::new();
        let alloc = TempAlloc::new();
        let args = [
            Value::Num(7.0),
            Value::Num(1.5),
            record! { "a" => 11_i64, "b" => 12_i64 },
            Value::Str("s".into()),
        ];
        let frame = pack(&stack, &reg, &plan, &args, &alloc, WinX64::build_frame);

        unsafe {
            assert_eq!(slot(&frame, 0), frame.ret_ptr() as u64);
            assert_eq!(slot(&frame, 1), 7);
            assert_eq!(slot(&frame, 2), 1.5f64.to_bits());
            // The irregular aggregate went into scratch; the slot holds the
            // copy's address.
            let copy = slot(&frame, 3) as *const i64;
            assert_eq!(copy.read(), 11);
            assert_eq!(copy.add(1).read(), 12);
            let s = CStr::from_ptr(slot(&frame, 4) as *const _);
            assert_eq!(s.to_str().unwrap(), "s");
            assert_below_untouched(&frame);
        }
    }

    #[test]
    fn regular_record_packs_into_its_slot() {
        let mut reg = registry();
        let pair = define(&mut reg, "PkWPair", &[("a", "int32"), ("b", "int32")]);
        let int32 = reg.lookup("int32").unwrap();
        let plan = WinX64::analyse(&reg, int32, &[pair]).unwrap();

        let stack = CallStack::new();
        let alloc = TempAlloc::new();
        let args = [record! { "a" => 7.0, "b" => 35.0 }];
        let frame = pack(&stack, &reg, &plan, &args, &alloc, WinX64::build_frame);

        unsafe {
            assert_eq!(slot(&frame, 0), (35u64 << 32) | 7);
        }
    }
}

mod aapcs64 {
    use super::*;

    // Register file: X0..X7 slots 0..8, X8 slot 8, pad, V0..V7 slots 10..18.
    const X8: usize = 8;
    const V0: usize = 10;

    #[test]
    fn hfa_occupies_one_vector_slot_per_member() {
        let mut reg = registry();
        let vec4 = define(
            &mut reg,
            "PkVec4",
            &[("x", "float"), ("y", "float"), ("z", "float"), ("w", "float")],
        );
        let pair = define(&mut reg, "PkAPair", &[("a", "int32"), ("b", "int32")]);
        let big = define(
            &mut reg,
            "PkABig",
            &[("x", "double"), ("y", "double"), ("z", "double"), ("w", "double"), ("tag", "int64")],
        );
        let params = vec![vec4, reg.lookup("float").unwrap(), pair, big];
        let void = reg.lookup("void").unwrap();
        let plan = Aarch64::analyse(&reg, void, &params).unwrap();

        let stack = CallStack::new();
        let alloc = TempAlloc::new();
        let args = [
            record! { "x" => 1.0, "y" => 2.0, "z" => 3.0, "w" => 4.0 },
            Value::Num(0.5),
            record! { "a" => 7.0, "b" => 35.0 },
            record! { "x" => 1.0, "y" => 2.0, "z" => 3.0, "w" => 4.0, "tag" => 5_i64 },
        ];
        let frame = pack(&stack, &reg, &plan, &args, &alloc, Aarch64::build_frame);

        unsafe {
            // One float member per vector slot, stride 8.
            for (i, expect) in [1.0f32, 2.0, 3.0, 4.0].iter().enumerate() {
                assert_eq!(slot(&frame, V0 + i) as u32, expect.to_bits());
            }
            // The scalar float lands in the next free vector register.
            assert_eq!(slot(&frame, V0 + 4) as u32, 0.5f32.to_bits());
            // The 8-byte pair takes one GPR.
            assert_eq!(slot(&frame, 0), (35u64 << 32) | 7);
            // The big aggregate went by pointer into scratch.
            let copy = slot(&frame, 1) as *const u8;
            assert_eq!(copy.cast::<f64>().read(), 1.0);
            assert_eq!(copy.add(32).cast::<i64>().read(), 5);
            assert_below_untouched(&frame);
        }
    }

    #[test]
    fn sixteen_byte_aggregate_fills_two_gprs() {
        let mut reg = registry();
        let wide = define(&mut reg, "PkA16", &[("a", "int64"), ("b", "int64")]);
        let void = reg.lookup("void").unwrap();
        let plan = Aarch64::analyse(&reg, void, &[wide]).unwrap();

        let stack = CallStack::new();
        let alloc = TempAlloc::new();
        let args = [record! { "a" => 11_i64, "b" => 12_i64 }];
        let frame = pack(&stack, &reg, &plan, &args, &alloc, Aarch64::build_frame);

        unsafe {
            assert_eq!(slot(&frame, 0), 11);
            assert_eq!(slot(&frame, 1), 12);
        }
    }

    #[test]
    fn hidden_return_address_parks_in_x8() {
        let mut reg = registry();
        let big = define(
            &mut reg,
            "PkABigRet",
            &[("x", "double"), ("y", "double"), ("z", "double"), ("w", "double"), ("tag", "int64")],
        );
        let plan = Aarch64::analyse(&reg, big, &[]).unwrap();
        assert!(plan.ret_in_memory);

        let stack = CallStack::new();
        let alloc = TempAlloc::new();
        let frame = pack(&stack, &reg, &plan, &[], &alloc, Aarch64::build_frame);

        unsafe {
            assert_eq!(slot(&frame, X8), frame.ret_ptr() as u64);
            assert_below_untouched(&frame);
        }
    }

    #[test]
    fn ninth_integer_goes_to_exact_stack_slot() {
        let reg = registry();
        let i64t = reg.lookup("int64").unwrap();
        let void = reg.lookup("void").unwrap();
        let params = vec![i64t; 9];
        let plan = Aarch64::analyse(&reg, void, &params).unwrap();
        assert_eq!(plan.args_size(), 8);

        let stack = CallStack::new();
        let alloc = TempAlloc::new();
        let args: Vec<Value> = (1..=9).map(Value::BigInt).collect();
        let frame = pack(&stack, &reg, &plan, &args, &alloc, Aarch64::build_frame);

        unsafe {
            for g in 0..8 {
                assert_eq!(slot(&frame, g), g as u64 + 1);
            }
            // Overflow area starts right above the 18-slot register file.
            assert_eq!(slot(&frame, 18), 9);
        }
    }
}
