//! Dynamic foreign-function bridge for managed runtimes.
//!
//! Given a shared-library path and a table of
//! `{name: [returnType, [paramTypes...]]}` signatures, this crate resolves
//! each symbol and produces a callable that marshals managed
//! [`Value`](tether_value::Value)s into the exact register/stack layout the
//! host C ABI requires, jumps through a hand-written trampoline, and maps
//! the return registers back to a managed value.
//!
//! ```no_run
//! use tether_ffi::{load, Signature, Value};
//!
//! let funcs = load(
//!     None, // the current process
//!     &[("strlen", Signature::new("uint64", vec!["string".into()]))],
//! )?;
//! let n = funcs["strlen"].invoke(&[Value::Str("hello".into())])?;
//! assert_eq!(n, Value::BigInt(5));
//! # Ok::<(), tether_ffi::FfiError>(())
//! ```
//!
//! Struct parameters and returns follow the platform rules bit-exactly:
//! eightbyte classification on System V AMD64, `regular`/hidden-pointer
//! passing on Win64, and HFA/`X8` handling on AArch64. See the [`abi`]
//! module for the three backends.
//!
//! One call borrows its library's call stack and temp allocator
//! exclusively; a second call on the same library while one is in flight
//! fails fast instead of corrupting the frame.

pub mod abi;
mod alloc;
mod bridge;
mod error;
mod frame;
mod library;
mod marshal;
mod types;
mod util;

pub use tether_value::{ExternalPtr, RecordValue, Value};

pub use abi::{dispatch_return, AbiBackend, AbiPlan, ParameterInfo, ReturnBundle};
pub use alloc::{CallStack, StackLease, TempAlloc, TempAllocGuard, CALL_STACK_SIZE};
pub use bridge::{
    bind, define_struct, load, pointer_to, type_id, type_name, FunctionInfo, NativeFunction,
    Signature, TypeRef,
};
pub use error::{FfiError, Result};
pub use frame::{CallFrame, FrameLayout};
pub use library::{LibraryData, NativeLibrary};
pub use marshal::{pop_record, push_record};
pub use types::{
    with_types, with_types_mut, PrimitiveKind, RecordMember, TypeId, TypeInfo, TypeRegistry,
    POINTER_SIZE,
};
