//! The embedding surface: struct definition, pointer types and library
//! loading, plus the callable wrapper that runs a native invocation end to
//! end.

use std::collections::HashMap;
use std::fmt;
use std::os::raw::c_void;
use std::path::Path;
use std::sync::Arc;

use tether_value::Value;

use crate::abi::{analyse_host, AbiPlan};
use crate::alloc::TempAllocGuard;
use crate::error::{FfiError, Result};
use crate::frame::CallFrame;
use crate::library::LibraryData;
use crate::types::{with_types, with_types_mut, TypeId, TypeRegistry};

/// A type mentioned in a signature or struct definition: either a
/// registered name or a handle obtained earlier.
///
/// Names accept trailing `*`s (`"int32 *"`, `"Node*"`), creating the
/// pointer type on first use.
#[derive(Debug, Clone, Copy)]
pub enum TypeRef<'a> {
    Name(&'a str),
    Id(TypeId),
}

impl<'a> From<&'a str> for TypeRef<'a> {
    fn from(name: &'a str) -> Self {
        TypeRef::Name(name)
    }
}

impl From<TypeId> for TypeRef<'_> {
    fn from(id: TypeId) -> Self {
        TypeRef::Id(id)
    }
}

/// A function signature: return type plus parameter types, in order.
#[derive(Debug, Clone)]
pub struct Signature<'a> {
    pub ret: TypeRef<'a>,
    pub params: Vec<TypeRef<'a>>,
}

impl<'a> Signature<'a> {
    pub fn new(ret: impl Into<TypeRef<'a>>, params: Vec<TypeRef<'a>>) -> Self {
        Signature {
            ret: ret.into(),
            params,
        }
    }
}

fn resolve_name(types: &mut TypeRegistry, name: &str) -> Result<TypeId> {
    let name = name.trim();
    if let Some(id) = types.lookup(name) {
        return Ok(id);
    }
    if let Some(inner) = name.strip_suffix('*') {
        let inner_id = resolve_name(types, inner)?;
        return Ok(types.pointer_to(inner_id));
    }
    Err(FfiError::mismatch(format!("unknown type '{name}'")))
}

fn resolve_ref(types: &mut TypeRegistry, r: &TypeRef<'_>) -> Result<TypeId> {
    match r {
        TypeRef::Id(id) if (id.0 as usize) < types.len() => Ok(*id),
        TypeRef::Id(_) => Err(FfiError::mismatch("stale type handle")),
        TypeRef::Name(name) => resolve_name(types, name),
    }
}

/// Define a record type. Member order is field order.
///
/// A member may point at the record being defined
/// (`define_struct("Node", &[("next", "Node *".into())])`).
pub fn define_struct(name: &str, members: &[(&str, TypeRef<'_>)]) -> Result<TypeId> {
    with_types_mut(|types| {
        let id = types.declare_record(name)?;
        let mut resolved = Vec::with_capacity(members.len());
        for (member_name, r) in members {
            let ty = match resolve_ref(types, r) {
                Ok(ty) => ty,
                Err(e) => {
                    // Roll the reserved name back so the definition can be
                    // retried.
                    types.complete_record(id, Vec::new()).ok();
                    return Err(e);
                }
            };
            resolved.push(crate::types::RecordMember {
                name: member_name.to_string(),
                ty,
            });
        }
        types.complete_record(id, resolved)?;
        Ok(id)
    })
}

/// The pointer-to-`ty` type.
pub fn pointer_to(ty: TypeRef<'_>) -> Result<TypeId> {
    with_types_mut(|types| {
        let inner = resolve_ref(types, &ty)?;
        Ok(types.pointer_to(inner))
    })
}

/// Look up a registered type by name.
pub fn type_id(name: &str) -> Option<TypeId> {
    with_types(|types| types.lookup(name))
}

/// The registered name of a type handle.
pub fn type_name(id: TypeId) -> String {
    with_types(|types| types.get(id).name.clone())
}

/// ABI-analysed symbol bound to its owning library.
pub struct FunctionInfo {
    pub name: String,
    pub func: *const c_void,
    pub lib: Arc<LibraryData>,
    pub plan: AbiPlan,
}

/// A callable produced by [`load`] or [`bind`].
///
/// Holds shared ownership of its library, so the module stays loaded for as
/// long as any of its callables is alive.
pub struct NativeFunction {
    info: FunctionInfo,
}

impl fmt::Debug for NativeFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeFunction")
            .field("name", &self.info.name)
            .finish()
    }
}

impl NativeFunction {
    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn plan(&self) -> &AbiPlan {
        &self.info.plan
    }

    /// Marshal `args`, call the native function, and convert the result.
    ///
    /// The call borrows the library's call stack and temp allocator for its
    /// whole duration; both are released on every exit path. No call is
    /// attempted once any argument fails to marshal.
    pub fn invoke(&self, args: &[Value]) -> Result<Value> {
        with_types(|types| self.invoke_with(types, args))
    }

    #[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
    fn invoke_with(&self, types: &TypeRegistry, args: &[Value]) -> Result<Value> {
        use crate::abi::{dispatch_return, AbiBackend, HostAbi};

        let plan = &self.info.plan;
        if args.len() != plan.params.len() {
            return Err(FfiError::mismatch(format!(
                "expected {} arguments, got {}",
                plan.params.len(),
                args.len()
            )));
        }

        let lib = &self.info.lib;
        let _tmp = TempAllocGuard(&lib.tmp_alloc);
        let lease = lib.call_stack.lease()?;
        let mut frame = CallFrame::carve(lease, &plan.frame)?;
        HostAbi::build_frame(types, plan, args, &lib.tmp_alloc, &mut frame)?;
        frame.dump(&self.info.name);

        let bundle = unsafe { HostAbi::call(self.info.func, plan, &frame) };
        let value = unsafe {
            dispatch_return(types, &plan.ret, plan.ret_in_memory, &bundle, frame.ret_ptr())
        };
        Ok(value)
    }

    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    fn invoke_with(&self, _types: &TypeRegistry, _args: &[Value]) -> Result<Value> {
        Err(FfiError::unsupported(
            "no ABI backend for this architecture",
        ))
    }
}

fn build_function(
    types: &mut TypeRegistry,
    name: &str,
    func: *const c_void,
    lib: Arc<LibraryData>,
    sig: &Signature<'_>,
) -> Result<NativeFunction> {
    let ret = resolve_ref(types, &sig.ret)?;
    let params = sig
        .params
        .iter()
        .map(|r| resolve_ref(types, r))
        .collect::<Result<Vec<_>>>()?;
    let plan = analyse_host(types, ret, &params)?;
    log::debug!(
        "bound '{}' ({} params, {} overflow bytes, {} scratch bytes)",
        name,
        plan.params.len(),
        plan.args_size(),
        plan.scratch_size()
    );
    Ok(NativeFunction {
        info: FunctionInfo {
            name: name.to_string(),
            func,
            lib,
            plan,
        },
    })
}

/// Load a shared library (or bind the current process when `path` is
/// `None`) and produce one callable per signature-table entry.
///
/// On any failure the whole batch is discarded.
pub fn load(
    path: Option<&Path>,
    signatures: &[(&str, Signature<'_>)],
) -> Result<HashMap<String, NativeFunction>> {
    let lib = LibraryData::open(path)?;
    with_types_mut(|types| {
        let mut out = HashMap::new();
        for (name, sig) in signatures {
            let func = lib.library.resolve(name)?;
            let callable = build_function(types, name, func, Arc::clone(&lib), sig)?;
            out.insert(name.to_string(), callable);
        }
        Ok(out)
    })
}

/// Bind a callable to an already-resolved symbol address.
///
/// This is the seam for embedders that run their own symbol resolution; the
/// callable gets a private call stack bound to the current-process handle.
///
/// The address must be a C function of the given signature; the check is
/// entirely on the caller, exactly as with [`load`].
pub fn bind(name: &str, func: *const c_void, sig: &Signature<'_>) -> Result<NativeFunction> {
    let lib = LibraryData::open(None)?;
    with_types_mut(|types| build_function(types, name, func, lib, sig))
}
