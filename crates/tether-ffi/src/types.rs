//! Runtime type descriptors and the process-wide type registry.
//!
//! Types are immutable after construction and live for the whole process in
//! an append-only arena; a [`TypeId`] is an index into that arena. Records
//! carry their members in declaration order, and field offsets are always
//! recomputed by stepping through the members with their alignment, so no
//! offsets need to be stored.

use std::collections::HashMap;
use std::sync::RwLock;

use once_cell::sync::Lazy;

use crate::error::{FfiError, Result};
use crate::util::align_up;

pub use tether_value::TypeId;

/// Size of a native pointer on every supported ABI (all are 64-bit).
pub const POINTER_SIZE: usize = 8;

/// The closed set of primitive kinds a descriptor can have.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimitiveKind {
    Void,
    Bool,
    Int8,
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Float32,
    Float64,
    /// Nul-terminated UTF-8 byte pointer.
    String,
    Record,
    Pointer,
}

impl PrimitiveKind {
    pub fn is_integer(self) -> bool {
        matches!(
            self,
            PrimitiveKind::Int8
                | PrimitiveKind::UInt8
                | PrimitiveKind::Int16
                | PrimitiveKind::UInt16
                | PrimitiveKind::Int32
                | PrimitiveKind::UInt32
                | PrimitiveKind::Int64
                | PrimitiveKind::UInt64
        )
    }

    pub fn is_float(self) -> bool {
        matches!(self, PrimitiveKind::Float32 | PrimitiveKind::Float64)
    }

    pub fn is_signed(self) -> bool {
        matches!(
            self,
            PrimitiveKind::Int8 | PrimitiveKind::Int16 | PrimitiveKind::Int32 | PrimitiveKind::Int64
        )
    }
}

/// One field of a record type.
#[derive(Debug, Clone)]
pub struct RecordMember {
    pub name: String,
    pub ty: TypeId,
}

/// An immutable type descriptor.
#[derive(Debug, Clone)]
pub struct TypeInfo {
    pub name: String,
    pub primitive: PrimitiveKind,
    /// Byte width. Zero only for `void` and records still being defined.
    pub size: usize,
    /// Alignment in bytes; zero only for `void`.
    pub align: usize,
    /// Record fields in declaration order (records only).
    pub members: Vec<RecordMember>,
    /// Pointee type (pointers only).
    pub pointee: Option<TypeId>,
}

impl TypeInfo {
    fn primitive(name: &str, primitive: PrimitiveKind, size: usize) -> Self {
        TypeInfo {
            name: name.to_string(),
            primitive,
            size,
            align: size,
            members: Vec::new(),
            pointee: None,
        }
    }

    pub fn is_record(&self) -> bool {
        self.primitive == PrimitiveKind::Record
    }

    /// A record that has been declared but whose layout is not computed yet.
    fn is_incomplete(&self) -> bool {
        self.primitive == PrimitiveKind::Record && self.members.is_empty() && self.size == 0
    }
}

/// Arena of type descriptors plus the name lookup map.
#[derive(Debug, Default)]
pub struct TypeRegistry {
    types: Vec<TypeInfo>,
    by_name: HashMap<String, TypeId>,
}

/// Built-in primitives registered at startup, aliases included.
const BUILTIN_TYPES: &[(&str, PrimitiveKind, usize)] = &[
    ("void", PrimitiveKind::Void, 0),
    ("bool", PrimitiveKind::Bool, 1),
    ("int8", PrimitiveKind::Int8, 1),
    ("uint8", PrimitiveKind::UInt8, 1),
    ("char", PrimitiveKind::Int8, 1),
    ("uchar", PrimitiveKind::UInt8, 1),
    ("int16", PrimitiveKind::Int16, 2),
    ("uint16", PrimitiveKind::UInt16, 2),
    ("short", PrimitiveKind::Int16, 2),
    ("ushort", PrimitiveKind::UInt16, 2),
    ("int32", PrimitiveKind::Int32, 4),
    ("uint32", PrimitiveKind::UInt32, 4),
    ("int", PrimitiveKind::Int32, 4),
    ("uint", PrimitiveKind::UInt32, 4),
    ("int64", PrimitiveKind::Int64, 8),
    ("uint64", PrimitiveKind::UInt64, 8),
    ("float32", PrimitiveKind::Float32, 4),
    ("float64", PrimitiveKind::Float64, 8),
    ("float", PrimitiveKind::Float32, 4),
    ("double", PrimitiveKind::Float64, 8),
    ("string", PrimitiveKind::String, POINTER_SIZE),
];

impl TypeRegistry {
    /// An empty registry; useful in tests that want isolation.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry pre-populated with the built-in primitive names.
    pub fn with_builtins() -> Self {
        let mut reg = Self::new();
        for &(name, primitive, size) in BUILTIN_TYPES {
            reg.register_primitive(name, primitive, size)
                .unwrap_or_else(|_| unreachable!("built-in names are unique"));
        }
        reg
    }

    pub fn register_primitive(
        &mut self,
        name: &str,
        primitive: PrimitiveKind,
        size: usize,
    ) -> Result<TypeId> {
        if self.by_name.contains_key(name) {
            return Err(FfiError::mismatch(format!("duplicate type name '{name}'")));
        }
        let id = self.push(TypeInfo::primitive(name, primitive, size));
        self.by_name.insert(name.to_string(), id);
        Ok(id)
    }

    /// Look up a type by its registered name.
    pub fn lookup(&self, name: &str) -> Option<TypeId> {
        self.by_name.get(name).copied()
    }

    pub fn get(&self, id: TypeId) -> &TypeInfo {
        &self.types[id.0 as usize]
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// Declare a record name and reserve its id without computing a layout.
    ///
    /// Between `declare_record` and [`complete_record`](Self::complete_record)
    /// the name resolves to an incomplete type, which allows a record to
    /// contain a pointer to itself.
    pub fn declare_record(&mut self, name: &str) -> Result<TypeId> {
        if self.by_name.contains_key(name) {
            return Err(FfiError::mismatch(format!("duplicate type name '{name}'")));
        }
        let id = self.push(TypeInfo {
            name: name.to_string(),
            primitive: PrimitiveKind::Record,
            size: 0,
            align: 1,
            members: Vec::new(),
            pointee: None,
        });
        self.by_name.insert(name.to_string(), id);
        Ok(id)
    }

    /// Fill in a declared record's members and compute its layout.
    ///
    /// The size is the sum of the member sizes with inter-member alignment
    /// padding, rounded up to the record's own alignment (the maximum of the
    /// member alignments).
    pub fn complete_record(&mut self, id: TypeId, members: Vec<RecordMember>) -> Result<()> {
        if members.is_empty() {
            let name = self.get(id).name.clone();
            self.by_name.remove(&name);
            return Err(FfiError::mismatch(format!(
                "record '{name}' must have at least one member"
            )));
        }

        let mut size = 0usize;
        let mut align = 1usize;
        for member in &members {
            if member.ty == id {
                let name = self.get(id).name.clone();
                self.by_name.remove(&name);
                return Err(FfiError::mismatch(format!(
                    "record '{name}' cannot contain itself by value"
                )));
            }
            let mt = self.get(member.ty);
            if mt.primitive == PrimitiveKind::Void {
                let name = self.get(id).name.clone();
                self.by_name.remove(&name);
                return Err(FfiError::mismatch(format!(
                    "type void cannot be used for field '{}'",
                    member.name
                )));
            }
            if mt.is_incomplete() {
                let (name, mname) = (self.get(id).name.clone(), mt.name.clone());
                self.by_name.remove(&name);
                return Err(FfiError::mismatch(format!(
                    "field '{}' has incomplete type '{mname}'",
                    member.name
                )));
            }
            size = align_up(size, mt.align) + mt.size;
            align = align.max(mt.align);
        }
        size = align_up(size, align);

        let info = &mut self.types[id.0 as usize];
        info.size = size;
        info.align = align;
        info.members = members;
        log::debug!(
            "defined record '{}' ({} bytes, align {})",
            info.name,
            size,
            align
        );
        Ok(())
    }

    /// The pointer-to-`inner` type, creating it on first use.
    ///
    /// Pointer type names read like C declarations: `int32 *`, `int32 **`.
    pub fn pointer_to(&mut self, inner: TypeId) -> TypeId {
        let pointee = self.get(inner);
        let name = if pointee.primitive == PrimitiveKind::Pointer {
            format!("{}*", pointee.name)
        } else {
            format!("{} *", pointee.name)
        };
        if let Some(existing) = self.lookup(&name) {
            return existing;
        }
        let id = self.push(TypeInfo {
            name: name.clone(),
            primitive: PrimitiveKind::Pointer,
            size: POINTER_SIZE,
            align: POINTER_SIZE,
            members: Vec::new(),
            pointee: Some(inner),
        });
        self.by_name.insert(name, id);
        id
    }

    /// Visit every leaf (non-record) field of `ty` with its byte offset.
    pub fn for_each_leaf(&self, ty: TypeId, visit: &mut impl FnMut(usize, &TypeInfo)) {
        self.walk_leaves(ty, 0, visit);
    }

    fn walk_leaves(&self, ty: TypeId, base: usize, visit: &mut impl FnMut(usize, &TypeInfo)) {
        let info = self.get(ty);
        if info.primitive != PrimitiveKind::Record {
            visit(base, info);
            return;
        }
        let mut offset = 0usize;
        for member in &info.members {
            let mt = self.get(member.ty);
            offset = align_up(offset, mt.align);
            self.walk_leaves(member.ty, base + offset, visit);
            offset += mt.size;
        }
    }

    /// True if every leaf field of `ty` is a floating-point type.
    pub fn all_float(&self, ty: TypeId) -> bool {
        let mut all = true;
        self.for_each_leaf(ty, &mut |_, info| {
            all &= info.primitive.is_float();
        });
        all
    }

    fn push(&mut self, info: TypeInfo) -> TypeId {
        let id = TypeId(self.types.len() as u32);
        self.types.push(info);
        id
    }
}

static REGISTRY: Lazy<RwLock<TypeRegistry>> = Lazy::new(|| RwLock::new(TypeRegistry::with_builtins()));

/// Run `f` with shared access to the process-wide type registry.
pub fn with_types<R>(f: impl FnOnce(&TypeRegistry) -> R) -> R {
    let guard = REGISTRY.read().unwrap_or_else(|e| e.into_inner());
    f(&guard)
}

/// Run `f` with exclusive access to the process-wide type registry.
pub fn with_types_mut<R>(f: impl FnOnce(&mut TypeRegistry) -> R) -> R {
    let mut guard = REGISTRY.write().unwrap_or_else(|e| e.into_inner());
    f(&mut guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(
        reg: &mut TypeRegistry,
        name: &str,
        members: &[(&str, &str)],
    ) -> Result<TypeId> {
        let id = reg.declare_record(name)?;
        let members = members
            .iter()
            .map(|(fname, tname)| RecordMember {
                name: fname.to_string(),
                ty: reg.lookup(tname).unwrap(),
            })
            .collect();
        reg.complete_record(id, members)?;
        Ok(id)
    }

    #[test]
    fn builtin_aliases_share_kind() {
        let reg = TypeRegistry::with_builtins();
        let int = reg.get(reg.lookup("int").unwrap());
        let int32 = reg.get(reg.lookup("int32").unwrap());
        assert_eq!(int.primitive, int32.primitive);
        assert_eq!(int.size, 4);
        assert_eq!(reg.get(reg.lookup("string").unwrap()).size, POINTER_SIZE);
    }

    #[test]
    fn record_layout_with_padding() {
        let mut reg = TypeRegistry::with_builtins();
        // { int8; int32; int8 } -> 1 + pad(3) + 4 + 1 + pad(3) = 12
        let id = record(
            &mut reg,
            "Mixed",
            &[("a", "int8"), ("b", "int32"), ("c", "int8")],
        )
        .unwrap();
        let info = reg.get(id);
        assert_eq!(info.size, 12);
        assert_eq!(info.align, 4);
        assert_eq!(info.size % info.align, 0);
    }

    #[test]
    fn record_size_is_multiple_of_align() {
        let mut reg = TypeRegistry::with_builtins();
        let id = record(&mut reg, "Tail", &[("x", "double"), ("y", "int8")]).unwrap();
        let info = reg.get(id);
        assert_eq!(info.align, 8);
        assert_eq!(info.size, 16);
    }

    #[test]
    fn nested_record_layout() {
        let mut reg = TypeRegistry::with_builtins();
        record(&mut reg, "Inner", &[("a", "int32"), ("b", "int32")]).unwrap();
        let outer = {
            let id = reg.declare_record("Outer").unwrap();
            let inner = reg.lookup("Inner").unwrap();
            reg.complete_record(
                id,
                vec![
                    RecordMember {
                        name: "head".into(),
                        ty: reg.lookup("int8").unwrap(),
                    },
                    RecordMember {
                        name: "inner".into(),
                        ty: inner,
                    },
                ],
            )
            .unwrap();
            id
        };
        let info = reg.get(outer);
        // int8 + pad(3) + { int32; int32 } = 12, align 4
        assert_eq!(info.size, 12);
        assert_eq!(info.align, 4);
    }

    #[test]
    fn duplicate_names_rejected() {
        let mut reg = TypeRegistry::with_builtins();
        assert!(reg.declare_record("int32").is_err());
        record(&mut reg, "Dup", &[("a", "int32")]).unwrap();
        assert!(reg.declare_record("Dup").is_err());
    }

    #[test]
    fn void_member_rejected() {
        let mut reg = TypeRegistry::with_builtins();
        assert!(record(&mut reg, "BadVoid", &[("v", "void")]).is_err());
        // The failed name is released for reuse.
        assert!(reg.lookup("BadVoid").is_none());
    }

    #[test]
    fn empty_record_rejected() {
        let mut reg = TypeRegistry::with_builtins();
        let id = reg.declare_record("Empty").unwrap();
        assert!(reg.complete_record(id, vec![]).is_err());
    }

    #[test]
    fn pointer_names_and_dedup() {
        let mut reg = TypeRegistry::with_builtins();
        let int32 = reg.lookup("int32").unwrap();
        let p = reg.pointer_to(int32);
        let pp = reg.pointer_to(p);
        assert_eq!(reg.get(p).name, "int32 *");
        assert_eq!(reg.get(pp).name, "int32 **");
        assert_eq!(reg.pointer_to(int32), p);
        assert_eq!(reg.get(p).pointee, Some(int32));
        assert_eq!(reg.get(p).size, POINTER_SIZE);
    }

    #[test]
    fn self_referential_pointer_allowed() {
        let mut reg = TypeRegistry::with_builtins();
        let node = reg.declare_record("Node").unwrap();
        let next = reg.pointer_to(node);
        reg.complete_record(
            node,
            vec![
                RecordMember {
                    name: "value".into(),
                    ty: reg.lookup("int64").unwrap(),
                },
                RecordMember {
                    name: "next".into(),
                    ty: next,
                },
            ],
        )
        .unwrap();
        let info = reg.get(node);
        assert_eq!(info.size, 16);
        assert_eq!(reg.get(next).pointee, Some(node));
    }

    #[test]
    fn self_by_value_rejected() {
        let mut reg = TypeRegistry::with_builtins();
        let id = reg.declare_record("Recur").unwrap();
        let err = reg.complete_record(
            id,
            vec![RecordMember {
                name: "again".into(),
                ty: id,
            }],
        );
        assert!(err.is_err());
    }

    #[test]
    fn all_float_walks_nested_records() {
        let mut reg = TypeRegistry::with_builtins();
        let pair = record(&mut reg, "FPair", &[("x", "float"), ("y", "float")]).unwrap();
        assert!(reg.all_float(pair));
        let mixed = record(&mut reg, "FMixed", &[("x", "float"), ("n", "int32")]).unwrap();
        assert!(!reg.all_float(mixed));
    }

    #[test]
    fn leaf_offsets() {
        let mut reg = TypeRegistry::with_builtins();
        let id = record(&mut reg, "Offs", &[("a", "int8"), ("b", "double")]).unwrap();
        let mut seen = Vec::new();
        reg.for_each_leaf(id, &mut |off, info| seen.push((off, info.primitive)));
        assert_eq!(
            seen,
            vec![(0, PrimitiveKind::Int8), (8, PrimitiveKind::Float64)]
        );
    }
}
