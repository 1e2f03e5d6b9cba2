//! Metadata vocabulary and the kernel-side collaborator seams.
//!
//! Table parsing and type loading live outside this crate; the traits here
//! are the stated interfaces of those collaborators. The `MethodTable`
//! layout is the ABI the emitted code reads through: object word 0 points at
//! the method table, and virtual dispatch indexes its vtable.

use crate::error::Result;
use alloc::string::String;
use alloc::vec::Vec;
use bitflags::bitflags;
use core::mem::offset_of;
use core::ptr::NonNull;
use static_assertions::const_assert_eq;

// Metadata table identifiers (token high byte).
pub const TABLE_TYPE_REF: u8 = 0x01;
pub const TABLE_TYPE_DEF: u8 = 0x02;
pub const TABLE_METHOD_DEF: u8 = 0x06;
pub const TABLE_MEMBER_REF: u8 = 0x0A;
pub const TABLE_STANDALONE_SIG: u8 = 0x11;
pub const TABLE_TYPE_SPEC: u8 = 0x1B;

/// Table id of a token.
pub fn token_table(token: u32) -> u8 {
    (token >> 24) as u8
}

/// 1-based row id of a token.
pub fn token_rid(token: u32) -> u32 {
    token & 0x00FF_FFFF
}

bitflags! {
    /// `MethodAttributes` bits the driver consults.
    pub struct MethodAttributes: u16 {
        const STATIC = 0x0010;
        const VIRTUAL = 0x0040;
        const NEW_SLOT = 0x0100;
        const ABSTRACT = 0x0400;
        const SPECIAL_NAME = 0x0800;
        const PINVOKE_IMPL = 0x2000;
    }
}

/// One `MethodDef` row, resolved by the metadata collaborator.
#[derive(Debug, Clone)]
pub struct MethodDefInfo {
    pub token: u32,
    pub rva: u32,
    pub attributes: MethodAttributes,
    /// Blob index of the method signature.
    pub signature: u32,
    pub name: String,
}

/// Return-value classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReturnKind {
    Void = 0,
    Int32,
    Int64,
    IntPtr,
    Float32,
    Float64,
    Struct,
}

/// Argument classification, one nibble per argument in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ArgKind {
    Int32 = 0,
    Int64,
    IntPtr,
    Float32,
    Float64,
    ByRef,
    Struct,
}

impl ArgKind {
    pub fn from_nibble(nibble: u8) -> ArgKind {
        match nibble {
            1 => ArgKind::Int64,
            2 => ArgKind::IntPtr,
            3 => ArgKind::Float32,
            4 => ArgKind::Float64,
            5 => ArgKind::ByRef,
            6 => ArgKind::Struct,
            _ => ArgKind::Int32,
        }
    }
}

/// Storage classification of a field, driving the sized load/store choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Int8,
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    Pointer,
    Float32,
    Float64,
    ValueType,
}

#[derive(Debug, Clone, Copy)]
pub struct FieldInfo {
    pub offset: u32,
    pub kind: FieldKind,
    pub size: u32,
}

/// Per-type runtime descriptor consumed by emitted code.
///
/// Objects carry a `*const MethodTable` at offset 0; the vtable is a
/// contiguous array of native entry points. The field offsets are part of
/// the emitted-code ABI, hence the layout asserts.
#[repr(C)]
pub struct MethodTable {
    pub component_size: u16,
    pub flags: u16,
    pub base_size: u32,
    pub vtable_length: u16,
    pub interface_count: u16,
    _reserved: u32,
    pub vtable: *mut *const u8,
}

pub const MT_FLAG_VALUE_TYPE: u16 = 0x0001;

/// Offset of the vtable pointer, read by `callvirt` sequences.
pub const MT_VTABLE_OFFSET: i32 = offset_of!(MethodTable, vtable) as i32;

const_assert_eq!(offset_of!(MethodTable, component_size), 0);
const_assert_eq!(offset_of!(MethodTable, base_size), 4);
const_assert_eq!(offset_of!(MethodTable, vtable_length), 8);
const_assert_eq!(offset_of!(MethodTable, vtable), 16);

impl MethodTable {
    pub fn new(base_size: u32, vtable: *mut *const u8, vtable_length: u16) -> Self {
        Self {
            component_size: 0,
            flags: 0,
            base_size,
            vtable_length,
            interface_count: 0,
            _reserved: 0,
            vtable,
        }
    }

    pub fn is_value_type(&self) -> bool {
        self.flags & MT_FLAG_VALUE_TYPE != 0
    }

    /// ## Safety
    ///
    /// `slot` must be below `vtable_length` and the vtable storage must be
    /// live.
    pub unsafe fn vtable_slot(&self, slot: usize) -> *const u8 {
        *self.vtable.add(slot)
    }

    /// ## Safety
    ///
    /// Same contract as [`vtable_slot`](Self::vtable_slot); the caller is
    /// the only writer.
    pub unsafe fn set_vtable_slot(&self, slot: usize, code: *const u8) {
        *self.vtable.add(slot) = code;
    }
}

/// Interface slot implemented by a method, if any.
#[derive(Debug, Clone, Copy)]
pub struct InterfaceImpl {
    pub interface_mt: *const MethodTable,
    pub slot: u16,
}

/// Metadata collaborator: method rows, blobs, field layout, type sizes and
/// method tables.
pub trait MetadataProvider {
    fn method_def(&self, assembly: u32, token: u32) -> Result<MethodDefInfo>;

    /// Raw method body (header + IL) at an RVA.
    fn method_body(&self, assembly: u32, rva: u32) -> Result<&[u8]>;

    fn signature_blob(&self, assembly: u32, index: u32) -> Result<&[u8]>;

    /// Local-variable signature blob behind a `StandAloneSig` token.
    fn local_sig_blob(&self, assembly: u32, token: u32) -> Result<&[u8]>;

    /// Byte size of a value type (the runtime type-size oracle).
    fn type_size(&self, assembly: u32, token: u32) -> Result<u32>;

    fn field_info(&self, assembly: u32, token: u32) -> Result<FieldInfo>;

    /// Import name of a `PInvokeImpl` method.
    fn pinvoke_import(&self, assembly: u32, token: u32) -> Result<&str>;

    /// `TypeDef` token of the method's declaring type.
    fn declaring_type(&self, assembly: u32, method_token: u32) -> Result<u32>;

    /// All methods of a type, in row order. Used for vtable slot
    /// computation.
    fn type_methods(&self, assembly: u32, type_token: u32) -> Result<Vec<MethodDefInfo>>;

    /// Method tables of the type: the definition's table first, then every
    /// known generic instantiation.
    fn method_tables_of_type(&self, assembly: u32, type_token: u32) -> Result<Vec<*const MethodTable>>;

    /// Interface slot the method implements, if it is an interface-slot
    /// implementation.
    fn interface_impl(&self, assembly: u32, method_token: u32) -> Result<Option<InterfaceImpl>> {
        let _ = (assembly, method_token);
        Ok(None)
    }

    /// Whether the token names the runtime's `Nullable<T>` definition. Its
    /// instantiations have a fixed two-field layout instead of the generic
    /// sizing rule.
    fn is_nullable(&self, assembly: u32, token: u32) -> bool {
        let _ = (assembly, token);
        false
    }
}

/// Kernel export registry: case-sensitive ASCII name lookup.
pub trait KernelExports {
    fn lookup(&self, name: &[u8]) -> Option<NonNull<u8>>;
}

/// Ahead-of-time method registry consulted before compiling.
pub trait AotRegistry {
    fn lookup(&self, assembly: u32, token: u32) -> Option<NonNull<u8>>;
}

/// Entry points of the runtime helpers emitted code calls out to.
#[derive(Debug, Clone, Copy)]
pub struct RuntimeHelperTable {
    /// `fn(mt: *const MethodTable) -> *mut u8` — allocates a zeroed object
    /// with its method-table word set.
    pub alloc_object: *const u8,
    /// `fn(obj: *const u8, interface_mt: *const MethodTable, slot: u64) -> *const u8`
    /// — resolves an interface slot to a concrete entry point.
    pub interface_dispatch: *const u8,
}
