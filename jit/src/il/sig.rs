//! Signature blob parsing: method signatures, local-variable signatures,
//! and the sizing rules for generic instantiations.

use crate::emit::ArgHoming;
use crate::error::{JitError, Result};
use crate::metadata::{
    ArgKind, MetadataProvider, ReturnKind, TABLE_TYPE_DEF, TABLE_TYPE_REF, TABLE_TYPE_SPEC,
};
use alloc::vec::Vec;

// ECMA-335 element types.
pub const ELEMENT_TYPE_VOID: u8 = 0x01;
pub const ELEMENT_TYPE_BOOLEAN: u8 = 0x02;
pub const ELEMENT_TYPE_CHAR: u8 = 0x03;
pub const ELEMENT_TYPE_I1: u8 = 0x04;
pub const ELEMENT_TYPE_U1: u8 = 0x05;
pub const ELEMENT_TYPE_I2: u8 = 0x06;
pub const ELEMENT_TYPE_U2: u8 = 0x07;
pub const ELEMENT_TYPE_I4: u8 = 0x08;
pub const ELEMENT_TYPE_U4: u8 = 0x09;
pub const ELEMENT_TYPE_I8: u8 = 0x0A;
pub const ELEMENT_TYPE_U8: u8 = 0x0B;
pub const ELEMENT_TYPE_R4: u8 = 0x0C;
pub const ELEMENT_TYPE_R8: u8 = 0x0D;
pub const ELEMENT_TYPE_STRING: u8 = 0x0E;
pub const ELEMENT_TYPE_PTR: u8 = 0x0F;
pub const ELEMENT_TYPE_BYREF: u8 = 0x10;
pub const ELEMENT_TYPE_VALUETYPE: u8 = 0x11;
pub const ELEMENT_TYPE_CLASS: u8 = 0x12;
pub const ELEMENT_TYPE_VAR: u8 = 0x13;
pub const ELEMENT_TYPE_ARRAY: u8 = 0x14;
pub const ELEMENT_TYPE_GENERICINST: u8 = 0x15;
pub const ELEMENT_TYPE_I: u8 = 0x18;
pub const ELEMENT_TYPE_U: u8 = 0x19;
pub const ELEMENT_TYPE_FNPTR: u8 = 0x1B;
pub const ELEMENT_TYPE_OBJECT: u8 = 0x1C;
pub const ELEMENT_TYPE_SZARRAY: u8 = 0x1D;
pub const ELEMENT_TYPE_MVAR: u8 = 0x1E;
pub const ELEMENT_TYPE_CMOD_REQD: u8 = 0x1F;
pub const ELEMENT_TYPE_CMOD_OPT: u8 = 0x20;
pub const ELEMENT_TYPE_PINNED: u8 = 0x45;

// Calling-convention byte.
pub const SIG_HASTHIS: u8 = 0x20;
pub const SIG_EXPLICITTHIS: u8 = 0x40;
pub const SIG_GENERIC: u8 = 0x10;
pub const SIG_LOCAL: u8 = 0x07;

/// Machine-level view of one CIL type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeDesc {
    Void,
    Int32,
    Int64,
    IntPtr,
    Float32,
    Float64,
    /// GC-tracked object reference.
    ObjectRef,
    /// Managed pointer; interior for the GC.
    ByRef,
    ValueType { size: u32 },
}

impl TypeDesc {
    pub fn arg_kind(&self) -> ArgKind {
        match self {
            TypeDesc::Int32 => ArgKind::Int32,
            TypeDesc::Int64 => ArgKind::Int64,
            TypeDesc::Float32 => ArgKind::Float32,
            TypeDesc::Float64 => ArgKind::Float64,
            TypeDesc::ByRef => ArgKind::ByRef,
            // Small value types travel by value in the integer register.
            TypeDesc::ValueType { size } if *size <= 8 => ArgKind::Int64,
            TypeDesc::ValueType { .. } => ArgKind::Struct,
            _ => ArgKind::IntPtr,
        }
    }

    pub fn return_kind(&self) -> (ReturnKind, u16) {
        match self {
            TypeDesc::Void => (ReturnKind::Void, 0),
            TypeDesc::Int32 => (ReturnKind::Int32, 0),
            TypeDesc::Int64 => (ReturnKind::Int64, 0),
            TypeDesc::Float32 => (ReturnKind::Float32, 0),
            TypeDesc::Float64 => (ReturnKind::Float64, 0),
            TypeDesc::ValueType { size } => (ReturnKind::Struct, *size as u16),
            _ => (ReturnKind::IntPtr, 0),
        }
    }

    pub fn homing(&self) -> ArgHoming {
        match self {
            TypeDesc::Float32 => ArgHoming::Float32,
            TypeDesc::Float64 => ArgHoming::Float64,
            _ => ArgHoming::Int,
        }
    }

    pub fn is_float(&self) -> bool {
        matches!(self, TypeDesc::Float32 | TypeDesc::Float64)
    }

    /// Whether a local of this type holds a GC root the GCInfo must report.
    pub fn is_gc_ref(&self) -> bool {
        matches!(self, TypeDesc::ObjectRef)
    }
}

/// One parsed local: its type plus the `pinned` constraint.
#[derive(Debug, Clone, Copy)]
pub struct LocalVar {
    pub ty: TypeDesc,
    pub pinned: bool,
}

/// Parsed method signature.
#[derive(Debug, Clone)]
pub struct MethodSig {
    pub has_this: bool,
    pub return_type: TypeDesc,
    pub params: Vec<TypeDesc>,
}

/// Ambient generic instantiation: `VAR`/`MVAR` indices resolve against this
/// list, and its fingerprint is the `type_arg_hash` dimension of the method
/// identifier.
#[derive(Debug, Clone, Default)]
pub struct TypeArgContext {
    pub args: Vec<TypeDesc>,
}

impl TypeArgContext {
    pub fn hash(&self) -> u64 {
        if self.args.is_empty() {
            return 0;
        }
        // FNV-1a over the machine classification of each argument.
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for arg in &self.args {
            let tag: u64 = match arg {
                TypeDesc::Void => 0,
                TypeDesc::Int32 => 1,
                TypeDesc::Int64 => 2,
                TypeDesc::IntPtr => 3,
                TypeDesc::Float32 => 4,
                TypeDesc::Float64 => 5,
                TypeDesc::ObjectRef => 6,
                TypeDesc::ByRef => 7,
                TypeDesc::ValueType { size } => 8 | ((*size as u64) << 8),
            };
            hash ^= tag;
            hash = hash.wrapping_mul(0x0000_0100_0000_01B3);
        }
        hash.max(1)
    }
}

/// Forward reader over a signature blob.
pub struct BlobReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BlobReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        let byte = *self.data.get(self.pos).ok_or(JitError::TruncatedInput)?;
        self.pos += 1;
        Ok(byte)
    }

    pub fn peek_u8(&self) -> Result<u8> {
        self.data
            .get(self.pos)
            .copied()
            .ok_or(JitError::TruncatedInput)
    }

    /// ECMA-335 compressed unsigned integer (1, 2 or 4 bytes).
    pub fn read_compressed_u32(&mut self) -> Result<u32> {
        let first = self.read_u8()?;
        if first & 0x80 == 0 {
            return Ok(first as u32);
        }
        if first & 0xC0 == 0x80 {
            let second = self.read_u8()?;
            return Ok((((first & 0x3F) as u32) << 8) | second as u32);
        }
        if first & 0xE0 == 0xC0 {
            let mut value = (first & 0x1F) as u32;
            for _ in 0..3 {
                value = (value << 8) | self.read_u8()? as u32;
            }
            return Ok(value);
        }
        Err(JitError::TruncatedInput)
    }

    /// `TypeDefOrRefEncoded` compressed token.
    pub fn read_type_token(&mut self) -> Result<u32> {
        let encoded = self.read_compressed_u32()?;
        let table = match encoded & 0x3 {
            0 => TABLE_TYPE_DEF,
            1 => TABLE_TYPE_REF,
            2 => TABLE_TYPE_SPEC,
            _ => return Err(JitError::TruncatedInput),
        };
        Ok(((table as u32) << 24) | (encoded >> 2))
    }
}

/// Parses a `MethodDefSig` blob.
pub fn parse_method_sig(
    blob: &[u8],
    provider: &dyn MetadataProvider,
    assembly: u32,
    ctx: &TypeArgContext,
) -> Result<MethodSig> {
    let mut reader = BlobReader::new(blob);
    let conv = reader.read_u8()?;
    let has_this = conv & SIG_HASTHIS != 0;
    if conv & SIG_GENERIC != 0 {
        let _generic_param_count = reader.read_compressed_u32()?;
    }
    let param_count = reader.read_compressed_u32()?;
    let return_type = parse_type(&mut reader, provider, assembly, ctx)?;
    let mut params = Vec::with_capacity(param_count as usize);
    for _ in 0..param_count {
        params.push(parse_type(&mut reader, provider, assembly, ctx)?);
    }
    Ok(MethodSig {
        has_this,
        return_type,
        params,
    })
}

/// Parses a `LocalVarSig` blob.
pub fn parse_local_sig(
    blob: &[u8],
    provider: &dyn MetadataProvider,
    assembly: u32,
    ctx: &TypeArgContext,
) -> Result<Vec<LocalVar>> {
    let mut reader = BlobReader::new(blob);
    if reader.read_u8()? != SIG_LOCAL {
        return Err(JitError::TruncatedInput);
    }
    let count = reader.read_compressed_u32()?;
    let mut locals = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let mut pinned = false;
        loop {
            match reader.peek_u8()? {
                ELEMENT_TYPE_PINNED => {
                    reader.read_u8()?;
                    pinned = true;
                }
                ELEMENT_TYPE_CMOD_REQD | ELEMENT_TYPE_CMOD_OPT => {
                    reader.read_u8()?;
                    reader.read_type_token()?;
                }
                _ => break,
            }
        }
        let ty = parse_type(&mut reader, provider, assembly, ctx)?;
        locals.push(LocalVar { ty, pinned });
    }
    Ok(locals)
}

/// Parses one type, resolving value-type sizes through the runtime's
/// type-size oracle and generic variables through the ambient context.
pub fn parse_type(
    reader: &mut BlobReader<'_>,
    provider: &dyn MetadataProvider,
    assembly: u32,
    ctx: &TypeArgContext,
) -> Result<TypeDesc> {
    let element = reader.read_u8()?;
    match element {
        ELEMENT_TYPE_VOID => Ok(TypeDesc::Void),
        ELEMENT_TYPE_BOOLEAN
        | ELEMENT_TYPE_CHAR
        | ELEMENT_TYPE_I1
        | ELEMENT_TYPE_U1
        | ELEMENT_TYPE_I2
        | ELEMENT_TYPE_U2
        | ELEMENT_TYPE_I4
        | ELEMENT_TYPE_U4 => Ok(TypeDesc::Int32),
        ELEMENT_TYPE_I8 | ELEMENT_TYPE_U8 => Ok(TypeDesc::Int64),
        ELEMENT_TYPE_R4 => Ok(TypeDesc::Float32),
        ELEMENT_TYPE_R8 => Ok(TypeDesc::Float64),
        ELEMENT_TYPE_I | ELEMENT_TYPE_U => Ok(TypeDesc::IntPtr),
        ELEMENT_TYPE_PTR | ELEMENT_TYPE_FNPTR => {
            // Pointee type (or full signature) is irrelevant for codegen;
            // consume a type for PTR to keep the reader aligned.
            if element == ELEMENT_TYPE_PTR {
                parse_type(reader, provider, assembly, ctx)?;
            }
            Ok(TypeDesc::IntPtr)
        }
        ELEMENT_TYPE_BYREF => {
            parse_type(reader, provider, assembly, ctx)?;
            Ok(TypeDesc::ByRef)
        }
        ELEMENT_TYPE_STRING | ELEMENT_TYPE_OBJECT => Ok(TypeDesc::ObjectRef),
        ELEMENT_TYPE_CLASS => {
            reader.read_type_token()?;
            Ok(TypeDesc::ObjectRef)
        }
        ELEMENT_TYPE_SZARRAY | ELEMENT_TYPE_ARRAY => {
            parse_type(reader, provider, assembly, ctx)?;
            if element == ELEMENT_TYPE_ARRAY {
                // Rank and bound lists.
                let rank = reader.read_compressed_u32()?;
                let sizes = reader.read_compressed_u32()?;
                for _ in 0..sizes {
                    reader.read_compressed_u32()?;
                }
                let bounds = reader.read_compressed_u32()?;
                for _ in 0..bounds {
                    reader.read_compressed_u32()?;
                }
                let _ = rank;
            }
            Ok(TypeDesc::ObjectRef)
        }
        ELEMENT_TYPE_VALUETYPE => {
            let token = reader.read_type_token()?;
            let size = provider.type_size(assembly, token)?;
            Ok(TypeDesc::ValueType { size })
        }
        ELEMENT_TYPE_VAR | ELEMENT_TYPE_MVAR => {
            let index = reader.read_compressed_u32()? as usize;
            ctx.args
                .get(index)
                .copied()
                .ok_or(JitError::TruncatedInput)
        }
        ELEMENT_TYPE_GENERICINST => {
            let inst_element = reader.read_u8()?;
            let token = reader.read_type_token()?;
            let arg_count = reader.read_compressed_u32()?;
            let mut args = Vec::with_capacity(arg_count as usize);
            for _ in 0..arg_count {
                args.push(parse_type(reader, provider, assembly, ctx)?);
            }
            if inst_element == ELEMENT_TYPE_CLASS {
                return Ok(TypeDesc::ObjectRef);
            }
            if provider.is_nullable(assembly, token) {
                // Layout: bool hasValue + padding + T.
                let inner = args.first().copied().unwrap_or(TypeDesc::Int32);
                let size = match inner {
                    TypeDesc::Int64 | TypeDesc::Float64 | TypeDesc::IntPtr => 16,
                    TypeDesc::ValueType { size } if size > 4 => 16,
                    _ => 8,
                };
                return Ok(TypeDesc::ValueType { size });
            }
            // Generic struct: base size plus embedded type-argument sizes,
            // aligned up to 8.
            let base = provider.type_size(assembly, token)?;
            let mut size = base;
            for arg in &args {
                size += match arg {
                    TypeDesc::Int32 | TypeDesc::Float32 => 4,
                    TypeDesc::ValueType { size } => *size,
                    _ => 8,
                };
            }
            Ok(TypeDesc::ValueType {
                size: (size + 7) & !7,
            })
        }
        other => Err(JitError::UnknownElementType { element: other }),
    }
}
