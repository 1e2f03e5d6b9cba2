//! Single-pass CIL-to-native translator.
//!
//! One linear pass over the IL with a branch-fixup list. The operand stack
//! is shadowed by a fixed set of volatile temporaries keyed by stack
//! position; values that exceed an integer register travel as an address
//! plus a size tag. Every call site spills the live stack to the frame,
//! stages outgoing arguments through the outgoing stack area, and records a
//! safepoint at the native offset after the call.

pub mod body;
pub mod opcode;
pub mod sig;

use crate::buffer::CodeBuffer;
use crate::emit::{ArgHoming, CodeEmitter, Cond, FReg, VReg};
use crate::error::{JitError, Result};
use crate::gcinfo::GcInfoBuilder;
use crate::metadata::{ArgKind, FieldKind, MethodTable, ReturnKind, RuntimeHelperTable};
use crate::registry::ArgKindPack;
use alloc::vec::Vec;
use core::marker::PhantomData;
use self::sig::{LocalVar, TypeDesc};

use self::opcode as op;

/// Operand-stack temporaries, by stack position. The callee-saved registers
/// are never handed out here.
const INT_TEMPS: [VReg; 6] = [VReg::R6, VReg::R5, VReg::R4, VReg::R3, VReg::R2, VReg::R0];
const FLOAT_TEMPS: [FReg; 6] = [FReg::F0, FReg::F1, FReg::F2, FReg::F3, FReg::F4, FReg::F5];

/// Physical argument limit per call site (register args plus the fixed
/// outgoing stack slots).
const MAX_CALL_ARGS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Width {
    W32,
    W64,
}

/// One operand-stack entry.
#[derive(Debug, Clone, Copy)]
enum Value {
    Int(VReg, Width),
    Float(FReg, bool),
    Struct { addr: VReg, size: u32 },
}

/// How a resolved callee is invoked.
#[derive(Debug, Clone, Copy)]
pub enum Dispatch {
    Direct,
    Vtable(i32),
    Interface {
        mt: *const MethodTable,
        slot: u16,
    },
}

/// Where a direct call lands.
#[derive(Debug, Clone, Copy)]
pub enum CallTarget {
    /// Fully compiled; patch against the final entry point.
    Compiled(u64),
    /// Under compilation further up the stack; patch against the
    /// pre-allocated buffer.
    Pending(u64),
    /// No direct target (pure virtual dispatch).
    None,
}

/// Callee facts a call sequence needs, supplied by the driver.
#[derive(Debug, Clone, Copy)]
pub struct CalleeInfo {
    pub target: CallTarget,
    pub param_count: u16,
    pub has_this: bool,
    pub return_kind: ReturnKind,
    pub return_struct_size: u16,
    pub arg_kinds: ArgKindPack,
    pub dispatch: Dispatch,
    /// Declaring method table; consumed by `newobj`.
    pub declaring_mt: *const MethodTable,
}

/// Driver-side resolution surface. `resolve_method` may recurse into the
/// Tier-0 driver to compile the callee first.
pub trait MethodResolver {
    fn resolve_method(&mut self, token: u32) -> Result<CalleeInfo>;
    fn field_info(&mut self, token: u32) -> Result<crate::metadata::FieldInfo>;
    fn type_size(&mut self, token: u32) -> Result<u32>;
}

/// Frame-shape inputs for one method.
#[derive(Debug, Clone)]
pub struct MethodLayout {
    pub has_this: bool,
    pub params: Vec<TypeDesc>,
    pub return_type: TypeDesc,
    pub locals: Vec<LocalVar>,
}

/// A relative call displacement to patch once the final code address is
/// known.
#[derive(Debug, Clone, Copy)]
pub struct CallFixup {
    pub patch_offset: usize,
    pub target: u64,
}

/// Compilation result handed back to the driver.
pub struct CompiledMethod {
    pub code_size: usize,
    pub prologue_size: u8,
    pub frame_size: u32,
    pub gc: GcInfoBuilder,
    pub call_fixups: Vec<CallFixup>,
}

pub struct Compiler<'a, E: CodeEmitter> {
    buf: &'a mut CodeBuffer,
    resolver: &'a mut dyn MethodResolver,
    helpers: RuntimeHelperTable,
    layout: MethodLayout,
    /// Physical argument types: hidden return buffer, `this`, then the
    /// declared parameters.
    physical_args: Vec<TypeDesc>,
    ret_buf: bool,
    stack: Vec<Value>,
    gc: GcInfoBuilder,
    frame_size: u32,
    native_offsets: Vec<Option<u32>>,
    branch_fixups: Vec<(usize, usize)>,
    call_fixups: Vec<CallFixup>,
    ret_buf_slot: usize,
    scratch_slot: usize,
    spill_slot: usize,
    _emitter: PhantomData<E>,
}

impl<'a, E: CodeEmitter> Compiler<'a, E> {
    pub fn new(
        buf: &'a mut CodeBuffer,
        resolver: &'a mut dyn MethodResolver,
        helpers: RuntimeHelperTable,
        layout: MethodLayout,
    ) -> Result<Self> {
        for local in &layout.locals {
            if let TypeDesc::ValueType { size } = local.ty {
                if size as i32 > crate::emit::LOCAL_SLOT_BYTES {
                    return Err(JitError::ValueTypeTooLarge { size });
                }
            }
        }

        let ret_buf = matches!(layout.return_type, TypeDesc::ValueType { size } if size > 8);
        let mut physical_args = Vec::with_capacity(layout.params.len() + 2);
        if ret_buf {
            physical_args.push(TypeDesc::IntPtr);
        }
        if layout.has_this {
            physical_args.push(TypeDesc::ObjectRef);
        }
        physical_args.extend_from_slice(&layout.params);

        // Frame slots past the declared locals: the saved hidden-return
        // pointer, the struct-return scratch buffer, and the operand-stack
        // spill area.
        let ret_buf_slot = layout.locals.len();
        let scratch_slot = ret_buf_slot + 1;
        let spill_slot = scratch_slot + 1;

        Ok(Self {
            buf,
            resolver,
            helpers,
            layout,
            physical_args,
            ret_buf,
            stack: Vec::new(),
            gc: GcInfoBuilder::new(),
            frame_size: 0,
            native_offsets: Vec::new(),
            branch_fixups: Vec::new(),
            call_fixups: Vec::new(),
            ret_buf_slot,
            scratch_slot,
            spill_slot,
            _emitter: PhantomData,
        })
    }

    pub fn compile(mut self, code: &[u8]) -> Result<CompiledMethod> {
        log::trace!("Translating {} bytes of IL", code.len());

        let local_slots = self.spill_slot + 1;
        let local_bytes = local_slots as u32 * crate::emit::LOCAL_SLOT_BYTES as u32;
        self.frame_size = E::emit_prologue(self.buf, local_bytes);
        let homing: Vec<ArgHoming> = self.physical_args.iter().map(|t| t.homing()).collect();
        E::home_arguments(self.buf, self.physical_args.len(), &homing);
        if self.ret_buf {
            // The hidden return buffer arrives as the first integer
            // argument; keep its address in a reserved local slot.
            let offset = E::local_slot_offset(self.ret_buf_slot);
            E::store64(self.buf, VReg::Fp, offset, VReg::R1);
        }
        let prologue_size = self.buf.position() as u8;

        for (index, local) in self.layout.locals.iter().enumerate() {
            let offset = E::local_slot_offset(index);
            match local.ty {
                TypeDesc::ObjectRef => self.gc.push_stack_slot(offset, false, local.pinned),
                TypeDesc::ByRef => self.gc.push_stack_slot(offset, true, local.pinned),
                _ => {}
            }
        }

        self.native_offsets = alloc::vec![None; code.len() + 1];

        let mut pc = 0usize;
        while pc < code.len() {
            self.native_offsets[pc] = Some(self.buf.position() as u32);
            let at = pc;
            let byte = code[pc];
            pc += 1;
            self.translate(byte, code, &mut pc, at)?;
        }
        self.native_offsets[code.len()] = Some(self.buf.position() as u32);

        for (patch, il_target) in core::mem::take(&mut self.branch_fixups) {
            let native = self
                .native_offsets
                .get(il_target)
                .and_then(|n| *n)
                .ok_or(JitError::BranchOutOfBounds { target: il_target })?;
            E::patch_jump(self.buf, patch, native as usize);
        }

        if self.buf.overflowed() {
            return Err(JitError::CodeBufferOverflow);
        }

        Ok(CompiledMethod {
            code_size: self.buf.position(),
            prologue_size,
            frame_size: self.frame_size,
            gc: self.gc,
            call_fixups: self.call_fixups,
        })
    }

    // Operand-stack plumbing.

    fn push_int(&mut self, width: Width) -> Result<VReg> {
        let position = self.stack.len();
        if position >= INT_TEMPS.len() {
            return Err(JitError::StackDepthExceeded);
        }
        let reg = INT_TEMPS[position];
        self.stack.push(Value::Int(reg, width));
        Ok(reg)
    }

    fn push_float(&mut self, is_double: bool) -> Result<FReg> {
        let position = self.stack.len();
        if position >= FLOAT_TEMPS.len() {
            return Err(JitError::StackDepthExceeded);
        }
        let reg = FLOAT_TEMPS[position];
        self.stack.push(Value::Float(reg, is_double));
        Ok(reg)
    }

    fn push_struct(&mut self, size: u32) -> Result<VReg> {
        let position = self.stack.len();
        if position >= INT_TEMPS.len() {
            return Err(JitError::StackDepthExceeded);
        }
        let reg = INT_TEMPS[position];
        self.stack.push(Value::Struct { addr: reg, size });
        Ok(reg)
    }

    fn pop(&mut self, at: usize) -> Result<Value> {
        self.stack.pop().ok_or(JitError::StackUnderflow { offset: at })
    }

    fn pop_int(&mut self, at: usize) -> Result<(VReg, Width)> {
        match self.pop(at)? {
            Value::Int(reg, width) => Ok((reg, width)),
            _ => Err(JitError::UnsupportedOpcode {
                opcode: 0,
                offset: at,
            }),
        }
    }

    /// Sign-extends a 32-bit value in place, making the full register
    /// canonical.
    fn widen(&mut self, reg: VReg, width: Width) {
        if width == Width::W32 {
            E::movsxd_rr(self.buf, reg, reg);
        }
    }

    // Frame offsets.

    fn spill_offset(&self, position: usize) -> i32 {
        E::local_slot_offset(self.spill_slot) + 8 * position as i32
    }

    fn scratch_offset(&self) -> i32 {
        E::local_slot_offset(self.scratch_slot)
    }

    /// Spills every live operand-stack entry to the frame. Calls clobber all
    /// of the temporaries.
    fn spill_stack(&mut self) {
        for position in 0..self.stack.len() {
            let offset = self.spill_offset(position);
            match self.stack[position] {
                Value::Int(reg, _) => E::store64(self.buf, VReg::Fp, offset, reg),
                Value::Float(reg, true) => E::store_f64(self.buf, VReg::Fp, offset, reg),
                Value::Float(reg, false) => E::store_f32(self.buf, VReg::Fp, offset, reg),
                Value::Struct { addr, .. } => E::store64(self.buf, VReg::Fp, offset, addr),
            }
        }
    }

    /// Reloads the `count` deepest entries after a call.
    fn reload_stack(&mut self, count: usize) {
        for position in 0..count {
            let offset = self.spill_offset(position);
            match self.stack[position] {
                Value::Int(reg, _) => E::load64(self.buf, reg, VReg::Fp, offset),
                Value::Float(reg, true) => E::load_f64(self.buf, reg, VReg::Fp, offset),
                Value::Float(reg, false) => E::load_f32(self.buf, reg, VReg::Fp, offset),
                Value::Struct { addr, .. } => E::load64(self.buf, addr, VReg::Fp, offset),
            }
        }
    }

    // Instruction translation.

    fn translate(&mut self, byte: u8, code: &[u8], pc: &mut usize, at: usize) -> Result<()> {
        match byte {
            op::NOP | op::BREAK => {}

            op::LDARG_0 | op::LDARG_1 | op::LDARG_2 | op::LDARG_3 => {
                self.load_arg((byte - op::LDARG_0) as usize, at)?;
            }
            op::LDARG_S => {
                let index = read_u8(code, pc)? as usize;
                self.load_arg(index, at)?;
            }
            op::LDARGA_S => {
                let index = read_u8(code, pc)? as usize;
                self.load_arg_address(index)?;
            }
            op::STARG_S => {
                let index = read_u8(code, pc)? as usize;
                self.store_arg(index, at)?;
            }
            op::LDLOC_0 | op::LDLOC_1 | op::LDLOC_2 | op::LDLOC_3 => {
                self.load_local((byte - op::LDLOC_0) as usize, at)?;
            }
            op::LDLOC_S => {
                let index = read_u8(code, pc)? as usize;
                self.load_local(index, at)?;
            }
            op::LDLOCA_S => {
                let index = read_u8(code, pc)? as usize;
                let reg = self.push_int(Width::W64)?;
                E::load_address(self.buf, reg, VReg::Fp, E::local_slot_offset(index));
            }
            op::STLOC_0 | op::STLOC_1 | op::STLOC_2 | op::STLOC_3 => {
                self.store_local((byte - op::STLOC_0) as usize, at)?;
            }
            op::STLOC_S => {
                let index = read_u8(code, pc)? as usize;
                self.store_local(index, at)?;
            }

            op::LDNULL => {
                let reg = self.push_int(Width::W64)?;
                E::zero_reg(self.buf, reg);
            }
            b if (op::LDC_I4_M1..=op::LDC_I4_8).contains(&b) => {
                let value = b as i32 - op::LDC_I4_0 as i32;
                let reg = self.push_int(Width::W32)?;
                E::mov_ri32(self.buf, reg, value);
            }
            op::LDC_I4_S => {
                let value = read_i8(code, pc)? as i32;
                let reg = self.push_int(Width::W32)?;
                E::mov_ri32(self.buf, reg, value);
            }
            op::LDC_I4 => {
                let value = read_i32(code, pc)?;
                let reg = self.push_int(Width::W32)?;
                E::mov_ri32(self.buf, reg, value);
            }
            op::LDC_I8 => {
                let value = read_u64(code, pc)?;
                let reg = self.push_int(Width::W64)?;
                E::mov_ri64(self.buf, reg, value);
            }
            op::LDC_R4 => {
                let bits = read_u32(code, pc)?;
                E::mov_ri64(self.buf, VReg::R1, bits as u64);
                let reg = self.push_float(false)?;
                E::mov_to_float(self.buf, reg, VReg::R1);
            }
            op::LDC_R8 => {
                let bits = read_u64(code, pc)?;
                E::mov_ri64(self.buf, VReg::R1, bits);
                let reg = self.push_float(true)?;
                E::mov_to_float(self.buf, reg, VReg::R1);
            }

            op::DUP => {
                let top = *self.stack.last().ok_or(JitError::StackUnderflow { offset: at })?;
                match top {
                    Value::Int(src, width) => {
                        let dst = self.push_int(width)?;
                        E::mov_rr(self.buf, dst, src);
                    }
                    Value::Float(src, is_double) => {
                        let dst = self.push_float(is_double)?;
                        E::mov_ff(self.buf, dst, src);
                    }
                    Value::Struct { addr, size } => {
                        let dst = self.push_struct(size)?;
                        E::mov_rr(self.buf, dst, addr);
                    }
                }
            }
            op::POP => {
                self.pop(at)?;
            }

            op::ADD | op::SUB | op::MUL | op::AND | op::OR | op::XOR => {
                self.binary_alu(byte, at)?;
            }
            op::DIV | op::DIV_UN | op::REM | op::REM_UN => {
                self.division(byte, at)?;
            }
            op::SHL | op::SHR | op::SHR_UN => {
                self.shift(byte, at)?;
            }
            op::NEG => self.negate(at)?,
            op::NOT => {
                let (reg, width) = self.pop_int(at)?;
                E::not(self.buf, reg);
                self.stack.push(Value::Int(reg, width));
            }

            op::CONV_I1 | op::CONV_I2 | op::CONV_I4 | op::CONV_I8 | op::CONV_U1
            | op::CONV_U2 | op::CONV_U4 | op::CONV_U8 | op::CONV_I | op::CONV_U
            | op::CONV_R4 | op::CONV_R8 | op::CONV_R_UN => {
                self.convert(byte, at)?;
            }

            op::BR_S | op::BR | op::LEAVE | op::LEAVE_S => {
                let target = if byte == op::BR_S || byte == op::LEAVE_S {
                    branch_target_s(code, pc)?
                } else {
                    branch_target(code, pc)?
                };
                if byte == op::LEAVE || byte == op::LEAVE_S {
                    // Non-EH path: a leave is the unconditional transfer it
                    // denotes, with an emptied evaluation stack.
                    self.stack.clear();
                }
                let patch = E::jump_rel32(self.buf);
                self.branch(patch, target, code.len())?;
            }
            op::BRFALSE_S | op::BRTRUE_S | op::BRFALSE | op::BRTRUE => {
                let target = if byte == op::BRFALSE_S || byte == op::BRTRUE_S {
                    branch_target_s(code, pc)?
                } else {
                    branch_target(code, pc)?
                };
                let (reg, width) = self.pop_int(at)?;
                if width == Width::W32 {
                    E::zero_extend32(self.buf, reg, reg);
                }
                E::test(self.buf, reg, reg);
                let cond = if byte == op::BRTRUE_S || byte == op::BRTRUE {
                    Cond::NotEqual
                } else {
                    Cond::Equal
                };
                let patch = E::jump_conditional(self.buf, cond);
                self.branch(patch, target, code.len())?;
            }
            b if (op::BEQ_S..=op::BLT_UN_S).contains(&b) => {
                let target = branch_target_s(code, pc)?;
                let cond = compare_branch_cond(b - op::BEQ_S);
                self.compare_branch(cond, target, code.len(), at)?;
            }
            b if (op::BEQ..=op::BLT_UN).contains(&b) => {
                let target = branch_target(code, pc)?;
                let cond = compare_branch_cond(b - op::BEQ);
                self.compare_branch(cond, target, code.len(), at)?;
            }

            op::LDIND_I1 | op::LDIND_U1 | op::LDIND_I2 | op::LDIND_U2 | op::LDIND_I4
            | op::LDIND_U4 | op::LDIND_I8 | op::LDIND_I | op::LDIND_REF | op::LDIND_R4
            | op::LDIND_R8 => {
                self.load_indirect(byte, at)?;
            }
            op::STIND_REF | op::STIND_I1 | op::STIND_I2 | op::STIND_I4 | op::STIND_I8
            | op::STIND_R4 | op::STIND_R8 | op::STIND_I => {
                self.store_indirect(byte, at)?;
            }

            op::LDFLD => {
                let token = read_u32(code, pc)?;
                self.load_field(token, at)?;
            }
            op::LDFLDA => {
                let token = read_u32(code, pc)?;
                let field = self.resolver.field_info(token)?;
                let base = self.pop_address(at)?;
                let reg = self.push_int(Width::W64)?;
                E::load_address(self.buf, reg, base, field.offset as i32);
            }
            op::STFLD => {
                let token = read_u32(code, pc)?;
                self.store_field(token, at)?;
            }

            op::LDOBJ => {
                let token = read_u32(code, pc)?;
                let size = self.resolver.type_size(token)?;
                let (addr, _) = self.pop_int(at)?;
                self.stack.push(Value::Struct { addr, size });
            }
            op::STOBJ => {
                let token = read_u32(code, pc)?;
                let size = self.resolver.type_size(token)?;
                let value = self.pop(at)?;
                let (dst, _) = self.pop_int(at)?;
                match value {
                    Value::Struct { addr, .. } => self.emit_copy(dst, 0, addr, 0, size),
                    Value::Int(reg, _) => E::store64(self.buf, dst, 0, reg),
                    Value::Float(reg, true) => E::store_f64(self.buf, dst, 0, reg),
                    Value::Float(reg, false) => E::store_f32(self.buf, dst, 0, reg),
                }
            }

            op::CALL => {
                let token = read_u32(code, pc)?;
                let info = self.resolver.resolve_method(token)?;
                self.emit_call(&info, false, at)?;
            }
            op::CALLVIRT => {
                let token = read_u32(code, pc)?;
                let info = self.resolver.resolve_method(token)?;
                self.emit_call(&info, false, at)?;
            }
            op::NEWOBJ => {
                let token = read_u32(code, pc)?;
                let info = self.resolver.resolve_method(token)?;
                self.emit_call(&info, true, at)?;
            }

            op::RET => self.emit_ret(at)?,

            op::ENDFINALLY => {
                return Err(JitError::UnsupportedOpcode {
                    opcode: byte as u16,
                    offset: at,
                });
            }

            op::PREFIX => {
                let second = read_u8(code, pc)?;
                self.translate_prefixed(second, code, pc, at)?;
            }

            other => {
                return Err(JitError::UnsupportedOpcode {
                    opcode: other as u16,
                    offset: at,
                });
            }
        }
        Ok(())
    }

    fn translate_prefixed(&mut self, second: u8, code: &[u8], pc: &mut usize, at: usize) -> Result<()> {
        match second {
            op::P_CEQ => self.compare_value(Cond::Equal, Cond::Equal, at)?,
            op::P_CGT => self.compare_value(Cond::GreaterThan, Cond::Above, at)?,
            op::P_CGT_UN => self.compare_value(Cond::Above, Cond::Above, at)?,
            op::P_CLT => self.compare_value(Cond::LessThan, Cond::Below, at)?,
            op::P_CLT_UN => self.compare_value(Cond::Below, Cond::Below, at)?,
            op::P_LDARG => {
                let index = read_u16(code, pc)? as usize;
                self.load_arg(index, at)?;
            }
            op::P_LDARGA => {
                let index = read_u16(code, pc)? as usize;
                self.load_arg_address(index)?;
            }
            op::P_STARG => {
                let index = read_u16(code, pc)? as usize;
                self.store_arg(index, at)?;
            }
            op::P_LDLOC => {
                let index = read_u16(code, pc)? as usize;
                self.load_local(index, at)?;
            }
            op::P_LDLOCA => {
                let index = read_u16(code, pc)? as usize;
                let reg = self.push_int(Width::W64)?;
                E::load_address(self.buf, reg, VReg::Fp, E::local_slot_offset(index));
            }
            op::P_STLOC => {
                let index = read_u16(code, pc)? as usize;
                self.store_local(index, at)?;
            }
            op::P_INITOBJ => {
                let token = read_u32(code, pc)?;
                let size = self.resolver.type_size(token)?;
                let (addr, _) = self.pop_int(at)?;
                self.emit_zero(addr, size);
            }
            // Alignment and ordering prefixes are accepted and ignored; all
            // accesses are aligned-or-undefined.
            op::P_UNALIGNED => {
                let _alignment = read_u8(code, pc)?;
            }
            op::P_VOLATILE => {}
            other => {
                return Err(JitError::UnsupportedOpcode {
                    opcode: 0xFE00 | other as u16,
                    offset: at,
                });
            }
        }
        Ok(())
    }

    // Arguments and locals.

    fn load_arg(&mut self, index: usize, at: usize) -> Result<()> {
        let physical = index + self.ret_buf as usize;
        let ty = *self
            .physical_args
            .get(physical)
            .ok_or(JitError::StackUnderflow { offset: at })?;
        let offset = E::arg_home_offset(physical);
        match ty {
            TypeDesc::Int32 => {
                let reg = self.push_int(Width::W32)?;
                E::load32(self.buf, reg, VReg::Fp, offset);
            }
            TypeDesc::Float32 => {
                let reg = self.push_float(false)?;
                E::load_f32(self.buf, reg, VReg::Fp, offset);
            }
            TypeDesc::Float64 => {
                let reg = self.push_float(true)?;
                E::load_f64(self.buf, reg, VReg::Fp, offset);
            }
            TypeDesc::ValueType { size } if size > 8 => {
                // Large value types arrive by reference.
                let reg = self.push_struct(size)?;
                E::load64(self.buf, reg, VReg::Fp, offset);
            }
            _ => {
                let reg = self.push_int(Width::W64)?;
                E::load64(self.buf, reg, VReg::Fp, offset);
            }
        }
        Ok(())
    }

    fn load_arg_address(&mut self, index: usize) -> Result<()> {
        let physical = index + self.ret_buf as usize;
        let offset = E::arg_home_offset(physical);
        let by_ref_struct = matches!(
            self.physical_args.get(physical),
            Some(TypeDesc::ValueType { size }) if *size > 8
        );
        let reg = self.push_int(Width::W64)?;
        if by_ref_struct {
            // The home slot holds a pointer to the data already.
            E::load64(self.buf, reg, VReg::Fp, offset);
        } else {
            E::load_address(self.buf, reg, VReg::Fp, offset);
        }
        Ok(())
    }

    fn store_arg(&mut self, index: usize, at: usize) -> Result<()> {
        let physical = index + self.ret_buf as usize;
        let offset = E::arg_home_offset(physical);
        match self.pop(at)? {
            Value::Int(reg, Width::W32) => E::store32(self.buf, VReg::Fp, offset, reg),
            Value::Int(reg, Width::W64) => E::store64(self.buf, VReg::Fp, offset, reg),
            Value::Float(reg, false) => E::store_f32(self.buf, VReg::Fp, offset, reg),
            Value::Float(reg, true) => E::store_f64(self.buf, VReg::Fp, offset, reg),
            Value::Struct { addr, size } => {
                if size > 8 {
                    // By-reference argument: write through the stored
                    // pointer.
                    E::load64(self.buf, VReg::R1, VReg::Fp, offset);
                    self.emit_copy(VReg::R1, 0, addr, 0, size);
                } else {
                    E::load64(self.buf, VReg::R1, addr, 0);
                    E::store64(self.buf, VReg::Fp, offset, VReg::R1);
                }
            }
        }
        Ok(())
    }

    fn load_local(&mut self, index: usize, at: usize) -> Result<()> {
        let local = *self
            .layout
            .locals
            .get(index)
            .ok_or(JitError::StackUnderflow { offset: at })?;
        let offset = E::local_slot_offset(index);
        match local.ty {
            TypeDesc::Int32 => {
                let reg = self.push_int(Width::W32)?;
                E::load32(self.buf, reg, VReg::Fp, offset);
            }
            TypeDesc::Float32 => {
                let reg = self.push_float(false)?;
                E::load_f32(self.buf, reg, VReg::Fp, offset);
            }
            TypeDesc::Float64 => {
                let reg = self.push_float(true)?;
                E::load_f64(self.buf, reg, VReg::Fp, offset);
            }
            TypeDesc::ValueType { size } => {
                let reg = self.push_struct(size)?;
                E::load_address(self.buf, reg, VReg::Fp, offset);
            }
            _ => {
                let reg = self.push_int(Width::W64)?;
                E::load64(self.buf, reg, VReg::Fp, offset);
            }
        }
        Ok(())
    }

    fn store_local(&mut self, index: usize, at: usize) -> Result<()> {
        if index >= self.layout.locals.len() {
            return Err(JitError::UnsupportedOpcode {
                opcode: op::STLOC_S as u16,
                offset: at,
            });
        }
        let offset = E::local_slot_offset(index);
        match self.pop(at)? {
            Value::Int(reg, Width::W32) => E::store32(self.buf, VReg::Fp, offset, reg),
            Value::Int(reg, Width::W64) => E::store64(self.buf, VReg::Fp, offset, reg),
            Value::Float(reg, false) => E::store_f32(self.buf, VReg::Fp, offset, reg),
            Value::Float(reg, true) => E::store_f64(self.buf, VReg::Fp, offset, reg),
            Value::Struct { addr, size } => {
                self.emit_copy(VReg::Fp, offset, addr, 0, size);
            }
        }
        Ok(())
    }

    // Integer and float arithmetic.

    fn binary_alu(&mut self, byte: u8, at: usize) -> Result<()> {
        let rhs = self.pop(at)?;
        let lhs = self.pop(at)?;
        match (lhs, rhs) {
            (Value::Int(a, wa), Value::Int(b, wb)) => {
                let both32 = wa == Width::W32 && wb == Width::W32;
                if both32 {
                    match byte {
                        op::ADD => E::add32(self.buf, a, b),
                        op::SUB => E::sub32(self.buf, a, b),
                        op::MUL => E::imul32(self.buf, a, b),
                        op::AND => E::and(self.buf, a, b),
                        op::OR => E::or(self.buf, a, b),
                        op::XOR => E::xor(self.buf, a, b),
                        _ => unreachable!(),
                    }
                } else {
                    self.widen(a, wa);
                    self.widen(b, wb);
                    match byte {
                        op::ADD => E::add(self.buf, a, b),
                        op::SUB => E::sub(self.buf, a, b),
                        op::MUL => E::mul(self.buf, a, b),
                        op::AND => E::and(self.buf, a, b),
                        op::OR => E::or(self.buf, a, b),
                        op::XOR => E::xor(self.buf, a, b),
                        _ => unreachable!(),
                    }
                }
                let width = if both32 { Width::W32 } else { Width::W64 };
                self.stack.push(Value::Int(a, width));
            }
            (Value::Float(a, da), Value::Float(b, _)) => {
                match byte {
                    op::ADD => E::add_float(self.buf, a, b, da),
                    op::SUB => E::sub_float(self.buf, a, b, da),
                    op::MUL => E::mul_float(self.buf, a, b, da),
                    _ => {
                        return Err(JitError::UnsupportedOpcode {
                            opcode: byte as u16,
                            offset: at,
                        })
                    }
                }
                self.stack.push(Value::Float(a, da));
            }
            _ => {
                return Err(JitError::UnsupportedOpcode {
                    opcode: byte as u16,
                    offset: at,
                })
            }
        }
        Ok(())
    }

    fn division(&mut self, byte: u8, at: usize) -> Result<()> {
        let rhs = self.pop(at)?;
        let lhs = self.pop(at)?;
        match (lhs, rhs) {
            (Value::Int(a, wa), Value::Int(b, wb)) => {
                let signed = byte == op::DIV || byte == op::REM;
                if signed {
                    self.widen(a, wa);
                    self.widen(b, wb);
                } else {
                    if wa == Width::W32 {
                        E::zero_extend32(self.buf, a, a);
                    }
                    if wb == Width::W32 {
                        E::zero_extend32(self.buf, b, b);
                    }
                }
                // The divisor goes to a register the dividend setup cannot
                // clobber.
                E::mov_rr(self.buf, VReg::R1, b);
                if a != VReg::R0 {
                    E::mov_rr(self.buf, VReg::R0, a);
                }
                if signed {
                    E::sign_extend_dividend(self.buf);
                    E::div_signed(self.buf, VReg::R1);
                } else {
                    E::zero_reg(self.buf, VReg::R2);
                    E::div_unsigned(self.buf, VReg::R1);
                }
                let result = if byte == op::DIV || byte == op::DIV_UN {
                    VReg::R0
                } else {
                    VReg::R2
                };
                let dest = INT_TEMPS[self.stack.len()];
                if dest != result {
                    E::mov_rr(self.buf, dest, result);
                }
                let width = if wa == Width::W32 && wb == Width::W32 {
                    Width::W32
                } else {
                    Width::W64
                };
                self.stack.push(Value::Int(dest, width));
            }
            (Value::Float(a, da), Value::Float(b, _)) if byte == op::DIV => {
                E::div_float(self.buf, a, b, da);
                self.stack.push(Value::Float(a, da));
            }
            _ => {
                return Err(JitError::UnsupportedOpcode {
                    opcode: byte as u16,
                    offset: at,
                })
            }
        }
        Ok(())
    }

    fn shift(&mut self, byte: u8, at: usize) -> Result<()> {
        let (count, _) = self.pop_int(at)?;
        let (value, width) = self.pop_int(at)?;
        match (byte, width) {
            (op::SHL, _) => E::shift_left(self.buf, value, count),
            (op::SHR, Width::W32) => E::shift_right_signed32(self.buf, value, count),
            (op::SHR, Width::W64) => E::shift_right_signed(self.buf, value, count),
            (op::SHR_UN, Width::W32) => E::shift_right_unsigned32(self.buf, value, count),
            (op::SHR_UN, Width::W64) => E::shift_right_unsigned(self.buf, value, count),
            _ => unreachable!(),
        }
        self.stack.push(Value::Int(value, width));
        Ok(())
    }

    fn negate(&mut self, at: usize) -> Result<()> {
        match self.pop(at)? {
            Value::Int(reg, width) => {
                E::neg(self.buf, reg);
                self.stack.push(Value::Int(reg, width));
            }
            Value::Float(reg, is_double) => {
                let position = self.stack.len();
                if position + 1 >= FLOAT_TEMPS.len() {
                    return Err(JitError::StackDepthExceeded);
                }
                let zero = FLOAT_TEMPS[position + 1];
                E::xorps(self.buf, zero, zero);
                E::sub_float(self.buf, zero, reg, is_double);
                E::mov_ff(self.buf, reg, zero);
                self.stack.push(Value::Float(reg, is_double));
            }
            Value::Struct { .. } => {
                return Err(JitError::UnsupportedOpcode {
                    opcode: op::NEG as u16,
                    offset: at,
                })
            }
        }
        Ok(())
    }

    fn convert(&mut self, byte: u8, at: usize) -> Result<()> {
        let value = self.pop(at)?;
        match value {
            Value::Int(reg, width) => match byte {
                op::CONV_I1 => {
                    E::movsx_byte(self.buf, reg, reg);
                    self.stack.push(Value::Int(reg, Width::W32));
                }
                op::CONV_U1 => {
                    E::movzx_byte(self.buf, reg, reg);
                    self.stack.push(Value::Int(reg, Width::W32));
                }
                op::CONV_I2 => {
                    E::movsx_word(self.buf, reg, reg);
                    self.stack.push(Value::Int(reg, Width::W32));
                }
                op::CONV_U2 => {
                    E::movzx_word(self.buf, reg, reg);
                    self.stack.push(Value::Int(reg, Width::W32));
                }
                op::CONV_I4 => {
                    self.stack.push(Value::Int(reg, Width::W32));
                }
                op::CONV_U4 => {
                    E::zero_extend32(self.buf, reg, reg);
                    self.stack.push(Value::Int(reg, Width::W32));
                }
                op::CONV_I8 | op::CONV_I => {
                    self.widen(reg, width);
                    self.stack.push(Value::Int(reg, Width::W64));
                }
                op::CONV_U8 | op::CONV_U => {
                    if width == Width::W32 {
                        E::zero_extend32(self.buf, reg, reg);
                    }
                    self.stack.push(Value::Int(reg, Width::W64));
                }
                op::CONV_R4 | op::CONV_R8 => {
                    let to_double = byte == op::CONV_R8;
                    let dst = FLOAT_TEMPS[self.stack.len()];
                    match width {
                        Width::W32 => E::convert_int32_to_float(self.buf, dst, reg, to_double),
                        Width::W64 => E::convert_int64_to_float(self.buf, dst, reg, to_double),
                    }
                    self.stack.push(Value::Float(dst, to_double));
                }
                op::CONV_R_UN => {
                    if width == Width::W32 {
                        E::zero_extend32(self.buf, reg, reg);
                    }
                    let dst = FLOAT_TEMPS[self.stack.len()];
                    E::convert_int64_to_float(self.buf, dst, reg, true);
                    self.stack.push(Value::Float(dst, true));
                }
                _ => unreachable!(),
            },
            Value::Float(reg, is_double) => match byte {
                op::CONV_I1 | op::CONV_I2 | op::CONV_I4 | op::CONV_U1 | op::CONV_U2
                | op::CONV_U4 => {
                    let dst = INT_TEMPS[self.stack.len()];
                    E::convert_float_to_int64(self.buf, dst, reg, is_double);
                    match byte {
                        op::CONV_I1 => E::movsx_byte(self.buf, dst, dst),
                        op::CONV_U1 => E::movzx_byte(self.buf, dst, dst),
                        op::CONV_I2 => E::movsx_word(self.buf, dst, dst),
                        op::CONV_U2 => E::movzx_word(self.buf, dst, dst),
                        _ => {}
                    }
                    self.stack.push(Value::Int(dst, Width::W32));
                }
                op::CONV_I8 | op::CONV_U8 | op::CONV_I | op::CONV_U => {
                    let dst = INT_TEMPS[self.stack.len()];
                    E::convert_float_to_int64(self.buf, dst, reg, is_double);
                    self.stack.push(Value::Int(dst, Width::W64));
                }
                op::CONV_R4 => {
                    if is_double {
                        E::convert_float_precision(self.buf, reg, reg, false);
                    }
                    self.stack.push(Value::Float(reg, false));
                }
                op::CONV_R8 | op::CONV_R_UN => {
                    if !is_double {
                        E::convert_float_precision(self.buf, reg, reg, true);
                    }
                    self.stack.push(Value::Float(reg, true));
                }
                _ => unreachable!(),
            },
            Value::Struct { .. } => {
                return Err(JitError::UnsupportedOpcode {
                    opcode: byte as u16,
                    offset: at,
                })
            }
        }
        Ok(())
    }

    // Comparisons and branches.

    fn compare_operands(&mut self, at: usize) -> Result<bool> {
        let rhs = self.pop(at)?;
        let lhs = self.pop(at)?;
        match (lhs, rhs) {
            (Value::Int(a, wa), Value::Int(b, wb)) => {
                if wa == Width::W32 && wb == Width::W32 {
                    E::compare32(self.buf, a, b);
                } else {
                    self.widen(a, wa);
                    self.widen(b, wb);
                    E::compare(self.buf, a, b);
                }
                Ok(false)
            }
            (Value::Float(a, da), Value::Float(b, _)) => {
                E::ucomi(self.buf, a, b, da);
                Ok(true)
            }
            _ => Err(JitError::UnsupportedOpcode {
                opcode: 0,
                offset: at,
            }),
        }
    }

    fn compare_branch(&mut self, cond: BranchCond, target: usize, code_len: usize, at: usize) -> Result<()> {
        let float = self.compare_operands(at)?;
        let cond = if float { cond.float } else { cond.int };
        let patch = E::jump_conditional(self.buf, cond);
        self.branch(patch, target, code_len)
    }

    fn compare_value(&mut self, int_cond: Cond, float_cond: Cond, at: usize) -> Result<()> {
        let float = self.compare_operands(at)?;
        let cond = if float { float_cond } else { int_cond };
        let dst = self.push_int(Width::W32)?;
        E::mov_ri32(self.buf, dst, 1);
        let keep = E::jump_conditional(self.buf, cond);
        E::mov_ri32(self.buf, dst, 0);
        let here = self.buf.position();
        E::patch_jump(self.buf, keep, here);
        Ok(())
    }

    fn branch(&mut self, patch: usize, il_target: usize, code_len: usize) -> Result<()> {
        if il_target > code_len {
            return Err(JitError::BranchOutOfBounds { target: il_target });
        }
        if let Some(native) = self.native_offsets.get(il_target).and_then(|n| *n) {
            E::patch_jump(self.buf, patch, native as usize);
        } else {
            self.branch_fixups.push((patch, il_target));
        }
        Ok(())
    }

    // Memory access.

    fn pop_address(&mut self, at: usize) -> Result<VReg> {
        match self.pop(at)? {
            Value::Int(reg, _) => Ok(reg),
            Value::Struct { addr, .. } => Ok(addr),
            Value::Float(..) => Err(JitError::UnsupportedOpcode {
                opcode: 0,
                offset: at,
            }),
        }
    }

    fn load_indirect(&mut self, byte: u8, at: usize) -> Result<()> {
        let (addr, _) = self.pop_int(at)?;
        match byte {
            op::LDIND_R4 => {
                let dst = self.push_float(false)?;
                E::load_f32(self.buf, dst, addr, 0);
            }
            op::LDIND_R8 => {
                let dst = self.push_float(true)?;
                E::load_f64(self.buf, dst, addr, 0);
            }
            _ => {
                let (width, emit): (Width, fn(&mut CodeBuffer, VReg, VReg, i32)) = match byte {
                    op::LDIND_I1 => (Width::W32, E::load8_signed),
                    op::LDIND_U1 => (Width::W32, E::load8),
                    op::LDIND_I2 => (Width::W32, E::load16_signed),
                    op::LDIND_U2 => (Width::W32, E::load16),
                    op::LDIND_I4 => (Width::W32, E::load32_signed),
                    op::LDIND_U4 => (Width::W32, E::load32),
                    _ => (Width::W64, E::load64),
                };
                let dst = self.push_int(width)?;
                emit(self.buf, dst, addr, 0);
            }
        }
        Ok(())
    }

    fn store_indirect(&mut self, byte: u8, at: usize) -> Result<()> {
        let value = self.pop(at)?;
        let (addr, _) = self.pop_int(at)?;
        match (byte, value) {
            (op::STIND_R4, Value::Float(reg, _)) => E::store_f32(self.buf, addr, 0, reg),
            (op::STIND_R8, Value::Float(reg, _)) => E::store_f64(self.buf, addr, 0, reg),
            (op::STIND_I1, Value::Int(reg, _)) => E::store8(self.buf, addr, 0, reg),
            (op::STIND_I2, Value::Int(reg, _)) => E::store16(self.buf, addr, 0, reg),
            (op::STIND_I4, Value::Int(reg, _)) => E::store32(self.buf, addr, 0, reg),
            (op::STIND_I8 | op::STIND_I | op::STIND_REF, Value::Int(reg, _)) => {
                E::store64(self.buf, addr, 0, reg)
            }
            _ => {
                return Err(JitError::UnsupportedOpcode {
                    opcode: byte as u16,
                    offset: at,
                })
            }
        }
        Ok(())
    }

    fn load_field(&mut self, token: u32, at: usize) -> Result<()> {
        let field = self.resolver.field_info(token)?;
        let base = self.pop_address(at)?;
        let offset = field.offset as i32;
        match field.kind {
            FieldKind::Int8 => {
                let dst = self.push_int(Width::W32)?;
                E::load8_signed(self.buf, dst, base, offset);
            }
            FieldKind::UInt8 => {
                let dst = self.push_int(Width::W32)?;
                E::load8(self.buf, dst, base, offset);
            }
            FieldKind::Int16 => {
                let dst = self.push_int(Width::W32)?;
                E::load16_signed(self.buf, dst, base, offset);
            }
            FieldKind::UInt16 => {
                let dst = self.push_int(Width::W32)?;
                E::load16(self.buf, dst, base, offset);
            }
            FieldKind::Int32 | FieldKind::UInt32 => {
                let dst = self.push_int(Width::W32)?;
                E::load32(self.buf, dst, base, offset);
            }
            FieldKind::Int64 | FieldKind::Pointer => {
                let dst = self.push_int(Width::W64)?;
                E::load64(self.buf, dst, base, offset);
            }
            FieldKind::Float32 => {
                let dst = self.push_float(false)?;
                E::load_f32(self.buf, dst, base, offset);
            }
            FieldKind::Float64 => {
                let dst = self.push_float(true)?;
                E::load_f64(self.buf, dst, base, offset);
            }
            FieldKind::ValueType => {
                let dst = self.push_struct(field.size)?;
                E::load_address(self.buf, dst, base, offset);
            }
        }
        Ok(())
    }

    fn store_field(&mut self, token: u32, at: usize) -> Result<()> {
        let field = self.resolver.field_info(token)?;
        let value = self.pop(at)?;
        let base = self.pop_address(at)?;
        let offset = field.offset as i32;
        match (field.kind, value) {
            (FieldKind::Int8 | FieldKind::UInt8, Value::Int(reg, _)) => {
                E::store8(self.buf, base, offset, reg)
            }
            (FieldKind::Int16 | FieldKind::UInt16, Value::Int(reg, _)) => {
                E::store16(self.buf, base, offset, reg)
            }
            (FieldKind::Int32 | FieldKind::UInt32, Value::Int(reg, _)) => {
                E::store32(self.buf, base, offset, reg)
            }
            (FieldKind::Int64 | FieldKind::Pointer, Value::Int(reg, _)) => {
                E::store64(self.buf, base, offset, reg)
            }
            (FieldKind::Float32, Value::Float(reg, _)) => E::store_f32(self.buf, base, offset, reg),
            (FieldKind::Float64, Value::Float(reg, _)) => E::store_f64(self.buf, base, offset, reg),
            (FieldKind::ValueType, Value::Struct { addr, size }) => {
                self.emit_copy(base, offset, addr, 0, size)
            }
            (FieldKind::ValueType, Value::Int(reg, _)) => E::store64(self.buf, base, offset, reg),
            _ => {
                return Err(JitError::UnsupportedOpcode {
                    opcode: op::STFLD as u16,
                    offset: at,
                })
            }
        }
        Ok(())
    }

    fn emit_copy(&mut self, dst: VReg, dst_disp: i32, src: VReg, src_disp: i32, size: u32) {
        let size = size as i32;
        let mut done = 0;
        while size - done >= 8 {
            E::load64(self.buf, VReg::R1, src, src_disp + done);
            E::store64(self.buf, dst, dst_disp + done, VReg::R1);
            done += 8;
        }
        if size - done >= 4 {
            E::load32(self.buf, VReg::R1, src, src_disp + done);
            E::store32(self.buf, dst, dst_disp + done, VReg::R1);
            done += 4;
        }
        if size - done >= 2 {
            E::load16(self.buf, VReg::R1, src, src_disp + done);
            E::store16(self.buf, dst, dst_disp + done, VReg::R1);
            done += 2;
        }
        if size - done >= 1 {
            E::load8(self.buf, VReg::R1, src, src_disp + done);
            E::store8(self.buf, dst, dst_disp + done, VReg::R1);
        }
    }

    fn emit_zero(&mut self, dst: VReg, size: u32) {
        E::zero_reg(self.buf, VReg::R1);
        let size = size as i32;
        let mut done = 0;
        while size - done >= 8 {
            E::store64(self.buf, dst, done, VReg::R1);
            done += 8;
        }
        if size - done >= 4 {
            E::store32(self.buf, dst, done, VReg::R1);
            done += 4;
        }
        if size - done >= 2 {
            E::store16(self.buf, dst, done, VReg::R1);
            done += 2;
        }
        if size - done >= 1 {
            E::store8(self.buf, dst, done, VReg::R1);
        }
    }

    // Calls.

    fn emit_call(&mut self, info: &CalleeInfo, is_newobj: bool, at: usize) -> Result<()> {
        let declared = info.param_count as usize;
        let this_on_stack = info.has_this && !is_newobj;
        let popped = declared + this_on_stack as usize;
        if popped > self.stack.len() {
            return Err(JitError::StackUnderflow { offset: at });
        }

        let callee_ret_buf = info.return_kind == ReturnKind::Struct && info.return_struct_size > 8;
        let this_physical = callee_ret_buf as usize;
        let shift = this_physical + (info.has_this || is_newobj) as usize;
        let physical = shift + declared;
        if physical > MAX_CALL_ARGS || declared > 8 {
            return Err(JitError::TooManyArguments { count: physical });
        }

        let depth = self.stack.len();
        let first_arg_position = depth - declared;
        let this_position = this_on_stack.then(|| first_arg_position - 1);

        // Calls clobber every operand-stack temporary; park the whole stack
        // in the frame and feed the call from there.
        self.spill_stack();

        if is_newobj {
            E::mov_ri64(self.buf, VReg::R1, info.declaring_mt as u64);
            E::mov_ri64(self.buf, VReg::R0, self.helpers.alloc_object as u64);
            E::call_reg(self.buf, VReg::R0);
            // Keep the new object where the reloads cannot touch it.
            E::store64(self.buf, VReg::Fp, self.scratch_offset() + 56, VReg::R0);
        }

        // Interface dispatch resolves the concrete entry through a runtime
        // helper before the argument registers are live.
        let mut indirect_target: Option<VReg> = None;
        if let Dispatch::Interface { mt, slot } = info.dispatch {
            let this_src = self.spill_offset(this_position.unwrap_or(0));
            E::load64(self.buf, VReg::R1, VReg::Fp, this_src);
            E::mov_ri64(self.buf, VReg::R2, mt as u64);
            E::mov_ri64(self.buf, VReg::R3, slot as u64);
            E::mov_ri64(self.buf, VReg::R0, self.helpers.interface_dispatch as u64);
            E::call_reg(self.buf, VReg::R0);
            E::mov_rr(self.buf, VReg::R6, VReg::R0);
            indirect_target = Some(VReg::R6);
        }

        // Stack arguments, beyond the four register slots.
        for slot in E::ARG_REG_COUNT..physical {
            self.stage_argument(slot, VReg::R1, info, is_newobj, first_arg_position, this_position, callee_ret_buf)?;
            let disp = E::SHADOW_SPACE + 8 * (slot - E::ARG_REG_COUNT) as i32;
            E::store64(self.buf, VReg::Sp, disp, VReg::R1);
        }

        // Register arguments, loaded from the spill area.
        const INT_ARGS: [VReg; 4] = [VReg::R1, VReg::R2, VReg::R3, VReg::R4];
        const FLOAT_ARGS: [FReg; 4] = [FReg::F0, FReg::F1, FReg::F2, FReg::F3];
        for slot in 0..physical.min(E::ARG_REG_COUNT) {
            match self.physical_arg_kind(slot, shift, info) {
                ArgKind::Float32 => {
                    let src = self.argument_source(slot, is_newobj, first_arg_position, this_position, callee_ret_buf);
                    if let ArgSource::Spill(offset) = src {
                        E::load_f32(self.buf, FLOAT_ARGS[slot], VReg::Fp, offset);
                    }
                }
                ArgKind::Float64 => {
                    let src = self.argument_source(slot, is_newobj, first_arg_position, this_position, callee_ret_buf);
                    if let ArgSource::Spill(offset) = src {
                        E::load_f64(self.buf, FLOAT_ARGS[slot], VReg::Fp, offset);
                    }
                }
                _ => {
                    self.stage_argument(slot, INT_ARGS[slot], info, is_newobj, first_arg_position, this_position, callee_ret_buf)?;
                }
            }
        }

        // The call itself.
        match (info.dispatch, indirect_target) {
            (_, Some(target)) => E::call_reg(self.buf, target),
            (Dispatch::Vtable(slot), None) => {
                let this_reg = INT_ARGS[this_physical];
                E::load64(self.buf, VReg::R0, this_reg, 0);
                E::load64(self.buf, VReg::R0, VReg::R0, crate::metadata::MT_VTABLE_OFFSET);
                E::load64(self.buf, VReg::R0, VReg::R0, 8 * slot);
                E::call_reg(self.buf, VReg::R0);
            }
            (Dispatch::Direct | Dispatch::Interface { .. }, None) => {
                let target = match info.target {
                    CallTarget::Compiled(addr) | CallTarget::Pending(addr) => addr,
                    CallTarget::None => {
                        return Err(JitError::UnsupportedOpcode {
                            opcode: op::CALL as u16,
                            offset: at,
                        })
                    }
                };
                let patch = E::call_rel32(self.buf);
                self.call_fixups.push(CallFixup {
                    patch_offset: patch,
                    target,
                });
            }
        }
        // One safepoint per call-shaped instruction, past the dispatching
        // call. Allocation and interface-resolution helper calls on the way
        // here do not count.
        self.gc.push_safepoint(self.buf.position() as u32);

        // Drop consumed values, restore what survives, surface the result.
        self.stack.truncate(depth - popped);
        let live = self.stack.len();
        self.reload_stack(live);

        if is_newobj {
            let dst = self.push_int(Width::W64)?;
            E::load64(self.buf, dst, VReg::Fp, self.scratch_offset() + 56);
            return Ok(());
        }
        match info.return_kind {
            ReturnKind::Void => {}
            ReturnKind::Int32 => {
                let dst = self.push_int(Width::W32)?;
                if dst != VReg::R0 {
                    E::mov_rr(self.buf, dst, VReg::R0);
                }
            }
            ReturnKind::Int64 | ReturnKind::IntPtr => {
                let dst = self.push_int(Width::W64)?;
                if dst != VReg::R0 {
                    E::mov_rr(self.buf, dst, VReg::R0);
                }
            }
            ReturnKind::Float32 => {
                let dst = self.push_float(false)?;
                if dst != FReg::F0 {
                    E::mov_ff(self.buf, dst, FReg::F0);
                }
            }
            ReturnKind::Float64 => {
                let dst = self.push_float(true)?;
                if dst != FReg::F0 {
                    E::mov_ff(self.buf, dst, FReg::F0);
                }
            }
            ReturnKind::Struct => {
                if callee_ret_buf {
                    let size = info.return_struct_size as u32;
                    let dst = self.push_struct(size)?;
                    E::load_address(self.buf, dst, VReg::Fp, self.scratch_offset());
                } else {
                    let dst = self.push_int(Width::W64)?;
                    if dst != VReg::R0 {
                        E::mov_rr(self.buf, dst, VReg::R0);
                    }
                }
            }
        }
        Ok(())
    }

    fn physical_arg_kind(&self, slot: usize, shift: usize, info: &CalleeInfo) -> ArgKind {
        if slot < shift {
            ArgKind::IntPtr
        } else {
            ArgKind::from_nibble(info.arg_kinds.kind(slot - shift))
        }
    }

    /// Materializes physical argument `slot` into `dst`.
    fn stage_argument(
        &mut self,
        slot: usize,
        dst: VReg,
        info: &CalleeInfo,
        is_newobj: bool,
        first_arg_position: usize,
        this_position: Option<usize>,
        callee_ret_buf: bool,
    ) -> Result<()> {
        match self.argument_source(slot, is_newobj, first_arg_position, this_position, callee_ret_buf) {
            ArgSource::RetBuf => {
                E::load_address(self.buf, dst, VReg::Fp, self.scratch_offset());
            }
            ArgSource::NewObject => {
                E::load64(self.buf, dst, VReg::Fp, self.scratch_offset() + 56);
            }
            ArgSource::Spill(offset) => {
                E::load64(self.buf, dst, VReg::Fp, offset);
                // Small value types travel by value: dereference the carried
                // address.
                let shift = callee_ret_buf as usize + (info.has_this || is_newobj) as usize;
                if slot >= shift {
                    let position = first_arg_position + (slot - shift);
                    if let Value::Struct { size, .. } = self.stack[position] {
                        if size <= 8 {
                            E::load64(self.buf, dst, dst, 0);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn argument_source(
        &self,
        slot: usize,
        is_newobj: bool,
        first_arg_position: usize,
        this_position: Option<usize>,
        callee_ret_buf: bool,
    ) -> ArgSource {
        if callee_ret_buf && slot == 0 {
            return ArgSource::RetBuf;
        }
        let this_slot = callee_ret_buf as usize;
        if is_newobj && slot == this_slot {
            return ArgSource::NewObject;
        }
        if let Some(position) = this_position {
            if slot == this_slot {
                return ArgSource::Spill(self.spill_offset(position));
            }
        }
        let shift = this_slot + (is_newobj || this_position.is_some()) as usize;
        ArgSource::Spill(self.spill_offset(first_arg_position + (slot - shift)))
    }

    fn emit_ret(&mut self, at: usize) -> Result<()> {
        match self.layout.return_type {
            TypeDesc::Void => {}
            TypeDesc::Float32 | TypeDesc::Float64 => match self.pop(at)? {
                Value::Float(reg, _) => {
                    if reg != FReg::F0 {
                        E::mov_ff(self.buf, FReg::F0, reg);
                    }
                }
                _ => {
                    return Err(JitError::UnsupportedOpcode {
                        opcode: op::RET as u16,
                        offset: at,
                    })
                }
            },
            TypeDesc::ValueType { size } if size > 8 => match self.pop(at)? {
                Value::Struct { addr, size: value_size } => {
                    E::load64(self.buf, VReg::R7, VReg::Fp, E::local_slot_offset(self.ret_buf_slot));
                    self.emit_copy(VReg::R7, 0, addr, 0, value_size.min(size));
                    E::mov_rr(self.buf, VReg::R0, VReg::R7);
                }
                _ => {
                    return Err(JitError::UnsupportedOpcode {
                        opcode: op::RET as u16,
                        offset: at,
                    })
                }
            },
            TypeDesc::ValueType { .. } => match self.pop(at)? {
                Value::Struct { addr, .. } => E::load64(self.buf, VReg::R0, addr, 0),
                Value::Int(reg, _) => {
                    if reg != VReg::R0 {
                        E::mov_rr(self.buf, VReg::R0, reg);
                    }
                }
                _ => {
                    return Err(JitError::UnsupportedOpcode {
                        opcode: op::RET as u16,
                        offset: at,
                    })
                }
            },
            _ => match self.pop(at)? {
                Value::Int(reg, _) => {
                    if reg != VReg::R0 {
                        E::mov_rr(self.buf, VReg::R0, reg);
                    }
                }
                _ => {
                    return Err(JitError::UnsupportedOpcode {
                        opcode: op::RET as u16,
                        offset: at,
                    })
                }
            },
        }
        E::emit_epilogue(self.buf, self.frame_size);
        Ok(())
    }
}

enum ArgSource {
    /// Hidden return buffer: the scratch slot of this frame.
    RetBuf,
    /// The object just allocated by `newobj`.
    NewObject,
    /// A spilled operand-stack entry.
    Spill(i32),
}

struct BranchCond {
    int: Cond,
    float: Cond,
}

fn compare_branch_cond(index: u8) -> BranchCond {
    // beq, bge, bgt, ble, blt, bne.un, bge.un, bgt.un, ble.un, blt.un
    match index {
        0 => BranchCond { int: Cond::Equal, float: Cond::Equal },
        1 => BranchCond { int: Cond::GreaterOrEqual, float: Cond::AboveOrEqual },
        2 => BranchCond { int: Cond::GreaterThan, float: Cond::Above },
        3 => BranchCond { int: Cond::LessOrEqual, float: Cond::BelowOrEqual },
        4 => BranchCond { int: Cond::LessThan, float: Cond::Below },
        5 => BranchCond { int: Cond::NotEqual, float: Cond::NotEqual },
        6 => BranchCond { int: Cond::AboveOrEqual, float: Cond::AboveOrEqual },
        7 => BranchCond { int: Cond::Above, float: Cond::Above },
        8 => BranchCond { int: Cond::BelowOrEqual, float: Cond::BelowOrEqual },
        _ => BranchCond { int: Cond::Below, float: Cond::Below },
    }
}

// IL operand readers.

fn read_u8(code: &[u8], pc: &mut usize) -> Result<u8> {
    let byte = *code.get(*pc).ok_or(JitError::TruncatedInput)?;
    *pc += 1;
    Ok(byte)
}

fn read_i8(code: &[u8], pc: &mut usize) -> Result<i8> {
    Ok(read_u8(code, pc)? as i8)
}

fn read_u16(code: &[u8], pc: &mut usize) -> Result<u16> {
    let lo = read_u8(code, pc)? as u16;
    let hi = read_u8(code, pc)? as u16;
    Ok(lo | (hi << 8))
}

fn read_u32(code: &[u8], pc: &mut usize) -> Result<u32> {
    let mut value = 0u32;
    for i in 0..4 {
        value |= (read_u8(code, pc)? as u32) << (8 * i);
    }
    Ok(value)
}

fn read_i32(code: &[u8], pc: &mut usize) -> Result<i32> {
    Ok(read_u32(code, pc)? as i32)
}

fn read_u64(code: &[u8], pc: &mut usize) -> Result<u64> {
    let lo = read_u32(code, pc)? as u64;
    let hi = read_u32(code, pc)? as u64;
    Ok(lo | (hi << 32))
}

fn branch_target_s(code: &[u8], pc: &mut usize) -> Result<usize> {
    let rel = read_i8(code, pc)? as i64;
    let target = *pc as i64 + rel;
    if target < 0 {
        return Err(JitError::BranchOutOfBounds { target: 0 });
    }
    Ok(target as usize)
}

fn branch_target(code: &[u8], pc: &mut usize) -> Result<usize> {
    let rel = read_i32(code, pc)? as i64;
    let target = *pc as i64 + rel;
    if target < 0 {
        return Err(JitError::BranchOutOfBounds { target: 0 });
    }
    Ok(target as usize)
}
