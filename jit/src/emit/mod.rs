//! Architecture-neutral code-emitter interface.
//!
//! A target supplies static operations over a [`CodeBuffer`]; there is no
//! per-instance state, so multiple emitters may run concurrently against
//! disjoint buffers. The IL compiler is generic over [`CodeEmitter`] and the
//! Tier-0 driver instantiates it with [`x64::X64Emitter`].

use crate::buffer::CodeBuffer;

pub mod x64;

/// Virtual integer register. Each target maps these onto physical registers
/// with [`CodeEmitter::map`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VReg {
    R0,
    R1,
    R2,
    R3,
    R4,
    R5,
    R6,
    R7,
    R8,
    R9,
    R10,
    R11,
    Sp,
    Fp,
}

/// Virtual float register, mapped onto the target's vector registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FReg {
    F0,
    F1,
    F2,
    F3,
    F4,
    F5,
    F6,
    F7,
    F8,
    F9,
    F10,
    F11,
    F12,
    F13,
    F14,
    F15,
}

/// Branch condition, mapped to the target's condition codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cond {
    Equal,
    NotEqual,
    LessThan,
    LessOrEqual,
    GreaterThan,
    GreaterOrEqual,
    Below,
    BelowOrEqual,
    Above,
    AboveOrEqual,
}

/// How an argument is homed on method entry: through an integer register or
/// through a float register of the given width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ArgHoming {
    #[default]
    Int,
    Float32,
    Float64,
}

/// Local variable slots are fixed-size so value types up to this many bytes
/// fit with upward field growth.
pub const LOCAL_SLOT_BYTES: i32 = 64;

/// Static instruction-emission surface of one target.
///
/// Displacement-carrying operations take `(base, disp)` memory operands; the
/// target picks the densest encoding. Immediate forms pick the short
/// immediate when the value fits.
pub trait CodeEmitter {
    /// Argument registers in the target calling convention.
    const ARG_REG_COUNT: usize;
    /// Bytes of caller-reserved spill space for register arguments.
    const SHADOW_SPACE: i32;
    /// Required stack alignment at call sites.
    const STACK_ALIGN: i32;
    /// Bytes the prologue reserves for callee-saved registers.
    const CALLEE_SAVE_BYTES: i32;
    /// Bytes reserved below the locals for outgoing arguments (shadow space
    /// plus the supported stack-argument slots).
    const OUTGOING_BYTES: i32;

    /// Physical register number for a virtual register.
    fn map(reg: VReg) -> u8;

    /// Frame-pointer-relative offset of local slot `index`.
    fn local_slot_offset(index: usize) -> i32 {
        -(Self::CALLEE_SAVE_BYTES + LOCAL_SLOT_BYTES * (index as i32 + 1))
    }

    /// Frame-pointer-relative offset of the home slot of argument `index`.
    fn arg_home_offset(index: usize) -> i32 {
        16 + 8 * index as i32
    }

    // Register ops.
    fn mov_rr(buf: &mut CodeBuffer, dst: VReg, src: VReg);
    fn mov_ri32(buf: &mut CodeBuffer, dst: VReg, imm: i32);
    fn mov_ri64(buf: &mut CodeBuffer, dst: VReg, imm: u64);
    fn zero_reg(buf: &mut CodeBuffer, dst: VReg);

    // Loads and stores.
    fn load8(buf: &mut CodeBuffer, dst: VReg, base: VReg, disp: i32);
    fn load16(buf: &mut CodeBuffer, dst: VReg, base: VReg, disp: i32);
    fn load32(buf: &mut CodeBuffer, dst: VReg, base: VReg, disp: i32);
    fn load64(buf: &mut CodeBuffer, dst: VReg, base: VReg, disp: i32);
    fn load8_signed(buf: &mut CodeBuffer, dst: VReg, base: VReg, disp: i32);
    fn load16_signed(buf: &mut CodeBuffer, dst: VReg, base: VReg, disp: i32);
    fn load32_signed(buf: &mut CodeBuffer, dst: VReg, base: VReg, disp: i32);
    fn store8(buf: &mut CodeBuffer, base: VReg, disp: i32, src: VReg);
    fn store16(buf: &mut CodeBuffer, base: VReg, disp: i32, src: VReg);
    fn store32(buf: &mut CodeBuffer, base: VReg, disp: i32, src: VReg);
    fn store64(buf: &mut CodeBuffer, base: VReg, disp: i32, src: VReg);
    fn load_address(buf: &mut CodeBuffer, dst: VReg, base: VReg, disp: i32);

    // Integer arithmetic.
    fn add(buf: &mut CodeBuffer, dst: VReg, src: VReg);
    fn add_imm(buf: &mut CodeBuffer, dst: VReg, imm: i32);
    fn sub(buf: &mut CodeBuffer, dst: VReg, src: VReg);
    fn sub_imm(buf: &mut CodeBuffer, dst: VReg, imm: i32);
    fn mul(buf: &mut CodeBuffer, dst: VReg, src: VReg);
    /// Divides the target's implicit dividend pair by `divisor`; the caller
    /// must have sign-extended the high half first.
    fn div_signed(buf: &mut CodeBuffer, divisor: VReg);
    /// Unsigned division; the caller must have zeroed the high half.
    fn div_unsigned(buf: &mut CodeBuffer, divisor: VReg);
    /// Sign-extends the implicit dividend into the high half.
    fn sign_extend_dividend(buf: &mut CodeBuffer);
    fn neg(buf: &mut CodeBuffer, dst: VReg);
    fn add32(buf: &mut CodeBuffer, dst: VReg, src: VReg);
    fn sub32(buf: &mut CodeBuffer, dst: VReg, src: VReg);
    fn imul32(buf: &mut CodeBuffer, dst: VReg, src: VReg);

    // Bitwise and shifts.
    fn and(buf: &mut CodeBuffer, dst: VReg, src: VReg);
    fn and_imm(buf: &mut CodeBuffer, dst: VReg, imm: i32);
    fn or(buf: &mut CodeBuffer, dst: VReg, src: VReg);
    fn xor(buf: &mut CodeBuffer, dst: VReg, src: VReg);
    fn not(buf: &mut CodeBuffer, dst: VReg);
    fn shift_left(buf: &mut CodeBuffer, dst: VReg, count: VReg);
    fn shift_left_imm(buf: &mut CodeBuffer, dst: VReg, imm: u8);
    fn shift_right_signed(buf: &mut CodeBuffer, dst: VReg, count: VReg);
    fn shift_right_signed_imm(buf: &mut CodeBuffer, dst: VReg, imm: u8);
    fn shift_right_signed32(buf: &mut CodeBuffer, dst: VReg, count: VReg);
    fn shift_right_unsigned(buf: &mut CodeBuffer, dst: VReg, count: VReg);
    fn shift_right_unsigned_imm(buf: &mut CodeBuffer, dst: VReg, imm: u8);
    fn shift_right_unsigned32(buf: &mut CodeBuffer, dst: VReg, count: VReg);

    // Comparisons.
    fn compare(buf: &mut CodeBuffer, a: VReg, b: VReg);
    fn compare32(buf: &mut CodeBuffer, a: VReg, b: VReg);
    fn compare_imm(buf: &mut CodeBuffer, a: VReg, imm: i32);
    fn test(buf: &mut CodeBuffer, a: VReg, b: VReg);
    fn cmovz(buf: &mut CodeBuffer, dst: VReg, src: VReg);

    // Control flow.
    fn ret(buf: &mut CodeBuffer);
    fn call_reg(buf: &mut CodeBuffer, target: VReg);
    /// Emits a relative call with a reserved displacement; returns the patch
    /// offset.
    fn call_rel32(buf: &mut CodeBuffer) -> usize;
    fn jump_rel32(buf: &mut CodeBuffer) -> usize;
    fn jump_reg(buf: &mut CodeBuffer, target: VReg);
    fn jump_conditional(buf: &mut CodeBuffer, cond: Cond) -> usize;
    /// Resolves a reserved displacement against a target position inside the
    /// same buffer.
    fn patch_jump(buf: &mut CodeBuffer, patch_offset: usize, target: usize);

    // Scalar float.
    fn load_f32(buf: &mut CodeBuffer, dst: FReg, base: VReg, disp: i32);
    fn load_f64(buf: &mut CodeBuffer, dst: FReg, base: VReg, disp: i32);
    fn store_f32(buf: &mut CodeBuffer, base: VReg, disp: i32, src: FReg);
    fn store_f64(buf: &mut CodeBuffer, base: VReg, disp: i32, src: FReg);
    fn mov_ff(buf: &mut CodeBuffer, dst: FReg, src: FReg);
    fn add_float(buf: &mut CodeBuffer, dst: FReg, src: FReg, is_double: bool);
    fn sub_float(buf: &mut CodeBuffer, dst: FReg, src: FReg, is_double: bool);
    fn mul_float(buf: &mut CodeBuffer, dst: FReg, src: FReg, is_double: bool);
    fn div_float(buf: &mut CodeBuffer, dst: FReg, src: FReg, is_double: bool);
    fn convert_int32_to_float(buf: &mut CodeBuffer, dst: FReg, src: VReg, to_double: bool);
    fn convert_int64_to_float(buf: &mut CodeBuffer, dst: FReg, src: VReg, to_double: bool);
    /// Truncating conversion.
    fn convert_float_to_int64(buf: &mut CodeBuffer, dst: VReg, src: FReg, from_double: bool);
    fn convert_float_precision(buf: &mut CodeBuffer, dst: FReg, src: FReg, to_double: bool);
    fn ucomi(buf: &mut CodeBuffer, a: FReg, b: FReg, is_double: bool);
    fn xorps(buf: &mut CodeBuffer, dst: FReg, src: FReg);
    fn movaps(buf: &mut CodeBuffer, dst: FReg, src: FReg);
    fn movapd(buf: &mut CodeBuffer, dst: FReg, src: FReg);
    fn round(buf: &mut CodeBuffer, dst: FReg, src: FReg, mode: u8, is_double: bool);
    /// Raw bit move between the integer and float files.
    fn mov_to_float(buf: &mut CodeBuffer, dst: FReg, src: VReg);
    fn mov_from_float(buf: &mut CodeBuffer, dst: VReg, src: FReg);

    // Width conversions.
    fn zero_extend32(buf: &mut CodeBuffer, dst: VReg, src: VReg);
    fn movsx_byte(buf: &mut CodeBuffer, dst: VReg, src: VReg);
    fn movsx_word(buf: &mut CodeBuffer, dst: VReg, src: VReg);
    fn movzx_byte(buf: &mut CodeBuffer, dst: VReg, src: VReg);
    fn movzx_word(buf: &mut CodeBuffer, dst: VReg, src: VReg);
    fn movsxd_rr(buf: &mut CodeBuffer, dst: VReg, src: VReg);
    fn movsxd_rm(buf: &mut CodeBuffer, dst: VReg, base: VReg, disp: i32);

    // Frame management.
    /// Emits the method prologue for `local_bytes` bytes of locals; returns
    /// the frame size subtracted from the stack pointer.
    fn emit_prologue(buf: &mut CodeBuffer, local_bytes: u32) -> u32;
    fn emit_epilogue(buf: &mut CodeBuffer, frame_size: u32);
    /// Spills the register arguments into their home slots.
    fn home_arguments(buf: &mut CodeBuffer, arg_count: usize, kinds: &[ArgHoming]);
}
