//! x86-64 realization of the emitter interface.
//!
//! Encoding discipline: every helper computes the REX byte by OR-ing
//! `W=0x08`, `R=0x04`, `X=0x02`, `B=0x01` onto the `0x40` base and emits it
//! only when a bit is set. `RBP`/`R13` bases always carry a displacement;
//! `RSP`/`R12` bases always emit a SIB byte. Immediate forms pick `imm8`
//! when the value fits in a signed byte.

use super::{ArgHoming, CodeEmitter, Cond, FReg, VReg};
use crate::buffer::CodeBuffer;

pub struct X64Emitter;

// Physical register numbers.
const RAX: u8 = 0;
const RCX: u8 = 1;
const RDX: u8 = 2;
const RBX: u8 = 3;
const RSP: u8 = 4;
const RBP: u8 = 5;
const R8: u8 = 8;
const R9: u8 = 9;
const R10: u8 = 10;
const R11: u8 = 11;
const R12: u8 = 12;
const R13: u8 = 13;
const R14: u8 = 14;
const R15: u8 = 15;

fn gpr(reg: VReg) -> u8 {
    X64Emitter::map(reg)
}

fn xmm(reg: FReg) -> u8 {
    match reg {
        FReg::F0 => 0,
        FReg::F1 => 1,
        FReg::F2 => 2,
        FReg::F3 => 3,
        FReg::F4 => 4,
        FReg::F5 => 5,
        FReg::F6 => 6,
        FReg::F7 => 7,
        FReg::F8 => 8,
        FReg::F9 => 9,
        FReg::F10 => 10,
        FReg::F11 => 11,
        FReg::F12 => 12,
        FReg::F13 => 13,
        FReg::F14 => 14,
        FReg::F15 => 15,
    }
}

fn rex_byte(w: bool, reg: u8, index: u8, base: u8) -> u8 {
    let mut rex = 0x40;
    if w {
        rex |= 0x08;
    }
    if reg & 8 != 0 {
        rex |= 0x04;
    }
    if index & 8 != 0 {
        rex |= 0x02;
    }
    if base & 8 != 0 {
        rex |= 0x01;
    }
    rex
}

fn emit_rex(buf: &mut CodeBuffer, w: bool, reg: u8, rm: u8, force: bool) {
    let rex = rex_byte(w, reg, 0, rm);
    if rex != 0x40 || force {
        buf.emit_u8(rex);
    }
}

fn modrm_rr(buf: &mut CodeBuffer, reg: u8, rm: u8) {
    buf.emit_u8(0xC0 | ((reg & 7) << 3) | (rm & 7));
}

/// ModRM + optional SIB + displacement for a `[base + disp]` operand.
fn mem_operand(buf: &mut CodeBuffer, reg: u8, base: u8, disp: i32) {
    let base_low = base & 7;
    let need_sib = base_low == RSP;
    // RBP/R13 have no disp-less form; their mod=00 encoding means RIP-relative.
    let md: u8 = if disp == 0 && base_low != RBP {
        0
    } else if (-128..=127).contains(&disp) {
        1
    } else {
        2
    };
    let rm = if need_sib { RSP } else { base_low };
    buf.emit_u8((md << 6) | ((reg & 7) << 3) | rm);
    if need_sib {
        // scale=1, no index.
        buf.emit_u8(0x20 | base_low);
    }
    match md {
        1 => buf.emit_u8(disp as i8 as u8),
        2 => buf.emit_i32(disp),
        _ => {}
    }
}

/// Reg-reg instruction: `[rex] opcode modrm(reg, rm)`.
fn op_rr(buf: &mut CodeBuffer, w: bool, opcode: &[u8], reg: u8, rm: u8) {
    emit_rex(buf, w, reg, rm, false);
    buf.emit_bytes(opcode);
    modrm_rr(buf, reg, rm);
}

/// Reg-mem instruction: `[rex] opcode modrm/sib/disp`.
fn op_rm(buf: &mut CodeBuffer, w: bool, opcode: &[u8], reg: u8, base: u8, disp: i32) {
    emit_rex(buf, w, reg, base, false);
    buf.emit_bytes(opcode);
    mem_operand(buf, reg, base, disp);
}

/// ALU op with immediate: `83 /ext ib` when the value fits, else `81 /ext id`.
fn alu_imm(buf: &mut CodeBuffer, ext: u8, rm: u8, imm: i32) {
    emit_rex(buf, true, 0, rm, false);
    if (-128..=127).contains(&imm) {
        buf.emit_u8(0x83);
        modrm_rr(buf, ext, rm);
        buf.emit_u8(imm as i8 as u8);
    } else {
        buf.emit_u8(0x81);
        modrm_rr(buf, ext, rm);
        buf.emit_i32(imm);
    }
}

/// Scalar SSE op: `prefix [rex] 0F op modrm(reg, rm)`.
fn sse_rr(buf: &mut CodeBuffer, prefix: Option<u8>, w: bool, op: u8, reg: u8, rm: u8) {
    if let Some(prefix) = prefix {
        buf.emit_u8(prefix);
    }
    emit_rex(buf, w, reg, rm, false);
    buf.emit_u8(0x0F);
    buf.emit_u8(op);
    modrm_rr(buf, reg, rm);
}

fn sse_rm(buf: &mut CodeBuffer, prefix: Option<u8>, w: bool, op: u8, reg: u8, base: u8, disp: i32) {
    if let Some(prefix) = prefix {
        buf.emit_u8(prefix);
    }
    emit_rex(buf, w, reg, base, false);
    buf.emit_u8(0x0F);
    buf.emit_u8(op);
    mem_operand(buf, reg, base, disp);
}

fn cond_code(cond: Cond) -> u8 {
    match cond {
        Cond::Equal => 0x4,
        Cond::NotEqual => 0x5,
        Cond::Below => 0x2,
        Cond::AboveOrEqual => 0x3,
        Cond::BelowOrEqual => 0x6,
        Cond::Above => 0x7,
        Cond::LessThan => 0xC,
        Cond::GreaterOrEqual => 0xD,
        Cond::LessOrEqual => 0xE,
        Cond::GreaterThan => 0xF,
    }
}

fn push_r64(buf: &mut CodeBuffer, reg: u8) {
    if reg & 8 != 0 {
        buf.emit_u8(0x41);
    }
    buf.emit_u8(0x50 | (reg & 7));
}

/// The callee-saved registers spilled by the prologue, with their fixed
/// frame-pointer-relative slots.
const SAVED_REGS: [(u8, i32); 5] = [(RBX, -8), (R12, -16), (R13, -24), (R14, -32), (R15, -40)];

const INT_ARG_REGS: [u8; 4] = [RCX, RDX, R8, R9];

impl CodeEmitter for X64Emitter {
    const ARG_REG_COUNT: usize = 4;
    const SHADOW_SPACE: i32 = 32;
    const STACK_ALIGN: i32 = 16;
    const CALLEE_SAVE_BYTES: i32 = 40;
    // Shadow space plus four stack-argument slots.
    const OUTGOING_BYTES: i32 = 64;

    fn map(reg: VReg) -> u8 {
        match reg {
            VReg::R0 => RAX,
            VReg::R1 => RCX,
            VReg::R2 => RDX,
            VReg::R3 => R8,
            VReg::R4 => R9,
            VReg::R5 => R10,
            VReg::R6 => R11,
            VReg::R7 => RBX,
            VReg::R8 => R12,
            VReg::R9 => R13,
            VReg::R10 => R14,
            VReg::R11 => R15,
            VReg::Sp => RSP,
            VReg::Fp => RBP,
        }
    }

    fn mov_rr(buf: &mut CodeBuffer, dst: VReg, src: VReg) {
        op_rr(buf, true, &[0x89], gpr(src), gpr(dst));
    }

    fn mov_ri32(buf: &mut CodeBuffer, dst: VReg, imm: i32) {
        let dst = gpr(dst);
        emit_rex(buf, true, 0, dst, false);
        buf.emit_u8(0xC7);
        modrm_rr(buf, 0, dst);
        buf.emit_i32(imm);
    }

    fn mov_ri64(buf: &mut CodeBuffer, dst: VReg, imm: u64) {
        let dst = gpr(dst);
        buf.emit_u8(rex_byte(true, 0, 0, dst));
        buf.emit_u8(0xB8 | (dst & 7));
        buf.emit_u64(imm);
    }

    fn zero_reg(buf: &mut CodeBuffer, dst: VReg) {
        let dst = gpr(dst);
        op_rr(buf, false, &[0x31], dst, dst);
    }

    fn load8(buf: &mut CodeBuffer, dst: VReg, base: VReg, disp: i32) {
        op_rm(buf, false, &[0x0F, 0xB6], gpr(dst), gpr(base), disp);
    }

    fn load16(buf: &mut CodeBuffer, dst: VReg, base: VReg, disp: i32) {
        op_rm(buf, false, &[0x0F, 0xB7], gpr(dst), gpr(base), disp);
    }

    fn load32(buf: &mut CodeBuffer, dst: VReg, base: VReg, disp: i32) {
        op_rm(buf, false, &[0x8B], gpr(dst), gpr(base), disp);
    }

    fn load64(buf: &mut CodeBuffer, dst: VReg, base: VReg, disp: i32) {
        op_rm(buf, true, &[0x8B], gpr(dst), gpr(base), disp);
    }

    fn load8_signed(buf: &mut CodeBuffer, dst: VReg, base: VReg, disp: i32) {
        op_rm(buf, true, &[0x0F, 0xBE], gpr(dst), gpr(base), disp);
    }

    fn load16_signed(buf: &mut CodeBuffer, dst: VReg, base: VReg, disp: i32) {
        op_rm(buf, true, &[0x0F, 0xBF], gpr(dst), gpr(base), disp);
    }

    fn load32_signed(buf: &mut CodeBuffer, dst: VReg, base: VReg, disp: i32) {
        op_rm(buf, true, &[0x63], gpr(dst), gpr(base), disp);
    }

    fn store8(buf: &mut CodeBuffer, base: VReg, disp: i32, src: VReg) {
        let src = gpr(src);
        let base = gpr(base);
        // SPL/BPL/SIL/DIL need a REX prefix to be addressed as byte
        // registers instead of AH/CH/DH/BH.
        let force = (4..=7).contains(&src);
        emit_rex(buf, false, src, base, force);
        buf.emit_u8(0x88);
        mem_operand(buf, src, base, disp);
    }

    fn store16(buf: &mut CodeBuffer, base: VReg, disp: i32, src: VReg) {
        buf.emit_u8(0x66);
        op_rm(buf, false, &[0x89], gpr(src), gpr(base), disp);
    }

    fn store32(buf: &mut CodeBuffer, base: VReg, disp: i32, src: VReg) {
        op_rm(buf, false, &[0x89], gpr(src), gpr(base), disp);
    }

    fn store64(buf: &mut CodeBuffer, base: VReg, disp: i32, src: VReg) {
        op_rm(buf, true, &[0x89], gpr(src), gpr(base), disp);
    }

    fn load_address(buf: &mut CodeBuffer, dst: VReg, base: VReg, disp: i32) {
        op_rm(buf, true, &[0x8D], gpr(dst), gpr(base), disp);
    }

    fn add(buf: &mut CodeBuffer, dst: VReg, src: VReg) {
        op_rr(buf, true, &[0x01], gpr(src), gpr(dst));
    }

    fn add_imm(buf: &mut CodeBuffer, dst: VReg, imm: i32) {
        alu_imm(buf, 0, gpr(dst), imm);
    }

    fn sub(buf: &mut CodeBuffer, dst: VReg, src: VReg) {
        op_rr(buf, true, &[0x29], gpr(src), gpr(dst));
    }

    fn sub_imm(buf: &mut CodeBuffer, dst: VReg, imm: i32) {
        alu_imm(buf, 5, gpr(dst), imm);
    }

    fn mul(buf: &mut CodeBuffer, dst: VReg, src: VReg) {
        op_rr(buf, true, &[0x0F, 0xAF], gpr(dst), gpr(src));
    }

    fn div_signed(buf: &mut CodeBuffer, divisor: VReg) {
        op_rr(buf, true, &[0xF7], 7, gpr(divisor));
    }

    fn div_unsigned(buf: &mut CodeBuffer, divisor: VReg) {
        op_rr(buf, true, &[0xF7], 6, gpr(divisor));
    }

    fn sign_extend_dividend(buf: &mut CodeBuffer) {
        buf.emit_u8(0x48);
        buf.emit_u8(0x99);
    }

    fn neg(buf: &mut CodeBuffer, dst: VReg) {
        op_rr(buf, true, &[0xF7], 3, gpr(dst));
    }

    fn add32(buf: &mut CodeBuffer, dst: VReg, src: VReg) {
        op_rr(buf, false, &[0x01], gpr(src), gpr(dst));
    }

    fn sub32(buf: &mut CodeBuffer, dst: VReg, src: VReg) {
        op_rr(buf, false, &[0x29], gpr(src), gpr(dst));
    }

    fn imul32(buf: &mut CodeBuffer, dst: VReg, src: VReg) {
        op_rr(buf, false, &[0x0F, 0xAF], gpr(dst), gpr(src));
    }

    fn and(buf: &mut CodeBuffer, dst: VReg, src: VReg) {
        op_rr(buf, true, &[0x21], gpr(src), gpr(dst));
    }

    fn and_imm(buf: &mut CodeBuffer, dst: VReg, imm: i32) {
        alu_imm(buf, 4, gpr(dst), imm);
    }

    fn or(buf: &mut CodeBuffer, dst: VReg, src: VReg) {
        op_rr(buf, true, &[0x09], gpr(src), gpr(dst));
    }

    fn xor(buf: &mut CodeBuffer, dst: VReg, src: VReg) {
        op_rr(buf, true, &[0x31], gpr(src), gpr(dst));
    }

    fn not(buf: &mut CodeBuffer, dst: VReg) {
        op_rr(buf, true, &[0xF7], 2, gpr(dst));
    }

    fn shift_left(buf: &mut CodeBuffer, dst: VReg, count: VReg) {
        if gpr(count) != RCX {
            op_rr(buf, true, &[0x89], gpr(count), RCX);
        }
        op_rr(buf, true, &[0xD3], 4, gpr(dst));
    }

    fn shift_left_imm(buf: &mut CodeBuffer, dst: VReg, imm: u8) {
        op_rr(buf, true, &[0xC1], 4, gpr(dst));
        buf.emit_u8(imm);
    }

    fn shift_right_signed(buf: &mut CodeBuffer, dst: VReg, count: VReg) {
        if gpr(count) != RCX {
            op_rr(buf, true, &[0x89], gpr(count), RCX);
        }
        op_rr(buf, true, &[0xD3], 7, gpr(dst));
    }

    fn shift_right_signed_imm(buf: &mut CodeBuffer, dst: VReg, imm: u8) {
        op_rr(buf, true, &[0xC1], 7, gpr(dst));
        buf.emit_u8(imm);
    }

    fn shift_right_signed32(buf: &mut CodeBuffer, dst: VReg, count: VReg) {
        if gpr(count) != RCX {
            op_rr(buf, true, &[0x89], gpr(count), RCX);
        }
        op_rr(buf, false, &[0xD3], 7, gpr(dst));
    }

    fn shift_right_unsigned(buf: &mut CodeBuffer, dst: VReg, count: VReg) {
        if gpr(count) != RCX {
            op_rr(buf, true, &[0x89], gpr(count), RCX);
        }
        op_rr(buf, true, &[0xD3], 5, gpr(dst));
    }

    fn shift_right_unsigned_imm(buf: &mut CodeBuffer, dst: VReg, imm: u8) {
        op_rr(buf, true, &[0xC1], 5, gpr(dst));
        buf.emit_u8(imm);
    }

    fn shift_right_unsigned32(buf: &mut CodeBuffer, dst: VReg, count: VReg) {
        if gpr(count) != RCX {
            op_rr(buf, true, &[0x89], gpr(count), RCX);
        }
        op_rr(buf, false, &[0xD3], 5, gpr(dst));
    }

    fn compare(buf: &mut CodeBuffer, a: VReg, b: VReg) {
        op_rr(buf, true, &[0x39], gpr(b), gpr(a));
    }

    fn compare32(buf: &mut CodeBuffer, a: VReg, b: VReg) {
        op_rr(buf, false, &[0x39], gpr(b), gpr(a));
    }

    fn compare_imm(buf: &mut CodeBuffer, a: VReg, imm: i32) {
        alu_imm(buf, 7, gpr(a), imm);
    }

    fn test(buf: &mut CodeBuffer, a: VReg, b: VReg) {
        op_rr(buf, true, &[0x85], gpr(b), gpr(a));
    }

    fn cmovz(buf: &mut CodeBuffer, dst: VReg, src: VReg) {
        op_rr(buf, true, &[0x0F, 0x44], gpr(dst), gpr(src));
    }

    fn ret(buf: &mut CodeBuffer) {
        buf.emit_u8(0xC3);
    }

    fn call_reg(buf: &mut CodeBuffer, target: VReg) {
        let target = gpr(target);
        emit_rex(buf, false, 0, target, false);
        buf.emit_u8(0xFF);
        modrm_rr(buf, 2, target);
    }

    fn call_rel32(buf: &mut CodeBuffer) -> usize {
        buf.emit_u8(0xE8);
        buf.reserve_u32()
    }

    fn jump_rel32(buf: &mut CodeBuffer) -> usize {
        buf.emit_u8(0xE9);
        buf.reserve_u32()
    }

    fn jump_reg(buf: &mut CodeBuffer, target: VReg) {
        let target = gpr(target);
        emit_rex(buf, false, 0, target, false);
        buf.emit_u8(0xFF);
        modrm_rr(buf, 4, target);
    }

    fn jump_conditional(buf: &mut CodeBuffer, cond: Cond) -> usize {
        buf.emit_u8(0x0F);
        buf.emit_u8(0x80 | cond_code(cond));
        buf.reserve_u32()
    }

    fn patch_jump(buf: &mut CodeBuffer, patch_offset: usize, target: usize) {
        let rel = target as i64 - (patch_offset as i64 + 4);
        buf.patch_u32(patch_offset, rel as i32 as u32);
    }

    fn load_f32(buf: &mut CodeBuffer, dst: FReg, base: VReg, disp: i32) {
        sse_rm(buf, Some(0xF3), false, 0x10, xmm(dst), gpr(base), disp);
    }

    fn load_f64(buf: &mut CodeBuffer, dst: FReg, base: VReg, disp: i32) {
        sse_rm(buf, Some(0xF2), false, 0x10, xmm(dst), gpr(base), disp);
    }

    fn store_f32(buf: &mut CodeBuffer, base: VReg, disp: i32, src: FReg) {
        sse_rm(buf, Some(0xF3), false, 0x11, xmm(src), gpr(base), disp);
    }

    fn store_f64(buf: &mut CodeBuffer, base: VReg, disp: i32, src: FReg) {
        sse_rm(buf, Some(0xF2), false, 0x11, xmm(src), gpr(base), disp);
    }

    fn mov_ff(buf: &mut CodeBuffer, dst: FReg, src: FReg) {
        Self::movaps(buf, dst, src);
    }

    fn add_float(buf: &mut CodeBuffer, dst: FReg, src: FReg, is_double: bool) {
        let prefix = if is_double { 0xF2 } else { 0xF3 };
        sse_rr(buf, Some(prefix), false, 0x58, xmm(dst), xmm(src));
    }

    fn sub_float(buf: &mut CodeBuffer, dst: FReg, src: FReg, is_double: bool) {
        let prefix = if is_double { 0xF2 } else { 0xF3 };
        sse_rr(buf, Some(prefix), false, 0x5C, xmm(dst), xmm(src));
    }

    fn mul_float(buf: &mut CodeBuffer, dst: FReg, src: FReg, is_double: bool) {
        let prefix = if is_double { 0xF2 } else { 0xF3 };
        sse_rr(buf, Some(prefix), false, 0x59, xmm(dst), xmm(src));
    }

    fn div_float(buf: &mut CodeBuffer, dst: FReg, src: FReg, is_double: bool) {
        let prefix = if is_double { 0xF2 } else { 0xF3 };
        sse_rr(buf, Some(prefix), false, 0x5E, xmm(dst), xmm(src));
    }

    fn convert_int32_to_float(buf: &mut CodeBuffer, dst: FReg, src: VReg, to_double: bool) {
        let prefix = if to_double { 0xF2 } else { 0xF3 };
        sse_rr(buf, Some(prefix), false, 0x2A, xmm(dst), gpr(src));
    }

    fn convert_int64_to_float(buf: &mut CodeBuffer, dst: FReg, src: VReg, to_double: bool) {
        let prefix = if to_double { 0xF2 } else { 0xF3 };
        sse_rr(buf, Some(prefix), true, 0x2A, xmm(dst), gpr(src));
    }

    fn convert_float_to_int64(buf: &mut CodeBuffer, dst: VReg, src: FReg, from_double: bool) {
        let prefix = if from_double { 0xF2 } else { 0xF3 };
        sse_rr(buf, Some(prefix), true, 0x2C, gpr(dst), xmm(src));
    }

    fn convert_float_precision(buf: &mut CodeBuffer, dst: FReg, src: FReg, to_double: bool) {
        let prefix = if to_double { 0xF3 } else { 0xF2 };
        sse_rr(buf, Some(prefix), false, 0x5A, xmm(dst), xmm(src));
    }

    fn ucomi(buf: &mut CodeBuffer, a: FReg, b: FReg, is_double: bool) {
        let prefix = if is_double { Some(0x66) } else { None };
        sse_rr(buf, prefix, false, 0x2E, xmm(a), xmm(b));
    }

    fn xorps(buf: &mut CodeBuffer, dst: FReg, src: FReg) {
        sse_rr(buf, None, false, 0x57, xmm(dst), xmm(src));
    }

    fn movaps(buf: &mut CodeBuffer, dst: FReg, src: FReg) {
        sse_rr(buf, None, false, 0x28, xmm(dst), xmm(src));
    }

    fn movapd(buf: &mut CodeBuffer, dst: FReg, src: FReg) {
        sse_rr(buf, Some(0x66), false, 0x28, xmm(dst), xmm(src));
    }

    fn round(buf: &mut CodeBuffer, dst: FReg, src: FReg, mode: u8, is_double: bool) {
        buf.emit_u8(0x66);
        emit_rex(buf, false, xmm(dst), xmm(src), false);
        buf.emit_u8(0x0F);
        buf.emit_u8(0x3A);
        buf.emit_u8(if is_double { 0x0B } else { 0x0A });
        modrm_rr(buf, xmm(dst), xmm(src));
        buf.emit_u8(mode);
    }

    fn mov_to_float(buf: &mut CodeBuffer, dst: FReg, src: VReg) {
        sse_rr(buf, Some(0x66), true, 0x6E, xmm(dst), gpr(src));
    }

    fn mov_from_float(buf: &mut CodeBuffer, dst: VReg, src: FReg) {
        sse_rr(buf, Some(0x66), true, 0x7E, xmm(src), gpr(dst));
    }

    fn zero_extend32(buf: &mut CodeBuffer, dst: VReg, src: VReg) {
        op_rr(buf, false, &[0x89], gpr(src), gpr(dst));
    }

    fn movsx_byte(buf: &mut CodeBuffer, dst: VReg, src: VReg) {
        op_rr(buf, true, &[0x0F, 0xBE], gpr(dst), gpr(src));
    }

    fn movsx_word(buf: &mut CodeBuffer, dst: VReg, src: VReg) {
        op_rr(buf, true, &[0x0F, 0xBF], gpr(dst), gpr(src));
    }

    fn movzx_byte(buf: &mut CodeBuffer, dst: VReg, src: VReg) {
        op_rr(buf, true, &[0x0F, 0xB6], gpr(dst), gpr(src));
    }

    fn movzx_word(buf: &mut CodeBuffer, dst: VReg, src: VReg) {
        op_rr(buf, true, &[0x0F, 0xB7], gpr(dst), gpr(src));
    }

    fn movsxd_rr(buf: &mut CodeBuffer, dst: VReg, src: VReg) {
        op_rr(buf, true, &[0x63], gpr(dst), gpr(src));
    }

    fn movsxd_rm(buf: &mut CodeBuffer, dst: VReg, base: VReg, disp: i32) {
        op_rm(buf, true, &[0x63], gpr(dst), gpr(base), disp);
    }

    fn emit_prologue(buf: &mut CodeBuffer, local_bytes: u32) -> u32 {
        let raw = Self::CALLEE_SAVE_BYTES as u32 + local_bytes + Self::OUTGOING_BYTES as u32;
        let frame_size = (raw + 15) & !15;

        push_r64(buf, RBP);
        op_rr(buf, true, &[0x89], RSP, RBP);
        alu_imm(buf, 5, RSP, frame_size as i32);
        for (reg, offset) in SAVED_REGS {
            op_rm(buf, true, &[0x89], reg, RBP, offset);
        }
        frame_size
    }

    fn emit_epilogue(buf: &mut CodeBuffer, frame_size: u32) {
        debug_assert_eq!(frame_size % 16, 0);
        for (reg, offset) in SAVED_REGS {
            op_rm(buf, true, &[0x8B], reg, RBP, offset);
        }
        buf.emit_u8(0xC9);
        buf.emit_u8(0xC3);
    }

    fn home_arguments(buf: &mut CodeBuffer, arg_count: usize, kinds: &[ArgHoming]) {
        for index in 0..arg_count.min(Self::ARG_REG_COUNT) {
            let disp = Self::arg_home_offset(index);
            let kind = kinds.get(index).copied().unwrap_or_default();
            match kind {
                ArgHoming::Int => {
                    op_rm(buf, true, &[0x89], INT_ARG_REGS[index], RBP, disp);
                }
                ArgHoming::Float32 => {
                    sse_rm(buf, Some(0x66), false, 0x7E, index as u8, RBP, disp);
                }
                ArgHoming::Float64 => {
                    sse_rm(buf, Some(0x66), true, 0x7E, index as u8, RBP, disp);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emit(f: impl FnOnce(&mut CodeBuffer)) -> Vec<u8> {
        let mut storage = vec![0u8; 256];
        let mut buf = unsafe { CodeBuffer::new(storage.as_mut_ptr(), storage.len()) };
        f(&mut buf);
        let len = buf.position();
        assert!(!buf.overflowed());
        storage.truncate(len);
        storage
    }

    #[test]
    fn documented_byte_sequences() {
        assert_eq!(
            emit(|b| X64Emitter::mov_rr(b, VReg::R0, VReg::R1)),
            [0x48, 0x89, 0xC8]
        );
        assert_eq!(
            emit(|b| X64Emitter::mov_ri32(b, VReg::R0, 0x12345678)),
            [0x48, 0xC7, 0xC0, 0x78, 0x56, 0x34, 0x12]
        );
        assert_eq!(
            emit(|b| X64Emitter::add_imm(b, VReg::R0, 1)),
            [0x48, 0x83, 0xC0, 0x01]
        );
        assert_eq!(
            emit(|b| X64Emitter::mul(b, VReg::R0, VReg::R1)),
            [0x48, 0x0F, 0xAF, 0xC1]
        );
        assert_eq!(emit(|b| X64Emitter::zero_reg(b, VReg::R0)), [0x31, 0xC0]);
        assert_eq!(emit(|b| X64Emitter::ret(b)), [0xC3]);
        assert_eq!(emit(|b| X64Emitter::call_reg(b, VReg::R1)), [0xFF, 0xD1]);
    }

    #[test]
    fn prologue_entry_bytes() {
        let bytes = emit(|b| {
            X64Emitter::emit_prologue(b, 0);
        });
        assert_eq!(&bytes[..4], &[0x55, 0x48, 0x89, 0xE5]);
    }

    #[test]
    fn rsp_base_gets_sib_and_rbp_base_gets_disp() {
        // mov rax, [rsp] needs a SIB byte even with no displacement.
        assert_eq!(
            emit(|b| X64Emitter::load64(b, VReg::R0, VReg::Sp, 0)),
            [0x48, 0x8B, 0x04, 0x24]
        );
        // mov rax, [rbp] has no disp-less encoding; disp8 of zero appears.
        assert_eq!(
            emit(|b| X64Emitter::load64(b, VReg::R0, VReg::Fp, 0)),
            [0x48, 0x8B, 0x45, 0x00]
        );
        // r12/r13 behave like rsp/rbp modulo the REX.B bit.
        assert_eq!(
            emit(|b| X64Emitter::load64(b, VReg::R0, VReg::R8, 0)),
            [0x49, 0x8B, 0x04, 0x24]
        );
        assert_eq!(
            emit(|b| X64Emitter::load64(b, VReg::R0, VReg::R9, 0)),
            [0x49, 0x8B, 0x45, 0x00]
        );
    }

    #[test]
    fn byte_store_from_high_encoding_forces_rex() {
        // mov [rax], spl must not assemble as mov [rax], ah.
        assert_eq!(
            emit(|b| X64Emitter::store8(b, VReg::R0, 0, VReg::Sp)),
            [0x40, 0x88, 0x20]
        );
        // Low-numbered sources keep the compact form.
        assert_eq!(
            emit(|b| X64Emitter::store8(b, VReg::R0, 0, VReg::R1)),
            [0x88, 0x08]
        );
    }

    #[test]
    fn imm_width_selection() {
        assert_eq!(
            emit(|b| X64Emitter::add_imm(b, VReg::R0, -128)),
            [0x48, 0x83, 0xC0, 0x80]
        );
        assert_eq!(
            emit(|b| X64Emitter::add_imm(b, VReg::R0, 128)),
            [0x48, 0x81, 0xC0, 0x80, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn variable_shift_routes_count_through_rcx() {
        let bytes = emit(|b| X64Emitter::shift_left(b, VReg::R0, VReg::R2));
        // mov rcx, rdx; shl rax, cl
        assert_eq!(bytes, [0x48, 0x89, 0xD1, 0x48, 0xD3, 0xE0]);
        // Count already in rcx: no extra move.
        let bytes = emit(|b| X64Emitter::shift_left(b, VReg::R0, VReg::R1));
        assert_eq!(bytes, [0x48, 0xD3, 0xE0]);
    }
}
