//! Instruction-level verification of the x86-64 emitter: documented byte
//! sequences verbatim, plus decoder round-checks over the whole operation
//! surface.

use iced_x86::{Code, Decoder, DecoderOptions, Instruction, Mnemonic, Register};
use jit::buffer::CodeBuffer;
use jit::emit::x64::X64Emitter;
use jit::emit::{ArgHoming, CodeEmitter, Cond, FReg, VReg};

type E = X64Emitter;

fn emit(f: impl FnOnce(&mut CodeBuffer)) -> Vec<u8> {
    let mut storage = vec![0u8; 4096];
    let mut buf = unsafe { CodeBuffer::new(storage.as_mut_ptr(), storage.len()) };
    f(&mut buf);
    assert!(!buf.overflowed());
    let len = buf.position();
    storage.truncate(len);
    storage
}

fn decode(bytes: &[u8]) -> Vec<Instruction> {
    let mut decoder = Decoder::with_ip(64, bytes, 0x1000, DecoderOptions::NONE);
    let mut out = Vec::new();
    for instr in &mut decoder {
        assert!(!instr.is_invalid(), "invalid encoding in {:02x?}", bytes);
        out.push(instr);
    }
    out
}

#[test]
fn documented_sequences_are_bit_exact() {
    let cases: Vec<(Vec<u8>, Vec<u8>)> = vec![
        (
            emit(|b| E::mov_rr(b, VReg::R0, VReg::R1)),
            vec![0x48, 0x89, 0xC8],
        ),
        (
            emit(|b| E::mov_ri32(b, VReg::R0, 0x12345678)),
            vec![0x48, 0xC7, 0xC0, 0x78, 0x56, 0x34, 0x12],
        ),
        (
            emit(|b| E::add_imm(b, VReg::R0, 1)),
            vec![0x48, 0x83, 0xC0, 0x01],
        ),
        (
            emit(|b| E::mul(b, VReg::R0, VReg::R1)),
            vec![0x48, 0x0F, 0xAF, 0xC1],
        ),
        (emit(|b| E::zero_reg(b, VReg::R0)), vec![0x31, 0xC0]),
        (emit(|b| E::ret(b)), vec![0xC3]),
        (emit(|b| E::call_reg(b, VReg::R1)), vec![0xFF, 0xD1]),
    ];
    for (actual, expected) in cases {
        assert_eq!(actual, expected);
    }

    // LEAVE is emitted by the epilogue, just before RET.
    let epilogue = emit(|b| E::emit_epilogue(b, 112));
    assert_eq!(&epilogue[epilogue.len() - 2..], &[0xC9, 0xC3]);

    // Prologue entry: push rbp; mov rbp, rsp.
    let prologue = emit(|b| {
        E::emit_prologue(b, 0);
    });
    assert_eq!(&prologue[..4], &[0x55, 0x48, 0x89, 0xE5]);
}

#[test]
fn every_virtual_register_maps_to_a_distinct_physical() {
    let regs = [
        VReg::R0,
        VReg::R1,
        VReg::R2,
        VReg::R3,
        VReg::R4,
        VReg::R5,
        VReg::R6,
        VReg::R7,
        VReg::R8,
        VReg::R9,
        VReg::R10,
        VReg::R11,
        VReg::Sp,
        VReg::Fp,
    ];
    let mut seen = std::collections::HashSet::new();
    for reg in regs {
        assert!(seen.insert(E::map(reg)));
        assert!(E::map(reg) < 16);
    }
    assert_eq!(E::map(VReg::Sp), 4);
    assert_eq!(E::map(VReg::Fp), 5);
}

#[test]
fn loads_and_stores_decode_with_expected_operands() {
    let bytes = emit(|b| {
        E::load64(b, VReg::R0, VReg::Fp, 16);
        E::load32(b, VReg::R6, VReg::Fp, 24);
        E::load8_signed(b, VReg::R0, VReg::R1, 3);
        E::load16(b, VReg::R0, VReg::R1, 0x1000);
        E::store64(b, VReg::Fp, -8, VReg::R7);
        E::store8(b, VReg::R0, 1, VReg::R1);
        E::load_address(b, VReg::R2, VReg::Fp, -104);
    });
    let instrs = decode(&bytes);
    assert_eq!(instrs.len(), 7);

    assert_eq!(instrs[0].mnemonic(), Mnemonic::Mov);
    assert_eq!(instrs[0].op0_register(), Register::RAX);
    assert_eq!(instrs[0].memory_base(), Register::RBP);
    assert_eq!(instrs[0].memory_displacement64(), 16);

    assert_eq!(instrs[1].op0_register(), Register::R11D);
    assert_eq!(instrs[2].mnemonic(), Mnemonic::Movsx);
    assert_eq!(instrs[3].mnemonic(), Mnemonic::Movzx);

    assert_eq!(instrs[4].mnemonic(), Mnemonic::Mov);
    assert_eq!(instrs[4].op1_register(), Register::RBX);

    assert_eq!(instrs[6].mnemonic(), Mnemonic::Lea);
    assert_eq!(instrs[6].op0_register(), Register::RDX);
}

#[test]
fn arithmetic_width_variants() {
    let bytes = emit(|b| {
        E::add(b, VReg::R0, VReg::R1);
        E::add32(b, VReg::R0, VReg::R1);
        E::sub(b, VReg::R6, VReg::R5);
        E::sub32(b, VReg::R6, VReg::R5);
        E::imul32(b, VReg::R6, VReg::R5);
        E::neg(b, VReg::R0);
        E::not(b, VReg::R0);
    });
    let instrs = decode(&bytes);
    assert_eq!(instrs[0].mnemonic(), Mnemonic::Add);
    assert_eq!(instrs[0].op0_register(), Register::RAX);
    assert_eq!(instrs[1].op0_register(), Register::EAX);
    assert_eq!(instrs[2].op0_register(), Register::R11);
    assert_eq!(instrs[3].op0_register(), Register::R11D);
    assert_eq!(instrs[4].mnemonic(), Mnemonic::Imul);
    assert_eq!(instrs[4].op0_register(), Register::R11D);
    assert_eq!(instrs[5].mnemonic(), Mnemonic::Neg);
    assert_eq!(instrs[6].mnemonic(), Mnemonic::Not);
}

#[test]
fn division_sequence_uses_implicit_registers() {
    let bytes = emit(|b| {
        E::sign_extend_dividend(b);
        E::div_signed(b, VReg::R1);
        E::div_unsigned(b, VReg::R1);
    });
    let instrs = decode(&bytes);
    assert_eq!(instrs[0].mnemonic(), Mnemonic::Cqo);
    assert_eq!(instrs[1].mnemonic(), Mnemonic::Idiv);
    assert_eq!(instrs[2].mnemonic(), Mnemonic::Div);
}

#[test]
fn conditional_jumps_cover_all_conditions() {
    let conds = [
        (Cond::Equal, Mnemonic::Je),
        (Cond::NotEqual, Mnemonic::Jne),
        (Cond::LessThan, Mnemonic::Jl),
        (Cond::LessOrEqual, Mnemonic::Jle),
        (Cond::GreaterThan, Mnemonic::Jg),
        (Cond::GreaterOrEqual, Mnemonic::Jge),
        (Cond::Below, Mnemonic::Jb),
        (Cond::BelowOrEqual, Mnemonic::Jbe),
        (Cond::Above, Mnemonic::Ja),
        (Cond::AboveOrEqual, Mnemonic::Jae),
    ];
    for (cond, mnemonic) in conds {
        let bytes = emit(|b| {
            let patch = E::jump_conditional(b, cond);
            E::patch_jump(b, patch, 0);
        });
        let instrs = decode(&bytes);
        assert_eq!(instrs[0].mnemonic(), mnemonic);
    }
}

#[test]
fn branch_patching_resolves_forward_and_backward() {
    let bytes = emit(|b| {
        // Backward: jump to offset 0.
        E::zero_reg(b, VReg::R0);
        let back = E::jump_rel32(b);
        E::patch_jump(b, back, 0);
        // Forward: jump over a nop-equivalent to the end.
        let fwd = E::jump_rel32(b);
        E::zero_reg(b, VReg::R1);
        let end = b.position();
        E::patch_jump(b, fwd, end);
    });
    let instrs = decode(&bytes);
    // jmp targets: 0x1000 (start) and the end of the buffer.
    assert_eq!(instrs[1].near_branch_target(), 0x1000);
    assert_eq!(
        instrs[2].near_branch_target(),
        0x1000 + bytes.len() as u64
    );
}

#[test]
fn sse_scalar_surface_decodes() {
    let bytes = emit(|b| {
        E::load_f32(b, FReg::F0, VReg::Fp, 16);
        E::load_f64(b, FReg::F1, VReg::Fp, 24);
        E::store_f32(b, VReg::Fp, 32, FReg::F2);
        E::store_f64(b, VReg::Fp, 40, FReg::F3);
        E::add_float(b, FReg::F0, FReg::F1, true);
        E::sub_float(b, FReg::F0, FReg::F1, false);
        E::mul_float(b, FReg::F4, FReg::F5, true);
        E::div_float(b, FReg::F4, FReg::F5, false);
        E::convert_int32_to_float(b, FReg::F0, VReg::R0, true);
        E::convert_int64_to_float(b, FReg::F0, VReg::R0, false);
        E::convert_float_to_int64(b, VReg::R0, FReg::F0, true);
        E::convert_float_precision(b, FReg::F0, FReg::F1, true);
        E::ucomi(b, FReg::F0, FReg::F1, true);
        E::ucomi(b, FReg::F0, FReg::F1, false);
        E::xorps(b, FReg::F0, FReg::F0);
        E::movaps(b, FReg::F0, FReg::F1);
        E::movapd(b, FReg::F0, FReg::F1);
        E::round(b, FReg::F0, FReg::F1, 0x3, true);
        E::mov_to_float(b, FReg::F0, VReg::R0);
        E::mov_from_float(b, VReg::R0, FReg::F0);
    });
    let instrs = decode(&bytes);
    let mnemonics: Vec<Mnemonic> = instrs.iter().map(|i| i.mnemonic()).collect();
    assert_eq!(
        mnemonics,
        vec![
            Mnemonic::Movss,
            Mnemonic::Movsd,
            Mnemonic::Movss,
            Mnemonic::Movsd,
            Mnemonic::Addsd,
            Mnemonic::Subss,
            Mnemonic::Mulsd,
            Mnemonic::Divss,
            Mnemonic::Cvtsi2sd,
            Mnemonic::Cvtsi2ss,
            Mnemonic::Cvttsd2si,
            Mnemonic::Cvtss2sd,
            Mnemonic::Ucomisd,
            Mnemonic::Ucomiss,
            Mnemonic::Xorps,
            Mnemonic::Movaps,
            Mnemonic::Movapd,
            Mnemonic::Roundsd,
            Mnemonic::Movq,
            Mnemonic::Movq,
        ]
    );
    // High XMM registers pick up REX bits.
    let high = emit(|b| E::movaps(b, FReg::F8, FReg::F15));
    let instrs = decode(&high);
    assert_eq!(instrs[0].op0_register(), Register::XMM8);
    assert_eq!(instrs[0].op1_register(), Register::XMM15);
}

#[test]
fn prologue_and_epilogue_frame_contract() {
    let mut frame_size = 0;
    let bytes = emit(|b| {
        frame_size = E::emit_prologue(b, 128);
        E::emit_epilogue(b, frame_size);
    });
    // 40 callee-save + 128 locals + 64 outgoing, 16-aligned.
    assert_eq!(frame_size, 240);
    assert_eq!(frame_size % 16, 0);

    let instrs = decode(&bytes);
    assert_eq!(instrs[0].mnemonic(), Mnemonic::Push);
    assert_eq!(instrs[0].op0_register(), Register::RBP);
    assert_eq!(instrs[1].mnemonic(), Mnemonic::Mov);
    assert_eq!(instrs[2].mnemonic(), Mnemonic::Sub);
    assert_eq!(instrs[2].immediate32(), 240);

    // Five callee-save spills at fixed frame offsets, mirrored by reloads.
    let saves: Vec<Register> = instrs[3..8].iter().map(|i| i.op1_register()).collect();
    assert_eq!(
        saves,
        vec![
            Register::RBX,
            Register::R12,
            Register::R13,
            Register::R14,
            Register::R15
        ]
    );
    let reloads: Vec<Register> = instrs[8..13].iter().map(|i| i.op0_register()).collect();
    assert_eq!(
        reloads,
        vec![
            Register::RBX,
            Register::R12,
            Register::R13,
            Register::R14,
            Register::R15
        ]
    );
    assert_eq!(instrs[13].mnemonic(), Mnemonic::Leave);
    assert_eq!(instrs[14].mnemonic(), Mnemonic::Ret);
}

#[test]
fn argument_homing_spills_to_shadow_slots() {
    let kinds = [
        ArgHoming::Int,
        ArgHoming::Float64,
        ArgHoming::Float32,
        ArgHoming::Int,
    ];
    let bytes = emit(|b| E::home_arguments(b, 6, &kinds));
    let instrs = decode(&bytes);
    // Only the four register arguments are homed.
    assert_eq!(instrs.len(), 4);

    assert_eq!(instrs[0].op1_register(), Register::RCX);
    assert_eq!(instrs[0].memory_displacement64(), 16);

    assert_eq!(instrs[1].mnemonic(), Mnemonic::Movq);
    assert_eq!(instrs[1].op1_register(), Register::XMM1);
    assert_eq!(instrs[1].memory_displacement64(), 24);

    assert_eq!(instrs[2].mnemonic(), Mnemonic::Movd);
    assert_eq!(instrs[2].op1_register(), Register::XMM2);

    assert_eq!(instrs[3].op1_register(), Register::R9);
    assert_eq!(instrs[3].memory_displacement64(), 40);
}

#[test]
fn call_rel32_reserves_patchable_displacement() {
    let bytes = emit(|b| {
        let patch = E::call_rel32(b);
        assert_eq!(patch, 1);
        E::ret(b);
        // Point the call at the ret.
        E::patch_jump(b, patch, 5);
    });
    let instrs = decode(&bytes);
    assert_eq!(instrs[0].mnemonic(), Mnemonic::Call);
    assert_eq!(instrs[0].near_branch_target(), 0x1005);
}

#[test]
fn shift_family_masks_and_moves_count() {
    let bytes = emit(|b| {
        E::shift_left_imm(b, VReg::R0, 5);
        E::shift_right_signed_imm(b, VReg::R0, 7);
        E::shift_right_unsigned_imm(b, VReg::R0, 9);
        E::shift_right_signed32(b, VReg::R0, VReg::R2);
        E::shift_right_unsigned(b, VReg::R0, VReg::R2);
    });
    let instrs = decode(&bytes);
    assert_eq!(instrs[0].mnemonic(), Mnemonic::Shl);
    assert_eq!(instrs[0].immediate8(), 5);
    assert_eq!(instrs[1].mnemonic(), Mnemonic::Sar);
    assert_eq!(instrs[2].mnemonic(), Mnemonic::Shr);
    // Variable forms: mov rcx, rdx then the cl-sourced shift.
    assert_eq!(instrs[3].mnemonic(), Mnemonic::Mov);
    assert_eq!(instrs[3].op0_register(), Register::RCX);
    assert_eq!(instrs[4].mnemonic(), Mnemonic::Sar);
    assert_eq!(instrs[4].op0_register(), Register::EAX);
    assert_eq!(instrs[6].mnemonic(), Mnemonic::Shr);
    assert_eq!(instrs[6].op0_register(), Register::RAX);
}
