//! CIL opcode values consumed by the single-pass translator.
//!
//! Two-byte opcodes live behind the `0xFE` prefix and are listed with their
//! second byte.

pub const NOP: u8 = 0x00;
pub const BREAK: u8 = 0x01;
pub const LDARG_0: u8 = 0x02;
pub const LDARG_1: u8 = 0x03;
pub const LDARG_2: u8 = 0x04;
pub const LDARG_3: u8 = 0x05;
pub const LDLOC_0: u8 = 0x06;
pub const LDLOC_1: u8 = 0x07;
pub const LDLOC_2: u8 = 0x08;
pub const LDLOC_3: u8 = 0x09;
pub const STLOC_0: u8 = 0x0A;
pub const STLOC_1: u8 = 0x0B;
pub const STLOC_2: u8 = 0x0C;
pub const STLOC_3: u8 = 0x0D;
pub const LDARG_S: u8 = 0x0E;
pub const LDARGA_S: u8 = 0x0F;
pub const STARG_S: u8 = 0x10;
pub const LDLOC_S: u8 = 0x11;
pub const LDLOCA_S: u8 = 0x12;
pub const STLOC_S: u8 = 0x13;
pub const LDNULL: u8 = 0x14;
pub const LDC_I4_M1: u8 = 0x15;
pub const LDC_I4_0: u8 = 0x16;
pub const LDC_I4_8: u8 = 0x1E;
pub const LDC_I4_S: u8 = 0x1F;
pub const LDC_I4: u8 = 0x20;
pub const LDC_I8: u8 = 0x21;
pub const LDC_R4: u8 = 0x22;
pub const LDC_R8: u8 = 0x23;
pub const DUP: u8 = 0x25;
pub const POP: u8 = 0x26;
pub const CALL: u8 = 0x28;
pub const RET: u8 = 0x2A;
pub const BR_S: u8 = 0x2B;
pub const BRFALSE_S: u8 = 0x2C;
pub const BRTRUE_S: u8 = 0x2D;
pub const BEQ_S: u8 = 0x2E;
pub const BGE_S: u8 = 0x2F;
pub const BGT_S: u8 = 0x30;
pub const BLE_S: u8 = 0x31;
pub const BLT_S: u8 = 0x32;
pub const BNE_UN_S: u8 = 0x33;
pub const BGE_UN_S: u8 = 0x34;
pub const BGT_UN_S: u8 = 0x35;
pub const BLE_UN_S: u8 = 0x36;
pub const BLT_UN_S: u8 = 0x37;
pub const BR: u8 = 0x38;
pub const BRFALSE: u8 = 0x39;
pub const BRTRUE: u8 = 0x3A;
pub const BEQ: u8 = 0x3B;
pub const BGE: u8 = 0x3C;
pub const BGT: u8 = 0x3D;
pub const BLE: u8 = 0x3E;
pub const BLT: u8 = 0x3F;
pub const BNE_UN: u8 = 0x40;
pub const BGE_UN: u8 = 0x41;
pub const BGT_UN: u8 = 0x42;
pub const BLE_UN: u8 = 0x43;
pub const BLT_UN: u8 = 0x44;
pub const LDIND_I1: u8 = 0x46;
pub const LDIND_U1: u8 = 0x47;
pub const LDIND_I2: u8 = 0x48;
pub const LDIND_U2: u8 = 0x49;
pub const LDIND_I4: u8 = 0x4A;
pub const LDIND_U4: u8 = 0x4B;
pub const LDIND_I8: u8 = 0x4C;
pub const LDIND_I: u8 = 0x4D;
pub const LDIND_R4: u8 = 0x4E;
pub const LDIND_R8: u8 = 0x4F;
pub const LDIND_REF: u8 = 0x50;
pub const STIND_REF: u8 = 0x51;
pub const STIND_I1: u8 = 0x52;
pub const STIND_I2: u8 = 0x53;
pub const STIND_I4: u8 = 0x54;
pub const STIND_I8: u8 = 0x55;
pub const STIND_R4: u8 = 0x56;
pub const STIND_R8: u8 = 0x57;
pub const ADD: u8 = 0x58;
pub const SUB: u8 = 0x59;
pub const MUL: u8 = 0x5A;
pub const DIV: u8 = 0x5B;
pub const DIV_UN: u8 = 0x5C;
pub const REM: u8 = 0x5D;
pub const REM_UN: u8 = 0x5E;
pub const AND: u8 = 0x5F;
pub const OR: u8 = 0x60;
pub const XOR: u8 = 0x61;
pub const SHL: u8 = 0x62;
pub const SHR: u8 = 0x63;
pub const SHR_UN: u8 = 0x64;
pub const NEG: u8 = 0x65;
pub const NOT: u8 = 0x66;
pub const CONV_I1: u8 = 0x67;
pub const CONV_I2: u8 = 0x68;
pub const CONV_I4: u8 = 0x69;
pub const CONV_I8: u8 = 0x6A;
pub const CONV_R4: u8 = 0x6B;
pub const CONV_R8: u8 = 0x6C;
pub const CONV_U4: u8 = 0x6D;
pub const CONV_U8: u8 = 0x6E;
pub const CALLVIRT: u8 = 0x6F;
pub const LDOBJ: u8 = 0x71;
pub const NEWOBJ: u8 = 0x73;
pub const CONV_R_UN: u8 = 0x76;
pub const LDFLD: u8 = 0x7B;
pub const LDFLDA: u8 = 0x7C;
pub const STFLD: u8 = 0x7D;
pub const STOBJ: u8 = 0x81;
pub const CONV_U2: u8 = 0xD1;
pub const CONV_U1: u8 = 0xD2;
pub const CONV_I: u8 = 0xD3;
pub const ENDFINALLY: u8 = 0xDC;
pub const LEAVE: u8 = 0xDD;
pub const LEAVE_S: u8 = 0xDE;
pub const STIND_I: u8 = 0xDF;
pub const CONV_U: u8 = 0xE0;
pub const PREFIX: u8 = 0xFE;

// Second byte of 0xFE-prefixed opcodes.
pub const P_CEQ: u8 = 0x01;
pub const P_CGT: u8 = 0x02;
pub const P_CGT_UN: u8 = 0x03;
pub const P_CLT: u8 = 0x04;
pub const P_CLT_UN: u8 = 0x05;
pub const P_LDARG: u8 = 0x09;
pub const P_LDARGA: u8 = 0x0A;
pub const P_STARG: u8 = 0x0B;
pub const P_LDLOC: u8 = 0x0C;
pub const P_LDLOCA: u8 = 0x0D;
pub const P_STLOC: u8 = 0x0E;
pub const P_UNALIGNED: u8 = 0x12;
pub const P_VOLATILE: u8 = 0x13;
pub const P_INITOBJ: u8 = 0x15;
