//! Per-method runtime metadata and its process-wide publication table.
//!
//! On completion every method registers a [`JitMethodInfo`]: unwind codes
//! describing its prologue (mirroring the x86-64 PDATA/XDATA opcode set),
//! the encoded GCInfo blob, and the parsed exception clauses. The unwinder
//! and the GC query the table by program counter.

use crate::il::body::EhClause;
use alloc::vec::Vec;
use fnv::FnvBuildHasher;
use hashbrown::HashMap;
use lazy_static::lazy_static;
use spin::RwLock;
use tinyvec::ArrayVec;

/// x86-64 frame register index for RBP.
pub const FRAME_REGISTER_RBP: u8 = 5;

/// Unwind operation, mirroring the PDATA/XDATA encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnwindOp {
    /// `push reg` of a non-volatile register.
    #[default]
    PushNonVolatile,
    /// `sub rsp, imm` small form.
    AllocSmall,
    /// `sub rsp, imm` large form.
    AllocLarge,
    /// Frame-pointer establishment.
    SetFpReg,
    /// `mov [frame + offset], reg` spill of a non-volatile register.
    SaveNonVolatile,
}

/// One prologue step, keyed by the code offset just past the instruction.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnwindCode {
    pub prologue_offset: u8,
    pub op: UnwindOp,
    /// Physical register number for push/save ops.
    pub reg: u8,
    /// Allocation size or save offset.
    pub value: u32,
}

pub const MAX_UNWIND_CODES: usize = 16;

/// Registration record for one compiled method.
#[derive(Debug, Clone, Default)]
pub struct JitMethodInfo {
    pub assembly: u32,
    pub token: u32,
    pub code_base: u64,
    pub code_start: u64,
    pub code_size: u32,
    pub prologue_size: u8,
    pub frame_register: u8,
    pub frame_offset: u8,
    pub unwind_codes: ArrayVec<[UnwindCode; MAX_UNWIND_CODES]>,
    pub gc_info: Vec<u8>,
    pub eh_clauses: Vec<EhClause>,
}

lazy_static! {
    static ref METHOD_TABLE: RwLock<HashMap<u64, JitMethodInfo, FnvBuildHasher>> =
        RwLock::new(HashMap::with_hasher(FnvBuildHasher::default()));
}

/// Publishes a method record, keyed by entry address. Re-registration of the
/// same entry replaces the record.
pub fn publish(info: JitMethodInfo) {
    if METHOD_TABLE
        .write()
        .insert(info.code_start, info)
        .is_some()
    {
        log::warn!("Method info was re-published for an existing entry point");
    }
}

/// Range query used by the unwinder and the GC.
pub fn find_by_pc(pc: u64) -> Option<JitMethodInfo> {
    METHOD_TABLE
        .read()
        .values()
        .find(|info| pc >= info.code_start && pc < info.code_start + info.code_size as u64)
        .cloned()
}

/// Unpublishes every record of an assembly; returns how many were removed.
pub fn unpublish_assembly(assembly: u32) -> usize {
    let mut table = METHOD_TABLE.write();
    let before = table.len();
    table.retain(|_, info| info.assembly != assembly);
    before - table.len()
}

/// Builds the unwind description of the standard Tier-0 prologue: `push rbp`,
/// frame-pointer establishment, frame allocation, then the five fixed
/// callee-save spills.
pub fn unwind_for_prologue(frame_size: u32, prologue_size: u8) -> ArrayVec<[UnwindCode; MAX_UNWIND_CODES]> {
    // Physical numbers of the spilled registers, matching the emitter's
    // fixed save order.
    const SAVED: [(u8, u32); 5] = [(3, 8), (12, 16), (13, 24), (14, 32), (15, 40)];

    let mut codes = ArrayVec::new();
    codes.push(UnwindCode {
        prologue_offset: 1,
        op: UnwindOp::PushNonVolatile,
        reg: FRAME_REGISTER_RBP,
        value: 0,
    });
    codes.push(UnwindCode {
        prologue_offset: 4,
        op: UnwindOp::SetFpReg,
        reg: FRAME_REGISTER_RBP,
        value: 0,
    });
    let alloc_op = if frame_size <= 128 {
        UnwindOp::AllocSmall
    } else {
        UnwindOp::AllocLarge
    };
    codes.push(UnwindCode {
        prologue_offset: prologue_size,
        op: alloc_op,
        reg: 0,
        value: frame_size,
    });
    for (reg, offset) in SAVED {
        codes.push(UnwindCode {
            prologue_offset: prologue_size,
            op: UnwindOp::SaveNonVolatile,
            reg,
            value: offset,
        });
    }
    codes
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(assembly: u32, start: u64, size: u32) -> JitMethodInfo {
        JitMethodInfo {
            assembly,
            token: 0x0600_0001,
            code_base: start,
            code_start: start,
            code_size: size,
            prologue_size: 28,
            frame_register: FRAME_REGISTER_RBP,
            frame_offset: 0,
            unwind_codes: unwind_for_prologue(112, 28),
            gc_info: Vec::new(),
            eh_clauses: Vec::new(),
        }
    }

    #[test]
    fn pc_lookup_covers_the_whole_range() {
        publish(info(701, 0x7000_0000, 64));
        assert!(find_by_pc(0x7000_0000).is_some());
        assert!(find_by_pc(0x7000_003F).is_some());
        assert!(find_by_pc(0x7000_0040).is_none());
        assert_eq!(unpublish_assembly(701), 1);
        assert!(find_by_pc(0x7000_0000).is_none());
    }

    #[test]
    fn prologue_unwind_shape() {
        let codes = unwind_for_prologue(112, 28);
        assert_eq!(codes.len(), 8);
        assert_eq!(codes[0].op, UnwindOp::PushNonVolatile);
        assert_eq!(codes[0].reg, FRAME_REGISTER_RBP);
        assert_eq!(codes[1].op, UnwindOp::SetFpReg);
        assert_eq!(codes[2].op, UnwindOp::AllocSmall);
        assert_eq!(codes[2].value, 112);
        assert!(codes[3..]
            .iter()
            .all(|code| code.op == UnwindOp::SaveNonVolatile));
    }
}
