//! Compiled-method registry.
//!
//! A chunked associative store of `(assembly, token, type-arg-hash) → entry`
//! with the reservation protocol that makes recursive and re-entrant
//! compilation work: reserving an entry that is already being compiled hands
//! back the method's pre-allocated code buffer instead of descending into a
//! second compilation.

use crate::error::{JitError, Result};
use crate::heap::{CodeHeap, PAGE_SIZE};
use crate::metadata::{MethodTable, ReturnKind};
use alloc::boxed::Box;
use alloc::vec::Vec;
use bitfield::bitfield;
use bitflags::bitflags;
use core::ptr;
use static_assertions::const_assert_eq;

pub const BLOCK_ENTRIES: usize = 256;

/// `next_free` value of a block with no free slot.
const BLOCK_FULL: u16 = BLOCK_ENTRIES as u16;

/// Vtable slot of entries that occupy none.
pub const NO_VTABLE_SLOT: i32 = -1;

bitflags! {
    pub struct EntryFlags: u8 {
        const HAS_THIS = 1 << 0;
        const COMPILED = 1 << 1;
        const BEING_COMPILED = 1 << 2;
        const VIRTUAL = 1 << 3;
        const INTERFACE = 1 << 4;
    }
}

bitfield! {
    /// Argument classification nibbles for the first eight arguments.
    pub struct ArgKindPack(u32);
    pub u8, kind, set_kind: 3, 0, 8;
}

impl ArgKindPack {
    pub const fn empty() -> Self {
        ArgKindPack(0)
    }
}

impl Clone for ArgKindPack {
    fn clone(&self) -> Self {
        ArgKindPack(self.0)
    }
}

impl Copy for ArgKindPack {}

impl core::fmt::Debug for ArgKindPack {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "ArgKindPack({:#010x})", self.0)
    }
}

/// One registry slot. A slot is used iff its token is non-zero.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct MethodEntry {
    pub token: u32,
    pub assembly: u32,
    pub type_arg_hash: u64,
    /// Native entry point; null until compiled (or pre-allocated for a
    /// method under compilation).
    pub native_code: *const u8,
    pub code_size: u32,
    /// Declared parameter count, not counting `this`.
    pub arg_count: u16,
    pub return_struct_size: u16,
    pub return_kind: ReturnKind,
    pub flags: EntryFlags,
    pub interface_slot: u16,
    pub vtable_slot: i32,
    pub declaring_mt: *const MethodTable,
    pub interface_mt: *const MethodTable,
    pub arg_kinds: ArgKindPack,
}

const_assert_eq!(core::mem::size_of::<MethodEntry>(), 64);

const EMPTY_ENTRY: MethodEntry = MethodEntry {
    token: 0,
    assembly: 0,
    type_arg_hash: 0,
    native_code: ptr::null(),
    code_size: 0,
    arg_count: 0,
    return_struct_size: 0,
    return_kind: ReturnKind::Void,
    flags: EntryFlags::empty(),
    interface_slot: 0,
    vtable_slot: NO_VTABLE_SLOT,
    declaring_mt: ptr::null(),
    interface_mt: ptr::null(),
    arg_kinds: ArgKindPack(0),
};

impl MethodEntry {
    pub fn is_used(&self) -> bool {
        self.token != 0
    }

    pub fn is_compiled(&self) -> bool {
        self.flags.contains(EntryFlags::COMPILED)
    }

    pub fn is_being_compiled(&self) -> bool {
        self.flags.contains(EntryFlags::BEING_COMPILED)
    }

    pub fn is_virtual(&self) -> bool {
        self.flags.contains(EntryFlags::VIRTUAL)
    }

    pub fn has_this(&self) -> bool {
        self.flags.contains(EntryFlags::HAS_THIS)
    }
}

/// 256-entry block with a small allocation header.
#[repr(C)]
struct MethodBlock {
    /// Index of the next free slot; [`BLOCK_FULL`] when none.
    next_free: u16,
    used: u16,
    _pad: u32,
    entries: [MethodEntry; BLOCK_ENTRIES],
}

const_assert_eq!(
    core::mem::size_of::<MethodBlock>(),
    8 + BLOCK_ENTRIES * core::mem::size_of::<MethodEntry>()
);

impl MethodBlock {
    fn new() -> Box<Self> {
        Box::new(Self {
            next_free: 0,
            used: 0,
            _pad: 0,
            entries: [EMPTY_ENTRY; BLOCK_ENTRIES],
        })
    }

    /// Claims the slot under `next_free` and advances it to the following
    /// free slot. The caller must set the entry's token before the registry
    /// call returns.
    fn alloc_slot(&mut self) -> Option<usize> {
        if self.next_free == BLOCK_FULL {
            return None;
        }
        let index = self.next_free as usize;
        self.used += 1;
        let mut next = index + 1;
        while next < BLOCK_ENTRIES && self.entries[next].is_used() {
            next += 1;
        }
        self.next_free = next as u16;
        Some(index)
    }

    /// Zeroes the slot and moves `next_free` back if the freed index
    /// precedes it.
    fn free_slot(&mut self, index: usize) {
        self.entries[index] = EMPTY_ENTRY;
        self.used -= 1;
        if (index as u16) < self.next_free {
            self.next_free = index as u16;
        }
    }
}

/// Handle to a registry slot, stable across further allocations: blocks are
/// never moved or compacted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryId {
    block: usize,
    index: usize,
}

/// Outcome of a reservation.
#[derive(Debug)]
pub enum ReserveOutcome {
    /// The method is already under compilation further up the stack; emit a
    /// relative call against this pre-allocated buffer.
    Recursive(*const u8),
    /// Already compiled; emit a direct call.
    Compiled(*const u8),
    /// Slot reserved; compile and then [`MethodRegistry::complete`].
    Reserved(EntryId),
}

/// Reservation inputs for one method.
#[derive(Debug, Clone, Copy)]
pub struct ReserveRequest {
    pub token: u32,
    pub assembly: u32,
    pub type_arg_hash: u64,
    pub arg_count: u16,
    pub return_kind: ReturnKind,
    pub return_struct_size: u16,
    pub has_this: bool,
}

/// Diagnostic snapshot of one block, for invariant checks.
#[derive(Debug, Clone, Copy)]
pub struct BlockStats {
    pub next_free: u16,
    pub used: u16,
    pub live: usize,
}

pub struct MethodRegistry {
    blocks: Vec<Box<MethodBlock>>,
}

// Entries carry raw method-table and code pointers into runtime-owned
// memory; the table itself is plain data and the embedding runtime
// serializes access (single-threaded JIT, readers re-enter the driver on
// null code pointers).
unsafe impl Send for MethodRegistry {}
unsafe impl Sync for MethodRegistry {}

impl MethodRegistry {
    pub fn new() -> Self {
        Self { blocks: Vec::new() }
    }

    pub fn entry(&self, id: EntryId) -> &MethodEntry {
        &self.blocks[id.block].entries[id.index]
    }

    pub fn entry_mut(&mut self, id: EntryId) -> &mut MethodEntry {
        &mut self.blocks[id.block].entries[id.index]
    }

    /// Reserves a slot for compilation. See the module docs for the
    /// recursion semantics.
    pub fn reserve(
        &mut self,
        heap: &mut CodeHeap,
        request: &ReserveRequest,
    ) -> Result<ReserveOutcome> {
        debug_assert_ne!(request.token, 0);

        if let Some(id) = self.find(request.token, request.assembly, request.type_arg_hash) {
            let entry = self.entry_mut(id);
            if entry.is_being_compiled() {
                // Re-entered while compiling: make sure the method has its
                // final home so the caller can emit a call against it.
                if entry.native_code.is_null() {
                    entry.native_code = heap.alloc_recursion_slab()?.as_ptr();
                }
                return Ok(ReserveOutcome::Recursive(entry.native_code));
            }
            if entry.is_compiled() {
                return Ok(ReserveOutcome::Compiled(entry.native_code));
            }
            Self::fill(entry, request);
            entry.flags.insert(EntryFlags::BEING_COMPILED);
            return Ok(ReserveOutcome::Reserved(id));
        }

        let id = self.alloc(request.token)?;
        let entry = self.entry_mut(id);
        Self::fill(entry, request);
        entry.flags.insert(EntryFlags::BEING_COMPILED);
        Ok(ReserveOutcome::Reserved(id))
    }

    /// Pre-allocated buffer of a method currently under compilation.
    pub fn recursive_call_target(
        &self,
        token: u32,
        assembly: u32,
        type_arg_hash: u64,
    ) -> Option<*const u8> {
        let id = self.find(token, assembly, type_arg_hash)?;
        let entry = self.entry(id);
        if entry.is_being_compiled() && !entry.native_code.is_null() {
            Some(entry.native_code)
        } else {
            None
        }
    }

    /// Finishes a compilation. If the method had a buffer pre-allocated by a
    /// recursive reservation and the code was emitted elsewhere, the bytes
    /// are copied into that buffer so the already-patched call sites hit the
    /// final address. Returns the final entry point.
    pub fn complete(
        &mut self,
        token: u32,
        assembly: u32,
        type_arg_hash: u64,
        code: *const u8,
        code_size: usize,
    ) -> Result<*const u8> {
        let id = self
            .find(token, assembly, type_arg_hash)
            .ok_or(JitError::UnresolvedToken { token })?;
        let entry = self.entry_mut(id);

        let final_code = if !entry.native_code.is_null() && entry.native_code != code {
            if code_size > PAGE_SIZE {
                return Err(JitError::RecursiveSlabOverflow);
            }
            unsafe { ptr::copy_nonoverlapping(code, entry.native_code as *mut u8, code_size) };
            entry.native_code
        } else {
            entry.native_code = code;
            code
        };

        entry.code_size = code_size as u32;
        entry.flags.insert(EntryFlags::COMPILED);
        entry.flags.remove(EntryFlags::BEING_COMPILED);
        Ok(final_code)
    }

    /// Cancels a reservation after a failed compilation. The slot stays
    /// visible for a later retry but is not callable.
    pub fn cancel(&mut self, token: u32, assembly: u32, type_arg_hash: u64) {
        if let Some(id) = self.find(token, assembly, type_arg_hash) {
            let entry = self.entry_mut(id);
            entry.flags.remove(EntryFlags::BEING_COMPILED);
        }
    }

    /// Triple lookup with the instantiation fallback: a miss with a non-zero
    /// hash retries the generic definition, but only surfaces it when it is
    /// a virtual stub that still needs per-instantiation compilation.
    pub fn lookup(&self, token: u32, assembly: u32, type_arg_hash: u64) -> Option<&MethodEntry> {
        if let Some(id) = self.find(token, assembly, type_arg_hash) {
            return Some(self.entry(id));
        }
        if type_arg_hash != 0 {
            if let Some(id) = self.find(token, assembly, 0) {
                let entry = self.entry(id);
                if entry.is_virtual() && !entry.is_compiled() {
                    return Some(entry);
                }
            }
        }
        None
    }

    /// Finds a compiled override by `(method table, vtable slot)`.
    pub fn lookup_by_vtable_slot(
        &self,
        mt: *const MethodTable,
        slot: i32,
    ) -> Option<&MethodEntry> {
        self.iter().find(|entry| {
            entry.declaring_mt == mt && entry.vtable_slot == slot
        })
    }

    /// Lowest-slot entry of a token on the given method table.
    pub fn lookup_lowest_slot_by_token(
        &self,
        token: u32,
        assembly: u32,
        mt: *const MethodTable,
    ) -> Option<&MethodEntry> {
        self.iter()
            .filter(|entry| {
                entry.token == token
                    && entry.assembly == assembly
                    && entry.declaring_mt == mt
                    && entry.vtable_slot != NO_VTABLE_SLOT
            })
            .min_by_key(|entry| entry.vtable_slot)
    }

    /// Installs a resolved native import; subsequent calls bind directly.
    pub fn register_pinvoke(&mut self, request: &ReserveRequest, native: *const u8) -> Result<EntryId> {
        let id = match self.find(request.token, request.assembly, request.type_arg_hash) {
            Some(id) => id,
            None => self.alloc(request.token)?,
        };
        let entry = self.entry_mut(id);
        Self::fill(entry, request);
        entry.native_code = native;
        entry.flags.insert(EntryFlags::COMPILED);
        entry.flags.remove(EntryFlags::BEING_COMPILED);
        Ok(id)
    }

    /// Marks an entry virtual and records its vtable slot and declaring
    /// method table.
    pub fn register_virtual(
        &mut self,
        id: EntryId,
        declaring_mt: *const MethodTable,
        vtable_slot: i32,
    ) {
        let entry = self.entry_mut(id);
        entry.flags.insert(EntryFlags::VIRTUAL);
        entry.declaring_mt = declaring_mt;
        entry.vtable_slot = vtable_slot;
    }

    /// Creates a not-yet-compiled entry keyed by `(method table, slot)` so
    /// that override discovery can find the method before lazy compilation
    /// fires. A token may legitimately occupy several slots this way.
    pub fn register_uncompiled_override(
        &mut self,
        token: u32,
        assembly: u32,
        mt: *const MethodTable,
        slot: i32,
    ) -> Result<EntryId> {
        let id = self.alloc(token)?;
        let entry = self.entry_mut(id);
        entry.token = token;
        entry.assembly = assembly;
        entry.flags = EntryFlags::VIRTUAL;
        entry.declaring_mt = mt;
        entry.vtable_slot = slot;
        Ok(id)
    }

    /// Removes one entry; returns whether it existed.
    pub fn remove(&mut self, token: u32, assembly: u32, type_arg_hash: u64) -> bool {
        match self.find(token, assembly, type_arg_hash) {
            Some(id) => {
                self.blocks[id.block].free_slot(id.index);
                true
            }
            None => false,
        }
    }

    /// Zeroes every slot of an assembly on unload; returns the count.
    pub fn remove_by_assembly(&mut self, assembly: u32) -> usize {
        let mut removed = 0;
        for block in self.blocks.iter_mut() {
            for index in 0..BLOCK_ENTRIES {
                if block.entries[index].is_used() && block.entries[index].assembly == assembly {
                    block.free_slot(index);
                    removed += 1;
                }
            }
        }
        removed
    }

    /// Id of the slot holding a triple, if present.
    pub fn find_id(&self, token: u32, assembly: u32, type_arg_hash: u64) -> Option<EntryId> {
        self.find(token, assembly, type_arg_hash)
    }

    pub fn iter(&self) -> impl Iterator<Item = &MethodEntry> {
        self.blocks
            .iter()
            .flat_map(|block| block.entries.iter())
            .filter(|entry| entry.is_used())
    }

    /// Per-block allocation diagnostics.
    pub fn block_stats(&self) -> Vec<BlockStats> {
        self.blocks
            .iter()
            .map(|block| BlockStats {
                next_free: block.next_free,
                used: block.used,
                live: block.entries.iter().filter(|e| e.is_used()).count(),
            })
            .collect()
    }

    fn fill(entry: &mut MethodEntry, request: &ReserveRequest) {
        entry.token = request.token;
        entry.assembly = request.assembly;
        entry.type_arg_hash = request.type_arg_hash;
        entry.arg_count = request.arg_count;
        entry.return_kind = request.return_kind;
        entry.return_struct_size = request.return_struct_size;
        entry.flags.set(EntryFlags::HAS_THIS, request.has_this);
    }

    fn find(&self, token: u32, assembly: u32, type_arg_hash: u64) -> Option<EntryId> {
        for (block_index, block) in self.blocks.iter().enumerate() {
            for (index, entry) in block.entries.iter().enumerate() {
                if entry.token == token
                    && entry.assembly == assembly
                    && entry.type_arg_hash == type_arg_hash
                    && entry.is_used()
                {
                    return Some(EntryId {
                        block: block_index,
                        index,
                    });
                }
            }
        }
        None
    }

    fn alloc(&mut self, token: u32) -> Result<EntryId> {
        debug_assert_ne!(token, 0);
        for (block_index, block) in self.blocks.iter_mut().enumerate() {
            if let Some(index) = block.alloc_slot() {
                block.entries[index].token = token;
                return Ok(EntryId {
                    block: block_index,
                    index,
                });
            }
        }
        self.blocks.push(MethodBlock::new());
        let block_index = self.blocks.len() - 1;
        let index = self.blocks[block_index]
            .alloc_slot()
            .ok_or(JitError::RegistryExhausted)?;
        self.blocks[block_index].entries[index].token = token;
        Ok(EntryId {
            block: block_index,
            index,
        })
    }
}

impl Default for MethodRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_layout_is_stable() {
        assert_eq!(core::mem::size_of::<MethodEntry>(), 64);
        assert_eq!(core::mem::size_of::<MethodBlock>(), 8 + 256 * 64);
    }

    #[test]
    fn arg_kind_nibbles_pack_and_unpack() {
        let mut pack = ArgKindPack(0);
        pack.set_kind(0, 4);
        pack.set_kind(7, 6);
        assert_eq!(pack.kind(0), 4);
        assert_eq!(pack.kind(7), 6);
        assert_eq!(pack.kind(3), 0);
    }

    #[test]
    fn free_slot_moves_next_free_back() {
        let mut block = MethodBlock::new();
        let a = block.alloc_slot().unwrap();
        block.entries[a].token = 1;
        let b = block.alloc_slot().unwrap();
        block.entries[b].token = 2;
        let c = block.alloc_slot().unwrap();
        block.entries[c].token = 3;
        assert_eq!((a, b, c), (0, 1, 2));
        assert_eq!(block.next_free, 3);

        block.free_slot(1);
        assert_eq!(block.next_free, 1);
        assert_eq!(block.used, 2);

        let again = block.alloc_slot().unwrap();
        assert_eq!(again, 1);
        block.entries[again].token = 4;
        assert_eq!(block.next_free, 3);
    }
}
