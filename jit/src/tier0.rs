//! Tier-0 driver: the public compilation entry point.
//!
//! First invocation of a method lands here. The driver resolves metadata,
//! reserves a registry slot, translates the body, completes the reservation
//! atomically, registers unwind/GCInfo, and populates vtables. Compilation
//! runs on the calling thread and recurses through callees; the ambient
//! assembly/type-argument context is saved and restored around every entry.

use crate::buffer::CodeBuffer;
use crate::emit::x64::X64Emitter;
use crate::error::{JitError, Result};
use crate::heap::{CodeHeap, ExecPageProvider};
use crate::il::sig::{self, TypeArgContext};
use crate::il::{
    body, CallTarget, CalleeInfo, Compiler, Dispatch, MethodLayout, MethodResolver,
};
use crate::metadata::{
    AotRegistry, FieldInfo, KernelExports, MetadataProvider, MethodAttributes, MethodDefInfo,
    MethodTable, RuntimeHelperTable,
};
use crate::registry::{ArgKindPack, EntryId, MethodRegistry, ReserveOutcome, ReserveRequest};
use crate::runtime::{self, JitMethodInfo, FRAME_REGISTER_RBP};
use alloc::vec::Vec;
use core::ptr::NonNull;

/// Vtable slots of the runtime-root overrides matched by name for
/// `ReuseSlot` methods.
const ROOT_OVERRIDE_SLOTS: [(&str, i32); 3] = [("ToString", 0), ("Equals", 1), ("GetHashCode", 2)];

/// Result of a driver entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompileOutcome {
    /// Native code is ready (or pre-allocated, for a recursive re-entry).
    Compiled { entry: NonNull<u8>, size: usize },
    /// Virtual-dispatch-only registration; there is no code to run directly
    /// (abstract method).
    DispatchOnly,
}

#[derive(Clone)]
struct CompileContext {
    assembly: u32,
    type_args: TypeArgContext,
}

pub struct Tier0Compiler<'r> {
    registry: MethodRegistry,
    heap: CodeHeap,
    metadata: &'r dyn MetadataProvider,
    exports: &'r dyn KernelExports,
    aot: Option<&'r dyn AotRegistry>,
    helpers: RuntimeHelperTable,
    context: Vec<CompileContext>,
}

impl<'r> Tier0Compiler<'r> {
    pub fn new(
        pages: &'static dyn ExecPageProvider,
        metadata: &'r dyn MetadataProvider,
        exports: &'r dyn KernelExports,
        helpers: RuntimeHelperTable,
    ) -> Self {
        Self {
            registry: MethodRegistry::new(),
            heap: CodeHeap::new(pages),
            metadata,
            exports,
            aot: None,
            helpers,
            context: Vec::new(),
        }
    }

    /// Consults an ahead-of-time registry before compiling anything.
    #[must_use]
    pub fn with_aot(mut self, aot: &'r dyn AotRegistry) -> Self {
        self.aot = Some(aot);
        self
    }

    pub fn registry(&self) -> &MethodRegistry {
        &self.registry
    }

    /// Compiles (or returns) the non-generic instantiation of a method.
    pub fn compile_method(&mut self, assembly: u32, token: u32) -> Result<CompileOutcome> {
        self.compile_method_instantiated(assembly, token, TypeArgContext::default())
    }

    /// Compiles one generic instantiation; every instantiation gets its own
    /// specialization keyed by the type-argument hash.
    pub fn compile_method_instantiated(
        &mut self,
        assembly: u32,
        token: u32,
        type_args: TypeArgContext,
    ) -> Result<CompileOutcome> {
        if let Some(aot) = self.aot {
            if let Some(entry) = aot.lookup(assembly, token) {
                log::trace!("AOT hit for {:#010x}", token);
                return Ok(CompileOutcome::Compiled { entry, size: 0 });
            }
        }

        // Save and switch the ambient context; every exit path restores it.
        self.context.push(CompileContext {
            assembly,
            type_args,
        });
        let result = self.compile_current(token);
        self.context.pop();
        result
    }

    /// Drops every trace of an assembly: registry slots and published
    /// method records. Code-heap reclamation is conservative and deferred.
    pub fn remove_assembly(&mut self, assembly: u32) -> usize {
        let removed = self.registry.remove_by_assembly(assembly);
        runtime::unpublish_assembly(assembly);
        removed
    }

    fn ambient(&self) -> &CompileContext {
        self.context.last().expect("ambient context missing")
    }

    fn compile_current(&mut self, token: u32) -> Result<CompileOutcome> {
        let assembly = self.ambient().assembly;
        let hash = self.ambient().type_args.hash();

        let def = self.metadata.method_def(assembly, token)?;

        if def.rva == 0 {
            if def.attributes.contains(MethodAttributes::PINVOKE_IMPL) {
                return self.bind_pinvoke(&def, assembly, hash);
            }
            if def.attributes.contains(MethodAttributes::ABSTRACT) {
                return self.publish_abstract(&def, assembly);
            }
            return Err(JitError::MissingRva { token });
        }

        log::trace!("Parsing method {:#010x}", token);
        let body_data = self.metadata.method_body(assembly, def.rva)?;
        let parsed = body::parse_method_body(body_data)?;

        let sig_blob = self.metadata.signature_blob(assembly, def.signature)?;
        let type_args = self.ambient().type_args.clone();
        let method_sig = sig::parse_method_sig(sig_blob, self.metadata, assembly, &type_args)?;
        let locals = if parsed.local_sig_token != 0 {
            let blob = self
                .metadata
                .local_sig_blob(assembly, parsed.local_sig_token)?;
            sig::parse_local_sig(blob, self.metadata, assembly, &type_args)?
        } else {
            Vec::new()
        };

        let (return_kind, return_struct_size) = method_sig.return_type.return_kind();
        let request = ReserveRequest {
            token,
            assembly,
            type_arg_hash: hash,
            arg_count: method_sig.params.len() as u16,
            return_kind,
            return_struct_size,
            has_this: method_sig.has_this,
        };

        let id = match self.registry.reserve(&mut self.heap, &request)? {
            ReserveOutcome::Recursive(code) => {
                log::trace!("Recursive re-entry for {:#010x}", token);
                return Ok(CompileOutcome::Compiled {
                    entry: NonNull::new(code as *mut u8).ok_or(JitError::CodeHeapExhausted)?,
                    size: 0,
                });
            }
            ReserveOutcome::Compiled(code) => {
                return Ok(CompileOutcome::Compiled {
                    entry: NonNull::new(code as *mut u8).ok_or(JitError::CodeHeapExhausted)?,
                    size: 0,
                });
            }
            ReserveOutcome::Reserved(id) => id,
        };

        let mut kinds = ArgKindPack::empty();
        for (index, param) in method_sig.params.iter().take(8).enumerate() {
            kinds.set_kind(index, param.arg_kind() as u8);
        }
        self.registry.entry_mut(id).arg_kinds = kinds;

        match self.compile_body(token, assembly, hash, &def, &method_sig, locals, &parsed) {
            Ok(outcome) => Ok(outcome),
            Err(error) => {
                log::error!("Compilation of {:#010x} failed: {}", token, error);
                self.registry.cancel(token, assembly, hash);
                Err(error)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn compile_body(
        &mut self,
        token: u32,
        assembly: u32,
        hash: u64,
        def: &MethodDefInfo,
        method_sig: &sig::MethodSig,
        locals: Vec<sig::LocalVar>,
        parsed: &body::MethodBody<'_>,
    ) -> Result<CompileOutcome> {
        let layout = MethodLayout {
            has_this: method_sig.has_this,
            params: method_sig.params.clone(),
            return_type: method_sig.return_type,
            locals,
        };

        let estimate = (parsed.code.len() * 48 + 512).max(crate::heap::PAGE_SIZE);
        let scratch = self.heap.alloc(estimate)?;
        let mut buf = unsafe { CodeBuffer::new(scratch.as_ptr(), estimate) };

        log::trace!("Emitting {:#010x}", token);
        let helpers = self.helpers;
        let compiled = {
            let mut resolver = DriverResolver { driver: self };
            let compiler = Compiler::<X64Emitter>::new(&mut buf, &mut resolver, helpers, layout)?;
            compiler.compile(parsed.code)?
        };

        // The method's final address: the pre-allocated recursion slab if a
        // nested reservation created one, the scratch region otherwise.
        let pre_allocated = self
            .registry
            .recursive_call_target(token, assembly, hash)
            .map(|p| p as u64);
        let final_base = pre_allocated.unwrap_or(scratch.as_ptr() as u64);

        log::trace!("Patching call fixups for {:#010x}", token);
        for fixup in &compiled.call_fixups {
            let rel = fixup.target as i64 - (final_base as i64 + fixup.patch_offset as i64 + 4);
            buf.patch_u32(fixup.patch_offset, rel as i32 as u32);
        }
        if buf.overflowed() {
            return Err(JitError::CodeBufferOverflow);
        }

        let final_code = self.registry.complete(
            token,
            assembly,
            hash,
            scratch.as_ptr(),
            compiled.code_size,
        )?;
        self.heap.finalize(final_code, compiled.code_size);

        log::trace!("Encoding GCInfo for {:#010x}", token);
        let mut gc = compiled.gc;
        let gc_blob = gc.build(compiled.code_size as u32);

        log::trace!("Registering unwind info for {:#010x}", token);
        runtime::publish(JitMethodInfo {
            assembly,
            token,
            code_base: final_code as u64,
            code_start: final_code as u64,
            code_size: compiled.code_size as u32,
            prologue_size: compiled.prologue_size,
            frame_register: FRAME_REGISTER_RBP,
            frame_offset: 0,
            unwind_codes: runtime::unwind_for_prologue(compiled.frame_size, compiled.prologue_size),
            gc_info: gc_blob,
            eh_clauses: parsed.eh_clauses.clone(),
        });

        self.finish_registration(token, assembly, hash, def, final_code)?;

        log::info!(
            "Committed {:#010x} at {:p} ({} bytes)",
            token,
            final_code,
            compiled.code_size
        );
        Ok(CompileOutcome::Compiled {
            entry: NonNull::new(final_code as *mut u8).ok_or(JitError::CodeHeapExhausted)?,
            size: compiled.code_size,
        })
    }

    /// Vtable population and constructor hookup after a successful
    /// completion.
    fn finish_registration(
        &mut self,
        token: u32,
        assembly: u32,
        hash: u64,
        def: &MethodDefInfo,
        code: *const u8,
    ) -> Result<()> {
        let is_virtual = def.attributes.contains(MethodAttributes::VIRTUAL)
            && !def.attributes.contains(MethodAttributes::STATIC);
        let is_ctor = def.name == ".ctor";
        if !is_virtual && !is_ctor {
            return Ok(());
        }

        let type_token = self.metadata.declaring_type(assembly, token)?;
        let tables = self.metadata.method_tables_of_type(assembly, type_token)?;
        let declaring_mt = tables.first().copied().unwrap_or(core::ptr::null());

        let id = self
            .find_entry(token, assembly, hash)
            .ok_or(JitError::UnresolvedToken { token })?;

        if is_ctor {
            self.registry.entry_mut(id).declaring_mt = declaring_mt;
        }

        if is_virtual {
            let slot = self.vtable_slot_for(token, assembly, def, declaring_mt)?;
            self.registry.register_virtual(id, declaring_mt, slot);
            if let Some(interface) = self.metadata.interface_impl(assembly, token)? {
                let entry = self.registry.entry_mut(id);
                entry.interface_mt = interface.interface_mt;
                entry.interface_slot = interface.slot;
                entry.flags.insert(crate::registry::EntryFlags::INTERFACE);
            }

            // Write the entry into the declaring type's vtable and every
            // known instantiation of it.
            for table in tables {
                if table.is_null() {
                    continue;
                }
                let mt = unsafe { &*table };
                if (slot as usize) < mt.vtable_length as usize {
                    unsafe { mt.set_vtable_slot(slot as usize, code) };
                    log::trace!("Vtable slot {} of {:p} -> {:p}", slot, table, code);
                }
            }
        }
        Ok(())
    }

    /// Slot resolution: a pre-registered override slot wins; `NewSlot`
    /// methods count the new-slot virtuals declared before them; `ReuseSlot`
    /// overrides of the runtime-root methods match by well-known name.
    fn vtable_slot_for(
        &mut self,
        token: u32,
        assembly: u32,
        def: &MethodDefInfo,
        declaring_mt: *const MethodTable,
    ) -> Result<i32> {
        if let Some(entry) = self
            .registry
            .lookup_lowest_slot_by_token(token, assembly, declaring_mt)
        {
            return Ok(entry.vtable_slot);
        }
        if let Some(entry) = self
            .registry
            .iter()
            .find(|e| e.token == token && e.assembly == assembly && e.vtable_slot >= 0)
        {
            return Ok(entry.vtable_slot);
        }

        if !def.attributes.contains(MethodAttributes::NEW_SLOT) {
            for (name, slot) in ROOT_OVERRIDE_SLOTS {
                if def.name == name {
                    return Ok(slot);
                }
            }
        }

        let type_token = self.metadata.declaring_type(assembly, token)?;
        let methods = self.metadata.type_methods(assembly, type_token)?;
        let mut slot = 0;
        for method in &methods {
            if method.token == token {
                break;
            }
            if method.attributes.contains(MethodAttributes::VIRTUAL)
                && method.attributes.contains(MethodAttributes::NEW_SLOT)
            {
                slot += 1;
            }
        }
        Ok(slot)
    }

    fn bind_pinvoke(&mut self, def: &MethodDefInfo, assembly: u32, hash: u64) -> Result<CompileOutcome> {
        let name = self.metadata.pinvoke_import(assembly, def.token)?;
        log::info!("Resolving PInvoke import {:?}", name);
        let address = self
            .exports
            .lookup(name.as_bytes())
            .ok_or(JitError::UnresolvedImport)?;

        let sig_blob = self.metadata.signature_blob(assembly, def.signature)?;
        let type_args = self.ambient().type_args.clone();
        let method_sig = sig::parse_method_sig(sig_blob, self.metadata, assembly, &type_args)?;
        let (return_kind, return_struct_size) = method_sig.return_type.return_kind();

        let request = ReserveRequest {
            token: def.token,
            assembly,
            type_arg_hash: hash,
            arg_count: method_sig.params.len() as u16,
            return_kind,
            return_struct_size,
            has_this: method_sig.has_this,
        };
        let id = self.registry.register_pinvoke(&request, address.as_ptr())?;
        let mut kinds = ArgKindPack::empty();
        for (index, param) in method_sig.params.iter().take(8).enumerate() {
            kinds.set_kind(index, param.arg_kind() as u8);
        }
        self.registry.entry_mut(id).arg_kinds = kinds;

        // Published range-less: native imports carry no unwind or GC data of
        // ours.
        runtime::publish(JitMethodInfo {
            assembly,
            token: def.token,
            code_base: address.as_ptr() as u64,
            code_start: address.as_ptr() as u64,
            ..JitMethodInfo::default()
        });

        Ok(CompileOutcome::Compiled {
            entry: address,
            size: 0,
        })
    }

    fn publish_abstract(&mut self, def: &MethodDefInfo, assembly: u32) -> Result<CompileOutcome> {
        let type_token = self.metadata.declaring_type(assembly, def.token)?;
        let tables = self.metadata.method_tables_of_type(assembly, type_token)?;
        let declaring_mt = tables.first().copied().unwrap_or(core::ptr::null());
        let slot = self.vtable_slot_for(def.token, assembly, def, declaring_mt)?;
        self.registry
            .register_uncompiled_override(def.token, assembly, declaring_mt, slot)?;
        log::trace!(
            "Abstract {:#010x} published at vtable slot {}",
            def.token,
            slot
        );
        Ok(CompileOutcome::DispatchOnly)
    }

    fn find_entry(&self, token: u32, assembly: u32, hash: u64) -> Option<EntryId> {
        self.registry.find_id(token, assembly, hash)
    }

    /// Callee resolution on behalf of the IL translator: compile on demand,
    /// then describe the callee from its registry entry.
    fn resolve_callee(&mut self, token: u32) -> Result<CalleeInfo> {
        let assembly = self.ambient().assembly;
        let hash = self.ambient().type_args.hash();
        let type_args = self.ambient().type_args.clone();

        let outcome = self.compile_method_instantiated(assembly, token, type_args)?;

        let entry = self
            .registry
            .lookup(token, assembly, hash)
            .ok_or(JitError::UnresolvedToken { token })?;

        let target = match outcome {
            CompileOutcome::Compiled { entry: code, .. } => {
                if entry.is_being_compiled() {
                    CallTarget::Pending(code.as_ptr() as u64)
                } else {
                    CallTarget::Compiled(code.as_ptr() as u64)
                }
            }
            CompileOutcome::DispatchOnly => CallTarget::None,
        };

        let dispatch = if entry.flags.contains(crate::registry::EntryFlags::INTERFACE) {
            Dispatch::Interface {
                mt: entry.interface_mt,
                slot: entry.interface_slot,
            }
        } else if entry.is_virtual() && entry.vtable_slot >= 0 {
            Dispatch::Vtable(entry.vtable_slot)
        } else {
            Dispatch::Direct
        };

        Ok(CalleeInfo {
            target,
            param_count: entry.arg_count,
            has_this: entry.has_this(),
            return_kind: entry.return_kind,
            return_struct_size: entry.return_struct_size,
            arg_kinds: entry.arg_kinds,
            dispatch,
            declaring_mt: entry.declaring_mt,
        })
    }
}

struct DriverResolver<'a, 'r> {
    driver: &'a mut Tier0Compiler<'r>,
}

impl MethodResolver for DriverResolver<'_, '_> {
    fn resolve_method(&mut self, token: u32) -> Result<CalleeInfo> {
        self.driver.resolve_callee(token)
    }

    fn field_info(&mut self, token: u32) -> Result<FieldInfo> {
        let assembly = self.driver.ambient().assembly;
        self.driver.metadata.field_info(assembly, token)
    }

    fn type_size(&mut self, token: u32) -> Result<u32> {
        let assembly = self.driver.ambient().assembly;
        self.driver.metadata.type_size(assembly, token)
    }
}
