//! Host-side harness for the Tier-0 JIT.
//!
//! Provides an `mmap`-backed executable-page provider and an in-memory
//! metadata image so integration tests can drive the full compilation
//! pipeline and execute the emitted code. Compiled entry points follow the
//! Microsoft x64 convention; invoke them through `extern "win64"` function
//! pointers.

use jit::error::{JitError, Result};
use jit::heap::{ExecPageProvider, PAGE_SIZE};
use jit::il::sig;
use jit::metadata::{
    FieldInfo, InterfaceImpl, KernelExports, MetadataProvider, MethodAttributes, MethodDefInfo,
    MethodTable, RuntimeHelperTable,
};
use std::collections::HashMap;
use std::ptr::NonNull;

/// RWX pages from `mmap`. Writable-and-executable is acceptable for a test
/// harness; the kernel-resident provider enforces its own W^X discipline.
#[cfg(unix)]
pub struct MmapCodeProvider;

#[cfg(unix)]
impl ExecPageProvider for MmapCodeProvider {
    fn alloc_pages(&self, pages: usize) -> Option<NonNull<u8>> {
        let len = pages * PAGE_SIZE;
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return None;
        }
        NonNull::new(ptr as *mut u8)
    }

    unsafe fn free_pages(&self, base: NonNull<u8>, pages: usize) {
        libc::munmap(base.as_ptr() as *mut libc::c_void, pages * PAGE_SIZE);
    }
}

#[cfg(unix)]
pub static CODE_PROVIDER: MmapCodeProvider = MmapCodeProvider;

/// One method of a test image.
pub struct TestMethod {
    pub attributes: MethodAttributes,
    pub name: String,
    /// Raw body (header + IL); empty for abstract and PInvoke methods.
    pub body: Vec<u8>,
    pub signature: Vec<u8>,
}

/// In-memory metadata image serving the collaborator traits.
#[derive(Default)]
pub struct TestImage {
    methods: HashMap<u32, TestMethod>,
    local_sigs: HashMap<u32, Vec<u8>>,
    type_sizes: HashMap<u32, u32>,
    fields: HashMap<u32, FieldInfo>,
    pinvokes: HashMap<u32, String>,
    declaring_types: HashMap<u32, u32>,
    type_method_order: HashMap<u32, Vec<u32>>,
    method_tables: HashMap<u32, Vec<*const MethodTable>>,
    interface_impls: HashMap<u32, InterfaceImpl>,
}

impl TestImage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_method(&mut self, token: u32, method: TestMethod) {
        self.methods.insert(token, method);
    }

    pub fn add_local_sig(&mut self, token: u32, blob: Vec<u8>) {
        self.local_sigs.insert(token, blob);
    }

    pub fn add_type_size(&mut self, token: u32, size: u32) {
        self.type_sizes.insert(token, size);
    }

    pub fn add_field(&mut self, token: u32, info: FieldInfo) {
        self.fields.insert(token, info);
    }

    pub fn add_pinvoke(&mut self, token: u32, attributes: MethodAttributes, name: &str, import: &str) {
        self.methods.insert(
            token,
            TestMethod {
                attributes: attributes | MethodAttributes::PINVOKE_IMPL,
                name: name.into(),
                body: Vec::new(),
                signature: vec![0x00, 0x00, sig::ELEMENT_TYPE_VOID],
            },
        );
        self.pinvokes.insert(token, import.into());
    }

    pub fn set_declaring_type(&mut self, method_token: u32, type_token: u32) {
        self.declaring_types.insert(method_token, type_token);
        self.type_method_order
            .entry(type_token)
            .or_default()
            .push(method_token);
    }

    pub fn set_method_tables(&mut self, type_token: u32, tables: Vec<*const MethodTable>) {
        self.method_tables.insert(type_token, tables);
    }

    pub fn set_interface_impl(&mut self, method_token: u32, imp: InterfaceImpl) {
        self.interface_impls.insert(method_token, imp);
    }

    fn method(&self, token: u32) -> Result<&TestMethod> {
        self.methods
            .get(&token)
            .ok_or(JitError::UnresolvedToken { token })
    }
}

// The image stores raw method-table pointers owned by the test.
unsafe impl Send for TestImage {}
unsafe impl Sync for TestImage {}

/// RVAs are synthesized from tokens so bodies can be looked back up.
fn rva_of(token: u32) -> u32 {
    0x1000 + (token & 0x00FF_FFFF)
}

impl MetadataProvider for TestImage {
    fn method_def(&self, _assembly: u32, token: u32) -> Result<MethodDefInfo> {
        let method = self.method(token)?;
        let rva = if method.body.is_empty() { 0 } else { rva_of(token) };
        Ok(MethodDefInfo {
            token,
            rva,
            attributes: method.attributes,
            signature: token,
            name: method.name.clone(),
        })
    }

    fn method_body(&self, _assembly: u32, rva: u32) -> Result<&[u8]> {
        self.methods
            .iter()
            .find(|(token, method)| rva_of(**token) == rva && !method.body.is_empty())
            .map(|(_, method)| method.body.as_slice())
            .ok_or(JitError::MalformedHeader)
    }

    fn signature_blob(&self, _assembly: u32, index: u32) -> Result<&[u8]> {
        Ok(self.method(index)?.signature.as_slice())
    }

    fn local_sig_blob(&self, _assembly: u32, token: u32) -> Result<&[u8]> {
        self.local_sigs
            .get(&token)
            .map(|blob| blob.as_slice())
            .ok_or(JitError::UnresolvedToken { token })
    }

    fn type_size(&self, _assembly: u32, token: u32) -> Result<u32> {
        self.type_sizes
            .get(&token)
            .copied()
            .ok_or(JitError::UnresolvedToken { token })
    }

    fn field_info(&self, _assembly: u32, token: u32) -> Result<FieldInfo> {
        self.fields
            .get(&token)
            .copied()
            .ok_or(JitError::UnresolvedToken { token })
    }

    fn pinvoke_import(&self, _assembly: u32, token: u32) -> Result<&str> {
        self.pinvokes
            .get(&token)
            .map(|name| name.as_str())
            .ok_or(JitError::UnresolvedToken { token })
    }

    fn declaring_type(&self, _assembly: u32, method_token: u32) -> Result<u32> {
        self.declaring_types
            .get(&method_token)
            .copied()
            .ok_or(JitError::UnresolvedToken {
                token: method_token,
            })
    }

    fn type_methods(&self, assembly: u32, type_token: u32) -> Result<Vec<MethodDefInfo>> {
        let order = self
            .type_method_order
            .get(&type_token)
            .ok_or(JitError::UnresolvedToken { token: type_token })?;
        order
            .iter()
            .map(|token| self.method_def(assembly, *token))
            .collect()
    }

    fn method_tables_of_type(&self, _assembly: u32, type_token: u32) -> Result<Vec<*const MethodTable>> {
        Ok(self
            .method_tables
            .get(&type_token)
            .cloned()
            .unwrap_or_default())
    }

    fn interface_impl(&self, _assembly: u32, method_token: u32) -> Result<Option<InterfaceImpl>> {
        Ok(self.interface_impls.get(&method_token).copied())
    }
}

/// Export table backed by a name map.
#[derive(Default)]
pub struct TestExports {
    entries: HashMap<Vec<u8>, usize>,
}

impl TestExports {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, name: &str, address: *const u8) {
        self.entries.insert(name.as_bytes().to_vec(), address as usize);
    }
}

impl KernelExports for TestExports {
    fn lookup(&self, name: &[u8]) -> Option<NonNull<u8>> {
        self.entries
            .get(name)
            .and_then(|&address| NonNull::new(address as *mut u8))
    }
}

/// Object allocator helper: `[word 0] = method table`, zeroed fields.
///
/// ## Safety
///
/// Called from JIT-emitted code with a valid method-table pointer.
pub unsafe extern "win64" fn host_alloc_object(mt: *const MethodTable) -> *mut u8 {
    let size = ((*mt).base_size as usize).max(16);
    let layout = std::alloc::Layout::from_size_align(size, 16).unwrap();
    let object = std::alloc::alloc_zeroed(layout);
    (object as *mut *const MethodTable).write(mt);
    object
}

/// Interface-dispatch helper: resolves `(interface table, slot)` against the
/// object's concrete method table. The harness keeps resolution trivial: the
/// interface slot indexes the concrete vtable directly.
///
/// ## Safety
///
/// Called from JIT-emitted code with a live object pointer.
pub unsafe extern "win64" fn host_interface_dispatch(
    object: *const u8,
    _interface_mt: *const MethodTable,
    slot: u64,
) -> *const u8 {
    let mt = *(object as *const *const MethodTable);
    (*mt).vtable_slot(slot as usize)
}

pub fn host_helpers() -> RuntimeHelperTable {
    RuntimeHelperTable {
        alloc_object: host_alloc_object as *const u8,
        interface_dispatch: host_interface_dispatch as *const u8,
    }
}

// Body and signature builders, mirroring the ECMA-335 layouts.

/// Tiny-format body: low bits `10`, size in the upper six.
pub fn tiny_body(il: &[u8]) -> Vec<u8> {
    assert!(il.len() < 64);
    let mut body = vec![0x02 | ((il.len() as u8) << 2)];
    body.extend_from_slice(il);
    body
}

/// Fat-format body with an optional local signature token.
pub fn fat_body(max_stack: u16, local_sig_token: u32, il: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(12 + il.len());
    let flags_and_size: u16 = 0x3003 | if local_sig_token != 0 { 0x0010 } else { 0 };
    body.extend_from_slice(&flags_and_size.to_le_bytes());
    body.extend_from_slice(&max_stack.to_le_bytes());
    body.extend_from_slice(&(il.len() as u32).to_le_bytes());
    body.extend_from_slice(&local_sig_token.to_le_bytes());
    body.extend_from_slice(il);
    body
}

/// `MethodDefSig` blob from element-type bytes.
pub fn method_sig(has_this: bool, ret: &[u8], params: &[&[u8]]) -> Vec<u8> {
    let mut blob = vec![if has_this { sig::SIG_HASTHIS } else { 0x00 }, params.len() as u8];
    blob.extend_from_slice(ret);
    for param in params {
        blob.extend_from_slice(param);
    }
    blob
}

/// `LocalVarSig` blob from element-type byte runs.
pub fn local_sig(locals: &[&[u8]]) -> Vec<u8> {
    let mut blob = vec![sig::SIG_LOCAL, locals.len() as u8];
    for local in locals {
        blob.extend_from_slice(local);
    }
    blob
}

/// Leaked vtable storage plus its method table, for dispatch tests.
pub fn make_method_table(base_size: u32, slots: usize) -> &'static MethodTable {
    let vtable: &'static mut [*const u8] = Vec::leak(vec![std::ptr::null(); slots.max(1)]);
    Box::leak(Box::new(MethodTable::new(
        base_size,
        vtable.as_mut_ptr(),
        slots as u16,
    )))
}
