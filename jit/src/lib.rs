//! Kernel-resident Tier-0 just-in-time compiler.
//!
//! Translates stack-based CIL into x86-64 machine code at first invocation.
//! The crate manages its own executable memory through the kernel's page
//! seam, resolves metadata through collaborator traits, and emits code that
//! cooperates with the managed runtime: method tables, vtables, and GCInfo
//! for stack-root enumeration at safepoints.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod buffer;
pub mod debug;
pub mod emit;
pub mod error;
pub mod gcinfo;
pub mod heap;
pub mod il;
pub mod metadata;
pub mod registry;
pub mod runtime;
pub mod tier0;

pub use buffer::CodeBuffer;
pub use error::JitError;
pub use heap::{CodeHeap, ExecPageProvider, PAGE_SIZE};
pub use tier0::{CompileOutcome, Tier0Compiler};
