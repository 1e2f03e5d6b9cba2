use snafu::prelude::*;

/// Failure surfaced by [`compile_method`](crate::tier0::Tier0Compiler::compile_method)
/// and everything beneath it.
///
/// All errors propagate synchronously; a failed compilation cancels its
/// registry reservation and leaves the slot in the "allocated, not compiled"
/// state so a later attempt may succeed.
#[derive(Debug, Snafu, Clone, Copy, PartialEq, Eq)]
pub enum JitError {
    // Input faults: the IL body or a blob it references is malformed.
    #[snafu(display("Malformed method header"))]
    MalformedHeader,

    #[snafu(display("Truncated IL body or signature blob"))]
    TruncatedInput,

    #[snafu(display("Unknown element type {:#x} in signature", element))]
    UnknownElementType { element: u8 },

    #[snafu(display("Corrupt exception-handling section"))]
    CorruptEhSection,

    #[snafu(display("Unsupported opcode {:#x} at IL offset {}", opcode, offset))]
    UnsupportedOpcode { opcode: u16, offset: usize },

    #[snafu(display("Operand stack exceeded the temporary register set"))]
    StackDepthExceeded,

    #[snafu(display("Operand stack underflow at IL offset {}", offset))]
    StackUnderflow { offset: usize },

    #[snafu(display("Branch target {} is outside the method body", target))]
    BranchOutOfBounds { target: usize },

    #[snafu(display("Call site uses {} arguments, more than the supported maximum", count))]
    TooManyArguments { count: usize },

    #[snafu(display("Value type of {} bytes exceeds the local slot size", size))]
    ValueTypeTooLarge { size: u32 },

    // Metadata faults: a token did not resolve to what the IL requires.
    #[snafu(display("Unresolvable token {:#010x}", token))]
    UnresolvedToken { token: u32 },

    #[snafu(display("Method {:#010x} has no RVA and is neither abstract nor PInvoke", token))]
    MissingRva { token: u32 },

    #[snafu(display("PInvoke import could not be resolved against the kernel exports"))]
    UnresolvedImport,

    // Resource exhaustion.
    #[snafu(display("Code buffer overflowed during emission"))]
    CodeBufferOverflow,

    #[snafu(display("Executable heap allocation failed"))]
    CodeHeapExhausted,

    #[snafu(display("Registry block allocation failed"))]
    RegistryExhausted,

    #[snafu(display("Compiled code does not fit the pre-allocated recursion slab"))]
    RecursiveSlabOverflow,
}

pub type Result<T, E = JitError> = core::result::Result<T, E>;
