//! Native code generation for sumatra functions.
//!
//! The backend turns a function's IR into x86-64 machine code:
//! - Code buffer for building machine code
//! - x86-64 instruction encoding
//! - Operand stack mapped to frame slots
//! - Executable memory management
//! - The compiler driving generation and call-site resolution

pub mod codebuf;
pub mod codegen;
pub mod compiler;
mod memory;
pub mod operand_stack;
pub mod x86_64;

pub use compiler::JitCompiler;
pub use memory::MemoryError;

use thiserror::Error;

/// Errors surfaced by the JIT backend.
///
/// All of these are unrecoverable for the compilation at hand: they signal
/// either a defect in the IR handed to the generator or an exhausted OS
/// resource, and retrying cannot succeed.
#[derive(Debug, Error)]
pub enum JitError {
    #[error("operand stack underflow")]
    StackUnderflow,

    #[error("call target `{0}` has no assigned entry point")]
    UnresolvableCallTarget(String),

    #[error("relative call to `{0}` does not fit in a 32-bit displacement")]
    CallDisplacementOverflow(String),

    #[error("function `{0}` has {1} parameters, at most 6 are supported")]
    TooManyParameters(String, usize),

    #[error("local index {0} out of range")]
    InvalidLocal(usize),

    #[error("argument index {0} out of range")]
    InvalidArgument(usize),

    #[error("function `{0}` does not end with Ret")]
    MissingReturn(String),

    #[error(transparent)]
    Memory(#[from] MemoryError),
}
