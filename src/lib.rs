//! Sumatra - a minimal stack virtual machine
//!
//! This library provides the native x86-64 code-generation backend:
//! function IR in, callable entry points out. The front end that builds
//! `Function` definitions and the interpreter loop live elsewhere.

pub mod config;
pub mod jit;
pub mod vm;

// Re-export commonly used types
pub use config::JitConfig;
pub use jit::{JitCompiler, JitError};
pub use vm::{Function, FunctionDefinition, FunctionId, Module, Op, Type};
