//! mintvm - an interpreter for a typed, CIL-like stack bytecode.
//!
//! Method bodies are lowered once, on first call, into a flat 16-bit
//! instruction stream with explicit storage types and frame offsets, then
//! run by a dual-stack interpreter (evaluation stack plus value-type stack)
//! with exception unwinding, tail calls and virtual dispatch.
//!
//! For C/C++ embedding, use the functions in [`ffi`].

pub mod config;
pub mod error;
pub mod ffi;
pub mod il;
#[cfg(feature = "jit")]
pub mod jit;
pub mod metadata;
pub mod program;
pub mod vm;

pub use config::RuntimeConfig;
pub use error::{CompileError, LoadError, UnhandledException, VmError};
pub use metadata::{Metadata, MetadataBuilder, MethodDef, MethodImpl, TypeDesc, WellKnown};
pub use program::Program;
pub use vm::{Runtime, ThreadHandle, Value};
