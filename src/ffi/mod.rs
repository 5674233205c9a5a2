//! Boundaries between managed code and the native world.
//!
//! - [`entry`]: C functions through which a host enters the interpreter.
//! - [`icall`]: host functions called from managed code by name.
//! - [`pinvoke`]: foreign C functions called from managed code by symbol.
//!
//! # Safety
//!
//! Every `extern "C"` function taking a runtime handle requires a pointer
//! returned by `mint_runtime_load` (or [`entry::into_handle`]) that has not
//! been freed.

pub mod entry;
pub mod icall;
pub mod pinvoke;
pub mod types;

pub use entry::*;
pub use icall::{Icall, IcallContext, IcallResult};
pub use types::{MintResult, MintRuntime, MintTag, MintValue};

pub const MINT_VERSION_MAJOR: u32 = 0;
pub const MINT_VERSION_MINOR: u32 = 1;
pub const MINT_VERSION_PATCH: u32 = 0;
