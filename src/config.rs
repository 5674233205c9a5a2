//! Runtime configuration types.

use serde::Deserialize;

/// Runtime configuration for the interpreter and transformer.
///
/// Loadable from the `[runtime]` table of a program file; every field has a
/// default so partial tables are accepted.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
    /// Frame chain depth at which a call raises `StackOverflowException`
    pub max_frame_depth: usize,
    /// Largest evaluation stack a single frame may need
    pub max_stack_slots: usize,
    /// Native stack size for threads started with `Runtime::spawn`
    pub native_stack_size: usize,
    /// Verify stack heights against the transformer's prediction at every instruction
    pub check_stack_balance: bool,
    /// Lower `call self; ret` into argument stores and a branch to the method start
    pub optimize_self_tail_calls: bool,
    /// Replace calls to methods whose body is a bare `ret` with argument pops
    pub inline_empty_calls: bool,
    /// Use 16-bit branch deltas where they fit
    pub short_branches: bool,
    /// Log the disassembly of every compiled method
    pub trace_transform: bool,
    /// Log every executed instruction
    pub trace_exec: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_frame_depth: 10_000,
            max_stack_slots: 4096,
            native_stack_size: 64 * 1024 * 1024,
            check_stack_balance: cfg!(debug_assertions),
            optimize_self_tail_calls: true,
            inline_empty_calls: true,
            short_branches: true,
            trace_transform: false,
            trace_exec: false,
        }
    }
}

impl RuntimeConfig {
    /// Parse a standalone TOML document.
    pub fn from_toml(source: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(source)
    }
}
