//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::io::{self, Write};
use std::sync::{Arc, Mutex};

use mintvm::{Program, Runtime, RuntimeConfig, Value, VmError};

/// Console sink that can be read back after the run.
#[derive(Clone, Default)]
pub struct Captured(Arc<Mutex<Vec<u8>>>);

impl Captured {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl Write for Captured {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Load a TOML program with stack-balance checking forced on.
pub fn load(source: &str) -> (Runtime, Captured) {
    load_with(source, |_| {})
}

pub fn load_with(source: &str, configure: impl FnOnce(&mut RuntimeConfig)) -> (Runtime, Captured) {
    let mut program = Program::from_toml(source).unwrap_or_else(|e| panic!("bad program: {e}"));
    program.config.check_stack_balance = true;
    configure(&mut program.config);
    let out = Captured::default();
    let rt = program.into_runtime().with_output(out.clone());
    (rt, out)
}

/// Run `spec` in a fresh runtime and return its result and console output.
pub fn run(source: &str, spec: &str, args: &[Value]) -> (Result<Value, VmError>, String) {
    let (rt, out) = load(source);
    let result = rt.invoke_named(spec, args);
    (result, out.text())
}

/// Class name of the exception that escaped, or a panic.
pub fn unhandled_class(result: Result<Value, VmError>) -> String {
    match result {
        Err(VmError::Unhandled(ex)) => ex.class,
        other => panic!("expected an unhandled exception, got {other:?}"),
    }
}
