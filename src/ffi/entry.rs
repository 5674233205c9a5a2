//! Native entry: C functions that load programs and enter the interpreter.
//!
//! Calls run on the calling OS thread. When the caller is itself native
//! code invoked from managed code, the new frames chain beneath the
//! suspended interpreter frame, and an exception escaping them is parked in
//! the thread context so the interpreter rethrows it once the native code
//! returns.

#![allow(unsafe_op_in_unsafe_fn)]

use std::ffi::{CStr, c_char};
use std::path::Path;
use std::sync::Arc;

use tracing::warn;

use super::types::{MintResult, MintRuntime, MintValue, RuntimeWrapper, wrapper};
use crate::program::Program;
use crate::vm::{FrameLink, MethodHandle, Outcome, PendingException, RetKind, Runtime, ThreadContext};

/// Wrap a runtime in a C handle. Free it with [`mint_runtime_free`].
pub fn into_handle(runtime: Arc<Runtime>) -> *mut MintRuntime {
    Box::into_raw(Box::new(RuntimeWrapper::new(runtime))) as *mut MintRuntime
}

/// Load a program file (TOML or JSON by extension).
///
/// Returns NULL when the file cannot be loaded.
///
/// # Safety
/// `path` must be a NUL-terminated string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn mint_runtime_load(path: *const c_char) -> *mut MintRuntime {
    if path.is_null() {
        return std::ptr::null_mut();
    }
    let path = CStr::from_ptr(path).to_string_lossy();
    match Program::load(Path::new(path.as_ref())) {
        Ok(program) => into_handle(Arc::new(program.into_runtime())),
        Err(e) => {
            warn!(target: "mintvm::ffi", %path, "load failed: {e}");
            std::ptr::null_mut()
        }
    }
}

/// Release a runtime handle.
///
/// # Safety
/// `rt` must come from this API and not be used afterwards.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn mint_runtime_free(rt: *mut MintRuntime) {
    if rt.is_null() {
        return;
    }
    drop(Box::from_raw(rt as *mut RuntimeWrapper));
}

/// Resolve a method by `Class::name` or `Class::name(params)` spec.
///
/// # Safety
/// `rt` must be a live handle, `spec` a NUL-terminated string and `out` a
/// writable pointer.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn mint_find_method(rt: *const MintRuntime, spec: *const c_char, out: *mut u32) -> MintResult {
    let Some(w) = wrapper(rt) else {
        return MintResult::ErrorInvalidArg;
    };
    if spec.is_null() || out.is_null() {
        return MintResult::ErrorInvalidArg;
    }
    let spec = CStr::from_ptr(spec).to_string_lossy();
    let runtime = &w.runtime;
    match runtime.metadata().find_method(&spec) {
        Some(id) => {
            let handle = runtime.methods().resolve(runtime.metadata(), id, &[]);
            *out = handle.0;
            MintResult::Ok
        }
        None => {
            w.set_error(format!("no such method: {spec}"));
            MintResult::ErrorNotFound
        }
    }
}

/// Run `method` with `nargs` arguments and store its result in `result`
/// (which may be NULL for void methods).
///
/// # Safety
/// `rt` must be a live handle; `args` must point to `nargs` values.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn mint_invoke(
    rt: *const MintRuntime,
    method: u32,
    args: *const MintValue,
    nargs: usize,
    result: *mut MintValue,
) -> MintResult {
    let Some(w) = wrapper(rt) else {
        return MintResult::ErrorInvalidArg;
    };
    if args.is_null() && nargs > 0 {
        return MintResult::ErrorInvalidArg;
    }
    let args = if nargs == 0 {
        &[][..]
    } else {
        std::slice::from_raw_parts(args, nargs)
    };
    let (code, value) = invoke(w, MethodHandle(method), args);
    if !result.is_null() {
        *result = value;
    }
    code
}

pub(crate) fn invoke(w: &RuntimeWrapper, handle: MethodHandle, args: &[MintValue]) -> (MintResult, MintValue) {
    let runtime = &w.runtime;
    if handle.0 as usize >= runtime.methods().len() {
        w.set_error(format!("invalid method handle {}", handle.0));
        return (MintResult::ErrorInvalidArg, MintValue::VOID);
    }
    let method = runtime.methods().get(handle);
    if args.len() != method.arg_count() || matches!(method.ret, RetKind::Vt(_)) {
        w.set_error(format!("{}: argument count or shape not callable from C", method.name));
        return (MintResult::ErrorInvalidArg, MintValue::VOID);
    }
    let mut slots = Vec::with_capacity(args.len());
    for (slot, value) in method.args.iter().zip(args) {
        match value.to_stack(slot.mint) {
            Some(v) => slots.push(v),
            None => {
                w.set_error(format!("{}: {:?} does not fit a {:?} argument", method.name, value.tag, slot.mint));
                return (MintResult::ErrorInvalidArg, MintValue::VOID);
            }
        }
    }

    match runtime.invoke_raw(handle, &slots, std::ptr::null_mut()) {
        Ok(Outcome::Returned(value)) => {
            w.clear_error();
            (MintResult::Ok, value.map_or(MintValue::VOID, MintValue::from_stack))
        }
        Ok(Outcome::Threw(ex)) => {
            ThreadContext::with(|ctx| {
                if ctx.in_native() {
                    ctx.set_pending(PendingException {
                        exception: ex,
                        frame_depth: ctx.depth(),
                        ip: ctx.current().map_or(0, FrameLink::ip),
                    });
                }
            });
            w.set_error(runtime.describe_exception(ex).to_string());
            (MintResult::ErrorException, MintValue::VOID)
        }
        Err(e) => {
            w.set_error(e.to_string());
            (MintResult::ErrorRuntime, MintValue::VOID)
        }
    }
}

/// Message of the last failed call on this handle, or NULL.
///
/// # Safety
/// `rt` must be a live handle. The string stays valid until the next call
/// on the handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn mint_get_error(rt: *const MintRuntime) -> *const c_char {
    let Some(w) = wrapper(rt) else {
        return std::ptr::null();
    };
    let error = w.last_error.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
    error.as_ref().map_or(std::ptr::null(), |e| e.as_ptr())
}

/// # Safety
/// `rt` must be a live handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn mint_clear_error(rt: *const MintRuntime) {
    if let Some(w) = wrapper(rt) {
        w.clear_error();
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn mint_version() -> *const c_char {
    static VERSION: &[u8] = concat!(env!("CARGO_PKG_VERSION"), "\0").as_bytes();
    VERSION.as_ptr() as *const c_char
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ffi::types::MintTag;
    use crate::il::{BinOp, Instr, MethodBody};
    use crate::metadata::{MetadataBuilder, MethodDef, MethodImpl, TypeDesc};
    use std::ffi::CString;

    fn add_runtime() -> *mut MintRuntime {
        let mut b = MetadataBuilder::new();
        let class = b.define_class("Calc", None).unwrap();
        let add = b.add_method(class, MethodDef::static_("Add", vec![TypeDesc::I4, TypeDesc::I4], TypeDesc::I4));
        b.set_impl(
            add,
            MethodImpl::Il(MethodBody {
                code: vec![Instr::Ldarg(0), Instr::Ldarg(1), Instr::Binary(BinOp::Add), Instr::Ret],
                ..MethodBody::default()
            }),
        );
        into_handle(Arc::new(Runtime::new(b.finish().unwrap())))
    }

    #[test]
    fn test_find_and_invoke() {
        unsafe {
            let rt = add_runtime();
            let spec = CString::new("Calc::Add").unwrap();
            let mut handle = u32::MAX;
            assert_eq!(mint_find_method(rt, spec.as_ptr(), &mut handle), MintResult::Ok);
            let args = [MintValue::i32(40), MintValue::i32(2)];
            let mut out = MintValue::VOID;
            assert_eq!(mint_invoke(rt, handle, args.as_ptr(), 2, &mut out), MintResult::Ok);
            assert_eq!(out.tag, MintTag::I32);
            assert_eq!(out.bits as i32, 42);
            mint_runtime_free(rt);
        }
    }

    #[test]
    fn test_bad_arguments_set_error() {
        unsafe {
            let rt = add_runtime();
            let spec = CString::new("Calc::Add").unwrap();
            let mut handle = 0;
            mint_find_method(rt, spec.as_ptr(), &mut handle);
            let args = [MintValue::f64(1.0), MintValue::i32(2)];
            let code = mint_invoke(rt, handle, args.as_ptr(), 2, std::ptr::null_mut());
            assert_eq!(code, MintResult::ErrorInvalidArg);
            let message = CStr::from_ptr(mint_get_error(rt)).to_string_lossy().into_owned();
            assert!(message.contains("Calc::Add"), "{message}");
            mint_clear_error(rt);
            assert!(mint_get_error(rt).is_null());
            mint_runtime_free(rt);
        }
    }

    #[test]
    fn test_missing_method() {
        unsafe {
            let rt = add_runtime();
            let spec = CString::new("Calc::Sub").unwrap();
            let mut handle = 0;
            assert_eq!(mint_find_method(rt, spec.as_ptr(), &mut handle), MintResult::ErrorNotFound);
            mint_runtime_free(rt);
        }
    }
}
