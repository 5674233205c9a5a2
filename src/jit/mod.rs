//! Bridge between the interpreter and externally compiled code.
//!
//! A method implemented as `MethodImpl::Compiled` is entered through a
//! C-ABI [`CompiledEntry`] that receives its arguments as an array of
//! [`JitValue`]s. Compiled code calls other methods, interpreted or not,
//! through [`JitContext::invoke`].
//!
//! This module is only compiled when the `jit` feature is enabled.

mod marshal;

pub use marshal::{JitContext, JitState, JitValue, status, tags};

use tracing::debug;

use crate::error::VmError;
use crate::vm::interp::Interp;
use crate::vm::{MethodHandle, ObjRef, Outcome, RetKind, Runtime, RuntimeMethod, StackValue};

/// Entry point of a compiled method.
pub type CompiledEntry =
    unsafe extern "C" fn(ctx: *mut JitContext, args: *const JitValue, nargs: usize, ret: *mut JitValue) -> u32;

/// Run a compiled method from the interpreter.
pub(crate) fn call_compiled(
    interp: &Interp<'_>,
    method: &RuntimeMethod,
    entry: CompiledEntry,
    args: &[StackValue],
    retbuf: *mut u8,
) -> Result<Outcome, VmError> {
    let rt = interp.rt;
    let thread = interp.ctx;
    let jit_args: Vec<JitValue> = args.iter().map(|&v| JitValue::from_stack(v)).collect();
    let mut state = JitState::default();
    let mut ctx = JitContext {
        runtime: rt,
        invoke: jit_invoke,
        exception: 0,
        retbuf,
        state: &mut state,
    };
    let mut ret = JitValue::VOID;
    debug!(target: "mintvm::native", method = %method.name, "enter compiled code");

    thread.native_enter();
    rt.gc().enter_native(thread);
    // SAFETY: entry points are registered by the embedder together with
    // the method signature they implement.
    let code = unsafe { entry(&mut ctx, jit_args.as_ptr(), jit_args.len(), &mut ret) };
    rt.gc().leave_native(thread);
    thread.native_leave();

    if let Some(pending) = thread.take_pending() {
        return Ok(Outcome::Threw(pending.exception));
    }
    match code {
        status::OK => {
            let value = match method.ret {
                RetKind::Value(mint) => Some(ret.to_stack(mint).ok_or_else(|| {
                    VmError::Native(format!("{}: compiled code returned tag {} for {mint:?}", method.name, ret.tag))
                })?),
                _ => None,
            };
            Ok(Outcome::Returned(value))
        }
        status::THREW => {
            let ex = ObjRef::from_addr(ctx.exception as usize);
            if ex.is_null() {
                return Err(VmError::Native(format!("{}: compiled code threw null", method.name)));
            }
            Ok(Outcome::Threw(ex))
        }
        other => Err(state
            .error
            .take()
            .unwrap_or_else(|| VmError::Native(format!("{}: compiled code failed with status {other}", method.name)))),
    }
}

/// [`JitContext::invoke`]: call a method on behalf of compiled code.
unsafe extern "C" fn jit_invoke(
    ctx: *mut JitContext,
    method: u32,
    args: *const JitValue,
    nargs: usize,
    ret: *mut JitValue,
) -> u32 {
    // SAFETY: compiled code passes back the context it was given.
    let Some(ctx) = (unsafe { ctx.as_mut() }) else {
        return status::ERROR;
    };
    // SAFETY: the context's runtime outlives every call made through it.
    let rt = unsafe { &*ctx.runtime };
    let fail = |ctx: &mut JitContext, error: VmError| {
        // SAFETY: state points at the caller's JitState for this call.
        if let Some(state) = unsafe { ctx.state.as_mut() } {
            state.error = Some(error);
        }
        status::ERROR
    };
    if method as usize >= rt.methods().len() {
        return fail(ctx, VmError::NoSuchMethod(format!("method handle {method}")));
    }
    let handle = MethodHandle(method);
    let callee = rt.methods().get(handle);
    if nargs != callee.arg_count() || (nargs > 0 && args.is_null()) {
        return fail(
            ctx,
            VmError::ArgumentMismatch {
                method: callee.name.clone(),
                reason: format!("compiled code passed {nargs} arguments"),
            },
        );
    }
    let args = if nargs == 0 {
        &[][..]
    } else {
        // SAFETY: checked non-null; compiled code passes nargs values.
        unsafe { std::slice::from_raw_parts(args, nargs) }
    };
    let mut slots = Vec::with_capacity(nargs);
    for (slot, value) in callee.args.iter().zip(args) {
        match value.to_stack(slot.mint) {
            Some(v) => slots.push(v),
            None => {
                return fail(
                    ctx,
                    VmError::ArgumentMismatch {
                        method: callee.name.clone(),
                        reason: format!("tag {} does not fit {:?}", value.tag, slot.mint),
                    },
                );
            }
        }
    }
    let retbuf = match callee.ret {
        RetKind::Vt(_) => ctx.retbuf,
        _ => std::ptr::null_mut(),
    };
    match rt.invoke_raw(handle, &slots, retbuf) {
        Ok(Outcome::Returned(value)) => {
            if let Some(out) = unsafe { ret.as_mut() } {
                *out = value.map_or(JitValue::VOID, JitValue::from_stack);
            }
            status::OK
        }
        Ok(Outcome::Threw(ex)) => ctx.throw(ex),
        Err(e) => fail(ctx, e),
    }
}

/// Resolve `spec` to the handle compiled code passes to
/// [`JitContext::invoke`].
pub fn method_handle(rt: &Runtime, spec: &str) -> Option<MethodHandle> {
    let id = rt.metadata().find_method(spec)?;
    Some(rt.methods().resolve(rt.metadata(), id, &[]))
}
