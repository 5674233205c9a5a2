//! Host functions, foreign functions, compiled code and native re-entry.

use std::ffi::CString;
use std::sync::Arc;
use std::sync::atomic::{AtomicPtr, Ordering};

use mintvm::ffi::{self, MintResult, MintRuntime, MintValue};
use mintvm::il::asm;
use mintvm::metadata::{MetadataBuilder, MethodDef, MethodImpl, TypeDesc, WellKnown};
use mintvm::vm::StackValue;
use mintvm::{Runtime, Value, VmError};

fn define(b: &mut MetadataBuilder, class: mintvm::metadata::ClassId, name: &str, params: Vec<TypeDesc>, ret: TypeDesc) {
    b.add_method(class, MethodDef::static_(name, params, ret));
}

fn body(b: &mut MetadataBuilder, spec: &str, source: &str) {
    let method = b.find_method(spec).unwrap();
    let parsed = asm::parse(spec, source, &*b).unwrap();
    b.set_body(method, parsed);
}

// =========================================================================
// Internal calls
// =========================================================================

fn icall_runtime() -> Runtime {
    let mut b = MetadataBuilder::new();
    let class = b.define_class("Host", None).unwrap();
    define(&mut b, class, "Triple", vec![TypeDesc::I4], TypeDesc::I4);
    define(&mut b, class, "SumTriples", vec![TypeDesc::I4, TypeDesc::I4], TypeDesc::I4);
    define(&mut b, class, "Unregistered", vec![], TypeDesc::Void);
    let triple = b.find_method("Host::Triple").unwrap();
    b.set_impl(triple, MethodImpl::InternalCall("Host::Triple".to_string()));
    let missing = b.find_method("Host::Unregistered").unwrap();
    b.set_impl(missing, MethodImpl::InternalCall("Host::Nowhere".to_string()));
    body(
        &mut b,
        "Host::SumTriples",
        "
        ldarg.0
        call Host::Triple
        ldarg.1
        call Host::Triple
        add
        ret
        ",
    );
    let rt = Runtime::new(b.finish().unwrap());
    rt.register_icall("Host::Triple", |cx, args| {
        let v = args[0].i32();
        match v.checked_mul(3) {
            Some(r) => Ok(Some(StackValue::I32(r))),
            None => Err(cx.exception(WellKnown::OverflowException, "triple overflowed")),
        }
    });
    rt
}

#[test]
fn test_registered_icall() {
    let rt = icall_runtime();
    assert_eq!(rt.invoke_named("Host::SumTriples", &[Value::I32(2), Value::I32(5)]).unwrap(), Value::I32(21));
}

#[test]
fn test_icall_can_throw() {
    let rt = icall_runtime();
    match rt.invoke_named("Host::Triple", &[Value::I32(i32::MAX)]) {
        Err(VmError::Unhandled(ex)) => {
            assert_eq!(ex.class, "System.OverflowException");
            assert_eq!(ex.message.as_deref(), Some("triple overflowed"));
        }
        other => panic!("expected an overflow, got {other:?}"),
    }
}

#[test]
fn test_unregistered_icall_is_missing_method() {
    let rt = icall_runtime();
    match rt.invoke_named("Host::Unregistered", &[]) {
        Err(VmError::Unhandled(ex)) => assert_eq!(ex.class, "System.MissingMethodException"),
        other => panic!("expected MissingMethodException, got {other:?}"),
    }
}

// =========================================================================
// Foreign functions
// =========================================================================

#[cfg(all(unix, target_pointer_width = "64", any(target_arch = "x86_64", target_arch = "aarch64")))]
#[test]
fn test_pinvoke_into_libc() {
    let mut b = MetadataBuilder::new();
    let class = b.define_class("Libc", None).unwrap();
    define(&mut b, class, "labs", vec![TypeDesc::I8], TypeDesc::I8);
    define(&mut b, class, "Missing", vec![], TypeDesc::Void);
    let labs = b.find_method("Libc::labs").unwrap();
    b.set_impl(
        labs,
        MethodImpl::PInvoke {
            library: String::new(),
            symbol: "labs".to_string(),
        },
    );
    let missing = b.find_method("Libc::Missing").unwrap();
    b.set_impl(
        missing,
        MethodImpl::PInvoke {
            library: String::new(),
            symbol: "no_such_symbol_for_sure".to_string(),
        },
    );
    let rt = Runtime::new(b.finish().unwrap());
    assert_eq!(rt.invoke_named("Libc::labs", &[Value::I64(-1 << 40)]).unwrap(), Value::I64(1 << 40));
    let method = rt.methods().get(rt.methods().resolve(rt.metadata(), labs, &[]));
    let first = method.native_address();
    assert!(first.is_some());
    assert_eq!(rt.invoke_named("Libc::labs", &[Value::I64(-3)]).unwrap(), Value::I64(3));
    assert_eq!(method.native_address(), first);
    match rt.invoke_named("Libc::Missing", &[]) {
        Err(VmError::Unhandled(ex)) => assert_eq!(ex.class, "System.MissingMethodException"),
        other => panic!("expected MissingMethodException, got {other:?}"),
    }
}

// An exception escaping a native-entry call made from native code that was
// itself called from managed code surfaces in the managed caller.

static REENTRY_RUNTIME: AtomicPtr<MintRuntime> = AtomicPtr::new(std::ptr::null_mut());

extern "C" fn host_reenter() -> i32 {
    let rt = REENTRY_RUNTIME.load(Ordering::SeqCst);
    let spec = CString::new("Reentry::Thrower").unwrap();
    let mut handle = 0;
    unsafe {
        assert_eq!(ffi::mint_find_method(rt, spec.as_ptr(), &mut handle), MintResult::Ok);
        let mut out = MintValue::VOID;
        let code = ffi::mint_invoke(rt, handle, std::ptr::null(), 0, &mut out);
        assert_eq!(code, MintResult::ErrorException);
    }
    // Ignored: the parked exception takes precedence.
    7
}

#[cfg(all(unix, any(target_arch = "x86_64", target_arch = "aarch64")))]
#[test]
fn test_native_reentry_exception_reaches_managed_catch() {
    let mut b = MetadataBuilder::new();
    let class = b.define_class("Reentry", None).unwrap();
    define(&mut b, class, "Thrower", vec![], TypeDesc::I4);
    define(&mut b, class, "Native", vec![], TypeDesc::I4);
    define(&mut b, class, "Guarded", vec![], TypeDesc::String);
    let native = b.find_method("Reentry::Native").unwrap();
    b.set_impl(
        native,
        MethodImpl::PInvoke {
            library: "host".to_string(),
            symbol: "host_reenter".to_string(),
        },
    );
    body(
        &mut b,
        "Reentry::Thrower",
        r#"
        ldstr "from managed"
        newobj System.Exception::.ctor(string)
        throw
        "#,
    );
    body(
        &mut b,
        "Reentry::Guarded",
        r#"
.locals init (string)
TRY:    call Reentry::Native
        pop
        ldstr "returned"
        stloc.0
        leave DONE
CATCH:  callvirt System.Exception::get_Message
        stloc.0
        leave DONE
DONE:   ldloc.0
        ret
.try TRY CATCH catch System.Exception CATCH DONE
        "#,
    );
    let rt = Arc::new(Runtime::new(b.finish().unwrap()));
    rt.register_native("host_reenter", host_reenter as usize);
    let handle = ffi::into_handle(rt.clone());
    REENTRY_RUNTIME.store(handle, Ordering::SeqCst);

    let Value::Ref(message) = rt.invoke_named("Reentry::Guarded", &[]).unwrap() else {
        panic!("expected a string");
    };
    assert_eq!(rt.read_string(message).as_deref(), Some("from managed"));

    REENTRY_RUNTIME.store(std::ptr::null_mut(), Ordering::SeqCst);
    unsafe { ffi::mint_runtime_free(handle) };
}

// =========================================================================
// Compiled code
// =========================================================================

#[cfg(feature = "jit")]
mod compiled {
    use super::*;
    use mintvm::jit::{self, JitContext, JitValue, status};

    /// (x + 1) * 2, calling back into the interpreter for the increment.
    unsafe extern "C" fn twice_after_inc(ctx: *mut JitContext, args: *const JitValue, nargs: usize, ret: *mut JitValue) -> u32 {
        unsafe {
            assert_eq!(nargs, 1);
            let ctx_ref = &mut *ctx;
            let rt = &*ctx_ref.runtime;
            let inc = jit::method_handle(rt, "Bridge::Inc").unwrap();
            let mut inner = JitValue::VOID;
            let code = (ctx_ref.invoke)(ctx, inc.0, args, 1, &mut inner);
            if code != status::OK {
                return code;
            }
            *ret = JitValue::i32((inner.payload as i32) * 2);
            status::OK
        }
    }

    unsafe extern "C" fn always_throws(ctx: *mut JitContext, _: *const JitValue, _: usize, _: *mut JitValue) -> u32 {
        unsafe {
            let ctx = &mut *ctx;
            let ex = (*ctx.runtime).new_exception(WellKnown::InvalidCastException, "compiled code says no");
            ctx.throw(ex)
        }
    }

    /// Forwards to `Bridge::Thrower`, letting its exception pass through.
    unsafe extern "C" fn forwards_throw(ctx: *mut JitContext, _: *const JitValue, _: usize, _: *mut JitValue) -> u32 {
        unsafe {
            let rt = &*(*ctx).runtime;
            let thrower = jit::method_handle(rt, "Bridge::Thrower").unwrap();
            let mut out = JitValue::VOID;
            ((*ctx).invoke)(ctx, thrower.0, std::ptr::null(), 0, &mut out)
        }
    }

    unsafe extern "C" fn bad_tag(_: *mut JitContext, _: *const JitValue, _: usize, ret: *mut JitValue) -> u32 {
        unsafe { *ret = JitValue::f64(1.0) };
        status::OK
    }

    fn runtime() -> Runtime {
        let mut b = MetadataBuilder::new();
        let class = b.define_class("Bridge", None).unwrap();
        define(&mut b, class, "Inc", vec![TypeDesc::I4], TypeDesc::I4);
        define(&mut b, class, "Twice", vec![TypeDesc::I4], TypeDesc::I4);
        define(&mut b, class, "CallTwice", vec![TypeDesc::I4], TypeDesc::I4);
        define(&mut b, class, "Fail", vec![], TypeDesc::Void);
        define(&mut b, class, "CatchFail", vec![], TypeDesc::I4);
        define(&mut b, class, "Thrower", vec![], TypeDesc::Void);
        define(&mut b, class, "Forward", vec![], TypeDesc::Void);
        define(&mut b, class, "BadTag", vec![], TypeDesc::I4);

        for (spec, entry) in [
            ("Bridge::Twice", twice_after_inc as jit::CompiledEntry),
            ("Bridge::Fail", always_throws),
            ("Bridge::Forward", forwards_throw),
            ("Bridge::BadTag", bad_tag),
        ] {
            let id = b.find_method(spec).unwrap();
            b.set_impl(id, MethodImpl::Compiled(entry));
        }
        body(
            &mut b,
            "Bridge::Inc",
            "
            ldarg.0
            ldc.i4.1
            add
            ret
            ",
        );
        body(
            &mut b,
            "Bridge::CallTwice",
            "
            ldarg.0
            call Bridge::Twice
            ldc.i4.3
            add
            ret
            ",
        );
        body(
            &mut b,
            "Bridge::CatchFail",
            "
.locals init (i4)
TRY:    call Bridge::Fail
        ldc.i4.0
        stloc.0
        leave DONE
CATCH:  pop
        ldc.i4.5
        stloc.0
        leave DONE
DONE:   ldloc.0
        ret
.try TRY CATCH catch System.InvalidCastException CATCH DONE
            ",
        );
        body(
            &mut b,
            "Bridge::Thrower",
            r#"
            ldstr "deep"
            newobj System.IndexOutOfRangeException::.ctor(string)
            throw
            "#,
        );
        Runtime::new(b.finish().unwrap())
    }

    #[test]
    fn test_compiled_code_reenters_interpreter() {
        let rt = runtime();
        assert_eq!(rt.invoke_named("Bridge::Twice", &[Value::I32(4)]).unwrap(), Value::I32(10));
        assert_eq!(rt.invoke_named("Bridge::CallTwice", &[Value::I32(4)]).unwrap(), Value::I32(13));
    }

    #[test]
    fn test_compiled_code_throws_into_managed_catch() {
        let rt = runtime();
        assert_eq!(rt.invoke_named("Bridge::CatchFail", &[]).unwrap(), Value::I32(5));
        match rt.invoke_named("Bridge::Fail", &[]) {
            Err(VmError::Unhandled(ex)) => {
                assert_eq!(ex.class, "System.InvalidCastException");
                assert_eq!(ex.message.as_deref(), Some("compiled code says no"));
            }
            other => panic!("expected an unhandled exception, got {other:?}"),
        }
    }

    #[test]
    fn test_exception_passes_through_compiled_frame() {
        let rt = runtime();
        match rt.invoke_named("Bridge::Forward", &[]) {
            Err(VmError::Unhandled(ex)) => assert_eq!(ex.class, "System.IndexOutOfRangeException"),
            other => panic!("expected an unhandled exception, got {other:?}"),
        }
    }

    #[test]
    fn test_mistagged_result_is_an_error() {
        let rt = runtime();
        assert!(matches!(rt.invoke_named("Bridge::BadTag", &[]), Err(VmError::Native(_))));
    }
}
