//! Bodies the transformer rejects, and shape checking while running.

mod common;

use mintvm::error::CompileError;
use mintvm::{Value, VmError};

const PROGRAM: &str = r#"
[[class]]
name = "Shapes"

[[class.method]]
name = "Underflow"
body = """
        pop
        ret
"""

[[class.method]]
name = "BadAdd"
ret = "i4"
body = """
        ldstr "a"
        ldc.i4.1
        add
        ret
"""

[[class.method]]
name = "Uneven"
params = ["i4"]
ret = "i4"
body = """
        ldarg.0
        brtrue JOIN
        ldc.i4.1
JOIN:   ldc.i4.2
        ret
"""

[[class.method]]
name = "Balanced"
params = ["i4"]
ret = "i4"
body = """
.locals init (i4)
        ldarg.0
        brfalse ZERO
        ldc.i4.s 10
        br JOIN
ZERO:   ldc.i4.s 20
JOIN:   stloc.0
        ldloc.0
        ret
"""
"#;

#[test]
fn test_underflow_is_a_compile_error() {
    let (rt, _) = common::load(PROGRAM);
    let err = rt.invoke_named("Shapes::Underflow", &[]).unwrap_err();
    assert!(
        matches!(err, VmError::Compile(CompileError::StackUnderflow { ref method, .. }) if method == "Shapes::Underflow"),
        "{err:?}"
    );
}

#[test]
fn test_operand_type_mismatch_is_a_compile_error() {
    let (rt, _) = common::load(PROGRAM);
    let err = rt.invoke_named("Shapes::BadAdd", &[]).unwrap_err();
    assert!(matches!(err, VmError::Compile(CompileError::TypeMismatch { .. })), "{err:?}");
}

#[test]
fn test_merge_points_must_agree() {
    let (rt, _) = common::load(PROGRAM);
    let err = rt.invoke_named("Shapes::Uneven", &[Value::I32(0)]).unwrap_err();
    assert!(matches!(err, VmError::Compile(_)), "{err:?}");
    // A failed transform leaves nothing behind in the cache.
    assert_eq!(rt.compile_count(), 0);
}

#[test]
fn test_balanced_branches_run_with_checks_enabled() {
    let (rt, _) = common::load(PROGRAM);
    assert!(rt.config().check_stack_balance);
    assert_eq!(rt.invoke_named("Shapes::Balanced", &[Value::I32(1)]).unwrap(), Value::I32(10));
    assert_eq!(rt.invoke_named("Shapes::Balanced", &[Value::I32(0)]).unwrap(), Value::I32(20));
}
