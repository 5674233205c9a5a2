//! Arithmetic, comparison, conversion and branching through whole programs.

mod common;

use common::{run, unhandled_class};
use mintvm::Value;

const ARITH: &str = r#"
[[class]]
name = "Arith"

[[class.method]]
name = "Sum"
params = ["i4"]
ret = "i4"
body = """
.locals init (i4, i4)
        ldc.i4.0
        stloc.0
        ldc.i4.1
        stloc.1
        br COND
LOOP:   ldloc.0
        ldloc.1
        add
        stloc.0
        ldloc.1
        ldc.i4.1
        add
        stloc.1
COND:   ldloc.1
        ldarg.0
        ble LOOP
        ldloc.0
        ret
"""

[[class.method]]
name = "Widen"
params = ["i4", "i8"]
ret = "i8"
body = """
        ldarg.0
        ldarg.1
        add
        ret
"""

[[class.method]]
name = "Div"
params = ["i4", "i4"]
ret = "i4"
body = """
        ldarg.0
        ldarg.1
        div
        ret
"""

[[class.method]]
name = "CheckedAdd"
params = ["i4", "i4"]
ret = "i4"
body = """
        ldarg.0
        ldarg.1
        add.ovf
        ret
"""

[[class.method]]
name = "ToByte"
params = ["i4"]
ret = "i4"
body = """
        ldarg.0
        conv.ovf.u1
        ret
"""

[[class.method]]
name = "Truncate"
params = ["i8"]
ret = "i4"
body = """
        ldarg.0
        conv.i1
        ret
"""

[[class.method]]
name = "Hypot"
params = ["r8", "r8"]
ret = "r8"
body = """
        ldarg.0
        ldarg.0
        mul
        ldarg.1
        ldarg.1
        mul
        add
        ret
"""

[[class.method]]
name = "Average"
params = ["i4", "i4"]
ret = "r8"
body = """
        ldarg.0
        ldarg.1
        add
        conv.r8
        ldc.r8 2.0
        div
        ret
"""

[[class.method]]
name = "Ratio"
params = ["r8", "r8"]
ret = "r8"
body = """
        ldarg.0
        ldarg.1
        div
        ckfinite
        ret
"""

[[class.method]]
name = "Classify"
params = ["i4"]
ret = "i4"
body = """
        ldarg.0
        switch (ZERO, ONE, TWO)
        ldc.i4.m1
        ret
ZERO:   ldc.i4 100
        ret
ONE:    ldc.i4 101
        ret
TWO:    ldc.i4 102
        ret
"""

[[class.method]]
name = "UnsignedLess"
params = ["i4", "i4"]
ret = "bool"
body = """
        ldarg.0
        ldarg.1
        clt.un
        ret
"""

[[class.method]]
name = "Shift"
params = ["i8", "i4"]
ret = "i8"
body = """
        ldarg.0
        ldarg.1
        shl
        ret
"""
"#;

#[test]
fn test_counting_loop() {
    let (result, _) = run(ARITH, "Arith::Sum", &[Value::I32(100)]);
    assert_eq!(result.unwrap(), Value::I32(5050));
    let (result, _) = run(ARITH, "Arith::Sum", &[Value::I32(0)]);
    assert_eq!(result.unwrap(), Value::I32(0));
}

#[test]
fn test_mixed_width_operands_widen() {
    let (result, _) = run(ARITH, "Arith::Widen", &[Value::I32(-1), Value::I64(1 << 40)]);
    assert_eq!(result.unwrap(), Value::I64((1 << 40) - 1));
}

#[test]
fn test_division_faults_are_managed_exceptions() {
    let (result, _) = run(ARITH, "Arith::Div", &[Value::I32(7), Value::I32(2)]);
    assert_eq!(result.unwrap(), Value::I32(3));
    let (result, _) = run(ARITH, "Arith::Div", &[Value::I32(-7), Value::I32(2)]);
    assert_eq!(result.unwrap(), Value::I32(-3));

    let (result, _) = run(ARITH, "Arith::Div", &[Value::I32(7), Value::I32(0)]);
    assert_eq!(unhandled_class(result), "System.DivideByZeroException");
    let (result, _) = run(ARITH, "Arith::Div", &[Value::I32(i32::MIN), Value::I32(-1)]);
    assert_eq!(unhandled_class(result), "System.OverflowException");
}

#[test]
fn test_checked_arithmetic() {
    let (result, _) = run(ARITH, "Arith::CheckedAdd", &[Value::I32(40), Value::I32(2)]);
    assert_eq!(result.unwrap(), Value::I32(42));
    let (result, _) = run(ARITH, "Arith::CheckedAdd", &[Value::I32(i32::MAX), Value::I32(1)]);
    assert_eq!(unhandled_class(result), "System.OverflowException");
}

#[test]
fn test_conversions() {
    let (result, _) = run(ARITH, "Arith::ToByte", &[Value::I32(255)]);
    assert_eq!(result.unwrap(), Value::I32(255));
    let (result, _) = run(ARITH, "Arith::ToByte", &[Value::I32(256)]);
    assert_eq!(unhandled_class(result), "System.OverflowException");
    let (result, _) = run(ARITH, "Arith::Truncate", &[Value::I64(0x1_0000_00ff)]);
    assert_eq!(result.unwrap(), Value::I32(-1));
}

#[test]
fn test_floating_point() {
    let (result, _) = run(ARITH, "Arith::Hypot", &[Value::F64(3.0), Value::F64(4.0)]);
    assert_eq!(result.unwrap(), Value::F64(25.0));
    let (result, _) = run(ARITH, "Arith::Average", &[Value::I32(3), Value::I32(4)]);
    assert_eq!(result.unwrap(), Value::F64(3.5));
}

#[test]
fn test_switch_and_fallthrough() {
    for (input, expected) in [(0, 100), (1, 101), (2, 102), (3, -1), (-1, -1)] {
        let (result, _) = run(ARITH, "Arith::Classify", &[Value::I32(input)]);
        assert_eq!(result.unwrap(), Value::I32(expected), "input {input}");
    }
}

#[test]
fn test_unsigned_compare() {
    let (result, _) = run(ARITH, "Arith::UnsignedLess", &[Value::I32(1), Value::I32(-1)]);
    assert_eq!(result.unwrap(), Value::I32(1));
    let (result, _) = run(ARITH, "Arith::UnsignedLess", &[Value::I32(-1), Value::I32(1)]);
    assert_eq!(result.unwrap(), Value::I32(0));
}

#[test]
fn test_shift_amount_stays_narrow() {
    let (result, _) = run(ARITH, "Arith::Shift", &[Value::I64(3), Value::I32(33)]);
    assert_eq!(result.unwrap(), Value::I64(3 << 33));
}

#[test]
fn test_ckfinite_rejects_nan_and_infinity() {
    let (result, _) = run(ARITH, "Arith::Ratio", &[Value::F64(1.0), Value::F64(4.0)]);
    assert_eq!(result.unwrap(), Value::F64(0.25));
    let (result, _) = run(ARITH, "Arith::Ratio", &[Value::F64(1.0), Value::F64(0.0)]);
    assert_eq!(unhandled_class(result), "System.ArithmeticException");
    let (result, _) = run(ARITH, "Arith::Ratio", &[Value::F64(0.0), Value::F64(0.0)]);
    assert_eq!(unhandled_class(result), "System.ArithmeticException");
}
