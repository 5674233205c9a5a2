//! Calls, dispatch, objects, value types, arrays and strings.

mod common;

use common::{load, run, unhandled_class};
use mintvm::Value;

const PROGRAM: &str = r#"
[runtime]
max_frame_depth = 64

[[class]]
name = "Shape"

[[class.method]]
name = ".ctor"
instance = true
body = """
        ldarg.0
        call System.Object::.ctor
        ret
"""

[[class.method]]
name = "Area"
instance = true
virtual = true
ret = "i4"
body = """
        ldc.i4.0
        ret
"""

[[class]]
name = "Square"
parent = "Shape"
fields = [{ name = "side", type = "i4" }]

[[class.method]]
name = ".ctor"
instance = true
params = ["i4"]
body = """
        ldarg.0
        call Shape::.ctor
        ldarg.0
        ldarg.1
        stfld Square::side
        ret
"""

[[class.method]]
name = "Area"
instance = true
virtual = true
ret = "i4"
body = """
        ldarg.0
        ldfld Square::side
        ldarg.0
        ldfld Square::side
        mul
        ret
"""

[[class]]
name = "Vec2"
value_type = true
fields = [{ name = "x", type = "i8" }, { name = "y", type = "i8" }]

[[class.method]]
name = "Make"
params = ["i8", "i8"]
ret = "Vec2"
body = """
.locals init (Vec2)
        ldloca.s 0
        ldarg.0
        stfld Vec2::x
        ldloca.s 0
        ldarg.1
        stfld Vec2::y
        ldloc.0
        ret
"""

[[class.method]]
name = "Dot"
params = ["Vec2", "Vec2"]
ret = "i8"
body = """
        ldarga.s 0
        ldfld Vec2::x
        ldarga.s 1
        ldfld Vec2::x
        mul
        ldarga.s 0
        ldfld Vec2::y
        ldarga.s 1
        ldfld Vec2::y
        mul
        add
        ret
"""

[[class]]
name = "Calls"
fields = [{ name = "counter", type = "i8", static = true }]

[[class.method]]
name = "SquareArea"
params = ["i4"]
ret = "i4"
body = """
        ldarg.0
        newobj Square::.ctor(i4)
        callvirt Shape::Area
        ret
"""

[[class.method]]
name = "BaseArea"
ret = "i4"
body = """
        newobj Shape::.ctor
        callvirt Shape::Area
        ret
"""

[[class.method]]
name = "Bump"
ret = "i8"
body = """
        ldsfld Calls::counter
        ldc.i8 1
        add
        dup
        stsfld Calls::counter
        ret
"""

[[class.method]]
name = "IsEven"
params = ["i4"]
ret = "i4"
body = """
        ldarg.0
        brtrue MORE
        ldc.i4.1
        ret
MORE:   ldarg.0
        ldc.i4.1
        sub
        tail.call Calls::IsOdd
        ret
"""

[[class.method]]
name = "IsOdd"
params = ["i4"]
ret = "i4"
body = """
        ldarg.0
        brtrue MORE
        ldc.i4.0
        ret
MORE:   ldarg.0
        ldc.i4.1
        sub
        tail.call Calls::IsEven
        ret
"""

[[class.method]]
name = "Deep"
params = ["i4"]
ret = "i4"
body = """
        ldarg.0
        ldc.i4.1
        add
        call Calls::Deep
        ldc.i4.1
        add
        ret
"""

[[class.method]]
name = "DotOf"
params = ["i8", "i8", "i8", "i8"]
ret = "i8"
body = """
        ldarg.0
        ldarg.1
        call Vec2::Make
        ldarg.2
        ldarg.3
        call Vec2::Make
        call Vec2::Dot
        ret
"""

[[class.method]]
name = "SumSquares"
params = ["i4"]
ret = "i8"
body = """
.locals init (i8[], i4, i8)
        ldarg.0
        newarr i8
        stloc.0
        ldc.i4.0
        stloc.1
        br FILLCOND
FILL:   ldloc.0
        ldloc.1
        ldloc.1
        ldloc.1
        mul
        conv.i8
        stelem.i8
        ldloc.1
        ldc.i4.1
        add
        stloc.1
FILLCOND: ldloc.1
        ldloc.0
        ldlen
        conv.i4
        blt FILL
        ldc.i4.0
        stloc.1
        br SUMCOND
SUM:    ldloc.2
        ldloc.0
        ldloc.1
        ldelem.i8
        add
        stloc.2
        ldloc.1
        ldc.i4.1
        add
        stloc.1
SUMCOND: ldloc.1
        ldarg.0
        blt SUM
        ldloc.2
        ret
"""

[[class.method]]
name = "OutOfRange"
ret = "i4"
body = """
        ldc.i4.3
        newarr i4
        ldc.i4.3
        ldelem.i4
        ret
"""

[[class.method]]
name = "ArrayOf"
params = ["i8"]
ret = "i4"
body = """
        ldarg.0
        newarr i8
        ldlen
        conv.i4
        ret
"""

[[class.method]]
name = "NonVirtualArea"
params = ["i4"]
ret = "i4"
body = """
        ldarg.0
        newobj Square::.ctor(i4)
        call Shape::Area
        ret
"""

[[class.method]]
name = "NegativeLength"
ret = "i4"
body = """
        ldc.i4.m1
        newarr i4
        ldlen
        conv.i4
        ret
"""

[[class.method]]
name = "Covariance"
body = """
        ldc.i4.1
        newarr System.Exception
        ldc.i4.0
        ldstr "not an exception"
        stelem.ref
        ret
"""

[[class.method]]
name = "Greet"
params = ["string"]
ret = "string"
body = """
        ldstr "hello, "
        ldarg.0
        call System.String::Concat
        ret
"""

[[class.method]]
name = "Length"
params = ["string"]
ret = "i4"
body = """
        ldarg.0
        callvirt System.String::get_Length
        ret
"""

[[class.method]]
name = "SecondChar"
params = ["string"]
ret = "char"
body = """
        ldarg.0
        ldc.i4.1
        call System.String::get_Chars
        ret
"""

[[class.method]]
name = "BoxRoundTrip"
params = ["i4"]
ret = "i4"
body = """
        ldarg.0
        box i4
        unbox.any i4
        ret
"""

[[class.method]]
name = "IsBoxedInt"
params = ["i4"]
ret = "bool"
body = """
        ldarg.0
        box i4
        isinst System.Int32
        ldnull
        cgt.un
        ret
"""

[[class.method]]
name = "BadUnbox"
ret = "i8"
body = """
        ldc.i4.5
        box i4
        unbox.any i8
        ret
"""

[[class.method]]
name = "BadCast"
body = """
        ldstr "x"
        castclass System.Exception
        pop
        ret
"""
"#;

#[test]
fn test_virtual_dispatch_uses_receiver_class() {
    let (result, _) = run(PROGRAM, "Calls::SquareArea", &[Value::I32(7)]);
    assert_eq!(result.unwrap(), Value::I32(49));
    let (result, _) = run(PROGRAM, "Calls::BaseArea", &[]);
    assert_eq!(result.unwrap(), Value::I32(0));
}

#[test]
fn test_statics_persist_between_calls() {
    let (rt, _) = load(PROGRAM);
    for expected in 1..=3 {
        assert_eq!(rt.invoke_named("Calls::Bump", &[]).unwrap(), Value::I64(expected));
    }
    let field = rt.metadata().find_field("Calls::counter").unwrap();
    assert_eq!(rt.static_value(field), Value::I64(3));
}

#[test]
fn test_tail_calls_do_not_grow_the_frame_chain() {
    // Far deeper than max_frame_depth.
    let (result, _) = run(PROGRAM, "Calls::IsEven", &[Value::I32(10_001)]);
    assert_eq!(result.unwrap(), Value::I32(0));
    let (result, _) = run(PROGRAM, "Calls::IsEven", &[Value::I32(10_000)]);
    assert_eq!(result.unwrap(), Value::I32(1));
}

#[test]
fn test_runaway_recursion_raises_stack_overflow() {
    let (result, _) = run(PROGRAM, "Calls::Deep", &[Value::I32(0)]);
    assert_eq!(unhandled_class(result), "System.StackOverflowException");
}

#[test]
fn test_value_type_arguments_and_results() {
    let (result, _) = run(
        PROGRAM,
        "Calls::DotOf",
        &[Value::I64(1), Value::I64(2), Value::I64(3), Value::I64(4)],
    );
    assert_eq!(result.unwrap(), Value::I64(11));

    let (rt, _) = load(PROGRAM);
    let v = rt.invoke_named("Vec2::Make", &[Value::I64(5), Value::I64(-6)]).unwrap();
    let Value::Struct(bytes) = v else {
        panic!("expected a struct, got {v:?}");
    };
    assert_eq!(bytes.len(), 16);
    assert_eq!(i64::from_ne_bytes(bytes[..8].try_into().unwrap()), 5);
    assert_eq!(i64::from_ne_bytes(bytes[8..].try_into().unwrap()), -6);
}

#[test]
fn test_arrays() {
    let (result, _) = run(PROGRAM, "Calls::SumSquares", &[Value::I32(4)]);
    assert_eq!(result.unwrap(), Value::I64(14));
    let (result, _) = run(PROGRAM, "Calls::OutOfRange", &[]);
    assert_eq!(unhandled_class(result), "System.IndexOutOfRangeException");
    let (result, _) = run(PROGRAM, "Calls::NegativeLength", &[]);
    assert_eq!(unhandled_class(result), "System.OverflowException");
    let (result, _) = run(PROGRAM, "Calls::Covariance", &[]);
    assert_eq!(unhandled_class(result), "System.ArrayTypeMismatchException");
}

#[test]
fn test_oversized_arrays_raise_instead_of_aborting() {
    let (rt, _) = load(PROGRAM);
    assert_eq!(rt.invoke_named("Calls::ArrayOf", &[Value::I64(3)]).unwrap(), Value::I32(3));
    // Element storage would wrap a 64-bit byte count.
    assert_eq!(
        unhandled_class(rt.invoke_named("Calls::ArrayOf", &[Value::I64(2_305_843_009_213_693_953)])),
        "System.OverflowException"
    );
    assert_eq!(
        unhandled_class(rt.invoke_named("Calls::ArrayOf", &[Value::I64(i32::MAX as i64)])),
        "System.OutOfMemoryException"
    );
    assert_eq!(rt.invoke_named("Calls::ArrayOf", &[Value::I64(0)]).unwrap(), Value::I32(0));
}

#[test]
fn test_non_virtual_call_ignores_override() {
    let (result, _) = run(PROGRAM, "Calls::NonVirtualArea", &[Value::I32(7)]);
    assert_eq!(result.unwrap(), Value::I32(0));
}

#[test]
fn test_strings() {
    let (rt, _) = load(PROGRAM);
    let name = Value::Ref(rt.string("mint"));
    let Value::Ref(greeting) = rt.invoke_named("Calls::Greet", &[name.clone()]).unwrap() else {
        panic!("expected a string");
    };
    assert_eq!(rt.read_string(greeting).as_deref(), Some("hello, mint"));
    assert_eq!(rt.invoke_named("Calls::Length", &[name.clone()]).unwrap(), Value::I32(4));
    assert_eq!(rt.invoke_named("Calls::SecondChar", &[name]).unwrap(), Value::I32('i' as i32));
    assert_eq!(
        unhandled_class(rt.invoke_named("Calls::Length", &[Value::Ref(mintvm::vm::ObjRef::NULL)])),
        "System.NullReferenceException"
    );
}

#[test]
fn test_boxing_and_casts() {
    let (result, _) = run(PROGRAM, "Calls::BoxRoundTrip", &[Value::I32(-12)]);
    assert_eq!(result.unwrap(), Value::I32(-12));
    let (result, _) = run(PROGRAM, "Calls::IsBoxedInt", &[Value::I32(3)]);
    assert_eq!(result.unwrap(), Value::I32(1));
    let (result, _) = run(PROGRAM, "Calls::BadUnbox", &[]);
    assert_eq!(unhandled_class(result), "System.InvalidCastException");
    let (result, _) = run(PROGRAM, "Calls::BadCast", &[]);
    assert_eq!(unhandled_class(result), "System.InvalidCastException");
}
