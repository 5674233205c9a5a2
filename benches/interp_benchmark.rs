//! Interpreter benchmarks: loops, calls and exception dispatch.

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use std::time::Duration;

use mintvm::{Program, Runtime, RuntimeConfig, Value};

const PROGRAM: &str = r#"
[[class]]
name = "Bench"

[[class.method]]
name = "SumTo"
params = ["i8"]
ret = "i8"
body = """
.locals init (i8, i8)
        ldc.i8 1
        stloc.1
        br COND
LOOP:   ldloc.0
        ldloc.1
        add
        stloc.0
        ldloc.1
        ldc.i8 1
        add
        stloc.1
COND:   ldloc.1
        ldarg.0
        ble LOOP
        ldloc.0
        ret
"""

[[class.method]]
name = "Fib"
params = ["i4"]
ret = "i4"
body = """
        ldarg.0
        ldc.i4.2
        bge REC
        ldarg.0
        ret
REC:    ldarg.0
        ldc.i4.1
        sub
        call Bench::Fib
        ldarg.0
        ldc.i4.2
        sub
        call Bench::Fib
        add
        ret
"""

[[class.method]]
name = "CountDown"
params = ["i4", "i4"]
ret = "i4"
body = """
        ldarg.0
        brtrue MORE
        ldarg.1
        ret
MORE:   ldarg.0
        ldc.i4.1
        sub
        ldarg.1
        ldc.i4.1
        add
        tail.call Bench::CountDown
        ret
"""

[[class.method]]
name = "Throws"
params = ["i4"]
ret = "i4"
body = """
.locals init (i4, i4)
LOOP:   ldloc.1
        ldarg.0
        bge DONE
TRY:    ldc.i4.1
        ldc.i4.0
        div
        pop
        leave NEXT
CATCH:  pop
        ldloc.0
        ldc.i4.1
        add
        stloc.0
        leave NEXT
NEXT:   ldloc.1
        ldc.i4.1
        add
        stloc.1
        br LOOP
DONE:   ldloc.0
        ret
.try TRY CATCH catch System.DivideByZeroException CATCH NEXT
"""
"#;

fn runtime(configure: impl FnOnce(&mut RuntimeConfig)) -> Runtime {
    let mut program = Program::from_toml(PROGRAM).unwrap();
    program.config.check_stack_balance = false;
    configure(&mut program.config);
    program.into_runtime()
}

fn bench_loops(c: &mut Criterion) {
    let mut group = c.benchmark_group("loops");
    group.sample_size(20);
    group.measurement_time(Duration::from_secs(5));

    let short = runtime(|_| {});
    let long = runtime(|config| config.short_branches = false);
    for n in [10_000i64, 1_000_000] {
        group.bench_with_input(BenchmarkId::new("short_branches", n), &n, |b, &n| {
            b.iter(|| short.invoke_named("Bench::SumTo", &[Value::I64(black_box(n))]).unwrap())
        });
        group.bench_with_input(BenchmarkId::new("long_branches", n), &n, |b, &n| {
            b.iter(|| long.invoke_named("Bench::SumTo", &[Value::I64(black_box(n))]).unwrap())
        });
    }
    group.finish();
}

fn bench_calls(c: &mut Criterion) {
    let mut group = c.benchmark_group("calls");
    group.sample_size(10);
    group.measurement_time(Duration::from_secs(5));

    let rt = runtime(|_| {});
    for n in [15, 20, 25] {
        group.bench_with_input(BenchmarkId::new("fib", n), &n, |b, &n| {
            b.iter(|| rt.invoke_named("Bench::Fib", &[Value::I32(black_box(n))]).unwrap())
        });
    }
    group.bench_function("tail_calls", |b| {
        b.iter(|| {
            rt.invoke_named("Bench::CountDown", &[Value::I32(black_box(100_000)), Value::I32(0)])
                .unwrap()
        })
    });
    group.finish();
}

fn bench_exceptions(c: &mut Criterion) {
    let mut group = c.benchmark_group("exceptions");
    group.sample_size(10);

    let rt = runtime(|_| {});
    group.bench_function("catch_1000", |b| {
        b.iter(|| rt.invoke_named("Bench::Throws", &[Value::I32(black_box(1000))]).unwrap())
    });
    group.finish();
}

criterion_group!(benches, bench_loops, bench_calls, bench_exceptions);
criterion_main!(benches);
