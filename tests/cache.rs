//! The compiled-method cache under concurrent first calls.

mod common;

use std::sync::{Arc, Barrier};
use std::thread;

use mintvm::Value;

const PROGRAM: &str = r#"
[[class]]
name = "Cache"

[[class.method]]
name = "Leaf"
params = ["i4"]
ret = "i4"
body = """
        ldarg.0
        ldc.i4.2
        mul
        ret
"""

[[class.method]]
name = "Root"
params = ["i4"]
ret = "i4"
body = """
        ldarg.0
        call Cache::Leaf
        ldarg.0
        call Cache::Leaf
        add
        ret
"""

[[class.method]]
name = "Unused"
body = """
        ret
"""
"#;

#[test]
fn test_methods_compile_once_on_first_call() {
    let (rt, _) = common::load(PROGRAM);
    assert_eq!(rt.compile_count(), 0);
    assert_eq!(rt.invoke_named("Cache::Root", &[Value::I32(3)]).unwrap(), Value::I32(12));
    assert_eq!(rt.compile_count(), 2);
    assert_eq!(rt.invoke_named("Cache::Root", &[Value::I32(4)]).unwrap(), Value::I32(16));
    assert_eq!(rt.compile_count(), 2);
}

#[test]
fn test_concurrent_first_calls_share_one_compiled_method() {
    let (rt, _) = common::load(PROGRAM);
    let rt = Arc::new(rt);
    let id = rt.metadata().find_method("Cache::Root").unwrap();
    let barrier = Arc::new(Barrier::new(8));

    let compiled: Vec<_> = thread::scope(|s| {
        let workers: Vec<_> = (0..8)
            .map(|_| {
                let rt = Arc::clone(&rt);
                let barrier = Arc::clone(&barrier);
                s.spawn(move || {
                    barrier.wait();
                    rt.compiled_method(id).unwrap()
                })
            })
            .collect();
        workers.into_iter().map(|w| w.join().unwrap()).collect()
    });

    assert_eq!(rt.compile_count(), 1);
    for c in &compiled[1..] {
        assert!(Arc::ptr_eq(&compiled[0], c));
    }
}

#[test]
fn test_concurrent_invocations_agree() {
    let (rt, _) = common::load(PROGRAM);
    let rt = Arc::new(rt);
    let results: Vec<_> = thread::scope(|s| {
        let workers: Vec<_> = (0..6)
            .map(|i| {
                let rt = Arc::clone(&rt);
                s.spawn(move || rt.invoke_named("Cache::Root", &[Value::I32(i)]).unwrap())
            })
            .collect();
        workers.into_iter().map(|w| w.join().unwrap()).collect()
    });
    assert_eq!(results, (0..6).map(|i| Value::I32(i * 4)).collect::<Vec<_>>());
    assert_eq!(rt.compile_count(), 2);
}
