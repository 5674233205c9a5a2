//! Internal calls: host Rust functions behind `internalcall` methods.
//!
//! An icall receives the interpreter's argument slots as they are and
//! returns a result slot, or the exception object to throw.

use std::sync::Arc;

use crate::metadata::WellKnown;
use crate::vm::{ObjRef, Runtime, StackValue, ThreadContext, Value};

/// What an icall sees of the caller.
pub struct IcallContext<'a> {
    pub runtime: &'a Runtime,
    pub thread: &'a ThreadContext,
}

pub type IcallResult = Result<Option<StackValue>, ObjRef>;

pub type Icall = Arc<dyn Fn(&IcallContext<'_>, &[StackValue]) -> IcallResult + Send + Sync>;

impl IcallContext<'_> {
    /// A fresh exception object to return as `Err`.
    pub fn exception(&self, which: WellKnown, message: &str) -> ObjRef {
        self.runtime.new_exception(which, message)
    }

    /// UTF-16 contents of a string argument; null is an error.
    pub fn chars(&self, v: StackValue) -> Result<&[u16], ObjRef> {
        match self.runtime.heap().get(v.obj()).and_then(|o| o.chars()) {
            Some(chars) => Ok(chars),
            None => Err(self.exception(WellKnown::NullReferenceException, "string reference not set")),
        }
    }

    fn write(&self, text: &str, newline: bool) -> IcallResult {
        match self.runtime.console(text, newline) {
            Ok(()) => Ok(None),
            Err(e) => Err(self.exception(WellKnown::ExecutionEngineException, &format!("console write failed: {e}"))),
        }
    }
}

fn icall<F>(f: F) -> Icall
where
    F: Fn(&IcallContext<'_>, &[StackValue]) -> IcallResult + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Icalls every runtime starts with.
pub(crate) fn builtins() -> Vec<(&'static str, Icall)> {
    vec![
        (
            "System.String::get_Length",
            icall(|cx, args| Ok(Some(StackValue::I32(cx.chars(args[0])?.len() as i32)))),
        ),
        (
            "System.String::get_Chars",
            icall(|cx, args| {
                let chars = cx.chars(args[0])?;
                match usize::try_from(args[1].i32()).ok().and_then(|i| chars.get(i)) {
                    Some(&c) => Ok(Some(StackValue::I32(c as i32))),
                    None => Err(cx.exception(
                        WellKnown::IndexOutOfRangeException,
                        "index was outside the bounds of the string",
                    )),
                }
            }),
        ),
        ("System.String::Concat", icall(concat)),
        (
            "System.Console::WriteLine(string)",
            icall(|cx, args| {
                let text = cx.runtime.read_string(args[0].obj()).unwrap_or_default();
                cx.write(&text, true)
            }),
        ),
        (
            "System.Console::Write(string)",
            icall(|cx, args| {
                let text = cx.runtime.read_string(args[0].obj()).unwrap_or_default();
                cx.write(&text, false)
            }),
        ),
        (
            "System.Console::WriteLine(i4)",
            icall(|cx, args| cx.write(&args[0].i32().to_string(), true)),
        ),
        (
            "System.Console::WriteLine(i8)",
            icall(|cx, args| cx.write(&args[0].i64().to_string(), true)),
        ),
        (
            "System.Console::WriteLine(r8)",
            icall(|cx, args| cx.write(&Value::F64(args[0].f64()).to_string(), true)),
        ),
    ]
}

/// Null operands concatenate as empty strings.
fn concat(cx: &IcallContext<'_>, args: &[StackValue]) -> IcallResult {
    let heap = cx.runtime.heap();
    let part = |v: StackValue| heap.get(v.obj()).and_then(|o| o.chars()).unwrap_or(&[]);
    let (a, b) = (part(args[0]), part(args[1]));
    let mut chars = Vec::with_capacity(a.len() + b.len());
    chars.extend_from_slice(a);
    chars.extend_from_slice(b);
    Ok(Some(StackValue::Ref(heap.alloc_utf16(chars.into_boxed_slice()))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::MetadataBuilder;

    fn run<R>(f: impl FnOnce(&IcallContext<'_>) -> R) -> R {
        let runtime = Runtime::new(MetadataBuilder::new().finish().unwrap());
        ThreadContext::with(|thread| f(&IcallContext { runtime: &runtime, thread }))
    }

    fn lookup(name: &str) -> Icall {
        builtins().into_iter().find(|(n, _)| *n == name).unwrap().1
    }

    #[test]
    fn test_concat_treats_null_as_empty() {
        run(|cx| {
            let s = cx.runtime.string("ab");
            let out = concat(cx, &[StackValue::Ref(s), StackValue::NULL]).unwrap().unwrap();
            assert_eq!(cx.runtime.read_string(out.obj()).as_deref(), Some("ab"));
        });
    }

    #[test]
    fn test_get_chars_bounds() {
        run(|cx| {
            let s = StackValue::Ref(cx.runtime.string("xyz"));
            let f = lookup("System.String::get_Chars");
            assert_eq!(f(cx, &[s, StackValue::I32(2)]), Ok(Some(StackValue::I32('z' as i32))));
            let ex = f(cx, &[s, StackValue::I32(3)]).unwrap_err();
            assert_eq!(cx.runtime.describe_exception(ex).class, "System.IndexOutOfRangeException");
        });
    }

    #[test]
    fn test_length_of_null_throws() {
        run(|cx| {
            let ex = lookup("System.String::get_Length")(cx, &[StackValue::NULL]).unwrap_err();
            assert_eq!(cx.runtime.describe_exception(ex).class, "System.NullReferenceException");
        });
    }
}
