//! Calls from the interpreter into foreign C functions.
//!
//! Arguments are packed by register class: integers and pointers fill the
//! general-purpose argument registers in order, floats fill the vector
//! registers in order. On the SysV x86-64 and AAPCS64 conventions that is
//! all a callee with at most six integer and eight float parameters sees, so
//! a single fourteen-parameter thunk signature can call any of them.

use std::ffi::CString;

use tracing::debug;

use crate::error::VmError;
use crate::metadata::WellKnown;
use crate::vm::interp::Interp;
use crate::vm::{MintType, Outcome, RetKind, RuntimeMethod, StackValue};

pub const MAX_INT_ARGS: usize = 6;
pub const MAX_FLOAT_ARGS: usize = 8;

/// Arguments sorted into register classes.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Packed {
    pub ints: [u64; MAX_INT_ARGS],
    pub floats: [f64; MAX_FLOAT_ARGS],
    pub n_int: usize,
    pub n_float: usize,
}

/// Sort `args` into register classes by their declared storage types.
pub fn pack(method: &RuntimeMethod, args: &[StackValue]) -> Result<Packed, VmError> {
    let mut packed = Packed::default();
    let too_many = || VmError::Native(format!("{}: too many arguments for a native call", method.name));
    for (slot, &value) in method.args.iter().zip(args) {
        match slot.mint {
            MintType::R8 | MintType::R4 => {
                if packed.n_float == MAX_FLOAT_ARGS {
                    return Err(too_many());
                }
                packed.floats[packed.n_float] = match slot.mint {
                    // The callee reads the low 32 bits of the register.
                    MintType::R4 => f64::from_bits((value.f64() as f32).to_bits() as u64),
                    _ => value.f64(),
                };
                packed.n_float += 1;
            }
            MintType::Vt => {
                return Err(VmError::Native(format!(
                    "{}: value-type arguments cannot be passed to native code",
                    method.name
                )));
            }
            _ => {
                if packed.n_int == MAX_INT_ARGS {
                    return Err(too_many());
                }
                packed.ints[packed.n_int] = value.bits();
                packed.n_int += 1;
            }
        }
    }
    Ok(packed)
}

/// Raw result registers of a native call.
#[derive(Debug, Clone, Copy)]
enum RawResult {
    Int(u64),
    Double(f64),
    Single(f32),
}

#[cfg(all(unix, any(target_arch = "x86_64", target_arch = "aarch64")))]
unsafe fn call_packed(addr: usize, packed: &Packed, ret: RetKind) -> RawResult {
    type Thunk<R> = unsafe extern "C" fn(u64, u64, u64, u64, u64, u64, f64, f64, f64, f64, f64, f64, f64, f64) -> R;
    let i = packed.ints;
    let f = packed.floats;
    // SAFETY: the caller vouches that `addr` is a C function whose
    // parameters match the packed register classes.
    unsafe {
        match ret {
            RetKind::Value(MintType::R8) => {
                let thunk: Thunk<f64> = std::mem::transmute(addr);
                RawResult::Double(thunk(i[0], i[1], i[2], i[3], i[4], i[5], f[0], f[1], f[2], f[3], f[4], f[5], f[6], f[7]))
            }
            RetKind::Value(MintType::R4) => {
                let thunk: Thunk<f32> = std::mem::transmute(addr);
                RawResult::Single(thunk(i[0], i[1], i[2], i[3], i[4], i[5], f[0], f[1], f[2], f[3], f[4], f[5], f[6], f[7]))
            }
            _ => {
                let thunk: Thunk<u64> = std::mem::transmute(addr);
                RawResult::Int(thunk(i[0], i[1], i[2], i[3], i[4], i[5], f[0], f[1], f[2], f[3], f[4], f[5], f[6], f[7]))
            }
        }
    }
}

#[cfg(not(all(unix, any(target_arch = "x86_64", target_arch = "aarch64"))))]
unsafe fn call_packed(_addr: usize, _packed: &Packed, _ret: RetKind) -> RawResult {
    RawResult::Int(0)
}

fn supported() -> bool {
    cfg!(all(unix, any(target_arch = "x86_64", target_arch = "aarch64")))
}

/// Result slot of a native call, narrowed to the declared return type.
fn unpack(ret: RetKind, raw: RawResult) -> Option<StackValue> {
    let RetKind::Value(mint) = ret else {
        return None;
    };
    Some(match raw {
        RawResult::Double(v) => StackValue::F64(v),
        RawResult::Single(v) => StackValue::F64(v as f64),
        RawResult::Int(bits) => match mint {
            MintType::I1 => StackValue::I32(bits as i8 as i32),
            MintType::U1 => StackValue::I32(bits as u8 as i32),
            MintType::I2 => StackValue::I32(bits as i16 as i32),
            MintType::U2 => StackValue::I32(bits as u16 as i32),
            MintType::I4 => StackValue::I32(bits as i32),
            MintType::I8 => StackValue::I64(bits as i64),
            MintType::O => StackValue::Ref(crate::vm::ObjRef::from_addr(bits as usize)),
            _ => StackValue::Ptr(bits as usize as *mut u8),
        },
    })
}

/// Address of `symbol`, searching `library` (the running process when
/// empty).
#[cfg(unix)]
fn lookup(library: &str, symbol: &str) -> Option<usize> {
    let symbol = CString::new(symbol).ok()?;
    let library = if library.is_empty() {
        None
    } else {
        Some(CString::new(library).ok()?)
    };
    // SAFETY: both strings are NUL-terminated; handles are never closed.
    unsafe {
        let handle = libc::dlopen(
            library.as_ref().map_or(std::ptr::null(), |l| l.as_ptr()),
            libc::RTLD_NOW | libc::RTLD_LOCAL,
        );
        if handle.is_null() {
            return None;
        }
        let addr = libc::dlsym(handle, symbol.as_ptr());
        (!addr.is_null()).then_some(addr as usize)
    }
}

#[cfg(not(unix))]
fn lookup(_library: &str, _symbol: &str) -> Option<usize> {
    None
}

/// Call a pinvoke method. Runs with the caller's frame published so a
/// stack walk or collector can see it; an exception parked by managed code
/// re-entered from the callee is rethrown here.
pub(crate) fn call(
    interp: &Interp<'_>,
    method: &RuntimeMethod,
    library: &str,
    symbol: &str,
    args: &[StackValue],
) -> Result<Outcome, VmError> {
    let rt = interp.rt;
    let ctx = interp.ctx;
    if !supported() {
        return Err(VmError::Native(format!(
            "{}: native calls are not supported on this platform",
            method.name
        )));
    }
    // Host registrations win over the library, and may arrive late.
    let Some(addr) = rt
        .native(symbol)
        .or_else(|| method.native_or_resolve(|| lookup(library, symbol)))
    else {
        return Ok(Outcome::Threw(rt.new_exception(
            WellKnown::MissingMethodException,
            &format!("unable to find `{symbol}` in `{library}`"),
        )));
    };
    let packed = pack(method, args)?;
    debug!(target: "mintvm::native", method = %method.name, symbol, ints = packed.n_int, floats = packed.n_float, "pinvoke");

    ctx.native_enter();
    rt.gc().enter_native(ctx);
    // SAFETY: the method declaration describes the foreign signature.
    let raw = unsafe { call_packed(addr, &packed, method.ret) };
    rt.gc().leave_native(ctx);
    ctx.native_leave();

    if let Some(pending) = ctx.take_pending() {
        return Ok(Outcome::Threw(pending.exception));
    }
    Ok(Outcome::Returned(unpack(method.ret, raw)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unpack_narrows_integers() {
        let ret = RetKind::Value(MintType::U1);
        assert_eq!(unpack(ret, RawResult::Int(0x1ff)), Some(StackValue::I32(0xff)));
        let ret = RetKind::Value(MintType::I2);
        assert_eq!(unpack(ret, RawResult::Int(0xffff)), Some(StackValue::I32(-1)));
        assert_eq!(unpack(RetKind::Void, RawResult::Int(7)), None);
    }

    #[cfg(unix)]
    #[test]
    fn test_lookup_finds_libc_symbols() {
        assert!(lookup("", "labs").is_some());
        assert!(lookup("", "no_such_symbol_for_sure").is_none());
    }
}
