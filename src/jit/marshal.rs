//! Value marshaling between interpreter slots and compiled code.
//!
//! Compiled code sees every value as a 128-bit (tag: u64, payload: u64)
//! pair.

use crate::error::VmError;
use crate::vm::{MintType, ObjRef, Runtime, StackValue};

/// Value tags of the compiled-code representation.
pub mod tags {
    pub const TAG_I32: u64 = 0;
    pub const TAG_I64: u64 = 1;
    pub const TAG_F64: u64 = 2;
    pub const TAG_REF: u64 = 3;
    pub const TAG_PTR: u64 = 4;
    pub const TAG_VOID: u64 = 5;
}

/// Status codes returned by compiled entry points and by
/// [`JitContext::invoke`].
pub mod status {
    pub const OK: u32 = 0;
    /// A managed exception is in [`super::JitContext::exception`]
    pub const THREW: u32 = 1;
    /// Fatal error; details stay on the Rust side
    pub const ERROR: u32 = 2;
}

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct JitValue {
    pub tag: u64,
    pub payload: u64,
}

impl JitValue {
    pub const VOID: JitValue = JitValue {
        tag: tags::TAG_VOID,
        payload: 0,
    };

    pub fn i32(v: i32) -> Self {
        JitValue {
            tag: tags::TAG_I32,
            payload: v as i64 as u64,
        }
    }

    pub fn i64(v: i64) -> Self {
        JitValue {
            tag: tags::TAG_I64,
            payload: v as u64,
        }
    }

    pub fn f64(v: f64) -> Self {
        JitValue {
            tag: tags::TAG_F64,
            payload: v.to_bits(),
        }
    }

    pub fn from_stack(value: StackValue) -> Self {
        let tag = match value {
            StackValue::I32(_) => tags::TAG_I32,
            StackValue::I64(_) => tags::TAG_I64,
            StackValue::F64(_) => tags::TAG_F64,
            StackValue::Ref(_) => tags::TAG_REF,
            StackValue::Ptr(_) | StackValue::Vt(_) => tags::TAG_PTR,
        };
        JitValue {
            tag,
            payload: value.bits(),
        }
    }

    /// Slot of storage type `mint`, or `None` when the tag does not fit.
    pub fn to_stack(self, mint: MintType) -> Option<StackValue> {
        use tags::*;
        Some(match (mint, self.tag) {
            (MintType::I1 | MintType::U1 | MintType::I2 | MintType::U2 | MintType::I4, TAG_I32 | TAG_I64) => {
                StackValue::I32(self.payload as i32)
            }
            (MintType::I8, TAG_I64) => StackValue::I64(self.payload as i64),
            (MintType::I8, TAG_I32) => StackValue::I64(self.payload as i32 as i64),
            (MintType::R4 | MintType::R8, TAG_F64) => StackValue::F64(f64::from_bits(self.payload)),
            (MintType::O, TAG_REF) => StackValue::Ref(ObjRef::from_addr(self.payload as usize)),
            (MintType::P, TAG_PTR | TAG_I64) => StackValue::Ptr(self.payload as usize as *mut u8),
            (MintType::Vt, TAG_PTR) => StackValue::Vt(self.payload as usize as *mut u8),
            _ => return None,
        })
    }
}

/// Rust-side state of one compiled call, opaque to compiled code.
#[derive(Default)]
pub struct JitState {
    pub(crate) error: Option<VmError>,
}

/// Context handed to every compiled entry point.
#[repr(C)]
pub struct JitContext {
    /// Opaque to compiled code
    pub runtime: *const Runtime,
    /// Call a method by handle, possibly back into the interpreter
    pub invoke: unsafe extern "C" fn(
        ctx: *mut JitContext,
        method: u32,
        args: *const JitValue,
        nargs: usize,
        ret: *mut JitValue,
    ) -> u32,
    /// Object reference of the exception when a call reports `THREW`
    pub exception: u64,
    /// Destination of a value-type result
    pub retbuf: *mut u8,
    pub state: *mut JitState,
}

impl JitContext {
    /// Throw `exception` out of compiled code: store it and return the
    /// status to hand back to the caller.
    pub fn throw(&mut self, exception: ObjRef) -> u32 {
        self.exception = exception.addr() as u64;
        status::THREW
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_ints_accept_either_int_tag() {
        assert_eq!(JitValue::i64(-1).to_stack(MintType::I4), Some(StackValue::I32(-1)));
        assert_eq!(JitValue::i32(-1).to_stack(MintType::I8), Some(StackValue::I64(-1)));
        assert_eq!(JitValue::f64(1.0).to_stack(MintType::I4), None);
        assert_eq!(JitValue::VOID.to_stack(MintType::O), None);
    }

    #[test]
    fn test_from_stack_tags() {
        assert_eq!(JitValue::from_stack(StackValue::I32(7)), JitValue::i32(7));
        assert_eq!(JitValue::from_stack(StackValue::NULL).tag, tags::TAG_REF);
    }
}
