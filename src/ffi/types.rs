//! Types shared with C callers.

use std::ffi::CString;
use std::sync::{Arc, Mutex, PoisonError};

use crate::vm::{MintType, ObjRef, Runtime, StackValue};

/// Result codes of the C API.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MintResult {
    Ok = 0,
    /// Fatal interpreter error
    ErrorRuntime = 1,
    /// A managed exception escaped the call
    ErrorException = 2,
    ErrorInvalidArg = 3,
    ErrorNotFound = 4,
    ErrorLoad = 5,
}

impl MintResult {
    pub fn is_ok(self) -> bool {
        self == MintResult::Ok
    }
}

/// Kind of payload in a [`MintValue`].
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MintTag {
    Void = 0,
    I32 = 1,
    I64 = 2,
    F64 = 3,
    /// Managed object reference
    Ref = 4,
    /// Unmanaged pointer or native int
    Ptr = 5,
}

/// A value crossing the C API: tag plus raw payload bits.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MintValue {
    pub tag: MintTag,
    pub bits: u64,
}

impl MintValue {
    pub const VOID: MintValue = MintValue {
        tag: MintTag::Void,
        bits: 0,
    };

    pub fn i32(v: i32) -> Self {
        Self {
            tag: MintTag::I32,
            bits: v as i64 as u64,
        }
    }

    pub fn i64(v: i64) -> Self {
        Self {
            tag: MintTag::I64,
            bits: v as u64,
        }
    }

    pub fn f64(v: f64) -> Self {
        Self {
            tag: MintTag::F64,
            bits: v.to_bits(),
        }
    }

    pub fn from_stack(v: StackValue) -> Self {
        let tag = match v {
            StackValue::I32(_) => MintTag::I32,
            StackValue::I64(_) => MintTag::I64,
            StackValue::F64(_) => MintTag::F64,
            StackValue::Ref(_) => MintTag::Ref,
            StackValue::Ptr(_) | StackValue::Vt(_) => MintTag::Ptr,
        };
        Self { tag, bits: v.bits() }
    }

    /// Slot for an argument of storage type `mint`, or `None` when the tag
    /// does not fit.
    pub fn to_stack(self, mint: MintType) -> Option<StackValue> {
        Some(match (mint, self.tag) {
            (MintType::I1 | MintType::U1 | MintType::I2 | MintType::U2 | MintType::I4, MintTag::I32) => {
                StackValue::I32(self.bits as i32)
            }
            (MintType::I8, MintTag::I64 | MintTag::I32) => StackValue::I64(if self.tag == MintTag::I32 {
                self.bits as i32 as i64
            } else {
                self.bits as i64
            }),
            (MintType::R4 | MintType::R8, MintTag::F64) => StackValue::F64(f64::from_bits(self.bits)),
            (MintType::O, MintTag::Ref) => StackValue::Ref(ObjRef::from_addr(self.bits as usize)),
            (MintType::P, MintTag::Ptr | MintTag::I64) => StackValue::Ptr(self.bits as usize as *mut u8),
            _ => return None,
        })
    }
}

/// Opaque runtime handle.
#[repr(C)]
pub struct MintRuntime {
    _private: [u8; 0],
}

/// What a `MintRuntime` pointer points to.
pub(crate) struct RuntimeWrapper {
    pub runtime: Arc<Runtime>,
    pub last_error: Mutex<Option<CString>>,
}

impl RuntimeWrapper {
    pub fn new(runtime: Arc<Runtime>) -> Self {
        Self {
            runtime,
            last_error: Mutex::new(None),
        }
    }

    pub fn set_error(&self, message: impl Into<String>) {
        let message = CString::new(message.into().replace('\0', " ")).unwrap_or_default();
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = Some(message);
    }

    pub fn clear_error(&self) {
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

/// Borrow the wrapper behind a C handle.
///
/// # Safety
/// `rt` must be null or a live pointer returned by `mint_runtime_new` or
/// `mint_runtime_load`.
pub(crate) unsafe fn wrapper<'a>(rt: *const MintRuntime) -> Option<&'a RuntimeWrapper> {
    unsafe { (rt as *const RuntimeWrapper).as_ref() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tags_must_fit_argument_types() {
        assert_eq!(MintValue::i32(-3).to_stack(MintType::I4), Some(StackValue::I32(-3)));
        assert_eq!(MintValue::i32(-3).to_stack(MintType::I8), Some(StackValue::I64(-3)));
        assert_eq!(MintValue::f64(1.5).to_stack(MintType::I4), None);
        assert_eq!(MintValue::i64(9).to_stack(MintType::O), None);
    }

    #[test]
    fn test_from_stack_keeps_bits() {
        let v = MintValue::from_stack(StackValue::F64(2.25));
        assert_eq!(v.tag, MintTag::F64);
        assert_eq!(f64::from_bits(v.bits), 2.25);
    }
}
