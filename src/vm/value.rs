use std::fmt;
use std::ptr;

use super::heap::ObjRef;
use super::opcodes::MintType;

/// One evaluation-stack slot.
///
/// The variant is fixed by the instruction that produced the slot, so the
/// interpreter reads slots through the accessor matching the compiled
/// opcode. Accessors reinterpret the payload bits; debug builds assert the
/// variant.
#[derive(Clone, Copy, PartialEq)]
pub enum StackValue {
    I32(i32),
    I64(i64),
    F64(f64),
    Ref(ObjRef),
    /// Managed or unmanaged pointer
    Ptr(*mut u8),
    /// Pointer to a value on the frame's value-type stack
    Vt(*mut u8),
}

impl StackValue {
    pub const NULL: StackValue = StackValue::Ref(ObjRef::NULL);

    #[inline]
    pub fn bits(self) -> u64 {
        match self {
            StackValue::I32(v) => v as i64 as u64,
            StackValue::I64(v) => v as u64,
            StackValue::F64(v) => v.to_bits(),
            StackValue::Ref(r) => r.addr() as u64,
            StackValue::Ptr(p) | StackValue::Vt(p) => p as usize as u64,
        }
    }

    #[inline]
    pub fn i32(self) -> i32 {
        debug_assert!(matches!(self, StackValue::I32(_)), "expected i32 slot, found {self:?}");
        self.bits() as i32
    }

    /// 64-bit integer or native int; pointers count as native ints.
    #[inline]
    pub fn i64(self) -> i64 {
        debug_assert!(
            matches!(self, StackValue::I64(_) | StackValue::Ptr(_)),
            "expected i64 slot, found {self:?}"
        );
        self.bits() as i64
    }

    #[inline]
    pub fn f64(self) -> f64 {
        debug_assert!(matches!(self, StackValue::F64(_)), "expected f64 slot, found {self:?}");
        f64::from_bits(self.bits())
    }

    #[inline]
    pub fn obj(self) -> ObjRef {
        debug_assert!(matches!(self, StackValue::Ref(_)), "expected object slot, found {self:?}");
        ObjRef::from_addr(self.bits() as usize)
    }

    #[inline]
    pub fn ptr(self) -> *mut u8 {
        debug_assert!(
            matches!(self, StackValue::Ptr(_) | StackValue::I64(_) | StackValue::Vt(_)),
            "expected pointer slot, found {self:?}"
        );
        self.bits() as usize as *mut u8
    }

    #[inline]
    pub fn vt(self) -> *mut u8 {
        debug_assert!(
            matches!(self, StackValue::Vt(_) | StackValue::Ptr(_)),
            "expected value-type slot, found {self:?}"
        );
        self.bits() as usize as *mut u8
    }
}

impl fmt::Debug for StackValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StackValue::I32(v) => write!(f, "I32({v})"),
            StackValue::I64(v) => write!(f, "I64({v})"),
            StackValue::F64(v) => write!(f, "F64({v})"),
            StackValue::Ref(r) => write!(f, "Ref({:#x})", r.addr()),
            StackValue::Ptr(p) => write!(f, "Ptr({p:p})"),
            StackValue::Vt(p) => write!(f, "Vt({p:p})"),
        }
    }
}

/// Read a slot of storage type `mint` from `src`.
///
/// # Safety
/// `src` must be valid for reading `mint.size()` bytes. Value types are not
/// handled here.
#[inline]
pub unsafe fn load(mint: MintType, src: *const u8) -> StackValue {
    unsafe {
        match mint {
            MintType::I1 => StackValue::I32(ptr::read_unaligned(src as *const i8) as i32),
            MintType::U1 => StackValue::I32(ptr::read_unaligned(src) as i32),
            MintType::I2 => StackValue::I32(ptr::read_unaligned(src as *const i16) as i32),
            MintType::U2 => StackValue::I32(ptr::read_unaligned(src as *const u16) as i32),
            MintType::I4 => StackValue::I32(ptr::read_unaligned(src as *const i32)),
            MintType::I8 => StackValue::I64(ptr::read_unaligned(src as *const i64)),
            MintType::R4 => StackValue::F64(ptr::read_unaligned(src as *const f32) as f64),
            MintType::R8 => StackValue::F64(ptr::read_unaligned(src as *const f64)),
            MintType::O => StackValue::Ref(ObjRef::from_addr(ptr::read_unaligned(src as *const usize))),
            MintType::P => StackValue::Ptr(ptr::read_unaligned(src as *const usize) as *mut u8),
            MintType::Vt => StackValue::Vt(src as *mut u8),
        }
    }
}

/// Write `value` to `dst` as storage type `mint`, truncating narrow integers.
///
/// # Safety
/// `dst` must be valid for writing `mint.size()` bytes.
#[inline]
pub unsafe fn store(mint: MintType, dst: *mut u8, value: StackValue) {
    unsafe {
        match mint {
            MintType::I1 | MintType::U1 => ptr::write_unaligned(dst, value.bits() as u8),
            MintType::I2 | MintType::U2 => ptr::write_unaligned(dst as *mut u16, value.bits() as u16),
            MintType::I4 => ptr::write_unaligned(dst as *mut u32, value.bits() as u32),
            MintType::I8 | MintType::O | MintType::P => {
                ptr::write_unaligned(dst as *mut u64, value.bits())
            }
            MintType::R4 => ptr::write_unaligned(dst as *mut f32, value.f64() as f32),
            MintType::R8 => ptr::write_unaligned(dst as *mut f64, value.f64()),
            MintType::Vt => debug_assert!(false, "value types are copied by size"),
        }
    }
}

/// A value crossing the embedding API.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Void,
    I32(i32),
    I64(i64),
    F64(f64),
    Ref(ObjRef),
    /// Raw bytes of a value type
    Struct(Box<[u8]>),
}

impl Value {
    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Value::I32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::I64(v) => Some(*v),
            Value::I32(v) => Some(*v as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::F64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_ref(&self) -> Option<ObjRef> {
        match self {
            Value::Ref(r) => Some(*r),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Void => write!(f, "void"),
            Value::I32(v) => write!(f, "{v}"),
            Value::I64(v) => write!(f, "{v}"),
            Value::F64(v) => {
                if v.fract() == 0.0 && v.is_finite() {
                    write!(f, "{v}.0")
                } else {
                    write!(f, "{v}")
                }
            }
            Value::Ref(r) if r.is_null() => write!(f, "null"),
            Value::Ref(_) => write!(f, "<object>"),
            Value::Struct(bytes) => write!(f, "<struct {} bytes>", bytes.len()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_narrow_loads_extend() {
        let bytes = [0xffu8, 0xff, 0xff, 0xff];
        unsafe {
            assert_eq!(load(MintType::I1, bytes.as_ptr()), StackValue::I32(-1));
            assert_eq!(load(MintType::U1, bytes.as_ptr()), StackValue::I32(255));
            assert_eq!(load(MintType::I2, bytes.as_ptr()), StackValue::I32(-1));
            assert_eq!(load(MintType::U2, bytes.as_ptr()), StackValue::I32(65535));
        }
    }

    #[test]
    fn test_store_truncates() {
        let mut word = 0u64;
        let dst = &mut word as *mut u64 as *mut u8;
        unsafe {
            store(MintType::I2, dst, StackValue::I32(0x12345));
            assert_eq!(load(MintType::U2, dst), StackValue::I32(0x2345));
        }
    }

    #[test]
    fn test_r4_roundtrip_through_f64_slot() {
        let mut word = 0u64;
        let dst = &mut word as *mut u64 as *mut u8;
        unsafe {
            store(MintType::R4, dst, StackValue::F64(1.5));
            assert_eq!(load(MintType::R4, dst), StackValue::F64(1.5));
        }
    }

    #[test]
    fn test_i32_bits_sign_extend() {
        assert_eq!(StackValue::I32(-2).bits(), u64::MAX - 1);
    }

    #[test]
    fn test_display() {
        assert_eq!(Value::F64(2.0).to_string(), "2.0");
        assert_eq!(Value::I32(-7).to_string(), "-7");
        assert_eq!(Value::Ref(ObjRef::NULL).to_string(), "null");
    }
}
