use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use crate::metadata::{ClassId, TypeDesc, WellKnown};

use super::context::ThreadContext;

// =============================================================================
// ObjRef - nullable reference to a heap object
// =============================================================================

/// Reference to a managed object. Null is a valid value.
///
/// Objects are never moved or freed while the owning [`Heap`] is alive, so a
/// non-null `ObjRef` produced by a heap stays dereferenceable through it.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ObjRef(*const Object);

// Objects are only mutated through raw slot writes that the managed memory
// model already allows to race.
unsafe impl Send for ObjRef {}
unsafe impl Sync for ObjRef {}

impl ObjRef {
    pub const NULL: ObjRef = ObjRef(std::ptr::null());

    #[inline]
    pub fn is_null(self) -> bool {
        self.0.is_null()
    }

    #[inline]
    pub fn addr(self) -> usize {
        self.0 as usize
    }

    #[inline]
    pub fn from_addr(addr: usize) -> ObjRef {
        ObjRef(addr as *const Object)
    }
}

impl Hash for ObjRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.addr().hash(state);
    }
}

impl fmt::Debug for ObjRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "ObjRef(null)")
        } else {
            write!(f, "ObjRef({:#x})", self.addr())
        }
    }
}

// =============================================================================
// Object layout
// =============================================================================

/// Largest element storage a single array may have.
pub const MAX_ARRAY_BYTES: usize = 1 << 31;

/// Zeroed, 8-byte aligned backing store of an object.
pub(crate) struct RawBuf(*mut [u64]);

unsafe impl Send for RawBuf {}
unsafe impl Sync for RawBuf {}

impl RawBuf {
    pub(crate) fn zeroed(bytes: usize) -> RawBuf {
        let words = bytes.div_ceil(8).max(1);
        RawBuf(Box::into_raw(vec![0u64; words].into_boxed_slice()))
    }

    /// Like `zeroed`, but `None` when the allocator refuses.
    pub(crate) fn try_zeroed(bytes: usize) -> Option<RawBuf> {
        let words = bytes.div_ceil(8).max(1);
        let mut buf: Vec<u64> = Vec::new();
        buf.try_reserve_exact(words).ok()?;
        buf.resize(words, 0);
        Some(RawBuf(Box::into_raw(buf.into_boxed_slice())))
    }

    pub(crate) fn as_ptr(&self) -> *mut u8 {
        self.0 as *mut u64 as *mut u8
    }
}

impl Drop for RawBuf {
    fn drop(&mut self) {
        // SAFETY: produced by Box::into_raw in `zeroed` and dropped once.
        unsafe { drop(Box::from_raw(self.0)) }
    }
}

enum ObjectKind {
    Instance(RawBuf),
    Array {
        elem: TypeDesc,
        elem_size: u32,
        len: usize,
        data: RawBuf,
    },
    Str(Box<[u16]>),
}

/// A managed object: class pointer plus payload.
pub struct Object {
    class: ClassId,
    kind: ObjectKind,
}

impl Object {
    pub fn class(&self) -> ClassId {
        self.class
    }

    /// Start of instance fields or array elements. Strings have no
    /// addressable data.
    pub fn data(&self) -> *mut u8 {
        match &self.kind {
            ObjectKind::Instance(buf) => buf.as_ptr(),
            ObjectKind::Array { data, .. } => data.as_ptr(),
            ObjectKind::Str(_) => std::ptr::null_mut(),
        }
    }

    pub fn array_len(&self) -> Option<usize> {
        match &self.kind {
            ObjectKind::Array { len, .. } => Some(*len),
            _ => None,
        }
    }

    pub fn array_elem(&self) -> Option<&TypeDesc> {
        match &self.kind {
            ObjectKind::Array { elem, .. } => Some(elem),
            _ => None,
        }
    }

    /// Address of element `index`, or `None` when out of range.
    pub fn element(&self, index: i64) -> Option<*mut u8> {
        match &self.kind {
            ObjectKind::Array {
                elem_size,
                len,
                data,
                ..
            } if index >= 0 && (index as usize) < *len => {
                // SAFETY: index is in bounds of a len * elem_size allocation.
                Some(unsafe { data.as_ptr().add(index as usize * *elem_size as usize) })
            }
            _ => None,
        }
    }

    pub fn chars(&self) -> Option<&[u16]> {
        match &self.kind {
            ObjectKind::Str(chars) => Some(chars),
            _ => None,
        }
    }

    pub fn to_string_lossy(&self) -> Option<String> {
        self.chars().map(String::from_utf16_lossy)
    }
}

// =============================================================================
// GC integration points
// =============================================================================

/// Hooks a collector plugs into.
///
/// The heap never collects on its own; an embedder wanting a tracing
/// collector observes stores, safepoints and native transitions here and
/// walks frames through [`ThreadContext::walk`].
pub trait GcHooks: Send + Sync {
    /// Called after a reference is written into a heap or static slot.
    fn write_barrier(&self, _slot: *mut u8, _value: ObjRef) {}

    /// Called at backward branches and method entries.
    fn safepoint(&self, _thread: &ThreadContext) {}

    /// Called before control leaves managed code for a foreign function.
    fn enter_native(&self, _thread: &ThreadContext) {}

    fn leave_native(&self, _thread: &ThreadContext) {}
}

/// Hooks that do nothing.
#[derive(Debug, Default)]
pub struct NoGc;

impl GcHooks for NoGc {}

// =============================================================================
// Heap
// =============================================================================

/// Object store. Allocation is thread safe; objects live until the heap drops.
pub struct Heap {
    objects: Mutex<Vec<Box<Object>>>,
    interned: Mutex<HashMap<String, ObjRef>>,
    bytes: AtomicUsize,
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Heap {
    pub fn new() -> Self {
        Self {
            objects: Mutex::new(Vec::new()),
            interned: Mutex::new(HashMap::new()),
            bytes: AtomicUsize::new(0),
        }
    }

    fn insert(&self, object: Object, bytes: usize) -> ObjRef {
        let boxed = Box::new(object);
        let r = ObjRef(&*boxed as *const Object);
        self.objects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(boxed);
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
        r
    }

    pub fn alloc_instance(&self, class: ClassId, size: u32) -> ObjRef {
        self.insert(
            Object {
                class,
                kind: ObjectKind::Instance(RawBuf::zeroed(size as usize)),
            },
            size as usize,
        )
    }

    /// `None` when the element storage would exceed [`MAX_ARRAY_BYTES`] or
    /// cannot be allocated.
    pub fn alloc_array(&self, elem: TypeDesc, elem_size: u32, len: usize) -> Option<ObjRef> {
        let bytes = (elem_size as usize)
            .checked_mul(len)
            .filter(|&bytes| bytes <= MAX_ARRAY_BYTES)?;
        let data = RawBuf::try_zeroed(bytes)?;
        Some(self.insert(
            Object {
                class: WellKnown::Array.id(),
                kind: ObjectKind::Array {
                    elem,
                    elem_size,
                    len,
                    data,
                },
            },
            bytes,
        ))
    }

    pub fn alloc_string(&self, text: &str) -> ObjRef {
        let chars: Box<[u16]> = text.encode_utf16().collect();
        self.alloc_utf16(chars)
    }

    pub fn alloc_utf16(&self, chars: Box<[u16]>) -> ObjRef {
        let bytes = chars.len() * 2;
        self.insert(
            Object {
                class: WellKnown::String.id(),
                kind: ObjectKind::Str(chars),
            },
            bytes,
        )
    }

    /// The shared string object for a literal.
    pub fn intern(&self, text: &str) -> ObjRef {
        let mut interned = self.interned.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(&r) = interned.get(text) {
            return r;
        }
        let r = self.alloc_string(text);
        interned.insert(text.to_string(), r);
        r
    }

    /// Dereference `r`. Returns `None` for null.
    pub fn get(&self, r: ObjRef) -> Option<&Object> {
        // SAFETY: every non-null ObjRef handed out by this heap points into a
        // Box owned by `objects`, which only grows.
        unsafe { r.0.as_ref() }
    }

    pub fn object_count(&self) -> usize {
        self.objects.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn allocated_bytes(&self) -> usize {
        self.bytes.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for Heap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Heap")
            .field("objects", &self.object_count())
            .field("bytes", &self.allocated_bytes())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_zeroed_and_aligned() {
        let heap = Heap::new();
        let r = heap.alloc_instance(WellKnown::Object.id(), 20);
        let obj = heap.get(r).unwrap();
        assert_eq!(obj.data() as usize % 8, 0);
        let bytes = unsafe { std::slice::from_raw_parts(obj.data(), 20) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_array_bounds() {
        let heap = Heap::new();
        let r = heap.alloc_array(TypeDesc::I4, 4, 3).unwrap();
        let obj = heap.get(r).unwrap();
        assert_eq!(obj.array_len(), Some(3));
        assert!(obj.element(2).is_some());
        assert!(obj.element(3).is_none());
        assert!(obj.element(-1).is_none());
        assert_eq!(obj.element(1).unwrap() as usize - obj.data() as usize, 4);
    }

    #[test]
    fn test_array_size_overflow_refused() {
        let heap = Heap::new();
        assert!(heap.alloc_array(TypeDesc::I8, 8, (1usize << 61) + 1).is_none());
        assert!(heap.alloc_array(TypeDesc::I8, 8, i32::MAX as usize).is_none());
        assert_eq!(heap.object_count(), 0);
    }

    #[test]
    fn test_intern_returns_same_object() {
        let heap = Heap::new();
        let a = heap.intern("hello");
        let b = heap.intern("hello");
        let c = heap.alloc_string("hello");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(heap.get(c).unwrap().to_string_lossy().as_deref(), Some("hello"));
    }

    #[test]
    fn test_null_get() {
        assert!(Heap::new().get(ObjRef::NULL).is_none());
    }
}
