//! Per-thread interpreter state: the frame chain, the pending exception
//! left by native code, and the interrupt flag.

use std::cell::{Cell, RefCell};
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use super::heap::ObjRef;
use super::method::CompiledMethod;
use super::value::StackValue;

/// Walkable record of one active interpreter frame.
///
/// Links live on the native stack of the interpreter invocation that owns
/// the frame and point at their caller's link. The owner publishes its
/// instruction offset and evaluation stack before any call leaves the frame,
/// so a walker sees a consistent picture of every suspended frame.
pub struct FrameLink<'p> {
    parent: Option<&'p FrameLink<'p>>,
    method: Cell<*const CompiledMethod>,
    ip: Cell<u32>,
    stack: Cell<(*const StackValue, usize)>,
    depth: usize,
}

impl<'p> FrameLink<'p> {
    pub(crate) fn new(parent: Option<&'p FrameLink<'p>>, method: &CompiledMethod) -> Self {
        Self {
            parent,
            method: Cell::new(method),
            ip: Cell::new(0),
            stack: Cell::new((std::ptr::null(), 0)),
            depth: parent.map_or(1, |p| p.depth + 1),
        }
    }

    pub fn parent(&self) -> Option<&'p FrameLink<'p>> {
        self.parent
    }

    pub fn method(&self) -> &CompiledMethod {
        // SAFETY: the owning frame keeps the method alive and updates this
        // pointer before releasing a replaced method.
        unsafe { &*self.method.get() }
    }

    pub fn ip(&self) -> u32 {
        self.ip.get()
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Evaluation stack as published at the last call out of the frame.
    ///
    /// # Safety
    /// Only meaningful while the frame is suspended in a call; the owner
    /// mutates its stack freely while running.
    pub unsafe fn published_stack(&self) -> &[StackValue] {
        let (ptr, len) = self.stack.get();
        if ptr.is_null() {
            &[]
        } else {
            unsafe { std::slice::from_raw_parts(ptr, len) }
        }
    }

    pub(crate) fn set_method(&self, method: &CompiledMethod) {
        self.method.set(method);
    }

    pub(crate) fn publish(&self, ip: usize, stack: &[StackValue]) {
        self.ip.set(ip as u32);
        self.stack.set((stack.as_ptr(), stack.len()));
    }
}

/// Exception recorded when managed code re-entered from native code threw
/// and the native caller has not yet returned to the interpreter.
#[derive(Debug, Clone, Copy)]
pub struct PendingException {
    pub exception: ObjRef,
    /// Depth of the interpreter frame the native code was called from
    pub frame_depth: usize,
    pub ip: u32,
}

/// Sets the interrupt flag of a thread from anywhere.
#[derive(Debug, Clone)]
pub struct InterruptHandle(Arc<AtomicBool>);

impl InterruptHandle {
    pub fn interrupt(&self) {
        self.0.store(true, Ordering::Release);
    }
}

/// Interpreter state of the current OS thread. Created lazily on first use.
pub struct ThreadContext {
    current: Cell<*const FrameLink<'static>>,
    pending: RefCell<Option<PendingException>>,
    interrupt: Arc<AtomicBool>,
    native_calls: Cell<usize>,
    // Not Send: links point into this thread's stack.
    _not_send: PhantomData<*const ()>,
}

thread_local! {
    static CONTEXT: ThreadContext = ThreadContext::new();
}

impl ThreadContext {
    fn new() -> Self {
        Self {
            current: Cell::new(std::ptr::null()),
            pending: RefCell::new(None),
            interrupt: Arc::new(AtomicBool::new(false)),
            native_calls: Cell::new(0),
            _not_send: PhantomData,
        }
    }

    /// Run `f` with the calling thread's context.
    pub fn with<R>(f: impl FnOnce(&ThreadContext) -> R) -> R {
        CONTEXT.with(f)
    }

    /// Innermost registered frame.
    pub fn current(&self) -> Option<&FrameLink<'_>> {
        // SAFETY: a registered link outlives its FrameGuard, which restores
        // the previous pointer before the link is dropped.
        unsafe { (self.current.get() as *const FrameLink<'_>).as_ref() }
    }

    /// Number of interpreter frames on this thread.
    pub fn depth(&self) -> usize {
        self.current().map_or(0, FrameLink::depth)
    }

    pub(crate) fn enter<'c>(&'c self, link: &FrameLink<'_>) -> FrameGuard<'c> {
        let ptr = link as *const FrameLink<'_> as *const FrameLink<'static>;
        FrameGuard {
            ctx: self,
            prev: self.current.replace(ptr),
        }
    }

    /// Visit frames from the innermost outwards.
    pub fn walk(&self, mut f: impl FnMut(&FrameLink<'_>)) {
        let mut link = self.current();
        while let Some(l) = link {
            f(l);
            link = l.parent();
        }
    }

    /// `Class::Method+ip` for each frame, innermost first.
    pub fn stack_trace(&self) -> Vec<String> {
        let mut trace = Vec::new();
        self.walk(|link| trace.push(format!("{}+{:04x}", link.method().name, link.ip())));
        trace
    }

    pub fn interrupt_handle(&self) -> InterruptHandle {
        InterruptHandle(Arc::clone(&self.interrupt))
    }

    /// Consume a pending interrupt request.
    #[inline]
    pub fn take_interrupt(&self) -> bool {
        self.interrupt.load(Ordering::Relaxed) && self.interrupt.swap(false, Ordering::AcqRel)
    }

    pub fn set_pending(&self, pending: PendingException) {
        *self.pending.borrow_mut() = Some(pending);
    }

    pub fn take_pending(&self) -> Option<PendingException> {
        self.pending.borrow_mut().take()
    }

    pub fn in_native(&self) -> bool {
        self.native_calls.get() > 0
    }

    pub(crate) fn native_enter(&self) {
        self.native_calls.set(self.native_calls.get() + 1);
    }

    pub(crate) fn native_leave(&self) {
        self.native_calls.set(self.native_calls.get().saturating_sub(1));
    }
}

/// Unregisters a frame link on drop.
pub(crate) struct FrameGuard<'c> {
    ctx: &'c ThreadContext,
    prev: *const FrameLink<'static>,
}

impl Drop for FrameGuard<'_> {
    fn drop(&mut self) {
        self.ctx.current.set(self.prev);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::method::{CompiledMethod, MethodHandle, RetKind};

    fn method(name: &str) -> CompiledMethod {
        CompiledMethod {
            handle: MethodHandle(0),
            name: name.to_string(),
            code: Box::new([]),
            data_items: Box::new([]),
            clauses: Box::new([]),
            args: Box::new([]),
            args_size: 0,
            vt_size: 0,
            locals_offset: 0,
            locals_size: 0,
            max_stack: 0,
            alloca_size: 0,
            ret: RetKind::Void,
            shapes: Box::new([]),
        }
    }

    #[test]
    fn test_registration_nests_and_unwinds() {
        let (outer_m, inner_m) = (method("A::outer"), method("A::inner"));
        ThreadContext::with(|ctx| {
            assert_eq!(ctx.depth(), 0);
            let outer = FrameLink::new(None, &outer_m);
            let _g1 = ctx.enter(&outer);
            outer.publish(4, &[]);
            {
                let inner = FrameLink::new(Some(&outer), &inner_m);
                let _g2 = ctx.enter(&inner);
                assert_eq!(ctx.depth(), 2);
                assert_eq!(ctx.stack_trace(), vec!["A::inner+0000", "A::outer+0004"]);
            }
            assert_eq!(ctx.depth(), 1);
        });
        ThreadContext::with(|ctx| assert!(ctx.current().is_none()));
    }

    #[test]
    fn test_interrupt_is_consumed_once() {
        ThreadContext::with(|ctx| {
            ctx.interrupt_handle().interrupt();
            assert!(ctx.take_interrupt());
            assert!(!ctx.take_interrupt());
        });
    }
}
