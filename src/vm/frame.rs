use std::ptr;
use std::sync::Arc;

use crate::error::VmError;

use super::context::FrameLink;
use super::heap::ObjRef;
use super::method::CompiledMethod;
use super::opcodes::MintType;
use super::value::{StackValue, store};

/// Work queued by an unwind or `leave` and drained by `endfinally`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Continuation {
    /// Continue normal execution at an offset
    Resume(u32),
    /// Run a finally or fault handler; `base` is the continuation stack
    /// height when its batch was queued
    RunFinally { clause: u16, base: usize },
    /// Enter a catch or filter handler with the exception on the stack
    EnterHandler { clause: u16, exception: ObjRef },
    /// Leave the frame with the exception still in flight
    ExitFrame { exception: ObjRef },
}

/// A handler body currently executing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct ActiveHandler {
    pub clause: u16,
    /// Continuation stack height to restore if an exception escapes it
    pub base: usize,
    /// The caught exception, for catch and filter handlers
    pub exception: Option<ObjRef>,
}

/// Activation record of an interpreted method.
///
/// `mem` holds the argument block, the value-type stack and the locals, in
/// that order, each slot 8-byte aligned. The evaluation stack lives apart in
/// `stack`.
pub(crate) struct Frame<'a> {
    pub link: &'a FrameLink<'a>,
    pub method: Arc<CompiledMethod>,
    pub mem: Box<[u64]>,
    pub stack: Vec<StackValue>,
    pub vt_sp: u32,
    pub ip: usize,
    /// Exception in flight while finally handlers run
    pub ex: Option<ObjRef>,
    pub continuations: Vec<Continuation>,
    pub active: Vec<ActiveHandler>,
    /// Where a value-type result is written
    pub retval: *mut u8,
    pub result: Option<StackValue>,
    /// Frame evaluating a filter expression on behalf of its parent
    pub is_filter: bool,
}

impl<'a> Frame<'a> {
    pub fn new(link: &'a FrameLink<'a>, method: Arc<CompiledMethod>, retval: *mut u8) -> Self {
        let words = method.mem_size().div_ceil(8);
        let stack = Vec::with_capacity(method.max_stack as usize);
        Self {
            link,
            mem: vec![0u64; words].into_boxed_slice(),
            method,
            stack,
            vt_sp: 0,
            ip: 0,
            ex: None,
            continuations: Vec::new(),
            active: Vec::new(),
            retval,
            result: None,
            is_filter: false,
        }
    }

    #[inline]
    pub fn mem_ptr(&mut self) -> *mut u8 {
        self.mem.as_mut_ptr() as *mut u8
    }

    /// Address `offset` bytes into the frame memory.
    #[inline]
    pub fn slot(&mut self, offset: u16) -> *mut u8 {
        debug_assert!((offset as usize) < self.mem.len() * 8);
        // SAFETY: offsets come from the method's own layout.
        unsafe { self.mem_ptr().add(offset as usize) }
    }

    #[inline]
    pub fn local(&mut self, offset: u16) -> *mut u8 {
        let base = self.method.locals_offset as usize;
        // SAFETY: local offsets are relative to the locals area.
        unsafe { self.mem_ptr().add(base + offset as usize) }
    }

    /// Reserve `size` bytes on the value-type stack.
    #[inline]
    pub fn vt_alloc(&mut self, size: u32) -> *mut u8 {
        let at = self.method.vt_offset() + self.vt_sp;
        self.vt_sp += size;
        debug_assert!(self.vt_sp <= self.method.vt_size, "value-type stack overflow");
        // SAFETY: bounded by vt_size, which the transformer computed as the
        // peak of the value-type stack.
        unsafe { self.mem_ptr().add(at as usize) }
    }

    #[inline]
    pub fn vt_free(&mut self, size: u32) {
        debug_assert!(self.vt_sp >= size);
        self.vt_sp -= size;
    }

    #[inline]
    pub fn push(&mut self, value: StackValue) {
        self.stack.push(value);
    }

    #[inline]
    pub fn pop(&mut self) -> Result<StackValue, VmError> {
        match self.stack.pop() {
            Some(v) => Ok(v),
            None => Err(VmError::StackUnderflow {
                method: self.method.name.clone(),
                offset: self.ip,
            }),
        }
    }

    /// Value `depth` slots below the top; 0 is the top.
    #[inline]
    pub fn peek(&self, depth: usize) -> Result<StackValue, VmError> {
        let len = self.stack.len();
        if depth < len {
            Ok(self.stack[len - 1 - depth])
        } else {
            Err(VmError::StackUnderflow {
                method: self.method.name.clone(),
                offset: self.ip,
            })
        }
    }

    #[inline]
    pub fn set_top(&mut self, depth: usize, value: StackValue) {
        let len = self.stack.len();
        self.stack[len - 1 - depth] = value;
    }

    /// Drop the evaluation and value-type stacks.
    pub fn clear_stacks(&mut self) {
        self.stack.clear();
        self.vt_sp = 0;
    }

    /// Store call arguments into the argument block.
    pub fn store_args(&mut self, args: &[StackValue]) {
        let method = Arc::clone(&self.method);
        let base = self.mem_ptr();
        for (slot, &value) in method.args.iter().zip(args) {
            // SAFETY: slots lie inside args_size, which is part of mem.
            unsafe {
                let dst = base.add(slot.offset as usize);
                match slot.mint {
                    MintType::Vt => ptr::copy(value.vt(), dst, slot.size as usize),
                    mint => store(mint, dst, value),
                }
            }
        }
    }

    pub fn outcome(&self) -> Outcome {
        match self.ex {
            Some(ex) => Outcome::Threw(ex),
            None => Outcome::Returned(self.result),
        }
    }
}

/// How a call ended.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Outcome {
    /// Normal return, with the value for non-void, non-value-type results
    Returned(Option<StackValue>),
    Threw(ObjRef),
}
