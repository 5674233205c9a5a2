//! Interpreter threads.
//!
//! Every spawned thread gets its own thread context (frame chain, pending
//! exception, interrupt flag) and shares the runtime: metadata, heap,
//! statics and the compiled-method cache.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, mpsc};
use std::thread::{self, JoinHandle};

use tracing::debug;

use crate::error::VmError;
use crate::metadata::MethodId;

use super::context::{InterruptHandle, ThreadContext};
use super::runtime::Runtime;
use super::value::Value;

static NEXT_THREAD_ID: AtomicUsize = AtomicUsize::new(1);

fn next_thread_id() -> usize {
    NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed)
}

/// A handle to a spawned interpreter thread.
pub struct ThreadHandle {
    pub id: usize,
    interrupt: InterruptHandle,
    handle: Option<JoinHandle<Result<Value, VmError>>>,
}

impl ThreadHandle {
    /// Wait for the thread and return the method's result.
    pub fn join(&mut self) -> Result<Value, VmError> {
        let Some(handle) = self.handle.take() else {
            return Err(VmError::Thread(format!("thread {} already joined", self.id)));
        };
        handle
            .join()
            .map_err(|e| VmError::Thread(format!("thread {} panicked: {e:?}", self.id)))?
    }

    pub fn is_joined(&self) -> bool {
        self.handle.is_none()
    }

    /// Request a `ThreadInterruptedException` at the thread's next safepoint
    /// or call.
    pub fn interrupt(&self) {
        self.interrupt.interrupt();
    }

    pub fn interrupt_handle(&self) -> InterruptHandle {
        self.interrupt.clone()
    }
}

impl Runtime {
    /// Run `method` on a new OS thread with the configured native stack size.
    pub fn spawn(self: &Arc<Self>, method: MethodId, args: Vec<Value>) -> Result<ThreadHandle, VmError> {
        let id = next_thread_id();
        let runtime = Arc::clone(self);
        let (tx, rx) = mpsc::sync_channel(1);
        let name = format!("mintvm-{id}");
        debug!(target: "mintvm::threads", id, method = %self.metadata().method_name(method), "spawn");

        let handle = thread::Builder::new()
            .name(name)
            .stack_size(self.config().native_stack_size)
            .spawn(move || {
                let _ = tx.send(ThreadContext::with(ThreadContext::interrupt_handle));
                let result = runtime.invoke(method, &args);
                debug!(target: "mintvm::threads", id, ok = result.is_ok(), "exit");
                result
            })
            .map_err(|e| VmError::Thread(format!("failed to spawn thread {id}: {e}")))?;

        let interrupt = rx
            .recv()
            .map_err(|_| VmError::Thread(format!("thread {id} exited before starting")))?;
        Ok(ThreadHandle {
            id,
            interrupt,
            handle: Some(handle),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::il::{BinOp, Instr, MethodBody};
    use crate::metadata::{MetadataBuilder, MethodDef, MethodImpl, TypeDesc};

    #[test]
    fn test_spawn_and_join() {
        let mut b = MetadataBuilder::new();
        let class = b.define_class("Worker", None).unwrap();
        let m = b.add_method(class, MethodDef::static_("Square", vec![TypeDesc::I8], TypeDesc::I8));
        b.set_impl(
            m,
            MethodImpl::Il(MethodBody {
                code: vec![Instr::Ldarg(0), Instr::Ldarg(0), Instr::Binary(BinOp::Mul), Instr::Ret],
                ..MethodBody::default()
            }),
        );
        let rt = Arc::new(Runtime::new(b.finish().unwrap()));
        let mut handles: Vec<_> = (1..=4).map(|n| rt.spawn(m, vec![Value::I64(n)]).unwrap()).collect();
        let results: Vec<_> = handles.iter_mut().map(|h| h.join().unwrap()).collect();
        assert_eq!(results, vec![Value::I64(1), Value::I64(4), Value::I64(9), Value::I64(16)]);
        assert!(handles[0].is_joined());
        assert!(matches!(handles[0].join(), Err(VmError::Thread(_))));
        // Compiled once, shared by every thread.
        assert_eq!(rt.compile_count(), 1);
    }
}
