//! The execution engine: transformer, interpreter and the runtime state they
//! share.

pub mod context;
pub mod convert;
pub mod dump;
pub mod frame;
pub mod heap;
pub(crate) mod interp;
pub mod method;
pub mod opcodes;
pub mod runtime;
pub mod threads;
pub mod transform;
pub mod value;

pub use context::{FrameLink, InterruptHandle, PendingException, ThreadContext};
pub use frame::Outcome;
pub use heap::{GcHooks, Heap, NoGc, ObjRef, Object};
pub use method::{CompiledMethod, MethodHandle, MethodTable, RetKind, RuntimeMethod};
pub use opcodes::{MintType, Opcode};
pub use runtime::Runtime;
pub use threads::ThreadHandle;
pub use value::{StackValue, Value};
