//! The runtime: type system, heap, method table and compiled-method cache,
//! plus the embedding API that enters the interpreter.

use std::collections::HashMap;
use std::fmt;
use std::io::{self, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tracing::debug;

use crate::config::RuntimeConfig;
use crate::error::{CompileError, UnhandledException, VmError};
use crate::ffi::icall::{self, Icall, IcallContext};
use crate::metadata::{EXCEPTION_MESSAGE_FIELD, FieldId, Metadata, MethodId, TypeDesc, WellKnown};

use super::context::ThreadContext;
use super::frame::Outcome;
use super::heap::{GcHooks, Heap, NoGc, ObjRef, RawBuf};
use super::interp::Interp;
use super::method::{ArgSlot, CompiledMethod, MethodHandle, MethodTable, RetKind, RuntimeMethod, mint_type};
use super::opcodes::MintType;
use super::transform::{TransformEnv, transform};
use super::value::{StackValue, Value, load, store};

/// A loaded program ready to run. Shared between interpreter threads.
pub struct Runtime {
    metadata: Arc<Metadata>,
    config: RuntimeConfig,
    heap: Heap,
    methods: MethodTable,
    statics: Box<[RawBuf]>,
    icalls: RwLock<HashMap<String, Icall>>,
    natives: RwLock<HashMap<String, usize>>,
    gc: Box<dyn GcHooks>,
    compile_lock: Mutex<()>,
    compile_count: AtomicUsize,
    output: Mutex<Box<dyn Write + Send>>,
    message_offset: Option<u32>,
}

impl Runtime {
    pub fn new(metadata: impl Into<Arc<Metadata>>) -> Self {
        Self::with_config(metadata, RuntimeConfig::default())
    }

    pub fn with_config(metadata: impl Into<Arc<Metadata>>, config: RuntimeConfig) -> Self {
        let metadata = metadata.into();
        let statics = (0..metadata.class_count())
            .map(|c| RawBuf::zeroed(metadata.class(crate::metadata::ClassId(c as u32)).static_size as usize))
            .collect();
        let message_offset = metadata
            .find_field(&format!("System.Exception::{EXCEPTION_MESSAGE_FIELD}"))
            .map(|f| metadata.field(f).offset);
        let icalls = icall::builtins()
            .into_iter()
            .map(|(name, f)| (name.to_string(), f))
            .collect();
        Self {
            metadata,
            config,
            heap: Heap::new(),
            methods: MethodTable::new(),
            statics,
            icalls: RwLock::new(icalls),
            natives: RwLock::new(HashMap::new()),
            gc: Box::new(NoGc),
            compile_lock: Mutex::new(()),
            compile_count: AtomicUsize::new(0),
            output: Mutex::new(Box::new(io::stdout())),
            message_offset,
        }
    }

    /// Install collector hooks.
    pub fn with_gc(mut self, gc: impl GcHooks + 'static) -> Self {
        self.gc = Box::new(gc);
        self
    }

    /// Redirect `System.Console` output.
    pub fn with_output(self, output: impl Write + Send + 'static) -> Self {
        *self.output.lock().unwrap_or_else(PoisonError::into_inner) = Box::new(output);
        self
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn methods(&self) -> &MethodTable {
        &self.methods
    }

    pub fn gc(&self) -> &dyn GcHooks {
        &*self.gc
    }

    // =========================================================================
    // Compiled-method cache
    // =========================================================================

    /// The compiled record of `method`, transforming it on first use.
    ///
    /// Compilation runs under a global lock and re-checks the cache after
    /// acquiring it, so concurrent first callers wait for one transform and
    /// all observe the same record.
    pub fn compiled(&self, method: &RuntimeMethod) -> Result<Arc<CompiledMethod>, CompileError> {
        if let Some(compiled) = method.compiled() {
            return Ok(Arc::clone(compiled));
        }
        let _guard = self.compile_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(compiled) = method.compiled() {
            return Ok(Arc::clone(compiled));
        }
        let env = TransformEnv {
            metadata: &self.metadata,
            methods: &self.methods,
            heap: &self.heap,
            config: &self.config,
        };
        let compiled = Arc::new(transform(&env, method)?);
        method.install(Arc::clone(&compiled));
        self.compile_count.fetch_add(1, Ordering::Relaxed);
        Ok(compiled)
    }

    /// Compile `method` (non-generic instantiation) without running it.
    pub fn compiled_method(&self, method: MethodId) -> Result<Arc<CompiledMethod>, CompileError> {
        let handle = self.methods.resolve(&self.metadata, method, &[]);
        self.compiled(&self.methods.get(handle))
    }

    /// Number of transforms performed so far.
    pub fn compile_count(&self) -> usize {
        self.compile_count.load(Ordering::Relaxed)
    }

    // =========================================================================
    // Entering the interpreter
    // =========================================================================

    /// Run `method` on the calling thread.
    pub fn invoke(&self, method: MethodId, args: &[Value]) -> Result<Value, VmError> {
        let handle = self.methods.resolve(&self.metadata, method, &[]);
        self.invoke_handle(handle, args)
    }

    /// Run a method looked up by `Class::name` spec.
    pub fn invoke_named(&self, spec: &str, args: &[Value]) -> Result<Value, VmError> {
        let method = self
            .metadata
            .find_method(spec)
            .ok_or_else(|| VmError::NoSuchMethod(spec.to_string()))?;
        self.invoke(method, args)
    }

    pub fn invoke_handle(&self, handle: MethodHandle, args: &[Value]) -> Result<Value, VmError> {
        let method = self.methods.get(handle);
        if args.len() != method.arg_count() {
            return Err(VmError::ArgumentMismatch {
                method: method.name.clone(),
                reason: format!("expected {} arguments, got {}", method.arg_count(), args.len()),
            });
        }
        // Value-type arguments need 8-aligned storage that outlives the call.
        let mut buffers: Vec<Box<[u64]>> = Vec::new();
        let mut slots = Vec::with_capacity(args.len());
        for (value, slot) in args.iter().zip(method.args.iter()) {
            slots.push(to_stack(&method, value, slot, &mut buffers)?);
        }
        let mut retbuf = match method.ret {
            RetKind::Vt(size) => vec![0u64; (size as usize).div_ceil(8)].into_boxed_slice(),
            _ => Box::default(),
        };
        let outcome = self.invoke_raw(handle, &slots, retbuf.as_mut_ptr() as *mut u8)?;
        match outcome {
            Outcome::Returned(value) => Ok(from_stack(method.ret, value, &retbuf)),
            Outcome::Threw(ex) => Err(VmError::Unhandled(self.describe_exception(ex))),
        }
    }

    /// Run `handle` on this thread beneath whatever frame is current, so
    /// native code re-entering the interpreter extends the same chain.
    pub(crate) fn invoke_raw(
        &self,
        handle: MethodHandle,
        args: &[StackValue],
        retbuf: *mut u8,
    ) -> Result<Outcome, VmError> {
        ThreadContext::with(|ctx| {
            let interp = Interp::new(self, ctx);
            interp.invoke(handle, args, retbuf, ctx.current())
        })
    }

    /// Innermost-first `Class::Method+ip` trace of the calling thread.
    pub fn stack_trace(&self) -> Vec<String> {
        ThreadContext::with(ThreadContext::stack_trace)
    }

    // =========================================================================
    // Objects and exceptions
    // =========================================================================

    pub fn string(&self, text: &str) -> ObjRef {
        self.heap.alloc_string(text)
    }

    pub fn read_string(&self, r: ObjRef) -> Option<String> {
        self.heap.get(r)?.to_string_lossy()
    }

    /// Allocate an exception of a well-known class carrying `message`. The
    /// constructor is not run.
    pub fn new_exception(&self, which: WellKnown, message: &str) -> ObjRef {
        let class = which.id();
        let obj = self.heap.alloc_instance(class, self.metadata.class(class).instance_size);
        if let (Some(offset), Some(object)) = (self.message_offset, self.heap.get(obj)) {
            let text = self.heap.alloc_string(message);
            // SAFETY: the message field lies inside every exception instance.
            unsafe { store(MintType::O, object.data().add(offset as usize), StackValue::Ref(text)) };
        }
        obj
    }

    pub fn exception_message(&self, ex: ObjRef) -> Option<String> {
        let offset = self.message_offset?;
        let object = self.heap.get(ex)?;
        if !self.metadata.is_subclass_of(object.class(), WellKnown::Exception.id()) {
            return None;
        }
        // SAFETY: checked above that the object is an exception.
        let message = unsafe { load(MintType::O, object.data().add(offset as usize)) };
        self.read_string(message.obj())
    }

    pub(crate) fn class_name_of(&self, r: ObjRef) -> String {
        match self.heap.get(r) {
            Some(object) => self.metadata.class(object.class()).name.clone(),
            None => "null".to_string(),
        }
    }

    pub fn describe_exception(&self, ex: ObjRef) -> UnhandledException {
        UnhandledException {
            object: ex,
            class: self.class_name_of(ex),
            message: self.exception_message(ex),
        }
    }

    /// Whether the non-null object `r` is an instance of `ty`.
    pub fn is_instance(&self, r: ObjRef, ty: &TypeDesc) -> bool {
        let Some(object) = self.heap.get(r) else {
            return false;
        };
        match (ty, object.array_elem()) {
            (TypeDesc::Array(want), Some(have)) => {
                **want == *have
                    || (mint_type(&self.metadata, want) == MintType::O
                        && mint_type(&self.metadata, have) == MintType::O
                        && self.reference_type_assignable(have, want))
            }
            (TypeDesc::Array(_), None) => false,
            _ => self.metadata.class_is_assignable(object.class(), ty),
        }
    }

    /// Array covariance over reference element types.
    fn reference_type_assignable(&self, from: &TypeDesc, to: &TypeDesc) -> bool {
        match (from, to) {
            (_, TypeDesc::Object) => true,
            (TypeDesc::Class(a), TypeDesc::Class(b)) => self.metadata.is_subclass_of(*a, *b),
            (TypeDesc::Array(a), TypeDesc::Array(b)) => self.reference_type_assignable(a, b),
            (a, b) => a == b,
        }
    }

    // =========================================================================
    // Statics
    // =========================================================================

    pub(crate) fn static_addr(&self, field: FieldId) -> *mut u8 {
        let desc = self.metadata.field(field);
        // SAFETY: static offsets were laid out inside the owner's block.
        unsafe { self.statics[desc.owner.0 as usize].as_ptr().add(desc.offset as usize) }
    }

    pub fn static_value(&self, field: FieldId) -> Value {
        let ty = &self.metadata.field(field).ty;
        let addr = self.static_addr(field);
        match mint_type(&self.metadata, ty) {
            MintType::Vt => {
                let size = self.metadata.size_of(ty) as usize;
                // SAFETY: the block holds `size` bytes at this offset.
                Value::Struct(unsafe { std::slice::from_raw_parts(addr, size) }.into())
            }
            // SAFETY: as above for scalar slots.
            mint => value_of(mint, unsafe { load(mint, addr) }),
        }
    }

    pub fn set_static(&self, field: FieldId, value: &Value) -> Result<(), VmError> {
        let desc = self.metadata.field(field);
        let addr = self.static_addr(field);
        let mint = mint_type(&self.metadata, &desc.ty);
        let slot = match (mint, value) {
            (MintType::Vt, Value::Struct(bytes)) if bytes.len() == self.metadata.size_of(&desc.ty) as usize => {
                // SAFETY: sizes checked above.
                unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), addr, bytes.len()) };
                return Ok(());
            }
            (mint, value) => scalar(mint, value).ok_or_else(|| VmError::ArgumentMismatch {
                method: desc.name.clone(),
                reason: format!("cannot store {value:?} in a {mint:?} static"),
            })?,
        };
        // SAFETY: scalar slot inside the static block.
        unsafe { store(mint, addr, slot) };
        if mint == MintType::O {
            self.gc.write_barrier(addr, slot.obj());
        }
        Ok(())
    }

    // =========================================================================
    // Host functions
    // =========================================================================

    /// Register the implementation of an `internalcall` method.
    pub fn register_icall<F>(&self, name: &str, f: F)
    where
        F: Fn(&IcallContext<'_>, &[StackValue]) -> Result<Option<StackValue>, ObjRef> + Send + Sync + 'static,
    {
        debug!(target: "mintvm::runtime", name, "icall registered");
        self.icalls
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), Arc::new(f));
    }

    pub(crate) fn icall(&self, name: &str) -> Option<Icall> {
        self.icalls
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Resolve a pinvoke symbol to `address` before any library lookup.
    pub fn register_native(&self, symbol: &str, address: usize) {
        self.natives
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(symbol.to_string(), address);
    }

    pub(crate) fn native(&self, symbol: &str) -> Option<usize> {
        self.natives
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(symbol)
            .copied()
    }

    /// Write to the console stream.
    pub(crate) fn console(&self, text: &str, newline: bool) -> io::Result<()> {
        let mut out = self.output.lock().unwrap_or_else(PoisonError::into_inner);
        out.write_all(text.as_bytes())?;
        if newline {
            out.write_all(b"\n")?;
        }
        out.flush()
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("classes", &self.metadata.class_count())
            .field("methods", &self.methods.len())
            .field("compiled", &self.compile_count())
            .field("heap", &self.heap)
            .finish()
    }
}

// =============================================================================
// Value <-> StackValue
// =============================================================================

fn scalar(mint: MintType, value: &Value) -> Option<StackValue> {
    Some(match mint {
        MintType::I1 | MintType::U1 | MintType::I2 | MintType::U2 | MintType::I4 => {
            StackValue::I32(value.as_i32()?)
        }
        MintType::I8 => StackValue::I64(value.as_i64()?),
        MintType::P => StackValue::Ptr(value.as_i64()? as usize as *mut u8),
        MintType::R4 | MintType::R8 => StackValue::F64(value.as_f64()?),
        MintType::O => match value {
            Value::Ref(r) => StackValue::Ref(*r),
            Value::Void => StackValue::NULL,
            _ => return None,
        },
        MintType::Vt => return None,
    })
}

fn to_stack(
    method: &RuntimeMethod,
    value: &Value,
    slot: &ArgSlot,
    buffers: &mut Vec<Box<[u64]>>,
) -> Result<StackValue, VmError> {
    let mismatch = || VmError::ArgumentMismatch {
        method: method.name.clone(),
        reason: format!("{value:?} does not fit a {:?} argument", slot.mint),
    };
    if slot.mint != MintType::Vt {
        return scalar(slot.mint, value).ok_or_else(mismatch);
    }
    let Value::Struct(bytes) = value else {
        return Err(mismatch());
    };
    if bytes.len() > slot.size as usize {
        return Err(mismatch());
    }
    let mut buf = vec![0u64; (slot.size as usize).div_ceil(8)].into_boxed_slice();
    // SAFETY: buf holds at least slot.size >= bytes.len() bytes.
    unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), buf.as_mut_ptr() as *mut u8, bytes.len()) };
    let p = buf.as_mut_ptr() as *mut u8;
    buffers.push(buf);
    Ok(StackValue::Vt(p))
}

fn value_of(mint: MintType, v: StackValue) -> Value {
    match mint {
        MintType::I8 | MintType::P => Value::I64(v.i64()),
        MintType::R4 | MintType::R8 => Value::F64(v.f64()),
        MintType::O => Value::Ref(v.obj()),
        _ => Value::I32(v.i32()),
    }
}

fn from_stack(ret: RetKind, value: Option<StackValue>, retbuf: &[u64]) -> Value {
    match (ret, value) {
        (RetKind::Value(mint), Some(v)) => value_of(mint, v),
        (RetKind::Vt(size), _) => {
            // SAFETY: retbuf was sized for the result.
            let bytes = unsafe { std::slice::from_raw_parts(retbuf.as_ptr() as *const u8, size as usize) };
            Value::Struct(bytes.into())
        }
        _ => Value::Void,
    }
}
