//! Runtime method records and the compiled-method cache they carry.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, PoisonError, RwLock};

use crate::metadata::{ClassId, FieldId, GenericContext, Metadata, MethodId, Signature, TypeDesc};

use super::heap::ObjRef;
use super::opcodes::{MintType, Opcode, instr_len};

/// Index of a [`RuntimeMethod`] in the runtime's method table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MethodHandle(pub u32);

/// Constant referenced by a compiled instruction through its data-item index.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DataItem {
    Method(MethodHandle),
    Class(ClassId),
    Field(FieldId),
    Str(ObjRef),
    Type(TypeDesc),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClauseKind {
    Catch(TypeDesc),
    Filter { filter_start: u32 },
    Finally,
    Fault,
}

/// Exception clause with boundaries translated to internal code offsets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Clause {
    pub kind: ClauseKind,
    pub try_start: u32,
    pub try_end: u32,
    pub handler_start: u32,
    pub handler_end: u32,
}

impl Clause {
    #[inline]
    pub fn try_contains(&self, ip: u32) -> bool {
        self.try_start <= ip && ip < self.try_end
    }

    /// Whether `ip` is in the handler body, or in the filter expression for
    /// filter clauses.
    #[inline]
    pub fn handler_contains(&self, ip: u32) -> bool {
        let start = match self.kind {
            ClauseKind::Filter { filter_start } => filter_start.min(self.handler_start),
            _ => self.handler_start,
        };
        start <= ip && ip < self.handler_end
    }

    pub fn is_finally_like(&self) -> bool {
        matches!(self.kind, ClauseKind::Finally | ClauseKind::Fault)
    }
}

/// Location and storage type of one argument in the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArgSlot {
    pub offset: u32,
    pub mint: MintType,
    /// Slot size in bytes; the copy size for value types
    pub size: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetKind {
    Void,
    Value(MintType),
    Vt(u32),
}

/// Evaluation stack height and value-type stack position the transformer
/// predicts before an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackShape {
    pub height: u16,
    pub vt: u32,
}

/// Output of the transformer for one method instantiation.
#[derive(Debug)]
pub struct CompiledMethod {
    pub handle: MethodHandle,
    pub name: String,
    pub code: Box<[u16]>,
    pub data_items: Box<[DataItem]>,
    pub clauses: Box<[Clause]>,
    pub args: Box<[ArgSlot]>,
    pub args_size: u32,
    /// Bytes reserved for the value-type stack, placed after the arguments
    pub vt_size: u32,
    pub locals_offset: u32,
    pub locals_size: u32,
    pub max_stack: u32,
    /// Frame bytes: arguments, value-type stack, locals and evaluation stack
    pub alloca_size: u32,
    pub ret: RetKind,
    /// Predicted shape per code word; `None` for operand words
    pub shapes: Box<[Option<StackShape>]>,
}

impl CompiledMethod {
    /// Bytes of the frame memory block: arguments, value-type stack, locals.
    pub fn mem_size(&self) -> usize {
        (self.locals_offset + self.locals_size) as usize
    }

    pub fn vt_offset(&self) -> u32 {
        self.args_size
    }

    /// Iterate `(offset, opcode, operand words)` over the code.
    pub fn instructions(&self) -> impl Iterator<Item = (usize, Option<Opcode>, &[u16])> + '_ {
        let mut at = 0;
        std::iter::from_fn(move || {
            if at >= self.code.len() {
                return None;
            }
            let len = instr_len(&self.code, at).min(self.code.len() - at);
            let item = (at, Opcode::from_u16(self.code[at]), &self.code[at + 1..at + len]);
            at += len;
            Some(item)
        })
    }

    pub fn item(&self, index: u16) -> &DataItem {
        &self.data_items[index as usize]
    }
}

/// A method instantiation known to the runtime.
#[derive(Debug)]
pub struct RuntimeMethod {
    pub handle: MethodHandle,
    pub id: MethodId,
    pub ctx: GenericContext,
    pub name: String,
    /// Signature with the instantiation applied
    pub sig: Signature,
    pub args: Box<[ArgSlot]>,
    pub args_size: u32,
    pub ret: RetKind,
    compiled: OnceLock<Arc<CompiledMethod>>,
    native: OnceLock<usize>,
}

impl RuntimeMethod {
    /// Cached compilation result, if any.
    pub fn compiled(&self) -> Option<&Arc<CompiledMethod>> {
        self.compiled.get()
    }

    pub(crate) fn install(&self, method: Arc<CompiledMethod>) {
        // A second install can only come from a racing compile that the
        // runtime lock rules out; the first result wins either way.
        let _ = self.compiled.set(method);
    }

    /// Foreign entry point resolved by an earlier pinvoke, if any.
    pub fn native_address(&self) -> Option<usize> {
        self.native.get().copied()
    }

    /// The cached entry point, or the one `resolve` finds. Failed lookups
    /// are not remembered.
    pub(crate) fn native_or_resolve(&self, resolve: impl FnOnce() -> Option<usize>) -> Option<usize> {
        if let Some(&addr) = self.native.get() {
            return Some(addr);
        }
        let addr = resolve()?;
        Some(*self.native.get_or_init(|| addr))
    }

    pub fn arg_count(&self) -> usize {
        self.args.len()
    }
}

/// Storage type of values of `ty`.
pub fn mint_type(md: &Metadata, ty: &TypeDesc) -> MintType {
    match ty {
        TypeDesc::Bool | TypeDesc::U1 => MintType::U1,
        TypeDesc::I1 => MintType::I1,
        TypeDesc::Char | TypeDesc::U2 => MintType::U2,
        TypeDesc::I2 => MintType::I2,
        TypeDesc::I4 | TypeDesc::U4 => MintType::I4,
        TypeDesc::I8 | TypeDesc::U8 | TypeDesc::I | TypeDesc::U => MintType::I8,
        TypeDesc::R4 => MintType::R4,
        TypeDesc::R8 => MintType::R8,
        TypeDesc::ByRef(_) | TypeDesc::Ptr(_) => MintType::P,
        TypeDesc::Class(c) if md.class(*c).is_value_type => MintType::Vt,
        TypeDesc::Void
        | TypeDesc::String
        | TypeDesc::Object
        | TypeDesc::Class(_)
        | TypeDesc::Array(_)
        | TypeDesc::MVar(_) => MintType::O,
    }
}

pub fn ret_kind(md: &Metadata, ty: &TypeDesc) -> RetKind {
    match ty {
        TypeDesc::Void => RetKind::Void,
        ty => match mint_type(md, ty) {
            MintType::Vt => RetKind::Vt(md.slot_size(ty)),
            mint => RetKind::Value(mint),
        },
    }
}

/// Frame layout of the arguments of `sig`: one 8-byte-aligned slot each,
/// with `this` first. Returns the slots and the total size.
pub fn arg_layout(md: &Metadata, sig: &Signature, owner: ClassId) -> (Vec<ArgSlot>, u32) {
    let mut slots = Vec::with_capacity(sig.arg_count());
    let mut offset = 0;
    if sig.has_this {
        // `this` of a value type method is a managed pointer
        let mint = if md.class(owner).is_value_type {
            MintType::P
        } else {
            MintType::O
        };
        slots.push(ArgSlot {
            offset,
            mint,
            size: 8,
        });
        offset += 8;
    }
    for param in &sig.params {
        let size = md.slot_size(param);
        slots.push(ArgSlot {
            offset,
            mint: mint_type(md, param),
            size,
        });
        offset += size;
    }
    (slots, offset)
}

/// All method instantiations, addressed by [`MethodHandle`].
#[derive(Debug, Default)]
pub struct MethodTable {
    methods: RwLock<Vec<Arc<RuntimeMethod>>>,
    index: RwLock<HashMap<(MethodId, Vec<TypeDesc>), MethodHandle>>,
}

impl MethodTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle for `id` instantiated with `inst`, creating the record on
    /// first use.
    pub fn resolve(&self, md: &Metadata, id: MethodId, inst: &[TypeDesc]) -> MethodHandle {
        let key = (id, inst.to_vec());
        if let Some(&h) = self
            .index
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
        {
            return h;
        }

        let mut index = self.index.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(&h) = index.get(&key) {
            return h;
        }
        let mut methods = self.methods.write().unwrap_or_else(PoisonError::into_inner);
        let handle = MethodHandle(methods.len() as u32);
        let desc = md.method(id);
        let ctx = GenericContext::new(inst.to_vec());
        let sig = desc.sig.inflate(&ctx);
        let (args, args_size) = arg_layout(md, &sig, desc.owner);
        let mut name = md.method_name(id);
        if !inst.is_empty() {
            let names: Vec<_> = inst.iter().map(|t| md.type_name(t)).collect();
            name = format!("{name}<{}>", names.join(", "));
        }
        methods.push(Arc::new(RuntimeMethod {
            handle,
            id,
            ret: ret_kind(md, &sig.ret),
            ctx,
            name,
            sig,
            args: args.into_boxed_slice(),
            args_size,
            compiled: OnceLock::new(),
            native: OnceLock::new(),
        }));
        index.insert(key, handle);
        handle
    }

    pub fn get(&self, handle: MethodHandle) -> Arc<RuntimeMethod> {
        Arc::clone(&self.methods.read().unwrap_or_else(PoisonError::into_inner)[handle.0 as usize])
    }

    pub fn len(&self) -> usize {
        self.methods.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{MetadataBuilder, MethodDef};

    #[test]
    fn test_resolve_is_stable_per_instantiation() {
        let mut b = MetadataBuilder::new();
        let c = b.define_class("Util", None).unwrap();
        let id = b.add_method(c, MethodDef::static_("Id", vec![TypeDesc::MVar(0)], TypeDesc::MVar(0)).generic(1));
        let md = b.finish().unwrap();
        let table = MethodTable::new();
        let a = table.resolve(&md, id, &[TypeDesc::I4]);
        let b2 = table.resolve(&md, id, &[TypeDesc::I4]);
        let c2 = table.resolve(&md, id, &[TypeDesc::R8]);
        assert_eq!(a, b2);
        assert_ne!(a, c2);
        assert_eq!(table.get(a).ret, RetKind::Value(MintType::I4));
        assert_eq!(table.get(c2).ret, RetKind::Value(MintType::R8));
        assert_eq!(table.get(c2).name, "Util::Id<r8>");
    }

    #[test]
    fn test_arg_layout_rounds_value_types() {
        let mut b = MetadataBuilder::new();
        let pair = b.define_value_type("Pair").unwrap();
        b.add_field(pair, "a", TypeDesc::I4, false);
        b.add_field(pair, "b", TypeDesc::I8, false);
        let c = b.define_class("P", None).unwrap();
        let m = b.add_method(
            c,
            MethodDef::instance("F", vec![TypeDesc::Class(pair), TypeDesc::I1], TypeDesc::Void),
        );
        let md = b.finish().unwrap();
        let (slots, size) = arg_layout(&md, &md.method(m).sig, c);
        assert_eq!(slots[0].mint, MintType::O);
        assert_eq!(slots[1].mint, MintType::Vt);
        assert_eq!(slots[1].size, 16);
        assert_eq!(slots[2].offset, 24);
        assert_eq!(size, 32);
    }

    #[test]
    fn test_clause_ranges() {
        let clause = Clause {
            kind: ClauseKind::Filter { filter_start: 10 },
            try_start: 0,
            try_end: 10,
            handler_start: 14,
            handler_end: 20,
        };
        assert!(clause.try_contains(9));
        assert!(!clause.try_contains(10));
        assert!(clause.handler_contains(12));
        assert!(!clause.handler_contains(20));
    }
}
