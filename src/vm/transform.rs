//! Lowers verified source bytecode into the internal 16-bit encoding.
//!
//! One linear pass over the body simulates the evaluation stack to pick a
//! type-specialized opcode for every instruction. Backward branches are
//! resolved on the spot; forward branches are recorded per target and
//! patched when emission reaches it. Each emitted opcode also records the
//! stack shape the interpreter must observe there.

use std::collections::HashMap;
use std::fmt::Write as _;

use tracing::{debug, trace};

use crate::config::RuntimeConfig;
use crate::error::CompileError;
use crate::il::{self, BinOp, CmpOp, Cond, ConvTarget, Instr, MethodBody, MethodRef, UnOp};
use crate::metadata::{ClassId, Metadata, MethodImpl, TypeDesc, WellKnown};

use super::dump;
use super::heap::Heap;
use super::method::{
    ArgSlot, Clause, ClauseKind, CompiledMethod, DataItem, MethodHandle, MethodTable, RetKind,
    RuntimeMethod, StackShape, mint_type,
};
use super::opcodes::{MintType, Opcode, push_u32, push_u64};

/// Services the transformer resolves tokens through.
pub struct TransformEnv<'a> {
    pub metadata: &'a Metadata,
    pub methods: &'a MethodTable,
    pub heap: &'a Heap,
    pub config: &'a RuntimeConfig,
}

/// Static type of an evaluation-stack slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StackType {
    I4,
    I8,
    R8,
    O,
    /// Managed pointer
    Mp,
    /// Value type of the given slot size
    Vt(u32),
}

impl StackType {
    fn vt_size(self) -> u32 {
        match self {
            StackType::Vt(size) => size,
            _ => 0,
        }
    }

    fn is_int(self) -> bool {
        matches!(self, StackType::I4 | StackType::I8 | StackType::Mp)
    }

    fn name(self) -> String {
        match self {
            StackType::I4 => "i4".into(),
            StackType::I8 => "i8".into(),
            StackType::R8 => "r8".into(),
            StackType::O => "o".into(),
            StackType::Mp => "&".into(),
            StackType::Vt(size) => format!("vt{size}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Slot {
    ty: StackType,
    class: Option<ClassId>,
}

impl Slot {
    fn of(ty: StackType) -> Slot {
        Slot { ty, class: None }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Num {
    I4,
    I8,
    R8,
}

/// Unresolved forward branch operand.
#[derive(Debug, Clone, Copy)]
struct Fixup {
    /// Start of the branch instruction the delta is relative to
    at: usize,
    /// Word index of the operand
    operand: usize,
    short: bool,
}

/// Compile `method` to its internal form.
pub fn transform(env: &TransformEnv<'_>, method: &RuntimeMethod) -> Result<CompiledMethod, CompileError> {
    let desc = env.metadata.method(method.id);
    let body = match &desc.imp {
        MethodImpl::Il(body) if !body.code.is_empty() => body,
        _ => {
            return Err(CompileError::EmptyBody {
                method: method.name.clone(),
            });
        }
    };

    let mut t = Transformer::new(env, method, body)?;
    t.prescan()?;
    t.prologue();
    for (i, instr) in body.code.iter().enumerate() {
        t.visit(i, instr)?;
    }
    let compiled = t.finish()?;

    debug!(
        target: "mintvm::transform",
        method = %compiled.name,
        words = compiled.code.len(),
        items = compiled.data_items.len(),
        frame = compiled.alloca_size,
        "compiled"
    );
    if env.config.trace_transform {
        trace!(
            target: "mintvm::transform",
            "\n{}",
            dump::disassemble(&compiled, env.metadata, env.methods, env.heap)
        );
    }
    Ok(compiled)
}

struct Transformer<'a> {
    env: &'a TransformEnv<'a>,
    md: &'a Metadata,
    rm: &'a RuntimeMethod,
    body: &'a MethodBody,

    code: Vec<u16>,
    shapes: Vec<Option<StackShape>>,
    items: Vec<DataItem>,
    item_index: HashMap<DataItem, u16>,

    stack: Vec<Slot>,
    vt: u32,
    max_vt: u32,
    max_height: usize,
    reachable: bool,

    locals: Vec<ArgSlot>,
    locals_size: u32,

    /// Internal offset of each source instruction, plus the end
    in_offsets: Vec<u32>,
    block_start: Vec<bool>,
    joins: Vec<Option<Vec<Slot>>>,
    fixups: HashMap<usize, Vec<Fixup>>,
    short_forward: bool,
    /// Source instruction being lowered
    offset: usize,
}

impl<'a> Transformer<'a> {
    fn new(env: &'a TransformEnv<'a>, rm: &'a RuntimeMethod, body: &'a MethodBody) -> Result<Self, CompileError> {
        let md = env.metadata;
        let mut locals = Vec::with_capacity(body.locals.len());
        let mut locals_size = 0u32;
        for ty in &body.locals {
            let ty = ty.inflate(&rm.ctx);
            let size = md.slot_size(&ty);
            locals.push(ArgSlot {
                offset: locals_size,
                mint: mint_type(md, &ty),
                size,
            });
            locals_size += size;
        }
        if locals_size > u16::MAX as u32 || rm.args_size > u16::MAX as u32 {
            return Err(CompileError::FrameTooLarge {
                method: rm.name.clone(),
            });
        }

        // Forward branch deltas are fixed before the target is known, so the
        // short form is only used when the whole method surely fits.
        let estimate: usize = body.code.iter().map(|instr| estimated_words(md, instr)).sum();
        let short_forward = env.config.short_branches && estimate <= i16::MAX as usize;

        let len = body.code.len();
        Ok(Self {
            env,
            md,
            rm,
            body,
            code: Vec::with_capacity(estimate.min(1 << 16)),
            shapes: Vec::with_capacity(estimate.min(1 << 16)),
            items: Vec::new(),
            item_index: HashMap::new(),
            stack: Vec::new(),
            vt: 0,
            max_vt: 0,
            max_height: 0,
            reachable: true,
            locals,
            locals_size,
            in_offsets: vec![0; len + 1],
            block_start: vec![false; len],
            joins: vec![None; len],
            fixups: HashMap::new(),
            short_forward,
            offset: 0,
        })
    }

    fn name(&self) -> String {
        self.rm.name.clone()
    }

    // =========================================================================
    // Pre-scan: block starts and handler entry shapes
    // =========================================================================

    fn prescan(&mut self) -> Result<(), CompileError> {
        let body = self.body;
        let len = body.code.len();
        for (i, instr) in body.code.iter().enumerate() {
            for &target in instr.targets() {
                if target >= len {
                    return Err(CompileError::InvalidBranchTarget {
                        method: self.name(),
                        offset: i,
                        target,
                    });
                }
                self.block_start[target] = true;
            }
        }

        for (index, clause) in body.clauses.iter().enumerate() {
            let name = self.rm.name.clone();
            let bad = || CompileError::InvalidClause { method: name, index };
            if clause.try_start >= clause.try_end
                || clause.try_end > len
                || clause.handler_start >= clause.handler_end
                || clause.handler_end > len
            {
                return Err(bad());
            }
            let exception = Slot {
                ty: StackType::O,
                class: Some(match &clause.kind {
                    il::ClauseKind::Catch(TypeDesc::Class(c)) => *c,
                    _ => WellKnown::Exception.id(),
                }),
            };
            let entry = match clause.kind {
                il::ClauseKind::Catch(_) => vec![exception.clone()],
                il::ClauseKind::Filter { filter_start } => {
                    if filter_start >= clause.handler_start {
                        return Err(bad());
                    }
                    self.preset_join(filter_start, vec![exception.clone()])?;
                    vec![exception]
                }
                il::ClauseKind::Finally | il::ClauseKind::Fault => Vec::new(),
            };
            self.preset_join(clause.try_start, Vec::new())?;
            self.preset_join(clause.handler_start, entry)?;
            for end in [clause.try_end, clause.handler_end] {
                if end < len {
                    self.block_start[end] = true;
                }
            }
        }
        Ok(())
    }

    fn preset_join(&mut self, at: usize, state: Vec<Slot>) -> Result<(), CompileError> {
        self.block_start[at] = true;
        match &self.joins[at] {
            Some(existing) if !same_types(existing, &state) => Err(CompileError::StackShapeMismatch {
                method: self.name(),
                offset: at,
                expected: describe(existing),
                found: describe(&state),
            }),
            _ => {
                self.joins[at] = Some(state);
                Ok(())
            }
        }
    }

    fn prologue(&mut self) {
        if self.body.init_locals && self.locals_size > 0 {
            self.emit(Opcode::InitLocals);
            self.raw(0);
            self.raw(self.locals_size as u16);
        }
    }

    // =========================================================================
    // Emission primitives
    // =========================================================================

    /// Emit an opcode word, recording the current shape as its expected one.
    fn emit(&mut self, op: Opcode) -> usize {
        let at = self.code.len();
        self.code.push(op as u16);
        self.shapes.push(Some(StackShape {
            height: self.stack.len() as u16,
            vt: self.vt,
        }));
        at
    }

    fn raw(&mut self, word: u16) {
        self.code.push(word);
        self.shapes.push(None);
    }

    fn raw_u32(&mut self, value: u32) {
        push_u32(&mut self.code, value);
        self.shapes.extend([None, None]);
    }

    fn raw_u64(&mut self, value: u64) {
        push_u64(&mut self.code, value);
        self.shapes.extend([None; 4]);
    }

    fn item(&mut self, item: DataItem) -> Result<u16, CompileError> {
        if let Some(&index) = self.item_index.get(&item) {
            return Ok(index);
        }
        if self.items.len() > u16::MAX as usize {
            return Err(CompileError::TooManyDataItems { method: self.name() });
        }
        let index = self.items.len() as u16;
        self.items.push(item.clone());
        self.item_index.insert(item, index);
        Ok(index)
    }

    fn size_operand(&self, size: u32) -> Result<u16, CompileError> {
        u16::try_from(size).map_err(|_| CompileError::FrameTooLarge { method: self.name() })
    }

    // =========================================================================
    // Simulated stack
    // =========================================================================

    fn need(&self, n: usize) -> Result<(), CompileError> {
        if self.stack.len() < n {
            return Err(CompileError::StackUnderflow {
                method: self.name(),
                offset: self.offset,
                needed: n,
                height: self.stack.len(),
            });
        }
        Ok(())
    }

    fn peek(&self, depth: usize) -> Result<Slot, CompileError> {
        self.need(depth + 1)?;
        Ok(self.stack[self.stack.len() - 1 - depth].clone())
    }

    fn push(&mut self, slot: Slot) {
        self.vt += slot.ty.vt_size();
        self.max_vt = self.max_vt.max(self.vt);
        self.stack.push(slot);
        self.max_height = self.max_height.max(self.stack.len());
    }

    fn push_ty(&mut self, ty: StackType) {
        self.push(Slot::of(ty));
    }

    /// Pop slots whose value-type bytes the instruction releases.
    fn pop_release(&mut self, n: usize) {
        for _ in 0..n {
            if let Some(slot) = self.stack.pop() {
                self.vt -= slot.ty.vt_size();
            }
        }
    }

    /// Pop slots whose value-type bytes stay reserved until a `vtresult`.
    fn pop_keep(&mut self, n: usize) -> u32 {
        let start = self.stack.len() - n;
        let vt: u32 = self.stack[start..].iter().map(|s| s.ty.vt_size()).sum();
        self.stack.truncate(start);
        vt
    }

    fn set_top(&mut self, depth: usize, ty: StackType) {
        let len = self.stack.len();
        self.stack[len - 1 - depth] = Slot::of(ty);
    }

    fn stack_type(&self, ty: &TypeDesc) -> StackType {
        match mint_type(self.md, ty) {
            MintType::I1 | MintType::U1 | MintType::I2 | MintType::U2 | MintType::I4 => StackType::I4,
            MintType::I8 => StackType::I8,
            MintType::R4 | MintType::R8 => StackType::R8,
            MintType::O => StackType::O,
            MintType::P => StackType::Mp,
            MintType::Vt => StackType::Vt(self.md.slot_size(ty)),
        }
    }

    fn slot_of(&self, ty: &TypeDesc) -> Slot {
        Slot {
            ty: self.stack_type(ty),
            class: match ty {
                TypeDesc::Class(c) => Some(*c),
                TypeDesc::String => Some(WellKnown::String.id()),
                _ => None,
            },
        }
    }

    fn mismatch(&self, instr: &Instr, depth: usize) -> CompileError {
        let start = self.stack.len().saturating_sub(depth);
        CompileError::TypeMismatch {
            method: self.name(),
            offset: self.offset,
            instr: instr.mnemonic().to_string(),
            types: self.stack[start..]
                .iter()
                .map(|s| s.ty.name())
                .collect::<Vec<_>>()
                .join(", "),
        }
    }

    // =========================================================================
    // Blocks and branches
    // =========================================================================

    fn visit(&mut self, i: usize, instr: &Instr) -> Result<(), CompileError> {
        self.offset = i;
        if self.block_start[i] {
            self.patch_fixups(i)?;
            if self.reachable {
                self.join(i)?;
            } else {
                // Only reachable through branches: take their shape, or an
                // empty stack when the only way in is a later backward branch.
                let state = self.joins[i].clone().unwrap_or_default();
                self.stack.clear();
                self.vt = 0;
                for slot in state.iter().cloned() {
                    self.push(slot);
                }
                self.joins[i] = Some(state);
                self.reachable = true;
            }
        } else if !self.reachable {
            self.in_offsets[i] = self.code.len() as u32;
            return Ok(());
        }
        self.in_offsets[i] = self.code.len() as u32;
        self.lower(i, instr)
    }

    /// Reconcile the current stack with the recorded shape at `target`.
    fn join(&mut self, target: usize) -> Result<(), CompileError> {
        match &self.joins[target] {
            Some(expected) => {
                if !same_types(expected, &self.stack) {
                    return Err(CompileError::StackShapeMismatch {
                        method: self.name(),
                        offset: target,
                        expected: describe(expected),
                        found: describe(&self.stack),
                    });
                }
                let expected_vt: u32 = expected.iter().map(|s| s.ty.vt_size()).sum();
                if expected_vt != self.vt {
                    return Err(CompileError::VtStackMismatch {
                        method: self.name(),
                        offset: target,
                        expected: expected_vt,
                        found: self.vt,
                    });
                }
            }
            None => self.joins[target] = Some(self.stack.clone()),
        }
        Ok(())
    }

    fn patch_fixups(&mut self, target: usize) -> Result<(), CompileError> {
        let here = self.code.len() as i64;
        for fixup in self.fixups.remove(&target).unwrap_or_default() {
            let delta = here - fixup.at as i64;
            if fixup.short {
                let delta = i16::try_from(delta).map_err(|_| CompileError::BranchOutOfRange {
                    method: self.name(),
                    offset: target,
                })?;
                self.code[fixup.operand] = delta as u16;
            } else {
                let delta = delta as i32 as u32;
                self.code[fixup.operand] = delta as u16;
                self.code[fixup.operand + 1] = (delta >> 16) as u16;
            }
        }
        Ok(())
    }

    /// Emit a branch that pops `pops` operands first.
    fn branch(&mut self, long: Opcode, short: Opcode, target: usize, pops: usize) -> Result<(), CompileError> {
        self.need(pops)?;
        self.branch_settling(long, short, target, Some(pops))
    }

    /// Emit a branch recorded with the current stack shape; the target sees
    /// the stack after popping `pops` operands, or an empty one for `None`.
    fn branch_settling(
        &mut self,
        long: Opcode,
        short: Opcode,
        target: usize,
        pops: Option<usize>,
    ) -> Result<(), CompileError> {
        if target <= self.offset {
            let dest = self.in_offsets[target] as i64;
            self.emit(Opcode::Safepoint);
            let at = self.code.len() as i64;
            let delta = dest - at;
            let use_short = self.env.config.short_branches && i16::try_from(delta).is_ok();
            self.emit(if use_short { short } else { long });
            self.settle(pops);
            self.join(target)?;
            if use_short {
                self.raw(delta as i16 as u16);
            } else {
                self.raw_u32(delta as i32 as u32);
            }
        } else {
            let short_form = self.short_forward;
            let at = self.emit(if short_form { short } else { long });
            self.settle(pops);
            self.join(target)?;
            let operand = self.code.len();
            if short_form {
                self.raw(0);
            } else {
                self.raw_u32(0);
            }
            self.fixups.entry(target).or_default().push(Fixup {
                at,
                operand,
                short: short_form,
            });
        }
        Ok(())
    }

    fn settle(&mut self, pops: Option<usize>) {
        match pops {
            Some(n) => self.pop_release(n),
            None => {
                self.stack.clear();
                self.vt = 0;
            }
        }
    }

    /// Backward branch to the first internal instruction.
    fn branch_to_start(&mut self) {
        self.emit(Opcode::Safepoint);
        let delta = -(self.code.len() as i64);
        if self.env.config.short_branches && i16::try_from(delta).is_ok() {
            self.emit(Opcode::BrS);
            self.raw(delta as i16 as u16);
        } else {
            self.emit(Opcode::Br);
            self.raw_u32(delta as i32 as u32);
        }
    }

    fn in_protected_region(&self, i: usize) -> bool {
        self.body.clauses.iter().any(|c| {
            let handler_start = match c.kind {
                il::ClauseKind::Filter { filter_start } => filter_start,
                _ => c.handler_start,
            };
            (c.try_start..c.try_end).contains(&i) || (handler_start..c.handler_end).contains(&i)
        })
    }

    // =========================================================================
    // Instruction lowering
    // =========================================================================

    fn lower(&mut self, i: usize, instr: &Instr) -> Result<(), CompileError> {
        match instr {
            Instr::Nop => {}
            Instr::Break => {
                self.emit(Opcode::Break);
            }

            Instr::Ldarg(n) => {
                let slot = self.arg(*n)?;
                self.load_slot(slot, Opcode::LdargI1, Opcode::LdargVt)?;
            }
            Instr::Starg(n) => {
                let slot = self.arg(*n)?;
                self.store_slot(slot, Opcode::StargI1, Opcode::StargVt)?;
            }
            Instr::Ldarga(n) => {
                let slot = self.arg(*n)?;
                self.emit(Opcode::Ldarga);
                self.raw(slot.offset as u16);
                self.push_ty(StackType::Mp);
            }
            Instr::Ldloc(n) => {
                let slot = self.local(*n)?;
                self.load_slot(slot, Opcode::LdlocI1, Opcode::LdlocVt)?;
            }
            Instr::Stloc(n) => {
                let slot = self.local(*n)?;
                self.store_slot(slot, Opcode::StlocI1, Opcode::StlocVt)?;
            }
            Instr::Ldloca(n) => {
                let slot = self.local(*n)?;
                self.emit(Opcode::Ldloca);
                self.raw(slot.offset as u16);
                self.push_ty(StackType::Mp);
            }

            Instr::Ldnull => {
                self.emit(Opcode::Ldnull);
                self.push_ty(StackType::O);
            }
            Instr::LdcI4(v) => {
                match *v {
                    -1 => {
                        self.emit(Opcode::LdcI4M1);
                    }
                    0 => {
                        self.emit(Opcode::LdcI40);
                    }
                    1 => {
                        self.emit(Opcode::LdcI41);
                    }
                    v if i16::try_from(v).is_ok() => {
                        self.emit(Opcode::LdcI4S);
                        self.raw(v as i16 as u16);
                    }
                    v => {
                        self.emit(Opcode::LdcI4);
                        self.raw_u32(v as u32);
                    }
                }
                self.push_ty(StackType::I4);
            }
            Instr::LdcI8(v) => {
                self.emit(Opcode::LdcI8);
                self.raw_u64(*v as u64);
                self.push_ty(StackType::I8);
            }
            Instr::LdcR4(v) => {
                self.emit(Opcode::LdcR4);
                self.raw_u32(v.to_bits());
                self.push_ty(StackType::R8);
            }
            Instr::LdcR8(v) => {
                self.emit(Opcode::LdcR8);
                self.raw_u64(v.to_bits());
                self.push_ty(StackType::R8);
            }
            Instr::Ldstr(text) => {
                let s = self.env.heap.intern(text);
                let item = self.item(DataItem::Str(s))?;
                self.emit(Opcode::Ldstr);
                self.raw(item);
                self.push(Slot {
                    ty: StackType::O,
                    class: Some(WellKnown::String.id()),
                });
            }

            Instr::Dup => {
                let top = self.peek(0)?;
                match top.ty {
                    StackType::Vt(size) => {
                        self.emit(Opcode::DupVt);
                        self.raw(self.size_operand(size)?);
                    }
                    _ => {
                        self.emit(Opcode::Dup);
                    }
                }
                self.push(top);
            }
            Instr::Pop => {
                let top = self.peek(0)?;
                match top.ty {
                    StackType::Vt(size) => {
                        self.emit(Opcode::PopVt);
                        self.raw(self.size_operand(size)?);
                    }
                    _ => {
                        self.emit(Opcode::Pop);
                    }
                }
                self.pop_release(1);
            }

            Instr::Call(m) | Instr::Callvirt(m) | Instr::TailCall(m) => {
                self.lower_call(i, instr, m)?;
            }
            Instr::Newobj(m) => self.lower_newobj(m)?,
            Instr::Jmp(m) => {
                let handle = self.resolve(m)?;
                let item = self.item(DataItem::Method(handle))?;
                self.emit(Opcode::Jmp);
                self.raw(item);
                self.reachable = false;
            }
            Instr::Ret => {
                match self.rm.ret {
                    RetKind::Void => {
                        self.emit(Opcode::RetVoid);
                    }
                    RetKind::Value(_) => {
                        self.need(1)?;
                        self.emit(Opcode::Ret);
                        self.pop_release(1);
                    }
                    RetKind::Vt(size) => {
                        self.need(1)?;
                        self.emit(Opcode::RetVt);
                        self.raw(self.size_operand(size)?);
                        self.pop_release(1);
                    }
                }
                self.reachable = false;
            }

            Instr::Br(t) => {
                self.branch(Opcode::Br, Opcode::BrS, *t, 0)?;
                self.reachable = false;
            }
            Instr::BrCond(cond, t) => self.lower_cond_branch(instr, *cond, *t)?,
            Instr::Switch(targets) => self.lower_switch(instr, targets)?,
            Instr::Leave(t) => {
                // Whatever is left on the stack is discarded by the leave
                // itself, after the shape check.
                self.branch_settling(Opcode::Leave, Opcode::LeaveS, *t, None)?;
                self.reachable = false;
            }
            Instr::EndFinally => {
                self.emit(Opcode::EndFinally);
                self.stack.clear();
                self.vt = 0;
                self.reachable = false;
            }
            Instr::EndFilter => {
                if self.peek(0)?.ty != StackType::I4 {
                    return Err(self.mismatch(instr, 1));
                }
                self.emit(Opcode::EndFilter);
                self.stack.clear();
                self.vt = 0;
                self.reachable = false;
            }
            Instr::Throw => {
                if self.peek(0)?.ty != StackType::O {
                    return Err(self.mismatch(instr, 1));
                }
                self.emit(Opcode::Throw);
                self.stack.clear();
                self.vt = 0;
                self.reachable = false;
            }
            Instr::Rethrow => {
                self.emit(Opcode::Rethrow);
                self.stack.clear();
                self.vt = 0;
                self.reachable = false;
            }

            Instr::Binary(op) => self.lower_binary(instr, *op)?,
            Instr::Unary(op) => {
                let ty = self.peek(0)?.ty;
                let code = match (op, ty) {
                    (UnOp::Neg, StackType::I4) => Opcode::NegI4,
                    (UnOp::Neg, StackType::I8) => Opcode::NegI8,
                    (UnOp::Neg, StackType::R8) => Opcode::NegR8,
                    (UnOp::Not, StackType::I4) => Opcode::NotI4,
                    (UnOp::Not, StackType::I8) => Opcode::NotI8,
                    _ => return Err(self.mismatch(instr, 1)),
                };
                self.emit(code);
            }
            Instr::Compare(op) => self.lower_compare(instr, *op)?,
            Instr::Conv(target) => self.lower_conv(instr, *target, Opcode::ConvI4, Opcode::ConvI8, Opcode::ConvR8)?,
            Instr::ConvOvf(target) => {
                self.lower_conv(instr, *target, Opcode::ConvOvfI4, Opcode::ConvOvfI8, Opcode::ConvOvfR8)?
            }
            Instr::ConvOvfUn(target) => {
                self.lower_conv(instr, *target, Opcode::ConvOvfUnI4, Opcode::ConvOvfUnI8, Opcode::ConvOvfR8)?
            }
            Instr::Ckfinite => {
                if self.peek(0)?.ty != StackType::R8 {
                    return Err(self.mismatch(instr, 1));
                }
                self.emit(Opcode::Ckfinite);
            }

            Instr::Ldind(ty) => {
                let ty = ty.inflate(&self.rm.ctx);
                self.lower_ldind(instr, &ty)?;
            }
            Instr::Stind(ty) => {
                let ty = ty.inflate(&self.rm.ctx);
                self.lower_stind(instr, &ty)?;
            }
            Instr::Ldfld(f) => self.lower_ldfld(instr, *f)?,
            Instr::Ldflda(f) => {
                let field = self.md.field(*f);
                let receiver = self.peek(0)?.ty;
                if !matches!(receiver, StackType::O | StackType::Mp | StackType::I8) {
                    return Err(self.mismatch(instr, 1));
                }
                let offset = field.offset;
                self.emit(Opcode::Ldflda);
                self.raw(self.size_operand(offset)?);
                self.pop_release(1);
                self.push_ty(StackType::Mp);
            }
            Instr::Stfld(f) => self.lower_stfld(instr, *f)?,
            Instr::Ldsfld(f) => {
                let ty = self.md.field(*f).ty.clone();
                let item = self.item(DataItem::Field(*f))?;
                let mint = mint_type(self.md, &ty);
                self.emit(Opcode::specialize(Opcode::LdsfldI1, mint));
                self.raw(item);
                if mint == MintType::Vt {
                    self.raw(self.size_operand(self.md.slot_size(&ty))?);
                }
                let slot = self.slot_of(&ty);
                self.push(slot);
            }
            Instr::Stsfld(f) => {
                let ty = self.md.field(*f).ty.clone();
                self.need(1)?;
                let item = self.item(DataItem::Field(*f))?;
                let mint = mint_type(self.md, &ty);
                self.emit(Opcode::specialize(Opcode::StsfldI1, mint));
                self.raw(item);
                if mint == MintType::Vt {
                    self.raw(self.size_operand(self.md.slot_size(&ty))?);
                }
                self.pop_release(1);
            }
            Instr::Ldsflda(f) => {
                let item = self.item(DataItem::Field(*f))?;
                self.emit(Opcode::Ldsflda);
                self.raw(item);
                self.push_ty(StackType::Mp);
            }

            Instr::Box(ty) => self.lower_box(instr, &ty.inflate(&self.rm.ctx))?,
            Instr::UnboxAny(ty) => self.lower_unbox(instr, &ty.inflate(&self.rm.ctx))?,
            Instr::Castclass(ty) | Instr::Isinst(ty) => {
                let ty = ty.inflate(&self.rm.ctx);
                let top = self.peek(0)?;
                if top.ty != StackType::O {
                    return Err(self.mismatch(instr, 1));
                }
                let statically_known = top
                    .class
                    .is_some_and(|c| self.md.class_is_assignable(c, &ty));
                if !statically_known {
                    let item = self.item(DataItem::Type(ty.clone()))?;
                    let op = if matches!(instr, Instr::Castclass(_)) {
                        Opcode::Castclass
                    } else {
                        Opcode::Isinst
                    };
                    self.emit(op);
                    self.raw(item);
                }
                self.pop_release(1);
                let slot = self.slot_of(&ty);
                self.push(Slot {
                    ty: StackType::O,
                    class: slot.class,
                });
            }
            Instr::Initobj(ty) => {
                let ty = ty.inflate(&self.rm.ctx);
                if !self.peek(0)?.ty.is_int() {
                    return Err(self.mismatch(instr, 1));
                }
                self.emit(Opcode::Initobj);
                self.raw(self.size_operand(self.md.size_of(&ty).max(1))?);
                self.pop_release(1);
            }
            Instr::Ldobj(ty) => {
                let ty = ty.inflate(&self.rm.ctx);
                if self.md.is_value_type(&ty) {
                    if !self.peek(0)?.ty.is_int() {
                        return Err(self.mismatch(instr, 1));
                    }
                    let size = self.md.slot_size(&ty);
                    self.emit(Opcode::LdobjVt);
                    self.raw(self.size_operand(size)?);
                    self.pop_release(1);
                    let slot = self.slot_of(&ty);
                    self.push(slot);
                } else {
                    self.lower_ldind(instr, &ty)?;
                }
            }
            Instr::Stobj(ty) => {
                let ty = ty.inflate(&self.rm.ctx);
                if self.md.is_value_type(&ty) {
                    self.need(2)?;
                    let size = self.md.slot_size(&ty);
                    self.emit(Opcode::StobjVt);
                    self.raw(self.size_operand(size)?);
                    self.pop_release(2);
                } else {
                    self.lower_stind(instr, &ty)?;
                }
            }

            Instr::Newarr(elem) => {
                let elem = elem.inflate(&self.rm.ctx);
                self.widen_index(instr, 0)?;
                let item = self.item(DataItem::Type(elem.clone()))?;
                self.emit(Opcode::Newarr);
                self.raw(item);
                self.pop_release(1);
                self.push_ty(StackType::O);
            }
            Instr::Ldlen => {
                if self.peek(0)?.ty != StackType::O {
                    return Err(self.mismatch(instr, 1));
                }
                self.emit(Opcode::Ldlen);
                self.pop_release(1);
                self.push_ty(StackType::I8);
            }
            Instr::Ldelem(elem) => {
                let elem = elem.inflate(&self.rm.ctx);
                self.need(2)?;
                self.widen_index(instr, 0)?;
                let mint = mint_type(self.md, &elem);
                self.emit(Opcode::specialize(Opcode::LdelemI1, mint));
                if mint == MintType::Vt {
                    self.raw(self.size_operand(self.md.slot_size(&elem))?);
                }
                self.pop_release(2);
                let slot = self.slot_of(&elem);
                self.push(slot);
            }
            Instr::Ldelema(elem) => {
                let elem = elem.inflate(&self.rm.ctx);
                self.need(2)?;
                self.widen_index(instr, 0)?;
                self.emit(Opcode::Ldelema);
                self.raw(self.size_operand(self.md.size_of(&elem))?);
                self.pop_release(2);
                self.push_ty(StackType::Mp);
            }
            Instr::Stelem(elem) => {
                let elem = elem.inflate(&self.rm.ctx);
                self.need(3)?;
                self.widen_index(instr, 1)?;
                let mint = mint_type(self.md, &elem);
                self.emit(Opcode::specialize(Opcode::StelemI1, mint));
                if mint == MintType::Vt {
                    self.raw(self.size_operand(self.md.slot_size(&elem))?);
                }
                self.pop_release(3);
            }
        }
        Ok(())
    }

    fn arg(&self, n: u16) -> Result<ArgSlot, CompileError> {
        self.rm.args.get(n as usize).copied().ok_or_else(|| CompileError::UnresolvedToken {
            method: self.name(),
            offset: self.offset,
            token: format!("argument {n}"),
        })
    }

    fn local(&self, n: u16) -> Result<ArgSlot, CompileError> {
        self.locals.get(n as usize).copied().ok_or_else(|| CompileError::UnresolvedToken {
            method: self.name(),
            offset: self.offset,
            token: format!("local {n}"),
        })
    }

    fn load_slot(&mut self, slot: ArgSlot, family: Opcode, vt_op: Opcode) -> Result<(), CompileError> {
        if slot.mint == MintType::Vt {
            self.emit(vt_op);
            self.raw(slot.offset as u16);
            self.raw(self.size_operand(slot.size)?);
            self.push_ty(StackType::Vt(slot.size));
        } else {
            self.emit(Opcode::specialize(family, slot.mint));
            self.raw(slot.offset as u16);
            self.push_ty(mint_stack_type(slot.mint, 0));
        }
        Ok(())
    }

    fn store_slot(&mut self, slot: ArgSlot, family: Opcode, vt_op: Opcode) -> Result<(), CompileError> {
        self.need(1)?;
        if slot.mint == MintType::Vt {
            self.emit(vt_op);
            self.raw(slot.offset as u16);
            self.raw(self.size_operand(slot.size)?);
        } else {
            self.emit(Opcode::specialize(family, slot.mint));
            self.raw(slot.offset as u16);
        }
        self.pop_release(1);
        Ok(())
    }

    /// Widen an `i4` array index or length at `depth` to native int.
    fn widen_index(&mut self, instr: &Instr, depth: usize) -> Result<(), CompileError> {
        match self.peek(depth)?.ty {
            StackType::I4 => {
                match depth {
                    0 => {
                        self.emit(Opcode::ConvI4);
                        self.raw(ConvTarget::I8 as u16);
                    }
                    1 => {
                        self.emit(Opcode::WidenI4Under);
                    }
                    _ => return Err(self.mismatch(instr, depth + 1)),
                }
                self.set_top(depth, StackType::I8);
                Ok(())
            }
            StackType::I8 | StackType::Mp => Ok(()),
            _ => Err(self.mismatch(instr, depth + 1)),
        }
    }

    fn resolve(&self, m: &MethodRef) -> Result<MethodHandle, CompileError> {
        if m.method.0 as usize >= self.md.method_count() {
            return Err(CompileError::UnresolvedToken {
                method: self.name(),
                offset: self.offset,
                token: format!("method {}", m.method.0),
            });
        }
        let inst: Vec<TypeDesc> = m.inst.iter().map(|t| t.inflate(&self.rm.ctx)).collect();
        Ok(self.env.methods.resolve(self.md, m.method, &inst))
    }

    // =========================================================================
    // Calls
    // =========================================================================

    fn lower_call(&mut self, i: usize, instr: &Instr, m: &MethodRef) -> Result<(), CompileError> {
        let md = self.md;
        let handle = self.resolve(m)?;
        let callee = self.env.methods.get(handle);
        let desc = md.method(callee.id);
        let n = callee.arg_count();
        self.need(n)?;

        let is_callvirt = matches!(instr, Instr::Callvirt(_));
        let dispatch = is_callvirt
            && desc.flags.is_virtual
            && !desc.flags.is_final
            && !md.class(desc.owner).is_value_type;

        if desc.owner == WellKnown::String.id() && desc.sig.has_this {
            match desc.name.as_str() {
                "get_Length" => {
                    self.emit(Opcode::Strlen);
                    self.pop_release(1);
                    self.push_ty(StackType::I4);
                    return Ok(());
                }
                "get_Chars" => {
                    self.emit(Opcode::Getchr);
                    self.pop_release(2);
                    self.push_ty(StackType::I4);
                    return Ok(());
                }
                _ => {}
            }
        }

        let empty_body = matches!(&desc.imp, MethodImpl::Il(body) if body.is_empty_return());
        if self.env.config.inline_empty_calls && empty_body && !dispatch && !matches!(instr, Instr::TailCall(_)) {
            if is_callvirt && desc.sig.has_this {
                self.emit(Opcode::Ckthis);
                self.raw((n - 1) as u16);
            }
            for _ in 0..n {
                match self.peek(0)?.ty {
                    StackType::Vt(size) => {
                        self.emit(Opcode::PopVt);
                        self.raw(self.size_operand(size)?);
                    }
                    _ => {
                        self.emit(Opcode::Pop);
                    }
                }
                self.pop_release(1);
            }
            return Ok(());
        }

        let followed_by_ret = matches!(self.body.code.get(i + 1), Some(Instr::Ret));
        if self.env.config.optimize_self_tail_calls
            && matches!(instr, Instr::Call(_))
            && handle == self.rm.handle
            && followed_by_ret
            && self.stack.len() == n
            && !self.in_protected_region(i)
        {
            for slot in callee.args.iter().rev().copied() {
                self.store_slot(slot, Opcode::StargI1, Opcode::StargVt)?;
            }
            self.branch_to_start();
            self.reachable = false;
            return Ok(());
        }

        let item = self.item(DataItem::Method(handle))?;
        let op = if dispatch {
            Opcode::Callvirt
        } else if matches!(instr, Instr::TailCall(_)) && !self.in_protected_region(i) {
            Opcode::TailCall
        } else {
            Opcode::Call
        };
        if is_callvirt && !dispatch && desc.sig.has_this {
            self.emit(Opcode::Ckthis);
            self.raw((n - 1) as u16);
        }
        self.emit(op);
        self.raw(item);
        let args_vt = self.pop_keep(n);
        let ret_ty = desc.sig.ret.inflate(&callee.ctx);
        let ret_vt = match callee.ret {
            RetKind::Void => 0,
            RetKind::Value(_) | RetKind::Vt(_) => {
                let slot = self.slot_of(&ret_ty);
                let vt = slot.ty.vt_size();
                self.push(slot);
                vt
            }
        };
        self.vt_result(ret_vt, args_vt)
    }

    /// Release value-type argument bytes consumed by the previous call,
    /// moving a value-type result down over them.
    fn vt_result(&mut self, ret_vt: u32, args_vt: u32) -> Result<(), CompileError> {
        if args_vt > 0 {
            self.emit(Opcode::Vtresult);
            self.raw(self.size_operand(ret_vt)?);
            self.raw(self.size_operand(args_vt)?);
            self.vt -= args_vt;
        }
        Ok(())
    }

    fn lower_newobj(&mut self, m: &MethodRef) -> Result<(), CompileError> {
        let handle = self.resolve(m)?;
        let callee = self.env.methods.get(handle);
        let owner = self.md.method(callee.id).owner;
        let n = callee.arg_count().saturating_sub(1);
        self.need(n)?;
        let item = self.item(DataItem::Method(handle))?;
        if self.md.class(owner).is_value_type {
            let size = self.md.slot_size(&TypeDesc::Class(owner));
            self.emit(Opcode::NewobjVt);
            self.raw(item);
            self.raw(self.size_operand(size)?);
            let args_vt = self.pop_keep(n);
            self.push(Slot {
                ty: StackType::Vt(size),
                class: Some(owner),
            });
            self.vt_result(size, args_vt)
        } else {
            self.emit(Opcode::Newobj);
            self.raw(item);
            let args_vt = self.pop_keep(n);
            self.push(Slot {
                ty: StackType::O,
                class: Some(owner),
            });
            self.vt_result(0, args_vt)
        }
    }

    // =========================================================================
    // Arithmetic, comparisons, conversions
    // =========================================================================

    /// Pick the operand width of a binary instruction, widening a mixed
    /// `i4`/`i8` pair to `i8`.
    fn binary_width(&mut self, instr: &Instr) -> Result<Num, CompileError> {
        let (a, b) = (self.peek(1)?.ty, self.peek(0)?.ty);
        match (a, b) {
            (StackType::I4, StackType::I4) => Ok(Num::I4),
            (StackType::R8, StackType::R8) => Ok(Num::R8),
            (a, b) if a.is_int() && b.is_int() => {
                if b == StackType::I4 {
                    self.emit(Opcode::ConvI4);
                    self.raw(ConvTarget::I8 as u16);
                    self.set_top(0, StackType::I8);
                }
                if a == StackType::I4 {
                    self.emit(Opcode::WidenI4Under);
                    self.set_top(1, StackType::I8);
                }
                Ok(Num::I8)
            }
            _ => Err(self.mismatch(instr, 2)),
        }
    }

    fn lower_binary(&mut self, instr: &Instr, op: BinOp) -> Result<(), CompileError> {
        let (a, b) = (self.peek(1)?.ty, self.peek(0)?.ty);
        if op.is_shift() {
            let width = match a {
                StackType::I4 => Num::I4,
                StackType::I8 | StackType::Mp => Num::I8,
                _ => return Err(self.mismatch(instr, 2)),
            };
            match b {
                StackType::I4 => {}
                StackType::I8 | StackType::Mp => {
                    self.emit(Opcode::ConvI8);
                    self.raw(ConvTarget::I4 as u16);
                    self.set_top(0, StackType::I4);
                }
                _ => return Err(self.mismatch(instr, 2)),
            }
            let base = if width == Num::I4 { Opcode::AddI4 } else { Opcode::AddI8 };
            self.emit(nth(base, op as usize));
            self.pop_release(2);
            self.push_ty(if width == Num::I4 { StackType::I4 } else { StackType::I8 });
            return Ok(());
        }

        let width = self.binary_width(instr)?;
        let code = match width {
            Num::I4 => nth(Opcode::AddI4, op as usize),
            Num::I8 => nth(Opcode::AddI8, op as usize),
            Num::R8 => match op {
                BinOp::Add => Opcode::AddR8,
                BinOp::Sub => Opcode::SubR8,
                BinOp::Mul => Opcode::MulR8,
                BinOp::Div => Opcode::DivR8,
                BinOp::Rem => Opcode::RemR8,
                _ => return Err(self.mismatch(instr, 2)),
            },
        };
        self.emit(code);
        self.pop_release(2);
        let pointer_math = matches!(op, BinOp::Add | BinOp::Sub)
            && (a == StackType::Mp || b == StackType::Mp)
            && !(a == StackType::Mp && b == StackType::Mp);
        self.push_ty(match width {
            Num::I4 => StackType::I4,
            Num::I8 if pointer_math => StackType::Mp,
            Num::I8 => StackType::I8,
            Num::R8 => StackType::R8,
        });
        Ok(())
    }

    fn lower_compare(&mut self, instr: &Instr, op: CmpOp) -> Result<(), CompileError> {
        let (a, b) = (self.peek(1)?.ty, self.peek(0)?.ty);
        let code = if a == StackType::O && b == StackType::O {
            match op {
                CmpOp::Ceq => Opcode::CeqO,
                CmpOp::CgtUn => Opcode::CgtUnO,
                CmpOp::CltUn => Opcode::CltUnO,
                _ => return Err(self.mismatch(instr, 2)),
            }
        } else {
            match self.binary_width(instr)? {
                Num::I4 => nth(Opcode::CeqI4, op as usize),
                Num::I8 => nth(Opcode::CeqI8, op as usize),
                Num::R8 => nth(Opcode::CeqR8, op as usize),
            }
        };
        self.emit(code);
        self.pop_release(2);
        self.push_ty(StackType::I4);
        Ok(())
    }

    fn lower_cond_branch(&mut self, instr: &Instr, cond: Cond, target: usize) -> Result<(), CompileError> {
        if cond.is_unary() {
            let base = match self.peek(0)?.ty {
                StackType::I4 => Opcode::BrfalseI4,
                StackType::I8 | StackType::Mp => Opcode::BrfalseI8,
                StackType::O => Opcode::BrfalseO,
                _ => return Err(self.mismatch(instr, 1)),
            };
            let k = if cond == Cond::True { 2 } else { 0 };
            return self.branch(nth(base, k), nth(base, k + 1), target, 1);
        }

        let (a, b) = (self.peek(1)?.ty, self.peek(0)?.ty);
        let (long, short) = if a == StackType::O && b == StackType::O {
            match cond {
                Cond::Eq => (Opcode::BeqO, Opcode::BeqOS),
                Cond::NeUn => (Opcode::BneUnO, Opcode::BneUnOS),
                _ => return Err(self.mismatch(instr, 2)),
            }
        } else {
            let base = match self.binary_width(instr)? {
                Num::I4 => Opcode::BeqI4,
                Num::I8 => Opcode::BeqI8,
                Num::R8 => Opcode::BeqR8,
            };
            let k = 2 * (cond as usize - Cond::Eq as usize);
            (nth(base, k), nth(base, k + 1))
        };
        self.branch(long, short, target, 2)
    }

    fn lower_switch(&mut self, instr: &Instr, targets: &[usize]) -> Result<(), CompileError> {
        if self.peek(0)?.ty != StackType::I4 {
            return Err(self.mismatch(instr, 1));
        }
        if targets.iter().any(|&t| t <= self.offset) {
            self.emit(Opcode::Safepoint);
        }
        let at = self.emit(Opcode::Switch);
        self.pop_release(1);
        self.raw_u32(targets.len() as u32);
        for &target in targets {
            self.join(target)?;
            let operand = self.code.len();
            if target <= self.offset {
                let delta = self.in_offsets[target] as i64 - at as i64;
                self.raw_u32(delta as i32 as u32);
            } else {
                self.raw_u32(0);
                self.fixups.entry(target).or_default().push(Fixup {
                    at,
                    operand,
                    short: false,
                });
            }
        }
        Ok(())
    }

    fn lower_conv(
        &mut self,
        instr: &Instr,
        target: ConvTarget,
        from_i4: Opcode,
        from_i8: Opcode,
        from_r8: Opcode,
    ) -> Result<(), CompileError> {
        let op = match self.peek(0)?.ty {
            StackType::I4 => from_i4,
            StackType::I8 | StackType::Mp => from_i8,
            StackType::R8 => from_r8,
            _ => return Err(self.mismatch(instr, 1)),
        };
        self.emit(op);
        self.raw(target as u16);
        self.pop_release(1);
        self.push_ty(match target {
            ConvTarget::I1
            | ConvTarget::U1
            | ConvTarget::I2
            | ConvTarget::U2
            | ConvTarget::I4
            | ConvTarget::U4 => StackType::I4,
            ConvTarget::I8 | ConvTarget::U8 | ConvTarget::I | ConvTarget::U => StackType::I8,
            ConvTarget::R4 | ConvTarget::R8 | ConvTarget::RUn => StackType::R8,
        });
        Ok(())
    }

    // =========================================================================
    // Memory, fields, boxing
    // =========================================================================

    fn lower_ldind(&mut self, instr: &Instr, ty: &TypeDesc) -> Result<(), CompileError> {
        if !self.peek(0)?.ty.is_int() {
            return Err(self.mismatch(instr, 1));
        }
        let mint = mint_type(self.md, ty);
        if mint == MintType::Vt {
            return Err(self.mismatch(instr, 1));
        }
        self.emit(Opcode::specialize(Opcode::LdindI1, mint));
        self.pop_release(1);
        let slot = self.slot_of(ty);
        self.push(slot);
        Ok(())
    }

    fn lower_stind(&mut self, instr: &Instr, ty: &TypeDesc) -> Result<(), CompileError> {
        self.need(2)?;
        if !self.peek(1)?.ty.is_int() {
            return Err(self.mismatch(instr, 2));
        }
        let mint = mint_type(self.md, ty);
        if mint == MintType::Vt {
            return Err(self.mismatch(instr, 2));
        }
        self.emit(Opcode::specialize(Opcode::StindI1, mint));
        self.pop_release(2);
        Ok(())
    }

    fn lower_ldfld(&mut self, instr: &Instr, f: crate::metadata::FieldId) -> Result<(), CompileError> {
        let field = self.md.field(f);
        if field.is_static {
            return Err(self.mismatch(instr, 1));
        }
        let ty = field.ty.clone();
        let offset = self.size_operand(field.offset)?;
        let receiver = self.peek(0)?.ty;
        if !matches!(
            receiver,
            StackType::O | StackType::Mp | StackType::I8 | StackType::Vt(_)
        ) {
            return Err(self.mismatch(instr, 1));
        }
        let mint = mint_type(self.md, &ty);
        self.emit(Opcode::specialize(Opcode::LdfldI1, mint));
        self.raw(offset);
        if mint == MintType::Vt {
            self.raw(self.size_operand(self.md.slot_size(&ty))?);
        }
        let receiver_vt = self.pop_keep(1);
        let slot = self.slot_of(&ty);
        let result_vt = slot.ty.vt_size();
        self.push(slot);
        self.vt_result(result_vt, receiver_vt)
    }

    fn lower_stfld(&mut self, instr: &Instr, f: crate::metadata::FieldId) -> Result<(), CompileError> {
        let field = self.md.field(f);
        if field.is_static {
            return Err(self.mismatch(instr, 2));
        }
        let ty = field.ty.clone();
        let offset = self.size_operand(field.offset)?;
        if !matches!(self.peek(1)?.ty, StackType::O | StackType::Mp | StackType::I8) {
            return Err(self.mismatch(instr, 2));
        }
        let mint = mint_type(self.md, &ty);
        self.emit(Opcode::specialize(Opcode::StfldI1, mint));
        self.raw(offset);
        if mint == MintType::Vt {
            self.raw(self.size_operand(self.md.slot_size(&ty))?);
        }
        self.pop_release(2);
        Ok(())
    }

    fn lower_box(&mut self, instr: &Instr, ty: &TypeDesc) -> Result<(), CompileError> {
        self.need(1)?;
        let Some(class) = self.md.box_class(ty) else {
            // Boxing a reference type is the identity
            if self.peek(0)?.ty != StackType::O {
                return Err(self.mismatch(instr, 1));
            }
            return Ok(());
        };
        let item = self.item(DataItem::Class(class))?;
        let mint = mint_type(self.md, ty);
        if mint == MintType::Vt {
            self.emit(Opcode::BoxVt);
            self.raw(item);
            self.raw(self.size_operand(self.md.slot_size(ty))?);
        } else {
            self.emit(Opcode::Box);
            self.raw(item);
            self.raw(mint as u16);
        }
        self.pop_release(1);
        self.push(Slot {
            ty: StackType::O,
            class: Some(class),
        });
        Ok(())
    }

    fn lower_unbox(&mut self, instr: &Instr, ty: &TypeDesc) -> Result<(), CompileError> {
        if self.peek(0)?.ty != StackType::O {
            return Err(self.mismatch(instr, 1));
        }
        let Some(class) = self.md.box_class(ty) else {
            // unbox.any to a reference type is a cast
            let item = self.item(DataItem::Type(ty.clone()))?;
            self.emit(Opcode::Castclass);
            self.raw(item);
            self.pop_release(1);
            let slot = self.slot_of(ty);
            self.push(slot);
            return Ok(());
        };
        let item = self.item(DataItem::Class(class))?;
        let mint = mint_type(self.md, ty);
        if mint == MintType::Vt {
            self.emit(Opcode::UnboxAnyVt);
            self.raw(item);
            self.raw(self.size_operand(self.md.slot_size(ty))?);
        } else {
            self.emit(Opcode::UnboxAny);
            self.raw(item);
            self.raw(mint as u16);
        }
        self.pop_release(1);
        let slot = self.slot_of(ty);
        self.push(slot);
        Ok(())
    }

    // =========================================================================
    // Finish
    // =========================================================================

    fn finish(mut self) -> Result<CompiledMethod, CompileError> {
        if self.reachable {
            return Err(CompileError::UnreachableEnd { method: self.name() });
        }
        let len = self.body.code.len();
        self.in_offsets[len] = self.code.len() as u32;
        if self.max_height > self.env.config.max_stack_slots {
            return Err(CompileError::FrameTooLarge { method: self.name() });
        }

        let mut clauses = Vec::with_capacity(self.body.clauses.len());
        for clause in &self.body.clauses {
            let kind = match &clause.kind {
                il::ClauseKind::Catch(ty) => ClauseKind::Catch(ty.inflate(&self.rm.ctx)),
                il::ClauseKind::Filter { filter_start } => ClauseKind::Filter {
                    filter_start: self.in_offsets[*filter_start],
                },
                il::ClauseKind::Finally => ClauseKind::Finally,
                il::ClauseKind::Fault => ClauseKind::Fault,
            };
            clauses.push(Clause {
                kind,
                try_start: self.in_offsets[clause.try_start],
                try_end: self.in_offsets[clause.try_end],
                handler_start: self.in_offsets[clause.handler_start],
                handler_end: self.in_offsets[clause.handler_end],
            });
        }

        let args_size = self.rm.args_size;
        let vt_size = self.max_vt;
        let locals_offset = args_size + vt_size;
        if locals_offset + self.locals_size > u16::MAX as u32 {
            return Err(CompileError::FrameTooLarge { method: self.name() });
        }
        let alloca_size = locals_offset + self.locals_size + self.max_height as u32 * 8;

        debug_assert_eq!(self.code.len(), self.shapes.len());
        Ok(CompiledMethod {
            handle: self.rm.handle,
            name: self.rm.name.clone(),
            code: self.code.into_boxed_slice(),
            data_items: self.items.into_boxed_slice(),
            clauses: clauses.into_boxed_slice(),
            args: self.rm.args.clone(),
            args_size,
            vt_size,
            locals_offset,
            locals_size: self.locals_size,
            max_stack: self.max_height as u32,
            alloca_size,
            ret: self.rm.ret,
            shapes: self.shapes.into_boxed_slice(),
        })
    }
}

/// Opcode `k` places after `op` in the catalog.
fn nth(op: Opcode, k: usize) -> Opcode {
    Opcode::ALL[op as usize + k]
}

fn mint_stack_type(mint: MintType, vt_size: u32) -> StackType {
    match mint {
        MintType::I1 | MintType::U1 | MintType::I2 | MintType::U2 | MintType::I4 => StackType::I4,
        MintType::I8 => StackType::I8,
        MintType::R4 | MintType::R8 => StackType::R8,
        MintType::O => StackType::O,
        MintType::P => StackType::Mp,
        MintType::Vt => StackType::Vt(vt_size),
    }
}

fn same_types(a: &[Slot], b: &[Slot]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.ty == y.ty)
}

fn describe(stack: &[Slot]) -> String {
    let mut out = String::new();
    for (i, slot) in stack.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        let _ = write!(out, "{}", slot.ty.name());
    }
    out
}

/// Upper bound on the internal words one source instruction lowers to.
fn estimated_words(md: &Metadata, instr: &Instr) -> usize {
    match instr {
        Instr::Switch(targets) => 4 + 2 * targets.len(),
        Instr::Call(m) | Instr::Callvirt(m) | Instr::TailCall(m) | Instr::Newobj(m) => {
            let args = if (m.method.0 as usize) < md.method_count() {
                md.method(m.method).sig.arg_count()
            } else {
                0
            };
            8 + 3 * args
        }
        _ => 8,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::il::{ClauseKind as IlClauseKind, ExceptionClause, IlBuilder};
    use crate::metadata::{MetadataBuilder, MethodDef, MethodId};

    struct Fixture {
        md: Metadata,
        methods: MethodTable,
        heap: Heap,
        config: RuntimeConfig,
    }

    impl Fixture {
        fn new(md: Metadata) -> Self {
            Self {
                md,
                methods: MethodTable::new(),
                heap: Heap::new(),
                config: RuntimeConfig::default(),
            }
        }

        fn compile(&self, id: MethodId) -> Result<CompiledMethod, CompileError> {
            let env = TransformEnv {
                metadata: &self.md,
                methods: &self.methods,
                heap: &self.heap,
                config: &self.config,
            };
            let handle = self.methods.resolve(&self.md, id, &[]);
            transform(&env, &self.methods.get(handle))
        }
    }

    fn single(params: Vec<TypeDesc>, ret: TypeDesc, body: MethodBody) -> (Fixture, MethodId) {
        let mut b = MetadataBuilder::new();
        let c = b.define_class("T", None).unwrap();
        let m = b.add_method(c, MethodDef::static_("M", params, ret));
        b.set_body(m, body);
        (Fixture::new(b.finish().unwrap()), m)
    }

    fn ops(method: &CompiledMethod) -> Vec<Opcode> {
        method.instructions().filter_map(|(_, op, _)| op).collect()
    }

    #[test]
    fn test_add_specializes_by_width() {
        let body = MethodBody {
            code: vec![Instr::Ldarg(0), Instr::Ldarg(1), Instr::Binary(BinOp::Add), Instr::Ret],
            ..Default::default()
        };
        let (fx, m) = single(vec![TypeDesc::I4, TypeDesc::I8], TypeDesc::I8, body);
        let compiled = fx.compile(m).unwrap();
        assert_eq!(
            ops(&compiled),
            vec![
                Opcode::LdargI4,
                Opcode::LdargI8,
                Opcode::WidenI4Under,
                Opcode::AddI8,
                Opcode::Ret
            ]
        );
        assert_eq!(compiled.max_stack, 2);
    }

    #[test]
    fn test_backward_branch_gets_safepoint_and_short_form() {
        let mut b = IlBuilder::new();
        let top = b.label();
        b.mark(top);
        b.emit(Instr::Ldarg(0)).br_if(Cond::True, top).emit(Instr::Ret);
        let (fx, m) = single(vec![TypeDesc::I4], TypeDesc::Void, b.finish().unwrap());
        let compiled = fx.compile(m).unwrap();
        assert_eq!(
            ops(&compiled),
            vec![Opcode::LdargI4, Opcode::Safepoint, Opcode::BrtrueI4S, Opcode::RetVoid]
        );
        // ldarg (2 words) + safepoint (1) puts the branch at word 3
        assert_eq!(compiled.code[4] as i16, -3);
    }

    #[test]
    fn test_forward_branch_long_form_when_short_disabled() {
        let mut b = IlBuilder::new();
        let out = b.label();
        b.br(out).emit(Instr::Nop);
        b.mark(out).emit(Instr::Ret);
        let (mut fx, m) = single(vec![], TypeDesc::Void, b.finish().unwrap());
        fx.config.short_branches = false;
        let compiled = fx.compile(m).unwrap();
        assert_eq!(ops(&compiled), vec![Opcode::Br, Opcode::RetVoid]);
        assert_eq!(crate::vm::opcodes::read_i32(&compiled.code, 1), 3);
    }

    #[test]
    fn test_join_shape_mismatch_is_error() {
        let mut b = IlBuilder::new();
        let join = b.label();
        b.emit(Instr::Ldarg(0)).br_if(Cond::True, join);
        b.emit(Instr::LdcI4(1));
        b.mark(join).emit(Instr::Ret);
        let (fx, m) = single(vec![TypeDesc::I4], TypeDesc::Void, b.finish().unwrap());
        assert!(matches!(fx.compile(m), Err(CompileError::StackShapeMismatch { .. })));
    }

    #[test]
    fn test_underflow_is_error() {
        let body = MethodBody {
            code: vec![Instr::Binary(BinOp::Add), Instr::Ret],
            ..Default::default()
        };
        let (fx, m) = single(vec![], TypeDesc::I4, body);
        assert!(matches!(fx.compile(m), Err(CompileError::StackUnderflow { .. })));
    }

    #[test]
    fn test_falling_off_end_is_error() {
        let body = MethodBody {
            code: vec![Instr::Nop],
            ..Default::default()
        };
        let (fx, m) = single(vec![], TypeDesc::Void, body);
        assert!(matches!(fx.compile(m), Err(CompileError::UnreachableEnd { .. })));
    }

    #[test]
    fn test_data_items_deduplicated() {
        let body = MethodBody {
            code: vec![
                Instr::Ldstr("a".into()),
                Instr::Pop,
                Instr::Ldstr("a".into()),
                Instr::Pop,
                Instr::Ldstr("b".into()),
                Instr::Pop,
                Instr::Ret,
            ],
            ..Default::default()
        };
        let (fx, m) = single(vec![], TypeDesc::Void, body);
        assert_eq!(fx.compile(m).unwrap().data_items.len(), 2);
    }

    #[test]
    fn test_clause_offsets_translated() {
        let body = MethodBody {
            code: vec![
                Instr::LdcI4(1000),
                Instr::Pop,
                Instr::Leave(4),
                Instr::EndFinally,
                Instr::Ret,
            ],
            clauses: vec![ExceptionClause {
                kind: IlClauseKind::Finally,
                try_start: 0,
                try_end: 3,
                handler_start: 3,
                handler_end: 4,
            }],
            ..Default::default()
        };
        let (fx, m) = single(vec![], TypeDesc::Void, body);
        let compiled = fx.compile(m).unwrap();
        let clause = &compiled.clauses[0];
        // ldc.i4.s (2) + pop (1) + leave.s (2)
        assert_eq!((clause.try_start, clause.try_end), (0, 5));
        assert_eq!((clause.handler_start, clause.handler_end), (5, 6));
        assert_eq!(compiled.shapes[5], Some(StackShape { height: 0, vt: 0 }));
    }

    #[test]
    fn test_leave_keeps_shape_of_abandoned_operands() {
        let body = MethodBody {
            code: vec![Instr::LdcI4(7), Instr::Leave(3), Instr::EndFinally, Instr::Ret],
            clauses: vec![ExceptionClause {
                kind: IlClauseKind::Finally,
                try_start: 0,
                try_end: 2,
                handler_start: 2,
                handler_end: 3,
            }],
            ..Default::default()
        };
        let (fx, m) = single(vec![], TypeDesc::Void, body);
        let compiled = fx.compile(m).unwrap();
        let at = |want: &[Opcode]| {
            compiled
                .instructions()
                .find(|(_, op, _)| op.is_some_and(|op| want.contains(&op)))
                .map(|(at, _, _)| at)
                .unwrap()
        };
        let leave = at(&[Opcode::Leave, Opcode::LeaveS]);
        assert_eq!(compiled.shapes[leave], Some(StackShape { height: 1, vt: 0 }));
        assert_eq!(compiled.shapes[at(&[Opcode::RetVoid])], Some(StackShape { height: 0, vt: 0 }));
    }

    #[test]
    fn test_self_tail_call_becomes_loop() {
        let mut b = MetadataBuilder::new();
        let c = b.define_class("T", None).unwrap();
        let m = b.add_method(c, MethodDef::static_("Loop", vec![TypeDesc::I4], TypeDesc::I4));
        let mut il = IlBuilder::new();
        let recurse = il.label();
        il.emit(Instr::Ldarg(0)).br_if(Cond::True, recurse);
        il.emit(Instr::LdcI4(0)).emit(Instr::Ret);
        il.mark(recurse);
        il.emit(Instr::Ldarg(0))
            .emit(Instr::LdcI4(1))
            .emit(Instr::Binary(BinOp::Sub))
            .emit(Instr::Call(m.into()))
            .emit(Instr::Ret);
        b.set_body(m, il.finish().unwrap());
        let fx = Fixture::new(b.finish().unwrap());
        let compiled = fx.compile(m).unwrap();
        let ops = ops(&compiled);
        assert!(!ops.contains(&Opcode::Call));
        assert!(ops.ends_with(&[Opcode::StargI4, Opcode::Safepoint, Opcode::BrS]));
    }

    #[test]
    fn test_empty_callee_inlined_as_pops() {
        let mut b = MetadataBuilder::new();
        let c = b.define_class("T", None).unwrap();
        let empty = b.add_method(c, MethodDef::static_("Empty", vec![TypeDesc::I4, TypeDesc::R8], TypeDesc::Void));
        b.set_body(
            empty,
            MethodBody {
                code: vec![Instr::Ret],
                ..Default::default()
            },
        );
        let m = b.add_method(c, MethodDef::static_("M", vec![], TypeDesc::Void));
        b.set_body(
            m,
            MethodBody {
                code: vec![
                    Instr::LdcI4(1),
                    Instr::LdcR8(2.0),
                    Instr::Call(empty.into()),
                    Instr::Ret,
                ],
                ..Default::default()
            },
        );
        let fx = Fixture::new(b.finish().unwrap());
        let compiled = fx.compile(m).unwrap();
        assert_eq!(
            ops(&compiled),
            vec![Opcode::LdcI41, Opcode::LdcR8, Opcode::Pop, Opcode::Pop, Opcode::RetVoid]
        );
    }

    #[test]
    fn test_string_intrinsics() {
        let mut b = MetadataBuilder::new();
        let c = b.define_class("T", None).unwrap();
        let len = b.find_method("System.String::get_Length").unwrap();
        let m = b.add_method(c, MethodDef::static_("M", vec![TypeDesc::String], TypeDesc::I4));
        b.set_body(
            m,
            MethodBody {
                code: vec![Instr::Ldarg(0), Instr::Callvirt(len.into()), Instr::Ret],
                ..Default::default()
            },
        );
        let fx = Fixture::new(b.finish().unwrap());
        assert_eq!(
            ops(&fx.compile(m).unwrap()),
            vec![Opcode::LdargO, Opcode::Strlen, Opcode::Ret]
        );
    }

    #[test]
    fn test_value_type_call_emits_vtresult() {
        let mut b = MetadataBuilder::new();
        let pair = b.define_value_type("Pair").unwrap();
        b.add_field(pair, "a", TypeDesc::I8, false);
        b.add_field(pair, "b", TypeDesc::I8, false);
        let c = b.define_class("T", None).unwrap();
        let swap = b.add_method(c, MethodDef::static_("Swap", vec![TypeDesc::Class(pair)], TypeDesc::Class(pair)));
        b.set_body(
            swap,
            MethodBody {
                code: vec![Instr::Ldarg(0), Instr::Ret],
                ..Default::default()
            },
        );
        let m = b.add_method(c, MethodDef::static_("M", vec![TypeDesc::Class(pair)], TypeDesc::Class(pair)));
        b.set_body(
            m,
            MethodBody {
                code: vec![Instr::Ldarg(0), Instr::Call(swap.into()), Instr::Ret],
                ..Default::default()
            },
        );
        let fx = Fixture::new(b.finish().unwrap());
        let compiled = fx.compile(m).unwrap();
        assert_eq!(
            ops(&compiled),
            vec![Opcode::LdargVt, Opcode::Call, Opcode::Vtresult, Opcode::RetVt]
        );
        // argument copy plus the result buffer above it
        assert_eq!(compiled.vt_size, 32);
        let vtresult = compiled
            .instructions()
            .find(|(_, op, _)| *op == Some(Opcode::Vtresult))
            .unwrap();
        assert_eq!(vtresult.2, &[16, 16]);
    }
}
