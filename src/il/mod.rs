//! Source bytecode: the verified, stack-based method bodies the transformer
//! consumes.
//!
//! Branch targets and exception-clause boundaries are instruction indices
//! into [`MethodBody::code`]. Those indices are the "source offsets" the
//! transformer maps onto internal code offsets.

pub mod asm;
mod builder;

pub use builder::{IlBuilder, Label};

use crate::metadata::{FieldId, MethodId, TypeDesc};

/// An instruction index inside a method body.
pub type Target = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    DivUn,
    Rem,
    RemUn,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    ShrUn,
    AddOvf,
    AddOvfUn,
    SubOvf,
    SubOvfUn,
    MulOvf,
    MulOvfUn,
}

impl BinOp {
    pub fn is_shift(self) -> bool {
        matches!(self, BinOp::Shl | BinOp::Shr | BinOp::ShrUn)
    }

    /// Operations defined on floating point operands.
    pub fn allows_float(self) -> bool {
        matches!(
            self,
            BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Rem
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CmpOp {
    Ceq,
    Cgt,
    CgtUn,
    Clt,
    CltUn,
}

/// Condition of a conditional branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cond {
    False,
    True,
    Eq,
    NeUn,
    Ge,
    GeUn,
    Gt,
    GtUn,
    Le,
    LeUn,
    Lt,
    LtUn,
}

impl Cond {
    pub fn is_unary(self) -> bool {
        matches!(self, Cond::False | Cond::True)
    }
}

/// Destination type of a conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConvTarget {
    I1,
    U1,
    I2,
    U2,
    I4,
    U4,
    I8,
    U8,
    I,
    U,
    R4,
    R8,
    /// `conv.r.un`: unsigned integer to float
    RUn,
}

/// A call target with its method-level generic instantiation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodRef {
    pub method: MethodId,
    pub inst: Vec<TypeDesc>,
}

impl MethodRef {
    pub fn new(method: MethodId) -> Self {
        Self {
            method,
            inst: Vec::new(),
        }
    }

    pub fn generic(method: MethodId, inst: Vec<TypeDesc>) -> Self {
        Self { method, inst }
    }
}

impl From<MethodId> for MethodRef {
    fn from(method: MethodId) -> Self {
        MethodRef::new(method)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Instr {
    Nop,
    Break,

    Ldarg(u16),
    Ldarga(u16),
    Starg(u16),
    Ldloc(u16),
    Ldloca(u16),
    Stloc(u16),

    Ldnull,
    LdcI4(i32),
    LdcI8(i64),
    LdcR4(f32),
    LdcR8(f64),
    Ldstr(String),

    Dup,
    Pop,

    Jmp(MethodRef),
    Call(MethodRef),
    Callvirt(MethodRef),
    /// `tail.` prefixed call
    TailCall(MethodRef),
    Newobj(MethodRef),
    Ret,

    Br(Target),
    BrCond(Cond, Target),
    Switch(Vec<Target>),
    Leave(Target),
    EndFinally,
    EndFilter,
    Throw,
    Rethrow,

    Binary(BinOp),
    Unary(UnOp),
    Compare(CmpOp),
    Conv(ConvTarget),
    ConvOvf(ConvTarget),
    ConvOvfUn(ConvTarget),
    /// Throw unless the float on top is finite
    Ckfinite,

    Ldind(TypeDesc),
    Stind(TypeDesc),
    Ldfld(FieldId),
    Ldflda(FieldId),
    Stfld(FieldId),
    Ldsfld(FieldId),
    Ldsflda(FieldId),
    Stsfld(FieldId),

    Box(TypeDesc),
    UnboxAny(TypeDesc),
    Castclass(TypeDesc),
    Isinst(TypeDesc),
    Initobj(TypeDesc),
    Ldobj(TypeDesc),
    Stobj(TypeDesc),

    Newarr(TypeDesc),
    Ldlen,
    Ldelem(TypeDesc),
    Ldelema(TypeDesc),
    Stelem(TypeDesc),
}

impl Instr {
    /// Branch destinations of this instruction, in operand order.
    pub fn targets(&self) -> &[Target] {
        match self {
            Instr::Br(t) | Instr::BrCond(_, t) | Instr::Leave(t) => std::slice::from_ref(t),
            Instr::Switch(ts) => ts,
            _ => &[],
        }
    }

    pub(crate) fn targets_mut(&mut self) -> &mut [Target] {
        match self {
            Instr::Br(t) | Instr::BrCond(_, t) | Instr::Leave(t) => std::slice::from_mut(t),
            Instr::Switch(ts) => ts,
            _ => &mut [],
        }
    }

    /// Whether control never continues with the next instruction.
    pub fn ends_block(&self) -> bool {
        matches!(
            self,
            Instr::Br(_)
                | Instr::Leave(_)
                | Instr::Ret
                | Instr::Jmp(_)
                | Instr::Throw
                | Instr::Rethrow
                | Instr::EndFinally
                | Instr::EndFilter
        )
    }

    /// Short mnemonic used in diagnostics.
    pub fn mnemonic(&self) -> &'static str {
        match self {
            Instr::Nop => "nop",
            Instr::Break => "break",
            Instr::Ldarg(_) => "ldarg",
            Instr::Ldarga(_) => "ldarga",
            Instr::Starg(_) => "starg",
            Instr::Ldloc(_) => "ldloc",
            Instr::Ldloca(_) => "ldloca",
            Instr::Stloc(_) => "stloc",
            Instr::Ldnull => "ldnull",
            Instr::LdcI4(_) => "ldc.i4",
            Instr::LdcI8(_) => "ldc.i8",
            Instr::LdcR4(_) => "ldc.r4",
            Instr::LdcR8(_) => "ldc.r8",
            Instr::Ldstr(_) => "ldstr",
            Instr::Dup => "dup",
            Instr::Pop => "pop",
            Instr::Jmp(_) => "jmp",
            Instr::Call(_) => "call",
            Instr::Callvirt(_) => "callvirt",
            Instr::TailCall(_) => "tail.call",
            Instr::Newobj(_) => "newobj",
            Instr::Ret => "ret",
            Instr::Br(_) => "br",
            Instr::BrCond(..) => "bcc",
            Instr::Switch(_) => "switch",
            Instr::Leave(_) => "leave",
            Instr::EndFinally => "endfinally",
            Instr::EndFilter => "endfilter",
            Instr::Throw => "throw",
            Instr::Rethrow => "rethrow",
            Instr::Binary(_) => "binop",
            Instr::Unary(_) => "unop",
            Instr::Compare(_) => "cmp",
            Instr::Conv(_) => "conv",
            Instr::ConvOvf(_) => "conv.ovf",
            Instr::ConvOvfUn(_) => "conv.ovf.un",
            Instr::Ckfinite => "ckfinite",
            Instr::Ldind(_) => "ldind",
            Instr::Stind(_) => "stind",
            Instr::Ldfld(_) => "ldfld",
            Instr::Ldflda(_) => "ldflda",
            Instr::Stfld(_) => "stfld",
            Instr::Ldsfld(_) => "ldsfld",
            Instr::Ldsflda(_) => "ldsflda",
            Instr::Stsfld(_) => "stsfld",
            Instr::Box(_) => "box",
            Instr::UnboxAny(_) => "unbox.any",
            Instr::Castclass(_) => "castclass",
            Instr::Isinst(_) => "isinst",
            Instr::Initobj(_) => "initobj",
            Instr::Ldobj(_) => "ldobj",
            Instr::Stobj(_) => "stobj",
            Instr::Newarr(_) => "newarr",
            Instr::Ldlen => "ldlen",
            Instr::Ldelem(_) => "ldelem",
            Instr::Ldelema(_) => "ldelema",
            Instr::Stelem(_) => "stelem",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClauseKind {
    Catch(TypeDesc),
    Filter { filter_start: Target },
    Finally,
    Fault,
}

/// A protected region and its handler. Ranges are half-open.
///
/// Clauses are listed innermost first; the unwinder relies on that order.
#[derive(Debug, Clone, PartialEq)]
pub struct ExceptionClause {
    pub kind: ClauseKind,
    pub try_start: Target,
    pub try_end: Target,
    pub handler_start: Target,
    pub handler_end: Target,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct MethodBody {
    pub max_stack: u16,
    pub locals: Vec<TypeDesc>,
    pub init_locals: bool,
    pub code: Vec<Instr>,
    pub clauses: Vec<ExceptionClause>,
}

impl MethodBody {
    /// A body consisting of a single `ret`.
    pub fn is_empty_return(&self) -> bool {
        self.clauses.is_empty() && matches!(self.code.as_slice(), [Instr::Ret])
    }
}
