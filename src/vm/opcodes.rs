//! Internal instruction catalog.
//!
//! Every instruction is one 16-bit opcode word followed by a fixed number of
//! operand words given by its [`Operands`] shape. `switch` is the only
//! variable-length instruction: a two-word case count followed by two words
//! per case.
//!
//! Families specialized by storage type (`ldloc.*`, `ldfld.*`, ...) are laid
//! out in [`MintType`] order so `family + mint` selects the member.

/// Storage type of a slot in a frame, object, array or static block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MintType {
    I1,
    U1,
    I2,
    U2,
    I4,
    I8,
    R4,
    R8,
    /// Object reference
    O,
    /// Managed or unmanaged pointer, native int
    P,
    /// Value type, copied by size
    Vt,
}

impl MintType {
    pub const ALL: [MintType; 11] = [
        MintType::I1,
        MintType::U1,
        MintType::I2,
        MintType::U2,
        MintType::I4,
        MintType::I8,
        MintType::R4,
        MintType::R8,
        MintType::O,
        MintType::P,
        MintType::Vt,
    ];

    pub fn from_u16(n: u16) -> Option<MintType> {
        Self::ALL.get(n as usize).copied()
    }

    /// Bytes occupied in memory. Value types report 0; their size travels
    /// as an operand.
    pub fn size(self) -> usize {
        match self {
            MintType::I1 | MintType::U1 => 1,
            MintType::I2 | MintType::U2 => 2,
            MintType::I4 | MintType::R4 => 4,
            MintType::I8 | MintType::R8 | MintType::O | MintType::P => 8,
            MintType::Vt => 0,
        }
    }
}

/// Operand layout following the opcode word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operands {
    None,
    U16,
    U16x2,
    I16,
    I32,
    I64,
    F64,
    /// Data-item index
    Data,
    /// Data-item index and a 16-bit immediate
    DataU16,
    /// 16-bit signed delta from the instruction start
    ShortBranch,
    /// 32-bit signed delta from the instruction start, low word first
    LongBranch,
    Switch,
}

impl Operands {
    /// Operand words, or `None` for the variable-length switch.
    pub fn words(self) -> Option<usize> {
        Some(match self {
            Operands::None => 0,
            Operands::U16 | Operands::I16 | Operands::Data | Operands::ShortBranch => 1,
            Operands::U16x2 | Operands::I32 | Operands::DataU16 | Operands::LongBranch => 2,
            Operands::I64 | Operands::F64 => 4,
            Operands::Switch => return None,
        })
    }
}

macro_rules! opcodes {
    ($($variant:ident = $name:literal, $shape:ident;)*) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u16)]
        pub enum Opcode {
            $($variant,)*
        }

        impl Opcode {
            pub const ALL: &'static [Opcode] = &[$(Opcode::$variant,)*];

            pub fn name(self) -> &'static str {
                match self {
                    $(Opcode::$variant => $name,)*
                }
            }

            pub fn operands(self) -> Operands {
                match self {
                    $(Opcode::$variant => Operands::$shape,)*
                }
            }
        }
    };
}

opcodes! {
    Nop = "nop", None;
    Break = "break", None;
    Safepoint = "safepoint", None;
    InitLocals = "initlocals", U16x2;
    Ldnull = "ldnull", None;
    LdcI4M1 = "ldc.i4.m1", None;
    LdcI40 = "ldc.i4.0", None;
    LdcI41 = "ldc.i4.1", None;
    LdcI4S = "ldc.i4.s", I16;
    LdcI4 = "ldc.i4", I32;
    LdcI8 = "ldc.i8", I64;
    LdcR4 = "ldc.r4", I32;
    LdcR8 = "ldc.r8", F64;
    Ldstr = "ldstr", Data;
    Dup = "dup", None;
    DupVt = "dup.vt", U16;
    Pop = "pop", None;
    PopVt = "pop.vt", U16;
    LdargI1 = "ldarg.i1", U16;
    LdargU1 = "ldarg.u1", U16;
    LdargI2 = "ldarg.i2", U16;
    LdargU2 = "ldarg.u2", U16;
    LdargI4 = "ldarg.i4", U16;
    LdargI8 = "ldarg.i8", U16;
    LdargR4 = "ldarg.r4", U16;
    LdargR8 = "ldarg.r8", U16;
    LdargO = "ldarg.o", U16;
    LdargP = "ldarg.p", U16;
    LdargVt = "ldarg.vt", U16x2;
    StargI1 = "starg.i1", U16;
    StargU1 = "starg.u1", U16;
    StargI2 = "starg.i2", U16;
    StargU2 = "starg.u2", U16;
    StargI4 = "starg.i4", U16;
    StargI8 = "starg.i8", U16;
    StargR4 = "starg.r4", U16;
    StargR8 = "starg.r8", U16;
    StargO = "starg.o", U16;
    StargP = "starg.p", U16;
    StargVt = "starg.vt", U16x2;
    Ldarga = "ldarga", U16;
    LdlocI1 = "ldloc.i1", U16;
    LdlocU1 = "ldloc.u1", U16;
    LdlocI2 = "ldloc.i2", U16;
    LdlocU2 = "ldloc.u2", U16;
    LdlocI4 = "ldloc.i4", U16;
    LdlocI8 = "ldloc.i8", U16;
    LdlocR4 = "ldloc.r4", U16;
    LdlocR8 = "ldloc.r8", U16;
    LdlocO = "ldloc.o", U16;
    LdlocP = "ldloc.p", U16;
    LdlocVt = "ldloc.vt", U16x2;
    StlocI1 = "stloc.i1", U16;
    StlocU1 = "stloc.u1", U16;
    StlocI2 = "stloc.i2", U16;
    StlocU2 = "stloc.u2", U16;
    StlocI4 = "stloc.i4", U16;
    StlocI8 = "stloc.i8", U16;
    StlocR4 = "stloc.r4", U16;
    StlocR8 = "stloc.r8", U16;
    StlocO = "stloc.o", U16;
    StlocP = "stloc.p", U16;
    StlocVt = "stloc.vt", U16x2;
    Ldloca = "ldloca", U16;
    LdfldI1 = "ldfld.i1", U16;
    LdfldU1 = "ldfld.u1", U16;
    LdfldI2 = "ldfld.i2", U16;
    LdfldU2 = "ldfld.u2", U16;
    LdfldI4 = "ldfld.i4", U16;
    LdfldI8 = "ldfld.i8", U16;
    LdfldR4 = "ldfld.r4", U16;
    LdfldR8 = "ldfld.r8", U16;
    LdfldO = "ldfld.o", U16;
    LdfldP = "ldfld.p", U16;
    LdfldVt = "ldfld.vt", U16x2;
    StfldI1 = "stfld.i1", U16;
    StfldU1 = "stfld.u1", U16;
    StfldI2 = "stfld.i2", U16;
    StfldU2 = "stfld.u2", U16;
    StfldI4 = "stfld.i4", U16;
    StfldI8 = "stfld.i8", U16;
    StfldR4 = "stfld.r4", U16;
    StfldR8 = "stfld.r8", U16;
    StfldO = "stfld.o", U16;
    StfldP = "stfld.p", U16;
    StfldVt = "stfld.vt", U16x2;
    Ldflda = "ldflda", U16;
    LdsfldI1 = "ldsfld.i1", Data;
    LdsfldU1 = "ldsfld.u1", Data;
    LdsfldI2 = "ldsfld.i2", Data;
    LdsfldU2 = "ldsfld.u2", Data;
    LdsfldI4 = "ldsfld.i4", Data;
    LdsfldI8 = "ldsfld.i8", Data;
    LdsfldR4 = "ldsfld.r4", Data;
    LdsfldR8 = "ldsfld.r8", Data;
    LdsfldO = "ldsfld.o", Data;
    LdsfldP = "ldsfld.p", Data;
    LdsfldVt = "ldsfld.vt", DataU16;
    StsfldI1 = "stsfld.i1", Data;
    StsfldU1 = "stsfld.u1", Data;
    StsfldI2 = "stsfld.i2", Data;
    StsfldU2 = "stsfld.u2", Data;
    StsfldI4 = "stsfld.i4", Data;
    StsfldI8 = "stsfld.i8", Data;
    StsfldR4 = "stsfld.r4", Data;
    StsfldR8 = "stsfld.r8", Data;
    StsfldO = "stsfld.o", Data;
    StsfldP = "stsfld.p", Data;
    StsfldVt = "stsfld.vt", DataU16;
    Ldsflda = "ldsflda", Data;
    LdindI1 = "ldind.i1", None;
    LdindU1 = "ldind.u1", None;
    LdindI2 = "ldind.i2", None;
    LdindU2 = "ldind.u2", None;
    LdindI4 = "ldind.i4", None;
    LdindI8 = "ldind.i8", None;
    LdindR4 = "ldind.r4", None;
    LdindR8 = "ldind.r8", None;
    LdindO = "ldind.o", None;
    LdindP = "ldind.p", None;
    StindI1 = "stind.i1", None;
    StindU1 = "stind.u1", None;
    StindI2 = "stind.i2", None;
    StindU2 = "stind.u2", None;
    StindI4 = "stind.i4", None;
    StindI8 = "stind.i8", None;
    StindR4 = "stind.r4", None;
    StindR8 = "stind.r8", None;
    StindO = "stind.o", None;
    StindP = "stind.p", None;
    LdobjVt = "ldobj.vt", U16;
    StobjVt = "stobj.vt", U16;
    Initobj = "initobj", U16;
    Newarr = "newarr", Data;
    Ldlen = "ldlen", None;
    LdelemI1 = "ldelem.i1", None;
    LdelemU1 = "ldelem.u1", None;
    LdelemI2 = "ldelem.i2", None;
    LdelemU2 = "ldelem.u2", None;
    LdelemI4 = "ldelem.i4", None;
    LdelemI8 = "ldelem.i8", None;
    LdelemR4 = "ldelem.r4", None;
    LdelemR8 = "ldelem.r8", None;
    LdelemO = "ldelem.o", None;
    LdelemP = "ldelem.p", None;
    LdelemVt = "ldelem.vt", U16;
    StelemI1 = "stelem.i1", None;
    StelemU1 = "stelem.u1", None;
    StelemI2 = "stelem.i2", None;
    StelemU2 = "stelem.u2", None;
    StelemI4 = "stelem.i4", None;
    StelemI8 = "stelem.i8", None;
    StelemR4 = "stelem.r4", None;
    StelemR8 = "stelem.r8", None;
    StelemO = "stelem.o", None;
    StelemP = "stelem.p", None;
    StelemVt = "stelem.vt", U16;
    Ldelema = "ldelema", U16;
    Box = "box", DataU16;
    BoxVt = "box.vt", DataU16;
    UnboxAny = "unbox.any", DataU16;
    UnboxAnyVt = "unbox.any.vt", DataU16;
    Castclass = "castclass", Data;
    Isinst = "isinst", Data;
    Strlen = "strlen", None;
    Getchr = "getchr", None;
    Call = "call", Data;
    Callvirt = "callvirt", Data;
    TailCall = "tailcall", Data;
    Jmp = "jmp", Data;
    Newobj = "newobj", Data;
    NewobjVt = "newobj.vt", DataU16;
    Vtresult = "vtresult", U16x2;
    Ckthis = "ckthis", U16;
    Ret = "ret", None;
    RetVoid = "ret.void", None;
    RetVt = "ret.vt", U16;
    Br = "br", LongBranch;
    BrS = "br.s", ShortBranch;
    BrfalseI4 = "brfalse.i4", LongBranch;
    BrfalseI4S = "brfalse.i4.s", ShortBranch;
    BrtrueI4 = "brtrue.i4", LongBranch;
    BrtrueI4S = "brtrue.i4.s", ShortBranch;
    BrfalseI8 = "brfalse.i8", LongBranch;
    BrfalseI8S = "brfalse.i8.s", ShortBranch;
    BrtrueI8 = "brtrue.i8", LongBranch;
    BrtrueI8S = "brtrue.i8.s", ShortBranch;
    BrfalseO = "brfalse.o", LongBranch;
    BrfalseOS = "brfalse.o.s", ShortBranch;
    BrtrueO = "brtrue.o", LongBranch;
    BrtrueOS = "brtrue.o.s", ShortBranch;
    BeqI4 = "beq.i4", LongBranch;
    BeqI4S = "beq.i4.s", ShortBranch;
    BneUnI4 = "bne.un.i4", LongBranch;
    BneUnI4S = "bne.un.i4.s", ShortBranch;
    BgeI4 = "bge.i4", LongBranch;
    BgeI4S = "bge.i4.s", ShortBranch;
    BgeUnI4 = "bge.un.i4", LongBranch;
    BgeUnI4S = "bge.un.i4.s", ShortBranch;
    BgtI4 = "bgt.i4", LongBranch;
    BgtI4S = "bgt.i4.s", ShortBranch;
    BgtUnI4 = "bgt.un.i4", LongBranch;
    BgtUnI4S = "bgt.un.i4.s", ShortBranch;
    BleI4 = "ble.i4", LongBranch;
    BleI4S = "ble.i4.s", ShortBranch;
    BleUnI4 = "ble.un.i4", LongBranch;
    BleUnI4S = "ble.un.i4.s", ShortBranch;
    BltI4 = "blt.i4", LongBranch;
    BltI4S = "blt.i4.s", ShortBranch;
    BltUnI4 = "blt.un.i4", LongBranch;
    BltUnI4S = "blt.un.i4.s", ShortBranch;
    BeqI8 = "beq.i8", LongBranch;
    BeqI8S = "beq.i8.s", ShortBranch;
    BneUnI8 = "bne.un.i8", LongBranch;
    BneUnI8S = "bne.un.i8.s", ShortBranch;
    BgeI8 = "bge.i8", LongBranch;
    BgeI8S = "bge.i8.s", ShortBranch;
    BgeUnI8 = "bge.un.i8", LongBranch;
    BgeUnI8S = "bge.un.i8.s", ShortBranch;
    BgtI8 = "bgt.i8", LongBranch;
    BgtI8S = "bgt.i8.s", ShortBranch;
    BgtUnI8 = "bgt.un.i8", LongBranch;
    BgtUnI8S = "bgt.un.i8.s", ShortBranch;
    BleI8 = "ble.i8", LongBranch;
    BleI8S = "ble.i8.s", ShortBranch;
    BleUnI8 = "ble.un.i8", LongBranch;
    BleUnI8S = "ble.un.i8.s", ShortBranch;
    BltI8 = "blt.i8", LongBranch;
    BltI8S = "blt.i8.s", ShortBranch;
    BltUnI8 = "blt.un.i8", LongBranch;
    BltUnI8S = "blt.un.i8.s", ShortBranch;
    BeqR8 = "beq.r8", LongBranch;
    BeqR8S = "beq.r8.s", ShortBranch;
    BneUnR8 = "bne.un.r8", LongBranch;
    BneUnR8S = "bne.un.r8.s", ShortBranch;
    BgeR8 = "bge.r8", LongBranch;
    BgeR8S = "bge.r8.s", ShortBranch;
    BgeUnR8 = "bge.un.r8", LongBranch;
    BgeUnR8S = "bge.un.r8.s", ShortBranch;
    BgtR8 = "bgt.r8", LongBranch;
    BgtR8S = "bgt.r8.s", ShortBranch;
    BgtUnR8 = "bgt.un.r8", LongBranch;
    BgtUnR8S = "bgt.un.r8.s", ShortBranch;
    BleR8 = "ble.r8", LongBranch;
    BleR8S = "ble.r8.s", ShortBranch;
    BleUnR8 = "ble.un.r8", LongBranch;
    BleUnR8S = "ble.un.r8.s", ShortBranch;
    BltR8 = "blt.r8", LongBranch;
    BltR8S = "blt.r8.s", ShortBranch;
    BltUnR8 = "blt.un.r8", LongBranch;
    BltUnR8S = "blt.un.r8.s", ShortBranch;
    BeqO = "beq.o", LongBranch;
    BeqOS = "beq.o.s", ShortBranch;
    BneUnO = "bne.un.o", LongBranch;
    BneUnOS = "bne.un.o.s", ShortBranch;
    Switch = "switch", Switch;
    Leave = "leave", LongBranch;
    LeaveS = "leave.s", ShortBranch;
    EndFinally = "endfinally", None;
    EndFilter = "endfilter", None;
    Throw = "throw", None;
    Rethrow = "rethrow", None;
    AddI4 = "add.i4", None;
    SubI4 = "sub.i4", None;
    MulI4 = "mul.i4", None;
    DivI4 = "div.i4", None;
    DivUnI4 = "div.un.i4", None;
    RemI4 = "rem.i4", None;
    RemUnI4 = "rem.un.i4", None;
    AndI4 = "and.i4", None;
    OrI4 = "or.i4", None;
    XorI4 = "xor.i4", None;
    ShlI4 = "shl.i4", None;
    ShrI4 = "shr.i4", None;
    ShrUnI4 = "shr.un.i4", None;
    AddOvfI4 = "add.ovf.i4", None;
    AddOvfUnI4 = "add.ovf.un.i4", None;
    SubOvfI4 = "sub.ovf.i4", None;
    SubOvfUnI4 = "sub.ovf.un.i4", None;
    MulOvfI4 = "mul.ovf.i4", None;
    MulOvfUnI4 = "mul.ovf.un.i4", None;
    AddI8 = "add.i8", None;
    SubI8 = "sub.i8", None;
    MulI8 = "mul.i8", None;
    DivI8 = "div.i8", None;
    DivUnI8 = "div.un.i8", None;
    RemI8 = "rem.i8", None;
    RemUnI8 = "rem.un.i8", None;
    AndI8 = "and.i8", None;
    OrI8 = "or.i8", None;
    XorI8 = "xor.i8", None;
    ShlI8 = "shl.i8", None;
    ShrI8 = "shr.i8", None;
    ShrUnI8 = "shr.un.i8", None;
    AddOvfI8 = "add.ovf.i8", None;
    AddOvfUnI8 = "add.ovf.un.i8", None;
    SubOvfI8 = "sub.ovf.i8", None;
    SubOvfUnI8 = "sub.ovf.un.i8", None;
    MulOvfI8 = "mul.ovf.i8", None;
    MulOvfUnI8 = "mul.ovf.un.i8", None;
    AddR8 = "add.r8", None;
    SubR8 = "sub.r8", None;
    MulR8 = "mul.r8", None;
    DivR8 = "div.r8", None;
    RemR8 = "rem.r8", None;
    NegI4 = "neg.i4", None;
    NegI8 = "neg.i8", None;
    NegR8 = "neg.r8", None;
    NotI4 = "not.i4", None;
    NotI8 = "not.i8", None;
    CeqI4 = "ceq.i4", None;
    CgtI4 = "cgt.i4", None;
    CgtUnI4 = "cgt.un.i4", None;
    CltI4 = "clt.i4", None;
    CltUnI4 = "clt.un.i4", None;
    CeqI8 = "ceq.i8", None;
    CgtI8 = "cgt.i8", None;
    CgtUnI8 = "cgt.un.i8", None;
    CltI8 = "clt.i8", None;
    CltUnI8 = "clt.un.i8", None;
    CeqR8 = "ceq.r8", None;
    CgtR8 = "cgt.r8", None;
    CgtUnR8 = "cgt.un.r8", None;
    CltR8 = "clt.r8", None;
    CltUnR8 = "clt.un.r8", None;
    CeqO = "ceq.o", None;
    CgtUnO = "cgt.un.o", None;
    CltUnO = "clt.un.o", None;
    ConvI4 = "conv.i4", U16;
    ConvI8 = "conv.i8", U16;
    ConvR8 = "conv.r8", U16;
    ConvOvfI4 = "conv.ovf.i4", U16;
    ConvOvfI8 = "conv.ovf.i8", U16;
    ConvOvfR8 = "conv.ovf.r8", U16;
    ConvOvfUnI4 = "conv.ovf.un.i4", U16;
    ConvOvfUnI8 = "conv.ovf.un.i8", U16;
    WidenI4Under = "widen.i4.under", None;
    Ckfinite = "ckfinite", None;
}

impl Opcode {
    #[inline]
    pub fn from_u16(word: u16) -> Option<Opcode> {
        Self::ALL.get(word as usize).copied()
    }

    /// Member of a type-specialized family: `family` must be the `.i1`
    /// member of a family laid out in [`MintType`] order.
    pub fn specialize(family: Opcode, mint: MintType) -> Opcode {
        Self::ALL[family as usize + mint as usize]
    }

    /// Inverse of [`Opcode::specialize`].
    pub fn mint_in(self, family: Opcode) -> MintType {
        MintType::ALL[self as usize - family as usize]
    }

    pub fn is_branch(self) -> bool {
        matches!(
            self.operands(),
            Operands::ShortBranch | Operands::LongBranch | Operands::Switch
        )
    }
}

/// Total words of the instruction starting at `at`.
pub fn instr_len(code: &[u16], at: usize) -> usize {
    match Opcode::from_u16(code[at]).map(Opcode::operands) {
        Some(Operands::Switch) => 3 + 2 * read_u32(code, at + 1) as usize,
        Some(shape) => 1 + shape.words().unwrap_or(0),
        None => 1,
    }
}

#[inline]
pub fn read_u32(code: &[u16], at: usize) -> u32 {
    code[at] as u32 | (code[at + 1] as u32) << 16
}

#[inline]
pub fn read_i32(code: &[u16], at: usize) -> i32 {
    read_u32(code, at) as i32
}

#[inline]
pub fn read_u64(code: &[u16], at: usize) -> u64 {
    read_u32(code, at) as u64 | (read_u32(code, at + 2) as u64) << 32
}

pub fn push_u32(code: &mut Vec<u16>, value: u32) {
    code.push(value as u16);
    code.push((value >> 16) as u16);
}

pub fn push_u64(code: &mut Vec<u16>, value: u64) {
    push_u32(code, value as u32);
    push_u32(code, (value >> 32) as u32);
}
