//! Line-oriented assembly syntax for method bodies.
//!
//! ```text
//! .locals init (i4, string)
//!         ldc.i4.0
//!         stloc.0
//! LOOP:   ldloc.0
//!         ldarg.0
//!         bge DONE
//!         ldloc.0
//!         ldc.i4.1
//!         add
//!         stloc.0
//!         br LOOP
//! DONE:   ldloc.0
//!         ret
//! .try START END catch System.Exception HANDLER HANDLER_END
//! ```
//!
//! Labels name instruction positions; clause directives refer to labels and
//! may appear anywhere. Clauses are kept in source order, innermost first.

use std::collections::HashMap;

use crate::error::LoadError;
use crate::metadata::{ClassId, FieldId, Metadata, MetadataBuilder, MethodId, TypeDesc};

use super::{
    BinOp, ClauseKind, CmpOp, Cond, ConvTarget, IlBuilder, Instr, Label, MethodBody, MethodRef,
    UnOp,
};

/// Name lookups needed while assembling.
pub trait Resolver {
    fn class(&self, name: &str) -> Option<ClassId>;
    fn method(&self, spec: &str) -> Option<MethodId>;
    fn field(&self, spec: &str) -> Option<FieldId>;
}

impl Resolver for MetadataBuilder {
    fn class(&self, name: &str) -> Option<ClassId> {
        self.find_class(name)
    }

    fn method(&self, spec: &str) -> Option<MethodId> {
        self.find_method(spec)
    }

    fn field(&self, spec: &str) -> Option<FieldId> {
        self.find_field(spec)
    }
}

impl Resolver for Metadata {
    fn class(&self, name: &str) -> Option<ClassId> {
        self.find_class(name)
    }

    fn method(&self, spec: &str) -> Option<MethodId> {
        self.find_method(spec)
    }

    fn field(&self, spec: &str) -> Option<FieldId> {
        self.find_field(spec)
    }
}

/// Assemble `source` into a method body.
pub fn parse(method: &str, source: &str, resolver: &dyn Resolver) -> Result<MethodBody, LoadError> {
    let mut asm = Assembler {
        method,
        resolver,
        builder: IlBuilder::new(),
        labels: HashMap::new(),
        line: 0,
    };
    for (i, raw) in source.lines().enumerate() {
        asm.line = i + 1;
        asm.line(strip_comment(raw))?;
    }
    for (name, label) in &asm.labels {
        if !asm.builder.is_marked(*label) {
            return Err(asm.error(format!("label `{name}` is never defined")));
        }
    }
    let Assembler { builder, line, .. } = asm;
    builder.finish().map_err(|_| LoadError::Asm {
        method: method.to_string(),
        line,
        message: "unresolved label".to_string(),
    })
}

struct Assembler<'a> {
    method: &'a str,
    resolver: &'a dyn Resolver,
    builder: IlBuilder,
    labels: HashMap<String, Label>,
    line: usize,
}

fn strip_comment(line: &str) -> &str {
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in line.char_indices() {
        match c {
            '\\' if in_string => escaped = !escaped,
            '"' if !escaped => in_string = !in_string,
            '/' if !in_string && line[i..].starts_with("//") => return &line[..i],
            _ => escaped = false,
        }
        if c != '\\' {
            escaped = false;
        }
    }
    line
}

impl Assembler<'_> {
    fn error(&self, message: String) -> LoadError {
        LoadError::Asm {
            method: self.method.to_string(),
            line: self.line,
            message,
        }
    }

    fn label(&mut self, name: &str) -> Label {
        if let Some(label) = self.labels.get(name) {
            return *label;
        }
        let label = self.builder.label();
        self.labels.insert(name.to_string(), label);
        label
    }

    fn line(&mut self, text: &str) -> Result<(), LoadError> {
        let mut text = text.trim();
        while let Some((head, rest)) = split_word(text) {
            match head.strip_suffix(':') {
                Some(name) if !name.is_empty() && !head.contains("::") => {
                    let label = self.label(name);
                    if self.builder.is_marked(label) {
                        return Err(self.error(format!("label `{name}` defined twice")));
                    }
                    self.builder.mark(label);
                    text = rest;
                }
                _ => break,
            }
        }
        if text.is_empty() {
            return Ok(());
        }
        if text.starts_with('.') {
            return self.directive(text);
        }
        let (mnemonic, operand) = split_word(text).unwrap_or((text, ""));
        self.instruction(mnemonic, operand.trim())
    }

    fn directive(&mut self, text: &str) -> Result<(), LoadError> {
        let (name, rest) = split_word(text).unwrap_or((text, ""));
        match name {
            ".maxstack" => {
                let n = rest
                    .trim()
                    .parse()
                    .map_err(|_| self.error(format!("bad .maxstack `{rest}`")))?;
                self.builder.max_stack(n);
            }
            ".locals" => {
                let mut rest = rest.trim();
                if let Some(r) = rest.strip_prefix("init") {
                    self.builder.init_locals(true);
                    rest = r.trim();
                }
                let inner = rest
                    .strip_prefix('(')
                    .and_then(|r| r.strip_suffix(')'))
                    .ok_or_else(|| self.error("expected `(types)` after .locals".into()))?;
                for ty in inner.split(',').map(str::trim).filter(|t| !t.is_empty()) {
                    let ty = self.ty(ty)?;
                    self.builder.local(ty);
                }
            }
            ".try" => self.try_directive(rest)?,
            other => return Err(self.error(format!("unknown directive `{other}`"))),
        }
        Ok(())
    }

    fn try_directive(&mut self, rest: &str) -> Result<(), LoadError> {
        let words: Vec<&str> = rest.split_whitespace().collect();
        let bad = || format!("malformed .try `{rest}`");
        if words.len() < 5 {
            return Err(self.error(bad()));
        }
        let ts = self.label(words[0]);
        let te = self.label(words[1]);
        match (words[2], words.len()) {
            ("catch", 6) => {
                let ty = self.ty(words[3])?;
                let hs = self.label(words[4]);
                let he = self.label(words[5]);
                self.builder.clause(ClauseKind::Catch(ty), ts, te, hs, he);
            }
            ("finally", 5) | ("fault", 5) => {
                let kind = if words[2] == "finally" {
                    ClauseKind::Finally
                } else {
                    ClauseKind::Fault
                };
                let hs = self.label(words[3]);
                let he = self.label(words[4]);
                self.builder.clause(kind, ts, te, hs, he);
            }
            ("filter", 6) => {
                let fs = self.label(words[3]);
                let hs = self.label(words[4]);
                let he = self.label(words[5]);
                self.builder.filter_clause(ts, te, fs, hs, he);
            }
            _ => return Err(self.error(bad())),
        }
        Ok(())
    }

    fn ty(&self, text: &str) -> Result<TypeDesc, LoadError> {
        TypeDesc::parse(text, &|n| self.resolver.class(n))
            .map_err(|name| self.error(format!("unknown type `{name}`")))
    }

    fn method_ref(&self, spec: &str) -> Result<MethodRef, LoadError> {
        let (spec, inst) = match (spec.find('<'), spec.find('>')) {
            (Some(open), Some(close)) if open < close => {
                let inst = spec[open + 1..close]
                    .split(',')
                    .map(|t| self.ty(t))
                    .collect::<Result<Vec<_>, _>>()?;
                (format!("{}{}", &spec[..open], &spec[close + 1..]), inst)
            }
            _ => (spec.to_string(), Vec::new()),
        };
        let method = self
            .resolver
            .method(&spec)
            .ok_or_else(|| self.error(format!("unknown method `{spec}`")))?;
        Ok(MethodRef::generic(method, inst))
    }

    fn field(&self, spec: &str) -> Result<FieldId, LoadError> {
        self.resolver
            .field(spec)
            .ok_or_else(|| self.error(format!("unknown field `{spec}`")))
    }

    fn int<T: std::str::FromStr + TryFrom<i64>>(&self, text: &str) -> Result<T, LoadError> {
        let text = text.trim();
        let parsed = match text.strip_prefix("0x") {
            Some(hex) => i64::from_str_radix(hex, 16).ok(),
            None => text.parse::<i64>().ok(),
        };
        parsed
            .and_then(|v| T::try_from(v).ok())
            .ok_or_else(|| self.error(format!("bad integer `{text}`")))
    }

    fn float(&self, text: &str) -> Result<f64, LoadError> {
        text.trim()
            .parse()
            .map_err(|_| self.error(format!("bad float `{text}`")))
    }

    fn string(&self, text: &str) -> Result<String, LoadError> {
        let inner = text
            .strip_prefix('"')
            .and_then(|t| t.strip_suffix('"'))
            .ok_or_else(|| self.error(format!("expected string literal, found `{text}`")))?;
        let mut out = String::with_capacity(inner.len());
        let mut chars = inner.chars();
        while let Some(c) = chars.next() {
            if c != '\\' {
                out.push(c);
                continue;
            }
            match chars.next() {
                Some('n') => out.push('\n'),
                Some('t') => out.push('\t'),
                Some('0') => out.push('\0'),
                Some(other) => out.push(other),
                None => return Err(self.error("dangling escape".into())),
            }
        }
        Ok(out)
    }

    fn instruction(&mut self, mnemonic: &str, operand: &str) -> Result<(), LoadError> {
        if let Some(instr) = simple_instr(mnemonic) {
            self.builder.emit(instr);
            return Ok(());
        }
        if let Some((family, n)) = short_index(mnemonic) {
            self.builder.emit(family(n));
            return Ok(());
        }

        let branch = mnemonic.strip_suffix(".s").unwrap_or(mnemonic);
        if let Some(cond) = branch_cond(branch) {
            let label = self.label(operand);
            match cond {
                None => self.builder.br(label),
                Some(cond) => self.builder.br_if(cond, label),
            };
            return Ok(());
        }
        if branch == "leave" {
            let label = self.label(operand);
            self.builder.leave(label);
            return Ok(());
        }

        let instr = match mnemonic {
            "ldarg" | "ldarg.s" => Instr::Ldarg(self.int(operand)?),
            "ldarga" | "ldarga.s" => Instr::Ldarga(self.int(operand)?),
            "starg" | "starg.s" => Instr::Starg(self.int(operand)?),
            "ldloc" | "ldloc.s" => Instr::Ldloc(self.int(operand)?),
            "ldloca" | "ldloca.s" => Instr::Ldloca(self.int(operand)?),
            "stloc" | "stloc.s" => Instr::Stloc(self.int(operand)?),
            "ldc.i4" | "ldc.i4.s" => Instr::LdcI4(self.int(operand)?),
            "ldc.i8" => Instr::LdcI8(self.int(operand)?),
            "ldc.r4" => Instr::LdcR4(self.float(operand)? as f32),
            "ldc.r8" => Instr::LdcR8(self.float(operand)?),
            "ldstr" => Instr::Ldstr(self.string(operand)?),
            "jmp" => Instr::Jmp(self.method_ref(operand)?),
            "call" => Instr::Call(self.method_ref(operand)?),
            "callvirt" => Instr::Callvirt(self.method_ref(operand)?),
            "tail.call" => Instr::TailCall(self.method_ref(operand)?),
            "newobj" => Instr::Newobj(self.method_ref(operand)?),
            "switch" => {
                let inner = operand
                    .strip_prefix('(')
                    .and_then(|o| o.strip_suffix(')'))
                    .ok_or_else(|| self.error("expected `(labels)` after switch".into()))?;
                let labels: Vec<Label> = inner
                    .split(',')
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .map(|l| self.label(l))
                    .collect();
                self.builder.switch(&labels);
                return Ok(());
            }
            "ldfld" => Instr::Ldfld(self.field(operand)?),
            "ldflda" => Instr::Ldflda(self.field(operand)?),
            "stfld" => Instr::Stfld(self.field(operand)?),
            "ldsfld" => Instr::Ldsfld(self.field(operand)?),
            "ldsflda" => Instr::Ldsflda(self.field(operand)?),
            "stsfld" => Instr::Stsfld(self.field(operand)?),
            "box" => Instr::Box(self.ty(operand)?),
            "unbox.any" => Instr::UnboxAny(self.ty(operand)?),
            "castclass" => Instr::Castclass(self.ty(operand)?),
            "isinst" => Instr::Isinst(self.ty(operand)?),
            "initobj" => Instr::Initobj(self.ty(operand)?),
            "ldobj" => Instr::Ldobj(self.ty(operand)?),
            "stobj" => Instr::Stobj(self.ty(operand)?),
            "newarr" => Instr::Newarr(self.ty(operand)?),
            "ldelem" => Instr::Ldelem(self.ty(operand)?),
            "ldelema" => Instr::Ldelema(self.ty(operand)?),
            "stelem" => Instr::Stelem(self.ty(operand)?),
            other => {
                if let Some(instr) = typed_memory_instr(other) {
                    instr
                } else if let Some(instr) = conv_instr(other) {
                    instr
                } else {
                    return Err(self.error(format!("unknown instruction `{other}`")));
                }
            }
        };
        self.builder.emit(instr);
        Ok(())
    }
}

fn split_word(text: &str) -> Option<(&str, &str)> {
    let text = text.trim_start();
    if text.is_empty() {
        return None;
    }
    Some(match text.find(char::is_whitespace) {
        Some(i) => (&text[..i], text[i..].trim_start()),
        None => (text, ""),
    })
}

fn simple_instr(mnemonic: &str) -> Option<Instr> {
    Some(match mnemonic {
        "nop" => Instr::Nop,
        "break" => Instr::Break,
        "ldnull" => Instr::Ldnull,
        "ldc.i4.m1" => Instr::LdcI4(-1),
        "dup" => Instr::Dup,
        "pop" => Instr::Pop,
        "ret" => Instr::Ret,
        "endfinally" | "endfault" => Instr::EndFinally,
        "endfilter" => Instr::EndFilter,
        "throw" => Instr::Throw,
        "rethrow" => Instr::Rethrow,
        "ldlen" => Instr::Ldlen,
        "add" => Instr::Binary(BinOp::Add),
        "sub" => Instr::Binary(BinOp::Sub),
        "mul" => Instr::Binary(BinOp::Mul),
        "div" => Instr::Binary(BinOp::Div),
        "div.un" => Instr::Binary(BinOp::DivUn),
        "rem" => Instr::Binary(BinOp::Rem),
        "rem.un" => Instr::Binary(BinOp::RemUn),
        "and" => Instr::Binary(BinOp::And),
        "or" => Instr::Binary(BinOp::Or),
        "xor" => Instr::Binary(BinOp::Xor),
        "shl" => Instr::Binary(BinOp::Shl),
        "shr" => Instr::Binary(BinOp::Shr),
        "shr.un" => Instr::Binary(BinOp::ShrUn),
        "add.ovf" => Instr::Binary(BinOp::AddOvf),
        "add.ovf.un" => Instr::Binary(BinOp::AddOvfUn),
        "sub.ovf" => Instr::Binary(BinOp::SubOvf),
        "sub.ovf.un" => Instr::Binary(BinOp::SubOvfUn),
        "mul.ovf" => Instr::Binary(BinOp::MulOvf),
        "mul.ovf.un" => Instr::Binary(BinOp::MulOvfUn),
        "neg" => Instr::Unary(UnOp::Neg),
        "not" => Instr::Unary(UnOp::Not),
        "ckfinite" => Instr::Ckfinite,
        "ceq" => Instr::Compare(CmpOp::Ceq),
        "cgt" => Instr::Compare(CmpOp::Cgt),
        "cgt.un" => Instr::Compare(CmpOp::CgtUn),
        "clt" => Instr::Compare(CmpOp::Clt),
        "clt.un" => Instr::Compare(CmpOp::CltUn),
        _ => return None,
    })
}

/// `ldarg.0`, `stloc.3`, `ldc.i4.7` and friends.
fn short_index(mnemonic: &str) -> Option<(fn(u16) -> Instr, u16)> {
    let (family, n) = mnemonic.rsplit_once('.')?;
    let n: u16 = n.parse().ok()?;
    let family: fn(u16) -> Instr = match (family, n) {
        ("ldarg", 0..=3) => Instr::Ldarg,
        ("starg", 0..=3) => Instr::Starg,
        ("ldloc", 0..=3) => Instr::Ldloc,
        ("stloc", 0..=3) => Instr::Stloc,
        ("ldc.i4", 0..=8) => |n| Instr::LdcI4(n as i32),
        _ => return None,
    };
    Some((family, n))
}

fn branch_cond(mnemonic: &str) -> Option<Option<Cond>> {
    Some(match mnemonic {
        "br" => None,
        "brfalse" | "brnull" | "brzero" => Some(Cond::False),
        "brtrue" | "brinst" => Some(Cond::True),
        "beq" => Some(Cond::Eq),
        "bne.un" => Some(Cond::NeUn),
        "bge" => Some(Cond::Ge),
        "bge.un" => Some(Cond::GeUn),
        "bgt" => Some(Cond::Gt),
        "bgt.un" => Some(Cond::GtUn),
        "ble" => Some(Cond::Le),
        "ble.un" => Some(Cond::LeUn),
        "blt" => Some(Cond::Lt),
        "blt.un" => Some(Cond::LtUn),
        _ => return None,
    })
}

fn suffix_type(suffix: &str) -> Option<TypeDesc> {
    Some(match suffix {
        "i1" => TypeDesc::I1,
        "u1" => TypeDesc::U1,
        "i2" => TypeDesc::I2,
        "u2" => TypeDesc::U2,
        "i4" => TypeDesc::I4,
        "u4" => TypeDesc::U4,
        "i8" => TypeDesc::I8,
        "u8" => TypeDesc::U8,
        "i" => TypeDesc::I,
        "u" => TypeDesc::U,
        "r4" => TypeDesc::R4,
        "r8" => TypeDesc::R8,
        "ref" => TypeDesc::Object,
        _ => return None,
    })
}

fn typed_memory_instr(mnemonic: &str) -> Option<Instr> {
    let (family, suffix) = mnemonic.split_once('.')?;
    let ty = suffix_type(suffix)?;
    Some(match family {
        "ldind" => Instr::Ldind(ty),
        "stind" => Instr::Stind(ty),
        "ldelem" => Instr::Ldelem(ty),
        "stelem" => Instr::Stelem(ty),
        _ => return None,
    })
}

fn conv_target(text: &str) -> Option<ConvTarget> {
    Some(match text {
        "i1" => ConvTarget::I1,
        "u1" => ConvTarget::U1,
        "i2" => ConvTarget::I2,
        "u2" => ConvTarget::U2,
        "i4" => ConvTarget::I4,
        "u4" => ConvTarget::U4,
        "i8" => ConvTarget::I8,
        "u8" => ConvTarget::U8,
        "i" => ConvTarget::I,
        "u" => ConvTarget::U,
        "r4" => ConvTarget::R4,
        "r8" => ConvTarget::R8,
        "r.un" => ConvTarget::RUn,
        _ => return None,
    })
}

fn conv_instr(mnemonic: &str) -> Option<Instr> {
    let rest = mnemonic.strip_prefix("conv.")?;
    if let Some(ovf) = rest.strip_prefix("ovf.") {
        return match ovf.strip_suffix(".un") {
            Some(target) => conv_target(target).map(Instr::ConvOvfUn),
            None => conv_target(ovf).map(Instr::ConvOvf),
        };
    }
    conv_target(rest).map(Instr::Conv)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::il::ExceptionClause;
    use crate::metadata::{MetadataBuilder, WellKnown};

    fn assemble(source: &str) -> MethodBody {
        let md = MetadataBuilder::new();
        parse("Test::M", source, &md).unwrap()
    }

    #[test]
    fn test_loop() {
        let body = assemble(
            r#"
            .locals init (i4)
                    ldc.i4.0
                    stloc.0
            LOOP:   ldloc.0          // counter
                    ldarg.0
                    bge.s DONE
                    ldloc.0
                    ldc.i4.1
                    add
                    stloc.0
                    br LOOP
            DONE:   ldloc.0
                    ret
            "#,
        );
        assert_eq!(body.locals, vec![TypeDesc::I4]);
        assert!(body.init_locals);
        assert_eq!(body.code[4], Instr::BrCond(Cond::Ge, 10));
        assert_eq!(body.code[9], Instr::Br(2));
        assert_eq!(body.code.len(), 12);
    }

    #[test]
    fn test_clauses_and_calls() {
        let body = assemble(
            r#"
            TS:     ldstr "boom // not a comment"
                    newobj System.Exception::.ctor(string)
                    throw
            TE:
            H:      pop
                    leave OUT
            HE:
            OUT:    call System.Console::WriteLine(i4)
                    ret
            .try TS TE catch System.Exception H HE
            "#,
        );
        assert_eq!(body.code[0], Instr::Ldstr("boom // not a comment".into()));
        assert_eq!(
            body.clauses,
            vec![ExceptionClause {
                kind: ClauseKind::Catch(TypeDesc::Class(WellKnown::Exception.id())),
                try_start: 0,
                try_end: 3,
                handler_start: 3,
                handler_end: 5,
            }]
        );
    }

    #[test]
    fn test_conversions_and_typed_memory() {
        let body = assemble("conv.ovf.u1.un\nconv.r.un\nldelem.ref\nstind.i2\nconv.i8\n");
        assert_eq!(
            body.code,
            vec![
                Instr::ConvOvfUn(ConvTarget::U1),
                Instr::Conv(ConvTarget::RUn),
                Instr::Ldelem(TypeDesc::Object),
                Instr::Stind(TypeDesc::I2),
                Instr::Conv(ConvTarget::I8),
            ]
        );
    }

    #[test]
    fn test_unknown_label_is_error() {
        let md = MetadataBuilder::new();
        let err = parse("Test::M", "br NOWHERE\n", &md).unwrap_err();
        assert!(err.to_string().contains("NOWHERE"));
    }

    #[test]
    fn test_unknown_instruction_reports_line() {
        let md = MetadataBuilder::new();
        match parse("Test::M", "nop\nfrobnicate\n", &md) {
            Err(LoadError::Asm { line, .. }) => assert_eq!(line, 2),
            other => panic!("unexpected {other:?}"),
        }
    }
}
