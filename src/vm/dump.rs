//! Disassembler for compiled methods.

use std::fmt::Write;

use crate::metadata::Metadata;

use super::heap::Heap;
use super::method::{ClauseKind, CompiledMethod, DataItem, MethodTable, RetKind};
use super::opcodes::{Operands, read_i32, read_u32, read_u64};

// ============================================================================
// Compiled Method Disassembler
// ============================================================================

pub struct Disassembler<'a> {
    method: &'a CompiledMethod,
    metadata: &'a Metadata,
    methods: &'a MethodTable,
    heap: &'a Heap,
    output: String,
}

impl<'a> Disassembler<'a> {
    pub fn new(method: &'a CompiledMethod, metadata: &'a Metadata, methods: &'a MethodTable, heap: &'a Heap) -> Self {
        Self {
            method,
            metadata,
            methods,
            heap,
            output: String::new(),
        }
    }

    pub fn disassemble(&mut self) -> &str {
        let m = self.method;
        let ret = match m.ret {
            RetKind::Void => "void".to_string(),
            RetKind::Value(mint) => format!("{mint:?}").to_lowercase(),
            RetKind::Vt(size) => format!("vt[{size}]"),
        };
        let _ = writeln!(
            self.output,
            "== {} (args: {}, locals: {}, vt: {}, max_stack: {}, ret: {}) ==",
            m.name,
            m.args.len(),
            m.locals_size,
            m.vt_size,
            m.max_stack,
            ret
        );
        let code = &m.code;
        for (at, op, operands) in m.instructions() {
            let _ = write!(self.output, "{at:04x}: ");
            let Some(op) = op else {
                let _ = writeln!(self.output, "<bad opcode {:#06x}>", code[at]);
                continue;
            };
            self.output.push_str(op.name());
            self.operands(at, op.operands(), operands);
            self.output.push('\n');
        }
        for clause in m.clauses.iter() {
            let kind = match &clause.kind {
                ClauseKind::Catch(ty) => format!("catch {}", self.metadata.type_name(ty)),
                ClauseKind::Filter { filter_start } => format!("filter {filter_start:04x}"),
                ClauseKind::Finally => "finally".to_string(),
                ClauseKind::Fault => "fault".to_string(),
            };
            let _ = writeln!(
                self.output,
                ".try {:04x}..{:04x} {} {:04x}..{:04x}",
                clause.try_start, clause.try_end, kind, clause.handler_start, clause.handler_end
            );
        }
        &self.output
    }

    fn operands(&mut self, at: usize, shape: Operands, words: &[u16]) {
        let target = |delta: i64| (at as i64 + delta) as usize;
        match shape {
            Operands::None => {}
            Operands::U16 => {
                let _ = write!(self.output, " {}", words[0]);
            }
            Operands::U16x2 => {
                let _ = write!(self.output, " {}, {}", words[0], words[1]);
            }
            Operands::I16 => {
                let _ = write!(self.output, " {}", words[0] as i16);
            }
            Operands::I32 => {
                let _ = write!(self.output, " {}", read_i32(words, 0));
            }
            Operands::I64 => {
                let _ = write!(self.output, " {}", read_u64(words, 0) as i64);
            }
            Operands::F64 => {
                let _ = write!(self.output, " {:?}", f64::from_bits(read_u64(words, 0)));
            }
            Operands::Data => {
                let item = self.item(words[0]);
                let _ = write!(self.output, " {item}");
            }
            Operands::DataU16 => {
                let item = self.item(words[0]);
                let _ = write!(self.output, " {item}, {}", words[1]);
            }
            Operands::ShortBranch => {
                let _ = write!(self.output, " {:04x}", target(words[0] as i16 as i64));
            }
            Operands::LongBranch => {
                let _ = write!(self.output, " {:04x}", target(read_i32(words, 0) as i64));
            }
            Operands::Switch => {
                let count = read_u32(words, 0) as usize;
                let targets: Vec<String> = (0..count)
                    .map(|i| format!("{:04x}", target(read_i32(words, 2 + 2 * i) as i64)))
                    .collect();
                let _ = write!(self.output, " ({})", targets.join(", "));
            }
        }
    }

    fn item(&self, index: u16) -> String {
        let Some(item) = self.method.data_items.get(index as usize) else {
            return format!("[{index}] <?>");
        };
        let text = match item {
            DataItem::Method(handle) => {
                if (handle.0 as usize) < self.methods.len() {
                    self.methods.get(*handle).name.clone()
                } else {
                    "<?>".to_string()
                }
            }
            DataItem::Class(class) => self.metadata.class(*class).name.clone(),
            DataItem::Field(field) => {
                let f = self.metadata.field(*field);
                format!("{}::{}", self.metadata.class(f.owner).name, f.name)
            }
            DataItem::Str(s) => {
                let text = self.heap.get(*s).and_then(|o| o.to_string_lossy()).unwrap_or_default();
                format!("\"{}\"", text.replace('\n', "\\n").replace('\t', "\\t"))
            }
            DataItem::Type(ty) => self.metadata.type_name(ty),
        };
        format!("[{index}] {text}")
    }
}

/// Format a compiled method as text.
pub fn disassemble(method: &CompiledMethod, metadata: &Metadata, methods: &MethodTable, heap: &Heap) -> String {
    Disassembler::new(method, metadata, methods, heap).disassemble().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::il::{BinOp, Cond, Instr, MethodBody};
    use crate::metadata::{MetadataBuilder, MethodDef, MethodImpl, TypeDesc};
    use crate::vm::Runtime;

    #[test]
    fn test_disassemble_branches_and_constants() {
        let mut b = MetadataBuilder::new();
        let class = b.define_class("Demo", None).unwrap();
        let m = b.add_method(class, MethodDef::static_("Max", vec![TypeDesc::I4, TypeDesc::I4], TypeDesc::I4));
        b.set_impl(
            m,
            MethodImpl::Il(MethodBody {
                code: vec![
                    Instr::Ldarg(0),
                    Instr::Ldarg(1),
                    Instr::BrCond(Cond::Ge, 5),
                    Instr::Ldarg(1),
                    Instr::Ret,
                    Instr::Ldarg(0),
                    Instr::LdcI4(1),
                    Instr::Binary(BinOp::Mul),
                    Instr::Ret,
                ],
                ..MethodBody::default()
            }),
        );
        let rt = Runtime::new(b.finish().unwrap());
        let compiled = rt.compiled_method(m).unwrap();
        let text = disassemble(&compiled, rt.metadata(), rt.methods(), rt.heap());
        assert!(text.starts_with("== Demo::Max (args: 2"), "{text}");
        assert!(text.contains("bge.i4"), "{text}");
        assert!(text.contains("\nret") || text.contains(": ret"), "{text}");
    }
}
