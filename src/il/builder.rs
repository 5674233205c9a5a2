use crate::metadata::TypeDesc;

use super::{ClauseKind, ExceptionClause, Instr, MethodBody};

/// A forward-declarable position in a body under construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(usize);

/// Builds a [`MethodBody`] with symbolic branch targets.
///
/// Branch instructions are emitted with label numbers in their target slots;
/// [`IlBuilder::finish`] rewrites them to instruction indices once every
/// label is placed.
#[derive(Debug, Default)]
pub struct IlBuilder {
    code: Vec<Instr>,
    labels: Vec<Option<usize>>,
    clauses: Vec<(ClauseKind, [Label; 4], Option<Label>)>,
    locals: Vec<TypeDesc>,
    init_locals: bool,
    max_stack: Option<u16>,
}

impl IlBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn local(&mut self, ty: TypeDesc) -> u16 {
        self.locals.push(ty);
        (self.locals.len() - 1) as u16
    }

    pub fn init_locals(&mut self, init: bool) -> &mut Self {
        self.init_locals = init;
        self
    }

    pub fn max_stack(&mut self, max: u16) -> &mut Self {
        self.max_stack = Some(max);
        self
    }

    pub fn label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    /// Place `label` at the next emitted instruction.
    pub fn mark(&mut self, label: Label) -> &mut Self {
        self.labels[label.0] = Some(self.code.len());
        self
    }

    pub fn is_marked(&self, label: Label) -> bool {
        self.labels[label.0].is_some()
    }

    pub fn emit(&mut self, instr: Instr) -> &mut Self {
        self.code.push(instr);
        self
    }

    pub fn br(&mut self, label: Label) -> &mut Self {
        self.emit(Instr::Br(label.0))
    }

    pub fn br_if(&mut self, cond: super::Cond, label: Label) -> &mut Self {
        self.emit(Instr::BrCond(cond, label.0))
    }

    pub fn leave(&mut self, label: Label) -> &mut Self {
        self.emit(Instr::Leave(label.0))
    }

    pub fn switch(&mut self, labels: &[Label]) -> &mut Self {
        self.emit(Instr::Switch(labels.iter().map(|l| l.0).collect()))
    }

    /// Register a clause. Clauses must be added innermost first.
    pub fn clause(
        &mut self,
        kind: ClauseKind,
        try_start: Label,
        try_end: Label,
        handler_start: Label,
        handler_end: Label,
    ) -> &mut Self {
        self.clauses
            .push((kind, [try_start, try_end, handler_start, handler_end], None));
        self
    }

    pub fn filter_clause(
        &mut self,
        try_start: Label,
        try_end: Label,
        filter_start: Label,
        handler_start: Label,
        handler_end: Label,
    ) -> &mut Self {
        self.clauses.push((
            ClauseKind::Filter { filter_start: 0 },
            [try_start, try_end, handler_start, handler_end],
            Some(filter_start),
        ));
        self
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    /// Resolve labels and produce the body. Fails with the index of the
    /// first label that was referenced but never placed.
    pub fn finish(self) -> Result<MethodBody, usize> {
        let resolve = |label: usize| self.labels.get(label).copied().flatten().ok_or(label);

        let mut code = self.code.clone();
        for instr in &mut code {
            for target in instr.targets_mut() {
                *target = resolve(*target)?;
            }
        }

        let mut clauses = Vec::with_capacity(self.clauses.len());
        for (kind, [ts, te, hs, he], filter) in &self.clauses {
            let kind = match (kind, filter) {
                (ClauseKind::Filter { .. }, Some(f)) => ClauseKind::Filter {
                    filter_start: resolve(f.0)?,
                },
                (kind, _) => kind.clone(),
            };
            clauses.push(ExceptionClause {
                kind,
                try_start: resolve(ts.0)?,
                try_end: resolve(te.0)?,
                handler_start: resolve(hs.0)?,
                handler_end: resolve(he.0)?,
            });
        }

        Ok(MethodBody {
            max_stack: self.max_stack.unwrap_or(8),
            locals: self.locals,
            init_locals: self.init_locals,
            code,
            clauses,
        })
    }
}
