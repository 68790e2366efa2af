//! Translation of taint labels into SMT expressions.
//!
//! The parser owns all per-run symbolic state: the label-to-expression
//! memo arena, recorded memcmp contents, the accumulated path predicate and
//! the task table. `restart` is the only invalidation point.

use crate::{
    label::*,
    solver::{Task, TaskId},
    HashMap, HashSet, Label,
};
use thiserror::Error;
use z3::ast::{Ast, Bool, BV};
use z3::Context;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("invalid label {0}")]
    InvalidLabel(Label),
    #[error("label {0} out of table range")]
    OutOfRange(Label),
    #[error("unknown op {op:#x} for label {label}")]
    UnknownOp { label: Label, op: u16 },
    #[error("cyclic label reference at {0}")]
    Cycle(Label),
    #[error("width mismatch for label {label}: {lhs} vs {rhs}")]
    WidthMismatch { label: Label, lhs: u32, rhs: u32 },
    #[error("input offset {offset} out of range for label {label}")]
    BadOffset { label: Label, offset: u64 },
    #[error("load source label {at} of label {label} is not an input byte")]
    BadLoad { label: Label, at: Label },
    #[error("no memcmp content recorded for label {0}")]
    MissingMemcmp(Label),
    #[error("memcmp content length {got} does not match operand size {want} for label {label}")]
    MemcmpLength { label: Label, want: usize, got: usize },
    #[error("hypothetical trace has no usable steps")]
    EmptyTrace,
    #[error("no input bound, restart the parser first")]
    NoInput,
}

/// One directed step of a hypothetical trace.
#[derive(Debug, Clone, Copy)]
pub struct TraceCond {
    pub label: Label,
    pub is_true: bool,
}

/// Facade over the label table and the SMT engine.
///
/// Single-owner, not reentrant; the driver thread is the only caller.
pub struct ParserSolver<'ctx> {
    pub(crate) ctx: &'ctx Context,
    table: UnionTable<'ctx>,
    pub(crate) input: Vec<u8>,
    pub(crate) strict: bool,

    memo: HashMap<Label, BV<'ctx>>,
    deps: HashMap<Label, HashSet<u32>>,
    pub(crate) byte_vars: HashMap<u32, BV<'ctx>>,
    memcmp: HashMap<Label, Vec<u8>>,
    nested: Vec<(Bool<'ctx>, HashSet<u32>)>,

    pub(crate) tasks: HashMap<TaskId, Task<'ctx>>,
    next_task: TaskId,
}

impl<'ctx> ParserSolver<'ctx> {
    pub fn new(ctx: &'ctx Context, table: UnionTable<'ctx>) -> Self {
        Self {
            ctx,
            table,
            input: Vec::new(),
            strict: true,
            memo: HashMap::default(),
            deps: HashMap::default(),
            byte_vars: HashMap::default(),
            memcmp: HashMap::default(),
            nested: Vec::new(),
            tasks: HashMap::default(),
            next_task: 0,
        }
    }

    /// Bind the parser to the byte-level inputs of the current run and drop
    /// all per-run state. Must be called once per run before any `parse_*`.
    pub fn restart(&mut self, inputs: &[&[u8]]) -> Result<(), ParseError> {
        self.input.clear();
        for chunk in inputs {
            self.input.extend_from_slice(chunk);
        }
        if self.input.is_empty() {
            return Err(ParseError::NoInput);
        }
        self.memo.clear();
        self.deps.clear();
        self.byte_vars.clear();
        self.memcmp.clear();
        self.nested.clear();
        self.tasks.clear();
        Ok(())
    }

    /// In strict mode only byte assignments in a task's dependency set are
    /// emitted; reward evaluation turns this off to surface don't-care bytes.
    pub fn set_strict_value_filtering(&mut self, strict: bool) {
        self.strict = strict;
    }

    /// Record the concrete operand of a symbolic memcmp.
    pub fn record_memcmp(&mut self, label: Label, content: &[u8]) {
        self.memcmp.insert(label, content.to_vec());
    }

    /// Build tasks that flip the branch observed as `observed` at `label`.
    pub fn parse_cond(
        &mut self,
        label: Label,
        observed: u8,
        add_nested: bool,
    ) -> Result<Vec<TaskId>, ParseError> {
        let bv = self.reify(label)?;
        let cond = self.to_bool(&bv);
        let observed_expr = if observed != 0 { cond.clone() } else { cond.not() };
        let flip = observed_expr.clone().not();

        let mut deps = self.deps[&label].clone();
        let nested = if add_nested {
            for (_, d) in &self.nested {
                deps.extend(d.iter().copied());
            }
            self.nested.iter().map(|(p, _)| p.clone()).collect()
        } else {
            Vec::new()
        };

        let id = self.add_task(Task {
            predicate: flip,
            nested,
            deps,
        });

        if add_nested {
            let d = self.deps[&label].clone();
            self.nested.push((observed_expr, d));
        }
        Ok(vec![id])
    }

    /// Build tasks that drive a symbolic pointer index out of bounds.
    ///
    /// Bounds are checked on byte offsets: the access touches
    /// `index * elem_size + current_offset` against `num_elems * elem_size`.
    #[allow(clippy::too_many_arguments)]
    pub fn parse_gep(
        &mut self,
        _ptr_label: Label,
        _ptr: u64,
        index_label: Label,
        index: i64,
        num_elems: u64,
        elem_size: u64,
        current_offset: i64,
        emit: bool,
    ) -> Result<Vec<TaskId>, ParseError> {
        let idx = self.reify(index_label)?;
        let w = idx.get_size();
        let idx64 = match w.cmp(&64) {
            std::cmp::Ordering::Less => idx.sign_ext(64 - w),
            std::cmp::Ordering::Equal => idx,
            std::cmp::Ordering::Greater => idx.extract(63, 0),
        };
        log::debug!(
            "gep index label {} = {}, ne: {}, es: {}, offset: {}",
            index_label,
            index,
            num_elems,
            elem_size,
            current_offset
        );
        if !emit {
            return Ok(Vec::new());
        }

        let es = BV::from_u64(self.ctx, elem_size, 64);
        let co = BV::from_i64(self.ctx, current_offset, 64);
        let off = idx64.bvmul(&es).bvadd(&co);
        let bound = BV::from_u64(self.ctx, num_elems.wrapping_mul(elem_size), 64);
        let zero = BV::from_u64(self.ctx, 0, 64);

        let mut deps = self.deps[&index_label].clone();
        for (_, d) in &self.nested {
            deps.extend(d.iter().copied());
        }
        let nested: Vec<Bool<'ctx>> = self.nested.iter().map(|(p, _)| p.clone()).collect();

        let above = self.add_task(Task {
            predicate: off.bvuge(&bound),
            nested: nested.clone(),
            deps: deps.clone(),
        });
        let below = self.add_task(Task {
            predicate: off.bvslt(&zero),
            nested,
            deps,
        });
        Ok(vec![above, below])
    }

    /// Build one conjunctive task from a hypothetical directed path.
    pub fn build_trace_task(
        &mut self,
        conds: &[TraceCond],
        add_nested: bool,
    ) -> Result<TaskId, ParseError> {
        if conds.is_empty() {
            return Err(ParseError::EmptyTrace);
        }
        let mut preds = Vec::with_capacity(conds.len());
        let mut deps = HashSet::default();
        for c in conds {
            let bv = self.reify(c.label)?;
            let b = self.to_bool(&bv);
            preds.push(if c.is_true { b } else { b.not() });
            deps.extend(self.deps[&c.label].iter().copied());
        }
        let refs: Vec<&Bool<'ctx>> = preds.iter().collect();
        let predicate = Bool::and(self.ctx, &refs);

        let nested = if add_nested {
            for (_, d) in &self.nested {
                deps.extend(d.iter().copied());
            }
            self.nested.iter().map(|(p, _)| p.clone()).collect()
        } else {
            Vec::new()
        };

        Ok(self.add_task(Task {
            predicate,
            nested,
            deps,
        }))
    }

    fn add_task(&mut self, task: Task<'ctx>) -> TaskId {
        let id = self.next_task;
        self.next_task += 1;
        self.tasks.insert(id, task);
        id
    }

    fn to_bool(&self, bv: &BV<'ctx>) -> Bool<'ctx> {
        let w = bv.get_size();
        if w == 1 {
            bv._eq(&BV::from_u64(self.ctx, 1, 1))
        } else {
            bv._eq(&BV::from_u64(self.ctx, 0, w)).not()
        }
    }

    fn byte_var(&mut self, offset: u32) -> BV<'ctx> {
        if let Some(v) = self.byte_vars.get(&offset) {
            return v.clone();
        }
        let v = BV::new_const(self.ctx, format!("input_{}", offset), 8);
        self.byte_vars.insert(offset, v.clone());
        v
    }

    /// Materialize the expression for `label`. Memoization is monotonic
    /// within a run: repeated queries return the same expression.
    fn reify(&mut self, label: Label) -> Result<BV<'ctx>, ParseError> {
        if self.input.is_empty() {
            return Err(ParseError::NoInput);
        }
        let mut visiting = HashSet::default();
        self.reify_inner(label, &mut visiting)
    }

    fn reify_inner(
        &mut self,
        label: Label,
        visiting: &mut HashSet<Label>,
    ) -> Result<BV<'ctx>, ParseError> {
        if label == 0 {
            return Err(ParseError::InvalidLabel(0));
        }
        if let Some(e) = self.memo.get(&label) {
            return Ok(e.clone());
        }
        if !visiting.insert(label) {
            return Err(ParseError::Cycle(label));
        }

        let info = *self
            .table
            .get(label)
            .ok_or(ParseError::OutOfRange(label))?;
        let (expr, deps) = self.reify_info(label, &info, visiting)?;
        visiting.remove(&label);
        self.memo.insert(label, expr.clone());
        self.deps.insert(label, deps);
        Ok(expr)
    }

    fn reify_info(
        &mut self,
        label: Label,
        info: &LabelInfo,
        visiting: &mut HashSet<Label>,
    ) -> Result<(BV<'ctx>, HashSet<u32>), ParseError> {
        let size = info.size as u32;
        match info.opcode() {
            OP_INPUT => {
                let offset = info.op1;
                if offset >= self.input.len() as u64 {
                    return Err(ParseError::BadOffset { label, offset });
                }
                let offset = offset as u32;
                let v = self.byte_var(offset);
                let mut deps = HashSet::default();
                deps.insert(offset);
                Ok((v, deps))
            }
            OP_LOAD => {
                // `size` counts bytes here; sources must be input-byte labels.
                if size == 0 {
                    return Err(ParseError::UnknownOp { label, op: info.op });
                }
                let mut deps = HashSet::default();
                let mut expr: Option<BV<'ctx>> = None;
                for i in 0..size {
                    let at = info.l1 + i;
                    let src = self.table.get(at).ok_or(ParseError::OutOfRange(at))?;
                    if src.opcode() != OP_INPUT {
                        return Err(ParseError::BadLoad { label, at });
                    }
                    let byte = self.reify_inner(at, visiting)?;
                    deps.extend(self.deps[&at].iter().copied());
                    // later bytes are more significant
                    expr = Some(match expr {
                        Some(low) => byte.concat(&low),
                        None => byte,
                    });
                }
                Ok((expr.unwrap(), deps))
            }
            OP_ZEXT | OP_SEXT => {
                let src = self.reify_inner(info.l1, visiting)?;
                let w = src.get_size();
                if w > size {
                    return Err(ParseError::WidthMismatch {
                        label,
                        lhs: w,
                        rhs: size,
                    });
                }
                let out = if w == size {
                    src
                } else if info.opcode() == OP_ZEXT {
                    src.zero_ext(size - w)
                } else {
                    src.sign_ext(size - w)
                };
                Ok((out, self.deps[&info.l1].clone()))
            }
            OP_TRUNC => {
                let src = self.reify_inner(info.l1, visiting)?;
                let w = src.get_size();
                if w < size {
                    return Err(ParseError::WidthMismatch {
                        label,
                        lhs: w,
                        rhs: size,
                    });
                }
                let out = if w == size { src } else { src.extract(size - 1, 0) };
                Ok((out, self.deps[&info.l1].clone()))
            }
            OP_EXTRACT => {
                let src = self.reify_inner(info.l1, visiting)?;
                let low = info.op2 as u32;
                let w = src.get_size();
                if low + size > w {
                    return Err(ParseError::WidthMismatch {
                        label,
                        lhs: w,
                        rhs: low + size,
                    });
                }
                Ok((src.extract(low + size - 1, low), self.deps[&info.l1].clone()))
            }
            OP_NOT => {
                let src = self.reify_inner(info.l1, visiting)?;
                Ok((src.bvnot(), self.deps[&info.l1].clone()))
            }
            OP_NEG => {
                let src = self.reify_inner(info.l1, visiting)?;
                Ok((src.bvneg(), self.deps[&info.l1].clone()))
            }
            OP_CONCAT => {
                // l2 holds the high part
                let low = self.reify_inner(info.l1, visiting)?;
                let high = self.reify_inner(info.l2, visiting)?;
                let mut deps = self.deps[&info.l1].clone();
                deps.extend(self.deps[&info.l2].iter().copied());
                Ok((high.concat(&low), deps))
            }
            op @ OP_ADD..=OP_XOR => {
                let (lhs, rhs, deps) = self.operands(label, info, size, visiting)?;
                let out = match op {
                    OP_ADD => lhs.bvadd(&rhs),
                    OP_SUB => lhs.bvsub(&rhs),
                    OP_MUL => lhs.bvmul(&rhs),
                    OP_UDIV => lhs.bvudiv(&rhs),
                    OP_SDIV => lhs.bvsdiv(&rhs),
                    OP_UREM => lhs.bvurem(&rhs),
                    OP_SREM => lhs.bvsrem(&rhs),
                    OP_SHL => lhs.bvshl(&rhs),
                    OP_LSHR => lhs.bvlshr(&rhs),
                    OP_ASHR => lhs.bvashr(&rhs),
                    OP_AND => lhs.bvand(&rhs),
                    OP_OR => lhs.bvor(&rhs),
                    OP_XOR => lhs.bvxor(&rhs),
                    _ => unreachable!(),
                };
                Ok((out, deps))
            }
            OP_ICMP => {
                let w = if info.l1 != 0 {
                    self.reify_inner(info.l1, visiting)?.get_size()
                } else if info.l2 != 0 {
                    self.reify_inner(info.l2, visiting)?.get_size()
                } else {
                    return Err(ParseError::InvalidLabel(label));
                };
                let (lhs, rhs, deps) = self.operands(label, info, w, visiting)?;
                let cond = match info.predicate() {
                    PRED_EQ => lhs._eq(&rhs),
                    PRED_NE => lhs._eq(&rhs).not(),
                    PRED_UGT => lhs.bvugt(&rhs),
                    PRED_UGE => lhs.bvuge(&rhs),
                    PRED_ULT => lhs.bvult(&rhs),
                    PRED_ULE => lhs.bvule(&rhs),
                    PRED_SGT => lhs.bvsgt(&rhs),
                    PRED_SGE => lhs.bvsge(&rhs),
                    PRED_SLT => lhs.bvslt(&rhs),
                    PRED_SLE => lhs.bvsle(&rhs),
                    _ => return Err(ParseError::UnknownOp { label, op: info.op }),
                };
                let one = BV::from_u64(self.ctx, 1, 1);
                let zero = BV::from_u64(self.ctx, 0, 1);
                Ok((cond.ite(&one, &zero), deps))
            }
            OP_FMEMCMP => {
                let n = info.op2 as usize;
                if n == 0 {
                    return Err(ParseError::UnknownOp { label, op: info.op });
                }
                let content = self
                    .memcmp
                    .get(&label)
                    .ok_or(ParseError::MissingMemcmp(label))?
                    .clone();
                if content.len() != n {
                    return Err(ParseError::MemcmpLength {
                        label,
                        want: n,
                        got: content.len(),
                    });
                }
                let sym = self.reify_inner(info.l1, visiting)?;
                if sym.get_size() != (n as u32) * 8 {
                    return Err(ParseError::WidthMismatch {
                        label,
                        lhs: sym.get_size(),
                        rhs: (n as u32) * 8,
                    });
                }
                let mut concrete: Option<BV<'ctx>> = None;
                for &b in &content {
                    let byte = BV::from_u64(self.ctx, b as u64, 8);
                    concrete = Some(match concrete {
                        Some(low) => byte.concat(&low),
                        None => byte,
                    });
                }
                let eq = sym._eq(&concrete.unwrap());
                let zero = BV::from_u64(self.ctx, 0, size.max(1));
                let one = BV::from_u64(self.ctx, 1, size.max(1));
                Ok((eq.ite(&zero, &one), self.deps[&info.l1].clone()))
            }
            OP_FSIZE => {
                let v = BV::new_const(self.ctx, format!("fsize_{}", label), size.max(1));
                Ok((v, HashSet::default()))
            }
            _ => Err(ParseError::UnknownOp { label, op: info.op }),
        }
    }

    fn operands(
        &mut self,
        label: Label,
        info: &LabelInfo,
        width: u32,
        visiting: &mut HashSet<Label>,
    ) -> Result<(BV<'ctx>, BV<'ctx>, HashSet<u32>), ParseError> {
        let mut deps = HashSet::default();
        let lhs = if info.l1 != 0 {
            let e = self.reify_inner(info.l1, visiting)?;
            deps.extend(self.deps[&info.l1].iter().copied());
            e
        } else {
            BV::from_u64(self.ctx, info.op1, width)
        };
        let rhs = if info.l2 != 0 {
            let e = self.reify_inner(info.l2, visiting)?;
            deps.extend(self.deps[&info.l2].iter().copied());
            e
        } else {
            BV::from_u64(self.ctx, info.op2, width)
        };
        if lhs.get_size() != rhs.get_size() {
            return Err(ParseError::WidthMismatch {
                label,
                lhs: lhs.get_size(),
                rhs: rhs.get_size(),
            });
        }
        Ok((lhs, rhs, deps))
    }
}
