//! Time-bounded solving of parsed tasks and solution materialization.

use crate::{parse::ParserSolver, HashSet, InputByte, Solution};
use thiserror::Error;
use z3::ast::{Bool, BV};
use z3::{Params, SatResult, Solver};

/// Opaque task handle. Life-tied to the parser instance; solved at most once.
pub type TaskId = u64;

#[derive(Debug, Error)]
pub enum SolveError {
    #[error("unknown or already consumed task {0}")]
    TaskNotFound(TaskId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolveStatus {
    Sat,
    Unsat,
    Timeout,
    /// The full conjunction timed out but the target predicate alone is sat.
    SatNestedTimeout,
    /// The full conjunction is unsat but the target predicate alone is sat.
    SatNestedUnsat,
}

pub(crate) struct Task<'ctx> {
    /// The predicate to satisfy (negated branch, bounds violation, or
    /// hypothetical trace conjunction).
    pub(crate) predicate: Bool<'ctx>,
    /// Path predicates conjoined with the target.
    pub(crate) nested: Vec<Bool<'ctx>>,
    /// Input byte offsets the predicates were built from.
    pub(crate) deps: HashSet<u32>,
}

impl<'ctx> ParserSolver<'ctx> {
    /// Solve a task under a per-task deadline. The task is consumed.
    ///
    /// Unsat and timeout outcomes collapse to an empty solution.
    pub fn solve_task(
        &mut self,
        id: TaskId,
        timeout_ms: u32,
    ) -> Result<(SolveStatus, Solution), SolveError> {
        let task = self.tasks.remove(&id).ok_or(SolveError::TaskNotFound(id))?;

        let solver = self.fresh_solver(timeout_ms);
        for p in &task.nested {
            solver.assert(p);
        }
        solver.assert(&task.predicate);

        match solver.check() {
            SatResult::Sat => {
                let solution = self.extract(&solver, &task);
                Ok((SolveStatus::Sat, solution))
            }
            SatResult::Unsat => self.solve_optimistic(&task, timeout_ms, SolveStatus::Unsat),
            SatResult::Unknown => self.solve_optimistic(&task, timeout_ms, SolveStatus::Timeout),
        }
    }

    /// Retry with the target predicate alone after the full conjunction
    /// failed; `failed` is the status to report when the retry fails too.
    fn solve_optimistic(
        &mut self,
        task: &Task<'ctx>,
        timeout_ms: u32,
        failed: SolveStatus,
    ) -> Result<(SolveStatus, Solution), SolveError> {
        if task.nested.is_empty() {
            return Ok((failed, Vec::new()));
        }
        let solver = self.fresh_solver(timeout_ms);
        solver.assert(&task.predicate);
        if solver.check() == SatResult::Sat {
            let solution = self.extract(&solver, task);
            let status = match failed {
                SolveStatus::Unsat => SolveStatus::SatNestedUnsat,
                _ => SolveStatus::SatNestedTimeout,
            };
            Ok((status, solution))
        } else {
            Ok((failed, Vec::new()))
        }
    }

    fn fresh_solver(&self, timeout_ms: u32) -> Solver<'ctx> {
        let solver = Solver::new(self.ctx);
        let mut params = Params::new(self.ctx);
        params.set_u32("timeout", timeout_ms);
        solver.set_params(&params);
        solver
    }

    fn extract(&mut self, solver: &Solver<'ctx>, task: &Task<'ctx>) -> Solution {
        let model = match solver.get_model() {
            Some(m) => m,
            None => return Vec::new(),
        };

        let mut solution = Vec::new();
        if self.strict {
            let mut offsets: Vec<u32> = task.deps.iter().copied().collect();
            offsets.sort_unstable();
            for offset in offsets {
                let var = match self.byte_vars.get(&offset) {
                    Some(v) => v.clone(),
                    None => continue,
                };
                // without completion only solver-pinned bytes evaluate to
                // numerals
                if let Some(val) = model.eval(&var, false).and_then(|v| v.as_u64()) {
                    solution.push(InputByte {
                        offset,
                        val: val as u8,
                    });
                }
            }
        } else {
            for offset in 0..self.input.len() as u32 {
                let var = self.byte_var_for_extract(offset);
                if let Some(val) = model.eval(&var, true).and_then(|v| v.as_u64()) {
                    solution.push(InputByte {
                        offset,
                        val: val as u8,
                    });
                }
            }
        }
        solution
    }

    fn byte_var_for_extract(&mut self, offset: u32) -> BV<'ctx> {
        if let Some(v) = self.byte_vars.get(&offset) {
            return v.clone();
        }
        let v = BV::new_const(self.ctx, format!("input_{}", offset), 8);
        self.byte_vars.insert(offset, v.clone());
        v
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::label::*;
    use crate::parse::tests::{icmp, input_byte};
    use crate::parse::TraceCond;
    use crate::ParserSolver;
    use z3::Context;

    fn ctx() -> Context {
        Context::new(&z3::Config::new())
    }

    // input "0", branch `input[0] == '1'` observed false: flipping yields
    // the single assignment offset 0 -> '1'
    #[test]
    fn flip_single_cond() {
        let ctx = ctx();
        let entries = vec![
            LabelInfo::default(),
            input_byte(0),
            icmp(PRED_EQ, 1, 0, 0, b'1' as u64),
        ];
        let mut p = ParserSolver::new(&ctx, UnionTable::from_entries(&entries));
        p.restart(&[b"0"]).unwrap();

        let tasks = p.parse_cond(2, 0, false).unwrap();
        assert_eq!(tasks.len(), 1);
        let (status, solution) = p.solve_task(tasks[0], 5000).unwrap();
        assert_eq!(status, SolveStatus::Sat);
        assert_eq!(solution.len(), 1);
        assert_eq!(solution[0].offset, 0);
        assert_eq!(solution[0].val, b'1');
    }

    #[test]
    fn task_consumed_after_solve() {
        let ctx = ctx();
        let entries = vec![
            LabelInfo::default(),
            input_byte(0),
            icmp(PRED_EQ, 1, 0, 0, b'1' as u64),
        ];
        let mut p = ParserSolver::new(&ctx, UnionTable::from_entries(&entries));
        p.restart(&[b"0"]).unwrap();
        let tasks = p.parse_cond(2, 0, false).unwrap();
        p.solve_task(tasks[0], 5000).unwrap();
        assert!(matches!(
            p.solve_task(tasks[0], 5000),
            Err(SolveError::TaskNotFound(_))
        ));
    }

    // unsatisfiable flip: input[0] == input[0] observed true
    #[test]
    fn unsat_collapses_to_empty() {
        let ctx = ctx();
        let entries = vec![LabelInfo::default(), input_byte(0), icmp(PRED_EQ, 1, 1, 0, 0)];
        let mut p = ParserSolver::new(&ctx, UnionTable::from_entries(&entries));
        p.restart(&[b"a"]).unwrap();
        let tasks = p.parse_cond(2, 1, false).unwrap();
        let (status, solution) = p.solve_task(tasks[0], 5000).unwrap();
        assert_eq!(status, SolveStatus::Unsat);
        assert!(solution.is_empty());
    }

    // nested path contradicts the flip, the optimistic retry still solves it
    #[test]
    fn optimistic_retry_after_nested_unsat() {
        let ctx = ctx();
        let entries = vec![
            LabelInfo::default(),
            input_byte(0),
            icmp(PRED_EQ, 1, 0, 0, b'x' as u64), // input[0] == 'x'
            icmp(PRED_NE, 1, 0, 0, b'x' as u64), // input[0] != 'x'
        ];
        let mut p = ParserSolver::new(&ctx, UnionTable::from_entries(&entries));
        p.restart(&[b"x"]).unwrap();

        // record path predicate input[0] == 'x'
        let first = p.parse_cond(2, 1, true).unwrap();
        assert_eq!(first.len(), 1);
        // branch input[0] != 'x' observed false; flip wants input[0] != 'x',
        // contradicting the nested path predicate
        let tasks = p.parse_cond(3, 0, true).unwrap();
        let (status, solution) = p.solve_task(tasks[0], 5000).unwrap();
        assert_eq!(status, SolveStatus::SatNestedUnsat);
        assert_eq!(solution.len(), 1);
        assert_eq!(solution[0].offset, 0);
        assert_ne!(solution[0].val, b'x');
    }

    // gep: array of 10 i32, tainted byte index; one of the two bounds tasks
    // must produce an out-of-range index
    #[test]
    fn gep_out_of_bounds() {
        let ctx = ctx();
        let entries = vec![
            LabelInfo::default(),
            input_byte(0),
            LabelInfo {
                l1: 1,
                op: OP_ZEXT,
                size: 64,
                ..Default::default()
            },
        ];
        let mut p = ParserSolver::new(&ctx, UnionTable::from_entries(&entries));
        p.restart(&[&[3u8]]).unwrap();

        let tasks = p.parse_gep(0, 0, 2, 3, 10, 4, 0, true).unwrap();
        assert_eq!(tasks.len(), 2);
        let mut solved = 0;
        for id in tasks {
            let (status, solution) = p.solve_task(id, 5000).unwrap();
            if status == SolveStatus::Sat {
                assert_eq!(solution.len(), 1);
                assert!(solution[0].val as u64 >= 10);
                solved += 1;
            }
        }
        // the index is an unsigned byte, only the upper bound is reachable
        assert_eq!(solved, 1);
    }

    // memcmp against "HTTP": solving the equality covers the full window
    #[test]
    fn memcmp_window_solved() {
        let ctx = ctx();
        let entries = vec![
            LabelInfo::default(),
            input_byte(0),
            input_byte(1),
            input_byte(2),
            input_byte(3),
            LabelInfo {
                l1: 1,
                op: OP_LOAD,
                size: 4,
                ..Default::default()
            },
            LabelInfo {
                l1: 5,
                op2: 4,
                op: OP_FMEMCMP,
                size: 64,
                ..Default::default()
            },
        ];
        let mut p = ParserSolver::new(&ctx, UnionTable::from_entries(&entries));
        p.restart(&[b"xxxx"]).unwrap();
        p.record_memcmp(6, b"HTTP");

        // memcmp result observed non-zero; flip to the matching branch
        let tasks = p.parse_cond(6, 1, false).unwrap();
        let (status, mut solution) = p.solve_task(tasks[0], 5000).unwrap();
        assert_eq!(status, SolveStatus::Sat);
        solution.sort_by_key(|b| b.offset);
        assert_eq!(solution.len(), 4);
        let bytes: Vec<u8> = solution.iter().map(|b| b.val).collect();
        assert_eq!(&bytes, b"HTTP");
    }

    // hypothetical trace feasibility for the reward oracle
    #[test]
    fn trace_task_conjunction() {
        let ctx = ctx();
        let entries = vec![
            LabelInfo::default(),
            input_byte(0),
            input_byte(1),
            icmp(PRED_UGT, 1, 0, 0, 10), // input[0] > 10
            icmp(PRED_ULT, 2, 0, 0, 5),  // input[1] < 5
        ];
        let mut p = ParserSolver::new(&ctx, UnionTable::from_entries(&entries));
        p.restart(&[b"ab"]).unwrap();

        let id = p
            .build_trace_task(
                &[
                    TraceCond {
                        label: 3,
                        is_true: true,
                    },
                    TraceCond {
                        label: 4,
                        is_true: true,
                    },
                ],
                false,
            )
            .unwrap();
        let (status, mut solution) = p.solve_task(id, 5000).unwrap();
        assert_eq!(status, SolveStatus::Sat);
        solution.sort_by_key(|b| b.offset);
        assert_eq!(solution.len(), 2);
        assert!(solution[0].val > 10);
        assert!(solution[1].val < 5);

        // contradictory direction on the same byte is unsat
        let id = p
            .build_trace_task(
                &[
                    TraceCond {
                        label: 3,
                        is_true: true,
                    },
                    TraceCond {
                        label: 3,
                        is_true: false,
                    },
                ],
                false,
            )
            .unwrap();
        let (status, solution) = p.solve_task(id, 5000).unwrap();
        assert_eq!(status, SolveStatus::Unsat);
        assert!(solution.is_empty());
    }

    // reward mode disables strict filtering and surfaces every input byte
    #[test]
    fn non_strict_extraction_covers_all_bytes() {
        let ctx = ctx();
        let entries = vec![
            LabelInfo::default(),
            input_byte(0),
            icmp(PRED_EQ, 1, 0, 0, b'1' as u64),
        ];
        let mut p = ParserSolver::new(&ctx, UnionTable::from_entries(&entries));
        p.restart(&[b"0ab"]).unwrap();
        p.set_strict_value_filtering(false);

        let tasks = p.parse_cond(2, 0, false).unwrap();
        let (status, solution) = p.solve_task(tasks[0], 5000).unwrap();
        assert_eq!(status, SolveStatus::Sat);
        assert_eq!(solution.len(), 3);
        assert_eq!(solution[0].val, b'1');
    }
}
