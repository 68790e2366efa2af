//! Scoring of model-proposed execution traces against solver feasibility
//! and the consolidated ground-truth path.

use crate::driver::SessionState;
use ctwm_core::{HashMap, HashSet, ParserSolver, SolveStatus, TraceCond};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Write;
use std::path::Path;
use thiserror::Error;

pub const SOLVE_TIMEOUT_MS: u32 = 5000;

#[derive(Debug, Error)]
pub enum RewardError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Deserialize)]
pub struct BranchMetaFile {
    pub branches: Vec<BranchMeta>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct BranchMeta {
    pub line: u32,
    #[serde(rename = "symSanId")]
    pub sym_san_id: u32,
}

#[derive(Debug, Deserialize)]
pub struct TracesFile {
    #[serde(default)]
    pub target: Option<TargetSpec>,
    pub traces: Vec<ModelTrace>,
}

#[derive(Debug, Deserialize)]
pub struct TargetSpec {
    pub line: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Answer {
    Reachable,
    Unreachable,
    Unknown,
}

#[derive(Debug, Deserialize)]
pub struct ModelTrace {
    pub answer: Answer,
    #[serde(default)]
    pub steps: Vec<TraceStep>,
}

#[derive(Debug, Deserialize)]
pub struct TraceStep {
    pub line: u32,
    pub dir: String,
}

impl TraceStep {
    /// `"T"`, `"true"` and `"1"` mean taken; anything else is false.
    pub fn direction(&self) -> bool {
        matches!(self.dir.as_str(), "T" | "true" | "1")
    }
}

#[derive(Debug, Serialize)]
pub struct RewardRow {
    pub reward: f64,
    pub answer: Answer,
    pub solver_sat: bool,
    pub solver_unknown: bool,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub provided_steps: usize,
}

#[derive(Debug, Serialize)]
pub struct RewardsFile {
    pub rewards: Vec<RewardRow>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct StepMetrics {
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
}

/// Branch metadata plus the consolidated ground truth of this session.
pub struct RewardOracle {
    sym_of_line: HashMap<u32, u32>,
    branch_count_meta: usize,
}

impl RewardOracle {
    pub fn load(path: &Path) -> Result<Self, RewardError> {
        let file = File::open(path)?;
        let meta: BranchMetaFile = serde_json::from_reader(file)?;
        Ok(Self::from_meta(&meta))
    }

    pub fn from_meta(meta: &BranchMetaFile) -> Self {
        let mut sym_of_line = HashMap::default();
        for b in &meta.branches {
            sym_of_line.insert(b.line, b.sym_san_id);
        }
        Self {
            sym_of_line,
            branch_count_meta: meta.branches.len(),
        }
    }

    /// `{symSanId -> line}` view used by the driver to attribute observed
    /// conditions to source lines.
    pub fn line_of_sym(&self) -> HashMap<u32, u32> {
        self.sym_of_line.iter().map(|(&l, &s)| (s, l)).collect()
    }

    pub fn branch_count_meta(&self) -> usize {
        self.branch_count_meta
    }

    /// Score every model trace and return the reward rows in input order.
    pub fn evaluate(
        &self,
        parser: &mut ParserSolver<'_>,
        session: &SessionState,
        traces: &TracesFile,
    ) -> Vec<RewardRow> {
        let ground_truth = consolidate_ground_truth(session);
        log::info!(
            "ground truth: target_reached={}, {} uniform lines",
            session.target_reached,
            ground_truth.len()
        );

        traces
            .traces
            .iter()
            .map(|t| self.evaluate_one(parser, session, &ground_truth, t))
            .collect()
    }

    fn evaluate_one(
        &self,
        parser: &mut ParserSolver<'_>,
        session: &SessionState,
        ground_truth: &[(u32, bool)],
        trace: &ModelTrace,
    ) -> RewardRow {
        let mut solver_sat = false;
        let mut solver_unknown = false;

        // map steps line -> symSanId -> observed label, first occurrence of
        // a symbol wins
        let mut seen: HashSet<u32> = HashSet::default();
        let mut conds = Vec::new();
        for step in &trace.steps {
            let sym = match self.sym_of_line.get(&step.line) {
                Some(&s) => s,
                None => continue,
            };
            if !seen.insert(sym) {
                continue;
            }
            let label = match session.label_of_sym.get(&sym) {
                Some(&l) => l,
                None => continue,
            };
            conds.push(TraceCond {
                label,
                is_true: step.direction(),
            });
        }

        match parser.build_trace_task(&conds, false) {
            Ok(task) => match parser.solve_task(task, SOLVE_TIMEOUT_MS) {
                Ok((status, solution)) => match status {
                    SolveStatus::Timeout | SolveStatus::SatNestedTimeout => solver_unknown = true,
                    SolveStatus::Unsat | SolveStatus::SatNestedUnsat => solver_sat = false,
                    SolveStatus::Sat => solver_sat = !solution.is_empty(),
                },
                Err(e) => {
                    log::warn!("trace task vanished: {}", e);
                    solver_unknown = true;
                }
            },
            Err(e) => {
                log::warn!("failed to build trace task: {}", e);
                solver_unknown = true;
            }
        }

        let metrics = step_metrics(
            trace,
            session.target_reached,
            ground_truth,
            solver_sat,
            self.branch_count_meta,
        );
        let reward = score(trace, session.target_reached, solver_sat, solver_unknown, &metrics);

        RewardRow {
            reward,
            answer: trace.answer,
            solver_sat,
            solver_unknown,
            precision: metrics.precision,
            recall: metrics.recall,
            f1: metrics.f1,
            provided_steps: trace.steps.len(),
        }
    }
}

/// Lines whose observed direction is uniform across all target-reaching
/// runs, sorted by line.
pub fn consolidate_ground_truth(session: &SessionState) -> Vec<(u32, bool)> {
    let mut path: Vec<(u32, bool)> = session
        .line_dirs
        .iter()
        .filter_map(|(&line, &(seen_true, seen_false))| {
            match (seen_true > 0, seen_false > 0) {
                (true, false) => Some((line, true)),
                (false, true) => Some((line, false)),
                _ => None,
            }
        })
        .collect();
    path.sort_unstable_by_key(|&(line, _)| line);
    path
}

fn f1_of(precision: f64, recall: f64) -> f64 {
    if precision + recall == 0.0 {
        0.0
    } else {
        2.0 * precision * recall / (precision + recall)
    }
}

/// Precision/recall/F1 of the proposed steps, against ground truth when the
/// target was reached, against solver feasibility otherwise.
pub fn step_metrics(
    trace: &ModelTrace,
    target_reached: bool,
    ground_truth: &[(u32, bool)],
    solver_sat: bool,
    branch_count_meta: usize,
) -> StepMetrics {
    let provided = trace.steps.len();
    if provided == 0 {
        return StepMetrics::default();
    }

    if target_reached && !ground_truth.is_empty() {
        let gt: HashMap<u32, bool> = ground_truth.iter().copied().collect();
        let correct = trace
            .steps
            .iter()
            .filter(|s| gt.get(&s.line) == Some(&s.direction()))
            .count();
        let precision = correct as f64 / provided as f64;
        let recall = correct as f64 / ground_truth.len() as f64;
        StepMetrics {
            precision,
            recall,
            f1: f1_of(precision, recall),
        }
    } else {
        if branch_count_meta == 0 {
            return StepMetrics::default();
        }
        let precision = if solver_sat { 1.0 } else { 0.0 };
        let recall = provided as f64 / branch_count_meta as f64;
        StepMetrics {
            precision,
            recall,
            f1: f1_of(precision, recall),
        }
    }
}

/// The scalar reward of one trace.
pub fn score(
    trace: &ModelTrace,
    target_reached: bool,
    solver_sat: bool,
    solver_unknown: bool,
    metrics: &StepMetrics,
) -> f64 {
    if solver_unknown {
        return -0.1;
    }

    let status_score = match trace.answer {
        Answer::Unknown => 0.0,
        Answer::Reachable if target_reached => 1.0,
        Answer::Unreachable if !target_reached => 1.0,
        _ => -1.0,
    };
    let sat_score = if trace.answer == Answer::Reachable {
        if solver_sat {
            0.5
        } else {
            -0.5
        }
    } else {
        0.0
    };
    let step_bonus = if trace.steps.is_empty() { 0.0 } else { 0.05 };

    0.6 * status_score + 0.2 * sat_score + 0.2 * metrics.f1 + step_bonus
}

/// Write `rewards.json` with 2-space indentation.
pub fn write_rewards(path: &Path, rewards: Vec<RewardRow>) -> Result<(), RewardError> {
    let mut file = File::create(path)?;
    let out = RewardsFile { rewards };
    serde_json::to_writer_pretty(&mut file, &out)?;
    file.write_all(b"\n")?;
    Ok(())
}
