//! Basic-block numbering, conditional-branch extraction and optional trace
//! instrumentation over a module.

use crate::emit::{
    write_index, BasicBlockJson, BranchJson, GroupBranchJson, IfGroupJson, IndexDoc,
    DEFAULT_INDEX_OUT, INDEX_VERSION,
};
use crate::ir::{Declaration, Inst, Module, Operand, Terminator, TAINT_TRACE_COND, TRACE_BB_HOOK};
use crate::{debug_enabled, PassError};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

/// Pass toggles: the build default, overridable from the command line;
/// disable wins ties.
#[derive(Debug, Clone)]
pub struct PassConfig {
    pub build_enable_index: bool,
    pub build_enable_bb_trace: bool,
    pub force_enable_index: bool,
    pub force_disable_index: bool,
    pub force_enable_bb_trace: bool,
    pub force_disable_bb_trace: bool,
    pub index_out: PathBuf,
}

impl Default for PassConfig {
    fn default() -> Self {
        Self {
            build_enable_index: false,
            build_enable_bb_trace: false,
            force_enable_index: false,
            force_disable_index: false,
            force_enable_bb_trace: false,
            force_disable_bb_trace: false,
            index_out: PathBuf::from(DEFAULT_INDEX_OUT),
        }
    }
}

impl PassConfig {
    pub fn with_build_defaults(enable_index: bool, enable_bb_trace: bool) -> Self {
        Self {
            build_enable_index: enable_index,
            build_enable_bb_trace: enable_bb_trace,
            ..Default::default()
        }
    }

    /// Apply the `-symsan-ctwm-*` command-line toggles; unrelated arguments
    /// are ignored.
    pub fn apply_cli_args<S: AsRef<str>>(&mut self, args: &[S]) {
        let mut iter = args.iter().map(|s| s.as_ref()).peekable();
        while let Some(arg) = iter.next() {
            let flag = arg.trim_start_matches('-');
            match flag {
                "symsan-ctwm-enable-index" => self.force_enable_index = true,
                "symsan-ctwm-disable-index" => self.force_disable_index = true,
                "symsan-ctwm-enable-bb-trace" => self.force_enable_bb_trace = true,
                "symsan-ctwm-disable-bb-trace" => self.force_disable_bb_trace = true,
                "symsan-ctwm-index-out" => {
                    if let Some(value) = iter.next() {
                        self.index_out = PathBuf::from(value);
                    }
                }
                _ => {
                    if let Some(value) = flag.strip_prefix("symsan-ctwm-index-out=") {
                        self.index_out = PathBuf::from(value);
                    }
                }
            }
        }
        if self.index_out.as_os_str().is_empty() {
            self.index_out = PathBuf::from(DEFAULT_INDEX_OUT);
        }
    }

    pub fn want_index(&self) -> bool {
        if self.force_disable_index {
            return false;
        }
        if self.force_enable_index {
            return true;
        }
        self.build_enable_index
    }

    pub fn want_bb_trace(&self) -> bool {
        if self.force_disable_bb_trace {
            return false;
        }
        if self.force_enable_bb_trace {
            return true;
        }
        self.build_enable_bb_trace
    }
}

#[derive(Debug, Clone)]
pub struct BasicBlockRecord {
    pub id: u32,
    pub function: String,
    pub name: String,
    pub is_entry: bool,
}

#[derive(Debug, Clone)]
pub struct BranchRecord {
    pub branch_bb: u32,
    pub true_bb: u32,
    pub false_bb: u32,
    pub sym_san_id: i32,
    pub file: String,
    pub line: u32,
    pub column: u32,
    pub function: String,
}

#[derive(Debug, Clone)]
pub struct SourceGroup {
    pub file: String,
    pub line: u32,
    pub column: u32,
    pub function: String,
    pub branch_indices: Vec<usize>,
}

pub struct BlockNumbering {
    /// (function index, block index) -> id, ids start at 1.
    pub ids: HashMap<(usize, usize), u32>,
    pub records: Vec<BasicBlockRecord>,
}

/// Number every block of every defined function in definition then layout
/// order.
pub fn assign_block_ids(module: &Module) -> BlockNumbering {
    let mut ids = HashMap::new();
    let mut records = Vec::new();
    let mut next_id = 1u32;
    for (fi, function) in module.functions.iter().enumerate() {
        if function.is_declaration {
            continue;
        }
        let display = function.display_name().to_string();
        for (bi, block) in function.blocks.iter().enumerate() {
            ids.insert((fi, bi), next_id);
            records.push(BasicBlockRecord {
                id: next_id,
                function: display.clone(),
                name: block.label.clone(),
                is_entry: bi == 0,
            });
            next_id += 1;
        }
    }
    BlockNumbering { ids, records }
}

/// The symbolic id of a conditional branch: the 4th argument of the
/// `__taint_trace_cond` call in the same block whose 2nd argument is the
/// branch condition. Zero when no such call exists.
fn find_sym_san_id(insts: &[Inst], cond: Operand) -> i32 {
    for inst in insts {
        let (callee, args) = match inst {
            Inst::Call { callee, args } => (callee, args),
            _ => continue,
        };
        if callee != TAINT_TRACE_COND || args.len() < 4 {
            continue;
        }
        if args[1] != cond {
            continue;
        }
        if let Operand::Const(id) = args[3] {
            return id as i32;
        }
    }
    0
}

/// Extract every two-successor conditional branch and group them by source
/// coordinates, preserving per-group branch order.
pub fn collect_branches(
    module: &Module,
    numbering: &BlockNumbering,
) -> (Vec<BranchRecord>, Vec<SourceGroup>) {
    let mut records = Vec::new();
    let mut group_map: BTreeMap<(String, u32, u32, String), Vec<usize>> = BTreeMap::new();

    for (fi, function) in module.functions.iter().enumerate() {
        if function.is_declaration {
            continue;
        }
        let display = function.display_name().to_string();
        for (bi, block) in function.blocks.iter().enumerate() {
            let (cond, true_succ, false_succ, loc) = match &block.term {
                Terminator::CondBr {
                    cond,
                    true_succ,
                    false_succ,
                    loc,
                } => (*cond, *true_succ, *false_succ, loc.clone()),
                _ => continue,
            };
            let bb = match numbering.ids.get(&(fi, bi)) {
                Some(&id) => id,
                None => continue,
            };

            let mut record = BranchRecord {
                branch_bb: bb,
                true_bb: numbering.ids.get(&(fi, true_succ)).copied().unwrap_or(0),
                false_bb: numbering.ids.get(&(fi, false_succ)).copied().unwrap_or(0),
                sym_san_id: find_sym_san_id(&block.insts, cond),
                file: String::new(),
                line: 0,
                column: 0,
                function: display.clone(),
            };
            if let Some(loc) = loc {
                record.file = loc.full_path();
                record.line = loc.line;
                record.column = loc.column;
            }

            let key = (
                record.file.clone(),
                record.line,
                record.column,
                record.function.clone(),
            );
            group_map.entry(key).or_default().push(records.len());
            records.push(record);
        }
    }

    let groups = group_map
        .into_iter()
        .map(|((file, line, column, function), branch_indices)| SourceGroup {
            file,
            line,
            column,
            function,
            branch_indices,
        })
        .collect();
    (records, groups)
}

pub fn build_index_doc(
    module: &Module,
    blocks: &[BasicBlockRecord],
    branches: &[BranchRecord],
    groups: &[SourceGroup],
) -> IndexDoc {
    let module_name = {
        let base = Path::new(&module.name)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if base.is_empty() {
            "module".to_string()
        } else {
            base
        }
    };

    IndexDoc {
        version: INDEX_VERSION,
        module: module_name,
        basic_blocks: blocks
            .iter()
            .map(|r| BasicBlockJson {
                id: r.id,
                function: r.function.clone(),
                name: r.name.clone(),
                is_entry: r.is_entry,
            })
            .collect(),
        branches: branches
            .iter()
            .map(|r| BranchJson {
                file: r.file.clone(),
                line: r.line,
                column: r.column,
                function: r.function.clone(),
                bb: r.branch_bb,
                succ_true: r.true_bb,
                succ_false: r.false_bb,
                sym_san_id: r.sym_san_id,
            })
            .collect(),
        if_groups: groups
            .iter()
            .filter(|g| !g.branch_indices.is_empty())
            .map(|g| IfGroupJson {
                file: g.file.clone(),
                line: g.line,
                column: g.column,
                function: g.function.clone(),
                sym_san_ids: g
                    .branch_indices
                    .iter()
                    .map(|&i| branches[i].sym_san_id)
                    .collect(),
                branches: g
                    .branch_indices
                    .iter()
                    .map(|&i| GroupBranchJson {
                        bb: branches[i].branch_bb,
                        succ_true: branches[i].true_bb,
                        succ_false: branches[i].false_bb,
                        sym_san_id: branches[i].sym_san_id,
                    })
                    .collect(),
            })
            .collect(),
    }
}

/// Insert `__ctwm_trace_bb(id)` after the PHIs of every numbered block and
/// declare the hook as nounwind/noinline. Returns whether the module
/// changed.
pub fn inject_trace_calls(module: &mut Module, numbering: &BlockNumbering) -> bool {
    let mut changed = false;

    if !module.declarations.iter().any(|d| d.name == TRACE_BB_HOOK) {
        module.declarations.push(Declaration {
            name: TRACE_BB_HOOK.to_string(),
            attrs: vec!["nounwind".to_string(), "noinline".to_string()],
        });
        changed = true;
    }

    for (fi, function) in module.functions.iter_mut().enumerate() {
        if function.is_declaration || function.name == TRACE_BB_HOOK {
            continue;
        }
        for (bi, block) in function.blocks.iter_mut().enumerate() {
            let id = match numbering.ids.get(&(fi, bi)) {
                Some(&id) => id,
                None => continue,
            };
            // after all PHIs, before the terminator otherwise
            let at = block
                .insts
                .iter()
                .position(|i| !i.is_phi())
                .unwrap_or(block.insts.len());
            block.insts.insert(
                at,
                Inst::Call {
                    callee: TRACE_BB_HOOK.to_string(),
                    args: vec![Operand::Const(id as i64)],
                },
            );
            changed = true;
        }
    }
    changed
}

pub struct IndexPass {
    pub config: PassConfig,
}

#[derive(Debug)]
pub struct PassOutcome {
    /// The module was mutated (trace probes were injected).
    pub changed: bool,
    /// The emitted index, when emission is enabled.
    pub index: Option<IndexDoc>,
}

impl IndexPass {
    pub fn new(config: PassConfig) -> Self {
        Self { config }
    }

    pub fn run(&self, module: &mut Module) -> Result<PassOutcome, PassError> {
        if debug_enabled() {
            log::debug!("ctwm index pass running on {}", module.name);
        }
        let numbering = assign_block_ids(module);
        if debug_enabled() {
            log::debug!("assigned {} basic block ids", numbering.records.len());
        }
        if numbering.records.is_empty() {
            return Ok(PassOutcome {
                changed: false,
                index: None,
            });
        }

        let (branches, groups) = collect_branches(module, &numbering);

        let mut index = None;
        if self.config.want_index() {
            let doc = build_index_doc(module, &numbering.records, &branches, &groups);
            write_index(&doc, &self.config.index_out)?;
            if debug_enabled() {
                log::debug!("wrote index to {}", self.config.index_out.display());
            }
            index = Some(doc);
        }

        let changed = if self.config.want_bb_trace() {
            inject_trace_calls(module, &numbering)
        } else {
            false
        };

        Ok(PassOutcome { changed, index })
    }
}
