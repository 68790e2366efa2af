//! Minimal module model the index pass operates on.
//!
//! The compiler front-end lowers its IR into this shape; only what the pass
//! inspects is modeled: functions, block layout, PHI/call instructions with
//! value identities, conditional terminators and their debug locations.

use serde::{Deserialize, Serialize};

/// Hook called by instrumented code in front of conditional branches; its
/// 4th argument carries the compile-time symbolic id.
pub const TAINT_TRACE_COND: &str = "__taint_trace_cond";
/// Per-block trace hook injected by the pass.
pub const TRACE_BB_HOOK: &str = "__ctwm_trace_bb";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Module {
    /// Module identifier, usually the source path.
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub functions: Vec<Function>,
    /// External declarations, e.g. injected hooks.
    #[serde(default)]
    pub declarations: Vec<Declaration>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Declaration {
    pub name: String,
    #[serde(default)]
    pub attrs: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Function {
    /// IR symbol name.
    pub name: String,
    /// Debug-info subprogram name.
    #[serde(default)]
    pub subprogram_name: Option<String>,
    #[serde(default)]
    pub linkage_name: Option<String>,
    #[serde(default)]
    pub is_declaration: bool,
    #[serde(default)]
    pub blocks: Vec<BasicBlock>,
}

impl Function {
    /// Subprogram name, then linkage name, then the symbol name.
    pub fn display_name(&self) -> &str {
        if let Some(n) = self.subprogram_name.as_deref() {
            if !n.is_empty() {
                return n;
            }
        }
        if let Some(n) = self.linkage_name.as_deref() {
            if !n.is_empty() {
                return n;
            }
        }
        &self.name
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BasicBlock {
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub insts: Vec<Inst>,
    pub term: Terminator,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Inst {
    Phi {
        result: u32,
    },
    Call {
        callee: String,
        #[serde(default)]
        args: Vec<Operand>,
    },
    Other,
}

impl Inst {
    pub fn is_phi(&self) -> bool {
        matches!(self, Inst::Phi { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operand {
    /// An SSA value id.
    Value(u32),
    Const(i64),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Terminator {
    Ret,
    Br {
        target: usize,
    },
    /// Two-successor conditional branch; successors are block indices
    /// within the owning function.
    CondBr {
        cond: Operand,
        true_succ: usize,
        false_succ: usize,
        #[serde(default)]
        loc: Option<SourceLoc>,
    },
    Other,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceLoc {
    #[serde(default)]
    pub file: String,
    #[serde(default)]
    pub directory: String,
    #[serde(default)]
    pub line: u32,
    #[serde(default)]
    pub column: u32,
}

impl SourceLoc {
    /// Debug directory joined with the file name, empty when absent.
    pub fn full_path(&self) -> String {
        if self.file.is_empty() || self.directory.is_empty() {
            self.file.clone()
        } else {
            std::path::Path::new(&self.directory)
                .join(&self.file)
                .to_string_lossy()
                .into_owned()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_name_preference() {
        let mut f = Function {
            name: "_Z3foov".to_string(),
            subprogram_name: Some("foo".to_string()),
            linkage_name: Some("_Z3foov".to_string()),
            ..Default::default()
        };
        assert_eq!(f.display_name(), "foo");
        f.subprogram_name = None;
        assert_eq!(f.display_name(), "_Z3foov");
        f.linkage_name = Some(String::new());
        assert_eq!(f.display_name(), "_Z3foov");
    }

    #[test]
    fn source_path_join() {
        let loc = SourceLoc {
            file: "main.c".to_string(),
            directory: "/src/app".to_string(),
            line: 3,
            column: 9,
        };
        assert_eq!(loc.full_path(), "/src/app/main.c");

        let bare = SourceLoc {
            file: "main.c".to_string(),
            ..Default::default()
        };
        assert_eq!(bare.full_path(), "main.c");
    }

    #[test]
    fn module_round_trips_through_json() {
        let module = Module {
            name: "demo.c".to_string(),
            functions: vec![Function {
                name: "main".to_string(),
                blocks: vec![BasicBlock {
                    label: "entry".to_string(),
                    insts: vec![Inst::Call {
                        callee: TAINT_TRACE_COND.to_string(),
                        args: vec![
                            Operand::Const(0),
                            Operand::Value(5),
                            Operand::Const(0),
                            Operand::Const(7),
                        ],
                    }],
                    term: Terminator::Ret,
                }],
                ..Default::default()
            }],
            declarations: Vec::new(),
        };
        let json = serde_json::to_string(&module).unwrap();
        let back: Module = serde_json::from_str(&json).unwrap();
        assert_eq!(back.functions.len(), 1);
        assert_eq!(back.functions[0].blocks[0].insts.len(), 1);
    }
}
