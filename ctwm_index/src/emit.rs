//! The CTWM index JSON document (version 1) and its emission.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::Path;

use crate::PassError;

pub const INDEX_VERSION: u32 = 1;
pub const DEFAULT_INDEX_OUT: &str = "ctwm_index.json";

fn is_false(v: &bool) -> bool {
    !*v
}

fn is_zero(v: &u32) -> bool {
    *v == 0
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDoc {
    pub version: u32,
    pub module: String,
    pub basic_blocks: Vec<BasicBlockJson>,
    pub branches: Vec<BranchJson>,
    pub if_groups: Vec<IfGroupJson>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasicBlockJson {
    pub id: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub function: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_entry: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchJson {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub file: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub line: u32,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub column: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub function: String,
    pub bb: u32,
    pub succ_true: u32,
    pub succ_false: u32,
    #[serde(rename = "symSanId")]
    pub sym_san_id: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IfGroupJson {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub file: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub line: u32,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub column: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub function: String,
    #[serde(rename = "symSanIds")]
    pub sym_san_ids: Vec<i32>,
    pub branches: Vec<GroupBranchJson>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupBranchJson {
    pub bb: u32,
    pub succ_true: u32,
    pub succ_false: u32,
    #[serde(rename = "symSanId")]
    pub sym_san_id: i32,
}

/// Write the index with 2-space indentation. `-` means stdout; parent
/// directories are created as needed.
pub fn write_index(doc: &IndexDoc, out: &Path) -> Result<(), PassError> {
    let rendered = serde_json::to_string_pretty(doc)?;
    if out.as_os_str() == "-" {
        let stdout = std::io::stdout();
        let mut lock = stdout.lock();
        lock.write_all(rendered.as_bytes())?;
        lock.write_all(b"\n")?;
        return Ok(());
    }
    if let Some(parent) = out.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let mut file = fs::File::create(out)?;
    file.write_all(rendered.as_bytes())?;
    file.write_all(b"\n")?;
    Ok(())
}
