//! Compile-time companion of the ctwm driver: numbers basic blocks,
//! extracts the conditional-branch graph with source coordinates and
//! symbolic ids, emits the CTWM index JSON, and optionally injects
//! per-block trace probes.

pub mod emit;
pub mod ir;
pub mod pass;
pub mod trace_log;

use std::sync::OnceLock;
use thiserror::Error;

pub use emit::{write_index, IndexDoc, DEFAULT_INDEX_OUT, INDEX_VERSION};
pub use pass::{IndexPass, PassConfig, PassOutcome};

#[derive(Debug, Error)]
pub enum PassError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

pub const DEBUG_ENV: &str = "SYMSAN_CTWM_DEBUG";

/// Pass debug logging, toggled by a non-empty `SYMSAN_CTWM_DEBUG`.
pub fn debug_enabled() -> bool {
    static ENABLED: OnceLock<bool> = OnceLock::new();
    *ENABLED.get_or_init(|| {
        std::env::var_os(DEBUG_ENV)
            .map(|v| !v.is_empty())
            .unwrap_or(false)
    })
}
