//! Standalone runner for the index pass over a module JSON dump.
//!
//! Usage: ctwm-index <module.json> [-symsan-ctwm-enable-index]
//!        [-symsan-ctwm-disable-index] [-symsan-ctwm-enable-bb-trace]
//!        [-symsan-ctwm-disable-bb-trace] [-symsan-ctwm-index-out=PATH]
//!        [--module-out PATH]

use ctwm_index::ir::Module;
use ctwm_index::{IndexPass, PassConfig};
use std::path::PathBuf;
use std::process::exit;

fn main() {
    env_logger::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut module_path = None;
    let mut module_out: Option<PathBuf> = None;
    let mut pass_args = Vec::new();
    let mut iter = args.into_iter();
    while let Some(arg) = iter.next() {
        if arg == "--module-out" {
            module_out = iter.next().map(PathBuf::from);
        } else if let Some(out) = arg.strip_prefix("--module-out=") {
            module_out = Some(PathBuf::from(out));
        } else if arg.starts_with('-') {
            pass_args.push(arg);
        } else if module_path.is_none() {
            module_path = Some(PathBuf::from(arg));
        } else {
            pass_args.push(arg);
        }
    }

    let module_path = match module_path {
        Some(p) => p,
        None => {
            eprintln!("usage: ctwm-index <module.json> [pass flags]");
            exit(1);
        }
    };

    let content = match std::fs::read_to_string(&module_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("failed to read {}: {}", module_path.display(), e);
            exit(1);
        }
    };
    let mut module: Module = match serde_json::from_str(&content) {
        Ok(m) => m,
        Err(e) => {
            eprintln!("failed to parse {}: {}", module_path.display(), e);
            exit(1);
        }
    };

    // the standalone runner enables emission unless flags say otherwise
    let mut config = PassConfig::with_build_defaults(true, false);
    config.apply_cli_args(&pass_args);

    let pass = IndexPass::new(config);
    let outcome = match pass.run(&mut module) {
        Ok(o) => o,
        Err(e) => {
            eprintln!("pass failed: {}", e);
            exit(1);
        }
    };

    if outcome.changed {
        if let Some(out) = module_out {
            let rendered = match serde_json::to_string_pretty(&module) {
                Ok(r) => r,
                Err(e) => {
                    eprintln!("failed to render module: {}", e);
                    exit(1);
                }
            };
            if let Err(e) = std::fs::write(&out, rendered + "\n") {
                eprintln!("failed to write {}: {}", out.display(), e);
                exit(1);
            }
        }
    }
}
