//! Concolic execution driver: launches a symsan-instrumented target,
//! solves branch and bounds constraints from its event stream, recycles
//! derived seeds, and in reward mode scores model-proposed traces.

pub mod config;
pub mod driver;
pub mod event;
pub mod launch;
pub mod reward;
pub mod seed;
mod util;

use crate::{
    config::Config,
    driver::Driver,
    launch::Launcher,
    reward::{write_rewards, RewardOracle, TracesFile},
    seed::Seed,
};
use anyhow::Context as _;
use ctwm_core::{
    label::{UnionTable, UNION_TABLE_SIZE},
    HashMap, ParserSolver,
};
use std::fs;
use std::path::{Path, PathBuf};

/// Fuzz mode: one run from the given seed, derived inputs written to the
/// output directory.
pub fn boot_fuzz(target: PathBuf, input: &str, config: Config) -> anyhow::Result<()> {
    let seed = load_seed_input(input)?;

    let mut launcher = setup_launcher(&target, &config)?;
    let z3_config = z3::Config::new();
    let z3_ctx = z3::Context::new(&z3_config);
    let table = unsafe { UnionTable::from_raw(launcher.table_ptr(), launcher.table_len()) };
    let parser = ParserSolver::new(&z3_ctx, table);

    let mut driver = Driver::new(target, config, parser, HashMap::default());
    driver.run_one(&mut launcher, Seed::new(seed))
}

/// Reward mode: explore the bounded seed queue, then score the model traces
/// and write the reward report.
pub fn boot_reward(
    target: PathBuf,
    input: &str,
    branch_meta: &Path,
    traces: &Path,
    rewards_out: &Path,
    config: Config,
) -> anyhow::Result<()> {
    let seed = load_seed_input(input)?;
    let oracle = RewardOracle::load(branch_meta)
        .with_context(|| format!("failed to load {}", branch_meta.display()))?;
    let traces_file = fs::File::open(traces)
        .with_context(|| format!("failed to open {}", traces.display()))?;
    let traces: TracesFile =
        serde_json::from_reader(traces_file).context("failed to parse traces")?;

    let mut launcher = setup_launcher(&target, &config)?;
    let z3_config = z3::Config::new();
    let z3_ctx = z3::Context::new(&z3_config);
    let table = unsafe { UnionTable::from_raw(launcher.table_ptr(), launcher.table_len()) };
    let parser = ParserSolver::new(&z3_ctx, table);

    let mut driver = Driver::new(target, config, parser, oracle.line_of_sym());
    driver.explore(&mut launcher, Seed::new(seed));

    let rows = driver.score_traces(&oracle, &traces);
    write_rewards(rewards_out, rows)
        .with_context(|| format!("failed to write {}", rewards_out.display()))?;
    log::info!("reward report written to {}", rewards_out.display());
    Ok(())
}

fn setup_launcher(target: &Path, config: &Config) -> anyhow::Result<Launcher> {
    fs::create_dir_all(&config.output_dir)
        .with_context(|| format!("failed to create {}", config.output_dir.display()))?;
    let mut launcher =
        Launcher::init(target, UNION_TABLE_SIZE).context("failed to map label table")?;
    launcher.set_debug(config.debug);
    launcher.set_bounds_check(true);
    launcher.set_solve_ub(config.solve_ub);
    Ok(launcher)
}

/// A seed argument is a file path if one exists, otherwise a `0x`-prefixed
/// hex string or the literal bytes of the argument.
pub fn load_seed_input(input: &str) -> anyhow::Result<Vec<u8>> {
    let path = Path::new(input);
    if path.is_file() {
        return fs::read(path).with_context(|| format!("failed to read {}", input));
    }
    if let Some(hex) = input.strip_prefix("0x") {
        if !hex.is_empty() && hex.len() % 2 == 0 {
            if let Some(bytes) = decode_hex(hex) {
                return Ok(bytes);
            }
        }
    }
    Ok(input.as_bytes().to_vec())
}

fn decode_hex(hex: &str) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(hex.len() / 2);
    let bytes = hex.as_bytes();
    for pair in bytes.chunks(2) {
        let hi = (pair[0] as char).to_digit(16)?;
        let lo = (pair[1] as char).to_digit(16)?;
        out.push((hi * 16 + lo) as u8);
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn seed_input_from_file() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(b"seed bytes").unwrap();
        let bytes = load_seed_input(f.path().to_str().unwrap()).unwrap();
        assert_eq!(bytes, b"seed bytes");
    }

    #[test]
    fn seed_input_from_hex() {
        assert_eq!(load_seed_input("0x1a1d").unwrap(), vec![0x1a, 0x1d]);
        assert_eq!(load_seed_input("0xFF00").unwrap(), vec![0xff, 0x00]);
    }

    #[test]
    fn seed_input_literal_fallback() {
        assert_eq!(load_seed_input("hello").unwrap(), b"hello");
        // odd-length or non-hex strings are literal bytes
        assert_eq!(load_seed_input("0x123").unwrap(), b"0x123");
        assert_eq!(load_seed_input("0xzz").unwrap(), b"0xzz");
    }
}
