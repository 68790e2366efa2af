use anyhow::bail;
use clap::Parser;
use ctwm_driver::{boot_fuzz, boot_reward, config::Config};
use env_logger::{Env, TimestampPrecision};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(version, about = "Concolic execution driver and reward oracle")]
struct Cli {
    /// Instrumented target program.
    target: PathBuf,
    /// Seed input: a file path, a 0x-prefixed hex string, or literal bytes.
    input: String,
    /// Branch metadata JSON; switches to reward mode.
    branch_meta: Option<PathBuf>,
    /// Model traces JSON (reward mode).
    traces: Option<PathBuf>,
    /// Reward report output path (reward mode).
    rewards_out: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_env = Env::new()
        .filter_or("CTWM_LOG", "info")
        .default_write_style_or("auto");
    env_logger::Builder::from_env(log_env)
        .format_timestamp(Some(TimestampPrecision::Seconds))
        .init();

    let config = Config::from_env()?;

    match (cli.branch_meta, cli.traces, cli.rewards_out) {
        (None, None, None) => boot_fuzz(cli.target, &cli.input, config),
        (Some(branch_meta), Some(traces), Some(rewards_out)) => boot_reward(
            cli.target,
            &cli.input,
            &branch_meta,
            &traces,
            &rewards_out,
            config,
        ),
        _ => bail!("reward mode needs branch_meta, traces and rewards_out together"),
    }
}
