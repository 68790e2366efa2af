//! Driver configuration from the `TAINT_OPTIONS` environment string.

use std::env;
use std::path::PathBuf;
use thiserror::Error;

pub const TAINT_OPTIONS_ENV: &str = "TAINT_OPTIONS";

/// Bound on seeds ever processed plus seeds pending.
pub const DEFAULT_MAX_SEEDS: usize = 64;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("malformed option item '{0}', expected key=value")]
    Malformed(String),
    #[error("unknown option key '{0}'")]
    UnknownKey(String),
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Directory for generated inputs and temp seeds.
    pub output_dir: PathBuf,
    /// The child reads the input from stdin instead of a file.
    pub is_stdin: bool,
    /// Child-side debug logging.
    pub debug: bool,
    /// Undefined-behavior solving mode.
    pub solve_ub: bool,

    pub instance_id: u32,
    pub session_id: u32,
    pub max_seeds: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("."),
            is_stdin: false,
            debug: false,
            solve_ub: false,
            instance_id: 0,
            session_id: 0,
            max_seeds: DEFAULT_MAX_SEEDS,
        }
    }
}

fn truthy(v: &str) -> bool {
    v == "1" || v == "true"
}

impl Config {
    /// Parse a `TAINT_OPTIONS` string: colon- or space-separated
    /// `key=value` items. Unknown keys are errors only in strict mode.
    pub fn parse(options: &str, strict: bool) -> Result<Self, ConfigError> {
        let mut config = Config::default();
        for item in options.split([':', ' ']).filter(|s| !s.is_empty()) {
            let (key, value) = item
                .split_once('=')
                .ok_or_else(|| ConfigError::Malformed(item.to_string()))?;
            match key {
                "output_dir" => config.output_dir = PathBuf::from(value),
                "taint_file" => config.is_stdin = value == "stdin",
                "debug" => config.debug = truthy(value),
                "solve_ub" => config.solve_ub = truthy(value),
                _ => {
                    if strict {
                        return Err(ConfigError::UnknownKey(key.to_string()));
                    }
                    log::warn!("ignoring unknown taint option '{}'", key);
                }
            }
        }
        Ok(config)
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        match env::var(TAINT_OPTIONS_ENV) {
            Ok(options) => Self::parse(&options, false),
            Err(_) => Ok(Config::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let c = Config::parse("", false).unwrap();
        assert_eq!(c.output_dir, PathBuf::from("."));
        assert!(!c.is_stdin);
        assert!(!c.debug);
        assert!(!c.solve_ub);
        assert_eq!(c.max_seeds, DEFAULT_MAX_SEEDS);
    }

    #[test]
    fn colon_separated() {
        let c = Config::parse("output_dir=/tmp/out:taint_file=stdin:debug=1", false).unwrap();
        assert_eq!(c.output_dir, PathBuf::from("/tmp/out"));
        assert!(c.is_stdin);
        assert!(c.debug);
    }

    #[test]
    fn space_separated() {
        let c = Config::parse("solve_ub=true taint_file=/tmp/seed", false).unwrap();
        assert!(c.solve_ub);
        assert!(!c.is_stdin);
    }

    #[test]
    fn unknown_key_strictness() {
        assert!(Config::parse("nope=1", false).is_ok());
        assert!(matches!(
            Config::parse("nope=1", true),
            Err(ConfigError::UnknownKey(_))
        ));
    }

    #[test]
    fn malformed_item() {
        assert!(matches!(
            Config::parse("debug", false),
            Err(ConfigError::Malformed(_))
        ));
    }
}
