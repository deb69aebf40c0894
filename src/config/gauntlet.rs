//! Configuration for the Gauntlet: static screening and the sandbox.

use std::collections::HashSet;
use std::time::Duration;

use crate::config::helpers::{optional_env, parse_optional_env};
use crate::error::ConfigError;

/// Imports submitted code may use without triggering a rejection.
///
/// Covers arithmetic, strings, JSON, dates, hashing, regex, and typing —
/// everything else (filesystem, subprocess, sockets, process control) is
/// denied by omission.
const DEFAULT_ALLOWED_IMPORTS: &[&str] = &[
    "math",
    "statistics",
    "decimal",
    "fractions",
    "random",
    "string",
    "textwrap",
    "json",
    "datetime",
    "time",
    "hashlib",
    "re",
    "typing",
    "itertools",
    "functools",
    "collections",
    "dataclasses",
    "enum",
    "abc",
    "copy",
    "uuid",
    "base64",
    "unicodedata",
];

/// Static screener configuration.
#[derive(Debug, Clone)]
pub struct ScreenerConfig {
    /// Root modules submitted code may import.
    pub allowed_imports: HashSet<String>,
    /// Maximum accepted code size in bytes.
    pub max_code_size_bytes: usize,
    /// Maximum accepted description length in characters.
    pub max_description_len: usize,
}

impl Default for ScreenerConfig {
    fn default() -> Self {
        Self {
            allowed_imports: DEFAULT_ALLOWED_IMPORTS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            max_code_size_bytes: 50_000,
            max_description_len: 2_000,
        }
    }
}

impl ScreenerConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        // Comma-separated list replaces the default allow-list entirely.
        if let Some(raw) = optional_env("SCREENER_ALLOWED_IMPORTS")? {
            config.allowed_imports = raw
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }

        config.max_code_size_bytes =
            parse_optional_env("SCREENER_MAX_CODE_BYTES", config.max_code_size_bytes)?;
        config.max_description_len =
            parse_optional_env("SCREENER_MAX_DESCRIPTION_LEN", config.max_description_len)?;

        Ok(config)
    }
}

/// Sandbox executor configuration.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Interpreter used to run submitted tools.
    pub python_bin: String,
    /// CPU-time limit for the child process.
    pub cpu_limit: Duration,
    /// Wall-clock limit; the child is killed when exceeded.
    pub wall_limit: Duration,
    /// Address-space limit in MiB.
    pub memory_limit_mb: u64,
    /// Concurrent executions.
    pub pool_size: usize,
    /// Waiting submissions beyond the pool before failing fast.
    pub max_queue_depth: usize,
    /// Captured stdout/stderr are truncated to this many bytes each.
    pub max_output_bytes: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            python_bin: "python3".to_string(),
            cpu_limit: Duration::from_secs(5),
            wall_limit: Duration::from_secs(10),
            memory_limit_mb: 256,
            pool_size: 4,
            max_queue_depth: 64,
            max_output_bytes: 10_000,
        }
    }
}

impl SandboxConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let cpu_secs = parse_optional_env("SANDBOX_CPU_LIMIT_SECS", defaults.cpu_limit.as_secs())?;
        let wall_secs =
            parse_optional_env("SANDBOX_WALL_LIMIT_SECS", defaults.wall_limit.as_secs())?;
        if wall_secs == 0 || cpu_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "SANDBOX_WALL_LIMIT_SECS".to_string(),
                message: "limits must be positive".to_string(),
            });
        }

        Ok(Self {
            python_bin: optional_env("SANDBOX_PYTHON_BIN")?.unwrap_or(defaults.python_bin),
            cpu_limit: Duration::from_secs(cpu_secs),
            wall_limit: Duration::from_secs(wall_secs),
            memory_limit_mb: parse_optional_env("SANDBOX_MEMORY_LIMIT_MB", defaults.memory_limit_mb)?,
            pool_size: parse_optional_env("SANDBOX_POOL_SIZE", defaults.pool_size)?.max(1),
            max_queue_depth: parse_optional_env("SANDBOX_MAX_QUEUE_DEPTH", defaults.max_queue_depth)?,
            max_output_bytes: parse_optional_env("SANDBOX_MAX_OUTPUT_BYTES", defaults.max_output_bytes)?,
        })
    }
}
