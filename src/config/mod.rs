//! Service configuration, resolved from the environment at startup.
//!
//! Every setting has a default; `Config::from_env()` only fails on values
//! that are present but unparseable. `.env` files are loaded by `main`
//! before resolution.

mod fitness;
mod gauntlet;
pub(crate) mod helpers;

use std::path::{Path, PathBuf};

pub use fitness::FitnessConfig;
pub use gauntlet::{SandboxConfig, ScreenerConfig};

use crate::config::helpers::optional_env;
use crate::error::ConfigError;

/// Database filename inside the data directory.
const DB_FILENAME: &str = "agentevolution.db";

/// Root configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding the database and sandbox scratch space.
    pub data_dir: PathBuf,
    pub screener: ScreenerConfig,
    pub sandbox: SandboxConfig,
    pub fitness: FitnessConfig,
}

impl Config {
    /// Resolve configuration from the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let data_dir = optional_env("AGENTEVOLUTION_DATA_DIR")?
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./data"));

        Ok(Self {
            data_dir,
            screener: ScreenerConfig::resolve()?,
            sandbox: SandboxConfig::resolve()?,
            fitness: FitnessConfig::resolve()?,
        })
    }

    /// Path of the embedded database file.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join(DB_FILENAME)
    }

    /// Override the data directory (CLI flag beats environment).
    pub fn with_data_dir(mut self, dir: &Path) -> Self {
        self.data_dir = dir.to_path_buf();
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            screener: ScreenerConfig::default(),
            sandbox: SandboxConfig::default(),
            fitness: FitnessConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn db_path_is_under_data_dir() {
        let config = Config::default().with_data_dir(Path::new("/tmp/agentevolution-test"));
        assert_eq!(
            config.db_path(),
            PathBuf::from("/tmp/agentevolution-test/agentevolution.db")
        );
    }
}
