//! Process environment the coordinator depends on.

use crate::config::ConfigError;
use std::path::{Path, PathBuf};

pub const CONFIG_DIR_VAR: &str = "DAQCNC_CONFIG_DIR";
pub const SPOOL_DIR_VAR: &str = "DAQCNC_SPOOL_DIR";

/// Directories for run configurations and run output.
#[derive(Debug, Clone)]
pub struct DaqEnvironment {
    config_dir: PathBuf,
    spool_dir: PathBuf,
}

impl DaqEnvironment {
    /// Reads both directories from the environment. Either one missing is a
    /// configuration error.
    pub fn from_env() -> Result<Self, ConfigError> {
        let config_dir = std::env::var_os(CONFIG_DIR_VAR)
            .ok_or_else(|| ConfigError::MissingEnv(CONFIG_DIR_VAR.to_string()))?;
        let spool_dir = std::env::var_os(SPOOL_DIR_VAR)
            .ok_or_else(|| ConfigError::MissingEnv(SPOOL_DIR_VAR.to_string()))?;
        Self::new(config_dir, spool_dir)
    }

    pub fn new(
        config_dir: impl Into<PathBuf>,
        spool_dir: impl Into<PathBuf>,
    ) -> Result<Self, ConfigError> {
        let env = Self {
            config_dir: config_dir.into(),
            spool_dir: spool_dir.into(),
        };
        if !env.config_dir.is_dir() {
            return Err(ConfigError::ValidationError(format!(
                "config directory {} does not exist",
                env.config_dir.display()
            )));
        }
        if !env.spool_dir.is_dir() {
            return Err(ConfigError::ValidationError(format!(
                "spool directory {} does not exist",
                env.spool_dir.display()
            )));
        }
        Ok(env)
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn spool_dir(&self) -> &Path {
        &self.spool_dir
    }

    /// Output directory of one run.
    pub fn run_dir(&self, run_number: u32) -> PathBuf {
        self.spool_dir.join(format!("daqrun{:05}", run_number))
    }

    /// Persisted run and subrun numbers.
    pub fn run_number_file(&self) -> PathBuf {
        self.config_dir.join(".run_number")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_dir_layout() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("spool")).unwrap();
        let env = DaqEnvironment::new(dir.path(), dir.path().join("spool")).unwrap();
        assert_eq!(
            env.run_dir(42),
            dir.path().join("spool").join("daqrun00042")
        );
    }

    #[test]
    fn test_missing_config_dir() {
        let dir = tempfile::tempdir().unwrap();
        let err = DaqEnvironment::new(dir.path().join("nope"), dir.path()).unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn test_missing_spool_dir() {
        let dir = tempfile::tempdir().unwrap();
        let err = DaqEnvironment::new(dir.path(), dir.path().join("spool")).unwrap_err();
        assert!(err.to_string().contains("spool directory"));
        assert!(err.to_string().contains("does not exist"));
    }
}
