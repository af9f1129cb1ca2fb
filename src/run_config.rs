//! Named run configurations.
//!
//! A run configuration is a TOML file in the configuration directory listing
//! the components a run needs:
//!
//! ```toml
//! components = ["stringHub#1", "stringHub#2", "inIceTrigger", "eventBuilder"]
//!
//! [[radar]]
//! hub = 1
//! mbid = "0123456789ab"
//! ```

use crate::component::ComponentSpec;
use crate::error::{CncError, CncResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// A channel whose hit rate the radar task follows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RadarChannel {
    /// Instance number of the source carrying the channel.
    pub hub: u32,
    pub mbid: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub components: Vec<ComponentSpec>,
    #[serde(default)]
    pub radar: Vec<RadarChannel>,
}

impl RunConfig {
    pub fn new(name: impl Into<String>, components: Vec<ComponentSpec>) -> Self {
        Self {
            name: name.into(),
            components,
            radar: Vec::new(),
        }
    }

    pub fn parse(name: &str, text: &str) -> CncResult<Self> {
        let mut config: RunConfig = toml::from_str(text).map_err(|e| {
            CncError::Configuration(format!("run configuration '{}': {}", name, e))
        })?;
        config.name = name.to_string();
        if config.components.is_empty() {
            return Err(CncError::NoComponents);
        }
        Ok(config)
    }
}

/// Loads run configurations by name from a directory.
#[derive(Debug, Clone)]
pub struct RunConfigStore {
    dir: PathBuf,
}

impl RunConfigStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// File holding the named configuration. Names are plain file stems, so
    /// anything that could leave the directory is rejected.
    pub fn path_for(&self, name: &str) -> CncResult<PathBuf> {
        let stem = name.trim_end_matches(".toml");
        if stem.is_empty()
            || stem.starts_with('.')
            || stem.contains("..")
            || stem.contains(['/', '\\'])
        {
            return Err(CncError::Configuration(format!(
                "invalid run configuration name '{}'",
                name
            )));
        }
        Ok(self.dir.join(format!("{}.toml", stem)))
    }

    pub fn load(&self, name: &str) -> CncResult<RunConfig> {
        let name = name.trim_end_matches(".toml");
        let path = self.path_for(name)?;
        let text = read(&path).map_err(|e| {
            CncError::Configuration(format!(
                "cannot read run configuration {}: {}",
                path.display(),
                e
            ))
        })?;
        RunConfig::parse(name, &text)
    }
}

fn read(path: &Path) -> std::io::Result<String> {
    std::fs::read_to_string(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_by_name() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("sps-std.toml"),
            "components = [\"hub#1\", \"builder\"]\n[[radar]]\nhub = 1\nmbid = \"abc\"\n",
        )
        .unwrap();

        let store = RunConfigStore::new(dir.path());
        let config = store.load("sps-std").unwrap();
        assert_eq!(config.name, "sps-std");
        assert_eq!(
            config.components,
            vec![ComponentSpec::new("hub", 1), ComponentSpec::new("builder", 0)]
        );
        assert_eq!(config.radar.len(), 1);
        assert_eq!(store.load("sps-std.toml").unwrap(), config);
    }

    #[test]
    fn test_empty_component_list() {
        let err = RunConfig::parse("empty", "components = []").unwrap_err();
        assert!(matches!(err, CncError::NoComponents));
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = RunConfigStore::new(dir.path()).load("nope").unwrap_err();
        assert_eq!(err.kind(), "ConfigError");
    }

    #[test]
    fn test_names_cannot_leave_the_directory() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("config");
        std::fs::create_dir(&dir).unwrap();
        std::fs::write(root.path().join("secret.toml"), "components = [\"hub\"]\n").unwrap();

        let store = RunConfigStore::new(&dir);
        for name in ["../secret", "sub/secret", "sub\\secret", "..", "", ".hidden"] {
            let err = store.load(name).unwrap_err();
            assert_eq!(err.kind(), "ConfigError", "{}", name);
            assert!(err.to_string().contains("invalid run configuration name"), "{}", err);
        }
        assert!(store.path_for("sps-std").unwrap().starts_with(&dir));
    }
}
