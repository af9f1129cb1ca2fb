//! Persistence of the last run and subrun numbers.
//!
//! The file holds a single line `"<run> <subrun>"`. Writes go to a sibling
//! temporary file that is renamed into place.

use crate::error::{CncError, CncResult};
use parking_lot::Mutex;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

pub struct RunNumberStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl RunNumberStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Last saved `(run, subrun)`, or `(0, 0)` when nothing was saved yet.
    pub fn load(&self) -> CncResult<(u32, u32)> {
        let _guard = self.lock.lock();
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok((0, 0)),
            Err(e) => return Err(e.into()),
        };
        parse(&text).ok_or_else(|| {
            CncError::Configuration(format!(
                "corrupt run number file {}: '{}'",
                self.path.display(),
                text.trim()
            ))
        })
    }

    pub fn save(&self, run: u32, subrun: u32) -> CncResult<()> {
        let _guard = self.lock.lock();
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, format!("{} {}\n", run, subrun))?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

fn parse(text: &str) -> Option<(u32, u32)> {
    let mut fields = text.split_whitespace();
    let run = fields.next()?.parse().ok()?;
    let subrun = match fields.next() {
        Some(s) => s.parse().ok()?,
        None => 0,
    };
    Some((run, subrun))
}
