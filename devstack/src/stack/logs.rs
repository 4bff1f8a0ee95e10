// File: devstack/src/stack/logs.rs
//
// Naming of per-run log files: one file per role, all files of one run share
// the timestamp of the run start.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};

use crate::process::ProcessRole;

const TIMESTAMP_FORMAT: &str = "%Y%m%d-%H%M%S";

#[derive(Debug, Clone)]
pub struct LogLayout {
    dir: PathBuf,
    stamp: String,
}

impl LogLayout {
    pub fn new(dir: impl Into<PathBuf>, started_at: DateTime<Local>) -> Self {
        Self {
            dir: dir.into(),
            stamp: started_at.format(TIMESTAMP_FORMAT).to_string(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// `<dir>/<timestamp>-<role>.log`
    pub fn path_for(&self, role: ProcessRole) -> PathBuf {
        self.dir.join(format!("{}-{}.log", self.stamp, role))
    }
}
