//! `++aptupdateall`: maintenance across every control program in a directory.
//!
//! Candidates are recognised by reading their marker, never by running them.
//! Each is updated through a fresh invocation so one target's failure or
//! crash cannot take down the rest.

use crate::CoreError;
use appcage_schema::has_control_marker;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{info, warn};

/// Largest file inspected for the marker.
const MAX_CANDIDATE_BYTES: u64 = 1024 * 1024;

/// Control programs in `dir`, sorted by file name.
pub fn discover(dir: &Path) -> Result<Vec<PathBuf>, CoreError> {
    let mut found = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let Ok(meta) = fs::metadata(&path) else {
            continue;
        };
        if !meta.is_file() || meta.len() > MAX_CANDIDATE_BYTES {
            continue;
        }
        // Binaries and unreadable files are simply not control programs.
        let Ok(text) = fs::read_to_string(&path) else {
            continue;
        };
        if has_control_marker(&text) {
            found.push(path);
        }
    }
    found.sort();
    Ok(found)
}

/// Runs maintenance for one control program and returns its exit code.
pub trait TargetRunner {
    fn run(&self, target: &Path) -> Result<i32, String>;
}

/// Invokes `<exe> control <target> ++aptupdate` as a child process.
pub struct ProcessRunner {
    exe: PathBuf,
}

impl ProcessRunner {
    pub fn new(exe: impl Into<PathBuf>) -> Self {
        Self { exe: exe.into() }
    }

    pub fn current() -> Result<Self, CoreError> {
        Ok(Self::new(std::env::current_exe()?))
    }
}

impl TargetRunner for ProcessRunner {
    fn run(&self, target: &Path) -> Result<i32, String> {
        let status = Command::new(&self.exe)
            .arg("control")
            .arg(target)
            .arg("++aptupdate")
            .status()
            .map_err(|e| format!("failed to run {}: {e}", self.exe.display()))?;
        Ok(appcage_runtime::command::exit_code(status))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum TargetOutcome {
    Updated,
    Failed(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FleetReport {
    /// Keyed by control program path.
    pub outcomes: BTreeMap<String, TargetOutcome>,
}

impl FleetReport {
    pub fn success(&self) -> bool {
        self.failed() == 0
    }

    pub fn failed(&self) -> usize {
        self.outcomes
            .values()
            .filter(|o| matches!(o, TargetOutcome::Failed(_)))
            .count()
    }
}

pub struct FleetUpdateCoordinator<R> {
    runner: R,
}

impl<R: TargetRunner> FleetUpdateCoordinator<R> {
    pub fn new(runner: R) -> Self {
        Self { runner }
    }

    /// Update every control program in `dir`, continuing past failures.
    pub fn update_all(&self, dir: &Path) -> Result<FleetReport, CoreError> {
        let targets = discover(dir)?;
        info!("updating {} environment(s) in {}", targets.len(), dir.display());
        let mut report = FleetReport::default();
        for target in targets {
            let outcome = match self.runner.run(&target) {
                Ok(0) => TargetOutcome::Updated,
                Ok(code) => TargetOutcome::Failed(format!("exited with status {code}")),
                Err(e) => TargetOutcome::Failed(e),
            };
            if let TargetOutcome::Failed(reason) = &outcome {
                warn!("{}: {reason}", target.display());
            }
            report
                .outcomes
                .insert(target.display().to_string(), outcome);
        }
        Ok(report)
    }
}
