use crate::executor::{ExecutionStatus, ProcessOutput};
use crate::library::ResourceModel;
use crate::seed::{SeedRecord, TempPath};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::BTreeSet;
use std::path::PathBuf;
use tracing::warn;

/// An `Observer` watches one seed execution and collects data about it.
///
/// Executors call `pre_exec` before the seed runs and `post_exec` after it
/// finished (or failed to build). The data an observer collects is exposed
/// through `serialize_data`, keyed by `name`, for oracles and feedbacks.
pub trait Observer: Send + Sync {
    /// Key under which this observer's data is published.
    fn name(&self) -> &'static str;

    /// Called immediately before `seed` is built and run. Usually resets.
    fn pre_exec(&mut self, seed: &SeedRecord) -> Result<(), anyhow::Error>;

    /// Called after the run with its status, whatever the executor captured
    /// (a [`ProcessOutput`] for native runs), and the seed itself.
    fn post_exec(
        &mut self,
        status: &ExecutionStatus,
        target_output: Option<&dyn Any>,
        seed: &SeedRecord,
    ) -> Result<(), anyhow::Error>;

    fn reset(&mut self) -> Result<(), anyhow::Error>;

    /// JSON data from the last execution, or `None` if there is nothing to say.
    fn serialize_data(&self) -> Option<Vec<u8>>;

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// An observer that performs no actions and collects no data.
#[derive(Default, Debug, Clone, Copy)]
pub struct NoOpObserver;

impl Observer for NoOpObserver {
    fn name(&self) -> &'static str {
        "NoOpObserver"
    }

    fn pre_exec(&mut self, _seed: &SeedRecord) -> Result<(), anyhow::Error> {
        Ok(())
    }

    fn post_exec(
        &mut self,
        _status: &ExecutionStatus,
        _target_output: Option<&dyn Any>,
        _seed: &SeedRecord,
    ) -> Result<(), anyhow::Error> {
        Ok(())
    }

    fn reset(&mut self) -> Result<(), anyhow::Error> {
        Ok(())
    }

    fn serialize_data(&self) -> Option<Vec<u8>> {
        None
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

pub const SANITIZER_OBSERVER_NAME: &str = "SanitizerObserver";
pub const TEMP_FILE_OBSERVER_NAME: &str = "TempFileObserver";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SanitizerTool {
    Address,
    UndefinedBehavior,
    Leak,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SanitizerReport {
    pub tool: SanitizerTool,
    pub summary: String,
}

/// Pulls sanitizer reports out of a run's stderr. Repeated identical reports
/// are collapsed.
pub fn scan_sanitizer_output(stderr: &str) -> Vec<SanitizerReport> {
    let mut reports: Vec<SanitizerReport> = Vec::new();
    for line in stderr.lines() {
        let found = if let Some(pos) = line.find("ERROR: AddressSanitizer:") {
            Some((SanitizerTool::Address, &line[pos + "ERROR: AddressSanitizer:".len()..]))
        } else if let Some(pos) = line.find("ERROR: LeakSanitizer:") {
            Some((SanitizerTool::Leak, &line[pos + "ERROR: LeakSanitizer:".len()..]))
        } else {
            line.find("runtime error:").map(|pos| {
                (
                    SanitizerTool::UndefinedBehavior,
                    &line[pos + "runtime error:".len()..],
                )
            })
        };
        if let Some((tool, rest)) = found {
            let report = SanitizerReport {
                tool,
                summary: rest.trim().to_string(),
            };
            if !reports.contains(&report) {
                reports.push(report);
            }
        }
    }
    reports
}

/// Scans the stderr of native runs for AddressSanitizer, LeakSanitizer and
/// UndefinedBehaviorSanitizer reports.
#[derive(Default, Debug)]
pub struct SanitizerObserver {
    reports: Vec<SanitizerReport>,
}

impl SanitizerObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reports(&self) -> &[SanitizerReport] {
        &self.reports
    }
}

impl Observer for SanitizerObserver {
    fn name(&self) -> &'static str {
        SANITIZER_OBSERVER_NAME
    }

    fn pre_exec(&mut self, _seed: &SeedRecord) -> Result<(), anyhow::Error> {
        self.reset()
    }

    fn post_exec(
        &mut self,
        _status: &ExecutionStatus,
        target_output: Option<&dyn Any>,
        _seed: &SeedRecord,
    ) -> Result<(), anyhow::Error> {
        if let Some(output) = target_output.and_then(|o| o.downcast_ref::<ProcessOutput>()) {
            self.reports = scan_sanitizer_output(&String::from_utf8_lossy(&output.stderr));
        }
        Ok(())
    }

    fn reset(&mut self) -> Result<(), anyhow::Error> {
        self.reports.clear();
        Ok(())
    }

    fn serialize_data(&self) -> Option<Vec<u8>> {
        if self.reports.is_empty() {
            return None;
        }
        serde_json::to_vec(&self.reports).ok()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Checks that a seed removed every temp file it declared. Leftovers are
/// recorded and then deleted so the next run starts clean. Files that were
/// already there before the run are not the seed's and are left alone.
#[derive(Debug)]
pub struct TempFileObserver {
    working_dir: PathBuf,
    model: ResourceModel,
    preexisting: BTreeSet<String>,
    leftovers: Vec<String>,
}

impl TempFileObserver {
    pub fn new(working_dir: PathBuf) -> Self {
        Self {
            working_dir,
            model: ResourceModel::new(),
            preexisting: BTreeSet::new(),
            leftovers: Vec::new(),
        }
    }

    fn declared_files(&self, seed: &SeedRecord) -> Vec<String> {
        seed.temp_files(&self.model)
            .into_iter()
            .filter_map(|path| match path {
                TempPath::Literal(name) => Some(name),
                TempPath::Unresolved(_) => None,
            })
            .collect()
    }

    pub fn leftovers(&self) -> &[String] {
        &self.leftovers
    }
}

impl Observer for TempFileObserver {
    fn name(&self) -> &'static str {
        TEMP_FILE_OBSERVER_NAME
    }

    fn pre_exec(&mut self, seed: &SeedRecord) -> Result<(), anyhow::Error> {
        self.reset()?;
        let existing: BTreeSet<String> = self
            .declared_files(seed)
            .into_iter()
            .filter(|name| self.working_dir.join(name).exists())
            .collect();
        for name in &existing {
            warn!("Seed {} temp file {name} exists before the run", seed.id());
        }
        self.preexisting = existing;
        Ok(())
    }

    fn post_exec(
        &mut self,
        status: &ExecutionStatus,
        _target_output: Option<&dyn Any>,
        seed: &SeedRecord,
    ) -> Result<(), anyhow::Error> {
        // Nothing ran.
        if matches!(status, ExecutionStatus::BuildFailed(_)) {
            return Ok(());
        }
        for name in self.declared_files(seed) {
            if self.preexisting.contains(&name) {
                continue;
            }
            let full = self.working_dir.join(&name);
            if full.exists() {
                if let Err(e) = std::fs::remove_file(&full) {
                    warn!("Could not remove leftover {full:?} of seed {}: {e}", seed.id());
                }
                self.leftovers.push(name);
            }
        }
        Ok(())
    }

    fn reset(&mut self) -> Result<(), anyhow::Error> {
        self.preexisting.clear();
        self.leftovers.clear();
        Ok(())
    }

    fn serialize_data(&self) -> Option<Vec<u8>> {
        if self.leftovers.is_empty() {
            return None;
        }
        serde_json::to_vec(&self.leftovers).ok()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
