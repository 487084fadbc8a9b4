use crate::executor::ExecutionStatus;
use crate::feedback::ObserversData;
use crate::observer::{SANITIZER_OBSERVER_NAME, SanitizerReport, TEMP_FILE_OBSERVER_NAME};
use crate::seed::SeedRecord;
use serde::Serialize;
use std::fmt;

/// Default severity level for crashes detected by `SeedOracle`.
pub const DEFAULT_CRASH_SEVERITY: u8 = 10;
const SANITIZER_SEVERITY: u8 = 9;
const TIMEOUT_SEVERITY: u8 = 5;
const LEFTOVER_SEVERITY: u8 = 2;
/// Findings from seeds that perturb a call into undefined behaviour on purpose.
const DELIBERATE_UB_SEVERITY: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FindingKind {
    Crash,
    Sanitizer,
    Timeout,
    LeftoverTempFile,
}

impl fmt::Display for FindingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FindingKind::Crash => "crash",
            FindingKind::Sanitizer => "sanitizer",
            FindingKind::Timeout => "timeout",
            FindingKind::LeftoverTempFile => "leftover-temp-file",
        })
    }
}

/// Something a seed run did that the harness contract rules out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BugReport {
    pub seed_id: u64,
    pub kind: FindingKind,
    /// A human-readable description of the finding.
    pub description: String,
    /// MD5 of the seed source, hex encoded.
    pub seed_hash: String,
    pub severity: u8,
}

/// An `Oracle` examines the outcome of a seed run for findings.
pub trait Oracle: Send + Sync {
    /// # Arguments
    /// * `seed`: The seed that was executed.
    /// * `status`: What the executor reported.
    /// * `observers_data`: Serialized observer output keyed by observer name.
    fn examine(
        &self,
        seed: &SeedRecord,
        status: &ExecutionStatus,
        observers_data: &ObserversData,
    ) -> Vec<BugReport>;
}

/// Reports crashes, sanitizer reports, timeouts and leftover temp files.
///
/// A completed run or a documented failure code is never a finding: the
/// protocol only promises that the seed does not crash. Crashes of seeds with
/// deliberate undefined behaviour are still reported, at minimal severity.
#[derive(Debug, Default)]
pub struct SeedOracle;

impl SeedOracle {
    pub fn new() -> Self {
        SeedOracle
    }
}

fn observer_json<T: serde::de::DeserializeOwned>(data: &ObserversData, name: &str) -> Vec<T> {
    data.get(name)
        .and_then(|bytes| bytes.as_deref())
        .and_then(|bytes| serde_json::from_slice(bytes).ok())
        .unwrap_or_default()
}

impl Oracle for SeedOracle {
    fn examine(
        &self,
        seed: &SeedRecord,
        status: &ExecutionStatus,
        observers_data: &ObserversData,
    ) -> Vec<BugReport> {
        let seed_hash = format!("{:x}", md5::compute(seed.as_bytes()));
        let deliberate_ub = seed
            .calls()
            .iter()
            .any(|call| call.edge_case.as_ref().is_some_and(|tag| tag.deliberate_ub));
        let report = |kind: FindingKind, description: String, severity: u8| {
            let (description, severity) = if deliberate_ub && kind != FindingKind::LeftoverTempFile
            {
                (
                    format!("{description} (seed contains deliberate undefined behaviour)"),
                    DELIBERATE_UB_SEVERITY,
                )
            } else {
                (description, severity)
            };
            BugReport {
                seed_id: seed.id(),
                kind,
                description,
                seed_hash: seed_hash.clone(),
                severity,
            }
        };

        let mut findings = Vec::new();
        let sanitizer: Vec<SanitizerReport> =
            observer_json(observers_data, SANITIZER_OBSERVER_NAME);
        for entry in &sanitizer {
            findings.push(report(
                FindingKind::Sanitizer,
                format!("{:?}: {}", entry.tool, entry.summary),
                SANITIZER_SEVERITY,
            ));
        }
        match status {
            ExecutionStatus::Crash(description) if sanitizer.is_empty() => {
                findings.push(report(
                    FindingKind::Crash,
                    description.clone(),
                    DEFAULT_CRASH_SEVERITY,
                ));
            }
            ExecutionStatus::Timeout => {
                findings.push(report(
                    FindingKind::Timeout,
                    "seed did not finish within the timeout".to_string(),
                    TIMEOUT_SEVERITY,
                ));
            }
            _ => {}
        }
        let leftovers: Vec<String> = observer_json(observers_data, TEMP_FILE_OBSERVER_NAME);
        for name in leftovers {
            findings.push(report(
                FindingKind::LeftoverTempFile,
                format!("temp file '{name}' still exists after the run"),
                LEFTOVER_SEVERITY,
            ));
        }
        findings
    }
}
