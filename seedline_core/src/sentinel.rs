//! The Sentinel Result Protocol: how a seed reports completion or a documented
//! failure, and how that survives the trip through a process exit status.

use crate::library::TargetLibrary;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Returned by a seed that ran its whole sequence.
pub const SUCCESS_SENTINEL: i64 = 66;

/// Largest step number either failure family can carry.
pub const MAX_FAILURE_STEP: u8 = 31;

const OPERATION_BASE: i64 = 32;

/// Exit status of a wrapper whose seed returned something outside the protocol.
pub const AMBIGUOUS_EXIT_CODE: i32 = 100;

/// Exit status AddressSanitizer is told to use when it reports.
pub const SANITIZER_EXIT_CODE: i32 = 168;

/// What a seed's return value says about the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SeedOutcome {
    Success,
    /// Acquire step `k` (1-based) failed; returned as `-k`.
    SetupFailed(u8),
    /// Operation step `k` (1-based) failed; returned as `-(32 + k)`.
    OperationFailed(u8),
}

impl SeedOutcome {
    /// Clamps `step` into `1..=31`.
    pub fn setup_failed(step: usize) -> Self {
        SeedOutcome::SetupFailed(clamp_step(step))
    }

    pub fn operation_failed(step: usize) -> Self {
        SeedOutcome::OperationFailed(clamp_step(step))
    }

    pub fn return_value(&self) -> i64 {
        match self {
            SeedOutcome::Success => SUCCESS_SENTINEL,
            SeedOutcome::SetupFailed(k) => -i64::from(*k),
            SeedOutcome::OperationFailed(k) => -(OPERATION_BASE + i64::from(*k)),
        }
    }

    /// Decodes a seed return value. Anything outside the sentinel and the two
    /// failure ranges is not part of the protocol.
    pub fn from_return_value(value: i64) -> Option<Self> {
        if value == SUCCESS_SENTINEL {
            return Some(SeedOutcome::Success);
        }
        let magnitude = value.checked_neg()?;
        let max = i64::from(MAX_FAILURE_STEP);
        match magnitude {
            1..=31 => Some(SeedOutcome::SetupFailed(magnitude as u8)),
            m if m > OPERATION_BASE && m <= OPERATION_BASE + max => {
                Some(SeedOutcome::OperationFailed((m - OPERATION_BASE) as u8))
            }
            _ => None,
        }
    }

    pub fn is_failure(&self) -> bool {
        !matches!(self, SeedOutcome::Success)
    }

    /// Process exit status the `main()` wrapper turns this outcome into.
    pub fn exit_code(&self) -> i32 {
        match self {
            SeedOutcome::Success => 0,
            // Failure values are -1..=-63, so the negation fits an exit status.
            other => (-other.return_value()) as i32,
        }
    }
}

impl fmt::Display for SeedOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SeedOutcome::Success => write!(f, "success ({SUCCESS_SENTINEL})"),
            SeedOutcome::SetupFailed(k) => write!(f, "setup step {k} failed"),
            SeedOutcome::OperationFailed(k) => write!(f, "operation step {k} failed"),
        }
    }
}

fn clamp_step(step: usize) -> u8 {
    step.clamp(1, usize::from(MAX_FAILURE_STEP)) as u8
}

/// Classification of a wrapper process's exit status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitClass {
    Outcome(SeedOutcome),
    Ambiguous,
    Sanitizer,
    /// An exit status nothing in the protocol produces.
    Unexpected(i32),
}

impl ExitClass {
    pub fn from_exit_code(code: i32) -> Self {
        match code {
            0 => ExitClass::Outcome(SeedOutcome::Success),
            AMBIGUOUS_EXIT_CODE => ExitClass::Ambiguous,
            SANITIZER_EXIT_CODE => ExitClass::Sanitizer,
            c @ 1..=63 => match SeedOutcome::from_return_value(-i64::from(c)) {
                Some(outcome) => ExitClass::Outcome(outcome),
                None => ExitClass::Unexpected(c),
            },
            c => ExitClass::Unexpected(c),
        }
    }
}

/// Emits the translation unit that turns a seed's return value into a process
/// exit status.
pub fn render_main(library: TargetLibrary) -> String {
    let function = library.function_name();
    format!(
        "// Generated by seedline: maps the seed's return value onto the exit status.\n\
         extern int {function}();\n\
         \n\
         int main(void) {{\n\
         \x20   int rc = {function}();\n\
         \x20   if (rc == {SUCCESS_SENTINEL}) {{\n\
         \x20       return 0;\n\
         \x20   }}\n\
         \x20   if (rc <= -1 && rc >= -{max_operation} && rc != -{OPERATION_BASE}) {{\n\
         \x20       return -rc;\n\
         \x20   }}\n\
         \x20   return {AMBIGUOUS_EXIT_CODE};\n\
         }}\n",
        max_operation = OPERATION_BASE + i64::from(MAX_FAILURE_STEP),
    )
}
