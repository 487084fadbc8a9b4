//! Static checks a seed must pass before it is worth compiling.
//!
//! Resource and temp-file rules are checked on every control-flow path: guards
//! fork, loops run zero or one time, and a `return` ends the path.

use crate::library::{EdgeCaseKind, ResourceModel};
use crate::seed::{Bindings, LibraryCall, ReturnValue, SeedRecord, Statement, TempPath};
use crate::sentinel::{SUCCESS_SENTINEL, SeedOutcome};
use crate::sequencer::{ResourceTracker, SequenceFault};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::debug;

/// Paths explored per seed before the rest are dropped with a warning.
pub const MAX_PATHS: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Rule {
    Sentinel,
    ResourceBalance,
    TempFileCleanup,
    Namespace,
    EdgeCaseTagging,
    MetadataConsistency,
    PathLimit,
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Rule::Sentinel => "sentinel",
            Rule::ResourceBalance => "resource-balance",
            Rule::TempFileCleanup => "temp-file-cleanup",
            Rule::Namespace => "namespace",
            Rule::EdgeCaseTagging => "edge-case-tagging",
            Rule::MetadataConsistency => "metadata-consistency",
            Rule::PathLimit => "path-limit",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Severity {
    Error,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct Violation {
    pub rule: Rule,
    pub severity: Severity,
    pub message: String,
}

impl Violation {
    fn error(rule: Rule, message: impl Into<String>) -> Self {
        Self {
            rule,
            severity: Severity::Error,
            message: message.into(),
        }
    }

    fn warning(rule: Rule, message: impl Into<String>) -> Self {
        Self {
            rule,
            severity: Severity::Warning,
            message: message.into(),
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self.severity {
            Severity::Error => "error",
            Severity::Warning => "warning",
        };
        write!(f, "{level}[{}]: {}", self.rule, self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationReport {
    pub seed_id: u64,
    pub violations: Vec<Violation>,
    pub paths_checked: usize,
    pub edge_case: bool,
}

impl ValidationReport {
    /// No error-level violations.
    pub fn is_well_formed(&self) -> bool {
        !self.violations.iter().any(|v| v.severity == Severity::Error)
    }

    /// At least one call is tagged as a deliberate edge case.
    pub fn is_edge_case(&self) -> bool {
        self.edge_case
    }

    pub fn errors(&self) -> impl Iterator<Item = &Violation> {
        self.violations.iter().filter(|v| v.severity == Severity::Error)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &Violation> {
        self.violations.iter().filter(|v| v.severity == Severity::Warning)
    }
}

/// Runs every check against `seed`.
pub fn validate(seed: &SeedRecord, model: &ResourceModel) -> ValidationReport {
    let mut violations = BTreeSet::new();
    check_sentinel(seed.body(), &mut violations);
    let paths_checked = check_paths(seed, model, &mut violations);
    check_namespace(seed, model, &mut violations);
    check_edge_case_tags(seed, model, &mut violations);
    check_metadata(seed, &mut violations);

    let report = ValidationReport {
        seed_id: seed.id(),
        violations: violations.into_iter().collect(),
        paths_checked,
        edge_case: seed.has_edge_cases(),
    };
    debug!(
        seed_id = report.seed_id,
        paths = report.paths_checked,
        violations = report.violations.len(),
        "validated seed"
    );
    report
}

fn is_code(stmt: &Statement) -> bool {
    !matches!(stmt, Statement::Comment(_))
}

fn check_sentinel(body: &[Statement], out: &mut BTreeSet<Violation>) {
    let last = body.iter().rposition(is_code);
    match last.map(|idx| &body[idx]) {
        Some(Statement::Return(ReturnValue::Literal(SUCCESS_SENTINEL))) => {}
        Some(Statement::Return(ReturnValue::Literal(value))) => {
            out.insert(Violation::error(
                Rule::Sentinel,
                format!("final statement returns {value} instead of {SUCCESS_SENTINEL}"),
            ));
        }
        Some(Statement::Return(ReturnValue::Expr(expr))) => {
            out.insert(Violation::error(
                Rule::Sentinel,
                format!("final statement returns `{expr}` instead of {SUCCESS_SENTINEL}"),
            ));
        }
        _ => {
            out.insert(Violation::error(
                Rule::Sentinel,
                format!("body does not end with `return {SUCCESS_SENTINEL};`"),
            ));
        }
    }

    let mut early = Vec::new();
    for (idx, stmt) in body.iter().enumerate() {
        if Some(idx) == last {
            continue;
        }
        collect_returns(std::slice::from_ref(stmt), &mut early);
    }
    for value in early {
        match value {
            ReturnValue::Literal(SUCCESS_SENTINEL) => {
                out.insert(Violation::error(
                    Rule::Sentinel,
                    format!("early return uses the success sentinel {SUCCESS_SENTINEL}"),
                ));
            }
            ReturnValue::Literal(v) => {
                if SeedOutcome::from_return_value(*v).is_none() {
                    out.insert(Violation::error(
                        Rule::Sentinel,
                        format!("early return {v} is not a setup (-1..-31) or operation (-33..-63) failure code"),
                    ));
                }
            }
            ReturnValue::Expr(expr) => {
                out.insert(Violation::error(
                    Rule::Sentinel,
                    format!("early return `{expr}` is not a literal failure code"),
                ));
            }
        }
    }
}

fn collect_returns<'a>(body: &'a [Statement], out: &mut Vec<&'a ReturnValue>) {
    crate::seed::walk_statements(body, &mut |stmt| {
        if let Statement::Return(value) = stmt {
            out.push(value);
        }
    });
}

#[derive(Debug, Clone)]
struct PathState {
    tracker: ResourceTracker,
    faults: Vec<SequenceFault>,
    ended_by: Option<i64>,
    done: bool,
}

struct PathWalker<'a> {
    bindings: Bindings,
    model: &'a ResourceModel,
    truncated: bool,
}

impl PathWalker<'_> {
    fn apply_call(&self, state: &mut PathState, call: &LibraryCall) {
        let faults = state.tracker.apply(call, &self.bindings);
        for fault in faults {
            if !exempt(call, &fault) {
                state.faults.push(fault);
            }
        }
    }

    fn walk(&mut self, body: &[Statement], states: Vec<PathState>) -> Vec<PathState> {
        let mut states = states;
        for stmt in body {
            let mut next = Vec::with_capacity(states.len());
            for mut state in states {
                if state.done {
                    next.push(state);
                    continue;
                }
                match stmt {
                    Statement::Call(call) => {
                        self.apply_call(&mut state, call);
                        next.push(state);
                    }
                    Statement::Raw(text) => {
                        state.tracker.note_raw(text);
                        next.push(state);
                    }
                    Statement::Comment(_) => next.push(state),
                    Statement::Return(value) => {
                        state.done = true;
                        state.ended_by = match value {
                            ReturnValue::Literal(v) => Some(*v),
                            ReturnValue::Expr(_) => None,
                        };
                        next.push(state);
                    }
                    Statement::Guard {
                        condition,
                        condition_calls,
                        then_body,
                        else_body,
                    } => {
                        for call in condition_calls {
                            self.apply_call(&mut state, call);
                        }
                        let failed = state.tracker.failed_acquires(condition, condition_calls);
                        let mut then_state = state.clone();
                        for handle in &failed.then_branch {
                            then_state.tracker.forget(handle);
                        }
                        for handle in &failed.else_branch {
                            state.tracker.forget(handle);
                        }
                        next.extend(self.walk(then_body, vec![then_state]));
                        next.extend(self.walk(else_body, vec![state]));
                    }
                    Statement::Loop {
                        header,
                        trailer,
                        condition_calls,
                        body,
                    } => {
                        if header == "do" {
                            for mut state in self.walk(body, vec![state]) {
                                if !state.done && trailer.is_some() {
                                    for call in condition_calls {
                                        self.apply_call(&mut state, call);
                                    }
                                }
                                next.push(state);
                            }
                        } else {
                            for call in condition_calls {
                                self.apply_call(&mut state, call);
                            }
                            let skipped = state.clone();
                            next.extend(self.walk(body, vec![state]));
                            next.push(skipped);
                        }
                    }
                }
            }
            if next.len() > MAX_PATHS {
                self.truncated = true;
                next.truncate(MAX_PATHS);
            }
            states = next;
        }
        states
    }
}

/// Faults a tagged call is allowed to cause.
fn exempt(call: &LibraryCall, fault: &SequenceFault) -> bool {
    let Some(tag) = &call.edge_case else {
        return false;
    };
    if tag.deliberate_ub {
        return true;
    }
    matches!(
        (tag.kind, fault),
        (EdgeCaseKind::DoubleRelease, SequenceFault::DoubleRelease { .. })
            | (EdgeCaseKind::UseAfterRelease, SequenceFault::UseAfterRelease { .. })
    )
}

fn describe_end(ended_by: Option<i64>) -> String {
    match ended_by {
        Some(SUCCESS_SENTINEL) => "the success path".to_string(),
        Some(v) => format!("the path returning {v}"),
        None => "a path without a literal return".to_string(),
    }
}

fn check_paths(seed: &SeedRecord, model: &ResourceModel, out: &mut BTreeSet<Violation>) -> usize {
    let mut walker = PathWalker {
        bindings: seed.bindings(),
        model,
        truncated: false,
    };
    let start = PathState {
        tracker: ResourceTracker::new(*walker.model),
        faults: Vec::new(),
        ended_by: None,
        done: false,
    };
    let paths = walker.walk(seed.body(), vec![start]);
    if walker.truncated {
        out.insert(Violation::warning(
            Rule::PathLimit,
            format!("more than {MAX_PATHS} control-flow paths; only the first {MAX_PATHS} were checked"),
        ));
    }
    for path in &paths {
        let end = describe_end(path.ended_by);
        for fault in path.faults.iter().chain(path.tracker.finish().iter()) {
            let message = format!("{fault} on {end}");
            let violation = match fault {
                SequenceFault::ReleaseWithoutAcquire { .. }
                | SequenceFault::DoubleRelease { .. }
                | SequenceFault::UseAfterRelease { .. }
                | SequenceFault::Leak { .. } => Violation::error(Rule::ResourceBalance, message),
                SequenceFault::DoubleRemove(_) | SequenceFault::TempFileLeft(_) => {
                    Violation::error(Rule::TempFileCleanup, message)
                }
                SequenceFault::RemoveWithoutCreate(_) => {
                    Violation::warning(Rule::TempFileCleanup, message)
                }
            };
            out.insert(violation);
        }
    }
    paths.len()
}

/// Whether `id` appears in `path` with no digit directly on either side.
pub fn contains_id_token(path: &str, id: u64) -> bool {
    let needle = id.to_string();
    let bytes = path.as_bytes();
    path.match_indices(&needle).any(|(start, _)| {
        let end = start + needle.len();
        let before = start.checked_sub(1).and_then(|i| bytes.get(i));
        let after = bytes.get(end);
        !before.is_some_and(u8::is_ascii_digit) && !after.is_some_and(u8::is_ascii_digit)
    })
}

fn check_namespace(seed: &SeedRecord, model: &ResourceModel, out: &mut BTreeSet<Violation>) {
    for path in seed.temp_files(model) {
        match &path {
            TempPath::Literal(literal) => {
                if !contains_id_token(literal, seed.id()) {
                    out.insert(Violation::error(
                        Rule::Namespace,
                        format!("temp file {path} does not carry the seed id {}", seed.id()),
                    ));
                }
            }
            TempPath::Unresolved(_) => {
                out.insert(Violation::warning(
                    Rule::Namespace,
                    format!("temp file path {path} cannot be resolved statically"),
                ));
            }
        }
    }
}

fn check_edge_case_tags(seed: &SeedRecord, model: &ResourceModel, out: &mut BTreeSet<Violation>) {
    for call in seed.calls() {
        let Some(tag) = &call.edge_case else {
            continue;
        };
        let name = &call.function_name;
        if tag.kind == EdgeCaseKind::Unclassified {
            out.insert(Violation::warning(
                Rule::EdgeCaseTagging,
                format!("edge case on {name} does not say which perturbation it applies"),
            ));
            continue;
        }
        if !tag.deliberate_ub && !model.edge_case_is_defined(name, tag.kind) {
            out.insert(Violation::error(
                Rule::EdgeCaseTagging,
                format!(
                    "{name} is not documented to handle a {} edge case; tag it as deliberate UB or remove it",
                    tag.kind.describe()
                ),
            ));
        }
        let expected_arg = match tag.kind {
            EdgeCaseKind::NullArgument => model.null_safe_arg(name),
            EdgeCaseKind::ZeroLength => model.zero_length_arg(name),
            _ => None,
        };
        if let Some(idx) = expected_arg {
            let arg = call.arguments.get(idx).map(|a| a.trim()).unwrap_or_default();
            let matches = match tag.kind {
                EdgeCaseKind::NullArgument => crate::seed::is_null_literal(arg),
                _ => arg == "0" || arg == "0U" || arg == "0u" || arg == "0L",
            };
            if !matches {
                out.insert(Violation::warning(
                    Rule::EdgeCaseTagging,
                    format!(
                        "{name} is tagged {} but argument {idx} is `{arg}`",
                        tag.kind.describe()
                    ),
                ));
            }
        }
    }
}

fn check_metadata(seed: &SeedRecord, out: &mut BTreeSet<Violation>) {
    let Some(quality) = &seed.metadata().quality else {
        out.insert(Violation::warning(
            Rule::MetadataConsistency,
            "no <Quality> block to compare the body against",
        ));
        return;
    };
    let declared: BTreeSet<&str> = quality.library_calls.iter().map(String::as_str).collect();
    let missing: Vec<String> = seed
        .call_identifiers()
        .into_iter()
        .filter(|name| !declared.contains(name.as_str()))
        .collect();
    if !missing.is_empty() {
        out.insert(Violation::error(
            Rule::MetadataConsistency,
            format!("library_calls is missing {}", missing.join(", ")),
        ));
    }
}

/// A temp-file path shared by more than one seed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Collision {
    pub path: String,
    pub seed_ids: Vec<u64>,
}

/// Finds literal temp-file paths used by more than one seed in `seeds`.
pub fn find_collisions(seeds: &[SeedRecord], model: &ResourceModel) -> Vec<Collision> {
    let mut users: BTreeMap<String, Vec<u64>> = BTreeMap::new();
    for seed in seeds {
        for path in seed.temp_files(model) {
            if let TempPath::Literal(literal) = path {
                users.entry(literal).or_default().push(seed.id());
            }
        }
    }
    users
        .into_iter()
        .filter(|(_, ids)| ids.len() > 1)
        .map(|(path, seed_ids)| Collision { path, seed_ids })
        .collect()
}
