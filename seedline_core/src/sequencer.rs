//! Per-resource lifetime tracking along one path through a seed body.
//!
//! Every handle moves through UNINITIALIZED -> OPEN -> CLOSED. The tracker is
//! cheap to clone so path enumeration can fork it at each guard.

use crate::library::{AcquireSpec, HandleSite, ResourceModel};
use crate::seed::{self, Bindings, LibraryCall, TempPath};
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    Open,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct HandleRecord {
    state: HandleState,
    acquired_by: String,
    held_on_failure: bool,
}

/// A lifetime rule broken along one path.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum SequenceFault {
    ReleaseWithoutAcquire { handle: String, function: String },
    DoubleRelease { handle: String, function: String },
    UseAfterRelease { handle: String, function: String },
    DoubleRemove(TempPath),
    RemoveWithoutCreate(TempPath),
    Leak { handle: String, acquired_by: String },
    TempFileLeft(TempPath),
}

impl fmt::Display for SequenceFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SequenceFault::ReleaseWithoutAcquire { handle, function } => {
                write!(f, "{function} releases '{handle}' which was never acquired")
            }
            SequenceFault::DoubleRelease { handle, function } => {
                write!(f, "{function} releases '{handle}' a second time")
            }
            SequenceFault::UseAfterRelease { handle, function } => {
                write!(f, "{function} uses '{handle}' after it was released")
            }
            SequenceFault::DoubleRemove(path) => write!(f, "{path} is removed twice"),
            SequenceFault::RemoveWithoutCreate(path) => {
                write!(f, "{path} is removed but never created")
            }
            SequenceFault::Leak {
                handle,
                acquired_by,
            } => write!(f, "'{handle}' from {acquired_by} is never released"),
            SequenceFault::TempFileLeft(path) => write!(f, "{path} is never removed"),
        }
    }
}

fn truth_test_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\(*\s*(?P<not>!)?\s*\(?\s*(?P<var>[A-Za-z_][\w.>-]*)\s*\)?\s*\)*$")
            .expect("static regex")
    })
}

fn comparison_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^\(*\s*(?P<lhs>[-\w.>]+)\s*(?P<op>==|!=|<=|>=|<|>)\s*(?P<rhs>[-\w.>]+)\s*\)*$",
        )
        .expect("static regex")
    })
}

fn is_null_literal(text: &str) -> bool {
    matches!(text, "NULL" | "nullptr" | "Z_NULL" | "0")
}

fn null_assignment_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?P<var>[A-Za-z_][\w.>-]*)\s*=\s*(?:NULL|nullptr|Z_NULL|0)\s*;$")
            .expect("static regex")
    })
}

/// Walks calls in program order and records what they open, close, create and
/// remove.
#[derive(Debug, Clone, Default)]
pub struct ResourceTracker {
    model: ResourceModel,
    handles: BTreeMap<String, HandleRecord>,
    /// Status variables bound to the return of an out-parameter acquire,
    /// e.g. `rc = sqlite3_open(path, &db)` maps `rc` to `db`.
    status_of: BTreeMap<String, String>,
    live_files: BTreeSet<TempPath>,
    removed_files: BTreeSet<TempPath>,
    /// Files whose creating call also acquired a handle, keyed by that handle.
    created_by: BTreeMap<String, TempPath>,
    /// Files whose creator failed on this path. They may or may not exist, so
    /// removing them and leaving them are both fine.
    maybe_files: BTreeSet<TempPath>,
}

/// Handles a guard's condition reports as not acquired, split by the branch
/// on which the acquire failed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GuardFailures {
    /// Failed when the condition holds, e.g. `gz == NULL`.
    pub then_branch: Vec<String>,
    /// Failed when the condition does not hold, e.g. `gz != NULL`.
    pub else_branch: Vec<String>,
}

impl GuardFailures {
    fn push(&mut self, failed_when_true: bool, handle: String) {
        let list = if failed_when_true {
            &mut self.then_branch
        } else {
            &mut self.else_branch
        };
        if !list.contains(&handle) {
            list.push(handle);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.then_branch.is_empty() && self.else_branch.is_empty()
    }
}

impl ResourceTracker {
    pub fn new(model: ResourceModel) -> Self {
        Self {
            model,
            ..Default::default()
        }
    }

    pub fn state(&self, handle: &str) -> Option<HandleState> {
        self.handles.get(handle).map(|record| record.state)
    }

    pub fn open_handles(&self) -> impl Iterator<Item = &str> {
        self.handles
            .iter()
            .filter(|(_, record)| record.state == HandleState::Open)
            .map(|(name, _)| name.as_str())
    }

    pub fn live_files(&self) -> impl Iterator<Item = &TempPath> {
        self.live_files.iter()
    }

    /// Applies one call and returns the faults it causes on this path.
    pub fn apply(&mut self, call: &LibraryCall, bindings: &Bindings) -> Vec<SequenceFault> {
        let mut faults = Vec::new();
        let name = call.function_name.as_str();
        let release = self.model.release(name);
        let acquire = self.model.acquire(name);

        let mut released = Vec::new();
        let mut skip_args = BTreeSet::new();
        if let Some(spec) = release {
            for site in spec.sites {
                if let HandleSite::Arg(idx) = site {
                    skip_args.insert(*idx);
                }
                if let Some(handle) = self.site_handle(call, *site) {
                    released.push(handle);
                }
            }
        }
        let acquired = acquire.and_then(|spec| {
            if let HandleSite::Arg(idx) = spec.site {
                skip_args.insert(idx);
            }
            self.site_handle(call, spec.site).map(|handle| (spec, handle))
        });

        for (idx, arg) in call.arguments.iter().enumerate() {
            if skip_args.contains(&idx) {
                continue;
            }
            if let Some(handle) = seed::handle_name(arg) {
                if self.state(&handle) == Some(HandleState::Closed) {
                    faults.push(SequenceFault::UseAfterRelease {
                        handle,
                        function: name.to_string(),
                    });
                }
            }
        }

        for handle in released {
            match self.handles.get_mut(&handle) {
                Some(record) if record.state == HandleState::Open => {
                    record.state = HandleState::Closed;
                }
                Some(_) => faults.push(SequenceFault::DoubleRelease {
                    handle,
                    function: name.to_string(),
                }),
                None => faults.push(SequenceFault::ReleaseWithoutAcquire {
                    handle,
                    function: name.to_string(),
                }),
            }
        }

        // A reassigned status variable no longer speaks for the acquire.
        if let Some(target) = call.assigned_to() {
            self.status_of.remove(target);
        }
        let created = seed::created_path(call, &self.model, bindings);
        if let Some(spec) = acquire {
            match acquired {
                Some((_, handle)) => {
                    match &created {
                        Some(path) if !self.live_files.contains(path) => {
                            self.created_by.insert(handle.clone(), path.clone());
                        }
                        _ => {
                            self.created_by.remove(&handle);
                        }
                    }
                    faults.extend(self.open(spec, handle, call));
                }
                // A returned resource nobody keeps is lost at once.
                None if spec.site == HandleSite::Return => faults.push(SequenceFault::Leak {
                    handle: format!("<result of {name}>"),
                    acquired_by: name.to_string(),
                }),
                None => {}
            }
        }

        if let Some(path) = created {
            self.removed_files.remove(&path);
            self.maybe_files.remove(&path);
            self.live_files.insert(path);
        }
        if let Some(path) = seed::removed_path(call, &self.model, bindings) {
            if self.live_files.remove(&path) || self.maybe_files.remove(&path) {
                self.removed_files.insert(path);
            } else if self.removed_files.contains(&path) {
                faults.push(SequenceFault::DoubleRemove(path));
            } else {
                faults.push(SequenceFault::RemoveWithoutCreate(path));
            }
        }
        faults
    }

    fn open(
        &mut self,
        spec: &AcquireSpec,
        handle: String,
        call: &LibraryCall,
    ) -> Vec<SequenceFault> {
        let mut faults = Vec::new();
        if let Some(previous) = self.handles.get(&handle) {
            if previous.state == HandleState::Open {
                faults.push(SequenceFault::Leak {
                    handle: handle.clone(),
                    acquired_by: previous.acquired_by.clone(),
                });
            }
        }
        if let (HandleSite::Arg(_), Some(status)) = (spec.site, call.assigned_to()) {
            self.status_of.insert(status.to_string(), handle.clone());
        }
        self.handles.insert(
            handle,
            HandleRecord {
                state: HandleState::Open,
                acquired_by: call.function_name.clone(),
                held_on_failure: spec.held_on_failure(),
            },
        );
        faults
    }

    fn site_handle(&self, call: &LibraryCall, site: HandleSite) -> Option<String> {
        match site {
            HandleSite::Return => call.assigned_to().map(str::to_string),
            HandleSite::Arg(idx) => call.arguments.get(idx).and_then(|arg| seed::handle_name(arg)),
            HandleSite::Session(name) => Some(format!("<{name} session>")),
        }
    }

    /// Raw statements can reset a handle variable: after `p = NULL;` the name
    /// no longer refers to anything.
    pub fn note_raw(&mut self, text: &str) {
        if let Some(caps) = null_assignment_regex().captures(text.trim()) {
            let var = &caps["var"];
            if self.state(var) == Some(HandleState::Closed) {
                self.handles.remove(var);
            }
        }
    }

    /// Handles that a guard's condition reports as not acquired. A test for
    /// failure (`gz == NULL`, `rc != Z_OK`) names the then-branch; a test for
    /// success (`gz != NULL`, `if (gz)`, `rc == Z_OK`) names the else-branch.
    pub fn failed_acquires(
        &self,
        condition: &str,
        condition_calls: &[LibraryCall],
    ) -> GuardFailures {
        let condition = condition.trim();
        let mut failures = GuardFailures::default();
        if let Some(caps) = truth_test_regex().captures(condition) {
            let var = &caps["var"];
            let negated = caps.name("not").is_some();
            if let Some(handle) = self.failable_handle(var) {
                failures.push(negated, handle);
            } else if let Some(handle) = self.failable_status(var) {
                // Any nonzero status is a failure.
                failures.push(!negated, handle);
            }
        } else if let Some(caps) = comparison_regex().captures(condition) {
            let op = &caps["op"];
            let (mut lhs, mut rhs) = (&caps["lhs"], &caps["rhs"]);
            if matches!(op, "==" | "!=") && is_null_literal(lhs) && !is_null_literal(rhs) {
                std::mem::swap(&mut lhs, &mut rhs);
            }
            if let Some(handle) = self.failable_handle(lhs) {
                match op {
                    "==" if is_null_literal(rhs) => failures.push(true, handle),
                    "!=" if is_null_literal(rhs) => failures.push(false, handle),
                    _ => {}
                }
            } else if let Some(handle) = self.failable_status(lhs) {
                let failure_code = rhs.starts_with('-');
                match op {
                    "!=" => failures.push(!failure_code, handle),
                    "==" => failures.push(failure_code, handle),
                    "<" => failures.push(true, handle),
                    ">=" => failures.push(false, handle),
                    _ => {}
                }
            }
        }
        if !condition.contains("||") && !condition.contains("&&") {
            for call in condition_calls {
                let Some(spec) = self.model.acquire(&call.function_name) else {
                    continue;
                };
                if spec.held_on_failure() {
                    continue;
                }
                let Some(handle) = self.site_handle(call, spec.site) else {
                    continue;
                };
                if self.state(&handle) != Some(HandleState::Open) {
                    continue;
                }
                let failed_when_true = match spec.site {
                    HandleSite::Return => condition.contains("==") || condition.starts_with('!'),
                    HandleSite::Arg(_) | HandleSite::Session(_) => {
                        if condition.starts_with('!') {
                            false
                        } else if condition.contains("==") {
                            condition.contains("== -")
                        } else {
                            true
                        }
                    }
                };
                failures.push(failed_when_true, handle);
            }
        }
        failures
    }

    fn failable_handle(&self, var: &str) -> Option<String> {
        self.handles
            .get(var)
            .filter(|r| r.state == HandleState::Open && !r.held_on_failure)
            .map(|_| var.to_string())
    }

    fn failable_status(&self, var: &str) -> Option<String> {
        let handle = self.status_of.get(var)?;
        self.failable_handle(handle)
    }

    /// Drops a handle whose acquire failed, along with any file its creating
    /// call would have made.
    pub fn forget(&mut self, handle: &str) {
        self.handles.remove(handle);
        if let Some(path) = self.created_by.remove(handle) {
            if self.live_files.remove(&path) {
                self.maybe_files.insert(path);
            }
        }
    }

    /// Reports everything still open or on disk when the path ends.
    pub fn finish(&self) -> Vec<SequenceFault> {
        let mut faults: Vec<SequenceFault> = self
            .handles
            .iter()
            .filter(|(_, record)| record.state == HandleState::Open)
            .map(|(handle, record)| SequenceFault::Leak {
                handle: handle.clone(),
                acquired_by: record.acquired_by.clone(),
            })
            .collect();
        faults.extend(self.live_files.iter().cloned().map(SequenceFault::TempFileLeft));
        faults
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(calls: &[LibraryCall]) -> (ResourceTracker, Vec<SequenceFault>) {
        let mut tracker = ResourceTracker::new(ResourceModel::new());
        let bindings = Bindings::default();
        let mut faults = Vec::new();
        for call in calls {
            faults.extend(tracker.apply(call, &bindings));
        }
        (tracker, faults)
    }

    #[test]
    fn balanced_stream_and_file_are_clean() {
        let calls = [
            LibraryCall::new("deflateInit_", &["&strm", "6", "ZLIB_VERSION", "sizeof(strm)"]),
            LibraryCall::new("gzopen", &["\"seedline_1_t.gz\"", "\"wb\""]).assigned("gz"),
            LibraryCall::new("gzwrite", &["gz", "buf", "64"]).discarded(),
            LibraryCall::new("gzclose", &["gz"]).discarded(),
            LibraryCall::new("deflateEnd", &["&strm"]).discarded(),
            LibraryCall::new("remove", &["\"seedline_1_t.gz\""]).discarded(),
        ];
        let (tracker, faults) = run(&calls);
        assert!(faults.is_empty(), "{faults:?}");
        assert!(tracker.finish().is_empty());
        assert_eq!(tracker.state("strm"), Some(HandleState::Closed));
    }

    #[test]
    fn missing_release_and_remove_reported_at_finish() {
        let calls = [
            LibraryCall::new("gzopen", &["\"seedline_2_t.gz\"", "\"wb\""]).assigned("gz"),
            LibraryCall::new("gzwrite", &["gz", "buf", "64"]).discarded(),
        ];
        let (tracker, faults) = run(&calls);
        assert!(faults.is_empty());
        let end = tracker.finish();
        assert!(end.contains(&SequenceFault::Leak {
            handle: "gz".to_string(),
            acquired_by: "gzopen".to_string()
        }));
        assert!(end.contains(&SequenceFault::TempFileLeft(TempPath::Literal(
            "seedline_2_t.gz".to_string()
        ))));
    }

    #[test]
    fn state_machine_violations_are_faults() {
        let calls = [
            LibraryCall::new("cJSON_Delete", &["root"]).void(),
            LibraryCall::new("cJSON_Parse", &["\"{}\""]).assigned("root"),
            LibraryCall::new("cJSON_Delete", &["root"]).void(),
            LibraryCall::new("cJSON_GetArraySize", &["root"]),
            LibraryCall::new("cJSON_Delete", &["root"]).void(),
            LibraryCall::new("cJSON_Delete", &["NULL"]).void(),
        ];
        let (_, faults) = run(&calls);
        assert_eq!(
            faults,
            vec![
                SequenceFault::ReleaseWithoutAcquire {
                    handle: "root".to_string(),
                    function: "cJSON_Delete".to_string()
                },
                SequenceFault::UseAfterRelease {
                    handle: "root".to_string(),
                    function: "cJSON_GetArraySize".to_string()
                },
                SequenceFault::DoubleRelease {
                    handle: "root".to_string(),
                    function: "cJSON_Delete".to_string()
                },
            ]
        );
    }

    #[test]
    fn temp_file_removal_rules() {
        let calls = [
            LibraryCall::new("remove", &["\"x.gz\""]),
            LibraryCall::new("fopen", &["\"y.txt\"", "\"w\""]).assigned("fp"),
            LibraryCall::new("fclose", &["fp"]),
            LibraryCall::new("remove", &["\"y.txt\""]),
            LibraryCall::new("remove", &["\"y.txt\""]),
        ];
        let (tracker, faults) = run(&calls);
        assert_eq!(
            faults,
            vec![
                SequenceFault::RemoveWithoutCreate(TempPath::Literal("x.gz".to_string())),
                SequenceFault::DoubleRemove(TempPath::Literal("y.txt".to_string())),
            ]
        );
        assert!(tracker.finish().is_empty());
    }

    #[test]
    fn discarded_returned_resource_leaks_immediately() {
        let (_, faults) = run(&[LibraryCall::new("cJSON_PrintUnformatted", &["root"])]);
        assert!(matches!(faults[0], SequenceFault::Leak { .. }));
    }

    #[test]
    fn guard_conditions_identify_failed_acquires() {
        let (tracker, _) = run(&[
            LibraryCall::new("gzopen", &["\"a.gz\"", "\"wb\""]).assigned("gz"),
            LibraryCall::new("deflateInit_", &["&strm", "6", "ZLIB_VERSION", "sizeof(strm)"])
                .assigned("rc"),
            LibraryCall::new("sqlite3_open", &["\":memory:\"", "&db"]).assigned("src"),
        ]);
        let then_branch = |handle: &str| GuardFailures {
            then_branch: vec![handle.to_string()],
            else_branch: Vec::new(),
        };
        let else_branch = |handle: &str| GuardFailures {
            then_branch: Vec::new(),
            else_branch: vec![handle.to_string()],
        };
        assert_eq!(tracker.failed_acquires("gz == NULL", &[]), then_branch("gz"));
        assert_eq!(tracker.failed_acquires("NULL == gz", &[]), then_branch("gz"));
        assert_eq!(tracker.failed_acquires("!gz", &[]), then_branch("gz"));
        assert_eq!(tracker.failed_acquires("rc != Z_OK", &[]), then_branch("strm"));
        assert_eq!(tracker.failed_acquires("rc < 0", &[]), then_branch("strm"));
        assert_eq!(tracker.failed_acquires("rc", &[]), then_branch("strm"));
        assert_eq!(tracker.failed_acquires("gz != NULL", &[]), else_branch("gz"));
        assert_eq!(tracker.failed_acquires("(gz)", &[]), else_branch("gz"));
        assert_eq!(tracker.failed_acquires("rc == Z_OK", &[]), else_branch("strm"));
        assert_eq!(tracker.failed_acquires("!rc", &[]), else_branch("strm"));
        // An sqlite connection exists even when opening fails.
        assert!(tracker.failed_acquires("src != SQLITE_OK", &[]).is_empty());
        assert!(tracker.failed_acquires("src == SQLITE_OK", &[]).is_empty());
        assert!(tracker.failed_acquires("len > 3", &[]).is_empty());
    }

    #[test]
    fn guard_calls_pick_the_failure_branch_by_handle_site() {
        let open = LibraryCall::new("gzopen", &["\"a.gz\"", "\"wb\""]).assigned("gz");
        let init =
            LibraryCall::new("deflateInit_", &["&strm", "6", "ZLIB_VERSION", "sizeof(strm)"]);
        let (tracker, _) = run(&[open.clone(), init.clone()]);
        let calls = [open, init];
        let opened = "(gz = gzopen(\"a.gz\", \"wb\")) == NULL";
        let failures = tracker.failed_acquires(opened, &calls[..1]);
        assert_eq!(failures.then_branch, vec!["gz".to_string()]);
        let init_ok = "deflateInit_(&strm, 6, ZLIB_VERSION, sizeof(strm)) == Z_OK";
        let failures = tracker.failed_acquires(init_ok, &calls[1..]);
        assert_eq!(failures.else_branch, vec!["strm".to_string()]);
        let init_failed = "deflateInit_(&strm, 6, ZLIB_VERSION, sizeof(strm)) != Z_OK";
        let failures = tracker.failed_acquires(init_failed, &calls[1..]);
        assert_eq!(failures.then_branch, vec!["strm".to_string()]);
    }

    #[test]
    fn reassigned_status_no_longer_guards_the_acquire() {
        let (tracker, _) = run(&[
            LibraryCall::new("deflateInit_", &["&strm", "6", "ZLIB_VERSION", "sizeof(strm)"])
                .assigned("rc"),
            LibraryCall::new("deflate", &["&strm", "Z_FINISH"]).assigned("rc"),
        ]);
        assert!(tracker.failed_acquires("rc == Z_STREAM_END", &[]).is_empty());
        assert!(tracker.failed_acquires("rc != Z_OK", &[]).is_empty());
    }

    #[test]
    fn forgetting_a_failed_creator_makes_its_file_optional() {
        let (mut tracker, _) = run(&[
            LibraryCall::new("gzopen", &["\"seedline_3_t.gz\"", "\"wb\""]).assigned("gz"),
        ]);
        let mut removes = tracker.clone();
        tracker.forget("gz");
        assert!(tracker.finish().is_empty());

        removes.forget("gz");
        let bindings = Bindings::default();
        let remove = LibraryCall::new("remove", &["\"seedline_3_t.gz\""]);
        let faults = removes.apply(&remove, &bindings);
        assert!(faults.is_empty(), "{faults:?}");
        assert!(removes.finish().is_empty());
    }

    #[test]
    fn null_assignment_resets_released_handle() {
        let (mut tracker, _) = run(&[
            LibraryCall::new("malloc", &["16"]).assigned("buf"),
            LibraryCall::new("free", &["buf"]),
        ]);
        tracker.note_raw("buf = NULL;");
        assert_eq!(tracker.state("buf"), None);
    }
}
