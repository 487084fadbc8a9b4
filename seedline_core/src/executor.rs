use crate::config::HarnessSettings;
use crate::observer::Observer;
use crate::seed::SeedRecord;
use crate::sentinel::{AMBIGUOUS_EXIT_CODE, ExitClass, SeedOutcome, render_main};
use std::any::Any;
use std::fmt;
use std::io::Read;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionStatus {
    /// The seed returned the success sentinel.
    Completed,
    /// The seed reported a documented failure code.
    Failed(SeedOutcome),
    /// The seed returned something outside the protocol.
    Ambiguous(i32),
    Crash(String),
    Timeout,
    BuildFailed(String),
    ObserverError(String),
    Other(String),
}

impl ExecutionStatus {
    pub fn from_outcome(outcome: SeedOutcome) -> Self {
        match outcome {
            SeedOutcome::Success => ExecutionStatus::Completed,
            failure => ExecutionStatus::Failed(failure),
        }
    }

    /// Whether the run stayed inside the protocol (success or documented failure).
    pub fn honours_protocol(&self) -> bool {
        matches!(self, ExecutionStatus::Completed | ExecutionStatus::Failed(_))
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionStatus::Completed => f.write_str("completed"),
            ExecutionStatus::Failed(outcome) => write!(f, "failed: {outcome}"),
            ExecutionStatus::Ambiguous(code) => write!(f, "ambiguous result ({code})"),
            ExecutionStatus::Crash(desc) => write!(f, "crash: {desc}"),
            ExecutionStatus::Timeout => f.write_str("timeout"),
            ExecutionStatus::BuildFailed(desc) => write!(f, "build failed: {desc}"),
            ExecutionStatus::ObserverError(desc) => write!(f, "observer error: {desc}"),
            ExecutionStatus::Other(desc) => write!(f, "error: {desc}"),
        }
    }
}

pub trait Executor {
    fn execute_sync(
        &mut self,
        seed: &SeedRecord,
        observers: &mut [&mut dyn Observer],
    ) -> ExecutionStatus;
}

fn run_pre_exec(
    observers: &mut [&mut dyn Observer],
    seed: &SeedRecord,
) -> Result<(), ExecutionStatus> {
    for obs in observers.iter_mut() {
        if let Err(e) = obs.pre_exec(seed) {
            let error_msg = format!("Observer '{}' pre_exec failed: {}", obs.name(), e);
            error!("{error_msg}");
            return Err(ExecutionStatus::ObserverError(error_msg));
        }
    }
    Ok(())
}

/// Hands the result to every observer. A failing observer only overrides a
/// status that stayed inside the protocol.
fn run_post_exec(
    observers: &mut [&mut dyn Observer],
    status: ExecutionStatus,
    target_output: Option<&dyn Any>,
    seed: &SeedRecord,
) -> ExecutionStatus {
    let mut post_exec_error: Option<String> = None;
    for obs in observers.iter_mut() {
        if let Err(e) = obs.post_exec(&status, target_output, seed) {
            let error_msg = format!("Observer '{}' post_exec failed: {}", obs.name(), e);
            error!("{error_msg}");
            if post_exec_error.is_none() {
                post_exec_error = Some(error_msg);
            }
        }
    }
    match post_exec_error {
        Some(msg) if status.honours_protocol() => ExecutionStatus::ObserverError(msg),
        _ => status,
    }
}

/// Runs a Rust stand-in for the seed's sequence function. Used for dry runs
/// and to exercise observers without a native toolchain.
pub struct InProcessExecutor<F>
where
    F: Fn(&SeedRecord) -> i64,
{
    harness_fn: F,
}

impl<F> InProcessExecutor<F>
where
    F: Fn(&SeedRecord) -> i64,
{
    pub fn new(harness_fn: F) -> Self {
        Self { harness_fn }
    }
}

impl<F> Executor for InProcessExecutor<F>
where
    F: Fn(&SeedRecord) -> i64 + Send + Sync,
{
    fn execute_sync(
        &mut self,
        seed: &SeedRecord,
        observers: &mut [&mut dyn Observer],
    ) -> ExecutionStatus {
        if let Err(status) = run_pre_exec(observers, seed) {
            return status;
        }

        let result = catch_unwind(AssertUnwindSafe(|| (self.harness_fn)(seed)));

        let status = match result {
            Ok(value) => match SeedOutcome::from_return_value(value) {
                Some(outcome) => ExecutionStatus::from_outcome(outcome),
                None => ExecutionStatus::Ambiguous(
                    i32::try_from(value).unwrap_or(AMBIGUOUS_EXIT_CODE),
                ),
            },
            Err(panic_payload) => {
                let msg = if let Some(s) = panic_payload.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = panic_payload.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "Unknown panic type".to_string()
                };
                ExecutionStatus::Crash(msg)
            }
        };

        run_post_exec(observers, status, None, seed)
    }
}

/// What a native run left behind, handed to observers as `&dyn Any`.
#[derive(Debug, Default)]
pub struct ProcessOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub duration: Duration,
}

/// Base name of the generated `main()` translation unit.
pub const WRAPPER_FILE_NAME: &str = "seedline_main.cc";

/// Compiles each seed together with the exit-status wrapper and runs the
/// resulting executable.
pub struct NativeExecutor {
    settings: HarnessSettings,
    working_dir: PathBuf,
}

impl NativeExecutor {
    pub fn new(settings: HarnessSettings) -> Self {
        let working_dir = settings
            .working_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("."));
        Self {
            settings,
            working_dir,
        }
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    /// Compiler arguments for building `sources` into `output`.
    pub fn compiler_args(
        &self,
        seed: &SeedRecord,
        sources: &[PathBuf],
        output: &Path,
    ) -> Vec<String> {
        let mut args: Vec<String> = self.settings.compile_flags.clone();
        for dir in &self.settings.include_dirs {
            args.push(format!("-I{}", dir.display()));
        }
        args.extend(sources.iter().map(|s| s.display().to_string()));
        args.push("-o".to_string());
        args.push(output.display().to_string());
        for dir in &self.settings.library_dirs {
            args.push(format!("-L{}", dir.display()));
        }
        args.extend(self.settings.link_flags_for(seed.target_library()));
        args
    }

    fn build(&self, seed: &SeedRecord, build_dir: &Path) -> Result<PathBuf, ExecutionStatus> {
        let source = build_dir.join(format!("{}.cc", seed.file_stem()));
        let wrapper = build_dir.join(WRAPPER_FILE_NAME);
        let binary = build_dir.join(format!("seed_{}", seed.id()));
        std::fs::write(&source, seed.source())
            .and_then(|_| std::fs::write(&wrapper, render_main(seed.target_library())))
            .map_err(|e| {
                ExecutionStatus::Other(format!("Failed to write sources to {build_dir:?}: {e}"))
            })?;

        let args = self.compiler_args(seed, &[source, wrapper], &binary);
        debug!(compiler = %self.settings.compiler, ?args, "compiling seed {}", seed.id());
        let mut child = Command::new(&self.settings.compiler)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                ExecutionStatus::BuildFailed(format!(
                    "Failed to spawn compiler '{}': {}",
                    self.settings.compiler, e
                ))
            })?;
        let readers = capture_output(&mut child);
        let waited = wait_with_timeout(&mut child, self.settings.compile_timeout());
        let (_, stderr) = join_output(readers);
        match waited {
            Ok(Some(status)) if status.success() => {}
            Ok(Some(status)) => {
                return Err(ExecutionStatus::BuildFailed(format!(
                    "compiler exited with {status}: {}",
                    String::from_utf8_lossy(&stderr).trim()
                )));
            }
            Ok(None) => {
                return Err(ExecutionStatus::BuildFailed(format!(
                    "compiler timed out after {:?}",
                    self.settings.compile_timeout()
                )));
            }
            Err(e) => {
                return Err(ExecutionStatus::BuildFailed(format!(
                    "Error waiting for compiler: {e}"
                )));
            }
        }
        if !binary.is_file() {
            return Err(ExecutionStatus::BuildFailed(format!(
                "compiler produced no executable at {binary:?}"
            )));
        }
        Ok(binary)
    }

    fn run(&self, binary: &Path) -> Result<ProcessOutput, ExecutionStatus> {
        let start = Instant::now();
        let mut child = Command::new(binary)
            .current_dir(&self.working_dir)
            .env("ASAN_OPTIONS", &self.settings.asan_options)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| ExecutionStatus::Other(format!("Failed to spawn {binary:?}: {e}")))?;
        let readers = capture_output(&mut child);
        let waited = wait_with_timeout(&mut child, self.settings.timeout());
        let (stdout, stderr) = join_output(readers);
        let mut output = ProcessOutput {
            stdout,
            stderr,
            duration: start.elapsed(),
            ..Default::default()
        };
        match waited {
            Ok(Some(status)) => {
                output.exit_code = status.code();
                output.signal = exit_signal(&status);
                Ok(output)
            }
            Ok(None) => Err(ExecutionStatus::Timeout),
            Err(e) => Err(ExecutionStatus::Other(format!("Error waiting for child: {e}"))),
        }
    }
}

/// Decodes a finished run through the exit-status mapping.
pub fn classify_output(output: &ProcessOutput) -> ExecutionStatus {
    match (output.exit_code, output.signal) {
        (Some(code), _) => match ExitClass::from_exit_code(code) {
            ExitClass::Outcome(outcome) => ExecutionStatus::from_outcome(outcome),
            ExitClass::Ambiguous => ExecutionStatus::Ambiguous(code),
            ExitClass::Sanitizer => {
                ExecutionStatus::Crash(format!("sanitizer report (exit status {code})"))
            }
            ExitClass::Unexpected(c) => {
                ExecutionStatus::Other(format!("unexpected exit status {c}"))
            }
        },
        (None, Some(signal)) => ExecutionStatus::Crash(format!("terminated by signal {signal}")),
        (None, None) => ExecutionStatus::Crash("exited abnormally".to_string()),
    }
}

impl Executor for NativeExecutor {
    fn execute_sync(
        &mut self,
        seed: &SeedRecord,
        observers: &mut [&mut dyn Observer],
    ) -> ExecutionStatus {
        if let Err(status) = run_pre_exec(observers, seed) {
            return status;
        }

        let build_dir = match tempfile::Builder::new().prefix("seedline-build-").tempdir() {
            Ok(dir) => dir,
            Err(e) => {
                let status = ExecutionStatus::Other(format!("Failed to create build dir: {e}"));
                return run_post_exec(observers, status, None, seed);
            }
        };

        let binary = match self.build(seed, build_dir.path()) {
            Ok(binary) => binary,
            Err(status) => {
                warn!("seed {}: {status}", seed.id());
                return run_post_exec(observers, status, None, seed);
            }
        };

        match self.run(&binary) {
            Ok(output) => {
                let status = classify_output(&output);
                debug!(
                    exit_code = ?output.exit_code,
                    duration = ?output.duration,
                    "seed {}: {status}",
                    seed.id()
                );
                run_post_exec(observers, status, Some(&output as &dyn Any), seed)
            }
            Err(status) => run_post_exec(observers, status, None, seed),
        }
    }
}

fn drain<R: Read + Send + 'static>(stream: Option<R>) -> Option<JoinHandle<Vec<u8>>> {
    stream.map(|mut s| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = s.read_to_end(&mut buf);
            buf
        })
    })
}

type OutputReaders = (Option<JoinHandle<Vec<u8>>>, Option<JoinHandle<Vec<u8>>>);

/// Reads both pipes on their own threads so a chatty child cannot block on a
/// full pipe while we poll it.
fn capture_output(child: &mut Child) -> OutputReaders {
    (drain(child.stdout.take()), drain(child.stderr.take()))
}

/// How long the readers may lag behind the child's exit. A descendant that
/// inherited the pipes can keep them open long after the child is gone.
const OUTPUT_GRACE: Duration = Duration::from_millis(500);

fn join_output((stdout, stderr): OutputReaders) -> (Vec<u8>, Vec<u8>) {
    let deadline = Instant::now() + OUTPUT_GRACE;
    let join = |handle: Option<JoinHandle<Vec<u8>>>| {
        let handle = handle?;
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                warn!("Output pipe still held open after the child exited; abandoning its reader");
                return None;
            }
            thread::sleep(Duration::from_millis(10));
        }
        handle.join().ok()
    };
    (join(stdout).unwrap_or_default(), join(stderr).unwrap_or_default())
}

/// Polls `child` until it exits or `timeout` passes. `Ok(None)` means the
/// child was killed for running too long.
pub fn wait_with_timeout(
    child: &mut Child,
    timeout: Duration,
) -> Result<Option<ExitStatus>, std::io::Error> {
    let start_time = Instant::now();
    loop {
        match child.try_wait()? {
            Some(status) => return Ok(Some(status)),
            None => {
                if start_time.elapsed() > timeout {
                    warn!("Target timed out after {timeout:?}, killing...");
                    child.kill()?;
                    child.wait()?;
                    return Ok(None);
                }
                thread::sleep(Duration::from_millis(10));
            }
        }
    }
}

#[cfg(unix)]
fn exit_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &ExitStatus) -> Option<i32> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::{SeedGenerator, SeedIds};
    use crate::library::TargetLibrary;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingObserver {
        pre: AtomicUsize,
        post: AtomicUsize,
        fail_post: bool,
    }

    impl CountingObserver {
        fn new(fail_post: bool) -> Self {
            Self {
                pre: AtomicUsize::new(0),
                post: AtomicUsize::new(0),
                fail_post,
            }
        }
    }

    impl Observer for CountingObserver {
        fn name(&self) -> &'static str {
            "CountingObserver"
        }
        fn pre_exec(&mut self, _seed: &SeedRecord) -> Result<(), anyhow::Error> {
            self.pre.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn post_exec(
            &mut self,
            _status: &ExecutionStatus,
            _target_output: Option<&dyn Any>,
            _seed: &SeedRecord,
        ) -> Result<(), anyhow::Error> {
            self.post.fetch_add(1, Ordering::SeqCst);
            if self.fail_post {
                anyhow::bail!("post failed");
            }
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

    fn zlib_seed() -> SeedRecord {
        SeedGenerator::new(SeedIds::starting_at(40), 1)
            .generate_from(TargetLibrary::Zlib, &["checksums"])
            .unwrap()
    }

    #[test]
    fn in_process_maps_returns_through_sentinel() {
        let seed = zlib_seed();
        let cases = [
            (66, ExecutionStatus::Completed),
            (-3, ExecutionStatus::Failed(SeedOutcome::SetupFailed(3))),
            (-35, ExecutionStatus::Failed(SeedOutcome::OperationFailed(3))),
            (7, ExecutionStatus::Ambiguous(7)),
            (-32, ExecutionStatus::Ambiguous(-32)),
            (i64::MAX, ExecutionStatus::Ambiguous(AMBIGUOUS_EXIT_CODE)),
        ];
        for (value, expected) in cases {
            let mut executor = InProcessExecutor::new(move |_: &SeedRecord| value);
            assert_eq!(executor.execute_sync(&seed, &mut []), expected, "value {value}");
        }
    }

    #[test]
    fn in_process_panic_is_a_crash() {
        let seed = zlib_seed();
        let mut executor = InProcessExecutor::new(|_: &SeedRecord| -> i64 { panic!("boom") });
        let mut observer = CountingObserver::new(false);
        let status = executor.execute_sync(&seed, &mut [&mut observer as &mut dyn Observer]);
        assert_eq!(status, ExecutionStatus::Crash("boom".to_string()));
        assert_eq!(observer.pre.load(Ordering::SeqCst), 1);
        assert_eq!(observer.post.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failing_observer_overrides_only_protocol_statuses() {
        let seed = zlib_seed();
        let mut observer = CountingObserver::new(true);
        let mut ok = InProcessExecutor::new(|_: &SeedRecord| 66);
        assert!(matches!(
            ok.execute_sync(&seed, &mut [&mut observer as &mut dyn Observer]),
            ExecutionStatus::ObserverError(_)
        ));
        let mut crashing = InProcessExecutor::new(|_: &SeedRecord| -> i64 { panic!("x") });
        assert!(matches!(
            crashing.execute_sync(&seed, &mut [&mut observer as &mut dyn Observer]),
            ExecutionStatus::Crash(_)
        ));
    }

    #[test]
    fn exit_codes_classify_through_protocol() {
        let output = |exit_code, signal| ProcessOutput {
            exit_code,
            signal,
            ..Default::default()
        };
        assert_eq!(classify_output(&output(Some(0), None)), ExecutionStatus::Completed);
        assert_eq!(
            classify_output(&output(Some(2), None)),
            ExecutionStatus::Failed(SeedOutcome::SetupFailed(2))
        );
        assert_eq!(classify_output(&output(Some(100), None)), ExecutionStatus::Ambiguous(100));
        assert!(matches!(classify_output(&output(Some(168), None)), ExecutionStatus::Crash(_)));
        assert!(matches!(classify_output(&output(Some(32), None)), ExecutionStatus::Other(_)));
        assert_eq!(
            classify_output(&output(None, Some(11))),
            ExecutionStatus::Crash("terminated by signal 11".to_string())
        );
    }

    #[test]
    fn compiler_args_order_and_link_flags() {
        let settings = HarnessSettings {
            compile_flags: vec!["-O0".to_string()],
            include_dirs: vec![PathBuf::from("/opt/inc")],
            library_dirs: vec![PathBuf::from("/opt/lib")],
            ..Default::default()
        };
        let executor = NativeExecutor::new(settings);
        let seed = zlib_seed();
        let args = executor.compiler_args(
            &seed,
            &[PathBuf::from("a.cc"), PathBuf::from("b.cc")],
            Path::new("out"),
        );
        assert_eq!(
            args,
            vec!["-O0", "-I/opt/inc", "a.cc", "b.cc", "-o", "out", "-L/opt/lib", "-lz"]
        );
    }

    #[test]
    fn missing_compiler_is_a_build_failure() {
        let settings = HarnessSettings {
            compiler: "/nonexistent/seedline-cc".to_string(),
            ..Default::default()
        };
        let mut executor = NativeExecutor::new(settings);
        let mut observer = CountingObserver::new(false);
        let status = executor.execute_sync(&zlib_seed(), &mut [&mut observer as &mut dyn Observer]);
        assert!(matches!(status, ExecutionStatus::BuildFailed(_)), "{status:?}");
        assert_eq!(observer.post.load(Ordering::SeqCst), 1);
    }

    /// Settings whose "compiler" is `sh`, writing a shell script with `body`
    /// to the `-o` target.
    #[cfg(unix)]
    fn fake_toolchain(body: &str, working_dir: &Path) -> HarnessSettings {
        let script = format!(
            "out=\"\"\nwhile [ $# -gt 0 ]; do\n  if [ \"$1\" = \"-o\" ]; then out=\"$2\"; fi\n  shift\ndone\ncat > \"$out\" <<'SEEDLINE_EOF'\n#!/bin/sh\n{body}\nSEEDLINE_EOF\nchmod +x \"$out\"\n"
        );
        HarnessSettings {
            compiler: "sh".to_string(),
            compile_flags: vec!["-c".to_string(), script, "fakecc".to_string()],
            timeout_ms: 2000,
            working_dir: Some(working_dir.to_path_buf()),
            ..Default::default()
        }
    }

    #[cfg(unix)]
    #[test]
    fn native_run_decodes_documented_failure() {
        let dir = tempfile::tempdir().unwrap();
        let mut executor = NativeExecutor::new(fake_toolchain("exit 36", dir.path()));
        let status = executor.execute_sync(&zlib_seed(), &mut []);
        assert_eq!(status, ExecutionStatus::Failed(SeedOutcome::OperationFailed(4)));
    }

    #[cfg(unix)]
    #[test]
    fn native_run_sees_working_dir_and_asan_options() {
        let dir = tempfile::tempdir().unwrap();
        let body = "echo \"$ASAN_OPTIONS\" > asan.txt\nexit 0";
        let mut executor = NativeExecutor::new(fake_toolchain(body, dir.path()));
        assert_eq!(executor.execute_sync(&zlib_seed(), &mut []), ExecutionStatus::Completed);
        let written = std::fs::read_to_string(dir.path().join("asan.txt")).unwrap();
        assert_eq!(written.trim(), "exitcode=168:detect_leaks=1");
    }

    #[cfg(unix)]
    #[test]
    fn native_run_is_killed_on_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = fake_toolchain("exec sleep 5", dir.path());
        settings.timeout_ms = 100;
        let mut executor = NativeExecutor::new(settings);
        let start = Instant::now();
        assert_eq!(executor.execute_sync(&zlib_seed(), &mut []), ExecutionStatus::Timeout);
        assert!(start.elapsed() < Duration::from_secs(4));
    }

    #[cfg(unix)]
    #[test]
    fn run_timeout_holds_when_a_descendant_keeps_the_pipes() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = fake_toolchain("sleep 5\nexit 0", dir.path());
        settings.timeout_ms = 100;
        let mut executor = NativeExecutor::new(settings);
        let start = Instant::now();
        assert_eq!(executor.execute_sync(&zlib_seed(), &mut []), ExecutionStatus::Timeout);
        assert!(start.elapsed() < Duration::from_secs(3), "{:?}", start.elapsed());
    }

    #[cfg(unix)]
    #[test]
    fn compile_timeout_holds_when_the_driver_spawns_children() {
        let settings = HarnessSettings {
            compiler: "sh".to_string(),
            compile_flags: vec![
                "-c".to_string(),
                "sleep 4; true".to_string(),
                "slowcc".to_string(),
            ],
            compile_timeout_ms: 200,
            ..Default::default()
        };
        let mut executor = NativeExecutor::new(settings);
        let start = Instant::now();
        match executor.execute_sync(&zlib_seed(), &mut []) {
            ExecutionStatus::BuildFailed(msg) => assert!(msg.contains("timed out"), "{msg}"),
            other => panic!("unexpected status {other:?}"),
        }
        assert!(start.elapsed() < Duration::from_secs(3), "{:?}", start.elapsed());
    }

    #[cfg(unix)]
    #[test]
    fn compiler_without_output_is_a_build_failure() {
        let settings = HarnessSettings {
            compiler: "true".to_string(),
            ..Default::default()
        };
        let mut executor = NativeExecutor::new(settings);
        let status = executor.execute_sync(&zlib_seed(), &mut []);
        match status {
            ExecutionStatus::BuildFailed(msg) => assert!(msg.contains("no executable")),
            other => panic!("unexpected status {other:?}"),
        }
    }
}
