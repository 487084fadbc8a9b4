use crate::executor::{ExecutionStatus, Executor};
use crate::feedback::ObserversData;
use crate::library::{ResourceModel, TargetLibrary};
use crate::observer::{Observer, SanitizerObserver, TempFileObserver};
use crate::oracle::{BugReport, Oracle, SeedOracle};
use crate::seed::{SeedRecord, TempPath};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// The result of replaying one seed.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub seed_id: u64,
    pub library: TargetLibrary,
    pub status: ExecutionStatus,
    pub findings: Vec<BugReport>,
    pub duration: Duration,
}

#[derive(Debug, Default, Clone)]
pub struct RunSummary {
    /// One report per seed, in input order.
    pub reports: Vec<RunReport>,
}

impl RunSummary {
    pub fn total(&self) -> usize {
        self.reports.len()
    }

    pub fn count(&self, predicate: impl Fn(&ExecutionStatus) -> bool) -> usize {
        self.reports.iter().filter(|r| predicate(&r.status)).count()
    }

    pub fn completed(&self) -> usize {
        self.count(|s| *s == ExecutionStatus::Completed)
    }

    pub fn documented_failures(&self) -> usize {
        self.count(|s| matches!(s, ExecutionStatus::Failed(_)))
    }

    pub fn build_failures(&self) -> usize {
        self.count(|s| matches!(s, ExecutionStatus::BuildFailed(_)))
    }

    pub fn findings(&self) -> impl Iterator<Item = &BugReport> {
        self.reports.iter().flat_map(|r| r.findings.iter())
    }

    pub fn has_findings(&self) -> bool {
        self.findings().next().is_some()
    }
}

/// Replays seeds on a fixed number of worker threads.
///
/// Every worker owns its executor and observers. All workers share the
/// working directory, so seeds that declare the same temp file are handed to
/// one worker and run one after another.
pub struct Runner {
    threads: usize,
    working_dir: PathBuf,
}

impl Runner {
    pub fn new(threads: usize, working_dir: PathBuf) -> Self {
        Self {
            threads: threads.max(1),
            working_dir,
        }
    }

    pub fn run_all<E, M>(&self, seeds: &[SeedRecord], make_executor: M) -> RunSummary
    where
        E: Executor,
        M: Fn() -> E + Sync,
    {
        let units = work_units(seeds, &ResourceModel::new());
        let workers = self.threads.min(units.len().max(1));
        let mut indexed: Vec<(usize, RunReport)> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..workers)
                .map(|worker| {
                    let make_executor = &make_executor;
                    let units = &units;
                    scope.spawn(move || {
                        let mut executor = make_executor();
                        units
                            .iter()
                            .skip(worker)
                            .step_by(workers)
                            .flatten()
                            .map(|&index| (index, self.run_one(&mut executor, &seeds[index])))
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            handles
                .into_iter()
                .flat_map(|handle| match handle.join() {
                    Ok(reports) => reports,
                    Err(_) => {
                        error!("Runner worker panicked; its seeds are missing from the summary");
                        Vec::new()
                    }
                })
                .collect()
        });
        indexed.sort_by_key(|(index, _)| *index);
        RunSummary {
            reports: indexed.into_iter().map(|(_, report)| report).collect(),
        }
    }

    fn run_one<E: Executor>(&self, executor: &mut E, seed: &SeedRecord) -> RunReport {
        let mut sanitizer = SanitizerObserver::new();
        let mut temp_files = TempFileObserver::new(self.working_dir.clone());
        let start = Instant::now();
        let status = {
            let mut observers: Vec<&mut dyn Observer> = vec![&mut sanitizer, &mut temp_files];
            executor.execute_sync(seed, &mut observers)
        };
        let duration = start.elapsed();

        let mut observers_data: ObserversData = HashMap::new();
        observers_data.insert(sanitizer.name(), sanitizer.serialize_data());
        observers_data.insert(temp_files.name(), temp_files.serialize_data());
        let findings = SeedOracle::new().examine(seed, &status, &observers_data);
        info!(
            seed_id = seed.id(),
            findings = findings.len(),
            "seed {} {}: {status}",
            seed.id(),
            seed.target_library()
        );
        RunReport {
            seed_id: seed.id(),
            library: seed.target_library(),
            status,
            findings,
            duration,
        }
    }
}

/// Splits `seeds` into units of indices that must not run concurrently. Seeds
/// sharing a literal temp-file path end up in the same unit, in input order.
pub fn work_units(seeds: &[SeedRecord], model: &ResourceModel) -> Vec<Vec<usize>> {
    fn root(parent: &mut [usize], mut i: usize) -> usize {
        while parent[i] != i {
            parent[i] = parent[parent[i]];
            i = parent[i];
        }
        i
    }

    let mut parent: Vec<usize> = (0..seeds.len()).collect();
    let mut owner: HashMap<String, usize> = HashMap::new();
    for (index, seed) in seeds.iter().enumerate() {
        for path in seed.temp_files(model) {
            let TempPath::Literal(name) = path else {
                continue;
            };
            match owner.get(&name) {
                Some(&other) => {
                    warn!(
                        "seeds {} and {} share temp file {name}; running them serially",
                        seeds[other].id(),
                        seed.id()
                    );
                    let (a, b) = (root(&mut parent, other), root(&mut parent, index));
                    parent[a.max(b)] = a.min(b);
                }
                None => {
                    owner.insert(name, index);
                }
            }
        }
    }

    let mut units: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for index in 0..seeds.len() {
        let unit = root(&mut parent, index);
        units.entry(unit).or_default().push(index);
    }
    units.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::InProcessExecutor;
    use crate::generator::{SeedGenerator, SeedIds};
    use crate::oracle::FindingKind;
    use crate::sentinel::SeedOutcome;

    fn seeds(count: usize) -> Vec<SeedRecord> {
        let generator = SeedGenerator::new(SeedIds::default(), 1);
        (0..count)
            .map(|_| generator.generate_from(TargetLibrary::Zlib, &["gz_file"]).unwrap())
            .collect()
    }

    #[test]
    fn reports_keep_input_order_across_threads() {
        let dir = tempfile::tempdir().unwrap();
        let seeds = seeds(9);
        let runner = Runner::new(4, dir.path().to_path_buf());
        let summary = runner.run_all(&seeds, || {
            InProcessExecutor::new(|seed: &SeedRecord| if seed.id() % 3 == 0 { -2 } else { 66 })
        });
        assert_eq!(summary.total(), 9);
        let ids: Vec<u64> = summary.reports.iter().map(|r| r.seed_id).collect();
        let expected: Vec<u64> = seeds.iter().map(|s| s.id()).collect();
        assert_eq!(ids, expected);
        assert_eq!(summary.documented_failures(), 3);
        assert_eq!(summary.completed(), 6);
        assert!(!summary.has_findings());
        assert!(summary.reports.iter().any(|r| {
            r.status == ExecutionStatus::Failed(SeedOutcome::SetupFailed(2))
        }));
    }

    #[test]
    fn leftover_files_become_findings() {
        let dir = tempfile::tempdir().unwrap();
        let seeds = seeds(2);
        let work = dir.path().to_path_buf();
        let runner = Runner::new(1, work.clone());
        let summary = runner.run_all(&seeds, || {
            let work = work.clone();
            // Stand-in for a seed that forgets to unlink its gz file.
            InProcessExecutor::new(move |seed: &SeedRecord| {
                let name = format!("seedline_{}_gz_file.gz", seed.id());
                std::fs::write(work.join(name), b"gz").map(|_| 66).unwrap_or(-1)
            })
        });
        let findings: Vec<&BugReport> = summary.findings().collect();
        assert_eq!(findings.len(), 2);
        assert!(findings.iter().all(|f| f.kind == FindingKind::LeftoverTempFile));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    fn shared_name_seeds() -> Vec<SeedRecord> {
        // Two generators starting at the same ID emit the same temp name.
        let first = SeedGenerator::new(SeedIds::starting_at(5), 1);
        let second = SeedGenerator::new(SeedIds::starting_at(5), 1);
        let other = SeedGenerator::new(SeedIds::starting_at(6), 1);
        vec![
            first.generate_from(TargetLibrary::Zlib, &["gz_file"]).unwrap(),
            other.generate_from(TargetLibrary::Zlib, &["gz_file"]).unwrap(),
            second.generate_from(TargetLibrary::Zlib, &["gz_file"]).unwrap(),
        ]
    }

    #[test]
    fn seeds_sharing_a_temp_file_form_one_unit() {
        let units = work_units(&shared_name_seeds(), &ResourceModel::new());
        assert_eq!(units, vec![vec![0, 2], vec![1]]);
        assert_eq!(work_units(&seeds(3), &ResourceModel::new()).len(), 3);
    }

    #[test]
    fn seeds_sharing_a_temp_file_never_overlap() {
        let dir = tempfile::tempdir().unwrap();
        let seeds = shared_name_seeds();
        let work = dir.path().to_path_buf();
        let runner = Runner::new(4, work.clone());
        let summary = runner.run_all(&seeds, || {
            let work = work.clone();
            InProcessExecutor::new(move |seed: &SeedRecord| {
                let path = work.join(format!("seedline_{}_gz_file.gz", seed.id()));
                if path.exists() {
                    return -1;
                }
                if std::fs::write(&path, b"gz").is_err() {
                    return -2;
                }
                std::thread::sleep(Duration::from_millis(100));
                let intact = std::fs::read(&path).is_ok_and(|data| data == b"gz");
                let removed = std::fs::remove_file(&path).is_ok();
                if intact && removed { 66 } else { -33 }
            })
        });
        assert_eq!(summary.completed(), 3, "{:?}", summary.reports);
        assert!(!summary.has_findings());
    }

    #[test]
    fn empty_input_gives_empty_summary() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Runner::new(3, dir.path().to_path_buf());
        let summary = runner.run_all(&[], || InProcessExecutor::new(|_: &SeedRecord| 66));
        assert_eq!(summary.total(), 0);
    }
}
