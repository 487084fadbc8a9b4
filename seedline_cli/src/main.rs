use seedline_core::campaign::Campaign;
use seedline_core::config::{CorpusType, SeedlineConfig};
use seedline_core::corpus::{Corpus, InMemoryCorpus, OnDiskCorpus, read_seed, seed_files};
use seedline_core::executor::{InProcessExecutor, NativeExecutor};
use seedline_core::library::{ResourceModel, TargetLibrary};
use seedline_core::runner::{RunSummary, Runner};
use seedline_core::seed::SeedRecord;
use seedline_core::sentinel::{AMBIGUOUS_EXIT_CODE, SUCCESS_SENTINEL};
use seedline_core::validate::{find_collisions, validate};

use clap::{ArgAction, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Instant;
use tracing_subscriber::EnvFilter;

/// Name of the configuration file looked up in the working directory.
const DEFAULT_CONFIG_FILE: &str = "seedline.toml";

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    #[clap(short, long, value_parser, global = true)]
    config_file: Option<PathBuf>,
    /// Raise log verbosity (-v info, -vv debug, -vvv trace). RUST_LOG wins.
    #[clap(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Parse and check seed files.
    Validate {
        #[clap(required = true)]
        paths: Vec<PathBuf>,
        /// Treat warnings as failures.
        #[clap(long)]
        strict: bool,
    },
    /// Generate seeds into an on-disk corpus.
    Generate {
        /// Target library; repeat for several. Defaults to the configured list.
        #[clap(short, long)]
        library: Vec<TargetLibrary>,
        #[clap(short, long)]
        rounds: Option<u64>,
        #[clap(long)]
        edge_case_ratio: Option<f64>,
        #[clap(long)]
        rng_seed: Option<u64>,
        /// Corpus directory (overrides `corpus.on-disk-path`).
        #[clap(short, long)]
        out: Option<PathBuf>,
    },
    /// Build and execute seeds through the harness.
    Run {
        #[clap(required = true)]
        paths: Vec<PathBuf>,
        /// Skip the native toolchain and replay seeds in process.
        #[clap(long)]
        dry_run: bool,
        #[clap(short, long)]
        threads: Option<usize>,
    },
}

fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Explicit path, then `seedline.toml` in `dir`, then built-in defaults.
fn resolve_config(explicit: Option<PathBuf>, dir: &Path) -> Result<SeedlineConfig, anyhow::Error> {
    match explicit {
        Some(config_path) => {
            println!("Loading configuration from specified path: {config_path:?}");
            SeedlineConfig::load_from_file(&config_path)
        }
        None => {
            let default_config_path = dir.join(DEFAULT_CONFIG_FILE);
            if default_config_path.exists() {
                println!(
                    "No config file specified via CLI, loading default: {default_config_path:?}"
                );
                SeedlineConfig::load_from_file(&default_config_path)
            } else {
                println!(
                    "No config file specified and default '{DEFAULT_CONFIG_FILE}' not found, using built-in defaults."
                );
                Ok(SeedlineConfig::default())
            }
        }
    }
}

/// Returns whether every seed passed.
fn validate_command(paths: &[PathBuf], strict: bool) -> Result<bool, anyhow::Error> {
    let model = ResourceModel::new();
    let files = seed_files(paths)?;
    let mut seeds = Vec::new();
    let mut errors = 0usize;
    let mut warnings = 0usize;

    for file in &files {
        let seed = match read_seed(file) {
            Ok(seed) => seed,
            Err(e) => {
                println!("{}: {e}", file.display());
                errors += 1;
                continue;
            }
        };
        let report = validate(&seed, &model);
        for violation in &report.violations {
            println!("{} (seed {}): {violation}", file.display(), seed.id());
        }
        errors += report.errors().count();
        warnings += report.warnings().count();
        seeds.push(seed);
    }

    let collisions = find_collisions(&seeds, &model);
    for collision in &collisions {
        println!(
            "temp file '{}' is shared by seeds {:?}",
            collision.path, collision.seed_ids
        );
    }
    errors += collisions.len();

    println!(
        "Validated {} file(s): {} error(s), {} warning(s).",
        files.len(),
        errors,
        warnings
    );
    Ok(errors == 0 && (!strict || warnings == 0))
}

fn generate_with<C: Corpus>(config: &SeedlineConfig, mut corpus: C) -> Result<(), anyhow::Error> {
    if !config.corpus.initial_seed_paths.is_empty() {
        let loaded = corpus.load_initial_seeds(&config.corpus.initial_seed_paths)?;
        println!("Loaded {loaded} initial seed(s).");
    }
    let mut campaign = Campaign::new(config.generator.clone(), corpus)?;
    println!(
        "Starting campaign for up to {} rounds over {:?} with {} seed(s) in the corpus...",
        config.generator.rounds,
        config.generator.libraries,
        campaign.corpus().len()
    );
    let start_time = Instant::now();
    let stats = campaign.run()?;
    println!("Campaign finished in {:.2?}.", start_time.elapsed());
    println!(
        "Rounds: {}, Generated: {}, Edge cases: {}, Rejected: {}, Kept: {}, Corpus size: {}, Known API triples: {}{}",
        stats.rounds,
        stats.generated,
        stats.mutated,
        stats.rejected,
        stats.kept,
        campaign.corpus().len(),
        campaign.known_triples(),
        if stats.converged { " (converged)" } else { "" }
    );
    Ok(())
}

fn run_command(
    config: &SeedlineConfig,
    paths: &[PathBuf],
    dry_run: bool,
) -> Result<RunSummary, anyhow::Error> {
    let seeds: Vec<SeedRecord> = seed_files(paths)?
        .iter()
        .map(|path| read_seed(path))
        .collect::<Result<_, _>>()?;
    let harness = &config.harness;
    let working_dir = harness
        .working_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from("."));
    let runner = Runner::new(harness.threads, working_dir);
    println!(
        "Running {} seed(s) on {} thread(s){}...",
        seeds.len(),
        harness.threads.max(1),
        if dry_run { " (dry run)" } else { "" }
    );

    let summary = if dry_run {
        let model = ResourceModel::new();
        runner.run_all(&seeds, || {
            InProcessExecutor::new(move |seed: &SeedRecord| {
                if validate(seed, &model).is_well_formed() {
                    SUCCESS_SENTINEL
                } else {
                    i64::from(AMBIGUOUS_EXIT_CODE)
                }
            })
        })
    } else {
        runner.run_all(&seeds, || NativeExecutor::new(harness.clone()))
    };

    for report in &summary.reports {
        println!(
            "seed {:>6} {:<8} {} ({:.2?})",
            report.seed_id,
            report.library.to_string(),
            report.status,
            report.duration
        );
        for finding in &report.findings {
            println!(
                "  !!! {} (severity {}): {} [md5 {}]",
                finding.kind, finding.severity, finding.description, finding.seed_hash
            );
        }
    }
    println!(
        "Total: {}, Completed: {}, Documented failures: {}, Build failures: {}, Findings: {}",
        summary.total(),
        summary.completed(),
        summary.documented_failures(),
        summary.build_failures(),
        summary.findings().count()
    );
    Ok(summary)
}

fn main() -> Result<ExitCode, anyhow::Error> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut config = resolve_config(cli.config_file, Path::new("."))?;

    match cli.command {
        Command::Validate { paths, strict } => {
            let passed = validate_command(&paths, strict)?;
            Ok(if passed { ExitCode::SUCCESS } else { ExitCode::FAILURE })
        }
        Command::Generate {
            library,
            rounds,
            edge_case_ratio,
            rng_seed,
            out,
        } => {
            if !library.is_empty() {
                config.generator.libraries = library;
            }
            if let Some(rounds) = rounds {
                config.generator.rounds = rounds;
            }
            if let Some(ratio) = edge_case_ratio {
                config.generator.edge_case_ratio = ratio;
            }
            if let Some(seed) = rng_seed {
                config.generator.rng_seed = seed;
            }
            tracing::debug!("Effective configuration: {config:#?}");

            match (out, &config.corpus.corpus_type) {
                (Some(dir), _) => generate_with(&config, OnDiskCorpus::new(dir)?)?,
                (None, CorpusType::OnDisk) => {
                    let dir = config.corpus.on_disk_path.clone();
                    println!("Using OnDiskCorpus at {dir:?}");
                    generate_with(&config, OnDiskCorpus::new(dir)?)?
                }
                (None, CorpusType::InMemory) => {
                    println!("Using InMemoryCorpus; kept seeds are not written out.");
                    generate_with(&config, InMemoryCorpus::new())?
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Run {
            paths,
            dry_run,
            threads,
        } => {
            if let Some(threads) = threads {
                config.harness.threads = threads;
            }
            tracing::debug!("Effective configuration: {config:#?}");
            let summary = run_command(&config, &paths, dry_run)?;
            Ok(if summary.has_findings() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use seedline_core::generator::{SeedGenerator, SeedIds};

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn subcommands_parse() {
        let cli = Cli::parse_from([
            "seedline", "-vv", "generate", "--library", "sqlite3", "-l", "zlib", "--rounds", "5",
        ]);
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Command::Generate { library, rounds, .. } => {
                assert_eq!(library, vec![TargetLibrary::Sqlite, TargetLibrary::Zlib]);
                assert_eq!(rounds, Some(5));
            }
            other => panic!("unexpected command {other:?}"),
        }
        assert!(Cli::try_parse_from(["seedline", "generate", "--library", "libfoo"]).is_err());
        assert!(Cli::try_parse_from(["seedline", "validate"]).is_err());
    }

    #[test]
    fn config_falls_back_to_local_file_then_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let defaults = resolve_config(None, dir.path()).unwrap();
        assert_eq!(defaults.generator.rounds, SeedlineConfig::default().generator.rounds);

        std::fs::write(dir.path().join(DEFAULT_CONFIG_FILE), "[generator]\nrounds = 7\n").unwrap();
        assert_eq!(resolve_config(None, dir.path()).unwrap().generator.rounds, 7);

        let explicit = dir.path().join("other.toml");
        std::fs::write(&explicit, "[generator]\nrounds = 3\n").unwrap();
        assert_eq!(resolve_config(Some(explicit), dir.path()).unwrap().generator.rounds, 3);
    }

    #[test]
    fn validate_command_flags_collisions() {
        let dir = tempfile::tempdir().unwrap();
        let generator = SeedGenerator::new(SeedIds::starting_at(30), 1);
        let seed = generator.generate_from(TargetLibrary::Zlib, &["gz_file"]).unwrap();
        std::fs::write(dir.path().join("a.cc"), seed.source()).unwrap();
        assert!(validate_command(&[dir.path().to_path_buf()], false).unwrap());

        std::fs::write(dir.path().join("b.cc"), seed.source()).unwrap();
        assert!(!validate_command(&[dir.path().to_path_buf()], false).unwrap());
    }

    #[test]
    fn dry_run_replays_generated_seeds() {
        let dir = tempfile::tempdir().unwrap();
        let generator = SeedGenerator::new(SeedIds::default(), 2);
        let picks = [
            (TargetLibrary::Sqlite, "database"),
            (TargetLibrary::Re2, "compiled_regex"),
        ];
        for (library, recipe) in picks {
            let seed = generator.generate_from(library, &[recipe]).unwrap();
            std::fs::write(dir.path().join(format!("{}.cc", seed.file_stem())), seed.source())
                .unwrap();
        }
        let mut config = SeedlineConfig::default();
        config.harness.working_dir = Some(dir.path().to_path_buf());
        config.harness.threads = 2;
        let summary = run_command(&config, &[dir.path().to_path_buf()], true).unwrap();
        assert_eq!(summary.total(), 2);
        assert_eq!(summary.completed(), 2);
        assert!(!summary.has_findings());
    }
}
