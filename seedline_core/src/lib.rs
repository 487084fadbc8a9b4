pub mod campaign;
pub mod config;
pub mod corpus;
pub mod executor;
pub mod feedback;
pub mod generator;
pub mod library;
pub mod mutator;
pub mod observer;
pub mod oracle;
pub mod parse;
pub mod runner;
pub mod scheduler;
pub mod seed;
pub mod sentinel;
pub mod sequencer;
pub mod validate;

pub use campaign::{Campaign, CampaignStats};
pub use config::SeedlineConfig;
pub use corpus::{Corpus, CorpusError, InMemoryCorpus, OnDiskCorpus};
pub use executor::{ExecutionStatus, Executor, InProcessExecutor, NativeExecutor};
pub use feedback::{ApiTripleFeedback, Feedback, FeedbackError, UniqueSeedFeedback};
pub use generator::{GenerateError, SeedGenerator, SeedIds};
pub use library::{ResourceModel, TargetLibrary};
pub use mutator::{EdgeCaseMutator, Mutator};
pub use observer::{NoOpObserver, Observer, SanitizerObserver, TempFileObserver};
pub use oracle::{BugReport, FindingKind, Oracle, SeedOracle};
pub use parse::ParseError;
pub use runner::{RunReport, RunSummary, Runner};
pub use scheduler::{RandomScheduler, Scheduler, SchedulerError};
pub use seed::SeedRecord;
pub use sentinel::SeedOutcome;
pub use validate::{ValidationReport, validate};
