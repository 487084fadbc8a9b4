use crate::corpus::Corpus;
use rand_core::RngCore;
use std::any::Any;
use std::collections::HashSet;
use thiserror::Error;

/// Errors that can occur during scheduler operations.
#[derive(Error, Debug)]
pub enum SchedulerError {
    /// Indicates that the corpus is empty, and therefore no seed can be scheduled.
    #[error("Corpus is empty, cannot schedule next seed")]
    CorpusEmpty,
    /// Every entry has been reported as yielding no further mutations.
    #[error("Every corpus entry is exhausted")]
    CorpusExhausted,
    /// Wraps an error originating from the corpus backend encountered during a
    /// scheduler operation.
    #[error("Corpus interaction failed within scheduler: {0}")]
    CorpusInteractionError(#[from] crate::corpus::CorpusError),
}

/// What happened when a scheduled seed was handed to a mutator. Passed back
/// through [`Scheduler::report_feedback`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionFeedback {
    Mutated,
    /// The mutator found no call to perturb.
    NoCandidates,
}

/// A `Scheduler` selects the corpus entry the next mutation starts from.
pub trait Scheduler: Send + Sync {
    /// Selects and returns the position of the next seed to mutate.
    ///
    /// # Arguments
    /// * `corpus`: The corpus to select from.
    /// * `rng`: Random number generator for randomized strategies.
    ///
    /// # Returns
    /// The selected entry's position, or a `SchedulerError` if nothing can be
    /// selected.
    fn next(
        &mut self,
        corpus: &dyn Corpus,
        rng: &mut dyn RngCore,
    ) -> Result<usize, SchedulerError>;

    /// Reports what became of a previously scheduled entry.
    ///
    /// # Arguments
    /// * `entry_id`: Position of the entry in the corpus.
    /// * `feedback_value`: Arbitrary feedback; schedulers downcast what they
    ///   understand (`RandomScheduler` reads [`SelectionFeedback`]).
    /// * `is_solution`: Whether the entry led to a finding.
    fn report_feedback(&mut self, entry_id: usize, feedback_value: &dyn Any, is_solution: bool);
}

/// Selects seeds uniformly at random, skipping entries reported as
/// [`SelectionFeedback::NoCandidates`].
#[derive(Default, Debug)]
pub struct RandomScheduler {
    exhausted: HashSet<usize>,
}

/// Random draws before falling back to a scan for a live entry.
const MAX_DRAWS: usize = 16;

impl RandomScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exhausted(&self) -> usize {
        self.exhausted.len()
    }
}

impl Scheduler for RandomScheduler {
    fn next(
        &mut self,
        corpus: &dyn Corpus,
        rng: &mut dyn RngCore,
    ) -> Result<usize, SchedulerError> {
        if corpus.is_empty() {
            return Err(SchedulerError::CorpusEmpty);
        }
        if self.exhausted.len() >= corpus.len() {
            return Err(SchedulerError::CorpusExhausted);
        }
        for _ in 0..MAX_DRAWS {
            match corpus.random_select(rng) {
                Some((id, _, _)) if !self.exhausted.contains(&id) => return Ok(id),
                Some(_) => continue,
                None => return Err(SchedulerError::CorpusEmpty),
            }
        }
        // Mostly exhausted corpus: pick among the remaining entries directly.
        let live: Vec<usize> = (0..corpus.len())
            .filter(|id| !self.exhausted.contains(id))
            .collect();
        if live.is_empty() {
            return Err(SchedulerError::CorpusExhausted);
        }
        Ok(live[rng.next_u64() as usize % live.len()])
    }

    fn report_feedback(&mut self, entry_id: usize, feedback_value: &dyn Any, _is_solution: bool) {
        if let Some(SelectionFeedback::NoCandidates) =
            feedback_value.downcast_ref::<SelectionFeedback>()
        {
            self.exhausted.insert(entry_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::corpus::InMemoryCorpus;
    use crate::generator::{SeedGenerator, SeedIds};
    use crate::library::TargetLibrary;
    use rand_chacha::ChaCha8Rng;
    use rand_core::SeedableRng;

    fn corpus_of(count: usize) -> InMemoryCorpus {
        let generator = SeedGenerator::new(SeedIds::default(), 2);
        let mut rng = ChaCha8Rng::from_seed([7; 32]);
        let mut corpus = InMemoryCorpus::new();
        for _ in 0..count {
            let seed = generator.generate(TargetLibrary::CJson, &mut rng).unwrap();
            corpus.add(seed, Box::new(())).unwrap();
        }
        corpus
    }

    #[test]
    fn random_scheduler_next_from_empty_corpus_returns_corpus_empty_error() {
        let mut scheduler = RandomScheduler::new();
        let corpus = InMemoryCorpus::new();
        let mut rng = ChaCha8Rng::from_seed([0; 32]);
        assert!(matches!(
            scheduler.next(&corpus, &mut rng),
            Err(SchedulerError::CorpusEmpty)
        ));
    }

    #[test]
    fn random_scheduler_next_from_non_empty_corpus_returns_valid_id() {
        let mut scheduler = RandomScheduler::new();
        let corpus = corpus_of(2);
        let mut rng = ChaCha8Rng::from_seed([1; 32]);
        let mut selected = HashSet::new();
        for _ in 0..50 {
            let id = scheduler.next(&corpus, &mut rng).unwrap();
            assert!(id < corpus.len());
            selected.insert(id);
        }
        assert_eq!(selected.len(), 2);
    }

    #[test]
    fn exhausted_entries_are_not_scheduled() {
        let mut scheduler = RandomScheduler::new();
        let corpus = corpus_of(3);
        let mut rng = ChaCha8Rng::from_seed([2; 32]);
        scheduler.report_feedback(0, &SelectionFeedback::NoCandidates, false);
        scheduler.report_feedback(2, &SelectionFeedback::NoCandidates, false);
        scheduler.report_feedback(1, &SelectionFeedback::Mutated, false);
        for _ in 0..20 {
            assert_eq!(scheduler.next(&corpus, &mut rng).unwrap(), 1);
        }
        scheduler.report_feedback(1, &SelectionFeedback::NoCandidates, false);
        assert!(matches!(
            scheduler.next(&corpus, &mut rng),
            Err(SchedulerError::CorpusExhausted)
        ));
    }

    #[test]
    fn unknown_feedback_values_are_ignored() {
        let mut scheduler = RandomScheduler::new();
        scheduler.report_feedback(0, &42i32, true);
        assert_eq!(scheduler.exhausted(), 0);
    }
}
