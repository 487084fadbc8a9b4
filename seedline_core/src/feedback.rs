use crate::corpus::Corpus;
use crate::seed::SeedRecord;
use std::collections::{HashMap, HashSet};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FeedbackError {
    #[error("Initialization error: {0}")]
    InitError(String),
    #[error("Corpus operation failed within feedback: {0}")]
    CorpusInteractionError(#[from] crate::corpus::CorpusError),
}

/// Observer output keyed by observer name, as handed to feedbacks.
pub type ObserversData = HashMap<&'static str, Option<Vec<u8>>>;

/// Decides whether a seed adds something the corpus does not have yet.
///
/// `report_interesting` only updates the feedback's own state; whoever owns
/// the corpus adds the seed, so several feedbacks can vote on one seed.
pub trait Feedback: Send + Sync {
    fn name(&self) -> &'static str;
    /// Learns the seeds already in `corpus`.
    fn init(&mut self, corpus: &dyn Corpus) -> Result<(), FeedbackError>;
    fn is_interesting(
        &mut self,
        seed: &SeedRecord,
        observers_data: &ObserversData,
        corpus: &dyn Corpus,
    ) -> Result<bool, FeedbackError>;
    fn report_interesting(
        &mut self,
        seed: &SeedRecord,
        observers_data: &ObserversData,
        corpus: &dyn Corpus,
    ) -> Result<(), FeedbackError>;
}

/// Rejects seeds whose call sequence (with edge-case kinds) is already known.
#[derive(Default)]
pub struct UniqueSeedFeedback {
    pub known_hashes: HashSet<[u8; 16]>,
}

impl UniqueSeedFeedback {
    pub fn new() -> Self {
        Self {
            known_hashes: HashSet::new(),
        }
    }

    /// MD5 over the library token and the ordered call names. Calls carrying
    /// an edge-case tag contribute their kind too.
    pub fn sequence_hash(seed: &SeedRecord) -> [u8; 16] {
        let mut text = String::from(seed.target_library().token());
        for call in seed.calls() {
            text.push('\n');
            text.push_str(&call.function_name);
            if let Some(tag) = &call.edge_case {
                text.push(':');
                text.push_str(tag.kind.describe());
            }
        }
        md5::compute(text.as_bytes()).0
    }
}

impl Feedback for UniqueSeedFeedback {
    fn name(&self) -> &'static str {
        "UniqueSeedFeedback"
    }

    fn init(&mut self, corpus: &dyn Corpus) -> Result<(), FeedbackError> {
        self.known_hashes
            .extend(corpus.iter().map(Self::sequence_hash));
        Ok(())
    }

    fn is_interesting(
        &mut self,
        seed: &SeedRecord,
        _observers_data: &ObserversData,
        _corpus: &dyn Corpus,
    ) -> Result<bool, FeedbackError> {
        Ok(!self.known_hashes.contains(&Self::sequence_hash(seed)))
    }

    fn report_interesting(
        &mut self,
        seed: &SeedRecord,
        _observers_data: &ObserversData,
        _corpus: &dyn Corpus,
    ) -> Result<(), FeedbackError> {
        self.known_hashes.insert(Self::sequence_hash(seed));
        Ok(())
    }
}

pub type ApiTriple = [String; 3];

/// Consecutive call 3-grams of a seed's call sequence.
pub fn api_triples(seed: &SeedRecord) -> HashSet<ApiTriple> {
    seed.call_sequence()
        .windows(3)
        .map(|w| [w[0].clone(), w[1].clone(), w[2].clone()])
        .collect()
}

/// Keeps seeds that add at least `min_new_triples` unseen API triples.
pub struct ApiTripleFeedback {
    known: HashSet<ApiTriple>,
    min_new_triples: usize,
    last_new: usize,
}

impl ApiTripleFeedback {
    pub fn new(min_new_triples: usize) -> Self {
        Self {
            known: HashSet::new(),
            min_new_triples: min_new_triples.max(1),
            last_new: 0,
        }
    }

    pub fn known_triples(&self) -> usize {
        self.known.len()
    }

    /// Unseen triples found by the most recent `is_interesting` call.
    pub fn last_new_triples(&self) -> usize {
        self.last_new
    }

    fn count_new(&self, seed: &SeedRecord) -> usize {
        api_triples(seed)
            .iter()
            .filter(|t| !self.known.contains(*t))
            .count()
    }
}

impl Feedback for ApiTripleFeedback {
    fn name(&self) -> &'static str {
        "ApiTripleFeedback"
    }

    fn init(&mut self, corpus: &dyn Corpus) -> Result<(), FeedbackError> {
        for seed in corpus.iter() {
            self.known.extend(api_triples(seed));
        }
        Ok(())
    }

    fn is_interesting(
        &mut self,
        seed: &SeedRecord,
        _observers_data: &ObserversData,
        _corpus: &dyn Corpus,
    ) -> Result<bool, FeedbackError> {
        self.last_new = self.count_new(seed);
        Ok(self.last_new >= self.min_new_triples)
    }

    fn report_interesting(
        &mut self,
        seed: &SeedRecord,
        _observers_data: &ObserversData,
        _corpus: &dyn Corpus,
    ) -> Result<(), FeedbackError> {
        self.known.extend(api_triples(seed));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::corpus::InMemoryCorpus;
    use crate::generator::{SeedGenerator, SeedIds};
    use crate::library::TargetLibrary;
    use crate::seed::{LibraryCall, SeedMetadata, Statement};

    fn seed_with(id: u64, calls: &[&str]) -> SeedRecord {
        let mut body: Vec<Statement> = calls
            .iter()
            .map(|name| Statement::Call(LibraryCall::new(*name, &[]).discarded()))
            .collect();
        body.push(Statement::returning(66));
        SeedRecord::assemble(
            SeedMetadata {
                id,
                ..Default::default()
            },
            TargetLibrary::Sqlite,
            Vec::new(),
            body,
        )
    }

    #[test]
    fn unique_seed_feedback_ignores_ids_and_literals() {
        let mut feedback = UniqueSeedFeedback::new();
        let corpus = InMemoryCorpus::new();
        let observers_data = HashMap::new();
        feedback.init(&corpus).unwrap();

        let first = seed_with(1, &["sqlite3_libversion", "sqlite3_threadsafe"]);
        assert!(feedback.is_interesting(&first, &observers_data, &corpus).unwrap());
        feedback
            .report_interesting(&first, &observers_data, &corpus)
            .unwrap();

        let same_calls = seed_with(2, &["sqlite3_libversion", "sqlite3_threadsafe"]);
        assert!(!feedback.is_interesting(&same_calls, &observers_data, &corpus).unwrap());

        let reordered = seed_with(3, &["sqlite3_threadsafe", "sqlite3_libversion"]);
        assert!(feedback.is_interesting(&reordered, &observers_data, &corpus).unwrap());
    }

    #[test]
    fn unique_seed_feedback_learns_existing_corpus() {
        let generator = SeedGenerator::new(SeedIds::default(), 2);
        let seed = generator.generate_from(TargetLibrary::Zlib, &["checksums"]).unwrap();
        let mut corpus = InMemoryCorpus::new();
        corpus.add(seed.clone(), Box::new(())).unwrap();

        let mut feedback = UniqueSeedFeedback::new();
        feedback.init(&corpus).unwrap();
        assert!(!feedback.is_interesting(&seed, &HashMap::new(), &corpus).unwrap());
    }

    #[test]
    fn triples_are_consecutive_windows() {
        let seed = seed_with(1, &["a", "b", "c", "d"]);
        let triples = api_triples(&seed);
        assert_eq!(triples.len(), 2);
        assert!(triples.contains(&["a".to_string(), "b".to_string(), "c".to_string()]));
        assert!(triples.contains(&["b".to_string(), "c".to_string(), "d".to_string()]));
        assert!(api_triples(&seed_with(2, &["a", "b"])).is_empty());
    }

    #[test]
    fn triple_feedback_requires_minimum_new_triples() {
        let mut feedback = ApiTripleFeedback::new(2);
        let corpus = InMemoryCorpus::new();
        let data = HashMap::new();

        let base = seed_with(1, &["a", "b", "c", "d"]);
        assert!(feedback.is_interesting(&base, &data, &corpus).unwrap());
        assert_eq!(feedback.last_new_triples(), 2);
        feedback.report_interesting(&base, &data, &corpus).unwrap();
        assert_eq!(feedback.known_triples(), 2);

        // Only `c d e` is new.
        let one_new = seed_with(2, &["b", "c", "d", "e"]);
        assert!(!feedback.is_interesting(&one_new, &data, &corpus).unwrap());
        assert_eq!(feedback.last_new_triples(), 1);

        let two_new = seed_with(3, &["c", "d", "e", "f"]);
        assert!(feedback.is_interesting(&two_new, &data, &corpus).unwrap());
    }
}
