use crate::config::GeneratorSettings;
use crate::corpus::Corpus;
use crate::feedback::{
    ApiTripleFeedback, Feedback, FeedbackError, ObserversData, UniqueSeedFeedback,
};
use crate::generator::{SeedGenerator, SeedIds};
use crate::library::{ResourceModel, TargetLibrary};
use crate::mutator::{EdgeCaseMutator, Mutator};
use crate::scheduler::{RandomScheduler, Scheduler, SchedulerError, SelectionFeedback};
use crate::seed::SeedRecord;
use crate::validate::validate;
use anyhow::anyhow;
use rand::Rng;
use rand::seq::IndexedRandom;
use rand_chacha::ChaCha8Rng;
use rand_core::SeedableRng;
use std::collections::HashMap;
use tracing::{debug, info, warn};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CampaignStats {
    pub rounds: u64,
    pub generated: u64,
    pub mutated: u64,
    /// Seeds dropped because they failed validation.
    pub rejected: u64,
    pub kept: u64,
    /// Whether the campaign stopped on `quiet_rounds` rather than `rounds`.
    pub converged: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundOutcome {
    Kept { seed_id: u64, new_triples: usize },
    /// Valid, but the feedbacks saw nothing new in it.
    Uninteresting,
    Rejected,
}

/// Where a round's candidate came from.
enum Origin {
    Generated,
    EdgeCaseOf(u64),
}

/// The generation loop: alternates fresh generation with edge-case mutation
/// of corpus seeds and keeps what adds new API triples.
pub struct Campaign<C: Corpus> {
    settings: GeneratorSettings,
    generator: SeedGenerator,
    mutator: EdgeCaseMutator,
    scheduler: RandomScheduler,
    unique: UniqueSeedFeedback,
    triples: ApiTripleFeedback,
    corpus: C,
    model: ResourceModel,
    rng: ChaCha8Rng,
    stats: CampaignStats,
}

impl<C: Corpus> Campaign<C> {
    /// Learns what `corpus` already holds, so its seeds are not produced again
    /// and new IDs continue after the largest one in it.
    pub fn new(settings: GeneratorSettings, corpus: C) -> Result<Self, FeedbackError> {
        let Some(&fallback_library) = settings.libraries.first() else {
            return Err(FeedbackError::InitError(
                "no target libraries configured".to_string(),
            ));
        };
        let ids = SeedIds::starting_at(settings.first_seed_id);
        for seed in corpus.iter() {
            ids.observe(seed.id());
        }
        let generator = SeedGenerator::new(ids, settings.max_recipes);
        let mutator = EdgeCaseMutator::new(generator.clone(), fallback_library)
            .allow_undefined(settings.allow_undefined);

        let mut unique = UniqueSeedFeedback::new();
        let mut triples = ApiTripleFeedback::new(settings.min_new_triples);
        unique.init(&corpus)?;
        triples.init(&corpus)?;
        info!(
            corpus = corpus.len(),
            known_triples = triples.known_triples(),
            "campaign initialised"
        );

        Ok(Self {
            rng: ChaCha8Rng::seed_from_u64(settings.rng_seed),
            settings,
            generator,
            mutator,
            scheduler: RandomScheduler::new(),
            unique,
            triples,
            corpus,
            model: ResourceModel::new(),
            stats: CampaignStats::default(),
        })
    }

    pub fn corpus(&self) -> &C {
        &self.corpus
    }

    pub fn into_corpus(self) -> C {
        self.corpus
    }

    pub fn stats(&self) -> &CampaignStats {
        &self.stats
    }

    pub fn known_triples(&self) -> usize {
        self.triples.known_triples()
    }

    /// Runs rounds until `rounds` is reached or `quiet_rounds` consecutive
    /// rounds keep nothing.
    pub fn run(&mut self) -> Result<CampaignStats, anyhow::Error> {
        let mut quiet = 0u64;
        while self.stats.rounds < self.settings.rounds {
            match self.step()? {
                RoundOutcome::Kept { .. } => quiet = 0,
                RoundOutcome::Uninteresting | RoundOutcome::Rejected => quiet += 1,
            }
            if self.settings.quiet_rounds > 0 && quiet >= self.settings.quiet_rounds {
                info!(
                    rounds = self.stats.rounds,
                    "no new API triples for {quiet} rounds, stopping"
                );
                self.stats.converged = true;
                break;
            }
        }
        Ok(self.stats.clone())
    }

    /// One round: produce a candidate, validate it, and keep it if interesting.
    pub fn step(&mut self) -> Result<RoundOutcome, anyhow::Error> {
        self.stats.rounds += 1;
        let (seed, origin) = self.next_candidate()?;

        let report = validate(&seed, &self.model);
        if !report.is_well_formed() {
            for violation in report.errors() {
                warn!(seed_id = seed.id(), "dropping malformed seed: {violation}");
            }
            self.stats.rejected += 1;
            return Ok(RoundOutcome::Rejected);
        }

        let observers_data: ObserversData = HashMap::new();
        let unique = self.unique.is_interesting(&seed, &observers_data, &self.corpus)?;
        if !unique || !self.triples.is_interesting(&seed, &observers_data, &self.corpus)? {
            debug!(seed_id = seed.id(), unique, "seed adds no new API triples");
            return Ok(RoundOutcome::Uninteresting);
        }
        let new_triples = self.triples.last_new_triples();
        self.unique.report_interesting(&seed, &observers_data, &self.corpus)?;
        self.triples.report_interesting(&seed, &observers_data, &self.corpus)?;

        let description = match origin {
            Origin::Generated => "generated".to_string(),
            Origin::EdgeCaseOf(seed_id) => format!("edge case of seed {seed_id}"),
        };
        let seed_id = seed.id();
        self.corpus.add(seed, Box::new(description))?;
        self.stats.kept += 1;
        info!(seed_id, new_triples, corpus = self.corpus.len(), "kept seed");
        Ok(RoundOutcome::Kept {
            seed_id,
            new_triples,
        })
    }

    fn next_candidate(&mut self) -> Result<(SeedRecord, Origin), anyhow::Error> {
        let ratio = match self.settings.edge_case_ratio {
            r if r.is_finite() => r.clamp(0.0, 1.0),
            _ => 0.0,
        };
        if !self.corpus.is_empty() && self.rng.random_bool(ratio) {
            if let Some(mutant) = self.mutate_scheduled()? {
                self.stats.mutated += 1;
                return Ok(mutant);
            }
        }
        let library = self.pick_library()?;
        let seed = self.generator.generate(library, &mut self.rng)?;
        self.stats.generated += 1;
        Ok((seed, Origin::Generated))
    }

    /// Mutates a scheduled corpus entry. `None` when nothing in the corpus can
    /// be mutated any more.
    fn mutate_scheduled(&mut self) -> Result<Option<(SeedRecord, Origin)>, anyhow::Error> {
        let entry = match self.scheduler.next(&self.corpus, &mut self.rng) {
            Ok(entry) => entry,
            Err(SchedulerError::CorpusEmpty | SchedulerError::CorpusExhausted) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let base = self
            .corpus
            .get(entry)
            .map(|(seed, _)| seed.clone())
            .ok_or_else(|| anyhow!("scheduler returned unknown corpus entry {entry}"))?;
        match self.mutator.mutate(Some(&base), &mut self.rng, Some(&self.corpus as &dyn Corpus)) {
            Ok(mutant) => {
                self.scheduler
                    .report_feedback(entry, &SelectionFeedback::Mutated, false);
                Ok(Some((mutant, Origin::EdgeCaseOf(base.id()))))
            }
            Err(e) => {
                debug!(seed_id = base.id(), "no edge case applies: {e}");
                self.scheduler
                    .report_feedback(entry, &SelectionFeedback::NoCandidates, false);
                Ok(None)
            }
        }
    }

    fn pick_library(&mut self) -> Result<TargetLibrary, anyhow::Error> {
        self.settings
            .libraries
            .choose(&mut self.rng)
            .copied()
            .ok_or_else(|| anyhow!("no target libraries configured"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::corpus::{InMemoryCorpus, OnDiskCorpus};
    use crate::feedback::api_triples;
    use std::collections::HashSet;

    fn settings(libraries: Vec<TargetLibrary>, rounds: u64) -> GeneratorSettings {
        GeneratorSettings {
            rng_seed: 11,
            libraries,
            rounds,
            quiet_rounds: 0,
            ..Default::default()
        }
    }

    #[test]
    fn every_kept_seed_is_valid_and_unique() {
        let libraries = vec![TargetLibrary::Sqlite, TargetLibrary::Zlib];
        let mut campaign = Campaign::new(settings(libraries, 60), InMemoryCorpus::new()).unwrap();
        let stats = campaign.run().unwrap();
        assert_eq!(stats.rounds, 60);
        assert_eq!(stats.generated + stats.mutated, 60);
        assert_eq!(stats.rejected, 0);
        assert_eq!(stats.kept as usize, campaign.corpus().len());
        assert!(stats.kept > 0);

        let model = ResourceModel::new();
        let mut ids = HashSet::new();
        for seed in campaign.corpus().iter() {
            assert!(validate(seed, &model).is_well_formed(), "{}", seed.source());
            assert!(ids.insert(seed.id()));
        }
    }

    #[test]
    fn same_rng_seed_gives_same_corpus() {
        let run = || {
            let mut campaign =
                Campaign::new(settings(vec![TargetLibrary::Lcms], 30), InMemoryCorpus::new())
                    .unwrap();
            campaign.run().unwrap();
            campaign
                .into_corpus()
                .iter()
                .map(|s| s.source().to_string())
                .collect::<Vec<_>>()
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn quiet_rounds_stop_a_saturated_campaign() {
        let mut settings = settings(vec![TargetLibrary::Unity], 10_000);
        settings.quiet_rounds = 25;
        settings.edge_case_ratio = 0.0;
        let mut campaign = Campaign::new(settings, InMemoryCorpus::new()).unwrap();
        let stats = campaign.run().unwrap();
        assert!(stats.converged);
        assert!(stats.rounds < 10_000);
    }

    #[test]
    fn edge_case_only_campaign_derives_from_corpus() {
        let mut settings = settings(vec![TargetLibrary::Zlib], 40);
        settings.edge_case_ratio = 1.0;
        let mut campaign = Campaign::new(settings, InMemoryCorpus::new()).unwrap();
        campaign.run().unwrap();
        let stats = campaign.stats().clone();
        // The first round has nothing to mutate.
        assert!(stats.generated >= 1);
        assert!(stats.mutated > 0);
        assert!(campaign.corpus().iter().any(|s| s.has_edge_cases()));
    }

    #[test]
    fn resumed_campaign_continues_ids_and_knows_triples() {
        let dir = tempfile::tempdir().unwrap();
        let corpus = OnDiskCorpus::new(dir.path().to_path_buf()).unwrap();
        let mut first = Campaign::new(settings(vec![TargetLibrary::CJson], 15), corpus).unwrap();
        first.run().unwrap();
        let known = first.known_triples();
        let max_id = first.corpus().iter().map(|s| s.id()).max().unwrap();
        drop(first);

        let reopened = OnDiskCorpus::new(dir.path().to_path_buf()).unwrap();
        let before = reopened.len();
        let mut second = Campaign::new(settings(vec![TargetLibrary::CJson], 15), reopened).unwrap();
        assert_eq!(second.known_triples(), known);
        second.run().unwrap();
        for seed in second.corpus().iter().skip(before) {
            assert!(seed.id() > max_id);
        }
    }

    #[test]
    fn kept_seeds_each_add_a_triple() {
        let mut campaign =
            Campaign::new(settings(vec![TargetLibrary::Libpng], 40), InMemoryCorpus::new())
                .unwrap();
        campaign.run().unwrap();
        let mut seen = HashSet::new();
        for seed in campaign.corpus().iter() {
            let triples = api_triples(seed);
            assert!(triples.iter().any(|t| !seen.contains(t)), "seed {} added nothing", seed.id());
            seen.extend(triples);
        }
    }

    #[test]
    fn empty_library_list_is_an_error() {
        assert!(Campaign::new(settings(Vec::new(), 1), InMemoryCorpus::new()).is_err());
    }
}
