use crate::library::TargetLibrary;
use crate::parse::ParseError;
use crate::seed::SeedRecord;
use rand_core::RngCore;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

/// Defines errors that can arise during corpus operations.
///
/// These cover I/O problems when reading or writing seed files and the index,
/// seed files that do not parse, and logical errors such as asking for an
/// entry that does not exist.
#[derive(Error, Debug)]
pub enum CorpusError {
    /// The requested entry was not found within the corpus.
    #[error("Seed entry {0} not found in corpus or index")]
    InputNotFound(usize),

    /// An operation could not be performed because the corpus is empty.
    #[error("Corpus is empty, cannot select a seed")]
    CorpusIsEmpty,

    /// A seed with this ID is already stored.
    #[error("Seed ID {0} is already in the corpus")]
    DuplicateSeed(u64),

    #[error("Corpus I/O error: {0}")]
    Io(String),

    #[error("Corpus serialization error: {0}")]
    Serialization(String),

    #[error("Corpus deserialization error: {0}")]
    Deserialization(String),

    /// A seed file on disk is not in the seed source format.
    #[error("Seed file {path:?} does not parse: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: ParseError,
    },
}

impl From<std::io::Error> for CorpusError {
    fn from(err: std::io::Error) -> Self {
        CorpusError::Io(err.to_string())
    }
}
impl From<serde_json::Error> for CorpusError {
    fn from(err: serde_json::Error) -> Self {
        CorpusError::Deserialization(format!("JSON operation error: {}", err))
    }
}

/// Index record kept for every corpus entry.
///
/// `OnDiskCorpus` persists a list of these as `corpus_index.json`, so a corpus
/// directory can be reopened and its seeds attributed to where they came from.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CorpusEntryMetadata {
    /// Seed file name inside the corpus directory, e.g. `zlib_12.cc`.
    pub file_name: String,
    pub seed_id: u64,
    pub library: TargetLibrary,
    /// Where the seed came from: generated, an edge-case mutation of another
    /// seed, or an initial seed file.
    pub source_description: String,
}

impl CorpusEntryMetadata {
    pub fn for_seed(seed: &SeedRecord, source_description: impl Into<String>) -> Self {
        Self {
            file_name: format!("{}.cc", seed.file_stem()),
            seed_id: seed.id(),
            library: seed.target_library(),
            source_description: source_description.into(),
        }
    }

    /// Converts the loosely typed metadata handed to `Corpus::add`. Accepts a
    /// `CorpusEntryMetadata` (its file name is recomputed from the seed) or a
    /// plain `String` description.
    fn from_any(seed: &SeedRecord, metadata: &(dyn Any + Send + Sync), position: usize) -> Self {
        if let Some(concrete) = metadata.downcast_ref::<CorpusEntryMetadata>() {
            Self::for_seed(seed, concrete.source_description.clone())
        } else if let Some(description) = metadata.downcast_ref::<String>() {
            Self::for_seed(seed, description.clone())
        } else if let Some(description) = metadata.downcast_ref::<&'static str>() {
            Self::for_seed(seed, *description)
        } else {
            Self::for_seed(seed, format!("Seed entry #{position}"))
        }
    }
}

/// Defines the common interface for a collection of seeds.
///
/// A `Corpus` stores seeds with their index metadata, hands them out by
/// position or at random for mutation, and loads seed files from disk.
/// Implementations must be `Send` and `Sync` so a corpus can be shared with
/// worker threads.
pub trait Corpus: Send + Sync {
    /// Adds a seed with its metadata and returns the entry's position.
    ///
    /// `metadata` is usually a [`CorpusEntryMetadata`] or a `String` describing
    /// where the seed came from. Seed IDs are unique within a corpus.
    fn add(
        &mut self,
        seed: SeedRecord,
        metadata: Box<dyn Any + Send + Sync>,
    ) -> Result<usize, CorpusError>;

    /// Retrieves a seed and its metadata by position.
    fn get(&self, id: usize) -> Option<(&SeedRecord, &CorpusEntryMetadata)>;

    /// Selects an entry uniformly at random. Returns `None` on an empty corpus.
    fn random_select(
        &self,
        rng: &mut dyn RngCore,
    ) -> Option<(usize, &SeedRecord, &CorpusEntryMetadata)>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Loads seed files from files and directories (directories are not
    /// traversed recursively). Only `.cc` and `.cpp` files are read; the
    /// corpus index and dotfiles are skipped.
    ///
    /// Returns the number of seeds added.
    fn load_initial_seeds(&mut self, seed_paths: &[PathBuf]) -> Result<usize, CorpusError>;

    /// Every stored seed in insertion order.
    fn iter(&self) -> Box<dyn Iterator<Item = &SeedRecord> + '_>;
}

/// Name of the JSON index an `OnDiskCorpus` keeps next to its seed files.
pub const INDEX_FILENAME: &str = "corpus_index.json";

const SEED_EXTENSIONS: &[&str] = &["cc", "cpp"];

/// Expands files and directories into the seed files they name, in a stable
/// order. Directories contribute their `.cc`/`.cpp` files, skipping dotfiles
/// and the corpus index.
pub fn seed_files(paths: &[PathBuf]) -> Result<Vec<PathBuf>, CorpusError> {
    let mut out = Vec::new();
    for path in paths {
        if path.is_file() {
            out.push(path.clone());
        } else if path.is_dir() {
            let mut in_dir = Vec::new();
            for entry in fs::read_dir(path).map_err(|e| {
                CorpusError::Io(format!("Failed to read seed directory {:?}: {}", path, e))
            })? {
                let entry = entry.map_err(|e| {
                    CorpusError::Io(format!("Error reading entry in {:?}: {}", path, e))
                })?;
                let candidate = entry.path();
                if candidate.is_file() && is_seed_file(&candidate) {
                    in_dir.push(candidate);
                }
            }
            in_dir.sort();
            out.extend(in_dir);
        } else {
            return Err(CorpusError::Io(format!("Seed path {:?} does not exist", path)));
        }
    }
    Ok(out)
}

fn is_seed_file(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    if name == INDEX_FILENAME || name.starts_with('.') {
        return false;
    }
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| SEED_EXTENSIONS.contains(&ext))
}

/// Reads and parses one seed file.
pub fn read_seed(path: &Path) -> Result<SeedRecord, CorpusError> {
    let text = fs::read_to_string(path)
        .map_err(|e| CorpusError::Io(format!("Failed to read seed file {:?}: {}", path, e)))?;
    SeedRecord::parse(&text).map_err(|source| CorpusError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// An in-memory implementation of the `Corpus` trait.
///
/// Fast and not persistent; used by dry runs, tests and campaigns whose
/// results are written out elsewhere.
#[derive(Debug, Default)]
pub struct InMemoryCorpus {
    entries: Vec<(SeedRecord, CorpusEntryMetadata)>,
    seed_ids: HashSet<u64>,
}

impl InMemoryCorpus {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Corpus for InMemoryCorpus {
    fn add(
        &mut self,
        seed: SeedRecord,
        metadata: Box<dyn Any + Send + Sync>,
    ) -> Result<usize, CorpusError> {
        if !self.seed_ids.insert(seed.id()) {
            return Err(CorpusError::DuplicateSeed(seed.id()));
        }
        let id = self.entries.len();
        let metadata = CorpusEntryMetadata::from_any(&seed, metadata.as_ref(), id);
        self.entries.push((seed, metadata));
        Ok(id)
    }

    fn get(&self, id: usize) -> Option<(&SeedRecord, &CorpusEntryMetadata)> {
        self.entries.get(id).map(|(seed, meta)| (seed, meta))
    }

    fn random_select(
        &self,
        rng: &mut dyn RngCore,
    ) -> Option<(usize, &SeedRecord, &CorpusEntryMetadata)> {
        if self.entries.is_empty() {
            return None;
        }
        let index = rng.next_u64() as usize % self.entries.len();
        self.get(index).map(|(seed, meta)| (index, seed, meta))
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn load_initial_seeds(&mut self, seed_paths: &[PathBuf]) -> Result<usize, CorpusError> {
        let mut loaded_count = 0;
        for path in seed_files(seed_paths)? {
            let seed = read_seed(&path)?;
            self.add(seed, Box::new(format!("Initial seed file: {:?}", path)))?;
            loaded_count += 1;
        }
        Ok(loaded_count)
    }

    fn iter(&self) -> Box<dyn Iterator<Item = &SeedRecord> + '_> {
        Box::new(self.entries.iter().map(|(seed, _)| seed))
    }
}

/// A persistent `Corpus`: one `<library>_<id>.cc` file per seed plus a JSON
/// index of [`CorpusEntryMetadata`].
///
/// The seed files are ordinary seed sources, so a corpus directory can be fed
/// straight back to `seedline validate` or `seedline run`. Seeds are also
/// held in memory once loaded; the index is rewritten on every add.
pub struct OnDiskCorpus {
    corpus_dir_path: PathBuf,
    index_file_path: PathBuf,
    entries: Vec<(SeedRecord, CorpusEntryMetadata)>,
    seed_ids: HashSet<u64>,
}

impl OnDiskCorpus {
    /// Creates a new `OnDiskCorpus` or reopens an existing one.
    ///
    /// If `corpus_dir_path` does not exist it is created. If it holds an index,
    /// every seed the index lists is read back and parsed; otherwise an empty
    /// index is written.
    pub fn new(corpus_dir_path: PathBuf) -> Result<Self, CorpusError> {
        if !corpus_dir_path.exists() {
            fs::create_dir_all(&corpus_dir_path).map_err(|e| {
                CorpusError::Io(format!(
                    "Failed to create corpus directory at {:?}: {}",
                    corpus_dir_path, e
                ))
            })?;
        } else if !corpus_dir_path.is_dir() {
            return Err(CorpusError::Io(format!(
                "Corpus path {:?} exists but is not a directory",
                corpus_dir_path
            )));
        }

        let index_file_path = corpus_dir_path.join(INDEX_FILENAME);
        let mut corpus = Self {
            corpus_dir_path,
            index_file_path,
            entries: Vec::new(),
            seed_ids: HashSet::new(),
        };
        corpus.load_index_from_disk()?;
        if !corpus.index_file_path.exists() {
            corpus.save_index_to_disk()?;
        }
        Ok(corpus)
    }

    pub fn dir(&self) -> &Path {
        &self.corpus_dir_path
    }

    fn save_index_to_disk(&self) -> Result<(), CorpusError> {
        let file = File::create(&self.index_file_path).map_err(|e| {
            CorpusError::Io(format!(
                "Failed to create or truncate index file {:?}: {}",
                self.index_file_path, e
            ))
        })?;
        let writer = BufWriter::new(file);
        let index: Vec<&CorpusEntryMetadata> = self.entries.iter().map(|(_, meta)| meta).collect();
        serde_json::to_writer_pretty(writer, &index).map_err(|e| {
            CorpusError::Serialization(format!(
                "Failed to serialize corpus index to JSON for {:?}: {}",
                self.index_file_path, e
            ))
        })?;
        Ok(())
    }

    fn load_index_from_disk(&mut self) -> Result<(), CorpusError> {
        if !self.index_file_path.is_file() {
            return Ok(());
        }
        let file = File::open(&self.index_file_path).map_err(|e| {
            CorpusError::Io(format!(
                "Failed to open index file {:?}: {}",
                self.index_file_path, e
            ))
        })?;
        if file.metadata()?.len() == 0 {
            return Ok(());
        }
        let index: Vec<CorpusEntryMetadata> =
            serde_json::from_reader(BufReader::new(file)).map_err(|e| {
                CorpusError::Deserialization(format!(
                    "Failed to parse JSON from index file {:?}: {}. The file might be corrupted.",
                    self.index_file_path, e
                ))
            })?;
        for meta in index {
            let seed = read_seed(&self.corpus_dir_path.join(&meta.file_name))?;
            if seed.id() != meta.seed_id {
                return Err(CorpusError::Deserialization(format!(
                    "Index lists seed {} for {} but the file declares ID {}",
                    meta.seed_id,
                    meta.file_name,
                    seed.id()
                )));
            }
            self.seed_ids.insert(seed.id());
            self.entries.push((seed, meta));
        }
        debug!(dir = ?self.corpus_dir_path, seeds = self.entries.len(), "reopened corpus");
        Ok(())
    }
}

impl Corpus for OnDiskCorpus {
    fn add(
        &mut self,
        seed: SeedRecord,
        metadata: Box<dyn Any + Send + Sync>,
    ) -> Result<usize, CorpusError> {
        if self.seed_ids.contains(&seed.id()) {
            return Err(CorpusError::DuplicateSeed(seed.id()));
        }
        let new_id = self.entries.len();
        let metadata = CorpusEntryMetadata::from_any(&seed, metadata.as_ref(), new_id);
        let file_path = self.corpus_dir_path.join(&metadata.file_name);
        fs::write(&file_path, seed.source()).map_err(|e| {
            CorpusError::Io(format!("Failed to write seed file {:?}: {}", file_path, e))
        })?;

        self.seed_ids.insert(seed.id());
        self.entries.push((seed, metadata));
        self.save_index_to_disk()?;
        Ok(new_id)
    }

    fn get(&self, id: usize) -> Option<(&SeedRecord, &CorpusEntryMetadata)> {
        self.entries.get(id).map(|(seed, meta)| (seed, meta))
    }

    fn random_select(
        &self,
        rng: &mut dyn RngCore,
    ) -> Option<(usize, &SeedRecord, &CorpusEntryMetadata)> {
        if self.entries.is_empty() {
            return None;
        }
        let id = rng.next_u64() as usize % self.entries.len();
        self.get(id).map(|(seed, meta)| (id, seed, meta))
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn load_initial_seeds(&mut self, seed_paths: &[PathBuf]) -> Result<usize, CorpusError> {
        let mut loaded_count = 0;
        for path in seed_files(seed_paths)? {
            // Files already living in this corpus were loaded from the index.
            if path.parent() == Some(self.corpus_dir_path.as_path()) {
                continue;
            }
            let seed = read_seed(&path)?;
            if self.seed_ids.contains(&seed.id()) {
                warn!(
                    seed_id = seed.id(),
                    file = ?path,
                    "skipping seed with an ID already in the corpus"
                );
                continue;
            }
            self.add(seed, Box::new(format!("Initial seed file: {:?}", path)))?;
            loaded_count += 1;
        }
        Ok(loaded_count)
    }

    fn iter(&self) -> Box<dyn Iterator<Item = &SeedRecord> + '_> {
        Box::new(self.entries.iter().map(|(seed, _)| seed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::{SeedGenerator, SeedIds};
    use rand_chacha::ChaCha8Rng;
    use rand_core::SeedableRng;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn seeds(first_id: u64, count: usize) -> Vec<SeedRecord> {
        let generator = SeedGenerator::new(SeedIds::starting_at(first_id), 2);
        let mut rng = ChaCha8Rng::seed_from_u64(first_id);
        (0..count)
            .map(|_| generator.generate(TargetLibrary::Zlib, &mut rng).unwrap())
            .collect()
    }

    mod in_memory_corpus_tests {
        use super::*;

        #[test]
        fn in_memory_corpus_add_get_len_is_empty() {
            let mut corpus = InMemoryCorpus::new();
            assert!(corpus.is_empty());
            let batch = seeds(1, 2);
            let id1 = corpus
                .add(batch[0].clone(), Box::new("first".to_string()))
                .unwrap();
            let id2 = corpus.add(batch[1].clone(), Box::new("second")).unwrap();
            assert_eq!((id1, id2), (0, 1));
            assert_eq!(corpus.len(), 2);

            let (seed, meta) = corpus.get(id1).unwrap();
            assert_eq!(seed, &batch[0]);
            assert_eq!(meta.source_description, "first");
            assert_eq!(meta.file_name, "zlib_1.cc");
            assert_eq!(corpus.get(id2).unwrap().1.source_description, "second");
            assert!(corpus.get(99).is_none());
        }

        #[test]
        fn duplicate_seed_ids_are_rejected() {
            let mut corpus = InMemoryCorpus::new();
            let seed = seeds(4, 1).remove(0);
            corpus.add(seed.clone(), Box::new(())).unwrap();
            assert!(matches!(
                corpus.add(seed, Box::new(())),
                Err(CorpusError::DuplicateSeed(4))
            ));
        }

        #[test]
        fn in_memory_corpus_random_select_behavior() {
            let mut corpus = InMemoryCorpus::new();
            let mut rng = ChaCha8Rng::from_seed([42; 32]);
            assert!(corpus.random_select(&mut rng).is_none());
            for seed in seeds(10, 3) {
                corpus.add(seed, Box::new(())).unwrap();
            }
            let mut counts = HashMap::new();
            for _ in 0..100 {
                let (id, _, _) = corpus.random_select(&mut rng).unwrap();
                *counts.entry(id).or_insert(0) += 1;
            }
            assert_eq!(counts.len(), 3, "All entries should be selected");
        }

        #[test]
        fn load_initial_seeds_reads_only_seed_sources() -> Result<(), CorpusError> {
            let temp_dir = tempdir().unwrap();
            let batch = seeds(20, 3);
            fs::write(temp_dir.path().join("a.cc"), batch[0].source()).unwrap();
            fs::write(temp_dir.path().join("b.cpp"), batch[1].source()).unwrap();
            fs::write(temp_dir.path().join(".hidden.cc"), batch[2].source()).unwrap();
            fs::write(temp_dir.path().join("notes.txt"), "not a seed").unwrap();
            fs::write(temp_dir.path().join(INDEX_FILENAME), "[]").unwrap();

            let mut corpus = InMemoryCorpus::new();
            let count = corpus.load_initial_seeds(&[temp_dir.path().to_path_buf()])?;
            assert_eq!(count, 2);
            let ids: Vec<u64> = corpus.iter().map(SeedRecord::id).collect();
            assert_eq!(ids, vec![20, 21]);
            Ok(())
        }

        #[test]
        fn unparseable_seed_reports_its_path() {
            let temp_dir = tempdir().unwrap();
            let bad = temp_dir.path().join("bad.cc");
            fs::write(&bad, "int main() { return 0; }\n").unwrap();
            let mut corpus = InMemoryCorpus::new();
            match corpus.load_initial_seeds(&[bad.clone()]) {
                Err(CorpusError::Parse { path, .. }) => assert_eq!(path, bad),
                other => panic!("expected parse error, got {other:?}"),
            }
        }
    }

    mod on_disk_corpus_tests {
        use super::*;

        #[test]
        fn on_disk_corpus_new_dir_creation_and_empty_load() -> Result<(), CorpusError> {
            let base_dir = tempdir().unwrap();
            let corpus_p = base_dir.path().join("new_disk_corpus");
            assert!(!corpus_p.exists());
            let corpus = OnDiskCorpus::new(corpus_p.clone())?;
            assert!(corpus_p.is_dir());
            assert!(corpus_p.join(INDEX_FILENAME).is_file());
            assert!(corpus.is_empty());
            Ok(())
        }

        #[test]
        fn on_disk_corpus_persists_and_reopens() -> Result<(), CorpusError> {
            let base_dir = tempdir().unwrap();
            let corpus_p = base_dir.path().join("corpus");
            let batch = seeds(30, 2);
            {
                let mut corpus = OnDiskCorpus::new(corpus_p.clone())?;
                corpus.add(batch[0].clone(), Box::new("generated".to_string()))?;
                corpus.add(
                    batch[1].clone(),
                    Box::new(CorpusEntryMetadata::for_seed(&batch[1], "edge case of 30")),
                )?;
            }
            assert!(corpus_p.join("zlib_30.cc").is_file());
            assert!(corpus_p.join("zlib_31.cc").is_file());

            let reopened = OnDiskCorpus::new(corpus_p.clone())?;
            assert_eq!(reopened.len(), 2);
            let (seed, meta) = reopened.get(1).unwrap();
            assert_eq!(seed.id(), 31);
            assert_eq!(seed.call_sequence(), batch[1].call_sequence());
            assert_eq!(meta.source_description, "edge case of 30");
            assert_eq!(meta.library, TargetLibrary::Zlib);
            Ok(())
        }

        #[test]
        fn on_disk_corpus_skips_its_own_files_when_loading() -> Result<(), CorpusError> {
            let base_dir = tempdir().unwrap();
            let corpus_p = base_dir.path().join("corpus");
            let mut corpus = OnDiskCorpus::new(corpus_p.clone())?;
            corpus.add(seeds(40, 1).remove(0), Box::new(()))?;
            assert_eq!(corpus.load_initial_seeds(&[corpus_p.clone()])?, 0);
            assert_eq!(corpus.len(), 1);
            Ok(())
        }

        #[test]
        fn corrupted_index_is_reported() {
            let base_dir = tempdir().unwrap();
            let corpus_p = base_dir.path().join("corpus");
            fs::create_dir_all(&corpus_p).unwrap();
            fs::write(corpus_p.join(INDEX_FILENAME), "{not json").unwrap();
            assert!(matches!(
                OnDiskCorpus::new(corpus_p),
                Err(CorpusError::Deserialization(_))
            ));
        }
    }
}
