use crate::library::TargetLibrary;
use crate::sentinel::SANITIZER_EXIT_CODE;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct GeneratorSettings {
    /// Seed for the campaign's ChaCha8 generator.
    #[serde(default)]
    pub rng_seed: u64,
    #[serde(default = "default_libraries")]
    pub libraries: Vec<TargetLibrary>,
    #[serde(default = "default_max_recipes")]
    pub max_recipes: usize,
    #[serde(default = "default_rounds")]
    pub rounds: u64,
    /// Rounds without a new API triple before the campaign stops.
    #[serde(default = "default_quiet_rounds")]
    pub quiet_rounds: u64,
    /// Probability that a round mutates a corpus seed instead of generating.
    #[serde(default = "default_edge_case_ratio")]
    pub edge_case_ratio: f64,
    #[serde(default)]
    pub allow_undefined: bool,
    #[serde(default = "default_min_new_triples")]
    pub min_new_triples: usize,
    #[serde(default = "default_first_seed_id")]
    pub first_seed_id: u64,
}

fn default_libraries() -> Vec<TargetLibrary> {
    TargetLibrary::ALL.to_vec()
}
fn default_max_recipes() -> usize {
    3
}
pub fn default_rounds() -> u64 {
    200
}
fn default_quiet_rounds() -> u64 {
    50
}
pub fn default_edge_case_ratio() -> f64 {
    0.3
}
fn default_min_new_triples() -> usize {
    1
}
fn default_first_seed_id() -> u64 {
    1
}

impl Default for GeneratorSettings {
    fn default() -> Self {
        Self {
            rng_seed: 0,
            libraries: default_libraries(),
            max_recipes: default_max_recipes(),
            rounds: default_rounds(),
            quiet_rounds: default_quiet_rounds(),
            edge_case_ratio: default_edge_case_ratio(),
            allow_undefined: false,
            min_new_triples: default_min_new_triples(),
            first_seed_id: default_first_seed_id(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct HarnessSettings {
    #[serde(default = "default_compiler")]
    pub compiler: String,
    #[serde(default = "default_compile_flags")]
    pub compile_flags: Vec<String>,
    #[serde(default)]
    pub include_dirs: Vec<PathBuf>,
    #[serde(default)]
    pub library_dirs: Vec<PathBuf>,
    /// Per-library replacements for the built-in link flags.
    #[serde(default)]
    pub link_flags: BTreeMap<TargetLibrary, Vec<String>>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_compile_timeout_ms")]
    pub compile_timeout_ms: u64,
    /// Directory seeds run in; their temp files land here. Defaults to the
    /// current directory.
    pub working_dir: Option<PathBuf>,
    #[serde(default = "default_asan_options")]
    pub asan_options: String,
    #[serde(default = "default_threads")]
    pub threads: usize,
}

fn default_compiler() -> String {
    "c++".to_string()
}
fn default_compile_flags() -> Vec<String> {
    ["-g", "-O1", "-fsanitize=address,undefined", "-fno-omit-frame-pointer"]
        .iter()
        .map(|f| f.to_string())
        .collect()
}
fn default_timeout_ms() -> u64 {
    5000
}
fn default_compile_timeout_ms() -> u64 {
    60_000
}
fn default_asan_options() -> String {
    format!("exitcode={SANITIZER_EXIT_CODE}:detect_leaks=1")
}
pub fn default_threads() -> usize {
    1
}

impl HarnessSettings {
    pub fn link_flags_for(&self, library: TargetLibrary) -> Vec<String> {
        self.link_flags
            .get(&library)
            .cloned()
            .unwrap_or_else(|| library.default_link_flags())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn compile_timeout(&self) -> Duration {
        Duration::from_millis(self.compile_timeout_ms)
    }
}

impl Default for HarnessSettings {
    fn default() -> Self {
        Self {
            compiler: default_compiler(),
            compile_flags: default_compile_flags(),
            include_dirs: Vec::new(),
            library_dirs: Vec::new(),
            link_flags: BTreeMap::new(),
            timeout_ms: default_timeout_ms(),
            compile_timeout_ms: default_compile_timeout_ms(),
            working_dir: None,
            asan_options: default_asan_options(),
            threads: default_threads(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum CorpusType {
    InMemory,
    #[default]
    OnDisk,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct CorpusSettings {
    #[serde(default)]
    pub corpus_type: CorpusType,
    #[serde(default)]
    pub initial_seed_paths: Vec<PathBuf>,
    #[serde(default = "default_on_disk_path")]
    pub on_disk_path: PathBuf,
}

pub fn default_on_disk_path() -> PathBuf {
    PathBuf::from("./seedline_corpus")
}

impl Default for CorpusSettings {
    fn default() -> Self {
        Self {
            corpus_type: CorpusType::default(),
            initial_seed_paths: Vec::new(),
            on_disk_path: default_on_disk_path(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct SeedlineConfig {
    #[serde(default)]
    pub generator: GeneratorSettings,
    #[serde(default)]
    pub harness: HarnessSettings,
    #[serde(default)]
    pub corpus: CorpusSettings,
}

impl SeedlineConfig {
    pub fn load_from_file(path: &PathBuf) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;
        Self::from_toml(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })
    }

    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config = SeedlineConfig::from_toml("").unwrap();
        assert_eq!(config.generator.libraries.len(), TargetLibrary::ALL.len());
        assert_eq!(config.harness.asan_options, "exitcode=168:detect_leaks=1");
        assert_eq!(config.corpus.corpus_type, CorpusType::OnDisk);
        assert_eq!(config.harness.timeout(), Duration::from_secs(5));
    }

    #[test]
    fn sections_parse_in_kebab_case() {
        let text = r#"
[generator]
rng-seed = 9
libraries = ["sqlite3", "zlib"]
edge-case-ratio = 0.5
quiet-rounds = 4

[harness]
compiler = "clang"
timeout-ms = 250
working-dir = "/tmp/seeds"

[harness.link-flags]
sqlite = ["-L/opt/sqlite/lib", "-lsqlite3"]

[corpus]
corpus-type = "in-memory"
"#;
        let config = SeedlineConfig::from_toml(text).unwrap();
        assert_eq!(config.generator.rng_seed, 9);
        assert_eq!(
            config.generator.libraries,
            vec![TargetLibrary::Sqlite, TargetLibrary::Zlib]
        );
        assert_eq!(config.generator.quiet_rounds, 4);
        assert_eq!(config.harness.compiler, "clang");
        assert_eq!(
            config.harness.link_flags_for(TargetLibrary::Sqlite),
            vec!["-L/opt/sqlite/lib", "-lsqlite3"]
        );
        assert_eq!(config.harness.link_flags_for(TargetLibrary::Zlib), vec!["-lz"]);
        assert_eq!(config.corpus.corpus_type, CorpusType::InMemory);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(SeedlineConfig::from_toml("[generator]\nround = 3\n").is_err());
        assert!(SeedlineConfig::from_toml("[runner]\n").is_err());
        assert!(SeedlineConfig::from_toml("[generator]\nlibraries = [\"libfoo\"]\n").is_err());
    }

    #[test]
    fn load_from_file_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        let err = SeedlineConfig::load_from_file(&missing).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
