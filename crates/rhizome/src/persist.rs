use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::detector::ContentHash;
use crate::error::{IoContext, Result, RhizomeError};
use crate::types::{Frontmatter, NodeId, UnitId};

pub const CACHE_FILE_NAME: &str = "build-state.json";
const STAGING_FILE_NAME: &str = "build-state.json.tmp";

/// Bumped whenever the on-disk layout of [`CacheRecord`] changes.
pub const CACHE_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub content_hash: ContentHash,
    /// Generation of the build that last confirmed this hash.
    pub validated: u64,
}

/// What a proxy needs to stand in for an unchanged unit without parsing it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedMetadata {
    pub frontmatter: Frontmatter,
    pub output_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorOutcome {
    pub messages: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheRecord {
    pub format_version: u32,
    pub generation: u64,
    pub config_hash: Option<ContentHash>,
    pub entries: BTreeMap<NodeId, CacheEntry>,
    pub units: BTreeMap<UnitId, CachedMetadata>,
    #[serde(default)]
    pub validators: BTreeMap<String, ValidatorOutcome>,
}

impl Default for CacheRecord {
    fn default() -> Self {
        Self {
            format_version: CACHE_FORMAT_VERSION,
            generation: 0,
            config_hash: None,
            entries: BTreeMap::new(),
            units: BTreeMap::new(),
            validators: BTreeMap::new(),
        }
    }
}

impl CacheRecord {
    pub fn is_fresh(&self, node: &NodeId, current: &ContentHash) -> bool {
        self.entries
            .get(node)
            .map(|entry| entry.content_hash == *current)
            .unwrap_or(false)
    }

    pub fn validator_key(validator: &str, hash: &ContentHash) -> String {
        format!("{validator}@{hash}")
    }
}

/// Owns the cache directory. Reads are fail-safe; writes go through a staged
/// file that only replaces the previous record by rename.
pub struct Persistor {
    cache_dir: PathBuf,
}

impl Persistor {
    pub fn new(cache_dir: impl AsRef<Path>) -> Self {
        Self {
            cache_dir: cache_dir.as_ref().to_path_buf(),
        }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn record_path(&self) -> PathBuf {
        self.cache_dir.join(CACHE_FILE_NAME)
    }

    fn staging_path(&self) -> PathBuf {
        self.cache_dir.join(STAGING_FILE_NAME)
    }

    /// Loads the last committed record. A missing record is a cold cache; an
    /// unreadable or incompatible one is also a cold cache, reported alongside.
    pub fn load(&self) -> (CacheRecord, Option<RhizomeError>) {
        let path = self.record_path();
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                debug!("no cache at {}, starting cold", path.display());
                return (CacheRecord::default(), None);
            }
            Err(error) => {
                return self.corrupt(path, error.to_string());
            }
        };

        match serde_json::from_str::<CacheRecord>(&content) {
            Ok(record) if record.format_version == CACHE_FORMAT_VERSION => (record, None),
            Ok(record) => self.corrupt(
                path,
                format!(
                    "format version {} (expected {CACHE_FORMAT_VERSION})",
                    record.format_version
                ),
            ),
            Err(error) => self.corrupt(path, error.to_string()),
        }
    }

    fn corrupt(&self, path: PathBuf, reason: String) -> (CacheRecord, Option<RhizomeError>) {
        warn!("ignoring cache at {}: {reason}", path.display());
        (
            CacheRecord::default(),
            Some(RhizomeError::CacheCorruption { path, reason }),
        )
    }

    /// Writes the record to the staging file and syncs it. Nothing visible to
    /// [`Persistor::load`] changes until the returned commit is published.
    pub fn stage(&self, record: &CacheRecord) -> Result<StagedCommit> {
        fs::create_dir_all(&self.cache_dir).io_context("creating cache dir", &self.cache_dir)?;
        let staging = self.staging_path();
        let content = serde_json::to_string_pretty(record).map_err(|error| {
            RhizomeError::JsonParse {
                path: staging.clone(),
                message: error.to_string(),
            }
        })?;

        let mut file = File::create(&staging).io_context("staging cache", &staging)?;
        file.write_all(content.as_bytes())
            .io_context("staging cache", &staging)?;
        file.sync_all().io_context("syncing cache", &staging)?;

        Ok(StagedCommit {
            staging,
            target: self.record_path(),
        })
    }

    pub fn commit(&self, record: &CacheRecord) -> Result<()> {
        self.stage(record)?.publish()
    }

    pub fn clear(&self) -> Result<()> {
        if self.cache_dir.exists() {
            fs::remove_dir_all(&self.cache_dir).io_context("removing cache", &self.cache_dir)?;
        }
        Ok(())
    }
}

#[must_use = "a staged commit is not visible until published"]
pub struct StagedCommit {
    staging: PathBuf,
    target: PathBuf,
}

impl StagedCommit {
    pub fn publish(self) -> Result<()> {
        fs::rename(&self.staging, &self.target).io_context("publishing cache", &self.target)?;
        if let Some(parent) = self.target.parent()
            && let Ok(directory) = File::open(parent)
        {
            // Directory fsync is unsupported on some platforms; the rename itself
            // is still atomic there.
            let _ = directory.sync_all();
        }
        debug!("committed cache to {}", self.target.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_record(generation: u64) -> CacheRecord {
        let mut record = CacheRecord {
            generation,
            config_hash: Some(ContentHash::from_bytes(b"config")),
            ..CacheRecord::default()
        };
        record.entries.insert(
            NodeId::Unit(UnitId::new("a.md")),
            CacheEntry {
                content_hash: ContentHash::from_bytes(format!("a{generation}").as_bytes()),
                validated: generation,
            },
        );
        record.units.insert(
            UnitId::new("a.md"),
            CachedMetadata {
                frontmatter: Frontmatter::default(),
                output_path: PathBuf::from("a/index.html"),
            },
        );
        record.validators.insert(
            CacheRecord::validator_key("required-fields", &ContentHash::from_bytes(b"a")),
            ValidatorOutcome { messages: vec![] },
        );
        record
    }

    #[test]
    fn test_commit_and_load() {
        let dir = TempDir::new().unwrap();
        let persistor = Persistor::new(dir.path().join(".rhizome-cache"));
        let record = sample_record(1);

        persistor.commit(&record).unwrap();
        let (loaded, problem) = persistor.load();

        assert!(problem.is_none());
        assert_eq!(loaded, record);
    }

    #[test]
    fn test_load_missing_is_cold_without_warning() {
        let dir = TempDir::new().unwrap();
        let persistor = Persistor::new(dir.path());
        let (record, problem) = persistor.load();
        assert!(problem.is_none());
        assert_eq!(record, CacheRecord::default());
    }

    #[test]
    fn test_load_corrupt_is_cold_with_warning() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(CACHE_FILE_NAME), "not valid json {{{").unwrap();
        let persistor = Persistor::new(dir.path());

        let (record, problem) = persistor.load();
        assert_eq!(record, CacheRecord::default());
        assert!(matches!(
            problem,
            Some(RhizomeError::CacheCorruption { .. })
        ));
    }

    #[test]
    fn test_load_wrong_version_is_cold() {
        let dir = TempDir::new().unwrap();
        let persistor = Persistor::new(dir.path());
        let mut record = sample_record(3);
        record.format_version = CACHE_FORMAT_VERSION + 1;
        persistor.commit(&record).unwrap();

        let (loaded, problem) = persistor.load();
        assert_eq!(loaded, CacheRecord::default());
        assert!(problem.is_some());
    }

    #[test]
    fn test_interrupted_commit_keeps_previous_record() {
        let dir = TempDir::new().unwrap();
        let persistor = Persistor::new(dir.path());
        let previous = sample_record(1);
        persistor.commit(&previous).unwrap();

        let staged = persistor.stage(&sample_record(2)).unwrap();
        drop(staged);

        let (loaded, problem) = persistor.load();
        assert!(problem.is_none());
        assert_eq!(loaded, previous);
    }

    #[test]
    fn test_torn_staging_file_is_never_read() {
        let dir = TempDir::new().unwrap();
        let persistor = Persistor::new(dir.path());
        let previous = sample_record(1);
        persistor.commit(&previous).unwrap();

        fs::write(dir.path().join(STAGING_FILE_NAME), "{\"format_version\": 1, \"gen").unwrap();

        let (loaded, problem) = persistor.load();
        assert!(problem.is_none());
        assert_eq!(loaded, previous);

        let next = sample_record(2);
        persistor.commit(&next).unwrap();
        assert_eq!(persistor.load().0, next);
    }

    #[test]
    fn test_published_commit_replaces_record() {
        let dir = TempDir::new().unwrap();
        let persistor = Persistor::new(dir.path());
        persistor.commit(&sample_record(1)).unwrap();

        let next = sample_record(2);
        persistor.stage(&next).unwrap().publish().unwrap();

        assert_eq!(persistor.load().0, next);
        assert!(!dir.path().join(STAGING_FILE_NAME).exists());
    }

    #[test]
    fn test_clear_removes_cache_dir() {
        let dir = TempDir::new().unwrap();
        let cache_dir = dir.path().join(".rhizome-cache");
        let persistor = Persistor::new(&cache_dir);
        persistor.commit(&sample_record(1)).unwrap();

        persistor.clear().unwrap();
        assert!(!cache_dir.exists());
    }
}
