use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::debug;

use crate::error::{IoContext, Result, RhizomeError};
use crate::parsing::extract_frontmatter;
use crate::types::{Frontmatter, MaterializationState, UnitMeta};

#[derive(Debug, Clone, PartialEq)]
pub struct LoadedSource {
    pub frontmatter: Frontmatter,
    pub body: String,
}

/// Reads and parses a unit's source. Shared by every worker, so it must be
/// callable from many threads at once.
pub trait SourceLoader: Send + Sync {
    fn load(&self, path: &Path) -> Result<LoadedSource>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FsSourceLoader;

impl SourceLoader for FsSourceLoader {
    fn load(&self, path: &Path) -> Result<LoadedSource> {
        let content = fs::read_to_string(path).io_context("reading content", path)?;
        let (frontmatter, body) = extract_frontmatter(&content, path)?;
        Ok(LoadedSource { frontmatter, body })
    }
}

/// Stands in for an unchanged unit. Metadata comes from the cache; the body is
/// parsed on first access, exactly once, and kept for the rest of the build.
pub struct LazyContentProxy {
    meta: UnitMeta,
    loader: Arc<dyn SourceLoader>,
    loaded: OnceLock<std::result::Result<LoadedSource, String>>,
    loads: AtomicUsize,
}

impl LazyContentProxy {
    pub fn new(meta: UnitMeta, loader: Arc<dyn SourceLoader>) -> Self {
        Self {
            meta,
            loader,
            loaded: OnceLock::new(),
            loads: AtomicUsize::new(0),
        }
    }

    pub fn meta(&self) -> &UnitMeta {
        &self.meta
    }

    pub fn state(&self) -> MaterializationState {
        if self.loaded.get().is_some() {
            MaterializationState::Loaded
        } else {
            MaterializationState::Unloaded
        }
    }

    /// Number of times the source was actually read. Never exceeds one.
    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    /// Materializes the unit. Concurrent callers block on the first one; a
    /// failure is cached like a success.
    pub fn ensure_loaded(&self) -> Result<&LoadedSource> {
        let loaded = self.loaded.get_or_init(|| {
            self.loads.fetch_add(1, Ordering::SeqCst);
            debug!("materializing {}", self.meta.id);
            match &self.meta.source {
                Some(path) => self.loader.load(path).map_err(|error| error.to_string()),
                None => Ok(LoadedSource {
                    frontmatter: self.meta.frontmatter.clone(),
                    body: String::new(),
                }),
            }
        });

        loaded.as_ref().map_err(|message| RhizomeError::ContentParse {
            unit: self.meta.id.clone(),
            message: message.clone(),
        })
    }
}

impl std::fmt::Debug for LazyContentProxy {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("LazyContentProxy")
            .field("id", &self.meta.id)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::ContentHash;
    use crate::types::{SectionId, UnitId, UnitKind};
    use std::path::PathBuf;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Counts reads and records which paths were touched.
    #[derive(Default)]
    struct RecordingLoader {
        reads: Mutex<Vec<PathBuf>>,
    }

    impl SourceLoader for RecordingLoader {
        fn load(&self, path: &Path) -> Result<LoadedSource> {
            if let Ok(mut reads) = self.reads.lock() {
                reads.push(path.to_path_buf());
            }
            FsSourceLoader.load(path)
        }
    }

    fn meta_for(path: &Path) -> UnitMeta {
        UnitMeta {
            id: UnitId::new("a.md"),
            kind: UnitKind::Page,
            section: SectionId::root(),
            source: Some(path.to_path_buf()),
            frontmatter: Frontmatter::default(),
            effective: Frontmatter::default(),
            output_path: PathBuf::from("a/index.html"),
            url: "/a/".to_string(),
            content_hash: ContentHash::from_bytes(b""),
        }
    }

    #[test]
    fn test_unloaded_until_body_access() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.md");
        fs::write(&path, "+++\ntitle = \"A\"\n+++\nBody text").unwrap();

        let loader = Arc::new(RecordingLoader::default());
        let proxy = LazyContentProxy::new(meta_for(&path), loader.clone());
        assert_eq!(proxy.state(), MaterializationState::Unloaded);
        assert_eq!(proxy.meta().url, "/a/");
        assert!(loader.reads.lock().unwrap().is_empty());

        let loaded = proxy.ensure_loaded().unwrap();
        assert_eq!(loaded.body, "Body text");
        assert_eq!(proxy.state(), MaterializationState::Loaded);

        proxy.ensure_loaded().unwrap();
        assert_eq!(proxy.load_count(), 1);
        assert_eq!(loader.reads.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_concurrent_materialization_happens_once() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.md");
        fs::write(&path, "Shared body").unwrap();

        let proxy = Arc::new(LazyContentProxy::new(
            meta_for(&path),
            Arc::new(FsSourceLoader),
        ));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let proxy = Arc::clone(&proxy);
                std::thread::spawn(move || proxy.ensure_loaded().unwrap().body.clone())
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.join().unwrap(), "Shared body");
        }
        assert_eq!(proxy.load_count(), 1);
    }

    #[test]
    fn test_failed_materialization_is_cached() {
        let dir = TempDir::new().unwrap();
        let proxy = LazyContentProxy::new(
            meta_for(&dir.path().join("missing.md")),
            Arc::new(FsSourceLoader),
        );

        let first = proxy.ensure_loaded().unwrap_err();
        assert!(matches!(first, RhizomeError::ContentParse { .. }));
        assert!(proxy.ensure_loaded().is_err());
        assert_eq!(proxy.load_count(), 1);
    }

    #[test]
    fn test_generated_unit_has_empty_body() {
        let mut meta = meta_for(Path::new("unused"));
        meta.source = None;
        let proxy = LazyContentProxy::new(meta, Arc::new(FsSourceLoader));
        assert_eq!(proxy.ensure_loaded().unwrap().body, "");
    }
}
