use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::cascade::CascadeResolver;
use crate::config::ConfigLoader;
use crate::dependency::DependencyTracker;
use crate::detector::{ChangeDetector, ContentHash};
use crate::discovery::{DiscoveredUnit, SECTION_INDEX, discover, load_data};
use crate::error::{ErrorKind, Result, RhizomeError};
use crate::graph::{ContentAccess, ContentEntry, ContentGraph, ContentUnit};
use crate::notify::{ChangeEvent, ChangeKind, ChangeNotifier, NoopNotifier};
use crate::output::{OutputWriter, WriteStatus};
use crate::parsing::template_dependencies;
use crate::persist::{CacheEntry, CacheRecord, CachedMetadata, Persistor};
use crate::proxy::{FsSourceLoader, LazyContentProxy, LoadedSource, SourceLoader};
use crate::render::{RenderContext, Renderer, TeraRenderer, template_sources};
use crate::scheduler::{BuildScheduler, CancellationToken, UnitOutcome, WorkSet};
use crate::taxonomy::taxonomy_pages;
use crate::types::{Frontmatter, NodeId, SectionId, SectionTree, UnitId, UnitKind, UnitMeta};
use crate::validate::{RequiredFields, Validator, run_validators};

/// A unit that could not be produced in this build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitError {
    pub unit: UnitId,
    pub kind: ErrorKind,
    pub message: String,
}

impl UnitError {
    fn new(unit: UnitId, error: &RhizomeError) -> Self {
        Self {
            unit,
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

impl fmt::Display for UnitError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{} [{}]: {}", self.unit, self.kind, self.message)
    }
}

#[derive(Debug, Clone, Default)]
pub struct BuildResult {
    pub regenerated_count: usize,
    pub skipped_count: usize,
    pub errors: Vec<UnitError>,
    pub warnings: Vec<String>,
    pub events: Vec<ChangeEvent>,
    pub duration: Duration,
    pub work_set: WorkSet,
    pub full_rebuild: bool,
    pub cache_recovered: bool,
    /// Units still unmaterialized when the build finished.
    pub lazy_units: usize,
}

impl BuildResult {
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }
}

/// What is known about a discovered unit before cascades are applied.
struct Prepared {
    unit: DiscoveredUnit,
    hash: ContentHash,
    frontmatter: Frontmatter,
    /// `None` when the cached metadata was reused and the source left unread.
    body: Option<String>,
}

pub struct SiteBuilder {
    root: PathBuf,
    jobs: Option<usize>,
    profile: Option<String>,
    env: Option<BTreeMap<String, String>>,
    output_dir: Option<PathBuf>,
    renderer: Option<Arc<dyn Renderer>>,
    loader: Arc<dyn SourceLoader>,
    validators: Vec<Arc<dyn Validator>>,
    notifier: Arc<dyn ChangeNotifier>,
    token: CancellationToken,
}

impl SiteBuilder {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            jobs: None,
            profile: None,
            env: None,
            output_dir: None,
            renderer: None,
            loader: Arc::new(FsSourceLoader),
            validators: Vec::new(),
            notifier: Arc::new(NoopNotifier),
            token: CancellationToken::new(),
        }
    }

    pub fn jobs(mut self, jobs: usize) -> Self {
        self.jobs = Some(jobs);
        self
    }

    pub fn profile(mut self, profile: impl Into<String>) -> Self {
        self.profile = Some(profile.into());
        self
    }

    /// Uses these variables instead of the process environment for `RHIZOME_*`
    /// overrides.
    pub fn env_overrides(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = Some(env);
        self
    }

    pub fn output_dir(mut self, output_dir: impl AsRef<Path>) -> Self {
        self.output_dir = Some(output_dir.as_ref().to_path_buf());
        self
    }

    pub fn renderer(mut self, renderer: Arc<dyn Renderer>) -> Self {
        self.renderer = Some(renderer);
        self
    }

    pub fn loader(mut self, loader: Arc<dyn SourceLoader>) -> Self {
        self.loader = loader;
        self
    }

    pub fn validator(mut self, validator: Arc<dyn Validator>) -> Self {
        self.validators.push(validator);
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn ChangeNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn cancellation_token(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    pub fn build(&self, force_full: bool) -> Result<BuildResult> {
        let started = Instant::now();

        let mut loader = ConfigLoader::new(&self.root).profile(self.profile.clone());
        if let Some(env) = &self.env {
            loader = loader.env(env.clone());
        }
        let resolved = loader.load()?;
        let config = &resolved.site;
        let config_hash = ChangeDetector::config_hash(&resolved.effective);
        let output_dir = self
            .output_dir
            .clone()
            .unwrap_or_else(|| self.root.join(&config.output_dir));
        let writer = OutputWriter::new(&output_dir);

        let persistor = Persistor::new(self.root.join(&config.cache_dir));
        let (mut snapshot, corruption) = persistor.load();
        let cache_recovered = corruption.is_some();
        let previous_generation = snapshot.generation;
        let previous_units = std::mem::take(&mut snapshot.units);
        let config_changed = snapshot.config_hash.as_ref() != Some(&config_hash);
        if config_changed {
            if snapshot.config_hash.is_some() {
                info!("configuration changed, discarding cache");
            }
            snapshot = CacheRecord::default();
        } else {
            snapshot.units = previous_units.clone();
        }
        let snapshot = snapshot;

        let discovered = discover(&self.root, config)?;
        let sources = template_sources(&discovered.templates)?;
        let data = load_data(&discovered.data)?;

        let mut detector = ChangeDetector::new(&snapshot);
        let unit_files: Vec<(NodeId, PathBuf)> = discovered
            .units
            .iter()
            .map(|unit| (NodeId::Unit(unit.id.clone()), unit.source.clone()))
            .collect();
        detector.observe_files(&unit_files);
        let data_files: Vec<(NodeId, PathBuf)> = discovered
            .data
            .iter()
            .map(|(name, path)| (NodeId::Data(name.clone()), path.clone()))
            .collect();
        detector.observe_files(&data_files);
        for (name, source) in &sources {
            detector.observe_hash(
                NodeId::Template(name.clone()),
                ChangeDetector::hash(source.as_bytes()),
            );
        }
        let mut data_removed = false;
        for node in snapshot.entries.keys() {
            let removed = match node {
                NodeId::Data(name) => !discovered.data.contains_key(name),
                NodeId::Template(name) => !sources.contains_key(name),
                NodeId::Unit(_) | NodeId::Cascade(_) => false,
            };
            if removed {
                debug!("{node} no longer exists");
                data_removed |= matches!(node, NodeId::Data(_));
                detector.force_changed(node.clone());
            }
        }
        // Every template reads the whole data tree.
        if data_removed {
            for name in sources.keys() {
                detector.force_changed(NodeId::Template(name.clone()));
            }
        }

        let mut errors = Vec::new();
        let mut failed: BTreeSet<UnitId> = BTreeSet::new();

        let prepared_results: Vec<(UnitId, Result<Prepared>)> = discovered
            .units
            .par_iter()
            .map(|unit| {
                let hash = detector.current(&NodeId::Unit(unit.id.clone())).cloned();
                (unit.id.clone(), self.prepare(unit, hash, &snapshot))
            })
            .collect();
        let mut prepared = Vec::new();
        for (id, result) in prepared_results {
            match result {
                Ok(unit) => prepared.push(unit),
                Err(error) => {
                    warn!("skipping {id}: {error}");
                    errors.push(UnitError::new(id.clone(), &error));
                    failed.insert(id);
                }
            }
        }

        let mut sections = SectionTree::new();
        for section in discovered.sections.iter() {
            sections.ensure_section(&section.id);
        }
        for item in &prepared {
            if item.unit.kind == UnitKind::SectionIndex {
                sections.set_cascade(&item.unit.section, item.frontmatter.cascade());
            }
        }
        for id in &failed {
            let Some(cached) = previous_units.get(id) else {
                continue;
            };
            if let Some(unit) = discovered.units.iter().find(|unit| &unit.id == id)
                && unit.kind == UnitKind::SectionIndex
            {
                sections.set_cascade(&unit.section, cached.frontmatter.cascade());
            }
        }

        let resolver = CascadeResolver::new(&sections);
        let mut entries = Vec::new();
        for item in prepared {
            let mut meta = UnitMeta {
                id: item.unit.id,
                kind: item.unit.kind,
                section: item.unit.section,
                source: Some(item.unit.source),
                frontmatter: item.frontmatter,
                effective: Frontmatter::default(),
                output_path: item.unit.output_path,
                url: item.unit.url,
                content_hash: item.hash,
            };
            resolver.apply(&mut meta);

            let draft = meta.effective.get_bool("draft").unwrap_or(false);
            if draft && !config.drafts {
                debug!("skipping draft {}", meta.id);
                continue;
            }

            entries.push(match item.body {
                Some(body) => ContentEntry::Full(ContentUnit { meta, body }),
                None => {
                    ContentEntry::Lazy(LazyContentProxy::new(meta, Arc::clone(&self.loader)))
                }
            });
        }

        let cascade_hashes: Vec<(SectionId, ContentHash)> = sections
            .iter()
            .map(|section| (section.id.clone(), resolver.cascade_hash(&section.id)))
            .collect();

        let mut graph = ContentGraph::new(sections);
        for entry in entries {
            graph.insert(entry);
        }
        for (section, hash) in cascade_hashes {
            detector.observe_hash(NodeId::Cascade(section), hash);
        }

        let effective: Vec<(&UnitId, &Frontmatter)> = graph
            .iter()
            .map(|(id, entry)| (id, entry.effective()))
            .collect();
        let generated = taxonomy_pages(&config.taxonomies, effective.iter().copied());
        let mut taxonomy_members: BTreeMap<UnitId, Vec<UnitId>> = BTreeMap::new();
        for page in generated {
            detector.observe_hash(
                NodeId::Unit(page.meta.id.clone()),
                page.meta.content_hash.clone(),
            );
            taxonomy_members.insert(page.meta.id.clone(), page.members);
            graph.insert(ContentEntry::Full(ContentUnit {
                meta: page.meta,
                body: String::new(),
            }));
        }

        check_unique_outputs(&graph)?;

        let tracker = build_tracker(&graph, &sources, &discovered.data);
        tracker.check_acyclic()?;
        debug!("dependency graph has {} edges", tracker.edge_count());

        let renderer: Arc<dyn Renderer> = match &self.renderer {
            Some(renderer) => Arc::clone(renderer),
            None => Arc::new(TeraRenderer::new(&sources)?),
        };

        let resolver = CascadeResolver::new(&graph.sections);
        let mut metadata_changed: BTreeSet<UnitId> = graph
            .unit_ids()
            .filter(|id| detector.is_changed(&NodeId::Unit((*id).clone())))
            .cloned()
            .collect();
        for section in graph.sections.iter() {
            if detector.is_changed(&NodeId::Cascade(section.id.clone())) {
                metadata_changed.extend(resolver.affected_by_cascade_change(&section.id));
            }
        }
        let removed: BTreeMap<UnitId, PathBuf> = previous_units
            .iter()
            .filter(|(id, _)| !graph.contains(id) && !failed.contains(*id))
            .map(|(id, cached)| (id.clone(), cached.output_path.clone()))
            .collect();
        for id in removed.keys() {
            if let Some(index) = surviving_index(&graph, id) {
                debug!("{id} was removed, relisting {index}");
                detector.force_changed(NodeId::Unit(index));
            }
        }
        let owners = listing_owners(&graph, &taxonomy_members);
        for id in &metadata_changed {
            for owner in owners.get(id).into_iter().flatten() {
                detector.force_changed(NodeId::Unit(owner.clone()));
            }
        }

        for (id, entry) in graph.iter() {
            if !writer.exists(entry.output_path()) {
                debug!("output of {id} is missing");
                detector.force_changed(NodeId::Unit(id.clone()));
            }
        }

        let detection = detector.detection(config_changed);
        let scheduler = BuildScheduler::new(self.jobs, self.token.clone());
        let work_set =
            scheduler.compute_work_set(&detection, &tracker, &resolver, &graph, force_full);
        info!(
            "{} of {} units need regeneration{}",
            work_set.len(),
            graph.len(),
            if config_changed || force_full {
                " (full rebuild)"
            } else {
                ""
            }
        );

        let plan = scheduler.plan(&work_set);
        let context = RenderContext {
            site: config,
            graph: &graph,
            data: &data,
            taxonomy_members: &taxonomy_members,
        };
        let outcomes = scheduler.execute(&plan, |id| {
            let entry = graph.get(id).ok_or_else(|| RhizomeError::Render {
                unit: id.clone(),
                message: "unit is not part of the content graph".to_string(),
            })?;
            let output = renderer.render(entry, &context)?;
            let status = writer.write(entry.output_path(), output.as_bytes())?;
            Ok((entry.output_path().to_path_buf(), status))
        })?;

        if self.token.is_cancelled() {
            warn!("build cancelled, cache left untouched");
            return Err(RhizomeError::Cancelled);
        }

        let mut events = Vec::new();
        let mut regenerated_count = 0;
        for (id, outcome) in outcomes {
            match outcome {
                UnitOutcome::Completed((path, status)) => {
                    regenerated_count += 1;
                    match status {
                        WriteStatus::Added => events.push(ChangeEvent {
                            kind: ChangeKind::Added,
                            path,
                        }),
                        WriteStatus::Modified => events.push(ChangeEvent {
                            kind: ChangeKind::Modified,
                            path,
                        }),
                        WriteStatus::Unchanged => {}
                    }
                }
                UnitOutcome::Failed(error) => {
                    warn!("failed to build {id}: {error}");
                    errors.push(UnitError::new(id.clone(), &error));
                    failed.insert(id);
                }
                UnitOutcome::Skipped => {}
            }
        }

        let live_outputs: BTreeSet<&Path> =
            graph.iter().map(|(_, entry)| entry.output_path()).collect();
        for (id, path) in &removed {
            if live_outputs.contains(path.as_path()) {
                continue;
            }
            match writer.remove(path) {
                Ok(true) => events.push(ChangeEvent {
                    kind: ChangeKind::Removed,
                    path: path.clone(),
                }),
                Ok(false) => {}
                Err(error) => errors.push(UnitError::new(id.clone(), &error)),
            }
        }

        let mut validators = self.validators.clone();
        if !config.validation.required_fields.is_empty() {
            validators.push(Arc::new(RequiredFields::new(
                config.validation.required_fields.clone(),
            )));
        }
        let validated_units: Vec<(&UnitId, &ContentEntry)> = graph
            .iter()
            .filter(|(id, _)| !failed.contains(*id))
            .collect();
        let validation = run_validators(&validators, &validated_units, &snapshot.validators);

        let generation = previous_generation + 1;
        let mut record = CacheRecord {
            generation,
            config_hash: Some(config_hash),
            validators: validation.outcomes,
            ..CacheRecord::default()
        };
        for (node, hash) in detector.observations() {
            let Some(hash) = hash else {
                continue;
            };
            if let NodeId::Unit(id) = node
                && (!graph.contains(id) || failed.contains(id))
            {
                continue;
            }
            let validated = snapshot
                .entries
                .get(node)
                .filter(|entry| entry.content_hash == *hash)
                .map(|entry| entry.validated)
                .unwrap_or(generation);
            record.entries.insert(
                node.clone(),
                CacheEntry {
                    content_hash: hash.clone(),
                    validated,
                },
            );
        }
        for (id, entry) in graph.iter() {
            if failed.contains(id) {
                continue;
            }
            record.units.insert(
                id.clone(),
                CachedMetadata {
                    frontmatter: entry.frontmatter().clone(),
                    output_path: entry.output_path().to_path_buf(),
                },
            );
        }
        for id in &failed {
            if let Some(cached) = previous_units.get(id) {
                record.units.insert(id.clone(), cached.clone());
            }
        }
        persistor.commit(&record)?;

        events.sort();
        self.notifier.notify(&events);
        errors.sort_by(|a, b| a.unit.cmp(&b.unit));

        let lazy_units = graph.lazy_count();
        let result = BuildResult {
            regenerated_count,
            skipped_count: graph.len().saturating_sub(work_set.len()),
            errors,
            warnings: validation.warnings,
            events,
            duration: started.elapsed(),
            work_set,
            full_rebuild: config_changed || force_full,
            cache_recovered,
            lazy_units,
        };
        info!(
            "built {} units, skipped {}, {} errors in {:?}",
            result.regenerated_count,
            result.skipped_count,
            result.errors.len(),
            result.duration
        );
        Ok(result)
    }

    /// Reuses cached metadata for units whose source hash is unchanged and
    /// parses everything else.
    fn prepare(
        &self,
        unit: &DiscoveredUnit,
        hash: Option<ContentHash>,
        snapshot: &CacheRecord,
    ) -> Result<Prepared> {
        let node = NodeId::Unit(unit.id.clone());
        if let Some(hash) = &hash
            && snapshot.is_fresh(&node, hash)
            && let Some(cached) = snapshot.units.get(&unit.id)
        {
            return Ok(Prepared {
                unit: unit.clone(),
                hash: hash.clone(),
                frontmatter: cached.frontmatter.clone(),
                body: None,
            });
        }

        let LoadedSource { frontmatter, body } =
            self.loader
                .load(&unit.source)
                .map_err(|error| RhizomeError::ContentParse {
                    unit: unit.id.clone(),
                    message: error.to_string(),
                })?;
        let hash = hash.ok_or_else(|| RhizomeError::ContentParse {
            unit: unit.id.clone(),
            message: "source could not be hashed".to_string(),
        })?;
        Ok(Prepared {
            unit: unit.clone(),
            hash,
            frontmatter,
            body: Some(body),
        })
    }
}

fn check_unique_outputs(graph: &ContentGraph) -> Result<()> {
    let mut outputs: BTreeMap<&Path, &UnitId> = BTreeMap::new();
    for (id, entry) in graph.iter() {
        if let Some(first) = outputs.insert(entry.output_path(), id) {
            return Err(RhizomeError::DuplicateOutput {
                path: entry.output_path().to_path_buf(),
                first: first.clone(),
                second: id.clone(),
            });
        }
    }
    Ok(())
}

/// Edges whose change alters a unit's rendered output: its template (and
/// everything that template pulls in) plus every enclosing cascade.
fn build_tracker(
    graph: &ContentGraph,
    sources: &BTreeMap<String, String>,
    data: &BTreeMap<String, PathBuf>,
) -> DependencyTracker {
    let mut tracker = DependencyTracker::new();

    for (id, entry) in graph.iter() {
        tracker.register(NodeId::Unit(id.clone()), NodeId::Template(entry.template()));
    }
    for (name, source) in sources {
        for dependency in template_dependencies(source) {
            tracker.register(
                NodeId::Template(name.clone()),
                NodeId::Template(dependency),
            );
        }
        for data_name in data.keys() {
            tracker.register(NodeId::Template(name.clone()), NodeId::Data(data_name.clone()));
        }
    }

    let resolver = CascadeResolver::new(&graph.sections);
    resolver.register_edges(&mut tracker, graph.iter().map(|(_, entry)| entry.meta()));
    tracker
}

/// Pages that list a unit's metadata: the index of its section (for a section
/// index, the parent section's index) and every taxonomy term it belongs to.
fn listing_owners(
    graph: &ContentGraph,
    taxonomy_members: &BTreeMap<UnitId, Vec<UnitId>>,
) -> BTreeMap<UnitId, BTreeSet<UnitId>> {
    let mut owners: BTreeMap<UnitId, BTreeSet<UnitId>> = BTreeMap::new();

    for (id, entry) in graph.iter() {
        let listing_section = match entry.kind() {
            UnitKind::Page => Some(entry.section().clone()),
            UnitKind::SectionIndex => graph
                .sections
                .get(entry.section())
                .and_then(|section| section.parent.clone()),
            UnitKind::TaxonomyList { .. } | UnitKind::TaxonomyTerm { .. } => None,
        };
        if let Some(index) = listing_section
            .and_then(|section| graph.sections.get(&section))
            .and_then(|section| section.index.clone())
            .filter(|index| index != id && graph.contains(index))
        {
            owners.entry(id.clone()).or_default().insert(index);
        }
    }

    for (term, members) in taxonomy_members {
        for member in members {
            owners.entry(member.clone()).or_default().insert(term.clone());
        }
    }

    owners
}

/// Index page of the nearest section that still exists above a removed unit.
fn surviving_index(graph: &ContentGraph, removed: &UnitId) -> Option<UnitId> {
    let path = removed.as_str();
    if path.starts_with("taxonomy/") {
        return None;
    }
    let (mut directory, filename) = path.rsplit_once('/').unwrap_or(("", path));
    if filename == SECTION_INDEX {
        if directory.is_empty() {
            return None;
        }
        directory = directory.rsplit_once('/').map(|(parent, _)| parent).unwrap_or("");
    }
    let section = graph.sections.nearest_existing(directory);
    graph
        .sections
        .get(&section)
        .and_then(|section| section.index.clone())
        .filter(|index| graph.contains(index))
}
