use chrono::NaiveDate;
use std::collections::BTreeMap;
use std::path::Path;

use crate::detector::ContentHash;
use crate::error::Result;
use crate::parsing::{extract_excerpt, parse_markdown, word_count};
use crate::proxy::LazyContentProxy;
use crate::types::{
    Frontmatter, MaterializationState, SectionId, SectionTree, UnitId, UnitKind, UnitMeta,
    unit_date,
};

const WORDS_PER_MINUTE: usize = 200;
const SUMMARY_CHARS: usize = 160;

/// Read contract shared by fully loaded units and lazy proxies. Everything a
/// template, listing or validator reads goes through here.
pub trait ContentAccess {
    fn meta(&self) -> &UnitMeta;

    /// Raw markdown body. Materializes a proxy.
    fn body(&self) -> Result<&str>;

    fn state(&self) -> MaterializationState;

    fn id(&self) -> &UnitId {
        &self.meta().id
    }

    fn kind(&self) -> &UnitKind {
        &self.meta().kind
    }

    fn section(&self) -> &SectionId {
        &self.meta().section
    }

    fn url(&self) -> &str {
        &self.meta().url
    }

    fn output_path(&self) -> &Path {
        &self.meta().output_path
    }

    fn frontmatter(&self) -> &Frontmatter {
        &self.meta().frontmatter
    }

    fn effective(&self) -> &Frontmatter {
        &self.meta().effective
    }

    fn content_hash(&self) -> &ContentHash {
        &self.meta().content_hash
    }

    fn slug(&self) -> String {
        self.meta().slug()
    }

    fn template(&self) -> String {
        self.meta().template()
    }

    fn title(&self) -> String {
        self.effective()
            .get_string("title")
            .unwrap_or_else(|| self.slug())
    }

    fn date(&self) -> Option<NaiveDate> {
        unit_date(self.meta())
    }

    fn terms(&self, taxonomy: &str) -> Vec<String> {
        self.effective().get_array(taxonomy).unwrap_or_default()
    }

    fn tags(&self) -> Vec<String> {
        self.terms("tags")
    }

    fn draft(&self) -> bool {
        self.effective().get_bool("draft").unwrap_or(false)
    }

    fn weight(&self) -> i64 {
        self.effective().get_i64("weight").unwrap_or(0)
    }

    fn html(&self) -> Result<String> {
        Ok(parse_markdown(self.body()?))
    }

    /// `description` when set, otherwise the first paragraph of the body.
    fn summary(&self) -> Result<Option<String>> {
        match self.effective().get_string("description") {
            Some(description) => Ok(Some(description)),
            None => Ok(extract_excerpt(self.body()?, SUMMARY_CHARS)),
        }
    }

    fn word_count(&self) -> Result<usize> {
        Ok(word_count(self.body()?))
    }

    fn reading_time(&self) -> Result<usize> {
        let words = self.word_count()?;
        Ok(words.div_ceil(WORDS_PER_MINUTE).max(1))
    }
}

/// A unit whose source was parsed during this build.
#[derive(Debug, Clone, PartialEq)]
pub struct ContentUnit {
    pub meta: UnitMeta,
    pub body: String,
}

impl ContentAccess for ContentUnit {
    fn meta(&self) -> &UnitMeta {
        &self.meta
    }

    fn body(&self) -> Result<&str> {
        Ok(&self.body)
    }

    fn state(&self) -> MaterializationState {
        MaterializationState::Loaded
    }
}

impl ContentAccess for LazyContentProxy {
    fn meta(&self) -> &UnitMeta {
        LazyContentProxy::meta(self)
    }

    fn body(&self) -> Result<&str> {
        Ok(&self.ensure_loaded()?.body)
    }

    fn state(&self) -> MaterializationState {
        LazyContentProxy::state(self)
    }
}

#[derive(Debug)]
pub enum ContentEntry {
    Full(ContentUnit),
    Lazy(LazyContentProxy),
}

impl ContentAccess for ContentEntry {
    fn meta(&self) -> &UnitMeta {
        match self {
            ContentEntry::Full(unit) => unit.meta(),
            ContentEntry::Lazy(proxy) => ContentAccess::meta(proxy),
        }
    }

    fn body(&self) -> Result<&str> {
        match self {
            ContentEntry::Full(unit) => unit.body(),
            ContentEntry::Lazy(proxy) => ContentAccess::body(proxy),
        }
    }

    fn state(&self) -> MaterializationState {
        match self {
            ContentEntry::Full(unit) => unit.state(),
            ContentEntry::Lazy(proxy) => ContentAccess::state(proxy),
        }
    }
}

/// Sections and units of one build. Built single-threaded, then shared
/// read-only with the render workers.
#[derive(Debug, Default)]
pub struct ContentGraph {
    pub sections: SectionTree,
    entries: BTreeMap<UnitId, ContentEntry>,
}

impl ContentGraph {
    pub fn new(sections: SectionTree) -> Self {
        Self {
            sections,
            entries: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, entry: ContentEntry) {
        let meta = entry.meta();
        let (section, id) = (meta.section.clone(), meta.id.clone());
        let is_index = meta.kind == UnitKind::SectionIndex;
        if !meta.kind.is_generated() {
            self.sections.add_unit(&section, id.clone(), is_index);
        }
        self.entries.insert(id, entry);
    }

    pub fn get(&self, id: &UnitId) -> Option<&ContentEntry> {
        self.entries.get(id)
    }

    pub fn contains(&self, id: &UnitId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&UnitId, &ContentEntry)> {
        self.entries.iter()
    }

    pub fn unit_ids(&self) -> impl Iterator<Item = &UnitId> {
        self.entries.keys()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Units whose source has not been read in this build.
    pub fn lazy_count(&self) -> usize {
        self.entries
            .values()
            .filter(|entry| entry.state() == MaterializationState::Unloaded)
            .count()
    }

    /// Units directly inside a section (excluding its index), ordered by
    /// weight, then date descending, then id.
    pub fn section_pages(&self, section: &SectionId) -> Vec<&ContentEntry> {
        let Some(section) = self.sections.get(section) else {
            return Vec::new();
        };
        let mut pages: Vec<&ContentEntry> = section
            .units
            .iter()
            .filter(|id| section.index.as_ref() != Some(*id))
            .filter_map(|id| self.entries.get(id))
            .collect();
        sort_entries(&mut pages);
        pages
    }

    /// Index units of the direct subsections.
    pub fn subsection_indexes(&self, section: &SectionId) -> Vec<&ContentEntry> {
        let Some(section) = self.sections.get(section) else {
            return Vec::new();
        };
        section
            .children
            .iter()
            .filter_map(|child| self.sections.get(child))
            .filter_map(|child| child.index.as_ref())
            .filter_map(|id| self.entries.get(id))
            .collect()
    }
}

pub fn sort_entries(entries: &mut [&ContentEntry]) {
    entries.sort_by(|a, b| {
        a.weight()
            .cmp(&b.weight())
            .then_with(|| b.date().cmp(&a.date()))
            .then_with(|| a.id().cmp(b.id()))
    });
}
