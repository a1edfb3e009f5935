use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::detector::ContentHash;
use crate::parsing::parse_date_from_filename;

const TOML_DATETIME_KEY: &str = "$__toml_private_datetime";

/// Stable logical identity of a content unit: the content-relative source path
/// for pages, `taxonomy/<name>[/<term>]` for generated pages.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnitId(String);

impl UnitId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(&self.0)
    }
}

/// Content-relative directory path of a section. The content root is the empty id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SectionId(String);

impl SectionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into().trim_matches('/').to_string())
    }

    pub fn root() -> Self {
        Self(String::new())
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }

    fn lexical_parent(&self) -> Option<SectionId> {
        if self.is_root() {
            return None;
        }
        match self.0.rfind('/') {
            Some(position) => Some(SectionId(self.0[..position].to_string())),
            None => Some(SectionId::root()),
        }
    }
}

impl fmt::Display for SectionId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            formatter.write_str("/")
        } else {
            formatter.write_str(&self.0)
        }
    }
}

/// A node of the dependency graph.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum NodeId {
    Unit(UnitId),
    Template(String),
    Data(String),
    Cascade(SectionId),
}

impl NodeId {
    pub fn as_unit(&self) -> Option<&UnitId> {
        match self {
            NodeId::Unit(id) => Some(id),
            _ => None,
        }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeId::Unit(id) => write!(formatter, "unit:{}", id.as_str()),
            NodeId::Template(name) => write!(formatter, "template:{name}"),
            NodeId::Data(name) => write!(formatter, "data:{name}"),
            NodeId::Cascade(section) => write!(formatter, "cascade:{}", section.as_str()),
        }
    }
}

impl FromStr for NodeId {
    type Err = String;

    fn from_str(input: &str) -> std::result::Result<Self, Self::Err> {
        let (prefix, rest) = input
            .split_once(':')
            .ok_or_else(|| format!("missing node prefix in '{input}'"))?;
        match prefix {
            "unit" => Ok(NodeId::Unit(UnitId::new(rest))),
            "template" => Ok(NodeId::Template(rest.to_string())),
            "data" => Ok(NodeId::Data(rest.to_string())),
            "cascade" => Ok(NodeId::Cascade(SectionId::new(rest))),
            other => Err(format!("unknown node prefix '{other}'")),
        }
    }
}

impl From<NodeId> for String {
    fn from(node: NodeId) -> Self {
        node.to_string()
    }
}

impl TryFrom<String> for NodeId {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

/// `(artifact -> source)`: the artifact's output depends on the source.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DependencyEdge {
    pub artifact: NodeId,
    pub source: NodeId,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Frontmatter {
    #[serde(flatten)]
    pub raw: BTreeMap<String, Value>,
}

impl Frontmatter {
    pub fn get<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.raw
            .get(key)
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }

    pub fn get_string(&self, key: &str) -> Option<String> {
        self.raw
            .get(key)
            .and_then(|value| value.as_str().map(String::from))
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.raw.get(key).and_then(|value| value.as_bool())
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.raw.get(key).and_then(|value| value.as_i64())
    }

    pub fn get_array(&self, key: &str) -> Option<Vec<String>> {
        self.raw.get(key).and_then(|value| {
            value.as_array().map(|items| {
                items
                    .iter()
                    .filter_map(|item| item.as_str().map(String::from))
                    .collect()
            })
        })
    }

    /// Accepts `YYYY-MM-DD`, RFC 3339 strings and TOML date literals.
    pub fn get_date(&self, key: &str) -> Option<NaiveDate> {
        let value = self.raw.get(key)?;
        let text = match value {
            Value::String(text) => text.as_str(),
            Value::Object(map) => map.get(TOML_DATETIME_KEY)?.as_str()?,
            _ => return None,
        };
        let date_part = text.get(..10).unwrap_or(text);
        NaiveDate::parse_from_str(date_part, "%Y-%m-%d").ok()
    }

    /// The `cascade` table declared in this frontmatter, if any.
    pub fn cascade(&self) -> Frontmatter {
        match self.raw.get("cascade") {
            Some(Value::Object(map)) => Frontmatter {
                raw: map
                    .iter()
                    .map(|(key, value)| (key.clone(), value.clone()))
                    .collect(),
            },
            _ => Frontmatter::default(),
        }
    }

    /// Returns `self` layered over `base`: keys present in `self` win.
    pub fn merged_over(&self, base: &Frontmatter) -> Frontmatter {
        let mut raw = base.raw.clone();
        for (key, value) in &self.raw {
            raw.insert(key.clone(), value.clone());
        }
        Frontmatter { raw }
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UnitKind {
    Page,
    SectionIndex,
    TaxonomyList { taxonomy: String },
    TaxonomyTerm { taxonomy: String, term: String },
}

impl UnitKind {
    pub fn default_template(&self) -> &'static str {
        match self {
            UnitKind::Page => "page.html",
            UnitKind::SectionIndex => "section.html",
            UnitKind::TaxonomyList { .. } => "taxonomy.html",
            UnitKind::TaxonomyTerm { .. } => "taxonomy_term.html",
        }
    }

    pub fn is_generated(&self) -> bool {
        matches!(
            self,
            UnitKind::TaxonomyList { .. } | UnitKind::TaxonomyTerm { .. }
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaterializationState {
    Unloaded,
    Loaded,
}

/// Everything about a unit that is known without reading its body.
#[derive(Debug, Clone, PartialEq)]
pub struct UnitMeta {
    pub id: UnitId,
    pub kind: UnitKind,
    pub section: SectionId,
    pub source: Option<PathBuf>,
    pub frontmatter: Frontmatter,
    pub effective: Frontmatter,
    pub output_path: PathBuf,
    pub url: String,
    pub content_hash: ContentHash,
}

impl UnitMeta {
    pub fn slug(&self) -> String {
        match &self.kind {
            UnitKind::Page => {
                let file = self.id.as_str().rsplit('/').next().unwrap_or("");
                file.strip_suffix(".md").unwrap_or(file).to_string()
            }
            UnitKind::SectionIndex => {
                if self.section.is_root() {
                    "index".to_string()
                } else {
                    self.section.name().to_string()
                }
            }
            UnitKind::TaxonomyList { taxonomy } => taxonomy.clone(),
            UnitKind::TaxonomyTerm { term, .. } => term.clone(),
        }
    }

    pub fn template(&self) -> String {
        self.effective
            .get_string("template")
            .unwrap_or_else(|| self.kind.default_template().to_string())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Section {
    pub id: SectionId,
    pub parent: Option<SectionId>,
    pub children: BTreeSet<SectionId>,
    pub units: BTreeSet<UnitId>,
    pub index: Option<UnitId>,
    pub cascade: Frontmatter,
}

impl Section {
    fn new(id: SectionId, parent: Option<SectionId>) -> Self {
        Self {
            id,
            parent,
            children: BTreeSet::new(),
            units: BTreeSet::new(),
            index: None,
            cascade: Frontmatter::default(),
        }
    }
}

/// Registry of sections keyed by id. Parent/child links are ids, never pointers.
#[derive(Debug, Clone, PartialEq)]
pub struct SectionTree {
    sections: BTreeMap<SectionId, Section>,
}

impl Default for SectionTree {
    fn default() -> Self {
        Self::new()
    }
}

impl SectionTree {
    pub fn new() -> Self {
        let mut sections = BTreeMap::new();
        sections.insert(SectionId::root(), Section::new(SectionId::root(), None));
        Self { sections }
    }

    pub fn ensure_section(&mut self, id: &SectionId) {
        if self.sections.contains_key(id) {
            return;
        }
        let parent = id.lexical_parent().unwrap_or_else(SectionId::root);
        self.ensure_section(&parent);
        if let Some(parent_section) = self.sections.get_mut(&parent) {
            parent_section.children.insert(id.clone());
        }
        self.sections
            .insert(id.clone(), Section::new(id.clone(), Some(parent)));
    }

    pub fn add_unit(&mut self, section: &SectionId, unit: UnitId, is_index: bool) {
        self.ensure_section(section);
        if let Some(entry) = self.sections.get_mut(section) {
            if is_index {
                entry.index = Some(unit.clone());
            }
            entry.units.insert(unit);
        }
    }

    pub fn set_cascade(&mut self, section: &SectionId, cascade: Frontmatter) {
        self.ensure_section(section);
        if let Some(entry) = self.sections.get_mut(section) {
            entry.cascade = cascade;
        }
    }

    pub fn get(&self, id: &SectionId) -> Option<&Section> {
        self.sections.get(id)
    }

    pub fn contains(&self, id: &SectionId) -> bool {
        self.sections.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Section> {
        self.sections.values()
    }

    pub fn len(&self) -> usize {
        self.sections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }

    /// The section itself followed by its ancestors, nearest first.
    pub fn ancestors_inclusive(&self, id: &SectionId) -> Vec<SectionId> {
        let mut chain = Vec::new();
        let mut current = self.sections.get(id).map(|section| section.id.clone());
        while let Some(section_id) = current {
            current = self
                .sections
                .get(&section_id)
                .and_then(|section| section.parent.clone());
            chain.push(section_id);
        }
        chain
    }

    /// The section and every section nested below it.
    pub fn subtree(&self, id: &SectionId) -> Vec<SectionId> {
        let mut result = Vec::new();
        let mut pending = vec![id.clone()];
        while let Some(section_id) = pending.pop() {
            if let Some(section) = self.sections.get(&section_id) {
                pending.extend(section.children.iter().rev().cloned());
                result.push(section_id);
            }
        }
        result
    }

    /// Nearest registered section for a content-relative directory path.
    pub fn nearest_existing(&self, path: &str) -> SectionId {
        let mut candidate = SectionId::new(path);
        loop {
            if self.sections.contains_key(&candidate) {
                return candidate;
            }
            match candidate.lexical_parent() {
                Some(parent) => candidate = parent,
                None => return SectionId::root(),
            }
        }
    }
}

/// Date from `date` frontmatter, falling back to a `YYYY-MM-DD-` filename prefix.
pub fn unit_date(meta: &UnitMeta) -> Option<NaiveDate> {
    meta.effective.get_date("date").or_else(|| {
        let file = meta.id.as_str().rsplit('/').next()?;
        let (date, _) = parse_date_from_filename(file)?;
        NaiveDate::parse_from_str(&date, "%Y-%m-%d").ok()
    })
}
