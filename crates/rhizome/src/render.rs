use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::error::Error as _;
use std::fs;
use std::path::PathBuf;
use tera::{Context, Tera};

use crate::config::SiteConfig;
use crate::error::{IoContext, Result, RhizomeError};
use crate::graph::{ContentAccess, ContentEntry, ContentGraph};
use crate::types::{UnitId, UnitKind};

const DEFAULT_BASE_TEMPLATE: &str = include_str!("../templates/base.html");
const DEFAULT_PAGE_TEMPLATE: &str = include_str!("../templates/page.html");
const DEFAULT_SECTION_TEMPLATE: &str = include_str!("../templates/section.html");
const DEFAULT_TAXONOMY_TEMPLATE: &str = include_str!("../templates/taxonomy.html");
const DEFAULT_TAXONOMY_TERM_TEMPLATE: &str = include_str!("../templates/taxonomy_term.html");

pub const BUILTIN_TEMPLATES: [(&str, &str); 5] = [
    ("base.html", DEFAULT_BASE_TEMPLATE),
    ("page.html", DEFAULT_PAGE_TEMPLATE),
    ("section.html", DEFAULT_SECTION_TEMPLATE),
    ("taxonomy.html", DEFAULT_TAXONOMY_TEMPLATE),
    ("taxonomy_term.html", DEFAULT_TAXONOMY_TERM_TEMPLATE),
];

/// Site templates by name, with the built-in defaults filling any gaps.
pub fn template_sources(files: &BTreeMap<String, PathBuf>) -> Result<BTreeMap<String, String>> {
    let mut sources = BTreeMap::new();
    for (name, path) in files {
        let source = fs::read_to_string(path).io_context("reading template", path)?;
        sources.insert(name.clone(), source);
    }
    for (name, source) in BUILTIN_TEMPLATES {
        sources
            .entry(name.to_string())
            .or_insert_with(|| source.to_string());
    }
    Ok(sources)
}

/// Everything a render may read besides the unit itself. Shared read-only by
/// all workers.
pub struct RenderContext<'a> {
    pub site: &'a SiteConfig,
    pub graph: &'a ContentGraph,
    pub data: &'a Value,
    pub taxonomy_members: &'a BTreeMap<UnitId, Vec<UnitId>>,
}

/// Turns one unit into its output document. Must not depend on anything
/// outside its arguments.
pub trait Renderer: Send + Sync {
    fn render(&self, unit: &ContentEntry, context: &RenderContext<'_>) -> Result<String>;
}

pub struct TeraRenderer {
    tera: Tera,
}

impl TeraRenderer {
    pub fn new(sources: &BTreeMap<String, String>) -> Result<Self> {
        let mut tera = Tera::default();
        tera.add_raw_templates(
            sources
                .iter()
                .map(|(name, source)| (name.as_str(), source.as_str())),
        )?;
        Ok(Self { tera })
    }

    pub fn builtin() -> Result<Self> {
        Self::new(&template_sources(&BTreeMap::new())?)
    }
}

impl Renderer for TeraRenderer {
    fn render(&self, unit: &ContentEntry, context: &RenderContext<'_>) -> Result<String> {
        let render_error = |message: String| RhizomeError::Render {
            unit: unit.id().clone(),
            message,
        };

        let mut tera_context = Context::new();
        tera_context.insert("site", &site_value(context.site));
        tera_context.insert("page", &page_value(unit)?);
        tera_context.insert("data", context.data);

        match unit.kind() {
            UnitKind::SectionIndex => {
                let pages: Vec<Value> = context
                    .graph
                    .section_pages(unit.section())
                    .into_iter()
                    .map(listing_value)
                    .collect();
                let subsections: Vec<Value> = context
                    .graph
                    .subsection_indexes(unit.section())
                    .into_iter()
                    .map(listing_value)
                    .collect();
                tera_context.insert(
                    "section",
                    &json!({ "pages": pages, "subsections": subsections }),
                );
            }
            UnitKind::TaxonomyTerm { taxonomy, term } => {
                let mut members: Vec<&ContentEntry> = context
                    .taxonomy_members
                    .get(unit.id())
                    .into_iter()
                    .flatten()
                    .filter_map(|id| context.graph.get(id))
                    .collect();
                crate::graph::sort_entries(&mut members);
                let pages: Vec<Value> = members.into_iter().map(listing_value).collect();
                tera_context.insert(
                    "taxonomy",
                    &json!({ "name": taxonomy, "term": term, "pages": pages }),
                );
            }
            UnitKind::Page | UnitKind::TaxonomyList { .. } => {}
        }

        self.tera
            .render(&unit.template(), &tera_context)
            .map_err(|error| render_error(error_chain(&error)))
    }
}

/// Tera nests the useful message a few sources deep.
fn error_chain(error: &tera::Error) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

fn site_value(config: &SiteConfig) -> Value {
    json!({
        "title": config.title,
        "base_url": config.base_url,
        "description": config.description.clone().unwrap_or_default(),
        "language": config.language.clone().unwrap_or_else(|| "en".to_string()),
        "extra": config.extra,
    })
}

fn date_string(entry: &ContentEntry) -> String {
    entry
        .date()
        .map(|date| date.format("%Y-%m-%d").to_string())
        .unwrap_or_default()
}

/// Metadata-only view of another unit, as used in listings. Never reads a body.
pub fn listing_value(entry: &ContentEntry) -> Value {
    json!({
        "id": entry.id().as_str(),
        "title": entry.title(),
        "slug": entry.slug(),
        "url": entry.url(),
        "date": date_string(entry),
        "tags": entry.tags(),
        "weight": entry.weight(),
        "frontmatter": entry.effective().raw,
    })
}

fn page_value(entry: &ContentEntry) -> Result<Value> {
    Ok(json!({
        "id": entry.id().as_str(),
        "title": entry.title(),
        "slug": entry.slug(),
        "url": entry.url(),
        "date": date_string(entry),
        "tags": entry.tags(),
        "draft": entry.draft(),
        "weight": entry.weight(),
        "section": entry.section().as_str(),
        "frontmatter": entry.effective().raw,
        "content": entry.html()?,
        "summary": entry.summary()?.unwrap_or_default(),
        "word_count": entry.word_count()?,
        "reading_time": entry.reading_time()?,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::ContentHash;
    use crate::graph::ContentUnit;
    use crate::proxy::{FsSourceLoader, LazyContentProxy};
    use crate::types::{Frontmatter, MaterializationState, SectionId, UnitMeta};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn config() -> SiteConfig {
        toml::from_str("title = \"Test Site\"\nbase_url = \"https://example.com\"\n").unwrap()
    }

    fn meta(id: &str, kind: UnitKind, section: &str, frontmatter: Value) -> UnitMeta {
        let frontmatter: Frontmatter = serde_json::from_value(frontmatter).unwrap();
        UnitMeta {
            id: UnitId::new(id),
            kind,
            section: SectionId::new(section),
            source: None,
            effective: frontmatter.clone(),
            frontmatter,
            output_path: PathBuf::from(id),
            url: format!("/{id}/"),
            content_hash: ContentHash::from_bytes(id.as_bytes()),
        }
    }

    fn render(renderer: &TeraRenderer, graph: &ContentGraph, id: &str) -> Result<String> {
        let config = config();
        let data = json!({});
        let members = BTreeMap::new();
        let context = RenderContext {
            site: &config,
            graph,
            data: &data,
            taxonomy_members: &members,
        };
        renderer.render(graph.get(&UnitId::new(id)).unwrap(), &context)
    }

    #[test]
    fn test_render_page_with_builtin_templates() {
        let mut graph = ContentGraph::default();
        graph.insert(ContentEntry::Full(ContentUnit {
            meta: meta("hello.md", UnitKind::Page, "", json!({"title": "Hello"})),
            body: "Some **markdown**.".to_string(),
        }));

        let html = render(&TeraRenderer::builtin().unwrap(), &graph, "hello.md").unwrap();
        assert!(html.contains("<h1>Hello</h1>"));
        assert!(html.contains("<strong>markdown</strong>"));
        assert!(html.contains("Test Site"));
    }

    #[test]
    fn test_section_listing_does_not_materialize_proxies() {
        let dir = TempDir::new().unwrap();
        let mut graph = ContentGraph::default();
        graph.insert(ContentEntry::Full(ContentUnit {
            meta: meta(
                "docs/_index.md",
                UnitKind::SectionIndex,
                "docs",
                json!({"title": "Docs"}),
            ),
            body: String::new(),
        }));
        let mut lazy_meta = meta("docs/intro.md", UnitKind::Page, "docs", json!({"title": "Intro"}));
        lazy_meta.source = Some(dir.path().join("does-not-exist.md"));
        graph.insert(ContentEntry::Lazy(LazyContentProxy::new(
            lazy_meta,
            Arc::new(FsSourceLoader),
        )));

        let html = render(&TeraRenderer::builtin().unwrap(), &graph, "docs/_index.md").unwrap();
        assert!(html.contains(">Intro</a>"));
        let proxy = graph.get(&UnitId::new("docs/intro.md")).unwrap();
        assert_eq!(proxy.state(), MaterializationState::Unloaded);
    }

    #[test]
    fn test_site_template_overrides_builtin() {
        let mut files = BTreeMap::new();
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("page.html");
        fs::write(&path, "custom:{{ page.title }}").unwrap();
        files.insert("page.html".to_string(), path);

        let sources = template_sources(&files).unwrap();
        assert_eq!(sources["page.html"], "custom:{{ page.title }}");
        assert!(sources.contains_key("section.html"));

        let mut graph = ContentGraph::default();
        graph.insert(ContentEntry::Full(ContentUnit {
            meta: meta("a.md", UnitKind::Page, "", json!({"title": "A"})),
            body: String::new(),
        }));
        let html = render(&TeraRenderer::new(&sources).unwrap(), &graph, "a.md").unwrap();
        assert_eq!(html, "custom:A");
    }

    #[test]
    fn test_missing_template_is_render_error() {
        let mut graph = ContentGraph::default();
        graph.insert(ContentEntry::Full(ContentUnit {
            meta: meta("a.md", UnitKind::Page, "", json!({"template": "nope.html"})),
            body: String::new(),
        }));
        let error = render(&TeraRenderer::builtin().unwrap(), &graph, "a.md").unwrap_err();
        assert!(matches!(error, RhizomeError::Render { .. }));
        assert!(!error.is_fatal());
    }
}
