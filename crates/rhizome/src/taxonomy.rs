use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::detector::ContentHash;
use crate::types::{Frontmatter, SectionId, UnitId, UnitKind, UnitMeta};

/// A generated page plus the units it lists.
#[derive(Debug, Clone, PartialEq)]
pub struct TaxonomyPage {
    pub meta: UnitMeta,
    pub members: Vec<UnitId>,
}

#[derive(Debug, Default)]
struct Term {
    name: String,
    members: Vec<UnitId>,
}

pub fn slugify(input: &str) -> String {
    let mut slug = String::new();
    for character in input.trim().chars() {
        if character.is_alphanumeric() {
            slug.extend(character.to_lowercase());
        } else if !slug.is_empty() && !slug.ends_with('-') {
            slug.push('-');
        }
    }
    slug.trim_end_matches('-').to_string()
}

/// Builds list and term pages for each taxonomy from `(unit, effective metadata)`
/// pairs. Input order does not matter; output is sorted by id.
pub fn taxonomy_pages<'a>(
    taxonomies: &[String],
    units: impl IntoIterator<Item = (&'a UnitId, &'a Frontmatter)> + Clone,
) -> Vec<TaxonomyPage> {
    let mut pages = Vec::new();

    for taxonomy in taxonomies {
        let mut terms: BTreeMap<String, Term> = BTreeMap::new();
        let mut sorted: Vec<(&UnitId, &Frontmatter)> = units.clone().into_iter().collect();
        sorted.sort_by(|a, b| a.0.cmp(b.0));

        for (id, effective) in sorted {
            for name in effective.get_array(taxonomy).unwrap_or_default() {
                let slug = slugify(&name);
                if slug.is_empty() {
                    continue;
                }
                let term = terms.entry(slug).or_insert_with(|| Term {
                    name: name.clone(),
                    members: Vec::new(),
                });
                if !term.members.contains(id) {
                    term.members.push(id.clone());
                }
            }
        }

        if terms.is_empty() {
            continue;
        }

        let listing: Vec<String> = terms
            .iter()
            .map(|(slug, term)| format!("{slug}={}={}", term.members.len(), term.name))
            .collect();
        let list_frontmatter = frontmatter(json!({
            "title": taxonomy,
            "terms": terms
                .iter()
                .map(|(slug, term)| json!({"name": term.name, "slug": slug, "count": term.members.len()}))
                .collect::<Vec<_>>(),
        }));
        pages.push(TaxonomyPage {
            meta: generated_meta(
                UnitId::new(format!("taxonomy/{taxonomy}")),
                UnitKind::TaxonomyList {
                    taxonomy: taxonomy.clone(),
                },
                PathBuf::from(taxonomy),
                list_frontmatter,
                ContentHash::from_parts(
                    std::iter::once(taxonomy.as_str()).chain(listing.iter().map(String::as_str)),
                ),
            ),
            members: Vec::new(),
        });

        for (slug, term) in terms {
            let member_ids: Vec<&str> = term.members.iter().map(UnitId::as_str).collect();
            let hash = ContentHash::from_parts(
                [taxonomy.as_str(), term.name.as_str()]
                    .into_iter()
                    .chain(member_ids.iter().copied()),
            );
            pages.push(TaxonomyPage {
                meta: generated_meta(
                    UnitId::new(format!("taxonomy/{taxonomy}/{slug}")),
                    UnitKind::TaxonomyTerm {
                        taxonomy: taxonomy.clone(),
                        term: slug.clone(),
                    },
                    PathBuf::from(taxonomy).join(&slug),
                    frontmatter(json!({"title": term.name, "taxonomy": taxonomy})),
                    hash,
                ),
                members: term.members,
            });
        }
    }

    pages.sort_by(|a, b| a.meta.id.cmp(&b.meta.id));
    pages
}

fn frontmatter(value: Value) -> Frontmatter {
    match value {
        Value::Object(map) => Frontmatter {
            raw: map.into_iter().collect(),
        },
        _ => Frontmatter::default(),
    }
}

fn generated_meta(
    id: UnitId,
    kind: UnitKind,
    directory: PathBuf,
    frontmatter: Frontmatter,
    content_hash: ContentHash,
) -> UnitMeta {
    let logical = directory
        .iter()
        .map(|segment| segment.to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");
    UnitMeta {
        id,
        kind,
        section: SectionId::root(),
        source: None,
        effective: frontmatter.clone(),
        frontmatter,
        output_path: directory.join("index.html"),
        url: format!("/{logical}/"),
        content_hash,
    }
}
