use serde_json::Value;
use std::collections::BTreeSet;

use crate::dependency::DependencyTracker;
use crate::detector::{ChangeDetector, ContentHash};
use crate::types::{Frontmatter, NodeId, SectionId, SectionTree, UnitId, UnitKind, UnitMeta};

/// Merges section cascades into unit metadata. A section's cascade applies to
/// everything below it; its own index page inherits from the parent section.
pub struct CascadeResolver<'a> {
    tree: &'a SectionTree,
}

impl<'a> CascadeResolver<'a> {
    pub fn new(tree: &'a SectionTree) -> Self {
        Self { tree }
    }

    /// Sections whose cascade feeds this unit, nearest first.
    fn chain_for(&self, kind: &UnitKind, section: &SectionId) -> Vec<SectionId> {
        let mut chain = self.tree.ancestors_inclusive(section);
        if *kind == UnitKind::SectionIndex && !chain.is_empty() {
            chain.remove(0);
        }
        chain
    }

    pub fn inherited_for(&self, kind: &UnitKind, section: &SectionId) -> Frontmatter {
        self.chain_for(kind, section)
            .iter()
            .rev()
            .filter_map(|id| self.tree.get(id))
            .fold(Frontmatter::default(), |inherited, section| {
                section.cascade.merged_over(&inherited)
            })
    }

    /// Own frontmatter over the cascade chain; nearer sections beat farther ones.
    pub fn effective_for(&self, meta: &UnitMeta) -> Frontmatter {
        if meta.kind.is_generated() {
            return meta.frontmatter.clone();
        }
        let inherited = self.inherited_for(&meta.kind, &meta.section);
        meta.frontmatter.merged_over(&inherited)
    }

    pub fn apply(&self, meta: &mut UnitMeta) {
        meta.effective = self.effective_for(meta);
    }

    /// Digest of the section's own cascade map. An empty or removed cascade has
    /// a hash too, so removing a key reads as a change.
    pub fn cascade_hash(&self, section: &SectionId) -> ContentHash {
        let cascade = self
            .tree
            .get(section)
            .map(|section| section.cascade.clone())
            .unwrap_or_default();
        let value = Value::Object(cascade.raw.into_iter().collect());
        ChangeDetector::config_hash(&value)
    }

    /// Every unit in the section's subtree, nested subsections included.
    pub fn affected_by_cascade_change(&self, section: &SectionId) -> BTreeSet<UnitId> {
        self.tree
            .subtree(section)
            .iter()
            .filter_map(|id| self.tree.get(id))
            .flat_map(|section| section.units.iter().cloned())
            .collect()
    }

    /// Registers `unit -> cascade:<section>` for the unit's section and all of
    /// its ancestors.
    pub fn register_edges<'m>(
        &self,
        tracker: &mut DependencyTracker,
        units: impl IntoIterator<Item = &'m UnitMeta>,
    ) {
        for meta in units {
            if meta.kind.is_generated() {
                continue;
            }
            for section in self.tree.ancestors_inclusive(&meta.section) {
                tracker.register(NodeId::Unit(meta.id.clone()), NodeId::Cascade(section));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::path::PathBuf;

    fn frontmatter(value: Value) -> Frontmatter {
        serde_json::from_value(value).unwrap()
    }

    fn meta(id: &str, kind: UnitKind, section: &str, own: Value) -> UnitMeta {
        UnitMeta {
            id: UnitId::new(id),
            kind,
            section: SectionId::new(section),
            source: None,
            frontmatter: frontmatter(own),
            effective: Frontmatter::default(),
            output_path: PathBuf::from(id),
            url: format!("/{id}/"),
            content_hash: ContentHash::from_bytes(id.as_bytes()),
        }
    }

    fn docs_tree() -> SectionTree {
        let mut tree = SectionTree::new();
        tree.set_cascade(
            &SectionId::root(),
            frontmatter(json!({"layout": "site", "type": "page"})),
        );
        tree.set_cascade(
            &SectionId::new("docs"),
            frontmatter(json!({"type": "docs", "sidebar": true})),
        );
        tree.set_cascade(
            &SectionId::new("docs/guides"),
            frontmatter(json!({"type": "guide"})),
        );
        tree.add_unit(&SectionId::new("docs"), UnitId::new("docs/_index.md"), true);
        tree.add_unit(&SectionId::new("docs"), UnitId::new("docs/intro.md"), false);
        tree.add_unit(
            &SectionId::new("docs/guides"),
            UnitId::new("docs/guides/setup.md"),
            false,
        );
        tree.add_unit(&SectionId::new("blog"), UnitId::new("blog/post.md"), false);
        tree
    }

    #[test]
    fn test_nearest_section_wins() {
        let tree = docs_tree();
        let resolver = CascadeResolver::new(&tree);
        let mut setup = meta("docs/guides/setup.md", UnitKind::Page, "docs/guides", json!({}));
        resolver.apply(&mut setup);

        assert_eq!(setup.effective.get_string("type"), Some("guide".to_string()));
        assert_eq!(setup.effective.get_bool("sidebar"), Some(true));
        assert_eq!(setup.effective.get_string("layout"), Some("site".to_string()));
    }

    #[test]
    fn test_own_frontmatter_wins() {
        let tree = docs_tree();
        let resolver = CascadeResolver::new(&tree);
        let mut intro = meta("docs/intro.md", UnitKind::Page, "docs", json!({"type": "custom"}));
        resolver.apply(&mut intro);
        assert_eq!(intro.effective.get_string("type"), Some("custom".to_string()));
    }

    #[test]
    fn test_section_index_inherits_from_parent() {
        let tree = docs_tree();
        let resolver = CascadeResolver::new(&tree);
        let mut index = meta("docs/_index.md", UnitKind::SectionIndex, "docs", json!({}));
        resolver.apply(&mut index);
        assert_eq!(index.effective.get_string("type"), Some("page".to_string()));
        assert_eq!(index.effective.get_bool("sidebar"), None);
    }

    #[test]
    fn test_affected_subtree_includes_nested_units() {
        let tree = docs_tree();
        let resolver = CascadeResolver::new(&tree);
        assert_eq!(
            resolver.affected_by_cascade_change(&SectionId::new("docs")),
            BTreeSet::from([
                UnitId::new("docs/_index.md"),
                UnitId::new("docs/guides/setup.md"),
                UnitId::new("docs/intro.md"),
            ])
        );
        assert_eq!(
            resolver.affected_by_cascade_change(&SectionId::root()).len(),
            4
        );
    }

    #[test]
    fn test_cascade_hash_tracks_removal() {
        let mut tree = docs_tree();
        let before = CascadeResolver::new(&tree).cascade_hash(&SectionId::new("docs"));
        tree.set_cascade(&SectionId::new("docs"), frontmatter(json!({"type": "docs"})));
        let after = CascadeResolver::new(&tree).cascade_hash(&SectionId::new("docs"));
        assert_ne!(before, after);
    }

    #[test]
    fn test_register_edges_reach_every_ancestor() {
        let tree = docs_tree();
        let resolver = CascadeResolver::new(&tree);
        let setup = meta("docs/guides/setup.md", UnitKind::Page, "docs/guides", json!({}));
        let mut tracker = DependencyTracker::new();
        resolver.register_edges(&mut tracker, [&setup]);

        let sources: Vec<&NodeId> = tracker
            .dependencies_of(&NodeId::Unit(setup.id.clone()))
            .collect();
        assert_eq!(sources.len(), 3);

        let expanded = tracker.expand(&BTreeSet::from([NodeId::Cascade(SectionId::root())]));
        assert!(expanded.contains(&NodeId::Unit(setup.id.clone())));
    }
}
