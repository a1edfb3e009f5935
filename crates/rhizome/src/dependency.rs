use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::error::{Result, RhizomeError};
use crate::types::{DependencyEdge, NodeId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Visit {
    InProgress,
    Done,
}

/// Records `artifact -> source` edges in both directions.
#[derive(Debug, Default, Clone)]
pub struct DependencyTracker {
    dependencies: BTreeMap<NodeId, BTreeSet<NodeId>>,
    dependents: BTreeMap<NodeId, BTreeSet<NodeId>>,
}

impl DependencyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, artifact: NodeId, source: NodeId) {
        self.dependents
            .entry(source.clone())
            .or_default()
            .insert(artifact.clone());
        self.dependencies.entry(artifact).or_default().insert(source);
    }

    pub fn register_edge(&mut self, edge: DependencyEdge) {
        self.register(edge.artifact, edge.source);
    }

    pub fn dependencies_of(&self, artifact: &NodeId) -> impl Iterator<Item = &NodeId> {
        self.dependencies.get(artifact).into_iter().flatten()
    }

    pub fn dependents_of(&self, source: &NodeId) -> impl Iterator<Item = &NodeId> {
        self.dependents.get(source).into_iter().flatten()
    }

    pub fn edges(&self) -> impl Iterator<Item = DependencyEdge> + '_ {
        self.dependencies.iter().flat_map(|(artifact, sources)| {
            sources.iter().map(move |source| DependencyEdge {
                artifact: artifact.clone(),
                source: source.clone(),
            })
        })
    }

    pub fn edge_count(&self) -> usize {
        self.dependencies.values().map(BTreeSet::len).sum()
    }

    /// Every node that transitively depends on any of `changed`.
    pub fn expand(&self, changed: &BTreeSet<NodeId>) -> BTreeSet<NodeId> {
        let mut reached = BTreeSet::new();
        let mut queue: VecDeque<&NodeId> = changed.iter().collect();

        while let Some(node) = queue.pop_front() {
            for dependent in self.dependents_of(node) {
                if reached.insert(dependent.clone()) {
                    queue.push_back(dependent);
                }
            }
        }

        reached
    }

    /// Fails with the first cycle found, listed from its entry node back to itself.
    pub fn check_acyclic(&self) -> Result<()> {
        let mut visits: BTreeMap<&NodeId, Visit> = BTreeMap::new();
        let mut path: Vec<&NodeId> = Vec::new();

        for start in self.dependencies.keys() {
            if visits.contains_key(start) {
                continue;
            }
            if let Some(cycle) = self.visit(start, &mut visits, &mut path) {
                return Err(RhizomeError::DependencyCycle { cycle });
            }
        }

        Ok(())
    }

    fn visit<'a>(
        &'a self,
        node: &'a NodeId,
        visits: &mut BTreeMap<&'a NodeId, Visit>,
        path: &mut Vec<&'a NodeId>,
    ) -> Option<Vec<String>> {
        visits.insert(node, Visit::InProgress);
        path.push(node);

        for source in self.dependencies_of(node) {
            match visits.get(source) {
                Some(Visit::InProgress) => {
                    let start = path.iter().position(|entry| *entry == source)?;
                    let mut cycle: Vec<String> =
                        path[start..].iter().map(|entry| entry.to_string()).collect();
                    cycle.push(source.to_string());
                    return Some(cycle);
                }
                Some(Visit::Done) => {}
                None => {
                    if let Some(cycle) = self.visit(source, visits, path) {
                        return Some(cycle);
                    }
                }
            }
        }

        path.pop();
        visits.insert(node, Visit::Done);
        None
    }
}
