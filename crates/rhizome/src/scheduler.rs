use rayon::prelude::*;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

use crate::cascade::CascadeResolver;
use crate::dependency::DependencyTracker;
use crate::detector::Detection;
use crate::error::{Result, RhizomeError};
use crate::graph::ContentGraph;
use crate::types::{NodeId, UnitId};

pub type WorkSet = BTreeSet<UnitId>;

/// Shared flag checked before each unit starts. Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Units to render, in id order. Units carry no ordering constraints between
/// each other, so any partition of this list is valid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchPlan {
    pub units: Vec<UnitId>,
    pub jobs: usize,
}

#[derive(Debug)]
pub enum UnitOutcome<T> {
    Completed(T),
    Failed(RhizomeError),
    /// Never started because the build was cancelled first.
    Skipped,
}

pub struct BuildScheduler {
    jobs: Option<usize>,
    token: CancellationToken,
}

impl BuildScheduler {
    pub fn new(jobs: Option<usize>, token: CancellationToken) -> Self {
        Self { jobs, token }
    }

    pub fn compute_work_set(
        &self,
        detection: &Detection,
        tracker: &DependencyTracker,
        resolver: &CascadeResolver<'_>,
        graph: &ContentGraph,
        force_full: bool,
    ) -> WorkSet {
        if force_full || detection.config_changed {
            debug!(
                "full rebuild (forced: {force_full}, config changed: {})",
                detection.config_changed
            );
            return graph.unit_ids().cloned().collect();
        }

        let mut work_set: WorkSet = detection
            .changed_units()
            .filter(|id| graph.contains(id))
            .cloned()
            .collect();

        let expanded = tracker.expand(&detection.changed);
        work_set.extend(
            expanded
                .iter()
                .filter_map(NodeId::as_unit)
                .filter(|id| graph.contains(id))
                .cloned(),
        );

        for node in &detection.changed {
            if let NodeId::Cascade(section) = node {
                let affected = resolver.affected_by_cascade_change(section);
                debug!("cascade change in {section} affects {} units", affected.len());
                work_set.extend(affected.into_iter().filter(|id| graph.contains(id)));
            }
        }

        work_set
    }

    pub fn plan(&self, work_set: &WorkSet) -> DispatchPlan {
        DispatchPlan {
            units: work_set.iter().cloned().collect(),
            jobs: self
                .jobs
                .filter(|jobs| *jobs > 0)
                .unwrap_or_else(rayon::current_num_threads),
        }
    }

    /// Renders every planned unit on a dedicated pool. Outcomes come back in plan
    /// order. A fatal unit error stops units that have not started yet and is
    /// returned as the error of the whole batch; the first one in plan order wins.
    /// The cancellation token is only read, never set.
    pub fn execute<T, F>(&self, plan: &DispatchPlan, render: F) -> Result<Vec<(UnitId, UnitOutcome<T>)>>
    where
        T: Send,
        F: Fn(&UnitId) -> Result<T> + Sync,
    {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(plan.jobs)
            .build()
            .map_err(|error| RhizomeError::WorkerPool {
                message: error.to_string(),
            })?;

        info!("rendering {} units on {} workers", plan.units.len(), plan.jobs);

        let aborted = AtomicBool::new(false);
        let mut outcomes: Vec<(UnitId, UnitOutcome<T>)> = pool.install(|| {
            plan.units
                .par_iter()
                .map(|id| {
                    if self.token.is_cancelled() || aborted.load(Ordering::SeqCst) {
                        return (id.clone(), UnitOutcome::Skipped);
                    }
                    let outcome = match render(id) {
                        Ok(value) => UnitOutcome::Completed(value),
                        Err(error) => {
                            if error.is_fatal() {
                                aborted.store(true, Ordering::SeqCst);
                            }
                            UnitOutcome::Failed(error)
                        }
                    };
                    (id.clone(), outcome)
                })
                .collect()
        });

        let fatal = outcomes.iter().position(
            |(_, outcome)| matches!(outcome, UnitOutcome::Failed(error) if error.is_fatal()),
        );
        if let Some(position) = fatal
            && let (id, UnitOutcome::Failed(error)) = outcomes.swap_remove(position)
        {
            warn!("aborting build after fatal error in {id}: {error}");
            return Err(error);
        }

        Ok(outcomes)
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::ContentHash;
    use crate::graph::{ContentEntry, ContentUnit};
    use crate::types::{Frontmatter, SectionId, SectionTree, UnitKind, UnitMeta};
    use std::path::PathBuf;
    use std::sync::atomic::AtomicUsize;

    fn graph_with(ids: &[(&str, &str)]) -> ContentGraph {
        let mut graph = ContentGraph::default();
        for (id, section) in ids {
            graph.insert(ContentEntry::Full(ContentUnit {
                meta: UnitMeta {
                    id: UnitId::new(*id),
                    kind: if id.ends_with("_index.md") {
                        UnitKind::SectionIndex
                    } else {
                        UnitKind::Page
                    },
                    section: SectionId::new(*section),
                    source: None,
                    frontmatter: Frontmatter::default(),
                    effective: Frontmatter::default(),
                    output_path: PathBuf::from(*id),
                    url: format!("/{id}/"),
                    content_hash: ContentHash::from_bytes(id.as_bytes()),
                },
                body: String::new(),
            }));
        }
        graph
    }

    fn unit(id: &str) -> UnitId {
        UnitId::new(id)
    }

    fn scheduler() -> BuildScheduler {
        BuildScheduler::new(Some(2), CancellationToken::new())
    }

    #[test]
    fn test_nothing_changed_is_empty() {
        let graph = graph_with(&[("a.md", "")]);
        let tracker = DependencyTracker::new();
        let tree = SectionTree::new();
        let resolver = CascadeResolver::new(&tree);

        let work_set = scheduler().compute_work_set(
            &Detection::default(),
            &tracker,
            &resolver,
            &graph,
            false,
        );
        assert!(work_set.is_empty());
    }

    #[test]
    fn test_config_change_selects_everything() {
        let graph = graph_with(&[("a.md", ""), ("docs/b.md", "docs")]);
        let tracker = DependencyTracker::new();
        let tree = SectionTree::new();
        let resolver = CascadeResolver::new(&tree);
        let detection = Detection {
            config_changed: true,
            changed: BTreeSet::new(),
        };

        let work_set = scheduler().compute_work_set(&detection, &tracker, &resolver, &graph, false);
        assert_eq!(work_set.len(), 2);

        let forced =
            scheduler().compute_work_set(&Detection::default(), &tracker, &resolver, &graph, true);
        assert_eq!(forced.len(), 2);
    }

    #[test]
    fn test_union_of_direct_dependent_and_cascade() {
        let graph = graph_with(&[
            ("a.md", ""),
            ("b.md", ""),
            ("docs/_index.md", "docs"),
            ("docs/c.md", "docs"),
            ("docs/deep/d.md", "docs/deep"),
            ("blog/e.md", "blog"),
        ]);
        let mut tracker = DependencyTracker::new();
        tracker.register(
            NodeId::Unit(unit("b.md")),
            NodeId::Template("special.html".to_string()),
        );
        let resolver = CascadeResolver::new(&graph.sections);

        let detection = Detection {
            config_changed: false,
            changed: BTreeSet::from([
                NodeId::Unit(unit("a.md")),
                NodeId::Template("special.html".to_string()),
                NodeId::Cascade(SectionId::new("docs")),
                NodeId::Unit(unit("gone.md")),
            ]),
        };

        let work_set = scheduler().compute_work_set(&detection, &tracker, &resolver, &graph, false);
        assert_eq!(
            work_set,
            BTreeSet::from([
                unit("a.md"),
                unit("b.md"),
                unit("docs/_index.md"),
                unit("docs/c.md"),
                unit("docs/deep/d.md"),
            ])
        );
    }

    #[test]
    fn test_execute_returns_outcomes_in_plan_order() {
        let work_set: WorkSet = (0..32).map(|index| unit(&format!("{index:02}.md"))).collect();
        let scheduler = BuildScheduler::new(Some(4), CancellationToken::new());
        let plan = scheduler.plan(&work_set);
        assert_eq!(plan.jobs, 4);

        let outcomes = scheduler
            .execute(&plan, |id| Ok(id.as_str().to_uppercase()))
            .unwrap();
        let ids: Vec<UnitId> = outcomes.iter().map(|(id, _)| id.clone()).collect();
        assert_eq!(ids, plan.units);
        assert!(
            outcomes
                .iter()
                .all(|(_, outcome)| matches!(outcome, UnitOutcome::Completed(_)))
        );
    }

    #[test]
    fn test_unit_failure_does_not_abort_batch() {
        let work_set: WorkSet = [unit("a.md"), unit("b.md"), unit("c.md")].into();
        let scheduler = scheduler();
        let plan = scheduler.plan(&work_set);

        let outcomes = scheduler
            .execute(&plan, |id| {
                if id.as_str() == "b.md" {
                    Err(RhizomeError::Render {
                        unit: id.clone(),
                        message: "missing variable".to_string(),
                    })
                } else {
                    Ok(())
                }
            })
            .unwrap();

        assert!(matches!(outcomes[0].1, UnitOutcome::Completed(())));
        assert!(matches!(outcomes[1].1, UnitOutcome::Failed(_)));
        assert!(matches!(outcomes[2].1, UnitOutcome::Completed(())));
        assert!(!scheduler.token().is_cancelled());
    }

    #[test]
    fn test_cancelled_before_start_skips_everything() {
        let work_set: WorkSet = [unit("a.md"), unit("b.md")].into();
        let token = CancellationToken::new();
        token.cancel();
        let scheduler = BuildScheduler::new(Some(2), token);
        let calls = AtomicUsize::new(0);

        let outcomes = scheduler
            .execute(&scheduler.plan(&work_set), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(
            outcomes
                .iter()
                .all(|(_, outcome)| matches!(outcome, UnitOutcome::Skipped))
        );
    }

    #[test]
    fn test_fatal_unit_error_stops_batch_with_its_cause() {
        let work_set: WorkSet = (0..8).map(|index| unit(&format!("{index}.md"))).collect();
        let scheduler = BuildScheduler::new(Some(1), CancellationToken::new());
        let calls = AtomicUsize::new(0);

        let error = scheduler
            .execute(&scheduler.plan(&work_set), |id| {
                calls.fetch_add(1, Ordering::SeqCst);
                if id.as_str() == "0.md" {
                    Err(RhizomeError::Io(std::io::Error::other("disk gone")))
                } else {
                    Ok(())
                }
            })
            .unwrap_err();

        assert!(matches!(error, RhizomeError::Io(_)));
        assert!(error.to_string().contains("disk gone"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!scheduler.token().is_cancelled());
    }
}
