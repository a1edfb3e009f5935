use rayon::prelude::*;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

use crate::detector::{ChangeDetector, ContentHash};
use crate::graph::{ContentAccess, ContentEntry};
use crate::persist::{CacheRecord, ValidatorOutcome};
use crate::types::{UnitId, UnitMeta};

/// Checks a unit and returns human-readable findings. Must be deterministic in
/// the unit's content hash and effective metadata, since results are cached on
/// exactly those.
pub trait Validator: Send + Sync {
    fn id(&self) -> &str;
    fn validate(&self, unit: &ContentEntry) -> Vec<String>;
}

/// Flags pages missing any of the configured frontmatter keys.
pub struct RequiredFields {
    fields: Vec<String>,
}

impl RequiredFields {
    pub fn new(fields: Vec<String>) -> Self {
        Self { fields }
    }
}

impl Validator for RequiredFields {
    fn id(&self) -> &str {
        "required-fields"
    }

    fn validate(&self, unit: &ContentEntry) -> Vec<String> {
        if unit.kind().is_generated() {
            return Vec::new();
        }
        self.fields
            .iter()
            .filter(|field| !unit.effective().raw.contains_key(field.as_str()))
            .map(|field| format!("missing required field '{field}'"))
            .collect()
    }
}

pub fn validation_hash(meta: &UnitMeta) -> ContentHash {
    let effective = Value::Object(
        meta.effective
            .raw
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect(),
    );
    let metadata = ChangeDetector::config_hash(&effective);
    ContentHash::from_parts([meta.content_hash.as_str(), metadata.as_str()])
}

#[derive(Debug, Default)]
pub struct ValidationRun {
    /// Outcomes to persist: only the keys used by this build survive.
    pub outcomes: BTreeMap<String, ValidatorOutcome>,
    pub warnings: Vec<String>,
    pub executed: usize,
    pub reused: usize,
}

pub fn run_validators<'a>(
    validators: &[Arc<dyn Validator>],
    units: &[(&'a UnitId, &'a ContentEntry)],
    previous: &BTreeMap<String, ValidatorOutcome>,
) -> ValidationRun {
    let mut run = ValidationRun::default();

    for validator in validators {
        let results: Vec<(&UnitId, String, ValidatorOutcome, bool)> = units
            .par_iter()
            .map(|(id, entry)| {
                let key = CacheRecord::validator_key(validator.id(), &validation_hash(entry.meta()));
                match previous.get(&key) {
                    Some(outcome) => (*id, key, outcome.clone(), true),
                    None => {
                        let messages = validator.validate(entry);
                        (*id, key, ValidatorOutcome { messages }, false)
                    }
                }
            })
            .collect();

        for (id, key, outcome, reused) in results {
            if reused {
                run.reused += 1;
            } else {
                run.executed += 1;
            }
            run.warnings.extend(
                outcome
                    .messages
                    .iter()
                    .map(|message| format!("{id}: {message} [{}]", validator.id())),
            );
            run.outcomes.insert(key, outcome);
        }
    }

    debug!(
        "validation: {} executed, {} reused from cache",
        run.executed, run.reused
    );
    run
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ContentUnit;
    use crate::types::{Frontmatter, SectionId, UnitKind};
    use serde_json::json;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn entry(id: &str, frontmatter: Value) -> ContentEntry {
        let frontmatter: Frontmatter = serde_json::from_value(frontmatter).unwrap();
        ContentEntry::Full(ContentUnit {
            meta: UnitMeta {
                id: UnitId::new(id),
                kind: UnitKind::Page,
                section: SectionId::root(),
                source: None,
                effective: frontmatter.clone(),
                frontmatter,
                output_path: PathBuf::from(id),
                url: format!("/{id}/"),
                content_hash: ContentHash::from_bytes(id.as_bytes()),
            },
            body: String::new(),
        })
    }

    struct CountingValidator {
        calls: AtomicUsize,
    }

    impl Validator for CountingValidator {
        fn id(&self) -> &str {
            "counting"
        }

        fn validate(&self, _unit: &ContentEntry) -> Vec<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Vec::new()
        }
    }

    #[test]
    fn test_required_fields() {
        let validator = RequiredFields::new(vec!["title".to_string(), "date".to_string()]);
        let findings = validator.validate(&entry("a.md", json!({"title": "A"})));
        assert_eq!(findings, vec!["missing required field 'date'".to_string()]);
    }

    #[test]
    fn test_results_are_reused_by_hash() {
        let counting = Arc::new(CountingValidator {
            calls: AtomicUsize::new(0),
        });
        let validators: Vec<Arc<dyn Validator>> = vec![counting.clone() as Arc<dyn Validator>];
        let a = entry("a.md", json!({"title": "A"}));
        let b = entry("b.md", json!({"title": "B"}));
        let (a_id, b_id) = (UnitId::new("a.md"), UnitId::new("b.md"));
        let units = vec![(&a_id, &a), (&b_id, &b)];

        let first = run_validators(&validators, &units, &BTreeMap::new());
        assert_eq!(first.executed, 2);
        assert_eq!(counting.calls.load(Ordering::SeqCst), 2);

        let second = run_validators(&validators, &units, &first.outcomes);
        assert_eq!(second.reused, 2);
        assert_eq!(second.executed, 0);
        assert_eq!(counting.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_metadata_change_invalidates_result() {
        let before = entry("a.md", json!({"title": "A"}));
        let after = entry("a.md", json!({"title": "B"}));
        assert_ne!(
            validation_hash(before.meta()),
            validation_hash(after.meta())
        );
    }

    #[test]
    fn test_findings_become_warnings() {
        let required: Arc<dyn Validator> = Arc::new(RequiredFields::new(vec!["title".to_string()]));
        let validators = vec![required];
        let a = entry("a.md", json!({}));
        let a_id = UnitId::new("a.md");
        let run = run_validators(&validators, &[(&a_id, &a)], &BTreeMap::new());
        assert_eq!(
            run.warnings,
            vec!["a.md: missing required field 'title' [required-fields]".to_string()]
        );
    }
}
