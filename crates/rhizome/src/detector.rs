use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{IoContext, Result};
use crate::persist::CacheRecord;
use crate::types::NodeId;

/// Hex-encoded SHA-256 digest of an artifact's bytes.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(String);

impl ContentHash {
    pub fn from_bytes(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Self(format!("{:x}", hasher.finalize()))
    }

    /// Digest of several labelled parts; parts are length-prefixed so that
    /// `["ab", "c"]` and `["a", "bc"]` differ.
    pub fn from_parts<'a>(parts: impl IntoIterator<Item = &'a str>) -> Self {
        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update((part.len() as u64).to_le_bytes());
            hasher.update(part.as_bytes());
        }
        Self(format!("{:x}", hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(&self.0)
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "ContentHash({})", self.short())
    }
}

/// Outcome of change detection handed to the scheduler.
#[derive(Debug, Clone, Default)]
pub struct Detection {
    pub config_changed: bool,
    pub changed: BTreeSet<NodeId>,
}

impl Detection {
    pub fn changed_units(&self) -> impl Iterator<Item = &crate::types::UnitId> {
        self.changed.iter().filter_map(NodeId::as_unit)
    }
}

/// Classifies inputs against a read-only cache snapshot. Unreadable inputs are
/// recorded without a hash and always count as changed.
pub struct ChangeDetector<'a> {
    snapshot: &'a CacheRecord,
    observed: BTreeMap<NodeId, Option<ContentHash>>,
    forced: BTreeSet<NodeId>,
}

impl<'a> ChangeDetector<'a> {
    pub fn new(snapshot: &'a CacheRecord) -> Self {
        Self {
            snapshot,
            observed: BTreeMap::new(),
            forced: BTreeSet::new(),
        }
    }

    pub fn hash(data: &[u8]) -> ContentHash {
        ContentHash::from_bytes(data)
    }

    pub fn hash_file(path: &Path) -> Result<ContentHash> {
        let content = fs::read(path).io_context("hashing", path)?;
        Ok(ContentHash::from_bytes(&content))
    }

    /// Hash of the fully resolved configuration. Object keys are sorted and every
    /// scalar carries a type tag, so `1`, `1.0` and `"1"` never collide and key
    /// order in the source files is irrelevant.
    pub fn config_hash(effective: &Value) -> ContentHash {
        let mut canonical = String::new();
        write_canonical(effective, &mut canonical);
        ContentHash::from_bytes(canonical.as_bytes())
    }

    pub fn observe_file(&mut self, node: NodeId, path: &Path) -> Option<ContentHash> {
        let hash = match Self::hash_file(path) {
            Ok(hash) => Some(hash),
            Err(error) => {
                debug!("treating {node} as changed: {error}");
                None
            }
        };
        self.observed.insert(node, hash.clone());
        hash
    }

    /// Hashes many files on the rayon pool; results are recorded in node order.
    pub fn observe_files(&mut self, files: &[(NodeId, PathBuf)]) {
        let hashes: Vec<(NodeId, Option<ContentHash>)> = files
            .par_iter()
            .map(|(node, path)| (node.clone(), Self::hash_file(path).ok()))
            .collect();
        for (node, hash) in hashes {
            if hash.is_none() {
                debug!("treating {node} as changed: unreadable");
            }
            self.observed.insert(node, hash);
        }
    }

    pub fn observe_hash(&mut self, node: NodeId, hash: ContentHash) {
        self.observed.insert(node, Some(hash));
    }

    /// Marks a node changed regardless of its hash (missing output, removed sibling).
    pub fn force_changed(&mut self, node: NodeId) {
        self.forced.insert(node);
    }

    pub fn current(&self, node: &NodeId) -> Option<&ContentHash> {
        self.observed.get(node).and_then(Option::as_ref)
    }

    pub fn is_changed(&self, node: &NodeId) -> bool {
        if self.forced.contains(node) {
            return true;
        }
        let Some(Some(current)) = self.observed.get(node) else {
            return true;
        };
        match self.snapshot.entries.get(node) {
            Some(entry) => entry.content_hash != *current,
            None => true,
        }
    }

    pub fn changed(&self) -> BTreeSet<NodeId> {
        self.observed
            .keys()
            .chain(self.forced.iter())
            .filter(|node| self.is_changed(node))
            .cloned()
            .collect()
    }

    pub fn detection(&self, config_changed: bool) -> Detection {
        Detection {
            config_changed,
            changed: self.changed(),
        }
    }

    pub fn observations(&self) -> &BTreeMap<NodeId, Option<ContentHash>> {
        &self.observed
    }
}

fn write_canonical(value: &Value, output: &mut String) {
    match value {
        Value::Null => output.push('n'),
        Value::Bool(flag) => {
            output.push_str(if *flag { "b1" } else { "b0" });
        }
        Value::Number(number) => {
            if let Some(integer) = number.as_i64() {
                output.push_str(&format!("i{integer};"));
            } else if let Some(integer) = number.as_u64() {
                output.push_str(&format!("u{integer};"));
            } else {
                let float = number.as_f64().unwrap_or(f64::NAN);
                output.push_str(&format!("f{:016x};", float.to_bits()));
            }
        }
        Value::String(text) => write_string(text, output),
        Value::Array(items) => {
            output.push_str(&format!("a{};", items.len()));
            for item in items {
                write_canonical(item, output);
            }
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            output.push_str(&format!("o{};", keys.len()));
            for key in keys {
                write_string(key, output);
                write_canonical(&map[key.as_str()], output);
            }
        }
    }
}

fn write_string(text: &str, output: &mut String) {
    output.push_str(&format!("s{}:", text.len()));
    output.push_str(text);
}
