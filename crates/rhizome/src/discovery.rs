use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::config::SiteConfig;
use crate::error::{IoContext, Result, RhizomeError};
use crate::types::{SectionId, SectionTree, UnitId, UnitKind};

pub const SECTION_INDEX: &str = "_index.md";
const DATA_EXTENSIONS: [&str; 4] = ["toml", "yaml", "yml", "json"];

/// A source file found on disk, before anything about it has been parsed.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredUnit {
    pub id: UnitId,
    pub kind: UnitKind,
    pub section: SectionId,
    pub source: PathBuf,
    pub output_path: PathBuf,
    pub url: String,
}

#[derive(Debug, Clone, Default)]
pub struct Discovered {
    pub sections: SectionTree,
    pub units: Vec<DiscoveredUnit>,
    /// Template name (relative to the templates dir) to file.
    pub templates: BTreeMap<String, PathBuf>,
    /// Data file name (relative to the data dir) to file.
    pub data: BTreeMap<String, PathBuf>,
}

pub fn discover(root: &Path, config: &SiteConfig) -> Result<Discovered> {
    let content_dir = root.join(&config.content_dir);
    let mut discovered = Discovered::default();

    if content_dir.is_dir() {
        for entry in WalkDir::new(&content_dir)
            .min_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| !is_hidden(entry.file_name()))
        {
            let entry = entry.map_err(|error| RhizomeError::WalkDir {
                path: content_dir.clone(),
                message: error.to_string(),
            })?;
            let path = entry.path();
            let relative = relative_name(path, &content_dir)?;

            if entry.file_type().is_dir() {
                discovered.sections.ensure_section(&SectionId::new(relative));
                continue;
            }

            if path.extension().map(|extension| extension != "md").unwrap_or(true) {
                continue;
            }
            let filename = entry.file_name().to_string_lossy();
            if filename.starts_with('_') && filename != SECTION_INDEX {
                continue;
            }

            let unit = discovered_unit(path, &relative);
            discovered.sections.add_unit(
                &unit.section,
                unit.id.clone(),
                unit.kind == UnitKind::SectionIndex,
            );
            discovered.units.push(unit);
        }
    }

    discovered.templates = collect_files(&root.join(&config.templates_dir), &["html"])?;
    discovered.data = collect_files(&root.join(&config.data_dir), &DATA_EXTENSIONS)?;
    discovered.units.sort_by(|a, b| a.id.cmp(&b.id));

    Ok(discovered)
}

fn discovered_unit(path: &Path, relative: &str) -> DiscoveredUnit {
    let (directory, filename) = match relative.rsplit_once('/') {
        Some((directory, filename)) => (directory, filename),
        None => ("", relative),
    };
    let section = SectionId::new(directory);

    if filename == SECTION_INDEX {
        let (output_path, url) = section_output(&section);
        DiscoveredUnit {
            id: UnitId::new(relative),
            kind: UnitKind::SectionIndex,
            section,
            source: path.to_path_buf(),
            output_path,
            url,
        }
    } else {
        let stem = filename.strip_suffix(".md").unwrap_or(filename);
        let logical = if section.is_root() {
            stem.to_string()
        } else {
            format!("{}/{stem}", section.as_str())
        };
        DiscoveredUnit {
            id: UnitId::new(relative),
            kind: UnitKind::Page,
            section,
            source: path.to_path_buf(),
            output_path: PathBuf::from(&logical).join("index.html"),
            url: format!("/{logical}/"),
        }
    }
}

pub fn section_output(section: &SectionId) -> (PathBuf, String) {
    if section.is_root() {
        (PathBuf::from("index.html"), "/".to_string())
    } else {
        (
            PathBuf::from(section.as_str()).join("index.html"),
            format!("/{}/", section.as_str()),
        )
    }
}

fn collect_files(dir: &Path, extensions: &[&str]) -> Result<BTreeMap<String, PathBuf>> {
    let mut files = BTreeMap::new();
    if !dir.is_dir() {
        return Ok(files);
    }

    for entry in WalkDir::new(dir)
        .min_depth(1)
        .into_iter()
        .filter_entry(|entry| !is_hidden(entry.file_name()))
    {
        let entry = entry.map_err(|error| RhizomeError::WalkDir {
            path: dir.to_path_buf(),
            message: error.to_string(),
        })?;
        let path = entry.path();
        if !entry.file_type().is_file() {
            continue;
        }
        let extension = path
            .extension()
            .and_then(|extension| extension.to_str())
            .unwrap_or("");
        if !extensions.contains(&extension) {
            continue;
        }
        files.insert(relative_name(path, dir)?, path.to_path_buf());
    }

    Ok(files)
}

fn is_hidden(name: &std::ffi::OsStr) -> bool {
    name.to_string_lossy().starts_with('.')
}

/// `/`-separated path relative to `base`, identical on every platform.
fn relative_name(path: &Path, base: &Path) -> Result<String> {
    let relative = path
        .strip_prefix(base)
        .map_err(|error| RhizomeError::WalkDir {
            path: path.to_path_buf(),
            message: error.to_string(),
        })?;
    Ok(relative
        .iter()
        .map(|segment| segment.to_string_lossy())
        .collect::<Vec<_>>()
        .join("/"))
}

pub fn load_data_file(path: &Path) -> Result<Value> {
    let content = fs::read_to_string(path).io_context("reading data file", path)?;
    let extension = path
        .extension()
        .and_then(|extension| extension.to_str())
        .unwrap_or("");

    match extension {
        "toml" => toml::from_str(&content).map_err(|error| RhizomeError::TomlParse {
            path: path.to_path_buf(),
            message: error.to_string(),
        }),
        "yaml" | "yml" => serde_yml::from_str(&content).map_err(|error| RhizomeError::YamlParse {
            path: path.to_path_buf(),
            message: error.to_string(),
        }),
        _ => serde_json::from_str(&content).map_err(|error| RhizomeError::JsonParse {
            path: path.to_path_buf(),
            message: error.to_string(),
        }),
    }
}

/// Loads every data file into one nested object keyed by directory and file stem
/// (`data/nav/main.toml` becomes `data.nav.main`).
pub fn load_data(files: &BTreeMap<String, PathBuf>) -> Result<Value> {
    let mut root = Map::new();
    for (name, path) in files {
        let value = load_data_file(path)?;
        let key = build_data_key(name);
        insert_nested_value(&mut root, &key, value);
    }
    Ok(Value::Object(root))
}

fn build_data_key(name: &str) -> Vec<String> {
    let mut parts: Vec<String> = name.split('/').map(String::from).collect();
    if let Some(last) = parts.last_mut()
        && let Some((stem, _)) = last.rsplit_once('.')
    {
        *last = stem.to_string();
    }
    parts
}

fn insert_nested_value(map: &mut Map<String, Value>, key: &[String], value: Value) {
    match key {
        [] => {}
        [last] => {
            map.insert(last.clone(), value);
        }
        [first, rest @ ..] => {
            let child = map
                .entry(first.clone())
                .or_insert_with(|| Value::Object(Map::new()));
            if !child.is_object() {
                *child = Value::Object(Map::new());
            }
            if let Value::Object(child_map) = child {
                insert_nested_value(child_map, rest, value);
            }
        }
    }
}
