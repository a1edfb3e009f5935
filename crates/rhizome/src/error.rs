use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::types::UnitId;

#[derive(Error, Debug)]
pub enum RhizomeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("IO error while {action} {path}: {source}")]
    IoAt {
        action: String,
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("TOML parse error in {path}: {message}")]
    TomlParse { path: PathBuf, message: String },

    #[error("YAML parse error in {path}: {message}")]
    YamlParse { path: PathBuf, message: String },

    #[error("JSON parse error in {path}: {message}")]
    JsonParse { path: PathBuf, message: String },

    #[error("Template error: {0}")]
    Template(#[from] tera::Error),

    #[error("Invalid frontmatter in file: {path}")]
    InvalidFrontmatter { path: PathBuf },

    #[error("Directory walk error in {path}: {message}")]
    WalkDir { path: PathBuf, message: String },

    #[error("Config file not found: {path}")]
    ConfigNotFound { path: PathBuf },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Unknown build profile '{name}'")]
    UnknownProfile { name: String },

    #[error("Output path {path} is produced by both '{first}' and '{second}'")]
    DuplicateOutput {
        path: PathBuf,
        first: UnitId,
        second: UnitId,
    },

    #[error("Dependency cycle detected: {}", .cycle.join(" -> "))]
    DependencyCycle { cycle: Vec<String> },

    #[error("Failed to parse '{unit}': {message}")]
    ContentParse { unit: UnitId, message: String },

    #[error("Failed to render '{unit}': {message}")]
    Render { unit: UnitId, message: String },

    #[error("Cache at {path} is unusable: {reason}")]
    CacheCorruption { path: PathBuf, reason: String },

    #[error("Failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Worker pool error: {message}")]
    WorkerPool { message: String },

    #[error("Build cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ErrorKind {
    Configuration,
    DependencyCycle,
    ContentParse,
    Render,
    CacheCorruption,
    Write,
    Io,
    Cancelled,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Configuration => "configuration",
            ErrorKind::DependencyCycle => "dependency-cycle",
            ErrorKind::ContentParse => "content-parse",
            ErrorKind::Render => "render",
            ErrorKind::CacheCorruption => "cache-corruption",
            ErrorKind::Write => "write",
            ErrorKind::Io => "io",
            ErrorKind::Cancelled => "cancelled",
        };
        formatter.write_str(name)
    }
}

impl RhizomeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RhizomeError::Io(_) | RhizomeError::IoAt { .. } | RhizomeError::WalkDir { .. } => {
                ErrorKind::Io
            }
            RhizomeError::TomlParse { .. }
            | RhizomeError::YamlParse { .. }
            | RhizomeError::JsonParse { .. }
            | RhizomeError::InvalidFrontmatter { .. }
            | RhizomeError::ContentParse { .. } => ErrorKind::ContentParse,
            RhizomeError::Template(_) | RhizomeError::Render { .. } => ErrorKind::Render,
            RhizomeError::ConfigNotFound { .. }
            | RhizomeError::Configuration { .. }
            | RhizomeError::UnknownProfile { .. }
            | RhizomeError::DuplicateOutput { .. }
            | RhizomeError::WorkerPool { .. } => ErrorKind::Configuration,
            RhizomeError::DependencyCycle { .. } => ErrorKind::DependencyCycle,
            RhizomeError::CacheCorruption { .. } => ErrorKind::CacheCorruption,
            RhizomeError::Write { .. } => ErrorKind::Write,
            RhizomeError::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Fatal errors abort the build before (or instead of) committing anything.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Configuration
                | ErrorKind::DependencyCycle
                | ErrorKind::Io
                | ErrorKind::Cancelled
        )
    }
}

pub type Result<T> = std::result::Result<T, RhizomeError>;

pub trait IoContext<T> {
    fn io_context(self, action: &str, path: &Path) -> Result<T>;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn io_context(self, action: &str, path: &Path) -> Result<T> {
        self.map_err(|source| RhizomeError::IoAt {
            action: action.to_string(),
            path: path.to_path_buf(),
            source,
        })
    }
}
