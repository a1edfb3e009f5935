pub mod build;
pub mod cascade;
pub mod config;
pub mod dependency;
pub mod detector;
pub mod discovery;
pub mod error;
pub mod graph;
pub mod notify;
pub mod output;
pub mod parsing;
pub mod persist;
pub mod proxy;
pub mod render;
pub mod scheduler;
pub mod taxonomy;
pub mod types;
pub mod validate;

pub use build::{BuildResult, SiteBuilder, UnitError};
pub use cascade::CascadeResolver;
pub use config::{ConfigLoader, ResolvedConfig, SiteConfig};
pub use dependency::DependencyTracker;
pub use detector::{ChangeDetector, ContentHash, Detection};
pub use error::*;
pub use graph::{ContentAccess, ContentEntry, ContentGraph, ContentUnit};
pub use notify::{ChangeEvent, ChangeKind, ChangeNotifier, ChannelNotifier, NoopNotifier};
pub use persist::{CacheRecord, Persistor};
pub use proxy::{FsSourceLoader, LazyContentProxy, SourceLoader};
pub use render::{RenderContext, Renderer, TeraRenderer};
pub use scheduler::{BuildScheduler, CancellationToken, WorkSet};
pub use types::*;
pub use validate::{RequiredFields, Validator};
