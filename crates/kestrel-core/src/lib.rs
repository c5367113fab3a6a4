#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::return_self_not_must_use)]

//! Module bundling engine.
//!
//! Resolves and loads a project's modules into a graph, partitions the graph
//! into chunks, renders them, and keeps all of it current across file changes.

pub mod builder;
pub mod chunks;
pub mod config;
pub mod engine;
pub mod error;
pub mod graph;
pub mod incremental;
pub mod loader;
pub mod manifest;
pub mod module_id;
pub mod plugin;
pub mod progress;
pub mod render;
pub mod resolver;
pub mod scan;

pub use config::{BundlerOptions, CacheGroup, ChunkScope};
pub use engine::{Engine, EngineBuilder};
pub use error::{codes, BuildError, Error, Result};
pub use incremental::RebuildStats;
pub use loader::{LoaderKind, Transform};
pub use manifest::{BuildResult, ChunkInfo, Diagnostic, ModuleInfo};
pub use module_id::ModuleId;
pub use plugin::{
    ChannelHooks, HookError, HookRequest, HookResult, HostHooks, OnLoadArgs, OnLoadResult,
    OnResolveArgs, OnResolveResult,
};
pub use progress::ProgressEvent;
pub use render::Minifier;
pub use resolver::{resolve_file, ResolveError, ResolveRet};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
