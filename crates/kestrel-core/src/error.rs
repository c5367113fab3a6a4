use crate::manifest::Diagnostic;
use crate::plugin::HookKind;
use std::path::PathBuf;
use thiserror::Error;

/// Engine-level error for kestrel operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read config at {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config at {path}: {source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to parse config: {0}")]
    ConfigJson(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("Build failed with {} module error(s)", .diagnostics.len())]
    BuildFailed { diagnostics: Vec<Diagnostic> },

    #[error("Build cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

impl Error {
    #[must_use]
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    pub(crate) fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }
}

/// Result alias for engine operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Failure attached to a module node during graph construction.
///
/// These never escape the builder; they are collected on the offending module and
/// reported through the manifest.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
    #[error("Cannot resolve '{specifier}' from '{importer}': {reason}")]
    Resolve {
        importer: String,
        specifier: String,
        reason: String,
    },

    #[error("Cannot load '{id}': {reason}")]
    Load { id: String, reason: String },

    #[error("Failed to parse '{id}'{}: {message}", position(.line, .column))]
    Parse {
        id: String,
        line: Option<u32>,
        column: Option<u32>,
        message: String,
    },

    #[error("{hook} hook failed for '{key}': {reason}")]
    Plugin {
        hook: HookKind,
        key: String,
        reason: String,
    },
}

impl BuildError {
    /// Stable error code for machine-readable output.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Resolve { .. } => codes::RESOLVE_ERROR,
            Self::Load { .. } => codes::LOAD_ERROR,
            Self::Parse { .. } => codes::PARSE_ERROR,
            Self::Plugin { .. } => codes::PLUGIN_ERROR,
        }
    }

    pub(crate) fn load(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Load {
            id: id.into(),
            reason: reason.into(),
        }
    }

    #[must_use]
    pub fn is_resolve(&self) -> bool {
        matches!(self, Self::Resolve { .. })
    }
}

fn position(line: &Option<u32>, column: &Option<u32>) -> String {
    match (line, column) {
        (Some(l), Some(c)) => format!(" at {l}:{c}"),
        (Some(l), None) => format!(" at line {l}"),
        _ => String::new(),
    }
}

/// Stable error codes.
pub mod codes {
    pub const RESOLVE_ERROR: &str = "RESOLVE_ERROR";
    pub const LOAD_ERROR: &str = "LOAD_ERROR";
    pub const PARSE_ERROR: &str = "PARSE_ERROR";
    pub const PLUGIN_ERROR: &str = "PLUGIN_ERROR";
}
