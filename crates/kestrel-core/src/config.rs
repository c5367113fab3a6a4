//! Engine configuration.
//!
//! `BundlerOptions` enumerates every recognized option with its default applied
//! explicitly. The JSON surface uses camelCase keys (`entryFilename`,
//! `codeSplitting`, ...).

use crate::error::{Error, Result};
use crate::loader::LoaderKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Default output file name pattern.
pub const DEFAULT_ENTRY_FILENAME: &str = "[name].js";

/// Extensions tried by the filesystem resolver, in order.
pub const DEFAULT_EXTENSIONS: &[&str] = &[
    ".tsx", ".ts", ".jsx", ".js", ".mjs", ".cjs", ".json", ".css",
];

/// Extension to loader defaults, overridden per extension by `loader`.
pub const DEFAULT_LOADERS: &[(&str, LoaderKind)] = &[
    ("js", LoaderKind::Js),
    ("mjs", LoaderKind::Js),
    ("cjs", LoaderKind::Js),
    ("jsx", LoaderKind::Jsx),
    ("ts", LoaderKind::Ts),
    ("mts", LoaderKind::Ts),
    ("cts", LoaderKind::Ts),
    ("tsx", LoaderKind::Tsx),
    ("css", LoaderKind::Css),
    ("json", LoaderKind::Json),
    ("txt", LoaderKind::Text),
    ("svg", LoaderKind::DataUri),
    ("png", LoaderKind::DataUri),
    ("jpg", LoaderKind::DataUri),
    ("jpeg", LoaderKind::DataUri),
    ("gif", LoaderKind::DataUri),
    ("webp", LoaderKind::DataUri),
];

/// Bundler options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundlerOptions {
    /// Entry name -> entry specifier (resolved against `root`).
    pub entries: BTreeMap<String, String>,

    /// Run the minifier over emitted chunks.
    #[serde(default)]
    pub minify: bool,

    /// Base directory for relative resolution.
    #[serde(default = "default_root")]
    pub root: PathBuf,

    /// Output directory. Outputs are only written to disk when set.
    #[serde(default)]
    pub outdir: Option<PathBuf>,

    /// Output file name pattern. Supports `[name]` and `[contenthash]`.
    #[serde(default = "default_entry_filename")]
    pub entry_filename: String,

    /// Extension (without dot) -> loader overrides.
    #[serde(default)]
    pub loader: BTreeMap<String, LoaderKind>,

    /// Inline style modules into their importer instead of a separate `.css` asset.
    #[serde(default)]
    pub inline_style: bool,

    /// Specifier prefix -> replacement.
    #[serde(default)]
    pub alias: BTreeMap<String, String>,

    /// Instrument output for live module replacement.
    #[serde(default)]
    pub refresh: bool,

    /// Emit a `.map` file alongside each chunk.
    #[serde(default)]
    pub source_map: bool,

    /// Enable async chunks and cache-group splitting.
    #[serde(default)]
    pub code_splitting: bool,

    /// Turn `.svg` imports into component modules.
    #[serde(default)]
    pub svgr: bool,

    /// Defer compiling dynamic-import targets until requested.
    #[serde(default)]
    pub lazy_compilation: bool,

    /// Emit progress events.
    #[serde(default)]
    pub progress: bool,

    /// Glob patterns for specifiers that are never bundled.
    #[serde(default)]
    pub externals: Vec<String>,

    /// Extensions tried during filesystem resolution.
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,

    /// Cache-group rules, evaluated in declared order.
    #[serde(default)]
    pub cache_groups: Vec<CacheGroup>,

    /// Fail `build`/`rebuild` when any module carries an error.
    #[serde(default)]
    pub strict: bool,

    /// Upper bound for a single host hook round trip.
    #[serde(default)]
    pub hook_timeout_ms: Option<u64>,
}

fn default_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_entry_filename() -> String {
    DEFAULT_ENTRY_FILENAME.to_string()
}

fn default_extensions() -> Vec<String> {
    DEFAULT_EXTENSIONS.iter().map(|e| (*e).to_string()).collect()
}

impl Default for BundlerOptions {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
            minify: false,
            root: default_root(),
            outdir: None,
            entry_filename: default_entry_filename(),
            loader: BTreeMap::new(),
            inline_style: false,
            alias: BTreeMap::new(),
            refresh: false,
            source_map: false,
            code_splitting: false,
            svgr: false,
            lazy_compilation: false,
            progress: false,
            externals: Vec::new(),
            extensions: default_extensions(),
            cache_groups: Vec::new(),
            strict: false,
            hook_timeout_ms: None,
        }
    }
}

/// Which chunks a cache group considers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChunkScope {
    /// Entry chunks only (modules reachable without crossing a dynamic import).
    #[default]
    Initial,
    /// Entry and async chunks.
    All,
}

/// A rule extracting modules shared between chunks into a named chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheGroup {
    /// Name of the shared chunk.
    pub name: String,

    #[serde(default)]
    pub chunks: ChunkScope,

    /// Minimum total size (bytes of transformed code) of the extracted modules.
    #[serde(default)]
    pub min_size: u64,

    /// Minimum number of in-scope chunks a module must belong to.
    #[serde(default = "default_min_chunks")]
    pub min_chunks: usize,

    /// Optional regex over module ids.
    #[serde(default)]
    pub test: Option<String>,
}

fn default_min_chunks() -> usize {
    2
}

impl CacheGroup {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            chunks: ChunkScope::default(),
            min_size: 0,
            min_chunks: default_min_chunks(),
            test: None,
        }
    }

    /// The group applied when splitting is on and none are configured.
    #[must_use]
    pub fn default_commons() -> Self {
        Self::new("commons").with_chunks(ChunkScope::All)
    }

    #[must_use]
    pub fn with_chunks(mut self, chunks: ChunkScope) -> Self {
        self.chunks = chunks;
        self
    }

    #[must_use]
    pub fn with_min_size(mut self, min_size: u64) -> Self {
        self.min_size = min_size;
        self
    }

    #[must_use]
    pub fn with_min_chunks(mut self, min_chunks: usize) -> Self {
        self.min_chunks = min_chunks;
        self
    }

    #[must_use]
    pub fn with_test(mut self, test: impl Into<String>) -> Self {
        self.test = Some(test.into());
        self
    }
}

impl BundlerOptions {
    /// Create options rooted at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Default::default()
        }
    }

    /// Parse options from a JSON string.
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Read options from a JSON file. A relative `root` is taken against the
    /// file's directory.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| Error::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        let mut options: Self =
            serde_json::from_str(&content).map_err(|source| Error::ConfigParse {
                path: path.to_path_buf(),
                source,
            })?;
        if options.root.is_relative() {
            let base = path.parent().unwrap_or(Path::new("."));
            options.root = base.join(&options.root);
        }
        Ok(options)
    }

    /// Check option consistency.
    pub fn validate(&self) -> Result<()> {
        if self.entries.is_empty() {
            return Err(Error::invalid_config("at least one entry is required"));
        }
        for (name, spec) in &self.entries {
            if name.is_empty() || spec.is_empty() {
                return Err(Error::invalid_config(format!(
                    "entry '{name}' must have a non-empty name and path"
                )));
            }
        }

        let named = self.entry_filename.contains("[name]")
            || self.entry_filename.contains("[contenthash]");
        if !named && (self.entries.len() > 1 || self.code_splitting) {
            return Err(Error::invalid_config(format!(
                "entryFilename '{}' must contain [name] or [contenthash] when more than one chunk can be emitted",
                self.entry_filename
            )));
        }

        for pattern in &self.externals {
            glob::Pattern::new(pattern).map_err(|e| {
                Error::invalid_config(format!("invalid external pattern '{pattern}': {e}"))
            })?;
        }

        for group in &self.cache_groups {
            if group.name.is_empty() {
                return Err(Error::invalid_config("cache group name must not be empty"));
            }
            if group.min_chunks == 0 {
                return Err(Error::invalid_config(format!(
                    "cache group '{}' must have minChunks >= 1",
                    group.name
                )));
            }
            if let Some(test) = &group.test {
                regex_lite::Regex::new(test).map_err(|e| {
                    Error::invalid_config(format!(
                        "invalid test regex for cache group '{}': {e}",
                        group.name
                    ))
                })?;
            }
        }

        for ext in &self.extensions {
            if !ext.starts_with('.') {
                return Err(Error::invalid_config(format!(
                    "extension '{ext}' must start with a dot"
                )));
            }
        }

        Ok(())
    }

    /// Extension -> loader map with user overrides applied on top of the defaults.
    #[must_use]
    pub fn loader_map(&self) -> BTreeMap<String, LoaderKind> {
        let mut map: BTreeMap<String, LoaderKind> = DEFAULT_LOADERS
            .iter()
            .map(|(ext, kind)| ((*ext).to_string(), *kind))
            .collect();
        for (ext, kind) in &self.loader {
            map.insert(ext.trim_start_matches('.').to_ascii_lowercase(), *kind);
        }
        map
    }

    /// Cache groups in effect: configured ones, or the default commons group when
    /// splitting is enabled without any.
    #[must_use]
    pub fn effective_cache_groups(&self) -> Vec<CacheGroup> {
        if !self.code_splitting {
            return Vec::new();
        }
        if self.cache_groups.is_empty() {
            vec![CacheGroup::default_commons()]
        } else {
            self.cache_groups.clone()
        }
    }

    #[must_use]
    pub fn with_entry(mut self, name: impl Into<String>, spec: impl Into<String>) -> Self {
        self.entries.insert(name.into(), spec.into());
        self
    }

    #[must_use]
    pub fn with_outdir(mut self, outdir: impl Into<PathBuf>) -> Self {
        self.outdir = Some(outdir.into());
        self
    }

    #[must_use]
    pub fn with_entry_filename(mut self, pattern: impl Into<String>) -> Self {
        self.entry_filename = pattern.into();
        self
    }

    #[must_use]
    pub fn with_alias(mut self, prefix: impl Into<String>, target: impl Into<String>) -> Self {
        self.alias.insert(prefix.into(), target.into());
        self
    }

    #[must_use]
    pub fn with_external(mut self, pattern: impl Into<String>) -> Self {
        self.externals.push(pattern.into());
        self
    }

    #[must_use]
    pub fn with_loader(mut self, ext: impl Into<String>, kind: LoaderKind) -> Self {
        self.loader.insert(ext.into(), kind);
        self
    }

    #[must_use]
    pub fn with_code_splitting(mut self, enabled: bool) -> Self {
        self.code_splitting = enabled;
        self
    }

    #[must_use]
    pub fn with_cache_group(mut self, group: CacheGroup) -> Self {
        self.cache_groups.push(group);
        self
    }

    #[must_use]
    pub fn with_lazy_compilation(mut self, enabled: bool) -> Self {
        self.lazy_compilation = enabled;
        self
    }

    #[must_use]
    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    #[must_use]
    pub fn with_minify(mut self, minify: bool) -> Self {
        self.minify = minify;
        self
    }

    #[must_use]
    pub fn with_source_map(mut self, enabled: bool) -> Self {
        self.source_map = enabled;
        self
    }

    #[must_use]
    pub fn with_inline_style(mut self, enabled: bool) -> Self {
        self.inline_style = enabled;
        self
    }

    #[must_use]
    pub fn with_refresh(mut self, enabled: bool) -> Self {
        self.refresh = enabled;
        self
    }

    #[must_use]
    pub fn with_svgr(mut self, enabled: bool) -> Self {
        self.svgr = enabled;
        self
    }

    #[must_use]
    pub fn with_progress(mut self, enabled: bool) -> Self {
        self.progress = enabled;
        self
    }

    #[must_use]
    pub fn with_hook_timeout_ms(mut self, ms: u64) -> Self {
        self.hook_timeout_ms = Some(ms);
        self
    }
}
