//! Chunk rendering.
//!
//! Every chunk registers its modules into one global registry
//! (`__kestrel__`). A module is wrapped as `function (module, exports, require)`
//! and carries a specifier -> module key table, so `require(spec)` resolves
//! across chunks. Entry chunks then start their entry module.
//!
//! Output file names come from the `entryFilename` pattern; `[name]` and
//! `[contenthash]` (8 hex chars of blake3) are substituted.

use crate::chunks::{Chunk, ChunkGraph, ChunkKind};
use crate::config::BundlerOptions;
use crate::graph::ModuleGraph;
use crate::loader::LoaderKind;
use crate::module_id::ModuleId;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Length of `[contenthash]`.
pub const CONTENT_HASH_LEN: usize = 8;

const RUNTIME: &str = r#"var __kestrel__ = (function (g) {
  if (g.__kestrel__) return g.__kestrel__;
  var defs = {}, cache = {}, asyncChunks = {}, loading = {};
  function load(key) {
    if (cache[key]) return cache[key].exports;
    var def = defs[key];
    if (!def) throw new Error("Module not found: " + key);
    var module = (cache[key] = { exports: {} });
    function require(spec) {
      if (!(spec in def.deps)) throw new Error("Cannot find module '" + spec + "' from " + key);
      var target = def.deps[spec];
      return target === null ? g.require(spec) : load(target);
    }
    require.dynamic = function (spec) {
      var target = def.deps[spec];
      if (target === null) return Promise.resolve().then(function () { return g.require(spec); });
      return ensure(target).then(function () { return load(target); });
    };
    def.fn(module, module.exports, require);
    return module.exports;
  }
  function ensure(key) {
    if (defs[key]) return Promise.resolve();
    var name = asyncChunks[key];
    if (!name) return Promise.reject(new Error("Module not compiled: " + key));
    if (!loading[name]) loading[name] = rt.loadChunk(name);
    return loading[name];
  }
  var rt = {
    define: function (key, deps, fn) { defs[key] = { deps: deps, fn: fn }; },
    require: load,
    async: function (map) { for (var k in map) asyncChunks[k] = map[k]; },
    loadChunk: function (name) { return Promise.reject(new Error("No chunk loader for " + name)); },
    refreshReg: function () {},
    refreshSig: function () { return function (type) { return type; }; }
  };
  return (g.__kestrel__ = rt);
})(typeof globalThis !== "undefined" ? globalThis : this);
"#;

/// A file produced by a build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputFile {
    pub file_name: String,
    #[serde(skip)]
    pub content: String,
}

/// Rendered output of one chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedChunk {
    pub name: String,
    /// Name of the main JS file.
    pub file_name: String,
    pub hash: String,
    /// JS file first, then `.map` and `.css` when emitted.
    pub files: Vec<OutputFile>,
}

/// Minifier black box.
pub trait Minifier: Send + Sync {
    fn minify(&self, code: &str) -> String;
}

/// Strips indentation, blank lines and comment-only lines.
#[derive(Debug, Default, Clone, Copy)]
pub struct WhitespaceMinifier;

impl Minifier for WhitespaceMinifier {
    fn minify(&self, code: &str) -> String {
        let mut out = String::with_capacity(code.len());
        for line in code.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with("//") {
                continue;
            }
            out.push_str(trimmed);
            out.push('\n');
        }
        out
    }
}

/// Options that shape rendered output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderOptions {
    /// Module keys are relative to this.
    pub root: PathBuf,
    pub entry_filename: String,
    pub minify: bool,
    pub source_map: bool,
    pub refresh: bool,
    pub inline_style: bool,
}

impl RenderOptions {
    #[must_use]
    pub fn from_options(options: &BundlerOptions, root: PathBuf) -> Self {
        Self {
            root,
            entry_filename: options.entry_filename.clone(),
            minify: options.minify,
            source_map: options.source_map,
            refresh: options.refresh,
            inline_style: options.inline_style,
        }
    }
}

/// Chunk -> output files.
pub struct Renderer {
    options: RenderOptions,
    minifier: Arc<dyn Minifier>,
}

impl fmt::Debug for Renderer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Renderer")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl Renderer {
    #[must_use]
    pub fn new(options: RenderOptions, minifier: Arc<dyn Minifier>) -> Self {
        Self { options, minifier }
    }

    #[must_use]
    pub fn options(&self) -> &RenderOptions {
        &self.options
    }

    /// Key used for `id` in emitted code.
    #[must_use]
    pub fn module_key(&self, id: &ModuleId) -> String {
        id.display_relative(&self.options.root)
    }

    /// Render `chunk`. Members missing from `graph` are skipped.
    #[must_use]
    pub fn render_chunk(&self, chunk: &Chunk, graph: &ModuleGraph, chunks: &ChunkGraph) -> RenderedChunk {
        let mut out = Emitter::default();
        let mut map = self.options.source_map.then(SourceMapBuilder::new);
        let mut css = String::new();

        out.push(&self.minified(RUNTIME));

        if !chunk.dynamic_imports.is_empty() {
            let mut table = Map::new();
            for name in &chunk.dynamic_imports {
                if let Some(entry) = chunks.get(name).and_then(|c| c.entry.as_ref()) {
                    table.insert(self.module_key(entry), Value::String(name.clone()));
                }
            }
            out.push(&format!("__kestrel__.async({});\n", Value::Object(table)));
        }

        for id in &chunk.modules {
            let Some(module) = graph.get(id) else {
                continue;
            };
            let key = self.module_key(id);

            let mut deps = Map::new();
            for dep in &module.dependencies {
                let value = match &dep.resolved {
                    Some(_) if dep.external => Value::Null,
                    Some(target) => Value::String(self.module_key(target)),
                    None => continue,
                };
                deps.insert(dep.specifier.clone(), value);
            }

            out.push(&format!(
                "__kestrel__.define({}, {}, function (module, exports, require) {{\n",
                Value::String(key.clone()),
                Value::Object(deps)
            ));
            if self.options.refresh {
                out.push(&format!(
                    "var $RefreshReg$ = function (type, id) {{ __kestrel__.refreshReg(type, {} + id); }};\n\
                     var $RefreshSig$ = __kestrel__.refreshSig;\n",
                    Value::String(format!("{key} "))
                ));
            }

            let body = self.minified(&module.code);
            if let Some(map) = map.as_mut() {
                let source = map.add_source(&key, &module.code);
                for line in 0..body.lines().count() {
                    map.add_line_mapping(out.line + line as u32, source, line as u32);
                }
            }
            out.push(&body);
            if !body.is_empty() && !body.ends_with('\n') {
                out.push("\n");
            }
            out.push("});\n");

            if !self.options.inline_style && module.loader == Some(LoaderKind::Css) {
                if let Some(text) = &module.css {
                    css.push_str(&format!("/* {key} */\n{text}"));
                    if !text.ends_with('\n') {
                        css.push('\n');
                    }
                }
            }
        }

        if chunk.kind == ChunkKind::Entry {
            if let Some(entry) = &chunk.entry {
                out.push(&format!(
                    "__kestrel__.require({});\n",
                    Value::String(self.module_key(entry))
                ));
            }
        }

        let mut code = out.text;
        let hash = kestrel_util::short_hash(code.as_bytes(), CONTENT_HASH_LEN);
        let file_name = file_name(&self.options.entry_filename, &chunk.name, &hash);

        let mut files = Vec::new();
        let map_file = map.map(|map| {
            let map_name = format!("{file_name}.map");
            let base = map_name.rsplit('/').next().unwrap_or(&map_name).to_string();
            code.push_str(&format!("//# sourceMappingURL={base}\n"));
            OutputFile {
                content: map.generate(&file_name),
                file_name: map_name,
            }
        });
        files.push(OutputFile {
            file_name: file_name.clone(),
            content: code,
        });
        files.extend(map_file);
        if !css.is_empty() {
            files.push(OutputFile {
                file_name: format!("{}.css", chunk.name),
                content: css,
            });
        }

        RenderedChunk {
            name: chunk.name.clone(),
            file_name,
            hash,
            files,
        }
    }

    fn minified(&self, code: &str) -> String {
        if self.options.minify {
            self.minifier.minify(code)
        } else {
            code.to_string()
        }
    }
}

/// Substitute `[name]` and `[contenthash]` in a file name pattern.
#[must_use]
pub fn file_name(pattern: &str, name: &str, hash: &str) -> String {
    pattern.replace("[name]", name).replace("[contenthash]", hash)
}

#[derive(Default)]
struct Emitter {
    text: String,
    /// 0-based line the next push starts on.
    line: u32,
}

impl Emitter {
    fn push(&mut self, s: &str) {
        self.text.push_str(s);
        self.line += s.matches('\n').count() as u32;
    }
}

// =============================================================================
// Source maps
// =============================================================================

/// VLQ-encode a signed integer and append to output string.
fn vlq_encode(value: i64, out: &mut String) {
    const B64: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";
    #[allow(clippy::cast_sign_loss)]
    let mut v = (if value < 0 { ((-value) << 1) | 1 } else { value << 1 }) as u64;
    loop {
        let mut digit = (v & 0x1f) as u8;
        v >>= 5;
        if v > 0 {
            digit |= 0x20;
        }
        out.push(B64[digit as usize] as char);
        if v == 0 {
            break;
        }
    }
}

/// Line-level V3 source map for one chunk.
struct SourceMapBuilder {
    sources: Vec<String>,
    sources_content: Vec<String>,
    /// (output line, source index, source line), pushed in output order.
    mappings: Vec<(u32, u32, u32)>,
}

impl SourceMapBuilder {
    fn new() -> Self {
        Self {
            sources: Vec::new(),
            sources_content: Vec::new(),
            mappings: Vec::new(),
        }
    }

    fn add_source(&mut self, path: &str, content: &str) -> u32 {
        let idx = self.sources.len() as u32;
        self.sources.push(path.to_string());
        self.sources_content.push(content.to_string());
        idx
    }

    fn add_line_mapping(&mut self, output_line: u32, source_idx: u32, source_line: u32) {
        self.mappings.push((output_line, source_idx, source_line));
    }

    fn generate(&self, file: &str) -> String {
        let mut mappings = String::new();
        let mut line = 0;
        let mut prev_source: i64 = 0;
        let mut prev_source_line: i64 = 0;

        for &(output_line, source_idx, source_line) in &self.mappings {
            while line < output_line {
                mappings.push(';');
                line += 1;
            }
            // Column fields are always 0: one segment at the start of each line.
            vlq_encode(0, &mut mappings);
            vlq_encode(i64::from(source_idx) - prev_source, &mut mappings);
            vlq_encode(i64::from(source_line) - prev_source_line, &mut mappings);
            vlq_encode(0, &mut mappings);
            prev_source = i64::from(source_idx);
            prev_source_line = i64::from(source_line);
        }

        json!({
            "version": 3,
            "file": file,
            "sources": self.sources,
            "sourcesContent": self.sources_content,
            "mappings": mappings,
        })
        .to_string()
    }
}
