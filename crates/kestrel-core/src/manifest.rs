//! Build manifest.
//!
//! A [`BuildResult`] is a read-only snapshot of one build generation. It holds
//! no timestamps, so equal graphs produce equal results.

use crate::chunks::{ChunkGraph, ChunkKind};
use crate::error::{BuildError, Error, Result};
use crate::graph::{ModuleGraph, ModuleState};
use crate::loader::LoaderKind;
use crate::module_id::ModuleId;
use crate::render::{OutputFile, RenderedChunk};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;

/// A module-level error in reportable form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    pub code: String,
    pub message: String,
    /// Module the error is attached to; `None` for entry errors.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
}

impl Diagnostic {
    #[must_use]
    pub fn from_build_error(module: Option<&str>, error: &BuildError) -> Self {
        Self {
            code: error.code().to_string(),
            message: error.to_string(),
            module: module.map(ToString::to_string),
        }
    }
}

/// Per-module info.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleInfo {
    pub id: ModuleId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loader: Option<LoaderKind>,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    pub dependencies: Vec<ModuleId>,
    pub external: bool,
    pub state: ModuleState,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<Diagnostic>,
}

/// Per-chunk info.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkInfo {
    pub name: String,
    pub kind: ChunkKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entry: Option<ModuleId>,
    pub modules: Vec<ModuleId>,
    pub references: Vec<String>,
    pub dynamic_imports: Vec<String>,
    /// Emitted file names, main JS file first.
    pub files: Vec<String>,
    pub hash: String,
}

/// Snapshot of a build generation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildResult {
    /// No module reachable from an entry carries an error.
    pub success: bool,
    /// Entry name -> resolved entry module.
    pub entries: BTreeMap<String, ModuleId>,
    pub chunks: Vec<ChunkInfo>,
    /// Sorted by id.
    pub modules: Vec<ModuleInfo>,
    pub errors: Vec<Diagnostic>,
    #[serde(skip)]
    pub outputs: Vec<OutputFile>,
}

impl BuildResult {
    /// Snapshot `graph` with its partition and rendered output.
    #[must_use]
    pub fn assemble(graph: &ModuleGraph, chunks: &ChunkGraph, rendered: &[RenderedChunk]) -> Self {
        let mut errors: Vec<Diagnostic> = graph
            .entry_errors()
            .values()
            .map(|e| Diagnostic::from_build_error(None, e))
            .collect();

        let mut modules = Vec::with_capacity(graph.len());
        for id in graph.sorted_ids() {
            let Some(module) = graph.get(&id) else {
                continue;
            };
            let diagnostics: Vec<Diagnostic> = module
                .errors
                .iter()
                .map(|e| Diagnostic::from_build_error(Some(id.as_str()), e))
                .collect();
            errors.extend(diagnostics.iter().cloned());
            modules.push(ModuleInfo {
                id: id.clone(),
                loader: module.loader,
                size: module.size,
                fingerprint: module.fingerprint.map(|f| f.to_hex()),
                dependencies: module.dependency_ids(),
                external: module.external,
                state: module.state,
                errors: diagnostics,
            });
        }

        let chunk_infos = chunks
            .chunks()
            .iter()
            .map(|chunk| {
                let render = rendered.iter().find(|r| r.name == chunk.name);
                ChunkInfo {
                    name: chunk.name.clone(),
                    kind: chunk.kind,
                    entry: chunk.entry.clone(),
                    modules: chunk.modules.clone(),
                    references: chunk.references.clone(),
                    dynamic_imports: chunk.dynamic_imports.clone(),
                    files: render
                        .map(|r| r.files.iter().map(|f| f.file_name.clone()).collect())
                        .unwrap_or_default(),
                    hash: render.map(|r| r.hash.clone()).unwrap_or_default(),
                }
            })
            .collect();

        let outputs = rendered.iter().flat_map(|r| r.files.iter().cloned()).collect();

        Self {
            success: errors.is_empty(),
            entries: graph.entries().iter().cloned().collect(),
            chunks: chunk_infos,
            modules,
            errors,
            outputs,
        }
    }

    #[must_use]
    pub fn chunk(&self, name: &str) -> Option<&ChunkInfo> {
        self.chunks.iter().find(|c| c.name == name)
    }

    #[must_use]
    pub fn module(&self, id: &str) -> Option<&ModuleInfo> {
        self.modules
            .binary_search_by(|m| m.id.as_str().cmp(id))
            .ok()
            .map(|idx| &self.modules[idx])
    }

    /// Module whose id ends with `suffix`, for callers that only know a relative path.
    #[must_use]
    pub fn module_ending_with(&self, suffix: &str) -> Option<&ModuleInfo> {
        self.modules.iter().find(|m| m.id.as_str().ends_with(suffix))
    }

    #[must_use]
    pub fn output(&self, file_name: &str) -> Option<&OutputFile> {
        self.outputs.iter().find(|f| f.file_name == file_name)
    }

    /// Pretty JSON of the manifest (without file contents).
    ///
    /// # Errors
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Write every output file under `dir`, each one atomically.
    ///
    /// # Errors
    /// Returns [`Error::Io`] for the first file that cannot be written.
    pub fn write_outputs(&self, dir: &Path) -> Result<()> {
        for file in &self.outputs {
            let path = dir.join(&file.file_name);
            kestrel_util::fs::atomic_write(&path, file.content.as_bytes())
                .map_err(|source| Error::Io { path, source })?;
        }
        Ok(())
    }
}
