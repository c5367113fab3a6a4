//! Incremental rebuild support.
//!
//! A change notification marks every module backed by the changed file
//! `Stale`, along with modules holding resolve errors (a new file may satisfy
//! them). The builder then reprocesses exactly those ids. Fingerprints and
//! dependency lists decide what was touched, and chunk membership and rendered
//! output are reused wherever nothing they depend on was touched.

use crate::builder::BuildDelta;
use crate::chunks::{ChunkGraph, SplitOptions};
use crate::graph::{ModuleGraph, ModuleState};
use crate::module_id::ModuleId;
use crate::render::{RenderedChunk, Renderer};
use std::path::Path;
use tracing::debug;

/// Counters describing the last build or rebuild.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RebuildStats {
    /// Ids marked stale by the change.
    pub stale: Vec<ModuleId>,
    /// Ids run through the pipeline.
    pub processed: usize,
    /// Ids whose content or dependencies changed, or that are new. Sorted.
    pub touched: Vec<ModuleId>,
    /// Ids removed as unreachable. Sorted.
    pub pruned: Vec<ModuleId>,
    /// Whether chunk membership was recomputed.
    pub repartitioned: bool,
    /// Chunks rendered again, in chunk order.
    pub rerendered: Vec<String>,
}

/// Mark modules affected by a change to `path` as stale and return them, sorted.
///
/// `path` must already be absolute. Lazy placeholders and externals are never
/// marked: they have no loaded content.
pub fn mark_stale(graph: &mut ModuleGraph, path: &Path) -> Vec<ModuleId> {
    let canonical = dunce::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    let mut stale = graph.ids_for_path(&canonical.display().to_string());
    if canonical != path {
        stale.extend(graph.ids_for_path(&path.display().to_string()));
    }
    stale.extend(
        graph
            .iter()
            .filter(|(_, m)| m.has_resolve_error())
            .map(|(id, _)| id.clone()),
    );
    stale.sort();
    stale.dedup();

    stale.retain(|id| {
        graph
            .get_mut(id)
            .filter(|m| !m.external && !m.is_lazy())
            .map(|m| m.state = ModuleState::Stale)
            .is_some()
    });
    stale
}

/// Final state for every loaded module: `Errored` with errors, else `Fresh`.
pub fn settle_states(graph: &mut ModuleGraph) {
    for module in graph.modules_mut() {
        if module.is_lazy() {
            continue;
        }
        module.state = if module.errors.is_empty() {
            ModuleState::Fresh
        } else {
            ModuleState::Errored
        };
    }
}

/// New partition and rendered output after a pass that produced `delta`.
///
/// Membership is reused when neither topology nor sizes changed. A chunk keeps
/// its previous output when it is unchanged and has no touched member.
pub fn update_chunks(
    previous: &ChunkGraph,
    previous_rendered: &[RenderedChunk],
    graph: &ModuleGraph,
    split: &SplitOptions,
    delta: &BuildDelta,
    renderer: &Renderer,
    stats: &mut RebuildStats,
) -> (ChunkGraph, Vec<RenderedChunk>) {
    let repartition = delta.topology_changed || delta.size_changed || previous.is_empty();
    let chunks = if repartition {
        ChunkGraph::partition(graph, split)
    } else {
        previous.clone()
    };
    stats.repartitioned = repartition;

    let mut rendered = Vec::with_capacity(chunks.len());
    for chunk in chunks.chunks() {
        let reusable = previous.get(&chunk.name).is_some_and(|prev| prev == chunk)
            && !chunk.modules.iter().any(|id| delta.touched.contains(id));
        let prior = previous_rendered.iter().find(|r| r.name == chunk.name);
        match prior {
            Some(prior) if reusable => rendered.push(prior.clone()),
            _ => {
                debug!(chunk = %chunk.name, "rendering chunk");
                stats.rerendered.push(chunk.name.clone());
                rendered.push(renderer.render_chunk(chunk, graph, &chunks));
            }
        }
    }
    (chunks, rendered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BuildError;
    use crate::graph::{Dependency, Module};
    use crate::render::{RenderOptions, WhitespaceMinifier};
    use crate::scan::DependencyKind;
    use std::path::PathBuf;
    use std::sync::Arc;

    fn module(id: &str, deps: &[&str]) -> Module {
        let mut m = Module::failed(ModuleId::new(id), Vec::new());
        m.state = ModuleState::Fresh;
        m.code = format!("// {id}");
        m.dependencies = deps
            .iter()
            .map(|t| Dependency {
                specifier: (*t).to_string(),
                kind: DependencyKind::Import,
                line: 1,
                resolved: Some(ModuleId::new(t)),
                external: false,
            })
            .collect();
        m
    }

    fn renderer() -> Renderer {
        Renderer::new(
            RenderOptions {
                root: PathBuf::from("/"),
                entry_filename: "[name].js".to_string(),
                minify: false,
                source_map: false,
                refresh: false,
                inline_style: false,
            },
            Arc::new(WhitespaceMinifier),
        )
    }

    #[test]
    fn test_mark_stale_includes_query_siblings_and_resolve_errors() {
        let mut graph = ModuleGraph::new();
        graph.insert(module("/nonexistent/index.js?0", &[]));
        graph.insert(module("/nonexistent/index.js?1", &[]));
        graph.insert(module("/nonexistent/other.js", &[]));
        let mut broken = module("/nonexistent/broken.js", &[]);
        broken.errors.push(BuildError::Resolve {
            importer: "/nonexistent/broken.js".to_string(),
            specifier: "./late".to_string(),
            reason: "module not found".to_string(),
        });
        graph.insert(broken);
        graph.insert(Module::lazy(ModuleId::new("/nonexistent/lazy.js")));

        let stale = mark_stale(&mut graph, Path::new("/nonexistent/index.js"));
        let stale: Vec<_> = stale.iter().map(ModuleId::as_str).collect();
        assert_eq!(
            stale,
            [
                "/nonexistent/broken.js",
                "/nonexistent/index.js?0",
                "/nonexistent/index.js?1"
            ]
        );
        assert_eq!(
            graph.get(&ModuleId::new("/nonexistent/index.js?0")).unwrap().state,
            ModuleState::Stale
        );
        assert_eq!(
            graph.get(&ModuleId::new("/nonexistent/other.js")).unwrap().state,
            ModuleState::Fresh
        );

        assert!(mark_stale(&mut graph, Path::new("/nonexistent/lazy.js"))
            .iter()
            .all(|id| id.as_str() != "/nonexistent/lazy.js"));
    }

    #[test]
    fn test_settle_states() {
        let mut graph = ModuleGraph::new();
        let mut ok = module("/a.js", &[]);
        ok.state = ModuleState::Rebuilding;
        graph.insert(ok);
        graph.insert(Module::failed(
            ModuleId::new("/b.js"),
            vec![BuildError::load("/b.js", "gone")],
        ));
        graph.insert(Module::lazy(ModuleId::new("/c.js")));

        settle_states(&mut graph);
        assert_eq!(graph.get(&ModuleId::new("/a.js")).unwrap().state, ModuleState::Fresh);
        assert_eq!(graph.get(&ModuleId::new("/b.js")).unwrap().state, ModuleState::Errored);
        assert_eq!(graph.get(&ModuleId::new("/c.js")).unwrap().state, ModuleState::Lazy);
    }

    #[test]
    fn test_update_chunks_rerenders_only_touched() {
        let mut graph = ModuleGraph::new();
        graph.insert(module("/a.js", &["/x.js"]));
        graph.insert(module("/b.js", &[]));
        graph.insert(module("/x.js", &[]));
        graph.set_entry("a", ModuleId::new("/a.js"));
        graph.set_entry("b", ModuleId::new("/b.js"));

        let split = SplitOptions::default();
        let renderer = renderer();
        let mut stats = RebuildStats::default();
        let (chunks, rendered) = update_chunks(
            &ChunkGraph::default(),
            &[],
            &graph,
            &split,
            &BuildDelta::default(),
            &renderer,
            &mut stats,
        );
        assert!(stats.repartitioned);
        assert_eq!(stats.rerendered, ["a", "b"]);

        let mut changed = module("/x.js", &[]);
        changed.code = "// changed".to_string();
        graph.insert(changed);
        let mut delta = BuildDelta::default();
        delta.touched.insert(ModuleId::new("/x.js"));

        let mut stats = RebuildStats::default();
        let (next_chunks, next_rendered) =
            update_chunks(&chunks, &rendered, &graph, &split, &delta, &renderer, &mut stats);
        assert!(!stats.repartitioned);
        assert_eq!(stats.rerendered, ["a"]);
        assert_eq!(next_chunks, chunks);
        assert_eq!(next_rendered[1], rendered[1]);
        assert_ne!(next_rendered[0], rendered[0]);
    }
}
