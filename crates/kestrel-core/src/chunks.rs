//! Chunk partitioning and the code-splitting policy.
//!
//! Without splitting, each entry gets one chunk holding everything reachable
//! from it, and chunks share nothing. With splitting:
//!
//! 1. entry chunks follow static edges only,
//! 2. every dynamic import target gets an async chunk,
//! 3. cache groups move modules shared between chunks into named chunks, in
//!    declared order, first claim wins.
//!
//! Member order is depth-first preorder, so the partition is deterministic.

use crate::config::{BundlerOptions, CacheGroup, ChunkScope};
use crate::graph::ModuleGraph;
use crate::module_id::ModuleId;
use regex_lite::Regex;
use rustc_hash::{FxHashMap as HashMap, FxHashSet as HashSet};
use serde::Serialize;
use std::path::Path;
use tracing::debug;

/// Role of a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkKind {
    Entry,
    Async,
    Shared,
}

/// A group of modules emitted together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub name: String,
    pub kind: ChunkKind,
    /// Entry module for entry and async chunks.
    pub entry: Option<ModuleId>,
    /// Members in traversal order.
    pub modules: Vec<ModuleId>,
    /// Shared chunks that must be loaded before this one.
    pub references: Vec<String>,
    /// Async chunks imported dynamically from this chunk's modules.
    pub dynamic_imports: Vec<String>,
}

impl Chunk {
    fn new(name: String, kind: ChunkKind, entry: Option<ModuleId>, modules: Vec<ModuleId>) -> Self {
        Self {
            name,
            kind,
            entry,
            modules,
            references: Vec::new(),
            dynamic_imports: Vec::new(),
        }
    }
}

/// Partitioning inputs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SplitOptions {
    pub code_splitting: bool,
    /// Rules in declared order.
    pub cache_groups: Vec<CacheGroup>,
}

impl SplitOptions {
    #[must_use]
    pub fn from_options(options: &BundlerOptions) -> Self {
        Self {
            code_splitting: options.code_splitting,
            cache_groups: options.effective_cache_groups(),
        }
    }
}

/// Chunks and the module -> chunk index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkGraph {
    chunks: Vec<Chunk>,
    module_to_chunks: HashMap<ModuleId, Vec<usize>>,
}

impl ChunkGraph {
    /// Partition `graph` into chunks.
    #[must_use]
    pub fn partition(graph: &ModuleGraph, options: &SplitOptions) -> Self {
        let chunks = if options.code_splitting {
            split(graph, &options.cache_groups)
        } else {
            graph
                .entries()
                .iter()
                .map(|(name, entry)| {
                    let modules = collect(graph, entry, true);
                    Chunk::new(name.clone(), ChunkKind::Entry, Some(entry.clone()), modules)
                })
                .collect()
        };

        let mut module_to_chunks: HashMap<ModuleId, Vec<usize>> = HashMap::default();
        for (idx, chunk) in chunks.iter().enumerate() {
            for id in &chunk.modules {
                module_to_chunks.entry(id.clone()).or_default().push(idx);
            }
        }

        Self {
            chunks,
            module_to_chunks,
        }
    }

    #[must_use]
    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Chunk> {
        self.chunks.iter().find(|c| c.name == name)
    }

    /// Names of the chunks holding `id`.
    #[must_use]
    pub fn chunks_for(&self, id: &ModuleId) -> Vec<&str> {
        self.module_to_chunks
            .get(id)
            .map(|idxs| idxs.iter().map(|&i| self.chunks[i].name.as_str()).collect())
            .unwrap_or_default()
    }

    /// Async chunk whose entry is `id`.
    #[must_use]
    pub fn async_chunk_for(&self, id: &ModuleId) -> Option<&Chunk> {
        self.chunks
            .iter()
            .find(|c| c.kind == ChunkKind::Async && c.entry.as_ref() == Some(id))
    }
}

/// Depth-first preorder from `start`, skipping externals and lazy placeholders.
fn collect(graph: &ModuleGraph, start: &ModuleId, follow_dynamic: bool) -> Vec<ModuleId> {
    let mut order = Vec::new();
    let mut seen = HashSet::default();
    let mut stack = vec![start.clone()];

    while let Some(id) = stack.pop() {
        if !seen.insert(id.clone()) {
            continue;
        }
        let Some(module) = graph.get(&id) else {
            continue;
        };
        if module.external || module.is_lazy() {
            continue;
        }
        order.push(id);

        let targets: Vec<&ModuleId> = if follow_dynamic {
            module.all_targets().collect()
        } else {
            module.static_targets().collect()
        };
        // Reversed so the first dependency is visited first.
        for target in targets.into_iter().rev() {
            if !seen.contains(target) {
                stack.push(target.clone());
            }
        }
    }

    order
}

fn split(graph: &ModuleGraph, groups: &[CacheGroup]) -> Vec<Chunk> {
    let mut names: HashSet<String> = HashSet::default();
    let mut chunks: Vec<Chunk> = Vec::new();

    for (name, entry) in graph.entries() {
        names.insert(name.clone());
        let modules = collect(graph, entry, false);
        chunks.push(Chunk::new(name.clone(), ChunkKind::Entry, Some(entry.clone()), modules));
    }

    // Async chunks, discovered in chunk order so naming is stable.
    let mut async_for: HashMap<ModuleId, usize> = HashMap::default();
    let mut cursor = 0;
    while cursor < chunks.len() {
        let members = chunks[cursor].modules.clone();
        let mut dynamic_imports = Vec::new();
        for id in &members {
            let Some(module) = graph.get(id) else {
                continue;
            };
            for target in module.dynamic_targets() {
                match graph.get(target) {
                    Some(m) if !m.external && !m.is_lazy() => {}
                    _ => continue,
                }
                let idx = if let Some(&idx) = async_for.get(target) {
                    idx
                } else {
                    let name = unique_name(&mut names, &chunk_stem(target));
                    let modules = collect(graph, target, false);
                    chunks.push(Chunk::new(name, ChunkKind::Async, Some(target.clone()), modules));
                    async_for.insert(target.clone(), chunks.len() - 1);
                    chunks.len() - 1
                };
                let name = chunks[idx].name.clone();
                if !dynamic_imports.contains(&name) {
                    dynamic_imports.push(name);
                }
            }
        }
        chunks[cursor].dynamic_imports = dynamic_imports;
        cursor += 1;
    }

    let mut claimed: HashSet<ModuleId> = HashSet::default();
    for group in groups {
        apply_cache_group(graph, group, &mut chunks, &mut names, &mut claimed);
    }

    chunks
}

fn apply_cache_group(
    graph: &ModuleGraph,
    group: &CacheGroup,
    chunks: &mut Vec<Chunk>,
    names: &mut HashSet<String>,
    claimed: &mut HashSet<ModuleId>,
) {
    // An invalid pattern matches nothing; validation reports it up front.
    let test = group.test.as_deref().map(|t| Regex::new(t).ok());
    let matches = |id: &ModuleId| match &test {
        None => true,
        Some(Some(re)) => re.is_match(id.as_str()),
        Some(None) => false,
    };

    let in_scope: Vec<usize> = chunks
        .iter()
        .enumerate()
        .filter(|(_, c)| match c.kind {
            ChunkKind::Entry => true,
            ChunkKind::Async => group.chunks == ChunkScope::All,
            ChunkKind::Shared => false,
        })
        .map(|(i, _)| i)
        .collect();

    let mut counts: HashMap<ModuleId, usize> = HashMap::default();
    let mut first_seen = Vec::new();
    for &i in &in_scope {
        for id in &chunks[i].modules {
            let count = counts.entry(id.clone()).or_insert(0);
            if *count == 0 {
                first_seen.push(id.clone());
            }
            *count += 1;
        }
    }

    let candidates: Vec<ModuleId> = first_seen
        .into_iter()
        .filter(|id| counts[id] >= group.min_chunks && !claimed.contains(id) && matches(id))
        .collect();
    if candidates.is_empty() {
        return;
    }

    let total: u64 = candidates
        .iter()
        .filter_map(|id| graph.get(id))
        .map(|m| m.size)
        .sum();
    if total < group.min_size {
        debug!(group = %group.name, total, min_size = group.min_size, "cache group below minSize");
        return;
    }

    let target = if let Some(idx) = chunks.iter().position(|c| c.name == group.name) {
        idx
    } else {
        names.insert(group.name.clone());
        chunks.push(Chunk::new(group.name.clone(), ChunkKind::Shared, None, Vec::new()));
        chunks.len() - 1
    };

    let moving: HashSet<&ModuleId> = candidates.iter().collect();
    for &i in &in_scope {
        if i == target {
            continue;
        }
        let chunk = &mut chunks[i];
        let before = chunk.modules.len();
        chunk.modules.retain(|id| !moving.contains(id));
        if chunk.modules.len() != before && !chunk.references.contains(&group.name) {
            chunk.references.push(group.name.clone());
        }
    }

    let existing: HashSet<ModuleId> = chunks[target].modules.iter().cloned().collect();
    for id in &candidates {
        if !existing.contains(id) {
            chunks[target].modules.push(id.clone());
        }
    }
    debug!(group = %group.name, modules = candidates.len(), total, "cache group claimed modules");
    claimed.extend(candidates);
}

fn chunk_stem(id: &ModuleId) -> String {
    Path::new(id.path_str())
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("chunk")
        .to_string()
}

fn unique_name(names: &mut HashSet<String>, base: &str) -> String {
    let mut name = base.to_string();
    let mut n = 1;
    while names.contains(&name) {
        name = format!("{base}-{n}");
        n += 1;
    }
    names.insert(name.clone());
    name
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Dependency, Module, ModuleState};
    use crate::scan::DependencyKind;

    fn module(id: &str, deps: &[(&str, DependencyKind)], size: u64) -> Module {
        let mut m = Module::failed(ModuleId::new(id), Vec::new());
        m.state = ModuleState::Fresh;
        m.size = size;
        m.dependencies = deps
            .iter()
            .map(|(target, kind)| Dependency {
                specifier: (*target).to_string(),
                kind: *kind,
                line: 1,
                resolved: Some(ModuleId::new(target)),
                external: false,
            })
            .collect();
        m
    }

    fn names(ids: &[ModuleId]) -> Vec<&str> {
        ids.iter().map(ModuleId::as_str).collect()
    }

    /// a -> shared, b -> shared, a -dyn-> page -> shared
    fn two_entry_graph() -> ModuleGraph {
        use DependencyKind::{DynamicImport, Import};
        let mut graph = ModuleGraph::new();
        graph.insert(module("/a.js", &[("/shared.js", Import), ("/page.js", DynamicImport)], 10));
        graph.insert(module("/b.js", &[("/shared.js", Import)], 10));
        graph.insert(module("/shared.js", &[("/util.js", Import)], 100));
        graph.insert(module("/util.js", &[], 5));
        graph.insert(module("/page.js", &[("/shared.js", Import)], 20));
        graph.set_entry("a", ModuleId::new("/a.js"));
        graph.set_entry("b", ModuleId::new("/b.js"));
        graph
    }

    #[test]
    fn test_no_splitting_duplicates_shared_modules() {
        let graph = two_entry_graph();
        let chunks = ChunkGraph::partition(&graph, &SplitOptions::default());

        assert_eq!(chunks.len(), 2);
        let a = chunks.get("a").unwrap();
        assert_eq!(names(&a.modules), ["/a.js", "/shared.js", "/util.js", "/page.js"]);
        let b = chunks.get("b").unwrap();
        assert_eq!(names(&b.modules), ["/b.js", "/shared.js", "/util.js"]);
        assert_eq!(chunks.chunks_for(&ModuleId::new("/shared.js")), ["a", "b"]);
    }

    #[test]
    fn test_splitting_extracts_shared_once() {
        let graph = two_entry_graph();
        let options = SplitOptions {
            code_splitting: true,
            cache_groups: vec![CacheGroup::new("vendor")],
        };
        let chunks = ChunkGraph::partition(&graph, &options);

        let vendor = chunks.get("vendor").unwrap();
        assert_eq!(vendor.kind, ChunkKind::Shared);
        assert_eq!(names(&vendor.modules), ["/shared.js", "/util.js"]);
        assert_eq!(chunks.chunks_for(&ModuleId::new("/shared.js")), ["page", "vendor"]);

        let a = chunks.get("a").unwrap();
        assert_eq!(names(&a.modules), ["/a.js"]);
        assert_eq!(a.references, ["vendor"]);
        assert_eq!(a.dynamic_imports, ["page"]);

        // Initial scope leaves the async chunk alone.
        let page = chunks.get("page").unwrap();
        assert_eq!(page.kind, ChunkKind::Async);
        assert_eq!(names(&page.modules), ["/page.js", "/shared.js", "/util.js"]);
        assert!(page.references.is_empty());
    }

    #[test]
    fn test_all_scope_includes_async_chunks() {
        let graph = two_entry_graph();
        let options = SplitOptions {
            code_splitting: true,
            cache_groups: vec![CacheGroup::new("common").with_chunks(ChunkScope::All)],
        };
        let chunks = ChunkGraph::partition(&graph, &options);
        assert_eq!(names(&chunks.get("page").unwrap().modules), ["/page.js"]);
        assert_eq!(chunks.chunks_for(&ModuleId::new("/util.js")), ["common"]);
    }

    #[test]
    fn test_min_size_blocks_extraction() {
        let graph = two_entry_graph();
        let options = SplitOptions {
            code_splitting: true,
            cache_groups: vec![CacheGroup::new("vendor").with_min_size(1000)],
        };
        let chunks = ChunkGraph::partition(&graph, &options);
        assert!(chunks.get("vendor").is_none());
        assert_eq!(chunks.chunks_for(&ModuleId::new("/shared.js")), ["a", "b", "page"]);
    }

    #[test]
    fn test_first_rule_wins() {
        let graph = two_entry_graph();
        let options = SplitOptions {
            code_splitting: true,
            cache_groups: vec![
                CacheGroup::new("utils").with_test("util"),
                CacheGroup::new("rest"),
            ],
        };
        let chunks = ChunkGraph::partition(&graph, &options);
        assert_eq!(names(&chunks.get("utils").unwrap().modules), ["/util.js"]);
        assert_eq!(names(&chunks.get("rest").unwrap().modules), ["/shared.js"]);
        assert_eq!(chunks.get("b").unwrap().references, ["utils", "rest"]);
    }

    #[test]
    fn test_name_collision_merges() {
        let graph = two_entry_graph();
        let options = SplitOptions {
            code_splitting: true,
            cache_groups: vec![CacheGroup::new("a")],
        };
        let chunks = ChunkGraph::partition(&graph, &options);
        assert_eq!(chunks.len(), 3);
        let a = chunks.get("a").unwrap();
        assert_eq!(a.kind, ChunkKind::Entry);
        assert_eq!(names(&a.modules), ["/a.js", "/shared.js", "/util.js"]);
        assert_eq!(names(&chunks.get("b").unwrap().modules), ["/b.js"]);
        assert_eq!(chunks.get("b").unwrap().references, ["a"]);
    }

    #[test]
    fn test_async_name_collision_gets_suffix() {
        use DependencyKind::DynamicImport;
        let mut graph = ModuleGraph::new();
        graph.insert(module(
            "/main.js",
            &[("/x/page.js", DynamicImport), ("/y/page.js", DynamicImport)],
            1,
        ));
        graph.insert(module("/x/page.js", &[], 1));
        graph.insert(module("/y/page.js", &[], 1));
        graph.set_entry("page", ModuleId::new("/main.js"));

        let options = SplitOptions {
            code_splitting: true,
            cache_groups: Vec::new(),
        };
        let chunks = ChunkGraph::partition(&graph, &options);
        let all: Vec<_> = chunks.chunks().iter().map(|c| c.name.as_str()).collect();
        assert_eq!(all, ["page", "page-1", "page-2"]);
        assert_eq!(
            chunks.async_chunk_for(&ModuleId::new("/y/page.js")).unwrap().name,
            "page-2"
        );
    }

    #[test]
    fn test_cycle_partition_terminates() {
        use DependencyKind::Import;
        let mut graph = ModuleGraph::new();
        graph.insert(module("/a.js", &[("/b.js", Import)], 1));
        graph.insert(module("/b.js", &[("/a.js", Import)], 1));
        graph.set_entry("main", ModuleId::new("/a.js"));

        let chunks = ChunkGraph::partition(&graph, &SplitOptions::default());
        assert_eq!(names(&chunks.get("main").unwrap().modules), ["/a.js", "/b.js"]);
    }
}
