//! Module dependency graph.
//!
//! Tracks modules, their dependency edges and the reverse importer index.
//! Cycles are legal; every traversal here uses an explicit stack.

use crate::error::BuildError;
use crate::loader::LoaderKind;
use crate::module_id::ModuleId;
use crate::scan::DependencyKind;
use kestrel_util::Fingerprint;
use rustc_hash::{FxHashMap as HashMap, FxHashSet as HashSet};
use serde::Serialize;
use std::collections::BTreeMap;

/// Rebuild state of a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleState {
    Fresh,
    Stale,
    Rebuilding,
    Errored,
    /// Dynamic-import target that has not been compiled yet.
    Lazy,
}

/// One dependency edge as written in the importer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependency {
    pub specifier: String,
    pub kind: DependencyKind,
    pub line: u32,
    /// `None` when resolution failed.
    pub resolved: Option<ModuleId>,
    pub external: bool,
}

impl Dependency {
    /// Resolved target, if any.
    #[must_use]
    pub fn target(&self) -> Option<&ModuleId> {
        self.resolved.as_ref()
    }
}

/// A module in the dependency graph.
#[derive(Debug, Clone)]
pub struct Module {
    pub id: ModuleId,
    /// Loader used, `None` for externals, lazy placeholders and failed loads.
    pub loader: Option<LoaderKind>,
    /// blake3 of the raw content.
    pub fingerprint: Option<Fingerprint>,
    /// Transformed JS body.
    pub code: String,
    /// Collected stylesheet text for css modules.
    pub css: Option<String>,
    /// Size in bytes of the transformed content.
    pub size: u64,
    pub external: bool,
    pub dependencies: Vec<Dependency>,
    pub errors: Vec<BuildError>,
    pub state: ModuleState,
}

impl Module {
    fn empty(id: ModuleId, state: ModuleState) -> Self {
        Self {
            id,
            loader: None,
            fingerprint: None,
            code: String::new(),
            css: None,
            size: 0,
            external: false,
            dependencies: Vec::new(),
            errors: Vec::new(),
            state,
        }
    }

    /// External node: never loaded, no edges.
    #[must_use]
    pub fn external(id: ModuleId) -> Self {
        let mut m = Self::empty(id, ModuleState::Fresh);
        m.external = true;
        m
    }

    /// Placeholder for a lazily compiled dynamic import target.
    #[must_use]
    pub fn lazy(id: ModuleId) -> Self {
        Self::empty(id, ModuleState::Lazy)
    }

    /// Node for a module that could not be loaded.
    #[must_use]
    pub fn failed(id: ModuleId, errors: Vec<BuildError>) -> Self {
        let mut m = Self::empty(id, ModuleState::Errored);
        m.errors = errors;
        m
    }

    #[must_use]
    pub fn is_lazy(&self) -> bool {
        self.state == ModuleState::Lazy
    }

    /// Resolved dependency ids, in source order, without duplicates.
    #[must_use]
    pub fn dependency_ids(&self) -> Vec<ModuleId> {
        let mut seen = HashSet::default();
        self.dependencies
            .iter()
            .filter_map(Dependency::target)
            .filter(|id| seen.insert((*id).clone()))
            .cloned()
            .collect()
    }

    /// Resolved ids reached through static edges.
    pub fn static_targets(&self) -> impl Iterator<Item = &ModuleId> {
        self.dependencies
            .iter()
            .filter(|d| d.kind.is_static())
            .filter_map(Dependency::target)
    }

    /// Resolved ids reached through dynamic imports.
    pub fn dynamic_targets(&self) -> impl Iterator<Item = &ModuleId> {
        self.dependencies
            .iter()
            .filter(|d| !d.kind.is_static())
            .filter_map(Dependency::target)
    }

    /// Every resolved target regardless of kind.
    pub fn all_targets(&self) -> impl Iterator<Item = &ModuleId> {
        self.dependencies.iter().filter_map(Dependency::target)
    }

    #[must_use]
    pub fn has_resolve_error(&self) -> bool {
        self.errors.iter().any(BuildError::is_resolve)
    }
}

/// The module dependency graph.
#[derive(Debug, Default, Clone)]
pub struct ModuleGraph {
    modules: HashMap<ModuleId, Module>,
    /// Imported id -> importer ids.
    importers: HashMap<ModuleId, HashSet<ModuleId>>,
    /// Path part of the id -> ids sharing it (query siblings).
    by_path: HashMap<String, HashSet<ModuleId>>,
    /// Entry name -> entry module, sorted by name.
    entries: Vec<(String, ModuleId)>,
    /// Entries whose specifier did not resolve.
    entry_errors: BTreeMap<String, BuildError>,
}

impl ModuleGraph {
    /// Create a new empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.modules.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    #[must_use]
    pub fn get(&self, id: &ModuleId) -> Option<&Module> {
        self.modules.get(id)
    }

    pub fn get_mut(&mut self, id: &ModuleId) -> Option<&mut Module> {
        self.modules.get_mut(id)
    }

    #[must_use]
    pub fn contains(&self, id: &ModuleId) -> bool {
        self.modules.contains_key(id)
    }

    /// Iterate over all modules in unspecified order.
    pub fn iter(&self) -> impl Iterator<Item = (&ModuleId, &Module)> {
        self.modules.iter()
    }

    pub fn modules_mut(&mut self) -> impl Iterator<Item = &mut Module> {
        self.modules.values_mut()
    }

    /// Module ids sorted, for deterministic output.
    #[must_use]
    pub fn sorted_ids(&self) -> Vec<ModuleId> {
        let mut ids: Vec<_> = self.modules.keys().cloned().collect();
        ids.sort();
        ids
    }

    #[must_use]
    pub fn entries(&self) -> &[(String, ModuleId)] {
        &self.entries
    }

    /// Record `name` as resolving to `id`. Entries stay sorted by name.
    pub fn set_entry(&mut self, name: &str, id: ModuleId) {
        self.entry_errors.remove(name);
        match self.entries.binary_search_by(|(n, _)| n.as_str().cmp(name)) {
            Ok(idx) => self.entries[idx].1 = id,
            Err(idx) => self.entries.insert(idx, (name.to_string(), id)),
        }
    }

    /// Record that entry `name` failed to resolve.
    pub fn set_entry_error(&mut self, name: &str, error: BuildError) {
        self.entries.retain(|(n, _)| n != name);
        self.entry_errors.insert(name.to_string(), error);
    }

    #[must_use]
    pub fn entry_errors(&self) -> &BTreeMap<String, BuildError> {
        &self.entry_errors
    }

    /// Ids that importers reach `id` through.
    #[must_use]
    pub fn importers_of(&self, id: &ModuleId) -> Vec<ModuleId> {
        let mut out: Vec<_> = self
            .importers
            .get(id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        out.sort();
        out
    }

    /// Every id whose path part equals `path`.
    #[must_use]
    pub fn ids_for_path(&self, path: &str) -> Vec<ModuleId> {
        let mut out: Vec<_> = self
            .by_path
            .get(path)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        out.sort();
        out
    }

    /// Insert or replace a module, keeping the reverse indexes in sync.
    ///
    /// Returns the module previously stored under the id.
    pub fn insert(&mut self, module: Module) -> Option<Module> {
        let id = module.id.clone();
        let previous = self.modules.remove(&id);
        if let Some(prev) = &previous {
            for target in prev.dependency_ids() {
                self.unlink(&id, &target);
            }
        }
        for target in module.dependency_ids() {
            self.importers.entry(target).or_default().insert(id.clone());
        }
        self.by_path
            .entry(id.path_str().to_string())
            .or_default()
            .insert(id.clone());
        self.modules.insert(id, module);
        previous
    }

    /// Remove a module and its outgoing edges.
    pub fn remove(&mut self, id: &ModuleId) -> Option<Module> {
        let module = self.modules.remove(id)?;
        for target in module.dependency_ids() {
            self.unlink(id, &target);
        }
        if let Some(set) = self.by_path.get_mut(id.path_str()) {
            set.remove(id);
            if set.is_empty() {
                self.by_path.remove(id.path_str());
            }
        }
        Some(module)
    }

    fn unlink(&mut self, importer: &ModuleId, target: &ModuleId) {
        if let Some(set) = self.importers.get_mut(target) {
            set.remove(importer);
            if set.is_empty() {
                self.importers.remove(target);
            }
        }
    }

    /// Ids reachable from the entries across every edge kind.
    #[must_use]
    pub fn reachable(&self) -> HashSet<ModuleId> {
        let mut marked = HashSet::default();
        let mut stack: Vec<ModuleId> = self.entries.iter().map(|(_, id)| id.clone()).collect();
        while let Some(id) = stack.pop() {
            if !marked.insert(id.clone()) {
                continue;
            }
            if let Some(module) = self.modules.get(&id) {
                for target in module.all_targets() {
                    if !marked.contains(target) {
                        stack.push(target.clone());
                    }
                }
            }
        }
        marked
    }

    /// Remove modules unreachable from every entry. Returns the removed ids, sorted.
    pub fn prune_unreachable(&mut self) -> Vec<ModuleId> {
        let marked = self.reachable();
        let mut dead: Vec<ModuleId> = self
            .modules
            .keys()
            .filter(|id| !marked.contains(*id))
            .cloned()
            .collect();
        dead.sort();
        for id in &dead {
            self.remove(id);
        }
        dead
    }

    /// Edge endpoints that have no node. Empty for a well-formed graph.
    #[must_use]
    pub fn dangling_edges(&self) -> Vec<(ModuleId, ModuleId)> {
        let mut out = Vec::new();
        for (id, module) in &self.modules {
            for target in module.all_targets() {
                if !self.modules.contains_key(target) {
                    out.push((id.clone(), target.clone()));
                }
            }
        }
        out.sort();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn module(id: &str, deps: &[(&str, DependencyKind)]) -> Module {
        let mut m = Module::empty(ModuleId::new(id), ModuleState::Fresh);
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

    fn ids(list: &[&str]) -> Vec<ModuleId> {
        list.iter().map(ModuleId::new).collect()
    }

    #[test]
    fn test_empty_graph() {
        let graph = ModuleGraph::new();
        assert!(graph.is_empty());
        assert_eq!(graph.len(), 0);
        assert!(graph.reachable().is_empty());
    }

    #[test]
    fn test_insert_tracks_importers() {
        let mut graph = ModuleGraph::new();
        graph.insert(module("/a.js", &[("/c.js", DependencyKind::Import)]));
        graph.insert(module("/b.js", &[("/c.js", DependencyKind::Require)]));
        graph.insert(module("/c.js", &[]));

        assert_eq!(graph.importers_of(&ModuleId::new("/c.js")), ids(&["/a.js", "/b.js"]));

        // Replacing /a.js without the edge drops it from the reverse index.
        graph.insert(module("/a.js", &[]));
        assert_eq!(graph.importers_of(&ModuleId::new("/c.js")), ids(&["/b.js"]));
    }

    #[test]
    fn test_query_siblings_share_path() {
        let mut graph = ModuleGraph::new();
        graph.insert(module("/src/index.js?0", &[]));
        graph.insert(module("/src/index.js?1", &[]));
        graph.insert(module("/src/other.js", &[]));

        assert_eq!(graph.len(), 3);
        assert_eq!(
            graph.ids_for_path("/src/index.js"),
            ids(&["/src/index.js?0", "/src/index.js?1"])
        );
    }

    #[test]
    fn test_cycle_reachability_terminates() {
        let mut graph = ModuleGraph::new();
        graph.insert(module("/a.js", &[("/b.js", DependencyKind::Import)]));
        graph.insert(module("/b.js", &[("/a.js", DependencyKind::Import)]));
        graph.set_entry("main", ModuleId::new("/a.js"));

        assert_eq!(graph.reachable().len(), 2);
        assert!(graph.prune_unreachable().is_empty());
    }

    #[test]
    fn test_prune_unreachable() {
        let mut graph = ModuleGraph::new();
        graph.insert(module("/a.js", &[("/b.js", DependencyKind::DynamicImport)]));
        graph.insert(module("/b.js", &[]));
        graph.insert(module("/orphan.js", &[("/leaf.js", DependencyKind::Import)]));
        graph.insert(module("/leaf.js", &[]));
        graph.set_entry("main", ModuleId::new("/a.js"));

        let removed = graph.prune_unreachable();
        assert_eq!(removed, ids(&["/leaf.js", "/orphan.js"]));
        assert_eq!(graph.len(), 2);
        assert!(graph.importers_of(&ModuleId::new("/leaf.js")).is_empty());
        assert!(graph.dangling_edges().is_empty());
    }

    #[test]
    fn test_static_and_dynamic_targets() {
        let m = module(
            "/a.js",
            &[
                ("/b.js", DependencyKind::Import),
                ("/c.js", DependencyKind::DynamicImport),
                ("/b.js", DependencyKind::ExportFrom),
            ],
        );
        assert_eq!(m.static_targets().cloned().collect::<Vec<_>>(), ids(&["/b.js", "/b.js"]));
        assert_eq!(m.dynamic_targets().cloned().collect::<Vec<_>>(), ids(&["/c.js"]));
        assert_eq!(m.dependency_ids(), ids(&["/b.js", "/c.js"]));
    }
}
