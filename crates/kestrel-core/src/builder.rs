//! Concurrent module graph construction.
//!
//! A single coordinator owns the [`ModuleGraph`] and the visited set. Every
//! newly discovered id is processed by a spawned task that loads, transforms,
//! extracts dependencies and resolves all of them concurrently, then reports
//! back over an unbounded channel. Only the coordinator inserts, so
//! insert-if-absent is atomic per id and duplicates only contribute an edge.
//!
//! The build is quiescent once the in-flight counter reaches zero.

use crate::config::BundlerOptions;
use crate::error::BuildError;
use crate::graph::{Dependency, Module, ModuleGraph, ModuleState};
use crate::loader::{extract_dependencies, LoaderKind, LoaderPipeline, Transform, TransformOptions};
use crate::module_id::{split_query, ModuleId};
use crate::plugin::PluginBridge;
use crate::progress::{ProgressEvent, ProgressSink};
use crate::resolver::{ResolveOutcome, ResolverSet};
use futures::future::join_all;
use futures::FutureExt;
use rustc_hash::FxHashSet as HashSet;
use std::any::Any;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Everything a module task needs. Shared read-only between tasks.
#[derive(Debug)]
pub struct BuildContext {
    pub resolver: ResolverSet,
    pub loader: LoaderPipeline,
    pub lazy_compilation: bool,
    pub progress: ProgressSink,
    pub cancel: CancellationToken,
}

impl BuildContext {
    /// `root` must be absolute and canonical.
    #[must_use]
    pub fn new(
        options: &BundlerOptions,
        root: PathBuf,
        bridge: Arc<PluginBridge>,
        progress: ProgressSink,
        cancel: CancellationToken,
    ) -> Self {
        let transform_options = TransformOptions {
            inline_style: options.inline_style,
            svgr: options.svgr,
        };
        Self {
            resolver: ResolverSet::new(options, root, Arc::clone(&bridge)),
            loader: LoaderPipeline::new(options.loader_map(), transform_options, bridge),
            lazy_compilation: options.lazy_compilation,
            progress,
            cancel,
        }
    }

    /// Replace the transform used for `kind`.
    pub fn register_transform(&mut self, kind: LoaderKind, transform: Arc<dyn Transform>) {
        self.loader.register(kind, transform);
    }
}

/// Run one module through load -> transform -> extract -> resolve.
///
/// Never fails: problems are attached to the returned module.
pub async fn process_module(ctx: &BuildContext, id: ModuleId) -> Module {
    let mut errors = Vec::new();

    let loaded = ctx.loader.load(&id).await;
    errors.extend(loaded.hook_error);
    let source = match loaded.result {
        Ok(source) => source,
        Err(e) => {
            errors.push(e);
            return Module::failed(id, errors);
        }
    };

    let fingerprint = kestrel_util::fingerprint(&source.content);
    let transformed = match ctx.loader.transform(&id, &source) {
        Ok(t) => t,
        Err(e) => {
            errors.push(e);
            let mut module = Module::failed(id, errors);
            module.loader = Some(source.loader);
            module.fingerprint = Some(fingerprint);
            return module;
        }
    };

    let specs = match extract_dependencies(&id, source.loader, &transformed) {
        Ok(specs) => specs,
        Err(e) => {
            errors.push(e);
            Vec::new()
        }
    };

    let base_dir = id.dir();
    let resolutions = join_all(
        specs
            .iter()
            .map(|spec| ctx.resolver.resolve(&spec.specifier, Some(&id), &base_dir)),
    )
    .await;

    let mut dependencies = Vec::with_capacity(specs.len());
    for (spec, resolution) in specs.into_iter().zip(resolutions) {
        errors.extend(resolution.hook_error);
        let (resolved, external) = match resolution.outcome {
            ResolveOutcome::Resolved(m) => (Some(m.id), m.external),
            ResolveOutcome::Unresolved(e) => {
                errors.push(e.into());
                (None, false)
            }
        };
        dependencies.push(Dependency {
            specifier: spec.specifier,
            kind: spec.kind,
            line: spec.line,
            resolved,
            external,
        });
    }

    let size = transformed.code.len() + transformed.css.as_ref().map_or(0, String::len);
    let state = if errors.is_empty() {
        ModuleState::Fresh
    } else {
        ModuleState::Errored
    };

    Module {
        id,
        loader: Some(source.loader),
        fingerprint: Some(fingerprint),
        code: transformed.code,
        css: transformed.css,
        size: size as u64,
        external: false,
        dependencies,
        errors,
        state,
    }
}

/// What a builder run changed.
#[derive(Debug, Default)]
pub struct BuildDelta {
    /// Ids run through the pipeline, in completion order.
    pub processed: Vec<ModuleId>,
    /// New modules and modules whose content or dependency list changed.
    pub touched: HashSet<ModuleId>,
    /// A node or edge was added or removed.
    pub topology_changed: bool,
    /// Some module's transformed size changed.
    pub size_changed: bool,
}

#[derive(Debug)]
enum Msg {
    Done(Box<Module>),
    Panicked { id: ModuleId, reason: String },
}

/// Coordinator for one build or rebuild pass over `graph`.
pub struct GraphBuilder<'a> {
    ctx: Arc<BuildContext>,
    graph: &'a mut ModuleGraph,
    visited: HashSet<ModuleId>,
    /// Dynamic targets compiled even under lazy compilation.
    eager: HashSet<ModuleId>,
    remaining: usize,
    spawned: usize,
    finished: usize,
    tx: mpsc::UnboundedSender<Msg>,
    rx: mpsc::UnboundedReceiver<Msg>,
    delta: BuildDelta,
}

impl<'a> GraphBuilder<'a> {
    pub fn new(ctx: Arc<BuildContext>, graph: &'a mut ModuleGraph) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            ctx,
            graph,
            visited: HashSet::default(),
            eager: HashSet::default(),
            remaining: 0,
            spawned: 0,
            finished: 0,
            tx,
            rx,
            delta: BuildDelta::default(),
        }
    }

    /// Resolve entries from the root and queue the ones not in the graph yet.
    pub async fn seed_entries(&mut self, entries: &BTreeMap<String, String>) {
        let ctx = Arc::clone(&self.ctx);
        let root = ctx.resolver.root().to_path_buf();
        let resolved = join_all(entries.iter().map(|(name, spec)| {
            let ctx = &ctx;
            let root = &root;
            async move {
                let spec = entry_specifier(root, spec);
                (name, spec.clone(), ctx.resolver.resolve(&spec, None, root).await)
            }
        }))
        .await;

        for (name, spec, resolution) in resolved {
            match resolution.outcome {
                ResolveOutcome::Resolved(m) if m.external => {
                    self.graph.set_entry_error(
                        name,
                        BuildError::Resolve {
                            importer: root.display().to_string(),
                            specifier: spec,
                            reason: "entry cannot be external".to_string(),
                        },
                    );
                }
                ResolveOutcome::Resolved(m) => {
                    if let Some(e) = resolution.hook_error {
                        warn!(entry = %name, error = %e, "onResolve failed for entry, used default resolution");
                    }
                    self.graph.set_entry(name, m.id.clone());
                    self.enqueue(m.id);
                }
                ResolveOutcome::Unresolved(e) => {
                    debug!(entry = %name, error = %e, "entry did not resolve");
                    self.graph.set_entry_error(name, e.into());
                }
            }
        }
    }

    /// Compile these dynamic import targets even under lazy compilation.
    pub fn compile_eagerly(&mut self, ids: impl IntoIterator<Item = ModuleId>) {
        self.eager.extend(ids);
    }

    /// Run `id` through the pipeline again even though it is in the graph.
    pub fn reprocess(&mut self, id: ModuleId) {
        if !self.visited.contains(&id) {
            self.spawn(id);
        }
    }

    /// Queue `id` unless it is already known. Lazy placeholders get compiled.
    fn enqueue(&mut self, id: ModuleId) {
        if self.visited.contains(&id) {
            return;
        }
        match self.graph.get(&id) {
            Some(m) if !m.is_lazy() => {}
            _ => self.spawn(id),
        }
    }

    fn spawn(&mut self, id: ModuleId) {
        self.visited.insert(id.clone());
        if self.ctx.cancel.is_cancelled() {
            let error = BuildError::load(id.as_str(), "build cancelled");
            self.record(Module::failed(id, vec![error]));
            return;
        }
        if let Some(m) = self.graph.get_mut(&id) {
            m.state = ModuleState::Rebuilding;
        }

        self.remaining += 1;
        self.spawned += 1;
        trace!(id = %id, "spawning module task");

        let ctx = Arc::clone(&self.ctx);
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let msg = match AssertUnwindSafe(process_module(&ctx, id.clone()))
                .catch_unwind()
                .await
            {
                Ok(module) => Msg::Done(Box::new(module)),
                Err(payload) => Msg::Panicked {
                    id,
                    reason: panic_message(payload.as_ref()),
                },
            };
            // The coordinator holds a sender, so the channel is open.
            let _ = tx.send(msg);
        });
    }

    /// Drive the worklist to quiescence.
    pub async fn run(mut self) -> BuildDelta {
        while self.remaining > 0 {
            let Some(msg) = self.rx.recv().await else {
                break;
            };
            self.remaining -= 1;
            self.finished += 1;

            let module = match msg {
                Msg::Done(module) => *module,
                Msg::Panicked { id, reason } => {
                    warn!(id = %id, reason = %reason, "module task panicked");
                    let error = BuildError::load(id.as_str(), format!("internal error: {reason}"));
                    Module::failed(id, vec![error])
                }
            };
            self.ctx.progress.emit(ProgressEvent::ModuleDone {
                done: self.finished,
                total: self.spawned,
            });
            self.handle_done(module);
        }
        self.delta
    }

    fn handle_done(&mut self, module: Module) {
        debug!(
            id = %module.id,
            deps = module.dependencies.len(),
            errors = module.errors.len(),
            "module processed"
        );

        for dep in &module.dependencies {
            let Some(target) = dep.target() else {
                continue;
            };
            if dep.external {
                if !self.graph.contains(target) {
                    self.record(Module::external(target.clone()));
                }
                continue;
            }
            if self.ctx.lazy_compilation && !dep.kind.is_static() && !self.eager.contains(target) {
                if !self.graph.contains(target) && !self.visited.contains(target) {
                    trace!(id = %target, "deferring dynamic import");
                    self.record(Module::lazy(target.clone()));
                }
                continue;
            }
            self.enqueue(target.clone());
        }

        self.delta.processed.push(module.id.clone());
        self.record(module);
    }

    fn record(&mut self, module: Module) {
        let id = module.id.clone();
        match self.graph.get(&id) {
            None => {
                self.delta.topology_changed = true;
                self.delta.touched.insert(id);
            }
            Some(prev) => {
                let deps_changed = prev.dependency_ids() != module.dependency_ids();
                let lazy_changed = prev.is_lazy() != module.is_lazy();
                if deps_changed || lazy_changed {
                    self.delta.topology_changed = true;
                }
                if deps_changed || lazy_changed || prev.fingerprint != module.fingerprint {
                    self.delta.touched.insert(id);
                }
                if prev.size != module.size {
                    self.delta.size_changed = true;
                }
            }
        }
        self.graph.insert(module);
    }
}

/// Entries written as `src/main.js` name a file under the root, not a package.
fn entry_specifier(root: &Path, spec: &str) -> String {
    let (path, _) = split_query(spec);
    let explicit = spec.starts_with('.') || Path::new(path).is_absolute();
    if !explicit && root.join(path).is_file() {
        format!("./{spec}")
    } else {
        spec.to_string()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::{HookResult, HostHooks, OnLoadArgs, OnLoadResult, OnResolveArgs, OnResolveResult};
    use async_trait::async_trait;
    use std::fs;
    use std::sync::Mutex;
    use tempfile::tempdir;

    /// Counts load requests per id and answers "none".
    #[derive(Default)]
    struct LoadCounter {
        loads: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl HostHooks for LoadCounter {
        async fn on_resolve(&self, args: OnResolveArgs) -> HookResult<Option<OnResolveResult>> {
            Ok((args.importee == "virtual:x").then(|| OnResolveResult::external("virtual:x")))
        }

        async fn on_load(&self, args: OnLoadArgs) -> HookResult<Option<OnLoadResult>> {
            self.loads.lock().unwrap().push(args.id);
            Ok(None)
        }
    }

    fn context(root: &Path, options: &BundlerOptions, hooks: Option<Arc<dyn HostHooks>>) -> Arc<BuildContext> {
        let bridge = Arc::new(PluginBridge::new(hooks, CancellationToken::new(), None));
        Arc::new(BuildContext::new(
            options,
            dunce::canonicalize(root).unwrap(),
            bridge,
            ProgressSink::default(),
            CancellationToken::new(),
        ))
    }

    async fn build(ctx: Arc<BuildContext>, entries: &BTreeMap<String, String>) -> (ModuleGraph, BuildDelta) {
        let mut graph = ModuleGraph::new();
        let mut builder = GraphBuilder::new(ctx, &mut graph);
        builder.seed_entries(entries).await;
        let delta = builder.run().await;
        (graph, delta)
    }

    fn entries(list: &[(&str, &str)]) -> BTreeMap<String, String> {
        list.iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[tokio::test]
    async fn test_cycle_and_shared_module_processed_once() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.js"), "import './b';\nimport './shared';").unwrap();
        fs::write(dir.path().join("b.js"), "import './a';\nimport './shared';").unwrap();
        fs::write(dir.path().join("shared.js"), "export const s = 1;").unwrap();

        let counter = Arc::new(LoadCounter::default());
        let ctx = context(dir.path(), &BundlerOptions::default(), Some(counter.clone()));
        let (graph, delta) = build(ctx, &entries(&[("a", "./a.js"), ("b", "./b.js")])).await;

        assert_eq!(graph.len(), 3);
        assert_eq!(delta.processed.len(), 3);
        let mut loads = counter.loads.lock().unwrap().clone();
        loads.sort();
        loads.dedup();
        assert_eq!(loads.len(), counter.loads.lock().unwrap().len());
        assert!(graph.dangling_edges().is_empty());
    }

    #[tokio::test]
    async fn test_query_suffixed_entries_are_distinct() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("index.js"), "export default 1;").unwrap();

        let counter = Arc::new(LoadCounter::default());
        let ctx = context(dir.path(), &BundlerOptions::default(), Some(counter.clone()));
        let (graph, _) = build(ctx, &entries(&[("a", "./index?0"), ("b", "./index?1")])).await;

        assert_eq!(graph.len(), 2);
        let ids: Vec<_> = graph.sorted_ids().iter().map(ToString::to_string).collect();
        assert!(ids[0].ends_with("index.js?0"));
        assert!(ids[1].ends_with("index.js?1"));
        assert_eq!(counter.loads.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_external_from_hook_is_never_loaded() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("main.js"), "import 'virtual:x';").unwrap();

        let counter = Arc::new(LoadCounter::default());
        let ctx = context(dir.path(), &BundlerOptions::default(), Some(counter.clone()));
        let (graph, _) = build(ctx, &entries(&[("main", "main.js")])).await;

        let ext = graph.get(&ModuleId::new("virtual:x")).unwrap();
        assert!(ext.external);
        assert!(ext.errors.is_empty());
        assert!(ext.dependencies.is_empty());
        assert!(!counter.loads.lock().unwrap().iter().any(|id| id == "virtual:x"));
    }

    #[tokio::test]
    async fn test_unresolved_error_attaches_to_importer() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("main.js"), "import './missing';\nimport './ok';").unwrap();
        fs::write(dir.path().join("ok.js"), "").unwrap();

        let ctx = context(dir.path(), &BundlerOptions::default(), None);
        let (graph, _) = build(ctx, &entries(&[("main", "./main.js")])).await;

        assert_eq!(graph.len(), 2);
        let (_, main) = graph.entries()[0].clone();
        let main = graph.get(&main).unwrap();
        assert_eq!(main.state, ModuleState::Errored);
        assert_eq!(main.errors.len(), 1);
        assert!(main.errors[0].is_resolve());
        assert!(main.dependencies[0].resolved.is_none());
    }

    #[tokio::test]
    async fn test_unresolved_entry_is_recorded() {
        let dir = tempdir().unwrap();
        let ctx = context(dir.path(), &BundlerOptions::default(), None);
        let (graph, _) = build(ctx, &entries(&[("main", "./nope.js")])).await;

        assert!(graph.is_empty());
        assert!(graph.entries().is_empty());
        assert!(graph.entry_errors()["main"].is_resolve());
    }

    #[tokio::test]
    async fn test_lazy_dynamic_import_becomes_placeholder() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("main.js"), "import('./page');").unwrap();
        fs::write(dir.path().join("page.js"), "import './deep';").unwrap();
        fs::write(dir.path().join("deep.js"), "").unwrap();

        let options = BundlerOptions::default().with_lazy_compilation(true);
        let ctx = context(dir.path(), &options, None);
        let (graph, _) = build(ctx, &entries(&[("main", "./main.js")])).await;

        assert_eq!(graph.len(), 2);
        let page = graph
            .iter()
            .find(|(id, _)| id.as_str().ends_with("page.js"))
            .map(|(_, m)| m)
            .unwrap();
        assert_eq!(page.state, ModuleState::Lazy);
    }

    #[tokio::test]
    async fn test_reprocess_reports_untouched_for_same_content() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("main.js"), "import './dep';").unwrap();
        fs::write(dir.path().join("dep.js"), "export {};").unwrap();

        let ctx = context(dir.path(), &BundlerOptions::default(), None);
        let (mut graph, _) = build(Arc::clone(&ctx), &entries(&[("main", "./main.js")])).await;
        let (_, main) = graph.entries()[0].clone();

        let mut builder = GraphBuilder::new(Arc::clone(&ctx), &mut graph);
        builder.reprocess(main.clone());
        let delta = builder.run().await;
        assert_eq!(delta.processed, vec![main.clone()]);
        assert!(delta.touched.is_empty());
        assert!(!delta.topology_changed);

        fs::write(dir.path().join("main.js"), "import './dep';\nimport './extra';").unwrap();
        fs::write(dir.path().join("extra.js"), "").unwrap();
        ctx.resolver.clear_cache();
        let mut builder = GraphBuilder::new(ctx, &mut graph);
        builder.reprocess(main.clone());
        let delta = builder.run().await;
        assert!(delta.topology_changed);
        assert_eq!(delta.touched.len(), 2);
        assert_eq!(graph.len(), 3);
    }

    #[tokio::test]
    async fn test_cancelled_context_spawns_nothing() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("main.js"), "").unwrap();
        let ctx = context(dir.path(), &BundlerOptions::default(), None);
        ctx.cancel.cancel();

        let (graph, delta) = build(ctx, &entries(&[("main", "./main.js")])).await;
        assert!(delta.processed.is_empty());
        let (_, main) = graph.entries()[0].clone();
        assert_eq!(graph.get(&main).unwrap().state, ModuleState::Errored);
    }

    #[test]
    fn test_entry_specifier() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("src")).unwrap();
        fs::write(dir.path().join("src/main.js"), "").unwrap();
        assert_eq!(entry_specifier(dir.path(), "src/main.js"), "./src/main.js");
        assert_eq!(entry_specifier(dir.path(), "./src/main.js"), "./src/main.js");
        assert_eq!(entry_specifier(dir.path(), "react"), "react");
    }
}
