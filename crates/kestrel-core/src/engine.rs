//! The bundler engine handle.
//!
//! ## Example
//!
//! ```ignore
//! use kestrel_core::{BundlerOptions, Engine};
//!
//! let options = BundlerOptions::new("/app").with_entry("main", "./src/index.js");
//! let engine = Engine::create(options, None)?;
//! let result = engine.build().await?;
//! let result = engine.rebuild(Path::new("/app/src/util.js")).await?;
//! ```

use crate::builder::{BuildContext, BuildDelta, GraphBuilder};
use crate::chunks::{ChunkGraph, SplitOptions};
use crate::config::BundlerOptions;
use crate::error::{Error, Result};
use crate::graph::ModuleGraph;
use crate::incremental::{self, RebuildStats};
use crate::loader::{LoaderKind, Transform};
use crate::manifest::BuildResult;
use crate::module_id::ModuleId;
use crate::plugin::{HostHooks, PluginBridge};
use crate::progress::{ProgressEvent, ProgressSink};
use crate::render::{Minifier, RenderOptions, RenderedChunk, Renderer, WhitespaceMinifier};
use crate::resolver::ResolveRet;
use rustc_hash::FxHashSet as HashSet;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, Instrument};

/// Graph state owned by the single writer.
#[derive(Debug, Default)]
struct EngineState {
    graph: ModuleGraph,
    chunks: ChunkGraph,
    rendered: Vec<RenderedChunk>,
    /// Lazy targets compiled on request; they stay compiled across builds.
    compiled_lazy: HashSet<ModuleId>,
    generation: u64,
    built: bool,
    stats: RebuildStats,
}

/// Builder for [`Engine`] with optional extension points.
pub struct EngineBuilder {
    options: BundlerOptions,
    hooks: Option<Arc<dyn HostHooks>>,
    transforms: Vec<(LoaderKind, Arc<dyn Transform>)>,
    minifier: Option<Arc<dyn Minifier>>,
    progress: Option<UnboundedSender<ProgressEvent>>,
}

impl EngineBuilder {
    #[must_use]
    pub fn new(options: BundlerOptions) -> Self {
        Self {
            options,
            hooks: None,
            transforms: Vec::new(),
            minifier: None,
            progress: None,
        }
    }

    /// Host plugin hooks.
    #[must_use]
    pub fn with_hooks(mut self, hooks: Arc<dyn HostHooks>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    /// Replace the built-in transform for `kind`.
    #[must_use]
    pub fn with_transform(mut self, kind: LoaderKind, transform: Arc<dyn Transform>) -> Self {
        self.transforms.push((kind, transform));
        self
    }

    /// Replace the default whitespace minifier.
    #[must_use]
    pub fn with_minifier(mut self, minifier: Arc<dyn Minifier>) -> Self {
        self.minifier = Some(minifier);
        self
    }

    /// Receive progress events. Only used when the `progress` option is on.
    #[must_use]
    pub fn with_progress(mut self, tx: UnboundedSender<ProgressEvent>) -> Self {
        self.progress = Some(tx);
        self
    }

    /// Validate options and create the engine.
    ///
    /// # Errors
    /// Returns [`Error::InvalidConfig`] for invalid options and [`Error::Io`] when
    /// the root directory cannot be canonicalized.
    pub fn build(self) -> Result<Engine> {
        self.options.validate()?;

        let root = if self.options.root.is_absolute() {
            self.options.root.clone()
        } else {
            std::env::current_dir()
                .map_err(|source| Error::Io {
                    path: self.options.root.clone(),
                    source,
                })?
                .join(&self.options.root)
        };
        let root = dunce::canonicalize(&root).map_err(|source| Error::Io {
            path: root.clone(),
            source,
        })?;

        let cancel = CancellationToken::new();
        let timeout = self.options.hook_timeout_ms.map(Duration::from_millis);
        let bridge = Arc::new(PluginBridge::new(self.hooks, cancel.clone(), timeout));
        let progress = ProgressSink::new(self.options.progress, self.progress);

        let mut ctx = BuildContext::new(&self.options, root.clone(), bridge, progress, cancel.clone());
        for (kind, transform) in self.transforms {
            ctx.register_transform(kind, transform);
        }

        let renderer = Renderer::new(
            RenderOptions::from_options(&self.options, root.clone()),
            self.minifier.unwrap_or_else(|| Arc::new(WhitespaceMinifier)),
        );

        debug!(root = %root.display(), entries = self.options.entries.len(), "engine created");

        Ok(Engine {
            split: SplitOptions::from_options(&self.options),
            options: Arc::new(self.options),
            root,
            ctx: Arc::new(ctx),
            renderer,
            state: Mutex::new(EngineState::default()),
            last: RwLock::new(Arc::new(BuildResult::default())),
            cancel,
        })
    }
}

/// Bundler engine: owns the module graph, chunk graph and last result.
///
/// `build`, `rebuild` and `compile_lazy` exclude each other. `resolve` never
/// touches the graph and may run concurrently with them.
pub struct Engine {
    options: Arc<BundlerOptions>,
    root: PathBuf,
    ctx: Arc<BuildContext>,
    renderer: Renderer,
    split: SplitOptions,
    state: Mutex<EngineState>,
    last: RwLock<Arc<BuildResult>>,
    cancel: CancellationToken,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("root", &self.root)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Create an engine with optional host hooks.
    ///
    /// # Errors
    /// Returns an error if the options are invalid or the root does not exist.
    pub fn create(options: BundlerOptions, hooks: Option<Arc<dyn HostHooks>>) -> Result<Self> {
        let builder = EngineBuilder::new(options);
        match hooks {
            Some(hooks) => builder.with_hooks(hooks).build(),
            None => builder.build(),
        }
    }

    #[must_use]
    pub fn builder(options: BundlerOptions) -> EngineBuilder {
        EngineBuilder::new(options)
    }

    #[must_use]
    pub fn options(&self) -> &BundlerOptions {
        &self.options
    }

    /// Canonical project root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Latest published result. Never half-built.
    #[must_use]
    pub fn last_result(&self) -> Arc<BuildResult> {
        Arc::clone(&self.last.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Stats of the last build or rebuild.
    pub async fn last_stats(&self) -> RebuildStats {
        self.state.lock().await.stats.clone()
    }

    /// Number of builds and rebuilds that produced a new result.
    pub async fn generation(&self) -> u64 {
        self.state.lock().await.generation
    }

    /// Cancel in-flight hook calls; later operations return [`Error::Cancelled`].
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolve `specifier` from `dir` without touching the graph.
    pub async fn resolve(&self, specifier: &str, dir: &Path) -> ResolveRet {
        let dir = self.absolute(dir);
        let resolution = self.ctx.resolver.resolve(specifier, None, &dir).await;
        ResolveRet::from(&resolution.outcome)
    }

    /// Full build from the configured entries.
    ///
    /// # Errors
    /// Returns [`Error::Cancelled`] after [`Engine::cancel`], [`Error::BuildFailed`]
    /// in strict mode when a module has errors, and [`Error::Io`] when outputs
    /// cannot be written.
    pub async fn build(&self) -> Result<Arc<BuildResult>> {
        self.ensure_active()?;
        let mut state = self.state.lock().await;
        self.full_build(&mut state).instrument(info_span!("build")).await
    }

    /// Rebuild after `changed` was modified, created or removed.
    ///
    /// Returns the previous result when no module is affected.
    ///
    /// # Errors
    /// Same as [`Engine::build`].
    pub async fn rebuild(&self, changed: &Path) -> Result<Arc<BuildResult>> {
        self.ensure_active()?;
        let changed = self.absolute(changed);
        let mut state = self.state.lock().await;
        if !state.built {
            return self.full_build(&mut state).instrument(info_span!("build")).await;
        }
        let span = info_span!("rebuild", path = %changed.display());
        self.incremental_rebuild(&mut state, &changed).instrument(span).await
    }

    /// Compile a lazily deferred dynamic import target.
    ///
    /// # Errors
    /// Returns [`Error::Other`] when `id` is not a lazy placeholder, plus the
    /// errors of [`Engine::build`].
    pub async fn compile_lazy(&self, id: &ModuleId) -> Result<Arc<BuildResult>> {
        self.ensure_active()?;
        let mut state = self.state.lock().await;
        if !state.graph.get(id).is_some_and(crate::graph::Module::is_lazy) {
            return Err(Error::other(format!("'{id}' is not awaiting lazy compilation")));
        }

        let started = Instant::now();
        state.compiled_lazy.insert(id.clone());
        let eager = state.compiled_lazy.clone();

        let mut builder = GraphBuilder::new(Arc::clone(&self.ctx), &mut state.graph);
        builder.compile_eagerly(eager);
        builder.reprocess(id.clone());
        let delta = builder
            .run()
            .instrument(info_span!("compile_lazy", id = %id))
            .await;

        let stats = RebuildStats {
            processed: delta.processed.len(),
            ..RebuildStats::default()
        };
        self.finish(&mut state, delta, stats, started)
    }

    fn ensure_active(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    fn absolute(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    async fn full_build(&self, state: &mut EngineState) -> Result<Arc<BuildResult>> {
        let started = Instant::now();
        self.ctx.resolver.clear_cache();
        self.ctx.progress.emit(ProgressEvent::Started {
            entries: self.options.entries.len(),
        });

        let mut graph = ModuleGraph::new();
        let mut builder = GraphBuilder::new(Arc::clone(&self.ctx), &mut graph);
        builder.compile_eagerly(state.compiled_lazy.iter().cloned());
        builder.seed_entries(&self.options.entries).await;
        let delta = builder.run().await;

        state.graph = graph;
        state.chunks = ChunkGraph::default();
        state.rendered = Vec::new();
        state.built = true;

        let stats = RebuildStats {
            processed: delta.processed.len(),
            ..RebuildStats::default()
        };
        self.finish(state, delta, stats, started)
    }

    async fn incremental_rebuild(&self, state: &mut EngineState, changed: &Path) -> Result<Arc<BuildResult>> {
        let started = Instant::now();
        self.ctx.resolver.clear_cache();

        let stale = incremental::mark_stale(&mut state.graph, changed);
        let failed_entries: BTreeMap<String, String> = self
            .options
            .entries
            .iter()
            .filter(|(name, _)| state.graph.entry_errors().contains_key(*name))
            .map(|(name, spec)| (name.clone(), spec.clone()))
            .collect();

        if stale.is_empty() && failed_entries.is_empty() {
            debug!("change affects no module");
            return Ok(self.last_result());
        }
        self.ctx.progress.emit(ProgressEvent::Started {
            entries: failed_entries.len(),
        });
        debug!(stale = stale.len(), retried_entries = failed_entries.len(), "rebuilding");

        let eager = state.compiled_lazy.clone();
        let mut builder = GraphBuilder::new(Arc::clone(&self.ctx), &mut state.graph);
        builder.compile_eagerly(eager);
        if !failed_entries.is_empty() {
            builder.seed_entries(&failed_entries).await;
        }
        for id in &stale {
            builder.reprocess(id.clone());
        }
        let delta = builder.run().await;

        let stats = RebuildStats {
            stale,
            processed: delta.processed.len(),
            ..RebuildStats::default()
        };
        self.finish(state, delta, stats, started)
    }

    /// Prune, settle, repartition, render and publish.
    fn finish(
        &self,
        state: &mut EngineState,
        mut delta: BuildDelta,
        mut stats: RebuildStats,
        started: Instant,
    ) -> Result<Arc<BuildResult>> {
        stats.pruned = state.graph.prune_unreachable();
        if !stats.pruned.is_empty() {
            delta.topology_changed = true;
        }
        state.compiled_lazy.retain(|id| state.graph.contains(id));
        incremental::settle_states(&mut state.graph);

        let mut touched: Vec<ModuleId> = delta.touched.iter().cloned().collect();
        touched.sort();
        stats.touched = touched;

        self.ctx.progress.emit(ProgressEvent::Chunking {
            modules: state.graph.len(),
        });
        let (chunks, rendered) = incremental::update_chunks(
            &state.chunks,
            &state.rendered,
            &state.graph,
            &self.split,
            &delta,
            &self.renderer,
            &mut stats,
        );
        state.chunks = chunks;
        state.rendered = rendered;
        state.generation += 1;

        let result = BuildResult::assemble(&state.graph, &state.chunks, &state.rendered);
        if let Some(outdir) = &self.options.outdir {
            result.write_outputs(&self.absolute(outdir))?;
        }

        info!(
            modules = state.graph.len(),
            chunks = state.chunks.len(),
            processed = stats.processed,
            rerendered = stats.rerendered.len(),
            errors = result.errors.len(),
            elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            "build finished"
        );
        self.ctx.progress.emit(ProgressEvent::Finished {
            modules: state.graph.len(),
            chunks: state.chunks.len(),
        });
        state.stats = stats;

        let result = Arc::new(result);
        *self.last.write().unwrap_or_else(PoisonError::into_inner) = Arc::clone(&result);

        if self.options.strict && !result.success {
            return Err(Error::BuildFailed {
                diagnostics: result.errors.clone(),
            });
        }
        Ok(result)
    }
}
