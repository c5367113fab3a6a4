//! Watch mode: feed file changes into incremental rebuilds.

use crate::commands::build::report;
use kestrel_core::Engine;
use miette::{IntoDiagnostic, Result};
use notify::{
    event::{CreateKind, ModifyKind, RemoveKind},
    Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher,
};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Default event coalescing window.
pub const DEFAULT_DEBOUNCE_MS: u64 = 50;

/// Watch the engine's root and rebuild until Ctrl-C.
pub async fn run(engine: Arc<Engine>, window: Duration) -> Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<PathBuf>>();

    let mut watcher = RecommendedWatcher::new(
        move |res: std::result::Result<Event, notify::Error>| match res {
            Ok(event) if is_relevant(&event) => {
                if let Err(e) = tx.send(event.paths) {
                    warn!(error = %e, "failed to forward watch event");
                }
            }
            Ok(_) => {}
            Err(e) => error!(error = %e, "watch error"),
        },
        Config::default(),
    )
    .into_diagnostic()?;
    watcher
        .watch(engine.root(), RecursiveMode::Recursive)
        .into_diagnostic()?;
    info!(root = %engine.root().display(), "watching for changes");

    let ignored = ignored_dirs(&engine);
    let mut pending: BTreeSet<PathBuf> = BTreeSet::new();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("stopping watch");
                engine.cancel();
                break;
            }
            event = tokio::time::timeout(window, rx.recv()) => match event {
                Ok(Some(paths)) => {
                    pending.extend(paths.into_iter().filter(|p| !is_ignored(p, &ignored)));
                }
                Ok(None) => {
                    debug!("watch event channel closed");
                    break;
                }
                Err(_) if !pending.is_empty() => {
                    let batch = std::mem::take(&mut pending);
                    rebuild_batch(&engine, batch).await?;
                }
                Err(_) => {}
            },
        }
    }
    Ok(())
}

async fn rebuild_batch(engine: &Engine, batch: BTreeSet<PathBuf>) -> Result<()> {
    debug!(count = batch.len(), "processing coalesced file events");
    let before = engine.last_result();
    let start = Instant::now();

    let mut outcome = Ok(Arc::clone(&before));
    for path in &batch {
        outcome = engine.rebuild(path).await;
        if outcome.is_err() {
            break;
        }
    }

    if let Ok(result) = &outcome {
        if Arc::ptr_eq(result, &before) {
            return Ok(());
        }
    }
    let stats = engine.last_stats().await;
    info!(
        changed = batch.len(),
        processed = stats.processed,
        rerendered = stats.rerendered.len(),
        "rebuilt"
    );
    report(engine, outcome, start.elapsed(), false)?;
    Ok(())
}

/// Directories whose changes never trigger a rebuild.
fn ignored_dirs(engine: &Engine) -> Vec<PathBuf> {
    let mut dirs = vec![engine.root().join(".git")];
    if let Some(outdir) = &engine.options().outdir {
        dirs.push(engine.root().join(outdir));
    }
    dirs
}

fn is_ignored(path: &Path, ignored: &[PathBuf]) -> bool {
    ignored.iter().any(|dir| path.starts_with(dir))
}

fn is_relevant(event: &Event) -> bool {
    matches!(
        event.kind,
        EventKind::Create(CreateKind::File | CreateKind::Any)
            | EventKind::Modify(ModifyKind::Data(_) | ModifyKind::Name(_) | ModifyKind::Any)
            | EventKind::Remove(RemoveKind::File | RemoveKind::Any)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_ignored() {
        let ignored = vec![PathBuf::from("/app/dist"), PathBuf::from("/app/.git")];
        assert!(is_ignored(Path::new("/app/dist/main.js"), &ignored));
        assert!(is_ignored(Path::new("/app/.git/index"), &ignored));
        assert!(!is_ignored(Path::new("/app/src/dist.js"), &ignored));
    }

    #[test]
    fn test_metadata_changes_are_ignored() {
        let event = Event::new(EventKind::Modify(ModifyKind::Metadata(
            notify::event::MetadataKind::Any,
        )));
        assert!(!is_relevant(&event));
        let event = Event::new(EventKind::Create(CreateKind::File));
        assert!(is_relevant(&event));
    }
}
