//! Build progress reporting.

use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;
use tracing::info;

/// Progress of a build or rebuild.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum ProgressEvent {
    Started { entries: usize },
    ModuleDone { done: usize, total: usize },
    Chunking { modules: usize },
    Finished { modules: usize, chunks: usize },
}

/// Where progress goes. Disabled sinks drop every event.
#[derive(Debug, Clone, Default)]
pub struct ProgressSink {
    enabled: bool,
    tx: Option<UnboundedSender<ProgressEvent>>,
}

impl ProgressSink {
    #[must_use]
    pub fn new(enabled: bool, tx: Option<UnboundedSender<ProgressEvent>>) -> Self {
        Self { enabled, tx }
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn emit(&self, event: ProgressEvent) {
        if !self.enabled {
            return;
        }
        match &event {
            ProgressEvent::Started { entries } => info!(entries, "build started"),
            ProgressEvent::ModuleDone { done, total } => info!(done, total, "module processed"),
            ProgressEvent::Chunking { modules } => info!(modules, "chunking"),
            ProgressEvent::Finished { modules, chunks } => info!(modules, chunks, "build finished"),
        }
        if let Some(tx) = &self.tx {
            // The receiver going away only stops reporting.
            let _ = tx.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn test_disabled_sink_drops_events() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = ProgressSink::new(false, Some(tx));
        sink.emit(ProgressEvent::Started { entries: 1 });
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_enabled_sink_forwards() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = ProgressSink::new(true, Some(tx));
        sink.emit(ProgressEvent::ModuleDone { done: 1, total: 3 });
        assert_eq!(
            rx.try_recv().unwrap(),
            ProgressEvent::ModuleDone { done: 1, total: 3 }
        );
    }

    #[test]
    fn test_event_json_shape() {
        let json = serde_json::to_string(&ProgressEvent::Finished {
            modules: 4,
            chunks: 2,
        })
        .unwrap();
        assert_eq!(json, r#"{"event":"finished","modules":4,"chunks":2}"#);
    }
}
