//! Host plugin hooks.
//!
//! The host gets first refusal on resolution and loading through two hooks:
//!
//! - `onResolve({importer?, importee}) -> {uri, external} | none`
//! - `onLoad({id}) -> {content?, loader?} | none`
//!
//! Returning `None` defers to the default behavior. [`PluginBridge`] wraps the
//! host implementation with single-flight coordination, cancellation and an
//! optional timeout.
//!
//! ## Example
//!
//! ```ignore
//! use kestrel_core::plugin::{HostHooks, HookResult, OnLoadArgs, OnLoadResult};
//!
//! struct Virtual;
//!
//! #[async_trait::async_trait]
//! impl HostHooks for Virtual {
//!     async fn on_load(&self, args: OnLoadArgs) -> HookResult<Option<OnLoadResult>> {
//!         if args.id == "virtual:config" {
//!             return Ok(Some(OnLoadResult::content("export default {};")));
//!         }
//!         Ok(None)
//!     }
//! }
//! ```

use crate::error::BuildError;
use async_trait::async_trait;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use rustc_hash::FxHashMap as HashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Result type for host hooks.
pub type HookResult<T> = Result<T, HookError>;

/// Rejection reported by a host hook.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct HookError(pub String);

impl HookError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Which hook a call went through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum HookKind {
    #[serde(rename = "onResolve")]
    Resolve,
    #[serde(rename = "onLoad")]
    Load,
}

impl fmt::Display for HookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Resolve => "onResolve",
            Self::Load => "onLoad",
        })
    }
}

/// Arguments of the resolve hook.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnResolveArgs {
    pub importer: Option<String>,
    pub importee: String,
}

/// A resolve hook answer. It wins outright over filesystem resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnResolveResult {
    pub uri: String,
    pub external: bool,
}

impl OnResolveResult {
    pub fn resolved(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            external: false,
        }
    }

    pub fn external(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            external: true,
        }
    }
}

/// Arguments of the load hook.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OnLoadArgs {
    pub id: String,
}

/// A load hook answer. `content` is used verbatim; `loader` overrides the
/// extension-based loader selection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnLoadResult {
    pub content: Option<String>,
    pub loader: Option<String>,
}

impl OnLoadResult {
    pub fn content(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            loader: None,
        }
    }

    #[must_use]
    pub fn with_loader(mut self, loader: impl Into<String>) -> Self {
        self.loader = Some(loader.into());
        self
    }
}

/// Host-supplied hook functions. Both default to "none".
#[async_trait]
pub trait HostHooks: Send + Sync {
    async fn on_resolve(&self, _args: OnResolveArgs) -> HookResult<Option<OnResolveResult>> {
        Ok(None)
    }

    async fn on_load(&self, _args: OnLoadArgs) -> HookResult<Option<OnLoadResult>> {
        Ok(None)
    }
}

// =============================================================================
// Channel transport
// =============================================================================

/// A hook call carried over a channel to a host living elsewhere.
#[derive(Debug)]
pub enum HookRequest {
    Resolve {
        args: OnResolveArgs,
        reply: oneshot::Sender<HookResult<Option<OnResolveResult>>>,
    },
    Load {
        args: OnLoadArgs,
        reply: oneshot::Sender<HookResult<Option<OnLoadResult>>>,
    },
}

/// Receiving half handed to the host.
pub type HookReceiver = mpsc::UnboundedReceiver<HookRequest>;

/// [`HostHooks`] implementation that forwards every call as a [`HookRequest`].
#[derive(Debug, Clone)]
pub struct ChannelHooks {
    tx: mpsc::UnboundedSender<HookRequest>,
}

impl ChannelHooks {
    #[must_use]
    pub fn new() -> (Self, HookReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl HostHooks for ChannelHooks {
    async fn on_resolve(&self, args: OnResolveArgs) -> HookResult<Option<OnResolveResult>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(HookRequest::Resolve { args, reply })
            .map_err(|_| HookError::new("host hook channel closed"))?;
        rx.await
            .map_err(|_| HookError::new("host dropped the resolve reply"))?
    }

    async fn on_load(&self, args: OnLoadArgs) -> HookResult<Option<OnLoadResult>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(HookRequest::Load { args, reply })
            .map_err(|_| HookError::new("host hook channel closed"))?;
        rx.await
            .map_err(|_| HookError::new("host dropped the load reply"))?
    }
}

// =============================================================================
// Bridge
// =============================================================================

/// Why a hook round trip produced no usable answer.
#[derive(Debug, Clone, PartialEq, Eq)]
enum HookFailure {
    Rejected(String),
    Cancelled,
    TimedOut(Duration),
}

impl fmt::Display for HookFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rejected(msg) => f.write_str(msg),
            Self::Cancelled => f.write_str("cancelled"),
            Self::TimedOut(d) => write!(f, "timed out after {}ms", d.as_millis()),
        }
    }
}

type Call<T> = Shared<BoxFuture<'static, Result<Option<T>, HookFailure>>>;

/// Map of in-flight calls keyed by request.
struct InFlight<K, T> {
    calls: Mutex<HashMap<K, Call<T>>>,
}

impl<K: Eq + Hash + Clone, T: Clone> InFlight<K, T> {
    fn new() -> Self {
        Self {
            calls: Mutex::new(HashMap::default()),
        }
    }

    /// Join the call for `key`, starting it with `start` if none is running.
    fn join(&self, key: &K, start: impl FnOnce() -> Call<T>) -> (Call<T>, bool) {
        let mut calls = self.calls.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(call) = calls.get(key) {
            return (call.clone(), false);
        }
        let call = start();
        calls.insert(key.clone(), call.clone());
        (call, true)
    }

    /// Forget `call` once it settled, unless a newer call took its slot.
    fn settle(&self, key: &K, call: &Call<T>) {
        let mut calls = self.calls.lock().unwrap_or_else(PoisonError::into_inner);
        if calls.get(key).is_some_and(|c| c.ptr_eq(call)) {
            calls.remove(key);
        }
    }

    fn len(&self) -> usize {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// Single-flight wrapper around [`HostHooks`].
///
/// Concurrent calls with an identical key share one host round trip; calls with
/// different keys (including query-suffixed siblings of one path) run
/// independently. Every round trip races the cancellation token and, when
/// configured, a timeout.
pub struct PluginBridge {
    hooks: Option<Arc<dyn HostHooks>>,
    cancel: CancellationToken,
    timeout: Option<Duration>,
    resolving: InFlight<OnResolveArgs, OnResolveResult>,
    loading: InFlight<String, OnLoadResult>,
    issued: Arc<AtomicUsize>,
}

impl fmt::Debug for PluginBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginBridge")
            .field("hooks", &self.hooks.is_some())
            .field("timeout", &self.timeout)
            .field("issued", &self.issued())
            .finish_non_exhaustive()
    }
}

impl PluginBridge {
    #[must_use]
    pub fn new(
        hooks: Option<Arc<dyn HostHooks>>,
        cancel: CancellationToken,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            hooks,
            cancel,
            timeout,
            resolving: InFlight::new(),
            loading: InFlight::new(),
            issued: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Bridge with no host attached; every call answers "none".
    #[must_use]
    pub fn disabled() -> Self {
        Self::new(None, CancellationToken::new(), None)
    }

    #[must_use]
    pub fn has_hooks(&self) -> bool {
        self.hooks.is_some()
    }

    /// Number of round trips actually sent to the host.
    #[must_use]
    pub fn issued(&self) -> usize {
        self.issued.load(Ordering::Relaxed)
    }

    /// Number of round trips currently awaiting the host.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.resolving.len() + self.loading.len()
    }

    /// Ask the host to resolve `args`.
    ///
    /// A failed, cancelled or timed-out call is returned as a `Plugin` build
    /// error; callers record it and fall through to default resolution.
    pub async fn resolve(&self, args: OnResolveArgs) -> Result<Option<OnResolveResult>, BuildError> {
        let Some(hooks) = self.hooks.clone() else {
            return Ok(None);
        };

        let (call, leader) = self.resolving.join(&args, || {
            let request = args.clone();
            self.guarded(async move { hooks.on_resolve(request).await })
        });
        if !leader {
            trace!(importee = %args.importee, "joined in-flight resolve hook");
        }

        let outcome = call.clone().await;
        self.resolving.settle(&args, &call);
        outcome.map_err(|failure| plugin_error(HookKind::Resolve, &args.importee, &failure))
    }

    /// Ask the host to load `id`.
    pub async fn load(&self, id: &str) -> Result<Option<OnLoadResult>, BuildError> {
        let Some(hooks) = self.hooks.clone() else {
            return Ok(None);
        };

        let key = id.to_string();
        let (call, leader) = self.loading.join(&key, || {
            let request = OnLoadArgs { id: key.clone() };
            self.guarded(async move { hooks.on_load(request).await })
        });
        if !leader {
            trace!(id, "joined in-flight load hook");
        }

        let outcome = call.clone().await;
        self.loading.settle(&key, &call);
        outcome.map_err(|failure| plugin_error(HookKind::Load, id, &failure))
    }

    fn guarded<T, F>(&self, fut: F) -> Call<T>
    where
        T: Clone + Send + Sync + 'static,
        F: Future<Output = HookResult<Option<T>>> + Send + 'static,
    {
        let cancel = self.cancel.clone();
        let timeout = self.timeout;
        let issued = Arc::clone(&self.issued);
        async move {
            issued.fetch_add(1, Ordering::Relaxed);
            let round_trip = async move {
                match timeout {
                    Some(limit) => match tokio::time::timeout(limit, fut).await {
                        Ok(result) => result.map_err(|e| HookFailure::Rejected(e.0)),
                        Err(_) => Err(HookFailure::TimedOut(limit)),
                    },
                    None => fut.await.map_err(|e| HookFailure::Rejected(e.0)),
                }
            };
            tokio::select! {
                () = cancel.cancelled() => Err(HookFailure::Cancelled),
                result = round_trip => result,
            }
        }
        .boxed()
        .shared()
    }
}

fn plugin_error(hook: HookKind, key: &str, failure: &HookFailure) -> BuildError {
    match failure {
        HookFailure::Rejected(_) => debug!(%hook, key, error = %failure, "hook rejected"),
        _ => warn!(%hook, key, error = %failure, "hook did not complete"),
    }
    BuildError::Plugin {
        hook,
        key: key.to_string(),
        reason: failure.to_string(),
    }
}
