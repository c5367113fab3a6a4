//! Import specifier resolution.
//!
//! Resolves specifiers to canonical module ids. Steps, in order:
//!
//! 1. Alias: the longest matching prefix key is rewritten to its target.
//! 2. External: glob rules mark a specifier external with no lookup.
//! 3. Host hook: an `onResolve` answer wins outright.
//! 4. Filesystem: literal path, then extensions, then index files, then
//!    `package.json` fields for packages.
//!
//! ## Specifier Types
//!
//! - Relative: `./utils`, `../lib/foo`
//! - Absolute: `/abs/path/to/module`
//! - Bare: `lodash`, `@scope/pkg`, `react/jsx-runtime`
//!
//! A `?query` suffix never takes part in the filesystem lookup but is kept on the
//! resulting id.

use crate::config::{BundlerOptions, DEFAULT_EXTENSIONS};
use crate::error::BuildError;
use crate::module_id::{split_query, ModuleId};
use crate::plugin::{OnResolveArgs, PluginBridge};
use rustc_hash::FxHashMap as HashMap;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;
use tracing::trace;

/// Resolution failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Cannot resolve '{specifier}' from '{from}': {message}")]
pub struct ResolveError {
    pub specifier: String,
    pub from: String,
    pub message: String,
}

impl ResolveError {
    fn new(specifier: &str, from: &Path, message: impl Into<String>) -> Self {
        Self {
            specifier: specifier.to_string(),
            from: from.display().to_string(),
            message: message.into(),
        }
    }
}

impl From<ResolveError> for BuildError {
    fn from(e: ResolveError) -> Self {
        BuildError::Resolve {
            importer: e.from,
            specifier: e.specifier,
            reason: e.message,
        }
    }
}

/// A successfully resolved module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedModule {
    pub id: ModuleId,
    pub external: bool,
}

/// Tagged resolution result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveOutcome {
    Resolved(ResolvedModule),
    Unresolved(ResolveError),
}

impl ResolveOutcome {
    #[must_use]
    pub fn resolved(&self) -> Option<&ResolvedModule> {
        match self {
            Self::Resolved(m) => Some(m),
            Self::Unresolved(_) => None,
        }
    }
}

/// Resolution outcome plus a hook failure that was fallen through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub outcome: ResolveOutcome,
    pub hook_error: Option<BuildError>,
}

/// Boundary shape of a resolution: `{status, result?}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolveRet {
    pub status: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
}

impl From<&ResolveOutcome> for ResolveRet {
    fn from(outcome: &ResolveOutcome) -> Self {
        match outcome {
            ResolveOutcome::Resolved(m) => Self {
                status: true,
                result: Some(m.id.to_string()),
            },
            ResolveOutcome::Unresolved(_) => Self {
                status: false,
                result: None,
            },
        }
    }
}

/// Resolve `import_path` from `base_dir` on the filesystem only.
///
/// No alias, external rule or host hook takes part. The query suffix, if any,
/// is kept on the returned path.
pub fn resolve_file(base_dir: &Path, import_path: &str) -> Result<PathBuf, ResolveError> {
    let extensions: Vec<String> = DEFAULT_EXTENSIONS.iter().map(|e| (*e).to_string()).collect();
    let (request, query) = split_query(import_path);
    let path = FsResolver::new(extensions).lookup(base_dir, request)?;
    Ok(match query {
        Some(q) => PathBuf::from(format!("{}?{q}", path.display())),
        None => path,
    })
}

/// Specifier -> canonical module id.
#[derive(Debug)]
pub struct ResolverSet {
    root: PathBuf,
    /// Sorted by key length, longest first.
    aliases: Vec<(String, String)>,
    externals: Vec<glob::Pattern>,
    fs: FsResolver,
    bridge: Arc<PluginBridge>,
}

impl ResolverSet {
    /// Build from validated options. `root` must already be absolute.
    #[must_use]
    pub fn new(options: &BundlerOptions, root: PathBuf, bridge: Arc<PluginBridge>) -> Self {
        let mut aliases: Vec<(String, String)> = options
            .alias
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        aliases.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(&b.0)));

        let externals = options
            .externals
            .iter()
            .filter_map(|p| glob::Pattern::new(p).ok())
            .collect();

        Self {
            root,
            aliases,
            externals,
            fs: FsResolver::new(options.extensions.clone()),
            bridge,
        }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Drop cached filesystem lookups so new files become visible.
    pub fn clear_cache(&self) {
        self.fs.clear();
    }

    /// Resolve `specifier` as imported by `importer`, looking up relative paths
    /// from `base_dir`.
    pub async fn resolve(
        &self,
        specifier: &str,
        importer: Option<&ModuleId>,
        base_dir: &Path,
    ) -> Resolution {
        let (request, query) = split_query(specifier);
        let rewritten = self.apply_alias(request);
        let full = match query {
            Some(q) => format!("{rewritten}?{q}"),
            None => rewritten.to_string(),
        };

        if self.is_external(&rewritten) {
            trace!(specifier, "matched external rule");
            return Resolution {
                outcome: ResolveOutcome::Resolved(ResolvedModule {
                    id: ModuleId::new(&full),
                    external: true,
                }),
                hook_error: None,
            };
        }

        let mut hook_error = None;
        let args = OnResolveArgs {
            importer: importer.map(ToString::to_string),
            importee: full.clone(),
        };
        match self.bridge.resolve(args).await {
            Ok(Some(answer)) => {
                trace!(specifier, uri = %answer.uri, external = answer.external, "resolved by onResolve");
                return Resolution {
                    outcome: ResolveOutcome::Resolved(ResolvedModule {
                        id: ModuleId::new(&answer.uri),
                        external: answer.external,
                    }),
                    hook_error: None,
                };
            }
            Ok(None) => {}
            Err(e) => hook_error = Some(e),
        }

        let from = importer.map_or_else(|| base_dir.to_path_buf(), ModuleId::path);
        let outcome = match self.fs.lookup(base_dir, &rewritten) {
            Ok(path) => ResolveOutcome::Resolved(ResolvedModule {
                id: ModuleId::from_path(&path, query),
                external: false,
            }),
            Err(mut e) => {
                e.specifier = specifier.to_string();
                e.from = from.display().to_string();
                ResolveOutcome::Unresolved(e)
            }
        };
        Resolution {
            outcome,
            hook_error,
        }
    }

    fn apply_alias<'a>(&self, request: &'a str) -> Cow<'a, str> {
        for (key, target) in &self.aliases {
            let rest = if request == key {
                ""
            } else if let Some(rest) = request.strip_prefix(key.as_str()) {
                if !rest.starts_with('/') {
                    continue;
                }
                rest
            } else {
                continue;
            };
            let target = if target.starts_with("./") || target.starts_with("../") {
                self.root.join(target).display().to_string()
            } else {
                target.clone()
            };
            return Cow::Owned(format!("{target}{rest}"));
        }
        Cow::Borrowed(request)
    }

    fn is_external(&self, request: &str) -> bool {
        self.externals.iter().any(|p| p.matches(request))
    }
}

/// Filesystem resolution with a lookup cache.
#[derive(Debug)]
pub struct FsResolver {
    extensions: Vec<String>,
    cache: RwLock<HashMap<(PathBuf, String), Option<PathBuf>>>,
}

impl FsResolver {
    #[must_use]
    pub fn new(extensions: Vec<String>) -> Self {
        Self {
            extensions,
            cache: RwLock::new(HashMap::default()),
        }
    }

    pub fn clear(&self) {
        self.cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Look up `request` (without query) from `base_dir`.
    pub fn lookup(&self, base_dir: &Path, request: &str) -> Result<PathBuf, ResolveError> {
        let key = (base_dir.to_path_buf(), request.to_string());
        if let Some(cached) = self
            .cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
        {
            return cached
                .clone()
                .ok_or_else(|| ResolveError::new(request, base_dir, "module not found"));
        }

        let result = self.lookup_uncached(base_dir, request);
        self.cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, result.as_ref().ok().cloned());
        result
    }

    fn lookup_uncached(&self, base_dir: &Path, request: &str) -> Result<PathBuf, ResolveError> {
        if request.is_empty() {
            return Err(ResolveError::new(request, base_dir, "empty specifier"));
        }
        if is_relative(request) {
            let target = normalize(&base_dir.join(request));
            return self
                .file_or_directory(&target)
                .ok_or_else(|| ResolveError::new(request, base_dir, "module not found"));
        }
        if Path::new(request).is_absolute() {
            return self
                .file_or_directory(Path::new(request))
                .ok_or_else(|| ResolveError::new(request, base_dir, "module not found"));
        }
        if request.contains(':') {
            return Err(ResolveError::new(
                request,
                base_dir,
                "unsupported URL scheme",
            ));
        }
        self.package(base_dir, request)
    }

    /// Literal file, then each extension, then index files, then `package.json`.
    fn file_or_directory(&self, target: &Path) -> Option<PathBuf> {
        if target.is_file() {
            return canonical(target);
        }
        for ext in &self.extensions {
            let candidate = PathBuf::from(format!("{}{ext}", target.display()));
            if candidate.is_file() {
                return canonical(&candidate);
            }
        }
        if target.is_dir() {
            for ext in &self.extensions {
                let index = target.join(format!("index{ext}"));
                if index.is_file() {
                    return canonical(&index);
                }
            }
            let manifest = target.join("package.json");
            if manifest.is_file() {
                return self.package_entry(target, &manifest, None);
            }
        }
        None
    }

    /// Walk up from `base_dir` looking in `node_modules`.
    fn package(&self, base_dir: &Path, request: &str) -> Result<PathBuf, ResolveError> {
        let (name, subpath) = parse_bare_specifier(request);
        let mut current = Some(base_dir);
        while let Some(dir) = current {
            let pkg_dir = dir.join("node_modules").join(&name);
            if pkg_dir.is_dir() {
                let manifest = pkg_dir.join("package.json");
                if manifest.is_file() {
                    if let Some(entry) = self.package_entry(&pkg_dir, &manifest, subpath.as_deref()) {
                        return Ok(entry);
                    }
                }
                let target = match &subpath {
                    Some(sub) => pkg_dir.join(sub),
                    None => pkg_dir.clone(),
                };
                if let Some(found) = self.file_or_directory(&target) {
                    return Ok(found);
                }
            }
            current = dir.parent();
        }
        Err(ResolveError::new(
            request,
            base_dir,
            format!("cannot find package '{name}' in node_modules"),
        ))
    }

    /// Entry from `exports`, then `module`, then `main`.
    fn package_entry(&self, pkg_dir: &Path, manifest: &Path, subpath: Option<&str>) -> Option<PathBuf> {
        let content = std::fs::read_to_string(manifest).ok()?;
        let json: serde_json::Value = serde_json::from_str(&content).ok()?;

        let export_key = subpath.map_or_else(|| ".".to_string(), |s| format!("./{s}"));
        if let Some(exports) = json.get("exports") {
            if let Some(entry) = resolve_exports(exports, &export_key) {
                if let Some(found) = self.file_or_directory(&normalize(&pkg_dir.join(entry))) {
                    return Some(found);
                }
            }
        }

        if subpath.is_some() {
            return None;
        }

        for field in ["module", "main"] {
            if let Some(entry) = json.get(field).and_then(serde_json::Value::as_str) {
                if let Some(found) = self.file_or_directory(&normalize(&pkg_dir.join(entry))) {
                    return Some(found);
                }
            }
        }
        None
    }
}

fn is_relative(request: &str) -> bool {
    request == "." || request == ".." || request.starts_with("./") || request.starts_with("../")
}

fn canonical(path: &Path) -> Option<PathBuf> {
    dunce::canonicalize(path).ok()
}

/// Lexically remove `.` and `..` components.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Split a bare specifier into package name and subpath.
fn parse_bare_specifier(specifier: &str) -> (String, Option<String>) {
    let limit = if specifier.starts_with('@') { 3 } else { 2 };
    let parts: Vec<&str> = specifier.splitn(limit, '/').collect();
    if limit == 3 && parts.len() >= 2 {
        (
            format!("{}/{}", parts[0], parts[1]),
            parts.get(2).map(|s| (*s).to_string()),
        )
    } else {
        (
            parts[0].to_string(),
            parts.get(1).filter(|_| limit == 2).map(|s| (*s).to_string()),
        )
    }
}

fn resolve_exports(exports: &serde_json::Value, subpath: &str) -> Option<String> {
    match exports {
        serde_json::Value::String(s) => (subpath == ".").then(|| s.clone()),
        serde_json::Value::Object(map) => {
            if let Some(value) = map.get(subpath) {
                return export_target(value);
            }
            // Conditions at the top level apply to ".".
            if subpath == "." && !map.keys().any(|k| k.starts_with('.')) {
                return export_target(exports);
            }
            None
        }
        _ => None,
    }
}

/// Pick a target from an export value, preferring `import`, then `default`, then
/// `require`.
fn export_target(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Object(map) => ["import", "default", "require"]
            .iter()
            .find_map(|cond| map.get(*cond).and_then(export_target)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::{HookResult, HostHooks, OnResolveResult};
    use async_trait::async_trait;
    use std::fs;
    use tempfile::tempdir;
    use tokio_util::sync::CancellationToken;

    fn set(options: &BundlerOptions, root: &Path, bridge: PluginBridge) -> ResolverSet {
        ResolverSet::new(options, dunce::canonicalize(root).unwrap(), Arc::new(bridge))
    }

    fn resolved_id(resolution: &Resolution) -> String {
        resolution.outcome.resolved().unwrap().id.to_string()
    }

    #[test]
    fn test_parse_bare_specifier() {
        assert_eq!(parse_bare_specifier("lodash"), ("lodash".to_string(), None));
        assert_eq!(
            parse_bare_specifier("lodash/get"),
            ("lodash".to_string(), Some("get".to_string()))
        );
        assert_eq!(parse_bare_specifier("@types/node"), ("@types/node".to_string(), None));
        assert_eq!(
            parse_bare_specifier("@babel/core/lib/parse"),
            ("@babel/core".to_string(), Some("lib/parse".to_string()))
        );
    }

    #[test]
    fn test_resolve_file_order() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("src");
        fs::create_dir_all(src.join("widgets")).unwrap();
        fs::write(src.join("utils.ts"), "").unwrap();
        fs::write(src.join("widgets/index.js"), "").unwrap();
        fs::write(src.join("plain"), "").unwrap();

        assert!(resolve_file(&src, "./utils").unwrap().ends_with("utils.ts"));
        assert!(resolve_file(&src, "./widgets")
            .unwrap()
            .ends_with("widgets/index.js"));
        assert!(resolve_file(&src, "./plain").unwrap().ends_with("plain"));
        assert!(resolve_file(&src, "./missing").is_err());
    }

    #[test]
    fn test_resolve_file_keeps_query() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("index.js"), "").unwrap();
        let resolved = resolve_file(dir.path(), "./index?1").unwrap();
        assert!(resolved.display().to_string().ends_with("index.js?1"));
    }

    #[test]
    fn test_package_resolution() {
        let dir = tempdir().unwrap();
        let pkg = dir.path().join("node_modules/lib");
        fs::create_dir_all(pkg.join("dist")).unwrap();
        fs::write(
            pkg.join("package.json"),
            r#"{"main": "./dist/main.js", "module": "./dist/esm.js"}"#,
        )
        .unwrap();
        fs::write(pkg.join("dist/main.js"), "").unwrap();
        fs::write(pkg.join("dist/esm.js"), "").unwrap();

        let exported = dir.path().join("node_modules/@scope/exp");
        fs::create_dir_all(&exported).unwrap();
        fs::write(
            exported.join("package.json"),
            r#"{"exports": {".": {"import": "./m.mjs", "require": "./c.cjs"}, "./feature": "./f.js"}}"#,
        )
        .unwrap();
        fs::write(exported.join("m.mjs"), "").unwrap();
        fs::write(exported.join("f.js"), "").unwrap();

        let nested = dir.path().join("src/deep");
        fs::create_dir_all(&nested).unwrap();

        assert!(resolve_file(&nested, "lib").unwrap().ends_with("dist/esm.js"));
        assert!(resolve_file(&nested, "@scope/exp").unwrap().ends_with("m.mjs"));
        assert!(resolve_file(&nested, "@scope/exp/feature")
            .unwrap()
            .ends_with("f.js"));
        let err = resolve_file(&nested, "nope").unwrap_err();
        assert!(err.message.contains("cannot find package 'nope'"));
    }

    #[tokio::test]
    async fn test_alias_rewrites_prefix() {
        let dir = tempdir().unwrap();
        let lib = dir.path().join("src/lib");
        fs::create_dir_all(&lib).unwrap();
        fs::write(lib.join("x.js"), "").unwrap();
        // A literal "@lib" directory must not matter.
        fs::create_dir_all(dir.path().join("@lib")).unwrap();

        let lib_abs = dunce::canonicalize(&lib).unwrap();
        let options = BundlerOptions::default()
            .with_alias("@lib", lib_abs.display().to_string())
            .with_alias("@libs", "/nowhere");
        let resolver = set(&options, dir.path(), PluginBridge::disabled());

        let r = resolver.resolve("@lib/x", None, dir.path()).await;
        assert_eq!(resolved_id(&r), lib_abs.join("x.js").display().to_string());

        // "@libx" is not "@lib" followed by a path separator.
        let r = resolver.resolve("@libx", None, dir.path()).await;
        assert!(r.outcome.resolved().is_none());
    }

    #[tokio::test]
    async fn test_relative_alias_target_uses_root() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("src/components")).unwrap();
        fs::write(dir.path().join("src/components/button.tsx"), "").unwrap();

        let options = BundlerOptions::default().with_alias("@", "./src");
        let resolver = set(&options, dir.path(), PluginBridge::disabled());
        let elsewhere = tempdir().unwrap();
        let r = resolver
            .resolve("@/components/button", None, elsewhere.path())
            .await;
        assert!(resolved_id(&r).ends_with("components/button.tsx"));
    }

    #[tokio::test]
    async fn test_external_rules_skip_lookup() {
        let dir = tempdir().unwrap();
        let options = BundlerOptions::default()
            .with_external("react")
            .with_external("node:*");
        let resolver = set(&options, dir.path(), PluginBridge::disabled());

        for spec in ["react", "node:fs"] {
            let r = resolver.resolve(spec, None, dir.path()).await;
            let m = r.outcome.resolved().unwrap();
            assert!(m.external);
            assert_eq!(m.id.as_str(), spec);
        }
    }

    struct VirtualHost;

    #[async_trait]
    impl HostHooks for VirtualHost {
        async fn on_resolve(&self, args: OnResolveArgs) -> HookResult<Option<OnResolveResult>> {
            Ok(match args.importee.as_str() {
                "virtual:x" => Some(OnResolveResult::external("virtual:x")),
                "./shadowed" => Some(OnResolveResult::resolved("/virtual/shadowed.js")),
                _ => None,
            })
        }
    }

    #[tokio::test]
    async fn test_hook_wins_over_filesystem() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("shadowed.js"), "").unwrap();
        let bridge = PluginBridge::new(Some(Arc::new(VirtualHost)), CancellationToken::new(), None);
        let resolver = set(&BundlerOptions::default(), dir.path(), bridge);

        let r = resolver.resolve("./shadowed", None, dir.path()).await;
        assert_eq!(resolved_id(&r), "/virtual/shadowed.js");

        let r = resolver.resolve("virtual:x", None, dir.path()).await;
        let m = r.outcome.resolved().unwrap();
        assert!(m.external);
        assert_eq!(m.id.as_str(), "virtual:x");
    }

    #[tokio::test]
    async fn test_query_suffix_survives_resolution() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("index.js"), "").unwrap();
        let resolver = set(&BundlerOptions::default(), dir.path(), PluginBridge::disabled());

        let a = resolver.resolve("./index?0", None, dir.path()).await;
        let b = resolver.resolve("./index?1", None, dir.path()).await;
        let a = resolved_id(&a);
        let b = resolved_id(&b);
        assert!(a.ends_with("index.js?0"));
        assert!(b.ends_with("index.js?1"));
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_resolve_is_repeatable() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.js"), "").unwrap();
        let resolver = set(&BundlerOptions::default(), dir.path(), PluginBridge::disabled());

        let first = resolver.resolve("./a", None, dir.path()).await;
        let second = resolver.resolve("./a", None, dir.path()).await;
        assert_eq!(first, second);
        assert_eq!(ResolveRet::from(&first.outcome).status, true);

        let missing = resolver.resolve("./nope", None, dir.path()).await;
        assert_eq!(
            ResolveRet::from(&missing.outcome),
            ResolveRet {
                status: false,
                result: None
            }
        );
    }

    #[tokio::test]
    async fn test_clear_cache_sees_new_files() {
        let dir = tempdir().unwrap();
        let resolver = set(&BundlerOptions::default(), dir.path(), PluginBridge::disabled());

        let before = resolver.resolve("./late", None, dir.path()).await;
        assert!(before.outcome.resolved().is_none());

        fs::write(dir.path().join("late.js"), "").unwrap();
        let cached = resolver.resolve("./late", None, dir.path()).await;
        assert!(cached.outcome.resolved().is_none());

        resolver.clear_cache();
        let after = resolver.resolve("./late", None, dir.path()).await;
        assert!(after.outcome.resolved().is_some());
    }
}
