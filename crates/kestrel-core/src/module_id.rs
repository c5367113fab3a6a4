//! Canonical module identity.

use serde::{Serialize, Serializer};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Canonical module id: a resolved path, optionally followed by a `?query` suffix.
///
/// The suffix is part of the identity. `/src/index.js?0` and `/src/index.js?1`
/// are distinct modules even though they share a file on disk.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleId(Arc<str>);

impl ModuleId {
    #[must_use]
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Arc::from(id.as_ref()))
    }

    /// Build an id from a resolved path and an optional query (without the `?`).
    #[must_use]
    pub fn from_path(path: &Path, query: Option<&str>) -> Self {
        match query {
            Some(q) => Self::new(format!("{}?{q}", path.display())),
            None => Self::new(path.display().to_string()),
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The id without its query suffix.
    #[must_use]
    pub fn path_str(&self) -> &str {
        split_query(&self.0).0
    }

    #[must_use]
    pub fn path(&self) -> PathBuf {
        PathBuf::from(self.path_str())
    }

    #[must_use]
    pub fn query(&self) -> Option<&str> {
        split_query(&self.0).1
    }

    /// Lowercased file extension of the path part, if any.
    #[must_use]
    pub fn extension(&self) -> Option<String> {
        Path::new(self.path_str())
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
    }

    /// Directory used as the base for resolving this module's imports.
    #[must_use]
    pub fn dir(&self) -> PathBuf {
        Path::new(self.path_str())
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default()
    }

    /// Id rendered relative to `root`, used for keys in emitted output.
    #[must_use]
    pub fn display_relative(&self, root: &Path) -> String {
        let path = Path::new(self.path_str());
        let rel = match path.strip_prefix(root) {
            Ok(rel) => rel.to_string_lossy().replace('\\', "/"),
            Err(_) => return self.0.to_string(),
        };
        match self.query() {
            Some(q) => format!("./{rel}?{q}"),
            None => format!("./{rel}"),
        }
    }
}

/// Split `spec?query` into its parts. The query excludes the `?`.
#[must_use]
pub fn split_query(spec: &str) -> (&str, Option<&str>) {
    match spec.find('?') {
        Some(idx) => (&spec[..idx], Some(&spec[idx + 1..])),
        None => (spec, None),
    }
}

impl fmt::Debug for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ModuleId({})", self.0)
    }
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ModuleId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for ModuleId {
    fn from(s: String) -> Self {
        Self(Arc::from(s))
    }
}

impl AsRef<str> for ModuleId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Serialize for ModuleId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_is_part_of_identity() {
        let a = ModuleId::from_path(Path::new("/src/index.js"), Some("0"));
        let b = ModuleId::from_path(Path::new("/src/index.js"), Some("1"));
        assert_ne!(a, b);
        assert_eq!(a.path_str(), b.path_str());
        assert_eq!(a.query(), Some("0"));
        assert_eq!(a.as_str(), "/src/index.js?0");
    }

    #[test]
    fn test_split_query() {
        assert_eq!(split_query("./index?0"), ("./index", Some("0")));
        assert_eq!(split_query("./index"), ("./index", None));
        assert_eq!(split_query("./a?"), ("./a", Some("")));
    }

    #[test]
    fn test_extension_ignores_query() {
        let id = ModuleId::new("/src/App.TSX?raw");
        assert_eq!(id.extension().as_deref(), Some("tsx"));
        assert_eq!(ModuleId::new("virtual:x").extension(), None);
    }

    #[test]
    fn test_display_relative() {
        let id = ModuleId::new("/proj/src/a.js?1");
        assert_eq!(id.display_relative(Path::new("/proj")), "./src/a.js?1");
        let outside = ModuleId::new("react");
        assert_eq!(outside.display_relative(Path::new("/proj")), "react");
    }
}
