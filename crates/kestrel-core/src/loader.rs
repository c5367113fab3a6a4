//! Loading and transforming module sources.
//!
//! `load(id)` gives the host's `onLoad` hook first refusal, then reads the file.
//! The loader kind comes from a hook override or the extension map. The selected
//! [`Transform`] turns raw bytes into JS ready for dependency extraction. The
//! built-in transforms only normalize; real compilers plug in through the trait.

use crate::error::BuildError;
use crate::module_id::ModuleId;
use crate::plugin::PluginBridge;
use crate::scan::{self, DependencySpec};
use base64::Engine as _;
use rustc_hash::FxHashMap as HashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::trace;

/// Named transform applied to a module's raw source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LoaderKind {
    #[serde(rename = "js")]
    Js,
    #[serde(rename = "jsx")]
    Jsx,
    #[serde(rename = "ts")]
    Ts,
    #[serde(rename = "tsx")]
    Tsx,
    #[serde(rename = "css")]
    Css,
    #[serde(rename = "json")]
    Json,
    #[serde(rename = "text")]
    Text,
    #[serde(rename = "dataURI", alias = "dataurl", alias = "datauri")]
    DataUri,
}

impl LoaderKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Js => "js",
            Self::Jsx => "jsx",
            Self::Ts => "ts",
            Self::Tsx => "tsx",
            Self::Css => "css",
            Self::Json => "json",
            Self::Text => "text",
            Self::DataUri => "dataURI",
        }
    }

    #[must_use]
    pub fn is_js_like(self) -> bool {
        matches!(self, Self::Js | Self::Jsx | Self::Ts | Self::Tsx)
    }
}

impl fmt::Display for LoaderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LoaderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "js" => Ok(Self::Js),
            "jsx" => Ok(Self::Jsx),
            "ts" => Ok(Self::Ts),
            "tsx" => Ok(Self::Tsx),
            "css" => Ok(Self::Css),
            "json" => Ok(Self::Json),
            "text" => Ok(Self::Text),
            "datauri" | "dataurl" => Ok(Self::DataUri),
            other => Err(format!("unknown loader '{other}'")),
        }
    }
}

/// Raw module content and the loader chosen for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadResult {
    pub content: Vec<u8>,
    pub loader: LoaderKind,
}

/// Output of a load: the result plus a hook failure that was fallen through.
#[derive(Debug)]
pub struct Loaded {
    pub result: Result<LoadResult, BuildError>,
    pub hook_error: Option<BuildError>,
}

/// Options visible to transforms.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransformOptions {
    pub inline_style: bool,
    pub svgr: bool,
}

/// Input handed to a [`Transform`].
#[derive(Debug, Clone, Copy)]
pub struct TransformInput<'a> {
    pub id: &'a ModuleId,
    pub loader: LoaderKind,
    pub source: &'a [u8],
    pub options: TransformOptions,
}

/// Normalized module content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transformed {
    /// JS module body.
    pub code: String,
    /// Stylesheet text collected into the chunk's `.css` asset.
    pub css: Option<String>,
}

impl Transformed {
    #[must_use]
    pub fn js(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            css: None,
        }
    }
}

/// Why a transform could not produce output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransformError {
    /// Malformed input with an optional position.
    Syntax {
        message: String,
        line: Option<u32>,
        column: Option<u32>,
    },
    Failed(String),
}

/// A loader implementation. The engine treats it as a black box.
pub trait Transform: Send + Sync {
    fn transform(&self, input: TransformInput<'_>) -> Result<Transformed, TransformError>;
}

/// Default transforms for every [`LoaderKind`].
#[derive(Debug, Clone, Copy, Default)]
pub struct BuiltinTransform;

impl Transform for BuiltinTransform {
    fn transform(&self, input: TransformInput<'_>) -> Result<Transformed, TransformError> {
        let text = || String::from_utf8_lossy(input.source).into_owned();
        match input.loader {
            LoaderKind::Js | LoaderKind::Jsx | LoaderKind::Ts | LoaderKind::Tsx => {
                Ok(Transformed::js(text()))
            }
            LoaderKind::Json => {
                let value: serde_json::Value =
                    serde_json::from_slice(input.source).map_err(|e| TransformError::Syntax {
                        message: e.to_string(),
                        line: u32::try_from(e.line()).ok(),
                        column: u32::try_from(e.column()).ok(),
                    })?;
                Ok(Transformed::js(format!("module.exports = {value};")))
            }
            LoaderKind::Text => Ok(Transformed::js(format!(
                "module.exports = {};",
                json_string(&text())
            ))),
            LoaderKind::DataUri => {
                if input.options.svgr && input.id.extension().as_deref() == Some("svg") {
                    return Ok(Transformed::js(svg_component(&text())));
                }
                let mime = mime_for(input.id.extension().as_deref());
                let encoded = base64::engine::general_purpose::STANDARD.encode(input.source);
                Ok(Transformed::js(format!(
                    "module.exports = \"data:{mime};base64,{encoded}\";"
                )))
            }
            LoaderKind::Css => {
                let css = text();
                if input.options.inline_style {
                    Ok(Transformed {
                        code: inline_style_module(input.id, &css),
                        css: Some(css),
                    })
                } else {
                    Ok(Transformed {
                        code: "module.exports = {};".to_string(),
                        css: Some(css),
                    })
                }
            }
        }
    }
}

fn json_string(s: &str) -> String {
    serde_json::Value::String(s.to_string()).to_string()
}

fn inline_style_module(id: &ModuleId, css: &str) -> String {
    format!(
        "var style = document.createElement(\"style\");\n\
         style.setAttribute(\"data-kestrel-id\", {});\n\
         style.textContent = {};\n\
         document.head.appendChild(style);\n\
         module.exports = {{}};",
        json_string(id.as_str()),
        json_string(css)
    )
}

fn svg_component(markup: &str) -> String {
    format!(
        "var markup = {};\n\
         function SvgComponent(props) {{\n\
         \x20 var React = require(\"react\");\n\
         \x20 return React.createElement(\"span\", Object.assign({{ dangerouslySetInnerHTML: {{ __html: markup }} }}, props));\n\
         }}\n\
         module.exports = SvgComponent;\n\
         module.exports.default = SvgComponent;",
        json_string(markup)
    )
}

fn mime_for(ext: Option<&str>) -> &'static str {
    match ext {
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("woff") => "font/woff",
        Some("woff2") => "font/woff2",
        _ => "application/octet-stream",
    }
}

/// Module id -> transformed source.
pub struct LoaderPipeline {
    loaders: BTreeMap<String, LoaderKind>,
    transforms: HashMap<LoaderKind, Arc<dyn Transform>>,
    builtin: BuiltinTransform,
    options: TransformOptions,
    bridge: Arc<PluginBridge>,
}

impl fmt::Debug for LoaderPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoaderPipeline")
            .field("loaders", &self.loaders)
            .field("custom", &self.transforms.keys().collect::<Vec<_>>())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl LoaderPipeline {
    #[must_use]
    pub fn new(
        loaders: BTreeMap<String, LoaderKind>,
        options: TransformOptions,
        bridge: Arc<PluginBridge>,
    ) -> Self {
        Self {
            loaders,
            transforms: HashMap::default(),
            builtin: BuiltinTransform,
            options,
            bridge,
        }
    }

    /// Replace the transform used for `kind`.
    pub fn register(&mut self, kind: LoaderKind, transform: Arc<dyn Transform>) {
        self.transforms.insert(kind, transform);
    }

    /// Loader for `id` from the extension map.
    pub fn select(&self, id: &ModuleId) -> Result<LoaderKind, BuildError> {
        let ext = id.extension().unwrap_or_default();
        self.loaders.get(&ext).copied().ok_or_else(|| {
            BuildError::load(
                id.as_str(),
                if ext.is_empty() {
                    "no loader for extension (file has none)".to_string()
                } else {
                    format!("no loader for extension '.{ext}'")
                },
            )
        })
    }

    /// Obtain raw content for `id`.
    pub async fn load(&self, id: &ModuleId) -> Loaded {
        let mut hook_error = None;
        let mut override_loader = None;

        match self.bridge.load(id.as_str()).await {
            Ok(Some(answer)) => {
                if let Some(name) = &answer.loader {
                    match name.parse::<LoaderKind>() {
                        Ok(kind) => override_loader = Some(kind),
                        Err(reason) => {
                            return Loaded {
                                result: Err(BuildError::load(id.as_str(), reason)),
                                hook_error: None,
                            };
                        }
                    }
                }
                if let Some(content) = answer.content {
                    trace!(id = %id, "content supplied by onLoad");
                    let loader = match override_loader {
                        Some(kind) => Ok(kind),
                        None => self.select(id),
                    };
                    return Loaded {
                        result: loader.map(|loader| LoadResult {
                            content: content.into_bytes(),
                            loader,
                        }),
                        hook_error: None,
                    };
                }
            }
            Ok(None) => {}
            Err(e) => hook_error = Some(e),
        }

        let result = async {
            let loader = match override_loader {
                Some(kind) => kind,
                None => self.select(id)?,
            };
            let path = id.path();
            let content = tokio::fs::read(&path)
                .await
                .map_err(|e| BuildError::load(id.as_str(), e.to_string()))?;
            Ok::<_, BuildError>(LoadResult { content, loader })
        }
        .await;

        Loaded { result, hook_error }
    }

    /// Run the loader's transform over loaded content.
    pub fn transform(&self, id: &ModuleId, loaded: &LoadResult) -> Result<Transformed, BuildError> {
        let input = TransformInput {
            id,
            loader: loaded.loader,
            source: &loaded.content,
            options: self.options,
        };
        let output = match self.transforms.get(&loaded.loader) {
            Some(custom) => custom.transform(input),
            None => self.builtin.transform(input),
        };
        output.map_err(|e| match e {
            TransformError::Syntax {
                message,
                line,
                column,
            } => BuildError::Parse {
                id: id.to_string(),
                line,
                column,
                message,
            },
            TransformError::Failed(reason) => BuildError::load(id.as_str(), reason),
        })
    }
}

/// Extract dependency specifiers from transformed content.
pub fn extract_dependencies(
    id: &ModuleId,
    loader: LoaderKind,
    transformed: &Transformed,
) -> Result<Vec<DependencySpec>, BuildError> {
    let scanned = match (&transformed.css, loader) {
        (Some(css), LoaderKind::Css) => scan::scan_css(css),
        _ => scan::scan_js(&transformed.code),
    };
    scanned.map_err(|e| BuildError::Parse {
        id: id.to_string(),
        line: Some(e.line),
        column: Some(e.column),
        message: e.message,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BundlerOptions;
    use crate::plugin::{HookResult, HostHooks, OnLoadArgs, OnLoadResult};
    use async_trait::async_trait;
    use tempfile::tempdir;
    use tokio_util::sync::CancellationToken;

    fn pipeline(bridge: PluginBridge, options: TransformOptions) -> LoaderPipeline {
        LoaderPipeline::new(
            BundlerOptions::default().loader_map(),
            options,
            Arc::new(bridge),
        )
    }

    struct VirtualOnly;

    #[async_trait]
    impl HostHooks for VirtualOnly {
        async fn on_load(&self, args: OnLoadArgs) -> HookResult<Option<OnLoadResult>> {
            match args.id.as_str() {
                "virtual:config" => Ok(Some(
                    OnLoadResult::content("export default 1;").with_loader("js"),
                )),
                "virtual:bad" => Ok(Some(OnLoadResult::content("x").with_loader("cobol"))),
                _ => Ok(None),
            }
        }
    }

    #[tokio::test]
    async fn test_load_from_filesystem() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("a.js");
        std::fs::write(&file, "import './b';").unwrap();

        let loader = pipeline(PluginBridge::disabled(), TransformOptions::default());
        let id = ModuleId::from_path(&file, Some("0"));
        let loaded = loader.load(&id).await;
        let result = loaded.result.unwrap();
        assert_eq!(result.loader, LoaderKind::Js);
        assert_eq!(result.content, b"import './b';");
        assert!(loaded.hook_error.is_none());
    }

    #[tokio::test]
    async fn test_hook_content_wins() {
        let bridge = PluginBridge::new(
            Some(Arc::new(VirtualOnly)),
            CancellationToken::new(),
            None,
        );
        let loader = pipeline(bridge, TransformOptions::default());
        let result = loader
            .load(&ModuleId::new("virtual:config"))
            .await
            .result
            .unwrap();
        assert_eq!(result.content, b"export default 1;");
        assert_eq!(result.loader, LoaderKind::Js);
    }

    #[tokio::test]
    async fn test_unknown_hook_loader_is_load_error() {
        let bridge = PluginBridge::new(
            Some(Arc::new(VirtualOnly)),
            CancellationToken::new(),
            None,
        );
        let loader = pipeline(bridge, TransformOptions::default());
        let err = loader
            .load(&ModuleId::new("virtual:bad"))
            .await
            .result
            .unwrap_err();
        assert!(err.to_string().contains("unknown loader 'cobol'"));
    }

    #[tokio::test]
    async fn test_no_loader_for_extension() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("notes.xyz");
        std::fs::write(&file, "hello").unwrap();

        let loader = pipeline(PluginBridge::disabled(), TransformOptions::default());
        let err = loader
            .load(&ModuleId::from_path(&file, None))
            .await
            .result
            .unwrap_err();
        assert_eq!(err.code(), crate::error::codes::LOAD_ERROR);
        assert!(err.to_string().contains("no loader for extension '.xyz'"));
    }

    #[tokio::test]
    async fn test_missing_file_is_load_error() {
        let loader = pipeline(PluginBridge::disabled(), TransformOptions::default());
        let err = loader
            .load(&ModuleId::new("/definitely/not/here.js"))
            .await
            .result
            .unwrap_err();
        assert!(matches!(err, BuildError::Load { .. }));
    }

    #[test]
    fn test_json_transform_and_parse_error() {
        let loader = pipeline(PluginBridge::disabled(), TransformOptions::default());
        let id = ModuleId::new("/data.json");
        let ok = loader
            .transform(
                &id,
                &LoadResult {
                    content: br#"{"a": 1}"#.to_vec(),
                    loader: LoaderKind::Json,
                },
            )
            .unwrap();
        assert_eq!(ok.code, r#"module.exports = {"a":1};"#);

        let err = loader
            .transform(
                &id,
                &LoadResult {
                    content: b"{\n  \"a\": }".to_vec(),
                    loader: LoaderKind::Json,
                },
            )
            .unwrap_err();
        match err {
            BuildError::Parse { line, .. } => assert_eq!(line, Some(2)),
            other => panic!("expected parse error, got {other:?}"),
        }
    }

    #[test]
    fn test_css_modes() {
        let id = ModuleId::new("/style.css");
        let content = LoadResult {
            content: b"@import './base.css';\nbody{}".to_vec(),
            loader: LoaderKind::Css,
        };

        let separate = pipeline(PluginBridge::disabled(), TransformOptions::default());
        let out = separate.transform(&id, &content).unwrap();
        assert_eq!(out.code, "module.exports = {};");
        assert!(out.css.as_deref().unwrap().contains("body{}"));
        let deps = extract_dependencies(&id, LoaderKind::Css, &out).unwrap();
        assert_eq!(deps[0].specifier, "./base.css");

        let inline = pipeline(
            PluginBridge::disabled(),
            TransformOptions {
                inline_style: true,
                svgr: false,
            },
        );
        let out = inline.transform(&id, &content).unwrap();
        assert!(out.code.contains("document.createElement(\"style\")"));
        let deps = extract_dependencies(&id, LoaderKind::Css, &out).unwrap();
        assert_eq!(deps.len(), 1);
    }

    #[test]
    fn test_svg_data_uri_and_svgr() {
        let id = ModuleId::new("/logo.svg");
        let content = LoadResult {
            content: b"<svg></svg>".to_vec(),
            loader: LoaderKind::DataUri,
        };

        let plain = pipeline(PluginBridge::disabled(), TransformOptions::default());
        let out = plain.transform(&id, &content).unwrap();
        assert!(out.code.starts_with("module.exports = \"data:image/svg+xml;base64,"));

        let svgr = pipeline(
            PluginBridge::disabled(),
            TransformOptions {
                inline_style: false,
                svgr: true,
            },
        );
        let out = svgr.transform(&id, &content).unwrap();
        assert!(out.code.contains("function SvgComponent"));
        let deps = extract_dependencies(&id, LoaderKind::DataUri, &out).unwrap();
        assert_eq!(deps[0].specifier, "react");
    }

    struct Upper;

    impl Transform for Upper {
        fn transform(&self, input: TransformInput<'_>) -> Result<Transformed, TransformError> {
            Ok(Transformed::js(
                String::from_utf8_lossy(input.source).to_uppercase(),
            ))
        }
    }

    #[test]
    fn test_registered_transform_overrides_builtin() {
        let mut loader = pipeline(PluginBridge::disabled(), TransformOptions::default());
        loader.register(LoaderKind::Text, Arc::new(Upper));
        let out = loader
            .transform(
                &ModuleId::new("/a.txt"),
                &LoadResult {
                    content: b"hi".to_vec(),
                    loader: LoaderKind::Text,
                },
            )
            .unwrap();
        assert_eq!(out.code, "HI");
    }

    #[test]
    fn test_loader_kind_from_str() {
        assert_eq!("dataURI".parse::<LoaderKind>(), Ok(LoaderKind::DataUri));
        assert_eq!("TSX".parse::<LoaderKind>(), Ok(LoaderKind::Tsx));
        assert!("cobol".parse::<LoaderKind>().is_err());
    }
}
