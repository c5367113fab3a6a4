//! `kestrel resolve` and `kestrel resolve-file` command implementations.

use kestrel_core::{resolve_file, Engine, ResolveRet};
use miette::{IntoDiagnostic, Result};
use serde::Serialize;
use std::path::Path;

#[derive(Serialize)]
struct ResolveFileJson {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// Resolve through the engine: aliases, externals and the filesystem.
pub async fn run(
    cwd: &Path,
    config: Option<&Path>,
    specifier: &str,
    dir: Option<&Path>,
    json: bool,
) -> Result<()> {
    let mut options = super::load_options(cwd, config)?;
    // Resolution needs no entries, but validation insists on one.
    if options.entries.is_empty() {
        options = options.with_entry("resolve", ".");
    }
    let engine = Engine::create(options, None).into_diagnostic()?;
    let dir = dir.map_or_else(|| cwd.to_path_buf(), |d| cwd.join(d));

    let ret: ResolveRet = engine.resolve(specifier, &dir).await;
    if json {
        println!("{}", serde_json::to_string(&ret).into_diagnostic()?);
    } else if let Some(result) = &ret.result {
        println!("{result}");
    } else {
        eprintln!("error: cannot resolve '{specifier}' from {}", dir.display());
    }
    if !ret.status {
        std::process::exit(1);
    }
    Ok(())
}

/// Filesystem-only resolution; no config is read.
pub fn run_file(base: &Path, import: &str, json: bool) -> Result<()> {
    let outcome = resolve_file(base, import);
    if json {
        let out = match &outcome {
            Ok(path) => ResolveFileJson {
                ok: true,
                path: Some(path.display().to_string()),
                error: None,
            },
            Err(e) => ResolveFileJson {
                ok: false,
                path: None,
                error: Some(e.to_string()),
            },
        };
        println!("{}", serde_json::to_string(&out).into_diagnostic()?);
    } else {
        match &outcome {
            Ok(path) => println!("{}", path.display()),
            Err(e) => eprintln!("error: {e}"),
        }
    }
    if outcome.is_err() {
        std::process::exit(1);
    }
    Ok(())
}
