//! `kestrel build` command implementation.

use crate::watch;
use kestrel_core::{BuildResult, BundlerOptions, Engine, Error};
use miette::{IntoDiagnostic, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Build command action.
#[derive(Debug, Clone)]
pub struct BuildAction {
    pub cwd: PathBuf,
    pub config: Option<PathBuf>,
    /// `name=path` pairs; replace the config's entries when non-empty.
    pub entries: Vec<String>,
    pub outdir: Option<PathBuf>,
    pub splitting: bool,
    pub minify: bool,
    pub sourcemap: bool,
    pub strict: bool,
    pub watch: bool,
    pub debounce_ms: u64,
}

/// Apply command-line overrides on top of the loaded options.
pub fn options_for(action: &BuildAction) -> Result<BundlerOptions> {
    let mut options = super::load_options(&action.cwd, action.config.as_deref())?;

    if !action.entries.is_empty() {
        options.entries.clear();
        for entry in &action.entries {
            let (name, path) = parse_entry(entry)
                .ok_or_else(|| miette::miette!("invalid entry '{entry}', expected NAME=PATH"))?;
            options = options.with_entry(name, path);
        }
    }
    if let Some(outdir) = &action.outdir {
        options = options.with_outdir(action.cwd.join(outdir));
    }
    if action.splitting {
        options = options.with_code_splitting(true);
    }
    if action.minify {
        options = options.with_minify(true);
    }
    if action.sourcemap {
        options = options.with_source_map(true);
    }
    if action.strict {
        options = options.with_strict(true);
    }
    Ok(options)
}

/// `main=./src/index.js` -> (`main`, `./src/index.js`). A bare path names its
/// entry after the file stem.
fn parse_entry(raw: &str) -> Option<(String, String)> {
    if let Some((name, path)) = raw.split_once('=') {
        let (name, path) = (name.trim(), path.trim());
        if name.is_empty() || path.is_empty() {
            return None;
        }
        return Some((name.to_string(), path.to_string()));
    }
    let stem = std::path::Path::new(raw).file_stem()?.to_str()?;
    Some((stem.to_string(), raw.to_string()))
}

/// Run the build command.
pub async fn run(action: BuildAction, json: bool) -> Result<()> {
    let options = options_for(&action)?;
    let engine = Arc::new(Engine::create(options, None).into_diagnostic()?);

    let start = Instant::now();
    let outcome = engine.build().await;
    let elapsed = start.elapsed();

    let ok = report(&engine, outcome, elapsed, json)?;

    if action.watch {
        let window = Duration::from_millis(action.debounce_ms);
        return watch::run(engine, window).await;
    }
    if !ok {
        std::process::exit(1);
    }
    Ok(())
}

/// Print the outcome of a build. Returns whether it succeeded.
pub fn report(
    engine: &Engine,
    outcome: kestrel_core::Result<Arc<BuildResult>>,
    elapsed: Duration,
    json: bool,
) -> Result<bool> {
    let result = match outcome {
        Ok(result) => result,
        Err(Error::BuildFailed { .. }) => engine.last_result(),
        Err(e) => return Err(e).into_diagnostic(),
    };

    if json {
        println!("{}", result.to_json().into_diagnostic()?);
        return Ok(result.success);
    }

    for chunk in &result.chunks {
        println!(
            "  {} -> {} ({} modules)",
            chunk.name,
            chunk.files.first().map_or("-", String::as_str),
            chunk.modules.len()
        );
        for extra in chunk.files.iter().skip(1) {
            println!("    + {extra}");
        }
    }
    for diagnostic in &result.errors {
        match &diagnostic.module {
            Some(module) => eprintln!("  error[{}]: {} ({module})", diagnostic.code, diagnostic.message),
            None => eprintln!("  error[{}]: {}", diagnostic.code, diagnostic.message),
        }
    }
    println!(
        "  {} modules, {} chunks, {}ms",
        result.modules.len(),
        result.chunks.len(),
        elapsed.as_millis()
    );
    Ok(result.success)
}
