//! CLI command implementations.

pub mod build;
pub mod resolve;

use kestrel_core::BundlerOptions;
use miette::{IntoDiagnostic, Result};
use std::path::Path;

/// Config file looked up in the working directory when none is given.
pub const DEFAULT_CONFIG: &str = "kestrel.json";

/// Options from `config`, from `kestrel.json` in `cwd`, or defaults rooted at `cwd`.
pub fn load_options(cwd: &Path, config: Option<&Path>) -> Result<BundlerOptions> {
    let path = match config {
        Some(path) => cwd.join(path),
        None => {
            let default = cwd.join(DEFAULT_CONFIG);
            if !default.is_file() {
                return Ok(BundlerOptions::new(cwd));
            }
            default
        }
    };
    tracing::debug!(path = %path.display(), "loading config");
    BundlerOptions::from_file(&path).into_diagnostic()
}
