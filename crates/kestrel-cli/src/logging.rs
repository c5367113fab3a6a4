//! Tracing setup for the `kestrel` binary. The engine crates only emit events.

use miette::{IntoDiagnostic, Result};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{filter::ParseError, fmt, prelude::*, EnvFilter};

/// Env var read for filter directives, e.g. `KESTREL_LOG=kestrel_core::builder=trace`.
pub const LOG_ENV: &str = "KESTREL_LOG";

/// Targets raised to the `-v` level regardless of `KESTREL_LOG`.
const OWN_TARGETS: [&str; 2] = ["kestrel_core", "kestrel"];

fn verbosity_level(verbosity: u8) -> LevelFilter {
    match verbosity {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    }
}

/// Everything else stays at `warn` unless `KESTREL_LOG` says otherwise.
fn build_filter(verbosity: u8) -> Result<EnvFilter, ParseError> {
    let level = verbosity_level(verbosity);
    let mut filter = EnvFilter::builder()
        .with_env_var(LOG_ENV)
        .with_default_directive(LevelFilter::WARN.into())
        .from_env_lossy();
    for target in OWN_TARGETS {
        filter = filter.add_directive(format!("{target}={level}").parse()?);
    }
    Ok(filter)
}

/// Install the global subscriber. Output goes to stderr, as JSON lines with `--json`.
pub fn init(verbosity: u8, json: bool) -> Result<()> {
    let filter = build_filter(verbosity).into_diagnostic()?;

    let json_layer = json.then(|| {
        fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .with_writer(std::io::stderr)
    });
    let text_layer = (!json).then(|| {
        fmt::layer()
            .compact()
            .with_target(false)
            .with_writer(std::io::stderr)
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .try_init()
        .into_diagnostic()
}
