#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::struct_excessive_bools)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]

mod commands;
mod logging;
mod watch;

use clap::Parser;
use miette::{IntoDiagnostic, Result};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "kestrel")]
#[command(author, version, about = "An incremental JavaScript module bundler", long_about = None)]
struct Cli {
    /// Increase logging verbosity (-v for DEBUG, -vv for TRACE)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Emit JSON formatted output (machine-readable)
    #[arg(long, global = true)]
    json: bool,

    /// Override the working directory
    #[arg(long, global = true, value_name = "PATH")]
    cwd: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Build the project
    Build {
        /// Config file (defaults to kestrel.json in the working directory)
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,

        /// Entry as name=path; repeatable. Replaces config entries when given.
        #[arg(short, long = "entry", value_name = "NAME=PATH")]
        entries: Vec<String>,

        /// Output directory
        #[arg(short, long, value_name = "DIR")]
        outdir: Option<PathBuf>,

        /// Extract shared modules into separate chunks
        #[arg(long)]
        splitting: bool,

        /// Minify output
        #[arg(long)]
        minify: bool,

        /// Emit source maps
        #[arg(long)]
        sourcemap: bool,

        /// Fail when any module has errors
        #[arg(long)]
        strict: bool,

        /// Rebuild on file changes
        #[arg(short, long)]
        watch: bool,

        /// Coalescing window for file events in watch mode
        #[arg(long, default_value_t = watch::DEFAULT_DEBOUNCE_MS, value_name = "MS")]
        debounce_ms: u64,
    },

    /// Resolve a specifier the way the bundler would
    Resolve {
        /// Specifier to resolve (e.g. "./util" or "react")
        specifier: String,

        /// Directory to resolve from
        #[arg(long, value_name = "DIR")]
        dir: Option<PathBuf>,

        /// Config file providing aliases and externals
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,
    },

    /// Resolve an import against the filesystem only
    ResolveFile {
        /// Base directory
        base: PathBuf,

        /// Import path, optionally with a ?query suffix
        import: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let cwd = cli
        .cwd
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("."));

    // resolve-file is pure; it needs neither logging nor a runtime.
    if let Commands::ResolveFile { base, import } = &cli.command {
        return commands::resolve::run_file(&cwd.join(base), import, cli.json);
    }

    logging::init(cli.verbose, cli.json)?;
    let rt = tokio::runtime::Runtime::new().into_diagnostic()?;

    match cli.command {
        Commands::Build {
            config,
            entries,
            outdir,
            splitting,
            minify,
            sourcemap,
            strict,
            watch,
            debounce_ms,
        } => {
            if watch && cli.json {
                eprintln!("error: --watch and --json cannot be combined");
                std::process::exit(2);
            }
            let action = commands::build::BuildAction {
                cwd,
                config,
                entries,
                outdir,
                splitting,
                minify,
                sourcemap,
                strict,
                watch,
                debounce_ms,
            };
            rt.block_on(commands::build::run(action, cli.json))
        }
        Commands::Resolve {
            specifier,
            dir,
            config,
        } => rt.block_on(commands::resolve::run(
            &cwd,
            config.as_deref(),
            &specifier,
            dir.as_deref(),
            cli.json,
        )),
        Commands::ResolveFile { .. } => unreachable!("handled before logging init"),
    }
}
