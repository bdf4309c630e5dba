//! Command-line interface for inspecting plugin libraries.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use classload_core::config::env_vars;
use classload_core::{library, ClassLoader, ClassLoaderConfig, FactoryKey};
use serde::Serialize;

/// Load plugin libraries and report the classes they register.
#[derive(Parser, Debug)]
#[command(name = "classload")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Action to perform.
    #[command(subcommand)]
    command: Command,

    /// JSON configuration file. Defaults come from the environment.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Print machine-readable JSON.
    #[arg(long, global = true)]
    json: bool,

    /// Verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,
}

/// Available commands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Load each library under its own loader and list its classes.
    Inspect {
        /// Library paths or names resolved through the search paths.
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
    /// List native libraries in a directory.
    ListDir {
        /// Directory to scan.
        #[arg(required = true)]
        dir: PathBuf,
    },
    /// Print the effective configuration.
    Config,
}

/// Outcome of loading one library.
#[derive(Debug, Serialize)]
struct LibraryReport {
    path: PathBuf,
    loaded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    classes: Vec<FactoryKey>,
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let config = match &args.config {
        Some(path) => ClassLoaderConfig::from_file(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?,
        None => ClassLoaderConfig::from_env(),
    };
    tracing::debug!("Effective configuration: {:?}", config);

    match args.command {
        Command::Inspect { paths } => run_inspect(&config, &paths, args.json),
        Command::ListDir { dir } => run_list_dir(&dir, args.json),
        Command::Config => run_config(&config),
    }
}

fn init_logging(verbose: bool) {
    let json_logging = std::env::var(env_vars::LOG_JSON)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(false);

    let default_directive = if verbose {
        "classload=debug,classload_core=debug"
    } else {
        "classload=info,classload_core=info"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));

    // Logs go to stderr; stdout carries command output.
    if json_logging {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .compact()
            .with_writer(std::io::stderr)
            .init();
    }
}

fn inspect_library(config: &ClassLoaderConfig, library: &Path) -> LibraryReport {
    let loader = ClassLoader::native(config.clone());
    match loader.load_library(library) {
        Ok(path) => {
            let classes = loader
                .loaded_libraries()
                .into_iter()
                .filter(|record| record.path == path)
                .flat_map(|record| record.classes)
                .collect();
            LibraryReport {
                path,
                loaded: true,
                error: None,
                classes,
            }
        }
        Err(e) => LibraryReport {
            path: config.resolve(library),
            loaded: false,
            error: Some(e.to_string()),
            classes: Vec::new(),
        },
    }
}

fn run_inspect(config: &ClassLoaderConfig, paths: &[PathBuf], json: bool) -> Result<()> {
    let reports: Vec<LibraryReport> = paths
        .iter()
        .map(|path| inspect_library(config, path))
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
    } else {
        for report in &reports {
            println!("Library: {}", report.path.display());
            match &report.error {
                None => {
                    println!("  Status:  loaded");
                    println!("  Classes: {}", report.classes.len());
                    for class in &report.classes {
                        println!("    {}", class);
                    }
                }
                Some(error) => {
                    println!("  Status:  failed");
                    println!("  Error:   {}", error);
                }
            }
            println!();
        }
    }

    let failed = reports.iter().filter(|report| !report.loaded).count();
    if failed > 0 {
        anyhow::bail!("{} of {} libraries failed to load", failed, reports.len());
    }
    Ok(())
}

fn run_list_dir(dir: &Path, json: bool) -> Result<()> {
    if !dir.is_dir() {
        anyhow::bail!("Not a directory: {}", dir.display());
    }

    let libraries = library::discover(dir);
    tracing::info!("Found {} native libraries in {}", libraries.len(), dir.display());
    if json {
        println!("{}", serde_json::to_string_pretty(&libraries)?);
    } else if libraries.is_empty() {
        println!("No native libraries found in {}", dir.display());
    } else {
        for path in &libraries {
            println!("{}", path.display());
        }
    }
    Ok(())
}

fn run_config(config: &ClassLoaderConfig) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(config)?);
    Ok(())
}
