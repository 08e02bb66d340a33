//! Paker - dependency resolution, caching, and parallel install for
//! C/C++ packages fetched directly from source control.

use clap::{Parser, Subcommand};
use miette::Result;
use paker_context::Context;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "paker")]
#[command(version, about = "A C/C++ package manager core", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(flatten)]
    global: GlobalOptions,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct GlobalOptions {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress all output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Path to the project manifest
    #[arg(long, global = true)]
    manifest: Option<PathBuf>,

    /// Number of parallel install workers
    #[arg(short, long, global = true, env = "PAKER_PARALLELISM")]
    jobs: Option<usize>,
}

#[derive(Subcommand)]
enum Commands {
    /// Create an empty project manifest
    Init,

    /// Add a dependency, resolve, and install
    Add {
        /// Package name, optionally with a version: pkg@1.0.0
        package: String,
    },

    /// Drop a dependency and unlink it
    Remove {
        /// Package name
        package: String,
    },

    /// Print declared and installed packages
    List,

    /// Resolve and write the lockfile
    Lock,

    /// Install dependencies
    Install {
        /// Fail instead of re-resolving if the lockfile is stale
        #[arg(long)]
        frozen: bool,
    },

    /// Re-resolve with a constraint loosened to the latest version
    Upgrade {
        /// Specific package to upgrade; every dependency if omitted
        package: Option<String>,
    },

    /// Print the dependency tree
    Tree,

    /// Garbage-collect unused links and cache entries
    Clean {
        /// Seconds an unreferenced cache entry may sit idle before eviction
        #[arg(long, default_value_t = 0)]
        ttl: u64,
    },

    /// Show metadata for a built-in package (unspecified, trivial pass-through)
    Info {
        /// Package name
        package: String,
    },

    /// Search the built-in repository table (unspecified, trivial pass-through)
    Search {
        /// Substring to match against package names
        query: String,
    },
}

fn project_dir(manifest: Option<PathBuf>) -> PathBuf {
    match manifest {
        Some(path) => path
            .parent()
            .map(std::path::Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(".")),
        None => std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    paker_diagnostics::setup();

    let cli = Cli::parse();

    let log_level = match cli.global.verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };

    if !cli.global.quiet {
        tracing_subscriber::fmt()
            .with_max_level(log_level)
            .with_target(false)
            .init();
    }

    match run(cli).await {
        Ok(code) => ExitCode::from(code as u8),
        Err(report) => {
            eprintln!("{report:?}");
            ExitCode::from(1)
        }
    }
}

async fn run(cli: Cli) -> Result<i32> {
    let dir = project_dir(cli.global.manifest.clone());
    let ctx = Context::from_env(dir).map_err(paker_diagnostics::PakerError::from)?;

    match cli.command {
        Commands::Init => match ctx.init() {
            Ok(()) => {
                println!("initialized {}", ctx.project_dir.display());
                Ok(0)
            }
            Err(paker_context::ContextError::AlreadyInitialized(_)) => {
                println!("already initialized");
                Ok(1)
            }
            Err(e) => Err(to_report(e)),
        },

        Commands::Add { package } => {
            let (name, constraint) = match package.split_once('@') {
                Some((name, version)) => (name.to_string(), format!("={version}")),
                None => (package, "*".to_string()),
            };
            let graph = ctx.add(&name, &constraint).map_err(to_report)?;
            println!("resolved {} packages", graph.nodes().count());
            let report = ctx.install(false).await.map_err(to_report)?;
            println!("linked {} packages", report.linked.len());
            Ok(exit_for_install(&report))
        }

        Commands::Remove { package } => {
            let removed = ctx.remove(&package).map_err(to_report)?;
            if removed {
                println!("removed {package}");
            } else {
                println!("{package} was not declared");
            }
            Ok(0)
        }

        Commands::List => {
            let deps = ctx.list().map_err(to_report)?;
            for (name, constraint) in deps {
                println!("{name} {constraint}");
            }
            Ok(0)
        }

        Commands::Lock => {
            let lockfile = ctx.lock().map_err(to_report)?;
            println!("locked {} packages", lockfile.dependencies.len());
            Ok(0)
        }

        Commands::Install { frozen } => {
            let report = ctx.install(frozen).await.map_err(to_report)?;
            println!("linked {} packages", report.linked.len());
            for (package, err) in &report.failures {
                eprintln!("failed: {package}: {err}");
            }
            Ok(exit_for_install(&report))
        }

        Commands::Upgrade { package } => {
            let report = ctx.upgrade(package.as_deref()).await.map_err(to_report)?;
            println!("linked {} packages", report.linked.len());
            Ok(exit_for_install(&report))
        }

        Commands::Tree => {
            let tree = ctx.tree().map_err(to_report)?;
            print!("{tree}");
            Ok(0)
        }

        Commands::Clean { ttl } => {
            let evicted = ctx.clean(ttl).map_err(to_report)?;
            println!("evicted {} cache entries", evicted.len());
            Ok(0)
        }

        Commands::Info { package } => {
            match paker_types::builtin_repos().get(package.as_str()) {
                Some(url) => println!("{package}: {url}"),
                None => println!("{package}: not in the built-in repository table"),
            }
            Ok(0)
        }

        Commands::Search { query } => {
            let mut matches: Vec<&&str> = paker_types::builtin_repos()
                .keys()
                .filter(|name| name.contains(&query.as_str()))
                .collect();
            matches.sort();
            for name in matches {
                println!("{name}");
            }
            Ok(0)
        }
    }
}

fn exit_for_install(report: &paker_installer::InstallReport) -> i32 {
    if report.is_success() {
        0
    } else {
        1
    }
}

fn to_report(err: paker_context::ContextError) -> miette::Report {
    miette::Report::new(paker_diagnostics::PakerError::from(err))
}
