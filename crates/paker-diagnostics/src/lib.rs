//! Umbrella error type and diagnostic report hook for Paker.
//!
//! Grounded on `gust-diagnostics/src/lib.rs`'s `GustError`/`setup()`: one
//! `miette::Diagnostic` variant per error kind, `#[from]` conversions from
//! each component crate's own `thiserror` enum, and a report hook installed
//! once in `main`.

pub use miette::{Diagnostic, Report, Result};
use thiserror::Error;

#[derive(Error, Diagnostic, Debug)]
pub enum PakerError {
    #[error("malformed manifest: {0}")]
    #[diagnostic(code(paker::parse_error), help("check the manifest's JSON syntax"))]
    ParseError(#[from] paker_manifest::ManifestError),

    #[error("invalid version or constraint: {0}")]
    #[diagnostic(code(paker::parse_error))]
    ConstraintParseError(#[from] paker_types::ParseError),

    #[error(transparent)]
    #[diagnostic(code(paker::resolve::error))]
    Resolve(#[from] paker_resolver::ResolveError),

    #[error(transparent)]
    #[diagnostic(
        code(paker::graph::error),
        help("a package cannot depend on itself, directly or transitively")
    )]
    Graph(#[from] paker_graph::GraphError),

    #[error("network error: {0}")]
    #[diagnostic(
        code(paker::network::error),
        help("check connectivity and that the source url is reachable")
    )]
    Network(#[from] paker_fetch::FetchError),

    #[error("cache error: {0}")]
    #[diagnostic(code(paker::cache::error))]
    Cache(#[from] paker_cache::CacheError),

    #[error("install error: {0}")]
    #[diagnostic(code(paker::install::error))]
    Install(#[from] paker_installer::InstallError),

    #[error("lockfile error: {0}")]
    #[diagnostic(code(paker::lockfile::error))]
    Lockfile(#[from] paker_lockfile::LockfileError),

    #[error("operation cancelled")]
    #[diagnostic(code(paker::cancelled))]
    Cancelled,

    #[error("io error: {0}")]
    #[diagnostic(code(paker::io::error))]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    #[diagnostic(code(paker::generic))]
    Generic(String),
}

impl PakerError {
    /// The process exit code for this error, per the CLI's exit table: a stable,
    /// narrow set of non-zero codes rather than one per variant.
    pub fn exit_code(&self) -> i32 {
        match self {
            PakerError::Resolve(paker_resolver::ResolveError::ConflictSet { .. }) => 3,
            PakerError::Resolve(paker_resolver::ResolveError::CycleDetected(_)) => 4,
            PakerError::Graph(paker_graph::GraphError::CycleDetected(_)) => 4,
            PakerError::Lockfile(paker_lockfile::LockfileError::StaleLockfile { .. }) => 5,
            PakerError::Network(_) => 6,
            PakerError::Cancelled => 130,
            _ => 1,
        }
    }
}

impl From<paker_context::ContextError> for PakerError {
    fn from(err: paker_context::ContextError) -> Self {
        match err {
            paker_context::ContextError::Manifest(e) => PakerError::ParseError(e),
            paker_context::ContextError::Resolve(e) => PakerError::Resolve(e),
            paker_context::ContextError::Cache(e) => PakerError::Cache(e),
            paker_context::ContextError::Lockfile(e) => PakerError::Lockfile(e),
            other => PakerError::Generic(other.to_string()),
        }
    }
}

/// Install a `miette` report hook once in `main`. `fancy`'s formatting is
/// kept (terminal links, unicode box-drawing, source context) but color is
/// disabled: no colored output is in scope for this tool.
pub fn setup() {
    miette::set_hook(Box::new(|_| {
        Box::new(
            miette::MietteHandlerOpts::new()
                .terminal_links(true)
                .unicode(true)
                .context_lines(2)
                .tab_width(4)
                .color(false)
                .build(),
        )
    }))
    .ok();
}
