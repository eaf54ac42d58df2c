//! Process entry point (§6.9). No subcommand parser lives here — the CLI
//! argument layer is out of scope; this is the process-lifecycle shim a
//! real CLI crate sits in front of: init tracing, resolve config, report
//! the outcome with a stable exit code.

use std::path::PathBuf;
use std::process::ExitCode;

use edison::config::{find_project_root, ConfigResolver};
use edison::repository::build_repositories;

/// Resolve the project root and its merged config, wire up the Task/QA/
/// Session repositories it describes, and log the outcome. Returns
/// `ExitCode::SUCCESS` once the repositories are assembled,
/// `ExitCode::FAILURE` otherwise; never panics on caller input.
#[must_use]
pub fn cli_entry(args: &[String]) -> ExitCode {
    init_tracing();

    let start = args
        .first()
        .map(PathBuf::from)
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("."));

    let root = match find_project_root(&start) {
        Ok(root) => root,
        Err(err) => {
            tracing::error!(error = %err, code = "config_error", "failed to resolve project root");
            return ExitCode::FAILURE;
        }
    };

    let active_packs = std::env::var("EDISON_ACTIVE_PACKS")
        .map(|v| v.split(',').filter(|s| !s.is_empty()).map(str::to_owned).collect())
        .unwrap_or_default();

    let resolver = ConfigResolver::new(root.clone(), active_packs);
    let config = match resolver.resolve() {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(error = %err, code = "config_error", "failed to resolve config");
            return ExitCode::FAILURE;
        }
    };

    let management_dir = root.join(".edison");
    match build_repositories(root.clone(), management_dir, &config) {
        Ok(repos) => {
            let task_count = repos.tasks.list_all().map(|t| t.len()).unwrap_or_default();
            tracing::info!(root = %root.display(), tasks = task_count, "edison repositories assembled");
            ExitCode::SUCCESS
        }
        Err(err) => {
            tracing::error!(error = %err, code = err.code(), "failed to assemble repositories");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().skip(1).collect();
    cli_entry(&args)
}
