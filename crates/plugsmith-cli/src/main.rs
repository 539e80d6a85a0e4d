use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use plugsmith_installer::PipelineError;
use tracing_subscriber::EnvFilter;

mod completion;
mod config;
mod dispatch;
mod render;

use completion::CliCompletionShell;
use render::{current_output_style, render_error_lines};

#[derive(Parser, Debug)]
#[command(name = "plugsmith")]
#[command(about = "Lifecycle manager for repository-sourced plugins", long_about = None)]
#[command(version)]
struct Cli {
    /// Host directory holding plugins/, upgrade/ and state/.
    #[arg(long, global = true, env = "PLUGSMITH_ROOT")]
    root: Option<PathBuf>,
    /// Defaults to <root>/plugsmith.toml.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// GitHub token; overrides [source] token.
    #[arg(long, global = true, env = "PLUGSMITH_GITHUB_TOKEN", hide_env_values = true)]
    token: Option<String>,
    /// -v info, -vv debug.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show the tracked state of a resource.
    Status {
        key: String,
        /// Check the host before answering.
        #[arg(long)]
        refresh: bool,
        #[arg(long)]
        json: bool,
    },
    /// Detect whether a resource is installed, installable or not a plugin.
    Check {
        key: String,
        #[arg(long)]
        branch: Option<String>,
        /// Re-check settled states and exhausted retries.
        #[arg(long)]
        force: bool,
    },
    Install {
        key: String,
        #[arg(long)]
        branch: Option<String>,
        #[arg(long)]
        activate: bool,
        /// Seconds to wait for a contended lock.
        #[arg(long, value_name = "SECS")]
        wait: Option<u64>,
    },
    Activate {
        key: String,
    },
    Deactivate {
        key: String,
    },
    /// Correct tracked states against the host.
    Reconcile,
    /// List tracked resources and their install receipts.
    List {
        #[arg(long)]
        json: bool,
    },
    /// Print recent events.
    Events {
        #[arg(long, default_value_t = 0)]
        since: u64,
        #[arg(long)]
        resource: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Release a processing lock.
    Unlock {
        key: String,
        /// Release a lock held by another holder.
        #[arg(long)]
        force: bool,
    },
    /// Drop the cached detection result of a resource.
    CacheClear {
        key: String,
    },
    Completion {
        #[arg(value_enum)]
        shell: CliCompletionShell,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match dispatch::run_cli(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let pipeline = err.downcast_ref::<PipelineError>();
            let hint = pipeline.and_then(PipelineError::hint);
            let message = match pipeline {
                Some(pipeline) => pipeline.to_string(),
                None => format!("{err:#}"),
            };
            for line in render_error_lines(current_output_style(), &message, hint) {
                eprintln!("{line}");
            }
            ExitCode::FAILURE
        }
    }
}

/// 0 = warn, 1 = info, 2+ = debug for the plugsmith crates; `RUST_LOG` wins
/// when set.
fn log_filter(verbose: u8) -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    let level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    EnvFilter::new(format!(
        "plugsmith={level},plugsmith_core={level},plugsmith_state={level},plugsmith_installer={level}"
    ))
}

fn init_logging(verbose: u8, json: bool) {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(log_filter(verbose))
        .with_writer(std::io::stderr)
        .with_target(false);
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.without_time().try_init()
    };
}
