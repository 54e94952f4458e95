//! CLI for huorn VM bundles and guest sessions.

#![allow(
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::missing_docs_in_private_items
)]

mod session;
mod vm;

use std::path::PathBuf;

use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use huorn::BundleStore;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "huorn", version, about = "Local VM bundles, serial consoles and SSH sessions")]
struct Cli {
    /// Storage root holding `*.huornvm` bundles (default: $HUORN_HOME or the
    /// platform data directory).
    #[arg(long, global = true, value_name = "DIR")]
    storage: Option<PathBuf>,

    /// Log debug output to stderr.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List VM bundles, most recently modified first.
    #[command(visible_alias = "ps")]
    Ls(vm::LsArgs),

    /// Show the configuration and artifacts of a bundle.
    Inspect(vm::TargetArgs),

    /// Verify that a bundle is complete.
    Check(vm::TargetArgs),

    /// Open an interactive SSH session to a guest.
    Ssh(session::SshArgs),

    /// Run one command on a guest over SSH.
    Exec(session::ExecArgs),

    /// Generate shell completion scripts.
    #[command(hide = true)]
    Completion {
        /// Target shell.
        shell: Shell,
    },
}

/// Output format for list/inspect commands.
#[derive(Debug, Clone, Copy, Default, clap::ValueEnum)]
pub(crate) enum OutputFormat {
    /// Human-readable table.
    #[default]
    Table,
    /// Machine-readable JSON.
    Json,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    if let Err(e) = cli.dispatch().await {
        eprintln!("huorn: {e:#}");
        std::process::exit(1);
    }
}

/// `RUST_LOG` wins unless `-v` is given; the fallback is `warn`.
fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

impl Cli {
    async fn dispatch(self) -> Result<()> {
        match self.command {
            Command::Ls(args) => vm::ls(&open_store(self.storage)?, &args),
            Command::Inspect(args) => vm::inspect(&open_store(self.storage)?, &args),
            Command::Check(args) => vm::check(&open_store(self.storage)?, &args),
            Command::Ssh(args) => session::ssh(args).await,
            Command::Exec(args) => session::exec(args).await,
            Command::Completion { shell } => {
                clap_complete::generate(shell, &mut Self::command(), "huorn", &mut std::io::stdout());
                Ok(())
            }
        }
    }
}

/// Opens the bundle store at `--storage`, or the default root.
fn open_store(storage: Option<PathBuf>) -> Result<BundleStore> {
    let root = match storage {
        Some(root) => root,
        None => huorn::default_storage_dir()?,
    };
    tracing::debug!(root = %root.display(), "using storage root");
    Ok(BundleStore::new(root))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn global_flags_follow_subcommands() {
        let cli = Cli::try_parse_from(["huorn", "ls", "--storage", "/tmp/vms", "-v"]).unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.storage.as_deref(), Some(std::path::Path::new("/tmp/vms")));
        assert!(matches!(cli.command, Command::Ls(_)));
    }

    #[test]
    fn exec_takes_trailing_command() {
        let cli = Cli::try_parse_from(["huorn", "exec", "10.0.0.2", "-p", "2222", "--", "ls", "-la"])
            .unwrap();
        let Command::Exec(args) = cli.command else {
            panic!("expected exec");
        };
        assert_eq!(args.target.host, "10.0.0.2");
        assert_eq!(args.target.port, 2222);
        assert_eq!(args.command, ["ls", "-la"]);
    }
}
