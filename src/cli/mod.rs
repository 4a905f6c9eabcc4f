// CLI module - Runs a set of supervised processes from a config file

mod output;

use crate::config::ProcessSpec;
use crate::process::{os_signal_source, Supervisor};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

/// Warden - supervise processes, restart them on failure
#[derive(Parser)]
#[command(name = "warden")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Enable debug logging (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start every process in a config file and supervise until interrupted
    Run {
        /// TOML or JSON file with one or more process specs
        config: PathBuf,
    },

    /// Validate a config file without starting anything
    Check {
        /// TOML or JSON file with one or more process specs
        config: PathBuf,
    },
}

impl Cli {
    /// Run the CLI application
    pub fn run() -> Result<()> {
        let cli = Cli::parse();
        init_tracing(cli.verbose);
        cli.execute()
    }

    fn execute(&self) -> Result<()> {
        match &self.command {
            Commands::Run { config } => run_config(config),
            Commands::Check { config } => check_config(config),
        }
    }
}

fn init_tracing(verbose: bool) {
    let default_directive = if verbose { "warden=debug" } else { "warden=info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

fn load_specs(config: &Path) -> Result<Vec<ProcessSpec>> {
    let specs = ProcessSpec::from_file(config)
        .with_context(|| format!("Failed to load {}", config.display()))?;
    if specs.is_empty() {
        anyhow::bail!("{} does not define any process", config.display());
    }
    Ok(specs)
}

fn check_config(config: &Path) -> Result<()> {
    let specs = load_specs(config)?;
    output::print_spec_table(&specs);
    output::print_success_msg(&format!("{} process(es) valid", specs.len()));
    Ok(())
}

fn run_config(config: &Path) -> Result<()> {
    let specs = load_specs(config)?;
    let runtime = tokio::runtime::Runtime::new().context("Failed to start the async runtime")?;

    runtime.block_on(async move {
        let supervisor = Supervisor::new();

        for spec in specs {
            if let Err(e) = supervisor.start(spec).await {
                supervisor.shutdown().await;
                return Err(e).context("Failed to start process");
            }
        }
        output::print_process_table(&supervisor.list().await);

        // The first SIGINT/SIGTERM stops everything and ends the run
        let (stop_tx, mut stop_rx) = mpsc::channel(1);
        supervisor.set_on_stopping(move || {
            let _ = stop_tx.try_send(());
        });
        supervisor.attach_signal_source(os_signal_source());

        stop_rx.recv().await;
        output::print_info("Stopping all processes...");
        supervisor.shutdown().await;
        output::print_success_msg("All processes stopped");

        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_parse_run_command() {
        let cli = Cli::try_parse_from(["warden", "run", "apps.toml", "--verbose"]).unwrap();
        assert!(cli.verbose);
        assert!(matches!(cli.command, Commands::Run { ref config } if config == Path::new("apps.toml")));
    }

    #[test]
    fn test_config_argument_required() {
        assert!(Cli::try_parse_from(["warden", "check"]).is_err());
    }

    #[test]
    fn test_check_valid_config() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("apps.toml");
        fs::write(
            &path,
            r#"
[[processes]]
name = "api"
script = "/srv/api/server"
"#,
        )
        .unwrap();

        assert!(check_config(&path).is_ok());
    }

    #[test]
    fn test_check_rejects_invalid_config() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("apps.toml");
        fs::write(
            &path,
            r#"
[[processes]]
name = "api"
restart_intervals_ms = []
"#,
        )
        .unwrap();

        assert!(check_config(&path).is_err());
    }
}
