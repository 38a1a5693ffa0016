//! termgate
//!
//! Serves interactive shells to browsers over WebSocket.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::{Parser, Subcommand};
use termgate::config::{default_config_path, Config};
use termgate::daemon::{stop_running, Daemon};
use termgate::logging;
use termgate::pidfile::{is_process_running, PidFile};

/// termgate - browser-to-terminal gateway over WebSocket.
#[derive(Parser, Debug)]
#[command(name = "termgate")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Start the daemon in the foreground
    Start {
        /// Write logs only to the log file, not to stdout
        #[arg(long)]
        log_file_only: bool,
    },

    /// Stop the running daemon
    Stop {
        /// Seconds to wait for the daemon to exit (0 = don't wait)
        #[arg(long, default_value = "30")]
        timeout: u64,
    },

    /// Write a default configuration file
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

/// Writes the default configuration to `path`.
fn init_config(path: &Path, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!(
            "{} already exists (use --force to overwrite)",
            path.display()
        );
    }
    Config::default().save(path)
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default()?,
    };
    config.apply_env_overrides();
    if cli.verbose {
        config.daemon.log_level = "debug".to_string();
    }
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start { log_file_only } => {
            let config = load_config(&cli)?;
            let _log_guard = logging::init(&config, !log_file_only)?;
            tracing::info!(
                config = ?cli.config,
                bind_address = %config.server.bind_address,
                shell = %config.terminal.shell,
                "Configuration loaded"
            );

            Daemon::new(config).run().await?;
        }
        Commands::Stop { timeout } => {
            let config = load_config(&cli)?;
            let pid_file = PidFile::new(config.daemon.pid_file());
            let pid = match stop_running(&pid_file) {
                Ok(pid) => pid,
                Err(e) => {
                    eprintln!("Failed to stop termgate: {:#}", e);
                    std::process::exit(1);
                }
            };
            println!("Sent SIGTERM to termgate (PID {})", pid);

            if timeout > 0 && !wait_for_exit(pid, Duration::from_secs(timeout)).await {
                eprintln!("termgate (PID {}) did not exit within {}s", pid, timeout);
                std::process::exit(1);
            }
        }
        Commands::InitConfig { force } => {
            let path = cli.config.clone().unwrap_or_else(default_config_path);
            init_config(&path, force)?;
            println!("Wrote default configuration to {}", path.display());
        }
    }

    Ok(())
}

/// Polls until `pid` is gone or `timeout` elapses.
async fn wait_for_exit(pid: u32, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while is_process_running(pid) {
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_start() {
        let cli = Cli::parse_from(["termgate", "start", "--log-file-only"]);
        assert!(matches!(cli.command, Commands::Start { log_file_only: true }));
        assert!(cli.config.is_none());
    }

    #[test]
    fn test_parse_stop_with_global_config() {
        let cli = Cli::parse_from(["termgate", "stop", "--timeout", "5", "-c", "/etc/termgate.toml"]);
        assert!(matches!(cli.command, Commands::Stop { timeout: 5 }));
        assert_eq!(cli.config, Some(PathBuf::from("/etc/termgate.toml")));
    }

    #[test]
    fn test_parse_init_config() {
        let cli = Cli::parse_from(["termgate", "init-config", "--force"]);
        assert!(matches!(cli.command, Commands::InitConfig { force: true }));
    }

    #[test]
    fn test_init_config_writes_loadable_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        init_config(&path, false).unwrap();

        let loaded = Config::load(&path).unwrap();
        loaded.validate().unwrap();
        assert_eq!(loaded.server.bind_address, Config::default().server.bind_address);
    }

    #[test]
    fn test_init_config_keeps_existing_file_without_force() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "# mine\n").unwrap();

        assert!(init_config(&path, false).is_err());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "# mine\n");

        init_config(&path, true).unwrap();
        assert!(Config::load(&path).is_ok());
        assert_ne!(std::fs::read_to_string(&path).unwrap(), "# mine\n");
    }

    #[tokio::test]
    async fn test_wait_for_exit_of_dead_process() {
        assert!(wait_for_exit(4_000_000, Duration::from_millis(10)).await);
    }
}
