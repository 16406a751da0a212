//! TetherCam entry point.
//!
//! Wires the configuration, the `usbipd` and `wsl`/`gphoto2` drivers, the
//! session state store, and the recovery coordinator together, then runs one
//! of the subcommands:
//!
//! ```text
//! tethercam capture [--output PATH]   one capture session, JSON result on stdout
//! tethercam status                    last persisted state, JSON on stdout
//! tethercam monitor [--interval S]    periodic health checks until Ctrl+C
//! tethercam init-config [--force]     write the default config file
//! ```
//!
//! # Exit codes
//!
//! `0` when the command succeeded, `1` when a capture failed or was aborted,
//! `2` when the status file could not be read.  Configuration and startup
//! errors are reported by `anyhow` and also exit non-zero.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use tethercam_core::SessionSummary;
use tethercam_host::application::health_monitor::{HealthMonitor, HealthMonitorConfig};
use tethercam_host::application::recover::{CoordinatorSettings, RecoveryCoordinator};
use tethercam_host::application::session_store::SessionStateStore;
use tethercam_host::infrastructure::guest::wsl::WslGphotoDriver;
use tethercam_host::infrastructure::redirection::usbipd::UsbipdDriver;
use tethercam_host::infrastructure::status::{query_persisted_status, CommandResult, HealthDto, SessionDto};
use tethercam_host::infrastructure::storage::config::{
    config_file_path, load_config, load_config_from, save_config_to, AppConfig,
};

// ── CLI definition ────────────────────────────────────────────────────────────

#[derive(Debug, Parser)]
#[command(
    name = "tethercam",
    about = "Capture photos from a USB camera redirected into a WSL guest",
    version
)]
struct Cli {
    /// Config file to use instead of the platform default.
    #[arg(long, global = true, env = "TETHERCAM_CONFIG")]
    config: Option<PathBuf>,

    /// Log level when `RUST_LOG` is unset (overrides the config file).
    #[arg(long, global = true, env = "TETHERCAM_LOG")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run one capture session.
    Capture {
        /// Output file; must not exist yet.  Defaults to a fresh name in the
        /// configured output directory.
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
    /// Print the last persisted pipeline status.
    Status,
    /// Check camera health periodically until interrupted.
    Monitor {
        /// Seconds between checks (overrides the config file).
        #[arg(long)]
        interval: Option<u64>,
        /// Only report; never re-establish the passthrough link.
        #[arg(long)]
        no_repair: bool,
    },
    /// Write the default configuration file.
    InitConfig {
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
}

impl Cli {
    fn load_config(&self) -> anyhow::Result<AppConfig> {
        match &self.config {
            Some(path) => load_config_from(path)
                .with_context(|| format!("loading config from {}", path.display())),
            None => load_config().context("loading config from the platform config directory"),
        }
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    let config = cli.load_config()?;

    // `RUST_LOG` wins; otherwise --log-level, then the config file.
    let level = cli.log_level.clone().unwrap_or_else(|| config.log_level.clone());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Capture { ref output } => {
            let output = output.clone().unwrap_or_else(|| config.output.next_capture_path());
            run_capture(&config, output).await
        }
        Command::Status => run_status(&config),
        Command::Monitor { interval, no_repair } => {
            let monitor = HealthMonitorConfig {
                interval: interval.map(Duration::from_secs).unwrap_or_else(|| config.monitor.interval()),
                auto_repair: config.monitor.auto_repair && !no_repair,
            };
            run_monitor(&config, monitor).await
        }
        Command::InitConfig { force } => {
            let path = match &cli.config {
                Some(path) => path.clone(),
                None => config_file_path()?,
            };
            if path.exists() && !force {
                bail!("{} already exists (use --force to overwrite)", path.display());
            }
            save_config_to(&path, &AppConfig::default())
                .with_context(|| format!("writing {}", path.display()))?;
            info!("wrote default config to {}", path.display());
            Ok(ExitCode::SUCCESS)
        }
    }
}

// ── Wiring ────────────────────────────────────────────────────────────────────

fn build_coordinator(config: &AppConfig) -> anyhow::Result<Arc<RecoveryCoordinator>> {
    let settings = CoordinatorSettings {
        device_id: config.device.usb_id()?,
        bus_hint: config.device.bus_hint()?,
        policy: config.policy.to_policy()?,
    };

    let host = Arc::new(UsbipdDriver::new(
        config.host.usbipd_path.clone(),
        config.host.distro.clone(),
        config.host.command_timeout(),
    ));
    let guest = Arc::new(
        WslGphotoDriver::new(
            config.host.distro.clone(),
            config.guest.gphoto_cmd.clone(),
            config.host.command_timeout(),
        )
        .with_autofocus(config.guest.autofocus),
    );

    let store = match &config.state.persist_path {
        Some(path) => SessionStateStore::persistent(path)
            .with_context(|| format!("opening state file {}", path.display()))?,
        None => SessionStateStore::in_memory(),
    };

    info!(
        device = %settings.device_id,
        distro = %config.host.distro,
        max_attempts = settings.policy.max_attempts(),
        "capture pipeline ready"
    );
    Ok(Arc::new(RecoveryCoordinator::new(settings, host, guest, store)))
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

// ── Subcommands ───────────────────────────────────────────────────────────────

async fn run_capture(config: &AppConfig, output: PathBuf) -> anyhow::Result<ExitCode> {
    let coordinator = build_coordinator(config)?;

    // Ctrl+C aborts the running session; the coordinator cleans up.
    let abort_handle = Arc::clone(&coordinator);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("received Ctrl+C; aborting capture");
                abort_handle.abort_active();
            }
            Err(e) => error!("failed to listen for Ctrl+C signal: {e}"),
        }
    });

    let (result, code) = match coordinator.capture(&output).await {
        Ok(session) => (
            CommandResult::ok(SessionDto::from(&SessionSummary::from(&session))),
            ExitCode::SUCCESS,
        ),
        Err(e) => {
            error!("{e}");
            let result = CommandResult {
                success: false,
                data: e.session().map(|s| SessionDto::from(&SessionSummary::from(s))),
                error: Some(match e.kind() {
                    Some(kind) => kind.to_string(),
                    None => e.to_string(),
                }),
            };
            (result, ExitCode::FAILURE)
        }
    };
    print_json(&result)?;
    Ok(code)
}

fn run_status(config: &AppConfig) -> anyhow::Result<ExitCode> {
    let Some(path) = &config.state.persist_path else {
        bail!("state persistence is disabled; set [state] persist_path in the config file");
    };
    let result = query_persisted_status(path);
    let code = if result.success {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(2)
    };
    print_json(&result)?;
    Ok(code)
}

async fn run_monitor(config: &AppConfig, monitor: HealthMonitorConfig) -> anyhow::Result<ExitCode> {
    let coordinator = build_coordinator(config)?;
    let running = Arc::new(AtomicBool::new(true));
    let mut reports = Arc::new(HealthMonitor::new(coordinator, monitor)).start(Arc::clone(&running));

    loop {
        tokio::select! {
            report = reports.recv() => match report {
                Some(report) => println!("{}", serde_json::to_string(&HealthDto::from(&report))?),
                None => break,
            },
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    error!("failed to listen for Ctrl+C signal: {e}");
                }
                info!("received Ctrl+C; stopping monitor");
                break;
            }
        }
    }
    running.store(false, Ordering::Relaxed);
    Ok(ExitCode::SUCCESS)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_capture_with_output() {
        // Arrange / Act
        let cli = Cli::parse_from(["tethercam", "capture", "--output", "/tmp/a.jpg"]);

        // Assert
        match cli.command {
            Command::Capture { output } => assert_eq!(output, Some(PathBuf::from("/tmp/a.jpg"))),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_cli_global_config_flag_after_subcommand() {
        let cli = Cli::parse_from(["tethercam", "status", "--config", "/etc/tethercam.toml"]);
        assert_eq!(cli.config, Some(PathBuf::from("/etc/tethercam.toml")));
        assert!(matches!(cli.command, Command::Status));
    }

    #[test]
    fn test_cli_monitor_flags() {
        let cli = Cli::parse_from(["tethercam", "monitor", "--interval", "5", "--no-repair"]);
        match cli.command {
            Command::Monitor { interval, no_repair } => {
                assert_eq!(interval, Some(5));
                assert!(no_repair);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_cli_requires_subcommand() {
        assert!(Cli::try_parse_from(["tethercam"]).is_err());
    }

    #[test]
    fn test_build_coordinator_rejects_invalid_policy() {
        let mut config = AppConfig::default();
        config.policy.max_attempts = 0;
        config.state.persist_path = None;
        assert!(build_coordinator(&config).is_err());
    }
}
