mod cmd;
mod config;
mod error;
mod lsblk;
mod progress;
mod steps;
mod supervisor;
mod ui;

use std::{io, path::PathBuf, process::ExitCode, sync::Arc, thread};

use clap::Parser;
use dialoguer::{theme::ColorfulTheme, Confirm};
use nix::sys::signal::{SigSet, Signal};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use cmd::SystemRunner;
use config::{EngineSettings, InstallConfig, InstallRequest};
use error::InstallerError;
use steps::{disk::PartitionScheme, firmware::FirmwareMode};
use supervisor::{CancelToken, Supervisor};

/// Result of a configuration problem: the record never reached the engine.
const EXIT_CONFIG: u8 = 2;

#[derive(Parser, Debug)]
#[command(name = "on1os-install")]
#[command(author, version, about = "Installs on1OS from the live system onto a disk")]
struct Args {
    /// Configuration record written by the installer wizard
    #[arg(long, default_value = "/tmp/on1os-install-config.json")]
    config: PathBuf,

    /// One status line per event on stdout instead of the styled view
    #[arg(long)]
    plain: bool,

    /// Do not ask before erasing the target disk
    #[arg(long)]
    yes: bool,

    /// Validate the record and print the plan without touching anything
    #[arg(long)]
    dry_run: bool,

    /// Log file path (logging disabled if not specified)
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Where the target's root filesystem is mounted during the run
    #[arg(long)]
    work_root: Option<PathBuf>,

    /// Root of the tree copied onto the target
    #[arg(long)]
    source_root: Option<PathBuf>,

    /// Debian suite written to the target's apt sources
    #[arg(long)]
    suite: Option<String>,

    /// Lock file guarding against concurrent runs
    #[arg(long)]
    lock_file: Option<PathBuf>,
}

impl Args {
    fn settings(&self) -> EngineSettings {
        let mut settings = EngineSettings::default();
        if let Some(ref p) = self.work_root {
            settings.work_root = p.clone();
        }
        if let Some(ref p) = self.source_root {
            settings.source_root = p.clone();
        }
        if let Some(ref s) = self.suite {
            settings.suite = s.clone();
        }
        if let Some(ref p) = self.lock_file {
            settings.lock_file = p.clone();
        }
        settings
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

fn main() -> ExitCode {
    let args = Args::parse();

    if let Some(ref log_path) = args.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)
            .ok();

        if let Some(file) = file {
            let filter =
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(file)
                .with_ansi(false)
                .init();

            info!("Starting on1os-install");
        }
    }

    match run(&args) {
        Ok(code) => code,
        Err(e) => {
            error!("{}", e);
            println!();
            ui::print_error(&e.to_string());
            match e {
                InstallerError::ConfigurationInvalid(_)
                | InstallerError::Document(_)
                | InstallerError::Io(_) => ExitCode::from(EXIT_CONFIG),
                _ => ExitCode::FAILURE,
            }
        }
    }
}

fn run(args: &Args) -> Result<ExitCode, InstallerError> {
    let request = InstallRequest::load(&args.config)?;
    let config = InstallConfig::try_from(request)?;
    let settings = args.settings();

    if !args.plain {
        ui::print_banner();
    }

    if args.dry_run {
        print_plan(&config, &settings);
        ui::print_warning("DRY-RUN MODE: nothing was written.");
        return Ok(ExitCode::SUCCESS);
    }

    check_root()?;

    if !args.plain {
        print_plan(&config, &settings);
    }
    if !args.yes {
        let proceed = Confirm::with_theme(&ColorfulTheme::default())
            .with_prompt(format!(
                "ALL data on {} will be erased. Continue?",
                config.target_disk()
            ))
            .default(false)
            .interact()?;
        if !proceed {
            return Err(InstallerError::Cancelled);
        }
    }

    // ── Run ───────────────────────────────────────────────────────────────────
    let supervisor = Supervisor::new(Arc::new(SystemRunner), settings);
    watch_interrupts(supervisor.cancel_token())?;
    let (reporter, stream) = progress::channel();
    let worker = thread::spawn(move || supervisor.run(config, reporter));

    let mut renderer = ui::Renderer::new(args.plain);
    let mut ended = false;
    for event in stream {
        debug!(stage = ?event.stage(), "{}", event);
        ended |= event.is_terminal();
        renderer.render(&event);
    }
    if !ended {
        renderer.finish();
    }

    let outcome = worker.join().map_err(|_| {
        InstallerError::PreconditionFailed("installation worker panicked".to_string())
    })?;

    for result in &outcome.results {
        if result.succeeded() {
            info!("stage {} succeeded", result.stage);
        } else {
            error!(
                "stage {} failed: {}",
                result.stage,
                result.failure.as_deref().unwrap_or_default()
            );
        }
    }

    if outcome.is_completed() {
        info!("installation completed");
        return Ok(ExitCode::SUCCESS);
    }
    if let Some(failure) = outcome.failure() {
        error!("installation failed: {}", failure);
    }
    Ok(ExitCode::FAILURE)
}

// ── Interrupts ────────────────────────────────────────────────────────────────

/// Turns SIGINT and SIGTERM into a cancellation request, honoured at the
/// next stage boundary. The signals are blocked in this thread before the
/// worker is spawned, so only the waiting thread ever sees them.
fn watch_interrupts(token: CancelToken) -> Result<(), InstallerError> {
    let mut signals = SigSet::empty();
    signals.add(Signal::SIGINT);
    signals.add(Signal::SIGTERM);
    signals.thread_block().map_err(io::Error::from)?;

    thread::spawn(move || {
        while let Ok(signal) = signals.wait() {
            warn!("{} received, stopping after the current stage", signal);
            ui::print_warning("Interrupted: stopping after the current stage.");
            token.cancel();
        }
    });
    Ok(())
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn print_plan(config: &InstallConfig, settings: &EngineSettings) {
    let firmware = FirmwareMode::detect(&settings.efivars);
    let scheme = match PartitionScheme::for_firmware(firmware) {
        PartitionScheme::Mbr => "msdos, 1 partition",
        PartitionScheme::GptEsp => "gpt, ESP + root",
    };

    let mut extras = Vec::new();
    if config.install_nvidia() {
        extras.push("NVIDIA");
    }
    if config.install_nonfree() {
        extras.push("non-free firmware");
    }

    ui::print_kv_box(
        "Installation Plan",
        &[
            ("Disk", config.target_disk().to_string()),
            ("Boot mode", firmware.to_string()),
            ("Partitions", scheme.to_string()),
            ("Filesystem", config.filesystem().to_string()),
            ("Desktop", config.desktop_environment().display_name().to_string()),
            ("Locale", config.locale().to_string()),
            ("Keyboard", config.keyboard_layout().to_string()),
            ("Timezone", config.timezone().to_string()),
            (
                "Mirror",
                format!("{} ({})", config.mirror_host(), config.mirror_region()),
            ),
            ("Hostname", config.hostname().to_string()),
            ("User", config.username().to_string()),
            (
                "Extras",
                if extras.is_empty() {
                    "none".to_string()
                } else {
                    extras.join(", ")
                },
            ),
        ],
    );
}

/// Checks that the process is running as root (UID 0).
fn check_root() -> Result<(), InstallerError> {
    let uid = std::fs::read_to_string("/proc/self/status")
        .ok()
        .and_then(|s| {
            s.lines()
                .find(|l| l.starts_with("Uid:"))
                .and_then(|l| l.split_whitespace().nth(1))
                .and_then(|v| v.parse::<u32>().ok())
        })
        .unwrap_or(1); // default to non-root if unreadable

    if uid != 0 {
        return Err(InstallerError::NotRoot);
    }

    Ok(())
}
