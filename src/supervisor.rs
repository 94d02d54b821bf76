use std::{
    fmt,
    fs::{self, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use tracing::{error, info, warn};

use crate::{
    cmd::{CommandRunner, Invocation},
    config::{EngineSettings, InstallConfig},
    error::{InstallerError, StageFailure},
    lsblk,
    progress::{Event, Reporter},
    steps::{self, disk::DiskLayout, firmware::FirmwareMode, StageContext},
};

// ── Stages ────────────────────────────────────────────────────────────────────

/// Identifier of one installation stage, as it appears in the status stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageId {
    DiskPreparation,
    SystemDeployment,
    SystemConfiguration,
    Bootloader,
}

impl StageId {
    pub fn as_str(self) -> &'static str {
        match self {
            StageId::DiskPreparation => "disk_preparation",
            StageId::SystemDeployment => "system_deployment",
            StageId::SystemConfiguration => "system_configuration",
            StageId::Bootloader => "bootloader",
        }
    }

    /// Position in the run, starting at 1.
    pub fn ordinal(self) -> u8 {
        match self {
            StageId::DiskPreparation => 1,
            StageId::SystemDeployment => 2,
            StageId::SystemConfiguration => 3,
            StageId::Bootloader => 4,
        }
    }

    pub fn title(self) -> &'static str {
        match self {
            StageId::DiskPreparation => "Disk Preparation",
            StageId::SystemDeployment => "System Deployment",
            StageId::SystemConfiguration => "System Configuration",
            StageId::Bootloader => "Bootloader Installation",
        }
    }
}

pub const STAGE_COUNT: u8 = 4;

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── State machine ─────────────────────────────────────────────────────────────

/// State of an installation run.
///
/// ```text
/// Pending → Preparing → Deploying → Configuring → InstallingBootloader → Completed
///              └──────────┴────────────┴──────────────────┴──→ Failed(stage, cause)
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phase {
    Pending,
    Preparing { disk: String },
    Deploying,
    Configuring,
    InstallingBootloader,
    Completed,
    Failed { stage: StageId, cause: String },
}

impl Phase {
    /// The stage that runs while in this state.
    pub fn stage(&self) -> Option<StageId> {
        match self {
            Phase::Preparing { .. } => Some(StageId::DiskPreparation),
            Phase::Deploying => Some(StageId::SystemDeployment),
            Phase::Configuring => Some(StageId::SystemConfiguration),
            Phase::InstallingBootloader => Some(StageId::Bootloader),
            Phase::Pending | Phase::Completed | Phase::Failed { .. } => None,
        }
    }

    /// `Pending → Preparing`. Any other state is returned unchanged.
    pub fn begin(self, disk: &str) -> Phase {
        match self {
            Phase::Pending => Phase::Preparing {
                disk: disk.to_string(),
            },
            other => other,
        }
    }

    /// Transition taken when the current stage finishes with `result`.
    /// Pending and terminal states have no stage and do not move.
    pub fn advance(self, result: Result<(), String>) -> Phase {
        match (self, result) {
            (Phase::Preparing { .. }, Ok(())) => Phase::Deploying,
            (Phase::Deploying, Ok(())) => Phase::Configuring,
            (Phase::Configuring, Ok(())) => Phase::InstallingBootloader,
            (Phase::InstallingBootloader, Ok(())) => Phase::Completed,
            (phase, Err(cause)) => match phase.stage() {
                Some(stage) => Phase::Failed { stage, cause },
                None => phase,
            },
            (phase, Ok(())) => phase,
        }
    }

    /// The status event announcing entry into this state.
    fn event(&self) -> Option<Event> {
        let description = match self {
            Phase::Pending => return None,
            Phase::Preparing { disk } => format!("Preparing disk {}", disk),
            Phase::Deploying => "Copying the live system".to_string(),
            Phase::Configuring => "Configuring the installed system".to_string(),
            Phase::InstallingBootloader => "Installing the bootloader".to_string(),
            Phase::Completed => return Some(Event::Completed),
            Phase::Failed { stage, cause } => {
                return Some(Event::Failed {
                    stage: *stage,
                    cause: cause.clone(),
                })
            }
        };
        self.stage()
            .map(|stage| Event::StageStarted { stage, description })
    }
}

// ── Run record ────────────────────────────────────────────────────────────────

/// Outcome of one stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageResult {
    pub stage: StageId,
    pub failure: Option<String>,
}

impl StageResult {
    pub fn succeeded(&self) -> bool {
        self.failure.is_none()
    }
}

/// A finished installation run: its terminal phase, the results of the
/// stages that ran, and the first failure if there was one.
#[derive(Debug)]
pub struct InstallationRun {
    pub phase: Phase,
    pub results: Vec<StageResult>,
    failure: Option<StageFailure>,
}

impl InstallationRun {
    pub fn is_completed(&self) -> bool {
        self.phase == Phase::Completed
    }

    pub fn failure(&self) -> Option<&StageFailure> {
        self.failure.as_ref()
    }
}

// ── Cancellation ──────────────────────────────────────────────────────────────

/// Request to stop a run. Honoured only between stages.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ── Exclusivity ───────────────────────────────────────────────────────────────

/// Lock file held for the whole run; a second run fails with `ResourceBusy`.
#[derive(Debug)]
pub struct ExclusiveLock {
    path: PathBuf,
}

impl ExclusiveLock {
    pub fn acquire(path: &Path) -> Result<Self, InstallerError> {
        let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(InstallerError::ResourceBusy(format!(
                    "another installation holds {}",
                    path.display()
                )))
            }
            Err(e) => return Err(e.into()),
        };
        writeln!(file, "{}", std::process::id())?;
        Ok(Self {
            path: path.to_path_buf(),
        })
    }
}

impl Drop for ExclusiveLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!("could not remove lock {}: {}", self.path.display(), e);
        }
    }
}

// ── Supervisor ────────────────────────────────────────────────────────────────

/// Runs the stages of one installation in order and stops at the first
/// failure.
pub struct Supervisor {
    runner: Arc<dyn CommandRunner>,
    settings: EngineSettings,
    cancel: CancelToken,
}

impl Supervisor {
    pub fn new(runner: Arc<dyn CommandRunner>, settings: EngineSettings) -> Self {
        Self {
            runner,
            settings,
            cancel: CancelToken::default(),
        }
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Executes a full run. The reporter is consumed so the status stream
    /// ends when the run does.
    pub fn run(&self, config: InstallConfig, reporter: Reporter) -> InstallationRun {
        let firmware = FirmwareMode::detect(&self.settings.efivars);
        info!(
            "starting installation on {} ({} firmware)",
            config.target_disk(),
            firmware
        );

        let ctx = StageContext {
            config: &config,
            settings: &self.settings,
            runner: self.runner.as_ref(),
            reporter: &reporter,
            firmware,
        };

        let mut phase = Phase::Pending;
        let mut results = Vec::new();
        let mut failure = None;
        let mut layout: Option<DiskLayout> = None;
        let mut lock: Option<ExclusiveLock> = None;

        let mut next = phase.clone().begin(config.target_disk());
        loop {
            if let Some(stage) = next.stage() {
                if self.cancel.is_cancelled() {
                    info!("cancellation requested before {}", stage);
                    next = next.advance(Err(InstallerError::Cancelled.to_string()));
                    failure = Some(StageFailure {
                        stage,
                        error: InstallerError::Cancelled,
                    });
                }
            }

            phase = next;
            if let Some(event) = phase.event() {
                info!("{}", event);
                reporter.emit(event);
            }
            let Some(stage) = phase.stage() else { break };

            let result = match phase {
                Phase::Preparing { .. } => ExclusiveLock::acquire(&self.settings.lock_file)
                    .and_then(|l| {
                        lock = Some(l);
                        steps::disk::run(&ctx)
                    })
                    .map(|l| layout = Some(l)),
                _ => match layout.as_ref() {
                    Some(l) => self.run_stage(stage, &ctx, l),
                    None => Err(InstallerError::PreconditionFailed(
                        "target disk was never prepared".to_string(),
                    )),
                },
            };

            let outcome = result.as_ref().map(|_| ()).map_err(|e| e.to_string());
            results.push(StageResult {
                stage,
                failure: outcome.clone().err(),
            });
            if let Err(e) = result {
                error!("stage {} failed: {}", stage, e);
                failure = Some(StageFailure { stage, error: e });
            }
            next = phase.clone().advance(outcome);
        }

        if lock.is_some() {
            self.teardown();
        }
        drop(lock);

        InstallationRun {
            phase,
            results,
            failure,
        }
    }

    fn run_stage(
        &self,
        stage: StageId,
        ctx: &StageContext<'_>,
        layout: &DiskLayout,
    ) -> Result<(), InstallerError> {
        match stage {
            StageId::DiskPreparation => Ok(()),
            StageId::SystemDeployment => steps::deploy::run(ctx, layout),
            StageId::SystemConfiguration => steps::configure::run(ctx, layout),
            StageId::Bootloader => steps::bootloader::run(ctx, layout),
        }
    }

    /// Flushes and releases the work root so a later run can re-prepare the
    /// disk.
    fn teardown(&self) {
        let work_root = &self.settings.work_root;
        if !lsblk::is_mounted(self.runner.as_ref(), work_root) {
            return;
        }
        info!("unmounting {}", work_root.display());
        self.runner.run_best_effort(&Invocation::new("sync", &[]));
        self.runner.run_best_effort(
            &Invocation::new("umount", &["--recursive"]).arg(work_root.display().to_string()),
        );
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;

    use super::*;
    use crate::{
        cmd::scripted::ScriptedRunner,
        config::{test_config, Secret},
        progress,
    };

    const VDB: &str = "NAME=\"/dev/vdb\" TYPE=\"disk\" MOUNTPOINT=\"\" PKNAME=\"\"\n";

    struct Scratch {
        _dir: TempDir,
        settings: EngineSettings,
    }

    /// Settings pointing every host path into a scratch directory, with a
    /// deployed tree that already holds a kernel and zoneinfo.
    fn scratch() -> Scratch {
        let dir = TempDir::new().unwrap();
        let work_root = dir.path().join("target");
        fs::create_dir_all(work_root.join("boot")).unwrap();
        fs::write(work_root.join("boot/vmlinuz-6.1.0-18-amd64"), b"").unwrap();
        fs::create_dir_all(work_root.join("usr/share/zoneinfo")).unwrap();
        fs::write(work_root.join("usr/share/zoneinfo/UTC"), b"").unwrap();

        let settings = EngineSettings {
            work_root,
            source_root: dir.path().join("live"),
            live_medium_mounts: vec![dir.path().join("medium")],
            efivars: dir.path().join("no-efivars"),
            lock_file: dir.path().join("installer.lock"),
            progress_interval: std::time::Duration::ZERO,
            ..EngineSettings::default()
        };
        Scratch {
            _dir: dir,
            settings,
        }
    }

    fn run_with(
        runner: Arc<ScriptedRunner>,
        settings: EngineSettings,
        disk: &str,
    ) -> (InstallationRun, Vec<Event>) {
        let supervisor = Supervisor::new(runner, settings);
        let (reporter, stream) = progress::channel();
        let run = supervisor.run(test_config(disk), reporter);
        (run, stream.collect())
    }

    #[test]
    fn test_phase_transitions() {
        let p = Phase::Pending.begin("/dev/vdb");
        assert_eq!(p.stage(), Some(StageId::DiskPreparation));
        let p = p.advance(Ok(()));
        assert_eq!(p, Phase::Deploying);
        let p = p.advance(Ok(())).advance(Ok(())).advance(Ok(()));
        assert_eq!(p, Phase::Completed);
        // terminal states stay put
        assert_eq!(p.clone().advance(Err("late".into())), Phase::Completed);
        assert_eq!(Phase::Pending.advance(Ok(())), Phase::Pending);
    }

    #[test]
    fn test_failure_from_any_running_state() {
        let failed = Phase::Configuring.advance(Err("apt-get: boom".into()));
        assert_eq!(
            failed,
            Phase::Failed {
                stage: StageId::SystemConfiguration,
                cause: "apt-get: boom".into()
            }
        );
        assert_eq!(failed.clone().advance(Ok(())), failed);
    }

    #[test]
    fn test_lock_is_exclusive() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("lock");
        let first = ExclusiveLock::acquire(&path).unwrap();
        assert!(matches!(
            ExclusiveLock::acquire(&path),
            Err(InstallerError::ResourceBusy(_))
        ));
        drop(first);
        assert!(!path.exists());
        assert!(ExclusiveLock::acquire(&path).is_ok());
    }

    #[test]
    fn test_end_to_end_completed() {
        let s = scratch();
        let runner = Arc::new(
            ScriptedRunner::new()
                .reply("lsblk --pairs", VDB)
                .reply("blkid", "0b9c2d3e-aaaa-bbbb-cccc-111122223333\n"),
        );
        let (run, events) = run_with(runner.clone(), s.settings.clone(), "/dev/vdb");

        assert!(run.is_completed(), "{:?}", run.failure());
        assert_eq!(run.results.len(), 4);
        assert!(run.results.iter().all(StageResult::succeeded));

        // one start event per stage, then the terminal line
        let started: Vec<StageId> = events
            .iter()
            .filter_map(|e| match e {
                Event::StageStarted { stage, .. } => Some(*stage),
                _ => None,
            })
            .collect();
        assert_eq!(
            started,
            vec![
                StageId::DiskPreparation,
                StageId::SystemDeployment,
                StageId::SystemConfiguration,
                StageId::Bootloader
            ]
        );
        let last = events.last().unwrap();
        assert_eq!(last, &Event::Completed);
        assert_eq!(last.to_string(), "[done] Installation completed successfully");

        assert!(runner.ran("mkfs.ext4 -F -L on1os /dev/vdb1"));
        assert!(runner.ran("useradd -m -s /bin/bash -G sudo -c Alice Example alice"));
        assert!(runner.ran("grub-install --target=i386-pc --recheck /dev/vdb"));
        assert!(!s.settings.lock_file.exists());
    }

    #[test]
    fn test_nonexistent_disk_writes_nothing() {
        let s = scratch();
        let runner = Arc::new(ScriptedRunner::new().fail(
            "lsblk --pairs",
            32,
            "lsblk: /dev/nonexistent: not a block device",
        ));
        let (run, events) = run_with(runner.clone(), s.settings, "/dev/nonexistent");

        assert_eq!(
            run.phase.stage(),
            None,
            "run must be terminal, got {:?}",
            run.phase
        );
        match &run.phase {
            Phase::Failed { stage, cause } => {
                assert_eq!(*stage, StageId::DiskPreparation);
                assert!(cause.contains("not a block device"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(
            run.failure().map(|f| &f.error),
            Some(InstallerError::PreconditionFailed(_))
        ));
        for destructive in ["wipefs", "parted", "mkfs"] {
            assert!(!runner.ran(destructive), "{} ran", destructive);
        }
        assert!(events.last().unwrap().to_string().starts_with("[failed] disk_preparation:"));
    }

    #[test]
    fn test_configuration_failure_skips_bootloader() {
        for point in ["apt-get update", "apt-get install", "locale-gen", "useradd", "chpasswd"] {
            let s = scratch();
            let runner = Arc::new(
                ScriptedRunner::new()
                    .reply("lsblk --pairs", VDB)
                    .reply("blkid", "0b9c2d3e\n")
                    .fail(point, 100, "E: Unable to locate package task-xfce-desktop"),
            );
            let (run, _) = run_with(runner.clone(), s.settings, "/dev/vdb");

            assert!(matches!(
                run.phase,
                Phase::Failed {
                    stage: StageId::SystemConfiguration,
                    ..
                }
            ));
            assert!(!runner.ran("grub-install"), "bootloader ran after {}", point);
            assert!(!runner.ran("update-grub"));
            assert_eq!(run.results.len(), 3);
        }
    }

    #[test]
    fn test_deployment_failure_halts_run() {
        let s = scratch();
        let runner = Arc::new(
            ScriptedRunner::new()
                .reply("lsblk --pairs", VDB)
                .fail("rsync", 11, "rsync: write failed: No space left on device (28)"),
        );
        let (run, events) = run_with(runner.clone(), s.settings, "/dev/vdb");

        let failure = run.failure().unwrap();
        assert_eq!(failure.stage, StageId::SystemDeployment);
        assert!(failure.to_string().contains("No space left on device"));
        assert!(!runner.ran("chroot"));
        assert!(matches!(events.last(), Some(Event::Failed { .. })));
    }

    #[test]
    fn test_secrets_stay_out_of_argv_and_stream() {
        let s = scratch();
        let runner = Arc::new(
            ScriptedRunner::new()
                .reply("lsblk --pairs", VDB)
                .reply("blkid", "0b9c2d3e\n"),
        );
        let config = test_config("/dev/vdb");
        let secrets: Vec<String> = [config.root_password(), config.user_password()]
            .iter()
            .map(|s: &&Secret| s.expose().to_string())
            .collect();

        let (_, events) = run_with(runner.clone(), s.settings, "/dev/vdb");

        for line in runner.command_lines() {
            for secret in &secrets {
                assert!(!line.contains(secret.as_str()), "secret in argv: {}", line);
            }
        }
        for event in &events {
            for secret in &secrets {
                assert!(!event.to_string().contains(secret.as_str()));
            }
        }
        let fed: Vec<String> = runner
            .calls()
            .iter()
            .filter_map(|c| c.stdin_payload().map(|p| p.expose().to_string()))
            .collect();
        assert!(fed.contains(&format!("root:{}", secrets[0])));
        assert!(fed.contains(&format!("alice:{}", secrets[1])));
    }

    #[test]
    fn test_concurrent_run_is_busy() {
        let s = scratch();
        let _held = ExclusiveLock::acquire(&s.settings.lock_file).unwrap();
        let runner = Arc::new(ScriptedRunner::new().reply("lsblk --pairs", VDB));
        let (run, _) = run_with(runner.clone(), s.settings.clone(), "/dev/vdb");

        assert!(matches!(
            run.failure().map(|f| &f.error),
            Some(InstallerError::ResourceBusy(_))
        ));
        assert!(!runner.ran("wipefs"));
        // the other run's lock is left alone
        assert!(s.settings.lock_file.exists());
    }

    #[test]
    fn test_cancel_before_start() {
        let s = scratch();
        let runner = Arc::new(ScriptedRunner::new());
        let supervisor = Supervisor::new(runner.clone(), s.settings);
        supervisor.cancel_token().cancel();
        let (reporter, stream) = progress::channel();
        let run = supervisor.run(test_config("/dev/vdb"), reporter);

        assert!(matches!(
            run.phase,
            Phase::Failed {
                stage: StageId::DiskPreparation,
                ..
            }
        ));
        assert!(run.results.is_empty());
        assert!(runner.calls().is_empty());
        let events: Vec<Event> = stream.collect();
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_cancel_during_stage_finishes_it() {
        let s = scratch();
        let work_root = s.settings.work_root.display().to_string();
        let token = CancelToken::default();
        let hook = token.clone();
        let runner = Arc::new(
            ScriptedRunner::new()
                .reply("lsblk --pairs", VDB)
                .reply(&format!("--mountpoint {}", work_root), &format!("{}\n", work_root))
                .reply_with("rsync", move || {
                    hook.cancel();
                    String::new()
                }),
        );
        let mut supervisor = Supervisor::new(runner.clone(), s.settings);
        supervisor.cancel = token;
        let (reporter, stream) = progress::channel();
        let run = supervisor.run(test_config("/dev/vdb"), reporter);
        let events: Vec<Event> = stream.collect();

        assert_eq!(
            run.phase,
            Phase::Failed {
                stage: StageId::SystemConfiguration,
                cause: "Installation cancelled".to_string(),
            }
        );
        let stages: Vec<StageId> = run.results.iter().map(|r| r.stage).collect();
        assert_eq!(
            stages,
            [StageId::DiskPreparation, StageId::SystemDeployment]
        );
        assert!(run.results.iter().all(StageResult::succeeded));
        assert!(matches!(
            run.failure().map(|f| &f.error),
            Some(InstallerError::Cancelled)
        ));
        assert!(!runner.ran("chroot"));
        assert!(runner.ran(&format!("umount --recursive {}", work_root)));
        assert_eq!(
            events.last().unwrap().to_string(),
            "[failed] system_configuration: Installation cancelled"
        );
    }

    #[test]
    fn test_work_root_released_after_failure() {
        let s = scratch();
        let mountpoint = format!("--mountpoint {}", s.settings.work_root.display());
        let runner = Arc::new(
            ScriptedRunner::new()
                .reply("lsblk --pairs", VDB)
                .reply(&mountpoint, &format!("{}\n", s.settings.work_root.display()))
                .fail("rsync", 23, "rsync error: some files could not be transferred"),
        );
        let (run, _) = run_with(runner.clone(), s.settings.clone(), "/dev/vdb");

        assert!(!run.is_completed());
        let unmount = format!("umount --recursive {}", s.settings.work_root.display());
        assert!(runner.ran(&unmount));
    }
}
