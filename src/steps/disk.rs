use std::{fs, path::Path};

use tracing::{info, warn};

use crate::{
    cmd::Invocation,
    config::Filesystem,
    error::InstallerError,
    lsblk::{self, BlockDevice},
    steps::{firmware::FirmwareMode, StageContext},
    supervisor::StageId,
};

const STAGE: StageId = StageId::DiskPreparation;

/// Filesystem label given to the root partition.
const ROOT_LABEL: &str = "on1os";

/// Partition table written to the target.
///
///   Mbr:    p1 → root (boot flag)
///   GptEsp: p1 → EFI system partition (FAT32, 512M), p2 → root
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionScheme {
    Mbr,
    GptEsp,
}

impl PartitionScheme {
    pub fn for_firmware(mode: FirmwareMode) -> Self {
        match mode {
            FirmwareMode::Uefi => PartitionScheme::GptEsp,
            FirmwareMode::Bios => PartitionScheme::Mbr,
        }
    }

    /// The firmware mode this scheme can boot under.
    pub fn firmware(self) -> FirmwareMode {
        match self {
            PartitionScheme::GptEsp => FirmwareMode::Uefi,
            PartitionScheme::Mbr => FirmwareMode::Bios,
        }
    }

    fn parted_script(self, fs: Filesystem) -> Vec<&'static str> {
        match self {
            PartitionScheme::Mbr => vec![
                "mklabel", "msdos",
                "mkpart", "primary", fs.as_str(), "1MiB", "100%",
                "set", "1", "boot", "on",
            ],
            PartitionScheme::GptEsp => vec![
                "mklabel", "gpt",
                "mkpart", "ESP", "fat32", "1MiB", "513MiB",
                "set", "1", "esp", "on",
                "mkpart", "root", fs.as_str(), "513MiB", "100%",
            ],
        }
    }
}

/// What Disk Preparation produced; later stages work from this.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskLayout {
    pub disk: String,
    pub scheme: PartitionScheme,
    pub filesystem: Filesystem,
    pub root_partition: String,
    pub esp_partition: Option<String>,
}

impl DiskLayout {
    fn plan(disk: &str, scheme: PartitionScheme, filesystem: Filesystem) -> Self {
        let (esp_partition, root_partition) = match scheme {
            PartitionScheme::Mbr => (None, part_path(disk, 1)),
            PartitionScheme::GptEsp => (Some(part_path(disk, 1)), part_path(disk, 2)),
        };
        Self {
            disk: disk.to_string(),
            scheme,
            filesystem,
            root_partition,
            esp_partition,
        }
    }
}

/// Kernel naming of partition `n` on `disk`: `/dev/sda` → `/dev/sda1`,
/// `/dev/nvme0n1` → `/dev/nvme0n1p1`.
pub fn part_path(disk: &str, n: u8) -> String {
    if disk.ends_with(|c: char| c.is_ascii_digit()) {
        format!("{}p{}", disk, n)
    } else {
        format!("{}{}", disk, n)
    }
}

// ── Stage ─────────────────────────────────────────────────────────────────────

/// Destroys the partition table of the target, lays out the new scheme,
/// formats and mounts it at the work root.
pub fn run(ctx: &StageContext<'_>) -> Result<DiskLayout, InstallerError> {
    let disk = ctx.config.target_disk();
    let work_root = &ctx.settings.work_root;

    ctx.reporter.step(STAGE, format!("Checking {}", disk));
    let devices = check_target(ctx, disk)?;
    let devices = release_stale_mounts(ctx, disk, devices)?;
    ensure_unused(&devices)?;

    // Nothing above writes to the disk. Everything below is destructive.
    let layout = DiskLayout::plan(
        disk,
        PartitionScheme::for_firmware(ctx.firmware),
        ctx.config.filesystem(),
    );
    info!("partitioning {} as {:?}", disk, layout.scheme);

    ctx.reporter.step(STAGE, format!("Wiping partition table on {}", disk));
    ctx.runner.run(&Invocation::new("wipefs", &["--all", disk]))?;

    ctx.reporter.step(STAGE, format!("Partitioning {} for {} boot", disk, ctx.firmware));
    ctx.runner.run(
        &Invocation::new("parted", &["--script", disk])
            .args(layout.scheme.parted_script(layout.filesystem)),
    )?;
    ctx.runner.run(&Invocation::new("partprobe", &[disk]))?;
    ctx.runner.run_best_effort(&Invocation::new("udevadm", &["settle"]));

    if let Some(ref esp) = layout.esp_partition {
        ctx.reporter.step(STAGE, format!("Formatting {} as FAT32 (EFI)", esp));
        ctx.runner
            .run(&Invocation::new("mkfs.fat", &["-F", "32", "-n", "EFI", esp]))?;
    }

    let (mkfs, force) = layout.filesystem.mkfs();
    ctx.reporter.step(
        STAGE,
        format!("Formatting {} as {}", layout.root_partition, layout.filesystem),
    );
    ctx.runner.run(&Invocation::new(
        mkfs,
        &[force, "-L", ROOT_LABEL, &layout.root_partition],
    ))?;

    mount_layout(ctx, &layout, work_root)?;
    Ok(layout)
}

/// Mount order:
///   1. Root → work root
///   2. Create <work root>/boot/efi
///   3. EFI  → <work root>/boot/efi
fn mount_layout(
    ctx: &StageContext<'_>,
    layout: &DiskLayout,
    work_root: &Path,
) -> Result<(), InstallerError> {
    fs::create_dir_all(work_root)?;
    let target = work_root.display().to_string();

    ctx.reporter
        .step(STAGE, format!("Mounting {} at {}", layout.root_partition, target));
    ctx.runner.run(
        &Invocation::new("mount", &["--types", layout.filesystem.as_str()])
            .arg(&layout.root_partition)
            .arg(&target),
    )?;

    if let Some(ref esp) = layout.esp_partition {
        let efi_dir = work_root.join("boot/efi");
        fs::create_dir_all(&efi_dir)?;
        ctx.runner.run(
            &Invocation::new("mount", &["--types", "vfat", esp])
                .arg(efi_dir.display().to_string()),
        )?;
    }
    Ok(())
}

// ── Preconditions ─────────────────────────────────────────────────────────────

/// The target must be a whole disk and must not carry the live medium.
fn check_target(ctx: &StageContext<'_>, disk: &str) -> Result<Vec<BlockDevice>, InstallerError> {
    let devices = lsblk::probe(ctx.runner, disk)?;

    let kind = devices[0].kind.as_str();
    if kind != "disk" && kind != "loop" {
        return Err(InstallerError::PreconditionFailed(format!(
            "{} is a {} device, not a whole disk",
            disk, kind
        )));
    }

    let mut protected = Vec::new();
    let mounts = ctx
        .settings
        .live_medium_mounts
        .iter()
        .chain(std::iter::once(&ctx.settings.source_root));
    for mount in mounts {
        if let Some(source) = lsblk::mount_source(ctx.runner, mount) {
            if let Some(parent) = lsblk::parent_disk(ctx.runner, &source) {
                protected.push(parent);
            }
            protected.push(source);
        }
    }

    if let Some(hit) = devices
        .iter()
        .find(|d| protected.iter().any(|p| *p == d.path))
    {
        return Err(InstallerError::PreconditionFailed(format!(
            "{} hosts the running live system ({}); refusing to erase it",
            disk, hit.path
        )));
    }
    Ok(devices)
}

/// Unmounts what a failed earlier run left under our own work root, then
/// probes again.
fn release_stale_mounts(
    ctx: &StageContext<'_>,
    disk: &str,
    devices: Vec<BlockDevice>,
) -> Result<Vec<BlockDevice>, InstallerError> {
    let work_root = &ctx.settings.work_root;
    let stale = devices.iter().any(|d| {
        d.mountpoint
            .as_deref()
            .is_some_and(|mp| Path::new(mp).starts_with(work_root))
    });
    if !stale {
        return Ok(devices);
    }

    warn!("{} is still mounted from a previous run; releasing it", disk);
    ctx.reporter
        .step(STAGE, format!("Releasing {} left mounted by a previous run", work_root.display()));
    ctx.runner.run_best_effort(
        &Invocation::new("umount", &["--recursive"]).arg(work_root.display().to_string()),
    );
    lsblk::probe(ctx.runner, disk)
}

fn ensure_unused(devices: &[BlockDevice]) -> Result<(), InstallerError> {
    match devices.iter().find(|d| d.mountpoint.is_some()) {
        Some(d) => Err(InstallerError::ResourceBusy(format!(
            "{} is in use (mounted at {})",
            d.path,
            d.mountpoint.as_deref().unwrap_or_default()
        ))),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::{
        cmd::scripted::ScriptedRunner,
        config::{test_config, test_request, EngineSettings, InstallConfig},
        progress::{self, Event},
    };

    const VDB: &str = "NAME=\"/dev/vdb\" TYPE=\"disk\" MOUNTPOINT=\"\" PKNAME=\"\"\n";

    fn settings(dir: &Path) -> EngineSettings {
        EngineSettings {
            work_root: dir.join("target"),
            source_root: PathBuf::from("/"),
            live_medium_mounts: vec![PathBuf::from("/run/live/medium")],
            ..EngineSettings::default()
        }
    }

    fn prepare(
        runner: &ScriptedRunner,
        config: &InstallConfig,
        settings: &EngineSettings,
        firmware: FirmwareMode,
    ) -> (Result<DiskLayout, InstallerError>, Vec<Event>) {
        let (reporter, stream) = progress::channel();
        let result = {
            let ctx = StageContext {
                config,
                settings,
                runner,
                reporter: &reporter,
                firmware,
            };
            run(&ctx)
        };
        drop(reporter);
        (result, stream.collect())
    }

    #[test]
    fn test_part_path() {
        assert_eq!(part_path("/dev/sda", 1), "/dev/sda1");
        assert_eq!(part_path("/dev/vdb", 2), "/dev/vdb2");
        assert_eq!(part_path("/dev/nvme0n1", 2), "/dev/nvme0n1p2");
        assert_eq!(part_path("/dev/loop7", 1), "/dev/loop7p1");
    }

    #[test]
    fn test_bios_layout_single_partition() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ScriptedRunner::new().reply("lsblk --pairs", VDB);
        let (result, events) = prepare(
            &runner,
            &test_config("/dev/vdb"),
            &settings(dir.path()),
            FirmwareMode::Bios,
        );

        let layout = result.unwrap();
        assert_eq!(layout.scheme, PartitionScheme::Mbr);
        assert_eq!(layout.root_partition, "/dev/vdb1");
        assert_eq!(layout.esp_partition, None);

        let wipe = runner.position("wipefs --all /dev/vdb").unwrap();
        let part = runner.position("parted --script /dev/vdb mklabel msdos").unwrap();
        let mkfs = runner.position("mkfs.ext4 -F -L on1os /dev/vdb1").unwrap();
        let mount = runner.position("mount --types ext4 /dev/vdb1").unwrap();
        assert!(wipe < part && part < mkfs && mkfs < mount);
        assert!(!runner.ran("mkfs.fat"));
        assert!(events.iter().all(|e| e.stage() == Some(StageId::DiskPreparation)));
    }

    #[test]
    fn test_uefi_layout_with_esp() {
        let dir = tempfile::tempdir().unwrap();
        let mut req = test_request("/dev/nvme0n1");
        req.filesystem = "xfs".into();
        let config = InstallConfig::try_from(req).unwrap();
        let runner = ScriptedRunner::new().reply(
            "lsblk --pairs",
            "NAME=\"/dev/nvme0n1\" TYPE=\"disk\" MOUNTPOINT=\"\" PKNAME=\"\"\n",
        );
        let s = settings(dir.path());
        let (result, _) = prepare(&runner, &config, &s, FirmwareMode::Uefi);

        let layout = result.unwrap();
        assert_eq!(layout.esp_partition.as_deref(), Some("/dev/nvme0n1p1"));
        assert_eq!(layout.root_partition, "/dev/nvme0n1p2");
        assert!(runner.ran("mklabel gpt mkpart ESP fat32 1MiB 513MiB set 1 esp on mkpart root xfs"));
        assert!(runner.ran("mkfs.fat -F 32 -n EFI /dev/nvme0n1p1"));
        assert!(runner.ran("mkfs.xfs -f -L on1os /dev/nvme0n1p2"));
        assert!(s.work_root.join("boot/efi").is_dir());
    }

    #[test]
    fn test_refuses_live_medium_disk() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ScriptedRunner::new()
            .reply(
                "lsblk --pairs",
                "NAME=\"/dev/sdb\" TYPE=\"disk\" MOUNTPOINT=\"\" PKNAME=\"\"\n\
                 NAME=\"/dev/sdb1\" TYPE=\"part\" MOUNTPOINT=\"/run/live/medium\" PKNAME=\"/dev/sdb\"\n",
            )
            .reply("--mountpoint /run/live/medium", "/dev/sdb1\n")
            .reply("--output PKNAME /dev/sdb1", "/dev/sdb\n");
        let (result, _) = prepare(
            &runner,
            &test_config("/dev/sdb"),
            &settings(dir.path()),
            FirmwareMode::Bios,
        );

        assert!(matches!(result, Err(InstallerError::PreconditionFailed(_))));
        for destructive in ["wipefs", "parted", "mkfs", "umount"] {
            assert!(!runner.ran(destructive), "{} ran", destructive);
        }
    }

    #[test]
    fn test_partition_is_not_a_target() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ScriptedRunner::new().reply(
            "lsblk --pairs",
            "NAME=\"/dev/vdb1\" TYPE=\"part\" MOUNTPOINT=\"\" PKNAME=\"/dev/vdb\"\n",
        );
        let (result, _) = prepare(
            &runner,
            &test_config("/dev/vdb1"),
            &settings(dir.path()),
            FirmwareMode::Bios,
        );
        assert!(matches!(result, Err(InstallerError::PreconditionFailed(_))));
    }

    #[test]
    fn test_mounted_elsewhere_is_busy() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ScriptedRunner::new().reply(
            "lsblk --pairs",
            "NAME=\"/dev/vdb\" TYPE=\"disk\" MOUNTPOINT=\"\" PKNAME=\"\"\n\
             NAME=\"/dev/vdb1\" TYPE=\"part\" MOUNTPOINT=\"/home/data\" PKNAME=\"/dev/vdb\"\n",
        );
        let (result, _) = prepare(
            &runner,
            &test_config("/dev/vdb"),
            &settings(dir.path()),
            FirmwareMode::Bios,
        );
        match result {
            Err(InstallerError::ResourceBusy(msg)) => assert!(msg.contains("/home/data")),
            other => panic!("unexpected {:?}", other),
        }
        assert!(!runner.ran("wipefs"));
    }

    #[test]
    fn test_stale_work_root_is_released_then_busy_if_still_mounted() {
        let dir = tempfile::tempdir().unwrap();
        let s = settings(dir.path());
        let stale = format!(
            "NAME=\"/dev/vdb\" TYPE=\"disk\" MOUNTPOINT=\"\" PKNAME=\"\"\n\
             NAME=\"/dev/vdb1\" TYPE=\"part\" MOUNTPOINT=\"{}\" PKNAME=\"/dev/vdb\"\n",
            s.work_root.display()
        );
        // the scripted lsblk keeps reporting the mount, as if umount failed
        let runner = ScriptedRunner::new().reply("lsblk --pairs", &stale);
        let (result, _) = prepare(&runner, &test_config("/dev/vdb"), &s, FirmwareMode::Bios);

        assert!(runner.ran(&format!("umount --recursive {}", s.work_root.display())));
        assert!(matches!(result, Err(InstallerError::ResourceBusy(_))));
        assert!(!runner.ran("wipefs"));
    }

    #[test]
    fn test_stale_mount_with_escaped_path_is_released() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let dir = tempfile::tempdir().unwrap();
        let s = EngineSettings {
            work_root: dir.path().join("on1os work"),
            ..settings(dir.path())
        };
        let stale = format!(
            "NAME=\"/dev/vdb\" TYPE=\"disk\" MOUNTPOINT=\"\" PKNAME=\"\"\n\
             NAME=\"/dev/vdb1\" TYPE=\"part\" MOUNTPOINT=\"{}\" PKNAME=\"/dev/vdb\"\n",
            s.work_root.display().to_string().replace(' ', "\\x20")
        );
        let probes = AtomicUsize::new(0);
        let runner = ScriptedRunner::new().reply_with("lsblk --pairs", move || {
            match probes.fetch_add(1, Ordering::SeqCst) {
                0 => stale.clone(),
                _ => VDB.to_string(),
            }
        });
        let (result, _) = prepare(&runner, &test_config("/dev/vdb"), &s, FirmwareMode::Bios);

        result.unwrap();
        let umount = runner.position("umount --recursive").unwrap();
        assert!(umount < runner.position("wipefs").unwrap());
    }

    #[test]
    fn test_format_failure_is_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ScriptedRunner::new()
            .reply("lsblk --pairs", VDB)
            .fail("mkfs.ext4", 1, "mkfs.ext4: Device size reported to be zero.");
        let (result, _) = prepare(
            &runner,
            &test_config("/dev/vdb"),
            &settings(dir.path()),
            FirmwareMode::Bios,
        );
        match result {
            Err(InstallerError::ToolExecutionFailed { diagnostic, .. }) => {
                assert_eq!(diagnostic, "mkfs.ext4: Device size reported to be zero.")
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(!runner.ran("mount --types"));
    }
}
