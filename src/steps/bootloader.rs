use std::{fs, path::Path};

use tracing::info;

use crate::{
    cmd::Invocation,
    error::InstallerError,
    steps::{chroot::IsolatedRoot, disk::DiskLayout, firmware::FirmwareMode, StageContext},
    supervisor::StageId,
};

const STAGE: StageId = StageId::Bootloader;

/// Installs GRUB for the firmware the disk was partitioned for, then
/// regenerates the initramfs and the boot menu.
pub fn run(ctx: &StageContext<'_>, layout: &DiskLayout) -> Result<(), InstallerError> {
    let firmware = FirmwareMode::detect(&ctx.settings.efivars);
    let expected = layout.scheme.firmware();
    if firmware != expected {
        return Err(InstallerError::PreconditionFailed(format!(
            "disk was partitioned for {} boot but the machine is now in {} mode",
            expected, firmware
        )));
    }

    let kernel = find_kernel(&ctx.settings.work_root.join("boot"))?;
    info!("installing GRUB ({}) for kernel {}", firmware, kernel);

    let root = IsolatedRoot::enter(ctx.runner, &ctx.settings.work_root, firmware)?;

    ctx.reporter
        .step(STAGE, format!("Installing GRUB for {} boot", firmware));
    root.run(grub_install(firmware, &ctx.settings.bootloader_id, &layout.disk))?;

    ctx.reporter.step(STAGE, "Generating initramfs");
    root.run(Invocation::new("update-initramfs", &["-u", "-k", "all"]))?;

    ctx.reporter.step(STAGE, "Writing GRUB configuration");
    root.run(Invocation::new("update-grub", &[]))?;

    Ok(())
}

fn grub_install(firmware: FirmwareMode, bootloader_id: &str, disk: &str) -> Invocation {
    let target = format!("--target={}", firmware.grub_target());
    match firmware {
        FirmwareMode::Uefi => Invocation::new(
            "grub-install",
            &[&target, "--efi-directory=/boot/efi"],
        )
        .arg(format!("--bootloader-id={}", bootloader_id))
        .arg("--recheck"),
        FirmwareMode::Bios => Invocation::new("grub-install", &[&target, "--recheck", disk]),
    }
}

/// Name of the newest `vmlinuz-*` image in `boot`.
fn find_kernel(boot: &Path) -> Result<String, InstallerError> {
    let missing = || {
        InstallerError::PreconditionFailed(format!(
            "no kernel image found in {}",
            boot.display()
        ))
    };
    let entries = fs::read_dir(boot).map_err(|_| missing())?;
    entries
        .filter_map(Result::ok)
        .filter_map(|e| e.file_name().into_string().ok())
        .filter(|name| name.starts_with("vmlinuz-"))
        .max()
        .ok_or_else(missing)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cmd::scripted::ScriptedRunner,
        config::{test_config, EngineSettings, Filesystem},
        progress,
        steps::disk::PartitionScheme,
    };

    fn layout(scheme: PartitionScheme) -> DiskLayout {
        DiskLayout {
            disk: "/dev/vdb".into(),
            scheme,
            filesystem: Filesystem::Ext4,
            root_partition: "/dev/vdb2".into(),
            esp_partition: None,
        }
    }

    fn settings(dir: &Path, uefi: bool, kernel: bool) -> EngineSettings {
        let work_root = dir.join("target");
        fs::create_dir_all(work_root.join("boot")).unwrap();
        if kernel {
            fs::write(work_root.join("boot/vmlinuz-6.1.0-18-amd64"), b"").unwrap();
        }
        let efivars = dir.join("efivars");
        if uefi {
            fs::create_dir_all(&efivars).unwrap();
        }
        EngineSettings {
            work_root,
            efivars,
            ..EngineSettings::default()
        }
    }

    fn install(
        runner: &ScriptedRunner,
        settings: &EngineSettings,
        scheme: PartitionScheme,
    ) -> Result<(), InstallerError> {
        let config = test_config("/dev/vdb");
        let (reporter, _stream) = progress::channel();
        let ctx = StageContext {
            config: &config,
            settings,
            runner,
            reporter: &reporter,
            firmware: scheme.firmware(),
        };
        run(&ctx, &layout(scheme))
    }

    #[test]
    fn test_uefi_install() {
        let dir = tempfile::tempdir().unwrap();
        let s = settings(dir.path(), true, true);
        let runner = ScriptedRunner::new();
        install(&runner, &s, PartitionScheme::GptEsp).unwrap();

        assert!(runner.ran(
            "grub-install --target=x86_64-efi --efi-directory=/boot/efi --bootloader-id=on1os --recheck"
        ));
        let grub = runner.position("grub-install").unwrap();
        let initramfs = runner.position("update-initramfs -u -k all").unwrap();
        let menu = runner.position("update-grub").unwrap();
        assert!(grub < initramfs && initramfs < menu);
        assert!(runner.ran("efivarfs"));
    }

    #[test]
    fn test_bios_install_targets_disk() {
        let dir = tempfile::tempdir().unwrap();
        let s = settings(dir.path(), false, true);
        let runner = ScriptedRunner::new();
        install(&runner, &s, PartitionScheme::Mbr).unwrap();

        let line = format!(
            "chroot {} grub-install --target=i386-pc --recheck /dev/vdb",
            s.work_root.display()
        );
        assert!(runner.ran(&line));
    }

    #[test]
    fn test_firmware_mismatch_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let s = settings(dir.path(), false, true);
        let runner = ScriptedRunner::new();
        let err = install(&runner, &s, PartitionScheme::GptEsp).unwrap_err();
        assert!(matches!(err, InstallerError::PreconditionFailed(_)));
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn test_missing_kernel_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let s = settings(dir.path(), false, false);
        let runner = ScriptedRunner::new();
        let err = install(&runner, &s, PartitionScheme::Mbr).unwrap_err();
        assert!(err.to_string().contains("no kernel image"));
        assert!(!runner.ran("grub-install"));
    }

    #[test]
    fn test_grub_failure_propagates() {
        let dir = tempfile::tempdir().unwrap();
        let s = settings(dir.path(), false, true);
        let runner =
            ScriptedRunner::new().fail("grub-install", 1, "grub-install: error: cannot find EFI directory.");
        let err = install(&runner, &s, PartitionScheme::Mbr).unwrap_err();
        assert!(err.to_string().contains("cannot find EFI directory"));
        assert!(!runner.ran("update-grub"));
    }

    #[test]
    fn test_newest_kernel_chosen() {
        let dir = tempfile::tempdir().unwrap();
        for k in ["vmlinuz-6.1.0-17-amd64", "vmlinuz-6.1.0-18-amd64", "config-6.1.0-18-amd64"] {
            fs::write(dir.path().join(k), b"").unwrap();
        }
        assert_eq!(find_kernel(dir.path()).unwrap(), "vmlinuz-6.1.0-18-amd64");
    }
}
