use std::{
    fs,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};

use tracing::{debug, warn};

use crate::{
    cmd::{CommandRunner, Invocation},
    error::InstallerError,
    steps::firmware::FirmwareMode,
};

/// Keeps package maintainer scripts from starting daemons inside the target.
const POLICY_RC_D: &str = "usr/sbin/policy-rc.d";

/// The deployed system entered as an isolated execution context: the host's
/// kernel filesystems are bind-mounted into it and commands run with it as
/// their root. Everything is released again when the value is dropped,
/// whether the stage succeeded or not.
pub struct IsolatedRoot<'a> {
    root: PathBuf,
    runner: &'a dyn CommandRunner,
    mounted: Vec<PathBuf>,
}

impl<'a> IsolatedRoot<'a> {
    /// Mount order:
    ///   1. /dev, /dev/pts  (bind)
    ///   2. /proc           (fresh procfs)
    ///   3. /sys, /run      (bind)
    ///   4. efivars         (UEFI only)
    pub fn enter(
        runner: &'a dyn CommandRunner,
        root: &Path,
        firmware: FirmwareMode,
    ) -> Result<Self, InstallerError> {
        let mut ctx = IsolatedRoot {
            root: root.to_path_buf(),
            runner,
            mounted: Vec::new(),
        };

        ctx.bind("/dev", "dev")?;
        ctx.bind("/dev/pts", "dev/pts")?;
        ctx.mount_fs("proc", "proc")?;
        ctx.bind("/sys", "sys")?;
        ctx.bind("/run", "run")?;
        if firmware == FirmwareMode::Uefi {
            ctx.mount_fs("efivarfs", "sys/firmware/efi/efivars")?;
        }

        let policy = ctx.path(POLICY_RC_D);
        if let Some(dir) = policy.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::write(&policy, "#!/bin/sh\nexit 101\n")?;
        fs::set_permissions(&policy, fs::Permissions::from_mode(0o755))?;

        Ok(ctx)
    }

    /// `rel` resolved inside the deployed root (`etc/hostname` → `<root>/etc/hostname`).
    pub fn path(&self, rel: &str) -> PathBuf {
        self.root.join(rel.trim_start_matches('/'))
    }

    /// Runs `inv` inside the deployed root.
    pub fn run(&self, inv: Invocation) -> Result<String, InstallerError> {
        self.runner.run(&inv.in_root(&self.root))
    }

    fn bind(&mut self, host: &str, rel: &str) -> Result<(), InstallerError> {
        let target = self.path(rel);
        fs::create_dir_all(&target)?;
        self.runner.run(
            &Invocation::new("mount", &["--bind", host]).arg(target.display().to_string()),
        )?;
        self.mounted.push(target);
        Ok(())
    }

    fn mount_fs(&mut self, fstype: &str, rel: &str) -> Result<(), InstallerError> {
        let target = self.path(rel);
        fs::create_dir_all(&target)?;
        self.runner.run(
            &Invocation::new("mount", &["--types", fstype, fstype])
                .arg(target.display().to_string()),
        )?;
        self.mounted.push(target);
        Ok(())
    }
}

impl Drop for IsolatedRoot<'_> {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(self.path(POLICY_RC_D)) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("could not remove {}: {}", POLICY_RC_D, e);
            }
        }
        for target in self.mounted.drain(..).rev() {
            debug!("releasing {}", target.display());
            self.runner.run_best_effort(
                &Invocation::new("umount", &["--lazy"]).arg(target.display().to_string()),
            );
        }
    }
}
