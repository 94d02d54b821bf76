use std::{
    fs,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};

use tracing::{info, warn};

use crate::{
    cmd::Invocation,
    error::InstallerError,
    progress::{Event, Throttle},
    steps::{disk::DiskLayout, StageContext},
    supervisor::StageId,
};

const STAGE: StageId = StageId::SystemDeployment;

/// Runtime-only trees whose contents never belong on the target.
const RUNTIME_EXCLUDES: &[&str] = &[
    "/dev/*",
    "/proc/*",
    "/sys/*",
    "/run/*",
    "/tmp/*",
    "/mnt/*",
    "/media/*",
    "/lost+found",
];

/// Mount points recreated empty on the target after the copy.
const MOUNT_DIRS: &[&str] = &["dev", "proc", "sys", "run", "tmp", "mnt", "media"];

/// rsync: "some files vanished before they could be transferred".
const RSYNC_VANISHED: i32 = 24;

/// Copies the live root onto the prepared target.
pub fn run(ctx: &StageContext<'_>, _layout: &DiskLayout) -> Result<(), InstallerError> {
    let source = &ctx.settings.source_root;
    let target = &ctx.settings.work_root;

    let excludes = exclusions(source, target, &ctx.settings.live_medium_mounts);
    ctx.reporter.step(
        STAGE,
        format!("Copying {} to {}", source.display(), target.display()),
    );

    let inv = Invocation::new(
        "rsync",
        &[
            "--archive",
            "--hard-links",
            "--acls",
            "--xattrs",
            "--numeric-ids",
            "--info=progress2",
            "--no-inc-recursive",
        ],
    )
    .args(excludes.iter().map(|e| format!("--exclude={}", e)))
    .arg(trailing_slash(source))
    .arg(trailing_slash(target));

    let mut throttle = Throttle::new(ctx.settings.progress_interval);
    let mut last_percent = None;
    let result = ctx.runner.stream(&inv, &mut |line| {
        let Some(p) = parse_progress2(line) else { return };
        if Some(p.percent) == last_percent || !throttle.ready() {
            return;
        }
        last_percent = Some(p.percent);
        ctx.reporter.emit(Event::Progress {
            stage: STAGE,
            percent: p.percent,
            files_done: p.files_done,
            files_total: p.files_total,
        });
    });

    match result {
        Ok(()) => {}
        Err(InstallerError::ToolExecutionFailed { ref program, code, ref diagnostic })
            if program == "rsync" && code == RSYNC_VANISHED =>
        {
            warn!("source files vanished during copy: {}", diagnostic);
        }
        Err(e) => return Err(e),
    }

    if last_percent != Some(100) {
        ctx.reporter.emit(Event::Progress {
            stage: STAGE,
            percent: 100,
            files_done: 0,
            files_total: 0,
        });
    }

    recreate_mount_dirs(target)?;
    info!("live system copied to {}", target.display());
    Ok(())
}

/// Exclude patterns, anchored at the transfer root. The work root and the
/// live medium are excluded wherever they sit below the source.
fn exclusions(source: &Path, target: &Path, live_mounts: &[PathBuf]) -> Vec<String> {
    let mut excludes: Vec<String> = RUNTIME_EXCLUDES.iter().map(|e| e.to_string()).collect();
    for path in std::iter::once(target).chain(live_mounts.iter().map(PathBuf::as_path)) {
        if let Ok(rel) = path.strip_prefix(source) {
            if !rel.as_os_str().is_empty() {
                excludes.push(format!("/{}", rel.display()));
            }
        }
    }
    excludes
}

fn trailing_slash(path: &Path) -> String {
    let s = path.display().to_string();
    if s.ends_with('/') {
        s
    } else {
        format!("{}/", s)
    }
}

fn recreate_mount_dirs(target: &Path) -> Result<(), InstallerError> {
    for dir in MOUNT_DIRS {
        fs::create_dir_all(target.join(dir))?;
    }
    fs::set_permissions(target.join("tmp"), fs::Permissions::from_mode(0o1777))?;
    Ok(())
}

// ── rsync --info=progress2 parser ─────────────────────────────────────────────
//
// Lines look like:
//     1,234,567,890  42%   85.31MB/s    0:00:13 (xfr#1024, to-chk=4321/9876)

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CopyProgress {
    percent: u8,
    files_done: u64,
    files_total: u64,
}

fn parse_progress2(line: &str) -> Option<CopyProgress> {
    let percent_idx = line.find('%')?;
    let percent_start = line[..percent_idx]
        .rfind(char::is_whitespace)
        .map(|i| i + 1)
        .unwrap_or(0);
    let percent: u8 = line[percent_start..percent_idx].trim().parse().ok()?;

    let (files_done, files_total) = match line.find("to-chk=") {
        Some(chk) => {
            let chk_part = &line[chk + 7..];
            let slash = chk_part.find('/')?;
            let close = chk_part.find(')')?;
            let remaining: u64 = chk_part[..slash].parse().ok()?;
            let total: u64 = chk_part[slash + 1..close].parse().ok()?;
            (total.saturating_sub(remaining), total)
        }
        None => (0, 0),
    };

    Some(CopyProgress {
        percent: percent.min(100),
        files_done,
        files_total,
    })
}
