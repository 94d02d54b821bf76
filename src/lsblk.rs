use std::{collections::HashMap, path::Path};

use crate::{
    cmd::{CommandRunner, Invocation},
    error::InstallerError,
};

// ── Data types ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockDevice {
    pub path: String,               // /dev/vdb1
    pub kind: String,               // disk | part | loop | rom
    pub mountpoint: Option<String>, // /boot/efi
    pub parent: Option<String>,     // /dev/vdb
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Lists `disk` and every partition on it.
///
/// A device lsblk cannot see is reported as `PreconditionFailed`, with
/// lsblk's own message kept in the cause.
pub fn probe(runner: &dyn CommandRunner, disk: &str) -> Result<Vec<BlockDevice>, InstallerError> {
    let output = runner
        .run(&Invocation::new(
            "lsblk",
            &[
                "--pairs",
                "--paths",
                "--output",
                "NAME,TYPE,MOUNTPOINT,PKNAME",
                disk,
            ],
        ))
        .map_err(|e| match e {
            InstallerError::ToolExecutionFailed { diagnostic, .. } => {
                InstallerError::PreconditionFailed(format!(
                    "target device {} not found: {}",
                    disk, diagnostic
                ))
            }
            other => other,
        })?;

    let devices: Vec<BlockDevice> = output
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|line| {
            let mut m = parse_pairs(line);
            let non_empty = |v: Option<String>| v.filter(|s| !s.is_empty());
            BlockDevice {
                path: m.remove("NAME").unwrap_or_default(),
                kind: m.remove("TYPE").unwrap_or_default(),
                mountpoint: non_empty(m.remove("MOUNTPOINT")),
                parent: non_empty(m.remove("PKNAME")),
            }
        })
        .collect();

    if devices.is_empty() {
        return Err(InstallerError::PreconditionFailed(format!(
            "target device {} not found",
            disk
        )));
    }
    Ok(devices)
}

/// Source device of the filesystem mounted exactly at `mountpoint`, if it
/// is a block device. Pseudo sources (overlay, tmpfs, …) yield `None`.
pub fn mount_source(runner: &dyn CommandRunner, mountpoint: &Path) -> Option<String> {
    let mountpoint = mountpoint.display().to_string();
    let out = runner
        .run(&Invocation::new(
            "findmnt",
            &["--noheadings", "--output", "SOURCE", "--mountpoint", &mountpoint],
        ))
        .ok()?;

    // btrfs subvolume mounts look like /dev/sda2[/@]
    let source = out.lines().next()?.trim();
    let source = source.split('[').next().unwrap_or(source);
    source.starts_with("/dev/").then(|| source.to_string())
}

/// Whole-disk parent of a partition (`/dev/sda1` → `/dev/sda`).
pub fn parent_disk(runner: &dyn CommandRunner, device: &str) -> Option<String> {
    let out = runner
        .run(&Invocation::new(
            "lsblk",
            &["--noheadings", "--nodeps", "--paths", "--output", "PKNAME", device],
        ))
        .ok()?;
    let parent = out.trim();
    (!parent.is_empty()).then(|| parent.to_string())
}

/// Whether anything is mounted exactly at `path`.
pub fn is_mounted(runner: &dyn CommandRunner, path: &Path) -> bool {
    let path = path.display().to_string();
    runner
        .run(&Invocation::new(
            "findmnt",
            &["--noheadings", "--output", "TARGET", "--mountpoint", &path],
        ))
        .map(|out| !out.trim().is_empty())
        .unwrap_or(false)
}

/// UUID of the filesystem on `device`.
pub fn uuid(runner: &dyn CommandRunner, device: &str) -> Result<String, InstallerError> {
    let out = runner.run(&Invocation::new(
        "blkid",
        &["--match-tag", "UUID", "--output", "value", device],
    ))?;
    let uuid = out.trim();
    if uuid.is_empty() {
        return Err(InstallerError::PreconditionFailed(format!(
            "no filesystem UUID on {}",
            device
        )));
    }
    Ok(uuid.to_string())
}

// ── lsblk --pairs parser ──────────────────────────────────────────────────────
//
// Each line looks like:   NAME="/dev/sda1" TYPE="part" MOUNTPOINT="" PKNAME="/dev/sda"

fn parse_pairs(line: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    let mut rest = line.trim();

    while !rest.is_empty() {
        let Some(eq) = rest.find('=') else { break };
        let key = rest[..eq].split_whitespace().last().unwrap_or("").to_string();
        rest = &rest[eq + 1..];

        if !rest.starts_with('"') {
            break;
        }
        rest = &rest[1..]; // skip opening "

        let Some(close) = rest.find('"') else { break };
        let value = unescape(&rest[..close]);
        rest = &rest[close + 1..]; // skip closing "

        if !key.is_empty() {
            map.insert(key, value);
        }
    }

    map
}

/// lsblk writes unsafe bytes in values as `\xNN` (a space is `\x20`).
fn unescape(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && bytes.get(i + 1) == Some(&b'x') {
            let decoded = raw
                .get(i + 2..i + 4)
                .filter(|hex| hex.bytes().all(|b| b.is_ascii_hexdigit()))
                .and_then(|hex| u8::from_str_radix(hex, 16).ok());
            if let Some(b) = decoded {
                out.push(b);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
