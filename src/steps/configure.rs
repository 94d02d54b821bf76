use std::{fs, io, os::unix::fs::symlink, path::Path};

use tracing::info;

use crate::{
    cmd::Invocation,
    config::{has_line_break, InstallConfig, Secret},
    error::InstallerError,
    lsblk,
    steps::{chroot::IsolatedRoot, disk::DiskLayout, StageContext},
    supervisor::StageId,
};

const STAGE: StageId = StageId::SystemConfiguration;

const APT_OPTIONS: &[&str] = &[
    "-o",
    "Dpkg::Options::=--force-confdef",
    "-o",
    "Dpkg::Options::=--force-confold",
];

/// Configures the deployed system from inside an isolated root.
///
/// Order matters: the mirror is set before any package is installed, and
/// accounts are created only after the packages providing `sudo` are in.
pub fn run(ctx: &StageContext<'_>, layout: &DiskLayout) -> Result<(), InstallerError> {
    let config = ctx.config;
    let root = IsolatedRoot::enter(ctx.runner, &ctx.settings.work_root, ctx.firmware)?;

    ctx.reporter.step(STAGE, "Writing /etc/fstab");
    write_fstab(ctx, &root, layout)?;

    ctx.reporter
        .step(STAGE, format!("Setting hostname to {}", config.hostname()));
    set_hostname(&root, config.hostname())?;

    ctx.reporter.step(STAGE, format!("Setting locale to {}", config.locale()));
    set_locale(&root, config.locale())?;

    ctx.reporter.step(
        STAGE,
        format!("Setting keyboard layout to {}", config.keyboard_layout()),
    );
    set_keyboard(&root, config.keyboard_layout())?;

    ctx.reporter
        .step(STAGE, format!("Setting timezone to {}", config.timezone()));
    set_timezone(&root, config.timezone())?;

    ctx.reporter.step(
        STAGE,
        format!("Using package mirror {}", config.mirror_host()),
    );
    write_sources_list(&root, config, &ctx.settings.suite)?;
    root.run(apt("update"))?;

    let packages = package_set(ctx);
    ctx.reporter.step(
        STAGE,
        format!("Installing {} packages: {}", packages.len(), packages.join(" ")),
    );
    root.run(apt("install").arg("-y").args(APT_OPTIONS).args(&packages))?;

    ctx.reporter.step(STAGE, "Setting the root password");
    set_password(&root, "root", config.root_password())?;

    ctx.reporter
        .step(STAGE, format!("Creating user {}", config.username()));
    create_user(&root, config)?;

    info!("system configuration finished");
    Ok(())
}

fn apt(subcommand: &str) -> Invocation {
    Invocation::new("apt-get", &[subcommand]).env("DEBIAN_FRONTEND", "noninteractive")
}

/// Desktop, bootloader and account tooling, plus the optional sets.
fn package_set(ctx: &StageContext<'_>) -> Vec<&'static str> {
    let desktop = ctx.config.desktop_environment();
    let mut pkgs: Vec<&'static str> = desktop.packages().to_vec();
    pkgs.push(ctx.firmware.grub_package());
    pkgs.push("sudo");
    pkgs.extend(ctx.config.extra_packages());
    info!("{} desktop: {} packages", desktop, pkgs.len());
    pkgs
}

// ── Files ─────────────────────────────────────────────────────────────────────

fn write_file(root: &IsolatedRoot<'_>, rel: &str, contents: &str) -> io::Result<()> {
    let path = root.path(rel);
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    fs::write(path, contents)
}

fn write_fstab(
    ctx: &StageContext<'_>,
    root: &IsolatedRoot<'_>,
    layout: &DiskLayout,
) -> Result<(), InstallerError> {
    let (options, pass) = layout.filesystem.fstab_options();
    let mut fstab = String::from("# /etc/fstab: static file system information.\n");
    fstab.push_str(&format!(
        "UUID={}\t/\t{}\t{}\t0\t{}\n",
        lsblk::uuid(ctx.runner, &layout.root_partition)?,
        layout.filesystem,
        options,
        pass
    ));
    if let Some(ref esp) = layout.esp_partition {
        fstab.push_str(&format!(
            "UUID={}\t/boot/efi\tvfat\tumask=0077\t0\t1\n",
            lsblk::uuid(ctx.runner, esp)?
        ));
    }
    write_file(root, "etc/fstab", &fstab)?;
    Ok(())
}

fn set_hostname(root: &IsolatedRoot<'_>, hostname: &str) -> Result<(), InstallerError> {
    write_file(root, "etc/hostname", &format!("{}\n", hostname))?;
    write_file(
        root,
        "etc/hosts",
        &format!(
            "127.0.0.1\tlocalhost\n\
             127.0.1.1\t{}\n\
             \n\
             ::1\t\tlocalhost ip6-localhost ip6-loopback\n\
             ff02::1\t\tip6-allnodes\n\
             ff02::2\t\tip6-allrouters\n",
            hostname
        ),
    )?;
    Ok(())
}

/// Enables `<locale>.UTF-8` in locale.gen (uncommenting it when present),
/// generates it and makes it the default.
fn set_locale(root: &IsolatedRoot<'_>, locale: &str) -> Result<(), InstallerError> {
    let entry = format!("{}.UTF-8 UTF-8", locale);
    let existing = match fs::read_to_string(root.path("etc/locale.gen")) {
        Ok(s) => s,
        Err(e) if e.kind() == io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e.into()),
    };

    let mut found = false;
    let mut lines: Vec<String> = existing
        .lines()
        .map(|line| {
            let bare = line.trim_start_matches('#').trim();
            if bare == entry {
                found = true;
                entry.clone()
            } else {
                line.to_string()
            }
        })
        .collect();
    if !found {
        lines.push(entry);
    }
    write_file(root, "etc/locale.gen", &(lines.join("\n") + "\n"))?;

    root.run(Invocation::new("locale-gen", &[]))?;
    write_file(
        root,
        "etc/default/locale",
        &format!("LANG={}.UTF-8\n", locale),
    )?;
    Ok(())
}

fn set_keyboard(root: &IsolatedRoot<'_>, layout: &str) -> Result<(), InstallerError> {
    write_file(
        root,
        "etc/default/keyboard",
        &format!(
            "XKBMODEL=\"pc105\"\n\
             XKBLAYOUT=\"{}\"\n\
             XKBVARIANT=\"\"\n\
             XKBOPTIONS=\"\"\n\
             \n\
             BACKSPACE=\"guess\"\n",
            layout
        ),
    )?;
    Ok(())
}

fn set_timezone(root: &IsolatedRoot<'_>, timezone: &str) -> Result<(), InstallerError> {
    let zone = format!("/usr/share/zoneinfo/{}", timezone);
    if !root.path(&zone).exists() {
        return Err(InstallerError::PreconditionFailed(format!(
            "timezone data {} missing from the deployed system",
            zone
        )));
    }

    let localtime = root.path("etc/localtime");
    match fs::remove_file(&localtime) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    if let Some(dir) = localtime.parent() {
        fs::create_dir_all(dir)?;
    }
    symlink(Path::new(&zone), &localtime)?;
    write_file(root, "etc/timezone", &format!("{}\n", timezone))?;
    Ok(())
}

fn write_sources_list(
    root: &IsolatedRoot<'_>,
    config: &InstallConfig,
    suite: &str,
) -> Result<(), InstallerError> {
    let components = if config.needs_nonfree_components() {
        "main contrib non-free non-free-firmware"
    } else {
        "main"
    };
    let host = config.mirror_host();
    write_file(
        root,
        "etc/apt/sources.list",
        &format!(
            "deb http://{host}/debian {suite} {components}\n\
             deb http://{host}/debian {suite}-updates {components}\n\
             deb http://security.debian.org/debian-security {suite}-security {components}\n"
        ),
    )?;
    Ok(())
}

// ── Accounts ──────────────────────────────────────────────────────────────────

/// Passwords go through chpasswd's stdin, never through argv. A line break
/// would start a second `user:password` record, so none may reach the pipe.
fn set_password(root: &IsolatedRoot<'_>, user: &str, password: &Secret) -> Result<(), InstallerError> {
    if has_line_break(password) {
        return Err(InstallerError::ConfigurationInvalid(format!(
            "password for {} contains a line break",
            user
        )));
    }
    let payload = Secret::new(format!("{}:{}", user, password.expose()));
    root.run(Invocation::new("chpasswd", &[]).stdin(payload))?;
    Ok(())
}

fn create_user(root: &IsolatedRoot<'_>, config: &InstallConfig) -> Result<(), InstallerError> {
    let mut useradd = Invocation::new("useradd", &["-m", "-s", "/bin/bash", "-G", "sudo"]);
    if let Some(fullname) = config.user_fullname() {
        useradd = useradd.arg("-c").arg(fullname);
    }
    root.run(useradd.arg(config.username()))?;
    set_password(root, config.username(), config.user_password())
}
