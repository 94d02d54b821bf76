use std::{
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use serde::Deserialize;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::InstallerError;

// ── Catalogs ──────────────────────────────────────────────────────────────────

pub const LOCALES: &[&str] = &[
    "en_US", "en_GB", "es_ES", "fr_FR", "de_DE", "pt_BR", "it_IT", "ja_JP", "zh_CN", "ru_RU",
];

pub const KEYBOARDS: &[&str] = &["us", "gb", "es", "fr", "de", "pt", "it", "jp", "ru"];

pub const TIMEZONES: &[&str] = &[
    "UTC",
    "America/New_York",
    "America/Chicago",
    "America/Denver",
    "America/Los_Angeles",
    "Europe/London",
    "Europe/Paris",
    "Europe/Berlin",
    "Asia/Tokyo",
    "Asia/Shanghai",
    "Australia/Sydney",
];

/// Mirror region code → Debian mirror host.
pub const MIRRORS: &[(&str, &str)] = &[
    ("global", "deb.debian.org"),
    ("us", "ftp.us.debian.org"),
    ("uk", "ftp.uk.debian.org"),
    ("de", "ftp.de.debian.org"),
    ("fr", "ftp.fr.debian.org"),
    ("jp", "ftp.jp.debian.org"),
    ("au", "ftp.au.debian.org"),
    ("br", "ftp.br.debian.org"),
];

// ── Secrets ───────────────────────────────────────────────────────────────────

/// A password. Wiped on drop, redacted in `Debug`, never `Display`ed.
#[derive(Clone, Default, PartialEq, Eq, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Secret(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

// ── Closed sets ───────────────────────────────────────────────────────────────

/// Filesystem created on the root partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Filesystem {
    Ext4,
    Btrfs,
    Xfs,
}

impl Filesystem {
    pub fn as_str(self) -> &'static str {
        match self {
            Filesystem::Ext4 => "ext4",
            Filesystem::Btrfs => "btrfs",
            Filesystem::Xfs => "xfs",
        }
    }

    /// `mkfs` program and the flag that makes it overwrite an existing signature.
    pub fn mkfs(self) -> (&'static str, &'static str) {
        match self {
            Filesystem::Ext4 => ("mkfs.ext4", "-F"),
            Filesystem::Btrfs => ("mkfs.btrfs", "-f"),
            Filesystem::Xfs => ("mkfs.xfs", "-f"),
        }
    }

    /// Mount options and fsck pass number for the `/etc/fstab` root entry.
    pub fn fstab_options(self) -> (&'static str, u8) {
        match self {
            Filesystem::Ext4 => ("errors=remount-ro", 1),
            Filesystem::Btrfs => ("defaults", 0),
            Filesystem::Xfs => ("defaults", 0),
        }
    }
}

impl FromStr for Filesystem {
    type Err = InstallerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ext4" => Ok(Filesystem::Ext4),
            "btrfs" => Ok(Filesystem::Btrfs),
            "xfs" => Ok(Filesystem::Xfs),
            other => Err(InstallerError::ConfigurationInvalid(format!(
                "Unsupported filesystem '{}' (expected ext4, btrfs or xfs).",
                other
            ))),
        }
    }
}

impl fmt::Display for Filesystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Desktop environment installed into the deployed system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DesktopEnvironment {
    Xfce,
    Gnome,
    Kde,
    Openbox,
}

impl DesktopEnvironment {
    pub fn as_str(self) -> &'static str {
        match self {
            DesktopEnvironment::Xfce => "xfce",
            DesktopEnvironment::Gnome => "gnome",
            DesktopEnvironment::Kde => "kde",
            DesktopEnvironment::Openbox => "openbox",
        }
    }

    /// Debian packages providing this desktop.
    pub fn packages(self) -> &'static [&'static str] {
        match self {
            DesktopEnvironment::Xfce => &["task-xfce-desktop"],
            DesktopEnvironment::Gnome => &["task-gnome-desktop"],
            DesktopEnvironment::Kde => &["task-kde-desktop"],
            DesktopEnvironment::Openbox => &["openbox", "obconf", "tint2", "lightdm", "xorg"],
        }
    }

    /// Human-readable label shown in summaries.
    pub fn display_name(self) -> &'static str {
        match self {
            DesktopEnvironment::Xfce => "XFCE",
            DesktopEnvironment::Gnome => "GNOME",
            DesktopEnvironment::Kde => "KDE Plasma",
            DesktopEnvironment::Openbox => "Openbox",
        }
    }
}

impl fmt::Display for DesktopEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DesktopEnvironment {
    type Err = InstallerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "xfce" => Ok(DesktopEnvironment::Xfce),
            "gnome" => Ok(DesktopEnvironment::Gnome),
            "kde" => Ok(DesktopEnvironment::Kde),
            "openbox" => Ok(DesktopEnvironment::Openbox),
            other => Err(InstallerError::ConfigurationInvalid(format!(
                "Unsupported desktop environment '{}'.",
                other
            ))),
        }
    }
}

pub const NVIDIA_PACKAGES: &[&str] = &["nvidia-driver", "firmware-misc-nonfree"];

pub const NONFREE_FIRMWARE_PACKAGES: &[&str] = &[
    "firmware-linux-nonfree",
    "firmware-iwlwifi",
    "firmware-realtek",
    "firmware-atheros",
];

// ── Raw request ───────────────────────────────────────────────────────────────

/// The configuration document as written by the wizard. Nothing here is
/// trusted until it has been turned into an [`InstallConfig`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InstallRequest {
    pub target_disk: Option<String>,
    pub filesystem: String,
    pub desktop_environment: String,
    #[serde(alias = "language")]
    pub locale: String,
    #[serde(alias = "keyboard")]
    pub keyboard_layout: String,
    pub timezone: String,
    #[serde(alias = "mirror_country")]
    pub mirror_region: String,
    pub hostname: String,
    pub username: String,
    pub user_fullname: String,
    pub root_password: Secret,
    pub root_password_confirm: Option<Secret>,
    pub user_password: Secret,
    pub user_password_confirm: Option<Secret>,
    pub install_nvidia: bool,
    pub install_nonfree: bool,
}

impl Default for InstallRequest {
    fn default() -> Self {
        Self {
            target_disk: None,
            filesystem: "ext4".to_string(),
            desktop_environment: "xfce".to_string(),
            locale: "en_US".to_string(),
            keyboard_layout: "us".to_string(),
            timezone: "UTC".to_string(),
            mirror_region: "global".to_string(),
            hostname: "on1os".to_string(),
            username: String::new(),
            user_fullname: String::new(),
            root_password: Secret::default(),
            root_password_confirm: None,
            user_password: Secret::default(),
            user_password_confirm: None,
            install_nvidia: false,
            install_nonfree: false,
        }
    }
}

impl InstallRequest {
    pub fn from_json(document: &str) -> Result<Self, InstallerError> {
        Ok(serde_json::from_str(document)?)
    }

    pub fn load(path: &Path) -> Result<Self, InstallerError> {
        let document = std::fs::read_to_string(path)?;
        Self::from_json(&document)
    }
}

// ── Validated record ──────────────────────────────────────────────────────────

/// A fully validated installation request. The only way to obtain one is
/// `InstallConfig::try_from(request)`, and the engine accepts nothing else.
#[derive(Debug, Clone)]
pub struct InstallConfig {
    target_disk: String,
    filesystem: Filesystem,
    desktop_environment: DesktopEnvironment,
    locale: String,
    keyboard_layout: String,
    timezone: String,
    mirror_region: String,
    hostname: String,
    username: String,
    user_fullname: Option<String>,
    root_password: Secret,
    user_password: Secret,
    install_nvidia: bool,
    install_nonfree: bool,
}

fn invalid(msg: &str) -> InstallerError {
    InstallerError::ConfigurationInvalid(msg.to_string())
}

fn is_valid_hostname(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
}

fn is_valid_username(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_lowercase())
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
}

pub(crate) fn has_line_break(secret: &Secret) -> bool {
    secret.expose().contains(['\n', '\r'])
}

fn check_catalog(value: &str, catalog: &[&str], what: &str) -> Result<(), InstallerError> {
    if catalog.contains(&value) {
        Ok(())
    } else {
        Err(InstallerError::ConfigurationInvalid(format!(
            "Unknown {} '{}'.",
            what, value
        )))
    }
}

impl TryFrom<InstallRequest> for InstallConfig {
    type Error = InstallerError;

    fn try_from(req: InstallRequest) -> Result<Self, Self::Error> {
        let target_disk = req
            .target_disk
            .clone()
            .filter(|d| !d.trim().is_empty())
            .ok_or_else(|| invalid("Please select a target disk."))?;

        let filesystem: Filesystem = req.filesystem.parse()?;
        let desktop_environment: DesktopEnvironment = req.desktop_environment.parse()?;

        check_catalog(&req.locale, LOCALES, "locale")?;
        check_catalog(&req.keyboard_layout, KEYBOARDS, "keyboard layout")?;
        check_catalog(&req.timezone, TIMEZONES, "timezone")?;
        if mirror_host(&req.mirror_region).is_none() {
            return Err(InstallerError::ConfigurationInvalid(format!(
                "Unknown mirror region '{}'.",
                req.mirror_region
            )));
        }

        if req.root_password.is_empty() {
            return Err(invalid("Root password is required."));
        }
        if matches!(req.root_password_confirm, Some(ref c) if *c != req.root_password) {
            return Err(invalid("Root passwords do not match."));
        }
        // chpasswd reads one `user:password` per line.
        if has_line_break(&req.root_password) {
            return Err(invalid("Root password cannot contain line breaks."));
        }
        if req.username.is_empty() {
            return Err(invalid("Username is required."));
        }
        if !is_valid_username(&req.username) {
            return Err(invalid(
                "Username must start with a letter and contain only lowercase letters and numbers.",
            ));
        }
        if req.username == "root" {
            return Err(invalid("Username 'root' is reserved."));
        }
        if req.user_password.is_empty() {
            return Err(invalid("User password is required."));
        }
        if matches!(req.user_password_confirm, Some(ref c) if *c != req.user_password) {
            return Err(invalid("User passwords do not match."));
        }
        if has_line_break(&req.user_password) {
            return Err(invalid("User password cannot contain line breaks."));
        }
        if req.hostname.is_empty() {
            return Err(invalid("Computer name is required."));
        }
        if !is_valid_hostname(&req.hostname) {
            return Err(invalid(
                "Computer name can only contain letters, numbers, and hyphens.",
            ));
        }
        // Written into /etc/passwd's GECOS field.
        if req.user_fullname.contains([':', ',', '\n']) {
            return Err(invalid("Full name cannot contain ':', ',' or line breaks."));
        }

        let fullname = req.user_fullname.trim();
        Ok(InstallConfig {
            target_disk,
            filesystem,
            desktop_environment,
            locale: req.locale.clone(),
            keyboard_layout: req.keyboard_layout.clone(),
            timezone: req.timezone.clone(),
            mirror_region: req.mirror_region.clone(),
            hostname: req.hostname.clone(),
            username: req.username.clone(),
            user_fullname: (!fullname.is_empty()).then(|| fullname.to_string()),
            root_password: req.root_password.clone(),
            user_password: req.user_password.clone(),
            install_nvidia: req.install_nvidia,
            install_nonfree: req.install_nonfree,
        })
    }
}

impl InstallConfig {
    pub fn target_disk(&self) -> &str {
        &self.target_disk
    }

    pub fn filesystem(&self) -> Filesystem {
        self.filesystem
    }

    pub fn desktop_environment(&self) -> DesktopEnvironment {
        self.desktop_environment
    }

    pub fn locale(&self) -> &str {
        &self.locale
    }

    pub fn keyboard_layout(&self) -> &str {
        &self.keyboard_layout
    }

    pub fn timezone(&self) -> &str {
        &self.timezone
    }

    pub fn mirror_region(&self) -> &str {
        &self.mirror_region
    }

    /// Mirror host for the region; validation guarantees it exists.
    pub fn mirror_host(&self) -> &'static str {
        mirror_host(&self.mirror_region).unwrap_or("deb.debian.org")
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn user_fullname(&self) -> Option<&str> {
        self.user_fullname.as_deref()
    }

    pub fn root_password(&self) -> &Secret {
        &self.root_password
    }

    pub fn user_password(&self) -> &Secret {
        &self.user_password
    }

    pub fn install_nvidia(&self) -> bool {
        self.install_nvidia
    }

    pub fn install_nonfree(&self) -> bool {
        self.install_nonfree
    }

    /// Whether apt needs the contrib / non-free components.
    pub fn needs_nonfree_components(&self) -> bool {
        self.install_nvidia || self.install_nonfree
    }

    /// Every optional package requested on top of the desktop set.
    pub fn extra_packages(&self) -> Vec<&'static str> {
        let mut pkgs = Vec::new();
        if self.install_nvidia {
            pkgs.extend_from_slice(NVIDIA_PACKAGES);
        }
        if self.install_nonfree {
            pkgs.extend_from_slice(NONFREE_FIRMWARE_PACKAGES);
        }
        pkgs
    }
}

pub fn mirror_host(region: &str) -> Option<&'static str> {
    MIRRORS
        .iter()
        .find(|(code, _)| *code == region)
        .map(|(_, host)| *host)
}

// ── Engine settings ───────────────────────────────────────────────────────────

/// Host-side knobs of the engine. None of these come from the wizard.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Where the target's root filesystem is mounted during the run.
    pub work_root: PathBuf,
    /// Root of the tree copied onto the target (the live system).
    pub source_root: PathBuf,
    /// Candidate mount points of the live medium.
    pub live_medium_mounts: Vec<PathBuf>,
    /// Debian suite written to `sources.list`.
    pub suite: String,
    pub bootloader_id: String,
    /// Present only when the machine booted in UEFI mode.
    pub efivars: PathBuf,
    pub lock_file: PathBuf,
    /// Minimum delay between two deployment progress events.
    pub progress_interval: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            work_root: PathBuf::from("/mnt/on1os"),
            source_root: PathBuf::from("/"),
            live_medium_mounts: vec![
                PathBuf::from("/run/live/medium"),
                PathBuf::from("/lib/live/mount/medium"),
                PathBuf::from("/cdrom"),
            ],
            suite: "bookworm".to_string(),
            bootloader_id: "on1os".to_string(),
            efivars: PathBuf::from("/sys/firmware/efi/efivars"),
            lock_file: PathBuf::from("/run/on1os-installer.lock"),
            progress_interval: Duration::from_secs(1),
        }
    }
}

#[cfg(test)]
pub(crate) fn test_request(disk: &str) -> InstallRequest {
    InstallRequest {
        target_disk: Some(disk.to_string()),
        hostname: "test-host".to_string(),
        username: "alice".to_string(),
        user_fullname: "Alice Example".to_string(),
        root_password: Secret::new("r00t;$(reboot)"),
        user_password: Secret::new("p@ss `id` | rm -rf /"),
        ..InstallRequest::default()
    }
}

#[cfg(test)]
pub(crate) fn test_config(disk: &str) -> InstallConfig {
    InstallConfig::try_from(test_request(disk)).expect("test request is valid")
}
