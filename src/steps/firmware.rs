use std::{fmt, path::Path};

/// How the machine booted, which decides partition scheme and GRUB target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirmwareMode {
    Uefi,
    Bios,
}

impl FirmwareMode {
    /// UEFI when the kernel exposes EFI variables (normally
    /// `/sys/firmware/efi/efivars`), BIOS/Legacy otherwise.
    pub fn detect(efivars: &Path) -> Self {
        if efivars.exists() {
            FirmwareMode::Uefi
        } else {
            FirmwareMode::Bios
        }
    }

    pub fn grub_target(self) -> &'static str {
        match self {
            FirmwareMode::Uefi => "x86_64-efi",
            FirmwareMode::Bios => "i386-pc",
        }
    }

    /// Debian package carrying the GRUB platform files.
    pub fn grub_package(self) -> &'static str {
        match self {
            FirmwareMode::Uefi => "grub-efi-amd64",
            FirmwareMode::Bios => "grub-pc",
        }
    }
}

impl fmt::Display for FirmwareMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FirmwareMode::Uefi => "UEFI",
            FirmwareMode::Bios => "BIOS/Legacy",
        })
    }
}
