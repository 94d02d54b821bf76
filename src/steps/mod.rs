pub mod bootloader;
pub mod chroot;
pub mod configure;
pub mod deploy;
pub mod disk;
pub mod firmware;

use crate::{
    cmd::CommandRunner,
    config::{EngineSettings, InstallConfig},
    progress::Reporter,
};

use self::firmware::FirmwareMode;

/// Everything a stage may read. Stages never mutate the configuration.
pub struct StageContext<'a> {
    pub config: &'a InstallConfig,
    pub settings: &'a EngineSettings,
    pub runner: &'a dyn CommandRunner,
    pub reporter: &'a Reporter,
    /// Firmware mode detected when the run started.
    pub firmware: FirmwareMode,
}
