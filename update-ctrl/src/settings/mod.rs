use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use figment::providers::Format as _;
use serde::{Deserialize, Serialize};
use serde_with::{DurationMilliSeconds, serde_as};

use crate::{
    boot_state::DEFAULT_BOOT_ID_PATH,
    engine::EngineCommands,
    workflow::{DEFAULT_POLL_ATTEMPTS, DEFAULT_POLL_INTERVAL},
};

mod args;
pub use args::Args;


pub const DEFAULT_WORK_DIR: &str = "/tmp/adu/.work";

/// `Settings` are the configurable options of the update controller.
///
/// The only entry point to construct `Settings` is `Settings::get`.
#[serde_as]
#[derive(Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct Settings {
    /// Directory shared with the delivery agent and the installer.
    pub work_dir: PathBuf,
    pub fw_printenv: PathBuf,
    pub fw_setenv: PathBuf,
    pub boot_id_path: PathBuf,
    pub reboot_command: Vec<String>,
    /// How often `progress` looks for the download location before giving up.
    pub progress_poll_attempts: u32,
    #[serde_as(as = "DurationMilliSeconds")]
    pub progress_poll_interval: Duration,
    pub firmware: EngineCommands,
    pub application: EngineCommands,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            work_dir: DEFAULT_WORK_DIR.into(),
            fw_printenv: uboot_env::DEFAULT_PRINTENV.into(),
            fw_setenv: uboot_env::DEFAULT_SETENV.into(),
            boot_id_path: DEFAULT_BOOT_ID_PATH.into(),
            reboot_command: vec!["reboot".to_owned()],
            progress_poll_attempts: DEFAULT_POLL_ATTEMPTS,
            progress_poll_interval: DEFAULT_POLL_INTERVAL,
            firmware: EngineCommands::firmware_defaults(),
            application: EngineCommands::application_defaults(),
        }
    }
}

impl Settings {
    /// Constructs `Settings` from defaults, a config file, environment variables and
    /// command line arguments, each overriding the ones before.
    ///
    /// Nested tables are addressed with `__` in environment variables, e.g.
    /// `UPDATE_CTRL_FIRMWARE__VERSION_FILE`.
    pub fn get<P: AsRef<Path>>(
        args: &Args,
        config: P,
        env_prefix: &str,
    ) -> figment::error::Result<Settings> {
        figment::Figment::new()
            .merge(figment::providers::Serialized::defaults(Settings::default()))
            .merge(figment::providers::Toml::file(config))
            .merge(figment::providers::Env::prefixed(env_prefix).split("__"))
            .merge(figment::providers::Serialized::defaults(args))
            .extract()
    }
}
