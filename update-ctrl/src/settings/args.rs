use serde::Serialize;

/// Options shared by every subcommand.
#[derive(Debug, Default, clap::Args, Serialize)]
pub struct Args {
    /// The path to the config file.
    #[arg(long, global = true)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<String>,
    /// The directory shared with the delivery agent and the installer.
    #[arg(long, global = true)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub work_dir: Option<String>,
    /// Log at debug level.
    #[arg(long, short = 'd', global = true)]
    // Not a setting, only picked up by the logger.
    #[serde(skip)]
    pub debug: bool,
}
