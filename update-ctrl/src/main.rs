use std::{borrow::Cow, path::Path};

use clap::Parser as _;
use color_eyre::eyre::{self, WrapErr};
use tracing::{error, info, warn};
use uboot_env::UBootEnv;
use update_ctrl::{
    ExitStatus, ResultCode, StagedWorkflow, UBootStateStore, UpdateCtrl, WorkDir,
    console::SerialConsole,
    engine::CommandEngine,
    logging,
    program::{self, Cli},
    settings::{Args, Settings},
    workflow::CommandReboot,
};

const CFG_DEFAULT_PATH: &str = "/etc/update_ctrl.conf";
const ENV_VAR_PREFIX: &str = "UPDATE_CTRL_";
const CFG_ENV_VAR: &str = const_format::concatcp!(ENV_VAR_PREFIX, "CONFIG");

fn main() -> ExitStatus {
    let cli = Cli::parse();

    // Settings come first: automatic runs log to the console they name.
    let (config, origin) = get_config_source(&cli.args);
    let settings = Settings::get(&cli.args, &config, ENV_VAR_PREFIX);
    let console = match &settings {
        Ok(settings) if cli.is_automatic() => Some(SerialConsole::from_env(
            &UBootEnv::new(&settings.fw_printenv, &settings.fw_setenv),
        )),
        _ => None,
    };
    logging::init(
        cli.args.debug,
        console.as_ref().and_then(|c| c.as_ref().ok()).cloned(),
    );
    info!("using config {origin}: `{}`", config.display());
    let console = console.transpose().unwrap_or_else(|e| {
        warn!("serial console not available: {e}");
        None
    });

    match run(cli, settings, console.as_ref()) {
        Ok(status) => status,
        Err(err) => {
            error!("{err:?}");
            ExitStatus::Code(ResultCode::Unhandled)
        }
    }
}

fn get_config_source(args: &Args) -> (Cow<'_, Path>, Cow<'static, str>) {
    if let Some(config) = &args.config {
        (
            Cow::Borrowed(config.as_ref()),
            Cow::Borrowed("provided by command line argument"),
        )
    } else if let Some(config) = figment::providers::Env::var(CFG_ENV_VAR) {
        (
            Cow::Owned(std::path::PathBuf::from(config)),
            Cow::Owned(format!("set in environment variable `{CFG_ENV_VAR}`")),
        )
    } else {
        (
            Cow::Borrowed(CFG_DEFAULT_PATH.as_ref()),
            Cow::Borrowed("at default path"),
        )
    }
}

fn run(
    cli: Cli,
    settings: figment::error::Result<Settings>,
    console: Option<&SerialConsole>,
) -> eyre::Result<ExitStatus> {
    color_eyre::install()?;

    let settings = settings.wrap_err("failed reading settings")?;
    info!("starting update-ctrl with settings: {settings:?}");

    let store = UBootStateStore::new(
        UBootEnv::new(&settings.fw_printenv, &settings.fw_setenv),
        &settings.boot_id_path,
    );
    let engine = CommandEngine::new(settings.firmware, settings.application);
    let ctrl = UpdateCtrl::new(store.clone(), engine, WorkDir::new(&settings.work_dir));
    let workflow = StagedWorkflow::builder()
        .work_dir(WorkDir::new(&settings.work_dir))
        .store(store)
        .reboot(CommandReboot::new(settings.reboot_command))
        .poll_attempts(settings.progress_poll_attempts)
        .poll_interval(settings.progress_poll_interval)
        .build();

    program::run(&ctrl, &workflow, cli, console)
}
