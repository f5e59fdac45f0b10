use std::path::PathBuf;

use clap::{Parser, Subcommand};
use color_eyre::{
    Result,
    eyre::{WrapErr, bail},
};
use tracing::{debug, error};

use crate::{
    BootStateStore, ErrorClass, ExitStatus, Package, Slot, StagedWorkflow,
    UpdateCtrl, UpdateEngine, UpdateKind, UpdateRequest, Version,
    console::SerialConsole,
    controller::{AutomaticGate, AutomaticOutcome, CommitOutcome},
    result_code::{Report, result_code},
    settings::Args,
    workflow::{ApplyOutcome, DownloadOutcome, InstallOutcome, ProgressOutcome, Reboot},
};

#[derive(Parser)]
#[command(
    author,
    version,
    long_about = "Controls A/B updates of firmware and application. Every command \
    exits with a stable result code."
)]
#[allow(missing_docs)]
pub struct Cli {
    #[command(flatten)]
    pub args: Args,
    #[command(subcommand)]
    subcmd: Commands,
}

impl Cli {
    pub fn is_automatic(&self) -> bool {
        matches!(self.subcmd, Commands::Automatic(_))
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Write firmware and/or application into the inactive slot.
    #[command(name = "update", short_flag = 'u')]
    Update {
        /// Path to the firmware package.
        #[arg(long, short = 'f')]
        firmware: Option<PathBuf>,
        /// Path to the application package.
        #[arg(long, short = 'a')]
        application: Option<PathBuf>,
    },
    /// Commit the last update or rollback.
    #[command(name = "commit", short_flag = 'c')]
    Commit,
    /// Return to the previous slot of an uncommitted update.
    #[command(name = "rollback", short_flag = 'r')]
    Rollback {
        #[arg(value_enum)]
        kind: UpdateKind,
    },
    /// Boot the other slot of a committed system.
    #[command(name = "switch-slot")]
    SwitchSlot {
        #[arg(value_enum)]
        kind: UpdateKind,
    },
    /// Print the reboot state.
    #[command(name = "state", short_flag = 's')]
    State,
    /// Update from an update stick if newer versions are found on it.
    Automatic(AutomaticArgs),
    /// Print the installed versions.
    #[command(name = "versions", short_flag = 'v')]
    Versions {
        #[arg(value_enum)]
        kind: Option<UpdateKind>,
    },
    /// Check the work directory for an announced update.
    Available,
    /// Request the download of the announced update.
    Download,
    /// Print the download progress.
    Progress,
    /// Request the installation of the downloaded update.
    Install,
    /// Activate the installed update or a pending rollback.
    Apply,
    /// Mark a firmware or application slot as bad.
    #[command(name = "mark-bad")]
    MarkBad {
        #[arg(value_enum)]
        kind: UpdateKind,
        /// A/a/0 or B/b/1.
        slot: String,
    },
    /// Check whether a firmware or application slot is bad.
    #[command(name = "is-bad")]
    IsBad {
        #[arg(value_enum)]
        kind: UpdateKind,
        /// A/a/0 or B/b/1.
        slot: String,
    },
}

/// Packages on the update stick, as exported by the automounter.
#[derive(Debug, clap::Args)]
struct AutomaticArgs {
    /// Mount point of the update stick.
    #[arg(long, env = "UPDATE_STICK")]
    update_stick: PathBuf,
    /// Firmware package, relative to the update stick.
    #[arg(long, env = "FIRMWARE_FILE")]
    firmware_file: Option<PathBuf>,
    #[arg(long, env = "FW_VERSION")]
    fw_version: Option<Version>,
    /// Application package, relative to the update stick.
    #[arg(long, env = "APPLICATION_FILE")]
    application_file: Option<PathBuf>,
    #[arg(long, env = "APP_VERSION")]
    app_version: Option<Version>,
}

impl AutomaticArgs {
    fn package(
        &self,
        file: &Option<PathBuf>,
        version: Option<Version>,
    ) -> Option<Package> {
        let (file, version) = (file.as_deref()?, version?);
        let relative = file.strip_prefix("/").unwrap_or(file);
        Some(Package::with_version(self.update_stick.join(relative), version))
    }

    fn request(&self) -> UpdateRequest {
        UpdateRequest {
            firmware: self.package(&self.firmware_file, self.fw_version),
            application: self.package(&self.application_file, self.app_version),
        }
    }
}

/// User messages, copied to the serial console when there is one.
struct Output<'a> {
    console: Option<&'a SerialConsole>,
}

impl Output<'_> {
    fn say(&self, msg: &str) {
        println!("{msg}");
        if let Some(console) = self.console {
            console.write_line(msg);
        }
    }

    fn complain(&self, msg: &str) {
        eprintln!("{msg}");
        if let Some(console) = self.console {
            console.write_line(msg);
        }
    }
}

/// Splits errors into their class, passing on the ones no result code covers.
fn classify<T>(
    out: &Output,
    context: &str,
    result: crate::Result<T>,
) -> Result<Result<T, ErrorClass>> {
    match result {
        Ok(value) => Ok(Ok(value)),
        Err(e) => match e.class() {
            ErrorClass::Fatal => Err(e).wrap_err(context.to_owned()),
            class => {
                out.complain(&format!("{context}: {e}"));
                if class == ErrorClass::System {
                    check_running_as_root(out);
                }
                Ok(Err(class))
            }
        },
    }
}

fn check_running_as_root(out: &Output) {
    let uid = rustix::process::getuid();
    let euid = rustix::process::geteuid();
    if !(uid.is_root() && euid.is_root()) {
        out.complain("Please try again as root user.");
    }
}

fn capitalized(kind: UpdateKind) -> String {
    let kind = kind.to_string();
    let mut chars = kind.chars();
    chars
        .next()
        .map(|first| first.to_uppercase().chain(chars).collect())
        .unwrap_or_default()
}

fn package(path: Option<PathBuf>) -> Option<Package> {
    path.map(Package::new)
}

pub fn run<S, E, R>(
    ctrl: &UpdateCtrl<S, E>,
    workflow: &StagedWorkflow<S, R>,
    cli: Cli,
    console: Option<&SerialConsole>,
) -> Result<ExitStatus>
where
    S: BootStateStore,
    E: UpdateEngine,
    R: Reboot,
{
    let out = Output { console };
    let report = match cli.subcmd {
        Commands::Update {
            firmware,
            application,
        } => {
            let request = UpdateRequest {
                firmware: package(firmware),
                application: package(application),
            };
            let Some(kind) = request.kind() else {
                bail!("no firmware or application package given");
            };
            let result = classify(
                &out,
                &format!("{} update failed", capitalized(kind)),
                ctrl.request_update(&request),
            )?;
            if result.is_ok() {
                println!("{} update successful", capitalized(kind));
            }
            Report::Update { kind, result }
        }
        Commands::Commit => {
            let result = classify(&out, "Commit failed", ctrl.commit_update())?;
            match result {
                Ok(CommitOutcome::Committed) => println!("Commit update successful"),
                Ok(CommitOutcome::NotNeeded) => println!("Commit update not needed"),
                Ok(CommitOutcome::RebootPending { .. }) => {
                    println!("Commit update not possible, reboot pending")
                }
                Err(_) => (),
            }
            Report::Commit(result)
        }
        Commands::Rollback { kind } => {
            let result = classify(
                &out,
                &format!("{} rollback failed", capitalized(kind)),
                ctrl.rollback(kind),
            )?;
            if result.is_ok() {
                println!("{} rollback successful", capitalized(kind));
            }
            Report::Rollback { kind, result }
        }
        Commands::SwitchSlot { kind } => {
            let result = classify(
                &out,
                &format!("{} slot switch failed", capitalized(kind)),
                ctrl.switch_slot(kind),
            )?;
            if result.is_ok() {
                println!("{} slot switch successful", capitalized(kind));
            }
            Report::Rollback { kind, result }
        }
        Commands::State => {
            let state = ctrl
                .get_reboot_state()
                .wrap_err("failed to read the reboot state")?;
            let reboot_complete = if state.is_incomplete_update() {
                ctrl.reboot_complete(state)
                    .wrap_err("failed to check for a reboot")?
            } else {
                true
            };
            println!("{state}");
            if !reboot_complete {
                println!("Reboot pending");
            }
            Report::RebootState {
                state,
                reboot_complete,
            }
        }
        Commands::Automatic(args) => automatic(ctrl, &args, &out)?,
        Commands::Versions { kind } => {
            let kinds = match kind {
                None | Some(UpdateKind::Combined) => {
                    vec![UpdateKind::Firmware, UpdateKind::Application]
                }
                Some(kind) => vec![kind],
            };
            for kind in kinds {
                let version = ctrl
                    .get_version(kind)
                    .wrap_err_with(|| format!("failed to read the {kind} version"))?;
                println!("{} version: {version}", capitalized(kind));
            }
            return Ok(ExitStatus::Success);
        }
        Commands::Available => {
            let descriptor = workflow
                .notice_available()
                .wrap_err("failed to read the update descriptor")?;
            match &descriptor {
                Some(d) => println!(
                    "{} update {} available, {} bytes",
                    capitalized(d.kind),
                    d.version,
                    d.size
                ),
                None => println!("No update available"),
            }
            Report::Available(descriptor.map(|d| d.kind))
        }
        Commands::Download => {
            let outcome = workflow
                .request_download()
                .wrap_err("failed to request the download")?;
            println!(
                "{}",
                match outcome {
                    DownloadOutcome::NotQueued => "No download queued",
                    DownloadOutcome::Started => "Download started",
                    DownloadOutcome::StartedBefore => "Download started before",
                    DownloadOutcome::Failed => "Download could not be requested",
                }
            );
            Report::Download(outcome)
        }
        Commands::Progress => {
            let outcome = workflow
                .progress()
                .wrap_err("failed to determine the download progress")?;
            match outcome {
                ProgressOutcome::NoDownloadStarted => println!("No download started"),
                ProgressOutcome::WaitingToStart => {
                    println!("Waiting for download to start")
                }
                ProgressOutcome::InProgress(percent) => println!("{percent}"),
                ProgressOutcome::Finished => println!("100"),
            }
            Report::Progress(outcome)
        }
        Commands::Install => {
            let outcome = workflow
                .request_install()
                .wrap_err("failed to request the installation")?;
            println!(
                "{}",
                match outcome {
                    InstallOutcome::NotQueued => "No installation queued",
                    InstallOutcome::InProgress => "Installation in progress",
                    InstallOutcome::Finished => "Installation finished",
                    InstallOutcome::Failed => "Installation failed",
                }
            );
            Report::Install(outcome)
        }
        Commands::Apply => {
            let outcome = workflow
                .request_apply()
                .wrap_err("failed to apply the update")?;
            match outcome {
                ApplyOutcome::Successful => println!("Apply update successful"),
                ApplyOutcome::NothingToApply => println!("Nothing to apply"),
                ApplyOutcome::Failed => println!("Apply update failed"),
                ApplyOutcome::RebootFailed(errno) => {
                    error!("reboot failed with errno {errno}");
                    println!("Apply update failed, reboot not possible");
                }
            }
            Report::Apply(outcome)
        }
        Commands::MarkBad { kind, slot } => {
            let result = classify(
                &out,
                "Marking slot bad failed",
                slot.parse::<Slot>()
                    .and_then(|slot| ctrl.mark_slot_bad(kind, slot))
                    .map(|()| false),
            )?;
            if result.is_ok() {
                println!("{} slot {slot} marked bad", capitalized(kind));
            }
            Report::SlotHealth(result)
        }
        Commands::IsBad { kind, slot } => {
            let result = classify(
                &out,
                "Reading slot state failed",
                slot.parse::<Slot>()
                    .and_then(|slot| ctrl.is_slot_bad(kind, slot)),
            )?;
            if let Ok(bad) = result {
                let state = if bad { "bad" } else { "good" };
                println!("{} slot {slot} is {state}", capitalized(kind));
            }
            Report::SlotHealth(result)
        }
    };

    debug!("{report:?}");
    Ok(result_code(&report))
}

fn automatic<S, E>(
    ctrl: &UpdateCtrl<S, E>,
    args: &AutomaticArgs,
    out: &Output,
) -> Result<Report>
where
    S: BootStateStore,
    E: UpdateEngine,
{
    let request = args.request();
    let Some(kind) = request.kind() else {
        bail!(
            "no complete firmware or application package on update stick `{}`",
            args.update_stick.display()
        );
    };

    let gate = match classify(
        out,
        "Allowing automatic update failed",
        ctrl.allow_automatic_update(),
    )? {
        Ok(gate) => gate,
        Err(class) => {
            return Ok(Report::Automatic {
                kind,
                result: Err(class),
            });
        }
    };
    if gate != AutomaticGate::Allowed {
        out.say(&format!("Automatic update not allowed: {gate:?}"));
        return Ok(Report::AllowAutomatic(gate));
    }

    let result = classify(
        out,
        &format!("Automatic {kind} update failed"),
        ctrl.automatic_update(&request),
    )?;
    match result {
        Ok(AutomaticOutcome::Updated) => {
            out.say(&format!("Automatic {kind} update successful"))
        }
        Ok(AutomaticOutcome::UpToDate) => {
            out.say(&format!("{} is up to date", capitalized(kind)))
        }
        Err(_) => (),
    }

    Ok(Report::Automatic {
        kind,
        result: result.map(|_| ()),
    })
}
