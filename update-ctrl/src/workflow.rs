//! Staged download → install → apply workflow of one package.
//!
//! The work directory is shared with a delivery agent, which writes the descriptor
//! files and the downloaded artifact, and a privileged installer, which watches the
//! `installUpdate` marker and writes `updateInstalled` when done. Markers are empty
//! files created with `O_EXCL`, so two racing invocations can never both believe
//! they started a stage.

use std::{
    fs::{self, OpenOptions},
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    process::Command,
    thread,
    time::Duration,
};

use bon::bon;
use tracing::{debug, error, info, warn};

use crate::{BootStateStore, Error, Result, UpdateKind, Version};

pub const UPDATE_TYPE: &str = "update_type";
pub const UPDATE_VERSION: &str = "update_version";
pub const UPDATE_SIZE: &str = "update_size";
pub const UPDATE_LOCATION: &str = "update_location";

pub const DEFAULT_POLL_ATTEMPTS: u32 = 5;
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marker {
    Download,
    Install,
    Apply,
    Rollback,
    Installed,
}

impl Marker {
    pub const ALL: [Marker; 5] = [
        Marker::Download,
        Marker::Install,
        Marker::Apply,
        Marker::Rollback,
        Marker::Installed,
    ];

    pub const fn file_name(self) -> &'static str {
        match self {
            Marker::Download => "downloadUpdate",
            Marker::Install => "installUpdate",
            Marker::Apply => "applyUpdate",
            Marker::Rollback => "rollbackUpdate",
            Marker::Installed => "updateInstalled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerCreation {
    Created,
    AlreadyPresent,
}

/// The directory holding the files of the staged workflow.
#[derive(Debug, Clone)]
pub struct WorkDir {
    path: PathBuf,
}

impl WorkDir {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn has(&self, marker: Marker) -> Result<bool> {
        let path = self.path.join(marker.file_name());
        path.try_exists()
            .map_err(Error::io(format!("failed checking `{}`", path.display())))
    }

    /// Creates `marker`, never touching an existing one.
    pub fn create(&self, marker: Marker) -> io::Result<MarkerCreation> {
        let path = self.path.join(marker.file_name());
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(_) => {
                debug!("created marker `{}`", path.display());
                Ok(MarkerCreation::Created)
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                Ok(MarkerCreation::AlreadyPresent)
            }
            Err(e) => Err(e),
        }
    }

    pub fn remove(&self, marker: Marker) -> Result<()> {
        self.remove_file(marker.file_name())
    }

    /// Removes every marker and descriptor file of the workflow.
    pub fn clear_workflow(&self) -> Result<()> {
        for marker in Marker::ALL {
            self.remove(marker)?;
        }
        for name in [UPDATE_TYPE, UPDATE_VERSION, UPDATE_SIZE, UPDATE_LOCATION] {
            self.remove_file(name)?;
        }
        debug!("cleared workflow files in `{}`", self.path.display());
        Ok(())
    }

    fn remove_file(&self, name: &str) -> Result<()> {
        let path = self.path.join(name);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => {
                Err(Error::io(format!("failed removing `{}`", path.display()))(e))
            }
        }
    }

    /// Reads a descriptor file, `None` if it does not exist.
    fn read(&self, name: &str) -> Result<Option<String>> {
        let path = self.path.join(name);
        match fs::read_to_string(&path) {
            Ok(contents) => Ok(Some(contents.trim().to_owned())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::io(format!("failed reading `{}`", path.display()))(e)),
        }
    }

    /// The artifact named by `update_location`, relative paths resolved against
    /// the work directory. An empty pointer is not written yet and reads as `None`.
    fn location(&self) -> Result<Option<PathBuf>> {
        let Some(location) = self.read(UPDATE_LOCATION)?.filter(|l| !l.is_empty())
        else {
            return Ok(None);
        };

        let location = PathBuf::from(location);
        Ok(Some(if location.is_relative() {
            self.path.join(location)
        } else {
            location
        }))
    }
}

/// A package announced by the delivery agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateDescriptor {
    pub kind: UpdateKind,
    pub version: Version,
    /// Expected size of the artifact in bytes.
    pub size: u64,
    pub source: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadOutcome {
    NotQueued,
    Started,
    StartedBefore,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressOutcome {
    NoDownloadStarted,
    WaitingToStart,
    InProgress(u8),
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallOutcome {
    NotQueued,
    InProgress,
    Finished,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Successful,
    NothingToApply,
    Failed,
    /// The reboot could not be triggered; carries the OS error number.
    RebootFailed(i32),
}

/// Reboots the device.
pub trait Reboot {
    fn reboot(&self) -> io::Result<()>;
}

impl<T: Reboot + ?Sized> Reboot for &T {
    fn reboot(&self) -> io::Result<()> {
        (**self).reboot()
    }
}

/// [`Reboot`] through an external command, `reboot` by default.
#[derive(Debug, Clone)]
pub struct CommandReboot {
    command: Vec<String>,
}

impl CommandReboot {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }
}

impl Reboot for CommandReboot {
    fn reboot(&self) -> io::Result<()> {
        let Some((program, args)) = self.command.split_first() else {
            return Err(ErrorKind::InvalidInput.into());
        };

        let status = Command::new(program).args(args).status()?;
        if status.success() {
            Ok(())
        } else {
            Err(io::Error::other(format!("`{program}` exited with {status}")))
        }
    }
}

pub struct StagedWorkflow<S, R> {
    work_dir: WorkDir,
    store: S,
    reboot: R,
    poll_attempts: u32,
    poll_interval: Duration,
}

#[bon]
impl<S: BootStateStore, R: Reboot> StagedWorkflow<S, R> {
    #[builder]
    pub fn new(
        work_dir: WorkDir,
        store: S,
        reboot: R,
        #[builder(default = DEFAULT_POLL_ATTEMPTS)] poll_attempts: u32,
        #[builder(default = DEFAULT_POLL_INTERVAL)] poll_interval: Duration,
    ) -> Self {
        Self {
            work_dir,
            store,
            reboot,
            poll_attempts,
            poll_interval,
        }
    }

    pub fn work_dir(&self) -> &WorkDir {
        &self.work_dir
    }

    /// The announced package, `None` unless all descriptor files are present.
    pub fn notice_available(&self) -> Result<Option<UpdateDescriptor>> {
        let (Some(kind), Some(version), Some(size)) = (
            self.work_dir.read(UPDATE_TYPE)?,
            self.work_dir.read(UPDATE_VERSION)?,
            self.work_dir.read(UPDATE_SIZE)?,
        ) else {
            debug!(
                "no complete update descriptor in `{}`",
                self.work_dir.path.display()
            );
            return Ok(None);
        };

        let descriptor = UpdateDescriptor {
            kind: UpdateKind::from_type_str(&kind).ok_or_else(|| {
                Error::InvalidDescriptor(format!("unknown update type `{kind}`"))
            })?,
            version: version.parse().map_err(|_| {
                Error::InvalidDescriptor(format!("invalid update version `{version}`"))
            })?,
            size: size.parse().map_err(|_| {
                Error::InvalidDescriptor(format!("invalid update size `{size}`"))
            })?,
            source: self.work_dir.location()?,
        };
        info!(
            "{} update {} available ({} bytes)",
            descriptor.kind, descriptor.version, descriptor.size
        );

        Ok(Some(descriptor))
    }

    pub fn request_download(&self) -> Result<DownloadOutcome> {
        if self.notice_available()?.is_none() {
            info!("no update available to download");
            return Ok(DownloadOutcome::NotQueued);
        }

        match self.work_dir.create(Marker::Download) {
            Ok(MarkerCreation::Created) => {
                info!("download requested");
                Ok(DownloadOutcome::Started)
            }
            Ok(MarkerCreation::AlreadyPresent) => {
                info!("download was requested before");
                Ok(DownloadOutcome::StartedBefore)
            }
            Err(e) => {
                warn!("failed to request download: {e}");
                Ok(DownloadOutcome::Failed)
            }
        }
    }

    /// Download progress as seen from the size of the artifact on disk.
    ///
    /// The delivery agent writes `update_location` asynchronously, so it is polled
    /// for a bounded number of attempts before reporting
    /// [`ProgressOutcome::WaitingToStart`].
    pub fn progress(&self) -> Result<ProgressOutcome> {
        if !self.work_dir.has(Marker::Download)? {
            return Ok(ProgressOutcome::NoDownloadStarted);
        }

        let Some(descriptor) = self.notice_available()? else {
            warn!("download was requested but the update descriptor is gone");
            return Ok(ProgressOutcome::NoDownloadStarted);
        };
        if descriptor.size == 0 {
            return Err(Error::InvalidDescriptor(
                "expected update size is zero".to_owned(),
            ));
        }

        let Some(artifact) = self.wait_for_location()? else {
            info!("download has not started yet");
            return Ok(ProgressOutcome::WaitingToStart);
        };

        let actual = match fs::metadata(&artifact) {
            Ok(meta) if meta.is_file() => meta.len(),
            Ok(_) => {
                return Err(Error::InvalidDescriptor(format!(
                    "`{}` is not a regular file",
                    artifact.display()
                )));
            }
            Err(e) if e.kind() == ErrorKind::NotFound => 0,
            Err(e) => {
                return Err(Error::io(format!(
                    "failed reading size of `{}`",
                    artifact.display()
                ))(e));
            }
        };

        let percent = actual.saturating_mul(100) / descriptor.size;
        debug!("downloaded {actual} of {} bytes", descriptor.size);

        Ok(match percent {
            0 => ProgressOutcome::NoDownloadStarted,
            1..=99 => ProgressOutcome::InProgress(percent as u8),
            100 => ProgressOutcome::Finished,
            _ => {
                warn!(
                    "artifact `{}` is larger than announced ({actual} > {})",
                    artifact.display(),
                    descriptor.size
                );
                ProgressOutcome::Finished
            }
        })
    }

    fn wait_for_location(&self) -> Result<Option<PathBuf>> {
        let attempts = self.poll_attempts.max(1);
        for attempt in 1..=attempts {
            if let Some(location) = self.work_dir.location()? {
                return Ok(Some(location));
            }
            if attempt < attempts {
                debug!("`{UPDATE_LOCATION}` not there yet ({attempt}/{attempts})");
                thread::sleep(self.poll_interval);
            }
        }

        Ok(None)
    }

    /// Hands the downloaded package to the installer.
    pub fn request_install(&self) -> Result<InstallOutcome> {
        if self.work_dir.location()?.is_none() {
            info!("nothing downloaded to install");
            return Ok(InstallOutcome::NotQueued);
        }
        if self.work_dir.has(Marker::Installed)? {
            info!("update is installed");
            return Ok(InstallOutcome::Finished);
        }

        match self.work_dir.create(Marker::Install) {
            Ok(MarkerCreation::Created) => {
                info!("installation requested");
                Ok(InstallOutcome::InProgress)
            }
            Ok(MarkerCreation::AlreadyPresent) => {
                info!("installation is in progress");
                Ok(InstallOutcome::InProgress)
            }
            Err(e) => {
                warn!("failed to request installation: {e}");
                Ok(InstallOutcome::Failed)
            }
        }
    }

    /// Activates an installed update or a pending rollback.
    ///
    /// A package installed locally (no download and no apply marker) reboots right
    /// away. A package that came over the network only gets the `applyUpdate`
    /// marker, the supervisor decides when to reboot.
    pub fn request_apply(&self) -> Result<ApplyOutcome> {
        if self.work_dir.has(Marker::Rollback)? {
            return self.apply_rollback();
        }

        if !self.work_dir.has(Marker::Installed)? {
            info!("nothing to apply");
            return Ok(ApplyOutcome::NothingToApply);
        }

        if !self.work_dir.has(Marker::Apply)? && !self.work_dir.has(Marker::Download)? {
            info!("local installation, rebooting");
            return Ok(self.trigger_reboot());
        }

        match self.work_dir.create(Marker::Apply) {
            Ok(_) => {
                info!("apply requested, waiting for the supervisor to reboot");
                Ok(ApplyOutcome::Successful)
            }
            Err(e) => {
                warn!("failed to request apply: {e}");
                Ok(ApplyOutcome::Failed)
            }
        }
    }

    fn apply_rollback(&self) -> Result<ApplyOutcome> {
        let prior = self.store.get_reboot_state()?;
        let demoted = prior
            .is_rollback_pending()
            .then(|| prior.kind().map(crate::RebootState::incomplete_rollback))
            .flatten();

        if let Some(next) = demoted {
            self.store.set_reboot_state(next)?;
        }

        let outcome = self.trigger_reboot();
        match outcome {
            ApplyOutcome::RebootFailed(_) if demoted.is_some() => {
                match self.store.set_reboot_state(prior) {
                    Ok(()) => info!("restored reboot state `{prior}`"),
                    Err(e) => error!("failed to restore reboot state `{prior}`: {e}"),
                }
            }
            ApplyOutcome::RebootFailed(_) => (),
            _ => self.work_dir.remove(Marker::Rollback)?,
        }

        Ok(outcome)
    }

    fn trigger_reboot(&self) -> ApplyOutcome {
        match self.reboot.reboot() {
            Ok(()) => ApplyOutcome::Successful,
            Err(e) => {
                error!("failed to reboot: {e}");
                ApplyOutcome::RebootFailed(e.raw_os_error().unwrap_or(libc::EIO))
            }
        }
    }
}
