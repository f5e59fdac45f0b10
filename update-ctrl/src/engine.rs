//! The update engine writes images into the inactive slot and switches slots.
//!
//! [`CommandEngine`] drives external tools (RAUC by default) so the device specific
//! parts stay in configuration.

use std::{
    fs, io,
    path::{Path, PathBuf},
    process::{Command, Output},
};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{UpdateKind, Version};

#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    #[error("the update engine is busy with another update")]
    InProgress,
    #[error("update engine rejected the {kind} operation with code {code}: {detail}")]
    Rejected {
        kind: UpdateKind,
        code: i32,
        detail: String,
    },
    #[error("{context}: {source}")]
    System {
        context: String,
        #[source]
        source: io::Error,
    },
}

/// An image to hand to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Package {
    pub path: PathBuf,
    /// Only known for automatic updates.
    pub version: Option<Version>,
}

impl Package {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            version: None,
        }
    }

    pub fn with_version(path: impl Into<PathBuf>, version: Version) -> Self {
        Self {
            path: path.into(),
            version: Some(version),
        }
    }
}

/// Writes and rolls back images.
///
/// `kind` is always [`UpdateKind::Firmware`] or [`UpdateKind::Application`]; combined
/// operations are split by the caller.
pub trait UpdateEngine {
    fn apply(&self, kind: UpdateKind, package: &Package) -> Result<(), EngineError>;

    fn rollback(&self, kind: UpdateKind) -> Result<(), EngineError>;

    fn get_version(&self, kind: UpdateKind) -> Result<Version, EngineError>;
}

impl<T: UpdateEngine + ?Sized> UpdateEngine for &T {
    fn apply(&self, kind: UpdateKind, package: &Package) -> Result<(), EngineError> {
        (**self).apply(kind, package)
    }

    fn rollback(&self, kind: UpdateKind) -> Result<(), EngineError> {
        (**self).rollback(kind)
    }

    fn get_version(&self, kind: UpdateKind) -> Result<Version, EngineError> {
        (**self).get_version(kind)
    }
}

/// External commands handling one kind of image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineCommands {
    /// Installs the package given as last argument into the inactive slot.
    pub install: Vec<String>,
    /// Makes the previously active slot the boot slot again.
    pub rollback: Vec<String>,
    /// File holding the installed version as a decimal number.
    pub version_file: PathBuf,
}

impl EngineCommands {
    pub fn firmware_defaults() -> Self {
        Self {
            install: vec!["rauc".into(), "install".into()],
            rollback: vec![
                "rauc".into(),
                "status".into(),
                "mark-active".into(),
                "other".into(),
            ],
            version_file: "/etc/fw_version".into(),
        }
    }

    pub fn application_defaults() -> Self {
        Self {
            install: vec!["rauc".into(), "install".into()],
            rollback: vec![
                "rauc".into(),
                "status".into(),
                "mark-active".into(),
                "other".into(),
            ],
            version_file: "/etc/app_version".into(),
        }
    }
}

/// [`UpdateEngine`] running configured external commands.
#[derive(Debug, Clone)]
pub struct CommandEngine {
    firmware: EngineCommands,
    application: EngineCommands,
}

impl CommandEngine {
    pub fn new(firmware: EngineCommands, application: EngineCommands) -> Self {
        Self {
            firmware,
            application,
        }
    }

    fn commands(&self, kind: UpdateKind) -> &EngineCommands {
        match kind {
            UpdateKind::Application => &self.application,
            UpdateKind::Firmware | UpdateKind::Combined => &self.firmware,
        }
    }

    fn run(
        &self,
        kind: UpdateKind,
        command: &[String],
        extra_arg: Option<&Path>,
    ) -> Result<(), EngineError> {
        let Some((program, args)) = command.split_first() else {
            return Err(EngineError::System {
                context: format!("no {kind} command configured"),
                source: io::ErrorKind::InvalidInput.into(),
            });
        };

        let mut cmd = Command::new(program);
        cmd.args(args);
        if let Some(arg) = extra_arg {
            cmd.arg(arg);
        }
        debug!("running {cmd:?}");

        let output = cmd.output().map_err(|source| EngineError::System {
            context: format!("failed to run `{program}`"),
            source,
        })?;

        classify_output(kind, &output)
    }
}

fn classify_output(kind: UpdateKind, output: &Output) -> Result<(), EngineError> {
    if output.status.success() {
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    let stdout = String::from_utf8_lossy(&output.stdout);
    let detail = if stderr.trim().is_empty() {
        stdout.trim()
    } else {
        stderr.trim()
    };

    if detail.to_lowercase().contains("in progress") {
        return Err(EngineError::InProgress);
    }

    Err(EngineError::Rejected {
        kind,
        code: output.status.code().unwrap_or(-1),
        detail: detail.to_owned(),
    })
}

impl UpdateEngine for CommandEngine {
    fn apply(&self, kind: UpdateKind, package: &Package) -> Result<(), EngineError> {
        info!("installing {kind} package `{}`", package.path.display());
        self.run(kind, &self.commands(kind).install, Some(&package.path))
    }

    fn rollback(&self, kind: UpdateKind) -> Result<(), EngineError> {
        info!("switching {kind} to the other slot");
        self.run(kind, &self.commands(kind).rollback, None)
    }

    fn get_version(&self, kind: UpdateKind) -> Result<Version, EngineError> {
        let path = &self.commands(kind).version_file;
        let contents = fs::read_to_string(path).map_err(|source| EngineError::System {
            context: format!("failed reading {kind} version from `{}`", path.display()),
            source,
        })?;

        contents.parse().map_err(|e| EngineError::System {
            context: format!("invalid {kind} version `{}`", contents.trim()),
            source: io::Error::new(io::ErrorKind::InvalidData, e),
        })
    }
}
