//! Lifecycle control for A/B firmware and application updates.
//!
//! The reboot state persisted in the bootloader environment records the outcome of
//! the last update or rollback. [`UpdateCtrl`] decides which transitions are legal
//! from it and drives the [`UpdateEngine`], while [`StagedWorkflow`] coordinates the
//! download/install/apply stages of a package with external agents through marker
//! files in a work directory. Every action ends in a stable numeric code, see
//! [`result_code`].

#![allow(clippy::missing_errors_doc)]

use std::io;

mod domain;

pub mod boot_state;
pub mod console;
pub mod controller;
pub mod engine;
pub mod logging;
pub mod program;
pub mod result_code;
pub mod settings;
pub mod test_utils;
pub mod workflow;

pub use boot_state::{BootStateStore, UBootStateStore};
pub use controller::{UpdateCtrl, UpdateRequest};
pub use domain::{RebootState, Slot, UpdateKind, Version};
pub use engine::{EngineError, Package, UpdateEngine};
pub use result_code::{ErrorClass, ExitStatus, ResultCode};
pub use workflow::{StagedWorkflow, WorkDir};

/// Error definition for library.
#[allow(missing_docs)]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("an update or rollback is already in progress (reboot state: {0})")]
    UpdateInProgress(RebootState),
    #[error("action not allowed in reboot state: {0}")]
    NotAllowedUpdateState(RebootState),
    #[error("unrecognized reboot state `{0}` in bootloader environment")]
    UnknownRebootState(String),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("bootloader environment: {0}")]
    BootEnv(#[from] uboot_env::Error),
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
    #[error("invalid update descriptor: {0}")]
    InvalidDescriptor(String),
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("contract violation: {0}")]
    ContractViolation(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn io(context: impl Into<String>) -> impl FnOnce(io::Error) -> Error {
        let context = context.into();
        move |source| Error::Io { context, source }
    }

    /// Which of the error classes this error belongs to. Result codes are chosen by
    /// class, never by the individual error.
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::UpdateInProgress(_) | Error::Engine(EngineError::InProgress) => {
                ErrorClass::Progress
            }
            Error::NotAllowedUpdateState(_)
            | Error::UnknownRebootState(_)
            | Error::InvalidParameter(_) => ErrorClass::NotAllowed,
            Error::Engine(EngineError::Rejected { .. })
            | Error::InvalidDescriptor(_) => ErrorClass::Internal,
            Error::Engine(EngineError::System { .. })
            | Error::BootEnv(_)
            | Error::Io { .. } => ErrorClass::System,
            Error::ContractViolation(_) => ErrorClass::Fatal,
        }
    }

    /// The OS error number behind this error, if there is one.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Error::Io { source, .. } => source.raw_os_error(),
            Error::Engine(EngineError::System { source, .. }) => source.raw_os_error(),
            Error::BootEnv(e) => e.raw_os_error(),
            _ => None,
        }
    }
}
