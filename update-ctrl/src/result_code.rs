//! Stable numeric outcome codes, the process exit status of every action.
//!
//! Calling automation matches on these numbers, so they must never change.

use std::process::{ExitCode, Termination};

use crate::{
    RebootState, UpdateKind,
    controller::{AutomaticGate, CommitOutcome},
    workflow::{ApplyOutcome, DownloadOutcome, InstallOutcome, ProgressOutcome},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResultCode {
    FwUpdateSuccessful = 0,
    FwUpdateProgressError = 1,
    FwUpdateInternalError = 2,
    FwUpdateSystemError = 3,
    FwRollbackSuccessful = 4,
    FwRollbackProgressError = 5,
    FwRollbackInternalError = 6,
    FwRollbackSystemError = 7,
    AppUpdateSuccessful = 8,
    AppUpdateProgressError = 9,
    AppUpdateInternalError = 10,
    AppUpdateSystemError = 11,
    AppRollbackSuccessful = 12,
    AppRollbackProgressError = 13,
    AppRollbackInternalError = 14,
    AppRollbackSystemError = 15,
    BothUpdateSuccessful = 16,
    BothUpdateProgressError = 17,
    BothUpdateInternalError = 18,
    BothUpdateSystemError = 19,
    CommitSuccessful = 20,
    CommitNotNeeded = 21,
    CommitNotAllowedState = 22,
    CommitSystemError = 23,
    FailedAppUpdate = 24,
    FailedFwUpdate = 25,
    FwUpdateRebootFailed = 26,
    IncompleteFwUpdate = 27,
    IncompleteAppUpdate = 28,
    IncompleteBothUpdate = 29,
    FwRebootPending = 30,
    AppRebootPending = 31,
    NoUpdateRebootPending = 32,
    RollbackFwRebootPending = 33,
    RollbackAppRebootPending = 34,
    IncompleteFwRollback = 35,
    IncompleteAppRollback = 36,
    AutomaticFwSuccessful = 37,
    AutomaticFwProgressError = 38,
    AutomaticFwInternalError = 39,
    AutomaticFwSystemError = 40,
    AutomaticAppSuccessful = 41,
    AutomaticAppProgressError = 42,
    AutomaticAppInternalError = 43,
    AutomaticAppSystemError = 44,
    AutomaticBothSuccessful = 45,
    AutomaticBothProgressError = 46,
    AutomaticBothInternalError = 47,
    AutomaticBothSystemError = 48,
    AutomaticAllowed = 49,
    FormerAppUpdateFailed = 50,
    FormerFwUpdateFailed = 51,
    FormerFwRebootFailed = 52,
    NoUpdateAvailable = 53,
    FwUpdateAvailable = 54,
    AppUpdateAvailable = 55,
    BothUpdateAvailable = 56,
    NoDownloadQueued = 57,
    DownloadStarted = 58,
    DownloadStartedBefore = 59,
    NoDownloadStarted = 60,
    DownloadInProgress = 61,
    DownloadFinished = 62,
    NoInstallationQueued = 63,
    InstallationInProgress = 64,
    InstallationFinished = 65,
    InstallationFailed = 66,
    ApplySuccessful = 67,
    ApplyFailed = 68,
    SlotStateSuccessful = 69,
    SlotParamWrong = 70,
    SlotStateBad = 71,
    Unhandled = 124,
}

impl ResultCode {
    pub fn code(self) -> u8 {
        self as u8
    }
}

/// How a failed action is reported. Every error maps to exactly one class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Another update or rollback is in the way.
    Progress,
    /// The action is not legal in the current reboot state.
    NotAllowed,
    /// The engine refused the operation.
    Internal,
    /// I/O or subprocess failure.
    System,
    /// Broken invariant, never mapped to a family code.
    Fatal,
}

/// What an action ended with, before it becomes a number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Report {
    Update {
        kind: UpdateKind,
        result: Result<(), ErrorClass>,
    },
    /// Rollbacks and slot switches share their codes.
    Rollback {
        kind: UpdateKind,
        result: Result<(), ErrorClass>,
    },
    Automatic {
        kind: UpdateKind,
        result: Result<(), ErrorClass>,
    },
    AllowAutomatic(AutomaticGate),
    Commit(Result<CommitOutcome, ErrorClass>),
    RebootState {
        state: RebootState,
        reboot_complete: bool,
    },
    Available(Option<UpdateKind>),
    Download(DownloadOutcome),
    Progress(ProgressOutcome),
    Install(InstallOutcome),
    Apply(ApplyOutcome),
    /// `Ok(true)` when the queried slot is bad.
    SlotHealth(Result<bool, ErrorClass>),
    Unhandled,
}

/// Exit status of the program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    /// Informational commands without a result code.
    Success,
    Code(ResultCode),
    /// OS error number passed through from a failed reboot.
    SystemError(i32),
}

impl Termination for ExitStatus {
    fn report(self) -> ExitCode {
        match self {
            ExitStatus::Success => ExitCode::SUCCESS,
            ExitStatus::Code(code) => ExitCode::from(code.code()),
            ExitStatus::SystemError(errno) => {
                ExitCode::from(u8::try_from(errno).unwrap_or(u8::MAX))
            }
        }
    }
}

impl From<ResultCode> for ExitStatus {
    fn from(code: ResultCode) -> Self {
        ExitStatus::Code(code)
    }
}

/// Maps the outcome of an action to its exit status.
pub fn result_code(report: &Report) -> ExitStatus {
    use ResultCode as C;

    let code = match *report {
        Report::Update { kind, result } => family(
            result,
            match kind {
                UpdateKind::Firmware => [
                    C::FwUpdateSuccessful,
                    C::FwUpdateProgressError,
                    C::FwUpdateInternalError,
                    C::FwUpdateSystemError,
                ],
                UpdateKind::Application => [
                    C::AppUpdateSuccessful,
                    C::AppUpdateProgressError,
                    C::AppUpdateInternalError,
                    C::AppUpdateSystemError,
                ],
                UpdateKind::Combined => [
                    C::BothUpdateSuccessful,
                    C::BothUpdateProgressError,
                    C::BothUpdateInternalError,
                    C::BothUpdateSystemError,
                ],
            },
        ),
        Report::Rollback { kind, result } => family(
            result,
            if kind == UpdateKind::Application {
                [
                    C::AppRollbackSuccessful,
                    C::AppRollbackProgressError,
                    C::AppRollbackInternalError,
                    C::AppRollbackSystemError,
                ]
            } else {
                [
                    C::FwRollbackSuccessful,
                    C::FwRollbackProgressError,
                    C::FwRollbackInternalError,
                    C::FwRollbackSystemError,
                ]
            },
        ),
        Report::Automatic { kind, result } => family(
            result,
            match kind {
                UpdateKind::Firmware => [
                    C::AutomaticFwSuccessful,
                    C::AutomaticFwProgressError,
                    C::AutomaticFwInternalError,
                    C::AutomaticFwSystemError,
                ],
                UpdateKind::Application => [
                    C::AutomaticAppSuccessful,
                    C::AutomaticAppProgressError,
                    C::AutomaticAppInternalError,
                    C::AutomaticAppSystemError,
                ],
                UpdateKind::Combined => [
                    C::AutomaticBothSuccessful,
                    C::AutomaticBothProgressError,
                    C::AutomaticBothInternalError,
                    C::AutomaticBothSystemError,
                ],
            },
        ),
        Report::AllowAutomatic(gate) => match gate {
            AutomaticGate::Allowed => C::AutomaticAllowed,
            AutomaticGate::FormerAppUpdateFailed => C::FormerAppUpdateFailed,
            AutomaticGate::FormerFwUpdateFailed => C::FormerFwUpdateFailed,
            AutomaticGate::FormerFwRebootFailed => C::FormerFwRebootFailed,
            AutomaticGate::RebootPending { includes_firmware } => {
                reboot_pending(includes_firmware)
            }
        },
        Report::Commit(result) => match result {
            Ok(CommitOutcome::Committed) => C::CommitSuccessful,
            Ok(CommitOutcome::NotNeeded) => C::CommitNotNeeded,
            Ok(CommitOutcome::RebootPending { includes_firmware }) => {
                reboot_pending(includes_firmware)
            }
            Err(ErrorClass::NotAllowed) => C::CommitNotAllowedState,
            Err(ErrorClass::Fatal) => C::Unhandled,
            Err(ErrorClass::Progress | ErrorClass::Internal | ErrorClass::System) => {
                C::CommitSystemError
            }
        },
        Report::RebootState {
            state,
            reboot_complete,
        } => match state {
            RebootState::NoPending => C::NoUpdateRebootPending,
            RebootState::FailedApp => C::FailedAppUpdate,
            RebootState::FailedFw => C::FailedFwUpdate,
            RebootState::FwRebootFailed => C::FwUpdateRebootFailed,
            s if s.is_incomplete_update() && !reboot_complete => {
                reboot_pending(s.kind().is_some_and(UpdateKind::includes_firmware))
            }
            RebootState::IncompleteFw => C::IncompleteFwUpdate,
            RebootState::IncompleteApp => C::IncompleteAppUpdate,
            RebootState::IncompleteBoth => C::IncompleteBothUpdate,
            RebootState::RollbackFwPending | RebootState::RollbackBothPending => {
                C::RollbackFwRebootPending
            }
            RebootState::RollbackAppPending => C::RollbackAppRebootPending,
            RebootState::IncompleteFwRollback | RebootState::IncompleteBothRollback => {
                C::IncompleteFwRollback
            }
            RebootState::IncompleteAppRollback => C::IncompleteAppRollback,
        },
        Report::Available(kind) => match kind {
            None => C::NoUpdateAvailable,
            Some(UpdateKind::Firmware) => C::FwUpdateAvailable,
            Some(UpdateKind::Application) => C::AppUpdateAvailable,
            Some(UpdateKind::Combined) => C::BothUpdateAvailable,
        },
        Report::Download(outcome) => match outcome {
            DownloadOutcome::NotQueued | DownloadOutcome::Failed => C::NoDownloadQueued,
            DownloadOutcome::Started => C::DownloadStarted,
            DownloadOutcome::StartedBefore => C::DownloadStartedBefore,
        },
        Report::Progress(outcome) => match outcome {
            ProgressOutcome::NoDownloadStarted | ProgressOutcome::WaitingToStart => {
                C::NoDownloadStarted
            }
            ProgressOutcome::InProgress(_) => C::DownloadInProgress,
            ProgressOutcome::Finished => C::DownloadFinished,
        },
        Report::Install(outcome) => match outcome {
            InstallOutcome::NotQueued => C::NoInstallationQueued,
            InstallOutcome::InProgress => C::InstallationInProgress,
            InstallOutcome::Finished => C::InstallationFinished,
            InstallOutcome::Failed => C::InstallationFailed,
        },
        Report::Apply(outcome) => match outcome {
            ApplyOutcome::Successful => C::ApplySuccessful,
            ApplyOutcome::NothingToApply | ApplyOutcome::Failed => C::ApplyFailed,
            ApplyOutcome::RebootFailed(errno) => return ExitStatus::SystemError(errno),
        },
        Report::SlotHealth(result) => match result {
            Ok(false) => C::SlotStateSuccessful,
            Ok(true) => C::SlotStateBad,
            Err(ErrorClass::NotAllowed) => C::SlotParamWrong,
            Err(_) => C::Unhandled,
        },
        Report::Unhandled => C::Unhandled,
    };

    ExitStatus::Code(code)
}

/// Picks from `[successful, progress, internal, system]`.
fn family(result: Result<(), ErrorClass>, codes: [ResultCode; 4]) -> ResultCode {
    let [successful, progress, internal, system] = codes;
    match result {
        Ok(()) => successful,
        Err(ErrorClass::Progress | ErrorClass::NotAllowed) => progress,
        Err(ErrorClass::Internal) => internal,
        Err(ErrorClass::System) => system,
        Err(ErrorClass::Fatal) => ResultCode::Unhandled,
    }
}

fn reboot_pending(includes_firmware: bool) -> ResultCode {
    if includes_firmware {
        ResultCode::FwRebootPending
    } else {
        ResultCode::AppRebootPending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn code(report: Report) -> u8 {
        match result_code(&report) {
            ExitStatus::Code(code) => code.code(),
            other => panic!("expected a result code, got {other:?}"),
        }
    }

    #[test]
    fn it_maps_update_families() {
        let classes = [
            Ok(()),
            Err(ErrorClass::Progress),
            Err(ErrorClass::Internal),
            Err(ErrorClass::System),
        ];
        let expected = [
            (UpdateKind::Firmware, [0, 1, 2, 3], [4, 5, 6, 7], [37, 38, 39, 40]),
            (
                UpdateKind::Application,
                [8, 9, 10, 11],
                [12, 13, 14, 15],
                [41, 42, 43, 44],
            ),
            (UpdateKind::Combined, [16, 17, 18, 19], [4, 5, 6, 7], [45, 46, 47, 48]),
        ];

        for (kind, update, rollback, automatic) in expected {
            for (i, result) in classes.into_iter().enumerate() {
                assert_eq!(code(Report::Update { kind, result }), update[i]);
                assert_eq!(code(Report::Rollback { kind, result }), rollback[i]);
                assert_eq!(code(Report::Automatic { kind, result }), automatic[i]);
            }
        }
    }

    #[test]
    fn it_reports_disallowed_updates_as_progress_errors() {
        let result = Err(ErrorClass::NotAllowed);
        let kind = UpdateKind::Application;
        assert_eq!(code(Report::Rollback { kind, result }), 13);
    }

    #[test]
    fn it_maps_commit_outcomes() {
        assert_eq!(code(Report::Commit(Ok(CommitOutcome::Committed))), 20);
        assert_eq!(code(Report::Commit(Ok(CommitOutcome::NotNeeded))), 21);
        assert_eq!(code(Report::Commit(Err(ErrorClass::NotAllowed))), 22);
        assert_eq!(code(Report::Commit(Err(ErrorClass::System))), 23);
        assert_eq!(
            code(Report::Commit(Ok(CommitOutcome::RebootPending {
                includes_firmware: true
            }))),
            30
        );
        assert_eq!(
            code(Report::Commit(Ok(CommitOutcome::RebootPending {
                includes_firmware: false
            }))),
            31
        );
    }

    #[test]
    fn it_maps_every_reboot_state() {
        let expected = [
            (RebootState::FailedApp, 24),
            (RebootState::FailedFw, 25),
            (RebootState::FwRebootFailed, 26),
            (RebootState::IncompleteFw, 27),
            (RebootState::IncompleteApp, 28),
            (RebootState::IncompleteBoth, 29),
            (RebootState::NoPending, 32),
            (RebootState::RollbackFwPending, 33),
            (RebootState::RollbackAppPending, 34),
            (RebootState::RollbackBothPending, 33),
            (RebootState::IncompleteFwRollback, 35),
            (RebootState::IncompleteAppRollback, 36),
            (RebootState::IncompleteBothRollback, 35),
        ];
        assert_eq!(expected.len(), RebootState::ALL.len());

        for (state, expected) in expected {
            let report = Report::RebootState {
                state,
                reboot_complete: true,
            };
            assert_eq!(code(report), expected, "{state:?}");
        }
    }

    #[test]
    fn it_reports_unconfirmed_incomplete_updates_as_reboot_pending() {
        let pending = |state| {
            code(Report::RebootState {
                state,
                reboot_complete: false,
            })
        };
        assert_eq!(pending(RebootState::IncompleteFw), 30);
        assert_eq!(pending(RebootState::IncompleteBoth), 30);
        assert_eq!(pending(RebootState::IncompleteApp), 31);
        // rollbacks are not affected
        assert_eq!(pending(RebootState::RollbackAppPending), 34);
    }

    #[test]
    fn it_maps_the_allow_automatic_gate() {
        assert_eq!(code(Report::AllowAutomatic(AutomaticGate::Allowed)), 49);
        assert_eq!(
            code(Report::AllowAutomatic(AutomaticGate::FormerAppUpdateFailed)),
            50
        );
        assert_eq!(
            code(Report::AllowAutomatic(AutomaticGate::FormerFwUpdateFailed)),
            51
        );
        assert_eq!(
            code(Report::AllowAutomatic(AutomaticGate::FormerFwRebootFailed)),
            52
        );
    }

    #[test]
    fn it_maps_staged_workflow_outcomes() {
        assert_eq!(code(Report::Available(None)), 53);
        assert_eq!(code(Report::Available(Some(UpdateKind::Combined))), 56);
        assert_eq!(code(Report::Download(DownloadOutcome::NotQueued)), 57);
        assert_eq!(code(Report::Download(DownloadOutcome::Started)), 58);
        assert_eq!(code(Report::Download(DownloadOutcome::StartedBefore)), 59);
        assert_eq!(code(Report::Progress(ProgressOutcome::WaitingToStart)), 60);
        assert_eq!(code(Report::Progress(ProgressOutcome::InProgress(50))), 61);
        assert_eq!(code(Report::Progress(ProgressOutcome::Finished)), 62);
        assert_eq!(code(Report::Install(InstallOutcome::NotQueued)), 63);
        assert_eq!(code(Report::Install(InstallOutcome::Failed)), 66);
        assert_eq!(code(Report::Apply(ApplyOutcome::Successful)), 67);
        assert_eq!(code(Report::Apply(ApplyOutcome::NothingToApply)), 68);
    }

    #[test]
    fn it_passes_reboot_errors_through() {
        assert_eq!(
            result_code(&Report::Apply(ApplyOutcome::RebootFailed(libc::EPERM))),
            ExitStatus::SystemError(libc::EPERM)
        );
    }

    #[test]
    fn it_maps_slot_health() {
        assert_eq!(code(Report::SlotHealth(Ok(false))), 69);
        assert_eq!(code(Report::SlotHealth(Err(ErrorClass::NotAllowed))), 70);
        assert_eq!(code(Report::SlotHealth(Ok(true))), 71);
        assert_eq!(code(Report::Unhandled), 124);
    }
}
