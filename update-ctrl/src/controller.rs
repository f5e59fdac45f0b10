//! The update state machine.
//!
//! ```text
//! NoPending --update(k)--> Incomplete{k} | Failed{k}
//! NoPending --switch_slot(k)--> Rollback{k}Pending
//! Incomplete{k} --commit, rebooted--> NoPending
//! Incomplete{k} --rollback(k)--> Rollback{k}Pending
//! Rollback{k}Pending --commit, rebooted--> Incomplete{k}Rollback
//! Incomplete{k}Rollback --commit--> NoPending
//! Failed{k} --commit--> NoPending
//! ```

use tracing::{debug, error, info, warn};

use crate::{
    BootStateStore, EngineError, Error, Package, RebootState, Result, Slot,
    UpdateEngine, UpdateKind, Version, WorkDir,
    workflow::{Marker, MarkerCreation},
};

/// Upper bound of commits `allow_automatic_update` forces before giving up.
///
/// The longest chain is `Rollback{k}Pending` → `Incomplete{k}Rollback` →
/// `NoPending`.
pub const MAX_FORCED_COMMITS: usize = 3;

/// Packages of an update, at least one of them set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateRequest {
    pub firmware: Option<Package>,
    pub application: Option<Package>,
}

impl UpdateRequest {
    pub fn firmware(package: Package) -> Self {
        Self {
            firmware: Some(package),
            application: None,
        }
    }

    pub fn application(package: Package) -> Self {
        Self {
            firmware: None,
            application: Some(package),
        }
    }

    pub fn combined(firmware: Package, application: Package) -> Self {
        Self {
            firmware: Some(firmware),
            application: Some(application),
        }
    }

    /// `None` for an empty request.
    pub fn kind(&self) -> Option<UpdateKind> {
        match (&self.firmware, &self.application) {
            (Some(_), Some(_)) => Some(UpdateKind::Combined),
            (Some(_), None) => Some(UpdateKind::Firmware),
            (None, Some(_)) => Some(UpdateKind::Application),
            (None, None) => None,
        }
    }

    fn package(&self, kind: UpdateKind) -> Option<&Package> {
        match kind {
            UpdateKind::Firmware => self.firmware.as_ref(),
            UpdateKind::Application => self.application.as_ref(),
            UpdateKind::Combined => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed,
    NotNeeded,
    /// The device has not rebooted into the update yet; nothing changed.
    RebootPending { includes_firmware: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutomaticOutcome {
    Updated,
    /// Every offered version is already installed.
    UpToDate,
}

/// Whether an automatic update may start, and what blocked it otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutomaticGate {
    Allowed,
    FormerAppUpdateFailed,
    FormerFwUpdateFailed,
    FormerFwRebootFailed,
    RebootPending { includes_firmware: bool },
}

/// Decides which transitions are legal and performs them.
#[derive(Debug)]
pub struct UpdateCtrl<S, E> {
    store: S,
    engine: E,
    work_dir: WorkDir,
}

impl<S: BootStateStore, E: UpdateEngine> UpdateCtrl<S, E> {
    pub fn new(store: S, engine: E, work_dir: WorkDir) -> Self {
        Self {
            store,
            engine,
            work_dir,
        }
    }

    pub fn get_reboot_state(&self) -> Result<RebootState> {
        self.store.get_reboot_state()
    }

    /// Whether the device rebooted since the reboot state was last set.
    pub fn reboot_complete(&self, state: RebootState) -> Result<bool> {
        let includes_firmware = state.kind().is_some_and(UpdateKind::includes_firmware);
        self.store.is_reboot_complete(includes_firmware)
    }

    /// Writes the requested packages into the inactive slots, firmware first.
    pub fn request_update(&self, request: &UpdateRequest) -> Result<()> {
        let kind = request.kind().ok_or_else(|| {
            Error::InvalidParameter("no package given".to_owned())
        })?;

        let state = self.store.get_reboot_state()?;
        if !state.is_no_pending() {
            warn!("refusing {kind} update in reboot state `{state}`");
            return Err(Error::UpdateInProgress(state));
        }

        let parts = kind.parts();
        for (i, part) in parts.iter().enumerate() {
            let Some(package) = request.package(*part) else {
                continue;
            };
            if let Err(e) = self.engine.apply(*part, package) {
                return Err(self.engine_failure(*part, parts[..i].last().copied(), e));
            }
        }

        self.store.set_reboot_state(RebootState::incomplete(kind))?;
        info!("{kind} update written, reboot to activate it");
        Ok(())
    }

    /// Records what a failing `kind` part left behind: `Failed{kind}` when the
    /// engine rejected it, `Incomplete{written}` when an earlier part was already
    /// written. Not being able to record it wins over the engine error.
    fn engine_failure(
        &self,
        kind: UpdateKind,
        written: Option<UpdateKind>,
        err: EngineError,
    ) -> Error {
        let state = match (&err, written) {
            (EngineError::Rejected { .. }, _) => RebootState::failed(kind),
            (_, Some(written)) => {
                warn!("{kind} update failed after writing {written}");
                RebootState::incomplete(written)
            }
            (_, None) => return err.into(),
        };

        match self.store.set_reboot_state(state) {
            Ok(()) => err.into(),
            Err(e) => {
                error!("{kind} update failed: {err}");
                error!("failed to record `{state}`: {e}");
                e
            }
        }
    }

    /// Updates only when an offered version is newer than the installed one.
    pub fn automatic_update(
        &self,
        request: &UpdateRequest,
    ) -> Result<AutomaticOutcome> {
        let mut newer = false;
        for (kind, package) in [
            (UpdateKind::Firmware, &request.firmware),
            (UpdateKind::Application, &request.application),
        ] {
            let Some(package) = package else { continue };
            let Some(offered) = package.version else {
                newer = true;
                continue;
            };
            let installed = self.engine.get_version(kind)?;
            debug!("{kind}: installed {installed}, offered {offered}");
            newer |= offered > installed;
        }

        if !newer {
            info!("installed versions are up to date");
            return Ok(AutomaticOutcome::UpToDate);
        }

        self.request_update(request)?;
        Ok(AutomaticOutcome::Updated)
    }

    /// Resolves every earlier update or rollback before an automatic update.
    pub fn allow_automatic_update(&self) -> Result<AutomaticGate> {
        for _ in 0..MAX_FORCED_COMMITS {
            let state = self.store.get_reboot_state()?;
            if state.is_no_pending() {
                return Ok(AutomaticGate::Allowed);
            }

            info!("forcing commit of `{state}` before automatic update");
            match self.commit_update()? {
                CommitOutcome::Committed => (),
                CommitOutcome::NotNeeded => {
                    return Err(Error::ContractViolation(format!(
                        "commit reported not needed in reboot state `{state}`"
                    )));
                }
                CommitOutcome::RebootPending { includes_firmware } => {
                    return Ok(AutomaticGate::RebootPending { includes_firmware });
                }
            }

            match state {
                RebootState::FailedApp => {
                    return Ok(AutomaticGate::FormerAppUpdateFailed);
                }
                RebootState::FailedFw => {
                    return Ok(AutomaticGate::FormerFwUpdateFailed);
                }
                RebootState::FwRebootFailed => {
                    return Ok(AutomaticGate::FormerFwRebootFailed);
                }
                _ => (),
            }
        }

        if self.store.get_reboot_state()?.is_no_pending() {
            return Ok(AutomaticGate::Allowed);
        }

        Err(Error::ContractViolation(format!(
            "no resolved reboot state after {MAX_FORCED_COMMITS} forced commits"
        )))
    }

    pub fn commit_update(&self) -> Result<CommitOutcome> {
        let state = self.store.get_reboot_state()?;

        let next = match state {
            RebootState::NoPending => {
                debug!("nothing to commit");
                return Ok(CommitOutcome::NotNeeded);
            }
            s if s.is_incomplete_update() || s.is_rollback_pending() => {
                if !self.reboot_complete(s)? {
                    let includes_firmware =
                        s.kind().is_some_and(UpdateKind::includes_firmware);
                    info!("not committing `{s}`, the device has not rebooted yet");
                    return Ok(CommitOutcome::RebootPending { includes_firmware });
                }
                match s.kind() {
                    Some(kind) if s.is_rollback_pending() => {
                        RebootState::incomplete_rollback(kind)
                    }
                    _ => RebootState::NoPending,
                }
            }
            _ => RebootState::NoPending,
        };

        if next.is_no_pending() {
            self.work_dir.clear_workflow()?;
        }
        self.store.set_reboot_state(next)?;
        info!("committed `{state}`, now `{next}`");

        Ok(CommitOutcome::Committed)
    }

    /// Returns to the previous slot of an update that was not committed yet.
    pub fn rollback(&self, kind: UpdateKind) -> Result<()> {
        let state = self.store.get_reboot_state()?;
        if state != RebootState::incomplete(kind) {
            warn!("refusing {kind} rollback in reboot state `{state}`");
            return Err(Error::NotAllowedUpdateState(state));
        }

        self.switch_to_other_slot(kind)
    }

    /// Boots the other slot of a committed system.
    pub fn switch_slot(&self, kind: UpdateKind) -> Result<()> {
        let state = self.store.get_reboot_state()?;
        if !state.is_no_pending() {
            warn!("refusing {kind} slot switch in reboot state `{state}`");
            return Err(Error::NotAllowedUpdateState(state));
        }

        self.switch_to_other_slot(kind)
    }

    fn switch_to_other_slot(&self, kind: UpdateKind) -> Result<()> {
        let parts = kind.parts();
        for (i, part) in parts.iter().enumerate() {
            if let Err(e) = self.engine.rollback(*part) {
                if let Some(&switched) = parts[..i].last() {
                    error!("{part} slot switch failed after switching {switched}: {e}");
                    self.mark_switched(switched)?;
                }
                return Err(e.into());
            }
        }

        self.mark_switched(kind)
    }

    fn mark_switched(&self, kind: UpdateKind) -> Result<()> {
        // State before marker: the marker never exists without its pending state.
        self.store.set_reboot_state(RebootState::rollback_pending(kind))?;
        match self.work_dir.create(Marker::Rollback) {
            Ok(MarkerCreation::Created) => (),
            Ok(MarkerCreation::AlreadyPresent) => {
                warn!("`{}` already present", Marker::Rollback.file_name());
            }
            Err(e) => {
                return Err(Error::io(format!(
                    "failed creating `{}`",
                    Marker::Rollback.file_name()
                ))(e));
            }
        }
        info!("{kind} switched to the other slot, reboot to activate it");

        Ok(())
    }

    pub fn get_version(&self, kind: UpdateKind) -> Result<Version> {
        Ok(self.engine.get_version(kind)?)
    }

    pub fn mark_slot_bad(&self, kind: UpdateKind, slot: Slot) -> Result<()> {
        self.store.mark_slot_bad(kind, slot)
    }

    pub fn is_slot_bad(&self, kind: UpdateKind, slot: Slot) -> Result<bool> {
        self.store.is_slot_bad(kind, slot)
    }
}
