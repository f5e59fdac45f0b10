//! Persisted reboot state.
//!
//! * `update_reboot_state` - the [`RebootState`] discriminant
//! * `update_boot_id` - kernel boot id at the time of the last state change
//! * `BOOT_{A,B}_LEFT` / `APP_{A,B}_LEFT` - remaining boot attempts per slot, `0`
//!   marks the slot bad

use std::{
    fs,
    path::{Path, PathBuf},
};

use tracing::{debug, info};
use uboot_env::UBootEnv;

use crate::{Error, RebootState, Result, Slot, UpdateKind};

pub const REBOOT_STATE_VAR: &str = "update_reboot_state";
pub const BOOT_ID_VAR: &str = "update_boot_id";
pub const DEFAULT_BOOT_ID_PATH: &str = "/proc/sys/kernel/random/boot_id";

const SLOT_BAD: &str = "0";

/// Storage of the reboot state. Implementations persist across power loss.
pub trait BootStateStore {
    fn get_reboot_state(&self) -> Result<RebootState>;

    fn set_reboot_state(&self, state: RebootState) -> Result<()>;

    /// Whether the device rebooted since the reboot state was last set.
    fn is_reboot_complete(&self, includes_firmware: bool) -> Result<bool>;

    fn mark_slot_bad(&self, kind: UpdateKind, slot: Slot) -> Result<()>;

    fn is_slot_bad(&self, kind: UpdateKind, slot: Slot) -> Result<bool>;
}

impl<T: BootStateStore + ?Sized> BootStateStore for &T {
    fn get_reboot_state(&self) -> Result<RebootState> {
        (**self).get_reboot_state()
    }

    fn set_reboot_state(&self, state: RebootState) -> Result<()> {
        (**self).set_reboot_state(state)
    }

    fn is_reboot_complete(&self, includes_firmware: bool) -> Result<bool> {
        (**self).is_reboot_complete(includes_firmware)
    }

    fn mark_slot_bad(&self, kind: UpdateKind, slot: Slot) -> Result<()> {
        (**self).mark_slot_bad(kind, slot)
    }

    fn is_slot_bad(&self, kind: UpdateKind, slot: Slot) -> Result<bool> {
        (**self).is_slot_bad(kind, slot)
    }
}

/// [`BootStateStore`] in the U-Boot environment.
#[derive(Debug, Clone)]
pub struct UBootStateStore {
    env: UBootEnv,
    boot_id_path: PathBuf,
}

impl UBootStateStore {
    pub fn new(env: UBootEnv, boot_id_path: impl Into<PathBuf>) -> Self {
        Self {
            env,
            boot_id_path: boot_id_path.into(),
        }
    }

    fn current_boot_id(&self) -> Result<String> {
        read_boot_id(&self.boot_id_path)
    }
}

fn read_boot_id(path: &Path) -> Result<String> {
    fs::read_to_string(path)
        .map(|id| id.trim().to_owned())
        .map_err(Error::io(format!(
            "failed reading boot id from `{}`",
            path.display()
        )))
}

fn slot_var(kind: UpdateKind, slot: Slot) -> Result<String> {
    let prefix = match kind {
        UpdateKind::Firmware => "BOOT",
        UpdateKind::Application => "APP",
        UpdateKind::Combined => {
            return Err(Error::InvalidParameter(
                "slot health is tracked per firmware or application".to_owned(),
            ));
        }
    };

    Ok(format!("{prefix}_{slot}_LEFT"))
}

impl BootStateStore for UBootStateStore {
    fn get_reboot_state(&self) -> Result<RebootState> {
        match self.env.get_var(REBOOT_STATE_VAR)?.read()? {
            Some(value) => RebootState::from_env_value(&value),
            None => Ok(RebootState::NoPending),
        }
    }

    fn set_reboot_state(&self, state: RebootState) -> Result<()> {
        // The boot id goes first: a state paired with the boot id of an older boot
        // would count as rebooted right away.
        let boot_id = self.current_boot_id()?;
        self.env.get_var(BOOT_ID_VAR)?.write(&boot_id)?;
        self.env
            .get_var(REBOOT_STATE_VAR)?
            .write(&state.to_env_value())?;
        info!("reboot state set to `{state}`");
        Ok(())
    }

    fn is_reboot_complete(&self, includes_firmware: bool) -> Result<bool> {
        let Some(recorded) = self.env.get_var(BOOT_ID_VAR)?.read()? else {
            debug!("no boot id recorded with the reboot state; assuming rebooted");
            return Ok(true);
        };
        let current = self.current_boot_id()?;
        debug!(
            includes_firmware,
            "recorded boot id {recorded}, current boot id {current}"
        );

        Ok(recorded.trim() != current)
    }

    fn mark_slot_bad(&self, kind: UpdateKind, slot: Slot) -> Result<()> {
        let var = slot_var(kind, slot)?;
        self.env.get_var(&var)?.write(SLOT_BAD)?;
        info!("marked {kind} slot {slot} as bad");
        Ok(())
    }

    fn is_slot_bad(&self, kind: UpdateKind, slot: Slot) -> Result<bool> {
        let var = slot_var(kind, slot)?;
        let value = self.env.get_var(&var)?.read()?;
        Ok(value.as_deref().map(str::trim) == Some(SLOT_BAD))
    }
}
