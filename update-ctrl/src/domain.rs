use std::{fmt, num::ParseIntError, str::FromStr};

use derive_more::Display;
use serde::{Deserialize, Serialize};

use crate::Error;

/// What an update, rollback or slot switch acts on.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum UpdateKind {
    #[display("firmware")]
    #[value(alias = "fw")]
    Firmware,
    #[display("application")]
    #[value(alias = "app")]
    Application,
    #[display("firmware and application")]
    #[value(aliases = ["common", "both"])]
    Combined,
}

impl UpdateKind {
    #[must_use]
    pub fn includes_firmware(self) -> bool {
        matches!(self, Self::Firmware | Self::Combined)
    }

    /// The single-image kinds making up this kind, firmware first.
    pub fn parts(self) -> &'static [UpdateKind] {
        match self {
            Self::Firmware => &[Self::Firmware],
            Self::Application => &[Self::Application],
            Self::Combined => &[Self::Firmware, Self::Application],
        }
    }

    /// Parses the content of an `update_type` descriptor file.
    pub fn from_type_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "firmware" | "fw" => Some(Self::Firmware),
            "application" | "app" => Some(Self::Application),
            "common" | "combined" | "both" => Some(Self::Combined),
            _ => None,
        }
    }
}

// Discriminants as stored in the bootloader environment.
const NO_PENDING: u8 = 0;
const INCOMPLETE_FW: u8 = 1;
const INCOMPLETE_APP: u8 = 2;
const INCOMPLETE_BOTH: u8 = 3;
const FAILED_FW: u8 = 4;
const FAILED_APP: u8 = 5;
const FW_REBOOT_FAILED: u8 = 6;
const ROLLBACK_FW_PENDING: u8 = 7;
const ROLLBACK_APP_PENDING: u8 = 8;
const ROLLBACK_BOTH_PENDING: u8 = 9;
const INCOMPLETE_FW_ROLLBACK: u8 = 10;
const INCOMPLETE_APP_ROLLBACK: u8 = 11;
const INCOMPLETE_BOTH_ROLLBACK: u8 = 12;

/// Outcome of the most recent update or rollback, persisted across reboots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[repr(u8)]
pub enum RebootState {
    #[display("No update pending")]
    NoPending = NO_PENDING,
    #[display("Incomplete firmware update")]
    IncompleteFw = INCOMPLETE_FW,
    #[display("Incomplete application update")]
    IncompleteApp = INCOMPLETE_APP,
    #[display("Incomplete application and firmware update")]
    IncompleteBoth = INCOMPLETE_BOTH,
    #[display("Firmware update failed")]
    FailedFw = FAILED_FW,
    #[display("Application update failed")]
    FailedApp = FAILED_APP,
    #[display("Firmware reboot update failed")]
    FwRebootFailed = FW_REBOOT_FAILED,
    #[display("Firmware rollback reboot pending")]
    RollbackFwPending = ROLLBACK_FW_PENDING,
    #[display("Application rollback reboot pending")]
    RollbackAppPending = ROLLBACK_APP_PENDING,
    #[display("Application and firmware rollback reboot pending")]
    RollbackBothPending = ROLLBACK_BOTH_PENDING,
    #[display("Incomplete firmware rollback")]
    IncompleteFwRollback = INCOMPLETE_FW_ROLLBACK,
    #[display("Incomplete application rollback")]
    IncompleteAppRollback = INCOMPLETE_APP_ROLLBACK,
    #[display("Incomplete application and firmware rollback")]
    IncompleteBothRollback = INCOMPLETE_BOTH_ROLLBACK,
}

impl RebootState {
    pub const ALL: [RebootState; 13] = [
        Self::NoPending,
        Self::IncompleteFw,
        Self::IncompleteApp,
        Self::IncompleteBoth,
        Self::FailedFw,
        Self::FailedApp,
        Self::FwRebootFailed,
        Self::RollbackFwPending,
        Self::RollbackAppPending,
        Self::RollbackBothPending,
        Self::IncompleteFwRollback,
        Self::IncompleteAppRollback,
        Self::IncompleteBothRollback,
    ];

    /// The update of `kind` was written and awaits reboot confirmation.
    pub fn incomplete(kind: UpdateKind) -> Self {
        match kind {
            UpdateKind::Firmware => Self::IncompleteFw,
            UpdateKind::Application => Self::IncompleteApp,
            UpdateKind::Combined => Self::IncompleteBoth,
        }
    }

    /// There is no combined failure state; a failed firmware part dominates.
    pub fn failed(kind: UpdateKind) -> Self {
        match kind {
            UpdateKind::Application => Self::FailedApp,
            UpdateKind::Firmware | UpdateKind::Combined => Self::FailedFw,
        }
    }

    pub fn rollback_pending(kind: UpdateKind) -> Self {
        match kind {
            UpdateKind::Firmware => Self::RollbackFwPending,
            UpdateKind::Application => Self::RollbackAppPending,
            UpdateKind::Combined => Self::RollbackBothPending,
        }
    }

    pub fn incomplete_rollback(kind: UpdateKind) -> Self {
        match kind {
            UpdateKind::Firmware => Self::IncompleteFwRollback,
            UpdateKind::Application => Self::IncompleteAppRollback,
            UpdateKind::Combined => Self::IncompleteBothRollback,
        }
    }

    /// The kind of images this state is about, `None` for [`RebootState::NoPending`].
    pub fn kind(self) -> Option<UpdateKind> {
        match self {
            Self::NoPending => None,
            Self::IncompleteFw
            | Self::FailedFw
            | Self::FwRebootFailed
            | Self::RollbackFwPending
            | Self::IncompleteFwRollback => Some(UpdateKind::Firmware),
            Self::IncompleteApp
            | Self::FailedApp
            | Self::RollbackAppPending
            | Self::IncompleteAppRollback => Some(UpdateKind::Application),
            Self::IncompleteBoth
            | Self::RollbackBothPending
            | Self::IncompleteBothRollback => Some(UpdateKind::Combined),
        }
    }

    #[must_use]
    pub fn is_no_pending(self) -> bool {
        matches!(self, Self::NoPending)
    }

    /// An update was written and has not been committed yet.
    #[must_use]
    pub fn is_incomplete_update(self) -> bool {
        matches!(
            self,
            Self::IncompleteFw | Self::IncompleteApp | Self::IncompleteBoth
        )
    }

    #[must_use]
    pub fn is_failed(self) -> bool {
        matches!(self, Self::FailedFw | Self::FailedApp | Self::FwRebootFailed)
    }

    #[must_use]
    pub fn is_rollback_pending(self) -> bool {
        matches!(
            self,
            Self::RollbackFwPending
                | Self::RollbackAppPending
                | Self::RollbackBothPending
        )
    }

    #[must_use]
    pub fn is_incomplete_rollback(self) -> bool {
        matches!(
            self,
            Self::IncompleteFwRollback
                | Self::IncompleteAppRollback
                | Self::IncompleteBothRollback
        )
    }

    /// Value stored in the bootloader environment.
    pub fn to_env_value(self) -> String {
        (self as u8).to_string()
    }

    pub fn from_env_value(value: &str) -> Result<Self, Error> {
        let unknown = || Error::UnknownRebootState(value.to_owned());
        let raw: u8 = value.trim().parse().map_err(|_| unknown())?;

        Self::ALL
            .into_iter()
            .find(|state| *state as u8 == raw)
            .ok_or_else(unknown)
    }
}

/// One of the two redundant slots of an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum Slot {
    #[display("A")]
    A,
    #[display("B")]
    B,
}

impl FromStr for Slot {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            // Slot A alias.
            "a" | "0" => Ok(Slot::A),
            // Slot B alias.
            "b" | "1" => Ok(Slot::B),
            _ => Err(Error::InvalidParameter(format!(
                "invalid slot `{s}`, please use either A/a/0 or B/b/1"
            ))),
        }
    }
}

/// Version of an installed or offered image.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Version(pub u64);

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Version {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(Version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_round_trips_every_state_through_the_env_value() {
        for state in RebootState::ALL {
            let value = state.to_env_value();
            assert_eq!(RebootState::from_env_value(&value).unwrap(), state);
        }
    }

    #[test]
    fn it_rejects_unknown_env_values() {
        for value in ["13", "255", "-1", "", "pending"] {
            assert!(
                matches!(
                    RebootState::from_env_value(value),
                    Err(Error::UnknownRebootState(_))
                ),
                "`{value}` should not parse"
            );
        }
    }

    #[test]
    fn it_classifies_every_state_exactly_once() {
        for state in RebootState::ALL {
            let classes = [
                state.is_no_pending(),
                state.is_incomplete_update(),
                state.is_failed(),
                state.is_rollback_pending(),
                state.is_incomplete_rollback(),
            ];
            assert_eq!(
                classes.iter().filter(|c| **c).count(),
                1,
                "{state:?} is in {classes:?}"
            );
        }
    }

    #[test]
    fn it_maps_kinds_to_states() {
        for kind in [
            UpdateKind::Firmware,
            UpdateKind::Application,
            UpdateKind::Combined,
        ] {
            assert_eq!(RebootState::incomplete(kind).kind(), Some(kind));
            assert_eq!(RebootState::rollback_pending(kind).kind(), Some(kind));
            assert_eq!(RebootState::incomplete_rollback(kind).kind(), Some(kind));
        }
        assert_eq!(
            RebootState::failed(UpdateKind::Combined),
            RebootState::FailedFw
        );
        assert_eq!(RebootState::NoPending.kind(), None);
    }

    #[test]
    fn it_parses_update_types() {
        assert_eq!(UpdateKind::from_type_str("firmware\n"), Some(UpdateKind::Firmware));
        assert_eq!(UpdateKind::from_type_str("APP"), Some(UpdateKind::Application));
        assert_eq!(UpdateKind::from_type_str("common"), Some(UpdateKind::Combined));
        assert_eq!(UpdateKind::from_type_str("kernel"), None);
    }

    #[test]
    fn it_parses_slots() {
        assert_eq!("a".parse::<Slot>().unwrap(), Slot::A);
        assert_eq!("B".parse::<Slot>().unwrap(), Slot::B);
        assert_eq!("1".parse::<Slot>().unwrap(), Slot::B);
        assert!("X".parse::<Slot>().is_err());
    }
}
