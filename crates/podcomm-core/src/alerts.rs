//! Alert slots, alert configuration, and confirmation beep types.
//!
//! The pod has eight alert slots. Each slot is armed with a trigger (a time
//! since activation, or a reservoir level) and an optional repeating beep.
//! The controller mirrors the configured set in [`PodState`] and tracks which
//! slots the pod currently reports active.
//!
//! [`PodState`]: crate::pod_state::PodState

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::units::Units;

/// One of the pod's eight alert slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum AlertSlot {
    Slot0,
    Slot1,
    Slot2,
    Slot3,
    Slot4,
    Slot5,
    Slot6,
    Slot7,
}

impl AlertSlot {
    /// All slots in index order.
    pub const ALL: [Self; 8] = [
        Self::Slot0,
        Self::Slot1,
        Self::Slot2,
        Self::Slot3,
        Self::Slot4,
        Self::Slot5,
        Self::Slot6,
        Self::Slot7,
    ];

    /// Slot for the given index, if it is in range.
    #[must_use]
    pub fn from_index(index: u8) -> Option<Self> {
        Self::ALL.get(usize::from(index)).copied()
    }

    /// Index of this slot (0..=7).
    #[must_use]
    pub fn index(self) -> u8 {
        self as u8
    }
}

/// A set of alert slots, as reported in status responses.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct AlertSet(u8);

impl AlertSet {
    /// The empty set.
    pub const EMPTY: Self = Self(0);

    /// Build a set from a raw bitmask (bit n = slot n).
    #[must_use]
    pub const fn from_raw(raw: u8) -> Self {
        Self(raw)
    }

    /// Raw bitmask value.
    #[must_use]
    pub const fn raw(self) -> u8 {
        self.0
    }

    /// Returns `true` if no slot is set.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Returns `true` if `slot` is in the set.
    #[must_use]
    pub fn contains(self, slot: AlertSlot) -> bool {
        self.0 & (1 << slot.index()) != 0
    }

    /// Add `slot` to the set.
    pub fn insert(&mut self, slot: AlertSlot) {
        self.0 |= 1 << slot.index();
    }

    /// Iterate the slots in the set, lowest index first.
    pub fn iter(self) -> impl Iterator<Item = AlertSlot> {
        AlertSlot::ALL.into_iter().filter(move |s| self.contains(*s))
    }
}

impl FromIterator<AlertSlot> for AlertSet {
    fn from_iter<I: IntoIterator<Item = AlertSlot>>(iter: I) -> Self {
        let mut set = Self::EMPTY;
        for slot in iter {
            set.insert(slot);
        }
        set
    }
}

/// Beep patterns the pod can emit to confirm a command or mark an alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BeepType {
    /// Silent.
    NoBeep,
    /// Four short beeps.
    BeepBeepBeepBeep,
    /// Alternating bip/beep, four times.
    BipBeepFourTimes,
    /// Two bips.
    BipBip,
    /// A single beep.
    Beep,
    /// Three short beeps.
    BeepBeepBeep,
    /// One long beep.
    Beeeeeep,
}

impl BeepType {
    /// Wire value.
    #[must_use]
    pub fn raw(self) -> u8 {
        match self {
            Self::NoBeep => 0,
            Self::BeepBeepBeepBeep => 1,
            Self::BipBeepFourTimes => 2,
            Self::BipBip => 3,
            Self::Beep => 4,
            Self::BeepBeepBeep => 5,
            Self::Beeeeeep => 6,
        }
    }

    /// Decode a wire value.
    #[must_use]
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::NoBeep),
            1 => Some(Self::BeepBeepBeepBeep),
            2 => Some(Self::BipBeepFourTimes),
            3 => Some(Self::BipBip),
            4 => Some(Self::Beep),
            5 => Some(Self::BeepBeepBeep),
            6 => Some(Self::Beeeeeep),
            _ => None,
        }
    }
}

/// What arms an alert slot.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum AlertTrigger {
    /// Fire when the pod has been active for this long.
    TimeFromActivation(#[serde(with = "crate::time_serde::seconds")] Duration),
    /// Fire when the reservoir drops to this level.
    ReservoirVolume(Units),
}

/// Configuration for one alert slot.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PodAlert {
    /// Slot this alert occupies.
    pub slot: AlertSlot,
    /// Whether the alert is armed.
    pub active: bool,
    /// Whether the pod clears the alert on its own once acknowledged locally.
    pub auto_off: bool,
    /// Trigger condition.
    pub trigger: AlertTrigger,
    /// How long the alert repeats once fired.
    #[serde(with = "crate::time_serde::seconds")]
    pub duration: Duration,
    /// Beep pattern the pod plays while the alert is active.
    pub beep: BeepType,
}

impl PodAlert {
    /// Reminder armed during pairing so an abandoned setup beeps.
    #[must_use]
    pub fn finish_setup_reminder() -> Self {
        Self {
            slot: AlertSlot::Slot7,
            active: true,
            auto_off: false,
            trigger: AlertTrigger::TimeFromActivation(Duration::minutes(18 * 60)),
            duration: Duration::minutes(55),
            beep: BeepType::BipBeepFourTimes,
        }
    }

    /// Advisory alarm fired when the pod reaches its nominal life.
    #[must_use]
    pub fn expiration_advisory(time_from_activation: Duration, duration: Duration) -> Self {
        Self {
            slot: AlertSlot::Slot2,
            active: true,
            auto_off: false,
            trigger: AlertTrigger::TimeFromActivation(time_from_activation),
            duration,
            beep: BeepType::BeepBeepBeepBeep,
        }
    }

    /// Alarm fired shortly before the pod's hard end of service.
    #[must_use]
    pub fn shutdown_imminent(time_from_activation: Duration) -> Self {
        Self {
            slot: AlertSlot::Slot3,
            active: true,
            auto_off: false,
            trigger: AlertTrigger::TimeFromActivation(time_from_activation),
            duration: Duration::zero(),
            beep: BeepType::Beeeeeep,
        }
    }
}
