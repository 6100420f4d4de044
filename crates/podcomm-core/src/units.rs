//! Insulin quantities on pulse granularity.
//!
//! The pod delivers insulin in discrete pulses of 0.05 U. Every amount that
//! crosses the wire is rounded to a whole number of pulses; this module keeps
//! that rounding in one place so command encoding and the dose ledger agree.

use std::fmt;
use std::ops::{Add, AddAssign, Sub};

use serde::{Deserialize, Serialize};

/// An insulin amount in units (U).
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Units(f64);

impl Units {
    /// Size of one pod pulse, in units.
    pub const PULSE_SIZE: f64 = 0.05;

    /// Create an amount from raw units.
    #[must_use]
    pub const fn new(units: f64) -> Self {
        Self(units)
    }

    /// Create an amount from a whole number of pulses.
    #[must_use]
    pub fn from_pulses(pulses: u32) -> Self {
        Self(f64::from(pulses) * Self::PULSE_SIZE)
    }

    /// The amount rounded to the nearest whole pulse count.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn pulses(self) -> u32 {
        (self.0 / Self::PULSE_SIZE).round().max(0.0) as u32
    }

    /// Raw value in units.
    #[must_use]
    pub const fn as_f64(self) -> f64 {
        self.0
    }

    /// Returns `true` if this amount rounds to zero pulses.
    #[must_use]
    pub fn is_zero(self) -> bool {
        self.pulses() == 0
    }

    /// Snap to pulse granularity (what the pod will actually deliver).
    #[must_use]
    pub fn rounded_to_pulse(self) -> Self {
        Self::from_pulses(self.pulses())
    }
}

impl Add for Units {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self(self.0 + rhs.0)
    }
}

impl AddAssign for Units {
    fn add_assign(&mut self, rhs: Self) {
        self.0 += rhs.0;
    }
}

impl Sub for Units {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Self(self.0 - rhs.0)
    }
}

impl fmt::Display for Units {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2} U", self.0)
    }
}
