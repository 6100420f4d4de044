//! Fixed pod timing and dosing parameters.

use chrono::Duration;

use crate::units::Units;

/// Fluid-path charge delivered during priming.
pub const PRIME_UNITS: Units = Units::new(2.6);

/// Bolus delivered by the cannula insertion step.
pub const CANNULA_INSERTION_UNITS: Units = Units::new(0.5);

/// Pulse cadence while priming and inserting the cannula.
pub const SECONDS_PER_PRIME_PULSE: u8 = 1;

/// Pulse cadence for ordinary boluses.
pub const SECONDS_PER_BOLUS_PULSE: u8 = 2;

/// Wall time the prime bolus takes end to end.
#[must_use]
pub fn prime_duration() -> Duration {
    Duration::seconds(55)
}

/// Pod life before the expiration advisory.
#[must_use]
pub fn nominal_pod_life() -> Duration {
    Duration::hours(72)
}

/// Hard end of service after activation.
#[must_use]
pub fn service_duration() -> Duration {
    Duration::hours(80)
}

/// How long before end of service the shutdown-imminent alarm fires.
#[must_use]
pub fn end_of_service_imminent_window() -> Duration {
    Duration::hours(1)
}

/// How long the expiration advisory repeats once fired.
#[must_use]
pub fn expiration_advisory_window() -> Duration {
    Duration::hours(7)
}

/// Offset applied to bolus start timestamps: delivery begins about this
/// long before the command call returns, compensating radio and firmware
/// latency.
#[must_use]
pub fn bolus_comms_offset() -> Duration {
    Duration::milliseconds(-1500)
}

/// Minimum forward jitter on a recomputed expiry before it is accepted,
/// preventing oscillation from round-trip timing noise.
#[must_use]
pub fn expiry_jitter_tolerance() -> Duration {
    Duration::seconds(60)
}
