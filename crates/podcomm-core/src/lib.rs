//! # podcomm-core
//!
//! Session core for a body-worn insulin pod controlled over a short-range
//! radio bridge: reliable, stateful command/response exchange with the pod.
//!
//! This crate owns the hard parts of talking to a pod. Both endpoints
//! mutate authoritative state (the pod delivers the fluid, the controller
//! keeps the intent record), every authenticated command consumes a nonce
//! from a generator both sides must keep synchronized, and command failures
//! are three-valued: succeeded, certainly failed, or uncertain. Under- or
//! double-dosing insulin is a patient-safety event, so that distinction is
//! carried in the type system end to end.
//!
//! ## Layers
//!
//! - [`protocol`]: message blocks, framing, CRC, pod self-reports
//! - [`nonce`]: the shared deterministic nonce schedule
//! - [`dose`]: the dose ledger with certainty tracking
//! - [`pod_state`]: the persisted mirror of the pod, with its invariants
//! - [`session`]: message exchange, setup sequencing, delivery operations
//! - [`transport`]: the seam to the radio bridge
//!
//! ## Example
//!
//! ```ignore
//! use podcomm_core::prelude::*;
//!
//! let state = PodState::new(
//!     0x1f0d_3e0a,
//!     43620,
//!     4711,
//!     "2.7.0".into(),
//!     "2.7.0".into(),
//!     chrono::Utc::now(),
//! );
//! let mut session = PodSession::new(state, transport());
//! match session.bolus(Units::new(1.5), false, chrono::Duration::zero()) {
//!     DeliveryCommandResult::Success { status } => { /* delivered */ },
//!     DeliveryCommandResult::CertainFailure { error } => { /* safe to retry */ },
//!     DeliveryCommandResult::UncertainFailure { error } => {
//!         // ledger holds an uncertain record; reconcile via get_status()
//!     },
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod alerts;
pub mod basal;
pub mod consts;
pub mod dose;
pub mod error;
pub mod fault;
pub mod nonce;
pub mod pod_state;
pub mod protocol;
pub mod session;
pub mod transport;
pub mod units;

mod time_serde;

pub use dose::{DoseKind, DoseLedger, ScheduledCertainty, UnfinalizedDose};
pub use error::PodCommsError;
pub use fault::FaultRecord;
pub use nonce::NonceState;
pub use pod_state::{PodState, SetupProgress, SuspendState};
pub use session::{CancelDeliveryResult, DeliveryCommandResult, PodSession, PodSessionDelegate};
pub use transport::{MessageTransport, TransportError};
pub use units::Units;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::alerts::{AlertSet, AlertSlot, BeepType, PodAlert};
    pub use crate::basal::{BasalSchedule, BasalScheduleEntry};
    pub use crate::dose::{DoseKind, ScheduledCertainty, UnfinalizedDose};
    pub use crate::error::PodCommsError;
    pub use crate::pod_state::{PodState, SetupProgress, SuspendState};
    pub use crate::protocol::{DeliveryType, DetailedStatus, StatusResponse};
    pub use crate::session::{
        CancelDeliveryResult, DeliveryCommandResult, PodSession, PodSessionDelegate,
    };
    pub use crate::transport::{MessageTransport, TransportError};
    pub use crate::units::Units;
}
