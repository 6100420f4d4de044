//! Session error taxonomy.

use thiserror::Error;

use crate::fault::FaultRecord;
use crate::protocol::{MessageBlockType, MessageError};
use crate::transport::TransportError;

/// Errors surfaced by session operations.
///
/// Delivery operations never return these directly; they translate them
/// into the three-valued command results so callers must decide between
/// "assume delivered" and "assume not delivered" explicitly. Setup and
/// status operations return them as ordinary `Result`s and are safe to
/// retry at the session level.
#[derive(Debug, Error)]
pub enum PodCommsError {
    /// The operation requires an active paired pod.
    #[error("no pod is paired")]
    NoPodPaired,

    /// The response could not be decoded.
    #[error("malformed response: {0}")]
    InvalidData(#[from] MessageError),

    /// The response carried no blocks.
    #[error("empty response")]
    EmptyResponse,

    /// The response's first block was not the expected type.
    #[error("unexpected response block {0}")]
    UnexpectedResponse(MessageBlockType),

    /// The response carried a different pod's address; radio crosstalk is
    /// suspected and the response was discarded without touching state.
    #[error("invalid address {got:#010x}, expected {expected:#010x}")]
    InvalidAddress {
        /// Address the response carried.
        got: u32,
        /// Address of the paired pod.
        expected: u32,
    },

    /// A bolus is already recorded as in flight.
    #[error("an unfinalized bolus is in progress")]
    UnfinalizedBolus,

    /// A temp basal is already recorded as in flight.
    #[error("an unfinalized temp basal is in progress")]
    UnfinalizedTempBasal,

    /// The operation is not valid while delivery is suspended.
    #[error("pod is suspended")]
    PodSuspended,

    /// Both exchange attempts failed on nonce mismatch.
    #[error("nonce resync failed")]
    NonceResyncFailed,

    /// The pod rejected the command as non-retryable.
    #[error("pod rejected command (error code {0:#04x})")]
    RejectedMessage(u8),

    /// The pod reported a fault; dosing has been cleaned up once.
    #[error("pod fault: {0}")]
    PodFault(FaultRecord),

    /// The pod's activation window lapsed before setup completed.
    #[error("pod activation time exceeded")]
    ActivationTimeExceeded,

    /// A different pod answered during pairing.
    #[error("responding pod is not the pod being paired")]
    PodChange,

    /// Pairing signal strength too weak to proceed.
    #[error("signal too weak (rssi {0})")]
    RssiTooLow(i32),

    /// Pairing signal strength implausibly strong; pod is likely not on
    /// the body.
    #[error("signal too strong (rssi {0})")]
    RssiTooHigh(i32),

    /// The transport failed; the command may or may not have reached the
    /// pod.
    #[error("communication error: {0}")]
    CommsError(#[from] TransportError),
}

impl PodCommsError {
    /// Returns `true` when the failure disposition is knowable without a
    /// status round-trip: the command certainly did not take effect.
    #[must_use]
    pub fn is_certain(&self) -> bool {
        matches!(self, Self::NonceResyncFailed | Self::RejectedMessage(_))
    }
}
