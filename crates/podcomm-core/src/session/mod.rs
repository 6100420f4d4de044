//! Pod communication session.
//!
//! A [`PodSession`] binds one [`PodState`] to one [`MessageTransport`] and
//! is the only place either is mutated. All operations run synchronously on
//! the host's session queue; the transport's
//! [`assert_on_session_queue`](MessageTransport::assert_on_session_queue)
//! hook backs that discipline in debug builds.
//!
//! Every state mutation funnels through [`PodSession::mutate`], which
//! notifies the session delegate once per batch so observers see a total
//! order of state transitions and can persist the state blob after each.

mod delivery;
mod setup;

#[cfg(test)]
mod tests;

pub use delivery::{CancelDeliveryResult, DeliveryCommandResult};

use std::rc::Weak;

use chrono::Utc;

use crate::dose::UnfinalizedDose;
use crate::error::PodCommsError;
use crate::fault::FaultRecord;
use crate::pod_state::PodState;
use crate::protocol::{
    DetailedStatus, ErrorResponse, Message, MessageBlock, PodInfoResponse, StatusResponse,
};
use crate::transport::MessageTransport;

/// Observer of pod state changes, notified synchronously from the session
/// queue after every mutation.
///
/// The session holds only a weak handle; registering as a delegate never
/// extends the observer's lifetime.
pub trait PodSessionDelegate {
    /// The session's pod state changed; `state` is the post-mutation value.
    fn pod_state_did_change(&self, state: &PodState);
}

/// A response block type an exchange can be asked to return.
pub trait PodResponse: Sized {
    /// Extract this response from a message block, if the types match.
    fn from_block(block: &MessageBlock) -> Option<Self>;
}

impl PodResponse for StatusResponse {
    fn from_block(block: &MessageBlock) -> Option<Self> {
        match block {
            MessageBlock::StatusResponse(status) => Some(*status),
            _ => None,
        }
    }
}

impl PodResponse for PodInfoResponse {
    fn from_block(block: &MessageBlock) -> Option<Self> {
        match block {
            MessageBlock::PodInfoResponse(info) => Some(info.clone()),
            _ => None,
        }
    }
}

/// A communication session with one pod.
pub struct PodSession<T: MessageTransport> {
    pub(crate) state: PodState,
    pub(crate) transport: T,
    delegate: Option<Weak<dyn PodSessionDelegate>>,
    pub(crate) use_cancel_none_for_status: bool,
}

impl<T: MessageTransport> PodSession<T> {
    /// Open a session over `transport` for the pod described by `state`.
    ///
    /// The pod state is owned exclusively by this session until the session
    /// is dropped; concurrent sessions for the same pod are not supported.
    #[must_use]
    pub fn new(state: PodState, transport: T) -> Self {
        Self {
            state,
            transport,
            delegate: None,
            use_cancel_none_for_status: false,
        }
    }

    /// Register the state observer. Only a weak handle is kept.
    pub fn set_delegate(&mut self, delegate: Weak<dyn PodSessionDelegate>) {
        self.delegate = Some(delegate);
    }

    /// Route status reads through a no-op cancel instead of a status query,
    /// which additionally validates the nonce schedule. Off by default.
    pub fn set_use_cancel_none_for_status(&mut self, enabled: bool) {
        self.use_cancel_none_for_status = enabled;
    }

    /// The current pod state.
    #[must_use]
    pub fn state(&self) -> &PodState {
        &self.state
    }

    /// Give up the session, returning the pod state for the host to keep
    /// or discard.
    #[must_use]
    pub fn into_state(self) -> PodState {
        self.state
    }

    /// Apply `f` to the pod state and notify the delegate once.
    pub(crate) fn mutate<R>(&mut self, f: impl FnOnce(&mut PodState) -> R) -> R {
        self.transport.assert_on_session_queue();
        let result = f(&mut self.state);
        if let Some(delegate) = self.delegate.as_ref().and_then(Weak::upgrade) {
            delegate.pod_state_did_change(&self.state);
        }
        result
    }

    /// Hand finalized and live doses to `handler` for durable export; the
    /// finalized buffer is cleared iff the handler reports success.
    pub fn drain_doses<F>(&mut self, handler: F)
    where
        F: FnOnce(&[UnfinalizedDose]) -> bool,
    {
        self.mutate(|state| state.doses.drain(handler));
    }

    /// Send `blocks` as one message and return the typed first response
    /// block.
    ///
    /// Handles, in order: address validation, type match, fault extraction,
    /// and error responses. A nonce mismatch reseeds the generator from the
    /// pod's sync word and retries once; delivery of a fresh nonce into
    /// every nonce-bearing block happens here, so callers construct such
    /// blocks with a placeholder nonce.
    pub(crate) fn exchange<R: PodResponse>(
        &mut self,
        mut blocks: Vec<MessageBlock>,
        expect_follow_on: bool,
    ) -> Result<R, PodCommsError> {
        self.transport.assert_on_session_queue();

        let needs_nonce = blocks.iter().any(|block| block.nonce().is_some());
        let mut sent_nonce = 0u32;
        if needs_nonce {
            sent_nonce = self.mutate(|state| {
                state.nonce_state.advance_to_next();
                state.nonce_state.current()
            });
            for block in &mut blocks {
                block.set_nonce(sent_nonce);
            }
        }

        for attempt in 0..2 {
            let message = Message::new(
                self.state.address,
                self.transport.message_number(),
                blocks.clone(),
                expect_follow_on,
            );
            tracing::debug!(
                seq = message.sequence_num,
                types = ?message.blocks.iter().map(MessageBlock::block_type).collect::<Vec<_>>(),
                attempt,
                "sending command message"
            );
            let response = self.transport.send_message(&message)?;

            // Crosstalk check comes first: a response for another pod must
            // not touch state in any way.
            if response.address != self.state.address {
                return Err(PodCommsError::InvalidAddress {
                    got: response.address,
                    expected: self.state.address,
                });
            }

            let transport_state = self.transport.transport_state();
            let first = response
                .blocks
                .first()
                .cloned()
                .ok_or(PodCommsError::EmptyResponse)?;

            if let Some(result) = R::from_block(&first) {
                self.mutate(|state| {
                    state.message_transport_state = transport_state;
                    if let MessageBlock::StatusResponse(status) = &first {
                        state.update_from_status_response(status, Utc::now());
                    }
                });
                return Ok(result);
            }

            if let Some(detailed) = response.fault() {
                let detailed = *detailed;
                return Err(self.capture_fault(&detailed));
            }

            match first {
                MessageBlock::ErrorResponse(ErrorResponse::BadNonce { sync_word })
                    if needs_nonce =>
                {
                    tracing::info!(sync_word, attempt, "pod rejected nonce; reseeding");
                    let sequence_num = message.sequence_num;
                    let new_nonce = self.mutate(|state| {
                        state.message_transport_state = transport_state;
                        state
                            .nonce_state
                            .resync(sync_word, sent_nonce, sequence_num);
                        state.nonce_state.current()
                    });
                    for block in &mut blocks {
                        block.set_nonce(new_nonce);
                    }
                    sent_nonce = new_nonce;
                    self.mutate(|state| state.nonce_state.advance_to_next());
                },
                MessageBlock::ErrorResponse(ErrorResponse::NonRetryable { code, .. }) => {
                    return Err(PodCommsError::RejectedMessage(code));
                },
                other => return Err(PodCommsError::UnexpectedResponse(other.block_type())),
            }
        }

        Err(PodCommsError::NonceResyncFailed)
    }

    /// Capture a fault report and translate it into the error the caller
    /// should see. Capture is idempotent; the translation always reflects
    /// the first recorded fault.
    pub(crate) fn capture_fault(&mut self, detailed: &DetailedStatus) -> PodCommsError {
        let now = Utc::now();
        self.mutate(|state| {
            state.register_fault(detailed, now);
        });
        let record = self
            .state
            .fault
            .unwrap_or_else(|| FaultRecord::new(*detailed, now));
        if record.is_activation_timeout() {
            PodCommsError::ActivationTimeExceeded
        } else {
            PodCommsError::PodFault(record)
        }
    }

    /// Development probe: read status via a no-op cancel, which also
    /// validates the nonce schedule end to end.
    pub fn testing_commands(&mut self) -> Result<(), PodCommsError> {
        self.cancel_none().map(|_| ())
    }
}
