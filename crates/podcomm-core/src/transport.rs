//! The seam between the session core and the radio bridge.
//!
//! The transport owns packet framing, encoding, and packet-level retries;
//! the session sees one blocking `send_message` that either returns the
//! pod's reply message or a [`TransportError`]. The transport also owns the
//! packet/message counters, which the session copies into [`PodState`] after
//! every exchange so a restored session resumes with correct sequence
//! numbers.
//!
//! [`PodState`]: crate::pod_state::PodState

use thiserror::Error;

use crate::pod_state::MessageTransportState;
use crate::protocol::Message;

/// Errors produced by the radio bridge layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The pod did not reply within the transport's retry budget.
    #[error("no response from pod")]
    NoResponse,

    /// The bridge returned a packet of an unexpected type.
    #[error("unexpected packet type {0:#04x}")]
    UnexpectedPacketType(u8),

    /// The pod acknowledged the packet but returned no message where a
    /// response was expected.
    #[error("pod acked instead of returning a response")]
    PodAckedInsteadOfReturningResponse,

    /// The bridge device itself failed.
    #[error("bridge error: {0}")]
    Bridge(String),
}

/// Blocking send/receive transport for framed pod messages.
///
/// Implementations are single-reader/single-writer: exactly one session
/// drives a transport at a time.
pub trait MessageTransport {
    /// Send `message` and block until the pod's reply arrives.
    ///
    /// Protocol-level rejections are not transport errors: they come back
    /// as a reply whose first block is an error response, or whose payload
    /// is a fault report.
    fn send_message(&mut self, message: &Message) -> Result<Message, TransportError>;

    /// The sequence number the next outgoing message will carry.
    fn message_number(&self) -> u8;

    /// Current packet/message counters, persisted by the session after
    /// every exchange.
    fn transport_state(&self) -> MessageTransportState;

    /// Debug hook asserting the caller is on the session's serial queue.
    fn assert_on_session_queue(&self) {}
}
