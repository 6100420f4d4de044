//! Wire-level decode errors.

use thiserror::Error;

/// Errors decoding a message or message block from the wire.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MessageError {
    /// The buffer ended before the structure it claimed to hold.
    #[error("not enough data: needed {needed} bytes, had {available}")]
    NotEnoughData {
        /// Bytes the structure required.
        needed: usize,
        /// Bytes actually available.
        available: usize,
    },

    /// The message CRC did not match its contents.
    #[error("crc mismatch: computed {computed:#06x}, received {received:#06x}")]
    CrcMismatch {
        /// CRC computed over the received bytes.
        computed: u16,
        /// CRC carried by the message.
        received: u16,
    },

    /// A block type byte the controller does not know.
    #[error("unknown block type {0:#04x}")]
    UnknownBlockType(u8),

    /// A field carried a value outside its domain.
    #[error("invalid value {value} for {field}")]
    InvalidField {
        /// Name of the field.
        field: &'static str,
        /// Raw value received.
        value: u32,
    },
}
