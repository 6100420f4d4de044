//! Message framing.
//!
//! ```text
//! +------------------+----------------+--------+----------+-----------+
//! | address (u32 BE) | seq/flags (u8) | length | blocks…  | crc16     |
//! +------------------+----------------+--------+----------+-----------+
//! ```
//!
//! The seq/flags byte packs the 5-bit message sequence number shifted left
//! by two, with bit 0 signalling that a follow-on command will arrive soon
//! (the pod uses it to hold off its command idle alarm). The CRC covers
//! every preceding byte.

use super::blocks::MessageBlock;
use super::crc::crc16;
use super::error::MessageError;
use super::status::DetailedStatus;

/// Bytes before the block list: address, seq/flags, length.
const HEADER_LEN: usize = 6;

/// Trailing CRC bytes.
const CRC_LEN: usize = 2;

/// One framed pod message: a block list bound to an address and sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Radio address of the pod this message is for (or from).
    pub address: u32,
    /// 5-bit message sequence number.
    pub sequence_num: u8,
    /// Typed blocks, in wire order.
    pub blocks: Vec<MessageBlock>,
    /// Whether the sender will follow up shortly with another command.
    pub expect_follow_on: bool,
}

impl Message {
    /// Build a message. The sequence number is masked to its 5-bit field.
    #[must_use]
    pub fn new(
        address: u32,
        sequence_num: u8,
        blocks: Vec<MessageBlock>,
        expect_follow_on: bool,
    ) -> Self {
        Self {
            address,
            sequence_num: sequence_num & 0x1f,
            blocks,
            expect_follow_on,
        }
    }

    /// Serialize to wire bytes, appending the CRC.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn encode(&self) -> Vec<u8> {
        let mut blocks_data = Vec::new();
        for block in &self.blocks {
            block.encode(&mut blocks_data);
        }
        let mut out = Vec::with_capacity(HEADER_LEN + blocks_data.len() + CRC_LEN);
        out.extend_from_slice(&self.address.to_be_bytes());
        out.push((self.sequence_num << 2) | u8::from(self.expect_follow_on));
        out.push(blocks_data.len() as u8);
        out.extend_from_slice(&blocks_data);
        let crc = crc16(&out);
        out.extend_from_slice(&crc.to_be_bytes());
        out
    }

    /// Parse a message from wire bytes, verifying length and CRC.
    pub fn decode(data: &[u8]) -> Result<Self, MessageError> {
        if data.len() < HEADER_LEN + CRC_LEN {
            return Err(MessageError::NotEnoughData {
                needed: HEADER_LEN + CRC_LEN,
                available: data.len(),
            });
        }
        let blocks_len = usize::from(data[5]);
        let total = HEADER_LEN + blocks_len + CRC_LEN;
        if data.len() < total {
            return Err(MessageError::NotEnoughData {
                needed: total,
                available: data.len(),
            });
        }
        let crc_at = HEADER_LEN + blocks_len;
        let received = u16::from_be_bytes([data[crc_at], data[crc_at + 1]]);
        let computed = crc16(&data[..crc_at]);
        if computed != received {
            return Err(MessageError::CrcMismatch { computed, received });
        }

        let mut blocks = Vec::new();
        let mut rest = &data[HEADER_LEN..crc_at];
        while !rest.is_empty() {
            let (block, consumed) = MessageBlock::decode_one(rest)?;
            blocks.push(block);
            rest = &rest[consumed..];
        }

        Ok(Self {
            address: u32::from_be_bytes([data[0], data[1], data[2], data[3]]),
            sequence_num: data[4] >> 2,
            blocks,
            expect_follow_on: data[4] & 0b1 != 0,
        })
    }

    /// The fault report this message carries, if the pod substituted a
    /// detailed status for the expected response.
    #[must_use]
    pub fn fault(&self) -> Option<&DetailedStatus> {
        match self.blocks.first() {
            Some(MessageBlock::PodInfoResponse(info)) => {
                info.detailed_status().filter(|status| status.is_faulted())
            },
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::blocks::{DeactivatePodCommand, GetStatusCommand};
    use crate::protocol::status::{
        DeliveryStatus, FaultEventCode, PodInfo, PodInfoResponse, PodInfoType, PodProgressStatus,
    };
    use crate::units::Units;
    use chrono::Duration;

    fn status_query() -> MessageBlock {
        MessageBlock::GetStatus(GetStatusCommand {
            pod_info_type: PodInfoType::NormalStatus,
        })
    }

    #[test]
    fn test_message_round_trip() {
        let message = Message::new(
            0x1f0d_3e0a,
            13,
            vec![
                status_query(),
                MessageBlock::DeactivatePod(DeactivatePodCommand { nonce: 99 }),
            ],
            true,
        );
        let wire = message.encode();
        let decoded = Message::decode(&wire).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_sequence_number_masked() {
        let message = Message::new(0x1111_1111, 33, vec![status_query()], false);
        assert_eq!(message.sequence_num, 1);
    }

    #[test]
    fn test_corrupt_crc_rejected() {
        let mut wire = Message::new(0x1111_1111, 0, vec![status_query()], false).encode();
        let last = wire.len() - 1;
        wire[last] ^= 0xff;
        assert!(matches!(
            Message::decode(&wire),
            Err(MessageError::CrcMismatch { .. })
        ));
    }

    #[test]
    fn test_truncated_rejected() {
        let wire = Message::new(0x1111_1111, 0, vec![status_query()], false).encode();
        assert!(matches!(
            Message::decode(&wire[..wire.len() - 3]),
            Err(MessageError::NotEnoughData { .. })
        ));
    }

    #[test]
    fn test_fault_extraction() {
        let detailed = crate::protocol::status::DetailedStatus {
            pod_progress: PodProgressStatus::FaultEventOccurred,
            delivery_status: DeliveryStatus::SUSPENDED,
            bolus_not_delivered: Units::from_pulses(8),
            insulin_delivered: Units::from_pulses(100),
            reservoir_level: None,
            time_active: Duration::minutes(10),
            fault_event_code: FaultEventCode(0x31),
            fault_time: Some(Duration::minutes(9)),
            unacknowledged_alerts: crate::alerts::AlertSet::EMPTY,
        };
        let message = Message::new(
            0x2222_2222,
            4,
            vec![MessageBlock::PodInfoResponse(PodInfoResponse {
                info_type: PodInfoType::DetailedStatus,
                info: PodInfo::DetailedStatus(detailed),
            })],
            false,
        );
        assert_eq!(message.fault(), Some(&detailed));

        let clean = Message::new(0x2222_2222, 5, vec![status_query()], false);
        assert_eq!(clean.fault(), None);
    }
}
