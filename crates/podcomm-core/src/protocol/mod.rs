//! Pod wire protocol: blocks, framing, and pod self-reports.
//!
//! The protocol stack, radio layers downward handled by the transport:
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │          Session operations             │  setup / delivery
//! ├─────────────────────────────────────────┤
//! │          Typed message blocks           │  blocks
//! ├─────────────────────────────────────────┤
//! │   Message framing (address/seq/crc16)   │  message
//! ├─────────────────────────────────────────┤
//! │   Radio bridge packets (out of scope)   │  MessageTransport
//! └─────────────────────────────────────────┘
//! ```

pub mod blocks;
pub mod crc;
pub mod error;
pub mod message;
pub mod status;

pub use blocks::{
    basal_rate_segments, AcknowledgeAlertCommand, BasalRateSegment, BasalScheduleExtraCommand,
    BeepConfigCommand, BolusExtraCommand, CancelDeliveryCommand, ConfigureAlertsCommand,
    DeactivatePodCommand, DeliveryType, ErrorResponse, FaultConfigCommand, GetStatusCommand,
    InsulinSchedule, MessageBlock, MessageBlockType, SetInsulinScheduleCommand,
    TempBasalExtraCommand,
};
pub use crc::crc16;
pub use error::MessageError;
pub use message::Message;
pub use status::{
    DeliveryStatus, DetailedStatus, FaultEventCode, PodInfo, PodInfoResponse, PodInfoType,
    PodProgressStatus, PulseLog, StatusResponse,
};
