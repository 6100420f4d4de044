//! Pod self-reports: status, detailed status, and pod info payloads.
//!
//! A [`StatusResponse`] is the pod's ordinary 10-byte self-report. A
//! [`DetailedStatus`] is the longer report returned for the detailed pod-info
//! query, and also what the pod substitutes for the expected response when it
//! has faulted.

use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::error::MessageError;
use crate::alerts::AlertSet;
use crate::units::Units;

/// Reservoir readings above this pulse count are reported as "full".
const RESERVOIR_SENTINEL: u16 = 0xffff;

/// What the pod is currently delivering, as a 3-bit field.
///
/// Bit 0 is scheduled basal, bit 1 is a temp basal, bit 2 is a bolus. A zero
/// value means all delivery is suspended.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct DeliveryStatus(u8);

impl DeliveryStatus {
    /// All delivery suspended.
    pub const SUSPENDED: Self = Self(0);
    /// Scheduled basal running, nothing else.
    pub const BASAL: Self = Self(0b001);

    const BASAL_BIT: u8 = 0b001;
    const TEMP_BASAL_BIT: u8 = 0b010;
    const BOLUS_BIT: u8 = 0b100;

    /// Build from the raw wire field.
    #[must_use]
    pub const fn from_raw(raw: u8) -> Self {
        Self(raw & 0b111)
    }

    /// Raw wire field.
    #[must_use]
    pub const fn raw(self) -> u8 {
        self.0
    }

    /// Compose a status from individual delivery flags.
    #[must_use]
    pub const fn new(basal: bool, temp_basal: bool, bolus: bool) -> Self {
        let mut raw = 0;
        if basal {
            raw |= Self::BASAL_BIT;
        }
        if temp_basal {
            raw |= Self::TEMP_BASAL_BIT;
        }
        if bolus {
            raw |= Self::BOLUS_BIT;
        }
        Self(raw)
    }

    /// Returns `true` if no delivery of any kind is running.
    #[must_use]
    pub const fn is_suspended(self) -> bool {
        self.0 == 0
    }

    /// Returns `true` if a bolus is in progress.
    #[must_use]
    pub const fn bolusing(self) -> bool {
        self.0 & Self::BOLUS_BIT != 0
    }

    /// Returns `true` if a temp basal is running.
    #[must_use]
    pub const fn temp_basal_running(self) -> bool {
        self.0 & Self::TEMP_BASAL_BIT != 0
    }

    /// Returns `true` if scheduled basal is running.
    #[must_use]
    pub const fn basal_running(self) -> bool {
        self.0 & Self::BASAL_BIT != 0
    }
}

/// The pod's own lifecycle phase, as reported in every status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PodProgressStatus {
    /// Factory state.
    Initialized,
    /// Pod memory checked.
    MemoryInitialized,
    /// Internal reminders armed.
    ReminderInitialized,
    /// Pairing finished; pod is addressable.
    PairingCompleted,
    /// Prime bolus running.
    Priming,
    /// Prime bolus finished.
    PrimingCompleted,
    /// Initial basal schedule programmed.
    BasalInitialized,
    /// Cannula insertion bolus running.
    InsertingCannula,
    /// Delivering; more than 50 U remaining.
    AboveFiftyUnits,
    /// Delivering; 50 U or less remaining.
    FiftyOrLessUnits,
    /// A fault has latched.
    FaultEventOccurred,
    /// The activation window lapsed before setup finished.
    ActivationTimeExceeded,
    /// Pod is deactivated.
    Inactive,
}

impl PodProgressStatus {
    /// Wire value.
    #[must_use]
    pub fn raw(self) -> u8 {
        match self {
            Self::Initialized => 0,
            Self::MemoryInitialized => 1,
            Self::ReminderInitialized => 2,
            Self::PairingCompleted => 3,
            Self::Priming => 4,
            Self::PrimingCompleted => 5,
            Self::BasalInitialized => 6,
            Self::InsertingCannula => 7,
            Self::AboveFiftyUnits => 8,
            Self::FiftyOrLessUnits => 9,
            Self::FaultEventOccurred => 13,
            Self::ActivationTimeExceeded => 14,
            Self::Inactive => 15,
        }
    }

    /// Decode a wire value.
    pub fn from_raw(raw: u8) -> Result<Self, MessageError> {
        match raw {
            0 => Ok(Self::Initialized),
            1 => Ok(Self::MemoryInitialized),
            2 => Ok(Self::ReminderInitialized),
            3 => Ok(Self::PairingCompleted),
            4 => Ok(Self::Priming),
            5 => Ok(Self::PrimingCompleted),
            6 => Ok(Self::BasalInitialized),
            7 => Ok(Self::InsertingCannula),
            8 => Ok(Self::AboveFiftyUnits),
            9 => Ok(Self::FiftyOrLessUnits),
            13 => Ok(Self::FaultEventOccurred),
            14 => Ok(Self::ActivationTimeExceeded),
            15 => Ok(Self::Inactive),
            other => Err(MessageError::InvalidField {
                field: "pod progress status",
                value: u32::from(other),
            }),
        }
    }

    /// Returns `true` once setup is complete and the pod is delivering.
    #[must_use]
    pub fn ready_for_delivery(self) -> bool {
        matches!(self, Self::AboveFiftyUnits | Self::FiftyOrLessUnits)
    }
}

/// A pod fault event code.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct FaultEventCode(pub u8);

impl FaultEventCode {
    /// No fault.
    pub const NONE: Self = Self(0);
    /// No command received within the pod's 4-minute setup idle window.
    pub const COMMAND_IDLE_TIMEOUT: Self = Self(0x33);
    /// Occlusion detected in the fluid path.
    pub const OCCLUSION: Self = Self(0x18);
    /// Reservoir empty.
    pub const RESERVOIR_EMPTY: Self = Self(0x14);

    /// Returns `true` if this code represents an actual fault.
    #[must_use]
    pub const fn is_fault(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for FaultEventCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            Self::NONE => Some("no fault"),
            Self::COMMAND_IDLE_TIMEOUT => Some("command idle timeout"),
            Self::OCCLUSION => Some("occlusion"),
            Self::RESERVOIR_EMPTY => Some("reservoir empty"),
            _ => None,
        };
        match name {
            Some(name) => write!(f, "${:02x} ({name})", self.0),
            None => write!(f, "${:02x}", self.0),
        }
    }
}

/// The pod's ordinary status self-report.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatusResponse {
    /// What is currently being delivered.
    pub delivery_status: DeliveryStatus,
    /// Pod lifecycle phase.
    pub pod_progress: PodProgressStatus,
    /// Cumulative insulin delivered since activation.
    pub insulin_delivered: Units,
    /// Pulses of the current bolus not yet delivered.
    pub bolus_not_delivered: Units,
    /// Alert slots currently firing.
    pub active_alerts: AlertSet,
    /// Time since activation.
    pub time_active: Duration,
    /// Reservoir level, if low enough for the pod to measure.
    pub reservoir_level: Option<Units>,
}

impl StatusResponse {
    /// Encoded body length.
    pub(crate) const BODY_LEN: usize = 10;

    pub(crate) fn encode_body(&self, out: &mut Vec<u8>) {
        out.push((self.delivery_status.raw() << 4) | self.pod_progress.raw());
        out.extend_from_slice(&pulses_u16(self.insulin_delivered).to_be_bytes());
        out.extend_from_slice(&pulses_u16(self.bolus_not_delivered).to_be_bytes());
        out.push(self.active_alerts.raw());
        out.extend_from_slice(&minutes_u16(self.time_active).to_be_bytes());
        let reservoir = self
            .reservoir_level
            .map_or(RESERVOIR_SENTINEL, pulses_u16);
        out.extend_from_slice(&reservoir.to_be_bytes());
    }

    pub(crate) fn decode_body(body: &[u8]) -> Result<Self, MessageError> {
        if body.len() < Self::BODY_LEN {
            return Err(MessageError::NotEnoughData {
                needed: Self::BODY_LEN,
                available: body.len(),
            });
        }
        let reservoir = u16::from_be_bytes([body[8], body[9]]);
        Ok(Self {
            delivery_status: DeliveryStatus::from_raw(body[0] >> 4),
            pod_progress: PodProgressStatus::from_raw(body[0] & 0x0f)?,
            insulin_delivered: Units::from_pulses(u32::from(u16::from_be_bytes([
                body[1], body[2],
            ]))),
            bolus_not_delivered: Units::from_pulses(u32::from(u16::from_be_bytes([
                body[3], body[4],
            ]))),
            active_alerts: AlertSet::from_raw(body[5]),
            time_active: Duration::minutes(i64::from(u16::from_be_bytes([body[6], body[7]]))),
            reservoir_level: (reservoir != RESERVOIR_SENTINEL)
                .then(|| Units::from_pulses(u32::from(reservoir))),
        })
    }
}

/// The pod's detailed self-report, including fault information.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DetailedStatus {
    /// Pod lifecycle phase.
    pub pod_progress: PodProgressStatus,
    /// What is currently being delivered.
    pub delivery_status: DeliveryStatus,
    /// Pulses of the interrupted bolus not delivered, if any.
    pub bolus_not_delivered: Units,
    /// Cumulative insulin delivered since activation.
    pub insulin_delivered: Units,
    /// Reservoir level, if low enough for the pod to measure.
    pub reservoir_level: Option<Units>,
    /// Time since activation.
    #[serde(with = "crate::time_serde::seconds")]
    pub time_active: Duration,
    /// Latched fault code; zero when no fault has occurred.
    pub fault_event_code: FaultEventCode,
    /// Time since activation at which the fault latched.
    #[serde(with = "crate::time_serde::opt_seconds")]
    pub fault_time: Option<Duration>,
    /// Alert slots fired but not yet acknowledged.
    pub unacknowledged_alerts: AlertSet,
}

impl DetailedStatus {
    /// Encoded body length, excluding the pod-info type byte.
    pub(crate) const BODY_LEN: usize = 14;

    const FAULT_TIME_SENTINEL: u16 = 0xffff;

    /// Returns `true` if the pod reports a latched fault.
    #[must_use]
    pub fn is_faulted(&self) -> bool {
        self.fault_event_code.is_fault()
            || matches!(
                self.pod_progress,
                PodProgressStatus::FaultEventOccurred | PodProgressStatus::ActivationTimeExceeded
            )
    }

    pub(crate) fn encode_body(&self, out: &mut Vec<u8>) {
        out.push(self.pod_progress.raw());
        out.push(self.delivery_status.raw());
        out.extend_from_slice(&pulses_u16(self.bolus_not_delivered).to_be_bytes());
        out.extend_from_slice(&pulses_u16(self.insulin_delivered).to_be_bytes());
        let reservoir = self
            .reservoir_level
            .map_or(RESERVOIR_SENTINEL, pulses_u16);
        out.extend_from_slice(&reservoir.to_be_bytes());
        out.extend_from_slice(&minutes_u16(self.time_active).to_be_bytes());
        out.push(self.fault_event_code.0);
        let fault_minutes = self
            .fault_time
            .map_or(Self::FAULT_TIME_SENTINEL, minutes_u16);
        out.extend_from_slice(&fault_minutes.to_be_bytes());
        out.push(self.unacknowledged_alerts.raw());
    }

    pub(crate) fn decode_body(body: &[u8]) -> Result<Self, MessageError> {
        if body.len() < Self::BODY_LEN {
            return Err(MessageError::NotEnoughData {
                needed: Self::BODY_LEN,
                available: body.len(),
            });
        }
        let reservoir = u16::from_be_bytes([body[6], body[7]]);
        let fault_minutes = u16::from_be_bytes([body[11], body[12]]);
        Ok(Self {
            pod_progress: PodProgressStatus::from_raw(body[0])?,
            delivery_status: DeliveryStatus::from_raw(body[1]),
            bolus_not_delivered: Units::from_pulses(u32::from(u16::from_be_bytes([
                body[2], body[3],
            ]))),
            insulin_delivered: Units::from_pulses(u32::from(u16::from_be_bytes([
                body[4], body[5],
            ]))),
            reservoir_level: (reservoir != RESERVOIR_SENTINEL)
                .then(|| Units::from_pulses(u32::from(reservoir))),
            time_active: Duration::minutes(i64::from(u16::from_be_bytes([body[9], body[10]]))),
            fault_event_code: FaultEventCode(body[8]),
            fault_time: (fault_minutes != Self::FAULT_TIME_SENTINEL)
                .then(|| Duration::minutes(i64::from(fault_minutes))),
            unacknowledged_alerts: AlertSet::from_raw(body[13]),
        })
    }
}

/// Which pod-info payload a status query requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PodInfoType {
    /// The ordinary status response.
    NormalStatus,
    /// The detailed status payload.
    DetailedStatus,
    /// The most recent pulse-log entries.
    PulseLogRecent,
    /// The previous pulse-log page.
    PulseLogPrevious,
}

impl PodInfoType {
    /// Wire value.
    #[must_use]
    pub fn raw(self) -> u8 {
        match self {
            Self::NormalStatus => 0x00,
            Self::DetailedStatus => 0x02,
            Self::PulseLogRecent => 0x50,
            Self::PulseLogPrevious => 0x51,
        }
    }

    /// Decode a wire value.
    pub fn from_raw(raw: u8) -> Result<Self, MessageError> {
        match raw {
            0x00 => Ok(Self::NormalStatus),
            0x02 => Ok(Self::DetailedStatus),
            0x50 => Ok(Self::PulseLogRecent),
            0x51 => Ok(Self::PulseLogPrevious),
            other => Err(MessageError::InvalidField {
                field: "pod info type",
                value: u32::from(other),
            }),
        }
    }
}

/// A page of the pod's internal pulse log, read for postmortems.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PulseLog {
    /// Raw pulse-log words, most recent last.
    pub entries: Vec<u32>,
}

/// Payload of a pod-info response.
#[derive(Debug, Clone, PartialEq)]
pub enum PodInfo {
    /// Detailed status payload.
    DetailedStatus(DetailedStatus),
    /// Pulse-log page.
    PulseLog(PulseLog),
}

/// A pod-info response block, wrapping one of the queryable payloads.
#[derive(Debug, Clone, PartialEq)]
pub struct PodInfoResponse {
    /// Payload type tag as sent by the pod.
    pub info_type: PodInfoType,
    /// Decoded payload.
    pub info: PodInfo,
}

impl PodInfoResponse {
    /// The detailed status payload, if this response carries one.
    #[must_use]
    pub fn detailed_status(&self) -> Option<&DetailedStatus> {
        match &self.info {
            PodInfo::DetailedStatus(status) => Some(status),
            PodInfo::PulseLog(_) => None,
        }
    }

    pub(crate) fn encode_body(&self, out: &mut Vec<u8>) {
        out.push(self.info_type.raw());
        match &self.info {
            PodInfo::DetailedStatus(status) => status.encode_body(out),
            PodInfo::PulseLog(log) => {
                for entry in &log.entries {
                    out.extend_from_slice(&entry.to_be_bytes());
                }
            },
        }
    }

    pub(crate) fn decode_body(body: &[u8]) -> Result<Self, MessageError> {
        let (&type_byte, rest) = body.split_first().ok_or(MessageError::NotEnoughData {
            needed: 1,
            available: 0,
        })?;
        let info_type = PodInfoType::from_raw(type_byte)?;
        let info = match info_type {
            PodInfoType::DetailedStatus | PodInfoType::NormalStatus => {
                PodInfo::DetailedStatus(DetailedStatus::decode_body(rest)?)
            },
            PodInfoType::PulseLogRecent | PodInfoType::PulseLogPrevious => {
                let entries = rest
                    .chunks_exact(4)
                    .map(|chunk| u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
                    .collect();
                PodInfo::PulseLog(PulseLog { entries })
            },
        };
        Ok(Self { info_type, info })
    }
}

#[allow(clippy::cast_possible_truncation)]
pub(crate) fn pulses_u16(units: Units) -> u16 {
    units.pulses().min(u32::from(u16::MAX - 1)) as u16
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub(crate) fn minutes_u16(duration: Duration) -> u16 {
    duration.num_minutes().clamp(0, i64::from(u16::MAX - 1)) as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_status() -> StatusResponse {
        StatusResponse {
            delivery_status: DeliveryStatus::new(true, false, true),
            pod_progress: PodProgressStatus::AboveFiftyUnits,
            insulin_delivered: Units::from_pulses(1040),
            bolus_not_delivered: Units::from_pulses(12),
            active_alerts: AlertSet::from_raw(0b0000_0100),
            time_active: Duration::minutes(845),
            reservoir_level: Some(Units::from_pulses(600)),
        }
    }

    #[test]
    fn test_status_round_trip() {
        let status = sample_status();
        let mut body = Vec::new();
        status.encode_body(&mut body);
        assert_eq!(body.len(), StatusResponse::BODY_LEN);
        let decoded = StatusResponse::decode_body(&body).unwrap();
        assert_eq!(decoded, status);
    }

    #[test]
    fn test_status_full_reservoir_sentinel() {
        let mut status = sample_status();
        status.reservoir_level = None;
        let mut body = Vec::new();
        status.encode_body(&mut body);
        let decoded = StatusResponse::decode_body(&body).unwrap();
        assert_eq!(decoded.reservoir_level, None);
    }

    #[test]
    fn test_delivery_status_predicates() {
        assert!(DeliveryStatus::SUSPENDED.is_suspended());
        assert!(!DeliveryStatus::BASAL.is_suspended());
        let status = DeliveryStatus::new(true, true, false);
        assert!(status.temp_basal_running());
        assert!(!status.bolusing());
    }

    #[test]
    fn test_detailed_status_round_trip() {
        let detailed = DetailedStatus {
            pod_progress: PodProgressStatus::FaultEventOccurred,
            delivery_status: DeliveryStatus::SUSPENDED,
            bolus_not_delivered: Units::from_pulses(8),
            insulin_delivered: Units::from_pulses(2310),
            reservoir_level: None,
            time_active: Duration::minutes(4031),
            fault_event_code: FaultEventCode::OCCLUSION,
            fault_time: Some(Duration::minutes(4020)),
            unacknowledged_alerts: AlertSet::from_raw(0b1000_0000),
        };
        let mut body = Vec::new();
        detailed.encode_body(&mut body);
        assert_eq!(body.len(), DetailedStatus::BODY_LEN);
        let decoded = DetailedStatus::decode_body(&body).unwrap();
        assert_eq!(decoded, detailed);
        assert!(decoded.is_faulted());
    }

    #[test]
    fn test_detailed_status_unfaulted() {
        let detailed = DetailedStatus {
            pod_progress: PodProgressStatus::AboveFiftyUnits,
            delivery_status: DeliveryStatus::BASAL,
            bolus_not_delivered: Units::default(),
            insulin_delivered: Units::from_pulses(100),
            reservoir_level: Some(Units::from_pulses(900)),
            time_active: Duration::minutes(60),
            fault_event_code: FaultEventCode::NONE,
            fault_time: None,
            unacknowledged_alerts: AlertSet::EMPTY,
        };
        assert!(!detailed.is_faulted());
    }

    #[test]
    fn test_pod_info_pulse_log_round_trip() {
        let response = PodInfoResponse {
            info_type: PodInfoType::PulseLogRecent,
            info: PodInfo::PulseLog(PulseLog {
                entries: vec![0xdead_beef, 0x0102_0304],
            }),
        };
        let mut body = Vec::new();
        response.encode_body(&mut body);
        let decoded = PodInfoResponse::decode_body(&body).unwrap();
        assert_eq!(decoded, response);
    }

    #[test]
    fn test_progress_raw_round_trip() {
        for progress in [
            PodProgressStatus::Initialized,
            PodProgressStatus::Priming,
            PodProgressStatus::BasalInitialized,
            PodProgressStatus::InsertingCannula,
            PodProgressStatus::AboveFiftyUnits,
            PodProgressStatus::ActivationTimeExceeded,
            PodProgressStatus::Inactive,
        ] {
            assert_eq!(PodProgressStatus::from_raw(progress.raw()).unwrap(), progress);
        }
        assert!(PodProgressStatus::from_raw(10).is_err());
    }
}
