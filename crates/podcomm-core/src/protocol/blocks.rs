//! Typed message blocks.
//!
//! Every pod message is a sequence of blocks, each `type ‖ length ‖ body`.
//! Command blocks that the pod authenticates carry a 4-byte nonce at the
//! start of their body; [`MessageBlock::set_nonce`] rewrites it in place so
//! the exchange layer can resynchronize without rebuilding commands.

use chrono::Duration;

use super::error::MessageError;
use super::status::{
    minutes_u16, pulses_u16, FaultEventCode, PodInfoResponse, PodInfoType, PodProgressStatus,
    StatusResponse,
};
use crate::alerts::{AlertSet, AlertSlot, AlertTrigger, BeepType, PodAlert};
use crate::basal::BasalSchedule;
use crate::units::Units;

/// Block type discriminators on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum MessageBlockType {
    PodInfoResponse,
    ErrorResponse,
    FaultConfig,
    GetStatus,
    AcknowledgeAlert,
    BasalScheduleExtra,
    TempBasalExtra,
    BolusExtra,
    ConfigureAlerts,
    SetInsulinSchedule,
    DeactivatePod,
    StatusResponse,
    BeepConfig,
    CancelDelivery,
}

impl MessageBlockType {
    /// Wire value.
    #[must_use]
    pub fn raw(self) -> u8 {
        match self {
            Self::PodInfoResponse => 0x02,
            Self::ErrorResponse => 0x06,
            Self::FaultConfig => 0x08,
            Self::GetStatus => 0x0e,
            Self::AcknowledgeAlert => 0x11,
            Self::BasalScheduleExtra => 0x13,
            Self::TempBasalExtra => 0x16,
            Self::BolusExtra => 0x17,
            Self::ConfigureAlerts => 0x19,
            Self::SetInsulinSchedule => 0x1a,
            Self::DeactivatePod => 0x1c,
            Self::StatusResponse => 0x1d,
            Self::BeepConfig => 0x1e,
            Self::CancelDelivery => 0x1f,
        }
    }

    /// Decode a wire value.
    pub fn from_raw(raw: u8) -> Result<Self, MessageError> {
        match raw {
            0x02 => Ok(Self::PodInfoResponse),
            0x06 => Ok(Self::ErrorResponse),
            0x08 => Ok(Self::FaultConfig),
            0x0e => Ok(Self::GetStatus),
            0x11 => Ok(Self::AcknowledgeAlert),
            0x13 => Ok(Self::BasalScheduleExtra),
            0x16 => Ok(Self::TempBasalExtra),
            0x17 => Ok(Self::BolusExtra),
            0x19 => Ok(Self::ConfigureAlerts),
            0x1a => Ok(Self::SetInsulinSchedule),
            0x1c => Ok(Self::DeactivatePod),
            0x1d => Ok(Self::StatusResponse),
            0x1e => Ok(Self::BeepConfig),
            0x1f => Ok(Self::CancelDelivery),
            other => Err(MessageError::UnknownBlockType(other)),
        }
    }
}

impl std::fmt::Display for MessageBlockType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?} ({:#04x})", self.raw())
    }
}

/// Bitset naming which kinds of delivery a cancel command addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeliveryType(u8);

impl DeliveryType {
    /// Cancel nothing (status probe).
    pub const NONE: Self = Self(0);
    /// Scheduled basal.
    pub const BASAL: Self = Self(0b001);
    /// Running temp basal.
    pub const TEMP_BASAL: Self = Self(0b010);
    /// Running bolus.
    pub const BOLUS: Self = Self(0b100);
    /// Everything except scheduled basal.
    pub const ALL_BUT_BASAL: Self = Self(0b110);
    /// All delivery.
    pub const ALL: Self = Self(0b111);

    /// Build from the raw wire bits.
    #[must_use]
    pub const fn from_raw(raw: u8) -> Self {
        Self(raw & 0b111)
    }

    /// Raw wire bits.
    #[must_use]
    pub const fn raw(self) -> u8 {
        self.0
    }

    /// Returns `true` if every bit of `other` is included.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns `true` if no bit is set.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

/// Schedule payload of a [`SetInsulinScheduleCommand`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsulinSchedule {
    /// Program the 24-hour basal table.
    Basal {
        /// Half-hour rate segments.
        segments: Vec<BasalRateSegment>,
    },
    /// Run a temporary rate for a bounded time.
    TempBasal {
        /// Duration in half-hour increments.
        half_hours: u8,
        /// Pulses to deliver per half hour.
        pulses_per_half_hour: u16,
    },
    /// Deliver a discrete bolus.
    Bolus {
        /// Total pulses to deliver.
        pulses: u16,
        /// Seconds between pulses.
        seconds_per_pulse: u8,
    },
}

impl InsulinSchedule {
    const SUBTYPE_BASAL: u8 = 0;
    const SUBTYPE_TEMP_BASAL: u8 = 1;
    const SUBTYPE_BOLUS: u8 = 2;

    /// Bolus schedule for an amount on pulse granularity.
    #[must_use]
    pub fn bolus(units: Units, seconds_per_pulse: u8) -> Self {
        Self::Bolus {
            pulses: pulses_u16(units),
            seconds_per_pulse,
        }
    }

    /// Temp basal schedule at `rate` units/hour for `half_hours` buckets.
    #[must_use]
    pub fn temp_basal(rate: Units, half_hours: u8) -> Self {
        Self::TempBasal {
            half_hours,
            pulses_per_half_hour: pulses_u16(Units::new(rate.as_f64() / 2.0)),
        }
    }

    /// Basal table schedule from a validated schedule.
    #[must_use]
    pub fn basal(schedule: &BasalSchedule) -> Self {
        Self::Basal {
            segments: basal_rate_segments(schedule),
        }
    }
}

/// One half-hour bucket row of the pod's basal table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BasalRateSegment {
    /// Index of the half-hour bucket this rate starts at (0..48).
    pub start_segment: u8,
    /// Pulses delivered per half hour from that bucket on.
    pub pulses_per_half_hour: u16,
}

/// Convert a schedule's entries to pod table rows.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn basal_rate_segments(schedule: &BasalSchedule) -> Vec<BasalRateSegment> {
    schedule
        .entries()
        .iter()
        .map(|entry| BasalRateSegment {
            start_segment: (entry.start_offset.num_seconds() / crate::basal::SECONDS_PER_SEGMENT)
                as u8,
            pulses_per_half_hour: pulses_u16(Units::new(entry.rate.as_f64() / 2.0)),
        })
        .collect()
}

/// Command programming a delivery schedule (basal, temp basal, or bolus).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetInsulinScheduleCommand {
    /// Authentication nonce.
    pub nonce: u32,
    /// Schedule payload.
    pub schedule: InsulinSchedule,
}

/// Companion block to a bolus schedule, carrying timing and reminders.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BolusExtraCommand {
    /// Bolus amount.
    pub units: Units,
    /// Seconds between pulses.
    pub seconds_per_pulse: u8,
    /// Whether the pod beeps when the bolus completes.
    pub acknowledgement_beep: bool,
    /// Interval for the programmed-bolus reminder, zero to disable.
    pub programmed_reminder: Duration,
}

/// Companion block to a temp basal schedule.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TempBasalExtraCommand {
    /// Rate in units per hour.
    pub rate: Units,
    /// Duration in half-hour increments.
    pub half_hours: u8,
    /// Whether the pod beeps when the temp basal completes.
    pub acknowledgement_beep: bool,
}

/// Companion block to a basal table program.
#[derive(Debug, Clone, PartialEq)]
pub struct BasalScheduleExtraCommand {
    /// Offset from midnight, pod-local, at which the table starts running.
    pub schedule_offset: Duration,
    /// Half-hour rate segments, mirroring the schedule command.
    pub segments: Vec<BasalRateSegment>,
    /// Whether the pod beeps on segment boundaries.
    pub acknowledgement_beep: bool,
}

/// Status query, optionally selecting a pod-info payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GetStatusCommand {
    /// Which payload to request.
    pub pod_info_type: PodInfoType,
}

/// Cancel one or more kinds of running delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancelDeliveryCommand {
    /// Authentication nonce.
    pub nonce: u32,
    /// Which delivery kinds to cancel.
    pub delivery_type: DeliveryType,
    /// Beep emitted with the cancellation.
    pub beep_type: BeepType,
}

/// Arm or disarm alert slots.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigureAlertsCommand {
    /// Authentication nonce.
    pub nonce: u32,
    /// Alert configurations, one per slot being touched.
    pub alerts: Vec<PodAlert>,
}

/// Acknowledge (silence) fired alert slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcknowledgeAlertCommand {
    /// Authentication nonce.
    pub nonce: u32,
    /// Slots to acknowledge.
    pub alerts: AlertSet,
}

/// Adjust the pod's internal fault configuration table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultConfigCommand {
    /// Authentication nonce.
    pub nonce: u32,
    /// Table 5 sub-entry 16 value.
    pub tab5_sub16: u8,
    /// Table 5 sub-entry 17 value.
    pub tab5_sub17: u8,
}

/// Configure confirmation beeps for delivery events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BeepConfigCommand {
    /// Beep pattern played immediately.
    pub beep_type: BeepType,
    /// Beep when a bolus completes.
    pub bolus_completion_beep: bool,
    /// Beep when a temp basal completes.
    pub temp_basal_completion_beep: bool,
    /// Beep when a basal segment starts.
    pub basal_start_beep: bool,
}

/// Permanently deactivate the pod.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeactivatePodCommand {
    /// Authentication nonce.
    pub nonce: u32,
}

/// Error block returned when the pod rejects a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorResponse {
    /// The command's nonce did not match the pod's generator; the payload is
    /// the sync word for reseeding.
    BadNonce {
        /// Sync word used to reseed the nonce generator.
        sync_word: u16,
    },
    /// The pod rejected the command for a reason that retrying will not fix.
    NonRetryable {
        /// Pod error code.
        code: u8,
        /// Fault code at the time of rejection, zero if none.
        fault_event_code: FaultEventCode,
        /// Pod lifecycle phase at the time of rejection.
        pod_progress: PodProgressStatus,
    },
}

impl ErrorResponse {
    const BAD_NONCE_CODE: u8 = 0x14;
}

/// One typed block of a pod message.
#[derive(Debug, Clone, PartialEq)]
#[allow(missing_docs)]
pub enum MessageBlock {
    SetInsulinSchedule(SetInsulinScheduleCommand),
    BolusExtra(BolusExtraCommand),
    TempBasalExtra(TempBasalExtraCommand),
    BasalScheduleExtra(BasalScheduleExtraCommand),
    GetStatus(GetStatusCommand),
    CancelDelivery(CancelDeliveryCommand),
    ConfigureAlerts(ConfigureAlertsCommand),
    AcknowledgeAlert(AcknowledgeAlertCommand),
    FaultConfig(FaultConfigCommand),
    BeepConfig(BeepConfigCommand),
    DeactivatePod(DeactivatePodCommand),
    StatusResponse(StatusResponse),
    PodInfoResponse(PodInfoResponse),
    ErrorResponse(ErrorResponse),
}

impl MessageBlock {
    /// This block's wire type.
    #[must_use]
    pub fn block_type(&self) -> MessageBlockType {
        match self {
            Self::SetInsulinSchedule(_) => MessageBlockType::SetInsulinSchedule,
            Self::BolusExtra(_) => MessageBlockType::BolusExtra,
            Self::TempBasalExtra(_) => MessageBlockType::TempBasalExtra,
            Self::BasalScheduleExtra(_) => MessageBlockType::BasalScheduleExtra,
            Self::GetStatus(_) => MessageBlockType::GetStatus,
            Self::CancelDelivery(_) => MessageBlockType::CancelDelivery,
            Self::ConfigureAlerts(_) => MessageBlockType::ConfigureAlerts,
            Self::AcknowledgeAlert(_) => MessageBlockType::AcknowledgeAlert,
            Self::FaultConfig(_) => MessageBlockType::FaultConfig,
            Self::BeepConfig(_) => MessageBlockType::BeepConfig,
            Self::DeactivatePod(_) => MessageBlockType::DeactivatePod,
            Self::StatusResponse(_) => MessageBlockType::StatusResponse,
            Self::PodInfoResponse(_) => MessageBlockType::PodInfoResponse,
            Self::ErrorResponse(_) => MessageBlockType::ErrorResponse,
        }
    }

    /// The nonce this block carries, if it is a nonce-bearing command.
    #[must_use]
    pub fn nonce(&self) -> Option<u32> {
        match self {
            Self::SetInsulinSchedule(c) => Some(c.nonce),
            Self::CancelDelivery(c) => Some(c.nonce),
            Self::ConfigureAlerts(c) => Some(c.nonce),
            Self::AcknowledgeAlert(c) => Some(c.nonce),
            Self::FaultConfig(c) => Some(c.nonce),
            Self::DeactivatePod(c) => Some(c.nonce),
            _ => None,
        }
    }

    /// Rewrite this block's nonce. No-op for blocks without one.
    pub fn set_nonce(&mut self, nonce: u32) {
        match self {
            Self::SetInsulinSchedule(c) => c.nonce = nonce,
            Self::CancelDelivery(c) => c.nonce = nonce,
            Self::ConfigureAlerts(c) => c.nonce = nonce,
            Self::AcknowledgeAlert(c) => c.nonce = nonce,
            Self::FaultConfig(c) => c.nonce = nonce,
            Self::DeactivatePod(c) => c.nonce = nonce,
            _ => {},
        }
    }

    /// Append `type ‖ length ‖ body` to `out`.
    #[allow(clippy::too_many_lines, clippy::cast_possible_truncation)]
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.block_type().raw());
        let len_at = out.len();
        out.push(0);
        match self {
            Self::SetInsulinSchedule(c) => {
                out.extend_from_slice(&c.nonce.to_be_bytes());
                match &c.schedule {
                    InsulinSchedule::Basal { segments } => {
                        out.push(InsulinSchedule::SUBTYPE_BASAL);
                        out.push(segments.len() as u8);
                        for segment in segments {
                            out.push(segment.start_segment);
                            out.extend_from_slice(&segment.pulses_per_half_hour.to_be_bytes());
                        }
                    },
                    InsulinSchedule::TempBasal {
                        half_hours,
                        pulses_per_half_hour,
                    } => {
                        out.push(InsulinSchedule::SUBTYPE_TEMP_BASAL);
                        out.push(*half_hours);
                        out.extend_from_slice(&pulses_per_half_hour.to_be_bytes());
                    },
                    InsulinSchedule::Bolus {
                        pulses,
                        seconds_per_pulse,
                    } => {
                        out.push(InsulinSchedule::SUBTYPE_BOLUS);
                        out.extend_from_slice(&pulses.to_be_bytes());
                        out.push(*seconds_per_pulse);
                    },
                }
            },
            Self::BolusExtra(c) => {
                out.extend_from_slice(&pulses_u16(c.units).to_be_bytes());
                out.push(c.seconds_per_pulse);
                out.push(u8::from(c.acknowledgement_beep));
                out.extend_from_slice(&minutes_u16(c.programmed_reminder).to_be_bytes());
            },
            Self::TempBasalExtra(c) => {
                out.extend_from_slice(&pulses_u16(c.rate).to_be_bytes());
                out.push(c.half_hours);
                out.push(u8::from(c.acknowledgement_beep));
            },
            Self::BasalScheduleExtra(c) => {
                let offset = c.schedule_offset.num_seconds().clamp(0, 86_399) as u32;
                out.extend_from_slice(&offset.to_be_bytes());
                out.push(u8::from(c.acknowledgement_beep));
                out.push(c.segments.len() as u8);
                for segment in &c.segments {
                    out.push(segment.start_segment);
                    out.extend_from_slice(&segment.pulses_per_half_hour.to_be_bytes());
                }
            },
            Self::GetStatus(c) => out.push(c.pod_info_type.raw()),
            Self::CancelDelivery(c) => {
                out.extend_from_slice(&c.nonce.to_be_bytes());
                out.push((c.beep_type.raw() << 4) | c.delivery_type.raw());
            },
            Self::ConfigureAlerts(c) => {
                out.extend_from_slice(&c.nonce.to_be_bytes());
                for alert in &c.alerts {
                    encode_alert(alert, out);
                }
            },
            Self::AcknowledgeAlert(c) => {
                out.extend_from_slice(&c.nonce.to_be_bytes());
                out.push(c.alerts.raw());
            },
            Self::FaultConfig(c) => {
                out.extend_from_slice(&c.nonce.to_be_bytes());
                out.push(c.tab5_sub16);
                out.push(c.tab5_sub17);
            },
            Self::BeepConfig(c) => {
                out.push(c.beep_type.raw());
                let mut flags = 0u8;
                if c.bolus_completion_beep {
                    flags |= 0b001;
                }
                if c.temp_basal_completion_beep {
                    flags |= 0b010;
                }
                if c.basal_start_beep {
                    flags |= 0b100;
                }
                out.push(flags);
            },
            Self::DeactivatePod(c) => out.extend_from_slice(&c.nonce.to_be_bytes()),
            Self::StatusResponse(r) => r.encode_body(out),
            Self::PodInfoResponse(r) => r.encode_body(out),
            Self::ErrorResponse(r) => match r {
                ErrorResponse::BadNonce { sync_word } => {
                    out.push(ErrorResponse::BAD_NONCE_CODE);
                    out.extend_from_slice(&sync_word.to_be_bytes());
                },
                ErrorResponse::NonRetryable {
                    code,
                    fault_event_code,
                    pod_progress,
                } => {
                    out.push(*code);
                    out.push(fault_event_code.0);
                    out.push(pod_progress.raw());
                },
            },
        }
        out[len_at] = (out.len() - len_at - 1) as u8;
    }

    /// Decode one block from the front of `data`; returns the block and the
    /// number of bytes consumed.
    pub fn decode_one(data: &[u8]) -> Result<(Self, usize), MessageError> {
        if data.len() < 2 {
            return Err(MessageError::NotEnoughData {
                needed: 2,
                available: data.len(),
            });
        }
        let block_type = MessageBlockType::from_raw(data[0])?;
        let body_len = usize::from(data[1]);
        let total = 2 + body_len;
        if data.len() < total {
            return Err(MessageError::NotEnoughData {
                needed: total,
                available: data.len(),
            });
        }
        let body = &data[2..total];
        let block = Self::decode_body(block_type, body)?;
        Ok((block, total))
    }

    #[allow(clippy::too_many_lines)]
    fn decode_body(block_type: MessageBlockType, body: &[u8]) -> Result<Self, MessageError> {
        let mut reader = Reader::new(body);
        let block = match block_type {
            MessageBlockType::SetInsulinSchedule => {
                let nonce = reader.read_u32()?;
                let schedule = match reader.read_u8()? {
                    InsulinSchedule::SUBTYPE_BASAL => {
                        let count = reader.read_u8()?;
                        let mut segments = Vec::with_capacity(usize::from(count));
                        for _ in 0..count {
                            segments.push(BasalRateSegment {
                                start_segment: reader.read_u8()?,
                                pulses_per_half_hour: reader.read_u16()?,
                            });
                        }
                        InsulinSchedule::Basal { segments }
                    },
                    InsulinSchedule::SUBTYPE_TEMP_BASAL => InsulinSchedule::TempBasal {
                        half_hours: reader.read_u8()?,
                        pulses_per_half_hour: reader.read_u16()?,
                    },
                    InsulinSchedule::SUBTYPE_BOLUS => InsulinSchedule::Bolus {
                        pulses: reader.read_u16()?,
                        seconds_per_pulse: reader.read_u8()?,
                    },
                    other => {
                        return Err(MessageError::InvalidField {
                            field: "insulin schedule subtype",
                            value: u32::from(other),
                        })
                    },
                };
                Self::SetInsulinSchedule(SetInsulinScheduleCommand { nonce, schedule })
            },
            MessageBlockType::BolusExtra => Self::BolusExtra(BolusExtraCommand {
                units: Units::from_pulses(u32::from(reader.read_u16()?)),
                seconds_per_pulse: reader.read_u8()?,
                acknowledgement_beep: reader.read_u8()? != 0,
                programmed_reminder: Duration::minutes(i64::from(reader.read_u16()?)),
            }),
            MessageBlockType::TempBasalExtra => Self::TempBasalExtra(TempBasalExtraCommand {
                rate: Units::from_pulses(u32::from(reader.read_u16()?)),
                half_hours: reader.read_u8()?,
                acknowledgement_beep: reader.read_u8()? != 0,
            }),
            MessageBlockType::BasalScheduleExtra => {
                let offset = reader.read_u32()?;
                let acknowledgement_beep = reader.read_u8()? != 0;
                let count = reader.read_u8()?;
                let mut segments = Vec::with_capacity(usize::from(count));
                for _ in 0..count {
                    segments.push(BasalRateSegment {
                        start_segment: reader.read_u8()?,
                        pulses_per_half_hour: reader.read_u16()?,
                    });
                }
                Self::BasalScheduleExtra(BasalScheduleExtraCommand {
                    schedule_offset: Duration::seconds(i64::from(offset)),
                    segments,
                    acknowledgement_beep,
                })
            },
            MessageBlockType::GetStatus => Self::GetStatus(GetStatusCommand {
                pod_info_type: PodInfoType::from_raw(reader.read_u8()?)?,
            }),
            MessageBlockType::CancelDelivery => {
                let nonce = reader.read_u32()?;
                let packed = reader.read_u8()?;
                let beep_type = BeepType::from_raw(packed >> 4).ok_or({
                    MessageError::InvalidField {
                        field: "beep type",
                        value: u32::from(packed >> 4),
                    }
                })?;
                Self::CancelDelivery(CancelDeliveryCommand {
                    nonce,
                    delivery_type: DeliveryType::from_raw(packed),
                    beep_type,
                })
            },
            MessageBlockType::ConfigureAlerts => {
                let nonce = reader.read_u32()?;
                let mut alerts = Vec::new();
                while !reader.is_empty() {
                    alerts.push(decode_alert(&mut reader)?);
                }
                Self::ConfigureAlerts(ConfigureAlertsCommand { nonce, alerts })
            },
            MessageBlockType::AcknowledgeAlert => Self::AcknowledgeAlert(AcknowledgeAlertCommand {
                nonce: reader.read_u32()?,
                alerts: AlertSet::from_raw(reader.read_u8()?),
            }),
            MessageBlockType::FaultConfig => Self::FaultConfig(FaultConfigCommand {
                nonce: reader.read_u32()?,
                tab5_sub16: reader.read_u8()?,
                tab5_sub17: reader.read_u8()?,
            }),
            MessageBlockType::BeepConfig => {
                let beep_type = reader.read_u8()?;
                let flags = reader.read_u8()?;
                Self::BeepConfig(BeepConfigCommand {
                    beep_type: BeepType::from_raw(beep_type).ok_or({
                        MessageError::InvalidField {
                            field: "beep type",
                            value: u32::from(beep_type),
                        }
                    })?,
                    bolus_completion_beep: flags & 0b001 != 0,
                    temp_basal_completion_beep: flags & 0b010 != 0,
                    basal_start_beep: flags & 0b100 != 0,
                })
            },
            MessageBlockType::DeactivatePod => Self::DeactivatePod(DeactivatePodCommand {
                nonce: reader.read_u32()?,
            }),
            MessageBlockType::StatusResponse => {
                Self::StatusResponse(StatusResponse::decode_body(body)?)
            },
            MessageBlockType::PodInfoResponse => {
                Self::PodInfoResponse(PodInfoResponse::decode_body(body)?)
            },
            MessageBlockType::ErrorResponse => {
                let code = reader.read_u8()?;
                if code == ErrorResponse::BAD_NONCE_CODE {
                    Self::ErrorResponse(ErrorResponse::BadNonce {
                        sync_word: reader.read_u16()?,
                    })
                } else {
                    Self::ErrorResponse(ErrorResponse::NonRetryable {
                        code,
                        fault_event_code: FaultEventCode(reader.read_u8()?),
                        pod_progress: PodProgressStatus::from_raw(reader.read_u8()?)?,
                    })
                }
            },
        };
        Ok(block)
    }
}

fn encode_alert(alert: &PodAlert, out: &mut Vec<u8>) {
    let (trigger_is_reservoir, trigger_value) = match alert.trigger {
        AlertTrigger::TimeFromActivation(time) => (false, minutes_u16(time)),
        AlertTrigger::ReservoirVolume(units) => (true, pulses_u16(units)),
    };
    out.push(
        (alert.slot.index() << 4)
            | (u8::from(alert.active) << 3)
            | (u8::from(alert.auto_off) << 2)
            | (u8::from(trigger_is_reservoir) << 1),
    );
    out.extend_from_slice(&trigger_value.to_be_bytes());
    out.extend_from_slice(&minutes_u16(alert.duration).to_be_bytes());
    out.push(alert.beep.raw());
}

fn decode_alert(reader: &mut Reader<'_>) -> Result<PodAlert, MessageError> {
    let packed = reader.read_u8()?;
    let trigger_value = reader.read_u16()?;
    let duration = reader.read_u16()?;
    let beep_raw = reader.read_u8()?;
    let slot = AlertSlot::from_index(packed >> 4).ok_or(MessageError::InvalidField {
        field: "alert slot",
        value: u32::from(packed >> 4),
    })?;
    let trigger = if packed & 0b010 != 0 {
        AlertTrigger::ReservoirVolume(Units::from_pulses(u32::from(trigger_value)))
    } else {
        AlertTrigger::TimeFromActivation(Duration::minutes(i64::from(trigger_value)))
    };
    Ok(PodAlert {
        slot,
        active: packed & 0b1000 != 0,
        auto_off: packed & 0b100 != 0,
        trigger,
        duration: Duration::minutes(i64::from(duration)),
        beep: BeepType::from_raw(beep_raw).ok_or(MessageError::InvalidField {
            field: "beep type",
            value: u32::from(beep_raw),
        })?,
    })
}

/// Bounds-checked big-endian reader over a block body.
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], MessageError> {
        if self.data.len() - self.pos < n {
            return Err(MessageError::NotEnoughData {
                needed: self.pos + n,
                available: self.data.len(),
            });
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn read_u8(&mut self) -> Result<u8, MessageError> {
        Ok(self.take(1)?[0])
    }

    fn read_u16(&mut self) -> Result<u16, MessageError> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn read_u32(&mut self) -> Result<u32, MessageError> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }
}
