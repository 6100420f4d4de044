//! Delivery operations: bolus, temp basal, cancel, schedule, status,
//! deactivation.
//!
//! Dosing operations never return a bare `Err`: their outcome is the
//! three-valued [`DeliveryCommandResult`], making the distinction between
//! "certainly not delivered" and "may have been delivered" explicit at
//! every call site. Schedule and status operations return `Result` and are
//! safe to reissue.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, FixedOffset, Timelike, Utc};

use super::PodSession;
use crate::alerts::{AlertSet, AlertSlot, BeepType, PodAlert};
use crate::basal::BasalSchedule;
use crate::consts;
use crate::dose::ScheduledCertainty;
use crate::error::PodCommsError;
use crate::pod_state::SuspendState;
use crate::protocol::{
    basal_rate_segments, AcknowledgeAlertCommand, BasalScheduleExtraCommand, BeepConfigCommand,
    BolusExtraCommand, CancelDeliveryCommand, ConfigureAlertsCommand, DeactivatePodCommand,
    DeliveryType, FaultConfigCommand, GetStatusCommand, InsulinSchedule, MessageBlock,
    PodInfoResponse, PodInfoType, SetInsulinScheduleCommand, StatusResponse,
    TempBasalExtraCommand,
};
use crate::transport::MessageTransport;
use crate::units::Units;

/// Outcome of a dosing command.
///
/// `CertainFailure` means the command did not take effect; the dose was not
/// delivered and no ledger record remains. `UncertainFailure` means the
/// command may have reached the pod; an uncertain ledger record is kept for
/// reconciliation against a later status response.
#[derive(Debug)]
pub enum DeliveryCommandResult {
    /// The pod confirmed the command.
    Success {
        /// Status returned with the confirmation.
        status: StatusResponse,
    },
    /// The command certainly did not take effect.
    CertainFailure {
        /// Underlying error.
        error: PodCommsError,
    },
    /// The command's outcome is unknown pending reconciliation.
    UncertainFailure {
        /// Underlying error.
        error: PodCommsError,
    },
}

/// Outcome of a cancel-delivery command, with the same certainty semantics
/// as [`DeliveryCommandResult`].
#[derive(Debug)]
pub enum CancelDeliveryResult {
    /// The pod confirmed the cancellation.
    Success {
        /// Status returned with the confirmation.
        status: StatusResponse,
    },
    /// The cancellation certainly did not take effect.
    CertainFailure {
        /// Underlying error.
        error: PodCommsError,
    },
    /// The cancellation's outcome is unknown.
    UncertainFailure {
        /// Underlying error.
        error: PodCommsError,
    },
}

impl<T: MessageTransport> PodSession<T> {
    /// Deliver a bolus of `units`.
    ///
    /// On a transport failure the session polls the pod once: if the pod
    /// reports bolusing the command is treated as a confirmed success, if
    /// it denies bolusing the failure is certain, and if the poll itself
    /// fails an uncertain bolus is recorded for later reconciliation.
    pub fn bolus(
        &mut self,
        units: Units,
        acknowledgement_beep: bool,
        programmed_reminder: Duration,
    ) -> DeliveryCommandResult {
        if let Some(record) = self.state.fault {
            return DeliveryCommandResult::CertainFailure {
                error: PodCommsError::PodFault(record),
            };
        }
        if self.state.doses.unfinalized_bolus.is_some() {
            return DeliveryCommandResult::CertainFailure {
                error: PodCommsError::UnfinalizedBolus,
            };
        }

        let duration = bolus_duration(units);
        let blocks = vec![
            MessageBlock::SetInsulinSchedule(SetInsulinScheduleCommand {
                nonce: 0,
                schedule: InsulinSchedule::bolus(units, consts::SECONDS_PER_BOLUS_PULSE),
            }),
            MessageBlock::BolusExtra(BolusExtraCommand {
                units,
                seconds_per_pulse: consts::SECONDS_PER_BOLUS_PULSE,
                acknowledgement_beep,
                programmed_reminder,
            }),
        ];

        match self.exchange::<StatusResponse>(blocks, false) {
            Ok(status) => {
                self.record_bolus(units, duration, ScheduledCertainty::Certain, true);
                DeliveryCommandResult::Success { status }
            },
            Err(error @ PodCommsError::CommsError(_)) => self.verify_bolus(units, duration, error),
            // Only a transport failure is uncertain. Every other error means
            // the exchange resolved (rejection, fault, or a reply that was
            // discarded without touching state): no dose was started.
            Err(error) => DeliveryCommandResult::CertainFailure { error },
        }
    }

    /// Resolve an ambiguous bolus command with one status poll.
    fn verify_bolus(
        &mut self,
        units: Units,
        duration: Duration,
        error: PodCommsError,
    ) -> DeliveryCommandResult {
        match self.get_status() {
            Ok(status) if status.delivery_status.bolusing() => {
                tracing::info!("bolus confirmed by status poll after transport failure");
                self.record_bolus(units, duration, ScheduledCertainty::Certain, true);
                DeliveryCommandResult::Success { status }
            },
            Ok(_) => DeliveryCommandResult::CertainFailure { error },
            Err(poll_error) => {
                tracing::warn!(%poll_error, "bolus verification poll failed; recording uncertain");
                self.record_bolus(units, duration, ScheduledCertainty::Uncertain, false);
                DeliveryCommandResult::UncertainFailure { error }
            },
        }
    }

    /// Record a bolus in the ledger. Confirmed boluses are backdated by the
    /// comms offset: delivery began before the command call returned.
    fn record_bolus(
        &mut self,
        units: Units,
        duration: Duration,
        certainty: ScheduledCertainty,
        confirmed: bool,
    ) {
        let start = if confirmed {
            Utc::now() + consts::bolus_comms_offset()
        } else {
            Utc::now()
        };
        self.mutate(|state| {
            if let Err(error) = state.doses.record_bolus(units, start, duration, certainty) {
                tracing::warn!(%error, "bolus record not stored");
            }
        });
    }

    /// Run a temp basal at `rate` units/hour for `duration`.
    ///
    /// Unlike boluses, an ambiguous outcome is never auto-verified; the
    /// uncertain record waits for the next status response.
    pub fn set_temp_basal(
        &mut self,
        rate: Units,
        duration: Duration,
        acknowledgement_beep: bool,
    ) -> DeliveryCommandResult {
        if let Some(record) = self.state.fault {
            return DeliveryCommandResult::CertainFailure {
                error: PodCommsError::PodFault(record),
            };
        }
        let now = Utc::now();
        if self
            .state
            .doses
            .unfinalized_bolus
            .as_ref()
            .is_some_and(|bolus| !bolus.is_finished(now))
        {
            return DeliveryCommandResult::CertainFailure {
                error: PodCommsError::UnfinalizedBolus,
            };
        }
        if self
            .state
            .doses
            .unfinalized_temp_basal
            .as_ref()
            .is_some_and(|temp_basal| !temp_basal.is_finished(now))
        {
            return DeliveryCommandResult::CertainFailure {
                error: PodCommsError::UnfinalizedTempBasal,
            };
        }

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let half_hours = (duration.num_minutes() / 30).clamp(1, 24) as u8;
        let blocks = vec![
            MessageBlock::SetInsulinSchedule(SetInsulinScheduleCommand {
                nonce: 0,
                schedule: InsulinSchedule::temp_basal(rate, half_hours),
            }),
            MessageBlock::TempBasalExtra(TempBasalExtraCommand {
                rate,
                half_hours,
                acknowledgement_beep,
            }),
        ];

        match self.exchange::<StatusResponse>(blocks, false) {
            Ok(status) => {
                self.mutate(|state| {
                    if let Err(error) = state.doses.record_temp_basal(
                        rate,
                        Utc::now(),
                        duration,
                        ScheduledCertainty::Certain,
                    ) {
                        tracing::warn!(%error, "temp basal record not stored");
                    }
                });
                DeliveryCommandResult::Success { status }
            },
            Err(error @ PodCommsError::CommsError(_)) => {
                self.mutate(|state| {
                    if let Err(record_error) = state.doses.record_temp_basal(
                        rate,
                        Utc::now(),
                        duration,
                        ScheduledCertainty::Uncertain,
                    ) {
                        tracing::warn!(%record_error, "uncertain temp basal record not stored");
                    }
                });
                DeliveryCommandResult::UncertainFailure { error }
            },
            Err(error) => DeliveryCommandResult::CertainFailure { error },
        }
    }

    /// Cancel the delivery kinds named in `delivery_type`.
    ///
    /// When everything is cancelled with an audible beep, two cancel blocks
    /// go out in one message (a silent all-but-basal followed by a beeping
    /// basal) so the pod emits one beep sequence instead of three.
    pub fn cancel_delivery(
        &mut self,
        delivery_type: DeliveryType,
        beep_type: BeepType,
    ) -> CancelDeliveryResult {
        if let Some(record) = self.state.fault {
            return CancelDeliveryResult::CertainFailure {
                error: PodCommsError::PodFault(record),
            };
        }

        let blocks = if beep_type != BeepType::NoBeep && delivery_type == DeliveryType::ALL {
            vec![
                MessageBlock::CancelDelivery(CancelDeliveryCommand {
                    nonce: 0,
                    delivery_type: DeliveryType::ALL_BUT_BASAL,
                    beep_type: BeepType::NoBeep,
                }),
                MessageBlock::CancelDelivery(CancelDeliveryCommand {
                    nonce: 0,
                    delivery_type: DeliveryType::BASAL,
                    beep_type,
                }),
            ]
        } else {
            vec![MessageBlock::CancelDelivery(CancelDeliveryCommand {
                nonce: 0,
                delivery_type,
                beep_type,
            })]
        };

        match self.exchange::<StatusResponse>(blocks, false) {
            Ok(status) => {
                let bolus_not_delivered = delivery_type
                    .contains(DeliveryType::BOLUS)
                    .then_some(status.bolus_not_delivered);
                self.mutate(|state| {
                    state.handle_cancel_dosing(delivery_type, bolus_not_delivered, Utc::now());
                });
                CancelDeliveryResult::Success { status }
            },
            Err(error @ PodCommsError::CommsError(_)) => {
                CancelDeliveryResult::UncertainFailure { error }
            },
            Err(error) => CancelDeliveryResult::CertainFailure { error },
        }
    }

    /// Program the basal schedule, resuming scheduled delivery.
    ///
    /// On success a certain resume is recorded; on a transport failure an
    /// uncertain resume is recorded before the error propagates.
    pub fn set_basal_schedule(
        &mut self,
        schedule: &BasalSchedule,
        schedule_offset: Duration,
        acknowledgement_beep: bool,
    ) -> Result<StatusResponse, PodCommsError> {
        let blocks = vec![
            MessageBlock::SetInsulinSchedule(SetInsulinScheduleCommand {
                nonce: 0,
                schedule: InsulinSchedule::basal(schedule),
            }),
            MessageBlock::BasalScheduleExtra(BasalScheduleExtraCommand {
                schedule_offset,
                segments: basal_rate_segments(schedule),
                acknowledgement_beep,
            }),
        ];

        match self.exchange::<StatusResponse>(blocks, false) {
            Ok(status) => {
                let now = Utc::now();
                self.mutate(|state| {
                    if let Err(error) =
                        state.doses.record_resume(now, ScheduledCertainty::Certain)
                    {
                        tracing::warn!(%error, "resume record not stored");
                    }
                    state.suspend_state = SuspendState::Resumed { at: now };
                    state.doses.pair_suspend_resume();
                });
                Ok(status)
            },
            Err(error @ PodCommsError::CommsError(_)) => {
                self.mutate(|state| {
                    if let Err(record_error) = state
                        .doses
                        .record_resume(Utc::now(), ScheduledCertainty::Uncertain)
                    {
                        tracing::warn!(%record_error, "uncertain resume record not stored");
                    }
                });
                Err(error)
            },
            Err(error) => Err(error),
        }
    }

    /// No-op cancel: reads status without touching delivery, and validates
    /// the nonce schedule along the way.
    pub fn cancel_none(&mut self) -> Result<StatusResponse, PodCommsError> {
        let blocks = vec![MessageBlock::CancelDelivery(CancelDeliveryCommand {
            nonce: 0,
            delivery_type: DeliveryType::NONE,
            beep_type: BeepType::NoBeep,
        })];
        self.exchange::<StatusResponse>(blocks, false)
    }

    /// Read the pod's status. State is updated from the response before it
    /// is returned.
    pub fn get_status(&mut self) -> Result<StatusResponse, PodCommsError> {
        if self.use_cancel_none_for_status {
            return self.cancel_none();
        }
        let blocks = vec![MessageBlock::GetStatus(GetStatusCommand {
            pod_info_type: PodInfoType::NormalStatus,
        })];
        self.exchange::<StatusResponse>(blocks, false)
    }

    /// Read a pod-info payload without interpreting it.
    pub fn read_pod_info(
        &mut self,
        pod_info_type: PodInfoType,
    ) -> Result<PodInfoResponse, PodCommsError> {
        let blocks = vec![MessageBlock::GetStatus(GetStatusCommand { pod_info_type })];
        self.exchange::<PodInfoResponse>(blocks, false)
    }

    /// Read the pod's detailed status.
    ///
    /// A fault seen here is captured (dosing cleaned up once) but not
    /// thrown: the call intentionally reports the faulted status to the
    /// caller.
    pub fn get_detailed_status(&mut self) -> Result<crate::protocol::DetailedStatus, PodCommsError> {
        let response = self.read_pod_info(PodInfoType::DetailedStatus)?;
        let Some(detailed) = response.detailed_status().copied() else {
            return Err(PodCommsError::UnexpectedResponse(
                crate::protocol::MessageBlockType::PodInfoResponse,
            ));
        };
        let now = Utc::now();
        self.mutate(|state| {
            if detailed.is_faulted() && state.fault.is_none() {
                state.register_fault(&detailed, now);
            } else {
                state.update_from_detailed_status_response(&detailed, now);
            }
        });
        Ok(detailed)
    }

    /// Arm alert slots and mirror the configuration into the state.
    pub fn configure_alerts(
        &mut self,
        alerts: &[PodAlert],
    ) -> Result<StatusResponse, PodCommsError> {
        let blocks = vec![MessageBlock::ConfigureAlerts(ConfigureAlertsCommand {
            nonce: 0,
            alerts: alerts.to_vec(),
        })];
        let status = self.exchange::<StatusResponse>(blocks, false)?;
        self.mutate(|state| state.record_configured_alerts(alerts));
        Ok(status)
    }

    /// Acknowledge fired alerts; returns the configuration of the slots the
    /// pod still reports active after the ack.
    pub fn acknowledge_alerts(
        &mut self,
        alerts: AlertSet,
    ) -> Result<BTreeMap<AlertSlot, PodAlert>, PodCommsError> {
        let blocks = vec![MessageBlock::AcknowledgeAlert(AcknowledgeAlertCommand {
            nonce: 0,
            alerts,
        })];
        self.exchange::<StatusResponse>(blocks, false)?;
        let still_active = self.state.active_alert_slots;
        Ok(self
            .state
            .configured_alerts
            .iter()
            .filter(|(slot, _)| still_active.contains(**slot))
            .map(|(slot, alert)| (*slot, *alert))
            .collect())
    }

    /// Move the pod's schedule clock to a new time zone: delivery is fully
    /// cancelled (any failure propagates), then the schedule is reprogrammed
    /// at the new zone's offset from midnight.
    pub fn set_time(
        &mut self,
        time_zone: FixedOffset,
        schedule: &BasalSchedule,
        date: DateTime<Utc>,
        acknowledgement_beep: bool,
    ) -> Result<StatusResponse, PodCommsError> {
        match self.cancel_delivery(DeliveryType::ALL, BeepType::NoBeep) {
            CancelDeliveryResult::Success { .. } => {},
            CancelDeliveryResult::CertainFailure { error }
            | CancelDeliveryResult::UncertainFailure { error } => return Err(error),
        }
        let local = date.with_timezone(&time_zone);
        let offset = Duration::seconds(i64::from(local.num_seconds_from_midnight()));
        self.set_basal_schedule(schedule, offset, acknowledgement_beep)
    }

    /// Deactivate the pod.
    ///
    /// A running pod has its delivery cancelled first (failures propagate).
    /// A faulted pod gets a best-effort pulse-log read for the postmortem.
    /// The final deactivate tolerates the pod faulting or going silent
    /// mid-command, since it may self-terminate while processing it.
    pub fn deactivate_pod(&mut self) -> Result<(), PodCommsError> {
        if self.state.setup_progress.is_complete()
            && !self.state.is_faulted()
            && !self.state.is_suspended()
        {
            match self.cancel_delivery(DeliveryType::ALL, BeepType::NoBeep) {
                CancelDeliveryResult::Success { .. } => {},
                CancelDeliveryResult::CertainFailure { error }
                | CancelDeliveryResult::UncertainFailure { error } => return Err(error),
            }
        }

        if self.state.is_faulted() {
            match self.read_pod_info(PodInfoType::PulseLogRecent) {
                Ok(response) => tracing::info!(?response, "pulse log read for fault postmortem"),
                Err(error) => {
                    tracing::warn!(%error, "pulse log read failed; continuing deactivation");
                },
            }
        }

        let blocks = vec![MessageBlock::DeactivatePod(DeactivatePodCommand {
            nonce: 0,
        })];
        match self.exchange::<StatusResponse>(blocks, false) {
            Ok(_) => Ok(()),
            // The pod may fault or answer with an unexpected block as it
            // shuts itself down. An activation-timeout fault still
            // propagates: the caller must learn the pod never activated.
            Err(PodCommsError::PodFault(_) | PodCommsError::UnexpectedResponse(_)) => Ok(()),
            Err(error) => Err(error),
        }
    }

    /// Configure which delivery events the pod confirms with a beep.
    pub fn beep_config(
        &mut self,
        beep_type: BeepType,
        bolus_completion_beep: bool,
        temp_basal_completion_beep: bool,
        basal_start_beep: bool,
    ) -> Result<StatusResponse, PodCommsError> {
        let blocks = vec![MessageBlock::BeepConfig(BeepConfigCommand {
            beep_type,
            bolus_completion_beep,
            temp_basal_completion_beep,
            basal_start_beep,
        })];
        self.exchange::<StatusResponse>(blocks, false)
    }

    /// Set up the pod's internal fault configuration table. Used during
    /// pairing to disable the fault family that would otherwise trip on a
    /// slow setup; `expect_follow_on` tells the pod another command arrives
    /// shortly, holding off its command idle alarm.
    pub(crate) fn fault_config(
        &mut self,
        tab5_sub16: u8,
        tab5_sub17: u8,
        expect_follow_on: bool,
    ) -> Result<StatusResponse, PodCommsError> {
        let blocks = vec![MessageBlock::FaultConfig(FaultConfigCommand {
            nonce: 0,
            tab5_sub16,
            tab5_sub17,
        })];
        self.exchange::<StatusResponse>(blocks, expect_follow_on)
    }
}

/// Wall time a bolus takes to deliver at the normal pulse cadence.
pub(crate) fn bolus_duration(units: Units) -> Duration {
    Duration::seconds(i64::from(units.pulses()) * i64::from(consts::SECONDS_PER_BOLUS_PULSE))
}
