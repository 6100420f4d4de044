//! Setup sequencing: prime, initial basal program, cannula insertion.
//!
//! Every entry point is idempotent against lost confirmations: when the
//! controller-side progress says a prior attempt may have succeeded without
//! us seeing the reply, the pod's own progress is polled first and the
//! command is only reissued if the pod disagrees.

use chrono::{Duration, Utc};

use super::PodSession;
use crate::alerts::PodAlert;
use crate::basal::BasalSchedule;
use crate::consts;
use crate::error::PodCommsError;
use crate::pod_state::SetupProgress;
use crate::protocol::{
    BolusExtraCommand, InsulinSchedule, MessageBlock, PodProgressStatus,
    SetInsulinScheduleCommand, StatusResponse,
};
use crate::transport::MessageTransport;
use crate::units::Units;

impl<T: MessageTransport> PodSession<T> {
    /// Start the prime bolus; returns the estimated wait until priming
    /// finishes.
    ///
    /// Safe to reissue: a pod already priming is detected by status poll
    /// and the remaining wait is returned without re-commanding.
    pub fn prime(&mut self) -> Result<Duration, PodCommsError> {
        if self.state.setup_progress < SetupProgress::StartingPrime {
            // Disarm the fault family that trips on slow pairing, then arm
            // the finish-setup reminder, before any fluid moves. More setup
            // commands follow immediately, so the idle alarm is held off.
            self.fault_config(0, 0, true)?;
            self.configure_alerts(&[PodAlert::finish_setup_reminder()])?;
            self.mutate(|state| state.advance_setup_progress(SetupProgress::PodConfigured));
        } else if self.state.setup_progress == SetupProgress::StartingPrime {
            // The prime command may have gone through without us seeing the
            // confirmation; believe the pod.
            let status = self.get_status()?;
            if matches!(
                status.pod_progress,
                PodProgressStatus::Priming | PodProgressStatus::PrimingCompleted
            ) {
                self.mutate(|state| state.advance_setup_progress(SetupProgress::Priming));
                return Ok(self.remaining_prime_time());
            }
        } else {
            return Ok(self.remaining_prime_time());
        }

        let finish_time = Utc::now() + consts::prime_duration();
        self.mutate(|state| {
            state.prime_finish_time = Some(finish_time);
            state.advance_setup_progress(SetupProgress::StartingPrime);
        });
        self.setup_bolus(consts::PRIME_UNITS)?;
        self.mutate(|state| state.advance_setup_progress(SetupProgress::Priming));
        Ok(consts::prime_duration())
    }

    fn remaining_prime_time(&self) -> Duration {
        self.state
            .prime_finish_time
            .map_or_else(consts::prime_duration, |finish| {
                (finish - Utc::now()).max(Duration::zero())
            })
    }

    /// Program the initial basal schedule.
    ///
    /// Safe to reissue: if a prior attempt's confirmation was lost and the
    /// pod already reports its basal initialized, the command is skipped.
    pub fn program_initial_basal_schedule(
        &mut self,
        schedule: &BasalSchedule,
        schedule_offset: Duration,
    ) -> Result<(), PodCommsError> {
        if self.state.setup_progress == SetupProgress::SettingInitialBasalSchedule {
            let status = self.get_status()?;
            if status.pod_progress >= PodProgressStatus::BasalInitialized {
                self.mutate(|state| {
                    state.advance_setup_progress(SetupProgress::InitialBasalScheduleSet);
                });
                return Ok(());
            }
        }

        self.mutate(|state| {
            state.advance_setup_progress(SetupProgress::SettingInitialBasalSchedule);
        });
        self.set_basal_schedule(schedule, schedule_offset, false)?;
        self.mutate(|state| {
            state.advance_setup_progress(SetupProgress::InitialBasalScheduleSet);
        });
        Ok(())
    }

    /// Start cannula insertion; returns the estimated wait until the
    /// insertion bolus finishes.
    ///
    /// Requires an activated pod. Safe to reissue: a pod already inserting
    /// (or done) is detected by status poll.
    pub fn insert_cannula(&mut self) -> Result<Duration, PodCommsError> {
        if self.state.activated_at.is_none() {
            return Err(PodCommsError::NoPodPaired);
        }
        let insertion_wait = Duration::seconds(
            i64::from(consts::CANNULA_INSERTION_UNITS.pulses())
                * i64::from(consts::SECONDS_PER_PRIME_PULSE),
        );

        if matches!(
            self.state.setup_progress,
            SetupProgress::StartingInsertCannula | SetupProgress::CannulaInserting
        ) {
            let status = self.get_status()?;
            if status.pod_progress.ready_for_delivery() {
                self.mark_setup_complete();
                return Ok(Duration::zero());
            }
            if status.pod_progress == PodProgressStatus::InsertingCannula {
                self.mutate(|state| {
                    state.advance_setup_progress(SetupProgress::CannulaInserting);
                });
                return Ok(insertion_wait);
            }
        }

        // Arm the lifecycle alarms before the pod goes on the body.
        let expiration_advisory = PodAlert::expiration_advisory(
            consts::nominal_pod_life(),
            consts::expiration_advisory_window(),
        );
        let shutdown_imminent = PodAlert::shutdown_imminent(
            consts::service_duration() - consts::end_of_service_imminent_window(),
        );
        self.configure_alerts(&[expiration_advisory, shutdown_imminent])?;

        self.mutate(|state| {
            state.advance_setup_progress(SetupProgress::StartingInsertCannula);
        });
        self.setup_bolus(consts::CANNULA_INSERTION_UNITS)?;
        self.mutate(|state| state.advance_setup_progress(SetupProgress::CannulaInserting));
        Ok(insertion_wait)
    }

    /// Poll whether cannula insertion finished; marks setup complete when
    /// the pod reports itself ready for delivery.
    pub fn check_insertion_completed(&mut self) -> Result<bool, PodCommsError> {
        let status = self.get_status()?;
        if status.pod_progress.ready_for_delivery() {
            self.mark_setup_complete();
            return Ok(true);
        }
        Ok(false)
    }

    /// Mark setup complete and stash the delivery-counter baseline, so
    /// setup boluses are excluded from therapy bookkeeping.
    fn mark_setup_complete(&mut self) {
        self.mutate(|state| {
            state.advance_setup_progress(SetupProgress::Completed);
            if state.setup_units_delivered.is_none() {
                state.setup_units_delivered = state
                    .last_insulin_measurements
                    .map(|measurements| measurements.delivered);
            }
        });
    }

    /// Issue a setup-phase bolus (prime or cannula fill) at the 1-second
    /// pulse cadence.
    fn setup_bolus(&mut self, units: Units) -> Result<StatusResponse, PodCommsError> {
        let blocks = vec![
            MessageBlock::SetInsulinSchedule(SetInsulinScheduleCommand {
                nonce: 0,
                schedule: InsulinSchedule::bolus(units, consts::SECONDS_PER_PRIME_PULSE),
            }),
            MessageBlock::BolusExtra(BolusExtraCommand {
                units,
                seconds_per_pulse: consts::SECONDS_PER_PRIME_PULSE,
                acknowledgement_beep: false,
                programmed_reminder: Duration::zero(),
            }),
        ];
        self.exchange::<StatusResponse>(blocks, false)
    }
}
