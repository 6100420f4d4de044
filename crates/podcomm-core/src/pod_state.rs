//! Authoritative controller-side mirror of a pod.
//!
//! [`PodState`] is the single persisted unit of session state: identity,
//! setup progress, alert configuration, suspend state, the dose ledger, the
//! nonce generator, and the first captured fault. All mutation goes through
//! the owning session; this module owns the rules for how status responses
//! are folded in.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;

use crate::alerts::{AlertSet, AlertSlot, PodAlert};
use crate::consts;
use crate::dose::DoseLedger;
use crate::fault::FaultRecord;
use crate::nonce::NonceState;
use crate::protocol::{DeliveryStatus, DeliveryType, DetailedStatus, StatusResponse};
use crate::units::Units;

/// Ordered controller-side setup phases, from pairing to ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SetupProgress {
    /// The pod accepted its radio address.
    AddressAssigned,
    /// Versions and identifiers read; pod configured for setup.
    PodConfigured,
    /// Prime command issued, confirmation pending.
    StartingPrime,
    /// Pod confirmed it is priming.
    Priming,
    /// Initial basal program issued, confirmation pending.
    SettingInitialBasalSchedule,
    /// Pod confirmed the initial basal program.
    InitialBasalScheduleSet,
    /// Cannula insertion issued, confirmation pending.
    StartingInsertCannula,
    /// Pod confirmed it is inserting the cannula.
    CannulaInserting,
    /// Setup complete; pod is delivering.
    Completed,
    /// The pod's activation window lapsed before setup finished. Terminal.
    ActivationTimeout,
}

impl SetupProgress {
    /// Returns `true` once the pod finished setup.
    #[must_use]
    pub fn is_complete(self) -> bool {
        self == Self::Completed
    }
}

/// Whether scheduled delivery is currently suspended, and since when.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum SuspendState {
    /// All delivery suspended.
    Suspended {
        /// When the suspension took effect.
        at: DateTime<Utc>,
    },
    /// Scheduled delivery running.
    Resumed {
        /// When delivery (re)started.
        at: DateTime<Utc>,
    },
}

impl SuspendState {
    /// Returns `true` while delivery is suspended.
    #[must_use]
    pub fn is_suspended(self) -> bool {
        matches!(self, Self::Suspended { .. })
    }
}

/// Legacy state blobs stored a bare `suspended` boolean; restore it as a
/// transition stamped with the restore time, the closest value available.
fn suspend_state_compat<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<SuspendState, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Compat {
        Current(SuspendState),
        Legacy(bool),
    }

    Ok(match Compat::deserialize(deserializer)? {
        Compat::Current(state) => state,
        Compat::Legacy(true) => SuspendState::Suspended { at: Utc::now() },
        Compat::Legacy(false) => SuspendState::Resumed { at: Utc::now() },
    })
}

/// Snapshot of the pod's cumulative delivery counters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InsulinMeasurements {
    /// Cumulative units delivered since activation.
    pub delivered: Units,
    /// Reservoir level, if low enough for the pod to measure.
    pub reservoir_level: Option<Units>,
    /// When the pod reported these numbers.
    pub validated_at: DateTime<Utc>,
}

/// Radio-layer counters the session persists across restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MessageTransportState {
    /// Next packet number.
    pub packet_number: u8,
    /// Next message sequence number.
    pub message_number: u8,
}

/// The persisted state of one pod.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PodState {
    /// Radio address assigned at pairing; immutable for the pod's life.
    pub address: u32,
    /// PI firmware version string reported by the pod.
    pub pi_version: String,
    /// PM firmware version string reported by the pod.
    pub pm_version: String,
    /// Pod lot number.
    pub lot: u32,
    /// Pod serial within the lot.
    pub tid: u32,
    /// Nonce generator, seeded from `lot` and `tid`.
    pub nonce_state: NonceState,
    /// When the pod was activated, if known.
    #[serde(default)]
    pub activated_at: Option<DateTime<Utc>>,
    /// When the pod reaches nominal expiry; adjusted from status responses.
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    /// Controller-side setup phase.
    pub setup_progress: SetupProgress,
    /// Suspend/resume state of scheduled delivery.
    #[serde(alias = "suspended", deserialize_with = "suspend_state_compat")]
    pub suspend_state: SuspendState,
    /// Dose ledger: in-flight slots plus finalized records.
    #[serde(flatten)]
    pub doses: DoseLedger,
    /// First captured fault; never cleared or replaced once set.
    #[serde(default)]
    pub fault: Option<FaultRecord>,
    /// Alert configuration by slot.
    #[serde(default)]
    pub configured_alerts: BTreeMap<AlertSlot, PodAlert>,
    /// Alert slots the pod last reported active.
    #[serde(default)]
    pub active_alert_slots: AlertSet,
    /// Last delivery counters reported by the pod.
    #[serde(default)]
    pub last_insulin_measurements: Option<InsulinMeasurements>,
    /// Radio-layer counters.
    #[serde(default)]
    pub message_transport_state: MessageTransportState,
    /// When the prime bolus will have finished.
    #[serde(default)]
    pub prime_finish_time: Option<DateTime<Utc>>,
    /// Cumulative delivery counter at setup completion; doses delivered
    /// during setup are excluded from therapy bookkeeping.
    #[serde(default)]
    pub setup_units_delivered: Option<Units>,
}

impl PodState {
    /// State for a freshly paired pod.
    #[must_use]
    pub fn new(
        address: u32,
        lot: u32,
        tid: u32,
        pi_version: String,
        pm_version: String,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            address,
            pi_version,
            pm_version,
            lot,
            tid,
            nonce_state: NonceState::new(lot, tid),
            activated_at: None,
            expires_at: None,
            setup_progress: SetupProgress::AddressAssigned,
            suspend_state: SuspendState::Resumed { at: now },
            doses: DoseLedger::default(),
            fault: None,
            configured_alerts: BTreeMap::new(),
            active_alert_slots: AlertSet::EMPTY,
            last_insulin_measurements: None,
            message_transport_state: MessageTransportState::default(),
            prime_finish_time: None,
            setup_units_delivered: None,
        }
    }

    /// Returns `true` once a fault has been captured.
    #[must_use]
    pub fn is_faulted(&self) -> bool {
        self.fault.is_some()
    }

    /// Returns `true` while scheduled delivery is suspended.
    #[must_use]
    pub fn is_suspended(&self) -> bool {
        self.suspend_state.is_suspended()
    }

    /// Advance the setup phase. Regressions are ignored: setup progress
    /// moves only forward, and `ActivationTimeout` is terminal.
    pub fn advance_setup_progress(&mut self, new: SetupProgress) {
        if new >= self.setup_progress {
            self.setup_progress = new;
        } else {
            tracing::warn!(
                current = ?self.setup_progress,
                requested = ?new,
                "ignoring setup progress regression"
            );
        }
    }

    /// Record the alerts most recently programmed into the pod.
    pub fn record_configured_alerts(&mut self, alerts: &[PodAlert]) {
        for alert in alerts {
            self.configured_alerts.insert(alert.slot, *alert);
        }
    }

    /// Fold an ordinary status response into the state.
    pub fn update_from_status_response(&mut self, status: &StatusResponse, now: DateTime<Utc>) {
        self.apply_status_effects(
            status.delivery_status,
            status.insulin_delivered,
            status.reservoir_level,
            status.time_active,
            status.active_alerts,
            now,
        );
    }

    /// Fold a detailed status response into the state.
    pub fn update_from_detailed_status_response(
        &mut self,
        detailed: &DetailedStatus,
        now: DateTime<Utc>,
    ) {
        self.apply_status_effects(
            detailed.delivery_status,
            detailed.insulin_delivered,
            detailed.reservoir_level,
            detailed.time_active,
            detailed.unacknowledged_alerts,
            now,
        );
    }

    fn apply_status_effects(
        &mut self,
        delivery_status: DeliveryStatus,
        insulin_delivered: Units,
        reservoir_level: Option<Units>,
        time_active: Duration,
        active_alerts: AlertSet,
        now: DateTime<Utc>,
    ) {
        // (a) wall-clock times, guarded against round-trip jitter.
        let activated_estimate = now - time_active;
        if self.activated_at.is_none() {
            self.activated_at = Some(activated_estimate);
        }
        self.update_expires_at(activated_estimate + consts::nominal_pod_life());

        // (b) settle uncertain doses against what the pod says is running.
        self.doses.reconcile(delivery_status);

        // (c) overwrite the cumulative counters snapshot.
        self.last_insulin_measurements = Some(InsulinMeasurements {
            delivered: insulin_delivered,
            reservoir_level,
            validated_at: now,
        });

        // (d) overwrite the active alert bitset.
        self.active_alert_slots = active_alerts;

        self.doses.finalize_finished_doses(now);
        self.doses.pair_suspend_resume();
    }

    /// Rewrite `expires_at` only when the new estimate moves it earlier, or
    /// later by more than the jitter tolerance.
    fn update_expires_at(&mut self, candidate: DateTime<Utc>) {
        match self.expires_at {
            None => self.expires_at = Some(candidate),
            Some(current)
                if candidate < current
                    || candidate > current + consts::expiry_jitter_tolerance() =>
            {
                self.expires_at = Some(candidate);
            },
            Some(_) => {},
        }
    }

    /// Capture the first fault: store it, close out in-flight dosing with
    /// the pod-reported undelivered bolus remainder, and fold in the fault's
    /// detailed status. Later faults never replace the first.
    ///
    /// Returns `true` if this call captured the fault.
    pub fn register_fault(&mut self, detailed: &DetailedStatus, now: DateTime<Utc>) -> bool {
        if self.fault.is_some() {
            return false;
        }
        tracing::warn!(
            fault = %detailed.fault_event_code,
            progress = ?detailed.pod_progress,
            "pod fault captured"
        );
        self.fault = Some(FaultRecord::new(*detailed, now));
        self.handle_cancel_dosing(DeliveryType::ALL, Some(detailed.bolus_not_delivered), now);
        self.update_from_detailed_status_response(detailed, now);
        true
    }

    /// Close out ledger records for cancelled delivery kinds.
    ///
    /// Each kind named in `delivery_type` with a live record still inside
    /// its delivery window is cancelled in the ledger. Cancelling basal also
    /// records a certain suspend; cancelling only a temp basal records a
    /// resume, since the pod falls back to the schedule.
    pub fn handle_cancel_dosing(
        &mut self,
        delivery_type: DeliveryType,
        bolus_not_delivered: Option<Units>,
        now: DateTime<Utc>,
    ) {
        if delivery_type.contains(DeliveryType::BOLUS)
            && self
                .doses
                .unfinalized_bolus
                .as_ref()
                .is_some_and(|bolus| !bolus.is_finished(now))
        {
            self.doses.cancel_bolus(now, bolus_not_delivered);
        }
        let cancelled_temp_basal = delivery_type.contains(DeliveryType::TEMP_BASAL)
            && self
                .doses
                .unfinalized_temp_basal
                .as_ref()
                .is_some_and(|temp_basal| !temp_basal.is_finished(now));
        if cancelled_temp_basal {
            self.doses.cancel_temp_basal(now);
        }

        if delivery_type.contains(DeliveryType::BASAL) {
            let _ = self
                .doses
                .record_suspend(now, crate::dose::ScheduledCertainty::Certain);
            self.suspend_state = SuspendState::Suspended { at: now };
        } else if cancelled_temp_basal {
            let _ = self
                .doses
                .record_resume(now, crate::dose::ScheduledCertainty::Certain);
            self.suspend_state = SuspendState::Resumed { at: now };
        }
        self.doses.pair_suspend_resume();
    }
}
