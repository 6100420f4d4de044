//! Dose ledger: in-flight and completed insulin doses.
//!
//! Every commanded dose is recorded here before its outcome is known. A
//! record starts `Certain` when the pod confirmed the command and
//! `Uncertain` when the transport failed after the command may have
//! reached the pod; status responses later upgrade or drop uncertain
//! records. Finished and cancelled records move to the finalized list,
//! which the host drains into durable storage.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::protocol::DeliveryStatus;
use crate::units::Units;

/// The kind of a dose record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DoseKind {
    /// Discrete on-demand dose.
    Bolus,
    /// Timed rate override.
    TempBasal,
    /// Suspension of all delivery.
    Suspend,
    /// Return to the scheduled basal rate.
    Resume,
}

impl fmt::Display for DoseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bolus => write!(f, "bolus"),
            Self::TempBasal => write!(f, "temp basal"),
            Self::Suspend => write!(f, "suspend"),
            Self::Resume => write!(f, "resume"),
        }
    }
}

/// Whether the controller knows the pod actually started a dose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScheduledCertainty {
    /// The pod confirmed the command.
    Certain,
    /// The command outcome is ambiguous pending a status response.
    Uncertain,
}

/// One dose record, in flight or finalized.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UnfinalizedDose {
    /// What kind of dose this records.
    pub kind: DoseKind,
    /// When delivery started (or the suspend/resume took effect).
    pub start_time: DateTime<Utc>,
    /// Programmed amount, for boluses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub units: Option<Units>,
    /// Programmed rate in units/hour, for temp basals and resumes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate: Option<Units>,
    /// Programmed duration, for boluses and temp basals.
    #[serde(default, skip_serializing_if = "Option::is_none", with = "opt_duration")]
    pub duration: Option<Duration>,
    /// Whether the pod confirmed this dose started.
    pub certainty: ScheduledCertainty,
    /// When the dose was cancelled, if it was.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancelled_at: Option<DateTime<Utc>>,
    /// Pod-reported units of this dose that were never delivered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub units_not_delivered: Option<Units>,
}

mod opt_duration {
    pub(super) use crate::time_serde::opt_seconds::{deserialize, serialize};
}

impl UnfinalizedDose {
    /// Record a bolus of `units` delivered over `duration`.
    #[must_use]
    pub fn bolus(
        units: Units,
        start_time: DateTime<Utc>,
        duration: Duration,
        certainty: ScheduledCertainty,
    ) -> Self {
        Self {
            kind: DoseKind::Bolus,
            start_time,
            units: Some(units),
            rate: None,
            duration: Some(duration),
            certainty,
            cancelled_at: None,
            units_not_delivered: None,
        }
    }

    /// Record a temp basal at `rate` units/hour for `duration`.
    #[must_use]
    pub fn temp_basal(
        rate: Units,
        start_time: DateTime<Utc>,
        duration: Duration,
        certainty: ScheduledCertainty,
    ) -> Self {
        Self {
            kind: DoseKind::TempBasal,
            start_time,
            units: None,
            rate: Some(rate),
            duration: Some(duration),
            certainty,
            cancelled_at: None,
            units_not_delivered: None,
        }
    }

    /// Record a suspension of delivery at `at`.
    #[must_use]
    pub fn suspend(at: DateTime<Utc>, certainty: ScheduledCertainty) -> Self {
        Self {
            kind: DoseKind::Suspend,
            start_time: at,
            units: None,
            rate: None,
            duration: None,
            certainty,
            cancelled_at: None,
            units_not_delivered: None,
        }
    }

    /// Record a return to scheduled basal at `at`.
    #[must_use]
    pub fn resume(at: DateTime<Utc>, certainty: ScheduledCertainty) -> Self {
        Self {
            kind: DoseKind::Resume,
            start_time: at,
            units: None,
            rate: None,
            duration: None,
            certainty,
            cancelled_at: None,
            units_not_delivered: None,
        }
    }

    /// When this dose stops delivering: cancellation time if cancelled,
    /// otherwise programmed end. Suspends and resumes have no finish.
    #[must_use]
    pub fn finish_time(&self) -> Option<DateTime<Utc>> {
        self.cancelled_at
            .or_else(|| self.duration.map(|d| self.start_time + d))
    }

    /// Returns `true` once the programmed delivery window has passed.
    #[must_use]
    pub fn is_finished(&self, now: DateTime<Utc>) -> bool {
        self.finish_time().is_some_and(|finish| finish <= now)
    }

    /// Estimate the undelivered remainder of a bolus cut off at `at`,
    /// assuming a constant pulse rate over the programmed window.
    #[must_use]
    pub fn estimated_remaining(&self, at: DateTime<Utc>) -> Units {
        let (Some(units), Some(duration)) = (self.units, self.duration) else {
            return Units::default();
        };
        let total = duration.num_milliseconds();
        if total <= 0 {
            return Units::default();
        }
        let elapsed = (at - self.start_time).num_milliseconds().clamp(0, total);
        #[allow(clippy::cast_precision_loss)]
        let remaining_fraction = (total - elapsed) as f64 / total as f64;
        Units::new(units.as_f64() * remaining_fraction).rounded_to_pulse()
    }
}

/// Error recording a dose.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DoseError {
    /// An unfinalized dose of the same kind is already recorded.
    #[error("an unfinalized {0} is already recorded")]
    Occupied(DoseKind),
}

/// In-flight dose slots plus the finalized records pending export.
///
/// At most one unfinalized dose of each kind exists at a time; suspend and
/// resume records coexist with the dose they interrupt.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DoseLedger {
    /// In-flight bolus, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unfinalized_bolus: Option<UnfinalizedDose>,
    /// In-flight temp basal, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unfinalized_temp_basal: Option<UnfinalizedDose>,
    /// Unpaired suspend, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unfinalized_suspend: Option<UnfinalizedDose>,
    /// Unpaired resume, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unfinalized_resume: Option<UnfinalizedDose>,
    /// Completed records not yet drained by the host.
    #[serde(default)]
    pub finalized_doses: Vec<UnfinalizedDose>,
}

impl DoseLedger {
    /// Record an in-flight bolus.
    pub fn record_bolus(
        &mut self,
        units: Units,
        start_time: DateTime<Utc>,
        duration: Duration,
        certainty: ScheduledCertainty,
    ) -> Result<(), DoseError> {
        if self.unfinalized_bolus.is_some() {
            return Err(DoseError::Occupied(DoseKind::Bolus));
        }
        self.unfinalized_bolus =
            Some(UnfinalizedDose::bolus(units, start_time, duration, certainty));
        Ok(())
    }

    /// Record an in-flight temp basal.
    pub fn record_temp_basal(
        &mut self,
        rate: Units,
        start_time: DateTime<Utc>,
        duration: Duration,
        certainty: ScheduledCertainty,
    ) -> Result<(), DoseError> {
        if self.unfinalized_temp_basal.is_some() {
            return Err(DoseError::Occupied(DoseKind::TempBasal));
        }
        self.unfinalized_temp_basal = Some(UnfinalizedDose::temp_basal(
            rate, start_time, duration, certainty,
        ));
        Ok(())
    }

    /// Record a suspension of delivery.
    pub fn record_suspend(
        &mut self,
        at: DateTime<Utc>,
        certainty: ScheduledCertainty,
    ) -> Result<(), DoseError> {
        if self.unfinalized_suspend.is_some() {
            return Err(DoseError::Occupied(DoseKind::Suspend));
        }
        self.unfinalized_suspend = Some(UnfinalizedDose::suspend(at, certainty));
        Ok(())
    }

    /// Record a return to scheduled basal.
    pub fn record_resume(
        &mut self,
        at: DateTime<Utc>,
        certainty: ScheduledCertainty,
    ) -> Result<(), DoseError> {
        if self.unfinalized_resume.is_some() {
            return Err(DoseError::Occupied(DoseKind::Resume));
        }
        self.unfinalized_resume = Some(UnfinalizedDose::resume(at, certainty));
        Ok(())
    }

    /// Move boluses and temp basals whose programmed window has passed to
    /// the finalized list.
    pub fn finalize_finished_doses(&mut self, now: DateTime<Utc>) {
        for slot in [&mut self.unfinalized_bolus, &mut self.unfinalized_temp_basal] {
            if slot.as_ref().is_some_and(|dose| dose.is_finished(now)) {
                self.finalized_doses.extend(slot.take());
            }
        }
    }

    /// Cancel the in-flight bolus at `at`, recording the pod-reported
    /// undelivered remainder (estimated from elapsed time if the pod did
    /// not report one), and finalize it.
    pub fn cancel_bolus(&mut self, at: DateTime<Utc>, remaining: Option<Units>) {
        if let Some(mut bolus) = self.unfinalized_bolus.take() {
            bolus.cancelled_at = Some(at);
            bolus.units_not_delivered =
                Some(remaining.unwrap_or_else(|| bolus.estimated_remaining(at)));
            self.finalized_doses.push(bolus);
        }
    }

    /// Cancel the in-flight temp basal at `at`, truncating its duration,
    /// and finalize it.
    pub fn cancel_temp_basal(&mut self, at: DateTime<Utc>) {
        if let Some(mut temp_basal) = self.unfinalized_temp_basal.take() {
            temp_basal.cancelled_at = Some(at);
            temp_basal.duration = Some((at - temp_basal.start_time).max(Duration::zero()));
            self.finalized_doses.push(temp_basal);
        }
    }

    /// Reconcile uncertain records against the pod's reported delivery
    /// state: a kind the pod confirms running is upgraded to certain, one
    /// it denies is dropped as never having happened.
    pub fn reconcile(&mut self, delivery_status: DeliveryStatus) {
        reconcile_slot(&mut self.unfinalized_bolus, delivery_status.bolusing());
        reconcile_slot(
            &mut self.unfinalized_temp_basal,
            delivery_status.temp_basal_running(),
        );
        reconcile_slot(
            &mut self.unfinalized_suspend,
            delivery_status.is_suspended(),
        );
        reconcile_slot(
            &mut self.unfinalized_resume,
            !delivery_status.is_suspended(),
        );
    }

    /// Pair an unfinalized suspend with a later resume, finalizing both in
    /// `[suspend, resume]` order.
    pub fn pair_suspend_resume(&mut self) {
        let paired = matches!(
            (&self.unfinalized_suspend, &self.unfinalized_resume),
            (Some(suspend), Some(resume)) if resume.start_time > suspend.start_time
        );
        if paired {
            self.finalized_doses.extend(self.unfinalized_suspend.take());
            self.finalized_doses.extend(self.unfinalized_resume.take());
        }
    }

    /// In-flight records, bolus first.
    pub fn live_doses(&self) -> impl Iterator<Item = &UnfinalizedDose> {
        [
            &self.unfinalized_bolus,
            &self.unfinalized_temp_basal,
            &self.unfinalized_suspend,
            &self.unfinalized_resume,
        ]
        .into_iter()
        .flatten()
    }

    /// Hand the finalized records plus a snapshot of the live ones to
    /// `handler`; if it reports durable storage, clear the finalized list.
    /// Live records always remain.
    pub fn drain<F>(&mut self, handler: F)
    where
        F: FnOnce(&[UnfinalizedDose]) -> bool,
    {
        let mut snapshot = self.finalized_doses.clone();
        snapshot.extend(self.live_doses().copied());
        if handler(&snapshot) {
            self.finalized_doses.clear();
        }
    }
}

fn reconcile_slot(slot: &mut Option<UnfinalizedDose>, pod_confirms: bool) {
    let Some(dose) = slot else { return };
    if dose.certainty != ScheduledCertainty::Uncertain {
        return;
    }
    if pod_confirms {
        dose.certainty = ScheduledCertainty::Certain;
    } else {
        tracing::debug!(kind = %dose.kind, "dropping uncertain dose the pod denies");
        *slot = None;
    }
}
