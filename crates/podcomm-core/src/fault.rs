//! Captured pod faults.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::protocol::{DetailedStatus, PodProgressStatus};

/// The first fault observed on a pod. Once captured it is never replaced.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FaultRecord {
    /// When the controller observed the fault.
    pub captured_at: DateTime<Utc>,
    /// The pod's detailed status at capture.
    pub status: DetailedStatus,
}

impl FaultRecord {
    /// Capture a fault from a detailed status.
    #[must_use]
    pub fn new(status: DetailedStatus, captured_at: DateTime<Utc>) -> Self {
        Self {
            captured_at,
            status,
        }
    }

    /// Returns `true` if this fault is the activation window lapsing rather
    /// than a delivery-time failure.
    #[must_use]
    pub fn is_activation_timeout(&self) -> bool {
        self.status.pod_progress == PodProgressStatus::ActivationTimeExceeded
    }
}

impl fmt::Display for FaultRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} at {} (pod progress {:?})",
            self.status.fault_event_code, self.captured_at, self.status.pod_progress
        )
    }
}
