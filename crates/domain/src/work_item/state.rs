//! Work item status machine.

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, validation};

/// The status of a queued coupon request.
///
/// State transitions:
/// ```text
/// Pending ──► Processing ──┬──► Completed
///    ▲                     └──► Failed
///    └──────── retry ──────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkStatus {
    /// Waiting for the consumer.
    #[default]
    Pending,

    /// Claimed by the consumer, allocation in flight.
    Processing,

    /// Allocation succeeded (terminal state).
    Completed,

    /// Allocation failed. May be retried.
    Failed,
}

impl WorkStatus {
    pub const ALL: [WorkStatus; 4] = [
        WorkStatus::Pending,
        WorkStatus::Processing,
        WorkStatus::Completed,
        WorkStatus::Failed,
    ];

    /// Returns true if the consumer may claim an item in this status.
    pub fn can_start(&self) -> bool {
        matches!(self, WorkStatus::Pending)
    }

    /// Returns true if an in-flight item may complete or fail.
    pub fn can_finish(&self) -> bool {
        matches!(self, WorkStatus::Processing)
    }

    /// Returns true if the item may be put back in the queue.
    pub fn can_retry(&self) -> bool {
        matches!(self, WorkStatus::Failed)
    }

    /// Returns true while the request still awaits a decision.
    pub fn is_outstanding(&self) -> bool {
        matches!(self, WorkStatus::Pending | WorkStatus::Processing)
    }

    /// Returns the status name as stored in the ledger.
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkStatus::Pending => "PENDING",
            WorkStatus::Processing => "PROCESSING",
            WorkStatus::Completed => "COMPLETED",
            WorkStatus::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for WorkStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for WorkStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(WorkStatus::Pending),
            "PROCESSING" => Ok(WorkStatus::Processing),
            "COMPLETED" => Ok(WorkStatus::Completed),
            "FAILED" => Ok(WorkStatus::Failed),
            other => Err(validation(format!("unknown work status: {other}"))),
        }
    }
}
