//! Queued coupon requests.

mod state;

use chrono::{DateTime, Utc};
use common::{IssuanceId, UserId, WorkItemId};
use serde::{Deserialize, Serialize};

pub use state::WorkStatus;

use crate::error::DomainError;

/// A durable request for one coupon, decided later by the queue consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: WorkItemId,
    pub user_id: UserId,
    pub template_name: String,
    pub status: WorkStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub result_id: Option<IssuanceId>,
}

impl WorkItem {
    /// Claims the item for processing.
    pub fn start_processing(&mut self, now: DateTime<Utc>) -> Result<(), DomainError> {
        self.transition(WorkStatus::can_start, "start processing")?;
        self.status = WorkStatus::Processing;
        self.started_at = Some(now);
        Ok(())
    }

    /// Records a successful allocation.
    pub fn complete(
        &mut self,
        issuance_id: IssuanceId,
        now: DateTime<Utc>,
    ) -> Result<(), DomainError> {
        self.transition(WorkStatus::can_finish, "complete")?;
        self.status = WorkStatus::Completed;
        self.result_id = Some(issuance_id);
        self.processed_at = Some(now);
        Ok(())
    }

    /// Records a failed allocation with its cause.
    pub fn fail(&mut self, message: impl Into<String>, now: DateTime<Utc>) -> Result<(), DomainError> {
        self.transition(WorkStatus::can_finish, "fail")?;
        self.status = WorkStatus::Failed;
        self.error_message = Some(message.into());
        self.processed_at = Some(now);
        Ok(())
    }

    /// Puts a failed item back in the queue.
    pub fn retry(&mut self) -> Result<(), DomainError> {
        self.transition(WorkStatus::can_retry, "retry")?;
        self.status = WorkStatus::Pending;
        self.error_message = None;
        self.processed_at = None;
        self.started_at = None;
        Ok(())
    }

    /// Returns true if the item has been processing since before `cutoff`.
    pub fn is_stuck(&self, cutoff: DateTime<Utc>) -> bool {
        self.status == WorkStatus::Processing && self.started_at.is_some_and(|at| at < cutoff)
    }

    fn transition(
        &self,
        allowed: fn(&WorkStatus) -> bool,
        action: &'static str,
    ) -> Result<(), DomainError> {
        if !allowed(&self.status) {
            return Err(DomainError::InvalidTransition {
                current: self.status,
                action,
            });
        }
        Ok(())
    }
}

/// Input for enqueuing a coupon request.
#[derive(Debug, Clone)]
pub struct NewWorkItem {
    pub user_id: UserId,
    pub template_name: String,
    pub created_at: DateTime<Utc>,
}

impl NewWorkItem {
    pub fn new(user_id: UserId, template_name: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            user_id,
            template_name: template_name.into(),
            created_at: now,
        }
    }

    /// Attaches the persisted id.
    pub fn into_item(self, id: WorkItemId) -> WorkItem {
        WorkItem {
            id,
            user_id: self.user_id,
            template_name: self.template_name,
            status: WorkStatus::Pending,
            created_at: self.created_at,
            started_at: None,
            processed_at: None,
            error_message: None,
            result_id: None,
        }
    }
}
