//! Allocation and consumer settings.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Which allocator serves coupon requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum CouponStrategy {
    /// Lock the template row for the whole allocation.
    RowLock,
    /// Single conditional decrement on the template counter.
    Conditional,
    /// Durable work queue, decided by the consumer.
    #[default]
    Queue,
    /// Ephemeral waiting list, decided by the consumer.
    WaitingList,
}

impl CouponStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            CouponStrategy::RowLock => "row-lock",
            CouponStrategy::Conditional => "conditional",
            CouponStrategy::Queue => "queue",
            CouponStrategy::WaitingList => "waiting-list",
        }
    }

    /// Returns true if requests are decided asynchronously by a consumer.
    pub fn is_deferred(&self) -> bool {
        matches!(self, CouponStrategy::Queue | CouponStrategy::WaitingList)
    }
}

impl std::fmt::Display for CouponStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for CouponStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "row-lock" => Ok(CouponStrategy::RowLock),
            "conditional" => Ok(CouponStrategy::Conditional),
            "queue" => Ok(CouponStrategy::Queue),
            "waiting-list" => Ok(CouponStrategy::WaitingList),
            other => Err(format!("unknown coupon strategy '{other}'")),
        }
    }
}

/// Allocation settings.
#[derive(Debug, Clone, Default)]
pub struct AllocationConfig {
    pub strategy: CouponStrategy,
}

/// Background consumer settings.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Sleep between polls when no work was found.
    pub poll_interval: Duration,
    /// How often the backlog depth is reported.
    pub backlog_interval: Duration,
    /// `PROCESSING` items older than this are considered stuck.
    pub stuck_threshold: Duration,
    /// How often the stuck scan runs.
    pub stuck_scan_interval: Duration,
    /// Put stuck items straight back in the queue.
    pub auto_requeue: bool,
    /// Lease on the consumer lock for a single unit of work.
    pub unit_lease: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(50),
            backlog_interval: Duration::from_secs(60),
            stuck_threshold: Duration::from_secs(300),
            stuck_scan_interval: Duration::from_secs(60),
            auto_requeue: true,
            unit_lease: Duration::from_secs(30),
        }
    }
}
