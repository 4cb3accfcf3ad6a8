//! Coupon inventory allocation.
//!
//! Four interchangeable strategies implement [`InventoryAllocator`]:
//! - [`DirectAllocator`] in [`DirectMode::RowLock`]: lock the template row,
//!   check for a duplicate, take a unit, insert the issuance
//! - [`DirectAllocator`] in [`DirectMode::ConditionalDecrement`]: one atomic
//!   "decrement if positive" on the template, then the duplicate check
//! - [`QueuedAllocator`]: durable work items decided later, in FIFO order,
//!   by a single [`QueueConsumer`]
//! - [`WaitingListAllocator`]: arrival-ordered ephemeral waiting lists,
//!   also drained by a [`QueueConsumer`]
//!
//! Every strategy guarantees that a template with N units issues exactly N
//! and that a user never holds two units of one template.

pub mod allocator;
pub mod catalog;
pub mod config;
pub mod consumer;
pub mod error;
pub mod maintenance;

pub use allocator::{
    Allocation, DirectAllocator, DirectMode, InventoryAllocator, QueueSummary, QueuedAllocator,
    TemplateRef, WaitingListAllocator, WaitingOutcome,
};
pub use catalog::CouponCatalog;
pub use config::{AllocationConfig, ConsumerConfig, CouponStrategy};
pub use consumer::{QueueConsumer, WorkSource, consumer_lock_key};
pub use error::{AllocationError, Result};
pub use maintenance::{spawn_backlog_reporter, spawn_stuck_scanner};
