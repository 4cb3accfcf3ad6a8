//! Shared types used across the coupon allocation and order settlement crates.

pub mod ids;
pub mod money;

pub use ids::{IssuanceId, OrderId, ProductId, TemplateId, UserId, WalletId, WorkItemId};
pub use money::Money;
