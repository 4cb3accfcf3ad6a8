//! Saga error types.

use common::{IssuanceId, Money, ProductId, UserId};
use coordination::CoordinationError;
use domain::{DomainError, ErrorKind};
use ledger::LedgerError;
use thiserror::Error;

/// Errors that can occur while settling or cancelling an order.
#[derive(Debug, Error)]
pub enum SagaError {
    /// The ordering user does not exist.
    #[error("User not found: {0}")]
    UserNotFound(UserId),

    /// The order has no items.
    #[error("Order must contain at least one item")]
    EmptyOrder,

    /// An item asks for zero units.
    #[error("Quantity for product {product_id} must be greater than 0, got {quantity}")]
    InvalidQuantity { product_id: ProductId, quantity: u32 },

    /// A listing was asked for fewer than one entry.
    #[error("Limit must be greater than 0, got {0}")]
    InvalidLimit(i64),

    /// A referenced product does not exist.
    #[error("Product not found: {0}")]
    ProductNotFound(ProductId),

    /// Not enough stock to reserve an item.
    #[error("Insufficient stock for product {product_id}: requested {requested}")]
    InsufficientStock { product_id: ProductId, requested: i64 },

    /// The wallet cannot cover the amount due.
    #[error("Insufficient balance for user {user_id}: {required} required")]
    InsufficientBalance { user_id: UserId, required: Money },

    /// The coupon does not exist or belongs to another user.
    #[error("Coupon not found: {0}")]
    CouponNotFound(IssuanceId),

    /// The coupon exists but cannot be applied to this order.
    #[error("Coupon {coupon_id} cannot be used: {reason}")]
    CouponNotUsable {
        coupon_id: IssuanceId,
        reason: DomainError,
    },

    /// Order not found.
    #[error("Order not found: {0}")]
    OrderNotFound(String),

    /// The order was cancelled before.
    #[error("Order {0} is already cancelled")]
    AlreadyCancelled(String),

    /// The user has no wallet.
    #[error("Wallet not found for user {0}")]
    WalletNotFound(UserId),

    /// The user already has a wallet.
    #[error("Wallet already exists for user {0}")]
    WalletExists(UserId),

    /// A compensation step failed. The ledger needs manual reconciliation.
    #[error("Compensation step '{step}' failed: {reason}")]
    CompensationFailed { step: String, reason: String },

    /// Domain error.
    #[error("Domain error: {0}")]
    Domain(#[from] DomainError),

    /// Ledger error.
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    /// Lock coordination error.
    #[error("Coordination error: {0}")]
    Coordination(#[from] CoordinationError),
}

impl SagaError {
    /// Classifies this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SagaError::UserNotFound(_)
            | SagaError::ProductNotFound(_)
            | SagaError::CouponNotFound(_)
            | SagaError::OrderNotFound(_)
            | SagaError::WalletNotFound(_) => ErrorKind::NotFound,
            SagaError::EmptyOrder
            | SagaError::InvalidQuantity { .. }
            | SagaError::InvalidLimit(_) => ErrorKind::Validation,
            SagaError::InsufficientStock { .. }
            | SagaError::InsufficientBalance { .. }
            | SagaError::CouponNotUsable { .. }
            | SagaError::AlreadyCancelled(_)
            | SagaError::WalletExists(_) => ErrorKind::Conflict,
            SagaError::CompensationFailed { .. } => ErrorKind::Internal,
            SagaError::Domain(e) => e.kind(),
            SagaError::Ledger(e) => e.kind(),
            SagaError::Coordination(e) => e.kind(),
        }
    }

    /// Returns a short label for metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            SagaError::InsufficientStock { .. } => "insufficient_stock",
            SagaError::InsufficientBalance { .. } => "insufficient_balance",
            SagaError::CouponNotFound(_) | SagaError::CouponNotUsable { .. } => "coupon",
            SagaError::CompensationFailed { .. } => "compensation_failed",
            other => other.kind().as_str(),
        }
    }
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;
