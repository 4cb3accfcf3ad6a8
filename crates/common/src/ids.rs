//! Typed row identifiers.
//!
//! Every durable record is keyed by a database-assigned `i64`. Wrapping each
//! one in its own newtype keeps a `UserId` from being passed where a
//! `ProductId` is expected.

use serde::{Deserialize, Serialize};

macro_rules! row_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(i64);

        impl $name {
            /// Wraps a raw row id.
            pub const fn new(id: i64) -> Self {
                Self(id)
            }

            /// Returns the raw row id.
            pub const fn get(&self) -> i64 {
                self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<i64> for $name {
            fn from(id: i64) -> Self {
                Self(id)
            }
        }

        impl From<$name> for i64 {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

row_id!(
    /// Identifier of a registered user.
    UserId
);
row_id!(
    /// Identifier of a coupon template.
    TemplateId
);
row_id!(
    /// Identifier of a coupon issued to a user.
    IssuanceId
);
row_id!(
    /// Identifier of a product.
    ProductId
);
row_id!(
    /// Identifier of a persisted order.
    OrderId
);
row_id!(
    /// Identifier of a queued coupon request.
    WorkItemId
);
row_id!(
    /// Identifier of a wallet account.
    WalletId
);
