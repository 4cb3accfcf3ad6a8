//! Coupon templates and the issuances bound to users.

mod issuance;
mod template;

pub use issuance::{Issuance, NewIssuance};
pub use template::{CouponTemplate, NewCouponTemplate};
