//! Domain layer for coupon allocation and order settlement.
//!
//! This crate holds the durable entities and the rules that guard them:
//! - Coupon templates and the issuances bound to users
//! - Wallet accounts and product stock
//! - Orders with captured line prices and soft cancellation
//! - Queued coupon requests and their status machine
//!
//! Nothing here talks to storage. Callers load rows, apply these rules while
//! holding the appropriate lock, and write the result back.

pub mod coupon;
pub mod error;
pub mod order;
pub mod product;
pub mod user;
pub mod wallet;
pub mod work_item;

pub use coupon::{CouponTemplate, Issuance, NewCouponTemplate, NewIssuance};
pub use error::{DomainError, ErrorKind};
pub use order::{NewOrder, Order, OrderItem, OrderNumber};
pub use product::{NewProduct, Product};
pub use user::{NewUser, User};
pub use wallet::WalletAccount;
pub use work_item::{NewWorkItem, WorkItem, WorkStatus};
