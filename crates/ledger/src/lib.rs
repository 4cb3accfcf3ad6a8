//! Durable ledger for coupon templates, issuances, wallets, products,
//! orders and the coupon work queue.
//!
//! Two implementations share the [`LedgerStore`] / [`LedgerTx`] contract:
//! - [`InMemoryLedger`] for tests and single-process runs
//! - [`PostgresLedger`] backed by `sqlx`
//!
//! Both give the same guarantees: `lock_*` reads hold a row-exclusive lock
//! until commit or rollback, and `conditional_decrement` is a single atomic
//! "subtract only if the result stays non-negative" update.

pub mod error;
pub mod memory;
pub mod postgres;
pub mod store;

pub use error::{LedgerError, Result};
pub use memory::InMemoryLedger;
pub use postgres::PostgresLedger;
pub use store::{Counter, LedgerStore, LedgerStoreExt, LedgerTx, ProductSales};
