//! Best-seller ranking fed by post-commit sales telemetry.
//!
//! Sales are counted out of band after an order commits, so the counters
//! can drift (a lost update, a cancelled order). A periodic resync rebuilds
//! them from the last seven days of confirmed order lines in the ledger.

pub mod error;
pub mod ranking;
pub mod recorder;

pub use error::{RankingError, Result};
pub use ranking::{CACHED_SIZES, RankedProduct, SalesRanking, spawn_resync};
pub use recorder::{NoopSalesRecorder, SalesRecorder};
