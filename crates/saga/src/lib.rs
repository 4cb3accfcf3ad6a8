//! Order settlement as a saga.
//!
//! Creating an order runs these steps, each committed on its own:
//! 1. Validate the user and the item list
//! 2. Reserve stock for every item
//! 3. Price the lines from the reserved product snapshots
//! 4. Redeem the coupon, if one was given
//! 5. Debit the wallet
//! 6. Persist the confirmed order
//!
//! If a step aborts, the compensations of the committed steps run in
//! reverse order. Sold quantities reach the sales ranking only after the
//! order is durable.

pub mod compensation;
pub mod config;
pub mod error;
pub mod order_settlement;
pub mod services;
pub mod settlement;
pub mod state;
pub mod steps;

pub use compensation::{Compensation, Compensator, LedgerCompensator};
pub use config::{ReservationMode, SettlementConfig};
pub use error::{Result, SagaError};
pub use services::{StockService, WalletService};
pub use settlement::{CompensationFailure, Settlement, SettlementReport, SettlementSaga};
pub use state::SagaState;
pub use steps::{OrderDraft, OrderLine, OrderRequest, SagaStep, StepOutcome};
