//! Ledger-backed services used by the settlement steps and the API.

pub mod stock;
pub mod wallet;

pub use stock::StockService;
pub use wallet::WalletService;
