pub mod coupons;
pub mod health;
pub mod metrics;
pub mod orders;
pub mod products;
pub mod queue;
pub mod wallets;
