use async_trait::async_trait;
use common::ProductId;

use crate::Result;

/// Receives sold quantities once an order is durably committed.
///
/// Callers treat every failure as telemetry loss: it is logged and never
/// affects the order that triggered it.
#[async_trait]
pub trait SalesRecorder: Send + Sync {
    async fn record_sale(&self, product_id: ProductId, quantity: u32) -> Result<()>;
}

/// Discards every sale.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSalesRecorder;

#[async_trait]
impl SalesRecorder for NoopSalesRecorder {
    async fn record_sale(&self, _product_id: ProductId, _quantity: u32) -> Result<()> {
        Ok(())
    }
}
