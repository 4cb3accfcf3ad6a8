//! Product stock use cases.

use std::sync::Arc;

use common::ProductId;
use domain::{DomainError, NewProduct, Product};
use ledger::{Counter, LedgerStore, LedgerStoreExt};

use crate::error::{Result, SagaError};

/// Product registration and stock movements.
///
/// Removals go through the ledger's conditional decrement so stock never
/// drops below zero, whoever else is writing.
#[derive(Clone)]
pub struct StockService {
    ledger: Arc<dyn LedgerStore>,
}

impl StockService {
    pub fn new(ledger: Arc<dyn LedgerStore>) -> Self {
        Self { ledger }
    }

    #[tracing::instrument(skip(self, product), fields(name = %product.name))]
    pub async fn create_product(&self, product: NewProduct) -> Result<Product> {
        product.validate()?;
        let product = self.ledger.insert_product(product).await?;
        tracing::info!(product_id = %product.id, stock = product.stock, "product created");
        Ok(product)
    }

    pub async fn product(&self, id: ProductId) -> Result<Product> {
        self.ledger
            .find_product(id)
            .await?
            .ok_or(SagaError::ProductNotFound(id))
    }

    pub async fn stock(&self, id: ProductId) -> Result<i64> {
        Ok(self.product(id).await?.stock)
    }

    /// Adds stock under the product's row lock.
    #[tracing::instrument(skip(self))]
    pub async fn add_stock(&self, id: ProductId, quantity: i64) -> Result<Product> {
        let mut tx = self.ledger.begin().await?;
        let mut product = tx
            .lock_product(id)
            .await?
            .ok_or(SagaError::ProductNotFound(id))?;
        product.add_stock(quantity)?;
        tx.save_product(&product).await?;
        tx.commit().await?;
        Ok(product)
    }

    /// Takes `quantity` units and returns the product as it is afterwards.
    ///
    /// The decrement and the snapshot share one transaction, so a failed
    /// read leaves the stock untouched.
    ///
    /// # Errors
    ///
    /// `ProductNotFound` if the product does not exist, `InsufficientStock`
    /// if fewer than `quantity` units are left.
    #[tracing::instrument(skip(self))]
    pub async fn remove_stock(&self, id: ProductId, quantity: i64) -> Result<Product> {
        ensure_positive(quantity)?;
        let mut tx = self.ledger.begin().await?;
        let rows = tx
            .conditional_decrement(Counter::ProductStock(id), quantity)
            .await?;
        let product = tx
            .lock_product(id)
            .await?
            .ok_or(SagaError::ProductNotFound(id))?;
        if rows == 0 {
            return Err(SagaError::InsufficientStock {
                product_id: id,
                requested: quantity,
            });
        }
        tx.commit().await?;
        Ok(product)
    }

    /// Returns previously taken units.
    pub async fn restore(&self, id: ProductId, quantity: i64) -> Result<()> {
        ensure_positive(quantity)?;
        let rows = self
            .ledger
            .increment(Counter::ProductStock(id), quantity)
            .await?;
        if rows == 0 {
            return Err(SagaError::ProductNotFound(id));
        }
        Ok(())
    }

    /// Counts one view of a product.
    #[tracing::instrument(skip(self))]
    pub async fn record_view(&self, id: ProductId) -> Result<()> {
        let rows = self.ledger.increment(Counter::ProductViews(id), 1).await?;
        if rows == 0 {
            return Err(SagaError::ProductNotFound(id));
        }
        metrics::counter!("product_views_total").increment(1);
        Ok(())
    }

    /// Returns up to `limit` products, most viewed first.
    ///
    /// # Errors
    ///
    /// `InvalidLimit` when `limit` is not positive.
    pub async fn most_viewed(&self, limit: i64) -> Result<Vec<Product>> {
        if limit <= 0 {
            return Err(SagaError::InvalidLimit(limit));
        }
        Ok(self.ledger.most_viewed_products(limit).await?)
    }

    /// Takes stock for several products in one transaction.
    ///
    /// Rows are locked in the order given. Callers pass lines sorted by
    /// product id so that concurrent callers never wait on each other in a
    /// cycle.
    pub async fn remove_stock_locked(&self, lines: &[(ProductId, i64)]) -> Result<Vec<Product>> {
        let mut tx = self.ledger.begin().await?;
        let mut taken = Vec::with_capacity(lines.len());
        for &(id, quantity) in lines {
            let mut product = tx
                .lock_product(id)
                .await?
                .ok_or(SagaError::ProductNotFound(id))?;
            product.remove_stock(quantity).map_err(|e| match e {
                DomainError::InsufficientStock { .. } => SagaError::InsufficientStock {
                    product_id: id,
                    requested: quantity,
                },
                other => other.into(),
            })?;
            tx.save_product(&product).await?;
            taken.push(product);
        }
        tx.commit().await?;
        Ok(taken)
    }
}

fn ensure_positive(quantity: i64) -> Result<()> {
    if quantity <= 0 {
        return Err(DomainError::Validation("quantity must be greater than 0".to_string()).into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use common::Money;
    use ledger::InMemoryLedger;

    use super::*;

    async fn service_with(stock: i64) -> (StockService, ProductId) {
        let service = StockService::new(Arc::new(InMemoryLedger::new()));
        let product = service
            .create_product(NewProduct {
                name: "Keyboard".to_string(),
                price: Money::new(45_000),
                stock,
            })
            .await
            .unwrap();
        (service, product.id)
    }

    #[tokio::test]
    async fn test_remove_and_restore() {
        let (service, id) = service_with(5).await;

        let after = service.remove_stock(id, 3).await.unwrap();
        assert_eq!(after.stock, 2);

        service.restore(id, 3).await.unwrap();
        assert_eq!(service.stock(id).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_remove_distinguishes_missing_from_short() {
        let (service, id) = service_with(1).await;

        assert!(matches!(
            service.remove_stock(id, 2).await,
            Err(SagaError::InsufficientStock { requested: 2, .. })
        ));
        assert!(matches!(
            service.remove_stock(ProductId::new(404), 1).await,
            Err(SagaError::ProductNotFound(_))
        ));
        assert_eq!(service.stock(id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_failed_snapshot_read_keeps_stock() {
        let ledger = Arc::new(InMemoryLedger::new());
        let service = StockService::new(ledger.clone());
        let id = service
            .create_product(NewProduct {
                name: "Monitor".to_string(),
                price: Money::new(300_000),
                stock: 3,
            })
            .await
            .unwrap()
            .id;

        ledger.set_fail_product_reads(Some(id));
        assert!(matches!(
            service.remove_stock(id, 1).await,
            Err(SagaError::Ledger(_))
        ));
        ledger.set_fail_product_reads(None);

        assert_eq!(service.stock(id).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_views_rank_products() {
        let (service, keyboard) = service_with(5).await;
        let mouse = service
            .create_product(NewProduct {
                name: "Mouse".to_string(),
                price: Money::new(20_000),
                stock: 5,
            })
            .await
            .unwrap()
            .id;

        service.record_view(mouse).await.unwrap();
        service.record_view(mouse).await.unwrap();
        service.record_view(keyboard).await.unwrap();

        let top = service.most_viewed(1).await.unwrap();
        assert_eq!(top.len(), 1);
        assert_eq!((top[0].id, top[0].view_count), (mouse, 2));
        assert_eq!(service.stock(mouse).await.unwrap(), 5);

        assert!(matches!(
            service.record_view(ProductId::new(404)).await,
            Err(SagaError::ProductNotFound(_))
        ));
        for limit in [0, -3] {
            let err = service.most_viewed(limit).await.unwrap_err();
            assert_eq!(err.kind(), domain::ErrorKind::Validation);
        }
    }

    #[tokio::test]
    async fn test_add_stock_rejects_non_positive() {
        let (service, id) = service_with(1).await;

        assert_eq!(service.add_stock(id, 4).await.unwrap().stock, 5);
        assert!(matches!(
            service.add_stock(id, 0).await,
            Err(SagaError::Domain(DomainError::Validation(_)))
        ));
    }

    #[tokio::test]
    async fn test_invalid_product_is_rejected() {
        let service = StockService::new(Arc::new(InMemoryLedger::new()));
        let err = service
            .create_product(NewProduct {
                name: " ".to_string(),
                price: Money::new(1),
                stock: 0,
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), domain::ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_locked_removal_is_all_or_nothing() {
        let (service, a) = service_with(5).await;
        let b = service
            .create_product(NewProduct {
                name: "Mouse".to_string(),
                price: Money::new(20_000),
                stock: 1,
            })
            .await
            .unwrap()
            .id;

        let err = service
            .remove_stock_locked(&[(a, 2), (b, 3)])
            .await
            .unwrap_err();
        assert!(matches!(err, SagaError::InsufficientStock { product_id, .. } if product_id == b));
        assert_eq!(service.stock(a).await.unwrap(), 5);

        let taken = service.remove_stock_locked(&[(a, 2), (b, 1)]).await.unwrap();
        assert_eq!(taken[0].stock, 3);
        assert_eq!(taken[1].stock, 0);
    }
}
