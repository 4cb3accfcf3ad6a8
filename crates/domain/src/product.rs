//! Products and their stock counts.

use common::{Money, ProductId};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, validation};

/// A sellable product.
///
/// `stock` is never negative and is only changed through the conditional
/// decrement or while the product row is locked. `view_count` only grows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub id: ProductId,
    pub name: String,
    pub price: Money,
    pub stock: i64,
    pub view_count: i64,
}

impl Product {
    /// Adds stock.
    pub fn add_stock(&mut self, quantity: i64) -> Result<(), DomainError> {
        if quantity <= 0 {
            return Err(validation("quantity must be greater than 0"));
        }
        self.stock = self
            .stock
            .checked_add(quantity)
            .ok_or_else(|| validation("stock would exceed the supported range"))?;
        Ok(())
    }

    /// Removes stock, refusing to go below zero.
    pub fn remove_stock(&mut self, quantity: i64) -> Result<(), DomainError> {
        if quantity <= 0 {
            return Err(validation("quantity must be greater than 0"));
        }
        if self.stock < quantity {
            return Err(DomainError::InsufficientStock {
                product_id: self.id,
                requested: quantity,
                available: self.stock,
            });
        }
        self.stock -= quantity;
        Ok(())
    }
}

/// Input for registering a product.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewProduct {
    pub name: String,
    pub price: Money,
    pub stock: i64,
}

impl NewProduct {
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.name.trim().is_empty() {
            return Err(validation("product name must not be blank"));
        }
        if !self.price.is_positive() {
            return Err(validation("price must be greater than 0"));
        }
        if self.stock < 0 {
            return Err(validation("stock must not be negative"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn product(stock: i64) -> Product {
        Product {
            id: ProductId::new(7),
            name: "Keyboard".to_string(),
            price: Money::new(45_000),
            stock,
            view_count: 0,
        }
    }

    #[test]
    fn test_add_and_remove_stock() {
        let mut p = product(3);
        p.add_stock(2).unwrap();
        p.remove_stock(5).unwrap();
        assert_eq!(p.stock, 0);
    }

    #[test]
    fn test_remove_more_than_available() {
        let mut p = product(3);
        let err = p.remove_stock(4).unwrap_err();
        assert_eq!(
            err,
            DomainError::InsufficientStock {
                product_id: ProductId::new(7),
                requested: 4,
                available: 3,
            }
        );
        assert_eq!(p.stock, 3);
    }

    #[test]
    fn test_add_stock_overflow_is_rejected() {
        let mut p = product(i64::MAX);
        assert!(matches!(p.add_stock(1), Err(DomainError::Validation(_))));
        assert_eq!(p.stock, i64::MAX);
    }

    #[test]
    fn test_zero_quantity_is_rejected() {
        let mut p = product(3);
        assert!(p.add_stock(0).is_err());
        assert!(p.remove_stock(0).is_err());
    }

    #[test]
    fn test_new_product_validation() {
        let ok = NewProduct {
            name: "Mouse".to_string(),
            price: Money::new(1),
            stock: 0,
        };
        assert!(ok.validate().is_ok());

        let free = NewProduct {
            price: Money::zero(),
            ..ok.clone()
        };
        assert!(free.validate().is_err());

        let negative = NewProduct { stock: -1, ..ok };
        assert!(negative.validate().is_err());
    }
}
