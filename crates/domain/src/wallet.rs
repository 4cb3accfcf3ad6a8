//! Wallet balances.

use common::{Money, UserId, WalletId};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, validation};

/// A user's spendable balance.
///
/// The balance is never negative. In-memory mutation through [`charge`] and
/// [`withdraw`] is only valid while the wallet row is locked.
///
/// [`charge`]: WalletAccount::charge
/// [`withdraw`]: WalletAccount::withdraw
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletAccount {
    pub id: WalletId,
    pub user_id: UserId,
    pub balance: Money,
}

impl WalletAccount {
    /// Adds a positive amount to the balance.
    pub fn charge(&mut self, amount: Money) -> Result<(), DomainError> {
        ensure_positive(amount)?;
        self.balance = self
            .balance
            .checked_add(amount)
            .ok_or_else(|| validation("balance would exceed the supported range"))?;
        Ok(())
    }

    /// Removes a positive amount, refusing to go below zero.
    pub fn withdraw(&mut self, amount: Money) -> Result<(), DomainError> {
        ensure_positive(amount)?;
        self.balance =
            self.balance
                .checked_sub(amount)
                .ok_or(DomainError::InsufficientBalance {
                    requested: amount,
                    available: self.balance,
                })?;
        Ok(())
    }
}

fn ensure_positive(amount: Money) -> Result<(), DomainError> {
    if !amount.is_positive() {
        return Err(validation("amount must be greater than 0"));
    }
    Ok(())
}
