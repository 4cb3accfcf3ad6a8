//! Wallet use cases.

use std::sync::Arc;

use common::{Money, UserId};
use domain::{DomainError, NewUser, User, WalletAccount};
use ledger::{Counter, LedgerStore, LedgerStoreExt};

use crate::error::{Result, SagaError};

/// Opens wallets and moves money in and out of them.
///
/// `charge` and `withdraw` mutate the balance under the wallet's row lock.
/// The settlement saga uses the lock-free `debit` and `refund`.
#[derive(Clone)]
pub struct WalletService {
    ledger: Arc<dyn LedgerStore>,
}

impl WalletService {
    pub fn new(ledger: Arc<dyn LedgerStore>) -> Self {
        Self { ledger }
    }

    /// Registers a user together with an empty or pre-funded wallet.
    #[tracing::instrument(skip(self))]
    pub async fn open_account(&self, name: &str, initial: Money) -> Result<(User, WalletAccount)> {
        let new_user = NewUser::new(name.trim());
        new_user.validate()?;
        ensure_not_negative(initial)?;

        let user = self.ledger.insert_user(new_user).await?;
        let wallet = self.ledger.insert_wallet(user.id, initial).await?;
        tracing::info!(user_id = %user.id, balance = %wallet.balance, "account opened");
        Ok((user, wallet))
    }

    /// Opens a wallet for an existing user.
    pub async fn open_wallet(&self, user_id: UserId, initial: Money) -> Result<WalletAccount> {
        ensure_not_negative(initial)?;
        if self.ledger.find_user(user_id).await?.is_none() {
            return Err(SagaError::UserNotFound(user_id));
        }
        self.ledger
            .insert_wallet(user_id, initial)
            .await
            .map_err(|e| {
                if e.is_unique_violation() {
                    SagaError::WalletExists(user_id)
                } else {
                    e.into()
                }
            })
    }

    pub async fn wallet(&self, user_id: UserId) -> Result<WalletAccount> {
        self.ledger
            .find_wallet(user_id)
            .await?
            .ok_or(SagaError::WalletNotFound(user_id))
    }

    pub async fn balance(&self, user_id: UserId) -> Result<Money> {
        Ok(self.wallet(user_id).await?.balance)
    }

    /// Adds funds.
    #[tracing::instrument(skip(self))]
    pub async fn charge(&self, user_id: UserId, amount: Money) -> Result<WalletAccount> {
        let mut tx = self.ledger.begin().await?;
        let mut wallet = tx
            .lock_wallet(user_id)
            .await?
            .ok_or(SagaError::WalletNotFound(user_id))?;
        wallet.charge(amount)?;
        tx.save_wallet(&wallet).await?;
        tx.commit().await?;
        Ok(wallet)
    }

    /// Takes funds out, refusing to overdraw.
    #[tracing::instrument(skip(self))]
    pub async fn withdraw(&self, user_id: UserId, amount: Money) -> Result<WalletAccount> {
        let mut tx = self.ledger.begin().await?;
        let mut wallet = tx
            .lock_wallet(user_id)
            .await?
            .ok_or(SagaError::WalletNotFound(user_id))?;
        wallet.withdraw(amount).map_err(|e| match e {
            DomainError::InsufficientBalance { .. } => SagaError::InsufficientBalance {
                user_id,
                required: amount,
            },
            other => other.into(),
        })?;
        tx.save_wallet(&wallet).await?;
        tx.commit().await?;
        Ok(wallet)
    }

    /// Debits `amount` only if the balance covers it.
    pub async fn debit(&self, user_id: UserId, amount: Money) -> Result<()> {
        let rows = self
            .ledger
            .conditional_decrement(Counter::WalletBalance(user_id), amount.amount())
            .await?;
        if rows == 0 {
            self.wallet(user_id).await?;
            return Err(SagaError::InsufficientBalance {
                user_id,
                required: amount,
            });
        }
        Ok(())
    }

    /// Credits back a previous debit.
    pub async fn refund(&self, user_id: UserId, amount: Money) -> Result<()> {
        let rows = self
            .ledger
            .increment(Counter::WalletBalance(user_id), amount.amount())
            .await?;
        if rows == 0 {
            return Err(SagaError::WalletNotFound(user_id));
        }
        Ok(())
    }
}

fn ensure_not_negative(amount: Money) -> Result<()> {
    if amount.is_negative() {
        return Err(DomainError::Validation("initial balance must not be negative".into()).into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use ledger::InMemoryLedger;

    use super::*;

    fn service() -> WalletService {
        WalletService::new(Arc::new(InMemoryLedger::new()))
    }

    #[tokio::test]
    async fn test_open_charge_withdraw() {
        let service = service();
        let (user, wallet) = service.open_account("alice", Money::new(1_000)).await.unwrap();
        assert_eq!(wallet.balance, Money::new(1_000));

        service.charge(user.id, Money::new(500)).await.unwrap();
        let wallet = service.withdraw(user.id, Money::new(1_200)).await.unwrap();
        assert_eq!(wallet.balance, Money::new(300));
        assert_eq!(service.balance(user.id).await.unwrap(), Money::new(300));
    }

    #[tokio::test]
    async fn test_withdraw_more_than_balance() {
        let service = service();
        let (user, _) = service.open_account("bob", Money::new(100)).await.unwrap();

        let err = service.withdraw(user.id, Money::new(101)).await.unwrap_err();
        assert!(matches!(err, SagaError::InsufficientBalance { .. }));
        assert_eq!(service.balance(user.id).await.unwrap(), Money::new(100));
    }

    #[tokio::test]
    async fn test_charge_rejects_non_positive_amounts() {
        let service = service();
        let (user, _) = service.open_account("carol", Money::zero()).await.unwrap();

        let err = service.charge(user.id, Money::zero()).await.unwrap_err();
        assert_eq!(err.kind(), domain::ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_debit_and_refund() {
        let service = service();
        let (user, _) = service.open_account("dave", Money::new(100)).await.unwrap();

        service.debit(user.id, Money::new(60)).await.unwrap();
        assert!(matches!(
            service.debit(user.id, Money::new(60)).await,
            Err(SagaError::InsufficientBalance { .. })
        ));
        service.refund(user.id, Money::new(60)).await.unwrap();
        assert_eq!(service.balance(user.id).await.unwrap(), Money::new(100));

        assert!(matches!(
            service.debit(UserId::new(404), Money::new(1)).await,
            Err(SagaError::WalletNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_second_wallet_is_rejected() {
        let service = service();
        let (user, _) = service.open_account("erin", Money::zero()).await.unwrap();

        assert!(matches!(
            service.open_wallet(user.id, Money::zero()).await,
            Err(SagaError::WalletExists(_))
        ));
        assert!(matches!(
            service.open_wallet(UserId::new(404), Money::zero()).await,
            Err(SagaError::UserNotFound(_))
        ));
    }
}
