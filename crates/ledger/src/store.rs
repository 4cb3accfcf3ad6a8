use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{IssuanceId, Money, ProductId, TemplateId, UserId, WorkItemId};
use domain::{
    CouponTemplate, Issuance, NewCouponTemplate, NewIssuance, NewOrder, NewProduct, NewUser,
    NewWorkItem, Order, OrderNumber, Product, User, WalletAccount, WorkItem, WorkStatus,
};

use crate::Result;

/// A guarded integer column that may only change atomically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Counter {
    /// `coupon_templates.remaining_count`
    CouponRemaining(TemplateId),
    /// `products.stock`
    ProductStock(ProductId),
    /// `products.view_count`
    ProductViews(ProductId),
    /// `wallets.balance`, addressed by owner
    WalletBalance(UserId),
}

impl std::fmt::Display for Counter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Counter::CouponRemaining(id) => write!(f, "coupon_templates[{id}].remaining_count"),
            Counter::ProductStock(id) => write!(f, "products[{id}].stock"),
            Counter::ProductViews(id) => write!(f, "products[{id}].view_count"),
            Counter::WalletBalance(id) => write!(f, "wallets[user={id}].balance"),
        }
    }
}

/// Units sold per product over some window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProductSales {
    pub product_id: ProductId,
    pub quantity: i64,
}

/// Non-transactional access to the ledger.
///
/// Reads here take no locks. Every write that must be consistent with a
/// read goes through a [`LedgerTx`] obtained from [`begin`].
///
/// [`begin`]: LedgerStore::begin
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Starts a transaction.
    async fn begin(&self) -> Result<Box<dyn LedgerTx>>;

    async fn insert_user(&self, user: NewUser) -> Result<User>;

    async fn find_user(&self, id: UserId) -> Result<Option<User>>;

    /// Inserts a template with `remaining_count = total_count`.
    ///
    /// Fails with `UniqueViolation` if the name is taken.
    async fn insert_template(&self, template: NewCouponTemplate) -> Result<CouponTemplate>;

    async fn find_template(&self, id: TemplateId) -> Result<Option<CouponTemplate>>;

    async fn find_template_by_name(&self, name: &str) -> Result<Option<CouponTemplate>>;

    async fn find_issuance(&self, id: IssuanceId) -> Result<Option<Issuance>>;

    /// Returns the issuance a user holds for a template, if any.
    async fn find_issuance_for(
        &self,
        template_id: TemplateId,
        user_id: UserId,
    ) -> Result<Option<Issuance>>;

    /// Returns all issuances of a user, oldest first.
    async fn issuances_for_user(&self, user_id: UserId) -> Result<Vec<Issuance>>;

    async fn count_issuances(&self, template_id: TemplateId) -> Result<i64>;

    /// Opens a wallet for a user.
    ///
    /// Fails with `UniqueViolation` if the user already has one.
    async fn insert_wallet(&self, user_id: UserId, balance: Money) -> Result<WalletAccount>;

    async fn find_wallet(&self, user_id: UserId) -> Result<Option<WalletAccount>>;

    async fn insert_product(&self, product: NewProduct) -> Result<Product>;

    async fn find_product(&self, id: ProductId) -> Result<Option<Product>>;

    /// Returns up to `limit` products, most viewed first, ties by id.
    async fn most_viewed_products(&self, limit: i64) -> Result<Vec<Product>>;

    async fn find_order(&self, number: &OrderNumber) -> Result<Option<Order>>;

    async fn orders_for_user(&self, user_id: UserId) -> Result<Vec<Order>>;

    /// Sums sold quantities of non-cancelled orders placed at or after `since`,
    /// best sellers first.
    async fn product_sales_since(&self, since: DateTime<Utc>) -> Result<Vec<ProductSales>>;

    /// Enqueues a coupon request in `PENDING` status.
    ///
    /// Fails with `UniqueViolation` if the user already has an outstanding
    /// request for the same template.
    async fn insert_work_item(&self, item: NewWorkItem) -> Result<WorkItem>;

    async fn find_work_item(&self, id: WorkItemId) -> Result<Option<WorkItem>>;

    /// Returns the user's `PENDING` or `PROCESSING` request for a template.
    async fn find_outstanding_work_item(
        &self,
        user_id: UserId,
        template_name: &str,
    ) -> Result<Option<WorkItem>>;

    async fn count_work_items(&self, status: WorkStatus) -> Result<i64>;

    /// Returns `PROCESSING` items whose processing started before `cutoff`.
    async fn stuck_work_items(&self, cutoff: DateTime<Utc>) -> Result<Vec<WorkItem>>;
}

/// A ledger transaction.
///
/// `lock_*` methods read a row and hold its exclusive lock until the
/// transaction ends. Dropping a transaction without calling [`commit`]
/// rolls it back.
///
/// [`commit`]: LedgerTx::commit
#[async_trait]
pub trait LedgerTx: Send {
    async fn lock_template(&mut self, id: TemplateId) -> Result<Option<CouponTemplate>>;

    async fn lock_template_by_name(&mut self, name: &str) -> Result<Option<CouponTemplate>>;

    /// Writes back `remaining_count` of a locked template.
    async fn save_template(&mut self, template: &CouponTemplate) -> Result<()>;

    async fn issuance_exists(&mut self, template_id: TemplateId, user_id: UserId) -> Result<bool>;

    /// Inserts an issuance.
    ///
    /// Fails with `UniqueViolation` if the user already holds one for the
    /// template.
    async fn insert_issuance(&mut self, issuance: NewIssuance) -> Result<Issuance>;

    async fn lock_issuance(&mut self, id: IssuanceId) -> Result<Option<Issuance>>;

    /// Writes back `used` and `used_at` of a locked issuance.
    async fn save_issuance(&mut self, issuance: &Issuance) -> Result<()>;

    async fn lock_wallet(&mut self, user_id: UserId) -> Result<Option<WalletAccount>>;

    /// Writes back the balance of a locked wallet.
    async fn save_wallet(&mut self, wallet: &WalletAccount) -> Result<()>;

    async fn lock_product(&mut self, id: ProductId) -> Result<Option<Product>>;

    /// Writes back the stock of a locked product.
    async fn save_product(&mut self, product: &Product) -> Result<()>;

    /// Subtracts `amount` only if the counter stays non-negative.
    ///
    /// Returns the number of rows affected: 0 when the row is missing or
    /// the balance is insufficient, 1 otherwise.
    async fn conditional_decrement(&mut self, counter: Counter, amount: i64) -> Result<u64>;

    /// Adds `amount` to the counter. Returns the number of rows affected.
    async fn increment(&mut self, counter: Counter, amount: i64) -> Result<u64>;

    /// Inserts a confirmed order with its items.
    async fn insert_order(&mut self, order: NewOrder) -> Result<Order>;

    async fn lock_order(&mut self, number: &OrderNumber) -> Result<Option<Order>>;

    /// Writes back `cancelled_at` of a locked order.
    async fn save_order(&mut self, order: &Order) -> Result<()>;

    /// Locks the oldest `PENDING` work item.
    async fn lock_next_work_item(&mut self) -> Result<Option<WorkItem>>;

    async fn lock_work_item(&mut self, id: WorkItemId) -> Result<Option<WorkItem>>;

    /// Writes back status, timestamps, error and result of a locked item.
    async fn save_work_item(&mut self, item: &WorkItem) -> Result<()>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// Extension trait providing single-statement counter updates.
#[async_trait]
pub trait LedgerStoreExt: LedgerStore {
    /// Runs [`LedgerTx::conditional_decrement`] in its own transaction.
    async fn conditional_decrement(&self, counter: Counter, amount: i64) -> Result<u64> {
        let mut tx = self.begin().await?;
        let rows = tx.conditional_decrement(counter, amount).await?;
        tx.commit().await?;
        Ok(rows)
    }

    /// Runs [`LedgerTx::increment`] in its own transaction.
    async fn increment(&self, counter: Counter, amount: i64) -> Result<u64> {
        let mut tx = self.begin().await?;
        let rows = tx.increment(counter, amount).await?;
        tx.commit().await?;
        Ok(rows)
    }
}

// Blanket implementation for all LedgerStore implementations
impl<T: LedgerStore + ?Sized> LedgerStoreExt for T {}
