use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{IssuanceId, Money, OrderId, ProductId, TemplateId, UserId, WalletId, WorkItemId};
use domain::{
    CouponTemplate, Issuance, NewCouponTemplate, NewIssuance, NewOrder, NewProduct, NewUser,
    NewWorkItem, Order, OrderNumber, Product, User, WalletAccount, WorkItem, WorkStatus,
};
use tokio::sync::OwnedMutexGuard;

use crate::{
    LedgerError, Result,
    store::{Counter, LedgerStore, LedgerTx, ProductSales},
};

const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Lockable row addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum RowKey {
    Template(TemplateId),
    Issuance(IssuanceId),
    /// Stands in for the `(template_id, user_id)` unique index entry.
    Holding(TemplateId, UserId),
    Wallet(UserId),
    Product(ProductId),
    Order(OrderId),
    WorkItem(WorkItemId),
}

impl std::fmt::Display for RowKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RowKey::Template(id) => write!(f, "coupon_templates[{id}]"),
            RowKey::Issuance(id) => write!(f, "issuances[{id}]"),
            RowKey::Holding(t, u) => write!(f, "issuances[template={t}, user={u}]"),
            RowKey::Wallet(id) => write!(f, "wallets[user={id}]"),
            RowKey::Product(id) => write!(f, "products[{id}]"),
            RowKey::Order(id) => write!(f, "orders[{id}]"),
            RowKey::WorkItem(id) => write!(f, "work_items[{id}]"),
        }
    }
}

#[derive(Debug, Default)]
struct Tables {
    last_id: i64,
    users: BTreeMap<UserId, User>,
    templates: BTreeMap<TemplateId, CouponTemplate>,
    issuances: BTreeMap<IssuanceId, Issuance>,
    wallets: BTreeMap<UserId, WalletAccount>,
    products: BTreeMap<ProductId, Product>,
    orders: BTreeMap<OrderId, Order>,
    work_items: BTreeMap<WorkItemId, WorkItem>,
}

impl Tables {
    fn next_id(&mut self) -> i64 {
        self.last_id += 1;
        self.last_id
    }

    fn holds_issuance(&self, template_id: TemplateId, user_id: UserId) -> bool {
        self.issuances
            .values()
            .any(|i| i.template_id == template_id && i.user_id == user_id)
    }

    fn outstanding_conflict(&self, item: &WorkItem) -> bool {
        item.status.is_outstanding()
            && self.work_items.values().any(|other| {
                other.id != item.id
                    && other.user_id == item.user_id
                    && other.template_name == item.template_name
                    && other.status.is_outstanding()
            })
    }
}

/// Prior row image, restored on rollback.
#[derive(Debug)]
enum Undo {
    Template(CouponTemplate),
    Issuance(IssuanceId, Option<Issuance>),
    Wallet(WalletAccount),
    Product(Product),
    Order(OrderId, Option<Order>),
    WorkItem(WorkItemId, Option<WorkItem>),
}

impl Undo {
    fn apply(self, tables: &mut Tables) {
        match self {
            Undo::Template(t) => {
                tables.templates.insert(t.id, t);
            }
            Undo::Issuance(id, prev) => restore(&mut tables.issuances, id, prev),
            Undo::Wallet(w) => {
                tables.wallets.insert(w.user_id, w);
            }
            Undo::Product(p) => {
                tables.products.insert(p.id, p);
            }
            Undo::Order(id, prev) => restore(&mut tables.orders, id, prev),
            Undo::WorkItem(id, prev) => restore(&mut tables.work_items, id, prev),
        }
    }
}

fn restore<K: Ord, V>(map: &mut BTreeMap<K, V>, key: K, prev: Option<V>) {
    match prev {
        Some(v) => {
            map.insert(key, v);
        }
        None => {
            map.remove(&key);
        }
    }
}

#[derive(Debug)]
struct Shared {
    tables: Mutex<Tables>,
    row_locks: Mutex<HashMap<RowKey, Arc<tokio::sync::Mutex<()>>>>,
    lock_timeout: Duration,
    unreadable_product: Mutex<Option<ProductId>>,
}

impl Shared {
    fn with_tables<R>(&self, f: impl FnOnce(&mut Tables) -> R) -> R {
        let mut tables = self.tables.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut tables)
    }

    fn read_product(&self, id: ProductId) -> Result<Option<Product>> {
        let unreadable = *self
            .unreadable_product
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if unreadable == Some(id) {
            return Err(LedgerError::Unavailable(format!("products[{id}]")));
        }
        Ok(self.with_tables(|t| t.products.get(&id).cloned()))
    }

    fn row_mutex(&self, key: RowKey) -> Arc<tokio::sync::Mutex<()>> {
        self.row_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key)
            .or_default()
            .clone()
    }
}

/// In-memory ledger for tests and single-process deployments.
///
/// Row locks are real async mutexes, so two transactions touching the same
/// row serialize exactly as they would against PostgreSQL. Every mutation
/// inside a transaction first takes the row's lock and records the prior
/// image, which is restored on rollback.
///
/// Non-locking reads observe writes of transactions that have not yet
/// committed.
#[derive(Debug, Clone)]
pub struct InMemoryLedger {
    shared: Arc<Shared>,
}

impl Default for InMemoryLedger {
    fn default() -> Self {
        Self::with_lock_timeout(DEFAULT_LOCK_TIMEOUT)
    }
}

impl InMemoryLedger {
    /// Creates an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty ledger whose row-lock waits give up after `timeout`.
    pub fn with_lock_timeout(timeout: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                tables: Mutex::new(Tables::default()),
                row_locks: Mutex::new(HashMap::new()),
                lock_timeout: timeout,
                unreadable_product: Mutex::new(None),
            }),
        }
    }

    /// Makes every read of product `id` fail until cleared with `None`.
    pub fn set_fail_product_reads(&self, id: Option<ProductId>) {
        *self
            .shared
            .unreadable_product
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = id;
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedger {
    async fn begin(&self) -> Result<Box<dyn LedgerTx>> {
        Ok(Box::new(InMemoryTx {
            shared: self.shared.clone(),
            held: HashMap::new(),
            undo: Vec::new(),
            finished: false,
        }))
    }

    async fn insert_user(&self, user: NewUser) -> Result<User> {
        Ok(self.shared.with_tables(|t| {
            let user = User {
                id: UserId::new(t.next_id()),
                name: user.name,
                created_at: Utc::now(),
            };
            t.users.insert(user.id, user.clone());
            user
        }))
    }

    async fn find_user(&self, id: UserId) -> Result<Option<User>> {
        Ok(self.shared.with_tables(|t| t.users.get(&id).cloned()))
    }

    async fn insert_template(&self, template: NewCouponTemplate) -> Result<CouponTemplate> {
        self.shared.with_tables(|t| {
            if t.templates.values().any(|x| x.name == template.name) {
                return Err(LedgerError::UniqueViolation(
                    "uq_coupon_templates_name".to_string(),
                ));
            }
            let row = CouponTemplate {
                id: TemplateId::new(t.next_id()),
                name: template.name,
                total_count: template.total_count,
                remaining_count: template.total_count,
                discount_amount: template.discount_amount,
                min_order_amount: template.min_order_amount,
                expires_at: template.expires_at,
                created_at: Utc::now(),
            };
            t.templates.insert(row.id, row.clone());
            Ok(row)
        })
    }

    async fn find_template(&self, id: TemplateId) -> Result<Option<CouponTemplate>> {
        Ok(self.shared.with_tables(|t| t.templates.get(&id).cloned()))
    }

    async fn find_template_by_name(&self, name: &str) -> Result<Option<CouponTemplate>> {
        Ok(self
            .shared
            .with_tables(|t| t.templates.values().find(|x| x.name == name).cloned()))
    }

    async fn find_issuance(&self, id: IssuanceId) -> Result<Option<Issuance>> {
        Ok(self.shared.with_tables(|t| t.issuances.get(&id).cloned()))
    }

    async fn find_issuance_for(
        &self,
        template_id: TemplateId,
        user_id: UserId,
    ) -> Result<Option<Issuance>> {
        Ok(self.shared.with_tables(|t| {
            t.issuances
                .values()
                .find(|i| i.template_id == template_id && i.user_id == user_id)
                .cloned()
        }))
    }

    async fn issuances_for_user(&self, user_id: UserId) -> Result<Vec<Issuance>> {
        Ok(self.shared.with_tables(|t| {
            t.issuances
                .values()
                .filter(|i| i.user_id == user_id)
                .cloned()
                .collect()
        }))
    }

    async fn count_issuances(&self, template_id: TemplateId) -> Result<i64> {
        Ok(self.shared.with_tables(|t| {
            t.issuances
                .values()
                .filter(|i| i.template_id == template_id)
                .count() as i64
        }))
    }

    async fn insert_wallet(&self, user_id: UserId, balance: Money) -> Result<WalletAccount> {
        self.shared.with_tables(|t| {
            if t.wallets.contains_key(&user_id) {
                return Err(LedgerError::UniqueViolation("uq_wallets_user".to_string()));
            }
            let wallet = WalletAccount {
                id: WalletId::new(t.next_id()),
                user_id,
                balance,
            };
            t.wallets.insert(user_id, wallet.clone());
            Ok(wallet)
        })
    }

    async fn find_wallet(&self, user_id: UserId) -> Result<Option<WalletAccount>> {
        Ok(self.shared.with_tables(|t| t.wallets.get(&user_id).cloned()))
    }

    async fn insert_product(&self, product: NewProduct) -> Result<Product> {
        Ok(self.shared.with_tables(|t| {
            let row = Product {
                id: ProductId::new(t.next_id()),
                name: product.name,
                price: product.price,
                stock: product.stock,
                view_count: 0,
            };
            t.products.insert(row.id, row.clone());
            row
        }))
    }

    async fn find_product(&self, id: ProductId) -> Result<Option<Product>> {
        self.shared.read_product(id)
    }

    async fn most_viewed_products(&self, limit: i64) -> Result<Vec<Product>> {
        let limit = usize::try_from(limit).unwrap_or(0);
        Ok(self.shared.with_tables(|t| {
            let mut products: Vec<Product> = t.products.values().cloned().collect();
            products.sort_by(|a, b| b.view_count.cmp(&a.view_count).then(a.id.cmp(&b.id)));
            products.truncate(limit);
            products
        }))
    }

    async fn find_order(&self, number: &OrderNumber) -> Result<Option<Order>> {
        Ok(self.shared.with_tables(|t| {
            t.orders
                .values()
                .find(|o| &o.order_number == number)
                .cloned()
        }))
    }

    async fn orders_for_user(&self, user_id: UserId) -> Result<Vec<Order>> {
        Ok(self.shared.with_tables(|t| {
            t.orders
                .values()
                .filter(|o| o.user_id == user_id)
                .cloned()
                .collect()
        }))
    }

    async fn product_sales_since(&self, since: DateTime<Utc>) -> Result<Vec<ProductSales>> {
        let totals = self.shared.with_tables(|t| {
            let mut totals: BTreeMap<ProductId, i64> = BTreeMap::new();
            for order in t
                .orders
                .values()
                .filter(|o| !o.is_cancelled() && o.ordered_at >= since)
            {
                for item in &order.items {
                    *totals.entry(item.product_id).or_default() += i64::from(item.quantity);
                }
            }
            totals
        });

        let mut sales: Vec<ProductSales> = totals
            .into_iter()
            .map(|(product_id, quantity)| ProductSales {
                product_id,
                quantity,
            })
            .collect();
        sales.sort_by(|a, b| {
            b.quantity
                .cmp(&a.quantity)
                .then(a.product_id.cmp(&b.product_id))
        });
        Ok(sales)
    }

    async fn insert_work_item(&self, item: NewWorkItem) -> Result<WorkItem> {
        self.shared.with_tables(|t| {
            let row = item.into_item(WorkItemId::new(t.next_id()));
            if t.outstanding_conflict(&row) {
                return Err(LedgerError::UniqueViolation(
                    "uq_work_items_outstanding".to_string(),
                ));
            }
            t.work_items.insert(row.id, row.clone());
            Ok(row)
        })
    }

    async fn find_work_item(&self, id: WorkItemId) -> Result<Option<WorkItem>> {
        Ok(self.shared.with_tables(|t| t.work_items.get(&id).cloned()))
    }

    async fn find_outstanding_work_item(
        &self,
        user_id: UserId,
        template_name: &str,
    ) -> Result<Option<WorkItem>> {
        Ok(self.shared.with_tables(|t| {
            t.work_items
                .values()
                .find(|w| {
                    w.user_id == user_id
                        && w.template_name == template_name
                        && w.status.is_outstanding()
                })
                .cloned()
        }))
    }

    async fn count_work_items(&self, status: WorkStatus) -> Result<i64> {
        Ok(self.shared.with_tables(|t| {
            t.work_items
                .values()
                .filter(|w| w.status == status)
                .count() as i64
        }))
    }

    async fn stuck_work_items(&self, cutoff: DateTime<Utc>) -> Result<Vec<WorkItem>> {
        Ok(self.shared.with_tables(|t| {
            t.work_items
                .values()
                .filter(|w| w.is_stuck(cutoff))
                .cloned()
                .collect()
        }))
    }
}

/// Transaction over [`InMemoryLedger`].
struct InMemoryTx {
    shared: Arc<Shared>,
    held: HashMap<RowKey, OwnedMutexGuard<()>>,
    undo: Vec<Undo>,
    finished: bool,
}

impl InMemoryTx {
    async fn lock_row(&mut self, key: RowKey) -> Result<()> {
        if self.held.contains_key(&key) {
            return Ok(());
        }
        let mutex = self.shared.row_mutex(key);
        let guard = tokio::time::timeout(self.shared.lock_timeout, mutex.lock_owned())
            .await
            .map_err(|_| LedgerError::LockTimeout(key.to_string()))?;
        self.held.insert(key, guard);
        Ok(())
    }

    fn unlock_row(&mut self, key: RowKey) {
        self.held.remove(&key);
    }

    fn record(&mut self, undo: Option<Undo>) -> u64 {
        match undo {
            Some(u) => {
                self.undo.push(u);
                1
            }
            None => 0,
        }
    }

    fn undo_all(&mut self) {
        let undo = std::mem::take(&mut self.undo);
        self.shared.with_tables(|t| {
            for u in undo.into_iter().rev() {
                u.apply(t);
            }
        });
    }
}

impl Drop for InMemoryTx {
    fn drop(&mut self) {
        if !self.finished {
            self.undo_all();
        }
    }
}

fn counter_row(counter: Counter) -> RowKey {
    match counter {
        Counter::CouponRemaining(id) => RowKey::Template(id),
        Counter::ProductStock(id) | Counter::ProductViews(id) => RowKey::Product(id),
        Counter::WalletBalance(id) => RowKey::Wallet(id),
    }
}

#[async_trait]
impl LedgerTx for InMemoryTx {
    async fn lock_template(&mut self, id: TemplateId) -> Result<Option<CouponTemplate>> {
        self.lock_row(RowKey::Template(id)).await?;
        Ok(self.shared.with_tables(|t| t.templates.get(&id).cloned()))
    }

    async fn lock_template_by_name(&mut self, name: &str) -> Result<Option<CouponTemplate>> {
        let id = self
            .shared
            .with_tables(|t| t.templates.values().find(|x| x.name == name).map(|x| x.id));
        match id {
            Some(id) => self.lock_template(id).await,
            None => Ok(None),
        }
    }

    async fn save_template(&mut self, template: &CouponTemplate) -> Result<()> {
        self.lock_row(RowKey::Template(template.id)).await?;
        let undo = self.shared.with_tables(|t| {
            let row = t.templates.get_mut(&template.id)?;
            let prev = row.clone();
            row.remaining_count = template.remaining_count;
            Some(Undo::Template(prev))
        });
        if self.record(undo) == 0 {
            return Err(LedgerError::NotFound(format!("coupon_templates[{}]", template.id)));
        }
        Ok(())
    }

    async fn issuance_exists(&mut self, template_id: TemplateId, user_id: UserId) -> Result<bool> {
        self.lock_row(RowKey::Holding(template_id, user_id)).await?;
        Ok(self
            .shared
            .with_tables(|t| t.holds_issuance(template_id, user_id)))
    }

    async fn insert_issuance(&mut self, issuance: NewIssuance) -> Result<Issuance> {
        self.lock_row(RowKey::Holding(issuance.template_id, issuance.user_id))
            .await?;
        let row = self.shared.with_tables(|t| {
            if t.holds_issuance(issuance.template_id, issuance.user_id) {
                return Err(LedgerError::UniqueViolation(
                    "uq_issuances_template_user".to_string(),
                ));
            }
            let row = Issuance {
                id: IssuanceId::new(t.next_id()),
                template_id: issuance.template_id,
                user_id: issuance.user_id,
                code: issuance.code,
                used: false,
                issued_at: issuance.issued_at,
                used_at: None,
            };
            t.issuances.insert(row.id, row.clone());
            Ok(row)
        })?;
        self.undo.push(Undo::Issuance(row.id, None));
        self.lock_row(RowKey::Issuance(row.id)).await?;
        Ok(row)
    }

    async fn lock_issuance(&mut self, id: IssuanceId) -> Result<Option<Issuance>> {
        self.lock_row(RowKey::Issuance(id)).await?;
        Ok(self.shared.with_tables(|t| t.issuances.get(&id).cloned()))
    }

    async fn save_issuance(&mut self, issuance: &Issuance) -> Result<()> {
        self.lock_row(RowKey::Issuance(issuance.id)).await?;
        let undo = self.shared.with_tables(|t| {
            let row = t.issuances.get_mut(&issuance.id)?;
            let prev = row.clone();
            row.used = issuance.used;
            row.used_at = issuance.used_at;
            Some(Undo::Issuance(prev.id, Some(prev)))
        });
        if self.record(undo) == 0 {
            return Err(LedgerError::NotFound(format!("issuances[{}]", issuance.id)));
        }
        Ok(())
    }

    async fn lock_wallet(&mut self, user_id: UserId) -> Result<Option<WalletAccount>> {
        self.lock_row(RowKey::Wallet(user_id)).await?;
        Ok(self.shared.with_tables(|t| t.wallets.get(&user_id).cloned()))
    }

    async fn save_wallet(&mut self, wallet: &WalletAccount) -> Result<()> {
        self.lock_row(RowKey::Wallet(wallet.user_id)).await?;
        let undo = self.shared.with_tables(|t| {
            let row = t.wallets.get_mut(&wallet.user_id)?;
            let prev = row.clone();
            row.balance = wallet.balance;
            Some(Undo::Wallet(prev))
        });
        if self.record(undo) == 0 {
            return Err(LedgerError::NotFound(format!("wallets[user={}]", wallet.user_id)));
        }
        Ok(())
    }

    async fn lock_product(&mut self, id: ProductId) -> Result<Option<Product>> {
        self.lock_row(RowKey::Product(id)).await?;
        self.shared.read_product(id)
    }

    async fn save_product(&mut self, product: &Product) -> Result<()> {
        self.lock_row(RowKey::Product(product.id)).await?;
        let undo = self.shared.with_tables(|t| {
            let row = t.products.get_mut(&product.id)?;
            let prev = row.clone();
            row.stock = product.stock;
            Some(Undo::Product(prev))
        });
        if self.record(undo) == 0 {
            return Err(LedgerError::NotFound(format!("products[{}]", product.id)));
        }
        Ok(())
    }

    async fn conditional_decrement(&mut self, counter: Counter, amount: i64) -> Result<u64> {
        self.lock_row(counter_row(counter)).await?;
        let undo = self.shared.with_tables(|t| match counter {
            Counter::CouponRemaining(id) => {
                let row = t.templates.get_mut(&id)?;
                if row.remaining_count < amount {
                    return None;
                }
                let prev = row.clone();
                row.remaining_count -= amount;
                Some(Undo::Template(prev))
            }
            Counter::ProductStock(id) => {
                let row = t.products.get_mut(&id)?;
                if row.stock < amount {
                    return None;
                }
                let prev = row.clone();
                row.stock -= amount;
                Some(Undo::Product(prev))
            }
            Counter::ProductViews(id) => {
                let row = t.products.get_mut(&id)?;
                if row.view_count < amount {
                    return None;
                }
                let prev = row.clone();
                row.view_count -= amount;
                Some(Undo::Product(prev))
            }
            Counter::WalletBalance(user_id) => {
                let row = t.wallets.get_mut(&user_id)?;
                let prev = row.clone();
                row.balance = row.balance.checked_sub(Money::new(amount))?;
                Some(Undo::Wallet(prev))
            }
        });
        Ok(self.record(undo))
    }

    async fn increment(&mut self, counter: Counter, amount: i64) -> Result<u64> {
        self.lock_row(counter_row(counter)).await?;
        let out_of_range = || LedgerError::OutOfRange(counter.to_string());
        let undo = self.shared.with_tables(|t| -> Result<Option<Undo>> {
            match counter {
                Counter::CouponRemaining(id) => {
                    let Some(row) = t.templates.get_mut(&id) else {
                        return Ok(None);
                    };
                    let next = row
                        .remaining_count
                        .checked_add(amount)
                        .ok_or_else(out_of_range)?;
                    if next > row.total_count {
                        return Ok(None);
                    }
                    let prev = row.clone();
                    row.remaining_count = next;
                    Ok(Some(Undo::Template(prev)))
                }
                Counter::ProductStock(id) => {
                    let Some(row) = t.products.get_mut(&id) else {
                        return Ok(None);
                    };
                    let next = row.stock.checked_add(amount).ok_or_else(out_of_range)?;
                    let prev = row.clone();
                    row.stock = next;
                    Ok(Some(Undo::Product(prev)))
                }
                Counter::ProductViews(id) => {
                    let Some(row) = t.products.get_mut(&id) else {
                        return Ok(None);
                    };
                    let next = row.view_count.checked_add(amount).ok_or_else(out_of_range)?;
                    let prev = row.clone();
                    row.view_count = next;
                    Ok(Some(Undo::Product(prev)))
                }
                Counter::WalletBalance(user_id) => {
                    let Some(row) = t.wallets.get_mut(&user_id) else {
                        return Ok(None);
                    };
                    let next = row
                        .balance
                        .checked_add(Money::new(amount))
                        .ok_or_else(out_of_range)?;
                    let prev = row.clone();
                    row.balance = next;
                    Ok(Some(Undo::Wallet(prev)))
                }
            }
        })?;
        Ok(self.record(undo))
    }

    async fn insert_order(&mut self, order: NewOrder) -> Result<Order> {
        let row = self.shared.with_tables(|t| {
            if t.orders
                .values()
                .any(|o| o.order_number == order.order_number)
            {
                return Err(LedgerError::UniqueViolation(
                    "uq_orders_order_number".to_string(),
                ));
            }
            let row = order.into_order(OrderId::new(t.next_id()));
            t.orders.insert(row.id, row.clone());
            Ok(row)
        })?;
        self.undo.push(Undo::Order(row.id, None));
        self.lock_row(RowKey::Order(row.id)).await?;
        Ok(row)
    }

    async fn lock_order(&mut self, number: &OrderNumber) -> Result<Option<Order>> {
        let id = self.shared.with_tables(|t| {
            t.orders
                .values()
                .find(|o| &o.order_number == number)
                .map(|o| o.id)
        });
        let Some(id) = id else {
            return Ok(None);
        };
        self.lock_row(RowKey::Order(id)).await?;
        Ok(self.shared.with_tables(|t| t.orders.get(&id).cloned()))
    }

    async fn save_order(&mut self, order: &Order) -> Result<()> {
        self.lock_row(RowKey::Order(order.id)).await?;
        let undo = self.shared.with_tables(|t| {
            let row = t.orders.get_mut(&order.id)?;
            let prev = row.clone();
            row.cancelled_at = order.cancelled_at;
            Some(Undo::Order(prev.id, Some(prev)))
        });
        if self.record(undo) == 0 {
            return Err(LedgerError::NotFound(format!("orders[{}]", order.id)));
        }
        Ok(())
    }

    async fn lock_next_work_item(&mut self) -> Result<Option<WorkItem>> {
        loop {
            let candidate = self.shared.with_tables(|t| {
                t.work_items
                    .values()
                    .filter(|w| w.status == WorkStatus::Pending)
                    .min_by_key(|w| (w.created_at, w.id))
                    .map(|w| w.id)
            });
            let Some(id) = candidate else {
                return Ok(None);
            };

            let key = RowKey::WorkItem(id);
            let already_held = self.held.contains_key(&key);
            self.lock_row(key).await?;
            let item = self.shared.with_tables(|t| t.work_items.get(&id).cloned());
            match item {
                Some(item) if item.status == WorkStatus::Pending => return Ok(Some(item)),
                // Claimed by someone else while we waited
                _ if !already_held => self.unlock_row(key),
                _ => return Ok(None),
            }
        }
    }

    async fn lock_work_item(&mut self, id: WorkItemId) -> Result<Option<WorkItem>> {
        self.lock_row(RowKey::WorkItem(id)).await?;
        Ok(self.shared.with_tables(|t| t.work_items.get(&id).cloned()))
    }

    async fn save_work_item(&mut self, item: &WorkItem) -> Result<()> {
        self.lock_row(RowKey::WorkItem(item.id)).await?;
        let undo = self.shared.with_tables(|t| {
            if t.outstanding_conflict(item) {
                return Err(LedgerError::UniqueViolation(
                    "uq_work_items_outstanding".to_string(),
                ));
            }
            let row = t
                .work_items
                .get_mut(&item.id)
                .ok_or_else(|| LedgerError::NotFound(format!("work_items[{}]", item.id)))?;
            let prev = row.clone();
            *row = item.clone();
            Ok(Undo::WorkItem(prev.id, Some(prev)))
        })?;
        self.undo.push(undo);
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> Result<()> {
        self.finished = true;
        self.undo.clear();
        Ok(())
    }

    async fn rollback(mut self: Box<Self>) -> Result<()> {
        self.undo_all();
        self.finished = true;
        Ok(())
    }
}
