use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{
    IssuanceId, Money, OrderId, ProductId, TemplateId, UserId, WalletId, WorkItemId,
};
use domain::{
    CouponTemplate, Issuance, NewCouponTemplate, NewIssuance, NewOrder, NewProduct, NewUser,
    NewWorkItem, Order, OrderItem, OrderNumber, Product, User, WalletAccount, WorkItem,
    WorkStatus,
};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgConnection, PgPool, Postgres, Row, Transaction};

use crate::{
    LedgerError, Result,
    store::{Counter, LedgerStore, LedgerTx, ProductSales},
};

const TEMPLATE_COLUMNS: &str = "id, name, total_count, remaining_count, discount_amount, \
     min_order_amount, expires_at, created_at";
const ISSUANCE_COLUMNS: &str = "id, template_id, user_id, code, used, issued_at, used_at";
const ORDER_COLUMNS: &str = "id, order_number, user_id, coupon_id, total_amount, \
     discount_amount, final_amount, ordered_at, cancelled_at";
const WORK_ITEM_COLUMNS: &str = "id, user_id, template_name, status, created_at, started_at, \
     processed_at, error_message, result_id";

/// PostgreSQL-backed ledger.
#[derive(Debug, Clone)]
pub struct PostgresLedger {
    pool: PgPool,
    lock_timeout: Duration,
}

impl PostgresLedger {
    /// Creates a ledger over an existing pool.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            lock_timeout: Duration::from_secs(5),
        }
    }

    /// Connects a new pool to `url`.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        Ok(Self::new(pool))
    }

    /// Sets how long a row-lock wait may block before failing.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }
}

/// Maps constraint and lock errors onto their ledger counterparts.
fn classify(err: sqlx::Error) -> LedgerError {
    if let sqlx::Error::Database(ref db_err) = err {
        match db_err.code().as_deref() {
            Some("23505") => {
                return LedgerError::UniqueViolation(
                    db_err.constraint().unwrap_or("unique").to_string(),
                );
            }
            Some("55P03") => return LedgerError::LockTimeout(db_err.message().to_string()),
            Some("22003") => return LedgerError::OutOfRange(db_err.message().to_string()),
            _ => {}
        }
    }
    LedgerError::Database(err)
}

fn corrupted(what: &str, err: impl std::fmt::Display) -> LedgerError {
    LedgerError::Corrupted(format!("{what}: {err}"))
}

fn user_from_row(row: &PgRow) -> Result<User> {
    Ok(User {
        id: UserId::new(row.try_get("id")?),
        name: row.try_get("name")?,
        created_at: row.try_get("created_at")?,
    })
}

fn template_from_row(row: &PgRow) -> Result<CouponTemplate> {
    Ok(CouponTemplate {
        id: TemplateId::new(row.try_get("id")?),
        name: row.try_get("name")?,
        total_count: row.try_get("total_count")?,
        remaining_count: row.try_get("remaining_count")?,
        discount_amount: Money::new(row.try_get("discount_amount")?),
        min_order_amount: Money::new(row.try_get("min_order_amount")?),
        expires_at: row.try_get("expires_at")?,
        created_at: row.try_get("created_at")?,
    })
}

fn issuance_from_row(row: &PgRow) -> Result<Issuance> {
    Ok(Issuance {
        id: IssuanceId::new(row.try_get("id")?),
        template_id: TemplateId::new(row.try_get("template_id")?),
        user_id: UserId::new(row.try_get("user_id")?),
        code: row.try_get("code")?,
        used: row.try_get("used")?,
        issued_at: row.try_get("issued_at")?,
        used_at: row.try_get("used_at")?,
    })
}

fn wallet_from_row(row: &PgRow) -> Result<WalletAccount> {
    Ok(WalletAccount {
        id: WalletId::new(row.try_get("id")?),
        user_id: UserId::new(row.try_get("user_id")?),
        balance: Money::new(row.try_get("balance")?),
    })
}

fn product_from_row(row: &PgRow) -> Result<Product> {
    Ok(Product {
        id: ProductId::new(row.try_get("id")?),
        name: row.try_get("name")?,
        price: Money::new(row.try_get("price")?),
        stock: row.try_get("stock")?,
        view_count: row.try_get("view_count")?,
    })
}

fn work_item_from_row(row: &PgRow) -> Result<WorkItem> {
    let status: String = row.try_get("status")?;
    Ok(WorkItem {
        id: WorkItemId::new(row.try_get("id")?),
        user_id: UserId::new(row.try_get("user_id")?),
        template_name: row.try_get("template_name")?,
        status: status
            .parse::<WorkStatus>()
            .map_err(|e| corrupted("work_items.status", e))?,
        created_at: row.try_get("created_at")?,
        started_at: row.try_get("started_at")?,
        processed_at: row.try_get("processed_at")?,
        error_message: row.try_get("error_message")?,
        result_id: row
            .try_get::<Option<i64>, _>("result_id")?
            .map(IssuanceId::new),
    })
}

fn order_item_from_row(row: &PgRow) -> Result<OrderItem> {
    let quantity: i32 = row.try_get("quantity")?;
    Ok(OrderItem {
        product_id: ProductId::new(row.try_get("product_id")?),
        product_name: row.try_get("product_name")?,
        unit_price: Money::new(row.try_get("unit_price")?),
        quantity: u32::try_from(quantity).map_err(|e| corrupted("order_items.quantity", e))?,
    })
}

/// Loads an order row together with its items.
async fn order_with_items(conn: &mut PgConnection, row: &PgRow) -> Result<Order> {
    let id = OrderId::new(row.try_get("id")?);
    let items = sqlx::query(
        r#"
        SELECT product_id, product_name, unit_price, quantity
        FROM order_items
        WHERE order_id = $1
        ORDER BY id ASC
        "#,
    )
    .bind(id.get())
    .fetch_all(&mut *conn)
    .await?
    .iter()
    .map(order_item_from_row)
    .collect::<Result<Vec<_>>>()?;

    Ok(Order {
        id,
        order_number: OrderNumber::from(row.try_get::<String, _>("order_number")?),
        user_id: UserId::new(row.try_get("user_id")?),
        items,
        coupon_id: row
            .try_get::<Option<i64>, _>("coupon_id")?
            .map(IssuanceId::new),
        total_amount: Money::new(row.try_get("total_amount")?),
        discount_amount: Money::new(row.try_get("discount_amount")?),
        final_amount: Money::new(row.try_get("final_amount")?),
        ordered_at: row.try_get("ordered_at")?,
        cancelled_at: row.try_get("cancelled_at")?,
    })
}

/// Table, guarded column and key column for a counter.
fn counter_target(counter: Counter) -> (&'static str, &'static str, &'static str, i64) {
    match counter {
        Counter::CouponRemaining(id) => ("coupon_templates", "remaining_count", "id", id.get()),
        Counter::ProductStock(id) => ("products", "stock", "id", id.get()),
        Counter::ProductViews(id) => ("products", "view_count", "id", id.get()),
        Counter::WalletBalance(id) => ("wallets", "balance", "user_id", id.get()),
    }
}

#[async_trait]
impl LedgerStore for PostgresLedger {
    async fn begin(&self) -> Result<Box<dyn LedgerTx>> {
        let mut tx = self.pool.begin().await?;
        // SET does not take bind parameters
        let statement = format!(
            "SET LOCAL lock_timeout = '{}ms'",
            self.lock_timeout.as_millis()
        );
        sqlx::query(&statement).execute(&mut *tx).await?;
        Ok(Box::new(PostgresTx { tx }))
    }

    async fn insert_user(&self, user: NewUser) -> Result<User> {
        let row = sqlx::query("INSERT INTO users (name) VALUES ($1) RETURNING id, name, created_at")
            .bind(&user.name)
            .fetch_one(&self.pool)
            .await?;
        user_from_row(&row)
    }

    async fn find_user(&self, id: UserId) -> Result<Option<User>> {
        sqlx::query("SELECT id, name, created_at FROM users WHERE id = $1")
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(user_from_row)
            .transpose()
    }

    async fn insert_template(&self, template: NewCouponTemplate) -> Result<CouponTemplate> {
        let sql = format!(
            r#"
            INSERT INTO coupon_templates
                (name, total_count, remaining_count, discount_amount, min_order_amount, expires_at)
            VALUES ($1, $2, $2, $3, $4, $5)
            RETURNING {TEMPLATE_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(&template.name)
            .bind(template.total_count)
            .bind(template.discount_amount.amount())
            .bind(template.min_order_amount.amount())
            .bind(template.expires_at)
            .fetch_one(&self.pool)
            .await
            .map_err(classify)?;
        template_from_row(&row)
    }

    async fn find_template(&self, id: TemplateId) -> Result<Option<CouponTemplate>> {
        let sql = format!("SELECT {TEMPLATE_COLUMNS} FROM coupon_templates WHERE id = $1");
        sqlx::query(&sql)
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(template_from_row)
            .transpose()
    }

    async fn find_template_by_name(&self, name: &str) -> Result<Option<CouponTemplate>> {
        let sql = format!("SELECT {TEMPLATE_COLUMNS} FROM coupon_templates WHERE name = $1");
        sqlx::query(&sql)
            .bind(name)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(template_from_row)
            .transpose()
    }

    async fn find_issuance(&self, id: IssuanceId) -> Result<Option<Issuance>> {
        let sql = format!("SELECT {ISSUANCE_COLUMNS} FROM issuances WHERE id = $1");
        sqlx::query(&sql)
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(issuance_from_row)
            .transpose()
    }

    async fn find_issuance_for(
        &self,
        template_id: TemplateId,
        user_id: UserId,
    ) -> Result<Option<Issuance>> {
        let sql = format!(
            "SELECT {ISSUANCE_COLUMNS} FROM issuances WHERE template_id = $1 AND user_id = $2"
        );
        sqlx::query(&sql)
            .bind(template_id.get())
            .bind(user_id.get())
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(issuance_from_row)
            .transpose()
    }

    async fn issuances_for_user(&self, user_id: UserId) -> Result<Vec<Issuance>> {
        let sql =
            format!("SELECT {ISSUANCE_COLUMNS} FROM issuances WHERE user_id = $1 ORDER BY id ASC");
        sqlx::query(&sql)
            .bind(user_id.get())
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(issuance_from_row)
            .collect()
    }

    async fn count_issuances(&self, template_id: TemplateId) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM issuances WHERE template_id = $1")
            .bind(template_id.get())
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn insert_wallet(&self, user_id: UserId, balance: Money) -> Result<WalletAccount> {
        let row = sqlx::query(
            "INSERT INTO wallets (user_id, balance) VALUES ($1, $2) RETURNING id, user_id, balance",
        )
        .bind(user_id.get())
        .bind(balance.amount())
        .fetch_one(&self.pool)
        .await
        .map_err(classify)?;
        wallet_from_row(&row)
    }

    async fn find_wallet(&self, user_id: UserId) -> Result<Option<WalletAccount>> {
        sqlx::query("SELECT id, user_id, balance FROM wallets WHERE user_id = $1")
            .bind(user_id.get())
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(wallet_from_row)
            .transpose()
    }

    async fn insert_product(&self, product: NewProduct) -> Result<Product> {
        let row = sqlx::query(
            "INSERT INTO products (name, price, stock) VALUES ($1, $2, $3) \
             RETURNING id, name, price, stock, view_count",
        )
        .bind(&product.name)
        .bind(product.price.amount())
        .bind(product.stock)
        .fetch_one(&self.pool)
        .await?;
        product_from_row(&row)
    }

    async fn find_product(&self, id: ProductId) -> Result<Option<Product>> {
        sqlx::query("SELECT id, name, price, stock, view_count FROM products WHERE id = $1")
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(product_from_row)
            .transpose()
    }

    async fn find_order(&self, number: &OrderNumber) -> Result<Option<Order>> {
        let mut conn = self.pool.acquire().await?;
        let sql = format!("SELECT {ORDER_COLUMNS} FROM orders WHERE order_number = $1");
        let row = sqlx::query(&sql)
            .bind(number.as_str())
            .fetch_optional(&mut *conn)
            .await?;
        match row {
            Some(row) => Ok(Some(order_with_items(&mut conn, &row).await?)),
            None => Ok(None),
        }
    }

    async fn orders_for_user(&self, user_id: UserId) -> Result<Vec<Order>> {
        let mut conn = self.pool.acquire().await?;
        let sql = format!("SELECT {ORDER_COLUMNS} FROM orders WHERE user_id = $1 ORDER BY id ASC");
        let rows = sqlx::query(&sql)
            .bind(user_id.get())
            .fetch_all(&mut *conn)
            .await?;

        let mut orders = Vec::with_capacity(rows.len());
        for row in &rows {
            orders.push(order_with_items(&mut conn, row).await?);
        }
        Ok(orders)
    }

    async fn most_viewed_products(&self, limit: i64) -> Result<Vec<Product>> {
        let rows = sqlx::query(
            "SELECT id, name, price, stock, view_count FROM products \
             ORDER BY view_count DESC, id ASC LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(product_from_row).collect()
    }

    async fn product_sales_since(&self, since: DateTime<Utc>) -> Result<Vec<ProductSales>> {
        let rows = sqlx::query(
            r#"
            SELECT oi.product_id, SUM(oi.quantity)::BIGINT AS sold
            FROM order_items oi
            JOIN orders o ON o.id = oi.order_id
            WHERE o.ordered_at >= $1 AND o.cancelled_at IS NULL
            GROUP BY oi.product_id
            ORDER BY sold DESC, oi.product_id ASC
            "#,
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<ProductSales> {
                Ok(ProductSales {
                    product_id: ProductId::new(row.try_get("product_id")?),
                    quantity: row.try_get("sold")?,
                })
            })
            .collect()
    }

    async fn insert_work_item(&self, item: NewWorkItem) -> Result<WorkItem> {
        let sql = format!(
            r#"
            INSERT INTO work_items (user_id, template_name, status, created_at)
            VALUES ($1, $2, $3, $4)
            RETURNING {WORK_ITEM_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(item.user_id.get())
            .bind(&item.template_name)
            .bind(WorkStatus::Pending.as_str())
            .bind(item.created_at)
            .fetch_one(&self.pool)
            .await
            .map_err(classify)?;
        work_item_from_row(&row)
    }

    async fn find_work_item(&self, id: WorkItemId) -> Result<Option<WorkItem>> {
        let sql = format!("SELECT {WORK_ITEM_COLUMNS} FROM work_items WHERE id = $1");
        sqlx::query(&sql)
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(work_item_from_row)
            .transpose()
    }

    async fn find_outstanding_work_item(
        &self,
        user_id: UserId,
        template_name: &str,
    ) -> Result<Option<WorkItem>> {
        let sql = format!(
            r#"
            SELECT {WORK_ITEM_COLUMNS} FROM work_items
            WHERE user_id = $1 AND template_name = $2 AND status IN ('PENDING', 'PROCESSING')
            "#
        );
        sqlx::query(&sql)
            .bind(user_id.get())
            .bind(template_name)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(work_item_from_row)
            .transpose()
    }

    async fn count_work_items(&self, status: WorkStatus) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM work_items WHERE status = $1")
            .bind(status.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn stuck_work_items(&self, cutoff: DateTime<Utc>) -> Result<Vec<WorkItem>> {
        let sql = format!(
            r#"
            SELECT {WORK_ITEM_COLUMNS} FROM work_items
            WHERE status = 'PROCESSING' AND started_at < $1
            ORDER BY started_at ASC, id ASC
            "#
        );
        sqlx::query(&sql)
            .bind(cutoff)
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(work_item_from_row)
            .collect()
    }
}

/// Transaction over [`PostgresLedger`].
///
/// Dropping it without committing rolls back.
struct PostgresTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl LedgerTx for PostgresTx {
    async fn lock_template(&mut self, id: TemplateId) -> Result<Option<CouponTemplate>> {
        let sql =
            format!("SELECT {TEMPLATE_COLUMNS} FROM coupon_templates WHERE id = $1 FOR UPDATE");
        sqlx::query(&sql)
            .bind(id.get())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(classify)?
            .as_ref()
            .map(template_from_row)
            .transpose()
    }

    async fn lock_template_by_name(&mut self, name: &str) -> Result<Option<CouponTemplate>> {
        let sql =
            format!("SELECT {TEMPLATE_COLUMNS} FROM coupon_templates WHERE name = $1 FOR UPDATE");
        sqlx::query(&sql)
            .bind(name)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(classify)?
            .as_ref()
            .map(template_from_row)
            .transpose()
    }

    async fn save_template(&mut self, template: &CouponTemplate) -> Result<()> {
        let result =
            sqlx::query("UPDATE coupon_templates SET remaining_count = $1 WHERE id = $2")
                .bind(template.remaining_count)
                .bind(template.id.get())
                .execute(&mut *self.tx)
                .await
                .map_err(classify)?;
        if result.rows_affected() == 0 {
            return Err(LedgerError::NotFound(format!(
                "coupon_templates[{}]",
                template.id
            )));
        }
        Ok(())
    }

    async fn issuance_exists(&mut self, template_id: TemplateId, user_id: UserId) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM issuances WHERE template_id = $1 AND user_id = $2)",
        )
        .bind(template_id.get())
        .bind(user_id.get())
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(exists)
    }

    async fn insert_issuance(&mut self, issuance: NewIssuance) -> Result<Issuance> {
        let sql = format!(
            r#"
            INSERT INTO issuances (template_id, user_id, code, used, issued_at)
            VALUES ($1, $2, $3, FALSE, $4)
            RETURNING {ISSUANCE_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(issuance.template_id.get())
            .bind(issuance.user_id.get())
            .bind(&issuance.code)
            .bind(issuance.issued_at)
            .fetch_one(&mut *self.tx)
            .await
            .map_err(classify)?;
        issuance_from_row(&row)
    }

    async fn lock_issuance(&mut self, id: IssuanceId) -> Result<Option<Issuance>> {
        let sql = format!("SELECT {ISSUANCE_COLUMNS} FROM issuances WHERE id = $1 FOR UPDATE");
        sqlx::query(&sql)
            .bind(id.get())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(classify)?
            .as_ref()
            .map(issuance_from_row)
            .transpose()
    }

    async fn save_issuance(&mut self, issuance: &Issuance) -> Result<()> {
        let result = sqlx::query("UPDATE issuances SET used = $1, used_at = $2 WHERE id = $3")
            .bind(issuance.used)
            .bind(issuance.used_at)
            .bind(issuance.id.get())
            .execute(&mut *self.tx)
            .await
            .map_err(classify)?;
        if result.rows_affected() == 0 {
            return Err(LedgerError::NotFound(format!("issuances[{}]", issuance.id)));
        }
        Ok(())
    }

    async fn lock_wallet(&mut self, user_id: UserId) -> Result<Option<WalletAccount>> {
        sqlx::query("SELECT id, user_id, balance FROM wallets WHERE user_id = $1 FOR UPDATE")
            .bind(user_id.get())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(classify)?
            .as_ref()
            .map(wallet_from_row)
            .transpose()
    }

    async fn save_wallet(&mut self, wallet: &WalletAccount) -> Result<()> {
        let result = sqlx::query("UPDATE wallets SET balance = $1 WHERE user_id = $2")
            .bind(wallet.balance.amount())
            .bind(wallet.user_id.get())
            .execute(&mut *self.tx)
            .await
            .map_err(classify)?;
        if result.rows_affected() == 0 {
            return Err(LedgerError::NotFound(format!(
                "wallets[user={}]",
                wallet.user_id
            )));
        }
        Ok(())
    }

    async fn lock_product(&mut self, id: ProductId) -> Result<Option<Product>> {
        sqlx::query(
            "SELECT id, name, price, stock, view_count FROM products WHERE id = $1 FOR UPDATE",
        )
        .bind(id.get())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(classify)?
        .as_ref()
        .map(product_from_row)
        .transpose()
    }

    async fn save_product(&mut self, product: &Product) -> Result<()> {
        let result = sqlx::query("UPDATE products SET stock = $1 WHERE id = $2")
            .bind(product.stock)
            .bind(product.id.get())
            .execute(&mut *self.tx)
            .await
            .map_err(classify)?;
        if result.rows_affected() == 0 {
            return Err(LedgerError::NotFound(format!("products[{}]", product.id)));
        }
        Ok(())
    }

    async fn conditional_decrement(&mut self, counter: Counter, amount: i64) -> Result<u64> {
        let (table, column, key, id) = counter_target(counter);
        let sql = format!(
            "UPDATE {table} SET {column} = {column} - $1 WHERE {key} = $2 AND {column} >= $1"
        );
        let result = sqlx::query(&sql)
            .bind(amount)
            .bind(id)
            .execute(&mut *self.tx)
            .await
            .map_err(classify)?;
        tracing::debug!(%counter, amount, rows = result.rows_affected(), "conditional decrement");
        Ok(result.rows_affected())
    }

    async fn increment(&mut self, counter: Counter, amount: i64) -> Result<u64> {
        let (table, column, key, id) = counter_target(counter);
        let mut sql = format!("UPDATE {table} SET {column} = {column} + $1 WHERE {key} = $2");
        if matches!(counter, Counter::CouponRemaining(_)) {
            sql.push_str(" AND remaining_count + $1 <= total_count");
        }
        let result = sqlx::query(&sql)
            .bind(amount)
            .bind(id)
            .execute(&mut *self.tx)
            .await
            .map_err(classify)?;
        Ok(result.rows_affected())
    }

    async fn insert_order(&mut self, order: NewOrder) -> Result<Order> {
        let final_amount = order.final_amount();
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO orders
                (order_number, user_id, coupon_id, total_amount, discount_amount, final_amount, ordered_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id
            "#,
        )
        .bind(order.order_number.as_str())
        .bind(order.user_id.get())
        .bind(order.coupon_id.map(|c| c.get()))
        .bind(order.total_amount.amount())
        .bind(order.discount_amount.amount())
        .bind(final_amount.amount())
        .bind(order.ordered_at)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(classify)?;

        for item in &order.items {
            let quantity =
                i32::try_from(item.quantity).map_err(|e| corrupted("order_items.quantity", e))?;
            sqlx::query(
                r#"
                INSERT INTO order_items (order_id, product_id, product_name, unit_price, quantity)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(id)
            .bind(item.product_id.get())
            .bind(&item.product_name)
            .bind(item.unit_price.amount())
            .bind(quantity)
            .execute(&mut *self.tx)
            .await
            .map_err(classify)?;
        }

        Ok(order.into_order(OrderId::new(id)))
    }

    async fn lock_order(&mut self, number: &OrderNumber) -> Result<Option<Order>> {
        let sql = format!("SELECT {ORDER_COLUMNS} FROM orders WHERE order_number = $1 FOR UPDATE");
        let row = sqlx::query(&sql)
            .bind(number.as_str())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(classify)?;
        match row {
            Some(row) => Ok(Some(order_with_items(&mut self.tx, &row).await?)),
            None => Ok(None),
        }
    }

    async fn save_order(&mut self, order: &Order) -> Result<()> {
        let result = sqlx::query("UPDATE orders SET cancelled_at = $1 WHERE id = $2")
            .bind(order.cancelled_at)
            .bind(order.id.get())
            .execute(&mut *self.tx)
            .await
            .map_err(classify)?;
        if result.rows_affected() == 0 {
            return Err(LedgerError::NotFound(format!("orders[{}]", order.id)));
        }
        Ok(())
    }

    async fn lock_next_work_item(&mut self) -> Result<Option<WorkItem>> {
        let sql = format!(
            r#"
            SELECT {WORK_ITEM_COLUMNS} FROM work_items
            WHERE status = 'PENDING'
            ORDER BY created_at ASC, id ASC
            LIMIT 1
            FOR UPDATE
            "#
        );
        sqlx::query(&sql)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(classify)?
            .as_ref()
            .map(work_item_from_row)
            .transpose()
    }

    async fn lock_work_item(&mut self, id: WorkItemId) -> Result<Option<WorkItem>> {
        let sql = format!("SELECT {WORK_ITEM_COLUMNS} FROM work_items WHERE id = $1 FOR UPDATE");
        sqlx::query(&sql)
            .bind(id.get())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(classify)?
            .as_ref()
            .map(work_item_from_row)
            .transpose()
    }

    async fn save_work_item(&mut self, item: &WorkItem) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE work_items
            SET status = $1, started_at = $2, processed_at = $3, error_message = $4, result_id = $5
            WHERE id = $6
            "#,
        )
        .bind(item.status.as_str())
        .bind(item.started_at)
        .bind(item.processed_at)
        .bind(item.error_message.as_deref())
        .bind(item.result_id.map(|r| r.get()))
        .bind(item.id.get())
        .execute(&mut *self.tx)
        .await
        .map_err(classify)?;
        if result.rows_affected() == 0 {
            return Err(LedgerError::NotFound(format!("work_items[{}]", item.id)));
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let PostgresTx { tx } = *self;
        tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        let PostgresTx { tx } = *self;
        tx.rollback().await?;
        Ok(())
    }
}
