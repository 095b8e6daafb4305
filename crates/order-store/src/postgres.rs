use std::fmt::Display;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{CustomerId, OrderId, OrderNo, ShardId};
use domain::{
    Money, Order, OrderItem, OrderLog, OrderRecord, OrderTimestamps, PaymentMethod,
    ShippingAddress,
};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgConnection, PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use crate::{
    DeliveryStatus, OrderFilter, OrderStore, OrderTransaction, OutboxMessage, OutboxStore, Page,
    PageResult, Result, ShardRouter, StoreError,
};

const ORDER_COLUMNS: &str = "id, order_no, customer_id, status, total_amount, actual_amount, \
    shipping_fee, discount_amount, coupon_code, idempotency_key, payment_method, payment_ref, \
    tracking_no, cancel_reason, refund_reason, remark, shipping_address, created_at, updated_at, \
    allocated_at, confirmed_at, paid_at, shipped_at, delivered_at, completed_at, cancelled_at, \
    refund_requested_at, refunded_at, closed_at";

/// PostgreSQL-backed order store with one connection pool per shard.
#[derive(Clone)]
pub struct PgOrderStore {
    router: ShardRouter,
    pools: Vec<PgPool>,
}

impl PgOrderStore {
    /// Creates a store over the given pools; pool `i` serves shard `i`.
    pub fn new(pools: Vec<PgPool>) -> Result<Self> {
        let shard_count = u16::try_from(pools.len()).map_err(|_| {
            StoreError::InvalidShardConfig(format!("too many shard pools: {}", pools.len()))
        })?;
        Ok(Self {
            router: ShardRouter::new(shard_count)?,
            pools,
        })
    }

    /// Connects to one database per shard.
    pub async fn connect(urls: &[String], max_connections: u32) -> Result<Self> {
        let mut pools = Vec::with_capacity(urls.len());
        for url in urls {
            let pool = PgPoolOptions::new()
                .max_connections(max_connections)
                .connect(url)
                .await?;
            pools.push(pool);
        }
        Self::new(pools)
    }

    /// Gets the pool serving `shard`.
    pub fn pool(&self, shard: ShardId) -> Result<&PgPool> {
        let shard = self.router.check(shard)?;
        self.pools
            .get(shard.index())
            .ok_or(StoreError::ShardOutOfRange {
                shard,
                shard_count: self.router.shard_count(),
            })
    }

    /// Runs the database migrations on every shard.
    pub async fn run_migrations(&self) -> Result<()> {
        for pool in &self.pools {
            sqlx::migrate!("../../migrations").run(pool).await?;
        }
        Ok(())
    }

    async fn hydrate_optional(&self, shard: ShardId, row: Option<PgRow>) -> Result<Option<Order>> {
        match row {
            Some(row) => {
                let mut conn = self.pool(shard)?.acquire().await?;
                Ok(Some(hydrate(&mut conn, &row).await?))
            }
            None => Ok(None),
        }
    }

    async fn select_page(
        &self,
        shard: ShardId,
        customer_id: Option<CustomerId>,
        filter: &OrderFilter,
        page: Page,
    ) -> Result<PageResult<Order>> {
        let mut conditions = Vec::new();
        let mut param = 0;
        if customer_id.is_some() {
            param += 1;
            conditions.push(format!("customer_id = ${param}"));
        }
        if !filter.statuses.is_empty() {
            param += 1;
            conditions.push(format!("status = ANY(${param})"));
        }
        if filter.created_after.is_some() {
            param += 1;
            conditions.push(format!("created_at >= ${param}"));
        }
        if filter.created_before.is_some() {
            param += 1;
            conditions.push(format!("created_at <= ${param}"));
        }
        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", conditions.join(" AND "))
        };

        let count_sql = format!("SELECT COUNT(*) FROM orders{where_clause}");
        let list_sql = format!(
            "SELECT {ORDER_COLUMNS} FROM orders{where_clause} \
             ORDER BY created_at DESC, id DESC LIMIT ${} OFFSET ${}",
            param + 1,
            param + 2
        );
        let statuses: Vec<String> = filter
            .statuses
            .iter()
            .map(|s| s.as_str().to_string())
            .collect();

        macro_rules! bind_filter {
            ($query:expr) => {{
                let mut query = $query;
                if let Some(customer_id) = customer_id {
                    query = query.bind(customer_id.as_i64());
                }
                if !statuses.is_empty() {
                    query = query.bind(statuses.clone());
                }
                if let Some(after) = filter.created_after {
                    query = query.bind(after);
                }
                if let Some(before) = filter.created_before {
                    query = query.bind(before);
                }
                query
            }};
        }

        let mut conn = self.pool(shard)?.acquire().await?;
        let total: i64 = bind_filter!(sqlx::query_scalar(&count_sql))
            .fetch_one(&mut *conn)
            .await?;
        let rows = bind_filter!(sqlx::query(&list_sql))
            .bind(i64::try_from(page.limit).unwrap_or(i64::MAX))
            .bind(i64::try_from(page.offset).unwrap_or(i64::MAX))
            .fetch_all(&mut *conn)
            .await?;

        let mut items = Vec::with_capacity(rows.len());
        for row in &rows {
            items.push(hydrate(&mut conn, row).await?);
        }
        Ok(PageResult {
            items,
            total: u64::try_from(total).unwrap_or(0),
        })
    }
}

/// Transaction on one PostgreSQL shard.
pub struct PgTransaction {
    shard: ShardId,
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl OrderTransaction for PgTransaction {
    fn shard(&self) -> ShardId {
        self.shard
    }

    async fn find_order_for_update(&mut self, order_no: &OrderNo) -> Result<Option<Order>> {
        if order_no.shard() != self.shard {
            return Err(StoreError::WrongShard {
                order_no: order_no.clone(),
                shard: self.shard,
            });
        }
        let sql = format!("SELECT {ORDER_COLUMNS} FROM orders WHERE order_no = $1 FOR UPDATE");
        let row = sqlx::query(&sql)
            .bind(order_no.as_str())
            .fetch_optional(&mut *self.tx)
            .await?;
        match row {
            Some(row) => Ok(Some(hydrate(&mut self.tx, &row).await?)),
            None => Ok(None),
        }
    }

    async fn save_order(&mut self, order: &Order) -> Result<()> {
        if order.order_no().shard() != self.shard {
            return Err(StoreError::WrongShard {
                order_no: order.order_no().clone(),
                shard: self.shard,
            });
        }
        write_order(&mut self.tx, order).await
    }

    async fn insert_outbox(&mut self, message: &OutboxMessage) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO outbox (id, topic, dedup_key, payload, created_at, status, attempts, delivered_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(message.id)
        .bind(&message.topic)
        .bind(&message.dedup_key)
        .bind(&message.payload)
        .bind(message.created_at)
        .bind(message.status.as_str())
        .bind(i32::try_from(message.attempts).unwrap_or(i32::MAX))
        .bind(message.delivered_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn commit(self) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}

#[async_trait]
impl OrderStore for PgOrderStore {
    type Tx = PgTransaction;

    fn router(&self) -> &ShardRouter {
        &self.router
    }

    async fn begin(&self, shard: ShardId) -> Result<Self::Tx> {
        let tx = self.pool(shard)?.begin().await?;
        Ok(PgTransaction { shard, tx })
    }

    async fn find_by_id(&self, id: OrderId) -> Result<Option<Order>> {
        let shard = id.shard();
        let sql = format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.as_i64())
            .fetch_optional(self.pool(shard)?)
            .await?;
        self.hydrate_optional(shard, row).await
    }

    async fn find_by_order_no(&self, order_no: &OrderNo) -> Result<Option<Order>> {
        let shard = order_no.shard();
        let sql = format!("SELECT {ORDER_COLUMNS} FROM orders WHERE order_no = $1");
        let row = sqlx::query(&sql)
            .bind(order_no.as_str())
            .fetch_optional(self.pool(shard)?)
            .await?;
        self.hydrate_optional(shard, row).await
    }

    async fn find_by_idempotency_key(
        &self,
        customer_id: CustomerId,
        key: &str,
    ) -> Result<Option<Order>> {
        let shard = self.router.shard_for(customer_id);
        let sql = format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE customer_id = $1 AND idempotency_key = $2"
        );
        let row = sqlx::query(&sql)
            .bind(customer_id.as_i64())
            .bind(key)
            .fetch_optional(self.pool(shard)?)
            .await?;
        self.hydrate_optional(shard, row).await
    }

    async fn list_by_customer(
        &self,
        customer_id: CustomerId,
        filter: &OrderFilter,
        page: Page,
    ) -> Result<PageResult<Order>> {
        let shard = self.router.shard_for(customer_id);
        self.select_page(shard, Some(customer_id), filter, page)
            .await
    }

    async fn scan_shard(
        &self,
        shard: ShardId,
        filter: &OrderFilter,
        page: Page,
    ) -> Result<PageResult<Order>> {
        self.select_page(shard, None, filter, page).await
    }
}

#[async_trait]
impl OutboxStore for PgOrderStore {
    fn outbox_shards(&self) -> u16 {
        self.router.shard_count()
    }

    async fn fetch_pending(&self, shard: ShardId, limit: usize) -> Result<Vec<OutboxMessage>> {
        let rows = sqlx::query(
            r#"
            SELECT id, topic, dedup_key, payload, created_at, status, attempts, delivered_at
            FROM outbox
            WHERE status = 'Pending'
            ORDER BY seq ASC
            LIMIT $1
            "#,
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(self.pool(shard)?)
        .await?;

        rows.iter().map(row_to_outbox).collect()
    }

    async fn mark_delivered(&self, shard: ShardId, ids: &[Uuid]) -> Result<()> {
        sqlx::query(
            "UPDATE outbox SET status = 'Delivered', delivered_at = NOW() WHERE id = ANY($1)",
        )
        .bind(ids)
        .execute(self.pool(shard)?)
        .await?;
        Ok(())
    }

    async fn record_failure(&self, shard: ShardId, id: Uuid) -> Result<()> {
        sqlx::query("UPDATE outbox SET attempts = attempts + 1 WHERE id = $1")
            .bind(id)
            .execute(self.pool(shard)?)
            .await?;
        Ok(())
    }
}

fn parse<T>(raw: &str) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    raw.parse()
        .map_err(|e: T::Err| StoreError::Decode(e.to_string()))
}

fn map_unique_violation(err: sqlx::Error, order: &Order) -> StoreError {
    if let sqlx::Error::Database(ref db_err) = err {
        match db_err.constraint() {
            Some("unique_order_no") | Some("orders_pkey") => {
                return StoreError::DuplicateOrder(order.order_no().clone());
            }
            Some("unique_customer_idempotency_key") => {
                return StoreError::DuplicateIdempotencyKey {
                    customer_id: order.customer_id(),
                    key: order.idempotency_key().unwrap_or_default().to_string(),
                };
            }
            _ => {}
        }
    }
    StoreError::Database(err)
}

async fn write_order(conn: &mut PgConnection, order: &Order) -> Result<()> {
    let ts = order.timestamps();
    let upserted = sqlx::query(
        r#"
        INSERT INTO orders (
            id, order_no, customer_id, status, total_amount, actual_amount, shipping_fee,
            discount_amount, coupon_code, idempotency_key, payment_method, payment_ref,
            tracking_no, cancel_reason, refund_reason, remark, shipping_address, created_at,
            updated_at, allocated_at, confirmed_at, paid_at, shipped_at, delivered_at,
            completed_at, cancelled_at, refund_requested_at, refunded_at, closed_at
        )
        VALUES (
            $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18,
            $19, $20, $21, $22, $23, $24, $25, $26, $27, $28, $29
        )
        ON CONFLICT (id) DO UPDATE SET
            status = EXCLUDED.status,
            actual_amount = EXCLUDED.actual_amount,
            discount_amount = EXCLUDED.discount_amount,
            payment_method = EXCLUDED.payment_method,
            payment_ref = EXCLUDED.payment_ref,
            tracking_no = EXCLUDED.tracking_no,
            cancel_reason = EXCLUDED.cancel_reason,
            refund_reason = EXCLUDED.refund_reason,
            updated_at = EXCLUDED.updated_at,
            allocated_at = EXCLUDED.allocated_at,
            confirmed_at = EXCLUDED.confirmed_at,
            paid_at = EXCLUDED.paid_at,
            shipped_at = EXCLUDED.shipped_at,
            delivered_at = EXCLUDED.delivered_at,
            completed_at = EXCLUDED.completed_at,
            cancelled_at = EXCLUDED.cancelled_at,
            refund_requested_at = EXCLUDED.refund_requested_at,
            refunded_at = EXCLUDED.refunded_at,
            closed_at = EXCLUDED.closed_at
        WHERE orders.order_no = EXCLUDED.order_no
        "#,
    )
    .bind(order.id().as_i64())
    .bind(order.order_no().as_str())
    .bind(order.customer_id().as_i64())
    .bind(order.status().as_str())
    .bind(order.total_amount().minor_units())
    .bind(order.actual_amount().minor_units())
    .bind(order.shipping_fee().minor_units())
    .bind(order.discount_amount().minor_units())
    .bind(order.coupon_code())
    .bind(order.idempotency_key())
    .bind(order.payment_method().map(|m| m.as_str()))
    .bind(order.payment_ref())
    .bind(order.tracking_no())
    .bind(order.cancel_reason())
    .bind(order.refund_reason())
    .bind(order.remark())
    .bind(Json(order.shipping_address()))
    .bind(ts.created_at)
    .bind(ts.updated_at)
    .bind(ts.allocated_at)
    .bind(ts.confirmed_at)
    .bind(ts.paid_at)
    .bind(ts.shipped_at)
    .bind(ts.delivered_at)
    .bind(ts.completed_at)
    .bind(ts.cancelled_at)
    .bind(ts.refund_requested_at)
    .bind(ts.refunded_at)
    .bind(ts.closed_at)
    .execute(&mut *conn)
    .await
    .map_err(|e| map_unique_violation(e, order))?;

    if upserted.rows_affected() == 0 {
        return Err(StoreError::DuplicateOrder(order.order_no().clone()));
    }

    for (line_no, item) in order.items().iter().enumerate() {
        sqlx::query(
            r#"
            INSERT INTO order_items (order_id, line_no, product_id, sku_id, product_name, quantity, unit_price)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (order_id, line_no) DO NOTHING
            "#,
        )
        .bind(order.id().as_i64())
        .bind(line_no as i32)
        .bind(item.product_id.as_str())
        .bind(item.sku_id.as_str())
        .bind(&item.product_name)
        .bind(i32::try_from(item.quantity).map_err(|_| {
            StoreError::Decode(format!("quantity {} does not fit a column", item.quantity))
        })?)
        .bind(item.unit_price.minor_units())
        .execute(&mut *conn)
        .await?;
    }

    // The log is append-only; only entries past the stored tail are new.
    let stored: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM order_logs WHERE order_id = $1")
        .bind(order.id().as_i64())
        .fetch_one(&mut *conn)
        .await?;
    let stored = usize::try_from(stored).unwrap_or(0);
    for (seq, log) in order.logs().iter().enumerate().skip(stored) {
        sqlx::query(
            r#"
            INSERT INTO order_logs (order_id, seq, operator, action, old_status, new_status, remark, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(order.id().as_i64())
        .bind(seq as i32)
        .bind(&log.operator)
        .bind(log.action.as_str())
        .bind(log.old_status.map(|s| s.as_str()))
        .bind(log.new_status.as_str())
        .bind(&log.remark)
        .bind(log.created_at)
        .execute(&mut *conn)
        .await?;
    }

    Ok(())
}

async fn hydrate(conn: &mut PgConnection, row: &PgRow) -> Result<Order> {
    let id: i64 = row.try_get("id")?;

    let item_rows = sqlx::query(
        r#"
        SELECT product_id, sku_id, product_name, quantity, unit_price
        FROM order_items
        WHERE order_id = $1
        ORDER BY line_no ASC
        "#,
    )
    .bind(id)
    .fetch_all(&mut *conn)
    .await?;
    let items = item_rows
        .iter()
        .map(|r| {
            let quantity: i32 = r.try_get("quantity")?;
            Ok(OrderItem::new(
                r.try_get::<String, _>("product_id")?,
                r.try_get::<String, _>("sku_id")?,
                r.try_get::<String, _>("product_name")?,
                u32::try_from(quantity)
                    .map_err(|_| StoreError::Decode(format!("negative quantity {quantity}")))?,
                Money::from_minor(r.try_get("unit_price")?),
            ))
        })
        .collect::<Result<Vec<_>>>()?;

    let log_rows = sqlx::query(
        r#"
        SELECT operator, action, old_status, new_status, remark, created_at
        FROM order_logs
        WHERE order_id = $1
        ORDER BY seq ASC
        "#,
    )
    .bind(id)
    .fetch_all(&mut *conn)
    .await?;
    let logs = log_rows
        .iter()
        .map(|r| {
            let old_status: Option<String> = r.try_get("old_status")?;
            Ok(OrderLog {
                operator: r.try_get("operator")?,
                action: parse(r.try_get::<&str, _>("action")?)?,
                old_status: old_status.as_deref().map(parse).transpose()?,
                new_status: parse(r.try_get::<&str, _>("new_status")?)?,
                remark: r.try_get("remark")?,
                created_at: r.try_get("created_at")?,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let payment_method: Option<String> = row.try_get("payment_method")?;
    let Json(shipping_address): Json<ShippingAddress> = row.try_get("shipping_address")?;
    let at = |column: &str| -> Result<Option<DateTime<Utc>>> { Ok(row.try_get(column)?) };

    let record = OrderRecord {
        id: OrderId::from_raw(id),
        order_no: parse(row.try_get::<&str, _>("order_no")?)?,
        customer_id: CustomerId::new(row.try_get("customer_id")?),
        status: parse(row.try_get::<&str, _>("status")?)?,
        total_amount: Money::from_minor(row.try_get("total_amount")?),
        actual_amount: Money::from_minor(row.try_get("actual_amount")?),
        shipping_fee: Money::from_minor(row.try_get("shipping_fee")?),
        discount_amount: Money::from_minor(row.try_get("discount_amount")?),
        coupon_code: row.try_get("coupon_code")?,
        idempotency_key: row.try_get("idempotency_key")?,
        payment_method: payment_method
            .as_deref()
            .map(parse::<PaymentMethod>)
            .transpose()?,
        payment_ref: row.try_get("payment_ref")?,
        tracking_no: row.try_get("tracking_no")?,
        cancel_reason: row.try_get("cancel_reason")?,
        refund_reason: row.try_get("refund_reason")?,
        remark: row.try_get("remark")?,
        shipping_address,
        items,
        logs,
        timestamps: OrderTimestamps {
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            allocated_at: at("allocated_at")?,
            confirmed_at: at("confirmed_at")?,
            paid_at: at("paid_at")?,
            shipped_at: at("shipped_at")?,
            delivered_at: at("delivered_at")?,
            completed_at: at("completed_at")?,
            cancelled_at: at("cancelled_at")?,
            refund_requested_at: at("refund_requested_at")?,
            refunded_at: at("refunded_at")?,
            closed_at: at("closed_at")?,
        },
    };

    Ok(Order::from_record(record)?)
}

fn row_to_outbox(row: &PgRow) -> Result<OutboxMessage> {
    let attempts: i32 = row.try_get("attempts")?;
    Ok(OutboxMessage {
        id: row.try_get("id")?,
        topic: row.try_get("topic")?,
        dedup_key: row.try_get("dedup_key")?,
        payload: row.try_get("payload")?,
        created_at: row.try_get("created_at")?,
        status: row.try_get::<&str, _>("status")?.parse::<DeliveryStatus>()?,
        attempts: u32::try_from(attempts).unwrap_or(0),
        delivered_at: row.try_get("delivered_at")?,
    })
}
