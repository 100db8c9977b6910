use crate::entities::OrderStatus;
use crate::framework::{DatabaseProcessor, TransactionProcessor};
use kanau::processor::Processor;
use rust_decimal::Decimal;
use time::OffsetDateTime;

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct Order {
    pub id: i64,
    pub receiver_id: i64,
    pub status: OrderStatus,
    #[sqlx(rename = "expires_at")]
    pub storage_until: OffsetDateTime,
    pub accept_time: OffsetDateTime,
    pub last_update_time: OffsetDateTime,
    pub package_code: String,
    pub weight: Decimal,
    /// Price charged to the receiver, package surcharges included.
    pub price: Decimal,
}

/// One accepted transition. Rows are only ever appended.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct OrderHistory {
    pub order_id: i64,
    pub status: OrderStatus,
    pub changed_at: OffsetDateTime,
}

impl Order {
    /// The history row describing this order's current status.
    pub fn history_entry(&self) -> OrderHistory {
        OrderHistory {
            order_id: self.id,
            status: self.status,
            changed_at: self.last_update_time,
        }
    }
}

/// Optional filters for [`ScrollOrders`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrderFilter {
    pub receiver_id: Option<i64>,
    pub status: Option<OrderStatus>,
}

impl OrderFilter {
    pub fn matches(&self, order: &Order) -> bool {
        self.receiver_id.is_none_or(|r| r == order.receiver_id)
            && self.status.is_none_or(|s| s == order.status)
    }
}

#[derive(Debug, Clone)]
/// Get one order by its ID.
pub struct GetOrderById {
    pub order_id: i64,
}

impl Processor<GetOrderById> for DatabaseProcessor {
    type Output = Option<Order>;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:GetOrderById")]
    async fn process(&self, query: GetOrderById) -> Result<Option<Order>, sqlx::Error> {
        sqlx::query_as::<_, Order>(
            r#"
            SELECT id, receiver_id, status, expires_at, accept_time,
                   last_update_time, package_code, weight, price
            FROM orders
            WHERE id = $1
            "#,
        )
        .bind(query.order_id)
        .fetch_optional(&self.pool)
        .await
    }
}

#[derive(Debug, Clone)]
/// Keyset pagination over orders, ascending by ID.
///
/// Returns up to `limit` orders with `id > last_id`.
pub struct ScrollOrders {
    pub filter: OrderFilter,
    pub last_id: i64,
    pub limit: i64,
}

impl Processor<ScrollOrders> for DatabaseProcessor {
    type Output = Vec<Order>;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:ScrollOrders")]
    async fn process(&self, query: ScrollOrders) -> Result<Vec<Order>, sqlx::Error> {
        let ScrollOrders {
            filter,
            last_id,
            limit,
        } = query;
        sqlx::query_as::<_, Order>(
            r#"
            SELECT id, receiver_id, status, expires_at, accept_time,
                   last_update_time, package_code, weight, price
            FROM orders
            WHERE id > $1
              AND ($2::bigint IS NULL OR receiver_id = $2)
              AND ($3::order_status IS NULL OR status = $3)
            ORDER BY id ASC
            LIMIT $4
            "#,
        )
        .bind(last_id)
        .bind(filter.receiver_id)
        .bind(filter.status)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
    }
}

#[derive(Debug, Clone)]
/// Full status history of one order, oldest first.
pub struct ListOrderHistory {
    pub order_id: i64,
}

impl Processor<ListOrderHistory> for DatabaseProcessor {
    type Output = Vec<OrderHistory>;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:ListOrderHistory")]
    async fn process(&self, query: ListOrderHistory) -> Result<Vec<OrderHistory>, sqlx::Error> {
        sqlx::query_as::<_, OrderHistory>(
            r#"
            SELECT order_id, status, changed_at
            FROM order_history
            WHERE order_id = $1
            ORDER BY changed_at ASC, seq ASC
            "#,
        )
        .bind(query.order_id)
        .fetch_all(&self.pool)
        .await
    }
}

impl Order {
    /// Insert a freshly accepted order within a transaction.
    ///
    /// A duplicate ID surfaces as a unique violation from Postgres.
    pub async fn insert_tx(
        db: &mut TransactionProcessor<'_>,
        order: &Order,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO orders
            (id, receiver_id, status, expires_at, accept_time, last_update_time, package_code, weight, price)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(order.id)
        .bind(order.receiver_id)
        .bind(order.status)
        .bind(order.storage_until)
        .bind(order.accept_time)
        .bind(order.last_update_time)
        .bind(&order.package_code)
        .bind(order.weight)
        .bind(order.price)
        .execute(&mut *db.tx)
        .await?;
        Ok(())
    }

    /// Overwrite the mutable columns of an order within a transaction.
    ///
    /// Returns the number of rows touched; zero means the order is gone.
    pub async fn update_tx(
        db: &mut TransactionProcessor<'_>,
        order: &Order,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE orders
            SET status = $2, last_update_time = $3
            WHERE id = $1
            "#,
        )
        .bind(order.id)
        .bind(order.status)
        .bind(order.last_update_time)
        .execute(&mut *db.tx)
        .await?;
        Ok(result.rows_affected())
    }
}

impl OrderHistory {
    pub async fn append_tx(
        db: &mut TransactionProcessor<'_>,
        entry: &OrderHistory,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO order_history (order_id, status, changed_at)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(entry.order_id)
        .bind(entry.status)
        .bind(entry.changed_at)
        .execute(&mut *db.tx)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn order(id: i64, receiver_id: i64, status: OrderStatus) -> Order {
        let now = datetime!(2026-01-01 0:00 UTC);
        Order {
            id,
            receiver_id,
            status,
            storage_until: now,
            accept_time: now,
            last_update_time: now,
            package_code: "bag".to_string(),
            weight: Decimal::ONE,
            price: Decimal::ONE,
        }
    }

    #[test]
    fn test_filter_matching() {
        let filter = OrderFilter {
            receiver_id: Some(100),
            status: Some(OrderStatus::InStorage),
        };
        assert!(filter.matches(&order(1, 100, OrderStatus::InStorage)));
        assert!(!filter.matches(&order(1, 101, OrderStatus::InStorage)));
        assert!(!filter.matches(&order(1, 100, OrderStatus::GivenToClient)));
        assert!(OrderFilter::default().matches(&order(1, 101, OrderStatus::GivenToCourier)));
    }
}
