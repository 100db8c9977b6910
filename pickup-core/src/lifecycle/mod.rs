//! Order lifecycle service.
//!
//! Validates each request against the current order, applies the status
//! change from the transition table, and commits the order row, its history
//! row and the matching outbox event in one transaction:
//!
//! | Operation                   | Transition                                  | Event                       |
//! |-----------------------------|---------------------------------------------|-----------------------------|
//! | `accept_order`              | (new) -> InStorage                          | `order_accepted`            |
//! | `issue_orders_to_client`    | InStorage -> GivenToClient                  | `order_issued`              |
//! | `return_orders_from_client` | GivenToClient -> ReturnedFromClient         | `order_returned_by_client`  |
//! | `return_order_to_delivery`  | InStorage -> ReturnedWithoutClient,         | `order_returned_to_courier` |
//! |                             | ReturnedFromClient -> GivenToCourier        |                             |
//!
//! Bulk operations evaluate each ID on its own and never stop early.
//!
//! The order is read before the transaction opens and not re-read inside it,
//! so two concurrent writers to the same order resolve last-write-wins.

mod error;
mod outcome;
mod packaging;

pub use error::{ErrorKind, LifecycleError};
pub use outcome::{BatchOutcome, FailedItem};
pub use packaging::{PackageRule, PackagingPolicy};

use crate::clock::Clock;
use crate::config::LifecycleSettings;
use crate::coordinator::TransactionCoordinator;
use crate::entities::OrderStatus;
use crate::entities::order::{Order, OrderFilter, OrderHistory};
use crate::entities::outbox::NewOutboxEvent;
use crate::store::{OrderStore, OrderTx, StoreError};
use pickup_sdk::objects::{Actor, ActorType, DomainEvent, EventType, OrderInfo};
use rust_decimal::Decimal;
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::{info, warn};

/// Largest page [`OrderLifecycle::scroll_orders`] returns.
pub const MAX_PAGE_SIZE: i64 = 100;

/// Input to [`OrderLifecycle::accept_order`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewOrder {
    pub receiver_id: i64,
    pub order_id: i64,
    pub storage_until: OffsetDateTime,
    pub weight: Decimal,
    pub price: Decimal,
    pub package_code: String,
}

/// One page of [`OrderLifecycle::scroll_orders`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScrollPage {
    pub orders: Vec<Order>,
    /// Pass as `last_id` to get the next page. `0` when there is none.
    pub next_cursor: i64,
}

pub struct OrderLifecycle<S> {
    coordinator: TransactionCoordinator<S>,
    clock: Arc<dyn Clock>,
    settings: LifecycleSettings,
}

impl<S: OrderStore> OrderLifecycle<S> {
    pub fn new(store: S, clock: Arc<dyn Clock>, settings: LifecycleSettings) -> Self {
        Self {
            coordinator: TransactionCoordinator::new(store),
            clock,
            settings,
        }
    }

    fn store(&self) -> &S {
        self.coordinator.store()
    }

    async fn load(&self, order_id: i64) -> Result<Order, LifecycleError> {
        self.store()
            .get_order(order_id)
            .await?
            .ok_or(LifecycleError::NotFound(order_id))
    }

    fn point_actor(&self) -> Actor {
        Actor {
            actor_type: ActorType::PickupPoint,
            id: self.settings.point_id,
        }
    }

    fn client_actor(receiver_id: i64) -> Actor {
        Actor {
            actor_type: ActorType::Client,
            id: receiver_id,
        }
    }

    /// Persist `order` (insert when `is_new`, update otherwise) together with
    /// its history row and the outbox row for `event_type`.
    async fn commit(
        &self,
        order: Order,
        is_new: bool,
        event_type: EventType,
        actor: Actor,
    ) -> Result<(), LifecycleError> {
        let event = DomainEvent::new(
            event_type,
            order.last_update_time,
            actor,
            OrderInfo {
                id: order.id,
                user_id: order.receiver_id,
                status: order.status.into(),
            },
            self.settings.source.clone(),
        );
        let outbox = NewOutboxEvent {
            payload: event.to_payload()?,
            created_at: event.timestamp,
        };
        let history = order.history_entry();
        let order_id = order.id;

        self.coordinator
            .run_atomic(move |tx| {
                Box::pin(async move {
                    if is_new {
                        tx.insert_order(&order).await.map_err(|e| match e {
                            StoreError::Conflict { .. } => LifecycleError::AlreadyExists(order_id),
                            other => other.into(),
                        })?;
                    } else {
                        tx.update_order(&order).await.map_err(|e| match e {
                            StoreError::NotFound { .. } => LifecycleError::NotFound(order_id),
                            other => other.into(),
                        })?;
                    }
                    tx.append_history(&history).await?;
                    tx.insert_outbox(&outbox).await?;
                    Ok(())
                })
            })
            .await
    }

    /// Accept an order from a courier into storage. Returns the total price,
    /// package surcharges included.
    pub async fn accept_order(&self, new: NewOrder) -> Result<Decimal, LifecycleError> {
        let now = self.clock.now();
        if new.storage_until <= now {
            return Err(LifecycleError::Validation(format!(
                "storage deadline {} is not in the future",
                new.storage_until
            )));
        }
        if new.weight <= Decimal::ZERO {
            return Err(LifecycleError::Validation(format!(
                "weight must be positive, got {}",
                new.weight
            )));
        }
        if new.price <= Decimal::ZERO {
            return Err(LifecycleError::Validation(format!(
                "price must be positive, got {}",
                new.price
            )));
        }
        if !fits_column(new.weight, 3, 9) {
            return Err(LifecycleError::Validation(format!(
                "weight {} needs more than 3 decimal places or 9 integer digits",
                new.weight
            )));
        }
        let total_price =
            self.settings
                .packaging
                .total_price(&new.package_code, new.weight, new.price)?;
        if !fits_column(new.price, 2, 12) || !fits_column(total_price, 2, 12) {
            return Err(LifecycleError::Validation(format!(
                "price {} needs more than 2 decimal places or 12 integer digits",
                total_price
            )));
        }

        if self.store().get_order(new.order_id).await?.is_some() {
            return Err(LifecycleError::AlreadyExists(new.order_id));
        }

        let order = Order {
            id: new.order_id,
            receiver_id: new.receiver_id,
            status: OrderStatus::InStorage,
            storage_until: new.storage_until,
            accept_time: now,
            last_update_time: now,
            package_code: new.package_code,
            weight: new.weight,
            price: total_price,
        };
        let actor = self.point_actor();
        self.commit(order, true, EventType::Accepted, actor).await?;

        info!(order_id = new.order_id, receiver_id = new.receiver_id, %total_price, "Order accepted");
        Ok(total_price)
    }

    async fn issue_one(&self, receiver_id: i64, order_id: i64) -> Result<(), LifecycleError> {
        let mut order = self.load(order_id).await?;
        if order.receiver_id != receiver_id {
            return Err(LifecycleError::BelongsToDifferentReceiver { order_id });
        }
        match order.status {
            OrderStatus::GivenToClient => return Err(LifecycleError::AlreadyGiven(order_id)),
            OrderStatus::ReturnedFromClient => return Err(LifecycleError::Unavailable(order_id)),
            _ => {}
        }
        let now = self.clock.now();
        if now > order.storage_until {
            return Err(LifecycleError::StorageExpired(order_id));
        }
        order.status = order
            .status
            .transition(OrderStatus::GivenToClient)
            .map_err(|source| LifecycleError::InvalidTransition { order_id, source })?;
        order.last_update_time = now;

        self.commit(order, false, EventType::Issued, Self::client_actor(receiver_id))
            .await
    }

    /// Hand orders to their receiver. Each ID succeeds or fails on its own.
    pub async fn issue_orders_to_client(&self, receiver_id: i64, order_ids: &[i64]) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        for &order_id in order_ids {
            let result = self.issue_one(receiver_id, order_id).await;
            if let Err(e) = &result {
                warn!(order_id, receiver_id, error = %e, "Order not issued");
            }
            outcome.record(order_id, result);
        }
        info!(
            receiver_id,
            issued = outcome.succeeded.len(),
            failed = outcome.failed.len(),
            "Issued orders to client"
        );
        outcome
    }

    async fn take_back_one(&self, receiver_id: i64, order_id: i64) -> Result<(), LifecycleError> {
        let mut order = self.load(order_id).await?;
        if order.receiver_id != receiver_id {
            return Err(LifecycleError::BelongsToDifferentReceiver { order_id });
        }
        if order.status == OrderStatus::InStorage {
            return Err(LifecycleError::AlreadyInStorage(order_id));
        }
        let now = self.clock.now();
        order.status = order
            .status
            .transition(OrderStatus::ReturnedFromClient)
            .map_err(|source| LifecycleError::InvalidTransition { order_id, source })?;
        if now - order.last_update_time > self.settings.return_window {
            return Err(LifecycleError::ReturnPeriodExpired(order_id));
        }
        order.last_update_time = now;

        self.commit(
            order,
            false,
            EventType::ReturnedByClient,
            Self::client_actor(receiver_id),
        )
        .await
    }

    /// Take orders back from their receiver within the return window.
    pub async fn return_orders_from_client(
        &self,
        receiver_id: i64,
        order_ids: &[i64],
    ) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        for &order_id in order_ids {
            let result = self.take_back_one(receiver_id, order_id).await;
            if let Err(e) = &result {
                warn!(order_id, receiver_id, error = %e, "Order not taken back");
            }
            outcome.record(order_id, result);
        }
        info!(
            receiver_id,
            returned = outcome.succeeded.len(),
            failed = outcome.failed.len(),
            "Took back orders from client"
        );
        outcome
    }

    /// Hand an order back to the courier once its storage period is over.
    pub async fn return_order_to_delivery(&self, order_id: i64) -> Result<Order, LifecycleError> {
        let mut order = self.load(order_id).await?;
        let next = match order.status {
            OrderStatus::InStorage => OrderStatus::ReturnedWithoutClient,
            OrderStatus::ReturnedFromClient => OrderStatus::GivenToCourier,
            other if other.is_terminal() => {
                return Err(LifecycleError::Validation(format!(
                    "order {order_id} already left the pickup point ({other})"
                )));
            }
            other => {
                return Err(LifecycleError::Validation(format!(
                    "order {order_id} with status {other} cannot be returned to delivery"
                )));
            }
        };
        let now = self.clock.now();
        if now < order.storage_until {
            return Err(LifecycleError::StorageNotExpired(order_id));
        }
        order.status = order
            .status
            .transition(next)
            .map_err(|source| LifecycleError::InvalidTransition { order_id, source })?;
        order.last_update_time = now;

        let actor = self.point_actor();
        self.commit(order.clone(), false, EventType::ReturnedToCourier, actor)
            .await?;

        info!(order_id, status = %order.status, "Order returned to delivery");
        Ok(order)
    }

    pub async fn get_order(&self, order_id: i64) -> Result<Order, LifecycleError> {
        self.load(order_id).await
    }

    /// Orders with `id > last_id` matching `filter`, ascending by ID.
    /// `limit` is clamped to `1..=MAX_PAGE_SIZE`.
    pub async fn scroll_orders(
        &self,
        filter: &OrderFilter,
        last_id: i64,
        limit: i64,
    ) -> Result<ScrollPage, LifecycleError> {
        let limit = limit.clamp(1, MAX_PAGE_SIZE);
        let mut orders = self.store().scroll_orders(filter, last_id, limit + 1).await?;
        let has_more = orders.len() > limit as usize;
        orders.truncate(limit as usize);
        let next_cursor = match orders.last() {
            Some(last) if has_more => last.id,
            _ => 0,
        };
        Ok(ScrollPage {
            orders,
            next_cursor,
        })
    }

    /// Every accepted transition of an order, oldest first.
    pub async fn order_history(&self, order_id: i64) -> Result<Vec<OrderHistory>, LifecycleError> {
        self.load(order_id).await?;
        Ok(self.store().order_history(order_id).await?)
    }
}

/// Whether `value` is stored unrounded by a `NUMERIC(integer_digits + scale, scale)` column.
fn fits_column(value: Decimal, scale: u32, integer_digits: u32) -> bool {
    value.normalize().scale() <= scale
        && value.trunc().abs() < Decimal::from(10_i64.pow(integer_digits))
}
