//! In-process stores.
//!
//! One [`MemoryStore`] owns every table behind a single mutex. Cloning shares
//! the same tables. Used by tests and local runs without Postgres; failures
//! can be injected through [`MemoryFaults`] to exercise rollback paths.

use super::{
    DlqBatch, DlqStore, OrderStore, OrderTx, OutboxBatch, OutboxStore, StoreError,
};
use crate::entities::dlq::{DlqMessage, NewDlqMessage};
use crate::entities::order::{Order, OrderFilter, OrderHistory};
use crate::entities::outbox::{NewOutboxEvent, OutboxEvent, OutboxStatus};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use time::OffsetDateTime;

/// Failures to inject into upcoming operations. Each counter is decremented
/// as the matching operation fails.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryFaults {
    pub fail_history_appends: u32,
    pub fail_outbox_inserts: u32,
    pub fail_commits: u32,
}

#[derive(Default)]
struct Tables {
    orders: BTreeMap<i64, Order>,
    history: Vec<OrderHistory>,
    outbox: BTreeMap<i64, OutboxEvent>,
    dlq: BTreeMap<i64, DlqMessage>,
    next_outbox_id: i64,
    next_dlq_id: i64,
    claimed_outbox: HashSet<i64>,
    claimed_dlq: HashSet<i64>,
    faults: MemoryFaults,
}

fn take_fault(counter: &mut u32) -> bool {
    if *counter > 0 {
        *counter -= 1;
        true
    } else {
        false
    }
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the pending fault counters.
    pub fn inject(&self, faults: MemoryFaults) {
        self.lock().faults = faults;
    }

    pub fn order_count(&self) -> usize {
        self.lock().orders.len()
    }

    /// Snapshot of every outbox row, ascending by ID.
    pub fn outbox_events(&self) -> Vec<OutboxEvent> {
        self.lock().outbox.values().cloned().collect()
    }

    /// Snapshot of every DLQ row, ascending by ID.
    pub fn dlq_messages(&self) -> Vec<DlqMessage> {
        self.lock().dlq.values().cloned().collect()
    }
}

// -- Orders --------------------------------------------------------------

#[async_trait]
impl OrderStore for MemoryStore {
    type Tx = MemoryTx;

    async fn begin(&self) -> Result<MemoryTx, StoreError> {
        Ok(MemoryTx {
            store: self.clone(),
            writes: Vec::new(),
        })
    }

    async fn get_order(&self, order_id: i64) -> Result<Option<Order>, StoreError> {
        Ok(self.lock().orders.get(&order_id).cloned())
    }

    async fn scroll_orders(
        &self,
        filter: &OrderFilter,
        last_id: i64,
        limit: i64,
    ) -> Result<Vec<Order>, StoreError> {
        let limit = usize::try_from(limit).unwrap_or(0);
        Ok(self
            .lock()
            .orders
            .range(last_id.saturating_add(1)..)
            .map(|(_, order)| order)
            .filter(|order| filter.matches(order))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn order_history(&self, order_id: i64) -> Result<Vec<OrderHistory>, StoreError> {
        let mut rows: Vec<_> = self
            .lock()
            .history
            .iter()
            .filter(|h| h.order_id == order_id)
            .cloned()
            .collect();
        rows.sort_by_key(|h| h.changed_at);
        Ok(rows)
    }
}

enum Write {
    InsertOrder(Order),
    UpdateOrder(Order),
    History(OrderHistory),
    Outbox(OutboxEvent),
}

/// Buffered writes, applied together on commit and discarded otherwise.
pub struct MemoryTx {
    store: MemoryStore,
    writes: Vec<Write>,
}

impl MemoryTx {
    fn pending_insert(&self, order_id: i64) -> bool {
        self.writes
            .iter()
            .any(|w| matches!(w, Write::InsertOrder(o) if o.id == order_id))
    }
}

#[async_trait]
impl OrderTx for MemoryTx {
    async fn insert_order(&mut self, order: &Order) -> Result<(), StoreError> {
        let exists = self.store.lock().orders.contains_key(&order.id);
        if exists || self.pending_insert(order.id) {
            return Err(StoreError::Conflict {
                entity: "order",
                id: order.id,
            });
        }
        self.writes.push(Write::InsertOrder(order.clone()));
        Ok(())
    }

    async fn update_order(&mut self, order: &Order) -> Result<(), StoreError> {
        let exists = self.store.lock().orders.contains_key(&order.id);
        if !exists && !self.pending_insert(order.id) {
            return Err(StoreError::NotFound {
                entity: "order",
                id: order.id,
            });
        }
        self.writes.push(Write::UpdateOrder(order.clone()));
        Ok(())
    }

    async fn append_history(&mut self, entry: &OrderHistory) -> Result<(), StoreError> {
        if take_fault(&mut self.store.lock().faults.fail_history_appends) {
            return Err(StoreError::Unavailable("history append failed".to_string()));
        }
        self.writes.push(Write::History(entry.clone()));
        Ok(())
    }

    async fn insert_outbox(&mut self, event: &NewOutboxEvent) -> Result<i64, StoreError> {
        let id = {
            let mut tables = self.store.lock();
            if take_fault(&mut tables.faults.fail_outbox_inserts) {
                return Err(StoreError::Unavailable("outbox insert failed".to_string()));
            }
            tables.next_outbox_id += 1;
            tables.next_outbox_id
        };
        self.writes.push(Write::Outbox(OutboxEvent {
            id,
            payload: event.payload.clone(),
            status: OutboxStatus::Created,
            error: None,
            created_at: event.created_at,
            sent_at: None,
        }));
        Ok(id)
    }

    async fn commit(self) -> Result<(), StoreError> {
        let mut tables = self.store.lock();
        if take_fault(&mut tables.faults.fail_commits) {
            return Err(StoreError::Unavailable("commit failed".to_string()));
        }
        for write in &self.writes {
            if let Write::InsertOrder(order) = write
                && tables.orders.contains_key(&order.id)
            {
                return Err(StoreError::Conflict {
                    entity: "order",
                    id: order.id,
                });
            }
        }
        for write in self.writes {
            match write {
                Write::InsertOrder(order) | Write::UpdateOrder(order) => {
                    tables.orders.insert(order.id, order);
                }
                Write::History(entry) => tables.history.push(entry),
                Write::Outbox(event) => {
                    tables.outbox.insert(event.id, event);
                }
            }
        }
        Ok(())
    }

    async fn rollback(self) -> Result<(), StoreError> {
        Ok(())
    }
}

// -- Outbox --------------------------------------------------------------

/// Claimed outbox rows.
///
/// Status changes and DLQ hand-offs are staged on the batch and applied
/// together by `finish`. Dropping the batch discards them and releases the
/// claim, so every row goes back to `CREATED`.
pub struct MemoryOutboxBatch {
    store: MemoryStore,
    events: Vec<OutboxEvent>,
    staged: BTreeMap<i64, OutboxEvent>,
    dead_letters: Vec<DlqMessage>,
}

impl MemoryOutboxBatch {
    fn advance(
        &mut self,
        id: i64,
        next: OutboxStatus,
        apply: impl FnOnce(&mut OutboxEvent),
    ) -> Result<(), StoreError> {
        let not_found = || StoreError::NotFound {
            entity: "outbox event",
            id,
        };
        let event = self.staged.get_mut(&id).ok_or_else(not_found)?;
        // the Postgres UPDATE filters on the current status; a mismatch
        // touches zero rows
        event.status = event.status.advance(next).map_err(|_| not_found())?;
        apply(event);
        Ok(())
    }
}

impl Drop for MemoryOutboxBatch {
    fn drop(&mut self) {
        let mut tables = self.store.lock();
        for event in &self.events {
            tables.claimed_outbox.remove(&event.id);
        }
    }
}

#[async_trait]
impl OutboxStore for MemoryStore {
    type Batch = MemoryOutboxBatch;

    async fn claim_created(&self, limit: i64) -> Result<MemoryOutboxBatch, StoreError> {
        let limit = usize::try_from(limit).unwrap_or(0);
        let mut tables = self.lock();
        let mut events: Vec<OutboxEvent> = tables
            .outbox
            .values()
            .filter(|e| e.status == OutboxStatus::Created)
            .filter(|e| !tables.claimed_outbox.contains(&e.id))
            .cloned()
            .collect();
        events.sort_by_key(|e| (e.created_at, e.id));
        events.truncate(limit);
        for event in &events {
            tables.claimed_outbox.insert(event.id);
        }
        drop(tables);
        Ok(MemoryOutboxBatch {
            store: self.clone(),
            staged: events.iter().map(|e| (e.id, e.clone())).collect(),
            events,
            dead_letters: Vec::new(),
        })
    }

    async fn get_outbox_event(&self, id: i64) -> Result<Option<OutboxEvent>, StoreError> {
        Ok(self.lock().outbox.get(&id).cloned())
    }
}

#[async_trait]
impl OutboxBatch for MemoryOutboxBatch {
    fn events(&self) -> &[OutboxEvent] {
        &self.events
    }

    async fn mark_processing(&mut self, id: i64) -> Result<(), StoreError> {
        self.advance(id, OutboxStatus::Processing, |_| {})
    }

    async fn mark_completed(
        &mut self,
        id: i64,
        sent_at: OffsetDateTime,
    ) -> Result<(), StoreError> {
        self.advance(id, OutboxStatus::Completed, |e| {
            e.sent_at = Some(sent_at);
            e.error = None;
        })
    }

    async fn mark_failed(&mut self, id: i64, error: &str) -> Result<(), StoreError> {
        self.advance(id, OutboxStatus::Failed, |e| e.error = Some(error.to_string()))
    }

    async fn dead_letter(&mut self, message: &NewDlqMessage) -> Result<i64, StoreError> {
        let id = next_dlq_id(&mut self.store.lock());
        self.dead_letters.push(dlq_row(id, message));
        Ok(id)
    }

    async fn finish(mut self) -> Result<(), StoreError> {
        let staged = std::mem::take(&mut self.staged);
        let dead_letters = std::mem::take(&mut self.dead_letters);
        let mut tables = self.store.lock();
        if take_fault(&mut tables.faults.fail_commits) {
            return Err(StoreError::Unavailable("commit failed".to_string()));
        }
        for (id, event) in staged {
            tables.outbox.insert(id, event);
        }
        for message in dead_letters {
            tables.dlq.insert(message.id, message);
        }
        Ok(())
    }
}

// -- DLQ -----------------------------------------------------------------

fn next_dlq_id(tables: &mut Tables) -> i64 {
    tables.next_dlq_id += 1;
    tables.next_dlq_id
}

fn dlq_row(id: i64, message: &NewDlqMessage) -> DlqMessage {
    DlqMessage {
        id,
        original_id: message.original_id,
        payload: message.payload.clone(),
        error: message.error.clone(),
        attempts: message.attempts,
        created_at: message.created_at,
        failed_at: message.created_at,
        retry_after: message.retry_after,
        process_count: 0,
        max_retries: message.max_retries,
    }
}

/// Claimed DLQ rows. Deletes and failure records are staged like
/// [`MemoryOutboxBatch`] and only land on `finish`.
pub struct MemoryDlqBatch {
    store: MemoryStore,
    messages: Vec<DlqMessage>,
    staged: BTreeMap<i64, DlqMessage>,
    deleted: Vec<i64>,
}

impl Drop for MemoryDlqBatch {
    fn drop(&mut self) {
        let mut tables = self.store.lock();
        for message in &self.messages {
            tables.claimed_dlq.remove(&message.id);
        }
    }
}

#[async_trait]
impl DlqStore for MemoryStore {
    type Batch = MemoryDlqBatch;

    async fn insert_dlq(&self, message: &NewDlqMessage) -> Result<i64, StoreError> {
        let mut tables = self.lock();
        let id = next_dlq_id(&mut tables);
        tables.dlq.insert(id, dlq_row(id, message));
        Ok(id)
    }

    async fn claim_due(
        &self,
        now: OffsetDateTime,
        limit: i64,
    ) -> Result<MemoryDlqBatch, StoreError> {
        let limit = usize::try_from(limit).unwrap_or(0);
        let mut tables = self.lock();
        let mut messages: Vec<DlqMessage> = tables
            .dlq
            .values()
            .filter(|m| m.is_retry_eligible(now))
            .filter(|m| !tables.claimed_dlq.contains(&m.id))
            .cloned()
            .collect();
        messages.sort_by_key(|m| (m.retry_after, m.id));
        messages.truncate(limit);
        for message in &messages {
            tables.claimed_dlq.insert(message.id);
        }
        drop(tables);
        Ok(MemoryDlqBatch {
            store: self.clone(),
            staged: messages.iter().map(|m| (m.id, m.clone())).collect(),
            messages,
            deleted: Vec::new(),
        })
    }

    async fn get_dlq_message(&self, id: i64) -> Result<Option<DlqMessage>, StoreError> {
        Ok(self.lock().dlq.get(&id).cloned())
    }

    async fn list_parked(&self, limit: i64) -> Result<Vec<DlqMessage>, StoreError> {
        let limit = usize::try_from(limit).unwrap_or(0);
        let mut parked: Vec<_> = self
            .lock()
            .dlq
            .values()
            .filter(|m| m.is_parked())
            .cloned()
            .collect();
        parked.sort_by(|a, b| b.failed_at.cmp(&a.failed_at).then(b.id.cmp(&a.id)));
        parked.truncate(limit);
        Ok(parked)
    }
}

#[async_trait]
impl DlqBatch for MemoryDlqBatch {
    fn messages(&self) -> &[DlqMessage] {
        &self.messages
    }

    async fn delete(&mut self, id: i64) -> Result<(), StoreError> {
        self.staged.remove(&id).ok_or(StoreError::NotFound {
            entity: "dlq message",
            id,
        })?;
        self.deleted.push(id);
        Ok(())
    }

    async fn record_failure(
        &mut self,
        id: i64,
        error: &str,
        failed_at: OffsetDateTime,
        retry_after: OffsetDateTime,
    ) -> Result<(), StoreError> {
        let message = self.staged.get_mut(&id).ok_or(StoreError::NotFound {
            entity: "dlq message",
            id,
        })?;
        message.process_count += 1;
        message.error = error.to_string();
        message.failed_at = failed_at;
        message.retry_after = retry_after;
        Ok(())
    }

    async fn finish(mut self) -> Result<(), StoreError> {
        let staged = std::mem::take(&mut self.staged);
        let deleted = std::mem::take(&mut self.deleted);
        let mut tables = self.store.lock();
        if take_fault(&mut tables.faults.fail_commits) {
            return Err(StoreError::Unavailable("commit failed".to_string()));
        }
        for id in deleted {
            tables.dlq.remove(&id);
        }
        for (id, message) in staged {
            tables.dlq.insert(id, message);
        }
        Ok(())
    }
}
