use super::{HandlerError, MessageHandler, Record};
use async_trait::async_trait;
use pickup_sdk::objects::DomainEvent;
use std::collections::{HashSet, VecDeque};
use std::sync::{Mutex, PoisonError};
use tracing::debug;
use uuid::Uuid;

/// Skips events whose `event_id` was already handled successfully.
///
/// Remembers the last `window` event IDs. Payloads that are not a
/// [`DomainEvent`] are passed through untouched.
pub struct Deduplicate<H> {
    inner: H,
    window: usize,
    seen: Mutex<Seen>,
}

#[derive(Default)]
struct Seen {
    ids: HashSet<Uuid>,
    order: VecDeque<Uuid>,
}

impl Seen {
    fn insert(&mut self, id: Uuid, window: usize) {
        if !self.ids.insert(id) {
            return;
        }
        self.order.push_back(id);
        while self.order.len() > window {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
    }
}

impl<H: MessageHandler> Deduplicate<H> {
    pub fn new(inner: H, window: usize) -> Self {
        Self {
            inner,
            window: window.max(1),
            seen: Mutex::new(Seen::default()),
        }
    }

    fn seen(&self) -> std::sync::MutexGuard<'_, Seen> {
        self.seen.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl<H: MessageHandler> MessageHandler for Deduplicate<H> {
    async fn handle(&self, record: &Record) -> Result<(), HandlerError> {
        let event_id = DomainEvent::from_payload(&record.payload)
            .ok()
            .map(|e| e.event_id);

        let duplicate = event_id.is_some_and(|id| self.seen().ids.contains(&id));
        if duplicate {
            debug!(event_id = ?event_id, offset = record.offset, "Skipping duplicate event");
            return Ok(());
        }

        self.inner.handle(record).await?;

        if let Some(id) = event_id {
            self.seen().insert(id, self.window);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pickup_sdk::objects::{Actor, ActorType, EventType, OrderInfo, OrderStatus};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use time::macros::datetime;

    #[derive(Default)]
    struct Counter(AtomicUsize);

    #[async_trait]
    impl MessageHandler for Counter {
        async fn handle(&self, _record: &Record) -> Result<(), HandlerError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn record(offset: i64, event: &DomainEvent) -> Record {
        Record {
            partition: 0,
            offset,
            payload: event.to_payload().unwrap(),
        }
    }

    fn event() -> DomainEvent {
        DomainEvent::new(
            EventType::Issued,
            datetime!(2026-01-01 0:00 UTC),
            Actor {
                actor_type: ActorType::Client,
                id: 100,
            },
            OrderInfo {
                id: 1,
                user_id: 100,
                status: OrderStatus::GivenToClient,
            },
            "pickup-point",
        )
    }

    #[tokio::test]
    async fn test_duplicates_are_dropped() {
        let counter = Arc::new(Counter::default());
        let dedup = Deduplicate::new(Arc::clone(&counter), 16);
        let first = event();
        let second = event();

        dedup.handle(&record(0, &first)).await.unwrap();
        dedup.handle(&record(1, &first)).await.unwrap();
        dedup.handle(&record(2, &second)).await.unwrap();

        assert_eq!(counter.0.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_window_is_bounded() {
        let counter = Arc::new(Counter::default());
        let dedup = Deduplicate::new(Arc::clone(&counter), 1);
        let first = event();
        let second = event();

        dedup.handle(&record(0, &first)).await.unwrap();
        dedup.handle(&record(1, &second)).await.unwrap();
        // `first` fell out of the window
        dedup.handle(&record(2, &first)).await.unwrap();

        assert_eq!(counter.0.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_foreign_payloads_pass_through() {
        let counter = Arc::new(Counter::default());
        let dedup = Deduplicate::new(Arc::clone(&counter), 4);
        let raw = Record {
            partition: 0,
            offset: 0,
            payload: b"plain text".to_vec(),
        };

        dedup.handle(&raw).await.unwrap();
        dedup.handle(&raw).await.unwrap();

        assert_eq!(counter.0.load(Ordering::SeqCst), 2);
    }
}
