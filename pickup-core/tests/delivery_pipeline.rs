//! Order changes flowing through the outbox, the relay, the DLQ and a
//! consumer group, all in memory.

use async_trait::async_trait;
use pickup_core::broker::{
    ConsumerSettings, Deduplicate, GroupConsumer, HandlerError, MemoryBroker, MessageHandler,
    Producer, Record,
};
use pickup_core::clock::ManualClock;
use pickup_core::config::{DlqSettings, LifecycleSettings, RelaySettings};
use pickup_core::entities::OrderStatus;
use pickup_core::entities::outbox::OutboxStatus;
use pickup_core::lifecycle::{NewOrder, OrderLifecycle};
use pickup_core::processors::{DlqWorker, OutboxRelay};
use pickup_core::store::MemoryStore;
use pickup_sdk::objects::{DomainEvent, EventType};
use rust_decimal::Decimal;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use time::OffsetDateTime;
use time::macros::datetime;
use tokio_util::sync::CancellationToken;

const T0: OffsetDateTime = datetime!(2026-03-02 9:00 UTC);

#[derive(Default)]
struct Collector {
    events: Mutex<Vec<DomainEvent>>,
}

impl Collector {
    fn events(&self) -> Vec<DomainEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessageHandler for Collector {
    async fn handle(&self, record: &Record) -> Result<(), HandlerError> {
        let event = DomainEvent::from_payload(&record.payload)?;
        self.events.lock().unwrap().push(event);
        Ok(())
    }
}

fn consumer_settings() -> ConsumerSettings {
    ConsumerSettings {
        retry_backoff: Duration::from_millis(10),
        ..ConsumerSettings::new("notifications")
    }
}

async fn wait_for(mut done: impl FnMut() -> bool) {
    for _ in 0..300 {
        if done() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

fn new_order(order_id: i64) -> NewOrder {
    NewOrder {
        receiver_id: 100,
        order_id,
        storage_until: T0 + time::Duration::hours(24),
        weight: Decimal::from(5),
        price: Decimal::from(100),
        package_code: "bag".to_string(),
    }
}

#[tokio::test]
async fn test_every_transition_reaches_the_consumer_once() {
    let store = MemoryStore::new();
    let broker = MemoryBroker::new(2);
    let clock = ManualClock::new(T0);
    let lifecycle = OrderLifecycle::new(
        store.clone(),
        Arc::new(clock.clone()),
        LifecycleSettings::default(),
    );

    let total = lifecycle.accept_order(new_order(1)).await.unwrap();
    assert_eq!(total, Decimal::from(105));
    assert!(lifecycle.issue_orders_to_client(100, &[1]).await.is_complete());
    clock.advance(time::Duration::hours(1));
    assert!(
        lifecycle
            .return_orders_from_client(100, &[1])
            .await
            .is_complete()
    );
    clock.advance(time::Duration::hours(24));
    let order = lifecycle.return_order_to_delivery(1).await.unwrap();
    assert_eq!(order.status, OrderStatus::GivenToCourier);
    assert_eq!(store.outbox_events().len(), 4);

    // The first publish fails and the event goes to the DLQ.
    broker.fail_next_sends(1);
    let relay = OutboxRelay::new(store.clone(), broker.clone(), Arc::new(clock.clone()));
    let relay_settings = RelaySettings::default();
    let report = relay
        .relay_once(&relay_settings, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.published, 3);
    assert_eq!(report.dead_lettered, 1);
    assert_eq!(store.dlq_messages().len(), 1);

    let collector = Arc::new(Collector::default());
    let shutdown = CancellationToken::new();
    let consumer = GroupConsumer::new(
        broker.clone(),
        Deduplicate::new(Arc::clone(&collector), 64),
        consumer_settings(),
    );
    let consumer_task = tokio::spawn(consumer.run(shutdown.clone()));

    clock.advance(relay_settings.dlq_base_delay);
    let worker = DlqWorker::new(store.clone(), broker.clone(), Arc::new(clock.clone()));
    let report = worker
        .retry_once(&DlqSettings::default(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.resent, 1);
    assert!(store.dlq_messages().is_empty());

    // Redeliver an already handled event the way a relay crash would.
    let duplicate = store.outbox_events()[1].payload.clone();
    broker
        .send(&CancellationToken::new(), &duplicate)
        .await
        .unwrap();
    assert_eq!(broker.message_count(), 5);

    wait_for(|| collector.events().len() >= 4).await;
    // give the duplicate time to arrive and be dropped
    tokio::time::sleep(Duration::from_millis(50)).await;
    shutdown.cancel();
    consumer_task.await.unwrap().unwrap();

    let events = collector.events();
    assert_eq!(events.len(), 4);
    let types: HashSet<EventType> = events.iter().map(|e| e.event_type).collect();
    assert_eq!(
        types,
        HashSet::from([
            EventType::Accepted,
            EventType::Issued,
            EventType::ReturnedByClient,
            EventType::ReturnedToCourier,
        ])
    );
    assert!(events.iter().all(|e| e.order.id == 1 && e.order.user_id == 100));
    assert!(
        store
            .outbox_events()
            .iter()
            .all(|e| matches!(e.status, OutboxStatus::Completed | OutboxStatus::Failed))
    );
}

#[tokio::test]
async fn test_replicated_relays_and_consumers() {
    let store = MemoryStore::new();
    let broker = MemoryBroker::new(4);
    let clock = ManualClock::new(T0);
    let lifecycle = OrderLifecycle::new(
        store.clone(),
        Arc::new(clock.clone()),
        LifecycleSettings::default(),
    );
    for order_id in 1..=20 {
        lifecycle.accept_order(new_order(order_id)).await.unwrap();
    }

    let collector = Arc::new(Collector::default());
    let shutdown = CancellationToken::new();
    let consumers: Vec<_> = (0..2)
        .map(|_| {
            let consumer = GroupConsumer::new(
                broker.clone(),
                Deduplicate::new(Arc::clone(&collector), 64),
                consumer_settings(),
            );
            tokio::spawn(consumer.run(shutdown.clone()))
        })
        .collect();

    let settings = RelaySettings {
        batch_size: 3,
        ..Default::default()
    };
    let cancel = CancellationToken::new();
    let a = OutboxRelay::new(store.clone(), broker.clone(), Arc::new(clock.clone()));
    let b = OutboxRelay::new(store.clone(), broker.clone(), Arc::new(clock.clone()));
    loop {
        let (ra, rb) = tokio::join!(
            a.relay_once(&settings, &cancel),
            b.relay_once(&settings, &cancel)
        );
        if ra.unwrap().claimed + rb.unwrap().claimed == 0 {
            break;
        }
    }
    assert_eq!(broker.message_count(), 20);

    wait_for(|| collector.events().len() >= 20).await;
    shutdown.cancel();
    for consumer in consumers {
        consumer.await.unwrap().unwrap();
    }

    let orders: HashSet<i64> = collector.events().iter().map(|e| e.order.id).collect();
    assert_eq!(orders, (1..=20).collect::<HashSet<_>>());
}
