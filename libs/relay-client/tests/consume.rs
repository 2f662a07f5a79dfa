mod common;

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use offset_store_file::FileOffsetStore;
use offset_store_memory::MemoryOffsetStore;
use relay_api::dead_letter::{HEADER_DELIVERY_COUNT, HEADER_ORIGINAL_OFFSET, HEADER_REASON};
use relay_api::{DeadLetterReason, Delivery, Message, OffsetError, OffsetStore, PartitionId};
use relay_client::{
    AckMode, BackoffConfig, ConnectionManager, Consumer, ConsumeError, DeliveryMode, HandlerError,
    HandlerResult, Outcome, PublishOptions, Publisher, PublisherConfig, StartPosition,
    SubscribeOptions, TopicDeadLetter,
};

use common::{ENDPOINT, MemoryDeadLetter, options, setup, wait_until};

const WAIT: Duration = Duration::from_secs(5);

type Seen = Arc<Mutex<Vec<(u64, u32)>>>;

type BoxedResult = Pin<Box<dyn Future<Output = HandlerResult> + Send>>;

/// Handler that records `(offset, delivery_count)` and answers with `outcome`.
fn recording(seen: &Seen, outcome: Outcome) -> impl Fn(Delivery) -> BoxedResult + Send + Sync + 'static {
    let seen = seen.clone();
    move |d: Delivery| -> BoxedResult {
        seen.lock().unwrap().push((d.offset(), d.delivery_count));
        Box::pin(async move { Ok::<Outcome, HandlerError>(outcome) })
    }
}

fn offsets(seen: &Seen) -> Vec<u64> {
    seen.lock().unwrap().iter().map(|(o, _)| *o).collect()
}

fn seed(broker: &loopback_broker::LoopbackBroker, topic: &str, n: usize) {
    for i in 0..n {
        broker.append(topic, 0, Message::new(format!("m{i}")));
    }
}

#[tokio::test]
async fn test_consume_in_order_and_commit() {
    let (broker, manager) = setup(&[("orders", 1)]).await;
    seed(&broker, "orders", 10);
    let store = Arc::new(MemoryOffsetStore::new());
    let consumer = Consumer::new(manager.clone(), store.clone());

    let seen = Seen::default();
    let sub = consumer
        .subscribe(&["orders"], recording(&seen, Outcome::Ack), options())
        .await
        .unwrap();

    let p = PartitionId::new("orders", 0);
    assert!(wait_until(WAIT, || sub.committed(&p) == Some(9)).await);
    assert_eq!(offsets(&seen), (0..10).collect::<Vec<u64>>());
    assert_eq!(sub.pending_count(&p), 0);
    assert_eq!(sub.stats().acked, 10);

    sub.cancel().await.unwrap();
    assert_eq!(store.load(&p).await.unwrap(), Some(9));
}

#[tokio::test]
async fn test_cursor_regression_rejected() {
    let store = MemoryOffsetStore::new();
    let p = PartitionId::new("orders", 0);
    store.advance(&p, 5).await.unwrap();
    store.advance(&p, 5).await.unwrap();
    let err = store.advance(&p, 3).await.unwrap_err();
    assert!(matches!(err, OffsetError::Regression(_)));
    assert_eq!(store.load(&p).await.unwrap(), Some(5));
}

#[tokio::test]
async fn test_redelivery_until_dead_letter() {
    let (broker, manager) = setup(&[("orders", 1)]).await;
    seed(&broker, "orders", 1);
    let dlq = Arc::new(MemoryDeadLetter::default());
    let consumer =
        Consumer::new(manager.clone(), Arc::new(MemoryOffsetStore::new())).with_dead_letter(dlq.clone());

    let seen = Seen::default();
    let sub = consumer
        .subscribe(
            &["orders"],
            recording(&seen, Outcome::retry()),
            SubscribeOptions {
                max_redeliveries: 3,
                ..options()
            },
        )
        .await
        .unwrap();

    let p = PartitionId::new("orders", 0);
    assert!(wait_until(WAIT, || sub.committed(&p) == Some(0)).await);
    assert_eq!(*seen.lock().unwrap(), vec![(0, 1), (0, 2), (0, 3)]);

    let letters = dlq.letters();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].0.delivery_count, 3);
    assert_eq!(letters[0].1, DeadLetterReason::MaxRedeliveries);

    let stats = sub.stats();
    assert_eq!(stats.delivered, 3);
    assert_eq!(stats.nacked, 3);
    assert_eq!(stats.redelivered, 2);
    assert_eq!(stats.dead_lettered, 1);
    sub.cancel().await.unwrap();
}

#[tokio::test]
async fn test_redelivery_blocks_later_commit() {
    let (broker, manager) = setup(&[("orders", 1)]).await;
    seed(&broker, "orders", 3);
    let consumer = Consumer::new(manager.clone(), Arc::new(MemoryOffsetStore::new()));

    // Offset 0 fails once, everything else is acked.
    let seen = Seen::default();
    let s = seen.clone();
    let handler = move |d: Delivery| {
        s.lock().unwrap().push((d.offset(), d.delivery_count));
        let outcome = if d.offset() == 0 && d.delivery_count == 1 {
            Outcome::retry()
        } else {
            Outcome::Ack
        };
        async move { Ok::<Outcome, HandlerError>(outcome) }
    };
    let sub = consumer.subscribe(&["orders"], handler, options()).await.unwrap();

    let p = PartitionId::new("orders", 0);
    assert!(wait_until(WAIT, || sub.committed(&p) == Some(2)).await);
    // Redelivery is served before newer records.
    assert_eq!(*seen.lock().unwrap(), vec![(0, 1), (0, 2), (1, 1), (2, 1)]);
    sub.cancel().await.unwrap();
}

#[tokio::test]
async fn test_reject_dead_letters_immediately() {
    let (broker, manager) = setup(&[("orders", 1)]).await;
    seed(&broker, "orders", 2);
    let dlq = Arc::new(MemoryDeadLetter::default());
    let consumer =
        Consumer::new(manager.clone(), Arc::new(MemoryOffsetStore::new())).with_dead_letter(dlq.clone());

    let seen = Seen::default();
    let sub = consumer
        .subscribe(&["orders"], recording(&seen, Outcome::reject()), options())
        .await
        .unwrap();

    let p = PartitionId::new("orders", 0);
    assert!(wait_until(WAIT, || sub.committed(&p) == Some(1)).await);
    assert_eq!(*seen.lock().unwrap(), vec![(0, 1), (1, 1)]);
    let reasons: Vec<DeadLetterReason> = dlq.letters().into_iter().map(|(_, r)| r).collect();
    assert_eq!(reasons, vec![DeadLetterReason::Rejected, DeadLetterReason::Rejected]);
    sub.cancel().await.unwrap();
}

#[tokio::test]
async fn test_handler_error_becomes_poison() {
    let (broker, manager) = setup(&[("orders", 1)]).await;
    seed(&broker, "orders", 1);
    let dlq = Arc::new(MemoryDeadLetter::default());
    let consumer =
        Consumer::new(manager.clone(), Arc::new(MemoryOffsetStore::new())).with_dead_letter(dlq.clone());

    let calls = Arc::new(AtomicU32::new(0));
    let c = calls.clone();
    let handler = move |_d: Delivery| {
        c.fetch_add(1, Ordering::SeqCst);
        async move { Err::<Outcome, HandlerError>("boom".into()) }
    };
    let sub = consumer
        .subscribe(
            &["orders"],
            handler,
            SubscribeOptions {
                poison_threshold: 2,
                max_redeliveries: 5,
                ..options()
            },
        )
        .await
        .unwrap();

    let p = PartitionId::new("orders", 0);
    assert!(wait_until(WAIT, || sub.committed(&p) == Some(0)).await);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    let letters = dlq.letters();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].1, DeadLetterReason::Poison { error: "boom".into() });
    assert_eq!(sub.stats().handler_failures, 2);
    sub.cancel().await.unwrap();
}

#[tokio::test]
async fn test_handler_panic_is_contained() {
    let (broker, manager) = setup(&[("orders", 1)]).await;
    seed(&broker, "orders", 2);
    let dlq = Arc::new(MemoryDeadLetter::default());
    let consumer =
        Consumer::new(manager.clone(), Arc::new(MemoryOffsetStore::new())).with_dead_letter(dlq.clone());

    let seen = Seen::default();
    let s = seen.clone();
    let handler = move |d: Delivery| {
        s.lock().unwrap().push((d.offset(), d.delivery_count));
        async move {
            if d.offset() == 0 {
                panic!("kaboom");
            }
            Ok::<Outcome, HandlerError>(Outcome::Ack)
        }
    };
    let sub = consumer
        .subscribe(
            &["orders"],
            handler,
            SubscribeOptions {
                poison_threshold: 1,
                ..options()
            },
        )
        .await
        .unwrap();

    let p = PartitionId::new("orders", 0);
    assert!(wait_until(WAIT, || sub.committed(&p) == Some(1)).await);
    let letters = dlq.letters();
    assert_eq!(letters.len(), 1);
    match &letters[0].1 {
        DeadLetterReason::Poison { error } => assert!(error.contains("kaboom")),
        other => panic!("unexpected reason {other:?}"),
    }
    assert_eq!(offsets(&seen), vec![0, 1]);
    sub.cancel().await.unwrap();
}

#[tokio::test]
async fn test_resume_after_crash_from_file_cursor() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cursors.json");
    let (broker, manager) = setup(&[("orders", 1)]).await;
    seed(&broker, "orders", 20);

    // First run: acks 0..=10, then hangs on 11 and is abandoned.
    let store = Arc::new(FileOffsetStore::open(&path).unwrap());
    let consumer = Consumer::new(manager.clone(), store.clone());
    let seen = Seen::default();
    let s = seen.clone();
    let handler = move |d: Delivery| {
        s.lock().unwrap().push((d.offset(), d.delivery_count));
        async move {
            if d.offset() > 10 {
                std::future::pending::<()>().await;
            }
            Ok::<Outcome, HandlerError>(Outcome::Ack)
        }
    };
    let sub = consumer
        .subscribe(
            &["orders"],
            handler,
            SubscribeOptions {
                drain_timeout: Duration::from_millis(50),
                ..options()
            },
        )
        .await
        .unwrap();
    assert!(wait_until(WAIT, || offsets(&seen).contains(&11)).await);
    sub.cancel().await.unwrap();
    drop(consumer);
    drop(store);

    // Second run on a fresh store instance reading the same file.
    let store = Arc::new(FileOffsetStore::open(&path).unwrap());
    let p = PartitionId::new("orders", 0);
    assert_eq!(store.load(&p).await.unwrap(), Some(10));

    let consumer = Consumer::new(manager.clone(), store.clone());
    let resumed = Seen::default();
    let sub = consumer
        .subscribe(&["orders"], recording(&resumed, Outcome::Ack), options())
        .await
        .unwrap();
    assert!(wait_until(WAIT, || sub.committed(&p) == Some(19)).await);
    assert_eq!(offsets(&resumed), (11..20).collect::<Vec<u64>>());
    sub.cancel().await.unwrap();
}

#[tokio::test]
async fn test_replay_below_cursor_does_not_regress() {
    let (broker, manager) = setup(&[("orders", 1)]).await;
    seed(&broker, "orders", 5);
    let store = Arc::new(MemoryOffsetStore::new());
    let p = PartitionId::new("orders", 0);
    store.advance(&p, 4).await.unwrap();

    let consumer = Consumer::new(manager.clone(), store.clone());
    let seen = Seen::default();
    let sub = consumer
        .subscribe(
            &["orders"],
            recording(&seen, Outcome::Ack),
            SubscribeOptions {
                start_position: StartPosition::Earliest,
                ..options()
            },
        )
        .await
        .unwrap();

    assert!(wait_until(WAIT, || offsets(&seen).len() == 5).await);
    assert_eq!(sub.committed(&p), Some(4));

    broker.append("orders", 0, Message::new("m5"));
    assert!(wait_until(WAIT, || sub.committed(&p) == Some(5)).await);
    sub.cancel().await.unwrap();
    assert_eq!(store.load(&p).await.unwrap(), Some(5));
}

#[tokio::test]
async fn test_latest_skips_existing_records() {
    let (broker, manager) = setup(&[("orders", 1)]).await;
    seed(&broker, "orders", 3);
    let consumer = Consumer::new(manager.clone(), Arc::new(MemoryOffsetStore::new()));
    let seen = Seen::default();
    let sub = consumer
        .subscribe(
            &["orders"],
            recording(&seen, Outcome::Ack),
            SubscribeOptions {
                start_position: StartPosition::Latest,
                ..options()
            },
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    broker.append("orders", 0, Message::new("new"));
    let p = PartitionId::new("orders", 0);
    assert!(wait_until(WAIT, || sub.committed(&p) == Some(3)).await);
    assert_eq!(offsets(&seen), vec![3]);
    sub.cancel().await.unwrap();
}

#[tokio::test]
async fn test_expired_message_skips_handler() {
    let (broker, manager) = setup(&[("orders", 1)]).await;
    broker.append("orders", 0, Message::new("stale").with_ttl(Duration::from_millis(1)));
    broker.append("orders", 0, Message::new("fresh"));
    let dlq = Arc::new(MemoryDeadLetter::default());
    let consumer =
        Consumer::new(manager.clone(), Arc::new(MemoryOffsetStore::new())).with_dead_letter(dlq.clone());

    let seen = Seen::default();
    let sub = consumer
        .subscribe(&["orders"], recording(&seen, Outcome::Ack), options())
        .await
        .unwrap();

    let p = PartitionId::new("orders", 0);
    assert!(wait_until(WAIT, || sub.committed(&p) == Some(1)).await);
    assert_eq!(offsets(&seen), vec![1]);
    let letters = dlq.letters();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].0.offset(), 0);
    assert_eq!(letters[0].1, DeadLetterReason::TtlElapsed);
    sub.cancel().await.unwrap();
}

#[tokio::test]
async fn test_auto_ack_commits_despite_failures() {
    let (broker, manager) = setup(&[("orders", 1)]).await;
    seed(&broker, "orders", 4);
    let dlq = Arc::new(MemoryDeadLetter::default());
    let consumer =
        Consumer::new(manager.clone(), Arc::new(MemoryOffsetStore::new())).with_dead_letter(dlq.clone());

    let handler = |_d: Delivery| async move { Err::<Outcome, HandlerError>("ignored".into()) };
    let sub = consumer
        .subscribe(
            &["orders"],
            handler,
            SubscribeOptions {
                ack_mode: AckMode::Auto,
                ..options()
            },
        )
        .await
        .unwrap();

    let p = PartitionId::new("orders", 0);
    assert!(wait_until(WAIT, || sub.committed(&p) == Some(3)).await);
    assert!(wait_until(WAIT, || sub.stats().handler_failures == 4).await);
    assert_eq!(dlq.len(), 0);
    assert_eq!(sub.stats().delivered, 4);
    sub.cancel().await.unwrap();
}

#[tokio::test]
async fn test_push_delivery() {
    let (broker, manager) = setup(&[("orders", 1)]).await;
    let consumer = Consumer::new(manager.clone(), Arc::new(MemoryOffsetStore::new()));
    let seen = Seen::default();
    let sub = consumer
        .subscribe(
            &["orders"],
            recording(&seen, Outcome::Ack),
            SubscribeOptions {
                delivery: DeliveryMode::Push,
                ..options()
            },
        )
        .await
        .unwrap();

    let publisher = Publisher::new(manager.clone(), PublisherConfig::default());
    for i in 0..5 {
        let f = publisher
            .publish("orders", Message::new(format!("m{i}")), PublishOptions::new())
            .await;
        f.await.unwrap();
    }

    let p = PartitionId::new("orders", 0);
    assert!(wait_until(WAIT, || sub.committed(&p) == Some(4)).await);
    assert_eq!(offsets(&seen), (0..5).collect::<Vec<u64>>());

    // The stream is reopened after the connection is severed.
    broker.sever_connections();
    broker.append("orders", 0, Message::new("after"));
    assert!(wait_until(WAIT, || sub.committed(&p) == Some(5)).await);
    assert_eq!(offsets(&seen), (0..6).collect::<Vec<u64>>());
    sub.cancel().await.unwrap();
}

#[tokio::test]
async fn test_pull_survives_severed_connection() {
    let (broker, manager) = setup(&[("orders", 1)]).await;
    seed(&broker, "orders", 3);
    let consumer = Consumer::new(manager.clone(), Arc::new(MemoryOffsetStore::new()));
    let seen = Seen::default();
    let sub = consumer
        .subscribe(&["orders"], recording(&seen, Outcome::Ack), options())
        .await
        .unwrap();

    let p = PartitionId::new("orders", 0);
    assert!(wait_until(WAIT, || sub.committed(&p) == Some(2)).await);
    broker.sever_connections();
    seed(&broker, "orders", 3);
    assert!(wait_until(WAIT, || sub.committed(&p) == Some(5)).await);
    assert_eq!(offsets(&seen), (0..6).collect::<Vec<u64>>());
    assert!(broker.connect_count() >= 2);
    sub.cancel().await.unwrap();
}

#[tokio::test]
async fn test_batch_handler_respects_batch_size() {
    let (broker, manager) = setup(&[("orders", 1)]).await;
    seed(&broker, "orders", 10);
    let consumer = Consumer::new(manager.clone(), Arc::new(MemoryOffsetStore::new()));

    let sizes = Arc::new(Mutex::new(Vec::new()));
    let s = sizes.clone();
    let handler = move |batch: Vec<Delivery>| {
        s.lock().unwrap().push(batch.len());
        let n = batch.len();
        async move { Ok::<Vec<Outcome>, HandlerError>(vec![Outcome::Ack; n]) }
    };
    let sub = consumer
        .subscribe_batch(
            &["orders"],
            handler,
            SubscribeOptions {
                batch_size: 4,
                ..options()
            },
        )
        .await
        .unwrap();

    let p = PartitionId::new("orders", 0);
    assert!(wait_until(WAIT, || sub.committed(&p) == Some(9)).await);
    let sizes = sizes.lock().unwrap().clone();
    assert!(sizes.iter().all(|n| *n >= 1 && *n <= 4));
    assert_eq!(sizes.iter().sum::<usize>(), 10);
    sub.cancel().await.unwrap();
}

#[tokio::test]
async fn test_drain_timeout_abandons_handler() {
    let (broker, manager) = setup(&[("orders", 1)]).await;
    seed(&broker, "orders", 1);
    let store = Arc::new(MemoryOffsetStore::new());
    let consumer = Consumer::new(manager.clone(), store.clone());

    let started = Arc::new(AtomicU32::new(0));
    let s = started.clone();
    let handler = move |_d: Delivery| {
        s.fetch_add(1, Ordering::SeqCst);
        async move {
            std::future::pending::<()>().await;
            Ok::<Outcome, HandlerError>(Outcome::Ack)
        }
    };
    let sub = consumer
        .subscribe(
            &["orders"],
            handler,
            SubscribeOptions {
                drain_timeout: Duration::from_millis(50),
                ..options()
            },
        )
        .await
        .unwrap();

    let p = PartitionId::new("orders", 0);
    assert!(wait_until(WAIT, || started.load(Ordering::SeqCst) == 1).await);
    assert_eq!(sub.pending_count(&p), 1);

    let t0 = Instant::now();
    sub.cancel().await.unwrap();
    assert!(t0.elapsed() < Duration::from_secs(2));
    assert_eq!(store.load(&p).await.unwrap(), None);
}

#[tokio::test]
async fn test_cancel_lets_inflight_handler_finish() {
    let (broker, manager) = setup(&[("orders", 1)]).await;
    seed(&broker, "orders", 1);
    let store = Arc::new(MemoryOffsetStore::new());
    let consumer = Consumer::new(manager.clone(), store.clone());

    let calls = Arc::new(AtomicU32::new(0));
    let c = calls.clone();
    let handler = move |_d: Delivery| {
        c.fetch_add(1, Ordering::SeqCst);
        async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok::<Outcome, HandlerError>(Outcome::Ack)
        }
    };
    let sub = consumer.subscribe(&["orders"], handler, options()).await.unwrap();

    assert!(wait_until(WAIT, || calls.load(Ordering::SeqCst) == 1).await);
    sub.cancel().await.unwrap();
    assert_eq!(store.load(&PartitionId::new("orders", 0)).await.unwrap(), Some(0));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_drain_timeout_interrupts_dead_letter_backoff() {
    let broker = loopback_broker::LoopbackBroker::new();
    broker.create_topic("orders", 1);
    seed(&broker, "orders", 1);
    let slow = BackoffConfig {
        base_ms: 1_000,
        multiplier: 2.0,
        max_ms: 5_000,
        max_attempts: 10,
    };
    let manager = Arc::new(
        ConnectionManager::connect(ENDPOINT, Arc::new(broker.clone()), slow)
            .await
            .unwrap(),
    );
    let dlq = Arc::new(MemoryDeadLetter::failing(u32::MAX));
    let store = Arc::new(MemoryOffsetStore::new());
    let consumer = Consumer::new(manager.clone(), store.clone()).with_dead_letter(dlq.clone());

    let seen = Seen::default();
    let sub = consumer
        .subscribe(
            &["orders"],
            recording(&seen, Outcome::reject()),
            SubscribeOptions {
                drain_timeout: Duration::from_millis(50),
                ..options()
            },
        )
        .await
        .unwrap();

    assert!(wait_until(WAIT, || seen.lock().unwrap().len() == 1).await);
    tokio::time::sleep(Duration::from_millis(20)).await;

    let t0 = Instant::now();
    sub.cancel().await.unwrap();
    assert!(t0.elapsed() < Duration::from_millis(500));
    assert_eq!(dlq.len(), 0);
    assert_eq!(store.load(&PartitionId::new("orders", 0)).await.unwrap(), None);
}

#[tokio::test]
async fn test_published_keys_consumed_in_publish_order() {
    let (broker, manager) = setup(&[("events", 2)]).await;
    let publisher = Publisher::new(manager.clone(), PublisherConfig::default());
    let mut pending = Vec::new();
    for i in 0..5 {
        for key in ["A", "B"] {
            let m = Message::new(format!("{key}{i}")).with_key(key);
            pending.push(publisher.publish("events", m, PublishOptions::new()).await);
        }
    }
    for f in pending {
        f.await.unwrap();
    }

    let handled: Arc<Mutex<Vec<(u32, String)>>> = Arc::default();
    let h = handled.clone();
    let handler = move |d: Delivery| {
        let payload = String::from_utf8_lossy(d.message.payload()).into_owned();
        h.lock().unwrap().push((d.partition().partition, payload));
        async move { Ok::<Outcome, HandlerError>(Outcome::Ack) }
    };
    let consumer = Consumer::new(manager.clone(), Arc::new(MemoryOffsetStore::new()));
    let sub = consumer.subscribe(&["events"], handler, options()).await.unwrap();

    let ends: Vec<(u32, usize)> = (0..2).map(|p| (p, broker.records("events", p).len())).collect();
    assert!(
        wait_until(WAIT, || ends.iter().all(|(p, n)| {
            *n == 0 || sub.committed(&PartitionId::new("events", *p)) == Some(*n as u64 - 1)
        }))
        .await
    );
    sub.cancel().await.unwrap();
    publisher.close().await;

    let handled = handled.lock().unwrap().clone();
    for (p, _) in &ends {
        let logged: Vec<String> = broker
            .records("events", *p)
            .into_iter()
            .map(|r| String::from_utf8_lossy(r.message.payload()).into_owned())
            .collect();
        let consumed: Vec<String> = handled
            .iter()
            .filter(|(q, _)| q == p)
            .map(|(_, m)| m.clone())
            .collect();
        assert_eq!(consumed, logged);
    }
    for key in ["A", "B"] {
        let order: Vec<String> = handled
            .iter()
            .filter(|(_, m)| m.starts_with(key))
            .map(|(_, m)| m.clone())
            .collect();
        let expected: Vec<String> = (0..5).map(|i| format!("{key}{i}")).collect();
        assert_eq!(order, expected);
    }
}

#[tokio::test]
async fn test_dead_letter_topic_headers() {
    let (broker, manager) = setup(&[("orders", 1), ("orders.dlq", 1)]).await;
    broker.append("orders", 0, Message::new("bad").with_key("k"));
    let publisher = Arc::new(Publisher::new(manager.clone(), PublisherConfig::default()));
    let consumer = Consumer::new(manager.clone(), Arc::new(MemoryOffsetStore::new()))
        .with_dead_letter(Arc::new(TopicDeadLetter::new(publisher.clone(), ".dlq")));

    let seen = Seen::default();
    let sub = consumer
        .subscribe(&["orders"], recording(&seen, Outcome::reject()), options())
        .await
        .unwrap();

    assert!(wait_until(WAIT, || broker.records("orders.dlq", 0).len() == 1).await);
    let letter = broker.records("orders.dlq", 0).remove(0).message;
    assert_eq!(letter.payload(), b"bad");
    assert_eq!(letter.key(), Some(&b"k"[..]));
    assert_eq!(letter.header(HEADER_REASON), Some(&b"rejected"[..]));
    assert_eq!(letter.header(HEADER_DELIVERY_COUNT), Some(&b"1"[..]));
    assert_eq!(letter.header(HEADER_ORIGINAL_OFFSET), Some(&b"0"[..]));
    sub.cancel().await.unwrap();
    publisher.close().await;
}

#[tokio::test]
async fn test_dead_letter_retried_then_delivered_once() {
    let (broker, manager) = setup(&[("orders", 1)]).await;
    seed(&broker, "orders", 1);
    let dlq = Arc::new(MemoryDeadLetter::failing(2));
    let consumer =
        Consumer::new(manager.clone(), Arc::new(MemoryOffsetStore::new())).with_dead_letter(dlq.clone());

    let seen = Seen::default();
    let sub = consumer
        .subscribe(&["orders"], recording(&seen, Outcome::reject()), options())
        .await
        .unwrap();

    let p = PartitionId::new("orders", 0);
    assert!(wait_until(WAIT, || sub.committed(&p) == Some(0)).await);
    assert_eq!(dlq.len(), 1);
    assert_eq!(sub.stats().dead_lettered, 1);
    sub.cancel().await.unwrap();
}

#[tokio::test]
async fn test_failing_dead_letter_stops_subscription() {
    let (broker, manager) = setup(&[("orders", 1)]).await;
    seed(&broker, "orders", 1);
    let dlq = Arc::new(MemoryDeadLetter::failing(u32::MAX));
    let store = Arc::new(MemoryOffsetStore::new());
    let consumer = Consumer::new(manager.clone(), store.clone()).with_dead_letter(dlq.clone());

    let seen = Seen::default();
    let sub = consumer
        .subscribe(&["orders"], recording(&seen, Outcome::reject()), options())
        .await
        .unwrap();

    let result = tokio::time::timeout(WAIT, sub.join()).await.unwrap();
    assert!(matches!(result, Err(ConsumeError::DeadLetter { .. })));
    assert_eq!(store.load(&PartitionId::new("orders", 0)).await.unwrap(), None);
}

#[tokio::test]
async fn test_stop_token_ends_join() {
    let (_broker, manager) = setup(&[("orders", 2)]).await;
    let consumer = Consumer::new(manager.clone(), Arc::new(MemoryOffsetStore::new()));
    let seen = Seen::default();
    let sub = consumer
        .subscribe(&["orders"], recording(&seen, Outcome::Ack), options())
        .await
        .unwrap();
    assert_eq!(sub.partitions().len(), 2);

    let stop = sub.stop_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        stop.cancel();
    });
    tokio::time::timeout(WAIT, sub.join()).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_subscribe_unknown_topic_fails() {
    let (_broker, manager) = setup(&[]).await;
    let consumer = Consumer::new(manager.clone(), Arc::new(MemoryOffsetStore::new()));
    let seen = Seen::default();
    let result = consumer
        .subscribe(&["missing"], recording(&seen, Outcome::Ack), options())
        .await;
    assert!(matches!(result, Err(ConsumeError::Transport(_))));
}
