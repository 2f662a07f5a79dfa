#![allow(dead_code)]

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use loopback_broker::LoopbackBroker;
use relay_api::{DeadLetter, DeadLetterReason, Delivery, TransportError};
use relay_client::{BackoffConfig, ConnectionManager, SubscribeOptions};

pub const ENDPOINT: &str = "loopback://test";

pub fn fast_backoff() -> BackoffConfig {
    BackoffConfig {
        base_ms: 2,
        multiplier: 2.0,
        max_ms: 20,
        max_attempts: 4,
    }
}

/// Broker with `topics` created and a connected manager.
pub async fn setup(topics: &[(&str, u32)]) -> (LoopbackBroker, Arc<ConnectionManager>) {
    let broker = LoopbackBroker::new();
    for (name, partitions) in topics {
        broker.create_topic(name, *partitions);
    }
    let manager = ConnectionManager::connect(ENDPOINT, Arc::new(broker.clone()), fast_backoff())
        .await
        .unwrap();
    (broker, Arc::new(manager))
}

pub fn options() -> SubscribeOptions {
    SubscribeOptions {
        group_id: "test".into(),
        poll_wait: Duration::from_millis(20),
        drain_timeout: Duration::from_secs(2),
        ..SubscribeOptions::default()
    }
}

/// Poll `cond` until it holds or `timeout` elapses.
pub async fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Collects dead letters. The first `fail_first` calls fail with an io error.
#[derive(Default)]
pub struct MemoryDeadLetter {
    pub letters: Mutex<Vec<(Delivery, DeadLetterReason)>>,
    fail_first: AtomicU32,
}

impl MemoryDeadLetter {
    pub fn failing(n: u32) -> Self {
        Self {
            letters: Mutex::new(Vec::new()),
            fail_first: AtomicU32::new(n),
        }
    }

    pub fn letters(&self) -> Vec<(Delivery, DeadLetterReason)> {
        self.letters.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.letters.lock().unwrap().len()
    }
}

impl DeadLetter for MemoryDeadLetter {
    fn dead_letter<'a>(
        &'a self,
        delivery: &'a Delivery,
        reason: &'a DeadLetterReason,
    ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + 'a>> {
        Box::pin(async move {
            let failed = self
                .fail_first
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failed {
                return Err(TransportError::io("dead-letter sink unavailable"));
            }
            self.letters
                .lock()
                .unwrap()
                .push((delivery.clone(), reason.clone()));
            Ok(())
        })
    }
}
