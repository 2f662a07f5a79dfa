mod handler;
mod worker;

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use relay_api::{DeadLetter, OffsetStore, PartitionId};

use crate::config::{AckMode, ConsumerConfig, DeliveryMode, StartPosition};
use crate::connection::ConnectionManager;
use crate::dead_letter::LogDeadLetter;
use crate::error::ConsumeError;
use crate::tracker::AckTracker;

pub use handler::{BatchHandler, HandlerError, HandlerResult, MessageHandler, Outcome};

use worker::{Counters, HandlerKind, PartitionWorker, WorkerContext};

// ═══════════════════════════════════════════════════════════════
//  Options
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    pub group_id: String,
    pub start_position: StartPosition,
    pub prefetch: usize,
    pub batch_size: usize,
    pub delivery: DeliveryMode,
    pub ack_mode: AckMode,
    /// Deliveries allowed for a requeued message before it is dead-lettered.
    pub max_redeliveries: u32,
    /// Handler failures on one message that mark it as poison.
    pub poison_threshold: u32,
    pub drain_timeout: Duration,
    pub poll_wait: Duration,
}

impl From<&ConsumerConfig> for SubscribeOptions {
    fn from(c: &ConsumerConfig) -> Self {
        Self {
            group_id: c.group_id.clone(),
            start_position: c.start_position,
            prefetch: c.prefetch,
            batch_size: c.batch_size,
            delivery: c.delivery,
            ack_mode: c.ack_mode,
            max_redeliveries: c.max_redeliveries,
            poison_threshold: c.poison_threshold,
            drain_timeout: Duration::from_millis(c.drain_timeout_ms),
            poll_wait: Duration::from_millis(c.poll_wait_ms),
        }
    }
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self::from(&ConsumerConfig::default())
    }
}

// ═══════════════════════════════════════════════════════════════
//  Stats
// ═══════════════════════════════════════════════════════════════

/// Delivery counters of one subscription.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct SubscriptionStats {
    /// Handler deliveries, redeliveries included.
    pub delivered: u64,
    pub acked: u64,
    pub nacked: u64,
    pub redelivered: u64,
    pub dead_lettered: u64,
    pub handler_failures: u64,
}

// ═══════════════════════════════════════════════════════════════
//  Consumer
// ═══════════════════════════════════════════════════════════════

/// Entry point for subscriptions. Each subscription owns its own
/// acknowledgment tracker; the connection manager may be shared.
pub struct Consumer {
    connection: Arc<ConnectionManager>,
    offsets: Arc<dyn OffsetStore>,
    dead_letter: Arc<dyn DeadLetter>,
}

impl Consumer {
    /// Consumer that dead-letters to the log.
    pub fn new(connection: Arc<ConnectionManager>, offsets: Arc<dyn OffsetStore>) -> Self {
        Self {
            connection,
            offsets,
            dead_letter: Arc::new(LogDeadLetter),
        }
    }

    pub fn with_dead_letter(mut self, dead_letter: Arc<dyn DeadLetter>) -> Self {
        self.dead_letter = dead_letter;
        self
    }

    pub fn offsets(&self) -> &Arc<dyn OffsetStore> {
        &self.offsets
    }

    /// Subscribe `handler` to every partition of `topics`.
    pub async fn subscribe<H: MessageHandler>(
        &self,
        topics: &[&str],
        handler: H,
        options: SubscribeOptions,
    ) -> Result<Subscription, ConsumeError> {
        self.start(topics, HandlerKind::Single(Arc::new(handler)), options).await
    }

    /// Like [`subscribe`](Self::subscribe), with up to `batch_size` deliveries per call.
    pub async fn subscribe_batch<H: BatchHandler>(
        &self,
        topics: &[&str],
        handler: H,
        options: SubscribeOptions,
    ) -> Result<Subscription, ConsumeError> {
        self.start(topics, HandlerKind::Batch(Arc::new(handler)), options).await
    }

    async fn start(
        &self,
        topics: &[&str],
        handler: HandlerKind,
        options: SubscribeOptions,
    ) -> Result<Subscription, ConsumeError> {
        let mut partitions = Vec::new();
        for topic in topics {
            let n = self
                .connection
                .retrying(|t| {
                    let topic = topic.to_string();
                    async move { t.partitions(&topic).await }
                })
                .await?;
            partitions.extend((0..n).map(|p| PartitionId::new(*topic, p)));
        }

        let stop = CancellationToken::new();
        let abort = CancellationToken::new();
        let tracker = Arc::new(Mutex::new(AckTracker::new(options.max_redeliveries)));
        let counters = Arc::new(Counters::default());
        let drain_timeout = options.drain_timeout;
        let group_id = options.group_id.clone();

        let ctx = Arc::new(WorkerContext {
            group_id: group_id.clone(),
            connection: self.connection.clone(),
            offsets: self.offsets.clone(),
            dead_letter: self.dead_letter.clone(),
            handler,
            options,
            tracker: tracker.clone(),
            counters: counters.clone(),
            stop: stop.clone(),
            abort: abort.clone(),
        });

        let workers = partitions
            .iter()
            .map(|p| {
                let worker = PartitionWorker::new(ctx.clone(), p.clone());
                let stop = stop.clone();
                let partition = p.clone();
                let handle = tokio::spawn(async move {
                    let result = worker.run().await;
                    if let Err(e) = &result {
                        tracing::error!(partition = %partition, error = %e, "partition worker failed, stopping subscription");
                        stop.cancel();
                    }
                    result
                });
                (p.clone(), handle)
            })
            .collect();

        tracing::info!(group = %group_id, partitions = partitions.len(), "subscription started");
        Ok(Subscription {
            group_id,
            partitions,
            workers,
            stop,
            abort,
            tracker,
            counters,
            offsets: self.offsets.clone(),
            drain_timeout,
        })
    }
}

// ═══════════════════════════════════════════════════════════════
//  Subscription
// ═══════════════════════════════════════════════════════════════

/// A running subscription. Dropping it stops the workers without draining.
pub struct Subscription {
    group_id: String,
    partitions: Vec<PartitionId>,
    workers: Vec<(PartitionId, JoinHandle<Result<(), ConsumeError>>)>,
    stop: CancellationToken,
    abort: CancellationToken,
    tracker: Arc<Mutex<AckTracker>>,
    counters: Arc<Counters>,
    offsets: Arc<dyn OffsetStore>,
    drain_timeout: Duration,
}

impl Subscription {
    pub fn partitions(&self) -> &[PartitionId] {
        &self.partitions
    }

    pub fn stats(&self) -> SubscriptionStats {
        let c = &self.counters;
        SubscriptionStats {
            delivered: c.delivered.load(Ordering::Relaxed),
            acked: c.acked.load(Ordering::Relaxed),
            nacked: c.nacked.load(Ordering::Relaxed),
            redelivered: c.redelivered.load(Ordering::Relaxed),
            dead_lettered: c.dead_lettered.load(Ordering::Relaxed),
            handler_failures: c.handler_failures.load(Ordering::Relaxed),
        }
    }

    /// Delivered-but-unsettled messages of `partition`.
    pub fn pending_count(&self, partition: &PartitionId) -> usize {
        worker::lock(&self.tracker).pending_count(partition)
    }

    /// Last committed cursor of `partition` as seen by this subscription.
    pub fn committed(&self, partition: &PartitionId) -> Option<u64> {
        worker::lock(&self.tracker).committed(partition)
    }

    /// Token that stops the subscription when cancelled; pair with [`join`](Self::join).
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Stop handler invocations and drain: in-flight handlers may finish
    /// within the drain timeout, after which they are abandoned and their
    /// messages stay uncommitted.
    pub async fn cancel(mut self) -> Result<(), ConsumeError> {
        tracing::info!(group = %self.group_id, "subscription cancel requested");
        self.stop.cancel();
        self.finish().await
    }

    /// Wait until the subscription stops: a worker failed or the stop token
    /// was cancelled. Returns the first worker error.
    pub async fn join(mut self) -> Result<(), ConsumeError> {
        self.stop.cancelled().await;
        self.finish().await
    }

    async fn finish(&mut self) -> Result<(), ConsumeError> {
        let workers = std::mem::take(&mut self.workers);
        let wait_all = async move {
            let mut results = Vec::with_capacity(workers.len());
            for (partition, handle) in workers {
                results.push(match handle.await {
                    Ok(r) => r,
                    Err(_) => Err(ConsumeError::WorkerPanicked(partition)),
                });
            }
            results
        };
        tokio::pin!(wait_all);

        let results = match tokio::time::timeout(self.drain_timeout, &mut wait_all).await {
            Ok(results) => results,
            Err(_) => {
                tracing::warn!(
                    group = %self.group_id,
                    drain_timeout_ms = self.drain_timeout.as_millis() as u64,
                    "drain timeout elapsed, abandoning in-flight handlers"
                );
                self.abort.cancel();
                wait_all.await
            }
        };

        let flushed = self.offsets.flush().await;
        tracing::info!(group = %self.group_id, stats = ?self.stats(), "subscription stopped");

        let mut first_error = None;
        for result in results {
            if let Err(e) = result {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => flushed.map_err(ConsumeError::from),
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if !self.workers.is_empty() {
            self.stop.cancel();
            self.abort.cancel();
        }
    }
}
