use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use relay_api::{HashPartitioner, Message, PartitionId, Partitioner, now_ms};

use crate::config::{MAX_IN_FLIGHT, PublisherConfig};
use crate::connection::ConnectionManager;
use crate::error::DeliveryError;

// ═══════════════════════════════════════════════════════════════
//  Options / receipts
// ═══════════════════════════════════════════════════════════════

/// Per-publish overrides. Unset fields fall back to [`PublisherConfig`].
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    /// Key used for partition selection instead of the message key.
    pub partition_key: Option<Vec<u8>>,
    pub timeout: Option<Duration>,
    /// `true`: an unroutable message fails with `DeliveryError::Unroutable`.
    /// `false`: it resolves to `DeliveryReceipt::Unrouted`.
    pub mandatory: Option<bool>,
}

impl PublishOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_partition_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.partition_key = Some(key.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn mandatory(mut self, mandatory: bool) -> Self {
        self.mandatory = Some(mandatory);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryReceipt {
    /// The broker stored the message at `offset`.
    Acked { partition: PartitionId, offset: u64 },
    /// Non-mandatory message with no destination; dropped by the broker.
    Unrouted { topic: String },
}

impl DeliveryReceipt {
    pub fn partition(&self) -> Option<&PartitionId> {
        match self {
            DeliveryReceipt::Acked { partition, .. } => Some(partition),
            DeliveryReceipt::Unrouted { .. } => None,
        }
    }

    pub fn offset(&self) -> Option<u64> {
        match self {
            DeliveryReceipt::Acked { offset, .. } => Some(*offset),
            DeliveryReceipt::Unrouted { .. } => None,
        }
    }
}

type DeliveryResult = Result<DeliveryReceipt, DeliveryError>;

enum DeliveryState {
    Ready(Option<DeliveryResult>),
    Pending(oneshot::Receiver<DeliveryResult>),
}

/// Resolves once the broker acknowledged the message, or with the reason it did not.
pub struct DeliveryFuture {
    state: DeliveryState,
}

impl DeliveryFuture {
    fn ready(result: DeliveryResult) -> Self {
        Self {
            state: DeliveryState::Ready(Some(result)),
        }
    }

    fn pending(rx: oneshot::Receiver<DeliveryResult>) -> Self {
        Self {
            state: DeliveryState::Pending(rx),
        }
    }
}

impl Future for DeliveryFuture {
    type Output = DeliveryResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.state {
            DeliveryState::Ready(result) => Poll::Ready(result.take().unwrap_or_else(|| {
                Err(DeliveryError::ConnectionLost("delivery already resolved".into()))
            })),
            DeliveryState::Pending(rx) => Pin::new(rx).poll(cx).map(|r| {
                r.unwrap_or_else(|_| Err(DeliveryError::ConnectionLost("publisher dropped".into())))
            }),
        }
    }
}

// ═══════════════════════════════════════════════════════════════
//  Lanes
// ═══════════════════════════════════════════════════════════════

/// One queued send. The window permit is released after the reply.
struct PendingSend {
    message: Message,
    deadline: Instant,
    timeout: Duration,
    mandatory: bool,
    reply: oneshot::Sender<DeliveryResult>,
    _permit: OwnedSemaphorePermit,
}

/// Ordered send queue of one partition. Sends are issued one at a time.
struct Lane {
    tx: mpsc::UnboundedSender<PendingSend>,
    handle: JoinHandle<()>,
}

type PartitionCounts = Arc<Mutex<HashMap<String, u32>>>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(g) => g,
        Err(poisoned) => {
            tracing::warn!("publisher lock was poisoned, recovering");
            poisoned.into_inner()
        }
    }
}

async fn run_lane(
    id: PartitionId,
    connection: Arc<ConnectionManager>,
    counts: PartitionCounts,
    mut rx: mpsc::UnboundedReceiver<PendingSend>,
) {
    while let Some(send) = rx.recv().await {
        let PendingSend {
            message,
            deadline,
            timeout,
            mandatory,
            reply,
            _permit,
        } = send;

        let produce = connection.retrying(|t| {
            let message = message.clone();
            let topic = id.topic.clone();
            let partition = id.partition;
            async move { t.produce(&topic, partition, message).await }
        });
        let sent = tokio::time::timeout_at(deadline, async { produce.await.map_err(DeliveryError::from) }).await;

        let outcome = match sent {
            Ok(Ok(offset)) => {
                tracing::trace!(partition = %id, offset, "publish acknowledged");
                Ok(DeliveryReceipt::Acked {
                    partition: id.clone(),
                    offset,
                })
            }
            Ok(Err(DeliveryError::Unroutable(reason))) => {
                lock(&counts).remove(&id.topic);
                unrouted(&id.topic, reason, mandatory)
            }
            Ok(Err(e)) => {
                tracing::warn!(partition = %id, error = %e, "publish failed");
                Err(e)
            }
            Err(_) => {
                tracing::warn!(partition = %id, timeout_ms = timeout.as_millis() as u64, "publish timed out");
                Err(DeliveryError::Timeout(timeout))
            }
        };
        let _ = reply.send(outcome);
    }
    tracing::debug!(partition = %id, "publisher lane stopped");
}

fn unrouted(topic: &str, reason: String, mandatory: bool) -> DeliveryResult {
    if mandatory {
        tracing::warn!(topic, %reason, "mandatory publish is unroutable");
        Err(DeliveryError::Unroutable(reason))
    } else {
        tracing::warn!(topic, %reason, "message unroutable, dropped");
        Ok(DeliveryReceipt::Unrouted {
            topic: topic.to_string(),
        })
    }
}

// ═══════════════════════════════════════════════════════════════
//  Publisher
// ═══════════════════════════════════════════════════════════════

/// Partition-aware publisher with a bounded unacknowledged-send window.
///
/// Messages for the same partition are sent in `publish` call order with one
/// send in flight per partition. Each publisher keeps its own window; several
/// publishers may share one [`ConnectionManager`].
pub struct Publisher {
    connection: Arc<ConnectionManager>,
    config: PublisherConfig,
    partitioner: Arc<dyn Partitioner>,
    window: Arc<Semaphore>,
    capacity: u32,
    clock: AtomicU64,
    sequence: AtomicU64,
    counts: PartitionCounts,
    lanes: Mutex<HashMap<PartitionId, Lane>>,
    closed: AtomicBool,
}

impl Publisher {
    pub fn new(connection: Arc<ConnectionManager>, config: PublisherConfig) -> Self {
        let capacity = u32::try_from(config.max_in_flight)
            .unwrap_or(MAX_IN_FLIGHT)
            .clamp(1, MAX_IN_FLIGHT);
        Self {
            connection,
            config,
            partitioner: Arc::new(HashPartitioner::new()),
            window: Arc::new(Semaphore::new(capacity as usize)),
            capacity,
            clock: AtomicU64::new(0),
            sequence: AtomicU64::new(0),
            counts: Arc::new(Mutex::new(HashMap::new())),
            lanes: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn with_partitioner(mut self, partitioner: Arc<dyn Partitioner>) -> Self {
        self.partitioner = partitioner;
        self
    }

    /// Sends accepted but not yet resolved.
    pub fn in_flight(&self) -> usize {
        self.capacity as usize - self.window.available_permits()
    }

    /// Queue `message` for `topic`.
    ///
    /// Suspends while the window is full. Every failure, including a timeout
    /// while waiting for window space, is reported through the returned future.
    pub async fn publish(&self, topic: &str, message: Message, options: PublishOptions) -> DeliveryFuture {
        let timeout = options.timeout.unwrap_or_else(|| self.config.timeout());
        let mandatory = options.mandatory.unwrap_or(self.config.mandatory);
        let deadline = Instant::now() + timeout;

        if self.closed.load(Ordering::SeqCst) {
            return DeliveryFuture::ready(Err(DeliveryError::ConnectionLost("publisher closed".into())));
        }

        let permit = match tokio::time::timeout_at(deadline, self.window.clone().acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                return DeliveryFuture::ready(Err(DeliveryError::ConnectionLost("publisher closed".into())));
            }
            Err(_) => {
                tracing::warn!(topic, timeout_ms = timeout.as_millis() as u64, "publish window full until deadline");
                return DeliveryFuture::ready(Err(DeliveryError::Timeout(timeout)));
            }
        };

        let partitions = match tokio::time::timeout_at(deadline, self.partition_count(topic)).await {
            Ok(Ok(n)) => n,
            Ok(Err(DeliveryError::Unroutable(reason))) => {
                return DeliveryFuture::ready(unrouted(topic, reason, mandatory));
            }
            Ok(Err(e)) => return DeliveryFuture::ready(Err(e)),
            Err(_) => return DeliveryFuture::ready(Err(DeliveryError::Timeout(timeout))),
        };

        let key = options.partition_key.as_deref().or(message.key());
        let partition = self.partitioner.partition(key, partitions);
        if partition >= partitions {
            return DeliveryFuture::ready(unrouted(
                topic,
                format!("partitioner chose {partition} of {partitions} partitions"),
                mandatory,
            ));
        }

        let id = PartitionId::new(topic, partition);
        let message = message
            .with_timestamp(self.next_timestamp())
            .with_sequence(self.sequence.fetch_add(1, Ordering::SeqCst) + 1);
        let (reply, rx) = oneshot::channel();
        let send = PendingSend {
            message,
            deadline,
            timeout,
            mandatory,
            reply,
            _permit: permit,
        };

        if self.enqueue(id, send).is_err() {
            return DeliveryFuture::ready(Err(DeliveryError::ConnectionLost("publisher closed".into())));
        }
        DeliveryFuture::pending(rx)
    }

    /// Wait until every send accepted so far has resolved.
    pub async fn flush(&self) {
        if let Ok(all) = self.window.acquire_many(self.capacity).await {
            drop(all);
        }
    }

    /// Flush, then stop the partition lanes. Later publishes fail with `ConnectionLost`.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.flush().await;
        let lanes: Vec<Lane> = lock(&self.lanes).drain().map(|(_, lane)| lane).collect();
        for lane in lanes {
            drop(lane.tx);
            let _ = lane.handle.await;
        }
        self.window.close();
        tracing::debug!(endpoint = %self.connection.endpoint(), "publisher closed");
    }

    // ── internals ──

    /// Wall-clock publish time that never goes backwards within one publisher.
    fn next_timestamp(&self) -> u64 {
        let now = now_ms();
        self.clock.fetch_max(now, Ordering::SeqCst).max(now)
    }

    async fn partition_count(&self, topic: &str) -> Result<u32, DeliveryError> {
        if let Some(n) = lock(&self.counts).get(topic).copied() {
            return Ok(n);
        }
        let n = self
            .connection
            .retrying(|t| {
                let topic = topic.to_string();
                async move { t.partitions(&topic).await }
            })
            .await?;
        if n == 0 {
            return Err(DeliveryError::Unroutable(format!("topic '{topic}' has no partitions")));
        }
        lock(&self.counts).insert(topic.to_string(), n);
        Ok(n)
    }

    fn enqueue(&self, id: PartitionId, send: PendingSend) -> Result<(), PendingSend> {
        let mut lanes = lock(&self.lanes);
        if self.closed.load(Ordering::SeqCst) {
            return Err(send);
        }
        let lane = lanes.entry(id.clone()).or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            let handle = tokio::spawn(run_lane(
                id,
                self.connection.clone(),
                self.counts.clone(),
                rx,
            ));
            Lane { tx, handle }
        });
        lane.tx.send(send).map_err(|e| e.0)
    }
}
