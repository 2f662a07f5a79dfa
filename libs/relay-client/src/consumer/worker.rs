use std::any::Any;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio_util::sync::CancellationToken;

use relay_api::{
    DeadLetter, DeadLetterReason, Delivery, FetchedRecord, MessageId, OffsetStore, PartitionId,
    RecordStream, now_ms,
};

use crate::backoff::Backoff;
use crate::config::{AckMode, DeliveryMode, StartPosition};
use crate::connection::ConnectionManager;
use crate::error::{ConsumeError, PoisonMessageError};
use crate::tracker::{AckTracker, NackOutcome, Settled};

use super::SubscribeOptions;
use super::handler::{BatchHandler, HandlerError, HandlerResult, MessageHandler, Outcome};

// ═══════════════════════════════════════════════════════════════
//  Shared state
// ═══════════════════════════════════════════════════════════════

pub(crate) enum HandlerKind {
    Single(Arc<dyn MessageHandler>),
    Batch(Arc<dyn BatchHandler>),
}

#[derive(Default)]
pub(crate) struct Counters {
    pub delivered: AtomicU64,
    pub acked: AtomicU64,
    pub nacked: AtomicU64,
    pub redelivered: AtomicU64,
    pub dead_lettered: AtomicU64,
    pub handler_failures: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn lock(tracker: &Mutex<AckTracker>) -> MutexGuard<'_, AckTracker> {
    match tracker.lock() {
        Ok(g) => g,
        Err(poisoned) => {
            tracing::warn!("ack tracker lock was poisoned, recovering");
            poisoned.into_inner()
        }
    }
}

/// Everything a partition worker needs, shared by all workers of a subscription.
pub(crate) struct WorkerContext {
    pub group_id: String,
    pub connection: Arc<ConnectionManager>,
    pub offsets: Arc<dyn OffsetStore>,
    pub dead_letter: Arc<dyn DeadLetter>,
    pub handler: HandlerKind,
    pub options: SubscribeOptions,
    pub tracker: Arc<Mutex<AckTracker>>,
    pub counters: Arc<Counters>,
    /// Stop invoking handlers.
    pub stop: CancellationToken,
    /// Abandon handlers still running (drain timeout elapsed).
    pub abort: CancellationToken,
}

// ═══════════════════════════════════════════════════════════════
//  PartitionWorker
// ═══════════════════════════════════════════════════════════════

/// Consumes one partition. Handler invocations are sequential; pending
/// redeliveries are served before newer records.
pub(crate) struct PartitionWorker {
    ctx: Arc<WorkerContext>,
    partition: PartitionId,
    next_fetch: u64,
    buffered: VecDeque<FetchedRecord>,
    retry: VecDeque<Delivery>,
    stream: Option<Box<dyn RecordStream>>,
}

impl PartitionWorker {
    pub fn new(ctx: Arc<WorkerContext>, partition: PartitionId) -> Self {
        Self {
            ctx,
            partition,
            next_fetch: 0,
            buffered: VecDeque::new(),
            retry: VecDeque::new(),
            stream: None,
        }
    }

    pub async fn run(mut self) -> Result<(), ConsumeError> {
        self.next_fetch = self.resolve_start().await?;
        tracing::info!(
            group = %self.ctx.group_id,
            partition = %self.partition,
            offset = self.next_fetch,
            "partition worker started"
        );

        loop {
            let Some(batch) = self.next_batch().await? else {
                break;
            };
            if !self.process(batch).await? {
                break;
            }
        }

        tracing::info!(
            group = %self.ctx.group_id,
            partition = %self.partition,
            pending = lock(&self.ctx.tracker).pending_count(&self.partition),
            "partition worker stopped"
        );
        Ok(())
    }

    /// First offset to read.
    async fn resolve_start(&mut self) -> Result<u64, ConsumeError> {
        let stored = self.ctx.offsets.load(&self.partition).await?;
        if let Some(cursor) = stored {
            lock(&self.ctx.tracker).set_committed(&self.partition, cursor);
        }

        let start = match self.ctx.options.start_position {
            StartPosition::FromCursor => stored.map_or(0, |c| c + 1),
            StartPosition::Earliest => 0,
            StartPosition::Latest => {
                let p = self.partition.clone();
                self.ctx
                    .connection
                    .retrying(|t| {
                        let p = p.clone();
                        async move { t.end_offset(&p).await }
                    })
                    .await?
            }
        };
        Ok(start)
    }

    // ── Fetching ──

    /// Next deliveries to hand to the handler, `None` once stopped.
    async fn next_batch(&mut self) -> Result<Option<Vec<Delivery>>, ConsumeError> {
        if self.ctx.stop.is_cancelled() {
            return Ok(None);
        }
        let limit = match self.ctx.handler {
            HandlerKind::Single(_) => 1,
            HandlerKind::Batch(_) => self.ctx.options.batch_size.max(1),
        };

        if !self.retry.is_empty() {
            let n = limit.min(self.retry.len());
            let batch: Vec<Delivery> = self.retry.drain(..n).collect();
            let mut tracker = lock(&self.ctx.tracker);
            for d in &batch {
                tracker.record(&d.id, d.delivery_count);
                bump(&self.ctx.counters.delivered);
            }
            return Ok(Some(batch));
        }

        let stop = self.ctx.stop.clone();
        while self.buffered.is_empty() {
            tokio::select! {
                filled = self.fill() => filled?,
                _ = stop.cancelled() => return Ok(None),
            }
        }

        let n = limit.min(self.buffered.len());
        let mut batch = Vec::with_capacity(n);
        let mut tracker = lock(&self.ctx.tracker);
        for record in self.buffered.drain(..n) {
            let id = MessageId::new(self.partition.clone(), record.offset);
            tracker.record(&id, 1);
            bump(&self.ctx.counters.delivered);
            batch.push(Delivery {
                id,
                message: record.message,
                delivery_count: 1,
            });
        }
        Ok(Some(batch))
    }

    async fn fill(&mut self) -> Result<(), ConsumeError> {
        let records = match self.ctx.options.delivery {
            DeliveryMode::Pull => {
                let p = self.partition.clone();
                let offset = self.next_fetch;
                let max = self.ctx.options.prefetch.max(1);
                let wait = self.ctx.options.poll_wait;
                self.ctx
                    .connection
                    .retrying(|t| {
                        let p = p.clone();
                        async move { t.fetch(&p, offset, max, wait).await }
                    })
                    .await?
            }
            DeliveryMode::Push => self.recv_pushed().await?,
        };

        for record in records {
            // Replays after a stream reopen.
            if record.offset < self.next_fetch {
                continue;
            }
            self.next_fetch = record.offset + 1;
            self.buffered.push_back(record);
        }
        Ok(())
    }

    async fn recv_pushed(&mut self) -> Result<Vec<FetchedRecord>, ConsumeError> {
        if self.stream.is_none() {
            let p = self.partition.clone();
            let offset = self.next_fetch;
            let buffer = self.ctx.options.prefetch.max(1);
            let stream = self
                .ctx
                .connection
                .retrying(|t| {
                    let p = p.clone();
                    async move { t.stream(&p, offset, buffer).await }
                })
                .await?;
            self.stream = Some(stream);
        }

        let wait = self.ctx.options.poll_wait;
        let Some(stream) = self.stream.as_mut() else {
            return Ok(Vec::new());
        };
        match tokio::time::timeout(wait, stream.recv()).await {
            Err(_) => Ok(Vec::new()),
            Ok(Some(Ok(record))) => Ok(vec![record]),
            Ok(Some(Err(e))) => {
                tracing::warn!(partition = %self.partition, error = %e, "push stream failed, reopening");
                self.stream = None;
                Ok(Vec::new())
            }
            Ok(None) => {
                tracing::debug!(partition = %self.partition, "push stream ended, reopening");
                self.stream = None;
                Ok(Vec::new())
            }
        }
    }

    // ── Processing ──

    /// Handle one batch. `false` once handlers were abandoned.
    async fn process(&mut self, batch: Vec<Delivery>) -> Result<bool, ConsumeError> {
        let now = now_ms();
        let (expired, live): (Vec<Delivery>, Vec<Delivery>) =
            batch.into_iter().partition(|d| d.message.is_expired(now));

        for d in &expired {
            tracing::debug!(message = %d.id, "ttl elapsed before handling");
            self.dead_letter_and_expire(d, DeadLetterReason::TtlElapsed).await?;
        }
        if live.is_empty() {
            return Ok(true);
        }

        let auto_ack = self.ctx.options.ack_mode == AckMode::Auto;
        if auto_ack {
            for d in &live {
                self.settle_ack(&d.id).await?;
            }
        }

        let Some(results) = self.invoke(live).await else {
            return Ok(false);
        };

        for (delivery, result) in results {
            if auto_ack {
                match result {
                    Ok(outcome) => {
                        tracing::trace!(message = %delivery.id, ?outcome, "auto-acked message handled");
                    }
                    Err(e) => {
                        bump(&self.ctx.counters.handler_failures);
                        tracing::warn!(message = %delivery.id, error = %e, "handler failed on auto-acked message");
                    }
                }
            } else {
                self.apply(delivery, result).await?;
            }
        }
        Ok(true)
    }

    /// Run the handler for `live`. `None` if the drain timeout abandoned it.
    async fn invoke(&self, live: Vec<Delivery>) -> Option<Vec<(Delivery, HandlerResult)>> {
        match &self.ctx.handler {
            HandlerKind::Single(handler) => {
                let mut results = Vec::with_capacity(live.len());
                for delivery in live {
                    let result = self.guarded(handler.handle(delivery.clone())).await?;
                    results.push((delivery, result));
                }
                Some(results)
            }
            HandlerKind::Batch(handler) => {
                let result = self.guarded(handler.handle_batch(live.clone())).await?;
                Some(match result {
                    Ok(outcomes) => {
                        let mut outcomes = outcomes.into_iter();
                        live.into_iter()
                            .map(|d| (d, Ok(outcomes.next().unwrap_or_else(Outcome::retry))))
                            .collect()
                    }
                    Err(e) => {
                        let reason = e.to_string();
                        live.into_iter()
                            .map(|d| (d, Err(HandlerError::from(reason.clone()))))
                            .collect()
                    }
                })
            }
        }
    }

    /// Run a handler future on its own task so that a panic is contained.
    async fn guarded<T: Send + 'static>(
        &self,
        fut: Pin<Box<dyn Future<Output = Result<T, HandlerError>> + Send + 'static>>,
    ) -> Option<Result<T, HandlerError>> {
        let mut task = tokio::spawn(fut);
        tokio::select! {
            joined = &mut task => Some(match joined {
                Ok(result) => result,
                Err(e) if e.is_panic() => Err(format!("handler panicked: {}", panic_message(e.into_panic())).into()),
                Err(e) => Err(format!("handler task failed: {e}").into()),
            }),
            _ = self.ctx.abort.cancelled() => {
                task.abort();
                tracing::warn!(partition = %self.partition, "drain timeout elapsed, handler abandoned");
                None
            }
        }
    }

    async fn apply(&mut self, delivery: Delivery, result: HandlerResult) -> Result<(), ConsumeError> {
        match result {
            Ok(Outcome::Ack) => {
                bump(&self.ctx.counters.acked);
                self.settle_ack(&delivery.id).await
            }
            Ok(Outcome::Nack { requeue }) => {
                bump(&self.ctx.counters.nacked);
                self.nack(delivery, requeue).await
            }
            Err(e) => {
                bump(&self.ctx.counters.handler_failures);
                if delivery.delivery_count >= self.ctx.options.poison_threshold {
                    let poison = PoisonMessageError {
                        id: delivery.id.clone(),
                        delivery_count: delivery.delivery_count,
                        error: e.to_string(),
                    };
                    tracing::warn!(error = %poison, "poison message");
                    let reason = DeadLetterReason::Poison { error: poison.error };
                    self.dead_letter_and_expire(&delivery, reason).await
                } else {
                    tracing::debug!(
                        message = %delivery.id,
                        delivery_count = delivery.delivery_count,
                        error = %e,
                        "handler failed, redelivering"
                    );
                    self.nack(delivery, true).await
                }
            }
        }
    }

    async fn nack(&mut self, delivery: Delivery, requeue: bool) -> Result<(), ConsumeError> {
        let outcome = lock(&self.ctx.tracker).nack(&delivery.id, requeue);
        match outcome {
            NackOutcome::Requeue { delivery_count } => {
                bump(&self.ctx.counters.redelivered);
                self.retry.push_back(Delivery {
                    delivery_count,
                    ..delivery
                });
                Ok(())
            }
            NackOutcome::Exhausted { .. } => {
                self.dead_letter_and_expire(&delivery, DeadLetterReason::MaxRedeliveries)
                    .await
            }
            NackOutcome::Rejected { .. } => {
                self.dead_letter_and_expire(&delivery, DeadLetterReason::Rejected)
                    .await
            }
            NackOutcome::Ignored => Ok(()),
        }
    }

    // ── Settlement ──

    async fn settle_ack(&self, id: &MessageId) -> Result<(), ConsumeError> {
        let settled = lock(&self.ctx.tracker).ack(id);
        if settled == Settled::Duplicate {
            tracing::debug!(message = %id, "duplicate ack ignored");
        }
        self.commit(settled).await
    }

    /// Hand the message to the dead-letter sink (retrying with backoff), then
    /// mark it Expired. A sink that keeps failing stops the subscription.
    /// Once the drain timeout elapsed the message is left uncommitted.
    async fn dead_letter_and_expire(
        &self,
        delivery: &Delivery,
        reason: DeadLetterReason,
    ) -> Result<(), ConsumeError> {
        let abort = self.ctx.abort.clone();
        let mut backoff = Backoff::new(self.ctx.connection.backoff());
        loop {
            let sent = tokio::select! {
                biased;
                _ = abort.cancelled() => {
                    tracing::warn!(message = %delivery.id, "drain timeout elapsed, dead-letter abandoned");
                    return Ok(());
                }
                sent = self.ctx.dead_letter.dead_letter(delivery, &reason) => sent,
            };
            match sent {
                Ok(()) => break,
                Err(e) => match backoff.next_delay() {
                    Some(delay) => {
                        tracing::warn!(message = %delivery.id, error = %e, "dead-letter failed, retrying");
                        tokio::select! {
                            biased;
                            _ = abort.cancelled() => {
                                tracing::warn!(message = %delivery.id, "drain timeout elapsed, dead-letter abandoned");
                                return Ok(());
                            }
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                    None => {
                        return Err(ConsumeError::DeadLetter {
                            id: delivery.id.clone(),
                            cause: e,
                        });
                    }
                },
            }
        }

        bump(&self.ctx.counters.dead_lettered);
        tracing::warn!(
            message = %delivery.id,
            reason = %reason,
            delivery_count = delivery.delivery_count,
            "message dead-lettered"
        );
        let settled = lock(&self.ctx.tracker).expire(&delivery.id);
        self.commit(settled).await
    }

    async fn commit(&self, settled: Settled) -> Result<(), ConsumeError> {
        if let Settled::Done { commit: Some(offset) } = settled {
            self.ctx.offsets.advance(&self.partition, offset).await?;
            tracing::debug!(partition = %self.partition, offset, "cursor committed");
        }
        Ok(())
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
