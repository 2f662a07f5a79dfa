use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use relay_api::{
    FetchedRecord, Message, PartitionId, RecordStream, Transport, TransportError,
};

use crate::broker::{Partition, Shared, Topic};

// ═══════════════════════════════════════════════════════════════
//  MpscRecordStream: push delivery
// ═══════════════════════════════════════════════════════════════

pub struct MpscRecordStream {
    rx: mpsc::Receiver<Result<FetchedRecord, TransportError>>,
}

impl RecordStream for MpscRecordStream {
    fn recv(
        &mut self,
    ) -> Pin<Box<dyn Future<Output = Option<Result<FetchedRecord, TransportError>>> + Send + '_>> {
        Box::pin(async { self.rx.recv().await })
    }
}

// ═══════════════════════════════════════════════════════════════
//  LoopbackTransport
// ═══════════════════════════════════════════════════════════════

/// One connection to a [`LoopbackBroker`](crate::LoopbackBroker).
pub struct LoopbackTransport {
    shared: Arc<Shared>,
    generation: u64,
    closed: Arc<AtomicBool>,
}

impl LoopbackTransport {
    pub(crate) fn new(shared: Arc<Shared>, generation: u64) -> Self {
        Self {
            shared,
            generation,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    fn check(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::closed("connection closed"));
        }
        if self.shared.generation.load(Ordering::SeqCst) != self.generation {
            return Err(TransportError::io("connection reset by broker"));
        }
        Ok(())
    }

    fn topic(&self, name: &str) -> Result<Arc<Topic>, TransportError> {
        self.shared
            .topic(name)
            .ok_or_else(|| TransportError::unroutable(format!("topic '{name}' not found")))
    }

    fn partition(&self, id: &PartitionId) -> Result<Arc<Partition>, TransportError> {
        self.topic(&id.topic)?
            .partitions
            .get(id.partition as usize)
            .cloned()
            .ok_or_else(|| TransportError::unroutable(format!("partition {id} not found")))
    }
}

impl Transport for LoopbackTransport {
    fn partitions<'a>(
        &'a self,
        topic: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<u32, TransportError>> + Send + 'a>> {
        Box::pin(async move {
            self.check()?;
            Ok(self.topic(topic)?.partitions.len() as u32)
        })
    }

    fn produce<'a>(
        &'a self,
        topic: &'a str,
        partition: u32,
        message: Message,
    ) -> Pin<Box<dyn Future<Output = Result<u64, TransportError>> + Send + 'a>> {
        Box::pin(async move {
            self.check()?;
            let part = self.partition(&PartitionId::new(topic, partition))?;

            // Подтверждение задерживается, пока включена пауза.
            let mut paused = self.shared.acks_paused.subscribe();
            let resumed = paused.wait_for(|p| !*p).await.map(|_| ());
            resumed.map_err(|_| TransportError::closed("broker stopped"))?;

            self.check()?;
            Ok(part.append(message))
        })
    }

    fn fetch<'a>(
        &'a self,
        partition: &'a PartitionId,
        offset: u64,
        max: usize,
        max_wait: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<FetchedRecord>, TransportError>> + Send + 'a>> {
        Box::pin(async move {
            let part = self.partition(partition)?;
            let deadline = Instant::now() + max_wait;
            loop {
                let notified = part.appended.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                self.check()?;
                let records = part.read(offset, max);
                if !records.is_empty() {
                    return Ok(records);
                }
                if tokio::time::timeout_at(deadline, notified).await.is_err() {
                    return Ok(Vec::new());
                }
            }
        })
    }

    fn end_offset<'a>(
        &'a self,
        partition: &'a PartitionId,
    ) -> Pin<Box<dyn Future<Output = Result<u64, TransportError>> + Send + 'a>> {
        Box::pin(async move {
            self.check()?;
            Ok(self.partition(partition)?.end())
        })
    }

    fn stream<'a>(
        &'a self,
        partition: &'a PartitionId,
        offset: u64,
        buffer: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Box<dyn RecordStream>, TransportError>> + Send + 'a>> {
        Box::pin(async move {
            self.check()?;
            let part = self.partition(partition)?;
            let buffer = buffer.max(1);
            let (tx, rx) = mpsc::channel(buffer);

            let shared = self.shared.clone();
            let closed = self.closed.clone();
            let generation = self.generation;
            let id = partition.clone();

            tokio::spawn(async move {
                let mut next = offset;
                loop {
                    let notified = part.appended.notified();
                    tokio::pin!(notified);
                    notified.as_mut().enable();

                    if closed.load(Ordering::SeqCst)
                        || shared.generation.load(Ordering::SeqCst) != generation
                    {
                        let _ = tx.send(Err(TransportError::io("connection reset by broker"))).await;
                        tracing::debug!(partition = %id, "loopback stream ended");
                        return;
                    }

                    let records = part.read(next, buffer);
                    if records.is_empty() {
                        tokio::select! {
                            _ = &mut notified => {}
                            _ = tx.closed() => return,
                        }
                        continue;
                    }
                    for record in records {
                        next = record.offset + 1;
                        if tx.send(Ok(record)).await.is_err() {
                            return;
                        }
                    }
                }
            });

            Ok(Box::new(MpscRecordStream { rx }) as Box<dyn RecordStream>)
        })
    }

    fn close(&self) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>> {
        Box::pin(async move {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        })
    }
}
