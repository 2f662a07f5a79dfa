use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::{Notify, watch};

use relay_api::{Connector, FetchedRecord, Message, Transport, TransportError};

use crate::SCHEME;
use crate::transport::LoopbackTransport;

// ═══════════════════════════════════════════════════════════════
//  Partition
// ═══════════════════════════════════════════════════════════════

/// Append-only лог одной партиции + сигнал о новых записях.
pub(crate) struct Partition {
    log: Mutex<Vec<Message>>,
    pub(crate) appended: Notify,
}

impl Partition {
    fn new() -> Self {
        Self {
            log: Mutex::new(Vec::new()),
            appended: Notify::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Message>> {
        match self.log.lock() {
            Ok(g) => g,
            Err(poisoned) => {
                tracing::warn!("partition log lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Дописать сообщение, вернуть присвоенный offset.
    pub(crate) fn append(&self, message: Message) -> u64 {
        let offset = {
            let mut log = self.lock();
            log.push(message);
            (log.len() - 1) as u64
        };
        self.appended.notify_waiters();
        offset
    }

    pub(crate) fn read(&self, from: u64, max: usize) -> Vec<FetchedRecord> {
        let log = self.lock();
        log.iter()
            .enumerate()
            .skip(from as usize)
            .take(max)
            .map(|(i, m)| FetchedRecord {
                offset: i as u64,
                message: m.clone(),
            })
            .collect()
    }

    pub(crate) fn end(&self) -> u64 {
        self.lock().len() as u64
    }
}

pub(crate) struct Topic {
    pub(crate) partitions: Vec<Arc<Partition>>,
}

// ═══════════════════════════════════════════════════════════════
//  Shared broker state
// ═══════════════════════════════════════════════════════════════

pub(crate) struct Shared {
    topics: RwLock<HashMap<String, Arc<Topic>>>,
    /// Сколько следующих connect() завершатся ошибкой.
    fail_connects: AtomicU32,
    connects: AtomicU64,
    /// Поколение соединений. `sever_connections` увеличивает его, и все
    /// транспорты предыдущего поколения начинают отвечать ошибкой.
    pub(crate) generation: AtomicU64,
    /// `true`: broker принимает produce, но не подтверждает, пока не снята пауза.
    pub(crate) acks_paused: watch::Sender<bool>,
}

impl Shared {
    pub(crate) fn topic(&self, name: &str) -> Option<Arc<Topic>> {
        let guard = match self.topics.read() {
            Ok(g) => g,
            Err(poisoned) => {
                tracing::warn!("broker topic registry read lock was poisoned, recovering");
                poisoned.into_inner()
            }
        };
        guard.get(name).cloned()
    }

    fn wake_all(&self) {
        let guard = match self.topics.read() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        for topic in guard.values() {
            for p in &topic.partitions {
                p.appended.notify_waiters();
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════
//  LoopbackBroker
// ═══════════════════════════════════════════════════════════════

/// In-process broker. Cloning shares the same state.
#[derive(Clone)]
pub struct LoopbackBroker {
    shared: Arc<Shared>,
}

impl Default for LoopbackBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackBroker {
    pub fn new() -> Self {
        let (acks_paused, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                topics: RwLock::new(HashMap::new()),
                fail_connects: AtomicU32::new(0),
                connects: AtomicU64::new(0),
                generation: AtomicU64::new(0),
                acks_paused,
            }),
        }
    }

    /// Создать topic. Повторное создание с тем же именем ничего не меняет.
    pub fn create_topic(&self, name: &str, partitions: u32) {
        let mut guard = match self.shared.topics.write() {
            Ok(g) => g,
            Err(poisoned) => {
                tracing::warn!("broker topic registry write lock was poisoned, recovering");
                poisoned.into_inner()
            }
        };
        guard.entry(name.to_string()).or_insert_with(|| {
            tracing::debug!(topic = name, partitions, "loopback topic created");
            Arc::new(Topic {
                partitions: (0..partitions.max(1)).map(|_| Arc::new(Partition::new())).collect(),
            })
        });
    }

    pub fn topic_names(&self) -> Vec<String> {
        let guard = match self.shared.topics.read() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut names: Vec<String> = guard.keys().cloned().collect();
        names.sort();
        names
    }

    /// Содержимое лога партиции (для проверок в тестах).
    pub fn records(&self, topic: &str, partition: u32) -> Vec<FetchedRecord> {
        self.shared
            .topic(topic)
            .and_then(|t| t.partitions.get(partition as usize).cloned())
            .map(|p| p.read(0, usize::MAX))
            .unwrap_or_default()
    }

    /// Append directly, bypassing any client. Used to seed logs.
    pub fn append(&self, topic: &str, partition: u32, message: Message) -> Option<u64> {
        let part = self
            .shared
            .topic(topic)
            .and_then(|t| t.partitions.get(partition as usize).cloned())?;
        Some(part.append(message))
    }

    // ── Fault injection ──

    /// Следующие `n` вызовов connect() завершатся transient-ошибкой.
    pub fn fail_next_connects(&self, n: u32) {
        self.shared.fail_connects.store(n, Ordering::SeqCst);
    }

    /// Number of successful connects so far.
    pub fn connect_count(&self) -> u64 {
        self.shared.connects.load(Ordering::SeqCst)
    }

    /// Produce calls wait (unacknowledged) until [`resume_acks`](Self::resume_acks).
    pub fn pause_acks(&self) {
        self.shared.acks_paused.send_replace(true);
    }

    pub fn resume_acks(&self) {
        self.shared.acks_paused.send_replace(false);
    }

    /// Разорвать все текущие соединения. Новые connect() работают как обычно.
    pub fn sever_connections(&self) {
        let prev = self.shared.generation.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(generation = prev + 1, "loopback connections severed");
        self.shared.wake_all();
    }
}

impl Connector for LoopbackBroker {
    fn connect<'a>(
        &'a self,
        endpoint: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Box<dyn Transport>, TransportError>> + Send + 'a>> {
        Box::pin(async move {
            if !endpoint.starts_with(SCHEME) {
                return Err(TransportError::config(format!(
                    "unsupported endpoint '{endpoint}', expected {SCHEME}<name>"
                )));
            }

            let remaining = self.shared.fail_connects.load(Ordering::SeqCst);
            if remaining > 0 {
                self.shared.fail_connects.store(remaining - 1, Ordering::SeqCst);
                return Err(TransportError::io(format!("connection refused: {endpoint}")));
            }

            self.shared.connects.fetch_add(1, Ordering::SeqCst);
            let generation = self.shared.generation.load(Ordering::SeqCst);
            Ok(Box::new(LoopbackTransport::new(self.shared.clone(), generation)) as Box<dyn Transport>)
        })
    }
}
