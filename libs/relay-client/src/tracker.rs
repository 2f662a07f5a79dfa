use std::collections::{BTreeSet, HashMap};

use relay_api::{MessageId, PartitionId};

/// Lifecycle of one delivered message.
///
/// `Delivered → Acked` and `Delivered → Expired` are terminal.
/// `Delivered → Nacked → Delivered` is the redelivery loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Delivered,
    Acked,
    Nacked,
    Expired,
}

impl DeliveryState {
    pub fn is_terminal(self) -> bool {
        matches!(self, DeliveryState::Acked | DeliveryState::Expired)
    }
}

#[derive(Debug, Clone)]
pub struct DeliveryRecord {
    pub id: MessageId,
    pub state: DeliveryState,
    pub delivery_count: u32,
}

/// Result of `ack` / `expire`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settled {
    /// State changed. `commit` is the new cursor if the committable prefix grew.
    Done { commit: Option<u64> },
    /// Already terminal (or already below the cursor). Nothing changed.
    Duplicate,
    /// Never recorded.
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackOutcome {
    /// Redeliver; the next delivery carries `delivery_count`.
    Requeue { delivery_count: u32 },
    /// Requeue asked but `max_redeliveries` reached: dead-letter, then `expire`.
    Exhausted { delivery_count: u32 },
    /// Nacked without requeue: dead-letter, then `expire`.
    Rejected { delivery_count: u32 },
    /// Already terminal or never recorded.
    Ignored,
}

#[derive(Debug, Default)]
struct Ledger {
    /// Offsets in Delivered/Nacked state.
    outstanding: BTreeSet<u64>,
    /// Terminal offsets above the cursor whose records are still kept.
    settled: BTreeSet<u64>,
    committed: Option<u64>,
}

impl Ledger {
    /// Highest offset such that every tracked offset at or below it is terminal.
    fn commit_candidate(&self) -> Option<u64> {
        let highest_settled = *self.settled.iter().next_back()?;
        let candidate = match self.outstanding.iter().next() {
            None => highest_settled,
            Some(0) => return None,
            Some(&min) => highest_settled.min(min - 1),
        };
        match self.committed {
            Some(c) if candidate <= c => None,
            _ => Some(candidate),
        }
    }
}

/// Per-subscription acknowledgment state.
///
/// Lookup by message id is a hash-map hit; the minimum outstanding offset of a
/// partition comes from an ordered set, so computing the advanceable cursor
/// is O(log n). Records are dropped once the cursor passes them.
#[derive(Debug)]
pub struct AckTracker {
    records: HashMap<MessageId, DeliveryRecord>,
    ledgers: HashMap<PartitionId, Ledger>,
    max_redeliveries: u32,
}

impl AckTracker {
    pub fn new(max_redeliveries: u32) -> Self {
        Self {
            records: HashMap::new(),
            ledgers: HashMap::new(),
            max_redeliveries: max_redeliveries.max(1),
        }
    }

    /// Seed the committed cursor (loaded from the offset store).
    pub fn set_committed(&mut self, partition: &PartitionId, offset: u64) {
        self.ledgers.entry(partition.clone()).or_default().committed = Some(offset);
    }

    pub fn committed(&self, partition: &PartitionId) -> Option<u64> {
        self.ledgers.get(partition).and_then(|l| l.committed)
    }

    /// Register a (re)delivery. A Nacked record goes back to Delivered with
    /// the given count; terminal records are left untouched.
    pub fn record(&mut self, id: &MessageId, delivery_count: u32) {
        let ledger = self.ledgers.entry(id.partition.clone()).or_default();
        if ledger.committed.is_some_and(|c| id.offset <= c) {
            return;
        }
        match self.records.get_mut(id) {
            Some(rec) if rec.state.is_terminal() => {}
            Some(rec) => {
                rec.state = DeliveryState::Delivered;
                rec.delivery_count = delivery_count;
            }
            None => {
                ledger.outstanding.insert(id.offset);
                self.records.insert(
                    id.clone(),
                    DeliveryRecord {
                        id: id.clone(),
                        state: DeliveryState::Delivered,
                        delivery_count,
                    },
                );
            }
        }
    }

    pub fn ack(&mut self, id: &MessageId) -> Settled {
        self.settle(id, DeliveryState::Acked)
    }

    /// Terminal failure: the message was dead-lettered.
    pub fn expire(&mut self, id: &MessageId) -> Settled {
        self.settle(id, DeliveryState::Expired)
    }

    pub fn nack(&mut self, id: &MessageId, requeue: bool) -> NackOutcome {
        let Some(rec) = self.records.get_mut(id) else {
            return NackOutcome::Ignored;
        };
        if rec.state.is_terminal() {
            return NackOutcome::Ignored;
        }
        rec.state = DeliveryState::Nacked;
        let count = rec.delivery_count;
        if !requeue {
            NackOutcome::Rejected { delivery_count: count }
        } else if count < self.max_redeliveries {
            NackOutcome::Requeue { delivery_count: count + 1 }
        } else {
            NackOutcome::Exhausted { delivery_count: count }
        }
    }

    /// Delivered or Nacked records of `partition`.
    pub fn pending_count(&self, partition: &PartitionId) -> usize {
        self.ledgers.get(partition).map_or(0, |l| l.outstanding.len())
    }

    pub fn total_pending(&self) -> usize {
        self.ledgers.values().map(|l| l.outstanding.len()).sum()
    }

    pub fn min_outstanding(&self, partition: &PartitionId) -> Option<u64> {
        self.ledgers
            .get(partition)
            .and_then(|l| l.outstanding.iter().next().copied())
    }

    pub fn get(&self, id: &MessageId) -> Option<&DeliveryRecord> {
        self.records.get(id)
    }

    pub fn state(&self, id: &MessageId) -> Option<DeliveryState> {
        self.records.get(id).map(|r| r.state)
    }

    fn settle(&mut self, id: &MessageId, state: DeliveryState) -> Settled {
        let Some(ledger) = self.ledgers.get_mut(&id.partition) else {
            return Settled::Unknown;
        };
        let Some(rec) = self.records.get_mut(id) else {
            return if ledger.committed.is_some_and(|c| id.offset <= c) {
                Settled::Duplicate
            } else {
                Settled::Unknown
            };
        };
        if rec.state.is_terminal() {
            return Settled::Duplicate;
        }

        rec.state = state;
        ledger.outstanding.remove(&id.offset);
        ledger.settled.insert(id.offset);

        let commit = ledger.commit_candidate();
        if let Some(c) = commit {
            ledger.committed = Some(c);
            let above = ledger.settled.split_off(&(c + 1));
            let pruned = std::mem::replace(&mut ledger.settled, above);
            for offset in pruned {
                self.records
                    .remove(&MessageId::new(id.partition.clone(), offset));
            }
        }
        Settled::Done { commit }
    }
}
