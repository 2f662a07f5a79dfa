use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::RwLock;

use relay_api::offset::check_advance;
use relay_api::{Cursor, OffsetError, OffsetStore, OffsetStoreFactory, PartitionId, TransportError};

// ═══════════════════════════════════════════════════════════════
//  MemoryOffsetStore
// ═══════════════════════════════════════════════════════════════

/// Cursors held in memory. Lost on restart: suitable for tests and for
/// consumers that always start from `earliest`/`latest`.
#[derive(Default)]
pub struct MemoryOffsetStore {
    cursors: RwLock<BTreeMap<PartitionId, u64>>,
}

impl MemoryOffsetStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl OffsetStore for MemoryOffsetStore {
    fn load<'a>(
        &'a self,
        partition: &'a PartitionId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<u64>, OffsetError>> + Send + 'a>> {
        Box::pin(async move { Ok(self.cursors.read().await.get(partition).copied()) })
    }

    fn advance<'a>(
        &'a self,
        partition: &'a PartitionId,
        offset: u64,
    ) -> Pin<Box<dyn Future<Output = Result<(), OffsetError>> + Send + 'a>> {
        Box::pin(async move {
            let mut cursors = self.cursors.write().await;
            check_advance(partition, cursors.get(partition).copied(), offset)?;
            cursors.insert(partition.clone(), offset);
            Ok(())
        })
    }

    fn cursors(&self) -> Pin<Box<dyn Future<Output = Result<Vec<Cursor>, OffsetError>> + Send + '_>> {
        Box::pin(async move {
            Ok(self
                .cursors
                .read()
                .await
                .iter()
                .map(|(p, o)| Cursor { partition: p.clone(), offset: *o })
                .collect())
        })
    }
}

// ═══════════════════════════════════════════════════════════════
//  MemoryOffsetStoreFactory
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Default, serde::Deserialize)]
#[serde(deny_unknown_fields)]
struct MemoryOffsetConfig {}

pub struct MemoryOffsetStoreFactory;

impl OffsetStoreFactory for MemoryOffsetStoreFactory {
    fn create(&self, config_json: &str) -> Result<Arc<dyn OffsetStore>, TransportError> {
        if config_json != "{}" {
            let _: MemoryOffsetConfig = serde_json::from_str(config_json)
                .map_err(|e| TransportError::config(format!("memory offset store: {e}")))?;
        }
        Ok(Arc::new(MemoryOffsetStore::new()))
    }
}
