use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use tokio::sync::Mutex;

use relay_api::offset::check_advance;
use relay_api::{Cursor, OffsetError, OffsetStore, PartitionId, TransportError};

use super::config::{DiskCursor, DiskDocument};

// ════════════════════════════════════════════════════════════════
//  FileOffsetStore
// ════════════════════════════════════════════════════════════════

struct State {
    cursors: BTreeMap<PartitionId, u64>,
    /// advance() calls since the last write.
    unsaved: u32,
}

/// Cursors persisted as one JSON document.
///
/// Every write goes to `<path>.tmp` and is renamed over `<path>`, so a crash
/// leaves either the old or the new document, never a torn one.
pub struct FileOffsetStore {
    path: PathBuf,
    flush_every: u32,
    state: Mutex<State>,
}

impl FileOffsetStore {
    /// Open (or create on first write) a store that persists after every advance.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, TransportError> {
        Self::open_with(path, 1)
    }

    pub fn open_with(path: impl AsRef<Path>, flush_every: u32) -> Result<Self, TransportError> {
        let path = path.as_ref().to_path_buf();
        let cursors = load_document(&path)?;
        tracing::debug!(path = %path.display(), cursors = cursors.len(), "offset store opened");
        Ok(Self {
            path,
            flush_every: flush_every.max(1),
            state: Mutex::new(State { cursors, unsaved: 0 }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, state: &mut State) -> Result<(), TransportError> {
        let doc = DiskDocument {
            cursors: state
                .cursors
                .iter()
                .map(|(p, o)| DiskCursor {
                    topic: p.topic.clone(),
                    partition: p.partition,
                    offset: *o,
                })
                .collect(),
        };
        let bytes = serde_json::to_vec_pretty(&doc)?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| TransportError::io(format!("mkdir {}: {e}", parent.display())))?;
            }
        }

        let tmp = tmp_path(&self.path);
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| TransportError::io(format!("write {}: {e}", tmp.display())))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| TransportError::io(format!("rename {}: {e}", self.path.display())))?;

        state.unsaved = 0;
        Ok(())
    }
}

impl OffsetStore for FileOffsetStore {
    fn load<'a>(
        &'a self,
        partition: &'a PartitionId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<u64>, OffsetError>> + Send + 'a>> {
        Box::pin(async move { Ok(self.state.lock().await.cursors.get(partition).copied()) })
    }

    fn advance<'a>(
        &'a self,
        partition: &'a PartitionId,
        offset: u64,
    ) -> Pin<Box<dyn Future<Output = Result<(), OffsetError>> + Send + 'a>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let current = state.cursors.get(partition).copied();
            check_advance(partition, current, offset)?;
            if current == Some(offset) {
                return Ok(());
            }

            state.cursors.insert(partition.clone(), offset);
            state.unsaved += 1;
            if state.unsaved >= self.flush_every {
                self.persist(&mut state).await?;
            }
            Ok(())
        })
    }

    fn cursors(&self) -> Pin<Box<dyn Future<Output = Result<Vec<Cursor>, OffsetError>> + Send + '_>> {
        Box::pin(async move {
            let state = self.state.lock().await;
            Ok(state
                .cursors
                .iter()
                .map(|(p, o)| Cursor { partition: p.clone(), offset: *o })
                .collect())
        })
    }

    fn flush(&self) -> Pin<Box<dyn Future<Output = Result<(), OffsetError>> + Send + '_>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            if state.unsaved > 0 {
                self.persist(&mut state).await?;
            }
            Ok(())
        })
    }
}

// ════════════════════════════════════════════════════════════════
//  Helpers
// ════════════════════════════════════════════════════════════════

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".tmp");
    PathBuf::from(name)
}

/// Прочитать документ с курсорами. Нет файла: пустой набор.
fn load_document(path: &Path) -> Result<BTreeMap<PartitionId, u64>, TransportError> {
    let bytes = match std::fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(e) => return Err(TransportError::io(format!("read {}: {e}", path.display()))),
    };
    let doc: DiskDocument = serde_json::from_slice(&bytes)
        .map_err(|e| TransportError::config(format!("parse {}: {e}", path.display())))?;
    Ok(doc
        .cursors
        .into_iter()
        .map(|c| (PartitionId::new(c.topic, c.partition), c.offset))
        .collect())
}
