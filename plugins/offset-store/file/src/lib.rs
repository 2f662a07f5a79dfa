mod config;
mod store;

use std::sync::Arc;

use relay_api::{OffsetStore, OffsetStoreFactory, TransportError};

use config::FileOffsetConfig;
pub use store::FileOffsetStore;

// ════════════════════════════════════════════════════════════════
//  Factory
// ════════════════════════════════════════════════════════════════

/// Builds a [`FileOffsetStore`] from `{"path": "...", "flush_every": N}`.
pub struct FileOffsetStoreFactory;

impl OffsetStoreFactory for FileOffsetStoreFactory {
    fn create(&self, config_json: &str) -> Result<Arc<dyn OffsetStore>, TransportError> {
        let cfg: FileOffsetConfig = serde_json::from_str(config_json)
            .map_err(|e| TransportError::config(format!("file offset store: {e}")))?;
        if cfg.flush_every == 0 {
            return Err(TransportError::config("file offset store: flush_every must be > 0"));
        }
        let store = FileOffsetStore::open_with(&cfg.path, cfg.flush_every)?;
        Ok(Arc::new(store))
    }
}
