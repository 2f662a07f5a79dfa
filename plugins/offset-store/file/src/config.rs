// ════════════════════════════════════════════════════════════════
//  Configuration
// ════════════════════════════════════════════════════════════════

fn default_flush_every() -> u32 {
    1
}

#[derive(Debug, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct FileOffsetConfig {
    /// JSON-документ с курсорами. Каталог создаётся при первой записи.
    pub path: String,
    /// Записывать файл каждые N вызовов advance. 1: после каждого.
    #[serde(default = "default_flush_every")]
    pub flush_every: u32,
}

// ════════════════════════════════════════════════════════════════
//  On-disk format
// ════════════════════════════════════════════════════════════════

#[derive(Debug, Default, serde::Serialize, serde::Deserialize)]
pub(crate) struct DiskDocument {
    pub cursors: Vec<DiskCursor>,
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub(crate) struct DiskCursor {
    pub topic: String,
    pub partition: u32,
    pub offset: u64,
}
