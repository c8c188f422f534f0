mod bitmap;
mod buffer;
pub mod compaction;
mod entry;
mod index;
mod log;
mod manager;
mod meta;
mod segment;
mod snapshot;

pub use bitmap::OffsetBitmap;
pub use buffer::Buffer;
pub use buffer::FileBuffer;
pub use buffer::HeapBuffer;
pub use entry::CommandConsistency;
pub use entry::EntryKind;
pub use entry::LogEntry;
pub use entry::QueryConsistency;
pub use entry::SessionId;
pub use index::Index;
pub use index::Term;
pub use log::SegmentedLog;
pub use manager::SegmentManager;
pub use manager::StorageConfig;
pub use meta::MetaStore;
pub use snapshot::Snapshot;
pub use snapshot::SnapshotStore;
pub use snapshot::SnapshotWriter;
