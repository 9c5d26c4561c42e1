pub mod cursor;
pub mod lock;
pub mod memory;
pub mod sqlite;
pub mod traits;

pub use cursor::{RawCursor, RecordCursor};
pub use lock::{PipelineGuard, TableLockGuard, TableLocks};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use traits::{
    MetaStore, NewRawRecord, PIPELINES_TABLE, RawRecord, Record, RecordFilter, RecordStore,
    ScopePurge, TASKS_TABLE,
};
