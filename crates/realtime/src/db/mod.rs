pub mod migrations;
pub mod pool;
pub mod snapshot_store;

pub use snapshot_store::{MemorySnapshotStore, PersistedSnapshot, SnapshotStore};
