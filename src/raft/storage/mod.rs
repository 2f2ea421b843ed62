//! OpenRaft storage (v2): an in-memory log store and a state machine backed by [`StorageFsm`]
//! whose snapshots are persisted by [`FileSnapshotStore`].
//!
//! [`StorageFsm`]: crate::fsm::StorageFsm

pub mod log_store;
pub mod snapshot_store;
pub mod state_machine;

pub use log_store::MemLogStore;
pub use snapshot_store::{FileSnapshotSink, FileSnapshotStore, SnapshotRecord};
pub use state_machine::{KvSnapshotBuilder, KvStateMachine};
