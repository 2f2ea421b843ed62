//! The replicated key-value state machine.
//!
//! Every mutation of the mapping happens inside [`StorageFsm::apply`], guarded by a single mutex,
//! and only as a function of the decoded command. Raft delivers the same entries in the same
//! order to every replica, so every replica ends in the same state.

pub mod snapshot;

use std::{collections::BTreeMap, sync::Arc};

use tokio::{
    io::{AsyncRead, AsyncReadExt as _},
    sync::Mutex,
};
use tracing::debug;

use crate::command::{Command, DecodeError};

pub use snapshot::{PersistError, RestoreError, SnapshotSink, StorageSnapshot};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotFound {
    pub key: String,
}

impl std::fmt::Display for NotFound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "key not found: {}", self.key)
    }
}

impl std::error::Error for NotFound {}

/// Effect of one applied command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    Set { key: String },
    Deleted { key: String, existed: bool },
}

#[derive(Debug, Clone, Default)]
pub struct StorageFsm {
    cache: Arc<Mutex<BTreeMap<String, Vec<u8>>>>,
}

impl StorageFsm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode `payload` and apply it to the mapping.
    ///
    /// A payload that does not decode leaves the mapping untouched.
    pub async fn apply(&self, payload: &[u8]) -> Result<Applied, DecodeError> {
        let mut cache = self.cache.lock().await;
        let applied = match Command::decode(payload)? {
            Command::Set { key, value } => {
                debug!(key = %key, len = value.len(), "apply SET");
                cache.insert(key.clone(), value);
                Applied::Set { key }
            }
            Command::Del { key } => {
                let existed = cache.remove(&key).is_some();
                debug!(key = %key, existed, "apply DEL");
                Applied::Deleted { key, existed }
            }
        };
        Ok(applied)
    }

    /// Local read; may lag behind the leader.
    pub async fn get(&self, key: &str) -> Result<Vec<u8>, NotFound> {
        let cache = self.cache.lock().await;
        cache.get(key).cloned().ok_or_else(|| NotFound {
            key: key.to_string(),
        })
    }

    pub async fn len(&self) -> usize {
        self.cache.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.cache.lock().await.is_empty()
    }

    /// Capture the mapping as it is between two applies. The lock is held only for the clone.
    pub async fn snapshot(&self) -> StorageSnapshot {
        let data = self.cache.lock().await.clone();
        debug!(entries = data.len(), "snapshot captured");
        StorageSnapshot::new(data)
    }

    /// Replace the mapping with the contents of a persisted snapshot.
    ///
    /// The input is consumed and dropped on every return path. On error the previous mapping is
    /// kept as is. Returns the number of restored keys.
    pub async fn restore<R>(&self, mut input: R) -> Result<usize, RestoreError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut cache = self.cache.lock().await;
        let mut buf = Vec::new();
        let read = input.read_to_end(&mut buf).await;
        drop(input);
        read.map_err(RestoreError::Io)?;

        let restored = snapshot::decode_entries(&buf)?;
        let count = restored.len();
        *cache = restored;
        debug!(entries = count, "state machine restored");
        Ok(count)
    }
}
