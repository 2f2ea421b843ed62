//! File-backed snapshot store.
//!
//! Layout under the store directory:
//!
//! ```text
//! <name>/meta.json     SnapshotRecord (openraft meta + bookkeeping)
//! <name>/state.json    encoded mapping
//! <name>.tmp/          in-progress snapshot, never read
//! ```
//!
//! `<name>` is chosen by the store (last index, creation time, sequence number). The openraft
//! `snapshot_id` may come from a remote leader and is only ever stored inside `meta.json`.
//!
//! A snapshot becomes visible only when its `.tmp` directory is renamed into place, so readers
//! never observe a partial write.

use std::{
    fs,
    io::{self, Write as _},
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    fsm::SnapshotSink,
    raft::types::{NodeId, NodeMeta},
};

pub const DEFAULT_RETAIN: usize = 3;

const META_FILE: &str = "meta.json";
const STATE_FILE: &str = "state.json";
const TMP_SUFFIX: &str = ".tmp";

pub type SnapshotMeta = openraft::SnapshotMeta<NodeId, NodeMeta>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub meta: SnapshotMeta,
    pub size: u64,
    pub created_at_ms: u64,
    /// Breaks ties between snapshots committed in the same millisecond.
    #[serde(default)]
    pub seq: u64,
    /// Directory name under the store, filled in when listing.
    #[serde(skip)]
    pub dir_name: String,
}

impl SnapshotRecord {
    fn sort_key(&self) -> (Option<u64>, u64, u64) {
        (
            self.meta.last_log_id.as_ref().map(|l| l.index),
            self.created_at_ms,
            self.seq,
        )
    }
}

#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    dir: PathBuf,
    retain: usize,
    seq: Arc<AtomicU64>,
}

impl FileSnapshotStore {
    /// Open (creating if needed) a store keeping at most `retain` snapshots.
    pub fn open(dir: impl Into<PathBuf>, retain: usize) -> io::Result<Self> {
        let dir = dir.into();
        if retain == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "snapshot retain count must be at least 1",
            ));
        }
        fs::create_dir_all(&dir)?;

        for ent in fs::read_dir(&dir)? {
            let ent = ent?;
            let name = ent.file_name();
            if name.to_string_lossy().ends_with(TMP_SUFFIX) {
                warn!(path = %ent.path().display(), "removing stale snapshot");
                fs::remove_dir_all(ent.path())?;
            }
        }

        info!(dir = %dir.display(), retain, "snapshot store opened");
        Ok(Self {
            dir,
            retain,
            seq: Arc::default(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn retain(&self) -> usize {
        self.retain
    }

    /// Start a new snapshot. Nothing is visible until the returned sink is closed.
    pub fn create(&self, meta: SnapshotMeta) -> FileSnapshotSink {
        FileSnapshotSink {
            store: self.clone(),
            meta,
            buf: Vec::new(),
        }
    }

    /// All complete snapshots, newest first.
    pub async fn list(&self) -> io::Result<Vec<SnapshotRecord>> {
        let dir = self.dir.clone();
        tokio::task::spawn_blocking(move || list_blocking(&dir))
            .await
            .map_err(io::Error::other)?
    }

    pub async fn latest(&self) -> io::Result<Option<(SnapshotRecord, Vec<u8>)>> {
        let Some(record) = self.list().await?.into_iter().next() else {
            return Ok(None);
        };
        let bytes = self.read(&record).await?;
        Ok(Some((record, bytes)))
    }

    pub async fn read(&self, record: &SnapshotRecord) -> io::Result<Vec<u8>> {
        tokio::fs::read(self.dir.join(&record.dir_name).join(STATE_FILE)).await
    }

    async fn commit(&self, meta: SnapshotMeta, bytes: Vec<u8>) -> io::Result<()> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.commit_blocking(meta, bytes))
            .await
            .map_err(io::Error::other)?
    }

    fn commit_blocking(&self, meta: SnapshotMeta, bytes: Vec<u8>) -> io::Result<()> {
        let created_at_ms = now_ms();
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let index = meta.last_log_id.as_ref().map(|l| l.index).unwrap_or(0);
        let name = format!("{index:020}-{created_at_ms}-{seq}");
        let final_dir = self.dir.join(&name);
        let tmp_dir = self.dir.join(format!("{name}{TMP_SUFFIX}"));

        let record = SnapshotRecord {
            meta,
            size: bytes.len() as u64,
            created_at_ms,
            seq,
            dir_name: name,
        };
        let meta_bytes = serde_json::to_vec_pretty(&record).map_err(io::Error::other)?;
        fs::create_dir(&tmp_dir)?;
        let written = write_synced(&tmp_dir.join(STATE_FILE), &bytes)
            .and_then(|()| write_synced(&tmp_dir.join(META_FILE), &meta_bytes))
            .and_then(|()| fs::rename(&tmp_dir, &final_dir));
        if let Err(err) = written {
            let _ = fs::remove_dir_all(&tmp_dir);
            return Err(err);
        }

        debug!(
            snapshot_id = %record.meta.snapshot_id,
            dir = %record.dir_name,
            size = record.size,
            "snapshot committed"
        );
        self.prune_blocking()
    }

    fn prune_blocking(&self) -> io::Result<()> {
        let records = list_blocking(&self.dir)?;
        for stale in records.iter().skip(self.retain) {
            info!(
                snapshot_id = %stale.meta.snapshot_id,
                dir = %stale.dir_name,
                "pruning snapshot"
            );
            fs::remove_dir_all(self.dir.join(&stale.dir_name))?;
        }
        Ok(())
    }
}

/// Sink for one snapshot of a [`FileSnapshotStore`].
#[derive(Debug)]
pub struct FileSnapshotSink {
    store: FileSnapshotStore,
    meta: SnapshotMeta,
    buf: Vec<u8>,
}

impl SnapshotSink for FileSnapshotSink {
    fn id(&self) -> &str {
        &self.meta.snapshot_id
    }

    async fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.buf.extend_from_slice(bytes);
        Ok(())
    }

    async fn close(self) -> io::Result<()> {
        self.store.commit(self.meta, self.buf).await
    }

    async fn cancel(self) -> io::Result<()> {
        debug!(snapshot_id = %self.meta.snapshot_id, "snapshot cancelled");
        Ok(())
    }
}

fn list_blocking(dir: &Path) -> io::Result<Vec<SnapshotRecord>> {
    let mut out = Vec::new();
    for ent in fs::read_dir(dir)? {
        let ent = ent?;
        if !ent.file_type()?.is_dir() || ent.file_name().to_string_lossy().ends_with(TMP_SUFFIX) {
            continue;
        }
        let meta_path = ent.path().join(META_FILE);
        let bytes = match fs::read(&meta_path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
            Err(err) => return Err(err),
        };
        match serde_json::from_slice::<SnapshotRecord>(&bytes) {
            Ok(mut record) => {
                record.dir_name = ent.file_name().to_string_lossy().into_owned();
                out.push(record);
            }
            Err(err) => {
                warn!(path = %meta_path.display(), error = %err, "skipping unreadable snapshot meta");
            }
        }
    }
    out.sort_by(|a, b| b.sort_key().cmp(&a.sort_key()));
    Ok(out)
}

fn write_synced(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut f = fs::File::create(path)?;
    f.write_all(bytes)?;
    f.sync_all()
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Snapshot id: last included index plus a timestamp, so two snapshots at the same index differ.
pub fn snapshot_id(last_index: Option<u64>) -> String {
    format!("snapshot-{}-{}", last_index.unwrap_or(0), now_ms())
}
