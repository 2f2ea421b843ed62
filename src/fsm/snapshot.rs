use std::{collections::BTreeMap, future::Future, io};

use base64::Engine as _;
use serde::{Deserialize, Serialize};

pub const SNAPSHOT_SCHEMA_VERSION: u32 = 1;

/// Destination of a persisted snapshot.
///
/// Data written through `write_all` must not become visible to readers of the backing store
/// until `close` returns successfully. `cancel` discards everything written so far.
pub trait SnapshotSink: Send {
    fn id(&self) -> &str;

    fn write_all(&mut self, bytes: &[u8]) -> impl Future<Output = io::Result<()>> + Send;

    fn close(self) -> impl Future<Output = io::Result<()>> + Send
    where
        Self: Sized;

    fn cancel(self) -> impl Future<Output = io::Result<()>> + Send
    where
        Self: Sized;
}

#[derive(Debug)]
pub enum PersistError {
    Released,
    Encode(serde_json::Error),
    Io(io::Error),
}

impl std::fmt::Display for PersistError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Released => write!(f, "snapshot already released"),
            Self::Encode(e) => write!(f, "encode snapshot: {e}"),
            Self::Io(e) => write!(f, "write snapshot: {e}"),
        }
    }
}

impl std::error::Error for PersistError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Released => None,
            Self::Encode(e) => Some(e),
            Self::Io(e) => Some(e),
        }
    }
}

#[derive(Debug)]
pub enum RestoreError {
    Io(io::Error),
    Malformed(serde_json::Error),
    SchemaVersionMismatch { expected: u32, got: u32 },
    InvalidValue { key: String, source: base64::DecodeError },
}

impl std::fmt::Display for RestoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "read snapshot: {e}"),
            Self::Malformed(e) => write!(f, "malformed snapshot: {e}"),
            Self::SchemaVersionMismatch { expected, got } => {
                write!(f, "snapshot schema_version mismatch: expected {expected}, got {got}")
            }
            Self::InvalidValue { key, source } => {
                write!(f, "snapshot value for {key} is not valid base64: {source}")
            }
        }
    }
}

impl std::error::Error for RestoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Malformed(e) => Some(e),
            Self::SchemaVersionMismatch { .. } => None,
            Self::InvalidValue { source, .. } => Some(source),
        }
    }
}

#[derive(Serialize)]
struct SnapshotPayloadOut<'a> {
    schema_version: u32,
    entries: BTreeMap<&'a str, String>,
}

#[derive(Deserialize)]
struct SnapshotPayloadIn {
    schema_version: u32,
    #[serde(default)]
    entries: BTreeMap<String, String>,
}

/// A point-in-time copy of the key-value mapping.
///
/// The copy is detached from the live state machine: later applies do not affect it, and it can
/// be persisted after the state machine is gone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageSnapshot {
    data: Option<BTreeMap<String, Vec<u8>>>,
}

impl StorageSnapshot {
    pub(crate) fn new(data: BTreeMap<String, Vec<u8>>) -> Self {
        Self { data: Some(data) }
    }

    pub fn len(&self) -> usize {
        self.data.as_ref().map(BTreeMap::len).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_released(&self) -> bool {
        self.data.is_none()
    }

    pub fn encode(&self) -> Result<Vec<u8>, PersistError> {
        let data = self.data.as_ref().ok_or(PersistError::Released)?;
        encode_entries(data).map_err(PersistError::Encode)
    }

    /// Serialize the captured mapping into `sink`.
    ///
    /// The sink is closed on success and cancelled on every failure path.
    pub async fn persist<S: SnapshotSink>(&self, mut sink: S) -> Result<(), PersistError> {
        let bytes = match self.encode() {
            Ok(bytes) => bytes,
            Err(err) => {
                cancel_sink(sink).await;
                return Err(err);
            }
        };
        if let Err(err) = sink.write_all(&bytes).await {
            cancel_sink(sink).await;
            return Err(PersistError::Io(err));
        }
        sink.close().await.map_err(PersistError::Io)?;
        tracing::debug!(entries = self.len(), bytes = bytes.len(), "snapshot persisted");
        Ok(())
    }

    /// Drop the captured mapping. Calling it more than once is a no-op.
    pub fn release(&mut self) {
        if self.data.take().is_some() {
            tracing::debug!("snapshot released");
        }
    }
}

async fn cancel_sink<S: SnapshotSink>(sink: S) {
    let id = sink.id().to_string();
    if let Err(err) = sink.cancel().await {
        tracing::warn!(snapshot_id = %id, error = %err, "cancel snapshot sink");
    }
}

pub(crate) fn encode_entries(data: &BTreeMap<String, Vec<u8>>) -> Result<Vec<u8>, serde_json::Error> {
    let entries = data
        .iter()
        .map(|(k, v)| {
            (
                k.as_str(),
                base64::engine::general_purpose::STANDARD.encode(v),
            )
        })
        .collect();
    serde_json::to_vec(&SnapshotPayloadOut {
        schema_version: SNAPSHOT_SCHEMA_VERSION,
        entries,
    })
}

pub(crate) fn decode_entries(bytes: &[u8]) -> Result<BTreeMap<String, Vec<u8>>, RestoreError> {
    let payload: SnapshotPayloadIn =
        serde_json::from_slice(bytes).map_err(RestoreError::Malformed)?;
    if payload.schema_version != SNAPSHOT_SCHEMA_VERSION {
        return Err(RestoreError::SchemaVersionMismatch {
            expected: SNAPSHOT_SCHEMA_VERSION,
            got: payload.schema_version,
        });
    }
    let mut out = BTreeMap::new();
    for (key, value) in payload.entries {
        match base64::engine::general_purpose::STANDARD.decode(&value) {
            Ok(value) => {
                out.insert(key, value);
            }
            Err(source) => return Err(RestoreError::InvalidValue { key, source }),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use pretty_assertions::assert_eq;

    use super::*;

    #[derive(Debug, Default, Clone)]
    struct SinkLog {
        committed: Arc<Mutex<Option<Vec<u8>>>>,
        cancelled: Arc<Mutex<bool>>,
    }

    struct MemorySink {
        log: SinkLog,
        buf: Vec<u8>,
        fail_writes: bool,
    }

    impl SnapshotSink for MemorySink {
        fn id(&self) -> &str {
            "memory"
        }

        async fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
            if self.fail_writes {
                return Err(io::Error::other("disk full"));
            }
            self.buf.extend_from_slice(bytes);
            Ok(())
        }

        async fn close(self) -> io::Result<()> {
            *self.log.committed.lock().unwrap() = Some(self.buf);
            Ok(())
        }

        async fn cancel(self) -> io::Result<()> {
            *self.log.cancelled.lock().unwrap() = true;
            Ok(())
        }
    }

    fn sink(log: &SinkLog, fail_writes: bool) -> MemorySink {
        MemorySink {
            log: log.clone(),
            buf: Vec::new(),
            fail_writes,
        }
    }

    fn sample() -> BTreeMap<String, Vec<u8>> {
        BTreeMap::from([
            ("a".to_string(), b"1".to_vec()),
            ("bin".to_string(), vec![0, 1, 2, 255]),
        ])
    }

    #[tokio::test]
    async fn persist_closes_sink_with_decodable_payload() {
        let log = SinkLog::default();
        let snap = StorageSnapshot::new(sample());
        snap.persist(sink(&log, false)).await.unwrap();

        let bytes = log.committed.lock().unwrap().clone().unwrap();
        assert_eq!(decode_entries(&bytes).unwrap(), sample());
        assert!(!*log.cancelled.lock().unwrap());
    }

    #[tokio::test]
    async fn persist_cancels_sink_on_write_failure() {
        let log = SinkLog::default();
        let snap = StorageSnapshot::new(sample());
        let err = snap.persist(sink(&log, true)).await.unwrap_err();

        assert!(matches!(err, PersistError::Io(_)));
        assert!(*log.cancelled.lock().unwrap());
        assert!(log.committed.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn released_snapshot_cannot_be_persisted() {
        let log = SinkLog::default();
        let mut snap = StorageSnapshot::new(sample());
        snap.release();
        snap.release();
        assert!(snap.is_released());
        assert_eq!(snap.len(), 0);

        let err = snap.persist(sink(&log, false)).await.unwrap_err();
        assert!(matches!(err, PersistError::Released));
        assert!(*log.cancelled.lock().unwrap());
    }

    #[test]
    fn decode_rejects_unknown_schema_version() {
        let err = decode_entries(br#"{"schema_version":2,"entries":{}}"#).unwrap_err();
        assert!(matches!(
            err,
            RestoreError::SchemaVersionMismatch {
                expected: 1,
                got: 2
            }
        ));
    }

    #[test]
    fn decode_rejects_truncated_payload() {
        let bytes = encode_entries(&sample()).unwrap();
        let err = decode_entries(&bytes[..bytes.len() / 2]).unwrap_err();
        assert!(matches!(err, RestoreError::Malformed(_)));
    }

    #[test]
    fn decode_rejects_invalid_value() {
        let err =
            decode_entries(br#"{"schema_version":1,"entries":{"k":"%%%"}}"#).unwrap_err();
        assert!(matches!(err, RestoreError::InvalidValue { ref key, .. } if key == "k"));
    }
}
