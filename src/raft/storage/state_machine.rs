use std::{io, io::Cursor, sync::Arc};

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::{
    fsm::{SnapshotSink as _, StorageFsm},
    raft::{
        storage::snapshot_store::{FileSnapshotStore, SnapshotMeta, snapshot_id},
        types::{ClientResponse, NodeId, NodeMeta, TypeConfig},
    },
};

use openraft::entry::RaftPayload as _;
use openraft::{
    EntryPayload, ErrorSubject, ErrorVerb, LogId, Snapshot, StoredMembership,
    storage::RaftStateMachine,
};

pub const REJECTED_INVALID_COMMAND: &str = "invalid_command";

#[derive(Debug, Default)]
struct AppliedState {
    last_applied: Option<LogId<NodeId>>,
    last_membership: StoredMembership<NodeId, NodeMeta>,
}

/// Adapts [`StorageFsm`] to OpenRaft's state machine interface.
///
/// `applied` is always locked before the FSM mapping, by both `apply` and the snapshot builder,
/// so a snapshot's data and its `last_log_id` describe the same point in the log.
#[derive(Debug, Clone)]
pub struct KvStateMachine {
    fsm: StorageFsm,
    snapshots: FileSnapshotStore,
    applied: Arc<Mutex<AppliedState>>,
}

impl KvStateMachine {
    /// Build the state machine, restoring from the newest persisted snapshot if there is one.
    pub async fn open(
        fsm: StorageFsm,
        snapshots: FileSnapshotStore,
    ) -> Result<Self, openraft::StorageError<NodeId>> {
        let mut applied = AppliedState::default();

        let latest = snapshots
            .latest()
            .await
            .map_err(|e| io_err(ErrorSubject::Snapshot(None), ErrorVerb::Read, e))?;
        if let Some((record, bytes)) = latest {
            let keys = fsm.restore(Cursor::new(bytes)).await.map_err(|e| {
                io_err(
                    ErrorSubject::Snapshot(None),
                    ErrorVerb::Read,
                    io::Error::other(e),
                )
            })?;
            info!(
                snapshot_id = %record.meta.snapshot_id,
                last_log_index = ?record.meta.last_log_id.map(|l| l.index),
                keys,
                "state machine restored from snapshot"
            );
            applied.last_applied = record.meta.last_log_id;
            applied.last_membership = record.meta.last_membership;
        }

        Ok(Self {
            fsm,
            snapshots,
            applied: Arc::new(Mutex::new(applied)),
        })
    }

    pub fn fsm(&self) -> &StorageFsm {
        &self.fsm
    }

    pub async fn last_applied(&self) -> Option<LogId<NodeId>> {
        self.applied.lock().await.last_applied
    }
}

#[derive(Debug)]
pub struct KvSnapshotBuilder {
    fsm: StorageFsm,
    snapshots: FileSnapshotStore,
    applied: Arc<Mutex<AppliedState>>,
}

impl openraft::RaftSnapshotBuilder<TypeConfig> for KvSnapshotBuilder {
    async fn build_snapshot(
        &mut self,
    ) -> Result<Snapshot<TypeConfig>, openraft::StorageError<NodeId>> {
        let (meta, mut artifact) = {
            let applied = self.applied.lock().await;
            let artifact = self.fsm.snapshot().await;
            let meta = SnapshotMeta {
                last_log_id: applied.last_applied,
                last_membership: applied.last_membership.clone(),
                snapshot_id: snapshot_id(applied.last_applied.map(|l| l.index)),
            };
            (meta, artifact)
        };

        let persisted = match artifact.encode() {
            Ok(bytes) => artifact
                .persist(self.snapshots.create(meta.clone()))
                .await
                .map(|()| bytes),
            Err(err) => Err(err),
        };
        let keys = artifact.len();
        artifact.release();
        let bytes = persisted.map_err(|e| {
            io_err(
                ErrorSubject::Snapshot(None),
                ErrorVerb::Write,
                io::Error::other(e),
            )
        })?;

        info!(
            snapshot_id = %meta.snapshot_id,
            last_log_index = ?meta.last_log_id.map(|l| l.index),
            keys,
            "snapshot built"
        );

        Ok(Snapshot {
            meta,
            snapshot: Box::new(Cursor::new(bytes)),
        })
    }
}

impl RaftStateMachine<TypeConfig> for KvStateMachine {
    type SnapshotBuilder = KvSnapshotBuilder;

    async fn applied_state(
        &mut self,
    ) -> Result<
        (Option<LogId<NodeId>>, StoredMembership<NodeId, NodeMeta>),
        openraft::StorageError<NodeId>,
    > {
        let applied = self.applied.lock().await;
        Ok((applied.last_applied, applied.last_membership.clone()))
    }

    async fn apply<I>(
        &mut self,
        entries: I,
    ) -> Result<Vec<ClientResponse>, openraft::StorageError<NodeId>>
    where
        I: IntoIterator<Item = openraft::impls::Entry<TypeConfig>> + openraft::OptionalSend,
        I::IntoIter: openraft::OptionalSend,
    {
        let mut responses = Vec::new();

        for entry in entries {
            let log_id = entry.log_id;
            let mut applied = self.applied.lock().await;
            if let Some(membership) = entry.get_membership() {
                applied.last_membership = StoredMembership::new(Some(log_id), membership.clone());
            }

            let resp = match entry.payload {
                EntryPayload::Normal(req) => match self.fsm.apply(&req.payload).await {
                    Ok(_) => ClientResponse::Ok,
                    Err(err) => {
                        warn!(index = log_id.index, error = %err, "committed entry rejected");
                        ClientResponse::Rejected {
                            code: REJECTED_INVALID_COMMAND.to_string(),
                            message: err.to_string(),
                        }
                    }
                },
                EntryPayload::Membership(_) | EntryPayload::Blank => ClientResponse::Ok,
            };

            applied.last_applied = Some(log_id);
            responses.push(resp);
        }

        Ok(responses)
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        KvSnapshotBuilder {
            fsm: self.fsm.clone(),
            snapshots: self.snapshots.clone(),
            applied: self.applied.clone(),
        }
    }

    async fn begin_receiving_snapshot(
        &mut self,
    ) -> Result<
        Box<<TypeConfig as openraft::RaftTypeConfig>::SnapshotData>,
        openraft::StorageError<NodeId>,
    > {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    async fn install_snapshot(
        &mut self,
        meta: &SnapshotMeta,
        snapshot: Box<<TypeConfig as openraft::RaftTypeConfig>::SnapshotData>,
    ) -> Result<(), openraft::StorageError<NodeId>> {
        let bytes = (*snapshot).into_inner();

        {
            let mut applied = self.applied.lock().await;
            self.fsm
                .restore(Cursor::new(bytes.clone()))
                .await
                .map_err(|e| {
                    io_err(
                        ErrorSubject::Snapshot(None),
                        ErrorVerb::Read,
                        io::Error::other(e),
                    )
                })?;
            applied.last_applied = meta.last_log_id;
            applied.last_membership = meta.last_membership.clone();
        }

        let mut sink = self.snapshots.create(meta.clone());
        sink.write_all(&bytes)
            .await
            .map_err(|e| io_err(ErrorSubject::Snapshot(None), ErrorVerb::Write, e))?;
        sink.close()
            .await
            .map_err(|e| io_err(ErrorSubject::Snapshot(None), ErrorVerb::Write, e))?;

        info!(
            snapshot_id = %meta.snapshot_id,
            last_log_index = ?meta.last_log_id.map(|l| l.index),
            "snapshot installed"
        );
        Ok(())
    }

    async fn get_current_snapshot(
        &mut self,
    ) -> Result<Option<Snapshot<TypeConfig>>, openraft::StorageError<NodeId>> {
        let latest = self
            .snapshots
            .latest()
            .await
            .map_err(|e| io_err(ErrorSubject::Snapshot(None), ErrorVerb::Read, e))?;
        Ok(latest.map(|(record, bytes)| Snapshot {
            meta: record.meta,
            snapshot: Box::new(Cursor::new(bytes)),
        }))
    }
}

fn io_err(
    subject: ErrorSubject<NodeId>,
    verb: ErrorVerb,
    err: io::Error,
) -> openraft::StorageError<NodeId> {
    openraft::StorageError::from_io_error(subject, verb, err)
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, BTreeSet};

    use openraft::{CommittedLeaderId, Membership, RaftSnapshotBuilder as _};
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        command::Command,
        raft::{storage::snapshot_store::DEFAULT_RETAIN, types::ClientRequest},
    };

    fn log_id(index: u64) -> LogId<NodeId> {
        LogId::new(CommittedLeaderId::new(1, 1), index)
    }

    fn normal(index: u64, payload: Vec<u8>) -> openraft::impls::Entry<TypeConfig> {
        openraft::impls::Entry {
            log_id: log_id(index),
            payload: EntryPayload::Normal(ClientRequest { payload }),
        }
    }

    fn cmd(index: u64, cmd: Command) -> openraft::impls::Entry<TypeConfig> {
        normal(index, cmd.encode())
    }

    async fn open(dir: &std::path::Path) -> KvStateMachine {
        let store = FileSnapshotStore::open(dir, DEFAULT_RETAIN).unwrap();
        KvStateMachine::open(StorageFsm::new(), store).await.unwrap()
    }

    #[tokio::test]
    async fn applies_entries_in_order_and_tracks_last_applied() {
        let tmp = tempfile::tempdir().unwrap();
        let mut sm = open(tmp.path()).await;

        let resps = sm
            .apply(vec![
                cmd(1, Command::set("a", "1")),
                cmd(2, Command::set("b", "2")),
                cmd(3, Command::del("a")),
            ])
            .await
            .unwrap();

        assert_eq!(resps, vec![ClientResponse::Ok; 3]);
        assert!(sm.fsm().get("a").await.is_err());
        assert_eq!(sm.fsm().get("b").await.unwrap(), b"2".to_vec());
        assert_eq!(sm.last_applied().await, Some(log_id(3)));
    }

    #[tokio::test]
    async fn undecodable_entry_is_rejected_but_still_applied() {
        let tmp = tempfile::tempdir().unwrap();
        let mut sm = open(tmp.path()).await;

        let resps = sm
            .apply(vec![
                cmd(1, Command::set("a", "1")),
                normal(2, br#"{"op":"NOPE","key":"a"}"#.to_vec()),
            ])
            .await
            .unwrap();

        assert_eq!(resps[0], ClientResponse::Ok);
        assert!(matches!(
            &resps[1],
            ClientResponse::Rejected { code, .. } if code == REJECTED_INVALID_COMMAND
        ));
        assert_eq!(sm.fsm().get("a").await.unwrap(), b"1".to_vec());
        assert_eq!(sm.last_applied().await, Some(log_id(2)));
    }

    #[tokio::test]
    async fn membership_entries_update_applied_membership() {
        let tmp = tempfile::tempdir().unwrap();
        let mut sm = open(tmp.path()).await;

        let nodes = BTreeMap::from([(1, NodeMeta {
            raft_addr: "127.0.0.1:7001".to_string(),
            api_addr: String::new(),
        })]);
        let membership = Membership::new(vec![BTreeSet::from([1])], nodes);
        sm.apply(vec![openraft::impls::Entry {
            log_id: log_id(1),
            payload: EntryPayload::Membership(membership.clone()),
        }])
        .await
        .unwrap();

        let (last, stored) = sm.applied_state().await.unwrap();
        assert_eq!(last, Some(log_id(1)));
        assert_eq!(stored.log_id(), &Some(log_id(1)));
        assert_eq!(stored.membership(), &membership);
    }

    #[tokio::test]
    async fn snapshot_then_install_reverts_later_writes() {
        let tmp = tempfile::tempdir().unwrap();
        let mut sm = open(tmp.path()).await;
        sm.apply(vec![
            cmd(1, Command::set("a", "1")),
            cmd(2, Command::set("b", "2")),
            cmd(3, Command::del("a")),
        ])
        .await
        .unwrap();

        let mut builder = sm.get_snapshot_builder().await;
        let snap = builder.build_snapshot().await.unwrap();
        assert_eq!(snap.meta.last_log_id, Some(log_id(3)));

        sm.apply(vec![cmd(4, Command::set("b", "3"))]).await.unwrap();
        assert_eq!(sm.fsm().get("b").await.unwrap(), b"3".to_vec());

        let bytes = (*snap.snapshot).into_inner();
        sm.install_snapshot(&snap.meta, Box::new(Cursor::new(bytes)))
            .await
            .unwrap();

        assert_eq!(sm.fsm().get("b").await.unwrap(), b"2".to_vec());
        assert!(sm.fsm().get("a").await.is_err());
        assert_eq!(sm.last_applied().await, Some(log_id(3)));
    }

    #[tokio::test]
    async fn reopen_restores_newest_snapshot() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let mut sm = open(tmp.path()).await;
            sm.apply(vec![cmd(1, Command::set("k", "v1"))]).await.unwrap();
            sm.get_snapshot_builder().await.build_snapshot().await.unwrap();
            sm.apply(vec![cmd(2, Command::set("k", "v2"))]).await.unwrap();
            sm.get_snapshot_builder().await.build_snapshot().await.unwrap();
            sm.apply(vec![cmd(3, Command::set("k", "v3"))]).await.unwrap();
        }

        let mut sm = open(tmp.path()).await;
        assert_eq!(sm.fsm().get("k").await.unwrap(), b"v2".to_vec());
        assert_eq!(sm.last_applied().await, Some(log_id(2)));

        let current = sm.get_current_snapshot().await.unwrap().unwrap();
        assert_eq!(current.meta.last_log_id, Some(log_id(2)));
    }

    #[tokio::test]
    async fn installed_snapshot_id_never_names_a_path() {
        let tmp = tempfile::tempdir().unwrap();
        let store_dir = tmp.path().join("node").join("snapshots");
        let victim = tmp.path().join("victim");
        std::fs::create_dir_all(&victim).unwrap();
        std::fs::write(victim.join("precious"), b"keep").unwrap();
        let mut sm = open(&store_dir).await;

        sm.apply(vec![cmd(1, Command::set("a", "1"))]).await.unwrap();
        let snap = sm.get_snapshot_builder().await.build_snapshot().await.unwrap();
        let bytes = (*snap.snapshot).into_inner();

        for id in [victim.to_string_lossy().into_owned(), "../../victim".to_string()] {
            let meta = SnapshotMeta {
                snapshot_id: id,
                ..snap.meta.clone()
            };
            sm.install_snapshot(&meta, Box::new(Cursor::new(bytes.clone())))
                .await
                .unwrap();
        }

        assert_eq!(std::fs::read(victim.join("precious")).unwrap(), b"keep".to_vec());
        assert_eq!(std::fs::read_dir(&victim).unwrap().count(), 1);
        assert_eq!(sm.fsm().get("a").await.unwrap(), b"1".to_vec());
        let current = sm.get_current_snapshot().await.unwrap().unwrap();
        assert_eq!(current.meta.snapshot_id, "../../victim");
    }

    #[tokio::test]
    async fn corrupt_snapshot_install_keeps_state() {
        let tmp = tempfile::tempdir().unwrap();
        let mut sm = open(tmp.path()).await;
        sm.apply(vec![cmd(1, Command::set("a", "1"))]).await.unwrap();

        let meta = SnapshotMeta {
            last_log_id: Some(log_id(9)),
            last_membership: Default::default(),
            snapshot_id: "bad".to_string(),
        };
        let res = sm
            .install_snapshot(&meta, Box::new(Cursor::new(b"{\"schema_ver".to_vec())))
            .await;

        assert!(res.is_err());
        assert_eq!(sm.fsm().get("a").await.unwrap(), b"1".to_vec());
        assert_eq!(sm.last_applied().await, Some(log_id(1)));
        assert!(sm.get_current_snapshot().await.unwrap().is_none());
    }
}
