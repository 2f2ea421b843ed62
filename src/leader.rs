//! Background task that logs leadership changes of the local Raft node.

use tokio::{sync::watch, task::JoinHandle};
use tracing::{info, warn};

use crate::raft::types::{Metrics, NodeId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaderTransition {
    pub from: Option<NodeId>,
    pub to: Option<NodeId>,
    pub term: u64,
}

/// Compare the last seen leader with the latest metrics.
pub fn leader_transition(prev: Option<NodeId>, metrics: &Metrics) -> Option<LeaderTransition> {
    if metrics.current_leader == prev {
        return None;
    }
    Some(LeaderTransition {
        from: prev,
        to: metrics.current_leader,
        term: metrics.current_term,
    })
}

/// Watch `metrics` until `shutdown` becomes `true` (or either sender goes away).
///
/// Resolves to the number of leader transitions observed.
pub fn spawn_leader_monitor(
    node_id: NodeId,
    mut metrics: watch::Receiver<Metrics>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<u64> {
    tokio::spawn(async move {
        let mut leader = metrics.borrow_and_update().current_leader;
        info!(node_id, leader = ?leader, "leader monitor started");
        let mut transitions = 0u64;

        loop {
            tokio::select! {
                changed = metrics.changed() => {
                    if changed.is_err() {
                        warn!(node_id, "raft metrics closed; leader monitor exiting");
                        break;
                    }
                    let Some(t) = leader_transition(leader, &metrics.borrow_and_update()) else {
                        continue;
                    };
                    transitions += 1;
                    leader = t.to;
                    match t.to {
                        Some(id) if id == node_id => {
                            info!(node_id, term = t.term, previous = ?t.from, "this node is now the leader");
                        }
                        Some(id) => info!(node_id, leader = id, term = t.term, previous = ?t.from, "leader changed"),
                        None => info!(node_id, term = t.term, previous = ?t.from, "leader lost"),
                    }
                }
                _ = shutdown.wait_for(|stop| *stop) => {
                    break;
                }
            }
        }

        info!(node_id, transitions, "leader monitor stopped");
        transitions
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::*;

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(30)).await;
    }

    #[test]
    fn term_change_without_new_leader_is_not_a_transition() {
        let mut m = Metrics::new_initial(1);
        m.current_leader = Some(2);
        m.current_term = 4;
        assert_eq!(leader_transition(Some(2), &m), None);
        assert_eq!(
            leader_transition(None, &m),
            Some(LeaderTransition {
                from: None,
                to: Some(2),
                term: 4,
            })
        );
    }

    #[tokio::test]
    async fn counts_transitions_until_shutdown() {
        let (metrics_tx, metrics_rx) = watch::channel(Metrics::new_initial(1));
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = spawn_leader_monitor(1, metrics_rx, stop_rx);
        settle().await;

        metrics_tx.send_modify(|m| {
            m.current_term = 1;
            m.current_leader = Some(2);
        });
        settle().await;
        metrics_tx.send_modify(|m| m.current_term = 2);
        settle().await;
        metrics_tx.send_modify(|m| {
            m.current_term = 3;
            m.current_leader = Some(1);
        });
        settle().await;

        stop_tx.send(true).unwrap();
        assert_eq!(handle.await.unwrap(), 2);
    }

    #[tokio::test]
    async fn stops_when_metrics_sender_is_dropped() {
        let (metrics_tx, metrics_rx) = watch::channel(Metrics::new_initial(1));
        let (_stop_tx, stop_rx) = watch::channel(false);
        let handle = spawn_leader_monitor(1, metrics_rx, stop_rx);

        drop(metrics_tx);
        let transitions = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(transitions, 0);
    }
}
