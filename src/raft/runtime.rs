use std::sync::Arc;

use anyhow::Context;
use tokio::sync::RwLock;

use crate::{
    events::EventHandle,
    raft::{
        app::RealRaft,
        network_http::HttpNetworkFactory,
        storage::{FileLogStore, SqlStateMachine},
        types::{NodeId, TypeConfig},
    },
    state_machine::ReplicatedStateMachine,
    store::SqlStore,
};

/// Open the store, wire the state machine and log storage, and start the
/// Raft instance for this node. Initialization (single node vs join) is the
/// caller's decision.
pub async fn start_raft(
    data_dir: &std::path::Path,
    cluster_name: String,
    node_id: NodeId,
    events: EventHandle,
    network: HttpNetworkFactory,
) -> anyhow::Result<RealRaft> {
    let config = {
        #[cfg(test)]
        {
            openraft::Config {
                cluster_name,
                ..Default::default()
            }
        }

        #[cfg(not(test))]
        {
            // Tuned for WAN-ish latencies; OpenRaft uses `heartbeat_interval`
            // as the hard TTL for replication RPCs, so sub-100ms values are
            // too aggressive outside local networks.
            openraft::Config {
                cluster_name,
                heartbeat_interval: 2_000,
                election_timeout_min: 6_000,
                election_timeout_max: 12_000,
                install_snapshot_timeout: 30_000,
                ..Default::default()
            }
        }
    }
    .validate()
    .map_err(|e| anyhow::anyhow!("raft config validate: {e}"))?;

    let config = Arc::new(config);

    let store = Arc::new(SqlStore::open(data_dir).context("open sql store")?);
    let machine = Arc::new(ReplicatedStateMachine::new(
        store,
        Arc::new(RwLock::new(())),
        events,
    ));

    let log_store = FileLogStore::open(data_dir)
        .await
        .map_err(|e| anyhow::anyhow!("open log store: {e}"))?;
    let state_machine = SqlStateMachine::open(data_dir, machine.clone())
        .await
        .map_err(|e| anyhow::anyhow!("open state machine: {e}"))?;

    let raft =
        openraft::Raft::<TypeConfig>::new(node_id, config, network, log_store, state_machine)
            .await
            .context("start raft")?;

    Ok(RealRaft::new(raft, machine))
}
