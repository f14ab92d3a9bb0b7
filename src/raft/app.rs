//! The consensus-protocol facade the persistence helpers call into.
//!
//! [`ConsensusProtocol`] is the seam between callers and the replication
//! plane: writes go through the replicated log, reads either hit the local
//! store directly (possibly stale) or pass a linearizable read barrier first.
//! [`RealRaft`] backs it with OpenRaft; [`LocalConsensus`] applies directly to
//! the local machine for tests and single-process embedding.

use std::{collections::BTreeMap, future::Future, pin::Pin, sync::Arc, time::Duration};

use tokio::sync::watch;
use tracing::debug;

use crate::{
    codec,
    raft::types::{NodeId, NodeMeta, TypeConfig},
    request::{Outcome, ReadDescriptor, WriteBatch, WriteRequest, EXT_SYNC},
    state_machine::ReplicatedStateMachine,
};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub trait ConsensusProtocol: Send + Sync + 'static {
    fn metrics(&self) -> watch::Receiver<openraft::RaftMetrics<NodeId, NodeMeta>>;

    /// Replicate one write entry and return the outcome echoed from apply on
    /// this node.
    fn write(&self, req: WriteRequest) -> BoxFuture<'_, anyhow::Result<Outcome>>;

    /// Possibly-stale read against the local store.
    fn read(&self, descriptor: ReadDescriptor) -> BoxFuture<'_, anyhow::Result<Outcome>>;

    /// Linearizable read: waits until this node has applied everything
    /// committed before the read was issued, then reads locally.
    fn blocking_read(&self, descriptor: ReadDescriptor) -> BoxFuture<'_, anyhow::Result<Outcome>>;

    fn add_learner(&self, node_id: NodeId, node: NodeMeta) -> BoxFuture<'_, anyhow::Result<()>>;

    fn change_membership(
        &self,
        members: std::collections::BTreeSet<NodeId>,
    ) -> BoxFuture<'_, anyhow::Result<()>>;
}

/// A synchronous write exceeded the configured replication timeout.
///
/// Distinct from an application-level SQL failure: the write may still have
/// committed, so retries must lean on the request `key` for de-duplication.
#[derive(Debug)]
pub struct WriteTimedOut {
    pub key: String,
    pub timeout: Duration,
}

impl std::fmt::Display for WriteTimedOut {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "write {} timed out after {:?} (may still commit; retry with the same key)",
            self.key, self.timeout
        )
    }
}

impl std::error::Error for WriteTimedOut {}

#[derive(Clone)]
pub struct RealRaft {
    raft: openraft::Raft<TypeConfig>,
    machine: Arc<ReplicatedStateMachine>,
    metrics: watch::Receiver<openraft::RaftMetrics<NodeId, NodeMeta>>,
}

impl RealRaft {
    pub fn new(raft: openraft::Raft<TypeConfig>, machine: Arc<ReplicatedStateMachine>) -> Self {
        let metrics = raft.metrics();
        Self {
            raft,
            machine,
            metrics,
        }
    }

    pub fn raft(&self) -> openraft::Raft<TypeConfig> {
        self.raft.clone()
    }

    pub async fn initialize_single_node_if_needed(
        &self,
        node_id: NodeId,
        node_meta: NodeMeta,
    ) -> anyhow::Result<()> {
        let initialized = self
            .raft
            .is_initialized()
            .await
            .map_err(|e| anyhow::anyhow!("raft is_initialized: {e}"))?;
        if initialized {
            return Ok(());
        }
        let mut nodes = BTreeMap::new();
        nodes.insert(node_id, node_meta);
        self.raft
            .initialize(nodes)
            .await
            .map_err(|e| anyhow::anyhow!("raft initialize: {e}"))?;
        Ok(())
    }
}

impl ConsensusProtocol for RealRaft {
    fn metrics(&self) -> watch::Receiver<openraft::RaftMetrics<NodeId, NodeMeta>> {
        self.metrics.clone()
    }

    fn write(&self, req: WriteRequest) -> BoxFuture<'_, anyhow::Result<Outcome>> {
        Box::pin(async move {
            let entry = codec::encode_entry(&req)
                .map_err(|e| anyhow::anyhow!("seal write entry: {e}"))?;
            let resp = self
                .raft
                .client_write(entry)
                .await
                .map_err(|e| anyhow::anyhow!("raft client_write: {e}"))?;
            Ok(resp.data)
        })
    }

    fn read(&self, descriptor: ReadDescriptor) -> BoxFuture<'_, anyhow::Result<Outcome>> {
        Box::pin(async move { Ok(self.machine.on_request(&descriptor).await) })
    }

    fn blocking_read(&self, descriptor: ReadDescriptor) -> BoxFuture<'_, anyhow::Result<Outcome>> {
        Box::pin(async move {
            self.raft
                .ensure_linearizable()
                .await
                .map_err(|e| anyhow::anyhow!("raft linearizable read barrier: {e}"))?;
            Ok(self.machine.on_request(&descriptor).await)
        })
    }

    fn add_learner(&self, node_id: NodeId, node: NodeMeta) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move {
            self.raft
                .add_learner(node_id, node, false)
                .await
                .map_err(|e| anyhow::anyhow!("raft add_learner: {e}"))?;
            Ok(())
        })
    }

    fn change_membership(
        &self,
        members: std::collections::BTreeSet<NodeId>,
    ) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move {
            self.raft
                .change_membership(members, true)
                .await
                .map_err(|e| anyhow::anyhow!("raft change_membership: {e}"))?;
            Ok(())
        })
    }
}

/// Single-node protocol that applies straight to the local machine.
///
/// Writes still go through `on_apply` so sequencing, atomicity and the
/// extension semantics are identical to the replicated path; "linearizable"
/// is trivially satisfied with one replica.
#[derive(Clone)]
pub struct LocalConsensus {
    machine: Arc<ReplicatedStateMachine>,
    metrics: watch::Receiver<openraft::RaftMetrics<NodeId, NodeMeta>>,
}

impl LocalConsensus {
    pub fn new(machine: Arc<ReplicatedStateMachine>) -> Self {
        let (_tx, metrics) = watch::channel(openraft::RaftMetrics::new_initial(0));
        Self { machine, metrics }
    }
}

impl ConsensusProtocol for LocalConsensus {
    fn metrics(&self) -> watch::Receiver<openraft::RaftMetrics<NodeId, NodeMeta>> {
        self.metrics.clone()
    }

    fn write(&self, req: WriteRequest) -> BoxFuture<'_, anyhow::Result<Outcome>> {
        Box::pin(async move {
            let entry = codec::encode_entry(&req)
                .map_err(|e| anyhow::anyhow!("seal write entry: {e}"))?;
            self.machine
                .on_apply(&entry)
                .await
                .map_err(|e| anyhow::anyhow!("apply write locally: {e}"))
        })
    }

    fn read(&self, descriptor: ReadDescriptor) -> BoxFuture<'_, anyhow::Result<Outcome>> {
        Box::pin(async move { Ok(self.machine.on_request(&descriptor).await) })
    }

    fn blocking_read(&self, descriptor: ReadDescriptor) -> BoxFuture<'_, anyhow::Result<Outcome>> {
        self.read(descriptor)
    }

    fn add_learner(&self, _node_id: NodeId, _node: NodeMeta) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move { Ok(()) })
    }

    fn change_membership(
        &self,
        _members: std::collections::BTreeSet<NodeId>,
    ) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move { Ok(()) })
    }
}

/// The surface upstream persistence helpers program against: build a batch,
/// submit it, query with the consistency the call site needs.
#[derive(Clone)]
pub struct SqlService {
    consensus: Arc<dyn ConsensusProtocol>,
    node_id: NodeId,
    write_timeout: Duration,
}

impl SqlService {
    pub fn new(
        consensus: Arc<dyn ConsensusProtocol>,
        node_id: NodeId,
        write_timeout: Duration,
    ) -> Self {
        Self {
            consensus,
            node_id,
            write_timeout,
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Replicate a write batch and block until it is committed and applied on
    /// this node. Timeouts surface as [`WriteTimedOut`], distinct from SQL
    /// failures, so callers can retry idempotently by key.
    pub async fn submit(&self, batch: WriteBatch) -> anyhow::Result<Outcome> {
        let req = batch.build(self.node_id);
        let key = req.key.clone();
        if req.extensions.contains_key(EXT_SYNC) {
            // A successful write is applied on this node before the ack, so
            // the sync flag is already satisfied by the normal path.
            debug!(%key, "read-your-writes flag set");
        }
        debug!(%key, "submitting write batch");

        match tokio::time::timeout(self.write_timeout, self.consensus.write(req)).await {
            Ok(result) => result,
            Err(_elapsed) => Err(WriteTimedOut {
                key,
                timeout: self.write_timeout,
            }
            .into()),
        }
    }

    /// Fire-and-collect form of [`submit`](Self::submit): the returned handle
    /// resolves from the protocol's completion callback; callers must not
    /// assume which task resolves it.
    pub fn submit_async(
        &self,
        batch: WriteBatch,
    ) -> tokio::task::JoinHandle<anyhow::Result<Outcome>> {
        let this = self.clone();
        tokio::spawn(async move { this.submit(batch).await })
    }

    /// Read with caller-chosen consistency: `blocking` waits for the
    /// linearizable read barrier, otherwise the local store answers and may
    /// be stale.
    pub async fn query(
        &self,
        descriptor: ReadDescriptor,
        blocking: bool,
    ) -> anyhow::Result<Outcome> {
        if blocking {
            self.consensus.blocking_read(descriptor).await
        } else {
            self.consensus.read(descriptor).await
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tokio::sync::RwLock;

    use super::*;
    use crate::{
        codec,
        events::EventHandle,
        request::{QueryKind, SqlArg},
        store::SqlStore,
    };

    fn local_service(dir: &std::path::Path) -> SqlService {
        let store = Arc::new(SqlStore::open(dir).unwrap());
        let machine = Arc::new(ReplicatedStateMachine::new(
            store,
            Arc::new(RwLock::new(())),
            EventHandle::noop(),
        ));
        SqlService::new(
            Arc::new(LocalConsensus::new(machine)),
            1,
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn submit_then_blocking_query_sees_the_write() {
        let tmp = tempfile::tempdir().unwrap();
        let service = local_service(tmp.path());

        let outcome = service
            .submit(WriteBatch::new("config").push(
                "CREATE TABLE tenant (kp TEXT, tenant_id TEXT PRIMARY KEY, name TEXT)",
                vec![],
            ))
            .await
            .unwrap();
        assert!(outcome.success);

        let outcome = service
            .submit(WriteBatch::new("config").push(
                "INSERT INTO tenant (kp, tenant_id, name) VALUES (?, ?, ?)",
                vec![
                    SqlArg::from("kp1"),
                    SqlArg::from("t1"),
                    SqlArg::from("Team A"),
                ],
            ))
            .await
            .unwrap();
        assert!(outcome.success);

        let read = service
            .query(
                ReadDescriptor {
                    group: "config".into(),
                    kind: QueryKind::OneScalarWithArgs,
                    sql: "SELECT name FROM tenant WHERE tenant_id = ?".into(),
                    args: vec![SqlArg::from("t1")],
                    result_type: "text".into(),
                },
                true,
            )
            .await
            .unwrap();
        assert!(read.success);
        assert_eq!(
            codec::decode_result(&read.data.unwrap()).unwrap(),
            json!("Team A")
        );
    }

    #[tokio::test]
    async fn partially_bad_batch_applies_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let service = local_service(tmp.path());

        service
            .submit(WriteBatch::new("config").push(
                "CREATE TABLE tenant (kp TEXT, tenant_id TEXT PRIMARY KEY, name TEXT)",
                vec![],
            ))
            .await
            .unwrap();

        let outcome = service
            .submit(
                WriteBatch::new("config")
                    .push(
                        "INSERT INTO tenant (kp, tenant_id, name) VALUES ('kp1', 't1', 'Team A')",
                        vec![],
                    )
                    .push("INSERT INTO tenant VALUES SYNTAX ERROR", vec![]),
            )
            .await
            .unwrap();
        assert!(!outcome.success);

        let read = service
            .query(
                ReadDescriptor {
                    group: "config".into(),
                    kind: QueryKind::OneScalar,
                    sql: "SELECT COUNT(*) FROM tenant".into(),
                    args: vec![],
                    result_type: "integer".into(),
                },
                false,
            )
            .await
            .unwrap();
        assert_eq!(codec::decode_result(&read.data.unwrap()).unwrap(), json!(0));
    }

    #[tokio::test]
    async fn submit_async_resolves_with_the_apply_outcome() {
        let tmp = tempfile::tempdir().unwrap();
        let service = local_service(tmp.path());

        let handle = service.submit_async(
            WriteBatch::new("config").push("CREATE TABLE t (id INTEGER PRIMARY KEY)", vec![]),
        );
        let outcome = handle.await.unwrap().unwrap();
        assert!(outcome.success);
    }

    #[test]
    fn write_timeout_is_a_distinct_downcastable_error() {
        let err = anyhow::Error::from(WriteTimedOut {
            key: "k".into(),
            timeout: Duration::from_millis(10),
        });
        assert!(err.downcast_ref::<WriteTimedOut>().is_some());
        assert!(err.to_string().contains("timed out"));
    }

    /// A protocol whose write path never completes within any test timeout.
    struct StalledConsensus {
        metrics: watch::Receiver<openraft::RaftMetrics<NodeId, NodeMeta>>,
    }

    impl StalledConsensus {
        fn new() -> Self {
            let (_tx, metrics) = watch::channel(openraft::RaftMetrics::new_initial(0));
            Self { metrics }
        }
    }

    impl ConsensusProtocol for StalledConsensus {
        fn metrics(&self) -> watch::Receiver<openraft::RaftMetrics<NodeId, NodeMeta>> {
            self.metrics.clone()
        }

        fn write(&self, _req: WriteRequest) -> BoxFuture<'_, anyhow::Result<Outcome>> {
            Box::pin(async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(Outcome::ok(None))
            })
        }

        fn read(&self, _descriptor: ReadDescriptor) -> BoxFuture<'_, anyhow::Result<Outcome>> {
            Box::pin(async { Ok(Outcome::fail("unused")) })
        }

        fn blocking_read(
            &self,
            _descriptor: ReadDescriptor,
        ) -> BoxFuture<'_, anyhow::Result<Outcome>> {
            Box::pin(async { Ok(Outcome::fail("unused")) })
        }

        fn add_learner(
            &self,
            _node_id: NodeId,
            _node: NodeMeta,
        ) -> BoxFuture<'_, anyhow::Result<()>> {
            Box::pin(async { Ok(()) })
        }

        fn change_membership(
            &self,
            _members: std::collections::BTreeSet<NodeId>,
        ) -> BoxFuture<'_, anyhow::Result<()>> {
            Box::pin(async { Ok(()) })
        }
    }

    #[tokio::test]
    async fn stalled_write_surfaces_write_timed_out_with_the_request_key() {
        let service = SqlService::new(
            Arc::new(StalledConsensus::new()),
            7,
            Duration::from_millis(50),
        );

        let err = service
            .submit(WriteBatch::new("config").push("SELECT 1", vec![]))
            .await
            .unwrap_err();

        let timed_out = err
            .downcast_ref::<WriteTimedOut>()
            .expect("timeout must stay distinguishable from SQL failures");
        assert_eq!(timed_out.timeout, Duration::from_millis(50));
        assert!(timed_out.key.contains("-config-7-"));
    }

    #[tokio::test]
    async fn sync_flagged_batch_is_acknowledged_after_local_apply() {
        let tmp = tempfile::tempdir().unwrap();
        let service = local_service(tmp.path());

        let outcome = service
            .submit(
                WriteBatch::new("config")
                    .push("CREATE TABLE t (id INTEGER PRIMARY KEY)", vec![])
                    .sync(),
            )
            .await
            .unwrap();
        assert!(outcome.success);

        let read = service
            .query(
                ReadDescriptor {
                    group: "config".into(),
                    kind: QueryKind::OneScalar,
                    sql: "SELECT COUNT(*) FROM t".into(),
                    args: vec![],
                    result_type: "integer".into(),
                },
                false,
            )
            .await
            .unwrap();
        assert_eq!(codec::decode_result(&read.data.unwrap()).unwrap(), json!(0));
    }
}
