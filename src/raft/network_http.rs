//! Client side of the replication RPC plane.
//!
//! One reqwest client is shared across all peer connections; per-peer state is
//! just the endpoint base URL from the membership metadata. Any transport
//! failure maps to `Unreachable` so openraft backs off and retries instead of
//! treating the peer as having answered.

use openraft::{
    error::{RPCError, RaftError, Unreachable},
    network::RPCOption,
    raft::{
        AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest,
        InstallSnapshotResponse, VoteRequest, VoteResponse,
    },
    RaftNetwork, RaftNetworkFactory,
};

use crate::raft::http_rpc::{APPEND_PATH, SNAPSHOT_PATH, VOTE_PATH};
use crate::raft::types::{NodeId, NodeMeta, TypeConfig};

#[derive(Clone, Default)]
pub struct HttpNetworkFactory {
    client: reqwest::Client,
}

impl HttpNetworkFactory {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl RaftNetworkFactory<TypeConfig> for HttpNetworkFactory {
    type Network = HttpNetwork;

    async fn new_client(&mut self, _target: NodeId, node: &NodeMeta) -> Self::Network {
        HttpNetwork {
            endpoint: node.raft_endpoint.trim_end_matches('/').to_string(),
            client: self.client.clone(),
        }
    }
}

#[derive(Clone)]
pub struct HttpNetwork {
    endpoint: String,
    client: reqwest::Client,
}

impl HttpNetwork {
    /// POST one protocol message and decode the peer's `Result` envelope.
    /// The timeout comes from openraft's own RPC budget for this call.
    async fn exchange<Req, Resp>(
        &self,
        path: &str,
        rpc: &Req,
        option: RPCOption,
    ) -> Result<Resp, Unreachable>
    where
        Req: serde::Serialize,
        Resp: serde::de::DeserializeOwned,
    {
        let url = format!("{}{path}", self.endpoint);
        self.client
            .post(url)
            .timeout(option.hard_ttl())
            .json(rpc)
            .send()
            .await
            .map_err(|e| Unreachable::new(&e))?
            .json::<Resp>()
            .await
            .map_err(|e| Unreachable::new(&e))
    }
}

impl RaftNetwork<TypeConfig> for HttpNetwork {
    async fn append_entries(
        &mut self,
        rpc: AppendEntriesRequest<TypeConfig>,
        option: RPCOption,
    ) -> Result<AppendEntriesResponse<NodeId>, RPCError<NodeId, NodeMeta, RaftError<NodeId>>> {
        self.exchange::<_, Result<_, _>>(APPEND_PATH, &rpc, option)
            .await
            .map_err(RPCError::Unreachable)?
    }

    async fn vote(
        &mut self,
        rpc: VoteRequest<NodeId>,
        option: RPCOption,
    ) -> Result<VoteResponse<NodeId>, RPCError<NodeId, NodeMeta, RaftError<NodeId>>> {
        self.exchange::<_, Result<_, _>>(VOTE_PATH, &rpc, option)
            .await
            .map_err(RPCError::Unreachable)?
    }

    async fn install_snapshot(
        &mut self,
        rpc: InstallSnapshotRequest<TypeConfig>,
        option: RPCOption,
    ) -> Result<
        InstallSnapshotResponse<NodeId>,
        RPCError<NodeId, NodeMeta, RaftError<NodeId, openraft::error::InstallSnapshotError>>,
    > {
        self.exchange::<_, Result<_, _>>(SNAPSHOT_PATH, &rpc, option)
            .await
            .map_err(RPCError::Unreachable)?
    }
}
