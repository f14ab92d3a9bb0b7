//! Server side of the replication RPC plane.
//!
//! Peers exchange openraft messages as JSON over three POST routes. The
//! response body is the full `Result`, so protocol-level rejections (term
//! conflicts, higher vote seen) travel as data, not as HTTP error codes;
//! transport failures are the only thing surfaced through HTTP itself.

use axum::{extract::State, routing::post, Json, Router};
use openraft::error::{InstallSnapshotError, RaftError};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use tracing::debug;

use crate::raft::types::{NodeId, TypeConfig};

pub const APPEND_PATH: &str = "/replication/append";
pub const VOTE_PATH: &str = "/replication/vote";
pub const SNAPSHOT_PATH: &str = "/replication/snapshot";

#[derive(Clone)]
pub struct RaftRpcState {
    pub raft: openraft::Raft<TypeConfig>,
}

pub fn build_raft_rpc_router(state: RaftRpcState) -> Router {
    Router::new()
        .route(APPEND_PATH, post(handle_append))
        .route(VOTE_PATH, post(handle_vote))
        .route(SNAPSHOT_PATH, post(handle_snapshot))
        .with_state(state)
}

async fn handle_append(
    State(state): State<RaftRpcState>,
    Json(req): Json<AppendEntriesRequest<TypeConfig>>,
) -> Json<Result<AppendEntriesResponse<NodeId>, RaftError<NodeId>>> {
    debug!(entries = req.entries.len(), "append-entries rpc");
    Json(state.raft.append_entries(req).await)
}

async fn handle_vote(
    State(state): State<RaftRpcState>,
    Json(req): Json<VoteRequest<NodeId>>,
) -> Json<Result<VoteResponse<NodeId>, RaftError<NodeId>>> {
    Json(state.raft.vote(req).await)
}

async fn handle_snapshot(
    State(state): State<RaftRpcState>,
    Json(req): Json<InstallSnapshotRequest<TypeConfig>>,
) -> Json<Result<InstallSnapshotResponse<NodeId>, RaftError<NodeId, InstallSnapshotError>>> {
    debug!(
        offset = req.offset,
        done = req.done,
        "install-snapshot rpc chunk"
    );
    Json(state.raft.install_snapshot(req).await)
}
