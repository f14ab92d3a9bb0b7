use std::io::Cursor;

use serde::{Deserialize, Serialize};

use crate::request::{Outcome, WriteEntry};

/// Raft node identifier type for this project.
pub type NodeId = u64;

/// Raft node metadata stored in membership config and exposed to networking.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeMeta {
    /// A human-friendly node name (optional).
    pub name: String,

    /// The Raft RPC endpoint base URL (append/vote/snapshot).
    pub raft_endpoint: String,
}

/// OpenRaft type configuration for this project.
///
/// Storage v2 separates `RaftLogStorage` and `RaftStateMachine`, which matches
/// the "file-backed log + SQL state machine + archive snapshot" split here.
/// The application data is the sealed [`WriteEntry`]: its payload is codec
/// bytes every replica decodes during apply, and the response is the
/// [`Outcome`] echoed from apply.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct TypeConfig;

impl openraft::RaftTypeConfig for TypeConfig {
    type D = WriteEntry;
    type R = Outcome;

    type NodeId = NodeId;
    type Node = NodeMeta;

    type Entry = openraft::impls::Entry<TypeConfig>;
    type Responder = openraft::impls::OneshotResponder<TypeConfig>;
    type AsyncRuntime = openraft::impls::TokioRuntime;

    // Requires tokio `io-util` feature for AsyncRead/Write/Seek impls on Cursor.
    type SnapshotData = Cursor<Vec<u8>>;
}
