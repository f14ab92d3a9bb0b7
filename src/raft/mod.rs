//! Consensus-protocol glue: OpenRaft type config, the protocol facade the
//! persistence helpers call into, file-backed log storage, the SQL state
//! machine adapter, and the HTTP RPC transport.

pub mod app;
pub mod http_rpc;
pub mod network_http;
pub mod runtime;
pub mod storage;
pub mod types;

pub use app::{ConsensusProtocol, LocalConsensus, RealRaft, SqlService};
pub use types::{NodeId, NodeMeta, TypeConfig};
