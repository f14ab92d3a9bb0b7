//! Wire codec for read/write descriptors and results.
//!
//! Payloads travel through the consensus transport as opaque bytes; the codec
//! must be lossless because decoded mutations are replayed verbatim against
//! the local store on every replica. The `SqlArg` serde tagging keeps `NULL`
//! vs empty string and integer vs real apart, which is what makes replicas
//! converge byte-for-byte.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::request::{Mutation, Outcome, ReadDescriptor, WriteEntry, WriteRequest};

#[derive(Debug)]
pub enum CodecError {
    Encode(serde_json::Error),
    Decode(serde_json::Error),
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Encode(e) => write!(f, "encode payload: {e}"),
            Self::Decode(e) => write!(f, "decode payload: {e}"),
        }
    }
}

impl std::error::Error for CodecError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Encode(e) | Self::Decode(e) => Some(e),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct WritePayload {
    mutations: Vec<Mutation>,
    #[serde(default)]
    extensions: BTreeMap<String, String>,
}

pub fn encode_write(
    mutations: &[Mutation],
    extensions: &BTreeMap<String, String>,
) -> Result<Vec<u8>, CodecError> {
    let payload = WritePayload {
        mutations: mutations.to_vec(),
        extensions: extensions.clone(),
    };
    serde_json::to_vec(&payload).map_err(CodecError::Encode)
}

pub fn decode_write(
    bytes: &[u8],
) -> Result<(Vec<Mutation>, BTreeMap<String, String>), CodecError> {
    let payload: WritePayload = serde_json::from_slice(bytes).map_err(CodecError::Decode)?;
    Ok((payload.mutations, payload.extensions))
}

/// Seal an assembled write into the log-record form the consensus layer
/// replicates. The mutation list and extension bag ride as payload bytes;
/// only the key and group stay visible without decoding.
pub fn encode_entry(req: &WriteRequest) -> Result<WriteEntry, CodecError> {
    Ok(WriteEntry {
        key: req.key.clone(),
        group: req.group.clone(),
        payload: encode_write(&req.mutations, &req.extensions)?,
    })
}

pub fn encode_read(descriptor: &ReadDescriptor) -> Result<Vec<u8>, CodecError> {
    serde_json::to_vec(descriptor).map_err(CodecError::Encode)
}

pub fn decode_read(bytes: &[u8]) -> Result<ReadDescriptor, CodecError> {
    serde_json::from_slice(bytes).map_err(CodecError::Decode)
}

/// Encode a query result value for the `Outcome.data` channel.
pub fn encode_result(value: &serde_json::Value) -> Result<Vec<u8>, CodecError> {
    serde_json::to_vec(value).map_err(CodecError::Encode)
}

/// Decode an `Outcome.data` payload back into a result value.
pub fn decode_result(bytes: &[u8]) -> Result<serde_json::Value, CodecError> {
    serde_json::from_slice(bytes).map_err(CodecError::Decode)
}

/// Map a decode failure to a failed outcome. The consensus driver thread must
/// keep advancing past malformed payloads, so this is the only way a codec
/// error leaves the apply path.
pub fn decode_failure_outcome(err: &CodecError) -> Outcome {
    Outcome::fail(err.to_string())
}
