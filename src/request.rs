use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

/// Extension key marking a write as a bulk import: mutations apply as an
/// unordered (but still atomic) batch, skipping the `sequence_no` sort.
pub const EXT_IMPORT: &str = "import";

/// Extension keys carrying a domain event to republish after apply. The state
/// machine never publishes it directly; it is echoed back to the caller as a
/// [`SideEffect`] so publication happens outside the store lock.
pub const EXT_EVENT_TOPIC: &str = "event-topic";
pub const EXT_EVENT_PAYLOAD: &str = "event-payload";

/// Extension key requesting read-your-writes: the submitter wants the ack
/// delayed until the write is applied on the node that accepted it. The write
/// path already provides this (a committed write is applied locally before the
/// response is built), so the flag is carried for callers and audits only.
pub const EXT_SYNC: &str = "sync";

/// A typed SQL argument.
///
/// Arguments are replayed verbatim against the local store on every replica,
/// so the encoding must be lossless: `Null` is distinct from `Text("")`, and
/// integer/real widths survive a round trip. The serde tag keeps JSON from
/// collapsing those cases.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "v", rename_all = "snake_case")]
pub enum SqlArg {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
    Bool(bool),
}

impl SqlArg {
    pub fn to_sql_value(&self) -> rusqlite::types::Value {
        match self {
            Self::Null => rusqlite::types::Value::Null,
            Self::Integer(v) => rusqlite::types::Value::Integer(*v),
            Self::Real(v) => rusqlite::types::Value::Real(*v),
            Self::Text(v) => rusqlite::types::Value::Text(v.clone()),
            Self::Blob(v) => rusqlite::types::Value::Blob(v.clone()),
            Self::Bool(v) => rusqlite::types::Value::Integer(i64::from(*v)),
        }
    }
}

impl From<&str> for SqlArg {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for SqlArg {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for SqlArg {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

/// One SQL mutation inside a replicated write.
///
/// `sequence_no` is the tie-break assigned by the batch assembler: a single
/// logical operation is often put together by unrelated call sites (main row,
/// history row, tag relations) that do not know their relative order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mutation {
    pub sql: String,
    #[serde(default)]
    pub args: Vec<SqlArg>,
    #[serde(default)]
    pub sequence_no: u32,
}

impl Mutation {
    pub fn new(sql: impl Into<String>, args: Vec<SqlArg>, sequence_no: u32) -> Self {
        Self {
            sql: sql.into(),
            args,
            sequence_no,
        }
    }
}

/// One assembled write: an atomic, ordered list of mutations plus a free-form
/// extension bag for side-channel signaling. This is the caller-facing form;
/// the codec seals it into a [`WriteEntry`] before it enters the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteRequest {
    /// Idempotency/audit key: `{unix_millis}-{group}-{node}-{payload digest}`.
    pub key: String,
    pub group: String,
    pub mutations: Vec<Mutation>,
    #[serde(default)]
    pub extensions: BTreeMap<String, String>,
}

impl WriteRequest {
    pub fn is_import(&self) -> bool {
        self.extensions.contains_key(EXT_IMPORT)
    }
}

/// One committed log record. `payload` is the codec encoding of the
/// mutations and extensions; every replica decodes it during apply, so a
/// malformed payload is discovered inside the state machine and becomes a
/// failed outcome there, never a crash of the consensus driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteEntry {
    pub key: String,
    pub group: String,
    pub payload: Vec<u8>,
}

/// Explicit write-batch builder.
///
/// All mutations for one replicated entry are assembled here and handed to
/// `submit` in one visible list; there is no hidden per-thread pending-SQL
/// context.
#[derive(Debug, Clone)]
pub struct WriteBatch {
    group: String,
    mutations: Vec<Mutation>,
    extensions: BTreeMap<String, String>,
    next_seq: u32,
}

impl WriteBatch {
    pub fn new(group: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            mutations: Vec::new(),
            extensions: BTreeMap::new(),
            next_seq: 0,
        }
    }

    /// Append a mutation with the next sequence number.
    pub fn push(mut self, sql: impl Into<String>, args: Vec<SqlArg>) -> Self {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.mutations.push(Mutation::new(sql, args, seq));
        self
    }

    /// Append a mutation with an explicit sequence number (assemblers that
    /// coordinate ordering across call sites pick their own).
    pub fn push_with_seq(mut self, sql: impl Into<String>, args: Vec<SqlArg>, seq: u32) -> Self {
        self.next_seq = self.next_seq.max(seq + 1);
        self.mutations.push(Mutation::new(sql, args, seq));
        self
    }

    pub fn extension(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extensions.insert(key.into(), value.into());
        self
    }

    /// Mark this batch as a bulk import (unordered, still atomic).
    pub fn import(self) -> Self {
        self.extension(EXT_IMPORT, "true")
    }

    /// Request read-your-writes acknowledgment (see [`EXT_SYNC`]).
    pub fn sync(self) -> Self {
        self.extension(EXT_SYNC, "true")
    }

    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty()
    }

    /// Seal the batch into a replicable request, stamping the idempotency key.
    pub fn build(self, node_id: u64) -> WriteRequest {
        let key = request_key(&self.group, node_id, &self.mutations);
        WriteRequest {
            key,
            group: self.group,
            mutations: self.mutations,
            extensions: self.extensions,
        }
    }
}

fn request_key(group: &str, node_id: u64, mutations: &[Mutation]) -> String {
    let mut hasher = Sha256::new();
    for m in mutations {
        hasher.update(m.sql.as_bytes());
        hasher.update(m.sequence_no.to_be_bytes());
        for arg in &m.args {
            // Key material only; lossy formatting is fine here.
            hasher.update(format!("{arg:?}").as_bytes());
        }
    }
    let digest = hex::encode(hasher.finalize());
    let millis = chrono::Utc::now().timestamp_millis();
    format!("{millis}-{group}-{node_id}-{}", &digest[..16])
}

/// The shape of a read: one row vs a row set, decoded through the result-type
/// registry or returned as generic rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryKind {
    /// Single scalar, no arguments.
    OneScalar,
    /// Single scalar with bound arguments.
    OneScalarWithArgs,
    /// Single row decoded via the result-type registry.
    OneMapped,
    /// Row set decoded via the result-type registry.
    ManyMapped,
    /// Column of scalars.
    ManyScalar,
    /// Row set as generic column-name -> value maps.
    ManyRows,
}

/// Immutable read request routed through the consensus layer or served
/// locally, depending on the caller's consistency choice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadDescriptor {
    pub group: String,
    pub kind: QueryKind,
    pub sql: String,
    #[serde(default)]
    pub args: Vec<SqlArg>,
    /// Registry tag naming the decode function for mapped kinds; scalar tag
    /// ("text", "integer", ...) for the scalar kinds.
    pub result_type: String,
}

/// A side effect the state machine asks the caller to perform after the lock
/// is released. Applying never publishes events itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SideEffect {
    PublishEvent { topic: String, payload: String },
}

/// Result of a read or write, echoed back through the consensus layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub success: bool,
    #[serde(default)]
    pub data: Option<Vec<u8>>,
    #[serde(default)]
    pub err_msg: Option<String>,
    #[serde(default)]
    pub side_effects: Vec<SideEffect>,
}

impl Outcome {
    pub fn ok(data: Option<Vec<u8>>) -> Self {
        Self {
            success: true,
            data,
            err_msg: None,
            side_effects: Vec::new(),
        }
    }

    pub fn fail(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            err_msg: Some(msg.into()),
            side_effects: Vec::new(),
        }
    }

    pub fn with_side_effects(mut self, side_effects: Vec<SideEffect>) -> Self {
        self.side_effects = side_effects;
        self
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn batch_assigns_ascending_sequence_numbers() {
        let req = WriteBatch::new("config")
            .push("INSERT INTO a VALUES (?)", vec![SqlArg::from("x")])
            .push("INSERT INTO b VALUES (?)", vec![SqlArg::from("y")])
            .build(1);

        assert_eq!(req.mutations[0].sequence_no, 0);
        assert_eq!(req.mutations[1].sequence_no, 1);
        assert!(!req.is_import());
    }

    #[test]
    fn explicit_sequence_numbers_bump_the_counter() {
        let req = WriteBatch::new("config")
            .push_with_seq("UPDATE t SET v=1", vec![], 7)
            .push("UPDATE t SET v=2", vec![])
            .build(1);

        assert_eq!(req.mutations[0].sequence_no, 7);
        assert_eq!(req.mutations[1].sequence_no, 8);
    }

    #[test]
    fn import_batches_are_flagged_through_extensions() {
        let req = WriteBatch::new("config")
            .push("INSERT INTO a VALUES (1)", vec![])
            .import()
            .build(3);
        assert!(req.is_import());
    }

    #[test]
    fn request_key_carries_group_and_node() {
        let req = WriteBatch::new("naming")
            .push("DELETE FROM a", vec![])
            .build(42);
        let parts: Vec<&str> = req.key.split('-').collect();
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[1], "naming");
        assert_eq!(parts[2], "42");
        assert_eq!(parts[3].len(), 16);
    }

    #[test]
    fn null_and_empty_text_stay_distinct_through_serde() {
        let args = vec![SqlArg::Null, SqlArg::Text(String::new())];
        let json = serde_json::to_string(&args).unwrap();
        let back: Vec<SqlArg> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, args);
        assert_ne!(back[0], back[1]);
    }
}
