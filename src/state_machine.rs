//! The replicated state machine: executes committed writes and live reads
//! against the embedded relational store under the shared/exclusive lock
//! discipline.
//!
//! Content-level failures (bad SQL, constraint violations) become failed
//! [`Outcome`]s so the consensus log keeps advancing; infrastructure-level
//! failures degrade the node and propagate to the consensus adapter.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use tokio::sync::RwLock;
use tracing::{debug, error, warn};

use std::collections::BTreeMap;

use crate::{
    codec,
    events::{EventHandle, StoreEvent},
    request::{
        EXT_EVENT_PAYLOAD, EXT_EVENT_TOPIC, EXT_IMPORT, Outcome, ReadDescriptor, SideEffect,
        WriteEntry,
    },
    store::{SqlStore, StoreError},
};

/// Shared/exclusive lock over the store's on-disk files.
///
/// Applies and reads take the shared side and may interleave with each other;
/// snapshot save/load takes the exclusive side so the files are quiescent.
/// The consensus layer already serializes applies per group, so "shared" here
/// exists only to let reads proceed alongside applies.
pub type StoreGate = Arc<RwLock<()>>;

pub struct ReplicatedStateMachine {
    store: Arc<SqlStore>,
    gate: StoreGate,
    degraded: AtomicBool,
    events: EventHandle,
}

impl std::fmt::Debug for ReplicatedStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicatedStateMachine")
            .field("store", &self.store)
            .field("degraded", &self.degraded.load(Ordering::Relaxed))
            .finish()
    }
}

impl ReplicatedStateMachine {
    pub fn new(store: Arc<SqlStore>, gate: StoreGate, events: EventHandle) -> Self {
        Self {
            store,
            gate,
            degraded: AtomicBool::new(false),
            events,
        }
    }

    pub fn store(&self) -> &Arc<SqlStore> {
        &self.store
    }

    pub fn gate(&self) -> StoreGate {
        self.gate.clone()
    }

    pub fn events(&self) -> &EventHandle {
        &self.events
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    /// Clear the degraded flag after a successful snapshot-based recovery.
    pub fn mark_recovered(&self) {
        self.degraded.store(false, Ordering::SeqCst);
    }

    /// Called by the consensus layer when this group hits an unrecoverable
    /// condition. The node stops serving reads and applies until an operator
    /// or a snapshot load restores it.
    pub fn on_error(&self, reason: &str) {
        if !self.degraded.swap(true, Ordering::SeqCst) {
            error!(reason, "marking local store degraded");
            self.events.publish(StoreEvent::Degraded {
                reason: reason.to_string(),
            });
        }
    }

    /// Apply one committed write entry, in commit order, exactly as every
    /// other replica does: decode the payload, then execute the batch.
    ///
    /// A payload that fails to decode becomes a failed outcome so the log
    /// keeps advancing. Returns `Err` only for infrastructure failures; those
    /// degrade the node before propagating so the consensus adapter can stop
    /// the group.
    pub async fn on_apply(&self, entry: &WriteEntry) -> Result<Outcome, StoreError> {
        if self.is_degraded() {
            return Err(StoreError::Degraded);
        }

        let (mutations, extensions) = match codec::decode_write(&entry.payload) {
            Ok(decoded) => decoded,
            Err(err) => {
                warn!(key = %entry.key, %err, "malformed write payload");
                return Ok(codec::decode_failure_outcome(&err));
            }
        };

        let _shared = self.gate.read().await;

        let ordered = !extensions.contains_key(EXT_IMPORT);
        match self.store.apply_batch(&mutations, ordered) {
            Ok(()) => {
                debug!(key = %entry.key, mutations = mutations.len(), "applied write entry");
                Ok(Outcome::ok(None).with_side_effects(side_effects_of(&extensions)))
            }
            Err(err) if err.is_fatal() => {
                self.on_error(&err.to_string());
                Err(err)
            }
            Err(err) => {
                warn!(key = %entry.key, %err, "write entry rejected by store");
                Ok(Outcome::fail(err.to_string()))
            }
        }
    }

    /// Serve a read routed to this replica. Possibly stale unless the caller
    /// went through the linearizable read path first.
    pub async fn on_request(&self, descriptor: &ReadDescriptor) -> Outcome {
        if self.is_degraded() {
            return Outcome::fail(StoreError::Degraded.to_string());
        }

        let _shared = self.gate.read().await;

        match self.store.query(descriptor) {
            Ok(value) => match codec::encode_result(&value) {
                Ok(bytes) => Outcome::ok(Some(bytes)),
                Err(err) => Outcome::fail(err.to_string()),
            },
            Err(err) => {
                if err.is_fatal() {
                    self.on_error(&err.to_string());
                }
                Outcome::fail(err.to_string())
            }
        }
    }
}

/// Extract the domain event the caller asked to republish after apply.
/// Publication happens outside the store lock, by whoever receives the
/// outcome.
fn side_effects_of(extensions: &BTreeMap<String, String>) -> Vec<SideEffect> {
    match (
        extensions.get(EXT_EVENT_TOPIC),
        extensions.get(EXT_EVENT_PAYLOAD),
    ) {
        (Some(topic), payload) => vec![SideEffect::PublishEvent {
            topic: topic.clone(),
            payload: payload.cloned().unwrap_or_default(),
        }],
        _ => Vec::new(),
    }
}
