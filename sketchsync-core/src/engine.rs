//! Document engine: the single mutation path for a whiteboard.
//!
//! ```text
//!  local edit ──► tick clock ──┐
//!                              ▼
//!  remote delta ──► validate ──► ledger check ──► shape registers
//!                                   │                 │
//!                                   ▼                 ▼
//!                            state vector        read views
//!                                   │
//!                                   ▼
//!                        diff(remote vector) ──► catch-up delta
//! ```
//!
//! Every operation ever applied stays in the ledger, keyed by
//! `(client, counter)`. The ledger makes `apply` idempotent and lets `diff`
//! answer any state vector without full-state retransmission.
//!
//! The engine is synchronous and owns no locks. Callers that share it
//! (one engine per room on the server) serialize access themselves.
//!
//! Performance targets:
//! | Operation             | Target   |
//! |-----------------------|----------|
//! | apply (single op)     | < 2 µs   |
//! | diff (10k op ledger)  | < 1 ms   |
//! | encode_state (10k)    | < 5 ms   |

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

use crate::clock::{ClientId, LamportClock, OpId, StateVector};
use crate::op::{OpError, OpKind, Operation};
use crate::shape::{PropValue, ShapeId, ShapeRecord, ShapeView};

/// Current snapshot encoding version.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Outcome of applying one operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppliedResult {
    /// The operation changed at least one register.
    Applied,
    /// Recorded, but every register it touched already held a newer write.
    Superseded,
    /// Already in the ledger; nothing changed.
    Duplicate,
}

/// Counts from a batch apply.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyStats {
    pub applied: usize,
    pub superseded: usize,
    pub duplicate: usize,
}

impl ApplyStats {
    /// Operations that were new to this replica.
    pub fn new_ops(&self) -> usize {
        self.applied + self.superseded
    }

    fn record(&mut self, result: AppliedResult) {
        match result {
            AppliedResult::Applied => self.applied += 1,
            AppliedResult::Superseded => self.superseded += 1,
            AppliedResult::Duplicate => self.duplicate += 1,
        }
    }
}

/// Operations a remote replica is missing, in id order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeltaSet {
    ops: Vec<Operation>,
}

impl DeltaSet {
    pub fn new(mut ops: Vec<Operation>) -> Self {
        ops.sort_by_key(|op| op.id);
        Self { ops }
    }

    pub fn ops(&self) -> &[Operation] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<Operation> {
        self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

impl IntoIterator for DeltaSet {
    type Item = Operation;
    type IntoIter = std::vec::IntoIter<Operation>;

    fn into_iter(self) -> Self::IntoIter {
        self.ops.into_iter()
    }
}

/// Full engine state: the shape store plus the operation ledger.
///
/// Converged replicas produce equal snapshots and identical encoded bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    version: u32,
    shapes: BTreeMap<ShapeId, ShapeRecord>,
    ledger: BTreeMap<ClientId, BTreeMap<u64, Operation>>,
}

impl Snapshot {
    pub fn encode(&self) -> Result<Vec<u8>, EngineError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| EngineError::Encode(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, EngineError> {
        let (snapshot, _): (Snapshot, usize) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| EngineError::Decode(e.to_string()))?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(EngineError::UnsupportedVersion(snapshot.version));
        }
        Ok(snapshot)
    }

    /// Number of operations in the ledger.
    pub fn op_count(&self) -> usize {
        self.ledger.values().map(BTreeMap::len).sum()
    }
}

/// Replicated whiteboard document.
#[derive(Debug, Clone)]
pub struct DocumentEngine {
    clock: LamportClock,
    shapes: BTreeMap<ShapeId, ShapeRecord>,
    ledger: BTreeMap<ClientId, BTreeMap<u64, Operation>>,
    vector: StateVector,
    op_count: usize,
}

impl DocumentEngine {
    /// Create an empty engine issuing local operations as `client`.
    pub fn new(client: ClientId) -> Self {
        Self {
            clock: LamportClock::new(client),
            shapes: BTreeMap::new(),
            ledger: BTreeMap::new(),
            vector: StateVector::new(),
            op_count: 0,
        }
    }

    /// Resume from a snapshot. The clock continues past every counter in it.
    pub fn from_snapshot(client: ClientId, snapshot: Snapshot) -> Result<Self, EngineError> {
        let mut engine = Self::new(client);
        for (peer, ops) in &snapshot.ledger {
            for (counter, op) in ops {
                if op.id.client != *peer || op.id.counter != *counter {
                    return Err(EngineError::CorruptSnapshot(format!(
                        "ledger entry {}@{} holds operation {}",
                        counter, peer, op.id
                    )));
                }
                engine.vector.observe(op.id);
                engine.clock.observe(op.id.counter);
                engine.op_count += 1;
            }
        }
        engine.shapes = snapshot.shapes;
        engine.ledger = snapshot.ledger;
        log::debug!(
            "Restored engine with {} ops from {} clients",
            engine.op_count,
            engine.vector.len()
        );
        Ok(engine)
    }

    pub fn client(&self) -> ClientId {
        self.clock.client()
    }

    /// Apply one operation, local or remote.
    ///
    /// Safe to call with duplicates and with operations whose dependencies
    /// have not arrived yet.
    pub fn apply(&mut self, op: Operation) -> Result<AppliedResult, EngineError> {
        op.validate()?;
        if let Some(existing) = self.lookup(&op.id) {
            if *existing == op {
                return Ok(AppliedResult::Duplicate);
            }
            log::warn!("Rejected operation {} reusing an applied id", op.id);
            return Err(EngineError::ConflictingOperation(op.id));
        }
        Ok(self.apply_new(op))
    }

    /// Apply a batch atomically with respect to rejection: every operation is
    /// checked before any is applied.
    pub fn apply_all(&mut self, ops: Vec<Operation>) -> Result<ApplyStats, EngineError> {
        let mut batch: HashMap<OpId, &Operation> = HashMap::with_capacity(ops.len());
        for op in &ops {
            op.validate()?;
            if let Some(existing) = self.lookup(&op.id) {
                if existing != op {
                    return Err(EngineError::ConflictingOperation(op.id));
                }
            }
            if let Some(previous) = batch.insert(op.id, op) {
                if previous != op {
                    return Err(EngineError::ConflictingOperation(op.id));
                }
            }
        }

        let mut stats = ApplyStats::default();
        for op in ops {
            let result = if self.lookup(&op.id).is_some() {
                AppliedResult::Duplicate
            } else {
                self.apply_new(op)
            };
            stats.record(result);
        }
        Ok(stats)
    }

    fn lookup(&self, id: &OpId) -> Option<&Operation> {
        self.ledger.get(&id.client)?.get(&id.counter)
    }

    fn apply_new(&mut self, op: Operation) -> AppliedResult {
        self.clock.observe(op.id.counter);
        let record = self
            .shapes
            .entry(op.shape())
            .or_insert_with(ShapeRecord::placeholder);

        let changed = match &op.kind {
            OpKind::CreateShape { props } => record.apply_create(op.id, props),
            OpKind::SetProperty { key, value, .. } => record.apply_set(key, value.clone(), op.id),
            OpKind::DeleteShape { .. } => record.apply_delete(op.id),
        };

        self.vector.observe(op.id);
        self.ledger
            .entry(op.id.client)
            .or_default()
            .insert(op.id.counter, op);
        self.op_count += 1;

        if changed {
            AppliedResult::Applied
        } else {
            AppliedResult::Superseded
        }
    }

    /// Create a shape locally. Returns the stamped operation for broadcast.
    pub fn create_shape(
        &mut self,
        props: BTreeMap<String, PropValue>,
    ) -> Result<Operation, EngineError> {
        let op = Operation::new(self.clock.tick(), OpKind::CreateShape { props });
        self.apply(op.clone())?;
        Ok(op)
    }

    /// Set a property locally. Setting a property on a deleted shape restores it.
    pub fn set_property(
        &mut self,
        shape: ShapeId,
        key: impl Into<String>,
        value: impl Into<PropValue>,
    ) -> Result<Operation, EngineError> {
        if !self.shapes.contains_key(&shape) {
            return Err(EngineError::UnknownShape(shape));
        }
        let op = Operation::new(
            self.clock.tick(),
            OpKind::SetProperty {
                shape,
                key: key.into(),
                value: value.into(),
            },
        );
        self.apply(op.clone())?;
        Ok(op)
    }

    /// Delete a shape locally.
    pub fn delete_shape(&mut self, shape: ShapeId) -> Result<Operation, EngineError> {
        if !self.shapes.contains_key(&shape) {
            return Err(EngineError::UnknownShape(shape));
        }
        let op = Operation::new(self.clock.tick(), OpKind::DeleteShape { shape });
        self.apply(op.clone())?;
        Ok(op)
    }

    /// Every ledger operation whose counter exceeds the remote's entry for
    /// its client.
    pub fn diff(&self, remote: &StateVector) -> DeltaSet {
        let mut ops = Vec::new();
        for (client, entries) in &self.ledger {
            let seen = remote.get(client);
            ops.extend(
                entries
                    .range(seen.saturating_add(1)..)
                    .map(|(_, op)| op.clone()),
            );
        }
        DeltaSet::new(ops)
    }

    pub fn state_vector(&self) -> &StateVector {
        &self.vector
    }

    /// Snapshot of the full state.
    pub fn encode_state(&self) -> Snapshot {
        Snapshot {
            version: SNAPSHOT_VERSION,
            shapes: self.shapes.clone(),
            ledger: self.ledger.clone(),
        }
    }

    /// Visible shape by id.
    pub fn shape(&self, id: ShapeId) -> Option<ShapeView> {
        self.shapes
            .get(&id)
            .filter(|record| record.is_visible())
            .map(|record| record.view(id))
    }

    /// Visible shapes in id order.
    pub fn shapes(&self) -> Vec<ShapeView> {
        self.shapes
            .iter()
            .filter(|(_, record)| record.is_visible())
            .map(|(id, record)| record.view(*id))
            .collect()
    }

    /// Number of visible shapes.
    pub fn len(&self) -> usize {
        self.shapes.values().filter(|r| r.is_visible()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of operations in the ledger.
    pub fn op_count(&self) -> usize {
        self.op_count
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "shapes": self.shapes().iter().map(ShapeView::to_json).collect::<Vec<_>>(),
        })
    }
}

/// Engine errors.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineError {
    /// The operation failed well-formedness checks.
    Invalid(OpError),
    /// An operation with this id but different content was already applied.
    ConflictingOperation(OpId),
    /// Local edit against a shape this replica has never seen.
    UnknownShape(ShapeId),
    Encode(String),
    Decode(String),
    UnsupportedVersion(u32),
    CorruptSnapshot(String),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Invalid(e) => write!(f, "Invalid operation: {e}"),
            Self::ConflictingOperation(id) => {
                write!(f, "Operation {id} conflicts with an applied operation")
            }
            Self::UnknownShape(id) => write!(f, "Unknown shape: {id}"),
            Self::Encode(e) => write!(f, "Snapshot encode error: {e}"),
            Self::Decode(e) => write!(f, "Snapshot decode error: {e}"),
            Self::UnsupportedVersion(v) => write!(f, "Unsupported snapshot version: {v}"),
            Self::CorruptSnapshot(e) => write!(f, "Corrupt snapshot: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<OpError> for EngineError {
    fn from(e: OpError) -> Self {
        Self::Invalid(e)
    }
}
