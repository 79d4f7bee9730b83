//! Operation identifiers and per-peer progress summaries.
//!
//! Every mutation carries an [`OpId`] `(counter, client)`. Ids are totally
//! ordered: the larger counter wins, and the client id breaks exact-counter
//! ties. Counters follow Lamport rules, so anything issued after observing an
//! operation sorts after it.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Identity of a replica issuing operations.
///
/// Stable for the lifetime of a connection. The nil UUID is reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClientId(Uuid);

impl ClientId {
    pub const NIL: ClientId = ClientId(Uuid::nil());

    /// Generate a fresh random client id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID (for tests and restored sessions).
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// The reserved id used by replicas that never issue operations
    /// (the server's authoritative engine).
    pub fn nil() -> Self {
        Self::NIL
    }

    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // First 8 hex digits are plenty for logs.
        let s = self.0.simple().to_string();
        f.write_str(&s[..8])
    }
}

/// Unique, totally ordered operation identifier.
///
/// Field order matters: the derived `Ord` compares `counter` first and
/// `client` second.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OpId {
    pub counter: u64,
    pub client: ClientId,
}

impl OpId {
    pub fn new(client: ClientId, counter: u64) -> Self {
        Self { counter, client }
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.counter, self.client)
    }
}

/// Lamport clock for the local replica.
#[derive(Debug, Clone)]
pub struct LamportClock {
    client: ClientId,
    counter: u64,
}

impl LamportClock {
    pub fn new(client: ClientId) -> Self {
        Self { client, counter: 0 }
    }

    /// Issue the next identifier for a local operation.
    pub fn tick(&mut self) -> OpId {
        self.counter += 1;
        OpId::new(self.client, self.counter)
    }

    /// Fold in a counter seen on an incoming operation.
    pub fn observe(&mut self, counter: u64) {
        if counter > self.counter {
            self.counter = counter;
        }
    }

    pub fn client(&self) -> ClientId {
        self.client
    }

    /// Highest counter issued or observed so far.
    pub fn current(&self) -> u64 {
        self.counter
    }
}

/// Highest counter incorporated from each known client.
///
/// Backed by a `BTreeMap` so encoding is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateVector {
    entries: BTreeMap<ClientId, u64>,
}

impl StateVector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest counter seen from `client`, or 0 if none.
    pub fn get(&self, client: &ClientId) -> u64 {
        self.entries.get(client).copied().unwrap_or(0)
    }

    /// Record that `id` has been incorporated.
    pub fn observe(&mut self, id: OpId) {
        let entry = self.entries.entry(id.client).or_insert(0);
        if id.counter > *entry {
            *entry = id.counter;
        }
    }

    /// Whether the vector already covers `id`.
    pub fn includes(&self, id: &OpId) -> bool {
        id.counter <= self.get(&id.client)
    }

    /// Pointwise maximum with another vector.
    pub fn merge(&mut self, other: &StateVector) {
        for (client, counter) in &other.entries {
            self.observe(OpId::new(*client, *counter));
        }
    }

    pub fn set(&mut self, client: ClientId, counter: u64) {
        if counter == 0 {
            self.entries.remove(&client);
        } else {
            self.entries.insert(client, counter);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ClientId, &u64)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<(ClientId, u64)> for StateVector {
    fn from_iter<I: IntoIterator<Item = (ClientId, u64)>>(iter: I) -> Self {
        let mut sv = StateVector::new();
        for (client, counter) in iter {
            sv.observe(OpId::new(client, counter));
        }
        sv
    }
}
