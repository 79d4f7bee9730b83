//! In-memory snapshot store for tests and servers without a data directory.

use std::collections::BTreeMap;
use std::sync::Mutex;

use super::{SnapshotStore, StoreError};
use crate::room_id::RoomId;

/// Snapshots kept in a map. Lost when the process exits.
#[derive(Debug, Default)]
pub struct MemoryStore {
    snapshots: Mutex<BTreeMap<RoomId, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.snapshots.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SnapshotStore for MemoryStore {
    fn save(&self, room: &RoomId, snapshot: &[u8]) -> Result<(), StoreError> {
        let mut snapshots = self.snapshots.lock().map_err(|_| StoreError::Poisoned)?;
        snapshots.insert(room.clone(), snapshot.to_vec());
        Ok(())
    }

    fn load(&self, room: &RoomId) -> Result<Option<Vec<u8>>, StoreError> {
        let snapshots = self.snapshots.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(snapshots.get(room).cloned())
    }

    fn delete(&self, room: &RoomId) -> Result<(), StoreError> {
        let mut snapshots = self.snapshots.lock().map_err(|_| StoreError::Poisoned)?;
        snapshots.remove(room);
        Ok(())
    }

    fn list(&self) -> Result<Vec<RoomId>, StoreError> {
        let snapshots = self.snapshots.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(snapshots.keys().cloned().collect())
    }
}
