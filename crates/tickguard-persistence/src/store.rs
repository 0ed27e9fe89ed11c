//! In-memory position store.

use crate::error::PersistenceResult;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::path::Path;
use tickguard_position::{CloseReason, PositionError, PositionRecord, PositionResult, PositionStore};
use tracing::info;

/// Open positions keyed by id. `mark_closed` removes the position.
#[derive(Debug, Default)]
pub struct MemoryPositionStore {
    positions: RwLock<BTreeMap<String, PositionRecord>>,
}

impl MemoryPositionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed from a JSON array of position records.
    pub fn from_file(path: impl AsRef<Path>) -> PersistenceResult<Self> {
        let path = path.as_ref();
        let body = std::fs::read_to_string(path)?;
        let store = Self::from_json(&body)?;
        info!(
            path = %path.display(),
            positions = store.len(),
            "Position store seeded"
        );
        Ok(store)
    }

    pub fn from_json(body: &str) -> PersistenceResult<Self> {
        let records: Vec<PositionRecord> = serde_json::from_str(body)?;
        let store = Self::new();
        for record in records {
            store.upsert(record);
        }
        Ok(store)
    }

    /// Insert or replace a position.
    pub fn upsert(&self, record: PositionRecord) {
        self.positions.write().insert(record.id.clone(), record);
    }

    pub fn get(&self, position_id: &str) -> Option<PositionRecord> {
        self.positions.read().get(position_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.positions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.read().is_empty()
    }
}

impl PositionStore for MemoryPositionStore {
    fn list_open_positions(&self) -> PositionResult<Vec<PositionRecord>> {
        Ok(self.positions.read().values().cloned().collect())
    }

    fn mark_closed(&self, position_id: &str, reason: CloseReason) -> PositionResult<()> {
        match self.positions.write().remove(position_id) {
            Some(_) => {
                info!(position_id, reason = %reason, "Position marked closed");
                Ok(())
            }
            None => Err(PositionError::NotFound(position_id.to_string())),
        }
    }
}
