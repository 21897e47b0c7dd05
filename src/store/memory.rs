//! In-memory observation store for tests and demos.

use crate::error::StoreError;
use crate::models::Observation;
use crate::store::{ObservationFilter, ObservationStore, StoreStats};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashSet};
use uuid::Uuid;

/// Append-only vector behind a read-write lock. Insertion order is the
/// vector order, which satisfies the store's ordering contract for free.
#[derive(Default)]
pub struct MemoryStore {
    rows: RwLock<Vec<Observation>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.read().is_empty()
    }
}

#[async_trait]
impl ObservationStore for MemoryStore {
    async fn get(&self, id: Uuid) -> Result<Option<Observation>, StoreError> {
        Ok(self.rows.read().iter().find(|o| o.id == id).cloned())
    }

    async fn query(&self, filter: &ObservationFilter) -> Result<Vec<Observation>, StoreError> {
        let rows = self.rows.read();
        let mut out: Vec<Observation> = rows.iter().filter(|o| filter.matches(o)).cloned().collect();
        if let Some(limit) = filter.limit {
            out.truncate(limit);
        }
        Ok(out)
    }

    async fn store(&self, observation: Observation) -> Result<Uuid, StoreError> {
        let id = observation.id;
        self.rows.write().push(observation);
        Ok(id)
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        let rows = self.rows.read();
        let mut by_scope: BTreeMap<String, usize> = BTreeMap::new();
        let mut entities: HashSet<&str> = HashSet::new();
        for obs in rows.iter() {
            *by_scope.entry(obs.metric.scope.as_str().to_string()).or_default() += 1;
            entities.insert(obs.entity_id.as_str());
        }
        Ok(StoreStats {
            total: rows.len(),
            by_scope,
            entities: entities.len(),
        })
    }
}
