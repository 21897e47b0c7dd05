//! Observation store boundary.
//!
//! The engine's sole I/O surface. Implementations must provide
//! snapshot-consistent reads: two queries with the same filter against an
//! unchanged store return the same rows in the same order. Row order is
//! insertion order, which the authority resolver relies on for its final
//! tie-break.

pub mod memory;
pub mod sqlite;

use crate::error::StoreError;
use crate::models::{Basis, FiscalPeriod, Observation, ObservationKey, Scope};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use uuid::Uuid;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Query filter for observation scans. All fields are conjunctive.
#[derive(Debug, Clone, Default)]
pub struct ObservationFilter {
    pub entity_id: Option<String>,
    pub metric_code: Option<String>,
    pub basis: Option<Basis>,
    pub scope: Option<Scope>,
    pub period: Option<FiscalPeriod>,
    pub source: Option<String>,
    /// Inclusive ceiling on `as_of`
    pub as_of_before: Option<DateTime<Utc>>,
    /// Exclusive floor on `as_of` (watcher high-water mark)
    pub as_of_after: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl ObservationFilter {
    /// Filter matching every observation for one logical key
    pub fn for_key(key: &ObservationKey) -> Self {
        Self {
            entity_id: Some(key.entity_id.clone()),
            metric_code: Some(key.metric_code.clone()),
            basis: Some(key.basis),
            scope: Some(key.scope),
            period: Some(key.period),
            ..Self::default()
        }
    }

    pub fn with_ceiling(mut self, ceiling: DateTime<Utc>) -> Self {
        self.as_of_before = Some(ceiling);
        self
    }

    pub fn matches(&self, obs: &Observation) -> bool {
        if let Some(entity_id) = &self.entity_id {
            if &obs.entity_id != entity_id {
                return false;
            }
        }
        if let Some(code) = &self.metric_code {
            if &obs.metric.code != code {
                return false;
            }
        }
        if let Some(basis) = self.basis {
            if obs.metric.basis != basis {
                return false;
            }
        }
        if let Some(scope) = self.scope {
            if obs.metric.scope != scope {
                return false;
            }
        }
        if let Some(period) = self.period {
            if obs.period != period {
                return false;
            }
        }
        if let Some(source) = &self.source {
            if &obs.source.vendor != source {
                return false;
            }
        }
        if let Some(ceiling) = self.as_of_before {
            if obs.as_of > ceiling {
                return false;
            }
        }
        if let Some(floor) = self.as_of_after {
            if obs.as_of <= floor {
                return false;
            }
        }
        true
    }
}

/// Aggregate counts for observability endpoints
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub total: usize,
    pub by_scope: BTreeMap<String, usize>,
    pub entities: usize,
}

/// Point-in-time keyed storage of financial facts.
///
/// Concrete back-ends are swappable behind this trait; the engine never
/// reaches around it.
#[async_trait]
pub trait ObservationStore: Send + Sync {
    /// Fetch a single observation by id
    async fn get(&self, id: Uuid) -> Result<Option<Observation>, StoreError>;

    /// Scan observations matching `filter`, in insertion order
    async fn query(&self, filter: &ObservationFilter) -> Result<Vec<Observation>, StoreError>;

    /// Persist an observation, returning its id
    async fn store(&self, observation: Observation) -> Result<Uuid, StoreError>;

    /// Persist a batch; returns the number stored
    async fn store_batch(&self, observations: Vec<Observation>) -> Result<usize, StoreError> {
        let mut stored = 0;
        for obs in observations {
            self.store(obs).await?;
            stored += 1;
        }
        Ok(stored)
    }

    /// Full revision history for a logical key, oldest `as_of` first
    async fn history(&self, key: &ObservationKey) -> Result<Vec<Observation>, StoreError> {
        let mut rows = self.query(&ObservationFilter::for_key(key)).await?;
        rows.sort_by_key(|o| o.as_of);
        Ok(rows)
    }

    /// Distinct entity ids with at least one observation matching `filter`,
    /// sorted for deterministic batch iteration
    async fn entities_matching(
        &self,
        filter: &ObservationFilter,
    ) -> Result<Vec<String>, StoreError> {
        let rows = self.query(filter).await?;
        let mut entities: Vec<String> = rows.into_iter().map(|o| o.entity_id).collect();
        entities.sort_unstable();
        entities.dedup();
        Ok(entities)
    }

    async fn stats(&self) -> Result<StoreStats, StoreError>;
}
