//! Derived observation generation.
//!
//! Materializes comparison outputs (surprise) as new observations feeding
//! back into the store. Derived facts carry a deliberately low authority so
//! they can never outrank the primary facts they were computed from.
//!
//! A surprise observation starts its own lineage: it links to its inputs
//! through metadata ids only, never through `derived_from`, because the
//! adjustment-chain sum law cannot hold across metrics (a percentage is not
//! the actual's value plus deltas).

use crate::error::EngineError;
use crate::models::{
    Metadata, MetricCategory, MetricSpec, Observation, ComparisonResult, SourceRef,
};
use crate::registry::SourceRegistry;
use crate::store::ObservationStore;
use chrono::Utc;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

const DERIVED_VENDOR: &str = "obspine";

#[derive(Clone)]
pub struct DerivedGenerator {
    store: Arc<dyn ObservationStore>,
    authority: u8,
}

impl DerivedGenerator {
    pub fn new(store: Arc<dyn ObservationStore>, registry: &SourceRegistry) -> Self {
        Self {
            store,
            authority: registry.derived_authority(),
        }
    }

    /// Build the surprise observation for a comparison.
    ///
    /// Returns `None` when the comparison has no estimate: surprise is
    /// undefined, so there is nothing to materialize.
    pub fn derive(&self, comparison: &ComparisonResult) -> Option<Observation> {
        let estimate = comparison.estimate.as_ref()?;
        let surprise = comparison.surprise_pct?;

        let metric = MetricSpec {
            code: format!("{}_surprise", comparison.metric_code),
            basis: comparison.actual.metric.basis,
            scope: comparison.actual.metric.scope,
            per_share: false,
            category: MetricCategory::Derived,
            precision: 6,
        };

        let mut metadata = Metadata::new();
        metadata.insert("estimate_id", serde_json::json!(estimate.id.to_string()));
        metadata.insert("estimate_value", serde_json::json!(estimate.value.to_string()));
        metadata.insert("actual_id", serde_json::json!(comparison.actual.id.to_string()));
        metadata.insert(
            "actual_value",
            serde_json::json!(comparison.actual.value.to_string()),
        );
        metadata.insert("direction", serde_json::json!(comparison.direction.as_str()));

        Some(
            Observation::new(
                comparison.entity_id.clone(),
                metric,
                comparison.period,
                surprise,
                Utc::now(),
                SourceRef::new(DERIVED_VENDOR, self.authority),
            )
            .with_metadata(metadata),
        )
    }

    /// Derive and write through the store. No-op for NO_ESTIMATE comparisons.
    pub async fn materialize(
        &self,
        comparison: &ComparisonResult,
    ) -> Result<Option<Uuid>, EngineError> {
        match self.derive(comparison) {
            Some(observation) => {
                let id = self.store.store(observation).await?;
                debug!(
                    entity = comparison.entity_id.as_str(),
                    metric = comparison.metric_code.as_str(),
                    %id,
                    "materialized surprise observation"
                );
                Ok(Some(id))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::compare::{CompareRequest, ComparisonEngine};
    use crate::models::{Basis, FiscalPeriod, SourceRef};
    use crate::store::MemoryStore;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    async fn comparison(store: Arc<MemoryStore>) -> ComparisonResult {
        let ts = |day: u32| Utc.with_ymd_and_hms(2024, 10, day, 21, 0, 0).unwrap();
        store
            .store(Observation::new(
                "aapl",
                MetricSpec::consensus("eps", Basis::Adjusted),
                FiscalPeriod::quarterly(2024, 4),
                dec!(2.10),
                ts(28),
                SourceRef::new("factset", 70),
            ))
            .await
            .unwrap();
        store
            .store(Observation::new(
                "aapl",
                MetricSpec::reported("eps", Basis::Adjusted),
                FiscalPeriod::quarterly(2024, 4),
                dec!(2.18),
                ts(31),
                SourceRef::new("sec", 100),
            ))
            .await
            .unwrap();

        let engine = ComparisonEngine::new(store);
        engine
            .compare(&CompareRequest::standard(
                "aapl",
                "eps",
                FiscalPeriod::quarterly(2024, 4),
                Basis::Adjusted,
            ))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn derived_observation_captures_inputs() {
        let store = Arc::new(MemoryStore::new());
        let comparison = comparison(store.clone()).await;

        let generator = DerivedGenerator::new(store.clone(), &SourceRegistry::with_defaults(10));
        let id = generator.materialize(&comparison).await.unwrap().unwrap();

        let derived = store.get(id).await.unwrap().unwrap();
        assert_eq!(derived.metric.code, "eps_surprise");
        assert_eq!(derived.metric.category, MetricCategory::Derived);
        assert_eq!(derived.source.authority, 10);
        assert_eq!(derived.derived_from, None);
        assert_eq!(
            derived.metadata.get_id("actual_id"),
            Some(comparison.actual.id)
        );
        assert_eq!(derived.metadata.get_decimal("estimate_value"), Some(dec!(2.10)));
        assert_eq!(derived.value, comparison.surprise_pct.unwrap());
    }

    #[tokio::test]
    async fn no_estimate_is_a_noop() {
        let store = Arc::new(MemoryStore::new());
        store
            .store(Observation::new(
                "smallcap123",
                MetricSpec::reported("eps", Basis::Gaap),
                FiscalPeriod::quarterly(2024, 4),
                dec!(0.50),
                Utc.with_ymd_and_hms(2024, 10, 31, 21, 0, 0).unwrap(),
                SourceRef::new("sec", 100),
            ))
            .await
            .unwrap();
        let engine = ComparisonEngine::new(store.clone());
        let comparison = engine
            .compare(&CompareRequest::standard(
                "smallcap123",
                "eps",
                FiscalPeriod::quarterly(2024, 4),
                Basis::Gaap,
            ))
            .await
            .unwrap();

        let generator = DerivedGenerator::new(store.clone(), &SourceRegistry::with_defaults(10));
        assert_eq!(generator.materialize(&comparison).await.unwrap(), None);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn derived_authority_stays_below_primaries() {
        let store = Arc::new(MemoryStore::new());
        let comparison = comparison(store.clone()).await;
        let registry = SourceRegistry::with_defaults(10);
        let generator = DerivedGenerator::new(store, &registry);
        let derived = generator.derive(&comparison).unwrap();
        assert!(derived.source.authority < comparison.actual.source.authority);
        assert!(derived.source.authority < registry.authority_for("scraped").unwrap());
    }
}
