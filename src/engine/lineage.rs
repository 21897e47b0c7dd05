//! Adjustment-chain lineage.
//!
//! Walks `derived_from` pointers back to the origin observation (typically
//! GAAP) and checks that the origin value plus every adjustment along the
//! way reproduces the final value. A mismatch is a data-integrity error
//! surfaced to the caller, never silently corrected.

use crate::error::EngineError;
use crate::models::{Adjustment, Observation};
use crate::store::ObservationStore;
use rust_decimal::Decimal;
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

/// One derived hop and the adjustments that produced it
#[derive(Debug, Clone)]
pub struct LineageHop {
    pub observation: Observation,
    pub adjustments: Vec<Adjustment>,
}

/// Full lineage of a derived observation, origin first
#[derive(Debug, Clone)]
pub struct Lineage {
    pub origin: Observation,
    pub hops: Vec<LineageHop>,
    pub final_observation: Observation,
}

impl Lineage {
    /// Total of all adjustment amounts across all hops
    pub fn adjustment_total(&self) -> Decimal {
        self.hops
            .iter()
            .flat_map(|hop| hop.adjustments.iter())
            .map(|adj| adj.amount)
            .sum()
    }
}

#[derive(Clone)]
pub struct LineageTracker {
    store: Arc<dyn ObservationStore>,
}

impl LineageTracker {
    pub fn new(store: Arc<dyn ObservationStore>) -> Self {
        Self { store }
    }

    /// Reconstruct and verify the chain ending at `observation_id`.
    ///
    /// Tolerance is one unit in the last place of the final observation's
    /// metric precision. Cycles in `derived_from` are integrity errors too.
    pub async fn lineage(&self, observation_id: Uuid) -> Result<Lineage, EngineError> {
        let final_observation = self
            .store
            .get(observation_id)
            .await?
            .ok_or(EngineError::ObservationNotFound(observation_id))?;

        // Walk backward, final first; reverse afterwards.
        let mut backward = vec![final_observation.clone()];
        let mut seen: HashSet<Uuid> = HashSet::from([observation_id]);
        let mut cursor = final_observation.derived_from;
        while let Some(parent_id) = cursor {
            if !seen.insert(parent_id) {
                return Err(EngineError::AdjustmentIntegrity {
                    observation_id,
                    reconstructed: Decimal::ZERO,
                    declared: final_observation.value,
                });
            }
            let parent = self
                .store
                .get(parent_id)
                .await?
                .ok_or(EngineError::ObservationNotFound(parent_id))?;
            cursor = parent.derived_from;
            backward.push(parent);
        }
        backward.reverse();

        let mut chain = backward.into_iter();
        // non-empty by construction; an origin with no parents is its own chain
        let origin = chain.next().unwrap_or_else(|| final_observation.clone());
        let hops: Vec<LineageHop> = chain
            .map(|observation| LineageHop {
                adjustments: observation.adjustments.clone(),
                observation,
            })
            .collect();

        let lineage = Lineage {
            origin,
            hops,
            final_observation,
        };

        let reconstructed = lineage.origin.value + lineage.adjustment_total();
        let declared = lineage.final_observation.value;
        let tolerance = Decimal::new(1, lineage.final_observation.metric.precision);
        if (reconstructed - declared).abs() > tolerance {
            return Err(EngineError::AdjustmentIntegrity {
                observation_id,
                reconstructed,
                declared,
            });
        }

        Ok(lineage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Basis, FiscalPeriod, MetricSpec, SourceRef};
    use crate::store::MemoryStore;
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;

    fn base(value: Decimal, basis: Basis) -> Observation {
        Observation::new(
            "aapl",
            MetricSpec::reported("eps", basis).per_share().with_precision(2),
            FiscalPeriod::quarterly(2024, 4),
            value,
            Utc.with_ymd_and_hms(2024, 10, 31, 21, 0, 0).unwrap(),
            SourceRef::new("sec", 100),
        )
    }

    #[tokio::test]
    async fn chain_reconciles_gaap_to_operating() {
        let store = Arc::new(MemoryStore::new());

        let gaap = base(dec!(1.80), Basis::Gaap);
        let gaap_id = store.store(gaap.clone()).await.unwrap();

        let adjusted = base(dec!(2.10), Basis::Adjusted)
            .derived_from(gaap_id)
            .with_adjustments(vec![
                Adjustment::new("stock_comp", dec!(0.22), "SBC addback"),
                Adjustment::new("restructuring", dec!(0.08), "one-time charge"),
            ]);
        let adjusted_id = store.store(adjusted).await.unwrap();

        let operating = base(dec!(2.15), Basis::Operating)
            .derived_from(adjusted_id)
            .with_adjustments(vec![Adjustment::new("fx", dec!(0.05), "constant currency")]);
        let operating_id = store.store(operating).await.unwrap();

        let tracker = LineageTracker::new(store);
        let lineage = tracker.lineage(operating_id).await.unwrap();

        assert_eq!(lineage.origin.value, dec!(1.80));
        assert_eq!(lineage.hops.len(), 2);
        assert_eq!(lineage.adjustment_total(), dec!(0.35));
        assert_eq!(
            lineage.origin.value + lineage.adjustment_total(),
            lineage.final_observation.value
        );
    }

    #[tokio::test]
    async fn origin_observation_is_its_own_lineage() {
        let store = Arc::new(MemoryStore::new());
        let gaap = base(dec!(1.80), Basis::Gaap);
        let id = store.store(gaap.clone()).await.unwrap();

        let tracker = LineageTracker::new(store);
        let lineage = tracker.lineage(id).await.unwrap();
        assert_eq!(lineage.origin.id, id);
        assert!(lineage.hops.is_empty());
        assert_eq!(lineage.adjustment_total(), Decimal::ZERO);
    }

    #[tokio::test]
    async fn sum_mismatch_is_an_integrity_error() {
        let store = Arc::new(MemoryStore::new());
        let gaap_id = store.store(base(dec!(1.80), Basis::Gaap)).await.unwrap();
        let bad = base(dec!(2.50), Basis::Adjusted)
            .derived_from(gaap_id)
            .with_adjustments(vec![Adjustment::new("stock_comp", dec!(0.22), "SBC")]);
        let bad_id = store.store(bad).await.unwrap();

        let tracker = LineageTracker::new(store);
        match tracker.lineage(bad_id).await {
            Err(EngineError::AdjustmentIntegrity {
                reconstructed,
                declared,
                ..
            }) => {
                assert_eq!(reconstructed, dec!(2.02));
                assert_eq!(declared, dec!(2.50));
            }
            other => panic!("expected AdjustmentIntegrity, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn cycle_is_an_integrity_error() {
        let store = Arc::new(MemoryStore::new());
        let mut a = base(dec!(1.00), Basis::Gaap);
        let mut b = base(dec!(1.10), Basis::Adjusted);
        a.derived_from = Some(b.id);
        b.derived_from = Some(a.id);
        let a_id = store.store(a).await.unwrap();
        store.store(b).await.unwrap();

        let tracker = LineageTracker::new(store);
        assert!(matches!(
            tracker.lineage(a_id).await,
            Err(EngineError::AdjustmentIntegrity { .. })
        ));
    }

    #[tokio::test]
    async fn unknown_id_is_not_found() {
        let store = Arc::new(MemoryStore::new());
        let tracker = LineageTracker::new(store);
        assert!(matches!(
            tracker.lineage(Uuid::new_v4()).await,
            Err(EngineError::ObservationNotFound(_))
        ));
    }
}
