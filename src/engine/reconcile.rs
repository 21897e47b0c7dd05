//! Multi-source reconciliation.
//!
//! Compares the same fact across vendors, computes spread statistics over
//! the estimates that were found, and names the most accurate source.

use crate::engine::authority::AuthorityResolver;
use crate::engine::temporal::TemporalResolver;
use crate::error::EngineError;
use crate::models::{Basis, FiscalPeriod, Observation, ObservationKey, Scope};
use crate::store::ObservationStore;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Spread statistics over the estimates that were found
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct ConsensusSpread {
    pub high: Decimal,
    pub low: Decimal,
    pub mean: Decimal,
    pub median: Decimal,
    /// Sample standard deviation; 0.0 when fewer than two estimates
    pub stdev: f64,
    pub count: usize,
}

/// Per-vendor view of one fact
#[derive(Debug, Clone)]
pub struct SourceComparison {
    /// Vendors with no matching observation are omitted, not zeroed
    pub estimates: BTreeMap<String, Observation>,
    pub actual: Observation,
    /// Omitted for vendors whose estimate is exactly zero (undefined surprise)
    pub surprises: BTreeMap<String, Decimal>,
    pub spread: Option<ConsensusSpread>,
    /// Smallest surprise magnitude; ties resolved by lexical source order
    /// (deterministic, arbitrary)
    pub most_accurate_source: Option<String>,
}

#[derive(Clone)]
pub struct SourceReconciler {
    temporal: TemporalResolver,
}

impl SourceReconciler {
    pub fn new(store: Arc<dyn ObservationStore>) -> Self {
        Self {
            temporal: TemporalResolver::new(store),
        }
    }

    pub async fn compare_sources(
        &self,
        entity_id: &str,
        metric_code: &str,
        period: FiscalPeriod,
        basis: Basis,
        sources: &[String],
    ) -> Result<SourceComparison, EngineError> {
        let actual_key = ObservationKey {
            entity_id: entity_id.to_string(),
            metric_code: metric_code.to_string(),
            basis,
            scope: Scope::Reported,
            period,
        };
        let actual_candidates = self
            .temporal
            .resolve_candidates(&actual_key, None, false)
            .await?;
        let actual = AuthorityResolver::select(&actual_candidates, None)?
            .cloned()
            .ok_or(EngineError::NoActual { key: actual_key })?;

        let estimate_key = ObservationKey {
            entity_id: entity_id.to_string(),
            metric_code: metric_code.to_string(),
            basis,
            scope: Scope::Consensus,
            period,
        };
        let candidates = self
            .temporal
            .resolve_candidates(&estimate_key, None, false)
            .await?;

        let mut estimates: BTreeMap<String, Observation> = BTreeMap::new();
        for source in sources {
            match AuthorityResolver::select(&candidates, Some(source)) {
                Ok(Some(obs)) => {
                    estimates.insert(source.clone(), obs.clone());
                }
                // absent vendor: omitted from the result map
                Ok(None) | Err(EngineError::AmbiguousSource { .. }) => {
                    debug!(source = source.as_str(), "no estimate from source");
                }
                Err(other) => return Err(other),
            }
        }

        let mut surprises: BTreeMap<String, Decimal> = BTreeMap::new();
        for (source, estimate) in &estimates {
            if estimate.value.is_zero() {
                continue;
            }
            surprises.insert(
                source.clone(),
                (actual.value - estimate.value) / estimate.value.abs(),
            );
        }

        let spread = spread_of(estimates.values().map(|o| o.value).collect());

        // BTreeMap iterates lexically, so strict `<` keeps the first (lexically
        // smallest) name on ties.
        let most_accurate_source = surprises
            .iter()
            .fold(None::<(&String, Decimal)>, |best, (source, surprise)| {
                let magnitude = surprise.abs();
                match best {
                    Some((_, best_magnitude)) if best_magnitude <= magnitude => best,
                    _ => Some((source, magnitude)),
                }
            })
            .map(|(source, _)| source.clone());

        Ok(SourceComparison {
            estimates,
            actual,
            surprises,
            spread,
            most_accurate_source,
        })
    }
}

fn spread_of(mut values: Vec<Decimal>) -> Option<ConsensusSpread> {
    if values.is_empty() {
        return None;
    }
    values.sort_unstable();
    let count = values.len();
    let low = values[0];
    let high = values[count - 1];
    let sum: Decimal = values.iter().copied().sum();
    let mean = sum / Decimal::from(count);
    let median = if count % 2 == 1 {
        values[count / 2]
    } else {
        (values[count / 2 - 1] + values[count / 2]) / Decimal::TWO
    };
    let stdev = if count < 2 {
        0.0
    } else {
        let mean_f = mean.to_f64().unwrap_or(0.0);
        let variance = values
            .iter()
            .map(|v| {
                let d = v.to_f64().unwrap_or(0.0) - mean_f;
                d * d
            })
            .sum::<f64>()
            / (count - 1) as f64;
        variance.sqrt()
    };
    Some(ConsensusSpread {
        high,
        low,
        mean,
        median,
        stdev,
        count,
    })
}
