//! Temporal "as of" resolution.
//!
//! Finds what was known about a fact at a given instant, never returning
//! anything from the future relative to that instant. Candidates are reduced
//! to the newest observation per vendor; ranking across vendors is the
//! authority resolver's job.

use crate::error::StoreError;
use crate::models::{Observation, ObservationKey};
use crate::store::{ObservationFilter, ObservationStore};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;

/// How to pick the instant an estimate (or actual) is resolved "as of"
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AsOfPolicy {
    /// Everything known now
    Latest,
    /// Everything known at an explicit instant (inclusive)
    At(DateTime<Utc>),
    /// The instant immediately before the corresponding actual became known.
    /// Resolution is strict: nothing with `as_of >= actual.as_of` qualifies.
    PreAnnouncement,
    /// A fixed offset before the actual's announcement (inclusive ceiling)
    OffsetBeforeActual(Duration),
}

#[derive(Clone)]
pub struct TemporalResolver {
    store: Arc<dyn ObservationStore>,
}

impl TemporalResolver {
    pub fn new(store: Arc<dyn ObservationStore>) -> Self {
        Self { store }
    }

    /// All candidates for `key` visible at `ceiling` (no ceiling = now),
    /// one observation per vendor: the latest each vendor had asserted by
    /// that instant. `strict` excludes observations at exactly the ceiling.
    ///
    /// Output preserves the order vendors first appear in the store, which
    /// keeps the downstream insertion-order tie-break deterministic.
    pub async fn resolve_candidates(
        &self,
        key: &ObservationKey,
        ceiling: Option<DateTime<Utc>>,
        strict: bool,
    ) -> Result<Vec<Observation>, StoreError> {
        let mut filter = ObservationFilter::for_key(key);
        filter.as_of_before = ceiling;
        let rows = self.store.query(&filter).await?;

        let mut best: HashMap<String, usize> = HashMap::new();
        let mut out: Vec<Observation> = Vec::new();
        for obs in rows {
            if strict {
                if let Some(ceiling) = ceiling {
                    if obs.as_of >= ceiling {
                        continue;
                    }
                }
            }
            match best.get(&obs.source.vendor) {
                Some(&idx) => {
                    // same vendor: newer as_of wins; equal as_of keeps the
                    // later insertion (a re-assertion supersedes)
                    if obs.as_of >= out[idx].as_of {
                        out[idx] = obs;
                    }
                }
                None => {
                    best.insert(obs.source.vendor.clone(), out.len());
                    out.push(obs);
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Basis, FiscalPeriod, MetricSpec, Observation, Scope, SourceRef};
    use crate::store::MemoryStore;
    use chrono::TimeZone;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn ts(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 10, day, hour, 0, 0).unwrap()
    }

    fn estimate(vendor: &str, value: Decimal, as_of: DateTime<Utc>) -> Observation {
        Observation::new(
            "aapl",
            MetricSpec::consensus("eps", Basis::Adjusted).per_share(),
            FiscalPeriod::quarterly(2024, 4),
            value,
            as_of,
            SourceRef::new(vendor, 70),
        )
    }

    fn key() -> ObservationKey {
        ObservationKey {
            entity_id: "aapl".into(),
            metric_code: "eps".into(),
            basis: Basis::Adjusted,
            scope: Scope::Consensus,
            period: FiscalPeriod::quarterly(2024, 4),
        }
    }

    #[tokio::test]
    async fn keeps_latest_per_vendor_under_ceiling() {
        let store = Arc::new(MemoryStore::new());
        store.store(estimate("factset", dec!(2.00), ts(10, 12))).await.unwrap();
        store.store(estimate("factset", dec!(2.10), ts(28, 12))).await.unwrap();
        store.store(estimate("factset", dec!(2.20), ts(31, 12))).await.unwrap();
        store.store(estimate("bloomberg", dec!(2.12), ts(27, 12))).await.unwrap();

        let resolver = TemporalResolver::new(store);
        let candidates = resolver
            .resolve_candidates(&key(), Some(ts(30, 0)), false)
            .await
            .unwrap();

        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].source.vendor, "factset");
        assert_eq!(candidates[0].value, dec!(2.10)); // Oct 31 revision invisible
        assert_eq!(candidates[1].value, dec!(2.12));
    }

    #[tokio::test]
    async fn strict_ceiling_excludes_boundary() {
        let store = Arc::new(MemoryStore::new());
        store.store(estimate("factset", dec!(2.10), ts(28, 12))).await.unwrap();

        let resolver = TemporalResolver::new(store);
        let inclusive = resolver
            .resolve_candidates(&key(), Some(ts(28, 12)), false)
            .await
            .unwrap();
        assert_eq!(inclusive.len(), 1);

        let strict = resolver
            .resolve_candidates(&key(), Some(ts(28, 12)), true)
            .await
            .unwrap();
        assert!(strict.is_empty());
    }

    #[tokio::test]
    async fn empty_when_nothing_known_yet() {
        let store = Arc::new(MemoryStore::new());
        store.store(estimate("factset", dec!(2.10), ts(28, 12))).await.unwrap();

        let resolver = TemporalResolver::new(store);
        let candidates = resolver
            .resolve_candidates(&key(), Some(ts(1, 0)), false)
            .await
            .unwrap();
        assert!(candidates.is_empty());
    }
}
