//! Estimate-vs-actual comparison.
//!
//! Surprise math is zero-tolerance: `beat` is strict `actual > estimate`,
//! equality is always INLINE. A missing estimate is a valid outcome
//! (direction NO_ESTIMATE); a missing actual is a hard failure.

use crate::engine::authority::AuthorityResolver;
use crate::engine::temporal::{AsOfPolicy, TemporalResolver};
use crate::error::EngineError;
use crate::models::{
    Basis, ComparisonResult, Direction, FiscalPeriod, Observation, ObservationKey, Scope,
};
use crate::store::{ObservationFilter, ObservationStore};
use rust_decimal::Decimal;
use std::sync::Arc;

/// How to resolve one leg (estimate or actual) of a comparison
#[derive(Debug, Clone)]
pub struct ResolveSpec {
    pub basis: Basis,
    /// Explicit vendor, or None for "authoritative"
    pub source: Option<String>,
    pub as_of: AsOfPolicy,
}

impl ResolveSpec {
    pub fn authoritative(basis: Basis) -> Self {
        Self {
            basis,
            source: None,
            as_of: AsOfPolicy::Latest,
        }
    }

    pub fn pre_announcement(basis: Basis) -> Self {
        Self {
            as_of: AsOfPolicy::PreAnnouncement,
            ..Self::authoritative(basis)
        }
    }

    pub fn from_source(mut self, vendor: impl Into<String>) -> Self {
        self.source = Some(vendor.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct CompareRequest {
    pub entity_id: String,
    pub metric_code: String,
    pub period: FiscalPeriod,
    pub estimate: ResolveSpec,
    pub actual: ResolveSpec,
    pub include_yoy: bool,
}

impl CompareRequest {
    /// Pre-announcement consensus vs authoritative reported, both on `basis`
    pub fn standard(
        entity_id: impl Into<String>,
        metric_code: impl Into<String>,
        period: FiscalPeriod,
        basis: Basis,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            metric_code: metric_code.into(),
            period,
            estimate: ResolveSpec::pre_announcement(basis),
            actual: ResolveSpec::authoritative(basis),
            include_yoy: false,
        }
    }

    pub fn with_yoy(mut self) -> Self {
        self.include_yoy = true;
        self
    }
}

#[derive(Clone)]
pub struct ComparisonEngine {
    store: Arc<dyn ObservationStore>,
    temporal: TemporalResolver,
}

impl ComparisonEngine {
    pub fn new(store: Arc<dyn ObservationStore>) -> Self {
        let temporal = TemporalResolver::new(store.clone());
        Self { store, temporal }
    }

    pub fn store(&self) -> &Arc<dyn ObservationStore> {
        &self.store
    }

    /// Resolve actual, estimate, and optional YoY comparable, then compute
    /// the surprise. Deterministic for an unchanged store.
    pub async fn compare(&self, req: &CompareRequest) -> Result<ComparisonResult, EngineError> {
        // Actual first: the estimate's ceiling may depend on its as_of.
        let actual_key = ObservationKey {
            entity_id: req.entity_id.clone(),
            metric_code: req.metric_code.clone(),
            basis: req.actual.basis,
            scope: Scope::Reported,
            period: req.period,
        };
        let actual = self
            .resolve_reported(&actual_key, &req.actual)
            .await?
            .ok_or_else(|| EngineError::NoActual {
                key: actual_key.clone(),
            })?;

        let estimate_key = ObservationKey {
            entity_id: req.entity_id.clone(),
            metric_code: req.metric_code.clone(),
            basis: req.estimate.basis,
            scope: Scope::Consensus,
            period: req.period,
        };
        let (ceiling, strict) = match req.estimate.as_of {
            AsOfPolicy::Latest => (None, false),
            AsOfPolicy::At(ts) => (Some(ts), false),
            AsOfPolicy::PreAnnouncement => (Some(actual.as_of), true),
            AsOfPolicy::OffsetBeforeActual(offset) => (Some(actual.as_of - offset), false),
        };
        let candidates = self
            .temporal
            .resolve_candidates(&estimate_key, ceiling, strict)
            .await?;
        let estimate =
            AuthorityResolver::select(&candidates, req.estimate.source.as_deref())?.cloned();

        let comparable = if req.include_yoy {
            let comparable_key = ObservationKey {
                period: req.period.year_ago(),
                ..actual_key.clone()
            };
            self.resolve_reported(&comparable_key, &req.actual).await?
        } else {
            None
        };

        Ok(build_result(
            req.entity_id.clone(),
            req.metric_code.clone(),
            req.period,
            estimate,
            actual,
            comparable,
        ))
    }

    /// Restartable batch comparison over every entity with an actual in the
    /// period. Entities lacking an actual are excluded during iteration;
    /// entities lacking an estimate are emitted with NO_ESTIMATE.
    pub async fn compare_all(&self, req: BatchRequest) -> Result<BatchCursor, EngineError> {
        let entities = match &req.entity_ids {
            Some(ids) => {
                let mut ids = ids.clone();
                ids.sort_unstable();
                ids.dedup();
                ids
            }
            None => {
                let filter = ObservationFilter {
                    metric_code: Some(req.metric_code.clone()),
                    basis: Some(req.actual.basis),
                    scope: Some(Scope::Reported),
                    period: Some(req.period),
                    ..Default::default()
                };
                self.store.entities_matching(&filter).await?
            }
        };
        Ok(BatchCursor {
            engine: self.clone(),
            request: req,
            entities,
            pos: 0,
        })
    }

    /// Resolve one REPORTED-scope observation (actual or YoY comparable)
    async fn resolve_reported(
        &self,
        key: &ObservationKey,
        spec: &ResolveSpec,
    ) -> Result<Option<Observation>, EngineError> {
        // PreAnnouncement/Offset are estimate policies; the reported leg
        // resolves as "latest" unless an explicit instant is given.
        let ceiling = match spec.as_of {
            AsOfPolicy::At(ts) => Some(ts),
            _ => None,
        };
        let candidates = self.temporal.resolve_candidates(key, ceiling, false).await?;
        Ok(AuthorityResolver::select(&candidates, spec.source.as_deref())?.cloned())
    }
}

/// Pure computation of the comparison payload from resolved observations
fn build_result(
    entity_id: String,
    metric_code: String,
    period: FiscalPeriod,
    estimate: Option<Observation>,
    actual: Observation,
    comparable: Option<Observation>,
) -> ComparisonResult {
    let (difference, surprise_pct, beat, direction) = match &estimate {
        None => (None, None, None, Direction::NoEstimate),
        Some(est) => {
            let difference = actual.value - est.value;
            let beat = actual.value > est.value;
            let (surprise_pct, direction) = if est.value.is_zero() {
                // Undefined surprise: INLINE on exact equality, otherwise a
                // sign-only qualitative flag. Never a silent divide-by-zero.
                let direction = if actual.value.is_zero() {
                    Direction::Inline
                } else if actual.value > Decimal::ZERO {
                    Direction::Beat
                } else {
                    Direction::Miss
                };
                (None, direction)
            } else {
                let pct = difference / est.value.abs();
                let direction = if difference.is_zero() {
                    Direction::Inline
                } else if beat {
                    Direction::Beat
                } else {
                    Direction::Miss
                };
                (Some(pct), direction)
            };
            (Some(difference), surprise_pct, Some(beat), direction)
        }
    };

    let yoy_growth_pct = comparable.as_ref().and_then(|prior| {
        if prior.value.is_zero() {
            None
        } else {
            Some((actual.value - prior.value) / prior.value.abs())
        }
    });

    ComparisonResult {
        entity_id,
        metric_code,
        period,
        estimate,
        actual,
        comparable,
        difference,
        surprise_pct,
        beat,
        direction,
        yoy_growth_pct,
    }
}

#[derive(Debug, Clone)]
pub struct BatchRequest {
    pub period: FiscalPeriod,
    pub metric_code: String,
    /// Explicit entity list; None scans every entity with an actual
    pub entity_ids: Option<Vec<String>>,
    pub estimate: ResolveSpec,
    pub actual: ResolveSpec,
    pub include_yoy: bool,
}

impl BatchRequest {
    pub fn standard(period: FiscalPeriod, metric_code: impl Into<String>, basis: Basis) -> Self {
        Self {
            period,
            metric_code: metric_code.into(),
            entity_ids: None,
            estimate: ResolveSpec::pre_announcement(basis),
            actual: ResolveSpec::authoritative(basis),
            include_yoy: false,
        }
    }
}

/// Lazy pull cursor over per-entity comparison results.
///
/// Restartable (`reset`) and pausable: state is only the entity snapshot and
/// a position, so callers may stop between items without side effects.
/// Per-item failures come back in-band so batch consumers can skip and
/// continue.
pub struct BatchCursor {
    engine: ComparisonEngine,
    request: BatchRequest,
    entities: Vec<String>,
    pos: usize,
}

impl BatchCursor {
    /// Next comparison, skipping entities with no actual in the period
    pub async fn next(&mut self) -> Option<Result<ComparisonResult, EngineError>> {
        while self.pos < self.entities.len() {
            let entity_id = self.entities[self.pos].clone();
            self.pos += 1;

            let req = CompareRequest {
                entity_id,
                metric_code: self.request.metric_code.clone(),
                period: self.request.period,
                estimate: self.request.estimate.clone(),
                actual: self.request.actual.clone(),
                include_yoy: self.request.include_yoy,
            };
            match self.engine.compare(&req).await {
                // no actual: excluded from the batch, not an empty result
                Err(EngineError::NoActual { .. }) => continue,
                other => return Some(other),
            }
        }
        None
    }

    /// Rewind to the first entity; the entity snapshot is unchanged
    pub fn reset(&mut self) {
        self.pos = 0;
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Collect the remaining items, splitting results from per-item errors
    pub async fn collect_remaining(
        &mut self,
    ) -> (Vec<ComparisonResult>, Vec<EngineError>) {
        let mut results = Vec::new();
        let mut errors = Vec::new();
        while let Some(item) = self.next().await {
            match item {
                Ok(result) => results.push(result),
                Err(err) => errors.push(err),
            }
        }
        (results, errors)
    }
}
