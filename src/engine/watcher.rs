//! Transition detection over the observation store.
//!
//! A polling loop that diffs the store against a high-water mark and emits
//! transition events for new actuals, estimate revisions, and date
//! revisions. Cancellation takes effect between ticks only: a batch is
//! classified atomically, never suspended halfway through.

use crate::engine::compare::{CompareRequest, ComparisonEngine, ResolveSpec};
use crate::error::EngineError;
use crate::models::{
    Observation, ObservationKey, Scope, TransitionEvent, TransitionKind,
};
use crate::store::{ObservationFilter, ObservationStore};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct WatcherConfig {
    pub poll_interval: Duration,
    /// Suppress events whose surprise magnitude is below this threshold.
    /// Events with no computable surprise always pass. The high-water mark
    /// advances regardless.
    pub min_surprise_pct: Option<Decimal>,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            min_surprise_pct: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    Idle,
    Polling,
    Emitting,
}

#[derive(Debug, Clone)]
struct SeenEntry {
    id: Uuid,
    value: Decimal,
    as_of: DateTime<Utc>,
}

pub struct TransitionWatcher {
    store: Arc<dyn ObservationStore>,
    engine: ComparisonEngine,
    config: WatcherConfig,
    high_water: Option<DateTime<Utc>>,
    seen: HashMap<ObservationKey, SeenEntry>,
    state: WatcherState,
    events: broadcast::Sender<TransitionEvent>,
}

impl TransitionWatcher {
    pub fn new(store: Arc<dyn ObservationStore>, config: WatcherConfig) -> Self {
        let engine = ComparisonEngine::new(store.clone());
        let (events, _) = broadcast::channel(1000);
        Self {
            store,
            engine,
            config,
            high_water: None,
            seen: HashMap::new(),
            state: WatcherState::Idle,
            events,
        }
    }

    /// Start detection from `mark` instead of replaying the whole store
    pub fn with_high_water(mut self, mark: DateTime<Utc>) -> Self {
        self.high_water = Some(mark);
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransitionEvent> {
        self.events.subscribe()
    }

    pub fn sender(&self) -> broadcast::Sender<TransitionEvent> {
        self.events.clone()
    }

    pub fn state(&self) -> WatcherState {
        self.state
    }

    pub fn high_water(&self) -> Option<DateTime<Utc>> {
        self.high_water
    }

    /// Poll until `shutdown` flips true. The shutdown check sits between
    /// ticks; an in-flight batch always classifies to completion.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            interval_secs = self.config.poll_interval.as_secs(),
            "transition watcher started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.poll_once().await {
                        Ok(events) if !events.is_empty() => {
                            debug!(count = events.len(), "transition events emitted");
                        }
                        Ok(_) => {}
                        Err(e) => warn!("transition poll failed: {}", e),
                    }
                }
                changed = shutdown.changed() => {
                    // a dropped sender counts as shutdown
                    if changed.is_err() || *shutdown.borrow() {
                        info!("transition watcher stopping");
                        break;
                    }
                }
            }
        }
        self.state = WatcherState::Idle;
    }

    /// One poll tick: scan past the high-water mark, classify the batch,
    /// emit what survives the surprise filter, advance the mark.
    pub async fn poll_once(&mut self) -> Result<Vec<TransitionEvent>, EngineError> {
        self.state = WatcherState::Polling;

        let filter = ObservationFilter {
            as_of_after: self.high_water,
            ..Default::default()
        };
        let mut rows = self.store.query(&filter).await?;
        // classify in announcement order; stable sort keeps insertion order
        // for simultaneous observations
        rows.sort_by_key(|o| o.as_of);

        let mut emitted = Vec::new();
        let mut max_as_of = self.high_water;
        for obs in rows {
            if max_as_of.map_or(true, |m| obs.as_of > m) {
                max_as_of = Some(obs.as_of);
            }
            if let Some(event) = self.classify(&obs).await? {
                if self.suppressed(&event) {
                    debug!(
                        entity = event.entity_id.as_str(),
                        kind = event.kind.as_str(),
                        "event below surprise threshold"
                    );
                } else {
                    let _ = self.events.send(event.clone());
                    emitted.push(event);
                }
            }
        }

        self.high_water = max_as_of;
        self.state = if emitted.is_empty() {
            WatcherState::Idle
        } else {
            WatcherState::Emitting
        };
        Ok(emitted)
    }

    async fn classify(
        &mut self,
        obs: &Observation,
    ) -> Result<Option<TransitionEvent>, EngineError> {
        let key = obs.key();
        let previous = self.seen.get(&key).cloned();
        self.seen.insert(
            key.clone(),
            SeenEntry {
                id: obs.id,
                value: obs.value,
                as_of: obs.as_of,
            },
        );

        let event = match (obs.metric.scope, previous) {
            (Scope::Reported, None) => Some(TransitionEvent {
                entity_id: obs.entity_id.clone(),
                metric_code: obs.metric.code.clone(),
                period: obs.period,
                observed_at: obs.as_of,
                kind: TransitionKind::NewActual,
                previous_id: None,
                new_id: obs.id,
                value: obs.value,
                previous_value: None,
                surprise_pct: self.surprise_for(obs).await,
            }),
            (Scope::Reported, Some(prev)) if prev.value == obs.value => {
                // same value re-asserted later: a date/timing revision
                Some(TransitionEvent {
                    entity_id: obs.entity_id.clone(),
                    metric_code: obs.metric.code.clone(),
                    period: obs.period,
                    observed_at: obs.as_of,
                    kind: TransitionKind::DateRevised,
                    previous_id: Some(prev.id),
                    new_id: obs.id,
                    value: obs.value,
                    previous_value: Some(prev.value),
                    surprise_pct: None,
                })
            }
            (Scope::Reported, Some(prev)) => {
                // restatement: treat as a fresh actual
                Some(TransitionEvent {
                    entity_id: obs.entity_id.clone(),
                    metric_code: obs.metric.code.clone(),
                    period: obs.period,
                    observed_at: obs.as_of,
                    kind: TransitionKind::NewActual,
                    previous_id: Some(prev.id),
                    new_id: obs.id,
                    value: obs.value,
                    previous_value: Some(prev.value),
                    surprise_pct: self.surprise_for(obs).await,
                })
            }
            (Scope::Consensus, Some(prev)) if prev.value != obs.value => {
                Some(TransitionEvent {
                    entity_id: obs.entity_id.clone(),
                    metric_code: obs.metric.code.clone(),
                    period: obs.period,
                    observed_at: obs.as_of,
                    kind: TransitionKind::EstimateRevised,
                    previous_id: Some(prev.id),
                    new_id: obs.id,
                    value: obs.value,
                    previous_value: Some(prev.value),
                    surprise_pct: revision_pct(prev.value, obs.value),
                })
            }
            // first estimate sighting or unchanged estimate: tracked, no event
            (Scope::Consensus, _) => None,
        };

        Ok(event)
    }

    /// Surprise vs the pre-announcement estimate; None when no estimate or
    /// the comparison cannot be computed
    async fn surprise_for(&self, obs: &Observation) -> Option<Decimal> {
        let req = CompareRequest {
            entity_id: obs.entity_id.clone(),
            metric_code: obs.metric.code.clone(),
            period: obs.period,
            estimate: ResolveSpec::pre_announcement(obs.metric.basis),
            actual: ResolveSpec::authoritative(obs.metric.basis),
            include_yoy: false,
        };
        match self.engine.compare(&req).await {
            Ok(result) => result.surprise_pct,
            Err(_) => None,
        }
    }

    fn suppressed(&self, event: &TransitionEvent) -> bool {
        match (self.config.min_surprise_pct, event.surprise_pct) {
            (Some(min), Some(surprise)) => surprise.abs() < min.abs(),
            _ => false,
        }
    }
}

/// Relative size of an estimate revision; None for a zero previous value
fn revision_pct(previous: Decimal, current: Decimal) -> Option<Decimal> {
    if previous.is_zero() {
        None
    } else {
        Some((current - previous) / previous.abs())
    }
}
