//! End-to-end engine behavior over the in-memory store.

use obspine::engine::{
    BatchRequest, CompareRequest, ComparisonEngine, DerivedGenerator, LineageTracker,
    ResolveSpec, SourceReconciler, TransitionWatcher, WatcherConfig,
};
use obspine::error::EngineError;
use obspine::models::{
    Adjustment, Basis, Direction, FiscalPeriod, MetricSpec, Observation, SourceRef,
    TransitionKind,
};
use obspine::registry::SourceRegistry;
use obspine::store::{MemoryStore, ObservationStore};
use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;

const Q4: FiscalPeriod = FiscalPeriod {
    year: 2024,
    quarter: Some(4),
};

fn ts(day: u32, hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 10, day, hour, 0, 0).unwrap()
}

fn estimate(entity: &str, value: Decimal, as_of: DateTime<Utc>, vendor: &str) -> Observation {
    Observation::new(
        entity,
        MetricSpec::consensus("eps", Basis::Adjusted).per_share(),
        Q4,
        value,
        as_of,
        SourceRef::new(vendor, 70),
    )
}

fn actual(entity: &str, value: Decimal, as_of: DateTime<Utc>) -> Observation {
    Observation::new(
        entity,
        MetricSpec::reported("eps", Basis::Adjusted).per_share(),
        Q4,
        value,
        as_of,
        SourceRef::new("sec", 100),
    )
}

/// The canonical announcement sequence: estimate $2.10 on Oct 28, actual
/// $2.18 on Oct 31.
async fn seeded() -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    store
        .store(estimate("aapl", dec!(2.10), ts(28, 12), "factset"))
        .await
        .unwrap();
    store
        .store(actual("aapl", dec!(2.18), ts(31, 21)))
        .await
        .unwrap();
    store
}

#[tokio::test]
async fn beat_miss_inline_invariants_hold() {
    let engine = ComparisonEngine::new(seeded().await);
    let result = engine
        .compare(&CompareRequest::standard("aapl", "eps", Q4, Basis::Adjusted))
        .await
        .unwrap();

    // beat is non-null exactly when an estimate resolved
    assert!(result.estimate.is_some());
    assert_eq!(result.beat, Some(true));
    assert_eq!(result.direction, Direction::Beat);
    let surprise = result.surprise_pct.unwrap();
    assert!((surprise - dec!(0.0381)).abs() < dec!(0.0001));
}

#[tokio::test]
async fn equality_is_inline_never_beat() {
    let store = Arc::new(MemoryStore::new());
    store
        .store(estimate("aapl", dec!(2.10), ts(28, 12), "factset"))
        .await
        .unwrap();
    store
        .store(actual("aapl", dec!(2.10), ts(31, 21)))
        .await
        .unwrap();

    let engine = ComparisonEngine::new(store);
    let result = engine
        .compare(&CompareRequest::standard("aapl", "eps", Q4, Basis::Adjusted))
        .await
        .unwrap();
    assert_eq!(result.beat, Some(false));
    assert_eq!(result.direction, Direction::Inline);
    assert_eq!(result.surprise_pct, Some(Decimal::ZERO));
}

#[tokio::test]
async fn no_estimate_surfaces_as_state() {
    let store = Arc::new(MemoryStore::new());
    store
        .store(actual("smallcap123", dec!(0.50), ts(31, 21)))
        .await
        .unwrap();

    let engine = ComparisonEngine::new(store);
    let result = engine
        .compare(&CompareRequest::standard(
            "smallcap123",
            "eps",
            Q4,
            Basis::Adjusted,
        ))
        .await
        .unwrap();
    assert!(result.estimate.is_none());
    assert_eq!(result.beat, None);
    assert_eq!(result.surprise_pct, None);
    assert_eq!(result.direction, Direction::NoEstimate);
}

#[tokio::test]
async fn pre_announcement_ceiling_is_strict() {
    let store = seeded().await;
    // estimate revised upward at the exact announcement instant and after;
    // neither may leak into the pre-announcement view
    store
        .store(estimate("aapl", dec!(2.17), ts(31, 21), "factset"))
        .await
        .unwrap();
    store
        .store(estimate("aapl", dec!(2.18), ts(31, 23), "factset"))
        .await
        .unwrap();

    let engine = ComparisonEngine::new(store);
    let result = engine
        .compare(&CompareRequest::standard("aapl", "eps", Q4, Basis::Adjusted))
        .await
        .unwrap();

    let est = result.estimate.unwrap();
    assert_eq!(est.value, dec!(2.10));
    assert!(est.as_of < result.actual.as_of);
}

#[tokio::test]
async fn unknown_source_filter_is_ambiguous() {
    let engine = ComparisonEngine::new(seeded().await);
    let mut req = CompareRequest::standard("aapl", "eps", Q4, Basis::Adjusted);
    req.estimate = ResolveSpec::pre_announcement(Basis::Adjusted).from_source("bloomberg");

    match engine.compare(&req).await {
        Err(EngineError::AmbiguousSource {
            requested,
            available,
        }) => {
            assert_eq!(requested, "bloomberg");
            assert!(available.contains("factset"));
        }
        other => panic!("expected AmbiguousSource, got {:?}", other),
    }
}

#[tokio::test]
async fn reconciler_names_bloomberg_most_accurate() {
    let store = seeded().await;
    store
        .store(estimate("aapl", dec!(2.12), ts(29, 12), "bloomberg"))
        .await
        .unwrap();

    let reconciler = SourceReconciler::new(store);
    let result = reconciler
        .compare_sources(
            "aapl",
            "eps",
            Q4,
            Basis::Adjusted,
            &["factset".to_string(), "bloomberg".to_string()],
        )
        .await
        .unwrap();

    assert_eq!(result.most_accurate_source.as_deref(), Some("bloomberg"));
    assert_eq!(result.estimates.len(), 2);
    assert_eq!(result.surprises.len(), 2);
}

#[tokio::test]
async fn lineage_round_trips_through_derived_chain() {
    let store = Arc::new(MemoryStore::new());
    let gaap = Observation::new(
        "aapl",
        MetricSpec::reported("eps", Basis::Gaap).per_share().with_precision(2),
        Q4,
        dec!(1.80),
        ts(31, 21),
        SourceRef::new("sec", 100),
    );
    let gaap_id = store.store(gaap).await.unwrap();
    let adjusted = Observation::new(
        "aapl",
        MetricSpec::reported("eps", Basis::Adjusted).per_share().with_precision(2),
        Q4,
        dec!(2.10),
        ts(31, 21),
        SourceRef::new("sec", 100),
    )
    .derived_from(gaap_id)
    .with_adjustments(vec![
        Adjustment::new("stock_comp", dec!(0.22), "SBC addback"),
        Adjustment::new("restructuring", dec!(0.08), "one-time"),
    ]);
    let adjusted_id = store.store(adjusted).await.unwrap();

    let tracker = LineageTracker::new(store);
    let lineage = tracker.lineage(adjusted_id).await.unwrap();
    assert_eq!(
        lineage.origin.value + lineage.adjustment_total(),
        lineage.final_observation.value
    );
}

#[tokio::test]
async fn compare_is_deterministic_and_batch_restartable() {
    let store = seeded().await;
    store
        .store(actual("nvda", dec!(0.81), ts(30, 21)))
        .await
        .unwrap();

    let engine = ComparisonEngine::new(store);
    let req = BatchRequest::standard(Q4, "eps", Basis::Adjusted);

    let mut first = engine.compare_all(req.clone()).await.unwrap();
    let (results_a, errors_a) = first.collect_remaining().await;
    let mut second = engine.compare_all(req).await.unwrap();
    let (results_b, errors_b) = second.collect_remaining().await;

    assert!(errors_a.is_empty() && errors_b.is_empty());
    assert_eq!(results_a, results_b);
    assert_eq!(results_a.len(), 2);
}

#[tokio::test]
async fn derived_surprise_feeds_back_and_reconciles() {
    let store = seeded().await;
    let engine = ComparisonEngine::new(store.clone());
    let result = engine
        .compare(&CompareRequest::standard("aapl", "eps", Q4, Basis::Adjusted))
        .await
        .unwrap();

    let registry = SourceRegistry::with_defaults(10);
    let generator = DerivedGenerator::new(store.clone(), &registry);
    let id = generator.materialize(&result).await.unwrap().unwrap();

    let derived = store.get(id).await.unwrap().unwrap();
    assert_eq!(derived.metric.code, "eps_surprise");
    assert!(derived.source.authority < 50);

    // a surprise fact is its own lineage origin: the inputs are audit
    // metadata, not an adjustment chain, so the sum law still holds
    assert_eq!(derived.derived_from, None);
    assert_eq!(derived.metadata.get_id("actual_id"), Some(result.actual.id));
    let tracker = LineageTracker::new(store);
    let lineage = tracker.lineage(id).await.unwrap();
    assert_eq!(lineage.origin.id, id);
    assert!(lineage.hops.is_empty());
    assert_eq!(
        lineage.origin.value + lineage.adjustment_total(),
        lineage.final_observation.value
    );
}

#[tokio::test]
async fn watcher_sees_full_announcement_cycle() {
    let store = Arc::new(MemoryStore::new());
    let mut watcher = TransitionWatcher::new(store.clone(), WatcherConfig::default());

    store
        .store(estimate("aapl", dec!(2.05), ts(20, 12), "factset"))
        .await
        .unwrap();
    assert!(watcher.poll_once().await.unwrap().is_empty());

    store
        .store(estimate("aapl", dec!(2.10), ts(28, 12), "factset"))
        .await
        .unwrap();
    let revised = watcher.poll_once().await.unwrap();
    assert_eq!(revised.len(), 1);
    assert_eq!(revised[0].kind, TransitionKind::EstimateRevised);

    store
        .store(actual("aapl", dec!(2.18), ts(31, 21)))
        .await
        .unwrap();
    let announced = watcher.poll_once().await.unwrap();
    assert_eq!(announced.len(), 1);
    assert_eq!(announced[0].kind, TransitionKind::NewActual);
    // surprise against the pre-announcement estimate
    let surprise = announced[0].surprise_pct.unwrap();
    assert!((surprise - dec!(0.0381)).abs() < dec!(0.0001));

    assert_eq!(watcher.high_water(), Some(ts(31, 21)));
}
