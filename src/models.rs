use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Accounting basis a metric value is stated on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Basis {
    Gaap,
    Adjusted,
    Operating,
}

impl Basis {
    pub fn as_str(&self) -> &'static str {
        match self {
            Basis::Gaap => "GAAP",
            Basis::Adjusted => "ADJUSTED",
            Basis::Operating => "OPERATING",
        }
    }
}

impl FromStr for Basis {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GAAP" => Ok(Basis::Gaap),
            "ADJUSTED" => Ok(Basis::Adjusted),
            "OPERATING" => Ok(Basis::Operating),
            other => Err(format!("unknown basis: {}", other)),
        }
    }
}

/// Whether an observation is a forward-looking estimate or a reported fact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Scope {
    Consensus,
    Reported,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Consensus => "CONSENSUS",
            Scope::Reported => "REPORTED",
        }
    }
}

impl FromStr for Scope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "CONSENSUS" => Ok(Scope::Consensus),
            "REPORTED" => Ok(Scope::Reported),
            other => Err(format!("unknown scope: {}", other)),
        }
    }
}

/// Primary facts come from vendors/filings; derived facts are computed here
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MetricCategory {
    Primary,
    Derived,
}

/// What a metric measures and on which basis
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MetricSpec {
    pub code: String,
    pub basis: Basis,
    pub scope: Scope,
    pub per_share: bool,
    pub category: MetricCategory,
    /// Decimal places of the metric's unit; bounds the tolerance when
    /// reconciling adjustment chains.
    pub precision: u32,
}

impl MetricSpec {
    pub fn reported(code: impl Into<String>, basis: Basis) -> Self {
        Self {
            code: code.into(),
            basis,
            scope: Scope::Reported,
            per_share: false,
            category: MetricCategory::Primary,
            precision: 4,
        }
    }

    pub fn consensus(code: impl Into<String>, basis: Basis) -> Self {
        Self {
            scope: Scope::Consensus,
            ..Self::reported(code, basis)
        }
    }

    pub fn per_share(mut self) -> Self {
        self.per_share = true;
        self
    }

    pub fn with_precision(mut self, precision: u32) -> Self {
        self.precision = precision;
        self
    }

    /// Canonical key, e.g. `eps:GAAP:REPORTED:ps`
    pub fn canonical_key(&self) -> String {
        let mut key = format!("{}:{}:{}", self.code, self.basis.as_str(), self.scope.as_str());
        if self.per_share {
            key.push_str(":ps");
        }
        key
    }
}

/// Fiscal period: a quarter or a full year
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FiscalPeriod {
    pub year: i32,
    pub quarter: Option<u8>,
}

impl FiscalPeriod {
    pub fn quarterly(year: i32, quarter: u8) -> Self {
        Self {
            year,
            quarter: Some(quarter),
        }
    }

    pub fn annual(year: i32) -> Self {
        Self {
            year,
            quarter: None,
        }
    }

    /// Same period one fiscal year earlier (YoY comparable)
    pub fn year_ago(&self) -> Self {
        Self {
            year: self.year - 1,
            quarter: self.quarter,
        }
    }
}

impl fmt::Display for FiscalPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.quarter {
            Some(q) => write!(f, "{}:Q{}", self.year, q),
            None => write!(f, "{}:FY", self.year),
        }
    }
}

impl FromStr for FiscalPeriod {
    type Err = String;

    /// Parses `2024:Q4`, `2024:FY`, or bare `2024`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (year_part, rest) = match s.split_once(':') {
            Some((y, r)) => (y, Some(r)),
            None => (s, None),
        };
        let year: i32 = year_part
            .parse()
            .map_err(|_| format!("invalid fiscal year in period: {}", s))?;
        match rest {
            None | Some("FY") | Some("fy") => Ok(FiscalPeriod::annual(year)),
            Some(q) => {
                let q = q
                    .trim_start_matches(['Q', 'q'])
                    .parse::<u8>()
                    .map_err(|_| format!("invalid quarter in period: {}", s))?;
                if !(1..=4).contains(&q) {
                    return Err(format!("quarter out of range in period: {}", s));
                }
                Ok(FiscalPeriod::quarterly(year, q))
            }
        }
    }
}

/// Who asserted an observation, and how much we trust them
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRef {
    pub vendor: String,
    pub feed: Option<String>,
    /// Opaque ordering key, 0-100. Never reinterpreted by the engine.
    pub authority: u8,
}

impl SourceRef {
    pub fn new(vendor: impl Into<String>, authority: u8) -> Self {
        Self {
            vendor: vendor.into(),
            feed: None,
            authority,
        }
    }

    pub fn with_feed(mut self, feed: impl Into<String>) -> Self {
        self.feed = Some(feed.into());
        self
    }
}

/// A named delta in an adjustment chain (e.g. stock comp added back)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Adjustment {
    pub kind: String,
    pub amount: Decimal,
    pub description: String,
}

impl Adjustment {
    pub fn new(kind: impl Into<String>, amount: Decimal, description: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            amount,
            description: description.into(),
        }
    }
}

/// Free-form extension record attached to an observation.
///
/// Typed accessors over an otherwise opaque key/value map; keeps vendor
/// extras (estimate counts, input ids for derived facts) out of the core
/// schema.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metadata(BTreeMap<String, serde_json::Value>);

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.0.insert(key.into(), value);
    }

    pub fn with(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.insert(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|v| v.as_str())
    }

    pub fn get_decimal(&self, key: &str) -> Option<Decimal> {
        self.0
            .get(key)
            .and_then(|v| v.as_str())
            .and_then(|s| Decimal::from_str(s).ok())
    }

    pub fn get_id(&self, key: &str) -> Option<Uuid> {
        self.0
            .get(key)
            .and_then(|v| v.as_str())
            .and_then(|s| Uuid::parse_str(s).ok())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Logical key: all observations for one fact share this
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObservationKey {
    pub entity_id: String,
    pub metric_code: String,
    pub basis: Basis,
    pub scope: Scope,
    pub period: FiscalPeriod,
}

impl fmt::Display for ObservationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}:{}:{}/{}",
            self.entity_id,
            self.metric_code,
            self.basis.as_str(),
            self.scope.as_str(),
            self.period
        )
    }
}

/// An immutable fact: one entity/metric/period as asserted by one source at
/// one instant. Never mutated; superseded observations stay queryable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub id: Uuid,
    pub entity_id: String,
    pub metric: MetricSpec,
    pub period: FiscalPeriod,
    pub value: Decimal,
    pub currency: Option<String>,
    /// The instant this fact became known. NOT the fiscal period end.
    pub as_of: DateTime<Utc>,
    pub source: SourceRef,
    pub adjustments: Vec<Adjustment>,
    pub derived_from: Option<Uuid>,
    pub metadata: Metadata,
}

impl Observation {
    pub fn new(
        entity_id: impl Into<String>,
        metric: MetricSpec,
        period: FiscalPeriod,
        value: Decimal,
        as_of: DateTime<Utc>,
        source: SourceRef,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            entity_id: entity_id.into(),
            metric,
            period,
            value,
            currency: None,
            as_of,
            source,
            adjustments: Vec::new(),
            derived_from: None,
            metadata: Metadata::new(),
        }
    }

    pub fn with_currency(mut self, currency: impl Into<String>) -> Self {
        self.currency = Some(currency.into());
        self
    }

    pub fn with_adjustments(mut self, adjustments: Vec<Adjustment>) -> Self {
        self.adjustments = adjustments;
        self
    }

    pub fn derived_from(mut self, origin: Uuid) -> Self {
        self.derived_from = Some(origin);
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn key(&self) -> ObservationKey {
        ObservationKey {
            entity_id: self.entity_id.clone(),
            metric_code: self.metric.code.clone(),
            basis: self.metric.basis,
            scope: self.metric.scope,
            period: self.period,
        }
    }
}

/// Outcome of an estimate-vs-actual comparison
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Direction {
    Beat,
    Miss,
    Inline,
    NoEstimate,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Beat => "BEAT",
            Direction::Miss => "MISS",
            Direction::Inline => "INLINE",
            Direction::NoEstimate => "NO_ESTIMATE",
        }
    }
}

/// Derived result of one compare() run. Not persisted unless materialized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonResult {
    pub entity_id: String,
    pub metric_code: String,
    pub period: FiscalPeriod,
    pub estimate: Option<Observation>,
    pub actual: Observation,
    pub comparable: Option<Observation>,
    pub difference: Option<Decimal>,
    pub surprise_pct: Option<Decimal>,
    pub beat: Option<bool>,
    pub direction: Direction,
    pub yoy_growth_pct: Option<Decimal>,
}

/// What kind of change the watcher detected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransitionKind {
    NewActual,
    EstimateRevised,
    DateRevised,
}

impl TransitionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransitionKind::NewActual => "NEW_ACTUAL",
            TransitionKind::EstimateRevised => "ESTIMATE_REVISED",
            TransitionKind::DateRevised => "DATE_REVISED",
        }
    }
}

/// Ephemeral event emitted by the transition watcher
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionEvent {
    pub entity_id: String,
    pub metric_code: String,
    pub period: FiscalPeriod,
    pub observed_at: DateTime<Utc>,
    pub kind: TransitionKind,
    pub previous_id: Option<Uuid>,
    pub new_id: Uuid,
    pub value: Decimal,
    pub previous_value: Option<Decimal>,
    pub surprise_pct: Option<Decimal>,
}
