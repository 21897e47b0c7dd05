use crate::models::ObservationKey;
use rust_decimal::Decimal;
use thiserror::Error;
use uuid::Uuid;

/// Failures raised by an observation store implementation
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("observation store unavailable: {0}")]
    Unavailable(String),

    #[error("store query failed: {0}")]
    Query(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Query(err.to_string())
    }
}

/// Engine error taxonomy.
///
/// A missing estimate is never an error: `compare()` folds it into
/// `estimate = None` / `direction = NO_ESTIMATE`.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// Cannot compare without ground truth. Fatal for a single comparison.
    #[error("no actual observation for {key}")]
    NoActual { key: ObservationKey },

    /// The requested source was not among the candidates. Fatal for that
    /// single lookup only.
    #[error("source '{requested}' not found among candidates [{available}]")]
    AmbiguousSource {
        requested: String,
        available: String,
    },

    /// Chain sum mismatch. Surfaced, never silently reconciled.
    #[error(
        "adjustment chain for {observation_id} does not reconcile: \
         origin + adjustments = {reconstructed}, final = {declared}"
    )]
    AdjustmentIntegrity {
        observation_id: Uuid,
        reconstructed: Decimal,
        declared: Decimal,
    },

    #[error("observation {0} not found")]
    ObservationNotFound(Uuid),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl EngineError {
    /// Stable taxonomy code used in the REST error envelope
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::NoActual { .. } => "NO_ACTUAL",
            EngineError::AmbiguousSource { .. } => "AMBIGUOUS_SOURCE",
            EngineError::AdjustmentIntegrity { .. } => "ADJUSTMENT_INTEGRITY",
            EngineError::ObservationNotFound(_) => "OBSERVATION_NOT_FOUND",
            EngineError::Store(_) => "STORE_UNAVAILABLE",
        }
    }
}
