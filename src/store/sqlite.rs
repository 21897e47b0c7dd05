//! SQLite-backed observation store.
//!
//! WAL mode for concurrent reads during writes, insertion order preserved
//! through rowid. `as_of` is stored as fixed-width RFC 3339 UTC so lexical
//! comparison in SQL matches chronological order.

use crate::error::StoreError;
use crate::models::{
    Adjustment, Basis, FiscalPeriod, Metadata, MetricCategory, MetricSpec, Observation,
    ObservationKey, Scope, SourceRef,
};
use crate::store::{ObservationFilter, ObservationStore, StoreStats};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags, Row};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA temp_store = MEMORY;

CREATE TABLE IF NOT EXISTS observations (
    id TEXT NOT NULL UNIQUE,
    entity_id TEXT NOT NULL,
    metric_code TEXT NOT NULL,
    basis TEXT NOT NULL,
    scope TEXT NOT NULL,
    per_share INTEGER NOT NULL,
    category TEXT NOT NULL,
    precision INTEGER NOT NULL,
    period_year INTEGER NOT NULL,
    period_quarter INTEGER,
    value TEXT NOT NULL,
    currency TEXT,
    as_of TEXT NOT NULL,
    vendor TEXT NOT NULL,
    feed TEXT,
    authority INTEGER NOT NULL,
    adjustments_json TEXT NOT NULL,
    derived_from TEXT,
    metadata_json TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_obs_key
    ON observations(entity_id, metric_code, period_year, period_quarter, scope, basis);

CREATE INDEX IF NOT EXISTS idx_obs_as_of
    ON observations(as_of);

CREATE INDEX IF NOT EXISTS idx_obs_vendor
    ON observations(vendor, as_of);
"#;

pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open(db_path: &str) -> Result<Self, StoreError> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;

        let conn = Connection::open_with_flags(db_path, flags)
            .map_err(|e| StoreError::Unavailable(format!("{}: {}", db_path, e)))?;

        conn.execute_batch(SCHEMA_SQL)?;

        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap_or_default();
        if journal_mode.to_lowercase() != "wal" {
            warn!("WAL mode not active, journal_mode = {}", journal_mode);
        }

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM observations", [], |row| row.get(0))
            .unwrap_or(0);
        info!("observation store opened at {} ({} rows)", db_path, count);

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn insert(conn: &Connection, obs: &Observation) -> Result<(), StoreError> {
        let adjustments_json = serde_json::to_string(&obs.adjustments)
            .map_err(|e| StoreError::Query(e.to_string()))?;
        let metadata_json = serde_json::to_string(&obs.metadata)
            .map_err(|e| StoreError::Query(e.to_string()))?;

        conn.execute(
            r#"INSERT INTO observations (
                id, entity_id, metric_code, basis, scope, per_share, category, precision,
                period_year, period_quarter, value, currency, as_of,
                vendor, feed, authority, adjustments_json, derived_from, metadata_json
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)"#,
            params![
                obs.id.to_string(),
                obs.entity_id,
                obs.metric.code,
                obs.metric.basis.as_str(),
                obs.metric.scope.as_str(),
                obs.metric.per_share as i64,
                match obs.metric.category {
                    MetricCategory::Primary => "PRIMARY",
                    MetricCategory::Derived => "DERIVED",
                },
                obs.metric.precision as i64,
                obs.period.year as i64,
                obs.period.quarter.map(|q| q as i64),
                obs.value.to_string(),
                obs.currency,
                encode_as_of(obs.as_of),
                obs.source.vendor,
                obs.source.feed,
                obs.source.authority as i64,
                adjustments_json,
                obs.derived_from.map(|id| id.to_string()),
                metadata_json,
            ],
        )?;
        Ok(())
    }
}

fn encode_as_of(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn row_to_observation(row: &Row<'_>) -> rusqlite::Result<Observation> {
    let id: String = row.get("id")?;
    let basis: String = row.get("basis")?;
    let scope: String = row.get("scope")?;
    let category: String = row.get("category")?;
    let value: String = row.get("value")?;
    let as_of: String = row.get("as_of")?;
    let adjustments_json: String = row.get("adjustments_json")?;
    let metadata_json: String = row.get("metadata_json")?;
    let derived_from: Option<String> = row.get("derived_from")?;
    let quarter: Option<i64> = row.get("period_quarter")?;

    let invalid = |msg: String| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            msg.into(),
        )
    };

    let metric = MetricSpec {
        code: row.get("metric_code")?,
        basis: Basis::from_str(&basis).map_err(invalid)?,
        scope: Scope::from_str(&scope).map_err(invalid)?,
        per_share: row.get::<_, i64>("per_share")? != 0,
        category: match category.as_str() {
            "DERIVED" => MetricCategory::Derived,
            _ => MetricCategory::Primary,
        },
        precision: row.get::<_, i64>("precision")? as u32,
    };

    let adjustments: Vec<Adjustment> =
        serde_json::from_str(&adjustments_json).map_err(|e| invalid(e.to_string()))?;
    let metadata: Metadata =
        serde_json::from_str(&metadata_json).map_err(|e| invalid(e.to_string()))?;

    Ok(Observation {
        id: Uuid::parse_str(&id).map_err(|e| invalid(e.to_string()))?,
        entity_id: row.get("entity_id")?,
        metric,
        period: FiscalPeriod {
            year: row.get::<_, i64>("period_year")? as i32,
            quarter: quarter.map(|q| q as u8),
        },
        value: rust_decimal::Decimal::from_str(&value).map_err(|e| invalid(e.to_string()))?,
        currency: row.get("currency")?,
        as_of: DateTime::parse_from_rfc3339(&as_of)
            .map_err(|e| invalid(e.to_string()))?
            .with_timezone(&Utc),
        source: SourceRef {
            vendor: row.get("vendor")?,
            feed: row.get("feed")?,
            authority: row.get::<_, i64>("authority")? as u8,
        },
        adjustments,
        derived_from: derived_from
            .map(|s| Uuid::parse_str(&s).map_err(|e| invalid(e.to_string())))
            .transpose()?,
        metadata,
    })
}

/// Builds the WHERE clause and positional params for a filter scan
fn filter_sql(filter: &ObservationFilter) -> (String, Vec<Box<dyn rusqlite::ToSql>>) {
    let mut conditions: Vec<String> = Vec::new();
    let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

    fn push(
        conditions: &mut Vec<String>,
        params: &mut Vec<Box<dyn rusqlite::ToSql>>,
        cond: &str,
        value: Box<dyn rusqlite::ToSql>,
    ) {
        params.push(value);
        conditions.push(format!("{} ?{}", cond, params.len()));
    }

    if let Some(entity_id) = &filter.entity_id {
        push(&mut conditions, &mut params, "entity_id =", Box::new(entity_id.clone()));
    }
    if let Some(code) = &filter.metric_code {
        push(&mut conditions, &mut params, "metric_code =", Box::new(code.clone()));
    }
    if let Some(basis) = filter.basis {
        push(&mut conditions, &mut params, "basis =", Box::new(basis.as_str()));
    }
    if let Some(scope) = filter.scope {
        push(&mut conditions, &mut params, "scope =", Box::new(scope.as_str()));
    }
    if let Some(period) = filter.period {
        push(&mut conditions, &mut params, "period_year =", Box::new(period.year as i64));
        match period.quarter {
            Some(q) => push(&mut conditions, &mut params, "period_quarter =", Box::new(q as i64)),
            None => conditions.push("period_quarter IS NULL".to_string()),
        }
    }
    if let Some(source) = &filter.source {
        push(&mut conditions, &mut params, "vendor =", Box::new(source.clone()));
    }
    if let Some(ceiling) = filter.as_of_before {
        push(&mut conditions, &mut params, "as_of <=", Box::new(encode_as_of(ceiling)));
    }
    if let Some(floor) = filter.as_of_after {
        push(&mut conditions, &mut params, "as_of >", Box::new(encode_as_of(floor)));
    }

    let where_clause = if conditions.is_empty() {
        "1=1".to_string()
    } else {
        conditions.join(" AND ")
    };
    (where_clause, params)
}

#[async_trait]
impl ObservationStore for SqliteStore {
    async fn get(&self, id: Uuid) -> Result<Option<Observation>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare_cached("SELECT * FROM observations WHERE id = ?1")?;
        let mut rows = stmt.query(params![id.to_string()])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_observation(row)?)),
            None => Ok(None),
        }
    }

    async fn query(&self, filter: &ObservationFilter) -> Result<Vec<Observation>, StoreError> {
        let (where_clause, params) = filter_sql(filter);
        let mut sql = format!(
            "SELECT * FROM observations WHERE {} ORDER BY rowid",
            where_clause
        );
        if let Some(limit) = filter.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let param_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();
        let mut rows = stmt.query(param_refs.as_slice())?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(row_to_observation(row)?);
        }
        Ok(out)
    }

    async fn store(&self, observation: Observation) -> Result<Uuid, StoreError> {
        let id = observation.id;
        let conn = self.conn.lock();
        Self::insert(&conn, &observation)?;
        Ok(id)
    }

    async fn store_batch(&self, observations: Vec<Observation>) -> Result<usize, StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut stored = 0;
        for obs in &observations {
            Self::insert(&tx, obs)?;
            stored += 1;
        }
        tx.commit()?;
        Ok(stored)
    }

    async fn history(&self, key: &ObservationKey) -> Result<Vec<Observation>, StoreError> {
        let filter = ObservationFilter::for_key(key);
        let (where_clause, params) = filter_sql(&filter);
        let sql = format!(
            "SELECT * FROM observations WHERE {} ORDER BY as_of, rowid",
            where_clause
        );

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let param_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();
        let mut rows = stmt.query(param_refs.as_slice())?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(row_to_observation(row)?);
        }
        Ok(out)
    }

    async fn entities_matching(
        &self,
        filter: &ObservationFilter,
    ) -> Result<Vec<String>, StoreError> {
        let (where_clause, params) = filter_sql(filter);
        let sql = format!(
            "SELECT DISTINCT entity_id FROM observations WHERE {} ORDER BY entity_id",
            where_clause
        );

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let param_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();
        let mut rows = stmt.query(param_refs.as_slice())?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(row.get(0)?);
        }
        Ok(out)
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        let conn = self.conn.lock();

        let total: i64 = conn.query_row("SELECT COUNT(*) FROM observations", [], |row| row.get(0))?;
        let entities: i64 = conn.query_row(
            "SELECT COUNT(DISTINCT entity_id) FROM observations",
            [],
            |row| row.get(0),
        )?;

        let mut by_scope: BTreeMap<String, usize> = BTreeMap::new();
        let mut stmt =
            conn.prepare("SELECT scope, COUNT(*) FROM observations GROUP BY scope")?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let scope: String = row.get(0)?;
            let count: i64 = row.get(1)?;
            by_scope.insert(scope, count as usize);
        }

        Ok(StoreStats {
            total: total as usize,
            by_scope,
            entities: entities as usize,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn sample() -> Observation {
        let mut meta = Metadata::new();
        meta.insert("num_estimates", serde_json::json!(21));
        Observation::new(
            "aapl",
            MetricSpec::reported("eps", Basis::Adjusted).per_share().with_precision(2),
            FiscalPeriod::quarterly(2024, 4),
            dec!(2.18),
            Utc.with_ymd_and_hms(2024, 10, 31, 21, 5, 0).unwrap(),
            SourceRef::new("sec", 100).with_feed("10-Q"),
        )
        .with_currency("USD")
        .with_adjustments(vec![Adjustment::new("stock_comp", dec!(0.12), "SBC addback")])
        .with_metadata(meta)
    }

    #[tokio::test]
    async fn round_trips_full_observation() {
        let store = SqliteStore::open_in_memory().unwrap();
        let obs = sample();
        let id = store.store(obs.clone()).await.unwrap();

        let loaded = store.get(id).await.unwrap().unwrap();
        assert_eq!(loaded, obs);
    }

    #[tokio::test]
    async fn query_filters_by_key_and_ceiling() {
        let store = SqliteStore::open_in_memory().unwrap();
        let obs = sample();
        let key = obs.key();
        store.store(obs).await.unwrap();

        let rows = store.query(&ObservationFilter::for_key(&key)).await.unwrap();
        assert_eq!(rows.len(), 1);

        let early = ObservationFilter::for_key(&key)
            .with_ceiling(Utc.with_ymd_and_hms(2024, 10, 1, 0, 0, 0).unwrap());
        assert!(store.query(&early).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn batch_store_is_transactional() {
        let store = SqliteStore::open_in_memory().unwrap();
        let n = store
            .store_batch(vec![sample(), sample(), sample()])
            .await
            .unwrap();
        assert_eq!(n, 3);
        assert_eq!(store.stats().await.unwrap().total, 3);
    }

    #[tokio::test]
    async fn opens_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("obs.db");
        let store = SqliteStore::open(path.to_str().unwrap()).unwrap();
        store.store(sample()).await.unwrap();
        assert_eq!(store.stats().await.unwrap().total, 1);
    }
}
