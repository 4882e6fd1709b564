//! One-record-per-report-date persistence.
//!
//! Upserts use a read-then-write existence check rather than a storage level
//! uniqueness constraint, so two writers racing on the same date can both
//! insert. Ingestion only ever writes one file per date per batch.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use covglobe_core::{DateRange, ReportDate, ReportRecord};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::warn;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn find_by_date(&self, date: &str) -> Result<Option<ReportRecord>, StoreError>;

    /// All records, oldest report date first.
    async fn find_all(&self) -> Result<Vec<ReportRecord>, StoreError>;

    /// Chronological min/max over every stored date key.
    async fn find_date_range(&self) -> Result<Option<DateRange>, StoreError>;

    /// Replace `last_update`/`data` of the record for `record.date`, or insert it.
    async fn upsert(&self, record: &ReportRecord) -> Result<UpsertOutcome, StoreError>;
}

fn date_range_from_keys<'a>(keys: impl IntoIterator<Item = &'a str>) -> Option<DateRange> {
    let dates = keys.into_iter().filter_map(|key| match key.parse::<ReportDate>() {
        Ok(date) => Some(date),
        Err(err) => {
            warn!(date = key, error = %err, "skipping unparseable stored date");
            None
        }
    });
    DateRange::from_dates(dates)
}

fn chronological(records: &mut [ReportRecord]) {
    records.sort_by(|a, b| {
        a.report_date()
            .ok()
            .cmp(&b.report_date().ok())
            .then_with(|| a.date.cmp(&b.date))
    });
}

#[derive(Debug, Clone)]
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn record_from_row(row: &PgRow) -> Result<ReportRecord, sqlx::Error> {
    Ok(ReportRecord {
        date: row.try_get("date")?,
        last_update: row.try_get::<DateTime<Utc>, _>("last_update")?,
        data: row.try_get("data")?,
    })
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn find_by_date(&self, date: &str) -> Result<Option<ReportRecord>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT date, last_update, data
              FROM report_records
             WHERE date = $1
             ORDER BY updated_at DESC
             LIMIT 1
            "#,
        )
        .bind(date)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(record_from_row).transpose()?)
    }

    async fn find_all(&self) -> Result<Vec<ReportRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT date, last_update, data
              FROM report_records
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut records = rows
            .iter()
            .map(record_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        chronological(&mut records);
        Ok(records)
    }

    async fn find_date_range(&self) -> Result<Option<DateRange>, StoreError> {
        let rows = sqlx::query("SELECT DISTINCT date FROM report_records")
            .fetch_all(&self.pool)
            .await?;

        let keys = rows
            .iter()
            .map(|row| row.try_get::<String, _>("date"))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(date_range_from_keys(keys.iter().map(String::as_str)))
    }

    async fn upsert(&self, record: &ReportRecord) -> Result<UpsertOutcome, StoreError> {
        let exists = sqlx::query("SELECT 1 FROM report_records WHERE date = $1 LIMIT 1")
            .bind(&record.date)
            .fetch_optional(&self.pool)
            .await?
            .is_some();

        if exists {
            sqlx::query(
                r#"
                UPDATE report_records
                   SET last_update = $2,
                       data = $3,
                       updated_at = NOW()
                 WHERE date = $1
                "#,
            )
            .bind(&record.date)
            .bind(record.last_update)
            .bind(&record.data)
            .execute(&self.pool)
            .await?;
            Ok(UpsertOutcome::Updated)
        } else {
            sqlx::query(
                r#"
                INSERT INTO report_records (date, last_update, data)
                VALUES ($1, $2, $3)
                "#,
            )
            .bind(&record.date)
            .bind(record.last_update)
            .bind(&record.data)
            .execute(&self.pool)
            .await?;
            Ok(UpsertOutcome::Inserted)
        }
    }
}

/// Process-local store for dry runs and tests.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    records: RwLock<BTreeMap<String, ReportRecord>>,
    writes: AtomicUsize,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: impl IntoIterator<Item = ReportRecord>) -> Self {
        let records = records
            .into_iter()
            .map(|record| (record.date.clone(), record))
            .collect();
        Self {
            records: RwLock::new(records),
            writes: AtomicUsize::new(0),
        }
    }

    /// Number of successful upserts since construction.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn find_by_date(&self, date: &str) -> Result<Option<ReportRecord>, StoreError> {
        Ok(self.records.read().await.get(date).cloned())
    }

    async fn find_all(&self) -> Result<Vec<ReportRecord>, StoreError> {
        let mut records = self.records.read().await.values().cloned().collect::<Vec<_>>();
        chronological(&mut records);
        Ok(records)
    }

    async fn find_date_range(&self) -> Result<Option<DateRange>, StoreError> {
        let records = self.records.read().await;
        Ok(date_range_from_keys(records.keys().map(String::as_str)))
    }

    async fn upsert(&self, record: &ReportRecord) -> Result<UpsertOutcome, StoreError> {
        let mut records = self.records.write().await;
        let outcome = match records.get_mut(&record.date) {
            Some(existing) => {
                existing.last_update = record.last_update;
                existing.data = record.data.clone();
                UpsertOutcome::Updated
            }
            None => {
                records.insert(record.date.clone(), record.clone());
                UpsertOutcome::Inserted
            }
        };
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record(date: &str, data: &str) -> ReportRecord {
        ReportRecord {
            date: date.to_string(),
            last_update: Utc.with_ymd_and_hms(2021, 1, 2, 3, 4, 5).single().unwrap(),
            data: data.to_string(),
        }
    }

    #[tokio::test]
    async fn upsert_inserts_then_replaces() {
        let store = MemoryRecordStore::new();
        assert_eq!(
            store.upsert(&record("01-01-2021", "a")).await.unwrap(),
            UpsertOutcome::Inserted
        );
        assert_eq!(
            store.upsert(&record("01-01-2021", "b")).await.unwrap(),
            UpsertOutcome::Updated
        );

        assert_eq!(store.len().await, 1);
        assert_eq!(store.writes(), 2);
        let stored = store.find_by_date("01-01-2021").await.unwrap().unwrap();
        assert_eq!(stored.data, "b");
    }

    #[tokio::test]
    async fn missing_date_is_absent() {
        let store = MemoryRecordStore::new();
        assert!(store.find_by_date("01-01-2021").await.unwrap().is_none());
        assert!(store.find_date_range().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn date_range_uses_calendar_order() {
        let store = MemoryRecordStore::with_records([
            record("01-15-2021", ""),
            record("03-01-2022", ""),
            record("02-20-2021", ""),
            record("garbage", ""),
        ]);

        let range = store.find_date_range().await.unwrap().unwrap();
        assert_eq!(range.min.to_string(), "01-15-2021");
        assert_eq!(range.max.to_string(), "03-01-2022");
    }

    #[tokio::test]
    async fn find_all_is_chronological() {
        let store = MemoryRecordStore::with_records([
            record("12-31-2020", ""),
            record("01-01-2021", ""),
            record("06-15-2020", ""),
        ]);

        let dates = store
            .find_all()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.date)
            .collect::<Vec<_>>();
        assert_eq!(dates, vec!["06-15-2020", "12-31-2020", "01-01-2021"]);
    }
}
