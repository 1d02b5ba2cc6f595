use crate::errors::Result;
use crate::metrics::{STORAGE_FAILURES_TOTAL, STORE_LATENCY_SECONDS};
use crate::model::{EventClass, EventRecord, FingerprintAuthEvent, PowerStatusEvent, TemperatureReading};
use chrono::NaiveDate;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

/// Append-only event store backed by a SQLite file.
///
/// Every operation checks a connection out of the pool and returns it when done,
/// so the handle can be cloned freely and used without extra locking.
#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub async fn open(path: &Path) -> Result<Self> {
        info!("Opening event store at {}", path.display());
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await?;

        info!("Running database migrations...");
        sqlx::migrate!("./migrations").run(&pool).await?;
        info!("Migrations completed");

        Ok(Self { pool })
    }

    /// Writes one record in its own autocommitted statement and returns its row id.
    pub async fn append(&self, record: &EventRecord) -> Result<i64> {
        let start = Instant::now();
        let result = self.insert(record).await;
        STORE_LATENCY_SECONDS.observe(start.elapsed().as_secs_f64());

        match result {
            Ok(id) => {
                debug!(
                    "Appended {} record {} for {} at {}",
                    record.class(),
                    id,
                    record.device_id(),
                    record.occurred_at()
                );
                Ok(id)
            }
            Err(e) => {
                STORAGE_FAILURES_TOTAL.inc();
                error!("Failed to append {} record for {}: {}", record.class(), record.device_id(), e);
                Err(e.into())
            }
        }
    }

    async fn insert(&self, record: &EventRecord) -> std::result::Result<i64, sqlx::Error> {
        let done = match record {
            EventRecord::Temperature(r) => {
                sqlx::query(
                    r#"
                    INSERT INTO temperature_logs (device_id, temperature, humidity, status, timestamp, occurred_at, date)
                    VALUES (?, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(&r.device_id)
                .bind(r.temperature)
                .bind(r.humidity)
                .bind(&r.status)
                .bind(&r.timestamp)
                .bind(r.occurred_at)
                .bind(r.date)
                .execute(&self.pool)
                .await?
            }
            EventRecord::Power(r) => {
                sqlx::query(
                    r#"
                    INSERT INTO power_status_logs (device_id, ebstatus, dgstatus, timestamp, occurred_at, date)
                    VALUES (?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(&r.device_id)
                .bind(r.mains.as_str())
                .bind(r.generator.as_str())
                .bind(&r.timestamp)
                .bind(r.occurred_at)
                .bind(r.date)
                .execute(&self.pool)
                .await?
            }
            EventRecord::Fingerprint(r) => {
                sqlx::query(
                    r#"
                    INSERT INTO fingerprint_logs (device_id, user_id, auth_status, timestamp, occurred_at, date)
                    VALUES (?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(&r.device_id)
                .bind(&r.user_id)
                .bind(r.auth_status.as_str())
                .bind(&r.timestamp)
                .bind(r.occurred_at)
                .bind(r.date)
                .execute(&self.pool)
                .await?
            }
        };

        Ok(done.last_insert_rowid())
    }

    /// Returns every record of `class` for the device on the given date, newest first.
    /// An empty result is not an error.
    pub async fn query_by_device_and_date(
        &self,
        class: EventClass,
        device_id: &str,
        date: NaiveDate,
    ) -> Result<Vec<EventRecord>> {
        let start = Instant::now();
        let result = self.select(class, device_id, date).await;
        STORE_LATENCY_SECONDS.observe(start.elapsed().as_secs_f64());

        result.map_err(|e| {
            STORAGE_FAILURES_TOTAL.inc();
            error!("Failed to query {} records for {} on {}: {}", class, device_id, date, e);
            e.into()
        })
    }

    async fn select(
        &self,
        class: EventClass,
        device_id: &str,
        date: NaiveDate,
    ) -> std::result::Result<Vec<EventRecord>, sqlx::Error> {
        let records = match class {
            EventClass::Temperature => sqlx::query_as::<_, TemperatureReading>(
                r#"
                SELECT device_id, temperature, humidity, status, timestamp, occurred_at, date
                FROM temperature_logs
                WHERE device_id = ? AND date = ?
                ORDER BY occurred_at DESC, id DESC
                "#,
            )
            .bind(device_id)
            .bind(date)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(EventRecord::Temperature)
            .collect(),
            EventClass::Power => sqlx::query_as::<_, PowerStatusEvent>(
                r#"
                SELECT device_id, ebstatus, dgstatus, timestamp, occurred_at, date
                FROM power_status_logs
                WHERE device_id = ? AND date = ?
                ORDER BY occurred_at DESC, id DESC
                "#,
            )
            .bind(device_id)
            .bind(date)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(EventRecord::Power)
            .collect(),
            EventClass::Fingerprint => sqlx::query_as::<_, FingerprintAuthEvent>(
                r#"
                SELECT device_id, user_id, auth_status, timestamp, occurred_at, date
                FROM fingerprint_logs
                WHERE device_id = ? AND date = ?
                ORDER BY occurred_at DESC, id DESC
                "#,
            )
            .bind(device_id)
            .bind(date)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(EventRecord::Fingerprint)
            .collect(),
        };

        Ok(records)
    }

    pub async fn close(&self) {
        self.pool.close().await;
        info!("Event store closed");
    }

    /// Opens a store on a fresh file in the system temp directory.
    #[cfg(test)]
    pub(crate) async fn open_temp() -> Self {
        let path = std::env::temp_dir().join(format!("bridge-test-{}.db", uuid::Uuid::new_v4()));
        Self::open(&path).await.unwrap()
    }
}
