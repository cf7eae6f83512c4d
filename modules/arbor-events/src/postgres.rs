//! Postgres storage.
//!
//! Rows that fail to decode are skipped and counted rather than failing the
//! whole read.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tracing::{info, warn};

use crate::error::{HistoryError, Result};
use crate::partition::PartitionId;
use crate::storage::EventStorage;
use crate::types::{PartitionSummary, ReadOptions, StoredEvent};
use crate::vocabulary::EventType;

const COLUMNS: &str = "id, partition_id, sequence_in_partition, global_order, event_type, \
                       payload, metadata, causation_id, correlation_id, occurred_at, recorded_at";

#[derive(Clone)]
pub struct PgStorage {
    pool: PgPool,
    decode_failures: Arc<AtomicU64>,
}

impl PgStorage {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            decode_failures: Arc::new(AtomicU64::new(0)),
        }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    /// Run the embedded SQL migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| HistoryError::StorageUnavailable(e.to_string()))?;
        info!("history_events migrations applied");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn decode_all(&self, rows: Vec<PgRow>) -> Vec<StoredEvent> {
        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            match decode_row(&row) {
                Ok(event) => events.push(event),
                Err(e) => {
                    self.decode_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(error = %e, "Skipping undecodable history row");
                }
            }
        }
        events
    }

    async fn next_free_sequence(&self, partition: &PartitionId) -> Result<i64> {
        let next = sqlx::query_scalar::<_, Option<i64>>(
            "SELECT MAX(sequence_in_partition) + 1 FROM history_events WHERE partition_id = $1",
        )
        .bind(partition.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(next.unwrap_or(0))
    }
}

#[async_trait]
impl EventStorage for PgStorage {
    async fn write(&self, event: &StoredEvent) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO history_events
                (id, partition_id, sequence_in_partition, global_order, event_type,
                 payload, metadata, causation_id, correlation_id, occurred_at, recorded_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (id, partition_id) DO NOTHING
            "#,
        )
        .bind(&event.id)
        .bind(event.partition_id.as_str())
        .bind(event.sequence_in_partition)
        .bind(event.global_order)
        .bind(event.event_type.to_string())
        .bind(&event.payload)
        .bind(&event.metadata)
        .bind(&event.causation_id)
        .bind(&event.correlation_id)
        .bind(event.occurred_at)
        .bind(event.recorded_at)
        .execute(&self.pool)
        .await;

        match result {
            // Zero rows: another writer already stored this id in the partition.
            Ok(done) => Ok(done.rows_affected() > 0),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                let actual = self.next_free_sequence(&event.partition_id).await?;
                Err(HistoryError::ConcurrencyConflict {
                    partition: event.partition_id.to_string(),
                    expected: event.sequence_in_partition,
                    actual,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn read_partition(
        &self,
        partition: &PartitionId,
        options: ReadOptions,
    ) -> Result<Vec<StoredEvent>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {COLUMNS}
            FROM history_events
            WHERE partition_id = $1
              AND ($2::BIGINT IS NULL OR sequence_in_partition >= $2)
              AND ($3::BIGINT IS NULL OR sequence_in_partition <= $3)
            ORDER BY sequence_in_partition ASC
            LIMIT $4
            "#
        ))
        .bind(partition.as_str())
        .bind(options.from_sequence)
        .bind(options.to_sequence)
        .bind(options.limit.map(|l| l as i64))
        .fetch_all(&self.pool)
        .await?;

        Ok(self.decode_all(rows))
    }

    async fn read_global_range(&self, from: i64, to: Option<i64>) -> Result<Vec<StoredEvent>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {COLUMNS}
            FROM history_events
            WHERE partition_id = 'global'
              AND global_order >= $1
              AND ($2::BIGINT IS NULL OR global_order <= $2)
            ORDER BY global_order ASC
            "#
        ))
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;

        Ok(self.decode_all(rows))
    }

    async fn copies_of(&self, event_id: &str) -> Result<Vec<StoredEvent>> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM history_events WHERE id = $1 ORDER BY partition_id"
        ))
        .bind(event_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(self.decode_all(rows))
    }

    async fn read_caused_by(&self, event_id: &str) -> Result<Vec<StoredEvent>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {COLUMNS}
            FROM history_events
            WHERE partition_id = 'global' AND causation_id = $1
            ORDER BY global_order ASC
            "#
        ))
        .bind(event_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(self.decode_all(rows))
    }

    async fn partition_summaries(&self) -> Result<Vec<PartitionSummary>> {
        let rows = sqlx::query(
            r#"
            SELECT partition_id,
                   COUNT(*) AS event_count,
                   MAX(sequence_in_partition) AS max_sequence,
                   MIN(recorded_at) AS first_event_at,
                   MAX(recorded_at) AS last_event_at
            FROM history_events
            GROUP BY partition_id
            ORDER BY partition_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut summaries = Vec::with_capacity(rows.len());
        for row in rows {
            let raw: String = row.try_get("partition_id")?;
            let Ok(partition_id) = raw.parse::<PartitionId>() else {
                self.decode_failures.fetch_add(1, Ordering::Relaxed);
                warn!(partition_id = %raw, "Skipping partition with malformed id");
                continue;
            };
            let event_count: i64 = row.try_get("event_count")?;
            summaries.push(PartitionSummary {
                partition_id,
                event_count: event_count.max(0) as u64,
                max_sequence: row.try_get("max_sequence")?,
                first_event_at: row.try_get("first_event_at")?,
                last_event_at: row.try_get("last_event_at")?,
            });
        }
        Ok(summaries)
    }

    async fn max_global_order(&self) -> Result<i64> {
        let max = sqlx::query_scalar::<_, Option<i64>>("SELECT MAX(global_order) FROM history_events")
            .fetch_one(&self.pool)
            .await?;
        Ok(max.unwrap_or(0))
    }

    fn decode_failures(&self) -> u64 {
        self.decode_failures.load(Ordering::Relaxed)
    }

    async fn clear(&self) -> Result<()> {
        sqlx::query("TRUNCATE history_events")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

fn decode_row(row: &PgRow) -> Result<StoredEvent> {
    let partition_raw: String = row.try_get("partition_id")?;
    let partition_id = partition_raw
        .parse::<PartitionId>()
        .map_err(|e| HistoryError::DecodeFailure(e.to_string()))?;
    let event_type: String = row.try_get("event_type")?;
    let occurred_at: DateTime<Utc> = row.try_get("occurred_at")?;
    let recorded_at: DateTime<Utc> = row.try_get("recorded_at")?;

    Ok(StoredEvent {
        id: row.try_get("id")?,
        partition_id,
        sequence_in_partition: row.try_get("sequence_in_partition")?,
        global_order: row.try_get("global_order")?,
        event_type: EventType::parse(&event_type),
        payload: row.try_get("payload")?,
        metadata: row.try_get("metadata")?,
        causation_id: row.try_get("causation_id")?,
        correlation_id: row.try_get("correlation_id")?,
        occurred_at,
        recorded_at,
    })
}
