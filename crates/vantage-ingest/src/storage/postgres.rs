//! PostgreSQL adapter for batch storage.
//!
//! One table per record kind, columns mirroring the record fields. Batches
//! are written as multi-row `INSERT ... ON CONFLICT (id) DO NOTHING`
//! statements, so replaying a batch after a partial failure only fills in
//! the rows that are missing.

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::query_builder::Separated;
use sqlx::types::Json;
use sqlx::{Postgres, QueryBuilder};

use super::{table_name, BatchWriter};
use crate::record::{AppLog, Event, Metric, Record, RequestLog};
use crate::IngestError;

/// Postgres accepts at most this many bind parameters per statement.
const MAX_BIND_PARAMS: usize = 65_535;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS events (
        id TEXT PRIMARY KEY,
        project_id TEXT NOT NULL,
        name TEXT NOT NULL,
        distinct_id TEXT,
        properties JSONB NOT NULL DEFAULT '{}',
        timestamp TIMESTAMPTZ NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_events_project_time ON events (project_id, timestamp)",
    r#"
    CREATE TABLE IF NOT EXISTS app_logs (
        id TEXT PRIMARY KEY,
        project_id TEXT NOT NULL,
        level TEXT NOT NULL,
        message TEXT NOT NULL,
        logger TEXT,
        attributes JSONB NOT NULL DEFAULT '{}',
        trace_id TEXT,
        timestamp TIMESTAMPTZ NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_app_logs_project_time ON app_logs (project_id, timestamp)",
    r#"
    CREATE TABLE IF NOT EXISTS request_logs (
        id TEXT PRIMARY KEY,
        project_id TEXT NOT NULL,
        method TEXT NOT NULL,
        path TEXT NOT NULL,
        status_code INTEGER NOT NULL,
        duration_ms BIGINT NOT NULL,
        client_ip TEXT,
        user_agent TEXT,
        timestamp TIMESTAMPTZ NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_request_logs_project_time ON request_logs (project_id, timestamp)",
    r#"
    CREATE TABLE IF NOT EXISTS metrics (
        id TEXT PRIMARY KEY,
        project_id TEXT NOT NULL,
        name TEXT NOT NULL,
        value DOUBLE PRECISION NOT NULL,
        unit TEXT,
        tags JSONB NOT NULL DEFAULT '{}',
        trace_id TEXT,
        span_id TEXT,
        parent_span_id TEXT,
        timestamp TIMESTAMPTZ NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_metrics_project_time ON metrics (project_id, timestamp)",
];

/// Row layout of a record in its Postgres table.
pub trait PgInsert: Record {
    /// Column names, in the order [`bind_row`](Self::bind_row) binds them.
    const COLUMNS: &'static [&'static str];

    fn bind_row(&self, row: &mut Separated<'_, '_, Postgres, &'static str>);
}

impl PgInsert for Event {
    const COLUMNS: &'static [&'static str] = &[
        "id",
        "project_id",
        "name",
        "distinct_id",
        "properties",
        "timestamp",
    ];

    fn bind_row(&self, row: &mut Separated<'_, '_, Postgres, &'static str>) {
        row.push_bind(self.id.to_string())
            .push_bind(self.project_id.clone())
            .push_bind(self.name.clone())
            .push_bind(self.distinct_id.clone())
            .push_bind(Json(self.properties.clone()))
            .push_bind(self.timestamp);
    }
}

impl PgInsert for AppLog {
    const COLUMNS: &'static [&'static str] = &[
        "id",
        "project_id",
        "level",
        "message",
        "logger",
        "attributes",
        "trace_id",
        "timestamp",
    ];

    fn bind_row(&self, row: &mut Separated<'_, '_, Postgres, &'static str>) {
        row.push_bind(self.id.to_string())
            .push_bind(self.project_id.clone())
            .push_bind(self.level.as_str())
            .push_bind(self.message.clone())
            .push_bind(self.logger.clone())
            .push_bind(Json(self.attributes.clone()))
            .push_bind(self.trace_id.clone())
            .push_bind(self.timestamp);
    }
}

impl PgInsert for RequestLog {
    const COLUMNS: &'static [&'static str] = &[
        "id",
        "project_id",
        "method",
        "path",
        "status_code",
        "duration_ms",
        "client_ip",
        "user_agent",
        "timestamp",
    ];

    fn bind_row(&self, row: &mut Separated<'_, '_, Postgres, &'static str>) {
        row.push_bind(self.id.to_string())
            .push_bind(self.project_id.clone())
            .push_bind(self.method.clone())
            .push_bind(self.path.clone())
            .push_bind(i32::from(self.status_code))
            .push_bind(i64::from(self.duration_ms))
            .push_bind(self.client_ip.clone())
            .push_bind(self.user_agent.clone())
            .push_bind(self.timestamp);
    }
}

impl PgInsert for Metric {
    const COLUMNS: &'static [&'static str] = &[
        "id",
        "project_id",
        "name",
        "value",
        "unit",
        "tags",
        "trace_id",
        "span_id",
        "parent_span_id",
        "timestamp",
    ];

    fn bind_row(&self, row: &mut Separated<'_, '_, Postgres, &'static str>) {
        row.push_bind(self.id.to_string())
            .push_bind(self.project_id.clone())
            .push_bind(self.name.clone())
            .push_bind(self.value)
            .push_bind(self.unit.clone())
            .push_bind(Json(self.tags.clone()))
            .push_bind(self.trace_id.clone())
            .push_bind(self.span_id.clone())
            .push_bind(self.parent_span_id.clone())
            .push_bind(self.timestamp);
    }
}

/// Most rows of `R` that fit in one statement.
fn rows_per_statement<R: PgInsert>() -> usize {
    (MAX_BIND_PARAMS / R::COLUMNS.len()).max(1)
}

fn insert_statement<'args, R: PgInsert>(chunk: &[R]) -> QueryBuilder<'args, Postgres> {
    let mut builder = QueryBuilder::new(format!(
        "INSERT INTO {} ({}) ",
        table_name(R::KIND),
        R::COLUMNS.join(", ")
    ));
    builder.push_values(chunk, |mut row, record| record.bind_row(&mut row));
    builder.push(" ON CONFLICT (id) DO NOTHING");
    builder
}

/// Batch writer over a Postgres connection pool.
#[derive(Clone)]
pub struct PostgresWriter {
    pool: PgPool,
}

impl PostgresWriter {
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, IngestError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        Ok(Self { pool })
    }

    pub const fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the per-kind tables and indexes if they don't exist.
    pub async fn ensure_schema(&self) -> Result<(), IngestError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl<R: PgInsert> BatchWriter<R> for PostgresWriter {
    async fn insert(&self, records: &[R]) -> Result<(), IngestError> {
        if records.is_empty() {
            return Ok(());
        }

        let table = table_name(R::KIND);
        let write_error = |e: sqlx::Error| IngestError::StorageWrite {
            table,
            message: e.to_string(),
        };

        let mut conn = self.pool.acquire().await.map_err(write_error)?;

        // Statements run in order; a failure leaves earlier ones applied.
        for chunk in records.chunks(rows_per_statement::<R>()) {
            let result = insert_statement(chunk)
                .build()
                .execute(&mut *conn)
                .await
                .map_err(write_error)?;

            tracing::debug!(
                table = table,
                rows = chunk.len(),
                inserted = result.rows_affected(),
                "Inserted batch"
            );
        }

        Ok(())
    }
}

impl std::fmt::Debug for PostgresWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresWriter").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{LogLevel, RecordKind};

    #[test]
    fn statement_has_one_tuple_per_record() {
        let logs = vec![
            AppLog::new("p1", LogLevel::Info, "one"),
            AppLog::new("p1", LogLevel::Warn, "two"),
        ];

        let builder = insert_statement(&logs);
        let sql = builder.sql();

        assert!(sql.starts_with("INSERT INTO app_logs (id, project_id, level,"));
        assert!(sql.contains("($1, $2, $3, $4, $5, $6, $7, $8), ($9,"));
        assert!(sql.contains("$16)"));
        assert!(sql.ends_with("ON CONFLICT (id) DO NOTHING"));
    }

    #[test]
    fn chunks_stay_under_bind_limit() {
        assert_eq!(rows_per_statement::<Event>(), 65_535 / 6);
        assert!(rows_per_statement::<Metric>() * Metric::COLUMNS.len() <= MAX_BIND_PARAMS);
    }

    // Integration tests require a running PostgreSQL instance
    // Run with: DATABASE_URL=postgres://... cargo test -- --ignored

    async fn writer() -> PostgresWriter {
        let url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "postgres://localhost/vantage_test".to_owned());
        let writer = PostgresWriter::connect(&url, 2)
            .await
            .expect("Failed to connect to Postgres");
        writer.ensure_schema().await.unwrap();
        writer
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL instance (DATABASE_URL)"]
    async fn replayed_batch_is_idempotent() {
        let writer = writer().await;
        let requests = vec![
            RequestLog::new("it", "GET", "/", 200, 5),
            RequestLog::new("it", "POST", "/login", 401, 12),
        ];

        writer.insert(&requests).await.unwrap();
        writer.insert(&requests).await.unwrap();

        let ids: Vec<String> = requests.iter().map(|r| r.id.to_string()).collect();
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM request_logs WHERE id = ANY($1)")
            .bind(&ids)
            .fetch_one(&writer.pool)
            .await
            .unwrap();
        assert_eq!(count, 2);
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL instance (DATABASE_URL)"]
    async fn writes_every_kind() {
        let writer = writer().await;

        writer.insert(&[Event::new("it", "signup")]).await.unwrap();
        writer
            .insert(&[AppLog::new("it", LogLevel::Error, "boom")])
            .await
            .unwrap();
        writer
            .insert(&[Metric::new("it", "latency", 1.5).with_tag("region", "eu")])
            .await
            .unwrap();

        for kind in [RecordKind::Event, RecordKind::AppLog, RecordKind::Metric] {
            let query = format!("SELECT COUNT(*) FROM {} WHERE project_id = 'it'", table_name(kind));
            let count: i64 = sqlx::query_scalar(&query)
                .fetch_one(&writer.pool)
                .await
                .unwrap();
            assert!(count >= 1);
        }
    }
}
