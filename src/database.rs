use std::collections::HashSet;

use async_trait::async_trait;
use log::info;
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Connection, PgConnection, Postgres, Transaction};

use crate::config::DbSettings;
use crate::error::{Error, Result};
use crate::ingest::{Sink, Tally};

/// One row of `raw.messages`, a cache of a scraped JSON file.
#[derive(Debug, Clone, PartialEq)]
pub struct RawMessageRow {
    pub message_id: i64,
    pub channel_id: Option<i64>,
    pub raw_data: Value,
    pub file_path: String,
}

/// One row of `raw_enrichment.image_detections`.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionRow {
    pub message_id: i64,
    pub image_path: String,
    pub object_class: String,
    pub confidence: f32,
    /// `[x1, y1, x2, y2]`, rounded so it can take part in the unique key.
    pub bounding_box: Value,
}

/// Open a single connection for the duration of a batch stage.
pub async fn connect(db: &DbSettings) -> Result<PgConnection> {
    let conn = PgConnection::connect_with(&db.connect_options()).await?;
    info!(
        "Connected to PostgreSQL database {} at {}:{}",
        db.name, db.host, db.port
    );
    Ok(conn)
}

/// Small pool for the reporting API, one connection per in-flight request.
pub async fn connect_pool(db: &DbSettings, max_connections: u32) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections.max(1))
        .connect_with(db.connect_options())
        .await?;
    Ok(pool)
}

/// Create the raw schema and messages table if they don't exist.
/// The UNIQUE constraint on file_path prevents duplicate loads.
pub async fn init_raw_schema(conn: &mut PgConnection) -> Result<()> {
    sqlx::query("CREATE SCHEMA IF NOT EXISTS raw")
        .execute(&mut *conn)
        .await?;
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS raw.messages (
            id          SERIAL PRIMARY KEY,
            message_id  BIGINT NOT NULL,
            channel_id  BIGINT,
            raw_data    JSONB NOT NULL,
            file_path   TEXT NOT NULL UNIQUE,
            loaded_at   TIMESTAMPTZ DEFAULT NOW()
         )",
    )
    .execute(&mut *conn)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_message_id ON raw.messages (message_id)")
        .execute(&mut *conn)
        .await?;
    info!("Raw schema ready.");
    Ok(())
}

/// Create the enrichment schema and detections table if they don't exist.
pub async fn init_enrichment_schema(conn: &mut PgConnection) -> Result<()> {
    sqlx::query("CREATE SCHEMA IF NOT EXISTS raw_enrichment")
        .execute(&mut *conn)
        .await?;
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS raw_enrichment.image_detections (
            id                    SERIAL PRIMARY KEY,
            message_id            BIGINT NOT NULL,
            image_path            TEXT NOT NULL,
            detected_object_class TEXT NOT NULL,
            confidence_score      REAL NOT NULL,
            bounding_box          JSONB,
            loaded_at             TIMESTAMPTZ DEFAULT NOW(),
            UNIQUE(image_path, detected_object_class, bounding_box)
         )",
    )
    .execute(&mut *conn)
    .await?;
    info!("Enrichment schema ready.");
    Ok(())
}

/// Image paths that already have at least one detection row.
pub async fn processed_images(conn: &mut PgConnection) -> Result<HashSet<String>> {
    let paths: Vec<String> =
        sqlx::query_scalar("SELECT DISTINCT image_path FROM raw_enrichment.image_detections")
            .fetch_all(&mut *conn)
            .await?;
    Ok(paths.into_iter().collect())
}

const INSERT_RAW_MESSAGE: &str = "INSERT INTO raw.messages (message_id, channel_id, raw_data, file_path)
     VALUES ($1, $2, $3, $4)
     ON CONFLICT (file_path) DO NOTHING";

const INSERT_DETECTION: &str = "INSERT INTO raw_enrichment.image_detections
        (message_id, image_path, detected_object_class, confidence_score, bounding_box)
     VALUES ($1, $2, $3, $4, $5)
     ON CONFLICT (image_path, detected_object_class, bounding_box) DO NOTHING";

/// Loader sink: every insert of a walk goes into one transaction, committed by
/// `finish`. Each item runs inside its own savepoint, so a row Postgres rejects
/// is rolled back alone and does not abort the rest of the walk.
pub struct RawMessageSink<'c> {
    tx: Transaction<'c, Postgres>,
}

impl<'c> RawMessageSink<'c> {
    pub async fn begin(conn: &'c mut PgConnection) -> Result<Self> {
        Ok(RawMessageSink {
            tx: conn.begin().await?,
        })
    }

    pub async fn finish(self) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }
}

async fn insert_raw_messages(conn: &mut PgConnection, rows: &[RawMessageRow]) -> Result<Tally> {
    let mut tally = Tally::default();
    for row in rows {
        let result = sqlx::query(INSERT_RAW_MESSAGE)
            .bind(row.message_id)
            .bind(row.channel_id)
            .bind(&row.raw_data)
            .bind(&row.file_path)
            .execute(&mut *conn)
            .await?;
        // rows_affected is 0 when the file path was already loaded
        tally += if result.rows_affected() > 0 {
            Tally::inserted()
        } else {
            Tally::duplicate()
        };
    }
    Ok(tally)
}

/// Enrichment sink: one transaction per image, rolled back if any insert fails.
pub struct DetectionSink<'c> {
    conn: &'c mut PgConnection,
}

impl<'c> DetectionSink<'c> {
    pub fn new(conn: &'c mut PgConnection) -> Self {
        DetectionSink { conn }
    }
}

async fn insert_detections(conn: &mut PgConnection, rows: &[DetectionRow]) -> Result<Tally> {
    let mut tally = Tally::default();
    for row in rows {
        let result = sqlx::query(INSERT_DETECTION)
            .bind(row.message_id)
            .bind(&row.image_path)
            .bind(&row.object_class)
            .bind(row.confidence)
            .bind(&row.bounding_box)
            .execute(&mut *conn)
            .await?;
        tally += if result.rows_affected() > 0 {
            Tally::inserted()
        } else {
            Tally::duplicate()
        };
    }
    Ok(tally)
}

/// Commit `tx` if `outcome` is Ok, roll it back otherwise.
async fn settle(tx: Transaction<'_, Postgres>, outcome: Result<Tally>) -> Result<Tally> {
    match outcome {
        Ok(tally) => {
            tx.commit().await?;
            Ok(tally)
        }
        Err(e) => {
            tx.rollback().await.map_err(Error::from)?;
            Err(e)
        }
    }
}

#[async_trait]
impl Sink<RawMessageRow> for RawMessageSink<'_> {
    async fn store(&mut self, _key: &str, rows: Vec<RawMessageRow>) -> Result<Tally> {
        // nested begin on an open transaction is a SAVEPOINT
        let mut savepoint = self.tx.begin().await?;
        let outcome = insert_raw_messages(&mut savepoint, &rows).await;
        settle(savepoint, outcome).await
    }
}

#[async_trait]
impl Sink<DetectionRow> for DetectionSink<'_> {
    async fn store(&mut self, _key: &str, rows: Vec<DetectionRow>) -> Result<Tally> {
        let mut tx = self.conn.begin().await?;
        let outcome = insert_detections(&mut tx, &rows).await;
        settle(tx, outcome).await
    }
}

/// Connection to the database named by `DATABASE_URL`, with both raw schemas
/// created. `None` when the variable is unset so database tests are skipped.
#[cfg(test)]
pub(crate) async fn test_connection() -> Option<PgConnection> {
    static SCHEMA_LOCK: tokio::sync::Mutex<()> = tokio::sync::Mutex::const_new(());

    let url = std::env::var("DATABASE_URL").ok()?;
    let mut conn = PgConnection::connect(&url)
        .await
        .unwrap_or_else(|e| panic!("DATABASE_URL is set but unreachable: {}", e));
    let _guard = SCHEMA_LOCK.lock().await;
    init_raw_schema(&mut conn).await.unwrap();
    init_enrichment_schema(&mut conn).await.unwrap();
    Some(conn)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn detection(image_path: &str, class: &str, bbox: Value) -> DetectionRow {
        DetectionRow {
            message_id: 7,
            image_path: image_path.to_string(),
            object_class: class.to_string(),
            confidence: 0.9,
            bounding_box: bbox,
        }
    }

    async fn detection_count(conn: &mut PgConnection, image_path: &str) -> i64 {
        sqlx::query_scalar(
            "SELECT COUNT(*) FROM raw_enrichment.image_detections WHERE image_path = $1",
        )
        .bind(image_path)
        .fetch_one(&mut *conn)
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn detection_insert_error_rolls_back_the_whole_image() {
        let Some(mut conn) = test_connection().await else {
            return;
        };
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("7.jpg").to_string_lossy().into_owned();

        // JSONB rejects the NUL escape, failing the second insert
        let rows = vec![
            detection(&image, "bottle", json!([1.0, 2.0, 3.0, 4.0])),
            detection(&image, "box", json!(["\u{0}"])),
        ];
        let mut sink = DetectionSink::new(&mut conn);
        assert!(sink.store(&image, rows).await.is_err());
        assert_eq!(detection_count(&mut conn, &image).await, 0);

        let good = vec![detection(&image, "bottle", json!([1.0, 2.0, 3.0, 4.0]))];
        let mut sink = DetectionSink::new(&mut conn);
        assert_eq!(
            sink.store(&image, good.clone()).await.unwrap(),
            Tally::inserted()
        );
        assert_eq!(sink.store(&image, good).await.unwrap(), Tally::duplicate());
        assert_eq!(detection_count(&mut conn, &image).await, 1);
    }

    #[tokio::test]
    async fn rejected_raw_row_leaves_the_batch_usable() {
        let Some(mut conn) = test_connection().await else {
            return;
        };
        let dir = tempfile::tempdir().unwrap();
        let row = |name: &str, data: Value| RawMessageRow {
            message_id: 1,
            channel_id: Some(10),
            raw_data: data,
            file_path: dir.path().join(name).to_string_lossy().into_owned(),
        };

        let mut sink = RawMessageSink::begin(&mut conn).await.unwrap();
        let first = sink.store("a", vec![row("a.json", json!({"id": 1}))]).await;
        let bad = sink
            .store("b", vec![row("b.json", json!({"id": 2, "message": "\u{0}"}))])
            .await;
        let third = sink.store("c", vec![row("c.json", json!({"id": 3}))]).await;
        let again = sink.store("a", vec![row("a.json", json!({"id": 1}))]).await;
        sink.finish().await.unwrap();

        assert_eq!(first.unwrap(), Tally::inserted());
        assert!(bad.is_err());
        assert_eq!(third.unwrap(), Tally::inserted());
        assert_eq!(again.unwrap(), Tally::duplicate());

        let pattern = format!("{}%", dir.path().to_string_lossy());
        let stored: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM raw.messages WHERE file_path LIKE $1")
                .bind(pattern)
                .fetch_one(&mut conn)
                .await
                .unwrap();
        assert_eq!(stored, 2);
    }
}
