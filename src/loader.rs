use std::path::PathBuf;

use async_trait::async_trait;
use log::info;
use serde_json::Value;

use crate::config::Settings;
use crate::database::{self, RawMessageRow, RawMessageSink};
use crate::error::{Error, Result};
use crate::ingest::{self, Extracted, Ingest, IngestReport};

/// Turns scraped message files into `raw.messages` rows, keyed by file path.
pub struct RawMessageJob;

#[async_trait]
impl Ingest for RawMessageJob {
    type Item = PathBuf;
    type Row = RawMessageRow;

    fn natural_key(&self, item: &PathBuf) -> String {
        item.to_string_lossy().into_owned()
    }

    async fn build(&mut self, item: &PathBuf) -> Result<Extracted<RawMessageRow>> {
        let bytes = tokio::fs::read(item)
            .await
            .map_err(|e| Error::io(item, e))?;
        let data: Value = serde_json::from_slice(&bytes).map_err(|e| Error::Json {
            path: item.clone(),
            source: e,
        })?;
        Ok(match raw_message_row(data, self.natural_key(item)) {
            Some(row) => Extracted::Rows(vec![row]),
            None => Extracted::Skip("file has no message id".into()),
        })
    }
}

/// Pull the identifiers out of a scraped document. Documents without a usable
/// message id yield `None`.
pub fn raw_message_row(data: Value, file_path: String) -> Option<RawMessageRow> {
    let message_id = data.get("id").and_then(Value::as_i64).filter(|id| *id != 0)?;
    let channel_id = data
        .get("peer_id")
        .and_then(|peer| peer.get("channel_id"))
        .and_then(Value::as_i64);
    Some(RawMessageRow {
        message_id,
        channel_id,
        raw_data: data,
        file_path,
    })
}

/// Walk the message tree and load every new file; commits once at the end.
pub async fn load_raw_messages(settings: &Settings) -> Result<IngestReport> {
    let mut conn = database::connect(&settings.db).await?;
    database::init_raw_schema(&mut conn).await?;

    let files = ingest::walk_files(&settings.messages_dir(), &["json"]).await?;
    info!("Found {} message files to consider.", files.len());

    let mut sink = RawMessageSink::begin(&mut conn).await?;
    let report = ingest::run("load", files, &mut RawMessageJob, &mut sink).await;
    sink.finish().await?;
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::Sink;
    use crate::ingest::Tally;
    use serde_json::json;
    use std::collections::HashMap;
    use std::path::Path;

    /// Stands in for raw.messages with its UNIQUE(file_path) constraint.
    #[derive(Default)]
    struct RawTable {
        rows: HashMap<String, RawMessageRow>,
    }

    #[async_trait]
    impl Sink<RawMessageRow> for RawTable {
        async fn store(&mut self, _key: &str, rows: Vec<RawMessageRow>) -> Result<Tally> {
            let mut tally = Tally::default();
            for row in rows {
                if self.rows.contains_key(&row.file_path) {
                    tally += Tally::duplicate();
                } else {
                    self.rows.insert(row.file_path.clone(), row);
                    tally += Tally::inserted();
                }
            }
            Ok(tally)
        }
    }

    fn write_message(root: &Path, date: &str, channel: &str, id: u64, body: &str) {
        let dir = root.join(date).join(channel);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(format!("{}.json", id)), body).unwrap();
    }

    fn message_json(id: i64, channel_id: i64) -> String {
        json!({
            "id": id,
            "peer_id": { "channel_id": channel_id },
            "message": "Paracetamol 500mg available",
        })
        .to_string()
    }

    #[test]
    fn extracts_ids_from_document() {
        let row = raw_message_row(
            json!({"id": 42, "peer_id": {"channel_id": 1399123456}}),
            "a.json".into(),
        )
        .unwrap();
        assert_eq!(row.message_id, 42);
        assert_eq!(row.channel_id, Some(1399123456));
        assert_eq!(row.file_path, "a.json");
    }

    #[test]
    fn channel_id_is_optional() {
        let row = raw_message_row(json!({"id": 7}), "b.json".into()).unwrap();
        assert_eq!(row.channel_id, None);
    }

    #[test]
    fn missing_or_zero_id_is_rejected() {
        assert!(raw_message_row(json!({"message": "hi"}), "c.json".into()).is_none());
        assert!(raw_message_row(json!({"id": null}), "c.json".into()).is_none());
        assert!(raw_message_row(json!({"id": 0}), "c.json".into()).is_none());
        assert!(raw_message_row(json!({"id": "12"}), "c.json".into()).is_none());
    }

    #[tokio::test]
    async fn second_run_over_same_tree_inserts_nothing() {
        let dir = tempfile::tempdir().unwrap();
        write_message(dir.path(), "2024-05-01", "chemedapp", 1, &message_json(1, 10));
        write_message(dir.path(), "2024-05-01", "chemedapp", 2, &message_json(2, 10));
        write_message(dir.path(), "2024-05-02", "tikvahpharma", 1, &message_json(1, 20));

        let mut table = RawTable::default();
        let files = ingest::walk_files(dir.path(), &["json"]).await.unwrap();
        let first = ingest::run("load", files.clone(), &mut RawMessageJob, &mut table).await;
        assert_eq!(first.inserted, 3);

        let second = ingest::run("load", files, &mut RawMessageJob, &mut table).await;
        assert_eq!(second.inserted, 0);
        assert_eq!(second.duplicates, 3);
        assert_eq!(table.rows.len(), 3);
    }

    #[tokio::test]
    async fn malformed_file_is_isolated() {
        let dir = tempfile::tempdir().unwrap();
        for id in 1..=4 {
            write_message(dir.path(), "2024-05-01", "chemedapp", id, &message_json(id as i64, 10));
        }
        write_message(dir.path(), "2024-05-01", "chemedapp", 99, "{ not json");

        let mut table = RawTable::default();
        let files = ingest::walk_files(dir.path(), &["json"]).await.unwrap();
        let report = ingest::run("load", files, &mut RawMessageJob, &mut table).await;
        assert_eq!(report.inserted, 4);
        assert_eq!(report.failed, 1);
        assert_eq!(report.skipped, 0);
    }

    #[tokio::test]
    async fn file_without_id_is_skipped_not_inserted() {
        let dir = tempfile::tempdir().unwrap();
        write_message(dir.path(), "2024-05-01", "chemedapp", 1, &message_json(1, 10));
        write_message(dir.path(), "2024-05-01", "chemedapp", 2, r#"{"message": "no id"}"#);

        let mut table = RawTable::default();
        let files = ingest::walk_files(dir.path(), &["json"]).await.unwrap();
        let report = ingest::run("load", files, &mut RawMessageJob, &mut table).await;
        assert_eq!(report.inserted, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(table.rows.len(), 1);
    }

    async fn run_load(conn: &mut sqlx::PgConnection, files: Vec<PathBuf>) -> IngestReport {
        let mut sink = RawMessageSink::begin(conn).await.unwrap();
        let report = ingest::run("load", files, &mut RawMessageJob, &mut sink).await;
        sink.finish().await.unwrap();
        report
    }

    #[tokio::test]
    async fn rejected_document_does_not_lose_the_rest_of_the_load() {
        let Some(mut conn) = database::test_connection().await else {
            return;
        };
        let dir = tempfile::tempdir().unwrap();
        write_message(dir.path(), "2024-05-01", "chemedapp", 1, &message_json(1, 10));
        write_message(
            dir.path(),
            "2024-05-01",
            "chemedapp",
            2,
            r#"{"id": 2, "peer_id": {"channel_id": 10}, "message": "nul \u0000 byte"}"#,
        );
        write_message(dir.path(), "2024-05-01", "chemedapp", 3, &message_json(3, 10));
        let files = ingest::walk_files(dir.path(), &["json"]).await.unwrap();

        let first = run_load(&mut conn, files.clone()).await;
        assert_eq!(first.inserted, 2);
        assert_eq!(first.failed, 1);

        let second = run_load(&mut conn, files).await;
        assert_eq!(second.inserted, 0);
        assert_eq!(second.duplicates, 2);
        assert_eq!(second.failed, 1);

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
