//! Incremental, idempotent ingestion shared by the scraper, the raw loader and
//! the image enrichment stage.
//!
//! Every item gets a natural key. A cheap pre-check can skip work that is
//! obviously done, while the sink (a unique constraint, or create-new file
//! semantics) is the authoritative duplicate guard. A failure on one item is
//! logged with its key and the walk moves on.

use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use log::{error, info, warn};
use tokio::fs;

use crate::error::{Error, Result};

/// What `Ingest::build` produced for one item.
#[derive(Debug)]
pub enum Extracted<R> {
    Rows(Vec<R>),
    /// Item is unusable (e.g. no message id); logged as a warning, not an error.
    Skip(String),
}

/// Per-source behavior plugged into [`run`].
#[async_trait]
pub trait Ingest: Send {
    type Item: Send + Sync;
    type Row: Send;

    fn natural_key(&self, item: &Self::Item) -> String;

    /// Cheap check for items that are obviously processed already.
    fn already_done(&self, _item: &Self::Item, _key: &str) -> bool {
        false
    }

    async fn build(&mut self, item: &Self::Item) -> Result<Extracted<Self::Row>>;

    /// Called after the sink accepted every row of an item.
    fn mark_done(&mut self, _key: &str) {}
}

/// Inserted vs. already-present counts for one `store` call.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Tally {
    pub inserted: usize,
    pub duplicates: usize,
}

impl Tally {
    pub fn inserted() -> Self {
        Tally {
            inserted: 1,
            duplicates: 0,
        }
    }

    pub fn duplicate() -> Self {
        Tally {
            inserted: 0,
            duplicates: 1,
        }
    }
}

impl std::ops::AddAssign for Tally {
    fn add_assign(&mut self, other: Tally) {
        self.inserted += other.inserted;
        self.duplicates += other.duplicates;
    }
}

/// Persists the rows derived from one item. A conflict on the natural key is
/// reported as a duplicate, never as an error.
#[async_trait]
pub trait Sink<R: Send>: Send {
    async fn store(&mut self, key: &str, rows: Vec<R>) -> Result<Tally>;
}

/// Counters for one ingestion run.
///
/// Everything that ends up not stored without being an error is a skip:
/// `already_done` (pre-check hit), `duplicates` (natural-key conflict in the
/// sink) and `skipped` (item without a usable key). `skipped_total` adds them
/// up. `failed` counts items whose read, parse, model call or insert errored.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IngestReport {
    pub seen: usize,
    pub already_done: usize,
    pub inserted: usize,
    pub duplicates: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl IngestReport {
    pub fn skipped_total(&self) -> usize {
        self.already_done + self.duplicates + self.skipped
    }
}

impl std::ops::AddAssign<&IngestReport> for IngestReport {
    fn add_assign(&mut self, other: &IngestReport) {
        self.seen += other.seen;
        self.already_done += other.already_done;
        self.inserted += other.inserted;
        self.duplicates += other.duplicates;
        self.skipped += other.skipped;
        self.failed += other.failed;
    }
}

impl fmt::Display for IngestReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "seen={} inserted={} skipped_total={} (duplicates={} already_done={} skipped={}) failed={}",
            self.seen,
            self.inserted,
            self.skipped_total(),
            self.duplicates,
            self.already_done,
            self.skipped,
            self.failed
        )
    }
}

/// Process every item at most once against `sink`.
pub async fn run<J, S, I>(label: &str, items: I, job: &mut J, sink: &mut S) -> IngestReport
where
    J: Ingest,
    S: Sink<J::Row>,
    I: IntoIterator<Item = J::Item>,
    I::IntoIter: Send,
{
    info!("{}: starting ingestion", label);
    let mut report = IngestReport::default();

    for item in items {
        report.seen += 1;
        let key = job.natural_key(&item);

        if job.already_done(&item, &key) {
            report.already_done += 1;
            continue;
        }

        let rows = match job.build(&item).await {
            Ok(Extracted::Rows(rows)) => rows,
            Ok(Extracted::Skip(reason)) => {
                warn!("{}: skipping {}: {}", label, key, reason);
                report.skipped += 1;
                continue;
            }
            Err(e) => {
                error!("{}: failed to process {}: {}", label, key, e);
                report.failed += 1;
                continue;
            }
        };

        match sink.store(&key, rows).await {
            Ok(tally) => {
                report.inserted += tally.inserted;
                report.duplicates += tally.duplicates;
                job.mark_done(&key);
            }
            Err(e) => {
                error!("{}: failed to store {}: {}", label, key, e);
                report.failed += 1;
            }
        }
    }

    info!("{}: finished ingestion ({})", label, report);
    report
}

/// Recursively list files under `root` whose extension matches one of
/// `extensions` (case-insensitive). A missing root yields no files.
pub async fn walk_files(root: &Path, extensions: &[&str]) -> Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    if !fs::try_exists(root).await.map_err(|e| Error::io(root, e))? {
        warn!("{} does not exist, nothing to walk", root.display());
        return Ok(found);
    }
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let mut entries = fs::read_dir(&dir).await.map_err(|e| Error::io(&dir, e))?;
        while let Some(entry) = entries.next_entry().await.map_err(|e| Error::io(&dir, e))? {
            let path = entry.path();
            let file_type = entry.file_type().await.map_err(|e| Error::io(&path, e))?;
            if file_type.is_dir() {
                pending.push(path);
            } else if has_extension(&path, extensions) {
                found.push(path);
            }
        }
    }
    found.sort();
    Ok(found)
}

fn has_extension(path: &Path, extensions: &[&str]) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| extensions.iter().any(|want| want.eq_ignore_ascii_case(ext)))
        .unwrap_or(false)
}
