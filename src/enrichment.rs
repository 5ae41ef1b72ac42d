use std::collections::HashSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use log::info;
use serde_json::{json, Value};

use crate::config::Settings;
use crate::database::{self, DetectionRow, DetectionSink};
use crate::detector::{Detection, ObjectDetector, VisionDetector};
use crate::error::{Error, Result};
use crate::ingest::{self, Extracted, Ingest, IngestReport};

pub const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg"];

/// Runs a detector over new images and turns its output into detection rows.
pub struct EnrichmentJob<'d, D: ?Sized> {
    detector: &'d D,
    processed: HashSet<String>,
}

impl<'d, D: ObjectDetector + ?Sized> EnrichmentJob<'d, D> {
    /// `processed` holds image paths already present in the detections table.
    pub fn new(detector: &'d D, processed: HashSet<String>) -> Self {
        EnrichmentJob {
            detector,
            processed,
        }
    }
}

#[async_trait]
impl<D: ObjectDetector + ?Sized> Ingest for EnrichmentJob<'_, D> {
    type Item = PathBuf;
    type Row = DetectionRow;

    fn natural_key(&self, item: &PathBuf) -> String {
        item.to_string_lossy().into_owned()
    }

    fn already_done(&self, _item: &PathBuf, key: &str) -> bool {
        self.processed.contains(key)
    }

    async fn build(&mut self, item: &PathBuf) -> Result<Extracted<DetectionRow>> {
        let message_id = message_id_from_path(item)?;
        info!("Processing new image: {}", item.display());
        let detections = self.detector.detect(item).await?;
        let image_path = self.natural_key(item);
        Ok(Extracted::Rows(
            detections
                .into_iter()
                .map(|d| detection_row(message_id, &image_path, d))
                .collect(),
        ))
    }

    fn mark_done(&mut self, key: &str) {
        self.processed.insert(key.to_string());
    }
}

/// Images are stored as `<message_id>.jpg`.
pub fn message_id_from_path(path: &Path) -> Result<i64> {
    path.file_stem()
        .and_then(|stem| stem.to_str())
        .and_then(|stem| stem.parse::<i64>().ok())
        .ok_or_else(|| Error::InvalidFileName(path.to_path_buf()))
}

/// Coordinates are rounded to two decimals before they become part of the
/// unique key, so float noise from repeated runs does not create new rows.
pub fn quantize_box(bbox: [f64; 4]) -> Value {
    let rounded: Vec<f64> = bbox.iter().map(|v| (v * 100.0).round() / 100.0).collect();
    json!(rounded)
}

fn detection_row(message_id: i64, image_path: &str, detection: Detection) -> DetectionRow {
    DetectionRow {
        message_id,
        image_path: image_path.to_string(),
        object_class: detection.class_name,
        confidence: detection.confidence as f32,
        bounding_box: quantize_box(detection.bbox),
    }
}

/// Walk the image tree, detect objects on unprocessed images and store the results.
pub async fn run_enrichment(settings: &Settings) -> Result<IngestReport> {
    let detector = VisionDetector::new(&settings.model);
    let mut conn = database::connect(&settings.db).await?;
    database::init_enrichment_schema(&mut conn).await?;

    let processed = database::processed_images(&mut conn).await?;
    let images = ingest::walk_files(&settings.images_dir(), IMAGE_EXTENSIONS).await?;
    info!(
        "Found {} images, {} already enriched.",
        images.len(),
        processed.len()
    );

    let mut job = EnrichmentJob::new(&detector, processed);
    let mut sink = DetectionSink::new(&mut conn);
    Ok(ingest::run("enrich", images, &mut job, &mut sink).await)
}
