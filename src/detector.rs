use std::path::Path;

use async_trait::async_trait;
use base64::Engine;
use log::debug;
use ollama_rs::generation::completion::request::GenerationRequest;
use ollama_rs::generation::images::Image;
use ollama_rs::generation::parameters::FormatType;
use ollama_rs::Ollama;
use serde_json::Value;

use crate::config::ModelSettings;
use crate::error::{Error, Result};

/// One object found in an image.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub class_name: String,
    pub confidence: f64,
    /// Pixel coordinates `[x1, y1, x2, y2]`.
    pub bbox: [f64; 4],
}

#[async_trait]
pub trait ObjectDetector: Send + Sync {
    async fn detect(&self, image_path: &Path) -> Result<Vec<Detection>>;
}

const DETECTION_PROMPT: &str = "Detect every distinct object visible in this image.\n\
Answer with JSON only, in the form:\n\
{\"objects\": [{\"label\": \"<short lower-case class name>\", \"confidence\": <0..1>, \"box\": [x1, y1, x2, y2]}]}\n\
Box coordinates are absolute pixels of the top-left and bottom-right corners.\n\
Answer {\"objects\": []} if nothing is visible.";

/// Object detection through a local vision model served by Ollama.
pub struct VisionDetector {
    ollama: Ollama,
    model: String,
    min_confidence: f64,
}

impl VisionDetector {
    pub fn new(settings: &ModelSettings) -> Self {
        VisionDetector {
            ollama: Ollama::new(settings.host.clone(), settings.port),
            model: settings.vision_model.clone(),
            min_confidence: settings.min_confidence,
        }
    }
}

#[async_trait]
impl ObjectDetector for VisionDetector {
    async fn detect(&self, image_path: &Path) -> Result<Vec<Detection>> {
        let bytes = tokio::fs::read(image_path)
            .await
            .map_err(|e| Error::io(image_path, e))?;
        let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);

        let request = GenerationRequest::new(self.model.clone(), DETECTION_PROMPT.to_string())
            .images(vec![Image::from_base64(&encoded)])
            .format(FormatType::Json);
        let response = self
            .ollama
            .generate(request)
            .await
            .map_err(|e| Error::Model(format!("generation failed: {}", e)))?;
        debug!("Model response for {}: {}", image_path.display(), response.response);

        parse_detections(&response.response, self.min_confidence)
    }
}

/// Parse the model's JSON answer. Accepts a bare array or an object holding
/// `objects` / `detections`; entries without a label or a four-number box are dropped.
pub fn parse_detections(raw: &str, min_confidence: f64) -> Result<Vec<Detection>> {
    let value: Value = serde_json::from_str(raw.trim())
        .map_err(|e| Error::Model(format!("response is not JSON: {}", e)))?;
    let entries = match &value {
        Value::Array(items) => items.as_slice(),
        Value::Object(map) => match map.get("objects").or_else(|| map.get("detections")) {
            Some(Value::Array(items)) => items.as_slice(),
            _ => return Err(Error::Model("response has no object list".into())),
        },
        _ => return Err(Error::Model("unexpected response shape".into())),
    };

    let detections = entries
        .iter()
        .filter_map(parse_entry)
        .filter(|d| d.confidence >= min_confidence)
        .collect();
    Ok(detections)
}

fn parse_entry(entry: &Value) -> Option<Detection> {
    let label = entry
        .get("label")
        .or_else(|| entry.get("class"))
        .and_then(Value::as_str)?
        .trim()
        .to_lowercase();
    if label.is_empty() {
        return None;
    }
    // models sometimes omit confidence; treat that as certain
    let confidence = entry
        .get("confidence")
        .and_then(Value::as_f64)
        .unwrap_or(1.0)
        .clamp(0.0, 1.0);
    let coords = entry
        .get("box")
        .or_else(|| entry.get("bbox"))
        .and_then(Value::as_array)?;
    if coords.len() != 4 {
        return None;
    }
    let mut bbox = [0.0; 4];
    for (slot, v) in bbox.iter_mut().zip(coords) {
        *slot = v.as_f64()?;
    }
    Some(Detection {
        class_name: label,
        confidence,
        bbox,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_object_list() {
        let raw = r#"{"objects": [
            {"label": " Bottle ", "confidence": 0.91, "box": [10, 20.5, 110, 220]},
            {"label": "person", "confidence": 0.6, "box": [0, 0, 50, 50]}
        ]}"#;
        let found = parse_detections(raw, 0.25).unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].class_name, "bottle");
        assert_eq!(found[0].bbox, [10.0, 20.5, 110.0, 220.0]);
        assert_eq!(found[1].confidence, 0.6);
    }

    #[test]
    fn accepts_bare_array_and_alternate_keys() {
        let raw = r#"[{"class": "cup", "bbox": [1, 2, 3, 4]}]"#;
        let found = parse_detections(raw, 0.25).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].class_name, "cup");
        assert_eq!(found[0].confidence, 1.0);
    }

    #[test]
    fn drops_low_confidence_and_malformed_entries() {
        let raw = r#"{"detections": [
            {"label": "pill", "confidence": 0.1, "box": [1, 2, 3, 4]},
            {"label": "box", "confidence": 0.9, "box": [1, 2, 3]},
            {"label": "", "confidence": 0.9, "box": [1, 2, 3, 4]},
            {"confidence": 0.9, "box": [1, 2, 3, 4]},
            {"label": "syringe", "confidence": 7, "box": [1, 2, 3, 4]}
        ]}"#;
        let found = parse_detections(raw, 0.25).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].class_name, "syringe");
        assert_eq!(found[0].confidence, 1.0);
    }

    #[test]
    fn empty_list_means_no_detections() {
        assert!(parse_detections(r#"{"objects": []}"#, 0.25).unwrap().is_empty());
    }

    #[test]
    fn non_json_is_a_model_error() {
        assert!(matches!(
            parse_detections("I see a bottle", 0.25),
            Err(Error::Model(_))
        ));
        assert!(matches!(
            parse_detections(r#"{"answer": 1}"#, 0.25),
            Err(Error::Model(_))
        ));
    }
}
