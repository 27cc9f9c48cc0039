//! Object detection replies in OPEX JSON
//!
//! ```json
//! {"id": "img-1", "timestamp": "...", "objects": [
//!   {"label": "car", "score": 0.93,
//!    "bbox": {"left": 10, "top": 5, "right": 49, "bottom": 24},
//!    "polygon": {"points": [[10, 5], [49, 5], [49, 24], [10, 24]]}}
//! ]}
//! ```
//!
//! Bounding boxes are inclusive, so width is `right - left + 1`.

use super::{ConverterOutput, ResponseConverter};
use crate::data::{Annotation, DataItem, LocatedObject};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Deserialize)]
struct OpexPredictions {
    #[serde(default)]
    objects: Vec<OpexObject>,
}

#[derive(Debug, Deserialize)]
struct OpexObject {
    label: String,
    #[serde(default)]
    score: Option<f64>,
    bbox: OpexBBox,
    #[serde(default)]
    polygon: Option<OpexPolygon>,
}

#[derive(Debug, Deserialize)]
struct OpexBBox {
    left: i64,
    top: i64,
    right: i64,
    bottom: i64,
}

#[derive(Debug, Deserialize)]
struct OpexPolygon {
    points: Vec<(i64, i64)>,
}

/// Metadata keys the label and score are stored under
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionOptions {
    /// Metadata key for the label
    ///
    /// Default: "type"
    #[serde(default = "default_key_label")]
    pub key_label: String,

    /// Metadata key for the score
    ///
    /// Default: "score"
    #[serde(default = "default_key_score")]
    pub key_score: String,
}

fn default_key_label() -> String {
    "type".to_string()
}

fn default_key_score() -> String {
    "score".to_string()
}

impl Default for DetectionOptions {
    fn default() -> Self {
        Self {
            key_label: default_key_label(),
            key_score: default_key_score(),
        }
    }
}

/// Converts OPEX predictions into located objects
#[derive(Debug, Clone, Default)]
pub struct DetectionConverter {
    options: DetectionOptions,
}

impl DetectionConverter {
    /// Create with explicit metadata keys
    pub fn new(options: DetectionOptions) -> Self {
        Self { options }
    }

    /// Parse `key_label` / `key_score` from node parameters
    pub fn from_params(params: &Value) -> Result<Self> {
        let options: DetectionOptions = serde_json::from_value(params.clone())
            .map_err(|e| Error::ConfigError(format!("Failed to parse DetectionOptions: {}", e)))?;
        Ok(Self::new(options))
    }

    fn located(&self, object: OpexObject) -> Result<LocatedObject> {
        let bbox = object.bbox;
        let width = inclusive_extent(bbox.left, bbox.right)?;
        let height = inclusive_extent(bbox.top, bbox.bottom)?;
        let mut metadata = Map::new();
        if let Some(score) = object.score {
            metadata.insert(self.options.key_score.clone(), Value::from(score));
        }
        metadata.insert(self.options.key_label.clone(), Value::String(object.label));

        Ok(LocatedObject {
            x: bbox.left,
            y: bbox.top,
            width,
            height,
            polygon: object.polygon.map(|p| p.points).unwrap_or_default(),
            metadata,
        })
    }
}

/// `end - start + 1`, rejecting boxes whose extent does not fit an `i64`
fn inclusive_extent(start: i64, end: i64) -> Result<i64> {
    end.checked_sub(start)
        .and_then(|d| d.checked_add(1))
        .ok_or_else(|| {
            Error::unsupported("opex", format!("bounding box {}..{} out of range", start, end))
        })
}

impl ResponseConverter for DetectionConverter {
    fn name(&self) -> &'static str {
        "object_detection"
    }

    fn convert(&self, original: &DataItem, payload: &[u8]) -> Result<ConverterOutput> {
        let predictions: OpexPredictions =
            serde_json::from_slice(payload).map_err(|e| Error::unsupported("opex", e))?;

        let objects: Vec<LocatedObject> = predictions
            .objects
            .into_iter()
            .map(|object| self.located(object))
            .collect::<Result<_>>()?;
        tracing::debug!("{} object(s) for '{}'", objects.len(), original.image_name);

        Ok(ConverterOutput::Single(
            original.with_annotation(Annotation::Detection { objects }),
        ))
    }
}
