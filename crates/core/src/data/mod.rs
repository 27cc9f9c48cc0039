//! Records passed across the bridge boundary
//!
//! A [`DataItem`] carries the image payload that is published on the outbound
//! channel together with the pass-through fields (source, original bytes,
//! dimensions, metadata) that every converter must preserve when it builds a
//! result. The annotation slot is the only part a converter replaces.

pub mod annotation;

pub use annotation::{Annotation, DepthMap, LocatedObject, SegmentationMask};

use crate::{Error, Result};
use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::io::Cursor;

/// Kind of record a node accepts or generates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    /// Image with a single class label
    ImageClassification,
    /// Image with located objects (bbox + polygon)
    ObjectDetection,
    /// Image with a per-pixel label mask
    ImageSegmentation,
    /// Image with a per-pixel depth map
    Depth,
}

impl RecordKind {
    /// All supported kinds, in data-type order
    pub const ALL: [RecordKind; 4] = [
        RecordKind::ImageClassification,
        RecordKind::ObjectDetection,
        RecordKind::ImageSegmentation,
        RecordKind::Depth,
    ];

    /// Resolve a short data-type code ("ic", "od", "is", "dp")
    pub fn from_data_type(code: &str) -> Result<Self> {
        RecordKind::ALL
            .into_iter()
            .find(|kind| kind.data_type() == code)
            .ok_or_else(|| {
                Error::ConfigError(format!(
                    "Unknown data type '{}' (supported: ic, od, is, dp)",
                    code
                ))
            })
    }

    /// Short data-type code
    pub fn data_type(&self) -> &'static str {
        match self {
            RecordKind::ImageClassification => "ic",
            RecordKind::ObjectDetection => "od",
            RecordKind::ImageSegmentation => "is",
            RecordKind::Depth => "dp",
        }
    }

    /// Human readable name for logging
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::ImageClassification => "image_classification",
            RecordKind::ObjectDetection => "object_detection",
            RecordKind::ImageSegmentation => "image_segmentation",
            RecordKind::Depth => "depth",
        }
    }
}

impl std::fmt::Display for RecordKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which optional parts to include when rendering an item as JSON
#[derive(Debug, Clone, Copy, Default)]
pub struct DictOptions {
    /// Include the originating source identifier
    pub source: bool,
    /// Include the metadata map
    pub metadata: bool,
    /// Include the image bytes (base64)
    pub image: bool,
}

/// A record flowing through the pipeline
#[derive(Debug, Clone, PartialEq)]
pub struct DataItem {
    /// Record kind
    pub kind: RecordKind,
    /// Image file name
    pub image_name: String,
    /// Originating source identifier (file path, URL, ...)
    pub source: Option<String>,
    /// Original image bytes, published as-is on the outbound channel
    pub data: Bytes,
    /// Image format as reported by the decoder ("png", "jpg", ...)
    pub image_format: Option<String>,
    /// Pixel width, when known
    pub image_width: Option<u32>,
    /// Pixel height, when known
    pub image_height: Option<u32>,
    /// Prediction attached by a converter
    pub annotation: Option<Annotation>,
    /// Free-form metadata carried through unchanged
    pub metadata: Map<String, Value>,
}

impl DataItem {
    /// Create a record without annotation or metadata
    pub fn new(kind: RecordKind, image_name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            kind,
            image_name: image_name.into(),
            source: None,
            data: data.into(),
            image_format: None,
            image_width: None,
            image_height: None,
            annotation: None,
            metadata: Map::new(),
        }
    }

    /// Set the source identifier
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Set the pixel dimensions
    pub fn with_dimensions(mut self, width: u32, height: u32) -> Self {
        self.image_width = Some(width);
        self.image_height = Some(height);
        self
    }

    /// Set the image format
    pub fn with_image_format(mut self, format: impl Into<String>) -> Self {
        self.image_format = Some(format.into());
        self
    }

    /// Insert a metadata entry
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Build the result record for a prediction
    ///
    /// Every pass-through field is copied from `self`; only the annotation changes.
    pub fn with_annotation(&self, annotation: Annotation) -> Self {
        Self {
            annotation: Some(annotation),
            ..self.clone()
        }
    }

    /// Pixel dimensions, decoding the image header when they are not recorded
    pub fn dimensions(&self) -> Result<(u32, u32)> {
        if let (Some(w), Some(h)) = (self.image_width, self.image_height) {
            return Ok((w, h));
        }
        image::ImageReader::new(Cursor::new(self.data.as_ref()))
            .with_guessed_format()?
            .into_dimensions()
            .map_err(|e| {
                Error::InvalidData(format!(
                    "Cannot determine dimensions of '{}': {}",
                    self.image_name, e
                ))
            })
    }

    /// Render as a JSON object
    pub fn to_dict(&self, options: DictOptions) -> Result<Value> {
        let mut map = Map::new();
        map.insert("kind".into(), Value::String(self.kind.data_type().into()));
        map.insert("image_name".into(), Value::String(self.image_name.clone()));
        if let Some(format) = &self.image_format {
            map.insert("image_format".into(), Value::String(format.clone()));
        }
        if let (Some(w), Some(h)) = (self.image_width, self.image_height) {
            map.insert("image_width".into(), w.into());
            map.insert("image_height".into(), h.into());
        }
        if options.source {
            if let Some(source) = &self.source {
                map.insert("source".into(), Value::String(source.clone()));
            }
        }
        if options.image {
            let encoded = base64::engine::general_purpose::STANDARD.encode(&self.data);
            map.insert("image".into(), Value::String(encoded));
        }
        if let Some(annotation) = &self.annotation {
            map.insert("annotation".into(), serde_json::to_value(annotation)?);
        }
        if options.metadata && !self.metadata.is_empty() {
            map.insert("metadata".into(), Value::Object(self.metadata.clone()));
        }
        Ok(Value::Object(map))
    }
}
