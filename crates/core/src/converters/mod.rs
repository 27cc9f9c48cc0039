//! Response converters
//!
//! A converter turns the raw reply payload into a result record. Filter-mode
//! converters see the original request item and copy its pass-through fields
//! into the result; reader-mode converters build records from the payload
//! alone.
//!
//! Converters never touch session or listener state, so a failing conversion
//! affects only the item being converted.

use crate::data::{DataItem, RecordKind};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

pub mod classification;
pub mod depth;
pub mod detection;
pub mod image_listen;
pub mod segmentation;

pub use classification::ClassificationConverter;
pub use depth::{DepthConverter, DepthFormat};
pub use detection::{DetectionConverter, DetectionOptions};
pub use image_listen::ImageListenConverter;
pub use segmentation::{SegmentationConverter, SegmentationFormat};

/// Output of a conversion
///
/// Batches are flattened, so a converter may produce zero, one or several
/// records for one reply.
#[derive(Debug, Clone, PartialEq)]
pub enum ConverterOutput {
    /// One record
    Single(DataItem),
    /// Several records, in order
    Multiple(Vec<DataItem>),
    /// Nothing
    Empty,
}

impl ConverterOutput {
    /// Number of records
    pub fn len(&self) -> usize {
        match self {
            ConverterOutput::Single(_) => 1,
            ConverterOutput::Multiple(items) => items.len(),
            ConverterOutput::Empty => 0,
        }
    }

    /// Whether there are no records
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl IntoIterator for ConverterOutput {
    type Item = DataItem;
    type IntoIter = std::vec::IntoIter<DataItem>;

    fn into_iter(self) -> Self::IntoIter {
        match self {
            ConverterOutput::Single(item) => vec![item].into_iter(),
            ConverterOutput::Multiple(items) => items.into_iter(),
            ConverterOutput::Empty => Vec::new().into_iter(),
        }
    }
}

/// Converts the reply to a published request item
pub trait ResponseConverter: Send + Sync {
    /// Converter name for logging
    fn name(&self) -> &'static str;

    /// Build the result for `original` from the raw reply
    ///
    /// # Errors
    ///
    /// * `Error::UnsupportedFormat` - The payload cannot be decoded
    fn convert(&self, original: &DataItem, payload: &[u8]) -> Result<ConverterOutput>;
}

/// Converts payloads that arrive without a request (reader mode)
///
/// Takes `&mut self` because readers number the records they produce.
pub trait ReaderConverter: Send {
    /// Converter name for logging
    fn name(&self) -> &'static str;

    /// Build records from the raw payload
    fn convert(&mut self, payload: &[u8]) -> Result<ConverterOutput>;
}

/// Prediction kind handled by a filter-mode bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PredictionKind {
    /// Image classification ("ic")
    #[serde(rename = "ic")]
    Classification,
    /// Object detection ("od")
    #[serde(rename = "od")]
    Detection,
    /// Image segmentation ("is")
    #[serde(rename = "is")]
    Segmentation,
    /// Depth estimation ("dp")
    #[serde(rename = "dp")]
    Depth,
}

impl PredictionKind {
    /// All kinds
    pub const ALL: [PredictionKind; 4] = [
        PredictionKind::Classification,
        PredictionKind::Detection,
        PredictionKind::Segmentation,
        PredictionKind::Depth,
    ];

    /// Record kind consumed and produced
    pub fn record_kind(&self) -> RecordKind {
        match self {
            PredictionKind::Classification => RecordKind::ImageClassification,
            PredictionKind::Detection => RecordKind::ObjectDetection,
            PredictionKind::Segmentation => RecordKind::ImageSegmentation,
            PredictionKind::Depth => RecordKind::Depth,
        }
    }

    /// Short code ("ic", "od", "is", "dp")
    pub fn code(&self) -> &'static str {
        self.record_kind().data_type()
    }

    /// Plugin name of the filter node
    pub fn node_type(&self) -> &'static str {
        match self {
            PredictionKind::Classification => "redis-predict-ic",
            PredictionKind::Detection => "redis-predict-od",
            PredictionKind::Segmentation => "redis-predict-is",
            PredictionKind::Depth => "redis-predict-dp",
        }
    }

    /// One-line description for listings
    pub fn description(&self) -> &'static str {
        match self {
            PredictionKind::Classification => "Makes image classification predictions via Redis backend.",
            PredictionKind::Detection => "Makes object detection predictions via Redis backend.",
            PredictionKind::Segmentation => "Makes image segmentation predictions via Redis backend.",
            PredictionKind::Depth => "Makes depth information predictions via Redis backend.",
        }
    }

    /// Build the converter for this kind from node parameters
    ///
    /// # Errors
    ///
    /// * `Error::ConfigError` - Missing required option (e.g. segmentation labels)
    /// * `Error::UnsupportedFormat` - Unknown encoding tag
    pub fn converter(&self, params: &Value) -> Result<Box<dyn ResponseConverter>> {
        Ok(match self {
            PredictionKind::Classification => Box::new(ClassificationConverter),
            PredictionKind::Detection => Box::new(DetectionConverter::from_params(params)?),
            PredictionKind::Segmentation => Box::new(SegmentationConverter::from_params(params)?),
            PredictionKind::Depth => Box::new(DepthConverter::from_params(params)?),
        })
    }
}

impl FromStr for PredictionKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let kind = RecordKind::from_data_type(s)?;
        PredictionKind::ALL
            .into_iter()
            .find(|p| p.record_kind() == kind)
            .ok_or_else(|| Error::ConfigError(format!("No prediction kind for '{}'", s)))
    }
}

impl fmt::Display for PredictionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Decode an image reply, mapping decoder failures to `UnsupportedFormat`
pub(crate) fn decode_image(format: &str, payload: &[u8]) -> Result<image::DynamicImage> {
    image::load_from_memory(payload).map_err(|e| Error::unsupported(format, e))
}
