//! Images received without a request (reader mode)

use super::ReaderConverter;
use crate::converters::ConverterOutput;
use crate::data::{DataItem, RecordKind};
use crate::{Error, Result};
use bytes::Bytes;
use image::ImageFormat;
use serde::Deserialize;
use serde_json::Value;
use std::io::Cursor;

#[derive(Debug, Deserialize)]
struct ImageListenParams {
    #[serde(default)]
    data_type: Option<String>,
    #[serde(default)]
    prefix: Option<String>,
}

/// Wraps every received image as a record of the configured kind
///
/// Records are named `<prefix>-<n>.<ext>` (or `<n>.<ext>` without a prefix),
/// counting from 1 for the lifetime of the converter. Payloads that fail to
/// decode still use up their number.
#[derive(Debug, Clone)]
pub struct ImageListenConverter {
    kind: RecordKind,
    prefix: String,
    counter: u64,
}

impl ImageListenConverter {
    /// Create a converter
    pub fn new(kind: RecordKind, prefix: impl Into<String>) -> Self {
        Self {
            kind,
            prefix: prefix.into(),
            counter: 0,
        }
    }

    /// Parse `data_type` (required) and `prefix` from node parameters
    ///
    /// # Errors
    ///
    /// * `Error::ConfigError` - `data_type` missing or not one of ic, od, is, dp
    pub fn from_params(params: &Value) -> Result<Self> {
        let parsed: ImageListenParams = serde_json::from_value(params.clone()).map_err(|e| {
            Error::ConfigError(format!("Failed to parse image listen options: {}", e))
        })?;
        let data_type = parsed
            .data_type
            .ok_or_else(|| Error::ConfigError("No data type defined!".into()))?;
        let kind = RecordKind::from_data_type(&data_type)?;
        Ok(Self::new(kind, parsed.prefix.unwrap_or_default()))
    }

    /// Kind of the records produced
    pub fn kind(&self) -> RecordKind {
        self.kind
    }

    /// Number of images converted so far
    pub fn count(&self) -> u64 {
        self.counter
    }

    fn image_name(&self, extension: &str) -> String {
        if self.prefix.is_empty() {
            format!("{}.{}", self.counter, extension)
        } else {
            format!("{}-{}.{}", self.prefix, self.counter, extension)
        }
    }
}

impl ReaderConverter for ImageListenConverter {
    fn name(&self) -> &'static str {
        "image_listen"
    }

    fn convert(&mut self, payload: &[u8]) -> Result<ConverterOutput> {
        // Every payload takes a number, decodable or not
        self.counter += 1;

        let reader = image::ImageReader::new(Cursor::new(payload)).with_guessed_format()?;
        let format = reader
            .format()
            .ok_or_else(|| Error::unsupported("image", "unrecognized image data"))?;
        let (width, height) = reader
            .into_dimensions()
            .map_err(|e| Error::unsupported("image", e))?;

        let extension = match format {
            ImageFormat::Jpeg => "jpg",
            other => other.extensions_str().first().copied().unwrap_or("bin"),
        };
        let name = self.image_name(extension);
        tracing::debug!("Received {} ({}x{})", name, width, height);

        let item = DataItem::new(self.kind, name, Bytes::copy_from_slice(payload))
            .with_image_format(format!("{:?}", format).to_uppercase())
            .with_dimensions(width, height);
        Ok(ConverterOutput::Single(item))
    }
}
