//! Image segmentation replies
//!
//! The reply is an image whose pixel values index into the configured label
//! list. Three encodings are understood:
//!
//! - `indexedpng`: palette PNG, the palette index is the label index
//! - `bluechannel`: RGB image, the blue channel carries the index
//! - `grayscale`: 8-bit grayscale image, the gray value is the index
//!
//! Replies whose size differs from the request image are resized to the
//! request's dimensions. Palette indices are resized nearest-neighbour; the
//! other encodings bilinearly.

use super::{decode_image, ConverterOutput, ResponseConverter};
use crate::data::{Annotation, DataItem, SegmentationMask};
use crate::{Error, Result};
use image::imageops::{self, FilterType};
use image::GrayImage;
use serde::Deserialize;
use serde_json::Value;
use std::fmt;
use std::io::Cursor;
use std::str::FromStr;

/// Encoding of a segmentation reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SegmentationFormat {
    /// Palette PNG
    #[default]
    IndexedPng,
    /// Blue channel of an RGB image
    BlueChannel,
    /// 8-bit grayscale image
    Grayscale,
}

impl SegmentationFormat {
    /// Configuration spelling
    pub fn as_str(&self) -> &'static str {
        match self {
            SegmentationFormat::IndexedPng => "indexedpng",
            SegmentationFormat::BlueChannel => "bluechannel",
            SegmentationFormat::Grayscale => "grayscale",
        }
    }
}

impl FromStr for SegmentationFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "indexedpng" => Ok(SegmentationFormat::IndexedPng),
            "bluechannel" => Ok(SegmentationFormat::BlueChannel),
            "grayscale" => Ok(SegmentationFormat::Grayscale),
            other => Err(Error::unsupported(
                other,
                "segmentation image_format must be one of indexedpng, bluechannel, grayscale",
            )),
        }
    }
}

impl fmt::Display for SegmentationFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Deserialize)]
struct SegmentationParams {
    #[serde(default)]
    image_format: Option<String>,
    #[serde(default)]
    labels: Option<Vec<String>>,
}

/// Converts label-index images into segmentation masks
#[derive(Debug, Clone)]
pub struct SegmentationConverter {
    format: SegmentationFormat,
    labels: Vec<String>,
}

impl SegmentationConverter {
    /// Create a converter
    ///
    /// # Errors
    ///
    /// * `Error::ConfigError` - `labels` is empty
    pub fn new(format: SegmentationFormat, labels: Vec<String>) -> Result<Self> {
        if labels.is_empty() {
            return Err(Error::ConfigError("No labels defined!".into()));
        }
        Ok(Self { format, labels })
    }

    /// Parse `image_format` and `labels` from node parameters
    pub fn from_params(params: &Value) -> Result<Self> {
        let parsed: SegmentationParams = serde_json::from_value(params.clone()).map_err(|e| {
            Error::ConfigError(format!("Failed to parse segmentation options: {}", e))
        })?;
        let format = match parsed.image_format.as_deref() {
            Some(tag) => tag.parse()?,
            None => SegmentationFormat::default(),
        };
        Self::new(format, parsed.labels.unwrap_or_default())
    }

    /// Configured encoding
    pub fn format(&self) -> SegmentationFormat {
        self.format
    }

    fn index_image(&self, payload: &[u8]) -> Result<GrayImage> {
        match self.format {
            SegmentationFormat::IndexedPng => decode_palette_indices(payload),
            SegmentationFormat::BlueChannel => {
                let rgb = decode_image(self.format.as_str(), payload)?.to_rgb8();
                let (width, height) = rgb.dimensions();
                let blue: Vec<u8> = rgb.pixels().map(|p| p.0[2]).collect();
                GrayImage::from_raw(width, height, blue)
                    .ok_or_else(|| Error::unsupported(self.format.as_str(), "pixel buffer size mismatch"))
            }
            SegmentationFormat::Grayscale => {
                Ok(decode_image(self.format.as_str(), payload)?.to_luma8())
            }
        }
    }

    fn filter_type(&self) -> FilterType {
        match self.format {
            SegmentationFormat::IndexedPng => FilterType::Nearest,
            SegmentationFormat::BlueChannel | SegmentationFormat::Grayscale => FilterType::Triangle,
        }
    }
}

/// Raw palette indices of an indexed PNG (8-bit grayscale is accepted as-is)
fn decode_palette_indices(payload: &[u8]) -> Result<GrayImage> {
    const FORMAT: &str = "indexedpng";

    let mut decoder = png::Decoder::new(Cursor::new(payload));
    // Keep indices instead of expanding the palette to RGB
    decoder.set_transformations(png::Transformations::IDENTITY);
    let mut reader = decoder.read_info().map_err(|e| Error::unsupported(FORMAT, e))?;
    let mut buffer = vec![0u8; reader.output_buffer_size()];
    let info = reader
        .next_frame(&mut buffer)
        .map_err(|e| Error::unsupported(FORMAT, e))?;

    match info.color_type {
        png::ColorType::Indexed | png::ColorType::Grayscale => {}
        other => {
            return Err(Error::unsupported(
                FORMAT,
                format!("expected a palette image, got {:?}", other),
            ))
        }
    }

    let bits = info.bit_depth as u8;
    if bits > 8 {
        return Err(Error::unsupported(FORMAT, format!("unsupported bit depth {}", bits)));
    }

    let (width, height) = (info.width, info.height);
    let mut indices = Vec::with_capacity(width as usize * height as usize);
    for row in buffer[..info.buffer_size()].chunks(info.line_size) {
        indices.extend(unpack_row(row, bits, width as usize));
    }

    GrayImage::from_raw(width, height, indices)
        .ok_or_else(|| Error::unsupported(FORMAT, "pixel buffer size mismatch"))
}

/// Unpack sub-byte samples (MSB first) into one byte per pixel
fn unpack_row(row: &[u8], bits: u8, width: usize) -> Vec<u8> {
    if bits == 8 {
        return row[..width.min(row.len())].to_vec();
    }
    let per_byte = (8 / bits) as usize;
    let mask = (1u16 << bits) as u8 - 1;
    (0..width)
        .map(|x| {
            let byte = row.get(x / per_byte).copied().unwrap_or_default();
            let shift = 8 - bits as usize * (x % per_byte + 1);
            (byte >> shift) & mask
        })
        .collect()
}

impl ResponseConverter for SegmentationConverter {
    fn name(&self) -> &'static str {
        "image_segmentation"
    }

    fn convert(&self, original: &DataItem, payload: &[u8]) -> Result<ConverterOutput> {
        let (width, height) = original.dimensions()?;
        let mut indices = self.index_image(payload)?;
        if indices.dimensions() != (width, height) {
            tracing::debug!(
                "Resizing {:?} mask to {}x{} for '{}'",
                indices.dimensions(),
                width,
                height,
                original.image_name
            );
            indices = imageops::resize(&indices, width, height, self.filter_type());
        }

        let unknown = indices
            .as_raw()
            .iter()
            .filter(|&&i| i as usize >= self.labels.len())
            .count();
        if unknown > 0 {
            tracing::warn!(
                "{} pixel(s) of '{}' have no label (only {} labels defined)",
                unknown,
                original.image_name,
                self.labels.len()
            );
        }

        let mask = SegmentationMask {
            width,
            height,
            labels: self.labels.clone(),
            indices: indices.into_raw().into_iter().map(u16::from).collect(),
        };
        Ok(ConverterOutput::Single(
            original.with_annotation(Annotation::Segmentation(mask)),
        ))
    }
}
