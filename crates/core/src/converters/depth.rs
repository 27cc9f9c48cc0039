//! Depth estimation replies
//!
//! Supported `data_format` values:
//!
//! - `grayscale` (default): 8-bit grayscale image
//! - `grayscale-depth`: 16-bit grayscale image
//! - `numpy`: a 2-D `.npy` array (u8, u16, i32, f32 or f64, little-endian)
//!
//! Image replies are resized bilinearly to the request's dimensions; arrays
//! are taken as-is.

use super::{decode_image, ConverterOutput, ResponseConverter};
use crate::data::{Annotation, DataItem, DepthMap};
use crate::{Error, Result};
use image::imageops::{self, FilterType};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Encoding of a depth reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DepthFormat {
    /// 8-bit grayscale image
    #[default]
    Grayscale,
    /// 16-bit grayscale image
    GrayscaleDepth,
    /// NumPy `.npy` array
    Numpy,
}

impl DepthFormat {
    /// Configuration spelling
    pub fn as_str(&self) -> &'static str {
        match self {
            DepthFormat::Grayscale => "grayscale",
            DepthFormat::GrayscaleDepth => "grayscale-depth",
            DepthFormat::Numpy => "numpy",
        }
    }
}

impl FromStr for DepthFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "grayscale" => Ok(DepthFormat::Grayscale),
            "grayscale-depth" => Ok(DepthFormat::GrayscaleDepth),
            "numpy" => Ok(DepthFormat::Numpy),
            other => Err(Error::unsupported(
                other,
                "depth data_format must be one of grayscale, grayscale-depth, numpy",
            )),
        }
    }
}

impl fmt::Display for DepthFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Converts depth replies into depth maps
#[derive(Debug, Clone, Default)]
pub struct DepthConverter {
    format: DepthFormat,
}

impl DepthConverter {
    /// Create a converter for the given encoding
    pub fn new(format: DepthFormat) -> Self {
        Self { format }
    }

    /// Parse `data_format` from node parameters
    pub fn from_params(params: &Value) -> Result<Self> {
        let format = match params.get("data_format") {
            None | Some(Value::Null) => DepthFormat::default(),
            Some(Value::String(tag)) => tag.parse()?,
            Some(other) => {
                return Err(Error::ConfigError(format!(
                    "data_format must be a string, got {}",
                    other
                )))
            }
        };
        Ok(Self::new(format))
    }

    /// Configured encoding
    pub fn format(&self) -> DepthFormat {
        self.format
    }

    fn depth_map(&self, original: &DataItem, payload: &[u8]) -> Result<DepthMap> {
        let tag = self.format.as_str();
        match self.format {
            DepthFormat::Grayscale => {
                let (width, height) = original.dimensions()?;
                let mut gray = decode_image(tag, payload)?.to_luma8();
                if gray.dimensions() != (width, height) {
                    gray = imageops::resize(&gray, width, height, FilterType::Triangle);
                }
                Ok(DepthMap {
                    width,
                    height,
                    values: gray.into_raw().into_iter().map(f32::from).collect(),
                })
            }
            DepthFormat::GrayscaleDepth => {
                let (width, height) = original.dimensions()?;
                let mut gray = decode_image(tag, payload)?.to_luma16();
                if gray.dimensions() != (width, height) {
                    gray = imageops::resize(&gray, width, height, FilterType::Triangle);
                }
                Ok(DepthMap {
                    width,
                    height,
                    values: gray.into_raw().into_iter().map(f32::from).collect(),
                })
            }
            DepthFormat::Numpy => parse_npy(payload),
        }
    }
}

impl ResponseConverter for DepthConverter {
    fn name(&self) -> &'static str {
        "depth"
    }

    fn convert(&self, original: &DataItem, payload: &[u8]) -> Result<ConverterOutput> {
        let depth = self.depth_map(original, payload)?;
        tracing::debug!(
            "Depth map {}x{} for '{}'",
            depth.width,
            depth.height,
            original.image_name
        );
        Ok(ConverterOutput::Single(
            original.with_annotation(Annotation::Depth(depth)),
        ))
    }
}

const NPY_MAGIC: &[u8] = b"\x93NUMPY";

/// Parse a 2-D `.npy` array into a row-major depth map
fn parse_npy(payload: &[u8]) -> Result<DepthMap> {
    let bad = |reason: &str| Error::unsupported("numpy", reason);

    if payload.len() < 10 || !payload.starts_with(NPY_MAGIC) {
        return Err(bad("missing .npy magic"));
    }
    let major = payload[6];
    let (header_len, header_start) = match major {
        1 => (u16::from_le_bytes([payload[8], payload[9]]) as usize, 10),
        2 | 3 => {
            if payload.len() < 12 {
                return Err(bad("truncated header"));
            }
            let len = u32::from_le_bytes([payload[8], payload[9], payload[10], payload[11]]);
            (len as usize, 12)
        }
        other => return Err(Error::unsupported("numpy", format!("unknown .npy version {}", other))),
    };
    let data_start = header_start + header_len;
    if payload.len() < data_start {
        return Err(bad("truncated header"));
    }
    let header = std::str::from_utf8(&payload[header_start..data_start])
        .map_err(|_| bad("header is not text"))?;

    let descr = header_str_value(header, "descr").ok_or_else(|| bad("header lacks 'descr'"))?;
    let fortran = header_raw_value(header, "fortran_order")
        .map(|v| v.starts_with("True"))
        .unwrap_or(false);
    let shape = header_shape(header).ok_or_else(|| bad("header lacks 'shape'"))?;

    let (height, width) = match shape.as_slice() {
        [h, w] => (*h, *w),
        [h, w, 1] => (*h, *w),
        _ => {
            return Err(Error::unsupported(
                "numpy",
                format!("expected a 2-D array, got shape {:?}", shape),
            ))
        }
    };

    let count = height
        .checked_mul(width)
        .ok_or_else(|| bad("array too large"))?;
    let body = &payload[data_start..];
    let values = decode_elements(descr, body, count)?;

    let values = if fortran {
        // Column-major on disk
        (0..count)
            .map(|i| values[(i % width) * height + i / width])
            .collect()
    } else {
        values
    };

    Ok(DepthMap {
        width: u32::try_from(width).map_err(|_| bad("array too wide"))?,
        height: u32::try_from(height).map_err(|_| bad("array too tall"))?,
        values,
    })
}

fn decode_elements(descr: &str, body: &[u8], count: usize) -> Result<Vec<f32>> {
    let size = match descr {
        "|u1" | "<u1" | "|i1" | "<i1" => 1,
        "<u2" => 2,
        "<i4" | "<f4" => 4,
        "<f8" => 8,
        other => {
            return Err(Error::unsupported(
                "numpy",
                format!("unsupported dtype '{}'", other),
            ))
        }
    };
    let needed = count
        .checked_mul(size)
        .ok_or_else(|| Error::unsupported("numpy", "array too large"))?;
    if body.len() < needed {
        return Err(Error::unsupported(
            "numpy",
            format!("expected {} bytes of data, got {}", needed, body.len()),
        ));
    }

    let chunks = body[..needed].chunks_exact(size);
    let values = match descr {
        "|u1" | "<u1" => chunks.map(|b| f32::from(b[0])).collect(),
        "|i1" | "<i1" => chunks.map(|b| f32::from(b[0] as i8)).collect(),
        "<u2" => chunks.map(|b| f32::from(u16::from_le_bytes([b[0], b[1]]))).collect(),
        "<i4" => chunks
            .map(|b| i32::from_le_bytes([b[0], b[1], b[2], b[3]]) as f32)
            .collect(),
        "<f4" => chunks
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect(),
        _ => chunks
            .map(|b| {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(b);
                f64::from_le_bytes(raw) as f32
            })
            .collect(),
    };
    Ok(values)
}

/// Text following `'key':` in the header dict, trimmed
fn header_raw_value<'a>(header: &'a str, key: &str) -> Option<&'a str> {
    let needle = format!("'{}':", key);
    let start = header.find(&needle)? + needle.len();
    Some(header[start..].trim_start())
}

fn header_str_value<'a>(header: &'a str, key: &str) -> Option<&'a str> {
    let rest = header_raw_value(header, key)?.strip_prefix('\'')?;
    let end = rest.find('\'')?;
    Some(&rest[..end])
}

fn header_shape(header: &str) -> Option<Vec<usize>> {
    let rest = header_raw_value(header, "shape")?.strip_prefix('(')?;
    let end = rest.find(')')?;
    rest[..end]
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse().ok())
        .collect()
}
