//! Prediction payloads attached to records

use serde::{Serialize, Serializer};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Prediction attached to a [`DataItem`](super::DataItem)
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Annotation {
    /// Winning label of a score map, `None` when no score was positive
    Classification {
        /// Predicted label
        label: Option<String>,
    },
    /// Located objects
    Detection {
        /// Objects in reply order
        objects: Vec<LocatedObject>,
    },
    /// Per-pixel label indices
    Segmentation(SegmentationMask),
    /// Per-pixel depth values
    Depth(DepthMap),
}

/// A detected object with bounding box, polygon and metadata
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocatedObject {
    /// Left edge
    pub x: i64,
    /// Top edge
    pub y: i64,
    /// Width (inclusive pixel count)
    pub width: i64,
    /// Height (inclusive pixel count)
    pub height: i64,
    /// Outline points
    pub polygon: Vec<(i64, i64)>,
    /// Label, score and any other per-object values
    pub metadata: Map<String, Value>,
}

/// Label mask where each pixel holds an index into `labels`
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentationMask {
    /// Mask width
    pub width: u32,
    /// Mask height
    pub height: u32,
    /// Labels, position = pixel index
    pub labels: Vec<String>,
    /// Row-major pixel indices
    pub indices: Vec<u16>,
}

impl SegmentationMask {
    /// Binary layer for one label (`true` where the pixel carries that label)
    pub fn layer(&self, label: &str) -> Option<Vec<bool>> {
        let index = self.labels.iter().position(|l| l == label)? as u16;
        Some(self.indices.iter().map(|&i| i == index).collect())
    }

    /// Number of pixels per label; labels without pixels are omitted
    pub fn pixel_counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for &index in &self.indices {
            if let Some(label) = self.labels.get(index as usize) {
                *counts.entry(label.clone()).or_insert(0) += 1;
            }
        }
        counts
    }
}

// Masks are summarised; the raw index grid would swamp JSON output.
impl Serialize for SegmentationMask {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;
        let mut s = serializer.serialize_struct("SegmentationMask", 4)?;
        s.serialize_field("width", &self.width)?;
        s.serialize_field("height", &self.height)?;
        s.serialize_field("labels", &self.labels)?;
        s.serialize_field("pixel_counts", &self.pixel_counts())?;
        s.end()
    }
}

/// Depth map in row-major order
#[derive(Debug, Clone, PartialEq)]
pub struct DepthMap {
    /// Map width
    pub width: u32,
    /// Map height
    pub height: u32,
    /// Row-major depth values
    pub values: Vec<f32>,
}

impl DepthMap {
    /// Smallest and largest value, `None` for an empty map
    pub fn range(&self) -> Option<(f32, f32)> {
        self.values.iter().copied().fold(None, |acc, v| match acc {
            None => Some((v, v)),
            Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
        })
    }
}

impl Serialize for DepthMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;
        let (min, max) = self.range().unwrap_or((0.0, 0.0));
        let mut s = serializer.serialize_struct("DepthMap", 4)?;
        s.serialize_field("width", &self.width)?;
        s.serialize_field("height", &self.height)?;
        s.serialize_field("min", &min)?;
        s.serialize_field("max", &max)?;
        s.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_layers_and_counts() {
        let mask = SegmentationMask {
            width: 2,
            height: 2,
            labels: vec!["background".into(), "road".into()],
            indices: vec![0, 1, 1, 7],
        };

        assert_eq!(mask.layer("road").unwrap(), vec![false, true, true, false]);
        assert!(mask.layer("sky").is_none());

        let counts = mask.pixel_counts();
        assert_eq!(counts["background"], 1);
        assert_eq!(counts["road"], 2);
        assert_eq!(counts.len(), 2);
    }

    #[test]
    fn test_annotation_json_shape() {
        let value = serde_json::to_value(Annotation::Classification {
            label: Some("dog".into()),
        })
        .unwrap();
        assert_eq!(value["type"], "classification");
        assert_eq!(value["label"], "dog");

        let depth = serde_json::to_value(Annotation::Depth(DepthMap {
            width: 2,
            height: 1,
            values: vec![0.5, 2.0],
        }))
        .unwrap();
        assert_eq!(depth["type"], "depth");
        assert_eq!(depth["max"], 2.0);
    }
}
