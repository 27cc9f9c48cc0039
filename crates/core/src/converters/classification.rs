//! Image classification replies
//!
//! The reply is a JSON object mapping labels to scores. The winning label is
//! the first one (in payload order) whose score is strictly greater than every
//! score before it, starting from 0.0; when no score is positive the result
//! carries no label.

use super::{ConverterOutput, ResponseConverter};
use crate::data::{Annotation, DataItem};
use crate::{Error, Result};
use serde_json::{Map, Value};

/// Picks the highest-scoring label
#[derive(Debug, Clone, Copy, Default)]
pub struct ClassificationConverter;

/// Highest-scoring label of a score map
pub fn best_label(scores: &Map<String, Value>) -> Result<Option<String>> {
    let mut best: Option<&str> = None;
    let mut best_score = 0.0_f64;

    for (label, score) in scores {
        let score = score.as_f64().ok_or_else(|| {
            Error::unsupported("json", format!("score for '{}' is not a number: {}", label, score))
        })?;
        if score > best_score {
            best_score = score;
            best = Some(label);
        }
    }

    Ok(best.map(str::to_string))
}

impl ResponseConverter for ClassificationConverter {
    fn name(&self) -> &'static str {
        "classification"
    }

    fn convert(&self, original: &DataItem, payload: &[u8]) -> Result<ConverterOutput> {
        let value: Value = serde_json::from_slice(payload).map_err(|e| Error::unsupported("json", e))?;
        let Value::Object(scores) = value else {
            return Err(Error::unsupported("json", "expected an object of label scores"));
        };

        let label = best_label(&scores)?;
        tracing::debug!("Classified '{}' as {:?}", original.image_name, label);

        Ok(ConverterOutput::Single(
            original.with_annotation(Annotation::Classification { label }),
        ))
    }
}
