//! Image files to records

use anyhow::{Context, Result};
use bytes::Bytes;
use redis_bridge_core::{DataItem, RecordKind};
use std::io::Cursor;
use std::path::Path;

/// Read an image file into a record of `kind`
///
/// Dimensions and format are taken from the image header; files that are not
/// images are still loaded, just without them.
pub fn load_item(path: &Path, kind: RecordKind) -> Result<DataItem> {
    let data = std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .with_context(|| format!("No usable file name in {}", path.display()))?
        .to_string();

    let mut item = DataItem::new(kind, name, Bytes::from(data.clone()))
        .with_source(path.display().to_string());

    let reader = image::ImageReader::new(Cursor::new(&data)).with_guessed_format()?;
    match reader.format() {
        Some(format) => {
            item = item.with_image_format(format!("{:?}", format).to_uppercase());
            match reader.into_dimensions() {
                Ok((width, height)) => item = item.with_dimensions(width, height),
                Err(e) => tracing::warn!("Could not read dimensions of {}: {}", path.display(), e),
            }
        }
        None => tracing::warn!("{} is not a recognized image", path.display()),
    }

    Ok(item)
}

/// Load every file, failing on the first unreadable one
pub fn load_items(paths: &[impl AsRef<Path>], kind: RecordKind) -> Result<Vec<DataItem>> {
    paths.iter().map(|p| load_item(p.as_ref(), kind)).collect()
}
