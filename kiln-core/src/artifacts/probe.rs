use std::path::Path;

use crate::types::ProbedMetadata;

/// Derives format and, for images, dimensions. Falls back to the filename
/// extension when the bytes are absent or not a recognised image.
pub fn probe(filename: &str, bytes: Option<&[u8]>) -> ProbedMetadata {
    let mut probed = bytes.map(sniff).unwrap_or_default();
    if probed.format.is_none() {
        probed.format = extension(filename);
    }
    probed
}

fn extension(filename: &str) -> Option<String> {
    Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .filter(|ext| !ext.is_empty())
        .map(|ext| ext.to_ascii_lowercase())
}

#[cfg(feature = "image-probe")]
fn sniff(bytes: &[u8]) -> ProbedMetadata {
    use std::io::Cursor;

    let Ok(format) = image::guess_format(bytes) else {
        return ProbedMetadata::default();
    };
    let dimensions = image::ImageReader::with_format(Cursor::new(bytes), format)
        .into_dimensions()
        .ok();
    ProbedMetadata {
        format: format.extensions_str().first().map(|ext| ext.to_string()),
        width: dimensions.map(|(w, _)| w),
        height: dimensions.map(|(_, h)| h),
    }
}

#[cfg(not(feature = "image-probe"))]
fn sniff(_bytes: &[u8]) -> ProbedMetadata {
    ProbedMetadata::default()
}
