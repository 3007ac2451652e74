//! 8-bit preview rendering and side-format writers

use crate::{ImagingError, SampleArray, Samples};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// Linear rescale to 8 bits: `v / (2^bit_depth - 1) * 255`, truncated.
///
/// 8-bit arrays pass through unchanged.
pub fn to_preview(samples: &SampleArray) -> Vec<u8> {
    match samples.samples() {
        Samples::U8(v) => v.clone(),
        Samples::U16(v) => {
            let max = samples.max_value() as f64;
            v.iter()
                .map(|&s| ((s as f64 / max) * 255.0).clamp(0.0, 255.0) as u8)
                .collect()
        }
    }
}

/// Write the 8-bit preview as a grayscale JPEG
pub fn write_preview_jpeg(path: &Path, samples: &SampleArray) -> Result<(), ImagingError> {
    let pixels = to_preview(samples);
    image::save_buffer_with_format(
        path,
        &pixels,
        samples.width(),
        samples.height(),
        image::ColorType::L8,
        image::ImageFormat::Jpeg,
    )?;
    Ok(())
}

/// Dump the padded device buffer verbatim
pub fn write_raw(path: &Path, bytes: &[u8]) -> Result<(), ImagingError> {
    let mut writer = BufWriter::new(File::create(path)?);
    writer.write_all(bytes)?;
    writer.flush()?;
    Ok(())
}
