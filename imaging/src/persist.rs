//! Persisting captured frames
//!
//! A capture is written as a FITS file carrying acquisition metadata, and
//! optionally as an 8-bit JPEG preview and a dump of the padded device buffer.

use crate::fits::{write_fits, FitsHeader};
use crate::preview::{write_preview_jpeg, write_raw};
use crate::{ImageStatistics, ImagingError, SampleArray};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// ISO-8601 local time with microseconds
const CAPTIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";

/// Device settings in effect for a capture
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CaptureSettings {
    pub exposure_us: u32,
    pub gain_percent: u16,
    /// Sensor temperature in 0.1 °C, `None` when the read failed
    pub temperature_tenths: Option<i16>,
    pub camera_name: Option<String>,
}

/// Metadata embedded in every saved FITS file
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureMetadata {
    pub exposure_secs: f64,
    pub gain_percent: u16,
    pub temperature_c: Option<f64>,
    pub width: u32,
    pub height: u32,
    pub bit_depth: u32,
    pub camera_name: Option<String>,
    pub statistics: ImageStatistics,
    pub captured_at: DateTime<Local>,
}

impl CaptureMetadata {
    /// Compute metadata for `samples`, stamped with the current local time
    pub fn new(samples: &SampleArray, settings: &CaptureSettings) -> Self {
        Self::at(samples, settings, Local::now())
    }

    /// Compute metadata with an explicit capture time
    pub fn at(samples: &SampleArray, settings: &CaptureSettings, captured_at: DateTime<Local>) -> Self {
        Self {
            exposure_secs: settings.exposure_us as f64 / 1e6,
            gain_percent: settings.gain_percent,
            temperature_c: settings.temperature_tenths.map(|t| t as f64 / 10.0),
            width: samples.width(),
            height: samples.height(),
            bit_depth: samples.bit_depth(),
            camera_name: settings.camera_name.clone(),
            statistics: ImageStatistics::compute(samples),
            captured_at,
        }
    }

    pub fn to_fits_header(&self) -> FitsHeader {
        let mut header = FitsHeader::new();

        header.set_float("EXPTIME", self.exposure_secs);
        header.set_comment("EXPTIME", "Exposure time in seconds");
        header.set_int("GAIN", self.gain_percent as i64);
        header.set_comment("GAIN", "Gain in percentage");

        match self.temperature_c {
            Some(t) => header.set_fixed("TEMP", t, 1),
            None => header.set_string("TEMP", "N/A"),
        }
        header.set_comment("TEMP", "Sensor temperature in C");

        header.set_int("WIDTH", self.width as i64);
        header.set_int("HEIGHT", self.height as i64);
        header.set_int("BITDEPTH", self.bit_depth as i64);
        header.set_string("CAMERA", self.camera_name.as_deref().unwrap_or("Unknown"));

        let stats = &self.statistics;
        header.set_fixed("DATAMEAN", stats.mean, 3);
        header.set_fixed("DATAMED", stats.median, 3);
        header.set_fixed("DATASTD", stats.std_dev, 3);
        header.set_fixed("DATAMAX", stats.max, 3);
        header.set_fixed("DATAMIN", stats.min, 3);

        header.set_string("CAPTIME", &self.captured_at.format(CAPTIME_FORMAT).to_string());
        header
    }
}

/// Write `samples` as FITS to `path`, replacing any existing file
pub fn persist(samples: &SampleArray, metadata: &CaptureMetadata, path: &Path) -> Result<(), ImagingError> {
    write_fits(path, samples, &metadata.to_fits_header())?;
    tracing::info!("FITS file saved: {}", path.display());
    Ok(())
}

/// `{directory}/{prefix}{counter}.{extension}`
pub fn capture_path(directory: &Path, prefix: &str, counter: u64, extension: &str) -> PathBuf {
    directory.join(format!("{}{}.{}", prefix, counter, extension))
}

/// Which files a snap or burst capture produces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SaveFormats {
    pub fits: bool,
    pub preview: bool,
    pub raw: bool,
}

impl Default for SaveFormats {
    fn default() -> Self {
        Self {
            fits: true,
            preview: true,
            raw: true,
        }
    }
}

/// Outcome of writing all enabled formats for one capture
#[derive(Debug, Default)]
pub struct PersistReport {
    pub written: Vec<PathBuf>,
    pub failures: Vec<(PathBuf, ImagingError)>,
}

impl PersistReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    fn record(&mut self, path: PathBuf, result: Result<(), ImagingError>) {
        match result {
            Ok(()) => self.written.push(path),
            Err(e) => {
                tracing::warn!("Failed to write {}: {}", path.display(), e);
                self.failures.push((path, e));
            }
        }
    }
}

/// Write every enabled format under the `{directory}/{prefix}{counter}` stem.
///
/// A failure in one format does not prevent the others.
///
/// # Arguments
/// * `samples` - Padding-free image
/// * `padded` - Device buffer as pulled, used for the raw dump
/// * `metadata` - FITS header content
pub fn persist_all(
    samples: &SampleArray,
    padded: &[u8],
    metadata: &CaptureMetadata,
    directory: &Path,
    prefix: &str,
    counter: u64,
    formats: SaveFormats,
) -> PersistReport {
    let mut report = PersistReport::default();

    if formats.preview {
        let path = capture_path(directory, prefix, counter, "jpg");
        let result = write_preview_jpeg(&path, samples);
        report.record(path, result);
    }
    if formats.raw {
        let path = capture_path(directory, prefix, counter, "raw");
        let result = write_raw(&path, padded);
        report.record(path, result);
    }
    if formats.fits {
        let path = capture_path(directory, prefix, counter, "fits");
        let result = persist(samples, metadata, &path);
        report.record(path, result);
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fits::read_fits;
    use crate::frame::pad_rows;
    use chrono::TimeZone;

    fn sample_image() -> SampleArray {
        SampleArray::from_u16(4, 2, 12, vec![10, 20, 30, 40, 50, 60, 70, 4095]).unwrap()
    }

    fn settings() -> CaptureSettings {
        CaptureSettings {
            exposure_us: 1500,
            gain_percent: 150,
            temperature_tenths: Some(-52),
            camera_name: Some("GPCMOS02000KPA".to_string()),
        }
    }

    #[test]
    fn test_metadata_header_keys() {
        let captured_at = Local.with_ymd_and_hms(2024, 3, 1, 21, 15, 30).unwrap();
        let metadata = CaptureMetadata::at(&sample_image(), &settings(), captured_at);
        let header = metadata.to_fits_header();

        assert_eq!(header.get_float("EXPTIME"), Some(0.0015));
        assert_eq!(header.get_int("GAIN"), Some(150));
        assert_eq!(header.get_float("TEMP"), Some(-5.2));
        assert_eq!(header.get_int("WIDTH"), Some(4));
        assert_eq!(header.get_int("HEIGHT"), Some(2));
        assert_eq!(header.get_int("BITDEPTH"), Some(12));
        assert_eq!(header.get_string("CAMERA"), Some("GPCMOS02000KPA"));
        assert_eq!(header.get_float("DATAMAX"), Some(4095.0));
        assert_eq!(header.get_float("DATAMIN"), Some(10.0));
        assert_eq!(header.get_string("CAPTIME"), Some("2024-03-01T21:15:30.000000"));
    }

    #[test]
    fn test_unavailable_temperature_and_unknown_camera() {
        let metadata = CaptureMetadata::new(&sample_image(), &CaptureSettings::default());
        let header = metadata.to_fits_header();
        assert_eq!(header.get_string("TEMP"), Some("N/A"));
        assert_eq!(header.get_string("CAMERA"), Some("Unknown"));
    }

    #[test]
    fn test_persist_overwrites_and_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = capture_path(dir.path(), "a_", 1, "fits");
        assert_eq!(path, dir.path().join("a_1.fits"));

        std::fs::write(&path, vec![0u8; 9000]).unwrap();
        let image = sample_image();
        let metadata = CaptureMetadata::new(&image, &settings());
        persist(&image, &metadata, &path).unwrap();

        let (read_back, header) = read_fits(&path).unwrap();
        assert_eq!(read_back, image);
        assert_eq!(header.get_float("DATAMEAN"), Some(546.875));
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 2 * 2880);
    }

    #[test]
    fn test_persist_all_respects_formats() {
        let dir = tempfile::tempdir().unwrap();
        let image = sample_image();
        let metadata = CaptureMetadata::new(&image, &settings());
        let padded = pad_rows(&image);

        let formats = SaveFormats {
            fits: true,
            preview: false,
            raw: true,
        };
        let report = persist_all(&image, &padded, &metadata, dir.path(), "snap", 3, formats);
        assert!(report.is_complete());
        assert_eq!(
            report.written,
            vec![dir.path().join("snap3.raw"), dir.path().join("snap3.fits")]
        );
        assert_eq!(std::fs::read(dir.path().join("snap3.raw")).unwrap(), padded);
        assert!(!dir.path().join("snap3.jpg").exists());
    }

    #[test]
    fn test_persist_all_reports_failures() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing");
        let image = sample_image();
        let metadata = CaptureMetadata::new(&image, &settings());

        let report = persist_all(&image, &[], &metadata, &missing, "x", 1, SaveFormats::default());
        assert!(report.written.is_empty());
        assert_eq!(report.failures.len(), 3);
    }
}
