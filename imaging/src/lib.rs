//! Image data handling for captured frames
//!
//! Converts padded device buffers into sample arrays and writes them out as
//! FITS files with capture metadata, plus 8-bit preview and raw side files.

pub mod fits;
pub mod frame;
pub mod histogram;
pub mod persist;
pub mod preview;
pub mod stats;

pub use fits::{FitsError, FitsHeader, FitsValue};
pub use frame::{container_bits, stride_bytes, FrameBuffer};
pub use persist::{capture_path, CaptureMetadata, CaptureSettings, PersistReport, SaveFormats};
pub use stats::ImageStatistics;

use serde::{Deserialize, Serialize};

/// Errors raised while converting or writing images
#[derive(Debug, thiserror::Error)]
pub enum ImagingError {
    #[error("Invalid image geometry: {0}")]
    Geometry(String),

    #[error("Unsupported bit depth: {0}")]
    UnsupportedBitDepth(u32),

    #[error("FITS error: {0}")]
    Fits(#[from] FitsError),

    #[error("Image encoding error: {0}")]
    Encode(#[from] image::ImageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Storage width of one sample
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelType {
    U8,
    U16,
}

impl PixelType {
    /// 16-bit storage for anything deeper than 8 bits
    pub fn for_bit_depth(bit_depth: u32) -> Self {
        if bit_depth > 8 {
            PixelType::U16
        } else {
            PixelType::U8
        }
    }

    pub fn bytes_per_sample(&self) -> usize {
        match self {
            PixelType::U8 => 1,
            PixelType::U16 => 2,
        }
    }
}

/// Sample storage of a `SampleArray`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Samples {
    U8(Vec<u8>),
    U16(Vec<u16>),
}

/// A padding-free 2-D array of unsigned samples, row major
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleArray {
    width: u32,
    height: u32,
    bit_depth: u32,
    samples: Samples,
}

fn check_bit_depth(bit_depth: u32) -> Result<(), ImagingError> {
    if bit_depth == 0 || bit_depth > 16 {
        return Err(ImagingError::UnsupportedBitDepth(bit_depth));
    }
    Ok(())
}

impl SampleArray {
    /// Build an 8-bit array
    pub fn from_u8(width: u32, height: u32, data: Vec<u8>) -> Result<Self, ImagingError> {
        Self::new(width, height, 8, Samples::U8(data))
    }

    /// Build a high bit depth array; values are expected within `bit_depth`
    pub fn from_u16(width: u32, height: u32, bit_depth: u32, data: Vec<u16>) -> Result<Self, ImagingError> {
        Self::new(width, height, bit_depth, Samples::U16(data))
    }

    fn new(width: u32, height: u32, bit_depth: u32, samples: Samples) -> Result<Self, ImagingError> {
        check_bit_depth(bit_depth)?;
        let len = match &samples {
            Samples::U8(v) => {
                if bit_depth > 8 {
                    return Err(ImagingError::Geometry(format!(
                        "8-bit storage cannot hold {}-bit samples",
                        bit_depth
                    )));
                }
                v.len()
            }
            Samples::U16(v) => v.len(),
        };
        let expected = width as usize * height as usize;
        if len != expected {
            return Err(ImagingError::Geometry(format!(
                "{} samples for a {}x{} image (expected {})",
                len, width, height, expected
            )));
        }
        Ok(Self {
            width,
            height,
            bit_depth,
            samples,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Significant bits per sample
    pub fn bit_depth(&self) -> u32 {
        self.bit_depth
    }

    pub fn pixel_type(&self) -> PixelType {
        match self.samples {
            Samples::U8(_) => PixelType::U8,
            Samples::U16(_) => PixelType::U16,
        }
    }

    pub fn samples(&self) -> &Samples {
        &self.samples
    }

    pub fn len(&self) -> usize {
        match &self.samples {
            Samples::U8(v) => v.len(),
            Samples::U16(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Largest representable value, `2^bit_depth - 1`
    pub fn max_value(&self) -> u16 {
        ((1u32 << self.bit_depth) - 1) as u16
    }

    /// Sample at column `x`, row `y`
    pub fn get(&self, x: u32, y: u32) -> Option<u16> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let index = y as usize * self.width as usize + x as usize;
        match &self.samples {
            Samples::U8(v) => v.get(index).map(|&s| s as u16),
            Samples::U16(v) => v.get(index).copied(),
        }
    }

    /// Iterate all samples in row-major order
    pub fn values(&self) -> SampleIter<'_> {
        match &self.samples {
            Samples::U8(v) => SampleIter::U8(v.iter()),
            Samples::U16(v) => SampleIter::U16(v.iter()),
        }
    }
}

/// Iterator over samples widened to `u16`
pub enum SampleIter<'a> {
    U8(std::slice::Iter<'a, u8>),
    U16(std::slice::Iter<'a, u16>),
}

impl Iterator for SampleIter<'_> {
    type Item = u16;

    fn next(&mut self) -> Option<u16> {
        match self {
            SampleIter::U8(it) => it.next().map(|&v| v as u16),
            SampleIter::U16(it) => it.next().copied(),
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        match self {
            SampleIter::U8(it) => it.size_hint(),
            SampleIter::U16(it) => it.size_hint(),
        }
    }
}
