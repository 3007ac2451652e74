//! Device frame buffers
//!
//! The SDK writes every row padded to a 4-byte boundary (DIB row alignment).
//! `FrameBuffer` holds that padded layout; `to_samples` strips the padding.

use crate::{check_bit_depth, ImagingError, SampleArray};

/// Bytes per padded row: `((width * bits + 31) / 32) * 4`
pub fn stride_bytes(width: u32, bits: u32) -> usize {
    (width as usize * bits as usize + 31) / 32 * 4
}

/// Sample storage width for a sensor bit depth
pub fn container_bits(bit_depth: u32) -> u32 {
    if bit_depth > 8 {
        16
    } else {
        8
    }
}

/// Padded byte buffer for one frame, reused across pulls
#[derive(Debug, Clone, Default)]
pub struct FrameBuffer {
    width: u32,
    height: u32,
    bit_depth: u32,
    data: Vec<u8>,
}

fn buffer_len(width: u32, height: u32, bit_depth: u32) -> Result<usize, ImagingError> {
    check_bit_depth(bit_depth)?;
    stride_bytes(width, container_bits(bit_depth))
        .checked_mul(height as usize)
        .ok_or_else(|| {
            ImagingError::Geometry(format!(
                "frame buffer size overflow: {}x{} at {} bits",
                width, height, bit_depth
            ))
        })
}

impl FrameBuffer {
    pub fn new(width: u32, height: u32, bit_depth: u32) -> Result<Self, ImagingError> {
        let len = buffer_len(width, height, bit_depth)?;
        Ok(Self {
            width,
            height,
            bit_depth,
            data: vec![0u8; len],
        })
    }

    /// Reallocate when the geometry differs. Returns true if it did.
    pub fn ensure_geometry(&mut self, width: u32, height: u32, bit_depth: u32) -> Result<bool, ImagingError> {
        if self.width == width && self.height == height && self.bit_depth == bit_depth && !self.data.is_empty() {
            return Ok(false);
        }
        *self = Self::new(width, height, bit_depth)?;
        tracing::debug!(
            "Allocated {} byte frame buffer for {}x{} at {} bits",
            self.data.len(),
            width,
            height,
            bit_depth
        );
        Ok(true)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Sensor bit depth
    pub fn bit_depth(&self) -> u32 {
        self.bit_depth
    }

    /// Bits per sample in the buffer, as passed to the pull call
    pub fn container_bits(&self) -> u32 {
        container_bits(self.bit_depth)
    }

    pub fn stride(&self) -> usize {
        stride_bytes(self.width, self.container_bits())
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Strip row padding
    pub fn to_samples(&self) -> Result<SampleArray, ImagingError> {
        strip_padding(&self.data, self.width, self.height, self.bit_depth)
    }
}

/// Extract the first `width` samples of each padded row.
///
/// 16-bit samples are little endian, as delivered by the device.
pub fn strip_padding(bytes: &[u8], width: u32, height: u32, bit_depth: u32) -> Result<SampleArray, ImagingError> {
    check_bit_depth(bit_depth)?;
    let bits = container_bits(bit_depth);
    let stride = stride_bytes(width, bits);
    let needed = stride * height as usize;
    if bytes.len() < needed {
        return Err(ImagingError::Geometry(format!(
            "buffer holds {} bytes, {}x{} at {} bits needs {}",
            bytes.len(),
            width,
            height,
            bit_depth,
            needed
        )));
    }
    let w = width as usize;
    if bits == 16 {
        let mut out = Vec::with_capacity(w * height as usize);
        for row in bytes[..needed].chunks_exact(stride.max(1)).take(height as usize) {
            out.extend(
                row[..w * 2]
                    .chunks_exact(2)
                    .map(|pair| u16::from_le_bytes([pair[0], pair[1]])),
            );
        }
        SampleArray::from_u16(width, height, bit_depth, out)
    } else {
        let mut out = Vec::with_capacity(w * height as usize);
        for row in bytes[..needed].chunks_exact(stride.max(1)).take(height as usize) {
            out.extend_from_slice(&row[..w]);
        }
        SampleArray::from_u8(width, height, out)
    }
}

/// Lay samples back out in the padded device layout, padding with zeros
pub fn pad_rows(samples: &SampleArray) -> Vec<u8> {
    let bits = container_bits(samples.bit_depth());
    let stride = stride_bytes(samples.width(), bits);
    let mut out = vec![0u8; stride * samples.height() as usize];
    let w = samples.width() as usize;
    if w == 0 {
        return out;
    }
    for (y, row) in out.chunks_exact_mut(stride).enumerate() {
        for x in 0..w {
            let value = samples.get(x as u32, y as u32).unwrap_or(0);
            if bits == 16 {
                row[x * 2..x * 2 + 2].copy_from_slice(&value.to_le_bytes());
            } else {
                row[x] = value as u8;
            }
        }
    }
    out
}
