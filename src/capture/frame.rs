use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Decoded frame, immutable once captured
#[derive(Debug, Clone)]
pub struct Frame {
    /// Pixel data - can be shared across threads without copying
    pub data: Bytes,

    /// Frame metadata
    pub meta: FrameMetadata,

    /// Capture timestamp for latency tracking
    pub timestamp: Instant,
}

/// Frame metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameMetadata {
    /// Per-connection pull counter, starting at 1
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    /// Bytes per row
    pub stride: u32,
    pub format: PixelFormat,
}

/// Decoded pixel layouts a source may hand over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    Rgb24,
    Bgr24,
    Gray8,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> u32 {
        match self {
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => 3,
            PixelFormat::Gray8 => 1,
        }
    }
}

impl FrameMetadata {
    /// Tightly packed metadata for a `width` x `height` image, or `None` if
    /// the row or image size does not fit in memory.
    pub fn packed(sequence: u64, width: u32, height: u32, format: PixelFormat) -> Option<Self> {
        let stride = width.checked_mul(format.bytes_per_pixel())?;
        (stride as usize).checked_mul(height as usize)?;
        Some(Self {
            sequence,
            width,
            height,
            stride,
            format,
        })
    }

    pub fn expected_len(&self) -> usize {
        self.stride as usize * self.height as usize
    }
}

impl Frame {
    /// Stamp a frame with the current instant.
    pub fn new(data: impl Into<Bytes>, meta: FrameMetadata) -> Self {
        Self {
            data: data.into(),
            meta,
            timestamp: Instant::now(),
        }
    }

    pub fn sequence(&self) -> u64 {
        self.meta.sequence
    }

    /// Time since capture
    pub fn age(&self) -> Duration {
        self.timestamp.elapsed()
    }

    /// Whether the buffer covers every row the metadata describes.
    pub fn is_complete(&self) -> bool {
        self.data.len() >= self.meta.expected_len()
    }
}
