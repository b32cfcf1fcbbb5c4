//! Frame types flowing through the relay.
//!
//! - `RawFrame`: sensor-native pixels, owned by the source for one acquisition.
//! - `ConvertedFrame`: packed pixels in the pipeline's target format.
//! - `TimestampedBuffer`: a converted payload stamped with pts/duration, handed to the sink.
//!
//! None of these types implement `Clone`. A buffer moves into `PipelineSink::push` and
//! cannot be pushed a second time.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

// ----------------------------------------------------------------------------
// Pixel formats
// ----------------------------------------------------------------------------

/// Target encoding agreed with the pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    Gray8,
    Rgb8,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Gray8 => 1,
            PixelFormat::Rgb8 => 3,
        }
    }

    /// Packed frame length, or `None` if the geometry overflows.
    pub fn frame_len(self, width: u32, height: u32) -> Option<usize> {
        (width as usize)
            .checked_mul(height as usize)?
            .checked_mul(self.bytes_per_pixel())
    }

    /// GStreamer raw video format name.
    pub fn caps_format(self) -> &'static str {
        match self {
            PixelFormat::Gray8 => "GRAY8",
            PixelFormat::Rgb8 => "RGB",
        }
    }
}

impl FromStr for PixelFormat {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "gray8" | "mono8" | "grey8" => Ok(PixelFormat::Gray8),
            "rgb8" | "rgb" | "rgb24" => Ok(PixelFormat::Rgb8),
            other => Err(format!("unknown pixel format '{}'", other)),
        }
    }
}

/// Sensor-native layouts a backend may deliver.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RawPixelFormat {
    Mono8,
    /// 16-bit little-endian luma.
    Mono16,
    Rgb24,
    Bgr24,
    /// Packed 4:2:2, Y0 U Y1 V.
    Yuyv,
    /// Planar Y followed by interleaved UV at half resolution.
    Nv12,
}

impl RawPixelFormat {
    /// Minimum row length in bytes for the first plane.
    pub fn packed_row_bytes(self, width: u32) -> usize {
        let width = width as usize;
        match self {
            RawPixelFormat::Mono8 | RawPixelFormat::Nv12 => width,
            RawPixelFormat::Mono16 | RawPixelFormat::Yuyv => width * 2,
            RawPixelFormat::Rgb24 | RawPixelFormat::Bgr24 => width * 3,
        }
    }
}

impl fmt::Display for RawPixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RawPixelFormat::Mono8 => "mono8",
            RawPixelFormat::Mono16 => "mono16",
            RawPixelFormat::Rgb24 => "rgb24",
            RawPixelFormat::Bgr24 => "bgr24",
            RawPixelFormat::Yuyv => "yuyv",
            RawPixelFormat::Nv12 => "nv12",
        };
        f.write_str(name)
    }
}

impl FromStr for RawPixelFormat {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "mono8" | "gray8" => Ok(RawPixelFormat::Mono8),
            "mono16" | "gray16" => Ok(RawPixelFormat::Mono16),
            "rgb24" | "rgb" => Ok(RawPixelFormat::Rgb24),
            "bgr24" | "bgr" => Ok(RawPixelFormat::Bgr24),
            "yuyv" | "yuy2" => Ok(RawPixelFormat::Yuyv),
            "nv12" => Ok(RawPixelFormat::Nv12),
            other => Err(format!("unknown raw pixel format '{}'", other)),
        }
    }
}

// ----------------------------------------------------------------------------
// RawFrame
// ----------------------------------------------------------------------------

/// Sensor-native frame. Valid until the next acquisition on the same source.
pub struct RawFrame {
    data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Bytes per row of the first plane, including padding.
    pub stride: usize,
    pub format: RawPixelFormat,
    /// Driver sequence number.
    pub sequence: u64,
}

impl RawFrame {
    pub fn new(
        data: Vec<u8>,
        width: u32,
        height: u32,
        stride: usize,
        format: RawPixelFormat,
        sequence: u64,
    ) -> Self {
        Self {
            data,
            width,
            height,
            stride,
            format,
            sequence,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Give the backing storage back so the source can reuse it.
    pub fn into_data(self) -> Vec<u8> {
        self.data
    }
}

impl fmt::Debug for RawFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawFrame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("stride", &self.stride)
            .field("format", &self.format)
            .field("sequence", &self.sequence)
            .field("bytes", &self.data.len())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// ConvertedFrame
// ----------------------------------------------------------------------------

/// Packed frame in a target format. Owned by the pump once converted.
#[derive(Debug)]
pub struct ConvertedFrame {
    data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

impl ConvertedFrame {
    pub fn new(data: Vec<u8>, width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            data,
            width,
            height,
            format,
        }
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
}

// ----------------------------------------------------------------------------
// TimestampedBuffer
// ----------------------------------------------------------------------------

/// Converted payload with its presentation timestamp, ready for the sink.
#[derive(Debug)]
pub struct TimestampedBuffer {
    data: Vec<u8>,
    /// Zero-based position in the stream.
    pub index: u64,
    pub pts: Duration,
    pub duration: Duration,
}

impl TimestampedBuffer {
    pub fn new(frame: ConvertedFrame, index: u64, pts: Duration, duration: Duration) -> Self {
        Self {
            data: frame.data,
            index,
            pts,
            duration,
        }
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

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_len_follows_format() {
        assert_eq!(PixelFormat::Gray8.frame_len(1280, 1024), Some(1280 * 1024));
        assert_eq!(PixelFormat::Rgb8.frame_len(4, 2), Some(24));
        assert_eq!(PixelFormat::Rgb8.frame_len(u32::MAX, u32::MAX), None);
    }

    #[test]
    fn pixel_format_parses_aliases() {
        assert_eq!("GRAY8".parse::<PixelFormat>(), Ok(PixelFormat::Gray8));
        assert_eq!("rgb".parse::<PixelFormat>(), Ok(PixelFormat::Rgb8));
        assert!("yuv420".parse::<PixelFormat>().is_err());
        assert_eq!("yuy2".parse::<RawPixelFormat>(), Ok(RawPixelFormat::Yuyv));
    }

    #[test]
    fn timestamped_buffer_takes_frame_payload() {
        let frame = ConvertedFrame::new(vec![7u8; 6], 3, 2, PixelFormat::Gray8);
        let buffer = TimestampedBuffer::new(
            frame,
            2,
            Duration::from_millis(66),
            Duration::from_millis(33),
        );
        assert_eq!(buffer.len(), 6);
        assert_eq!(buffer.index, 2);
        assert_eq!(buffer.into_bytes(), vec![7u8; 6]);
    }
}
