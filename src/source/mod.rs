//! Frame sources.
//!
//! A frame source abstracts the image sensor and its driver:
//! - Synthetic sensor (`stub://` devices, testing and demos)
//! - USB/V4L2 devices (feature: source-v4l2)
//!
//! The source owns every `RawFrame` it hands out until it is converted. Sources perform
//! device I/O only; they never touch the network or the filesystem beyond the device node.

mod convert;
pub mod synthetic;
#[cfg(feature = "source-v4l2")]
pub mod v4l2;

use std::fmt;
use std::time::{Duration, Instant};

pub use convert::convert_frame;
pub use synthetic::{SyntheticConfig, SyntheticSource};
#[cfg(feature = "source-v4l2")]
pub use v4l2::V4l2Source;

use crate::error::SourceError;
use crate::frame::{ConvertedFrame, PixelFormat, RawFrame};

/// Capability interface the pump needs from a sensor.
pub trait FrameSource {
    /// Discover sensors and bind the first one.
    fn connect(&mut self) -> Result<DeviceInfo, SourceError>;

    /// Set the driver-side frame queue depth.
    fn configure(&mut self, buffer_depth: u32) -> Result<(), SourceError>;

    fn start_capture(&mut self) -> Result<(), SourceError>;

    /// Stop streaming. A no-op success when capture is not running.
    fn stop_capture(&mut self) -> Result<(), SourceError>;

    /// Block until the next frame is available.
    fn acquire_raw(&mut self) -> Result<RawFrame, SourceError>;

    /// Convert a frame obtained from `acquire_raw` into the target format.
    fn convert(&mut self, raw: RawFrame, target: PixelFormat) -> Result<ConvertedFrame, SourceError> {
        convert_frame(&raw, target)
    }

    /// Release the device. A no-op success when not connected.
    fn disconnect(&mut self) -> Result<(), SourceError>;
}

/// Identification reported by the bound sensor.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeviceInfo {
    pub serial_number: String,
    pub model: String,
    pub vendor: String,
    pub sensor: String,
    pub resolution: (u32, u32),
    pub firmware_version: String,
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "*** CAMERA INFORMATION ***")?;
        writeln!(f, "Serial number - {}", self.serial_number)?;
        writeln!(f, "Camera model - {}", self.model)?;
        writeln!(f, "Camera vendor - {}", self.vendor)?;
        writeln!(f, "Sensor - {}", self.sensor)?;
        writeln!(
            f,
            "Resolution - {}x{}",
            self.resolution.0, self.resolution.1
        )?;
        write!(f, "Firmware version - {}", self.firmware_version)
    }
}

/// Configuration for a camera source.
#[derive(Clone, Debug)]
pub struct CameraConfig {
    /// `auto`, a device node (e.g., "/dev/video0") or a `stub://` URL.
    pub device: String,
    /// Target frame rate, passed to the driver where supported.
    pub target_fps: u32,
    /// Preferred frame width.
    pub width: u32,
    /// Preferred frame height.
    pub height: u32,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            device: "auto".to_string(),
            target_fps: 30,
            width: 1280,
            height: 1024,
        }
    }
}

/// Camera source selected from the configured device string.
pub struct CameraSource {
    backend: CameraBackend,
}

enum CameraBackend {
    Synthetic(SyntheticSource),
    #[cfg(feature = "source-v4l2")]
    V4l2(V4l2Source),
}

impl CameraSource {
    pub fn new(config: CameraConfig) -> Result<Self, SourceError> {
        if config.device.starts_with("stub://") {
            let synthetic = SyntheticConfig::from_url(&config.device, &config)
                .map_err(SourceError::ConfigurationRejected)?;
            Ok(Self {
                backend: CameraBackend::Synthetic(SyntheticSource::new(synthetic)),
            })
        } else {
            #[cfg(feature = "source-v4l2")]
            {
                Ok(Self {
                    backend: CameraBackend::V4l2(V4l2Source::new(config)),
                })
            }
            #[cfg(not(feature = "source-v4l2"))]
            {
                Err(SourceError::NoDeviceFound(format!(
                    "device '{}' requires the source-v4l2 feature",
                    config.device
                )))
            }
        }
    }

    /// Check if the source is healthy.
    pub fn is_healthy(&self) -> bool {
        match &self.backend {
            CameraBackend::Synthetic(source) => source.is_healthy(),
            #[cfg(feature = "source-v4l2")]
            CameraBackend::V4l2(source) => source.is_healthy(),
        }
    }

    /// Get frame statistics.
    pub fn stats(&self) -> SourceStats {
        match &self.backend {
            CameraBackend::Synthetic(source) => source.stats(),
            #[cfg(feature = "source-v4l2")]
            CameraBackend::V4l2(source) => source.stats(),
        }
    }

    fn inner(&mut self) -> &mut dyn FrameSource {
        match &mut self.backend {
            CameraBackend::Synthetic(source) => source,
            #[cfg(feature = "source-v4l2")]
            CameraBackend::V4l2(source) => source,
        }
    }
}

impl FrameSource for CameraSource {
    fn connect(&mut self) -> Result<DeviceInfo, SourceError> {
        self.inner().connect()
    }

    fn configure(&mut self, buffer_depth: u32) -> Result<(), SourceError> {
        self.inner().configure(buffer_depth)
    }

    fn start_capture(&mut self) -> Result<(), SourceError> {
        self.inner().start_capture()
    }

    fn stop_capture(&mut self) -> Result<(), SourceError> {
        self.inner().stop_capture()
    }

    fn acquire_raw(&mut self) -> Result<RawFrame, SourceError> {
        self.inner().acquire_raw()
    }

    fn convert(&mut self, raw: RawFrame, target: PixelFormat) -> Result<ConvertedFrame, SourceError> {
        self.inner().convert(raw, target)
    }

    fn disconnect(&mut self) -> Result<(), SourceError> {
        self.inner().disconnect()
    }
}

/// Statistics for a camera source.
#[derive(Clone, Debug)]
pub struct SourceStats {
    pub frames_captured: u64,
    pub device: String,
}

/// Health window shared by the backends: a frame must have arrived within six frame
/// intervals, and never less than two seconds.
pub(crate) fn health_grace(target_fps: u32) -> Duration {
    let base_ms = if target_fps == 0 {
        2_000
    } else {
        (1000 / target_fps).saturating_mul(6)
    };
    Duration::from_millis(base_ms.max(2_000) as u64)
}

pub(crate) fn is_recent(last_frame_at: Option<Instant>, target_fps: u32) -> bool {
    match last_frame_at {
        Some(at) => at.elapsed() <= health_grace(target_fps),
        None => true,
    }
}
