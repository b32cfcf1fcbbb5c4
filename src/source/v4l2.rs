//! V4L2 camera backend.
//!
//! The V4L2 backend is responsible for:
//! - Discovering device nodes and binding the first one (or the configured path)
//! - Negotiating geometry and frame rate with the driver
//! - Sizing the driver's mmap buffer queue from the configured depth
//! - Copying each dequeued buffer into a `RawFrame`
//!
//! It never retries: a failed dequeue is reported to the pump and ends the run.

use ouroboros::self_referencing;
use std::io;
use std::time::Instant;

use super::{convert_frame, is_recent, CameraConfig, DeviceInfo, FrameSource, SourceStats};
use crate::error::SourceError;
use crate::frame::{ConvertedFrame, PixelFormat, RawFrame, RawPixelFormat};

const MAX_BUFFER_DEPTH: u32 = 32;

pub struct V4l2Source {
    config: CameraConfig,
    device_path: Option<String>,
    /// Opened device while not streaming.
    device: Option<v4l::Device>,
    /// Device plus mmap stream while streaming.
    stream: Option<StreamState>,
    buffer_depth: u32,
    active_width: u32,
    active_height: u32,
    active_stride: usize,
    active_format: Option<RawPixelFormat>,
    fourcc: String,
    free: Vec<Vec<u8>>,
    frame_count: u64,
    last_frame_at: Option<Instant>,
    last_error: Option<String>,
}

#[self_referencing]
struct StreamState {
    device: v4l::Device,
    #[borrows(device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this>,
}

impl V4l2Source {
    pub fn new(config: CameraConfig) -> Self {
        Self {
            active_width: config.width,
            active_height: config.height,
            active_stride: 0,
            config,
            device_path: None,
            device: None,
            stream: None,
            buffer_depth: 4,
            active_format: None,
            fourcc: String::new(),
            free: Vec::new(),
            frame_count: 0,
            last_frame_at: None,
            last_error: None,
        }
    }

    pub fn is_healthy(&self) -> bool {
        if self.last_error.is_some() || (self.device.is_none() && self.stream.is_none()) {
            return false;
        }
        is_recent(self.last_frame_at, self.config.target_fps)
    }

    pub fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            device: self
                .device_path
                .clone()
                .unwrap_or_else(|| self.config.device.clone()),
        }
    }

    fn resolve_device_path(&self) -> Result<String, SourceError> {
        if self.config.device != "auto" {
            return Ok(self.config.device.clone());
        }
        let mut nodes = v4l::context::enum_devices();
        nodes.sort_by_key(|node| node.index());
        log::info!("CameraSource: number of cameras detected: {}", nodes.len());
        nodes
            .first()
            .map(|node| node.path().display().to_string())
            .ok_or_else(|| SourceError::NoDeviceFound("no V4L2 capture devices".to_string()))
    }
}

impl FrameSource for V4l2Source {
    fn connect(&mut self) -> Result<DeviceInfo, SourceError> {
        use v4l::video::Capture;

        let path = self.resolve_device_path()?;
        let device = v4l::Device::with_path(&path)
            .map_err(|err| SourceError::NoDeviceFound(format!("open {}: {}", path, err)))?;
        let caps = device
            .query_caps()
            .map_err(|err| SourceError::DeviceDisconnected(format!("query {}: {}", path, err)))?;

        let mut format = device
            .format()
            .map_err(|err| SourceError::ConfigurationRejected(format!("read format: {}", err)))?;
        format.width = self.config.width;
        format.height = self.config.height;
        format.fourcc = v4l::FourCC::new(b"GREY");

        let format = match device.set_format(&format) {
            Ok(format) => format,
            Err(err) => {
                log::warn!("CameraSource: failed to set format on {}: {}", path, err);
                device.format().map_err(|err| {
                    SourceError::ConfigurationRejected(format!(
                        "read format after set failure: {}",
                        err
                    ))
                })?
            }
        };

        if self.config.target_fps > 0 {
            let params = v4l::video::capture::Parameters::with_fps(self.config.target_fps);
            if let Err(err) = device.set_params(&params) {
                log::warn!("CameraSource: failed to set fps on {}: {}", path, err);
            }
        }

        self.fourcc = format.fourcc.str().unwrap_or("????").to_string();
        let raw_format = check_negotiated(
            (self.config.width, self.config.height),
            (format.width, format.height),
            &format.fourcc.repr,
        )?;
        self.active_format = Some(raw_format);
        self.active_width = format.width;
        self.active_height = format.height;
        self.active_stride = format.stride as usize;
        self.last_error = None;
        self.device = Some(device);
        self.device_path = Some(path.clone());

        log::info!(
            "CameraSource: connected to {} ({}x{} {})",
            path,
            self.active_width,
            self.active_height,
            self.fourcc
        );

        let (major, minor, patch) = caps.version;
        Ok(DeviceInfo {
            serial_number: caps.bus.clone(),
            model: caps.card.clone(),
            vendor: caps.driver.clone(),
            sensor: format!("V4L2 {}", self.fourcc),
            resolution: (self.active_width, self.active_height),
            firmware_version: format!("{}.{}.{}", major, minor, patch),
        })
    }

    fn configure(&mut self, buffer_depth: u32) -> Result<(), SourceError> {
        if self.device.is_none() && self.stream.is_none() {
            return Err(SourceError::NotConnected);
        }
        if buffer_depth == 0 || buffer_depth > MAX_BUFFER_DEPTH {
            return Err(SourceError::ConfigurationRejected(format!(
                "buffer depth {} outside 1..={}",
                buffer_depth, MAX_BUFFER_DEPTH
            )));
        }
        self.buffer_depth = buffer_depth;
        Ok(())
    }

    fn start_capture(&mut self) -> Result<(), SourceError> {
        use v4l::buffer::Type;

        if self.stream.is_some() {
            return Ok(());
        }
        let device = self.device.take().ok_or(SourceError::NotConnected)?;
        let depth = self.buffer_depth;
        let state = StreamStateTryBuilder {
            device,
            stream_builder: |device| {
                v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, depth)
            },
        }
        .try_build_or_recover();

        match state {
            Ok(state) => {
                self.stream = Some(state);
                log::info!("CameraSource: capture started with {} driver buffers", depth);
                Ok(())
            }
            Err((err, heads)) => {
                self.device = Some(heads.device);
                self.last_error = Some(err.to_string());
                Err(SourceError::ConfigurationRejected(format!(
                    "create {} mmap buffers: {}",
                    depth, err
                )))
            }
        }
    }

    fn stop_capture(&mut self) -> Result<(), SourceError> {
        if let Some(state) = self.stream.take() {
            let heads = state.into_heads();
            self.device = Some(heads.device);
            log::info!("CameraSource: capture stopped");
        }
        Ok(())
    }

    fn acquire_raw(&mut self) -> Result<RawFrame, SourceError> {
        use v4l::io::traits::CaptureStream;

        let format = self.active_format.ok_or_else(|| SourceError::UnsupportedConversion {
            from: self.fourcc.clone(),
            to: PixelFormat::Gray8,
            reason: "driver pixel format has no conversion".to_string(),
        })?;
        let state = self.stream.as_mut().ok_or_else(|| {
            SourceError::AcquisitionTimeout("capture not started".to_string())
        })?;

        let mut data = self.free.pop().unwrap_or_default();
        let sequence = state
            .with_stream_mut(|stream| {
                let (buf, meta) = stream.next()?;
                let used = match meta.bytesused as usize {
                    0 => buf.len(),
                    n => n.min(buf.len()),
                };
                data.clear();
                data.extend_from_slice(&buf[..used]);
                Ok::<_, io::Error>(meta.sequence as u64)
            })
            .map_err(|err| {
                self.last_error = Some(err.to_string());
                match err.kind() {
                    io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => {
                        SourceError::AcquisitionTimeout(err.to_string())
                    }
                    _ => SourceError::DeviceDisconnected(err.to_string()),
                }
            })?;

        self.frame_count += 1;
        self.last_frame_at = Some(Instant::now());

        let stride = if self.active_stride == 0 {
            format.packed_row_bytes(self.active_width)
        } else {
            self.active_stride
        };
        Ok(RawFrame::new(
            data,
            self.active_width,
            self.active_height,
            stride,
            format,
            sequence,
        ))
    }

    fn convert(&mut self, raw: RawFrame, target: PixelFormat) -> Result<ConvertedFrame, SourceError> {
        let converted = convert_frame(&raw, target);
        if self.free.len() < self.buffer_depth as usize {
            self.free.push(raw.into_data());
        }
        converted
    }

    fn disconnect(&mut self) -> Result<(), SourceError> {
        self.stop_capture()?;
        if self.device.take().is_some() {
            log::info!(
                "CameraSource: disconnected from {}",
                self.device_path.as_deref().unwrap_or("device")
            );
        }
        self.free.clear();
        Ok(())
    }
}

fn raw_format_for(fourcc: &[u8; 4]) -> Option<RawPixelFormat> {
    match fourcc {
        b"GREY" => Some(RawPixelFormat::Mono8),
        b"Y16 " => Some(RawPixelFormat::Mono16),
        b"RGB3" => Some(RawPixelFormat::Rgb24),
        b"BGR3" => Some(RawPixelFormat::Bgr24),
        b"YUYV" => Some(RawPixelFormat::Yuyv),
        b"NV12" => Some(RawPixelFormat::Nv12),
        _ => None,
    }
}

/// Reject a driver format the pipeline cannot consume frame for frame.
fn check_negotiated(
    requested: (u32, u32),
    negotiated: (u32, u32),
    fourcc: &[u8; 4],
) -> Result<RawPixelFormat, SourceError> {
    if requested != negotiated {
        return Err(SourceError::ConfigurationRejected(format!(
            "driver negotiated {}x{}, pipeline expects {}x{}",
            negotiated.0, negotiated.1, requested.0, requested.1
        )));
    }
    raw_format_for(fourcc).ok_or_else(|| {
        SourceError::ConfigurationRejected(format!(
            "driver pixel format {} has no conversion",
            String::from_utf8_lossy(fourcc)
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_driver_fourccs() {
        assert_eq!(raw_format_for(b"GREY"), Some(RawPixelFormat::Mono8));
        assert_eq!(raw_format_for(b"YUYV"), Some(RawPixelFormat::Yuyv));
        assert_eq!(raw_format_for(b"MJPG"), None);
    }

    #[test]
    fn rounded_geometry_is_rejected_at_connect() {
        assert_eq!(
            check_negotiated((1280, 1024), (1280, 1024), b"YUYV"),
            Ok(RawPixelFormat::Yuyv)
        );
        assert_eq!(
            check_negotiated((1280, 1024), (1280, 720), b"YUYV"),
            Err(SourceError::ConfigurationRejected(
                "driver negotiated 1280x720, pipeline expects 1280x1024".to_string()
            ))
        );
        assert!(matches!(
            check_negotiated((640, 480), (640, 480), b"MJPG"),
            Err(SourceError::ConfigurationRejected(_))
        ));
    }

    #[test]
    fn configure_requires_connection() {
        let mut source = V4l2Source::new(CameraConfig {
            device: "/dev/video-missing".to_string(),
            ..CameraConfig::default()
        });
        assert!(matches!(source.configure(4), Err(SourceError::NotConnected)));
        assert!(source.stop_capture().is_ok());
        assert!(source.disconnect().is_ok());
    }
}
