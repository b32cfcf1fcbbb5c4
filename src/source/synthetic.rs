//! Synthetic sensor for `stub://` devices.
//!
//! URL form: `stub://<name>[?frames=N&format=F&width=W&height=H&pad=P&devices=D]`
//!
//! - `frames`: end the stream with `AcquisitionTimeout` after N frames
//! - `format`: raw layout delivered by the "driver" (default `mono8`)
//! - `width`/`height`: override the configured geometry
//! - `pad`: padding bytes at the end of every row
//! - `devices`: number of sensors on the simulated bus (0 fails `connect`)
//!
//! Frames carry a diagonal gradient that advances by four levels per frame, so pixel
//! `(x, y)` of frame `n` has luma `(x + y + 4n) % 256`.

use std::time::Instant;

use super::{convert_frame, is_recent, CameraConfig, DeviceInfo, FrameSource, SourceStats};
use crate::error::SourceError;
use crate::frame::{ConvertedFrame, PixelFormat, RawFrame, RawPixelFormat};

const DEFAULT_BUFFER_DEPTH: u32 = 4;
const MAX_BUFFER_DEPTH: u32 = 64;

/// Configuration for a synthetic sensor.
#[derive(Clone, Debug)]
pub struct SyntheticConfig {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub target_fps: u32,
    pub format: RawPixelFormat,
    pub frame_limit: Option<u64>,
    pub row_padding: usize,
    pub devices: u32,
}

impl SyntheticConfig {
    pub fn from_url(url: &str, camera: &CameraConfig) -> Result<Self, String> {
        let rest = url
            .strip_prefix("stub://")
            .ok_or_else(|| format!("'{}' is not a stub:// device", url))?;
        let (name, query) = match rest.split_once('?') {
            Some((name, query)) => (name, Some(query)),
            None => (rest, None),
        };

        let mut cfg = Self {
            name: if name.is_empty() { "camera".to_string() } else { name.to_string() },
            width: camera.width,
            height: camera.height,
            target_fps: camera.target_fps,
            format: RawPixelFormat::Mono8,
            frame_limit: None,
            row_padding: 0,
            devices: 1,
        };

        for pair in query.unwrap_or("").split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| format!("stub parameter '{}' has no value", pair))?;
            let invalid = |_| format!("stub parameter {}='{}' is invalid", key, value);
            match key {
                "frames" => cfg.frame_limit = Some(value.parse().map_err(invalid)?),
                "format" => cfg.format = value.parse()?,
                "width" => cfg.width = value.parse().map_err(invalid)?,
                "height" => cfg.height = value.parse().map_err(invalid)?,
                "pad" => cfg.row_padding = value.parse().map_err(invalid)?,
                "devices" => cfg.devices = value.parse().map_err(invalid)?,
                other => return Err(format!("unknown stub parameter '{}'", other)),
            }
        }

        Ok(cfg)
    }

    fn stride(&self) -> usize {
        self.format.packed_row_bytes(self.width) + self.row_padding
    }

    fn raw_len(&self) -> usize {
        let luma = self.stride() * self.height as usize;
        match self.format {
            RawPixelFormat::Nv12 => luma + self.stride() * (self.height as usize / 2),
            _ => luma,
        }
    }
}

pub struct SyntheticSource {
    config: SyntheticConfig,
    connected: bool,
    capturing: bool,
    buffer_depth: u32,
    /// Recycled frame storage, at most `buffer_depth` entries.
    free: Vec<Vec<u8>>,
    frame_count: u64,
    last_frame_at: Option<Instant>,
    last_error: Option<String>,
}

impl SyntheticSource {
    pub fn new(config: SyntheticConfig) -> Self {
        Self {
            config,
            connected: false,
            capturing: false,
            buffer_depth: DEFAULT_BUFFER_DEPTH,
            free: Vec::new(),
            frame_count: 0,
            last_frame_at: None,
            last_error: None,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.connected && self.last_error.is_none() && is_recent(self.last_frame_at, self.config.target_fps)
    }

    pub fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            device: format!("stub://{}", self.config.name),
        }
    }

    pub fn is_capturing(&self) -> bool {
        self.capturing
    }

    fn fill_pattern(&self, buf: &mut Vec<u8>) {
        let cfg = &self.config;
        let stride = cfg.stride();
        let row_bytes = cfg.format.packed_row_bytes(cfg.width);
        let shift = self.frame_count.wrapping_mul(4);

        buf.clear();
        buf.resize(cfg.raw_len(), 0);

        for y in 0..cfg.height as usize {
            let row = &mut buf[y * stride..y * stride + row_bytes];
            for x in 0..cfg.width as usize {
                let v = ((x as u64 + y as u64 + shift) % 256) as u8;
                match cfg.format {
                    RawPixelFormat::Mono8 | RawPixelFormat::Nv12 => row[x] = v,
                    RawPixelFormat::Mono16 => {
                        row[x * 2] = 0;
                        row[x * 2 + 1] = v;
                    }
                    RawPixelFormat::Rgb24 => row[x * 3..x * 3 + 3].copy_from_slice(&[v, 255 - v, v / 2]),
                    RawPixelFormat::Bgr24 => row[x * 3..x * 3 + 3].copy_from_slice(&[v / 2, 255 - v, v]),
                    RawPixelFormat::Yuyv => {
                        row[x * 2] = v;
                        row[x * 2 + 1] = 128;
                    }
                }
            }
        }

        if cfg.format == RawPixelFormat::Nv12 {
            let luma = stride * cfg.height as usize;
            for uv in &mut buf[luma..] {
                *uv = 128;
            }
        }
    }
}

impl FrameSource for SyntheticSource {
    fn connect(&mut self) -> Result<DeviceInfo, SourceError> {
        if self.config.devices == 0 {
            return Err(SourceError::NoDeviceFound(format!(
                "no cameras detected on stub://{}",
                self.config.name
            )));
        }
        if self.config.devices > 1 {
            log::info!(
                "CameraSource: {} cameras detected, binding index 0",
                self.config.devices
            );
        }
        self.connected = true;
        self.last_error = None;
        log::info!("CameraSource: connected to stub://{} (synthetic)", self.config.name);

        Ok(DeviceInfo {
            serial_number: "0".to_string(),
            model: format!("Synthetic {}", self.config.name),
            vendor: "sensor-relay".to_string(),
            sensor: format!("synthetic {}", self.config.format),
            resolution: (self.config.width, self.config.height),
            firmware_version: env!("CARGO_PKG_VERSION").to_string(),
        })
    }

    fn configure(&mut self, buffer_depth: u32) -> Result<(), SourceError> {
        if !self.connected {
            return Err(SourceError::NotConnected);
        }
        if buffer_depth == 0 || buffer_depth > MAX_BUFFER_DEPTH {
            return Err(SourceError::ConfigurationRejected(format!(
                "buffer depth {} outside 1..={}",
                buffer_depth, MAX_BUFFER_DEPTH
            )));
        }
        self.buffer_depth = buffer_depth;
        self.free.truncate(buffer_depth as usize);
        Ok(())
    }

    fn start_capture(&mut self) -> Result<(), SourceError> {
        if !self.connected {
            return Err(SourceError::NotConnected);
        }
        self.capturing = true;
        Ok(())
    }

    fn stop_capture(&mut self) -> Result<(), SourceError> {
        self.capturing = false;
        Ok(())
    }

    fn acquire_raw(&mut self) -> Result<RawFrame, SourceError> {
        if !self.connected {
            return Err(SourceError::NotConnected);
        }
        if !self.capturing {
            return Err(SourceError::AcquisitionTimeout("capture not started".to_string()));
        }
        if let Some(limit) = self.config.frame_limit {
            if self.frame_count >= limit {
                let reason = format!("stub stream ended after {} frames", limit);
                self.last_error = Some(reason.clone());
                return Err(SourceError::AcquisitionTimeout(reason));
            }
        }

        let mut buf = self.free.pop().unwrap_or_default();
        self.fill_pattern(&mut buf);

        let frame = RawFrame::new(
            buf,
            self.config.width,
            self.config.height,
            self.config.stride(),
            self.config.format,
            self.frame_count,
        );
        self.frame_count += 1;
        self.last_frame_at = Some(Instant::now());
        Ok(frame)
    }

    fn convert(&mut self, raw: RawFrame, target: PixelFormat) -> Result<ConvertedFrame, SourceError> {
        let converted = convert_frame(&raw, target);
        if self.free.len() < self.buffer_depth as usize {
            self.free.push(raw.into_data());
        }
        converted
    }

    fn disconnect(&mut self) -> Result<(), SourceError> {
        if self.connected {
            log::info!("CameraSource: disconnected from stub://{}", self.config.name);
        }
        self.capturing = false;
        self.connected = false;
        self.free.clear();
        Ok(())
    }
}
