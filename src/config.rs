use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::frame::PixelFormat;
use crate::lifecycle::RunOptions;
use crate::pipeline::{PipelineConfig, Topology, TopologyKind};
use crate::source::CameraConfig;

const DEFAULT_DEVICE: &str = "auto";
const DEFAULT_BUFFER_DEPTH: u32 = 10;
const MAX_BUFFER_DEPTH: u32 = 64;
const DEFAULT_WIDTH: u32 = 1280;
const DEFAULT_HEIGHT: u32 = 1024;
const DEFAULT_FPS: u32 = 30;
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 5000;
const DEFAULT_FILE_PATH: &str = "capture.mp4";
const DEFAULT_QUEUE_FRAMES: u32 = 30;

#[derive(Debug, Deserialize, Default)]
struct RelayConfigFile {
    camera: Option<CameraConfigFile>,
    stream: Option<StreamConfigFile>,
    sink: Option<SinkConfigFile>,
    frame_limit: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct CameraConfigFile {
    device: Option<String>,
    buffer_depth: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct StreamConfigFile {
    width: Option<u32>,
    height: Option<u32>,
    fps: Option<u32>,
    pixel_format: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct SinkConfigFile {
    topology: Option<String>,
    host: Option<String>,
    port: Option<u16>,
    path: Option<PathBuf>,
    queue_frames: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub camera: CameraSettings,
    pub stream: StreamSettings,
    pub sink: SinkSettings,
    /// Debug mode: stop cleanly after this many frames.
    pub frame_limit: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct CameraSettings {
    pub device: String,
    pub buffer_depth: u32,
}

#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub pixel_format: PixelFormat,
}

#[derive(Debug, Clone)]
pub struct SinkSettings {
    pub topology: TopologyKind,
    pub host: String,
    pub port: u16,
    pub file_path: PathBuf,
    pub queue_frames: u32,
}

/// Command-line values that take precedence over the file and the environment.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub device: Option<String>,
    pub topology: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub file_path: Option<PathBuf>,
    pub frame_limit: Option<u64>,
}

impl RelayConfig {
    /// Load from `RELAY_CONFIG` (if set), then apply env overrides.
    pub fn load() -> Result<Self> {
        Self::load_with(None, &Overrides::default())
    }

    /// Load from `path` (falling back to `RELAY_CONFIG`), then env, then `overrides`.
    pub fn load_with(path: Option<&Path>, overrides: &Overrides) -> Result<Self> {
        let env_path = std::env::var("RELAY_CONFIG")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .map(PathBuf::from);
        let file_cfg = match path.map(Path::to_path_buf).or(env_path) {
            Some(path) => Some(read_config_file(&path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.apply_overrides(overrides)?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: RelayConfigFile) -> Result<Self> {
        let camera = file.camera.unwrap_or_default();
        let stream = file.stream.unwrap_or_default();
        let sink = file.sink.unwrap_or_default();

        let pixel_format = match stream.pixel_format.as_deref() {
            Some(name) => parse_pixel_format(name)?,
            None => PixelFormat::Gray8,
        };
        let topology = match sink.topology.as_deref() {
            Some(name) => parse_topology(name)?,
            None => TopologyKind::UdpRtp,
        };

        Ok(Self {
            camera: CameraSettings {
                device: camera.device.unwrap_or_else(|| DEFAULT_DEVICE.to_string()),
                buffer_depth: camera.buffer_depth.unwrap_or(DEFAULT_BUFFER_DEPTH),
            },
            stream: StreamSettings {
                width: stream.width.unwrap_or(DEFAULT_WIDTH),
                height: stream.height.unwrap_or(DEFAULT_HEIGHT),
                fps: stream.fps.unwrap_or(DEFAULT_FPS),
                pixel_format,
            },
            sink: SinkSettings {
                topology,
                host: sink.host.unwrap_or_else(|| DEFAULT_HOST.to_string()),
                port: sink.port.unwrap_or(DEFAULT_PORT),
                file_path: sink
                    .path
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_FILE_PATH)),
                queue_frames: sink.queue_frames.unwrap_or(DEFAULT_QUEUE_FRAMES),
            },
            frame_limit: file.frame_limit,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(device) = env_string("RELAY_DEVICE") {
            self.camera.device = device;
        }
        if let Some(depth) = env_parse::<u32>("RELAY_BUFFER_DEPTH")? {
            self.camera.buffer_depth = depth;
        }
        if let Some(limit) = env_parse::<u64>("RELAY_FRAME_LIMIT")? {
            self.frame_limit = Some(limit);
        }
        if let Some(width) = env_parse::<u32>("RELAY_WIDTH")? {
            self.stream.width = width;
        }
        if let Some(height) = env_parse::<u32>("RELAY_HEIGHT")? {
            self.stream.height = height;
        }
        if let Some(fps) = env_parse::<u32>("RELAY_FPS")? {
            self.stream.fps = fps;
        }
        if let Some(format) = env_string("RELAY_PIXEL_FORMAT") {
            self.stream.pixel_format = parse_pixel_format(&format)?;
        }
        if let Some(topology) = env_string("RELAY_TOPOLOGY") {
            self.sink.topology = parse_topology(&topology)?;
        }
        if let Some(host) = env_string("RELAY_HOST") {
            self.sink.host = host;
        }
        if let Some(port) = env_parse::<u16>("RELAY_PORT")? {
            self.sink.port = port;
        }
        if let Some(path) = env_string("RELAY_FILE_PATH") {
            self.sink.file_path = PathBuf::from(path);
        }
        if let Some(queue) = env_parse::<u32>("RELAY_QUEUE_FRAMES")? {
            self.sink.queue_frames = queue;
        }
        Ok(())
    }

    fn apply_overrides(&mut self, overrides: &Overrides) -> Result<()> {
        if let Some(device) = &overrides.device {
            self.camera.device = device.clone();
        }
        if let Some(topology) = &overrides.topology {
            self.sink.topology = parse_topology(topology)?;
        }
        if let Some(host) = &overrides.host {
            self.sink.host = host.clone();
        }
        if let Some(port) = overrides.port {
            self.sink.port = port;
        }
        if let Some(path) = &overrides.file_path {
            self.sink.file_path = path.clone();
        }
        if let Some(limit) = overrides.frame_limit {
            self.frame_limit = Some(limit);
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.camera.device.trim().is_empty() {
            return Err(anyhow!("camera device must not be empty"));
        }
        if !(1..=MAX_BUFFER_DEPTH).contains(&self.camera.buffer_depth) {
            return Err(anyhow!(
                "buffer depth must be between 1 and {}",
                MAX_BUFFER_DEPTH
            ));
        }
        if self.stream.width == 0 || self.stream.height == 0 {
            return Err(anyhow!("stream width and height must be greater than zero"));
        }
        if self.stream.fps == 0 {
            return Err(anyhow!("stream fps must be greater than zero"));
        }
        if self
            .stream
            .pixel_format
            .frame_len(self.stream.width, self.stream.height)
            .is_none()
        {
            return Err(anyhow!(
                "{}x{} frames are too large",
                self.stream.width,
                self.stream.height
            ));
        }
        if self.sink.queue_frames == 0 {
            return Err(anyhow!("sink queue must hold at least one frame"));
        }
        match self.sink.topology {
            TopologyKind::File => {
                if self.sink.file_path.as_os_str().is_empty() {
                    return Err(anyhow!("file topology needs an output path"));
                }
            }
            _ => {
                if self.sink.port == 0 {
                    return Err(anyhow!("sink port must be non-zero"));
                }
                if self.sink.host.trim().is_empty() {
                    return Err(anyhow!("sink host must not be empty"));
                }
            }
        }
        if self.frame_limit == Some(0) {
            return Err(anyhow!("frame limit must be greater than zero"));
        }
        Ok(())
    }

    pub fn topology(&self) -> Topology {
        let host = self.sink.host.clone();
        let port = self.sink.port;
        match self.sink.topology {
            TopologyKind::UdpRtp => Topology::UdpRtp { host, port },
            TopologyKind::TcpMpegTs => Topology::TcpMpegTs { host, port },
            TopologyKind::File => Topology::File {
                path: self.sink.file_path.clone(),
            },
            TopologyKind::RawUdp => Topology::RawUdp { host, port },
        }
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            width: self.stream.width,
            height: self.stream.height,
            pixel_format: self.stream.pixel_format,
            fps: self.stream.fps,
            topology: self.topology(),
            queue_frames: self.sink.queue_frames,
        }
    }

    pub fn camera_config(&self) -> CameraConfig {
        CameraConfig {
            device: self.camera.device.clone(),
            target_fps: self.stream.fps,
            width: self.stream.width,
            height: self.stream.height,
        }
    }

    pub fn run_options(&self) -> RunOptions {
        RunOptions {
            pipeline: self.pipeline_config(),
            buffer_depth: self.camera.buffer_depth,
            frame_limit: self.frame_limit,
        }
    }
}

fn read_config_file(path: &Path) -> Result<RelayConfigFile> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let is_toml = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>> {
    match env_string(key) {
        Some(value) => value
            .parse()
            .map(Some)
            .map_err(|_| anyhow!("{} must be a non-negative integer, got '{}'", key, value)),
        None => Ok(None),
    }
}

fn parse_pixel_format(value: &str) -> Result<PixelFormat> {
    value.parse().map_err(|e: String| anyhow!(e))
}

fn parse_topology(value: &str) -> Result<TopologyKind> {
    value.parse().map_err(|e: String| anyhow!(e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_capture_program() -> Result<()> {
        let cfg = RelayConfig::from_file(RelayConfigFile::default())?;
        cfg.validate()?;
        assert_eq!(cfg.camera.device, "auto");
        assert_eq!(cfg.camera.buffer_depth, 10);
        assert_eq!((cfg.stream.width, cfg.stream.height), (1280, 1024));
        assert_eq!(cfg.stream.fps, 30);
        assert_eq!(cfg.stream.pixel_format, PixelFormat::Gray8);
        assert_eq!(
            cfg.topology(),
            Topology::UdpRtp {
                host: "127.0.0.1".to_string(),
                port: 5000
            }
        );
        assert_eq!(cfg.sink.queue_frames, 30);
        assert_eq!(cfg.frame_limit, None);
        Ok(())
    }

    #[test]
    fn overrides_replace_file_values() -> Result<()> {
        let mut cfg = RelayConfig::from_file(RelayConfigFile::default())?;
        cfg.apply_overrides(&Overrides {
            topology: Some("file".to_string()),
            file_path: Some(PathBuf::from("/tmp/run.mp4")),
            frame_limit: Some(90),
            ..Overrides::default()
        })?;
        cfg.validate()?;
        assert_eq!(
            cfg.topology(),
            Topology::File {
                path: PathBuf::from("/tmp/run.mp4")
            }
        );
        assert_eq!(cfg.run_options().frame_limit, Some(90));
        Ok(())
    }

    #[test]
    fn rejects_out_of_range_values() -> Result<()> {
        let mut cfg = RelayConfig::from_file(RelayConfigFile::default())?;
        cfg.camera.buffer_depth = 65;
        assert!(cfg.validate().is_err());

        cfg.camera.buffer_depth = 10;
        cfg.sink.port = 0;
        assert!(cfg.validate().is_err());

        cfg.sink.topology = TopologyKind::File;
        assert!(cfg.validate().is_ok(), "port is irrelevant for file output");
        Ok(())
    }
}
