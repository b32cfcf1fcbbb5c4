//! Immutable run parameters shared by the pump and the sink.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::frame::PixelFormat;

/// Downstream transport or recording target. Exactly one is active per run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Topology {
    /// JPEG over RTP, sent to `host:port`.
    UdpRtp { host: String, port: u16 },
    /// H.264 in MPEG-TS, served by a TCP server bound to `host:port`.
    TcpMpegTs { host: String, port: u16 },
    /// H.264 in an MP4 container at `path`.
    File { path: PathBuf },
    /// Uncompressed payload datagrams sent to `host:port`.
    RawUdp { host: String, port: u16 },
}

impl Topology {
    pub fn kind(&self) -> TopologyKind {
        match self {
            Topology::UdpRtp { .. } => TopologyKind::UdpRtp,
            Topology::TcpMpegTs { .. } => TopologyKind::TcpMpegTs,
            Topology::File { .. } => TopologyKind::File,
            Topology::RawUdp { .. } => TopologyKind::RawUdp,
        }
    }
}

impl fmt::Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topology::UdpRtp { host, port } => write!(f, "udp-rtp -> {}:{}", host, port),
            Topology::TcpMpegTs { host, port } => write!(f, "tcp-mpegts <- {}:{}", host, port),
            Topology::File { path } => write!(f, "file -> {}", path.display()),
            Topology::RawUdp { host, port } => write!(f, "raw-udp -> {}:{}", host, port),
        }
    }
}

/// Topology discriminant, as named in configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TopologyKind {
    UdpRtp,
    TcpMpegTs,
    File,
    RawUdp,
}

impl TopologyKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TopologyKind::UdpRtp => "udp-rtp",
            TopologyKind::TcpMpegTs => "tcp-mpegts",
            TopologyKind::File => "file",
            TopologyKind::RawUdp => "raw-udp",
        }
    }
}

impl FromStr for TopologyKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "udp-rtp" | "udp" | "rtp" => Ok(TopologyKind::UdpRtp),
            "tcp-mpegts" | "tcp" | "mpegts" => Ok(TopologyKind::TcpMpegTs),
            "file" | "mp4" => Ok(TopologyKind::File),
            "raw-udp" | "raw" => Ok(TopologyKind::RawUdp),
            other => Err(format!(
                "unknown topology '{}' (expected udp-rtp, tcp-mpegts, file or raw-udp)",
                other
            )),
        }
    }
}

/// Geometry and cadence the sink must expect for every buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamFormat {
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    pub fps: u32,
}

impl StreamFormat {
    /// Exact byte length of every buffer in this format.
    pub fn frame_len(&self) -> usize {
        self.pixel_format
            .frame_len(self.width, self.height)
            .unwrap_or(usize::MAX)
    }

    /// `1s / fps`, truncated to whole nanoseconds.
    pub fn frame_duration(&self) -> Duration {
        frame_duration(self.fps)
    }
}

pub(crate) fn frame_duration(fps: u32) -> Duration {
    Duration::from_secs(1) / fps.max(1)
}

/// Parameters fixed for the lifetime of the process.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PipelineConfig {
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    pub fps: u32,
    pub topology: Topology,
    /// Frames the sink may hold before pushes report back-pressure.
    pub queue_frames: u32,
}

impl PipelineConfig {
    pub fn stream_format(&self) -> StreamFormat {
        StreamFormat {
            width: self.width,
            height: self.height,
            pixel_format: self.pixel_format,
            fps: self.fps,
        }
    }

    pub fn frame_duration(&self) -> Duration {
        frame_duration(self.fps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_duration_is_truncated_nanoseconds() {
        assert_eq!(frame_duration(30), Duration::from_nanos(33_333_333));
        assert_eq!(frame_duration(150), Duration::from_nanos(6_666_666));
        assert_eq!(frame_duration(1), Duration::from_secs(1));
    }

    #[test]
    fn topology_kind_round_trips_names() {
        for kind in [
            TopologyKind::UdpRtp,
            TopologyKind::TcpMpegTs,
            TopologyKind::File,
            TopologyKind::RawUdp,
        ] {
            assert_eq!(kind.as_str().parse::<TopologyKind>(), Ok(kind));
        }
        assert!("srt".parse::<TopologyKind>().is_err());
    }
}
