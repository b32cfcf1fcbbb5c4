//! Pipeline sinks.
//!
//! A sink accepts timestamped buffers for one topology:
//! - UDP/RTP, TCP/MPEG-TS and File recording via GStreamer (feature: sink-gstreamer)
//! - Raw UDP via a plain socket (always available)
//!
//! Every sink follows the same contract: `declare_format` exactly once, then `push`
//! until a failure or the end of the run, then `end_of_stream` and `teardown`. A failed
//! push is terminal; sinks never retry internally.

#[cfg(feature = "sink-gstreamer")]
pub mod gstreamer;
pub mod raw_udp;

use std::net::{SocketAddr, ToSocketAddrs};

#[cfg(feature = "sink-gstreamer")]
pub use self::gstreamer::GstSink;
pub use raw_udp::RawUdpSink;

use crate::error::SinkError;
use crate::frame::TimestampedBuffer;
use crate::pipeline::{PipelineConfig, StreamFormat, Topology};

/// Capability interface the pump needs from the downstream pipeline.
pub trait PipelineSink {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Announce buffer geometry and cadence. Must precede the first push.
    fn declare_format(&mut self, format: StreamFormat) -> Result<(), SinkError>;

    /// Hand a buffer to the pipeline. Any error ends the run.
    fn push(&mut self, buffer: TimestampedBuffer) -> Result<(), SinkError>;

    /// Signal that no further buffers will arrive and let muxers finalize.
    fn end_of_stream(&mut self);

    /// Release every resource that was successfully built. Idempotent.
    fn teardown(&mut self);
}

/// Build the sink for the configured topology.
pub fn build(config: &PipelineConfig) -> Result<Box<dyn PipelineSink>, SinkError> {
    validate_topology(&config.topology)?;

    match &config.topology {
        Topology::RawUdp { host, port } => {
            let dest = resolve(host, *port)?;
            Ok(Box::new(RawUdpSink::open(dest, config.queue_frames)?))
        }
        #[cfg(feature = "sink-gstreamer")]
        topology => Ok(Box::new(GstSink::build(topology, config.queue_frames)?)),
        #[cfg(not(feature = "sink-gstreamer"))]
        topology => Err(SinkError::PipelineBuildError(format!(
            "{} requires the sink-gstreamer feature",
            topology
        ))),
    }
}

/// Reject destinations that cannot work before any pipeline resources exist.
pub fn validate_topology(topology: &Topology) -> Result<(), SinkError> {
    match topology {
        Topology::UdpRtp { host, port } | Topology::RawUdp { host, port } => {
            resolve(host, *port).map(|_| ())
        }
        Topology::TcpMpegTs { host, port } => {
            if *port == 0 {
                return Err(SinkError::PipelineBuildError(
                    "tcp-mpegts needs a non-zero port".to_string(),
                ));
            }
            if host.trim().is_empty() {
                return Err(SinkError::PipelineBuildError(
                    "tcp-mpegts needs a bind address".to_string(),
                ));
            }
            Ok(())
        }
        Topology::File { path } => {
            if path.as_os_str().is_empty() {
                return Err(SinkError::PipelineBuildError(
                    "file topology needs an output path".to_string(),
                ));
            }
            match path.parent() {
                Some(dir) if !dir.as_os_str().is_empty() && !dir.is_dir() => {
                    Err(SinkError::PipelineBuildError(format!(
                        "output directory {} does not exist",
                        dir.display()
                    )))
                }
                _ => Ok(()),
            }
        }
    }
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr, SinkError> {
    if port == 0 {
        return Err(SinkError::PipelineBuildError(format!(
            "destination {}:{} needs a non-zero port",
            host, port
        )));
    }
    (host, port)
        .to_socket_addrs()
        .map_err(|err| {
            SinkError::PipelineBuildError(format!("resolve {}:{}: {}", host, port, err))
        })?
        .next()
        .ok_or_else(|| {
            SinkError::PipelineBuildError(format!("{}:{} resolved to no address", host, port))
        })
}

/// Declared-format bookkeeping shared by the sink implementations.
#[derive(Debug, Default)]
pub(crate) struct FormatGate {
    format: Option<StreamFormat>,
}

impl FormatGate {
    pub(crate) fn declare(&mut self, format: StreamFormat) -> Result<(), SinkError> {
        if self.format.is_some() {
            return Err(SinkError::PipelineBuildError(
                "stream format already declared".to_string(),
            ));
        }
        if format.width == 0 || format.height == 0 || format.fps == 0 {
            return Err(SinkError::PipelineBuildError(format!(
                "invalid stream format {}x{}@{}",
                format.width, format.height, format.fps
            )));
        }
        self.format = Some(format);
        Ok(())
    }

    pub(crate) fn check(&self, buffer: &TimestampedBuffer) -> Result<StreamFormat, SinkError> {
        let format = self.format.ok_or(SinkError::FormatNotDeclared)?;
        let expected = format.frame_len();
        if buffer.len() != expected {
            return Err(SinkError::FormatMismatch {
                expected,
                actual: buffer.len(),
            });
        }
        Ok(format)
    }

    pub(crate) fn format(&self) -> Option<StreamFormat> {
        self.format
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{ConvertedFrame, PixelFormat};
    use std::path::PathBuf;
    use std::time::Duration;

    fn format() -> StreamFormat {
        StreamFormat {
            width: 4,
            height: 2,
            pixel_format: PixelFormat::Gray8,
            fps: 30,
        }
    }

    fn buffer(len: usize) -> TimestampedBuffer {
        TimestampedBuffer::new(
            ConvertedFrame::new(vec![0u8; len], 4, 2, PixelFormat::Gray8),
            0,
            Duration::ZERO,
            Duration::from_millis(33),
        )
    }

    #[test]
    fn gate_requires_declaration_and_matching_length() {
        let mut gate = FormatGate::default();
        assert_eq!(gate.check(&buffer(8)), Err(SinkError::FormatNotDeclared));

        gate.declare(format()).expect("first declaration");
        assert!(gate.check(&buffer(8)).is_ok());
        assert_eq!(
            gate.check(&buffer(9)),
            Err(SinkError::FormatMismatch {
                expected: 8,
                actual: 9
            })
        );
        assert!(gate.declare(format()).is_err(), "declare_format is once-only");
    }

    #[test]
    fn rejects_unusable_destinations() {
        let zero_port = Topology::UdpRtp {
            host: "127.0.0.1".to_string(),
            port: 0,
        };
        assert!(matches!(
            validate_topology(&zero_port),
            Err(SinkError::PipelineBuildError(_))
        ));

        let bad_host = Topology::RawUdp {
            host: "not a host name".to_string(),
            port: 5000,
        };
        assert!(validate_topology(&bad_host).is_err());

        let missing_dir = Topology::File {
            path: PathBuf::from("/definitely/missing/dir/out.mp4"),
        };
        assert!(validate_topology(&missing_dir).is_err());

        let ok = Topology::UdpRtp {
            host: "127.0.0.1".to_string(),
            port: 5000,
        };
        assert!(validate_topology(&ok).is_ok());
    }

    #[cfg(not(feature = "sink-gstreamer"))]
    #[test]
    fn compressed_topologies_need_gstreamer() {
        let config = PipelineConfig {
            width: 4,
            height: 2,
            pixel_format: PixelFormat::Gray8,
            fps: 30,
            topology: Topology::UdpRtp {
                host: "127.0.0.1".to_string(),
                port: 5000,
            },
            queue_frames: 4,
        };
        assert!(matches!(
            build(&config),
            Err(SinkError::PipelineBuildError(_))
        ));
    }
}
