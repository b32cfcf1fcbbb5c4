//! GStreamer-backed sinks for the compressed topologies.
//!
//! Each topology is an `appsrc` feeding a parse-launch description:
//! 1. UDP/RTP: videoconvert ! jpegenc ! rtpjpegpay ! udpsink
//! 2. TCP/MPEG-TS: videoconvert ! x264enc ! h264parse ! mpegtsmux ! tcpserversink
//! 3. File: videoconvert ! x264enc ! h264parse ! mp4mux ! filesink
//!
//! The appsrc queue is bounded to `queue_frames` frames and never blocks: a push that
//! would overflow it reports back-pressure instead.

use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use std::time::Instant;

use super::{FormatGate, PipelineSink};
use crate::error::SinkError;
use crate::frame::{PixelFormat, TimestampedBuffer};
use crate::pipeline::{StreamFormat, Topology};

/// How long `end_of_stream` waits for muxers to finalize.
const EOS_TIMEOUT_SECS: u64 = 5;

pub struct GstSink {
    name: &'static str,
    pipeline: Option<gst::Pipeline>,
    appsrc: Option<gst_app::AppSrc>,
    gate: FormatGate,
    queue_frames: u32,
    max_bytes: u64,
    eos_sent: bool,
    closed: Option<String>,
    frames_pushed: u64,
}

impl GstSink {
    /// Construct the pipeline for `topology`. The pipeline stays in `Null` until the
    /// stream format is declared.
    pub fn build(topology: &Topology, queue_frames: u32) -> Result<Self, SinkError> {
        gst::init().map_err(|err| build_error("initialize gstreamer", err))?;

        let (name, description) = pipeline_description(topology)?;
        let pipeline = gst::parse::launch(&description)
            .map_err(|err| build_error("parse pipeline", err))?
            .downcast::<gst::Pipeline>()
            .map_err(|_| SinkError::PipelineBuildError("description is not a pipeline".to_string()))?;

        let appsrc = match find_appsrc(&pipeline) {
            Ok(appsrc) => appsrc,
            Err(err) => {
                let _ = pipeline.set_state(gst::State::Null);
                return Err(err);
            }
        };

        if let Topology::File { path } = topology {
            match pipeline.by_name("out") {
                Some(filesink) => {
                    filesink.set_property("location", path.to_string_lossy().to_string())
                }
                None => {
                    let _ = pipeline.set_state(gst::State::Null);
                    return Err(SinkError::PipelineBuildError(
                        "filesink element missing from pipeline".to_string(),
                    ));
                }
            }
        }

        log::info!("GstSink: built {} pipeline ({})", name, topology);
        log::debug!("GstSink: {}", description);
        Ok(Self {
            name,
            pipeline: Some(pipeline),
            appsrc: Some(appsrc),
            gate: FormatGate::default(),
            queue_frames: queue_frames.max(1),
            max_bytes: 0,
            eos_sent: false,
            closed: None,
            frames_pushed: 0,
        })
    }

    /// Drain pending bus messages, remembering the first fatal one.
    fn poll_bus(&mut self) {
        let Some(bus) = self.pipeline.as_ref().and_then(|p| p.bus()) else {
            return;
        };
        while let Some(message) = bus.pop() {
            use gst::MessageView;
            match message.view() {
                MessageView::Error(err) => {
                    self.closed.get_or_insert_with(|| {
                        format!(
                            "gstreamer error from {:?}: {}",
                            err.src().map(|s| s.path_string()),
                            err.error()
                        )
                    });
                }
                MessageView::Eos(..) => {
                    self.closed
                        .get_or_insert_with(|| "gstreamer reached EOS".to_string());
                }
                _ => {}
            }
        }
    }

    fn wait_for_eos(&self) {
        let Some(bus) = self.pipeline.as_ref().and_then(|p| p.bus()) else {
            return;
        };
        let started = Instant::now();
        for message in bus.iter_timed(gst::ClockTime::from_seconds(EOS_TIMEOUT_SECS)) {
            use gst::MessageView;
            match message.view() {
                MessageView::Eos(..) => {
                    log::info!(
                        "GstSink: {} finalized in {} ms",
                        self.name,
                        started.elapsed().as_millis()
                    );
                    return;
                }
                MessageView::Error(err) => {
                    log::warn!("GstSink: error while finalizing {}: {}", self.name, err.error());
                    return;
                }
                _ => {}
            }
        }
        log::warn!(
            "GstSink: {} did not confirm EOS within {}s",
            self.name,
            EOS_TIMEOUT_SECS
        );
    }
}

impl PipelineSink for GstSink {
    fn name(&self) -> &'static str {
        self.name
    }

    fn declare_format(&mut self, format: StreamFormat) -> Result<(), SinkError> {
        self.gate.declare(format)?;

        let (Some(pipeline), Some(appsrc)) = (self.pipeline.as_ref(), self.appsrc.as_ref()) else {
            return Err(SinkError::SinkClosed("pipeline torn down".to_string()));
        };

        let video_format = match format.pixel_format {
            PixelFormat::Gray8 => gst_video::VideoFormat::Gray8,
            PixelFormat::Rgb8 => gst_video::VideoFormat::Rgb,
        };
        let caps = gst_video::VideoCapsBuilder::new()
            .format(video_format)
            .width(format.width as i32)
            .height(format.height as i32)
            .framerate(gst::Fraction::new(format.fps as i32, 1))
            .build();

        self.max_bytes = format.frame_len() as u64 * self.queue_frames as u64;
        appsrc.set_caps(Some(&caps));
        appsrc.set_format(gst::Format::Time);
        appsrc.set_is_live(true);
        appsrc.set_block(false);
        appsrc.set_max_bytes(self.max_bytes);

        pipeline
            .set_state(gst::State::Playing)
            .map_err(|err| build_error("set pipeline to Playing", err))?;

        log::info!(
            "GstSink: {} accepting {}x{} {} @ {} fps",
            self.name,
            format.width,
            format.height,
            format.pixel_format.caps_format(),
            format.fps
        );
        Ok(())
    }

    fn push(&mut self, buffer: TimestampedBuffer) -> Result<(), SinkError> {
        self.poll_bus();
        if let Some(reason) = &self.closed {
            return Err(SinkError::SinkClosed(reason.clone()));
        }
        if self.eos_sent {
            return Err(SinkError::SinkClosed("end of stream already sent".to_string()));
        }
        self.gate.check(&buffer)?;

        let appsrc = self
            .appsrc
            .as_ref()
            .ok_or_else(|| SinkError::SinkClosed("pipeline torn down".to_string()))?;

        let queued = appsrc.current_level_bytes();
        if queued + buffer.len() as u64 > self.max_bytes {
            return Err(SinkError::Backpressured(format!(
                "{} bytes queued, limit {} ({} frames)",
                queued, self.max_bytes, self.queue_frames
            )));
        }

        let index = buffer.index;
        let pts = gst::ClockTime::from_nseconds(buffer.pts.as_nanos() as u64);
        let duration = gst::ClockTime::from_nseconds(buffer.duration.as_nanos() as u64);
        let mut gst_buffer = gst::Buffer::from_mut_slice(buffer.into_bytes());
        if let Some(buffer_ref) = gst_buffer.get_mut() {
            buffer_ref.set_pts(pts);
            buffer_ref.set_duration(duration);
            buffer_ref.set_offset(index);
        }

        appsrc
            .push_buffer(gst_buffer)
            .map_err(|flow| SinkError::SinkClosed(format!("appsrc refused buffer: {:?}", flow)))?;
        self.frames_pushed += 1;
        Ok(())
    }

    fn end_of_stream(&mut self) {
        if self.eos_sent || self.appsrc.is_none() {
            return;
        }
        self.eos_sent = true;
        if self.gate.format().is_none() {
            // Never reached Playing, nothing to finalize.
            return;
        }
        self.poll_bus();
        if let Some(reason) = &self.closed {
            log::warn!("GstSink: {} already closed ({}), not waiting for EOS", self.name, reason);
            return;
        }
        let Some(appsrc) = self.appsrc.as_ref() else {
            return;
        };
        if let Err(err) = appsrc.end_of_stream() {
            log::warn!("GstSink: failed to send EOS to {}: {:?}", self.name, err);
            return;
        }
        self.wait_for_eos();
    }

    fn teardown(&mut self) {
        self.appsrc = None;
        if let Some(pipeline) = self.pipeline.take() {
            if let Err(err) = pipeline.set_state(gst::State::Null) {
                log::warn!("GstSink: failed to stop {}: {}", self.name, err);
            }
            log::info!(
                "GstSink: {} torn down after {} frames",
                self.name,
                self.frames_pushed
            );
        }
    }
}

impl Drop for GstSink {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn find_appsrc(pipeline: &gst::Pipeline) -> Result<gst_app::AppSrc, SinkError> {
    pipeline
        .by_name("src")
        .ok_or_else(|| SinkError::PipelineBuildError("appsrc element missing from pipeline".to_string()))?
        .downcast::<gst_app::AppSrc>()
        .map_err(|_| SinkError::PipelineBuildError("appsrc element has unexpected type".to_string()))
}

/// Launch description for a topology, plus the short sink name used in logs.
pub(crate) fn pipeline_description(topology: &Topology) -> Result<(&'static str, String), SinkError> {
    match topology {
        Topology::UdpRtp { host, port } => Ok((
            "udp-rtp",
            format!(
                "appsrc name=src ! videoconvert ! jpegenc ! rtpjpegpay ! \
                 udpsink host={} port={} sync=false",
                host, port
            ),
        )),
        Topology::TcpMpegTs { host, port } => Ok((
            "tcp-mpegts",
            format!(
                "appsrc name=src ! videoconvert ! video/x-raw,format=I420 ! \
                 x264enc tune=zerolatency speed-preset=ultrafast key-int-max=30 ! h264parse ! \
                 mpegtsmux ! tcpserversink host={} port={} sync=false",
                host, port
            ),
        )),
        Topology::File { .. } => Ok((
            "file",
            "appsrc name=src ! videoconvert ! video/x-raw,format=I420 ! x264enc ! h264parse ! \
             mp4mux ! filesink name=out"
                .to_string(),
        )),
        Topology::RawUdp { .. } => Err(SinkError::PipelineBuildError(
            "raw-udp is served by the socket sink, not gstreamer".to_string(),
        )),
    }
}

fn build_error(step: &str, err: impl std::fmt::Display) -> SinkError {
    SinkError::PipelineBuildError(format!("{}: {}", step, err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn descriptions_target_configured_destinations() {
        let (name, udp) = pipeline_description(&Topology::UdpRtp {
            host: "10.0.0.2".to_string(),
            port: 5004,
        })
        .expect("udp description");
        assert_eq!(name, "udp-rtp");
        assert!(udp.contains("rtpjpegpay"));
        assert!(udp.contains("host=10.0.0.2 port=5004"));

        let (_, tcp) = pipeline_description(&Topology::TcpMpegTs {
            host: "0.0.0.0".to_string(),
            port: 8554,
        })
        .expect("tcp description");
        assert!(tcp.contains("mpegtsmux ! tcpserversink host=0.0.0.0 port=8554"));

        let (_, file) = pipeline_description(&Topology::File {
            path: PathBuf::from("/tmp/out.mp4"),
        })
        .expect("file description");
        assert!(file.contains("mp4mux ! filesink name=out"));
    }

    #[test]
    fn failed_pipeline_skips_the_eos_wait() {
        let topology = Topology::UdpRtp {
            host: "127.0.0.1".to_string(),
            port: 5004,
        };
        let mut sink = match GstSink::build(&topology, 4) {
            Ok(sink) => sink,
            Err(err) => {
                eprintln!("skipping, gstreamer unavailable: {}", err);
                return;
            }
        };
        sink.declare_format(StreamFormat {
            width: 16,
            height: 8,
            pixel_format: PixelFormat::Gray8,
            fps: 30,
        })
        .expect("declare format");

        let pipeline = sink.pipeline.clone().expect("pipeline");
        let error = gst::message::Error::builder(gst::CoreError::Failed, "encoder crashed")
            .src(&pipeline)
            .build();
        pipeline.bus().expect("bus").post(error).expect("post error");

        let started = Instant::now();
        sink.end_of_stream();
        assert!(started.elapsed() < std::time::Duration::from_secs(EOS_TIMEOUT_SECS));
        assert!(sink.closed.is_some());
        sink.teardown();
    }

    #[test]
    fn raw_udp_is_not_a_gstreamer_topology() {
        assert!(pipeline_description(&Topology::RawUdp {
            host: "127.0.0.1".to_string(),
            port: 5000,
        })
        .is_err());
    }
}
