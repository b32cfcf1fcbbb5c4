//! Sensor Relay
//!
//! Paced capture from a camera sensor into a media pipeline.
//!
//! # Architecture
//!
//! One thread drives one loop:
//!
//! 1. **Acquire**: the frame source blocks for the next sensor frame.
//! 2. **Convert**: the frame becomes a contiguous buffer in the target pixel format.
//! 3. **Stamp**: `pts = frame_index * frame_duration`, `duration = 1 / fps`.
//! 4. **Push**: ownership of the buffer moves into the sink.
//! 5. **Pace**: sleep for whatever remains of the frame interval.
//!
//! Every error is fail-fast. A failure during startup releases what was built and
//! aborts; a failure while running drains (end of stream, stop capture, disconnect,
//! teardown) and reports.
//!
//! # Module Structure
//!
//! - `source`: Frame sources (synthetic `stub://` sensor, V4L2 devices) and conversion
//! - `sink`: Pipeline sinks (GStreamer UDP/RTP, TCP/MPEG-TS, file; raw UDP socket)
//! - `pump`: The paced loop and its state machine
//! - `lifecycle`: Startup ordering and partial teardown
//! - `config`: File, environment and command-line configuration

pub mod config;
pub mod error;
pub mod frame;
pub mod lifecycle;
pub mod pipeline;
pub mod pump;
pub mod sink;
pub mod source;
pub mod ui;

pub use config::{Overrides, RelayConfig};
pub use error::{RelayError, SinkError, SourceError};
pub use frame::{ConvertedFrame, PixelFormat, RawFrame, RawPixelFormat, TimestampedBuffer};
pub use lifecycle::{QuietStartup, RunOptions, StartupObserver, StartupStage};
pub use pipeline::{PipelineConfig, StreamFormat, Topology, TopologyKind};
pub use pump::{FramePump, Pacer, PumpReport, PumpState, StopReason, StopSignal};
pub use sink::{PipelineSink, RawUdpSink};
pub use source::{CameraConfig, CameraSource, DeviceInfo, FrameSource, SyntheticSource};
