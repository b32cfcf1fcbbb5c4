#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use sensor_relay::error::{SinkError, SourceError};
use sensor_relay::frame::{ConvertedFrame, PixelFormat, RawFrame, RawPixelFormat, TimestampedBuffer};
use sensor_relay::lifecycle::{RunOptions, StartupObserver, StartupStage};
use sensor_relay::pipeline::{PipelineConfig, StreamFormat, Topology};
use sensor_relay::sink::PipelineSink;
use sensor_relay::source::{DeviceInfo, FrameSource};

/// One observed call on a mock component.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Call {
    Connect,
    Configure(u32),
    StartCapture,
    StopCapture,
    Acquire,
    Convert,
    Disconnect,
    DeclareFormat(StreamFormat),
    Push { index: u64, pts: Duration, len: usize },
    EndOfStream,
    Teardown,
}

#[derive(Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<Call>>>);

impl CallLog {
    pub fn record(&self, call: Call) {
        self.0.lock().unwrap().push(call);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.0.lock().unwrap().clone()
    }

    pub fn count(&self, wanted: &Call) -> usize {
        self.calls().iter().filter(|call| *call == wanted).count()
    }

    pub fn pushes(&self) -> Vec<(u64, Duration, usize)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Push { index, pts, len } => Some((index, pts, len)),
                _ => None,
            })
            .collect()
    }

    /// Position of the first occurrence of `wanted`.
    pub fn position(&self, wanted: &Call) -> Option<usize> {
        self.calls().iter().position(|call| call == wanted)
    }
}

pub const WIDTH: u32 = 16;
pub const HEIGHT: u32 = 8;

pub fn pipeline(fps: u32) -> PipelineConfig {
    PipelineConfig {
        width: WIDTH,
        height: HEIGHT,
        pixel_format: PixelFormat::Gray8,
        fps,
        topology: Topology::RawUdp {
            host: "127.0.0.1".to_string(),
            port: 5000,
        },
        queue_frames: 4,
    }
}

pub fn options(fps: u32, frame_limit: Option<u64>) -> RunOptions {
    RunOptions {
        pipeline: pipeline(fps),
        buffer_depth: 10,
        frame_limit,
    }
}

/// Scripted frame source that records every call.
pub struct MockSource {
    log: CallLog,
    frames: Option<u64>,
    work: Duration,
    bad_frame_at: Option<u64>,
    fail_connect: Option<SourceError>,
    fail_configure: Option<SourceError>,
    fail_start: Option<SourceError>,
    fail_stop: Option<SourceError>,
    fail_disconnect: Option<SourceError>,
    acquired: u64,
}

impl MockSource {
    pub fn new(log: &CallLog) -> Self {
        Self {
            log: log.clone(),
            frames: None,
            work: Duration::ZERO,
            bad_frame_at: None,
            fail_connect: None,
            fail_configure: None,
            fail_start: None,
            fail_stop: None,
            fail_disconnect: None,
            acquired: 0,
        }
    }

    /// Yield `n` frames, then fail with `AcquisitionTimeout`.
    pub fn with_frames(mut self, n: u64) -> Self {
        self.frames = Some(n);
        self
    }

    /// Simulated processing cost per acquisition.
    pub fn with_work(mut self, work: Duration) -> Self {
        self.work = work;
        self
    }

    /// Convert frame `index` to a buffer one row short.
    pub fn with_bad_frame_at(mut self, index: u64) -> Self {
        self.bad_frame_at = Some(index);
        self
    }

    pub fn failing_connect(mut self, err: SourceError) -> Self {
        self.fail_connect = Some(err);
        self
    }

    pub fn failing_configure(mut self, err: SourceError) -> Self {
        self.fail_configure = Some(err);
        self
    }

    pub fn failing_start(mut self, err: SourceError) -> Self {
        self.fail_start = Some(err);
        self
    }

    pub fn failing_stop(mut self, err: SourceError) -> Self {
        self.fail_stop = Some(err);
        self
    }

    pub fn failing_disconnect(mut self, err: SourceError) -> Self {
        self.fail_disconnect = Some(err);
        self
    }

    pub fn boxed(self) -> Box<dyn FrameSource> {
        Box::new(self)
    }
}

impl FrameSource for MockSource {
    fn connect(&mut self) -> Result<DeviceInfo, SourceError> {
        self.log.record(Call::Connect);
        if let Some(err) = self.fail_connect.take() {
            return Err(err);
        }
        Ok(DeviceInfo {
            serial_number: "12345".to_string(),
            model: "Mock".to_string(),
            vendor: "Test".to_string(),
            sensor: "mono".to_string(),
            resolution: (WIDTH, HEIGHT),
            firmware_version: "1.0".to_string(),
        })
    }

    fn configure(&mut self, buffer_depth: u32) -> Result<(), SourceError> {
        self.log.record(Call::Configure(buffer_depth));
        match self.fail_configure.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn start_capture(&mut self) -> Result<(), SourceError> {
        self.log.record(Call::StartCapture);
        match self.fail_start.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn stop_capture(&mut self) -> Result<(), SourceError> {
        self.log.record(Call::StopCapture);
        match self.fail_stop.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn acquire_raw(&mut self) -> Result<RawFrame, SourceError> {
        self.log.record(Call::Acquire);
        if self.frames.is_some_and(|n| self.acquired >= n) {
            return Err(SourceError::AcquisitionTimeout("mock exhausted".to_string()));
        }
        if !self.work.is_zero() {
            thread::sleep(self.work);
        }
        let data = vec![self.acquired as u8; (WIDTH * HEIGHT) as usize];
        let frame = RawFrame::new(
            data,
            WIDTH,
            HEIGHT,
            WIDTH as usize,
            RawPixelFormat::Mono8,
            self.acquired,
        );
        self.acquired += 1;
        Ok(frame)
    }

    fn convert(&mut self, raw: RawFrame, target: PixelFormat) -> Result<ConvertedFrame, SourceError> {
        self.log.record(Call::Convert);
        let height = if self.bad_frame_at == Some(raw.sequence) {
            HEIGHT - 1
        } else {
            HEIGHT
        };
        let len = target.bytes_per_pixel() * (WIDTH * height) as usize;
        Ok(ConvertedFrame::new(vec![0; len], WIDTH, height, target))
    }

    fn disconnect(&mut self) -> Result<(), SourceError> {
        self.log.record(Call::Disconnect);
        match self.fail_disconnect.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Sink that records pushes and can fail on a chosen push.
pub struct MockSink {
    log: CallLog,
    fail_declare: Option<SinkError>,
    /// 1-based push number that fails.
    fail_push_at: Option<(u64, SinkError)>,
    attempts: u64,
}

impl MockSink {
    pub fn new(log: &CallLog) -> Self {
        Self {
            log: log.clone(),
            fail_declare: None,
            fail_push_at: None,
            attempts: 0,
        }
    }

    pub fn failing_push(mut self, nth: u64, err: SinkError) -> Self {
        self.fail_push_at = Some((nth, err));
        self
    }

    pub fn failing_declare(mut self, err: SinkError) -> Self {
        self.fail_declare = Some(err);
        self
    }

    /// Sink constructor for `lifecycle::run_with_sink`.
    pub fn builder(
        self,
    ) -> impl FnOnce(&PipelineConfig) -> Result<Box<dyn PipelineSink>, SinkError> {
        move |_| Ok(Box::new(self) as Box<dyn PipelineSink>)
    }
}

impl PipelineSink for MockSink {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn declare_format(&mut self, format: StreamFormat) -> Result<(), SinkError> {
        self.log.record(Call::DeclareFormat(format));
        match self.fail_declare.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn push(&mut self, buffer: TimestampedBuffer) -> Result<(), SinkError> {
        self.attempts += 1;
        if let Some((nth, err)) = &self.fail_push_at {
            if *nth == self.attempts {
                return Err(err.clone());
            }
        }
        self.log.record(Call::Push {
            index: buffer.index,
            pts: buffer.pts,
            len: buffer.len(),
        });
        Ok(())
    }

    fn end_of_stream(&mut self) {
        self.log.record(Call::EndOfStream);
    }

    fn teardown(&mut self) {
        self.log.record(Call::Teardown);
    }
}

/// Observer that remembers which stages ran and how startup ended.
#[derive(Default)]
pub struct RecordingObserver {
    pub stages: Vec<StartupStage>,
    pub device: Option<DeviceInfo>,
    pub finished: bool,
    pub failed_at: Option<StartupStage>,
}

impl StartupObserver for RecordingObserver {
    fn stage_started(&mut self, stage: StartupStage) {
        self.stages.push(stage);
    }

    fn device_connected(&mut self, info: &DeviceInfo) {
        self.device = Some(info.clone());
    }

    fn startup_finished(&mut self) {
        self.finished = true;
    }

    fn startup_failed(&mut self, stage: StartupStage, _err: &sensor_relay::RelayError) {
        self.failed_at = Some(stage);
    }
}
