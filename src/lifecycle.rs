//! Startup sequencing and run ownership.
//!
//! Order: build sink, declare format, connect source, configure, start capture. The
//! pump only runs once every step succeeded. A startup failure releases whatever was
//! already built (end of stream before the source is stopped, as on every other exit
//! path) and is returned as an error.

use crate::error::{RelayError, SinkError};
use crate::pipeline::PipelineConfig;
use crate::pump::{release, FramePump, PumpReport, StopSignal};
use crate::sink::{self, PipelineSink};
use crate::source::{DeviceInfo, FrameSource};

/// Everything the lifecycle needs besides the components themselves.
#[derive(Clone, Debug)]
pub struct RunOptions {
    pub pipeline: PipelineConfig,
    /// Driver-side frame queue depth.
    pub buffer_depth: u32,
    /// Stop cleanly after this many pushes.
    pub frame_limit: Option<u64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StartupStage {
    BuildPipeline,
    ConnectCamera,
    ConfigureCamera,
    StartCapture,
}

impl StartupStage {
    pub const COUNT: usize = 4;

    /// 1-based position in the startup sequence.
    pub fn step(self) -> usize {
        self as usize + 1
    }

    pub fn label(self) -> &'static str {
        match self {
            StartupStage::BuildPipeline => "build pipeline",
            StartupStage::ConnectCamera => "connect camera",
            StartupStage::ConfigureCamera => "configure camera",
            StartupStage::StartCapture => "start capture",
        }
    }
}

/// Hooks for presenting startup progress.
pub trait StartupObserver {
    fn stage_started(&mut self, _stage: StartupStage) {}

    fn device_connected(&mut self, _info: &DeviceInfo) {}

    /// All stages succeeded; the pump is about to run.
    fn startup_finished(&mut self) {}

    fn startup_failed(&mut self, _stage: StartupStage, _err: &RelayError) {}
}

/// Observer that ignores every event.
#[derive(Debug, Default)]
pub struct QuietStartup;

impl StartupObserver for QuietStartup {}

/// Start the configured topology and run the pump to completion.
///
/// Startup failures are returned as `Err`; failures while running are reported in
/// `PumpReport::failure`.
pub fn run(
    options: &RunOptions,
    source: Box<dyn FrameSource>,
    stop: StopSignal,
    observer: &mut dyn StartupObserver,
) -> Result<PumpReport, RelayError> {
    run_with_sink(options, source, sink::build, stop, observer)
}

/// As [`run`], with the sink constructor supplied by the caller.
pub fn run_with_sink<F>(
    options: &RunOptions,
    mut source: Box<dyn FrameSource>,
    build_sink: F,
    stop: StopSignal,
    observer: &mut dyn StartupObserver,
) -> Result<PumpReport, RelayError>
where
    F: FnOnce(&PipelineConfig) -> Result<Box<dyn PipelineSink>, SinkError>,
{
    let config = &options.pipeline;
    log::info!("Lifecycle: starting {}", config.topology);

    observer.stage_started(StartupStage::BuildPipeline);
    let mut sink = match build_sink(config) {
        Ok(sink) => sink,
        Err(err) => {
            let err = RelayError::from(err);
            log::error!("Lifecycle: {} failed: {}", StartupStage::BuildPipeline.label(), err);
            observer.startup_failed(StartupStage::BuildPipeline, &err);
            return Err(err);
        }
    };
    if let Err(err) = sink.declare_format(config.stream_format()) {
        let stage = StartupStage::BuildPipeline;
        return Err(abort(stage, err.into(), None, sink.as_mut(), observer));
    }

    observer.stage_started(StartupStage::ConnectCamera);
    let info = match source.connect() {
        Ok(info) => info,
        Err(err) => {
            let stage = StartupStage::ConnectCamera;
            return Err(abort(stage, err.into(), Some(source.as_mut()), sink.as_mut(), observer));
        }
    };
    log::info!("Lifecycle: bound camera {} ({})", info.model, info.serial_number);
    observer.device_connected(&info);

    observer.stage_started(StartupStage::ConfigureCamera);
    if let Err(err) = source.configure(options.buffer_depth) {
        let stage = StartupStage::ConfigureCamera;
        return Err(abort(stage, err.into(), Some(source.as_mut()), sink.as_mut(), observer));
    }

    observer.stage_started(StartupStage::StartCapture);
    if let Err(err) = source.start_capture() {
        let stage = StartupStage::StartCapture;
        return Err(abort(stage, err.into(), Some(source.as_mut()), sink.as_mut(), observer));
    }
    observer.startup_finished();

    let pump = FramePump::new(source, sink, config, stop, options.frame_limit);
    Ok(pump.run())
}

fn abort(
    stage: StartupStage,
    err: RelayError,
    source: Option<&mut dyn FrameSource>,
    sink: &mut dyn PipelineSink,
    observer: &mut dyn StartupObserver,
) -> RelayError {
    log::error!("Lifecycle: {} failed: {}", stage.label(), err);
    observer.startup_failed(stage, &err);
    if let Some(teardown_err) = release(source, Some(sink)) {
        log::warn!("Lifecycle: partial teardown failed: {}", teardown_err);
    }
    err
}
