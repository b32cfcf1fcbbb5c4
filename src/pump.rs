//! Frame pump: the real-time loop between a frame source and a pipeline sink.
//!
//! The pump runs on the calling thread. Each iteration acquires one frame, converts it,
//! stamps it with `pts = frame_index * frame_duration` and pushes it, then sleeps off
//! whatever is left of the frame interval. Overruns proceed immediately: there is no
//! catch-up burst and no frame skipping.
//!
//! Any failure ends production. The pump then drains: `end_of_stream` on the sink,
//! `stop_capture` and `disconnect` on the source, `teardown` on the sink. Every step
//! is attempted and the first error is surfaced.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::error::RelayError;
use crate::frame::TimestampedBuffer;
use crate::pipeline::{PipelineConfig, StreamFormat};
use crate::sink::PipelineSink;
use crate::source::FrameSource;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PumpState {
    Idle,
    Running,
    Draining,
    Stopped,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopReason {
    /// The configured debug frame limit was reached.
    FrameLimit,
    /// The stop signal was raised (e.g. Ctrl-C).
    StopRequested,
    /// A source, conversion or sink step failed.
    Failed,
}

/// Cloneable stop flag, observed by the pump at iteration boundaries.
#[derive(Clone, Debug, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Fixed-interval pacing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Pacer {
    frame_duration: Duration,
}

impl Pacer {
    pub fn new(frame_duration: Duration) -> Self {
        Self { frame_duration }
    }

    pub fn frame_duration(&self) -> Duration {
        self.frame_duration
    }

    /// Time left in the current interval, or `None` when the iteration overran.
    pub fn remaining(&self, elapsed: Duration) -> Option<Duration> {
        self.frame_duration
            .checked_sub(elapsed)
            .filter(|rest| !rest.is_zero())
    }
}

/// `frame_index * frame_duration`, saturating.
pub fn presentation_time(frame_index: u64, frame_duration: Duration) -> Duration {
    let nanos = (frame_duration.as_nanos() as u64).saturating_mul(frame_index);
    Duration::from_nanos(nanos)
}

/// Outcome of one run.
#[derive(Debug)]
pub struct PumpReport {
    pub frames_pushed: u64,
    /// Every state the pump passed through, in order.
    pub states: Vec<PumpState>,
    pub stop_reason: StopReason,
    /// First error of the run: the step failure, else the first teardown failure.
    pub failure: Option<RelayError>,
    /// Mean wall-clock time per pushed frame.
    pub average_period: Option<Duration>,
    pub last_pts: Option<Duration>,
}

impl PumpReport {
    pub fn is_clean(&self) -> bool {
        self.failure.is_none()
    }

    pub fn into_result(self) -> Result<PumpReport, RelayError> {
        match self.failure {
            Some(err) => Err(err),
            None => Ok(self),
        }
    }
}

pub struct FramePump {
    source: Box<dyn FrameSource>,
    sink: Box<dyn PipelineSink>,
    format: StreamFormat,
    frame_len: usize,
    pacer: Pacer,
    stop: StopSignal,
    frame_limit: Option<u64>,
    frame_index: u64,
    state: PumpState,
    states: Vec<PumpState>,
}

impl FramePump {
    /// Wrap a started source and a sink whose format is already declared.
    pub fn new(
        source: Box<dyn FrameSource>,
        sink: Box<dyn PipelineSink>,
        config: &PipelineConfig,
        stop: StopSignal,
        frame_limit: Option<u64>,
    ) -> Self {
        let format = config.stream_format();
        Self {
            source,
            sink,
            format,
            frame_len: format.frame_len(),
            pacer: Pacer::new(format.frame_duration()),
            stop,
            frame_limit,
            frame_index: 0,
            state: PumpState::Idle,
            states: vec![PumpState::Idle],
        }
    }

    /// Run until a stop condition, then drain. Consumes the pump: a stopped pump is
    /// never restarted.
    pub fn run(mut self) -> PumpReport {
        self.transition(PumpState::Running);
        log::info!(
            "FramePump: streaming {}x{} {} @ {} fps to {}",
            self.format.width,
            self.format.height,
            self.format.pixel_format.caps_format(),
            self.format.fps,
            self.sink.name()
        );

        let started = Instant::now();
        let (stop_reason, mut failure) = self.pump_frames();
        let elapsed = started.elapsed();

        self.transition(PumpState::Draining);
        let teardown_failure = release(Some(self.source.as_mut()), Some(self.sink.as_mut()));
        match (&failure, teardown_failure) {
            (None, Some(err)) => failure = Some(err),
            (Some(_), Some(err)) => log::warn!("FramePump: teardown also failed: {}", err),
            _ => {}
        }
        self.transition(PumpState::Stopped);

        let frames_pushed = self.frame_index;
        let average_period = (frames_pushed > 0)
            .then(|| Duration::from_nanos((elapsed.as_nanos() / u128::from(frames_pushed)) as u64));
        let last_pts = frames_pushed
            .checked_sub(1)
            .map(|index| presentation_time(index, self.pacer.frame_duration()));

        match &failure {
            Some(err) => log::error!(
                "FramePump: stopped after {} frames ({:?}): {}",
                frames_pushed,
                stop_reason,
                err
            ),
            None => log::info!(
                "FramePump: stopped after {} frames ({:?})",
                frames_pushed,
                stop_reason
            ),
        }

        PumpReport {
            frames_pushed,
            states: self.states,
            stop_reason,
            failure,
            average_period,
            last_pts,
        }
    }

    fn pump_frames(&mut self) -> (StopReason, Option<RelayError>) {
        let progress_every = u64::from(self.format.fps.max(1));
        loop {
            if self.stop.is_requested() {
                log::info!("FramePump: stop requested");
                return (StopReason::StopRequested, None);
            }
            if self.frame_limit.is_some_and(|limit| self.frame_index >= limit) {
                log::info!("FramePump: frame limit {} reached", self.frame_index);
                return (StopReason::FrameLimit, None);
            }

            let loop_start = Instant::now();
            if let Err(err) = self.step() {
                log::error!("FramePump: frame {} failed: {}", self.frame_index, err);
                return (StopReason::Failed, Some(err));
            }
            if let Some(rest) = self.pacer.remaining(loop_start.elapsed()) {
                thread::sleep(rest);
            }

            self.frame_index += 1;
            if self.frame_index % progress_every == 0 {
                log::info!(
                    "FramePump: {} frames pushed ({:.1}s of stream)",
                    self.frame_index,
                    presentation_time(self.frame_index, self.pacer.frame_duration()).as_secs_f64()
                );
            }
        }
    }

    /// Acquire, convert, stamp and push one frame.
    fn step(&mut self) -> Result<(), RelayError> {
        let raw = self.source.acquire_raw()?;
        log::debug!(
            "FramePump: acquired frame {} (sensor sequence {})",
            self.frame_index,
            raw.sequence
        );
        let converted = self.source.convert(raw, self.format.pixel_format)?;
        if converted.len() != self.frame_len {
            return Err(RelayError::FrameSizeMismatch {
                expected: self.frame_len,
                actual: converted.len(),
                width: self.format.width,
                height: self.format.height,
                format: self.format.pixel_format,
            });
        }

        let duration = self.pacer.frame_duration();
        let buffer = TimestampedBuffer::new(
            converted,
            self.frame_index,
            presentation_time(self.frame_index, duration),
            duration,
        );
        self.sink.push(buffer)?;
        Ok(())
    }

    fn transition(&mut self, next: PumpState) {
        log::debug!("FramePump: {:?} -> {:?}", self.state, next);
        self.state = next;
        self.states.push(next);
    }
}

/// Best-effort release in drain order: end of stream, stop capture, disconnect,
/// sink teardown. Returns the first source error; sink steps cannot fail.
pub(crate) fn release(
    source: Option<&mut dyn FrameSource>,
    mut sink: Option<&mut dyn PipelineSink>,
) -> Option<RelayError> {
    let mut first = None;
    if let Some(sink) = sink.as_mut() {
        sink.end_of_stream();
    }
    if let Some(source) = source {
        if let Err(err) = source.stop_capture() {
            log::warn!("FramePump: stop_capture failed: {}", err);
            first.get_or_insert(RelayError::from(err));
        }
        if let Err(err) = source.disconnect() {
            log::warn!("FramePump: disconnect failed: {}", err);
            first.get_or_insert(RelayError::from(err));
        }
    }
    if let Some(sink) = sink {
        sink.teardown();
    }
    first
}
