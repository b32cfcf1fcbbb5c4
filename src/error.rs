//! Error taxonomy for the relay.
//!
//! Every error is terminal for the run: nothing here is retried.

use thiserror::Error;

use crate::frame::PixelFormat;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    #[error("no camera device found: {0}")]
    NoDeviceFound(String),

    #[error("camera rejected configuration: {0}")]
    ConfigurationRejected(String),

    #[error("timed out waiting for a frame: {0}")]
    AcquisitionTimeout(String),

    #[error("camera disconnected: {0}")]
    DeviceDisconnected(String),

    #[error("cannot convert {from} to {to:?}: {reason}")]
    UnsupportedConversion {
        from: String,
        to: PixelFormat,
        reason: String,
    },

    #[error("camera is not connected")]
    NotConnected,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    #[error("failed to build pipeline: {0}")]
    PipelineBuildError(String),

    #[error("pipeline is back-pressured: {0}")]
    Backpressured(String),

    #[error("pipeline closed: {0}")]
    SinkClosed(String),

    #[error("buffer pushed before declare_format")]
    FormatNotDeclared,

    #[error("buffer length {actual} does not match declared format ({expected} bytes)")]
    FormatMismatch { expected: usize, actual: usize },
}

/// Run-level failure reported by the lifecycle controller and the pump.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Sink(#[from] SinkError),

    /// A converted frame does not have the configured geometry. This is a defect
    /// in the source backend, never a recoverable condition.
    #[error("converted frame is {actual} bytes, expected {expected} ({width}x{height} {format:?})")]
    FrameSizeMismatch {
        expected: usize,
        actual: usize,
        width: u32,
        height: u32,
        format: PixelFormat,
    },
}

impl RelayError {
    pub fn is_sink(&self) -> bool {
        matches!(self, RelayError::Sink(_))
    }
}
