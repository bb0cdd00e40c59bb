//! Capture error taxonomy.
//!
//! Every failure is attributed to the pipeline stage where it happened. Backend
//! traits (`VideoDriver`, `Codec`, `Scaler`) report plain `io::Error`s; the
//! session and engine wrap them in the variant for the stage that was running,
//! so callers can match on *what* failed without knowing which backend ran.

use std::io;

use thiserror::Error;

use crate::decode::CodecKind;
use crate::session::SessionState;

pub type CaptureResult<T> = Result<T, CaptureError>;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to open video device {path}")]
    Open {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("driver rejected {setting}")]
    FormatRejected {
        setting: FormatSetting,
        #[source]
        source: io::Error,
    },
    #[error("buffer request for {requested} buffer(s) failed")]
    BufferRequest {
        requested: u32,
        #[source]
        source: io::Error,
    },
    #[error("failed to map buffer {index}")]
    Map {
        index: u32,
        #[source]
        source: io::Error,
    },
    #[error("failed to initialise {codec} decoder")]
    CodecInit {
        codec: CodecKind,
        #[source]
        source: io::Error,
    },
    #[error("failed to initialise color converter")]
    ScalerInit {
        #[source]
        source: io::Error,
    },
    #[error("failed to enqueue buffer {index}")]
    Enqueue {
        index: u32,
        #[source]
        source: io::Error,
    },
    #[error("failed to dequeue buffer")]
    Dequeue {
        #[source]
        source: io::Error,
    },
    #[error("failed to decode frame")]
    Decode {
        #[source]
        source: io::Error,
    },
    #[error("invalid capture config: {0}")]
    InvalidConfig(String),
    #[error("cannot {operation} a session in state {state:?}")]
    InvalidState {
        state: SessionState,
        operation: &'static str,
    },
}

/// Which driver setting a `FormatRejected` refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FormatSetting {
    PixelFormat,
    FrameInterval,
}

impl std::fmt::Display for FormatSetting {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FormatSetting::PixelFormat => f.write_str("capture format"),
            FormatSetting::FrameInterval => f.write_str("frame interval"),
        }
    }
}

/// Fieldless view of [`CaptureError`] for callers that only branch on the stage.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    Open,
    FormatRejected,
    BufferRequest,
    Map,
    CodecInit,
    ScalerInit,
    Enqueue,
    Dequeue,
    Decode,
    InvalidConfig,
    InvalidState,
}

impl CaptureError {
    /// A dequeue ended by the device's waker rather than by a driver failure.
    pub fn is_interrupted(&self) -> bool {
        matches!(
            self,
            CaptureError::Dequeue { source } if source.kind() == io::ErrorKind::Interrupted
        )
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            CaptureError::Open { .. } => ErrorKind::Open,
            CaptureError::FormatRejected { .. } => ErrorKind::FormatRejected,
            CaptureError::BufferRequest { .. } => ErrorKind::BufferRequest,
            CaptureError::Map { .. } => ErrorKind::Map,
            CaptureError::CodecInit { .. } => ErrorKind::CodecInit,
            CaptureError::ScalerInit { .. } => ErrorKind::ScalerInit,
            CaptureError::Enqueue { .. } => ErrorKind::Enqueue,
            CaptureError::Dequeue { .. } => ErrorKind::Dequeue,
            CaptureError::Decode { .. } => ErrorKind::Decode,
            CaptureError::InvalidConfig(_) => ErrorKind::InvalidConfig,
            CaptureError::InvalidState { .. } => ErrorKind::InvalidState,
        }
    }
}

/// Shorthand for backend errors that carry only a message.
pub(crate) fn io_other(message: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::Other, message.into())
}
