//! Capture Kernel
//!
//! Video capture-and-decode pipeline over V4L2 memory-mapped buffers.
//!
//! # Architecture
//!
//! The pipeline runs on a single thread and is built from four parts:
//!
//! 1. **DeviceSession**: owns the device handle and buffer ring, and enforces the
//!    enqueue/dequeue ownership handoff with the driver.
//! 2. **FormatNegotiator**: maps a device-agnostic request onto driver format and
//!    frame-interval settings, and the driver's answer back.
//! 3. **DecodeEngine**: submit/pull decoding plus color conversion into a reusable
//!    output buffer.
//! 4. **CaptureSession**: the state machine that sequences setup, runs the capture
//!    loop, dispatches frames and unwinds everything in reverse on exit.
//!
//! The only cross-thread state is the [`CancelToken`], whose hooks can wake a
//! dequeue blocked in the driver; the consumer runs inline on the capture thread
//! and sees each frame only for the duration of its call.
//!
//! # Module Structure
//!
//! - `device`: driver trait, buffer ring, synthetic (`stub://`) and V4L2 drivers
//! - `format`: pixel-format table, exact frame rates, negotiation
//! - `decode`: codecs, converters, output arena
//! - `session`: `CaptureSession` and its release stack
//! - `consumer`, `watchdog`, `config`, `cancel`, `error`

pub mod cancel;
pub mod config;
pub mod consumer;
pub mod decode;
pub mod device;
pub mod error;
pub mod format;
pub mod session;
pub mod watchdog;

pub use cancel::{CancelHook, CancelToken};
pub use config::CaptureConfig;
pub use consumer::{ConsumerChain, FrameConsumer, FrameStats};
pub use decode::{CodecKind, DecodeEngine, DecodedFrame};
pub use device::{
    BufferRing, DequeueWaker, DeviceSession, MappedBuffer, Ownership, VideoDriver, WakeSignal,
};
pub use error::{CaptureError, CaptureResult, ErrorKind, FormatSetting};
pub use format::{FormatNegotiator, FourCc, Fraction, FrameRate, NegotiatedFormat, PixelFormat};
pub use session::{Backends, CaptureReport, CaptureSession, SessionState};
pub use watchdog::{Heartbeat, Watchdog};
