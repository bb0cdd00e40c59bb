//! Capture session: the top-level state machine.
//!
//! ```text
//! Idle -> Initializing -> Streaming -> Draining -> Closed
//!              |
//!              +-> Failed
//! ```
//!
//! Setup acquires, in order: decoder (with its output buffer), scaler, device,
//! negotiated format, buffer request, one mapping per granted buffer. Every
//! acquisition is pushed onto a release stack; a setup failure pops the stack,
//! so only what was acquired is released, in reverse. Draining pops the same
//! stack after the capture loop ends, whether by cancellation or error.
//!
//! Sessions are one-shot: once `Closed` or `Failed`, `start` is refused.

use std::collections::VecDeque;
use std::io;

use crate::cancel::CancelToken;
use crate::config::CaptureConfig;
use crate::consumer::FrameConsumer;
use crate::decode::{Codec, CodecKind, ConversionRequest, DecodeEngine, Scaler};
use crate::device::{DeviceSession, VideoDriver};
use crate::error::{CaptureError, CaptureResult};
use crate::format::{FormatNegotiator, NegotiatedFormat};
use crate::watchdog::{Heartbeat, Watchdog};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Initializing,
    Streaming,
    Draining,
    Closed,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }
}

/// One entry of the release stack.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Resource {
    OutputBuffer,
    Codec,
    Scaler,
    Device,
    BufferRequest,
    Mapping(u32),
    Stream,
}

pub type DriverFactory = Box<dyn FnMut(&str) -> io::Result<Box<dyn VideoDriver>>>;
pub type CodecFactory = Box<dyn FnMut(CodecKind) -> io::Result<Box<dyn Codec>>>;
pub type ScalerFactory = Box<dyn FnMut(&ConversionRequest) -> io::Result<Box<dyn Scaler>>>;

/// Backend overrides. Unset slots use the built-in backend for the config.
#[derive(Default)]
pub struct Backends {
    driver: Option<DriverFactory>,
    codec: Option<CodecFactory>,
    scaler: Option<ScalerFactory>,
}

impl Backends {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_driver<F>(mut self, factory: F) -> Self
    where
        F: FnMut(&str) -> io::Result<Box<dyn VideoDriver>> + 'static,
    {
        self.driver = Some(Box::new(factory));
        self
    }

    pub fn with_codec<F>(mut self, factory: F) -> Self
    where
        F: FnMut(CodecKind) -> io::Result<Box<dyn Codec>> + 'static,
    {
        self.codec = Some(Box::new(factory));
        self
    }

    pub fn with_scaler<F>(mut self, factory: F) -> Self
    where
        F: FnMut(&ConversionRequest) -> io::Result<Box<dyn Scaler>> + 'static,
    {
        self.scaler = Some(Box::new(factory));
        self
    }
}

/// What a session did, kept even when it ended in an error.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CaptureReport {
    pub frames_dequeued: u64,
    pub frames_delivered: u64,
    pub bytes_dequeued: u64,
    pub negotiated: Option<NegotiatedFormat>,
    /// Loop ended because the cancel token was set.
    pub cancelled: bool,
    /// The stall watchdog set the cancel token.
    pub stalled: bool,
}

pub struct CaptureSession {
    config: CaptureConfig,
    backends: Backends,
    state: SessionState,
    transitions: Vec<SessionState>,
    resources: Vec<Resource>,
    engine: Option<DecodeEngine>,
    device: Option<DeviceSession>,
    heartbeat: Heartbeat,
    report: CaptureReport,
}

impl CaptureSession {
    pub fn new(config: CaptureConfig) -> Self {
        Self::with_backends(config, Backends::default())
    }

    pub fn with_backends(config: CaptureConfig, backends: Backends) -> Self {
        Self {
            config,
            backends,
            state: SessionState::Idle,
            transitions: vec![SessionState::Idle],
            resources: Vec::new(),
            engine: None,
            device: None,
            heartbeat: Heartbeat::new(),
            report: CaptureReport::default(),
        }
    }

    /// Share a heartbeat with an external watchdog. It beats after every dequeue.
    pub fn with_heartbeat(mut self, heartbeat: Heartbeat) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Every state the session has been in, oldest first.
    pub fn transitions(&self) -> &[SessionState] {
        &self.transitions
    }

    pub fn report(&self) -> &CaptureReport {
        &self.report
    }

    /// Run the whole session on the calling thread.
    ///
    /// Returns once the cancel token is observed or a stage fails. Either way
    /// every acquired resource has been released by the time this returns.
    pub fn start<C>(&mut self, consumer: &mut C, cancel: &CancelToken) -> CaptureResult<CaptureReport>
    where
        C: FrameConsumer + ?Sized,
    {
        if self.state != SessionState::Idle {
            return Err(CaptureError::InvalidState {
                state: self.state,
                operation: "start",
            });
        }

        self.transition(SessionState::Initializing);
        if let Err(err) = self.initialize() {
            log::error!("CaptureSession: setup failed: {}", err);
            self.unwind();
            self.transition(SessionState::Failed);
            return Err(err);
        }
        self.transition(SessionState::Streaming);

        let watchdog = self.config.stall_timeout.and_then(|timeout| {
            Watchdog::spawn(cancel.clone(), self.heartbeat.clone(), timeout)
                .map_err(|err| log::warn!("CaptureSession: watchdog unavailable: {}", err))
                .ok()
        });
        let outcome = self.run(consumer, cancel);
        if let Some(watchdog) = watchdog {
            self.report.stalled = watchdog.stop();
        }

        self.transition(SessionState::Draining);
        self.unwind();
        self.transition(SessionState::Closed);
        log::info!(
            "CaptureSession: {} buffer(s) dequeued, {} frame(s) delivered",
            self.report.frames_dequeued,
            self.report.frames_delivered
        );

        match outcome {
            Ok(()) => Ok(self.report.clone()),
            Err(err) => {
                log::error!("CaptureSession: capture stopped: {}", err);
                Err(err)
            }
        }
    }

    /// Release everything still held. Idempotent; a session that never started closes too.
    pub fn close(&mut self) {
        self.unwind();
        if !self.state.is_terminal() {
            self.transition(SessionState::Closed);
        }
    }

    fn initialize(&mut self) -> CaptureResult<()> {
        let config = &self.config;
        let kind = config.validate_settings()?;

        let engine = match self.backends.codec.as_mut() {
            Some(factory) => DecodeEngine::init_with(
                factory(kind).map_err(|source| CaptureError::CodecInit { codec: kind, source })?,
            ),
            None => {
                config.validate()?;
                DecodeEngine::init(kind)?
            }
        };
        let engine = self.engine.insert(engine);
        self.resources.push(Resource::OutputBuffer);
        self.resources.push(Resource::Codec);

        let request = ConversionRequest {
            source: engine.decoder_output_format()?,
            target: config.pixel_format,
            width: config.width,
            height: config.height,
        };
        match self.backends.scaler.as_mut() {
            Some(factory) => {
                let scaler =
                    factory(&request).map_err(|source| CaptureError::ScalerInit { source })?;
                engine.configure_scaler_with(scaler, &request)?;
            }
            None => engine.configure_scaler(
                request.source,
                request.target,
                request.width,
                request.height,
            )?,
        }
        self.resources.push(Resource::Scaler);

        let path = config.device.as_str();
        let device = match self.backends.driver.as_mut() {
            Some(factory) => {
                let driver = factory(path).map_err(|source| CaptureError::Open {
                    path: path.to_string(),
                    source,
                })?;
                DeviceSession::with_driver(path, driver)
            }
            None => DeviceSession::open(path)?,
        };
        let device = self.device.insert(device);
        self.resources.push(Resource::Device);

        let negotiated = FormatNegotiator::new(config).negotiate(device)?;
        engine.set_source_stride(negotiated.bytes_per_line as usize);
        self.report.negotiated = Some(negotiated);

        let granted = device.request_buffers(config.buffer_count)?;
        self.resources.push(Resource::BufferRequest);
        for index in 0..granted {
            device.map_buffer(index)?;
            self.resources.push(Resource::Mapping(index));
        }
        Ok(())
    }

    fn run<C>(&mut self, consumer: &mut C, cancel: &CancelToken) -> CaptureResult<()>
    where
        C: FrameConsumer + ?Sized,
    {
        let (Some(device), Some(engine)) = (self.device.as_mut(), self.engine.as_mut()) else {
            return Err(CaptureError::InvalidState {
                state: self.state,
                operation: "run",
            });
        };

        // Cancelling from any thread also ends a dequeue blocked in the driver.
        let _wake_hook = device
            .waker()
            .map(|waker| cancel.on_cancel(move || waker.wake()));

        // Buffers the process owns and has not yet handed back.
        let mut pending: VecDeque<u32> = (0..device.ring().len() as u32).collect();
        loop {
            if cancel.is_cancelled() {
                log::info!("CaptureSession: cancellation observed");
                self.report.cancelled = true;
                return Ok(());
            }
            while let Some(index) = pending.pop_front() {
                device.enqueue(index)?;
            }
            if !device.is_streaming() {
                device.stream_on()?;
                self.resources.push(Resource::Stream);
            }

            let dequeued = match device.dequeue() {
                Ok(dequeued) => dequeued,
                Err(err) if err.is_interrupted() && cancel.is_cancelled() => {
                    log::info!("CaptureSession: cancellation ended a pending dequeue");
                    self.report.cancelled = true;
                    return Ok(());
                }
                Err(err) => return Err(err),
            };
            self.heartbeat.beat();
            self.report.frames_dequeued += 1;
            self.report.bytes_dequeued += dequeued.bytes_used as u64;

            let bytes = device.frame_bytes(&dequeued)?;
            let delivered = engine.decode(bytes, |frame| consumer.on_frame(frame))?;
            self.report.frames_delivered += delivered as u64;
            pending.push_back(dequeued.index);
        }
    }

    fn unwind(&mut self) {
        while let Some(resource) = self.resources.pop() {
            self.release(resource);
        }
    }

    fn release(&mut self, resource: Resource) {
        log::debug!("CaptureSession: releasing {:?}", resource);
        match resource {
            Resource::Stream => {
                if let Some(device) = self.device.as_mut() {
                    if let Err(err) = device.stream_off() {
                        log::error!("CaptureSession: stream off failed: {}", err);
                    }
                }
            }
            Resource::Mapping(index) => {
                if let Some(device) = self.device.as_mut() {
                    device.unmap_buffer(index);
                }
            }
            Resource::BufferRequest => {
                if let Some(device) = self.device.as_mut() {
                    device.release_buffers();
                }
            }
            Resource::Device => {
                if let Some(mut device) = self.device.take() {
                    device.close();
                }
            }
            Resource::Scaler => {
                if let Some(engine) = self.engine.as_mut() {
                    engine.release_scaler();
                }
            }
            Resource::Codec => {
                if let Some(engine) = self.engine.as_mut() {
                    engine.release_codec();
                }
            }
            Resource::OutputBuffer => {
                if let Some(mut engine) = self.engine.take() {
                    engine.release_arena();
                }
            }
        }
    }

    fn transition(&mut self, next: SessionState) {
        log::info!("CaptureSession: {:?} -> {:?}", self.state, next);
        self.state = next;
        self.transitions.push(next);
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        self.unwind();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::DecodedFrame;
    use crate::format::{FrameRate, PixelFormat};
    use crate::ErrorKind;

    fn stub_config(device: &str) -> CaptureConfig {
        CaptureConfig {
            device: device.to_string(),
            width: 32,
            height: 16,
            frame_rate: FrameRate::THIRTY,
            pixel_format: PixelFormat::Rgb24,
            capture_format: PixelFormat::Yuyv,
            buffer_count: 2,
            stall_timeout: None,
        }
    }

    #[test]
    fn runtime_disconnect_drains_and_closes() {
        let mut session = CaptureSession::new(stub_config("stub://cam?frames=4&realtime=0"));
        let mut sizes = Vec::new();
        let mut consumer = |frame: &DecodedFrame<'_>| sizes.push((frame.width, frame.height));

        let err = session
            .start(&mut consumer, &CancelToken::new())
            .expect_err("device disconnects after four frames");
        assert_eq!(err.kind(), ErrorKind::Dequeue);
        assert_eq!(sizes, vec![(32, 16); 4]);
        assert_eq!(session.report().frames_dequeued, 4);
        assert_eq!(
            session.transitions(),
            &[
                SessionState::Idle,
                SessionState::Initializing,
                SessionState::Streaming,
                SessionState::Draining,
                SessionState::Closed
            ]
        );
        assert!(session.resources.is_empty());
        assert!(session.device.is_none() && session.engine.is_none());
    }

    #[test]
    fn consumer_cancellation_stops_after_the_current_frame() -> anyhow::Result<()> {
        let cancel = CancelToken::new();
        let remote = cancel.clone();
        let mut seen = 0;
        let mut consumer = |_: &DecodedFrame<'_>| {
            seen += 1;
            if seen == 2 {
                remote.cancel();
            }
        };
        let mut session = CaptureSession::new(stub_config("stub://cam?realtime=0"));
        let report = session.start(&mut consumer, &cancel)?;
        assert_eq!(seen, 2);
        assert!(report.cancelled);
        assert_eq!(report.frames_delivered, 2);
        assert_eq!(report.bytes_dequeued, 2 * 32 * 16 * 2);
        assert_eq!(session.state(), SessionState::Closed);
        Ok(())
    }

    #[test]
    fn sessions_are_one_shot() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let mut session = CaptureSession::new(stub_config("stub://cam?realtime=0"));
        let mut ignore = |_: &DecodedFrame<'_>| {};
        assert!(session.start(&mut ignore, &cancel).is_ok());
        let err = session.start(&mut ignore, &cancel).expect_err("closed session");
        assert!(matches!(
            err,
            CaptureError::InvalidState {
                state: SessionState::Closed,
                operation: "start"
            }
        ));
    }

    #[test]
    fn substituted_capture_format_fails_setup() {
        let config = CaptureConfig {
            capture_format: PixelFormat::Mjpeg,
            ..stub_config("stub://cam?realtime=0")
        };
        let mut session = CaptureSession::new(config);
        let mut ignore = |_: &DecodedFrame<'_>| {};
        let result = session.start(&mut ignore, &CancelToken::new());
        match result {
            Err(err) => assert!(
                matches!(
                    err.kind(),
                    ErrorKind::FormatRejected | ErrorKind::CodecInit | ErrorKind::InvalidConfig
                ),
                "{err}"
            ),
            Ok(_) => panic!("synthetic device cannot produce MJPEG"),
        }
        assert_eq!(session.state(), SessionState::Failed);
        assert!(session.resources.is_empty());
    }

    #[test]
    fn stalled_device_is_cancelled_by_the_watchdog() -> anyhow::Result<()> {
        // 1 fps pacing against a 50 ms stall limit: the second dequeue is late,
        // and the watchdog ends it well before the frame would arrive.
        let config = CaptureConfig {
            frame_rate: FrameRate::new(1, 1)?,
            stall_timeout: Some(std::time::Duration::from_millis(50)),
            ..stub_config("stub://slow")
        };
        let mut session = CaptureSession::new(config);
        let mut ignore = |_: &DecodedFrame<'_>| {};
        let started = std::time::Instant::now();
        let report = session.start(&mut ignore, &CancelToken::new())?;
        assert!(report.cancelled);
        assert!(report.stalled);
        assert_eq!(report.frames_delivered, 1);
        assert!(started.elapsed() < std::time::Duration::from_millis(900));
        assert_eq!(session.state(), SessionState::Closed);
        Ok(())
    }

    #[test]
    fn default_config_fails_setup_cleanly() {
        let config = CaptureConfig {
            device: "stub://default".to_string(),
            ..CaptureConfig::default()
        };
        let mut session = CaptureSession::new(config);
        let mut ignore = |_: &DecodedFrame<'_>| {};
        let cancel = CancelToken::new();
        cancel.cancel();
        let result = session.start(&mut ignore, &cancel);
        if CodecKind::H264.is_built_in() {
            // The decoder opens; the synthetic device then refuses H.264.
            let err = result.expect_err("synthetic device cannot produce H.264");
            assert_eq!(err.kind(), ErrorKind::FormatRejected);
        } else {
            let err = result.expect_err("H.264 needs codec-ffmpeg");
            assert_eq!(err.kind(), ErrorKind::InvalidConfig);
            assert_eq!(
                session.transitions(),
                &[SessionState::Idle, SessionState::Initializing, SessionState::Failed]
            );
        }
        assert!(session.resources.is_empty());
    }

    #[test]
    fn close_before_start_is_terminal() {
        let mut session = CaptureSession::new(stub_config("stub://cam"));
        session.close();
        session.close();
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(session.transitions(), &[SessionState::Idle, SessionState::Closed]);
    }
}
