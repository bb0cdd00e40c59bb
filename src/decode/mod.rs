//! Decode engine: turns captured bytes into caller-visible pixel buffers.
//!
//! One `decode` call submits one captured unit to the [`Codec`], then pulls
//! until the codec reports [`Pull::Again`] or [`Pull::EndOfStream`]. Every
//! pulled picture is converted by the [`Scaler`] into the engine's reusable
//! [`FrameArena`] and surfaced to the caller before the next pull, so a single
//! submit may surface zero, one or several frames.
//!
//! Backends:
//! - `raw`: pass-through for uncompressed capture formats
//! - `jpeg`: MJPEG through the `image` crate (feature: codec-mjpeg)
//! - `ffmpeg`: libavcodec + swscale (feature: codec-ffmpeg)

use std::fmt;
use std::io;

use crate::error::{io_other, CaptureError, CaptureResult};
use crate::format::PixelFormat;

pub mod convert;
#[cfg(feature = "codec-ffmpeg")]
pub mod ffmpeg;
#[cfg(feature = "codec-mjpeg")]
pub mod jpeg;
pub mod raw;

pub use convert::Converter;
pub use raw::RawCodec;

/// What decodes a given capture format.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CodecKind {
    H264,
    Hevc,
    Vp8,
    Vp9,
    Mpeg4,
    Mjpeg,
    /// Uncompressed capture; frames pass straight to the converter.
    Raw(PixelFormat),
}

impl CodecKind {
    /// Codec for a capture format, or `None` when nothing in this crate can decode it.
    pub fn for_capture_format(format: PixelFormat) -> Option<Self> {
        match format {
            PixelFormat::H264 | PixelFormat::H264NoSc => Some(CodecKind::H264),
            PixelFormat::Hevc => Some(CodecKind::Hevc),
            PixelFormat::Vp8 => Some(CodecKind::Vp8),
            PixelFormat::Vp9 => Some(CodecKind::Vp9),
            PixelFormat::Mpeg4 => Some(CodecKind::Mpeg4),
            PixelFormat::Mjpeg | PixelFormat::Jpeg => Some(CodecKind::Mjpeg),
            raw if Converter::accepts_source(raw) => Some(CodecKind::Raw(raw)),
            _ => None,
        }
    }

    /// Whether this build carries a decoder for the kind (see the codec features).
    pub fn is_built_in(self) -> bool {
        match self {
            CodecKind::Raw(_) => true,
            CodecKind::Mjpeg => cfg!(any(feature = "codec-mjpeg", feature = "codec-ffmpeg")),
            _ => cfg!(feature = "codec-ffmpeg"),
        }
    }
}

impl fmt::Display for CodecKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecKind::H264 => f.write_str("H.264"),
            CodecKind::Hevc => f.write_str("HEVC"),
            CodecKind::Vp8 => f.write_str("VP8"),
            CodecKind::Vp9 => f.write_str("VP9"),
            CodecKind::Mpeg4 => f.write_str("MPEG-4"),
            CodecKind::Mjpeg => f.write_str("MJPEG"),
            CodecKind::Raw(format) => write!(f, "raw {format}"),
        }
    }
}

/// Output layouts the converters can produce.
pub fn is_output_format(format: PixelFormat) -> bool {
    matches!(
        format,
        PixelFormat::Rgb24 | PixelFormat::Bgr24 | PixelFormat::Rgba32 | PixelFormat::Grey
    )
}

/// A tightly described packed picture borrowed from a codec.
#[derive(Clone, Copy, Debug)]
pub struct PackedPicture<'a> {
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub stride: usize,
    pub data: &'a [u8],
}

/// Raw decoder output, valid until the next call into the codec.
pub enum Picture<'a> {
    Packed(PackedPicture<'a>),
    #[cfg(feature = "codec-ffmpeg")]
    Av(&'a ffmpeg_next::frame::Video),
}

impl<'a> Picture<'a> {
    pub fn as_packed(&self) -> Option<&PackedPicture<'a>> {
        match self {
            Picture::Packed(picture) => Some(picture),
            #[cfg(feature = "codec-ffmpeg")]
            Picture::Av(_) => None,
        }
    }

    pub fn width(&self) -> u32 {
        match self {
            Picture::Packed(picture) => picture.width,
            #[cfg(feature = "codec-ffmpeg")]
            Picture::Av(frame) => frame.width(),
        }
    }

    pub fn height(&self) -> u32 {
        match self {
            Picture::Packed(picture) => picture.height,
            #[cfg(feature = "codec-ffmpeg")]
            Picture::Av(frame) => frame.height(),
        }
    }
}

/// Result of one pull from a codec.
pub enum Pull<'a> {
    Frame(Picture<'a>),
    /// No output for the input submitted so far.
    Again,
    /// The codec has been flushed and will produce nothing more.
    EndOfStream,
}

/// Submit/pull decoder protocol.
pub trait Codec {
    fn kind(&self) -> CodecKind;

    /// Layout of the pictures `receive` hands out.
    fn output_format(&self) -> PixelFormat;

    /// Frame size agreed with the device. Codecs that carry it in-band ignore it.
    fn hint_dimensions(&mut self, _width: u32, _height: u32) {}

    /// Row pitch the driver reported for captured frames; zero means tightly packed.
    fn hint_stride(&mut self, _bytes_per_line: usize) {}

    fn send(&mut self, data: &[u8]) -> io::Result<()>;

    fn receive(&mut self) -> io::Result<Pull<'_>>;
}

/// Color conversion into the output arena.
pub trait Scaler {
    fn scale(&mut self, picture: &Picture<'_>, arena: &mut FrameArena) -> io::Result<()>;
}

/// Parameters of the conversion path, fixed at `configure_scaler`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConversionRequest {
    pub source: PixelFormat,
    pub target: PixelFormat,
    pub width: u32,
    pub height: u32,
}

/// Reusable output buffer. Overwritten by every converted frame.
#[derive(Debug, Default)]
pub struct FrameArena {
    data: Vec<u8>,
    width: u32,
    height: u32,
    stride: usize,
    format: Option<PixelFormat>,
}

impl FrameArena {
    /// Size the arena for one packed frame and return its bytes.
    pub fn prepare(&mut self, format: PixelFormat, width: u32, height: u32) -> io::Result<&mut [u8]> {
        let layout = format
            .layout(width, height)
            .ok_or_else(|| io_other(format!("no packed layout for {format} at {width}x{height}")))?;
        if self.data.len() != layout.size {
            self.data.resize(layout.size, 0);
        }
        self.width = width;
        self.height = height;
        self.stride = layout.stride;
        self.format = Some(format);
        Ok(&mut self.data)
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    fn view(&self, sequence: u64) -> Option<DecodedFrame<'_>> {
        Some(DecodedFrame {
            data: &self.data,
            width: self.width,
            height: self.height,
            stride: self.stride,
            format: self.format?,
            sequence,
        })
    }
}

/// A decoded frame as seen by the consumer. Only valid for the duration of the callback.
#[derive(Clone, Copy, Debug)]
pub struct DecodedFrame<'a> {
    pub data: &'a [u8],
    pub width: u32,
    pub height: u32,
    pub stride: usize,
    pub format: PixelFormat,
    /// 1-based count of frames this engine has surfaced.
    pub sequence: u64,
}

/// Decoder plus converter state owned by the capture thread.
pub struct DecodeEngine {
    kind: CodecKind,
    arena: Option<FrameArena>,
    codec: Option<Box<dyn Codec>>,
    scaler: Option<Box<dyn Scaler>>,
    sequence: u64,
}

impl DecodeEngine {
    /// Allocate the output arena and a decoder for `kind`.
    pub fn init(kind: CodecKind) -> CaptureResult<Self> {
        let codec = open_codec(kind).map_err(|source| CaptureError::CodecInit { codec: kind, source })?;
        Ok(Self::init_with(codec))
    }

    /// Use an already constructed codec.
    pub fn init_with(codec: Box<dyn Codec>) -> Self {
        let kind = codec.kind();
        log::info!("DecodeEngine: {} decoder ready", kind);
        Self {
            kind,
            arena: Some(FrameArena::default()),
            codec: Some(codec),
            scaler: None,
            sequence: 0,
        }
    }

    pub fn kind(&self) -> CodecKind {
        self.kind
    }

    pub fn frames_decoded(&self) -> u64 {
        self.sequence
    }

    /// Layout the decoder produces, i.e. the source side of the scaler.
    pub fn decoder_output_format(&self) -> CaptureResult<PixelFormat> {
        self.codec
            .as_ref()
            .map(|codec| codec.output_format())
            .ok_or_else(|| CaptureError::ScalerInit {
                source: io_other("decoder is not initialised"),
            })
    }

    /// Prepare the default conversion path for this engine's codec.
    pub fn configure_scaler(
        &mut self,
        source: PixelFormat,
        target: PixelFormat,
        width: u32,
        height: u32,
    ) -> CaptureResult<()> {
        let request = ConversionRequest {
            source,
            target,
            width,
            height,
        };
        let scaler = open_scaler(self.kind, &request)
            .map_err(|source| CaptureError::ScalerInit { source })?;
        self.configure_scaler_with(scaler, &request)
    }

    /// Install a constructed scaler and size the arena for `request`.
    pub fn configure_scaler_with(
        &mut self,
        scaler: Box<dyn Scaler>,
        request: &ConversionRequest,
    ) -> CaptureResult<()> {
        let (Some(codec), Some(arena)) = (self.codec.as_mut(), self.arena.as_mut()) else {
            return Err(CaptureError::ScalerInit {
                source: io_other("decoder is not initialised"),
            });
        };
        arena
            .prepare(request.target, request.width, request.height)
            .map_err(|source| CaptureError::ScalerInit { source })?;
        codec.hint_dimensions(request.width, request.height);
        self.scaler = Some(scaler);
        log::info!(
            "DecodeEngine: converting {} -> {} at {}x{}",
            request.source,
            request.target,
            request.width,
            request.height
        );
        Ok(())
    }

    /// Pass the negotiated row pitch of captured frames to the decoder.
    pub fn set_source_stride(&mut self, bytes_per_line: usize) {
        if let Some(codec) = self.codec.as_mut() {
            codec.hint_stride(bytes_per_line);
        }
    }

    /// Submit one captured unit and surface every frame the codec yields for it.
    ///
    /// Returns the number of frames surfaced.
    pub fn decode<F>(&mut self, data: &[u8], mut on_frame: F) -> CaptureResult<usize>
    where
        F: FnMut(&DecodedFrame<'_>),
    {
        let (Some(codec), Some(scaler), Some(arena)) =
            (self.codec.as_mut(), self.scaler.as_mut(), self.arena.as_mut())
        else {
            return Err(CaptureError::Decode {
                source: io_other("decode engine is not configured"),
            });
        };

        codec
            .send(data)
            .map_err(|source| CaptureError::Decode { source })?;

        let mut surfaced = 0;
        loop {
            match codec
                .receive()
                .map_err(|source| CaptureError::Decode { source })?
            {
                Pull::Frame(picture) => {
                    scaler
                        .scale(&picture, arena)
                        .map_err(|source| CaptureError::Decode { source })?;
                    self.sequence += 1;
                    let frame = arena.view(self.sequence).ok_or_else(|| CaptureError::Decode {
                        source: io_other("output arena was never sized"),
                    })?;
                    on_frame(&frame);
                    surfaced += 1;
                }
                Pull::Again => break,
                Pull::EndOfStream => {
                    log::debug!("DecodeEngine: {} decoder reached end of stream", self.kind);
                    break;
                }
            }
        }
        Ok(surfaced)
    }

    pub fn release_scaler(&mut self) {
        if self.scaler.take().is_some() {
            log::debug!("DecodeEngine: released scaler");
        }
    }

    pub fn release_codec(&mut self) {
        if self.codec.take().is_some() {
            log::debug!("DecodeEngine: released {} decoder", self.kind);
        }
    }

    pub fn release_arena(&mut self) {
        if self.arena.take().is_some() {
            log::debug!("DecodeEngine: released output buffer");
        }
    }

    /// Release scaler, then codec, then output buffer. Idempotent.
    pub fn teardown(&mut self) {
        self.release_scaler();
        self.release_codec();
        self.release_arena();
    }
}

impl Drop for DecodeEngine {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn open_codec(kind: CodecKind) -> io::Result<Box<dyn Codec>> {
    match kind {
        CodecKind::Raw(format) => Ok(Box::new(RawCodec::new(format))),
        #[cfg(feature = "codec-ffmpeg")]
        _ => Ok(Box::new(self::ffmpeg::FfmpegCodec::new(kind)?)),
        #[cfg(all(feature = "codec-mjpeg", not(feature = "codec-ffmpeg")))]
        CodecKind::Mjpeg => Ok(Box::new(jpeg::JpegCodec::new())),
        #[cfg(not(feature = "codec-ffmpeg"))]
        _ => Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("{kind} decoding requires the codec-ffmpeg feature"),
        )),
    }
}

#[cfg(feature = "codec-ffmpeg")]
fn open_scaler(kind: CodecKind, request: &ConversionRequest) -> io::Result<Box<dyn Scaler>> {
    if matches!(kind, CodecKind::Raw(_)) {
        return Ok(Box::new(Converter::new(request)?));
    }
    Ok(Box::new(self::ffmpeg::SwsScaler::new(request)?))
}

#[cfg(not(feature = "codec-ffmpeg"))]
fn open_scaler(_kind: CodecKind, request: &ConversionRequest) -> io::Result<Box<dyn Scaler>> {
    Ok(Box::new(Converter::new(request)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::rc::Rc;

    type Journal = Rc<RefCell<Vec<&'static str>>>;

    /// Yields a scripted number of RGB frames per submitted unit.
    struct ScriptedCodec {
        script: VecDeque<io::Result<usize>>,
        pending: usize,
        pixels: Vec<u8>,
        journal: Journal,
    }

    impl ScriptedCodec {
        fn new(script: Vec<io::Result<usize>>, journal: Journal) -> Self {
            Self {
                script: script.into(),
                pending: 0,
                pixels: Vec::new(),
                journal,
            }
        }
    }

    impl Codec for ScriptedCodec {
        fn kind(&self) -> CodecKind {
            CodecKind::H264
        }

        fn output_format(&self) -> PixelFormat {
            PixelFormat::Rgb24
        }

        fn send(&mut self, _data: &[u8]) -> io::Result<()> {
            self.pending = self.script.pop_front().unwrap_or(Ok(0))?;
            Ok(())
        }

        fn receive(&mut self) -> io::Result<Pull<'_>> {
            if self.pending == 0 {
                return Ok(Pull::Again);
            }
            self.pending -= 1;
            let shade = self.pending as u8;
            self.pixels = vec![shade; 2 * 2 * 3];
            Ok(Pull::Frame(Picture::Packed(PackedPicture {
                format: PixelFormat::Rgb24,
                width: 2,
                height: 2,
                stride: 6,
                data: &self.pixels,
            })))
        }
    }

    impl Drop for ScriptedCodec {
        fn drop(&mut self) {
            self.journal.borrow_mut().push("codec");
        }
    }

    struct JournalScaler {
        inner: Converter,
        journal: Journal,
    }

    impl Scaler for JournalScaler {
        fn scale(&mut self, picture: &Picture<'_>, arena: &mut FrameArena) -> io::Result<()> {
            self.inner.scale(picture, arena)
        }
    }

    impl Drop for JournalScaler {
        fn drop(&mut self) {
            self.journal.borrow_mut().push("scaler");
        }
    }

    fn engine(script: Vec<io::Result<usize>>, journal: &Journal) -> CaptureResult<DecodeEngine> {
        let request = ConversionRequest {
            source: PixelFormat::Rgb24,
            target: PixelFormat::Rgb24,
            width: 2,
            height: 2,
        };
        let mut engine =
            DecodeEngine::init_with(Box::new(ScriptedCodec::new(script, journal.clone())));
        let scaler = JournalScaler {
            inner: Converter::new(&request).map_err(|source| CaptureError::ScalerInit { source })?,
            journal: journal.clone(),
        };
        engine.configure_scaler_with(Box::new(scaler), &request)?;
        Ok(engine)
    }

    #[test]
    fn decode_surfaces_zero_one_or_many_frames_in_order() -> anyhow::Result<()> {
        let journal = Journal::default();
        let mut engine = engine(vec![Ok(0), Ok(1), Ok(3)], &journal)?;

        let mut seen = Vec::new();
        let mut record = |frame: &DecodedFrame<'_>| seen.push((frame.sequence, frame.data[0]));

        assert_eq!(engine.decode(b"a", &mut record)?, 0);
        assert_eq!(engine.decode(b"b", &mut record)?, 1);
        assert_eq!(engine.decode(b"c", &mut record)?, 3);
        assert_eq!(seen, vec![(1, 0), (2, 2), (3, 1), (4, 0)]);
        assert_eq!(engine.frames_decoded(), 4);
        Ok(())
    }

    #[test]
    fn codec_failures_surface_as_decode_errors() -> anyhow::Result<()> {
        let journal = Journal::default();
        let mut engine = engine(vec![Err(io_other("corrupt slice"))], &journal)?;
        let err = engine.decode(b"x", |_| panic!("no frame expected")).unwrap_err();
        assert!(matches!(err, CaptureError::Decode { .. }));
        Ok(())
    }

    #[test]
    fn teardown_releases_scaler_then_codec_once() -> anyhow::Result<()> {
        let journal = Journal::default();
        let mut engine = engine(vec![], &journal)?;
        engine.teardown();
        engine.teardown();
        drop(engine);
        assert_eq!(*journal.borrow(), vec!["scaler", "codec"]);
        Ok(())
    }

    #[test]
    fn decode_requires_a_configured_scaler() {
        let journal = Journal::default();
        let mut engine = DecodeEngine::init_with(Box::new(ScriptedCodec::new(vec![], journal)));
        assert!(matches!(
            engine.decode(b"x", |_| {}),
            Err(CaptureError::Decode { .. })
        ));
    }

    #[test]
    fn capture_formats_map_to_codecs() {
        assert_eq!(CodecKind::for_capture_format(PixelFormat::H264), Some(CodecKind::H264));
        assert_eq!(CodecKind::for_capture_format(PixelFormat::Mjpeg), Some(CodecKind::Mjpeg));
        assert_eq!(
            CodecKind::for_capture_format(PixelFormat::Yuyv),
            Some(CodecKind::Raw(PixelFormat::Yuyv))
        );
        assert_eq!(CodecKind::for_capture_format(PixelFormat::Sbggr8), None);
    }

    #[test]
    fn built_in_kinds_open_without_injection() {
        for kind in [
            CodecKind::H264,
            CodecKind::Hevc,
            CodecKind::Vp9,
            CodecKind::Mjpeg,
            CodecKind::Raw(PixelFormat::Yuyv),
        ] {
            if !kind.is_built_in() {
                assert!(DecodeEngine::init(kind).is_err(), "{kind}");
            }
        }
        assert!(CodecKind::Raw(PixelFormat::Grey).is_built_in());
        assert_eq!(CodecKind::H264.is_built_in(), cfg!(feature = "codec-ffmpeg"));
    }

    #[test]
    fn raw_formats_never_need_ffmpeg() -> anyhow::Result<()> {
        let engine = DecodeEngine::init(CodecKind::Raw(PixelFormat::Nv12))?;
        assert_eq!(engine.decoder_output_format()?, PixelFormat::Nv12);
        Ok(())
    }
}
