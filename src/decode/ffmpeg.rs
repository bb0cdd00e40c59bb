//! libavcodec decoding and swscale conversion.

use std::io;

use ffmpeg_next as ffmpeg;
use ffmpeg::software::scaling::{self, flag::Flags};
use ffmpeg::util::format::pixel::Pixel;

use crate::error::io_other;
use crate::format::PixelFormat;

use super::{Codec, CodecKind, ConversionRequest, FrameArena, Picture, Pull, Scaler};

pub struct FfmpegCodec {
    kind: CodecKind,
    decoder: ffmpeg::decoder::Video,
    frame: ffmpeg::frame::Video,
}

impl FfmpegCodec {
    pub fn new(kind: CodecKind) -> io::Result<Self> {
        ffmpeg::init().map_err(av_error)?;
        let id = codec_id(kind).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::Unsupported,
                format!("{kind} is not an FFmpeg codec"),
            )
        })?;
        let codec = ffmpeg::decoder::find(id).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::Unsupported,
                format!("libavcodec was built without a {kind} decoder"),
            )
        })?;
        let decoder = ffmpeg::codec::context::Context::new_with_codec(codec)
            .decoder()
            .video()
            .map_err(av_error)?;
        Ok(Self {
            kind,
            decoder,
            frame: ffmpeg::frame::Video::empty(),
        })
    }
}

impl Codec for FfmpegCodec {
    fn kind(&self) -> CodecKind {
        self.kind
    }

    /// Nominal; the scaler follows whatever the decoder actually emits.
    fn output_format(&self) -> PixelFormat {
        PixelFormat::Yuv420
    }

    fn send(&mut self, data: &[u8]) -> io::Result<()> {
        self.decoder
            .send_packet(&ffmpeg::Packet::copy(data))
            .map_err(av_error)
    }

    fn receive(&mut self) -> io::Result<Pull<'_>> {
        match self.decoder.receive_frame(&mut self.frame) {
            Ok(()) => Ok(Pull::Frame(Picture::Av(&self.frame))),
            Err(ffmpeg::Error::Other { errno }) if errno == ffmpeg::util::error::EAGAIN => {
                Ok(Pull::Again)
            }
            Err(ffmpeg::Error::Eof) => Ok(Pull::EndOfStream),
            Err(err) => Err(av_error(err)),
        }
    }
}

/// swscale conversion. The context is rebuilt when the decoder's output layout
/// differs from the one it was built for.
pub struct SwsScaler {
    context: scaling::Context,
    target: PixelFormat,
    target_pixel: Pixel,
    output: ffmpeg::frame::Video,
}

impl SwsScaler {
    pub fn new(request: &ConversionRequest) -> io::Result<Self> {
        let source = av_pixel(request.source).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::Unsupported,
                format!("no swscale layout for {}", request.source),
            )
        })?;
        let target_pixel = av_pixel(request.target)
            .filter(|_| super::is_output_format(request.target))
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::Unsupported,
                    format!("no conversion to {}", request.target),
                )
            })?;
        let context = scaling::Context::get(
            source,
            request.width,
            request.height,
            target_pixel,
            request.width,
            request.height,
            Flags::BILINEAR,
        )
        .map_err(av_error)?;
        Ok(Self {
            context,
            target: request.target,
            target_pixel,
            output: ffmpeg::frame::Video::empty(),
        })
    }
}

impl Scaler for SwsScaler {
    fn scale(&mut self, picture: &Picture<'_>, arena: &mut FrameArena) -> io::Result<()> {
        let Picture::Av(frame) = picture else {
            return Err(io_other("swscale only accepts decoder frames"));
        };
        let input = self.context.input();
        if input.format != frame.format()
            || input.width != frame.width()
            || input.height != frame.height()
        {
            log::info!(
                "SwsScaler: decoder emits {:?} {}x{}, rebuilding",
                frame.format(),
                frame.width(),
                frame.height()
            );
            self.context = scaling::Context::get(
                frame.format(),
                frame.width(),
                frame.height(),
                self.target_pixel,
                frame.width(),
                frame.height(),
                Flags::BILINEAR,
            )
            .map_err(av_error)?;
        }
        self.context.run(frame, &mut self.output).map_err(av_error)?;
        copy_rows(&self.output, self.target, arena)
    }
}

/// Copy the first plane row by row, dropping libav's line padding.
fn copy_rows(frame: &ffmpeg::frame::Video, target: PixelFormat, arena: &mut FrameArena) -> io::Result<()> {
    let width = frame.width();
    let height = frame.height();
    let out = arena.prepare(target, width, height)?;
    let row_bytes = out.len() / height.max(1) as usize;
    let stride = frame.stride(0);
    let data = frame.data(0);

    if stride == row_bytes {
        let src = data
            .get(..out.len())
            .ok_or_else(|| io_other("ffmpeg frame is shorter than its dimensions"))?;
        out.copy_from_slice(src);
        return Ok(());
    }
    for (row, dst) in out.chunks_exact_mut(row_bytes).enumerate() {
        let start = row * stride;
        let src = data
            .get(start..start + row_bytes)
            .ok_or_else(|| io_other("ffmpeg frame row is out of bounds"))?;
        dst.copy_from_slice(src);
    }
    Ok(())
}

fn codec_id(kind: CodecKind) -> Option<ffmpeg::codec::Id> {
    use ffmpeg::codec::Id;
    match kind {
        CodecKind::H264 => Some(Id::H264),
        CodecKind::Hevc => Some(Id::HEVC),
        CodecKind::Vp8 => Some(Id::VP8),
        CodecKind::Vp9 => Some(Id::VP9),
        CodecKind::Mpeg4 => Some(Id::MPEG4),
        CodecKind::Mjpeg => Some(Id::MJPEG),
        CodecKind::Raw(_) => None,
    }
}

fn av_pixel(format: PixelFormat) -> Option<Pixel> {
    match format {
        PixelFormat::Yuv420 => Some(Pixel::YUV420P),
        PixelFormat::Yuv422P => Some(Pixel::YUV422P),
        PixelFormat::Nv12 => Some(Pixel::NV12),
        PixelFormat::Yuyv => Some(Pixel::YUYV422),
        PixelFormat::Uyvy => Some(Pixel::UYVY422),
        PixelFormat::Rgb24 => Some(Pixel::RGB24),
        PixelFormat::Bgr24 => Some(Pixel::BGR24),
        PixelFormat::Rgba32 => Some(Pixel::RGBA),
        PixelFormat::Grey => Some(Pixel::GRAY8),
        _ => None,
    }
}

fn av_error(err: ffmpeg::Error) -> io::Error {
    io::Error::new(io::ErrorKind::Other, err)
}
