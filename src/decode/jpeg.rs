//! MJPEG decoding through the `image` crate, for builds without FFmpeg.

use std::io;

use crate::format::PixelFormat;

use super::{Codec, CodecKind, PackedPicture, Picture, Pull};

pub struct JpegCodec {
    rgb: Vec<u8>,
    width: u32,
    height: u32,
    pending: bool,
}

impl JpegCodec {
    pub fn new() -> Self {
        Self {
            rgb: Vec::new(),
            width: 0,
            height: 0,
            pending: false,
        }
    }
}

impl Default for JpegCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Codec for JpegCodec {
    fn kind(&self) -> CodecKind {
        CodecKind::Mjpeg
    }

    fn output_format(&self) -> PixelFormat {
        PixelFormat::Rgb24
    }

    /// Drivers pad MJPEG buffers, so only the SOI..EOI span is decoded.
    /// A unit without a complete image produces no frame.
    fn send(&mut self, data: &[u8]) -> io::Result<()> {
        let Some((start, end)) = find_jpeg_bounds(data) else {
            log::debug!("JpegCodec: {} byte unit holds no complete image", data.len());
            self.pending = false;
            return Ok(());
        };
        let image = image::load_from_memory_with_format(&data[start..end], image::ImageFormat::Jpeg)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        let rgb = image.into_rgb8();
        let (width, height) = rgb.dimensions();
        self.rgb = rgb.into_raw();
        self.width = width;
        self.height = height;
        self.pending = true;
        Ok(())
    }

    fn receive(&mut self) -> io::Result<Pull<'_>> {
        if !self.pending {
            return Ok(Pull::Again);
        }
        self.pending = false;
        Ok(Pull::Frame(Picture::Packed(PackedPicture {
            format: PixelFormat::Rgb24,
            width: self.width,
            height: self.height,
            stride: self.width as usize * 3,
            data: &self.rgb,
        })))
    }
}

fn find_jpeg_bounds(buffer: &[u8]) -> Option<(usize, usize)> {
    let start = buffer.windows(2).position(|pair| pair == [0xFF, 0xD8])?;
    let end = buffer[start + 2..]
        .windows(2)
        .position(|pair| pair == [0xFF, 0xD9])?;
    Some((start, start + 2 + end + 2))
}
