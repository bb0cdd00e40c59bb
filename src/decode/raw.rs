use std::io;

use crate::error::io_other;
use crate::format::PixelFormat;

use super::{Codec, CodecKind, PackedPicture, Picture, Pull};

/// Pass-through "decoder" for uncompressed capture formats.
///
/// Every submitted unit is exactly one frame; it is surfaced once, then the
/// codec reports `Again` until the next submit.
pub struct RawCodec {
    format: PixelFormat,
    width: u32,
    height: u32,
    /// Driver row pitch; zero means tightly packed rows.
    bytes_per_line: usize,
    frame: Vec<u8>,
    pending: bool,
}

impl RawCodec {
    pub fn new(format: PixelFormat) -> Self {
        Self {
            format,
            width: 0,
            height: 0,
            bytes_per_line: 0,
            frame: Vec::new(),
            pending: false,
        }
    }

    /// Negotiated row pitch, or the tight one when the driver reported none.
    fn stride(&self) -> io::Result<usize> {
        if self.width == 0 || self.height == 0 {
            return Err(io_other("raw frame size is not known yet"));
        }
        if self.bytes_per_line > 0 {
            return Ok(self.bytes_per_line);
        }
        self.format
            .row_bytes(self.width)
            .ok_or_else(|| io_other(format!("{} has no packed row layout", self.format)))
    }
}

impl Codec for RawCodec {
    fn kind(&self) -> CodecKind {
        CodecKind::Raw(self.format)
    }

    fn output_format(&self) -> PixelFormat {
        self.format
    }

    fn hint_dimensions(&mut self, width: u32, height: u32) {
        self.width = width;
        self.height = height;
    }

    fn hint_stride(&mut self, bytes_per_line: usize) {
        self.bytes_per_line = bytes_per_line;
    }

    fn send(&mut self, data: &[u8]) -> io::Result<()> {
        let stride = self.stride()?;
        let expected = self
            .format
            .frame_len(self.width, self.height, stride)
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!(
                        "{} rows of {}x{} do not fit a {} byte stride",
                        self.format, self.width, self.height, stride
                    ),
                )
            })?;
        if data.len() < expected {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "short {} frame: expected {} bytes, got {}",
                    self.format,
                    expected,
                    data.len()
                ),
            ));
        }
        self.frame.clear();
        self.frame.extend_from_slice(&data[..expected]);
        self.pending = true;
        Ok(())
    }

    fn receive(&mut self) -> io::Result<Pull<'_>> {
        if !self.pending {
            return Ok(Pull::Again);
        }
        self.pending = false;
        let stride = self.stride()?;
        Ok(Pull::Frame(Picture::Packed(PackedPicture {
            format: self.format,
            width: self.width,
            height: self.height,
            stride,
            data: &self.frame,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn each_unit_is_surfaced_once() -> anyhow::Result<()> {
        let mut codec = RawCodec::new(PixelFormat::Grey);
        codec.hint_dimensions(2, 2);
        codec.send(&[1, 2, 3, 4])?;
        assert!(matches!(codec.receive()?, Pull::Frame(_)));
        assert!(matches!(codec.receive()?, Pull::Again));
        Ok(())
    }

    #[test]
    fn short_units_are_rejected() {
        let mut codec = RawCodec::new(PixelFormat::Yuyv);
        codec.hint_dimensions(4, 2);
        let err = codec.send(&[0; 8]).expect_err("8 of 16 bytes");
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn padded_rows_keep_the_driver_stride() -> anyhow::Result<()> {
        let mut codec = RawCodec::new(PixelFormat::Grey);
        codec.hint_dimensions(4, 2);
        codec.hint_stride(8);
        codec.send(&[10, 10, 10, 10, 0, 0, 0, 0, 20, 20, 20, 20, 0, 0, 0, 0])?;
        match codec.receive()? {
            Pull::Frame(Picture::Packed(picture)) => {
                assert_eq!(picture.stride, 8);
                assert_eq!(picture.data.len(), 12);
                assert_eq!(picture.data[8..], [20, 20, 20, 20]);
            }
            _ => panic!("expected a packed frame"),
        }
        Ok(())
    }

    #[test]
    fn stride_shorter_than_a_row_is_rejected() {
        let mut codec = RawCodec::new(PixelFormat::Rgb24);
        codec.hint_dimensions(4, 2);
        codec.hint_stride(8);
        let err = codec.send(&[0; 32]).expect_err("8 < 12 bytes per row");
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn send_before_dimensions_fails() {
        let mut codec = RawCodec::new(PixelFormat::Rgb24);
        assert!(codec.send(&[0; 12]).is_err());
    }
}
