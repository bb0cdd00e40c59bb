use std::io;

use crate::error::io_other;
use crate::format::PixelFormat;

use super::{is_output_format, ConversionRequest, FrameArena, PackedPicture, Picture, Scaler};

/// Built-in color converter for packed pictures (raw capture, MJPEG via `image`).
#[derive(Clone, Debug)]
pub struct Converter {
    source: PixelFormat,
    target: PixelFormat,
}

impl Converter {
    pub fn new(request: &ConversionRequest) -> io::Result<Self> {
        if !Self::accepts_source(request.source) {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("no conversion from {}", request.source),
            ));
        }
        if !is_output_format(request.target) {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("no conversion to {}", request.target),
            ));
        }
        if request.target.layout(request.width, request.height).is_none()
            || request.width == 0
            || request.height == 0
        {
            return Err(io_other(format!(
                "invalid conversion size {}x{}",
                request.width, request.height
            )));
        }
        Ok(Self {
            source: request.source,
            target: request.target,
        })
    }

    pub fn accepts_source(format: PixelFormat) -> bool {
        matches!(
            format,
            PixelFormat::Yuyv
                | PixelFormat::Uyvy
                | PixelFormat::Nv12
                | PixelFormat::Yuv420
                | PixelFormat::Rgb24
                | PixelFormat::Bgr24
                | PixelFormat::Rgba32
                | PixelFormat::Grey
        )
    }
}

impl Scaler for Converter {
    fn scale(&mut self, picture: &Picture<'_>, arena: &mut FrameArena) -> io::Result<()> {
        let picture = picture
            .as_packed()
            .ok_or_else(|| io_other("converter only accepts packed pictures"))?;
        if picture.format != self.source {
            return Err(io_other(format!(
                "converter configured for {} but got {}",
                self.source, picture.format
            )));
        }
        check_source_len(picture)?;

        let width = picture.width as usize;
        let target = self.target;
        let out = arena.prepare(target, picture.width, picture.height)?;
        let bpp = out.len() / (width * picture.height as usize);
        for (y, row) in out.chunks_exact_mut(width * bpp).enumerate() {
            for (x, px) in row.chunks_exact_mut(bpp).enumerate() {
                let (r, g, b) = sample(picture, x, y);
                match target {
                    PixelFormat::Rgb24 => px.copy_from_slice(&[r, g, b]),
                    PixelFormat::Bgr24 => px.copy_from_slice(&[b, g, r]),
                    PixelFormat::Rgba32 => px.copy_from_slice(&[r, g, b, u8::MAX]),
                    _ => px[0] = luma(r, g, b),
                }
            }
        }
        Ok(())
    }
}

fn check_source_len(picture: &PackedPicture<'_>) -> io::Result<()> {
    let expected = picture
        .format
        .frame_len(picture.width, picture.height, picture.stride)
        .ok_or_else(|| {
            io_other(format!(
                "{} picture {}x{} with stride {} is malformed",
                picture.format, picture.width, picture.height, picture.stride
            ))
        })?;
    if picture.data.len() < expected {
        return Err(io_other(format!(
            "{} frame length mismatch: expected {}, got {}",
            picture.format,
            expected,
            picture.data.len()
        )));
    }
    Ok(())
}

/// RGB of pixel (x, y). Bounds were checked by `check_source_len`.
fn sample(picture: &PackedPicture<'_>, x: usize, y: usize) -> (u8, u8, u8) {
    let data = picture.data;
    let stride = picture.stride;
    let row = y * stride;
    match picture.format {
        PixelFormat::Yuyv => {
            let base = row + (x / 2) * 4;
            yuv_to_rgb(data[base + (x % 2) * 2], data[base + 1], data[base + 3])
        }
        PixelFormat::Uyvy => {
            let base = row + (x / 2) * 4;
            yuv_to_rgb(data[base + 1 + (x % 2) * 2], data[base], data[base + 2])
        }
        PixelFormat::Nv12 => {
            let uv = stride * picture.height as usize + (y / 2) * stride + (x / 2) * 2;
            yuv_to_rgb(data[row + x], data[uv], data[uv + 1])
        }
        PixelFormat::Yuv420 => {
            let h = picture.height as usize;
            let chroma_stride = stride.div_ceil(2);
            let u_plane = stride * h;
            let v_plane = u_plane + chroma_stride * h.div_ceil(2);
            let offset = (y / 2) * chroma_stride + x / 2;
            yuv_to_rgb(data[row + x], data[u_plane + offset], data[v_plane + offset])
        }
        PixelFormat::Rgb24 => {
            let i = row + x * 3;
            (data[i], data[i + 1], data[i + 2])
        }
        PixelFormat::Bgr24 => {
            let i = row + x * 3;
            (data[i + 2], data[i + 1], data[i])
        }
        PixelFormat::Rgba32 => {
            let i = row + x * 4;
            (data[i], data[i + 1], data[i + 2])
        }
        _ => {
            let v = data[row + x];
            (v, v, v)
        }
    }
}

fn yuv_to_rgb(y: u8, u: u8, v: u8) -> (u8, u8, u8) {
    let y = y as f32;
    let u = u as f32 - 128.0;
    let v = v as f32 - 128.0;

    let r = y + 1.402_f32 * v;
    let g = y - 0.344_136_f32 * u - 0.714_136_f32 * v;
    let b = y + 1.772_f32 * u;

    (clamp_to_u8(r), clamp_to_u8(g), clamp_to_u8(b))
}

fn luma(r: u8, g: u8, b: u8) -> u8 {
    clamp_to_u8(0.299 * r as f32 + 0.587 * g as f32 + 0.114 * b as f32)
}

fn clamp_to_u8(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    fn convert(
        source: PixelFormat,
        target: PixelFormat,
        width: u32,
        height: u32,
        stride: usize,
        data: &[u8],
    ) -> io::Result<Vec<u8>> {
        let mut converter = Converter::new(&ConversionRequest {
            source,
            target,
            width,
            height,
        })?;
        let mut arena = FrameArena::default();
        let picture = Picture::Packed(PackedPicture {
            format: source,
            width,
            height,
            stride,
            data,
        });
        converter.scale(&picture, &mut arena)?;
        let frame = arena.view(1).ok_or_else(|| io_other("arena not sized"))?;
        Ok(frame.data.to_vec())
    }

    #[test]
    fn nv12_conversion_produces_gray() -> anyhow::Result<()> {
        let y_plane = vec![128u8; 4];
        let uv_plane = vec![128u8; 2];
        let nv12 = [y_plane, uv_plane].concat();

        let rgb = convert(PixelFormat::Nv12, PixelFormat::Rgb24, 2, 2, 2, &nv12)?;
        assert_eq!(rgb, vec![128u8; 12]);
        Ok(())
    }

    #[test]
    fn yuyv_pairs_share_chroma() -> anyhow::Result<()> {
        // Y0=81 U=90 Y1=81 V=240 is roughly pure red in BT.601.
        let yuyv = [81u8, 90, 81, 240];
        let rgb = convert(PixelFormat::Yuyv, PixelFormat::Rgb24, 2, 1, 4, &yuyv)?;
        assert_eq!(rgb[..3], rgb[3..]);
        assert!(rgb[0] > 230 && rgb[1] < 30 && rgb[2] < 30, "{rgb:?}");
        Ok(())
    }

    #[test]
    fn uyvy_matches_yuyv() -> anyhow::Result<()> {
        let yuyv = [40u8, 200, 220, 60];
        let uyvy = [200u8, 40, 60, 220];
        assert_eq!(
            convert(PixelFormat::Yuyv, PixelFormat::Bgr24, 2, 1, 4, &yuyv)?,
            convert(PixelFormat::Uyvy, PixelFormat::Bgr24, 2, 1, 4, &uyvy)?
        );
        Ok(())
    }

    #[test]
    fn rgb_targets_reorder_and_fill_alpha() -> anyhow::Result<()> {
        let rgb = [10u8, 20, 30];
        assert_eq!(
            convert(PixelFormat::Rgb24, PixelFormat::Bgr24, 1, 1, 3, &rgb)?,
            vec![30, 20, 10]
        );
        assert_eq!(
            convert(PixelFormat::Rgb24, PixelFormat::Rgba32, 1, 1, 3, &rgb)?,
            vec![10, 20, 30, 255]
        );
        assert_eq!(convert(PixelFormat::Grey, PixelFormat::Rgb24, 1, 1, 1, &[7])?, vec![7, 7, 7]);
        Ok(())
    }

    #[test]
    fn padded_rows_are_skipped() -> anyhow::Result<()> {
        // 1x2 RGB with two bytes of row padding.
        let padded = [1u8, 2, 3, 0, 0, 4, 5, 6];
        let rgb = convert(PixelFormat::Rgb24, PixelFormat::Rgb24, 1, 2, 5, &padded)?;
        assert_eq!(rgb, vec![1, 2, 3, 4, 5, 6]);
        Ok(())
    }

    #[test]
    fn odd_width_yuyv_converts_the_tight_layout() -> anyhow::Result<()> {
        let layout = PixelFormat::Yuyv
            .layout(3, 1)
            .ok_or_else(|| anyhow::anyhow!("no layout"))?;
        let yuyv = vec![128u8; layout.size];
        let rgb = convert(PixelFormat::Yuyv, PixelFormat::Rgb24, 3, 1, layout.stride, &yuyv)?;
        assert_eq!(rgb, vec![128u8; 9]);
        Ok(())
    }

    #[test]
    fn short_frames_are_rejected() {
        let err = convert(PixelFormat::Yuv420, PixelFormat::Rgb24, 4, 4, 4, &[0u8; 20])
            .expect_err("truncated I420");
        assert!(err.to_string().contains("length mismatch"));
    }

    #[test]
    fn unsupported_pairs_are_rejected() {
        let request = |source, target| ConversionRequest {
            source,
            target,
            width: 4,
            height: 4,
        };
        assert!(Converter::new(&request(PixelFormat::H264, PixelFormat::Rgb24)).is_err());
        assert!(Converter::new(&request(PixelFormat::Yuyv, PixelFormat::Nv12)).is_err());
    }
}
