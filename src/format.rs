//! Format negotiation.
//!
//! This module owns the single canonical mapping between the device-agnostic
//! [`PixelFormat`] and the driver's four-character codes, the exact rational
//! [`FrameRate`], and the [`FormatNegotiator`] that turns a [`CaptureConfig`]
//! into driver settings and interprets what the driver actually applied.
//!
//! Driver codes that are not in the table map to [`PixelFormat::Unknown`]; they
//! never panic and never produce an out-of-range value.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::config::CaptureConfig;
use crate::device::DeviceSession;
use crate::error::{io_other, CaptureError, CaptureResult, FormatSetting};

/// Driver-native four-character pixel format code (little-endian packed).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FourCc(u32);

impl FourCc {
    pub const fn new(repr: &[u8; 4]) -> Self {
        FourCc(u32::from_le_bytes(*repr))
    }

    pub const fn from_code(code: u32) -> Self {
        FourCc(code)
    }

    pub const fn code(self) -> u32 {
        self.0
    }

    pub const fn repr(self) -> [u8; 4] {
        self.0.to_le_bytes()
    }
}

impl fmt::Display for FourCc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.repr() {
            let ch = if byte.is_ascii_graphic() || byte == b' ' {
                byte as char
            } else {
                '.'
            };
            write!(f, "{ch}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for FourCc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FourCc({self})")
    }
}

macro_rules! pixel_formats {
    ($( $variant:ident => ($fourcc:literal, $name:literal), )*) => {
        /// Device-agnostic pixel format code.
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
        pub enum PixelFormat {
            $( $variant, )*
            /// Driver code with no entry in the table.
            Unknown,
        }

        impl PixelFormat {
            /// Every known format, in table order. `Unknown` is not included.
            pub const ALL: &'static [PixelFormat] = &[$( PixelFormat::$variant, )*];

            /// Driver code for this format; `None` only for `Unknown`.
            pub fn fourcc(self) -> Option<FourCc> {
                match self {
                    $( PixelFormat::$variant => Some(FourCc::new($fourcc)), )*
                    PixelFormat::Unknown => None,
                }
            }

            /// Canonical lowercase name used in config files and logs.
            pub fn name(self) -> &'static str {
                match self {
                    $( PixelFormat::$variant => $name, )*
                    PixelFormat::Unknown => "unknown",
                }
            }

            pub fn from_fourcc(code: FourCc) -> Self {
                $(
                    if code == FourCc::new($fourcc) {
                        return PixelFormat::$variant;
                    }
                )*
                PixelFormat::Unknown
            }
        }
    };
}

pixel_formats! {
    // RGB
    Rgb332 => (b"RGB1", "rgb332"),
    Argb444 => (b"AR12", "argb444"),
    Xrgb444 => (b"XR12", "xrgb444"),
    Rgb555 => (b"RGBO", "rgb555"),
    Rgb565 => (b"RGBP", "rgb565"),
    Rgb565X => (b"RGBR", "rgb565x"),
    Bgr666 => (b"BGRH", "bgr666"),
    Bgr24 => (b"BGR3", "bgr24"),
    Rgb24 => (b"RGB3", "rgb24"),
    Bgr32 => (b"BGR4", "bgr32"),
    Abgr32 => (b"AR24", "abgr32"),
    Xbgr32 => (b"XR24", "xbgr32"),
    Bgra32 => (b"RA24", "bgra32"),
    Bgrx32 => (b"RX24", "bgrx32"),
    Rgb32 => (b"RGB4", "rgb32"),
    Rgba32 => (b"AB24", "rgba32"),
    Rgbx32 => (b"XB24", "rgbx32"),
    Argb32 => (b"BA24", "argb32"),
    Xrgb32 => (b"BX24", "xrgb32"),
    // Grey
    Grey => (b"GREY", "grey"),
    Y4 => (b"Y04 ", "y4"),
    Y6 => (b"Y06 ", "y6"),
    Y10 => (b"Y10 ", "y10"),
    Y12 => (b"Y12 ", "y12"),
    Y16 => (b"Y16 ", "y16"),
    Y10BPack => (b"Y10B", "y10bpack"),
    Y10P => (b"Y10P", "y10p"),
    Pal8 => (b"PAL8", "pal8"),
    Uv8 => (b"UV8 ", "uv8"),
    // Packed luma + chroma
    Yuyv => (b"YUYV", "yuyv"),
    Yyuv => (b"YYUV", "yyuv"),
    Yvyu => (b"YVYU", "yvyu"),
    Uyvy => (b"UYVY", "uyvy"),
    Vyuy => (b"VYUY", "vyuy"),
    Y41P => (b"Y41P", "y41p"),
    Yuv444 => (b"Y444", "yuv444"),
    Yuv555 => (b"YUVO", "yuv555"),
    Yuv565 => (b"YUVP", "yuv565"),
    Yuv24 => (b"YUV3", "yuv24"),
    Yuv32 => (b"YUV4", "yuv32"),
    Ayuv32 => (b"AYUV", "ayuv32"),
    Xyuv32 => (b"XYUV", "xyuv32"),
    Vuya32 => (b"VUYA", "vuya32"),
    Vuyx32 => (b"VUYX", "vuyx32"),
    M420 => (b"M420", "m420"),
    // Two planes, contiguous
    Nv12 => (b"NV12", "nv12"),
    Nv21 => (b"NV21", "nv21"),
    Nv16 => (b"NV16", "nv16"),
    Nv61 => (b"NV61", "nv61"),
    Nv24 => (b"NV24", "nv24"),
    Nv42 => (b"NV42", "nv42"),
    P010 => (b"P010", "p010"),
    // Two planes, non contiguous
    Nv12M => (b"NM12", "nv12m"),
    Nv21M => (b"NM21", "nv21m"),
    Nv16M => (b"NM16", "nv16m"),
    Nv61M => (b"NM61", "nv61m"),
    Nv12Mt => (b"TM12", "nv12mt"),
    Nv12Mt16x16 => (b"VM12", "nv12mt_16x16"),
    // Three planes, contiguous
    Yuv410 => (b"YUV9", "yuv410"),
    Yvu410 => (b"YVU9", "yvu410"),
    Yuv411P => (b"411P", "yuv411p"),
    Yuv420 => (b"YU12", "yuv420"),
    Yvu420 => (b"YV12", "yvu420"),
    Yuv422P => (b"422P", "yuv422p"),
    // Three planes, non contiguous
    Yuv420M => (b"YM12", "yuv420m"),
    Yvu420M => (b"YM21", "yvu420m"),
    Yuv422M => (b"YM16", "yuv422m"),
    Yvu422M => (b"YM61", "yvu422m"),
    Yuv444M => (b"YM24", "yuv444m"),
    Yvu444M => (b"YM42", "yvu444m"),
    // Bayer
    Sbggr8 => (b"BA81", "sbggr8"),
    Sgbrg8 => (b"GBRG", "sgbrg8"),
    Sgrbg8 => (b"GRBG", "sgrbg8"),
    Srggb8 => (b"RGGB", "srggb8"),
    Sbggr10 => (b"BG10", "sbggr10"),
    Sgbrg10 => (b"GB10", "sgbrg10"),
    Sgrbg10 => (b"BA10", "sgrbg10"),
    Srggb10 => (b"RG10", "srggb10"),
    Sbggr10P => (b"pBAA", "sbggr10p"),
    Sgbrg10P => (b"pGAA", "sgbrg10p"),
    Sgrbg10P => (b"pgAA", "sgrbg10p"),
    Srggb10P => (b"pRAA", "srggb10p"),
    Sbggr12 => (b"BG12", "sbggr12"),
    Sgbrg12 => (b"GB12", "sgbrg12"),
    Sgrbg12 => (b"BA12", "sgrbg12"),
    Srggb12 => (b"RG12", "srggb12"),
    Sbggr16 => (b"BYR2", "sbggr16"),
    Sgbrg16 => (b"GB16", "sgbrg16"),
    Sgrbg16 => (b"GR16", "sgrbg16"),
    Srggb16 => (b"RG16", "srggb16"),
    // Compressed
    Mjpeg => (b"MJPG", "mjpeg"),
    Jpeg => (b"JPEG", "jpeg"),
    Dv => (b"dvsd", "dv"),
    Mpeg => (b"MPEG", "mpeg"),
    H264 => (b"H264", "h264"),
    H264NoSc => (b"AVC1", "h264_no_sc"),
    H264Mvc => (b"M264", "h264_mvc"),
    H263 => (b"H263", "h263"),
    Mpeg1 => (b"MPG1", "mpeg1"),
    Mpeg2 => (b"MPG2", "mpeg2"),
    Mpeg4 => (b"MPG4", "mpeg4"),
    Xvid => (b"XVID", "xvid"),
    Vc1AnnexG => (b"VC1G", "vc1_annex_g"),
    Vc1AnnexL => (b"VC1L", "vc1_annex_l"),
    Vp8 => (b"VP80", "vp8"),
    Vp9 => (b"VP90", "vp9"),
    Hevc => (b"HEVC", "hevc"),
    Fwht => (b"FWHT", "fwht"),
    // Vendor specific
    Cpia1 => (b"CPIA", "cpia1"),
    Wnva => (b"WNVA", "wnva"),
    Sn9c10x => (b"S910", "sn9c10x"),
    Sn9c20xI420 => (b"S920", "sn9c20x_i420"),
    Pwc1 => (b"PWC1", "pwc1"),
    Pwc2 => (b"PWC2", "pwc2"),
    Et61x251 => (b"E625", "et61x251"),
    Spca501 => (b"S501", "spca501"),
    Spca505 => (b"S505", "spca505"),
    Spca508 => (b"S508", "spca508"),
    Spca561 => (b"S561", "spca561"),
    Pac207 => (b"P207", "pac207"),
    Mr97310a => (b"M310", "mr97310a"),
    Jl2005bcd => (b"JL20", "jl2005bcd"),
    Sn9c2028 => (b"SONX", "sn9c2028"),
    Sq905c => (b"905C", "sq905c"),
    Pjpg => (b"PJPG", "pjpg"),
    Ov511 => (b"O511", "ov511"),
    Ov518 => (b"O518", "ov518"),
    Stv0680 => (b"S680", "stv0680"),
    Tm6000 => (b"TM60", "tm6000"),
    CitYyvyuy => (b"CITV", "cit_yyvyuy"),
    Konica420 => (b"KONI", "konica420"),
    Jpgl => (b"JPGL", "jpgl"),
    Se401 => (b"S401", "se401"),
    S5cUyvyJpg => (b"S5CI", "s5c_uyvy_jpg"),
    Y8I => (b"Y8I ", "y8i"),
    Y12I => (b"Y12I", "y12i"),
    Z16 => (b"Z16 ", "z16"),
    Mt21c => (b"MT21", "mt21c"),
    Inzi => (b"INZI", "inzi"),
    Cnf4 => (b"CNF4", "cnf4"),
    Hi240 => (b"HI24", "hi240"),
}

/// Byte layout of one single-planar raw frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameLayout {
    /// Bytes per row of the first (or only) plane.
    pub stride: usize,
    /// Total bytes of one frame, all planes included.
    pub size: usize,
}

impl PixelFormat {
    /// True for entropy-coded formats whose frame size is not a function of the dimensions.
    pub fn is_compressed(self) -> bool {
        matches!(
            self,
            PixelFormat::Mjpeg
                | PixelFormat::Jpeg
                | PixelFormat::Dv
                | PixelFormat::Mpeg
                | PixelFormat::H264
                | PixelFormat::H264NoSc
                | PixelFormat::H264Mvc
                | PixelFormat::H263
                | PixelFormat::Mpeg1
                | PixelFormat::Mpeg2
                | PixelFormat::Mpeg4
                | PixelFormat::Xvid
                | PixelFormat::Vc1AnnexG
                | PixelFormat::Vc1AnnexL
                | PixelFormat::Vp8
                | PixelFormat::Vp9
                | PixelFormat::Hevc
                | PixelFormat::Fwht
                | PixelFormat::Pjpg
                | PixelFormat::Jpgl
                | PixelFormat::S5cUyvyJpg
        )
    }

    /// Bytes of one unpadded row (luma row for planar formats).
    ///
    /// Packed 4:2:2 formats carry whole macropixels, so odd widths round up.
    pub fn row_bytes(self, width: u32) -> Option<usize> {
        let w = width as usize;
        match self {
            PixelFormat::Yuyv | PixelFormat::Uyvy => w.div_ceil(2).checked_mul(4),
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => w.checked_mul(3),
            PixelFormat::Rgba32 => w.checked_mul(4),
            PixelFormat::Grey | PixelFormat::Nv12 | PixelFormat::Yuv420 => Some(w),
            _ => None,
        }
    }

    /// Smallest buffer holding a frame whose rows start `stride` bytes apart.
    ///
    /// Chroma planes follow the luma plane with the same stride (NV12) or half
    /// of it (YU12). `None` when `stride` is shorter than a row.
    pub fn frame_len(self, width: u32, height: u32, stride: usize) -> Option<usize> {
        let w = width as usize;
        let h = height as usize;
        let row = self.row_bytes(width)?;
        if w == 0 || h == 0 || stride < row {
            return None;
        }
        let luma = stride.checked_mul(h)?;
        match self {
            PixelFormat::Nv12 => {
                let chroma_rows = stride.checked_mul(h.div_ceil(2) - 1)?;
                luma.checked_add(chroma_rows)?.checked_add(w.div_ceil(2) * 2)
            }
            PixelFormat::Yuv420 => {
                let planes = stride.div_ceil(2).checked_mul(h.div_ceil(2))?.checked_mul(2)?;
                luma.checked_add(planes)
            }
            _ => stride.checked_mul(h - 1)?.checked_add(row),
        }
    }

    /// Layout of a tightly packed frame, for the raw formats the built-in converter handles.
    pub fn layout(self, width: u32, height: u32) -> Option<FrameLayout> {
        let stride = self.row_bytes(width)?;
        let h = height as usize;
        let size = match self {
            PixelFormat::Nv12 | PixelFormat::Yuv420 => {
                let chroma = (width as usize)
                    .div_ceil(2)
                    .checked_mul(h.div_ceil(2))?
                    .checked_mul(2)?;
                stride.checked_mul(h)?.checked_add(chroma)?
            }
            _ => stride.checked_mul(h)?,
        };
        Some(FrameLayout { stride, size })
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PixelFormat {
    type Err = String;

    /// Accepts a canonical name (`yuyv`, case-insensitive) or an exact four-character code (`YUYV`).
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if let Some(format) = PixelFormat::ALL
            .iter()
            .copied()
            .find(|format| format.name().eq_ignore_ascii_case(trimmed))
        {
            return Ok(format);
        }
        // Codes shorter than four characters are space padded, e.g. "Y16 ".
        let bytes = value.as_bytes();
        if (1..=4).contains(&bytes.len()) {
            let mut repr = [b' '; 4];
            repr[..bytes.len()].copy_from_slice(bytes);
            let format = PixelFormat::from_fourcc(FourCc::new(&repr));
            if format != PixelFormat::Unknown {
                return Ok(format);
            }
        }
        Err(format!("unknown pixel format '{value}'"))
    }
}

/// An exact fraction as exchanged with the driver.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Fraction {
    pub numerator: u32,
    pub denominator: u32,
}

impl Fraction {
    pub const fn new(numerator: u32, denominator: u32) -> Self {
        Self {
            numerator,
            denominator,
        }
    }
}

/// Frames per second as an exact rational (`30000/1001`, never `29.97`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameRate {
    numerator: u32,
    denominator: u32,
}

impl FrameRate {
    pub const THIRTY: FrameRate = FrameRate {
        numerator: 30,
        denominator: 1,
    };

    pub fn new(numerator: u32, denominator: u32) -> CaptureResult<Self> {
        if numerator == 0 || denominator == 0 {
            return Err(CaptureError::InvalidConfig(format!(
                "frame rate {numerator}/{denominator} must have non-zero terms"
            )));
        }
        Ok(Self {
            numerator,
            denominator,
        })
    }

    pub const fn per_second(fps: u32) -> Option<Self> {
        if fps == 0 {
            return None;
        }
        Some(Self {
            numerator: fps,
            denominator: 1,
        })
    }

    pub fn numerator(self) -> u32 {
        self.numerator
    }

    pub fn denominator(self) -> u32 {
        self.denominator
    }

    /// Time per frame, which is what the driver is configured with.
    pub fn frame_interval(self) -> Fraction {
        Fraction::new(self.denominator, self.numerator)
    }

    /// Inverse of [`FrameRate::frame_interval`]; `None` when either term is zero.
    pub fn from_interval(interval: Fraction) -> Option<Self> {
        if interval.numerator == 0 || interval.denominator == 0 {
            return None;
        }
        Some(Self {
            numerator: interval.denominator,
            denominator: interval.numerator,
        })
    }

    /// Same rate regardless of how the fraction is scaled (`60/2 == 30/1`).
    pub fn same_rate(self, other: FrameRate) -> bool {
        u64::from(self.numerator) * u64::from(other.denominator)
            == u64::from(other.numerator) * u64::from(self.denominator)
    }

    pub fn frame_duration(self) -> Duration {
        let nanos = u128::from(self.denominator) * 1_000_000_000 / u128::from(self.numerator);
        Duration::from_nanos(nanos.min(u128::from(u64::MAX)) as u64)
    }
}

impl fmt::Display for FrameRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.numerator, self.denominator)
    }
}

impl FromStr for FrameRate {
    type Err = String;

    /// Accepts `"30"` or `"30000/1001"`.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let (num, den) = match value.trim().split_once('/') {
            Some((num, den)) => (num.trim(), den.trim()),
            None => (value.trim(), "1"),
        };
        let numerator: u32 = num
            .parse()
            .map_err(|_| format!("invalid frame rate numerator in '{value}'"))?;
        let denominator: u32 = den
            .parse()
            .map_err(|_| format!("invalid frame rate denominator in '{value}'"))?;
        FrameRate::new(numerator, denominator).map_err(|err| err.to_string())
    }
}

/// Format as spoken to (and answered by) the driver.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DriverFormat {
    pub width: u32,
    pub height: u32,
    pub fourcc: FourCc,
    /// Filled by the driver; zero in requests.
    pub bytes_per_line: u32,
    /// Filled by the driver; zero in requests.
    pub size_image: u32,
}

/// Device-agnostic result of a successful negotiation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NegotiatedFormat {
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    pub bytes_per_line: u32,
    pub size_image: u32,
    pub frame_rate: FrameRate,
}

/// Translates a capture request into driver settings and interprets the driver's answer.
#[derive(Clone, Debug)]
pub struct FormatNegotiator {
    width: u32,
    height: u32,
    capture_format: PixelFormat,
    frame_rate: FrameRate,
}

impl FormatNegotiator {
    pub fn new(config: &CaptureConfig) -> Self {
        Self {
            width: config.width,
            height: config.height,
            capture_format: config.capture_format,
            frame_rate: config.frame_rate,
        }
    }

    /// The format request handed to the driver.
    pub fn driver_request(&self) -> CaptureResult<DriverFormat> {
        let fourcc = self.capture_format.fourcc().ok_or_else(|| {
            CaptureError::InvalidConfig("capture format has no driver code".to_string())
        })?;
        Ok(DriverFormat {
            width: self.width,
            height: self.height,
            fourcc,
            bytes_per_line: 0,
            size_image: 0,
        })
    }

    /// Apply format and frame interval to the device and validate what it granted.
    pub fn negotiate(&self, device: &mut DeviceSession) -> CaptureResult<NegotiatedFormat> {
        let request = self.driver_request()?;
        let (applied, interval) = device.negotiate(&request, self.frame_rate.frame_interval())?;
        self.interpret(&applied, interval)
    }

    /// Map the driver's applied settings back to device-agnostic terms.
    ///
    /// A substituted pixel format or resolution is a rejection: the decoder and
    /// scaler were configured for the request. An adjusted frame interval is not.
    pub fn interpret(
        &self,
        applied: &DriverFormat,
        interval: Fraction,
    ) -> CaptureResult<NegotiatedFormat> {
        let pixel_format = PixelFormat::from_fourcc(applied.fourcc);
        if pixel_format != self.capture_format {
            return Err(CaptureError::FormatRejected {
                setting: FormatSetting::PixelFormat,
                source: io_other(format!(
                    "requested {} but driver applied {} ({})",
                    self.capture_format, pixel_format, applied.fourcc
                )),
            });
        }
        if applied.width != self.width || applied.height != self.height {
            return Err(CaptureError::FormatRejected {
                setting: FormatSetting::PixelFormat,
                source: io_other(format!(
                    "requested {}x{} but driver applied {}x{}",
                    self.width, self.height, applied.width, applied.height
                )),
            });
        }

        let frame_rate = match FrameRate::from_interval(interval) {
            Some(rate) => {
                if !rate.same_rate(self.frame_rate) {
                    log::warn!(
                        "FormatNegotiator: requested {} fps, driver applied {} fps",
                        self.frame_rate,
                        rate
                    );
                }
                rate
            }
            None => {
                log::warn!(
                    "FormatNegotiator: driver reported no frame interval, assuming {} fps",
                    self.frame_rate
                );
                self.frame_rate
            }
        };

        Ok(NegotiatedFormat {
            width: applied.width,
            height: applied.height,
            pixel_format,
            bytes_per_line: applied.bytes_per_line,
            size_image: applied.size_image,
            frame_rate,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn negotiator(format: PixelFormat) -> FormatNegotiator {
        FormatNegotiator {
            width: 640,
            height: 480,
            capture_format: format,
            frame_rate: FrameRate::new(30, 1).expect("rate"),
        }
    }

    #[test]
    fn every_known_format_round_trips_through_its_driver_code() {
        for &format in PixelFormat::ALL {
            let code = format.fourcc().expect("known formats have a code");
            assert_eq!(PixelFormat::from_fourcc(code), format, "{format}");
        }
    }

    #[test]
    fn driver_codes_are_unique() {
        let mut codes: Vec<u32> = PixelFormat::ALL
            .iter()
            .filter_map(|format| format.fourcc())
            .map(FourCc::code)
            .collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), PixelFormat::ALL.len());
    }

    #[test]
    fn unrecognised_driver_codes_map_to_unknown() {
        assert_eq!(PixelFormat::from_fourcc(FourCc::new(b"ZZZZ")), PixelFormat::Unknown);
        assert_eq!(PixelFormat::from_fourcc(FourCc::from_code(0)), PixelFormat::Unknown);
        assert_eq!(PixelFormat::from_fourcc(FourCc::from_code(u32::MAX)), PixelFormat::Unknown);
        assert_eq!(PixelFormat::Unknown.fourcc(), None);
    }

    #[test]
    fn pixel_formats_parse_from_names_and_codes() {
        assert_eq!("yuyv".parse::<PixelFormat>(), Ok(PixelFormat::Yuyv));
        assert_eq!("RGB24".parse::<PixelFormat>(), Ok(PixelFormat::Rgb24));
        assert_eq!("RGB3".parse::<PixelFormat>(), Ok(PixelFormat::Rgb24));
        assert_eq!("MJPG".parse::<PixelFormat>(), Ok(PixelFormat::Mjpeg));
        assert_eq!("Y16".parse::<PixelFormat>(), Ok(PixelFormat::Y16));
        assert!("nope".parse::<PixelFormat>().is_err());
    }

    #[test]
    fn frame_rate_is_kept_exact() -> anyhow::Result<()> {
        let ntsc: FrameRate = "30000/1001".parse().map_err(anyhow::Error::msg)?;
        assert_eq!(ntsc.numerator(), 30000);
        assert_eq!(ntsc.denominator(), 1001);
        assert_eq!(ntsc.frame_interval(), Fraction::new(1001, 30000));
        assert_eq!(FrameRate::from_interval(ntsc.frame_interval()), Some(ntsc));

        let plain: FrameRate = "30".parse().map_err(anyhow::Error::msg)?;
        assert_eq!(plain, FrameRate::new(30, 1)?);
        assert!(plain.same_rate(FrameRate::new(60, 2)?));
        assert!(!plain.same_rate(ntsc));
        assert!("0/1".parse::<FrameRate>().is_err());
        assert!("30/0".parse::<FrameRate>().is_err());
        Ok(())
    }

    #[test]
    fn packed_layouts_match_format_geometry() {
        let yuyv = PixelFormat::Yuyv.layout(640, 480).expect("layout");
        assert_eq!(yuyv, FrameLayout { stride: 1280, size: 640 * 480 * 2 });
        let nv12 = PixelFormat::Nv12.layout(4, 2).expect("layout");
        assert_eq!(nv12.size, 8 + 4);
        assert!(PixelFormat::H264.layout(640, 480).is_none());
    }

    #[test]
    fn odd_width_yuyv_rows_hold_whole_macropixels() {
        let layout = PixelFormat::Yuyv.layout(5, 3).expect("layout");
        assert_eq!(layout.stride, 12);
        assert_eq!(layout.size, 36);
        assert_eq!(PixelFormat::Uyvy.row_bytes(5), Some(12));
        assert_eq!(PixelFormat::Yuyv.frame_len(5, 3, layout.stride), Some(36));
    }

    #[test]
    fn padded_rows_extend_the_frame_length() {
        assert_eq!(PixelFormat::Grey.frame_len(4, 2, 8), Some(12));
        assert_eq!(PixelFormat::Rgb24.frame_len(2, 2, 8), Some(14));
        assert_eq!(PixelFormat::Nv12.frame_len(4, 2, 8), Some(16 + 4));
        assert_eq!(PixelFormat::Yuv420.frame_len(4, 2, 8), Some(16 + 8));
        assert_eq!(PixelFormat::Rgb24.frame_len(4, 2, 8), None);
        assert_eq!(PixelFormat::H264.frame_len(4, 2, 8), None);
    }

    #[test]
    fn substituted_format_is_rejected() {
        let applied = DriverFormat {
            width: 640,
            height: 480,
            fourcc: FourCc::new(b"YUYV"),
            bytes_per_line: 1280,
            size_image: 614_400,
        };
        let err = negotiator(PixelFormat::H264)
            .interpret(&applied, Fraction::new(1, 30))
            .expect_err("format substitution");
        assert!(matches!(
            err,
            CaptureError::FormatRejected {
                setting: FormatSetting::PixelFormat,
                ..
            }
        ));
    }

    #[test]
    fn adjusted_interval_is_reported_not_rejected() -> anyhow::Result<()> {
        let applied = DriverFormat {
            width: 640,
            height: 480,
            fourcc: FourCc::new(b"YUYV"),
            bytes_per_line: 1280,
            size_image: 614_400,
        };
        let negotiated = negotiator(PixelFormat::Yuyv).interpret(&applied, Fraction::new(1, 15))?;
        assert_eq!(negotiated.frame_rate, FrameRate::new(15, 1)?);
        assert_eq!(negotiated.pixel_format, PixelFormat::Yuyv);
        Ok(())
    }
}
