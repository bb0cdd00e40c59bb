use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::decode::{self, CodecKind};
use crate::error::{CaptureError, CaptureResult};
use crate::format::{FrameRate, PixelFormat};

const DEFAULT_DEVICE: &str = "/dev/video0";
const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;
const DEFAULT_BUFFER_COUNT: u32 = 1;
/// Upper bound on the ring size a session will ask for.
pub const MAX_BUFFER_COUNT: u32 = 32;

#[derive(Debug, Deserialize, Default)]
struct CaptureConfigFile {
    device: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    frame_rate: Option<String>,
    pixel_format: Option<String>,
    capture_format: Option<String>,
    buffers: Option<u32>,
    watchdog: Option<WatchdogConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct WatchdogConfigFile {
    stall_timeout_ms: Option<u64>,
}

/// Everything a capture session needs. Immutable once the session starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureConfig {
    /// Device path (e.g. "/dev/video0", or "stub://name" for the synthetic device).
    pub device: String,
    pub width: u32,
    pub height: u32,
    pub frame_rate: FrameRate,
    /// Layout delivered to the consumer.
    pub pixel_format: PixelFormat,
    /// Layout requested from the driver; decoded into `pixel_format`.
    pub capture_format: PixelFormat,
    /// Buffers requested from the driver. The driver may grant fewer.
    pub buffer_count: u32,
    /// Cancel the session when no buffer is dequeued for this long.
    pub stall_timeout: Option<Duration>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device: DEFAULT_DEVICE.to_string(),
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            frame_rate: FrameRate::THIRTY,
            pixel_format: PixelFormat::Rgb24,
            capture_format: PixelFormat::H264,
            buffer_count: DEFAULT_BUFFER_COUNT,
            stall_timeout: None,
        }
    }
}

impl CaptureConfig {
    /// Load from `CAPTURE_CONFIG` (JSON, or TOML by extension), then apply env overrides.
    ///
    /// Call [`CaptureConfig::validate`] before starting a session.
    pub fn load() -> Result<Self> {
        let file_cfg = match std::env::var("CAPTURE_CONFIG").ok().as_deref() {
            Some(path) => Some(read_config_file(Path::new(path))?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        // Decoder availability is checked by `validate` once command-line overrides are in.
        cfg.validate_settings()?;
        Ok(cfg)
    }

    fn from_file(file: CaptureConfigFile) -> Result<Self> {
        let defaults = Self::default();
        let frame_rate = match file.frame_rate.as_deref() {
            Some(raw) => raw.parse().map_err(|e| anyhow!("frame_rate: {}", e))?,
            None => defaults.frame_rate,
        };
        let pixel_format = match file.pixel_format.as_deref() {
            Some(raw) => raw.parse().map_err(|e| anyhow!("pixel_format: {}", e))?,
            None => defaults.pixel_format,
        };
        let capture_format = match file.capture_format.as_deref() {
            Some(raw) => raw.parse().map_err(|e| anyhow!("capture_format: {}", e))?,
            None => defaults.capture_format,
        };
        Ok(Self {
            device: file.device.unwrap_or(defaults.device),
            width: file.width.unwrap_or(defaults.width),
            height: file.height.unwrap_or(defaults.height),
            frame_rate,
            pixel_format,
            capture_format,
            buffer_count: file.buffers.unwrap_or(defaults.buffer_count),
            stall_timeout: file
                .watchdog
                .and_then(|watchdog| watchdog.stall_timeout_ms)
                .map(Duration::from_millis),
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(device) = std::env::var("CAPTURE_DEVICE") {
            if !device.trim().is_empty() {
                self.device = device;
            }
        }
        if let Ok(width) = std::env::var("CAPTURE_WIDTH") {
            self.width = width
                .parse()
                .map_err(|_| anyhow!("CAPTURE_WIDTH must be an integer"))?;
        }
        if let Ok(height) = std::env::var("CAPTURE_HEIGHT") {
            self.height = height
                .parse()
                .map_err(|_| anyhow!("CAPTURE_HEIGHT must be an integer"))?;
        }
        if let Ok(rate) = std::env::var("CAPTURE_FPS") {
            self.frame_rate = rate
                .parse()
                .map_err(|e| anyhow!("CAPTURE_FPS: {}", e))?;
        }
        if let Ok(format) = std::env::var("CAPTURE_PIXEL_FORMAT") {
            self.pixel_format = format
                .parse()
                .map_err(|e| anyhow!("CAPTURE_PIXEL_FORMAT: {}", e))?;
        }
        if let Ok(format) = std::env::var("CAPTURE_INPUT_FORMAT") {
            self.capture_format = format
                .parse()
                .map_err(|e| anyhow!("CAPTURE_INPUT_FORMAT: {}", e))?;
        }
        if let Ok(buffers) = std::env::var("CAPTURE_BUFFERS") {
            self.buffer_count = buffers
                .parse()
                .map_err(|_| anyhow!("CAPTURE_BUFFERS must be an integer"))?;
        }
        if let Ok(timeout) = std::env::var("CAPTURE_STALL_TIMEOUT_MS") {
            let millis: u64 = timeout.parse().map_err(|_| {
                anyhow!("CAPTURE_STALL_TIMEOUT_MS must be an integer number of milliseconds")
            })?;
            self.stall_timeout = (millis > 0).then(|| Duration::from_millis(millis));
        }
        Ok(())
    }

    /// Reject configs no session could run with, including capture formats
    /// whose decoder this build does not include.
    pub fn validate(&self) -> CaptureResult<()> {
        let kind = self.validate_settings()?;
        if !kind.is_built_in() {
            return Err(CaptureError::InvalidConfig(format!(
                "capture format {} needs the {} decoder, which this build does not include \
                 (enable codec-ffmpeg or choose a raw or MJPEG capture format)",
                self.capture_format, kind
            )));
        }
        Ok(())
    }

    /// Checks that hold regardless of the compiled-in decoders; returns the capture codec.
    pub(crate) fn validate_settings(&self) -> CaptureResult<CodecKind> {
        if self.device.trim().is_empty() {
            return Err(CaptureError::InvalidConfig("device path is empty".into()));
        }
        if self.width == 0 || self.height == 0 {
            return Err(CaptureError::InvalidConfig(format!(
                "frame size {}x{} must be non-zero",
                self.width, self.height
            )));
        }
        if self.buffer_count == 0 || self.buffer_count > MAX_BUFFER_COUNT {
            return Err(CaptureError::InvalidConfig(format!(
                "buffer count {} must be within 1..={}",
                self.buffer_count, MAX_BUFFER_COUNT
            )));
        }
        if !decode::is_output_format(self.pixel_format) {
            return Err(CaptureError::InvalidConfig(format!(
                "pixel format {} cannot be produced by the color converter",
                self.pixel_format
            )));
        }
        CodecKind::for_capture_format(self.capture_format).ok_or_else(|| {
            CaptureError::InvalidConfig(format!(
                "capture format {} has no decoder",
                self.capture_format
            ))
        })
    }
}

fn read_config_file(path: &Path) -> Result<CaptureConfigFile> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let is_toml = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}
