//! captured - capture, decode and count frames from a video device
//!
//! Configuration comes from `CAPTURE_CONFIG` / `CAPTURE_*` environment variables,
//! with command-line flags taking precedence. Ctrl-C stops the capture cleanly,
//! even while waiting on a silent device; a second Ctrl-C exits at once.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::time::{Duration, Instant};

use capture_kernel::{
    CancelToken, CaptureConfig, CaptureSession, DecodedFrame, FrameConsumer, FrameRate,
    FrameStats, PixelFormat,
};

const STATS_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Device path, or stub://name for the synthetic device.
    #[arg(long)]
    device: Option<String>,
    #[arg(long)]
    width: Option<u32>,
    #[arg(long)]
    height: Option<u32>,
    /// Frame rate as "30" or "30000/1001".
    #[arg(long)]
    fps: Option<FrameRate>,
    /// Pixel format delivered to consumers (rgb24, bgr24, rgba32, grey).
    #[arg(long)]
    format: Option<PixelFormat>,
    /// Format requested from the driver (h264, mjpeg, yuyv, ...).
    #[arg(long)]
    input_format: Option<PixelFormat>,
    /// Buffers to request from the driver.
    #[arg(long)]
    buffers: Option<u32>,
    /// Stop after this many delivered frames.
    #[arg(long)]
    max_frames: Option<u64>,
    /// Cancel when no buffer arrives for this long (0 disables).
    #[arg(long)]
    stall_timeout_ms: Option<u64>,
}

impl Args {
    fn apply(&self, cfg: &mut CaptureConfig) {
        if let Some(device) = &self.device {
            cfg.device = device.clone();
        }
        if let Some(width) = self.width {
            cfg.width = width;
        }
        if let Some(height) = self.height {
            cfg.height = height;
        }
        if let Some(fps) = self.fps {
            cfg.frame_rate = fps;
        }
        if let Some(format) = self.format {
            cfg.pixel_format = format;
        }
        if let Some(format) = self.input_format {
            cfg.capture_format = format;
        }
        if let Some(buffers) = self.buffers {
            cfg.buffer_count = buffers;
        }
        if let Some(millis) = self.stall_timeout_ms {
            cfg.stall_timeout = (millis > 0).then(|| Duration::from_millis(millis));
        }
    }
}

/// Counts frames, logs progress and cancels once the frame budget is spent.
struct Runner {
    stats: FrameStats,
    cancel: CancelToken,
    max_frames: Option<u64>,
    last_log: Instant,
}

impl FrameConsumer for Runner {
    fn on_frame(&mut self, frame: &DecodedFrame<'_>) {
        self.stats.on_frame(frame);
        if self.last_log.elapsed() >= STATS_INTERVAL {
            self.last_log = Instant::now();
            log::info!(
                "captured: {} frames ({}x{} {}), {:.1} fps",
                self.stats.frames(),
                frame.width,
                frame.height,
                frame.format,
                self.stats.rate().unwrap_or_default()
            );
        }
        if self
            .max_frames
            .is_some_and(|max| self.stats.frames() >= max)
        {
            self.cancel.cancel();
        }
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut cfg = CaptureConfig::load().context("load capture config")?;
    args.apply(&mut cfg);
    cfg.validate()?;

    let cancel = CancelToken::new();
    let handler_token = cancel.clone();
    ctrlc::set_handler(move || {
        if handler_token.is_cancelled() {
            log::warn!("captured: second interrupt, exiting without cleanup");
            std::process::exit(130);
        }
        log::info!("captured: interrupt received, stopping capture");
        handler_token.cancel();
    })
    .map_err(|err| anyhow!("error setting Ctrl-C handler: {}", err))?;

    log::info!(
        "captured: {} at {}x{} {} fps, {} -> {}",
        cfg.device,
        cfg.width,
        cfg.height,
        cfg.frame_rate,
        cfg.capture_format,
        cfg.pixel_format
    );

    let mut runner = Runner {
        stats: FrameStats::new(),
        cancel: cancel.clone(),
        max_frames: args.max_frames,
        last_log: Instant::now(),
    };
    let mut session = CaptureSession::new(cfg);
    let report = session.start(&mut runner, &cancel)?;

    log::info!(
        "captured: done, {} buffers dequeued ({} bytes), {} frames delivered in {:.1}s{}",
        report.frames_dequeued,
        report.bytes_dequeued,
        report.frames_delivered,
        runner.stats.elapsed().as_secs_f64(),
        if report.stalled { " (stalled)" } else { "" }
    );
    Ok(())
}
