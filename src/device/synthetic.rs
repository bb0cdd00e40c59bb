//! In-memory driver behind `stub://` device paths.
//!
//! Honours the whole handoff protocol (buffer grant, mapping, queue order,
//! stream on/off) without a kernel, so the pipeline can run anywhere.
//!
//! Query parameters:
//! - `frames=N`: report a disconnect after N frames (default: never)
//! - `buffers=K`: grant at most K buffers (default: 4)
//! - `realtime=0|1`: pace frames at the applied frame interval (default: 1)

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use url::Url;

use crate::format::{DriverFormat, FourCc, Fraction, FrameLayout, PixelFormat};

use super::{DequeueWaker, Dequeued, VideoDriver, WakeSignal};

pub const SCHEME: &str = "stub://";

const DEFAULT_MAX_BUFFERS: u32 = 4;
/// Driver default when asked for a format it cannot produce.
const FALLBACK_FORMAT: PixelFormat = PixelFormat::Yuyv;

pub struct SyntheticDriver {
    name: String,
    frame_limit: Option<u64>,
    max_buffers: u32,
    realtime: bool,
    format: Option<ActiveFormat>,
    interval: Fraction,
    memory: Vec<Option<Vec<u8>>>,
    granted: u32,
    queued: VecDeque<u32>,
    streaming: bool,
    frames_produced: u64,
    last_frame_at: Option<Instant>,
    wake: WakeSignal,
}

#[derive(Clone, Copy)]
struct ActiveFormat {
    pixel_format: PixelFormat,
    width: u32,
    height: u32,
    layout: FrameLayout,
}

impl SyntheticDriver {
    pub fn open(path: &str) -> io::Result<Self> {
        let url = Url::parse(path).map_err(|err| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid synthetic device path '{path}': {err}"),
            )
        })?;
        let mut frame_limit = None;
        let mut max_buffers = DEFAULT_MAX_BUFFERS;
        let mut realtime = true;
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "frames" => frame_limit = Some(parse_param(&key, &value)?),
                "buffers" => max_buffers = parse_param(&key, &value)?,
                "realtime" => realtime = value != "0" && value != "false",
                other => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("unknown synthetic device parameter '{other}'"),
                    ))
                }
            }
        }
        let name = url.host_str().unwrap_or("synthetic").to_string();
        log::info!(
            "SyntheticDriver: opened {} (max {} buffers, realtime {})",
            name,
            max_buffers,
            realtime
        );
        Ok(Self {
            name,
            frame_limit,
            max_buffers,
            realtime,
            format: None,
            interval: Fraction::new(1, 30),
            memory: Vec::new(),
            granted: 0,
            queued: VecDeque::new(),
            streaming: false,
            frames_produced: 0,
            last_frame_at: None,
            wake: WakeSignal::new(),
        })
    }

    pub fn frames_produced(&self) -> u64 {
        self.frames_produced
    }

    fn check_index(&self, index: u32) -> io::Result<()> {
        if index < self.granted {
            Ok(())
        } else {
            Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("buffer index {index} out of range"),
            ))
        }
    }

    /// Hold the next frame until one interval after the last; a wake cuts the wait short.
    fn pace(&mut self) -> io::Result<()> {
        if !self.realtime || self.interval.denominator == 0 {
            return Ok(());
        }
        let period = Duration::from_secs(u64::from(self.interval.numerator))
            / self.interval.denominator;
        if let Some(last) = self.last_frame_at {
            let elapsed = last.elapsed();
            if elapsed < period && self.wake.wait_timeout(period - elapsed) {
                return Err(io::Error::new(
                    io::ErrorKind::Interrupted,
                    format!("synthetic device {} woken while waiting for a frame", self.name),
                ));
            }
        }
        self.last_frame_at = Some(Instant::now());
        Ok(())
    }
}

impl VideoDriver for SyntheticDriver {
    fn apply_format(&mut self, request: &DriverFormat) -> io::Result<DriverFormat> {
        if self.granted > 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "format cannot change while buffers are allocated",
            ));
        }
        let requested = PixelFormat::from_fourcc(request.fourcc);
        let pixel_format = if requested.layout(1, 1).is_some() {
            requested
        } else {
            log::debug!(
                "SyntheticDriver: {} cannot produce {}, substituting {}",
                self.name,
                request.fourcc,
                FALLBACK_FORMAT
            );
            FALLBACK_FORMAT
        };
        let width = request.width.max(1);
        let height = request.height.max(1);
        let layout = pixel_format.layout(width, height).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "frame size overflows")
        })?;
        self.format = Some(ActiveFormat {
            pixel_format,
            width,
            height,
            layout,
        });
        Ok(DriverFormat {
            width,
            height,
            fourcc: pixel_format.fourcc().unwrap_or(FourCc::new(b"YUYV")),
            bytes_per_line: layout.stride as u32,
            size_image: layout.size as u32,
        })
    }

    fn apply_frame_interval(&mut self, interval: Fraction) -> io::Result<Fraction> {
        if interval.numerator == 0 || interval.denominator == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "frame interval must be non-zero",
            ));
        }
        self.interval = interval;
        Ok(interval)
    }

    fn request_buffers(&mut self, count: u32) -> io::Result<u32> {
        if self.streaming {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "cannot reallocate buffers while streaming",
            ));
        }
        if count == 0 {
            self.memory.clear();
            self.queued.clear();
            self.granted = 0;
            return Ok(0);
        }
        if self.format.is_none() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "no format applied before requesting buffers",
            ));
        }
        self.granted = count.min(self.max_buffers);
        self.memory = vec![None; self.granted as usize];
        Ok(self.granted)
    }

    fn map_buffer(&mut self, index: u32) -> io::Result<usize> {
        self.check_index(index)?;
        let size = self.format.map(|format| format.layout.size).unwrap_or(0);
        self.memory[index as usize] = Some(vec![0; size]);
        Ok(size)
    }

    fn unmap_buffer(&mut self, index: u32) -> io::Result<()> {
        self.check_index(index)?;
        self.memory[index as usize] = None;
        Ok(())
    }

    fn buffer(&self, index: u32) -> Option<&[u8]> {
        self.memory.get(index as usize)?.as_deref()
    }

    fn queue_buffer(&mut self, index: u32) -> io::Result<()> {
        self.check_index(index)?;
        if self.queued.contains(&index) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("buffer {index} is already queued"),
            ));
        }
        self.queued.push_back(index);
        Ok(())
    }

    fn dequeue_buffer(&mut self) -> io::Result<Dequeued> {
        if !self.streaming {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "stream is off",
            ));
        }
        if self
            .frame_limit
            .is_some_and(|limit| self.frames_produced >= limit)
        {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                format!("synthetic device {} disconnected", self.name),
            ));
        }
        if self.queued.is_empty() {
            return Err(io::Error::new(io::ErrorKind::WouldBlock, "no buffer queued"));
        }
        self.pace()?;
        let index = self.queued.pop_front().ok_or_else(|| {
            io::Error::new(io::ErrorKind::WouldBlock, "no buffer queued")
        })?;
        let format = self
            .format
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no format applied"))?;
        let frame = self.frames_produced;
        let memory = self.memory[index as usize]
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "buffer is not mapped"))?;
        fill_pattern(format, frame, memory);
        self.frames_produced += 1;
        Ok(Dequeued {
            index,
            bytes_used: format.layout.size,
        })
    }

    fn stream_on(&mut self) -> io::Result<()> {
        if self.granted == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "no buffers allocated",
            ));
        }
        self.streaming = true;
        Ok(())
    }

    fn stream_off(&mut self) -> io::Result<()> {
        self.streaming = false;
        self.queued.clear();
        self.last_frame_at = None;
        Ok(())
    }

    fn waker(&self) -> Option<Arc<dyn DequeueWaker>> {
        Some(Arc::new(self.wake.clone()) as Arc<dyn DequeueWaker>)
    }
}

fn parse_param<T: std::str::FromStr>(key: &str, value: &str) -> io::Result<T> {
    value.parse().map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid value '{value}' for synthetic device parameter '{key}'"),
        )
    })
}

/// Diagonal gradient that drifts one step per frame, written in the active layout.
fn fill_pattern(format: ActiveFormat, frame: u64, out: &mut [u8]) {
    let width = format.width as usize;
    let height = format.height as usize;
    let shift = (frame % 256) as usize;
    let luma = |x: usize, y: usize| ((x + y + shift) % 256) as u8;
    let cb = |x: usize| ((x * 2 + shift) % 256) as u8;
    let cr = |y: usize| ((y * 2 + 128) % 256) as u8;

    match format.pixel_format {
        PixelFormat::Yuyv | PixelFormat::Uyvy => {
            let yuyv = format.pixel_format == PixelFormat::Yuyv;
            for (y, row) in out.chunks_exact_mut(format.layout.stride).enumerate() {
                for (pair, px) in row.chunks_exact_mut(4).enumerate() {
                    let x = pair * 2;
                    let (y0, y1, u, v) = (luma(x, y), luma(x + 1, y), cb(x), cr(y));
                    let bytes = if yuyv { [y0, u, y1, v] } else { [u, y0, v, y1] };
                    px.copy_from_slice(&bytes);
                }
            }
        }
        PixelFormat::Rgb24 | PixelFormat::Bgr24 | PixelFormat::Rgba32 | PixelFormat::Grey => {
            let bpp = format.layout.stride / width.max(1);
            for (y, row) in out.chunks_exact_mut(format.layout.stride).enumerate() {
                for (x, px) in row.chunks_exact_mut(bpp).enumerate() {
                    px.fill(luma(x, y));
                    if bpp >= 3 {
                        px[0] = cr(y);
                        px[2] = cb(x);
                    }
                }
            }
        }
        PixelFormat::Nv12 | PixelFormat::Yuv420 => {
            let (luma_plane, chroma) = out.split_at_mut(width * height);
            for (y, row) in luma_plane.chunks_exact_mut(width).enumerate() {
                for (x, px) in row.iter_mut().enumerate() {
                    *px = luma(x, y);
                }
            }
            let cw = width.div_ceil(2);
            let ch = height.div_ceil(2);
            if format.pixel_format == PixelFormat::Nv12 {
                for (y, row) in chroma.chunks_exact_mut(cw * 2).take(ch).enumerate() {
                    for (x, px) in row.chunks_exact_mut(2).enumerate() {
                        px[0] = cb(x * 2);
                        px[1] = cr(y * 2);
                    }
                }
            } else {
                let (u_plane, v_plane) = chroma.split_at_mut(cw * ch);
                for (i, px) in u_plane.iter_mut().enumerate() {
                    *px = cb((i % cw) * 2);
                }
                for (i, px) in v_plane.iter_mut().enumerate() {
                    *px = cr((i / cw) * 2);
                }
            }
        }
        _ => out.fill(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(fourcc: &[u8; 4], width: u32, height: u32) -> DriverFormat {
        DriverFormat {
            width,
            height,
            fourcc: FourCc::new(fourcc),
            bytes_per_line: 0,
            size_image: 0,
        }
    }

    #[test]
    fn query_parameters_shape_the_device() -> anyhow::Result<()> {
        let mut driver = SyntheticDriver::open("stub://bench?frames=2&buffers=3&realtime=0")?;
        driver.apply_format(&request(b"YUYV", 4, 2))?;
        assert_eq!(driver.request_buffers(8)?, 3);
        for index in 0..3 {
            assert_eq!(driver.map_buffer(index)?, 4 * 2 * 2);
        }
        driver.queue_buffer(0)?;
        driver.queue_buffer(1)?;
        driver.queue_buffer(2)?;
        driver.stream_on()?;
        assert_eq!(driver.dequeue_buffer()?.index, 0);
        assert_eq!(driver.dequeue_buffer()?.index, 1);
        let err = driver.dequeue_buffer().expect_err("frame limit reached");
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
        Ok(())
    }

    #[test]
    fn unknown_parameters_are_rejected() {
        assert!(SyntheticDriver::open("stub://bench?fps=30").is_err());
        assert!(SyntheticDriver::open("stub://bench?frames=lots").is_err());
    }

    #[test]
    fn compressed_requests_are_substituted() -> anyhow::Result<()> {
        let mut driver = SyntheticDriver::open("stub://h264")?;
        let applied = driver.apply_format(&request(b"H264", 640, 480))?;
        assert_eq!(applied.fourcc, FourCc::new(b"YUYV"));
        assert_eq!(applied.bytes_per_line, 640 * 2);
        Ok(())
    }

    #[test]
    fn pattern_moves_between_frames() -> anyhow::Result<()> {
        let mut driver = SyntheticDriver::open("stub://nv12?realtime=0")?;
        driver.apply_format(&request(b"NV12", 6, 4))?;
        driver.request_buffers(1)?;
        driver.map_buffer(0)?;
        driver.stream_on()?;

        driver.queue_buffer(0)?;
        driver.dequeue_buffer()?;
        let first = driver.buffer(0).map(<[u8]>::to_vec);
        driver.queue_buffer(0)?;
        driver.dequeue_buffer()?;
        let second = driver.buffer(0).map(<[u8]>::to_vec);

        assert_ne!(first, second);
        assert_eq!(driver.frames_produced(), 2);
        Ok(())
    }
}
