//! Device session: the kernel side of the capture pipeline.
//!
//! `DeviceSession` owns the driver handle and the buffer ring and enforces the
//! ownership handoff protocol on top of whatever [`VideoDriver`] backs it:
//! - a buffer may only be enqueued while the process owns it
//! - a dequeued index must name a buffer the driver owns
//! - frame bytes are only readable while the process owns the buffer
//!
//! Drivers:
//! - `stub://...` paths open the in-memory synthetic driver (testing, demos)
//! - anything else opens a V4L2 device node (feature: capture-v4l2)
//!
//! The session MUST NOT:
//! - Size the ring from the requested count (only the granted count)
//! - Touch an index outside the ring
//! - Retry a failed driver call

use std::io;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::error::{io_other, CaptureError, CaptureResult, FormatSetting};
use crate::format::{DriverFormat, Fraction};

pub mod synthetic;
#[cfg(feature = "capture-v4l2")]
pub mod v4l2;

pub use synthetic::SyntheticDriver;
#[cfg(feature = "capture-v4l2")]
pub use v4l2::V4l2Driver;

/// Kernel-facing operations of a capture device.
///
/// Implementations perform exactly one driver request per call and never retry.
/// Ownership bookkeeping lives in [`DeviceSession`], not here.
pub trait VideoDriver {
    /// Apply a capture format; returns the format the driver actually set.
    fn apply_format(&mut self, request: &DriverFormat) -> io::Result<DriverFormat>;

    /// Apply a time-per-frame interval; returns the interval the driver actually set.
    fn apply_frame_interval(&mut self, interval: Fraction) -> io::Result<Fraction>;

    /// Ask for `count` memory-mapped buffers; returns how many were granted.
    /// A count of zero releases every driver-side allocation.
    fn request_buffers(&mut self, count: u32) -> io::Result<u32>;

    /// Map buffer `index` into the process; returns its length in bytes.
    fn map_buffer(&mut self, index: u32) -> io::Result<usize>;

    fn unmap_buffer(&mut self, index: u32) -> io::Result<()>;

    /// Mapped bytes of buffer `index`, if mapped.
    fn buffer(&self, index: u32) -> Option<&[u8]>;

    fn queue_buffer(&mut self, index: u32) -> io::Result<()>;

    /// Block until the driver has filled a queued buffer.
    ///
    /// Fails with `ErrorKind::Interrupted` once the driver's waker has fired.
    fn dequeue_buffer(&mut self) -> io::Result<Dequeued>;

    fn stream_on(&mut self) -> io::Result<()>;

    fn stream_off(&mut self) -> io::Result<()>;

    /// Handle that ends a blocked `dequeue_buffer` from another thread.
    fn waker(&self) -> Option<Arc<dyn DequeueWaker>> {
        None
    }
}

/// Ends a blocked dequeue. Once woken, every later blocking wait returns at once.
pub trait DequeueWaker: Send + Sync {
    fn wake(&self);
}

/// Latching wake flag for drivers that block in-process.
#[derive(Clone, Debug, Default)]
pub struct WakeSignal {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl WakeSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_woken(&self) -> bool {
        *self.inner.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sleep up to `timeout`; true when woken instead.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (lock, condvar) = &*self.inner;
        let deadline = Instant::now() + timeout;
        let mut woken = lock.lock().unwrap_or_else(PoisonError::into_inner);
        while !*woken {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            woken = condvar
                .wait_timeout(woken, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }
}

impl DequeueWaker for WakeSignal {
    fn wake(&self) {
        let (lock, condvar) = &*self.inner;
        *lock.lock().unwrap_or_else(PoisonError::into_inner) = true;
        condvar.notify_all();
    }
}

/// A buffer the driver just handed back.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Dequeued {
    pub index: u32,
    pub bytes_used: usize,
}

/// Which side of the handoff currently owns a buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Ownership {
    Kernel,
    App,
}

/// One slot of the ring. The mapped memory itself stays with the driver.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MappedBuffer {
    pub index: u32,
    pub length: usize,
    pub owner: Ownership,
    mapped: bool,
}

impl MappedBuffer {
    pub fn is_mapped(&self) -> bool {
        self.mapped
    }
}

/// Fixed-size ring sized to the driver's grant.
#[derive(Clone, Debug, Default)]
pub struct BufferRing {
    buffers: Vec<MappedBuffer>,
}

impl BufferRing {
    fn with_granted(granted: u32) -> Self {
        Self {
            buffers: (0..granted)
                .map(|index| MappedBuffer {
                    index,
                    length: 0,
                    owner: Ownership::App,
                    mapped: false,
                })
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn get(&self, index: u32) -> Option<&MappedBuffer> {
        self.buffers.get(index as usize)
    }

    pub fn iter(&self) -> impl Iterator<Item = &MappedBuffer> {
        self.buffers.iter()
    }

    pub fn owned_by(&self, owner: Ownership) -> usize {
        self.buffers.iter().filter(|buf| buf.owner == owner).count()
    }

    fn get_mut(&mut self, index: u32) -> Option<&mut MappedBuffer> {
        self.buffers.get_mut(index as usize)
    }
}

/// Open device handle plus its buffer ring.
pub struct DeviceSession {
    path: String,
    driver: Option<Box<dyn VideoDriver>>,
    ring: BufferRing,
    buffers_requested: bool,
    streaming: bool,
}

impl DeviceSession {
    /// Open the driver that serves `path`.
    pub fn open(path: &str) -> CaptureResult<Self> {
        let driver = open_driver(path).map_err(|source| CaptureError::Open {
            path: path.to_string(),
            source,
        })?;
        Ok(Self::with_driver(path, driver))
    }

    /// Wrap an already opened driver.
    pub fn with_driver(path: &str, driver: Box<dyn VideoDriver>) -> Self {
        log::info!("DeviceSession: opened {}", path);
        Self {
            path: path.to_string(),
            driver: Some(driver),
            ring: BufferRing::default(),
            buffers_requested: false,
            streaming: false,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn is_open(&self) -> bool {
        self.driver.is_some()
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    pub fn ring(&self) -> &BufferRing {
        &self.ring
    }

    /// Waker for a dequeue blocked on this device; `None` once closed or when
    /// the driver cannot be interrupted.
    pub fn waker(&self) -> Option<Arc<dyn DequeueWaker>> {
        self.driver.as_ref()?.waker()
    }

    /// Apply capture format then frame interval; returns what the driver applied.
    pub fn negotiate(
        &mut self,
        format: &DriverFormat,
        interval: Fraction,
    ) -> CaptureResult<(DriverFormat, Fraction)> {
        let driver = self.driver.as_mut().ok_or_else(|| CaptureError::FormatRejected {
            setting: FormatSetting::PixelFormat,
            source: closed_error(),
        })?;
        let applied = driver
            .apply_format(format)
            .map_err(|source| CaptureError::FormatRejected {
                setting: FormatSetting::PixelFormat,
                source,
            })?;
        let applied_interval =
            driver
                .apply_frame_interval(interval)
                .map_err(|source| CaptureError::FormatRejected {
                    setting: FormatSetting::FrameInterval,
                    source,
                })?;
        log::info!(
            "DeviceSession: {} applied {}x{} {} ({} bytes/line, interval {}/{})",
            self.path,
            applied.width,
            applied.height,
            applied.fourcc,
            applied.bytes_per_line,
            applied_interval.numerator,
            applied_interval.denominator
        );
        Ok((applied, applied_interval))
    }

    /// Request `count` mmap buffers and size the ring to the grant.
    pub fn request_buffers(&mut self, count: u32) -> CaptureResult<u32> {
        if self.buffers_requested {
            return Err(CaptureError::BufferRequest {
                requested: count,
                source: io_other("buffers already requested; release them first"),
            });
        }
        let driver = self.driver.as_mut().ok_or_else(|| CaptureError::BufferRequest {
            requested: count,
            source: closed_error(),
        })?;
        let granted = driver
            .request_buffers(count)
            .map_err(|source| CaptureError::BufferRequest {
                requested: count,
                source,
            })?;
        if granted == 0 {
            return Err(CaptureError::BufferRequest {
                requested: count,
                source: io_other("driver granted no buffers"),
            });
        }
        self.buffers_requested = true;
        self.ring = BufferRing::with_granted(granted);
        if granted < count {
            log::warn!(
                "DeviceSession: requested {} buffers on {}, driver granted {}",
                count,
                self.path,
                granted
            );
        } else {
            log::info!("DeviceSession: {} buffer(s) granted on {}", granted, self.path);
        }
        Ok(granted)
    }

    pub fn map_buffer(&mut self, index: u32) -> CaptureResult<()> {
        let slot = self.ring.get_mut(index).ok_or_else(|| CaptureError::Map {
            index,
            source: out_of_range(index),
        })?;
        if slot.mapped {
            return Err(CaptureError::Map {
                index,
                source: io_other("buffer is already mapped"),
            });
        }
        let driver = self.driver.as_mut().ok_or_else(|| CaptureError::Map {
            index,
            source: closed_error(),
        })?;
        let length = driver
            .map_buffer(index)
            .map_err(|source| CaptureError::Map { index, source })?;
        slot.length = length;
        slot.mapped = true;
        log::debug!("DeviceSession: mapped buffer {} ({} bytes)", index, length);
        Ok(())
    }

    /// Unmap one buffer. Unknown or already unmapped indices are ignored.
    pub fn unmap_buffer(&mut self, index: u32) {
        let Some(slot) = self.ring.get_mut(index) else {
            return;
        };
        if !slot.mapped {
            return;
        }
        slot.mapped = false;
        if let Some(driver) = self.driver.as_mut() {
            if let Err(err) = driver.unmap_buffer(index) {
                log::warn!("DeviceSession: failed to unmap buffer {}: {}", index, err);
            }
        }
        log::debug!("DeviceSession: unmapped buffer {}", index);
    }

    /// Zero-count request that frees driver-side allocations. Idempotent.
    pub fn release_buffers(&mut self) {
        if !self.buffers_requested {
            return;
        }
        for index in 0..self.ring.len() as u32 {
            self.unmap_buffer(index);
        }
        self.buffers_requested = false;
        self.ring = BufferRing::default();
        if let Some(driver) = self.driver.as_mut() {
            if let Err(err) = driver.request_buffers(0) {
                log::warn!(
                    "DeviceSession: failed to release buffers on {}: {}",
                    self.path,
                    err
                );
            }
        }
        log::debug!("DeviceSession: released buffer request on {}", self.path);
    }

    /// Hand an app-owned buffer to the driver.
    pub fn enqueue(&mut self, index: u32) -> CaptureResult<()> {
        let slot = self.ring.get_mut(index).ok_or_else(|| CaptureError::Enqueue {
            index,
            source: out_of_range(index),
        })?;
        if !slot.mapped {
            return Err(CaptureError::Enqueue {
                index,
                source: io_other("buffer is not mapped"),
            });
        }
        if slot.owner != Ownership::App {
            return Err(CaptureError::Enqueue {
                index,
                source: io_other("buffer is already owned by the driver"),
            });
        }
        let driver = self.driver.as_mut().ok_or_else(|| CaptureError::Enqueue {
            index,
            source: closed_error(),
        })?;
        driver
            .queue_buffer(index)
            .map_err(|source| CaptureError::Enqueue { index, source })?;
        slot.owner = Ownership::Kernel;
        Ok(())
    }

    pub fn stream_on(&mut self) -> CaptureResult<()> {
        if self.streaming {
            return Ok(());
        }
        let driver = self
            .driver
            .as_mut()
            .ok_or_else(|| CaptureError::Dequeue { source: closed_error() })?;
        driver
            .stream_on()
            .map_err(|source| CaptureError::Dequeue { source })?;
        self.streaming = true;
        log::info!("DeviceSession: streaming on {}", self.path);
        Ok(())
    }

    /// Stop the capture engine. The driver returns every queued buffer to the process.
    pub fn stream_off(&mut self) -> CaptureResult<()> {
        if !self.streaming {
            return Ok(());
        }
        self.streaming = false;
        for slot in &mut self.ring.buffers {
            slot.owner = Ownership::App;
        }
        if let Some(driver) = self.driver.as_mut() {
            driver
                .stream_off()
                .map_err(|source| CaptureError::Dequeue { source })?;
        }
        log::info!("DeviceSession: streaming off on {}", self.path);
        Ok(())
    }

    /// Block until the driver fills a buffer; the buffer becomes app-owned.
    pub fn dequeue(&mut self) -> CaptureResult<Dequeued> {
        if !self.streaming {
            return Err(CaptureError::Dequeue {
                source: io_other("stream is not on"),
            });
        }
        let driver = self
            .driver
            .as_mut()
            .ok_or_else(|| CaptureError::Dequeue { source: closed_error() })?;
        let dequeued = driver
            .dequeue_buffer()
            .map_err(|source| CaptureError::Dequeue { source })?;
        let slot = self
            .ring
            .get_mut(dequeued.index)
            .ok_or_else(|| CaptureError::Dequeue {
                source: out_of_range(dequeued.index),
            })?;
        if slot.owner != Ownership::Kernel {
            return Err(CaptureError::Dequeue {
                source: io_other(format!(
                    "driver returned buffer {} which was never enqueued",
                    dequeued.index
                )),
            });
        }
        if dequeued.bytes_used > slot.length {
            return Err(CaptureError::Dequeue {
                source: io_other(format!(
                    "driver reported {} bytes used in a {} byte buffer",
                    dequeued.bytes_used, slot.length
                )),
            });
        }
        slot.owner = Ownership::App;
        Ok(dequeued)
    }

    /// Filled bytes of a dequeued buffer. Only valid while the process owns it.
    pub fn frame_bytes(&self, dequeued: &Dequeued) -> CaptureResult<&[u8]> {
        let slot = self
            .ring
            .get(dequeued.index)
            .ok_or_else(|| CaptureError::Dequeue {
                source: out_of_range(dequeued.index),
            })?;
        if slot.owner != Ownership::App || !slot.mapped {
            return Err(CaptureError::Dequeue {
                source: io_other(format!("buffer {} is not readable", dequeued.index)),
            });
        }
        self.driver
            .as_ref()
            .and_then(|driver| driver.buffer(dequeued.index))
            .and_then(|bytes| bytes.get(..dequeued.bytes_used))
            .ok_or_else(|| CaptureError::Dequeue {
                source: io_other(format!("buffer {} has no mapping", dequeued.index)),
            })
    }

    /// Stream off, unmap, release the buffer request and close the handle.
    ///
    /// Idempotent, and releases only what was acquired.
    pub fn close(&mut self) {
        if self.driver.is_none() {
            return;
        }
        if let Err(err) = self.stream_off() {
            log::warn!("DeviceSession: stream off failed during close: {}", err);
        }
        self.release_buffers();
        self.driver = None;
        log::info!("DeviceSession: closed {}", self.path);
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        self.close();
    }
}

fn open_driver(path: &str) -> io::Result<Box<dyn VideoDriver>> {
    if path.starts_with(synthetic::SCHEME) {
        return Ok(Box::new(SyntheticDriver::open(path)?));
    }
    #[cfg(feature = "capture-v4l2")]
    {
        Ok(Box::new(V4l2Driver::open(path)?))
    }
    #[cfg(not(feature = "capture-v4l2"))]
    {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "device capture requires the capture-v4l2 feature",
        ))
    }
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "device is closed")
}

fn out_of_range(index: u32) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("buffer index {index} is outside the ring"),
    )
}
