#![allow(dead_code)]

use std::cell::RefCell;
use std::io;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use capture_kernel::decode::{
    Codec, CodecKind, Converter, ConversionRequest, PackedPicture, Picture, Pull, Scaler,
};
use capture_kernel::device::{DequeueWaker, Dequeued, VideoDriver, WakeSignal};
use capture_kernel::format::DriverFormat;
use capture_kernel::{Fraction, PixelFormat};

/// Shared, ordered record of every backend call.
#[derive(Clone, Default)]
pub struct Journal(Rc<RefCell<Vec<String>>>);

impl Journal {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.borrow_mut().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.borrow().clone()
    }

    /// Entries starting with any of `prefixes`, in order.
    pub fn filtered(&self, prefixes: &[&str]) -> Vec<String> {
        self.0
            .borrow()
            .iter()
            .filter(|entry| prefixes.iter().any(|prefix| entry.starts_with(prefix)))
            .cloned()
            .collect()
    }

    pub fn position(&self, entry: &str) -> Option<usize> {
        self.0.borrow().iter().position(|e| e == entry)
    }
}

pub type Payload = Box<dyn FnMut(u64) -> Vec<u8>>;

/// Camera double: accepts any format, grants up to `max_buffers`, journals every call.
pub struct FakeCamera {
    journal: Journal,
    max_buffers: u32,
    buffer_len: usize,
    bytes_per_line: u32,
    fail_on: Option<String>,
    stall_after: Option<u64>,
    wake: WakeSignal,
    payload: Payload,
    memory: Vec<Option<Vec<u8>>>,
    queued: Vec<u32>,
    frames: u64,
}

impl FakeCamera {
    pub fn new(journal: Journal) -> Self {
        Self {
            journal,
            max_buffers: 4,
            buffer_len: 64 * 1024,
            bytes_per_line: 0,
            fail_on: None,
            stall_after: None,
            wake: WakeSignal::new(),
            payload: Box::new(|frame| format!("unit {frame}").into_bytes()),
            memory: Vec::new(),
            queued: Vec::new(),
            frames: 0,
        }
    }

    pub fn max_buffers(mut self, max: u32) -> Self {
        self.max_buffers = max;
        self
    }

    /// Make the call journaled as `entry` fail.
    pub fn fail_on(mut self, entry: &str) -> Self {
        self.fail_on = Some(entry.to_string());
        self
    }

    /// Report `bytes_per_line` as the row pitch of the applied format.
    pub fn row_pitch(mut self, bytes_per_line: u32) -> Self {
        self.bytes_per_line = bytes_per_line;
        self
    }

    /// After `frames` dequeues, block in dequeue until woken.
    pub fn stall_after(mut self, frames: u64) -> Self {
        self.stall_after = Some(frames);
        self
    }

    pub fn payload(mut self, payload: impl FnMut(u64) -> Vec<u8> + 'static) -> Self {
        self.payload = Box::new(payload);
        self
    }

    fn record(&self, entry: String) -> io::Result<()> {
        let failed = self.fail_on.as_deref() == Some(entry.as_str());
        self.journal.push(entry.clone());
        if failed {
            return Err(io::Error::new(io::ErrorKind::Other, format!("injected failure: {entry}")));
        }
        Ok(())
    }
}

impl VideoDriver for FakeCamera {
    fn apply_format(&mut self, request: &DriverFormat) -> io::Result<DriverFormat> {
        self.record(format!("format {}", request.fourcc))?;
        Ok(DriverFormat {
            bytes_per_line: self.bytes_per_line,
            size_image: self.buffer_len as u32,
            ..*request
        })
    }

    fn apply_frame_interval(&mut self, interval: Fraction) -> io::Result<Fraction> {
        self.record(format!("interval {}/{}", interval.numerator, interval.denominator))?;
        Ok(interval)
    }

    fn request_buffers(&mut self, count: u32) -> io::Result<u32> {
        self.record(format!("request {count}"))?;
        let granted = count.min(self.max_buffers);
        self.memory = vec![None; granted as usize];
        Ok(granted)
    }

    fn map_buffer(&mut self, index: u32) -> io::Result<usize> {
        self.record(format!("map {index}"))?;
        self.memory[index as usize] = Some(vec![0; self.buffer_len]);
        Ok(self.buffer_len)
    }

    fn unmap_buffer(&mut self, index: u32) -> io::Result<()> {
        self.record(format!("unmap {index}"))?;
        if let Some(slot) = self.memory.get_mut(index as usize) {
            *slot = None;
        }
        Ok(())
    }

    fn buffer(&self, index: u32) -> Option<&[u8]> {
        self.memory.get(index as usize)?.as_deref()
    }

    fn queue_buffer(&mut self, index: u32) -> io::Result<()> {
        self.record(format!("queue {index}"))?;
        self.queued.push(index);
        Ok(())
    }

    fn dequeue_buffer(&mut self) -> io::Result<Dequeued> {
        if self.queued.is_empty() {
            return Err(io::Error::new(io::ErrorKind::WouldBlock, "nothing queued"));
        }
        if self.stall_after.is_some_and(|frames| self.frames >= frames) {
            self.journal.push("dequeue blocked");
            if !self.wake.wait_timeout(Duration::from_secs(10)) {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "never woken"));
            }
            self.journal.push("dequeue woken");
            return Err(io::Error::new(io::ErrorKind::Interrupted, "woken"));
        }
        let index = self.queued.remove(0);
        self.record(format!("dequeue {index}"))?;
        let unit = (self.payload)(self.frames);
        self.frames += 1;
        let memory = self.memory[index as usize]
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "unmapped"))?;
        let len = unit.len().min(memory.len());
        memory[..len].copy_from_slice(&unit[..len]);
        Ok(Dequeued {
            index,
            bytes_used: len,
        })
    }

    fn stream_on(&mut self) -> io::Result<()> {
        self.record("stream on".to_string())
    }

    fn stream_off(&mut self) -> io::Result<()> {
        self.queued.clear();
        self.record("stream off".to_string())
    }

    fn waker(&self) -> Option<Arc<dyn DequeueWaker>> {
        Some(Arc::new(self.wake.clone()) as Arc<dyn DequeueWaker>)
    }
}

impl Drop for FakeCamera {
    fn drop(&mut self) {
        self.journal.push("close");
    }
}

/// Decoder double. `script[n]` is how many frames the n-th unit yields (default 1).
pub struct ScriptedCodec {
    journal: Journal,
    width: u32,
    height: u32,
    script: Vec<usize>,
    sends: usize,
    pending: usize,
    pixels: Vec<u8>,
}

impl ScriptedCodec {
    pub fn new(journal: Journal, script: Vec<usize>) -> Self {
        journal.push("codec init");
        Self {
            journal,
            width: 0,
            height: 0,
            script,
            sends: 0,
            pending: 0,
            pixels: Vec::new(),
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

    fn hint_dimensions(&mut self, width: u32, height: u32) {
        self.width = width;
        self.height = height;
        self.pixels = vec![0; width as usize * height as usize * 3];
    }

    fn send(&mut self, data: &[u8]) -> io::Result<()> {
        self.journal.push(format!("send {}", data.len()));
        self.pending = self.script.get(self.sends).copied().unwrap_or(1);
        self.sends += 1;
        Ok(())
    }

    fn receive(&mut self) -> io::Result<Pull<'_>> {
        if self.pending == 0 {
            return Ok(Pull::Again);
        }
        self.pending -= 1;
        Ok(Pull::Frame(Picture::Packed(PackedPicture {
            format: PixelFormat::Rgb24,
            width: self.width,
            height: self.height,
            stride: self.width as usize * 3,
            data: &self.pixels,
        })))
    }
}

impl Drop for ScriptedCodec {
    fn drop(&mut self) {
        self.journal.push("codec drop");
    }
}

/// Built-in converter that journals its release.
pub struct JournaledScaler {
    inner: Converter,
    journal: Journal,
}

impl JournaledScaler {
    pub fn new(journal: Journal, request: &ConversionRequest) -> io::Result<Self> {
        journal.push("scaler init");
        Ok(Self {
            inner: Converter::new(request)?,
            journal,
        })
    }
}

impl Scaler for JournaledScaler {
    fn scale(
        &mut self,
        picture: &Picture<'_>,
        arena: &mut capture_kernel::decode::FrameArena,
    ) -> io::Result<()> {
        self.inner.scale(picture, arena)
    }
}

impl Drop for JournaledScaler {
    fn drop(&mut self) {
        self.journal.push("scaler drop");
    }
}
