//! Kernel V4L2 driver: one ioctl per call, mmap memory only.
//!
//! Format and streaming parameters go through the `v4l` crate's typed API;
//! the buffer handoff (REQBUFS/QUERYBUF/QBUF/DQBUF/STREAMON/STREAMOFF) is
//! issued directly so the session controls every ownership transition.
//!
//! DQBUF waits in `poll(2)` on the device and on a wake pipe, so another
//! thread can end the wait without the device ever producing a frame.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::raw::{c_int, c_void};
use std::ptr::{self, NonNull};
use std::sync::Arc;

use v4l::buffer::Type;
use v4l::device::Handle;
use v4l::memory::Memory;
use v4l::v4l2;
use v4l::v4l2::vidioc;
use v4l::v4l_sys::{v4l2_buffer, v4l2_requestbuffers};
use v4l::video::capture::Parameters;
use v4l::video::Capture;

use crate::format::{DriverFormat, FourCc, Fraction};

use super::{DequeueWaker, Dequeued, VideoDriver};

/// One kernel buffer mapped into the process. Unmapped on drop.
struct MmapRegion {
    ptr: NonNull<u8>,
    len: usize,
}

impl MmapRegion {
    fn as_slice(&self) -> &[u8] {
        // SAFETY: the region is a live shared mapping of `len` bytes until drop.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for MmapRegion {
    fn drop(&mut self) {
        // SAFETY: ptr/len are exactly what mmap returned for this region.
        let result = unsafe { v4l2::munmap(self.ptr.as_ptr() as *mut c_void, self.len) };
        if let Err(err) = result {
            log::warn!("V4l2Driver: munmap of {} bytes failed: {}", self.len, err);
        }
    }
}

/// Self-pipe polled next to the device. Never drained, so a wake latches.
struct WakePipe {
    read: OwnedFd,
    write: OwnedFd,
}

impl WakePipe {
    fn new() -> io::Result<Self> {
        let mut fds: [c_int; 2] = [-1; 2];
        // SAFETY: pipe2 writes two descriptors into a live two-element array.
        if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK) } < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: both descriptors were just created and nothing else owns them.
        let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
        Ok(Self { read, write })
    }
}

impl DequeueWaker for WakePipe {
    fn wake(&self) {
        let byte = 1u8;
        // SAFETY: writes one byte from a live local to a descriptor this pipe owns.
        let written = unsafe {
            libc::write(self.write.as_raw_fd(), &byte as *const u8 as *const c_void, 1)
        };
        if written < 0 {
            let err = io::Error::last_os_error();
            // A full pipe is already readable.
            if err.kind() != io::ErrorKind::WouldBlock {
                log::warn!("V4l2Driver: wake pipe write failed: {}", err);
            }
        }
    }
}

pub struct V4l2Driver {
    path: String,
    device: v4l::Device,
    handle: Arc<Handle>,
    regions: Vec<Option<MmapRegion>>,
    wake: Arc<WakePipe>,
}

impl V4l2Driver {
    pub fn open(path: &str) -> io::Result<Self> {
        let device = v4l::Device::with_path(path)?;
        let handle = device.handle();
        let wake = Arc::new(WakePipe::new()?);
        log::info!("V4l2Driver: opened {}", path);
        Ok(Self {
            path: path.to_string(),
            device,
            handle,
            regions: Vec::new(),
            wake,
        })
    }

    fn fd(&self) -> c_int {
        self.handle.fd()
    }

    fn buffer_request(index: u32) -> v4l2_buffer {
        // SAFETY: v4l2_buffer is a plain C struct; all-zero is a valid value.
        let mut buf: v4l2_buffer = unsafe { std::mem::zeroed() };
        buf.index = index;
        buf.type_ = Type::VideoCapture as u32;
        buf.memory = Memory::Mmap as u32;
        buf
    }

    /// Wait until the device has a filled buffer or the wake pipe fires.
    fn wait_readable(&self) -> io::Result<()> {
        let mut fds = [
            libc::pollfd {
                fd: self.fd(),
                events: libc::POLLIN,
                revents: 0,
            },
            libc::pollfd {
                fd: self.wake.read.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            },
        ];
        loop {
            // SAFETY: `fds` is a live array of two initialised pollfd entries.
            let ready = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, -1) };
            if ready >= 0 {
                break;
            }
            let err = io::Error::last_os_error();
            // Signal delivery (e.g. SIGINT); cancellation itself arrives through the pipe.
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
        if fds[1].revents & libc::POLLIN != 0 {
            return Err(io::Error::new(
                io::ErrorKind::Interrupted,
                format!("dequeue on {} woken before a frame arrived", self.path),
            ));
        }
        Ok(())
    }

    fn stream_ioctl(&mut self, request: vidioc::_IOC_TYPE) -> io::Result<()> {
        let mut typ = Type::VideoCapture as u32;
        // SAFETY: STREAMON/STREAMOFF take a pointer to the buffer type.
        unsafe { v4l2::ioctl(self.fd(), request, &mut typ as *mut _ as *mut c_void) }
    }
}

impl VideoDriver for V4l2Driver {
    fn apply_format(&mut self, request: &DriverFormat) -> io::Result<DriverFormat> {
        let format = v4l::Format::new(
            request.width,
            request.height,
            v4l::FourCC::new(&request.fourcc.repr()),
        );
        let applied = self.device.set_format(&format)?;
        Ok(DriverFormat {
            width: applied.width,
            height: applied.height,
            fourcc: FourCc::new(&applied.fourcc.repr),
            bytes_per_line: applied.stride,
            size_image: applied.size,
        })
    }

    fn apply_frame_interval(&mut self, interval: Fraction) -> io::Result<Fraction> {
        let params = Parameters::new(v4l::Fraction::new(interval.numerator, interval.denominator));
        let applied = self.device.set_params(&params)?;
        Ok(Fraction::new(
            applied.interval.numerator,
            applied.interval.denominator,
        ))
    }

    fn request_buffers(&mut self, count: u32) -> io::Result<u32> {
        if count == 0 {
            self.regions.clear();
        }
        // SAFETY: v4l2_requestbuffers is a plain C struct; all-zero is a valid value.
        let mut req: v4l2_requestbuffers = unsafe { std::mem::zeroed() };
        req.count = count;
        req.type_ = Type::VideoCapture as u32;
        req.memory = Memory::Mmap as u32;
        // SAFETY: REQBUFS reads and writes a v4l2_requestbuffers.
        unsafe {
            v4l2::ioctl(
                self.fd(),
                vidioc::VIDIOC_REQBUFS,
                &mut req as *mut _ as *mut c_void,
            )?;
        }
        if count > 0 {
            self.regions = (0..req.count).map(|_| None).collect();
        }
        Ok(req.count)
    }

    fn map_buffer(&mut self, index: u32) -> io::Result<usize> {
        let mut buf = Self::buffer_request(index);
        // SAFETY: QUERYBUF reads and writes a v4l2_buffer.
        unsafe {
            v4l2::ioctl(
                self.fd(),
                vidioc::VIDIOC_QUERYBUF,
                &mut buf as *mut _ as *mut c_void,
            )?;
        }
        let len = buf.length as usize;
        // SAFETY: offset and length come from QUERYBUF for this fd.
        let ptr = unsafe {
            v4l2::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                self.fd(),
                buf.m.offset as libc::off_t,
            )?
        };
        let ptr = NonNull::new(ptr as *mut u8)
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "mmap returned null"))?;
        let slot = self
            .regions
            .get_mut(index as usize)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "index out of range"))?;
        *slot = Some(MmapRegion { ptr, len });
        Ok(len)
    }

    fn unmap_buffer(&mut self, index: u32) -> io::Result<()> {
        if let Some(slot) = self.regions.get_mut(index as usize) {
            slot.take();
        }
        Ok(())
    }

    fn buffer(&self, index: u32) -> Option<&[u8]> {
        self.regions
            .get(index as usize)?
            .as_ref()
            .map(MmapRegion::as_slice)
    }

    fn queue_buffer(&mut self, index: u32) -> io::Result<()> {
        let mut buf = Self::buffer_request(index);
        // SAFETY: QBUF reads and writes a v4l2_buffer.
        unsafe {
            v4l2::ioctl(
                self.fd(),
                vidioc::VIDIOC_QBUF,
                &mut buf as *mut _ as *mut c_void,
            )
        }
    }

    fn dequeue_buffer(&mut self) -> io::Result<Dequeued> {
        // The handle is non-blocking; wait for a filled buffer first.
        self.wait_readable()?;
        let mut buf = Self::buffer_request(0);
        // SAFETY: DQBUF reads and writes a v4l2_buffer.
        unsafe {
            v4l2::ioctl(
                self.fd(),
                vidioc::VIDIOC_DQBUF,
                &mut buf as *mut _ as *mut c_void,
            )?;
        }
        Ok(Dequeued {
            index: buf.index,
            bytes_used: buf.bytesused as usize,
        })
    }

    fn stream_on(&mut self) -> io::Result<()> {
        self.stream_ioctl(vidioc::VIDIOC_STREAMON)
    }

    fn stream_off(&mut self) -> io::Result<()> {
        self.stream_ioctl(vidioc::VIDIOC_STREAMOFF)
    }

    fn waker(&self) -> Option<Arc<dyn DequeueWaker>> {
        Some(self.wake.clone() as Arc<dyn DequeueWaker>)
    }
}

impl Drop for V4l2Driver {
    fn drop(&mut self) {
        self.regions.clear();
        log::debug!("V4l2Driver: closed {}", self.path);
    }
}
